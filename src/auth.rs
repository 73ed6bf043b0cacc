//! Signed bearer tokens binding a connection to a channel and session.
//!
//! Tokens are HS256 JWTs. Verification checks the signature (constant-time,
//! inside `jsonwebtoken`), then the temporal claims: expired, not yet valid,
//! or issued in the future. Every failure surfaces as a single
//! `Error::Authentication` with a distinct cause.

use std::collections::HashMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use eyre::Result;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Error;

/// Tolerated forward clock skew on `iat`.
const MAX_ISSUED_AHEAD_SECS: i64 = 60;

/// The claims the control plane recognises. Everything else in a token is
/// carried and ignored.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Legacy binding of a token to its channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sfu_channel_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Opaque pass-through handed to clients in transport configs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_servers: Option<Value>,
    /// Base64 per-channel verification key, installed at channel creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Target sessions for a forced disconnect.
    #[serde(
        default,
        rename = "sessionIdsByChannel",
        skip_serializing_if = "Option::is_none"
    )]
    pub session_ids_by_channel: Option<HashMap<String, Vec<String>>>,
}

/// Signs `claims` with the HS256 key.
pub fn sign(claims: &Claims, key: &[u8]) -> Result<String> {
    if key.is_empty() {
        return Err(Error::Config("signing key is empty".into()).into());
    }

    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(key),
    )
    .map_err(|e| Error::UnsupportedAlgorithm(e.to_string()).into())
}

/// Verifies a token and returns its claims.
#[tracing::instrument(skip_all)]
pub fn verify(token: &str, key: &[u8]) -> Result<Claims> {
    let header = jsonwebtoken::decode_header(token)
        .map_err(|e| Error::Authentication(format!("malformed token: {e}")))?;

    if header.alg != Algorithm::HS256 {
        return Err(Error::Authentication(format!("unsupported algorithm: {:?}", header.alg)).into());
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.validate_exp = true;
    validation.validate_nbf = true;
    validation.set_required_spec_claims::<&str>(&[]);

    let data = decode::<Claims>(token, &DecodingKey::from_secret(key), &validation).map_err(
        |e| {
            use jsonwebtoken::errors::ErrorKind;

            let cause = match e.kind() {
                ErrorKind::ExpiredSignature => "token expired".to_string(),
                ErrorKind::ImmatureSignature => "token not yet valid".to_string(),
                ErrorKind::InvalidSignature => "bad signature".to_string(),
                other => format!("invalid token: {other:?}"),
            };

            Error::Authentication(cause)
        },
    )?;

    if let Some(iat) = data.claims.iat {
        if iat > Utc::now().timestamp() + MAX_ISSUED_AHEAD_SECS {
            return Err(Error::Authentication("token issued in the future".into()).into());
        }
    }

    Ok(data.claims)
}

/// Decodes the claims segment without checking the signature. Only used to
/// locate the channel whose key must verify a legacy token; nothing read here
/// is trusted until `verify` passes.
pub fn peek_claims(token: &str) -> Result<Claims> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Authentication("malformed token".into()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::Authentication(format!("malformed token: {e}")))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Authentication(format!("malformed claims: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"0123456789abcdef";

    fn claims(exp_in: i64) -> Claims {
        Claims {
            exp: Some(Utc::now().timestamp() + exp_in),
            session_id: Some("alice".into()),
            iss: Some("tests".into()),
            ..Claims::default()
        }
    }

    #[test]
    fn roundtrip() {
        let token = sign(&claims(60), KEY).unwrap();
        let verified = verify(&token, KEY).unwrap();

        assert_eq!(verified.session_id.as_deref(), Some("alice"));
        assert_eq!(verified.iss.as_deref(), Some("tests"));
    }

    #[test]
    fn rejects_wrong_key() {
        let token = sign(&claims(60), KEY).unwrap();
        let err = verify(&token, b"other key").unwrap_err();

        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Authentication(_))
        ));
    }

    #[test]
    fn rejects_expired() {
        let token = sign(&claims(-10), KEY).unwrap();
        let err = verify(&token, KEY).unwrap_err();

        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn rejects_not_yet_valid() {
        let mut c = claims(60);
        c.nbf = Some(Utc::now().timestamp() + 30);
        let token = sign(&c, KEY).unwrap();

        let err = verify(&token, KEY).unwrap_err();
        assert!(err.to_string().contains("not yet valid"));
    }

    #[test]
    fn rejects_issued_in_the_future() {
        let mut c = claims(3600);
        c.iat = Some(Utc::now().timestamp() + 600);
        let token = sign(&c, KEY).unwrap();

        let err = verify(&token, KEY).unwrap_err();
        assert!(err.to_string().contains("issued in the future"));
    }

    #[test]
    fn tolerates_iat_within_skew() {
        let mut c = claims(3600);
        c.iat = Some(Utc::now().timestamp() + 30);
        let token = sign(&c, KEY).unwrap();

        assert!(verify(&token, KEY).is_ok());
    }

    #[test]
    fn rejects_garbage() {
        assert!(verify("not-a-token", KEY).is_err());
        assert!(verify("a.b.c", KEY).is_err());
        assert!(verify("", KEY).is_err());
    }

    #[test]
    fn rejects_foreign_algorithm() {
        // An HS384 token must be refused even with the right key.
        let token = encode(
            &Header::new(Algorithm::HS384),
            &claims(60),
            &EncodingKey::from_secret(KEY),
        )
        .unwrap();

        let err = verify(&token, KEY).unwrap_err();
        assert!(err.to_string().contains("unsupported algorithm"));
    }

    #[test]
    fn sign_needs_a_key() {
        let err = sign(&claims(60), b"").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));
    }

    #[test]
    fn peek_reads_claims_without_verifying() {
        let token = sign(&claims(60), KEY).unwrap();
        let peeked = peek_claims(&token).unwrap();

        assert_eq!(peeked.session_id.as_deref(), Some("alice"));

        // peek succeeds even when the signature would not verify
        let forged = {
            let mut parts: Vec<_> = token.split('.').map(String::from).collect();
            parts[2] = "AAAA".into();
            parts.join(".")
        };
        assert!(peek_claims(&forged).is_ok());
        assert!(verify(&forged, KEY).is_err());
    }
}
