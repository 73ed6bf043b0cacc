use thiserror::Error;

use crate::protocol::CloseCode;

/// Error taxonomy for the control plane. Variants ride inside `eyre::Report`s
/// and are recovered with `downcast_ref` at the gateway (link close code) and
/// the HTTP layer (status code).
#[derive(Debug, Error)]
pub enum Error {
    /// Bad token, bad or expired claim, unknown channel, wrong per-channel
    /// key. Every authentication failure is this one kind with a distinct
    /// cause string.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The channel is at capacity.
    #[error("channel is full")]
    Overcrowded,

    /// Missing or malformed startup configuration. Fatal at startup,
    /// otherwise a 500.
    #[error("configuration: {0}")]
    Config(String),

    /// Signing was asked for an algorithm the token layer does not support.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Raised by the media engine. Counts against the owning session's
    /// error budget.
    #[error("media engine: {0}")]
    Media(String),

    /// A bus request hit its deadline before the response arrived.
    #[error("request timed out")]
    RequestTimeout,

    /// The bus closed underneath a pending request.
    #[error("bus closed")]
    BusClosed,
}

impl Error {
    /// Link close code for an error surfaced during the gateway handshake.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Authentication(_) => CloseCode::AuthenticationFailed,
            Self::Overcrowded => CloseCode::ChannelFull,
            _ => CloseCode::Error,
        }
    }
}

/// Maps a report to a handshake close code, falling back to `ERROR` for
/// anything that is not part of the taxonomy.
pub fn close_code_for(report: &eyre::Report) -> CloseCode {
    report
        .downcast_ref::<Error>()
        .map_or(CloseCode::Error, Error::close_code)
}
