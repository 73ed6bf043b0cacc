//! Accepts duplex links, runs the first-message authentication handshake and
//! binds each authenticated link to a session.
//!
//! The gateway is transport-agnostic: the HTTP layer hands it an abstract
//! [`Link`] plus an inbound event stream, and tests drive it with in-memory
//! pipes.

use std::{
    collections::HashSet,
    sync::{atomic::{AtomicU64, Ordering}, Arc},
};

use eyre::Result;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::{
    auth,
    bus::{Bus, Link, LinkEvent, Side},
    channel::{Channel, Registry},
    config::Config,
    errors::{self, Error},
    metrics::AUTH_RESULTS,
    protocol::{CloseCode, CloseReason},
};

/// First frame sent by a client. Legacy clients send a bare token string
/// instead; the channel is then taken from the `sfu_channel_uuid` claim.
#[derive(Debug, Deserialize)]
struct Credentials {
    #[serde(rename = "channelUUID")]
    channel_uuid: Option<String>,
    jwt: String,
}

pub struct Gateway {
    registry: Arc<Registry>,
    config: Arc<Config>,
    auth_key: Vec<u8>,
    next_link: AtomicU64,
    pending: Mutex<HashSet<u64>>,
    authenticated: Mutex<HashSet<u64>>,
}

impl Gateway {
    pub fn new(registry: Arc<Registry>, config: Arc<Config>, auth_key: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            config,
            auth_key,
            next_link: AtomicU64::new(0),
            pending: Mutex::new(HashSet::new()),
            authenticated: Mutex::new(HashSet::new()),
        })
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn authenticated_count(&self) -> usize {
        self.authenticated.lock().await.len()
    }

    /// Runs one link from handshake to teardown. Returns when the link is
    /// done; the caller owns the task this runs on.
    #[tracing::instrument(skip_all, fields(remote = %remote))]
    pub async fn handle_link(
        self: &Arc<Self>,
        link: Arc<dyn Link>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        remote: String,
    ) {
        let link_id = self.next_link.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().await.insert(link_id);

        let first = tokio::time::timeout(self.config.timeouts.authentication, events.recv()).await;

        let frame = match first {
            Err(_elapsed) => {
                debug!("authentication deadline elapsed");
                AUTH_RESULTS.with_label_values(&["timeout"]).inc();
                link.close(CloseCode::Timeout).await;
                self.pending.lock().await.remove(&link_id);
                return;
            }
            Ok(Some(LinkEvent::Frame(frame))) => frame,
            Ok(_closed_or_error) => {
                self.pending.lock().await.remove(&link_id);
                return;
            }
        };

        let (channel, session_id, ice_servers) = match self.authenticate(&frame).await {
            Ok(authenticated) => authenticated,
            Err(e) => {
                debug!("handshake refused: {e}");
                AUTH_RESULTS.with_label_values(&["refused"]).inc();
                link.close(errors::close_code_for(&e)).await;
                self.pending.lock().await.remove(&link_id);
                return;
            }
        };

        // the client treats the first frame it receives as the ready signal
        if let Err(e) = link.send(String::new()).await {
            debug!("failed sending ready frame: {e}");
            self.pending.lock().await.remove(&link_id);
            return;
        }

        let bus = Bus::new(
            link.clone(),
            Side::Server,
            self.config.timeouts.batch_delay,
            self.config.timeouts.request,
        );

        let session = match channel.join(&session_id, ice_servers).await {
            Ok(session) => session,
            Err(e) => {
                warn!("join refused: {e}");
                AUTH_RESULTS.with_label_values(&["refused"]).inc();
                link.close(errors::close_code_for(&e)).await;
                self.pending.lock().await.remove(&link_id);
                return;
            }
        };

        AUTH_RESULTS.with_label_values(&["accepted"]).inc();
        {
            self.pending.lock().await.remove(&link_id);
            self.authenticated.lock().await.insert(link_id);
        }

        {
            let session = session.clone();
            let bus = bus.clone();
            tokio::spawn(async move {
                if let Err(e) = session.connect(bus).await {
                    warn!(session = session.id(), "connect failed: {e}");
                }
            });
        }

        // session close -> link close, with the mapped wire code
        {
            let link = link.clone();
            let mut closed = session.closed();
            tokio::spawn(async move {
                // the session may have closed before this task subscribed
                let already = *closed.borrow_and_update();
                let reason = match already {
                    Some(reason) => reason,
                    None => {
                        if closed.changed().await.is_err() {
                            return;
                        }
                        closed.borrow().unwrap_or(CloseReason::Clean)
                    }
                };
                link.close(reason.close_code()).await;
            });
        }

        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Frame(frame) => bus.handle_frame(&frame).await,
                LinkEvent::Error(e) => {
                    debug!("link error: {e}");
                    session.close(CloseReason::WsError, None).await;
                    break;
                }
                LinkEvent::Closed => {
                    session.close(CloseReason::WsClosed, None).await;
                    break;
                }
            }
        }

        // the event stream ending without a Closed event is a closed link too
        session.close(CloseReason::WsClosed, None).await;
        bus.close().await;
        self.authenticated.lock().await.remove(&link_id);
    }

    /// Parses the credential frame, locates the channel, verifies the token
    /// against the channel key (global key otherwise) and extracts the
    /// session binding.
    async fn authenticate(&self, frame: &str) -> Result<(Arc<Channel>, String, Option<Value>)> {
        let (uuid_hint, token) = match serde_json::from_str::<Credentials>(frame) {
            Ok(credentials) => (credentials.channel_uuid, credentials.jwt),
            // bare token, possibly JSON-quoted
            Err(_) => (
                None,
                serde_json::from_str::<String>(frame).unwrap_or_else(|_| frame.to_string()),
            ),
        };

        let (channel, legacy) = match uuid_hint {
            Some(uuid) => (self.registry.lookup(&uuid).await?, false),
            None => {
                // nothing here is trusted until the token verifies below
                let claims = auth::peek_claims(&token)?;
                let uuid = claims
                    .sfu_channel_uuid
                    .ok_or_else(|| Error::Authentication("token names no channel".into()))?;
                (self.registry.lookup(&uuid).await?, true)
            }
        };

        // a channel that carries its own key must be addressed explicitly,
        // otherwise the key would never be exercised
        if legacy && channel.key().is_some() {
            return Err(Error::Authentication("legacy access to keyed channel".into()).into());
        }

        let key = channel.key().unwrap_or(&self.auth_key);
        let claims = auth::verify(&token, key)?;

        let session_id = claims
            .session_id
            .ok_or_else(|| Error::Authentication("missing session_id claim".into()))?;

        Ok((channel, session_id, claims.ice_servers))
    }
}
