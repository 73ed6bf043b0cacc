//! Channels (rooms) and the process-wide registry that owns them.
//!
//! A channel is a registry of sessions pinned to one engine worker for its
//! whole life. Creation is idempotent per issuer; a channel with at most one
//! participant is not a live call and closes after the idle timeout.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use eyre::{eyre, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::{Config, Timeouts},
    errors::Error,
    media::MediaRouter,
    metrics::{ACTIVE_CHANNELS, ACTIVE_SESSIONS, TOTAL_CHANNELS, TOTAL_SESSIONS},
    protocol::{BusMessage, CloseReason, SessionInfo},
    session::{Bitrates, Limits, Session, SessionBuilder, SessionStats},
    worker::{PoolWorker, WorkerPool},
};

#[derive(Clone, Debug, Serialize)]
pub struct ChannelStats {
    pub uuid: Uuid,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "sessionCount")]
    pub session_count: usize,
    pub bitrates: Bitrates,
    #[serde(rename = "camerasOn")]
    pub cameras_on: usize,
    #[serde(rename = "screensOn")]
    pub screens_on: usize,
}

#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct Channel {
    uuid: Uuid,
    created_at: DateTime<Utc>,
    remote_address: String,
    issuer_key: String,
    /// Verification key overriding the global one, when set.
    key: Option<Vec<u8>>,
    /// Absent for data-only channels.
    router: Option<Arc<dyn MediaRouter>>,
    /// The worker this channel is pinned to, kept alive with it.
    worker: Option<Arc<PoolWorker>>,
    size_limit: usize,
    timeouts: Timeouts,
    limits: Limits,
    registry: Weak<Registry>,

    #[builder(default)]
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    #[builder(default)]
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    #[builder(default)]
    monitor: Mutex<Option<JoinHandle<()>>>,
    #[builder(default)]
    closed: AtomicBool,
}

impl Channel {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn issuer_key(&self) -> &str {
        &self.issuer_key
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn router(&self) -> Option<Arc<dyn MediaRouter>> {
        self.router.clone()
    }

    pub fn worker(&self) -> Option<&Arc<PoolWorker>> {
        self.worker.as_ref()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Installs a new session under `session_id`, evicting any prior holder
    /// of the id first.
    #[tracing::instrument(skip_all, fields(channel = %self.uuid, session = session_id))]
    pub async fn join(
        self: &Arc<Self>,
        session_id: &str,
        ice_servers: Option<Value>,
    ) -> Result<Arc<Session>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Authentication("channel is closed".into()).into());
        }

        let replaced = {
            let mut sessions = self.sessions.lock().await;
            if !sessions.contains_key(session_id) && sessions.len() >= self.size_limit {
                return Err(Error::Overcrowded.into());
            }
            sessions.remove(session_id)
        };

        if let Some(prior) = replaced {
            debug!("replacing prior session");
            prior.close(CloseReason::Replaced, None).await;
        }

        let session = Arc::new(
            SessionBuilder::default()
                .id(session_id.to_string())
                .channel(Arc::downgrade(self))
                .timeouts(self.timeouts)
                .limits(self.limits.clone())
                .ice_servers(ice_servers)
                .build()
                .map_err(|e| eyre!("building session: {e}"))?,
        );

        let count = {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(session_id.to_string(), session.clone());
            sessions.len()
        };

        if count > 1 {
            self.disarm_idle().await;
        }

        TOTAL_SESSIONS.inc();
        ACTIVE_SESSIONS.inc();
        debug!("session joined");

        Ok(session)
    }

    /// Close listener: drops the session from the registry, reaps the
    /// consumers peers hold of it, and re-arms the idle timer when the
    /// channel is down to one participant.
    pub async fn session_closed(self: &Arc<Self>, session: &Arc<Session>) {
        let (removed, remaining, peers) = {
            let mut sessions = self.sessions.lock().await;
            let removed = match sessions.get(session.id()) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    sessions.remove(session.id());
                    true
                }
                _ => false,
            };
            let peers: Vec<_> = sessions.values().cloned().collect();
            (removed, peers.len(), peers)
        };

        if removed {
            ACTIVE_SESSIONS.dec();
        }

        for peer in peers {
            peer.remove_consumers_of(session.id()).await;
        }

        if remaining <= 1 && !self.closed.load(Ordering::Acquire) {
            self.arm_idle().await;
        }
    }

    /// Every session except `exclude`.
    pub async fn peers_of(&self, exclude: &str) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id.as_str() != exclude)
            .map(|(_, session)| session.clone())
            .collect()
    }

    /// Fans a message out to every session but the sender, using batched
    /// sends. Bus handles are cloned out of the lock before any I/O.
    pub async fn broadcast_from(&self, sender: &str, message: &BusMessage) {
        let peers = self.peers_of(sender).await;

        for peer in peers {
            let Some(bus) = peer.bus().await else {
                continue;
            };
            if let Err(e) = bus.send(message, true).await {
                debug!(peer = peer.id(), "fan-out failed: {e}");
            }
        }
    }

    pub async fn infos(&self) -> HashMap<String, SessionInfo> {
        let sessions: Vec<_> = {
            self.sessions
                .lock()
                .await
                .values()
                .cloned()
                .collect()
        };

        let mut infos = HashMap::with_capacity(sessions.len());
        for session in sessions {
            infos.insert(session.id().to_string(), session.info().await);
        }
        infos
    }

    /// Force-closes the given sessions with `KICKED`.
    pub async fn kick(&self, session_ids: &[String]) {
        for id in session_ids {
            let session = self.session(id).await;
            if let Some(session) = session {
                session.close(CloseReason::Kicked, None).await;
            }
        }
    }

    pub async fn stats(&self) -> ChannelStats {
        let per_session = self.sessions_stats().await;

        let mut bitrates = Bitrates::default();
        let mut cameras_on = 0;
        let mut screens_on = 0;
        for stats in &per_session {
            bitrates.audio += stats.bitrates.audio;
            bitrates.camera += stats.bitrates.camera;
            bitrates.screen += stats.bitrates.screen;
            bitrates.total += stats.bitrates.total;
            if stats.info.is_camera_on == Some(true) {
                cameras_on += 1;
            }
            if stats.info.is_screen_sharing_on == Some(true) {
                screens_on += 1;
            }
        }

        ChannelStats {
            uuid: self.uuid,
            created_at: self.created_at,
            session_count: per_session.len(),
            bitrates,
            cameras_on,
            screens_on,
        }
    }

    pub async fn sessions_stats(&self) -> Vec<SessionStats> {
        let sessions: Vec<_> = {
            self.sessions
                .lock()
                .await
                .values()
                .cloned()
                .collect()
        };

        let mut stats = Vec::with_capacity(sessions.len());
        for session in sessions {
            stats.push(session.stats().await);
        }
        stats
    }

    /// Terminates every session with `CHANNEL_CLOSED` (no per-session leave
    /// broadcast) and unregisters the channel.
    #[tracing::instrument(skip_all, fields(channel = %self.uuid))]
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.disarm_idle().await;
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.abort();
        }

        let sessions: Vec<_> = {
            self.sessions
                .lock()
                .await
                .drain()
                .map(|(_, session)| session)
                .collect()
        };
        for session in sessions {
            session.close(CloseReason::ChannelClosed, None).await;
            ACTIVE_SESSIONS.dec();
        }

        if let Some(router) = &self.router {
            router.close().await;
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self).await;
        }

        ACTIVE_CHANNELS.dec();
        info!("channel closed");
    }

    pub(crate) fn arm_idle(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let this = Arc::downgrade(self);
            let delay = self.timeouts.channel;

            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;

                let Some(channel) = this.upgrade() else {
                    return;
                };
                debug!(channel = %channel.uuid, "idle close");
                channel.close().await;
            });

            let mut timer = self.idle_timer.lock().await;
            if let Some(prior) = timer.replace(handle) {
                prior.abort();
            }
        })
    }


    async fn disarm_idle(&self) {
        if let Some(handle) = self.idle_timer.lock().await.take() {
            handle.abort();
        }
    }

    pub(crate) async fn set_monitor(&self, handle: JoinHandle<()>) {
        *self.monitor.lock().await = Some(handle);
    }
}

#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    /// Per-channel verification key to install.
    pub key: Option<Vec<u8>>,
    /// `false` builds a data-only channel: no worker, no router, broadcast
    /// still works.
    pub use_webrtc: bool,
}

impl CreateOptions {
    pub fn webrtc() -> Self {
        Self {
            key: None,
            use_webrtc: true,
        }
    }
}

/// Process-wide channel registry, indexed by UUID and by issuer.
pub struct Registry {
    config: Arc<Config>,
    pool: Arc<WorkerPool>,
    // Lock order is by_issuer then by_uuid. by_issuer is held across channel
    // construction so concurrent creates by one issuer stay idempotent.
    by_issuer: Mutex<HashMap<String, Arc<Channel>>>,
    by_uuid: Mutex<HashMap<Uuid, Arc<Channel>>>,
}

impl Registry {
    pub fn new(config: Arc<Config>, pool: Arc<WorkerPool>) -> Arc<Self> {
        Arc::new(Self {
            config,
            pool,
            by_issuer: Mutex::new(HashMap::new()),
            by_uuid: Mutex::new(HashMap::new()),
        })
    }

    /// Idempotent creation: the same `(remote_address, issuer)` pair gets the
    /// same channel for as long as it lives.
    #[tracing::instrument(skip_all, fields(issuer = issuer))]
    pub async fn create(
        self: &Arc<Self>,
        remote_address: &str,
        issuer: &str,
        opts: CreateOptions,
    ) -> Result<Arc<Channel>> {
        let safe_issuer = format!("{remote_address}::{issuer}");

        let mut by_issuer = self.by_issuer.lock().await;
        if let Some(existing) = by_issuer.get(&safe_issuer) {
            return Ok(existing.clone());
        }

        let (worker, router) = if opts.use_webrtc {
            let worker = self.pool.get().await?;
            let router = worker
                .worker
                .create_router(self.config.media_codecs())
                .await
                .map_err(|e| Error::Media(e.to_string()))?;
            (Some(worker), Some(router))
        } else {
            (None, None)
        };

        let channel = Arc::new(
            ChannelBuilder::default()
                .uuid(Uuid::new_v4())
                .created_at(Utc::now())
                .remote_address(remote_address.to_string())
                .issuer_key(safe_issuer.clone())
                .key(opts.key)
                .router(router)
                .worker(worker.clone())
                .size_limit(self.config.channel_size)
                .timeouts(self.config.timeouts)
                .limits(Limits::from_config(&self.config))
                .registry(Arc::downgrade(self))
                .build()
                .map_err(|e| eyre!("building channel: {e}"))?,
        );

        by_issuer.insert(safe_issuer, channel.clone());
        self.by_uuid.lock().await.insert(channel.uuid(), channel.clone());
        drop(by_issuer);

        channel.arm_idle().await;

        if let Some(worker) = worker {
            let weak = Arc::downgrade(&channel);
            let handle = tokio::spawn(async move {
                worker.worker.died().await;

                if let Some(channel) = weak.upgrade() {
                    warn!(channel = %channel.uuid(), "worker died, closing channel");
                    channel.close().await;
                }
            });
            channel.set_monitor(handle).await;
        }

        TOTAL_CHANNELS.inc();
        ACTIVE_CHANNELS.inc();
        info!(channel = %channel.uuid(), "channel created");

        Ok(channel)
    }

    pub async fn get(&self, uuid: &Uuid) -> Option<Arc<Channel>> {
        self.by_uuid.lock().await.get(uuid).cloned()
    }

    /// Resolves a client-supplied channel id. Unknown or malformed ids are an
    /// authentication failure, not a lookup miss.
    pub async fn lookup(&self, uuid: &str) -> Result<Arc<Channel>> {
        let uuid = Uuid::parse_str(uuid)
            .map_err(|_| Error::Authentication("malformed channel uuid".into()))?;

        self.get(&uuid)
            .await
            .ok_or_else(|| Error::Authentication("unknown channel".into()).into())
    }

    pub(crate) async fn remove(&self, channel: &Channel) {
        self.by_issuer.lock().await.remove(channel.issuer_key());
        self.by_uuid.lock().await.remove(&channel.uuid());
    }

    /// Soft reset: close every channel but keep the process serving.
    pub async fn close_all(&self) {
        let channels: Vec<_> = self.by_uuid.lock().await.values().cloned().collect();
        for channel in channels {
            channel.close().await;
        }
    }

    pub async fn stats(&self) -> Vec<ChannelStats> {
        let channels: Vec<_> = self.by_uuid.lock().await.values().cloned().collect();

        let mut stats = Vec::with_capacity(channels.len());
        for channel in channels {
            stats.push(channel.stats().await);
        }
        stats
    }

    /// Forced disconnect: kicks the listed sessions out of each listed
    /// channel, skipping channels created from a different remote address.
    pub async fn disconnect(
        &self,
        remote_address: &str,
        targets: &HashMap<String, Vec<String>>,
    ) -> Result<()> {
        for (uuid, session_ids) in targets {
            let Ok(channel) = self.lookup(uuid).await else {
                debug!(%uuid, "disconnect target does not exist");
                continue;
            };

            if channel.remote_address() != remote_address {
                debug!(%uuid, "disconnect target owned by another address");
                continue;
            }

            channel.kick(session_ids).await;
        }

        Ok(())
    }
}
