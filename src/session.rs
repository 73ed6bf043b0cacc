//! One participant inside one channel.
//!
//! A session owns its two transports, its producer slots, its consumers of
//! every peer, its bus and its timers. The forwarding mesh is maintained
//! lazily: whenever a producer appears or changes, every other session is
//! asked to (re)consume it, and transient failures retry through a per-peer
//! recovery timer.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use derive_builder::Builder;
use eyre::{eyre, Result};
use itertools::Itertools;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, warn};

use crate::{
    bus::{Bus, BusHandler, RequestOptions},
    channel::Channel,
    config::{Config, Timeouts, MAX_SESSION_ERRORS},
    errors::Error,
    media::{Consumer, MediaRouter, Producer, Transport, TransportOptions},
    metrics::SESSION_CLOSES,
    protocol::{
        BroadcastIn, BroadcastOut, BusMessage, CloseReason, ConnectTransport, ConsumptionChange,
        InfoChange, InitConsumer, InitProducer, InitTransports, MessageName, ProductionChange,
        SessionInfo, SessionLeave, StreamType, TransportConfig,
    },
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum_macros::AsRefStr)]
pub enum State {
    #[default]
    New,
    Connecting,
    Connected,
    Closed,
}

/// The per-session slice of the process configuration.
#[derive(Clone, Debug)]
pub struct Limits {
    pub max_bitrate_in: u32,
    pub max_bitrate_out: u32,
    pub max_buf_in: u32,
    pub max_buf_out: u32,
    pub producer_options: Value,
}

impl Limits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_bitrate_in: config.max_bitrate_in,
            max_bitrate_out: config.max_bitrate_out,
            max_buf_in: config.max_buf_in,
            max_buf_out: config.max_buf_out,
            producer_options: config.producer_options_by_kind(),
        }
    }
}

/// Uplink bitrates of one session, split by stream type.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Bitrates {
    pub audio: u64,
    pub camera: u64,
    pub screen: u64,
    pub total: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionStats {
    pub id: String,
    pub info: SessionInfo,
    pub bitrates: Bitrates,
}

#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct Session {
    id: String,
    channel: Weak<Channel>,
    timeouts: Timeouts,
    limits: Limits,
    #[builder(default)]
    ice_servers: Option<Value>,

    #[builder(default)]
    state: Mutex<State>,
    #[builder(default)]
    bus: Mutex<Option<Arc<Bus>>>,
    #[builder(default)]
    capabilities: Mutex<Option<Value>>,
    #[builder(default)]
    cts: Mutex<Option<Arc<dyn Transport>>>,
    #[builder(default)]
    stc: Mutex<Option<Arc<dyn Transport>>>,
    #[builder(default)]
    producers: Mutex<HashMap<StreamType, Arc<dyn Producer>>>,
    #[builder(default)]
    consumers: Mutex<HashMap<String, HashMap<StreamType, Arc<dyn Consumer>>>>,
    #[builder(default)]
    info: Mutex<SessionInfo>,
    #[builder(default)]
    errors: Mutex<Vec<String>>,
    #[builder(default)]
    recovery: Mutex<HashMap<String, JoinHandle<()>>>,
    #[builder(default)]
    connection_deadline: Mutex<Option<JoinHandle<()>>>,
    #[builder(default)]
    ping_task: Mutex<Option<JoinHandle<()>>>,
    #[builder(default = "watch::channel(None).0")]
    closed_tx: watch::Sender<Option<CloseReason>>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn state(&self) -> State {
        *self.state.lock().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == State::Connected
    }

    pub async fn info(&self) -> SessionInfo {
        *self.info.lock().await
    }

    pub async fn bus(&self) -> Option<Arc<Bus>> {
        self.bus.lock().await.clone()
    }

    pub async fn producer(&self, stream_type: StreamType) -> Option<Arc<dyn Producer>> {
        self.producers.lock().await.get(&stream_type).cloned()
    }

    pub async fn consumer(
        &self,
        peer_id: &str,
        stream_type: StreamType,
    ) -> Option<Arc<dyn Consumer>> {
        self.consumers
            .lock()
            .await
            .get(peer_id)
            .and_then(|slots| slots.get(&stream_type))
            .cloned()
    }

    /// Fires once with the close reason; `None` until then.
    pub fn closed(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed_tx.subscribe()
    }

    /// Wires the bus, arms the connection deadline and the ping loop, builds
    /// both transports and exchanges capabilities with the client, then
    /// mounts the forwarding mesh against every present peer.
    #[tracing::instrument(skip_all, fields(session = %self.id))]
    pub async fn connect(self: &Arc<Self>, bus: Arc<Bus>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state != State::New {
                return Err(eyre!("session already started"));
            }
            *state = State::Connecting;
        }

        *self.bus.lock().await = Some(bus.clone());
        bus.set_handler(Arc::new(Dispatcher(self.clone()))).await;

        self.arm_connection_deadline().await;
        self.arm_ping(bus.clone()).await;

        let channel = self
            .channel
            .upgrade()
            .ok_or_else(|| eyre!("channel is gone"))?;

        if let Some(router) = channel.router() {
            if let Err(e) = self.init_transports(&router, &bus).await {
                self.close(CloseReason::Error, Some(e.to_string())).await;
                return Err(e);
            }
        }

        {
            let mut state = self.state.lock().await;
            if *state == State::Closed {
                // closed while the transports were being set up; close()
                // already released them
                return Ok(());
            }
            *state = State::Connected;
        }
        debug!("connected");

        for peer in channel.peers_of(&self.id).await {
            let this = self.clone();
            tokio::spawn(async move {
                this.consume(&peer).await;
                peer.consume(&this).await;
            });
        }

        Ok(())
    }

    async fn init_transports(self: &Arc<Self>, router: &Arc<dyn MediaRouter>, bus: &Arc<Bus>) -> Result<()> {
        let opts = TransportOptions {
            max_incoming_buffer: Some(self.limits.max_buf_in),
            max_outgoing_buffer: Some(self.limits.max_buf_out),
        };

        let (cts, stc) = futures::try_join!(
            router.create_webrtc_transport(opts.clone()),
            router.create_webrtc_transport(opts),
        )
        .map_err(|e| Error::Media(e.to_string()))?;

        // Stash before the capability exchange so a concurrent close releases
        // them; if close already ran, release here instead.
        *self.cts.lock().await = Some(cts.clone());
        *self.stc.lock().await = Some(stc.clone());
        if *self.state.lock().await == State::Closed {
            self.release_transports().await;
            return Err(Error::Media("session closed during transport setup".into()).into());
        }

        let init = InitTransports {
            capabilities: router.capabilities(),
            stc_config: self.transport_config(&stc),
            cts_config: self.transport_config(&cts),
            producer_options_by_kind: self.limits.producer_options.clone(),
        };

        let capabilities = bus
            .request(
                &BusMessage::new(MessageName::InitTransports, &init)?,
                RequestOptions::default(),
            )
            .await?;
        *self.capabilities.lock().await = Some(capabilities);

        cts.set_max_incoming_bitrate(self.limits.max_bitrate_in)
            .await
            .map_err(|e| Error::Media(e.to_string()))?;
        stc.set_max_outgoing_bitrate(self.limits.max_bitrate_out)
            .await
            .map_err(|e| Error::Media(e.to_string()))?;

        Ok(())
    }

    fn transport_config(&self, transport: &Arc<dyn Transport>) -> TransportConfig {
        TransportConfig {
            id: transport.id(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
            sctp_parameters: transport.sctp_parameters(),
            ice_servers: self.ice_servers.clone(),
        }
    }

    /// Mounts (or repairs) this session's consumers of `peer`'s producers.
    /// Idempotent and safe to call concurrently; failures are charged to the
    /// error budget and retried through the per-peer recovery timer.
    #[tracing::instrument(skip_all, fields(session = %self.id, peer = %peer.id))]
    pub async fn consume(self: &Arc<Self>, peer: &Arc<Session>) {
        if Arc::ptr_eq(self, peer) {
            return;
        }
        if !self.is_connected().await || !peer.is_connected().await {
            return;
        }
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let Some(router) = channel.router() else {
            return;
        };
        let Some(stc) = self.stc.lock().await.clone() else {
            return;
        };
        let Some(capabilities) = self.capabilities.lock().await.clone() else {
            return;
        };
        let Some(bus) = self.bus().await else {
            return;
        };

        for stream_type in StreamType::ALL {
            let mounted = self
                .consume_stream(peer, stream_type, &router, &stc, &capabilities, &bus)
                .await;

            if let Err(e) = mounted {
                let dropped = {
                    let mut consumers = self.consumers.lock().await;
                    consumers
                        .get_mut(peer.id())
                        .and_then(|slots| slots.remove(&stream_type))
                };
                if let Some(consumer) = dropped {
                    consumer.close().await;
                }

                warn!(stream = stream_type.as_ref(), "consumer failed: {e}");
                self.register_error(&e).await;

                if peer.is_connected().await {
                    self.arm_recovery(peer).await;
                }
            }
        }
    }

    async fn consume_stream(
        self: &Arc<Self>,
        peer: &Arc<Session>,
        stream_type: StreamType,
        router: &Arc<dyn MediaRouter>,
        stc: &Arc<dyn Transport>,
        capabilities: &Value,
        bus: &Arc<Bus>,
    ) -> Result<()> {
        let Some(producer) = peer.producer(stream_type).await else {
            return Ok(());
        };
        if !router.can_consume(&producer.id(), capabilities) {
            return Ok(());
        }

        let existing = {
            self.consumers
                .lock()
                .await
                .get(peer.id())
                .and_then(|slots| slots.get(&stream_type))
                .cloned()
        };

        let consumer = match existing {
            Some(consumer) => consumer,
            None => {
                let created = stc
                    .consume(&producer.id(), capabilities.clone(), true)
                    .await
                    .map_err(|e| Error::Media(e.to_string()))?;

                let init = InitConsumer {
                    id: created.id(),
                    kind: created.kind(),
                    producer_id: producer.id(),
                    rtp_parameters: created.rtp_parameters(),
                    session_id: peer.id().to_string(),
                    active: !producer.paused(),
                    stream_type,
                };
                let acknowledged = bus
                    .request(
                        &BusMessage::new(MessageName::InitConsumer, &init)?,
                        RequestOptions {
                            batch: true,
                            ..RequestOptions::default()
                        },
                    )
                    .await;
                if let Err(e) = acknowledged {
                    created.close().await;
                    return Err(e);
                }

                // a concurrent call may have won the slot while the request
                // was in flight; the loser closes its consumer
                let winner = {
                    let mut consumers = self.consumers.lock().await;
                    let slots = consumers.entry(peer.id().to_string()).or_default();
                    match slots.get(&stream_type) {
                        Some(winner) => Some(winner.clone()),
                        None => {
                            slots.insert(stream_type, created.clone());
                            None
                        }
                    }
                };

                match winner {
                    Some(winner) => {
                        created.close().await;
                        winner
                    }
                    None => created,
                }
            }
        };

        if producer.paused() != consumer.paused() {
            let result = if producer.paused() {
                consumer.pause().await
            } else {
                consumer.resume().await
            };
            result.map_err(|e| Error::Media(e.to_string()))?;
        }

        Ok(())
    }

    /// Drops every consumer this session holds of `peer_id`'s producers.
    pub async fn remove_consumers_of(&self, peer_id: &str) {
        let slots = self.consumers.lock().await.remove(peer_id);
        if let Some(slots) = slots {
            for consumer in slots.into_values() {
                consumer.close().await;
            }
        }
        if let Some(handle) = self.recovery.lock().await.remove(peer_id) {
            handle.abort();
        }
    }

    /// Asks every other channel member to (re)consume this session.
    async fn update_remote_consumers(self: &Arc<Self>) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };

        for peer in channel.peers_of(&self.id).await {
            let this = self.clone();
            tokio::spawn(async move {
                peer.consume(&this).await;
            });
        }
    }

    async fn arm_recovery(self: &Arc<Self>, peer: &Arc<Session>) {
        let this = Arc::downgrade(self);
        let target = Arc::downgrade(peer);
        let delay = self.timeouts.recovery;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let (Some(session), Some(peer)) = (this.upgrade(), target.upgrade()) else {
                return;
            };
            session.recovery.lock().await.remove(peer.id());
            session.consume(&peer).await;
        });

        let mut recovery = self.recovery.lock().await;
        if let Some(prior) = recovery.insert(peer.id().to_string(), handle) {
            prior.abort();
        }
    }

    async fn arm_connection_deadline(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        let deadline = self.timeouts.session;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;

            let Some(session) = this.upgrade() else {
                return;
            };
            if matches!(session.state().await, State::New | State::Connecting) {
                session.close(CloseReason::ConnectionTimeout, None).await;
            }
        });

        *self.connection_deadline.lock().await = Some(handle);
    }

    async fn arm_ping(self: &Arc<Self>, bus: Arc<Bus>) {
        let this = Arc::downgrade(self);
        let period = self.timeouts.ping;
        let rtt = self.timeouts.session;

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await;

            loop {
                ticks.tick().await;

                let Some(session) = this.upgrade() else {
                    return;
                };
                if session.state().await == State::Closed {
                    return;
                }

                let pong = bus
                    .request(
                        &BusMessage::empty(MessageName::Ping),
                        RequestOptions {
                            timeout: Some(rtt),
                            ..RequestOptions::default()
                        },
                    )
                    .await;

                if pong.is_err() {
                    session.close(CloseReason::PingTimeout, None).await;
                    return;
                }
            }
        });

        *self.ping_task.lock().await = Some(handle);
    }

    async fn register_error(self: &Arc<Self>, report: &eyre::Report) {
        let count = {
            let mut errors = self.errors.lock().await;
            errors.push(report.to_string());
            errors.len()
        };

        if count > MAX_SESSION_ERRORS {
            let cause = self.errors.lock().await.iter().join(", ");
            self.close(CloseReason::Error, Some(cause)).await;
        }
    }

    /// Idempotent teardown: timers, consumers, producers, transports, bus.
    /// Unless the whole channel is going away, peers are told via
    /// `SESSION_LEAVE` before their consumers of this session are reaped.
    #[tracing::instrument(skip(self, cause), fields(session = %self.id, reason = reason.as_ref()))]
    pub async fn close(self: &Arc<Self>, reason: CloseReason, cause: Option<String>) {
        {
            let mut state = self.state.lock().await;
            if *state == State::Closed {
                return;
            }
            *state = State::Closed;
        }

        for (_peer, handle) in self.recovery.lock().await.drain() {
            handle.abort();
        }
        if let Some(handle) = self.connection_deadline.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.ping_task.lock().await.take() {
            handle.abort();
        }

        let consumers: Vec<_> = {
            self.consumers
                .lock()
                .await
                .drain()
                .flat_map(|(_, slots)| slots.into_values())
                .collect()
        };
        for consumer in consumers {
            consumer.close().await;
        }

        let producers: Vec<_> = {
            self.producers
                .lock()
                .await
                .drain()
                .map(|(_, producer)| producer)
                .collect()
        };
        for producer in producers {
            producer.close().await;
        }

        self.release_transports().await;

        match &cause {
            Some(cause) => warn!(%cause, "session closed"),
            None => debug!("session closed"),
        }
        SESSION_CLOSES.with_label_values(&[reason.as_ref()]).inc();

        if reason != CloseReason::ChannelClosed {
            if let Some(channel) = self.channel.upgrade() {
                if let Ok(leave) = BusMessage::new(
                    MessageName::SessionLeave,
                    &SessionLeave {
                        session_id: self.id.clone(),
                    },
                ) {
                    channel.broadcast_from(&self.id, &leave).await;
                }
            }
        }

        if let Some(bus) = self.bus.lock().await.take() {
            bus.close().await;
        }

        if let Some(channel) = self.channel.upgrade() {
            channel.session_closed(self).await;
        }

        let _ignored = self.closed_tx.send(Some(reason));
    }

    async fn release_transports(&self) {
        if let Some(cts) = self.cts.lock().await.take() {
            cts.close().await;
        }
        if let Some(stc) = self.stc.lock().await.take() {
            stc.close().await;
        }
    }

    pub async fn stats(&self) -> SessionStats {
        let producers: Vec<_> = {
            self.producers
                .lock()
                .await
                .iter()
                .map(|(stream_type, producer)| (*stream_type, producer.clone()))
                .collect()
        };

        let mut bitrates = Bitrates::default();
        for (stream_type, producer) in producers {
            let stats = producer.stats().await.unwrap_or_default();
            match stream_type {
                StreamType::Audio => bitrates.audio += stats.bitrate,
                StreamType::Camera => bitrates.camera += stats.bitrate,
                StreamType::Screen => bitrates.screen += stats.bitrate,
            }
        }
        bitrates.total = bitrates.audio + bitrates.camera + bitrates.screen;

        SessionStats {
            id: self.id.clone(),
            info: self.info().await,
            bitrates,
        }
    }

    // ---- inbound traffic ----

    async fn init_producer(self: &Arc<Self>, request: InitProducer) -> Result<Value> {
        let cts = self
            .cts
            .lock()
            .await
            .clone()
            .ok_or_else(|| eyre::Report::new(Error::Media("transports not ready".into())))?;

        if let Some(prior) = self.producers.lock().await.remove(&request.stream_type) {
            prior.close().await;
        }

        let producer = match cts.produce(request.kind, request.rtp_parameters).await {
            Ok(producer) => producer,
            Err(e) => {
                let report = eyre::Report::new(Error::Media(e.to_string()));
                self.register_error(&report).await;
                return Err(report);
            }
        };

        let id = producer.id();
        self.producers
            .lock()
            .await
            .insert(request.stream_type, producer);

        let patch = Self::production_info(request.stream_type, true);
        self.info.lock().await.merge(&patch);

        self.update_remote_consumers().await;
        self.broadcast_info(&self.info().await).await;

        Ok(json!({ "id": id }))
    }

    async fn production_change(self: &Arc<Self>, change: ProductionChange) {
        let patch = Self::production_info(change.stream_type, change.active);
        self.info.lock().await.merge(&patch);

        if let Some(producer) = self.producer(change.stream_type).await {
            let result = if change.active {
                producer.resume().await
            } else {
                producer.pause().await
            };

            if let Err(e) = result {
                let report = eyre::Report::new(Error::Media(e.to_string()));
                self.register_error(&report).await;
            }
        }

        self.update_remote_consumers().await;
        self.broadcast_info(&self.info().await).await;
    }

    fn production_info(stream_type: StreamType, active: bool) -> SessionInfo {
        match stream_type {
            StreamType::Audio => SessionInfo::default(),
            StreamType::Camera => SessionInfo {
                is_camera_on: Some(active),
                ..SessionInfo::default()
            },
            StreamType::Screen => SessionInfo {
                is_screen_sharing_on: Some(active),
                ..SessionInfo::default()
            },
        }
    }

    async fn consumption_change(&self, change: ConsumptionChange) {
        let slots = self.consumers.lock().await.get(&change.session_id).cloned();
        let Some(slots) = slots else {
            return;
        };

        for stream_type in StreamType::ALL {
            let Some(active) = change.states.get(stream_type) else {
                continue;
            };
            let Some(consumer) = slots.get(&stream_type) else {
                continue;
            };

            let result = if active {
                consumer.resume().await
            } else {
                consumer.pause().await
            };
            if let Err(e) = result {
                debug!(stream = stream_type.as_ref(), "consumption change failed: {e}");
            }
        }
    }

    /// Applies an info patch; optionally returns the channel-wide snapshot.
    async fn info_change(self: &Arc<Self>, change: InfoChange) -> Result<Value> {
        let patch = SessionInfo::from_patch(&change.info);
        self.info.lock().await.merge(&patch);

        let refresh = if change.need_refresh {
            let Some(channel) = self.channel.upgrade() else {
                return Err(eyre!("channel is gone"));
            };
            serde_json::to_value(channel.infos().await)?
        } else {
            Value::Null
        };

        self.broadcast_info(&patch).await;

        Ok(refresh)
    }

    async fn broadcast_info(&self, info: &SessionInfo) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };

        let mut by_session = serde_json::Map::new();
        if let Ok(value) = serde_json::to_value(info) {
            by_session.insert(self.id.clone(), value);
        }

        let message = BusMessage {
            name: MessageName::SInfoChange,
            payload: Value::Object(by_session),
        };
        channel.broadcast_from(&self.id, &message).await;
    }

    async fn relay_broadcast(&self, incoming: BroadcastIn) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };

        let outgoing = BroadcastOut {
            sender_id: self.id.clone(),
            message: incoming.payload,
        };
        if let Ok(message) = BusMessage::new(MessageName::Broadcast, &outgoing) {
            channel.broadcast_from(&self.id, &message).await;
        }
    }

    async fn connect_transport(&self, stc: bool, request: ConnectTransport) -> Result<Value> {
        let slot = if stc { &self.stc } else { &self.cts };
        let transport = slot
            .lock()
            .await
            .clone()
            .ok_or_else(|| eyre::Report::new(Error::Media("transport not ready".into())))?;

        transport
            .connect(request.dtls_parameters)
            .await
            .map_err(|e| Error::Media(e.to_string()))?;

        Ok(Value::Null)
    }
}

/// Adapter binding a session to its bus callbacks.
struct Dispatcher(Arc<Session>);

#[async_trait]
impl BusHandler for Dispatcher {
    async fn handle_message(&self, message: BusMessage) {
        let session = &self.0;

        let handled: Result<()> = async {
            match message.name {
                MessageName::Broadcast => {
                    session
                        .relay_broadcast(serde_json::from_value(message.payload)?)
                        .await;
                }
                MessageName::ConsumptionChange => {
                    session
                        .consumption_change(serde_json::from_value(message.payload)?)
                        .await;
                }
                MessageName::InfoChange => {
                    session
                        .info_change(serde_json::from_value(message.payload)?)
                        .await?;
                }
                MessageName::ProductionChange => {
                    session
                        .production_change(serde_json::from_value(message.payload)?)
                        .await;
                }
                other => debug!(name = other.as_ref(), "unexpected message"),
            }
            Ok(())
        }
        .await;

        if let Err(e) = handled {
            debug!(session = session.id(), "dropping message: {e}");
        }
    }

    async fn handle_request(&self, message: BusMessage) -> Result<Value> {
        let session = &self.0;

        match message.name {
            MessageName::InitProducer => {
                session
                    .init_producer(serde_json::from_value(message.payload)?)
                    .await
            }
            MessageName::ConnectCtsTransport => {
                session
                    .connect_transport(false, serde_json::from_value(message.payload)?)
                    .await
            }
            MessageName::ConnectStcTransport => {
                session
                    .connect_transport(true, serde_json::from_value(message.payload)?)
                    .await
            }
            MessageName::InfoChange => {
                session
                    .info_change(serde_json::from_value(message.payload)?)
                    .await
            }
            other => Err(eyre!("unexpected request: {}", other.as_ref())),
        }
    }
}
