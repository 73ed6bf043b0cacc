//! Shared harness for the end-to-end suites: an in-memory media engine, an
//! in-memory link pair and a scripted client peer speaking the wire protocol.

#![allow(dead_code)]

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use eyre::Result;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};

use confab::{
    auth::{self, Claims},
    bus::{Bus, BusHandler, Link, LinkEvent, RequestOptions, Side},
    channel::Registry,
    config::{Config, Timeouts},
    gateway::Gateway,
    media::{
        Consumer, MediaRouter, MediaWorker, Producer, ProducerStats, RtpCodec, Transport,
        TransportOptions, TransportStats, WebRtcServer, WorkerSettings, WorkerSpawner,
    },
    protocol::{BusMessage, CloseCode, InitConsumer, MediaKind, MessageName, Payload},
    worker::WorkerPool,
};

pub const GLOBAL_KEY: &[u8] = b"an integration test key";

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

fn fresh_id(prefix: &str) -> String {
    format!("{prefix}-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

pub fn timeouts() -> Timeouts {
    Timeouts {
        authentication: Duration::from_millis(150),
        session: Duration::from_secs(2),
        ping: Duration::from_secs(60),
        recovery: Duration::from_millis(50),
        channel: Duration::from_secs(60),
        request: Duration::from_millis(500),
        batch_delay: Duration::from_millis(10),
    }
}

pub fn config(timeouts: Timeouts) -> Config {
    use base64::Engine as _;

    Config {
        auth_key: base64::engine::general_purpose::STANDARD.encode(GLOBAL_KEY),
        public_ip: "127.0.0.1".parse().unwrap(),
        http_interface: "127.0.0.1".parse().unwrap(),
        port: 0,
        rtc_interface: "127.0.0.1".parse().unwrap(),
        rtc_min_port: 40000,
        rtc_max_port: 49999,
        num_workers: Some(1),
        audio_codecs: None,
        video_codecs: None,
        max_buf_in: 262_144,
        max_buf_out: 262_144,
        max_bitrate_in: 8_000_000,
        max_bitrate_out: 10_000_000,
        max_video_bitrate: 4_000_000,
        channel_size: 100,
        proxy: false,
        timeouts,
    }
}

/// Everything a scenario needs: registry + gateway wired over a mock engine.
pub struct World {
    pub engine: Arc<MockEngine>,
    pub registry: Arc<Registry>,
    pub gateway: Arc<Gateway>,
    pub config: Arc<Config>,
}

pub async fn world() -> World {
    world_with(timeouts()).await
}

pub async fn world_with(timeouts: Timeouts) -> World {
    world_from(config(timeouts)).await
}

pub async fn world_from(config: Config) -> World {
    let config = Arc::new(config);
    let engine = MockEngine::new();

    let settings = WorkerSettings {
        rtc_interface: config.rtc_interface,
        public_ip: config.public_ip,
        rtc_min_port: config.rtc_min_port,
        rtc_max_port: config.rtc_max_port,
    };
    let pool = WorkerPool::start(engine.clone(), settings, 1).await;

    let registry = Registry::new(config.clone(), pool);
    let gateway = Gateway::new(registry.clone(), config.clone(), GLOBAL_KEY.to_vec());

    World {
        engine,
        registry,
        gateway,
        config,
    }
}

pub fn token(key: &[u8], session_id: &str) -> String {
    let claims = Claims {
        exp: Some(chrono::Utc::now().timestamp() + 300),
        session_id: Some(session_id.to_string()),
        ..Claims::default()
    };
    auth::sign(&claims, key).unwrap()
}

pub fn credentials(channel_uuid: &str, jwt: &str) -> String {
    json!({ "channelUUID": channel_uuid, "jwt": jwt }).to_string()
}

/// Polls `check` until it returns true or the deadline passes.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let poll = async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    if tokio::time::timeout(Duration::from_secs(3), poll).await.is_err() {
        panic!("timed out waiting for {what}");
    }
}

// ---- in-memory link ----

pub struct MemoryLink {
    peer: mpsc::UnboundedSender<LinkEvent>,
    sent_close: Mutex<Option<CloseCode>>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&self, frame: String) -> Result<()> {
        self.peer
            .send(LinkEvent::Frame(frame))
            .map_err(|_| eyre::eyre!("peer went away"))
    }

    async fn close(&self, code: CloseCode) {
        *self.sent_close.lock().await = Some(code);
        let _result = self.peer.send(LinkEvent::Closed);
    }
}

impl MemoryLink {
    pub async fn sent_close(&self) -> Option<CloseCode> {
        *self.sent_close.lock().await
    }

    pub async fn wait_close(&self) -> CloseCode {
        loop {
            if let Some(code) = self.sent_close().await {
                return code;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn link_pair() -> (
    Arc<MemoryLink>,
    mpsc::UnboundedReceiver<LinkEvent>,
    Arc<MemoryLink>,
    mpsc::UnboundedReceiver<LinkEvent>,
) {
    let (to_server, server_events) = mpsc::unbounded_channel();
    let (to_client, client_events) = mpsc::unbounded_channel();

    let server_side = Arc::new(MemoryLink {
        peer: to_client,
        sent_close: Mutex::new(None),
    });
    let client_side = Arc::new(MemoryLink {
        peer: to_server,
        sent_close: Mutex::new(None),
    });

    (server_side, server_events, client_side, client_events)
}

// ---- scripted client peer ----

struct ClientScript {
    capabilities: Value,
    messages: Mutex<Vec<BusMessage>>,
    consumers: Mutex<Vec<InitConsumer>>,
}

#[async_trait]
impl BusHandler for ClientScript {
    async fn handle_message(&self, message: BusMessage) {
        self.messages.lock().await.push(message);
    }

    async fn handle_request(&self, message: BusMessage) -> Result<Value> {
        match message.name {
            MessageName::InitTransports => Ok(self.capabilities.clone()),
            MessageName::InitConsumer => {
                let consumer: InitConsumer = serde_json::from_value(message.payload)?;
                self.consumers.lock().await.push(consumer);
                Ok(json!({}))
            }
            MessageName::Ping => Ok(json!("PONG")),
            other => Err(eyre::eyre!("client cannot answer {}", other.as_ref())),
        }
    }
}

/// A wire-faithful client: its own bus over the client half of a link pair,
/// with the server half driven by the gateway under test.
pub struct TestClient {
    pub bus: Arc<Bus>,
    pub server_link: Arc<MemoryLink>,
    pub client_link: Arc<MemoryLink>,
    script: Arc<ClientScript>,
    was_ready: Arc<AtomicBool>,
}

impl TestClient {
    /// Opens a link through the gateway without sending anything yet.
    pub async fn open(world: &World, remote: &str) -> Self {
        let (server_link, server_events, client_link, mut client_events) = link_pair();

        {
            let gateway = world.gateway.clone();
            let link = server_link.clone();
            let remote = remote.to_string();
            tokio::spawn(async move {
                gateway.handle_link(link, server_events, remote).await;
            });
        }

        let bus = Bus::new(
            client_link.clone(),
            Side::Client,
            Duration::from_millis(10),
            Duration::from_millis(500),
        );

        let script = Arc::new(ClientScript {
            capabilities: json!({ "codecs": ["opus", "vp8"] }),
            messages: Mutex::new(vec![]),
            consumers: Mutex::new(vec![]),
        });
        bus.set_handler(script.clone()).await;

        let was_ready = Arc::new(AtomicBool::new(false));

        {
            let bus = bus.clone();
            let was_ready = was_ready.clone();
            tokio::spawn(async move {
                while let Some(event) = client_events.recv().await {
                    match event {
                        LinkEvent::Frame(frame) if frame.is_empty() => {
                            was_ready.store(true, Ordering::Release);
                        }
                        LinkEvent::Frame(frame) => bus.handle_frame(&frame).await,
                        LinkEvent::Closed | LinkEvent::Error(_) => break,
                    }
                }
                bus.close().await;
            });
        }

        Self {
            bus,
            server_link,
            client_link,
            script,
            was_ready,
        }
    }

    /// Opens a link and completes the handshake with the given first frame.
    pub async fn connect(world: &World, remote: &str, first_frame: &str) -> Self {
        let client = Self::open(world, remote).await;
        client.send_raw(first_frame).await;
        client
    }

    pub async fn send_raw(&self, frame: &str) {
        let _result = self.client_link.send(frame.to_string()).await;
    }

    pub async fn wait_ready(&self) {
        let was_ready = self.was_ready.clone();
        eventually("ready frame", move || {
            let was_ready = was_ready.clone();
            async move { was_ready.load(Ordering::Acquire) }
        })
        .await;
    }

    pub async fn request(&self, name: MessageName, payload: Value) -> Result<Value> {
        self.bus
            .request(
                &BusMessage { name, payload },
                RequestOptions::default(),
            )
            .await
    }

    pub async fn send(&self, name: MessageName, payload: Value) {
        self.bus
            .send(&BusMessage { name, payload }, false)
            .await
            .expect("client send");
    }

    pub async fn produce(&self, stream_type: &str, kind: &str) -> Result<Value> {
        self.request(
            MessageName::InitProducer,
            json!({
                "type": stream_type,
                "kind": kind,
                "rtpParameters": {},
            }),
        )
        .await
    }

    pub async fn messages(&self) -> Vec<BusMessage> {
        self.script.messages.lock().await.clone()
    }

    pub async fn messages_named(&self, name: MessageName) -> Vec<BusMessage> {
        self.script
            .messages
            .lock()
            .await
            .iter()
            .filter(|m| m.name == name)
            .cloned()
            .collect()
    }

    pub async fn consumers(&self) -> Vec<InitConsumer> {
        self.script.consumers.lock().await.clone()
    }

    pub async fn close(&self) {
        self.client_link.close(CloseCode::Clean).await;
    }
}

// ---- mock media engine ----

/// Knobs shared by every handle the mock engine mints.
pub struct EngineState {
    /// Next N consumer creations fail, exercising the recovery path.
    pub consume_failures: AtomicUsize,
    pub can_consume: AtomicBool,
    pub producer_bitrate: AtomicU64,
}

pub struct MockEngine {
    pub state: Arc<EngineState>,
    pub workers: Mutex<Vec<Arc<MockWorker>>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(EngineState {
                consume_failures: AtomicUsize::new(0),
                can_consume: AtomicBool::new(true),
                producer_bitrate: AtomicU64::new(32_000),
            }),
            workers: Mutex::new(vec![]),
        })
    }
}

#[async_trait]
impl WorkerSpawner for MockEngine {
    async fn spawn(&self, _settings: &WorkerSettings) -> Result<Arc<dyn MediaWorker>> {
        let worker = Arc::new(MockWorker {
            engine: self.state.clone(),
            death: watch::channel(false).0,
        });
        self.workers.lock().await.push(worker.clone());
        Ok(worker)
    }
}

pub struct MockWorker {
    engine: Arc<EngineState>,
    death: watch::Sender<bool>,
}

impl MockWorker {
    pub fn kill(&self) {
        let _result = self.death.send(true);
    }
}

#[async_trait]
impl MediaWorker for MockWorker {
    async fn resource_usage(&self) -> Result<u64> {
        Ok(100)
    }

    async fn create_router(&self, codecs: Vec<RtpCodec>) -> Result<Arc<dyn MediaRouter>> {
        Ok(Arc::new(MockRouter {
            engine: self.engine.clone(),
            capabilities: json!({ "codecs": codecs }),
        }))
    }

    async fn create_webrtc_server(&self) -> Result<Arc<dyn WebRtcServer>> {
        Ok(Arc::new(MockServer {
            id: fresh_id("server"),
        }))
    }

    async fn died(&self) {
        let mut rx = self.death.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn close(&self) {}
}

struct MockServer {
    id: String,
}

impl WebRtcServer for MockServer {
    fn id(&self) -> String {
        self.id.clone()
    }
}

struct MockRouter {
    engine: Arc<EngineState>,
    capabilities: Value,
}

#[async_trait]
impl MediaRouter for MockRouter {
    fn capabilities(&self) -> Value {
        self.capabilities.clone()
    }

    fn can_consume(&self, _producer_id: &str, _capabilities: &Value) -> bool {
        self.engine.can_consume.load(Ordering::Relaxed)
    }

    async fn create_webrtc_transport(
        &self,
        _opts: TransportOptions,
    ) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(MockTransport {
            engine: self.engine.clone(),
            id: fresh_id("transport"),
        }))
    }

    async fn close(&self) {}
}

struct MockTransport {
    engine: Arc<EngineState>,
    id: String,
}

#[async_trait]
impl Transport for MockTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn ice_parameters(&self) -> Value {
        json!({ "usernameFragment": self.id })
    }

    fn ice_candidates(&self) -> Value {
        json!([])
    }

    fn dtls_parameters(&self) -> Value {
        json!({ "role": "auto" })
    }

    fn sctp_parameters(&self) -> Option<Value> {
        Some(json!({ "port": 5000 }))
    }

    async fn connect(&self, _dtls_parameters: Value) -> Result<()> {
        Ok(())
    }

    async fn produce(&self, kind: MediaKind, rtp_parameters: Value) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(MockProducer {
            engine: self.engine.clone(),
            id: fresh_id("producer"),
            kind,
            rtp_parameters,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        _capabilities: Value,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>> {
        let failures = &self.engine.consume_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(eyre::eyre!("injected consume failure"));
        }

        Ok(Arc::new(MockConsumer {
            id: fresh_id("consumer"),
            producer_id: producer_id.to_string(),
            kind: MediaKind::Audio,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
        }))
    }

    async fn set_max_incoming_bitrate(&self, _bitrate: u32) -> Result<()> {
        Ok(())
    }

    async fn set_max_outgoing_bitrate(&self, _bitrate: u32) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        Ok(TransportStats::default())
    }

    async fn close(&self) {}
}

pub struct MockProducer {
    engine: Arc<EngineState>,
    id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for MockProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    async fn pause(&self) -> Result<()> {
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn stats(&self) -> Result<ProducerStats> {
        Ok(ProducerStats {
            bitrate: self.engine.producer_bitrate.load(Ordering::Relaxed),
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub struct MockConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl Consumer for MockConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn rtp_parameters(&self) -> Value {
        json!({ "producerId": self.producer_id })
    }

    async fn pause(&self) -> Result<()> {
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Parses the payload array of a raw frame; handy for asserting on framing.
pub fn parse_frame(frame: &str) -> Vec<Payload> {
    serde_json::from_str(frame).expect("frame is a payload array")
}
