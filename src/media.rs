//! Interface to the media engine.
//!
//! The engine that actually moves RTP is an external collaborator; the
//! control plane only orchestrates it. These traits are the whole surface it
//! consumes: workers host routers, routers mint transports, transports mint
//! producers (uplinks) and consumers (downlinks). Opaque engine blobs (RTP
//! capabilities, ICE/DTLS/SCTP parameters) stay `serde_json::Value`.

use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::MediaKind;

/// One entry of the codec table a router is built with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RtpCodec {
    pub kind: MediaKind,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(rename = "clockRate")]
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    pub parameters: Value,
    #[serde(rename = "rtcpFeedback")]
    pub rtcp_feedback: Vec<String>,
}

impl RtpCodec {
    /// Short name used in the `AUDIO_CODECS`/`VIDEO_CODECS` lists.
    pub fn name(&self) -> &str {
        self.mime_type
            .split('/')
            .next_back()
            .unwrap_or(&self.mime_type)
    }
}

/// Settings handed to the engine when spawning a worker.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub rtc_interface: IpAddr,
    pub public_ip: IpAddr,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

#[derive(Clone, Debug, Default)]
pub struct TransportOptions {
    pub max_incoming_buffer: Option<u32>,
    pub max_outgoing_buffer: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ProducerStats {
    /// Incoming bitrate in bits per second.
    pub bitrate: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct TransportStats {
    pub recv_bitrate: u64,
    pub send_bitrate: u64,
}

/// Spawns engine workers. The seam the supervisor and tests inject.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, settings: &WorkerSettings) -> Result<Arc<dyn MediaWorker>>;
}

#[async_trait]
pub trait MediaWorker: Send + Sync {
    /// Resident memory of the engine process, used for load balancing.
    async fn resource_usage(&self) -> Result<u64>;

    async fn create_router(&self, codecs: Vec<RtpCodec>) -> Result<Arc<dyn MediaRouter>>;

    async fn create_webrtc_server(&self) -> Result<Arc<dyn WebRtcServer>>;

    /// Resolves when the engine process exits. Multiple waiters allowed.
    async fn died(&self);

    async fn close(&self);
}

/// The engine socket set shared by every transport of one worker.
pub trait WebRtcServer: Send + Sync {
    fn id(&self) -> String;
}

#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn capabilities(&self) -> Value;

    /// Whether a consumer can be built for `producer_id` given the client's
    /// RTP capabilities.
    fn can_consume(&self, producer_id: &str, capabilities: &Value) -> bool;

    async fn create_webrtc_transport(&self, opts: TransportOptions) -> Result<Arc<dyn Transport>>;

    async fn close(&self);
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> String;
    fn ice_parameters(&self) -> Value;
    fn ice_candidates(&self) -> Value;
    fn dtls_parameters(&self) -> Value;
    fn sctp_parameters(&self) -> Option<Value>;

    async fn connect(&self, dtls_parameters: Value) -> Result<()>;

    async fn produce(&self, kind: MediaKind, rtp_parameters: Value) -> Result<Arc<dyn Producer>>;

    async fn consume(
        &self,
        producer_id: &str,
        capabilities: Value,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>>;

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<()>;
    async fn set_max_outgoing_bitrate(&self, bitrate: u32) -> Result<()>;

    async fn stats(&self) -> Result<TransportStats>;

    async fn close(&self);
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn paused(&self) -> bool;
    fn rtp_parameters(&self) -> Value;

    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;

    async fn stats(&self) -> Result<ProducerStats>;

    async fn close(&self);
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn paused(&self) -> bool;
    fn rtp_parameters(&self) -> Value;

    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;

    async fn close(&self);
}
