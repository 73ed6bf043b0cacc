//! Process-wide settings, sourced from flags or the environment.

use std::{net::IpAddr, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use eyre::Result;
use serde_json::{json, Value};

use crate::{
    errors::Error,
    media::RtpCodec,
    protocol::MediaKind,
};

/// Every caught media or bus error is appended to the owning session's error
/// list; crossing this budget closes the session.
pub const MAX_SESSION_ERRORS: usize = 6;

#[derive(clap::Args, Clone, Debug)]
pub struct Config {
    /// Base64 key used to verify bearer tokens.
    #[arg(long, env = "AUTH_KEY")]
    pub auth_key: String,

    /// Address announced to clients in ICE candidates.
    #[arg(long, env = "PUBLIC_IP")]
    pub public_ip: IpAddr,

    #[arg(long, env = "HTTP_INTERFACE", default_value = "0.0.0.0")]
    pub http_interface: IpAddr,

    #[arg(long, env = "PORT", default_value_t = 8070)]
    pub port: u16,

    #[arg(long, env = "RTC_INTERFACE", default_value = "0.0.0.0")]
    pub rtc_interface: IpAddr,

    #[arg(long, env = "RTC_MIN_PORT", default_value_t = 40000)]
    pub rtc_min_port: u16,

    #[arg(long, env = "RTC_MAX_PORT", default_value_t = 49999)]
    pub rtc_max_port: u16,

    /// Worker count, capped at the hardware parallelism.
    #[arg(long, env = "NUM_WORKERS")]
    pub num_workers: Option<usize>,

    /// Comma list of audio codecs to offer; all known codecs when unset.
    #[arg(long, env = "AUDIO_CODECS")]
    pub audio_codecs: Option<String>,

    /// Comma list of video codecs to offer; all known codecs when unset.
    #[arg(long, env = "VIDEO_CODECS")]
    pub video_codecs: Option<String>,

    #[arg(long, env = "MAX_BUF_IN", default_value_t = 262_144)]
    pub max_buf_in: u32,

    #[arg(long, env = "MAX_BUF_OUT", default_value_t = 262_144)]
    pub max_buf_out: u32,

    #[arg(long, env = "MAX_BITRATE_IN", default_value_t = 8_000_000)]
    pub max_bitrate_in: u32,

    #[arg(long, env = "MAX_BITRATE_OUT", default_value_t = 10_000_000)]
    pub max_bitrate_out: u32,

    #[arg(long, env = "MAX_VIDEO_BITRATE", default_value_t = 4_000_000)]
    pub max_video_bitrate: u32,

    #[arg(long, env = "CHANNEL_SIZE", default_value_t = 100)]
    pub channel_size: usize,

    /// Trust first-hop `x-forwarded-*` headers.
    #[arg(long, env = "PROXY", default_value_t = false)]
    pub proxy: bool,

    #[clap(skip)]
    pub timeouts: Timeouts,
}

impl Config {
    /// Decodes the configured verification key. Missing or undecodable keys
    /// are fatal at startup.
    pub fn auth_key_bytes(&self) -> Result<Vec<u8>> {
        if self.auth_key.is_empty() {
            return Err(Error::Config("AUTH_KEY is empty".into()).into());
        }

        BASE64
            .decode(&self.auth_key)
            .map_err(|e| Error::Config(format!("AUTH_KEY is not base64: {e}")).into())
    }

    pub fn media_codecs(&self) -> Vec<RtpCodec> {
        let wanted = |list: &Option<String>, name: &str| {
            list.as_ref().is_none_or(|l| {
                l.split(',')
                    .any(|item| item.trim().eq_ignore_ascii_case(name))
            })
        };

        codec_catalog()
            .into_iter()
            .filter(|codec| match codec.kind {
                MediaKind::Audio => wanted(&self.audio_codecs, codec.name()),
                MediaKind::Video => wanted(&self.video_codecs, codec.name()),
            })
            .collect()
    }

    /// Default producer options handed to clients in `INIT_TRANSPORTS`.
    pub fn producer_options_by_kind(&self) -> Value {
        json!({
            "audio": {
                "codecOptions": {
                    "opusStereo": false,
                    "opusDtx": true,
                    "opusFec": true,
                }
            },
            "video": {
                "encodings": [
                    { "maxBitrate": self.max_video_bitrate },
                ]
            },
        })
    }
}

/// Every duration the coordination layer arms. Collected in one record so
/// tests can shrink them wholesale.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    /// First-message deadline for an unauthenticated link.
    pub authentication: Duration,
    /// How long a session may sit in CONNECTING.
    pub session: Duration,
    /// Interval between server pings; a ping times out after `session`.
    pub ping: Duration,
    /// Delay before retrying consumer creation against one peer.
    pub recovery: Duration,
    /// Idle close for channels with at most one participant.
    pub channel: Duration,
    /// Default bus request deadline.
    pub request: Duration,
    /// Trailing-edge batch window.
    pub batch_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            authentication: Duration::from_secs(10),
            session: Duration::from_secs(10),
            ping: Duration::from_secs(60),
            recovery: Duration::from_secs(2),
            channel: Duration::from_secs(3600),
            request: Duration::from_secs(5),
            batch_delay: Duration::from_millis(300),
        }
    }
}

fn codec_catalog() -> Vec<RtpCodec> {
    vec![
        RtpCodec {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".into(),
            clock_rate: 48_000,
            channels: Some(2),
            parameters: json!({ "useinbandfec": 1 }),
            rtcp_feedback: vec!["transport-cc".into()],
        },
        RtpCodec {
            kind: MediaKind::Video,
            mime_type: "video/VP8".into(),
            clock_rate: 90_000,
            channels: None,
            parameters: json!({}),
            rtcp_feedback: video_feedback(),
        },
        RtpCodec {
            kind: MediaKind::Video,
            mime_type: "video/VP9".into(),
            clock_rate: 90_000,
            channels: None,
            parameters: json!({ "profile-id": 2 }),
            rtcp_feedback: video_feedback(),
        },
        RtpCodec {
            kind: MediaKind::Video,
            mime_type: "video/H264".into(),
            clock_rate: 90_000,
            channels: None,
            parameters: json!({
                "packetization-mode": 1,
                "level-asymmetry-allowed": 1,
            }),
            rtcp_feedback: video_feedback(),
        },
        RtpCodec {
            kind: MediaKind::Video,
            mime_type: "video/AV1".into(),
            clock_rate: 90_000,
            channels: None,
            parameters: json!({}),
            rtcp_feedback: video_feedback(),
        },
    ]
}

fn video_feedback() -> Vec<String> {
    ["nack", "nack pli", "ccm fir", "goog-remb", "transport-cc"]
        .into_iter()
        .map(String::from)
        .collect()
}
