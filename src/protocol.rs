//! Records exchanged over the framed link.
//!
//! One network frame is a JSON array of [`Payload`]s. Requests and responses
//! are correlated by id; everything else is fire-and-forget. The `message`
//! field of a payload is either a [`BusMessage`] (tagged) or, for responses,
//! the bare response value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit inside a network frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payload {
    pub message: Value,
    #[serde(
        default,
        rename = "needResponse",
        skip_serializing_if = "Option::is_none"
    )]
    pub need_response: Option<String>,
    #[serde(default, rename = "responseTo", skip_serializing_if = "Option::is_none")]
    pub response_to: Option<String>,
}

impl Payload {
    pub fn message(message: Value) -> Self {
        Self {
            message,
            need_response: None,
            response_to: None,
        }
    }

    pub fn request(message: Value, id: String) -> Self {
        Self {
            message,
            need_response: Some(id),
            response_to: None,
        }
    }

    pub fn response(message: Value, to: String) -> Self {
        Self {
            message,
            need_response: None,
            response_to: Some(to),
        }
    }
}

/// Tagged message riding inside a payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusMessage {
    pub name: MessageName,
    #[serde(default)]
    pub payload: Value,
}

impl BusMessage {
    pub fn new<T: Serialize>(name: MessageName, payload: &T) -> eyre::Result<Self> {
        Ok(Self {
            name,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn empty(name: MessageName) -> Self {
        Self {
            name,
            payload: Value::Null,
        }
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageName {
    // client -> server
    Broadcast,
    ConsumptionChange,
    InfoChange,
    ProductionChange,
    ConnectCtsTransport,
    ConnectStcTransport,
    InitProducer,
    // server -> client
    SessionLeave,
    SInfoChange,
    InitConsumer,
    InitTransports,
    Ping,
}

/// The three uplink slots a session may fill.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StreamType {
    Audio,
    Camera,
    Screen,
}

impl StreamType {
    pub const ALL: [Self; 3] = [Self::Audio, Self::Camera, Self::Screen];

    pub fn kind(self) -> MediaKind {
        match self {
            Self::Audio => MediaKind::Audio,
            Self::Camera | Self::Screen => MediaKind::Video,
        }
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// `BROADCAST` as received from a client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastIn {
    pub payload: Value,
}

/// `BROADCAST` as relayed to every other participant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastOut {
    #[serde(rename = "senderId")]
    pub sender_id: String,
    pub message: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionLeave {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumptionChange {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub states: StreamStates,
}

/// Per-stream-type toggles; unset slots are untouched.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct StreamStates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<bool>,
}

impl StreamStates {
    pub fn get(&self, stream_type: StreamType) -> Option<bool> {
        match stream_type {
            StreamType::Audio => self.audio,
            StreamType::Camera => self.camera,
            StreamType::Screen => self.screen,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InfoChange {
    pub info: Value,
    #[serde(default, rename = "needRefresh")]
    pub need_refresh: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProductionChange {
    #[serde(rename = "type")]
    pub stream_type: StreamType,
    pub active: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectTransport {
    #[serde(rename = "dtlsParameters")]
    pub dtls_parameters: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitProducer {
    #[serde(rename = "type")]
    pub stream_type: StreamType,
    pub kind: MediaKind,
    #[serde(rename = "rtpParameters")]
    pub rtp_parameters: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitConsumer {
    pub id: String,
    pub kind: MediaKind,
    #[serde(rename = "producerId")]
    pub producer_id: String,
    #[serde(rename = "rtpParameters")]
    pub rtp_parameters: Value,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub active: bool,
    #[serde(rename = "type")]
    pub stream_type: StreamType,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitTransports {
    pub capabilities: Value,
    #[serde(rename = "stcConfig")]
    pub stc_config: TransportConfig,
    #[serde(rename = "ctsConfig")]
    pub cts_config: TransportConfig,
    #[serde(rename = "producerOptionsByKind")]
    pub producer_options_by_kind: Value,
}

/// Client-facing description of one server-side transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    pub id: String,
    #[serde(rename = "iceParameters")]
    pub ice_parameters: Value,
    #[serde(rename = "iceCandidates")]
    pub ice_candidates: Value,
    #[serde(rename = "dtlsParameters")]
    pub dtls_parameters: Value,
    #[serde(
        default,
        rename = "sctpParameters",
        skip_serializing_if = "Option::is_none"
    )]
    pub sctp_parameters: Option<Value>,
    #[serde(default, rename = "iceServers", skip_serializing_if = "Option::is_none")]
    pub ice_servers: Option<Value>,
}

/// The mutable per-session presence record. Fixed membership, every field
/// optional; unset fields are omitted on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_talking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_camera_on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_screen_sharing_on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_self_muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_deaf: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_raising_hand: Option<bool>,
}

impl SessionInfo {
    /// Extracts the recognized keys from an arbitrary client blob, coercing
    /// each present value to a boolean. Unknown keys are dropped.
    pub fn from_patch(patch: &Value) -> Self {
        let field = |key: &str| patch.get(key).map(truthy);

        Self {
            is_talking: field("isTalking"),
            is_camera_on: field("isCameraOn"),
            is_screen_sharing_on: field("isScreenSharingOn"),
            is_self_muted: field("isSelfMuted"),
            is_deaf: field("isDeaf"),
            is_raising_hand: field("isRaisingHand"),
        }
    }

    /// Overlays the set fields of `patch` onto `self`.
    pub fn merge(&mut self, patch: &Self) {
        let overlay = |slot: &mut Option<bool>, value: Option<bool>| {
            if value.is_some() {
                *slot = value;
            }
        };

        overlay(&mut self.is_talking, patch.is_talking);
        overlay(&mut self.is_camera_on, patch.is_camera_on);
        overlay(&mut self.is_screen_sharing_on, patch.is_screen_sharing_on);
        overlay(&mut self.is_self_muted, patch.is_self_muted);
        overlay(&mut self.is_deaf, patch.is_deaf);
        overlay(&mut self.is_raising_hand, patch.is_raising_hand);
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Wire close codes for the framed link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::AsRefStr)]
pub enum CloseCode {
    Clean,
    Leaving,
    Error,
    AuthenticationFailed,
    Timeout,
    Kicked,
    ChannelFull,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            Self::Clean => 1000,
            Self::Leaving => 1001,
            Self::Error => 1011,
            Self::AuthenticationFailed => 4106,
            Self::Timeout => 4107,
            Self::Kicked => 4108,
            Self::ChannelFull => 4109,
        }
    }
}

/// Why a session closed. Mapped onto a wire close code at the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::AsRefStr)]
pub enum CloseReason {
    Clean,
    Replaced,
    Kicked,
    ChannelClosed,
    ConnectionTimeout,
    PingTimeout,
    Error,
    WsClosed,
    WsError,
}

impl CloseReason {
    pub fn close_code(self) -> CloseCode {
        match self {
            Self::Error => CloseCode::Error,
            Self::Kicked | Self::Replaced | Self::ChannelClosed => CloseCode::Kicked,
            Self::ConnectionTimeout | Self::PingTimeout => CloseCode::Timeout,
            Self::Clean | Self::WsClosed | Self::WsError => CloseCode::Clean,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn message_names_on_the_wire() {
        for (name, tag) in [
            (MessageName::ConnectCtsTransport, "\"CONNECT_CTS_TRANSPORT\""),
            (MessageName::SInfoChange, "\"S_INFO_CHANGE\""),
            (MessageName::Ping, "\"PING\""),
            (MessageName::InitConsumer, "\"INIT_CONSUMER\""),
        ] {
            assert_eq!(serde_json::to_string(&name).unwrap(), tag);
        }
    }

    #[test]
    fn close_reason_mapping() {
        assert_eq!(CloseReason::Error.close_code(), CloseCode::Error);
        assert_eq!(CloseReason::Kicked.close_code(), CloseCode::Kicked);
        assert_eq!(CloseReason::Replaced.close_code(), CloseCode::Kicked);
        assert_eq!(CloseReason::ChannelClosed.close_code(), CloseCode::Kicked);
        assert_eq!(CloseReason::ConnectionTimeout.close_code(), CloseCode::Timeout);
        assert_eq!(CloseReason::PingTimeout.close_code(), CloseCode::Timeout);
        assert_eq!(CloseReason::WsClosed.close_code(), CloseCode::Clean);
        assert_eq!(CloseReason::Clean.close_code(), CloseCode::Clean);
    }

    #[test]
    fn info_patch_recognizes_and_coerces() {
        let info = SessionInfo::from_patch(&json!({
            "isTalking": 1,
            "isCameraOn": false,
            "isDeaf": "yes",
            "bogus": true,
        }));

        assert_eq!(info.is_talking, Some(true));
        assert_eq!(info.is_camera_on, Some(false));
        assert_eq!(info.is_deaf, Some(true));
        assert_eq!(info.is_self_muted, None);
    }

    #[test]
    fn info_merge_touches_only_set_fields() {
        let mut info = SessionInfo {
            is_self_muted: Some(true),
            ..SessionInfo::default()
        };

        info.merge(&SessionInfo {
            is_camera_on: Some(true),
            ..SessionInfo::default()
        });

        assert_eq!(info.is_self_muted, Some(true));
        assert_eq!(info.is_camera_on, Some(true));
    }

    #[test]
    fn payload_roundtrip_keeps_correlation_fields() {
        let payload = Payload::request(json!({"name": "PING", "payload": null}), "s_1_0".into());
        let text = serde_json::to_string(&vec![payload]).unwrap();
        assert!(text.contains("\"needResponse\":\"s_1_0\""));

        let parsed: Vec<Payload> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed[0].need_response.as_deref(), Some("s_1_0"));
        assert!(parsed[0].response_to.is_none());
    }
}
