//! Outbound delivery events and the gateway wire protocol.
//!
//! Gateway communication uses JSON-over-WebSocket with three frame types:
//! Request, Response, and Event. Every event of a turn carries a
//! [`DeliveryEvent`] payload under the `turn.event` event name.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::types::RoutingReason;

/// Protocol version implemented by this gateway.
pub const PROTOCOL_VERSION: u32 = 1;

/// Event name for per-turn delivery events.
pub const TURN_EVENT: &str = "turn.event";

/// Methods accepted by the gateway.
pub const METHODS: &[&str] = &["turn.send", "turn.cancel", "responders.list", "session.get"];

/// A gateway wire frame: the top-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    /// Client -> Server request.
    #[serde(rename = "req")]
    Request {
        id: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },

    /// Server -> Client response.
    #[serde(rename = "res")]
    Response {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },

    /// Server -> Client event.
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

/// Error shape returned in response frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GatewayFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::Response {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self::Response {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: code.to_string(),
                message: message.into(),
                details: None,
            }),
        }
    }

    pub fn turn_event(event: &DeliveryEvent, seq: u64) -> Self {
        Self::Event {
            event: TURN_EVENT.to_string(),
            payload: serde_json::to_value(event).ok(),
            seq: Some(seq),
        }
    }
}

/// Parameters of `turn.send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSendParams {
    pub session_id: String,
    pub text: String,
}

/// Parameters of `turn.cancel` and `session.get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    pub session_id: String,
}

/// Why validation forced approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailSafeReason {
    Timeout,
    Error,
    Unparseable,
}

impl FailSafeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Unparseable => "unparseable",
        }
    }
}

/// Which path the validation gate took for a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Approved { attempts: u32, confidence: f64 },
    /// Approval forced by a validation timeout, error or unparseable response.
    FailSafe { attempts: u32, reason: FailSafeReason },
    /// Regeneration exhausted; best draft delivered with a disclaimer.
    DeliveredWithDisclaimer { attempts: u32, confidence: f64 },
    /// Validation disabled, or the reply did not come from a responder.
    Skipped,
}

impl ValidationOutcome {
    pub fn disclaimer(&self) -> bool {
        matches!(self, Self::DeliveredWithDisclaimer { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Approved { .. } => "approved",
            Self::FailSafe { .. } => "fail_safe",
            Self::DeliveredWithDisclaimer { .. } => "delivered_with_disclaimer",
            Self::Skipped => "skipped",
        }
    }
}

/// How audio for a turn was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    Progressive,
    /// One pass over the final text: progressive mode aborted, or a direct reply.
    SinglePass,
    TextOnly,
}

/// Final metadata for a turn, carried by the `complete` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSummary {
    pub turn_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder: Option<String>,
    pub routing_reason: RoutingReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff_message: Option<String>,
    pub display_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_payload: Option<serde_json::Value>,
    /// The responder signalled lesson completion.
    pub completion: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff_to: Option<String>,
    pub disclaimer: bool,
    pub validation: ValidationOutcome,
    pub audio_mode: AudioMode,
    pub audio_segments: usize,
    #[serde(default)]
    pub audio_failed: Vec<usize>,
}

/// One event of the per-turn outbound stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// Incremental display text.
    Text {
        turn_id: String,
        seq: usize,
        text: String,
    },
    /// One audio segment; emitted strictly in `sequence_index` order.
    Audio {
        turn_id: String,
        sequence_index: usize,
        format: String,
        /// Base64-encoded audio bytes.
        data: String,
    },
    Complete(TurnSummary),
    Error {
        turn_id: String,
        kind: String,
        message: String,
    },
}

impl DeliveryEvent {
    pub fn audio(turn_id: &str, sequence_index: usize, format: &str, bytes: &[u8]) -> Self {
        Self::Audio {
            turn_id: turn_id.to_string(),
            sequence_index,
            format: format.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Audio { .. } => "audio",
            Self::Complete(_) => "complete",
            Self::Error { .. } => "error",
        }
    }

    pub fn turn_id(&self) -> &str {
        match self {
            Self::Text { turn_id, .. }
            | Self::Audio { turn_id, .. }
            | Self::Error { turn_id, .. } => turn_id,
            Self::Complete(summary) => &summary.turn_id,
        }
    }

    /// Decoded audio bytes of an `audio` event.
    pub fn audio_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Audio { data, .. } => base64::engine::general_purpose::STANDARD.decode(data).ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_parse() {
        let raw = r#"{"type":"req","id":"1","method":"turn.send","params":{"session_id":"s","text":"Hi"}}"#;
        let frame: GatewayFrame = serde_json::from_str(raw).unwrap();
        match frame {
            GatewayFrame::Request { method, params, .. } => {
                assert_eq!(method, "turn.send");
                let p: TurnSendParams = serde_json::from_value(params.unwrap()).unwrap();
                assert_eq!(p.text, "Hi");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_audio_event_base64() {
        let ev = DeliveryEvent::audio("t1", 2, "mp3", &[1, 2, 3]);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "audio");
        assert_eq!(json["sequence_index"], 2);
        assert_eq!(json["data"], "AQID");
        assert_eq!(ev.audio_bytes(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_complete_event_shape() {
        let ev = DeliveryEvent::Complete(TurnSummary {
            turn_id: "t1".into(),
            responder: Some("fractions".into()),
            routing_reason: RoutingReason::FastPath,
            handoff_message: None,
            display_text: "Done.".into(),
            visual_payload: None,
            completion: true,
            handoff_to: None,
            disclaimer: false,
            validation: ValidationOutcome::FailSafe {
                attempts: 1,
                reason: FailSafeReason::Timeout,
            },
            audio_mode: AudioMode::Progressive,
            audio_segments: 1,
            audio_failed: vec![],
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["routing_reason"], "fast_path");
        assert_eq!(json["validation"]["outcome"], "fail_safe");
        assert_eq!(json["validation"]["reason"], "timeout");
        assert_eq!(ev.turn_id(), "t1");
    }

    #[test]
    fn test_error_response_frame() {
        let frame = GatewayFrame::err("9", "invalid_params", "missing text");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "res");
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], "invalid_params");
    }
}
