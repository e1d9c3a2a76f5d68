//! Stream message models.

use serde::{Deserialize, Serialize};

use crate::error::{CodevecError, CodevecResult};

/// Marker carried by the `start` event.
pub const START_MARKER: &str = "<start>";

/// Marker carried by the `complete` event.
pub const STOP_MARKER: &str = "<stop>";

/// Seconds since the Unix epoch, with sub-second precision.
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Progress step of a streamed answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Start,
    Chunk,
    Complete,
    Error,
}

impl Step {
    /// No event follows a terminal step for the same task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::Complete | Step::Error)
    }
}

/// One unit of progress published on a session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub step: Step,
    pub timestamp: f64,
    pub data: serde_json::Value,
}

impl StreamEvent {
    pub fn new(step: Step, data: impl Into<serde_json::Value>) -> Self {
        Self {
            step,
            timestamp: now_secs(),
            data: data.into(),
        }
    }

    pub fn start() -> Self {
        Self::new(Step::Start, START_MARKER)
    }

    pub fn chunk(fragment: impl Into<String>) -> Self {
        Self::new(Step::Chunk, fragment.into())
    }

    pub fn complete() -> Self {
        Self::new(Step::Complete, STOP_MARKER)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Step::Error, message.into())
    }

    /// Encode to the channel wire format.
    pub fn to_json(&self) -> CodevecResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Strictly decode a channel payload.
    pub fn decode(raw: &str) -> CodevecResult<Self> {
        serde_json::from_str(raw).map_err(|e| CodevecError::Parse(e.to_string()))
    }

    /// The text of a chunk, if this is one.
    pub fn fragment(&self) -> Option<&str> {
        match self.step {
            Step::Chunk => self.data.as_str(),
            _ => None,
        }
    }
}

/// Diagnostic message such as the connection handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl Notice {
    pub fn system(message: impl Into<String>) -> Self {
        Self {
            kind: "system".to_string(),
            message: message.into(),
            timestamp: Some(now_secs()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            message: message.into(),
            timestamp: None,
        }
    }

    pub fn to_json(&self) -> CodevecResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// What a channel payload turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Event(StreamEvent),
    Notice(Notice),
    /// Not JSON, or JSON of no known shape.
    Opaque,
}

/// A payload received from a channel. The typed parse is for
/// classification only; the raw text is what gets forwarded, so fields
/// the models do not know about survive the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    raw: String,
    kind: MessageKind,
}

impl ChannelMessage {
    pub fn parse(raw: &str) -> Self {
        let kind = if let Ok(event) = StreamEvent::decode(raw) {
            MessageKind::Event(event)
        } else {
            match serde_json::from_str::<Notice>(raw) {
                Ok(notice) => MessageKind::Notice(notice),
                Err(_) => MessageKind::Opaque,
            }
        };
        Self {
            raw: raw.to_string(),
            kind,
        }
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// The payload exactly as published.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn event(&self) -> Option<&StreamEvent> {
        match &self.kind {
            MessageKind::Event(event) => Some(event),
            _ => None,
        }
    }

    pub fn is_structured(&self) -> bool {
        !matches!(self.kind, MessageKind::Opaque)
    }

    pub fn into_raw(self) -> String {
        self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = StreamEvent {
            step: Step::Chunk,
            timestamp: 1700000000.5,
            data: "answer".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"step": "chunk", "timestamp": 1700000000.5, "data": "answer"})
        );
    }

    #[test]
    fn test_markers_and_terminal_steps() {
        assert_eq!(StreamEvent::start().data, START_MARKER);
        assert_eq!(StreamEvent::complete().data, STOP_MARKER);
        assert!(StreamEvent::complete().step.is_terminal());
        assert!(StreamEvent::error("boom").step.is_terminal());
        assert!(!StreamEvent::chunk("x").step.is_terminal());
    }

    #[test]
    fn test_event_data_may_be_an_object() {
        let raw = r#"{"step":"error","timestamp":1.0,"data":{"code":7}}"#;
        let event = StreamEvent::decode(raw).unwrap();
        assert_eq!(event.data["code"], 7);
        assert_eq!(event.fragment(), None);
    }

    #[test]
    fn test_decode_rejects_unknown_step() {
        let raw = r#"{"step":"partial","timestamp":1.0,"data":""}"#;
        let err = StreamEvent::decode(raw).unwrap_err();
        assert!(matches!(err, CodevecError::Parse(_)));
    }

    #[test]
    fn test_parse_handshake_notice() {
        let raw = r#"{"type":"system","message":"Connection established","timestamp":3.5}"#;
        match ChannelMessage::parse(raw).kind() {
            MessageKind::Notice(n) => {
                assert_eq!(n.kind, "system");
                assert_eq!(n.message, "Connection established");
            }
            other => panic!("expected notice, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_falls_back_to_opaque() {
        let msg = ChannelMessage::parse("plain words, not json");
        assert_eq!(msg.kind(), &MessageKind::Opaque);
        assert!(!msg.is_structured());
        assert_eq!(msg.raw(), "plain words, not json");
    }

    #[test]
    fn test_json_that_is_not_a_known_shape_stays_opaque() {
        let raw = r#"{"hello":"world"}"#;
        let msg = ChannelMessage::parse(raw);
        assert!(!msg.is_structured());
        assert_eq!(msg.raw(), raw);
    }

    #[test]
    fn test_unknown_fields_are_kept_in_the_raw_payload() {
        let raw = r#"{"step":"chunk","timestamp":1.5,"data":"x","task_id":"t-1"}"#;
        let msg = ChannelMessage::parse(raw);
        assert_eq!(msg.event().and_then(|e| e.fragment()), Some("x"));
        assert_eq!(msg.raw(), raw);

        let raw = r#"{"type":"chat","message":"hi","from":"alice"}"#;
        let msg = ChannelMessage::parse(raw);
        assert!(matches!(msg.kind(), MessageKind::Notice(n) if n.kind == "chat"));
        assert_eq!(msg.into_raw(), raw);
    }
}
