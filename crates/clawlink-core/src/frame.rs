//! Wire frames for gateway communication.
//!
//! Every frame is a JSON object discriminated by its `type` field. Inbound
//! text is parsed exactly once, at the event-router boundary; frames that
//! fail to parse are dropped with a debug log instead of crashing the
//! client. Alternate field spellings that older gateways emit
//! (`payload`/`result`, `payload`/`data`) are resolved here, in one place,
//! so the rest of the client only ever sees the canonical shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound request frame: `{type:"req", id, method, params}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestFrame {
    Req {
        id: String,
        method: String,
        params: Value,
    },
}

impl RequestFrame {
    /// Build a request frame.
    #[must_use]
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self::Req {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Inbound frame, discriminated by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Successful response (unless `ok:false` or an error object is carried).
    Res(ResponseFrame),
    /// Failed response.
    Err(ResponseFrame),
    /// Named push event.
    Event(EventFrame),
    /// Legacy streaming frame.
    Stream(StreamFrame),
}

impl InboundFrame {
    /// Parse one frame of inbound text.
    ///
    /// Returns `None` for malformed or unrecognized input; the caller is
    /// expected to drop such frames silently.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::debug!("dropping unparseable frame: {e}");
                None
            }
        }
    }
}

/// Body of a `res`/`err` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(default)]
    message: Option<String>,
}

/// Error object carried by failed responses.
#[derive(Debug, Clone, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl ResponseFrame {
    /// Whether this response signals failure.
    ///
    /// Failure is any of: the frame arrived as `err`, an error object is
    /// present, or `ok` is explicitly false.
    #[must_use]
    pub fn is_failure(&self, err_frame: bool) -> bool {
        err_frame || self.error.is_some() || self.ok == Some(false)
    }

    /// The response payload.
    ///
    /// `payload` is canonical; `result` is accepted from older gateways
    /// with a debug log. Anything else resolves to null.
    #[must_use]
    pub fn payload(&self) -> Value {
        if let Some(ref p) = self.payload {
            return p.clone();
        }
        if let Some(ref r) = self.result {
            tracing::debug!(id = %self.id, "response used legacy `result` field");
            return r.clone();
        }
        Value::Null
    }

    /// Best-effort human-readable failure message.
    #[must_use]
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .and_then(|e| e.message.clone())
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "request failed".to_string())
    }
}

/// Body of an `event` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
}

impl EventFrame {
    /// The event body. `payload` is canonical, `data` a logged fallback.
    #[must_use]
    pub fn body(&self) -> Option<&Value> {
        if self.payload.is_some() {
            return self.payload.as_ref();
        }
        if self.data.is_some() {
            tracing::debug!(event = %self.event, "event used legacy `data` field");
        }
        self.data.as_ref()
    }
}

/// Legacy streaming frame: `{type:"stream", event?, delta?, done?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamFrame {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    done: Option<bool>,
}

impl StreamFrame {
    /// Incremental text carried by this frame, if any.
    #[must_use]
    pub fn delta_text(&self) -> Option<&str> {
        if let Some(ref d) = self.delta {
            return Some(d);
        }
        self.data
            .as_ref()
            .and_then(|d| d.get("delta"))
            .and_then(Value::as_str)
    }

    /// Whether this frame terminates the stream.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done == Some(true) || self.event.as_deref() == Some("chat.done")
    }
}

/// Terminal state of a chat-domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStreamState {
    Delta,
    Final,
    Error,
    Aborted,
}

/// Payload of the chat-domain `chat` event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEventPayload {
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    pub state: ChatStreamState,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_shape() {
        let frame = RequestFrame::new("c1", "ping", serde_json::json!({}));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "req");
        assert_eq!(json["id"], "c1");
        assert_eq!(json["method"], "ping");
    }

    #[test]
    fn parse_response_with_payload() {
        let frame = InboundFrame::parse(r#"{"type":"res","id":"c1","payload":{"x":1}}"#).unwrap();
        let InboundFrame::Res(res) = frame else {
            panic!("expected res frame");
        };
        assert!(!res.is_failure(false));
        assert_eq!(res.payload()["x"], 1);
    }

    #[test]
    fn legacy_result_field_is_accepted() {
        let frame = InboundFrame::parse(r#"{"type":"res","id":"c2","result":{"y":2}}"#).unwrap();
        let InboundFrame::Res(res) = frame else {
            panic!("expected res frame");
        };
        assert_eq!(res.payload()["y"], 2);
    }

    #[test]
    fn failure_detection() {
        let ok_false =
            InboundFrame::parse(r#"{"type":"res","id":"c3","ok":false,"message":"nope"}"#).unwrap();
        let InboundFrame::Res(res) = ok_false else {
            panic!("expected res frame");
        };
        assert!(res.is_failure(false));
        assert_eq!(res.error_message(), "nope");

        let with_error =
            InboundFrame::parse(r#"{"type":"err","id":"c4","error":{"message":"denied"}}"#)
                .unwrap();
        let InboundFrame::Err(res) = with_error else {
            panic!("expected err frame");
        };
        assert!(res.is_failure(true));
        assert_eq!(res.error_message(), "denied");
    }

    #[test]
    fn malformed_input_is_dropped() {
        assert!(InboundFrame::parse("not json").is_none());
        assert!(InboundFrame::parse(r#"{"type":"mystery"}"#).is_none());
    }

    #[test]
    fn stream_frame_delta_sources() {
        let direct: StreamFrame =
            serde_json::from_str(r#"{"delta":"abc"}"#).unwrap();
        assert_eq!(direct.delta_text(), Some("abc"));

        let nested: StreamFrame =
            serde_json::from_str(r#"{"data":{"delta":"def"}}"#).unwrap();
        assert_eq!(nested.delta_text(), Some("def"));

        let done: StreamFrame = serde_json::from_str(r#"{"event":"chat.done"}"#).unwrap();
        assert!(done.is_done());
    }

    #[test]
    fn chat_event_payload_states() {
        let payload: ChatEventPayload = serde_json::from_str(
            r#"{"sessionKey":"agent:dev:main","runId":"r1","state":"delta","message":{"content":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(payload.state, ChatStreamState::Delta);
        assert_eq!(payload.session_key.as_deref(), Some("agent:dev:main"));

        let terminal: ChatEventPayload =
            serde_json::from_str(r#"{"state":"final"}"#).unwrap();
        assert_eq!(terminal.state, ChatStreamState::Final);
    }
}
