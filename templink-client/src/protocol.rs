//! Wire frames of the rendering backend's websocket API.
//!
//! A session opens with `auth_required`, answered by `auth` and confirmed by
//! `auth_ok`. A `render_template` request is acknowledged by a `result` frame
//! with the same id; that id then tags every `event` frame of the
//! subscription and is what `unsubscribe_events` refers to.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use templink_core::Variables;

use crate::error::WsError;

/// Level at which a render-time error invalidates the value.
pub const ERROR_LEVEL: &str = "ERROR";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingFrame {
    Auth {
        access_token: String,
    },
    RenderTemplate {
        id: u64,
        template: String,
        variables: Variables,
    },
    UnsubscribeEvents {
        id: u64,
        subscription: u64,
    },
}

impl OutgoingFrame {
    pub fn to_text(&self) -> Result<String, WsError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingFrame {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        error: Option<ErrorBody>,
    },
    Event {
        id: u64,
        event: EventBody,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Payload of an `event` frame for a template subscription.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EventBody {
    Rendered {
        result: Value,
    },
    RenderError {
        error: String,
        #[serde(default)]
        level: Option<String>,
    },
}

/// What an event means for the subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Rendered(String),
    Failed(String),
    /// Reported by the backend but not fatal to the value.
    Warning(String),
}

impl EventBody {
    pub fn outcome(self) -> EventOutcome {
        match self {
            // Results that parse as JSON arrive typed; subscribers get text.
            EventBody::Rendered {
                result: Value::String(text),
            } => EventOutcome::Rendered(text),
            EventBody::Rendered { result } => EventOutcome::Rendered(result.to_string()),
            EventBody::RenderError { error, level } => match level.as_deref() {
                None | Some(ERROR_LEVEL) => EventOutcome::Failed(error),
                Some(_) => EventOutcome::Warning(error),
            },
        }
    }
}

/// Decode one text message. A message may carry a single frame or an array
/// of frames.
pub fn decode_frames(text: &str) -> Result<Vec<IncomingFrame>, WsError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(WsError::from))
            .collect(),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_template_frame_shape() {
        let mut variables = Variables::new();
        variables.insert("user".to_string(), json!("alice"));
        let frame = OutgoingFrame::RenderTemplate {
            id: 7,
            template: "{{ user }}".to_string(),
            variables,
        };

        let value: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "render_template",
                "id": 7,
                "template": "{{ user }}",
                "variables": {"user": "alice"}
            })
        );
    }

    #[test]
    fn test_unsubscribe_frame_shape() {
        let frame = OutgoingFrame::UnsubscribeEvents {
            id: 9,
            subscription: 7,
        };
        let value: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "unsubscribe_events", "id": 9, "subscription": 7})
        );
    }

    #[test]
    fn test_decode_result_with_error() {
        let frames = decode_frames(
            r#"{"id":3,"type":"result","success":false,"error":{"code":"template_error","message":"bad"}}"#,
        )
        .unwrap();
        assert_eq!(
            frames,
            vec![IncomingFrame::Result {
                id: 3,
                success: false,
                error: Some(ErrorBody {
                    code: "template_error".to_string(),
                    message: "bad".to_string(),
                }),
            }]
        );
    }

    #[test]
    fn test_decode_event_and_batch() {
        let frames = decode_frames(
            r#"[{"id":3,"type":"event","event":{"result":"on","listeners":{"all":false}}},
                {"type":"auth_ok","ha_version":"2024.1.0"}]"#,
        )
        .unwrap();
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            IncomingFrame::Event { id, event } => {
                assert_eq!(*id, 3);
                assert_eq!(event.clone().outcome(), EventOutcome::Rendered("on".to_string()));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_typed_results_become_text() {
        let body = EventBody::Rendered { result: json!(21.5) };
        assert_eq!(body.outcome(), EventOutcome::Rendered("21.5".to_string()));
    }

    #[test]
    fn test_error_levels() {
        let error = EventBody::RenderError {
            error: "UndefinedError".to_string(),
            level: Some("ERROR".to_string()),
        };
        let warning = EventBody::RenderError {
            error: "deprecated".to_string(),
            level: Some("WARNING".to_string()),
        };
        assert_eq!(error.outcome(), EventOutcome::Failed("UndefinedError".to_string()));
        assert_eq!(warning.outcome(), EventOutcome::Warning("deprecated".to_string()));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_frames("not json").is_err());
        assert!(decode_frames(r#"{"type":"mystery"}"#).is_err());
    }
}
