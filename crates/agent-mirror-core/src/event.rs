//! Typed server events and the envelope they arrive in.

use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

use crate::model::{FileDiff, Message, Part, PermissionRequest, Session};

/// Frame payload decode error.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("event has no type tag")]
    MissingType,
    #[error("malformed `{kind}` event: {source}")]
    Properties {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Session-addressed notifications that are routed but not folded into the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    SessionStatus,
    SessionError,
    QuestionAsked,
    QuestionReplied,
    QuestionRejected,
    TodoUpdated,
}

impl NoticeKind {
    fn parse(kind: &str) -> Option<Self> {
        Some(match kind {
            "session.status" => Self::SessionStatus,
            "session.error" => Self::SessionError,
            "question.asked" => Self::QuestionAsked,
            "question.replied" => Self::QuestionReplied,
            "question.rejected" => Self::QuestionRejected,
            "todo.updated" => Self::TodoUpdated,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionStatus => "session.status",
            Self::SessionError => "session.error",
            Self::QuestionAsked => "question.asked",
            Self::QuestionReplied => "question.replied",
            Self::QuestionRejected => "question.rejected",
            Self::TodoUpdated => "todo.updated",
        }
    }
}

/// A decoded server event.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ServerConnected,
    SessionCreated {
        info: Session,
    },
    SessionUpdated {
        info: Session,
    },
    SessionDeleted {
        info: Session,
    },
    SessionDiff {
        session_id: String,
        diff: Vec<FileDiff>,
    },
    MessageUpdated {
        info: Message,
    },
    MessagePartUpdated {
        part: Part,
        delta: Option<String>,
    },
    MessagePartRemoved {
        session_id: Option<String>,
        message_id: String,
        part_id: String,
    },
    PermissionAsked(PermissionRequest),
    PermissionReplied {
        session_id: String,
        request_id: String,
        reply: Option<String>,
    },
    Notice {
        kind: NoticeKind,
        session_id: Option<String>,
        properties: Value,
    },
    /// Any type tag this client does not know about.
    Unknown {
        kind: String,
        properties: Value,
    },
}

#[derive(Deserialize)]
struct InfoProps<T> {
    info: T,
}

#[derive(Deserialize)]
struct DiffProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(default)]
    diff: Vec<FileDiff>,
}

#[derive(Deserialize)]
struct PartUpdatedProps {
    part: Part,
    #[serde(default)]
    delta: Option<String>,
}

#[derive(Deserialize)]
struct PartRemovedProps {
    #[serde(rename = "sessionID", default)]
    session_id: Option<String>,
    #[serde(rename = "messageID")]
    message_id: String,
    #[serde(rename = "partID")]
    part_id: String,
}

#[derive(Deserialize)]
struct PermissionRepliedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "requestID")]
    request_id: String,
    #[serde(default)]
    reply: Option<String>,
}

fn props<T: DeserializeOwned>(kind: &str, properties: Value) -> Result<T, DecodeError> {
    serde_json::from_value(properties).map_err(|source| DecodeError::Properties {
        kind: kind.to_owned(),
        source,
    })
}

impl ServerEvent {
    /// Build a typed event from its `type` tag and `properties` object.
    ///
    /// # Errors
    /// Returns error if a known event's properties do not match its shape.
    pub fn from_parts(kind: &str, properties: Value) -> Result<Self, DecodeError> {
        let event = match kind {
            "server.connected" => Self::ServerConnected,
            "session.created" => Self::SessionCreated {
                info: props::<InfoProps<Session>>(kind, properties)?.info,
            },
            "session.updated" => Self::SessionUpdated {
                info: props::<InfoProps<Session>>(kind, properties)?.info,
            },
            "session.deleted" => Self::SessionDeleted {
                info: props::<InfoProps<Session>>(kind, properties)?.info,
            },
            "session.diff" => {
                let DiffProps { session_id, diff } = props(kind, properties)?;
                Self::SessionDiff { session_id, diff }
            }
            "message.updated" => Self::MessageUpdated {
                info: props::<InfoProps<Message>>(kind, properties)?.info,
            },
            "message.part.updated" => {
                let PartUpdatedProps { part, delta } = props(kind, properties)?;
                Self::MessagePartUpdated { part, delta }
            }
            "message.part.removed" => {
                let PartRemovedProps {
                    session_id,
                    message_id,
                    part_id,
                } = props(kind, properties)?;
                Self::MessagePartRemoved {
                    session_id,
                    message_id,
                    part_id,
                }
            }
            "permission.asked" => Self::PermissionAsked(props(kind, properties)?),
            "permission.replied" => {
                let PermissionRepliedProps {
                    session_id,
                    request_id,
                    reply,
                } = props(kind, properties)?;
                Self::PermissionReplied {
                    session_id,
                    request_id,
                    reply,
                }
            }
            other => match NoticeKind::parse(other) {
                Some(kind) => {
                    let session_id = properties
                        .get("sessionID")
                        .and_then(Value::as_str)
                        .map(ToOwned::to_owned);
                    Self::Notice {
                        kind,
                        session_id,
                        properties,
                    }
                }
                None => Self::Unknown {
                    kind: other.to_owned(),
                    properties,
                },
            },
        };
        Ok(event)
    }

    /// Wire type tag.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::ServerConnected => "server.connected",
            Self::SessionCreated { .. } => "session.created",
            Self::SessionUpdated { .. } => "session.updated",
            Self::SessionDeleted { .. } => "session.deleted",
            Self::SessionDiff { .. } => "session.diff",
            Self::MessageUpdated { .. } => "message.updated",
            Self::MessagePartUpdated { .. } => "message.part.updated",
            Self::MessagePartRemoved { .. } => "message.part.removed",
            Self::PermissionAsked(_) => "permission.asked",
            Self::PermissionReplied { .. } => "permission.replied",
            Self::Notice { kind, .. } => kind.as_str(),
            Self::Unknown { kind, .. } => kind,
        }
    }
}

/// An event plus the directory marker from its outer envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub directory: Option<String>,
    pub event: ServerEvent,
}

impl EventEnvelope {
    /// Parse a frame's data payload.
    ///
    /// The payload is either the event itself or an object wrapping it under
    /// `payload`, with an optional sibling `directory`.
    ///
    /// # Errors
    /// Returns error if the payload is not a JSON object carrying a typed event.
    pub fn parse(data: &str) -> Result<Self, DecodeError> {
        let mut value: Value = serde_json::from_str(data)?;
        let object = value.as_object_mut().ok_or(DecodeError::NotAnObject)?;

        let directory = object
            .get("directory")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);

        let mut payload = match object.remove("payload") {
            Some(payload) => payload,
            None => value,
        };
        let payload = payload.as_object_mut().ok_or(DecodeError::NotAnObject)?;

        let kind = match payload.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(DecodeError::MissingType),
        };
        let properties = payload
            .remove("properties")
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        Ok(Self {
            directory,
            event: ServerEvent::from_parts(&kind, properties)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wrapped_envelope() {
        let envelope = EventEnvelope::parse(
            r#"{"directory":"/repo/","payload":{"type":"session.diff","properties":{"sessionID":"s1","diff":[{"file":"a.ts","additions":1,"deletions":0}]}}}"#,
        )
        .unwrap();
        assert_eq!(envelope.directory.as_deref(), Some("/repo/"));
        let ServerEvent::SessionDiff { session_id, diff } = envelope.event else {
            panic!("expected session.diff");
        };
        assert_eq!(session_id, "s1");
        assert_eq!(diff[0].file, "a.ts");
    }

    #[test]
    fn test_parse_bare_event() {
        let envelope = EventEnvelope::parse(r#"{"type":"server.connected","properties":{}}"#).unwrap();
        assert_eq!(envelope.directory, None);
        assert_eq!(envelope.event, ServerEvent::ServerConnected);
    }

    #[test]
    fn test_part_delta_is_optional() {
        let envelope = EventEnvelope::parse(
            r#"{"type":"message.part.updated","properties":{"part":{"id":"p1","sessionID":"s1","messageID":"m1","type":"text","text":""},"delta":"Hi"}}"#,
        )
        .unwrap();
        assert!(matches!(
            envelope.event,
            ServerEvent::MessagePartUpdated { delta: Some(ref delta), .. } if delta == "Hi"
        ));
    }

    #[test]
    fn test_notice_keeps_session_id() {
        let envelope = EventEnvelope::parse(
            r#"{"type":"session.status","properties":{"sessionID":"s1","status":{"type":"busy"}}}"#,
        )
        .unwrap();
        assert_eq!(envelope.event.kind(), "session.status");
        assert!(matches!(
            envelope.event,
            ServerEvent::Notice { session_id: Some(ref id), .. } if id == "s1"
        ));
    }

    #[test]
    fn test_unknown_type_is_preserved() {
        let envelope =
            EventEnvelope::parse(r#"{"type":"lsp.updated","properties":{"x":1}}"#).unwrap();
        assert_eq!(envelope.event.kind(), "lsp.updated");
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(EventEnvelope::parse("not json"), Err(DecodeError::Json(_))));
        assert!(matches!(EventEnvelope::parse("[1,2]"), Err(DecodeError::NotAnObject)));
        assert!(matches!(
            EventEnvelope::parse(r#"{"properties":{}}"#),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(
            EventEnvelope::parse(r#"{"type":"message.updated","properties":{"info":{"id":1}}}"#),
            Err(DecodeError::Properties { .. })
        ));
    }
}
