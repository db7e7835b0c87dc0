//! Server-side entities mirrored by the projection.
//!
//! Field names follow the server's JSON (camelCase with `ID` suffixes).
//! Unknown fields are kept in each struct's `extra` map so they survive a
//! round trip untouched.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
use serde_json::{Map, Value};

/// Creation/update timestamps in Unix milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
}

/// Revert pointer into a session's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRevert {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "partID", default, skip_serializing_if = "Option::is_none")]
    pub part_id: Option<String>,
}

/// Public share link for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionShare {
    pub url: String,
}

/// A unit of conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(rename = "projectID", default)]
    pub project_id: String,
    #[serde(default)]
    pub directory: String,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub time: SessionTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert: Option<SessionRevert>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<SessionShare>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Session {
    /// Minimal session, mostly useful for tests and optimistic inserts.
    #[must_use]
    pub fn new(id: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slug: String::new(),
            project_id: String::new(),
            directory: directory.into(),
            parent_id: None,
            title: String::new(),
            version: String::new(),
            time: SessionTime::default(),
            revert: None,
            share: None,
            extra: Map::new(),
        }
    }

    /// Share URL, if the session is shared.
    #[must_use]
    pub fn share_url(&self) -> Option<&str> {
        self.share.as_ref().map(|share| share.url.as_str())
    }
}

/// Message timestamps in Unix milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTokens {
    #[serde(default)]
    pub read: u64,
    #[serde(default)]
    pub write: u64,
}

/// Token accounting for one assistant turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub reasoning: u64,
    #[serde(default)]
    pub cache: CacheTokens,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePath {
    pub cwd: String,
    pub root: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(default)]
    pub time: MessageTime,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(default)]
    pub time: MessageTime,
    #[serde(rename = "modelID", default)]
    pub model_id: String,
    #[serde(rename = "providerID", default)]
    pub provider_id: String,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<MessagePath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A message, discriminated by `role`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
}

impl Message {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::User(message) => &message.id,
            Self::Assistant(message) => &message.id,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::User(message) => &message.session_id,
            Self::Assistant(message) => &message.session_id,
        }
    }

    /// Creation time in Unix milliseconds.
    #[must_use]
    pub const fn created(&self) -> i64 {
        match self {
            Self::User(message) => message.time.created,
            Self::Assistant(message) => message.time.created,
        }
    }

    #[must_use]
    pub const fn is_assistant(&self) -> bool {
        matches!(self, Self::Assistant(_))
    }
}

/// A message together with its parts, as returned by the message listing call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageWithParts {
    pub info: Message,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartTime {
    #[serde(default)]
    pub start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

/// Streamed assistant or user text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPart {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<PartTime>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningPart {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<PartTime>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Lifecycle of a tool invocation.
///
/// A status this client does not know is kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolState {
    Pending {
        #[serde(default)]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw: Option<String>,
    },
    Running {
        #[serde(default)]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Completed {
        #[serde(default)]
        input: Value,
        #[serde(default)]
        output: String,
        #[serde(default)]
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Error {
        #[serde(default)]
        input: Value,
        #[serde(default)]
        error: String,
    },
    #[serde(skip)]
    Other(Value),
}

impl ToolState {
    /// Wire value of `status`.
    #[must_use]
    pub fn status(&self) -> &str {
        match self {
            Self::Pending { .. } => "pending",
            Self::Running { .. } => "running",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
            Self::Other(value) => value.get("status").and_then(Value::as_str).unwrap_or(""),
        }
    }
}

/// Field codec for [`ToolState`] that routes unknown statuses to `Other`.
mod tool_state {
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
    use serde_json::Value;

    use super::ToolState;

    pub fn serialize<S: Serializer>(state: &ToolState, serializer: S) -> Result<S::Ok, S::Error> {
        match state {
            ToolState::Other(value) => value.serialize(serializer),
            known => known.serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ToolState, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let known = matches!(
            value.get("status").and_then(Value::as_str),
            Some("pending" | "running" | "completed" | "error")
        );
        if known {
            ToolState::deserialize(value).map_err(D::Error::custom)
        } else {
            Ok(ToolState::Other(value))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPart {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "callID", default)]
    pub call_id: String,
    #[serde(default)]
    pub tool: String,
    #[serde(with = "tool_state")]
    pub state: ToolState,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Any part kind the mirror does not model. Passed through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpaquePart {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Smallest unit of message content, discriminated by `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(TextPart),
    Reasoning(ReasoningPart),
    Tool(ToolPart),
    Other(OpaquePart),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TaggedPart {
    Text(TextPart),
    Reasoning(ReasoningPart),
    Tool(ToolPart),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TaggedPartRef<'a> {
    Text(&'a TextPart),
    Reasoning(&'a ReasoningPart),
    Tool(&'a ToolPart),
}

impl Part {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Text(part) => &part.id,
            Self::Reasoning(part) => &part.id,
            Self::Tool(part) => &part.id,
            Self::Other(part) => &part.id,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::Text(part) => &part.session_id,
            Self::Reasoning(part) => &part.session_id,
            Self::Tool(part) => &part.session_id,
            Self::Other(part) => &part.session_id,
        }
    }

    #[must_use]
    pub fn message_id(&self) -> &str {
        match self {
            Self::Text(part) => &part.message_id,
            Self::Reasoning(part) => &part.message_id,
            Self::Tool(part) => &part.message_id,
            Self::Other(part) => &part.message_id,
        }
    }

    /// Wire discriminant (`text`, `tool`, ...).
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Text(_) => "text",
            Self::Reasoning(_) => "reasoning",
            Self::Tool(_) => "tool",
            Self::Other(part) => &part.kind,
        }
    }

    /// Accumulated text for text parts.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(part) => Some(&part.text),
            _ => None,
        }
    }
}

impl Serialize for Part {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Text(part) => TaggedPartRef::Text(part).serialize(serializer),
            Self::Reasoning(part) => TaggedPartRef::Reasoning(part).serialize(serializer),
            Self::Tool(part) => TaggedPartRef::Tool(part).serialize(serializer),
            Self::Other(part) => part.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let known = matches!(
            value.get("type").and_then(Value::as_str),
            Some("text" | "reasoning" | "tool")
        );

        if known {
            let tagged = TaggedPart::deserialize(value).map_err(D::Error::custom)?;
            Ok(match tagged {
                TaggedPart::Text(part) => Self::Text(part),
                TaggedPart::Reasoning(part) => Self::Reasoning(part),
                TaggedPart::Tool(part) => Self::Tool(part),
            })
        } else {
            OpaquePart::deserialize(value)
                .map(Self::Other)
                .map_err(D::Error::custom)
        }
    }
}

/// A pending approval prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(default)]
    pub permission: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub always: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-file change summary for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub file: String,
    #[serde(default)]
    pub before: String,
    #[serde(default)]
    pub after: String,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialized: Option<i64>,
}

/// A server-side project (one worktree).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub worktree: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcs: Option<String>,
    #[serde(default)]
    pub time: ProjectTime,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Provider/model pair used for prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

/// A model provider and the models it offers, keyed by model id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub models: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Provider {
    #[must_use]
    pub fn has_model(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }
}
