//! Boundary to the one-shot request/response client.

use agent_mirror_core::{
    FileDiff, MessageWithParts, ModelRef, PermissionRequest, Project, Provider, Session,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a one-shot call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Server unavailable: {0}")]
    Unavailable(String),
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Answer to a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionReply {
    Once,
    Always,
    Reject,
}

impl PermissionReply {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Always => "always",
            Self::Reject => "reject",
        }
    }
}

/// Options for creating a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSession {
    /// Falls back to the current project's worktree.
    pub directory: Option<String>,
    pub title: Option<String>,
    pub parent_id: Option<String>,
}

/// A text prompt for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub session_id: String,
    pub directory: Option<String>,
    pub model: Option<ModelRef>,
    pub text: String,
}

/// One-shot server calls.
///
/// Results are merged into the store by `Workspace`; implementations only
/// transport them.
#[async_trait]
pub trait ServerApi: Send + Sync {
    async fn list_projects(&self, directory: Option<&str>) -> Result<Vec<Project>, ApiError>;

    async fn list_providers(&self, directory: Option<&str>) -> Result<Vec<Provider>, ApiError>;

    async fn list_sessions(&self, directory: &str) -> Result<Vec<Session>, ApiError>;

    /// `directory` is `request.directory` or the current project worktree.
    async fn create_session(&self, directory: &str, request: &CreateSession) -> Result<Session, ApiError>;

    /// Returns the assistant reply.
    async fn prompt(&self, request: &PromptRequest) -> Result<MessageWithParts, ApiError>;

    async fn list_messages(
        &self,
        session_id: &str,
        directory: Option<&str>,
    ) -> Result<Vec<MessageWithParts>, ApiError>;

    async fn abort(&self, session_id: &str, directory: Option<&str>) -> Result<bool, ApiError>;

    async fn revert(
        &self,
        session_id: &str,
        message_id: &str,
        part_id: Option<&str>,
        directory: Option<&str>,
    ) -> Result<Session, ApiError>;

    async fn unrevert(&self, session_id: &str, directory: Option<&str>) -> Result<Session, ApiError>;

    async fn diff(&self, session_id: &str, directory: Option<&str>) -> Result<Vec<FileDiff>, ApiError>;

    async fn summarize(&self, session_id: &str, directory: Option<&str>) -> Result<bool, ApiError>;

    async fn list_permissions(
        &self,
        directory: Option<&str>,
    ) -> Result<Vec<PermissionRequest>, ApiError>;

    async fn reply_permission(
        &self,
        request_id: &str,
        reply: PermissionReply,
        directory: Option<&str>,
    ) -> Result<bool, ApiError>;

    async fn share(&self, session_id: &str, directory: Option<&str>) -> Result<Session, ApiError>;

    async fn unshare(&self, session_id: &str, directory: Option<&str>) -> Result<Session, ApiError>;
}
