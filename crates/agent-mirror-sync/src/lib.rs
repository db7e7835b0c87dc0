//! Keeps a [`MirrorStore`](agent_mirror_core::MirrorStore) in sync with a server.
//!
//! Provides:
//! - `EventSubscriber` - Subscribe/close lifecycle of the event stream
//! - `ServerApi` - Boundary to the one-shot request/response client
//! - `Workspace` - One-shot results merged into the store with error markers

pub mod api;
pub mod subscriber;
pub mod workspace;

pub use api::{ApiError, CreateSession, PermissionReply, PromptRequest, ServerApi};
pub use subscriber::EventSubscriber;
pub use workspace::{Workspace, WorkspaceError};
