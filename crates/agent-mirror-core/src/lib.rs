//! Core of the agent session mirror.
//!
//! This crate provides the pure building blocks:
//! - `model` - Sessions, messages, parts, permissions and diffs as sent by the server
//! - `ServerEvent` / `EventEnvelope` - Typed server events and their wire envelope
//! - `route` - Directory/session scope filtering
//! - `Projection` - Canonical collections and the per-event merge rules
//! - `MirrorStore` - Serialized apply path plus change notification
//!
//! Nothing here performs I/O; frames come in from the transport crate.

pub mod event;
pub mod model;
pub mod projection;
pub mod router;
pub mod scope;
pub mod store;

mod reconcile;

pub use event::{DecodeError, EventEnvelope, NoticeKind, ServerEvent};
pub use model::{
    FileDiff, Message, MessageWithParts, ModelRef, Part, PermissionRequest, Project, Provider, Session,
};
pub use projection::Projection;
pub use router::{Rejection, route};
pub use scope::Scope;
pub use store::{ChangeKind, Diagnostics, Ingest, MirrorStore, StoreChange};

/// Error marker for an unreachable server or failed one-shot call.
pub const ERR_SERVER_UNAVAILABLE: &str = "ERR SERVER UNAVAILABLE";
/// Error marker when the client is flagged offline.
pub const ERR_OFFLINE: &str = "ERR OFFLINE";
/// Error marker for a call missing required context (e.g. no project).
pub const ERR_INVALID_COMMAND: &str = "ERR INVALID COMMAND";
