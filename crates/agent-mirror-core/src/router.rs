//! Scope filtering for decoded events.

use std::fmt;

use crate::event::{EventEnvelope, ServerEvent};
use crate::projection::Projection;
use crate::scope::{Scope, normalize_directory};

/// Why an event was filtered out. Not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    DirectoryMismatch {
        event_directory: String,
        scope_directory: String,
    },
    SessionMismatch {
        event_session: Option<String>,
        scope_session: String,
    },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectoryMismatch {
                event_directory,
                scope_directory,
            } => write!(f, "directory mismatch ({event_directory} != {scope_directory})"),
            Self::SessionMismatch {
                event_session,
                scope_session,
            } => write!(
                f,
                "session mismatch ({} != {scope_session})",
                event_session.as_deref().unwrap_or("none")
            ),
        }
    }
}

/// Where an event says it belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Address<'a> {
    /// Not tied to a session; passes any session filter.
    Global,
    Session(Option<&'a str>),
}

/// Session addressing for every event kind.
fn address<'a>(event: &'a ServerEvent, projection: &'a Projection) -> Address<'a> {
    match event {
        ServerEvent::SessionCreated { info }
        | ServerEvent::SessionUpdated { info }
        | ServerEvent::SessionDeleted { info } => Address::Session(Some(&info.id)),
        ServerEvent::MessageUpdated { info } => Address::Session(Some(info.session_id())),
        ServerEvent::MessagePartUpdated { part, .. } => Address::Session(Some(part.session_id())),
        ServerEvent::MessagePartRemoved {
            session_id,
            message_id,
            ..
        } => Address::Session(
            projection
                .message(message_id)
                .map(crate::model::Message::session_id)
                .or(session_id.as_deref()),
        ),
        ServerEvent::SessionDiff { session_id, .. }
        | ServerEvent::PermissionReplied { session_id, .. } => Address::Session(Some(session_id)),
        ServerEvent::PermissionAsked(permission) => Address::Session(Some(&permission.session_id)),
        ServerEvent::Notice { session_id, .. } => Address::Session(session_id.as_deref()),
        ServerEvent::ServerConnected | ServerEvent::Unknown { .. } => Address::Global,
    }
}

/// Decide whether an event belongs to the observed scope.
///
/// The directory filter only applies when both the envelope and the scope
/// name a directory; trailing separators are ignored. The session filter
/// only applies when the scope names a session.
///
/// # Errors
/// Returns the reason when the event is out of scope.
pub fn route(
    envelope: &EventEnvelope,
    scope: &Scope,
    projection: &Projection,
) -> Result<(), Rejection> {
    let event_directory = envelope
        .directory
        .as_deref()
        .map(normalize_directory)
        .filter(|directory| !directory.is_empty());
    let scope_directory = scope
        .normalized_directory()
        .filter(|directory| !directory.is_empty());

    if let (Some(event_directory), Some(scope_directory)) = (event_directory, scope_directory) {
        if event_directory != scope_directory {
            return Err(Rejection::DirectoryMismatch {
                event_directory: event_directory.to_owned(),
                scope_directory: scope_directory.to_owned(),
            });
        }
    }

    let Some(scope_session) = scope.session_id.as_deref() else {
        return Ok(());
    };

    match address(&envelope.event, projection) {
        Address::Global => Ok(()),
        Address::Session(Some(session)) if session == scope_session => Ok(()),
        Address::Session(event_session) => Err(Rejection::SessionMismatch {
            event_session: event_session.map(ToOwned::to_owned),
            scope_session: scope_session.to_owned(),
        }),
    }
}
