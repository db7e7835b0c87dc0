//! Observation scope for an event subscription.

use serde::{Deserialize, Serialize};

/// The (directory, session) pair that decides which events are applied.
///
/// Either half may be absent: no directory disables the directory filter,
/// no session accepts events for every session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Working directory the projection mirrors.
    pub directory: Option<String>,

    /// Session the subscription is narrowed to.
    pub session_id: Option<String>,
}

impl Scope {
    /// Create a scope covering every session in a directory.
    #[must_use]
    pub fn directory(directory: impl Into<String>) -> Self {
        Self {
            directory: Some(directory.into()),
            session_id: None,
        }
    }

    /// Narrow the scope to one session.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Directory with trailing separators stripped.
    #[must_use]
    pub fn normalized_directory(&self) -> Option<&str> {
        self.directory.as_deref().map(normalize_directory)
    }
}

/// Strip trailing `/` separators.
#[must_use]
pub fn normalize_directory(value: &str) -> &str {
    value.trim_end_matches('/')
}
