//! Projection store with a serialized apply path and change broadcast.

use std::{
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{SystemTime, UNIX_EPOCH},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    event::EventEnvelope,
    model::{FileDiff, Message, Part, PermissionRequest, Session},
    projection::Projection,
    router::{Rejection, route},
    scope::Scope,
};

/// Capacity of the change broadcast. Slow observers skip ahead.
const CHANGE_CAPACITY: usize = 1024;

/// What caused a store change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// A server event was applied; carries its type tag.
    Event(String),
    /// The connection flag flipped.
    Connection(bool),
    /// A one-shot fetch result was merged.
    Merge(&'static str),
    /// The store was reset.
    Reset,
}

/// One change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    /// Monotonic counter, one per change.
    pub revision: u64,
    pub kind: ChangeKind,
}

/// Counters for diagnosing the event feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub event_count: u64,
    pub last_event_type: Option<String>,
    /// Unix milliseconds of the last applied event.
    pub last_event_at: Option<i64>,
    pub rejected_count: u64,
    pub malformed_count: u64,
    pub stale_count: u64,
    pub last_transport_error: Option<String>,
}

/// Outcome of feeding one frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    /// Accepted and folded; carries the event type.
    Applied(String),
    /// Accepted but nothing to fold (notice, unknown kind, keepalive).
    Ignored,
    /// Filtered out by scope.
    Rejected(Rejection),
    /// Could not be decoded; dropped.
    Malformed(String),
    /// Belongs to a connection that has since been replaced or closed.
    Stale,
}

struct Inner {
    projection: Projection,
    scope: Scope,
    generation: u64,
    subscribed: bool,
    connected: bool,
    revision: u64,
    diagnostics: Diagnostics,
}

impl Inner {
    fn new() -> Self {
        Self {
            projection: Projection::new(),
            scope: Scope::default(),
            generation: 0,
            subscribed: false,
            connected: false,
            revision: 0,
            diagnostics: Diagnostics::default(),
        }
    }

    fn is_live(&self, generation: u64) -> bool {
        self.subscribed && self.generation == generation
    }

    fn next_change(&mut self, kind: ChangeKind) -> StoreChange {
        self.revision += 1;
        StoreChange {
            revision: self.revision,
            kind,
        }
    }
}

/// Owner of the projection.
///
/// All mutation goes through `&self` methods that hold one write lock for
/// the whole decode-route-apply sequence, so two frames are never folded
/// concurrently and arrival order is preserved. Observers get one
/// [`StoreChange`] per mutation.
pub struct MirrorStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<StoreChange>,
}

impl Default for MirrorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MirrorStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: RwLock::new(Inner::new()),
            sender,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, change: StoreChange) {
        let _ = self.sender.send(change); // no observers is fine
    }

    /// Clear the projection, scope and connection state.
    ///
    /// Any open connection's generation is invalidated.
    pub fn reset(&self) {
        let change = {
            let mut inner = self.write();
            let generation = inner.generation + 1;
            let revision = inner.revision;
            *inner = Inner::new();
            inner.generation = generation;
            inner.revision = revision;
            inner.next_change(ChangeKind::Reset)
        };
        self.notify(change);
    }

    /// Start a new subscription scope and return its generation.
    ///
    /// Frames tagged with any earlier generation are dropped from here on.
    pub fn begin_subscription(&self, scope: Scope) -> u64 {
        let mut inner = self.write();
        inner.generation += 1;
        inner.subscribed = true;
        inner.connected = false;
        inner.scope = scope;
        inner.generation
    }

    /// End the subscription with the given generation.
    ///
    /// Keeps the directory but forgets the session filter. A no-op if a
    /// newer subscription has already taken over.
    pub fn end_subscription(&self, generation: u64) {
        let change = {
            let mut inner = self.write();
            if !inner.is_live(generation) {
                return;
            }
            inner.generation += 1;
            inner.subscribed = false;
            inner.scope.session_id = None;
            let was_connected = std::mem::replace(&mut inner.connected, false);
            was_connected.then(|| inner.next_change(ChangeKind::Connection(false)))
        };
        if let Some(change) = change {
            self.notify(change);
        }
    }

    /// Update the connection flag for a live subscription.
    pub fn set_connected(&self, generation: u64, connected: bool) {
        let change = {
            let mut inner = self.write();
            if !inner.is_live(generation) || inner.connected == connected {
                return;
            }
            inner.connected = connected;
            inner.next_change(ChangeKind::Connection(connected))
        };
        self.notify(change);
    }

    /// Record a transport failure for a live subscription.
    pub fn record_transport_error(&self, generation: u64, error: impl Into<String>) {
        let mut inner = self.write();
        if inner.is_live(generation) {
            inner.diagnostics.last_transport_error = Some(error.into());
        }
    }

    /// Decode, route and apply one frame payload.
    ///
    /// Never fails: malformed payloads and out-of-scope events are counted
    /// and reported in the returned [`Ingest`].
    pub fn ingest(&self, generation: u64, data: &str) -> Ingest {
        if data.trim().is_empty() {
            return Ingest::Ignored;
        }
        let parsed = EventEnvelope::parse(data);

        let (outcome, change) = {
            let mut inner = self.write();
            if !inner.is_live(generation) {
                inner.diagnostics.stale_count += 1;
                tracing::debug!(generation, "dropped frame from superseded connection");
                return Ingest::Stale;
            }

            let envelope = match parsed {
                Ok(envelope) => envelope,
                Err(e) => {
                    inner.diagnostics.malformed_count += 1;
                    tracing::warn!("dropped malformed event: {e}");
                    return Ingest::Malformed(e.to_string());
                }
            };

            if let Err(rejection) = route(&envelope, &inner.scope, &inner.projection) {
                inner.diagnostics.rejected_count += 1;
                tracing::debug!(kind = envelope.event.kind(), "dropped event: {rejection}");
                return Ingest::Rejected(rejection);
            }

            let kind = envelope.event.kind().to_owned();
            inner.diagnostics.event_count += 1;
            inner.diagnostics.last_event_type = Some(kind.clone());
            inner.diagnostics.last_event_at = Some(now_millis());

            if inner.projection.apply(envelope.event) {
                let change = inner.next_change(ChangeKind::Event(kind.clone()));
                (Ingest::Applied(kind), Some(change))
            } else {
                (Ingest::Ignored, None)
            }
        };

        if let Some(change) = change {
            self.notify(change);
        }
        outcome
    }

    /// Merge a one-shot fetch result through the same lock as events.
    pub fn merge<R>(&self, label: &'static str, f: impl FnOnce(&mut Projection) -> R) -> R {
        let (result, change) = {
            let mut inner = self.write();
            let result = f(&mut inner.projection);
            (result, inner.next_change(ChangeKind::Merge(label)))
        };
        self.notify(change);
        result
    }

    /// Run a read-only closure against the projection.
    pub fn read_with<R>(&self, f: impl FnOnce(&Projection) -> R) -> R {
        f(&self.read().projection)
    }

    /// Clone of the whole projection.
    #[must_use]
    pub fn snapshot(&self) -> Projection {
        self.read().projection.clone()
    }

    #[must_use]
    pub fn current_session(&self) -> Option<Session> {
        self.read_with(|p| p.current_session().cloned())
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<Session> {
        self.read_with(|p| p.sessions().to_vec())
    }

    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.read_with(|p| p.messages().to_vec())
    }

    #[must_use]
    pub fn parts(&self, message_id: &str) -> Vec<Part> {
        self.read_with(|p| p.parts(message_id).to_vec())
    }

    #[must_use]
    pub fn pending_permissions(&self) -> Vec<PermissionRequest> {
        self.read_with(|p| p.pending_permissions().to_vec())
    }

    #[must_use]
    pub fn diffs(&self) -> Vec<FileDiff> {
        self.read_with(|p| p.diffs().to_vec())
    }

    /// Whether the live connection has been opened and not yet lost.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.read().connected
    }

    #[must_use]
    pub fn scope(&self) -> Scope {
        self.read().scope.clone()
    }

    /// Generation of the current subscription, if one is active.
    #[must_use]
    pub fn active_generation(&self) -> Option<u64> {
        let inner = self.read();
        inner.subscribed.then_some(inner.generation)
    }

    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        self.read().diagnostics.clone()
    }

    /// Get a receiver for change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.sender.subscribe()
    }

    /// Stream of change notifications. Lagged notifications are skipped.
    #[must_use]
    pub fn changes(&self) -> futures::stream::BoxStream<'static, StoreChange> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    const SESSION_CREATED: &str = r#"{"type":"session.created","properties":{"info":{"id":"s1","directory":"/repo","title":"one","time":{"created":1,"updated":1}}}}"#;

    fn subscribed(scope: Scope) -> (MirrorStore, u64) {
        let store = MirrorStore::new();
        let generation = store.begin_subscription(scope);
        (store, generation)
    }

    #[test]
    fn test_ingest_applies_and_notifies() {
        let (store, generation) = subscribed(Scope::directory("/repo"));
        let mut rx = store.subscribe();

        let outcome = store.ingest(generation, SESSION_CREATED);
        assert_eq!(outcome, Ingest::Applied("session.created".to_owned()));
        assert_eq!(store.sessions().len(), 1);
        assert_eq!(store.current_session().unwrap().id, "s1");

        let change = rx.try_recv().unwrap();
        assert_eq!(change.kind, ChangeKind::Event("session.created".to_owned()));
        assert_eq!(change.revision, 1);

        let diagnostics = store.diagnostics();
        assert_eq!(diagnostics.event_count, 1);
        assert_eq!(diagnostics.last_event_type.as_deref(), Some("session.created"));
        assert!(diagnostics.last_event_at.is_some());
    }

    #[test]
    fn test_malformed_and_rejected_frames_are_counted() {
        let (store, generation) = subscribed(Scope::directory("/repo").with_session("s2"));

        assert!(matches!(store.ingest(generation, "{oops"), Ingest::Malformed(_)));
        assert!(matches!(
            store.ingest(generation, SESSION_CREATED),
            Ingest::Rejected(Rejection::SessionMismatch { .. })
        ));
        assert_eq!(store.ingest(generation, "  "), Ingest::Ignored);

        let diagnostics = store.diagnostics();
        assert_eq!(diagnostics.malformed_count, 1);
        assert_eq!(diagnostics.rejected_count, 1);
        assert_eq!(diagnostics.event_count, 0);
        assert!(store.sessions().is_empty());
    }

    #[test]
    fn test_superseded_generation_is_stale() {
        let store = MirrorStore::new();
        let old = store.begin_subscription(Scope::directory("/repo"));
        let new = store.begin_subscription(Scope::directory("/other"));
        assert_ne!(old, new);

        assert_eq!(store.ingest(old, SESSION_CREATED), Ingest::Stale);
        store.set_connected(old, true);
        assert!(!store.is_connected());
        assert!(store.sessions().is_empty());
        assert_eq!(store.diagnostics().stale_count, 1);
    }

    #[test]
    fn test_end_subscription_clears_session_scope() {
        let (store, generation) = subscribed(Scope::directory("/repo").with_session("s1"));
        store.set_connected(generation, true);
        assert!(store.is_connected());

        store.end_subscription(generation);
        store.end_subscription(generation);
        assert!(!store.is_connected());
        assert_eq!(store.scope(), Scope::directory("/repo"));
        assert_eq!(store.active_generation(), None);
        assert_eq!(store.ingest(generation, SESSION_CREATED), Ingest::Stale);
    }

    #[test]
    fn test_reset_clears_everything() {
        let (store, generation) = subscribed(Scope::directory("/repo"));
        store.ingest(generation, SESSION_CREATED);
        store.reset();

        assert!(store.sessions().is_empty());
        assert_eq!(store.scope(), Scope::default());
        assert_eq!(store.diagnostics(), Diagnostics::default());
        assert_eq!(store.ingest(generation, SESSION_CREATED), Ingest::Stale);
    }

    #[test]
    fn test_merge_notifies() {
        let store = MirrorStore::new();
        let mut changes = store.changes();
        store.merge("sessions", |p| p.merge_sessions(vec![Session::new("s1", "/repo")]));

        let change = tokio_test::block_on(changes.next()).unwrap();
        assert_eq!(change.kind, ChangeKind::Merge("sessions"));
        assert_eq!(store.sessions().len(), 1);
    }

    #[test]
    fn test_ignored_event_does_not_notify() {
        let (store, generation) = subscribed(Scope::default());
        let mut rx = store.subscribe();
        let outcome = store.ingest(generation, r#"{"type":"server.connected","properties":{}}"#);
        assert_eq!(outcome, Ingest::Ignored);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.diagnostics().last_event_type.as_deref(), Some("server.connected"));
    }
}
