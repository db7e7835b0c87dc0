//! One event-stream connection per store.

use std::sync::Arc;

use agent_mirror_core::{Ingest, MirrorStore, Scope};
use agent_mirror_transport::{ServerConfig, TransportEvent, TransportSession};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// A live transport plus the task folding its frames into the store.
struct Connection {
    generation: u64,
    transport: TransportSession,
    pump: JoinHandle<()>,
}

impl Connection {
    /// Close the transport and invalidate its generation.
    fn shutdown(self, store: &MirrorStore) {
        let generation = self.generation;
        tracing::info!(generation, connection = %self.transport.id(), "Closing subscription");
        drop(self);
        store.end_subscription(generation);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.transport.close();
        self.pump.abort();
    }
}

/// Opens and closes the event stream that feeds a [`MirrorStore`].
///
/// `subscribe` is a sequence point: the previous connection is fully
/// closed before the next one opens, so at most one connection feeds the
/// store at any time.
pub struct EventSubscriber {
    store: Arc<MirrorStore>,
    client: reqwest::Client,
    active: Mutex<Option<Connection>>,
}

impl EventSubscriber {
    #[must_use]
    pub fn new(store: Arc<MirrorStore>, client: reqwest::Client) -> Self {
        Self {
            store,
            client,
            active: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MirrorStore> {
        &self.store
    }

    /// Open the event stream for `config`, scoped to its directory and
    /// optionally one session. Returns the store generation of the new
    /// connection.
    ///
    /// Connection failures are not returned; they are logged, recorded in
    /// the store diagnostics and leave the connection flag off.
    pub async fn subscribe(&self, config: &ServerConfig, session_id: Option<&str>) -> u64 {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.shutdown(&self.store);
        }

        let mut scope = Scope::directory(config.directory.clone());
        if let Some(session_id) = session_id {
            scope = scope.with_session(session_id);
        }
        tracing::info!(
            directory = %config.directory,
            session = session_id.unwrap_or("-"),
            "Subscribing to events"
        );

        let generation = self.store.begin_subscription(scope);
        let (transport, events) = TransportSession::connect(self.client.clone(), config);
        let pump = tokio::spawn(pump(Arc::clone(&self.store), generation, events));

        *active = Some(Connection {
            generation,
            transport,
            pump,
        });
        generation
    }

    /// Close the active connection, if any. Safe to call repeatedly.
    pub async fn close(&self) {
        if let Some(connection) = self.active.lock().await.take() {
            connection.shutdown(&self.store);
        }
    }

    /// Generation of the active connection.
    pub async fn active_generation(&self) -> Option<u64> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|connection| connection.generation)
    }
}

/// Fold transport events into the store until the connection ends.
async fn pump(
    store: Arc<MirrorStore>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Opened => store.set_connected(generation, true),
            TransportEvent::Frame(frame) => match store.ingest(generation, &frame.data) {
                Ingest::Stale => break,
                Ingest::Applied(kind) => {
                    tracing::trace!(generation, frame = %frame.event, kind = %kind, "Applied event");
                }
                _ => {}
            },
            TransportEvent::Error(error) => {
                tracing::debug!(generation, error = %error, "Recording transport error");
                store.set_connected(generation, false);
                store.record_transport_error(generation, error.diagnostic());
            }
            TransportEvent::Closed => {
                store.set_connected(generation, false);
                break;
            }
        }
    }
}
