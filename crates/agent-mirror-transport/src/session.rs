//! One long-lived streaming GET and its lifecycle.
//!
//! `TransportSession::connect` spawns a read task that feeds the response
//! body into a [`FrameDecoder`] and reports progress as [`TransportEvent`]s
//! on an unbounded channel. The session never reconnects on its own.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Buf, BytesMut};
use futures::StreamExt;
use reqwest::Url;
use reqwest::header::HeaderMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::TransportError;
use crate::headers::build_headers;
use crate::sse::{Frame, FrameDecoder};

/// Lifecycle of a transport session.
///
/// `Idle -> Connecting -> Open -> Receiving -> Closed`, with `Error`
/// reachable from `Connecting` and `Receiving`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Receiving,
    Closed,
    Error,
}

/// What the read task reports, in arrival order.
#[derive(Debug)]
pub enum TransportEvent {
    /// Response headers arrived with a success status.
    Opened,
    Frame(Frame),
    Error(TransportError),
    /// Sent at most once per session.
    Closed,
}

/// A fully resolved streaming request.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: Url,
    pub headers: HeaderMap,
}

impl StreamRequest {
    /// Resolve the event URL and headers for a server.
    ///
    /// # Errors
    /// Returns the URL or header error.
    pub fn from_config(config: &ServerConfig) -> Result<Self, TransportError> {
        Ok(Self {
            url: config.event_url()?,
            headers: build_headers(config)?,
        })
    }
}

/// HTTP client for a server's event feed.
///
/// Only the connect phase is bounded; the stream itself has no timeout.
///
/// # Errors
/// Returns `TransportError::Request` when the client cannot be built.
pub fn build_client(config: &ServerConfig) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = config.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    Ok(builder.build()?)
}

#[derive(Debug)]
struct EmitterState {
    state: ConnectionState,
    closed: bool,
    closed_sent: bool,
}

/// Channel sender guarded by the closed flag.
///
/// Every send happens under the same lock that `close` takes, so nothing
/// can be queued after `Closed`.
#[derive(Debug)]
struct Emitter {
    id: Uuid,
    tx: mpsc::UnboundedSender<TransportEvent>,
    inner: Mutex<EmitterState>,
}

impl Emitter {
    fn lock(&self) -> MutexGuard<'_, EmitterState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        self.lock().state
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn transition(&self, next: ConnectionState) {
        let mut inner = self.lock();
        if !inner.closed && inner.state != next {
            tracing::trace!(connection = %self.id, from = ?inner.state, to = ?next, "Transport state");
            inner.state = next;
        }
    }

    /// Send unless closed. Returns false once the session is closed.
    fn emit(&self, event: TransportEvent) -> bool {
        let inner = self.lock();
        if inner.closed {
            return false;
        }
        let _ = self.tx.send(event);
        true
    }

    fn opened(&self) -> bool {
        self.transition(ConnectionState::Open);
        self.emit(TransportEvent::Opened)
    }

    fn fail(&self, error: TransportError) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        tracing::warn!(connection = %self.id, error = %error, "Event stream failed");
        inner.state = ConnectionState::Error;
        let _ = self.tx.send(TransportEvent::Error(error));
    }

    /// Mark closed and deliver `Closed` if it has not been delivered yet.
    fn finish(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.state = ConnectionState::Closed;
        if !inner.closed_sent {
            inner.closed_sent = true;
            let _ = self.tx.send(TransportEvent::Closed);
        }
    }
}

/// Accumulates raw chunks into text without splitting a UTF-8 sequence.
#[derive(Debug, Default)]
struct Utf8Buffer {
    pending: BytesMut,
}

impl Utf8Buffer {
    /// Append `chunk`, moving every complete character into `body`.
    fn push(&mut self, chunk: &[u8], body: &mut String) {
        self.pending.extend_from_slice(chunk);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                body.push_str(text);
                self.pending.clear();
            }
            Err(error) if error.error_len().is_none() => {
                // Incomplete sequence at the end; keep it for the next chunk.
                let valid = error.valid_up_to();
                body.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                self.pending.advance(valid);
            }
            Err(_) => {
                body.push_str(&String::from_utf8_lossy(&self.pending));
                self.pending.clear();
            }
        }
    }
}

/// Handle to one streaming connection.
///
/// Dropping the handle closes the session.
#[derive(Debug)]
pub struct TransportSession {
    emitter: Arc<Emitter>,
    task: Option<JoinHandle<()>>,
}

impl TransportSession {
    /// Open the event stream for `config`.
    ///
    /// Construction failures (malformed URL, bad header) are reported as a
    /// `TransportEvent::Error` on the returned channel rather than returned.
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn connect(
        client: reqwest::Client,
        config: &ServerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (mut session, rx) = Self::idle();
        match StreamRequest::from_config(config) {
            Ok(request) => session.start(client, request),
            Err(error) => session.emitter.fail(error),
        }
        (session, rx)
    }

    fn idle() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = Arc::new(Emitter {
            id: Uuid::new_v4(),
            tx,
            inner: Mutex::new(EmitterState {
                state: ConnectionState::Idle,
                closed: false,
                closed_sent: false,
            }),
        });
        (
            Self {
                emitter,
                task: None,
            },
            rx,
        )
    }

    fn start(&mut self, client: reqwest::Client, request: StreamRequest) {
        self.emitter.transition(ConnectionState::Connecting);
        tracing::info!(connection = %self.emitter.id, url = %request.url, "Opening event stream");
        let emitter = Arc::clone(&self.emitter);
        self.task = Some(tokio::spawn(read_stream(emitter, client, request)));
    }

    /// Connection id used in log lines.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.emitter.id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.emitter.state()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.emitter.is_closed()
    }

    /// Stop the session.
    ///
    /// Safe to call repeatedly or before the stream opened. After it returns
    /// no `Frame` or `Error` event is sent, and `Closed` has been sent
    /// exactly once.
    pub fn close(&mut self) {
        if !self.emitter.is_closed() {
            tracing::info!(connection = %self.emitter.id, "Closing event stream");
        }
        self.emitter.finish();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_stream(emitter: Arc<Emitter>, client: reqwest::Client, request: StreamRequest) {
    let response = match client.get(request.url).headers(request.headers).send().await {
        Ok(response) => response,
        Err(error) => {
            emitter.fail(TransportError::Request(error));
            return;
        }
    };

    let status = response.status();
    if !(200..400).contains(&status.as_u16()) {
        let body = response.text().await.unwrap_or_default();
        emitter.fail(TransportError::Status {
            status: status.as_u16(),
            body,
        });
        return;
    }

    if !emitter.opened() {
        return;
    }
    tracing::info!(connection = %emitter.id, status = status.as_u16(), "Event stream open");

    let mut chunks = response.bytes_stream();
    let mut utf8 = Utf8Buffer::default();
    let mut decoder = FrameDecoder::new();
    let mut body = String::new();

    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                emitter.fail(TransportError::Request(error));
                return;
            }
        };
        if chunk.is_empty() {
            continue;
        }

        emitter.transition(ConnectionState::Receiving);
        utf8.push(&chunk, &mut body);
        for frame in decoder.decode(&body) {
            if !emitter.emit(TransportEvent::Frame(frame)) {
                return;
            }
        }
        decoder.compact(&mut body);
    }

    tracing::info!(connection = %emitter.id, "Event stream ended");
    emitter.finish();
}
