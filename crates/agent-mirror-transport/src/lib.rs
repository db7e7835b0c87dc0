//! Transport layer for the server event feed.
//!
//! Provides:
//! - `FrameDecoder` - Incremental decoding of the text event-stream format
//! - `TransportSession` - One long-lived streaming GET with an explicit lifecycle
//! - `ServerConfig` - Endpoint, directory and credentials for a server

pub mod config;
pub mod error;
pub mod headers;
pub mod session;
pub mod sse;

pub use config::{DEFAULT_EVENT_PATH, ServerConfig};
pub use error::TransportError;
pub use session::{ConnectionState, StreamRequest, TransportEvent, TransportSession, build_client};
pub use sse::{Frame, FrameDecoder};
