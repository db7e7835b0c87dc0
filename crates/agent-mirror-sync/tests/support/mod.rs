//! Scripted event-stream server and store helpers shared by the tests.

#![allow(dead_code)]

use std::sync::Arc;

use agent_mirror_core::MirrorStore;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};

#[derive(Clone)]
pub struct Chunk {
    pub delay_ms: u64,
    pub bytes: Vec<u8>,
}

/// Frame for each JSON value, sent as one chunk after `delay_ms`.
pub fn frames(delay_ms: u64, events: &[Value]) -> Chunk {
    let mut body = String::new();
    for event in events {
        body.push_str("data: ");
        body.push_str(&event.to_string());
        body.push_str("\n\n");
    }
    Chunk {
        delay_ms,
        bytes: body.into_bytes(),
    }
}

/// One frame with an explicit `event:` name.
pub fn named_frame(delay_ms: u64, name: &str, event: &Value) -> Chunk {
    Chunk {
        delay_ms,
        bytes: format!("event: {name}\ndata: {event}\n\n").into_bytes(),
    }
}

pub struct EventServer {
    pub base_url: String,
    handle: JoinHandle<()>,
}

impl EventServer {
    /// Serve `chunks` to every connection, then keep it open.
    pub async fn start(chunks: Vec<Chunk>) -> Self {
        Self::spawn(chunks, false).await
    }

    /// Serve `chunks`, then hang up in the middle of the next chunk.
    pub async fn start_truncated(chunks: Vec<Chunk>) -> Self {
        Self::spawn(chunks, true).await
    }

    async fn spawn(chunks: Vec<Chunk>, truncate: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local address");
        let chunks = Arc::new(chunks);

        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let chunks = Arc::clone(&chunks);
                tokio::spawn(async move {
                    serve_one(socket, &chunks, truncate).await;
                });
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            handle,
        }
    }
}

impl Drop for EventServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_one(mut socket: TcpStream, chunks: &[Chunk], truncate: bool) {
    let mut request = Vec::new();
    let mut buffer = [0_u8; 2048];
    loop {
        match socket.read(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buffer[..n]),
        }
        if request.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }

    let headers = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";
    if socket.write_all(headers.as_bytes()).await.is_err() {
        return;
    }

    for chunk in chunks {
        if chunk.delay_ms > 0 {
            sleep(Duration::from_millis(chunk.delay_ms)).await;
        }
        let prefix = format!("{:X}\r\n", chunk.bytes.len());
        if socket.write_all(prefix.as_bytes()).await.is_err()
            || socket.write_all(&chunk.bytes).await.is_err()
            || socket.write_all(b"\r\n").await.is_err()
        {
            return;
        }
        let _ = socket.flush().await;
    }

    if truncate {
        let _ = socket.write_all(b"40\r\ndata: cut").await;
        let _ = socket.shutdown().await;
        return;
    }
    sleep(Duration::from_secs(30)).await;
}

/// Poll the store until `predicate` holds, panicking after five seconds.
pub async fn wait_until(store: &MirrorStore, predicate: impl Fn(&MirrorStore) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate(store) {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(10)).await;
    }
}
