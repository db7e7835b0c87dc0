//! Subscribe/close lifecycle against a scripted event-stream server.

mod support;

use std::sync::Arc;

use agent_mirror_core::{ChangeKind, Ingest, MirrorStore};
use agent_mirror_sync::EventSubscriber;
use agent_mirror_transport::ServerConfig;
use futures::StreamExt;
use serde_json::{Value, json};
use support::{EventServer, frames, named_frame, wait_until};
use tokio::time::{Duration, sleep, timeout};

fn wrapped(directory: &str, kind: &str, properties: Value) -> Value {
    json!({
        "directory": directory,
        "payload": {"type": kind, "properties": properties},
    })
}

fn session(id: &str) -> Value {
    json!({"id": id, "projectID": "proj", "directory": "/repo", "title": id, "time": {"created": 1, "updated": 1}})
}

fn subscriber() -> (Arc<MirrorStore>, EventSubscriber) {
    let store = Arc::new(MirrorStore::new());
    let subscriber = EventSubscriber::new(Arc::clone(&store), reqwest::Client::new());
    (store, subscriber)
}

#[tokio::test]
async fn test_end_to_end_scenario() {
    let server = EventServer::start(vec![
        frames(0, &[json!({"type": "server.connected", "properties": {}})]),
        frames(
            10,
            &[
                wrapped("/repo", "session.created", json!({"info": session("s1")})),
                wrapped(
                    "/repo",
                    "message.updated",
                    json!({"info": {"id": "m1", "sessionID": "s1", "role": "user", "time": {"created": 100}}}),
                ),
            ],
        ),
        frames(
            10,
            &[
                // Out of scope: other session, other directory.
                wrapped(
                    "/repo",
                    "message.updated",
                    json!({"info": {"id": "mx", "sessionID": "s2", "role": "user", "time": {"created": 150}}}),
                ),
                wrapped("/elsewhere", "session.created", json!({"info": session("s1")})),
                wrapped(
                    "/repo",
                    "message.part.updated",
                    json!({
                        "part": {"id": "p1", "sessionID": "s1", "messageID": "m1", "type": "text", "text": ""},
                        "delta": "Hi"
                    }),
                ),
            ],
        ),
        frames(
            10,
            &[
                wrapped(
                    "/repo",
                    "message.updated",
                    json!({"info": {
                        "id": "m2", "sessionID": "s1", "role": "assistant", "time": {"created": 200},
                        "modelID": "model", "providerID": "provider"
                    }}),
                ),
                wrapped(
                    "/repo",
                    "session.diff",
                    json!({"sessionID": "s1", "diff": [{"file": "a.ts", "additions": 1, "deletions": 0}]}),
                ),
            ],
        ),
    ])
    .await;

    let (store, subscriber) = subscriber();
    let mut changes = store.changes();
    let config = ServerConfig::new(&server.base_url, "/repo/");
    subscriber.subscribe(&config, Some("s1")).await;

    wait_until(&store, |store| store.diffs().len() == 1).await;

    let current = store.current_session().expect("selected session");
    assert_eq!(current.id, "s1");

    let messages = store.messages();
    let ids: Vec<_> = messages.iter().map(|message| message.id()).collect();
    assert_eq!(ids, ["m2", "m1"]);

    let parts = store.parts("m1");
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].text(), Some("Hi"));
    assert_eq!(store.diffs()[0].file, "a.ts");
    assert!(store.is_connected());

    let diagnostics = store.diagnostics();
    assert_eq!(diagnostics.rejected_count, 2);
    assert_eq!(diagnostics.malformed_count, 0);
    assert_eq!(diagnostics.last_event_type.as_deref(), Some("session.diff"));

    // One change for the connection flag, then one per applied event.
    let mut kinds = Vec::new();
    while kinds.len() < 6 {
        let change = timeout(Duration::from_secs(1), changes.next())
            .await
            .expect("change")
            .expect("stream open");
        kinds.push(change.kind);
    }
    assert_eq!(kinds[0], ChangeKind::Connection(true));
    assert_eq!(
        kinds[1..],
        [
            ChangeKind::Event("session.created".to_owned()),
            ChangeKind::Event("message.updated".to_owned()),
            ChangeKind::Event("message.part.updated".to_owned()),
            ChangeKind::Event("message.updated".to_owned()),
            ChangeKind::Event("session.diff".to_owned()),
        ]
    );

    subscriber.close().await;
    subscriber.close().await;
    assert!(!store.is_connected());
    assert!(store.scope().session_id.is_none());
}

#[tokio::test]
async fn test_close_then_reopen_ignores_old_connection() {
    let old_server = EventServer::start(vec![
        frames(0, &[wrapped("/repo", "session.created", json!({"info": session("s1")}))]),
        frames(300, &[wrapped("/repo", "session.created", json!({"info": session("late")}))]),
    ])
    .await;
    let new_server = EventServer::start(vec![frames(
        0,
        &[wrapped("/repo", "session.created", json!({"info": session("s2")}))],
    )])
    .await;

    let (store, subscriber) = subscriber();
    let old_generation = subscriber
        .subscribe(&ServerConfig::new(&old_server.base_url, "/repo"), Some("s1"))
        .await;
    wait_until(&store, |store| store.sessions().len() == 1).await;

    subscriber.close().await;
    let new_generation = subscriber
        .subscribe(&ServerConfig::new(&new_server.base_url, "/repo"), None)
        .await;
    assert!(new_generation > old_generation);
    wait_until(&store, |store| store.sessions().len() == 2).await;

    // A late frame pushed through the old connection's path is discarded.
    let late = wrapped("/repo", "session.created", json!({"info": session("injected")}));
    assert_eq!(store.ingest(old_generation, &late.to_string()), Ingest::Stale);

    // The old server's delayed frame never lands either.
    sleep(Duration::from_millis(500)).await;
    let ids: Vec<_> = store.sessions().into_iter().map(|session| session.id).collect();
    assert_eq!(ids, ["s2", "s1"]);
    assert_eq!(subscriber.active_generation().await, Some(new_generation));

    subscriber.close().await;
}

#[tokio::test]
async fn test_named_frames_are_applied() {
    let server = EventServer::start(vec![
        named_frame(0, "session.created", &wrapped("/repo", "session.created", json!({"info": session("s1")}))),
        named_frame(10, "ping", &json!({"type": "server.connected", "properties": {}})),
        frames(10, &[wrapped("/repo", "session.created", json!({"info": session("s2")}))]),
    ])
    .await;

    let (store, subscriber) = subscriber();
    subscriber
        .subscribe(&ServerConfig::new(&server.base_url, "/repo"), None)
        .await;
    wait_until(&store, |store| store.sessions().len() == 2).await;

    let ids: Vec<_> = store.sessions().into_iter().map(|session| session.id).collect();
    assert_eq!(ids, ["s2", "s1"]);
    assert_eq!(store.diagnostics().malformed_count, 0);
    subscriber.close().await;
}

#[tokio::test]
async fn test_unreachable_server_is_recorded() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local address");
    drop(listener);

    let (store, subscriber) = subscriber();
    subscriber
        .subscribe(&ServerConfig::new(format!("http://{addr}"), "/repo"), None)
        .await;

    wait_until(&store, |store| store.diagnostics().last_transport_error.is_some()).await;
    assert!(!store.is_connected());
    subscriber.close().await;
}

#[tokio::test]
async fn test_dropped_stream_is_recorded() {
    let server = EventServer::start_truncated(vec![frames(
        0,
        &[wrapped("/repo", "session.created", json!({"info": session("s1")}))],
    )])
    .await;

    let (store, subscriber) = subscriber();
    subscriber
        .subscribe(&ServerConfig::new(&server.base_url, "/repo"), None)
        .await;

    wait_until(&store, |store| store.diagnostics().last_transport_error.is_some()).await;
    assert_eq!(store.sessions().len(), 1);
    assert!(!store.is_connected());
    assert!(
        store
            .diagnostics()
            .last_transport_error
            .unwrap()
            .starts_with("Request failed")
    );
    subscriber.close().await;
}

#[tokio::test]
async fn test_malformed_base_url_is_recorded() {
    let (store, subscriber) = subscriber();
    subscriber
        .subscribe(&ServerConfig::new("not a url", "/repo"), None)
        .await;

    wait_until(&store, |store| store.diagnostics().last_transport_error.is_some()).await;
    assert!(
        store
            .diagnostics()
            .last_transport_error
            .unwrap()
            .starts_with("Invalid URL")
    );
}
