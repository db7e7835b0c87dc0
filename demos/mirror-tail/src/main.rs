//! Follow a server's event feed and log every change to the mirror.
//!
//! Run with: cargo run -p mirror-tail -- <base-url> <directory> [session-id]
//!
//! Set `MIRROR_BASIC_AUTH` to an encoded `Basic` token when the server
//! requires one. `RUST_LOG` controls verbosity.

use std::sync::Arc;

use agent_mirror_core::{ChangeKind, MirrorStore, StoreChange};
use agent_mirror_sync::EventSubscriber;
use agent_mirror_transport::{ServerConfig, build_client};
use anyhow::{Context, bail};
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct Args {
    base_url: String,
    directory: String,
    session_id: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let (Some(base_url), Some(directory)) = (args.next(), args.next()) else {
        bail!("usage: mirror-tail <base-url> <directory> [session-id]");
    };
    Ok(Args {
        base_url,
        directory,
        session_id: args.next(),
    })
}

fn log_change(store: &MirrorStore, change: &StoreChange) {
    match &change.kind {
        ChangeKind::Connection(connected) => {
            tracing::info!(revision = change.revision, connected, "Connection changed");
        }
        ChangeKind::Event(kind) => {
            let (sessions, messages, permissions, diffs) = store.read_with(|projection| {
                (
                    projection.sessions().len(),
                    projection.messages().len(),
                    projection.pending_permissions().len(),
                    projection.diffs().len(),
                )
            });
            tracing::info!(
                revision = change.revision,
                event = %kind,
                sessions,
                messages,
                permissions,
                diffs,
                "Applied event"
            );
        }
        ChangeKind::Merge(label) => tracing::info!(revision = change.revision, label, "Merged"),
        ChangeKind::Reset => tracing::info!(revision = change.revision, "Store reset"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    let mut config = ServerConfig::new(args.base_url, args.directory);
    if let Ok(token) = std::env::var("MIRROR_BASIC_AUTH") {
        config = config.with_basic_auth(token);
    }
    config.event_url().context("invalid base URL")?;

    let store = Arc::new(MirrorStore::new());
    let client = build_client(&config).context("building HTTP client")?;
    let subscriber = EventSubscriber::new(Arc::clone(&store), client);

    let mut changes = store.changes();
    subscriber
        .subscribe(&config, args.session_id.as_deref())
        .await;

    loop {
        tokio::select! {
            change = changes.next() => {
                let Some(change) = change else { break };
                log_change(&store, &change);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    subscriber.close().await;
    let diagnostics = store.diagnostics();
    tracing::info!(
        events = diagnostics.event_count,
        rejected = diagnostics.rejected_count,
        malformed = diagnostics.malformed_count,
        last_error = diagnostics.last_transport_error.as_deref().unwrap_or("-"),
        "Closed"
    );
    Ok(())
}
