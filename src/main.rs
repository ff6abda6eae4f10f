//! Live-Event Ingestion Demo - Entry Point
//!
//! Connects to the rooms named on the command line and prints every
//! deduplicated event the merger serves.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use danmaku_ingest::{
    AnonymousAuth, ApiClient, ApiConfig, ConnectionConfig, EventMerger, MergerConfig,
    MetadataCache, PassthroughSigner, RoomRegistry,
};

/// Poll interval for the consumer loop
const POLL_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=danmaku_ingest=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("danmaku_ingest=info")),
        )
        .init();

    // Room ids from the command line
    let room_ids: Vec<u64> = env::args()
        .skip(1)
        .map(|arg| arg.parse())
        .collect::<Result<_, _>>()
        .map_err(|_| "usage: danmaku_ingest <room_id>...")?;
    if room_ids.is_empty() {
        return Err("usage: danmaku_ingest <room_id>...".into());
    }

    let api = Arc::new(ApiClient::new(
        ApiConfig::default(),
        Arc::new(PassthroughSigner),
        MetadataCache::default(),
    )?);
    let registry = RoomRegistry::new(api, Arc::new(AnonymousAuth), ConnectionConfig::default());
    registry.update_rooms(&room_ids).await?;

    // Feed every room's event stream into one merger
    let mut merger = EventMerger::new(MergerConfig::default());
    for &id in &room_ids {
        if let Some(room) = registry.room(id).await {
            merger.add_source(room.event_stream(None, Vec::new()));
        }
    }

    info!("ingesting from {} room(s)", room_ids.len());

    loop {
        if let Some(envelope) = merger.next_timeout(POLL_TIMEOUT).await {
            info!(
                "#{} {} {}",
                envelope.index,
                envelope.event.command,
                envelope.event.payload
            );
        }
    }
}
