//! Live-Event Ingestion Pipeline Library
//!
//! A resilient client for live-broadcast event streams built with
//! tokio-tungstenite: each room connection speaks the 16-byte binary
//! framing protocol over WebSocket, buffers decoded events for replay,
//! and fans them out to listeners; a downstream merger deduplicates
//! events from any number of rooms inside a sliding time window.
//!
//! # Features
//! - Binary frame decode, including brotli-wrapped nested frames
//! - Handshake/heartbeat protocol with candidate-server fallback
//! - Per-room ring buffer with cursor-based replay on subscribe
//! - Dead-consumer isolation (a full listener queue is discarded)
//! - Desired-set room reconciliation with one supervisor per room
//! - Sliding-window dedup with adaptive tightening under load
//!
//! # Architecture
//! Tokio tasks and bounded `mpsc` channels:
//! - Each `RoomConnection` runs a supervising loop plus, while connected,
//!   a receive task and a heartbeat task
//! - `RoomRegistry` owns the connections and their supervisors
//! - `EventMerger` runs one pump task per source and serves a single
//!   consumer through `next()`
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use danmaku_ingest::{
//!     AnonymousAuth, ApiClient, ApiConfig, ConnectionConfig, EventMerger,
//!     MergerConfig, MetadataCache, PassthroughSigner, RoomRegistry,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let api = Arc::new(
//!         ApiClient::new(ApiConfig::default(), Arc::new(PassthroughSigner), MetadataCache::default())
//!             .unwrap(),
//!     );
//!     let registry = RoomRegistry::new(api, Arc::new(AnonymousAuth), ConnectionConfig::default());
//!     registry.update_rooms(&[1]).await.unwrap();
//!
//!     let mut merger = EventMerger::new(MergerConfig::default());
//!     let room = registry.room(1).await.unwrap();
//!     merger.add_source(room.event_stream(None, Vec::new()));
//!
//!     while let Some(envelope) = merger.next_timeout(Duration::from_secs(3)).await {
//!         println!("{}", envelope.event.command);
//!     }
//! }
//! ```

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod features;
pub mod frame;
pub mod merger;
pub mod registry;
pub mod types;

// Re-export main types for convenience
pub use api::{
    AnonymousAuth, ApiClient, AuthProvider, Cookies, HandshakeInfo, MetadataCache,
    PassthroughSigner, RequestSigner, RoomMetadata,
};
pub use config::{ApiConfig, ConnectionConfig, MergerConfig};
pub use connection::{ConnectionState, Listener, RoomConnection};
pub use error::ClientError;
pub use features::{FeatureRegistry, FingerprintFn};
pub use merger::EventMerger;
pub use registry::RoomRegistry;
pub use types::{Envelope, Event, ListenerId};
