//! Basic type definitions for the ingestion pipeline
//!
//! Provides the core event data model:
//! - `Event`: a decoded command with its raw payload
//! - `Envelope`: an event plus its replay cursor and receipt time
//! - `ListenerId`: UUID-based subscription identifier

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use uuid::Uuid;

/// A decoded live event
///
/// A command-type string plus the JSON payload it arrived with.
/// Immutable once decoded; shared as `Arc<Event>` by the ring buffer
/// and every listener queue, so fan-out never copies the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Command type, taken from the payload's `cmd` field (may be empty)
    pub command: String,
    /// The full decoded payload
    pub payload: Value,
}

impl Event {
    /// Build an event from a decoded payload, extracting the command type
    pub fn from_payload(payload: Value) -> Self {
        let command = payload
            .get("cmd")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self { command, payload }
    }
}

/// An event plus its per-room delivery metadata
///
/// `index` increases strictly within one connection and serves as the
/// replay cursor for `subscribe`; `received_at` drives the dedup-window
/// and retention decisions downstream.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Per-connection sequence number
    pub index: u64,
    /// Receipt time
    pub received_at: Instant,
    /// The event itself, shared without copying
    pub event: Arc<Event>,
}

impl Envelope {
    /// Wrap an event with its sequence number, stamped now
    pub fn new(index: u64, event: Event) -> Self {
        Self {
            index,
            received_at: Instant::now(),
            event: Arc::new(event),
        }
    }
}

/// Unique listener subscription identifier (newtype pattern)
///
/// Wraps a UUID v4 so a subscription can be logged and removed
/// unambiguously. Implements Hash and Eq for use as HashMap keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub Uuid);

impl ListenerId {
    /// Create a new random listener ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
