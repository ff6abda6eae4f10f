//! Tunable configuration for the pipeline components
//!
//! Plain structs with sensible defaults; construct one and override
//! fields as needed.

use std::time::Duration;

/// Default User-Agent presented to the live API and event servers
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36";

/// Per-connection tuning
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Ring buffer capacity (envelopes retained for replay)
    pub buffer_capacity: usize,
    /// Heartbeat send interval
    pub heartbeat_interval: Duration,
    /// Fixed backoff between reconnect attempts
    pub retry_backoff: Duration,
    /// How long a handshake's candidate server list stays usable
    pub server_list_ttl: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            heartbeat_interval: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(3),
            server_list_ttl: Duration::from_secs(300),
        }
    }
}

impl ConnectionConfig {
    /// Listener queues hold twice the ring buffer, so a full replay
    /// always fits in a fresh subscription
    pub fn listener_queue_capacity(&self) -> usize {
        self.buffer_capacity * 2
    }

    /// A socket with no inbound frame for this long is considered dead
    pub fn receive_timeout(&self) -> Duration {
        self.heartbeat_interval + Duration::from_secs(5)
    }
}

/// Merger tuning
///
/// Values below the minimums in [`crate::merger::EventMerger::new`] are
/// clamped up rather than rejected.
#[derive(Debug, Clone)]
pub struct MergerConfig {
    /// Sliding dedup window length
    pub duration: Duration,
    /// Shared fan-in queue capacity
    pub queue_capacity: usize,
    /// Dedup window entry cap; past it the cutoff tightens adaptively
    pub window_capacity: usize,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(300),
            queue_capacity: 1_000,
            window_capacity: 5_000,
        }
    }
}

/// Live API endpoints and identity
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL for the metadata and handshake calls
    pub base_url: String,
    /// User-Agent header value
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.live.bilibili.com".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}
