//! Room registry: desired-set reconciliation and connection supervision
//!
//! Owns the active room connections and one supervising task per
//! connection that drives its handshake/connect/reconnect loop until
//! cancelled. Reconciliation against a desired id set is idempotent:
//! already-covered rooms are left untouched.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{ApiClient, AuthProvider};
use crate::config::ConnectionConfig;
use crate::connection::RoomConnection;
use crate::error::ClientError;

struct RoomEntry {
    connection: Arc<RoomConnection>,
    runner: JoinHandle<()>,
}

/// The set of active room connections
pub struct RoomRegistry {
    api: Arc<ApiClient>,
    auth: Arc<dyn AuthProvider>,
    config: ConnectionConfig,
    /// Keyed by canonical room id; lookups also match short-id aliases
    rooms: tokio::sync::Mutex<HashMap<u64, RoomEntry>>,
}

impl RoomRegistry {
    /// Create an empty registry sharing the given collaborators
    pub fn new(api: Arc<ApiClient>, auth: Arc<dyn AuthProvider>, config: ConnectionConfig) -> Self {
        Self {
            api,
            auth,
            config,
            rooms: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Look up an active connection by canonical id, short alias, or the
    /// id it was added with
    pub async fn room(&self, id: u64) -> Option<Arc<RoomConnection>> {
        self.rooms
            .lock()
            .await
            .values()
            .find(|entry| entry.connection.matches(id))
            .map(|entry| Arc::clone(&entry.connection))
    }

    /// Number of active connections
    pub async fn len(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Whether no rooms are active
    pub async fn is_empty(&self) -> bool {
        self.rooms.lock().await.is_empty()
    }

    /// Reconcile the active set against `desired`
    ///
    /// Ids already covered by a connection's room id or short alias are
    /// kept as-is; new ids are resolved (an unresolvable id fails here)
    /// and started; connections matching no desired id are closed and
    /// evicted. Calling this twice with the same set is a no-op.
    pub async fn update_rooms(&self, desired: &[u64]) -> Result<(), ClientError> {
        let mut rooms = self.rooms.lock().await;

        for &id in desired {
            if rooms.values().any(|entry| entry.connection.matches(id)) {
                continue;
            }
            info!("adding room {}", id);
            let connection = Arc::new(RoomConnection::new(
                id,
                Arc::clone(&self.api),
                Arc::clone(&self.auth),
                self.config.clone(),
            ));
            connection.resolve().await?;

            let runner = tokio::spawn({
                let connection = Arc::clone(&connection);
                async move { connection.run().await }
            });
            rooms.insert(connection.room_id(), RoomEntry { connection, runner });
        }

        let stale: Vec<u64> = rooms
            .iter()
            .filter(|(_, entry)| !desired.iter().any(|&id| entry.connection.matches(id)))
            .map(|(&key, _)| key)
            .collect();
        for key in stale {
            if let Some(entry) = rooms.remove(&key) {
                info!("removing room {}", key);
                entry.connection.close();
                if entry.runner.await.is_err() {
                    warn!("[{}] supervisor ended abnormally", key);
                }
            }
        }

        Ok(())
    }

    /// Reset every active connection
    ///
    /// Each drops its socket and token and re-handshakes; used when the
    /// shared auth material changes externally.
    pub async fn reset_connections(&self) {
        let rooms = self.rooms.lock().await;
        info!("resetting {} connection(s)", rooms.len());
        for entry in rooms.values() {
            entry.connection.reset();
        }
    }

    /// Close every connection and await every supervising task
    pub async fn close(&self) {
        let mut rooms = self.rooms.lock().await;
        for (key, entry) in rooms.drain() {
            entry.connection.close();
            if entry.runner.await.is_err() {
                warn!("[{}] supervisor ended abnormally", key);
            }
        }
    }
}
