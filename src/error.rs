//! Error types for the ingestion pipeline
//!
//! Steady-state operation logs and retries internally; these errors
//! surface only from setup-time calls (resolve, subscribe) and from
//! collaborator failures. Uses thiserror for ergonomic definitions.

use thiserror::Error;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The live API rejected the call (`code != 0`)
    #[error("API error code {code}: {message}")]
    Api { code: i64, message: String },

    /// The request-signing collaborator failed
    #[error("request signing failed: {0}")]
    Signing(String),

    /// The handshake offered no candidate servers
    #[error("no event servers offered by handshake")]
    NoServers,

    /// Operation on a connection that is already closed
    #[error("connection is closed")]
    Closed,
}
