//! Dedup fingerprint extraction
//!
//! Maps an event to a `(command, fingerprint)` pair used only for
//! duplicate detection. High-volume command types get narrow fingerprints
//! through a dispatch table; everything else falls back to stringifying
//! the full payload.

use std::collections::HashMap;

use serde_json::json;

use crate::types::Event;

/// Fingerprint override for one command type
///
/// Returns `None` when the payload is missing the expected fields, in
/// which case the full-payload default applies.
pub type FingerprintFn = fn(&Event) -> Option<String>;

/// Command-type → fingerprint dispatch table with a stringify default
pub struct FeatureRegistry {
    overrides: HashMap<String, FingerprintFn>,
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        let mut registry = Self {
            overrides: HashMap::new(),
        };
        registry.register("DANMU_MSG", chat_fingerprint);
        registry.register("SEND_GIFT", gift_fingerprint);
        registry.register("SUPER_CHAT_MESSAGE", super_chat_fingerprint);
        registry
    }
}

impl FeatureRegistry {
    /// Registry with no overrides; every event gets the stringify default
    pub fn empty() -> Self {
        Self {
            overrides: HashMap::new(),
        }
    }

    /// Register a fingerprint override for a command type
    pub fn register(&mut self, command: &str, f: FingerprintFn) {
        self.overrides.insert(command.to_string(), f);
    }

    /// Extract the dedup key for an event
    ///
    /// Unknown command types, and overrides that bail on an unexpected
    /// payload shape, both degrade to the full-payload fingerprint.
    pub fn extract(&self, event: &Event) -> (String, String) {
        let fingerprint = self
            .overrides
            .get(&event.command)
            .and_then(|f| f(event))
            .unwrap_or_else(|| event.payload.to_string());
        (event.command.clone(), fingerprint)
    }
}

/// Chat broadcast: sender metadata + send time + message text
fn chat_fingerprint(event: &Event) -> Option<String> {
    let info = event.payload.get("info")?;
    let sender = info.get(9)?;
    let sent_at = info.get(0)?.get(4)?;
    let text = info.get(1)?;
    Some(json!([sender, sent_at, text]).to_string())
}

/// Gift notification: transaction id + timestamp
fn gift_fingerprint(event: &Event) -> Option<String> {
    let data = event.payload.get("data")?;
    Some(json!([data.get("tid")?, data.get("timestamp")?]).to_string())
}

/// Paid highlighted message: message id + price + text
fn super_chat_fingerprint(event: &Event) -> Option<String> {
    let data = event.payload.get("data")?;
    Some(json!([data.get("id")?, data.get("price")?, data.get("message")?]).to_string())
}
