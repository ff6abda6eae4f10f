//! HTTP collaborators: room metadata resolve and event-stream handshake
//!
//! Wraps reqwest for the two API calls the pipeline needs, together with
//! the injectable pieces around them: the process-wide metadata cache,
//! the request-signing collaborator, and the auth-cookie provider.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::header::{COOKIE, REFERER};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::ApiConfig;
use crate::error::ClientError;

/// Canonical room identity, resolved once per room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomMetadata {
    /// Canonical room id
    pub room_id: u64,
    /// Short alias; equals `room_id` when the room has none
    pub short_id: u64,
    /// Room owner's uid
    pub owner_uid: u64,
}

/// Handshake result: token plus candidate servers
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    /// Connection token, echoed back in the handshake frame
    pub token: String,
    /// Candidate socket URLs, tried strictly in order
    pub servers: Vec<String>,
    /// The uid this handshake authenticates as (0 = anonymous)
    pub uid: u64,
}

/// Cookie material supplied by the embedding application
pub type Cookies = HashMap<String, String>;

/// Supplies auth cookies for handshake calls
///
/// Returning `None` proceeds anonymously.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current auth cookies, if any
    async fn cookies(&self) -> Option<Cookies>;
}

/// Auth provider with no credentials; every handshake is anonymous
pub struct AnonymousAuth;

#[async_trait]
impl AuthProvider for AnonymousAuth {
    async fn cookies(&self) -> Option<Cookies> {
        None
    }
}

/// Signs handshake query parameters
///
/// The signing algorithm itself lives outside this crate and is injected
/// where needed.
#[async_trait]
pub trait RequestSigner: Send + Sync {
    /// Return the parameter list to actually send, signature included
    async fn sign(
        &self,
        room_id: u64,
        params: Vec<(String, String)>,
    ) -> Result<Vec<(String, String)>, ClientError>;
}

/// Signer that sends parameters unsigned
pub struct PassthroughSigner;

#[async_trait]
impl RequestSigner for PassthroughSigner {
    async fn sign(
        &self,
        _room_id: u64,
        params: Vec<(String, String)>,
    ) -> Result<Vec<(String, String)>, ClientError> {
        Ok(params)
    }
}

/// Room metadata cache, explicitly owned and injectable
///
/// Keyed by the id the caller asked with; entries never expire, since a
/// room's canonical identity does not change. Clones share storage.
#[derive(Clone, Default)]
pub struct MetadataCache {
    inner: Arc<Mutex<HashMap<u64, RoomMetadata>>>,
}

impl MetadataCache {
    /// Cached metadata for an id, if resolved before
    pub fn get(&self, id: u64) -> Option<RoomMetadata> {
        self.inner.lock().expect("metadata cache poisoned").get(&id).copied()
    }

    /// Record resolved metadata for an id
    pub fn insert(&self, id: u64, metadata: RoomMetadata) {
        self.inner
            .lock()
            .expect("metadata cache poisoned")
            .insert(id, metadata);
    }
}

/// Response envelope shared by the live API endpoints
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct RoomInitData {
    uid: u64,
    room_id: u64,
    short_id: u64,
}

#[derive(Debug, Deserialize)]
struct DanmuInfoData {
    token: String,
    host_list: Vec<HostEntry>,
}

#[derive(Debug, Deserialize)]
struct HostEntry {
    host: String,
    wss_port: u16,
}

/// HTTP client for the live API
pub struct ApiClient {
    http: reqwest::Client,
    config: ApiConfig,
    signer: Arc<dyn RequestSigner>,
    cache: MetadataCache,
}

impl ApiClient {
    /// Create a client with the given endpoints, signer, and cache
    pub fn new(
        config: ApiConfig,
        signer: Arc<dyn RequestSigner>,
        cache: MetadataCache,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            config,
            signer,
            cache,
        })
    }

    /// Resolve a caller-given id to its canonical room identity
    ///
    /// Results are cached indefinitely per input id; only the first call
    /// for an id touches the network.
    pub async fn resolve_room(&self, id: u64) -> Result<RoomMetadata, ClientError> {
        if let Some(metadata) = self.cache.get(id) {
            return Ok(metadata);
        }

        let url = format!("{}/room/v1/Room/room_init?id={}", self.config.base_url, id);
        let envelope: ApiEnvelope<RoomInitData> = self
            .http
            .get(&url)
            .header(REFERER, referer(id))
            .send()
            .await?
            .json()
            .await?;

        let data = match envelope {
            ApiEnvelope {
                code: 0,
                data: Some(data),
                ..
            } => data,
            envelope => {
                return Err(ClientError::Api {
                    code: envelope.code,
                    message: envelope.message,
                })
            }
        };

        let metadata = RoomMetadata {
            room_id: data.room_id,
            short_id: if data.short_id == 0 {
                data.room_id
            } else {
                data.short_id
            },
            owner_uid: data.uid,
        };
        self.cache.insert(id, metadata);
        Ok(metadata)
    }

    /// Fetch the handshake token and candidate server list for a room
    ///
    /// Cookies come from the auth provider; without a usable `DedeUserID`
    /// the call is made anonymously with no cookies at all.
    pub async fn fetch_handshake(
        &self,
        room_id: u64,
        auth: &Arc<dyn AuthProvider>,
    ) -> Result<HandshakeInfo, ClientError> {
        let mut cookies = auth.cookies().await.unwrap_or_default();
        let uid = parse_uid(&cookies, room_id);
        if uid == 0 && !cookies.is_empty() {
            warn!("[{}] no usable DedeUserID, sending no cookies", room_id);
            cookies.clear();
        }

        let params = vec![
            ("id".to_string(), room_id.to_string()),
            ("type".to_string(), "0".to_string()),
        ];
        let params = self.signer.sign(room_id, params).await?;

        let url = format!("{}/xlive/web-room/v1/index/getDanmuInfo", self.config.base_url);
        let mut request = self.http.get(&url).query(&params).header(REFERER, referer(room_id));
        if !cookies.is_empty() {
            request = request.header(COOKIE, cookie_header(&cookies));
        }

        info!(
            "[{}] fetching handshake info{}",
            room_id,
            if cookies.is_empty() { " anonymously" } else { "" }
        );
        let envelope: ApiEnvelope<DanmuInfoData> = request.send().await?.json().await?;

        let data = match envelope {
            ApiEnvelope {
                code: 0,
                data: Some(data),
                ..
            } => data,
            envelope => {
                return Err(ClientError::Api {
                    code: envelope.code,
                    message: envelope.message,
                })
            }
        };

        if data.host_list.is_empty() {
            return Err(ClientError::NoServers);
        }

        let servers = data
            .host_list
            .iter()
            .map(|entry| format!("wss://{}:{}/sub", entry.host, entry.wss_port))
            .collect();
        Ok(HandshakeInfo {
            token: data.token,
            servers,
            uid,
        })
    }
}

fn referer(room_id: u64) -> String {
    format!("https://live.bilibili.com/{}", room_id)
}

/// uid from the DedeUserID cookie; absent or malformed degrades to 0
fn parse_uid(cookies: &Cookies, room_id: u64) -> u64 {
    match cookies.get("DedeUserID") {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("[{}] invalid DedeUserID cookie, using uid=0", room_id);
            0
        }),
        None => 0,
    }
}

fn cookie_header(cookies: &Cookies) -> String {
    cookies
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_cache_roundtrip() {
        let cache = MetadataCache::default();
        let metadata = RoomMetadata {
            room_id: 100,
            short_id: 1,
            owner_uid: 7,
        };

        assert!(cache.get(1).is_none());
        cache.insert(1, metadata);
        assert_eq!(cache.get(1), Some(metadata));

        // Clones share storage
        let clone = cache.clone();
        assert_eq!(clone.get(1), Some(metadata));
    }

    #[test]
    fn test_parse_uid() {
        let mut cookies = Cookies::new();
        assert_eq!(parse_uid(&cookies, 1), 0);

        cookies.insert("DedeUserID".to_string(), "12345".to_string());
        assert_eq!(parse_uid(&cookies, 1), 12345);

        cookies.insert("DedeUserID".to_string(), "not-a-number".to_string());
        assert_eq!(parse_uid(&cookies, 1), 0);
    }

    #[test]
    fn test_envelope_error_code() {
        let raw = r#"{"code": 19002000, "message": "room not exists", "data": null}"#;
        let envelope: ApiEnvelope<RoomInitData> = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.code, 19002000);
        assert!(envelope.data.is_none());
    }

    #[test]
    fn test_handshake_payload_shape() {
        let raw = r#"{
            "code": 0,
            "message": "0",
            "data": {
                "token": "abc",
                "host_list": [
                    {"host": "tx-sh.example.com", "port": 2243, "wss_port": 443, "ws_port": 2244}
                ]
            }
        }"#;
        let envelope: ApiEnvelope<DanmuInfoData> = serde_json::from_str(raw).unwrap();
        let data = envelope.data.unwrap();
        assert_eq!(data.token, "abc");
        assert_eq!(data.host_list[0].wss_port, 443);
    }

    #[tokio::test]
    async fn test_passthrough_signer_keeps_params() {
        let params = vec![("id".to_string(), "5".to_string())];
        let signed = PassthroughSigner.sign(5, params.clone()).await.unwrap();
        assert_eq!(signed, params);
    }
}
