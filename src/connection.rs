//! Room connection: state machine, ring buffer, and listener fan-out
//!
//! Owns one room's socket lifecycle (handshake, heartbeat, receive loop,
//! candidate fallback) and the replayable envelope buffer its listeners
//! subscribe to. Ingestion never blocks on a consumer: a listener queue
//! observed full is discarded on the spot.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, AuthProvider, HandshakeInfo, RoomMetadata};
use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::frame;
use crate::types::{Envelope, Event, ListenerId};

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, nothing resolved yet
    Idle,
    /// Resolving the canonical room identity
    Resolving,
    /// Fetching a token and candidate server list
    Handshaking,
    /// Socket open, receiving frames
    Connected,
    /// Between candidate attempts
    Reconnecting,
    /// Terminally closed
    Closed,
}

/// Ring buffer and listener set, mutated only under its lock
struct BufferState {
    next_index: u64,
    entries: VecDeque<Envelope>,
    listeners: HashMap<ListenerId, mpsc::Sender<Envelope>>,
}

/// One room's connection to the live event server
pub struct RoomConnection {
    requested_id: u64,
    metadata: Mutex<Option<RoomMetadata>>,
    state: Mutex<ConnectionState>,
    buffer: Mutex<BufferState>,
    /// Cancelled by `reset`; replaced on every fresh candidate list
    session: Mutex<CancellationToken>,
    /// Cancelled by `close`, terminally
    cancel: CancellationToken,
    api: Arc<ApiClient>,
    auth: Arc<dyn AuthProvider>,
    config: ConnectionConfig,
}

impl RoomConnection {
    /// Create a connection for a caller-given room id (canonical or short)
    pub fn new(
        requested_id: u64,
        api: Arc<ApiClient>,
        auth: Arc<dyn AuthProvider>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            requested_id,
            metadata: Mutex::new(None),
            state: Mutex::new(ConnectionState::Idle),
            buffer: Mutex::new(BufferState {
                next_index: 0,
                entries: VecDeque::with_capacity(config.buffer_capacity),
                listeners: HashMap::new(),
            }),
            session: Mutex::new(CancellationToken::new()),
            cancel: CancellationToken::new(),
            api,
            auth,
            config,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        // Closed is terminal
        if *state != ConnectionState::Closed {
            *state = next;
        }
    }

    /// Resolved metadata, if `resolve` has succeeded
    pub fn metadata(&self) -> Option<RoomMetadata> {
        *self.metadata.lock().expect("metadata lock poisoned")
    }

    /// Canonical room id, or the requested id before resolution
    pub fn room_id(&self) -> u64 {
        self.metadata().map(|m| m.room_id).unwrap_or(self.requested_id)
    }

    /// Short alias, or the requested id before resolution
    pub fn short_id(&self) -> u64 {
        self.metadata().map(|m| m.short_id).unwrap_or(self.requested_id)
    }

    /// Whether this connection answers for the given id or alias
    pub fn matches(&self, id: u64) -> bool {
        if id == self.requested_id {
            return true;
        }
        match self.metadata() {
            Some(m) => m.room_id == id || m.short_id == id,
            None => false,
        }
    }

    /// Resolve the canonical room identity, once
    ///
    /// Cached for the connection's lifetime; an unresolvable id fails here,
    /// synchronously for the caller that introduced it.
    pub async fn resolve(&self) -> Result<RoomMetadata, ClientError> {
        if let Some(metadata) = self.metadata() {
            return Ok(metadata);
        }
        self.set_state(ConnectionState::Resolving);
        let metadata = self.api.resolve_room(self.requested_id).await?;
        *self.metadata.lock().expect("metadata lock poisoned") = Some(metadata);
        info!(
            "[{}] resolved to room_id={} short_id={} owner_uid={}",
            self.requested_id, metadata.room_id, metadata.short_id, metadata.owner_uid
        );
        Ok(metadata)
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Close terminally: cancel tasks, drop every listener
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("[{}] closing connection", self.room_id());
        self.cancel.cancel();
        self.session.lock().expect("session lock poisoned").cancel();
        *self.state.lock().expect("state lock poisoned") = ConnectionState::Closed;
        self.buffer.lock().expect("buffer lock poisoned").listeners.clear();
    }

    /// Drop the live socket and token so the supervisor re-handshakes
    ///
    /// Used when upstream auth material changes; the connection itself
    /// stays open and recovers on its own.
    pub fn reset(&self) {
        info!("[{}] resetting connection", self.room_id());
        self.session.lock().expect("session lock poisoned").cancel();
    }

    /// Index of the most recently ingested envelope
    pub fn latest_index(&self) -> u64 {
        self.buffer.lock().expect("buffer lock poisoned").next_index
    }

    /// Number of live listener subscriptions
    pub fn listener_count(&self) -> usize {
        self.buffer.lock().expect("buffer lock poisoned").listeners.len()
    }

    /// Ingest one decoded event: buffer it and fan out to listeners
    ///
    /// The offer to each listener queue is non-blocking; a queue observed
    /// full belongs to a consumer that stopped draining and is discarded
    /// so it cannot stall ingestion for everyone else.
    pub fn ingest(&self, event: Event) {
        let room_id = self.room_id();
        let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
        buffer.next_index += 1;
        let envelope = Envelope::new(buffer.next_index, event);

        if buffer.entries.len() >= self.config.buffer_capacity {
            buffer.entries.pop_front();
        }
        buffer.entries.push_back(envelope.clone());

        buffer.listeners.retain(|id, queue| match queue.try_send(envelope.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "[{}] discarding listener {}: queue full, possibly dead consumer",
                    room_id, id
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("[{}] listener {} unsubscribed", room_id, id);
                false
            }
        });
    }

    /// Feed one raw binary frame through the codec into the buffer
    pub fn ingest_frame(&self, data: &[u8]) {
        for event in frame::decode(data) {
            self.ingest(event);
        }
    }

    /// Subscribe to this room's events
    ///
    /// Buffered envelopes with `index > resume_after` are replayed into
    /// the fresh queue before it goes live, so nothing between the cursor
    /// and the subscription is missed (bounded by buffer retention).
    /// `None` subscribes to new events only. Dropping the handle
    /// unsubscribes.
    pub fn subscribe(&self, resume_after: Option<u64>) -> Result<Listener, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let room_id = self.room_id();
        let (queue, receiver) = mpsc::channel(self.config.listener_queue_capacity());
        let id = ListenerId::new();

        let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
        if let Some(cursor) = resume_after {
            for entry in buffer.entries.iter() {
                if entry.index > cursor {
                    // The queue is twice the ring, a full replay always fits
                    let _ = queue.try_send(entry.clone());
                }
            }
        }
        buffer.listeners.insert(id, queue);
        debug!(
            "[{}] listener {} subscribed ({} live)",
            room_id,
            id,
            buffer.listeners.len()
        );
        Ok(Listener { id, receiver })
    }

    /// A self-healing stream of this room's envelopes
    ///
    /// Resubscribes from the last delivered index if its listener was
    /// discarded (e.g. after a stall), so delivery resumes from the buffer
    /// instead of silently gapping. `commands` filters by command type when
    /// non-empty. Ends when the connection closes.
    pub fn event_stream(
        self: Arc<Self>,
        resume_after: Option<u64>,
        commands: Vec<String>,
    ) -> impl Stream<Item = Envelope> + Send + 'static {
        struct StreamState {
            connection: Arc<RoomConnection>,
            listener: Option<Listener>,
            cursor: Option<u64>,
            commands: Vec<String>,
        }

        let state = StreamState {
            connection: self,
            listener: None,
            cursor: resume_after,
            commands,
        };

        futures_util::stream::unfold(state, |mut state| async move {
            loop {
                if state.listener.is_none() {
                    match state.connection.subscribe(state.cursor) {
                        Ok(listener) => state.listener = Some(listener),
                        // Connection closed, end of stream
                        Err(_) => return None,
                    }
                }
                let Some(listener) = state.listener.as_mut() else {
                    return None;
                };
                match listener.recv().await {
                    Some(envelope) => {
                        state.cursor = Some(envelope.index);
                        if state.commands.is_empty()
                            || state.commands.iter().any(|c| *c == envelope.event.command)
                        {
                            return Some((envelope, state));
                        }
                    }
                    None => {
                        warn!(
                            "[{}] listener discarded, resubscribing after index {:?}",
                            state.connection.room_id(),
                            state.cursor
                        );
                        state.listener = None;
                    }
                }
            }
        })
    }

    /// Supervising loop: handshake, connect, back off, repeat until closed
    ///
    /// Spawned by the registry. Every await races the close token, so
    /// closing mid-handshake or mid-read never deadlocks.
    pub async fn run(&self) {
        while !self.is_closed() {
            self.set_state(ConnectionState::Handshaking);
            let attempt = async {
                match self.api.fetch_handshake(self.room_id(), &self.auth).await {
                    Ok(handshake) => self.connect(&handshake).await,
                    Err(e) => warn!("[{}] handshake failed: {}", self.room_id(), e),
                }
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                () = attempt => {}
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_backoff) => {}
            }
        }
    }

    /// Try each candidate server in order until the list goes stale
    async fn connect(&self, handshake: &HandshakeInfo) {
        // Fresh session token; `reset` cancels it to force a re-handshake
        let session = {
            let mut session = self.session.lock().expect("session lock poisoned");
            *session = CancellationToken::new();
            session.clone()
        };
        let obtained = Instant::now();
        let mut first_attempt = true;

        for server in &handshake.servers {
            if !first_attempt {
                self.set_state(ConnectionState::Reconnecting);
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = session.cancelled() => return,
                    _ = tokio::time::sleep(self.config.retry_backoff) => {}
                }
            }
            first_attempt = false;

            if self.is_closed() || session.is_cancelled() {
                return;
            }
            if obtained.elapsed() > self.config.server_list_ttl {
                info!(
                    "[{}] candidate list stale, refreshing handshake",
                    self.room_id()
                );
                return;
            }

            match self.run_socket(server, handshake, &session).await {
                Ok(()) => info!("[{}] connection to {} ended", self.room_id(), server),
                Err(e) => warn!("[{}] connection to {} failed: {}", self.room_id(), server, e),
            }
        }
    }

    /// One socket session: handshake frame, heartbeat task, receive loop
    async fn run_socket(
        &self,
        server: &str,
        handshake: &HandshakeInfo,
        session: &CancellationToken,
    ) -> Result<(), ClientError> {
        info!(
            "[{}] connecting to {} as uid={}",
            self.room_id(),
            server,
            handshake.uid
        );

        let (socket, _) = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            _ = session.cancelled() => return Ok(()),
            connected = tokio_tungstenite::connect_async(server) => connected?,
        };
        let (mut sink, mut reader) = socket.split();

        sink.send(Message::Binary(frame::encode_handshake(
            self.room_id(),
            handshake.uid,
            &handshake.token,
        )))
        .await?;
        self.set_state(ConnectionState::Connected);

        // Heartbeat task owns the write half; dies with the session
        let heartbeat_token = session.child_token();
        let interval = self.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = heartbeat_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if sink.send(Message::Binary(frame::HEARTBEAT_FRAME.to_vec())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        });

        let result = self.receive_loop(&mut reader, session).await;
        heartbeat.abort();
        result
    }

    async fn receive_loop(
        &self,
        reader: &mut WsReader,
        session: &CancellationToken,
    ) -> Result<(), ClientError> {
        let idle_limit = self.config.receive_timeout();
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = session.cancelled() => return Ok(()),
                next = timeout(idle_limit, reader.next()) => match next {
                    Ok(message) => message,
                    Err(_) => {
                        warn!(
                            "[{}] no frames for {:?}, dropping socket",
                            self.room_id(),
                            idle_limit
                        );
                        return Ok(());
                    }
                },
            };

            match message {
                Some(Ok(Message::Binary(data))) => self.ingest_frame(&data),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    info!("[{}] server closed the socket", self.room_id());
                    return Ok(());
                }
                Some(Ok(_)) => debug!("[{}] ignoring non-binary message", self.room_id()),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// Handle to a listener subscription
///
/// Dropping the handle unsubscribes; the producer discards the queue the
/// next time it offers an event to it.
pub struct Listener {
    id: ListenerId,
    receiver: mpsc::Receiver<Envelope>,
}

impl Listener {
    /// This subscription's identifier
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Wait for the next envelope until the subscription ends
    ///
    /// Returns `None` once the subscription is gone (connection closed,
    /// or this listener was discarded as a dead consumer).
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    /// Wait up to `wait` for the next envelope
    ///
    /// `None` on expiry means "no event yet", a normal outcome rather
    /// than an error.
    pub async fn receive(&mut self, wait: Duration) -> Option<Envelope> {
        match timeout(wait, self.receiver.recv()).await {
            Ok(item) => item,
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AnonymousAuth, MetadataCache, PassthroughSigner};
    use crate::config::ApiConfig;
    use serde_json::json;

    fn test_connection(buffer_capacity: usize) -> Arc<RoomConnection> {
        let api = Arc::new(
            ApiClient::new(
                ApiConfig::default(),
                Arc::new(PassthroughSigner),
                MetadataCache::default(),
            )
            .expect("client builds"),
        );
        let config = ConnectionConfig {
            buffer_capacity,
            ..Default::default()
        };
        Arc::new(RoomConnection::new(1, api, Arc::new(AnonymousAuth), config))
    }

    fn event(n: u64) -> Event {
        Event::from_payload(json!({"cmd": "TEST", "n": n}))
    }

    const TICK: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_ring_buffer_evicts_oldest() {
        let connection = test_connection(3);
        for n in 1..=5 {
            connection.ingest(event(n));
        }

        let mut listener = connection.subscribe(Some(0)).unwrap();
        let mut indexes = Vec::new();
        while let Some(envelope) = listener.receive(TICK).await {
            indexes.push(envelope.index);
        }

        // Capacity 3: only the newest three survive
        assert_eq!(indexes, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_subscribe_replays_after_cursor_then_live() {
        let connection = test_connection(10);
        for n in 1..=5 {
            connection.ingest(event(n));
        }

        let mut listener = connection.subscribe(Some(2)).unwrap();
        connection.ingest(event(6));

        let mut indexes = Vec::new();
        while let Some(envelope) = listener.receive(TICK).await {
            indexes.push(envelope.index);
        }

        // Replay of (2, 5] in order, then the live event
        assert_eq!(indexes, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_subscribe_without_cursor_gets_live_only() {
        let connection = test_connection(10);
        connection.ingest(event(1));

        let mut listener = connection.subscribe(None).unwrap();
        connection.ingest(event(2));

        let first = listener.receive(TICK).await.unwrap();
        assert_eq!(first.index, 2);
        assert!(listener.receive(TICK).await.is_none());
    }

    #[tokio::test]
    async fn test_full_listener_is_discarded_without_blocking_others() {
        // Buffer 2 -> listener queues hold 4
        let connection = test_connection(2);
        let mut stalled = connection.subscribe(None).unwrap();
        let mut healthy = connection.subscribe(None).unwrap();
        assert_eq!(connection.listener_count(), 2);

        for n in 1..=5 {
            connection.ingest(event(n));
            // The healthy consumer keeps draining; the stalled one never does
            assert_eq!(healthy.receive(TICK).await.unwrap().index, n);
        }

        // The fifth offer found the stalled queue full and dropped it
        assert_eq!(connection.listener_count(), 1);

        // The stalled listener still drains its backlog, then ends
        let mut backlog = Vec::new();
        while let Some(envelope) = stalled.recv().await {
            backlog.push(envelope.index);
        }
        assert_eq!(backlog, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_dropping_listener_unsubscribes() {
        let connection = test_connection(10);
        let listener = connection.subscribe(None).unwrap();
        assert_eq!(connection.listener_count(), 1);

        drop(listener);
        // Removal happens at the next offer
        connection.ingest(event(1));
        assert_eq!(connection.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_after_close_fails() {
        let connection = test_connection(10);
        connection.close();

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(matches!(
            connection.subscribe(None),
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_ingest_frame_decodes_and_buffers() {
        let connection = test_connection(10);
        let payload = json!({"cmd": "DANMU_MSG", "info": []}).to_string();
        let data = frame::encode_frame(frame::PROTO_PLAIN, frame::MSG_DATA, payload.as_bytes());

        connection.ingest_frame(&data);

        assert_eq!(connection.latest_index(), 1);
    }

    #[tokio::test]
    async fn test_event_stream_filters_by_command() {
        let connection = test_connection(10);
        let stream = Arc::clone(&connection).event_stream(Some(0), vec!["KEEP".to_string()]);
        futures_util::pin_mut!(stream);

        connection.ingest(Event::from_payload(json!({"cmd": "KEEP", "n": 1})));
        connection.ingest(Event::from_payload(json!({"cmd": "DROP"})));
        connection.ingest(Event::from_payload(json!({"cmd": "KEEP", "n": 2})));

        let first = timeout(TICK, stream.next()).await.unwrap().unwrap();
        let second = timeout(TICK, stream.next()).await.unwrap().unwrap();
        assert_eq!(first.event.payload["n"], json!(1));
        assert_eq!(second.event.payload["n"], json!(2));
    }

    #[tokio::test]
    async fn test_event_stream_ends_on_close() {
        let connection = test_connection(10);
        let stream = Arc::clone(&connection).event_stream(None, Vec::new());
        futures_util::pin_mut!(stream);

        connection.close();
        assert!(timeout(TICK, stream.next()).await.unwrap().is_none());
    }
}
