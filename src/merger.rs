//! Event merger: multi-source fan-in with sliding-window dedup
//!
//! Pumps envelopes from any number of sources into one bounded queue and
//! serves them to a single consumer, suppressing duplicates seen within a
//! sliding time window. Under sustained volume the window tightens
//! adaptively instead of growing without bound.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::MergerConfig;
use crate::features::FeatureRegistry;
use crate::types::Envelope;

type DedupKey = (String, String);

/// Fans in envelopes from many sources and deduplicates them
pub struct EventMerger {
    queue: mpsc::Sender<Envelope>,
    incoming: mpsc::Receiver<Envelope>,
    features: FeatureRegistry,
    seen: HashSet<DedupKey>,
    seen_order: VecDeque<(DedupKey, Instant)>,
    window_capacity: usize,
    duration: Duration,
    pumps: Vec<JoinHandle<()>>,
}

impl Default for EventMerger {
    fn default() -> Self {
        Self::new(MergerConfig::default())
    }
}

impl EventMerger {
    /// Create a merger; config values below the floor are clamped up
    pub fn new(config: MergerConfig) -> Self {
        let (queue, incoming) = mpsc::channel(config.queue_capacity.max(100));
        Self {
            queue,
            incoming,
            features: FeatureRegistry::default(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            window_capacity: config.window_capacity.max(100),
            duration: config.duration.max(Duration::from_secs(5)),
            pumps: Vec::new(),
        }
    }

    /// The fingerprint registry, for installing custom overrides
    pub fn features_mut(&mut self) -> &mut FeatureRegistry {
        &mut self.features
    }

    /// Pump a source into the shared queue
    ///
    /// The offer is non-blocking: when the queue is full the envelope is
    /// dropped with a warning, so a slow consumer backs pressure up into
    /// the ring buffers rather than into the pump tasks. The pump exits
    /// quietly when its source ends.
    pub fn add_source<S>(&mut self, source: S)
    where
        S: Stream<Item = Envelope> + Send + 'static,
    {
        self.pumps.retain(|pump| !pump.is_finished());
        let queue = self.queue.clone();
        self.pumps.push(tokio::spawn(async move {
            futures_util::pin_mut!(source);
            while let Some(envelope) = source.next().await {
                match queue.try_send(envelope) {
                    Ok(()) => {}
                    Err(TrySendError::Full(dropped)) => {
                        warn!(
                            "merger queue full, dropping {} event",
                            dropped.event.command
                        );
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            debug!("merger source ended");
        }));
    }

    /// Next deduplicated envelope
    ///
    /// Pops from the shared queue until an envelope passes the window
    /// filter. `None` only after `close`.
    pub async fn next(&mut self) -> Option<Envelope> {
        while let Some(envelope) = self.incoming.recv().await {
            if self.admit(&envelope) {
                debug!("new {} event", envelope.event.command);
                return Some(envelope);
            }
        }
        None
    }

    /// Like `next`, but gives up after `wait`
    ///
    /// `None` on expiry means "nothing yet", a normal outcome rather than
    /// an error.
    pub async fn next_timeout(&mut self, wait: Duration) -> Option<Envelope> {
        timeout(wait, self.next()).await.unwrap_or(None)
    }

    /// Cancel every pump task
    pub fn close(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        self.incoming.close();
    }

    /// Oldest receipt time still admitted
    ///
    /// Normally `now - duration`. Once the window is at capacity the
    /// cutoff moves to the midpoint between the oldest retained entry and
    /// now, shrinking dedup coverage smoothly under sustained volume.
    fn cutoff(&self, now: Instant) -> Option<Instant> {
        if self.seen.len() < self.window_capacity {
            now.checked_sub(self.duration)
        } else {
            self.seen_order
                .front()
                .map(|(_, first)| *first + (now - *first) / 2)
        }
    }

    fn admit(&mut self, envelope: &Envelope) -> bool {
        let now = Instant::now();
        // Age out stale entries before the membership check, so a repeat
        // first seen more than `duration` ago is eligible again
        self.trim(now);
        if let Some(cutoff) = self.cutoff(now) {
            if envelope.received_at < cutoff {
                return false;
            }
        }

        let key = self.features.extract(&envelope.event);
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key.clone());
        self.seen_order.push_back((key, envelope.received_at));
        self.trim(now);
        true
    }

    /// Evict by count first, then by age
    fn trim(&mut self, now: Instant) {
        while self.seen_order.len() > self.window_capacity {
            if let Some((key, _)) = self.seen_order.pop_front() {
                self.seen.remove(&key);
            }
        }
        if let Some(limit) = now.checked_sub(self.duration) {
            while self
                .seen_order
                .front()
                .is_some_and(|(_, received_at)| *received_at < limit)
            {
                if let Some((key, _)) = self.seen_order.pop_front() {
                    self.seen.remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AnonymousAuth, ApiClient, MetadataCache, PassthroughSigner};
    use crate::config::{ApiConfig, ConnectionConfig};
    use crate::connection::RoomConnection;
    use crate::frame;
    use crate::types::Event;
    use serde_json::{json, Value};
    use std::sync::Arc;

    const TICK: Duration = Duration::from_millis(100);

    fn small_merger(window_capacity: usize) -> EventMerger {
        EventMerger::new(MergerConfig {
            duration: Duration::from_secs(30),
            queue_capacity: 100,
            window_capacity,
        })
    }

    fn chat(text: &str) -> Envelope {
        Envelope::new(
            0,
            Event::from_payload(json!({"cmd": "DANMU_MSG", "info": [[0, 1, 25, 0, 99], text, [1, "u"],
                [], [], [], [], [], [], {"ct": "k"}]})),
        )
    }

    fn envelope_at(received_at: Instant, payload: Value) -> Envelope {
        let mut envelope = Envelope::new(0, Event::from_payload(payload));
        envelope.received_at = received_at;
        envelope
    }

    fn feed(merger: &EventMerger, envelope: Envelope) {
        merger.queue.try_send(envelope).unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_within_window_is_dropped() {
        let mut merger = small_merger(100);

        feed(&merger, chat("aaa"));
        feed(&merger, chat("bbb"));
        feed(&merger, chat("aaa"));

        let first = merger.next_timeout(TICK).await.unwrap();
        let second = merger.next_timeout(TICK).await.unwrap();
        assert!(first.event.payload.to_string().contains("aaa"));
        assert!(second.event.payload.to_string().contains("bbb"));

        // The repeated chat was suppressed
        assert!(merger.next_timeout(TICK).await.is_none());
    }

    #[tokio::test]
    async fn test_repeat_after_window_expiry_is_served_again() {
        let mut merger = small_merger(100);
        // First sighting happened longer than `duration` ago
        let stale = Instant::now() - Duration::from_secs(40);
        let payload = json!({"cmd": "ROOM_CHANGE", "data": {"title": "t"}});

        merger.seen_order.push_back((
            merger.features.extract(&Event::from_payload(payload.clone())),
            stale,
        ));
        merger
            .seen
            .insert(merger.seen_order.back().unwrap().0.clone());

        feed(&merger, envelope_at(Instant::now(), payload));

        // The stale entry ages out before the membership check
        let served = merger.next_timeout(TICK).await;
        assert!(served.is_some());
    }

    #[tokio::test]
    async fn test_events_older_than_window_are_dropped() {
        let mut merger = small_merger(100);
        let stale = Instant::now() - Duration::from_secs(60);

        feed(&merger, envelope_at(stale, json!({"cmd": "OLD"})));
        feed(&merger, envelope_at(Instant::now(), json!({"cmd": "NEW"})));

        let served = merger.next_timeout(TICK).await.unwrap();
        assert_eq!(served.event.command, "NEW");
    }

    #[tokio::test]
    async fn test_capacity_degrade_tightens_cutoff() {
        let mut merger = small_merger(100);
        // Entries seen 20s ago: inside the 30s window, but old enough that
        // the capacity midpoint moves past them
        let earlier = Instant::now() - Duration::from_secs(20);
        for n in 0..100 {
            feed(&merger, envelope_at(earlier, json!({"cmd": "C", "n": n})));
            assert!(merger.next_timeout(TICK).await.is_some());
        }
        assert_eq!(merger.seen.len(), 100);

        // At capacity the cutoff is the midpoint between the oldest entry
        // (20s ago) and now, i.e. roughly 10s ago; a never-seen 20s-old
        // event is now too old even though the plain window would admit it
        let fresh_key = envelope_at(earlier, json!({"cmd": "C", "n": 999}));
        feed(&merger, fresh_key);
        assert!(merger.next_timeout(TICK).await.is_none());
    }

    #[tokio::test]
    async fn test_window_capacity_evicts_oldest_keys() {
        let mut merger = small_merger(100);
        for n in 0..105 {
            feed(&merger, envelope_at(Instant::now(), json!({"cmd": "C", "n": n})));
            let _ = merger.next_timeout(TICK).await;
        }

        assert_eq!(merger.seen.len(), 100);
        assert_eq!(merger.seen_order.len(), merger.seen.len());
        // The very first keys fell out of the window
        let evicted = merger
            .features
            .extract(&Event::from_payload(json!({"cmd": "C", "n": 0})));
        assert!(!merger.seen.contains(&evicted));
    }

    #[tokio::test]
    async fn test_next_timeout_on_empty_queue() {
        let mut merger = small_merger(100);
        assert!(merger.next_timeout(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_pump_from_stream_source() {
        let mut merger = small_merger(100);
        let envelopes = vec![chat("one"), chat("two"), chat("one")];
        merger.add_source(futures_util::stream::iter(envelopes));

        assert!(merger.next_timeout(TICK).await.is_some());
        assert!(merger.next_timeout(TICK).await.is_some());
        assert!(merger.next_timeout(TICK).await.is_none());
    }

    #[tokio::test]
    async fn test_close_cancels_pumps() {
        let mut merger = small_merger(100);
        merger.add_source(futures_util::stream::pending());
        merger.close();

        assert!(merger.next().await.is_none());
    }

    /// Full pipeline: binary frames through a room connection into the
    /// merger, with the duplicate gift suppressed.
    #[tokio::test]
    async fn test_pipeline_dedups_fake_room_traffic() {
        let api = Arc::new(
            ApiClient::new(
                ApiConfig::default(),
                Arc::new(PassthroughSigner),
                MetadataCache::default(),
            )
            .expect("client builds"),
        );
        let connection = Arc::new(RoomConnection::new(
            1,
            api,
            Arc::new(AnonymousAuth),
            ConnectionConfig::default(),
        ));

        let mut merger = EventMerger::default();
        merger.add_source(Arc::clone(&connection).event_stream(Some(0), Vec::new()));

        // Handshake ack, then five data frames: three distinct chats and
        // two gifts sharing a transaction id + timestamp
        connection.ingest_frame(&frame::encode_frame(
            frame::PROTO_ACK,
            8,
            br#"{"code":0}"#,
        ));
        let chats = ["hello", "world", "again"];
        for (n, text) in chats.iter().enumerate() {
            let payload = json!({"cmd": "DANMU_MSG", "info": [[0, 1, 25, 0, n], text, [7, "u"],
                [], [], [], [], [], [], {"ct": "x"}]});
            connection.ingest_frame(&frame::encode_frame(
                frame::PROTO_PLAIN,
                frame::MSG_DATA,
                payload.to_string().as_bytes(),
            ));
        }
        for _ in 0..2 {
            let payload = json!({"cmd": "SEND_GIFT",
                "data": {"tid": "tx-9", "timestamp": 1700000000, "giftName": "rose"}});
            connection.ingest_frame(&frame::encode_frame(
                frame::PROTO_PLAIN,
                frame::MSG_DATA,
                payload.to_string().as_bytes(),
            ));
        }

        let mut commands = Vec::new();
        for _ in 0..4 {
            let envelope = merger
                .next_timeout(Duration::from_secs(1))
                .await
                .expect("four distinct events");
            commands.push(envelope.event.command.clone());
        }

        assert_eq!(
            commands,
            vec!["DANMU_MSG", "DANMU_MSG", "DANMU_MSG", "SEND_GIFT"]
        );
        // The duplicate gift never surfaces; the fifth pull times out
        assert!(merger.next_timeout(TICK).await.is_none());

        merger.close();
        connection.close();
    }
}
