//! Remote tracks created on the server's `newConsumer` requests.
//!
//! A consumer moves `Requested -> Accepted -> Active -> Closed`. The remote
//! track is consumed before the server request is acknowledged; a failed
//! consume rejects the request and leaves no entry behind.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::engine::{ConsumeOptions, ConsumerEvent, EngineConsumer, MediaKind, TrackRef};
use crate::error::DialogError;
use crate::events::{DialogEvent, EventSink, RtcLevel, RtcTag};
use crate::pending::{PendingMediaRequests, PendingTrack};
use crate::scope::SessionScope;
use crate::signaling::Responder;
use crate::signaling::protocol::NewConsumer;
use crate::transport::MediaTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    Requested,
    Accepted,
    Active,
    Closed,
}

/// Spatial/temporal layer counts from a `scalabilityMode` such as `L1T3`
/// or `S3T3_KEY`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayerStats {
    pub spatial_layers: u8,
    pub temporal_layers: u8,
    pub ksvc: bool,
}

impl LayerStats {
    pub fn parse(mode: &str) -> Option<Self> {
        let rest = mode.strip_prefix(['L', 'S'])?;
        let (spatial, rest) = rest.split_once('T')?;
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let (temporal, suffix) = rest.split_at(digits);
        let spatial_layers = parse_layers(spatial)?;
        let temporal_layers = parse_layers(temporal)?;
        Some(Self {
            spatial_layers,
            temporal_layers,
            ksvc: suffix.starts_with("_KEY"),
        })
    }

    /// Reads the first encoding's `scalabilityMode` from RTP parameters.
    pub fn from_rtp_parameters(rtp_parameters: &Value) -> Option<Self> {
        rtp_parameters
            .get("encodings")?
            .get(0)?
            .get("scalabilityMode")?
            .as_str()
            .and_then(Self::parse)
    }
}

fn parse_layers(digits: &str) -> Option<u8> {
    if digits.is_empty() || digits.len() > 2 || digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

/// Peers whose media is refused before consumption. Empty by default and
/// shared across sessions.
#[derive(Clone, Default)]
pub struct BlockList {
    peers: Arc<Mutex<HashSet<String>>>,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, peer_id: impl Into<String>) {
        self.peers.lock().insert(peer_id.into());
    }

    pub fn unblock(&self, peer_id: &str) -> bool {
        self.peers.lock().remove(peer_id)
    }

    pub fn is_blocked(&self, peer_id: &str) -> bool {
        self.peers.lock().contains(peer_id)
    }
}

pub struct Consumer {
    id: String,
    peer_id: String,
    engine: Arc<dyn EngineConsumer>,
    stats: Option<LayerStats>,
    app_data: Value,
    state: Mutex<ConsumerState>,
}

impl Consumer {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn producer_id(&self) -> &str {
        self.engine.producer_id()
    }

    pub fn kind(&self) -> MediaKind {
        self.engine.kind()
    }

    pub fn track(&self) -> TrackRef {
        self.engine.track()
    }

    pub fn stats(&self) -> Option<LayerStats> {
        self.stats
    }

    pub fn app_data(&self) -> &Value {
        &self.app_data
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock() = state;
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

struct Shared {
    consumers: Mutex<HashMap<String, Arc<Consumer>>>,
    remote_producers: Mutex<HashSet<String>>,
    downlink_bwe: Mutex<Option<Value>>,
    events: EventSink,
}

impl Shared {
    fn remove(&self, consumer_id: &str) -> Option<Arc<Consumer>> {
        let consumer = self.consumers.lock().remove(consumer_id)?;
        consumer.set_state(ConsumerState::Closed);
        consumer.engine.close();
        tracing::debug!(
            target: "dialog::consumer",
            consumer_id,
            peer_id = %consumer.peer_id,
            "consumer removed"
        );
        Some(consumer)
    }
}

/// Inbound tracks of one session.
pub struct ConsumerRegistry {
    shared: Arc<Shared>,
    pending: Arc<PendingMediaRequests>,
    blocklist: BlockList,
    scope: SessionScope,
}

impl ConsumerRegistry {
    pub fn new(
        pending: Arc<PendingMediaRequests>,
        blocklist: BlockList,
        scope: SessionScope,
        events: EventSink,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                consumers: Mutex::new(HashMap::new()),
                remote_producers: Mutex::new(HashSet::new()),
                downlink_bwe: Mutex::new(None),
                events,
            }),
            pending,
            blocklist,
            scope,
        }
    }

    /// Handles one `newConsumer` request and answers it. Failures are
    /// contained to this consumer.
    pub async fn handle_new_consumer(
        &self,
        transport: Option<Arc<MediaTransport>>,
        request: NewConsumer,
        responder: Responder,
    ) -> Result<Arc<Consumer>, DialogError> {
        let failed = |reason: String| DialogError::ConsumptionFailed {
            producer_id: request.producer_id.clone(),
            reason,
        };

        if self.blocklist.is_blocked(&request.peer_id) {
            responder.reject(403, "peer is blocked");
            return Err(failed(format!("peer {} is blocked", request.peer_id)));
        }
        let Some(transport) = transport else {
            responder.reject(500, "no receive transport");
            return Err(failed("no receive transport".into()));
        };

        tracing::debug!(
            target: "dialog::consumer",
            consumer_id = %request.id,
            producer_id = %request.producer_id,
            peer_id = %request.peer_id,
            kind = %request.kind,
            "consumer requested"
        );
        let handle = match transport
            .engine()
            .consume(ConsumeOptions {
                id: request.id.clone(),
                producer_id: request.producer_id.clone(),
                kind: request.kind,
                rtp_parameters: request.rtp_parameters.clone(),
                app_data: request.app_data.clone(),
            })
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                responder.reject(500, err.to_string());
                let producer_id = request.producer_id.clone();
                self.shared.events.rtc(RtcLevel::Error, RtcTag::Adapter, || {
                    format!("cannot consume producer {producer_id}: {err}")
                });
                return Err(failed(err.to_string()));
            }
        };

        if !self.scope.is_active() {
            handle.consumer.close();
            responder.reject(500, "session closed");
            return Err(DialogError::SessionClosed);
        }

        let stats = match request.kind {
            MediaKind::Video => LayerStats::from_rtp_parameters(handle.consumer.rtp_parameters()),
            MediaKind::Audio => None,
        };
        let consumer = Arc::new(Consumer {
            id: request.id.clone(),
            peer_id: request.peer_id.clone(),
            engine: handle.consumer,
            stats,
            app_data: request.app_data,
            state: Mutex::new(ConsumerState::Accepted),
        });

        let previous = self
            .shared
            .consumers
            .lock()
            .insert(consumer.id.clone(), Arc::clone(&consumer));
        if let Some(previous) = previous {
            previous.set_state(ConsumerState::Closed);
            previous.engine.close();
        }
        responder.accept(json!({}));
        tokio::spawn(watch_consumer(
            Arc::downgrade(&self.shared),
            consumer.id.clone(),
            handle.events,
        ));

        consumer.set_state(ConsumerState::Active);
        let track = consumer.track();
        let delivered = self
            .pending
            .resolve(&consumer.peer_id, consumer.kind(), &track);
        if delivered == 0 {
            self.shared.events.emit(DialogEvent::StreamUpdated {
                peer_id: consumer.peer_id.clone(),
                kind: consumer.kind(),
            });
        }
        tracing::info!(
            target: "dialog::consumer",
            consumer_id = %consumer.id,
            peer_id = %consumer.peer_id,
            kind = %consumer.kind(),
            delivered,
            "consumer active"
        );
        Ok(consumer)
    }

    /// Track of the active consumer for (peer, kind), if any.
    pub fn find_track(&self, peer_id: &str, kind: MediaKind) -> Option<TrackRef> {
        self.shared
            .consumers
            .lock()
            .values()
            .find(|c| c.peer_id == peer_id && c.kind() == kind && c.state() == ConsumerState::Active)
            .map(|c| c.track())
    }

    /// Waits for the remote `kind` track of `peer_id`, resolving at once
    /// when it is already active.
    pub fn request_track(&self, peer_id: &str, kind: MediaKind) -> PendingTrack {
        self.pending
            .register(peer_id, kind, || self.find_track(peer_id, kind))
    }

    /// Removes and closes a consumer. Absent ids are ignored.
    pub fn remove(&self, consumer_id: &str) -> Option<Arc<Consumer>> {
        self.shared.remove(consumer_id)
    }

    pub fn handle_new_producer(&self, producer_id: &str) {
        let inserted = self
            .shared
            .remote_producers
            .lock()
            .insert(producer_id.to_string());
        if inserted {
            tracing::debug!(target: "dialog::consumer", producer_id, "remote producer announced");
        }
    }

    /// Closes every consumer of a producer the server closed.
    pub fn handle_producer_closed(&self, producer_id: &str) -> usize {
        self.shared.remote_producers.lock().remove(producer_id);
        let ids: Vec<String> = self
            .shared
            .consumers
            .lock()
            .values()
            .filter(|c| c.producer_id() == producer_id)
            .map(|c| c.id.clone())
            .collect();
        ids.iter()
            .filter(|id| self.shared.remove(id).is_some())
            .count()
    }

    pub fn set_downlink_bwe(&self, value: Value) {
        *self.shared.downlink_bwe.lock() = Some(value);
    }

    pub fn downlink_bwe(&self) -> Option<Value> {
        self.shared.downlink_bwe.lock().clone()
    }

    pub fn remote_producers(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.shared.remote_producers.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn consumer_stats(&self, consumer_id: &str) -> Option<LayerStats> {
        self.shared
            .consumers
            .lock()
            .get(consumer_id)
            .and_then(|c| c.stats)
    }

    pub fn get(&self, consumer_id: &str) -> Option<Arc<Consumer>> {
        self.shared.consumers.lock().get(consumer_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.consumers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_all(&self) {
        let consumers: Vec<_> = self.shared.consumers.lock().drain().collect();
        for (_, consumer) in consumers {
            consumer.set_state(ConsumerState::Closed);
            consumer.engine.close();
        }
        self.shared.remote_producers.lock().clear();
    }
}

async fn watch_consumer(
    shared: std::sync::Weak<Shared>,
    consumer_id: String,
    mut events: mpsc::UnboundedReceiver<ConsumerEvent>,
) {
    if let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.remove(&consumer_id).is_some() {
            let reason = match event {
                ConsumerEvent::TrackEnded => "track ended",
                ConsumerEvent::TransportClosed => "transport closed",
            };
            shared.events.rtc(RtcLevel::Info, RtcTag::Rtc, || {
                format!("consumer {consumer_id} closed: {reason}")
            });
        }
    }
}
