//! In-memory media engine used by tests and by applications that want to
//! drive the orchestrator without real media.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use super::{
    ConsumeOptions, ConsumerEvent, ConsumerHandle, Device, Direction, EngineConsumer,
    EngineError, EngineProducer, EngineTransport, MediaEngine, MediaKind, MediaTrack,
    ProduceOptions, ProducerEvent, ProducerHandle, TrackRef, TransportEvent, TransportHandle,
    TransportOptions,
};

/// Shared, ordered record of what the mock engine was asked to do.
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

#[derive(Debug)]
pub struct MockTrack {
    id: String,
    kind: MediaKind,
    stopped: AtomicBool,
}

impl MockTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Knobs {
    fail_load: bool,
    repeat_connect: bool,
    unsupported: HashSet<MediaKind>,
    failing_producers: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct MockEngine {
    journal: Journal,
    knobs: Arc<Mutex<Knobs>>,
    transports: Arc<Mutex<Vec<Arc<MockTransport>>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Makes every subsequent `Device::load` reject.
    pub fn fail_load(&self, fail: bool) {
        self.knobs.lock().fail_load = fail;
    }

    /// Makes transports raise `Connect` before every produce/consume instead
    /// of only the first one.
    pub fn repeat_connect(&self, repeat: bool) {
        self.knobs.lock().repeat_connect = repeat;
    }

    pub fn disable_kind(&self, kind: MediaKind) {
        self.knobs.lock().unsupported.insert(kind);
    }

    /// Makes `consume` fail for the given remote producer id.
    pub fn fail_consume_for(&self, producer_id: impl Into<String>) {
        self.knobs.lock().failing_producers.insert(producer_id.into());
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.transports.lock().clone()
    }

    /// Most recently created transport for `direction`.
    pub fn transport(&self, direction: Direction) -> Option<Arc<MockTransport>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|t| t.direction == direction)
            .cloned()
    }
}

impl MediaEngine for MockEngine {
    fn new_device(&self) -> Arc<dyn Device> {
        self.journal.record("device.new");
        Arc::new(MockDevice {
            engine: self.clone(),
            router: Mutex::new(None),
        })
    }
}

struct MockDevice {
    engine: MockEngine,
    router: Mutex<Option<Value>>,
}

impl MockDevice {
    fn create(
        &self,
        direction: Direction,
        options: TransportOptions,
    ) -> Result<TransportHandle, EngineError> {
        if !self.loaded() {
            return Err(EngineError::InvalidState("device not loaded".into()));
        }
        let (events_tx, events) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            id: options.id.clone(),
            direction,
            options,
            engine: self.engine.clone(),
            events_tx,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            restarts: Mutex::new(Vec::new()),
        });
        self.engine
            .journal
            .record(format!("transport.create:{}:{}", direction.as_str(), transport.id));
        self.engine.transports.lock().push(Arc::clone(&transport));
        Ok(TransportHandle {
            transport,
            events,
        })
    }
}

#[async_trait]
impl Device for MockDevice {
    async fn load(&self, router_rtp_capabilities: &Value) -> Result<(), EngineError> {
        if self.engine.knobs.lock().fail_load {
            return Err(EngineError::Unsupported("no common codecs".into()));
        }
        if !router_rtp_capabilities.is_object() {
            return Err(EngineError::Rejected("capabilities must be an object".into()));
        }
        *self.router.lock() = Some(router_rtp_capabilities.clone());
        self.engine.journal.record("device.load");
        Ok(())
    }

    fn loaded(&self) -> bool {
        self.router.lock().is_some()
    }

    fn rtp_capabilities(&self) -> Result<Value, EngineError> {
        self.router
            .lock()
            .clone()
            .ok_or_else(|| EngineError::InvalidState("device not loaded".into()))
    }

    fn sctp_capabilities(&self) -> Option<Value> {
        None
    }

    fn can_produce(&self, kind: MediaKind) -> bool {
        self.loaded() && !self.engine.knobs.lock().unsupported.contains(&kind)
    }

    fn create_send_transport(&self, options: TransportOptions) -> Result<TransportHandle, EngineError> {
        self.create(Direction::Send, options)
    }

    fn create_recv_transport(&self, options: TransportOptions) -> Result<TransportHandle, EngineError> {
        self.create(Direction::Receive, options)
    }
}

pub struct MockTransport {
    id: String,
    direction: Direction,
    options: TransportOptions,
    engine: MockEngine,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    connected: AtomicBool,
    closed: AtomicBool,
    producers: Mutex<Vec<(Arc<MockProducer>, mpsc::UnboundedSender<ProducerEvent>)>>,
    consumers: Mutex<Vec<(Arc<MockConsumer>, mpsc::UnboundedSender<ConsumerEvent>)>>,
    restarts: Mutex<Vec<Value>>,
}

impl MockTransport {
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Simulates an ICE/DTLS state transition.
    pub fn set_connection_state(&self, state: RTCPeerConnectionState) {
        let _ = self
            .events_tx
            .send(TransportEvent::ConnectionStateChange(state));
    }

    pub fn ice_restarts(&self) -> Vec<Value> {
        self.restarts.lock().clone()
    }

    pub fn consumers(&self) -> Vec<Arc<MockConsumer>> {
        self.consumers.lock().iter().map(|(c, _)| Arc::clone(c)).collect()
    }

    pub fn producers(&self) -> Vec<Arc<MockProducer>> {
        self.producers.lock().iter().map(|(p, _)| Arc::clone(p)).collect()
    }

    /// Ends the capture track behind a producer, as a device unplug would.
    pub fn end_producer_track(&self, producer_id: &str) {
        for (producer, tx) in self.producers.lock().iter() {
            if producer.id == producer_id {
                let _ = tx.send(ProducerEvent::TrackEnded);
            }
        }
    }

    /// Delivers a transport-close to one consumer without closing the
    /// transport itself.
    pub fn signal_consumer_transport_closed(&self, consumer_id: &str) {
        for (consumer, tx) in self.consumers.lock().iter() {
            if consumer.id == consumer_id {
                let _ = tx.send(ConsumerEvent::TransportClosed);
            }
        }
    }

    async fn ensure_connected(&self) -> Result<(), EngineError> {
        let repeat = self.engine.knobs.lock().repeat_connect;
        if self.connected.load(Ordering::SeqCst) && !repeat {
            return Ok(());
        }
        let (reply, response) = oneshot::channel();
        self.events_tx
            .send(TransportEvent::Connect {
                dtls_parameters: json!({ "role": "client", "fingerprints": [] }),
                reply,
            })
            .map_err(|_| EngineError::Closed)?;
        match response.await {
            Ok(Ok(())) => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(reason)) => Err(EngineError::Rejected(reason)),
            Err(_) => Err(EngineError::Closed),
        }
    }
}

#[async_trait]
impl EngineTransport for MockTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    async fn produce(&self, options: ProduceOptions) -> Result<ProducerHandle, EngineError> {
        if self.closed() {
            return Err(EngineError::Closed);
        }
        if self.direction != Direction::Send {
            return Err(EngineError::InvalidState("not a send transport".into()));
        }
        self.ensure_connected().await?;

        let kind = options.track.kind();
        let (reply, response) = oneshot::channel();
        self.events_tx
            .send(TransportEvent::Produce {
                kind,
                rtp_parameters: json!({ "codecs": [], "encodings": options.encodings }),
                app_data: options.app_data.clone(),
                reply,
            })
            .map_err(|_| EngineError::Closed)?;
        let id = match response.await {
            Ok(Ok(id)) => id,
            Ok(Err(reason)) => return Err(EngineError::Rejected(reason)),
            Err(_) => return Err(EngineError::Closed),
        };

        let producer = Arc::new(MockProducer {
            id: id.clone(),
            kind,
            track: options.track,
            journal: self.engine.journal.clone(),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let (tx, events) = mpsc::unbounded_channel();
        self.producers.lock().push((Arc::clone(&producer), tx));
        self.engine.journal.record(format!("producer.new:{id}"));
        Ok(ProducerHandle { producer, events })
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<ConsumerHandle, EngineError> {
        if self.closed() {
            return Err(EngineError::Closed);
        }
        if self.direction != Direction::Receive {
            return Err(EngineError::InvalidState("not a receive transport".into()));
        }
        let failing = self
            .engine
            .knobs
            .lock()
            .failing_producers
            .contains(&options.producer_id);
        if failing {
            return Err(EngineError::Rejected(format!(
                "cannot consume producer {}",
                options.producer_id
            )));
        }
        self.ensure_connected().await?;

        let track = MockTrack::new(format!("remote-{}", options.id), options.kind);
        let consumer = Arc::new(MockConsumer {
            id: options.id.clone(),
            producer_id: options.producer_id,
            kind: options.kind,
            track,
            rtp_parameters: options.rtp_parameters,
            journal: self.engine.journal.clone(),
            closed: AtomicBool::new(false),
        });
        let (tx, events) = mpsc::unbounded_channel();
        self.consumers.lock().push((Arc::clone(&consumer), tx));
        self.engine.journal.record(format!("consumer.new:{}", options.id));
        Ok(ConsumerHandle { consumer, events })
    }

    async fn restart_ice(&self, ice_parameters: Value) -> Result<(), EngineError> {
        if self.closed() {
            return Err(EngineError::Closed);
        }
        self.restarts.lock().push(ice_parameters);
        self.engine
            .journal
            .record(format!("transport.restart_ice:{}", self.id));
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.engine.journal.record(format!(
            "transport.close:{}:{}",
            self.direction.as_str(),
            self.id
        ));
        for (_, tx) in self.producers.lock().iter() {
            let _ = tx.send(ProducerEvent::TransportClosed);
        }
        for (_, tx) in self.consumers.lock().iter() {
            let _ = tx.send(ConsumerEvent::TransportClosed);
        }
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct MockProducer {
    id: String,
    kind: MediaKind,
    track: TrackRef,
    journal: Journal,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl EngineProducer for MockProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> TrackRef {
        Arc::clone(&self.track)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.journal.record(format!("producer.close:{}", self.id));
        }
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct MockConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    track: Arc<MockTrack>,
    rtp_parameters: Value,
    journal: Journal,
    closed: AtomicBool,
}

impl EngineConsumer for MockConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> TrackRef {
        self.track.clone()
    }

    fn rtp_parameters(&self) -> &Value {
        &self.rtp_parameters
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.journal.record(format!("consumer.close:{}", self.id));
        }
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

static NEXT_TRACK: AtomicU64 = AtomicU64::new(1);

/// Convenience for tests: a fresh local capture track.
pub fn capture_track(kind: MediaKind) -> TrackRef {
    let n = NEXT_TRACK.fetch_add(1, Ordering::Relaxed);
    MockTrack::new(format!("local-{kind}-{n}"), kind)
}
