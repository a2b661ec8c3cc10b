use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{OnceCell, mpsc, watch};

use crate::capabilities::Capabilities;
use crate::engine::{EngineProducer, MediaKind, ProduceOptions, ProducerEvent, TrackRef};
use crate::error::DialogError;
use crate::events::{EventSink, RtcLevel, RtcTag};
use crate::scope::SessionScope;
use crate::signaling::{ClientRequest, SignalingChannel};
use crate::transport::MediaTransport;

/// What a local producer carries. At most one producer per kind exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProducerKind {
    Audio,
    VideoCamera,
    VideoScreen,
}

impl ProducerKind {
    pub const ALL: [ProducerKind; 3] = [
        ProducerKind::Audio,
        ProducerKind::VideoCamera,
        ProducerKind::VideoScreen,
    ];

    pub fn media_kind(self) -> MediaKind {
        match self {
            ProducerKind::Audio => MediaKind::Audio,
            ProducerKind::VideoCamera | ProducerKind::VideoScreen => MediaKind::Video,
        }
    }

    pub fn source(self) -> &'static str {
        match self {
            ProducerKind::Audio => "mic",
            ProducerKind::VideoCamera => "webcam",
            ProducerKind::VideoScreen => "share",
        }
    }
}

impl fmt::Display for ProducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source())
    }
}

/// Encoding hints handed to the engine with a new track.
#[derive(Clone, Debug, Default)]
pub struct ProduceParams {
    pub encodings: Option<Value>,
    pub codec_options: Option<Value>,
}

pub struct Producer {
    kind: ProducerKind,
    engine: Arc<dyn EngineProducer>,
    paused: watch::Sender<bool>,
}

impl Producer {
    /// Server-assigned producer id.
    pub fn id(&self) -> &str {
        self.engine.id()
    }

    pub fn kind(&self) -> ProducerKind {
        self.kind
    }

    pub fn track(&self) -> TrackRef {
        self.engine.track()
    }

    pub fn paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Follows the paused flag, including rollbacks after a rejected
    /// pause or resume. Bind mute toggles to this.
    pub fn watch_paused(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    pub fn closed(&self) -> bool {
        self.engine.closed()
    }

    fn set_paused(&self, paused: bool) {
        if paused {
            self.engine.pause();
        } else {
            self.engine.resume();
        }
        self.paused.send_replace(paused);
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("paused", &self.paused())
            .finish()
    }
}

type Slot = Arc<OnceCell<Arc<Producer>>>;

struct Shared {
    channel: SignalingChannel,
    events: EventSink,
    slots: Mutex<HashMap<ProducerKind, Slot>>,
}

impl Shared {
    /// Drops `producer`'s slot if it still holds that producer.
    fn forget(&self, producer: &Arc<Producer>) -> bool {
        let mut slots = self.slots.lock();
        let holds = slots
            .get(&producer.kind)
            .and_then(|slot| slot.get())
            .is_some_and(|current| Arc::ptr_eq(current, producer));
        if holds {
            slots.remove(&producer.kind);
        }
        holds
    }
}

/// Local outbound tracks of one session.
pub struct ProducerRegistry {
    shared: Arc<Shared>,
    capabilities: Capabilities,
    scope: SessionScope,
}

impl ProducerRegistry {
    pub fn new(
        channel: SignalingChannel,
        capabilities: Capabilities,
        scope: SessionScope,
        events: EventSink,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                channel,
                events,
                slots: Mutex::new(HashMap::new()),
            }),
            capabilities,
            scope,
        }
    }

    pub fn get(&self, kind: ProducerKind) -> Option<Arc<Producer>> {
        self.shared
            .slots
            .lock()
            .get(&kind)
            .and_then(|slot| slot.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.shared
            .slots
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Produces `track` over the send transport. A second call for a kind
    /// that already has a producer (or one being created) returns that
    /// producer unchanged.
    pub async fn produce(
        &self,
        transport: &MediaTransport,
        kind: ProducerKind,
        track: TrackRef,
        params: ProduceParams,
    ) -> Result<Arc<Producer>, DialogError> {
        if !self.capabilities.can_produce(kind.media_kind()) {
            return Err(DialogError::CannotProduce(kind.media_kind().to_string()));
        }
        let slot = Arc::clone(self.shared.slots.lock().entry(kind).or_default());

        let producer = slot
            .get_or_try_init(|| async {
                let handle = transport
                    .engine()
                    .produce(ProduceOptions {
                        track,
                        encodings: params.encodings,
                        codec_options: params.codec_options,
                        app_data: json!({ "source": kind.source() }),
                    })
                    .await?;
                let producer = Arc::new(Producer {
                    kind,
                    paused: watch::channel(handle.producer.paused()).0,
                    engine: handle.producer,
                });
                tokio::spawn(watch_producer(
                    Arc::downgrade(&self.shared),
                    Arc::clone(&producer),
                    handle.events,
                ));
                tracing::info!(
                    target: "dialog::producer",
                    producer_id = %producer.id(),
                    kind = %kind,
                    "producer created"
                );
                Ok::<_, DialogError>(producer)
            })
            .await?
            .clone();

        if !self.scope.is_active() {
            self.shared.forget(&producer);
            producer.engine.close();
            return Err(DialogError::SessionClosed);
        }
        Ok(producer)
    }

    pub async fn pause(&self, kind: ProducerKind) -> Result<(), DialogError> {
        self.set_paused(kind, true).await
    }

    pub async fn resume(&self, kind: ProducerKind) -> Result<(), DialogError> {
        self.set_paused(kind, false).await
    }

    async fn set_paused(&self, kind: ProducerKind, paused: bool) -> Result<(), DialogError> {
        let producer = self
            .get(kind)
            .ok_or_else(|| DialogError::ProducerNotFound(kind.to_string()))?;
        let previous = producer.paused();
        producer.set_paused(paused);

        let producer_id = producer.id().to_string();
        let request = if paused {
            ClientRequest::PauseProducer { producer_id }
        } else {
            ClientRequest::ResumeProducer { producer_id }
        };
        if let Err(err) = self.shared.channel.request(request).await {
            producer.set_paused(previous);
            tracing::warn!(
                target: "dialog::producer",
                producer_id = %producer.id(),
                paused,
                error = %err,
                "producer state change rejected; rolled back"
            );
            self.shared.events.rtc(RtcLevel::Error, RtcTag::Adapter, || {
                format!("failed to {} {kind}: {err}", if paused { "pause" } else { "resume" })
            });
            return Err(err);
        }
        Ok(())
    }

    /// Closes the producer for `kind` on the server, then locally.
    pub async fn close(&self, kind: ProducerKind) -> Result<(), DialogError> {
        let slot = {
            let mut slots = self.shared.slots.lock();
            let ready = slots.get(&kind).is_some_and(|slot| slot.initialized());
            if ready { slots.remove(&kind) } else { None }
        };
        let Some(slot) = slot else {
            return Err(DialogError::ProducerNotFound(kind.to_string()));
        };
        let Some(producer) = slot.get().cloned() else {
            return Err(DialogError::ProducerNotFound(kind.to_string()));
        };

        let request = ClientRequest::CloseProducer {
            producer_id: producer.id().to_string(),
        };
        match self.shared.channel.request(request).await {
            Ok(_) => {
                producer.engine.close();
                producer.track().stop();
                tracing::info!(target: "dialog::producer", producer_id = %producer.id(), "producer closed");
                Ok(())
            }
            Err(err) => {
                let restored = {
                    let mut slots = self.shared.slots.lock();
                    if slots.contains_key(&kind) {
                        false
                    } else {
                        slots.insert(kind, slot);
                        true
                    }
                };
                if !restored {
                    producer.engine.close();
                }
                self.shared.events.rtc(RtcLevel::Error, RtcTag::Adapter, || {
                    format!("failed to close {kind}: {err}")
                });
                Err(err)
            }
        }
    }

    /// Local teardown without signaling. Tracks are left running so the
    /// caller can produce them again on a new session.
    pub fn close_all(&self) {
        let slots: Vec<_> = self.shared.slots.lock().drain().collect();
        for (_, slot) in slots {
            if let Some(producer) = slot.get() {
                producer.engine.close();
            }
        }
    }
}

async fn watch_producer(
    shared: std::sync::Weak<Shared>,
    producer: Arc<Producer>,
    mut events: mpsc::UnboundedReceiver<ProducerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match event {
            ProducerEvent::TransportClosed => {
                shared.forget(&producer);
                producer.engine.close();
                shared.events.rtc(RtcLevel::Warn, RtcTag::Rtc, || {
                    format!("{} producer transport closed", producer.kind)
                });
                return;
            }
            ProducerEvent::TrackEnded => {
                if !shared.forget(&producer) {
                    return;
                }
                shared.events.rtc(RtcLevel::Warn, RtcTag::Rtc, || {
                    format!("{} track ended", producer.kind)
                });
                let request = ClientRequest::CloseProducer {
                    producer_id: producer.id().to_string(),
                };
                if let Err(err) = shared.channel.request(request).await {
                    tracing::debug!(
                        target: "dialog::producer",
                        producer_id = %producer.id(),
                        error = %err,
                        "closeProducer after track end failed"
                    );
                }
                producer.engine.close();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities;
    use crate::config::IceRestartPolicy;
    use crate::engine::Direction;
    use crate::engine::mock::{MockEngine, capture_track};
    use crate::signaling::{Frame, LinkEvent, MemoryConnector};
    use crate::transport::{TransportContext, create_transport};
    use std::collections::HashSet;
    use std::time::Duration;
    use url::Url;
    use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

    struct Fixture {
        engine: MockEngine,
        registry: ProducerRegistry,
        transport: Arc<MediaTransport>,
        reject: Arc<Mutex<HashSet<String>>>,
        events: EventSink,
    }

    async fn fixture() -> Fixture {
        let engine = MockEngine::new();
        let (connector, mut accept) = MemoryConnector::new();
        let channel = SignalingChannel::new(Arc::new(connector), Duration::from_secs(5), 0);
        channel
            .open(&Url::parse("wss://p.test/").unwrap())
            .await
            .unwrap();
        let mut peer = accept.recv().await.unwrap();
        let reject: Arc<Mutex<HashSet<String>>> = Arc::default();
        let rejecting = Arc::clone(&reject);
        tokio::spawn(async move {
            let mut producers = 0;
            while let Some(text) = peer.from_client.recv().await {
                let frame = Frame::parse(&text).unwrap();
                let id = frame.id.unwrap();
                let method = frame.method.unwrap();
                let reply = if rejecting.lock().contains(&method) {
                    Frame::failure(id, 500, "rejected")
                } else {
                    match method.as_str() {
                        "createWebRtcTransport" => Frame::success(
                            id,
                            json!({
                                "id": "T1",
                                "iceParameters": {},
                                "iceCandidates": [],
                                "dtlsParameters": {}
                            }),
                        ),
                        "produce" => {
                            producers += 1;
                            tokio::task::yield_now().await;
                            Frame::success(id, json!({ "id": format!("P{producers}") }))
                        }
                        _ => Frame::success(id, json!({ "codecs": [] })),
                    }
                };
                let _ = peer.to_client.send(LinkEvent::Text(reply.to_text().unwrap()));
            }
        });
        let caps = capabilities::negotiate(&channel, &engine).await.unwrap();
        let events = EventSink::new();
        let scope = SessionScope::new(1);
        let ctx = TransportContext {
            channel: channel.clone(),
            capabilities: caps.clone(),
            ice_servers: Vec::new(),
            force_tcp: false,
            ice_transport_policy: RTCIceTransportPolicy::All,
            restart_policy: IceRestartPolicy::default(),
            scope: scope.clone(),
            events: events.clone(),
        };
        let transport = create_transport(Direction::Send, &ctx).await.unwrap();
        Fixture {
            registry: ProducerRegistry::new(channel, caps, scope, events.clone()),
            engine,
            transport,
            reject,
            events,
        }
    }

    #[tokio::test]
    async fn concurrent_produce_for_same_kind_yields_one_producer() {
        let f = fixture().await;
        let (a, b) = tokio::join!(
            f.registry.produce(
                &f.transport,
                ProducerKind::Audio,
                capture_track(MediaKind::Audio),
                ProduceParams::default()
            ),
            f.registry.produce(
                &f.transport,
                ProducerKind::Audio,
                capture_track(MediaKind::Audio),
                ProduceParams::default()
            ),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.engine.journal().count("producer.new"), 1);
    }

    #[tokio::test]
    async fn camera_and_screen_are_separate_slots() {
        let f = fixture().await;
        let camera = f
            .registry
            .produce(&f.transport, ProducerKind::VideoCamera, capture_track(MediaKind::Video), ProduceParams::default())
            .await
            .unwrap();
        let screen = f
            .registry
            .produce(&f.transport, ProducerKind::VideoScreen, capture_track(MediaKind::Video), ProduceParams::default())
            .await
            .unwrap();
        assert_ne!(camera.id(), screen.id());
        assert_eq!(f.registry.len(), 2);
    }

    #[tokio::test]
    async fn rejected_pause_rolls_back_flag_and_watch() {
        let f = fixture().await;
        let producer = f
            .registry
            .produce(&f.transport, ProducerKind::Audio, capture_track(MediaKind::Audio), ProduceParams::default())
            .await
            .unwrap();
        let toggle = producer.watch_paused();
        f.reject.lock().insert("pauseProducer".into());

        let err = f.registry.pause(ProducerKind::Audio).await.unwrap_err();
        assert!(matches!(err, DialogError::SignalingRejected { .. }));
        assert!(!err.is_session_fatal());
        assert!(!producer.paused());
        assert!(!*toggle.borrow());
        assert!(!producer.engine.paused());
    }

    #[tokio::test]
    async fn pause_and_resume_reach_the_server() {
        let f = fixture().await;
        let producer = f
            .registry
            .produce(&f.transport, ProducerKind::Audio, capture_track(MediaKind::Audio), ProduceParams::default())
            .await
            .unwrap();
        f.registry.pause(ProducerKind::Audio).await.unwrap();
        assert!(producer.paused());
        f.reject.lock().insert("resumeProducer".into());
        assert!(f.registry.resume(ProducerKind::Audio).await.is_err());
        assert!(producer.paused());
        assert!(*producer.watch_paused().borrow());
    }

    #[tokio::test]
    async fn rejected_close_restores_the_producer() {
        let f = fixture().await;
        let producer = f
            .registry
            .produce(&f.transport, ProducerKind::Audio, capture_track(MediaKind::Audio), ProduceParams::default())
            .await
            .unwrap();
        f.reject.lock().insert("closeProducer".into());
        assert!(f.registry.close(ProducerKind::Audio).await.is_err());
        let current = f.registry.get(ProducerKind::Audio).unwrap();
        assert!(Arc::ptr_eq(&current, &producer));
        assert!(!producer.closed());

        f.reject.lock().clear();
        f.registry.close(ProducerKind::Audio).await.unwrap();
        assert!(producer.closed());
        assert!(f.registry.get(ProducerKind::Audio).is_none());
        assert!(matches!(
            f.registry.close(ProducerKind::Audio).await,
            Err(DialogError::ProducerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unsupported_kind_is_contained() {
        let f = fixture().await;
        f.engine.disable_kind(MediaKind::Video);
        let err = f
            .registry
            .produce(&f.transport, ProducerKind::VideoCamera, capture_track(MediaKind::Video), ProduceParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DialogError::CannotProduce(_)));
        assert!(!err.is_session_fatal());
    }

    #[tokio::test]
    async fn ended_track_drops_the_producer() {
        let f = fixture().await;
        let mut rx = f.events.subscribe();
        let producer = f
            .registry
            .produce(&f.transport, ProducerKind::Audio, capture_track(MediaKind::Audio), ProduceParams::default())
            .await
            .unwrap();
        f.engine
            .transport(Direction::Send)
            .unwrap()
            .end_producer_track(producer.id());
        loop {
            if let crate::events::DialogEvent::Rtc { message, .. } = rx.recv().await.unwrap() {
                if message.contains("track ended") {
                    break;
                }
            }
        }
        assert!(f.registry.get(ProducerKind::Audio).is_none());
    }

    #[tokio::test]
    async fn transport_close_drops_producers() {
        let f = fixture().await;
        let producer = f
            .registry
            .produce(&f.transport, ProducerKind::Audio, capture_track(MediaKind::Audio), ProduceParams::default())
            .await
            .unwrap();
        f.transport.close();
        for _ in 0..20 {
            if f.registry.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(f.registry.is_empty());
        assert!(producer.closed());
    }
}
