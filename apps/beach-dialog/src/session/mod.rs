//! Session controller: connect, join, reconnect and teardown.
//!
//! ```text
//! Idle -> Connecting -> Negotiating -> CreatingTransports -> Joining -> Joined
//!                 \______________________ unsolicited close ____________/
//!                                            |
//!                                       Reconnecting -> (new Connecting cycle) | Fatal
//! ```
//!
//! Every connection attempt gets its own [`SessionParts`] and
//! [`SessionScope`]; a reconnect discards the old value instead of reusing
//! its fields.

mod dispatch;
mod identity;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

pub use identity::{ServerResolver, SignalingSession, StaticResolver};

use crate::capabilities::{self, Capabilities};
use crate::config::DialogConfig;
use crate::consumer::{BlockList, Consumer, ConsumerRegistry, LayerStats};
use crate::engine::{Direction, MediaEngine, MediaKind, TrackRef};
use crate::error::DialogError;
use crate::events::{DialogEvent, EventSink, RtcLevel, RtcTag};
use crate::pending::PendingMediaRequests;
use crate::producer::{ProduceParams, Producer, ProducerKind, ProducerRegistry};
use crate::scope::SessionScope;
use crate::signaling::protocol::JoinRequest;
use crate::signaling::{ClientRequest, SignalingChannel, SignalingConnector, WebSocketConnector};
use crate::transport::{MediaTransport, TransportContext, TransportManager};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Negotiating,
    CreatingTransports,
    Joining,
    Joined,
    Reconnecting,
    Fatal,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::CreatingTransports => "creating-transports",
            SessionState::Joining => "joining",
            SessionState::Joined => "joined",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Everything owned by one connection attempt.
pub(crate) struct SessionParts {
    identity: SignalingSession,
    scope: SessionScope,
    channel: SignalingChannel,
    transports: TransportManager,
    capabilities: OnceLock<Capabilities>,
    producers: OnceLock<ProducerRegistry>,
    consumers: ConsumerRegistry,
    events: EventSink,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionParts {
    /// Closes transports, producers and consumers, detaches the dispatcher
    /// and closes the channel. Safe to call more than once.
    fn teardown(&self) {
        self.scope.cancel();
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
        if let Some(producers) = self.producers.get() {
            producers.close_all();
        }
        self.consumers.close_all();
        self.transports.close_all();
        self.channel.close();
        tracing::debug!(
            target: "dialog::session",
            generation = self.scope.generation(),
            "session torn down"
        );
    }
}

#[derive(Clone)]
struct LocalMedia {
    track: TrackRef,
    params: ProduceParams,
}

pub(crate) struct ClientInner {
    config: DialogConfig,
    connector: Arc<dyn SignalingConnector>,
    engine: Arc<dyn MediaEngine>,
    resolver: Arc<dyn ServerResolver>,
    events: EventSink,
    state: watch::Sender<SessionState>,
    session: Mutex<Option<Arc<SessionParts>>>,
    pending: Arc<PendingMediaRequests>,
    blocklist: BlockList,
    local_media: Mutex<HashMap<ProducerKind, LocalMedia>>,
    generation: AtomicU64,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ClientInner {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(target: "dialog::session", from = %previous, to = %state, "session state");
        }
    }

    fn current_session(&self) -> Option<Arc<SessionParts>> {
        self.session.lock().clone()
    }

    fn joined_session(&self) -> Result<Arc<SessionParts>, DialogError> {
        if self.state() != SessionState::Joined {
            return Err(DialogError::NotConnected);
        }
        self.current_session().ok_or(DialogError::NotConnected)
    }

    /// Runs one full connection cycle against `identity`. A failure caused
    /// by losing the channel is reported as `UnsolicitedDisconnect`; the
    /// dispatcher then owns recovery.
    async fn establish(self: &Arc<Self>, identity: SignalingSession) -> Result<(), DialogError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let scope = SessionScope::new(generation);
        self.set_state(SessionState::Connecting);
        tracing::info!(
            target: "dialog::session",
            generation,
            url = %identity.url(),
            "connecting"
        );

        let channel = SignalingChannel::new(
            Arc::clone(&self.connector),
            self.config.request_timeout,
            self.config.connect_retries,
        );
        let signaling_events = channel.take_events()?;
        channel.open(identity.url()).await?;

        let parts = Arc::new(SessionParts {
            identity,
            consumers: ConsumerRegistry::new(
                Arc::clone(&self.pending),
                self.blocklist.clone(),
                scope.clone(),
                self.events.clone(),
            ),
            scope,
            channel,
            transports: TransportManager::new(),
            capabilities: OnceLock::new(),
            producers: OnceLock::new(),
            events: self.events.clone(),
            dispatcher: Mutex::new(None),
        });
        let dispatcher = tokio::spawn(dispatch::run(
            Arc::downgrade(self),
            Arc::downgrade(&parts),
            signaling_events,
        ));
        *parts.dispatcher.lock() = Some(dispatcher);
        *self.session.lock() = Some(Arc::clone(&parts));

        match self.join(&parts).await {
            Ok(()) => Ok(()),
            Err(err)
                if err.is_channel_loss()
                    || !parts.scope.is_active()
                    || !parts.channel.is_open() =>
            {
                tracing::warn!(
                    target: "dialog::session",
                    generation,
                    error = %err,
                    "channel lost during setup"
                );
                Err(DialogError::UnsolicitedDisconnect)
            }
            Err(err) => Err(err),
        }
    }

    async fn join(&self, parts: &Arc<SessionParts>) -> Result<(), DialogError> {
        self.set_state(SessionState::Negotiating);
        let caps = capabilities::negotiate(&parts.channel, self.engine.as_ref()).await?;
        ensure_active(&parts.scope)?;
        let _ = parts.capabilities.set(caps.clone());
        let _ = parts.producers.set(ProducerRegistry::new(
            parts.channel.clone(),
            caps.clone(),
            parts.scope.clone(),
            self.events.clone(),
        ));

        self.set_state(SessionState::CreatingTransports);
        let ctx = TransportContext {
            channel: parts.channel.clone(),
            capabilities: caps.clone(),
            ice_servers: parts.identity.server().ice_servers(self.config.force_tcp),
            force_tcp: self.config.force_tcp,
            ice_transport_policy: self.config.ice_transport_policy(),
            restart_policy: self.config.ice_restart,
            scope: parts.scope.clone(),
            events: self.events.clone(),
        };
        parts.transports.create(Direction::Send, &ctx).await?;
        parts.transports.create(Direction::Receive, &ctx).await?;

        self.set_state(SessionState::Joining);
        parts
            .channel
            .request(ClientRequest::Join(JoinRequest {
                display_name: self.config.display_name.clone(),
                device: self.config.device.clone(),
                rtp_capabilities: caps.rtp().clone(),
                sctp_capabilities: caps.sctp().cloned(),
                token: parts.identity.token().map(str::to_string),
            }))
            .await?;
        ensure_active(&parts.scope)?;

        self.set_state(SessionState::Joined);
        self.events.emit(DialogEvent::Connected);
        let room = parts.identity.room_id().to_string();
        self.events
            .rtc(RtcLevel::Info, RtcTag::Adapter, || format!("Joined room {room}"));
        self.restore_local_media(parts).await;
        Ok(())
    }

    async fn restore_local_media(&self, parts: &SessionParts) {
        let media: Vec<_> = {
            let local = self.local_media.lock();
            ProducerKind::ALL
                .into_iter()
                .filter_map(|kind| local.get(&kind).map(|media| (kind, media.clone())))
                .collect()
        };
        for (kind, media) in media {
            match produce_on(parts, kind, media.track, media.params).await {
                Ok(producer) => {
                    tracing::info!(
                        target: "dialog::producer",
                        kind = %kind,
                        producer_id = %producer.id(),
                        "local media restored"
                    );
                }
                Err(err) => {
                    self.events.rtc(RtcLevel::Error, RtcTag::Adapter, || {
                        format!("failed to restore {kind}: {err}")
                    });
                }
            }
        }
    }

    /// Forgets the remembered capture tracks and stops them.
    fn release_local_media(&self) {
        let released: Vec<LocalMedia> = self
            .local_media
            .lock()
            .drain()
            .map(|(_, media)| media)
            .collect();
        for media in released {
            media.track.stop();
        }
    }

    fn go_fatal(&self, reason: String) {
        if let Some(parts) = self.session.lock().take() {
            parts.teardown();
        }
        self.pending.fail_all(|| DialogError::SessionClosed);
        self.release_local_media();
        self.set_state(SessionState::Fatal);
        tracing::error!(target: "dialog::session", reason = %reason, "session fatal");
        let message = reason.clone();
        self.events
            .rtc(RtcLevel::Error, RtcTag::Adapter, move || message);
        self.events
            .emit(DialogEvent::FatalConnectionError { reason });
    }

    /// Recovery after the channel of session `generation` closed on its own.
    fn handle_channel_lost(self: Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let _lifecycle = self.lifecycle.lock().await;
            let abandoned = {
                let mut slot = self.session.lock();
                let current = slot
                    .as_ref()
                    .is_some_and(|parts| parts.scope.generation() == generation);
                if current { slot.take() } else { None }
            };
            let Some(abandoned) = abandoned else {
                tracing::debug!(target: "dialog::session", generation, "ignoring stale channel loss");
                return;
            };

            self.set_state(SessionState::Reconnecting);
            tracing::warn!(target: "dialog::session", generation, "signaling lost; reconnecting");
            abandoned.teardown();
            let previous = abandoned.identity.url().clone();
            drop(abandoned);

            let server = match self.resolver.resolve(&self.config.room_id).await {
                Ok(server) => server,
                Err(err) => {
                    self.go_fatal(format!("failed to resolve room server: {err}"));
                    return;
                }
            };
            let identity = match SignalingSession::new(&self.config, server) {
                Ok(identity) => identity,
                Err(err) => {
                    self.go_fatal(err.to_string());
                    return;
                }
            };
            if identity.url() == &previous {
                self.go_fatal(format!(
                    "room server {} unchanged after disconnect",
                    previous.host_str().unwrap_or_default()
                ));
                return;
            }

            match self.establish(identity).await {
                Ok(()) => {
                    self.events
                        .rtc(RtcLevel::Info, RtcTag::Adapter, || "Reconnected".to_string());
                }
                Err(err) => self.go_fatal(format!("reconnect failed: {err}")),
            }
        })
    }
}

fn ensure_active(scope: &SessionScope) -> Result<(), DialogError> {
    if scope.is_active() {
        Ok(())
    } else {
        Err(DialogError::SessionClosed)
    }
}

async fn produce_on(
    parts: &SessionParts,
    kind: ProducerKind,
    track: TrackRef,
    params: ProduceParams,
) -> Result<Arc<Producer>, DialogError> {
    let transport = parts
        .transports
        .send_transport()
        .ok_or(DialogError::NotConnected)?;
    let producers = parts.producers.get().ok_or(DialogError::NotConnected)?;
    producers.produce(&transport, kind, track, params).await
}

/// Application-facing handle to a media session. Cheap to clone.
#[derive(Clone)]
pub struct DialogClient {
    inner: Arc<ClientInner>,
}

impl DialogClient {
    /// Connects over WebSocket and never fails over to another server.
    pub fn new(config: DialogConfig, engine: Arc<dyn MediaEngine>) -> Self {
        let resolver = Arc::new(StaticResolver::new(config.server.clone()));
        Self::with_parts(config, Arc::new(WebSocketConnector), engine, resolver)
    }

    pub fn with_parts(
        config: DialogConfig,
        connector: Arc<dyn SignalingConnector>,
        engine: Arc<dyn MediaEngine>,
        resolver: Arc<dyn ServerResolver>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(ClientInner {
                config,
                connector,
                engine,
                resolver,
                events: EventSink::new(),
                state,
                session: Mutex::new(None),
                pending: Arc::new(PendingMediaRequests::new()),
                blocklist: BlockList::new(),
                local_media: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &DialogConfig {
        &self.inner.config
    }

    pub fn events(&self) -> broadcast::Receiver<DialogEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn blocklist(&self) -> &BlockList {
        &self.inner.blocklist
    }

    pub fn pending_requests(&self) -> &PendingMediaRequests {
        &self.inner.pending
    }

    /// Identity of the current connection, if any.
    pub fn session(&self) -> Option<SignalingSession> {
        self.inner
            .current_session()
            .map(|parts| parts.identity.clone())
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        self.inner
            .current_session()
            .and_then(|parts| parts.capabilities.get().cloned())
    }

    /// Connects, negotiates, creates both transports and joins the room.
    ///
    /// Capability and transport failures are fatal. If the channel drops
    /// mid-setup this returns `UnsolicitedDisconnect` and a single
    /// reconnect is attempted in the background; [`Self::watch_state`]
    /// reports whether it ends in `Joined` or `Fatal`.
    ///
    /// Tracks handed to `enable` are stopped by `disconnect` and by a
    /// fatal teardown.
    pub async fn connect(&self) -> Result<(), DialogError> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        match inner.state() {
            SessionState::Idle | SessionState::Fatal => {}
            SessionState::Joined => return Ok(()),
            _ => return Err(DialogError::OpenInProgress),
        }

        let identity = SignalingSession::new(&inner.config, inner.config.server.clone())?;
        match inner.establish(identity).await {
            Ok(()) => Ok(()),
            Err(DialogError::UnsolicitedDisconnect) => Err(DialogError::UnsolicitedDisconnect),
            Err(err) => {
                inner.go_fatal(err.to_string());
                Err(err)
            }
        }
    }

    /// Tears the session down without emitting a fatal event.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        let parts = inner.session.lock().take();
        if let Some(parts) = parts {
            parts.teardown();
        }
        inner.pending.fail_all(|| DialogError::SessionClosed);
        inner.release_local_media();
        inner.set_state(SessionState::Idle);
        tracing::info!(target: "dialog::session", "disconnected");
    }

    /// Produces `track` as `kind` and remembers it so it is produced again
    /// after a reconnect.
    pub async fn enable(
        &self,
        kind: ProducerKind,
        track: TrackRef,
        params: ProduceParams,
    ) -> Result<Arc<Producer>, DialogError> {
        if track.kind() != kind.media_kind() {
            return Err(DialogError::CannotProduce(format!(
                "{} track as {kind}",
                track.kind()
            )));
        }
        let parts = self.inner.joined_session()?;
        let producer = produce_on(&parts, kind, track, params.clone()).await?;
        self.inner.local_media.lock().insert(
            kind,
            LocalMedia {
                track: producer.track(),
                params,
            },
        );
        Ok(producer)
    }

    pub async fn disable(&self, kind: ProducerKind) -> Result<(), DialogError> {
        let parts = self.inner.joined_session()?;
        let producers = parts.producers.get().ok_or(DialogError::NotConnected)?;
        match producers.close(kind).await {
            Ok(()) | Err(DialogError::ProducerNotFound(_)) => {
                self.inner.local_media.lock().remove(&kind);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn pause(&self, kind: ProducerKind) -> Result<(), DialogError> {
        let parts = self.inner.joined_session()?;
        let producers = parts.producers.get().ok_or(DialogError::NotConnected)?;
        producers.pause(kind).await
    }

    pub async fn resume(&self, kind: ProducerKind) -> Result<(), DialogError> {
        let parts = self.inner.joined_session()?;
        let producers = parts.producers.get().ok_or(DialogError::NotConnected)?;
        producers.resume(kind).await
    }

    pub async fn enable_mic(&self, track: TrackRef) -> Result<Arc<Producer>, DialogError> {
        self.enable(ProducerKind::Audio, track, ProduceParams::default())
            .await
    }

    pub async fn disable_mic(&self) -> Result<(), DialogError> {
        self.disable(ProducerKind::Audio).await
    }

    pub async fn mute_mic(&self) -> Result<(), DialogError> {
        self.pause(ProducerKind::Audio).await
    }

    pub async fn unmute_mic(&self) -> Result<(), DialogError> {
        self.resume(ProducerKind::Audio).await
    }

    pub async fn enable_webcam(&self, track: TrackRef) -> Result<Arc<Producer>, DialogError> {
        self.enable(ProducerKind::VideoCamera, track, ProduceParams::default())
            .await
    }

    pub async fn disable_webcam(&self) -> Result<(), DialogError> {
        self.disable(ProducerKind::VideoCamera).await
    }

    pub async fn enable_share(&self, track: TrackRef) -> Result<Arc<Producer>, DialogError> {
        self.enable(ProducerKind::VideoScreen, track, ProduceParams::default())
            .await
    }

    pub async fn disable_share(&self) -> Result<(), DialogError> {
        self.disable(ProducerKind::VideoScreen).await
    }

    pub fn producer(&self, kind: ProducerKind) -> Option<Arc<Producer>> {
        self.inner
            .current_session()
            .and_then(|parts| parts.producers.get().and_then(|p| p.get(kind)))
    }

    /// Waits for the remote `kind` track of `peer_id`. Resolves at once if
    /// it is already being consumed; fails with `SessionClosed` if the
    /// session is disconnected or goes fatal first.
    pub async fn get_media_stream(
        &self,
        peer_id: &str,
        kind: MediaKind,
    ) -> Result<TrackRef, DialogError> {
        let pending = match self.inner.state() {
            SessionState::Idle | SessionState::Fatal => return Err(DialogError::NotConnected),
            _ => match self.inner.current_session() {
                Some(parts) => parts.consumers.request_track(peer_id, kind),
                None => self.inner.pending.register(peer_id, kind, || None),
            },
        };
        pending.wait().await
    }

    pub fn transport(&self, direction: Direction) -> Option<Arc<MediaTransport>> {
        self.inner
            .current_session()
            .and_then(|parts| parts.transports.get(direction))
    }

    pub fn consumer_count(&self) -> usize {
        self.inner
            .current_session()
            .map_or(0, |parts| parts.consumers.len())
    }

    pub fn consumer(&self, consumer_id: &str) -> Option<Arc<Consumer>> {
        self.inner
            .current_session()
            .and_then(|parts| parts.consumers.get(consumer_id))
    }

    pub fn consumer_stats(&self, consumer_id: &str) -> Option<LayerStats> {
        self.inner
            .current_session()
            .and_then(|parts| parts.consumers.consumer_stats(consumer_id))
    }

    pub fn downlink_bwe(&self) -> Option<Value> {
        self.inner
            .current_session()
            .and_then(|parts| parts.consumers.downlink_bwe())
    }

    pub fn remote_producers(&self) -> Vec<String> {
        self.inner
            .current_session()
            .map(|parts| parts.consumers.remote_producers())
            .unwrap_or_default()
    }
}
