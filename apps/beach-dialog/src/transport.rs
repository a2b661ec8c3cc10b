//! Send/receive transport lifecycle.
//!
//! Each engine transport gets an event pump that bridges its handshake to
//! the room server: `Connect` is forwarded as `connectWebRtcTransport`
//! exactly once per transport, `Produce` as `produce`, and a `failed`
//! connection state schedules a bounded ICE restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{OnceCell, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

use crate::capabilities::Capabilities;
use crate::config::IceRestartPolicy;
use crate::engine::{Direction, EngineTransport, MediaKind, TransportEvent, TransportOptions};
use crate::error::DialogError;
use crate::events::{EventSink, RtcLevel, RtcTag};
use crate::scope::SessionScope;
use crate::signaling::SignalingChannel;
use crate::signaling::protocol::{
    ClientRequest, ProduceRequest, ProduceResponse, RestartIceResponse, TransportInfo,
};

/// Everything a transport needs from the session that owns it.
#[derive(Clone)]
pub struct TransportContext {
    pub channel: SignalingChannel,
    pub capabilities: Capabilities,
    pub ice_servers: Vec<RTCIceServer>,
    pub force_tcp: bool,
    pub ice_transport_policy: RTCIceTransportPolicy,
    pub restart_policy: IceRestartPolicy,
    pub scope: SessionScope,
    pub events: EventSink,
}

pub struct MediaTransport {
    direction: Direction,
    engine: Arc<dyn EngineTransport>,
    state: watch::Receiver<RTCPeerConnectionState>,
    restarts: Arc<AtomicU32>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MediaTransport {
    pub fn id(&self) -> &str {
        self.engine.id()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn engine(&self) -> &Arc<dyn EngineTransport> {
        &self.engine
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RTCPeerConnectionState> {
        self.state.clone()
    }

    /// ICE restarts issued since the transport last reached `connected`.
    pub fn restart_attempts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.engine.closed()
    }

    /// Closes the engine transport and stops its pump. Idempotent.
    pub fn close(&self) {
        self.engine.close();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for MediaTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTransport")
            .field("id", &self.id())
            .field("direction", &self.direction)
            .field("state", &self.connection_state())
            .finish()
    }
}

/// Requests server-side transport parameters, builds the engine transport
/// and starts its event pump.
pub async fn create_transport(
    direction: Direction,
    ctx: &TransportContext,
) -> Result<Arc<MediaTransport>, DialogError> {
    let failed = |reason: String| DialogError::TransportCreationFailed {
        direction: direction.as_str(),
        reason,
    };

    let info: TransportInfo = ctx
        .channel
        .request_as(ClientRequest::CreateWebRtcTransport {
            force_tcp: ctx.force_tcp,
            producing: direction == Direction::Send,
            consuming: direction == Direction::Receive,
        })
        .await
        .map_err(|err| failed(err.to_string()))?;

    if !ctx.scope.is_active() {
        return Err(DialogError::SessionClosed);
    }

    let options = TransportOptions {
        id: info.id,
        ice_parameters: info.ice_parameters,
        ice_candidates: info.ice_candidates,
        dtls_parameters: info.dtls_parameters,
        sctp_parameters: info.sctp_parameters,
        ice_servers: ctx.ice_servers.clone(),
        ice_transport_policy: ctx.ice_transport_policy,
    };
    let device = ctx.capabilities.device();
    let handle = match direction {
        Direction::Send => device.create_send_transport(options),
        Direction::Receive => device.create_recv_transport(options),
    }
    .map_err(|err| failed(err.to_string()))?;

    let (state_tx, state) = watch::channel(RTCPeerConnectionState::New);
    let restarts = Arc::new(AtomicU32::new(0));
    let pump = EventPump {
        direction,
        transport: Arc::clone(&handle.transport),
        ctx: ctx.clone(),
        connected: Arc::new(OnceCell::new()),
        state_tx,
        restarts: Arc::clone(&restarts),
        restart_task: None,
    };
    let pump = tokio::spawn(pump.run(handle.events));

    tracing::debug!(
        target: "dialog::transport",
        direction = direction.as_str(),
        transport_id = %handle.transport.id(),
        "transport created"
    );

    Ok(Arc::new(MediaTransport {
        direction,
        engine: handle.transport,
        state,
        restarts,
        pump: Mutex::new(Some(pump)),
    }))
}

struct EventPump {
    direction: Direction,
    transport: Arc<dyn EngineTransport>,
    ctx: TransportContext,
    connected: Arc<OnceCell<Result<(), String>>>,
    state_tx: watch::Sender<RTCPeerConnectionState>,
    restarts: Arc<AtomicU32>,
    restart_task: Option<JoinHandle<()>>,
}

impl EventPump {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let scope = self.ctx.scope.clone();
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = scope.cancelled() => None,
            };
            let Some(event) = event else { break };
            match event {
                TransportEvent::Connect {
                    dtls_parameters,
                    reply,
                } => self.on_connect(dtls_parameters, reply),
                TransportEvent::Produce {
                    kind,
                    rtp_parameters,
                    app_data,
                    reply,
                } => self.on_produce(kind, rtp_parameters, app_data, reply),
                TransportEvent::ConnectionStateChange(state) => self.on_state(state),
            }
        }
        if let Some(task) = self.restart_task.take() {
            task.abort();
        }
    }

    fn on_connect(&self, dtls_parameters: Value, reply: oneshot::Sender<Result<(), String>>) {
        let connected = Arc::clone(&self.connected);
        let channel = self.ctx.channel.clone();
        let scope = self.ctx.scope.clone();
        let transport_id = self.transport.id().to_string();
        tokio::spawn(async move {
            let outcome = connected
                .get_or_init(|| async {
                    channel
                        .request(ClientRequest::ConnectWebRtcTransport {
                            transport_id,
                            dtls_parameters,
                        })
                        .await
                        .map(|_| ())
                        .map_err(|err| err.to_string())
                })
                .await
                .clone();
            let outcome = if scope.is_active() {
                outcome
            } else {
                Err("session closed".to_string())
            };
            let _ = reply.send(outcome);
        });
    }

    fn on_produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
        reply: oneshot::Sender<Result<String, String>>,
    ) {
        let channel = self.ctx.channel.clone();
        let scope = self.ctx.scope.clone();
        let transport_id = self.transport.id().to_string();
        tokio::spawn(async move {
            let outcome = channel
                .request_as::<ProduceResponse>(ClientRequest::Produce(ProduceRequest {
                    transport_id,
                    kind,
                    rtp_parameters,
                    app_data,
                }))
                .await
                .map(|response| response.id)
                .map_err(|err| err.to_string());
            let outcome = match outcome {
                Ok(_) if !scope.is_active() => Err("session closed".to_string()),
                other => other,
            };
            let _ = reply.send(outcome);
        });
    }

    fn on_state(&mut self, state: RTCPeerConnectionState) {
        self.state_tx.send_replace(state);
        let label = match self.direction {
            Direction::Send => "Send",
            Direction::Receive => "Receive",
        };
        match state {
            RTCPeerConnectionState::Connected => {
                self.restarts.store(0, Ordering::SeqCst);
                if let Some(task) = self.restart_task.take() {
                    task.abort();
                }
                self.ctx
                    .events
                    .rtc(RtcLevel::Info, RtcTag::Rtc, || format!("{label} transport state: {state}"));
            }
            RTCPeerConnectionState::Disconnected => {
                self.ctx
                    .events
                    .rtc(RtcLevel::Warn, RtcTag::Rtc, || format!("{label} transport state: {state}"));
            }
            RTCPeerConnectionState::Failed => {
                self.ctx
                    .events
                    .rtc(RtcLevel::Error, RtcTag::Rtc, || format!("{label} transport state: {state}"));
                self.schedule_restart();
            }
            _ => {
                self.ctx
                    .events
                    .rtc(RtcLevel::Info, RtcTag::Rtc, || format!("{label} transport state: {state}"));
            }
        }
    }

    fn schedule_restart(&mut self) {
        if self.restart_task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let policy = self.ctx.restart_policy;
        let attempt = self.restarts.load(Ordering::SeqCst) + 1;
        if attempt > policy.max_attempts {
            let transport_id = self.transport.id().to_string();
            tracing::error!(
                target: "dialog::transport",
                transport_id = %transport_id,
                attempts = policy.max_attempts,
                "ice restart attempts exhausted"
            );
            self.ctx.events.rtc(RtcLevel::Error, RtcTag::Rtc, || {
                format!("ICE restart gave up on transport {transport_id}")
            });
            return;
        }
        self.restarts.store(attempt, Ordering::SeqCst);

        let delay = policy.delay_for(attempt);
        let transport = Arc::clone(&self.transport);
        let channel = self.ctx.channel.clone();
        let scope = self.ctx.scope.clone();
        let events = self.ctx.events.clone();
        self.restart_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !scope.is_active() || transport.closed() {
                return;
            }
            tracing::info!(
                target: "dialog::transport",
                transport_id = %transport.id(),
                attempt,
                "restarting ice"
            );
            let response = channel
                .request_as::<RestartIceResponse>(ClientRequest::RestartIce {
                    transport_id: transport.id().to_string(),
                })
                .await;
            let result = match response {
                Ok(response) if scope.is_active() => transport
                    .restart_ice(response.ice_parameters)
                    .await
                    .map_err(DialogError::from),
                Ok(_) => return,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                events.rtc(RtcLevel::Error, RtcTag::Rtc, || {
                    format!("ICE restart failed: {err}")
                });
            }
        }));
    }
}

/// Owns the send and receive transports of the current session.
#[derive(Default)]
pub struct TransportManager {
    send: Mutex<Option<Arc<MediaTransport>>>,
    recv: Mutex<Option<Arc<MediaTransport>>>,
}

impl TransportManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, direction: Direction) -> &Mutex<Option<Arc<MediaTransport>>> {
        match direction {
            Direction::Send => &self.send,
            Direction::Receive => &self.recv,
        }
    }

    /// Creates the transport for `direction`, replacing (and closing) any
    /// previous one.
    pub async fn create(
        &self,
        direction: Direction,
        ctx: &TransportContext,
    ) -> Result<Arc<MediaTransport>, DialogError> {
        let transport = create_transport(direction, ctx).await?;
        if !ctx.scope.is_active() {
            transport.close();
            return Err(DialogError::SessionClosed);
        }
        let previous = self.slot(direction).lock().replace(Arc::clone(&transport));
        if let Some(previous) = previous {
            previous.close();
        }
        Ok(transport)
    }

    pub fn get(&self, direction: Direction) -> Option<Arc<MediaTransport>> {
        self.slot(direction).lock().clone()
    }

    pub fn send_transport(&self) -> Option<Arc<MediaTransport>> {
        self.get(Direction::Send)
    }

    pub fn recv_transport(&self) -> Option<Arc<MediaTransport>> {
        self.get(Direction::Receive)
    }

    /// Closes whatever transports exist; absent slots are skipped.
    pub fn close_all(&self) {
        for direction in [Direction::Send, Direction::Receive] {
            let transport = self.slot(direction).lock().take();
            if let Some(transport) = transport {
                tracing::debug!(
                    target: "dialog::transport",
                    direction = direction.as_str(),
                    transport_id = %transport.id(),
                    "closing transport"
                );
                transport.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities;
    use crate::engine::mock::{MockEngine, capture_track};
    use crate::engine::ProduceOptions;
    use crate::signaling::{Frame, LinkEvent, MemoryConnector, MemoryPeer};
    use serde_json::json;
    use std::time::Duration;
    use url::Url;

    /// Answers every request; counts the ones by method.
    fn spawn_server(mut peer: MemoryPeer, calls: Arc<Mutex<Vec<Value>>>, reject_connect: bool) {
        tokio::spawn(async move {
            let mut transports = 0;
            let mut producers = 0;
            while let Some(text) = peer.from_client.recv().await {
                let frame = Frame::parse(&text).unwrap();
                let id = frame.id.unwrap();
                let method = frame.method.clone().unwrap();
                calls
                    .lock()
                    .push(json!({ "method": method, "data": frame.data.clone() }));
                let reply = match method.as_str() {
                    "getRouterRtpCapabilities" => Frame::success(id, json!({ "codecs": [] })),
                    "createWebRtcTransport" => {
                        transports += 1;
                        Frame::success(
                            id,
                            json!({
                                "id": format!("T{transports}"),
                                "iceParameters": { "usernameFragment": "u", "password": "p" },
                                "iceCandidates": [],
                                "dtlsParameters": { "fingerprints": [] }
                            }),
                        )
                    }
                    "connectWebRtcTransport" if reject_connect => Frame::failure(id, 500, "dtls"),
                    "connectWebRtcTransport" => Frame::success(id, json!({})),
                    "produce" => {
                        producers += 1;
                        Frame::success(id, json!({ "id": format!("P{producers}") }))
                    }
                    "restartIce" => Frame::success(
                        id,
                        json!({ "iceParameters": { "usernameFragment": "u2", "password": "p2" } }),
                    ),
                    _ => Frame::failure(id, 404, "unknown"),
                };
                let _ = peer.to_client.send(LinkEvent::Text(reply.to_text().unwrap()));
            }
        });
    }

    async fn context(
        engine: &MockEngine,
        reject_connect: bool,
    ) -> (TransportContext, Arc<Mutex<Vec<Value>>>) {
        let (connector, mut accept) = MemoryConnector::new();
        let channel = SignalingChannel::new(Arc::new(connector), Duration::from_secs(30), 0);
        channel
            .open(&Url::parse("wss://t.test/").unwrap())
            .await
            .unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        spawn_server(accept.recv().await.unwrap(), Arc::clone(&calls), reject_connect);
        let caps = capabilities::negotiate(&channel, engine).await.unwrap();
        let ctx = TransportContext {
            channel,
            capabilities: caps,
            ice_servers: Vec::new(),
            force_tcp: false,
            ice_transport_policy: RTCIceTransportPolicy::Relay,
            restart_policy: IceRestartPolicy::default(),
            scope: SessionScope::new(1),
            events: EventSink::new(),
        };
        (ctx, calls)
    }

    fn count(calls: &Arc<Mutex<Vec<Value>>>, method: &str) -> usize {
        calls
            .lock()
            .iter()
            .filter(|call| call["method"] == method)
            .count()
    }

    #[tokio::test]
    async fn creates_transport_with_direction_flags_and_policy() {
        let engine = MockEngine::new();
        let (ctx, calls) = context(&engine, false).await;
        let transport = create_transport(Direction::Receive, &ctx).await.unwrap();
        assert_eq!(transport.id(), "T1");
        let create = calls.lock()[1].clone();
        assert_eq!(create["data"]["producing"], false);
        assert_eq!(create["data"]["consuming"], true);
        let mock = engine.transport(Direction::Receive).unwrap();
        assert_eq!(
            mock.options().ice_transport_policy,
            RTCIceTransportPolicy::Relay
        );
    }

    #[tokio::test]
    async fn connect_is_forwarded_exactly_once() {
        let engine = MockEngine::new();
        engine.repeat_connect(true);
        let (ctx, calls) = context(&engine, false).await;
        let transport = create_transport(Direction::Send, &ctx).await.unwrap();
        for kind in [MediaKind::Audio, MediaKind::Video] {
            transport
                .engine()
                .produce(ProduceOptions {
                    track: capture_track(kind),
                    encodings: None,
                    codec_options: None,
                    app_data: json!({}),
                })
                .await
                .unwrap();
        }
        assert_eq!(count(&calls, "connectWebRtcTransport"), 1);
        assert_eq!(count(&calls, "produce"), 2);
    }

    #[tokio::test]
    async fn produce_resolves_with_server_id() {
        let engine = MockEngine::new();
        let (ctx, calls) = context(&engine, false).await;
        let transport = create_transport(Direction::Send, &ctx).await.unwrap();
        let handle = transport
            .engine()
            .produce(ProduceOptions {
                track: capture_track(MediaKind::Audio),
                encodings: None,
                codec_options: None,
                app_data: json!({ "source": "mic" }),
            })
            .await
            .unwrap();
        assert_eq!(handle.producer.id(), "P1");
        let produce = calls
            .lock()
            .iter()
            .find(|call| call["method"] == "produce")
            .cloned()
            .unwrap();
        assert_eq!(produce["data"]["transportId"], "T1");
        assert_eq!(produce["data"]["kind"], "audio");
        assert_eq!(produce["data"]["appData"]["source"], "mic");
    }

    #[tokio::test]
    async fn rejected_connect_fails_the_engine_call() {
        let engine = MockEngine::new();
        let (ctx, _calls) = context(&engine, true).await;
        let transport = create_transport(Direction::Send, &ctx).await.unwrap();
        let err = transport
            .engine()
            .produce(ProduceOptions {
                track: capture_track(MediaKind::Audio),
                encodings: None,
                codec_options: None,
                app_data: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::engine::EngineError::Rejected(_)));
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn failed_state_triggers_bounded_ice_restarts() {
        let engine = MockEngine::new();
        let (ctx, calls) = context(&engine, false).await;
        let transport = create_transport(Direction::Send, &ctx).await.unwrap();
        let mock = engine.transport(Direction::Send).unwrap();

        for attempt in 1..=4u32 {
            mock.set_connection_state(RTCPeerConnectionState::Failed);
            tokio::time::sleep(Duration::from_secs(30)).await;
            let expected = attempt.min(3) as usize;
            assert_eq!(mock.ice_restarts().len(), expected, "attempt {attempt}");
        }
        assert_eq!(count(&calls, "restartIce"), 3);
        assert_eq!(mock.ice_restarts()[0]["usernameFragment"], "u2");

        mock.set_connection_state(RTCPeerConnectionState::Connected);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.restart_attempts(), 0);
        mock.set_connection_state(RTCPeerConnectionState::Failed);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(mock.ice_restarts().len(), 4);
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn disconnected_state_does_not_restart() {
        let engine = MockEngine::new();
        let (ctx, calls) = context(&engine, false).await;
        let transport = create_transport(Direction::Receive, &ctx).await.unwrap();
        let mut state = transport.watch_state();
        engine
            .transport(Direction::Receive)
            .unwrap()
            .set_connection_state(RTCPeerConnectionState::Disconnected);
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), RTCPeerConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count(&calls, "restartIce"), 0);
    }

    #[tokio::test]
    async fn close_all_tolerates_missing_transports() {
        let engine = MockEngine::new();
        let (ctx, _calls) = context(&engine, false).await;
        let manager = TransportManager::new();
        manager.close_all();
        manager.create(Direction::Send, &ctx).await.unwrap();
        manager.close_all();
        manager.close_all();
        assert!(manager.send_transport().is_none());
        assert_eq!(engine.journal().count("transport.close:send"), 1);
    }

    #[tokio::test]
    async fn creation_failure_is_session_fatal() {
        let engine = MockEngine::new();
        let (ctx, _calls) = context(&engine, false).await;
        ctx.channel.close();
        let err = create_transport(Direction::Send, &ctx).await.unwrap_err();
        assert!(matches!(
            err,
            DialogError::TransportCreationFailed { direction: "send", .. }
        ));
        assert!(err.is_session_fatal());
    }
}
