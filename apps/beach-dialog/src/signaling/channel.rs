use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;

use super::link::{LinkEvent, SignalingConnector, SignalingLink};
use super::protocol::{ClientRequest, Frame, ServerNotification, ServerRequest};
use crate::error::DialogError;

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
}

/// Everything the channel reports to its owner, in arrival order.
#[derive(Debug)]
pub enum SignalingEvent {
    Notification(ServerNotification),
    Request(IncomingRequest),
    Error(String),
    /// The link went away. `locally_initiated` is false when the server or
    /// the network dropped it.
    Closed { locally_initiated: bool },
}

/// A server request waiting for our answer. Dropping it unanswered rejects it.
#[derive(Debug)]
pub struct IncomingRequest {
    pub request: ServerRequest,
    responder: Responder,
}

impl IncomingRequest {
    pub fn into_parts(self) -> (ServerRequest, Responder) {
        (self.request, self.responder)
    }
}

#[derive(Debug)]
pub struct Responder {
    id: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

impl Responder {
    pub fn accept(mut self, data: Value) {
        self.send(Frame::success(self.id, data));
    }

    pub fn reject(mut self, code: u16, reason: impl Into<String>) {
        self.send(Frame::failure(self.id, code, reason));
    }

    fn send(&mut self, frame: Frame) {
        let Some(outbound) = self.outbound.take() else {
            return;
        };
        match frame.to_text() {
            Ok(text) => {
                if outbound.send(text).is_err() {
                    tracing::debug!(
                        target: "dialog::signaling",
                        request_id = self.id,
                        "channel closed before response could be sent"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(target: "dialog::signaling", error = %err, "failed to encode response");
            }
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.outbound.is_some() {
            tracing::warn!(
                target: "dialog::signaling",
                request_id = self.id,
                "server request dropped without an answer; rejecting"
            );
            self.send(Frame::failure(self.id, 500, "request not handled"));
        }
    }
}

type PendingMap = HashMap<u64, (String, oneshot::Sender<Result<Value, DialogError>>)>;

struct ChannelInner {
    connector: Arc<dyn SignalingConnector>,
    request_timeout: Duration,
    connect_retries: u32,
    state: Mutex<ChannelState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU64,
    closing: AtomicBool,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Request/response and event plumbing over one protoo connection.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

impl SignalingChannel {
    pub fn new(
        connector: Arc<dyn SignalingConnector>,
        request_timeout: Duration,
        connect_retries: u32,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let first_id = rand::random::<u32>() as u64;
        Self {
            inner: Arc::new(ChannelInner {
                connector,
                request_timeout,
                connect_retries,
                state: Mutex::new(ChannelState::Closed),
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(first_id),
                closing: AtomicBool::new(false),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                reader: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Takes the event stream. There is exactly one consumer per channel.
    pub fn take_events(&self) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, DialogError> {
        self.inner
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| DialogError::Setup("signaling event stream already taken".into()))
    }

    pub async fn open(&self, url: &Url) -> Result<(), DialogError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ChannelState::Opening => return Err(DialogError::OpenInProgress),
                ChannelState::Open => return Ok(()),
                ChannelState::Closed => *state = ChannelState::Opening,
            }
        }
        self.inner.closing.store(false, Ordering::SeqCst);

        let link = match self.connect_with_retries(url).await {
            Ok(link) => link,
            Err(err) => {
                *self.inner.state.lock() = ChannelState::Closed;
                return Err(err);
            }
        };

        if self.inner.closing.load(Ordering::SeqCst) {
            // close() raced the connect; honour it.
            *self.inner.state.lock() = ChannelState::Closed;
            return Err(DialogError::SignalingClosed);
        }

        let SignalingLink { outbound, inbound } = link;
        *self.inner.outbound.lock() = Some(outbound);
        *self.inner.state.lock() = ChannelState::Open;
        let reader = tokio::spawn(read_loop(Arc::clone(&self.inner), inbound));
        *self.inner.reader.lock() = Some(reader);
        tracing::info!(target: "dialog::signaling", url = %url, "signaling channel open");
        Ok(())
    }

    async fn connect_with_retries(&self, url: &Url) -> Result<SignalingLink, DialogError> {
        let mut attempt = 0;
        loop {
            match self.inner.connector.connect(url).await {
                Ok(link) => return Ok(link),
                Err(err) if attempt < self.inner.connect_retries => {
                    attempt += 1;
                    tracing::warn!(
                        target: "dialog::signaling",
                        url = %url,
                        attempt,
                        error = %err,
                        "signaling connect failed; retrying"
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    if self.inner.closing.load(Ordering::SeqCst) {
                        return Err(DialogError::SignalingClosed);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Sends a request and waits for its response payload.
    pub async fn request(&self, request: ClientRequest) -> Result<Value, DialogError> {
        let method = request.method();
        let data = request.data()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            // Register before sending so a fast response cannot be missed.
            let outbound = self.inner.outbound.lock();
            let Some(outbound) = outbound.as_ref() else {
                return Err(DialogError::SignalingNotOpen);
            };
            if *self.inner.state.lock() != ChannelState::Open {
                return Err(DialogError::SignalingNotOpen);
            }
            let text = Frame::request(id, method, data).to_text()?;
            self.inner
                .pending
                .lock()
                .insert(id, (method.to_string(), tx));
            if outbound.send(text).is_err() {
                self.inner.pending.lock().remove(&id);
                return Err(DialogError::SignalingClosed);
            }
        }
        tracing::debug!(target: "dialog::signaling", request_id = id, method, "request sent");

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DialogError::SignalingClosed),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                tracing::warn!(target: "dialog::signaling", request_id = id, method, "request timed out");
                Err(DialogError::SignalingTimeout {
                    method: method.to_string(),
                })
            }
        }
    }

    pub async fn request_as<T: DeserializeOwned>(
        &self,
        request: ClientRequest,
    ) -> Result<T, DialogError> {
        let method = request.method();
        let value = self.request(request).await?;
        serde_json::from_value(value).map_err(|err| {
            DialogError::Protocol(format!("unexpected '{method}' response: {err}"))
        })
    }

    /// Closes the link from our side. The resulting `Closed` event carries
    /// `locally_initiated: true`.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let outbound = self.inner.outbound.lock().take();
        let was_open = {
            let mut state = self.inner.state.lock();
            let was_open = *state == ChannelState::Open;
            *state = ChannelState::Closed;
            was_open
        };
        drop(outbound);
        fail_pending(&self.inner);
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        if was_open {
            tracing::info!(target: "dialog::signaling", "signaling channel closed locally");
            let _ = self.inner.events_tx.send(SignalingEvent::Closed {
                locally_initiated: true,
            });
        }
    }
}

fn fail_pending(inner: &ChannelInner) {
    let drained: Vec<_> = inner.pending.lock().drain().collect();
    for (_, (_, tx)) in drained {
        let _ = tx.send(Err(DialogError::SignalingClosed));
    }
}

async fn read_loop(inner: Arc<ChannelInner>, mut inbound: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = inbound.recv().await {
        match event {
            LinkEvent::Text(text) => handle_frame(&inner, &text),
            LinkEvent::Error(err) => {
                let _ = inner.events_tx.send(SignalingEvent::Error(err));
            }
        }
    }

    // A local close aborts this task before we get here.
    let locally_initiated = inner.closing.load(Ordering::SeqCst);
    *inner.state.lock() = ChannelState::Closed;
    inner.outbound.lock().take();
    fail_pending(&inner);
    if !locally_initiated {
        tracing::warn!(target: "dialog::signaling", "signaling channel closed by remote");
    }
    let _ = inner
        .events_tx
        .send(SignalingEvent::Closed { locally_initiated });
}

fn handle_frame(inner: &Arc<ChannelInner>, text: &str) {
    let frame = match Frame::parse(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(target: "dialog::signaling", error = %err, "dropping malformed frame");
            return;
        }
    };

    if frame.response {
        let id = frame.id.unwrap_or_default();
        let Some((method, tx)) = inner.pending.lock().remove(&id) else {
            tracing::debug!(target: "dialog::signaling", request_id = id, "response for unknown request");
            return;
        };
        let result = if frame.ok.unwrap_or(false) {
            Ok(frame.data.unwrap_or(Value::Null))
        } else {
            Err(DialogError::SignalingRejected {
                method,
                code: frame.error_code.unwrap_or(500),
                reason: frame.error_reason.unwrap_or_default(),
            })
        };
        let _ = tx.send(result);
        return;
    }

    let method = frame.method.unwrap_or_default();
    let data = frame.data.unwrap_or(Value::Null);

    if frame.request {
        let id = frame.id.unwrap_or_default();
        let outbound = inner.outbound.lock().clone();
        let responder = Responder { id, outbound };
        match ServerRequest::from_parts(&method, data) {
            Ok(request) => {
                tracing::debug!(target: "dialog::signaling", request_id = id, method = %method, "server request");
                let _ = inner.events_tx.send(SignalingEvent::Request(IncomingRequest {
                    request,
                    responder,
                }));
            }
            Err(err) => responder.reject(400, err.to_string()),
        }
        return;
    }

    match ServerNotification::from_parts(&method, data) {
        Ok(notification) => {
            let _ = inner
                .events_tx
                .send(SignalingEvent::Notification(notification));
        }
        Err(err) => {
            tracing::warn!(target: "dialog::signaling", method = %method, error = %err, "malformed notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::link::{MemoryConnector, MemoryPeer};
    use serde_json::json;

    fn url() -> Url {
        Url::parse("wss://room.test:4443/?roomId=r&peerId=p").unwrap()
    }

    async fn open_pair(
        timeout: Duration,
    ) -> (SignalingChannel, MemoryPeer, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (connector, mut accept) = MemoryConnector::new();
        let channel = SignalingChannel::new(Arc::new(connector), timeout, 0);
        let events = channel.take_events().unwrap();
        channel.open(&url()).await.unwrap();
        let peer = accept.recv().await.unwrap();
        (channel, peer, events)
    }

    fn send(peer: &MemoryPeer, frame: Frame) {
        peer.to_client
            .send(LinkEvent::Text(frame.to_text().unwrap()))
            .unwrap();
    }

    #[tokio::test]
    async fn request_resolves_with_response_data() {
        let (channel, mut peer, _events) = open_pair(Duration::from_secs(5)).await;
        let call = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request(ClientRequest::GetRouterRtpCapabilities).await }
        });
        let sent = Frame::parse(&peer.from_client.recv().await.unwrap()).unwrap();
        assert_eq!(sent.method.as_deref(), Some("getRouterRtpCapabilities"));
        send(&peer, Frame::success(sent.id.unwrap(), json!({ "codecs": [] })));
        assert_eq!(call.await.unwrap().unwrap(), json!({ "codecs": [] }));
    }

    #[tokio::test]
    async fn rejected_request_carries_code_and_reason() {
        let (channel, mut peer, _events) = open_pair(Duration::from_secs(5)).await;
        let call = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .request(ClientRequest::PauseProducer {
                        producer_id: "x".into(),
                    })
                    .await
            }
        });
        let sent = Frame::parse(&peer.from_client.recv().await.unwrap()).unwrap();
        send(&peer, Frame::failure(sent.id.unwrap(), 404, "producer not found"));
        match call.await.unwrap().unwrap_err() {
            DialogError::SignalingRejected {
                method,
                code,
                reason,
            } => {
                assert_eq!(method, "pauseProducer");
                assert_eq!(code, 404);
                assert_eq!(reason, "producer not found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn unanswered_request_times_out() {
        let (channel, _peer, _events) = open_pair(Duration::from_secs(2)).await;
        let err = channel
            .request(ClientRequest::GetRouterRtpCapabilities)
            .await
            .unwrap_err();
        assert!(matches!(err, DialogError::SignalingTimeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn request_before_open_is_rejected() {
        let (connector, _accept) = MemoryConnector::new();
        let channel = SignalingChannel::new(Arc::new(connector), Duration::from_secs(1), 0);
        let err = channel
            .request(ClientRequest::GetRouterRtpCapabilities)
            .await
            .unwrap_err();
        assert!(matches!(err, DialogError::SignalingNotOpen));
    }

    #[tokio::test]
    async fn remote_close_is_reported_as_unsolicited() {
        let (channel, peer, mut events) = open_pair(Duration::from_secs(5)).await;
        drop(peer);
        match events.recv().await.unwrap() {
            SignalingEvent::Closed { locally_initiated } => assert!(!locally_initiated),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn local_close_is_flagged_and_fails_pending_requests() {
        let (channel, mut peer, mut events) = open_pair(Duration::from_secs(5)).await;
        let call = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request(ClientRequest::GetRouterRtpCapabilities).await }
        });
        peer.from_client.recv().await.unwrap();
        channel.close();
        assert!(matches!(
            call.await.unwrap().unwrap_err(),
            DialogError::SignalingClosed
        ));
        match events.recv().await.unwrap() {
            SignalingEvent::Closed { locally_initiated } => assert!(locally_initiated),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_server_request_is_rejected() {
        let (_channel, mut peer, mut events) = open_pair(Duration::from_secs(5)).await;
        send(
            &peer,
            Frame {
                request: true,
                id: Some(99),
                method: Some("somethingNew".into()),
                data: Some(json!({})),
                ..Default::default()
            },
        );
        match events.recv().await.unwrap() {
            SignalingEvent::Request(incoming) => drop(incoming),
            other => panic!("unexpected {other:?}"),
        }
        let answer = Frame::parse(&peer.from_client.recv().await.unwrap()).unwrap();
        assert!(answer.response);
        assert_eq!(answer.id, Some(99));
        assert_eq!(answer.ok, Some(false));
        assert_eq!(answer.error_code, Some(500));
    }

    #[tokio::test]
    async fn open_retries_refused_connections() {
        let (connector, mut accept) = MemoryConnector::new();
        connector.refuse_next(2);
        let channel = SignalingChannel::new(Arc::new(connector.clone()), Duration::from_secs(1), 2);
        channel.open(&url()).await.unwrap();
        assert!(accept.recv().await.is_some());
        assert_eq!(connector.attempts().len(), 3);
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn second_open_while_opening_is_refused() {
        let (connector, mut accept) = MemoryConnector::new();
        connector.refuse_next(1);
        let channel = SignalingChannel::new(Arc::new(connector.clone()), Duration::from_secs(1), 1);
        let first = tokio::spawn({
            let channel = channel.clone();
            async move { channel.open(&url()).await }
        });
        while channel.state() != ChannelState::Opening {
            tokio::task::yield_now().await;
        }

        let err = channel.open(&url()).await.unwrap_err();
        assert!(matches!(err, DialogError::OpenInProgress));

        first.await.unwrap().unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
        assert!(accept.recv().await.is_some());
        assert!(accept.try_recv().is_err());
        assert_eq!(connector.attempts().len(), 2);
    }

    #[tokio::test]
    async fn notifications_are_delivered_in_order() {
        let (_channel, peer, mut events) = open_pair(Duration::from_secs(5)).await;
        send(&peer, Frame::notification("newProducer", json!({ "producerId": "P1" })));
        send(&peer, Frame::notification("producerClosed", json!({ "producerId": "P1" })));
        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert!(matches!(
            first,
            SignalingEvent::Notification(ServerNotification::NewProducer { ref producer_id }) if producer_id == "P1"
        ));
        assert!(matches!(
            second,
            SignalingEvent::Notification(ServerNotification::ProducerClosed { ref producer_id }) if producer_id == "P1"
        ));
    }
}
