use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use url::Url;

use crate::error::DialogError;

pub const PROTOO_SUBPROTOCOL: &str = "protoo";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    Error(String),
}

/// A duplex text link to the room server. The link is closed once `inbound`
/// yields `None`; dropping `outbound` closes it from our side.
pub struct SignalingLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<SignalingLink, DialogError>;
}

/// Connects over WebSocket using the protoo sub-protocol.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<SignalingLink, DialogError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| DialogError::Setup(format!("invalid signaling url {url}: {err}")))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(PROTOO_SUBPROTOCOL),
        );

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|err| DialogError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target: "dialog::signaling", url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<LinkEvent>();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        tracing::trace!(
                            target: "dialog::signaling",
                            event = "ws_in",
                            len = text.len()
                        );
                        if inbound_tx.send(LinkEvent::Text(text)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data) {
                            if inbound_tx.send(LinkEvent::Text(text)).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target: "dialog::signaling",
                                    "signaling websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target: "dialog::signaling",
                                    "signaling websocket error: {err}"
                                );
                                let _ = inbound_tx.send(LinkEvent::Error(err.to_string()));
                            }
                        }
                        break;
                    }
                }
            }
        });

        Ok(SignalingLink { outbound, inbound })
    }
}

/// Server end of an in-memory link.
pub struct MemoryPeer {
    pub url: Url,
    /// Frames the client sent.
    pub from_client: mpsc::UnboundedReceiver<String>,
    /// Send frames (or an error) to the client; drop to close the link.
    pub to_client: mpsc::UnboundedSender<LinkEvent>,
}

/// Hands every accepted connection to whoever holds the receiver returned by
/// [`MemoryConnector::new`]. Used to run a scripted room server in-process.
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    attempts: Arc<Mutex<Vec<Url>>>,
    refuse: Arc<Mutex<u32>>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                attempts: Arc::new(Mutex::new(Vec::new())),
                refuse: Arc::new(Mutex::new(0)),
            },
            accept_rx,
        )
    }

    /// Every URL a connection was attempted against, in order.
    pub fn attempts(&self) -> Vec<Url> {
        self.attempts.lock().clone()
    }

    /// Fails the next `count` connection attempts.
    pub fn refuse_next(&self, count: u32) {
        *self.refuse.lock() = count;
    }
}

#[async_trait]
impl SignalingConnector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<SignalingLink, DialogError> {
        self.attempts.lock().push(url.clone());
        {
            let mut refuse = self.refuse.lock();
            if *refuse > 0 {
                *refuse -= 1;
                return Err(DialogError::Setup(format!("connection to {url} refused")));
            }
        }
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        self.accept_tx
            .send(MemoryPeer {
                url: url.clone(),
                from_client,
                to_client,
            })
            .map_err(|_| DialogError::Setup(format!("no server listening for {url}")))?;
        Ok(SignalingLink { outbound, inbound })
    }
}
