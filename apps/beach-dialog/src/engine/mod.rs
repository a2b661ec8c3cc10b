//! Boundary to the media engine that owns ICE/DTLS/SRTP and codec handling.
//!
//! The orchestrator never touches packets. It loads router capabilities into a
//! [`Device`], asks the device for directional transports, and bridges the
//! events those transports raise back to the signaling server.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

pub mod mock;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("closed")]
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Receive => "receive",
        }
    }
}

/// A capture or remote track as seen by the engine.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn stop(&self);
}

pub type TrackRef = Arc<dyn MediaTrack>;

/// Parameters the server returns from `createWebRtcTransport`, plus the
/// local connectivity policy.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    pub sctp_parameters: Option<Value>,
    pub ice_servers: Vec<RTCIceServer>,
    pub ice_transport_policy: RTCIceTransportPolicy,
}

#[derive(Clone, Debug)]
pub struct ProduceOptions {
    pub track: TrackRef,
    pub encodings: Option<Value>,
    pub codec_options: Option<Value>,
    pub app_data: Value,
}

#[derive(Clone, Debug)]
pub struct ConsumeOptions {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: Value,
}

/// Events raised by an engine transport. The engine waits on `reply` before
/// continuing the handshake or the produce call that triggered the event.
#[derive(Debug)]
pub enum TransportEvent {
    Connect {
        dtls_parameters: Value,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Produce {
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
        reply: oneshot::Sender<Result<String, String>>,
    },
    ConnectionStateChange(RTCPeerConnectionState),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerEvent {
    TrackEnded,
    TransportClosed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerEvent {
    TrackEnded,
    TransportClosed,
}

/// Creates fresh device handles; one per negotiated session.
pub trait MediaEngine: Send + Sync {
    fn new_device(&self) -> Arc<dyn Device>;
}

#[async_trait]
pub trait Device: Send + Sync {
    async fn load(&self, router_rtp_capabilities: &Value) -> Result<(), EngineError>;
    fn loaded(&self) -> bool;
    fn rtp_capabilities(&self) -> Result<Value, EngineError>;
    fn sctp_capabilities(&self) -> Option<Value>;
    fn can_produce(&self, kind: MediaKind) -> bool;
    fn create_send_transport(&self, options: TransportOptions) -> Result<TransportHandle, EngineError>;
    fn create_recv_transport(&self, options: TransportOptions) -> Result<TransportHandle, EngineError>;
}

/// A freshly created engine transport together with its event stream.
pub struct TransportHandle {
    pub transport: Arc<dyn EngineTransport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> &str;
    fn direction(&self) -> Direction;
    async fn produce(&self, options: ProduceOptions) -> Result<ProducerHandle, EngineError>;
    async fn consume(&self, options: ConsumeOptions) -> Result<ConsumerHandle, EngineError>;
    async fn restart_ice(&self, ice_parameters: Value) -> Result<(), EngineError>;
    fn close(&self);
    fn closed(&self) -> bool;
}

pub struct ProducerHandle {
    pub producer: Arc<dyn EngineProducer>,
    pub events: mpsc::UnboundedReceiver<ProducerEvent>,
}

impl std::fmt::Debug for ProducerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerHandle")
            .field("id", &self.producer.id())
            .finish_non_exhaustive()
    }
}

pub struct ConsumerHandle {
    pub consumer: Arc<dyn EngineConsumer>,
    pub events: mpsc::UnboundedReceiver<ConsumerEvent>,
}

pub trait EngineProducer: Send + Sync {
    /// Server-assigned id, as returned through [`TransportEvent::Produce`].
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> TrackRef;
    fn pause(&self);
    fn resume(&self);
    fn paused(&self) -> bool;
    fn close(&self);
    fn closed(&self) -> bool;
}

pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> TrackRef;
    fn rtp_parameters(&self) -> &Value;
    fn close(&self);
    fn closed(&self) -> bool;
}
