use thiserror::Error;

use crate::engine::EngineError;

/// How far a failure reaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Confined to one producer, consumer or request; the session keeps running.
    Contained,
    /// The channel dropped; a background reconnect decides whether the
    /// session survives.
    Recoverable,
    /// No media can flow; the session is torn down.
    SessionFatal,
}

#[derive(Debug, Error)]
pub enum DialogError {
    #[error("signaling request '{method}' timed out")]
    SignalingTimeout { method: String },
    #[error("signaling request '{method}' rejected ({code}): {reason}")]
    SignalingRejected {
        method: String,
        code: u16,
        reason: String,
    },
    #[error("signaling channel closed")]
    SignalingClosed,
    #[error("signaling channel is not open")]
    SignalingNotOpen,
    #[error("signaling channel open already in progress")]
    OpenInProgress,
    #[error("failed to load router capabilities: {0}")]
    CapabilityLoadFailed(String),
    #[error("failed to create {direction} transport: {reason}")]
    TransportCreationFailed {
        direction: &'static str,
        reason: String,
    },
    #[error("failed to consume producer {producer_id}: {reason}")]
    ConsumptionFailed { producer_id: String, reason: String },
    #[error("signaling channel closed unexpectedly")]
    UnsolicitedDisconnect,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("media engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("signaling setup failed: {0}")]
    Setup(String),
    #[error("no active producer for {0}")]
    ProducerNotFound(String),
    #[error("device cannot produce {0}")]
    CannotProduce(String),
    #[error("session closed")]
    SessionClosed,
    #[error("session is not connected")]
    NotConnected,
}

impl DialogError {
    pub fn severity(&self) -> Severity {
        match self {
            DialogError::CapabilityLoadFailed(_)
            | DialogError::TransportCreationFailed { .. }
            | DialogError::SessionClosed => Severity::SessionFatal,
            DialogError::UnsolicitedDisconnect => Severity::Recoverable,
            _ => Severity::Contained,
        }
    }

    pub fn is_session_fatal(&self) -> bool {
        self.severity() == Severity::SessionFatal
    }

    /// Only an unanswered request is worth repeating as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DialogError::SignalingTimeout { .. })
    }

    /// True for errors caused by the signaling link going away underneath a call.
    pub fn is_channel_loss(&self) -> bool {
        matches!(
            self,
            DialogError::SignalingClosed
                | DialogError::SignalingNotOpen
                | DialogError::UnsolicitedDisconnect
        )
    }
}

impl From<serde_json::Error> for DialogError {
    fn from(value: serde_json::Error) -> Self {
        DialogError::Protocol(value.to_string())
    }
}
