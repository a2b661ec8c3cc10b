use std::sync::Arc;

use serde_json::Value;

use crate::engine::{Device, MediaEngine, MediaKind};
use crate::error::DialogError;
use crate::signaling::{ClientRequest, SignalingChannel};

/// Router capabilities as loaded into a device. Immutable once negotiated.
#[derive(Clone)]
pub struct Capabilities {
    device: Arc<dyn Device>,
    router: Value,
    rtp: Value,
    sctp: Option<Value>,
}

impl Capabilities {
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn router(&self) -> &Value {
        &self.router
    }

    /// The local RTP capabilities advertised on `join`.
    pub fn rtp(&self) -> &Value {
        &self.rtp
    }

    pub fn sctp(&self) -> Option<&Value> {
        self.sctp.as_ref()
    }

    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.device.can_produce(kind)
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("router", &self.router)
            .field("sctp", &self.sctp)
            .finish_non_exhaustive()
    }
}

/// Fetches router capabilities and loads them into a fresh device.
///
/// A load failure is final: the same capabilities would be rejected again.
pub async fn negotiate(
    channel: &SignalingChannel,
    engine: &dyn MediaEngine,
) -> Result<Capabilities, DialogError> {
    let router = channel
        .request(ClientRequest::GetRouterRtpCapabilities)
        .await?;
    let device = engine.new_device();
    device
        .load(&router)
        .await
        .map_err(|err| DialogError::CapabilityLoadFailed(err.to_string()))?;
    let rtp = device
        .rtp_capabilities()
        .map_err(|err| DialogError::CapabilityLoadFailed(err.to_string()))?;
    let sctp = device.sctp_capabilities();
    tracing::debug!(
        target: "dialog::session",
        codecs = router.get("codecs").and_then(serde_json::Value::as_array).map_or(0, Vec::len),
        "router capabilities loaded"
    );
    Ok(Capabilities {
        device,
        router,
        rtp,
        sctp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::signaling::{Frame, MemoryConnector};
    use serde_json::json;
    use std::time::Duration;
    use url::Url;

    async fn serve_caps(caps: Value) -> SignalingChannel {
        let (connector, mut accept) = MemoryConnector::new();
        let channel = SignalingChannel::new(Arc::new(connector), Duration::from_secs(5), 0);
        channel
            .open(&Url::parse("wss://caps.test/").unwrap())
            .await
            .unwrap();
        let mut peer = accept.recv().await.unwrap();
        tokio::spawn(async move {
            while let Some(text) = peer.from_client.recv().await {
                let frame = Frame::parse(&text).unwrap();
                let reply = Frame::success(frame.id.unwrap(), caps.clone());
                let _ = peer
                    .to_client
                    .send(crate::signaling::LinkEvent::Text(reply.to_text().unwrap()));
            }
        });
        channel
    }

    #[tokio::test]
    async fn loads_router_capabilities_into_device() {
        let channel = serve_caps(json!({ "codecs": [{ "mimeType": "audio/opus" }] })).await;
        let engine = MockEngine::new();
        let caps = negotiate(&channel, &engine).await.unwrap();
        assert!(caps.device().loaded());
        assert!(caps.can_produce(MediaKind::Audio));
        assert_eq!(caps.rtp(), caps.router());
        assert_eq!(engine.journal().count("device.load"), 1);
    }

    #[tokio::test]
    async fn load_failure_is_fatal() {
        let channel = serve_caps(json!({ "codecs": [] })).await;
        let engine = MockEngine::new();
        engine.fail_load(true);
        let err = negotiate(&channel, &engine).await.unwrap_err();
        assert!(matches!(err, DialogError::CapabilityLoadFailed(_)));
        assert!(err.is_session_fatal());
    }

    #[tokio::test]
    async fn unsupported_kind_is_reported() {
        let channel = serve_caps(json!({ "codecs": [] })).await;
        let engine = MockEngine::new();
        engine.disable_kind(MediaKind::Video);
        let caps = negotiate(&channel, &engine).await.unwrap();
        assert!(!caps.can_produce(MediaKind::Video));
    }
}
