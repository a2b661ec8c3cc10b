//! Protoo framing and the typed messages exchanged with the room server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::engine::MediaKind;
use crate::error::DialogError;

/// Raw protoo frame. Exactly one of `request`, `response`, `notification` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub request: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub response: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub notification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl Frame {
    pub fn request(id: u64, method: &str, data: Value) -> Self {
        Self {
            request: true,
            id: Some(id),
            method: Some(method.to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn success(id: u64, data: Value) -> Self {
        Self {
            response: true,
            id: Some(id),
            ok: Some(true),
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn failure(id: u64, code: u16, reason: impl Into<String>) -> Self {
        Self {
            response: true,
            id: Some(id),
            ok: Some(false),
            error_code: Some(code),
            error_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn notification(method: &str, data: Value) -> Self {
        Self {
            notification: true,
            method: Some(method.to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn parse(text: &str) -> Result<Self, DialogError> {
        let frame: Frame = serde_json::from_str(text)?;
        let kinds = [frame.request, frame.response, frame.notification]
            .iter()
            .filter(|set| **set)
            .count();
        if kinds != 1 {
            return Err(DialogError::Protocol(
                "frame must be exactly one of request/response/notification".into(),
            ));
        }
        if (frame.request || frame.response) && frame.id.is_none() {
            return Err(DialogError::Protocol("request/response frame without id".into()));
        }
        if (frame.request || frame.notification) && frame.method.is_none() {
            return Err(DialogError::Protocol("frame without method".into()));
        }
        Ok(frame)
    }

    pub fn to_text(&self) -> Result<String, DialogError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub flag: String,
    pub name: String,
    pub version: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            flag: "rust".into(),
            name: "beach-dialog".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub display_name: String,
    pub device: DeviceInfo,
    pub rtp_capabilities: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_capabilities: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: Value,
}

/// Requests this client issues.
#[derive(Debug, Clone)]
pub enum ClientRequest {
    GetRouterRtpCapabilities,
    Join(JoinRequest),
    CreateWebRtcTransport {
        force_tcp: bool,
        producing: bool,
        consuming: bool,
    },
    ConnectWebRtcTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    Produce(ProduceRequest),
    PauseProducer { producer_id: String },
    ResumeProducer { producer_id: String },
    CloseProducer { producer_id: String },
    RestartIce { transport_id: String },
}

impl ClientRequest {
    pub fn method(&self) -> &'static str {
        match self {
            ClientRequest::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            ClientRequest::Join(_) => "join",
            ClientRequest::CreateWebRtcTransport { .. } => "createWebRtcTransport",
            ClientRequest::ConnectWebRtcTransport { .. } => "connectWebRtcTransport",
            ClientRequest::Produce(_) => "produce",
            ClientRequest::PauseProducer { .. } => "pauseProducer",
            ClientRequest::ResumeProducer { .. } => "resumeProducer",
            ClientRequest::CloseProducer { .. } => "closeProducer",
            ClientRequest::RestartIce { .. } => "restartIce",
        }
    }

    pub fn data(&self) -> Result<Value, DialogError> {
        let value = match self {
            ClientRequest::GetRouterRtpCapabilities => Value::Object(Map::new()),
            ClientRequest::Join(join) => serde_json::to_value(join)?,
            ClientRequest::CreateWebRtcTransport {
                force_tcp,
                producing,
                consuming,
            } => json!({
                "forceTcp": force_tcp,
                "producing": producing,
                "consuming": consuming,
            }),
            ClientRequest::ConnectWebRtcTransport {
                transport_id,
                dtls_parameters,
            } => json!({
                "transportId": transport_id,
                "dtlsParameters": dtls_parameters,
            }),
            ClientRequest::Produce(produce) => serde_json::to_value(produce)?,
            ClientRequest::PauseProducer { producer_id }
            | ClientRequest::ResumeProducer { producer_id }
            | ClientRequest::CloseProducer { producer_id } => {
                json!({ "producerId": producer_id })
            }
            ClientRequest::RestartIce { transport_id } => json!({ "transportId": transport_id }),
        };
        Ok(value)
    }
}

/// Response payload for `createWebRtcTransport`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    #[serde(default)]
    pub sctp_parameters: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartIceResponse {
    pub ice_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConsumer {
    pub peer_id: String,
    pub producer_id: String,
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(default)]
    pub app_data: Value,
    #[serde(default)]
    pub producer_paused: bool,
}

/// Requests the server sends and expects an accept/reject for.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerRequest {
    NewConsumer(NewConsumer),
    Unknown { method: String, data: Value },
}

impl ServerRequest {
    pub fn from_parts(method: &str, data: Value) -> Result<Self, DialogError> {
        match method {
            "newConsumer" => Ok(ServerRequest::NewConsumer(serde_json::from_value(data)?)),
            _ => Ok(ServerRequest::Unknown {
                method: method.to_string(),
                data,
            }),
        }
    }

    pub fn method(&self) -> &str {
        match self {
            ServerRequest::NewConsumer(_) => "newConsumer",
            ServerRequest::Unknown { method, .. } => method,
        }
    }
}

/// Fire-and-forget messages from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotification {
    NewProducer { producer_id: String },
    ProducerClosed { producer_id: String },
    ConsumerClosed { consumer_id: String },
    DownlinkBwe(Value),
    Unknown { method: String, data: Value },
}

impl ServerNotification {
    pub fn from_parts(method: &str, data: Value) -> Result<Self, DialogError> {
        let field = |name: &str| -> Result<String, DialogError> {
            data.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| DialogError::Protocol(format!("{method} missing '{name}'")))
        };
        match method {
            "newProducer" => Ok(ServerNotification::NewProducer {
                producer_id: field("producerId").or_else(|_| field("id"))?,
            }),
            "producerClosed" => Ok(ServerNotification::ProducerClosed {
                producer_id: field("producerId")?,
            }),
            "consumerClosed" => Ok(ServerNotification::ConsumerClosed {
                consumer_id: field("consumerId")?,
            }),
            "downlinkBwe" => Ok(ServerNotification::DownlinkBwe(data)),
            _ => Ok(ServerNotification::Unknown {
                method: method.to_string(),
                data,
            }),
        }
    }
}
