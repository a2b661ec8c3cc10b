use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

use crate::error::DialogError;
use crate::signaling::protocol::DeviceInfo;

const STUN_PRIMARY: &str = "stun:stun1.l.google.com:19302";
const STUN_SECONDARY: &str = "stun:stun2.l.google.com:19302";

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct TurnTransport {
    pub port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct TurnConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
    #[serde(default)]
    pub transports: Vec<TurnTransport>,
}

/// Where the room server lives, as handed out by the lobby service.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ServerParams {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub turn: Option<TurnConfig>,
}

impl ServerParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            turn: None,
        }
    }

    /// Parses `host:port`; `localhost` becomes `127.0.0.1`.
    pub fn parse(address: &str) -> Result<Self, DialogError> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| DialogError::InvalidConfig(format!("expected host:port, got '{address}'")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| DialogError::InvalidConfig(format!("invalid port in '{address}'")))?;
        if host.is_empty() {
            return Err(DialogError::InvalidConfig(format!("missing host in '{address}'")));
        }
        let host = if host == "localhost" { "127.0.0.1" } else { host };
        Ok(Self::new(host, port))
    }

    pub fn turn_enabled(&self) -> bool {
        self.turn.as_ref().is_some_and(|turn| turn.enabled)
    }

    /// Signaling endpoint carrying the room and peer ids.
    pub fn signaling_url(&self, room_id: &str, peer_id: &str) -> Result<Url, DialogError> {
        let mut url = Url::parse(&format!("wss://{}:{}/", self.host, self.port))
            .map_err(|err| DialogError::InvalidConfig(format!("invalid server address: {err}")))?;
        url.query_pairs_mut()
            .append_pair("roomId", room_id)
            .append_pair("peerId", peer_id);
        Ok(url)
    }

    pub fn ice_servers(&self, force_tcp: bool) -> Vec<RTCIceServer> {
        let Some(turn) = self.turn.as_ref().filter(|turn| turn.enabled) else {
            return vec![stun(STUN_PRIMARY), stun(STUN_SECONDARY)];
        };

        let mut servers = Vec::new();
        for transport in &turn.transports {
            if !force_tcp {
                servers.push(RTCIceServer {
                    urls: vec![format!("turns:{}:{}", self.host, transport.port)],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                });
            }
            servers.push(RTCIceServer {
                urls: vec![format!("turns:{}:{}?transport=tcp", self.host, transport.port)],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        servers.push(stun(STUN_PRIMARY));
        servers
    }
}

fn stun(url: &str) -> RTCIceServer {
    RTCIceServer {
        urls: vec![url.to_string()],
        ..Default::default()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum IcePolicy {
    #[default]
    All,
    Relay,
}

impl FromStr for IcePolicy {
    type Err = DialogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(IcePolicy::All),
            "relay" => Ok(IcePolicy::Relay),
            other => Err(DialogError::InvalidConfig(format!(
                "ice policy must be 'all' or 'relay', got '{other}'"
            ))),
        }
    }
}

impl From<IcePolicy> for RTCIceTransportPolicy {
    fn from(policy: IcePolicy) -> Self {
        match policy {
            IcePolicy::All => RTCIceTransportPolicy::All,
            IcePolicy::Relay => RTCIceTransportPolicy::Relay,
        }
    }
}

/// Bounds for restarting ICE on a failed transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IceRestartPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl IceRestartPolicy {
    /// Delay before the `attempt`-th consecutive restart (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

impl Default for IceRestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DialogConfig {
    pub server: ServerParams,
    pub room_id: String,
    pub peer_id: String,
    pub display_name: String,
    pub token: Option<String>,
    pub force_tcp: bool,
    pub force_turn: bool,
    pub ice_policy: IcePolicy,
    pub request_timeout: Duration,
    pub connect_retries: u32,
    pub ice_restart: IceRestartPolicy,
    pub device: DeviceInfo,
}

impl DialogConfig {
    pub fn new(server: ServerParams, room_id: impl Into<String>) -> Self {
        let peer_id = uuid::Uuid::new_v4().to_string();
        Self {
            server,
            room_id: room_id.into(),
            display_name: peer_id.clone(),
            peer_id,
            token: None,
            force_tcp: false,
            force_turn: false,
            ice_policy: IcePolicy::All,
            request_timeout: Duration::from_secs(20),
            connect_retries: 2,
            ice_restart: IceRestartPolicy::default(),
            device: DeviceInfo::default(),
        }
    }

    /// Loads configuration from `BEACH_DIALOG_*` environment variables.
    pub fn from_env() -> Result<Self, DialogError> {
        let server = env::var("BEACH_DIALOG_SERVER").unwrap_or_else(|_| "127.0.0.1:4443".into());
        let room = env::var("BEACH_DIALOG_ROOM").unwrap_or_else(|_| "lobby".into());
        let mut config = Self::new(ServerParams::parse(&server)?, room);

        if let Ok(peer) = env::var("BEACH_DIALOG_PEER") {
            if !peer.trim().is_empty() {
                config.display_name = peer.clone();
                config.peer_id = peer;
            }
        }
        config.token = env::var("BEACH_DIALOG_TOKEN").ok().filter(|t| !t.is_empty());
        config.force_tcp = env_flag("BEACH_DIALOG_FORCE_TCP")?;
        config.force_turn = env_flag("BEACH_DIALOG_FORCE_TURN")?;
        if let Ok(policy) = env::var("BEACH_DIALOG_ICE_POLICY") {
            config.ice_policy = policy.parse()?;
        }
        if let Ok(ms) = env::var("BEACH_DIALOG_REQUEST_TIMEOUT_MS") {
            let ms = ms.trim().parse::<u64>().map_err(|_| {
                DialogError::InvalidConfig(format!("BEACH_DIALOG_REQUEST_TIMEOUT_MS: '{ms}'"))
            })?;
            if ms == 0 {
                return Err(DialogError::InvalidConfig(
                    "BEACH_DIALOG_REQUEST_TIMEOUT_MS must be positive".into(),
                ));
            }
            config.request_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }

    /// Force-TURN always wins over the configured policy.
    pub fn ice_transport_policy(&self) -> RTCIceTransportPolicy {
        if self.force_turn {
            RTCIceTransportPolicy::Relay
        } else {
            self.ice_policy.into()
        }
    }

    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.server.ice_servers(self.force_tcp)
    }
}

fn env_flag(name: &str) -> Result<bool, DialogError> {
    match env::var(name) {
        Err(_) => Ok(false),
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "" | "0" | "false" | "no" | "off" => Ok(false),
            "1" | "true" | "yes" | "on" => Ok(true),
            other => Err(DialogError::InvalidConfig(format!("{name}: '{other}'"))),
        },
    }
}
