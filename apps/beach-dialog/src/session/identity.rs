use async_trait::async_trait;
use url::Url;

use crate::config::{DialogConfig, ServerParams};
use crate::error::DialogError;

/// Who we are connected to and as whom. Built once per connection attempt
/// and never modified; a reconnect builds a new one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalingSession {
    server: ServerParams,
    url: Url,
    room_id: String,
    peer_id: String,
    token: Option<String>,
}

impl SignalingSession {
    pub fn new(config: &DialogConfig, server: ServerParams) -> Result<Self, DialogError> {
        if config.room_id.is_empty() {
            return Err(DialogError::InvalidConfig("room id must not be empty".into()));
        }
        let url = server.signaling_url(&config.room_id, &config.peer_id)?;
        Ok(Self {
            server,
            url,
            room_id: config.room_id.clone(),
            peer_id: config.peer_id.clone(),
            token: config.token.clone(),
        })
    }

    pub fn server(&self) -> &ServerParams {
        &self.server
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

/// Looks up the room server to use, consulted again on every reconnect.
#[async_trait]
pub trait ServerResolver: Send + Sync {
    async fn resolve(&self, room_id: &str) -> Result<ServerParams, DialogError>;
}

/// Always answers with the same server, so a lost session is not retried.
#[derive(Clone, Debug)]
pub struct StaticResolver {
    server: ServerParams,
}

impl StaticResolver {
    pub fn new(server: ServerParams) -> Self {
        Self { server }
    }
}

#[async_trait]
impl ServerResolver for StaticResolver {
    async fn resolve(&self, _room_id: &str) -> Result<ServerParams, DialogError> {
        Ok(self.server.clone())
    }
}
