use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use beach_dialog::config::{DialogConfig, IcePolicy, ServerParams};
use beach_dialog::signaling::{
    ClientRequest, SignalingChannel, SignalingEvent, WebSocketConnector,
};
use beach_dialog::telemetry::{self, LogConfig, LogLevel};
use clap::Parser;
use serde_json::Value;

/// Opens a signaling channel to a room server, prints what the router
/// offers and watches the room. No media is sent or received.
#[derive(Parser, Debug)]
#[command(name = "beach-dialog", version)]
struct Cli {
    /// Room server as host:port (falls back to BEACH_DIALOG_SERVER)
    #[arg(long)]
    server: Option<String>,

    #[arg(long)]
    room: Option<String>,

    #[arg(long)]
    peer: Option<String>,

    #[arg(long)]
    token: Option<String>,

    #[arg(long)]
    force_tcp: bool,

    #[arg(long)]
    force_turn: bool,

    #[arg(long, value_enum)]
    ice_policy: Option<IcePolicy>,

    /// How long to watch the room before closing
    #[arg(long, default_value_t = 30)]
    listen_secs: u64,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<DialogConfig> {
        let mut config = DialogConfig::from_env().context("reading BEACH_DIALOG_* environment")?;
        if let Some(server) = self.server.as_deref() {
            config.server = ServerParams::parse(server)?;
        }
        if let Some(room) = self.room {
            config.room_id = room;
        }
        if let Some(peer) = self.peer {
            config.display_name = peer.clone();
            config.peer_id = peer;
        }
        if self.token.is_some() {
            config.token = self.token;
        }
        config.force_tcp |= self.force_tcp;
        config.force_turn |= self.force_turn;
        if let Some(policy) = self.ice_policy {
            config.ice_policy = policy;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    }) {
        eprintln!("failed to initialise logging: {err}");
    }

    if let Err(err) = run(cli).await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let listen = Duration::from_secs(cli.listen_secs);
    let config = cli.into_config()?;
    let url = config.server.signaling_url(&config.room_id, &config.peer_id)?;

    let channel = SignalingChannel::new(
        Arc::new(WebSocketConnector),
        config.request_timeout,
        config.connect_retries,
    );
    let mut events = channel.take_events()?;
    channel
        .open(&url)
        .await
        .with_context(|| format!("connecting to {url}"))?;

    let caps = channel
        .request(ClientRequest::GetRouterRtpCapabilities)
        .await
        .context("fetching router capabilities")?;
    let count = |field: &str| caps.get(field).and_then(Value::as_array).map_or(0, Vec::len);
    tracing::info!(
        target: "dialog",
        room = %config.room_id,
        peer = %config.peer_id,
        codecs = count("codecs"),
        header_extensions = count("headerExtensions"),
        ice_servers = config.ice_servers().len(),
        "router capabilities"
    );

    let deadline = tokio::time::sleep(listen);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(SignalingEvent::Notification(notification)) => {
                    tracing::info!(target: "dialog", ?notification, "notification");
                }
                Some(SignalingEvent::Request(incoming)) => {
                    let (request, responder) = incoming.into_parts();
                    tracing::info!(target: "dialog", method = request.method(), "rejecting server request");
                    responder.reject(501, "signaling monitor does not handle media");
                }
                Some(SignalingEvent::Error(err)) => {
                    tracing::warn!(target: "dialog", error = %err, "signaling error");
                }
                Some(SignalingEvent::Closed { .. }) | None => {
                    anyhow::bail!("signaling channel closed by the server");
                }
            },
        }
    }

    channel.close();
    Ok(())
}
