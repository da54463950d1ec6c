//! LANCast presenter host — entry point.
//!
//! This binary runs the control plane of a LANCast session: it accepts
//! WebSocket connections from viewers, maintains the roster and reactions,
//! and announces the session on the LAN over mDNS so viewers can find it
//! without typing an address.
//!
//! # Usage
//!
//! ```text
//! lancast-host [OPTIONS]
//!
//! Options:
//!   --room <NAME>     Room name shown to viewers [default: LANCast]
//!   --name <NAME>     Presenter display name [default: Presenter]
//!   --port <PORT>     Signaling port [default: 9877]
//!   --bind <ADDR>     IP address to bind [default: 0.0.0.0]
//!   --no-advertise    Do not announce the session over mDNS
//! ```
//!
//! # Environment variable overrides
//!
//! CLI args take precedence when both are present.
//!
//! | Variable        | Default     | Description            |
//! |-----------------|-------------|------------------------|
//! | `LANCAST_ROOM`  | `LANCast`   | Room name              |
//! | `LANCAST_NAME`  | `Presenter` | Presenter display name |
//! | `LANCAST_PORT`  | `9877`      | Signaling port         |
//! | `LANCAST_BIND`  | `0.0.0.0`   | Bind address           |
//!
//! # Architecture overview
//!
//! ```text
//! Viewers  (JSON over WebSocket)
//!     ↕
//! lancast-host  ← this process
//!   application/
//!     coordinator/  Roster, reactions, per-connection routing
//!     negotiator/   Per-viewer media sessions, adaptive quality
//!   infrastructure/
//!     signaling/    WebSocket accept loop and connection tasks
//!     discovery/    mDNS advertisement and browsing
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lancast_host::application::coordinator::{CoordinatorConfig, SessionEvent};
use lancast_host::infrastructure::discovery::DiscoveryService;
use lancast_host::infrastructure::signaling::SignalingServer;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// LANCast presenter host.
///
/// Runs the signaling server and announces the session on the LAN.
#[derive(Debug, Parser)]
#[command(
    name = "lancast-host",
    about = "Screen broadcast control plane for LAN presentations",
    version
)]
struct Cli {
    /// Room name shown to viewers in the session browser.
    #[arg(long, default_value = "LANCast", env = "LANCAST_ROOM")]
    room: String,

    /// Presenter display name sent in the welcome message.
    #[arg(long, default_value = "Presenter", env = "LANCAST_NAME")]
    name: String,

    /// TCP port for the signaling server to listen on.
    #[arg(long, default_value_t = 9877, env = "LANCAST_PORT")]
    port: u16,

    /// IP address to bind the signaling server to.
    ///
    /// Use `0.0.0.0` to accept viewers from any interface, or `127.0.0.1`
    /// to accept only local connections.
    #[arg(long, default_value = "0.0.0.0", env = "LANCAST_BIND")]
    bind: String,

    /// Do not announce the session over mDNS.
    ///
    /// Viewers must then connect by typing the address manually.
    #[arg(long)]
    no_advertise: bool,
}

impl Cli {
    fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("invalid bind address: '{}:{}'", self.bind, self.port))
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// # What happens at startup
///
/// 1. `tracing_subscriber` is initialised; the log level is controlled by
///    the `RUST_LOG` environment variable.
/// 2. CLI arguments are parsed with `clap`.
/// 3. The signaling server is started on the requested address.
/// 4. Unless `--no-advertise` was given, the session is published over
///    mDNS with the port the server actually bound.
/// 5. Session events are logged until Ctrl+C, then everything is torn down
///    in order: stop advertising, stop the server, shut the daemon down.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let bind_addr = cli.bind_addr()?;

    let config = CoordinatorConfig {
        presenter_name: cli.name.clone(),
        room_name: cli.room.clone(),
        ..CoordinatorConfig::default()
    };

    info!("LANCast host starting — room=\"{}\" bind={bind_addr}", cli.room);
    let (server, mut events) = SignalingServer::start(config, bind_addr).await?;

    // Advertise with the port the listener actually bound, so port 0 works.
    let mut discovery = if cli.no_advertise {
        None
    } else {
        match DiscoveryService::new() {
            Ok(mut service) => {
                service.advertise(&cli.room, &cli.name, server.local_addr().port(), None)?;
                Some(service)
            }
            Err(e) => {
                // Viewers can still connect manually; keep serving.
                error!("mDNS unavailable, session will not be discoverable: {e}");
                None
            }
        }
    };

    // Log session events until the channel closes at shutdown.
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::RosterChanged { roster } => {
                    info!("roster changed: {} viewer(s)", roster.len());
                }
                SessionEvent::ReactionChanged { viewer_id, reaction } => {
                    info!("reaction from {viewer_id}: {reaction:?}");
                }
                SessionEvent::ReactionsCleared => info!("all reactions cleared"),
                SessionEvent::ViewerAnswer { viewer_id, .. } => {
                    info!("media answer from {viewer_id}");
                }
                SessionEvent::ViewerCandidate { viewer_id, .. } => {
                    info!("media candidate from {viewer_id}");
                }
            }
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C — shutting down"),
        Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
    }

    if let Some(discovery) = discovery.as_mut() {
        discovery.stop_advertising();
    }
    server.stop().await;
    if let Some(discovery) = discovery.as_mut() {
        discovery.shutdown();
    }
    // The coordinator closes the event channel when it stops.
    let _ = tokio::time::timeout(Duration::from_secs(1), event_task).await;

    info!("LANCast host stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
