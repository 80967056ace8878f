#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # relaytun
//!
//! Self-hosted reverse tunnel: expose a service on a private network at
//! `<id>.<domain>` through a public relay.
//!
//! ## Subcommands
//!
//! - `relaytun server` — run the relay (control and public listeners)
//! - `relaytun start` — run an agent next to a local service
//!
//! ## Relay API surface
//!
//! | Plane   | Method | Path            | Description                              |
//! |---------|--------|-----------------|------------------------------------------|
//! | control | POST   | `/connect`      | Register a direct-proxy tunnel           |
//! | control | POST   | `/close/{id}`   | Remove a tunnel (idempotent)             |
//! | control | GET    | `/ws`           | Open a multiplexed tunnel session        |
//! | control | GET    | `/tunnels`      | List live tunnels                        |
//! | both    | GET    | `/health`       | Liveness probe                           |
//! | public  | any    | `/*`            | Routed to the tunnel named by `Host`     |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, listeners, graceful shutdown
//! config.rs        — TOML + env-var configuration (relay and agent)
//! error.rs         — TunnelError and its HTTP status mapping
//! routes/
//!   health.rs      — GET /health
//! tunnel/
//!   envelope.rs    — registration payload and JSON frames
//!   registry.rs    — live tunnels keyed by ID
//!   pending.rs     — request ID → waiting public request
//!   relay.rs       — control/public routers, delivery, WS sessions
//!   reaper.rs      — idle tunnel eviction
//!   agent.rs       — client side: register, serve frames, close
//!   tcp_relay.rs   — optional local TCP relay for direct mode
//! ```

use std::future::IntoFuture;

use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use relaytun::config::AgentMode;
use relaytun::tunnel::{agent::Agent, reaper, relay};
use relaytun::{AgentConfig, Config, PendingRequests, Registry, RelaySettings, RelayState};

/// Self-hosted reverse tunnel relay and agent.
#[derive(Parser)]
#[command(name = "relaytun", version)]
struct Cli {
    /// Log filter (overridden by RUST_LOG).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server.
    Server(ServerArgs),
    /// Expose a local service through a relay.
    Start(StartArgs),
}

#[derive(Args)]
struct ServerArgs {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    /// Control-plane listen address.
    #[arg(long)]
    internal_addr: Option<String>,
    /// Public-plane listen address.
    #[arg(long)]
    public_addr: Option<String>,
    /// Evict tunnels idle for this many seconds (0 disables).
    #[arg(long)]
    idle_timeout: Option<u64>,
}

#[derive(Args)]
struct StartArgs {
    /// Relay control-plane host:port.
    #[arg(long)]
    endpoint: Option<String>,
    /// Use http/ws instead of https/wss.
    #[arg(long)]
    insecure: bool,
    /// Address the relay dials in direct mode.
    #[arg(long)]
    ip: Option<String>,
    /// Requested tunnel ID.
    #[arg(long)]
    id: Option<String>,
    /// Local service port.
    #[arg(long)]
    port: Option<u16>,
    /// Public base domain used to print the tunnel URL.
    #[arg(long)]
    domain: Option<String>,
    /// Run a local TCP relay on this port and advertise it.
    #[arg(long)]
    proxy_port: Option<u16>,
    /// Delivery mode.
    #[arg(long, value_enum)]
    mode: Option<AgentMode>,
}

impl StartArgs {
    fn apply(self, config: &mut AgentConfig) {
        if let Some(endpoint) = self.endpoint {
            config.endpoint = endpoint;
        }
        if self.insecure {
            config.insecure = true;
        }
        if let Some(ip) = self.ip {
            config.ip = ip;
        }
        if let Some(id) = self.id.filter(|id| !id.is_empty()) {
            config.id = Some(id);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(domain) = self.domain {
            config.domain = Some(domain).filter(|d| !d.is_empty());
        }
        if let Some(proxy_port) = self.proxy_port.filter(|p| *p != 0) {
            config.proxy_port = Some(proxy_port);
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = cli.log_level;

    let result = match cli.command {
        Commands::Server(args) => run_server(args, log_level.as_deref()).await,
        Commands::Start(args) => run_agent(args, log_level.as_deref()).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins over `--log-level`, which wins over the configured level.
fn init_tracing(cli_level: Option<&str>, config_level: &str) {
    let log_filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| cli_level.map(ToString::to_string))
        .unwrap_or_else(|| config_level.to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run_server(args: ServerArgs, log_level: Option<&str>) -> Result<(), String> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(addr) = args.internal_addr {
        config.server.internal_listen = addr;
    }
    if let Some(addr) = args.public_addr {
        config.server.public_listen = addr;
    }
    if let Some(secs) = args.idle_timeout {
        config.server.idle_timeout_secs = secs;
    }

    init_tracing(log_level, &config.logging.level);
    info!("relaytun v{} starting", env!("CARGO_PKG_VERSION"));

    let state = RelayState::new(
        Registry::new(),
        PendingRequests::new(),
        RelaySettings::from(&config.server),
    );

    let control_app = relay::control_router(state.clone()).layer(TraceLayer::new_for_http());
    let public_app = relay::public_router(state.clone()).layer(TraceLayer::new_for_http());

    let control_listener = TcpListener::bind(&config.server.internal_listen)
        .await
        .map_err(|e| format!("Failed to bind {}: {e}", config.server.internal_listen))?;
    let public_listener = TcpListener::bind(&config.server.public_listen)
        .await
        .map_err(|e| format!("Failed to bind {}: {e}", config.server.public_listen))?;
    info!("Control plane listening on {}", config.server.internal_listen);
    info!("Public plane listening on {}", config.server.public_listen);

    let shutdown = CancellationToken::new();
    let reaper_task = reaper::spawn(
        state.registry.clone(),
        config.server.idle_timeout(),
        config.server.reap_interval(),
        shutdown.clone(),
    );

    // Upgraded session connections are closed as soon as the signal arrives.
    let signal_token = shutdown.clone();
    let registry = state.registry.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
        let closed = registry.drain().await;
        info!(closed, "Closed tunnels");
    });

    let control_server = axum::serve(control_listener, control_app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let public_server = axum::serve(public_listener, public_app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    info!("Server ready");
    let served = tokio::try_join!(control_server.into_future(), public_server.into_future());

    info!("Shutting down...");
    shutdown.cancel();
    if let Some(task) = reaper_task {
        let _ = task.await;
    }
    served.map_err(|e| format!("Server error: {e}"))?;
    info!("Goodbye");
    Ok(())
}

async fn run_agent(args: StartArgs, log_level: Option<&str>) -> Result<(), String> {
    init_tracing(log_level, "info");

    let mut config = AgentConfig::load()?;
    args.apply(&mut config);

    let agent = Agent::new(config).map_err(|e| e.to_string())?;
    agent
        .run(shutdown_signal())
        .await
        .map_err(|e| e.to_string())
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    () = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("Received SIGINT");
    }
}
