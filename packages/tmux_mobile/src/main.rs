use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::prelude::*;

use pty_attach::{PtyFactory, TmuxAttachFactory};

mod auth;
mod broker;
mod config;
mod handlers;
mod metrics;
mod monitor;
mod runtime;
mod tmux;

use crate::auth::AuthService;
use crate::broker::Broker;
use crate::config::{DataDir, FileConfig, RuntimeConfig, load_config};
use crate::metrics::ServerMetrics;
use crate::monitor::StateMonitor;
use crate::tmux::{CliGateway, MultiplexerGateway};

#[derive(Parser)]
#[command(
    name = "tmux-mobile",
    about = "Remote-control gateway for tmux over paired WebSocket channels",
    version
)]
struct Cli {
    /// Port for the web server
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Require this password in addition to the token
    #[arg(long)]
    password: Option<String>,

    /// Shared connection token (generated when omitted)
    #[arg(long)]
    token: Option<String>,

    /// Base session to create when none exist
    #[arg(long = "session")]
    default_session: Option<String>,

    /// Directory containing the built frontend
    #[arg(long)]
    frontend_dir: Option<PathBuf>,

    /// Custom data directory (defaults to ~/.tmux-mobile)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "tmux_mobile=debug,tower_http=debug,info"
    } else {
        "tmux_mobile=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let data_dir = DataDir::new(cli.data_dir.clone())?;
    let mut fc: FileConfig = load_config(&data_dir.data_dir)
        .extract()
        .context("Failed to load configuration")?;

    if let Some(port) = cli.port {
        fc.server.port = port;
    }
    if let Some(host) = cli.host {
        fc.server.host = host;
    }
    if let Some(frontend_dir) = cli.frontend_dir {
        fc.server.frontend_dir = frontend_dir;
    }
    if cli.password.is_some() {
        fc.auth.password = cli.password;
    }
    if cli.token.is_some() {
        fc.auth.token = cli.token;
    }
    if let Some(session) = cli.default_session {
        fc.tmux.default_session = session;
    }

    let (config, token_generated) = RuntimeConfig::from_file(&fc);
    let config = Arc::new(config);

    info!("Starting tmux-mobile gateway");
    if token_generated {
        info!("Generated connection token: {}", config.token);
    }
    if config.password.is_some() {
        info!("Clients must additionally present the configured password");
    }

    let gateway: Arc<dyn MultiplexerGateway> = Arc::new(CliGateway::new(
        config.tmux_bin.clone(),
        config.command_timeout,
    ));
    let factory: Arc<dyn PtyFactory> = Arc::new(TmuxAttachFactory::new(config.tmux_bin.clone()));
    let auth = Arc::new(AuthService::new(
        config.token.clone(),
        config.password.clone(),
    ));
    let monitor = Arc::new(StateMonitor::new(gateway.clone(), config.poll_interval));
    let metrics = Arc::new(ServerMetrics::new());

    let broker = Arc::new(Broker::new(
        gateway,
        factory,
        auth,
        monitor.clone(),
        config.clone(),
        metrics,
    ));
    broker.spawn_monitor_error_drain();
    monitor.start();

    let app = handlers::router(handlers::AppState {
        broker: broker.clone(),
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid host/port")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Listening on http://{}", actual_addr);
    info!("  control plane: ws://{}/ws/control", actual_addr);
    info!("  data plane:    ws://{}/ws/terminal", actual_addr);

    // Ctrl-C drives the broker's stop sequence; the sequence releases
    // the listener through the shutdown token once contexts are down.
    let stop_broker = broker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            stop_broker.stop().await;
        }
    });

    let shutdown = broker.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("Server error")?;

    // Covers non-signal exits; a no-op when the signal path already ran.
    broker.stop().await;
    info!("Shutdown complete");
    Ok(())
}
