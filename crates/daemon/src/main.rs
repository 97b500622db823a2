//! TerminalSync daemon binary.
//!
//! Loads configuration (file, then environment overrides), wires the session
//! store, manager, and gateway together, and runs until a termination signal
//! arrives or the idle scheduler decides nothing is worth staying up for.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use daemon::client::ClientDeps;
use daemon::config::Config;
use daemon::gateway::{self, AuthToken, GatewayState};
use daemon::manager::SessionManager;
use daemon::pidfile;
use daemon::session::SessionStore;
use daemon::tmux::TmuxProvider;

/// TerminalSync daemon - share a local shell session over the network.
#[derive(Parser, Debug)]
#[command(name = "terminalsyncd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate().context("invalid configuration")?;

    init_tracing(&config, cli.verbose);

    let pid_file = match pidfile::PidFile::acquire() {
        Ok(claimed) => Some(claimed),
        Err(e @ pidfile::PidFileError::AlreadyRunning(_)) => return Err(e.into()),
        Err(e) => {
            warn!(error = %e, "could not claim PID file");
            None
        }
    };

    let store = SessionStore::with_max_buffer_bytes(config.session.max_buffer_bytes);
    let tmux = Arc::new(TmuxProvider::new(config.session.scrollback_lines));

    // The idle sink is the only path through which the core may end the
    // process; it funnels into the same shutdown sequence as the signals.
    let (idle_tx, mut idle_rx) = tokio::sync::mpsc::channel::<()>(1);
    let manager = SessionManager::new(
        store.clone(),
        config.server.max_clients,
        Box::new(move || {
            let _ = idle_tx.try_send(());
        }),
    );
    manager.start();

    let state = GatewayState {
        deps: ClientDeps {
            store: store.clone(),
            manager: manager.clone(),
            tmux,
            default_shell: config.session.default_shell.clone(),
        },
        auth: Arc::new(AuthToken::new(config.auth.token.clone().into_bytes())),
        web_root: config.server.web_root.clone(),
    };
    let app = gateway::router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "terminalsyncd listening");

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm() => info!("received SIGTERM, shutting down"),
        _ = idle_rx.recv() => info!("idle, shutting down"),
    }

    manager.shutdown().await;
    let _ = stop_tx.send(());
    if let Err(e) = server.await {
        warn!(error = %e, "server task ended abnormally");
    }
    drop(pid_file);

    Ok(())
}

fn init_tracing(config: &Config, verbose: bool) {
    let default_level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn sigterm() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    }

    #[cfg(not(unix))]
    std::future::pending::<()>().await;
}
