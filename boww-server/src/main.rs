//! Bag-of-Wake-Words arbitration server entry point.
//!
//! Startup order matters: configuration must load (a failure here exits
//! non-zero), the VAD model may degrade to disabled, and discovery is
//! best-effort. The transport loop then runs until ctrl-c / SIGTERM.

mod config_file;
mod discovery;
mod server;
mod transport;

use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use boww_core::{DisabledVad, SileroVad, VoiceDetector};

use server::Server;

const LISTEN_PORT: u16 = 9002;
const CONFIG_PATH: &str = "clients.yaml";
const VAD_MODEL_PATH: &str = "models/silero_vad.onnx";
const SERVICE_INSTANCE: &str = "BoWW-Server";

/// Command-line options.
#[derive(Debug, Parser)]
#[command(name = "boww-server", about = "Bag-of-Wake-Words arbitration server", version)]
struct Cli {
    /// Enable verbose transport and pipeline logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        debug = cli.debug,
        "starting wake-word arbitration server"
    );

    let view = config_file::load(Path::new(CONFIG_PATH))
        .with_context(|| format!("failed to load {CONFIG_PATH}"))?;
    info!(
        groups = view.group_count(),
        clients = view.client_count(),
        "configuration loaded"
    );

    let vad: Arc<dyn VoiceDetector> = match SileroVad::new(VAD_MODEL_PATH) {
        Ok(vad) => Arc::new(vad),
        Err(e) => {
            warn!("VAD model load failed ({e}); voice detection disabled, silence timeouts still apply");
            Arc::new(DisabledVad)
        }
    };

    let server = Arc::new(Server::new(vad));

    let mut watcher = config_file::ConfigWatcher::new(CONFIG_PATH, Arc::clone(&server));
    watcher.apply(&view);

    let _mdns = match discovery::advertise(SERVICE_INSTANCE, LISTEN_PORT) {
        Ok(daemon) => Some(daemon),
        Err(e) => {
            warn!("mDNS advertisement failed: {e}");
            None
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let ticker = server::spawn_ticker(Arc::clone(&server), Arc::clone(&running));
    let watcher_task = watcher.spawn(Arc::clone(&running));

    tokio::select! {
        result = transport::run(Arc::clone(&server), LISTEN_PORT) => result?,
        _ = shutdown_signal() => info!("shutdown requested"),
    }

    running.store(false, Ordering::SeqCst);
    let _ = ticker.await;
    let _ = watcher_task.await;
    info!("server stopped");
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_filter = if debug {
        "boww_core=debug,boww_server=debug,info"
    } else {
        "info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

/// Wait for ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
