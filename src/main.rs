//! Komori firmware daemon.
//!
//! Boot order matters: config store first (everything persists through it),
//! then the hardware subsystems, then the pairing server, and finally the
//! relay client when a relay domain has already been configured. The
//! process parks until SIGINT/SIGTERM and shuts its loops down in reverse.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use komori::config::keys;
use komori::logger::{LogLayer, LogStore};
use komori::paths::Paths;
use komori::{handlers, pairing, Services, FIRMWARE_VERSION};

const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct AppConfig {
    data_dir: PathBuf,
    pairing_port: u16,
}

impl AppConfig {
    fn from_env() -> Self {
        let data_dir = std::env::var("KOMORI_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(komori::paths::DEFAULT_DATA_DIR));

        let pairing_port = std::env::var("KOMORI_PAIRING_PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .unwrap_or(80);

        Self {
            data_dir,
            pairing_port,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let app = AppConfig::from_env();
    let paths = Paths::new(&app.data_dir);

    std::fs::create_dir_all(&paths.firmware_data_dir)
        .context("failed to create firmware data directory")?;
    std::fs::create_dir_all(&paths.assets_dir).context("failed to prepare assets directory")?;

    let logs = LogStore::open(&paths.logs_file);
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("komori=info".parse().expect("valid directive")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(LogLayer::new(Arc::clone(&logs)))
        .init();

    info!("komori firmware {FIRMWARE_VERSION} starting");

    let services =
        Services::init(paths.clone(), logs).context("failed to initialize services")?;

    pairing::http::serve(Arc::clone(&services), app.pairing_port)
        .await
        .context("failed to start pairing server")?;

    // Remote control only comes up once setup stored a relay domain.
    let relay_configured = services
        .config
        .get_string(keys::RELAY_DOMAIN)
        .await
        .is_some_and(|domain| !domain.is_empty());
    if relay_configured {
        handlers::register_handlers(&services);
        if let Err(e) = services.relay.start().await {
            warn!("failed to start relay client: {e}");
        }
    } else {
        info!("relay domain not configured; remote control disabled until setup");
    }

    spawn_update_checker(&services);

    shutdown_signal().await;
    info!("shutdown signal received, stopping");

    services.relay.stop();
    services.recorder.stop_stream().await;
    services.recorder.stop_recording().await;
    services.speaker.stop_stream().await;

    Ok(())
}

/// Check for firmware updates immediately and then every five minutes.
fn spawn_update_checker(services: &Arc<Services>) {
    let updater = Arc::clone(&services.updater);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(UPDATE_CHECK_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = updater.check_for_updates().await {
                warn!("update check failed: {e}");
            }
        }
    });
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
