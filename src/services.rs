//! Dependency-injection root.
//!
//! One `Services` value owns every subsystem handle and is built exactly
//! once at startup; components receive the `Arc` and never reach for
//! process globals. Construction order encodes the dependency order, so a
//! component cannot exist before what it needs.

use std::sync::Arc;

use crate::capture::Recorder;
use crate::config::ConfigStore;
use crate::devices::DeviceRegistry;
use crate::error::Result;
use crate::logger::LogStore;
use crate::pairing::PairingService;
use crate::paths::Paths;
use crate::relay::{RelayClient, RelayConfig};
use crate::speaker::Speaker;
use crate::storage::Storage;
use crate::streaming::Viewers;
use crate::updater::Updater;
use crate::ups::Ups;
use crate::wifi::WiFi;

pub struct Services {
    pub paths: Paths,
    pub config: Arc<ConfigStore>,
    pub registry: DeviceRegistry,
    pub relay: RelayClient,
    pub recorder: Arc<Recorder>,
    pub storage: Arc<Storage>,
    pub wifi: Arc<WiFi>,
    pub speaker: Arc<Speaker>,
    pub ups: Arc<Ups>,
    pub updater: Arc<Updater>,
    pub logs: Arc<LogStore>,
    pub viewers: Viewers,
    pub pairing: Arc<PairingService>,
}

impl Services {
    /// Build the full service graph under a data root.
    pub fn init(paths: Paths, logs: Arc<LogStore>) -> Result<Arc<Self>> {
        Self::init_with_relay_config(paths, logs, RelayConfig::default())
    }

    /// As [`Services::init`], with relay timing overrides (used by tests).
    pub fn init_with_relay_config(
        paths: Paths,
        logs: Arc<LogStore>,
        relay_cfg: RelayConfig,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(ConfigStore::load(&paths.config_file)?);
        let registry = DeviceRegistry::new(Arc::clone(&config));
        let storage = Arc::new(Storage::init(paths.clone())?);
        let wifi = Arc::new(WiFi::new());
        let speaker = Arc::new(Speaker::new());
        let ups = Arc::new(Ups::probe());
        let recorder = Arc::new(Recorder::new(Arc::clone(&config)));
        let updater = Arc::new(Updater::new(Arc::clone(&config), paths.clone()));
        let relay = RelayClient::with_config(Arc::clone(&config), relay_cfg);
        let pairing = Arc::new(PairingService::new(
            Arc::clone(&config),
            registry.clone(),
            Arc::clone(&wifi),
            Arc::clone(&speaker),
            paths.clone(),
        ));

        Ok(Arc::new(Self {
            paths,
            config,
            registry,
            relay,
            recorder,
            storage,
            wifi,
            speaker,
            ups,
            updater,
            logs,
            viewers: Viewers::new(),
            pairing,
        }))
    }
}
