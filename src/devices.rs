//! Paired-device registry.
//!
//! The serialized `connectedDevices` config entry is the single source of
//! truth; everything in memory besides the kick-timer map is derived from
//! it. One mutex guards both the list mutation (including its persistence
//! write) and the timer map, so a later reader always observes a completed
//! mutation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::config::{keys, ConfigStore};
use crate::crypto;
use crate::error::Result;

/// Delay between scheduling a kick and the device being removed.
pub const KICK_DELAY: Duration = Duration::from_secs(5 * 60);

/// A paired device and its public key material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(rename = "publicKey", with = "crypto::serde_b64")]
    pub public_key: [u8; 32],
    #[serde(rename = "connectedAt")]
    pub connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    /// Pending scheduled removals, at most one per device ID.
    kick_timers: HashMap<String, AbortHandle>,
}

/// Cheaply cloneable handle to the registry.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: Arc<ConfigStore>,
    state: Mutex<RegistryState>,
}

impl DeviceRegistry {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// All paired devices, in pairing order.
    pub async fn get_all(&self) -> Vec<Device> {
        let _state = self.inner.state.lock().await;
        self.inner.read_devices().await
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Device> {
        let _state = self.inner.state.lock().await;
        self.inner
            .read_devices()
            .await
            .into_iter()
            .find(|d| d.id == id)
    }

    /// Add a device, replacing any existing record with the same ID.
    pub async fn add(&self, id: &str, name: &str, public_key: [u8; 32]) -> Result<()> {
        let _state = self.inner.state.lock().await;

        let mut devices = self.inner.read_devices().await;
        devices.retain(|d| d.id != id);
        devices.push(Device {
            id: id.to_string(),
            name: name.to_string(),
            public_key,
            connected_at: Utc::now(),
        });

        self.inner.persist(&devices).await?;
        info!(device_id = id, "device paired");
        Ok(())
    }

    /// Remove a device immediately, cancelling any pending kick.
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.inner.remove(id, true).await
    }

    /// Schedule removal of a device after [`KICK_DELAY`]. A second schedule
    /// for the same ID replaces the first timer.
    pub async fn schedule_kick(&self, id: &str) {
        let mut state = self.inner.state.lock().await;

        if let Some(prior) = state.kick_timers.remove(id) {
            prior.abort();
        }

        let inner = Arc::clone(&self.inner);
        let device_id = id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(KICK_DELAY).await;
            // Fire without aborting our own timer entry; `remove` drops the
            // map entry so no handle outlives the task.
            if let Err(e) = inner.remove(&device_id, false).await {
                debug!(device_id = %device_id, "scheduled kick failed: {e}");
            }
        });

        state.kick_timers.insert(id.to_string(), task.abort_handle());
        info!(device_id = id, "kick scheduled");
    }

    /// Number of pending kick timers (test observability).
    pub async fn pending_kicks(&self) -> usize {
        self.inner.state.lock().await.kick_timers.len()
    }
}

impl RegistryInner {
    async fn remove(&self, id: &str, abort_timer: bool) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(timer) = state.kick_timers.remove(id) {
            if abort_timer {
                timer.abort();
            }
        }

        let mut devices = self.read_devices().await;
        let before = devices.len();
        devices.retain(|d| d.id != id);
        if devices.len() != before {
            info!(device_id = id, "device removed");
        }

        self.persist(&devices).await
    }

    async fn read_devices(&self) -> Vec<Device> {
        match self.config.get(keys::CONNECTED_DEVICES).await {
            Some(value) => serde_json::from_value(value).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn persist(&self, devices: &[Device]) -> Result<()> {
        let value: Value = serde_json::to_value(devices)?;
        self.config.set(keys::CONNECTED_DEVICES, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry(dir: &std::path::Path) -> DeviceRegistry {
        let config = Arc::new(ConfigStore::load(dir.join("config.json")).unwrap());
        DeviceRegistry::new(config)
    }

    /// Let spawned timer tasks run after the paused clock is advanced.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn add_and_get_roundtrip() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());

        reg.add("dev-1", "Phone", [0x11; 32]).await.unwrap();
        reg.add("dev-2", "Tablet", [0x22; 32]).await.unwrap();

        assert_eq!(reg.get_all().await.len(), 2);
        let dev = reg.get_by_id("dev-1").await.unwrap();
        assert_eq!(dev.name, "Phone");
        assert_eq!(dev.public_key, [0x11; 32]);
    }

    #[tokio::test]
    async fn re_adding_replaces_in_place() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());

        reg.add("dev-1", "Phone", [0x11; 32]).await.unwrap();
        reg.add("dev-1", "Renamed", [0x33; 32]).await.unwrap();

        let all = reg.get_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Renamed");
        assert_eq!(all[0].public_key, [0x33; 32]);
    }

    #[tokio::test]
    async fn devices_survive_registry_reload() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config = Arc::new(ConfigStore::load(&config_path).unwrap());
        let reg = DeviceRegistry::new(Arc::clone(&config));
        reg.add("dev-1", "Phone", [0x11; 32]).await.unwrap();
        drop(reg);
        drop(config);

        let config = Arc::new(ConfigStore::load(&config_path).unwrap());
        let reg = DeviceRegistry::new(config);
        assert!(reg.get_by_id("dev-1").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_kick_removes_after_delay() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());

        reg.add("dev-1", "Phone", [0x11; 32]).await.unwrap();
        reg.schedule_kick("dev-1").await;
        settle().await;
        assert_eq!(reg.pending_kicks().await, 1);

        tokio::time::advance(KICK_DELAY + Duration::from_secs(1)).await;
        settle().await;

        assert!(reg.get_by_id("dev-1").await.is_none());
        assert_eq!(reg.pending_kicks().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_cancels_pending_kick() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());

        reg.add("dev-1", "Phone", [0x11; 32]).await.unwrap();
        reg.schedule_kick("dev-1").await;
        settle().await;

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        settle().await;
        reg.remove("dev-1").await.unwrap();
        assert_eq!(reg.pending_kicks().await, 0);

        // Past the original fire time: nothing left to remove, no timer fires.
        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        settle().await;
        assert!(reg.get_by_id("dev-1").await.is_none());
        assert_eq!(reg.pending_kicks().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_resets_the_timer() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());

        reg.add("dev-1", "Phone", [0x11; 32]).await.unwrap();
        reg.schedule_kick("dev-1").await;
        settle().await;

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        settle().await;
        reg.schedule_kick("dev-1").await;
        settle().await;
        assert_eq!(reg.pending_kicks().await, 1);

        // Six minutes after the first schedule, but only two after the
        // second: the device must still be paired.
        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        settle().await;
        assert!(reg.get_by_id("dev-1").await.is_some());

        tokio::time::advance(Duration::from_secs(3 * 60 + 1)).await;
        settle().await;
        assert!(reg.get_by_id("dev-1").await.is_none());
    }
}
