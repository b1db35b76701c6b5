//! Persistent configuration store.
//!
//! A single JSON map under `{data}/.firmware-data/config.json` backs every
//! piece of durable state: the product ID, the camera keypair, the paired
//! device list, the relay domain, and feature flags. Every mutation is
//! persisted before the call returns, via a temp-file write and atomic
//! rename so readers never observe a half-written map.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Error, Result};

/// Well-known config keys.
pub mod keys {
    /// The camera's opaque product ID, generated at first boot.
    pub const PRODUCT_ID: &str = "id";
    pub const FIRMWARE_VERSION: &str = "firmware_version";
    /// JSON list of paired devices.
    pub const CONNECTED_DEVICES: &str = "connectedDevices";
    /// The camera's X25519 private scalar, base64.
    pub const CAMERA_PRIVATE_KEY: &str = "cameraPrivateKey";
    /// The camera's X25519 public point, base64.
    pub const CAMERA_PUBLIC_KEY: &str = "cameraPublicKey";
    /// Hostname of the relay server.
    pub const RELAY_DOMAIN: &str = "relayDomain";
    /// Legacy spelling of the relay key, migrated on load.
    pub const LEGACY_RELAY_URL: &str = "relayUrl";
    pub const MICROPHONE_ENABLED: &str = "microphone_enabled";
    pub const PLAY_ACTIVE_CAMERA_SOUND: &str = "play_active_camera_sound";
}

pub struct ConfigStore {
    path: PathBuf,
    data: RwLock<Map<String, Value>>,
}

impl ConfigStore {
    /// Load the config file, creating it with an initial record (fresh
    /// product ID + firmware version) when absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut data = if path.exists() {
            let raw = fs::read(&path).map_err(|e| Error::Config(e.to_string()))?;
            serde_json::from_slice(&raw).map_err(|e| Error::Config(e.to_string()))?
        } else {
            let mut initial = Map::new();
            initial.insert(
                keys::PRODUCT_ID.into(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
            initial.insert(
                keys::FIRMWARE_VERSION.into(),
                Value::String(crate::FIRMWARE_VERSION.into()),
            );
            persist(&path, &initial)?;
            info!("created initial config at {}", path.display());
            initial
        };

        if migrate_relay_key(&mut data) {
            persist(&path, &data)?;
        }

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Read a value. Returns `None` when the key is absent.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.data.read().await.get(key).cloned()
    }

    /// Write a value and persist before returning. `Value::Null` deletes.
    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut data = self.data.write().await;
        if value.is_null() {
            data.remove(key);
        } else {
            data.insert(key.to_string(), value);
        }
        persist(&self.path, &data)
    }

    pub async fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key).await {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub async fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key).await {
            Some(Value::Bool(b)) => Some(b),
            _ => None,
        }
    }

    /// Read a base64-encoded byte value (key material).
    pub async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        use base64::Engine;
        let encoded = self.get_string(key).await?;
        base64::engine::general_purpose::STANDARD.decode(encoded).ok()
    }
}

/// Move a legacy `relayUrl` value to `relayDomain`, stripping any scheme and
/// path so only the hostname remains. Returns true when a migration happened.
fn migrate_relay_key(data: &mut Map<String, Value>) -> bool {
    if data.contains_key(keys::RELAY_DOMAIN) {
        return data.remove(keys::LEGACY_RELAY_URL).is_some();
    }
    let Some(Value::String(url)) = data.remove(keys::LEGACY_RELAY_URL) else {
        return false;
    };

    let domain = domain_from_url(&url);
    if !domain.is_empty() {
        info!("migrated relayUrl -> relayDomain ({domain})");
        data.insert(keys::RELAY_DOMAIN.into(), Value::String(domain));
    }
    true
}

/// Reduce a relay URL to its hostname: scheme and path are dropped.
pub fn domain_from_url(url: &str) -> String {
    url.split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url)
        .split('/')
        .next()
        .unwrap_or("")
        .to_string()
}

fn persist(path: &Path, data: &Map<String, Value>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::Config(e.to_string()))?;
    }

    let serialized =
        serde_json::to_vec_pretty(data).map_err(|e| Error::Config(e.to_string()))?;

    // Write-then-rename keeps the on-disk map intact if we lose power mid-write.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serialized).map_err(|e| Error::Config(e.to_string()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::Config(e.to_string()))?;
    }
    fs::rename(&tmp, path).map_err(|e| Error::Config(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fresh_store_gets_product_id_and_version() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("config.json")).unwrap();

        let id = store.get_string(keys::PRODUCT_ID).await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(
            store.get_string(keys::FIRMWARE_VERSION).await.unwrap(),
            crate::FIRMWARE_VERSION
        );
    }

    #[tokio::test]
    async fn set_get_delete_roundtrip() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("config.json")).unwrap();

        store.set("flag", json!(true)).await.unwrap();
        assert_eq!(store.get_bool("flag").await, Some(true));

        store.set("flag", Value::Null).await.unwrap();
        assert_eq!(store.get("flag").await, None);
    }

    #[tokio::test]
    async fn values_survive_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let store = ConfigStore::load(&path).unwrap();
        store.set("relayDomain", json!("relay.example")).await.unwrap();
        let id = store.get_string(keys::PRODUCT_ID).await.unwrap();
        drop(store);

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(
            reloaded.get_string("relayDomain").await.unwrap(),
            "relay.example"
        );
        assert_eq!(reloaded.get_string(keys::PRODUCT_ID).await.unwrap(), id);
    }

    #[tokio::test]
    async fn legacy_relay_url_is_migrated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            serde_json::to_vec(&json!({
                "id": "cam-1",
                "relayUrl": "wss://relay.example.com/ws"
            }))
            .unwrap(),
        )
        .unwrap();

        let store = ConfigStore::load(&path).unwrap();
        assert_eq!(
            store.get_string(keys::RELAY_DOMAIN).await.unwrap(),
            "relay.example.com"
        );
        assert_eq!(store.get(keys::LEGACY_RELAY_URL).await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn config_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let _store = ConfigStore::load(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
