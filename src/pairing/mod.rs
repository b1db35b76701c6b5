//! Pairing: bootstrap a shared cryptographic identity with a new device.
//!
//! The camera speaks a 6-digit code out loud; a human types it into the
//! phone within five minutes. A matching code commits the device to the
//! registry and hands back the camera's public key, from which both sides
//! derive the same session key. The code is single-use and at most one is
//! active at a time.
//!
//! The service layer is carrier-agnostic; `http` is the access-point
//! carrier. A BLE GATT carrier would drive the same state machine.

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::Rng;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{keys, ConfigStore};
use crate::crypto::{self, KeyPair};
use crate::devices::DeviceRegistry;
use crate::error::{Error, Result};
use crate::paths::Paths;
use crate::speaker::Speaker;
use crate::wifi::{Network, WiFi};

const CODE_TTL: Duration = Duration::from_secs(5 * 60);

struct ActiveCode {
    code: String,
    expires_at: Instant,
}

/// What a freshly paired device needs to finish setup.
#[derive(Debug)]
pub struct PairResult {
    pub camera_public_key: [u8; 32],
    pub wifi_connected: bool,
    pub relay_domain: Option<String>,
    pub available_networks: Vec<Network>,
}

pub struct PairingService {
    config: Arc<ConfigStore>,
    registry: DeviceRegistry,
    wifi: Arc<WiFi>,
    speaker: Arc<Speaker>,
    paths: Paths,
    state: Mutex<Option<ActiveCode>>,
}

impl PairingService {
    pub fn new(
        config: Arc<ConfigStore>,
        registry: DeviceRegistry,
        wifi: Arc<WiFi>,
        speaker: Arc<Speaker>,
        paths: Paths,
    ) -> Self {
        Self {
            config,
            registry,
            wifi,
            speaker,
            paths,
            state: Mutex::new(None),
        }
    }

    /// Return the active pairing code, generating a fresh one when none is
    /// active or the current one expired. Speaks the code asynchronously.
    pub async fn get_code(&self) -> String {
        let mut state = self.state.lock().await;

        if let Some(active) = state.as_ref() {
            if Instant::now() < active.expires_at {
                self.speak(active.code.clone());
                return active.code.clone();
            }
        }

        let code = format!("{:06}", OsRng.gen_range(0..=999_999u32));
        *state = Some(ActiveCode {
            code: code.clone(),
            expires_at: Instant::now() + CODE_TTL,
        });
        info!("new pairing code generated");
        self.speak(code.clone());
        code
    }

    /// Commit a device that presented the spoken code.
    ///
    /// Creates and persists the camera keypair on the first successful
    /// pairing; the code is consumed on success and untouched on failure.
    pub async fn pair(
        &self,
        device_id: &str,
        device_name: &str,
        submitted_code: &str,
        device_public_key: &[u8],
    ) -> Result<PairResult> {
        let mut state = self.state.lock().await;

        let valid = state
            .as_ref()
            .is_some_and(|c| c.code == submitted_code && Instant::now() < c.expires_at);
        if !valid {
            return Err(Error::InvalidCode);
        }

        let device_public_key: [u8; 32] = device_public_key
            .try_into()
            .map_err(|_| Error::InvalidKey)?;

        let camera = self.ensure_camera_keypair().await?;

        self.registry
            .add(device_id, device_name, device_public_key)
            .await?;

        // The code authenticated exactly one pairing.
        *state = None;

        // Setup hints are best effort; pairing already succeeded.
        let wifi_connected = self.wifi.is_connected().await;
        let relay_domain = self.config.get_string(keys::RELAY_DOMAIN).await;
        let available_networks = match self.wifi.scan().await {
            Ok(networks) => networks,
            Err(e) => {
                warn!("network scan during pairing failed: {e}");
                Vec::new()
            }
        };

        Ok(PairResult {
            camera_public_key: camera.public_bytes(),
            wifi_connected,
            relay_domain,
            available_networks,
        })
    }

    /// Load the camera keypair, generating and persisting it if this is the
    /// first pairing.
    async fn ensure_camera_keypair(&self) -> Result<KeyPair> {
        if let Some(private) = self.config.get_bytes(keys::CAMERA_PRIVATE_KEY).await {
            return KeyPair::from_private_bytes(&private);
        }

        let keypair = KeyPair::generate();
        self.config
            .set(
                keys::CAMERA_PRIVATE_KEY,
                Value::String(B64.encode(keypair.private_bytes())),
            )
            .await?;
        self.config
            .set(
                keys::CAMERA_PUBLIC_KEY,
                Value::String(crypto::encode_public_key(&keypair.public_bytes())),
            )
            .await?;
        info!("camera keypair created");
        Ok(keypair)
    }

    /// Pronounce each digit of the code through the speaker, off-task.
    fn speak(&self, code: String) {
        let speaker = Arc::clone(&self.speaker);
        let sounds_dir = self.paths.assets_dir.join("sounds/numbers");
        tokio::spawn(async move {
            for digit in code.chars() {
                let sound = sounds_dir.join(format!("{digit}.mp3"));
                if let Err(e) = speaker.play_file(&sound).await {
                    warn!("failed to play sound for digit {digit}: {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn service(dir: &std::path::Path) -> PairingService {
        let paths = Paths::new(dir);
        let config = Arc::new(ConfigStore::load(&paths.config_file).unwrap());
        let registry = DeviceRegistry::new(Arc::clone(&config));
        PairingService::new(
            config,
            registry,
            Arc::new(WiFi::new()),
            Arc::new(Speaker::new()),
            paths,
        )
    }

    fn wrong_code(code: &str) -> String {
        let n: u32 = code.parse().unwrap();
        format!("{:06}", (n + 1) % 1_000_000)
    }

    #[tokio::test(start_paused = true)]
    async fn code_is_six_digits_and_stable_within_ttl() {
        let dir = tempdir().unwrap();
        let pairing = service(dir.path());

        let code = pairing.get_code().await;
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(pairing.get_code().await, code);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_code_is_replaced_and_rejected() {
        let dir = tempdir().unwrap();
        let pairing = service(dir.path());

        let code = pairing.get_code().await;
        tokio::time::advance(CODE_TTL + Duration::from_secs(1)).await;

        // The old code matches textually but is past expiry.
        let err = pairing
            .pair("dev-1", "Phone", &code, &[0x11; 32])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCode));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_pair_commits_device_and_consumes_code() {
        let dir = tempdir().unwrap();
        let pairing = service(dir.path());

        let code = pairing.get_code().await;
        let result = pairing
            .pair("dev-1", "Phone", &code, &[0x11; 32])
            .await
            .unwrap();

        assert_ne!(result.camera_public_key, [0u8; 32]);
        assert!(pairing.registry.get_by_id("dev-1").await.is_some());
        assert!(pairing
            .config
            .get_bytes(keys::CAMERA_PRIVATE_KEY)
            .await
            .is_some());

        // The code authenticated one pairing; replaying it must fail.
        let err = pairing
            .pair("dev-2", "Tablet", &code, &[0x22; 32])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCode));
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_code_leaves_state_untouched() {
        let dir = tempdir().unwrap();
        let pairing = service(dir.path());

        let code = pairing.get_code().await;
        let err = pairing
            .pair("dev-1", "Phone", &wrong_code(&code), &[0x11; 32])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCode));

        // The original code is still active and still works.
        assert_eq!(pairing.get_code().await, code);
        pairing
            .pair("dev-1", "Phone", &code, &[0x11; 32])
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_device_key_is_rejected() {
        let dir = tempdir().unwrap();
        let pairing = service(dir.path());

        let code = pairing.get_code().await;
        for bad_key in [vec![0x11; 31], vec![0x11; 33]] {
            let err = pairing
                .pair("dev-1", "Phone", &code, &bad_key)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidKey));
        }
        assert!(pairing.registry.get_by_id("dev-1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn camera_keypair_is_created_once() {
        let dir = tempdir().unwrap();
        let pairing = service(dir.path());

        let code = pairing.get_code().await;
        let first = pairing
            .pair("dev-1", "Phone", &code, &[0x11; 32])
            .await
            .unwrap();

        let code = pairing.get_code().await;
        let second = pairing
            .pair("dev-2", "Tablet", &code, &[0x22; 32])
            .await
            .unwrap();

        assert_eq!(first.camera_public_key, second.camera_public_key);
    }
}
