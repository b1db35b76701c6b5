//! WiFi management via the wireless-tools / wpa_supplicant stack.
//!
//! Scanning shells out to `iwlist`, credentials go through `wpa_passphrase`
//! (password over stdin, never argv), and a connect only counts as
//! successful once the link has verified internet reachability.

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

const WPA_SUPPLICANT_CONF: &str = "/etc/wpa_supplicant/wpa_supplicant.conf";
const CONNECT_ATTEMPTS: u32 = 15;

/// A network visible in a scan.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Network {
    pub ssid: String,
    /// Signal quality, 0-100.
    pub signal: u32,
    pub secured: bool,
}

pub struct WiFi {
    interface: String,
    mu: Mutex<()>,
}

impl WiFi {
    pub fn new() -> Self {
        Self {
            interface: "wlan0".to_string(),
            mu: Mutex::new(()),
        }
    }

    /// Scan for visible networks.
    pub async fn scan(&self) -> Result<Vec<Network>> {
        let _guard = self.mu.lock().await;

        // First scan triggers the radio; the second returns populated results.
        let _ = Command::new("sudo")
            .args(["iwlist", &self.interface, "scan"])
            .stdin(Stdio::null())
            .output()
            .await;

        let output = Command::new("sudo")
            .args(["iwlist", &self.interface, "scan"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Subsystem(format!("scan failed: {e}")))?;

        if !output.status.success() {
            return Err(Error::Subsystem("scan failed".into()));
        }

        Ok(parse_networks(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Connect to a network and verify internet reachability.
    ///
    /// An empty password means an open network. Returns only once a ping
    /// through the new link succeeds, or fails after 15 attempts.
    pub async fn connect(&self, ssid: &str, password: &str) -> Result<()> {
        let _guard = self.mu.lock().await;

        let escaped_ssid = ssid.replace('\\', "\\\\").replace('"', "\\\"");

        let network_block = if password.is_empty() {
            format!("network={{\n\tssid=\"{escaped_ssid}\"\n\tkey_mgmt=NONE\n}}\n").into_bytes()
        } else {
            let mut child = Command::new("wpa_passphrase")
                .arg(&escaped_ssid)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| Error::Subsystem(format!("failed to generate config: {e}")))?;
            child
                .stdin
                .take()
                .expect("stdin piped")
                .write_all(password.as_bytes())
                .await
                .map_err(|e| Error::Subsystem(format!("failed to generate config: {e}")))?;
            let output = child
                .wait_with_output()
                .await
                .map_err(|e| Error::Subsystem(format!("failed to generate config: {e}")))?;
            if !output.status.success() {
                return Err(Error::Subsystem("failed to generate config".into()));
            }
            output.stdout
        };

        // Append via tee so the credentials file stays root-owned.
        let mut tee = Command::new("sudo")
            .args(["tee", "-a", WPA_SUPPLICANT_CONF])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| Error::Subsystem(format!("failed to save config: {e}")))?;
        tee.stdin
            .take()
            .expect("stdin piped")
            .write_all(&network_block)
            .await
            .map_err(|e| Error::Subsystem(format!("failed to save config: {e}")))?;
        let status = tee
            .wait()
            .await
            .map_err(|e| Error::Subsystem(format!("failed to save config: {e}")))?;
        if !status.success() {
            return Err(Error::Subsystem("failed to save config".into()));
        }

        let reconfigure = Command::new("wpa_cli")
            .args(["-i", &self.interface, "reconfigure"])
            .output()
            .await
            .map_err(|e| Error::Subsystem(format!("failed to reconfigure: {e}")))?;
        if !reconfigure.status.success() {
            return Err(Error::Subsystem("failed to reconfigure".into()));
        }

        for attempt in 0..CONNECT_ATTEMPTS {
            tokio::time::sleep(Duration::from_secs(1)).await;

            if self.current_ssid_inner().await.is_none() {
                continue;
            }

            let ping = Command::new("ping")
                .args(["-c", "1", "-W", "2", "8.8.8.8"])
                .output()
                .await;
            if matches!(ping, Ok(out) if out.status.success()) {
                debug!(ssid, attempt, "wifi connected with internet access");
                return Ok(());
            }
        }

        Err(Error::Subsystem(
            "failed to establish internet connection".into(),
        ))
    }

    pub async fn is_connected(&self) -> bool {
        self.current_ssid_inner().await.is_some()
    }

    /// SSID of the currently associated network, if any.
    pub async fn current_ssid(&self) -> Option<String> {
        self.current_ssid_inner().await
    }

    async fn current_ssid_inner(&self) -> Option<String> {
        let output = Command::new("iwgetid").arg("-r").output().await.ok()?;
        let ssid = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!ssid.is_empty()).then_some(ssid)
    }
}

impl Default for WiFi {
    fn default() -> Self {
        Self::new()
    }
}

static SSID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"ESSID:"([^"]+)""#).unwrap());
static QUALITY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Quality=(\d+)/(\d+)").unwrap());
static ENCRYPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Encryption key:(on|off)").unwrap());

fn parse_networks(output: &str) -> Vec<Network> {
    let mut networks = Vec::new();

    for cell in output.split("Cell ").skip(1) {
        let Some(ssid) = SSID_RE.captures(cell).map(|c| c[1].to_string()) else {
            continue;
        };

        let signal = QUALITY_RE
            .captures(cell)
            .and_then(|c| {
                let quality: u32 = c[1].parse().ok()?;
                let max: u32 = c[2].parse().ok()?;
                (max > 0).then(|| quality * 100 / max)
            })
            .unwrap_or(0);

        let secured = ENCRYPTION_RE
            .captures(cell)
            .is_some_and(|c| &c[1] == "on");

        networks.push(Network {
            ssid,
            signal,
            secured,
        });
    }

    networks
}
