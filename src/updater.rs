//! A/B firmware updater.
//!
//! The camera trusts its configured relay domain over TLS for firmware
//! metadata and images. An update downloads to the data partition, is
//! `dd`-written to whichever root partition is not currently booted, and
//! the boot cmdline is switched to it; the boot watchdog reverts the switch
//! if the new image fails to come up.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::{keys, ConfigStore};
use crate::error::{Error, Result};
use crate::paths::Paths;

const FIRMWARE_ENDPOINT: &str = "/firmware/observer";
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const PARTITION_A: &str = "/dev/mmcblk0p2";
const PARTITION_B: &str = "/dev/mmcblk0p3";
const BOOT_CMDLINE: &str = "/boot/cmdline.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStatus {
    UpToDate,
    UpdateAvailable,
    Downloading,
    Installing,
    Error,
}

#[derive(Debug, Deserialize)]
struct FirmwareInfo {
    version: String,
    url: String,
}

#[derive(Debug)]
struct UpdaterState {
    status: UpdateStatus,
    available_version: Option<String>,
    download_url: Option<String>,
    error: Option<String>,
}

pub struct Updater {
    config: Arc<ConfigStore>,
    paths: Paths,
    http: reqwest::Client,
    state: RwLock<UpdaterState>,
}

impl Updater {
    pub fn new(config: Arc<ConfigStore>, paths: Paths) -> Self {
        Self {
            config,
            paths,
            http: reqwest::Client::new(),
            state: RwLock::new(UpdaterState {
                status: UpdateStatus::UpToDate,
                available_version: None,
                download_url: None,
                error: None,
            }),
        }
    }

    /// Current status, available version, and last error.
    pub async fn status(&self) -> (UpdateStatus, Option<String>, Option<String>) {
        let state = self.state.read().await;
        (
            state.status,
            state.available_version.clone(),
            state.error.clone(),
        )
    }

    /// Poll the relay for a newer firmware version.
    pub async fn check_for_updates(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state.status = UpdateStatus::UpToDate;
            state.error = None;
        }

        let Some(domain) = self.config.get_string(keys::RELAY_DOMAIN).await else {
            info!("skipping update check: relay domain not configured");
            return Ok(());
        };

        let url = format!("https://{domain}{FIRMWARE_ENDPOINT}");
        let response = match self.http.get(&url).timeout(CHECK_TIMEOUT).send().await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(format!("failed to check for updates: {e}")).await),
        };

        if !response.status().is_success() {
            let status = response.status();
            return Err(self.fail(format!("server returned status {status}")).await);
        }

        let info: FirmwareInfo = match response.json().await {
            Ok(info) => info,
            Err(e) => return Err(self.fail(format!("failed to parse response: {e}")).await),
        };

        if info.version != crate::FIRMWARE_VERSION {
            let mut state = self.state.write().await;
            state.status = UpdateStatus::UpdateAvailable;
            state.available_version = Some(info.version);
            state.download_url = Some(info.url);
        }
        Ok(())
    }

    /// Download and install the advertised update, then reboot.
    pub async fn start_update(&self) -> Result<()> {
        let url = {
            let mut state = self.state.write().await;
            if state.status != UpdateStatus::UpdateAvailable {
                return Err(Error::Subsystem("no update available".into()));
            }
            state.status = UpdateStatus::Downloading;
            state.download_url.clone().expect("url set with status")
        };

        if let Err(e) = self.download(&url).await {
            return Err(self.fail(format!("download failed: {e}")).await);
        }

        self.state.write().await.status = UpdateStatus::Installing;

        if let Err(e) = self.flash().await {
            let _ = std::fs::remove_file(&self.paths.update_image);
            return Err(self.fail(format!("installation failed: {e}")).await);
        }

        let _ = std::fs::remove_file(&self.paths.update_image);
        info!("firmware installed, rebooting");

        tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let _ = Command::new("sudo").arg("reboot").status().await;
        });

        Ok(())
    }

    async fn download(&self, url: &str) -> Result<()> {
        let response = self
            .http
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(Error::subsystem)?;

        if !response.status().is_success() {
            return Err(Error::Subsystem(format!(
                "download failed with status {}",
                response.status()
            )));
        }

        let image = response.bytes().await.map_err(Error::subsystem)?;
        std::fs::write(&self.paths.update_image, &image)?;
        Ok(())
    }

    async fn flash(&self) -> Result<()> {
        let cmdline = std::fs::read_to_string("/proc/cmdline")?;
        let active = parse_root_partition(&cmdline)
            .ok_or_else(|| Error::Subsystem("could not detect root partition".into()))?;

        if active != PARTITION_A && active != PARTITION_B {
            return Err(Error::Subsystem(format!(
                "active partition {active} is not one of configured partitions ({PARTITION_A}, {PARTITION_B})"
            )));
        }
        let inactive = if active == PARTITION_A {
            PARTITION_B
        } else {
            PARTITION_A
        };

        info!(active = %active, inactive, "flashing firmware image");
        let output = Command::new("sudo")
            .arg("dd")
            .arg(format!("if={}", self.paths.update_image.display()))
            .arg(format!("of={inactive}"))
            .args(["bs=4M", "conv=fsync"])
            .output()
            .await
            .map_err(Error::subsystem)?;

        if !output.status.success() {
            return Err(Error::Subsystem(format!(
                "flash failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let boot_config = std::fs::read_to_string(BOOT_CMDLINE)?;
        std::fs::write(BOOT_CMDLINE, switch_root_cmdline(&boot_config, inactive))?;
        info!(partition = inactive, "boot partition switched");
        Ok(())
    }

    async fn fail(&self, msg: String) -> Error {
        error!("{msg}");
        let mut state = self.state.write().await;
        state.status = UpdateStatus::Error;
        state.error = Some(msg.clone());
        Error::Subsystem(msg)
    }
}

static ROOT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"root=(/dev/\S+)").unwrap());

fn parse_root_partition(cmdline: &str) -> Option<String> {
    ROOT_RE
        .captures(cmdline)
        .map(|caps| caps[1].to_string())
}

fn switch_root_cmdline(cmdline: &str, new_root: &str) -> String {
    ROOT_RE
        .replace(cmdline, format!("root={new_root}"))
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn root_partition_parses_from_cmdline() {
        let cmdline = "console=serial0,115200 root=/dev/mmcblk0p2 rootfstype=ext4 rw";
        assert_eq!(
            parse_root_partition(cmdline),
            Some("/dev/mmcblk0p2".to_string())
        );
        assert_eq!(parse_root_partition("console=tty1 rw"), None);
    }

    #[test]
    fn cmdline_root_switch_preserves_rest() {
        let cmdline = "console=tty1 root=/dev/mmcblk0p2 rootwait quiet";
        assert_eq!(
            switch_root_cmdline(cmdline, "/dev/mmcblk0p3"),
            "console=tty1 root=/dev/mmcblk0p3 rootwait quiet"
        );
    }

    #[tokio::test]
    async fn update_without_availability_is_rejected() {
        let dir = tempdir().unwrap();
        let config = Arc::new(ConfigStore::load(dir.path().join("config.json")).unwrap());
        let updater = Updater::new(config, Paths::new(dir.path()));

        assert!(updater.start_update().await.is_err());
        let (status, _, _) = updater.status().await;
        assert_eq!(status, UpdateStatus::UpToDate);
    }

    #[tokio::test]
    async fn check_without_relay_domain_is_a_noop() {
        let dir = tempdir().unwrap();
        let config = Arc::new(ConfigStore::load(dir.path().join("config.json")).unwrap());
        let updater = Updater::new(config, Paths::new(dir.path()));

        updater.check_for_updates().await.unwrap();
        let (status, version, error) = updater.status().await;
        assert_eq!(status, UpdateStatus::UpToDate);
        assert_eq!(version, None);
        assert_eq!(error, None);
    }
}
