//! Filesystem layout under the writable data partition.
//!
//! Everything the firmware persists lives below one data root (`/data` on
//! the device, a tempdir in tests) so a factory reset is a single wipe.

use std::path::{Path, PathBuf};

/// Default data root on the device.
pub const DEFAULT_DATA_DIR: &str = "/data";

/// Resolved locations below a data root.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Writable data root (`/data`).
    pub data_dir: PathBuf,
    /// Persistent firmware state directory.
    pub firmware_data_dir: PathBuf,
    /// Config store file.
    pub config_file: PathBuf,
    /// Captured log ring file.
    pub logs_file: PathBuf,
    /// Recordings and thumbnails.
    pub recordings_dir: PathBuf,
    /// Event log JSON file.
    pub event_log_file: PathBuf,
    /// Extracted static assets (setup page, sound prompts).
    pub assets_dir: PathBuf,
    /// Staged firmware image during an update.
    pub update_image: PathBuf,
}

impl Paths {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let firmware_data_dir = data_dir.join(".firmware-data");
        let recordings_dir = data_dir.join("recordings");
        Self {
            config_file: firmware_data_dir.join("config.json"),
            logs_file: firmware_data_dir.join("logs.json"),
            update_image: firmware_data_dir.join("update.img"),
            event_log_file: recordings_dir.join("events.json"),
            assets_dir: data_dir.join("assets"),
            firmware_data_dir,
            recordings_dir,
            data_dir,
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR)
    }
}
