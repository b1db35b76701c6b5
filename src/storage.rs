//! Recording storage and event log.
//!
//! Recordings are uuid-named MP4s with a JPEG thumbnail next to them; the
//! event log is a single JSON file listing them with timestamps and the
//! trigger type. Saving a recording frees disk space first by deleting the
//! oldest recordings until 3 GiB of headroom remains.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::paths::Paths;

/// Free space to keep available on the data partition.
const MIN_FREE_SPACE: u64 = 3 * 1024 * 1024 * 1024;
/// Upper bound on deletions per save, against a wedged filesystem.
const MAX_CLEANUP_ITERATIONS: u32 = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Recording length in seconds.
    pub duration: f64,
    pub event_type: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EventLog {
    events: Vec<Event>,
}

pub struct Storage {
    paths: Paths,
    mu: Mutex<()>,
}

impl Storage {
    /// Bootstrap the recordings directory and event log.
    pub fn init(paths: Paths) -> Result<Self> {
        fs::create_dir_all(&paths.recordings_dir)?;

        if !paths.event_log_file.exists() {
            let empty = serde_json::to_vec(&EventLog::default())?;
            fs::write(&paths.event_log_file, empty)?;
        }

        Ok(Self {
            paths,
            mu: Mutex::new(()),
        })
    }

    /// Move a finished recording into storage, generate its thumbnail, and
    /// log the event. Returns the recording ID.
    pub async fn save_recording(
        &self,
        file_path: impl Into<PathBuf>,
        duration: f64,
        event_type: &str,
    ) -> Result<String> {
        let file_path = file_path.into();
        let _guard = self.mu.lock().await;

        let size = fs::metadata(&file_path)?.len();
        self.cleanup_for(size)?;

        let id = Uuid::new_v4().to_string();
        let final_path = self.recording_path(&id);
        fs::rename(&file_path, &final_path)?;

        // Thumbnails are best effort; the recording itself already landed.
        if let Err(e) = self
            .generate_thumbnail(&final_path, &self.thumbnail_path(&id))
            .await
        {
            warn!(id = %id, "thumbnail generation failed: {e}");
        }

        let mut log = self.read_event_log()?;
        log.events.push(Event {
            id: id.clone(),
            timestamp: Utc::now(),
            duration,
            event_type: event_type.to_string(),
        });
        self.write_event_log(&log)?;

        info!(id = %id, event_type, "recording saved");
        Ok(id)
    }

    /// All events, newest first.
    pub async fn get_event_log(&self) -> Result<Vec<Event>> {
        let _guard = self.mu.lock().await;
        let mut events = self.read_event_log()?.events;
        events.reverse();
        Ok(events)
    }

    pub fn get_recording_path(&self, id: &str) -> Result<PathBuf> {
        let path = self.recording_path(id);
        if !path.exists() {
            return Err(Error::NotFound(format!("recording {id}")));
        }
        Ok(path)
    }

    pub fn get_thumbnail_path(&self, id: &str) -> Result<PathBuf> {
        let path = self.thumbnail_path(id);
        if !path.exists() {
            return Err(Error::NotFound(format!("thumbnail {id}")));
        }
        Ok(path)
    }

    fn recording_path(&self, id: &str) -> PathBuf {
        self.paths.recordings_dir.join(format!("{id}.mp4"))
    }

    fn thumbnail_path(&self, id: &str) -> PathBuf {
        self.paths.recordings_dir.join(format!("{id}.jpg"))
    }

    fn read_event_log(&self) -> Result<EventLog> {
        let raw = fs::read(&self.paths.event_log_file)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn write_event_log(&self, log: &EventLog) -> Result<()> {
        fs::write(&self.paths.event_log_file, serde_json::to_vec_pretty(log)?)?;
        Ok(())
    }

    /// Delete oldest recordings until the incoming file plus headroom fit.
    fn cleanup_for(&self, incoming_size: u64) -> Result<()> {
        let needed = incoming_size + MIN_FREE_SPACE;

        for _ in 0..MAX_CLEANUP_ITERATIONS {
            if free_space(&self.paths.recordings_dir)? >= needed {
                return Ok(());
            }

            let mut log = self.read_event_log()?;
            if log.events.is_empty() {
                return Err(Error::Subsystem(
                    "insufficient space and no recordings to delete".into(),
                ));
            }

            let oldest = log.events.remove(0);
            for path in [
                self.recording_path(&oldest.id),
                self.thumbnail_path(&oldest.id),
            ] {
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(id = %oldest.id, "failed to delete {}: {e}", path.display());
                    }
                }
            }
            self.write_event_log(&log)?;
            info!(id = %oldest.id, "deleted oldest recording to free space");
        }

        Err(Error::Subsystem(format!(
            "failed to free enough space after {MAX_CLEANUP_ITERATIONS} deletions"
        )))
    }

    async fn generate_thumbnail(&self, video: &PathBuf, thumbnail: &PathBuf) -> Result<()> {
        let status = Command::new("ffmpeg")
            .arg("-i")
            .arg(video)
            .args(["-vframes", "1", "-f", "image2", "-q:v", "2", "-y"])
            .arg(thumbnail)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Subsystem(e.to_string()))?;

        if !status.success() {
            return Err(Error::Subsystem("ffmpeg thumbnail extraction failed".into()));
        }
        Ok(())
    }
}

/// Available bytes on the filesystem containing `path`.
#[cfg(unix)]
fn free_space(path: &std::path::Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Subsystem("invalid path".into()))?;
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
}

#[cfg(not(unix))]
fn free_space(_path: &std::path::Path) -> Result<u64> {
    Ok(u64::MAX)
}
