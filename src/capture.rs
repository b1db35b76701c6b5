//! Capture pipeline: recording, live streaming, and previews via ffmpeg.
//!
//! The camera sensor admits a single consumer, so recording and streaming
//! are mutually exclusive and a stream start preempts an active recording.
//! The microphone flag is read from config at pipeline start; toggling it
//! takes effect on the next start.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{keys, ConfigStore};
use crate::error::{Error, Result};

const VIDEO_DEVICE: &str = "/dev/video0";

/// Byte streams produced by a live capture.
pub struct StreamOutput {
    /// Raw H.264 elementary stream.
    pub video: ChildStdout,
    /// AAC/ADTS stream; `None` when the microphone is disabled.
    pub audio: Option<ChildStdout>,
}

#[derive(Default)]
struct RecorderState {
    recording: Option<Child>,
    stream_video: Option<Child>,
    stream_audio: Option<Child>,
}

pub struct Recorder {
    config: Arc<ConfigStore>,
    state: Mutex<RecorderState>,
}

impl Recorder {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            state: Mutex::new(RecorderState::default()),
        }
    }

    async fn mic_enabled(&self) -> bool {
        self.config
            .get_bool(keys::MICROPHONE_ENABLED)
            .await
            .unwrap_or(true)
    }

    /// True while the sensor is in use by a recording or a live stream.
    pub async fn is_busy(&self) -> bool {
        let state = self.state.lock().await;
        state.recording.is_some() || state.stream_video.is_some()
    }

    /// Record video (and audio when the mic is enabled) to a file.
    pub async fn start_recording(&self, output_path: impl AsRef<Path>) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.recording.is_some() {
            return Err(Error::Subsystem("already recording".into()));
        }
        if state.stream_video.is_some() {
            return Err(Error::Subsystem("camera in use (streaming)".into()));
        }

        let output = output_path.as_ref().to_string_lossy().to_string();
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-f", "v4l2", "-i", VIDEO_DEVICE]);
        if self.mic_enabled().await {
            cmd.args(["-f", "alsa", "-i", "default"]);
            cmd.args(["-c:v", "h264_v4l2m2m", "-c:a", "aac"]);
        } else {
            cmd.args(["-c:v", "h264_v4l2m2m"]);
        }
        cmd.args(["-y", &output]);
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

        let child = cmd
            .spawn()
            .map_err(|e| Error::Subsystem(format!("failed to start recording: {e}")))?;
        state.recording = Some(child);
        Ok(())
    }

    pub async fn stop_recording(&self) {
        let mut state = self.state.lock().await;
        kill(&mut state.recording).await;
    }

    /// Start a live stream, preempting any active recording.
    pub async fn start_stream(&self) -> Result<StreamOutput> {
        let mut state = self.state.lock().await;

        if state.stream_video.is_some() {
            return Err(Error::Subsystem("already streaming".into()));
        }

        if state.recording.is_some() {
            warn!("stopping active recording to give the live stream priority");
            kill(&mut state.recording).await;
        }

        let mut video_child = Command::new("ffmpeg")
            .args(["-f", "v4l2", "-i", VIDEO_DEVICE])
            .args(["-c:v", "h264_v4l2m2m", "-f", "h264", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Subsystem(format!("failed to start video stream: {e}")))?;
        let video = video_child
            .stdout
            .take()
            .ok_or_else(|| Error::Subsystem("failed to create video pipe".into()))?;

        let audio = if self.mic_enabled().await {
            let audio_child = Command::new("ffmpeg")
                .args(["-f", "alsa", "-i", "default"])
                .args(["-c:a", "aac", "-f", "adts", "pipe:1"])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| {
                    Error::Subsystem(format!("failed to start audio stream: {e}"))
                });

            match audio_child {
                Ok(mut child) => {
                    let stdout = child.stdout.take();
                    state.stream_audio = Some(child);
                    stdout
                }
                Err(e) => {
                    let _ = video_child.start_kill();
                    return Err(e);
                }
            }
        } else {
            None
        };

        state.stream_video = Some(video_child);
        debug!("live stream pipeline started");
        Ok(StreamOutput { video, audio })
    }

    /// Stop the live stream; readers on the pipes observe EOF.
    pub async fn stop_stream(&self) {
        let mut state = self.state.lock().await;
        kill(&mut state.stream_video).await;
        kill(&mut state.stream_audio).await;
    }

    /// Capture a single JPEG frame.
    pub async fn capture_preview(&self) -> Result<Vec<u8>> {
        let output = Command::new("ffmpeg")
            .args(["-f", "v4l2", "-i", VIDEO_DEVICE])
            .args(["-frames:v", "1", "-f", "image2pipe", "-c:v", "mjpeg", "pipe:1"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Subsystem(format!("preview capture failed: {e}")))?;

        if !output.status.success() || output.stdout.is_empty() {
            return Err(Error::Subsystem("preview capture failed".into()));
        }
        Ok(output.stdout)
    }

    /// Persist the microphone flag; consumed at the next pipeline start.
    pub async fn set_microphone_enabled(&self, enabled: bool) -> Result<()> {
        self.config
            .set(keys::MICROPHONE_ENABLED, serde_json::Value::Bool(enabled))
            .await
    }
}

async fn kill(slot: &mut Option<Child>) {
    if let Some(mut child) = slot.take() {
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn recorder(dir: &std::path::Path) -> Recorder {
        let config = Arc::new(ConfigStore::load(dir.join("config.json")).unwrap());
        Recorder::new(config)
    }

    #[tokio::test]
    async fn microphone_defaults_on_and_persists() {
        let dir = tempdir().unwrap();
        let rec = recorder(dir.path());

        assert!(rec.mic_enabled().await);
        rec.set_microphone_enabled(false).await.unwrap();
        assert!(!rec.mic_enabled().await);
    }

    #[tokio::test]
    async fn idle_recorder_is_not_busy() {
        let dir = tempdir().unwrap();
        let rec = recorder(dir.path());
        assert!(!rec.is_busy().await);
        rec.stop_stream().await;
        rec.stop_recording().await;
    }
}
