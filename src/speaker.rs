//! Speaker output via ALSA.
//!
//! Plays prompt files (pairing-code digits) through `aplay` and supports a
//! raw PCM stream sink for two-way audio. One playback at a time; the mutex
//! also serializes prompt playback so spoken digits never overlap.

use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

const ALSA_DEVICE: &str = "plughw:0,0";

#[derive(Default)]
struct StreamState {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

pub struct Speaker {
    state: Mutex<StreamState>,
}

impl Speaker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StreamState::default()),
        }
    }

    /// Play an audio file to completion.
    pub async fn play_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Subsystem(format!(
                "audio file not found: {}",
                path.display()
            )));
        }

        let _guard = self.state.lock().await;
        let status = Command::new("aplay")
            .args(["-D", ALSA_DEVICE])
            .arg(path)
            .status()
            .await
            .map_err(|e| Error::Subsystem(format!("failed to play audio: {e}")))?;

        if !status.success() {
            return Err(Error::Subsystem("failed to play audio".into()));
        }
        Ok(())
    }

    /// Start a live PCM sink (16-bit LE, 44.1 kHz, mono).
    pub async fn start_stream(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.child.is_some() {
            return Err(Error::Subsystem("already streaming".into()));
        }

        let mut child = Command::new("aplay")
            .args(["-D", ALSA_DEVICE, "-f", "S16_LE", "-r", "44100", "-c", "1"])
            .stdin(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| Error::Subsystem(format!("failed to start streaming: {e}")))?;

        state.stdin = child.stdin.take();
        state.child = Some(child);
        Ok(())
    }

    /// Write PCM samples into the live sink.
    pub async fn write_audio_chunk(&self, chunk: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        let stdin = state
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Subsystem("stream closed".into()))?;
        stdin
            .write_all(chunk)
            .await
            .map_err(|e| Error::Subsystem(format!("stream write failed: {e}")))?;
        Ok(())
    }

    /// Stop the live sink, if running.
    pub async fn stop_stream(&self) {
        let mut state = self.state.lock().await;
        state.stdin = None;
        if let Some(mut child) = state.child.take() {
            let _ = child.kill().await;
        }
    }
}

impl Default for Speaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn play_missing_file_is_an_error() {
        let speaker = Speaker::new();
        let result = speaker.play_file("/nonexistent/ding.mp3").await;
        assert!(matches!(result, Err(Error::Subsystem(_))));
    }

    #[tokio::test]
    async fn write_without_stream_is_an_error() {
        let speaker = Speaker::new();
        assert!(speaker.write_audio_chunk(&[0u8; 4]).await.is_err());
    }
}
