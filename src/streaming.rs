//! Live-stream viewer fan-out.
//!
//! A single capture pipeline feeds every watching device. Viewers are
//! reference-counted: the first `startStream` boots the pipeline, the last
//! `stopStream` (or transport loss) shuts it down. Chunks are broadcast to
//! all viewers on the reader task's own write path; with the small viewer
//! bound, a slow viewer slowing the rest is an accepted trade against
//! per-viewer queues. A failed send to one viewer never aborts the others.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::router::{self, HandlerCtx};
use crate::services::Services;

pub const MAX_VIEWERS: usize = 3;
const CHUNK_SIZE: usize = 64 * 1024;

pub const VIDEO_CHUNK_TYPE: &str = "streamVideoChunkResult";
pub const AUDIO_CHUNK_TYPE: &str = "streamAudioChunkResult";

/// The bounded set of devices currently watching the live stream.
pub struct Viewers {
    inner: Mutex<HashMap<String, HandlerCtx>>,
}

impl Viewers {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a viewer. Returns whether it was the first (and the capture
    /// pipeline therefore needs starting), or `ViewerLimit` when full.
    pub async fn add(&self, ctx: HandlerCtx) -> Result<bool> {
        let mut viewers = self.inner.lock().await;
        if viewers.len() >= MAX_VIEWERS {
            return Err(Error::ViewerLimit {
                current: viewers.len(),
                max: MAX_VIEWERS,
            });
        }
        let first = viewers.is_empty();
        viewers.insert(ctx.device_id.clone(), ctx);
        Ok(first)
    }

    /// Drop a viewer. Returns true when the set is now empty and the
    /// pipeline should stop.
    pub async fn remove(&self, device_id: &str) -> bool {
        let mut viewers = self.inner.lock().await;
        viewers.remove(device_id);
        viewers.is_empty()
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Remove every viewer, returning how many there were. Used on
    /// transport loss, when no viewer can receive chunks anymore.
    pub async fn drain(&self) -> usize {
        let mut viewers = self.inner.lock().await;
        let count = viewers.len();
        viewers.clear();
        count
    }

    async fn snapshot(&self) -> Vec<HandlerCtx> {
        self.inner.lock().await.values().cloned().collect()
    }
}

impl Default for Viewers {
    fn default() -> Self {
        Self::new()
    }
}

/// Register a viewer and, when it is the first, start the capture pipeline
/// and its reader tasks.
pub async fn start_stream(services: &Arc<Services>, ctx: &HandlerCtx) -> Result<()> {
    let first = services.viewers.add(ctx.clone()).await?;
    if !first {
        return Ok(());
    }

    let output = match services.recorder.start_stream().await {
        Ok(output) => output,
        Err(e) => {
            services.viewers.remove(&ctx.device_id).await;
            return Err(e);
        }
    };

    info!("capture pipeline started for live stream");

    let video_services = Arc::clone(services);
    tokio::spawn(async move {
        stream_reader(video_services, output.video, VIDEO_CHUNK_TYPE).await;
    });

    if let Some(audio) = output.audio {
        let audio_services = Arc::clone(services);
        tokio::spawn(async move {
            stream_reader(audio_services, audio, AUDIO_CHUNK_TYPE).await;
        });
    }

    Ok(())
}

/// Drop a viewer; stops the capture pipeline when it was the last.
pub async fn stop_stream(services: &Services, device_id: &str) {
    if services.viewers.remove(device_id).await {
        services.recorder.stop_stream().await;
        info!("last viewer left, capture pipeline stopped");
    }
}

/// Pump one capture byte stream to all viewers in 64 KiB chunks.
///
/// The chunk counter restarts with the pipeline. EOF broadcasts a final
/// `{done:true}`; a read error broadcasts the failure and exits.
pub async fn stream_reader<R>(services: Arc<Services>, mut reader: R, msg_type: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut chunk_index: u64 = 0;

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                broadcast_chunk(&services, msg_type, done_frame()).await;
                break;
            }
            Ok(n) => {
                broadcast_chunk(&services, msg_type, chunk_frame(&buffer[..n], chunk_index))
                    .await;
                chunk_index += 1;
            }
            Err(e) => {
                broadcast_chunk(&services, msg_type, error_frame(&e.to_string())).await;
                break;
            }
        }
    }
    debug!(msg_type, "stream reader exited");
}

/// Send a chunk frame to every current viewer. Per-viewer failures are
/// logged and skipped.
pub async fn broadcast_chunk(services: &Services, msg_type: &str, payload: Value) {
    for ctx in services.viewers.snapshot().await {
        if let Err(e) = router::send_encrypted(services, &ctx, msg_type, payload.clone()).await {
            debug!(device_id = %ctx.device_id, "chunk broadcast failed: {e}");
        }
    }
}

fn chunk_frame(data: &[u8], chunk_index: u64) -> Value {
    json!({
        "success": true,
        "chunk": B64.encode(data),
        "chunkIndex": chunk_index,
        "done": false,
    })
}

fn done_frame() -> Value {
    json!({ "success": true, "done": true })
}

fn error_frame(error: &str) -> Value {
    json!({ "success": false, "error": error, "done": true })
}
