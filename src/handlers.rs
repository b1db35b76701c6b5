//! Command handlers for the encrypted control plane.
//!
//! Each handler is a thin adapter: parse the decrypted request, call the
//! subsystem, seal the `{type}Result` reply. Registration happens once at
//! startup; the relay dispatches by message type afterwards.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::keys;
use crate::error::{Error, Result};
use crate::router::{parse_request, route, send_encrypted, HandlerCtx};
use crate::services::Services;
use crate::{health, streaming};

/// Wire up every command handler on the relay client.
pub fn register_handlers(services: &Arc<Services>) {
    // Device management
    route(services, "getDevices", get_devices);
    route(services, "removeDevice", remove_device);
    route(services, "kickDevice", kick_device);

    // WiFi
    route(services, "wifiScan", wifi_scan);
    route(services, "wifiConnect", wifi_connect);

    // Storage
    route(services, "getEvents", get_events);
    route(services, "getRecording", get_recording);
    route(services, "getThumbnail", get_thumbnail);

    // Streaming
    route(services, "startStream", start_stream);
    route(services, "stopStream", stop_stream);

    // Settings
    route(services, "setMicrophone", set_microphone);
    route(services, "setRecordingSound", set_recording_sound);

    // System
    route(services, "getHealth", get_health);
    route(services, "getPreview", get_preview);
    route(services, "startUpdate", start_update);
    route(services, "restart", restart);
    route(services, "reset", reset);

    // Viewers live only as long as the transport that feeds them.
    let on_drop = Arc::clone(services);
    services.relay.on_disconnect(move || {
        let services = Arc::clone(&on_drop);
        async move {
            if services.viewers.drain().await > 0 {
                services.recorder.stop_stream().await;
                info!("relay link lost, live stream torn down");
            }
        }
    });
}

async fn get_devices(services: Arc<Services>, ctx: HandlerCtx, _payload: Value) -> Result<()> {
    let devices = services.registry.get_all().await;
    send_encrypted(
        &services,
        &ctx,
        "getDevicesResult",
        json!({ "success": true, "devices": devices }),
    )
    .await
}

/// A device may only remove itself; kicking others goes through `kickDevice`.
async fn remove_device(services: Arc<Services>, ctx: HandlerCtx, _payload: Value) -> Result<()> {
    services.registry.remove(&ctx.device_id).await?;
    send_encrypted(
        &services,
        &ctx,
        "removeDeviceResult",
        json!({ "success": true }),
    )
    .await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KickDeviceRequest {
    target_device_id: String,
}

async fn kick_device(services: Arc<Services>, ctx: HandlerCtx, payload: Value) -> Result<()> {
    let req: KickDeviceRequest = parse_request(&payload)?;

    if req.target_device_id == ctx.device_id {
        return Err(Error::Subsystem("cannot kick self".into()));
    }

    services.registry.schedule_kick(&req.target_device_id).await;
    send_encrypted(
        &services,
        &ctx,
        "kickDeviceResult",
        json!({ "success": true }),
    )
    .await
}

async fn wifi_scan(services: Arc<Services>, ctx: HandlerCtx, _payload: Value) -> Result<()> {
    let networks = services.wifi.scan().await?;
    send_encrypted(
        &services,
        &ctx,
        "wifiScanResult",
        json!({ "success": true, "networks": networks }),
    )
    .await
}

#[derive(Deserialize)]
struct WifiConnectRequest {
    ssid: String,
    #[serde(default)]
    password: String,
}

async fn wifi_connect(services: Arc<Services>, ctx: HandlerCtx, payload: Value) -> Result<()> {
    let req: WifiConnectRequest = parse_request(&payload)?;
    services.wifi.connect(&req.ssid, &req.password).await?;
    send_encrypted(
        &services,
        &ctx,
        "wifiConnectResult",
        json!({ "success": true }),
    )
    .await
}

async fn get_events(services: Arc<Services>, ctx: HandlerCtx, _payload: Value) -> Result<()> {
    let events = services.storage.get_event_log().await?;
    send_encrypted(
        &services,
        &ctx,
        "getEventsResult",
        json!({ "success": true, "events": events }),
    )
    .await
}

#[derive(Deserialize)]
struct FileRequest {
    id: String,
}

/// Recordings are ~10 s clips, so an in-memory base64 transfer is fine.
async fn get_recording(services: Arc<Services>, ctx: HandlerCtx, payload: Value) -> Result<()> {
    let req: FileRequest = parse_request(&payload)?;
    let path = services.storage.get_recording_path(&req.id)?;
    let data = tokio::fs::read(path).await?;
    send_encrypted(
        &services,
        &ctx,
        "getRecordingResult",
        json!({ "success": true, "data": B64.encode(data) }),
    )
    .await
}

async fn get_thumbnail(services: Arc<Services>, ctx: HandlerCtx, payload: Value) -> Result<()> {
    let req: FileRequest = parse_request(&payload)?;
    let path = services.storage.get_thumbnail_path(&req.id)?;
    let data = tokio::fs::read(path).await?;
    send_encrypted(
        &services,
        &ctx,
        "getThumbnailResult",
        json!({ "success": true, "data": B64.encode(data) }),
    )
    .await
}

async fn start_stream(services: Arc<Services>, ctx: HandlerCtx, _payload: Value) -> Result<()> {
    streaming::start_stream(&services, &ctx).await?;
    send_encrypted(
        &services,
        &ctx,
        "startStreamResult",
        json!({ "success": true }),
    )
    .await
}

async fn stop_stream(services: Arc<Services>, ctx: HandlerCtx, _payload: Value) -> Result<()> {
    streaming::stop_stream(&services, &ctx.device_id).await;
    send_encrypted(
        &services,
        &ctx,
        "stopStreamResult",
        json!({ "success": true }),
    )
    .await
}

#[derive(Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

async fn set_microphone(services: Arc<Services>, ctx: HandlerCtx, payload: Value) -> Result<()> {
    let req: ToggleRequest = parse_request(&payload)?;
    services.recorder.set_microphone_enabled(req.enabled).await?;
    send_encrypted(
        &services,
        &ctx,
        "setMicrophoneResult",
        json!({ "success": true, "enabled": req.enabled }),
    )
    .await
}

async fn set_recording_sound(
    services: Arc<Services>,
    ctx: HandlerCtx,
    payload: Value,
) -> Result<()> {
    let req: ToggleRequest = parse_request(&payload)?;
    services
        .config
        .set(keys::PLAY_ACTIVE_CAMERA_SOUND, Value::Bool(req.enabled))
        .await?;
    send_encrypted(
        &services,
        &ctx,
        "setRecordingSoundResult",
        json!({ "success": true, "enabled": req.enabled }),
    )
    .await
}

async fn get_health(services: Arc<Services>, ctx: HandlerCtx, _payload: Value) -> Result<()> {
    let (update_status, available_version, update_error) = services.updater.status().await;
    let mut update = json!({ "status": update_status });
    if let Some(version) = available_version {
        update["availableVersion"] = json!(version);
    }
    if let Some(error) = update_error {
        update["error"] = json!(error);
    }

    let performance = health::snapshot(&services.paths.data_dir).await;

    let health = json!({
        "success": true,
        "battery": {
            "percent": services.ups.battery_percent(),
            "onACPower": services.ups.on_ac_power(),
        },
        "wifi": {
            "connected": services.wifi.is_connected().await,
            "ssid": services.wifi.current_ssid().await.unwrap_or_default(),
        },
        "firmwareVersion": crate::FIRMWARE_VERSION,
        "update": update,
        "relayDomain": services
            .config
            .get_string(keys::RELAY_DOMAIN)
            .await
            .unwrap_or_default(),
        "logs": services.logs.entries(),
        "performance": performance,
    });

    send_encrypted(&services, &ctx, "getHealthResult", health).await
}

async fn get_preview(services: Arc<Services>, ctx: HandlerCtx, _payload: Value) -> Result<()> {
    let frame = services.recorder.capture_preview().await?;
    send_encrypted(
        &services,
        &ctx,
        "getPreviewResult",
        json!({ "success": true, "image": B64.encode(frame) }),
    )
    .await
}

async fn start_update(services: Arc<Services>, ctx: HandlerCtx, _payload: Value) -> Result<()> {
    services.updater.start_update().await?;
    send_encrypted(
        &services,
        &ctx,
        "startUpdateResult",
        json!({ "success": true }),
    )
    .await
}

/// Acknowledge first, then reboot; the reply races the reboot otherwise.
async fn restart(services: Arc<Services>, ctx: HandlerCtx, _payload: Value) -> Result<()> {
    send_encrypted(&services, &ctx, "restartResult", json!({ "success": true })).await?;

    info!(device_id = %ctx.device_id, "restart requested");
    tokio::spawn(async {
        let _ = Command::new("sudo").arg("reboot").status().await;
    });
    Ok(())
}

/// Factory reset: acknowledge, wipe the data partition, reboot.
async fn reset(services: Arc<Services>, ctx: HandlerCtx, _payload: Value) -> Result<()> {
    send_encrypted(&services, &ctx, "resetResult", json!({ "success": true })).await?;

    warn!(device_id = %ctx.device_id, "factory reset requested");
    let data_dir = services.paths.data_dir.clone();
    tokio::spawn(async move {
        if let Err(e) = wipe_dir_contents(&data_dir) {
            error!("failed to wipe data dir: {e}");
        }
        let _ = Command::new("sudo").arg("reboot").status().await;
    });
    Ok(())
}

fn wipe_dir_contents(dir: &std::path::Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
