//! HTTP pairing carrier, served on the camera's local access point.
//!
//! Plain JSON on port 80: the phone is on the camera's own AP, so transport
//! security comes from the pairing code and, after pairing, from payload
//! encryption. `/set-wifi` and `/set-relay` run the same
//! authenticate-and-decrypt middleware as the relay router.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::config::{self, keys};
use crate::crypto;
use crate::error::Result;
use crate::router::{authenticate, parse_request, Denial};
use crate::services::Services;

/// Bind the pairing server and serve it in the background.
pub async fn serve(services: Arc<Services>, port: u16) -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    let app = router(services);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("pairing server failed: {e}");
        }
    });

    info!("pairing server listening on {addr}");
    Ok(addr)
}

pub fn router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/", get(setup_page))
        .route("/get-code", get(get_code))
        .route("/pair", post(pair))
        .route("/set-wifi", post(set_wifi))
        .route("/set-relay", post(set_relay))
        .with_state(services)
}

async fn setup_page() -> Html<&'static str> {
    Html(include_str!("../../assets/setup.html"))
}

/// Trigger the camera to speak the active pairing code. The code itself is
/// never returned over HTTP; it travels through the room.
async fn get_code(State(services): State<Arc<Services>>) -> Json<Value> {
    services.pairing.get_code().await;
    Json(json!({ "success": true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairRequest {
    device_id: String,
    device_name: String,
    code: String,
    /// Base64-encoded X25519 public key.
    device_public_key: String,
}

async fn pair(
    State(services): State<Arc<Services>>,
    Json(req): Json<PairRequest>,
) -> (StatusCode, Json<Value>) {
    let device_public_key = match crypto::decode_public_key(&req.device_public_key) {
        Ok(key) => key,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": "Invalid public key format" })),
            );
        }
    };

    match services
        .pairing
        .pair(&req.device_id, &req.device_name, &req.code, &device_public_key)
        .await
    {
        Ok(result) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": {
                    "cameraPublicKey": crypto::encode_public_key(&result.camera_public_key),
                    "wifiConnected": result.wifi_connected,
                    "relayUrl": result.relay_domain,
                    "availableNetworks": result.available_networks,
                },
            })),
        ),
        Err(e) => (
            StatusCode::OK,
            Json(json!({ "success": false, "error": e.to_string() })),
        ),
    }
}

/// An encrypted request from an already-paired device.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptedRequest {
    device_id: String,
    encrypted_payload: String,
}

#[derive(Deserialize)]
struct SetWifiRequest {
    ssid: String,
    #[serde(default)]
    password: String,
}

async fn set_wifi(
    State(services): State<Arc<Services>>,
    Json(req): Json<EncryptedRequest>,
) -> (StatusCode, Json<Value>) {
    let payload = match authenticate(&services, &req.device_id, &req.encrypted_payload).await {
        Ok((_ctx, payload)) => payload,
        Err(denial) => return denial_response(&denial),
    };

    let wifi_req: SetWifiRequest = match parse_request(&payload) {
        Ok(req) => req,
        Err(_) => return invalid_payload(),
    };

    match services.wifi.connect(&wifi_req.ssid, &wifi_req.password).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))),
        Err(e) => (
            StatusCode::OK,
            Json(json!({ "success": false, "error": e.to_string() })),
        ),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetRelayRequest {
    relay_url: String,
}

async fn set_relay(
    State(services): State<Arc<Services>>,
    Json(req): Json<EncryptedRequest>,
) -> (StatusCode, Json<Value>) {
    let payload = match authenticate(&services, &req.device_id, &req.encrypted_payload).await {
        Ok((_ctx, payload)) => payload,
        Err(denial) => return denial_response(&denial),
    };

    let relay_req: SetRelayRequest = match parse_request(&payload) {
        Ok(req) => req,
        Err(_) => return invalid_payload(),
    };

    // The relay endpoint is set once during setup; changing it afterwards
    // requires a factory reset.
    let existing = services.config.get_string(keys::RELAY_DOMAIN).await;
    if existing.is_some_and(|domain| !domain.is_empty()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "success": false, "error": "Relay URL already configured" })),
        );
    }

    let domain = config::domain_from_url(&relay_req.relay_url);
    if domain.is_empty() {
        return invalid_payload();
    }

    match services
        .config
        .set(keys::RELAY_DOMAIN, Value::String(domain))
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))),
        Err(e) => (
            StatusCode::OK,
            Json(json!({ "success": false, "error": e.to_string() })),
        ),
    }
}

fn denial_response(denial: &Denial) -> (StatusCode, Json<Value>) {
    let status = match denial.message() {
        "Device not paired" | "Failed to decrypt payload" | "Device ID mismatch" => {
            StatusCode::UNAUTHORIZED
        }
        "Invalid payload" => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "success": false, "error": denial.message() })),
    )
}

fn invalid_payload() -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": "Invalid payload" })),
    )
}
