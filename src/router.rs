//! Encrypted command router.
//!
//! Every remote command crosses this boundary: look the sender up in the
//! registry, derive the shared key from the camera's private key and the
//! sender's public key, open the sealed payload, and verify the device ID
//! *inside* the ciphertext matches the envelope's claim. The inner ID check
//! is what stops a relay (or anyone on it) from replaying a captured
//! ciphertext under a different outer identity.
//!
//! Replies wrap the camera's product ID inside the sealed payload for the
//! mirror-image reason: a compromised relay must not be able to cross-wire
//! responses between cameras without detection.

use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::config::keys;
use crate::crypto::{self, Session};
use crate::error::{Error, Result};
use crate::relay::Envelope;
use crate::services::Services;

/// Per-message handler context: the authenticated sender and the session
/// its reply must be sealed under.
#[derive(Clone)]
pub struct HandlerCtx {
    pub device_id: String,
    pub session: Session,
}

/// Why an inbound envelope was rejected before reaching its handler, and
/// whether the rejection can be sealed.
pub enum Denial {
    /// No proven session with the sender; the reply goes out in the clear.
    Unencrypted(&'static str),
    /// The sender authenticated but the payload was unusable; the reply is
    /// sealed under the established session.
    Encrypted(Session, &'static str),
}

impl Denial {
    pub fn message(&self) -> &'static str {
        match self {
            Denial::Unencrypted(msg) | Denial::Encrypted(_, msg) => msg,
        }
    }
}

/// Authenticate an inbound encrypted payload and open it.
///
/// Returns the handler context plus the decrypted JSON payload, or the
/// denial to report. No state is mutated on any failure path.
pub async fn authenticate(
    services: &Services,
    device_id: &str,
    encrypted_payload: &str,
) -> std::result::Result<(HandlerCtx, Value), Denial> {
    let Some(device) = services.registry.get_by_id(device_id).await else {
        return Err(Denial::Unencrypted("Device not paired"));
    };

    let Some(camera_private) = services.config.get_bytes(keys::CAMERA_PRIVATE_KEY).await else {
        return Err(Denial::Unencrypted("Camera not initialized"));
    };

    let shared_key = crypto::derive_shared_key(&camera_private, &device.public_key)
        .map_err(|_| Denial::Unencrypted("Failed to derive key"))?;
    let session = Session::from_key(&shared_key);

    let plaintext = session
        .open(encrypted_payload)
        .map_err(|_| Denial::Unencrypted("Failed to decrypt payload"))?;

    let payload: Value = serde_json::from_slice(&plaintext)
        .map_err(|_| Denial::Encrypted(session.clone(), "Invalid payload"))?;

    if payload.get("deviceId").and_then(Value::as_str) != Some(device_id) {
        return Err(Denial::Unencrypted("Device ID mismatch"));
    }

    Ok((
        HandlerCtx {
            device_id: device_id.to_string(),
            session,
        },
        payload,
    ))
}

/// Seal a reply payload under the caller's session and emit it.
///
/// The payload must be a JSON object; the camera's product ID is inserted
/// into it before sealing so the recipient can verify the origin.
pub async fn send_encrypted(
    services: &Services,
    ctx: &HandlerCtx,
    msg_type: &str,
    payload: Value,
) -> Result<()> {
    let product_id = services
        .config
        .get_string(keys::PRODUCT_ID)
        .await
        .ok_or_else(|| Error::Config("product ID missing from config".into()))?;

    let Value::Object(mut wrapped) = payload else {
        return Err(Error::Subsystem("reply payload must be a JSON object".into()));
    };
    wrapped.insert("productId".into(), Value::String(product_id.clone()));

    let sealed = ctx.session.seal(&serde_json::to_vec(&Value::Object(wrapped))?)?;
    services
        .relay
        .send(&Envelope::to_device(msg_type, product_id, &ctx.device_id, sealed))
        .await
}

/// Emit an unencrypted error reply.
///
/// Used only when no session with the sender exists (or its identity is
/// unproven): the payload rides in the envelope's `encryptedPayload` slot
/// as plain JSON, which clients treat as a hard authentication failure.
pub async fn send_unencrypted_error(
    services: &Services,
    device_id: &str,
    msg_type: &str,
    error_msg: &str,
) {
    let product_id = services
        .config
        .get_string(keys::PRODUCT_ID)
        .await
        .unwrap_or_default();

    let payload = json!({
        "productId": product_id,
        "success": false,
        "error": error_msg,
    })
    .to_string();

    let envelope = Envelope::to_device(msg_type, product_id, device_id, payload);
    if let Err(e) = services.relay.send(&envelope).await {
        debug!(msg_type, "failed to send error reply: {e}");
    }
}

/// Register an encrypted command handler on the relay.
///
/// The handler runs behind [`authenticate`]; any error it returns is
/// reported to the caller as a sealed `{success:false, error}` reply of the
/// corresponding `{type}Result`.
pub fn route<H, Fut>(services: &Arc<Services>, msg_type: &'static str, handler: H)
where
    H: Fn(Arc<Services>, HandlerCtx, Value) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let registered = Arc::clone(services);
    services.relay.on(msg_type, move |envelope: Envelope| {
        let services = Arc::clone(&registered);
        let handler = handler.clone();
        async move {
            let result_type = format!("{msg_type}Result");

            match authenticate(&services, &envelope.device_id, &envelope.encrypted_payload).await
            {
                Ok((ctx, payload)) => {
                    if let Err(e) = handler(Arc::clone(&services), ctx.clone(), payload).await {
                        let reply = json!({ "success": false, "error": e.to_string() });
                        if let Err(send_err) =
                            send_encrypted(&services, &ctx, &result_type, reply).await
                        {
                            debug!(msg_type, "failed to send handler error: {send_err}");
                        }
                    }
                }
                Err(Denial::Encrypted(session, msg)) => {
                    let ctx = HandlerCtx {
                        device_id: envelope.device_id.clone(),
                        session,
                    };
                    let reply = json!({ "success": false, "error": msg });
                    if let Err(e) = send_encrypted(&services, &ctx, &result_type, reply).await {
                        debug!(msg_type, "failed to send denial reply: {e}");
                    }
                }
                Err(denial) => {
                    send_unencrypted_error(
                        &services,
                        &envelope.device_id,
                        &result_type,
                        denial.message(),
                    )
                    .await;
                }
            }
        }
    });
}

/// Parse a handler's typed request out of the decrypted payload.
pub fn parse_request<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|_| Error::Subsystem("Invalid payload".into()))
}
