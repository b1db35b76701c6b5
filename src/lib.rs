//! Komori - privacy-focused home camera firmware
//!
//! A komori unit pairs with phones over a local out-of-band channel, speaks
//! an end-to-end encrypted command protocol with each paired device through
//! an untrusted relay, and supervises the local camera hardware:
//!
//! - **`crypto`**: X25519 key exchange, HKDF-SHA256 derivation, AES-256-GCM sessions
//! - **`config`**: persistent JSON key/value store backing all durable state
//! - **`devices`**: paired-device registry with timed removal
//! - **`pairing`**: pairing-code state machine + local HTTP carrier
//! - **`relay`**: reconnecting WebSocket client for the relay transport
//! - **`router`**: authenticate/decrypt/dispatch middleware for every command
//! - **`streaming`**: bounded viewer fan-out over the capture pipeline
//! - **`handlers`**: command handlers wiring the control plane to subsystems
//!
//! Hardware-facing subsystems (`capture`, `storage`, `wifi`, `speaker`,
//! `ups`, `updater`, `health`, `logger`) are supervised by the same daemon.

pub mod capture;
pub mod config;
pub mod crypto;
pub mod devices;
pub mod error;
pub mod handlers;
pub mod health;
pub mod logger;
pub mod pairing;
pub mod paths;
pub mod relay;
pub mod router;
pub mod services;
pub mod speaker;
pub mod storage;
pub mod streaming;
pub mod updater;
pub mod ups;
pub mod wifi;

pub use error::Error;
pub use services::Services;

/// Firmware version reported in health and compared by the updater.
/// Injected at build time via `KOMORI_FIRMWARE_VERSION`, falling back to the
/// crate version for development builds.
pub const FIRMWARE_VERSION: &str = match option_env!("KOMORI_FIRMWARE_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};
