//! Error types for the camera firmware.
//!
//! The control plane reports errors to devices as plain strings inside
//! `*Result` payloads, so the `Display` text of each variant is part of the
//! wire contract.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Pairing rejected the submitted code (wrong digits or expired).
    #[error("invalid or expired code")]
    InvalidCode,

    /// Key material had the wrong shape (not 32 bytes, bad base64).
    #[error("invalid key length")]
    InvalidKey,

    /// X25519 produced an all-zero shared secret (small-subgroup input).
    #[error("weak shared secret detected")]
    WeakKey,

    /// AEAD open failed: tag mismatch, truncated frame, or decode error.
    #[error("decryption failed: {0}")]
    Crypto(String),

    /// Envelope referenced a device ID absent from the registry.
    #[error("Device not paired")]
    NotPaired,

    /// Camera private key missing from the config store.
    #[error("Camera not initialized")]
    NotInitialized,

    /// Decrypted payload's device ID disagrees with the envelope's.
    #[error("Device ID mismatch")]
    IdentityMismatch,

    /// Requested recording or thumbnail does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Stream start rejected: the viewer set is full.
    #[error("viewer limit reached ({current}/{max})")]
    ViewerLimit { current: usize, max: usize },

    /// Relay write attempted without an open connection.
    #[error("not connected")]
    NotConnected,

    /// A subsystem (wifi, capture, updater, ...) reported a failure.
    #[error("{0}")]
    Subsystem(String),

    /// Config store read or write failed.
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap a subsystem failure, keeping its message verbatim for the user.
    pub fn subsystem(err: impl std::fmt::Display) -> Self {
        Error::Subsystem(err.to_string())
    }
}
