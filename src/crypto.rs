//! Key exchange and AEAD primitives.
//!
//! Each camera owns a single long-lived X25519 keypair; every paired device
//! brings its own. A message key is derived per exchange with HKDF-SHA256
//! over the raw X25519 output, and payloads travel as
//! `base64(nonce(12) || AES-256-GCM ciphertext)` with no associated data.
//! Nonces are random rather than counters: sessions are recreated per
//! message and no sequence state survives a restart.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Length of X25519 keys and derived symmetric keys.
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;

/// HKDF info string binding derived keys to this protocol.
const HKDF_INFO: &[u8] = b"root-camera-encryption";

/// An X25519 keypair for key exchange.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a keypair from a stored 32-byte private scalar.
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| Error::InvalidKey)?;
        let secret = StaticSecret::from(arr);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public_bytes(&self) -> [u8; KEY_LEN] {
        *self.public.as_bytes()
    }

    pub fn private_bytes(&self) -> [u8; KEY_LEN] {
        self.secret.to_bytes()
    }
}

/// Derive the 32-byte AEAD key shared between one side's private key and the
/// other's public key.
///
/// Rejects inputs that are not exactly 32 bytes, and an all-zero X25519
/// output (small-subgroup peer point). Both sides of a pairing derive the
/// same key.
pub fn derive_shared_key(own_private: &[u8], peer_public: &[u8]) -> Result<[u8; KEY_LEN]> {
    let private: [u8; KEY_LEN] = own_private.try_into().map_err(|_| Error::InvalidKey)?;
    let public: [u8; KEY_LEN] = peer_public.try_into().map_err(|_| Error::InvalidKey)?;

    let shared = StaticSecret::from(private).diffie_hellman(&PublicKey::from(public));
    let mut raw = *shared.as_bytes();

    if raw.iter().all(|&b| b == 0) {
        raw.zeroize();
        return Err(Error::WeakKey);
    }

    let hk = Hkdf::<Sha256>::new(None, &raw);
    let mut key = [0u8; KEY_LEN];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    raw.zeroize();
    Ok(key)
}

/// An AES-256-GCM session keyed by a derived shared key.
///
/// Sessions are cheap to build and are derived on demand per message; the
/// router may cache them per device but is not required to.
#[derive(Clone)]
pub struct Session {
    cipher: Aes256Gcm,
}

impl Session {
    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt a plaintext, returning `base64(nonce || ciphertext)`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::Crypto(e.to_string()))?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&ciphertext);
        Ok(B64.encode(framed))
    }

    /// Decrypt a `base64(nonce || ciphertext)` frame produced by `seal`.
    pub fn open(&self, encoded: &str) -> Result<Vec<u8>> {
        let framed = B64
            .decode(encoded)
            .map_err(|e| Error::Crypto(e.to_string()))?;

        if framed.len() < NONCE_LEN {
            return Err(Error::Crypto("ciphertext too short".into()));
        }

        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| Error::Crypto(e.to_string()))
    }
}

/// Encode a public key for transport (standard base64).
pub fn encode_public_key(key: &[u8]) -> String {
    B64.encode(key)
}

/// Decode a base64 public key, enforcing the 32-byte length.
pub fn decode_public_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = B64.decode(encoded).map_err(|_| Error::InvalidKey)?;
    bytes.as_slice().try_into().map_err(|_| Error::InvalidKey)
}

/// Serde adapter persisting byte keys as standard-base64 strings, matching
/// the wire encoding used by paired devices.
pub mod serde_b64 {
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        B64.encode(bytes).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let encoded = String::deserialize(de)?;
        let bytes = B64.decode(&encoded).map_err(serde::de::Error::custom)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32-byte key"))
    }
}
