//! Curve25519 keys of the tunnel peers
//!
//! Keys travel in session configs as standard base64 text and must decode
//! to exactly 32 bytes before they are installed on a crypto device.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Length of a Curve25519 key in bytes
pub const KEY_LEN: usize = 32;

fn decode_key(text: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let raw = BASE64
        .decode(text.trim())
        .map_err(|_| KeyError::InvalidBase64)?;
    <[u8; KEY_LEN]>::try_from(raw.as_slice()).map_err(|_| KeyError::InvalidLength(raw.len()))
}

fn encode_key(raw: [u8; KEY_LEN]) -> String {
    BASE64.encode(raw)
}

/// Consumer's secret key; never printed
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    /// Fresh key from the OS random source
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    /// Key from raw scalar bytes
    pub fn from_bytes(raw: [u8; KEY_LEN]) -> Self {
        Self(StaticSecret::from(raw))
    }

    /// Parse a standard base64 key
    pub fn from_base64(text: &str) -> Result<Self, KeyError> {
        text.parse()
    }

    /// Key the provider needs to accept this consumer as its peer
    pub fn public_key(&self) -> PublicKey {
        PublicKey(X25519Public::from(&self.0))
    }

    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        encode_key(self.to_bytes())
    }
}

impl FromStr for PrivateKey {
    type Err = KeyError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        decode_key(text).map(Self::from_bytes)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([redacted])")
    }
}

/// Provider's public key, the identity of the single tunnel peer
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(X25519Public);

impl PublicKey {
    pub fn from_bytes(raw: [u8; KEY_LEN]) -> Self {
        Self(X25519Public::from(raw))
    }

    /// Parse a standard base64 key
    pub fn from_base64(text: &str) -> Result<Self, KeyError> {
        text.parse()
    }

    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        encode_key(self.to_bytes())
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        decode_key(text).map(Self::from_bytes)
    }
}

/// Short fingerprint for logs
impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.to_base64();
        write!(f, "PublicKey({}..)", &encoded[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// Key decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length: {0} bytes (expected 32)")]
    InvalidLength(usize),
}
