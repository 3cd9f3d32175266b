// SPDX-License-Identifier: MIT OR Apache-2.0

//! Elliptic-curve Diffie–Hellman (ECDH) key agreement scheme (X25519).
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::StaticSecret;

use crate::crypto::{Rng, RngError, Secret};
use crate::encoding::{deserialize_hex_array, serialize_hex};

/// 256-bit secret key size.
pub const SECRET_KEY_SIZE: usize = 32;

/// 256-bit public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Secret Curve25519 key used for identities, pre-keys and ephemeral keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey(Secret<SECRET_KEY_SIZE>);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        // Clamping
        let mut bytes = bytes;
        bytes[0] &= 248u8;
        bytes[31] &= 127u8;
        bytes[31] |= 64u8;
        SecretKey(Secret::from_bytes(bytes))
    }

    /// Generates a fresh secret key.
    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self::from_bytes(rng.random_array()?))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        self.0.as_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(*self.0.as_bytes());
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }

    /// Calculates the shared secret with the other party's public key.
    ///
    /// Fails for low-order points where the result would not depend on our secret.
    pub fn calculate_agreement(
        &self,
        their_public: &PublicKey,
    ) -> Result<[u8; PUBLIC_KEY_SIZE], X25519Error> {
        let secret = StaticSecret::from(*self.0.as_bytes());
        let shared_secret = secret.diffie_hellman(&x25519_dalek::PublicKey::from(their_public.0));
        if !shared_secret.was_contributory() {
            return Err(X25519Error::InvalidCurve);
        }
        Ok(shared_secret.to_bytes())
    }
}

/// Public Curve25519 key.
///
/// Serializes as a hex string in human-readable formats (JSON) and as raw bytes otherwise.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(
    #[serde(
        serialize_with = "serialize_hex",
        deserialize_with = "deserialize_hex_array"
    )]
    [u8; PUBLIC_KEY_SIZE],
);

impl PublicKey {
    pub fn from_bytes(public_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(public_key)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Debug, Error)]
pub enum X25519Error {
    #[error("invalid curve point or scalar")]
    InvalidCurve,
}
