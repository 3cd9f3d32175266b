// SPDX-License-Identifier: MIT OR Apache-2.0

//! HMAC-based key derivation function (HKDF) with SHA256.
//!
//! <https://www.rfc-editor.org/rfc/rfc5869>
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

/// Extracts from `ikm` with `salt` and expands into `N` bytes of output key material.
pub fn hkdf<const N: usize>(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; N], HkdfError> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; N];
    hk.expand(info, &mut okm)
        .map_err(|_| HkdfError::InvalidArguments)?;
    Ok(okm)
}

#[derive(Debug, Error)]
pub enum HkdfError {
    #[error("requested output too large for hkdf")]
    InvalidArguments,
}
