// SPDX-License-Identifier: MIT OR Apache-2.0

//! XEdDSA signatures calculated directly with X25519 key pairs.
//!
//! Identities sign their pre-keys and the ephemeral keys of session initiations with the same key
//! they use for Diffie-Hellman during the handshake.
//!
//! <https://signal.org/docs/specifications/xeddsa/>
use std::fmt;

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::{EdwardsPoint, MontgomeryPoint, Scalar};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::crypto::sha2::sha2_512;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError};
use crate::encoding::{deserialize_hex_array, serialize_hex};

/// 512-bit signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Domain separation for the nonce hash ("hash1" in the XEdDSA paper).
const HASH_1_PREFIX: [u8; 32] = {
    let mut prefix = [0xFFu8; 32];
    prefix[0] = 0xFE;
    prefix
};

/// XEdDSA signature.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XSignature(
    #[serde(
        serialize_with = "serialize_hex",
        deserialize_with = "deserialize_hex_array"
    )]
    [u8; SIGNATURE_SIZE],
);

impl XSignature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Display for XSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Converts the Montgomery secret into an Edwards key pair with the sign bit of the public point
/// forced to zero.
fn calculate_key_pair(secret_key: &SecretKey) -> (CompressedEdwardsY, Scalar) {
    let k = Scalar::from_bytes_mod_order(*secret_key.as_bytes());
    let cap_e = &k * ED25519_BASEPOINT_TABLE;
    let mut cap_a = cap_e.compress();
    let sign_bit = cap_a.0[31] >> 7;
    cap_a.0[31] &= 0b0111_1111_u8;
    let a = if sign_bit == 1 { -k } else { k };
    (cap_a, a)
}

/// Signs `bytes` with the X25519 secret key.
pub fn xeddsa_sign(
    bytes: &[u8],
    secret_key: &SecretKey,
    rng: &Rng,
) -> Result<XSignature, XEdDSAError> {
    let cap_z: [u8; SIGNATURE_SIZE] = rng.random_array()?;
    let (cap_a, a) = calculate_key_pair(secret_key);

    // r = hash1(a || M || Z) (mod q)
    let r = Scalar::from_bytes_mod_order_wide(&sha2_512(&[
        &HASH_1_PREFIX,
        a.as_bytes(),
        bytes,
        &cap_z,
    ]));

    // R = rB
    let cap_r = (&r * ED25519_BASEPOINT_TABLE).compress();

    // h = hash(R || A || M) (mod q)
    let h = Scalar::from_bytes_mod_order_wide(&sha2_512(&[
        cap_r.as_bytes(),
        cap_a.as_bytes(),
        bytes,
    ]));

    // s = r + ha (mod q)
    let s = r + (h * a);

    let mut signature = [0u8; SIGNATURE_SIZE];
    signature[..32].copy_from_slice(cap_r.as_bytes());
    signature[32..].copy_from_slice(s.as_bytes());
    Ok(XSignature::from_bytes(signature))
}

/// Verifies an XEdDSA signature over `bytes` with the X25519 public key of the signer.
pub fn xeddsa_verify(
    bytes: &[u8],
    their_public_key: &PublicKey,
    signature: &XSignature,
) -> Result<(), XEdDSAError> {
    let mut cap_r = [0u8; 32];
    cap_r.copy_from_slice(&signature.as_bytes()[..32]);
    let mut s = [0u8; 32];
    s.copy_from_slice(&signature.as_bytes()[32..]);
    s[31] &= 0b0111_1111_u8;

    if (s[31] & 0b1110_0000_u8) != 0 {
        return Err(XEdDSAError::InvalidArgument);
    }

    let a: EdwardsPoint = MontgomeryPoint(their_public_key.to_bytes())
        .to_edwards(0)
        .ok_or(XEdDSAError::InvalidArgument)?;
    let cap_a = a.compress();

    // h = hash(R || A || M) (mod q)
    let h = Scalar::from_bytes_mod_order_wide(&sha2_512(&[&cap_r, cap_a.as_bytes(), bytes]));

    // Rcheck = sB - hA
    let cap_r_check = EdwardsPoint::vartime_double_scalar_mul_basepoint(
        &h,
        &(-a),
        &Scalar::from_bytes_mod_order(s),
    )
    .compress();

    if bool::from(cap_r_check.as_bytes().ct_eq(&cap_r)) {
        Ok(())
    } else {
        Err(XEdDSAError::VerificationFailed)
    }
}

#[derive(Debug, Error)]
pub enum XEdDSAError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("invalid xeddsa public key or signature")]
    InvalidArgument,

    #[error("signature does not match public key and bytes")]
    VerificationFailed,
}
