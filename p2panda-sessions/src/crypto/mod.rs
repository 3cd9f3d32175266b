// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives used to establish and run forward-secret sessions.
//!
//! Identity keys, pre-keys and ephemeral keys are all X25519 key pairs. Signatures over pre-keys
//! and ephemeral keys are calculated with XEdDSA, so one key pair serves both for Diffie-Hellman
//! and for signing.
pub mod hkdf;
mod rng;
mod secret;
pub mod sha2;
pub mod x25519;
pub mod x3dh;
pub mod xchacha20;
pub mod xeddsa;

pub use rng::{Rng, RngError};
pub(crate) use secret::Secret;
