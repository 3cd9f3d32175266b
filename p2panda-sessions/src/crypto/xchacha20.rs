// SPDX-License-Identifier: MIT OR Apache-2.0

//! XChaCha20Poly1305 is a ChaCha20Poly1305 AEAD variant with an extended 192-bit (24-byte) nonce.
use chacha20poly1305::aead::Aead;
use chacha20poly1305::aead::Payload;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use thiserror::Error;

pub const XAEAD_NONCE_SIZE: usize = 24;

pub const XAEAD_KEY_SIZE: usize = 32;

pub type XAeadNonce = [u8; XAEAD_NONCE_SIZE];

pub type XAeadKey = [u8; XAEAD_KEY_SIZE];

pub fn x_aead_encrypt(
    key: &XAeadKey,
    plaintext: &[u8],
    nonce: &XAeadNonce,
    aad: &[u8],
) -> Result<Vec<u8>, XAeadError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(XAeadError::Encrypt)
}

pub fn x_aead_decrypt(
    key: &XAeadKey,
    ciphertext_tag: &[u8],
    nonce: &XAeadNonce,
    aad: &[u8],
) -> Result<Vec<u8>, XAeadError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext_tag,
                aad,
            },
        )
        .map_err(XAeadError::Decrypt)
}

#[derive(Debug, Error)]
pub enum XAeadError {
    #[error("could not encrypt with xchacha20poly1305 aead: {0}")]
    Encrypt(chacha20poly1305::Error),

    #[error("could not decrypt with xchacha20poly1305 aead: {0}")]
    Decrypt(chacha20poly1305::Error),
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::{XAeadError, XAeadKey, XAeadNonce, x_aead_decrypt, x_aead_encrypt};

    #[test]
    fn encrypt_decrypt() {
        let rng = Rng::from_seed([1; 32]);

        let key: XAeadKey = rng.random_array().unwrap();
        let nonce: XAeadNonce = rng.random_array().unwrap();

        let ciphertext = x_aead_encrypt(&key, b"Hello, Panda!", &nonce, b"session").unwrap();
        let plaintext = x_aead_decrypt(&key, &ciphertext, &nonce, b"session").unwrap();

        assert_eq!(plaintext, b"Hello, Panda!");
    }

    #[test]
    fn additional_data_is_authenticated() {
        let rng = Rng::from_seed([1; 32]);

        let key: XAeadKey = rng.random_array().unwrap();
        let nonce: XAeadNonce = rng.random_array().unwrap();

        let ciphertext = x_aead_encrypt(&key, b"Hello, Panda!", &nonce, b"session").unwrap();
        assert!(matches!(
            x_aead_decrypt(&key, &ciphertext, &nonce, b"other session"),
            Err(XAeadError::Decrypt(_))
        ));
    }
}
