// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encoding helpers for persisted state and wire messages.
//!
//! State at rest (private keys, key index, session records) is encoded as [CBOR]. Messages on the
//! wire are JSON. Byte fields serialize as hex strings in human-readable formats and as raw bytes
//! otherwise.
//!
//! [CBOR]: https://cbor.io/
use std::fmt;

use ciborium::de::Error as DeserializeError;
use ciborium::ser::Error as SerializeError;
use serde::de::{DeserializeOwned, Error as _, SeqAccess, Visitor};
use serde::{Deserializer, Serialize, Serializer};
use serde_bytes::Bytes as SerdeBytes;
use thiserror::Error;

/// Serializes a value into CBOR format.
pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).map_err(Into::<EncodeError>::into)?;
    Ok(bytes)
}

/// Deserializes a value which was formatted in CBOR.
pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    let value = ciborium::from_reader::<T, _>(bytes).map_err(Into::<DecodeError>::into)?;
    Ok(value)
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("an error occurred while writing bytes: {0}")]
    Io(std::io::Error),

    #[error("an error occurred while serializing value: {0}")]
    Value(String),
}

impl From<SerializeError<std::io::Error>> for EncodeError {
    fn from(value: SerializeError<std::io::Error>) -> Self {
        match value {
            SerializeError::Io(err) => EncodeError::Io(err),
            SerializeError::Value(err) => EncodeError::Value(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("an error occurred while reading bytes: {0}")]
    Io(std::io::Error),

    #[error("an error occurred while parsing bytes at position {0}")]
    Syntax(usize),

    #[error("an error occurred while processing a parsed value at position {0:?}: {1}")]
    Semantic(Option<usize>, String),

    #[error("recursion limit exceeded while decoding")]
    RecursionLimitExceeded,
}

impl From<DeserializeError<std::io::Error>> for DecodeError {
    fn from(value: DeserializeError<std::io::Error>) -> Self {
        match value {
            DeserializeError::Io(err) => DecodeError::Io(err),
            DeserializeError::Syntax(offset) => DecodeError::Syntax(offset),
            DeserializeError::Semantic(offset, description) => {
                DecodeError::Semantic(offset, description)
            }
            DeserializeError::RecursionLimitExceeded => DecodeError::RecursionLimitExceeded,
        }
    }
}

/// Serializes bytes into a hex string for human readable encodings (JSON), otherwise as raw
/// bytes (CBOR).
pub fn serialize_hex<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: AsRef<[u8]>,
    S: Serializer,
{
    if serializer.is_human_readable() {
        hex::serde::serialize(value, serializer)
    } else {
        SerdeBytes::new(value.as_ref()).serialize(serializer)
    }
}

/// Deserializes bytes from either a hex string or a raw byte sequence.
///
/// Both representations are accepted independent of the encoding, as buffered values (for
/// example inside untagged enums) do not carry the "human readable" hint of the original format.
pub fn deserialize_hex<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    if deserializer.is_human_readable() {
        deserializer.deserialize_str(HexVisitor)
    } else {
        deserializer.deserialize_bytes(HexVisitor)
    }
}

/// Deserializes a fixed-size byte array from either a hex string or a raw byte sequence.
pub fn deserialize_hex_array<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
where
    D: Deserializer<'de>,
{
    let bytes = deserialize_hex(deserializer)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| D::Error::invalid_length(len, &"byte array of fixed size"))
}

struct HexVisitor;

impl<'de> Visitor<'de> for HexVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("hex string or byte sequence")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        hex::decode(value).map_err(E::custom)
    }

    fn visit_bytes<E>(self, value: &[u8]) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(value.to_vec())
    }

    fn visit_byte_buf<E>(self, value: Vec<u8>) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(value)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or_default());
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::{decode_cbor, deserialize_hex, encode_cbor, serialize_hex};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
        bytes: Vec<u8>,
    }

    #[test]
    fn hex_in_json_bytes_in_cbor() {
        let payload = Payload {
            bytes: vec![0xde, 0xad, 0xbe, 0xef],
        };

        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"bytes":"deadbeef"}"#);
        assert_eq!(serde_json::from_str::<Payload>(&json).unwrap(), payload);

        let cbor = encode_cbor(&payload).unwrap();
        assert_eq!(decode_cbor::<Payload>(&cbor).unwrap(), payload);
    }

    #[test]
    fn reject_invalid_hex() {
        assert!(serde_json::from_str::<Payload>(r#"{"bytes":"not hex"}"#).is_err());
    }
}
