// SPDX-License-Identifier: MIT OR Apache-2.0

//! JSON wire formats of session messages.
//!
//! The first message of a session carries everything the responder needs to run the handshake,
//! all further messages only reference the session. No explicit type tag is sent, an
//! `ephemeralPublicKey` field marks an initiation.
use serde::{Deserialize, Serialize};

use crate::crypto::x25519::PublicKey;
use crate::crypto::xeddsa::XSignature;
use crate::encoding::{deserialize_hex, deserialize_hex_array, serialize_hex};
use crate::identity::IdentityId;
use crate::key_bundle::PreKeyId;
use crate::session::{Salt, SessionId};

const INITIATION_MARKER: &str = "ephemeralPublicKey";

/// First message of a session, sent by the initiator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiationMessage {
    pub sender_identity_id: IdentityId,

    /// Id of the responder's long-term pre-key used in the handshake.
    pub peer_long_term_card_id: PreKeyId,

    /// Id of the responder's one-time pre-key, if the directory handed one out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_one_time_card_id: Option<PreKeyId>,
    pub ephemeral_public_key: PublicKey,

    /// Signature over the ephemeral public key by the sender's identity key.
    pub ephemeral_public_key_signature: XSignature,
    #[serde(
        serialize_with = "serialize_hex",
        deserialize_with = "deserialize_hex_array"
    )]
    pub salt: Salt,
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub ciphertext: Vec<u8>,
}

/// Any message after the initiation, in both directions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegularMessage {
    pub session_id: SessionId,
    #[serde(
        serialize_with = "serialize_hex",
        deserialize_with = "deserialize_hex_array"
    )]
    pub salt: Salt,
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum WireMessage {
    Initiation(InitiationMessage),
    Regular(RegularMessage),
}

impl WireMessage {
    /// Parses a message, choosing the kind by the presence of the ephemeral key field.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        if value.get(INITIATION_MARKER).is_some() {
            Ok(WireMessage::Initiation(serde_json::from_value(value)?))
        } else {
            Ok(WireMessage::Regular(serde_json::from_value(value)?))
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn is_initiation(&self) -> bool {
        matches!(self, WireMessage::Initiation(_))
    }
}

impl From<InitiationMessage> for WireMessage {
    fn from(message: InitiationMessage) -> Self {
        WireMessage::Initiation(message)
    }
}

impl From<RegularMessage> for WireMessage {
    fn from(message: RegularMessage) -> Self {
        WireMessage::Regular(message)
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;
    use crate::crypto::x25519::SecretKey;
    use crate::crypto::xeddsa::xeddsa_sign;
    use crate::identity::IdentityId;
    use crate::key_bundle::PreKeyId;
    use crate::session::SessionId;

    use super::{InitiationMessage, RegularMessage, WireMessage};

    fn initiation(rng: &Rng, with_one_time: bool) -> InitiationMessage {
        let identity = SecretKey::generate(rng).unwrap();
        let ephemeral = SecretKey::generate(rng).unwrap().public_key();
        let long_term = SecretKey::generate(rng).unwrap().public_key();
        let one_time = SecretKey::generate(rng).unwrap().public_key();
        InitiationMessage {
            sender_identity_id: IdentityId::new("alice"),
            peer_long_term_card_id: PreKeyId::from_public_key(&long_term),
            peer_one_time_card_id: with_one_time.then(|| PreKeyId::from_public_key(&one_time)),
            ephemeral_public_key: ephemeral,
            ephemeral_public_key_signature: xeddsa_sign(ephemeral.as_bytes(), &identity, rng)
                .unwrap(),
            salt: rng.random_array().unwrap(),
            ciphertext: vec![1, 2, 3],
        }
    }

    #[test]
    fn camel_case_fields() {
        let rng = Rng::from_seed([1; 32]);
        let json = WireMessage::from(initiation(&rng, true)).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        for field in [
            "senderIdentityId",
            "peerLongTermCardId",
            "peerOneTimeCardId",
            "ephemeralPublicKey",
            "ephemeralPublicKeySignature",
            "salt",
            "ciphertext",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert_eq!(value["ciphertext"], "010203");

        // Optional one-time id is left out entirely.
        let json = WireMessage::from(initiation(&rng, false)).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value.get("peerOneTimeCardId").is_none());
    }

    #[test]
    fn structural_disambiguation() {
        let rng = Rng::from_seed([1; 32]);

        let message = WireMessage::from(initiation(&rng, false));
        let parsed = WireMessage::from_json(&message.to_json().unwrap()).unwrap();
        assert!(parsed.is_initiation());
        assert_eq!(parsed, message);

        let message = WireMessage::from(RegularMessage {
            session_id: SessionId::from_bytes([7; 32]),
            salt: rng.random_array().unwrap(),
            ciphertext: vec![4, 5, 6],
        });
        let parsed = WireMessage::from_json(&message.to_json().unwrap()).unwrap();
        assert!(!parsed.is_initiation());
        assert_eq!(parsed, message);
    }

    #[test]
    fn malformed_messages() {
        // Marker present, rest of the initiation missing.
        assert!(WireMessage::from_json(r#"{"ephemeralPublicKey":"00"}"#).is_err());

        // Neither kind.
        assert!(WireMessage::from_json(r#"{"hello":"panda"}"#).is_err());
        assert!(WireMessage::from_json("not json").is_err());
    }
}
