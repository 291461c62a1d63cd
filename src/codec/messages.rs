//! Broker protocol message codec.
//!
//! Tagged JSON union keyed by a required `command` discriminator. Binary
//! fields (public keys, challenges, responses) are lower-case hex on the
//! wire and raw bytes once decoded — `serde`'s `with` attribute plus the
//! `hex` crate does the conversion at (de)serialization time so the rest of
//! the crate never touches hex strings directly.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A byte string that serializes as lower-case hex.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct HexBytes(pub Vec<u8>);

impl fmt::Debug for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HexBytes({})", hex::encode(&self.0))
    }
}

impl fmt::Display for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl From<Vec<u8>> for HexBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for HexBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for HexBytes {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s)
            .map(HexBytes)
            .map_err(|err| serde::de::Error::custom(format!("invalid hex: {err}")))
    }
}

/// The broker ↔ peer and peer ↔ peer handshake message set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum BrokerMessage {
    /// client → broker: register a listener under `public_key`.
    Register {
        /// The listener's long-term identity public key.
        public_key: HexBytes,
    },
    /// broker → client: authentication challenge.
    AuthenticationRequest {
        /// The broker's own public key, for the client's decrypt step.
        public_key: HexBytes,
        /// `Encrypt(C; client_pub, broker_secret)`.
        challenge: HexBytes,
    },
    /// client → broker: the transformed challenge.
    AuthenticationResponse {
        /// `Encrypt(invert(Decrypt(challenge)); broker_pub, client_secret)`.
        response: HexBytes,
    },
    /// broker → client: authentication succeeded; parked as a spare.
    AuthenticationSuccess {
        /// Ping cadence in milliseconds; `pong_timeout := 3 * ping_interval`
        /// unless overridden locally.
        ping_interval: u64,
    },
    /// broker → client: this spare is about to carry real traffic.
    ConnectionHandover,
    /// broker → client: keep-alive probe.
    CommPing,
    /// client → broker: keep-alive reply.
    CommPong,
    /// either → broker-or-peer: request a connection to `target_public_key`.
    CommunicationRequest {
        /// The requester's public key.
        source_public_key: HexBytes,
        /// The public key being called.
        target_public_key: HexBytes,
    },
    /// peer → peer: acknowledges a `communication_request`, ready for key exchange.
    CommunicationReady,
}

/// Errors produced while validating/decoding a broker message.
#[derive(Debug, Clone)]
pub enum CodecError {
    /// The payload was not valid JSON at all.
    InvalidJson(String),
    /// JSON parsed but didn't match any known `command`, or a required
    /// field was absent/malformed for the command it named.
    InvalidMessage(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson(detail) => write!(f, "invalid json: {detail}"),
            Self::InvalidMessage(detail) => write!(f, "invalid broker message: {detail}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl BrokerMessage {
    /// Encode to the wire JSON text representation.
    ///
    /// # Errors
    ///
    /// Never fails for a well-formed `BrokerMessage`; returns `CodecError`
    /// only if `serde_json` itself errors (e.g. non-finite float, which this
    /// enum never contains).
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|err| CodecError::InvalidMessage(err.to_string()))
    }

    /// Strictly decode and validate a wire JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidJson` for non-JSON payloads, and
    /// `CodecError::InvalidMessage` for JSON that lacks a recognized
    /// `command` or has malformed/missing fields for the command it names.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        serde_json::from_str(text).map_err(|err| {
            // serde_json doesn't distinguish "not JSON" from "wrong shape" in
            // its error type, but the message text does: surface both under
            // InvalidMessage for shape errors, InvalidJson for syntax errors.
            if err.is_syntax() || err.is_eof() {
                CodecError::InvalidJson(err.to_string())
            } else {
                CodecError::InvalidMessage(err.to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_round_trips() {
        let msg = BrokerMessage::Register {
            public_key: HexBytes(vec![0xAB, 0xCD]),
        };
        let encoded = msg.encode().unwrap();
        assert!(encoded.contains("\"command\":\"register\""));
        assert!(encoded.contains("\"abcd\""));
        let decoded = BrokerMessage::decode(&encoded).unwrap();
        match decoded {
            BrokerMessage::Register { public_key } => assert_eq!(public_key.0, vec![0xAB, 0xCD]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn hex_decoding_is_case_insensitive() {
        let decoded = BrokerMessage::decode(r#"{"command":"register","public_key":"ABCD"}"#)
            .unwrap();
        match decoded {
            BrokerMessage::Register { public_key } => assert_eq!(public_key.0, vec![0xAB, 0xCD]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_command_is_invalid_message() {
        let err = BrokerMessage::decode(r#"{"command":"not_a_thing"}"#).unwrap_err();
        assert!(matches!(err, CodecError::InvalidMessage(_)));
    }

    #[test]
    fn missing_required_field_is_invalid_message() {
        let err = BrokerMessage::decode(r#"{"command":"register"}"#).unwrap_err();
        assert!(matches!(err, CodecError::InvalidMessage(_)));
    }

    #[test]
    fn non_json_payload_is_invalid_json() {
        let err = BrokerMessage::decode("not json at all").unwrap_err();
        assert!(matches!(err, CodecError::InvalidJson(_)));
    }

    #[test]
    fn communication_request_round_trips() {
        let msg = BrokerMessage::CommunicationRequest {
            source_public_key: HexBytes(vec![1, 2, 3]),
            target_public_key: HexBytes(vec![4, 5, 6]),
        };
        let encoded = msg.encode().unwrap();
        let decoded = BrokerMessage::decode(&encoded).unwrap();
        match decoded {
            BrokerMessage::CommunicationRequest {
                source_public_key,
                target_public_key,
            } => {
                assert_eq!(source_public_key.0, vec![1, 2, 3]);
                assert_eq!(target_public_key.0, vec![4, 5, 6]);
            }
            _ => panic!("wrong variant"),
        }
    }
}
