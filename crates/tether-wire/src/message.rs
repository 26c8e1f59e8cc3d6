//! Handshake messages.
//!
//! The first exchange on every connection is JSON: the connecting side
//! sends a [`HandshakeMessage::Hello`], the accepting side answers with
//! [`HandshakeMessage::Welcome`] or [`HandshakeMessage::Refused`]. Every
//! later body on the connection is a binary frame (see [`crate::frame`]).
//! Both phases share the same outer framing: a 4-byte big-endian length
//! header followed by the body.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tether_types::EndpointId;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

type HmacSha256 = Hmac<Sha256>;

/// Identity proof: HMAC-SHA256 over `nonce || endpoint_id`, hex encoded.
pub fn hmac_sign(secret: &str, nonce: &str, endpoint: &EndpointId) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(nonce.as_bytes());
    mac.update(endpoint.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Check a proof with a constant-time comparison.
pub fn hmac_verify(secret: &str, nonce: &str, endpoint: &EndpointId, proof: &str) -> bool {
    let expected = hmac_sign(secret, nonce, endpoint);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), proof.as_bytes()).into()
}

/// Identity block carried by both handshake directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub endpoint_id: EndpointId,
    pub name: String,
    pub protocol_version: u32,
    /// Random nonce the proof is computed over.
    #[serde(default)]
    pub nonce: String,
    /// Empty when the sender has no shared secret configured.
    #[serde(default)]
    pub auth_hmac: String,
}

impl Identity {
    /// Build our identity, signing it when a secret is configured.
    pub fn local(endpoint_id: EndpointId, name: &str, secret: Option<&str>) -> Self {
        let nonce = uuid::Uuid::new_v4().to_string();
        let auth_hmac = secret
            .map(|s| hmac_sign(s, &nonce, &endpoint_id))
            .unwrap_or_default();
        Self {
            endpoint_id,
            name: name.to_string(),
            protocol_version: PROTOCOL_VERSION,
            nonce,
            auth_hmac,
        }
    }

    /// True when the proof matches `secret`.
    pub fn verify(&self, secret: &str) -> bool {
        hmac_verify(secret, &self.nonce, &self.endpoint_id, &self.auth_hmac)
    }
}

/// Handshake bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// Sent by the connecting side.
    Hello(Identity),
    /// Accepted; carries the accepting side's identity.
    Welcome(Identity),
    /// Rejected before any frame was exchanged.
    Refused { code: u16, message: String },
}

/// Encode a handshake message with its length header.
pub fn encode_message(msg: &HandshakeMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the 4-byte length header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Decode a handshake body (without its header).
pub fn decode_message(body: &[u8]) -> Result<HandshakeMessage, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = HandshakeMessage::Hello(Identity::local(EndpointId::new(), "robot", None));
        let bytes = encode_message(&msg).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        match decode_message(&bytes[4..]).unwrap() {
            HandshakeMessage::Hello(id) => {
                assert_eq!(id.name, "robot");
                assert_eq!(id.protocol_version, PROTOCOL_VERSION);
                assert!(id.auth_hmac.is_empty());
            }
            other => panic!("Expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn test_tagged_json_shape() {
        let msg = HandshakeMessage::Refused {
            code: 403,
            message: "bad proof".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "refused");
        assert_eq!(json["code"], 403);
    }

    #[test]
    fn test_proof_checks_secret_and_identity() {
        let id = Identity::local(EndpointId::new(), "a", Some("s3cret"));
        assert!(id.verify("s3cret"));
        assert!(!id.verify("other"));

        let mut forged = id.clone();
        forged.endpoint_id = EndpointId::new();
        assert!(!forged.verify("s3cret"));
    }

    #[test]
    fn test_missing_proof_fields_default() {
        let endpoint = EndpointId::new();
        let json = format!(
            r#"{{"type":"welcome","endpoint_id":"{endpoint}","name":"b","protocol_version":1}}"#
        );
        match decode_message(json.as_bytes()).unwrap() {
            HandshakeMessage::Welcome(id) => {
                assert!(id.nonce.is_empty());
                assert!(!id.verify("s3cret"));
            }
            other => panic!("Expected Welcome, got {other:?}"),
        }
    }
}
