//! # Signature Attachment
//!
//! Ed25519 signatures over a canonical serialization of a message payload.
//! Signing is deterministic for a fixed (payload, key) pair. Verification is
//! left to the business layer; `MessageSignature::verify` is provided for it.

use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::EngineError;

pub const SIGNATURE_ALGORITHM: &str = "Ed25519";

/// A key pair able to sign outgoing payloads. Cheap to clone.
#[derive(Clone)]
pub struct SigningKey {
    pair: Arc<Ed25519KeyPair>,
    public_key_hex: String,
    signer: Option<String>,
}

impl SigningKey {
    pub fn generate() -> Result<Self, EngineError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| EngineError::Internal("Ed25519 key generation failed".to_string()))?;
        Self::from_pkcs8(pkcs8.as_ref())
    }

    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self, EngineError> {
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| EngineError::Internal(format!("rejected Ed25519 key: {}", e)))?;
        let public_key_hex = hex::encode(pair.public_key().as_ref());
        Ok(Self {
            pair: Arc::new(pair),
            public_key_hex,
            signer: None,
        })
    }

    /// Human readable identity recorded next to the signature.
    pub fn with_signer(mut self, signer: impl Into<String>) -> Self {
        self.signer = Some(signer.into());
        self
    }

    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    pub fn sign(&self, payload: &Value) -> MessageSignature {
        let signature = self.pair.sign(&canonical_json(payload));
        MessageSignature {
            key_id: self.public_key_hex.clone(),
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            value: hex::encode(signature.as_ref()),
            signer: self.signer.clone(),
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("public_key", &self.public_key_hex)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

/// Signature attached to a request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSignature {
    /// Hex encoded public key of the signer.
    pub key_id: String,
    pub algorithm: String,
    /// Hex encoded signature bytes.
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
}

impl MessageSignature {
    pub fn verify(&self, payload: &Value) -> Result<(), EngineError> {
        if self.algorithm != SIGNATURE_ALGORITHM {
            return Err(EngineError::InvalidSignature(format!(
                "unsupported algorithm {}",
                self.algorithm
            )));
        }
        let public_key = hex::decode(&self.key_id)
            .map_err(|e| EngineError::InvalidSignature(format!("key id: {}", e)))?;
        let signature = hex::decode(&self.value)
            .map_err(|e| EngineError::InvalidSignature(format!("signature value: {}", e)))?;
        UnparsedPublicKey::new(&ED25519, public_key)
            .verify(&canonical_json(payload), &signature)
            .map_err(|_| EngineError::InvalidSignature(format!("bad signature by {}", self.key_id)))
    }
}

/// One signature per key, all over the same canonical bytes.
pub fn sign_all(keys: &[SigningKey], payload: &Value) -> Vec<MessageSignature> {
    keys.iter().map(|key| key.sign(payload)).collect()
}

/// Compact JSON with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(Value::String(key.clone()).to_string().as_bytes());
                out.push(b':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"d": [1, "x"], "c": null}});
        assert_eq!(
            String::from_utf8(canonical_json(&value)).unwrap(),
            r#"{"a":{"c":null,"d":[1,"x"]},"b":1}"#
        );
    }

    #[test]
    fn test_signing_is_deterministic() {
        let key = SigningKey::generate().unwrap();
        let payload = json!({"type": "Immediate", "evseId": 1});
        assert_eq!(key.sign(&payload), key.sign(&payload));
    }

    #[test]
    fn test_two_keys_sign_and_verify_independently() {
        let alice = SigningKey::generate().unwrap().with_signer("alice");
        let bob = SigningKey::generate().unwrap().with_signer("bob");
        let payload = json!({"key": "HeartbeatInterval", "value": "300"});

        let signatures = sign_all(&[alice.clone(), bob.clone()], &payload);
        assert_eq!(signatures.len(), 2);
        assert_ne!(signatures[0].value, signatures[1].value);
        assert_eq!(signatures[0].key_id, alice.public_key_hex());
        assert_eq!(signatures[1].key_id, bob.public_key_hex());
        for signature in &signatures {
            signature.verify(&payload).unwrap();
        }
    }

    #[test]
    fn test_verify_detects_tampering() {
        let key = SigningKey::generate().unwrap();
        let signature = key.sign(&json!({"value": "300"}));
        let err = signature.verify(&json!({"value": "301"})).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSignature(_)));
    }

    #[test]
    fn test_verify_is_independent_of_key_order() {
        let key = SigningKey::generate().unwrap();
        let signature = key.sign(&json!({"a": 1, "b": 2}));
        let reordered: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        signature.verify(&reordered).unwrap();
    }

    #[test]
    fn test_no_keys_is_unsigned() {
        assert!(sign_all(&[], &json!({})).is_empty());
    }

    #[test]
    fn test_debug_does_not_expose_private_key() {
        let key = SigningKey::generate().unwrap();
        let debug = format!("{:?}", key);
        assert!(debug.contains(key.public_key_hex()));
        assert!(!debug.contains("pair"));
    }
}
