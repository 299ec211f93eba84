//! # Secure Envelope
//!
//! Per-destination symmetric encryption of arbitrary payloads.
//!
//! Frames are sealed with ChaCha20-Poly1305. The AEAD nonce is the 4-byte
//! context nonce followed by the 8-byte big-endian frame counter, so a
//! (key, nonce, counter) triple identifies exactly one frame. Counters are
//! tracked in a ledger keyed by (key fingerprint, nonce) that covers both
//! context-resolved and explicitly supplied counters; any reuse aborts the
//! send with `EncryptionFailure` before anything is transmitted.
//!
//! Secure frames travel as the payload of a regular `SecureDataTransfer`
//! call, so intermediate nodes route them without holding any key.

use parking_lot::Mutex;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::domain::NodeId;
use crate::error::EngineError;
use crate::ocpp::Action;

pub const SECURE_DATA_TRANSFER: &str = "SecureDataTransfer";
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 4;

/// Key slot identifier. Slot 0 is the well-known default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(pub u16);

impl KeyId {
    pub const DEFAULT: KeyId = KeyId(0);
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 256-bit symmetric key, wiped on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(raw: &str) -> Result<Self, EngineError> {
        let mut bytes = hex::decode(raw)
            .map_err(|e| EngineError::EncryptionFailure(format!("key is not hex: {}", e)))?;
        if bytes.len() != KEY_LEN {
            let len = bytes.len();
            bytes.zeroize();
            return Err(EngineError::EncryptionFailure(format!(
                "key must be {} bytes, got {}",
                KEY_LEN, len
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self(key))
    }

    pub fn generate() -> Result<Self, EngineError> {
        let mut bytes = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| EngineError::EncryptionFailure("random key generation failed".to_string()))?;
        Ok(Self(bytes))
    }

    fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn fingerprint(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(digest(&SHA256, &self.0).as_ref());
        out
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

pub fn nonce_from_hex(raw: &str) -> Result<[u8; NONCE_LEN], EngineError> {
    let bytes = hex::decode(raw)
        .map_err(|e| EngineError::EncryptionFailure(format!("nonce is not hex: {}", e)))?;
    <[u8; NONCE_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
        EngineError::EncryptionFailure(format!("nonce must be {} bytes, got {}", NONCE_LEN, bytes.len()))
    })
}

/// Key material registered for one peer and key slot.
#[derive(Clone)]
pub struct EncryptionContext {
    pub key_id: KeyId,
    key: SecretKey,
    pub nonce: [u8; NONCE_LEN],
}

impl EncryptionContext {
    pub fn new(key_id: KeyId, key: SecretKey, nonce: [u8; NONCE_LEN]) -> Self {
        Self { key_id, key, nonce }
    }

    /// Fresh random key and nonce.
    pub fn generate(key_id: KeyId) -> Result<Self, EngineError> {
        let mut nonce = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce)
            .map_err(|_| EngineError::EncryptionFailure("random nonce generation failed".to_string()))?;
        Ok(Self::new(key_id, SecretKey::generate()?, nonce))
    }
}

impl fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("key_id", &self.key_id)
            .field("key", &self.key)
            .field("nonce", &hex::encode(self.nonce))
            .finish()
    }
}

/// Per-send overrides. Anything left unset is resolved from the registered context.
#[derive(Debug, Clone, Default)]
pub struct SecureOptions {
    pub key_id: KeyId,
    pub key: Option<SecretKey>,
    pub nonce: Option<[u8; NONCE_LEN]>,
    pub counter: Option<u64>,
}

impl SecureOptions {
    pub fn with_key_id(key_id: KeyId) -> Self {
        Self {
            key_id,
            ..Default::default()
        }
    }
}

/// Encrypted payload carried by a `SecureDataTransfer` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureFrame {
    pub key_id: KeyId,
    pub counter: u64,
    /// Hex encoded ciphertext with the authentication tag appended.
    pub ciphertext: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecureDataStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureDataTransferResponse {
    pub status: SecureDataStatus,
}

impl Action for SecureFrame {
    const NAME: &'static str = SECURE_DATA_TRANSFER;
    type Response = SecureDataTransferResponse;
}

type LedgerKey = ([u8; 32], [u8; NONCE_LEN]);

#[derive(Default)]
struct KeyStoreInner {
    outbound: HashMap<(NodeId, KeyId), EncryptionContext>,
    inbound: HashMap<(NodeId, KeyId), EncryptionContext>,
    /// Next unused counter per (key fingerprint, nonce).
    counters: HashMap<LedgerKey, u64>,
}

/// Encryption contexts of one node. Rotation and expiry are driven by the
/// owner through `rotate_outbound` and the `remove_*` calls.
#[derive(Default)]
pub struct KeyStore {
    inner: Mutex<KeyStoreInner>,
}

struct Keying {
    key_id: KeyId,
    key: SecretKey,
    nonce: [u8; NONCE_LEN],
    counter: u64,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_outbound(&self, destination: NodeId, context: EncryptionContext) {
        debug!(destination = %destination, key_id = %context.key_id, "Registered outbound encryption context");
        self.inner
            .lock()
            .outbound
            .insert((destination, context.key_id), context);
    }

    pub fn register_inbound(&self, source: NodeId, context: EncryptionContext) {
        debug!(source = %source, key_id = %context.key_id, "Registered inbound encryption context");
        self.inner.lock().inbound.insert((source, context.key_id), context);
    }

    /// Replaces the outbound key for a slot. The new (key, nonce) pair starts a fresh counter.
    pub fn rotate_outbound(&self, destination: NodeId, context: EncryptionContext) -> bool {
        let replaced = self
            .inner
            .lock()
            .outbound
            .insert((destination.clone(), context.key_id), context)
            .is_some();
        debug!(destination = %destination, replaced, "Rotated outbound encryption context");
        replaced
    }

    pub fn remove_outbound(&self, destination: &NodeId, key_id: KeyId) -> bool {
        self.inner
            .lock()
            .outbound
            .remove(&(destination.clone(), key_id))
            .is_some()
    }

    pub fn remove_inbound(&self, source: &NodeId, key_id: KeyId) -> bool {
        self.inner
            .lock()
            .inbound
            .remove(&(source.clone(), key_id))
            .is_some()
    }

    pub fn has_outbound(&self, destination: &NodeId, key_id: KeyId) -> bool {
        self.inner
            .lock()
            .outbound
            .contains_key(&(destination.clone(), key_id))
    }

    /// Next counter that would be used for the registered outbound context.
    pub fn next_counter(&self, destination: &NodeId, key_id: KeyId) -> Option<u64> {
        let inner = self.inner.lock();
        let context = inner.outbound.get(&(destination.clone(), key_id))?;
        let ledger_key = (context.key.fingerprint(), context.nonce);
        Some(inner.counters.get(&ledger_key).copied().unwrap_or(0))
    }

    /// Resolves key material and reserves a counter under one lock, so
    /// concurrent senders to the same destination never share a counter.
    fn reserve(&self, destination: &NodeId, options: &SecureOptions) -> Result<Keying, EngineError> {
        let mut inner = self.inner.lock();
        let context = inner.outbound.get(&(destination.clone(), options.key_id));

        let key = match (&options.key, context) {
            (Some(key), _) => key.clone(),
            (None, Some(context)) => context.key.clone(),
            (None, None) => {
                return Err(EngineError::UnknownDestinationKey {
                    node: destination.clone(),
                    key_id: options.key_id.0,
                })
            }
        };
        let nonce = match (options.nonce, context) {
            (Some(nonce), _) => nonce,
            (None, Some(context)) => context.nonce,
            (None, None) => {
                return Err(EngineError::UnknownDestinationKey {
                    node: destination.clone(),
                    key_id: options.key_id.0,
                })
            }
        };

        let next = inner.counters.entry((key.fingerprint(), nonce)).or_insert(0);
        let counter = match options.counter {
            Some(explicit) if explicit < *next => {
                warn!(
                    destination = %destination,
                    key_id = %options.key_id,
                    counter = explicit,
                    "Refusing to reuse encryption counter"
                );
                return Err(EngineError::EncryptionFailure(format!(
                    "counter {} was already used for this key and nonce",
                    explicit
                )));
            }
            Some(explicit) => explicit,
            None => *next,
        };
        *next = counter
            .checked_add(1)
            .ok_or_else(|| EngineError::EncryptionFailure("counter space exhausted".to_string()))?;

        Ok(Keying {
            key_id: options.key_id,
            key,
            nonce,
            counter,
        })
    }

    fn inbound(&self, source: &NodeId, key_id: KeyId) -> Option<EncryptionContext> {
        self.inner.lock().inbound.get(&(source.clone(), key_id)).cloned()
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("KeyStore")
            .field("outbound", &inner.outbound.len())
            .field("inbound", &inner.inbound.len())
            .finish()
    }
}

pub struct SecureEnvelope;

impl SecureEnvelope {
    /// Encrypts `plaintext` for `destination`.
    pub fn seal(
        keys: &KeyStore,
        destination: &NodeId,
        plaintext: &[u8],
        options: &SecureOptions,
    ) -> Result<SecureFrame, EngineError> {
        let keying = keys.reserve(destination, options)?;
        let ciphertext = seal_frame(
            &keying.key,
            keying.nonce,
            keying.key_id,
            keying.counter,
            plaintext,
        )?;
        debug!(
            destination = %destination,
            key_id = %keying.key_id,
            counter = keying.counter,
            bytes = plaintext.len(),
            "Sealed secure frame"
        );
        Ok(SecureFrame {
            key_id: keying.key_id,
            counter: keying.counter,
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Decrypts a frame received from `source` with the matching inbound context.
    pub fn open(keys: &KeyStore, source: &NodeId, frame: &SecureFrame) -> Result<Vec<u8>, EngineError> {
        let context = keys
            .inbound(source, frame.key_id)
            .ok_or_else(|| EngineError::UnknownDestinationKey {
                node: source.clone(),
                key_id: frame.key_id.0,
            })?;
        let ciphertext = hex::decode(&frame.ciphertext)
            .map_err(|e| EngineError::Codec(format!("ciphertext is not hex: {}", e)))?;
        open_frame(&context.key, context.nonce, frame.key_id, frame.counter, ciphertext)
    }
}

fn frame_nonce(nonce: [u8; NONCE_LEN], counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[..NONCE_LEN].copy_from_slice(&nonce);
    bytes[NONCE_LEN..].copy_from_slice(&counter.to_be_bytes());
    Nonce::assume_unique_for_key(bytes)
}

fn frame_aad(key_id: KeyId, counter: u64) -> [u8; 10] {
    let mut aad = [0u8; 10];
    aad[..2].copy_from_slice(&key_id.0.to_be_bytes());
    aad[2..].copy_from_slice(&counter.to_be_bytes());
    aad
}

fn aead_key(key: &SecretKey) -> Result<LessSafeKey, EngineError> {
    let unbound = UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes())
        .map_err(|_| EngineError::EncryptionFailure("invalid ChaCha20-Poly1305 key".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}

fn seal_frame(
    key: &SecretKey,
    nonce: [u8; NONCE_LEN],
    key_id: KeyId,
    counter: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, EngineError> {
    let mut in_out = plaintext.to_vec();
    aead_key(key)?
        .seal_in_place_append_tag(
            frame_nonce(nonce, counter),
            Aad::from(frame_aad(key_id, counter)),
            &mut in_out,
        )
        .map_err(|_| EngineError::EncryptionFailure("sealing failed".to_string()))?;
    Ok(in_out)
}

fn open_frame(
    key: &SecretKey,
    nonce: [u8; NONCE_LEN],
    key_id: KeyId,
    counter: u64,
    mut in_out: Vec<u8>,
) -> Result<Vec<u8>, EngineError> {
    let len = aead_key(key)?
        .open_in_place(
            frame_nonce(nonce, counter),
            Aad::from(frame_aad(key_id, counter)),
            &mut in_out,
        )
        .map_err(|_| EngineError::EncryptionFailure("authentication failed".to_string()))?
        .len();
    in_out.truncate(len);
    Ok(in_out)
}
