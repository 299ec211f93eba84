//! # Identifiers
//!
//! Validated value types used to key the engine's tables. All of them compare
//! case-sensitively and hash structurally.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::error::EngineError;

/// Reserved node id naming the central system itself.
pub const CSMS_NODE_ID: &str = "CSMS";

pub const MAX_NODE_ID_LEN: usize = 128;

/// OCPP-J limits message ids to 36 characters.
pub const MAX_REQUEST_ID_LEN: usize = 36;

pub const MAX_EVENT_TRACKING_ID_LEN: usize = 64;

/// Identifiers travel inside URLs and JSON strings, so only visible ASCII is accepted.
fn validate_token(kind: &'static str, raw: &str, max_len: usize) -> Result<(), EngineError> {
    if raw.is_empty() {
        return Err(EngineError::malformed(kind, "must not be empty"));
    }
    if raw.len() > max_len {
        return Err(EngineError::malformed(
            kind,
            format!("{} characters exceeds the limit of {}", raw.len(), max_len),
        ));
    }
    if let Some(bad) = raw.chars().find(|c| !c.is_ascii_graphic()) {
        return Err(EngineError::malformed(
            kind,
            format!("invalid character {:?} in {:?}", bad, raw),
        ));
    }
    Ok(())
}

/// Identity of a charging station, the CSMS, or a networking node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    pub fn new(raw: impl Into<String>) -> Result<Self, EngineError> {
        let raw = raw.into();
        validate_token("node id", &raw, MAX_NODE_ID_LEN)?;
        Ok(Self(raw))
    }

    pub fn csms() -> Self {
        Self(CSMS_NODE_ID.to_string())
    }

    pub fn is_csms(&self) -> bool {
        self.0 == CSMS_NODE_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NodeId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl FromStr for NodeId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlates one outgoing request with its single response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestId(String);

impl RequestId {
    pub fn new(raw: impl Into<String>) -> Result<Self, EngineError> {
        let raw = raw.into();
        validate_token("request id", &raw, MAX_REQUEST_ID_LEN)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RequestId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RequestId> for String {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

impl FromStr for RequestId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ties together every message belonging to one logical operation, across hops.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventTrackingId(String);

impl EventTrackingId {
    /// Fresh random tracking id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(raw: impl Into<String>) -> Result<Self, EngineError> {
        let raw = raw.into();
        validate_token("event tracking id", &raw, MAX_EVENT_TRACKING_ID_LEN)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EventTrackingId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EventTrackingId> for String {
    fn from(id: EventTrackingId) -> Self {
        id.0
    }
}

impl fmt::Display for EventTrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out request ids for one adapter: a random session prefix plus a
/// monotonically increasing counter, so restarts never reuse earlier ids.
#[derive(Debug)]
pub struct RequestIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        let mut prefix = Uuid::new_v4().simple().to_string();
        prefix.truncate(8);
        Self {
            prefix,
            next: AtomicU64::new(1),
        }
    }

    /// Prefix must leave room for the counter within the 36 character limit.
    pub fn with_prefix(prefix: impl Into<String>) -> Result<Self, EngineError> {
        let prefix = prefix.into();
        validate_token("request id prefix", &prefix, 15)?;
        Ok(Self {
            prefix,
            next: AtomicU64::new(1),
        })
    }

    pub fn next_id(&self) -> RequestId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        RequestId(format!("{}-{}", self.prefix, n))
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
