use thiserror::Error;

use crate::domain::{NodeId, RequestId};
use crate::transport::TransportError;

/// Engine failures that are known before a request enters the pending table,
/// plus the receive-side failures the adapter converts into values.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Malformed {kind}: {reason}")]
    MalformedIdentifier { kind: &'static str, reason: String },

    #[error("Routing loop: {0} is already on the network path")]
    RoutingLoop(NodeId),

    #[error("Network path would exceed the limit of {0} hops")]
    HopLimitExceeded(usize),

    #[error("No route to node {0}")]
    NoRouteToNode(NodeId),

    #[error("No encryption key {key_id} registered for {node}")]
    UnknownDestinationKey { node: NodeId, key_id: u16 },

    #[error("Encryption failure: {0}")]
    EncryptionFailure(String),

    #[error("Signature verification failed: {0}")]
    InvalidSignature(String),

    #[error("Request id {0} is already pending")]
    DuplicateRequestId(RequestId),

    #[error("Formation violation: {0}")]
    Codec(String),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub(crate) fn malformed(kind: &'static str, reason: impl Into<String>) -> Self {
        EngineError::MalformedIdentifier {
            kind,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Codec(error.to_string())
    }
}
