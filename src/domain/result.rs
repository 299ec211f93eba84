//! # Result Taxonomy
//!
//! Uniform terminal outcome for every request handed to the adapter.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};

use crate::error::EngineError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum ResultCode {
    Ok,
    /// Local request could not be formed, or a response payload did not decode.
    FormationViolation,
    MalformedIdentifier,
    RoutingLoop,
    NoRouteToNode,
    UnknownDestinationKey,
    EncryptionFailure,
    Timeout,
    Cancelled,
    TransportFailure,
    /// Failure reported by the peer, or an unexpected local fault.
    GenericProtocolError,
}

impl ResultCode {
    pub fn is_success(self) -> bool {
        self == ResultCode::Ok
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcppResult {
    pub code: ResultCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Raw response payload of a successful call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl OcppResult {
    pub fn ok(payload: Value) -> Self {
        Self {
            code: ResultCode::Ok,
            description: None,
            details: None,
            payload: Some(payload),
        }
    }

    pub fn error(code: ResultCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
            details: None,
            payload: None,
        }
    }

    pub fn timeout(waited: Duration) -> Self {
        Self::error(
            ResultCode::Timeout,
            format!("no response within {} ms", waited.as_millis()),
        )
    }

    pub fn cancelled() -> Self {
        Self::error(ResultCode::Cancelled, "request cancelled by caller")
    }

    pub fn transport_failure(reason: impl Into<String>) -> Self {
        Self::error(ResultCode::TransportFailure, reason)
    }

    /// CallError returned by the remote peer.
    pub fn peer_error(error_code: &str, description: &str, error_details: Option<Value>) -> Self {
        let description = if description.is_empty() {
            error_code.to_string()
        } else {
            description.to_string()
        };
        Self::error(ResultCode::GenericProtocolError, description).with_details(json!({
            "errorCode": error_code,
            "errorDetails": error_details.unwrap_or(Value::Null),
        }))
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_success()
    }

    /// Error code reported by the peer, when this result came from a CallError.
    pub fn peer_error_code(&self) -> Option<&str> {
        self.details.as_ref()?.get("errorCode")?.as_str()
    }
}

/// Descriptions compare case-insensitively; details and payload never take part.
impl PartialEq for OcppResult {
    fn eq(&self, other: &Self) -> bool {
        if self.code != other.code {
            return false;
        }
        match (&self.description, &other.description) {
            (Some(a), Some(b)) => a.to_lowercase() == b.to_lowercase(),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for OcppResult {}

impl fmt::Display for OcppResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.code, description),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for OcppResult {}

impl From<&EngineError> for ResultCode {
    fn from(error: &EngineError) -> Self {
        match error {
            EngineError::MalformedIdentifier { .. } => ResultCode::MalformedIdentifier,
            EngineError::RoutingLoop(_) | EngineError::HopLimitExceeded(_) => ResultCode::RoutingLoop,
            EngineError::NoRouteToNode(_) => ResultCode::NoRouteToNode,
            EngineError::UnknownDestinationKey { .. } => ResultCode::UnknownDestinationKey,
            EngineError::EncryptionFailure(_) => ResultCode::EncryptionFailure,
            EngineError::DuplicateRequestId(_) | EngineError::Codec(_) => {
                ResultCode::FormationViolation
            }
            EngineError::Transport(_) => ResultCode::TransportFailure,
            EngineError::InvalidSignature(_) | EngineError::Internal(_) => {
                ResultCode::GenericProtocolError
            }
        }
    }
}

impl From<EngineError> for OcppResult {
    fn from(error: EngineError) -> Self {
        OcppResult::error(ResultCode::from(&error), error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeId;

    #[test]
    fn test_equality_ignores_description_case() {
        let a = OcppResult::error(ResultCode::Timeout, "No Response");
        let b = OcppResult::error(ResultCode::Timeout, "no response");
        assert_eq!(a, b);
    }

    #[test]
    fn test_equality_ignores_details_and_payload() {
        let a = OcppResult::ok(json!({"status": "Accepted"}));
        let b = OcppResult::ok(json!({"status": "Rejected"}));
        assert_eq!(a, b);

        let c = OcppResult::error(ResultCode::Cancelled, "x").with_details(json!(1));
        let d = OcppResult::error(ResultCode::Cancelled, "X");
        assert_eq!(c, d);
    }

    #[test]
    fn test_codes_must_match() {
        let a = OcppResult::error(ResultCode::Timeout, "failed");
        let b = OcppResult::error(ResultCode::Cancelled, "failed");
        assert_ne!(a, b);
    }

    #[test]
    fn test_peer_error_details() {
        let result = OcppResult::peer_error("NotImplemented", "", None);
        assert_eq!(result.code, ResultCode::GenericProtocolError);
        assert_eq!(result.peer_error_code(), Some("NotImplemented"));
        assert_eq!(result.description.as_deref(), Some("NotImplemented"));
    }

    #[test]
    fn test_engine_error_mapping() {
        let node = NodeId::new("CS001").unwrap();
        let result: OcppResult = EngineError::NoRouteToNode(node.clone()).into();
        assert_eq!(result.code, ResultCode::NoRouteToNode);
        let result: OcppResult = EngineError::HopLimitExceeded(8).into();
        assert_eq!(result.code, ResultCode::RoutingLoop);
        let result: OcppResult = EngineError::UnknownDestinationKey { node, key_id: 0 }.into();
        assert_eq!(result.code, ResultCode::UnknownDestinationKey);
    }

    #[test]
    fn test_result_code_strings() {
        assert_eq!(ResultCode::NoRouteToNode.to_string(), "NoRouteToNode");
        assert_eq!("Timeout".parse::<ResultCode>().unwrap(), ResultCode::Timeout);
    }
}
