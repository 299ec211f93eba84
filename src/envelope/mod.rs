//! # Message Envelopes
//!
//! Fully populated request/response envelopes and the builder that fills in
//! defaults for everything the caller leaves unset.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::domain::{EventTrackingId, NetworkPath, NodeId, RequestId};
use crate::error::EngineError;
use crate::ocpp::ErrorCode;

pub mod secure;
pub mod signature;

pub use secure::{
    EncryptionContext, KeyId, KeyStore, SecretKey, SecureDataStatus, SecureDataTransferResponse,
    SecureEnvelope, SecureFrame, SecureOptions, SECURE_DATA_TRANSFER,
};
pub use signature::{canonical_json, sign_all, MessageSignature, SigningKey};

/// A request ready for transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    pub action: String,
    pub destination: NodeId,
    pub network_path: NetworkPath,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub timeout: Duration,
    pub event_tracking_id: EventTrackingId,
    pub signatures: Vec<MessageSignature>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Result(Value),
    Error {
        code: ErrorCode,
        description: String,
        details: Option<Value>,
        /// Code exactly as a peer sent it, when it is outside the OCPP set.
        /// `code` is `GenericError` in that case.
        peer_code: Option<String>,
    },
}

impl ResponseBody {
    pub fn error(code: ErrorCode, description: impl Into<String>, details: Option<Value>) -> Self {
        ResponseBody::Error {
            code,
            description: description.into(),
            details,
            peer_code: None,
        }
    }

    /// Error code to put on the wire or report to the caller.
    pub fn wire_error_code(&self) -> Option<String> {
        match self {
            ResponseBody::Result(_) => None,
            ResponseBody::Error { code, peer_code, .. } => {
                Some(peer_code.clone().unwrap_or_else(|| code.to_string()))
            }
        }
    }
}

/// A CallResult or CallError travelling back along the reversed request path.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub request_id: RequestId,
    pub destination: NodeId,
    pub network_path: NetworkPath,
    pub timestamp: DateTime<Utc>,
    pub event_tracking_id: EventTrackingId,
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    /// Reply to `request`, addressed to its originator. `fallback_origin` is used
    /// when the request carried no path, i.e. it came straight from a peer.
    pub fn reply_to(request: &RequestEnvelope, fallback_origin: &NodeId, body: ResponseBody) -> Self {
        let destination = request
            .network_path
            .origin()
            .cloned()
            .unwrap_or_else(|| fallback_origin.clone());
        let network_path = if request.network_path.is_empty() {
            NetworkPath::from_node(destination.clone()).with_max_hops(request.network_path.max_hops())
        } else {
            request.network_path.reversed()
        };
        Self {
            request_id: request.request_id.clone(),
            destination,
            network_path,
            timestamp: Utc::now(),
            event_tracking_id: request.event_tracking_id.clone(),
            body,
        }
    }
}

/// Adapter-wide values used for anything the caller did not supply.
pub struct EnvelopeDefaults<'a> {
    pub local: &'a NodeId,
    pub default_timeout: Duration,
    pub max_hops: usize,
    pub next_request_id: &'a (dyn Fn() -> RequestId + Sync),
}

/// Assembles a `RequestEnvelope`. Has no side effects beyond construction and signing.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    destination: NodeId,
    action: String,
    payload: Value,
    request_id: Option<RequestId>,
    timestamp: Option<DateTime<Utc>>,
    timeout: Option<Duration>,
    event_tracking_id: Option<EventTrackingId>,
    network_path: Option<NetworkPath>,
    signing_keys: Vec<SigningKey>,
}

impl RequestBuilder {
    pub fn new(destination: NodeId, action: impl Into<String>, payload: Value) -> Self {
        Self {
            destination,
            action: action.into(),
            payload,
            request_id: None,
            timestamp: None,
            timeout: None,
            event_tracking_id: None,
            network_path: None,
            signing_keys: Vec::new(),
        }
    }

    pub fn request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn event_tracking_id(mut self, event_tracking_id: EventTrackingId) -> Self {
        self.event_tracking_id = Some(event_tracking_id);
        self
    }

    pub fn network_path(mut self, network_path: NetworkPath) -> Self {
        self.network_path = Some(network_path);
        self
    }

    pub fn signed_by(mut self, key: SigningKey) -> Self {
        self.signing_keys.push(key);
        self
    }

    pub fn signing_keys(mut self, keys: impl IntoIterator<Item = SigningKey>) -> Self {
        self.signing_keys.extend(keys);
        self
    }

    pub fn destination(&self) -> &NodeId {
        &self.destination
    }

    /// The id set with `request_id`, if any.
    pub fn explicit_request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn build(self, defaults: &EnvelopeDefaults<'_>) -> Result<RequestEnvelope, EngineError> {
        if self.action.is_empty() {
            return Err(EngineError::Codec("action name must not be empty".to_string()));
        }
        let request_id = self
            .request_id
            .unwrap_or_else(|| (defaults.next_request_id)());
        let timestamp = self.timestamp.unwrap_or_else(Utc::now);
        let timeout = self.timeout.unwrap_or(defaults.default_timeout);
        let event_tracking_id = self
            .event_tracking_id
            .unwrap_or_else(EventTrackingId::generate);
        let network_path = self
            .network_path
            .unwrap_or_else(|| NetworkPath::from_node(defaults.local.clone()))
            .with_max_hops(defaults.max_hops);
        let signatures = sign_all(&self.signing_keys, &self.payload);

        Ok(RequestEnvelope {
            request_id,
            action: self.action,
            destination: self.destination,
            network_path,
            payload: self.payload,
            timestamp,
            timeout,
            event_tracking_id,
            signatures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RequestIdGenerator;
    use serde_json::json;

    fn node(raw: &str) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    fn build(builder: RequestBuilder) -> RequestEnvelope {
        let local = node("CSMS");
        let ids = RequestIdGenerator::with_prefix("t").unwrap();
        let next = move || ids.next_id();
        let defaults = EnvelopeDefaults {
            local: &local,
            default_timeout: Duration::from_secs(30),
            max_hops: 4,
            next_request_id: &next,
        };
        builder.build(&defaults).unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let before = Utc::now();
        let envelope = build(RequestBuilder::new(node("CS001"), "Reset", json!({"type": "Immediate"})));

        assert_eq!(envelope.request_id.as_str(), "t-1");
        assert_eq!(envelope.timeout, Duration::from_secs(30));
        assert_eq!(envelope.network_path.hops(), &[node("CSMS")]);
        assert_eq!(envelope.network_path.max_hops(), 4);
        assert!(envelope.timestamp >= before);
        assert!(envelope.signatures.is_empty());
    }

    #[test]
    fn test_caller_values_win() {
        let tracking = EventTrackingId::parse("trace-1").unwrap();
        let envelope = build(
            RequestBuilder::new(node("CS001"), "Reset", json!({}))
                .request_id(RequestId::new("fixed").unwrap())
                .timeout(Duration::from_millis(250))
                .event_tracking_id(tracking.clone())
                .network_path(NetworkPath::from_node(node("NN01"))),
        );

        assert_eq!(envelope.request_id.as_str(), "fixed");
        assert_eq!(envelope.timeout, Duration::from_millis(250));
        assert_eq!(envelope.event_tracking_id, tracking);
        assert_eq!(envelope.network_path.origin(), Some(&node("NN01")));
    }

    #[test]
    fn test_signing_keys_attach_signatures() {
        let keys = [SigningKey::generate().unwrap(), SigningKey::generate().unwrap()];
        let payload = json!({"key": "MeterValueSampleInterval", "value": "60"});
        let envelope = build(RequestBuilder::new(node("CS001"), "ChangeConfiguration", payload.clone()).signing_keys(keys));

        assert_eq!(envelope.signatures.len(), 2);
        for signature in &envelope.signatures {
            signature.verify(&envelope.payload).unwrap();
        }
        assert_eq!(envelope.payload, payload);
    }

    #[test]
    fn test_reply_routes_back_to_origin() {
        let request = build(
            RequestBuilder::new(node("CS001"), "Reset", json!({}))
                .network_path(NetworkPath::from_hops(vec![node("CSMS"), node("NN01")], 8).unwrap()),
        );
        let reply = ResponseEnvelope::reply_to(&request, &node("NN01"), ResponseBody::Result(json!({})));

        assert_eq!(reply.destination, node("CSMS"));
        assert_eq!(reply.network_path.hops(), &[node("NN01"), node("CSMS")]);
        assert_eq!(reply.request_id, request.request_id);
        assert_eq!(reply.event_tracking_id, request.event_tracking_id);
    }

    #[test]
    fn test_empty_action_rejected() {
        let local = node("CSMS");
        let ids = RequestIdGenerator::new();
        let next = move || ids.next_id();
        let defaults = EnvelopeDefaults {
            local: &local,
            default_timeout: Duration::from_secs(1),
            max_hops: 8,
            next_request_id: &next,
        };
        let err = RequestBuilder::new(node("CS001"), "", json!({})).build(&defaults).unwrap_err();
        assert!(matches!(err, EngineError::Codec(_)));
    }
}
