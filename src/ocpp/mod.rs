//! OCPP-J framing for routed messages.
//!
//! This module implements the JSON array framing used by OCPP 1.6J/2.x and
//! extends each frame with a routing header so that messages can cross
//! networking nodes.
//!
//! # Wire format
//! - Call: `[2, id, action, payload, header]`
//! - CallResult: `[3, id, payload, header]`
//! - CallError: `[4, id, errorCode, errorDescription, errorDetails, header]`
//!
//! The header carries the destination, the network path, the event tracking
//! id, a timestamp and, for calls, the timeout and any payload signatures.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use strum::{Display, EnumString};

use crate::domain::{EventTrackingId, NetworkPath, NodeId, RequestId, DEFAULT_MAX_HOPS};
use crate::envelope::{MessageSignature, RequestEnvelope, ResponseBody, ResponseEnvelope};
use crate::error::EngineError;

pub mod messages;

/// One OCPP operation: its action name and the payload type it answers with.
pub trait Action: Serialize + Send {
    const NAME: &'static str;
    type Response: DeserializeOwned + Send;
}

/// OCPP Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl TryFrom<u64> for MessageType {
    type Error = EngineError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::Call),
            3 => Ok(Self::CallResult),
            4 => Ok(Self::CallError),
            other => Err(EngineError::Codec(format!("unknown message type id {}", other))),
        }
    }
}

/// OCPP Error Codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

/// A decoded message, either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

impl Frame {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Frame::Request(envelope) => &envelope.request_id,
            Frame::Response(envelope) => &envelope.request_id,
        }
    }

    pub fn destination(&self) -> &NodeId {
        match self {
            Frame::Request(envelope) => &envelope.destination,
            Frame::Response(envelope) => &envelope.destination,
        }
    }
}

/// Serialization boundary between envelopes and transport bytes.
pub trait Codec: Send + Sync {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, EngineError>;
    fn decode(&self, bytes: &[u8]) -> Result<Frame, EngineError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutingHeader {
    destination: NodeId,
    #[serde(default)]
    network_path: Vec<NodeId>,
    event_tracking_id: EventTrackingId,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    signatures: Vec<MessageSignature>,
}

/// OCPP-J codec with routing headers.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    max_hops: usize,
}

impl JsonCodec {
    pub fn new(max_hops: usize) -> Self {
        Self { max_hops }
    }

    fn header_for_request(envelope: &RequestEnvelope) -> RoutingHeader {
        RoutingHeader {
            destination: envelope.destination.clone(),
            network_path: envelope.network_path.hops().to_vec(),
            event_tracking_id: envelope.event_tracking_id.clone(),
            timestamp: envelope.timestamp,
            timeout_ms: Some(u64::try_from(envelope.timeout.as_millis()).unwrap_or(u64::MAX)),
            signatures: envelope.signatures.clone(),
        }
    }

    fn header_for_response(envelope: &ResponseEnvelope) -> RoutingHeader {
        RoutingHeader {
            destination: envelope.destination.clone(),
            network_path: envelope.network_path.hops().to_vec(),
            event_tracking_id: envelope.event_tracking_id.clone(),
            timestamp: envelope.timestamp,
            timeout_ms: None,
            signatures: Vec::new(),
        }
    }

    fn path(&self, header: &RoutingHeader) -> Result<NetworkPath, EngineError> {
        NetworkPath::from_hops(header.network_path.clone(), self.max_hops)
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HOPS)
    }
}

fn element<'a>(items: &'a [Value], index: usize, what: &str) -> Result<&'a Value, EngineError> {
    items
        .get(index)
        .ok_or_else(|| EngineError::Codec(format!("frame is missing its {}", what)))
}

fn string_element<'a>(items: &'a [Value], index: usize, what: &str) -> Result<&'a str, EngineError> {
    element(items, index, what)?
        .as_str()
        .ok_or_else(|| EngineError::Codec(format!("{} must be a string", what)))
}

fn header_element(items: &[Value], index: usize) -> Result<RoutingHeader, EngineError> {
    let raw = element(items, index, "routing header")?;
    serde_json::from_value(raw.clone()).map_err(|e| EngineError::Codec(format!("routing header: {}", e)))
}

impl Codec for JsonCodec {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, EngineError> {
        let items = match frame {
            Frame::Request(envelope) => vec![
                Value::from(MessageType::Call as u8),
                Value::from(envelope.request_id.as_str()),
                Value::from(envelope.action.as_str()),
                envelope.payload.clone(),
                serde_json::to_value(Self::header_for_request(envelope))?,
            ],
            Frame::Response(envelope) => {
                let header = serde_json::to_value(Self::header_for_response(envelope))?;
                let wire_code = envelope.body.wire_error_code();
                match &envelope.body {
                    ResponseBody::Result(payload) => vec![
                        Value::from(MessageType::CallResult as u8),
                        Value::from(envelope.request_id.as_str()),
                        payload.clone(),
                        header,
                    ],
                    ResponseBody::Error {
                        description,
                        details,
                        ..
                    } => vec![
                        Value::from(MessageType::CallError as u8),
                        Value::from(envelope.request_id.as_str()),
                        Value::from(wire_code.unwrap_or_default()),
                        Value::from(description.as_str()),
                        details.clone().unwrap_or_else(|| json!({})),
                        header,
                    ],
                }
            }
        };
        Ok(serde_json::to_vec(&Value::Array(items))?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Frame, EngineError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let items = value
            .as_array()
            .ok_or_else(|| EngineError::Codec("frame must be a JSON array".to_string()))?;
        let type_id = element(items, 0, "message type id")?
            .as_u64()
            .ok_or_else(|| EngineError::Codec("message type id must be a number".to_string()))?;
        let request_id = RequestId::new(string_element(items, 1, "message id")?)?;

        match MessageType::try_from(type_id)? {
            MessageType::Call => {
                let action = string_element(items, 2, "action")?.to_string();
                let payload = element(items, 3, "payload")?.clone();
                let header = header_element(items, 4)?;
                let network_path = self.path(&header)?;
                Ok(Frame::Request(RequestEnvelope {
                    request_id,
                    action,
                    destination: header.destination,
                    network_path,
                    payload,
                    timestamp: header.timestamp,
                    timeout: Duration::from_millis(header.timeout_ms.unwrap_or_default()),
                    event_tracking_id: header.event_tracking_id,
                    signatures: header.signatures,
                }))
            }
            MessageType::CallResult => {
                let payload = element(items, 2, "payload")?.clone();
                let header = header_element(items, 3)?;
                let network_path = self.path(&header)?;
                Ok(Frame::Response(ResponseEnvelope {
                    request_id,
                    destination: header.destination,
                    network_path,
                    timestamp: header.timestamp,
                    event_tracking_id: header.event_tracking_id,
                    body: ResponseBody::Result(payload),
                }))
            }
            MessageType::CallError => {
                let raw_code = string_element(items, 2, "error code")?;
                let (code, peer_code) = match raw_code.parse::<ErrorCode>() {
                    Ok(code) => (code, None),
                    Err(_) => (ErrorCode::GenericError, Some(raw_code.to_string())),
                };
                let description = string_element(items, 3, "error description")?.to_string();
                let details = element(items, 4, "error details")?.clone();
                let header = header_element(items, 5)?;
                let network_path = self.path(&header)?;
                Ok(Frame::Response(ResponseEnvelope {
                    request_id,
                    destination: header.destination,
                    network_path,
                    timestamp: header.timestamp,
                    event_tracking_id: header.event_tracking_id,
                    body: ResponseBody::Error {
                        code,
                        description,
                        details: Some(details),
                        peer_code,
                    },
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::SigningKey;

    fn node(raw: &str) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    fn request() -> RequestEnvelope {
        RequestEnvelope {
            request_id: RequestId::new("42").unwrap(),
            action: "Reset".to_string(),
            destination: node("CS001"),
            network_path: NetworkPath::from_hops(vec![node("CSMS"), node("NN01")], 8).unwrap(),
            payload: json!({"type": "Immediate"}),
            timestamp: Utc::now(),
            timeout: Duration::from_secs(30),
            event_tracking_id: EventTrackingId::parse("trace").unwrap(),
            signatures: Vec::new(),
        }
    }

    #[test]
    fn test_call_layout() {
        let bytes = JsonCodec::default().encode(&Frame::Request(request())).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value[0], json!(2));
        assert_eq!(value[1], json!("42"));
        assert_eq!(value[2], json!("Reset"));
        assert_eq!(value[4]["networkPath"], json!(["CSMS", "NN01"]));
        assert_eq!(value[4]["timeoutMs"], json!(30_000));
        assert!(value[4].get("signatures").is_none());
    }

    #[test]
    fn test_signed_call_decodes_with_signatures() {
        let codec = JsonCodec::default();
        let mut envelope = request();
        envelope.signatures = vec![SigningKey::generate().unwrap().sign(&envelope.payload)];

        let decoded = codec.decode(&codec.encode(&Frame::Request(envelope.clone())).unwrap()).unwrap();
        let Frame::Request(decoded) = decoded else {
            panic!("expected a request frame");
        };
        assert_eq!(decoded.signatures, envelope.signatures);
        decoded.signatures[0].verify(&decoded.payload).unwrap();
    }

    #[test]
    fn test_call_error_layout() {
        let response = ResponseEnvelope::reply_to(
            &request(),
            &node("NN01"),
            ResponseBody::error(ErrorCode::NotImplemented, "Reset is not supported", None),
        );
        let bytes = JsonCodec::default().encode(&Frame::Response(response)).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value[0], json!(4));
        assert_eq!(value[2], json!("NotImplemented"));
        assert_eq!(value[4], json!({}));
        assert_eq!(value[5]["destination"], json!("CSMS"));
    }

    #[test]
    fn test_unknown_peer_error_code_kept_verbatim() {
        let codec = JsonCodec::default();
        let raw = json!([4, "42", "RpcFrameworkError", "bad frame", {}, {
            "destination": "CSMS",
            "networkPath": ["CS001"],
            "eventTrackingId": "trace",
            "timestamp": "2024-01-01T00:00:00Z"
        }]);
        let Frame::Response(response) = codec.decode(raw.to_string().as_bytes()).unwrap() else {
            panic!("expected a response frame");
        };
        assert!(matches!(
            &response.body,
            ResponseBody::Error { code: ErrorCode::GenericError, peer_code: Some(code), .. } if code == "RpcFrameworkError"
        ));

        let relayed: Value = serde_json::from_slice(&codec.encode(&Frame::Response(response)).unwrap()).unwrap();
        assert_eq!(relayed[2], json!("RpcFrameworkError"));

        let raw = raw.to_string().replace("RpcFrameworkError", "SecurityError");
        let Frame::Response(response) = codec.decode(raw.as_bytes()).unwrap() else {
            panic!("expected a response frame");
        };
        assert_eq!(response.body.wire_error_code().as_deref(), Some("SecurityError"));
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        let codec = JsonCodec::default();
        for raw in [
            r#"{"not":"an array"}"#,
            r#"[9, "1", "Reset", {}, {}]"#,
            r#"[2, 1, "Reset", {}, {}]"#,
            r#"[2, "1", "Reset", {}]"#,
            r#"[3, "1", {}]"#,
            "not json",
        ] {
            let err = codec.decode(raw.as_bytes()).unwrap_err();
            assert!(
                matches!(err, EngineError::Codec(_) | EngineError::MalformedIdentifier { .. }),
                "{} decoded as {:?}",
                raw,
                err
            );
        }
    }

    #[test]
    fn test_decode_rejects_looping_path() {
        let raw = json!([3, "1", {}, {
            "destination": "CSMS",
            "networkPath": ["NN01", "CSMS", "NN01"],
            "eventTrackingId": "t",
            "timestamp": "2024-01-01T00:00:00Z"
        }]);
        let err = JsonCodec::default()
            .decode(&serde_json::to_vec(&raw).unwrap())
            .unwrap_err();
        assert!(matches!(err, EngineError::RoutingLoop(_)));
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::FormationViolation.to_string(), "FormationViolation");
        assert_eq!(ErrorCode::GenericError.to_string(), "GenericError");
    }
}
