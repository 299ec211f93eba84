//! OCPP networking core: request correlation, source routing across
//! networking nodes, payload signatures and encrypted secure envelopes.

pub mod adapter;
pub mod config;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod events;
pub mod ocpp;
pub mod router;
pub mod telemetry;
pub mod transport;

pub use adapter::{Adapter, AdapterSettings, CallOptions, HandlerError, PendingResponse, RequestContext};
pub use domain::{EventTrackingId, NetworkPath, NodeId, OcppResult, RequestId, ResultCode};
pub use envelope::{RequestBuilder, SigningKey};
pub use error::EngineError;
pub use ocpp::Action;
