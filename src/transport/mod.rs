//! # Transport Boundary
//!
//! The adapter hands encoded frames to a `Transport` and learns about inbound
//! frames and peer connectivity through a stream of `TransportEvent`s.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::NodeId;

pub mod loopback;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use loopback::{LoopbackNetwork, LoopbackTransport};

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Not connected to {0}")]
    NotConnected(NodeId),

    #[error("Connection to {0} closed")]
    Closed(NodeId),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Outbound half of a connection table. `send` either accepts the frame for
/// delivery to the directly connected `next_hop` or fails immediately.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, next_hop: &NodeId, frame: Vec<u8>) -> Result<(), TransportError>;
}

/// Inbound notifications, consumed by `Adapter::attach`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(NodeId),
    Disconnected(NodeId),
    Frame { from: NodeId, bytes: Vec<u8> },
}
