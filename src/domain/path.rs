//! # Network Path
//!
//! Source route carried by every routed message. Requests grow the path one hop
//! per forwarding node; responses travel back along the reversed path.

use serde::{Serialize, Serializer};

use super::NodeId;
use crate::error::EngineError;

/// Default bound on the number of hops a path may record.
pub const DEFAULT_MAX_HOPS: usize = 8;

#[derive(Debug, Clone)]
pub struct NetworkPath {
    hops: Vec<NodeId>,
    max_hops: usize,
}

impl NetworkPath {
    pub fn empty() -> Self {
        Self {
            hops: Vec::new(),
            max_hops: DEFAULT_MAX_HOPS,
        }
    }

    /// Single-hop path originating at `node`.
    pub fn from_node(node: NodeId) -> Self {
        Self {
            hops: vec![node],
            max_hops: DEFAULT_MAX_HOPS,
        }
    }

    /// Rebuilds a path received from the wire, enforcing the same rules as `append`.
    pub fn from_hops(hops: Vec<NodeId>, max_hops: usize) -> Result<Self, EngineError> {
        let mut path = Self {
            hops: Vec::with_capacity(hops.len()),
            max_hops,
        };
        for hop in hops {
            path = path.append(hop)?;
        }
        Ok(path)
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn max_hops(&self) -> usize {
        self.max_hops
    }

    /// Returns a new path with `hop` at the end.
    pub fn append(&self, hop: NodeId) -> Result<Self, EngineError> {
        if self.contains(&hop) {
            return Err(EngineError::RoutingLoop(hop));
        }
        if self.hops.len() >= self.max_hops {
            return Err(EngineError::HopLimitExceeded(self.max_hops));
        }
        let mut hops = self.hops.clone();
        hops.push(hop);
        Ok(Self {
            hops,
            max_hops: self.max_hops,
        })
    }

    pub fn reversed(&self) -> Self {
        Self {
            hops: self.hops.iter().rev().cloned().collect(),
            max_hops: self.max_hops,
        }
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.hops.contains(node)
    }

    /// The node that originated the message.
    pub fn origin(&self) -> Option<&NodeId> {
        self.hops.first()
    }

    pub fn last(&self) -> Option<&NodeId> {
        self.hops.last()
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Consumes the leading hop of a response route once `node` has handled it.
    pub(crate) fn strip_leading(&self, node: &NodeId) -> Self {
        match self.hops.first() {
            Some(first) if first == node => Self {
                hops: self.hops[1..].to_vec(),
                max_hops: self.max_hops,
            },
            _ => self.clone(),
        }
    }
}

impl Default for NetworkPath {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<NodeId> for NetworkPath {
    fn from(node: NodeId) -> Self {
        Self::from_node(node)
    }
}

impl PartialEq for NetworkPath {
    fn eq(&self, other: &Self) -> bool {
        self.hops == other.hops
    }
}

impl Eq for NetworkPath {}

impl Serialize for NetworkPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.hops.serialize(serializer)
    }
}
