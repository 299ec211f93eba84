//! # Router
//!
//! Maps a destination to the directly connected neighbour a frame should be
//! handed to, and maintains the source route recorded in each message.
//!
//! Resolution order for a destination: a direct connection, then a static
//! route (whose gateway must be connected), then the default route. Anything
//! else fails immediately with `NoRouteToNode`; nothing is ever queued.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::RoutingConfig;
use crate::domain::{NetworkPath, NodeId};
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub next_hop: NodeId,
    pub network_path: NetworkPath,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connected_at: DateTime<Utc>,
}

pub struct Router {
    local: NodeId,
    max_hops: usize,
    connections: RwLock<HashMap<NodeId, ConnectionInfo>>,
    routes: RwLock<HashMap<NodeId, NodeId>>,
    default_route: RwLock<Option<NodeId>>,
}

impl Router {
    pub fn new(local: NodeId, max_hops: usize) -> Self {
        Self {
            local,
            max_hops,
            connections: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            default_route: RwLock::new(None),
        }
    }

    pub fn from_config(local: NodeId, config: &RoutingConfig) -> Result<Self, EngineError> {
        let router = Self::new(local, config.max_hops);
        for (destination, via) in &config.routes {
            router.add_route(NodeId::new(destination.as_str())?, NodeId::new(via.as_str())?);
        }
        if let Some(uplink) = &config.default_route {
            router.set_default_route(Some(NodeId::new(uplink.as_str())?));
        }
        Ok(router)
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    pub fn max_hops(&self) -> usize {
        self.max_hops
    }

    /// Returns false if the peer was already connected.
    pub fn add_connection(&self, peer: NodeId) -> bool {
        let mut connections = self.connections.write();
        if connections.contains_key(&peer) {
            return false;
        }
        info!(peer = %peer, "Peer connected");
        connections.insert(
            peer,
            ConnectionInfo {
                connected_at: Utc::now(),
            },
        );
        true
    }

    pub fn remove_connection(&self, peer: &NodeId) -> bool {
        let removed = self.connections.write().remove(peer).is_some();
        if removed {
            info!(peer = %peer, "Peer disconnected");
        }
        removed
    }

    pub fn is_connected(&self, peer: &NodeId) -> bool {
        self.connections.read().contains_key(peer)
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.connections.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Reach `destination` through the neighbour `via`.
    pub fn add_route(&self, destination: NodeId, via: NodeId) {
        debug!(destination = %destination, via = %via, "Static route added");
        self.routes.write().insert(destination, via);
    }

    pub fn remove_route(&self, destination: &NodeId) -> Option<NodeId> {
        self.routes.write().remove(destination)
    }

    /// Uplink used for destinations with no direct connection or static route.
    pub fn set_default_route(&self, via: Option<NodeId>) {
        debug!(via = ?via.as_ref().map(NodeId::as_str), "Default route set");
        *self.default_route.write() = via;
    }

    pub fn next_hop(&self, destination: &NodeId) -> Result<NodeId, EngineError> {
        let connections = self.connections.read();
        if connections.contains_key(destination) {
            return Ok(destination.clone());
        }
        if let Some(via) = self.routes.read().get(destination) {
            if connections.contains_key(via) {
                return Ok(via.clone());
            }
        }
        if let Some(uplink) = self.default_route.read().as_ref() {
            if connections.contains_key(uplink) {
                return Ok(uplink.clone());
            }
        }
        Err(EngineError::NoRouteToNode(destination.clone()))
    }

    /// Route for a request originating at this node.
    pub fn route_request(&self, request: &RequestEnvelope) -> Result<RouteDecision, EngineError> {
        let destination = &request.destination;
        if *destination == self.local || request.network_path.contains(destination) {
            return Err(EngineError::RoutingLoop(destination.clone()));
        }
        let network_path = if request.network_path.contains(&self.local) {
            request.network_path.clone()
        } else {
            request.network_path.append(self.local.clone())?
        };
        let next_hop = self.next_hop(destination)?;
        Ok(RouteDecision {
            next_hop,
            network_path,
        })
    }

    /// Route for a request that arrived here but is addressed to another node.
    /// This node is recorded on the path so the response can find its way back.
    pub fn forward_request(&self, request: &RequestEnvelope) -> Result<RouteDecision, EngineError> {
        let destination = &request.destination;
        if request.network_path.contains(destination) {
            return Err(EngineError::RoutingLoop(destination.clone()));
        }
        let network_path = request.network_path.append(self.local.clone())?;
        let next_hop = self.next_hop(destination)?;
        if next_hop != *destination && network_path.contains(&next_hop) {
            return Err(EngineError::RoutingLoop(next_hop));
        }
        Ok(RouteDecision {
            next_hop,
            network_path,
        })
    }

    /// Route for a response, following the reversed request path. If the
    /// recorded hop is no longer connected, falls back to destination routing.
    pub fn route_response(&self, response: &ResponseEnvelope) -> Result<RouteDecision, EngineError> {
        let network_path = response.network_path.strip_leading(&self.local);
        if let Some(front) = network_path.origin() {
            if *front != self.local && self.is_connected(front) {
                return Ok(RouteDecision {
                    next_hop: front.clone(),
                    network_path,
                });
            }
        }
        let next_hop = self.next_hop(&response.destination)?;
        Ok(RouteDecision {
            next_hop,
            network_path,
        })
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("local", &self.local)
            .field("max_hops", &self.max_hops)
            .field("connections", &self.connected_peers())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ResponseBody;
    use rstest::rstest;
    use serde_json::json;
    use std::time::Duration;

    fn node(raw: &str) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    fn request(destination: &str, path: &[&str]) -> RequestEnvelope {
        RequestEnvelope {
            request_id: crate::domain::RequestId::new("r1").unwrap(),
            action: "Heartbeat".to_string(),
            destination: node(destination),
            network_path: NetworkPath::from_hops(path.iter().map(|n| node(n)).collect(), 8).unwrap(),
            payload: json!({}),
            timestamp: Utc::now(),
            timeout: Duration::from_secs(1),
            event_tracking_id: crate::domain::EventTrackingId::generate(),
            signatures: Vec::new(),
        }
    }

    fn router(local: &str, peers: &[&str]) -> Router {
        let router = Router::new(node(local), 8);
        for peer in peers {
            router.add_connection(node(peer));
        }
        router
    }

    #[rstest]
    #[case::direct(&["CS001", "NN01"], None, None, Some("CS001"))]
    #[case::static_route(&["NN01"], Some("NN01"), None, Some("NN01"))]
    #[case::static_route_down(&["NN02"], Some("NN01"), None, None)]
    #[case::default_route(&["NN02"], None, Some("NN02"), Some("NN02"))]
    #[case::default_route_down(&[], None, Some("NN02"), None)]
    #[case::unreachable(&["NN01"], None, None, None)]
    fn test_next_hop_resolution(
        #[case] peers: &[&str],
        #[case] static_via: Option<&str>,
        #[case] uplink: Option<&str>,
        #[case] expected: Option<&str>,
    ) {
        let router = router("CSMS", peers);
        if let Some(via) = static_via {
            router.add_route(node("CS001"), node(via));
        }
        router.set_default_route(uplink.map(node));

        match (router.next_hop(&node("CS001")), expected) {
            (Ok(hop), Some(expected)) => assert_eq!(hop, node(expected)),
            (Err(EngineError::NoRouteToNode(dest)), None) => assert_eq!(dest, node("CS001")),
            (other, expected) => panic!("got {:?}, expected {:?}", other, expected),
        }
    }

    #[test]
    fn test_route_request_to_self_is_loop() {
        let router = router("CSMS", &["CS001"]);
        let err = router.route_request(&request("CSMS", &["CSMS"])).unwrap_err();
        assert!(matches!(err, EngineError::RoutingLoop(_)));
    }

    #[test]
    fn test_route_request_keeps_origin_path() {
        let router = router("CSMS", &["NN01"]);
        router.add_route(node("CS001"), node("NN01"));
        let decision = router.route_request(&request("CS001", &["CSMS"])).unwrap();
        assert_eq!(decision.next_hop, node("NN01"));
        assert_eq!(decision.network_path.hops(), &[node("CSMS")]);
    }

    #[test]
    fn test_forward_appends_local_hop() {
        let router = router("NN01", &["CSMS", "CS001"]);
        let decision = router.forward_request(&request("CS001", &["CSMS"])).unwrap();
        assert_eq!(decision.next_hop, node("CS001"));
        assert_eq!(decision.network_path.hops(), &[node("CSMS"), node("NN01")]);
    }

    #[test]
    fn test_forward_rejects_destination_on_path() {
        let router = router("NN01", &["CSMS", "CS001"]);
        let err = router.forward_request(&request("CSMS", &["CSMS", "NN02"])).unwrap_err();
        assert!(matches!(err, EngineError::RoutingLoop(dest) if dest == node("CSMS")));
    }

    #[test]
    fn test_forward_rejects_revisiting_self() {
        let router = router("NN01", &["NN02", "CS001"]);
        let err = router.forward_request(&request("CS001", &["CSMS", "NN01", "NN02"])).unwrap_err();
        assert!(matches!(err, EngineError::RoutingLoop(hop) if hop == node("NN01")));
    }

    #[test]
    fn test_forward_rejects_bouncing_back_upstream() {
        let router = router("NN02", &["NN01"]);
        router.set_default_route(Some(node("NN01")));
        let err = router.forward_request(&request("CS009", &["CSMS", "NN01"])).unwrap_err();
        assert!(matches!(err, EngineError::RoutingLoop(hop) if hop == node("NN01")));
    }

    #[test]
    fn test_forward_hop_limit() {
        let router = Router::new(node("NN03"), 3);
        router.add_connection(node("CS001"));
        let mut envelope = request("CS001", &["CSMS", "NN01", "NN02"]);
        envelope.network_path = envelope.network_path.with_max_hops(3);
        let err = router.forward_request(&envelope).unwrap_err();
        assert!(matches!(err, EngineError::HopLimitExceeded(3)));
    }

    #[test]
    fn test_response_follows_reversed_path() {
        let responder = router("CS001", &["NN01"]);
        let forwarded = request("CS001", &["CSMS", "NN01"]);
        let reply = ResponseEnvelope::reply_to(&forwarded, &node("NN01"), ResponseBody::Result(json!({})));

        let decision = responder.route_response(&reply).unwrap();
        assert_eq!(decision.next_hop, node("NN01"));

        let intermediate = router("NN01", &["CSMS", "CS001"]);
        let hop = ResponseEnvelope {
            network_path: decision.network_path,
            ..reply
        };
        let decision = intermediate.route_response(&hop).unwrap();
        assert_eq!(decision.next_hop, node("CSMS"));
        assert_eq!(decision.network_path.hops(), &[node("CSMS")]);
    }

    #[test]
    fn test_response_falls_back_when_hop_is_gone() {
        let responder = router("CS001", &["NN02"]);
        responder.set_default_route(Some(node("NN02")));
        let reply = ResponseEnvelope::reply_to(
            &request("CS001", &["CSMS", "NN01"]),
            &node("NN01"),
            ResponseBody::Result(json!({})),
        );
        assert_eq!(responder.route_response(&reply).unwrap().next_hop, node("NN02"));
    }

    #[test]
    fn test_connection_table() {
        let router = router("CSMS", &[]);
        assert!(router.add_connection(node("CS002")));
        assert!(!router.add_connection(node("CS002")));
        router.add_connection(node("CS001"));
        assert_eq!(router.connected_peers(), vec![node("CS001"), node("CS002")]);
        assert!(router.remove_connection(&node("CS002")));
        assert!(!router.is_connected(&node("CS002")));
    }

    #[test]
    fn test_from_config_rejects_bad_ids() {
        let config = RoutingConfig {
            max_hops: 8,
            default_route: Some("bad id".to_string()),
            routes: HashMap::new(),
        };
        let err = Router::from_config(node("CSMS"), &config).unwrap_err();
        assert!(matches!(err, EngineError::MalformedIdentifier { .. }));
    }
}
