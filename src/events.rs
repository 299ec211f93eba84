//! # Event Bus
//!
//! Fire-and-forget notifications about traffic through one adapter.
//!
//! Publishing never blocks: events go into a bounded `tokio::sync::broadcast`
//! channel and a slow subscriber only loses its own oldest events. Listener
//! callbacks run on their own task with panics caught, so nothing a subscriber
//! does can reach the correlation state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use strum::{AsRefStr, Display};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::domain::{EventTrackingId, NodeId, RequestId};
use crate::ocpp::ErrorCode;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
pub enum EventKind {
    RequestSent,
    RequestReceived,
    ResponseSent,
    ResponseReceived,
    MessageForwarded,
    Anomaly,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestNotification {
    pub request_id: RequestId,
    pub action: String,
    pub destination: NodeId,
    /// Next hop for outbound requests, sending neighbour for inbound ones.
    pub peer: NodeId,
    pub network_path: Vec<NodeId>,
    pub event_tracking_id: EventTrackingId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseNotification {
    pub request_id: RequestId,
    pub destination: NodeId,
    pub peer: NodeId,
    pub event_tracking_id: EventTrackingId,
    /// Set when the response is a CallError.
    pub error_code: Option<ErrorCode>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardNotification {
    pub request_id: RequestId,
    pub from: NodeId,
    pub next_hop: NodeId,
    pub destination: NodeId,
    pub is_response: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum AnomalyKind {
    /// No request with this id was ever pending here.
    UnmatchedResponse,
    /// The request had already been resolved.
    LateResponse,
    UndecodableFrame,
    ForwardingFailed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyNotification {
    pub kind: AnomalyKind,
    pub request_id: Option<RequestId>,
    pub peer: NodeId,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data")]
pub enum EngineEvent {
    RequestSent(RequestNotification),
    RequestReceived(RequestNotification),
    ResponseSent(ResponseNotification),
    ResponseReceived(ResponseNotification),
    MessageForwarded(ForwardNotification),
    Anomaly(AnomalyNotification),
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::RequestSent(_) => EventKind::RequestSent,
            EngineEvent::RequestReceived(_) => EventKind::RequestReceived,
            EngineEvent::ResponseSent(_) => EventKind::ResponseSent,
            EngineEvent::ResponseReceived(_) => EventKind::ResponseReceived,
            EngineEvent::MessageForwarded(_) => EventKind::MessageForwarded,
            EngineEvent::Anomaly(_) => EventKind::Anomaly,
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            EngineEvent::RequestSent(n) | EngineEvent::RequestReceived(n) => Some(&n.request_id),
            EngineEvent::ResponseSent(n) | EngineEvent::ResponseReceived(n) => Some(&n.request_id),
            EngineEvent::MessageForwarded(n) => Some(&n.request_id),
            EngineEvent::Anomaly(n) => n.request_id.as_ref(),
        }
    }
}

/// Selects which kinds a subscription sees. An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    kinds: Vec<EventKind>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
        }
    }

    pub fn matches(&self, event: &EngineEvent) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&event.kind())
    }
}

pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Returns the number of subscribers the event reached.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(receivers) => {
                trace!(kind = %kind, receivers, "Event published");
                receivers
            }
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        debug!(filter = ?filter, "New event subscription");
        Subscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    /// Runs `callback` for every matching event on a dedicated task until the
    /// returned `Listener` is dropped. A panicking callback is logged and the
    /// listener keeps running.
    pub fn spawn_listener<F>(&self, filter: EventFilter, callback: F) -> Listener
    where
        F: Fn(EngineEvent) + Send + Sync + 'static,
    {
        let mut subscription = self.subscribe(filter);
        let handle = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let kind = event.kind();
                if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                    warn!(kind = %kind, "Event listener panicked");
                }
            }
        });
        Listener { handle }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn events_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

pub struct Subscription {
    receiver: broadcast::Receiver<EngineEvent>,
    filter: EventFilter,
}

impl Subscription {
    /// Next matching event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            let event = match self.receiver.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    debug!(lagged = count, "Subscriber lagged, some events dropped");
                    continue;
                }
            };
            if self.filter.matches(&event) {
                return Some(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            let event = match self.receiver.try_recv() {
                Ok(event) => event,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            };
            if self.filter.matches(&event) {
                return Some(event);
            }
        }
    }
}

/// Handle to a callback listener. Dropping it unsubscribes.
pub struct Listener {
    handle: JoinHandle<()>,
}

impl Listener {
    pub fn unsubscribe(self) {}
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    fn node(raw: &str) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    fn anomaly(kind: AnomalyKind) -> EngineEvent {
        EngineEvent::Anomaly(AnomalyNotification {
            kind,
            request_id: None,
            peer: node("CS001"),
            description: "test".to_string(),
        })
    }

    fn forwarded() -> EngineEvent {
        EngineEvent::MessageForwarded(ForwardNotification {
            request_id: RequestId::new("1").unwrap(),
            from: node("CSMS"),
            next_hop: node("CS001"),
            destination: node("CS001"),
            is_response: false,
        })
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(forwarded()), 0);
        assert_eq!(bus.events_published(), 1);
    }

    #[tokio::test]
    async fn test_filter_selects_kinds() {
        let bus = EventBus::default();
        let mut anomalies = bus.subscribe(EventFilter::only([EventKind::Anomaly]));
        let mut everything = bus.subscribe(EventFilter::all());

        assert_eq!(bus.publish(forwarded()), 2);
        bus.publish(anomaly(AnomalyKind::LateResponse));

        let event = anomalies.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::Anomaly);
        assert!(anomalies.try_recv().is_none());

        assert_eq!(everything.try_recv().unwrap().kind(), EventKind::MessageForwarded);
        assert_eq!(everything.try_recv().unwrap().kind(), EventKind::Anomaly);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_only_loses_own_events() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe(EventFilter::all());
        for _ in 0..5 {
            bus.publish(forwarded());
        }
        // Oldest events were overwritten; the newest are still readable.
        assert!(slow.recv().await.is_some());
        assert_eq!(bus.events_published(), 5);
    }

    #[tokio::test]
    async fn test_panicking_listener_keeps_running() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _listener = bus.spawn_listener(EventFilter::all(), move |event| {
            counter.fetch_add(1, Ordering::SeqCst);
            if event.kind() == EventKind::Anomaly {
                panic!("listener failure");
            }
        });

        bus.publish(anomaly(AnomalyKind::UnmatchedResponse));
        bus.publish(forwarded());

        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropping_listener_unsubscribes() {
        let bus = EventBus::default();
        let listener = bus.spawn_listener(EventFilter::all(), |_| {});
        assert_eq!(bus.subscriber_count(), 1);
        listener.unsubscribe();
        for _ in 0..100 {
            if bus.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(EventKind::ResponseReceived.to_string(), "ResponseReceived");
        assert_eq!(AnomalyKind::LateResponse.to_string(), "LateResponse");
    }
}
