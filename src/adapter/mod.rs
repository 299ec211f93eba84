//! # Correlation Engine
//!
//! The `Adapter` is one node's view of the network. It builds and routes
//! outbound requests, correlates responses with the requests waiting for them,
//! serves inbound requests with registered handlers, and forwards traffic
//! addressed to other nodes.
//!
//! ## Request lifecycle
//!
//! `Created -> Sent -> {Completed | TimedOut | Cancelled | TransportFailed}`
//!
//! Failures known before transmission (malformed ids, routing loops,
//! unreachable destinations, encryption problems) are returned from `submit`
//! and never reach the pending table. After that, the pending table delivers
//! exactly one `OcppResult` per request.

use futures::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::domain::{
    EventTrackingId, NetworkPath, NodeId, OcppResult, RequestId, RequestIdGenerator, ResultCode,
};
use crate::envelope::{
    EnvelopeDefaults, KeyStore, MessageSignature, RequestBuilder, RequestEnvelope, ResponseBody,
    ResponseEnvelope, SecureDataStatus, SecureDataTransferResponse, SecureEnvelope, SecureFrame,
    SecureOptions, SigningKey,
};
use crate::error::EngineError;
use crate::events::{
    AnomalyKind, AnomalyNotification, EngineEvent, EventBus, ForwardNotification,
    RequestNotification, ResponseNotification,
};
use crate::ocpp::{Action, Codec, ErrorCode, Frame, JsonCodec};
use crate::router::Router;
use crate::transport::{Transport, TransportEvent};

pub mod pending;

pub use pending::{PendingRegistration, PendingRequestTable, PendingStats, Resolution};

/// Lower bound for the timeout sweep period.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub default_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_hops: usize,
    pub event_capacity: usize,
    pub recent_response_memory: usize,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for AdapterSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            default_timeout: config.adapter.default_timeout(),
            sweep_interval: config.adapter.sweep_interval(),
            max_hops: config.routing.max_hops,
            event_capacity: config.events.channel_capacity,
            recent_response_memory: config.adapter.recent_response_memory,
        }
    }
}

/// Per-call overrides. Unset fields fall back to adapter defaults.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub request_id: Option<RequestId>,
    pub event_tracking_id: Option<EventTrackingId>,
    pub signing_keys: Vec<SigningKey>,
    pub cancellation: Option<CancellationToken>,
}

impl CallOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn event_tracking_id(mut self, event_tracking_id: EventTrackingId) -> Self {
        self.event_tracking_id = Some(event_tracking_id);
        self
    }

    pub fn signed_by(mut self, key: SigningKey) -> Self {
        self.signing_keys.push(key);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn split(self, builder: RequestBuilder) -> (RequestBuilder, Option<CancellationToken>) {
        let mut builder = builder.signing_keys(self.signing_keys);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(request_id) = self.request_id {
            builder = builder.request_id(request_id);
        }
        if let Some(event_tracking_id) = self.event_tracking_id {
            builder = builder.event_tracking_id(event_tracking_id);
        }
        (builder, self.cancellation)
    }
}

/// Handle to an in-flight request. Resolves to the request's single outcome.
#[derive(Debug)]
pub struct PendingResponse {
    request_id: RequestId,
    receiver: oneshot::Receiver<OcppResult>,
}

impl PendingResponse {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }
}

impl Future for PendingResponse {
    type Output = OcppResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(OcppResult::error(
                ResultCode::GenericProtocolError,
                "request was dropped without an outcome",
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Error returned by a request handler, sent to the caller as a CallError.
#[derive(Debug, Clone, Error)]
#[error("{code}: {description}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Option<Value>,
}

impl HandlerError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, description)
    }
}

/// What a handler knows about the request it is serving.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub action: String,
    /// Neighbour the request arrived from.
    pub from: NodeId,
    /// Node that originated the request.
    pub origin: NodeId,
    pub network_path: NetworkPath,
    pub event_tracking_id: EventTrackingId,
    pub signatures: Vec<MessageSignature>,
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, ctx: RequestContext, payload: Value) -> Result<Value, HandlerError>;
}

struct TypedHandler<A, F> {
    handler: F,
    _action: PhantomData<fn() -> A>,
}

#[async_trait]
impl<A, F, Fut> RequestHandler for TypedHandler<A, F>
where
    A: Action + DeserializeOwned + 'static,
    A::Response: Serialize,
    F: Fn(RequestContext, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<A::Response, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, payload: Value) -> Result<Value, HandlerError> {
        let request: A = serde_json::from_value(payload).map_err(|e| {
            HandlerError::new(
                ErrorCode::FormationViolation,
                format!("{} payload: {}", A::NAME, e),
            )
        })?;
        let response = (self.handler)(ctx, request).await?;
        serde_json::to_value(response)
            .map_err(|e| HandlerError::internal(format!("{} response: {}", A::NAME, e)))
    }
}

struct RawHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for RawHandler<F>
where
    F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, payload: Value) -> Result<Value, HandlerError> {
        (self.0)(ctx, payload).await
    }
}

struct AdapterInner {
    local: NodeId,
    settings: AdapterSettings,
    transport: Arc<dyn Transport>,
    codec: JsonCodec,
    router: Router,
    pending: PendingRequestTable,
    keys: Arc<KeyStore>,
    events: EventBus,
    ids: RequestIdGenerator,
    handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    shutdown: CancellationToken,
}

impl Drop for AdapterInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// One node's correlation engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Adapter {
    inner: Arc<AdapterInner>,
}

impl Adapter {
    /// Must be called inside a Tokio runtime; starts the timeout sweeper.
    pub fn new(local: NodeId, settings: AdapterSettings, transport: Arc<dyn Transport>) -> Self {
        let router = Router::new(local.clone(), settings.max_hops);
        Self::with_router(router, settings, transport)
    }

    pub fn from_config(config: &EngineConfig, transport: Arc<dyn Transport>) -> Result<Self, EngineError> {
        let local = config.node.node_id()?;
        let router = Router::from_config(local, &config.routing)?;
        let adapter = Self::with_router(router, AdapterSettings::from(config), transport);
        let installed = config.encryption.install(&adapter.inner.keys)?;
        debug!(node = %adapter.local(), contexts = installed, "Installed configured encryption contexts");
        Ok(adapter)
    }

    fn with_router(router: Router, mut settings: AdapterSettings, transport: Arc<dyn Transport>) -> Self {
        if settings.sweep_interval < MIN_SWEEP_INTERVAL {
            warn!(requested = ?settings.sweep_interval, "Sweep interval too small, using 1ms");
            settings.sweep_interval = MIN_SWEEP_INTERVAL;
        }
        let inner = Arc::new(AdapterInner {
            local: router.local().clone(),
            codec: JsonCodec::new(settings.max_hops),
            pending: PendingRequestTable::new(settings.recent_response_memory),
            events: EventBus::new(settings.event_capacity),
            settings,
            transport,
            router,
            keys: Arc::new(KeyStore::new()),
            ids: RequestIdGenerator::new(),
            handlers: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });
        spawn_sweeper(&inner);
        info!(node = %inner.local, "Adapter started");
        Self { inner }
    }

    pub fn local(&self) -> &NodeId {
        &self.inner.local
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.inner.keys
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn stats(&self) -> PendingStats {
        self.inner.pending.stats()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Builds, routes and transmits a request. On success the returned handle
    /// resolves exactly once; on failure nothing was transmitted.
    pub async fn submit(
        &self,
        builder: RequestBuilder,
        cancellation: Option<CancellationToken>,
    ) -> Result<PendingResponse, OcppResult> {
        if self.inner.shutdown.is_cancelled() {
            return Err(OcppResult::transport_failure("adapter is shut down"));
        }

        let explicit_id = builder.explicit_request_id().is_some();
        let envelope = {
            let next_request_id = || self.inner.ids.next_id();
            let defaults = EnvelopeDefaults {
                local: &self.inner.local,
                default_timeout: self.inner.settings.default_timeout,
                max_hops: self.inner.settings.max_hops,
                next_request_id: &next_request_id,
            };
            builder.build(&defaults)?
        };
        let decision = self.inner.router.route_request(&envelope)?;
        let mut envelope = RequestEnvelope {
            network_path: decision.network_path,
            ..envelope
        };

        let (bytes, receiver, done) = loop {
            let bytes = self.inner.codec.encode(&Frame::Request(envelope.clone()))?;
            match self.inner.pending.insert(PendingRegistration {
                request_id: envelope.request_id.clone(),
                action: envelope.action.clone(),
                destination: envelope.destination.clone(),
                next_hop: decision.next_hop.clone(),
                timeout: envelope.timeout,
            }) {
                Ok((receiver, done)) => break (bytes, receiver, done),
                // A generated id may collide with one a caller chose; draw again.
                Err(EngineError::DuplicateRequestId(taken)) if !explicit_id => {
                    debug!(request_id = %taken, "Generated request id already pending");
                    envelope.request_id = self.inner.ids.next_id();
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.publish_request(true, &envelope, &decision.next_hop);
        debug!(
            request_id = %envelope.request_id,
            action = %envelope.action,
            destination = %envelope.destination,
            next_hop = %decision.next_hop,
            "Sending request"
        );
        if let Err(e) = self.send_frame(&decision.next_hop, bytes).await {
            warn!(
                request_id = %envelope.request_id,
                next_hop = %decision.next_hop,
                error = %e,
                "Transport rejected request"
            );
            let resolution = match e {
                EngineError::Transport(e) => Resolution::TransportFailed(e.to_string()),
                other => Resolution::Faulted(other.to_string()),
            };
            self.inner.pending.resolve(&envelope.request_id, resolution);
        }

        if let Some(token) = cancellation {
            spawn_cancellation_watcher(&self.inner, envelope.request_id.clone(), token, done);
        }

        Ok(PendingResponse {
            request_id: envelope.request_id,
            receiver,
        })
    }

    /// Sends a typed request and decodes the typed response.
    pub async fn call<A: Action>(
        &self,
        destination: NodeId,
        request: A,
        options: CallOptions,
    ) -> Result<A::Response, OcppResult> {
        let payload = serde_json::to_value(&request).map_err(EngineError::from)?;
        let (builder, cancellation) = options.split(RequestBuilder::new(destination, A::NAME, payload));
        let result = self.submit(builder, cancellation).await?.await;
        if !result.is_ok() {
            return Err(result);
        }
        serde_json::from_value(result.payload.unwrap_or(Value::Null)).map_err(|e| {
            OcppResult::error(
                ResultCode::FormationViolation,
                format!("{} response payload: {}", A::NAME, e),
            )
        })
    }

    /// Encrypts `plaintext` for `destination` and delivers it in a
    /// `SecureDataTransfer` call. Nothing is sent if sealing fails.
    pub async fn send_secure(
        &self,
        destination: NodeId,
        plaintext: &[u8],
        secure: SecureOptions,
        options: CallOptions,
    ) -> Result<SecureDataTransferResponse, OcppResult> {
        let frame = SecureEnvelope::seal(&self.inner.keys, &destination, plaintext, &secure)?;
        self.call(destination, frame, options).await
    }

    pub fn on<A, F, Fut>(&self, handler: F)
    where
        A: Action + DeserializeOwned + 'static,
        A::Response: Serialize,
        F: Fn(RequestContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A::Response, HandlerError>> + Send + 'static,
    {
        self.register_handler(
            A::NAME,
            Arc::new(TypedHandler {
                handler,
                _action: PhantomData,
            }),
        );
    }

    pub fn on_raw<F, Fut>(&self, action: &str, handler: F)
    where
        F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register_handler(action, Arc::new(RawHandler(handler)));
    }

    /// Serves `SecureDataTransfer`: frames are decrypted with the inbound
    /// context of their origin and the plaintext is passed to `handler`.
    pub fn on_secure_data<F, Fut>(&self, handler: F)
    where
        F: Fn(NodeId, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let keys = Arc::clone(&self.inner.keys);
        let handler = Arc::new(handler);
        self.on::<SecureFrame, _, _>(move |ctx, frame| {
            let keys = Arc::clone(&keys);
            let handler = Arc::clone(&handler);
            async move {
                let plaintext = SecureEnvelope::open(&keys, &ctx.origin, &frame)
                    .map_err(|e| HandlerError::new(ErrorCode::SecurityError, e.to_string()))?;
                (*handler)(ctx.origin, plaintext).await?;
                Ok::<_, HandlerError>(SecureDataTransferResponse {
                    status: SecureDataStatus::Accepted,
                })
            }
        });
    }

    pub fn register_handler(&self, action: &str, handler: Arc<dyn RequestHandler>) {
        if self
            .inner
            .handlers
            .write()
            .insert(action.to_string(), handler)
            .is_some()
        {
            debug!(action, "Replaced request handler");
        }
    }

    /// Drives the adapter from a transport's event stream until the stream
    /// ends or `shutdown` is called. The task keeps the adapter alive meanwhile.
    pub fn attach(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) -> JoinHandle<()> {
        let adapter = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(TransportEvent::Connected(peer)) => adapter.connection_established(peer),
                        Some(TransportEvent::Disconnected(peer)) => adapter.connection_lost(&peer),
                        Some(TransportEvent::Frame { from, bytes }) => adapter.receive(from, &bytes).await,
                        None => break,
                    },
                }
            }
            debug!(node = %adapter.local(), "Transport event stream detached");
        })
    }

    pub fn connection_established(&self, peer: NodeId) {
        self.inner.router.add_connection(peer);
    }

    /// Fails everything waiting on `peer` right away instead of at its deadline.
    pub fn connection_lost(&self, peer: &NodeId) {
        self.inner.router.remove_connection(peer);
        let failed = self
            .inner
            .pending
            .fail_via(peer, &format!("connection to {} lost", peer));
        if failed > 0 {
            warn!(peer = %peer, failed, "Failed pending requests after disconnect");
        }
    }

    /// Handles one inbound frame from the neighbour `from`.
    pub async fn receive(&self, from: NodeId, bytes: &[u8]) {
        let frame = match self.inner.codec.decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %from, error = %e, "Dropping undecodable frame");
                self.publish_anomaly(AnomalyKind::UndecodableFrame, None, &from, e.to_string());
                return;
            }
        };
        trace!(
            peer = %from,
            request_id = %frame.request_id(),
            destination = %frame.destination(),
            "Received frame"
        );
        match frame {
            Frame::Request(request) => self.on_request(from, request).await,
            Frame::Response(response) => self.on_response(from, response).await,
        }
    }

    /// Stops background tasks and fails every pending request.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let failed = self.inner.pending.fail_all("adapter shut down");
        info!(node = %self.inner.local, failed, "Adapter shut down");
    }

    async fn on_request(&self, from: NodeId, request: RequestEnvelope) {
        if request.destination != self.inner.local {
            self.forward_request(from, request).await;
            return;
        }
        self.publish_request(false, &request, &from);

        // Handlers run on their own task so a slow one never stalls the receive loop.
        let adapter = self.clone();
        tokio::spawn(async move {
            let body = adapter.dispatch(&from, &request).await;
            adapter.reply(&from, &request, body).await;
        });
    }

    async fn dispatch(&self, from: &NodeId, request: &RequestEnvelope) -> ResponseBody {
        let handler = self.inner.handlers.read().get(&request.action).cloned();
        let Some(handler) = handler else {
            debug!(action = %request.action, "No handler registered");
            return ResponseBody::error(
                ErrorCode::NotImplemented,
                format!("{} is not implemented by {}", request.action, self.inner.local),
                None,
            );
        };

        let ctx = RequestContext {
            request_id: request.request_id.clone(),
            action: request.action.clone(),
            from: from.clone(),
            origin: request
                .network_path
                .origin()
                .cloned()
                .unwrap_or_else(|| from.clone()),
            network_path: request.network_path.clone(),
            event_tracking_id: request.event_tracking_id.clone(),
            signatures: request.signatures.clone(),
        };
        match AssertUnwindSafe(handler.handle(ctx, request.payload.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(payload)) => ResponseBody::Result(payload),
            Ok(Err(e)) => {
                debug!(request_id = %request.request_id, error = %e, "Handler returned an error");
                ResponseBody::error(e.code, e.description, e.details)
            }
            Err(_) => {
                warn!(
                    request_id = %request.request_id,
                    action = %request.action,
                    "Request handler panicked"
                );
                ResponseBody::error(
                    ErrorCode::InternalError,
                    format!("{} handler failed unexpectedly", request.action),
                    None,
                )
            }
        }
    }

    async fn reply(&self, from: &NodeId, request: &RequestEnvelope, body: ResponseBody) {
        let response = ResponseEnvelope::reply_to(request, from, body);
        let decision = match self.inner.router.route_response(&response) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(request_id = %response.request_id, error = %e, "Cannot route response");
                self.publish_anomaly(
                    AnomalyKind::ForwardingFailed,
                    Some(response.request_id.clone()),
                    from,
                    e.to_string(),
                );
                return;
            }
        };
        let response = ResponseEnvelope {
            network_path: decision.network_path,
            ..response
        };
        self.publish_response(true, &response, &decision.next_hop);
        self.transmit(&decision.next_hop, Frame::Response(response)).await;
    }

    async fn forward_request(&self, from: NodeId, request: RequestEnvelope) {
        let decision = match self.inner.router.forward_request(&request) {
            Ok(decision) => decision,
            Err(e) => return self.reject_forward(&from, &request, e).await,
        };
        let forwarded = RequestEnvelope {
            network_path: decision.network_path,
            ..request.clone()
        };
        let bytes = match self.inner.codec.encode(&Frame::Request(forwarded)) {
            Ok(bytes) => bytes,
            Err(e) => return self.reject_forward(&from, &request, e).await,
        };
        if let Err(e) = self.send_frame(&decision.next_hop, bytes).await {
            return self.reject_forward(&from, &request, e).await;
        }
        debug!(
            request_id = %request.request_id,
            from = %from,
            next_hop = %decision.next_hop,
            destination = %request.destination,
            "Forwarded request"
        );
        self.inner
            .events
            .publish(EngineEvent::MessageForwarded(ForwardNotification {
                request_id: request.request_id,
                from,
                next_hop: decision.next_hop,
                destination: request.destination,
                is_response: false,
            }));
    }

    /// Answers the origin with a CallError when a request cannot be forwarded.
    async fn reject_forward(&self, from: &NodeId, request: &RequestEnvelope, error: EngineError) {
        warn!(
            request_id = %request.request_id,
            destination = %request.destination,
            error = %error,
            "Cannot forward request"
        );
        self.publish_anomaly(
            AnomalyKind::ForwardingFailed,
            Some(request.request_id.clone()),
            from,
            error.to_string(),
        );
        let body = ResponseBody::error(
            ErrorCode::GenericError,
            error.to_string(),
            Some(serde_json::json!({
                "resultCode": ResultCode::from(&error).as_ref(),
                "node": self.inner.local.as_str(),
            })),
        );
        self.reply(from, request, body).await;
    }

    async fn on_response(&self, from: NodeId, response: ResponseEnvelope) {
        if response.destination != self.inner.local {
            self.forward_response(from, response).await;
            return;
        }
        self.publish_response(false, &response, &from);

        let wire_code = response.body.wire_error_code();
        let result = match response.body {
            ResponseBody::Result(payload) => OcppResult::ok(payload),
            ResponseBody::Error {
                description,
                details,
                ..
            } => OcppResult::peer_error(&wire_code.unwrap_or_default(), &description, details),
        };
        let request_id = response.request_id;
        if self
            .inner
            .pending
            .resolve(&request_id, Resolution::Completed(result))
        {
            return;
        }

        self.inner.pending.record_discarded();
        let kind = if self.inner.pending.was_recently_resolved(&request_id) {
            AnomalyKind::LateResponse
        } else {
            AnomalyKind::UnmatchedResponse
        };
        warn!(request_id = %request_id, peer = %from, kind = %kind, "Discarding response");
        self.publish_anomaly(kind, Some(request_id), &from, kind.to_string());
    }

    async fn forward_response(&self, from: NodeId, response: ResponseEnvelope) {
        let decision = match self.inner.router.route_response(&response) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(request_id = %response.request_id, error = %e, "Cannot forward response");
                self.publish_anomaly(
                    AnomalyKind::ForwardingFailed,
                    Some(response.request_id.clone()),
                    &from,
                    e.to_string(),
                );
                return;
            }
        };
        let request_id = response.request_id.clone();
        let destination = response.destination.clone();
        let forwarded = ResponseEnvelope {
            network_path: decision.network_path,
            ..response
        };
        if self.transmit(&decision.next_hop, Frame::Response(forwarded)).await {
            self.inner
                .events
                .publish(EngineEvent::MessageForwarded(ForwardNotification {
                    request_id,
                    from,
                    next_hop: decision.next_hop,
                    destination,
                    is_response: true,
                }));
        }
    }

    /// Best-effort send for frames nobody is waiting on locally.
    async fn transmit(&self, next_hop: &NodeId, frame: Frame) -> bool {
        let request_id = frame.request_id().clone();
        let bytes = match self.inner.codec.encode(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Cannot encode frame");
                return false;
            }
        };
        match self.send_frame(next_hop, bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!(request_id = %request_id, next_hop = %next_hop, error = %e, "Cannot send frame");
                self.publish_anomaly(AnomalyKind::ForwardingFailed, Some(request_id), next_hop, e.to_string());
                false
            }
        }
    }

    /// Hands bytes to the transport. A panicking transport is reported as
    /// `Internal` instead of unwinding through the caller.
    async fn send_frame(&self, next_hop: &NodeId, bytes: Vec<u8>) -> Result<(), EngineError> {
        let send = async { self.inner.transport.send(next_hop, bytes).await };
        match AssertUnwindSafe(send).catch_unwind().await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(next_hop = %next_hop, "Transport panicked while sending");
                Err(EngineError::Internal(format!("transport panicked sending to {}", next_hop)))
            }
        }
    }

    fn publish_request(&self, outbound: bool, request: &RequestEnvelope, peer: &NodeId) {
        let notification = RequestNotification {
            request_id: request.request_id.clone(),
            action: request.action.clone(),
            destination: request.destination.clone(),
            peer: peer.clone(),
            network_path: request.network_path.hops().to_vec(),
            event_tracking_id: request.event_tracking_id.clone(),
            timestamp: request.timestamp,
        };
        self.inner.events.publish(if outbound {
            EngineEvent::RequestSent(notification)
        } else {
            EngineEvent::RequestReceived(notification)
        });
    }

    fn publish_response(&self, outbound: bool, response: &ResponseEnvelope, peer: &NodeId) {
        let error_code = match &response.body {
            ResponseBody::Error { code, .. } => Some(*code),
            ResponseBody::Result(_) => None,
        };
        let notification = ResponseNotification {
            request_id: response.request_id.clone(),
            destination: response.destination.clone(),
            peer: peer.clone(),
            event_tracking_id: response.event_tracking_id.clone(),
            error_code,
            timestamp: response.timestamp,
        };
        self.inner.events.publish(if outbound {
            EngineEvent::ResponseSent(notification)
        } else {
            EngineEvent::ResponseReceived(notification)
        });
    }

    fn publish_anomaly(
        &self,
        kind: AnomalyKind,
        request_id: Option<RequestId>,
        peer: &NodeId,
        description: String,
    ) {
        self.inner
            .events
            .publish(EngineEvent::Anomaly(AnomalyNotification {
                kind,
                request_id,
                peer: peer.clone(),
                description,
            }));
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("local", &self.inner.local)
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

fn spawn_sweeper(inner: &Arc<AdapterInner>) {
    let weak: Weak<AdapterInner> = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();
    let period = inner.settings.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    let expired = inner.pending.expire(Instant::now());
                    if expired > 0 {
                        debug!(node = %inner.local, expired, "Timed out pending requests");
                    }
                }
            }
        }
    });
}

fn spawn_cancellation_watcher(
    inner: &Arc<AdapterInner>,
    request_id: RequestId,
    token: CancellationToken,
    done: CancellationToken,
) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        tokio::select! {
            _ = done.cancelled() => {}
            _ = token.cancelled() => {
                if let Some(inner) = weak.upgrade() {
                    inner.pending.resolve(&request_id, Resolution::Cancelled);
                }
            }
        }
    });
}
