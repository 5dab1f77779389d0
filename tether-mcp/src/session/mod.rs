//! One logical conversation over one transport
//!
//! A [`Session`] owns the transport, the table of outbound calls waiting for
//! responses and the table of inbound requests being serviced. Its inbound
//! loop correlates responses by id and spawns one task per inbound request,
//! so calls on a session run concurrently.

pub mod pending;

pub use pending::{PendingCalls, PendingSlot, Resolution};

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::middleware::panic_message;
use crate::protocol::{
    CancelledParams, DecodeError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, McpMethod,
    RequestId,
};
use crate::transport::{InboundStream, McpTransport};
use crate::{McpError, McpResult};

/// Per-session limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Default deadline for outbound calls
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// How long in-flight requests may finish after the peer hangs up
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,

    /// Upper bound on concurrently pending outbound calls
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            drain_timeout: default_drain_timeout(),
            max_pending: default_max_pending(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> McpResult<()> {
        if self.request_timeout.is_zero() {
            return Err(McpError::Configuration {
                message: "session request_timeout must be greater than 0".to_string(),
            });
        }
        if self.max_pending == 0 {
            return Err(McpError::Configuration {
                message: "session max_pending must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_pending() -> usize {
    1024
}

/// What a request handler knows about the call it is servicing
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub session_id: String,
    /// `None` for notifications
    pub request_id: Option<RequestId>,
    /// Fires when the peer cancels this request or the session shuts down
    pub cancellation: CancellationToken,
    /// Handle for calling back into the peer
    pub peer: Session,
}

/// Services inbound requests and notifications for a session
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, request: JsonRpcRequest, context: RequestContext) -> McpResult<Value>;

    async fn handle_notification(
        &self,
        notification: JsonRpcRequest,
        _context: RequestContext,
    ) -> McpResult<()> {
        debug!(method = %notification.method, "ignoring notification");
        Ok(())
    }
}

/// Options for a single outbound call
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the session's `request_timeout`
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    PeerClosed,
    Shutdown,
}

struct SessionInner {
    id: String,
    transport: Arc<dyn McpTransport>,
    pending: PendingCalls,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    next_id: AtomicI64,
    shutdown: CancellationToken,
    closed: CancellationToken,
    config: SessionConfig,
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

impl Session {
    /// Start the transport and spawn the inbound loop under a fresh id
    pub async fn start(
        transport: Arc<dyn McpTransport>,
        handler: Arc<dyn RequestHandler>,
        config: SessionConfig,
    ) -> McpResult<Self> {
        Self::start_with_id(Uuid::new_v4().to_string(), transport, handler, config).await
    }

    pub async fn start_with_id(
        id: impl Into<String>,
        transport: Arc<dyn McpTransport>,
        handler: Arc<dyn RequestHandler>,
        config: SessionConfig,
    ) -> McpResult<Self> {
        transport.start().await?;
        let inbound = transport.incoming().await?;

        let session = Self {
            inner: Arc::new(SessionInner {
                id: id.into(),
                transport,
                pending: PendingCalls::new(config.max_pending),
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                shutdown: CancellationToken::new(),
                closed: CancellationToken::new(),
                config,
            }),
        };

        debug!(session_id = %session.inner.id, "session started");
        tokio::spawn(session.clone().run(inbound, handler));
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once teardown has finished
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Outbound calls currently waiting for a response
    pub async fn pending_calls(&self) -> usize {
        self.inner.pending.len().await
    }

    /// Inbound requests currently being serviced
    pub async fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().await.len()
    }

    /// Abort in-flight work, fail pending calls and close the transport
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.closed().await;
    }

    /// Send a request and wait for its response
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        options: CallOptions,
    ) -> McpResult<Value> {
        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let slot = self.inner.pending.register(id.clone()).await?;
        let timeout = options.timeout.unwrap_or(self.inner.config.request_timeout);
        let cancellation = options.cancellation.unwrap_or_default();

        let request = JsonRpcRequest::new(method, params, Some(id.clone()));
        let transport = Arc::clone(&self.inner.transport);
        let exchange = async move {
            transport.send(request.into()).await?;
            slot.await.unwrap_or_else(|_| {
                Err(McpError::ConnectionClosed {
                    reason: "pending call dropped".to_string(),
                })
            })
        };

        let outcome = tokio::select! {
            result = exchange => result,
            _ = tokio::time::sleep(timeout) => Err(McpError::ClientTimeout { timeout }),
            _ = cancellation.cancelled() => Err(McpError::Cancelled { id: id.clone() }),
        };

        match outcome {
            Ok(response) => response.into_result().map_err(McpError::from),
            Err(err @ (McpError::ClientTimeout { .. } | McpError::Cancelled { .. })) => {
                self.inner.pending.abandon(&id).await;
                debug!(session_id = %self.inner.id, request_id = %id, method, error = %err, "call abandoned");
                self.send_cancelled(id, err.client_message());
                Err(err)
            }
            Err(err) => {
                self.inner.pending.remove(&id).await;
                Err(err)
            }
        }
    }

    /// Send a notification; no response is expected
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.inner
            .transport
            .send(JsonRpcRequest::notification(method, params).into())
            .await
    }

    /// Best-effort `notifications/cancelled` for an abandoned call
    fn send_cancelled(&self, request_id: RequestId, reason: String) {
        if self.is_closed() {
            return;
        }
        let params = CancelledParams {
            request_id,
            reason: Some(reason),
        };
        let Ok(params) = serde_json::to_value(params) else {
            return;
        };

        let transport = Arc::clone(&self.inner.transport);
        let session_id = self.inner.id.clone();
        tokio::spawn(async move {
            let notification = JsonRpcRequest::notification(McpMethod::Cancelled.as_str(), Some(params));
            if let Err(e) = transport.send(notification.into()).await {
                debug!(session_id = %session_id, error = %e, "could not notify peer of cancellation");
            }
        });
    }

    async fn run(self, mut inbound: InboundStream, handler: Arc<dyn RequestHandler>) {
        let mut tasks = JoinSet::new();

        let teardown = loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break Teardown::Shutdown,
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = joined {
                        if !e.is_cancelled() {
                            error!(session_id = %self.inner.id, error = %e, "request task failed");
                        }
                    }
                }
                item = inbound.next() => match item {
                    Some(Ok(message)) => self.route(message, &handler, &mut tasks).await,
                    Some(Err(decode)) => self.reject(decode).await,
                    None => break Teardown::PeerClosed,
                },
            }
        };

        if teardown == Teardown::PeerClosed && !tasks.is_empty() {
            debug!(session_id = %self.inner.id, in_flight = tasks.len(), "peer closed, draining");
            let drain = async {
                while tasks.join_next().await.is_some() {}
            };
            tokio::select! {
                _ = tokio::time::timeout(self.inner.config.drain_timeout, drain) => {}
                _ = self.inner.shutdown.cancelled() => {}
            }
        }
        tasks.shutdown().await;

        let failed = self.inner.pending.fail_all("session closed").await;
        for (_, token) in self.inner.in_flight.lock().await.drain() {
            token.cancel();
        }
        if let Err(e) = self.inner.transport.close().await {
            warn!(session_id = %self.inner.id, error = %e, "failed to close transport");
        }
        self.inner.shutdown.cancel();
        self.inner.closed.cancel();

        info!(
            session_id = %self.inner.id,
            reason = ?teardown,
            failed_calls = failed,
            "session closed"
        );
    }

    async fn route(
        &self,
        message: JsonRpcMessage,
        handler: &Arc<dyn RequestHandler>,
        tasks: &mut JoinSet<()>,
    ) {
        match message {
            JsonRpcMessage::Response(response) => {
                let id = response.id.clone();
                match self.inner.pending.resolve(response).await {
                    Resolution::Delivered => {}
                    Resolution::Discarded => {
                        debug!(session_id = %self.inner.id, request_id = ?id, "discarding late response")
                    }
                    Resolution::Unmatched => {
                        warn!(session_id = %self.inner.id, request_id = ?id, "response matches no pending call")
                    }
                }
            }
            JsonRpcMessage::Request(request) => match request.id.clone() {
                Some(id) => self.spawn_request(id, request, handler, tasks).await,
                None => self.dispatch_notification(request, handler, tasks).await,
            },
        }
    }

    async fn spawn_request(
        &self,
        id: RequestId,
        request: JsonRpcRequest,
        handler: &Arc<dyn RequestHandler>,
        tasks: &mut JoinSet<()>,
    ) {
        let token = self.inner.shutdown.child_token();
        {
            let mut in_flight = self.inner.in_flight.lock().await;
            if in_flight.contains_key(&id) {
                drop(in_flight);
                let err = McpError::DuplicateRequestId { id: id.clone() };
                warn!(session_id = %self.inner.id, request_id = %id, "duplicate request id");
                self.send_response(JsonRpcResponse::error(err.to_jsonrpc_error(), Some(id)))
                    .await;
                return;
            }
            in_flight.insert(id.clone(), token.clone());
        }

        let session = self.clone();
        let handler = Arc::clone(handler);
        tasks.spawn(async move {
            let method = request.method.clone();
            let context = RequestContext {
                session_id: session.inner.id.clone(),
                request_id: Some(id.clone()),
                cancellation: token.clone(),
                peer: session.clone(),
            };

            let outcome = tokio::select! {
                _ = token.cancelled() => None,
                result = AssertUnwindSafe(handler.handle_request(request, context)).catch_unwind() => Some(result),
            };
            session.inner.in_flight.lock().await.remove(&id);

            let response = match outcome {
                None => {
                    debug!(session_id = %session.inner.id, request_id = %id, method = %method, "request cancelled");
                    return;
                }
                Some(Ok(Ok(result))) => JsonRpcResponse::success(result, Some(id)),
                Some(Ok(Err(err))) => {
                    debug!(session_id = %session.inner.id, request_id = %id, method = %method, error = %err, "request failed");
                    JsonRpcResponse::error(err.to_jsonrpc_error(), Some(id))
                }
                Some(Err(panic)) => {
                    let err = McpError::HandlerFault {
                        tool: method.clone(),
                        message: panic_message(panic.as_ref()),
                    };
                    error!(session_id = %session.inner.id, request_id = %id, method = %method, error = %err, "request handler panicked");
                    JsonRpcResponse::error(err.to_jsonrpc_error(), Some(id))
                }
            };
            session.send_response(response).await;
        });
    }

    async fn dispatch_notification(
        &self,
        notification: JsonRpcRequest,
        handler: &Arc<dyn RequestHandler>,
        tasks: &mut JoinSet<()>,
    ) {
        if McpMethod::parse(&notification.method) == Some(McpMethod::Cancelled) {
            self.cancel_in_flight(notification.params).await;
            return;
        }

        let session = self.clone();
        let handler = Arc::clone(handler);
        tasks.spawn(async move {
            let method = notification.method.clone();
            let context = RequestContext {
                session_id: session.inner.id.clone(),
                request_id: None,
                cancellation: session.inner.shutdown.child_token(),
                peer: session.clone(),
            };
            match AssertUnwindSafe(handler.handle_notification(notification, context))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(session_id = %session.inner.id, method = %method, error = %e, "notification failed")
                }
                Err(panic) => error!(
                    session_id = %session.inner.id,
                    method = %method,
                    panic = %panic_message(panic.as_ref()),
                    "notification handler panicked"
                ),
            }
        });
    }

    async fn cancel_in_flight(&self, params: Option<Value>) {
        let params: CancelledParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) | Err(_) => {
                debug!(session_id = %self.inner.id, "ignoring malformed cancellation");
                return;
            }
        };

        match self.inner.in_flight.lock().await.get(&params.request_id) {
            Some(token) => {
                token.cancel();
                debug!(
                    session_id = %self.inner.id,
                    request_id = %params.request_id,
                    reason = ?params.reason,
                    "peer cancelled request"
                );
            }
            None => debug!(
                session_id = %self.inner.id,
                request_id = %params.request_id,
                "cancellation for unknown request"
            ),
        }
    }

    async fn reject(&self, decode: DecodeError) {
        match &decode.id {
            Some(id) => {
                warn!(session_id = %self.inner.id, request_id = %id, error = %decode, "rejecting invalid envelope");
                self.send_response(decode.to_response()).await;
            }
            None => warn!(session_id = %self.inner.id, error = %decode, "dropping undecodable frame"),
        }
    }

    async fn send_response(&self, response: JsonRpcResponse) {
        if let Err(e) = self.inner.transport.send(response.into()).await {
            if e.is_transport_failure() && !self.inner.shutdown.is_cancelled() {
                warn!(session_id = %self.inner.id, error = %e, "failed to send response, closing session");
                self.inner.shutdown.cancel();
            } else {
                debug!(session_id = %self.inner.id, error = %e, "response not sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle_request(&self, request: JsonRpcRequest, _context: RequestContext) -> McpResult<Value> {
            match request.method.as_str() {
                "echo" => Ok(request.params.unwrap_or(Value::Null)),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Value::Null)
                }
                other => Err(McpError::MethodNotFound {
                    method: other.to_string(),
                }),
            }
        }
    }

    async fn pair() -> (Session, Session) {
        let (left, right) = MemoryTransport::pair();
        let client = Session::start(Arc::new(left), Arc::new(Echo), SessionConfig::default())
            .await
            .unwrap();
        let server = Session::start(Arc::new(right), Arc::new(Echo), SessionConfig::default())
            .await
            .unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (client, _server) = pair().await;
        let result = client
            .call("echo", Some(json!({"x": 1})), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(result, json!({"x": 1}));
        assert_eq!(client.pending_calls().await, 0);
    }

    #[tokio::test]
    async fn test_remote_error_surfaces() {
        let (client, _server) = pair().await;
        let err = client.call("nope", None, CallOptions::default()).await.unwrap_err();
        match err {
            McpError::Remote { error } => assert_eq!(error.code, -32601),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_abandons_slot_and_cancels_peer() {
        let (client, server) = pair().await;
        let err = client
            .call("slow", None, CallOptions::default().with_timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ClientTimeout { .. }));
        assert_eq!(client.pending_calls().await, 0);

        tokio::time::timeout(Duration::from_secs(2), async {
            while server.in_flight().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer should drop the cancelled request");
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_calls() {
        let (client, _server) = pair().await;
        let caller = client.clone();
        let call = tokio::spawn(async move { caller.call("slow", None, CallOptions::default()).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        client.shutdown().await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed { .. }));
        assert!(client.is_closed());

        let err = client.call("echo", None, CallOptions::default()).await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_peer_close_ends_session() {
        let (client, server) = pair().await;
        server.shutdown().await;
        tokio::time::timeout(Duration::from_secs(2), client.closed())
            .await
            .expect("client should notice the peer hanging up");
    }
}
