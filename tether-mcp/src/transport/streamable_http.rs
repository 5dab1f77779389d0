//! Streamable HTTP transports
//!
//! One endpoint serves all directions. In stateless mode every POST is its
//! own exchange: a transport is built around the single inbound envelope and
//! the reply travels back in the response body. In stateful mode the server
//! issues an `Mcp-Session-Id`; POSTed requests are still answered in the POST
//! body, while everything else the server sends goes to the GET push stream.

use async_trait::async_trait;
use axum::response::sse::Event;
use futures_util::Stream;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::sse::forward_events;
use super::{
    closed_error, inbound_stream, parse_http_url, send_bounded, take_receiver,
    HttpClientSettings, InboundItem, InboundStream, McpTransport, TransportOptions,
};
use crate::protocol::{codec, DecodeError, JsonRpcMessage, RequestId};
use crate::{McpError, McpResult};

/// Session header, compared case-insensitively by HTTP
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// Transport for a single stateless POST exchange
pub struct StatelessHttpTransport {
    request_id: Option<RequestId>,
    // Held until the reply is sent so the session does not see an early hang-up
    inbound_tx: Mutex<Option<mpsc::Sender<InboundItem>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundItem>>>,
    reply: Mutex<Option<oneshot::Sender<JsonRpcMessage>>>,
    closed: CancellationToken,
    closing: AtomicBool,
}

impl StatelessHttpTransport {
    /// Build the exchange; the receiver yields the envelope for the response body.
    ///
    /// The inbound stream carries `message`. For a request it stays open
    /// until the reply is sent or the transport is closed; for anything else
    /// it ends right away.
    pub fn new(message: JsonRpcMessage) -> (Self, oneshot::Receiver<JsonRpcMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(1);
        let (reply_tx, reply_rx) = oneshot::channel();
        let request_id = message.id().cloned().filter(|_| message.is_request());
        // Capacity 1 and a fresh channel: this cannot fail
        let _ = inbound_tx.try_send(Ok(message));
        let inbound_tx = request_id.as_ref().map(|_| inbound_tx);

        let transport = Self {
            request_id,
            inbound_tx: Mutex::new(inbound_tx),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            reply: Mutex::new(Some(reply_tx)),
            closed: CancellationToken::new(),
            closing: AtomicBool::new(false),
        };
        (transport, reply_rx)
    }
}

#[async_trait]
impl McpTransport for StatelessHttpTransport {
    async fn start(&self) -> McpResult<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }

        let answers_request = matches!(
            (&message, &self.request_id),
            (JsonRpcMessage::Response(response), Some(id)) if response.id.as_ref() == Some(id)
        );
        if !answers_request {
            debug!(method = ?message.method(), "stateless exchange has no push channel");
            return Err(McpError::Transport {
                message: "stateless HTTP exchange cannot carry server-initiated messages"
                    .to_string(),
            });
        }

        let reply = self.reply.lock().await.take().ok_or_else(|| McpError::Transport {
            message: "stateless HTTP exchange already answered".to_string(),
        })?;
        // The exchange is over either way: let the inbound stream end
        self.inbound_tx.lock().await.take();
        reply.send(message).map_err(|_| McpError::ConnectionClosed {
            reason: "HTTP client went away".to_string(),
        })
    }

    async fn incoming(&self) -> McpResult<InboundStream> {
        let receiver = take_receiver(&self.inbound_rx).await?;
        Ok(inbound_stream(receiver, &self.closed))
    }

    async fn close(&self) -> McpResult<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.cancel();
        self.inbound_tx.lock().await.take();
        self.reply.lock().await.take();
        Ok(())
    }
}

/// Server end of a stateful streamable HTTP session
pub struct StatefulHttpTransport {
    session_id: String,
    inbound_tx: mpsc::Sender<InboundItem>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundItem>>>,
    waiters: Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcMessage>>>,
    push_tx: mpsc::Sender<JsonRpcMessage>,
    push_rx: Arc<Mutex<mpsc::Receiver<JsonRpcMessage>>>,
    last_activity: RwLock<Instant>,
    closed: CancellationToken,
    closing: AtomicBool,
    options: TransportOptions,
}

impl StatefulHttpTransport {
    pub fn new(session_id: impl Into<String>, options: TransportOptions) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(options.channel_capacity);
        let (push_tx, push_rx) = mpsc::channel(options.channel_capacity);
        Self {
            session_id: session_id.into(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            waiters: Mutex::new(HashMap::new()),
            push_tx,
            push_rx: Arc::new(Mutex::new(push_rx)),
            last_activity: RwLock::new(Instant::now()),
            closed: CancellationToken::new(),
            closing: AtomicBool::new(false),
            options,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_activity.read().await.elapsed()
    }

    /// Route the response for `id` to the returned receiver instead of the push stream.
    ///
    /// Must be called before the request is delivered.
    pub async fn expect_response(&self, id: RequestId) -> oneshot::Receiver<JsonRpcMessage> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(id, tx);
        rx
    }

    /// Drop a waiter whose POST gave up
    pub async fn forget_response(&self, id: &RequestId) {
        self.waiters.lock().await.remove(id);
    }

    /// Queue an envelope received in a POST body
    pub async fn deliver(&self, item: InboundItem) -> McpResult<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        self.touch().await;
        send_bounded(&self.inbound_tx, item, self.options.send_timeout).await
    }

    /// Event stream for the GET push channel.
    ///
    /// Only one stream may be attached at a time; dropping it detaches without
    /// ending the session.
    pub fn attach_stream(
        &self,
    ) -> McpResult<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
        let mut push = self
            .push_rx
            .clone()
            .try_lock_owned()
            .map_err(|_| McpError::Session {
                message: format!("push stream already attached to session {}", self.session_id),
            })?;
        let closed = self.closed.clone();
        let session_id = self.session_id.clone();

        Ok(async_stream::stream! {
            debug!(session_id = %session_id, "push stream attached");
            loop {
                let message = tokio::select! {
                    _ = closed.cancelled() => break,
                    message = push.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                match codec::encode(&message) {
                    Ok(frame) => {
                        let data = String::from_utf8_lossy(&frame).into_owned();
                        yield Ok(Event::default().event("message").data(data));
                    }
                    Err(e) => warn!(session_id = %session_id, error = %e, "dropping unencodable push frame"),
                }
            }
            debug!(session_id = %session_id, "push stream detached");
        })
    }
}

#[async_trait]
impl McpTransport for StatefulHttpTransport {
    async fn start(&self) -> McpResult<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }

        if let JsonRpcMessage::Response(response) = &message {
            let waiter = match &response.id {
                Some(id) => self.waiters.lock().await.remove(id),
                None => None,
            };
            if let Some(waiter) = waiter {
                if waiter.send(message).is_err() {
                    debug!(session_id = %self.session_id, "POST waiter gone before its response");
                }
                return Ok(());
            }
        }

        send_bounded(&self.push_tx, message, self.options.send_timeout).await
    }

    async fn incoming(&self) -> McpResult<InboundStream> {
        let receiver = take_receiver(&self.inbound_rx).await?;
        Ok(inbound_stream(receiver, &self.closed))
    }

    async fn close(&self) -> McpResult<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.cancel();
        self.waiters.lock().await.clear();
        debug!(session_id = %self.session_id, "stateful HTTP transport closed");
        Ok(())
    }
}

/// Live stateful sessions keyed by `Mcp-Session-Id`
pub struct HttpSessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<StatefulHttpTransport>>>>,
    options: TransportOptions,
    idle_timeout: Duration,
    cleanup_interval: Duration,
}

impl HttpSessionManager {
    pub fn new(options: TransportOptions, idle_timeout: Duration, cleanup_interval: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            options,
            idle_timeout,
            cleanup_interval,
        }
    }

    /// Create a session with a fresh id
    pub async fn create(&self) -> Arc<StatefulHttpTransport> {
        let session_id = Uuid::new_v4().to_string();
        let transport = Arc::new(StatefulHttpTransport::new(session_id.clone(), self.options.clone()));
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::clone(&transport));

        info!(session_id = %session_id, "created streamable HTTP session");
        transport
    }

    /// Look up a live session and mark it active
    pub async fn get(&self, session_id: &str) -> Option<Arc<StatefulHttpTransport>> {
        let transport = self.sessions.read().await.get(session_id).cloned()?;
        if transport.is_closed() {
            self.sessions.write().await.remove(session_id);
            return None;
        }
        transport.touch().await;
        Some(transport)
    }

    /// Remove and close a session
    pub async fn remove(&self, session_id: &str) -> Option<Arc<StatefulHttpTransport>> {
        let transport = self.sessions.write().await.remove(session_id)?;
        if let Err(e) = transport.close().await {
            warn!(session_id, error = %e, "failed to close HTTP session");
        }
        info!(session_id, "removed streamable HTTP session");
        Some(transport)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close and forget every session idle longer than `idle_timeout`
    pub async fn expire_idle(&self) -> usize {
        let mut expired = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (session_id, transport) in sessions.iter() {
                if transport.is_closed() || transport.idle_for().await >= self.idle_timeout {
                    expired.push(session_id.clone());
                }
            }
        }

        for session_id in &expired {
            self.remove(session_id).await;
            debug!(session_id = %session_id, "expired idle HTTP session");
        }
        expired.len()
    }

    /// Start background cleanup; the task stops when `shutdown` fires
    pub fn start_cleanup_task(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.cleanup_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        manager.expire_idle().await;
                    }
                }
            }
        })
    }
}

/// Client end of a streamable HTTP endpoint, stateless or stateful
pub struct StreamableHttpClientTransport {
    url: Url,
    settings: HttpClientSettings,
    client: Client,
    push_stream: bool,
    session_id: RwLock<Option<String>>,
    inbound_tx: mpsc::Sender<InboundItem>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundItem>>>,
    push_task: Mutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
    closing: AtomicBool,
    options: TransportOptions,
}

impl StreamableHttpClientTransport {
    /// `url` is the full MCP endpoint, e.g. `http://host:port/mcp`
    pub fn new(url: &str, settings: HttpClientSettings, options: TransportOptions) -> McpResult<Self> {
        let url = parse_http_url(url)?;
        let client = settings.build_client()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(options.channel_capacity);

        Ok(Self {
            url,
            settings,
            client,
            push_stream: true,
            session_id: RwLock::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            push_task: Mutex::new(None),
            closed: CancellationToken::new(),
            closing: AtomicBool::new(false),
            options,
        })
    }

    /// Whether to open the GET push stream once a session id is issued
    pub fn with_push_stream(mut self, enabled: bool) -> Self {
        self.push_stream = enabled;
        self
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    async fn record_session_id(&self, response: &reqwest::Response) {
        let Some(issued) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        else {
            return;
        };

        let is_new = {
            let mut current = self.session_id.write().await;
            if current.as_deref() == Some(issued) {
                false
            } else {
                *current = Some(issued.to_string());
                true
            }
        };

        if is_new {
            debug!(session_id = issued, "server issued a session id");
            if self.push_stream {
                self.open_push_stream(issued.to_string()).await;
            }
        }
    }

    async fn open_push_stream(&self, session_id: String) {
        let mut slot = self.push_task.lock().await;
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let request = self
            .settings
            .apply(self.client.get(self.url.clone()))
            .header(ACCEPT, "text/event-stream")
            .header(MCP_SESSION_ID_HEADER, session_id.as_str());
        let tx = self.inbound_tx.clone();
        let closed = self.closed.clone();
        let max_message_size = self.options.max_message_size;

        *slot = Some(tokio::spawn(async move {
            let response = tokio::select! {
                _ = closed.cancelled() => return,
                response = request.send() => response,
            };
            match response {
                Ok(response) if response.status().is_success() => {
                    forward_events(response, tx, closed, max_message_size, |_| {}).await;
                }
                Ok(response) => {
                    debug!(status = %response.status(), "server offers no push stream");
                }
                Err(e) => warn!(error = %e, "failed to open push stream"),
            }
        }));
    }

    async fn read_response_body(&self, response: reqwest::Response) -> McpResult<()> {
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("text/event-stream") {
            forward_events(
                response,
                self.inbound_tx.clone(),
                self.closed.clone(),
                self.options.max_message_size,
                |_| {},
            )
            .await;
            return Ok(());
        }

        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        let item = if body.len() > self.options.max_message_size {
            Err(DecodeError::parse("response body exceeds the size limit"))
        } else {
            codec::decode(&body)
        };
        send_bounded(&self.inbound_tx, item, self.options.send_timeout).await
    }
}

#[async_trait]
impl McpTransport for StreamableHttpClientTransport {
    async fn start(&self) -> McpResult<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }

        let body = codec::encode(&message)?;
        let session_id = self.session_id().await;

        let mut request = self
            .settings
            .apply(self.client.post(self.url.clone()))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body);
        if let Some(session_id) = &session_id {
            request = request.header(MCP_SESSION_ID_HEADER, session_id.as_str());
        }
        // Requests wait for their answer in the body; the caller bounds that wait
        if !message.is_request() {
            request = request.timeout(self.settings.request_timeout());
        }

        let response = request.send().await?;
        self.record_session_id(&response).await;

        match response.status() {
            StatusCode::ACCEPTED => Ok(()),
            status if status.is_success() => self.read_response_body(response).await,
            StatusCode::NOT_FOUND if session_id.is_some() => Err(McpError::ConnectionClosed {
                reason: "server ended the HTTP session".to_string(),
            }),
            status => {
                // Error envelopes (e.g. 400 with an InvalidRequest body) still correlate
                let _ = self.read_response_body(response).await;
                Err(McpError::Transport {
                    message: format!("POST to MCP endpoint failed with status: {}", status),
                })
            }
        }
    }

    async fn incoming(&self) -> McpResult<InboundStream> {
        let receiver = take_receiver(&self.inbound_rx).await?;
        Ok(inbound_stream(receiver, &self.closed))
    }

    async fn close(&self) -> McpResult<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.cancel();
        if let Some(task) = self.push_task.lock().await.take() {
            task.abort();
        }

        if let Some(session_id) = self.session_id.write().await.take() {
            let result = self
                .settings
                .apply(self.client.delete(self.url.clone()))
                .header(MCP_SESSION_ID_HEADER, session_id.as_str())
                .timeout(self.settings.request_timeout())
                .send()
                .await;
            if let Err(e) = result {
                debug!(session_id = %session_id, error = %e, "session DELETE failed");
            }
        }
        debug!(url = %self.url, "streamable HTTP client transport closed");
        Ok(())
    }
}
