//! Server-Sent Events transport implementation for MCP
//!
//! The server pushes envelopes over a long-lived `GET` event stream and
//! receives them through `POST {message endpoint}?sessionId=<id>`. The
//! first event on the stream (`event: endpoint`) tells the client where to
//! POST. Both directions correlate by envelope id only.

use async_trait::async_trait;
use axum::response::sse::Event;
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::{
    closed_error, inbound_stream, parse_http_url, send_bounded, take_receiver, trim_line_ending,
    HttpClientSettings, InboundItem, InboundStream, McpTransport, TransportOptions,
};
use crate::protocol::{codec, DecodeError, JsonRpcMessage};
use crate::{McpError, McpResult};

/// Room for a field name on top of the payload limit
const FIELD_OVERHEAD: usize = 64;

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    /// The payload ran past the parser's limit and was dropped
    pub oversized: bool,
}

/// Incremental `text/event-stream` parser.
///
/// Accepts arbitrary byte chunks; events are emitted once their terminating
/// blank line has arrived. Comment lines and events without data are dropped.
/// With a limit, neither a partial line nor an event's data grows past it.
#[derive(Debug, Default)]
pub struct SseEventParser {
    buffer: Vec<u8>,
    skipping_line: bool,
    event: Option<String>,
    data: Vec<String>,
    data_len: usize,
    oversized: bool,
    id: Option<String>,
    max_event_size: Option<usize>,
}

impl SseEventParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_event_size: usize) -> Self {
        Self {
            max_event_size: Some(max_event_size),
            ..Self::default()
        }
    }

    fn limit(&self) -> usize {
        self.max_event_size.unwrap_or(usize::MAX)
    }

    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        while !chunk.is_empty() {
            let Some(end) = chunk.iter().position(|b| *b == b'\n') else {
                if !self.skipping_line {
                    self.buffer.extend_from_slice(chunk);
                    if self.buffer.len() > self.limit().saturating_add(FIELD_OVERHEAD) {
                        self.buffer.clear();
                        self.skipping_line = true;
                        self.oversized = true;
                    }
                }
                break;
            };

            let (line, rest) = chunk.split_at(end + 1);
            chunk = rest;
            if std::mem::take(&mut self.skipping_line) {
                continue;
            }
            self.buffer.extend_from_slice(line);
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(trim_line_ending(&raw)).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data_len = self.data_len.saturating_add(value.len() + 1);
                if self.data_len > self.limit().saturating_add(1) {
                    self.oversized = true;
                    self.data.clear();
                } else if !self.oversized {
                    self.data.push(value.to_string());
                }
            }
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();
        self.data_len = 0;
        if std::mem::take(&mut self.oversized) {
            self.data.clear();
            return Some(SseEvent {
                event,
                data: String::new(),
                id,
                oversized: true,
            });
        }
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event,
            data: std::mem::take(&mut self.data).join("\n"),
            id,
            oversized: false,
        })
    }
}

/// Cancels the transport when the HTTP response stream is dropped
struct DisconnectGuard(CancellationToken);

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Server end of one SSE connection.
///
/// Created by the `GET` handler; the `POST` handler feeds envelopes in with
/// [`SseServerTransport::deliver`].
pub struct SseServerTransport {
    session_id: String,
    outbound_tx: mpsc::Sender<JsonRpcMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<JsonRpcMessage>>>,
    inbound_tx: mpsc::Sender<InboundItem>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundItem>>>,
    closed: CancellationToken,
    closing: AtomicBool,
    options: TransportOptions,
}

impl SseServerTransport {
    pub fn new(session_id: impl Into<String>, options: TransportOptions) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(options.channel_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(options.channel_capacity);
        Self {
            session_id: session_id.into(),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
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

    /// Queue an envelope received on the POST channel
    pub async fn deliver(&self, item: InboundItem) -> McpResult<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        send_bounded(&self.inbound_tx, item, self.options.send_timeout).await
    }

    /// Event stream for the GET response; the first event announces `endpoint`.
    ///
    /// Dropping the stream (client went away) closes the transport.
    pub async fn event_stream(
        &self,
        endpoint: String,
    ) -> McpResult<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
        let mut outbound = take_receiver(&self.outbound_rx).await?;
        let closed = self.closed.clone();
        let guard = DisconnectGuard(self.closed.clone());
        let session_id = self.session_id.clone();

        Ok(async_stream::stream! {
            let _guard = guard;
            yield Ok(Event::default().event("endpoint").data(endpoint));

            loop {
                let message = tokio::select! {
                    _ = closed.cancelled() => break,
                    message = outbound.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                match codec::encode(&message) {
                    Ok(frame) => {
                        let data = String::from_utf8_lossy(&frame).into_owned();
                        yield Ok(Event::default().event("message").data(data));
                    }
                    Err(e) => warn!(session_id = %session_id, error = %e, "dropping unencodable SSE frame"),
                }
            }
            debug!(session_id = %session_id, "SSE event stream finished");
        })
    }
}

#[async_trait]
impl McpTransport for SseServerTransport {
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
        send_bounded(&self.outbound_tx, message, self.options.send_timeout).await
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
        debug!(session_id = %self.session_id, "SSE server transport closed");
        Ok(())
    }
}

/// Client end of an SSE connection
pub struct SseClientTransport {
    sse_url: Url,
    settings: HttpClientSettings,
    client: Client,
    endpoint_tx: watch::Sender<Option<Url>>,
    endpoint_rx: watch::Receiver<Option<Url>>,
    inbound_tx: Mutex<Option<mpsc::Sender<InboundItem>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundItem>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    send_lock: Mutex<()>,
    closed: CancellationToken,
    closing: AtomicBool,
    options: TransportOptions,
}

impl SseClientTransport {
    /// `url` is the server base; the event stream is read from `{url}/sse`
    pub fn new(url: &str, settings: HttpClientSettings, options: TransportOptions) -> McpResult<Self> {
        let base = parse_http_url(url)?;
        let sse_url = if base.path().trim_end_matches('/').ends_with("/sse") {
            base
        } else {
            let mut sse_url = base.clone();
            let path = format!("{}/sse", base.path().trim_end_matches('/'));
            sse_url.set_path(&path);
            sse_url
        };

        let client = settings.build_client()?;
        let (endpoint_tx, endpoint_rx) = watch::channel(None);
        let (inbound_tx, inbound_rx) = mpsc::channel(options.channel_capacity);

        Ok(Self {
            sse_url,
            settings,
            client,
            endpoint_tx,
            endpoint_rx,
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            reader_task: Mutex::new(None),
            send_lock: Mutex::new(()),
            closed: CancellationToken::new(),
            closing: AtomicBool::new(false),
            options,
        })
    }

    /// POST endpoint announced by the server, once known
    pub fn message_endpoint(&self) -> Option<Url> {
        self.endpoint_rx.borrow().clone()
    }

    async fn wait_for_endpoint(&self) -> McpResult<()> {
        let mut endpoint = self.endpoint_rx.clone();
        let wait = async move { endpoint.wait_for(Option::is_some).await.map(|_| ()) };

        match tokio::time::timeout(self.settings.request_timeout(), wait).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(McpError::ConnectionClosed {
                reason: "event stream ended before announcing the message endpoint".to_string(),
            }),
            Err(_) => Err(McpError::Transport {
                message: "timed out waiting for the SSE endpoint event".to_string(),
            }),
        }
    }
}

/// Feed `message` events of an SSE response body into `tx`.
///
/// `endpoint` events are handed to `on_endpoint`; other event types are
/// ignored. Returns when the body ends, fails, or `closed` fires.
pub(crate) async fn forward_events<F>(
    response: reqwest::Response,
    tx: mpsc::Sender<InboundItem>,
    closed: CancellationToken,
    max_message_size: usize,
    mut on_endpoint: F,
) where
    F: FnMut(&str) + Send,
{
    let mut parser = SseEventParser::with_limit(max_message_size);
    let mut body = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = closed.cancelled() => break,
            chunk = body.next() => chunk,
        };

        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                warn!(error = %e, "SSE stream failed");
                break;
            }
            None => {
                debug!("SSE stream ended by server");
                break;
            }
        };

        for event in parser.push(&chunk) {
            match event.event.as_deref() {
                Some("endpoint") if !event.oversized => on_endpoint(event.data.trim()),
                None | Some("message") => {
                    let item = if event.oversized || event.data.len() > max_message_size {
                        Err(DecodeError::parse(format!(
                            "SSE frame exceeds the {} byte limit",
                            max_message_size
                        )))
                    } else {
                        codec::decode(event.data.as_bytes())
                    };
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
                Some(other) => debug!(event = other, "ignoring SSE event"),
            }
        }
    }
}

#[async_trait]
impl McpTransport for SseClientTransport {
    async fn start(&self) -> McpResult<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }

        {
            let mut task_slot = self.reader_task.lock().await;
            if task_slot.is_some() {
                return Ok(());
            }

            let request = self
                .settings
                .apply(self.client.get(self.sse_url.clone()))
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache");

            let response = request.send().await.map_err(|e| McpError::Transport {
                message: format!("Failed to connect to SSE endpoint: {}", e),
            })?;

            if !response.status().is_success() {
                return Err(McpError::Transport {
                    message: format!("SSE connection failed with status: {}", response.status()),
                });
            }

            let tx = self.inbound_tx.lock().await.take().ok_or_else(closed_error)?;
            let base = self.sse_url.clone();
            let endpoint = self.endpoint_tx.clone();
            *task_slot = Some(tokio::spawn(forward_events(
                response,
                tx,
                self.closed.clone(),
                self.options.max_message_size,
                move |data| match base.join(data) {
                    Ok(url) => {
                        debug!(endpoint = %url, "SSE message endpoint announced");
                        endpoint.send_replace(Some(url));
                    }
                    Err(e) => warn!(error = %e, data, "invalid SSE endpoint event"),
                },
            )));
        }

        self.wait_for_endpoint().await
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }

        let url = self.message_endpoint().ok_or_else(|| McpError::Transport {
            message: "SSE transport not started: no message endpoint yet".to_string(),
        })?;
        let body = codec::encode(&message)?;

        let _serialized = self.send_lock.lock().await;
        let response = self
            .settings
            .apply(self.client.post(url))
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.settings.request_timeout())
            .body(body)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(McpError::ConnectionClosed {
                reason: "server no longer knows this SSE session".to_string(),
            }),
            status => Err(McpError::Transport {
                message: format!("POST to message endpoint failed with status: {}", status),
            }),
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
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        debug!(url = %self.sse_url, "SSE client transport closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcRequest;
    use std::time::Duration;

    #[test]
    fn test_parser_handles_split_chunks() {
        let mut parser = SseEventParser::new();
        assert!(parser.push(b"event: endpoint\r\nda").is_empty());
        assert!(parser.push(b"ta: /message?sessionId=abc\r\n").is_empty());
        let events = parser.push(b"\r\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("endpoint".to_string()),
                data: "/message?sessionId=abc".to_string(),
                id: None,
                oversized: false,
            }]
        );
    }

    #[test]
    fn test_parser_joins_data_lines_and_skips_comments() {
        let mut parser = SseEventParser::new();
        let events = parser.push(b":keep-alive\n\ndata: {\"a\":\ndata: 1}\nid: 7\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"a\":\n1}");
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn test_parser_limit_drops_unterminated_payload() {
        let mut parser = SseEventParser::with_limit(32);
        assert!(parser.push(b"event: message\ndata: ").is_empty());
        for _ in 0..1000 {
            assert!(parser.push(&[b'q'; 512]).is_empty());
        }
        assert!(parser.buffer.len() <= 32 + FIELD_OVERHEAD);

        let events = parser.push(b"\n\ndata: {}\n\n");
        assert_eq!(events.len(), 2);
        assert!(events[0].oversized);
        assert!(events[0].data.is_empty());
        assert_eq!(events[1].data, "{}");
        assert!(!events[1].oversized);
    }

    #[test]
    fn test_parser_limit_counts_joined_data_lines() {
        let mut parser = SseEventParser::with_limit(16);
        let events = parser.push(b"data: 0123456789\ndata: 0123456789\n\n");
        assert_eq!(events.len(), 1);
        assert!(events[0].oversized);

        let events = parser.push(b"data: 01234\ndata: 56789\n\n");
        assert_eq!(events[0].data, "01234\n56789");
    }

    #[test]
    fn test_client_url_building() {
        let transport = SseClientTransport::new(
            "http://127.0.0.1:9/base/",
            HttpClientSettings::default(),
            TransportOptions::default(),
        )
        .unwrap();
        assert_eq!(transport.sse_url.as_str(), "http://127.0.0.1:9/base/sse");

        assert!(SseClientTransport::new(
            "file:///tmp/x",
            HttpClientSettings::default(),
            TransportOptions::default()
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_server_stream_announces_endpoint_then_messages() {
        let transport = SseServerTransport::new("s1", TransportOptions::default());
        let stream = transport
            .event_stream("/message?sessionId=s1".to_string())
            .await
            .unwrap();
        let mut stream = Box::pin(stream);

        transport
            .send(JsonRpcRequest::notification("notifications/message", None).into())
            .await
            .unwrap();

        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());

        transport.close().await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_transport() {
        let transport = SseServerTransport::new("s2", TransportOptions::default());
        let stream = transport.event_stream("/m".to_string()).await.unwrap();
        drop(stream);

        assert!(transport.is_closed());
        assert!(transport.deliver(Err(DecodeError::parse("x"))).await.is_err());
    }
}
