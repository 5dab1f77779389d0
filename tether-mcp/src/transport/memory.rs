//! In-process transport pair

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    closed_error, inbound_stream, send_bounded, take_receiver, InboundItem, InboundStream,
    McpTransport, TransportOptions,
};
use crate::protocol::{codec, JsonRpcMessage};
use crate::McpResult;

/// One end of an in-process duplex channel.
///
/// Envelopes are pushed through the codec on the way across, so a pair
/// behaves like a byte transport without any I/O. Closing one end ends the
/// peer's inbound stream.
pub struct MemoryTransport {
    label: &'static str,
    outbound: Mutex<Option<mpsc::Sender<InboundItem>>>,
    inbound: Mutex<Option<mpsc::Receiver<InboundItem>>>,
    closed: CancellationToken,
    closing: AtomicBool,
    options: TransportOptions,
}

impl MemoryTransport {
    /// Connected pair with default options
    pub fn pair() -> (Self, Self) {
        Self::pair_with(TransportOptions::default())
    }

    pub fn pair_with(options: TransportOptions) -> (Self, Self) {
        let (left_tx, left_rx) = mpsc::channel(options.channel_capacity);
        let (right_tx, right_rx) = mpsc::channel(options.channel_capacity);
        let left = Self::new("left", right_tx, left_rx, options.clone());
        let right = Self::new("right", left_tx, right_rx, options);
        (left, right)
    }

    fn new(
        label: &'static str,
        outbound: mpsc::Sender<InboundItem>,
        inbound: mpsc::Receiver<InboundItem>,
        options: TransportOptions,
    ) -> Self {
        Self {
            label,
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Some(inbound)),
            closed: CancellationToken::new(),
            closing: AtomicBool::new(false),
            options,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl McpTransport for MemoryTransport {
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

        let sender = self.outbound.lock().await.clone().ok_or_else(closed_error)?;
        let frame = codec::encode(&message)?;
        send_bounded(&sender, codec::decode(&frame), self.options.send_timeout).await
    }

    async fn incoming(&self) -> McpResult<InboundStream> {
        let receiver = take_receiver(&self.inbound).await?;
        Ok(inbound_stream(receiver, &self.closed))
    }

    async fn close(&self) -> McpResult<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.cancel();
        // Dropping the sender ends the peer's inbound stream
        self.outbound.lock().await.take();
        debug!(side = self.label, "memory transport closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcRequest;
    use crate::McpError;
    use futures_util::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pair_exchanges_envelopes() {
        let (left, right) = MemoryTransport::pair();
        left.start().await.unwrap();
        right.start().await.unwrap();
        let mut inbound = right.incoming().await.unwrap();

        let request: JsonRpcMessage = JsonRpcRequest::with_id("ping", None, 1).into();
        left.send(request.clone()).await.unwrap();

        let received = inbound.next().await.unwrap().unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn test_incoming_taken_once() {
        let (left, _right) = MemoryTransport::pair();
        assert!(left.incoming().await.is_ok());
        assert!(left.incoming().await.is_err());
    }

    #[tokio::test]
    async fn test_close_ends_both_streams() {
        let (left, right) = MemoryTransport::pair();
        let mut left_in = left.incoming().await.unwrap();
        let mut right_in = right.incoming().await.unwrap();

        left.close().await.unwrap();
        left.close().await.unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(1), right_in.next()).await.unwrap();
        assert!(ended.is_none());
        let ended = tokio::time::timeout(Duration::from_secs(1), left_in.next()).await.unwrap();
        assert!(ended.is_none());

        let err = left
            .send(JsonRpcRequest::notification("x", None).into())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_full_queue_fails_after_send_timeout() {
        let options = TransportOptions {
            channel_capacity: 1,
            send_timeout: Duration::from_millis(20),
            ..TransportOptions::default()
        };
        let (left, _right) = MemoryTransport::pair_with(options);
        left.send(JsonRpcRequest::notification("a", None).into()).await.unwrap();
        let err = left
            .send(JsonRpcRequest::notification("b", None).into())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
    }
}
