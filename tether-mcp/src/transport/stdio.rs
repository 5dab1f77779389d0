//! Standard I/O transport implementation for MCP
//!
//! One JSON document per line in each direction. The server side wraps the
//! process's own stdin/stdout (or any reader/writer pair); the client side
//! spawns the server as a child process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    closed_error, inbound_stream, take_receiver, trim_line_ending, InboundItem, InboundStream,
    McpTransport, TransportOptions,
};
use crate::protocol::{codec, DecodeError, JsonRpcMessage};
use crate::{McpError, McpResult};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Line-delimited transport over a byte stream pair
pub struct StdioTransport {
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BufWriter<BoxedWriter>>>,
    child: Mutex<Option<Child>>,
    inbound_tx: Mutex<Option<mpsc::Sender<InboundItem>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundItem>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    options: TransportOptions,
    closed: CancellationToken,
    closing: AtomicBool,
}

impl StdioTransport {
    /// Transport over an arbitrary reader/writer pair
    pub fn new<R, W>(reader: R, writer: W, options: TransportOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::assemble(Box::new(reader), Box::new(writer), None, options)
    }

    fn assemble(
        reader: BoxedReader,
        writer: BoxedWriter,
        child: Option<Child>,
        options: TransportOptions,
    ) -> Self {
        let (tx, rx) = mpsc::channel(options.channel_capacity);
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(BufWriter::new(writer))),
            child: Mutex::new(child),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
            reader_task: Mutex::new(None),
            options,
            closed: CancellationToken::new(),
            closing: AtomicBool::new(false),
        }
    }

    /// Server side: this process's stdin and stdout
    pub fn stdio(options: TransportOptions) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), options)
    }

    /// Client side: spawn `command` and talk over its pipes.
    ///
    /// The child's stderr is inherited so its logs stay visible.
    pub fn spawn(
        command: impl AsRef<str>,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
        options: TransportOptions,
    ) -> McpResult<Self> {
        let command = command.as_ref();
        if command.trim().is_empty() {
            return Err(McpError::Configuration {
                message: "Command cannot be empty".to_string(),
            });
        }

        let mut cmd = Command::new(command);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .envs(&env)
            .kill_on_drop(true);

        if let Some(cwd) = &cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::Transport {
            message: format!("Failed to spawn process '{}': {}", command, e),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Transport {
            message: "Failed to get stdin handle".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Transport {
            message: "Failed to get stdout handle".to_string(),
        })?;

        debug!(command, pid = ?child.id(), "spawned stdio server process");

        Ok(Self::assemble(
            Box::new(stdout),
            Box::new(stdin),
            Some(child),
            options,
        ))
    }

    async fn write_frame(&self, frame: &[u8]) -> McpResult<()> {
        // One lock per frame keeps lines whole under concurrent senders
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(closed_error)?;

        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };

        match tokio::time::timeout(self.options.send_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(McpError::Transport {
                message: format!("Failed to write frame: {}", e),
            }),
            Err(_) => Err(McpError::Transport {
                message: format!("write blocked for {:?}", self.options.send_timeout),
            }),
        }
    }

    async fn stop_child(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        // Give the process a chance to exit on EOF first
        match tokio::time::timeout(Duration::from_millis(200), child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "stdio server process exited"),
            Ok(Err(e)) => warn!("Error waiting for child process: {}", e),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill child process: {}", e);
                }
            }
        }
    }
}

/// Outcome of one bounded line read
#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Eof,
    Line,
    /// The line ran past the limit; its bytes were skipped up to the newline
    Oversized { skipped: usize },
}

/// Read one `\n`-terminated line into `buffer`, holding at most `limit` bytes.
///
/// A longer line is consumed and dropped without being buffered.
async fn read_line_bounded<R>(reader: &mut R, buffer: &mut Vec<u8>, limit: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (skipped, buffer.is_empty()) {
                (0, true) => LineRead::Eof,
                (0, false) => LineRead::Line,
                (skipped, _) => LineRead::Oversized { skipped },
            });
        }

        let (used, complete) = match available.iter().position(|b| *b == b'\n') {
            Some(end) => (end + 1, true),
            None => (available.len(), false),
        };
        if skipped == 0 && buffer.len() + used <= limit {
            buffer.extend_from_slice(&available[..used]);
        } else {
            skipped += buffer.len() + used;
            buffer.clear();
        }
        reader.consume(used);

        if complete {
            return Ok(if skipped == 0 {
                LineRead::Line
            } else {
                LineRead::Oversized { skipped }
            });
        }
    }
}

async fn read_frames(
    reader: BoxedReader,
    tx: mpsc::Sender<InboundItem>,
    closed: CancellationToken,
    max_message_size: usize,
) {
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    // Room for a trailing "\r\n"
    let line_limit = max_message_size.saturating_add(2);

    loop {
        buffer.clear();
        let read = tokio::select! {
            _ = closed.cancelled() => break,
            read = read_line_bounded(&mut reader, &mut buffer, line_limit) => read,
        };

        let item = match read {
            Ok(LineRead::Eof) => {
                debug!("stdio peer closed its output");
                break;
            }
            Ok(LineRead::Oversized { skipped }) => {
                warn!(bytes = skipped, limit = max_message_size, "dropping oversized stdio frame");
                Err(DecodeError::parse(format!(
                    "frame of {} bytes exceeds the {} byte limit",
                    skipped, max_message_size
                )))
            }
            Ok(LineRead::Line) => {
                let line = trim_line_ending(&buffer);
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let item = if line.len() > max_message_size {
                    Err(DecodeError::parse(format!(
                        "frame of {} bytes exceeds the {} byte limit",
                        line.len(),
                        max_message_size
                    )))
                } else {
                    codec::decode(line)
                };
                trace!(bytes = line.len(), ok = item.is_ok(), "stdio frame received");
                item
            }
            Err(e) => {
                warn!(error = %e, "stdio read failed");
                break;
            }
        };

        if tx.send(item).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn start(&self) -> McpResult<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }

        let Some(reader) = self.reader.lock().await.take() else {
            return Ok(());
        };
        let tx = self.inbound_tx.lock().await.take().ok_or_else(closed_error)?;

        let task = tokio::spawn(read_frames(
            reader,
            tx,
            self.closed.clone(),
            self.options.max_message_size,
        ));
        *self.reader_task.lock().await = Some(task);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        let frame = codec::encode_line(&message)?;
        self.write_frame(&frame).await
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

        // Closing our output signals EOF to the peer
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }

        self.stop_child().await;
        debug!("stdio transport closed");
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // Best effort cleanup
        if let Ok(mut slot) = self.child.try_lock() {
            if let Some(child) = slot.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}
