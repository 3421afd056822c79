//! Line-delimited JSON-RPC over stdin/stdout for one local client.
//!
//! Each line is one request. Requests run concurrently; responses are
//! written as they complete, one JSON object per line, through a single
//! writer task. The credential comes from configuration because a stdio
//! client has no way to send headers. Framing errors are answered with a
//! JSON-RPC error and the loop continues; only I/O errors end it.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskgate_core::Gateway;
use taskgate_core::config::Secret;
use taskgate_core::context::{RequestContext, TransportKind};
use taskgate_core::jsonrpc::{JsonRpcRequest, JsonRpcResponse, ProtocolError};

use crate::error::FramingError;

/// Outbound line buffer between request tasks and the writer.
const OUTBOUND_CAPACITY: usize = 64;

pub struct StdioTransport {
    gateway: Arc<Gateway>,
    credential: Secret,
    max_line_bytes: usize,
}

impl StdioTransport {
    pub fn new(gateway: Arc<Gateway>, credential: Secret, max_line_bytes: usize) -> Self {
        Self {
            gateway,
            credential,
            max_line_bytes,
        }
    }

    /// Serve the process's own stdin/stdout until EOF or shutdown.
    pub async fn serve_stdio(&self, shutdown: CancellationToken) -> Result<(), FramingError> {
        let reader = tokio::io::BufReader::new(tokio::io::stdin());
        self.run(reader, tokio::io::stdout(), shutdown).await
    }

    /// Serve one client over arbitrary streams.
    ///
    /// Returns after EOF or cancellation, once every in-flight request has
    /// been answered and the writer has flushed.
    pub async fn run<R, W>(
        &self,
        mut reader: R,
        writer: W,
        shutdown: CancellationToken,
    ) -> Result<(), FramingError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<JsonRpcResponse>(OUTBOUND_CAPACITY);
        let writer_task = tokio::spawn(write_responses(rx, writer));
        let mut in_flight = JoinSet::new();
        let mut buf = Vec::new();
        let mut result = Ok(());

        info!("Stdio transport started");

        loop {
            buf.clear();
            let read = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Stdio transport: shutdown signal received");
                    break;
                }
                read = bounded_read_line(&mut reader, &mut buf, self.max_line_bytes) => read,
            };

            let request = match read {
                Ok(0) => {
                    debug!("Stdio transport: stdin EOF");
                    break;
                }
                Ok(_) => match parse_line(&buf) {
                    Ok(Some(request)) => request,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "Stdio framing error");
                        if tx.send(framing_response(&e)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                },
                Err(e @ FramingError::MessageTooLarge { .. }) => {
                    warn!(error = %e, "Stdio message exceeded size limit, skipping");
                    if tx.send(framing_response(&e)).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };

            let gateway = Arc::clone(&self.gateway);
            let credential = self.credential.clone();
            let tx = tx.clone();
            in_flight.spawn(async move {
                let ctx = RequestContext::new(TransportKind::Stdio, None);
                if let Some(response) = gateway
                    .handle(Some(credential.expose()), request, ctx)
                    .await
                {
                    let _ = tx.send(response).await;
                }
            });

            // Reap finished tasks so the set stays small on long sessions.
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        drop(tx);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if result.is_ok() {
                    result = Err(FramingError::Io(e));
                }
            }
            Err(e) => warn!(error = %e, "Stdio writer task failed"),
        }

        info!("Stdio transport stopped");
        result
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("max_line_bytes", &self.max_line_bytes)
            .finish_non_exhaustive()
    }
}

async fn write_responses<W>(
    mut rx: mpsc::Receiver<JsonRpcResponse>,
    mut writer: W,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_vec(&response).map_err(std::io::Error::other)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Parse one raw line. Blank lines are skipped (`Ok(None)`).
pub fn parse_line(raw: &[u8]) -> Result<Option<JsonRpcRequest>, FramingError> {
    let line = std::str::from_utf8(raw).map_err(|_| FramingError::InvalidUtf8)?;
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.starts_with('[') {
        return Err(FramingError::UnsupportedBatch);
    }
    Ok(Some(JsonRpcRequest::from_slice(trimmed.as_bytes())?))
}

/// JSON-RPC answer for a line that could not be used.
fn framing_response(error: &FramingError) -> JsonRpcResponse {
    match error {
        FramingError::Protocol(protocol) => protocol.to_response(),
        FramingError::UnsupportedBatch => ProtocolError::InvalidRequest {
            id: None,
            reason: error.to_string(),
        }
        .to_response(),
        other => ProtocolError::Parse(other.to_string()).to_response(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bounded Line Reading
// ─────────────────────────────────────────────────────────────────────────────

/// Read a single line, enforcing a byte limit.
///
/// Bytes are accumulated raw so multi-byte UTF-8 sequences split across
/// buffer boundaries survive. On overflow the rest of the line is discarded
/// and the reader is left at the start of the next line.
///
/// Returns `Ok(0)` at EOF.
pub async fn bounded_read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<usize, FramingError> {
    let mut total = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(total);
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let to_consume = pos + 1;
                if total + to_consume > max_bytes {
                    reader.consume(to_consume);
                    return Err(FramingError::MessageTooLarge { max_bytes });
                }
                buf.extend_from_slice(&available[..to_consume]);
                total += to_consume;
                reader.consume(to_consume);
                return Ok(total);
            }
            None => {
                let len = available.len();
                if total + len > max_bytes {
                    reader.consume(len);
                    discard_until_newline(reader).await?;
                    return Err(FramingError::MessageTooLarge { max_bytes });
                }
                buf.extend_from_slice(available);
                total += len;
                reader.consume(len);
            }
        }
    }
}

async fn discard_until_newline<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            reader.consume(pos + 1);
            return Ok(());
        }
        let len = available.len();
        reader.consume(len);
    }
}
