//! Line-delimited TCP listener for ad-hoc handlers.
//!
//! Each line is one `TimelineHandler` document. The handler is launched
//! alongside the loaded timeline and echoed back, with trackable ids filled
//! in, as a single response line.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TimelineError};
use crate::scheduler::Orchestrator;
use crate::timeline::ingest::parse_handler;

/// Longest accepted line. Anything longer is discarded up to the next newline.
pub const MAX_LINE_BYTES: u64 = 1024 * 1024;

pub struct SocketListener {
    listener: TcpListener,
    orchestrator: Arc<Orchestrator>,
}

impl SocketListener {
    pub async fn bind(addr: SocketAddr, orchestrator: Arc<Orchestrator>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            orchestrator,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown. Each connection gets its own task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.listener.local_addr() {
                Ok(addr) => tracing::info!(%addr, "Socket listener started"),
                Err(e) => tracing::warn!("Socket listener address unavailable: {}", e),
            }

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "Socket listener connection accepted");
                            let orchestrator = self.orchestrator.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                serve_connection(stream, orchestrator, shutdown).await;
                                tracing::debug!(%peer, "Socket listener connection closed");
                            });
                        }
                        Err(e) => tracing::warn!("Socket listener accept failed: {}", e),
                    },
                }
            }
            tracing::info!("Socket listener stopped");
        })
    }
}

async fn serve_connection(
    stream: TcpStream,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_LINE_BYTES);
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = limited.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Socket listener read failed: {}", e);
                break;
            }
        }

        if buf.last() != Some(&b'\n') && buf.len() as u64 >= MAX_LINE_BYTES {
            tracing::warn!(limit = MAX_LINE_BYTES, "Ignoring oversized command");
            if let Err(e) = discard_line(&mut reader).await {
                tracing::warn!("Socket listener read failed: {}", e);
                break;
            }
            continue;
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Ignoring command that is not UTF-8: {}", e);
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match handle_line(&orchestrator, line).await {
            Ok(mut response) => {
                response.push('\n');
                if let Err(e) = write.write_all(response.as_bytes()).await {
                    tracing::warn!("Socket listener write failed: {}", e);
                    break;
                }
            }
            Err(e) => tracing::warn!("Ignoring malformed command: {}", e),
        }
    }
}

/// Skip input up to and including the next newline, or to end of stream.
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    loop {
        let (newline, available) = {
            let chunk = reader.fill_buf().await?;
            (chunk.iter().position(|b| *b == b'\n'), chunk.len())
        };
        match newline {
            Some(at) => {
                reader.consume(at + 1);
                return Ok(());
            }
            None if available == 0 => return Ok(()),
            None => reader.consume(available),
        }
    }
}

/// Parse one line, launch it, and return the echoed handler.
///
/// Launch failures are logged; the parsed handler is still echoed.
pub async fn handle_line(
    orchestrator: &Orchestrator,
    line: &str,
) -> std::result::Result<String, TimelineError> {
    let handler = parse_handler(line)?;
    let response = serde_json::to_string(&handler)?;

    let handler_type = handler.handler_type.clone();
    match orchestrator.run_command(handler).await {
        Ok(job_id) => {
            tracing::info!(job_id = %job_id, handler = %handler_type, "Socket command received")
        }
        Err(e) => {
            tracing::warn!(handler = %handler_type, "Socket command not launched: {}", e)
        }
    }
    Ok(response)
}
