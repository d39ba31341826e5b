//! Line-oriented management server.

use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{error, info};

use super::service::ManagementService;
use crate::error::Result;

/// Serves the management protocol over a byte stream.
///
/// Each request line gets exactly one response line, in order.
pub struct ManagementServer {
    service: Arc<ManagementService>,
}

impl ManagementServer {
    /// Create a new server for a service.
    pub fn new(service: Arc<ManagementService>) -> Self {
        Self { service }
    }

    /// Serve until the input is exhausted.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.serve_with_shutdown(reader, writer, std::future::pending())
            .await
    }

    /// Serve until the input is exhausted or `signal` resolves.
    pub async fn serve_with_shutdown<R, W, F>(self, reader: R, mut writer: W, signal: F) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        let mut lines = LinesStream::new(BufReader::new(reader).lines());
        tokio::pin!(signal);

        info!("Management server accepting requests");

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Management server shutting down");
                    break;
                }
                line = lines.next() => {
                    let Some(line) = line else {
                        info!("Management input closed");
                        break;
                    };
                    let line = line.map_err(|e| {
                        error!(error = %e, "Failed to read management input");
                        e
                    })?;
                    if line.trim().is_empty() {
                        continue;
                    }

                    let response = self.service.handle_line(&line).await;
                    writer.write_all(response.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await?;
                }
            }
        }

        Ok(())
    }

    /// Serve on the process's stdin and stdout.
    pub async fn serve_stdio_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.serve_with_shutdown(tokio::io::stdin(), tokio::io::stdout(), signal)
            .await
    }
}
