use crate::protocol::{AppMessage, MAX_LINE_BYTES, NodeMessage, PROTOCOL_VERSION};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Node-side connection to the workload for a single job.
pub struct WorkloadClient {
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>,
}

impl WorkloadClient {
    /// Connect to the workload socket and announce the job.
    pub async fn connect(socket_path: &Path, job_id: &str) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
        let (r, w) = stream.into_split();
        let mut client = Self {
            reader: FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            writer: FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
        };
        client
            .send(NodeMessage::Hello {
                job_id: job_id.to_string(),
                version: PROTOCOL_VERSION,
            })
            .await?;
        Ok(client)
    }

    pub async fn send(&mut self, msg: NodeMessage) -> Result<()> {
        let line = serde_json::to_string(&msg)?;
        self.writer.send(line).await?;
        Ok(())
    }

    /// Split into independent writer and reader halves so the job can feed
    /// the workload and drain its output concurrently.
    pub fn into_split(self) -> (WorkloadWriter, WorkloadReader) {
        (
            WorkloadWriter {
                writer: self.writer,
            },
            WorkloadReader {
                reader: self.reader,
            },
        )
    }
}

/// Write half of a split [`WorkloadClient`].
pub struct WorkloadWriter {
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>,
}

impl WorkloadWriter {
    pub async fn send(&mut self, msg: NodeMessage) -> Result<()> {
        let line = serde_json::to_string(&msg)?;
        self.writer.send(line).await?;
        Ok(())
    }
}

/// Read half of a split [`WorkloadClient`].
pub struct WorkloadReader {
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
}

impl WorkloadReader {
    /// Read the next message from the workload.
    /// Returns `None` if the workload closed the connection.
    pub async fn next(&mut self) -> Option<Result<AppMessage>> {
        let line = self.reader.next().await?;
        Some(
            line.map_err(Into::into)
                .and_then(|l| serde_json::from_str(&l).map_err(Into::into)),
        )
    }
}

/// Discover the default workload socket path.
///
/// Checks `$CONFNODE_WORKLOAD_SOCKET`, then falls back to
/// `$XDG_RUNTIME_DIR/confnode/workload.sock` or `/tmp/confnode-$UID/workload.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(p) = std::env::var("CONFNODE_WORKLOAD_SOCKET") {
        return PathBuf::from(p);
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir)
            .join("confnode")
            .join("workload.sock");
    }
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/confnode-{uid}/workload.sock"))
}
