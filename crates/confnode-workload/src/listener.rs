use crate::protocol::{AppMessage, MAX_LINE_BYTES, NodeMessage};
use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// App-side listener. The node opens one connection per job.
pub struct WorkloadListener {
    listener: UnixListener,
    path: PathBuf,
}

impl WorkloadListener {
    pub fn bind(socket_path: &Path) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        // Remove stale socket
        if socket_path.exists() {
            std::fs::remove_file(socket_path).ok();
        }

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600)).ok();
        }

        tracing::info!(path = %socket_path.display(), "workload socket listening");
        Ok(Self {
            listener,
            path: socket_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept the next job connection and read its Hello.
    pub async fn accept(&self) -> Result<JobConnection> {
        let (stream, _) = self.listener.accept().await?;
        JobConnection::handshake(stream).await
    }
}

impl Drop for WorkloadListener {
    fn drop(&mut self) {
        std::fs::remove_file(&self.path).ok();
    }
}

/// App-side view of one job.
pub struct JobConnection {
    job_id: String,
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>,
}

impl JobConnection {
    async fn handshake(stream: UnixStream) -> Result<Self> {
        let (r, w) = stream.into_split();
        let mut conn = Self {
            job_id: String::new(),
            reader: FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            writer: FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
        };
        match conn.recv().await {
            Some(Ok(NodeMessage::Hello { job_id, .. })) => {
                conn.job_id = job_id;
                Ok(conn)
            }
            Some(Ok(other)) => bail!("expected hello, got {other:?}"),
            Some(Err(e)) => Err(e),
            None => bail!("node disconnected before hello"),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Next message from the node, or `None` once the node hung up.
    pub async fn recv(&mut self) -> Option<Result<NodeMessage>> {
        let line = self.reader.next().await?;
        Some(
            line.map_err(Into::into)
                .and_then(|l| serde_json::from_str(&l).map_err(Into::into)),
        )
    }

    pub async fn send(&mut self, msg: AppMessage) -> Result<()> {
        let line = serde_json::to_string(&msg)?;
        self.writer.send(line).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::WorkloadClient;

    #[tokio::test]
    async fn hello_then_messages_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workload.sock");
        let listener = WorkloadListener::bind(&path).unwrap();

        let app = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            assert_eq!(conn.job_id(), "job-1");
            let msg = conn.recv().await.unwrap().unwrap();
            assert_eq!(
                msg,
                NodeMessage::Chunk {
                    data: b"ping".to_vec(),
                    is_final: true
                }
            );
            conn.send(AppMessage::Chunk {
                data: b"pong".to_vec(),
                is_final: true,
            })
            .await
            .unwrap();
            conn.send(AppMessage::EndOfResponse).await.unwrap();
        });

        let client = WorkloadClient::connect(&path, "job-1").await.unwrap();
        let (mut writer, mut reader) = client.into_split();
        writer
            .send(NodeMessage::Chunk {
                data: b"ping".to_vec(),
                is_final: true,
            })
            .await
            .unwrap();

        assert_eq!(
            reader.next().await.unwrap().unwrap(),
            AppMessage::Chunk {
                data: b"pong".to_vec(),
                is_final: true
            }
        );
        assert_eq!(reader.next().await.unwrap().unwrap(), AppMessage::EndOfResponse);
        app.await.unwrap();
        assert!(reader.next().await.is_none());
    }
}
