//! Bridges a job's workload channels onto the workload's Unix socket.

use anyhow::Result;
use confnode_workload::client::WorkloadClient;
use confnode_workload::protocol::{AppMessage, NodeMessage};
use std::path::Path;
use tokio::sync::mpsc;

/// Connect to the workload for `job_id` and pump messages in both
/// directions. Either channel closing means the workload is gone.
pub async fn connect(
    socket_path: &Path,
    job_id: &str,
    capacity: usize,
) -> Result<(mpsc::Sender<NodeMessage>, mpsc::Receiver<AppMessage>)> {
    let client = WorkloadClient::connect(socket_path, job_id).await?;
    let (mut writer, mut reader) = client.into_split();
    let (to_workload, mut outgoing) = mpsc::channel::<NodeMessage>(capacity);
    let (incoming, from_workload) = mpsc::channel::<AppMessage>(capacity);

    let id = job_id.to_string();
    tokio::spawn(async move {
        while let Some(msg) = outgoing.recv().await {
            if let Err(e) = writer.send(msg).await {
                tracing::warn!(job_id = %id, err = %e, "workload write failed");
                break;
            }
        }
    });

    let id = job_id.to_string();
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = incoming.closed() => break,
                msg = reader.next() => msg,
            };
            let Some(msg) = msg else { break };
            match msg {
                Ok(msg) => {
                    if incoming.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %id, err = %e, "bad message from workload");
                    break;
                }
            }
        }
        tracing::debug!(job_id = %id, "workload stream closed");
    });

    Ok((to_workload, from_workload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use confnode_workload::listener::WorkloadListener;

    #[tokio::test]
    async fn messages_flow_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workload.sock");
        let listener = WorkloadListener::bind(&path).unwrap();

        let (tx, mut rx) = connect(&path, "job-1", 8).await.unwrap();
        let mut conn = listener.accept().await.unwrap();
        assert_eq!(conn.job_id(), "job-1");

        tx.send(NodeMessage::Teardown).await.unwrap();
        assert_eq!(conn.recv().await.unwrap().unwrap(), NodeMessage::Teardown);

        conn.send(AppMessage::EndJob).await.unwrap();
        assert_eq!(rx.recv().await, Some(AppMessage::EndJob));

        drop(conn);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn missing_socket_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(connect(&dir.path().join("absent.sock"), "job-1", 8).await.is_err());
    }
}
