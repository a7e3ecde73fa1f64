use super::within;
use confnode_workload::listener::JobConnection;
use confnode_workload::protocol::{AppMessage, NodeMessage};

/// A scripted workload serving one job.
pub struct TestWorkload {
    conn: JobConnection,
}

impl TestWorkload {
    pub fn new(conn: JobConnection) -> Self {
        Self { conn }
    }

    pub fn job_id(&self) -> &str {
        self.conn.job_id()
    }

    pub async fn recv(&mut self) -> NodeMessage {
        within("workload message", self.conn.recv())
            .await
            .expect("node hung up")
            .expect("bad node message")
    }

    /// Wait until the node hangs up, returning what it sent meanwhile.
    pub async fn recv_until_closed(&mut self) -> Vec<NodeMessage> {
        let mut out = Vec::new();
        while let Some(msg) = within("workload hangup", self.conn.recv()).await {
            out.push(msg.expect("bad node message"));
        }
        out
    }

    pub async fn send(&mut self, msg: AppMessage) {
        self.conn.send(msg).await.expect("node hung up");
    }

    /// Answer with one final chunk and end the job.
    pub async fn respond(&mut self, data: &[u8]) {
        self.send(AppMessage::Chunk {
            data: data.to_vec(),
            is_final: true,
        })
        .await;
        self.send(AppMessage::EndOfResponse).await;
        self.send(AppMessage::EndJob).await;
    }
}
