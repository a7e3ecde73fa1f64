use super::within;
use anyhow::{Context, Result};
use confnode_daemon::pipeline::{daemon_frame, job_message};
use confnode_job::{DaemonMessage, JobMessage};
use confnode_proto::pipeline::v1::job_pipeline_client::JobPipelineClient;
use confnode_proto::pipeline::v1::{DaemonFrame, JobFrame};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Streaming;

/// The daemon side of one `RunJob` call.
pub struct JobStream {
    tx: Option<mpsc::Sender<DaemonFrame>>,
    rx: Streaming<JobFrame>,
}

impl JobStream {
    pub async fn open(addr: SocketAddr) -> Result<Self> {
        let mut client = JobPipelineClient::connect(format!("http://{addr}"))
            .await
            .context("failed to connect to pipeline")?;
        let (tx, rx) = mpsc::channel(64);
        let response = client
            .run_job(ReceiverStream::new(rx))
            .await
            .context("RunJob failed")?;
        Ok(Self {
            tx: Some(tx),
            rx: response.into_inner(),
        })
    }

    pub async fn send(&self, message: DaemonMessage) {
        self.tx
            .as_ref()
            .expect("stream already closed")
            .send(daemon_frame(message))
            .await
            .expect("job stream closed");
    }

    /// Half-close the request side, as a crashed daemon would.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// The next message from the job, or `None` once the job stream ended.
    pub async fn next(&mut self) -> Option<JobMessage> {
        let frame = within("job frame", self.rx.message())
            .await
            .expect("job stream failed")?;
        Some(job_message(frame).expect("bad job frame"))
    }

    /// Everything the job sends up to and including `EndJob`.
    pub async fn drain(&mut self) -> Vec<JobMessage> {
        let mut out = Vec::new();
        while let Some(message) = self.next().await {
            let done = message == JobMessage::EndJob;
            out.push(message);
            if done {
                break;
            }
        }
        out
    }
}
