//! The `JobPipeline` gRPC service: one `RunJob` stream per job.

use crate::pipeline::{daemon_message, job_frame};
use crate::workload;
use anyhow::{Context, Result};
use confnode_job::{DaemonMessage, Job, JobChannels, JobConfig, JobServices};
use confnode_proto::pipeline::v1 as pb;
use confnode_proto::pipeline::v1::job_pipeline_server::{JobPipeline, JobPipelineServer};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::{Stream, StreamExt};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

pub type JobStream = Pin<Box<dyn Stream<Item = Result<pb::JobFrame, Status>> + Send>>;

#[derive(Clone)]
pub struct PipelineService {
    config: JobConfig,
    services: JobServices,
    workload_socket: Arc<PathBuf>,
}

impl PipelineService {
    pub fn new(config: JobConfig, services: JobServices, workload_socket: PathBuf) -> Self {
        Self {
            config,
            services,
            workload_socket: Arc::new(workload_socket),
        }
    }
}

#[tonic::async_trait]
impl JobPipeline for PipelineService {
    type RunJobStream = JobStream;

    async fn run_job(
        &self,
        req: Request<Streaming<pb::DaemonFrame>>,
    ) -> Result<Response<Self::RunJobStream>, Status> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let mut frames = req.into_inner();
        let capacity = self.config.channel_capacity;

        let (to_workload, from_workload) =
            workload::connect(&self.workload_socket, &job_id, capacity)
                .await
                .map_err(|e| {
                    tracing::error!(job_id = %job_id, err = %format!("{e:#}"), "workload unavailable");
                    Status::unavailable("workload unavailable")
                })?;

        let (inbound_tx, inbound) = mpsc::channel::<DaemonMessage>(capacity);
        let (outbound, mut outbound_rx) = mpsc::channel(capacity);

        let id = job_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                let message = match frame.map_err(anyhow::Error::from).and_then(daemon_message) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(job_id = %id, err = %e, "dropping daemon stream");
                        break;
                    }
                };
                if inbound_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        let job = Job::new(job_id.clone(), self.config.clone(), self.services.clone());
        tokio::spawn(async move {
            let outcome = job
                .run(JobChannels {
                    inbound,
                    outbound,
                    to_workload,
                    from_workload,
                })
                .await;
            tracing::info!(
                job_id = %outcome.job_id,
                request_id = ?outcome.request_id,
                summary = ?outcome.summary,
                abandoned = outcome.abandoned,
                "job stream closed"
            );
        });

        tracing::info!(job_id = %job_id, "job started");

        let stream = async_stream::stream! {
            while let Some(message) = outbound_rx.recv().await {
                yield Ok(job_frame(message));
            }
        };

        Ok(Response::new(Box::pin(stream)))
    }
}

/// Serve `service` on `listener` until `shutdown` resolves.
pub async fn serve(
    service: PipelineService,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<()> {
    Server::builder()
        .add_service(JobPipelineServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .context("pipeline server failed")
}

/// Spawn the service on a random local port.
/// Returns the bound address and a shutdown handle.
pub async fn spawn_pipeline(service: PipelineService) -> Result<(SocketAddr, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind pipeline")?;
    let local_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        serve(service, listener, async {
            let _ = shutdown_rx.await;
        })
        .await
        .ok();
    });

    Ok((local_addr, shutdown_tx))
}
