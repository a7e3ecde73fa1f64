use anyhow::{Context, Result};
use clap::Parser;
use confnode_daemon::keys::spawn_reload_on_sighup;
use confnode_daemon::{DaemonConfig, Node, PipelineService, serve};
use confnode_job::Role;
use std::path::PathBuf;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(author, version, about = "confidential compute node daemon")]
struct Args {
    /// TOML config file. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address the JobPipeline service listens on.
    #[arg(long)]
    listen: Option<String>,

    /// State directory holding the attested key set and keychain.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Path to the workload's Unix socket.
    #[arg(long)]
    workload_socket: Option<PathBuf>,

    /// worker, proxy or reject_only.
    #[arg(long)]
    role: Option<Role>,

    /// Log token validation failures instead of rejecting the request.
    #[arg(long)]
    no_enforce_token_validation: bool,
}

impl Args {
    fn apply(self, mut config: DaemonConfig) -> DaemonConfig {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(state_dir) = self.state_dir {
            config.state_dir = state_dir;
        }
        if let Some(socket) = self.workload_socket {
            config.workload_socket = socket;
        }
        if let Some(role) = self.role {
            config.role = role;
        }
        if self.no_enforce_token_validation {
            config.enforce_token_validation = false;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confnode_daemon=info,confnode_job=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = DaemonConfig::load(args.config.as_deref())?;
    let config = args.apply(config);

    let node = Node::load(&config).await?;
    spawn_reload_on_sighup(node.attestation.clone(), node.services.keys.clone())?;

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        role = %config.role,
        workload_socket = %config.workload_socket.display(),
        "node daemon listening"
    );

    let service = PipelineService::new(
        config.job_config(),
        node.services,
        config.workload_socket.clone(),
    );
    serve(service, listener, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await
}
