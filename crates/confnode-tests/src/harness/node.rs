use super::stream::JobStream;
use super::workload::TestWorkload;
use anyhow::{Context, Result};
use confnode_crypto::keys::DirectoryKeychain;
use confnode_crypto::ohttp::generate_keypair;
use confnode_crypto::token::TokenIssuer;
use confnode_crypto::{AttestedKey, AttestedKeySet, AttestedKeyStore, PrivateKeySource, PublicKey};
use confnode_daemon::config::{DaemonConfig, TokenIssuerConfig};
use confnode_daemon::keys::refresh;
use confnode_daemon::{Node, PipelineService, spawn_pipeline};
use confnode_job::{AttestationClient, Role};
use confnode_proto::app::v1::AttestationBundle;
use confnode_workload::listener::WorkloadListener;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::oneshot;

/// Release every test node runs unless told otherwise.
pub const RELEASE: &str = "sha256:confnode-test-release";

/// A daemon on a random port with its own state directory and workload
/// socket.
pub struct TestNode {
    pub addr: SocketAddr,
    pub key_id: u8,
    pub public_key: PublicKey,
    workload: WorkloadListener,
    attestation: Arc<dyn AttestationClient>,
    keys: Arc<AttestedKeyStore>,
    state_dir: TempDir,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _socket_dir: TempDir,
}

impl TestNode {
    /// Spawn a node whose tokens come from `issuer`.
    pub async fn spawn(role: Role, issuer: &TokenIssuer) -> Result<Self> {
        let state_dir = TempDir::new()?;
        let socket_dir = TempDir::new()?;
        let workload_socket = socket_dir.path().join("workload.sock");
        let workload = WorkloadListener::bind(&workload_socket)?;

        let config = DaemonConfig {
            listen: "127.0.0.1:0".to_string(),
            state_dir: state_dir.path().to_path_buf(),
            workload_socket,
            role,
            token_issuer: Some(TokenIssuerConfig {
                key_id: ISSUER_KEY_ID.to_string(),
                public_key: hex::encode(issuer.public_key_sec1()),
            }),
            ..DaemonConfig::default()
        };
        std::fs::create_dir_all(config.keychain_dir())?;
        let public_key = install_key(&config, 1, "node-key-1")?;

        let node = Node::load(&config).await.context("failed to load node")?;
        let attestation = node.attestation.clone();
        let keys = node.services.keys.clone();
        let service = PipelineService::new(
            config.job_config(),
            node.services,
            config.workload_socket.clone(),
        );
        let (addr, shutdown_tx) = spawn_pipeline(service).await?;
        Ok(Self {
            addr,
            key_id: 1,
            public_key,
            workload,
            attestation,
            keys,
            state_dir,
            shutdown_tx: Some(shutdown_tx),
            _socket_dir: socket_dir,
        })
    }

    /// Open a `RunJob` stream.
    pub async fn start_job(&self) -> Result<JobStream> {
        JobStream::open(self.addr).await
    }

    /// Accept the workload connection of the next job.
    pub async fn accept_job(&self) -> Result<TestWorkload> {
        Ok(TestWorkload::new(self.workload.accept().await?))
    }

    /// Publish a new current key and reload it, as on SIGHUP.
    pub async fn rotate_key(&mut self, key_id: u8) -> Result<()> {
        let config = DaemonConfig {
            state_dir: self.state_dir.path().to_path_buf(),
            ..DaemonConfig::default()
        };
        self.public_key = install_key(&config, key_id, &format!("node-key-{key_id}"))?;
        self.key_id = key_id;
        refresh(self.attestation.as_ref(), &self.keys).await?;
        Ok(())
    }

    /// The bundle a routing layer would present for this node.
    pub fn attestation_bundle(&self, release_digest: &str) -> AttestationBundle {
        AttestationBundle {
            release_digest: release_digest.to_string(),
            ohttp_public_key: self.public_key.to_bytes(),
            key_id: u32::from(self.key_id),
            expires_at_ms: 0,
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Key id the issuer stamps into its tokens.
pub const ISSUER_KEY_ID: &str = "test-issuer";

/// A token issuer every test node trusts once passed to [`TestNode::spawn`].
pub fn issuer() -> TokenIssuer {
    TokenIssuer::generate(ISSUER_KEY_ID)
}

/// Store a fresh private key in the keychain and make it the current key of
/// the node's key set.
fn install_key(config: &DaemonConfig, key_id: u8, reference: &str) -> Result<PublicKey> {
    let (sk, pk) = generate_keypair();
    DirectoryKeychain::new(config.keychain_dir()).store(reference, &sk)?;
    let set = AttestedKeySet {
        current: Some(AttestedKey {
            key_id,
            expires_at_ms: 0,
            release_digest: RELEASE.to_string(),
            source: PrivateKeySource::Keychain {
                reference: reference.to_string(),
            },
        }),
        unpublished: Vec::new(),
    };
    let path: PathBuf = config.key_set_path();
    std::fs::write(&path, serde_json::to_vec(&set)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(pk)
}
