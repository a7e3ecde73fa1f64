//! Daemon configuration: an optional TOML file, overridden by flags.

use anyhow::{Context, Result};
use confnode_job::config::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_MESSAGE_SIZE};
use confnode_job::{JobConfig, Role};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// File name of the attested key set inside the state directory.
pub const KEY_SET_FILE: &str = "attested_keys.json";

/// Directory of keychain-held private keys inside the state directory.
pub const KEYCHAIN_DIR: &str = "keychain";

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "confnode_workload::client::default_socket_path")]
    pub workload_socket: PathBuf,
    #[serde(default)]
    pub role: Role,
    #[serde(default = "default_true")]
    pub enforce_token_validation: bool,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Issuer of token-granting tokens. Required while validation is enforced.
    #[serde(default)]
    pub token_issuer: Option<TokenIssuerConfig>,
    /// Release digests a downstream worker may run. Empty means "the same
    /// release as this node".
    #[serde(default)]
    pub allowed_release_digests: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TokenIssuerConfig {
    pub key_id: String,
    /// Hex-encoded SEC1 secp256k1 public key.
    pub public_key: String,
}

impl DaemonConfig {
    /// Read `path` if given, else the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Self::parse(&contents).with_context(|| format!("invalid config {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn job_config(&self) -> JobConfig {
        JobConfig {
            role: self.role,
            enforce_token_validation: self.enforce_token_validation,
            max_message_size: self.max_message_size,
            channel_capacity: self.channel_capacity,
        }
    }

    pub fn key_set_path(&self) -> PathBuf {
        self.state_dir.join(KEY_SET_FILE)
    }

    pub fn keychain_dir(&self) -> PathBuf {
        self.state_dir.join(KEYCHAIN_DIR)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            state_dir: default_state_dir(),
            workload_socket: confnode_workload::client::default_socket_path(),
            role: Role::default(),
            enforce_token_validation: true,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            token_issuer: None,
            allowed_release_digests: Vec::new(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:50700".to_string()
}

fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STATE_DIRECTORY") {
        PathBuf::from(dir)
    } else {
        PathBuf::from("/var/lib/confnode")
    }
}

fn default_true() -> bool {
    true
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = DaemonConfig::parse("").unwrap();
        assert_eq!(config.listen, "127.0.0.1:50700");
        assert_eq!(config.role, Role::Worker);
        assert!(config.enforce_token_validation);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(config.token_issuer.is_none());
    }

    #[test]
    fn full_file() {
        let config = DaemonConfig::parse(
            r#"
            listen = "0.0.0.0:9000"
            state_dir = "/srv/node"
            workload_socket = "/run/app.sock"
            role = "proxy"
            enforce_token_validation = false
            allowed_release_digests = ["sha256:aa"]

            [token_issuer]
            key_id = "issuer-1"
            public_key = "02ab"
            "#,
        )
        .unwrap();
        assert_eq!(config.role, Role::Proxy);
        assert!(!config.enforce_token_validation);
        assert_eq!(config.key_set_path(), PathBuf::from("/srv/node/attested_keys.json"));
        assert_eq!(config.keychain_dir(), PathBuf::from("/srv/node/keychain"));
        assert_eq!(config.token_issuer.as_ref().unwrap().key_id, "issuer-1");
        assert!(!config.job_config().enforce_token_validation);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(DaemonConfig::parse("lisen = \"x\"").is_err());
    }

    #[test]
    fn load_reads_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("confnode.toml");
        std::fs::write(&path, "role = \"reject_only\"\n").unwrap();
        assert_eq!(DaemonConfig::load(Some(&path)).unwrap().role, Role::RejectOnly);
        assert!(DaemonConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
