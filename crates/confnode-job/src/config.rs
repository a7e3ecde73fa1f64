use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest inner message accepted from a client or worker (4 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Capacity of the per-job and per-worker channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// What this node does with requests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Serve requests with the local workload.
    #[default]
    Worker,
    /// Serve requests and let the workload fan out to downstream workers.
    Proxy,
    /// Establish the request key, then reject with `invalid-request`.
    RejectOnly,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Worker => write!(f, "worker"),
            Role::Proxy => write!(f, "proxy"),
            Role::RejectOnly => write!(f, "reject_only"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(Role::Worker),
            "proxy" => Ok(Role::Proxy),
            "reject_only" | "reject-only" => Ok(Role::RejectOnly),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub role: Role,
    /// When false, token validation failures are logged and ignored.
    pub enforce_token_validation: bool,
    pub max_message_size: usize,
    pub channel_capacity: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            role: Role::default(),
            enforce_token_validation: true,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_both_spellings() {
        assert_eq!("proxy".parse::<Role>().unwrap(), Role::Proxy);
        assert_eq!("reject-only".parse::<Role>().unwrap(), Role::RejectOnly);
        assert_eq!(Role::RejectOnly.to_string(), "reject_only");
        assert!("gateway".parse::<Role>().is_err());
    }
}
