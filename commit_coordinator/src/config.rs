// SPDX-License-Identifier: MIT OR Apache-2.0
//! Coordinator configuration types.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{CommitError, Result};

// Environment variable names for configuration.

/// Retry budget environment variable.
pub const ENV_MAX_AUTO_RETRY: &str = "COORDINATOR_MAX_AUTO_RETRY";
/// Retry delay upper bound environment variable.
pub const ENV_AUTO_RETRY_DELAY_MS: &str = "COORDINATOR_AUTO_RETRY_DELAY_MS";
/// Lock wait timeout environment variable.
pub const ENV_LOCK_TIMEOUT_MS: &str = "COORDINATOR_LOCK_TIMEOUT_MS";
/// Pipeline depth environment variable.
pub const ENV_PIPELINE_DEPTH: &str = "COORDINATOR_PIPELINE_DEPTH";
/// Transaction log path environment variable.
pub const ENV_LOG_PATH: &str = "COORDINATOR_LOG_PATH";
/// Default write quorum environment variable (`majority`, `all` or a number).
pub const ENV_WRITE_QUORUM: &str = "COORDINATOR_WRITE_QUORUM";

mod env_parse {
    use std::path::PathBuf;

    use super::{CommitError, Result, WriteQuorum};

    pub fn parse_u32(key: &str) -> Option<Result<u32>> {
        std::env::var(key).ok().map(|val| {
            val.parse()
                .map_err(|e| CommitError::Config(format!("invalid {key}: {e}")))
        })
    }

    pub fn parse_u64(key: &str) -> Option<Result<u64>> {
        std::env::var(key).ok().map(|val| {
            val.parse()
                .map_err(|e| CommitError::Config(format!("invalid {key}: {e}")))
        })
    }

    pub fn parse_quorum(key: &str) -> Option<Result<WriteQuorum>> {
        std::env::var(key).ok().map(|val| {
            match val.to_lowercase().as_str() {
                "majority" => Ok(WriteQuorum::Majority),
                "all" => Ok(WriteQuorum::All),
                other => other.parse().map(WriteQuorum::Fixed).map_err(|_| {
                    CommitError::Config(format!(
                        "invalid {key}: expected majority, all or a number"
                    ))
                }),
            }
        })
    }

    pub fn parse_path(key: &str) -> Option<PathBuf> {
        std::env::var(key).ok().map(PathBuf::from)
    }
}

/// Number of replicas that must acknowledge a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteQuorum {
    #[default]
    Majority,
    All,
    Fixed(usize),
}

impl WriteQuorum {
    /// Concrete count for a replica set of `servers` nodes.
    pub fn resolve(self, servers: usize) -> usize {
        match self {
            WriteQuorum::Majority => servers / 2 + 1,
            WriteQuorum::All => servers.max(1),
            WriteQuorum::Fixed(n) => n.max(1),
        }
    }
}

/// Replica placement for one data cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterReplication {
    /// Servers owning a copy. Empty means every database server.
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub write_quorum: Option<WriteQuorum>,
}

/// Replica placement and write quorums of a database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Every server of the database. Empty means the nodes currently known.
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub default_write_quorum: WriteQuorum,
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterReplication>,
}

impl ReplicationConfig {
    pub fn with_servers(mut self, servers: &[&str]) -> Self {
        self.servers = servers.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_default_write_quorum(mut self, quorum: WriteQuorum) -> Self {
        self.default_write_quorum = quorum;
        self
    }

    pub fn with_cluster(mut self, name: &str, cluster: ClusterReplication) -> Self {
        self.clusters.insert(name.to_string(), cluster);
        self
    }

    /// Write quorum for `cluster`, falling back to `known_nodes` as the
    /// replica count when no server list is configured.
    pub fn write_quorum(&self, cluster: &str, known_nodes: usize) -> usize {
        let placement = self.clusters.get(cluster);
        let servers = placement
            .map(|c| c.servers.len())
            .filter(|n| *n > 0)
            .unwrap_or(if self.servers.is_empty() {
                known_nodes
            } else {
                self.servers.len()
            });
        placement
            .and_then(|c| c.write_quorum)
            .unwrap_or(self.default_write_quorum)
            .resolve(servers)
    }

    /// Largest write quorum over `clusters`; the default quorum when empty.
    pub fn max_write_quorum<'a>(
        &self,
        clusters: impl IntoIterator<Item = &'a str>,
        known_nodes: usize,
    ) -> usize {
        clusters
            .into_iter()
            .map(|c| self.write_quorum(c, known_nodes))
            .max()
            .unwrap_or_else(|| {
                let servers = if self.servers.is_empty() {
                    known_nodes
                } else {
                    self.servers.len()
                };
                self.default_write_quorum.resolve(servers)
            })
    }

    pub fn validate(&self) -> Result<()> {
        let fixed_zero = |q: Option<WriteQuorum>| q == Some(WriteQuorum::Fixed(0));
        if fixed_zero(Some(self.default_write_quorum)) {
            return Err(CommitError::Config(
                "default_write_quorum must be greater than 0".to_string(),
            ));
        }
        for (name, cluster) in &self.clusters {
            if fixed_zero(cluster.write_quorum) {
                return Err(CommitError::Config(format!(
                    "write_quorum of cluster '{name}' must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Attempts for client retries and commit resolution.
    #[serde(default = "default_max_auto_retry")]
    pub max_auto_retry: u32,
    /// Upper bound of the random delay between attempts.
    #[serde(default = "default_auto_retry_delay_ms")]
    pub auto_retry_delay_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// How far past the last committed sequence an id still validates.
    #[serde(default = "default_pipeline_depth")]
    pub pipeline_depth: u64,
    /// Where the transaction log is persisted. In memory when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

fn default_max_auto_retry() -> u32 {
    10
}
fn default_auto_retry_delay_ms() -> u64 {
    1000
}
fn default_lock_timeout_ms() -> u64 {
    1000
}
fn default_pipeline_depth() -> u64 {
    1
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_auto_retry: default_max_auto_retry(),
            auto_retry_delay_ms: default_auto_retry_delay_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            pipeline_depth: default_pipeline_depth(),
            log_path: None,
            replication: ReplicationConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_max_auto_retry(mut self, retries: u32) -> Self {
        self.max_auto_retry = retries;
        self
    }

    pub fn with_auto_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.auto_retry_delay_ms = delay_ms;
        self
    }

    pub fn with_lock_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.lock_timeout_ms = timeout_ms;
        self
    }

    pub fn with_pipeline_depth(mut self, depth: u64) -> Self {
        self.pipeline_depth = depth;
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Load configuration from environment variables over the defaults.
    ///
    /// - `COORDINATOR_MAX_AUTO_RETRY` - Retry budget
    /// - `COORDINATOR_AUTO_RETRY_DELAY_MS` - Upper bound of the retry delay
    /// - `COORDINATOR_LOCK_TIMEOUT_MS` - Lock wait timeout
    /// - `COORDINATOR_PIPELINE_DEPTH` - Accepted sequence window
    /// - `COORDINATOR_LOG_PATH` - Transaction log file
    /// - `COORDINATOR_WRITE_QUORUM` - Default write quorum
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(result) = env_parse::parse_u32(ENV_MAX_AUTO_RETRY) {
            config.max_auto_retry = result?;
        }
        if let Some(result) = env_parse::parse_u64(ENV_AUTO_RETRY_DELAY_MS) {
            config.auto_retry_delay_ms = result?;
        }
        if let Some(result) = env_parse::parse_u64(ENV_LOCK_TIMEOUT_MS) {
            config.lock_timeout_ms = result?;
        }
        if let Some(result) = env_parse::parse_u64(ENV_PIPELINE_DEPTH) {
            config.pipeline_depth = result?;
        }
        if let Some(path) = env_parse::parse_path(ENV_LOG_PATH) {
            config.log_path = Some(path);
        }
        if let Some(result) = env_parse::parse_quorum(ENV_WRITE_QUORUM) {
            config.replication.default_write_quorum = result?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_auto_retry == 0 {
            return Err(CommitError::Config(
                "max_auto_retry must be greater than 0".to_string(),
            ));
        }
        if self.lock_timeout_ms == 0 {
            return Err(CommitError::Config(
                "lock_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.pipeline_depth == 0 {
            return Err(CommitError::Config(
                "pipeline_depth must be greater than 0".to_string(),
            ));
        }
        self.replication.validate()
    }
}
