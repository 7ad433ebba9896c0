//! Worker identity handoff through the process environment.
//!
//! The supervisor sets these variables on every child it launches; a worker
//! reads them back at startup to learn its role, its shard range or service
//! name, and where the master listens.

use std::path::PathBuf;

use crate::bridge::protocol::WorkerIdentity;
use crate::bridge::transport::IpcAddress;
use crate::partition::ShardRange;

pub const ENV_CLUSTER_ID: &str = "SHARDER_CLUSTER_ID";
pub const ENV_FIRST_SHARD: &str = "SHARDER_FIRST_SHARD";
pub const ENV_LAST_SHARD: &str = "SHARDER_LAST_SHARD";
pub const ENV_SHARD_COUNT: &str = "SHARDER_SHARD_COUNT";
pub const ENV_SERVICE_NAME: &str = "SHARDER_SERVICE_NAME";
pub const ENV_SERVICE_PATH: &str = "SHARDER_SERVICE_PATH";
pub const ENV_IPC_ADDRESS: &str = "SHARDER_IPC_ADDRESS";
pub const ENV_IPC_PREFIX: &str = "SHARDER_IPC_PREFIX";

pub const DEFAULT_PREFIX: &str = "sharder";

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },

    #[error("invalid shard range {first}..={last} of {total}")]
    InvalidRange { first: u32, last: u32, total: u32 },
}

/// Role-specific part of the bootstrap environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRoleEnv {
    Cluster { id: u32, shards: ShardRange },
    Service { name: String, path: PathBuf },
}

/// Everything a worker process learns from its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    pub role: WorkerRoleEnv,
    pub address: IpcAddress,
    pub prefix: String,
}

impl WorkerEnv {
    /// Read the bootstrap environment of this process.
    ///
    /// `Ok(None)` means the process was not launched as a worker.
    pub fn from_env() -> Result<Option<Self>, BootstrapError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>, BootstrapError> {
        let role = if let Some(id) = lookup(ENV_CLUSTER_ID) {
            let id = parse(ENV_CLUSTER_ID, &id)?;
            let first = parse(ENV_FIRST_SHARD, &required(&lookup, ENV_FIRST_SHARD)?)?;
            let last = parse(ENV_LAST_SHARD, &required(&lookup, ENV_LAST_SHARD)?)?;
            let total = parse(ENV_SHARD_COUNT, &required(&lookup, ENV_SHARD_COUNT)?)?;
            if first > last || last >= total {
                return Err(BootstrapError::InvalidRange { first, last, total });
            }
            WorkerRoleEnv::Cluster {
                id,
                shards: ShardRange { first, last, total },
            }
        } else if let Some(name) = lookup(ENV_SERVICE_NAME) {
            if name.is_empty() {
                return Err(BootstrapError::Invalid {
                    var: ENV_SERVICE_NAME,
                    value: name,
                });
            }
            WorkerRoleEnv::Service {
                name,
                path: PathBuf::from(required(&lookup, ENV_SERVICE_PATH)?),
            }
        } else {
            return Ok(None);
        };

        let raw_address = required(&lookup, ENV_IPC_ADDRESS)?;
        let address = raw_address
            .parse()
            .map_err(|_| BootstrapError::Invalid {
                var: ENV_IPC_ADDRESS,
                value: raw_address.clone(),
            })?;
        let prefix = lookup(ENV_IPC_PREFIX)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string());

        Ok(Some(Self {
            role,
            address,
            prefix,
        }))
    }

    pub fn identity(&self) -> WorkerIdentity {
        match &self.role {
            WorkerRoleEnv::Cluster { id, .. } => WorkerIdentity::Cluster(*id),
            WorkerRoleEnv::Service { name, .. } => WorkerIdentity::Service(name.clone()),
        }
    }

    /// Variables to set on a child, the inverse of [`from_lookup`](Self::from_lookup).
    pub fn to_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = match &self.role {
            WorkerRoleEnv::Cluster { id, shards } => vec![
                (ENV_CLUSTER_ID, id.to_string()),
                (ENV_FIRST_SHARD, shards.first.to_string()),
                (ENV_LAST_SHARD, shards.last.to_string()),
                (ENV_SHARD_COUNT, shards.total.to_string()),
            ],
            WorkerRoleEnv::Service { name, path } => vec![
                (ENV_SERVICE_NAME, name.clone()),
                (ENV_SERVICE_PATH, path.display().to_string()),
            ],
        };
        vars.push((ENV_IPC_ADDRESS, self.address.to_string()));
        vars.push((ENV_IPC_PREFIX, self.prefix.clone()));
        vars
    }
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<String, BootstrapError> {
    lookup(var).ok_or(BootstrapError::Missing(var))
}

fn parse(var: &'static str, value: &str) -> Result<u32, BootstrapError> {
    value.trim().parse().map_err(|_| BootstrapError::Invalid {
        var,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn no_role_means_not_a_worker() {
        assert_eq!(WorkerEnv::from_lookup(lookup(&[])).unwrap(), None);
    }

    #[test]
    fn reads_cluster_env() {
        let env = WorkerEnv::from_lookup(lookup(&[
            (ENV_CLUSTER_ID, "1"),
            (ENV_FIRST_SHARD, "3"),
            (ENV_LAST_SHARD, "4"),
            (ENV_SHARD_COUNT, "7"),
            (ENV_IPC_ADDRESS, "/tmp/fleet.sock"),
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(env.identity(), WorkerIdentity::Cluster(1));
        assert_eq!(env.prefix, DEFAULT_PREFIX);
        assert_eq!(
            env.role,
            WorkerRoleEnv::Cluster {
                id: 1,
                shards: ShardRange {
                    first: 3,
                    last: 4,
                    total: 7
                }
            }
        );
    }

    #[test]
    fn vars_round_trip() {
        let env = WorkerEnv {
            role: WorkerRoleEnv::Service {
                name: "api".into(),
                path: "/srv/api".into(),
            },
            address: IpcAddress::Tcp("127.0.0.1:8191".into()),
            prefix: "bot".into(),
        };
        let vars: Vec<(String, String)> = env
            .to_vars()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let pairs: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        assert_eq!(WorkerEnv::from_lookup(lookup(&pairs)).unwrap(), Some(env));
    }

    #[test]
    fn rejects_bad_cluster_env() {
        let missing = WorkerEnv::from_lookup(lookup(&[(ENV_CLUSTER_ID, "0")])).unwrap_err();
        assert!(matches!(missing, BootstrapError::Missing(ENV_FIRST_SHARD)));

        let bad_range = WorkerEnv::from_lookup(lookup(&[
            (ENV_CLUSTER_ID, "0"),
            (ENV_FIRST_SHARD, "5"),
            (ENV_LAST_SHARD, "7"),
            (ENV_SHARD_COUNT, "7"),
            (ENV_IPC_ADDRESS, "8191"),
        ]))
        .unwrap_err();
        assert!(matches!(bad_range, BootstrapError::InvalidRange { .. }));

        let not_a_number = WorkerEnv::from_lookup(lookup(&[(ENV_CLUSTER_ID, "one")])).unwrap_err();
        assert!(matches!(not_a_number, BootstrapError::Invalid { .. }));
    }
}
