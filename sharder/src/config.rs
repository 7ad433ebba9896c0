//! Fleet configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::transport::IpcAddress;
use crate::gateway::ShardHint;
use crate::supervisor::{ExecSpawner, WorkerSpawner};

pub const DEFAULT_GUILDS_PER_SHARD: u32 = 1500;
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RESPAWN_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_IPC_PATH: &str = "/tmp/sharder.sock";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid shard count {0:?}: expected \"auto\" or a positive integer")]
    InvalidShardCount(String),
}

/// Total shards to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardCount {
    Fixed(u32),
    /// Ask the gateway for its recommendation.
    #[default]
    Auto,
}

impl FromStr for ShardCount {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        match s.parse::<u32>() {
            Ok(n) if n > 0 => Ok(Self::Fixed(n)),
            _ => Err(ConfigError::InvalidShardCount(s.to_string())),
        }
    }
}

impl fmt::Display for ShardCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(n) => write!(f, "{n}"),
            Self::Auto => f.write_str("auto"),
        }
    }
}

pub struct ManagerConfig {
    pub worker_program: PathBuf,
    pub worker_args: Vec<String>,
    pub token: Option<String>,
    pub shard_count: ShardCount,
    pub cluster_count: u32,
    pub guilds_per_shard: u32,
    /// Base readiness wait, scaled per cluster by its guild capacity.
    pub ready_timeout: Duration,
    pub kill_timeout: Option<Duration>,
    pub respawn_delay: Duration,
    pub stats_interval: Duration,
    pub address: IpcAddress,
    pub prefix: String,
    pub spawner: Arc<dyn WorkerSpawner>,
    /// Defaults to the gateway HTTP API when unset.
    pub shard_hint: Option<Arc<dyn ShardHint>>,
}

impl fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("worker_program", &self.worker_program)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("shard_count", &self.shard_count)
            .field("cluster_count", &self.cluster_count)
            .field("guilds_per_shard", &self.guilds_per_shard)
            .field("address", &self.address)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl ManagerConfig {
    pub fn new(worker_program: impl Into<PathBuf>) -> Self {
        let cluster_count = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            worker_program: worker_program.into(),
            worker_args: Vec::new(),
            token: None,
            shard_count: ShardCount::Auto,
            cluster_count,
            guilds_per_shard: DEFAULT_GUILDS_PER_SHARD,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            kill_timeout: Some(DEFAULT_KILL_TIMEOUT),
            respawn_delay: DEFAULT_RESPAWN_DELAY,
            stats_interval: DEFAULT_STATS_INTERVAL,
            address: IpcAddress::Unix(PathBuf::from(DEFAULT_IPC_PATH)),
            prefix: crate::bootstrap::DEFAULT_PREFIX.to_string(),
            spawner: Arc::new(ExecSpawner),
            shard_hint: None,
        }
    }

    /// Workers re-execute the running binary.
    pub fn for_current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_worker_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_shard_count(mut self, count: ShardCount) -> Self {
        self.shard_count = count;
        self
    }

    pub fn with_cluster_count(mut self, n: u32) -> Self {
        self.cluster_count = n;
        self
    }

    pub fn with_guilds_per_shard(mut self, n: u32) -> Self {
        self.guilds_per_shard = n;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_kill_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn with_respawn_delay(mut self, delay: Duration) -> Self {
        self.respawn_delay = delay;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn with_address(mut self, address: IpcAddress) -> Self {
        self.address = address;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_shard_hint(mut self, hint: Arc<dyn ShardHint>) -> Self {
        self.shard_hint = Some(hint);
        self
    }
}

/// Per-service overrides.
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Defaults to the fleet's base ready timeout.
    pub ready_timeout: Option<Duration>,
    /// Run this executable instead of the fleet's worker program.
    pub program: Option<PathBuf>,
}

impl ServiceOptions {
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = Some(timeout);
        self
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }
}
