//! Fleet orchestration: partition shards into clusters, bring them up, keep
//! them up, and poll the fleet for stats.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::bridge::error::TransportError;
use crate::bridge::protocol::master_endpoint;
use crate::bridge::transport::IpcServer;
use crate::config::{ManagerConfig, ServiceOptions, ShardCount};
use crate::diagnostics::Diagnostics;
use crate::events::{EventBus, FleetEvent};
use crate::fleet::Fleet;
use crate::gateway::{HttpShardHint, ShardHint, ShardHintError};
use crate::master::MasterIpc;
use crate::partition::{PartitionError, compute_partition};
use crate::stats::StatsSnapshot;
use crate::supervisor::{
    HandleSettings, SupervisorError, WorkerHandle, WorkerRole, cluster_ready_timeout,
};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("failed to start IPC server: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid partition: {0}")]
    Partition(#[from] PartitionError),

    #[error("could not resolve shard count: {0}")]
    ShardHint(#[from] ShardHintError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("clusters have already been spawned")]
    AlreadySpawned,

    #[error("service {0:?} is already registered")]
    DuplicateService(String),

    #[error("no cluster with id {0}")]
    UnknownCluster(u32),

    #[error("no service named {0:?}")]
    UnknownService(String),
}

/// Scale the gateway's recommendation to the configured guilds per shard.
///
/// The recommendation assumes 1000 guilds per shard.
pub fn scale_recommended(recommended: u32, guilds_per_shard: u32) -> u32 {
    let per_shard = u64::from(guilds_per_shard.max(1));
    let scaled = (u64::from(recommended) * 1000).div_ceil(per_shard);
    u32::try_from(scaled).unwrap_or(u32::MAX).max(1)
}

pub struct ShardManager {
    config: ManagerConfig,
    ipc: Arc<MasterIpc>,
    fleet: Arc<Fleet>,
    events: EventBus,
    stats: Arc<RwLock<Option<StatsSnapshot>>>,
    stats_loop: StdMutex<Option<JoinHandle<()>>>,
    dispatch: JoinHandle<()>,
}

impl std::fmt::Debug for ShardManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardManager")
            .field("config", &self.config)
            .field("clusters", &self.fleet.cluster_count())
            .finish_non_exhaustive()
    }
}

impl ShardManager {
    /// Start the master listener. No worker is spawned yet.
    pub async fn bind(config: ManagerConfig) -> Result<Arc<Self>, ManagerError> {
        crate::stats::mark_process_start();

        let (server, inbound) =
            IpcServer::bind(&config.address, master_endpoint(&config.prefix)).await?;
        let fleet = Arc::new(Fleet::new());
        let events = EventBus::new();
        let ipc = MasterIpc::new(server, config.prefix.clone(), Arc::clone(&fleet), events.clone());
        let dispatch = ipc.spawn_dispatch(inbound);

        let manager = Arc::new(Self {
            config,
            ipc,
            fleet,
            events,
            stats: Arc::new(RwLock::new(None)),
            stats_loop: StdMutex::new(None),
            dispatch,
        });
        manager.register_builtin_diagnostics();
        Ok(manager)
    }

    fn register_builtin_diagnostics(&self) {
        let diagnostics = self.ipc.diagnostics();

        diagnostics.register("ping", |_| async { Ok(json!("pong")) });

        let stats = Arc::clone(&self.stats);
        diagnostics.register("stats", move |_| {
            let snapshot = stats
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            async move { Ok(serde_json::to_value(snapshot).unwrap_or(Value::Null)) }
        });

        let fleet = Arc::clone(&self.fleet);
        diagnostics.register("fleet", move |_| {
            let summary = fleet.summary();
            async move { Ok(summary) }
        });

        let ipc = Arc::clone(&self.ipc);
        diagnostics.register("store.keys", move |_| {
            let keys = ipc.store().keys();
            async move { Ok(json!(keys)) }
        });
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn ipc(&self) -> &Arc<MasterIpc> {
        &self.ipc
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.fleet
    }

    /// Diagnostics workers may run on the master through EVAL.
    pub fn diagnostics(&self) -> &Diagnostics {
        self.ipc.diagnostics()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Most recent stats snapshot, if a cycle has completed.
    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.stats
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Settle the shard total: fixed, or the gateway's recommendation scaled
    /// to the configured guilds per shard.
    pub async fn resolve_shard_total(&self) -> Result<u32, ManagerError> {
        match self.config.shard_count {
            ShardCount::Fixed(total) => Ok(total),
            ShardCount::Auto => {
                let token = self
                    .config
                    .token
                    .as_deref()
                    .filter(|t| !t.trim().is_empty())
                    .ok_or(ShardHintError::MissingToken)?;
                let hint: Arc<dyn ShardHint> = match &self.config.shard_hint {
                    Some(hint) => Arc::clone(hint),
                    None => Arc::new(HttpShardHint::new()?),
                };
                let recommended = hint.recommended_shards(token).await?;
                let total = scale_recommended(recommended, self.config.guilds_per_shard);
                tracing::info!(
                    recommended,
                    guilds_per_shard = self.config.guilds_per_shard,
                    total,
                    "Resolved shard count"
                );
                Ok(total)
            }
        }
    }

    fn settings(&self, ready_timeout: Duration) -> HandleSettings {
        HandleSettings {
            program: self.config.worker_program.clone(),
            args: self.config.worker_args.clone(),
            address: self.ipc.server().address().clone(),
            prefix: self.config.prefix.clone(),
            ready_timeout,
            kill_timeout: self.config.kill_timeout,
            respawn_delay: self.config.respawn_delay,
            spawner: Arc::clone(&self.config.spawner),
        }
    }

    /// Partition the shards, start every cluster, and keep retrying the ones
    /// that fail until all are ready. Starts the stats loop.
    pub async fn spawn(&self) -> Result<(), ManagerError> {
        if self.fleet.cluster_count() > 0 {
            return Err(ManagerError::AlreadySpawned);
        }
        let total = self.resolve_shard_total().await?;
        let ranges = compute_partition(total, self.config.cluster_count)?;
        tracing::info!(shard_total = total, clusters = ranges.len(), "Spawning clusters");

        let server = Arc::clone(self.ipc.server());
        let handles: Vec<Arc<WorkerHandle>> = ranges
            .into_iter()
            .enumerate()
            .map(|(id, shards)| {
                let timeout = cluster_ready_timeout(
                    self.config.ready_timeout,
                    &shards,
                    self.config.guilds_per_shard,
                );
                WorkerHandle::new(
                    WorkerRole::Cluster {
                        id: id as u32,
                        shards,
                    },
                    self.settings(timeout),
                    Arc::clone(&server),
                    self.events.clone(),
                )
            })
            .collect();
        self.fleet.set_clusters(handles.iter().cloned(), total);
        self.start_stats_loop();

        let mut failed = Vec::new();
        for handle in &handles {
            if let Err(e) = handle.spawn().await {
                self.report_spawn_failure(handle, &e);
                failed.push(Arc::clone(handle));
            }
        }

        let mut attempt = 0u32;
        while !failed.is_empty() {
            attempt += 1;
            tracing::warn!(attempt, failed = failed.len(), "Retrying clusters that failed to start");
            let mut still_failed = Vec::new();
            for handle in failed {
                if let Err(e) = handle.respawn().await {
                    self.report_spawn_failure(&handle, &e);
                    still_failed.push(handle);
                }
            }
            failed = still_failed;
        }

        tracing::info!(clusters = handles.len(), "All clusters ready");
        Ok(())
    }

    fn report_spawn_failure(&self, handle: &WorkerHandle, error: &SupervisorError) {
        tracing::error!(worker = %handle.identity(), error = %error, "Worker failed to start");
        self.events.emit(FleetEvent::SpawnFailed {
            worker: handle.identity().clone(),
            error: error.to_string(),
        });
    }

    /// Register and start a named service. Failure to start is returned as is.
    pub async fn register_service(
        &self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        options: ServiceOptions,
    ) -> Result<Arc<WorkerHandle>, ManagerError> {
        let name = name.into();
        let mut settings =
            self.settings(options.ready_timeout.unwrap_or(self.config.ready_timeout));
        if let Some(program) = options.program {
            settings.program = program;
        }
        let handle = WorkerHandle::new(
            WorkerRole::Service {
                name: name.clone(),
                path: path.into(),
            },
            settings,
            Arc::clone(self.ipc.server()),
            self.events.clone(),
        );
        if self.fleet.insert_service(Arc::clone(&handle)).is_err() {
            return Err(ManagerError::DuplicateService(name));
        }

        if let Err(e) = handle.spawn().await {
            tracing::error!(service = %name, error = %e, "Service failed to start");
            handle.kill(handle.kill_timeout()).await;
            self.fleet.remove_service(&name);
            return Err(e.into());
        }
        Ok(handle)
    }

    /// Kill and respawn one cluster.
    pub async fn restart(&self, cluster_id: u32) -> Result<(), ManagerError> {
        let handle = self
            .fleet
            .cluster(cluster_id)
            .ok_or(ManagerError::UnknownCluster(cluster_id))?;
        tracing::info!(cluster_id, "Restarting cluster");
        handle.respawn().await?;
        Ok(())
    }

    /// Restart every cluster, one at a time. Returns the first failure after
    /// all clusters were attempted.
    pub async fn restart_all(&self) -> Result<(), ManagerError> {
        let mut first_error = None;
        for handle in self.fleet.clusters() {
            if let Err(e) = handle.respawn().await {
                self.report_spawn_failure(&handle, &e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub async fn restart_service(&self, name: &str) -> Result<(), ManagerError> {
        let handle = self
            .fleet
            .service(name)
            .ok_or_else(|| ManagerError::UnknownService(name.to_string()))?;
        handle.respawn().await?;
        Ok(())
    }

    /// Poll the fleet every stats interval for as long as the manager lives.
    fn start_stats_loop(&self) {
        let mut slot = self
            .stats_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return;
        }

        let ipc = Arc::clone(&self.ipc);
        let stats = Arc::clone(&self.stats);
        let events = self.events.clone();
        let period = self.config.stats_interval;
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let (snapshot, errors) = ipc.collect_stats().await;
                for error in errors {
                    events.emit(FleetEvent::StatsFailed {
                        error: error.to_string(),
                    });
                }
                tracing::debug!(
                    clusters = snapshot.clusters.len(),
                    services = snapshot.services.len(),
                    "Collected fleet stats"
                );
                *stats.write().unwrap_or_else(|poisoned| poisoned.into_inner()) =
                    Some(snapshot.clone());
                events.emit(FleetEvent::StatsUpdated(Box::new(snapshot)));
            }
        }));
    }

    /// Stop every service, then every cluster, and close the listener.
    pub async fn shutdown(&self, timeout: Option<Duration>) {
        tracing::info!("Shutting down fleet");
        if let Some(task) = self
            .stats_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }

        join_all(self.fleet.services().iter().map(|h| h.kill(timeout))).await;
        join_all(self.fleet.clusters().iter().map(|h| h.kill(timeout))).await;
        self.ipc.server().close();
        self.dispatch.abort();
    }
}
