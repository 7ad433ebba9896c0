//! Master-side supervision of one worker process.
//!
//! A [`WorkerHandle`] owns at most one child at a time and moves through
//! `unspawned → spawning → ready → killing → unspawned`. When a ready worker
//! exits without being asked to, readiness drops and the handle keeps
//! respawning it, with exponential backoff, until a replacement reports ready
//! or the handle is killed. Lifecycle operations on one handle are serialized.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

use crate::bootstrap::{WorkerEnv, WorkerRoleEnv};
use crate::bridge::protocol::{IpcMessage, OpCode, WorkerIdentity};
use crate::bridge::transport::{IpcAddress, IpcServer};
use crate::events::{EventBus, FleetEvent};
use crate::partition::ShardRange;

/// Ceiling for the delay between crash respawn attempts.
const MAX_RESPAWN_BACKOFF: Duration = Duration::from_secs(30);
/// Floor for the backoff base so a zero respawn delay cannot spin.
const MIN_RESPAWN_BACKOFF: Duration = Duration::from_millis(50);

/// Delay before crash respawn attempt `attempt` (0-based).
fn respawn_backoff(base: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return base;
    }
    base.max(MIN_RESPAWN_BACKOFF)
        .saturating_mul(1 << attempt.min(10))
        .min(MAX_RESPAWN_BACKOFF)
}

/// Everything needed to start one worker process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub identity: WorkerIdentity,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(&'static str, String)>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Io(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for how worker processes are started.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Child, SpawnError>;
}

/// Runs `spec.program` with the bootstrap environment; stdio is inherited.
pub struct ExecSpawner;

impl WorkerSpawner for ExecSpawner {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Child, SpawnError> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("{0} already has a live process")]
    AlreadySpawned(WorkerIdentity),

    #[error("failed to spawn {worker}: {source}")]
    Spawn {
        worker: WorkerIdentity,
        #[source]
        source: SpawnError,
    },

    #[error("{worker} did not become ready within {timeout:?}")]
    ReadyTimeout {
        worker: WorkerIdentity,
        timeout: Duration,
    },

    #[error("{worker} exited before becoming ready (code {code:?})")]
    ExitedBeforeReady {
        worker: WorkerIdentity,
        code: Option<i32>,
    },
}

/// What a handle supervises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRole {
    Cluster { id: u32, shards: ShardRange },
    Service { name: String, path: PathBuf },
}

impl WorkerRole {
    pub fn identity(&self) -> WorkerIdentity {
        match self {
            Self::Cluster { id, .. } => WorkerIdentity::Cluster(*id),
            Self::Service { name, .. } => WorkerIdentity::Service(name.clone()),
        }
    }
}

/// Readiness wait for a cluster: `base` per 1000 guilds it is expected to hold.
pub fn cluster_ready_timeout(base: Duration, shards: &ShardRange, guilds_per_shard: u32) -> Duration {
    base.mul_f64(f64::from(shards.len()) * f64::from(guilds_per_shard) / 1000.0)
}

/// Per-handle settings derived from the fleet configuration.
#[derive(Clone)]
pub struct HandleSettings {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub address: IpcAddress,
    pub prefix: String,
    pub ready_timeout: Duration,
    pub kill_timeout: Option<Duration>,
    pub respawn_delay: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Running,
    Exited(Option<i32>),
}

struct ProcessRef {
    pid: Option<u32>,
    generation: u64,
    expected_exit: Arc<AtomicBool>,
    kill_tx: Option<oneshot::Sender<()>>,
    state: watch::Receiver<ProcessState>,
}

pub struct WorkerHandle {
    role: WorkerRole,
    identity: WorkerIdentity,
    endpoint: String,
    launch: LaunchSpec,
    ready_timeout: Duration,
    kill_timeout: Option<Duration>,
    respawn_delay: Duration,
    spawner: Arc<dyn WorkerSpawner>,
    control: Arc<IpcServer>,
    events: EventBus,
    ready: watch::Sender<bool>,
    process: StdMutex<Option<ProcessRef>>,
    generation: AtomicU64,
    /// Set by an explicit kill; stops crash recovery until the next spawn.
    stopped: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    this: Weak<WorkerHandle>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("role", &self.role)
            .field("ready", &self.is_ready())
            .field("pid", &self.pid())
            .finish()
    }
}

impl WorkerHandle {
    pub fn new(
        role: WorkerRole,
        settings: HandleSettings,
        control: Arc<IpcServer>,
        events: EventBus,
    ) -> Arc<Self> {
        let identity = role.identity();
        let env = WorkerEnv {
            role: match &role {
                WorkerRole::Cluster { id, shards } => WorkerRoleEnv::Cluster {
                    id: *id,
                    shards: *shards,
                },
                WorkerRole::Service { name, path } => WorkerRoleEnv::Service {
                    name: name.clone(),
                    path: path.clone(),
                },
            },
            address: settings.address.clone(),
            prefix: settings.prefix.clone(),
        };
        let launch = LaunchSpec {
            identity: identity.clone(),
            program: settings.program,
            args: settings.args,
            env: env.to_vars(),
        };

        Arc::new_cyclic(|this| Self {
            endpoint: identity.endpoint(&settings.prefix),
            identity,
            role,
            launch,
            ready_timeout: settings.ready_timeout,
            kill_timeout: settings.kill_timeout,
            respawn_delay: settings.respawn_delay,
            spawner: settings.spawner,
            control,
            events,
            ready: watch::channel(false).0,
            process: StdMutex::new(None),
            generation: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            this: this.clone(),
        })
    }

    pub fn role(&self) -> &WorkerRole {
        &self.role
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn shards(&self) -> Option<ShardRange> {
        match &self.role {
            WorkerRole::Cluster { shards, .. } => Some(*shards),
            WorkerRole::Service { .. } => None,
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        self.ready_timeout
    }

    pub fn kill_timeout(&self) -> Option<Duration> {
        self.kill_timeout
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.process_slot().is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process_slot().as_ref().and_then(|p| p.pid)
    }

    fn process_slot(&self) -> MutexGuard<'_, Option<ProcessRef>> {
        self.process.lock().unwrap_or_else(|poisoned| {
            tracing::error!(worker = %self.identity, "Process slot mutex poisoned");
            poisoned.into_inner()
        })
    }

    /// Record a READY from this worker's process.
    pub fn mark_ready(&self) {
        if !self.ready.send_replace(true) {
            tracing::info!(worker = %self.identity, pid = ?self.pid(), "Worker ready");
        }
        self.events.emit(FleetEvent::WorkerReady {
            worker: self.identity.clone(),
        });
    }

    /// Launch a process and wait for it to report ready.
    pub async fn spawn(&self) -> Result<(), SupervisorError> {
        let _guard = self.lifecycle.lock().await;
        self.stopped.store(false, Ordering::SeqCst);
        self.spawn_locked().await
    }

    async fn spawn_locked(&self) -> Result<(), SupervisorError> {
        if self.is_alive() {
            return Err(SupervisorError::AlreadySpawned(self.identity.clone()));
        }
        self.start_process()?;
        self.wait_for_ready().await
    }

    /// Start the child and arm its exit observer without waiting for READY.
    pub(crate) fn start_process(&self) -> Result<Option<u32>, SupervisorError> {
        self.ready.send_replace(false);

        let child = self
            .spawner
            .spawn(&self.launch)
            .map_err(|source| SupervisorError::Spawn {
                worker: self.identity.clone(),
                source,
            })?;
        let pid = child.id();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (kill_tx, kill_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let expected_exit = Arc::new(AtomicBool::new(false));

        *self.process_slot() = Some(ProcessRef {
            pid,
            generation,
            expected_exit: Arc::clone(&expected_exit),
            kill_tx: Some(kill_tx),
            state: state_rx,
        });

        tokio::spawn(observe_exit(
            self.this.clone(),
            child,
            generation,
            expected_exit,
            kill_rx,
            state_tx,
        ));

        tracing::info!(worker = %self.identity, pid = ?pid, "Spawned worker process");
        self.events.emit(match &self.role {
            WorkerRole::Cluster { id, shards } => FleetEvent::ClusterSpawned {
                cluster_id: *id,
                shards: *shards,
                pid,
            },
            WorkerRole::Service { name, .. } => FleetEvent::ServiceSpawned {
                name: name.clone(),
                pid,
            },
        });
        Ok(pid)
    }

    /// Resolve once READY arrives; fail on timeout or if the process dies first.
    pub async fn wait_for_ready(&self) -> Result<(), SupervisorError> {
        let mut ready = self.ready.subscribe();
        let mut state = self.process_slot().as_ref().map(|p| p.state.clone());

        let exited = async {
            match state.as_mut() {
                Some(state) => match state.wait_for(|s| *s != ProcessState::Running).await {
                    Ok(s) => match *s {
                        ProcessState::Exited(code) => code,
                        ProcessState::Running => None,
                    },
                    Err(_) => None,
                },
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::time::timeout(self.ready_timeout, async {
            tokio::select! {
                r = ready.wait_for(|r| *r) => r.map(|_| ()).map_err(|_| None),
                code = exited => Err(Some(code)),
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(Some(code))) => Err(SupervisorError::ExitedBeforeReady {
                worker: self.identity.clone(),
                code,
            }),
            Ok(Err(None)) | Err(_) => Err(SupervisorError::ReadyTimeout {
                worker: self.identity.clone(),
                timeout: self.ready_timeout,
            }),
        }
    }

    /// Stop the process: ask over IPC, force after `timeout`. `None` waits forever.
    pub async fn kill(&self, timeout: Option<Duration>) {
        self.stopped.store(true, Ordering::SeqCst);
        let _guard = self.lifecycle.lock().await;
        self.kill_locked(timeout).await
    }

    async fn kill_locked(&self, timeout: Option<Duration>) {
        let Some(mut process) = self.process_slot().take() else {
            return;
        };
        self.ready.send_replace(false);
        process.expected_exit.store(true, Ordering::SeqCst);

        let running = *process.state.borrow() == ProcessState::Running;
        if running {
            self.request_exit(process.pid).await;
        }

        let mut state = process.state.clone();
        let graceful = async {
            let _ = state.wait_for(|s| *s != ProcessState::Running).await;
        };
        match timeout {
            None => graceful.await,
            Some(timeout) => {
                if tokio::time::timeout(timeout, graceful).await.is_err() {
                    tracing::warn!(
                        worker = %self.identity,
                        pid = ?process.pid,
                        timeout_ms = timeout.as_millis() as u64,
                        "Worker did not exit in time, killing"
                    );
                    if let Some(kill_tx) = process.kill_tx.take() {
                        let _ = kill_tx.send(());
                    }
                    let _ = process
                        .state
                        .wait_for(|s| *s != ProcessState::Running)
                        .await;
                }
            }
        }
        tracing::info!(worker = %self.identity, pid = ?process.pid, "Worker stopped");
    }

    /// SHUTDOWN over IPC if connected, SIGTERM otherwise.
    async fn request_exit(&self, pid: Option<u32>) {
        let shutdown = IpcMessage::bare(OpCode::Shutdown);
        match self.control.send_to(&self.endpoint, shutdown, false).await {
            Ok(_) => tracing::debug!(worker = %self.identity, "Sent shutdown"),
            Err(e) => {
                tracing::debug!(worker = %self.identity, error = %e, "Shutdown not delivered, signalling");
                terminate(pid);
            }
        }
    }

    /// Kill, settle, spawn.
    pub async fn respawn(&self) -> Result<(), SupervisorError> {
        let _guard = self.lifecycle.lock().await;
        self.stopped.store(false, Ordering::SeqCst);
        self.kill_locked(self.kill_timeout).await;
        tokio::time::sleep(self.respawn_delay).await;
        self.spawn_locked().await
    }

    /// Respawn after a crash until a replacement is ready, the handle is
    /// killed, or another lifecycle operation brings the worker back.
    async fn recover(self: Arc<Self>) {
        let mut attempt = 0u32;
        loop {
            tokio::time::sleep(respawn_backoff(self.respawn_delay, attempt)).await;
            let _guard = self.lifecycle.lock().await;
            if self.stopped.load(Ordering::SeqCst) {
                tracing::debug!(worker = %self.identity, "Killed during recovery, giving up");
                return;
            }
            if self.is_ready() {
                tracing::debug!(worker = %self.identity, "Already replaced, skipping respawn");
                return;
            }
            // A replacement that timed out is still running; clear it first.
            self.kill_locked(self.kill_timeout).await;

            match self.spawn_locked().await {
                Ok(()) => {
                    tracing::info!(worker = %self.identity, attempts = attempt + 1, "Recovered after crash");
                    return;
                }
                Err(e) => {
                    tracing::error!(worker = %self.identity, attempt, error = %e, "Respawn after crash failed");
                    self.events.emit(FleetEvent::SpawnFailed {
                        worker: self.identity.clone(),
                        error: e.to_string(),
                    });
                }
            }
            attempt = attempt.saturating_add(1);
        }
    }

    fn on_exit(&self, generation: u64, code: Option<i32>, expected: bool) {
        let was_ready = {
            let mut slot = self.process_slot();
            if slot.as_ref().is_some_and(|p| p.generation == generation) {
                *slot = None;
                self.ready.send_replace(false)
            } else {
                false
            }
        };

        self.events.emit(FleetEvent::WorkerExited {
            worker: self.identity.clone(),
            code,
            expected,
        });
        if expected {
            return;
        }
        // A process that dies while spawning fails the pending spawn instead.
        if !was_ready {
            tracing::warn!(worker = %self.identity, code = ?code, "Worker exited before becoming ready");
            return;
        }

        tracing::warn!(worker = %self.identity, code = ?code, "Worker exited unexpectedly, respawning");
        if let Some(handle) = self.this.upgrade() {
            tokio::spawn(handle.recover());
        }
    }
}

async fn observe_exit(
    handle: Weak<WorkerHandle>,
    mut child: Child,
    generation: u64,
    expected_exit: Arc<AtomicBool>,
    mut kill_rx: oneshot::Receiver<()>,
    state: watch::Sender<ProcessState>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "Kill signal failed");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to wait for worker process");
            None
        }
    };
    state.send_replace(ProcessState::Exited(code));

    if let Some(handle) = handle.upgrade() {
        handle.on_exit(generation, code, expected_exit.load(Ordering::SeqCst));
    }
}

#[cfg(unix)]
fn terminate(pid: Option<u32>) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn terminate(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_timeout_scales_with_guild_capacity() {
        let shards = ShardRange {
            first: 0,
            last: 1,
            total: 4,
        };
        assert_eq!(
            cluster_ready_timeout(Duration::from_secs(30), &shards, 1500),
            Duration::from_secs(90)
        );
        assert_eq!(
            cluster_ready_timeout(Duration::from_secs(10), &shards, 500),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn respawn_backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(respawn_backoff(base, 0), base);
        assert_eq!(respawn_backoff(base, 1), Duration::from_millis(200));
        assert_eq!(respawn_backoff(base, 3), Duration::from_millis(800));
        assert_eq!(respawn_backoff(base, 40), MAX_RESPAWN_BACKOFF);
        assert_eq!(respawn_backoff(Duration::ZERO, 1), Duration::from_millis(100));
    }

    #[test]
    fn role_identity() {
        let role = WorkerRole::Service {
            name: "api".into(),
            path: "/srv/api".into(),
        };
        assert_eq!(role.identity(), WorkerIdentity::Service("api".into()));
    }
}
