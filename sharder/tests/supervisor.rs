//! Supervisor lifecycle against real child processes.
#![cfg(unix)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::broadcast;

use sharder::bridge::protocol::{WorkerIdentity, master_endpoint};
use sharder::bridge::transport::{IpcAddress, IpcServer};
use sharder::events::{EventBus, FleetEvent};
use sharder::supervisor::{
    HandleSettings, LaunchSpec, SpawnError, SupervisorError, WorkerHandle, WorkerRole,
    WorkerSpawner,
};
use sharder::worker::WorkerLink;

const PREFIX: &str = "sup";

/// Runs a shell script instead of the worker program.
struct Script(&'static str);

impl WorkerSpawner for Script {
    fn spawn(&self, _spec: &LaunchSpec) -> Result<Child, SpawnError> {
        Ok(Command::new("sh")
            .arg("-c")
            .arg(self.0)
            .kill_on_drop(true)
            .spawn()?)
    }
}

/// Runs `first` on the first spawn and `rest` on every later one.
struct Sequence {
    first: &'static str,
    rest: &'static str,
    spawns: Arc<AtomicUsize>,
}

impl WorkerSpawner for Sequence {
    fn spawn(&self, _spec: &LaunchSpec) -> Result<Child, SpawnError> {
        let script = match self.spawns.fetch_add(1, Ordering::SeqCst) {
            0 => self.first,
            _ => self.rest,
        };
        Ok(Command::new("sh")
            .arg("-c")
            .arg(script)
            .kill_on_drop(true)
            .spawn()?)
    }
}

struct Setup {
    _dir: tempfile::TempDir,
    address: IpcAddress,
    server: Arc<IpcServer>,
    events: EventBus,
}

impl Setup {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let address = IpcAddress::Unix(dir.path().join("master.sock"));
        let (server, inbound) = IpcServer::bind(&address, master_endpoint(PREFIX))
            .await
            .unwrap();
        // Inbound messages are not dispatched in these tests.
        tokio::spawn(async move {
            let mut inbound = inbound;
            while inbound.recv().await.is_some() {}
        });
        Self {
            _dir: dir,
            address,
            server,
            events: EventBus::new(),
        }
    }

    fn service(&self, script: &'static str, ready_timeout: Duration) -> Arc<WorkerHandle> {
        self.service_with(Arc::new(Script(script)), ready_timeout)
    }

    fn service_with(
        &self,
        spawner: Arc<dyn WorkerSpawner>,
        ready_timeout: Duration,
    ) -> Arc<WorkerHandle> {
        let settings = HandleSettings {
            program: "sh".into(),
            args: Vec::new(),
            address: self.address.clone(),
            prefix: PREFIX.into(),
            ready_timeout,
            kill_timeout: Some(Duration::from_millis(300)),
            respawn_delay: Duration::from_millis(10),
            spawner,
        };
        WorkerHandle::new(
            WorkerRole::Service {
                name: "sidecar".into(),
                path: "/srv/sidecar".into(),
            },
            settings,
            Arc::clone(&self.server),
            self.events.clone(),
        )
    }
}

async fn wait_alive(handle: &WorkerHandle) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !handle.is_alive() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

async fn start_ready(handle: &Arc<WorkerHandle>) {
    let spawn = tokio::spawn({
        let handle = Arc::clone(handle);
        async move { handle.spawn().await }
    });
    wait_alive(handle).await;
    handle.mark_ready();
    spawn.await.unwrap().unwrap();
}

fn sigkill(pid: u32) {
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();
}

async fn next_matching(
    events: &mut broadcast::Receiver<FleetEvent>,
    predicate: impl Fn(&FleetEvent) -> bool,
) -> FleetEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn ready_timeout_leaves_process_running() {
    let setup = Setup::new().await;
    let handle = setup.service("sleep 30", Duration::from_millis(100));

    let err = handle.spawn().await.unwrap_err();
    assert!(matches!(err, SupervisorError::ReadyTimeout { .. }));
    assert!(handle.is_alive());
    assert!(!handle.is_ready());

    let err = handle.spawn().await.unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadySpawned(_)));

    handle.kill(Some(Duration::from_secs(5))).await;
    assert!(!handle.is_alive());
}

#[tokio::test]
async fn exit_before_ready_fails_spawn() {
    let setup = Setup::new().await;
    let handle = setup.service("exit 3", Duration::from_secs(5));

    let err = handle.spawn().await.unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::ExitedBeforeReady { code: Some(3), .. }
    ));
}

#[tokio::test]
async fn kill_without_process_is_noop() {
    let setup = Setup::new().await;
    let handle = setup.service("sleep 30", Duration::from_secs(5));

    let started = Instant::now();
    handle.kill(Some(Duration::from_secs(5))).await;
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn kill_signals_when_worker_is_not_connected() {
    let setup = Setup::new().await;
    let handle = setup.service("sleep 30", Duration::from_millis(50));
    let _ = handle.spawn().await;

    let started = Instant::now();
    handle.kill(Some(Duration::from_secs(10))).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!handle.is_alive());
}

#[tokio::test]
async fn kill_forces_after_timeout() {
    let setup = Setup::new().await;
    let handle = setup.service("trap '' TERM; sleep 30", Duration::from_millis(50));
    let _ = handle.spawn().await;

    let started = Instant::now();
    handle.kill(Some(Duration::from_millis(300))).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
    assert!(!handle.is_alive());
}

#[tokio::test]
async fn ready_then_crash_respawns() {
    let setup = Setup::new().await;
    let mut events = setup.events.subscribe();
    let handle = setup.service("sleep 30", Duration::from_secs(5));

    let spawn = tokio::spawn({
        let handle = Arc::clone(&handle);
        async move { handle.spawn().await }
    });

    let (link, _inbound) = WorkerLink::connect(
        &setup.address,
        PREFIX,
        WorkerIdentity::Service("sidecar".into()),
    )
    .await
    .unwrap();
    // Nothing dispatches READY here, so deliver it the way the master would.
    wait_alive(&handle).await;
    handle.mark_ready();
    spawn.await.unwrap().unwrap();
    assert!(handle.is_ready());
    let first_pid = handle.pid().unwrap();

    sigkill(first_pid);

    let exited = next_matching(&mut events, |e| matches!(e, FleetEvent::WorkerExited { .. })).await;
    assert!(matches!(
        exited,
        FleetEvent::WorkerExited {
            expected: false,
            ..
        }
    ));
    next_matching(&mut events, |e| matches!(e, FleetEvent::ServiceSpawned { .. })).await;
    assert_ne!(handle.pid(), Some(first_pid));

    handle.mark_ready();
    handle.kill(Some(Duration::from_millis(300))).await;
    drop(link);
}

#[tokio::test]
async fn requested_kill_does_not_respawn() {
    let setup = Setup::new().await;
    let mut events = setup.events.subscribe();
    let handle = setup.service("sleep 30", Duration::from_secs(5));

    start_ready(&handle).await;

    handle.kill(Some(Duration::from_secs(5))).await;
    let exited = next_matching(&mut events, |e| matches!(e, FleetEvent::WorkerExited { .. })).await;
    assert!(matches!(
        exited,
        FleetEvent::WorkerExited { expected: true, .. }
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_alive());
}

#[tokio::test]
async fn crash_recovery_retries_until_killed() {
    let setup = Setup::new().await;
    let mut events = setup.events.subscribe();
    let spawns = Arc::new(AtomicUsize::new(0));
    let handle = setup.service_with(
        Arc::new(Sequence {
            first: "sleep 30",
            rest: "exit 1",
            spawns: Arc::clone(&spawns),
        }),
        Duration::from_secs(5),
    );

    start_ready(&handle).await;
    sigkill(handle.pid().unwrap());

    // Every replacement dies before READY; recovery must keep going.
    for _ in 0..3 {
        next_matching(&mut events, |e| matches!(e, FleetEvent::SpawnFailed { .. })).await;
    }
    assert!(spawns.load(Ordering::SeqCst) >= 4);

    handle.kill(Some(Duration::from_millis(300))).await;
    let after_kill = spawns.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(spawns.load(Ordering::SeqCst), after_kill);
    assert!(!handle.is_alive());
}

#[tokio::test]
async fn crash_recovery_stops_once_replacement_is_ready() {
    let setup = Setup::new().await;
    let mut events = setup.events.subscribe();
    let spawns = Arc::new(AtomicUsize::new(0));
    let handle = setup.service_with(
        Arc::new(Sequence {
            first: "sleep 30",
            rest: "sleep 30",
            spawns: Arc::clone(&spawns),
        }),
        Duration::from_secs(5),
    );

    start_ready(&handle).await;
    sigkill(handle.pid().unwrap());

    next_matching(&mut events, |e| matches!(e, FleetEvent::ServiceSpawned { .. })).await;
    handle.mark_ready();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(spawns.load(Ordering::SeqCst), 2);
    assert!(handle.is_ready());

    handle.kill(Some(Duration::from_millis(300))).await;
}
