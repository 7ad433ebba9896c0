//! Fleet notifications published by the master.
//!
//! Subscribers get a `tokio::sync::broadcast` receiver; a slow subscriber
//! lags and loses the oldest events rather than blocking the fleet.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::bridge::protocol::{ErrorPayload, WorkerIdentity};
use crate::partition::ShardRange;
use crate::stats::StatsSnapshot;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    ClusterSpawned {
        cluster_id: u32,
        shards: ShardRange,
        pid: Option<u32>,
    },
    ServiceSpawned {
        name: String,
        pid: Option<u32>,
    },
    WorkerReady {
        #[serde(serialize_with = "serialize_identity")]
        worker: WorkerIdentity,
    },
    WorkerExited {
        #[serde(serialize_with = "serialize_identity")]
        worker: WorkerIdentity,
        code: Option<i32>,
        expected: bool,
    },
    SpawnFailed {
        #[serde(serialize_with = "serialize_identity")]
        worker: WorkerIdentity,
        error: String,
    },
    ShardConnected {
        cluster_id: u32,
        shard_id: Option<u32>,
    },
    ShardReady {
        cluster_id: u32,
        shard_id: Option<u32>,
    },
    ShardResumed {
        cluster_id: u32,
        shard_id: Option<u32>,
    },
    ShardDisconnected {
        cluster_id: u32,
        shard_id: Option<u32>,
        error: Option<ErrorPayload>,
    },
    WorkerError {
        #[serde(serialize_with = "serialize_identity")]
        worker: WorkerIdentity,
        shard_id: Option<u32>,
        error: ErrorPayload,
    },
    AllMembersCached,
    StatsUpdated(Box<StatsSnapshot>),
    StatsFailed {
        error: String,
    },
}

fn serialize_identity<S: serde::Serializer>(
    identity: &WorkerIdentity,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(identity)
}

/// Cloneable publisher. Sending with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: FleetEvent) {
        tracing::trace!(?event, "Fleet event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(FleetEvent::WorkerReady {
            worker: WorkerIdentity::Cluster(2),
        });
        match rx.recv().await.unwrap() {
            FleetEvent::WorkerReady { worker } => assert_eq!(worker, WorkerIdentity::Cluster(2)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        EventBus::new().emit(FleetEvent::AllMembersCached);
    }

    #[test]
    fn events_serialize_with_readable_worker() {
        let event = FleetEvent::WorkerExited {
            worker: WorkerIdentity::Service("api".into()),
            code: Some(1),
            expected: false,
        };
        insta::assert_json_snapshot!(event, @r#"
        {
          "type": "worker_exited",
          "worker": "service api",
          "code": 1,
          "expected": false
        }
        "#);
    }
}
