//! sharder: process-fleet orchestrator and IPC hub for sharded gateway services.
//!
//! A master process partitions gateway shards across cluster processes,
//! supervises them alongside named service processes, and routes typed
//! messages between all of them over one local socket.

pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod diagnostics;
pub mod events;
pub mod fleet;
pub mod gateway;
pub mod manager;
pub mod master;
pub mod partition;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

pub use bootstrap::{BootstrapError, WorkerEnv, WorkerRoleEnv};
pub use bridge::{
    ErrorPayload, IpcAddress, IpcError, IpcMessage, IpcResult, OpCode, RemoteError,
    TransportError,
};
pub use bridge::protocol::{ClusterCommandRecipient, EntityKind, EvalRequest, SendOptions, WorkerIdentity};
pub use config::{ManagerConfig, ServiceOptions, ShardCount};
pub use diagnostics::Diagnostics;
pub use events::FleetEvent;
pub use gateway::{Gateway, GatewayEvent, HttpShardHint, ShardHint};
pub use manager::{ManagerError, ShardManager};
pub use master::MasterIpc;
pub use partition::{ShardRange, compute_partition, shard_for_guild};
pub use supervisor::{WorkerHandle, WorkerSpawner};
pub use telemetry::init_tracing;
pub use worker::{
    ClusterContext, ClusterWorker, ServeExit, ServiceContext, ServiceWorker, WorkerError,
    WorkerLink, run_cluster, run_service,
};
