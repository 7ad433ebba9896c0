//! Cluster worker: drives a range of gateway shards.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;

use super::{Dispatch, ServeExit, WorkerError, WorkerLink, serve, unsupported};
use crate::bootstrap::{WorkerEnv, WorkerRoleEnv};
use crate::bridge::protocol::{
    ClusterCommandRequest, EntityKind, ErrorPayload, EvalRequest, FetchQuery, FetchReply,
    FetchRequest, IpcMessage, IpcResult, OpCode, WorkerIdentity,
};
use crate::diagnostics::Diagnostics;
use crate::gateway::Gateway;
use crate::partition::ShardRange;
use crate::stats::{ProcessStats, StatsReport, StatsSource};

/// What a cluster worker gets to work with.
#[derive(Debug, Clone)]
pub struct ClusterContext {
    pub id: u32,
    pub shards: ShardRange,
    pub link: WorkerLink,
    /// Diagnostics the master and peers may invoke on this cluster.
    pub diagnostics: Diagnostics,
}

/// Business logic of a cluster process.
#[async_trait]
pub trait ClusterWorker: Send + Sync + 'static {
    /// Bring up the gateway for `ctx.shards`. READY is sent once this returns.
    async fn launch(&self, ctx: &ClusterContext) -> Result<(), ErrorPayload>;

    /// Entity cache backing FETCH_* lookups.
    fn gateway(&self) -> Arc<dyn Gateway>;

    /// CLUSTER_COMMAND payload; the value is replied when the sender asked for it.
    async fn handle_command(&self, data: Value, receptive: bool) -> Result<Value, ErrorPayload>;

    async fn all_members_cached(&self) {}

    async fn shutdown(&self) {}
}

struct ClusterDispatch<W> {
    worker: Arc<W>,
    gateway: Arc<dyn Gateway>,
    ctx: ClusterContext,
}

impl<W: ClusterWorker> ClusterDispatch<W> {
    async fn fetch(&self, kind: EntityKind, message: &IpcMessage) -> Result<Value, ErrorPayload> {
        let request: FetchRequest = message.payload()?;
        request.validate(kind)?;

        let reply = match &request.query {
            FetchQuery::One(id) => FetchReply::single(self.gateway.entity(kind, id).await),
            FetchQuery::Many(ids) => {
                let found = join_all(ids.iter().map(|id| self.gateway.entity(kind, id))).await;
                FetchReply::batch(found.into_iter().flatten().collect())
            }
        };
        serde_json::to_value(reply).map_err(|e| ErrorPayload::from_error(&e))
    }

    fn stats(&self) -> Result<Value, ErrorPayload> {
        let report = StatsReport {
            source: StatsSource::Cluster(self.ctx.id),
            stats: ProcessStats::collect().with_extra(self.gateway.stats()),
        };
        serde_json::to_value(report).map_err(|e| ErrorPayload::from_error(&e))
    }
}

#[async_trait]
impl<W: ClusterWorker> Dispatch for ClusterDispatch<W> {
    async fn handle(&self, message: IpcMessage, receptive: bool) -> IpcResult {
        let outcome = match message.op {
            OpCode::Eval => match message.payload::<EvalRequest>() {
                Ok(request) => self.ctx.diagnostics.run(&request).await,
                Err(e) => Err(e),
            },
            OpCode::ClusterCommand => match message.payload::<ClusterCommandRequest>() {
                Ok(request) => self.worker.handle_command(request.data, receptive).await,
                Err(e) => Err(e),
            },
            OpCode::FetchUser => self.fetch(EntityKind::User, &message).await,
            OpCode::FetchChannel => self.fetch(EntityKind::Channel, &message).await,
            OpCode::FetchGuild => self.fetch(EntityKind::Guild, &message).await,
            OpCode::GetStats => self.stats(),
            OpCode::AllMembersCached => {
                self.worker.all_members_cached().await;
                Ok(Value::Null)
            }
            op => return unsupported(op, "cluster"),
        };
        IpcResult::from_outcome(outcome)
    }

    async fn shutdown(&self) {
        self.worker.shutdown().await;
    }
}

/// Connect, launch, announce READY, then serve until told to stop.
pub async fn run_cluster<W: ClusterWorker>(worker: W, env: WorkerEnv) -> Result<ServeExit, WorkerError> {
    let WorkerRoleEnv::Cluster { id, shards } = env.role else {
        return Err(WorkerError::WrongRole("cluster"));
    };
    crate::stats::mark_process_start();
    let (link, inbound) =
        WorkerLink::connect(&env.address, &env.prefix, WorkerIdentity::Cluster(id)).await?;

    let ctx = ClusterContext {
        id,
        shards,
        link: link.clone(),
        diagnostics: Diagnostics::new(),
    };
    tracing::info!(cluster_id = id, first = shards.first, last = shards.last, total = shards.total, "Launching cluster");
    worker.launch(&ctx).await.map_err(WorkerError::Launch)?;
    link.ready().await?;

    let worker = Arc::new(worker);
    let dispatch = Arc::new(ClusterDispatch {
        gateway: worker.gateway(),
        worker,
        ctx,
    });
    Ok(serve(dispatch, &link, inbound).await)
}
