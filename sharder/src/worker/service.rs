//! Service worker: an auxiliary process addressed by name.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Dispatch, ServeExit, WorkerError, WorkerLink, serve, unsupported};
use crate::bootstrap::{WorkerEnv, WorkerRoleEnv};
use crate::bridge::protocol::{
    ErrorPayload, EvalRequest, IpcMessage, IpcResult, OpCode, ServiceCommandRequest,
    WorkerIdentity,
};
use crate::diagnostics::Diagnostics;
use crate::stats::{ProcessStats, StatsReport, StatsSource};

#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub name: String,
    pub path: PathBuf,
    pub link: WorkerLink,
    pub diagnostics: Diagnostics,
}

#[async_trait]
pub trait ServiceWorker: Send + Sync + 'static {
    /// Prepare the service. READY is sent once this returns.
    async fn launch(&self, ctx: &ServiceContext) -> Result<(), ErrorPayload>;

    async fn handle_command(&self, data: Value, receptive: bool) -> Result<Value, ErrorPayload>;

    async fn all_members_cached(&self) {}

    async fn shutdown(&self) {}
}

struct ServiceDispatch<W> {
    worker: Arc<W>,
    ctx: ServiceContext,
}

#[async_trait]
impl<W: ServiceWorker> Dispatch for ServiceDispatch<W> {
    async fn handle(&self, message: IpcMessage, receptive: bool) -> IpcResult {
        let outcome = match message.op {
            OpCode::Eval => match message.payload::<EvalRequest>() {
                Ok(request) => self.ctx.diagnostics.run(&request).await,
                Err(e) => Err(e),
            },
            OpCode::ServiceCommand => match message.payload::<ServiceCommandRequest>() {
                Ok(request) => self.worker.handle_command(request.data, receptive).await,
                Err(e) => Err(e),
            },
            OpCode::GetStats => {
                let report = StatsReport {
                    source: StatsSource::Service(self.ctx.name.clone()),
                    stats: ProcessStats::collect(),
                };
                serde_json::to_value(report).map_err(|e| ErrorPayload::from_error(&e))
            }
            OpCode::AllMembersCached => {
                self.worker.all_members_cached().await;
                Ok(Value::Null)
            }
            op => return unsupported(op, "service"),
        };
        IpcResult::from_outcome(outcome)
    }

    async fn shutdown(&self) {
        self.worker.shutdown().await;
    }
}

/// Connect, launch, announce READY, then serve until told to stop.
pub async fn run_service<W: ServiceWorker>(worker: W, env: WorkerEnv) -> Result<ServeExit, WorkerError> {
    let WorkerRoleEnv::Service { name, path } = env.role else {
        return Err(WorkerError::WrongRole("service"));
    };
    crate::stats::mark_process_start();
    let (link, inbound) =
        WorkerLink::connect(&env.address, &env.prefix, WorkerIdentity::Service(name.clone()))
            .await?;

    let ctx = ServiceContext {
        name,
        path,
        link: link.clone(),
        diagnostics: Diagnostics::new(),
    };
    tracing::info!(service = %ctx.name, path = %ctx.path.display(), "Launching service");
    worker.launch(&ctx).await.map_err(WorkerError::Launch)?;
    link.ready().await?;

    let dispatch = Arc::new(ServiceDispatch {
        worker: Arc::new(worker),
        ctx,
    });
    Ok(serve(dispatch, &link, inbound).await)
}
