//! Worker-side runtime: connect to the master, announce readiness, and
//! dispatch inbound opcodes to the worker's callbacks.

pub mod cluster;
pub mod link;
pub mod service;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;

use crate::bootstrap::BootstrapError;
use crate::bridge::error::{IpcError, TransportError};
use crate::bridge::protocol::{ErrorPayload, IpcMessage, IpcResult, OpCode};
use crate::bridge::transport::Inbound;

pub use cluster::{ClusterContext, ClusterWorker, run_cluster};
pub use link::WorkerLink;
pub use service::{ServiceContext, ServiceWorker, run_service};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error("not launched as a {0} worker")]
    WrongRole(&'static str),

    #[error("failed to reach master: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("launch failed: {0}")]
    Launch(ErrorPayload),
}

/// Why a worker's dispatch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// The master sent SHUTDOWN.
    Shutdown,
    /// The connection to the master is gone.
    MasterLost,
}

impl ServeExit {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Shutdown => 0,
            Self::MasterLost => 1,
        }
    }

    /// Terminate the process accordingly.
    pub fn exit_process(self) -> ! {
        tracing::info!(reason = ?self, "Worker exiting");
        std::process::exit(self.exit_code())
    }
}

#[async_trait]
pub(crate) trait Dispatch: Send + Sync + 'static {
    async fn handle(&self, message: IpcMessage, receptive: bool) -> IpcResult;

    async fn shutdown(&self);
}

/// Answer inbound messages until SHUTDOWN or until the master goes away.
///
/// SHUTDOWN runs the shutdown hook, disconnects, and is never replied to.
/// A handler that panics is answered with a `Panic` error.
pub(crate) async fn serve(
    dispatch: Arc<dyn Dispatch>,
    link: &WorkerLink,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
) -> ServeExit {
    while let Some(Inbound { message, reply, .. }) = inbound.recv().await {
        if message.op == OpCode::Shutdown {
            tracing::info!(endpoint = %link.endpoint(), "Shutdown requested by master");
            dispatch.shutdown().await;
            link.disconnect();
            return ServeExit::Shutdown;
        }

        let dispatch = Arc::clone(&dispatch);
        tokio::spawn(async move {
            let op = message.op;
            let receptive = reply.is_receptive();
            let result = match AssertUnwindSafe(dispatch.handle(message, receptive))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let error = ErrorPayload::from_panic(panic.as_ref());
                    tracing::error!(op = ?op, error = %error, "Handler panicked");
                    IpcResult::err(error)
                }
            };
            if !result.success {
                tracing::debug!(op = ?op, d = %result.d, "Handler failed");
            }
            reply.send(result);
        });
    }
    tracing::warn!(endpoint = %link.endpoint(), "Lost connection to master");
    ServeExit::MasterLost
}

pub(crate) fn unsupported(op: OpCode, role: &str) -> IpcResult {
    IpcResult::err(ErrorPayload::validation(format!(
        "{op:?} is not handled by {role} workers"
    )))
}
