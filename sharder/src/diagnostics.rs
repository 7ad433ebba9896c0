//! Named diagnostics invoked remotely through EVAL / SERVICE_EVAL.
//!
//! Each process registers the operations it is willing to run on behalf of
//! its peers. A request names one of them and may pass a single string
//! argument; nothing else is executed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::bridge::protocol::{ErrorPayload, EvalRequest};

pub type DiagnosticResult = Result<Value, ErrorPayload>;

type Handler = Arc<dyn Fn(Option<String>) -> BoxFuture<'static, DiagnosticResult> + Send + Sync>;

/// Registry of diagnostics, cheap to clone and share.
#[derive(Clone, Default)]
pub struct Diagnostics {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("names", &self.names())
            .finish()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a diagnostic.
    pub fn register<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DiagnosticResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |arg| f(arg).boxed());
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.insert(name.into(), handler);
    }

    pub fn names(&self) -> Vec<String> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn run(&self, request: &EvalRequest) -> DiagnosticResult {
        let handler = {
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            handlers.get(&request.name).cloned()
        };
        let Some(handler) = handler else {
            return Err(ErrorPayload::new(
                "UnknownDiagnostic",
                format!("no diagnostic named {:?}", request.name),
            ));
        };
        tracing::debug!(diagnostic = %request.name, "Running diagnostic");
        handler(request.arg.clone()).await
    }
}
