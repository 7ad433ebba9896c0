//! Master-side IPC: opcode dispatch, routing and aggregation.
//!
//! Every inbound message is handled on its own task so a slow relay never
//! holds up READY processing. Relays forward the target's reply unchanged;
//! broadcasts gather successes and failures separately.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::error::{IpcError, TransportError};
use crate::bridge::protocol::{
    BroadcastResults, ClusterCommandRecipient, ClusterCommandRequest, EntityKind, ErrorPayload,
    EvalRequest, FetchQuery, FetchReply, FetchRequest, IpcMessage, IpcResult,
    MembersCachedRequest, OpCode, ReadyRequest, SendOptions, ServiceCommandRequest,
    ServiceEvalRequest, ShardNotice, ShutdownReply, ShutdownRequest, WorkerIdentity,
    cluster_filter, service_filter,
};
use crate::bridge::transport::{Inbound, IpcServer, ReplyTo};
use crate::diagnostics::Diagnostics;
use crate::events::{EventBus, FleetEvent};
use crate::fleet::Fleet;
use crate::stats::{StatsReport, StatsSnapshot};
use crate::store::SharedStore;

type Replies = Vec<(String, Result<IpcResult, TransportError>)>;

pub struct MasterIpc {
    server: Arc<IpcServer>,
    prefix: String,
    store: SharedStore,
    diagnostics: Diagnostics,
    fleet: Arc<Fleet>,
    events: EventBus,
    members_cached: StdMutex<HashSet<u32>>,
}

impl std::fmt::Debug for MasterIpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterIpc")
            .field("server", &self.server)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl MasterIpc {
    pub fn new(
        server: Arc<IpcServer>,
        prefix: impl Into<String>,
        fleet: Arc<Fleet>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            server,
            prefix: prefix.into(),
            store: SharedStore::new(),
            diagnostics: Diagnostics::new(),
            fleet,
            events,
            members_cached: StdMutex::new(HashSet::new()),
        })
    }

    pub fn server(&self) -> &Arc<IpcServer> {
        &self.server
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Start the dispatch loop on its own task.
    pub fn spawn_dispatch(self: &Arc<Self>, inbound: mpsc::UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(inbound))
    }

    /// Dispatch inbound messages until every connection and the server are gone.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(item) = inbound.recv().await {
            let master = Arc::clone(&self);
            tokio::spawn(async move { master.dispatch(item).await });
        }
        tracing::debug!("Master dispatch loop stopped");
    }

    async fn dispatch(self: Arc<Self>, inbound: Inbound) {
        let Inbound {
            from,
            message,
            reply,
        } = inbound;
        tracing::trace!(from = %from, op = ?message.op, receptive = reply.is_receptive(), "Master received");

        match message.op {
            OpCode::Ready => reply.send(self.on_ready(&from, &message)),
            OpCode::Eval => {
                let outcome = match message.payload::<EvalRequest>() {
                    Ok(request) => self.diagnostics.run(&request).await,
                    Err(e) => Err(e),
                };
                reply.send(IpcResult::from_outcome(outcome));
            }
            OpCode::ServiceEval => {
                let result = self.on_service_eval(&message).await;
                reply.send(result);
            }
            OpCode::Get => reply.send(IpcResult::from_outcome(
                self.store.handle_get(&message.d).and_then(to_value),
            )),
            OpCode::Set => reply.send(IpcResult::from_outcome(
                self.store.handle_set(&message.d).and_then(to_value),
            )),
            OpCode::FetchUser | OpCode::FetchChannel | OpCode::FetchGuild => {
                let result = self.on_fetch(message).await;
                reply.send(result);
            }
            OpCode::ClusterCommand => {
                let receptive = reply.is_receptive();
                let result = match message.payload::<ClusterCommandRequest>() {
                    Ok(request) => match request.recipient() {
                        Ok(recipient) => {
                            self.route_cluster_command(&recipient, request.data, receptive)
                                .await
                        }
                        Err(e) => IpcResult::err(e),
                    },
                    Err(e) => IpcResult::err(e),
                };
                reply.send(result);
            }
            OpCode::ServiceCommand => {
                let receptive = reply.is_receptive();
                let result = match message.payload::<ServiceCommandRequest>() {
                    Ok(ServiceCommandRequest {
                        service_name: Some(name),
                        data,
                    }) if !name.is_empty() => {
                        self.route_service_command(&name, data, receptive).await
                    }
                    Ok(_) => IpcResult::err(ErrorPayload::validation(
                        "serviceName is a required string",
                    )),
                    Err(e) => IpcResult::err(e),
                };
                reply.send(result);
            }
            OpCode::Shutdown => self.on_shutdown(&from, &message, reply),
            OpCode::GetStats => reply.send(IpcResult::err(ErrorPayload::validation(
                "GET_STATS is answered by workers, not the master",
            ))),
            OpCode::AllMembersCached => {
                self.on_members_cached(&from, &message).await;
                reply.send(IpcResult::empty());
            }
            OpCode::ShardConnected
            | OpCode::ShardReady
            | OpCode::ShardResumed
            | OpCode::ShardDisconnected
            | OpCode::Error => {
                self.on_gateway_event(&from, &message);
                reply.send(IpcResult::empty());
            }
        }
    }

    fn sender(&self, from: &str) -> Option<WorkerIdentity> {
        WorkerIdentity::from_endpoint(&self.prefix, from)
    }

    /// The connection's endpoint name decides who is ready; a payload that
    /// names someone else is rejected.
    fn on_ready(&self, from: &str, message: &IpcMessage) -> IpcResult {
        let Some(sender) = self.sender(from) else {
            tracing::warn!(from = %from, "READY from a foreign endpoint");
            return IpcResult::err(ErrorPayload::validation(format!(
                "READY from unrecognised endpoint {from:?}"
            )));
        };
        let claimed = message
            .payload::<ReadyRequest>()
            .ok()
            .and_then(|r| r.identity());
        if let Some(claimed) = claimed
            && claimed != sender
        {
            tracing::warn!(from = %from, claimed = %claimed, "READY names another worker");
            return IpcResult::err(ErrorPayload::validation(format!(
                "{from} cannot report READY for {claimed}"
            )));
        }
        match self.fleet.handle(&sender) {
            Some(handle) => {
                handle.mark_ready();
                IpcResult::empty()
            }
            None => {
                tracing::warn!(from = %from, "READY from unknown worker");
                IpcResult::err(ErrorPayload::validation(format!("{sender} is not supervised")))
            }
        }
    }

    async fn on_service_eval(&self, message: &IpcMessage) -> IpcResult {
        let request = match message.payload::<ServiceEvalRequest>() {
            Ok(request) => request,
            Err(e) => return IpcResult::err(e),
        };
        match request.service_name {
            Some(name) => {
                let eval = IpcMessage::with(OpCode::Eval, &request.eval);
                match eval {
                    Ok(eval) => self.relay(&self.service_endpoint(&name), eval, true).await,
                    Err(e) => IpcResult::err(ErrorPayload::from_error(&e)),
                }
            }
            None => to_result(&self.broadcast_service_eval(&request.eval).await),
        }
    }

    async fn on_fetch(&self, message: IpcMessage) -> IpcResult {
        let Some(kind) = message.op.entity_kind() else {
            return IpcResult::err(ErrorPayload::validation("not a fetch opcode"));
        };
        let request = match message.payload::<FetchRequest>() {
            Ok(request) => request,
            Err(e) => return IpcResult::err(e),
        };
        if let Err(e) = request.validate(kind) {
            return IpcResult::err(e);
        }

        if let Some(cluster_id) = request.cluster_id {
            return self.relay(&self.cluster_endpoint(cluster_id), message, true).await;
        }

        // A guild lives on exactly one shard, so a single guild lookup goes straight to its owner.
        if kind == EntityKind::Guild
            && let FetchQuery::One(id) = &request.query
            && let Ok(guild_id) = id.parse::<u64>()
            && let Some(owner) = self.fleet.cluster_for_guild(guild_id)
        {
            return self.relay(owner.endpoint(), message, true).await;
        }

        let replies = self.broadcast_clusters(&message, true).await;
        to_result(&merge_fetch(request.query.is_batch(), replies))
    }

    fn on_shutdown(&self, from: &str, message: &IpcMessage, reply: ReplyTo) {
        let restart = message
            .payload::<ShutdownRequest>()
            .map(|r| r.restart)
            .unwrap_or(false);
        let Some(handle) = self.sender(from).and_then(|id| self.fleet.handle(&id)) else {
            reply.send(IpcResult::err(ErrorPayload::validation(format!(
                "shutdown requested by unknown endpoint {from:?}"
            ))));
            return;
        };

        let pid = handle.pid();
        reply.send(IpcResult::from_outcome(to_value(ShutdownReply { pid })));

        let events = self.events.clone();
        tracing::info!(worker = %handle.identity(), restart, "Worker requested shutdown");
        tokio::spawn(async move {
            if restart {
                if let Err(e) = handle.respawn().await {
                    tracing::error!(worker = %handle.identity(), error = %e, "Requested restart failed");
                    events.emit(FleetEvent::SpawnFailed {
                        worker: handle.identity().clone(),
                        error: e.to_string(),
                    });
                }
            } else {
                handle.kill(handle.kill_timeout()).await;
            }
        });
    }

    async fn on_members_cached(&self, from: &str, message: &IpcMessage) {
        let cluster_id = match message.payload::<MembersCachedRequest>() {
            Ok(r) => r.cluster_id,
            Err(_) => match self.sender(from) {
                Some(WorkerIdentity::Cluster(id)) => id,
                _ => {
                    tracing::warn!(from = %from, "ALL_MEMBERS_CACHED without a cluster id");
                    return;
                }
            },
        };

        let complete = {
            let mut reported = self
                .members_cached
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            reported.insert(cluster_id);
            let expected: HashSet<u32> = self
                .fleet
                .clusters()
                .iter()
                .filter_map(|h| match h.identity() {
                    WorkerIdentity::Cluster(id) => Some(*id),
                    WorkerIdentity::Service(_) => None,
                })
                .collect();
            let complete = !expected.is_empty() && expected.is_subset(&reported);
            if complete {
                reported.clear();
            }
            complete
        };
        tracing::debug!(cluster_id, complete, "Cluster reported members cached");

        if complete {
            tracing::info!("All clusters have cached their members");
            self.events.emit(FleetEvent::AllMembersCached);
            let message = IpcMessage::bare(OpCode::AllMembersCached);
            for (endpoint, result) in self.broadcast_workers(&message, false).await {
                if let Err(e) = result {
                    tracing::debug!(endpoint = %endpoint, error = %e, "ALL_MEMBERS_CACHED not delivered");
                }
            }
        }
    }

    fn on_gateway_event(&self, from: &str, message: &IpcMessage) {
        let notice = match message.payload::<ShardNotice>() {
            Ok(notice) => notice,
            Err(e) => {
                tracing::warn!(from = %from, error = %e, "Malformed gateway notification");
                return;
            }
        };
        let cluster_id = notice.id;
        let shard_id = notice.shard_id;
        let event = match message.op {
            OpCode::ShardConnected => FleetEvent::ShardConnected { cluster_id, shard_id },
            OpCode::ShardReady => FleetEvent::ShardReady { cluster_id, shard_id },
            OpCode::ShardResumed => FleetEvent::ShardResumed { cluster_id, shard_id },
            OpCode::ShardDisconnected => {
                tracing::warn!(cluster_id, shard_id = ?shard_id, "Shard disconnected");
                FleetEvent::ShardDisconnected {
                    cluster_id,
                    shard_id,
                    error: notice.error,
                }
            }
            _ => {
                let error = notice
                    .error
                    .unwrap_or_else(|| ErrorPayload::new("Error", "unspecified gateway error"));
                tracing::error!(cluster_id, shard_id = ?shard_id, error = %error, "Cluster reported error");
                FleetEvent::WorkerError {
                    worker: WorkerIdentity::Cluster(cluster_id),
                    shard_id,
                    error,
                }
            }
        };
        self.events.emit(event);
    }

    fn cluster_endpoint(&self, id: u32) -> String {
        WorkerIdentity::Cluster(id).endpoint(&self.prefix)
    }

    fn service_endpoint(&self, name: &str) -> String {
        WorkerIdentity::Service(name.to_string()).endpoint(&self.prefix)
    }

    /// Send to one endpoint; transport failures become error results.
    async fn relay(&self, endpoint: &str, message: IpcMessage, receptive: bool) -> IpcResult {
        match self.server.send_to(endpoint, message, receptive).await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(endpoint = %endpoint, error = %e, "Relay failed");
                IpcResult::err(ErrorPayload::named("TransportError", &e))
            }
        }
    }

    async fn broadcast_clusters(&self, message: &IpcMessage, receptive: bool) -> Replies {
        let filter = cluster_filter(&self.prefix);
        self.server
            .broadcast(message, receptive, |name| name.starts_with(&filter))
            .await
    }

    async fn broadcast_services(&self, message: &IpcMessage, receptive: bool) -> Replies {
        let filter = service_filter(&self.prefix);
        self.server
            .broadcast(message, receptive, |name| name.starts_with(&filter))
            .await
    }

    async fn broadcast_workers(&self, message: &IpcMessage, receptive: bool) -> Replies {
        let clusters = cluster_filter(&self.prefix);
        let services = service_filter(&self.prefix);
        self.server
            .broadcast(message, receptive, |name| {
                name.starts_with(&clusters) || name.starts_with(&services)
            })
            .await
    }

    async fn route_cluster_command(
        &self,
        recipient: &ClusterCommandRecipient,
        data: Value,
        receptive: bool,
    ) -> IpcResult {
        let message = match IpcMessage::with(
            OpCode::ClusterCommand,
            &ClusterCommandRequest::new(recipient, data),
        ) {
            Ok(message) => message,
            Err(e) => return IpcResult::err(ErrorPayload::from_error(&e)),
        };

        match recipient {
            ClusterCommandRecipient::Cluster(id) => {
                self.relay(&self.cluster_endpoint(*id), message, receptive).await
            }
            ClusterCommandRecipient::Guild(guild_id) => {
                match self.fleet.cluster_for_guild(*guild_id) {
                    Some(owner) => self.relay(owner.endpoint(), message, receptive).await,
                    None => IpcResult::err(ErrorPayload::validation(format!(
                        "no cluster owns guild {guild_id}"
                    ))),
                }
            }
            ClusterCommandRecipient::All => {
                let replies = self.broadcast_clusters(&message, receptive).await;
                if receptive {
                    to_result(&gather(replies))
                } else {
                    IpcResult::empty()
                }
            }
        }
    }

    async fn route_service_command(&self, name: &str, data: Value, receptive: bool) -> IpcResult {
        let request = ServiceCommandRequest {
            service_name: Some(name.to_string()),
            data,
        };
        match IpcMessage::with(OpCode::ServiceCommand, &request) {
            Ok(message) => {
                self.relay(&self.service_endpoint(name), message, receptive)
                    .await
            }
            Err(e) => IpcResult::err(ErrorPayload::from_error(&e)),
        }
    }

    /// Run a diagnostic on one cluster.
    pub async fn send_eval(&self, cluster_id: u32, request: &EvalRequest) -> Result<Value, IpcError> {
        let message = IpcMessage::with(OpCode::Eval, request)?;
        let result = self
            .server
            .send_to(&self.cluster_endpoint(cluster_id), message, true)
            .await?;
        Ok(result.into_result()?)
    }

    /// Run a diagnostic on every cluster.
    pub async fn broadcast_eval(&self, request: &EvalRequest) -> Result<BroadcastResults, IpcError> {
        let message = IpcMessage::with(OpCode::Eval, request)?;
        Ok(gather(self.broadcast_clusters(&message, true).await))
    }

    /// Run a diagnostic on one service.
    pub async fn send_service_eval(
        &self,
        name: &str,
        request: &EvalRequest,
    ) -> Result<Value, IpcError> {
        let message = IpcMessage::with(OpCode::Eval, request)?;
        let result = self
            .server
            .send_to(&self.service_endpoint(name), message, true)
            .await?;
        Ok(result.into_result()?)
    }

    /// Run a diagnostic on every service.
    pub async fn broadcast_service_eval(&self, request: &EvalRequest) -> BroadcastResults {
        match IpcMessage::with(OpCode::Eval, request) {
            Ok(message) => gather(self.broadcast_services(&message, true).await),
            Err(e) => BroadcastResults {
                results: Vec::new(),
                errors: vec![ErrorPayload::from_error(&e)],
            },
        }
    }

    pub async fn send_service_command(
        &self,
        name: &str,
        data: Value,
        options: SendOptions,
    ) -> Result<Value, IpcError> {
        if name.is_empty() {
            return Err(IpcError::Validation("service name is required".into()));
        }
        let result = self.route_service_command(name, data, options.receptive).await;
        Ok(result.into_result()?)
    }

    /// Dispatch a command to one cluster, the owner of a guild, or all of them.
    ///
    /// With [`ClusterCommandRecipient::All`] the value is a [`BroadcastResults`].
    pub async fn send_cluster_command(
        &self,
        recipient: &ClusterCommandRecipient,
        data: Value,
        options: SendOptions,
    ) -> Result<Value, IpcError> {
        let result = self
            .route_cluster_command(recipient, data, options.receptive)
            .await;
        Ok(result.into_result()?)
    }

    /// Poll every worker for GET_STATS and bucket the replies.
    pub async fn collect_stats(&self) -> (StatsSnapshot, Vec<ErrorPayload>) {
        let message = IpcMessage::bare(OpCode::GetStats);
        let mut reports = Vec::new();
        let mut errors = Vec::new();
        for (endpoint, result) in self.broadcast_workers(&message, true).await {
            let outcome = result
                .map_err(|e| ErrorPayload::named("TransportError", &e))
                .and_then(IpcResult::into_outcome)
                .and_then(|d| {
                    serde_json::from_value::<StatsReport>(d)
                        .map_err(|e| ErrorPayload::named("DecodeError", &e))
                });
            match outcome {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::debug!(endpoint = %endpoint, error = %e, "Stats reply failed");
                    errors.push(e);
                }
            }
        }
        (StatsSnapshot::from_reports(reports), errors)
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, ErrorPayload> {
    serde_json::to_value(value).map_err(|e| ErrorPayload::named("EncodeError", &e))
}

fn to_result<T: Serialize>(value: &T) -> IpcResult {
    IpcResult::from_outcome(to_value(value))
}

fn gather(replies: Replies) -> BroadcastResults {
    BroadcastResults::gather(replies.into_iter().map(|(_, result)| {
        result.unwrap_or_else(|e| IpcResult::err(ErrorPayload::named("TransportError", &e)))
    }))
}

/// Merge per-cluster fetch replies: first hit for a single id, concatenation for a batch.
fn merge_fetch(batch: bool, replies: Replies) -> FetchReply {
    let mut single: Option<Value> = None;
    let mut many: Vec<Value> = Vec::new();
    let mut errors = Vec::new();

    for (endpoint, result) in replies {
        let reply = result
            .map_err(|e| ErrorPayload::named("TransportError", &e))
            .and_then(IpcResult::into_outcome)
            .and_then(|d| {
                serde_json::from_value::<FetchReply>(d)
                    .map_err(|e| ErrorPayload::named("DecodeError", &e))
            });
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(endpoint = %endpoint, error = %e, "Fetch failed on cluster");
                errors.push(e);
                continue;
            }
        };
        errors.extend(reply.errors);
        if !reply.found {
            continue;
        }
        if batch {
            match reply.result {
                Value::Array(items) => many.extend(items.into_iter().filter(|v| !v.is_null())),
                Value::Null => {}
                other => many.push(other),
            }
        } else if single.is_none() && !reply.result.is_null() {
            single = Some(reply.result);
        }
    }

    let mut merged = if batch {
        FetchReply::batch(many)
    } else {
        FetchReply::single(single)
    };
    merged.errors = errors;
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok(endpoint: &str, reply: FetchReply) -> (String, Result<IpcResult, TransportError>) {
        (
            endpoint.to_string(),
            Ok(IpcResult::ok(serde_json::to_value(reply).unwrap())),
        )
    }

    #[test]
    fn single_fetch_takes_first_hit_and_keeps_errors() {
        let replies = vec![
            ok("sharder:cluster:0", FetchReply::single(None)),
            (
                "sharder:cluster:1".to_string(),
                Err(TransportError::Disconnected("sharder:cluster:1".into())),
            ),
            ok("sharder:cluster:2", FetchReply::single(Some(json!({"id": "42"})))),
            ok("sharder:cluster:3", FetchReply::single(Some(json!({"id": "other"})))),
        ];
        let merged = merge_fetch(false, replies);
        assert!(merged.found);
        assert_eq!(merged.result, json!({"id": "42"}));
        assert_eq!(merged.errors.len(), 1);
        assert_eq!(merged.errors[0].name, "TransportError");
    }

    #[test]
    fn batch_fetch_concatenates() {
        let replies = vec![
            ok("a", FetchReply::batch(vec![json!({"id": "1"})])),
            ok("b", FetchReply::batch(vec![])),
            ok("c", FetchReply::batch(vec![json!({"id": "2"}), json!({"id": "3"})])),
        ];
        let merged = merge_fetch(true, replies);
        assert!(merged.found);
        assert_eq!(
            merged.result,
            json!([{"id": "1"}, {"id": "2"}, {"id": "3"}])
        );
        assert!(merged.errors.is_empty());
    }

    #[test]
    fn nothing_found_is_not_an_error() {
        let merged = merge_fetch(false, vec![ok("a", FetchReply::single(None))]);
        assert!(!merged.found);
        assert_eq!(merged.result, Value::Null);
    }

    #[test]
    fn remote_failures_are_collected() {
        let replies = vec![(
            "a".to_string(),
            Ok(IpcResult::err(ErrorPayload::new("CacheError", "evicted"))),
        )];
        let merged = merge_fetch(true, replies);
        assert!(!merged.found);
        assert_eq!(merged.result, json!([]));
        assert_eq!(merged.errors[0].message, "evicted");
    }

    #[test]
    fn gather_segregates_transport_errors() {
        let results = gather(vec![
            ("a".into(), Ok(IpcResult::ok(json!("pong")))),
            ("b".into(), Err(TransportError::UnknownEndpoint("b".into()))),
        ]);
        assert_eq!(results.results, vec![json!("pong")]);
        assert_eq!(results.errors.len(), 1);
    }
}
