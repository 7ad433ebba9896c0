//! A worker's connection to the master, with typed request helpers.

use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::bridge::error::{IpcError, TransportError};
use crate::bridge::protocol::{
    BroadcastResults, ClusterCommandRecipient, ClusterCommandRequest, EntityKind, EvalRequest,
    FetchQuery, FetchReply, FetchRequest, GetReply, IpcMessage, IpcResult, MembersCachedRequest,
    OpCode, ReadyRequest, SendOptions, ServiceCommandRequest, ServiceEvalRequest, SetReply,
    ShutdownReply, ShutdownRequest, WorkerIdentity, master_endpoint,
};
use crate::bridge::transport::{Inbound, IpcAddress, IpcClient};
use crate::gateway::GatewayEvent;

#[derive(Debug, Clone)]
pub struct WorkerLink {
    client: IpcClient,
    identity: WorkerIdentity,
    endpoint: String,
}

impl WorkerLink {
    /// Connect under this worker's endpoint name. Messages from the master
    /// arrive on the returned receiver.
    pub async fn connect(
        address: &IpcAddress,
        prefix: &str,
        identity: WorkerIdentity,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Inbound>), TransportError> {
        let endpoint = identity.endpoint(prefix);
        let (client, inbound) =
            IpcClient::connect(address, endpoint.clone(), master_endpoint(prefix)).await?;
        tracing::info!(endpoint = %endpoint, address = %address, "Connected to master");
        Ok((
            Self {
                client,
                identity,
                endpoint,
            },
            inbound,
        ))
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Raw send. Non-receptive sends resolve to an empty success.
    pub async fn send(
        &self,
        message: IpcMessage,
        options: SendOptions,
    ) -> Result<IpcResult, TransportError> {
        self.client.send(message, options.receptive).await
    }

    async fn request(&self, message: IpcMessage) -> Result<Value, IpcError> {
        let result = self.client.send(message, true).await?;
        Ok(result.into_result()?)
    }

    async fn notify(&self, message: IpcMessage) -> Result<(), IpcError> {
        self.client.send(message, false).await?;
        Ok(())
    }

    /// Tell the master this worker is ready to serve.
    pub async fn ready(&self) -> Result<(), IpcError> {
        let message = IpcMessage::with(OpCode::Ready, &ReadyRequest::for_identity(&self.identity))?;
        self.notify(message).await
    }

    /// Relay a gateway lifecycle event. Only clusters have shards.
    pub async fn report(&self, event: GatewayEvent) -> Result<(), IpcError> {
        let WorkerIdentity::Cluster(id) = self.identity else {
            return Err(IpcError::Validation(
                "gateway events are reported by clusters".into(),
            ));
        };
        self.notify(event.into_message(id)).await
    }

    /// Report that this cluster finished caching guild members.
    pub async fn members_cached(&self) -> Result<(), IpcError> {
        let WorkerIdentity::Cluster(cluster_id) = self.identity else {
            return Err(IpcError::Validation(
                "member caching is reported by clusters".into(),
            ));
        };
        let message =
            IpcMessage::with(OpCode::AllMembersCached, &MembersCachedRequest { cluster_id })?;
        self.notify(message).await
    }

    /// Run a named diagnostic on the master.
    pub async fn send_master_eval(&self, request: &EvalRequest) -> Result<Value, IpcError> {
        self.request(IpcMessage::with(OpCode::Eval, request)?).await
    }

    pub async fn send_service_eval(
        &self,
        service: &str,
        request: &EvalRequest,
    ) -> Result<Value, IpcError> {
        if service.is_empty() {
            return Err(IpcError::Validation("service name is required".into()));
        }
        let payload = ServiceEvalRequest {
            service_name: Some(service.to_string()),
            eval: request.clone(),
        };
        self.request(IpcMessage::with(OpCode::ServiceEval, &payload)?)
            .await
    }

    pub async fn broadcast_service_eval(
        &self,
        request: &EvalRequest,
    ) -> Result<BroadcastResults, IpcError> {
        let payload = ServiceEvalRequest {
            service_name: None,
            eval: request.clone(),
        };
        let d = self
            .request(IpcMessage::with(OpCode::ServiceEval, &payload)?)
            .await?;
        Ok(serde_json::from_value(d)?)
    }

    pub async fn send_service_command(
        &self,
        service: &str,
        data: Value,
        options: SendOptions,
    ) -> Result<Value, IpcError> {
        if service.is_empty() {
            return Err(IpcError::Validation("service name is required".into()));
        }
        let payload = ServiceCommandRequest {
            service_name: Some(service.to_string()),
            data,
        };
        let message = IpcMessage::with(OpCode::ServiceCommand, &payload)?;
        let result = self.client.send(message, options.receptive).await?;
        Ok(result.into_result()?)
    }

    /// With [`ClusterCommandRecipient::All`] the value is a [`BroadcastResults`].
    pub async fn send_cluster_command(
        &self,
        recipient: &ClusterCommandRecipient,
        data: Value,
        options: SendOptions,
    ) -> Result<Value, IpcError> {
        let message = IpcMessage::with(
            OpCode::ClusterCommand,
            &ClusterCommandRequest::new(recipient, data),
        )?;
        let result = self.client.send(message, options.receptive).await?;
        Ok(result.into_result()?)
    }

    /// Look up entities, optionally on one cluster only.
    pub async fn fetch(
        &self,
        kind: EntityKind,
        query: FetchQuery,
        cluster_id: Option<u32>,
    ) -> Result<FetchReply, IpcError> {
        let request = FetchRequest { query, cluster_id };
        request
            .validate(kind)
            .map_err(|e| IpcError::Validation(e.message))?;
        let d = self
            .request(IpcMessage::with(kind.opcode(), &request)?)
            .await?;
        Ok(serde_json::from_value(d)?)
    }

    async fn fetch_one(&self, kind: EntityKind, id: &str) -> Result<Option<Value>, IpcError> {
        let reply = self
            .fetch(kind, FetchQuery::One(id.to_string()), None)
            .await?;
        Ok(reply.found.then_some(reply.result))
    }

    async fn fetch_many(&self, kind: EntityKind, ids: &[&str]) -> Result<FetchReply, IpcError> {
        let ids = ids.iter().map(|id| id.to_string()).collect();
        self.fetch(kind, FetchQuery::Many(ids), None).await
    }

    pub async fn fetch_user(&self, query: &str) -> Result<Option<Value>, IpcError> {
        self.fetch_one(EntityKind::User, query).await
    }

    pub async fn fetch_users(&self, queries: &[&str]) -> Result<FetchReply, IpcError> {
        self.fetch_many(EntityKind::User, queries).await
    }

    pub async fn fetch_channel(&self, id: &str) -> Result<Option<Value>, IpcError> {
        self.fetch_one(EntityKind::Channel, id).await
    }

    pub async fn fetch_channels(&self, ids: &[&str]) -> Result<FetchReply, IpcError> {
        self.fetch_many(EntityKind::Channel, ids).await
    }

    pub async fn fetch_guild(&self, id: &str) -> Result<Option<Value>, IpcError> {
        self.fetch_one(EntityKind::Guild, id).await
    }

    pub async fn fetch_guilds(&self, ids: &[&str]) -> Result<FetchReply, IpcError> {
        self.fetch_many(EntityKind::Guild, ids).await
    }

    /// Read from the master's shared store.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, IpcError> {
        let d = self
            .request(IpcMessage::new(OpCode::Get, json!({ "key": key })))
            .await?;
        let reply: GetReply = serde_json::from_value(d)?;
        Ok(reply.found.then_some(reply.value))
    }

    /// Write to the master's shared store; true if a value was replaced.
    pub async fn set(&self, key: &str, value: Value) -> Result<bool, IpcError> {
        let d = self
            .request(IpcMessage::new(
                OpCode::Set,
                json!({ "key": key, "value": value }),
            ))
            .await?;
        let reply: SetReply = serde_json::from_value(d)?;
        Ok(reply.replaced)
    }

    /// Ask the master to stop (or restart) this worker. Returns the pid it acted on.
    pub async fn request_shutdown(&self, restart: bool) -> Result<Option<u32>, IpcError> {
        let d = self
            .request(IpcMessage::with(
                OpCode::Shutdown,
                &ShutdownRequest { restart },
            )?)
            .await?;
        let reply: ShutdownReply = serde_json::from_value(d)?;
        Ok(reply.pid)
    }

    pub fn disconnect(&self) {
        tracing::debug!(endpoint = %self.endpoint, "Disconnecting from master");
        self.client.close();
    }
}
