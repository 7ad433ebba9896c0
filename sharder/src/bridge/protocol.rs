//! Wire protocol types for master-worker communication.
//!
//! Every connection carries [`Frame`]s. A `Message` frame holds an opcoded
//! [`IpcMessage`]; it is receptive when it carries a correlation id, in which
//! case the peer answers with a `Reply` frame holding an [`IpcResult`].

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Message kinds understood by the master and the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpCode {
    Ready,
    Eval,
    ServiceEval,
    Get,
    Set,
    FetchUser,
    FetchChannel,
    FetchGuild,
    ClusterCommand,
    ServiceCommand,
    Shutdown,
    GetStats,
    AllMembersCached,
    ShardConnected,
    ShardReady,
    ShardResumed,
    ShardDisconnected,
    Error,
}

impl OpCode {
    /// Entity kind looked up by a fetch opcode.
    pub fn entity_kind(self) -> Option<EntityKind> {
        match self {
            Self::FetchUser => Some(EntityKind::User),
            Self::FetchChannel => Some(EntityKind::Channel),
            Self::FetchGuild => Some(EntityKind::Guild),
            _ => None,
        }
    }
}

/// Per-send options. Sends are fire-and-forget unless `receptive`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub receptive: bool,
}

impl SendOptions {
    pub fn receptive() -> Self {
        Self { receptive: true }
    }
}

/// Opcoded payload sent over a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    pub op: OpCode,
    #[serde(default)]
    pub d: Value,
}

impl IpcMessage {
    pub fn new(op: OpCode, d: Value) -> Self {
        Self { op, d }
    }

    pub fn bare(op: OpCode) -> Self {
        Self { op, d: Value::Null }
    }

    /// Build a message from any serializable payload.
    pub fn with<T: Serialize>(op: OpCode, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op,
            d: serde_json::to_value(payload)?,
        })
    }

    /// Decode the payload, mapping schema mismatches to a validation error.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ErrorPayload> {
        serde_json::from_value(self.d.clone()).map_err(|e| {
            ErrorPayload::validation(format!("invalid {:?} payload: {}", self.op, e))
        })
    }
}

/// Outcome of a receptive request.
///
/// `success == false` implies `d` holds an [`ErrorPayload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResult {
    pub success: bool,
    #[serde(default)]
    pub d: Value,
}

impl IpcResult {
    pub fn ok(d: Value) -> Self {
        Self { success: true, d }
    }

    /// Synthetic result for sends that did not ask for a reply.
    pub fn empty() -> Self {
        Self::ok(Value::Null)
    }

    pub fn err(error: ErrorPayload) -> Self {
        Self {
            success: false,
            d: error.into_value(),
        }
    }

    pub fn from_outcome(outcome: Result<Value, ErrorPayload>) -> Self {
        match outcome {
            Ok(d) => Self::ok(d),
            Err(e) => Self::err(e),
        }
    }

    /// Split into the payload or the error it carries.
    pub fn into_outcome(self) -> Result<Value, ErrorPayload> {
        if self.success {
            Ok(self.d)
        } else {
            Err(ErrorPayload::from_value(self.d))
        }
    }

    /// Like [`into_outcome`](Self::into_outcome), reconstructing a native error.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        self.into_outcome().map_err(RemoteError::from)
    }
}

/// Process-boundary-safe projection of an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("ValidationError", message)
    }

    /// Project a native error; the `source()` chain becomes the stack.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let full = std::any::type_name::<E>();
        let name = full
            .split('<')
            .next()
            .and_then(|path| path.rsplit("::").next())
            .unwrap_or(full);
        Self::named(name, err)
    }

    /// Project a native error under an explicit name.
    pub fn named(name: impl Into<String>, err: &dyn std::error::Error) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            name: name.into(),
            message: err.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }

    /// Project a caught panic; string payloads become the message.
    pub fn from_panic(panic: &(dyn std::any::Any + Send)) -> Self {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string());
        Self::new("Panic", message)
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Lenient decode: anything that is not an error record becomes its JSON text.
    pub fn from_value(d: Value) -> Self {
        match serde_json::from_value::<ErrorPayload>(d.clone()) {
            Ok(payload) => payload,
            Err(_) => Self::new("Error", d.to_string()),
        }
    }

    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// An error raised by the counterpart process, reconstructed locally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl From<ErrorPayload> for RemoteError {
    fn from(p: ErrorPayload) -> Self {
        Self {
            name: p.name,
            message: p.message,
            stack: p.stack,
        }
    }
}

impl From<RemoteError> for ErrorPayload {
    fn from(e: RemoteError) -> Self {
        Self {
            name: e.name,
            message: e.message,
            stack: e.stack,
        }
    }
}

/// Unit of transmission on a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame from a connecting worker: its endpoint name.
    Hello { name: String },

    /// Request; receptive when `id` is present.
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        message: IpcMessage,
    },

    Reply { id: u64, result: IpcResult },
}

/// Identity of a worker process, as encoded in its endpoint name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkerIdentity {
    Cluster(u32),
    Service(String),
}

impl WorkerIdentity {
    /// `<prefix>:cluster:<id>` or `<prefix>:service:<name>`.
    pub fn endpoint(&self, prefix: &str) -> String {
        match self {
            Self::Cluster(id) => format!("{prefix}:cluster:{id}"),
            Self::Service(name) => format!("{prefix}:service:{name}"),
        }
    }

    /// Reverse lookup of an endpoint name; `None` for foreign or malformed names.
    pub fn from_endpoint(prefix: &str, endpoint: &str) -> Option<Self> {
        let rest = endpoint.strip_prefix(prefix)?.strip_prefix(':')?;
        if let Some(id) = rest.strip_prefix("cluster:") {
            return id.parse().ok().map(Self::Cluster);
        }
        rest.strip_prefix("service:")
            .filter(|name| !name.is_empty())
            .map(|name| Self::Service(name.to_string()))
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster(id) => write!(f, "cluster {id}"),
            Self::Service(name) => write!(f, "service {name}"),
        }
    }
}

pub fn master_endpoint(prefix: &str) -> String {
    format!("{prefix}:master")
}

pub fn cluster_filter(prefix: &str) -> String {
    format!("{prefix}:cluster:")
}

pub fn service_filter(prefix: &str) -> String {
    format!("{prefix}:service:")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Channel,
    Guild,
}

impl EntityKind {
    pub fn opcode(self) -> OpCode {
        match self {
            Self::User => OpCode::FetchUser,
            Self::Channel => OpCode::FetchChannel,
            Self::Guild => OpCode::FetchGuild,
        }
    }
}

/// READY payload: clusters report `id`, services report `name`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadyRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ReadyRequest {
    pub fn for_identity(identity: &WorkerIdentity) -> Self {
        match identity {
            WorkerIdentity::Cluster(id) => Self {
                id: Some(*id),
                name: None,
            },
            WorkerIdentity::Service(name) => Self {
                id: None,
                name: Some(name.clone()),
            },
        }
    }

    pub fn identity(&self) -> Option<WorkerIdentity> {
        match (self.id, &self.name) {
            (Some(id), _) => Some(WorkerIdentity::Cluster(id)),
            (None, Some(name)) => Some(WorkerIdentity::Service(name.clone())),
            (None, None) => None,
        }
    }
}

/// Invocation of a registered diagnostic by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg: Option<String>,
}

impl EvalRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arg: None,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.arg = Some(arg.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEvalRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(flatten)]
    pub eval: EvalRequest,
}

/// Segregated outcome of a broadcast: successes and failures, never mixed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BroadcastResults {
    pub results: Vec<Value>,
    pub errors: Vec<ErrorPayload>,
}

impl BroadcastResults {
    pub fn gather(replies: impl IntoIterator<Item = IpcResult>) -> Self {
        let mut gathered = Self::default();
        for reply in replies {
            match reply.into_outcome() {
                Ok(d) => gathered.results.push(d),
                Err(e) => gathered.errors.push(e),
            }
        }
        gathered
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReply {
    pub found: bool,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetReply {
    pub replaced: bool,
}

/// A single id or a batch of ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FetchQuery {
    One(String),
    Many(Vec<String>),
}

impl FetchQuery {
    pub fn is_batch(&self) -> bool {
        matches!(self, Self::Many(_))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        let ids: &[String] = match self {
            Self::One(id) => std::slice::from_ref(id),
            Self::Many(ids) => ids,
        };
        ids.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub query: FetchQuery,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<u32>,
}

impl FetchRequest {
    /// Users may be looked up by free-form query; channels and guilds only by numeric id.
    pub fn validate(&self, kind: EntityKind) -> Result<(), ErrorPayload> {
        for id in self.query.ids() {
            let valid = match kind {
                EntityKind::User => !id.trim().is_empty(),
                EntityKind::Channel | EntityKind::Guild => {
                    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
                }
            };
            if !valid {
                return Err(ErrorPayload::validation(format!(
                    "{kind:?} query must be a non-empty id, got {id:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Merged outcome of a fetch.
///
/// `result` is the entity (single query) or the list of entities (batch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchReply {
    pub found: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub errors: Vec<ErrorPayload>,
}

impl FetchReply {
    pub fn single(result: Option<Value>) -> Self {
        Self {
            found: result.is_some(),
            result: result.unwrap_or(Value::Null),
            errors: Vec::new(),
        }
    }

    pub fn batch(results: Vec<Value>) -> Self {
        Self {
            found: !results.is_empty(),
            result: Value::Array(results),
            errors: Vec::new(),
        }
    }
}

/// Where a cluster command goes. Exactly one selector by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCommandRecipient {
    Cluster(u32),
    Guild(u64),
    All,
}

/// Wire form of CLUSTER_COMMAND; selectors are validated on receipt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCommandRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<u32>,
    #[serde(
        default,
        deserialize_with = "snowflake_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub guild_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<bool>,
    #[serde(rename = "d", default)]
    pub data: Value,
}

impl ClusterCommandRequest {
    pub fn new(recipient: &ClusterCommandRecipient, data: Value) -> Self {
        let mut request = Self {
            data,
            ..Self::default()
        };
        match recipient {
            ClusterCommandRecipient::Cluster(id) => request.cluster_id = Some(*id),
            ClusterCommandRecipient::Guild(id) => request.guild_id = Some(*id),
            ClusterCommandRecipient::All => request.all = Some(true),
        }
        request
    }

    pub fn recipient(&self) -> Result<ClusterCommandRecipient, ErrorPayload> {
        let all = self.all.unwrap_or(false);
        match (self.cluster_id, self.guild_id, all) {
            (Some(id), None, false) => Ok(ClusterCommandRecipient::Cluster(id)),
            (None, Some(guild), false) => Ok(ClusterCommandRecipient::Guild(guild)),
            (None, None, true) => Ok(ClusterCommandRecipient::All),
            _ => Err(ErrorPayload::validation(
                "exactly one of clusterId, guildId or all must be set",
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCommandRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(rename = "d", default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShutdownRequest {
    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownReply {
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembersCachedRequest {
    pub cluster_id: u32,
}

/// Shard lifecycle notification relayed from a cluster's gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardNotice {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Ids travel as strings (they overflow JS numbers) but plain integers are accepted.
fn snowflake_opt<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Number(u64),
    }

    match Option::<Repr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Repr::Number(n)) => Ok(Some(n)),
        Some(Repr::Text(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid snowflake {s:?}"))),
    }
}
