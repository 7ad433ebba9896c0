//! Seams to the gateway client driven by each cluster.
//!
//! The fleet never speaks the gateway protocol itself. Clusters hand it a
//! [`Gateway`] for entity lookups and report shard lifecycle through
//! [`GatewayEvent`]s; the master asks a [`ShardHint`] how many shards to run.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::bridge::protocol::{EntityKind, ErrorPayload, IpcMessage, OpCode, ShardNotice};

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Entity cache owned by a cluster's gateway connection.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Already-serializable entity for `id`, if this cluster holds it.
    async fn entity(&self, kind: EntityKind, id: &str) -> Option<Value>;

    /// Gateway-specific numbers merged into this cluster's stats.
    fn stats(&self) -> Value {
        Value::Null
    }
}

/// Shard lifecycle notifications a cluster relays to the master.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    ShardConnected(u32),
    ShardReady(u32),
    ShardResumed(u32),
    ShardDisconnected {
        shard_id: u32,
        error: Option<ErrorPayload>,
    },
    Error {
        shard_id: Option<u32>,
        error: ErrorPayload,
    },
}

impl GatewayEvent {
    pub fn opcode(&self) -> OpCode {
        match self {
            Self::ShardConnected(_) => OpCode::ShardConnected,
            Self::ShardReady(_) => OpCode::ShardReady,
            Self::ShardResumed(_) => OpCode::ShardResumed,
            Self::ShardDisconnected { .. } => OpCode::ShardDisconnected,
            Self::Error { .. } => OpCode::Error,
        }
    }

    pub fn into_message(self, cluster_id: u32) -> IpcMessage {
        let op = self.opcode();
        let (shard_id, error) = match self {
            Self::ShardConnected(id) | Self::ShardReady(id) | Self::ShardResumed(id) => {
                (Some(id), None)
            }
            Self::ShardDisconnected { shard_id, error } => (Some(shard_id), error),
            Self::Error { shard_id, error } => (shard_id, Some(error)),
        };
        let notice = ShardNotice {
            id: cluster_id,
            shard_id,
            error,
        };
        IpcMessage::new(op, serde_json::to_value(notice).unwrap_or(Value::Null))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShardHintError {
    #[error("no gateway token configured")]
    MissingToken,

    #[error("shard hint request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("shard hint request returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("gateway recommended {0} shards")]
    Invalid(u32),
}

/// Source of the recommended shard count.
#[async_trait]
pub trait ShardHint: Send + Sync {
    async fn recommended_shards(&self, token: &str) -> Result<u32, ShardHintError>;
}

#[derive(Debug, Deserialize)]
struct GatewayBot {
    shards: u32,
}

/// Asks the gateway's HTTP API (`GET /gateway/bot`).
#[derive(Debug, Clone)]
pub struct HttpShardHint {
    base_url: String,
    client: reqwest::Client,
}

impl HttpShardHint {
    pub fn new() -> Result<Self, ShardHintError> {
        Self::with_base_url(DEFAULT_API_BASE)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ShardHintError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sharder/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl ShardHint for HttpShardHint {
    async fn recommended_shards(&self, token: &str) -> Result<u32, ShardHintError> {
        let token = token.trim();
        let token = token.strip_prefix("Bot ").unwrap_or(token);
        if token.is_empty() {
            return Err(ShardHintError::MissingToken);
        }

        let url = format!("{}/gateway/bot", self.base_url);
        tracing::debug!(url = %url, "Fetching recommended shard count");
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, format!("Bot {token}"))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ShardHintError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bot: GatewayBot = response.json().await?;
        if bot.shards == 0 {
            return Err(ShardHintError::Invalid(0));
        }
        tracing::info!(shards = bot.shards, "Gateway recommended shard count");
        Ok(bot.shards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn reads_recommended_shards() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gateway/bot"))
            .and(header("authorization", "Bot secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": "wss://gateway.discord.gg",
                "shards": 9,
                "session_start_limit": {"remaining": 1000}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let hint = HttpShardHint::with_base_url(server.uri()).unwrap();
        assert_eq!(hint.recommended_shards("Bot secret").await.unwrap(), 9);
    }

    #[tokio::test]
    async fn surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gateway/bot"))
            .respond_with(ResponseTemplate::new(401).set_body_string("401: Unauthorized"))
            .mount(&server)
            .await;

        let hint = HttpShardHint::with_base_url(server.uri()).unwrap();
        match hint.recommended_shards("nope").await.unwrap_err() {
            ShardHintError::Status { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "401: Unauthorized");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_token_is_rejected_locally() {
        let hint = HttpShardHint::with_base_url("http://127.0.0.1:9").unwrap();
        assert!(matches!(
            hint.recommended_shards("  ").await,
            Err(ShardHintError::MissingToken)
        ));
    }

    #[test]
    fn lifecycle_events_become_messages() {
        let msg = GatewayEvent::ShardDisconnected {
            shard_id: 4,
            error: Some(ErrorPayload::new("CloseEvent", "4000")),
        }
        .into_message(1);
        assert_eq!(msg.op, OpCode::ShardDisconnected);
        assert_eq!(
            msg.d,
            json!({"id": 1, "shardId": 4, "error": {"name": "CloseEvent", "message": "4000"}})
        );

        let msg = GatewayEvent::ShardReady(2).into_message(0);
        assert_eq!(msg.op, OpCode::ShardReady);
        assert_eq!(msg.d, json!({"id": 0, "shardId": 2}));
    }
}
