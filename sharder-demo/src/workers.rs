//! Synthetic cluster and service workers.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use sharder::bridge::protocol::ErrorPayload;
use sharder::{
    ClusterContext, ClusterWorker, EntityKind, Gateway, GatewayEvent, ServiceContext,
    ServiceWorker, ShardRange, WorkerLink, shard_for_guild,
};

/// Pretends to hold every entity whose numeric id hashes onto one of its shards.
pub struct SyntheticGateway {
    shards: ShardRange,
}

impl SyntheticGateway {
    fn owns(&self, id: &str) -> bool {
        id.parse::<u64>()
            .is_ok_and(|id| self.shards.contains(shard_for_guild(id, self.shards.total)))
    }
}

#[async_trait]
impl Gateway for SyntheticGateway {
    async fn entity(&self, kind: EntityKind, id: &str) -> Option<Value> {
        if !self.owns(id) {
            return None;
        }
        Some(match kind {
            EntityKind::User => json!({ "id": id, "username": format!("user-{id}") }),
            EntityKind::Channel => json!({ "id": id, "name": format!("channel-{id}") }),
            EntityKind::Guild => json!({ "id": id, "name": format!("guild-{id}") }),
        })
    }

    fn stats(&self) -> Value {
        json!({ "shards": self.shards.len() })
    }
}

pub struct DemoCluster {
    gateway: Arc<SyntheticGateway>,
}

impl DemoCluster {
    pub fn new(shards: ShardRange) -> Self {
        Self {
            gateway: Arc::new(SyntheticGateway { shards }),
        }
    }
}

#[async_trait]
impl ClusterWorker for DemoCluster {
    async fn launch(&self, ctx: &ClusterContext) -> Result<(), ErrorPayload> {
        let shards = ctx.shards;
        ctx.diagnostics.register("shards", move |_| async move {
            Ok(json!({ "first": shards.first, "last": shards.last, "total": shards.total }))
        });

        for shard in shards.first..=shards.last {
            for event in [GatewayEvent::ShardConnected(shard), GatewayEvent::ShardReady(shard)] {
                if let Err(e) = ctx.link.report(event).await {
                    tracing::warn!(shard, error = %e, "Failed to report shard event");
                }
            }
        }

        let link = ctx.link.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Err(e) = link.members_cached().await {
                tracing::warn!(error = %e, "Failed to report member cache");
            }
        });
        Ok(())
    }

    fn gateway(&self) -> Arc<dyn Gateway> {
        self.gateway.clone()
    }

    async fn handle_command(&self, data: Value, _receptive: bool) -> Result<Value, ErrorPayload> {
        tracing::info!(data = %data, "Cluster command");
        Ok(json!({ "shards": self.gateway.shards.len(), "received": data }))
    }

    async fn all_members_cached(&self) {
        tracing::info!("Every cluster has cached its members");
    }
}

/// Counts commands in the master's shared store.
#[derive(Default)]
pub struct CounterService {
    link: OnceLock<WorkerLink>,
}

#[async_trait]
impl ServiceWorker for CounterService {
    async fn launch(&self, ctx: &ServiceContext) -> Result<(), ErrorPayload> {
        let _ = self.link.set(ctx.link.clone());
        Ok(())
    }

    async fn handle_command(&self, data: Value, _receptive: bool) -> Result<Value, ErrorPayload> {
        let link = self
            .link
            .get()
            .ok_or_else(|| ErrorPayload::new("NotLaunched", "service has not launched"))?;
        let key = format!("{}.hits", link.endpoint());
        let hits = link
            .get(&key)
            .await
            .map_err(|e| ErrorPayload::from_error(&e))?
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            + 1;
        link.set(&key, json!(hits))
            .await
            .map_err(|e| ErrorPayload::from_error(&e))?;
        Ok(json!({ "hits": hits, "received": data }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gateway_holds_only_its_shards() {
        let gateway = SyntheticGateway {
            shards: ShardRange {
                first: 2,
                last: 3,
                total: 4,
            },
        };
        assert!(gateway.entity(EntityKind::Guild, "360620343729061908").await.is_some());
        assert!(gateway.entity(EntityKind::Guild, "0").await.is_none());
        assert!(gateway.entity(EntityKind::User, "not-a-number").await.is_none());
        assert_eq!(gateway.stats(), json!({ "shards": 2 }));
    }
}
