//! Process resource usage and the fleet-wide statistics snapshot.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::protocol::WorkerIdentity;

static PROCESS_START: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Pin the uptime origin. Called once early in every process.
pub fn mark_process_start() {
    LazyLock::force(&PROCESS_START);
}

/// Resource usage of one process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStats {
    pub pid: u32,
    pub max_rss_kb: u64,
    pub user_cpu_micros: u64,
    pub system_cpu_micros: u64,
    pub uptime_secs: u64,
    /// Role-specific additions, e.g. gateway stats for clusters.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

impl ProcessStats {
    /// Usage of the calling process.
    pub fn collect() -> Self {
        let mut stats = Self {
            pid: std::process::id(),
            uptime_secs: PROCESS_START.elapsed().as_secs(),
            ..Self::default()
        };
        stats.fill_rusage();
        stats
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }

    #[cfg(unix)]
    fn fill_rusage(&mut self) {
        use nix::sys::resource::{UsageWho, getrusage};

        match getrusage(UsageWho::RUSAGE_SELF) {
            Ok(usage) => {
                let micros = |tv: nix::sys::time::TimeVal| {
                    (tv.tv_sec().max(0) as u64) * 1_000_000 + tv.tv_usec().max(0) as u64
                };
                self.user_cpu_micros = micros(usage.user_time());
                self.system_cpu_micros = micros(usage.system_time());
                // Linux reports kilobytes, macOS bytes.
                let rss = usage.max_rss().max(0) as u64;
                self.max_rss_kb = if cfg!(target_os = "macos") { rss / 1024 } else { rss };
            }
            Err(e) => tracing::debug!(error = %e, "getrusage failed"),
        }
    }

    #[cfg(not(unix))]
    fn fill_rusage(&mut self) {}
}

/// Who a stats reply came from: clusters report a number, services a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatsSource {
    Cluster(u32),
    Service(String),
}

impl From<&WorkerIdentity> for StatsSource {
    fn from(identity: &WorkerIdentity) -> Self {
        match identity {
            WorkerIdentity::Cluster(id) => Self::Cluster(*id),
            WorkerIdentity::Service(name) => Self::Service(name.clone()),
        }
    }
}

/// GET_STATS reply payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReport {
    pub source: StatsSource,
    pub stats: ProcessStats,
}

/// Fleet statistics, rebuilt wholesale every collection cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub clusters: BTreeMap<u32, ProcessStats>,
    pub services: BTreeMap<String, ProcessStats>,
    pub manager: ProcessStats,
    pub collected_at: Option<DateTime<Utc>>,
}

impl StatsSnapshot {
    /// Bucket replies by source. Later duplicates win.
    pub fn from_reports(reports: impl IntoIterator<Item = StatsReport>) -> Self {
        let mut snapshot = Self::default();
        for report in reports {
            match report.source {
                StatsSource::Cluster(id) => {
                    snapshot.clusters.insert(id, report.stats);
                }
                StatsSource::Service(name) => {
                    snapshot.services.insert(name, report.stats);
                }
            }
        }
        snapshot.manager = ProcessStats::collect();
        snapshot.collected_at = Some(Utc::now());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collects_own_usage() {
        let stats = ProcessStats::collect();
        assert_eq!(stats.pid, std::process::id());
        assert!(stats.extra.is_null());
    }

    #[test]
    fn source_is_untagged() {
        let cluster: StatsSource = serde_json::from_value(json!(3)).unwrap();
        let service: StatsSource = serde_json::from_value(json!("api")).unwrap();
        assert_eq!(cluster, StatsSource::Cluster(3));
        assert_eq!(service, StatsSource::Service("api".into()));
    }

    #[test]
    fn report_wire_format() {
        let report = StatsReport {
            source: StatsSource::Cluster(1),
            stats: ProcessStats {
                pid: 4242,
                max_rss_kb: 51200,
                user_cpu_micros: 1500,
                system_cpu_micros: 300,
                uptime_secs: 12,
                extra: Value::Null,
            },
        };
        insta::assert_json_snapshot!(report, @r#"
        {
          "source": 1,
          "stats": {
            "pid": 4242,
            "maxRssKb": 51200,
            "userCpuMicros": 1500,
            "systemCpuMicros": 300,
            "uptimeSecs": 12
          }
        }
        "#);
    }

    #[test]
    fn snapshot_buckets_by_source() {
        let report = |source, pid| StatsReport {
            source,
            stats: ProcessStats {
                pid,
                ..ProcessStats::default()
            },
        };
        let snapshot = StatsSnapshot::from_reports([
            report(StatsSource::Cluster(0), 10),
            report(StatsSource::Service("api".into()), 20),
            report(StatsSource::Cluster(1), 11),
        ]);
        assert_eq!(snapshot.clusters.len(), 2);
        assert_eq!(snapshot.clusters[&1].pid, 11);
        assert_eq!(snapshot.services["api"].pid, 20);
        assert!(snapshot.collected_at.is_some());
    }
}
