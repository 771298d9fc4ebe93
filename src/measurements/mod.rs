//! Measurement Registry (C6, spec.md §4.6) plus the shared sample/summary
//! document shapes (spec.md §3) indexed by every concrete measurement.

pub mod node;
pub mod pod;
pub mod quantile;
pub mod service;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::context::JobContext;
use crate::error::IndexError;

/// Per-object Pod latency record (spec.md §3).
#[derive(Debug, Clone, Serialize, Default)]
pub struct PodSample {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub creation_ts: Option<i64>,
    pub scheduled_ts: Option<i64>,
    pub initialized_ts: Option<i64>,
    pub containers_ready_ts: Option<i64>,
    pub ready_ts: Option<i64>,
    pub custom_ready_ts: Option<i64>,
    pub node_name: Option<String>,
    pub job_name: String,
    pub uuid: String,
    pub metadata: HashMap<String, String>,
}

/// Per-object Node latency record (spec.md §3).
#[derive(Debug, Clone, Serialize, Default)]
pub struct NodeSample {
    pub name: String,
    pub creation_ts: Option<i64>,
    pub ready_ts: Option<i64>,
    pub uuid: String,
}

/// Per-object Service latency record (spec.md §3).
#[derive(Debug, Clone, Serialize, Default)]
pub struct ServiceSample {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub creation_ts: Option<i64>,
    pub ip_assigned_latency_ns: Option<i64>,
    pub ready_latency_ns: Option<i64>,
    pub service_type: String,
    pub uuid: String,
}

/// Quantile summary document (spec.md §3), emitted once per stage at job stop.
#[derive(Debug, Clone, Serialize)]
pub struct QuantileSummary {
    pub quantile_name: String,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
    pub avg: f64,
    pub min: f64,
    pub count: usize,
    pub uuid: String,
    pub job_name: String,
    pub metadata: HashMap<String, String>,
    pub timestamp_ms: i64,
}

/// The capability set every measurement implements (spec.md §4.6 / §9).
#[async_trait]
pub trait Measurement: Send + Sync {
    fn name(&self) -> &'static str;

    /// Apply measurement-specific configuration parsed from the config file.
    fn set_config(&mut self, _config: &serde_json::Value) {}

    /// Begin watching for this job; spawns background tasks internally.
    async fn start(&mut self, ctx: &JobContext, job_name: &str);

    /// Stop watching, compute summaries, and hand documents to the indexer.
    /// Returns the indexed document count for diagnostics.
    async fn stop(&mut self, ctx: &JobContext) -> Result<usize, IndexError>;

    /// Optional post-hoc scan for measurements that don't rely purely on
    /// watch events (e.g. node readiness across the whole cluster).
    async fn collect(&mut self, _ctx: &JobContext) {}
}

/// Which measurement kinds a job requested, matching spec.md §6's
/// `global.measurements` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementKind {
    PodLatency,
    NodeLatency,
    ServiceLatency,
}

impl MeasurementKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "podLatency" => Some(Self::PodLatency),
            "nodeLatency" => Some(Self::NodeLatency),
            "svcLatency" => Some(Self::ServiceLatency),
            _ => None,
        }
    }
}

/// An immutable dispatch table of requested measurements, built once at
/// process init (spec.md §9: "explicit registration step ... before any job
/// runs", replacing the source's module-load-time mutable registry).
pub struct MeasurementRegistry {
    active: Vec<Box<dyn Measurement>>,
}

impl MeasurementRegistry {
    /// Build the registry from the configured measurement names. Unknown
    /// names are logged and skipped rather than failing the whole run.
    pub fn build(requested: &[String]) -> Self {
        let mut active: Vec<Box<dyn Measurement>> = Vec::new();
        for name in requested {
            match MeasurementKind::from_name(name) {
                Some(MeasurementKind::PodLatency) => active.push(Box::new(pod::PodLatencyMeasurement::new())),
                Some(MeasurementKind::NodeLatency) => active.push(Box::new(node::NodeLatencyMeasurement::new())),
                Some(MeasurementKind::ServiceLatency) => {
                    active.push(Box::new(service::ServiceLatencyMeasurement::new()))
                }
                None => warn!(measurement = %name, "unknown measurement name, skipping"),
            }
        }
        Self { active }
    }

    pub async fn start_all(&mut self, ctx: &JobContext, job_name: &str) {
        for m in &mut self.active {
            info!(measurement = m.name(), job = job_name, "starting measurement");
            m.start(ctx, job_name).await;
        }
    }

    pub async fn collect_all(&mut self, ctx: &JobContext) {
        for m in &mut self.active {
            m.collect(ctx).await;
        }
    }

    /// Stop every measurement, returning the total indexed document count.
    /// Indexer failures are logged, never fatal (spec.md §4.12).
    pub async fn stop_all(&mut self, ctx: &JobContext) -> usize {
        let mut total = 0;
        for m in &mut self.active {
            match m.stop(ctx).await {
                Ok(n) => total += n,
                Err(e) => warn!(measurement = m.name(), error = %e, "indexing failed"),
            }
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

pub fn now_ms() -> i64 {
    // JobContext callers stamp wall-clock time only at document-emission
    // boundaries, never inside template rendering (spec.md §8 purity rule).
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub type SharedIndexer = Arc<dyn crate::indexer::Indexer>;
