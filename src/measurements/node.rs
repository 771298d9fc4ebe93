//! Node Latency Measurement (C7b, spec.md §4.8). Cluster-wide node watch,
//! filtered to nodes created at or after measurement start, timestamping the
//! first `Ready=True` transition. Grounded in the teacher's `node_status`
//! condition walk in `k8s/resources.rs`, generalized the same way
//! `pod.rs` generalizes `pod_status`.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::chrono::{DateTime, Utc};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource, ResourceExt};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{now_ms, Measurement, NodeSample, QuantileSummary};
use crate::context::JobContext;
use crate::error::IndexError;

fn millis(t: &DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn ready_ts(node: &Node) -> Option<i64> {
    node.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Ready" && c.status == "True")
        .and_then(|c| c.last_transition_time.as_ref())
        .map(|t| millis(&t.0))
}

struct Inner {
    samples: RwLock<HashMap<String, NodeSample>>,
    job_name: String,
    run_id: String,
    started_at_ms: i64,
}

pub struct NodeLatencyMeasurement {
    inner: Option<Arc<Inner>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl NodeLatencyMeasurement {
    pub fn new() -> Self {
        Self { inner: None, cancel: CancellationToken::new(), task: None }
    }
}

impl Default for NodeLatencyMeasurement {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Measurement for NodeLatencyMeasurement {
    fn name(&self) -> &'static str {
        "nodeLatency"
    }

    async fn start(&mut self, ctx: &JobContext, job_name: &str) {
        let inner = Arc::new(Inner {
            samples: RwLock::new(HashMap::new()),
            job_name: job_name.to_string(),
            run_id: ctx.run.label_value(),
            started_at_ms: now_ms(),
        });
        self.inner = Some(inner.clone());

        let client = ctx.client.clone();
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = watch_nodes(client, inner, cancel).await {
                warn!(error = %e, "node latency watcher exited with error");
            }
        }));
    }

    async fn stop(&mut self, ctx: &JobContext) -> Result<usize, IndexError> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        let Some(inner) = self.inner.take() else { return Ok(0) };
        let samples = inner.samples.read().await;
        let docs: Vec<serde_json::Value> = samples.values().map(|s| serde_json::to_value(s).unwrap()).collect();

        let latencies: Vec<i64> = samples
            .values()
            .filter_map(|s| match (s.creation_ts, s.ready_ts) {
                (Some(c), Some(r)) => Some((r - c).max(0) * 1_000_000),
                _ => None,
            })
            .collect();
        let q = super::quantile::summarize(&latencies);
        let summary = QuantileSummary {
            quantile_name: "ready".to_string(),
            p50: q.p50,
            p95: q.p95,
            p99: q.p99,
            max: q.max,
            avg: q.avg,
            min: q.min,
            count: q.count,
            uuid: inner.run_id.clone(),
            job_name: inner.job_name.clone(),
            metadata: HashMap::new(),
            timestamp_ms: now_ms(),
        };

        let mut indexed = docs.len();
        ctx.indexer.index(&docs, "nodeLatencyMeasurement").await?;
        ctx.indexer.index(&[serde_json::to_value(&summary).unwrap()], "nodeLatencyQuantiles").await?;
        indexed += 1;
        Ok(indexed)
    }
}

async fn watch_nodes(client: kube::Client, inner: Arc<Inner>, cancel: CancellationToken) -> anyhow::Result<()> {
    let api: Api<Node> = Api::all(client);
    let config = watcher::Config::default();
    let mut stream = pin!(watcher(api, config).default_backoff());

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = stream.next() => {
                let Some(event) = event else { break };
                match event {
                    Ok(watcher::Event::InitApply(node) | watcher::Event::Apply(node)) => {
                        record(&inner, &node).await;
                    }
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                    Ok(watcher::Event::Delete(_)) => {}
                    Err(e) => warn!(error = %e, "node watch error, resync pending"),
                }
            }
        }
    }

    Ok(())
}

async fn record(inner: &Inner, node: &Node) {
    let Some(uid) = node.meta().uid.clone() else { return };
    let creation = node.meta().creation_timestamp.as_ref().map(|t| millis(&t.0));

    // Nodes created before this measurement started belong to a previous run.
    if let Some(c) = creation {
        if c < inner.started_at_ms {
            return;
        }
    }

    let mut samples = inner.samples.write().await;
    let sample = samples.entry(uid.clone()).or_insert_with(|| NodeSample {
        name: node.name_any(),
        uuid: inner.run_id.clone(),
        ..Default::default()
    });

    if sample.creation_ts.is_none() {
        sample.creation_ts = creation;
    }
    if sample.ready_ts.is_none() {
        sample.ready_ts = ready_ts(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    #[test]
    fn ready_ts_finds_true_transition() {
        let node = Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    last_transition_time: Some(Time(DateTime::from_timestamp_millis(5000).unwrap())),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(ready_ts(&node), Some(5000));
    }

    #[test]
    fn ready_ts_none_when_not_ready() {
        let node = Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "False".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(ready_ts(&node), None);
    }
}
