//! Pod Latency Measurement (C7a, spec.md §4.7).
//!
//! Watches `pods` filtered by `runid`, timestamping the first transition of
//! each status condition to `True`. Grounded in the teacher's
//! `watch_resources`/`pod_status` condition-walking code
//! (`k8s/resources.rs`), generalized from "display string" to "stage
//! timestamp" extraction.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::chrono::{DateTime, Utc};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource, ResourceExt};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{now_ms, Measurement, PodSample, QuantileSummary};
use crate::context::JobContext;
use crate::error::IndexError;
use crate::job::WaitOptions;

fn millis(t: &DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Find the first-`True` transition timestamp of a named pod condition.
fn condition_ts(pod: &Pod, condition_type: &str) -> Option<i64> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == condition_type && c.status == "True")
        .and_then(|c| c.last_transition_time.as_ref())
        .map(|t| millis(&t.0))
}

/// Evaluate a dotted field path with an optional trailing `[key=value]`
/// bracket filter on the last segment (spec.md §9 decided grammar), against
/// the pod's JSON representation.
fn eval_field_path(pod: &Pod, path: &str) -> Option<serde_json::Value> {
    let value = serde_json::to_value(pod).ok()?;
    let mut current = &value;
    for segment in path.split('.') {
        if let Some(open) = segment.find('[') {
            let (field, filter) = segment.split_at(open);
            let filter = filter.trim_start_matches('[').trim_end_matches(']');
            let (key, expected) = filter.split_once('=')?;
            current = current.get(field)?;
            let array = current.as_array()?;
            current = array.iter().find(|item| item.get(key).and_then(|v| v.as_str()) == Some(expected))?;
        } else {
            current = current.get(segment)?;
        }
    }
    Some(current.clone())
}

fn custom_ready_ts(pod: &Pod, opts: &WaitOptions) -> Option<i64> {
    let value = eval_field_path(pod, &opts.field_path)?;
    let matches = value.as_str().map(|s| s == opts.expected_value).unwrap_or(false);
    if matches {
        Some(now_ms())
    } else {
        None
    }
}

struct Inner {
    samples: RwLock<HashMap<String, PodSample>>,
    job_name: String,
    run_id: String,
    wait_options: Option<WaitOptions>,
}

pub struct PodLatencyMeasurement {
    inner: Option<Arc<Inner>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    pending_wait_options: Option<WaitOptions>,
}

impl PodLatencyMeasurement {
    pub fn new() -> Self {
        Self { inner: None, cancel: CancellationToken::new(), task: None, pending_wait_options: None }
    }

    pub fn with_wait_options(mut self, opts: WaitOptions) -> Self {
        self.pending_wait_options = Some(opts);
        self
    }
}

impl Default for PodLatencyMeasurement {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Measurement for PodLatencyMeasurement {
    fn name(&self) -> &'static str {
        "podLatency"
    }

    async fn start(&mut self, ctx: &JobContext, job_name: &str) {
        let inner = Arc::new(Inner {
            samples: RwLock::new(HashMap::new()),
            job_name: job_name.to_string(),
            run_id: ctx.run.label_value(),
            wait_options: self.pending_wait_options.take(),
        });
        self.inner = Some(inner.clone());

        let client = ctx.client.clone();
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = watch_pods(client, inner, cancel).await {
                warn!(error = %e, "pod latency watcher exited with error");
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

        let mut indexed = docs.len();
        let summary = self.summarize(&samples, &inner);
        let summary_docs: Vec<serde_json::Value> = summary.iter().map(|s| serde_json::to_value(s).unwrap()).collect();
        indexed += summary_docs.len();

        ctx.indexer.index(&docs, "podLatencyMeasurement").await?;
        ctx.indexer.index(&summary_docs, "podLatencyQuantiles").await?;
        Ok(indexed)
    }
}

impl PodLatencyMeasurement {
    fn summarize(&self, samples: &HashMap<String, PodSample>, inner: &Inner) -> Vec<QuantileSummary> {
        let stages: [(&str, fn(&PodSample) -> (Option<i64>, Option<i64>)); 4] = [
            ("scheduled", |s| (s.creation_ts, s.scheduled_ts)),
            ("initialized", |s| (s.creation_ts, s.initialized_ts)),
            ("containersReady", |s| (s.creation_ts, s.containers_ready_ts)),
            ("ready", |s| (s.creation_ts, s.ready_ts)),
        ];

        stages
            .iter()
            .map(|(name, extract)| {
                let latencies: Vec<i64> = samples
                    .values()
                    .filter_map(|s| {
                        let (creation, stage) = extract(s);
                        match (creation, stage) {
                            (Some(c), Some(st)) => Some((st - c).max(0) * 1_000_000),
                            _ => None,
                        }
                    })
                    .collect();
                let q = super::quantile::summarize(&latencies);
                QuantileSummary {
                    quantile_name: name.to_string(),
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
                }
            })
            .collect()
    }
}

async fn watch_pods(client: kube::Client, inner: Arc<Inner>, cancel: CancellationToken) -> anyhow::Result<()> {
    let api: Api<Pod> = Api::all(client);
    let label_selector = format!("runid={}", inner.run_id);
    let config = watcher::Config::default().labels(&label_selector);
    let mut stream = pin!(watcher(api, config).default_backoff());

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = stream.next() => {
                let Some(event) = event else { break };
                match event {
                    Ok(watcher::Event::InitApply(pod) | watcher::Event::Apply(pod)) => {
                        record(&inner, &pod).await;
                    }
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                    Ok(watcher::Event::Delete(_)) => {}
                    Err(e) => warn!(error = %e, "pod watch error, resync pending"),
                }
            }
        }
    }

    Ok(())
}

async fn record(inner: &Inner, pod: &Pod) {
    let Some(uid) = pod.meta().uid.clone() else { return };
    let creation = pod.meta().creation_timestamp.as_ref().map(|t| millis(&t.0));

    let mut samples = inner.samples.write().await;
    // Invariant (spec.md §3.3): resync replaces the sample keyed by uid, never appends.
    let sample = samples.entry(uid.clone()).or_insert_with(|| PodSample {
        uid: uid.clone(),
        namespace: pod.namespace().unwrap_or_default(),
        name: pod.name_any(),
        job_name: inner.job_name.clone(),
        uuid: inner.run_id.clone(),
        ..Default::default()
    });

    if sample.creation_ts.is_none() {
        sample.creation_ts = creation;
    }
    // Only the first occurrence of a condition transitioning True is kept.
    if sample.scheduled_ts.is_none() {
        sample.scheduled_ts = condition_ts(pod, "PodScheduled");
    }
    if sample.initialized_ts.is_none() {
        sample.initialized_ts = condition_ts(pod, "Initialized");
    }
    if sample.containers_ready_ts.is_none() {
        sample.containers_ready_ts = condition_ts(pod, "ContainersReady");
    }
    if sample.ready_ts.is_none() {
        sample.ready_ts = condition_ts(pod, "Ready");
    }
    if sample.node_name.is_none() {
        sample.node_name = pod.spec.as_ref().and_then(|s| s.node_name.clone());
    }
    if sample.custom_ready_ts.is_none() {
        if let Some(opts) = &inner.wait_options {
            sample.custom_ready_ts = custom_ready_ts(pod, opts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn pod_with_conditions(conditions: Vec<PodCondition>) -> Pod {
        Pod {
            status: Some(PodStatus { conditions: Some(conditions), ..Default::default() }),
            ..Default::default()
        }
    }

    fn cond(t: &str, status: &str, ts_millis: i64) -> PodCondition {
        PodCondition {
            type_: t.to_string(),
            status: status.to_string(),
            last_transition_time: Some(Time(DateTime::from_timestamp_millis(ts_millis).unwrap())),
            ..Default::default()
        }
    }

    #[test]
    fn condition_ts_finds_true_transition() {
        let pod = pod_with_conditions(vec![cond("PodScheduled", "True", 1000)]);
        assert_eq!(condition_ts(&pod, "PodScheduled"), Some(1000));
    }

    #[test]
    fn condition_ts_ignores_non_true_status() {
        let pod = pod_with_conditions(vec![cond("Ready", "False", 1000)]);
        assert_eq!(condition_ts(&pod, "Ready"), None);
    }

    #[test]
    fn condition_ts_missing_status_is_none() {
        let pod = Pod::default();
        assert_eq!(condition_ts(&pod, "Ready"), None);
    }

    #[test]
    fn eval_field_path_resolves_bracket_filter() {
        let pod_json = serde_json::json!({
            "status": {
                "containerStatuses": [
                    {"name": "sidecar", "ready": false},
                    {"name": "app", "ready": true}
                ]
            }
        });
        let pod: Pod = serde_json::from_value(pod_json).unwrap();
        let value = eval_field_path(&pod, "status.containerStatuses[name=app].ready");
        assert_eq!(value, Some(serde_json::Value::Bool(true)));
    }
}
