//! Job Runner (C9, spec.md §4.11): the state machine driving one job through
//! `Init → PreLoadImages? → CreateNamespaces → SubmitObjects →
//! (podWait per iter)? → WaitAll? → VerifyObjects? → Churn? → Cleanup? → Done`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::churn;
use super::{Job, JobSummary, JobType, ObjectSpec};
use crate::context::JobContext;
use crate::error::{ApiError, JobError, RenderError, WaitTimeoutError};
use crate::k8s::gateway::ApiGateway;
use crate::k8s::watcher::{EventKind, Watcher};
use crate::measurements::MeasurementRegistry;
use crate::ratelimit::RateLimiter;
use crate::template::{MissingKeyPolicy, RenderContext};
use crate::workerpool::WorkerPool;

fn now_ms() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

struct WorkItem {
    iteration: u32,
    object_index: usize,
    replica_index: u32,
    namespace: String,
}

pub struct JobRunner {
    job: Job,
    ctx: JobContext,
    gateway: Arc<ApiGateway>,
    measurements: MeasurementRegistry,
}

impl JobRunner {
    /// `measurement_names` is `global.measurements` from the config file
    /// (spec.md §6); the registry is built once here per spec.md §9's
    /// "explicit registration step" rather than a module-load-time global.
    pub fn new(job: Job, ctx: JobContext, measurement_names: &[String]) -> Self {
        let gateway = Arc::new(ApiGateway::new(ctx.client.clone(), Duration::from_secs(job.max_wait_timeout_secs)));
        let measurements = MeasurementRegistry::build(measurement_names);
        Self { job, ctx, gateway, measurements }
    }

    pub async fn run(mut self) -> JobSummary {
        let start_ts_ms = now_ms();
        let cancel = CancellationToken::new();
        let mut errors: Vec<String> = Vec::new();
        let requests_sent = Arc::new(std::sync::atomic::AtomicU64::new(0));

        if self.job.pre_load_images {
            if let Err(e) = self.pre_load_images().await {
                errors.push(format!("preLoadImages: {e}"));
            }
        }

        for ns in self.job.namespaces() {
            if let Err(e) = self.gateway.create_namespace(&ns, &self.job.namespace_labels).await {
                errors.push(format!("createNamespace {ns}: {e}"));
            }
        }

        self.measurements.start_all(&self.ctx, &self.job.name).await;

        let submit_errors = self.submit_objects(&cancel, requests_sent.clone()).await;
        errors.extend(submit_errors);

        if self.job.wait_when_finished {
            if let Err(e) = self.wait_all().await {
                errors.push(e.to_string());
            }
        }

        if self.job.verify_objects {
            let verify_errors = self.verify_objects().await;
            if !verify_errors.is_empty() {
                if self.job.error_on_verify {
                    errors.extend(verify_errors);
                } else {
                    for e in verify_errors {
                        warn!(job = %self.job.name, "{e}");
                    }
                }
            }
        }

        self.measurements.collect_all(&self.ctx).await;
        let indexed_documents = self.measurements.stop_all(&self.ctx).await;

        if self.job.churn.enabled {
            let job = self.job.clone();
            let gateway = self.gateway.clone();
            let ctx = self.ctx.clone();
            let resubmit: Box<
                dyn Fn(u32) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>>
                    + Send
                    + Sync,
            > = Box::new(move |iteration: u32| {
                let job = job.clone();
                let gateway = gateway.clone();
                let ctx = ctx.clone();
                Box::pin(async move { resubmit_iteration(&job, &gateway, &ctx, iteration).await })
            });
            let run_id = self.ctx.run.label_value();
            let churn_errors =
                churn::run_churn_cycles(&self.job, &self.job.churn, &self.gateway, &run_id, &resubmit).await;
            errors.extend(churn_errors);
        }

        if self.job.cleanup {
            for ns in self.job.namespaces() {
                if let Err(e) = self.gateway.delete_namespace(&ns, false).await {
                    errors.push(format!("cleanup {ns}: {e}"));
                }
            }
        }

        let end_ts_ms = now_ms();
        let elapsed_secs = ((end_ts_ms - start_ts_ms).max(1) as f64) / 1000.0;
        let sent = requests_sent.load(std::sync::atomic::Ordering::Relaxed);

        JobSummary {
            job_name: self.job.name.clone(),
            start_ts_ms,
            end_ts_ms,
            elapsed_secs,
            observed_qps: sent as f64 / elapsed_secs,
            requests_sent: sent,
            passed: errors.is_empty(),
            execution_errors: errors,
            indexed_documents,
        }
    }

    async fn pre_load_images(&self) -> Result<(), JobError> {
        let mut images: Vec<String> = Vec::new();
        let namespace = self.job.namespace_for_iteration(1);
        for spec in &self.job.objects {
            let rendered =
                render_object(spec, &self.job, 1, 0, &namespace, &self.ctx.run.label_value(), &self.ctx.cli_vars)?;
            collect_images(&rendered, &mut images);
        }
        images.sort();
        images.dedup();

        for (i, image) in images.iter().enumerate() {
            let manifest = serde_json::json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": format!("preload-{}-{}", self.ctx.run.label_value(), i),
                    "namespace": self.job.namespace_for_iteration(1),
                    "labels": {"runid": self.ctx.run.label_value(), "job": self.job.name},
                },
                "spec": {
                    "containers": [{"name": "preload", "image": image}],
                    "restartPolicy": "Never",
                }
            });
            if let Err(e) = self.gateway.create(manifest).await {
                warn!(image, error = %e, "pre-load pod creation failed");
            }
        }

        tokio::time::sleep(Duration::from_secs(self.job.pre_load_period_secs)).await;

        for (i, _) in images.iter().enumerate() {
            let reference = crate::k8s::gateway::ObjectRef {
                kind: "Pod".to_string(),
                api_version: "v1".to_string(),
                namespace: Some(self.job.namespace_for_iteration(1)),
                name: format!("preload-{}-{}", self.ctx.run.label_value(), i),
            };
            let _ = self.gateway.delete(&reference, None).await;
        }

        Ok(())
    }

    async fn submit_objects(&self, cancel: &CancellationToken, requests_sent: Arc<std::sync::atomic::AtomicU64>) -> Vec<String> {
        let limiter = Arc::new(RateLimiter::new(self.job.qps, self.job.burst));
        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let job = Arc::new(self.job.clone());
        let ctx = self.ctx.clone();
        let gateway = self.gateway.clone();
        let run_id = self.ctx.run.label_value();

        let worker_count = (self.job.qps as usize).clamp(1, 256);
        let pool_errors = errors.clone();
        let cli_vars = ctx.cli_vars.clone();
        let pool = WorkerPool::spawn(worker_count, worker_count * 4, cancel.clone(), {
            let limiter = limiter.clone();
            let job = job.clone();
            let gateway = gateway.clone();
            let requests_sent = requests_sent.clone();
            let run_id = run_id.clone();
            let cli_vars = cli_vars.clone();
            move |item: WorkItem| {
                let limiter = limiter.clone();
                let job = job.clone();
                let gateway = gateway.clone();
                let requests_sent = requests_sent.clone();
                let run_id = run_id.clone();
                let cli_vars = cli_vars.clone();
                let errors = pool_errors.clone();
                async move {
                    if limiter.acquire().await.is_err() {
                        return Err("rate limiter cancelled".to_string());
                    }
                    let spec = &job.objects[item.object_index];
                    let rendered = match render_object(
                        spec,
                        &job,
                        item.iteration,
                        item.replica_index,
                        &item.namespace,
                        &run_id,
                        &cli_vars,
                    ) {
                        Ok(r) => r,
                        Err(e) => {
                            errors.lock().await.push(e.to_string());
                            return Err(e.to_string());
                        }
                    };

                    let target = object_ref_from_manifest(&rendered);
                    let result: Result<Option<crate::k8s::gateway::ObjectRef>, ApiError> = match job.job_type {
                        JobType::Create | JobType::Kubevirt => gateway.create(rendered).await.map(Some),
                        JobType::Patch => match &target {
                            Some(r) => gateway.patch(r, rendered).await.map(|()| None),
                            None => Err(ApiError::Permanent("patch target is missing kind/apiVersion/metadata.name".to_string())),
                        },
                        JobType::Delete => match &target {
                            Some(r) => gateway.delete(r, None).await.map(|()| None),
                            None => Err(ApiError::Permanent("delete target is missing kind/apiVersion/metadata.name".to_string())),
                        },
                        JobType::Read => match &target {
                            Some(r) => gateway.get(r).await.map(|_| None),
                            None => Err(ApiError::Permanent("read target is missing kind/apiVersion/metadata.name".to_string())),
                        },
                    };

                    match result {
                        Ok(created) => {
                            requests_sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            if job.pod_wait {
                                if let Some(reference) = created {
                                    let timeout = Duration::from_secs(job.max_wait_timeout_secs);
                                    if let Err(e) = wait_for_object_ready(&gateway, &reference, timeout).await {
                                        errors.lock().await.push(e.to_string());
                                        return Err(e.to_string());
                                    }
                                }
                            }
                            Ok(())
                        }
                        Err(ApiError::AlreadyExists(name)) => {
                            warn!(name, "object already exists, tolerated for runOnce/replay");
                            requests_sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            Ok(())
                        }
                        Err(e) => {
                            errors.lock().await.push(e.to_string());
                            Err(e.to_string())
                        }
                    }
                }
            }
        });

        for iteration in 1..=self.job.iterations {
            let namespace = self.job.namespace_for_iteration(iteration);
            for (object_index, spec) in self.job.objects.iter().enumerate() {
                if spec.run_once && iteration != 1 {
                    continue;
                }
                for replica_index in 0..spec.replicas {
                    let item = WorkItem {
                        iteration,
                        object_index,
                        replica_index,
                        namespace: spec.namespace.clone().unwrap_or_else(|| namespace.clone()),
                    };
                    if pool.submit(item).await.is_err() {
                        break;
                    }
                }
            }
            if iteration < self.job.iterations && self.job.job_iteration_delay_secs > 0 {
                tokio::time::sleep(Duration::from_secs(self.job.job_iteration_delay_secs)).await;
            }
        }

        pool.drain().await;
        Arc::try_unwrap(errors).map(Mutex::into_inner).unwrap_or_default()
    }

    /// WaitAll: block until every namespace's waitable objects satisfy
    /// readiness, or `maxWaitTimeout` elapses (fatal per spec.md §4.11).
    async fn wait_all(&self) -> Result<(), WaitTimeoutError> {
        let start = tokio::time::Instant::now();
        let timeout = Duration::from_secs(self.job.max_wait_timeout_secs);
        let run_id = self.ctx.run.label_value();

        let ready_count = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let ready_count_cb = ready_count.clone();
        let mut watcher = Watcher::new();
        let callback: crate::k8s::watcher::EventCallback = Arc::new(move |obj, kind| {
            if kind == EventKind::Apply && is_ready(obj) {
                ready_count_cb.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        });

        watcher
            .start(self.ctx.client.clone(), "v1", "Pod", format!("runid={run_id}"), None, callback)
            .await
            .map_err(|e| WaitTimeoutError {
                elapsed_secs: 0,
                limit_secs: self.job.max_wait_timeout_secs,
                context: format!("failed to start readiness watcher: {e}"),
            })?;

        loop {
            if start.elapsed() >= timeout {
                watcher.stop().await;
                return Err(WaitTimeoutError {
                    elapsed_secs: start.elapsed().as_secs(),
                    limit_secs: self.job.max_wait_timeout_secs,
                    context: format!("job '{}' objects did not become ready", self.job.name),
                });
            }
            if watcher.len().await >= self.job.expected_requests() as usize {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        watcher.stop().await;
        Ok(())
    }

    async fn verify_objects(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let run_id = self.ctx.run.label_value();
        for ns in self.job.namespaces() {
            match self.gateway.list("v1", "Pod", &format!("runid={run_id}"), Some(&ns)).await {
                Ok(items) => {
                    let expected = self.job.expected_requests() / self.job.namespaces().len().max(1) as u64;
                    if (items.len() as u64) < expected {
                        errors.push(format!("namespace {ns}: expected >= {expected} objects, observed {}", items.len()));
                    }
                }
                Err(e) => errors.push(format!("verify namespace {ns}: {e}")),
            }
        }
        errors
    }
}

async fn resubmit_iteration(job: &Job, gateway: &ApiGateway, ctx: &JobContext, iteration: u32) -> Result<(), String> {
    let run_id = ctx.run.label_value();
    let namespace = job.namespace_for_iteration(iteration);
    for spec in &job.objects {
        if spec.run_once && iteration != 1 {
            continue;
        }
        for replica_index in 0..spec.replicas {
            let rendered = render_object(spec, job, iteration, replica_index, &namespace, &run_id, &ctx.cli_vars)
                .map_err(|e| e.to_string())?;
            gateway.create(rendered).await.map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

fn render_object(
    spec: &ObjectSpec,
    job: &Job,
    iteration: u32,
    replica: u32,
    namespace: &str,
    run_id: &str,
    cli_vars: &std::collections::HashMap<String, String>,
) -> Result<serde_json::Value, RenderError> {
    let raw = std::fs::read_to_string(Path::new(&spec.template))
        .map_err(|source| RenderError::Read { path: spec.template.clone(), source })?;

    let mut ctx = RenderContext::new().with_env();
    ctx.set("Iteration", iteration.to_string());
    ctx.set("Replica", replica.to_string());
    ctx.set("JobName", job.name.clone());
    ctx.extend(cli_vars);
    ctx.extend(&spec.input_vars);

    let rendered = crate::template::render(&raw, &ctx, MissingKeyPolicy::Error)?;
    let mut value: serde_json::Value = serde_yaml::from_str(&rendered)?;

    if let Some(metadata) = value.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        metadata.entry("namespace").or_insert_with(|| namespace.clone().into());
        let labels = metadata.entry("labels").or_insert_with(|| serde_json::json!({}));
        if let Some(labels) = labels.as_object_mut() {
            labels.insert("runid".to_string(), run_id.into());
            labels.insert("job".to_string(), job.name.clone().into());
        }
    }

    Ok(value)
}

fn collect_images(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(image)) = map.get("image") {
                out.push(image.clone());
            }
            for v in map.values() {
                collect_images(v, out);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items {
                collect_images(v, out);
            }
        }
        _ => {}
    }
}

/// Build a reference to the object a rendered manifest describes, for
/// targeting a later patch/delete/read/podWait call (spec.md §4.4).
fn object_ref_from_manifest(value: &serde_json::Value) -> Option<crate::k8s::gateway::ObjectRef> {
    let kind = value.get("kind")?.as_str()?.to_string();
    let api_version = value.get("apiVersion")?.as_str()?.to_string();
    let metadata = value.get("metadata")?;
    let name = metadata.get("name")?.as_str()?.to_string();
    let namespace = metadata.get("namespace").and_then(|n| n.as_str()).map(str::to_string);
    Some(crate::k8s::gateway::ObjectRef { kind, api_version, namespace, name })
}

/// Per-item `podWait` (spec.md §4.4): block until `reference` reports
/// `Ready=True`, or `timeout` elapses. Distinct from the job-level
/// `wait_all`, which waits for every submitted object at once.
async fn wait_for_object_ready(
    gateway: &ApiGateway,
    reference: &crate::k8s::gateway::ObjectRef,
    timeout: Duration,
) -> Result<(), WaitTimeoutError> {
    let start = tokio::time::Instant::now();
    loop {
        match gateway.get(reference).await {
            Ok(obj) if is_ready(&obj) => return Ok(()),
            Ok(_) | Err(ApiError::NotFound(_)) => {}
            Err(e) => {
                return Err(WaitTimeoutError {
                    elapsed_secs: start.elapsed().as_secs(),
                    limit_secs: timeout.as_secs(),
                    context: format!("object {} readiness check failed: {e}", reference.name),
                });
            }
        }

        if start.elapsed() >= timeout {
            return Err(WaitTimeoutError {
                elapsed_secs: start.elapsed().as_secs(),
                limit_secs: timeout.as_secs(),
                context: format!("object {} did not become ready", reference.name),
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn is_ready(obj: &kube::core::DynamicObject) -> bool {
    obj.data
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_images_finds_nested_image_fields() {
        let manifest = serde_json::json!({
            "spec": {"containers": [{"name": "a", "image": "nginx:1"}, {"name": "b", "image": "redis:7"}]}
        });
        let mut images = Vec::new();
        collect_images(&manifest, &mut images);
        images.sort();
        assert_eq!(images, vec!["nginx:1".to_string(), "redis:7".to_string()]);
    }

    #[test]
    fn is_ready_detects_true_ready_condition() {
        let obj: kube::core::DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p"},
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        }))
        .unwrap();
        assert!(is_ready(&obj));
    }

    #[test]
    fn is_ready_false_when_no_status() {
        let obj: kube::core::DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p"}
        }))
        .unwrap();
        assert!(!is_ready(&obj));
    }
}
