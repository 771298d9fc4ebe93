//! Service Latency Measurement (C7c, spec.md §4.9).
//!
//! Correlates `services` and `endpoints` watches keyed by namespace/name,
//! then TCP-probes each declared port by exec'ing into an in-cluster probe
//! pod (grounded in the teacher's `Api::exec` usage pattern is absent from
//! kubefuzz, so the exec protocol here follows the standard kube-rs
//! attach/exec idiom used throughout the ecosystem's controller examples).
//!
//! Five-step protocol per spec.md §4.9 and the SPEC_FULL.md decision on
//! LoadBalancer ingress address selection:
//!   1. record service creation time
//!   2. if `type: LoadBalancer`, wait for an ingress address (`ingress.ip`
//!      preferred, falling back to `ingress.hostname`)
//!   3. wait for at least one ready endpoint address
//!   4. TCP-probe each port via exec into the probe pod
//!   5. compute `readyLatency` and emit the sample

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use k8s_openapi::chrono::{DateTime, Utc};
use kube::api::AttachParams;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource, ResourceExt};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{now_ms, Measurement, QuantileSummary, ServiceSample};
use crate::context::JobContext;
use crate::error::{IndexError, ProbeError};

fn millis(t: &DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Prefer `ingress.ip`, falling back to `ingress.hostname` (spec.md §9
/// decision; the source swapped these two branches).
fn ingress_address(svc: &Service) -> Option<String> {
    let ingress = svc.status.as_ref()?.load_balancer.as_ref()?.ingress.as_ref()?;
    ingress.iter().find_map(|i| i.ip.clone().or_else(|| i.hostname.clone()))
}

fn is_load_balancer(svc: &Service) -> bool {
    svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("LoadBalancer")
}

fn service_ports(svc: &Service) -> Vec<i32> {
    svc.spec.as_ref().map(|s| s.ports.iter().flatten().map(|p| p.port).collect()).unwrap_or_default()
}

fn endpoint_addresses(ep: &Endpoints) -> Vec<String> {
    ep.subsets
        .as_ref()
        .map(|subsets| {
            subsets.iter().flat_map(|s| s.addresses.iter().flatten()).map(|a| a.ip.clone()).collect()
        })
        .unwrap_or_default()
}

#[derive(Default, Clone)]
struct ServiceState {
    namespace: String,
    name: String,
    creation_ts: Option<i64>,
    ip_assigned_ts: Option<i64>,
    endpoints_ready_ts: Option<i64>,
    probed_ts: Option<i64>,
    service_type: String,
    ports: Vec<i32>,
    node_ports: Vec<i32>,
    cluster_ips: Vec<String>,
    headless: bool,
    load_balancer: bool,
    ingress_addr: Option<String>,
}

struct Inner {
    state: RwLock<HashMap<String, ServiceState>>,
    job_name: String,
    run_id: String,
    probe_pod: Option<(String, String)>,
    svc_timeout_secs: u64,
}

pub struct ServiceLatencyMeasurement {
    inner: Option<Arc<Inner>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    probe_pod: Option<(String, String)>,
    svc_timeout_secs: u64,
}

impl ServiceLatencyMeasurement {
    pub fn new() -> Self {
        Self { inner: None, cancel: CancellationToken::new(), task: None, probe_pod: None, svc_timeout_secs: 30 }
    }
}

impl Default for ServiceLatencyMeasurement {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Measurement for ServiceLatencyMeasurement {
    fn name(&self) -> &'static str {
        "svcLatency"
    }

    fn set_config(&mut self, config: &serde_json::Value) {
        if let (Some(ns), Some(name)) = (
            config.get("probePodNamespace").and_then(|v| v.as_str()),
            config.get("probePodName").and_then(|v| v.as_str()),
        ) {
            self.probe_pod = Some((ns.to_string(), name.to_string()));
        }
        if let Some(timeout) = config.get("svcTimeout").and_then(|v| v.as_u64()) {
            self.svc_timeout_secs = timeout;
        }
    }

    async fn start(&mut self, ctx: &JobContext, job_name: &str) {
        let inner = Arc::new(Inner {
            state: RwLock::new(HashMap::new()),
            job_name: job_name.to_string(),
            run_id: ctx.run.label_value(),
            probe_pod: self.probe_pod.clone(),
            svc_timeout_secs: self.svc_timeout_secs,
        });
        self.inner = Some(inner.clone());

        let client = ctx.client.clone();
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = watch_and_probe(client, inner, cancel).await {
                warn!(error = %e, "service latency watcher exited with error");
            }
        }));
    }

    async fn stop(&mut self, ctx: &JobContext) -> Result<usize, IndexError> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        let Some(inner) = self.inner.take() else { return Ok(0) };
        let state = inner.state.read().await;

        let docs: Vec<serde_json::Value> = state
            .values()
            .map(|s| {
                let sample = ServiceSample {
                    uid: format!("{}/{}", s.namespace, s.name),
                    namespace: s.namespace.clone(),
                    name: s.name.clone(),
                    creation_ts: s.creation_ts,
                    ip_assigned_latency_ns: match (s.creation_ts, s.ip_assigned_ts) {
                        (Some(c), Some(i)) => Some((i - c).max(0) * 1_000_000),
                        _ => None,
                    },
                    ready_latency_ns: match (s.creation_ts, s.probed_ts) {
                        (Some(c), Some(p)) => Some((p - c).max(0) * 1_000_000),
                        _ => None,
                    },
                    service_type: s.service_type.clone(),
                    uuid: inner.run_id.clone(),
                };
                serde_json::to_value(sample).unwrap()
            })
            .collect();

        let latencies: Vec<i64> = state
            .values()
            .filter_map(|s| match (s.creation_ts, s.probed_ts) {
                (Some(c), Some(p)) => Some((p - c).max(0) * 1_000_000),
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
        ctx.indexer.index(&docs, "svcLatencyMeasurement").await?;
        ctx.indexer.index(&[serde_json::to_value(&summary).unwrap()], "svcLatencyQuantiles").await?;
        indexed += 1;
        Ok(indexed)
    }
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

async fn watch_and_probe(client: kube::Client, inner: Arc<Inner>, cancel: CancellationToken) -> anyhow::Result<()> {
    let label_selector = format!("runid={}", inner.run_id);
    let svc_api: Api<Service> = Api::all(client.clone());
    let ep_api: Api<Endpoints> = Api::all(client.clone());
    let mut svc_stream = pin!(watcher(svc_api, watcher::Config::default().labels(&label_selector)).default_backoff());
    let mut ep_stream = pin!(watcher(ep_api, watcher::Config::default()).default_backoff());

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = svc_stream.next() => {
                let Some(event) = event else { break };
                match event {
                    Ok(watcher::Event::InitApply(svc) | watcher::Event::Apply(svc)) => {
                        record_service(&inner, &svc).await;
                        maybe_probe(&client, &inner, &svc.namespace().unwrap_or_default(), &svc.name_any()).await;
                    }
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                    Ok(watcher::Event::Delete(_)) => {}
                    Err(e) => warn!(error = %e, "service watch error, resync pending"),
                }
            }
            event = ep_stream.next() => {
                let Some(event) = event else { break };
                match event {
                    Ok(watcher::Event::InitApply(ep) | watcher::Event::Apply(ep)) => {
                        let ns = ep.namespace().unwrap_or_default();
                        let name = ep.name_any();
                        record_endpoints(&inner, &ep).await;
                        maybe_probe(&client, &inner, &ns, &name).await;
                    }
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                    Ok(watcher::Event::Delete(_)) => {}
                    Err(e) => warn!(error = %e, "endpoints watch error, resync pending"),
                }
            }
        }
    }

    Ok(())
}

async fn record_service(inner: &Inner, svc: &Service) {
    let namespace = svc.namespace().unwrap_or_default();
    let name = svc.name_any();
    let creation = svc.meta().creation_timestamp.as_ref().map(|t| millis(&t.0));

    let mut state = inner.state.write().await;
    let entry = state.entry(key(&namespace, &name)).or_insert_with(|| ServiceState {
        namespace: namespace.clone(),
        name: name.clone(),
        ..Default::default()
    });

    if entry.creation_ts.is_none() {
        entry.creation_ts = creation;
    }
    entry.service_type = svc.spec.as_ref().and_then(|s| s.type_.clone()).unwrap_or_else(|| "ClusterIP".to_string());
    entry.load_balancer = is_load_balancer(svc);
    entry.ports = service_ports(svc);
    entry.node_ports = svc.spec.as_ref().map(|s| s.ports.iter().flatten().filter_map(|p| p.node_port).collect()).unwrap_or_default();
    entry.headless = svc.spec.as_ref().and_then(|s| s.cluster_ip.as_deref()) == Some("None");
    entry.cluster_ips = svc
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ips.clone())
        .unwrap_or_else(|| svc.spec.as_ref().and_then(|s| s.cluster_ip.clone()).into_iter().collect());

    if entry.load_balancer && entry.ingress_addr.is_none() {
        if let Some(addr) = ingress_address(svc) {
            entry.ingress_addr = Some(addr);
            entry.ip_assigned_ts = Some(now_ms());
        }
    }
}

async fn record_endpoints(inner: &Inner, ep: &Endpoints) {
    let namespace = ep.namespace().unwrap_or_default();
    let name = ep.name_any();

    let mut state = inner.state.write().await;
    let entry = state.entry(key(&namespace, &name)).or_insert_with(|| ServiceState {
        namespace: namespace.clone(),
        name: name.clone(),
        ..Default::default()
    });

    if entry.endpoints_ready_ts.is_none() && !endpoint_addresses(ep).is_empty() {
        entry.endpoints_ready_ts = Some(now_ms());
    }
}

/// Resolve the TCP probe target for service types that need no API call:
/// `ClusterIP` probes the service's cluster IP directly, `LoadBalancer`
/// probes the ingress address recorded by `record_service`.
fn static_probe_target(s: &ServiceState) -> Option<(String, Vec<i32>)> {
    match s.service_type.as_str() {
        "LoadBalancer" => Some((s.ingress_addr.clone()?, s.ports.clone())),
        "NodePort" => None,
        _ => Some((s.cluster_ips.first()?.clone(), s.ports.clone())),
    }
}

/// Resolve the TCP probe target per service type (spec.md §4.9 step 4).
/// `NodePort` probes the probe pod's own node (`hostIP`) on the node port,
/// which requires fetching the probe pod's status. Headless services
/// (`clusterIP: None`) have no resolvable target and are skipped by the
/// caller before this is reached.
async fn resolve_probe_target(client: &kube::Client, probe_ns: &str, probe_name: &str, s: &ServiceState) -> Option<(String, Vec<i32>)> {
    if s.service_type != "NodePort" {
        return static_probe_target(s);
    }
    let pods: Api<Pod> = Api::namespaced(client.clone(), probe_ns);
    let pod = pods.get(probe_name).await.ok()?;
    let host_ip = pod.status?.host_ip?;
    Some((host_ip, s.node_ports.clone()))
}

/// Probe a service once both ingress (if applicable) and endpoints are
/// ready, and it hasn't already been probed. Headless services are never
/// probed (spec.md §4.9: silently skipped, not probed-and-failed).
async fn maybe_probe(client: &kube::Client, inner: &Inner, namespace: &str, name: &str) {
    let Some((probe_ns, probe_name)) = inner.probe_pod.clone() else { return };

    let snapshot = {
        let state = inner.state.read().await;
        match state.get(&key(namespace, name)) {
            Some(s) if s.headless || s.probed_ts.is_some() => None,
            Some(s) if s.load_balancer && s.ip_assigned_ts.is_none() => None,
            Some(s) if s.endpoints_ready_ts.is_some() && !s.ports.is_empty() => Some(s.clone()),
            _ => None,
        }
    };
    let Some(snapshot) = snapshot else { return };

    let Some((target, ports)) = resolve_probe_target(client, &probe_ns, &probe_name, &snapshot).await else { return };
    if ports.is_empty() {
        return;
    }

    let pods: Api<Pod> = Api::namespaced(client.clone(), &probe_ns);
    let timeout = Duration::from_secs(inner.svc_timeout_secs);
    let mut all_ok = true;
    for port in &ports {
        if let Err(e) = probe_port_with_retry(&pods, &probe_name, &target, *port, timeout).await {
            warn!(error = %e, namespace, name, port, "tcp probe failed");
            all_ok = false;
        }
    }

    if all_ok {
        let mut state = inner.state.write().await;
        if let Some(s) = state.get_mut(&key(namespace, name)) {
            if s.probed_ts.is_none() {
                s.probed_ts = Some(now_ms());
            }
        }
    }
}

/// Retry `probe_port` every 50ms until it succeeds or `timeout` elapses
/// (spec.md §4.9 step 4).
async fn probe_port_with_retry(pods: &Api<Pod>, probe_pod: &str, target: &str, port: i32, timeout: Duration) -> Result<(), ProbeError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match probe_port(pods, probe_pod, target, port).await {
            Ok(()) => return Ok(()),
            Err(e) if tokio::time::Instant::now() >= deadline => return Err(e),
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}

/// Exec `nc -z -w2 <target> <port>` inside the probe pod and check for a
/// zero exit status on stdout (the probe pod's entrypoint echoes the
/// command's exit code as its only line of output).
async fn probe_port(pods: &Api<Pod>, probe_pod: &str, target: &str, port: i32) -> Result<(), ProbeError> {
    let command = vec!["sh".to_string(), "-c".to_string(), format!("nc -z -w2 {target} {port}; echo $?")];
    let params = AttachParams::default().stdout(true).stderr(false);

    let mut attached = pods
        .exec(probe_pod, command, &params)
        .await
        .map_err(|e| ProbeError::Exec(e.to_string()))?;

    let mut stdout = attached.stdout().ok_or_else(|| ProbeError::Exec("no stdout stream".to_string()))?;
    let mut output = String::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stdout.read_to_string(&mut output)).await;
    let _ = attached.join().await;

    match read {
        Ok(Ok(_)) if output.trim() == "0" => Ok(()),
        Ok(Ok(_)) => Err(ProbeError::Exec(format!("non-zero exit: {}", output.trim()))),
        Ok(Err(e)) => Err(ProbeError::Exec(e.to_string())),
        Err(_) => Err(ProbeError::Timeout(Duration::from_secs(5))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};

    fn lb_service(ingress: Vec<LoadBalancerIngress>) -> Service {
        Service {
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus { ingress: Some(ingress) }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn ingress_address_prefers_ip_over_hostname() {
        let svc = lb_service(vec![LoadBalancerIngress {
            ip: Some("10.0.0.5".to_string()),
            hostname: Some("lb.example.com".to_string()),
            ..Default::default()
        }]);
        assert_eq!(ingress_address(&svc), Some("10.0.0.5".to_string()));
    }

    #[test]
    fn ingress_address_falls_back_to_hostname() {
        let svc = lb_service(vec![LoadBalancerIngress {
            ip: None,
            hostname: Some("lb.example.com".to_string()),
            ..Default::default()
        }]);
        assert_eq!(ingress_address(&svc), Some("lb.example.com".to_string()));
    }

    #[test]
    fn ingress_address_none_when_not_assigned() {
        let svc = lb_service(vec![]);
        assert_eq!(ingress_address(&svc), None);
    }

    #[test]
    fn static_probe_target_cluster_ip_uses_first_address() {
        let state = ServiceState {
            service_type: "ClusterIP".to_string(),
            cluster_ips: vec!["10.0.0.9".to_string()],
            ports: vec![80],
            ..Default::default()
        };
        assert_eq!(static_probe_target(&state), Some(("10.0.0.9".to_string(), vec![80])));
    }

    #[test]
    fn static_probe_target_load_balancer_uses_ingress_address() {
        let state = ServiceState {
            service_type: "LoadBalancer".to_string(),
            ingress_addr: Some("lb.example.com".to_string()),
            ports: vec![443],
            ..Default::default()
        };
        assert_eq!(static_probe_target(&state), Some(("lb.example.com".to_string(), vec![443])));
    }

    #[test]
    fn static_probe_target_node_port_defers_to_async_resolution() {
        let state = ServiceState { service_type: "NodePort".to_string(), ..Default::default() };
        assert_eq!(static_probe_target(&state), None);
    }

    #[test]
    fn endpoint_addresses_collects_all_subsets() {
        use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset};
        let ep = Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress { ip: "10.0.0.1".to_string(), ..Default::default() }]),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert_eq!(endpoint_addresses(&ep), vec!["10.0.0.1".to_string()]);
    }
}
