//! API Gateway (C2, spec.md §4.2). A thin typed wrapper over the
//! control-plane REST surface operating on arbitrary rendered manifests via
//! `kube::core::DynamicObject`, since a job's object specs reference
//! manifests of any Kind. Grounded in the teacher's `Api`/`Client` usage in
//! `k8s/client.rs` and `k8s/resources.rs`, generalized from fixed typed
//! resources (`Pod`, `Service`, ...) to discovery-resolved dynamic ones.

use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::{GroupVersionKind, ObjectMeta};
use kube::discovery;
use kube::{Api, Client, ResourceExt};
use serde_json::Value;
use tracing::warn;

use crate::error::ApiError;

/// Resolved reference to a created/patched object, enough to target later
/// patch/delete/watch calls.
#[derive(Debug, Clone)]
pub struct ObjectRef {
    pub kind: String,
    pub api_version: String,
    pub namespace: Option<String>,
    pub name: String,
}

pub struct ApiGateway {
    client: Client,
    max_wait: Duration,
}

impl ApiGateway {
    pub fn new(client: Client, max_wait: Duration) -> Self {
        Self { client, max_wait }
    }

    async fn dynamic_api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>, ApiError> {
        let gvk = parse_gvk(api_version, kind).map_err(ApiError::Permanent)?;
        let (ar, _caps) = discovery::pinned_kind(&self.client, &gvk).await.map_err(ApiError::from)?;
        Ok(match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        })
    }

    /// Create one rendered manifest. `AlreadyExists` (409) is surfaced
    /// distinctly so callers can downgrade it to a warning for `runOnce`
    /// objects (spec.md §4.2).
    pub async fn create(&self, manifest: Value) -> Result<ObjectRef, ApiError> {
        let obj: DynamicObject = serde_json::from_value(manifest).map_err(|e| ApiError::Permanent(e.to_string()))?;
        let kind = obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
        let api_version = obj.types.as_ref().map(|t| t.api_version.clone()).unwrap_or_default();
        let namespace = obj.metadata.namespace.clone();
        let name = obj.name_any();

        let api = self.dynamic_api(&api_version, &kind, namespace.as_deref()).await?;
        let result = retry_transient(self.max_wait, || {
            let api = api.clone();
            let obj = obj.clone();
            async move { api.create(&PostParams::default(), &obj).await }
        })
        .await;

        match result {
            Ok(created) => Ok(ObjectRef { kind, api_version, namespace, name: created.name_any() }),
            Err(e) if is_conflict(&e) => Err(ApiError::AlreadyExists(name)),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch one object by reference (spec.md §4.4's `read` job type).
    pub async fn get(&self, reference: &ObjectRef) -> Result<DynamicObject, ApiError> {
        let api = self.dynamic_api(&reference.api_version, &reference.kind, reference.namespace.as_deref()).await?;
        retry_transient(self.max_wait, || {
            let api = api.clone();
            let name = reference.name.clone();
            async move { api.get(&name).await }
        })
        .await
        .map_err(|e| if is_not_found(&e) { ApiError::NotFound(reference.name.clone()) } else { e.into() })
    }

    pub async fn patch(&self, reference: &ObjectRef, merge: Value) -> Result<(), ApiError> {
        let api = self.dynamic_api(&reference.api_version, &reference.kind, reference.namespace.as_deref()).await?;
        retry_transient(self.max_wait, || {
            let api = api.clone();
            let name = reference.name.clone();
            let merge = merge.clone();
            async move { api.patch(&name, &PatchParams::default(), &Patch::Merge(&merge)).await }
        })
        .await
        .map(|_| ())
        .map_err(|e| if is_not_found(&e) { ApiError::NotFound(reference.name.clone()) } else { e.into() })
    }

    pub async fn delete(&self, reference: &ObjectRef, grace_period_secs: Option<i64>) -> Result<(), ApiError> {
        let api = self.dynamic_api(&reference.api_version, &reference.kind, reference.namespace.as_deref()).await?;
        let mut params = DeleteParams::default();
        params.grace_period_seconds = grace_period_secs.map(|s| s as u32);
        retry_transient(self.max_wait, || {
            let api = api.clone();
            let name = reference.name.clone();
            let params = params.clone();
            async move { api.delete(&name, &params).await }
        })
        .await
        .map(|_| ())
        .map_err(|e| if is_not_found(&e) { ApiError::NotFound(reference.name.clone()) } else { e.into() })
    }

    pub async fn list(&self, api_version: &str, kind: &str, label_selector: &str, namespace: Option<&str>) -> Result<Vec<DynamicObject>, ApiError> {
        let api = self.dynamic_api(api_version, kind, namespace).await?;
        let params = kube::api::ListParams::default().labels(label_selector);
        let list = retry_transient(self.max_wait, || {
            let api = api.clone();
            let params = params.clone();
            async move { api.list(&params).await }
        })
        .await?;
        Ok(list.items)
    }

    pub async fn create_namespace(&self, name: &str, labels: &std::collections::HashMap<String, String>) -> Result<(), ApiError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta { name: Some(name.to_string()), labels: Some(labels.clone()), ..Default::default() },
            ..Default::default()
        };
        let result = retry_transient(self.max_wait, || {
            let api = api.clone();
            let ns = ns.clone();
            async move { api.create(&PostParams::default(), &ns).await }
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => {
                warn!(namespace = name, "namespace already exists, continuing");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_namespace(&self, name: &str, wait: bool) -> Result<(), ApiError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let result = retry_transient(self.max_wait, || {
            let api = api.clone();
            let params = DeleteParams::default();
            async move { api.delete(name, &params).await }
        })
        .await;

        match result {
            Ok(_) if wait => {
                let cond = kube::runtime::wait::conditions::is_deleted("");
                let _ = kube::runtime::wait::await_condition(api, name, cond).await;
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_gvk(api_version: &str, kind: &str) -> Result<GroupVersionKind, String> {
    match api_version.split_once('/') {
        Some((group, version)) => Ok(GroupVersionKind::gvk(group, version, kind)),
        None => Ok(GroupVersionKind::gvk("", api_version, kind)),
    }
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 409)
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

fn is_transient(e: &kube::Error) -> bool {
    if matches!(e, kube::Error::Api(resp) if resp.code == 429 || resp.code >= 500) {
        return true;
    }
    if matches!(e, kube::Error::Api(_)) {
        return false;
    }
    // Everything else at this layer is a transport/connection failure (hyper
    // timeout, connect refused, TLS drop). kube::Error's transport variant
    // differs across hyper/tokio versions, so classify by message rather
    // than a specific variant.
    let msg = e.to_string().to_lowercase();
    msg.contains("timed out") || msg.contains("timeout") || msg.contains("connection refused") || msg.contains("connection reset")
}

/// Exponential backoff bounded by `max_wait`, per spec.md §4.2: transient
/// errors (429, 5xx, timeout) are retried; everything else surfaces
/// immediately.
async fn retry_transient<F, Fut, T>(max_wait: Duration, mut op: F) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, kube::Error>>,
{
    let deadline = tokio::time::Instant::now() + max_wait;
    let mut backoff = Duration::from_millis(100);

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) && tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(10));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_gvk_splits_group_and_version() {
        let gvk = parse_gvk("apps/v1", "Deployment").unwrap();
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Deployment");
    }

    #[test]
    fn parse_gvk_core_group_has_no_slash() {
        let gvk = parse_gvk("v1", "Pod").unwrap();
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
    }
}
