//! Per-kind readiness polling after a create or update.

use std::time::Instant;

use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};
use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinitionCondition, CustomResourceDefinitionSpec,
};
use keel_core::{ClusterClient, Error, Gvk, Resource, Result};
use metrics::histogram;
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::retry::{poll_until, Probe, RetryPolicy};

const STATUS_TRUE: &str = "True";

/// Kinds with a readiness notion. Everything else is ready once written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessKind {
    CustomResourceDefinition,
    Deployment,
    Job,
    Other,
}

impl ReadinessKind {
    pub fn of(gvk: &Gvk) -> Self {
        match (gvk.group.as_str(), gvk.kind.as_str()) {
            ("apiextensions.k8s.io", "CustomResourceDefinition") => Self::CustomResourceDefinition,
            ("apps" | "extensions", "Deployment") => Self::Deployment,
            ("batch", "Job") => Self::Job,
            _ => Self::Other,
        }
    }
}

trait Condition {
    fn type_field(&self) -> &str;
    fn status_field(&self) -> &str;
}

impl Condition for CustomResourceDefinitionCondition {
    fn type_field(&self) -> &str { &self.type_ }
    fn status_field(&self) -> &str { &self.status }
}

impl Condition for JobCondition {
    fn type_field(&self) -> &str { &self.type_ }
    fn status_field(&self) -> &str { &self.status }
}

impl Condition for DeploymentCondition {
    fn type_field(&self) -> &str { &self.type_ }
    fn status_field(&self) -> &str { &self.status }
}

fn has_condition<C: Condition>(conditions: &[C], condition_type: &str) -> bool {
    conditions.iter().any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
}

/// Typed view of a sub-document; absent or null reads as the default.
fn decode<T: DeserializeOwned + Default>(res: &Resource, path: &[&str]) -> Result<T> {
    match res.get_path(path) {
        None | Some(Json::Null) => Ok(T::default()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            Error::Other(anyhow::Error::new(e).context(format!("decoding {} of {}", path.join("."), res.key())))
        }),
    }
}

/// Group, served version and plural of the endpoint a CRD registers.
pub(crate) fn crd_endpoint(crd: &Resource) -> Result<(String, String, String)> {
    let spec: CustomResourceDefinitionSpec = decode(crd, &["spec"])?;
    let version = spec.versions.iter().find(|v| v.served).or_else(|| spec.versions.first()).map(|v| v.name.clone());
    Ok((spec.group, version.unwrap_or_default(), spec.names.plural))
}

/// Scope declared by `crd` if it defines `gvk`.
pub(crate) fn crd_scope_for(crd: &Resource, gvk: &Gvk) -> Option<bool> {
    if ReadinessKind::of(&crd.gvk()) != ReadinessKind::CustomResourceDefinition {
        return None;
    }
    let spec: CustomResourceDefinitionSpec = decode(crd, &["spec"]).ok()?;
    let defines = spec.group == gvk.group && spec.names.kind == gvk.kind && spec.versions.iter().any(|v| v.name == gvk.version);
    defines.then(|| spec.scope == "Namespaced")
}

async fn probe(kind: ReadinessKind, client: &dyn ClusterClient, live: &Resource) -> Result<Probe> {
    let key = live.key();
    match kind {
        ReadinessKind::CustomResourceDefinition => {
            let conditions: Vec<CustomResourceDefinitionCondition> = decode(live, &["status", "conditions"])?;
            if !has_condition(&conditions, "Established") {
                return Ok(Probe::Pending(format!("crd {} exists but is not yet established", key.name)));
            }
            // established can be reported before the endpoint serves
            let (group, version, plural) = crd_endpoint(live)?;
            match client.list_endpoint(&group, &version, &plural).await {
                Ok(()) => Ok(Probe::Ready),
                Err(e) => Ok(Probe::Pending(format!("crd {} endpoint not servable: {}", key.name, e.report()))),
            }
        }
        ReadinessKind::Deployment => {
            if live.get_path(&["spec", "replicas"]).and_then(Json::as_i64) == Some(0) {
                return Ok(Probe::Ready);
            }
            let status: DeploymentStatus = decode(live, &["status"])?;
            if status.ready_replicas.unwrap_or(0) >= 1 {
                return Ok(Probe::Ready);
            }
            let condition = status
                .conditions
                .as_ref()
                .and_then(|c| c.first())
                .map(|c| format!(" with condition {}={}: {}", c.type_field(), c.status_field(), c.message.as_deref().unwrap_or("")))
                .unwrap_or_default();
            Ok(Probe::Pending(format!("no ready replicas for {}{}", key, condition)))
        }
        ReadinessKind::Job => {
            let status: JobStatus = decode(live, &["status"])?;
            let complete = status.conditions.as_deref().map(|c| has_condition(c, "Complete")).unwrap_or(false);
            if status.completion_time.is_some() && complete {
                Ok(Probe::Ready)
            } else {
                Ok(Probe::Pending(format!("no successful runs of {}", key)))
            }
        }
        ReadinessKind::Other => Ok(Probe::Ready),
    }
}

/// Wait until `res` is ready by its kind's definition. A ready CRD refreshes the
/// client's type mapping so instances of the new kind become addressable.
pub async fn wait_ready(client: &dyn ClusterClient, res: &Resource, policy: &RetryPolicy, cancel: &CancellationToken) -> Result<()> {
    let kind = ReadinessKind::of(&res.gvk());
    if kind == ReadinessKind::Other {
        return Ok(());
    }
    let key = res.key();
    let key_ref = &key;
    let started = Instant::now();
    poll_until(policy, cancel, &key.to_string(), move || async move {
        let live = client.get(key_ref).await?;
        probe(kind, client, &live).await
    })
    .await?;
    if cancel.is_cancelled() {
        debug!(key = %key, "readiness wait abandoned");
        return Ok(());
    }
    if kind == ReadinessKind::CustomResourceDefinition {
        client.discover().await?;
    }
    let ms = started.elapsed().as_secs_f64() * 1000.0;
    histogram!("keel_readiness_wait_ms", ms);
    info!(key = %key, kind = ?kind, elapsed_ms = ms as u64, "resource ready");
    Ok(())
}
