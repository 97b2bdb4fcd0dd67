//! The reconcile cycle: sync the ownership cache, classify desired resources against
//! it, then delete, create and update kind group by kind group.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::{stream, TryStreamExt};
use keel_apply::{apply_patch, build_patch, compute_equality, diff, diff_summary, last_applied_all, LAST_APPLIED_ANNOTATION};
use keel_core::{label_selector, ClusterClient, Error, Labels, ObjectId, Resource, ResourceSet, Result, TypeMap};
use keel_store::OwnershipCache;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callbacks::{CallbackPipeline, InstallCallback};
use crate::options::InstallerOptions;
use crate::policy::create_with_policy;
use crate::readiness::{crd_scope_for, wait_ready};
use crate::retry::retry_transient;

/// Input of one reconcile call.
#[derive(Debug, Clone, Default)]
pub struct ReconcileParams {
    pub install_namespace: String,
    pub resources: ResourceSet,
    pub owner_labels: Labels,
    /// Keep namespaces written in the manifests instead of forcing `install_namespace`.
    pub respect_manifest_namespaces: bool,
}

impl ReconcileParams {
    pub fn new(install_namespace: impl Into<String>, resources: ResourceSet, owner_labels: Labels, respect_manifest_namespaces: bool) -> Self {
        Self { install_namespace: install_namespace.into(), resources, owner_labels, respect_manifest_namespaces }
    }
}

/// Install, upgrade and uninstall sets of resources.
#[async_trait::async_trait]
pub trait Installer: Send + Sync {
    async fn reconcile_resources(&self, params: ReconcileParams, cancel: &CancellationToken) -> Result<()>;
    async fn purge_resources(&self, labels: &Labels, cancel: &CancellationToken) -> Result<()>;
    /// Every cached resource, whatever its owner.
    fn list_all_resources(&self) -> ResourceSet;
}

/// Distinct non-empty values of `label_key` across the installer's cache, in first-seen order.
pub fn list_all_cached_values(installer: &dyn Installer, label_key: &str) -> Vec<String> {
    let mut values: Vec<String> = Vec::new();
    for res in installer.list_all_resources() {
        if let Some(v) = res.labels().remove(label_key) {
            if !v.is_empty() && !values.contains(&v) {
                values.push(v);
            }
        }
    }
    values
}

#[derive(Debug, Default, Clone, Copy)]
struct Plan {
    create: usize,
    update: usize,
    delete: usize,
}

pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    cache: Arc<OwnershipCache>,
    callbacks: CallbackPipeline,
    opts: InstallerOptions,
}

impl Reconciler {
    pub fn new(client: Arc<dyn ClusterClient>, cache: Arc<OwnershipCache>, opts: InstallerOptions) -> Self {
        Self { client, cache, callbacks: CallbackPipeline::new(), opts }
    }

    pub fn with_callback(mut self, hook: Arc<dyn InstallCallback>) -> Self {
        self.callbacks.push(hook);
        self
    }

    pub fn cache(&self) -> &Arc<OwnershipCache> { &self.cache }
    pub fn options(&self) -> &InstallerOptions { &self.opts }

    /// Converge the cluster to `params.resources`: pre-install hooks, the delete/create/update
    /// cycle, post-install hooks.
    pub async fn reconcile(&self, params: ReconcileParams, cancel: &CancellationToken) -> Result<()> {
        self.measured(async {
            self.callbacks.pre_install().await?;
            self.reconcile_cycle(params, cancel).await?;
            self.callbacks.post_install().await
        })
        .await
    }

    /// Delete every owned resource carrying `labels`. Install hooks do not run.
    pub async fn purge(&self, labels: &Labels, cancel: &CancellationToken) -> Result<()> {
        let params = ReconcileParams::new("", ResourceSet::new(), labels.clone(), false);
        self.measured(self.reconcile_cycle(params, cancel)).await
    }

    /// Full cache contents.
    pub fn list_all(&self) -> ResourceSet { self.cache.list() }

    async fn measured(&self, fut: impl Future<Output = Result<()>>) -> Result<()> {
        let started = Instant::now();
        counter!("keel_reconcile_total", 1u64);
        let res = fut.await;
        histogram!("keel_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &res {
            counter!("keel_reconcile_errors_total", 1u64);
            warn!(error = %e.report(), "reconcile failed");
        }
        res
    }

    async fn reconcile_cycle(&self, params: ReconcileParams, cancel: &CancellationToken) -> Result<()> {
        let ReconcileParams { install_namespace, resources, owner_labels, respect_manifest_namespaces } = params;
        let client = self.client.as_ref();

        self.cache
            .sync(client, &owner_labels, |r| r.annotation(LAST_APPLIED_ANNOTATION).is_some())
            .await
            .map_err(|e| Error::op("listing resources owned by", label_selector(&owner_labels), e))?;

        // An owned object without a decodable snapshot cannot be merged; refuse the whole call.
        let cached = self.cache.list().with_labels(&owner_labels);
        let snapshots = last_applied_all(&cached)?;
        let originals: FxHashMap<ObjectId, Resource> = cached.iter().map(|r| r.key().object_id()).zip(snapshots).collect();

        let types = client.discover().await.map_err(|e| Error::op("discovering", "api resources", e))?;
        let desired = stamp_desired(resources, &types, &owner_labels, &install_namespace, respect_manifest_namespaces)?;

        let sets = diff(&desired, &cached)?;
        let plan = Plan { create: sets.to_create.len(), update: sets.to_update.len(), delete: sets.to_delete.len() };
        info!(
            desired = desired.len(),
            cached = cached.len(),
            cache_total = self.cache.len(),
            labels = %label_selector(&owner_labels),
            create = plan.create,
            update = plan.update,
            delete = plan.delete,
            "reconciling desired resources against cached resources"
        );

        // reverse of install order, so e.g. namespaces go after their contents
        for group in sets.to_delete.grouped_by_gvk().iter().rev() {
            debug!(gvk = %group.gvk, count = group.resources.len(), "deleting group");
            self.fan_out(&group.resources, |res| self.delete_one(res, cancel)).await?;
        }

        if !sets.to_create.is_empty() && !install_namespace.is_empty() {
            self.ensure_namespace(&install_namespace, cancel).await?;
        }
        for group in sets.to_create.grouped_by_gvk() {
            debug!(gvk = %group.gvk, count = group.resources.len(), "creating group");
            self.fan_out(&group.resources, |res| self.create_one(res, cancel)).await?;
        }

        let originals = &originals;
        for group in sets.to_update.grouped_by_gvk() {
            debug!(gvk = %group.gvk, count = group.resources.len(), "updating group");
            self.fan_out(&group.resources, |res| async move {
                let key = res.key();
                let original = originals
                    .get(&key.object_id())
                    .ok_or_else(|| Error::op("updating", &key, Error::Other(anyhow::anyhow!("no cached original"))))?;
                self.update_one(res, original, cancel).await
            })
            .await?;
        }

        info!(created = plan.create, updated = plan.update, deleted = plan.delete, "reconcile finished");
        Ok(())
    }

    /// Run `op` over one kind group concurrently. The first error drops the rest.
    async fn fan_out<'a, F, Fut>(&self, group: &'a [Resource], op: F) -> Result<()>
    where
        F: FnMut(&'a Resource) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        stream::iter(group.iter().map(Ok)).try_for_each_concurrent(self.opts.max_concurrency, op).await
    }

    async fn ensure_namespace(&self, namespace: &str, cancel: &CancellationToken) -> Result<()> {
        let ns = Resource::from_value(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": namespace}}))?;
        let client = self.client.as_ref();
        let ns_ref = &ns;
        match retry_transient(&self.opts.mutation_retry, cancel, "create namespace", move || client.create(ns_ref)).await {
            Ok(_) => info!(namespace, "created installation namespace"),
            Err(e) if e.is_already_exists() => debug!(namespace, "installation namespace exists"),
            Err(e) => return Err(Error::op("creating installation namespace", namespace, e)),
        }
        Ok(())
    }

    async fn delete_one(&self, res: &Resource, cancel: &CancellationToken) -> Result<()> {
        let key = res.key();
        let client = self.client.as_ref();
        let outcome = async {
            self.callbacks.pre_delete(res).await?;
            info!(key = %key, "deleting resource");
            let key_ref = &key;
            match retry_transient(&self.opts.mutation_retry, cancel, "delete", move || client.delete(key_ref)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!(key = %key, "already gone"),
                Err(e) => return Err(e),
            }
            self.cache.delete(res);
            counter!("keel_resources_deleted_total", 1u64);
            self.callbacks.post_delete(res).await
        }
        .await;
        outcome.map_err(|e| Error::op("deleting", &key, e))
    }

    async fn create_one(&self, res: &Resource, cancel: &CancellationToken) -> Result<()> {
        let mut desired = res.clone();
        let key = desired.key();
        let client = self.client.as_ref();
        let opts = &self.opts;
        let outcome = async {
            self.callbacks.pre_create(&mut desired).await?;
            info!(key = %key, policy = %opts.creation_policy, "creating resource");
            let desired_ref = &desired;
            let created = retry_transient(&opts.mutation_retry, cancel, "create", move || {
                create_with_policy(opts.creation_policy, client, desired_ref, &opts.wait_retry, cancel)
            })
            .await?;
            self.cache.set(created.clone());
            counter!("keel_resources_created_total", 1u64);
            self.callbacks.post_create(&created).await?;
            wait_ready(client, &desired, &opts.wait_retry, cancel).await
        }
        .await;
        outcome.map_err(|e| Error::op("creating", &key, e))
    }

    /// Three-way update: `original` is the last-applied snapshot, `res` the desired object,
    /// and the live object is fetched fresh on every attempt.
    async fn update_one(&self, res: &Resource, original: &Resource, cancel: &CancellationToken) -> Result<()> {
        let mut desired = res.clone();
        let key = desired.key();
        let client = self.client.as_ref();
        let opts = &self.opts;
        let outcome = async {
            self.callbacks.pre_update(&mut desired).await?;
            if compute_equality(original, &desired) {
                debug!(key = %key, "unchanged, skipping update");
                counter!("keel_resources_unchanged_total", 1u64);
                return Ok(());
            }
            let patch = build_patch(original, &desired);
            let (key_ref, patch_ref) = (&key, &patch);
            let updated = retry_transient(&opts.mutation_retry, cancel, "update", move || async move {
                let live = client.get(key_ref).await?;
                let merged = apply_patch(&live, patch_ref)?;
                info!(key = %key_ref, changes = %diff_summary(&merged.to_value(), &live.to_value()), "updating resource");
                client.update(&merged).await
            })
            .await?;
            self.cache.set(updated.clone());
            counter!("keel_resources_updated_total", 1u64);
            self.callbacks.post_update(&updated).await?;
            wait_ready(client, &desired, &opts.wait_retry, cancel).await
        }
        .await;
        outcome.map_err(|e| Error::op("updating", &key, e))
    }
}

/// Owner labels and namespace scope. Kinds unknown to discovery are resolved from a
/// CustomResourceDefinition in the same desired set, which must be unique. Namespaced
/// resources without a namespace land in `install_namespace` even when manifest
/// namespaces are respected; cluster-scoped ones never carry one.
fn stamp_desired(
    mut resources: ResourceSet,
    types: &TypeMap,
    owner_labels: &Labels,
    install_namespace: &str,
    respect_manifest_namespaces: bool,
) -> Result<ResourceSet> {
    let declared = resources.clone();
    for res in resources.iter_mut() {
        res.add_labels(owner_labels);
        let gvk = res.gvk();
        let namespaced = match types.is_namespaced(&gvk) {
            Ok(namespaced) => namespaced,
            Err(e) if e.is_no_mapping() => {
                let scopes: Vec<bool> = declared.iter().filter_map(|crd| crd_scope_for(crd, &gvk)).collect();
                match scopes.as_slice() {
                    [namespaced] => *namespaced,
                    _ => {
                        return Err(Error::op(
                            "resolving scope of",
                            res.key(),
                            Error::NoRestMapping(format!("{} (and {} matching CustomResourceDefinitions in the desired set)", gvk, scopes.len())),
                        ))
                    }
                }
            }
            Err(e) => return Err(e),
        };
        // keys must match what the server reports back
        if !namespaced {
            res.set_namespace("");
        } else if !respect_manifest_namespaces || res.namespace().is_empty() {
            res.set_namespace(install_namespace);
        }
    }
    Ok(resources)
}

#[async_trait::async_trait]
impl Installer for Reconciler {
    async fn reconcile_resources(&self, params: ReconcileParams, cancel: &CancellationToken) -> Result<()> {
        self.reconcile(params, cancel).await
    }

    async fn purge_resources(&self, labels: &Labels, cancel: &CancellationToken) -> Result<()> { self.purge(labels, cancel).await }

    fn list_all_resources(&self) -> ResourceSet { self.list_all() }
}
