//! Contract between the installer and the orchestration API.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{Error, Gvk, Labels, Resource, ResourceKey, ResourceSet, Result};

/// How a served kind is addressed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiType {
    pub plural: String,
    pub namespaced: bool,
    pub listable: bool,
}

/// Discovery result: served GVKs and their scope. Iteration follows insertion order.
#[derive(Debug, Clone, Default)]
pub struct TypeMap {
    types: FxHashMap<Gvk, ApiType>,
    order: Vec<Gvk>,
}

impl TypeMap {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, gvk: Gvk, ty: ApiType) {
        if self.types.insert(gvk.clone(), ty).is_none() {
            self.order.push(gvk);
        }
    }

    pub fn get(&self, gvk: &Gvk) -> Option<&ApiType> { self.types.get(gvk) }

    pub fn is_namespaced(&self, gvk: &Gvk) -> Result<bool> {
        self.get(gvk).map(|t| t.namespaced).ok_or_else(|| Error::NoRestMapping(gvk.gvk_key()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Gvk, &ApiType)> {
        self.order.iter().filter_map(move |g| self.types.get(g).map(|t| (g, t)))
    }

    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
}

/// Render labels as an equality-based selector ("a=1,b=2").
pub fn label_selector(labels: &Labels) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Orchestration API operations the installer depends on.
///
/// Implementations must classify failures into [`Error::NotFound`],
/// [`Error::AlreadyExists`], [`Error::ImmutableField`] and [`Error::NoRestMapping`].
/// Requests the server refuses outright are [`Error::Rejected`]; transport failures,
/// conflicts, throttling and server-side errors are reported as [`Error::Other`].
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<Resource>;

    /// Returns the object as stored by the server.
    async fn create(&self, resource: &Resource) -> Result<Resource>;

    /// Full replace; `resource` must carry the current resourceVersion.
    async fn update(&self, resource: &Resource) -> Result<Resource>;

    /// Delete with foreground propagation.
    async fn delete(&self, key: &ResourceKey) -> Result<()>;

    /// Every object of every listable kind carrying all `labels`.
    async fn list(&self, labels: &Labels) -> Result<ResourceSet>;

    /// List the collection endpoint of a (possibly just registered) resource type.
    /// Succeeds once the endpoint is servable.
    async fn list_endpoint(&self, group: &str, version: &str, plural: &str) -> Result<()>;

    /// Re-run API discovery and return the fresh type mapping.
    async fn discover(&self) -> Result<Arc<TypeMap>>;
}
