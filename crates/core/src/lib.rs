//! Keel core types: resource identity, the semi-structured resource document,
//! ordered resource sets and the error taxonomy shared by every crate.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

mod client;
mod error;

pub use client::{label_selector, ApiType, ClusterClient, TypeMap};
pub use error::{Error, Phase, Result};

pub mod prelude {
    pub use super::{ClusterClient, Error, Gvk, Labels, ObjectId, Resource, ResourceKey, ResourceSet, Result};
}

/// Label and annotation maps. Ordered so selectors and snapshots render deterministically.
pub type Labels = BTreeMap<String, String>;

/// Group/Version/Kind. The core group is the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Split an `apiVersion` ("v1", "apps/v1") into group and version.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// "v1/Kind" or "group/v1/Kind".
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.gvk_key()) }
}

/// Identity of a resource. Namespace is empty for cluster-scoped kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub gvk: Gvk,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.gvk.kind, self.name)
        } else {
            write!(f, "{} {}.{}", self.gvk.kind, self.namespace, self.name)
        }
    }
}

impl ResourceKey {
    /// Identity of the underlying object, the same for every served version.
    pub fn object_id(&self) -> ObjectId {
        ObjectId {
            group: self.gvk.group.clone(),
            kind: self.gvk.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// Group, kind, namespace and name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.kind, self.name)
        } else {
            write!(f, "{} {}.{}", self.kind, self.namespace, self.name)
        }
    }
}

/// A Kubernetes object as an arbitrary JSON document with typed accessors for the
/// fields the installer cares about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(Map<String, Json>);

impl Resource {
    /// Validate and wrap a JSON object. apiVersion, kind and metadata.name are required.
    pub fn from_value(v: Json) -> Result<Self> {
        let obj = match v {
            Json::Object(m) => m,
            other => return Err(Error::InvalidResource(format!("expected an object, got {}", json_type(&other)))),
        };
        let res = Self(obj);
        if res.api_version().is_empty() {
            return Err(Error::InvalidResource("missing apiVersion".into()));
        }
        if res.kind().is_empty() {
            return Err(Error::InvalidResource("missing kind".into()));
        }
        if res.name().is_empty() {
            return Err(Error::InvalidResource(format!("{} missing metadata.name", res.kind())));
        }
        Ok(res)
    }

    pub fn api_version(&self) -> &str { self.0.get("apiVersion").and_then(Json::as_str).unwrap_or("") }
    pub fn kind(&self) -> &str { self.0.get("kind").and_then(Json::as_str).unwrap_or("") }
    pub fn gvk(&self) -> Gvk { Gvk::from_api_version(self.api_version(), self.kind()) }

    pub fn key(&self) -> ResourceKey {
        ResourceKey { gvk: self.gvk(), namespace: self.namespace().to_string(), name: self.name().to_string() }
    }

    fn meta(&self) -> Option<&Map<String, Json>> { self.0.get("metadata").and_then(Json::as_object) }

    fn meta_mut(&mut self) -> &mut Map<String, Json> {
        let meta = self.0.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
        if !meta.is_object() {
            *meta = Json::Object(Map::new());
        }
        match meta {
            Json::Object(m) => m,
            _ => unreachable!("metadata was just normalised to an object"),
        }
    }

    fn meta_str(&self, field: &str) -> Option<&str> { self.meta().and_then(|m| m.get(field)).and_then(Json::as_str) }

    fn string_map(&self, field: &str) -> Labels {
        self.meta()
            .and_then(|m| m.get(field))
            .and_then(Json::as_object)
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default()
    }

    fn set_string_map(&mut self, field: &str, values: &Labels) {
        let meta = self.meta_mut();
        if values.is_empty() {
            meta.remove(field);
            return;
        }
        let m: Map<String, Json> = values.iter().map(|(k, v)| (k.clone(), Json::String(v.clone()))).collect();
        meta.insert(field.to_string(), Json::Object(m));
    }

    pub fn name(&self) -> &str { self.meta_str("name").unwrap_or("") }
    pub fn namespace(&self) -> &str { self.meta_str("namespace").unwrap_or("") }

    /// An empty namespace removes the field (cluster-scoped form).
    pub fn set_namespace(&mut self, namespace: &str) {
        let meta = self.meta_mut();
        if namespace.is_empty() {
            meta.remove("namespace");
        } else {
            meta.insert("namespace".into(), Json::String(namespace.to_string()));
        }
    }

    pub fn labels(&self) -> Labels { self.string_map("labels") }
    pub fn set_labels(&mut self, labels: &Labels) { self.set_string_map("labels", labels) }

    /// Merge `labels` over the existing ones.
    pub fn add_labels(&mut self, labels: &Labels) {
        let mut merged = self.labels();
        merged.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.set_labels(&merged);
    }

    pub fn has_labels(&self, labels: &Labels) -> bool {
        let own = self.labels();
        labels.iter().all(|(k, v)| own.get(k) == Some(v))
    }

    pub fn annotations(&self) -> Labels { self.string_map("annotations") }
    pub fn set_annotations(&mut self, annotations: &Labels) { self.set_string_map("annotations", annotations) }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.meta().and_then(|m| m.get("annotations")).and_then(|a| a.get(key)).and_then(Json::as_str)
    }

    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        let mut annotations = self.annotations();
        annotations.insert(key.to_string(), value.into());
        self.set_annotations(&annotations);
    }

    pub fn remove_annotation(&mut self, key: &str) {
        let mut annotations = self.annotations();
        if annotations.remove(key).is_some() {
            self.set_annotations(&annotations);
        }
    }

    pub fn resource_version(&self) -> Option<&str> { self.meta_str("resourceVersion").filter(|s| !s.is_empty()) }

    pub fn set_resource_version(&mut self, rv: Option<&str>) {
        let meta = self.meta_mut();
        match rv {
            Some(rv) if !rv.is_empty() => {
                meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
            }
            _ => {
                meta.remove("resourceVersion");
            }
        }
    }

    /// Drop the server-assigned identity so the object can be created from scratch.
    pub fn clear_server_identity(&mut self) {
        let meta = self.meta_mut();
        meta.remove("resourceVersion");
        meta.remove("uid");
        meta.remove("creationTimestamp");
    }

    /// Walk nested object keys, e.g. `["spec", "replicas"]`.
    pub fn get_path(&self, path: &[&str]) -> Option<&Json> {
        let (first, rest) = path.split_first()?;
        rest.iter().try_fold(self.0.get(*first)?, |cur, seg| cur.get(*seg))
    }

    pub fn as_object(&self) -> &Map<String, Json> { &self.0 }
    pub fn as_object_mut(&mut self) -> &mut Map<String, Json> { &mut self.0 }
    pub fn to_value(&self) -> Json { Json::Object(self.0.clone()) }
    pub fn into_value(self) -> Json { Json::Object(self.0) }
}

fn json_type(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "a bool",
        Json::Number(_) => "a number",
        Json::String(_) => "a string",
        Json::Array(_) => "an array",
        Json::Object(_) => "an object",
    }
}

/// All resources of one GVK, in encounter order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceGroup {
    pub gvk: Gvk,
    pub resources: Vec<Resource>,
}

/// Ordered collection of resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceSet(Vec<Resource>);

impl ResourceSet {
    pub fn new() -> Self { Self(Vec::new()) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn push(&mut self, res: Resource) { self.0.push(res) }
    pub fn iter(&self) -> std::slice::Iter<'_, Resource> { self.0.iter() }
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Resource> { self.0.iter_mut() }
    pub fn as_slice(&self) -> &[Resource] { &self.0 }
    pub fn into_vec(self) -> Vec<Resource> { self.0 }
    pub fn keys(&self) -> Vec<ResourceKey> { self.0.iter().map(Resource::key).collect() }

    /// Index by key. Keys must be unique within a set.
    pub fn by_key(&self) -> Result<FxHashMap<ResourceKey, &Resource>> {
        let mut out = FxHashMap::default();
        for res in &self.0 {
            let key = res.key();
            if out.contains_key(&key) {
                return Err(Error::DuplicateKey(key.to_string()));
            }
            out.insert(key, res);
        }
        Ok(out)
    }

    /// Index by object identity, ignoring the API version. Two entries for the same
    /// object are rejected even when they name different versions.
    pub fn by_object_id(&self) -> Result<FxHashMap<ObjectId, &Resource>> {
        let mut out = FxHashMap::default();
        for res in &self.0 {
            let id = res.key().object_id();
            if out.contains_key(&id) {
                return Err(Error::DuplicateKey(id.to_string()));
            }
            out.insert(id, res);
        }
        Ok(out)
    }

    /// Group by GVK. Group order follows the first time each GVK is seen.
    pub fn grouped_by_gvk(&self) -> Vec<ResourceGroup> {
        let mut slots: FxHashMap<Gvk, usize> = FxHashMap::default();
        let mut groups: Vec<ResourceGroup> = Vec::new();
        for res in &self.0 {
            let gvk = res.gvk();
            let idx = *slots.entry(gvk.clone()).or_insert_with(|| {
                groups.push(ResourceGroup { gvk, resources: Vec::new() });
                groups.len() - 1
            });
            groups[idx].resources.push(res.clone());
        }
        groups
    }

    pub fn filter(&self, pred: impl Fn(&Resource) -> bool) -> ResourceSet {
        self.0.iter().filter(|r| pred(r)).cloned().collect()
    }

    /// Resources carrying every given label (AND semantics). An empty selector keeps all.
    pub fn with_labels(&self, labels: &Labels) -> ResourceSet { self.filter(|r| r.has_labels(labels)) }
}

impl From<Vec<Resource>> for ResourceSet {
    fn from(v: Vec<Resource>) -> Self { Self(v) }
}

impl FromIterator<Resource> for ResourceSet {
    fn from_iter<I: IntoIterator<Item = Resource>>(iter: I) -> Self { Self(iter.into_iter().collect()) }
}

impl IntoIterator for ResourceSet {
    type Item = Resource;
    type IntoIter = std::vec::IntoIter<Resource>;
    fn into_iter(self) -> Self::IntoIter { self.0.into_iter() }
}

impl<'a> IntoIterator for &'a ResourceSet {
    type Item = &'a Resource;
    type IntoIter = std::slice::Iter<'a, Resource>;
    fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}
