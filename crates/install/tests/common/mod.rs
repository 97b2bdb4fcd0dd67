#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_core::{label_selector, ApiType, ClusterClient, Error, Gvk, Labels, Resource, ResourceKey, ResourceSet, Result, TypeMap};
use keel_install::{InstallerOptions, RetryPolicy};
use serde_json::{json, Value as Json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    AlreadyExists,
    Immutable,
    NotFound,
    Rejected,
    Transient,
}

struct Injected {
    verb: Verb,
    name: String,
    fault: Fault,
    times: u32,
}

struct State {
    objects: BTreeMap<ResourceKey, Resource>,
    types: TypeMap,
    servable: HashSet<(String, String, String)>,
    ops: Vec<String>,
    faults: Vec<Injected>,
    gets: HashMap<ResourceKey, u32>,
    rv: u64,
    auto_status: bool,
    ready_after_gets: u32,
    listed_as: HashMap<(String, String), String>,
}

/// In-memory API server: records every call, assigns server fields, fills in
/// readiness status after a number of reads and can inject failures.
pub struct FakeCluster {
    state: Mutex<State>,
}

fn api(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> (Gvk, ApiType) {
    (Gvk::new(group, version, kind), ApiType { plural: plural.into(), namespaced, listable: true })
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        let mut types = TypeMap::new();
        for (gvk, ty) in [
            api("", "v1", "Namespace", "namespaces", false),
            api("", "v1", "ConfigMap", "configmaps", true),
            api("", "v1", "Service", "services", true),
            api("apps", "v1", "Deployment", "deployments", true),
            api("batch", "v1", "Job", "jobs", true),
            api("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", false),
            api("apiextensions.k8s.io", "v1", "CustomResourceDefinition", "customresourcedefinitions", false),
        ] {
            types.insert(gvk, ty);
        }
        Arc::new(Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                types,
                servable: HashSet::new(),
                ops: Vec::new(),
                faults: Vec::new(),
                gets: HashMap::new(),
                rv: 0,
                auto_status: true,
                ready_after_gets: 1,
                listed_as: HashMap::new(),
            }),
        })
    }

    /// Status becomes ready on the `n`th read after a write.
    pub fn ready_after_gets(&self, n: u32) { self.state.lock().unwrap().ready_after_gets = n }

    /// Never fill in status; tests edit it by hand.
    pub fn manual_status(&self) { self.state.lock().unwrap().auto_status = false }

    pub fn inject(&self, verb: Verb, name: &str, fault: Fault, times: u32) {
        self.state.lock().unwrap().faults.push(Injected { verb, name: name.into(), fault, times });
    }

    /// Report every object of a kind under another served version when listing,
    /// as a server does for its preferred version.
    pub fn list_as(&self, group: &str, kind: &str, version: &str) {
        self.state.lock().unwrap().listed_as.insert((group.into(), kind.into()), version.into());
    }

    pub fn serve(&self, group: &str, version: &str, plural: &str) {
        self.state.lock().unwrap().servable.insert((group.into(), version.into(), plural.into()));
    }

    pub fn ops(&self) -> Vec<String> { self.state.lock().unwrap().ops.clone() }

    pub fn mutations(&self) -> Vec<String> {
        self.ops().into_iter().filter(|o| o.starts_with("create ") || o.starts_with("update ") || o.starts_with("delete ")).collect()
    }

    pub fn clear_ops(&self) { self.state.lock().unwrap().ops.clear() }

    /// Live object by its display key, e.g. "Deployment demo.web".
    pub fn live(&self, key: &str) -> Option<Resource> {
        self.state.lock().unwrap().objects.iter().find(|(k, _)| k.to_string() == key).map(|(_, r)| r.clone())
    }

    pub fn live_keys(&self) -> Vec<String> { self.state.lock().unwrap().objects.keys().map(ToString::to_string).collect() }

    /// Store an object as if someone else had created it.
    pub fn put(&self, res: Resource) {
        let mut st = self.state.lock().unwrap();
        let stored = st.stamp_new(res);
        st.objects.insert(stored.key(), stored);
    }

    /// Change a live object out of band.
    pub fn edit(&self, key: &str, f: impl FnOnce(&mut Resource)) {
        let mut st = self.state.lock().unwrap();
        st.rv += 1;
        let rv = st.rv.to_string();
        if let Some((_, res)) = st.objects.iter_mut().find(|(k, _)| k.to_string() == key) {
            f(res);
            res.set_resource_version(Some(&rv));
        }
    }
}

impl State {
    fn take_fault(&mut self, verb: Verb, key: &ResourceKey) -> Option<Error> {
        let slot = self.faults.iter_mut().find(|f| f.verb == verb && f.name == key.name && f.times > 0)?;
        slot.times -= 1;
        Some(match slot.fault {
            Fault::AlreadyExists => Error::AlreadyExists(key.to_string()),
            Fault::Immutable => Error::ImmutableField { key: key.to_string(), message: "field is immutable".into() },
            Fault::NotFound => Error::NotFound(key.to_string()),
            Fault::Rejected => Error::Rejected { key: key.to_string(), code: 422, message: "spec.replicas: must be >= 0".into() },
            Fault::Transient => Error::Other(anyhow::anyhow!("connection reset by peer")),
        })
    }

    fn mapped(&self, gvk: &Gvk) -> Result<()> { self.types.is_namespaced(gvk).map(|_| ()) }

    fn stamp_new(&mut self, mut res: Resource) -> Resource {
        self.rv += 1;
        res.set_resource_version(Some(&self.rv.to_string()));
        let meta = res.as_object_mut().entry("metadata").or_insert_with(|| json!({}));
        meta["uid"] = json!(format!("uid-{}", self.rv));
        meta["creationTimestamp"] = json!("2024-01-01T00:00:00Z");
        res
    }

    /// Fill in the status a real controller would eventually write.
    fn settle(&mut self, key: &ResourceKey) {
        let Some(res) = self.objects.get_mut(key) else { return };
        if res.as_object().contains_key("status") {
            return;
        }
        let status = match (key.gvk.group.as_str(), key.gvk.kind.as_str()) {
            ("apps", "Deployment") => {
                let replicas = res.get_path(&["spec", "replicas"]).and_then(Json::as_i64).unwrap_or(1);
                json!({"replicas": replicas, "readyReplicas": replicas})
            }
            ("batch", "Job") => json!({
                "completionTime": "2024-01-01T00:01:00Z",
                "conditions": [{"type": "Complete", "status": "True"}]
            }),
            ("apiextensions.k8s.io", "CustomResourceDefinition") => {
                let group = res.get_path(&["spec", "group"]).and_then(Json::as_str).unwrap_or("").to_string();
                let kind = res.get_path(&["spec", "names", "kind"]).and_then(Json::as_str).unwrap_or("").to_string();
                let plural = res.get_path(&["spec", "names", "plural"]).and_then(Json::as_str).unwrap_or("").to_string();
                let namespaced = res.get_path(&["spec", "scope"]).and_then(Json::as_str) == Some("Namespaced");
                let versions: Vec<String> = res
                    .get_path(&["spec", "versions"])
                    .and_then(Json::as_array)
                    .map(|vs| vs.iter().filter_map(|v| v.get("name").and_then(Json::as_str).map(str::to_string)).collect())
                    .unwrap_or_default();
                let status = json!({"conditions": [{"type": "Established", "status": "True"}]});
                res.as_object_mut().insert("status".into(), status);
                for v in versions {
                    self.types.insert(Gvk::new(&group, &v, &kind), ApiType { plural: plural.clone(), namespaced, listable: true });
                    self.servable.insert((group.clone(), v, plural.clone()));
                }
                return;
            }
            _ => return,
        };
        res.as_object_mut().insert("status".into(), status);
    }
}

#[async_trait::async_trait]
impl ClusterClient for FakeCluster {
    async fn get(&self, key: &ResourceKey) -> Result<Resource> {
        let mut st = self.state.lock().unwrap();
        st.ops.push(format!("get {}", key));
        if let Some(e) = st.take_fault(Verb::Get, key) {
            return Err(e);
        }
        st.mapped(&key.gvk)?;
        if !st.objects.contains_key(key) {
            return Err(Error::NotFound(key.to_string()));
        }
        let n = {
            let n = st.gets.entry(key.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if st.auto_status && n >= st.ready_after_gets {
            st.settle(key);
        }
        st.objects.get(key).cloned().ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn create(&self, resource: &Resource) -> Result<Resource> {
        let key = resource.key();
        let mut st = self.state.lock().unwrap();
        st.ops.push(format!("create {}", key));
        if let Some(e) = st.take_fault(Verb::Create, &key) {
            return Err(e);
        }
        st.mapped(&key.gvk)?;
        // namespaced objects sent without a namespace land in the client's default one
        let mut incoming = resource.clone();
        if incoming.namespace().is_empty() && st.types.is_namespaced(&key.gvk).unwrap_or(false) {
            incoming.set_namespace("default");
        }
        let key = incoming.key();
        if st.objects.contains_key(&key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        let mut stored = st.stamp_new(incoming);
        stored.as_object_mut().remove("status");
        st.objects.insert(key.clone(), stored.clone());
        st.gets.remove(&key);
        Ok(stored)
    }

    async fn update(&self, resource: &Resource) -> Result<Resource> {
        let key = resource.key();
        let mut st = self.state.lock().unwrap();
        st.ops.push(format!("update {}", key));
        if let Some(e) = st.take_fault(Verb::Update, &key) {
            return Err(e);
        }
        st.mapped(&key.gvk)?;
        let current = st.objects.get(&key).cloned().ok_or_else(|| Error::NotFound(key.to_string()))?;
        if let Some(rv) = resource.resource_version() {
            if Some(rv) != current.resource_version() {
                return Err(Error::Other(anyhow::anyhow!("conflict: {} has been modified", key)));
            }
        }
        let mut stored = resource.clone();
        for field in ["uid", "creationTimestamp"] {
            if let Some(v) = current.get_path(&["metadata", field]) {
                stored.as_object_mut()["metadata"][field] = v.clone();
            }
        }
        match current.get_path(&["status"]) {
            Some(status) => {
                stored.as_object_mut().insert("status".into(), status.clone());
            }
            None => {
                stored.as_object_mut().remove("status");
            }
        }
        st.rv += 1;
        stored.set_resource_version(Some(&st.rv.to_string()));
        st.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.ops.push(format!("delete {}", key));
        if let Some(e) = st.take_fault(Verb::Delete, key) {
            return Err(e);
        }
        st.mapped(&key.gvk)?;
        st.gets.remove(key);
        st.objects.remove(key).map(|_| ()).ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn list(&self, labels: &Labels) -> Result<ResourceSet> {
        let mut st = self.state.lock().unwrap();
        st.ops.push(format!("list {}", label_selector(labels)));
        let listed = st.objects.values().filter(|r| r.has_labels(labels)).cloned().map(|mut r| {
            let gvk = r.gvk();
            if let Some(version) = st.listed_as.get(&(gvk.group.clone(), gvk.kind.clone())) {
                r.as_object_mut().insert("apiVersion".into(), json!(Gvk::new(&gvk.group, version, &gvk.kind).api_version()));
            }
            r
        });
        Ok(listed.collect())
    }

    async fn list_endpoint(&self, group: &str, version: &str, plural: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.ops.push(format!("list-endpoint {}/{}/{}", group, version, plural));
        if st.servable.contains(&(group.to_string(), version.to_string(), plural.to_string())) {
            Ok(())
        } else {
            Err(Error::Other(anyhow::anyhow!("the server could not find the requested resource")))
        }
    }

    async fn discover(&self) -> Result<Arc<TypeMap>> {
        let mut st = self.state.lock().unwrap();
        st.ops.push("discover".into());
        Ok(Arc::new(st.types.clone()))
    }
}

pub fn quick_options() -> InstallerOptions {
    InstallerOptions {
        wait_retry: RetryPolicy::fixed(Duration::from_millis(1), 50),
        mutation_retry: RetryPolicy::fixed(Duration::from_millis(1), 3),
        ..InstallerOptions::default()
    }
}

pub fn labels(app: &str) -> Labels { Labels::from([("app".to_string(), app.to_string())]) }

pub fn res(v: Json) -> Resource { Resource::from_value(v).unwrap() }

pub fn config_map(name: &str, data: Json) -> Resource {
    res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}, "data": data}))
}

pub fn service(name: &str) -> Resource {
    res(json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": name}, "spec": {"ports": [{"port": 80}]}}))
}

pub fn deployment(name: &str, replicas: i64) -> Resource {
    res(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name},
        "spec": {
            "replicas": replicas,
            "selector": {"matchLabels": {"app": name}},
            "template": {"metadata": {"labels": {"app": name}}, "spec": {"containers": [{"name": name, "image": "nginx"}]}}
        }
    }))
}

pub fn job(name: &str) -> Resource {
    res(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {"name": name},
        "spec": {"template": {"spec": {"restartPolicy": "Never", "containers": [{"name": "run", "image": "busybox"}]}}}
    }))
}

pub fn widget_crd() -> Resource {
    res(json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": {"name": "widgets.example.com"},
        "spec": {
            "group": "example.com",
            "scope": "Namespaced",
            "names": {"kind": "Widget", "plural": "widgets", "singular": "widget", "listKind": "WidgetList"},
            "versions": [{"name": "v1", "served": true, "storage": true}]
        }
    }))
}

pub fn widget(name: &str) -> Resource {
    res(json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": name}, "spec": {"size": 3}}))
}

pub fn in_namespace(mut r: Resource, ns: &str) -> Resource {
    r.set_namespace(ns);
    r
}
