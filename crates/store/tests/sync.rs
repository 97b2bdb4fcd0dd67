#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use keel_core::{ClusterClient, Error, Labels, Resource, ResourceKey, ResourceSet, Result, TypeMap};
use keel_store::OwnershipCache;

/// Answers `list` from a fixed set; every other call fails.
struct Listing {
    live: Mutex<Vec<Resource>>,
}

#[async_trait::async_trait]
impl ClusterClient for Listing {
    async fn get(&self, key: &ResourceKey) -> Result<Resource> { Err(Error::NotFound(key.to_string())) }
    async fn create(&self, _: &Resource) -> Result<Resource> { Err(Error::Other(anyhow::anyhow!("unsupported"))) }
    async fn update(&self, _: &Resource) -> Result<Resource> { Err(Error::Other(anyhow::anyhow!("unsupported"))) }
    async fn delete(&self, _: &ResourceKey) -> Result<()> { Err(Error::Other(anyhow::anyhow!("unsupported"))) }
    async fn list(&self, labels: &Labels) -> Result<ResourceSet> {
        Ok(self.live.lock().unwrap().iter().filter(|r| r.has_labels(labels)).cloned().collect())
    }
    async fn list_endpoint(&self, _: &str, _: &str, _: &str) -> Result<()> { Ok(()) }
    async fn discover(&self) -> Result<Arc<TypeMap>> { Ok(Arc::new(TypeMap::new())) }
}

fn cm(name: &str, app: &str) -> Resource {
    Resource::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": "ns", "labels": {"app": app}}
    }))
    .unwrap()
}

fn labels(app: &str) -> Labels { Labels::from([("app".to_string(), app.to_string())]) }

#[tokio::test]
async fn sync_mirrors_live_objects_for_the_owner_only() {
    let client = Listing { live: Mutex::new(vec![cm("a", "demo"), cm("b", "demo"), cm("x", "other")]) };
    let cache = OwnershipCache::new();
    cache.set(cm("y", "other"));

    let n = cache.sync(&client, &labels("demo"), |_| true).await.unwrap();
    assert_eq!(n, 2);
    assert_eq!(cache.list().with_labels(&labels("demo")).len(), 2);
    // entries of another owner are left alone
    assert_eq!(cache.list().with_labels(&labels("other")).len(), 1);

    // "b" disappears from the cluster
    client.live.lock().unwrap().retain(|r| r.name() != "b");
    cache.sync(&client, &labels("demo"), |_| true).await.unwrap();
    let names: Vec<String> = cache.list().with_labels(&labels("demo")).iter().map(|r| r.name().to_string()).collect();
    assert_eq!(names, vec!["a"]);
}

#[tokio::test]
async fn sync_skips_objects_rejected_by_the_ownership_filter() {
    let mut mine = cm("mine", "demo");
    mine.set_annotation("owner", "keel");
    // e.g. an object the server derived from one of ours, copying its labels
    let derived = cm("derived", "demo");
    let client = Listing { live: Mutex::new(vec![mine, derived, cm("manual", "demo")]) };
    let cache = OwnershipCache::new();
    cache.set(cm("manual", "demo"));

    cache.sync(&client, &labels("demo"), |r| r.annotation("owner").is_some()).await.unwrap();
    // "manual" is still live, so the entry survives even though the filter rejects it
    let names: Vec<String> = cache.list().iter().map(|r| r.name().to_string()).collect();
    assert_eq!(names, vec!["manual", "mine"]);
}

#[tokio::test]
async fn sync_keeps_entries_cached_under_another_served_version() {
    let widget = |version: &str| {
        Resource::from_value(serde_json::json!({
            "apiVersion": format!("example.com/{}", version),
            "kind": "Widget",
            "metadata": {"name": "w", "namespace": "ns", "labels": {"app": "demo"}}
        }))
        .unwrap()
    };
    let client = Listing { live: Mutex::new(vec![widget("v1")]) };
    let cache = OwnershipCache::new();
    cache.set(widget("v1beta1"));

    cache.sync(&client, &labels("demo"), |_| true).await.unwrap();
    let versions: Vec<String> = cache.list().iter().map(|r| r.api_version().to_string()).collect();
    assert_eq!(versions, vec!["example.com/v1beta1"]);
}
