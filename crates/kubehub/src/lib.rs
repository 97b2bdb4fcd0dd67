//! Keel kubehub: `ClusterClient` over kube-rs dynamic objects, API discovery into a
//! `TypeMap`, and classification of API server responses.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use futures::future::try_join_all;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use keel_core::{label_selector, ApiType, ClusterClient, Error, Gvk, Labels, Resource, ResourceKey, ResourceSet, Result, TypeMap};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{verbs, Discovery, Scope},
    Client,
};
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, info};

/// Dynamic client for any served kind. The type map is refreshed by `discover()` and
/// once more whenever a kind is not found in it.
pub struct KubeClient {
    client: Client,
    types: ArcSwap<TypeMap>,
}

impl KubeClient {
    /// Client from the ambient kubeconfig or in-cluster environment.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Self::new(client).await
    }

    pub async fn new(client: Client) -> Result<Self> {
        let types = discover_types(&client).await?;
        Ok(Self { client, types: ArcSwap::from_pointee(types) })
    }

    pub fn types(&self) -> Arc<TypeMap> { self.types.load_full() }

    async fn resolve(&self, gvk: &Gvk) -> Result<(ApiResource, bool)> {
        let cached = self.types.load().get(gvk).cloned();
        let ty = match cached {
            Some(ty) => ty,
            None => {
                debug!(gvk = %gvk, "type mapping miss; refreshing discovery");
                self.discover().await?.get(gvk).cloned().ok_or_else(|| Error::NoRestMapping(gvk.gvk_key()))?
            }
        };
        Ok((api_resource(gvk, &ty.plural), ty.namespaced))
    }

    fn api(&self, ar: &ApiResource, namespaced: bool, namespace: &str) -> Api<DynamicObject> {
        match (namespaced, namespace) {
            (false, _) => Api::all_with(self.client.clone(), ar),
            (true, "") => Api::default_namespaced_with(self.client.clone(), ar),
            (true, ns) => Api::namespaced_with(self.client.clone(), ns, ar),
        }
    }
}

fn api_resource(gvk: &Gvk, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind), plural)
}

/// Every version of every served group. Only the preferred version of a kind is
/// marked listable so owner listings do not return the same object twice.
async fn discover_types(client: &Client) -> Result<TypeMap> {
    let discovery = Discovery::new(client.clone()).run().await.context("running API discovery")?;
    let mut types = TypeMap::new();
    for group in discovery.groups() {
        let preferred = group.preferred_version_or_latest().to_string();
        for version in group.versions() {
            for (ar, caps) in group.versioned_resources(version) {
                let ty = ApiType {
                    plural: ar.plural.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                    listable: version == preferred && caps.supports_operation(verbs::LIST),
                };
                types.insert(Gvk::new(ar.group.clone(), ar.version.clone(), ar.kind.clone()), ty);
            }
        }
    }
    Ok(types)
}

/// Map an API error onto the installer's taxonomy by HTTP status and reason.
/// Client errors other than timeouts, conflicts and throttling are final.
pub fn classify(err: kube::Error, key: &ResourceKey) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(key.to_string()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => Error::AlreadyExists(key.to_string()),
        kube::Error::Api(ae) if ae.code == 422 && ae.reason == "Invalid" && ae.message.contains("immutable") => {
            Error::ImmutableField { key: key.to_string(), message: ae.message }
        }
        kube::Error::Api(ae) if (400..500).contains(&ae.code) && !matches!(ae.code, 408 | 409 | 429) => {
            Error::Rejected { key: key.to_string(), code: ae.code, message: ae.message }
        }
        other => Error::Other(anyhow::Error::new(other).context(format!("request for {}", key))),
    }
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(obj) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        obj.remove("managedFields");
    }
}

fn to_dynamic(res: &Resource) -> Result<DynamicObject> {
    serde_json::from_value(res.to_value()).map_err(|e| Error::InvalidResource(format!("{}: {}", res.key(), e)))
}

/// List items come back without type meta; fill it in from the endpoint.
fn from_dynamic(obj: DynamicObject, ar: &ApiResource) -> Result<Resource> {
    let mut v = serde_json::to_value(&obj).context("serializing DynamicObject")?;
    if let Some(o) = v.as_object_mut() {
        o.entry("apiVersion").or_insert_with(|| Json::String(ar.api_version.clone()));
        o.entry("kind").or_insert_with(|| Json::String(ar.kind.clone()));
    }
    strip_managed_fields(&mut v);
    Resource::from_value(v)
}

#[async_trait::async_trait]
impl ClusterClient for KubeClient {
    async fn get(&self, key: &ResourceKey) -> Result<Resource> {
        let (ar, namespaced) = self.resolve(&key.gvk).await?;
        counter!("keel_kube_requests_total", 1u64, "verb" => "get");
        let obj = self.api(&ar, namespaced, &key.namespace).get(&key.name).await.map_err(|e| classify(e, key))?;
        from_dynamic(obj, &ar)
    }

    async fn create(&self, resource: &Resource) -> Result<Resource> {
        let key = resource.key();
        let (ar, namespaced) = self.resolve(&key.gvk).await?;
        let obj = to_dynamic(resource)?;
        counter!("keel_kube_requests_total", 1u64, "verb" => "create");
        let created = self
            .api(&ar, namespaced, &key.namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| classify(e, &key))?;
        from_dynamic(created, &ar)
    }

    async fn update(&self, resource: &Resource) -> Result<Resource> {
        let key = resource.key();
        let (ar, namespaced) = self.resolve(&key.gvk).await?;
        let obj = to_dynamic(resource)?;
        counter!("keel_kube_requests_total", 1u64, "verb" => "update");
        let replaced = self
            .api(&ar, namespaced, &key.namespace)
            .replace(&key.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| classify(e, &key))?;
        from_dynamic(replaced, &ar)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        let (ar, namespaced) = self.resolve(&key.gvk).await?;
        counter!("keel_kube_requests_total", 1u64, "verb" => "delete");
        self.api(&ar, namespaced, &key.namespace)
            .delete(&key.name, &DeleteParams::foreground())
            .await
            .map_err(|e| classify(e, key))?;
        Ok(())
    }

    async fn list(&self, labels: &Labels) -> Result<ResourceSet> {
        let types = self.types.load_full();
        let lp = ListParams::default().labels(&label_selector(labels));
        let calls = types.iter().filter(|(_, ty)| ty.listable).map(|(gvk, ty)| {
            let ar = api_resource(gvk, &ty.plural);
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
            let lp = lp.clone();
            async move {
                counter!("keel_kube_requests_total", 1u64, "verb" => "list");
                match api.list(&lp).await {
                    Ok(list) => list.items.into_iter().map(|o| from_dynamic(o, &ar)).collect::<Result<Vec<_>>>(),
                    Err(kube::Error::Api(ae)) if matches!(ae.code, 403 | 404 | 405) => {
                        debug!(gvk = %gvk, code = ae.code, "skipping kind that cannot be listed");
                        Ok(Vec::new())
                    }
                    Err(e) => Err(Error::Other(anyhow::Error::new(e).context(format!("listing {}", gvk)))),
                }
            }
        });
        let lists = try_join_all(calls).await?;
        Ok(lists.into_iter().flatten().collect())
    }

    async fn list_endpoint(&self, group: &str, version: &str, plural: &str) -> Result<()> {
        let ar = ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version: Gvk::new(group, version, "").api_version(),
            kind: String::new(),
            plural: plural.to_string(),
        };
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        counter!("keel_kube_requests_total", 1u64, "verb" => "list");
        api.list(&ListParams::default().limit(1))
            .await
            .with_context(|| format!("listing {}/{}/{}", group, version, plural))?;
        Ok(())
    }

    async fn discover(&self) -> Result<Arc<TypeMap>> {
        let types = Arc::new(discover_types(&self.client).await?);
        self.types.store(types.clone());
        info!(kinds = types.len(), "api discovery refreshed");
        Ok(types)
    }
}

/// Create CRDs, tolerating ones that already exist.
pub async fn create_crds(client: &dyn ClusterClient, crds: &[CustomResourceDefinition]) -> Result<()> {
    for crd in crds {
        let res = Resource::from_value(serde_json::to_value(crd).context("serializing CustomResourceDefinition")?)?;
        match client.create(&res).await {
            Ok(_) => info!(key = %res.key(), "crd created"),
            Err(e) if e.is_already_exists() => debug!(key = %res.key(), "crd already exists"),
            Err(e) => return Err(Error::op("creating", res.key(), e)),
        }
    }
    Ok(())
}

/// Delete CRDs, tolerating ones that are already gone.
pub async fn delete_crds(client: &dyn ClusterClient, crds: &[CustomResourceDefinition]) -> Result<()> {
    for crd in crds {
        let key = ResourceKey {
            gvk: Gvk::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition"),
            namespace: String::new(),
            name: crd.metadata.name.clone().unwrap_or_default(),
        };
        match client.delete(&key).await {
            Ok(()) => info!(key = %key, "crd deleted"),
            Err(e) if e.is_not_found() => debug!(key = %key, "crd already gone"),
            Err(e) => return Err(Error::op("deleting", key, e)),
        }
    }
    Ok(())
}
