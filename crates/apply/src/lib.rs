//! Keel apply: classify desired resources against the ownership cache, detect no-op
//! updates, and compute the three-way merge used to update live objects.

#![forbid(unsafe_code)]

use std::fmt;

use keel_core::{Resource, ResourceSet, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

mod annotation;
mod manifest;
mod patch;

pub use annotation::{last_applied, last_applied_all, set_last_applied, LAST_APPLIED_ANNOTATION};
pub use manifest::parse_manifest;
pub use patch::{apply_patch, build_patch, Patch};

/// Outcome of classifying desired resources against cached ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffSets {
    pub to_create: ResourceSet,
    pub to_update: ResourceSet,
    pub to_delete: ResourceSet,
}

impl DiffSets {
    pub fn is_noop(&self) -> bool { self.to_create.is_empty() && self.to_delete.is_empty() && self.to_update.is_empty() }
}

/// Classify by object identity: desired and cached → update, desired only → create,
/// cached only → delete. The API version is not part of identity, so an object cached
/// under one served version matches a desired copy written against another. Output
/// preserves input order.
pub fn diff(desired: &ResourceSet, cached: &ResourceSet) -> Result<DiffSets> {
    let desired_ids = desired.by_object_id()?;
    let cached_ids = cached.by_object_id()?;
    let mut out = DiffSets::default();
    for res in desired {
        if cached_ids.contains_key(&res.key().object_id()) {
            out.to_update.push(res.clone());
        } else {
            out.to_create.push(res.clone());
        }
    }
    for res in cached {
        if !desired_ids.contains_key(&res.key().object_id()) {
            out.to_delete.push(res.clone());
        }
    }
    Ok(out)
}

/// Semantic equality ignoring server-managed fields, status and the last-applied
/// annotation itself.
pub fn compute_equality(original: &Resource, desired: &Resource) -> bool {
    strip_noisy(original.to_value()) == strip_noisy(desired.to_value())
}

/// Remove fields the server owns, plus the last-applied annotation.
pub(crate) fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for field in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(field);
        }
        let drop_annotations = match meta.get_mut("annotations").and_then(Json::as_object_mut) {
            Some(annos) => {
                annos.remove(LAST_APPLIED_ANNOTATION);
                annos.is_empty()
            }
            None => false,
        };
        if drop_annotations {
            meta.remove("annotations");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Count of structural changes from `base` to `target`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{} ~{} -{}", self.adds, self.updates, self.removes)
    }
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(t: &Json, b: &Json, s: &mut DiffSummary) {
        match (t, b) {
            (Json::Object(to), Json::Object(bo)) => {
                for (k, tv) in to {
                    match bo.get(k) {
                        Some(bv) if bv == tv => {}
                        Some(bv) => walk(tv, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !to.contains_key(*k)).count();
            }
            (Json::Array(ta), Json::Array(ba)) => {
                s.updates += ta.iter().zip(ba.iter()).filter(|(x, y)| x != y).count();
                s.adds += ta.len().saturating_sub(ba.len());
                s.removes += ba.len().saturating_sub(ta.len());
            }
            (tv, bv) => {
                if tv != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Resource;
    use serde_json::json;

    fn cm(name: &str) -> Resource {
        Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns"}}))
            .unwrap()
    }

    #[test]
    fn diff_partitions_keys_exactly() {
        let desired: ResourceSet = vec![cm("both-1"), cm("new-1"), cm("both-2"), cm("new-2")].into();
        let cached: ResourceSet = vec![cm("old-1"), cm("both-2"), cm("both-1")].into();
        let d = diff(&desired, &cached).unwrap();

        let names = |s: &ResourceSet| s.iter().map(|r| r.name().to_string()).collect::<Vec<_>>();
        assert_eq!(names(&d.to_update), vec!["both-1", "both-2"]);
        assert_eq!(names(&d.to_create), vec!["new-1", "new-2"]);
        assert_eq!(names(&d.to_delete), vec!["old-1"]);

        let mut all: Vec<_> = d.to_update.keys();
        all.extend(d.to_create.keys());
        all.extend(d.to_delete.keys());
        let n = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), n, "a key landed in more than one set");
    }

    #[test]
    fn diff_of_identical_sets_is_all_updates() {
        let set: ResourceSet = vec![cm("a"), cm("b")].into();
        let d = diff(&set, &set).unwrap();
        assert_eq!(d.to_update.len(), 2);
        assert!(d.to_create.is_empty() && d.to_delete.is_empty());
        assert!(!d.is_noop());
        assert!(diff(&ResourceSet::new(), &ResourceSet::new()).unwrap().is_noop());
    }

    #[test]
    fn diff_rejects_duplicate_desired_keys() {
        let desired: ResourceSet = vec![cm("a"), cm("a")].into();
        assert!(diff(&desired, &ResourceSet::new()).is_err());
    }

    fn widget(version: &str, name: &str) -> Resource {
        Resource::from_value(json!({
            "apiVersion": format!("example.com/{}", version),
            "kind": "Widget",
            "metadata": {"name": name, "namespace": "ns"}
        }))
        .unwrap()
    }

    #[test]
    fn diff_matches_objects_across_served_versions() {
        let desired: ResourceSet = vec![widget("v1", "w"), widget("v1", "fresh")].into();
        let cached: ResourceSet = vec![widget("v2", "w"), widget("v2", "gone")].into();
        let d = diff(&desired, &cached).unwrap();

        let keys = |s: &ResourceSet| s.keys().iter().map(|k| format!("{} {}", k.gvk.version, k.name)).collect::<Vec<_>>();
        assert_eq!(keys(&d.to_update), vec!["v1 w"]);
        assert_eq!(keys(&d.to_create), vec!["v1 fresh"]);
        assert_eq!(keys(&d.to_delete), vec!["v2 gone"]);

        // the same object declared twice at different versions is still a duplicate
        let twice: ResourceSet = vec![widget("v1", "w"), widget("v2", "w")].into();
        assert!(diff(&twice, &ResourceSet::new()).is_err());
    }

    #[test]
    fn equality_ignores_server_fields_and_status() {
        let mut a = cm("a");
        a.as_object_mut().insert("data".into(), json!({"k": "v"}));
        let mut b = a.clone();
        b.set_resource_version(Some("991"));
        b.as_object_mut().insert("status".into(), json!({"observed": 3}));
        b.as_object_mut()["metadata"]["uid"] = json!("0000-1111");
        b.set_annotation(LAST_APPLIED_ANNOTATION, "{}");
        assert!(compute_equality(&a, &b));

        b.as_object_mut()["data"]["k"] = json!("changed");
        assert!(!compute_equality(&a, &b));
    }

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "managedFields": [ {"manager": "kubectl"} ],
                "resourceVersion": "123",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "annotations": { LAST_APPLIED_ANNOTATION: "{}" }
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let pruned = strip_noisy(v);
        let meta = pruned["metadata"].as_object().unwrap();
        assert!(!meta.contains_key("managedFields"));
        assert!(!meta.contains_key("resourceVersion"));
        assert!(!meta.contains_key("generation"));
        assert!(!meta.contains_key("creationTimestamp"));
        assert!(!meta.contains_key("annotations"));
        assert!(pruned.get("status").is_none());
        assert_eq!(pruned["data"]["k"], "v");
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        let s = diff_summary(&target, &base);
        // a and c[1] changed; b.y and d are new; c lost one element
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
        assert_eq!(s.to_string(), "+2 ~2 -1");
    }
}
