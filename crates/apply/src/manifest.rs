//! Plain multi-document YAML manifests → `ResourceSet`.

use keel_core::{Error, Resource, ResourceSet, Result};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

fn max_yaml_bytes() -> usize {
    std::env::var("KEEL_MAX_YAML_BYTES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(4 * 1024 * 1024)
}

fn max_yaml_nodes() -> usize {
    std::env::var("KEEL_MAX_YAML_NODES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(500_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

fn invalid(doc: usize, reason: impl std::fmt::Display) -> Error {
    Error::InvalidResource(format!("document {}: {}", doc, reason))
}

fn to_resource(doc: usize, v: Json) -> Result<Resource> {
    Resource::from_value(v).map_err(|e| match e {
        Error::InvalidResource(msg) => invalid(doc, msg),
        other => other,
    })
}

/// Split `yaml` into resources. Empty documents are skipped and `kind: List`
/// documents contribute their items.
pub fn parse_manifest(yaml: &str) -> Result<ResourceSet> {
    let max_bytes = max_yaml_bytes();
    if yaml.len() > max_bytes {
        return Err(Error::InvalidResource(format!("YAML payload too large (>{} bytes)", max_bytes)));
    }
    let max_nodes = max_yaml_nodes();
    let mut out = ResourceSet::new();
    for (idx, de) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let doc = idx + 1;
        let val = serde_yaml::Value::deserialize(de).map_err(|e| invalid(doc, format!("parsing YAML: {}", e)))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).map_err(|e| invalid(doc, format!("converting YAML to JSON: {}", e)))?;
        if json_node_budget_exceeded(&json, max_nodes) {
            return Err(invalid(doc, format!("YAML document too complex (>{} nodes)", max_nodes)));
        }
        if json.get("kind").and_then(Json::as_str) == Some("List") {
            let items = match json.get("items") {
                Some(Json::Array(items)) => items.clone(),
                Some(Json::Null) | None => Vec::new(),
                Some(_) => return Err(invalid(doc, "List items must be a sequence")),
            };
            for item in items {
                out.push(to_resource(doc, item)?);
            }
        } else {
            out.push(to_resource(doc, json)?);
        }
    }
    debug!(resources = out.len(), bytes = yaml.len(), "manifest parsed");
    Ok(out)
}
