//! Three-way merge: base = last-applied snapshot, ours = desired, theirs = live object.
//!
//! The patch is an RFC 7386 merge patch of desired against the snapshot, so it only
//! mentions fields the caller changed. Applied to the live object it removes what the
//! caller removed and leaves server-written fields alone.

use keel_core::{Resource, Result};
use serde_json::{Map, Value as Json};

/// JSON merge patch. `null` deletes a key; arrays are replaced wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch(Json);

impl Patch {
    pub fn is_empty(&self) -> bool { self.0.as_object().map(Map::is_empty).unwrap_or(false) }
    pub fn as_value(&self) -> &Json { &self.0 }
}

/// Merge patch taking `original` to `desired`.
pub fn build_patch(original: &Resource, desired: &Resource) -> Patch {
    let orig = original.to_value();
    let want = desired.to_value();
    Patch(merge_diff(&orig, &want).unwrap_or_else(|| Json::Object(Map::new())))
}

fn merge_diff(orig: &Json, want: &Json) -> Option<Json> {
    match (orig, want) {
        (Json::Object(o), Json::Object(w)) => {
            let mut out = Map::new();
            for (k, ov) in o {
                match w.get(k) {
                    None => {
                        out.insert(k.clone(), Json::Null);
                    }
                    Some(wv) => {
                        if let Some(p) = merge_diff(ov, wv) {
                            out.insert(k.clone(), p);
                        }
                    }
                }
            }
            for (k, wv) in w {
                if !o.contains_key(k) {
                    out.insert(k.clone(), wv.clone());
                }
            }
            if out.is_empty() { None } else { Some(Json::Object(out)) }
        }
        (o, w) if o == w => None,
        (_, w) => Some(w.clone()),
    }
}

/// Apply `patch` to a freshly fetched live object, ready to be written back.
pub fn apply_patch(live: &Resource, patch: &Patch) -> Result<Resource> {
    let mut doc = live.to_value();
    json_patch::merge(&mut doc, &patch.0);
    Resource::from_value(doc)
}
