//! Last-applied-configuration annotation: the merge base for the next update.

use keel_core::{Error, Resource, ResourceSet, Result};

use crate::strip_noisy;

pub const LAST_APPLIED_ANNOTATION: &str = "keel.dev/last-applied-configuration";

/// Stamp `res` with a snapshot of itself (server fields and any previous snapshot removed).
pub fn set_last_applied(res: &mut Resource) -> Result<()> {
    let snapshot = strip_noisy(res.to_value());
    let encoded = serde_json::to_string(&snapshot).map_err(|e| Error::Other(e.into()))?;
    res.set_annotation(LAST_APPLIED_ANNOTATION, encoded);
    Ok(())
}

/// Decode the snapshot stored on `res`. The returned object carries the annotation
/// again so a patch built from it rewrites the annotation.
pub fn last_applied(res: &Resource) -> Result<Resource> {
    let key = res.key();
    let raw = res
        .annotation(LAST_APPLIED_ANNOTATION)
        .ok_or_else(|| Error::MissingLastApplied { key: key.to_string(), annotation: LAST_APPLIED_ANNOTATION })?;
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|source| Error::PatchDecode { key: key.to_string(), source })?;
    let mut snapshot = Resource::from_value(value)
        .map_err(|e| Error::op("decoding last-applied configuration of", &key, e))?;
    snapshot.set_annotation(LAST_APPLIED_ANNOTATION, raw);
    Ok(snapshot)
}

/// Decode every resource of a set; the first failure aborts.
pub fn last_applied_all(set: &ResourceSet) -> Result<ResourceSet> {
    set.iter().map(last_applied).collect()
}
