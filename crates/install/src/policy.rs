//! What to do when a create collides with an existing object.

use std::fmt;
use std::str::FromStr;

use keel_core::{ClusterClient, Error, Resource, ResourceKey, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::{poll_until, Probe, RetryPolicy};

/// Escalation on collision: create → update → delete and recreate. Each policy
/// allows one more step than the previous.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CreationPolicy {
    #[default]
    FailOnExists,
    IgnoreOnExists,
    UpdateOnExists,
    ForceRecreateOnExists,
}

impl FromStr for CreationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" | "fail-on-exists" => Ok(Self::FailOnExists),
            "ignore" | "ignore-on-exists" => Ok(Self::IgnoreOnExists),
            "update" | "update-on-exists" => Ok(Self::UpdateOnExists),
            "recreate" | "force-recreate" | "force-recreate-on-exists" => Ok(Self::ForceRecreateOnExists),
            other => Err(Error::Other(anyhow::anyhow!(
                "unknown creation policy {:?} (expected fail, ignore, update or recreate)",
                other
            ))),
        }
    }
}

impl fmt::Display for CreationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FailOnExists => "fail",
            Self::IgnoreOnExists => "ignore",
            Self::UpdateOnExists => "update",
            Self::ForceRecreateOnExists => "recreate",
        })
    }
}

/// Create `resource` under `policy` and return the object as the server stored it
/// (or `resource` itself when an existing object was ignored).
///
/// Only AlreadyExists moves on to the update step and only an immutable-field
/// rejection of that update moves on to delete and recreate. Any other error is
/// returned as is.
pub async fn create_with_policy(
    policy: CreationPolicy,
    client: &dyn ClusterClient,
    resource: &Resource,
    wait: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Resource> {
    let key = resource.key();
    let err = match client.create(resource).await {
        Ok(created) => return Ok(created),
        Err(e) => e,
    };
    if policy == CreationPolicy::FailOnExists || !err.is_already_exists() {
        return Err(err);
    }
    if policy == CreationPolicy::IgnoreOnExists {
        debug!(key = %key, "already exists, ignoring");
        return Ok(resource.clone());
    }

    let mut desired = resource.clone();
    let live = client.get(&key).await?;
    desired.set_resource_version(live.resource_version());
    info!(key = %key, "already exists, updating in place");
    let err = match client.update(&desired).await {
        Ok(updated) => return Ok(updated),
        Err(e) => e,
    };
    if policy != CreationPolicy::ForceRecreateOnExists || !err.is_immutable() {
        return Err(err);
    }

    warn!(key = %key, error = %err, "immutable field change, deleting and recreating");
    match client.delete(&key).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    wait_until_gone(client, &key, wait, cancel).await?;
    if cancel.is_cancelled() {
        warn!(key = %key, "cancelled after delete, not recreating");
        return Err(err);
    }
    desired.clear_server_identity();
    client.create(&desired).await
}

/// Poll until `key` reads as NotFound.
pub async fn wait_until_gone(
    client: &dyn ClusterClient,
    key: &ResourceKey,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    poll_until(policy, cancel, &key.to_string(), move || async move {
        match client.get(key).await {
            Ok(_) => Ok(Probe::Pending(format!("{} still exists", key))),
            Err(e) if e.is_not_found() => Ok(Probe::Ready),
            Err(e) => Err(e),
        }
    })
    .await
}
