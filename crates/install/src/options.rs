use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::policy::CreationPolicy;
use crate::retry::RetryPolicy;

/// Reconciler settings. `from_env` reads the `KEEL_*` variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallerOptions {
    pub creation_policy: CreationPolicy,
    /// Readiness waits and the wait for a deleted object to disappear.
    pub wait_retry: RetryPolicy,
    /// Transient failures of mutating calls.
    pub mutation_retry: RetryPolicy,
    /// Cap on concurrent operations within one kind group; `None` is unbounded.
    pub max_concurrency: Option<usize>,
}

impl Default for InstallerOptions {
    fn default() -> Self {
        Self {
            creation_policy: CreationPolicy::default(),
            wait_retry: RetryPolicy::wait_default(),
            mutation_retry: RetryPolicy::mutation_default(),
            max_concurrency: None,
        }
    }
}

impl InstallerOptions {
    pub fn from_env() -> Self { Self::from_lookup(|name| std::env::var(name).ok()) }

    /// Unset, unparsable or out-of-range values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let creation_policy = match lookup("KEEL_CREATION_POLICY") {
            Some(s) => s.parse::<CreationPolicy>().unwrap_or_else(|e| {
                warn!(error = %e, "ignoring KEEL_CREATION_POLICY");
                d.creation_policy
            }),
            None => d.creation_policy,
        };
        let retry = |delay: &str, attempts: &str, base: RetryPolicy| RetryPolicy {
            delay: parsed::<u64>(lookup(delay)).map(Duration::from_millis).unwrap_or(base.delay),
            attempts: parsed::<u32>(lookup(attempts)).unwrap_or(base.attempts),
        };
        Self {
            creation_policy,
            wait_retry: retry("KEEL_WAIT_DELAY_MS", "KEEL_WAIT_ATTEMPTS", d.wait_retry),
            mutation_retry: retry("KEEL_MUTATION_DELAY_MS", "KEEL_MUTATION_ATTEMPTS", d.mutation_retry),
            max_concurrency: parsed::<usize>(lookup("KEEL_MAX_CONCURRENCY")).filter(|n| *n > 0),
        }
    }
}

fn parsed<T: FromStr>(raw: Option<String>) -> Option<T> { raw.and_then(|s| s.trim().parse::<T>().ok()) }
