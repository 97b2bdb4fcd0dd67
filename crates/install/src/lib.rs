//! Keel install: reconcile a desired set of resources against the cluster, tracking
//! what was installed through owner labels and a last-applied snapshot.
//!
//! The [`Reconciler`] composes the ownership cache, the diff engine, the creation
//! policy, the readiness waiter and the callback pipeline.

#![forbid(unsafe_code)]

mod callbacks;
mod options;
mod policy;
mod readiness;
mod reconciler;
mod retry;

pub use callbacks::{CallbackPipeline, InstallCallback};
pub use options::InstallerOptions;
pub use policy::{create_with_policy, wait_until_gone, CreationPolicy};
pub use readiness::{wait_ready, ReadinessKind};
pub use reconciler::{list_all_cached_values, Installer, ReconcileParams, Reconciler};
pub use retry::{poll_until, retry_transient, Probe, RetryPolicy};
pub use tokio_util::sync::CancellationToken;
