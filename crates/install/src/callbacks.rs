//! Pre/post hooks around install, create, update and delete.

use std::sync::Arc;

use keel_apply::set_last_applied;
use keel_core::{Error, Phase, Resource, Result};

/// A set of hooks. Every method defaults to a no-op.
#[async_trait::async_trait]
pub trait InstallCallback: Send + Sync {
    async fn pre_install(&self) -> anyhow::Result<()> { Ok(()) }
    async fn post_install(&self) -> anyhow::Result<()> { Ok(()) }
    async fn pre_create(&self, _res: &mut Resource) -> anyhow::Result<()> { Ok(()) }
    async fn post_create(&self, _res: &Resource) -> anyhow::Result<()> { Ok(()) }
    async fn pre_update(&self, _res: &mut Resource) -> anyhow::Result<()> { Ok(()) }
    async fn post_update(&self, _res: &Resource) -> anyhow::Result<()> { Ok(()) }
    async fn pre_delete(&self, _res: &Resource) -> anyhow::Result<()> { Ok(()) }
    async fn post_delete(&self, _res: &Resource) -> anyhow::Result<()> { Ok(()) }
}

/// Hooks run in registration order for both pre and post phases. The first failure
/// stops the phase and is reported with the phase name.
#[derive(Clone, Default)]
pub struct CallbackPipeline {
    hooks: Vec<Arc<dyn InstallCallback>>,
}

macro_rules! phase {
    ($name:ident, $phase:expr) => {
        pub async fn $name(&self) -> Result<()> {
            for hook in &self.hooks {
                hook.$name().await.map_err(|e| Error::callback($phase, e))?;
            }
            Ok(())
        }
    };
    ($name:ident, $phase:expr, &$res:ty) => {
        pub async fn $name(&self, res: &$res) -> Result<()> {
            for hook in &self.hooks {
                hook.$name(res).await.map_err(|e| Error::callback($phase, e))?;
            }
            Ok(())
        }
    };
}

impl CallbackPipeline {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, hook: Arc<dyn InstallCallback>) { self.hooks.push(hook) }

    pub fn len(&self) -> usize { self.hooks.len() }
    pub fn is_empty(&self) -> bool { self.hooks.is_empty() }

    phase!(pre_install, Phase::PreInstall);
    phase!(post_install, Phase::PostInstall);
    phase!(post_create, Phase::PostCreate, &Resource);
    phase!(post_update, Phase::PostUpdate, &Resource);
    phase!(pre_delete, Phase::PreDelete, &Resource);
    phase!(post_delete, Phase::PostDelete, &Resource);

    /// Stamps the last-applied annotation, then runs the hooks.
    pub async fn pre_create(&self, res: &mut Resource) -> Result<()> {
        set_last_applied(res)?;
        for hook in &self.hooks {
            hook.pre_create(res).await.map_err(|e| Error::callback(Phase::PreCreate, e))?;
        }
        Ok(())
    }

    /// Stamps the last-applied annotation, then runs the hooks.
    pub async fn pre_update(&self, res: &mut Resource) -> Result<()> {
        set_last_applied(res)?;
        for hook in &self.hooks {
            hook.pre_update(res).await.map_err(|e| Error::callback(Phase::PreUpdate, e))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CallbackPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackPipeline").field("hooks", &self.hooks.len()).finish()
    }
}
