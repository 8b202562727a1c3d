//! Lazily built, reloadable [`RagChain`].

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use docchat_rag::{PromptTemplates, RagChain, Result, Settings};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

/// Builds the chain the server answers with.
#[async_trait]
pub trait ChainFactory: Send + Sync {
    /// Identifies the configuration [`ChainFactory::build`] would use now.
    async fn fingerprint(&self) -> Result<String>;

    async fn build(&self) -> Result<RagChain>;
}

/// Builds from [`Settings::reload_from_env`] and the prompt files it names.
#[derive(Debug, Default, Clone, Copy)]
pub struct SettingsChainFactory;

#[async_trait]
impl ChainFactory for SettingsChainFactory {
    async fn fingerprint(&self) -> Result<String> {
        let settings = Settings::reload_from_env()?;
        let templates = settings.prompt_templates()?;
        Ok(chain_fingerprint(&settings, &templates))
    }

    async fn build(&self) -> Result<RagChain> {
        let settings = Settings::reload_from_env()?;
        let chain = settings.build_chain()?;
        chain.verify().await?;
        Ok(chain)
    }
}

/// Changes when any setting or either prompt text changes.
pub fn chain_fingerprint(settings: &Settings, templates: &PromptTemplates) -> String {
    let mut hasher = DefaultHasher::new();
    templates.system.source().hash(&mut hasher);
    templates.user.source().hash(&mut hasher);
    format!("{:016x}{:016x}", settings.fingerprint(), hasher.finish())
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadStatus {
    pub rebuilt: bool,
    pub fingerprint: String,
}

struct CachedChain {
    fingerprint: String,
    chain: Arc<RagChain>,
}

/// Holds the chain the server answers with.
///
/// Requests only ever take the read lock. Builds run outside it, one at a
/// time, and the finished chain is swapped in.
pub struct ChainCache {
    factory: Arc<dyn ChainFactory>,
    current: RwLock<Option<CachedChain>>,
    building: Mutex<()>,
}

impl ChainCache {
    pub fn new(factory: Arc<dyn ChainFactory>) -> Self {
        Self { factory, current: RwLock::new(None), building: Mutex::new(()) }
    }

    async fn cached(&self) -> Option<Arc<RagChain>> {
        self.current.read().await.as_ref().map(|cached| cached.chain.clone())
    }

    /// The cached chain, building it on first use.
    pub async fn get(&self) -> Result<Arc<RagChain>> {
        if let Some(chain) = self.cached().await {
            return Ok(chain);
        }

        let _building = self.building.lock().await;
        if let Some(chain) = self.cached().await {
            return Ok(chain);
        }
        let fingerprint = self.factory.fingerprint().await?;
        let chain = Arc::new(self.factory.build().await?);
        info!(fingerprint = %fingerprint, collection = chain.collection(), "chain ready");
        *self.current.write().await = Some(CachedChain { fingerprint, chain: chain.clone() });
        Ok(chain)
    }

    /// Rebuilds the chain if its configuration changed since it was built.
    ///
    /// The previous chain keeps serving while the new one is built, and stays
    /// in service if the build fails.
    pub async fn reload(&self) -> Result<ReloadStatus> {
        let _building = self.building.lock().await;
        let fingerprint = self.factory.fingerprint().await?;
        let unchanged = self.current.read().await.as_ref().is_some_and(|c| c.fingerprint == fingerprint);
        if unchanged {
            return Ok(ReloadStatus { rebuilt: false, fingerprint });
        }

        let chain = Arc::new(self.factory.build().await?);
        info!(fingerprint = %fingerprint, "chain rebuilt after configuration change");
        *self.current.write().await = Some(CachedChain { fingerprint: fingerprint.clone(), chain });
        Ok(ReloadStatus { rebuilt: true, fingerprint })
    }
}
