use crate::{
    config::{self, Config},
    questions::JsonStore,
    semantic::{Credentials, Embedder, EmbeddingCache, SearchService, TextEmbedder},
};
use anyhow::Context;
use std::{sync::Arc, time::Duration};

pub type QaService = SearchService<JsonStore, Embedder>;

/// Everything a command or the daemon needs, wired from one config.
pub struct App {
    pub config: Config,
    pub cache: Arc<EmbeddingCache>,
    pub service: Arc<QaService>,
}

impl App {
    /// Loads config and questions from `QA_SEARCH_BASE_PATH` (or the
    /// default data dir) and builds the service.
    pub fn load() -> anyhow::Result<Self> {
        let base_path = config::default_base_path()?;
        std::fs::create_dir_all(&base_path)
            .with_context(|| format!("failed to create base directory {base_path}"))?;

        let config = Config::load_with(&base_path)?;
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let store = Arc::new(JsonStore::load(config.base_path())?);
        log::info!("loaded {} questions", store.len());

        let semantic = &config.semantic_search;
        let cache = Arc::new(EmbeddingCache::new(
            semantic.cache.capacity,
            Duration::from_secs(semantic.cache.ttl_secs),
        ));

        log::debug!(
            "embedding with {} at {} dimensions ({:?} policy)",
            semantic.provider,
            semantic.expected_dimensions(),
            semantic.effective_dimension_policy()
        );

        let credentials = Credentials::from_env();
        log::debug!("embedding credentials: {credentials:?}");

        let embedder = Embedder::new(semantic, credentials, cache.clone())?;
        if !embedder.is_available() {
            log::warn!(
                "{} is not set, similar questions and vector search are disabled",
                semantic.provider.api_key_var()
            );
        }

        let service = Arc::new(SearchService::new(
            semantic.clone(),
            store,
            Arc::new(embedder),
        ));

        Ok(Self {
            config,
            cache,
            service,
        })
    }
}
