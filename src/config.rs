use crate::{
    semantic::{DimensionPolicy, ProviderKind},
    storage::{self, StorageManager},
};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

const DEFAULT_GEMINI_MODEL: &str = "text-embedding-004";
const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Provider call timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Similarity floor for the "similar questions" feature
const DEFAULT_SIMILAR_THRESHOLD: f32 = 0.7;
const DEFAULT_SIMILAR_LIMIT: usize = 5;
/// Similarity floor for the vector channel of hybrid search
const DEFAULT_SEARCH_THRESHOLD: f32 = 0.5;
const DEFAULT_VECTOR_WEIGHT: f32 = 0.5;

const DEFAULT_CACHE_CAPACITY: usize = 1000;
const DEFAULT_CACHE_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_CACHE_SWEEP_SECS: u64 = 60 * 60;

/// Embedding cache sizing
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Entries older than this are treated as absent
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// How often the background sweep purges expired entries
    #[serde(default = "default_cache_sweep_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
            sweep_interval_secs: DEFAULT_CACHE_SWEEP_SECS,
        }
    }
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

fn default_cache_sweep_secs() -> u64 {
    DEFAULT_CACHE_SWEEP_SECS
}

/// Configuration for embedding generation and similarity search
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SemanticSearchConfig {
    /// Active embedding provider. `EMBEDDING_PROVIDER` overrides it.
    #[serde(default)]
    pub provider: ProviderKind,

    /// Vector length override. Defaults to the provider's native size.
    #[serde(default)]
    pub dimensions: Option<usize>,

    /// What to do when a provider returns a vector of the wrong length.
    /// Defaults to the provider's own policy.
    #[serde(default)]
    pub dimension_policy: Option<DimensionPolicy>,

    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,

    #[serde(default = "default_openai_model")]
    pub openai_model: String,

    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: String,

    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_similar_threshold")]
    pub similar_threshold: f32,

    #[serde(default = "default_similar_limit")]
    pub similar_limit: usize,

    #[serde(default = "default_search_threshold")]
    pub search_threshold: f32,

    /// Weight of the vector channel in hybrid search [0.0, 1.0]
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,

    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for SemanticSearchConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            dimensions: None,
            dimension_policy: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            similar_threshold: DEFAULT_SIMILAR_THRESHOLD,
            similar_limit: DEFAULT_SIMILAR_LIMIT,
            search_threshold: DEFAULT_SEARCH_THRESHOLD,
            vector_weight: DEFAULT_VECTOR_WEIGHT,
            cache: CacheConfig::default(),
        }
    }
}

impl SemanticSearchConfig {
    /// Vector length every stored and query embedding must have.
    pub fn expected_dimensions(&self) -> usize {
        self.dimensions
            .unwrap_or_else(|| self.provider.default_dimensions())
    }

    pub fn effective_dimension_policy(&self) -> DimensionPolicy {
        self.dimension_policy
            .unwrap_or_else(|| self.provider.default_dimension_policy())
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("similar_threshold", self.similar_threshold),
            ("search_threshold", self.search_threshold),
            ("vector_weight", self.vector_weight),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("semantic_search.{name} must be between 0.0 and 1.0, got {value}");
            }
        }

        if self.similar_limit == 0 {
            bail!("semantic_search.similar_limit must be greater than 0");
        }

        if let Some(0) = self.dimensions {
            bail!("semantic_search.dimensions must be greater than 0");
        }

        if self.request_timeout_secs == 0 {
            bail!("semantic_search.request_timeout_secs must be greater than 0");
        }

        for (name, value) in [
            ("gemini_base_url", &self.gemini_base_url),
            ("openai_base_url", &self.openai_base_url),
        ] {
            url::Url::parse(value)
                .with_context(|| format!("semantic_search.{name} is not a valid url: {value}"))?;
        }

        if self.cache.capacity == 0 {
            bail!("semantic_search.cache.capacity must be greater than 0");
        }
        if self.cache.ttl_secs == 0 || self.cache.sweep_interval_secs == 0 {
            bail!("semantic_search.cache ttl and sweep interval must be greater than 0");
        }

        Ok(())
    }
}

fn default_gemini_model() -> String {
    DEFAULT_GEMINI_MODEL.to_string()
}

fn default_openai_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_gemini_base_url() -> String {
    DEFAULT_GEMINI_BASE_URL.to_string()
}

fn default_openai_base_url() -> String {
    DEFAULT_OPENAI_BASE_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_similar_threshold() -> f32 {
    DEFAULT_SIMILAR_THRESHOLD
}

fn default_similar_limit() -> usize {
    DEFAULT_SIMILAR_LIMIT
}

fn default_search_threshold() -> f32 {
    DEFAULT_SEARCH_THRESHOLD
}

fn default_vector_weight() -> f32 {
    DEFAULT_VECTOR_WEIGHT
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Shared secret the upstream application sends as a bearer token.
    /// When unset the identity headers are accepted from anyone.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Attach provider/store error details to degraded responses
    #[serde(default)]
    pub debug_errors: bool,

    #[serde(default)]
    pub semantic_search: SemanticSearchConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            auth_token: None,
            debug_errors: false,
            semantic_search: SemanticSearchConfig::default(),
            base_path: String::new(),
        }
    }
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            bail!("listen_addr must be host:port, got {:?}", self.listen_addr);
        }

        if let Some(token) = &self.auth_token {
            if token.trim().is_empty() {
                bail!("auth_token must not be blank");
            }
        }

        self.semantic_search.validate()
    }

    /// Reads the process environment on top of the file values.
    /// API keys are never read from the file.
    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Ok(provider) = std::env::var("EMBEDDING_PROVIDER") {
            if !provider.trim().is_empty() {
                self.semantic_search.provider = provider
                    .parse()
                    .context("EMBEDDING_PROVIDER is invalid")?;
            }
        }

        if let Ok(token) = std::env::var("QA_SEARCH_AUTH_TOKEN") {
            if !token.trim().is_empty() {
                self.auth_token = Some(token);
            }
        }

        if let Ok(addr) = std::env::var("QA_SEARCH_LISTEN") {
            if !addr.trim().is_empty() {
                self.listen_addr = addr;
            }
        }

        Ok(())
    }

    pub fn load_with(base_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let store = storage::BackendLocal::new(base_path.as_ref())?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            log::info!("writing default config to {:?}", store.base_dir.join(CONFIG_FILE));
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.as_ref().to_string_lossy().to_string();

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        config.apply_env()?;
        config.validate()?;

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }
}

/// `QA_SEARCH_BASE_PATH`, or `~/.local/share/qa-search`.
pub fn default_base_path() -> anyhow::Result<String> {
    if let Ok(path) = std::env::var("QA_SEARCH_BASE_PATH") {
        return Ok(path);
    }

    let home = homedir::my_home()?.context("couldnt find home dir")?;
    Ok(format!("{}/.local/share/qa-search", home.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SemanticSearchConfig::default();
        assert_eq!(config.provider, ProviderKind::Gemini);
        assert_eq!(config.expected_dimensions(), 768);
        assert_eq!(config.effective_dimension_policy(), DimensionPolicy::Warn);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.max_retries, 2);
        assert!((config.similar_threshold - 0.7).abs() < f32::EPSILON);
        assert!((config.search_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.cache.ttl_secs, 86_400);
    }

    #[test]
    fn test_dimension_override() {
        let config = SemanticSearchConfig {
            provider: ProviderKind::OpenAi,
            ..Default::default()
        };
        assert_eq!(config.expected_dimensions(), 1536);
        assert_eq!(config.effective_dimension_policy(), DimensionPolicy::Strict);

        let config = SemanticSearchConfig {
            provider: ProviderKind::OpenAi,
            dimensions: Some(768),
            dimension_policy: Some(DimensionPolicy::Warn),
            ..Default::default()
        };
        assert_eq!(config.expected_dimensions(), 768);
        assert_eq!(config.effective_dimension_policy(), DimensionPolicy::Warn);
    }

    #[test]
    fn test_load_creates_default_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_with(tmp.path()).unwrap();

        assert!(tmp.path().join("config.yaml").exists());
        assert_eq!(config.semantic_search.similar_limit, 5);
    }

    #[test]
    fn test_load_fills_missing_fields() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.yaml"),
            "semantic_search:\n  vector_weight: 0.8\n",
        )
        .unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert!((config.semantic_search.vector_weight - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.semantic_search.cache.capacity, 1000);

        let upgraded = std::fs::read_to_string(tmp.path().join("config.yaml")).unwrap();
        assert!(upgraded.contains("similar_threshold"));
    }

    #[test]
    fn test_rejects_out_of_range_weight() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.yaml"),
            "semantic_search:\n  vector_weight: 1.5\n",
        )
        .unwrap();

        let err = Config::load_with(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("vector_weight"));
    }

    #[test]
    fn test_rejects_zero_cache_capacity() {
        let mut config = SemanticSearchConfig::default();
        config.cache.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_base_url() {
        let config = SemanticSearchConfig {
            openai_base_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
