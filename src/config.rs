use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    records::Namespace,
    storage::{self, StorageManager},
};

const CONFIG_FILE: &str = "config.yaml";

/// Default embedding model (384 dimensions, small enough for on-device use)
const DEFAULT_SEMANTIC_MODEL: &str = "all-MiniLM-L6-v2";
/// Semantic candidates farther than this cosine distance are dropped
const DEFAULT_MAX_DISTANCE: f32 = 0.6;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

const DEFAULT_LEXICAL_CAP: usize = 50;
const DEFAULT_KNN: usize = 40;
const DEFAULT_USER_KNN: usize = 20;
const DEFAULT_SAVE_EVERY: usize = 64;

/// Configuration for semantic search functionality
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SemanticConfig {
    /// Enable or disable the vector half of hybrid search
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Embedding model name (e.g., "all-MiniLM-L6-v2"), or "hash" for the
    /// offline hashing embedder
    #[serde(default = "default_semantic_model")]
    pub model: String,

    /// Cosine distance cutoff for semantic-only results [0.0, 2.0]
    #[serde(default = "default_max_distance")]
    pub max_distance: f32,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Load the model on the first query instead of waiting for a backfill
    #[serde(default = "default_true")]
    pub load_on_query: bool,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: DEFAULT_SEMANTIC_MODEL.to_string(),
            max_distance: DEFAULT_MAX_DISTANCE,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            load_on_query: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Maximum lexical matches returned per namespace
    #[serde(default = "default_lexical_cap")]
    pub lexical_cap: usize,

    /// Nearest neighbours requested from the default namespace
    #[serde(default = "default_knn")]
    pub default_knn: usize,

    /// Nearest neighbours requested from the user namespace
    #[serde(default = "default_user_knn")]
    pub user_knn: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            lexical_cap: DEFAULT_LEXICAL_CAP,
            default_knn: DEFAULT_KNN,
            user_knn: DEFAULT_USER_KNN,
        }
    }
}

impl SearchConfig {
    pub fn knn_for(&self, ns: Namespace) -> usize {
        match ns {
            Namespace::Default => self.default_knn,
            Namespace::User => self.user_knn,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Persist the vector partition after this many embedded records
    #[serde(default = "default_save_every")]
    pub save_every: usize,

    /// Start a background backfill when the store is opened by the CLI
    #[serde(default = "default_true")]
    pub backfill_on_start: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            save_every: DEFAULT_SAVE_EVERY,
            backfill_on_start: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_semantic_model() -> String {
    DEFAULT_SEMANTIC_MODEL.to_string()
}

fn default_max_distance() -> f32 {
    DEFAULT_MAX_DISTANCE
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_lexical_cap() -> usize {
    DEFAULT_LEXICAL_CAP
}

fn default_knn() -> usize {
    DEFAULT_KNN
}

fn default_user_knn() -> usize {
    DEFAULT_USER_KNN
}

fn default_save_every() -> usize {
    DEFAULT_SAVE_EVERY
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub semantic: SemanticConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let sem = &self.semantic;
        if !(0.0..=2.0).contains(&sem.max_distance) {
            anyhow::bail!(
                "semantic.max_distance must be between 0.0 and 2.0, got {}",
                sem.max_distance
            );
        }

        if sem.model.trim().is_empty() {
            anyhow::bail!("semantic.model must not be empty");
        }

        if sem.download_timeout_secs == 0 {
            anyhow::bail!("semantic.download_timeout_secs must be greater than 0");
        }

        if self.search.lexical_cap == 0 {
            anyhow::bail!("search.lexical_cap must be greater than 0");
        }

        if self.indexing.save_every == 0 {
            anyhow::bail!("indexing.save_every must be greater than 0");
        }

        Ok(())
    }

    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let store = storage::BackendLocal::new(base_path)
            .with_context(|| format!("failed to open {}", base_path.display()))?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(
                CONFIG_FILE,
                serde_yml::to_string(&Self::default())?.as_bytes(),
            )?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }
}
