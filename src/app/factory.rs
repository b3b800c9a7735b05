use crate::{
    app::Pantry,
    config::Config,
    records::BackendCsv,
    search::{embeddings::ModelLoader, FastembedLoader, HashLoader, HASH_MODEL_NAME},
};
use anyhow::{Context, Result};
use homedir::my_home;
use std::path::PathBuf;
use std::sync::Arc;

/// Application factory for wiring the store, indexes and model together
pub struct AppFactory;

impl AppFactory {
    /// Open the pantry at `paths` with its config, CSV record store and
    /// persisted indexes.
    pub fn open(paths: &AppPaths) -> Result<Pantry> {
        let config = Config::load_with(&paths.base_path)?;

        let store = BackendCsv::load(&paths.records_path).context("failed to load records")?;

        let loader = if config.semantic.enabled {
            Some(Self::create_loader(&config, paths)?)
        } else {
            None
        };

        Pantry::with_parts(config, Arc::new(store), loader, Some(paths.index_path.clone()))
    }

    /// Pick the embedding backend named in the config.
    pub fn create_loader(config: &Config, paths: &AppPaths) -> Result<Arc<dyn ModelLoader>> {
        let model = config.semantic.model.trim();
        if model.eq_ignore_ascii_case(HASH_MODEL_NAME) {
            return Ok(Arc::new(HashLoader::default()));
        }

        let loader = FastembedLoader::new(model, paths.base_path.clone())
            .context("semantic.model is not a supported embedding model")?;
        Ok(Arc::new(loader))
    }

    /// Get application paths, creating the base directory
    pub fn get_paths() -> Result<AppPaths> {
        let base_path = Self::get_base_path()?;

        std::fs::create_dir_all(&base_path)
            .context("Failed to create application base directory")?;

        Ok(AppPaths::new(base_path))
    }

    /// `PANTRY_BASE_PATH`, or `~/.local/share/pantry`
    fn get_base_path() -> Result<PathBuf> {
        if let Ok(base_path) = std::env::var("PANTRY_BASE_PATH") {
            return Ok(PathBuf::from(base_path));
        }

        let home = my_home()
            .context("Could not determine home directory")?
            .context("Home directory path is empty")?;
        Ok(home.join(".local").join("share").join("pantry"))
    }
}

/// Application paths structure
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: PathBuf,
    pub records_path: PathBuf,
    pub index_path: PathBuf,
}

impl AppPaths {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            records_path: base_path.clone(),
            index_path: base_path.join("index"),
            base_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_paths() {
        let paths = AppPaths::new(PathBuf::from("/test/base"));

        assert_eq!(paths.base_path, PathBuf::from("/test/base"));
        assert_eq!(paths.records_path, PathBuf::from("/test/base"));
        assert_eq!(paths.index_path, PathBuf::from("/test/base/index"));
    }

    #[test]
    fn test_create_loader() {
        let paths = AppPaths::new(std::env::temp_dir());

        let mut config = Config::default();
        config.semantic.model = "hash".to_string();
        let loader = AppFactory::create_loader(&config, &paths).unwrap();
        assert_eq!(loader.name(), "hash-384");

        config.semantic.model = "all-MiniLM-L6-v2".to_string();
        let loader = AppFactory::create_loader(&config, &paths).unwrap();
        assert_eq!(loader.name(), "all-MiniLM-L6-v2");

        config.semantic.model = "word2vec".to_string();
        assert!(AppFactory::create_loader(&config, &paths).is_err());
    }

    #[tokio::test]
    async fn test_open_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.yaml"),
            "semantic:\n  model: hash\n",
        )
        .unwrap();
        let paths = AppPaths::new(tmp.path().to_path_buf());

        let pantry = AppFactory::open(&paths).unwrap();
        assert!(tmp.path().join("foods.csv").exists());
        assert!(tmp.path().join("user_foods.csv").exists());
        assert!(tmp.path().join("index").is_dir());
        assert!(pantry.search("anything").await.is_empty());
    }
}
