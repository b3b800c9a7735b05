//! Embedding model ownership and inference scheduling.
//!
//! - The backend is loaded once, on first use, on the blocking pool
//! - Concurrent loads share one in-flight attempt; a failed attempt is not
//!   remembered and the next caller retries
//! - Inference goes through a FIFO async mutex held for one call at a time,
//!   because backends keep mutable session state

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fastembed::{InitOptions, TextEmbedding};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::search::preprocess::truncate_for_embedding;

/// Error type for embedding operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Model is not loaded")]
    ModelNotLoaded,

    #[error("Embedding generation failed: {0}")]
    Inference(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// A loaded model able to embed one text at a time.
pub trait EmbeddingBackend: Send {
    fn embed(&mut self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
    fn dimensions(&self) -> usize;
}

/// Produces a backend. `load` blocks (downloads, ONNX session setup).
pub trait ModelLoader: Send + Sync {
    /// Stable name; its hash tags persisted vectors.
    fn name(&self) -> &str;
    fn load(&self) -> Result<Box<dyn EmbeddingBackend>, EmbeddingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Ready,
}

struct LoadedModel {
    backend: Arc<tokio::sync::Mutex<Box<dyn EmbeddingBackend>>>,
    dimensions: usize,
}

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<LoadedModel>, String>>>;

enum ModelState {
    Unloaded,
    Loading { attempt: u64, load: SharedLoad },
    Ready(Arc<LoadedModel>),
}

pub struct EmbeddingModel {
    loader: Arc<dyn ModelLoader>,
    state: Mutex<ModelState>,
    attempts: AtomicU64,
    load_timeout: Option<Duration>,
}

impl EmbeddingModel {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            state: Mutex::new(ModelState::Unloaded),
            attempts: AtomicU64::new(0),
            load_timeout: None,
        }
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        self.loader.name()
    }

    /// SHA256 of the model name, stored in vector files.
    pub fn model_id(&self) -> [u8; 32] {
        model_id_hash(self.loader.name())
    }

    fn lock_state(&self) -> MutexGuard<'_, ModelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ModelStatus {
        match &*self.lock_state() {
            ModelState::Unloaded => ModelStatus::Unloaded,
            ModelState::Loading { .. } => ModelStatus::Loading,
            ModelState::Ready(_) => ModelStatus::Ready,
        }
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.ready().map(|m| m.dimensions)
    }

    fn ready(&self) -> Option<Arc<LoadedModel>> {
        match &*self.lock_state() {
            ModelState::Ready(model) => Some(model.clone()),
            _ => None,
        }
    }

    /// Load the model if needed. Idempotent once it succeeded.
    pub async fn ensure_loaded(&self) -> Result<(), EmbeddingError> {
        self.loaded().await.map(|_| ())
    }

    async fn loaded(&self) -> Result<Arc<LoadedModel>, EmbeddingError> {
        let (attempt, load) = {
            let mut state = self.lock_state();
            if let ModelState::Ready(model) = &*state {
                return Ok(model.clone());
            }

            if let ModelState::Loading { attempt, load } = &*state {
                (*attempt, load.clone())
            } else {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
                let load = self.start_load();
                *state = ModelState::Loading {
                    attempt,
                    load: load.clone(),
                };
                (attempt, load)
            }
        };

        let result = load.await;

        {
            let mut state = self.lock_state();
            let current = matches!(&*state, ModelState::Loading { attempt: a, .. } if *a == attempt);
            if current {
                *state = match &result {
                    Ok(model) => {
                        log::info!(
                            "embedding model '{}' ready ({} dimensions)",
                            self.loader.name(),
                            model.dimensions
                        );
                        ModelState::Ready(model.clone())
                    }
                    Err(e) => {
                        log::warn!("embedding model '{}' failed to load: {e}", self.loader.name());
                        ModelState::Unloaded
                    }
                };
            }
        }

        result.map_err(EmbeddingError::ModelLoad)
    }

    fn start_load(&self) -> SharedLoad {
        log::info!("loading embedding model '{}'", self.loader.name());

        let loader = self.loader.clone();
        let timeout = self.load_timeout;
        let handle = tokio::task::spawn_blocking(move || loader.load());

        async move {
            let joined = match timeout {
                Some(limit) => tokio::time::timeout(limit, handle)
                    .await
                    .map_err(|_| format!("timed out after {} seconds", limit.as_secs()))?,
                None => handle.await,
            };

            let backend = joined
                .map_err(|e| format!("load task failed: {e}"))?
                .map_err(|e| e.to_string())?;
            let dimensions = backend.dimensions();

            Ok::<_, String>(Arc::new(LoadedModel {
                backend: Arc::new(tokio::sync::Mutex::new(backend)),
                dimensions,
            }))
        }
        .boxed()
        .shared()
    }

    /// Embed `text`, loading the model first if needed.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let model = self.loaded().await?;
        Self::infer(model, text).await
    }

    /// Embed `text` only if the model is already loaded.
    pub async fn embed_if_ready(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let model = self.ready().ok_or(EmbeddingError::ModelNotLoaded)?;
        Self::infer(model, text).await
    }

    async fn infer(model: Arc<LoadedModel>, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let input = truncate_for_embedding(text).to_string();

        // queued callers are served in arrival order
        let mut backend = model.backend.clone().lock_owned().await;
        let vector = tokio::task::spawn_blocking(move || backend.embed(&input))
            .await
            .map_err(|e| EmbeddingError::Internal(format!("inference task failed: {e}")))??;

        if vector.len() != model.dimensions {
            return Err(EmbeddingError::Inference(format!(
                "backend returned {} dimensions, expected {}",
                vector.len(),
                model.dimensions
            )));
        }

        Ok(vector)
    }
}

pub fn model_id_hash(name: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.finalize().into()
}

/// Loads ONNX models through fastembed.
pub struct FastembedLoader {
    model_name: String,
    cache_dir: PathBuf,
}

impl FastembedLoader {
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        parse_model_name(model_name)?;
        Ok(Self {
            model_name: model_name.to_string(),
            cache_dir,
        })
    }
}

impl ModelLoader for FastembedLoader {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn load(&self) -> Result<Box<dyn EmbeddingBackend>, EmbeddingError> {
        let model_enum = parse_model_name(&self.model_name)?;

        let models_dir = self.cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::ModelLoad(format!("Failed to create models directory: {}", e))
        })?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let mut model =
            TextEmbedding::try_new(options).map_err(|e| EmbeddingError::ModelLoad(e.to_string()))?;

        let dimensions = probe_dimensions(&mut model)?;

        Ok(Box::new(FastembedBackend { model, dimensions }))
    }
}

struct FastembedBackend {
    model: TextEmbedding,
    dimensions: usize,
}

impl EmbeddingBackend for FastembedBackend {
    fn embed(&mut self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let embeddings = self
            .model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::Inference(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Inference("No embedding returned".to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Parse model name string to fastembed enum.
fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "all-minilm-l6-v2-q" | "allminiml6v2q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
        "paraphrase-multilingual-minilm-l12-v2" | "paraphrasemlminilml12v2" => {
            Ok(fastembed::EmbeddingModel::ParaphraseMLMiniLML12V2)
        }
        "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "multilingual-e5-small" | "multilinguale5small" => {
            Ok(fastembed::EmbeddingModel::MultilingualE5Small)
        }
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown model: {}. Supported models: all-MiniLM-L6-v2, paraphrase-multilingual-MiniLM-L12-v2, bge-small-en-v1.5, bge-base-en-v1.5, multilingual-e5-small (add -q to MiniLM for quantized), hash",
            name
        ))),
    }
}

/// Probe the model to determine embedding dimensions.
fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
    let test_embeddings = model
        .embed(vec!["test"], None)
        .map_err(|e| EmbeddingError::ModelLoad(format!("Failed to probe dimensions: {}", e)))?;

    test_embeddings
        .first()
        .map(|v| v.len())
        .ok_or_else(|| EmbeddingError::ModelLoad("Model returned no embedding".to_string()))
}
