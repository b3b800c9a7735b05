//! The assembled application: record store plus the search subsystem.

pub mod factory;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;

use crate::{
    config::Config,
    records::{Namespace, Record, RecordCreate, RecordStore, RecordUpdate},
    search::{
        embeddings::model_id_hash, BackfillHandle, BackfillOutcome, DefaultTokenizer,
        EmbeddingModel, HybridSearchEngine, IndexingCoordinator, ModelLoader, ModelStatus,
        SearchError, SearchHit, SearchLimits, TextIndex, VectorIndex,
    },
    storage::BackendLocal,
};

pub use factory::{AppFactory, AppPaths};

#[derive(Debug, Clone, Serialize)]
pub struct NamespaceStatus {
    pub namespace: Namespace,
    pub records: usize,
    pub text_entries: usize,
    pub vector_entries: usize,
    pub missing_vectors: usize,
    pub dimensions: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub model: Option<String>,
    pub model_status: Option<ModelStatus>,
    pub backfill_running: bool,
    pub namespaces: Vec<NamespaceStatus>,
}

pub struct Pantry {
    config: Config,
    store: Arc<dyn RecordStore>,
    text: Arc<TextIndex>,
    vectors: Arc<VectorIndex>,
    model: Option<Arc<EmbeddingModel>>,
    coordinator: Arc<IndexingCoordinator>,
    engine: HybridSearchEngine,
}

impl Pantry {
    /// Assemble from parts. `loader` is ignored when semantic search is
    /// disabled; indexes are kept in memory when `index_dir` is `None`.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn RecordStore>,
        loader: Option<Arc<dyn ModelLoader>>,
        index_dir: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let model = loader
            .filter(|_| config.semantic.enabled)
            .map(|loader| {
                Arc::new(
                    EmbeddingModel::new(loader).with_load_timeout(Duration::from_secs(
                        config.semantic.download_timeout_secs,
                    )),
                )
            });

        let tokenizer = Arc::new(DefaultTokenizer);
        let (text, vectors) = match &index_dir {
            Some(dir) => {
                let storage = BackendLocal::new(dir)
                    .with_context(|| format!("failed to open index directory {}", dir.display()))?;
                let model_id = model
                    .as_ref()
                    .map(|m| m.model_id())
                    .unwrap_or_else(|| model_id_hash(""));

                (
                    TextIndex::open(Arc::new(storage), tokenizer, config.search.lexical_cap),
                    VectorIndex::open(dir, model_id)?,
                )
            }
            None => (
                TextIndex::in_memory(tokenizer, config.search.lexical_cap),
                VectorIndex::in_memory(),
            ),
        };
        let text = Arc::new(text);
        let vectors = Arc::new(vectors);

        let coordinator = Arc::new(IndexingCoordinator::new(
            store.clone(),
            text.clone(),
            vectors.clone(),
            model.clone(),
            config.indexing.save_every,
        ));

        let engine = HybridSearchEngine::new(
            store.clone(),
            text.clone(),
            vectors.clone(),
            model.clone(),
            SearchLimits::from_config(&config),
        );

        Ok(Self {
            config,
            store,
            text,
            vectors,
            model,
            coordinator,
            engine,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn model(&self) -> Option<&Arc<EmbeddingModel>> {
        self.model.as_ref()
    }

    pub fn coordinator(&self) -> &Arc<IndexingCoordinator> {
        &self.coordinator
    }

    /// Start a background backfill of every namespace.
    pub fn start_backfill(&self) -> BackfillHandle {
        self.coordinator.spawn_backfill()
    }

    pub async fn backfill(&self) -> Result<BackfillOutcome, SearchError> {
        self.coordinator.backfill_all().await
    }

    /// Records matching `query`, lexical matches first. An empty query
    /// returns nothing and touches no index.
    pub async fn search(&self, query: &str) -> Vec<Record> {
        self.engine.search_records(query).await
    }

    pub async fn search_hits(&self, query: &str, lexical_only: bool) -> Vec<SearchHit> {
        let mut limits = self.engine.limits().clone();
        if lexical_only {
            limits = limits.lexical_only();
        }
        self.engine.search(&Namespace::ALL, query, &limits).await
    }

    pub fn hydrate(&self, hits: &[SearchHit]) -> Vec<Record> {
        self.engine.hydrate(hits)
    }

    pub async fn create(&self, ns: Namespace, create: RecordCreate) -> anyhow::Result<Record> {
        let record = self.store.create(ns, create)?;
        self.reindex(&record).await;
        Ok(record)
    }

    pub async fn update(
        &self,
        ns: Namespace,
        id: u64,
        update: RecordUpdate,
    ) -> anyhow::Result<Record> {
        let record = self.store.update(ns, id, update)?;
        self.reindex(&record).await;
        Ok(record)
    }

    pub fn delete(&self, ns: Namespace, id: u64) -> anyhow::Result<()> {
        self.store.delete(ns, id)?;
        self.coordinator.remove_one(ns, id);
        Ok(())
    }

    async fn reindex(&self, record: &Record) {
        if let Err(e) = self.coordinator.index_one(record).await {
            log::warn!(
                "record {}/{} saved but not fully indexed: {e}",
                record.kind,
                record.id
            );
        }
    }

    pub fn status(&self) -> anyhow::Result<Status> {
        let mut namespaces = Vec::with_capacity(Namespace::ALL.len());
        for ns in Namespace::ALL {
            let ids: Vec<u64> = self.store.list(ns)?.iter().map(|r| r.id).collect();
            namespaces.push(NamespaceStatus {
                namespace: ns,
                records: ids.len(),
                text_entries: self.text.len(ns),
                vector_entries: self.vectors.len(ns),
                missing_vectors: self.vectors.list_ids_missing(ns, &ids).len(),
                dimensions: self.vectors.dimensions(ns),
            });
        }

        Ok(Status {
            model: self.model.as_ref().map(|m| m.name().to_string()),
            model_status: self.model.as_ref().map(|m| m.status()),
            backfill_running: self.coordinator.is_running(),
            namespaces,
        })
    }
}
