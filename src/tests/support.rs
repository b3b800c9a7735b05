use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::anyhow;

use crate::records::{Namespace, Record, RecordCreate, RecordStore, RecordUpdate};
use crate::search::{
    DefaultTokenizer, EmbeddingBackend, EmbeddingError, EmbeddingModel, HybridSearchEngine,
    IndexingCoordinator, ModelLoader, SearchLimits, TextIndex, VectorIndex,
};

pub const DIMS: usize = 4;

/// Vector returned for any text without an explicit mapping.
pub const FALLBACK: [f32; DIMS] = [0.0, 0.0, 0.0, 1.0];

pub fn record(ns: Namespace, id: u64, name: &str) -> Record {
    Record {
        id,
        kind: ns,
        name: name.to_string(),
        alt_name: None,
        notes: None,
    }
}

/// Record store kept in memory, with caller-chosen ids.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Namespace, BTreeMap<u64, Record>>>,
}

impl MemoryStore {
    pub fn with(records: impl IntoIterator<Item = Record>) -> Self {
        let store = Self::default();
        for record in records {
            store.put(record);
        }
        store
    }

    pub fn put(&self, record: Record) {
        self.tables
            .write()
            .unwrap()
            .entry(record.kind)
            .or_default()
            .insert(record.id, record);
    }
}

fn apply(field: &mut Option<String>, value: Option<String>) {
    if let Some(value) = value {
        *field = (!value.is_empty()).then_some(value);
    }
}

impl RecordStore for MemoryStore {
    fn list(&self, ns: Namespace) -> anyhow::Result<Vec<Record>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .get(&ns)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    fn get_by_id(&self, ns: Namespace, id: u64) -> anyhow::Result<Option<Record>> {
        let tables = self.tables.read().unwrap();
        Ok(tables.get(&ns).and_then(|t| t.get(&id)).cloned())
    }

    fn create(&self, ns: Namespace, create: RecordCreate) -> anyhow::Result<Record> {
        let mut tables = self.tables.write().unwrap();
        let table = tables.entry(ns).or_default();
        let id = table.keys().next_back().map_or(1, |id| id + 1);
        let record = Record {
            id,
            kind: ns,
            name: create.name,
            alt_name: create.alt_name,
            notes: create.notes,
        };
        table.insert(id, record.clone());
        Ok(record)
    }

    fn update(&self, ns: Namespace, id: u64, update: RecordUpdate) -> anyhow::Result<Record> {
        let mut tables = self.tables.write().unwrap();
        let record = tables
            .get_mut(&ns)
            .and_then(|t| t.get_mut(&id))
            .ok_or_else(|| anyhow!("record {ns}/{id} not found"))?;

        if let Some(name) = update.name {
            record.name = name;
        }
        apply(&mut record.alt_name, update.alt_name);
        apply(&mut record.notes, update.notes);
        Ok(record.clone())
    }

    fn delete(&self, ns: Namespace, id: u64) -> anyhow::Result<()> {
        let mut tables = self.tables.write().unwrap();
        tables
            .get_mut(&ns)
            .and_then(|t| t.remove(&id))
            .map(|_| ())
            .ok_or_else(|| anyhow!("record {ns}/{id} not found"))
    }
}

/// Tracks how many inference calls run at once.
#[derive(Default)]
pub struct InferenceTracker {
    active: AtomicUsize,
    max: AtomicUsize,
    calls: AtomicUsize,
}

impl InferenceTracker {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Loader producing a table-driven backend. Texts map to fixed vectors.
pub struct FakeLoader {
    name: String,
    vectors: HashMap<String, Vec<f32>>,
    fail: AtomicBool,
    loads: AtomicUsize,
    load_delay: Duration,
    infer_delay: Duration,
    tracker: Arc<InferenceTracker>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self {
            name: "fake".to_string(),
            vectors: HashMap::new(),
            fail: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
            load_delay: Duration::ZERO,
            infer_delay: Duration::ZERO,
            tracker: Arc::new(InferenceTracker::default()),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn vector(mut self, text: &str, vector: [f32; DIMS]) -> Self {
        self.vectors.insert(text.to_string(), vector.to_vec());
        self
    }

    pub fn failing(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn infer_delay(mut self, delay: Duration) -> Self {
        self.infer_delay = delay;
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn tracker(&self) -> Arc<InferenceTracker> {
        self.tracker.clone()
    }
}

impl ModelLoader for FakeLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<Box<dyn EmbeddingBackend>, EmbeddingError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.load_delay);

        if self.fail.load(Ordering::SeqCst) {
            return Err(EmbeddingError::ModelLoad("fake model unavailable".to_string()));
        }

        Ok(Box::new(FakeBackend {
            vectors: self.vectors.clone(),
            infer_delay: self.infer_delay,
            tracker: self.tracker.clone(),
        }))
    }
}

struct FakeBackend {
    vectors: HashMap<String, Vec<f32>>,
    infer_delay: Duration,
    tracker: Arc<InferenceTracker>,
}

impl EmbeddingBackend for FakeBackend {
    fn embed(&mut self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.tracker.enter();
        std::thread::sleep(self.infer_delay);
        let vector = self
            .vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| FALLBACK.to_vec());
        self.tracker.exit();
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        DIMS
    }
}

/// Indexes, model, coordinator and engine wired over one store.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub text: Arc<TextIndex>,
    pub vectors: Arc<VectorIndex>,
    pub model: Option<Arc<EmbeddingModel>>,
    pub coordinator: Arc<IndexingCoordinator>,
    pub engine: HybridSearchEngine,
}

impl Harness {
    pub fn in_memory(store: MemoryStore, loader: Option<Arc<FakeLoader>>) -> Self {
        Self::build(
            Arc::new(store),
            loader,
            Arc::new(TextIndex::in_memory(Arc::new(DefaultTokenizer), 50)),
            |_| Arc::new(VectorIndex::in_memory()),
        )
    }

    /// Same wiring, with vector partitions persisted under `dir`.
    pub fn on_disk(store: Arc<MemoryStore>, loader: Arc<FakeLoader>, dir: &Path) -> Self {
        Self::build(
            store,
            Some(loader),
            Arc::new(TextIndex::in_memory(Arc::new(DefaultTokenizer), 50)),
            |model_id| Arc::new(VectorIndex::open(dir, model_id).unwrap()),
        )
    }

    fn build(
        store: Arc<MemoryStore>,
        loader: Option<Arc<FakeLoader>>,
        text: Arc<TextIndex>,
        vectors: impl FnOnce([u8; 32]) -> Arc<VectorIndex>,
    ) -> Self {
        let model = loader.map(|l| Arc::new(EmbeddingModel::new(l)));
        let model_id = model
            .as_ref()
            .map(|m| m.model_id())
            .unwrap_or_default();
        let vectors = vectors(model_id);

        let coordinator = Arc::new(IndexingCoordinator::new(
            store.clone(),
            text.clone(),
            vectors.clone(),
            model.clone(),
            2,
        ));
        let engine = HybridSearchEngine::new(
            store.clone(),
            text.clone(),
            vectors.clone(),
            model.clone(),
            SearchLimits::default(),
        );

        Self {
            store,
            text,
            vectors,
            model,
            coordinator,
            engine,
        }
    }

    pub async fn search_ids(&self, query: &str) -> Vec<(Namespace, u64)> {
        self.engine
            .search(&Namespace::ALL, query, self.engine.limits())
            .await
            .iter()
            .map(|h| (h.kind, h.id))
            .collect()
    }
}
