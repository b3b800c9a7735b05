//! Keeps the text and vector indexes in step with the record store.
//!
//! A backfill rebuilds the text partitions from the store, then loads the
//! model and embeds every record that has no vector or whose content changed
//! since it was embedded.
//! Only one backfill runs at a time; a second request returns immediately.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::records::{Namespace, Record, RecordStore};
use crate::search::embeddings::EmbeddingModel;
use crate::search::preprocess::{content_hash, embedding_text};
use crate::search::text_index::{TextFields, TextIndex};
use crate::search::vector_index::VectorIndex;
use crate::search::SearchError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillStats {
    pub namespace: Namespace,
    /// Records in the rebuilt text partition
    pub text_entries: usize,
    /// Vectors written (missing plus stale)
    pub embedded: usize,
    /// Vectors re-embedded because their content changed
    pub refreshed: usize,
    /// Vectors dropped because their record is gone
    pub pruned: usize,
    /// Records with nothing to embed
    pub skipped: usize,
    pub failed: usize,
}

impl BackfillStats {
    fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            text_entries: 0,
            embedded: 0,
            refreshed: 0,
            pruned: 0,
            skipped: 0,
            failed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillOutcome {
    Completed(Vec<BackfillStats>),
    /// Another backfill held the guard; nothing was done.
    AlreadyRunning,
}

/// Clears the running flag when the backfill ends, however it ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A backfill running on the runtime.
pub struct BackfillHandle {
    inner: JoinHandle<Result<BackfillOutcome, SearchError>>,
}

impl BackfillHandle {
    pub async fn join(self) -> Result<BackfillOutcome, SearchError> {
        self.inner
            .await
            .map_err(|e| SearchError::Internal(format!("backfill task failed: {e}")))?
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

pub struct IndexingCoordinator {
    store: Arc<dyn RecordStore>,
    text: Arc<TextIndex>,
    vectors: Arc<VectorIndex>,
    /// `None` when semantic search is disabled
    model: Option<Arc<EmbeddingModel>>,
    save_every: usize,
    running: Arc<AtomicBool>,
}

impl IndexingCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        text: Arc<TextIndex>,
        vectors: Arc<VectorIndex>,
        model: Option<Arc<EmbeddingModel>>,
        save_every: usize,
    ) -> Self {
        Self {
            store,
            text,
            vectors,
            model,
            save_every: save_every.max(1),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn try_start(&self) -> Option<RunningGuard> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunningGuard(self.running.clone()))
    }

    /// Backfill a single namespace.
    pub async fn backfill(&self, ns: Namespace) -> Result<BackfillOutcome, SearchError> {
        let Some(_guard) = self.try_start() else {
            log::debug!("backfill already running, skipping {ns}");
            return Ok(BackfillOutcome::AlreadyRunning);
        };

        let stats = self.run_backfill(&[ns]).await?;
        Ok(BackfillOutcome::Completed(stats))
    }

    /// Backfill every namespace under one guard.
    pub async fn backfill_all(&self) -> Result<BackfillOutcome, SearchError> {
        let Some(_guard) = self.try_start() else {
            log::debug!("backfill already running");
            return Ok(BackfillOutcome::AlreadyRunning);
        };

        let stats = self.run_backfill(&Namespace::ALL).await?;
        Ok(BackfillOutcome::Completed(stats))
    }

    /// Run `backfill_all` on the runtime.
    pub fn spawn_backfill(self: &Arc<Self>) -> BackfillHandle {
        let this = self.clone();
        BackfillHandle {
            inner: tokio::spawn(async move { this.backfill_all().await }),
        }
    }

    /// Rebuilds the text partition of every namespace before the model is
    /// touched, so a load failure still leaves lexical search current.
    async fn run_backfill(&self, namespaces: &[Namespace]) -> Result<Vec<BackfillStats>, SearchError> {
        let mut passes = Vec::with_capacity(namespaces.len());
        for ns in namespaces {
            let _span = tracing::info_span!("backfill", namespace = %ns).entered();
            passes.push(self.rebuild_text(*ns)?);
        }

        let Some(model) = &self.model else {
            for (_, stats) in &passes {
                log::info!(
                    "{}: {} text entries, semantic search disabled",
                    stats.namespace,
                    stats.text_entries
                );
            }
            return Ok(passes.into_iter().map(|(_, stats)| stats).collect());
        };

        model.ensure_loaded().await?;

        let mut all = Vec::with_capacity(passes.len());
        for (records, stats) in passes {
            let span = tracing::info_span!("backfill", namespace = %stats.namespace);
            all.push(self.embed_missing(model, records, stats).instrument(span).await);
        }

        Ok(all)
    }

    fn rebuild_text(&self, ns: Namespace) -> Result<(Vec<Record>, BackfillStats), SearchError> {
        let mut stats = BackfillStats::new(ns);
        let records = self.store.list(ns).map_err(SearchError::store)?;

        self.text
            .rebuild(ns, records.iter().map(|r| (r.id, TextFields::from(r))));
        stats.text_entries = records.len();
        if let Err(e) = self.text.persist(ns) {
            log::warn!("failed to save {ns} text index: {e}");
        }

        Ok((records, stats))
    }

    /// Embeds every record with no vector or a stale one. Per-record
    /// failures are counted, not returned.
    async fn embed_missing(
        &self,
        model: &EmbeddingModel,
        records: Vec<Record>,
        mut stats: BackfillStats,
    ) -> BackfillStats {
        let ns = stats.namespace;

        let live: HashSet<u64> = records.iter().map(|r| r.id).collect();
        stats.pruned = self.vectors.retain(ns, &live);

        let mut prepared: Vec<(u64, String, u64)> = Vec::with_capacity(records.len());
        for record in &records {
            match embedding_text(record) {
                Some(text) => {
                    let hash = content_hash(&text);
                    prepared.push((record.id, text, hash));
                }
                None => {
                    stats.skipped += 1;
                    self.vectors.remove(ns, record.id);
                }
            }
        }

        let ids: Vec<u64> = prepared.iter().map(|(id, _, _)| *id).collect();
        let hashes: Vec<(u64, u64)> = prepared.iter().map(|(id, _, hash)| (*id, *hash)).collect();
        let missing = self.vectors.list_ids_missing(ns, &ids);
        let stale = self.vectors.list_ids_stale(ns, &hashes);
        stats.refreshed = stale.len();

        let todo: HashSet<u64> = missing.into_iter().chain(stale).collect();
        if !todo.is_empty() {
            log::info!("{ns}: embedding {} records", todo.len());
        }

        let mut unsaved = 0;
        for (id, text, hash) in prepared.into_iter().filter(|(id, _, _)| todo.contains(id)) {
            let result = match model.embed(&text).await {
                Ok(vector) => self.vectors.upsert(ns, id, hash, vector).map_err(SearchError::from),
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(()) => {
                    stats.embedded += 1;
                    unsaved += 1;
                }
                Err(e) => {
                    log::warn!("{ns}: failed to embed record {id}: {e}");
                    stats.failed += 1;
                }
            }

            if unsaved >= self.save_every {
                self.persist_vectors(ns);
                unsaved = 0;
            }
        }

        self.persist_vectors(ns);

        log::info!(
            "{ns}: {} text entries, {} embedded ({} refreshed), {} pruned, {} failed",
            stats.text_entries,
            stats.embedded,
            stats.refreshed,
            stats.pruned,
            stats.failed
        );

        stats
    }

    fn persist_vectors(&self, ns: Namespace) {
        if let Err(e) = self.vectors.persist(ns) {
            log::warn!("failed to save {ns} vectors: {e}");
        }
    }

    /// Index one created or updated record in both indexes.
    ///
    /// The text entry is always written. Embedding errors are returned after
    /// the text side is done.
    pub async fn index_one(&self, record: &Record) -> Result<(), SearchError> {
        let ns = record.kind;

        self.text.upsert(ns, record.id, TextFields::from(record));
        if let Err(e) = self.text.persist(ns) {
            log::warn!("failed to save {ns} text index: {e}");
        }

        let Some(model) = &self.model else {
            return Ok(());
        };

        let Some(text) = embedding_text(record) else {
            if self.vectors.remove(ns, record.id) {
                self.persist_vectors(ns);
            }
            return Err(SearchError::EmptyContent(record.id));
        };

        let vector = model.embed(&text).await?;
        self.vectors
            .upsert(ns, record.id, content_hash(&text), vector)?;
        self.persist_vectors(ns);

        Ok(())
    }

    /// Drop a deleted record from both indexes.
    pub fn remove_one(&self, ns: Namespace, id: u64) {
        if self.text.remove(ns, id) {
            if let Err(e) = self.text.persist(ns) {
                log::warn!("failed to save {ns} text index: {e}");
            }
        }

        if self.vectors.remove(ns, id) {
            self.persist_vectors(ns);
        }
    }
}
