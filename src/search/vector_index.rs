//! In-memory vector index with cosine distance search.
//!
//! A [`VectorSpace`] holds the embeddings of one namespace; [`VectorIndex`]
//! keeps one space per namespace behind a lock and owns their files.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::records::Namespace;
use crate::search::vector_storage::{VectorStorage, VectorStorageError};

/// An entry in the vector index.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    /// Hash of the text that was embedded
    pub content_hash: u64,
    pub embedding: Vec<f32>,
    norm: f32,
}

/// A k-NN result. `distance` is cosine distance in `[0, 2]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: u64,
    pub distance: f32,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorIndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm or NaN vector")]
    ZeroNormVector,
}

/// Embeddings of a single namespace.
///
/// The dimension is fixed by the first insert (or by the file it was loaded
/// from); every later vector must match it.
#[derive(Debug, Default)]
pub struct VectorSpace {
    entries: HashMap<u64, VectorEntry>,
    dimensions: Option<usize>,
}

impl VectorSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dimensions(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            dimensions: Some(dimensions),
        }
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&VectorEntry> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &VectorEntry)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    fn check_dimensions(&self, got: usize) -> Result<(), VectorIndexError> {
        match self.dimensions {
            Some(expected) if expected != got => {
                Err(VectorIndexError::DimensionMismatch { expected, got })
            }
            _ => Ok(()),
        }
    }

    /// Insert or replace an entry. On error nothing changes.
    pub fn insert(
        &mut self,
        id: u64,
        content_hash: u64,
        embedding: Vec<f32>,
    ) -> Result<(), VectorIndexError> {
        self.check_dimensions(embedding.len())?;

        let norm = l2_norm(&embedding);
        if norm.is_nan() || norm < f32::EPSILON {
            return Err(VectorIndexError::ZeroNormVector);
        }

        self.dimensions = Some(embedding.len());
        self.entries.insert(
            id,
            VectorEntry {
                content_hash,
                embedding,
                norm,
            },
        );

        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<VectorEntry> {
        self.entries.remove(&id)
    }

    /// The `k` nearest entries by cosine distance, ascending, ties by id.
    pub fn knn(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, VectorIndexError> {
        if self.entries.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        self.check_dimensions(query.len())?;

        let query_norm = l2_norm(query);
        if query_norm.is_nan() || query_norm < f32::EPSILON {
            return Err(VectorIndexError::ZeroNormVector);
        }

        let mut results: Vec<Neighbor> = self
            .entries
            .iter()
            .map(|(id, entry)| {
                let dot: f32 = query
                    .iter()
                    .zip(entry.embedding.iter())
                    .map(|(a, b)| a * b)
                    .sum();
                let cos = dot / (query_norm * entry.norm);
                Neighbor {
                    id: *id,
                    distance: (1.0 - cos).clamp(0.0, 2.0),
                }
            })
            .collect();

        results.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
        results.truncate(k);

        Ok(results)
    }
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

struct VectorFiles {
    dir: PathBuf,
    model_id: [u8; 32],
}

impl VectorFiles {
    fn storage(&self, ns: Namespace) -> VectorStorage {
        VectorStorage::new(self.dir.join(VectorIndex::file_name(ns)))
    }
}

/// Vector partitions for every namespace.
pub struct VectorIndex {
    partitions: [RwLock<VectorSpace>; 2],
    files: Option<VectorFiles>,
}

fn slot(ns: Namespace) -> usize {
    match ns {
        Namespace::Default => 0,
        Namespace::User => 1,
    }
}

impl VectorIndex {
    pub fn in_memory() -> Self {
        Self {
            partitions: std::array::from_fn(|_| RwLock::default()),
            files: None,
        }
    }

    /// Open the index under `dir`. Partition files written by a different
    /// model, an unknown format version or with a bad checksum are dropped
    /// and start empty.
    pub fn open(dir: &Path, model_id: [u8; 32]) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;

        let files = VectorFiles {
            dir: dir.to_path_buf(),
            model_id,
        };

        let partitions = std::array::from_fn(|idx| {
            let ns = Namespace::ALL[idx];
            let storage = files.storage(ns);
            if !storage.exists() {
                return RwLock::default();
            }

            match storage.load(&files.model_id) {
                Ok(space) => {
                    log::info!("loaded {} vectors for {ns}", space.len());
                    RwLock::new(space)
                }
                Err(VectorStorageError::ModelMismatch) => {
                    log::warn!("embedding model changed, starting fresh {ns} vectors");
                    RwLock::default()
                }
                Err(e) => {
                    log::warn!("discarding {ns} vectors: {e}");
                    RwLock::default()
                }
            }
        });

        Ok(Self {
            partitions,
            files: Some(files),
        })
    }

    pub fn file_name(ns: Namespace) -> String {
        format!("vectors-{ns}.bin")
    }

    fn read(&self, ns: Namespace) -> RwLockReadGuard<'_, VectorSpace> {
        self.partitions[slot(ns)]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, ns: Namespace) -> RwLockWriteGuard<'_, VectorSpace> {
        self.partitions[slot(ns)]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upsert(
        &self,
        ns: Namespace,
        id: u64,
        content_hash: u64,
        embedding: Vec<f32>,
    ) -> Result<(), VectorIndexError> {
        self.write(ns).insert(id, content_hash, embedding)
    }

    pub fn remove(&self, ns: Namespace, id: u64) -> bool {
        self.write(ns).remove(id).is_some()
    }

    pub fn knn(
        &self,
        ns: Namespace,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<Neighbor>, VectorIndexError> {
        self.read(ns).knn(query, k)
    }

    /// Ids from `all_ids` without a vector, in input order.
    pub fn list_ids_missing(&self, ns: Namespace, all_ids: &[u64]) -> Vec<u64> {
        let space = self.read(ns);
        all_ids
            .iter()
            .copied()
            .filter(|id| !space.contains(*id))
            .collect()
    }

    /// Ids that have a vector whose content hash differs from the given one.
    pub fn list_ids_stale(&self, ns: Namespace, current: &[(u64, u64)]) -> Vec<u64> {
        let space = self.read(ns);
        current
            .iter()
            .filter(|(id, hash)| {
                space
                    .get(*id)
                    .is_some_and(|entry| entry.content_hash != *hash)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drop every entry whose id is not in `keep`. Returns how many went.
    pub fn retain(&self, ns: Namespace, keep: &HashSet<u64>) -> usize {
        let mut space = self.write(ns);
        let before = space.len();
        space.entries.retain(|id, _| keep.contains(id));
        before - space.len()
    }

    pub fn contains(&self, ns: Namespace, id: u64) -> bool {
        self.read(ns).contains(id)
    }

    pub fn content_hash(&self, ns: Namespace, id: u64) -> Option<u64> {
        self.read(ns).get(id).map(|e| e.content_hash)
    }

    pub fn len(&self, ns: Namespace) -> usize {
        self.read(ns).len()
    }

    pub fn dimensions(&self, ns: Namespace) -> Option<usize> {
        self.read(ns).dimensions()
    }

    /// Save the namespace partition. No-op for an in-memory index.
    pub fn persist(&self, ns: Namespace) -> Result<(), VectorStorageError> {
        let Some(files) = &self.files else {
            return Ok(());
        };

        let space = self.read(ns);
        files.storage(ns).save(&space, &files.model_id)
    }
}
