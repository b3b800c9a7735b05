//! Hybrid search infrastructure for food records.
//!
//! Keeps a full-text index and a vector index in step with the record store
//! and answers queries by merging both result sets.
//!
//! # Architecture
//!
//! - `tokenizer`: Pluggable tokenization and query parsing
//! - `text_index`: BM25 inverted index, one partition per namespace
//! - `embeddings`: Model loading and serialized inference
//! - `hash_embedder`: Offline FNV-1a embedding backend
//! - `vector_index`: In-memory cosine k-NN, one partition per namespace
//! - `vector_storage`: Binary file I/O for vector partitions
//! - `preprocess`: Embedding text and content hashing
//! - `coordinator`: Backfill and per-record indexing
//! - `engine`: Query execution and result merging

pub mod coordinator;
pub mod embeddings;
pub mod engine;
pub mod hash_embedder;
pub mod preprocess;
pub mod text_index;
pub mod tokenizer;
pub mod vector_index;
mod vector_storage;

pub use coordinator::{BackfillHandle, BackfillOutcome, BackfillStats, IndexingCoordinator};
pub use embeddings::{
    EmbeddingBackend, EmbeddingError, EmbeddingModel, FastembedLoader, ModelLoader, ModelStatus,
};
pub use engine::{HybridSearchEngine, ScoreSource, SearchHit, SearchLimits};
pub use hash_embedder::{HashEmbedder, HashLoader, HASH_MODEL_NAME};
pub use text_index::{TextFields, TextIndex, TextIndexError, TextMatch};
pub use tokenizer::{DefaultTokenizer, QueryTerm, Tokenizer};
pub use vector_index::{Neighbor, VectorIndex, VectorIndexError};
pub use vector_storage::VectorStorageError;

/// Errors that can occur during search and indexing operations.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Vector index error: {0}")]
    Index(#[from] VectorIndexError),

    #[error("Text index error: {0}")]
    Text(#[from] TextIndexError),

    #[error("Vector storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("Record store error: {0}")]
    Store(String),

    #[error("Record {0} has no content to embed")]
    EmptyContent(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SearchError {
    pub(crate) fn store(err: anyhow::Error) -> Self {
        SearchError::Store(format!("{err:#}"))
    }
}
