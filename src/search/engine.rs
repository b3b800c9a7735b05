//! Hybrid query execution.
//!
//! Lexical matches come first, in per-namespace rank order. Semantic
//! neighbours follow, dropped when farther than the distance cutoff or
//! already present. There is no cross-signal re-scoring.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::Instrument;

use crate::config::Config;
use crate::records::{Namespace, Record, RecordStore};
use crate::search::embeddings::{EmbeddingError, EmbeddingModel};
use crate::search::text_index::{substring_matches, TextFields, TextIndex, TextMatch};
use crate::search::vector_index::{Neighbor, VectorIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreSource {
    Lexical,
    Semantic,
}

/// One merged result. `score` is the lexical rank for lexical hits and the
/// cosine distance for semantic ones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: u64,
    pub kind: Namespace,
    pub source: ScoreSource,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct SearchLimits {
    pub default_knn: usize,
    pub user_knn: usize,
    /// Semantic hits farther than this are discarded
    pub max_distance: f32,
    /// Run the semantic half at all
    pub semantic: bool,
    /// Load the model for this query if it is not ready yet
    pub load_on_query: bool,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SearchLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_knn: config.search.default_knn,
            user_knn: config.search.user_knn,
            max_distance: config.semantic.max_distance,
            semantic: config.semantic.enabled,
            load_on_query: config.semantic.load_on_query,
        }
    }

    pub fn lexical_only(mut self) -> Self {
        self.semantic = false;
        self
    }

    pub fn knn_for(&self, ns: Namespace) -> usize {
        match ns {
            Namespace::Default => self.default_knn,
            Namespace::User => self.user_knn,
        }
    }
}

/// Lexical hits first, then semantic hits within `max_distance`; the first
/// occurrence of a `(kind, id)` wins.
pub fn merge(
    lexical: Vec<(Namespace, TextMatch)>,
    semantic: Vec<(Namespace, Neighbor)>,
    max_distance: f32,
) -> Vec<SearchHit> {
    let mut seen: HashSet<(Namespace, u64)> = HashSet::new();
    let mut hits = Vec::with_capacity(lexical.len() + semantic.len());

    for (kind, m) in lexical {
        if seen.insert((kind, m.id)) {
            hits.push(SearchHit {
                id: m.id,
                kind,
                source: ScoreSource::Lexical,
                score: m.rank,
            });
        }
    }

    for (kind, n) in semantic {
        if n.distance.is_nan() || n.distance > max_distance {
            continue;
        }
        if seen.insert((kind, n.id)) {
            hits.push(SearchHit {
                id: n.id,
                kind,
                source: ScoreSource::Semantic,
                score: n.distance,
            });
        }
    }

    hits
}

pub struct HybridSearchEngine {
    store: Arc<dyn RecordStore>,
    text: Arc<TextIndex>,
    vectors: Arc<VectorIndex>,
    model: Option<Arc<EmbeddingModel>>,
    limits: SearchLimits,
}

impl HybridSearchEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        text: Arc<TextIndex>,
        vectors: Arc<VectorIndex>,
        model: Option<Arc<EmbeddingModel>>,
        limits: SearchLimits,
    ) -> Self {
        Self {
            store,
            text,
            vectors,
            model,
            limits,
        }
    }

    pub fn limits(&self) -> &SearchLimits {
        &self.limits
    }

    /// Search `namespaces` in order. Never fails: a broken semantic side
    /// leaves only lexical hits.
    pub async fn search(
        &self,
        namespaces: &[Namespace],
        query: &str,
        limits: &SearchLimits,
    ) -> Vec<SearchHit> {
        let query = query.trim();
        if query.is_empty() {
            return vec![];
        }

        let span = tracing::debug_span!("search", query = %query);
        async {
            let lexical: Vec<(Namespace, TextMatch)> = namespaces
                .iter()
                .flat_map(|ns| {
                    self.lexical(*ns, query)
                        .into_iter()
                        .map(move |m| (*ns, m))
                })
                .collect();

            let semantic = if limits.semantic {
                self.semantic(namespaces, query, limits).await
            } else {
                vec![]
            };

            log::debug!(
                "{} lexical and {} semantic candidates",
                lexical.len(),
                semantic.len()
            );

            merge(lexical, semantic, limits.max_distance)
        }
        .instrument(span)
        .await
    }

    /// Search every namespace with the configured limits and load the
    /// matching records. Hits whose record is gone are skipped.
    pub async fn search_records(&self, query: &str) -> Vec<Record> {
        let hits = self.search(&Namespace::ALL, query, &self.limits).await;
        self.hydrate(&hits)
    }

    pub fn hydrate(&self, hits: &[SearchHit]) -> Vec<Record> {
        hits.iter()
            .filter_map(|hit| match self.store.get_by_id(hit.kind, hit.id) {
                Ok(record) => record,
                Err(e) => {
                    log::debug!("skipping {} record {}: {e:#}", hit.kind, hit.id);
                    None
                }
            })
            .collect()
    }

    /// Text matches, or a substring scan of the store while the partition
    /// has not been built yet.
    fn lexical(&self, ns: Namespace, query: &str) -> Vec<TextMatch> {
        if !self.text.is_empty(ns) {
            return self.text.match_query(ns, query);
        }

        match self.store.list(ns) {
            Ok(records) => {
                let fields: Vec<(u64, TextFields)> = records
                    .iter()
                    .map(|r| (r.id, TextFields::from(r)))
                    .collect();
                substring_matches(
                    fields.iter().map(|(id, f)| (*id, f)),
                    query,
                    self.text.cap(),
                )
            }
            Err(e) => {
                log::warn!("failed to scan {ns} records: {e:#}");
                vec![]
            }
        }
    }

    async fn semantic(
        &self,
        namespaces: &[Namespace],
        query: &str,
        limits: &SearchLimits,
    ) -> Vec<(Namespace, Neighbor)> {
        let Some(model) = &self.model else {
            return vec![];
        };

        let embedded = if limits.load_on_query {
            model.embed(query).await
        } else {
            model.embed_if_ready(query).await
        };

        let vector = match embedded {
            Ok(vector) => vector,
            Err(EmbeddingError::ModelNotLoaded) => {
                log::debug!("semantic search skipped: model not loaded");
                return vec![];
            }
            Err(e) => {
                log::warn!("semantic search unavailable: {e}");
                return vec![];
            }
        };

        let mut neighbors = Vec::new();
        for ns in namespaces {
            match self.vectors.knn(*ns, &vector, limits.knn_for(*ns)) {
                Ok(found) => neighbors.extend(found.into_iter().map(|n| (*ns, n))),
                Err(e) => log::warn!("semantic search on {ns} failed: {e}"),
            }
        }

        neighbors
    }
}
