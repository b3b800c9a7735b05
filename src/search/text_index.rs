//! Inverted full-text index over food records.
//!
//! One partition per namespace. Postings live in a `BTreeMap` so that prefix
//! terms resolve to a contiguous range scan. Ranking is BM25 across the three
//! record fields with per-field weights, plus a bonus when a query term equals
//! the indexed token instead of only prefixing it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::records::{Namespace, Record};
use crate::search::tokenizer::{QueryTerm, Tokenizer};
use crate::storage::StorageManager;

const FIELD_COUNT: usize = 3;

/// name > alt_name > notes
const FIELD_WEIGHTS: [f32; FIELD_COUNT] = [3.0, 2.0, 1.0];

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

/// Multiplier for a term that matched a token exactly rather than as a prefix.
const EXACT_BONUS: f32 = 1.5;

const SNAPSHOT_VERSION: u32 = 1;

/// The indexed projection of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextFields {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl TextFields {
    fn field(&self, idx: usize) -> &str {
        match idx {
            0 => &self.name,
            1 => self.alt_name.as_deref().unwrap_or_default(),
            _ => self.notes.as_deref().unwrap_or_default(),
        }
    }

    fn names_contain(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle)
            || self
                .alt_name
                .as_deref()
                .is_some_and(|alt| alt.to_lowercase().contains(needle))
    }
}

impl From<&Record> for TextFields {
    fn from(record: &Record) -> Self {
        Self {
            name: record.name.clone(),
            alt_name: record.alt_name.clone(),
            notes: record.notes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextMatch {
    pub id: u64,
    pub rank: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum TextIndexError {
    #[error("query cannot run against the index: {0}")]
    Query(String),

    #[error("failed to write text index: {0}")]
    Write(#[from] std::io::Error),

    #[error("failed to encode text index: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<SnapshotEntry>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    id: u64,
    #[serde(flatten)]
    fields: TextFields,
}

struct Document {
    fields: TextFields,
    lengths: [u32; FIELD_COUNT],
    terms: Vec<String>,
}

type Postings = HashMap<u64, [u32; FIELD_COUNT]>;

#[derive(Default)]
struct Partition {
    docs: HashMap<u64, Document>,
    postings: BTreeMap<String, Postings>,
    total_lengths: [u64; FIELD_COUNT],
}

impl Partition {
    fn insert(&mut self, tokenizer: &dyn Tokenizer, id: u64, fields: TextFields) {
        self.remove(id);

        let mut lengths = [0u32; FIELD_COUNT];
        let mut freqs: HashMap<String, [u32; FIELD_COUNT]> = HashMap::new();
        for (idx, length) in lengths.iter_mut().enumerate() {
            let tokens = tokenizer.tokenize(fields.field(idx));
            *length = tokens.len() as u32;
            for token in tokens {
                freqs.entry(token).or_default()[idx] += 1;
            }
        }

        for (total, length) in self.total_lengths.iter_mut().zip(lengths) {
            *total += u64::from(length);
        }

        let terms: Vec<String> = freqs.keys().cloned().collect();
        for (term, tf) in freqs {
            self.postings.entry(term).or_default().insert(id, tf);
        }

        self.docs.insert(
            id,
            Document {
                fields,
                lengths,
                terms,
            },
        );
    }

    fn remove(&mut self, id: u64) -> bool {
        let Some(doc) = self.docs.remove(&id) else {
            return false;
        };

        for (total, length) in self.total_lengths.iter_mut().zip(doc.lengths) {
            *total = total.saturating_sub(u64::from(length));
        }

        for term in doc.terms {
            if let Some(postings) = self.postings.get_mut(&term) {
                postings.remove(&id);
                if postings.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }

        true
    }

    fn average_lengths(&self) -> [f32; FIELD_COUNT] {
        let docs = self.docs.len().max(1) as f32;
        self.total_lengths.map(|total| total as f32 / docs)
    }

    /// Index terms a query term resolves to.
    fn expand(&self, term: &QueryTerm) -> Vec<(&str, &Postings)> {
        match term {
            QueryTerm::Exact(text) => self
                .postings
                .get_key_value(text)
                .map(|(k, v)| (k.as_str(), v))
                .into_iter()
                .collect(),
            QueryTerm::Prefix(prefix) => self
                .postings
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(prefix.as_str()))
                .map(|(k, v)| (k.as_str(), v))
                .collect(),
        }
    }

    /// BM25F: per-field term frequencies are length-normalized and weighted
    /// before saturation.
    fn weighted_tf(
        tf: &[u32; FIELD_COUNT],
        lengths: &[u32; FIELD_COUNT],
        avg: &[f32; FIELD_COUNT],
    ) -> f32 {
        let mut sum = 0.0;
        for idx in 0..FIELD_COUNT {
            if tf[idx] == 0 || avg[idx] <= 0.0 {
                continue;
            }
            let norm = 1.0 - BM25_B + BM25_B * lengths[idx] as f32 / avg[idx];
            sum += FIELD_WEIGHTS[idx] * tf[idx] as f32 / norm;
        }
        sum
    }

    /// Every term must match (AND). A prefix term takes its best expansion.
    fn score(&self, terms: &[QueryTerm], cap: usize) -> Vec<TextMatch> {
        let total_docs = self.docs.len() as f32;
        let avg = self.average_lengths();

        let mut acc: HashMap<u64, (usize, f32)> = HashMap::new();
        for term in terms {
            let mut best: HashMap<u64, f32> = HashMap::new();

            for (index_term, postings) in self.expand(term) {
                let df = postings.len() as f32;
                let idf = (1.0 + (total_docs - df + 0.5) / (df + 0.5)).ln();
                let bonus = if index_term == term.text() {
                    EXACT_BONUS
                } else {
                    1.0
                };

                for (&id, tf) in postings {
                    let Some(doc) = self.docs.get(&id) else {
                        continue;
                    };
                    let wtf = Self::weighted_tf(tf, &doc.lengths, &avg);
                    let score = idf * wtf * (BM25_K1 + 1.0) / (wtf + BM25_K1) * bonus;

                    let slot = best.entry(id).or_insert(0.0);
                    if score > *slot {
                        *slot = score;
                    }
                }
            }

            for (id, score) in best {
                let entry = acc.entry(id).or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += score;
            }
        }

        let mut matches: Vec<TextMatch> = acc
            .into_iter()
            .filter(|(_, (matched, _))| *matched == terms.len())
            .map(|(id, (_, rank))| TextMatch { id, rank })
            .collect();

        sort_matches(&mut matches);
        matches.truncate(cap);
        matches
    }
}

fn sort_matches(matches: &mut [TextMatch]) {
    matches.sort_by(|a, b| b.rank.total_cmp(&a.rank).then(a.id.cmp(&b.id)));
}

/// Case-insensitive substring scan over `name` and `alt_name`, ordered by id.
pub fn substring_matches<'a>(
    docs: impl IntoIterator<Item = (u64, &'a TextFields)>,
    query: &str,
    cap: usize,
) -> Vec<TextMatch> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return vec![];
    }

    let mut ids: Vec<u64> = docs
        .into_iter()
        .filter(|(_, fields)| fields.names_contain(&needle))
        .map(|(id, _)| id)
        .collect();
    ids.sort_unstable();
    ids.dedup();

    ids.into_iter()
        .take(cap)
        .map(|id| TextMatch { id, rank: 0.0 })
        .collect()
}

pub struct TextIndex {
    partitions: [RwLock<Partition>; 2],
    tokenizer: Arc<dyn Tokenizer>,
    storage: Option<Arc<dyn StorageManager>>,
    cap: usize,
}

fn slot(ns: Namespace) -> usize {
    match ns {
        Namespace::Default => 0,
        Namespace::User => 1,
    }
}

impl TextIndex {
    /// Index that is never written to disk.
    pub fn in_memory(tokenizer: Arc<dyn Tokenizer>, cap: usize) -> Self {
        Self {
            partitions: std::array::from_fn(|_| RwLock::default()),
            tokenizer,
            storage: None,
            cap,
        }
    }

    /// Open the index, loading any persisted partitions. Unreadable
    /// snapshots are discarded; the next backfill rebuilds them.
    pub fn open(storage: Arc<dyn StorageManager>, tokenizer: Arc<dyn Tokenizer>, cap: usize) -> Self {
        let index = Self {
            partitions: std::array::from_fn(|_| RwLock::default()),
            tokenizer,
            storage: Some(storage),
            cap,
        };

        for ns in Namespace::ALL {
            match index.load(ns) {
                Ok(0) => {}
                Ok(count) => log::info!("loaded {count} text entries for {ns}"),
                Err(e) => log::warn!("discarding text index for {ns}: {e}"),
            }
        }

        index
    }

    pub fn file_name(ns: Namespace) -> String {
        format!("text-{ns}.json")
    }

    fn read(&self, ns: Namespace) -> RwLockReadGuard<'_, Partition> {
        self.partitions[slot(ns)]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, ns: Namespace) -> RwLockWriteGuard<'_, Partition> {
        self.partitions[slot(ns)]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self, ns: Namespace) -> anyhow::Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };

        let file = Self::file_name(ns);
        if !storage.exists(&file) {
            return Ok(0);
        }

        let snapshot: Snapshot = serde_json::from_slice(&storage.read(&file)?)?;
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!("unsupported snapshot version {}", snapshot.version);
        }

        self.rebuild(ns, snapshot.entries.into_iter().map(|e| (e.id, e.fields)));
        Ok(self.len(ns))
    }

    pub fn upsert(&self, ns: Namespace, id: u64, fields: TextFields) {
        self.write(ns).insert(self.tokenizer.as_ref(), id, fields);
    }

    pub fn remove(&self, ns: Namespace, id: u64) -> bool {
        self.write(ns).remove(id)
    }

    /// Replace the partition with exactly the given entries.
    ///
    /// The new partition is built without holding the lock, so queries keep
    /// running against the old one until the swap.
    pub fn rebuild(&self, ns: Namespace, entries: impl IntoIterator<Item = (u64, TextFields)>) {
        let mut fresh = Partition::default();
        for (id, fields) in entries {
            fresh.insert(self.tokenizer.as_ref(), id, fields);
        }

        *self.write(ns) = fresh;
    }

    /// Ranked matches for `query`, followed by any record whose name or
    /// alt name contains the query as a substring, so infixes like "anana"
    /// still find "Banana". Substring-only matches come after the ranked
    /// ones, by id, and both share the cap.
    pub fn match_query(&self, ns: Namespace, query: &str) -> Vec<TextMatch> {
        let mut matches = match self.search_index(ns, query) {
            Ok(matches) => matches,
            Err(e) => {
                log::debug!("text query on {ns} falls back to substring scan: {e}");
                vec![]
            }
        };
        if matches.len() >= self.cap {
            return matches;
        }

        let ranked: HashSet<u64> = matches.iter().map(|m| m.id).collect();
        let partition = self.read(ns);
        let extra = substring_matches(
            partition.docs.iter().map(|(id, doc)| (*id, &doc.fields)),
            query,
            usize::MAX,
        );
        let room = self.cap - matches.len();
        matches.extend(
            extra
                .into_iter()
                .filter(|m| !ranked.contains(&m.id))
                .take(room),
        );

        matches
    }

    /// Ranked matches without any fallback.
    pub fn search_index(&self, ns: Namespace, query: &str) -> Result<Vec<TextMatch>, TextIndexError> {
        let terms = self.tokenizer.query_terms(query);
        if terms.is_empty() {
            return Err(TextIndexError::Query("no usable tokens".to_string()));
        }

        let partition = self.read(ns);
        if partition.docs.is_empty() {
            return Err(TextIndexError::Query(format!("{ns} partition is empty")));
        }

        Ok(partition.score(&terms, self.cap))
    }

    pub fn contains(&self, ns: Namespace, id: u64) -> bool {
        self.read(ns).docs.contains_key(&id)
    }

    /// The indexed fields of one entry.
    pub fn fields(&self, ns: Namespace, id: u64) -> Option<TextFields> {
        self.read(ns).docs.get(&id).map(|doc| doc.fields.clone())
    }

    pub fn len(&self, ns: Namespace) -> usize {
        self.read(ns).docs.len()
    }

    pub fn is_empty(&self, ns: Namespace) -> bool {
        self.len(ns) == 0
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Write the partition snapshot atomically.
    pub fn persist(&self, ns: Namespace) -> Result<(), TextIndexError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };

        let mut entries: Vec<SnapshotEntry> = self
            .read(ns)
            .docs
            .iter()
            .map(|(id, doc)| SnapshotEntry {
                id: *id,
                fields: doc.fields.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.id);

        let data = serde_json::to_vec(&Snapshot {
            version: SNAPSHOT_VERSION,
            entries,
        })?;
        storage.write(&Self::file_name(ns), &data)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::tokenizer::DefaultTokenizer;
    use crate::storage::BackendLocal;

    fn fields(name: &str, alt_name: Option<&str>, notes: Option<&str>) -> TextFields {
        TextFields {
            name: name.to_string(),
            alt_name: alt_name.map(str::to_string),
            notes: notes.map(str::to_string),
        }
    }

    fn index() -> TextIndex {
        TextIndex::in_memory(Arc::new(DefaultTokenizer), 50)
    }

    fn ids(matches: &[TextMatch]) -> Vec<u64> {
        matches.iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_prefix_match() {
        let idx = index();
        idx.upsert(Namespace::Default, 1, fields("Apple", Some("Mela"), None));
        idx.upsert(Namespace::Default, 2, fields("Pear", None, None));

        assert_eq!(ids(&idx.match_query(Namespace::Default, "app")), vec![1]);
        assert_eq!(ids(&idx.match_query(Namespace::Default, "mel")), vec![1]);
    }

    #[test]
    fn test_shorter_name_ranks_first() {
        let idx = index();
        idx.upsert(Namespace::Default, 2, fields("Banana Bread", None, None));
        idx.upsert(Namespace::Default, 1, fields("Banana", None, None));

        assert_eq!(ids(&idx.match_query(Namespace::Default, "banana")), vec![1, 2]);
    }

    #[test]
    fn test_exact_beats_prefix() {
        let idx = index();
        idx.upsert(Namespace::Default, 1, fields("Panettone", None, None));
        idx.upsert(Namespace::Default, 2, fields("Pane", None, None));

        assert_eq!(ids(&idx.match_query(Namespace::Default, "pane")), vec![2, 1]);
    }

    #[test]
    fn test_name_outranks_notes() {
        let idx = index();
        idx.upsert(Namespace::Default, 1, fields("Torta", None, Some("mela")));
        idx.upsert(Namespace::Default, 2, fields("Mela", None, None));

        assert_eq!(ids(&idx.match_query(Namespace::Default, "mela")), vec![2, 1]);
    }

    #[test]
    fn test_equal_rank_ties_by_id() {
        let idx = index();
        idx.upsert(Namespace::Default, 3, fields("Mela", None, None));
        idx.upsert(Namespace::Default, 1, fields("Mela", None, None));

        assert_eq!(ids(&idx.match_query(Namespace::Default, "mela")), vec![1, 3]);
    }

    #[test]
    fn test_all_terms_must_match() {
        let idx = index();
        idx.upsert(Namespace::Default, 1, fields("Pasta al pomodoro", None, None));
        idx.upsert(Namespace::Default, 2, fields("Pasta al pesto", None, None));

        assert_eq!(
            ids(&idx.match_query(Namespace::Default, "pasta pomodoro")),
            vec![1]
        );
        assert!(idx.match_query(Namespace::Default, "pasta tonno").is_empty());
    }

    #[test]
    fn test_cap_limits_results() {
        let idx = TextIndex::in_memory(Arc::new(DefaultTokenizer), 3);
        for id in 1..=10 {
            idx.upsert(Namespace::Default, id, fields("Riso", None, None));
        }

        assert_eq!(ids(&idx.match_query(Namespace::Default, "riso")), vec![1, 2, 3]);
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let idx = index();
        idx.upsert(Namespace::Default, 1, fields("Latte", None, None));
        idx.upsert(Namespace::User, 1, fields("Latte di mandorla", None, None));

        idx.remove(Namespace::Default, 1);
        assert!(idx.match_query(Namespace::Default, "latte").is_empty());
        assert_eq!(ids(&idx.match_query(Namespace::User, "latte")), vec![1]);
    }

    #[test]
    fn test_upsert_replaces_old_tokens() {
        let idx = index();
        idx.upsert(Namespace::User, 7, fields("Yogurt", None, None));
        idx.upsert(Namespace::User, 7, fields("Kefir", None, None));

        assert_eq!(idx.len(Namespace::User), 1);
        assert!(idx.search_index(Namespace::User, "yogurt").unwrap().is_empty());
        assert_eq!(ids(&idx.match_query(Namespace::User, "kef")), vec![7]);
    }

    #[test]
    fn test_rebuild_drops_orphans() {
        let idx = index();
        idx.upsert(Namespace::Default, 1, fields("Uva", None, None));
        idx.upsert(Namespace::Default, 2, fields("Uvetta", None, None));

        let snapshot = vec![(2, fields("Uvetta", None, None))];
        idx.rebuild(Namespace::Default, snapshot.clone());
        idx.rebuild(Namespace::Default, snapshot);

        assert!(!idx.contains(Namespace::Default, 1));
        assert_eq!(idx.len(Namespace::Default), 1);
        assert_eq!(ids(&idx.match_query(Namespace::Default, "uv")), vec![2]);
    }

    #[test]
    fn test_infix_falls_back_to_substring() {
        let idx = index();
        idx.upsert(Namespace::Default, 1, fields("Banana", None, None));
        idx.upsert(Namespace::Default, 2, fields("Melanzana", Some("Aubergine"), None));

        assert!(idx.search_index(Namespace::Default, "anana").unwrap().is_empty());
        assert_eq!(ids(&idx.match_query(Namespace::Default, "anana")), vec![1]);
        assert_eq!(ids(&idx.match_query(Namespace::Default, "bergi")), vec![2]);
    }

    #[test]
    fn test_infix_match_follows_ranked_hits() {
        let idx = index();
        idx.upsert(Namespace::User, 1, fields("Banana", None, None));
        idx.upsert(Namespace::User, 2, fields("Ananas", None, None));
        idx.upsert(Namespace::User, 3, fields("Pane", Some("Fetta di ananas"), None));

        assert_eq!(ids(&idx.search_index(Namespace::User, "ana").unwrap()), vec![2, 3]);
        let matches = idx.match_query(Namespace::User, "ana");
        assert_eq!(ids(&matches), vec![2, 3, 1]);
        assert_eq!(matches[2].rank, 0.0);
    }

    #[test]
    fn test_infix_matches_share_the_cap() {
        let idx = TextIndex::in_memory(Arc::new(DefaultTokenizer), 2);
        idx.upsert(Namespace::User, 5, fields("Ananas", None, None));
        idx.upsert(Namespace::User, 1, fields("Banana", None, None));
        idx.upsert(Namespace::User, 3, fields("Guanabana", None, None));

        assert_eq!(ids(&idx.match_query(Namespace::User, "ana")), vec![5, 1]);
    }

    #[test]
    fn test_stop_word_query_falls_back_to_substring() {
        let idx = index();
        idx.upsert(Namespace::Default, 4, fields("Olio di oliva", None, None));
        idx.upsert(Namespace::Default, 2, fields("Pan di spagna", None, None));

        assert!(matches!(
            idx.search_index(Namespace::Default, "di la"),
            Err(TextIndexError::Query(_))
        ));
        assert_eq!(ids(&idx.match_query(Namespace::Default, "di spagna")), vec![2]);
        assert!(idx.match_query(Namespace::Default, "di la").is_empty());
    }

    #[test]
    fn test_empty_partition_is_a_query_error() {
        let idx = index();
        assert!(matches!(
            idx.search_index(Namespace::User, "mela"),
            Err(TextIndexError::Query(_))
        ));
        assert!(idx.match_query(Namespace::User, "mela").is_empty());
    }

    #[test]
    fn test_substring_matches_alt_name() {
        let docs = [
            (5, fields("Apple", Some("Mela rossa"), None)),
            (3, fields("Red apple", None, None)),
        ];
        let matches = substring_matches(docs.iter().map(|(id, f)| (*id, f)), "APPLE", 50);
        assert_eq!(ids(&matches), vec![3, 5]);

        let matches = substring_matches(docs.iter().map(|(id, f)| (*id, f)), "rossa", 50);
        assert_eq!(ids(&matches), vec![5]);
    }

    #[test]
    fn test_persist_and_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageManager> = Arc::new(BackendLocal::new(tmp.path()).unwrap());

        let idx = TextIndex::open(storage.clone(), Arc::new(DefaultTokenizer), 50);
        idx.upsert(Namespace::User, 1, fields("Farro", None, Some("cereale antico")));
        idx.upsert(Namespace::User, 2, fields("Orzo", Some("Barley"), None));
        idx.persist(Namespace::User).unwrap();

        let reopened = TextIndex::open(storage, Arc::new(DefaultTokenizer), 50);
        assert_eq!(reopened.len(Namespace::User), 2);
        assert_eq!(reopened.len(Namespace::Default), 0);
        assert_eq!(ids(&reopened.match_query(Namespace::User, "barl")), vec![2]);
        assert_eq!(ids(&reopened.match_query(Namespace::User, "cereale")), vec![1]);
    }

    #[test]
    fn test_corrupt_snapshot_is_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageManager> = Arc::new(BackendLocal::new(tmp.path()).unwrap());
        storage
            .write(&TextIndex::file_name(Namespace::Default), b"{not json")
            .unwrap();

        let idx = TextIndex::open(storage, Arc::new(DefaultTokenizer), 50);
        assert!(idx.is_empty(Namespace::Default));
    }
}
