//! TF-IDF inverted index.
//!
//! Weights use log-damped term frequency on both sides of the comparison:
//!
//! ```text
//! w(t, d) = (1 + ln tf(t, d)) * idf(t)
//! idf(t)  = ln((N + 1) / df(t))
//! score   = cos(w(·, query), w(·, doc))
//! ```
//!
//! Since `df(t) <= N`, every indexed term has a strictly positive IDF, so a
//! document that shares any token with the query always scores above zero.
//! IDF and document norms are derived data: every mutation drops them and the
//! next read recomputes them.

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Per-document term counts plus the metadata used for tie-breaking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DocumentTerms {
    /// Raw counts, each >= 1.
    counts: BTreeMap<String, u32>,
    modified_ms: u64,
}

/// IDF values and document norms for one state of the index.
#[derive(Debug, Default, Clone)]
struct Weights {
    idf: AHashMap<String, f32>,
    norms: AHashMap<String, f32>,
}

/// A searchable term index with TF-IDF scoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LexicalIndex {
    documents: BTreeMap<String, DocumentTerms>,
    /// Term → ids of documents containing it. Its length is the document frequency.
    postings: BTreeMap<String, BTreeSet<String>>,
    #[serde(skip)]
    weights: OnceLock<Weights>,
}

impl PartialEq for LexicalIndex {
    fn eq(&self, other: &Self) -> bool {
        self.documents == other.documents && self.postings == other.postings
    }
}

/// Damped term frequency.
fn damp(count: u32) -> f32 {
    1.0 + (count.max(1) as f32).ln()
}

/// Total order used for ranked output: score, then newest, then id.
pub(crate) fn rank_order(a: (&str, f32, u64), b: (&str, f32, u64)) -> Ordering {
    b.1.total_cmp(&a.1)
        .then_with(|| b.2.cmp(&a.2))
        .then_with(|| a.0.cmp(b.0))
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes `tokens` under `id`, replacing any previous postings for it.
    pub fn add_or_replace_document(&mut self, id: &str, tokens: &[String], modified_ms: u64) {
        let mut counts = BTreeMap::new();
        for token in tokens {
            *counts.entry(token.clone()).or_insert(0u32) += 1;
        }
        self.insert_terms(
            id,
            DocumentTerms {
                counts,
                modified_ms,
            },
        );
    }

    /// Copies a document's postings from another index without re-tokenizing.
    /// Returns false if `other` does not contain `id`.
    pub fn copy_document_from(&mut self, other: &Self, id: &str) -> bool {
        match other.documents.get(id) {
            Some(terms) => {
                self.insert_terms(id, terms.clone());
                true
            }
            None => false,
        }
    }

    fn insert_terms(&mut self, id: &str, terms: DocumentTerms) {
        self.remove_document(id);
        for term in terms.counts.keys() {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id.to_string());
        }
        self.documents.insert(id.to_string(), terms);
        self.invalidate();
    }

    /// Removes all postings referencing `id`. Returns whether it was present.
    pub fn remove_document(&mut self, id: &str) -> bool {
        let Some(terms) = self.documents.remove(id) else {
            return false;
        };
        for term in terms.counts.keys() {
            if let Some(docs) = self.postings.get_mut(term) {
                docs.remove(id);
                if docs.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        self.invalidate();
        true
    }

    /// Updates the modification time used for tie-breaking.
    pub fn set_modified(&mut self, id: &str, modified_ms: u64) {
        if let Some(terms) = self.documents.get_mut(id) {
            terms.modified_ms = modified_ms;
        }
    }

    fn invalidate(&mut self) {
        self.weights = OnceLock::new();
    }

    /// Recomputes IDF and document norms now instead of on the next query.
    pub fn compute_idf(&mut self) {
        self.invalidate();
        self.weights();
    }

    fn weights(&self) -> &Weights {
        self.weights.get_or_init(|| {
            let start = std::time::Instant::now();
            let n = self.documents.len() as f32;

            let idf: AHashMap<String, f32> = self
                .postings
                .iter()
                .map(|(term, docs)| (term.clone(), ((n + 1.0) / docs.len() as f32).ln()))
                .collect();

            let norms = self
                .documents
                .iter()
                .map(|(id, terms)| {
                    let sum: f32 = terms
                        .counts
                        .iter()
                        .map(|(term, &count)| {
                            let w = damp(count) * idf.get(term).copied().unwrap_or(0.0);
                            w * w
                        })
                        .sum();
                    (id.clone(), sum.sqrt())
                })
                .collect();

            tracing::debug!(
                "Computed IDF for {} terms over {} documents in {:?}",
                idf.len(),
                self.documents.len(),
                start.elapsed()
            );
            Weights { idf, norms }
        })
    }

    pub fn idf(&self, term: &str) -> Option<f32> {
        self.weights().idf.get(term).copied()
    }

    /// Damped, IDF-weighted query vector over known terms, and its norm.
    fn query_vector<'q>(&self, query_tokens: &'q [String]) -> (BTreeMap<&'q str, f32>, f32) {
        let weights = self.weights();
        let mut counts: BTreeMap<&str, u32> = BTreeMap::new();
        for token in query_tokens {
            *counts.entry(token.as_str()).or_insert(0) += 1;
        }

        let vector: BTreeMap<&str, f32> = counts
            .into_iter()
            .filter_map(|(term, count)| {
                weights
                    .idf
                    .get(term)
                    .map(|idf| (term, damp(count) * idf))
            })
            .collect();
        let norm = vector.values().map(|w| w * w).sum::<f32>().sqrt();
        (vector, norm)
    }

    fn cosine(&self, query: &BTreeMap<&str, f32>, query_norm: f32, id: &str) -> f32 {
        let weights = self.weights();
        let (Some(terms), Some(&doc_norm)) = (self.documents.get(id), weights.norms.get(id)) else {
            return 0.0;
        };
        if query_norm == 0.0 || doc_norm == 0.0 {
            return 0.0;
        }

        let dot: f32 = query
            .iter()
            .filter_map(|(term, qw)| {
                let count = *terms.counts.get(*term)?;
                let idf = weights.idf.get(*term).copied()?;
                Some(qw * damp(count) * idf)
            })
            .sum();
        dot / (query_norm * doc_norm)
    }

    /// Cosine score of one document in [0, 1]; zero when nothing is shared.
    pub fn score(&self, query_tokens: &[String], id: &str) -> f32 {
        let (query, norm) = self.query_vector(query_tokens);
        self.cosine(&query, norm, id)
    }

    /// Scores every document sharing at least one token with the query.
    /// `filter` runs before scoring.
    pub fn matching_scores(
        &self,
        query_tokens: &[String],
        filter: Option<&dyn Fn(&str) -> bool>,
    ) -> Vec<(String, f32)> {
        let (query, norm) = self.query_vector(query_tokens);

        let mut candidates: AHashSet<&str> = AHashSet::new();
        for term in query.keys() {
            if let Some(docs) = self.postings.get(*term) {
                candidates.extend(docs.iter().map(String::as_str));
            }
        }

        candidates
            .into_iter()
            .filter(|id| filter.is_none_or(|f| f(id)))
            .map(|id| (id.to_string(), self.cosine(&query, norm, id)))
            .filter(|(_, score)| *score > 0.0)
            .collect()
    }

    /// At most `k` documents ordered by descending score, newest first on ties,
    /// then by id.
    pub fn top_k(
        &self,
        query_tokens: &[String],
        k: usize,
        filter: Option<&dyn Fn(&str) -> bool>,
    ) -> Vec<(String, f32)> {
        if k == 0 {
            return Vec::new();
        }
        let mut results = self.matching_scores(query_tokens, filter);
        self.sort_ranked(&mut results);
        results.truncate(k);
        results
    }

    /// Sorts `(id, score)` pairs with the ranking tie-breaks.
    pub fn sort_ranked(&self, results: &mut [(String, f32)]) {
        results.sort_by(|a, b| {
            rank_order(
                (a.0.as_str(), a.1, self.modified_ms(&a.0).unwrap_or(0)),
                (b.0.as_str(), b.1, self.modified_ms(&b.0).unwrap_or(0)),
            )
        });
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.contains_key(id)
    }

    pub fn modified_ms(&self, id: &str) -> Option<u64> {
        self.documents.get(id).map(|d| d.modified_ms)
    }

    pub fn document_frequency(&self, term: &str) -> usize {
        self.postings.get(term).map_or(0, BTreeSet::len)
    }

    /// Ids of documents containing `term`.
    pub fn postings(&self, term: &str) -> Option<&BTreeSet<String>> {
        self.postings.get(term)
    }

    /// Raw term counts of one document.
    pub fn term_counts(&self, id: &str) -> Option<&BTreeMap<String, u32>> {
        self.documents.get(id).map(|d| &d.counts)
    }

    pub fn document_ids(&self) -> impl Iterator<Item = &str> {
        self.documents.keys().map(String::as_str)
    }

    /// Get the number of unique terms in the index
    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    /// Get the number of documents in the index
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }
}
