//! Unified query service over all configured corpora.
//!
//! One [`SearchService`] is built per process with its configuration and an
//! optional embedding provider. Queries always read the last fully persisted
//! snapshot of a corpus; indexing runs swap in the new snapshot only after it
//! has been written.

use crate::cache::{Snapshot, SnapshotStore};
use crate::config::{CorpusConfig, EngineConfig};
use crate::embedding::{EmbeddingProvider, QueryEmbeddingCache};
use crate::error::EngineError;
use crate::pipeline::{IndexOptions, IndexOutcome, IndexingPipeline, ProgressCallback, ProgressEvent};
use crate::scan::{DocumentFilter, FilterConfig};
use crate::search::{Snippet, Tokenizer, cosine_similarity, extract_snippet, hybrid_score, rank_order};
use crate::types::{BuildMode, CorpusName, Stage, now_millis};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::OnceCell;

/// Default number of results per query.
pub const DEFAULT_LIMIT: usize = 10;

/// Per-query options. Filters are applied before ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub limit: usize,
    /// Attach a snippet around the best-matching line of each hit.
    pub include_content: bool,
    /// Only documents with one of these extensions. Empty means any.
    pub extensions: Option<Vec<String>>,
    /// Regular expression the document id must match.
    pub path_filter: Option<String>,
    /// Regular expressions excluding matching document ids.
    pub exclude_paths: Vec<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            include_content: false,
            extensions: None,
            path_filter: None,
            exclude_paths: Vec::new(),
        }
    }
}

impl SearchOptions {
    fn compile_filter(&self) -> Result<DocumentFilter, EngineError> {
        DocumentFilter::compile(&FilterConfig {
            extensions: self.extensions.clone().filter(|e| !e.is_empty()),
            path_include_pattern: self.path_filter.clone().filter(|p| !p.is_empty()),
            path_exclude_patterns: self.exclude_paths.clone(),
            ignore_list: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub corpus: CorpusName,
    pub id: String,
    pub score: f32,
    pub modified_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<Snippet>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
    /// Documents in the searched snapshot(s), before filtering.
    pub total_indexed: usize,
}

impl SearchResponse {
    fn empty(query: &str, total_indexed: usize) -> Self {
        Self {
            query: query.to_string(),
            results: Vec::new(),
            total_indexed,
        }
    }
}

/// Derived per-corpus state, computed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorpusStatus {
    pub corpus: CorpusName,
    pub indexed: bool,
    pub document_count: usize,
    pub indexed_at_ms: Option<u64>,
    /// A run is active in this process or holds the lock in another one.
    pub is_building: bool,
    /// Only known for runs in this process.
    pub progress_percent: Option<u8>,
    pub stage: Option<Stage>,
    pub mode: Option<BuildMode>,
    /// Indexed, but the last run failed or the snapshot is old.
    pub possibly_stale: bool,
    pub auto_index: bool,
}

/// Latest progress of a run in this process.
#[derive(Debug, Default)]
struct BuildState {
    last: Mutex<Option<ProgressEvent>>,
}

impl BuildState {
    fn record(&self, event: &ProgressEvent) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(event.clone());
    }

    fn last(&self) -> Option<ProgressEvent> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Clears a corpus build slot when the run ends, however it ends.
struct BuildSlot<'a>(&'a Mutex<Option<Arc<BuildState>>>);

impl Drop for BuildSlot<'_> {
    fn drop(&mut self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[derive(Debug, Default, Clone)]
struct LoadedState {
    snapshot: Option<Arc<Snapshot>>,
    /// Mtime of the file `snapshot` was read from (or found unusable).
    file_modified: Option<SystemTime>,
}

struct CorpusHandle {
    config: CorpusConfig,
    tokenizer: Tokenizer,
    loaded: RwLock<LoadedState>,
    build: Mutex<Option<Arc<BuildState>>>,
    /// Set once auto-indexing has been attempted.
    auto_index_gate: tokio::sync::Mutex<bool>,
    last_run_failed: AtomicBool,
    last_verified_ms: AtomicU64,
}

impl CorpusHandle {
    fn new(config: CorpusConfig) -> Self {
        Self {
            tokenizer: Tokenizer::new(&config.tokenizer),
            config,
            loaded: RwLock::new(LoadedState::default()),
            build: Mutex::new(None),
            auto_index_gate: tokio::sync::Mutex::new(false),
            last_run_failed: AtomicBool::new(false),
            last_verified_ms: AtomicU64::new(0),
        }
    }

    fn name(&self) -> &CorpusName {
        &self.config.name
    }

    fn loaded(&self) -> LoadedState {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_loaded(&self, state: LoadedState) {
        *self.loaded.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn build(&self) -> Option<Arc<BuildState>> {
        self.build
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Search and indexing entry point for every configured corpus.
pub struct SearchService {
    config: EngineConfig,
    store: SnapshotStore,
    provider: RwLock<Option<Arc<dyn EmbeddingProvider>>>,
    corpora: Vec<CorpusHandle>,
    initialized: OnceCell<()>,
    query_cache: QueryEmbeddingCache,
}

impl std::fmt::Debug for SearchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchService")
            .field("storage_root", &self.store.root())
            .field(
                "corpora",
                &self.corpora.iter().map(|c| c.name().as_str()).collect::<Vec<_>>(),
            )
            .field("provider", &self.provider().map(|p| p.name().to_string()))
            .field("initialized", &self.initialized.initialized())
            .finish()
    }
}

impl SearchService {
    /// `config` is expected to be [resolved](EngineConfig::resolve).
    pub fn new(config: EngineConfig, provider: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        let store = SnapshotStore::new(config.storage_root())
            .with_lock_stale_after(Duration::from_secs(config.lock_stale_after_secs));
        let corpora = config.corpora.iter().cloned().map(CorpusHandle::new).collect();

        Self {
            query_cache: QueryEmbeddingCache::new(config.query_cache_size),
            config,
            store,
            provider: RwLock::new(provider),
            corpora,
            initialized: OnceCell::new(),
        }
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub const fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn corpus_names(&self) -> impl Iterator<Item = &CorpusName> {
        self.corpora.iter().map(CorpusHandle::name)
    }

    /// Replaces the embedding provider. Takes effect for the next run and query.
    pub fn set_embedding_provider(&self, provider: Option<Arc<dyn EmbeddingProvider>>) {
        *self.provider.write().unwrap_or_else(PoisonError::into_inner) = provider;
        self.query_cache.clear();
    }

    fn provider(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        self.provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn handle(&self, corpus: &str) -> Result<&CorpusHandle, EngineError> {
        let name = CorpusName::new(corpus)?;
        self.corpora
            .iter()
            .find(|c| *c.name() == name)
            .ok_or_else(|| EngineError::UnknownCorpus(corpus.to_string()))
    }

    /// Loads every available snapshot. Runs once; later calls return immediately.
    pub async fn initialize(&self) {
        self.initialized
            .get_or_init(|| async {
                let mut indexed = 0;
                for handle in &self.corpora {
                    if self.current_snapshot(handle).await.is_some() {
                        indexed += 1;
                    }
                }
                tracing::info!(
                    "Search service ready: {} corpora, {} indexed, storage at {}",
                    self.corpora.len(),
                    indexed,
                    self.store.root().display()
                );
            })
            .await;
    }

    /// Snapshot as currently persisted, re-reading it if the file changed.
    async fn current_snapshot(&self, handle: &CorpusHandle) -> Option<Arc<Snapshot>> {
        let on_disk = self.store.snapshot_modified(handle.name()).await;
        let state = handle.loaded();
        if on_disk.is_none() {
            if state.snapshot.is_some() {
                tracing::debug!("Snapshot for '{}' was removed from disk", handle.name());
                handle.set_loaded(LoadedState::default());
            }
            return None;
        }
        if on_disk == state.file_modified {
            return state.snapshot;
        }

        if state.file_modified.is_some() {
            tracing::debug!("Snapshot for '{}' changed on disk, reloading", handle.name());
        }
        let snapshot = self.store.load_snapshot(handle.name()).await.map(Arc::new);
        handle.set_loaded(LoadedState {
            snapshot: snapshot.clone(),
            file_modified: on_disk,
        });
        snapshot
    }

    /// Runs an indexing pass over `corpus`.
    ///
    /// A second run on the same corpus, from this process or another one,
    /// fails with [`EngineError::BuildInProgress`] while the first is active.
    #[tracing::instrument(skip(self, options), fields(force = options.force))]
    pub async fn run_indexing(
        &self,
        corpus: &str,
        options: IndexOptions,
    ) -> Result<IndexOutcome, EngineError> {
        let handle = self.handle(corpus)?;
        let state = Arc::new(BuildState::default());
        {
            let mut slot = handle.build.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Err(EngineError::BuildInProgress(handle.name().clone()));
            }
            *slot = Some(Arc::clone(&state));
        }
        let _slot = BuildSlot(&handle.build);

        let subscriber = options.on_progress.clone();
        let on_progress: ProgressCallback = Arc::new(move |event: &ProgressEvent| {
            state.record(event);
            if let Some(subscriber) = &subscriber {
                subscriber(event);
            }
        });
        let options = IndexOptions {
            on_progress: Some(on_progress),
            ..options
        };

        let result = IndexingPipeline::new(&handle.config, &self.store)
            .with_provider(self.provider())
            .with_embedding_concurrency(self.config.embedding_concurrency)
            .run(&options)
            .await;

        match result {
            Ok(run) => {
                let file_modified = self.store.snapshot_modified(handle.name()).await;
                handle.set_loaded(LoadedState {
                    snapshot: Some(run.snapshot),
                    file_modified,
                });
                handle.last_run_failed.store(false, Ordering::Relaxed);
                handle.last_verified_ms.store(now_millis(), Ordering::Relaxed);
                Ok(run.outcome)
            }
            Err(error) => {
                if !error.is_caller_error() && !matches!(error, EngineError::BuildInProgress(_)) {
                    handle.last_run_failed.store(true, Ordering::Relaxed);
                }
                tracing::warn!("Indexing run failed: {}", error);
                Err(error)
            }
        }
    }

    /// Indexes an auto-index corpus that has never been indexed.
    async fn auto_index(&self, handle: &CorpusHandle) {
        let mut attempted = handle.auto_index_gate.lock().await;
        if *attempted {
            return;
        }
        *attempted = true;
        if self.current_snapshot(handle).await.is_some() {
            return;
        }

        tracing::info!("Auto-indexing '{}' on first query", handle.name());
        if let Err(e) = self
            .run_indexing(handle.name().as_str(), IndexOptions::default())
            .await
        {
            tracing::warn!("Auto-indexing '{}' failed: {}", handle.name(), e);
        }
    }

    /// Ranked search over one corpus.
    ///
    /// A corpus that was never indexed yields no results and
    /// `total_indexed == 0`. An empty query yields no results and the
    /// indexed document count.
    #[tracing::instrument(skip(self, options))]
    pub async fn search(
        &self,
        corpus: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchResponse, EngineError> {
        let handle = self.handle(corpus)?;
        let filter = options.compile_filter()?;
        self.initialize().await;

        if handle.config.auto_index {
            self.auto_index(handle).await;
        }
        let Some(snapshot) = self.current_snapshot(handle).await else {
            return Ok(SearchResponse::empty(query, 0));
        };

        let results = self.rank(handle, &snapshot, query, &filter, options).await;
        tracing::debug!("{} results from '{}'", results.len(), handle.name());
        Ok(SearchResponse {
            query: query.to_string(),
            results,
            total_indexed: snapshot.document_count(),
        })
    }

    /// Searches every corpus and merges the results by score.
    pub async fn search_all(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchResponse, EngineError> {
        let mut merged = SearchResponse::empty(query, 0);
        for handle in &self.corpora {
            let response = self.search(handle.name().as_str(), query, options).await?;
            merged.total_indexed += response.total_indexed;
            merged.results.extend(response.results);
        }

        merged.results.sort_by(|a, b| {
            rank_order(
                (a.id.as_str(), a.score, a.modified_ms),
                (b.id.as_str(), b.score, b.modified_ms),
            )
            .then_with(|| a.corpus.cmp(&b.corpus))
        });
        merged.results.truncate(options.limit);
        Ok(merged)
    }

    async fn rank(
        &self,
        handle: &CorpusHandle,
        snapshot: &Snapshot,
        query: &str,
        filter: &DocumentFilter,
        options: &SearchOptions,
    ) -> Vec<SearchHit> {
        let tokens = handle.tokenizer.tokenize(query);
        if tokens.is_empty() || options.limit == 0 {
            return Vec::new();
        }

        let query_vector = match (snapshot.mode, self.provider()) {
            (BuildMode::Hybrid, Some(provider)) => {
                match self.query_cache.get_or_embed(provider.as_ref(), query).await {
                    Ok(vector) => Some(vector),
                    Err(e) => {
                        tracing::warn!("Query embedding failed, ranking lexically: {}", e);
                        None
                    }
                }
            }
            _ => None,
        };

        let allowed = |id: &str| {
            filter.allows(
                id,
                snapshot
                    .documents
                    .get(id)
                    .and_then(|d| d.extension.as_deref()),
            )
        };
        let lexical = snapshot.index.matching_scores(&tokens, Some(&allowed));

        let mut scored = match query_vector {
            None => lexical,
            Some(query_vector) => {
                let alpha = self.config.hybrid_alpha;
                let lexical: AHashMap<String, f32> = lexical.into_iter().collect();
                snapshot
                    .embeddings
                    .iter()
                    .filter(|(id, _)| allowed(id.as_str()))
                    .map(|(id, vector)| {
                        let lexical = lexical.get(id).copied().unwrap_or(0.0);
                        let semantic = cosine_similarity(&query_vector, vector);
                        (id.clone(), hybrid_score(alpha, lexical, semantic))
                    })
                    .filter(|(_, score)| *score > 0.0)
                    .collect()
            }
        };

        snapshot.index.sort_ranked(&mut scored);
        scored.truncate(options.limit);

        scored
            .into_iter()
            .map(|(id, score)| {
                let snippet = options
                    .include_content
                    .then(|| snapshot.documents.get(&id))
                    .flatten()
                    .map(|record| {
                        extract_snippet(
                            &record.content,
                            &tokens,
                            &handle.tokenizer,
                            self.config.snippet_lines,
                        )
                    });
                SearchHit {
                    corpus: handle.name().clone(),
                    modified_ms: snapshot.index.modified_ms(&id).unwrap_or(0),
                    id,
                    score,
                    snippet,
                }
            })
            .collect()
    }

    /// Status of every configured corpus, in configuration order.
    pub async fn get_status(&self) -> Vec<CorpusStatus> {
        self.initialize().await;
        let mut statuses = Vec::with_capacity(self.corpora.len());
        for handle in &self.corpora {
            statuses.push(self.status_of(handle).await);
        }
        statuses
    }

    pub async fn corpus_status(&self, corpus: &str) -> Result<CorpusStatus, EngineError> {
        let handle = self.handle(corpus)?;
        self.initialize().await;
        Ok(self.status_of(handle).await)
    }

    async fn status_of(&self, handle: &CorpusHandle) -> CorpusStatus {
        let snapshot = self.current_snapshot(handle).await;
        let build = handle.build();
        let progress = build.as_ref().and_then(|b| b.last());
        let is_building = build.is_some() || self.store.is_locked(handle.name());

        let stale_after_ms = self.config.stale_after_secs.saturating_mul(1000);
        let possibly_stale = snapshot.as_ref().is_some_and(|s| {
            let verified = s
                .indexed_at_ms
                .max(handle.last_verified_ms.load(Ordering::Relaxed));
            handle.last_run_failed.load(Ordering::Relaxed)
                || now_millis().saturating_sub(verified) > stale_after_ms
        });

        CorpusStatus {
            corpus: handle.name().clone(),
            indexed: snapshot.is_some(),
            document_count: snapshot.as_ref().map_or(0, |s| s.document_count()),
            indexed_at_ms: snapshot.as_ref().map(|s| s.indexed_at_ms),
            is_building,
            progress_percent: match (&build, &progress) {
                (_, Some(event)) => Some(event.percent()),
                (Some(_), None) => Some(0),
                (None, None) => None,
            },
            stage: progress.as_ref().map(|e| e.stage),
            mode: snapshot.as_ref().map(|s| s.mode),
            possibly_stale,
            auto_index: handle.config.auto_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InlineDocument, SourceConfig};
    use crate::search::TokenizerConfig;
    use assert2::{check, let_assert};
    use tempfile::TempDir;

    fn service(temp: &TempDir) -> SearchService {
        let corpus = CorpusConfig {
            name: CorpusName::new_unchecked("notes"),
            source: SourceConfig::Inline {
                documents: vec![
                    InlineDocument {
                        id: "guide.md".into(),
                        content: "alpha beta".into(),
                    },
                    InlineDocument {
                        id: "notes.txt".into(),
                        content: "alpha gamma".into(),
                    },
                ],
            },
            mode: BuildMode::LexicalOnly,
            auto_index: false,
            filter: FilterConfig::default(),
            tokenizer: TokenizerConfig::default(),
            max_file_bytes: 1024,
        };
        let config = EngineConfig {
            storage_root: Some(temp.path().to_path_buf()),
            corpora: vec![corpus],
            ..EngineConfig::default()
        };
        SearchService::new(config, None)
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_corpus() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);

        let_assert!(
            Err(EngineError::UnknownCorpus(_)) =
                service.search("missing", "alpha", &SearchOptions::default()).await
        );
        let_assert!(
            Err(EngineError::InvalidCorpusName { .. }) =
                service.search("Not Valid", "alpha", &SearchOptions::default()).await
        );
    }

    #[tokio::test]
    async fn test_invalid_query_filter_is_rejected() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);
        let options = SearchOptions {
            path_filter: Some("[".into()),
            ..SearchOptions::default()
        };
        let_assert!(Err(EngineError::InvalidFilter(_)) = service.search("notes", "alpha", &options).await);
    }

    #[tokio::test]
    async fn test_extension_filter_before_ranking() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);
        service.run_indexing("notes", IndexOptions::default()).await.unwrap();

        let options = SearchOptions {
            limit: 1,
            extensions: Some(vec!["txt".into()]),
            ..SearchOptions::default()
        };
        let response = service.search("notes", "alpha", &options).await.unwrap();
        check!(response.results.len() == 1);
        check!(response.results[0].id == "notes.txt");
        check!(response.total_indexed == 2);
    }

    #[tokio::test]
    async fn test_build_slot_is_cleared_after_run() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);
        service.run_indexing("notes", IndexOptions::default()).await.unwrap();

        let_assert!(Ok(status) = service.corpus_status("notes").await);
        check!(status.indexed);
        check!(!status.is_building);
        check!(status.progress_percent.is_none());
        check!(status.mode == Some(BuildMode::LexicalOnly));
    }
}
