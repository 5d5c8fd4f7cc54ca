//! Staged indexing of one corpus.
//!
//! A run moves through `scanning → tokenizing → scoring → embedding →
//! persisting → completed`. Unchanged documents are copied forward from the
//! previous snapshot; everything else is re-tokenized and, in hybrid mode,
//! re-embedded. The previous snapshot stays authoritative until the new one
//! has been written in full.

use crate::cache::{ContentHash, DocumentRecord, Fingerprint, IndexLock, Snapshot, SnapshotStore};
use crate::config::{CorpusConfig, SourceConfig};
use crate::embedding::{EmbeddingProvider, embed_documents, validate_vector};
use crate::error::{EngineError, ProviderError};
use crate::scan::{DocumentDescriptor, DocumentFilter, DocumentLocation, Scanner};
use crate::search::Tokenizer;
use crate::types::{BuildMode, CorpusName, Stage, now_millis};
use futures::StreamExt;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One step of a run, as seen by progress subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    /// Documents fully processed so far. Never decreases within a run.
    pub current: usize,
    pub total: usize,
    /// Document id, or a short label for corpus-wide steps.
    pub item: String,
    pub stage: Stage,
}

impl ProgressEvent {
    pub fn percent(&self) -> u8 {
        if self.stage == Stage::Completed {
            return 100;
        }
        if self.total == 0 {
            return 0;
        }
        ((self.current.min(self.total) * 100) / self.total) as u8
    }
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct IndexOptions {
    /// Rebuild every document and replace the whole snapshot.
    pub force: bool,
    pub on_progress: Option<ProgressCallback>,
    /// Checked between documents.
    pub cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for IndexOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexOptions")
            .field("force", &self.force)
            .field("on_progress", &self.on_progress.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl IndexOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    /// Documents discovered by the scan after filtering.
    pub total_files: usize,
    /// Documents tokenized in this run.
    pub indexed_files: usize,
    /// Documents copied forward from the previous snapshot.
    pub reused_files: usize,
    /// Documents dropped because reading or embedding them failed.
    pub skipped_files: usize,
    /// Documents of the previous snapshot that were no longer discovered.
    pub removed_files: usize,
    pub embedded_files: usize,
    /// Nothing needed rebuilding; the previous snapshot was kept.
    pub cache_hit: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexOutcome {
    pub corpus: CorpusName,
    pub stats: IndexStats,
    pub mode: BuildMode,
    pub indexed_at_ms: u64,
    pub document_count: usize,
}

/// Result of a successful run: the summary plus the snapshot now on disk.
#[derive(Debug)]
pub struct IndexRun {
    pub outcome: IndexOutcome,
    pub snapshot: Arc<Snapshot>,
}

/// Emits progress, clamping `current` so it never goes backwards.
struct ProgressReporter {
    callback: Option<ProgressCallback>,
    last: usize,
}

impl ProgressReporter {
    fn new(callback: Option<ProgressCallback>) -> Self {
        Self { callback, last: 0 }
    }

    fn emit(&mut self, stage: Stage, current: usize, total: usize, item: &str) {
        let current = current.max(self.last);
        self.last = current;
        if let Some(callback) = &self.callback {
            callback(&ProgressEvent {
                current,
                total,
                item: item.to_string(),
                stage,
            });
        }
    }
}

/// How one discovered document ended up in the new snapshot.
enum Disposition {
    /// Copied forward. `needs_embedding` holds the text if no vector could be carried.
    Reused { needs_embedding: Option<String> },
    Rebuilt { needs_embedding: Option<String> },
}

/// Runs indexing passes for one corpus.
pub struct IndexingPipeline<'a> {
    corpus: &'a CorpusConfig,
    store: &'a SnapshotStore,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    embedding_concurrency: usize,
}

impl<'a> IndexingPipeline<'a> {
    pub fn new(corpus: &'a CorpusConfig, store: &'a SnapshotStore) -> Self {
        Self {
            corpus,
            store,
            provider: None,
            embedding_concurrency: 4,
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub fn with_embedding_concurrency(mut self, concurrency: usize) -> Self {
        self.embedding_concurrency = concurrency.max(1);
        self
    }

    /// Mode this run aims for before any provider failure.
    fn target_mode(&self) -> BuildMode {
        match (self.corpus.mode, &self.provider) {
            (BuildMode::Hybrid, Some(_)) => BuildMode::Hybrid,
            _ => BuildMode::LexicalOnly,
        }
    }

    fn check_cancelled(&self, options: &IndexOptions) -> Result<(), EngineError> {
        if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            tracing::info!("Indexing of '{}' cancelled", self.corpus.name);
            return Err(EngineError::Cancelled(self.corpus.name.clone()));
        }
        Ok(())
    }

    /// Runs one full pass. Holds the corpus lock for the whole run.
    #[tracing::instrument(skip_all, fields(corpus = %self.corpus.name, force = options.force))]
    pub async fn run(&self, options: &IndexOptions) -> Result<IndexRun, EngineError> {
        let name = &self.corpus.name;
        let filter = DocumentFilter::compile(&self.corpus.filter)?;

        let lock = match self.store.try_lock(name) {
            Ok(Some(lock)) => lock,
            Ok(None) => return Err(EngineError::BuildInProgress(name.clone())),
            Err(source) => {
                return Err(EngineError::Storage {
                    corpus: name.clone(),
                    source,
                });
            }
        };

        let started = std::time::Instant::now();
        let mut progress = ProgressReporter::new(options.on_progress.clone());

        // Scanning
        progress.emit(Stage::Scanning, 0, 0, &source_label(&self.corpus.source));
        let scanner = Scanner::new(self.corpus.source.clone(), filter, self.corpus.max_file_bytes);
        let scan = tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .map_err(|e| anyhow::anyhow!("scanner task failed: {}", e))
            .and_then(|result| result)
            .map_err(|source| EngineError::SourceUnavailable {
                corpus: name.clone(),
                source,
            })?;
        self.check_cancelled(options)?;

        let previous = self.store.load_snapshot(name).await;
        let reusable = match &previous {
            Some(p) if !p.tokenized_with(&self.corpus.tokenizer) => {
                tracing::info!("Tokenizer settings of '{}' changed, rebuilding all documents", name);
                None
            }
            Some(p) if !options.force => Some(p),
            _ => None,
        };
        let mode = self.target_mode();
        let tokenizer = Tokenizer::new(&self.corpus.tokenizer);

        let mut next = Snapshot::new(name.clone(), mode);
        next.tokenizer = self.corpus.tokenizer.clone();
        next.provider = match (mode, &self.provider) {
            (BuildMode::Hybrid, Some(provider)) => Some(provider.name().to_string()),
            _ => None,
        };
        let carry_embeddings = next
            .provider
            .as_deref()
            .is_some_and(|provider| reusable.is_some_and(|p| p.embedded_with(provider)));
        if carry_embeddings {
            next.dimensions = reusable.and_then(|p| p.dimensions);
        }

        let total = scan.documents.len();
        let mut stats = IndexStats {
            total_files: total,
            warnings: scan
                .warnings
                .iter()
                .map(|w| format!("{}: {}", w.location, w.message))
                .collect(),
            ..IndexStats::default()
        };
        tracing::info!(
            "Indexing '{}': {} documents discovered ({}, {})",
            name,
            total,
            mode,
            if reusable.is_some() { "incremental" } else { "full" }
        );

        // Tokenizing
        let mut done = 0;
        let mut refreshed = 0;
        let mut pending: Vec<(String, String)> = Vec::new();
        for doc in &scan.documents {
            self.check_cancelled(options)?;
            lock.touch();

            let disposition = self
                .process_document(doc, reusable, carry_embeddings, &tokenizer, &mut next, &mut refreshed)
                .await;
            let needs_embedding = match disposition {
                Ok(Disposition::Reused { needs_embedding }) => {
                    stats.reused_files += 1;
                    needs_embedding
                }
                Ok(Disposition::Rebuilt { needs_embedding }) => {
                    stats.indexed_files += 1;
                    needs_embedding
                }
                Err(e) => {
                    tracing::warn!("Skipping {}: {:#}", doc.id, e);
                    stats.skipped_files += 1;
                    stats.warnings.push(format!("{}: {:#}", doc.id, e));
                    None
                }
            };

            match needs_embedding {
                Some(text) => pending.push((doc.id.clone(), text)),
                None => done += 1,
            }
            progress.emit(Stage::Tokenizing, done, total, &doc.id);
            tokio::task::yield_now().await;
        }

        if let Some(previous) = &previous {
            let discovered: BTreeSet<&str> = scan.documents.iter().map(|d| d.id.as_str()).collect();
            stats.removed_files = previous
                .documents
                .keys()
                .filter(|id| !discovered.contains(id.as_str()))
                .count();
            if stats.removed_files > 0 {
                tracing::debug!("{} documents no longer present", stats.removed_files);
            }
        }

        // Scoring
        next.index.compute_idf();
        progress.emit(Stage::Scoring, done, total, "idf");

        // Embedding
        if let (BuildMode::Hybrid, Some(provider)) = (mode, &self.provider)
            && !pending.is_empty()
        {
            let fallback = self
                .embed_pending(
                    Arc::clone(provider),
                    pending,
                    options,
                    &lock,
                    &mut next,
                    &mut stats,
                    &mut progress,
                    &mut done,
                    total,
                )
                .await?;

            if let Some(error) = fallback {
                tracing::warn!(
                    "Embedding provider '{}' unavailable ({}); '{}' falls back to lexical-only",
                    provider.name(),
                    error,
                    name
                );
                stats
                    .warnings
                    .push(format!("embedding disabled, lexical-only: {}", error));
                next.mode = BuildMode::LexicalOnly;
                next.embeddings.clear();
                next.dimensions = None;
                next.provider = None;
                done = total;
                progress.emit(Stage::Embedding, done, total, "lexical-only fallback");
            }
        }
        if next.mode == BuildMode::Hybrid && next.dimensions.is_none() {
            next.dimensions = next.embeddings.values().next().map(Vec::len);
        }

        stats.cache_hit = previous.as_ref().is_some_and(|p| {
            p.mode == next.mode && p.provider == next.provider && p.tokenized_with(&next.tokenizer)
        })
            && !options.force
            && stats.indexed_files == 0
            && stats.removed_files == 0
            && stats.skipped_files == 0
            && stats.embedded_files == 0;

        // Persisting
        let snapshot = match previous {
            Some(previous) if stats.cache_hit && refreshed == 0 => {
                tracing::debug!("Snapshot for '{}' is current, keeping it", name);
                previous
            }
            _ => {
                next.indexed_at_ms = now_millis();
                progress.emit(
                    Stage::Persisting,
                    done,
                    total,
                    &self.store.snapshot_path(name).display().to_string(),
                );
                self.store
                    .save_snapshot(name, &next)
                    .await
                    .map_err(|source| EngineError::Persist {
                        corpus: name.clone(),
                        source,
                    })?;
                next
            }
        };

        progress.emit(Stage::Completed, total, total, name.as_str());
        tracing::info!(
            "Indexed '{}' in {:?}: {} documents, {} rebuilt, {} reused, {} skipped, {} removed, {} embedded{}",
            name,
            started.elapsed(),
            snapshot.document_count(),
            stats.indexed_files,
            stats.reused_files,
            stats.skipped_files,
            stats.removed_files,
            stats.embedded_files,
            if stats.cache_hit { " (cache hit)" } else { "" }
        );

        Ok(IndexRun {
            outcome: IndexOutcome {
                corpus: name.clone(),
                mode: snapshot.mode,
                indexed_at_ms: snapshot.indexed_at_ms,
                document_count: snapshot.document_count(),
                stats,
            },
            snapshot: Arc::new(snapshot),
        })
    }

    /// Decides whether `doc` can be copied forward and otherwise rebuilds it.
    async fn process_document(
        &self,
        doc: &DocumentDescriptor,
        reusable: Option<&Snapshot>,
        carry_embeddings: bool,
        tokenizer: &Tokenizer,
        next: &mut Snapshot,
        refreshed: &mut usize,
    ) -> crate::error::Result<Disposition> {
        let prior = reusable.and_then(|p| p.documents.get(&doc.id).map(|record| (p, record)));

        // Files with identical size and mtime are not read again.
        if let Some((previous, record)) = prior
            && matches!(doc.location, DocumentLocation::File(_))
            && record.fingerprint.same_metadata(doc.size, doc.modified_ms)
        {
            tracing::trace!("{} unchanged (metadata)", doc.id);
            let needs_embedding =
                Self::copy_forward(previous, &doc.id, record.clone(), carry_embeddings, next);
            return Ok(Disposition::Reused { needs_embedding });
        }

        let content = doc.load_content().await?;
        let hash = ContentHash::of(content.as_bytes());
        let fingerprint = Fingerprint {
            hash,
            size: doc.size,
            modified_ms: doc.modified_ms,
        };

        if let Some((previous, record)) = prior
            && previous.is_unchanged(&doc.id, &hash)
        {
            tracing::trace!("{} unchanged (content hash)", doc.id);
            if record.fingerprint != fingerprint {
                *refreshed += 1;
            }
            let record = DocumentRecord {
                fingerprint,
                ..record.clone()
            };
            let needs_embedding =
                Self::copy_forward(previous, &doc.id, record, carry_embeddings, next);
            next.index.set_modified(&doc.id, doc.modified_ms);
            return Ok(Disposition::Reused { needs_embedding });
        }

        tracing::debug!("Tokenizing {}", doc.id);
        let tokens = tokenizer.tokenize(&content);
        next.index
            .add_or_replace_document(&doc.id, &tokens, doc.modified_ms);
        let needs_embedding = (next.mode == BuildMode::Hybrid).then(|| content.clone());
        next.documents.insert(
            doc.id.clone(),
            DocumentRecord {
                fingerprint,
                extension: doc.extension.clone(),
                content,
            },
        );
        Ok(Disposition::Rebuilt { needs_embedding })
    }

    /// Copies postings, record and (if compatible) the vector of `id`.
    /// Returns the text to embed when no vector could be carried.
    fn copy_forward(
        previous: &Snapshot,
        id: &str,
        record: DocumentRecord,
        carry_embeddings: bool,
        next: &mut Snapshot,
    ) -> Option<String> {
        next.index.copy_document_from(&previous.index, id);

        let mut needs_embedding = None;
        if next.mode == BuildMode::Hybrid {
            let carried = previous
                .embeddings
                .get(id)
                .filter(|_| carry_embeddings)
                .filter(|v| next.dimensions.is_none_or(|dims| dims == v.len()));
            match carried {
                Some(vector) => {
                    next.embeddings.insert(id.to_string(), vector.clone());
                }
                None => needs_embedding = Some(record.content.clone()),
            }
        }
        next.documents.insert(id.to_string(), record);
        needs_embedding
    }

    /// Embeds every pending document. Returns the provider error that
    /// ended hybrid mode for this run, if any.
    ///
    /// Documents whose embedding failed are dropped only once every request
    /// has resolved without a fatal error; a lexical-only fallback keeps them.
    #[allow(clippy::too_many_arguments)]
    async fn embed_pending(
        &self,
        provider: Arc<dyn EmbeddingProvider>,
        pending: Vec<(String, String)>,
        options: &IndexOptions,
        lock: &IndexLock,
        next: &mut Snapshot,
        stats: &mut IndexStats,
        progress: &mut ProgressReporter,
        done: &mut usize,
        total: usize,
    ) -> Result<Option<ProviderError>, EngineError> {
        tracing::debug!(
            "Embedding {} documents with '{}' ({} in flight)",
            pending.len(),
            provider.name(),
            self.embedding_concurrency
        );
        progress.emit(Stage::Embedding, *done, total, "start");

        let mut rejected: Vec<(String, ProviderError)> = Vec::new();
        let mut results = std::pin::pin!(embed_documents(
            provider,
            pending,
            self.embedding_concurrency
        ));
        while let Some((id, result)) = results.next().await {
            self.check_cancelled(options)?;
            lock.touch();

            let result = result.and_then(|vector| {
                validate_vector(&vector, next.dimensions).map(|()| vector)
            });
            match result {
                Ok(vector) => {
                    next.dimensions.get_or_insert(vector.len());
                    next.embeddings.insert(id.clone(), vector);
                    stats.embedded_files += 1;
                }
                Err(error) if error.is_fatal() => return Ok(Some(error)),
                Err(error) => rejected.push((id.clone(), error)),
            }

            *done += 1;
            progress.emit(Stage::Embedding, *done, total, &id);
            tokio::task::yield_now().await;
        }

        for (id, error) in rejected {
            tracing::warn!("Skipping {}: {}", id, error);
            stats.skipped_files += 1;
            stats.warnings.push(format!("{}: {}", id, error));
            next.index.remove_document(&id);
            next.documents.remove(&id);
        }
        Ok(None)
    }
}

fn source_label(source: &SourceConfig) -> String {
    match source {
        SourceConfig::Directory { root } => root.display().to_string(),
        SourceConfig::Files { paths, .. } => format!("{} files", paths.len()),
        SourceConfig::Inline { documents } => format!("{} inline documents", documents.len()),
    }
}
