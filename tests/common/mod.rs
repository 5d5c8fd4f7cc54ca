//! Shared test fixtures and utilities for integration tests.
//!
//! # Test Isolation Strategy
//!
//! Every test gets its own [`Project`]: a temporary project tree plus a
//! separate temporary storage root, so snapshots and lock files never leak
//! between tests.
//!
//! # Available Fixtures
//!
//! - `project`: empty project, storage root configured
//! - `three_docs`: project with `docs/doc1.md`, `docs/doc2.md`, `docs/doc3.md`
//!
//! Embedding providers are deterministic fakes: [`HashEmbedder`] (counts
//! calls), [`UnavailableEmbedder`] (always fatal), [`FlakyEmbedder`]
//! (fails for documents mentioning "flaky"), [`GatedEmbedder`] (blocks until
//! released) and [`RevokedEmbedder`] (per-request failures, then fatal).

use corpus_mcp::cache::Snapshot;
use corpus_mcp::config::{CorpusConfig, EngineConfig, SourceConfig};
use corpus_mcp::embedding::EmbeddingProvider;
use corpus_mcp::scan::FilterConfig;
use corpus_mcp::search::TokenizerConfig;
use corpus_mcp::{BuildMode, CorpusName, ProgressCallback, ProgressEvent, ProviderError, SearchService};
use futures::future::BoxFuture;
use rstest::fixture;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// A temporary workspace directory for test isolation.
///
/// Provides basic filesystem operations within a temp directory that is
/// automatically cleaned up when dropped.
#[allow(dead_code)] // Methods used across different integration test crates
pub struct TempWorkspace {
    _temp: TempDir,
    root: PathBuf,
}

#[allow(dead_code)] // Methods used across different integration test crates
impl TempWorkspace {
    /// Creates a new empty temporary workspace.
    pub fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp directory");
        let root = temp.path().to_path_buf();
        Self { _temp: temp, root }
    }

    /// Returns the root path of this workspace.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Creates a directory (and all parent directories) within this workspace.
    ///
    /// # Panics
    /// Panics if directory creation fails.
    pub fn create_dir(&self, path: &str) {
        let full_path = self.root.join(path);
        std::fs::create_dir_all(&full_path)
            .unwrap_or_else(|e| panic!("Failed to create directory '{}': {}", path, e));
    }

    /// Creates a file with the given content within this workspace.
    ///
    /// Parent directories are created automatically if they don't exist.
    ///
    /// # Panics
    /// Panics if file creation fails.
    pub fn create_file(&self, path: &str, content: &str) {
        self.create_bytes(path, content.as_bytes());
    }

    /// Like [`create_file`](Self::create_file), for arbitrary bytes.
    pub fn create_bytes(&self, path: &str, content: &[u8]) {
        let full_path = self.root.join(path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).unwrap_or_else(|e| {
                panic!("Failed to create parent directory for '{}': {}", path, e)
            });
        }
        std::fs::write(&full_path, content)
            .unwrap_or_else(|e| panic!("Failed to write file '{}': {}", path, e));
    }

    /// Removes a file from this workspace.
    pub fn remove_file(&self, path: &str) {
        std::fs::remove_file(self.root.join(path))
            .unwrap_or_else(|e| panic!("Failed to remove file '{}': {}", path, e));
    }
}

impl Default for TempWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// A project tree plus an isolated storage root.
#[allow(dead_code)] // Methods used across different integration test crates
pub struct Project {
    pub workspace: TempWorkspace,
    storage: TempDir,
}

#[allow(dead_code)] // Methods used across different integration test crates
impl Project {
    pub fn new() -> Self {
        Self {
            workspace: TempWorkspace::new(),
            storage: TempDir::new().expect("Failed to create storage directory"),
        }
    }

    pub fn root(&self) -> &Path {
        self.workspace.path()
    }

    pub fn storage_root(&self) -> &Path {
        self.storage.path()
    }

    /// A corpus over `<project>/<dir>`.
    pub fn directory_corpus(&self, name: &str, dir: &str, mode: BuildMode) -> CorpusConfig {
        CorpusConfig {
            name: CorpusName::new(name).expect("valid corpus name"),
            source: SourceConfig::Directory {
                root: self.root().join(dir),
            },
            mode,
            auto_index: false,
            filter: FilterConfig::default(),
            tokenizer: TokenizerConfig::default(),
            max_file_bytes: 1024 * 1024,
        }
    }

    /// Engine configuration for `corpora`, storing under this project's storage root.
    pub fn config(&self, corpora: Vec<CorpusConfig>) -> EngineConfig {
        EngineConfig {
            storage_root: Some(self.storage_root().to_path_buf()),
            corpora,
            ..EngineConfig::default()
        }
        .resolve(self.root())
    }

    pub fn service(
        &self,
        corpora: Vec<CorpusConfig>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
    ) -> SearchService {
        SearchService::new(self.config(corpora), provider)
    }

    /// Reads the persisted snapshot straight from disk.
    pub async fn snapshot(&self, service: &SearchService, corpus: &str) -> Option<Snapshot> {
        let name = CorpusName::new(corpus).expect("valid corpus name");
        service.store().load_snapshot(&name).await
    }
}

impl Default for Project {
    fn default() -> Self {
        Self::new()
    }
}

#[fixture]
pub fn project() -> Project {
    Project::new()
}

/// The three-document corpus: "alpha beta", "beta gamma", "alpha alpha gamma".
#[fixture]
pub fn three_docs() -> Project {
    let project = Project::new();
    project.workspace.create_file("docs/doc1.md", "alpha beta");
    project.workspace.create_file("docs/doc2.md", "beta gamma");
    project.workspace.create_file("docs/doc3.md", "alpha alpha gamma");
    project
}

/// Records every progress event of a run.
#[allow(dead_code)]
pub fn progress_recorder() -> (ProgressCallback, Arc<Mutex<Vec<ProgressEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: ProgressCallback = Arc::new(move |event: &ProgressEvent| {
        sink.lock().unwrap().push(event.clone());
    });
    (callback, events)
}

const FAKE_DIMENSIONS: usize = 8;

/// Bag-of-words hashed into 8 buckets. Deterministic, counts calls.
#[derive(Debug, Default)]
pub struct HashEmbedder {
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl HashEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn bucket_vector(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0; FAKE_DIMENSIONS];
    for word in text.split_whitespace() {
        let bucket = word
            .to_lowercase()
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize))
            % FAKE_DIMENSIONS;
        vector[bucket] += 1.0;
    }
    if vector.iter().all(|v| *v == 0.0) {
        vector[0] = 1.0;
    }
    vector
}

impl EmbeddingProvider for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, ProviderError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(bucket_vector(text))
        })
    }
}

/// Behaves like a provider with missing credentials.
#[derive(Debug, Default)]
pub struct UnavailableEmbedder;

impl EmbeddingProvider for UnavailableEmbedder {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn embed<'a>(&'a self, _text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, ProviderError>> {
        Box::pin(async { Err(ProviderError::Unauthenticated) })
    }
}

/// Fails individual requests for text containing "flaky".
#[derive(Debug, Default)]
pub struct FlakyEmbedder;

impl EmbeddingProvider for FlakyEmbedder {
    fn name(&self) -> &str {
        "flaky"
    }

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, ProviderError>> {
        Box::pin(async move {
            if text.contains("flaky") {
                Err(ProviderError::Request("timed out".into()))
            } else {
                Ok(bucket_vector(text))
            }
        })
    }
}

/// Holds every request until `gate` is cancelled.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct GatedEmbedder {
    pub gate: tokio_util::sync::CancellationToken,
}

impl EmbeddingProvider for GatedEmbedder {
    fn name(&self) -> &str {
        "gated"
    }

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, ProviderError>> {
        Box::pin(async move {
            self.gate.cancelled().await;
            Ok(bucket_vector(text))
        })
    }
}

/// Fails text containing "flaky" per request and everything else as if
/// credentials had been revoked.
#[derive(Debug, Default)]
pub struct RevokedEmbedder;

impl EmbeddingProvider for RevokedEmbedder {
    fn name(&self) -> &str {
        "revoked"
    }

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, ProviderError>> {
        Box::pin(async move {
            if text.contains("flaky") {
                Err(ProviderError::Request("timed out".into()))
            } else {
                Err(ProviderError::Unauthenticated)
            }
        })
    }
}
