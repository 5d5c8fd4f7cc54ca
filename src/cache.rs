//! Snapshot persistence with fingerprint-based change detection.
//!
//! Each corpus has one snapshot file under `<root>/snapshots/` and, while an
//! indexing pass runs, one lock file under `<root>/locks/`. Snapshots are
//! written to a temporary file and renamed into place, so readers only ever
//! see a complete previous or complete new snapshot.

use crate::error::Result;
use crate::search::{LexicalIndex, TokenizerConfig};
use crate::types::{BuildMode, CorpusName, now_millis};
use anyhow::{Context, bail, ensure};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use xxhash_rust::xxh3::xxh3_64;

/// Bumped whenever the snapshot layout changes. Older files are rebuilt.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 2;

/// Leading bytes of every snapshot file.
const SNAPSHOT_MAGIC: &[u8; 4] = b"CMPS";

const SNAPSHOT_EXTENSION: &str = "snapshot";

/// 64-bit xxh3 digest of document content.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ContentHash(u64);

impl ContentHash {
    pub fn of(content: &[u8]) -> Self {
        Self(xxh3_64(content))
    }

    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Returns the hash as a lowercase hexadecimal string
    pub fn as_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

impl FromStr for ContentHash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 16 {
            return Err(ParseHashError::InvalidLength(s.len()));
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| ParseHashError::InvalidHex)
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.as_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error type for hash parsing failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseHashError {
    #[error("invalid hexadecimal characters in hash string")]
    InvalidHex,
    #[error("invalid hash length: expected 16 hex characters, got {0}")]
    InvalidLength(usize),
}

/// What is remembered about a document to decide whether it changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: ContentHash,
    pub size: u64,
    pub modified_ms: u64,
}

impl Fingerprint {
    /// Size and mtime match, so the content need not be read again.
    pub const fn same_metadata(&self, size: u64, modified_ms: u64) -> bool {
        self.size == size && self.modified_ms == modified_ms
    }
}

/// Stored state of one indexed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub fingerprint: Fingerprint,
    pub extension: Option<String>,
    /// Content at index time, used for snippets.
    pub content: String,
}

/// Durable index state of one corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub corpus: CorpusName,
    pub mode: BuildMode,
    pub indexed_at_ms: u64,
    pub documents: BTreeMap<String, DocumentRecord>,
    pub index: LexicalIndex,
    /// One vector per document in hybrid mode, empty otherwise.
    pub embeddings: BTreeMap<String, Vec<f32>>,
    pub dimensions: Option<usize>,
    /// Tokenizer the postings were built with.
    pub tokenizer: TokenizerConfig,
    /// Name of the provider that produced `embeddings`.
    pub provider: Option<String>,
}

impl Snapshot {
    pub fn new(corpus: CorpusName, mode: BuildMode) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            corpus,
            mode,
            indexed_at_ms: now_millis(),
            documents: BTreeMap::new(),
            index: LexicalIndex::new(),
            embeddings: BTreeMap::new(),
            dimensions: None,
            tokenizer: TokenizerConfig::default(),
            provider: None,
        }
    }

    /// Whether postings were built by a tokenizer configured like `tokenizer`.
    pub fn tokenized_with(&self, tokenizer: &TokenizerConfig) -> bool {
        self.tokenizer == *tokenizer
    }

    /// Whether stored vectors can be reused with the provider named `provider`.
    pub fn embedded_with(&self, provider: &str) -> bool {
        self.mode == BuildMode::Hybrid && self.provider.as_deref() == Some(provider)
    }

    /// Whether `id` is stored with the same content hash.
    pub fn is_unchanged(&self, id: &str, current: &ContentHash) -> bool {
        self.fingerprint(id).is_some_and(|f| f.hash == *current)
    }

    pub fn fingerprint(&self, id: &str) -> Option<&Fingerprint> {
        self.documents.get(id).map(|d| &d.fingerprint)
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Checks the cross-structure invariants of a decoded snapshot.
    pub fn validate(&self, corpus: &CorpusName) -> Result<()> {
        ensure!(
            self.format_version == SNAPSHOT_FORMAT_VERSION,
            "format version {} (expected {})",
            self.format_version,
            SNAPSHOT_FORMAT_VERSION
        );
        ensure!(
            self.corpus == *corpus,
            "snapshot belongs to corpus '{}'",
            self.corpus
        );
        ensure!(
            self.index.document_count() == self.documents.len()
                && self.documents.keys().all(|id| self.index.contains(id)),
            "index and document records disagree"
        );

        match self.mode {
            BuildMode::LexicalOnly => {
                ensure!(self.embeddings.is_empty(), "lexical-only snapshot has embeddings");
                ensure!(self.provider.is_none(), "lexical-only snapshot names a provider");
            }
            BuildMode::Hybrid => {
                ensure!(
                    self.embeddings.len() == self.documents.len()
                        && self.documents.keys().all(|id| self.embeddings.contains_key(id)),
                    "hybrid snapshot is missing embeddings"
                );
                if let Some(dims) = self.dimensions {
                    ensure!(
                        self.embeddings.values().all(|v| v.len() == dims),
                        "embedding dimensionality is inconsistent"
                    );
                } else {
                    ensure!(self.embeddings.is_empty(), "embeddings without dimensionality");
                }
            }
        }
        Ok(())
    }
}

/// Owns the on-disk layout of snapshots and lock files.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    lock_stale_after: Duration,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_stale_after: Duration::from_secs(30 * 60),
        }
    }

    /// Age after which a leftover lock file is treated as abandoned.
    #[must_use]
    pub const fn with_lock_stale_after(mut self, age: Duration) -> Self {
        self.lock_stale_after = age;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self, corpus: &CorpusName) -> PathBuf {
        self.root
            .join("snapshots")
            .join(format!("{}.{}", corpus, SNAPSHOT_EXTENSION))
    }

    fn lock_path(&self, corpus: &CorpusName) -> PathBuf {
        self.root.join("locks").join(format!("{}.lock", corpus))
    }

    /// Modification time of the snapshot file, if one exists.
    pub async fn snapshot_modified(&self, corpus: &CorpusName) -> Option<SystemTime> {
        tokio::fs::metadata(self.snapshot_path(corpus))
            .await
            .ok()?
            .modified()
            .ok()
    }

    /// Loads the snapshot for `corpus`.
    ///
    /// Missing, unreadable, truncated or otherwise invalid files all yield
    /// `None`, which callers treat as "never indexed".
    pub async fn load_snapshot(&self, corpus: &CorpusName) -> Option<Snapshot> {
        let path = self.snapshot_path(corpus);
        let corpus = corpus.clone();

        // Deserialize in spawn_blocking since it's CPU intensive
        tokio::task::spawn_blocking(move || {
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!("No snapshot for '{}' at {}", corpus, path.display());
                    return None;
                }
                Err(e) => {
                    tracing::warn!("Failed to read snapshot {}: {}", path.display(), e);
                    return None;
                }
            };

            match decode_snapshot(&bytes, &corpus) {
                Ok(snapshot) => {
                    tracing::debug!(
                        "Loaded snapshot for '{}' ({} documents, {})",
                        corpus,
                        snapshot.document_count(),
                        snapshot.mode
                    );
                    Some(snapshot)
                }
                Err(e) => {
                    tracing::warn!(
                        "Ignoring unusable snapshot {}: {:#}; corpus needs a rebuild",
                        path.display(),
                        e
                    );
                    None
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Atomically replaces the snapshot for `corpus`.
    pub async fn save_snapshot(&self, corpus: &CorpusName, snapshot: &Snapshot) -> Result<()> {
        if snapshot.corpus != *corpus {
            bail!(
                "refusing to store snapshot of '{}' as '{}'",
                snapshot.corpus,
                corpus
            );
        }

        let path = self.snapshot_path(corpus);
        let snapshot = snapshot.clone();

        // Serialize in spawn_blocking since it's CPU intensive
        tokio::task::spawn_blocking(move || write_atomically(&path, &snapshot))
            .await
            .context("Snapshot writer task panicked")?
    }

    /// Tries to take the indexing lock for `corpus`.
    ///
    /// Returns `Ok(None)` when another pass holds it. An abandoned lock file
    /// is removed and acquisition retried once.
    pub fn try_lock(&self, corpus: &CorpusName) -> Result<Option<IndexLock>> {
        let path = self.lock_path(corpus);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory {}", parent.display()))?;
        }

        for attempt in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    let owner = lock_owner();
                    if let Err(e) = file.write_all(owner.as_bytes()) {
                        let _ = std::fs::remove_file(&path);
                        return Err(e)
                            .with_context(|| format!("Failed to write lock file {}", path.display()));
                    }
                    return Ok(Some(IndexLock { path, owner }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt == 0 && self.lock_is_stale(&path) {
                        tracing::warn!("Removing abandoned index lock {}", path.display());
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    return Ok(None);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create lock file {}", path.display()));
                }
            }
        }
        Ok(None)
    }

    /// Whether a live (non-abandoned) lock exists for `corpus`.
    pub fn is_locked(&self, corpus: &CorpusName) -> bool {
        let path = self.lock_path(corpus);
        path.exists() && !self.lock_is_stale(&path)
    }

    /// A lock is abandoned once its owning process is gone. Where process
    /// liveness cannot be checked, a lock older than the stale threshold is.
    fn lock_is_stale(&self, path: &Path) -> bool {
        let owner_alive = std::fs::read_to_string(path)
            .ok()
            .and_then(|content| lock_pid(&content))
            .and_then(process_alive);
        match owner_alive {
            Some(alive) => !alive,
            None => std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age >= self.lock_stale_after),
        }
    }
}

static LOCK_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Content identifying one lock acquisition.
fn lock_owner() -> String {
    format!(
        "pid={} at={} seq={}\n",
        std::process::id(),
        now_millis(),
        LOCK_SEQUENCE.fetch_add(1, Ordering::Relaxed)
    )
}

fn lock_pid(content: &str) -> Option<u32> {
    content
        .split_whitespace()
        .find_map(|field| field.strip_prefix("pid="))
        .and_then(|pid| pid.parse().ok())
}

/// `None` on platforms without `/proc`.
fn process_alive(pid: u32) -> Option<bool> {
    let proc = Path::new("/proc");
    proc.is_dir().then(|| proc.join(pid.to_string()).exists())
}

/// Exclusive right to index one corpus. Released on drop.
#[derive(Debug)]
pub struct IndexLock {
    path: PathBuf,
    owner: String,
}

impl IndexLock {
    /// Whether the lock file on disk is still the one this lock created.
    pub fn is_held(&self) -> bool {
        std::fs::read_to_string(&self.path).is_ok_and(|content| content == self.owner)
    }

    /// Refreshes the lock file's mtime so age-based checks see an active run.
    pub fn touch(&self) {
        if !self.is_held() {
            tracing::warn!("Index lock {} is no longer ours", self.path.display());
            return;
        }
        let result = std::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .and_then(|file| file.set_modified(SystemTime::now()));
        if let Err(e) = result {
            tracing::debug!("Failed to refresh index lock {}: {}", self.path.display(), e);
        }
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if !self.is_held() {
            tracing::warn!(
                "Index lock {} was taken over, leaving it in place",
                self.path.display()
            );
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Failed to release index lock {}: {}", self.path.display(), e);
        }
    }
}

fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(1024);
    bytes.extend_from_slice(SNAPSHOT_MAGIC);
    bytes.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
    postcard::to_io(snapshot, &mut bytes).context("Failed to serialize snapshot")?;
    Ok(bytes)
}

fn decode_snapshot(bytes: &[u8], corpus: &CorpusName) -> Result<Snapshot> {
    let header_len = SNAPSHOT_MAGIC.len() + 4;
    ensure!(bytes.len() > header_len, "file is truncated");
    ensure!(&bytes[..4] == SNAPSHOT_MAGIC, "not a snapshot file");

    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[4..header_len]);
    let version = u32::from_le_bytes(version);
    ensure!(
        version == SNAPSHOT_FORMAT_VERSION,
        "format version {} (expected {})",
        version,
        SNAPSHOT_FORMAT_VERSION
    );

    let (snapshot, rest): (Snapshot, _) =
        postcard::take_from_bytes(&bytes[header_len..]).context("Failed to decode snapshot")?;
    ensure!(rest.is_empty(), "{} trailing bytes after snapshot", rest.len());
    snapshot.validate(corpus)?;
    Ok(snapshot)
}

fn write_atomically(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let parent = path
        .parent()
        .context("Snapshot path has no parent directory")?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory {}", parent.display()))?;

    let bytes = encode_snapshot(snapshot)?;
    let tmp = path.with_extension(format!("{}.tmp.{}", SNAPSHOT_EXTENSION, std::process::id()));

    let written = (|| -> Result<()> {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(&bytes)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move snapshot into {}", path.display()))
    })();

    if written.is_err() {
        let _ = std::fs::remove_file(&tmp);
    } else {
        tracing::debug!(
            "Stored snapshot for '{}' ({} bytes) at {}",
            snapshot.corpus,
            bytes.len(),
            path.display()
        );
    }
    written
}
