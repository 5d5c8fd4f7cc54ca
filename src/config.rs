//! Engine configuration.
//!
//! Configuration lives in an optional `.corpus-mcp.toml` at the project root.
//! Every field has a default, so an absent file yields a working setup with a
//! `codebase` corpus over the project tree and a `knowledge` corpus over
//! `.knowledge/`.

use crate::error::Result;
use crate::scan::FilterConfig;
use crate::search::tokenize::TokenizerConfig;
use crate::types::{BuildMode, CorpusName};
use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::xxh3_64;

/// File name looked up in the project root.
pub const CONFIG_FILE_NAME: &str = ".corpus-mcp.toml";

/// Upper bound on in-flight embedding requests.
pub const MAX_EMBEDDING_CONCURRENCY: usize = 8;

const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Where snapshots and lock files live. Relative paths are resolved
    /// against the project root.
    pub storage_root: Option<PathBuf>,
    /// Weight of the lexical score in hybrid ranking.
    pub hybrid_alpha: f32,
    pub embedding_concurrency: usize,
    /// Number of query embeddings kept in memory.
    pub query_cache_size: usize,
    /// Snapshot age after which status reports it as possibly stale.
    pub stale_after_secs: u64,
    /// Lock file age after which it is considered abandoned.
    pub lock_stale_after_secs: u64,
    /// Lines in a search snippet, centred on the best-matching line.
    pub snippet_lines: usize,
    #[serde(rename = "corpus")]
    pub corpora: Vec<CorpusConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_root: None,
            hybrid_alpha: 0.5,
            embedding_concurrency: 4,
            query_cache_size: 128,
            stale_after_secs: 24 * 60 * 60,
            lock_stale_after_secs: 30 * 60,
            snippet_lines: 3,
            corpora: default_corpora(),
        }
    }
}

/// One named corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    pub name: CorpusName,
    pub source: SourceConfig,
    /// Preferred build mode. Hybrid degrades to lexical-only without a provider.
    #[serde(default = "default_mode")]
    pub mode: BuildMode,
    /// Index on first query if never indexed. Meant for small auxiliary sets.
    #[serde(default)]
    pub auto_index: bool,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

/// Where a corpus gets its documents from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum SourceConfig {
    /// Every matching file below `root`.
    Directory { root: PathBuf },
    /// A fixed list of files. Ids are relative to `root` when given.
    Files {
        #[serde(default)]
        root: Option<PathBuf>,
        paths: Vec<PathBuf>,
    },
    /// Documents embedded in the configuration itself.
    Inline { documents: Vec<InlineDocument> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InlineDocument {
    pub id: String,
    pub content: String,
}

const fn default_mode() -> BuildMode {
    BuildMode::Hybrid
}

const fn default_max_file_bytes() -> u64 {
    DEFAULT_MAX_FILE_BYTES
}

fn default_corpora() -> Vec<CorpusConfig> {
    vec![
        CorpusConfig {
            name: CorpusName::new_unchecked("codebase"),
            source: SourceConfig::Directory {
                root: PathBuf::from("."),
            },
            mode: BuildMode::Hybrid,
            auto_index: false,
            filter: FilterConfig::default(),
            tokenizer: TokenizerConfig::default(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        },
        CorpusConfig {
            name: CorpusName::new_unchecked("knowledge"),
            source: SourceConfig::Directory {
                root: PathBuf::from(".knowledge"),
            },
            mode: BuildMode::Hybrid,
            auto_index: true,
            filter: FilterConfig::default(),
            tokenizer: TokenizerConfig {
                stemming: true,
                ..TokenizerConfig::default()
            },
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        },
    ]
}

impl EngineConfig {
    /// Loads `<project_root>/.corpus-mcp.toml` if present, otherwise defaults,
    /// and resolves relative paths against `project_root`.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = project_root.join(CONFIG_FILE_NAME);
        let config = if path.is_file() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config = Self::from_toml(&content)
                .with_context(|| format!("Invalid config file {}", path.display()))?;
            tracing::info!("Loaded configuration from {}", path.display());
            config
        } else {
            tracing::debug!("No {} in {}, using defaults", CONFIG_FILE_NAME, project_root.display());
            Self::default()
        };

        Ok(config.resolve(project_root))
    }

    /// Parses and validates a TOML document. Paths stay as written.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.hybrid_alpha) {
            bail!("hybrid_alpha must be within [0, 1], got {}", self.hybrid_alpha);
        }
        if self.embedding_concurrency == 0 {
            bail!("embedding_concurrency must be at least 1");
        }

        let mut seen = BTreeSet::new();
        for corpus in &self.corpora {
            if !seen.insert(corpus.name.as_str()) {
                bail!("corpus '{}' is defined more than once", corpus.name);
            }
        }
        Ok(())
    }

    /// Makes every configured path absolute and fills in the storage root.
    pub fn resolve(mut self, project_root: &Path) -> Self {
        let absolute = |path: &Path| {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                project_root.join(path)
            }
        };

        self.storage_root = Some(match &self.storage_root {
            Some(root) => absolute(root),
            None => default_storage_root(project_root),
        });
        self.embedding_concurrency = self.embedding_concurrency.clamp(1, MAX_EMBEDDING_CONCURRENCY);

        for corpus in &mut self.corpora {
            match &mut corpus.source {
                SourceConfig::Directory { root } => *root = absolute(root),
                SourceConfig::Files { root, paths } => {
                    if let Some(root) = root {
                        *root = absolute(root);
                    }
                    for path in paths.iter_mut() {
                        *path = absolute(path);
                    }
                }
                SourceConfig::Inline { .. } => {}
            }
        }
        self
    }

    /// Storage root after [`resolve`](Self::resolve).
    pub fn storage_root(&self) -> PathBuf {
        self.storage_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(".corpus-mcp"))
    }

    pub fn corpus(&self, name: &str) -> Option<&CorpusConfig> {
        self.corpora.iter().find(|c| c.name.as_str() == name)
    }
}

/// Per-project directory under the user cache dir, keyed by the project path.
fn default_storage_root(project_root: &Path) -> PathBuf {
    let canonical = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());
    let key = format!(
        "{:016x}",
        xxh3_64(canonical.to_string_lossy().as_bytes())
    );

    match dirs::cache_dir() {
        Some(cache) => cache.join("corpus-mcp").join(key),
        None => project_root.join(".corpus-mcp"),
    }
}
