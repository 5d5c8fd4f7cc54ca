//! Document discovery.
//!
//! A [`Scanner`] enumerates the documents of one corpus and applies the
//! corpus filter. Enumeration only touches metadata and a short content sniff;
//! full content is read later through [`DocumentDescriptor::load_content`].
//! Calling [`Scanner::scan`] again restarts the enumeration from scratch.

mod text;

use crate::config::{InlineDocument, SourceConfig};
use crate::error::{EngineError, Result};
use crate::types::unix_millis;
use anyhow::{Context, bail};
use ignore::WalkBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-project ignore file honoured next to `.gitignore`.
pub const IGNORE_FILE_NAME: &str = ".corpusignore";

/// Default `ignore_list`: directory names rarely worth indexing.
pub const DEFAULT_IGNORE_LIST: &[&str] = &[
    "node_modules",
    "target",
    "dist",
    "build",
    ".git",
    ".svn",
    ".hg",
    "__pycache__",
    ".pytest_cache",
    ".tox",
    "venv",
    ".venv",
    ".gradle",
    ".idea",
    ".vscode",
    "coverage",
    ".cache",
];

/// Include/exclude rules for a corpus, as written in configuration.
///
/// Patterns are regular expressions matched anywhere in the document id
/// (a `/`-separated path relative to the corpus root).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterConfig {
    /// Allowed extensions without the leading dot. `None` means the text allow-list.
    pub extensions: Option<Vec<String>>,
    pub path_include_pattern: Option<String>,
    pub path_exclude_patterns: Vec<String>,
    /// File or directory names skipped wherever they appear. Setting it
    /// replaces [`DEFAULT_IGNORE_LIST`].
    pub ignore_list: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            extensions: None,
            path_include_pattern: None,
            path_exclude_patterns: Vec::new(),
            ignore_list: DEFAULT_IGNORE_LIST.iter().map(|d| (*d).to_string()).collect(),
        }
    }
}

/// A validated [`FilterConfig`].
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    extensions: Option<BTreeSet<String>>,
    include: Option<Regex>,
    excludes: Vec<Regex>,
    ignore: BTreeSet<String>,
}

impl DocumentFilter {
    /// Compiles and cross-checks the rules. Nothing is scanned here.
    pub fn compile(config: &FilterConfig) -> std::result::Result<Self, EngineError> {
        let extensions = match &config.extensions {
            None => None,
            Some(list) => {
                let mut set = BTreeSet::new();
                for ext in list {
                    let normalized = normalize_extension(ext);
                    if normalized.is_empty() {
                        return Err(EngineError::InvalidFilter(format!(
                            "empty extension in extension filter: {:?}",
                            ext
                        )));
                    }
                    set.insert(normalized);
                }
                if set.is_empty() {
                    return Err(EngineError::InvalidFilter(
                        "extension filter is empty and would match nothing".into(),
                    ));
                }
                Some(set)
            }
        };

        let include = config
            .path_include_pattern
            .as_deref()
            .map(compile_pattern)
            .transpose()?;

        if let Some(pattern) = &config.path_include_pattern
            && config.path_exclude_patterns.iter().any(|p| p == pattern)
        {
            return Err(EngineError::InvalidFilter(format!(
                "pattern '{}' is both included and excluded",
                pattern
            )));
        }

        let excludes = config
            .path_exclude_patterns
            .iter()
            .map(|p| compile_pattern(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let ignore = config
            .ignore_list
            .iter()
            .map(|name| name.trim_matches('/').to_string())
            .filter(|name| !name.is_empty())
            .collect();

        Ok(Self {
            extensions,
            include,
            excludes,
            ignore,
        })
    }

    pub const fn has_explicit_extensions(&self) -> bool {
        self.extensions.is_some()
    }

    /// Whether a file or directory name is on the ignore list.
    pub fn is_ignored_name(&self, name: &str) -> bool {
        self.ignore.contains(name)
    }

    /// Checks a document id and extension against every rule.
    pub fn allows(&self, id: &str, extension: Option<&str>) -> bool {
        if let Some(allowed) = &self.extensions {
            match extension {
                Some(ext) if allowed.contains(ext) => {}
                _ => return false,
            }
        }
        if id.split('/').any(|segment| self.is_ignored_name(segment)) {
            return false;
        }
        if let Some(include) = &self.include
            && !include.is_match(id)
        {
            return false;
        }
        !self.excludes.iter().any(|re| re.is_match(id))
    }
}

fn compile_pattern(pattern: &str) -> std::result::Result<Regex, EngineError> {
    Regex::new(pattern)
        .map_err(|e| EngineError::InvalidFilter(format!("invalid pattern '{}': {}", pattern, e)))
}

/// Lowercases and strips the leading dot.
pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

/// Extension of a `/`-separated id, normalized.
pub fn extension_of(id: &str) -> Option<String> {
    let name = id.rsplit('/').next().unwrap_or(id);
    let (stem, ext) = name.rsplit_once('.')?;
    (!stem.is_empty() && !ext.is_empty()).then(|| normalize_extension(ext))
}

/// Where a document's content comes from.
#[derive(Debug, Clone)]
pub enum DocumentLocation {
    File(PathBuf),
    Inline(Arc<str>),
}

/// A discovered document. Content is loaded on demand.
#[derive(Debug, Clone)]
pub struct DocumentDescriptor {
    /// Stable id: relative path with `/` separators, or the inline id.
    pub id: String,
    pub location: DocumentLocation,
    pub size: u64,
    /// Modification time in Unix milliseconds. Zero for inline documents.
    pub modified_ms: u64,
    pub extension: Option<String>,
}

impl DocumentDescriptor {
    pub fn path_segments(&self) -> impl Iterator<Item = &str> {
        self.id.split('/')
    }

    /// Reads the full content as UTF-8.
    pub async fn load_content(&self) -> Result<String> {
        match &self.location {
            DocumentLocation::Inline(content) => Ok(content.to_string()),
            DocumentLocation::File(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                String::from_utf8(bytes)
                    .with_context(|| format!("{} is not valid UTF-8", path.display()))
            }
        }
    }
}

/// A non-fatal problem encountered while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanWarning {
    pub location: String,
    pub message: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub discovered: usize,
    pub filtered: usize,
    pub skipped_binary: usize,
    pub skipped_oversized: usize,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Sorted by id.
    pub documents: Vec<DocumentDescriptor>,
    pub warnings: Vec<ScanWarning>,
    pub stats: ScanStats,
}

impl ScanOutcome {
    fn warn(&mut self, location: impl Into<String>, message: impl Into<String>) {
        let warning = ScanWarning {
            location: location.into(),
            message: message.into(),
        };
        warn!("Skipping {}: {}", warning.location, warning.message);
        self.warnings.push(warning);
    }
}

/// Enumerates the documents of one corpus source.
#[derive(Debug, Clone)]
pub struct Scanner {
    source: SourceConfig,
    filter: DocumentFilter,
    max_file_bytes: u64,
}

impl Scanner {
    pub const fn new(source: SourceConfig, filter: DocumentFilter, max_file_bytes: u64) -> Self {
        Self {
            source,
            filter,
            max_file_bytes,
        }
    }

    /// Enumerates the source. Fails only if the source as a whole is unreadable.
    pub fn scan(&self) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome::default();

        match &self.source {
            SourceConfig::Directory { root } => self.scan_directory(root, &mut outcome)?,
            SourceConfig::Files { root, paths } => {
                self.scan_files(root.as_deref(), paths, &mut outcome);
            }
            SourceConfig::Inline { documents } => self.scan_inline(documents, &mut outcome),
        }

        outcome.documents.sort_by(|a, b| a.id.cmp(&b.id));
        let before = outcome.documents.len();
        outcome.documents.dedup_by(|a, b| a.id == b.id);
        if outcome.documents.len() != before {
            debug!("Dropped {} duplicate document ids", before - outcome.documents.len());
        }

        debug!(
            "Scan complete: {} documents, {} filtered, {} binary, {} oversized, {} warnings",
            outcome.documents.len(),
            outcome.stats.filtered,
            outcome.stats.skipped_binary,
            outcome.stats.skipped_oversized,
            outcome.warnings.len()
        );
        Ok(outcome)
    }

    fn scan_directory(&self, root: &Path, outcome: &mut ScanOutcome) -> Result<()> {
        if !root.is_dir() {
            bail!("{} is not a readable directory", root.display());
        }

        let filter = self.filter.clone();
        let mut builder = WalkBuilder::new(root);
        builder
            .hidden(true)
            .require_git(false)
            .add_custom_ignore_filename(IGNORE_FILE_NAME)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                !filter.is_ignored_name(&entry.file_name().to_string_lossy())
            });

        for result in builder.build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(err) => {
                    outcome.warn(root.display().to_string(), err.to_string());
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }

            let path = entry.path();
            let Some(id) = relative_id(root, path) else {
                continue;
            };
            self.consider_file(id, path, true, outcome);
        }
        Ok(())
    }

    fn scan_files(&self, root: Option<&Path>, paths: &[PathBuf], outcome: &mut ScanOutcome) {
        for path in paths {
            let id = root
                .and_then(|root| relative_id(root, path))
                .unwrap_or_else(|| path.to_string_lossy().replace('\\', "/"));
            self.consider_file(id, path, false, outcome);
        }
    }

    fn scan_inline(&self, documents: &[InlineDocument], outcome: &mut ScanOutcome) {
        for doc in documents {
            outcome.stats.discovered += 1;
            let extension = extension_of(&doc.id);
            if !self.filter.allows(&doc.id, extension.as_deref()) {
                outcome.stats.filtered += 1;
                continue;
            }
            outcome.documents.push(DocumentDescriptor {
                id: doc.id.clone(),
                location: DocumentLocation::Inline(Arc::from(doc.content.as_str())),
                size: doc.content.len() as u64,
                modified_ms: 0,
                extension,
            });
        }
    }

    /// Applies filter, allow-list, size limit and binary sniff to one file.
    fn consider_file(
        &self,
        id: String,
        path: &Path,
        apply_allow_list: bool,
        outcome: &mut ScanOutcome,
    ) {
        outcome.stats.discovered += 1;
        let extension = extension_of(&id);

        if !self.filter.allows(&id, extension.as_deref()) {
            outcome.stats.filtered += 1;
            return;
        }
        if apply_allow_list && !self.filter.has_explicit_extensions() {
            let file_name = id.rsplit('/').next().unwrap_or(&id);
            if !text::is_text_file(file_name, extension.as_deref()) {
                outcome.stats.filtered += 1;
                return;
            }
        }

        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) => {
                outcome.warn(id, format!("cannot read metadata: {}", err));
                return;
            }
        };
        if !metadata.is_file() {
            outcome.warn(id, "not a regular file");
            return;
        }
        if metadata.len() > self.max_file_bytes {
            outcome.stats.skipped_oversized += 1;
            outcome.warn(
                id,
                format!("{} bytes exceeds limit of {}", metadata.len(), self.max_file_bytes),
            );
            return;
        }

        match text::sniff_binary(path) {
            Ok(true) => {
                outcome.stats.skipped_binary += 1;
                debug!("Skipping binary file {}", id);
                return;
            }
            Ok(false) => {}
            Err(err) => {
                outcome.warn(id, format!("cannot read: {}", err));
                return;
            }
        }

        let modified_ms = metadata.modified().map(unix_millis).unwrap_or(0);
        outcome.documents.push(DocumentDescriptor {
            id,
            location: DocumentLocation::File(path.to_path_buf()),
            size: metadata.len(),
            modified_ms,
            extension,
        });
    }
}

/// `/`-joined path of `path` below `root`.
fn relative_id(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    (!segments.is_empty()).then(|| segments.join("/"))
}
