//! Error handling types and utilities.

use crate::types::CorpusName;

/// A specialized Result type for internal corpus-mcp plumbing.
///
/// This is an alias for `anyhow::Result` with context added via `.context()` and
/// `.with_context()` methods throughout the codebase. Operations exposed to
/// callers return [`EngineError`] instead.
pub type Result<T> = anyhow::Result<T>;

/// Errors surfaced by the indexing and query surface.
///
/// Per-document problems never show up here; they are counted in the run
/// statistics instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The corpus name is syntactically valid but not configured.
    #[error("unknown corpus '{0}'")]
    UnknownCorpus(String),

    /// The corpus name cannot be used as a corpus identifier.
    #[error("invalid corpus name '{name}': {reason}")]
    InvalidCorpusName { name: String, reason: &'static str },

    /// Filter configuration that cannot be compiled or contradicts itself.
    #[error("invalid filter configuration: {0}")]
    InvalidFilter(String),

    /// The document source itself (not a single document) cannot be read.
    #[error("document source for corpus '{corpus}' is unavailable")]
    SourceUnavailable {
        corpus: CorpusName,
        #[source]
        source: anyhow::Error,
    },

    /// Another indexing pass holds the corpus, in this process or another one.
    #[error("an indexing run for corpus '{0}' is already in progress")]
    BuildInProgress(CorpusName),

    /// The run observed its cancellation token; the previous snapshot is untouched.
    #[error("indexing of corpus '{0}' was cancelled")]
    Cancelled(CorpusName),

    /// Storage layout problems outside of the final snapshot write.
    #[error("storage error for corpus '{corpus}'")]
    Storage {
        corpus: CorpusName,
        #[source]
        source: anyhow::Error,
    },

    /// The finished snapshot could not be written.
    #[error("failed to persist snapshot for corpus '{corpus}'")]
    Persist {
        corpus: CorpusName,
        #[source]
        source: anyhow::Error,
    },
}

impl EngineError {
    /// True for errors raised before any scanning started.
    pub const fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownCorpus(_) | Self::InvalidCorpusName { .. } | Self::InvalidFilter(_)
        )
    }
}

/// Failure reported by an injected embedding provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The provider cannot serve any request (endpoint down, not configured).
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    /// Missing or rejected credentials.
    #[error("embedding provider rejected credentials")]
    Unauthenticated,

    /// A single request failed; other requests may still succeed.
    #[error("embedding request failed: {0}")]
    Request(String),

    /// The provider answered with something that is not a usable vector.
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether this failure means the provider is unusable for the whole run.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Unauthenticated)
    }
}
