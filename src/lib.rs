//! Hybrid code and knowledge search.
//!
//! Documents from named corpora are scanned, tokenized and indexed with
//! TF-IDF, optionally blended with embedding similarity, and persisted as
//! per-corpus snapshots that later runs update incrementally.

pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod pipeline;
pub mod scan;
pub mod search;
pub mod server;
pub mod service;
pub mod tracing;
pub mod types;

pub use config::{CorpusConfig, EngineConfig, SourceConfig};
pub use embedding::EmbeddingProvider;
pub use error::{EngineError, ProviderError};
pub use pipeline::{IndexOptions, IndexOutcome, IndexStats, ProgressCallback, ProgressEvent};
pub use server::CorpusServer;
pub use service::{CorpusStatus, SearchHit, SearchOptions, SearchResponse, SearchService};
pub use types::{BuildMode, CorpusName, Stage};
