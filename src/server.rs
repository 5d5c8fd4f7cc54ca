//! MCP server exposing search, indexing and status as tools.

use crate::pipeline::{IndexOptions, ProgressCallback, ProgressEvent};
use crate::service::{DEFAULT_LIMIT, SearchOptions, SearchService};
use rmcp::{
    ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    schemars::{self, JsonSchema, generate::SchemaSettings},
    tool, tool_handler, tool_router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Parameters for the search tool
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SearchRequest {
    /// Free-text query; identifiers are split on camelCase, snake_case and hyphens
    pub query: String,
    /// Corpus to search (e.g. "codebase" or "knowledge"). Omit to search all corpora.
    #[serde(default)]
    pub corpus: Option<String>,
    /// Maximum number of results to return (default: 10)
    #[serde(default)]
    pub limit: Option<usize>,
    /// Include a snippet around the best-matching line of each result
    #[serde(default)]
    pub include_content: bool,
    /// Only return documents with these file extensions (without the dot)
    #[serde(default)]
    pub extensions: Option<Vec<String>>,
    /// Regular expression the document path must match
    #[serde(default)]
    pub path_filter: Option<String>,
    /// Regular expressions for document paths to leave out
    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

impl SearchRequest {
    fn options(&self) -> SearchOptions {
        SearchOptions {
            limit: self.limit.unwrap_or(DEFAULT_LIMIT),
            include_content: self.include_content,
            extensions: self.extensions.clone(),
            path_filter: self.path_filter.clone(),
            exclude_paths: self.exclude_paths.clone(),
        }
    }
}

/// Parameters for the index_corpus tool
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct IndexCorpusRequest {
    /// Corpus to (re)index
    pub corpus: String,
    /// Rebuild every document instead of only changed ones
    #[serde(default)]
    pub force: bool,
}

/// Parameters for the corpus_status tool
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CorpusStatusRequest {
    /// Corpus to report on. Omit for all corpora.
    #[serde(default)]
    pub corpus: Option<String>,
}

/// MCP server over a shared [`SearchService`]
#[derive(Clone)]
pub struct CorpusServer {
    service: Arc<SearchService>,

    /// Tool router for handling MCP tool calls
    tool_router: ToolRouter<Self>,
}

impl std::fmt::Debug for CorpusServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorpusServer")
            .field("service", &self.service)
            .finish()
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("Failed to serialize response: {}", e))
}

#[tool_router]
impl CorpusServer {
    pub fn new(service: Arc<SearchService>) -> Self {
        Self {
            service,
            tool_router: Self::tool_router(),
        }
    }

    pub const fn service(&self) -> &Arc<SearchService> {
        &self.service
    }

    #[tool(
        description = "Search indexed documents with TF-IDF ranking, blended with embedding similarity for corpora built in hybrid mode. Filters apply before ranking. Returns JSON with results and the number of indexed documents.",
        input_schema = inline_schema_for_type::<SearchRequest>()
    )]
    async fn search(
        &self,
        Parameters(request): Parameters<SearchRequest>,
    ) -> std::result::Result<String, String> {
        let options = request.options();
        let response = match &request.corpus {
            Some(corpus) => self.service.search(corpus, &request.query, &options).await,
            None => self.service.search_all(&request.query, &options).await,
        }
        .map_err(|e| e.to_string())?;
        to_json(&response)
    }

    #[tool(
        description = "Build or refresh the index of a corpus. Unchanged documents are reused unless force is set. Returns JSON run statistics and the resulting build mode.",
        input_schema = inline_schema_for_type::<IndexCorpusRequest>()
    )]
    async fn index_corpus(
        &self,
        Parameters(request): Parameters<IndexCorpusRequest>,
    ) -> std::result::Result<String, String> {
        let on_progress: ProgressCallback = Arc::new(|event: &ProgressEvent| {
            tracing::trace!(
                "[{}] {}/{} {}",
                event.stage,
                event.current,
                event.total,
                event.item
            );
        });
        let options = IndexOptions {
            force: request.force,
            on_progress: Some(on_progress),
            cancel: None,
        };

        let outcome = self
            .service
            .run_indexing(&request.corpus, options)
            .await
            .map_err(|e| format!("{:#}", anyhow::Error::from(e)))?;
        to_json(&outcome)
    }

    #[tool(
        description = "Report per-corpus index status: whether it is indexed, document count, build mode, staleness, and progress of a running build.",
        input_schema = inline_schema_for_type::<CorpusStatusRequest>()
    )]
    async fn corpus_status(
        &self,
        Parameters(request): Parameters<CorpusStatusRequest>,
    ) -> std::result::Result<String, String> {
        match &request.corpus {
            Some(corpus) => {
                let status = self
                    .service
                    .corpus_status(corpus)
                    .await
                    .map_err(|e| e.to_string())?;
                to_json(&status)
            }
            None => to_json(&self.service.get_status().await),
        }
    }
}

#[tool_handler]
impl ServerHandler for CorpusServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_protocol_version(ProtocolVersion::V_2024_11_05)
            .with_server_info(Implementation::from_build_env())
            .with_instructions(
                "corpus-mcp: ranked search over the project's code and knowledge documents. \
                 Check corpus_status first; a corpus that was never indexed returns no results \
                 until index_corpus has run. Small auxiliary corpora index themselves on first search.",
            )
    }
}

/// Generate an inline JSON schema for MCP tools
///
/// Unlike rmcp's default `schema_for_type()`, this function sets `inline_subschemas = true`
/// to generate inline enum definitions instead of $ref patterns.
pub fn inline_schema_for_type<T: JsonSchema>() -> Arc<JsonObject> {
    let mut settings = SchemaSettings::draft07();
    settings.transforms = vec![Box::new(schemars::transform::AddNullable::default())];
    settings.inline_subschemas = true;

    let generator = settings.into_generator();
    let schema = generator.into_root_schema_for::<T>();

    match serde_json::to_value(schema) {
        Ok(serde_json::Value::Object(object)) => Arc::new(object),
        other => {
            tracing::error!("Schema serialization produced a non-object value: {:?}", other);
            Arc::new(JsonObject::new())
        }
    }
}
