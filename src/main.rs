use corpus_mcp::{CorpusServer, EngineConfig, SearchService};
use rmcp::{ServiceExt, transport::stdio};
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout is reserved for the MCP protocol
    corpus_mcp::tracing::init();

    let project_root = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => std::env::current_dir()?,
    };
    let config = EngineConfig::load(&project_root)?;

    tracing::info!(
        "Starting corpus-mcp for {} ({} corpora)",
        project_root.display(),
        config.corpora.len()
    );

    // Embeddings are supplied by hosts that link the library; the binary runs lexical-only.
    let service = Arc::new(SearchService::new(config, None));
    service.initialize().await;

    let server = CorpusServer::new(service);
    let running = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!("Error serving MCP server: {:?}", e);
    })?;

    running.waiting().await?;

    Ok(())
}
