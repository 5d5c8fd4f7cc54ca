mod common;

use assert2::{check, let_assert};
use common::{HashEmbedder, Project, project, three_docs};
use corpus_mcp::embedding::EmbeddingProvider;
use corpus_mcp::{BuildMode, IndexOptions, SearchOptions, SearchService};
use rstest::rstest;
use std::sync::Arc;

async fn indexed(project: &Project) -> SearchService {
    let service = project.service(
        vec![project.directory_corpus("docs", "docs", BuildMode::LexicalOnly)],
        None,
    );
    service
        .run_indexing("docs", IndexOptions::default())
        .await
        .unwrap();
    service
}

fn ids(response: &corpus_mcp::SearchResponse) -> Vec<&str> {
    response.results.iter().map(|hit| hit.id.as_str()).collect()
}

// --- Ranking ---

/// Test: Repeated terms rank higher; documents without the term are absent.
#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_ranks_by_tf_idf(three_docs: Project) {
    let service = indexed(&three_docs).await;

    let response = service
        .search("docs", "alpha", &SearchOptions::default())
        .await
        .unwrap();
    check!(ids(&response) == ["doc3.md", "doc1.md"]);
    check!(response.total_indexed == 3);
    check!(response.results[0].score > response.results[1].score);
    for hit in &response.results {
        check!(hit.score > 0.0 && hit.score <= 1.0);
        check!(hit.corpus.as_str() == "docs");
    }
}

/// Test: Results never exceed the limit and come in non-increasing score order.
#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_respects_limit(three_docs: Project) {
    let service = indexed(&three_docs).await;

    let options = SearchOptions {
        limit: 2,
        ..SearchOptions::default()
    };
    let response = service
        .search("docs", "alpha beta gamma", &options)
        .await
        .unwrap();
    check!(response.results.len() == 2);
    check!(response.results[0].score >= response.results[1].score);

    let options = SearchOptions {
        limit: 0,
        ..SearchOptions::default()
    };
    let response = service.search("docs", "alpha", &options).await.unwrap();
    check!(response.results.is_empty());
    check!(response.total_indexed == 3);
}

/// Test: Queries without usable tokens return nothing but still report the corpus size.
#[rstest]
#[case("")]
#[case("   ")]
#[case("the and of")]
#[tokio::test(flavor = "multi_thread")]
async fn search_without_tokens_is_empty(three_docs: Project, #[case] query: &str) {
    let service = indexed(&three_docs).await;

    let response = service
        .search("docs", query, &SearchOptions::default())
        .await
        .unwrap();
    check!(response.results.is_empty());
    check!(response.total_indexed == 3);
}

/// Test: A corpus that was never indexed answers with nothing.
#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_before_indexing_is_empty(three_docs: Project) {
    let service = three_docs.service(
        vec![three_docs.directory_corpus("docs", "docs", BuildMode::LexicalOnly)],
        None,
    );

    let response = service
        .search("docs", "alpha", &SearchOptions::default())
        .await
        .unwrap();
    check!(response.results.is_empty());
    check!(response.total_indexed == 0);
}

/// Test: Unknown terms match nothing.
#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_unknown_term(three_docs: Project) {
    let service = indexed(&three_docs).await;
    let response = service
        .search("docs", "omega", &SearchOptions::default())
        .await
        .unwrap();
    check!(response.results.is_empty());
}

// --- Filters ---

/// Test: Path and extension filters apply before the limit.
#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_filters_apply_before_limit(three_docs: Project) {
    let service = indexed(&three_docs).await;

    let options = SearchOptions {
        limit: 1,
        path_filter: Some("doc1".into()),
        ..SearchOptions::default()
    };
    let response = service.search("docs", "alpha", &options).await.unwrap();
    check!(ids(&response) == ["doc1.md"]);

    let options = SearchOptions {
        exclude_paths: vec!["doc3".into()],
        ..SearchOptions::default()
    };
    let response = service.search("docs", "alpha", &options).await.unwrap();
    check!(ids(&response) == ["doc1.md"]);

    let options = SearchOptions {
        extensions: Some(vec!["txt".into()]),
        ..SearchOptions::default()
    };
    let response = service.search("docs", "alpha", &options).await.unwrap();
    check!(response.results.is_empty());
    check!(response.total_indexed == 3);
}

// --- Content ---

/// Test: Snippets point at the best-matching line.
#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_returns_snippets(project: Project) {
    project.workspace.create_file(
        "docs/guide.md",
        "# Guide\n\nSetup is covered elsewhere.\nRebuild the search index nightly.\nThat is all.",
    );
    let service = indexed(&project).await;

    let options = SearchOptions {
        include_content: true,
        ..SearchOptions::default()
    };
    let response = service
        .search("docs", "rebuild index", &options)
        .await
        .unwrap();
    let_assert!(Some(hit) = response.results.first());
    let_assert!(Some(snippet) = &hit.snippet);
    check!(snippet.line == Some(4));
    check!(snippet.text.contains("Rebuild the search index nightly."));

    let response = service
        .search("docs", "rebuild index", &SearchOptions::default())
        .await
        .unwrap();
    check!(response.results[0].snippet.is_none());
}

/// Test: Identifiers are split so their parts are searchable.
#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_matches_identifier_parts(project: Project) {
    project
        .workspace
        .create_file("docs/src/lib.rs", "pub fn parseJsonValue(input: &str) {}");
    project
        .workspace
        .create_file("docs/src/other.rs", "fn unrelated() {}");
    let service = indexed(&project).await;

    let response = service
        .search("docs", "json", &SearchOptions::default())
        .await
        .unwrap();
    check!(ids(&response) == ["src/lib.rs"]);

    let response = service
        .search("docs", "parse_json_value", &SearchOptions::default())
        .await
        .unwrap();
    check!(ids(&response) == ["src/lib.rs"]);
}

/// Test: With stemming enabled, inflected forms match each other.
#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_with_stemming(project: Project) {
    project
        .workspace
        .create_file("docs/parser.md", "The input was parsed twice.");
    project
        .workspace
        .create_file("docs/other.md", "Nothing relevant here.");

    let mut corpus = project.directory_corpus("docs", "docs", BuildMode::LexicalOnly);
    corpus.tokenizer.stemming = true;
    let service = project.service(vec![corpus], None);
    service
        .run_indexing("docs", IndexOptions::default())
        .await
        .unwrap();

    let response = service
        .search("docs", "parsing", &SearchOptions::default())
        .await
        .unwrap();
    check!(ids(&response) == ["parser.md"]);
}

// --- Corpora ---

/// Test: Auto-index corpora build themselves on the first query.
#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_auto_indexes_knowledge_corpus(project: Project) {
    project
        .workspace
        .create_file("knowledge/faq.md", "Restart the worker after config changes.");
    let mut corpus = project.directory_corpus("knowledge", "knowledge", BuildMode::LexicalOnly);
    corpus.auto_index = true;
    let service = project.service(vec![corpus], None);

    let response = service
        .search("knowledge", "restart worker", &SearchOptions::default())
        .await
        .unwrap();
    check!(ids(&response) == ["faq.md"]);
    check!(response.total_indexed == 1);

    let status = service.corpus_status("knowledge").await.unwrap();
    check!(status.indexed);
    check!(status.auto_index);
}

/// Test: Searching all corpora merges their results by score.
#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_all_merges_corpora(three_docs: Project) {
    three_docs
        .workspace
        .create_file("notes/alpha.txt", "alpha");
    let service = three_docs.service(
        vec![
            three_docs.directory_corpus("docs", "docs", BuildMode::LexicalOnly),
            three_docs.directory_corpus("notes", "notes", BuildMode::LexicalOnly),
        ],
        None,
    );
    for corpus in ["docs", "notes"] {
        service
            .run_indexing(corpus, IndexOptions::default())
            .await
            .unwrap();
    }

    let response = service
        .search_all("alpha", &SearchOptions::default())
        .await
        .unwrap();
    check!(response.total_indexed == 4);
    check!(response.results.len() == 3);
    check!(response.results[0].corpus.as_str() == "notes");
    check!(response.results[0].id == "alpha.txt");
    check!(response.results.windows(2).all(|w| w[0].score >= w[1].score));

    let options = SearchOptions {
        limit: 1,
        ..SearchOptions::default()
    };
    let response = service.search_all("alpha", &options).await.unwrap();
    check!(response.results.len() == 1);
}

// --- Hybrid ---

/// Test: Hybrid scores stay within [0, 1] and still favour lexical matches.
#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn hybrid_search_scores_are_normalized(three_docs: Project) {
    let embedder = Arc::new(HashEmbedder::default());
    let provider: Arc<dyn EmbeddingProvider> = embedder.clone();
    let service = three_docs.service(
        vec![three_docs.directory_corpus("docs", "docs", BuildMode::Hybrid)],
        Some(provider),
    );
    service
        .run_indexing("docs", IndexOptions::default())
        .await
        .unwrap();

    let response = service
        .search("docs", "alpha", &SearchOptions::default())
        .await
        .unwrap();
    let_assert!(Some(top) = response.results.first());
    check!(top.id == "doc3.md");
    for hit in &response.results {
        check!(hit.score >= 0.0 && hit.score <= 1.0);
    }

    // Repeated queries reuse the cached query embedding.
    let calls = embedder.calls();
    service
        .search("docs", "alpha", &SearchOptions::default())
        .await
        .unwrap();
    check!(embedder.calls() == calls);
}
