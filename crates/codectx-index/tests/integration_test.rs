//! End-to-end behaviour of the engine over real temporary trees.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use codectx_config::{Config, PatternsConfig};
use codectx_index::chunker::content_hash;
use codectx_index::embeddings::{
    ContentType, EmbedIntent, EmbeddingGateway, EmbeddingProvider, HttpEmbeddingProvider,
    HttpProviderConfig, WireFormat,
};
use codectx_index::indexer::{Indexer, IndexerSettings, PassRequest};
use codectx_index::patterns::PatternLearner;
use codectx_index::storage::ChunkStore;
use codectx_index::Engine;
use tempfile::{tempdir, TempDir};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write(root: &Path, rel: &str, text: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

fn sample_tree(root: &Path) {
    write(
        root,
        "src/lib.rs",
        "pub mod parser;\n\npub fn run(input: &str) -> usize {\n    parser::parse(input).len()\n}\n",
    );
    write(
        root,
        "src/parser.rs",
        "pub fn parse(input: &str) -> Vec<&str> {\n    input.split(',').collect()\n}\n",
    );
    write(root, "app/main.py", "from app import util\n\n\ndef main():\n    return util.helper()\n");
    write(root, "app/util.py", "def helper():\n    return 42\n");
    write(root, "README.md", "# Sample\n\nA small tree used for indexing tests.\n");
}

fn config() -> Config {
    let mut config = Config::default();
    config.embedding.local_dimensions = 64;
    config
}

async fn local_engine(root: &Path) -> Engine {
    Engine::with_gateway(root, config(), Arc::new(EmbeddingGateway::local_only(64)))
        .await
        .unwrap()
}

fn indexer(dir: &TempDir) -> Indexer {
    let root = fs::canonicalize(dir.path()).unwrap();
    let settings = IndexerSettings::from_config(&root, &config());
    let store = Arc::new(ChunkStore::open(&settings.store_dir, false).unwrap());
    Indexer::new(
        settings,
        store,
        Arc::new(EmbeddingGateway::local_only(64)),
        PatternLearner::new(&PatternsConfig::default()),
    )
}

fn stored(indexer: &Indexer) -> BTreeSet<(String, usize, String)> {
    indexer
        .store()
        .load_chunks()
        .unwrap()
        .into_iter()
        .map(|c| (c.path, c.start_line, c.id))
        .collect()
}

fn http_provider(server: &MockServer, name: &str, types: Vec<ContentType>) -> Arc<dyn EmbeddingProvider> {
    Arc::new(HttpEmbeddingProvider::new(HttpProviderConfig {
        name: name.to_string(),
        base_url: server.uri(),
        api_key: Some("sk-test".to_string()),
        model: format!("{name}-model"),
        dimensions: 2,
        content_types: types,
        wire: WireFormat::OpenAi,
        send_input_type: false,
        timeout: Duration::from_secs(5),
        max_retries: 0,
        batch_size: 16,
    }))
}

#[tokio::test]
async fn test_indexing_is_deterministic_and_content_addressed() {
    let a = tempdir().unwrap();
    let b = tempdir().unwrap();
    sample_tree(a.path());
    sample_tree(b.path());

    let ia = indexer(&a);
    let ib = indexer(&b);
    ia.run_pass(PassRequest::full(true)).await.unwrap();
    ib.run_pass(PassRequest::full(true)).await.unwrap();

    assert_eq!(stored(&ia), stored(&ib));
    for chunk in ia.store().load_chunks().unwrap() {
        assert_eq!(chunk.id, content_hash(&chunk.text));
    }
}

#[tokio::test]
async fn test_incremental_pass_matches_fresh_index() {
    let live = tempdir().unwrap();
    sample_tree(live.path());
    let incremental = indexer(&live);
    incremental.run_pass(PassRequest::full(true)).await.unwrap();

    write(live.path(), "src/parser.rs", "pub fn parse(input: &str) -> Vec<String> {\n    input.split(';').map(str::to_string).collect()\n}\n");
    write(live.path(), "src/extra.rs", "pub fn extra() -> bool {\n    true\n}\n");
    fs::remove_file(live.path().join("app/util.py")).unwrap();
    let report = incremental.run_pass(PassRequest::full(true)).await.unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.removed, 1);

    let fresh_dir = tempdir().unwrap();
    sample_tree(fresh_dir.path());
    write(fresh_dir.path(), "src/parser.rs", "pub fn parse(input: &str) -> Vec<String> {\n    input.split(';').map(str::to_string).collect()\n}\n");
    write(fresh_dir.path(), "src/extra.rs", "pub fn extra() -> bool {\n    true\n}\n");
    fs::remove_file(fresh_dir.path().join("app/util.py")).unwrap();
    let fresh = indexer(&fresh_dir);
    fresh.run_pass(PassRequest::full(true)).await.unwrap();

    assert_eq!(stored(&incremental), stored(&fresh));
    assert_eq!(
        incremental.store().load_stats().unwrap().total_chunks,
        fresh.store().load_stats().unwrap().total_chunks
    );
}

#[tokio::test]
async fn test_deleted_file_disappears_everywhere() {
    let dir = tempdir().unwrap();
    sample_tree(dir.path());
    let engine = local_engine(dir.path()).await;
    assert_eq!(engine.find_symbol("helper").await.unwrap().len(), 1);

    fs::remove_file(dir.path().join("app/util.py")).unwrap();
    engine.remove_path("app/util.py").await.unwrap();

    assert!(engine.find_symbol("helper").await.unwrap().is_empty());
    let hits = engine.search("helper function", 10).await.unwrap();
    assert!(hits.iter().all(|h| h.path != "app/util.py"));
    assert_eq!(engine.stats().await.unwrap().files_indexed, 4);
}

#[tokio::test]
async fn test_reset_invalidates_cached_results() {
    let dir = tempdir().unwrap();
    write(dir.path(), "src/a.rs", "fn compute_total() -> u32 {\n    1\n}\n");
    let engine = local_engine(dir.path()).await;

    let before = engine.search("compute_total", 5).await.unwrap();
    assert_eq!(before[0].path, "src/a.rs");

    fs::remove_file(dir.path().join("src/a.rs")).unwrap();
    write(dir.path(), "src/b.rs", "fn compute_total() -> u64 {\n    2\n}\n");
    engine.reset().await.unwrap();

    let after = engine.search("compute_total", 5).await.unwrap();
    assert_eq!(after[0].path, "src/b.rs");
    assert!(after.iter().all(|h| h.path != "src/a.rs"));
}

#[tokio::test]
async fn test_failing_providers_fall_back_to_local() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    for server in [&first, &second] {
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1..)
            .mount(server)
            .await;
    }

    let dir = tempdir().unwrap();
    write(dir.path(), "main.go", "package main\n\nfunc main() {}\n");
    let gateway = EmbeddingGateway::new(
        vec![
            http_provider(&first, "primary", vec![ContentType::Code]),
            http_provider(&second, "secondary", vec![ContentType::General]),
        ],
        64,
        1,
        16,
    );
    let engine = Engine::with_gateway(dir.path(), config(), Arc::new(gateway))
        .await
        .unwrap();

    engine.ensure_indexed().await.unwrap();
    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.embedding_provider.as_deref(), Some("local"));
    assert_eq!(stats.dimensions, Some(64));
    assert_eq!(stats.total_embeddings, stats.total_chunks);
}

#[tokio::test]
async fn test_callers_of_go_function() {
    let dir = tempdir().unwrap();
    write(dir.path(), "a.go", "package main\n\nfunc Foo() {\n}\n");
    write(dir.path(), "b.go", "package main\n\nfunc Bar() {\n\tFoo()\n}\n");
    let engine = local_engine(dir.path()).await;

    let callers = engine.find_callers("Foo").await.unwrap();
    assert_eq!(callers.len(), 1);
    assert_eq!(callers[0].path, "b.go");
    assert_eq!(callers[0].line, 4);
}

#[tokio::test]
async fn test_finance_query_routes_to_finance_provider() {
    let finance = MockServer::start().await;
    let code = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"embedding": [0.6, 0.8], "index": 0}]
        })))
        .expect(1)
        .mount(&finance)
        .await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"embedding": [1.0, 0.0], "index": 0}]
        })))
        .expect(0)
        .mount(&code)
        .await;

    let gateway = EmbeddingGateway::new(
        vec![
            http_provider(&code, "code", vec![ContentType::Code]),
            http_provider(&finance, "finance", vec![ContentType::Finance]),
        ],
        64,
        1,
        16,
    );
    let query = "revenue forecast";
    let content_type = codectx_index::embeddings::detect_content_type(query);
    assert_eq!(content_type, ContentType::Finance);

    let batch = gateway
        .embed(&[query.to_string()], content_type, EmbedIntent::Query)
        .await
        .unwrap();
    assert_eq!(batch.provider, "finance");
    assert_eq!(batch.vectors, vec![vec![0.6, 0.8]]);
}

#[tokio::test]
async fn test_unknown_extension_is_searchable_as_plain_text() {
    let dir = tempdir().unwrap();
    write(dir.path(), "scripts/build.xyz", "setup_env(1)\nrun_build(2)\n");
    write(dir.path(), "src/lib.rs", "pub fn lib_entry() {}\n");
    write(dir.path(), "assets/logo.png", "\u{0}PNG");
    let engine = local_engine(dir.path()).await;

    let symbols = engine.find_symbol("run_build").await.unwrap();
    assert!(!symbols.is_empty());
    assert!(symbols.iter().all(|s| s.path == "scripts/build.xyz"));
    assert_eq!(engine.stats().await.unwrap().files_indexed, 2);

    let hits = engine.quick_scan("run_build", 5).await.unwrap();
    assert_eq!(hits[0].path, "scripts/build.xyz");
}
