use async_trait::async_trait;
use docsift_core::pipeline::{REASON_ALREADY_EMBEDDED, REASON_TOO_SHORT};
use docsift_core::{
    whitespace_counter, CharacterNgramEmbedder, DocumentPipeline, DocumentStatus, DocumentStore,
    EmbedOptions, EmbeddingError, EmbeddingProvider, MemoryStore, PipelineConfig, RateLimiter,
    RetrievalEngine, SearchMode, SearchQuery, SearchType, SegmentType,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

const DIMS: usize = 64;

struct CountingEmbedder {
    inner: CharacterNgramEmbedder,
    calls: AtomicUsize,
}

impl CountingEmbedder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: CharacterNgramEmbedder { dimensions: DIMS },
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    fn model(&self) -> &str {
        self.inner.model()
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(text).await
    }
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.embedding.dimensions = DIMS;
    config.embedding.batch_pause_ms = 0;
    config.embedding.retry_delay_ms = 0;
    config
}

fn build(provider: Arc<CountingEmbedder>) -> (DocumentPipeline, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let pipeline = DocumentPipeline::new(
        config(),
        provider,
        Arc::new(RateLimiter::new(1_000)),
        store.clone(),
        store.clone(),
        store.clone(),
    )
    .and_then(|pipeline| pipeline.with_token_counter(whitespace_counter()))
    .expect("pipeline should build");
    (pipeline, store)
}

#[tokio::test]
async fn short_paragraph_leaves_document_partially_embedded() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("handbook.txt");
    std::fs::write(
        &path,
        "In spring, the cooling loop must be flushed before the plant restarts.\n\n\
         Too short to embed.\n\n\
         At every shift, operators record inlet and outlet temperatures.",
    )
    .unwrap();

    let provider = CountingEmbedder::new();
    let (pipeline, store) = build(provider.clone());
    let report = pipeline.ingest_file(&path).await.unwrap();

    assert_eq!(report.status, DocumentStatus::Completed);
    assert_eq!(report.segments, 3);
    assert_eq!(report.tables, 0);
    let embedding = report.embedding.expect("auto embedding runs");
    assert_eq!(embedding.processed, 2);
    assert_eq!(embedding.skipped, 1);
    assert_eq!(embedding.skip_reasons(), vec![REASON_TOO_SHORT]);
    assert_eq!(provider.calls(), 2);

    let document = store
        .get_document(&report.document_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(document.metadata["embedding_status"]["status"], "partial");
    assert_eq!(document.metadata["embedding_status"]["embedded"], 2);

    let sequence: Vec<u32> = store
        .segments(&report.document_id)
        .await
        .unwrap()
        .iter()
        .map(|segment| segment.sequence_number)
        .collect();
    assert_eq!(sequence, vec![0, 1, 2]);
    let segments = store.segments(&report.document_id).await.unwrap();
    assert_eq!(segments[0].segment_type, SegmentType::Paragraph);
    assert!(segments[0].content.starts_with("In spring,"));
}

#[tokio::test]
async fn fully_embedded_document_makes_no_further_calls() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("handbook.txt");
    std::fs::write(
        &path,
        "The cooling loop must be flushed every spring before the plant restarts.\n\n\
         Operators record inlet and outlet temperatures at the start of every shift.",
    )
    .unwrap();

    let provider = CountingEmbedder::new();
    let (pipeline, store) = build(provider.clone());
    let report = pipeline.ingest_file(&path).await.unwrap();
    assert_eq!(provider.calls(), 2);

    let mut document = store
        .get_document(&report.document_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(document.metadata["embedding_status"]["status"], "completed");

    let rerun = pipeline
        .embeddings()
        .embed_document(&mut document, EmbedOptions::default())
        .await
        .unwrap();

    assert_eq!(provider.calls(), 2);
    assert_eq!(rerun.processed, 0);
    assert_eq!(
        rerun.skip_reasons(),
        vec![REASON_ALREADY_EMBEDDED, REASON_ALREADY_EMBEDDED]
    );
}

#[tokio::test]
async fn ingested_text_is_searchable_in_every_mode() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("handbook.txt");
    std::fs::write(
        &path,
        "The cooling loop must be flushed every spring before the plant restarts.\n\n\
         Operators record inlet and outlet temperatures at the start of every shift.",
    )
    .unwrap();

    let provider = CountingEmbedder::new();
    let (pipeline, store) = build(provider.clone());
    pipeline.ingest_file(&path).await.unwrap();

    let engine = RetrievalEngine::new(
        pipeline.config().retrieval.clone(),
        provider,
        store.clone(),
        store,
    );
    let query = SearchQuery::new("outlet temperatures", 5);

    let keyword = engine.search(&query, SearchMode::Keyword).await;
    assert_eq!(keyword.hits.len(), 1);
    assert!(keyword.hits[0].record.text.starts_with("Operators"));

    let hybrid = engine.search(&query, SearchMode::Hybrid).await;
    assert!(hybrid.errors.is_empty());
    assert!(!hybrid.is_degraded());
    assert!(hybrid.hits[0].record.text.starts_with("Operators"));
    assert_eq!(hybrid.hits[0].search_type, SearchType::Hybrid);
    assert!(hybrid.hits[0].keyword_rank.is_some());
    assert!(hybrid.hits[0].distance.is_some());

    let vector = engine.search(&query, SearchMode::Vector).await;
    assert!(!vector.hits.is_empty());
    assert!(vector
        .hits
        .windows(2)
        .all(|pair| pair[0].distance <= pair[1].distance));
}
