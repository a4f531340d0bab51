use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use docsift_core::{
    parse_segment_types, CharacterNgramEmbedder, DocumentPipeline, DocumentStore, EmbedOptions,
    EmbeddingProvider, IndexUnit, KeywordIndex, MemoryStore, OpenAiEmbedder, OpenSearchStore,
    PipelineConfig, QdrantStore, RateLimiter, RetrievalEngine, SearchMode, SearchQuery,
    VectorIndex,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "docsift", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON snapshot holding documents, segments, tables, key-values and today's embedding calls.
    #[arg(long, env = "DOCSIFT_STATE", default_value = "docsift-state.json")]
    state: PathBuf,

    /// Optional JSON file with pipeline settings; flags below override it.
    #[arg(long, env = "DOCSIFT_CONFIG")]
    config: Option<PathBuf>,

    /// Where vectors and lexical records live.
    #[arg(long, value_enum, env = "DOCSIFT_INDEX", default_value_t = IndexBackend::Memory)]
    index: IndexBackend,

    /// Embedding provider.
    #[arg(long, value_enum, env = "DOCSIFT_EMBEDDER", default_value_t = EmbedderKind::Ngram)]
    embedder: EmbedderKind,

    /// OpenSearch base URL
    #[arg(long, default_value = "http://localhost:9200")]
    opensearch_url: String,

    /// OpenSearch index name
    #[arg(long, default_value = "docsift_segments")]
    opensearch_index: String,

    /// Qdrant base URL
    #[arg(long, default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Qdrant collection
    #[arg(long, default_value = "docsift_segments")]
    qdrant_collection: String,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Clone, Copy, ValueEnum)]
enum IndexBackend {
    /// Keep vectors and lexical records in the state snapshot.
    Memory,
    /// Qdrant for vectors, OpenSearch for lexical ranking.
    Remote,
}

#[derive(Clone, Copy, ValueEnum)]
enum EmbedderKind {
    /// Offline hashed character trigrams.
    Ngram,
    /// OpenAI-compatible endpoint (`OPENAI_API_KEY`, `OPENAI_BASE_URL`).
    Openai,
}

/// Overrides for the pipeline settings. Unset flags keep the configured value.
#[derive(Args)]
struct Settings {
    #[arg(long, env = "ENABLE_AUTO_EMBEDDINGS")]
    enable_auto_embeddings: Option<bool>,
    #[arg(long, env = "MAX_SEGMENTS_SYNC")]
    max_segments_sync: Option<usize>,
    #[arg(long, env = "MIN_TEXT_LENGTH")]
    min_text_length: Option<usize>,
    #[arg(long, env = "MAX_TEXT_LENGTH")]
    max_text_length: Option<usize>,
    #[arg(long, env = "BATCH_SIZE")]
    batch_size: Option<usize>,
    /// Seconds.
    #[arg(long, env = "REQUEST_TIMEOUT")]
    request_timeout: Option<u64>,
    #[arg(long, env = "MAX_RETRIES")]
    max_retries: Option<u32>,
    /// Seconds; fractions allowed.
    #[arg(long, env = "RETRY_DELAY")]
    retry_delay: Option<f64>,
    #[arg(long, env = "MAX_DAILY_API_CALLS")]
    max_daily_api_calls: Option<u64>,
    #[arg(long, env = "COST_ALERT_THRESHOLD")]
    cost_alert_threshold: Option<u64>,
    /// Comma separated, e.g. `header,footer,list_item`.
    #[arg(long, env = "SKIP_SEGMENT_TYPES")]
    skip_segment_types: Option<String>,
    #[arg(long, env = "MAX_SEGMENTS_PER_DOCUMENT")]
    max_segments_per_document: Option<usize>,
    #[arg(long, env = "EMBEDDING_MODEL")]
    embedding_model: Option<String>,
    #[arg(long, env = "EMBEDDING_DIMENSIONS")]
    embedding_dimensions: Option<usize>,
    /// `segments` or `chunks`.
    #[arg(long, env = "INDEX_UNIT")]
    index_unit: Option<IndexUnit>,
    #[arg(long, env = "CHUNK_TARGET_TOKENS")]
    chunk_target_tokens: Option<usize>,
    #[arg(long, env = "CHUNK_OVERLAP_TOKENS")]
    chunk_overlap_tokens: Option<usize>,
    #[arg(long, env = "TABLE_ROW_BATCH")]
    table_row_batch: Option<usize>,
    #[arg(long, env = "KEYWORD_WEIGHT")]
    keyword_weight: Option<f64>,
    #[arg(long, env = "SEMANTIC_WEIGHT")]
    semantic_weight: Option<f64>,
}

impl Settings {
    fn apply(&self, config: &mut PipelineConfig) -> anyhow::Result<()> {
        let embedding = &mut config.embedding;
        if let Some(value) = self.enable_auto_embeddings {
            embedding.enable_auto_embeddings = value;
        }
        if let Some(value) = self.max_segments_sync {
            embedding.max_segments_sync = value;
        }
        if let Some(value) = self.min_text_length {
            embedding.min_text_length = value;
        }
        if let Some(value) = self.max_text_length {
            embedding.max_text_length = value;
        }
        if let Some(value) = self.batch_size {
            embedding.batch_size = value;
        }
        if let Some(value) = self.request_timeout {
            embedding.request_timeout_secs = value;
        }
        if let Some(value) = self.max_retries {
            embedding.max_retries = value;
        }
        if let Some(value) = self.retry_delay {
            embedding.retry_delay_ms = (value.max(0.0) * 1_000.0) as u64;
        }
        if let Some(value) = self.max_daily_api_calls {
            embedding.max_daily_api_calls = value;
        }
        if let Some(value) = self.cost_alert_threshold {
            embedding.cost_alert_threshold = value;
        }
        if let Some(raw) = &self.skip_segment_types {
            embedding.skip_segment_types = parse_segment_types(raw)?;
        }
        if let Some(value) = self.max_segments_per_document {
            embedding.max_segments_per_document = value;
        }
        if let Some(value) = &self.embedding_model {
            embedding.model = value.clone();
        }
        if let Some(value) = self.embedding_dimensions {
            embedding.dimensions = value;
        }
        if let Some(value) = self.index_unit {
            embedding.index_unit = value;
        }

        if let Some(value) = self.chunk_target_tokens {
            config.chunking.target_tokens = value;
        }
        if let Some(value) = self.chunk_overlap_tokens {
            config.chunking.overlap_tokens = value;
        }
        if let Some(value) = self.table_row_batch {
            config.chunking.table_row_batch = value;
        }
        if let Some(value) = self.keyword_weight {
            config.retrieval.keyword_weight = value;
        }
        if let Some(value) = self.semantic_weight {
            config.retrieval.semantic_weight = value;
        }

        config.chunking.validate()?;
        config.embedding.validate()?;
        Ok(())
    }
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a file, or every supported file under a folder.
    Ingest {
        path: PathBuf,
    },
    /// Search stored segments.
    Search {
        query: String,
        /// keyword, vector or hybrid.
        #[arg(long, default_value = "hybrid")]
        mode: String,
        #[arg(long)]
        top_k: Option<usize>,
        /// Restrict to one document type, e.g. `financial_report`.
        #[arg(long)]
        document_type: Option<String>,
    },
    /// Embed a stored document again; already embedded segments are skipped.
    Embed {
        document_id: String,
        /// Ignore MAX_SEGMENTS_PER_DOCUMENT.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Clear a document's derived rows and run the pipeline again.
    Reprocess {
        document_id: String,
    },
    /// Counts, samples and embedding coverage for one document.
    Summary {
        document_id: String,
    },
    /// Documents by status and file type, plus today's embedding calls.
    Stats,
}

struct Indexes {
    vectors: Arc<dyn VectorIndex>,
    keywords: Arc<dyn KeywordIndex>,
}

async fn indexes(cli: &Cli, store: &Arc<MemoryStore>, dimensions: usize) -> anyhow::Result<Indexes> {
    match cli.index {
        IndexBackend::Memory => Ok(Indexes {
            vectors: store.clone(),
            keywords: store.clone(),
        }),
        IndexBackend::Remote => {
            let vectors = QdrantStore::new(&cli.qdrant_url, &cli.qdrant_collection, dimensions);
            vectors
                .ensure_collection()
                .await
                .context("qdrant collection setup failed")?;
            let keywords = OpenSearchStore::new(&cli.opensearch_url, &cli.opensearch_index);
            keywords
                .ensure_index()
                .await
                .context("opensearch index setup failed")?;
            Ok(Indexes {
                vectors: Arc::new(vectors),
                keywords: Arc::new(keywords),
            })
        }
    }
}

fn embedder(kind: EmbedderKind, config: &PipelineConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    match kind {
        EmbedderKind::Ngram => Ok(Arc::new(CharacterNgramEmbedder {
            dimensions: config.embedding.dimensions,
        })),
        EmbedderKind::Openai => Ok(Arc::new(OpenAiEmbedder::from_env(&config.embedding)?)),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config {}", path.display()))?;
            PipelineConfig::from_json(&raw)?
        }
        None => PipelineConfig::default(),
    };
    cli.settings.apply(&mut config)?;
    Ok(config)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        state = %cli.state.display(),
        "docsift boot"
    );

    let store = Arc::new(MemoryStore::load(&cli.state).await?);
    let provider = embedder(cli.embedder, &config)?;
    let Indexes { vectors, keywords } = indexes(&cli, &store, config.embedding.dimensions).await?;
    let limiter = Arc::new(RateLimiter::restore(
        config.embedding.max_daily_api_calls,
        store.budget_state().await,
    ));

    let pipeline = DocumentPipeline::new(
        config.clone(),
        provider.clone(),
        limiter.clone(),
        store.clone(),
        vectors.clone(),
        keywords.clone(),
    )?;

    match &cli.command {
        Command::Ingest { path } => {
            let reports = if path.is_dir() {
                let folder = pipeline.ingest_folder(path).await?;
                for skipped in &folder.skipped_files {
                    warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
                }
                folder.reports
            } else {
                vec![pipeline.ingest_file(path).await?]
            };
            persist(&store, &limiter, &cli.state).await?;

            for report in &reports {
                info!(
                    document_id = %report.document_id,
                    filename = %report.filename,
                    status = %report.status,
                    segments = report.segments,
                    errors = report.errors.len(),
                    "ingested"
                );
            }
            print_json(&reports)?;
        }
        Command::Search {
            query,
            mode,
            top_k,
            document_type,
        } => {
            let mode: SearchMode = mode.parse()?;
            let mut search = SearchQuery::new(query.clone(), top_k.unwrap_or(config.retrieval.top_k));
            search.document_type = document_type.clone();

            let engine = RetrievalEngine::new(config.retrieval.clone(), provider, vectors, keywords);
            let result = engine.search(&search, mode).await;
            if result.is_degraded() {
                warn!(query = %query, "results are keyword-only");
            }
            print_json(&result)?;
        }
        Command::Embed { document_id, force } => {
            let mut document = store
                .get_document(document_id)
                .await?
                .with_context(|| format!("unknown document {document_id}"))?;
            let report = pipeline
                .embeddings()
                .embed_document(
                    &mut document,
                    EmbedOptions {
                        ignore_document_ceiling: *force,
                    },
                )
                .await?;
            persist(&store, &limiter, &cli.state).await?;
            print_json(&json!({
                "document_id": document_id,
                "embedding_status": document.metadata.get("embedding_status"),
                "report": report,
            }))?;
        }
        Command::Reprocess { document_id } => {
            let report = pipeline.reprocess(document_id).await?;
            persist(&store, &limiter, &cli.state).await?;
            print_json(&report)?;
        }
        Command::Summary { document_id } => {
            print_json(&pipeline.document_summary(document_id).await?)?;
        }
        Command::Stats => {
            print_json(&pipeline.stats().await?)?;
        }
    }

    Ok(())
}

async fn persist(store: &MemoryStore, limiter: &RateLimiter, path: &Path) -> anyhow::Result<()> {
    store.set_budget_state(limiter.state()).await;
    store
        .save(path)
        .await
        .with_context(|| format!("cannot write state {}", path.display()))
}
