pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod key_values;
pub mod models;
pub mod pipeline;
pub mod rate_limit;
pub mod retrieval;
pub mod retry;
pub mod segmenter;
pub mod store;
pub mod stores;
pub mod tables;
pub mod traits;
pub mod typing;

pub use chunking::{cl100k_counter, normalize_whitespace, whitespace_counter, Chunker, TokenCounter};
pub use config::{
    parse_segment_types, ChunkingConfig, EmbeddingConfig, IndexUnit, PipelineConfig,
    RetrievalConfig, SegmenterConfig,
};
pub use embeddings::{
    cosine_distance, cosine_similarity, CharacterNgramEmbedder, EmbeddingProvider, OpenAiEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{EmbeddingError, IngestError, SearchError};
pub use extractor::{
    extract_document, extractor_for, is_error_marker, ExtractedDocument, ExtractedPage,
    ExtractedTable, Extractor,
};
pub use ingest::{
    digest_file, discover_documents, DocumentPipeline, DocumentSummary, FolderReport,
    PipelineStats, ProcessingReport, SkippedFile,
};
pub use key_values::extract_key_values;
pub use models::{
    Chunk, ChunkKind, ChunkMetadata, Document, DocumentStatus, FileType, IndexRecord, KeyValue,
    SearchHit, SearchMode, SearchQuery, SearchResult, SearchType, Segment, SegmentType,
    StructuredCell, Table, TextSegment,
};
pub use pipeline::{
    CoverageStatus, EmbedOptions, Embeddable, EmbeddingCoverage, EmbeddingPipeline,
    EmbeddingReport,
};
pub use rate_limit::{BudgetState, RateLimiter};
pub use retrieval::{combined_score, fuse, RetrievalEngine};
pub use retry::{with_retry, RetryPolicy};
pub use segmenter::{classify, segment, segment_dataset};
pub use store::DocumentStore;
pub use stores::{MemoryStore, OpenSearchStore, QdrantStore};
pub use tables::{build_table, extract_tables};
pub use traits::{KeywordIndex, KeywordMatch, VectorIndex, VectorMatch};
pub use typing::{coerce, DataType, TypedCell, TypedValue};
