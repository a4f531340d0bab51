//! Embedding generation for stored segments or transient chunks.
//!
//! Each unit runs through one eligibility predicate (first failing rule wins), then
//! [`EmbeddingPipeline::generate_embedding_with_retry`]. Batches are sequential and
//! paced; a batch is persisted as soon as it finishes so an aborted run keeps its
//! progress. Failures never abort the batch, they end up in [`EmbeddingReport`].

use crate::config::EmbeddingConfig;
use crate::embeddings::EmbeddingProvider;
use crate::error::{EmbeddingError, IngestError};
use crate::models::{Chunk, Document, IndexRecord, SegmentType, TextSegment};
use crate::rate_limit::RateLimiter;
use crate::retry::{with_retry, RetryPolicy};
use crate::store::DocumentStore;
use crate::traits::{KeywordIndex, VectorIndex};
use crate::SearchError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const REASON_ALREADY_EMBEDDED: &str = "already embedded";
pub const REASON_TOO_SHORT: &str = "too short";
pub const REASON_SKIPPED_TYPE: &str = "skipped type";
pub const REASON_RATE_LIMIT: &str = "rate limit reached";
pub const REASON_DOCUMENT_CEILING: &str = "document exceeds segment limit";

/// Something the pipeline can embed and index.
#[async_trait]
pub trait Embeddable: Clone + Send + Sync {
    fn unit_id(&self) -> String;
    fn text(&self) -> &str;
    fn segment_type(&self) -> Option<SegmentType>;
    fn embedding(&self) -> Option<&[f32]>;
    fn attach_embedding(&mut self, vector: Vec<f32>, model: &str);
    fn to_record(&self, document: &Document) -> IndexRecord;

    /// Writes freshly embedded units back to the document store.
    async fn persist(store: &dyn DocumentStore, units: &[Self]) -> Result<(), SearchError>;
}

#[async_trait]
impl Embeddable for TextSegment {
    fn unit_id(&self) -> String {
        self.record_id()
    }

    fn text(&self) -> &str {
        &self.content
    }

    fn segment_type(&self) -> Option<SegmentType> {
        Some(self.segment_type)
    }

    fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }

    fn attach_embedding(&mut self, vector: Vec<f32>, model: &str) {
        self.embedding = Some(vector);
        self.embedding_model = Some(model.to_string());
    }

    fn to_record(&self, document: &Document) -> IndexRecord {
        IndexRecord {
            id: self.record_id(),
            document_id: self.document_id.clone(),
            filename: document.filename.clone(),
            document_type: document.document_type.clone(),
            sequence_number: Some(self.sequence_number),
            section: self.section_title.clone(),
            text: self.content.clone(),
        }
    }

    async fn persist(store: &dyn DocumentStore, units: &[Self]) -> Result<(), SearchError> {
        store.save_segments(units).await
    }
}

#[async_trait]
impl Embeddable for Chunk {
    fn unit_id(&self) -> String {
        self.chunk_id.clone()
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn segment_type(&self) -> Option<SegmentType> {
        None
    }

    fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }

    fn attach_embedding(&mut self, vector: Vec<f32>, _model: &str) {
        self.embedding = Some(vector);
    }

    fn to_record(&self, document: &Document) -> IndexRecord {
        IndexRecord {
            id: self.chunk_id.clone(),
            document_id: document.id.clone(),
            filename: document.filename.clone(),
            document_type: document.document_type.clone(),
            sequence_number: u32::try_from(self.metadata.chunk_index).ok(),
            section: Some(self.metadata.section.clone()),
            text: self.text.clone(),
        }
    }

    // Chunks are transient; only the indexes keep them.
    async fn persist(_store: &dyn DocumentStore, _units: &[Self]) -> Result<(), SearchError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailStatus {
    Embedded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingDetail {
    pub unit_id: String,
    pub status: DetailStatus,
    pub reason: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbeddingReport {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub details: Vec<EmbeddingDetail>,
}

impl EmbeddingReport {
    fn record_skip(&mut self, unit_id: String, reason: &str) {
        self.skipped += 1;
        self.details.push(EmbeddingDetail {
            unit_id,
            status: DetailStatus::Skipped,
            reason: Some(reason.to_string()),
            elapsed_ms: 0,
        });
    }

    fn record_embedded(&mut self, unit_id: String, elapsed: Duration) {
        self.processed += 1;
        self.details.push(EmbeddingDetail {
            unit_id,
            status: DetailStatus::Embedded,
            reason: None,
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }

    fn record_failure(&mut self, unit_id: String, reason: String, elapsed: Duration) {
        self.failed += 1;
        self.errors.push(format!("{unit_id}: {reason}"));
        self.details.push(EmbeddingDetail {
            unit_id,
            status: DetailStatus::Failed,
            reason: Some(reason),
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }

    pub fn skip_reasons(&self) -> Vec<&str> {
        self.details
            .iter()
            .filter(|detail| detail.status == DetailStatus::Skipped)
            .filter_map(|detail| detail.reason.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageStatus {
    Completed,
    Partial,
    Failed,
}

impl CoverageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CoverageStatus::Completed => "completed",
            CoverageStatus::Partial => "partial",
            CoverageStatus::Failed => "failed",
        }
    }
}

/// Stored under the document's `embedding_status` metadata key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingCoverage {
    pub total: usize,
    pub embedded: usize,
    pub coverage: f64,
    pub status: CoverageStatus,
}

impl EmbeddingCoverage {
    pub fn new(embedded: usize, total: usize) -> Self {
        let coverage = if total == 0 {
            0.0
        } else {
            embedded as f64 / total as f64
        };
        let status = if total > 0 && embedded >= total {
            CoverageStatus::Completed
        } else if embedded > 0 {
            CoverageStatus::Partial
        } else {
            CoverageStatus::Failed
        };
        Self {
            total,
            embedded,
            coverage,
            status,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "total": self.total,
            "embedded": self.embedded,
            "coverage": self.coverage,
            "status": self.status.as_str(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmbedOptions {
    /// Embed even when the document has more eligible units than `max_segments_per_document`.
    pub ignore_document_ceiling: bool,
}

pub struct EmbeddingPipeline {
    config: EmbeddingConfig,
    provider: Arc<dyn EmbeddingProvider>,
    limiter: Arc<RateLimiter>,
    store: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorIndex>,
    keywords: Arc<dyn KeywordIndex>,
}

impl EmbeddingPipeline {
    pub fn new(
        config: EmbeddingConfig,
        provider: Arc<dyn EmbeddingProvider>,
        limiter: Arc<RateLimiter>,
        store: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorIndex>,
        keywords: Arc<dyn KeywordIndex>,
    ) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self {
            config,
            provider,
            limiter,
            store,
            vectors,
            keywords,
        })
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_retries, self.config.retry_delay())
    }

    /// `None` when the unit should be embedded now.
    pub fn skip_reason<U: Embeddable>(&self, unit: &U) -> Option<&'static str> {
        self.static_skip_reason(unit).or_else(|| {
            self.limiter
                .is_exhausted()
                .then_some(REASON_RATE_LIMIT)
        })
    }

    fn static_skip_reason<U: Embeddable>(&self, unit: &U) -> Option<&'static str> {
        if unit.embedding().is_some() {
            return Some(REASON_ALREADY_EMBEDDED);
        }
        if unit.text().trim().chars().count() < self.config.min_text_length {
            return Some(REASON_TOO_SHORT);
        }
        if unit
            .segment_type()
            .is_some_and(|kind| self.config.skip_segment_types.contains(&kind))
        {
            return Some(REASON_SKIPPED_TYPE);
        }
        None
    }

    /// Collapses whitespace and cuts the text at `max_text_length` characters.
    pub fn clean_text(&self, text: &str) -> String {
        text.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(self.config.max_text_length)
            .collect()
    }

    pub async fn generate_embedding_with_retry(
        &self,
        text: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let cleaned = self.clean_text(text);
        if cleaned.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let policy = self.retry_policy();
        let provider = self.provider.as_ref();
        let timeout = self.config.request_timeout();
        let expected = self.config.dimensions;
        let input = cleaned.as_str();

        let calls = self.limiter.try_acquire()?;
        let vector = match with_retry(&policy, move |_attempt| {
            request_embedding(provider, input, timeout, expected)
        })
        .await
        {
            Ok(vector) => vector,
            Err(failure) => {
                self.limiter.release();
                return Err(failure);
            }
        };

        if calls > self.config.cost_alert_threshold {
            warn!(
                calls,
                threshold = self.config.cost_alert_threshold,
                limit = self.limiter.limit(),
                "daily embedding calls past cost alert threshold"
            );
        }
        Ok(vector)
    }

    /// Embeds the document's stored segments and records coverage in its metadata.
    pub async fn embed_document(
        &self,
        document: &mut Document,
        options: EmbedOptions,
    ) -> Result<EmbeddingReport, IngestError> {
        let mut segments = self.store.segments(&document.id).await?;
        let report = self.embed_units(document, &mut segments, options).await;

        let embedded = segments
            .iter()
            .filter(|segment| segment.embedding.is_some())
            .count();
        self.record_coverage(document, EmbeddingCoverage::new(embedded, segments.len()))
            .await?;
        Ok(report)
    }

    /// Embeds transient chunks; only the vector and keyword indexes keep them.
    pub async fn embed_chunks(
        &self,
        document: &mut Document,
        chunks: &mut [Chunk],
        options: EmbedOptions,
    ) -> Result<EmbeddingReport, IngestError> {
        let report = self.embed_units(document, chunks, options).await;

        let embedded = chunks.iter().filter(|chunk| chunk.embedding.is_some()).count();
        self.record_coverage(document, EmbeddingCoverage::new(embedded, chunks.len()))
            .await?;
        Ok(report)
    }

    async fn record_coverage(
        &self,
        document: &mut Document,
        coverage: EmbeddingCoverage,
    ) -> Result<(), IngestError> {
        info!(
            document_id = %document.id,
            embedded = coverage.embedded,
            total = coverage.total,
            status = coverage.status.as_str(),
            "embedding coverage updated"
        );
        document
            .metadata
            .insert("embedding_status".to_string(), coverage.to_value());
        self.store.save_document(document).await?;
        Ok(())
    }

    async fn embed_units<U: Embeddable>(
        &self,
        document: &Document,
        units: &mut [U],
        options: EmbedOptions,
    ) -> EmbeddingReport {
        let mut report = EmbeddingReport::default();
        let mut eligible = Vec::new();

        for (index, unit) in units.iter().enumerate() {
            match self.static_skip_reason(unit) {
                Some(reason) => report.record_skip(unit.unit_id(), reason),
                None => eligible.push(index),
            }
        }

        if !options.ignore_document_ceiling && eligible.len() > self.config.max_segments_per_document
        {
            warn!(
                document_id = %document.id,
                eligible = eligible.len(),
                ceiling = self.config.max_segments_per_document,
                "document skipped for embedding cost control"
            );
            for index in eligible {
                report.record_skip(units[index].unit_id(), REASON_DOCUMENT_CEILING);
            }
            return report;
        }

        if eligible.len() > self.config.max_segments_sync {
            info!(
                document_id = %document.id,
                eligible = eligible.len(),
                threshold = self.config.max_segments_sync,
                "large document embedded inline"
            );
        }

        let batch_count = eligible.len().div_ceil(self.config.batch_size);
        for (batch_number, batch) in eligible.chunks(self.config.batch_size).enumerate() {
            if batch_number > 0 && !self.config.batch_pause().is_zero() {
                tokio::time::sleep(self.config.batch_pause()).await;
            }

            let mut embedded = Vec::new();
            for &index in batch {
                let unit = &mut units[index];
                if let Some(reason) = self.skip_reason(&*unit) {
                    report.record_skip(unit.unit_id(), reason);
                    continue;
                }

                // The reservation inside generation is authoritative; this check only saves work.
                let started = Instant::now();
                match self.generate_embedding_with_retry(unit.text()).await {
                    Ok(vector) => {
                        unit.attach_embedding(vector, self.provider.model());
                        report.record_embedded(unit.unit_id(), started.elapsed());
                        embedded.push(unit.clone());
                    }
                    Err(EmbeddingError::BudgetExhausted(_)) => {
                        report.record_skip(unit.unit_id(), REASON_RATE_LIMIT);
                    }
                    Err(failure) => {
                        warn!(unit = %unit.unit_id(), error = %failure, "embedding failed permanently");
                        report.record_failure(unit.unit_id(), failure.to_string(), started.elapsed());
                    }
                }
            }

            if let Err(failure) = self.persist_batch(document, &embedded).await {
                error!(document_id = %document.id, error = %failure, "failed to persist embedding batch");
                report
                    .errors
                    .push(format!("batch {}: {failure}", batch_number + 1));
            }
            debug!(
                document_id = %document.id,
                batch = batch_number + 1,
                batches = batch_count,
                embedded = embedded.len(),
                "embedding batch finished"
            );
        }

        report
    }

    async fn persist_batch<U: Embeddable>(
        &self,
        document: &Document,
        units: &[U],
    ) -> Result<(), SearchError> {
        if units.is_empty() {
            return Ok(());
        }

        U::persist(self.store.as_ref(), units).await?;

        let mut records = Vec::with_capacity(units.len());
        let mut vectors = Vec::with_capacity(units.len());
        for unit in units {
            if let Some(vector) = unit.embedding() {
                records.push(unit.to_record(document));
                vectors.push(vector.to_vec());
            }
        }
        self.vectors.upsert_vectors(&records, &vectors).await?;
        self.keywords.index_records(&records).await
    }
}

async fn request_embedding(
    provider: &dyn EmbeddingProvider,
    text: &str,
    timeout: Duration,
    expected: usize,
) -> Result<Vec<f32>, EmbeddingError> {
    let vector = tokio::time::timeout(timeout, provider.embed(text))
        .await
        .map_err(|_| EmbeddingError::Timeout(timeout.as_secs()))??;

    if vector.len() != expected {
        return Err(EmbeddingError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(vector)
}
