//! Tunables for every pipeline stage.
//!
//! Each struct carries working defaults and deserializes from JSON so the CLI
//! (or a host service) can override individual fields.

use crate::error::IngestError;
use crate::models::SegmentType;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub enable_auto_embeddings: bool,
    /// Documents with more eligible segments than this are embedded in the background by hosts
    /// that support it; the synchronous pipeline only reports the count.
    pub max_segments_sync: usize,
    pub min_text_length: usize,
    pub max_text_length: usize,
    pub batch_size: usize,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_daily_api_calls: u64,
    pub cost_alert_threshold: u64,
    pub skip_segment_types: Vec<SegmentType>,
    pub max_segments_per_document: usize,
    pub batch_pause_ms: u64,
    pub model: String,
    pub dimensions: usize,
    pub index_unit: IndexUnit,
}

/// What the embedding pipeline sends to the provider: stored segments or token-bounded chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexUnit {
    #[default]
    Segments,
    Chunks,
}

impl std::str::FromStr for IndexUnit {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "segments" | "segment" => Ok(IndexUnit::Segments),
            "chunks" | "chunk" => Ok(IndexUnit::Chunks),
            other => Err(IngestError::InvalidArgument(format!(
                "unknown index unit: {other}. Use segments or chunks."
            ))),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enable_auto_embeddings: true,
            max_segments_sync: 10,
            min_text_length: 50,
            max_text_length: 8_000,
            batch_size: 5,
            request_timeout_secs: 30,
            max_retries: 3,
            retry_delay_ms: 1_000,
            max_daily_api_calls: 10_000,
            cost_alert_threshold: 100,
            skip_segment_types: vec![SegmentType::Header, SegmentType::Footer],
            max_segments_per_document: 500,
            batch_pause_ms: 500,
            model: "text-embedding-ada-002".to_string(),
            dimensions: 1_536,
            index_unit: IndexUnit::Segments,
        }
    }
}

impl EmbeddingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.batch_size == 0 {
            return Err(IngestError::InvalidArgument(
                "embedding batch size must be at least 1".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(IngestError::InvalidArgument(
                "embedding max retries must be at least 1".to_string(),
            ));
        }
        if self.dimensions == 0 {
            return Err(IngestError::InvalidArgument(
                "embedding dimensions must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
    pub safe_table_tokens: usize,
    pub table_row_batch: usize,
    pub table_sample_rows: usize,
    pub heading_stitch_window: usize,
    pub default_section: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: 512,
            overlap_tokens: 64,
            safe_table_tokens: 6_000,
            table_row_batch: 50,
            table_sample_rows: 3,
            heading_stitch_window: 50,
            default_section: "Document".to_string(),
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.target_tokens == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "target token count must be positive".to_string(),
            ));
        }
        if self.overlap_tokens >= self.target_tokens {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than target {}",
                self.overlap_tokens, self.target_tokens
            )));
        }
        if self.table_row_batch == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "table row batch must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    pub tabular_probe_lines: usize,
    pub max_data_rows: usize,
    pub max_unique_values: usize,
    pub summary_sample_rows: usize,
    pub min_paragraph_chars: usize,
    pub min_paragraph_words: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            tabular_probe_lines: 10,
            max_data_rows: 1_000,
            max_unique_values: 20,
            summary_sample_rows: 500,
            min_paragraph_chars: 3,
            min_paragraph_words: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub keyword_weight: f64,
    pub semantic_weight: f64,
    pub prefilter_distance: f64,
    pub top_k: usize,
    /// How many vector neighbours are pulled before fusion.
    pub candidate_pool: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            keyword_weight: 0.3,
            semantic_weight: 0.7,
            prefilter_distance: 0.5,
            top_k: 10,
            candidate_pool: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub segmenter: SegmenterConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
}

impl PipelineConfig {
    pub fn from_json(raw: &str) -> Result<Self, IngestError> {
        let config: PipelineConfig = serde_json::from_str(raw)
            .map_err(|error| IngestError::InvalidArgument(format!("invalid config: {error}")))?;
        config.chunking.validate()?;
        config.embedding.validate()?;
        Ok(config)
    }
}

/// Parses a comma separated list such as `header,footer,list_item`.
pub fn parse_segment_types(raw: &str) -> Result<Vec<SegmentType>, IngestError> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.chunking.validate().is_ok());
        assert!(config.embedding.validate().is_ok());
        assert_eq!(config.embedding.skip_segment_types.len(), 2);
    }

    #[test]
    fn json_overrides_single_fields() {
        let config = PipelineConfig::from_json(
            r#"{"embedding": {"batch_size": 3, "skip_segment_types": ["list_item"]}}"#,
        )
        .expect("config should parse");
        assert_eq!(config.embedding.batch_size, 3);
        assert_eq!(config.embedding.min_text_length, 50);
        assert_eq!(config.embedding.skip_segment_types, vec![SegmentType::ListItem]);
        assert_eq!(config.embedding.index_unit, IndexUnit::Segments);
    }

    #[test]
    fn index_unit_parses_from_json_and_flags() {
        let config = PipelineConfig::from_json(r#"{"embedding": {"index_unit": "chunks"}}"#)
            .expect("config should parse");
        assert_eq!(config.embedding.index_unit, IndexUnit::Chunks);
        assert_eq!("Segment".parse::<IndexUnit>().ok(), Some(IndexUnit::Segments));
        assert!("pages".parse::<IndexUnit>().is_err());
    }

    #[test]
    fn overlap_must_be_below_target() {
        let config = ChunkingConfig {
            target_tokens: 10,
            overlap_tokens: 10,
            ..ChunkingConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn segment_type_lists_parse() {
        let parsed = parse_segment_types("header, footer,,list_item").expect("valid list");
        assert_eq!(
            parsed,
            vec![SegmentType::Header, SegmentType::Footer, SegmentType::ListItem]
        );
        assert!(parse_segment_types("header,banner").is_err());
    }
}
