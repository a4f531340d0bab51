use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("multimodal OCR failed: {0}")]
    OcrFailed(String),

    #[error("store error: {0}")]
    Store(#[from] SearchError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("provider rate limit hit: {0}")]
    RateLimited(String),

    #[error("provider request timed out after {0}s")]
    Timeout(u64),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid embedding dimensions: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("nothing to embed after cleaning")]
    EmptyInput,

    #[error("daily call budget of {0} exhausted")]
    BudgetExhausted(u64),
}

impl EmbeddingError {
    /// Transient provider failures and malformed vectors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EmbeddingError::RateLimited(_)
                | EmbeddingError::Timeout(_)
                | EmbeddingError::Provider(_)
                | EmbeddingError::DimensionMismatch { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::EmbeddingError;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(EmbeddingError::RateLimited("429".to_string()).is_retryable());
        assert!(EmbeddingError::Timeout(30).is_retryable());
        assert!(EmbeddingError::Provider("boom".to_string()).is_retryable());
        assert!(EmbeddingError::DimensionMismatch {
            expected: 4,
            actual: 3
        }
        .is_retryable());
    }

    #[test]
    fn input_and_budget_errors_are_terminal() {
        assert!(!EmbeddingError::EmptyInput.is_retryable());
        assert!(!EmbeddingError::BudgetExhausted(10).is_retryable());
    }
}
