use crate::models::{Document, KeyValue, Table, TextSegment};
use crate::SearchError;
use async_trait::async_trait;

/// Relational side of the knowledge base: documents and the rows derived from them.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn save_document(&self, document: &Document) -> Result<(), SearchError>;

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, SearchError>;

    async fn list_documents(&self) -> Result<Vec<Document>, SearchError>;

    /// Upserts by `(document_id, sequence_number)`.
    async fn save_segments(&self, segments: &[TextSegment]) -> Result<(), SearchError>;

    /// Segments in sequence order.
    async fn segments(&self, document_id: &str) -> Result<Vec<TextSegment>, SearchError>;

    async fn save_tables(&self, tables: &[Table]) -> Result<(), SearchError>;

    async fn tables(&self, document_id: &str) -> Result<Vec<Table>, SearchError>;

    async fn save_key_values(&self, key_values: &[KeyValue]) -> Result<(), SearchError>;

    async fn key_values(&self, document_id: &str) -> Result<Vec<KeyValue>, SearchError>;

    /// Drops segments, tables with their cells, and key-values. The document row stays.
    async fn clear_derived(&self, document_id: &str) -> Result<(), SearchError>;
}
