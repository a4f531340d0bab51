use crate::models::{IndexRecord, SearchQuery};
use crate::SearchError;
use async_trait::async_trait;
use std::collections::HashMap;

/// A stored record that satisfied the lexical predicate, with its relevance rank.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordMatch {
    pub record: IndexRecord,
    pub rank: f64,
}

/// A stored record and its cosine distance to the query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub record: IndexRecord,
    pub distance: f64,
}

#[async_trait]
pub trait KeywordIndex: Send + Sync {
    async fn index_records(&self, records: &[IndexRecord]) -> Result<(), SearchError>;

    /// Records matching every query term, best rank first, at most `query.top_k`.
    async fn search_keyword(&self, query: &SearchQuery) -> Result<Vec<KeywordMatch>, SearchError>;

    async fn delete_document_records(&self, document_id: &str) -> Result<(), SearchError>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert_vectors(
        &self,
        records: &[IndexRecord],
        vectors: &[Vec<f32>],
    ) -> Result<(), SearchError>;

    /// Nearest records ascending by distance, optionally restricted to one document type.
    async fn search_vector(
        &self,
        vector: &[f32],
        limit: usize,
        document_type: Option<&str>,
    ) -> Result<Vec<VectorMatch>, SearchError>;

    /// Stored vectors for the given record ids; unknown ids are left out.
    async fn vectors_for(&self, ids: &[String]) -> Result<HashMap<String, Vec<f32>>, SearchError>;

    async fn delete_document_vectors(&self, document_id: &str) -> Result<(), SearchError>;
}
