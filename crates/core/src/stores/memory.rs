//! In-process backend implementing all three store traits.
//!
//! Vectors are searched by brute-force cosine distance. Lexical search requires every
//! normalised query term to be present and ranks by the mean of `tf / (tf + 1)` over
//! the query terms. The whole state, including the daily embedding budget, can be
//! snapshotted to a JSON file.

use crate::embeddings::cosine_distance;
use crate::models::{Document, IndexRecord, KeyValue, SearchQuery, Table, TextSegment};
use crate::rate_limit::BudgetState;
use crate::store::DocumentStore;
use crate::traits::{KeywordIndex, KeywordMatch, VectorIndex, VectorMatch};
use crate::SearchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::debug;

const STOP_WORDS: [&str; 32] = [
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "in", "is", "it",
    "its", "of", "on", "or", "that", "the", "this", "to", "was", "were", "will", "with", "what",
    "which", "who", "how", "do", "does",
];

const SUFFIXES: [&str; 6] = ["ing", "ies", "ed", "es", "ly", "s"];

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryState {
    documents: BTreeMap<String, Document>,
    segments: BTreeMap<String, BTreeMap<u32, TextSegment>>,
    tables: BTreeMap<String, Vec<Table>>,
    key_values: BTreeMap<String, Vec<KeyValue>>,
    records: BTreeMap<String, IndexRecord>,
    vectors: BTreeMap<String, Vec<f32>>,
    #[serde(default)]
    budget: Option<BudgetState>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a snapshot, or starts empty when the file does not exist.
    pub async fn load(path: &Path) -> Result<Self, SearchError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new());
            }
            Err(error) => {
                return Err(SearchError::Request(format!(
                    "cannot read snapshot {}: {error}",
                    path.display()
                )))
            }
        };
        let state: MemoryState = serde_json::from_str(&raw)?;
        debug!(
            path = %path.display(),
            documents = state.documents.len(),
            "loaded memory snapshot"
        );
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    pub async fn save(&self, path: &Path) -> Result<(), SearchError> {
        let payload = {
            let state = self.state.read().await;
            serde_json::to_string(&*state)?
        };
        tokio::fs::write(path, payload).await.map_err(|error| {
            SearchError::Request(format!("cannot write snapshot {}: {error}", path.display()))
        })
    }

    /// Daily embedding budget saved with the snapshot, if any.
    pub async fn budget_state(&self) -> Option<BudgetState> {
        self.state.read().await.budget
    }

    pub async fn set_budget_state(&self, budget: BudgetState) {
        self.state.write().await.budget = Some(budget);
    }

    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn vector_count(&self) -> usize {
        self.state.read().await.vectors.len()
    }
}

/// Lowercased alphanumeric terms with stop-words removed and common suffixes stripped.
pub fn normalize_terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|term| !term.is_empty() && !STOP_WORDS.contains(term))
        .map(stem)
        .collect()
}

fn stem(term: &str) -> String {
    for suffix in SUFFIXES {
        if let Some(root) = term.strip_suffix(suffix) {
            if root.chars().count() >= 3 {
                return root.to_string();
            }
        }
    }
    term.to_string()
}

/// `None` when some query term is absent from the text.
pub fn lexical_rank(query_terms: &[String], text: &str) -> Option<f64> {
    if query_terms.is_empty() {
        return None;
    }

    let mut frequencies: HashMap<String, usize> = HashMap::new();
    for term in normalize_terms(text) {
        *frequencies.entry(term).or_default() += 1;
    }

    let mut total = 0.0;
    for term in query_terms {
        let tf = *frequencies.get(term)? as f64;
        total += tf / (tf + 1.0);
    }
    Some(total / query_terms.len() as f64)
}

fn document_type_matches(record: &IndexRecord, document_type: Option<&str>) -> bool {
    document_type.map_or(true, |wanted| record.document_type == wanted)
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn save_document(&self, document: &Document) -> Result<(), SearchError> {
        let mut state = self.state.write().await;
        state
            .documents
            .insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, SearchError> {
        Ok(self.state.read().await.documents.get(document_id).cloned())
    }

    async fn list_documents(&self) -> Result<Vec<Document>, SearchError> {
        Ok(self.state.read().await.documents.values().cloned().collect())
    }

    async fn save_segments(&self, segments: &[TextSegment]) -> Result<(), SearchError> {
        let mut state = self.state.write().await;
        for segment in segments {
            state
                .segments
                .entry(segment.document_id.clone())
                .or_default()
                .insert(segment.sequence_number, segment.clone());
        }
        Ok(())
    }

    async fn segments(&self, document_id: &str) -> Result<Vec<TextSegment>, SearchError> {
        let state = self.state.read().await;
        Ok(state
            .segments
            .get(document_id)
            .map(|by_sequence| by_sequence.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_tables(&self, tables: &[Table]) -> Result<(), SearchError> {
        let mut state = self.state.write().await;
        for table in tables {
            state
                .tables
                .entry(table.document_id.clone())
                .or_default()
                .push(table.clone());
        }
        Ok(())
    }

    async fn tables(&self, document_id: &str) -> Result<Vec<Table>, SearchError> {
        let state = self.state.read().await;
        Ok(state.tables.get(document_id).cloned().unwrap_or_default())
    }

    async fn save_key_values(&self, key_values: &[KeyValue]) -> Result<(), SearchError> {
        let mut state = self.state.write().await;
        for key_value in key_values {
            state
                .key_values
                .entry(key_value.document_id.clone())
                .or_default()
                .push(key_value.clone());
        }
        Ok(())
    }

    async fn key_values(&self, document_id: &str) -> Result<Vec<KeyValue>, SearchError> {
        let state = self.state.read().await;
        Ok(state.key_values.get(document_id).cloned().unwrap_or_default())
    }

    async fn clear_derived(&self, document_id: &str) -> Result<(), SearchError> {
        let mut state = self.state.write().await;
        state.segments.remove(document_id);
        state.tables.remove(document_id);
        state.key_values.remove(document_id);
        Ok(())
    }
}

#[async_trait]
impl KeywordIndex for MemoryStore {
    async fn index_records(&self, records: &[IndexRecord]) -> Result<(), SearchError> {
        let mut state = self.state.write().await;
        for record in records {
            state.records.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn search_keyword(&self, query: &SearchQuery) -> Result<Vec<KeywordMatch>, SearchError> {
        let terms = {
            let mut terms = normalize_terms(&query.text);
            terms.sort();
            terms.dedup();
            terms
        };

        let state = self.state.read().await;
        let mut matches: Vec<KeywordMatch> = state
            .records
            .values()
            .filter(|record| document_type_matches(record, query.document_type.as_deref()))
            .filter_map(|record| {
                lexical_rank(&terms, &record.text).map(|rank| KeywordMatch {
                    record: record.clone(),
                    rank,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.rank
                .partial_cmp(&a.rank)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        matches.truncate(query.top_k);
        Ok(matches)
    }

    async fn delete_document_records(&self, document_id: &str) -> Result<(), SearchError> {
        let mut state = self.state.write().await;
        state
            .records
            .retain(|_, record| record.document_id != document_id);
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for MemoryStore {
    async fn upsert_vectors(
        &self,
        records: &[IndexRecord],
        vectors: &[Vec<f32>],
    ) -> Result<(), SearchError> {
        if records.len() != vectors.len() {
            return Err(SearchError::Request(format!(
                "vector count {} doesn't match record count {}",
                vectors.len(),
                records.len()
            )));
        }

        let mut state = self.state.write().await;
        for (record, vector) in records.iter().zip(vectors.iter()) {
            state.records.insert(record.id.clone(), record.clone());
            state.vectors.insert(record.id.clone(), vector.clone());
        }
        debug!(count = records.len(), "upserted vectors");
        Ok(())
    }

    async fn search_vector(
        &self,
        vector: &[f32],
        limit: usize,
        document_type: Option<&str>,
    ) -> Result<Vec<VectorMatch>, SearchError> {
        let state = self.state.read().await;
        let mut matches: Vec<VectorMatch> = state
            .vectors
            .iter()
            .filter_map(|(id, stored)| {
                let record = state.records.get(id)?;
                document_type_matches(record, document_type).then(|| VectorMatch {
                    record: record.clone(),
                    distance: cosine_distance(vector, stored),
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    async fn vectors_for(&self, ids: &[String]) -> Result<HashMap<String, Vec<f32>>, SearchError> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.vectors.get(id).map(|vector| (id.clone(), vector.clone())))
            .collect())
    }

    async fn delete_document_vectors(&self, document_id: &str) -> Result<(), SearchError> {
        let mut state = self.state.write().await;
        let MemoryState {
            records, vectors, ..
        } = &mut *state;
        vectors.retain(|id, _| {
            records
                .get(id)
                .map_or(true, |record| record.document_id != document_id)
        });
        Ok(())
    }
}
