use crate::models::IndexRecord;
use crate::traits::{VectorIndex, VectorMatch};
use crate::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Qdrant over its REST API. Qdrant reports similarity for cosine collections, so
/// distances are derived as `1 - score`.
pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
}

impl QdrantStore {
    pub fn new(endpoint: impl Into<String>, collection: impl Into<String>, vector_size: usize) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::new(),
            vector_size,
        }
    }

    pub async fn ensure_collection(&self) -> Result<(), SearchError> {
        let url = format!("{}/collections/{}", self.endpoint, self.collection);
        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            return Ok(());
        }

        let response = self
            .client
            .put(&url)
            .json(&json!({
                "vectors": { "size": self.vector_size, "distance": "Cosine" }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }
        Ok(())
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), SearchError> {
        if vector.len() != self.vector_size {
            return Err(SearchError::Request(format!(
                "vector dimension {} != {}",
                vector.len(),
                self.vector_size
            )));
        }
        Ok(())
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, SearchError> {
        let response = self
            .client
            .post(format!(
                "{}/collections/{}/{}",
                self.endpoint, self.collection, path
            ))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }
        Ok(response.json().await?)
    }
}

/// Qdrant accepts unsigned integers or UUIDs as point ids, so record ids are hashed.
pub fn point_id(record_id: &str) -> u64 {
    let digest = Sha256::digest(record_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn record_from_payload(payload: &Value) -> Option<IndexRecord> {
    serde_json::from_value(payload.clone()).ok()
}

fn document_filter(field: &str, value: &str) -> Value {
    json!({ "must": [{ "key": field, "match": { "value": value } }] })
}

#[async_trait]
impl VectorIndex for QdrantStore {
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

        let points = records
            .iter()
            .zip(vectors.iter())
            .map(|(record, vector)| {
                self.check_dimensions(vector)?;
                Ok(json!({
                    "id": point_id(&record.id),
                    "vector": vector,
                    "payload": serde_json::to_value(record)?,
                }))
            })
            .collect::<Result<Vec<_>, SearchError>>()?;

        if points.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .put(format!(
                "{}/collections/{}/points?wait=true",
                self.endpoint, self.collection
            ))
            .json(&json!({ "points": points }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        Ok(())
    }

    async fn search_vector(
        &self,
        vector: &[f32],
        limit: usize,
        document_type: Option<&str>,
    ) -> Result<Vec<VectorMatch>, SearchError> {
        self.check_dimensions(vector)?;

        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(document_type) = document_type {
            body["filter"] = document_filter("document_type", document_type);
        }

        let parsed = self.post("points/search", body).await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(hits
            .iter()
            .filter_map(|hit| {
                let record = record_from_payload(hit.pointer("/payload")?)?;
                let score = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0);
                Some(VectorMatch {
                    record,
                    distance: 1.0 - score,
                })
            })
            .collect())
    }

    async fn vectors_for(&self, ids: &[String]) -> Result<HashMap<String, Vec<f32>>, SearchError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let point_ids: Vec<u64> = ids.iter().map(|id| point_id(id)).collect();
        let parsed = self
            .post(
                "points",
                json!({ "ids": point_ids, "with_payload": true, "with_vector": true }),
            )
            .await?;

        let points = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(points
            .iter()
            .filter_map(|point| {
                let record = record_from_payload(point.pointer("/payload")?)?;
                let vector: Vec<f32> = point
                    .pointer("/vector")
                    .and_then(Value::as_array)?
                    .iter()
                    .map(|value| value.as_f64().unwrap_or(0.0) as f32)
                    .collect();
                Some((record.id, vector))
            })
            .collect())
    }

    async fn delete_document_vectors(&self, document_id: &str) -> Result<(), SearchError> {
        self.post(
            "points/delete?wait=true",
            json!({ "filter": document_filter("document_id", document_id) }),
        )
        .await?;
        Ok(())
    }
}
