use crate::models::{IndexRecord, SearchQuery};
use crate::traits::{KeywordIndex, KeywordMatch};
use crate::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;

/// Lexical index over OpenSearch. Every query term must match (`operator: and`), and BM25
/// scores are divided by the best score of the page so ranks land in `(0, 1]`.
pub struct OpenSearchStore {
    client: Arc<Client>,
    endpoint: String,
    index_name: String,
}

impl OpenSearchStore {
    pub fn new(endpoint: impl Into<String>, index_name: impl Into<String>) -> Self {
        Self {
            client: Arc::new(Client::new()),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            index_name: index_name.into(),
        }
    }

    pub async fn ensure_index(&self) -> Result<(), SearchError> {
        let response = self
            .client
            .head(format!("{}/{}", self.endpoint, self.index_name))
            .send()
            .await?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }

        if !response.status().is_client_error() {
            return Err(SearchError::BackendResponse {
                backend: "opensearch".to_string(),
                details: response.status().to_string(),
            });
        }

        let response = self
            .client
            .put(format!("{}/{}", self.endpoint, self.index_name))
            .json(&json!({
                "settings": {
                    "number_of_shards": 1,
                    "number_of_replicas": 0,
                    "analysis": {
                        "analyzer": {
                            "english_text": {
                                "type": "english"
                            }
                        }
                    }
                },
                "mappings": {
                    "properties": {
                        "text": {"type": "text", "analyzer": "english_text"},
                        "section": {"type": "text", "analyzer": "english_text"},
                        "document_id": {"type": "keyword"},
                        "document_type": {"type": "keyword"},
                        "filename": {"type": "keyword"},
                        "sequence_number": {"type": "integer"}
                    }
                }
            }))
            .send()
            .await?;

        if response.status().is_server_error() || response.status().is_client_error() {
            return Err(SearchError::Request(format!(
                "open-search index setup failed with {}",
                response.status()
            )));
        }

        Ok(())
    }
}

fn bulk_payload(index_name: &str, records: &[IndexRecord]) -> Result<String, SearchError> {
    let mut lines = Vec::with_capacity(records.len() * 2);
    for record in records {
        lines.push(serde_json::to_string(&json!({
            "index": { "_index": index_name, "_id": record.id }
        }))?);
        lines.push(serde_json::to_string(record)?);
    }
    Ok(lines.join("\n") + "\n")
}

fn search_body(query: &SearchQuery) -> Value {
    let mut filters = Vec::new();
    if let Some(document_type) = &query.document_type {
        filters.push(json!({ "term": { "document_type": document_type } }));
    }

    json!({
        "size": query.top_k,
        "query": {
            "bool": {
                "must": [{
                    "match": {
                        "text": { "query": query.text, "operator": "and" }
                    }
                }],
                "filter": filters
            }
        }
    })
}

fn parse_hits(response: &Value) -> Vec<KeywordMatch> {
    let hits = response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let scored: Vec<(IndexRecord, f64)> = hits
        .iter()
        .filter_map(|hit| {
            let record: IndexRecord = serde_json::from_value(hit.pointer("/_source")?.clone()).ok()?;
            let score = hit.pointer("/_score").and_then(Value::as_f64).unwrap_or(0.0);
            Some((record, score))
        })
        .collect();

    let best = scored
        .iter()
        .map(|(_, score)| *score)
        .fold(0.0f64, f64::max);

    scored
        .into_iter()
        .map(|(record, score)| KeywordMatch {
            record,
            rank: if best > 0.0 { score / best } else { 0.0 },
        })
        .collect()
}

#[async_trait]
impl KeywordIndex for OpenSearchStore {
    async fn index_records(&self, records: &[IndexRecord]) -> Result<(), SearchError> {
        if records.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(format!("{}/_bulk", self.endpoint))
            .header("Content-Type", "application/x-ndjson")
            .body(bulk_payload(&self.index_name, records)?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: "opensearch".to_string(),
                details: response.status().to_string(),
            });
        }
        Ok(())
    }

    async fn search_keyword(&self, query: &SearchQuery) -> Result<Vec<KeywordMatch>, SearchError> {
        let response = self
            .client
            .post(format!("{}/{}/_search", self.endpoint, self.index_name))
            .json(&search_body(query))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: "opensearch".to_string(),
                details: response.status().to_string(),
            });
        }

        let response_json: Value = response.json().await?;
        Ok(parse_hits(&response_json))
    }

    async fn delete_document_records(&self, document_id: &str) -> Result<(), SearchError> {
        let response = self
            .client
            .post(format!(
                "{}/{}/_delete_by_query",
                self.endpoint, self.index_name
            ))
            .json(&json!({ "query": { "term": { "document_id": document_id } } }))
            .send()
            .await?;

        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(SearchError::BackendResponse {
                backend: "opensearch".to_string(),
                details: response.status().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> IndexRecord {
        IndexRecord {
            id: id.to_string(),
            document_id: "doc".to_string(),
            filename: "a.pdf".to_string(),
            document_type: "pdf_document".to_string(),
            sequence_number: Some(1),
            section: Some("Scope".to_string()),
            text: "pump pressure".to_string(),
        }
    }

    #[test]
    fn bulk_payload_is_ndjson() {
        let payload = bulk_payload("docs", &[record("a"), record("b")]).unwrap();
        assert_eq!(payload.lines().count(), 4);
        assert!(payload.ends_with('\n'));
        assert!(payload.lines().next().unwrap().contains("\"_id\":\"a\""));
    }

    #[test]
    fn search_body_filters_by_document_type() {
        let mut query = SearchQuery::new("pump", 5);
        query.document_type = Some("pdf_document".to_string());
        let body = search_body(&query);
        assert_eq!(body["size"], 5);
        assert_eq!(
            body.pointer("/query/bool/filter/0/term/document_type"),
            Some(&json!("pdf_document"))
        );
    }

    #[test]
    fn scores_are_scaled_by_the_best_hit() {
        let response = json!({
            "hits": { "hits": [
                { "_score": 4.0, "_source": serde_json::to_value(record("a")).unwrap() },
                { "_score": 1.0, "_source": serde_json::to_value(record("b")).unwrap() }
            ]}
        });
        let hits = parse_hits(&response);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].rank, 1.0);
        assert_eq!(hits[1].rank, 0.25);
    }
}
