use crate::config::RetrievalConfig;
use crate::embeddings::{cosine_distance, EmbeddingProvider};
use crate::error::EmbeddingError;
use crate::models::{IndexRecord, SearchHit, SearchMode, SearchQuery, SearchResult, SearchType};
use crate::traits::{KeywordIndex, VectorIndex};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// A hybrid candidate before fusion. `distance` is `None` when the record has no stored vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub record: IndexRecord,
    pub keyword_rank: Option<f64>,
    pub distance: Option<f64>,
}

/// `keyword_weight * rank + semantic_weight * (1 - distance)`. A missing side contributes zero.
pub fn combined_score(
    keyword_weight: f64,
    semantic_weight: f64,
    keyword_rank: Option<f64>,
    distance: Option<f64>,
) -> f64 {
    let lexical = keyword_rank.unwrap_or(0.0);
    let semantic = distance.map_or(0.0, |distance| 1.0 - distance);
    keyword_weight * lexical + semantic_weight * semantic
}

/// Scores candidates and keeps the best `top_k`, highest combined score first.
pub fn fuse(candidates: Vec<Candidate>, config: &RetrievalConfig, top_k: usize) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = candidates
        .into_iter()
        .map(|candidate| {
            let score = combined_score(
                config.keyword_weight,
                config.semantic_weight,
                candidate.keyword_rank,
                candidate.distance,
            );
            SearchHit {
                record: candidate.record,
                distance: candidate.distance,
                similarity: candidate.distance.map(|distance| 1.0 - distance),
                keyword_rank: candidate.keyword_rank,
                combined_score: Some(score),
                search_type: SearchType::Hybrid,
            }
        })
        .collect();

    hits.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    hits.truncate(top_k);
    hits
}

pub struct RetrievalEngine {
    config: RetrievalConfig,
    provider: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorIndex>,
    keywords: Arc<dyn KeywordIndex>,
}

impl RetrievalEngine {
    pub fn new(
        config: RetrievalConfig,
        provider: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorIndex>,
        keywords: Arc<dyn KeywordIndex>,
    ) -> Self {
        Self {
            config,
            provider,
            vectors,
            keywords,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub async fn search(&self, query: &SearchQuery, mode: SearchMode) -> SearchResult {
        match mode {
            SearchMode::Keyword => self.keyword_search(query).await,
            SearchMode::Vector => self.vector_search(query).await,
            SearchMode::Hybrid => self.hybrid_search(query).await,
        }
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let vector = self.provider.embed(text).await?;
        let expected = self.provider.dimensions();
        if vector.len() != expected {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    pub async fn keyword_search(&self, query: &SearchQuery) -> SearchResult {
        let mut result = empty_result(query, SearchMode::Keyword);
        match self.keywords.search_keyword(query).await {
            Ok(matches) => {
                result.hits = matches
                    .into_iter()
                    .map(|matched| keyword_hit(matched.record, matched.rank, SearchType::Keyword))
                    .collect();
            }
            Err(error) => result.errors.push(format!("keyword search failed: {error}")),
        }
        result
    }

    /// Ascending cosine distance. Falls back to lexical ranking when the query cannot be embedded.
    pub async fn vector_search(&self, query: &SearchQuery) -> SearchResult {
        let vector = match self.embed_query(&query.text).await {
            Ok(vector) => vector,
            Err(error) => return self.degraded(query, SearchMode::Vector, error).await,
        };

        let mut result = empty_result(query, SearchMode::Vector);
        match self
            .vectors
            .search_vector(&vector, query.top_k, query.document_type.as_deref())
            .await
        {
            Ok(matches) => {
                result.hits = matches
                    .into_iter()
                    .map(|matched| SearchHit {
                        record: matched.record,
                        distance: Some(matched.distance),
                        similarity: Some(1.0 - matched.distance),
                        keyword_rank: None,
                        combined_score: None,
                        search_type: SearchType::Vector,
                    })
                    .collect();
            }
            Err(error) => result.errors.push(format!("vector search failed: {error}")),
        }
        result
    }

    /// Candidates are lexical matches plus vector neighbours closer than `prefilter_distance`.
    pub async fn hybrid_search(&self, query: &SearchQuery) -> SearchResult {
        let vector = match self.embed_query(&query.text).await {
            Ok(vector) => vector,
            Err(error) => return self.degraded(query, SearchMode::Hybrid, error).await,
        };

        let mut result = empty_result(query, SearchMode::Hybrid);
        let pool = self.config.candidate_pool.max(query.top_k);

        let nearest = match self
            .vectors
            .search_vector(&vector, pool, query.document_type.as_deref())
            .await
        {
            Ok(matches) => matches,
            Err(error) => {
                result.errors.push(format!("vector search failed: {error}"));
                Vec::new()
            }
        };

        let pooled_query = SearchQuery {
            top_k: pool,
            ..query.clone()
        };
        let lexical = match self.keywords.search_keyword(&pooled_query).await {
            Ok(matches) => matches,
            Err(error) => {
                result.errors.push(format!("keyword search failed: {error}"));
                Vec::new()
            }
        };

        let known_distances: HashMap<String, f64> = nearest
            .iter()
            .map(|matched| (matched.record.id.clone(), matched.distance))
            .collect();

        let mut candidates: BTreeMap<String, Candidate> = BTreeMap::new();
        for matched in nearest {
            if matched.distance < self.config.prefilter_distance {
                candidates.insert(
                    matched.record.id.clone(),
                    Candidate {
                        record: matched.record,
                        keyword_rank: None,
                        distance: Some(matched.distance),
                    },
                );
            }
        }
        for matched in lexical {
            let distance = known_distances.get(&matched.record.id).copied();
            candidates
                .entry(matched.record.id.clone())
                .and_modify(|candidate| candidate.keyword_rank = Some(matched.rank))
                .or_insert(Candidate {
                    record: matched.record,
                    keyword_rank: Some(matched.rank),
                    distance,
                });
        }

        let missing: Vec<String> = candidates
            .values()
            .filter(|candidate| candidate.distance.is_none())
            .map(|candidate| candidate.record.id.clone())
            .collect();
        if !missing.is_empty() {
            match self.vectors.vectors_for(&missing).await {
                Ok(stored) => {
                    for (id, stored_vector) in stored {
                        if let Some(candidate) = candidates.get_mut(&id) {
                            candidate.distance = Some(cosine_distance(&vector, &stored_vector));
                        }
                    }
                }
                Err(error) => result.errors.push(format!("vector lookup failed: {error}")),
            }
        }

        debug!(
            query = %query.text,
            candidates = candidates.len(),
            "fusing hybrid candidates"
        );
        result.hits = fuse(candidates.into_values().collect(), &self.config, query.top_k);
        result
    }

    async fn degraded(
        &self,
        query: &SearchQuery,
        mode: SearchMode,
        error: EmbeddingError,
    ) -> SearchResult {
        warn!(query = %query.text, error = %error, "query embedding failed; using keyword ranking only");
        let mut result = self.keyword_search(query).await;
        result.mode = mode;
        result
            .errors
            .insert(0, format!("query embedding failed: {error}"));
        for hit in &mut result.hits {
            hit.search_type = SearchType::KeywordOnly;
        }
        result
    }
}

fn empty_result(query: &SearchQuery, mode: SearchMode) -> SearchResult {
    SearchResult {
        query: query.text.clone(),
        mode,
        hits: Vec::new(),
        errors: Vec::new(),
    }
}

fn keyword_hit(record: IndexRecord, rank: f64, search_type: SearchType) -> SearchHit {
    SearchHit {
        record,
        distance: None,
        similarity: None,
        keyword_rank: Some(rank),
        combined_score: None,
        search_type,
    }
}
