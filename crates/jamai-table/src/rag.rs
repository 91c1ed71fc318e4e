//! RAG retrieval over Knowledge Tables
//!
//! Hybrid search: cosine similarity over the stored `Text Embed` vectors
//! plus BM25 over `Text` and `Title`, fused with Reciprocal Rank Fusion
//! (k=60), optionally reranked. The retriever never mutates the Knowledge
//! Table; runtime failures degrade to empty references so the LLM call can
//! proceed without citations.

use crate::error::Result;
use crate::schema::{GenConfig, RagParams, TableType};
use crate::store::{StoredRow, TableStore};
use jamai_llm::{
    ChatMessage, ChatRequest, Chunk, EmbeddingInput, EmbeddingRequest, ModelRouter, ModelType,
    References, RerankRequest, RouteOptions,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Reciprocal Rank Fusion constant
const RRF_K: f64 = 60.0;

/// BM25 term saturation
const BM25_K1: f64 = 1.2;
/// BM25 length normalization
const BM25_B: f64 = 0.75;

/// Hybrid retriever over Knowledge Tables
pub struct RagRetriever {
    store: TableStore,
    router: Arc<ModelRouter>,
}

impl RagRetriever {
    /// Create a retriever.
    #[must_use]
    pub fn new(store: TableStore, router: Arc<ModelRouter>) -> Self {
        Self { store, router }
    }

    /// Retrieve references for a generation call. `fallback_query` is the
    /// row's concatenated text inputs, used when `search_query` is empty and
    /// query synthesis fails.
    #[instrument(skip_all, fields(table_id = %params.table_id, k = params.k))]
    pub async fn retrieve(
        &self,
        project_id: &str,
        opts: &RouteOptions,
        params: &RagParams,
        fallback_query: &str,
    ) -> Result<References> {
        let search_query = if params.search_query.is_empty() {
            self.synthesize_query(opts, fallback_query).await
        } else {
            params.search_query.clone()
        };

        let Some(meta) = self
            .store
            .try_get_meta(project_id, TableType::Knowledge, &params.table_id)
            .await?
        else {
            warn!("knowledge table missing at run time; returning empty references");
            return Ok(References::new(Vec::new(), search_query));
        };

        let scored = self
            .hybrid_search(project_id, opts, &meta, &search_query, params.k)
            .await?;
        let mut top: Vec<StoredRow> = scored.into_iter().map(|(row, _)| row).collect();

        if let Some(reranking_model) = &params.reranking_model {
            top = self
                .rerank(opts, reranking_model, &search_query, params, top)
                .await;
        }

        let chunks = top
            .into_iter()
            .map(|row| Chunk {
                text: row.cell("Text").as_text(),
                title: row.cell("Title").as_text(),
                page: row.cell("Page").value.as_i64(),
                file_name: String::new(),
                document_id: row.cell("File ID").as_text(),
                chunk_id: row.id,
            })
            .collect();
        Ok(References::new(chunks, search_query))
    }

    /// Hybrid search: cosine over `Text Embed` fused with BM25 over
    /// `Text`+`Title` by RRF. Returns at most `limit` rows with their
    /// fused score, best first.
    pub async fn hybrid_search(
        &self,
        project_id: &str,
        opts: &RouteOptions,
        meta: &crate::schema::TableMeta,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(StoredRow, f64)>> {
        let rows = self.store.fetch_all_rows(project_id, meta).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let embedding_model = meta.column("Text Embed").and_then(|c| {
            c.gen_config
                .as_ref()
                .and_then(GenConfig::as_embed)
                .map(|e| e.embedding_model.clone())
        });
        let vector_ranking = match embedding_model {
            Some(model) => self.vector_ranking(opts, &model, query, &rows).await,
            None => Vec::new(),
        };

        let documents: Vec<String> = rows
            .iter()
            .map(|r| {
                format!(
                    "{}\n{}",
                    r.cell("Title").as_text(),
                    r.cell("Text").as_text()
                )
            })
            .collect();
        let keyword_ranking = bm25_ranking(query, &documents);

        let fused = rrf_fuse(&[vector_ranking, keyword_ranking]);
        let mut out = Vec::with_capacity(limit.min(fused.len()));
        for (index, score) in fused.into_iter().take(limit) {
            out.push((rows[index].clone(), score));
        }
        Ok(out)
    }

    /// Synthesize a search query from the row's inputs using the default
    /// chat model; falls back to the inputs themselves.
    async fn synthesize_query(&self, opts: &RouteOptions, fallback: &str) -> String {
        let registry = self.router.registry();
        let model = match registry
            .resolve_model(
                &opts.organization_id,
                "",
                ModelType::Llm,
                &[jamai_llm::Capability::Chat],
            )
            .await
        {
            Ok(model) => model,
            Err(_) => return fallback.to_string(),
        };
        let request = ChatRequest::new(
            model.id,
            vec![
                ChatMessage::system(
                    "Formulate a concise search query that would retrieve the \
information needed to respond to the input. Reply with the query only.",
                ),
                ChatMessage::user(fallback.to_string()),
            ],
        )
        .with_max_tokens(64);
        match self.router.chat(opts, &request).await {
            Ok(response) => {
                let query = response.text().trim().to_string();
                if query.is_empty() {
                    fallback.to_string()
                } else {
                    query
                }
            }
            Err(e) => {
                debug!(error = %e, "query synthesis failed; using row inputs");
                fallback.to_string()
            }
        }
    }

    async fn vector_ranking(
        &self,
        opts: &RouteOptions,
        embedding_model: &str,
        query: &str,
        rows: &[StoredRow],
    ) -> Vec<usize> {
        let request = EmbeddingRequest {
            model: embedding_model.to_string(),
            input: EmbeddingInput::One(query.to_string()),
            dimensions: None,
            encoding_format: jamai_llm::EncodingFormat::Float,
        };
        let query_vec = match self.router.embed(opts, &request).await {
            Ok(response) => response
                .data
                .first()
                .map(|d| d.embedding.to_floats())
                .unwrap_or_default(),
            Err(e) => {
                debug!(error = %e, "query embedding failed; vector ranking skipped");
                return Vec::new();
            }
        };
        if query_vec.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f64)> = rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| {
                let vector: Vec<f32> =
                    serde_json::from_value(row.cell("Text Embed").value).ok()?;
                Some((i, cosine_similarity(&query_vec, &vector)))
            })
            .filter(|(_, s)| s.is_finite())
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(i, _)| i).collect()
    }

    async fn rerank(
        &self,
        opts: &RouteOptions,
        model: &str,
        query: &str,
        params: &RagParams,
        candidates: Vec<StoredRow>,
    ) -> Vec<StoredRow> {
        let documents: Vec<String> = candidates
            .iter()
            .map(|row| {
                let text = row.cell("Text").as_text();
                if params.concat_reranker_input {
                    format!("{}\n{text}", row.cell("Title").as_text())
                } else {
                    text
                }
            })
            .collect();
        let request = RerankRequest {
            model: model.to_string(),
            query: query.to_string(),
            documents,
            top_n: Some(params.k as u32),
        };
        match self.router.rerank(opts, &request).await {
            Ok(response) => {
                let reordered: Vec<StoredRow> = response
                    .results
                    .iter()
                    .filter_map(|r| candidates.get(r.index as usize).cloned())
                    .take(params.k)
                    .collect();
                if reordered.is_empty() {
                    candidates
                } else {
                    reordered
                }
            }
            Err(e) => {
                debug!(error = %e, "rerank failed; keeping fused order");
                candidates
            }
        }
    }
}

/// Format retrieved chunks as the injected system message. Chunks are
/// addressed as `[@0]` ... `[@n-1]`; with `inline_citations` the model is
/// told to cite them.
#[must_use]
pub fn build_rag_message(references: &References, inline_citations: bool) -> String {
    let mut message = String::from(
        "Use the following retrieved context to respond. \
Each chunk is labelled with its index.\n",
    );
    for (i, chunk) in references.chunks.iter().enumerate() {
        message.push_str(&format!("\n[@{i}] "));
        if !chunk.title.is_empty() {
            message.push_str(&chunk.title);
            message.push_str(": ");
        }
        message.push_str(&chunk.text);
    }
    if inline_citations {
        message.push_str(
            "\n\nCite the chunks you rely on inline using their labels, \
for example [@0; @2].",
        );
    }
    message
}

/// Cosine similarity between two vectors; 0.0 when dimensions mismatch.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Document indices ranked by BM25 score against the query, best first.
/// Zero-scoring documents are excluded.
#[must_use]
pub fn bm25_ranking(query: &str, documents: &[String]) -> Vec<usize> {
    let query_terms = terms(query);
    if query_terms.is_empty() || documents.is_empty() {
        return Vec::new();
    }
    let docs: Vec<Vec<String>> = documents.iter().map(|d| terms(d)).collect();
    let n = docs.len() as f64;
    let avg_len = docs.iter().map(Vec::len).sum::<usize>() as f64 / n;

    let mut df: HashMap<&str, usize> = HashMap::new();
    for term in &query_terms {
        let count = docs
            .iter()
            .filter(|d| d.iter().any(|t| t == term))
            .count();
        df.insert(term, count);
    }

    let mut scored: Vec<(usize, f64)> = docs
        .iter()
        .enumerate()
        .map(|(i, doc)| {
            let len_norm = 1.0 - BM25_B + BM25_B * doc.len() as f64 / avg_len.max(1.0);
            let score: f64 = query_terms
                .iter()
                .map(|term| {
                    let tf = doc.iter().filter(|t| *t == term).count() as f64;
                    if tf == 0.0 {
                        return 0.0;
                    }
                    let dfi = df.get(term.as_str()).copied().unwrap_or(0) as f64;
                    let idf = ((n - dfi + 0.5) / (dfi + 0.5) + 1.0).ln();
                    idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * len_norm)
                })
                .sum();
            (i, score)
        })
        .filter(|(_, s)| *s > 0.0)
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().map(|(i, _)| i).collect()
}

/// Fuse rankings with Reciprocal Rank Fusion: each document scores
/// `sum(1 / (60 + rank))` across the rankings it appears in.
#[must_use]
pub fn rrf_fuse(rankings: &[Vec<usize>]) -> Vec<(usize, f64)> {
    let mut scores: HashMap<usize, f64> = HashMap::new();
    for ranking in rankings {
        for (rank, &doc) in ranking.iter().enumerate() {
            *scores.entry(doc).or_insert(0.0) += 1.0 / (RRF_K + rank as f64 + 1.0);
        }
    }
    let mut fused: Vec<(usize, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_bm25_prefers_matching_documents() {
        let docs = vec![
            "the cat sat on the mat".to_string(),
            "dogs chase cats in the park".to_string(),
            "quantum computing with qubits".to_string(),
        ];
        let ranking = bm25_ranking("cat mat", &docs);
        assert_eq!(ranking.first(), Some(&0));
        assert!(!ranking.contains(&2));
    }

    #[test]
    fn test_rrf_rewards_agreement() {
        // Document 1 appears high in both rankings; 0 and 2 in only one.
        let fused = rrf_fuse(&[vec![1, 0], vec![1, 2]]);
        assert_eq!(fused[0].0, 1);
        let expected = 2.0 / (RRF_K + 1.0);
        assert!((fused[0].1 - expected).abs() < 1e-9);
    }

    #[test]
    fn test_rrf_empty_rankings() {
        assert!(rrf_fuse(&[Vec::new(), Vec::new()]).is_empty());
    }

    #[test]
    fn test_rag_message_labels_and_citations() {
        let references = References::new(
            vec![
                Chunk {
                    text: "alpha".to_string(),
                    title: "Doc".to_string(),
                    ..Default::default()
                },
                Chunk {
                    text: "beta".to_string(),
                    ..Default::default()
                },
            ],
            "query",
        );
        let message = build_rag_message(&references, true);
        assert!(message.contains("[@0] Doc: alpha"));
        assert!(message.contains("[@1] beta"));
        assert!(message.contains("[@0; @2]"));

        let plain = build_rag_message(&references, false);
        assert!(!plain.contains("Cite the chunks"));
    }
}
