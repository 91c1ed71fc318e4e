//! Billing metrics counters

/// Counters emitted when a request's usage is processed
pub struct BillingMetrics;

impl BillingMetrics {
    /// LLM tokens consumed (native tokens, not mtok)
    pub fn record_llm_tokens(organization_id: &str, model_id: &str, tokens: u64) {
        metrics::counter!(
            "llm_token_usage",
            tokens,
            "organization_id" => organization_id.to_string(),
            "model_id" => model_id.to_string()
        );
    }

    /// Embedding tokens consumed
    pub fn record_embedding_tokens(organization_id: &str, model_id: &str, tokens: u64) {
        metrics::counter!(
            "embedding_token_usage",
            tokens,
            "organization_id" => organization_id.to_string(),
            "model_id" => model_id.to_string()
        );
    }

    /// Reranker searches performed
    pub fn record_rerank_searches(organization_id: &str, model_id: &str, searches: u64) {
        metrics::counter!(
            "reranker_search_usage",
            searches,
            "organization_id" => organization_id.to_string(),
            "model_id" => model_id.to_string()
        );
    }

    /// Egress bytes served
    pub fn record_egress_bytes(organization_id: &str, bytes: u64) {
        metrics::counter!(
            "bandwidth_usage",
            bytes,
            "organization_id" => organization_id.to_string()
        );
    }

    /// Dollars charged (micro-dollars, to keep the counter integral)
    pub fn record_spent(organization_id: &str, cost_usd: f64) {
        metrics::counter!(
            "spent",
            (cost_usd * 1_000_000.0) as u64,
            "organization_id" => organization_id.to_string()
        );
    }
}
