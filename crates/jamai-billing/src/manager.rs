//! Per-request billing manager
//!
//! One manager is created per API request and never shared, so its
//! accumulators need no synchronization. The pre-flight gate runs before any
//! provider call; `process_all` runs as a background task after the response
//! is written and is the only place that touches org counters.

use crate::error::{Error, Result};
use crate::events::{EventBuffer, ProductType, UsageData};
use crate::metrics::BillingMetrics;
use crate::org::{Organization, OrgStore};
use jamai_llm::ModelConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Whether quota enforcement is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    /// Self-hosted: every gate passes, nothing is charged
    Oss,
    /// Cloud: quotas and credits are enforced
    Cloud,
}

/// Tokens or searches recorded against one model call
#[derive(Debug, Clone)]
struct UsageRecord {
    product: ProductType,
    /// Native unit amount: tokens for LLM/embed, searches for rerank
    amount: f64,
    model_id: String,
    /// Whether the model is free-tier eligible (ellm-owned)
    is_ellm: bool,
    /// USD cost of the full amount before free tier is applied
    full_cost: f64,
}

/// Per-request usage accumulator and quota gate
pub struct BillingManager {
    store: Arc<OrgStore>,
    buffer: Arc<EventBuffer>,
    mode: DeploymentMode,
    organization_id: String,
    project_id: String,
    records: Vec<UsageRecord>,
    /// Snapshot updates (storage GiB) applied on process
    values: HashMap<ProductType, f64>,
    /// Egress GiB accumulated this request
    egress_gib: f64,
}

impl BillingManager {
    /// Create a manager for one request.
    #[must_use]
    pub fn new(
        store: Arc<OrgStore>,
        buffer: Arc<EventBuffer>,
        mode: DeploymentMode,
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            buffer,
            mode,
            organization_id: organization_id.into(),
            project_id: project_id.into(),
            records: Vec::new(),
            values: HashMap::new(),
            egress_gib: 0.0,
        }
    }

    /// The organization this manager bills.
    #[must_use]
    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    // ========================================================================
    // Pre-flight gates
    // ========================================================================

    /// Gate a generation call: passes when self-hosted, when the org has
    /// spendable balance, when the org supplied its own provider key, or when
    /// the model is ellm-owned and free-tier headroom remains. Otherwise the
    /// request fails before any provider call.
    #[instrument(skip(self, model), fields(org = %self.organization_id, model_id = %model.id))]
    pub async fn check_quota(&self, model: &ModelConfig, product: ProductType) -> Result<()> {
        if self.mode == DeploymentMode::Oss {
            return Ok(());
        }
        let org = self.store.get_org(&self.organization_id).await?;
        if self.passes_gate(&org, model, product) {
            return Ok(());
        }
        debug!("quota gate rejected request");
        Err(Error::InsufficientCredits(
            model.display_name().to_string(),
        ))
    }

    fn passes_gate(&self, org: &Organization, model: &ModelConfig, product: ProductType) -> bool {
        if org.spendable() > 0.0 {
            return true;
        }
        if org.external_keys.contains_key(model.provider_prefix()) {
            return true;
        }
        model.is_ellm() && org.quotas.headroom(product) > 0.0
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Record an LLM call's token usage.
    pub fn record_llm_usage(&mut self, model: &ModelConfig, prompt_tokens: u32, completion_tokens: u32) {
        let full_cost = f64::from(prompt_tokens) / 1e6 * model.llm_input_cost_per_mtoken
            + f64::from(completion_tokens) / 1e6 * model.llm_output_cost_per_mtoken;
        self.records.push(UsageRecord {
            product: ProductType::LlmTokens,
            amount: f64::from(prompt_tokens + completion_tokens),
            model_id: model.id.clone(),
            is_ellm: model.is_ellm(),
            full_cost,
        });
    }

    /// Record an embedding call's token usage.
    pub fn record_embed_usage(&mut self, model: &ModelConfig, tokens: u32) {
        let full_cost = f64::from(tokens) / 1e6 * model.embedding_cost_per_mtoken;
        self.records.push(UsageRecord {
            product: ProductType::EmbeddingTokens,
            amount: f64::from(tokens),
            model_id: model.id.clone(),
            is_ellm: model.is_ellm(),
            full_cost,
        });
    }

    /// Record a rerank call.
    pub fn record_rerank_usage(&mut self, model: &ModelConfig, searches: u32) {
        let full_cost = f64::from(searches) / 1e3 * model.reranking_cost_per_ksearch;
        self.records.push(UsageRecord {
            product: ProductType::RerankerSearches,
            amount: f64::from(searches),
            model_id: model.id.clone(),
            is_ellm: model.is_ellm(),
            full_cost,
        });
    }

    /// Record response egress.
    pub fn record_egress(&mut self, bytes: u64) {
        self.egress_gib += bytes as f64 / (1024.0 * 1024.0 * 1024.0);
    }

    /// Record a storage snapshot (GiB) applied at process time.
    pub fn set_storage_usage(&mut self, product: ProductType, gib: f64) {
        self.values.insert(product, gib);
    }

    /// Whether anything was recorded this request.
    #[must_use]
    pub fn has_usage(&self) -> bool {
        !self.records.is_empty() || self.egress_gib > 0.0 || !self.values.is_empty()
    }

    // ========================================================================
    // Post-response processing
    // ========================================================================

    /// Process every recorded event: apply free-tier quota (ellm models,
    /// tokens before dollars), charge the remainder against credit_grant then
    /// credit, bump usage counters, enqueue analytics events and emit
    /// metrics. Intended to run as a background task; failures are logged
    /// and never surface to the request.
    #[instrument(skip(self), fields(org = %self.organization_id, records = self.records.len()))]
    pub async fn process_all(self) {
        let Self {
            store,
            buffer,
            mode,
            organization_id,
            project_id,
            records,
            values,
            egress_gib,
        } = self;

        let mut total_cost = 0.0;
        for record in records {
            let native_per_unit = match record.product {
                ProductType::LlmTokens | ProductType::EmbeddingTokens => 1e6,
                ProductType::RerankerSearches => 1e3,
                _ => 1.0,
            };
            let amount_units = record.amount / native_per_unit;

            // Free tier: ellm-owned models burn quota headroom before
            // dollars. Covered fraction costs nothing.
            let mut cost = record.full_cost;
            if mode == DeploymentMode::Cloud && record.is_ellm {
                if let Ok(org) = store.get_org(&organization_id).await {
                    let headroom = org.quotas.headroom(record.product);
                    if headroom > 0.0 {
                        let covered = amount_units.min(headroom);
                        cost *= 1.0 - covered / amount_units.max(f64::MIN_POSITIVE);
                    }
                }
            }
            if mode == DeploymentMode::Oss {
                cost = 0.0;
            }

            if let Err(e) = store
                .add_usage(&organization_id, record.product, amount_units)
                .await
            {
                warn!(error = %e, "failed to bump usage counter");
            }
            if cost > 0.0 {
                if let Err(e) = store.consume_credit(&organization_id, cost).await {
                    warn!(error = %e, "failed to consume credit");
                }
            }
            total_cost += cost;

            match record.product {
                ProductType::LlmTokens => BillingMetrics::record_llm_tokens(
                    &organization_id,
                    &record.model_id,
                    record.amount as u64,
                ),
                ProductType::EmbeddingTokens => BillingMetrics::record_embedding_tokens(
                    &organization_id,
                    &record.model_id,
                    record.amount as u64,
                ),
                ProductType::RerankerSearches => BillingMetrics::record_rerank_searches(
                    &organization_id,
                    &record.model_id,
                    record.amount as u64,
                ),
                _ => {}
            }

            let mut event =
                UsageData::new(&organization_id, &project_id, record.product, record.amount);
            event.model_id = Some(record.model_id);
            event.cost_usd = cost;
            buffer.push(event).await;
        }

        if egress_gib > 0.0 {
            if let Err(e) = store
                .add_usage(&organization_id, ProductType::Egress, egress_gib)
                .await
            {
                warn!(error = %e, "failed to bump egress counter");
            }
            BillingMetrics::record_egress_bytes(
                &organization_id,
                (egress_gib * 1024.0 * 1024.0 * 1024.0) as u64,
            );
            buffer
                .push(UsageData::new(
                    &organization_id,
                    &project_id,
                    ProductType::Egress,
                    egress_gib,
                ))
                .await;
        }

        for (product, gib) in values {
            if let Err(e) = store.set_usage(&organization_id, product, gib).await {
                warn!(error = %e, "failed to snapshot storage usage");
            }
            buffer
                .push(UsageData::new(
                    &organization_id,
                    &project_id,
                    product,
                    gib,
                ))
                .await;
        }

        if total_cost > 0.0 {
            BillingMetrics::record_spent(&organization_id, total_cost);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingSink;
    use jamai_llm::registry::{Capability, ModelType};

    fn model(id: &str, owned_by: &str) -> ModelConfig {
        ModelConfig {
            id: id.to_string(),
            name: format!("{id} (display)"),
            owned_by: owned_by.to_string(),
            model_type: ModelType::Llm,
            capabilities: vec![Capability::Chat],
            context_length: 8192,
            languages: Vec::new(),
            embedding_size: None,
            embedding_dimensions: None,
            llm_input_cost_per_mtoken: 1.0,
            llm_output_cost_per_mtoken: 2.0,
            embedding_cost_per_mtoken: 0.1,
            reranking_cost_per_ksearch: 2.0,
            allowed_orgs: Vec::new(),
            blocked_orgs: Vec::new(),
            timeout_secs: 60,
            priority: 0,
        }
    }

    fn manager(store: Arc<OrgStore>, mode: DeploymentMode) -> BillingManager {
        let buffer = Arc::new(EventBuffer::new(1000, Arc::new(TracingSink)));
        BillingManager::new(store, buffer, mode, "org-1", "proj-1")
    }

    #[tokio::test]
    async fn test_gate_rejects_broke_org_on_external_model() {
        let store = Arc::new(OrgStore::new());
        store
            .create_org(Organization::new("org-1", "Acme"))
            .await
            .unwrap();
        let m = manager(store, DeploymentMode::Cloud);

        let err = m
            .check_quota(&model("openai/gpt-4o", "openai"), ProductType::LlmTokens)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientCredits(_)));
        // Message names the display name for the UI.
        assert!(err.to_string().contains("display"));
    }

    #[tokio::test]
    async fn test_gate_passes_with_credit_or_grant() {
        let store = Arc::new(OrgStore::new());
        let mut org = Organization::new("org-1", "Acme");
        org.credit_grant = 0.5;
        store.create_org(org).await.unwrap();
        let m = manager(store, DeploymentMode::Cloud);
        m.check_quota(&model("openai/gpt-4o", "openai"), ProductType::LlmTokens)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_gate_passes_with_external_key() {
        let store = Arc::new(OrgStore::new());
        let mut org = Organization::new("org-1", "Acme");
        org.external_keys
            .insert("openai".to_string(), "sk-org".to_string());
        store.create_org(org).await.unwrap();
        let m = manager(store, DeploymentMode::Cloud);
        m.check_quota(&model("openai/gpt-4o", "openai"), ProductType::LlmTokens)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_gate_passes_for_ellm_with_headroom() {
        let store = Arc::new(OrgStore::new());
        let mut org = Organization::new("org-1", "Acme");
        org.quotas.llm_tokens_quota_mtok = 1.0;
        store.create_org(org).await.unwrap();
        let m = manager(store.clone(), DeploymentMode::Cloud);
        m.check_quota(&model("ellm/describe", "ellm"), ProductType::LlmTokens)
            .await
            .unwrap();

        // Same org, non-ellm model: rejected.
        let err = m
            .check_quota(&model("openai/gpt-4o", "openai"), ProductType::LlmTokens)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientCredits(_)));
    }

    #[tokio::test]
    async fn test_gate_always_passes_in_oss() {
        let store = Arc::new(OrgStore::new());
        store
            .create_org(Organization::new("org-1", "Acme"))
            .await
            .unwrap();
        let m = manager(store, DeploymentMode::Oss);
        m.check_quota(&model("openai/gpt-4o", "openai"), ProductType::LlmTokens)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_process_all_charges_grant_before_credit() {
        let store = Arc::new(OrgStore::new());
        let mut org = Organization::new("org-1", "Acme");
        org.credit = 10.0;
        org.credit_grant = 1.0;
        store.create_org(org).await.unwrap();

        let mut m = manager(store.clone(), DeploymentMode::Cloud);
        // 1M prompt + 1M completion at $1/$2 per mtok = $3
        m.record_llm_usage(&model("openai/gpt-4o", "openai"), 1_000_000, 1_000_000);
        m.process_all().await;

        let org = store.get_org("org-1").await.unwrap();
        assert!((org.credit_grant - 0.0).abs() < 1e-9);
        assert!((org.credit - 8.0).abs() < 1e-9);
        assert!((org.quotas.llm_tokens_usage_mtok - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_process_all_free_tier_tokens_before_dollars() {
        let store = Arc::new(OrgStore::new());
        let mut org = Organization::new("org-1", "Acme");
        org.credit = 10.0;
        org.quotas.llm_tokens_quota_mtok = 1.0;
        store.create_org(org).await.unwrap();

        let mut m = manager(store.clone(), DeploymentMode::Cloud);
        // 2 mtok total on an ellm model; 1 mtok covered by quota, so only
        // half the cost (0.5 * $3 = $1.50) hits the balance.
        m.record_llm_usage(&model("ellm/describe", "ellm"), 1_000_000, 1_000_000);
        m.process_all().await;

        let org = store.get_org("org-1").await.unwrap();
        assert!((org.credit - 8.5).abs() < 1e-9);
        assert!((org.quotas.llm_tokens_usage_mtok - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_storage_snapshots_overwrite_usage() {
        let store = Arc::new(OrgStore::new());
        store
            .create_org(Organization::new("org-1", "Acme"))
            .await
            .unwrap();

        let mut m = manager(store.clone(), DeploymentMode::Cloud);
        m.set_storage_usage(ProductType::DbStorage, 1.5);
        m.set_storage_usage(ProductType::FileStorage, 0.25);
        m.process_all().await;

        let org = store.get_org("org-1").await.unwrap();
        assert!((org.quotas.db_usage_gib - 1.5).abs() < 1e-9);
        assert!((org.quotas.file_usage_gib - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_oss_mode_charges_nothing() {
        let store = Arc::new(OrgStore::new());
        let mut org = Organization::new("org-1", "Acme");
        org.credit = 5.0;
        store.create_org(org).await.unwrap();

        let mut m = manager(store.clone(), DeploymentMode::Oss);
        m.record_llm_usage(&model("openai/gpt-4o", "openai"), 1_000_000, 0);
        m.process_all().await;

        let org = store.get_org("org-1").await.unwrap();
        assert!((org.credit - 5.0).abs() < 1e-9);
        // Usage is still tracked for analytics.
        assert!((org.quotas.llm_tokens_usage_mtok - 1.0).abs() < 1e-9);
    }
}
