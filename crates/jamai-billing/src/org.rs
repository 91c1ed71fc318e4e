//! Organizations, projects and the in-process org store
//!
//! The SQL org database is an external collaborator; this store is the
//! in-process authoritative view the gateway operates on. Credit and usage
//! mutations happen under the store's write lock so concurrent requests see
//! atomic counter updates.

use crate::error::{Error, Result};
use crate::events::ProductType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Per-product quota and usage counters, in each product's native unit
/// (million tokens, thousand searches, GiB).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotasAndUsages {
    /// LLM token quota (million tokens)
    pub llm_tokens_quota_mtok: f64,
    /// LLM token usage (million tokens)
    pub llm_tokens_usage_mtok: f64,
    /// Embedding token quota (million tokens)
    pub embedding_tokens_quota_mtok: f64,
    /// Embedding token usage (million tokens)
    pub embedding_tokens_usage_mtok: f64,
    /// Reranker quota (thousand searches)
    pub reranker_quota_ksearch: f64,
    /// Reranker usage (thousand searches)
    pub reranker_usage_ksearch: f64,
    /// Egress quota (GiB)
    pub egress_quota_gib: f64,
    /// Egress usage (GiB)
    pub egress_usage_gib: f64,
    /// Database storage quota (GiB)
    pub db_quota_gib: f64,
    /// Database storage usage (GiB)
    pub db_usage_gib: f64,
    /// File storage quota (GiB)
    pub file_quota_gib: f64,
    /// File storage usage (GiB)
    pub file_usage_gib: f64,
}

impl QuotasAndUsages {
    /// Quota for a product.
    #[must_use]
    pub fn quota(&self, product: ProductType) -> f64 {
        match product {
            ProductType::LlmTokens => self.llm_tokens_quota_mtok,
            ProductType::EmbeddingTokens => self.embedding_tokens_quota_mtok,
            ProductType::RerankerSearches => self.reranker_quota_ksearch,
            ProductType::Egress => self.egress_quota_gib,
            ProductType::DbStorage => self.db_quota_gib,
            ProductType::FileStorage => self.file_quota_gib,
        }
    }

    /// Usage for a product.
    #[must_use]
    pub fn usage(&self, product: ProductType) -> f64 {
        match product {
            ProductType::LlmTokens => self.llm_tokens_usage_mtok,
            ProductType::EmbeddingTokens => self.embedding_tokens_usage_mtok,
            ProductType::RerankerSearches => self.reranker_usage_ksearch,
            ProductType::Egress => self.egress_usage_gib,
            ProductType::DbStorage => self.db_usage_gib,
            ProductType::FileStorage => self.file_usage_gib,
        }
    }

    /// Remaining free-tier headroom for a product, never negative.
    #[must_use]
    pub fn headroom(&self, product: ProductType) -> f64 {
        (self.quota(product) - self.usage(product)).max(0.0)
    }

    fn usage_mut(&mut self, product: ProductType) -> &mut f64 {
        match product {
            ProductType::LlmTokens => &mut self.llm_tokens_usage_mtok,
            ProductType::EmbeddingTokens => &mut self.embedding_tokens_usage_mtok,
            ProductType::RerankerSearches => &mut self.reranker_usage_ksearch,
            ProductType::Egress => &mut self.egress_usage_gib,
            ProductType::DbStorage => &mut self.db_usage_gib,
            ProductType::FileStorage => &mut self.file_usage_gib,
        }
    }

    /// Add to a usage counter. Usage is monotonically non-decreasing within
    /// a billing period, so negative deltas are clamped away.
    pub fn add_usage(&mut self, product: ProductType, delta: f64) {
        *self.usage_mut(product) += delta.max(0.0);
    }

    /// Overwrite a usage counter with a snapshot value (storage products).
    pub fn set_usage(&mut self, product: ProductType, value: f64) {
        *self.usage_mut(product) = value;
    }

    /// Zero all usage counters (billing cycle reset).
    pub fn reset(&mut self) {
        for product in ProductType::ALL {
            *self.usage_mut(product) = 0.0;
        }
    }
}

/// An organization: the billing and quota boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    /// Organization ID
    pub id: String,
    /// Display name
    pub name: String,
    /// Billing currency code
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Owner user ID
    #[serde(default)]
    pub owner: String,
    /// Price plan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_plan_id: Option<String>,
    /// Purchased balance (USD); consumed after `credit_grant`
    #[serde(default)]
    pub credit: f64,
    /// Granted balance (USD); consumed first, does not carry forward
    #[serde(default)]
    pub credit_grant: f64,
    /// Per-product quota and usage counters
    #[serde(default)]
    pub quotas: QuotasAndUsages,
    /// Org-supplied provider API keys; never serialized back to clients
    #[serde(default, skip_serializing)]
    pub external_keys: HashMap<String, String>,
    /// When the usage counters next reset
    pub quota_reset_at: DateTime<Utc>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

fn default_currency() -> String {
    "usd".to_string()
}

impl Organization {
    /// Create an organization with zero balances.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            currency: default_currency(),
            owner: String::new(),
            price_plan_id: None,
            credit: 0.0,
            credit_grant: 0.0,
            quotas: QuotasAndUsages::default(),
            external_keys: HashMap::new(),
            quota_reset_at: now + chrono::Duration::days(30),
            created_at: now,
        }
    }

    /// Total spendable balance.
    #[must_use]
    pub fn spendable(&self) -> f64 {
        self.credit + self.credit_grant
    }
}

/// A project inside an organization; owns its tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Project ID
    pub id: String,
    /// Owning organization
    pub organization_id: String,
    /// Display name
    pub name: String,
    /// Owner user ID
    #[serde(default)]
    pub owner: String,
    /// Creator user ID
    #[serde(default)]
    pub created_by: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Create a project with a generated ID.
    #[must_use]
    pub fn new(organization_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("proj_{}", Uuid::now_v7().simple()),
            organization_id: organization_id.into(),
            name: name.into(),
            owner: String::new(),
            created_by: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Default)]
struct Inner {
    orgs: HashMap<String, Organization>,
    projects: HashMap<String, Project>,
    // api key -> org id
    api_keys: HashMap<String, String>,
}

/// Thread-safe store of organizations, projects and API keys
#[derive(Default)]
pub struct OrgStore {
    inner: RwLock<Inner>,
}

impl OrgStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an organization; fails when the ID is taken.
    pub async fn create_org(&self, org: Organization) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.orgs.contains_key(&org.id) {
            return Err(Error::BadInput(format!("organization {} exists", org.id)));
        }
        inner.orgs.insert(org.id.clone(), org);
        Ok(())
    }

    /// Fetch an organization snapshot.
    pub async fn get_org(&self, id: &str) -> Result<Organization> {
        self.inner
            .read()
            .await
            .orgs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::OrgNotFound(id.to_string()))
    }

    /// Mutate an organization under the write lock.
    pub async fn update_org<F>(&self, id: &str, f: F) -> Result<Organization>
    where
        F: FnOnce(&mut Organization),
    {
        let mut inner = self.inner.write().await;
        let org = inner
            .orgs
            .get_mut(id)
            .ok_or_else(|| Error::OrgNotFound(id.to_string()))?;
        f(org);
        Ok(org.clone())
    }

    /// Delete an organization, cascading to its projects and API keys.
    pub async fn delete_org(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .orgs
            .remove(id)
            .ok_or_else(|| Error::OrgNotFound(id.to_string()))?;
        inner.projects.retain(|_, p| p.organization_id != id);
        inner.api_keys.retain(|_, org_id| org_id != id);
        Ok(())
    }

    /// Insert a project; the organization must exist.
    pub async fn create_project(&self, project: Project) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.orgs.contains_key(&project.organization_id) {
            return Err(Error::OrgNotFound(project.organization_id.clone()));
        }
        inner.projects.insert(project.id.clone(), project);
        Ok(())
    }

    /// Fetch a project snapshot.
    pub async fn get_project(&self, id: &str) -> Result<Project> {
        self.inner
            .read()
            .await
            .projects
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ProjectNotFound(id.to_string()))
    }

    /// List an organization's projects.
    pub async fn list_projects(&self, organization_id: &str) -> Vec<Project> {
        let mut projects: Vec<Project> = self
            .inner
            .read()
            .await
            .projects
            .values()
            .filter(|p| p.organization_id == organization_id)
            .cloned()
            .collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        projects
    }

    /// Mint an API key for an organization.
    pub async fn create_api_key(&self, organization_id: &str) -> Result<String> {
        let mut inner = self.inner.write().await;
        if !inner.orgs.contains_key(organization_id) {
            return Err(Error::OrgNotFound(organization_id.to_string()));
        }
        let key = format!("jamai_sk_{}", Uuid::new_v4().simple());
        inner
            .api_keys
            .insert(key.clone(), organization_id.to_string());
        Ok(key)
    }

    /// Resolve an API key to its organization ID.
    pub async fn resolve_api_key(&self, key: &str) -> Option<String> {
        self.inner.read().await.api_keys.get(key).cloned()
    }

    /// Consume spendable balance: `credit_grant` first, then `credit`.
    /// The final event of a request may push `credit` negative.
    pub async fn consume_credit(&self, organization_id: &str, amount: f64) -> Result<()> {
        if amount <= 0.0 {
            return Ok(());
        }
        let mut inner = self.inner.write().await;
        let org = inner
            .orgs
            .get_mut(organization_id)
            .ok_or_else(|| Error::OrgNotFound(organization_id.to_string()))?;
        let from_grant = amount.min(org.credit_grant.max(0.0));
        org.credit_grant -= from_grant;
        org.credit -= amount - from_grant;
        Ok(())
    }

    /// Add to a usage counter (single atomic statement semantics).
    pub async fn add_usage(
        &self,
        organization_id: &str,
        product: ProductType,
        delta: f64,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let org = inner
            .orgs
            .get_mut(organization_id)
            .ok_or_else(|| Error::OrgNotFound(organization_id.to_string()))?;
        org.quotas.add_usage(product, delta);
        Ok(())
    }

    /// Overwrite a usage counter with a snapshot value.
    pub async fn set_usage(
        &self,
        organization_id: &str,
        product: ProductType,
        value: f64,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let org = inner
            .orgs
            .get_mut(organization_id)
            .ok_or_else(|| Error::OrgNotFound(organization_id.to_string()))?;
        org.quotas.set_usage(product, value);
        Ok(())
    }

    /// Reset usage counters atomically and roll `quota_reset_at` forward one
    /// billing cycle. `credit_grant` does not carry forward.
    pub async fn reset_quota(&self, organization_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let org = inner
            .orgs
            .get_mut(organization_id)
            .ok_or_else(|| Error::OrgNotFound(organization_id.to_string()))?;
        org.quotas.reset();
        org.credit_grant = 0.0;
        org.quota_reset_at = Utc::now() + chrono::Duration::days(30);
        Ok(())
    }
}
