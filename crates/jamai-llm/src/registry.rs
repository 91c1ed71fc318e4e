//! Model Registry
//!
//! Authoritative store of model configs and their deployments. Resolves an
//! abstract model ID to the set of deployments the router may call, applying
//! org allow/block lists and activeness (at least one deployment outside its
//! cooldown window).

use crate::error::{Error, Result};
use crate::providers::Provider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// What a model fundamentally is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Chat / instruction model
    Llm,
    /// Embedding model
    Embed,
    /// Reranking model
    Rerank,
    /// Legacy text completion model
    Completion,
}

/// A capability a model exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Chat completion
    Chat,
    /// Function calling
    Tool,
    /// Image input
    Image,
    /// Audio input
    Audio,
    /// Text embedding
    Embed,
    /// Document reranking
    Rerank,
    /// Reasoning traces
    Reasoning,
}

/// Configuration of an abstract model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model ID in the form `provider/name`
    pub id: String,
    /// Display name for browser clients
    #[serde(default)]
    pub name: String,
    /// Owner; `"ellm"` marks first-party models eligible for free-tier quota
    #[serde(default)]
    pub owned_by: String,
    /// Model type
    #[serde(rename = "type")]
    pub model_type: ModelType,
    /// Exposed capabilities
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Context window in tokens
    pub context_length: u32,
    /// ISO language codes
    #[serde(default)]
    pub languages: Vec<String>,
    /// Native embedding dimension
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_size: Option<u32>,
    /// Matryoshka-truncated dimension, when smaller than `embedding_size`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dimensions: Option<u32>,
    /// USD per 1M input tokens
    #[serde(default)]
    pub llm_input_cost_per_mtoken: f64,
    /// USD per 1M output tokens
    #[serde(default)]
    pub llm_output_cost_per_mtoken: f64,
    /// USD per 1M embedded tokens
    #[serde(default)]
    pub embedding_cost_per_mtoken: f64,
    /// USD per 1k rerank searches
    #[serde(default)]
    pub reranking_cost_per_ksearch: f64,
    /// Orgs allowed to use this model; empty means everyone
    #[serde(default)]
    pub allowed_orgs: Vec<String>,
    /// Orgs blocked from this model, applied after the allow list
    #[serde(default)]
    pub blocked_orgs: Vec<String>,
    /// Per-call timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Tie-break priority for default-model selection (higher wins)
    #[serde(default)]
    pub priority: i32,
}

fn default_timeout_secs() -> u64 {
    60
}

impl ModelConfig {
    /// The `provider` half of the ID, or empty string when malformed.
    #[must_use]
    pub fn provider_prefix(&self) -> &str {
        self.id.split('/').next().unwrap_or("")
    }

    /// Whether the model is owned by the platform (free-tier eligible).
    #[must_use]
    pub fn is_ellm(&self) -> bool {
        self.owned_by == "ellm"
    }

    /// Whether the model exposes every capability in `required`.
    #[must_use]
    pub fn has_capabilities(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    /// Display name for user-facing error messages, falling back to the ID.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Effective embedding dimension (`embedding_dimensions` wins).
    #[must_use]
    pub fn effective_embedding_dim(&self) -> Option<u32> {
        self.embedding_dimensions.or(self.embedding_size)
    }

    fn validate(&self) -> Result<()> {
        let mut parts = self.id.splitn(2, '/');
        let provider = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");
        if provider.is_empty() || rest.is_empty() {
            return Err(Error::BadInput(format!(
                "model id must have the form provider/name: {}",
                self.id
            )));
        }
        if self.owned_by == "ellm" && provider != "ellm" {
            return Err(Error::BadInput(format!(
                "ellm-owned model id must start with 'ellm/': {}",
                self.id
            )));
        }
        if self.model_type == ModelType::Embed
            && self.embedding_size.is_none()
            && self.embedding_dimensions.is_none()
        {
            return Err(Error::BadInput(format!(
                "embedding model must declare embedding_size or embedding_dimensions: {}",
                self.id
            )));
        }
        Ok(())
    }
}

/// A concrete endpoint serving a model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Deployment ID
    pub id: String,
    /// The abstract model this deployment serves
    pub model_id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Which adapter speaks to this endpoint
    pub provider: Provider,
    /// Provider-native model name sent on the wire
    pub routing_id: String,
    /// Endpoint base URL; empty uses the provider default
    #[serde(default)]
    pub api_base: String,
    /// Sampling weight; zero is picked only as a last resort
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Excluded from routing until this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

fn default_weight() -> f64 {
    1.0
}

impl Deployment {
    /// Create a deployment with a generated ID.
    #[must_use]
    pub fn new(
        model_id: impl Into<String>,
        provider: Provider,
        routing_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            model_id: model_id.into(),
            name: String::new(),
            provider,
            routing_id: routing_id.into(),
            api_base: String::new(),
            weight: 1.0,
            cooldown_until: None,
            created_at: Utc::now(),
        }
    }

    /// Set the endpoint base URL.
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Set the sampling weight.
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Whether the deployment may be routed to right now.
    #[must_use]
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map_or(true, |until| until <= now)
    }
}

#[derive(Default)]
struct Inner {
    models: HashMap<String, ModelConfig>,
    // keyed by model_id, insertion-ordered per model
    deployments: HashMap<String, Vec<Deployment>>,
}

/// Thread-safe registry of models and deployments
#[derive(Default)]
pub struct ModelRegistry {
    inner: RwLock<Inner>,
}

impl ModelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a model config. Validates ID shape, the `ellm/`
    /// prefix rule and embedding dimension requirements.
    pub async fn upsert_model(&self, model: ModelConfig) -> Result<()> {
        model.validate()?;
        debug!(model_id = %model.id, "registering model");
        let mut inner = self.inner.write().await;
        inner.deployments.entry(model.id.clone()).or_default();
        inner.models.insert(model.id.clone(), model);
        Ok(())
    }

    /// Remove a model and its deployments.
    pub async fn remove_model(&self, model_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .models
            .remove(model_id)
            .ok_or_else(|| Error::ResourceNotFound(format!("model {model_id}")))?;
        inner.deployments.remove(model_id);
        Ok(())
    }

    /// Register a deployment for an existing model.
    pub async fn add_deployment(&self, deployment: Deployment) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.models.contains_key(&deployment.model_id) {
            return Err(Error::ResourceNotFound(format!(
                "model {}",
                deployment.model_id
            )));
        }
        inner
            .deployments
            .entry(deployment.model_id.clone())
            .or_default()
            .push(deployment);
        Ok(())
    }

    /// Remove a deployment by ID.
    pub async fn remove_deployment(&self, model_id: &str, deployment_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let deployments = inner
            .deployments
            .get_mut(model_id)
            .ok_or_else(|| Error::ResourceNotFound(format!("model {model_id}")))?;
        let before = deployments.len();
        deployments.retain(|d| d.id != deployment_id);
        if deployments.len() == before {
            return Err(Error::ResourceNotFound(format!(
                "deployment {deployment_id}"
            )));
        }
        Ok(())
    }

    /// All deployments of a model, including cooled-down ones.
    pub async fn deployments_of(&self, model_id: &str) -> Vec<Deployment> {
        self.inner
            .read()
            .await
            .deployments
            .get(model_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Put a deployment on cooldown until `until`.
    pub async fn set_cooldown(&self, model_id: &str, deployment_id: &str, until: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        if let Some(deployments) = inner.deployments.get_mut(model_id) {
            if let Some(d) = deployments.iter_mut().find(|d| d.id == deployment_id) {
                debug!(model_id, deployment_id, %until, "deployment cooldown");
                d.cooldown_until = Some(until);
            }
        }
    }

    /// Get a model without org filtering (admin surface).
    pub async fn get_model_unchecked(&self, model_id: &str) -> Result<ModelConfig> {
        self.inner
            .read()
            .await
            .models
            .get(model_id)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound(format!("model {model_id}")))
    }

    /// Get a model for an org: must exist, pass the allow/block lists and be
    /// active (at least one deployment outside its cooldown window).
    pub async fn get_model(&self, organization_id: &str, model_id: &str) -> Result<ModelConfig> {
        let inner = self.inner.read().await;
        let model = inner
            .models
            .get(model_id)
            .ok_or_else(|| Error::ResourceNotFound(format!("model {model_id}")))?;
        if !org_may_use(model, organization_id) {
            return Err(Error::ResourceNotFound(format!("model {model_id}")));
        }
        let now = Utc::now();
        let active = inner
            .deployments
            .get(model_id)
            .is_some_and(|ds| ds.iter().any(|d| d.is_available(now)));
        if !active {
            return Err(Error::NoAvailableDeployment(model_id.to_string()));
        }
        Ok(model.clone())
    }

    /// Every registered model, regardless of org or activeness (admin
    /// surface).
    pub async fn list_all_models(&self) -> Vec<ModelConfig> {
        let inner = self.inner.read().await;
        let mut models: Vec<ModelConfig> = inner.models.values().cloned().collect();
        models.sort_by(default_model_order);
        models
    }

    /// List models eligible for an org, optionally filtered by type and
    /// required capabilities. Sorted by the default-model ordering.
    pub async fn list_models(
        &self,
        organization_id: &str,
        model_type: Option<ModelType>,
        capabilities: &[Capability],
    ) -> Vec<ModelConfig> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        let mut models: Vec<ModelConfig> = inner
            .models
            .values()
            .filter(|m| model_type.is_none_or(|t| m.model_type == t))
            .filter(|m| m.has_capabilities(capabilities))
            .filter(|m| org_may_use(m, organization_id))
            .filter(|m| {
                inner
                    .deployments
                    .get(&m.id)
                    .is_some_and(|ds| ds.iter().any(|d| d.is_available(now)))
            })
            .cloned()
            .collect();
        models.sort_by(default_model_order);
        models
    }

    /// Resolve a possibly-empty model ID: empty picks the default model
    /// exposing `capabilities`, ordered ellm-first, then priority descending,
    /// then name ascending.
    pub async fn resolve_model(
        &self,
        organization_id: &str,
        model_id: &str,
        model_type: ModelType,
        capabilities: &[Capability],
    ) -> Result<ModelConfig> {
        if !model_id.is_empty() {
            return self.get_model(organization_id, model_id).await;
        }
        self.list_models(organization_id, Some(model_type), capabilities)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::ResourceNotFound(format!(
                    "no {model_type:?} model available for organization {organization_id}"
                ))
            })
    }
}

fn org_may_use(model: &ModelConfig, organization_id: &str) -> bool {
    if !model.allowed_orgs.is_empty()
        && !model.allowed_orgs.iter().any(|o| o == organization_id)
    {
        return false;
    }
    !model.blocked_orgs.iter().any(|o| o == organization_id)
}

fn default_model_order(a: &ModelConfig, b: &ModelConfig) -> std::cmp::Ordering {
    b.is_ellm()
        .cmp(&a.is_ellm())
        .then(b.priority.cmp(&a.priority))
        .then(a.id.cmp(&b.id))
}
