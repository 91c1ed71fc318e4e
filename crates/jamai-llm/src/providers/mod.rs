//! Provider adapters
//!
//! Each adapter translates the canonical chat/embedding/rerank types to one
//! vendor wire format and back, in unary and streaming modes. Adapters never
//! retry; retries and cooldowns belong to the router.

use crate::error::Result;
use crate::registry::Deployment;
use crate::types::{
    ChatChunk, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, RerankRequest,
    RerankResponse,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

pub mod anthropic;
pub mod cohere;
pub mod gemini;
mod http;
pub mod ollama;
pub mod openai;

pub use http::{map_status_error, ndjson_lines, sse_data_lines};

/// A boxed stream of chat chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>;

/// The wire format a deployment speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// api.openai.com
    Openai,
    /// api.anthropic.com
    Anthropic,
    /// generativelanguage.googleapis.com
    Gemini,
    /// api.cohere.com
    Cohere,
    /// Azure OpenAI (`api-key` header auth)
    Azure,
    /// vLLM server (OpenAI-compatible)
    Vllm,
    /// Local Ollama daemon
    Ollama,
    /// Infinity embedding/rerank server (OpenAI-compatible)
    Infinity,
    /// First-party serving cluster (OpenAI-compatible)
    Ellm,
    /// Any other OpenAI-compatible endpoint
    Custom,
}

impl Provider {
    /// Stable lowercase name, matching the serde representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Cohere => "cohere",
            Self::Azure => "azure",
            Self::Vllm => "vllm",
            Self::Ollama => "ollama",
            Self::Infinity => "infinity",
            Self::Ellm => "ellm",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for provider adapters
///
/// Implementations are stateless apart from the HTTP client; the deployment
/// carries the endpoint and the provider-native model name, and the API key
/// is resolved per call (org external keys override process keys).
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Adapter name (for logging)
    fn name(&self) -> &'static str;

    /// Unary chat completion
    async fn chat(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> Result<ChatResponse>;

    /// Streaming chat completion
    async fn chat_stream(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> Result<ChunkStream>;

    /// Embedding
    async fn embed(
        &self,
        request: &EmbeddingRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> Result<EmbeddingResponse>;

    /// Reranking; results must come back sorted by relevance descending
    async fn rerank(
        &self,
        request: &RerankRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> Result<RerankResponse>;
}

/// The adapter for each provider tag
pub struct AdapterSet {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl AdapterSet {
    /// Build the default adapter set. OpenAI-compatible providers share the
    /// OpenAI codec; Azure swaps the auth header.
    #[must_use]
    pub fn with_defaults() -> Self {
        let openai: Arc<dyn ProviderAdapter> =
            Arc::new(openai::OpenAiAdapter::new(openai::AuthStyle::Bearer));
        let azure: Arc<dyn ProviderAdapter> =
            Arc::new(openai::OpenAiAdapter::new(openai::AuthStyle::ApiKeyHeader));
        let mut adapters: HashMap<Provider, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Provider::Openai, openai.clone());
        adapters.insert(Provider::Vllm, openai.clone());
        adapters.insert(Provider::Infinity, openai.clone());
        adapters.insert(Provider::Ellm, openai.clone());
        adapters.insert(Provider::Custom, openai);
        adapters.insert(Provider::Azure, azure);
        adapters.insert(Provider::Anthropic, Arc::new(anthropic::AnthropicAdapter::new()));
        adapters.insert(Provider::Gemini, Arc::new(gemini::GeminiAdapter::new()));
        adapters.insert(Provider::Cohere, Arc::new(cohere::CohereAdapter::new()));
        adapters.insert(Provider::Ollama, Arc::new(ollama::OllamaAdapter::new()));
        Self { adapters }
    }

    /// An empty set (tests insert their own adapters).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register or replace the adapter for a provider.
    pub fn insert(&mut self, provider: Provider, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(provider, adapter);
    }

    /// Look up the adapter for a provider.
    #[must_use]
    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider).cloned()
    }
}

impl Default for AdapterSet {
    fn default() -> Self {
        Self::with_defaults()
    }
}
