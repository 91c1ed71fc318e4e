//! Deployment router
//!
//! Turns an abstract model ID into a concrete provider call: weighted random
//! pick across the model's deployments, cooldown on transient failure,
//! retries across the remaining candidates within the model's timeout
//! budget. Streaming calls are retried only while no chunk has been emitted;
//! after that, a mid-stream failure is forwarded as a final `[ERROR]` chunk.

use crate::error::{Error, Result};
use crate::providers::{AdapterSet, ChunkStream, Provider};
use crate::registry::{Deployment, ModelConfig, ModelRegistry};
use crate::token;
use crate::types::{
    ChatChunk, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, FinishReason,
    RerankRequest, RerankResponse,
};
use chrono::Utc;
use futures::StreamExt;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Default base for the exponential cooldown backoff
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Per-call routing context
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    /// Calling organization
    pub organization_id: String,
    /// Org-supplied provider keys; override the process keys
    pub external_keys: HashMap<String, String>,
}

impl RouteOptions {
    /// Context for an organization with no external keys.
    #[must_use]
    pub fn for_org(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            external_keys: HashMap::new(),
        }
    }
}

/// The deployment router
pub struct ModelRouter {
    registry: Arc<ModelRegistry>,
    adapters: AdapterSet,
    process_keys: HashMap<Provider, String>,
    backoff_base: Duration,
}

impl ModelRouter {
    /// Create a router over a registry with the given adapters.
    #[must_use]
    pub fn new(registry: Arc<ModelRegistry>, adapters: AdapterSet) -> Self {
        Self {
            registry,
            adapters,
            process_keys: HashMap::new(),
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    /// Set the process-level API key for a provider.
    #[must_use]
    pub fn with_process_key(mut self, provider: Provider, key: impl Into<String>) -> Self {
        self.process_keys.insert(provider, key.into());
        self
    }

    /// Override the cooldown backoff base (tests use a tiny one).
    #[must_use]
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// The registry this router reads from.
    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    fn api_key(&self, deployment: &Deployment, opts: &RouteOptions) -> String {
        opts.external_keys
            .get(deployment.provider.as_str())
            .or_else(|| self.process_keys.get(&deployment.provider))
            .cloned()
            .unwrap_or_default()
    }

    /// Cooldown duration for the given retry attempt:
    /// `backoff_base * 2^attempt` with +-20% jitter.
    fn cooldown_after(&self, attempt: u32) -> Duration {
        let base = self.backoff_base.as_secs_f64() * f64::from(2_u32.saturating_pow(attempt));
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_secs_f64(base * jitter)
    }

    /// Candidate deployments in weighted random order. Zero-weight
    /// deployments go last, so they are picked only when nothing else
    /// remains.
    async fn candidates(&self, model_id: &str) -> Vec<Deployment> {
        let now = Utc::now();
        let mut available: Vec<Deployment> = self
            .registry
            .deployments_of(model_id)
            .await
            .into_iter()
            .filter(|d| d.is_available(now))
            .collect();

        let mut rng = rand::thread_rng();
        let mut ordered = Vec::with_capacity(available.len());
        // Weighted sampling without replacement over positive weights.
        loop {
            let total: f64 = available.iter().map(|d| d.weight.max(0.0)).sum();
            if total <= 0.0 {
                break;
            }
            let mut pick = rng.gen_range(0.0..total);
            let mut chosen = available.len() - 1;
            for (i, d) in available.iter().enumerate() {
                let w = d.weight.max(0.0);
                if w <= 0.0 {
                    continue;
                }
                if pick < w {
                    chosen = i;
                    break;
                }
                pick -= w;
            }
            ordered.push(available.swap_remove(chosen));
        }
        // Whatever is left has weight zero: last-resort candidates.
        ordered.extend(available);
        ordered
    }

    async fn cool_down(&self, deployment: &Deployment, attempt: u32) {
        let until = Utc::now()
            + chrono::Duration::from_std(self.cooldown_after(attempt))
                .unwrap_or_else(|_| chrono::Duration::seconds(5));
        self.registry
            .set_cooldown(&deployment.model_id, &deployment.id, until)
            .await;
    }

    fn check_context(model: &ModelConfig, request: &ChatRequest) -> Result<()> {
        let prompt_tokens = token::count_message_tokens(&request.messages) as u32;
        if prompt_tokens > model.context_length {
            return Err(Error::ContextOverflow(format!(
                "prompt is {} tokens but model {} accepts at most {}",
                prompt_tokens, model.id, model.context_length
            )));
        }
        Ok(())
    }

    /// Unary chat completion with retry across deployments.
    #[instrument(skip(self, request), fields(model = %request.model, org = %opts.organization_id))]
    pub async fn chat(&self, opts: &RouteOptions, request: &ChatRequest) -> Result<ChatResponse> {
        let model = self
            .registry
            .get_model(&opts.organization_id, &request.model)
            .await?;
        Self::check_context(&model, request)?;

        let deadline = Instant::now() + Duration::from_secs(model.timeout_secs);
        let candidates = self.candidates(&model.id).await;
        if candidates.is_empty() {
            return Err(Error::NoAvailableDeployment(model.id.clone()));
        }

        let mut last_err = None;
        for (attempt, deployment) in candidates.iter().enumerate() {
            let Some(adapter) = self.adapters.get(deployment.provider) else {
                warn!(provider = %deployment.provider, "no adapter registered");
                continue;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                last_err = Some(Error::ProviderUnavailable(format!(
                    "timeout after {}s",
                    model.timeout_secs
                )));
                break;
            }
            let key = self.api_key(deployment, opts);
            match tokio::time::timeout(remaining, adapter.chat(request, deployment, &key)).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) if e.is_retryable() => {
                    debug!(deployment = %deployment.id, error = %e, "retrying on next deployment");
                    self.cool_down(deployment, attempt as u32).await;
                    last_err = Some(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    self.cool_down(deployment, attempt as u32).await;
                    last_err = Some(Error::ProviderUnavailable(format!(
                        "timeout after {}s",
                        model.timeout_secs
                    )));
                }
            }
        }
        Err(last_err.unwrap_or(Error::NoAvailableDeployment(model.id)))
    }

    /// Streaming chat completion. Retries across deployments only until the
    /// first chunk; afterwards a failure becomes a final `[ERROR]` chunk.
    #[instrument(skip(self, request), fields(model = %request.model, org = %opts.organization_id))]
    pub async fn chat_stream(
        &self,
        opts: &RouteOptions,
        request: &ChatRequest,
    ) -> Result<ChunkStream> {
        let model = self
            .registry
            .get_model(&opts.organization_id, &request.model)
            .await?;
        Self::check_context(&model, request)?;

        let deadline = Instant::now() + Duration::from_secs(model.timeout_secs);
        let candidates = self.candidates(&model.id).await;
        if candidates.is_empty() {
            return Err(Error::NoAvailableDeployment(model.id.clone()));
        }

        let mut last_err = None;
        for (attempt, deployment) in candidates.iter().enumerate() {
            let Some(adapter) = self.adapters.get(deployment.provider) else {
                warn!(provider = %deployment.provider, "no adapter registered");
                continue;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                last_err = Some(Error::ProviderUnavailable(format!(
                    "timeout after {}s",
                    model.timeout_secs
                )));
                break;
            }
            let key = self.api_key(deployment, opts);
            let stream = match tokio::time::timeout(
                remaining,
                adapter.chat_stream(request, deployment, &key),
            )
            .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) if e.is_retryable() => {
                    self.cool_down(deployment, attempt as u32).await;
                    last_err = Some(e);
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    self.cool_down(deployment, attempt as u32).await;
                    last_err = Some(Error::ProviderUnavailable(format!(
                        "timeout after {}s",
                        model.timeout_secs
                    )));
                    continue;
                }
            };

            // Nothing has been emitted yet, so a failure on the first chunk
            // may still fall through to the next deployment.
            let mut stream = stream;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, stream.next()).await {
                Ok(Some(Ok(first))) => {
                    let model_id = model.id.clone();
                    let guarded = stream.scan(false, move |failed, item| {
                        if *failed {
                            return futures::future::ready(None);
                        }
                        let out = match item {
                            Ok(chunk) => Some(Ok(chunk)),
                            Err(e) => {
                                *failed = true;
                                Some(Ok(error_chunk(&model_id, &e)))
                            }
                        };
                        futures::future::ready(out)
                    });
                    let full = futures::stream::once(futures::future::ready(Ok(first)))
                        .chain(guarded);
                    return Ok(Box::pin(full));
                }
                Ok(Some(Err(e))) if e.is_retryable() => {
                    self.cool_down(deployment, attempt as u32).await;
                    last_err = Some(e);
                }
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) => {
                    // Provider closed the stream without emitting; retryable.
                    self.cool_down(deployment, attempt as u32).await;
                    last_err = Some(Error::ProviderUnavailable(
                        "stream closed before first chunk".to_string(),
                    ));
                }
                Err(_) => {
                    self.cool_down(deployment, attempt as u32).await;
                    last_err = Some(Error::ProviderUnavailable(format!(
                        "timeout after {}s",
                        model.timeout_secs
                    )));
                }
            }
        }
        Err(last_err.unwrap_or(Error::NoAvailableDeployment(model.id)))
    }

    /// Embedding with retry across deployments.
    #[instrument(skip(self, request), fields(model = %request.model, org = %opts.organization_id))]
    pub async fn embed(
        &self,
        opts: &RouteOptions,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse> {
        let model = self
            .registry
            .get_model(&opts.organization_id, &request.model)
            .await?;
        self.unary_retry(opts, &model, |adapter, deployment, key| {
            let request = request.clone();
            async move { adapter.embed(&request, &deployment, &key).await }
        })
        .await
    }

    /// Reranking with retry across deployments.
    #[instrument(skip(self, request), fields(model = %request.model, org = %opts.organization_id))]
    pub async fn rerank(
        &self,
        opts: &RouteOptions,
        request: &RerankRequest,
    ) -> Result<RerankResponse> {
        let model = self
            .registry
            .get_model(&opts.organization_id, &request.model)
            .await?;
        self.unary_retry(opts, &model, |adapter, deployment, key| {
            let request = request.clone();
            async move { adapter.rerank(&request, &deployment, &key).await }
        })
        .await
    }

    async fn unary_retry<T, F, Fut>(
        &self,
        opts: &RouteOptions,
        model: &ModelConfig,
        call: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn crate::providers::ProviderAdapter>, Deployment, String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let deadline = Instant::now() + Duration::from_secs(model.timeout_secs);
        let candidates = self.candidates(&model.id).await;
        if candidates.is_empty() {
            return Err(Error::NoAvailableDeployment(model.id.clone()));
        }
        let mut last_err = None;
        for (attempt, deployment) in candidates.iter().enumerate() {
            let Some(adapter) = self.adapters.get(deployment.provider) else {
                continue;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let key = self.api_key(deployment, opts);
            match tokio::time::timeout(remaining, call(adapter, deployment.clone(), key)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_retryable() => {
                    self.cool_down(deployment, attempt as u32).await;
                    last_err = Some(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    self.cool_down(deployment, attempt as u32).await;
                    last_err = Some(Error::ProviderUnavailable(format!(
                        "timeout after {}s",
                        model.timeout_secs
                    )));
                }
            }
        }
        Err(last_err.unwrap_or(Error::NoAvailableDeployment(model.id.clone())))
    }
}

/// The final chunk forwarded when a committed stream fails mid-flight.
fn error_chunk(model_id: &str, error: &Error) -> ChatChunk {
    let mut chunk = ChatChunk::content(
        &uuid::Uuid::now_v7().to_string(),
        model_id,
        format!("[ERROR] {error}"),
    );
    chunk.choices[0].finish_reason = Some(FinishReason::Stop);
    chunk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderAdapter;
    use crate::registry::{Capability, ModelType};
    use crate::types::{AssistantMessage, ChatMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted adapter: fails the first `fail_first` calls with the given
    /// error factory, then succeeds.
    struct ScriptedAdapter {
        calls: AtomicUsize,
        fail_first: usize,
        error: fn() -> Error,
    }

    impl ScriptedAdapter {
        fn new(fail_first: usize, error: fn() -> Error) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
                error,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn chat(
            &self,
            request: &ChatRequest,
            _deployment: &Deployment,
            _api_key: &str,
        ) -> Result<ChatResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err((self.error)());
            }
            Ok(ChatResponse::new(
                request.model.clone(),
                AssistantMessage {
                    role: "assistant".to_string(),
                    content: Some("ok".to_string()),
                    reasoning_content: None,
                    tool_calls: Vec::new(),
                },
                Some(FinishReason::Stop),
                Some(crate::types::CompletionUsage::new(2, 1)),
            ))
        }

        async fn chat_stream(
            &self,
            _request: &ChatRequest,
            _deployment: &Deployment,
            _api_key: &str,
        ) -> Result<ChunkStream> {
            Err(Error::BadInput("not scripted".to_string()))
        }

        async fn embed(
            &self,
            _request: &EmbeddingRequest,
            _deployment: &Deployment,
            _api_key: &str,
        ) -> Result<EmbeddingResponse> {
            Err(Error::BadInput("not scripted".to_string()))
        }

        async fn rerank(
            &self,
            _request: &RerankRequest,
            _deployment: &Deployment,
            _api_key: &str,
        ) -> Result<RerankResponse> {
            Err(Error::BadInput("not scripted".to_string()))
        }
    }

    fn model(id: &str, context_length: u32) -> ModelConfig {
        ModelConfig {
            id: id.to_string(),
            name: String::new(),
            owned_by: "test".to_string(),
            model_type: ModelType::Llm,
            capabilities: vec![Capability::Chat],
            context_length,
            languages: Vec::new(),
            embedding_size: None,
            embedding_dimensions: None,
            llm_input_cost_per_mtoken: 0.0,
            llm_output_cost_per_mtoken: 0.0,
            embedding_cost_per_mtoken: 0.0,
            reranking_cost_per_ksearch: 0.0,
            allowed_orgs: Vec::new(),
            blocked_orgs: Vec::new(),
            timeout_secs: 30,
            priority: 0,
        }
    }

    async fn router_with(
        adapter: Arc<ScriptedAdapter>,
        deployments: usize,
    ) -> (ModelRouter, Arc<ModelRegistry>) {
        let registry = Arc::new(ModelRegistry::new());
        registry.upsert_model(model("test/m", 8192)).await.unwrap();
        for i in 0..deployments {
            registry
                .add_deployment(
                    Deployment::new("test/m", Provider::Custom, format!("native-{i}")),
                )
                .await
                .unwrap();
        }
        let mut adapters = AdapterSet::empty();
        adapters.insert(Provider::Custom, adapter);
        let router = ModelRouter::new(registry.clone(), adapters)
            .with_backoff_base(Duration::from_millis(10));
        (router, registry)
    }

    fn chat_request(text: &str) -> ChatRequest {
        ChatRequest::new("test/m", vec![ChatMessage::user(text)])
    }

    #[tokio::test]
    async fn test_retries_on_unavailable_then_succeeds() {
        let adapter = Arc::new(ScriptedAdapter::new(1, || {
            Error::ProviderUnavailable("503".to_string())
        }));
        let (router, registry) = router_with(adapter.clone(), 2).await;

        let response = router
            .chat(&RouteOptions::for_org("org"), &chat_request("hi"))
            .await
            .unwrap();
        assert_eq!(response.text(), "ok");
        assert_eq!(adapter.calls(), 2);

        // The failed deployment was put on cooldown.
        let cooled = registry
            .deployments_of("test/m")
            .await
            .iter()
            .filter(|d| d.cooldown_until.is_some())
            .count();
        assert_eq!(cooled, 1);
    }

    #[tokio::test]
    async fn test_auth_error_not_retried() {
        let adapter = Arc::new(ScriptedAdapter::new(2, || {
            Error::ProviderAuth("bad key".to_string())
        }));
        let (router, _) = router_with(adapter.clone(), 2).await;

        let err = router
            .chat(&RouteOptions::for_org("org"), &chat_request("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderAuth(_)));
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn test_attempts_bounded_by_deployments() {
        let adapter = Arc::new(ScriptedAdapter::new(usize::MAX, || {
            Error::ProviderRateLimit("429".to_string())
        }));
        let (router, _) = router_with(adapter.clone(), 3).await;

        let err = router
            .chat(&RouteOptions::for_org("org"), &chat_request("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderRateLimit(_)));
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test]
    async fn test_context_overflow_before_any_call() {
        let adapter = Arc::new(ScriptedAdapter::new(0, || {
            Error::Unexpected("unused".to_string())
        }));
        let registry = Arc::new(ModelRegistry::new());
        registry.upsert_model(model("test/tiny", 5)).await.unwrap();
        registry
            .add_deployment(Deployment::new("test/tiny", Provider::Custom, "native"))
            .await
            .unwrap();
        let mut adapters = AdapterSet::empty();
        adapters.insert(Provider::Custom, adapter.clone());
        let router = ModelRouter::new(registry, adapters);

        let mut request = chat_request("Hi there how is your day going?");
        request.model = "test/tiny".to_string();
        let err = router
            .chat(&RouteOptions::for_org("org"), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ContextOverflow(_)));
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_weight_is_last_resort() {
        let registry = Arc::new(ModelRegistry::new());
        registry.upsert_model(model("test/m", 8192)).await.unwrap();
        registry
            .add_deployment(
                Deployment::new("test/m", Provider::Custom, "heavy").with_weight(1.0),
            )
            .await
            .unwrap();
        registry
            .add_deployment(
                Deployment::new("test/m", Provider::Custom, "fallback").with_weight(0.0),
            )
            .await
            .unwrap();
        let router = ModelRouter::new(registry, AdapterSet::empty());

        for _ in 0..20 {
            let order = router.candidates("test/m").await;
            assert_eq!(order.len(), 2);
            assert_eq!(order[0].routing_id, "heavy");
            assert_eq!(order[1].routing_id, "fallback");
        }
    }

    /// Adapter that records the API key of every embed/rerank call.
    #[derive(Default)]
    struct KeyCaptureAdapter {
        keys: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ProviderAdapter for KeyCaptureAdapter {
        fn name(&self) -> &'static str {
            "key-capture"
        }

        async fn chat(
            &self,
            _request: &ChatRequest,
            _deployment: &Deployment,
            _api_key: &str,
        ) -> Result<ChatResponse> {
            Err(Error::BadInput("not scripted".to_string()))
        }

        async fn chat_stream(
            &self,
            _request: &ChatRequest,
            _deployment: &Deployment,
            _api_key: &str,
        ) -> Result<ChunkStream> {
            Err(Error::BadInput("not scripted".to_string()))
        }

        async fn embed(
            &self,
            request: &EmbeddingRequest,
            _deployment: &Deployment,
            api_key: &str,
        ) -> Result<EmbeddingResponse> {
            self.keys.lock().unwrap().push(api_key.to_string());
            Ok(EmbeddingResponse {
                object: "list".to_string(),
                data: Vec::new(),
                model: request.model.clone(),
                usage: crate::types::EmbeddingUsage::default(),
            })
        }

        async fn rerank(
            &self,
            request: &RerankRequest,
            _deployment: &Deployment,
            api_key: &str,
        ) -> Result<RerankResponse> {
            self.keys.lock().unwrap().push(api_key.to_string());
            Ok(RerankResponse {
                object: "list".to_string(),
                results: Vec::new(),
                usage: crate::types::RerankUsage::default(),
                meta: crate::types::RerankMeta {
                    model: request.model.clone(),
                    billed_units: None,
                    tokens: None,
                },
            })
        }
    }

    #[tokio::test]
    async fn test_external_key_reaches_embed_and_rerank_adapters() {
        let registry = Arc::new(ModelRegistry::new());
        let mut embed_model = model("openai/embed", 8192);
        embed_model.model_type = ModelType::Embed;
        embed_model.embedding_size = Some(8);
        registry.upsert_model(embed_model).await.unwrap();
        let mut rerank_model = model("openai/rerank", 8192);
        rerank_model.model_type = ModelType::Rerank;
        registry.upsert_model(rerank_model).await.unwrap();
        for id in ["openai/embed", "openai/rerank"] {
            registry
                .add_deployment(Deployment::new(id, Provider::Openai, "native"))
                .await
                .unwrap();
        }

        let adapter = Arc::new(KeyCaptureAdapter::default());
        let mut adapters = AdapterSet::empty();
        adapters.insert(Provider::Openai, adapter.clone());
        let router = ModelRouter::new(registry, adapters)
            .with_process_key(Provider::Openai, "process-key");

        let mut opts = RouteOptions::for_org("org");
        opts.external_keys
            .insert("openai".to_string(), "org-key".to_string());

        let embed_request = crate::types::EmbeddingRequest {
            model: "openai/embed".to_string(),
            input: crate::types::EmbeddingInput::One("hello".to_string()),
            dimensions: None,
            encoding_format: crate::types::EncodingFormat::Float,
        };
        router.embed(&opts, &embed_request).await.unwrap();

        let rerank_request = RerankRequest {
            model: "openai/rerank".to_string(),
            query: "q".to_string(),
            documents: vec!["d".to_string()],
            top_n: None,
        };
        router.rerank(&opts, &rerank_request).await.unwrap();

        assert_eq!(
            *adapter.keys.lock().unwrap(),
            vec!["org-key".to_string(), "org-key".to_string()]
        );

        // Without an org key the process key is used.
        router
            .embed(&RouteOptions::for_org("org"), &embed_request)
            .await
            .unwrap();
        assert_eq!(
            adapter.keys.lock().unwrap().last().map(String::as_str),
            Some("process-key")
        );
    }

    #[tokio::test]
    async fn test_external_key_overrides_process_key() {
        let registry = Arc::new(ModelRegistry::new());
        let router = ModelRouter::new(registry, AdapterSet::empty())
            .with_process_key(Provider::Openai, "process-key");
        let deployment = Deployment::new("openai/m", Provider::Openai, "gpt");

        let mut opts = RouteOptions::for_org("org");
        assert_eq!(router.api_key(&deployment, &opts), "process-key");

        opts.external_keys
            .insert("openai".to_string(), "org-key".to_string());
        assert_eq!(router.api_key(&deployment, &opts), "org-key");
    }

    #[test]
    fn test_cooldown_backoff_doubles_with_jitter() {
        let registry = Arc::new(ModelRegistry::new());
        let router = ModelRouter::new(registry, AdapterSet::empty())
            .with_backoff_base(Duration::from_secs(10));
        for attempt in 0..4_u32 {
            let d = router.cooldown_after(attempt);
            let expected = 10.0 * f64::from(2_u32.pow(attempt));
            assert!(d.as_secs_f64() >= expected * 0.8 - f64::EPSILON);
            assert!(d.as_secs_f64() <= expected * 1.2 + f64::EPSILON);
        }
    }
}
