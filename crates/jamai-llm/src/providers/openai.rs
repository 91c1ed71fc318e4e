//! OpenAI-compatible adapter
//!
//! Speaks the `/chat/completions`, `/embeddings` and `/rerank` wire format
//! shared by OpenAI, Azure OpenAI, vLLM, Infinity and the first-party
//! serving cluster. The canonical types are already OpenAI-shaped, so the
//! translation is mostly a model-name swap plus lenient response decoding.

use super::http::{map_status_error, sse_data_lines};
use super::{ChunkStream, ProviderAdapter};
use crate::error::{Error, Result};
use crate::registry::Deployment;
use crate::types::{
    AssistantMessage, ChatChunk, ChatRequest, ChatResponse, ChunkChoice, ChunkDelta,
    CompletionUsage, EmbeddingData, EmbeddingRequest, EmbeddingResponse, EmbeddingUsage,
    EmbeddingVector, EncodingFormat, FinishReason, RerankMeta, RerankRequest, RerankResponse,
    RerankResult, RerankUsage, ToolCall,
};
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

/// Default public endpoint
const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// How the API key travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `api-key: <key>` (Azure OpenAI)
    ApiKeyHeader,
}

/// OpenAI-compatible provider adapter
pub struct OpenAiAdapter {
    client: Client,
    auth: AuthStyle,
}

impl OpenAiAdapter {
    /// Create an adapter with the given auth style.
    #[must_use]
    pub fn new(auth: AuthStyle) -> Self {
        Self {
            client: Client::new(),
            auth,
        }
    }

    fn base<'a>(&self, deployment: &'a Deployment) -> &'a str {
        if deployment.api_base.is_empty() {
            DEFAULT_API_BASE
        } else {
            deployment.api_base.trim_end_matches('/')
        }
    }

    fn request(&self, url: &str, api_key: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(url);
        match self.auth {
            AuthStyle::Bearer if !api_key.is_empty() => builder.bearer_auth(api_key),
            AuthStyle::ApiKeyHeader if !api_key.is_empty() => builder.header("api-key", api_key),
            _ => builder,
        }
    }

    fn chat_body(request: &ChatRequest, deployment: &Deployment, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": deployment.routing_id,
            "messages": request.messages,
        });
        let obj = body.as_object_mut().expect("chat body is an object");
        if let Some(t) = request.temperature {
            obj.insert("temperature".to_string(), json!(t));
        }
        if let Some(p) = request.top_p {
            obj.insert("top_p".to_string(), json!(p));
        }
        if let Some(m) = request.max_tokens {
            obj.insert("max_tokens".to_string(), json!(m));
        }
        if let Some(stop) = &request.stop {
            obj.insert("stop".to_string(), json!(stop));
        }
        if let Some(tools) = &request.tools {
            obj.insert("tools".to_string(), json!(tools));
        }
        if stream {
            obj.insert("stream".to_string(), json!(true));
            obj.insert("stream_options".to_string(), json!({"include_usage": true}));
        }
        body
    }
}

fn map_finish_reason(reason: Option<&str>) -> Option<FinishReason> {
    match reason? {
        "length" | "max_tokens" => Some(FinishReason::Length),
        "tool_calls" => Some(FinishReason::ToolCalls),
        "context_overflow" => Some(FinishReason::ContextOverflow),
        _ => Some(FinishReason::Stop),
    }
}

// Lenient wire shapes; unknown finish reasons and extra fields must not
// break decoding.

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    #[serde(default)]
    id: Option<String>,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<serde_json::Value>,
}

fn chunk_to_canonical(wire: WireChunk, model: &str) -> ChatChunk {
    ChatChunk {
        id: wire.id.unwrap_or_default(),
        object: "chat.completion.chunk".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: wire
            .choices
            .into_iter()
            .map(|c| ChunkChoice {
                index: c.index,
                delta: ChunkDelta {
                    role: c.delta.role,
                    content: c.delta.content,
                    reasoning_content: c.delta.reasoning_content,
                    tool_calls: c.delta.tool_calls,
                },
                finish_reason: map_finish_reason(c.finish_reason.as_deref()),
            })
            .collect(),
        usage: wire.usage,
    }
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingResponse {
    data: Vec<WireEmbeddingData>,
    #[serde(default)]
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingData {
    embedding: EmbeddingVector,
    index: u32,
}

#[derive(Debug, Deserialize)]
struct WireRerankResponse {
    results: Vec<WireRerankResult>,
    #[serde(default)]
    usage: Option<RerankUsage>,
}

#[derive(Debug, Deserialize)]
struct WireRerankResult {
    index: u32,
    relevance_score: f32,
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        match self.auth {
            AuthStyle::Bearer => "openai",
            AuthStyle::ApiKeyHeader => "azure",
        }
    }

    #[instrument(skip_all, fields(model = %request.model, routing_id = %deployment.routing_id))]
    async fn chat(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base(deployment));
        debug!(%url, "unary chat request");
        let response = self
            .request(&url, api_key)
            .json(&Self::chat_body(request, deployment, false))
            .send()
            .await
            .map_err(|e| Error::ProviderUnavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::ProviderUnavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(map_status_error(status, &body));
        }

        let wire: WireChatResponse =
            serde_json::from_str(&body).map_err(|e| Error::InvalidResponse(e.to_string()))?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidResponse("response has no choices".to_string()))?;

        Ok(ChatResponse {
            id: wire.id.unwrap_or_default(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: request.model.clone(),
            choices: vec![crate::types::ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: choice.message.content,
                    reasoning_content: choice.message.reasoning_content,
                    tool_calls: choice.message.tool_calls.unwrap_or_default(),
                },
                finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
            }],
            usage: wire.usage,
        })
    }

    #[instrument(skip_all, fields(model = %request.model, routing_id = %deployment.routing_id))]
    async fn chat_stream(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> Result<ChunkStream> {
        let url = format!("{}/chat/completions", self.base(deployment));
        debug!(%url, "streaming chat request");
        let response = self
            .request(&url, api_key)
            .json(&Self::chat_body(request, deployment, true))
            .send()
            .await
            .map_err(|e| Error::ProviderUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, &body));
        }

        let model = request.model.clone();
        let stream = sse_data_lines(response).filter_map(move |item| {
            let model = model.clone();
            async move {
                match item {
                    Ok(line) if line == "[DONE]" => None,
                    Ok(line) => match serde_json::from_str::<WireChunk>(&line) {
                        Ok(wire) => Some(Ok(chunk_to_canonical(wire, &model))),
                        Err(e) => Some(Err(Error::InvalidResponse(e.to_string()))),
                    },
                    Err(e) => Some(Err(e)),
                }
            }
        });
        Ok(Box::pin(stream))
    }

    #[instrument(skip_all, fields(model = %request.model, routing_id = %deployment.routing_id))]
    async fn embed(
        &self,
        request: &EmbeddingRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> Result<EmbeddingResponse> {
        let url = format!("{}/embeddings", self.base(deployment));
        let mut body = json!({
            "model": deployment.routing_id,
            "input": request.input,
        });
        let obj = body.as_object_mut().expect("embed body is an object");
        if let Some(dims) = request.dimensions {
            obj.insert("dimensions".to_string(), json!(dims));
        }
        if request.encoding_format == EncodingFormat::Base64 {
            obj.insert("encoding_format".to_string(), json!("base64"));
        }

        let response = self
            .request(&url, api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ProviderUnavailable(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::ProviderUnavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(map_status_error(status, &text));
        }

        let wire: WireEmbeddingResponse =
            serde_json::from_str(&text).map_err(|e| Error::InvalidResponse(e.to_string()))?;
        Ok(EmbeddingResponse {
            object: "list".to_string(),
            data: wire
                .data
                .into_iter()
                .map(|d| EmbeddingData {
                    object: "embedding".to_string(),
                    embedding: d.embedding,
                    index: d.index,
                })
                .collect(),
            model: request.model.clone(),
            usage: wire.usage.unwrap_or_default(),
        })
    }

    #[instrument(skip_all, fields(model = %request.model, routing_id = %deployment.routing_id))]
    async fn rerank(
        &self,
        request: &RerankRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> Result<RerankResponse> {
        let url = format!("{}/rerank", self.base(deployment));
        let mut body = json!({
            "model": deployment.routing_id,
            "query": request.query,
            "documents": request.documents,
        });
        if let Some(top_n) = request.top_n {
            body.as_object_mut()
                .expect("rerank body is an object")
                .insert("top_n".to_string(), json!(top_n));
        }

        let response = self
            .request(&url, api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ProviderUnavailable(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::ProviderUnavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(map_status_error(status, &text));
        }

        let wire: WireRerankResponse =
            serde_json::from_str(&text).map_err(|e| Error::InvalidResponse(e.to_string()))?;
        let mut out = RerankResponse {
            object: "list".to_string(),
            results: wire
                .results
                .into_iter()
                .map(|r| RerankResult {
                    object: "reranking".to_string(),
                    index: r.index,
                    relevance_score: r.relevance_score,
                })
                .collect(),
            usage: wire.usage.unwrap_or_default(),
            meta: RerankMeta {
                model: request.model.clone(),
                billed_units: None,
                tokens: None,
            },
        };
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Provider;
    use crate::types::ChatMessage;

    fn deployment() -> Deployment {
        Deployment::new("openai/gpt-4o", Provider::Openai, "gpt-4o")
    }

    #[test]
    fn test_chat_body_includes_stream_options() {
        let req = ChatRequest::new("openai/gpt-4o", vec![ChatMessage::user("hi")])
            .with_max_tokens(16)
            .with_temperature(0.5);
        let body = OpenAiAdapter::chat_body(&req, &deployment(), true);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_tokens"], 16);
    }

    #[test]
    fn test_unary_body_omits_stream() {
        let req = ChatRequest::new("openai/gpt-4o", vec![ChatMessage::user("hi")]);
        let body = OpenAiAdapter::chat_body(&req, &deployment(), false);
        assert!(body.get("stream").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_chunk_decoding_is_lenient() {
        let wire: WireChunk = serde_json::from_str(
            r#"{"id":"x","choices":[{"index":0,"delta":{"content":"hi"},"finish_reason":"content_filter"}]}"#,
        )
        .unwrap();
        let chunk = chunk_to_canonical(wire, "openai/gpt-4o");
        assert_eq!(chunk.text(), Some("hi"));
        // Unknown finish reasons collapse to stop
        assert_eq!(chunk.choices[0].finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason(None), None);
        assert_eq!(map_finish_reason(Some("length")), Some(FinishReason::Length));
        assert_eq!(
            map_finish_reason(Some("tool_calls")),
            Some(FinishReason::ToolCalls)
        );
        assert_eq!(map_finish_reason(Some("stop")), Some(FinishReason::Stop));
    }
}
