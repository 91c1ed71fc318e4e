//! Cohere adapter
//!
//! Rerank and embeddings via the v2 API, plus unary and streaming chat.
//! Cohere reports billed units separately from token counts; both are
//! surfaced in the rerank metadata.

use super::http::{map_status_error, sse_data_lines};
use super::{ChunkStream, ProviderAdapter};
use crate::error::{Error, Result};
use crate::registry::Deployment;
use crate::types::{
    AssistantMessage, ChatChunk, ChatRequest, ChatResponse, CompletionUsage, EmbeddingData,
    EmbeddingRequest, EmbeddingResponse, EmbeddingUsage, EmbeddingVector, FinishReason,
    RerankMeta, RerankRequest, RerankResponse, RerankResult, RerankUsage,
};
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

const DEFAULT_API_BASE: &str = "https://api.cohere.com/v2";

/// Cohere adapter
pub struct CohereAdapter {
    client: Client,
}

impl CohereAdapter {
    /// Create a new adapter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    fn base<'a>(deployment: &'a Deployment) -> &'a str {
        if deployment.api_base.is_empty() {
            DEFAULT_API_BASE
        } else {
            deployment.api_base.trim_end_matches('/')
        }
    }

    fn chat_body(request: &ChatRequest, deployment: &Deployment, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role.as_str(),
                    "content": m.content.as_text(),
                })
            })
            .collect();
        let mut body = json!({
            "model": deployment.routing_id,
            "messages": messages,
        });
        let obj = body.as_object_mut().expect("chat body is an object");
        if let Some(t) = request.temperature {
            obj.insert("temperature".to_string(), json!(t));
        }
        if let Some(p) = request.top_p {
            obj.insert("p".to_string(), json!(p));
        }
        if let Some(m) = request.max_tokens {
            obj.insert("max_tokens".to_string(), json!(m));
        }
        if let Some(stop) = &request.stop {
            obj.insert("stop_sequences".to_string(), json!(stop));
        }
        if stream {
            obj.insert("stream".to_string(), json!(true));
        }
        body
    }
}

impl Default for CohereAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn map_finish_reason(reason: Option<&str>) -> Option<FinishReason> {
    match reason? {
        "MAX_TOKENS" => Some(FinishReason::Length),
        "TOOL_CALL" => Some(FinishReason::ToolCalls),
        _ => Some(FinishReason::Stop),
    }
}

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    #[serde(default)]
    id: String,
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Vec<WireContentBlock>,
}

#[derive(Debug, Deserialize)]
struct WireContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct WireUsage {
    #[serde(default)]
    tokens: WireTokenCounts,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct WireTokenCounts {
    #[serde(default)]
    input_tokens: f64,
    #[serde(default)]
    output_tokens: f64,
}

impl WireUsage {
    fn completion_usage(self) -> CompletionUsage {
        CompletionUsage::new(self.tokens.input_tokens as u32, self.tokens.output_tokens as u32)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireStreamEvent {
    #[serde(rename = "content-delta")]
    ContentDelta { delta: WireStreamDelta },
    #[serde(rename = "message-end")]
    MessageEnd {
        #[serde(default)]
        delta: WireMessageEnd,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireStreamDelta {
    #[serde(default)]
    message: Option<WireStreamMessage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamMessage {
    #[serde(default)]
    content: Option<WireContentBlock>,
}

#[derive(Debug, Default, Deserialize)]
struct WireMessageEnd {
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireRerankResponse {
    results: Vec<WireRerankResult>,
    #[serde(default)]
    meta: Option<WireMeta>,
}

#[derive(Debug, Deserialize)]
struct WireRerankResult {
    index: u32,
    relevance_score: f32,
}

#[derive(Debug, Deserialize)]
struct WireMeta {
    #[serde(default)]
    billed_units: Option<WireBilledUnits>,
}

#[derive(Debug, Deserialize)]
struct WireBilledUnits {
    #[serde(default)]
    search_units: Option<u32>,
    #[serde(default)]
    input_tokens: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireEmbedResponse {
    embeddings: WireEmbeddings,
    #[serde(default)]
    meta: Option<WireMeta>,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddings {
    #[serde(default)]
    float: Vec<Vec<f32>>,
}

#[async_trait::async_trait]
impl ProviderAdapter for CohereAdapter {
    fn name(&self) -> &'static str {
        "cohere"
    }

    #[instrument(skip_all, fields(model = %request.model, routing_id = %deployment.routing_id))]
    async fn chat(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> Result<ChatResponse> {
        let url = format!("{}/chat", Self::base(deployment));
        debug!(%url, "unary chat request");
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&Self::chat_body(request, deployment, false))
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

        let wire: WireChatResponse =
            serde_json::from_str(&text).map_err(|e| Error::InvalidResponse(e.to_string()))?;
        let content: String = wire.message.content.iter().map(|b| b.text.as_str()).collect();
        Ok(ChatResponse {
            id: wire.id,
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: request.model.clone(),
            choices: vec![crate::types::ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: Some(content),
                    reasoning_content: None,
                    tool_calls: Vec::new(),
                },
                finish_reason: map_finish_reason(wire.finish_reason.as_deref()),
            }],
            usage: wire.usage.map(WireUsage::completion_usage),
        })
    }

    #[instrument(skip_all, fields(model = %request.model, routing_id = %deployment.routing_id))]
    async fn chat_stream(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> Result<ChunkStream> {
        let url = format!("{}/chat", Self::base(deployment));
        debug!(%url, "streaming chat request");
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
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
        let stream_id = uuid::Uuid::now_v7().to_string();
        let stream = sse_data_lines(response).filter_map(move |item| {
            let model = model.clone();
            let stream_id = stream_id.clone();
            async move {
                match item {
                    Ok(line) => match serde_json::from_str::<WireStreamEvent>(&line) {
                        Ok(WireStreamEvent::ContentDelta { delta }) => {
                            let text = delta
                                .message
                                .and_then(|m| m.content)
                                .map(|c| c.text)
                                .unwrap_or_default();
                            if text.is_empty() {
                                None
                            } else {
                                Some(Ok(ChatChunk::content(&stream_id, &model, text)))
                            }
                        }
                        Ok(WireStreamEvent::MessageEnd { delta }) => Some(Ok(ChatChunk::tail(
                            &stream_id,
                            &model,
                            map_finish_reason(delta.finish_reason.as_deref())
                                .unwrap_or(FinishReason::Stop),
                            delta.usage.map(WireUsage::completion_usage),
                        ))),
                        Ok(WireStreamEvent::Other) => None,
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
        let url = format!("{}/embed", Self::base(deployment));
        let body = json!({
            "model": deployment.routing_id,
            "texts": request.input.texts(),
            "input_type": "search_document",
            "embedding_types": ["float"],
        });
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
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

        let wire: WireEmbedResponse =
            serde_json::from_str(&text).map_err(|e| Error::InvalidResponse(e.to_string()))?;
        let tokens = wire
            .meta
            .as_ref()
            .and_then(|m| m.billed_units.as_ref())
            .and_then(|b| b.input_tokens)
            .unwrap_or(0.0) as u32;
        Ok(EmbeddingResponse {
            object: "list".to_string(),
            data: wire
                .embeddings
                .float
                .into_iter()
                .enumerate()
                .map(|(i, values)| EmbeddingData {
                    object: "embedding".to_string(),
                    embedding: match request.encoding_format {
                        crate::types::EncodingFormat::Float => EmbeddingVector::Float(values),
                        crate::types::EncodingFormat::Base64 => {
                            EmbeddingVector::base64_from_floats(&values)
                        }
                    },
                    index: i as u32,
                })
                .collect(),
            model: request.model.clone(),
            usage: EmbeddingUsage {
                prompt_tokens: tokens,
                total_tokens: tokens,
            },
        })
    }

    #[instrument(skip_all, fields(model = %request.model, routing_id = %deployment.routing_id))]
    async fn rerank(
        &self,
        request: &RerankRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> Result<RerankResponse> {
        let url = format!("{}/rerank", Self::base(deployment));
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
            .client
            .post(&url)
            .bearer_auth(api_key)
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
        let billed = wire
            .meta
            .as_ref()
            .and_then(|m| m.billed_units.as_ref())
            .and_then(|b| b.search_units);
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
            usage: RerankUsage {
                search_units: billed.unwrap_or(1),
            },
            meta: RerankMeta {
                model: request.model.clone(),
                billed_units: billed,
                tokens: None,
            },
        };
        out.sort();
        Ok(out)
    }
}
