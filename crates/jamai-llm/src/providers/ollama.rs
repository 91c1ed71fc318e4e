//! Ollama adapter
//!
//! Local Ollama daemon, `/api/chat` for chat (NDJSON streaming) and
//! `/api/embed` for embeddings. No API key; the daemon is trusted local
//! infrastructure.

use super::http::{map_status_error, ndjson_lines};
use super::{ChunkStream, ProviderAdapter};
use crate::error::{Error, Result};
use crate::registry::Deployment;
use crate::types::{
    AssistantMessage, ChatChunk, ChatRequest, ChatResponse, CompletionUsage, ContentPart,
    EmbeddingData, EmbeddingRequest, EmbeddingResponse, EmbeddingUsage, EmbeddingVector,
    FinishReason, MessageContent, RerankRequest, RerankResponse,
};
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

const DEFAULT_API_BASE: &str = "http://localhost:11434";

/// Ollama adapter
pub struct OllamaAdapter {
    client: Client,
}

impl OllamaAdapter {
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

    fn body(request: &ChatRequest, deployment: &Deployment, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                let mut msg = json!({
                    "role": m.role.as_str(),
                    "content": m.content.as_text(),
                });
                let images = collect_images(&m.content);
                if !images.is_empty() {
                    msg.as_object_mut()
                        .expect("message is an object")
                        .insert("images".to_string(), json!(images));
                }
                msg
            })
            .collect();

        let mut options = serde_json::Map::new();
        if let Some(t) = request.temperature {
            options.insert("temperature".to_string(), json!(t));
        }
        if let Some(p) = request.top_p {
            options.insert("top_p".to_string(), json!(p));
        }
        if let Some(m) = request.max_tokens {
            options.insert("num_predict".to_string(), json!(m));
        }
        if let Some(stop) = &request.stop {
            options.insert("stop".to_string(), json!(stop));
        }

        let mut body = json!({
            "model": deployment.routing_id,
            "messages": messages,
            "stream": stream,
        });
        if !options.is_empty() {
            body.as_object_mut()
                .expect("chat body is an object")
                .insert("options".to_string(), serde_json::Value::Object(options));
        }
        body
    }
}

impl Default for OllamaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Ollama takes raw base64 in a parallel `images` array.
fn collect_images(content: &MessageContent) -> Vec<String> {
    match content {
        MessageContent::Text(_) => Vec::new(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ImageUrl { image_url } => image_url
                    .url
                    .strip_prefix("data:")
                    .and_then(|rest| rest.split_once(";base64,"))
                    .map(|(_, data)| data.to_string()),
                _ => None,
            })
            .collect(),
    }
}

fn map_done_reason(reason: Option<&str>) -> Option<FinishReason> {
    match reason? {
        "length" => Some(FinishReason::Length),
        _ => Some(FinishReason::Stop),
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
}

impl WireResponse {
    fn usage(&self) -> Option<CompletionUsage> {
        match (self.prompt_eval_count, self.eval_count) {
            (None, None) => None,
            (p, c) => Some(CompletionUsage::new(p.unwrap_or(0), c.unwrap_or(0))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireEmbedResponse {
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
}

#[async_trait::async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &'static str {
        "ollama"
    }

    #[instrument(skip_all, fields(model = %request.model, routing_id = %deployment.routing_id))]
    async fn chat(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
        _api_key: &str,
    ) -> Result<ChatResponse> {
        let url = format!("{}/api/chat", Self::base(deployment));
        debug!(%url, "unary chat request");
        let response = self
            .client
            .post(&url)
            .json(&Self::body(request, deployment, false))
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

        let wire: WireResponse =
            serde_json::from_str(&text).map_err(|e| Error::InvalidResponse(e.to_string()))?;
        Ok(ChatResponse::new(
            request.model.clone(),
            AssistantMessage {
                role: "assistant".to_string(),
                content: Some(wire.message.as_ref().map(|m| m.content.clone()).unwrap_or_default()),
                reasoning_content: None,
                tool_calls: Vec::new(),
            },
            map_done_reason(wire.done_reason.as_deref()).or(Some(FinishReason::Stop)),
            wire.usage(),
        ))
    }

    #[instrument(skip_all, fields(model = %request.model, routing_id = %deployment.routing_id))]
    async fn chat_stream(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
        _api_key: &str,
    ) -> Result<ChunkStream> {
        let url = format!("{}/api/chat", Self::base(deployment));
        debug!(%url, "streaming chat request");
        let response = self
            .client
            .post(&url)
            .json(&Self::body(request, deployment, true))
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
        let stream = ndjson_lines(response).filter_map(move |item| {
            let model = model.clone();
            let stream_id = stream_id.clone();
            async move {
                match item {
                    Ok(line) => match serde_json::from_str::<WireResponse>(&line) {
                        Ok(wire) if wire.done => Some(Ok(ChatChunk::tail(
                            &stream_id,
                            &model,
                            map_done_reason(wire.done_reason.as_deref())
                                .unwrap_or(FinishReason::Stop),
                            wire.usage(),
                        ))),
                        Ok(wire) => {
                            let text =
                                wire.message.map(|m| m.content).unwrap_or_default();
                            if text.is_empty() {
                                None
                            } else {
                                Some(Ok(ChatChunk::content(&stream_id, &model, text)))
                            }
                        }
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
        _api_key: &str,
    ) -> Result<EmbeddingResponse> {
        let url = format!("{}/api/embed", Self::base(deployment));
        let body = json!({
            "model": deployment.routing_id,
            "input": request.input.texts(),
        });
        let response = self
            .client
            .post(&url)
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
        let tokens = wire.prompt_eval_count.unwrap_or(0);
        Ok(EmbeddingResponse {
            object: "list".to_string(),
            data: wire
                .embeddings
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

    async fn rerank(
        &self,
        _request: &RerankRequest,
        _deployment: &Deployment,
        _api_key: &str,
    ) -> Result<RerankResponse> {
        Err(Error::BadInput("ollama does not serve reranking".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Provider;
    use crate::types::ChatMessage;

    #[test]
    fn test_body_maps_options() {
        let req = ChatRequest::new("ollama/llama3", vec![ChatMessage::user("hi")])
            .with_max_tokens(32)
            .with_temperature(0.1);
        let d = Deployment::new("ollama/llama3", Provider::Ollama, "llama3.2");
        let body = OllamaAdapter::body(&req, &d, true);
        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["stream"], true);
        assert_eq!(body["options"]["num_predict"], 32);
    }

    #[test]
    fn test_collect_images_from_data_uris() {
        let content = MessageContent::Parts(vec![
            ContentPart::text("look"),
            ContentPart::image_url("data:image/png;base64,Zm9v"),
            ContentPart::image_url("https://example.com/skip.png"),
        ]);
        let images = collect_images(&content);
        assert_eq!(images, vec!["Zm9v".to_string()]);
    }

    #[test]
    fn test_done_line_carries_usage() {
        let wire: WireResponse = serde_json::from_str(
            r#"{"message":{"role":"assistant","content":""},"done":true,
                "done_reason":"stop","prompt_eval_count":5,"eval_count":9}"#,
        )
        .unwrap();
        assert!(wire.done);
        assert_eq!(wire.usage().unwrap().total_tokens, 14);
    }
}
