//! Google Gemini adapter
//!
//! Chat via `models/{id}:generateContent` (SSE streaming via
//! `:streamGenerateContent?alt=sse`), embeddings via `:batchEmbedContents`
//! with `outputDimensionality` for Matryoshka truncation.

use super::http::{map_status_error, sse_data_lines};
use super::{ChunkStream, ProviderAdapter};
use crate::error::{Error, Result};
use crate::registry::Deployment;
use crate::types::{
    AssistantMessage, ChatChunk, ChatRequest, ChatResponse, CompletionUsage, ContentPart,
    EmbeddingData, EmbeddingRequest, EmbeddingResponse, EmbeddingUsage, EmbeddingVector,
    FinishReason, MessageContent, MessageRole, RerankRequest, RerankResponse,
};
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini adapter
pub struct GeminiAdapter {
    client: Client,
}

impl GeminiAdapter {
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

    fn body(request: &ChatRequest) -> serde_json::Value {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();
        for message in &request.messages {
            match message.role {
                MessageRole::System => {
                    system_parts.push(json!({"text": message.content.as_text()}));
                }
                MessageRole::User | MessageRole::Tool => contents.push(json!({
                    "role": "user",
                    "parts": convert_parts(&message.content),
                })),
                MessageRole::Assistant => contents.push(json!({
                    "role": "model",
                    "parts": convert_parts(&message.content),
                })),
            }
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(t) = request.temperature {
            generation_config.insert("temperature".to_string(), json!(t));
        }
        if let Some(p) = request.top_p {
            generation_config.insert("topP".to_string(), json!(p));
        }
        if let Some(m) = request.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(m));
        }
        if let Some(stop) = &request.stop {
            generation_config.insert("stopSequences".to_string(), json!(stop));
        }

        let mut body = json!({"contents": contents});
        let obj = body.as_object_mut().expect("gemini body is an object");
        if !system_parts.is_empty() {
            obj.insert(
                "systemInstruction".to_string(),
                json!({"parts": system_parts}),
            );
        }
        if !generation_config.is_empty() {
            obj.insert(
                "generationConfig".to_string(),
                serde_json::Value::Object(generation_config),
            );
        }
        body
    }
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn convert_parts(content: &MessageContent) -> Vec<serde_json::Value> {
    match content {
        MessageContent::Text(s) => vec![json!({"text": s})],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"text": text}),
                ContentPart::ImageUrl { image_url } => {
                    if let Some((mime, data)) = split_data_uri(&image_url.url) {
                        json!({"inlineData": {"mimeType": mime, "data": data}})
                    } else {
                        json!({"fileData": {"fileUri": image_url.url}})
                    }
                }
                ContentPart::InputAudio { input_audio } => json!({
                    "inlineData": {
                        "mimeType": format!("audio/{}", input_audio.format),
                        "data": input_audio.data,
                    }
                }),
            })
            .collect(),
    }
}

fn split_data_uri(url: &str) -> Option<(&str, &str)> {
    url.strip_prefix("data:")?.split_once(";base64,")
}

fn map_finish_reason(reason: Option<&str>) -> Option<FinishReason> {
    match reason? {
        "MAX_TOKENS" => Some(FinishReason::Length),
        _ => Some(FinishReason::Stop),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    usage_metadata: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
struct WirePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

impl WireResponse {
    fn text(&self) -> String {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
            .filter_map(|p| p.text.as_deref())
            .collect()
    }

    fn finish(&self) -> Option<FinishReason> {
        map_finish_reason(
            self.candidates
                .first()
                .and_then(|c| c.finish_reason.as_deref()),
        )
    }

    fn usage(&self) -> Option<CompletionUsage> {
        self.usage_metadata
            .map(|u| CompletionUsage::new(u.prompt_token_count, u.candidates_token_count))
    }
}

#[derive(Debug, Deserialize)]
struct WireEmbedResponse {
    embeddings: Vec<WireEmbedding>,
}

#[derive(Debug, Deserialize)]
struct WireEmbedding {
    values: Vec<f32>,
}

#[async_trait::async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    #[instrument(skip_all, fields(model = %request.model, routing_id = %deployment.routing_id))]
    async fn chat(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> Result<ChatResponse> {
        let url = format!(
            "{}/models/{}:generateContent",
            Self::base(deployment),
            deployment.routing_id
        );
        debug!(%url, "unary chat request");
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&Self::body(request))
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
                content: Some(wire.text()),
                reasoning_content: None,
                tool_calls: Vec::new(),
            },
            wire.finish(),
            wire.usage(),
        ))
    }

    #[instrument(skip_all, fields(model = %request.model, routing_id = %deployment.routing_id))]
    async fn chat_stream(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> Result<ChunkStream> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            Self::base(deployment),
            deployment.routing_id
        );
        debug!(%url, "streaming chat request");
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&Self::body(request))
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
                    Ok(line) => match serde_json::from_str::<WireResponse>(&line) {
                        Ok(wire) => {
                            let text = wire.text();
                            let finish = wire.finish();
                            if text.is_empty() && finish.is_none() {
                                return None;
                            }
                            let mut chunk = ChatChunk::content(&stream_id, &model, text);
                            chunk.choices[0].finish_reason = finish;
                            chunk.usage = wire.usage();
                            Some(Ok(chunk))
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
        api_key: &str,
    ) -> Result<EmbeddingResponse> {
        let url = format!(
            "{}/models/{}:batchEmbedContents",
            Self::base(deployment),
            deployment.routing_id
        );
        let requests: Vec<serde_json::Value> = request
            .input
            .texts()
            .iter()
            .map(|text| {
                let mut r = json!({
                    "model": format!("models/{}", deployment.routing_id),
                    "content": {"parts": [{"text": text}]},
                });
                if let Some(dims) = request.dimensions {
                    r.as_object_mut()
                        .expect("embed request is an object")
                        .insert("outputDimensionality".to_string(), json!(dims));
                }
                r
            })
            .collect();

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&json!({"requests": requests}))
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
        let token_estimate: u32 = request
            .input
            .texts()
            .iter()
            .map(|t| crate::token::count_tokens(t) as u32)
            .sum();
        Ok(EmbeddingResponse {
            object: "list".to_string(),
            data: wire
                .embeddings
                .into_iter()
                .enumerate()
                .map(|(i, e)| EmbeddingData {
                    object: "embedding".to_string(),
                    embedding: match request.encoding_format {
                        crate::types::EncodingFormat::Float => EmbeddingVector::Float(e.values),
                        crate::types::EncodingFormat::Base64 => {
                            EmbeddingVector::base64_from_floats(&e.values)
                        }
                    },
                    index: i as u32,
                })
                .collect(),
            model: request.model.clone(),
            usage: EmbeddingUsage {
                prompt_tokens: token_estimate,
                total_tokens: token_estimate,
            },
        })
    }

    async fn rerank(
        &self,
        _request: &RerankRequest,
        _deployment: &Deployment,
        _api_key: &str,
    ) -> Result<RerankResponse> {
        Err(Error::BadInput("gemini does not serve reranking".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    #[test]
    fn test_body_roles_and_system() {
        let req = ChatRequest::new(
            "gemini/gemini-2.0-flash",
            vec![
                ChatMessage::system("be terse"),
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
            ],
        )
        .with_max_tokens(8);
        let body = GeminiAdapter::body(&req);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 8);
    }

    #[test]
    fn test_data_uri_becomes_inline_data() {
        let parts = convert_parts(&MessageContent::Parts(vec![ContentPart::image_url(
            "data:image/jpeg;base64,Zm9v",
        )]));
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/jpeg");

        let parts = convert_parts(&MessageContent::Parts(vec![ContentPart::image_url(
            "https://example.com/a.jpg",
        )]));
        assert_eq!(parts[0]["fileData"]["fileUri"], "https://example.com/a.jpg");
    }

    #[test]
    fn test_wire_response_text_and_usage() {
        let wire: WireResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hi"}]},"finishReason":"STOP"}],
                "usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":1}}"#,
        )
        .unwrap();
        assert_eq!(wire.text(), "Hi");
        assert_eq!(wire.finish(), Some(FinishReason::Stop));
        assert_eq!(wire.usage().unwrap().total_tokens, 4);
    }
}
