//! Anthropic adapter
//!
//! Translates canonical chat requests to the `/v1/messages` wire format.
//! Anthropic has no embedding or rerank surface; those calls fail with
//! `BadInput` and the registry should never route them here.

use super::http::{map_status_error, sse_data_lines};
use super::{ChunkStream, ProviderAdapter};
use crate::error::{Error, Result};
use crate::registry::Deployment;
use crate::types::{
    AssistantMessage, ChatChunk, ChatRequest, ChatResponse, ChunkChoice, ChunkDelta,
    CompletionUsage, ContentPart, EmbeddingRequest, EmbeddingResponse, FinishReason,
    MessageContent, MessageRole, RerankRequest, RerankResponse, ToolCall, ToolCallFunction,
};
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Claude adapter
pub struct AnthropicAdapter {
    client: Client,
}

impl AnthropicAdapter {
    /// Create a new adapter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    fn url(deployment: &Deployment) -> String {
        let base = if deployment.api_base.is_empty() {
            DEFAULT_API_BASE
        } else {
            deployment.api_base.trim_end_matches('/')
        };
        format!("{base}/v1/messages")
    }

    fn body(request: &ChatRequest, deployment: &Deployment, stream: bool) -> serde_json::Value {
        let (system, messages) = convert_messages(&request.messages);
        let mut body = json!({
            "model": deployment.routing_id,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });
        let obj = body.as_object_mut().expect("message body is an object");
        if !system.is_empty() {
            obj.insert("system".to_string(), json!(system));
        }
        if let Some(t) = request.temperature {
            obj.insert("temperature".to_string(), json!(t));
        }
        if let Some(p) = request.top_p {
            obj.insert("top_p".to_string(), json!(p));
        }
        if let Some(stop) = &request.stop {
            obj.insert("stop_sequences".to_string(), json!(stop));
        }
        if let Some(tools) = &request.tools {
            let tools: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.function.name,
                        "description": t.function.description,
                        "input_schema": t.function.parameters,
                    })
                })
                .collect();
            obj.insert("tools".to_string(), json!(tools));
        }
        if stream {
            obj.insert("stream".to_string(), json!(true));
        }
        body
    }
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Split canonical messages into (system, anthropic messages).
fn convert_messages(messages: &[crate::types::ChatMessage]) -> (String, Vec<serde_json::Value>) {
    let mut system = Vec::new();
    let mut converted = Vec::new();
    for message in messages {
        match message.role {
            MessageRole::System => system.push(message.content.as_text()),
            MessageRole::User | MessageRole::Tool => converted.push(json!({
                "role": "user",
                "content": convert_content(&message.content),
            })),
            MessageRole::Assistant => converted.push(json!({
                "role": "assistant",
                "content": convert_content(&message.content),
            })),
        }
    }
    (system.join("\n\n"), converted)
}

fn convert_content(content: &MessageContent) -> serde_json::Value {
    match content {
        MessageContent::Text(s) => json!(s),
        MessageContent::Parts(parts) => {
            let blocks: Vec<serde_json::Value> = parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
                    ContentPart::ImageUrl { image_url } => Some(convert_image(&image_url.url)),
                    // Anthropic has no audio input block
                    ContentPart::InputAudio { .. } => None,
                })
                .collect();
            json!(blocks)
        }
    }
}

fn convert_image(url: &str) -> serde_json::Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data},
            });
        }
    }
    json!({
        "type": "image",
        "source": {"type": "url", "url": url},
    })
}

fn map_stop_reason(reason: Option<&str>) -> Option<FinishReason> {
    match reason? {
        "max_tokens" => Some(FinishReason::Length),
        "tool_use" => Some(FinishReason::ToolCalls),
        _ => Some(FinishReason::Stop),
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: String,
    content: Vec<WireBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    MessageStart {
        message: WireStartMessage,
    },
    ContentBlockDelta {
        delta: WireDelta,
    },
    MessageDelta {
        #[serde(default)]
        delta: WireStopDelta,
        #[serde(default)]
        usage: WireUsage,
    },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireStartMessage {
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct WireStopDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[async_trait::async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    #[instrument(skip_all, fields(model = %request.model, routing_id = %deployment.routing_id))]
    async fn chat(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> Result<ChatResponse> {
        let url = Self::url(deployment);
        debug!(%url, "unary chat request");
        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
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

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();
        for block in wire.content {
            match block {
                WireBlock::Text { text } => content.push_str(&text),
                WireBlock::Thinking { thinking } => reasoning.push_str(&thinking),
                WireBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    kind: "function".to_string(),
                    function: ToolCallFunction {
                        name,
                        arguments: input.to_string(),
                    },
                }),
                WireBlock::Other => {}
            }
        }

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
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                    tool_calls,
                },
                finish_reason: map_stop_reason(wire.stop_reason.as_deref()),
            }],
            usage: Some(CompletionUsage::new(
                wire.usage.input_tokens,
                wire.usage.output_tokens,
            )),
        })
    }

    #[instrument(skip_all, fields(model = %request.model, routing_id = %deployment.routing_id))]
    async fn chat_stream(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> Result<ChunkStream> {
        let url = Self::url(deployment);
        debug!(%url, "streaming chat request");
        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
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
        // Anthropic reports input tokens on message_start and output tokens on
        // message_delta; carry them across events to build the tail chunk.
        let state = (0_u32, None::<FinishReason>);
        let stream = sse_data_lines(response)
            .scan(state, move |(input_tokens, finish), item| {
                let model = model.clone();
                let stream_id = stream_id.clone();
                let out = match item {
                    Ok(line) => match serde_json::from_str::<WireEvent>(&line) {
                        Ok(WireEvent::MessageStart { message }) => {
                            *input_tokens = message.usage.input_tokens;
                            Some(None)
                        }
                        Ok(WireEvent::ContentBlockDelta { delta }) => match delta {
                            WireDelta::TextDelta { text } => {
                                Some(Some(Ok(ChatChunk::content(&stream_id, &model, text))))
                            }
                            WireDelta::ThinkingDelta { thinking } => Some(Some(Ok(ChatChunk {
                                id: stream_id.clone(),
                                object: "chat.completion.chunk".to_string(),
                                created: chrono::Utc::now().timestamp(),
                                model: model.clone(),
                                choices: vec![ChunkChoice {
                                    index: 0,
                                    delta: ChunkDelta {
                                        reasoning_content: Some(thinking),
                                        ..Default::default()
                                    },
                                    finish_reason: None,
                                }],
                                usage: None,
                            }))),
                            WireDelta::Other => Some(None),
                        },
                        Ok(WireEvent::MessageDelta { delta, usage }) => {
                            *finish = map_stop_reason(delta.stop_reason.as_deref());
                            let tail = ChatChunk::tail(
                                &stream_id,
                                &model,
                                finish.unwrap_or(FinishReason::Stop),
                                Some(CompletionUsage::new(*input_tokens, usage.output_tokens)),
                            );
                            Some(Some(Ok(tail)))
                        }
                        Ok(WireEvent::MessageStop) | Ok(WireEvent::Other) => Some(None),
                        Err(e) => Some(Some(Err(Error::InvalidResponse(e.to_string())))),
                    },
                    Err(e) => Some(Some(Err(e))),
                };
                futures::future::ready(out)
            })
            .filter_map(futures::future::ready);
        Ok(Box::pin(stream))
    }

    async fn embed(
        &self,
        _request: &EmbeddingRequest,
        _deployment: &Deployment,
        _api_key: &str,
    ) -> Result<EmbeddingResponse> {
        Err(Error::BadInput(
            "anthropic does not serve embeddings".to_string(),
        ))
    }

    async fn rerank(
        &self,
        _request: &RerankRequest,
        _deployment: &Deployment,
        _api_key: &str,
    ) -> Result<RerankResponse> {
        Err(Error::BadInput(
            "anthropic does not serve reranking".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Provider;
    use crate::types::ChatMessage;

    #[test]
    fn test_system_messages_lifted_out() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ];
        let (system, converted) = convert_messages(&messages);
        assert_eq!(system, "be brief");
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0]["role"], "user");
        assert_eq!(converted[1]["role"], "assistant");
    }

    #[test]
    fn test_data_uri_becomes_base64_source() {
        let block = convert_image("data:image/png;base64,aGVsbG8=");
        assert_eq!(block["source"]["type"], "base64");
        assert_eq!(block["source"]["media_type"], "image/png");

        let block = convert_image("https://example.com/cat.png");
        assert_eq!(block["source"]["type"], "url");
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("end_turn")), Some(FinishReason::Stop));
        assert_eq!(
            map_stop_reason(Some("max_tokens")),
            Some(FinishReason::Length)
        );
        assert_eq!(
            map_stop_reason(Some("tool_use")),
            Some(FinishReason::ToolCalls)
        );
        assert_eq!(map_stop_reason(None), None);
    }

    #[test]
    fn test_body_requires_max_tokens() {
        let req = ChatRequest::new("anthropic/claude", vec![ChatMessage::user("hi")]);
        let d = Deployment::new("anthropic/claude", Provider::Anthropic, "claude-3-5");
        let body = AnthropicAdapter::body(&req, &d, false);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert!(body.get("system").is_none());
    }

    #[test]
    fn test_stream_event_decoding() {
        let event: WireEvent = serde_json::from_str(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            WireEvent::ContentBlockDelta {
                delta: WireDelta::TextDelta { .. }
            }
        ));

        let event: WireEvent =
            serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(event, WireEvent::Other));
    }
}
