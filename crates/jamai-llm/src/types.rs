//! Canonical serving types
//!
//! Requests, responses and streaming chunks shared by every provider
//! adapter. The shapes follow the OpenAI wire format so the `/v1` surface
//! can serialize them directly; adapters translate to vendor formats.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Messages
// ============================================================================

/// Role in a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System message (instructions)
    System,
    /// User message
    User,
    /// Assistant message
    Assistant,
    /// Tool response
    Tool,
}

impl MessageRole {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// An image reference in a multimodal message (URL or data URI)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// HTTP(S) URL or `data:<mime>;base64,...` URI
    pub url: String,
}

/// Base64 audio attached to a multimodal message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAudio {
    /// Base64-encoded audio bytes
    pub data: String,
    /// Audio format, e.g. "wav" or "mp3"
    pub format: String,
}

/// One part of a multimodal message content array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text
    Text {
        /// The text
        text: String,
    },
    /// Image by URL or data URI
    ImageUrl {
        /// The image reference
        image_url: ImageUrl,
    },
    /// Base64 audio
    InputAudio {
        /// The audio payload
        input_audio: InputAudio,
    },
}

impl ContentPart {
    /// Text part helper
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Image part helper
    #[must_use]
    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }
}

/// Message content: a plain string or an array of multimodal parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text content
    Text(String),
    /// Multimodal content parts
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Flatten to plain text, ignoring non-text parts.
    #[must_use]
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Whether the content is empty text with no parts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender
    pub role: MessageRole,
    /// Message content
    pub content: MessageContent,
    /// Name (for tool calls)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    /// Create a system message
    #[must_use]
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            name: None,
        }
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            name: None,
        }
    }

    /// Create an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            name: None,
        }
    }
}

// ============================================================================
// Tools
// ============================================================================

/// A function exposed to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    /// Function name
    pub name: String,
    /// Function description
    #[serde(default)]
    pub description: String,
    /// JSON schema for parameters
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Tool definition for function calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Always "function"
    #[serde(rename = "type")]
    pub kind: String,
    /// The function definition
    pub function: ToolFunction,
}

/// A tool call requested by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call ID
    pub id: String,
    /// Always "function"
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    /// Called function name and serialized arguments
    pub function: ToolCallFunction,
}

fn function_kind() -> String {
    "function".to_string()
}

/// The function half of a tool call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    /// Function name
    pub name: String,
    /// Arguments as a JSON string
    pub arguments: String,
}

// ============================================================================
// Chat
// ============================================================================

/// Why the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop or stop sequence
    Stop,
    /// `max_tokens` reached
    Length,
    /// The model requested tool calls
    ToolCalls,
    /// The prompt exceeded the context window
    ContextOverflow,
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionUsage {
    /// Prompt tokens
    pub prompt_tokens: u32,
    /// Completion tokens
    pub completion_tokens: u32,
    /// Total tokens
    pub total_tokens: u32,
}

impl CompletionUsage {
    /// Create a usage record; `total_tokens` is derived.
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Chat completion request (canonical, OpenAI-shaped)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Request ID for logging; generated when empty
    #[serde(default)]
    pub id: String,
    /// Model ID (`provider/name`); empty selects the default model
    #[serde(default)]
    pub model: String,
    /// Messages in the conversation
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling probability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Stop sequences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Available tools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    /// Whether to stream the response as SSE
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// Create a request for a model with the given messages.
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            id: String::new(),
            model: model.into(),
            messages,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            tools: None,
            stream: false,
        }
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// The assistant message of a completed choice
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantMessage {
    /// Always "assistant"
    #[serde(default = "assistant_role")]
    pub role: String,
    /// Generated text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Reasoning trace, surfaced verbatim when the provider exposes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Requested tool calls
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

fn assistant_role() -> String {
    "assistant".to_string()
}

/// One completed choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    /// Choice index
    pub index: u32,
    /// The generated message
    pub message: AssistantMessage,
    /// Why generation stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// Chat completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Response ID
    pub id: String,
    /// Always "chat.completion"
    pub object: String,
    /// Unix timestamp
    pub created: i64,
    /// Model that produced the response
    pub model: String,
    /// Choices (always exactly one)
    pub choices: Vec<ChatChoice>,
    /// Token usage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<CompletionUsage>,
}

impl ChatResponse {
    /// Build a single-choice response.
    #[must_use]
    pub fn new(
        model: impl Into<String>,
        message: AssistantMessage,
        finish_reason: Option<FinishReason>,
        usage: Option<CompletionUsage>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            choices: vec![ChatChoice {
                index: 0,
                message,
                finish_reason,
            }],
            usage,
        }
    }

    /// Text of the first choice, or empty string.
    #[must_use]
    pub fn text(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or("")
    }
}

/// Incremental delta inside a streaming chunk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Role, present on the first chunk only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Reasoning fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Tool call fragments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
}

/// One choice of a streaming chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Choice index
    pub index: u32,
    /// The incremental delta
    pub delta: ChunkDelta,
    /// Set on the last content chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// A streamed chat completion chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Response ID, stable across the stream
    pub id: String,
    /// Always "chat.completion.chunk"
    pub object: String,
    /// Unix timestamp
    pub created: i64,
    /// Model that produced the chunk
    pub model: String,
    /// Choices (always exactly one)
    pub choices: Vec<ChunkChoice>,
    /// Usage, present on the usage-only tail chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<CompletionUsage>,
}

impl ChatChunk {
    /// A content chunk.
    #[must_use]
    pub fn content(id: &str, model: &str, text: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    content: Some(text.into()),
                    ..Default::default()
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// The usage-only tail chunk that closes a stream.
    #[must_use]
    pub fn tail(
        id: &str,
        model: &str,
        finish_reason: FinishReason,
        usage: Option<CompletionUsage>,
    ) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some(finish_reason),
            }],
            usage,
        }
    }

    /// Content fragment of the first choice, if any.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.delta.content.as_deref())
    }
}

// ============================================================================
// Embeddings
// ============================================================================

/// Input to an embedding request: one text or a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    /// A single text
    One(String),
    /// A batch of texts
    Many(Vec<String>),
}

impl EmbeddingInput {
    /// View as a slice of texts.
    #[must_use]
    pub fn texts(&self) -> Vec<&str> {
        match self {
            Self::One(s) => vec![s.as_str()],
            Self::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

/// Requested vector encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingFormat {
    /// Plain float array
    #[default]
    Float,
    /// Base64-packed little-endian f32
    Base64,
}

/// Embedding request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Model ID (`provider/name`)
    pub model: String,
    /// Text(s) to embed
    pub input: EmbeddingInput,
    /// Matryoshka dimension override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
    /// Output encoding
    #[serde(default)]
    pub encoding_format: EncodingFormat,
}

/// One embedding vector, float or base64 encoded
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingVector {
    /// Plain float array
    Float(Vec<f32>),
    /// Base64-packed little-endian f32
    Base64(String),
}

impl EmbeddingVector {
    /// Decode to floats regardless of encoding.
    #[must_use]
    pub fn to_floats(&self) -> Vec<f32> {
        match self {
            Self::Float(v) => v.clone(),
            Self::Base64(s) => {
                use base64::Engine;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .unwrap_or_default();
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect()
            }
        }
    }

    /// Re-encode floats as base64-packed little-endian f32.
    #[must_use]
    pub fn base64_from_floats(floats: &[f32]) -> Self {
        use base64::Engine;
        let mut bytes = Vec::with_capacity(floats.len() * 4);
        for f in floats {
            bytes.extend_from_slice(&f.to_le_bytes());
        }
        Self::Base64(base64::engine::general_purpose::STANDARD.encode(bytes))
    }
}

/// One embedding result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingData {
    /// Always "embedding"
    pub object: String,
    /// The vector
    pub embedding: EmbeddingVector,
    /// Index of the corresponding input
    pub index: u32,
}

/// Embedding usage
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EmbeddingUsage {
    /// Prompt tokens
    pub prompt_tokens: u32,
    /// Total tokens
    pub total_tokens: u32,
}

/// Embedding response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// Always "list"
    pub object: String,
    /// Embeddings, one per input, in input order
    pub data: Vec<EmbeddingData>,
    /// Model that produced the embeddings
    pub model: String,
    /// Token usage
    pub usage: EmbeddingUsage,
}

// ============================================================================
// Reranking
// ============================================================================

/// Rerank request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankRequest {
    /// Model ID (`provider/name`)
    pub model: String,
    /// The search query
    pub query: String,
    /// Documents to score against the query
    pub documents: Vec<String>,
    /// Keep only the top N results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<u32>,
}

/// One rerank result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankResult {
    /// Always "reranking"
    pub object: String,
    /// Index into the request's `documents`
    pub index: u32,
    /// Relevance of the document to the query
    pub relevance_score: f32,
}

/// Rerank billing units
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RerankUsage {
    /// Number of searches billed
    pub search_units: u32,
}

/// Rerank response metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RerankMeta {
    /// Model that produced the scores
    pub model: String,
    /// Provider-reported billed units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billed_units: Option<u32>,
    /// Provider-reported token count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
}

/// Rerank response; results are sorted by `relevance_score` descending
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankResponse {
    /// Always "list"
    pub object: String,
    /// Scored documents, best first
    pub results: Vec<RerankResult>,
    /// Billing units
    pub usage: RerankUsage,
    /// Metadata
    pub meta: RerankMeta,
}

impl RerankResponse {
    /// Sort results by relevance descending (provider contract).
    pub fn sort(&mut self) {
        self.results.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
}

// ============================================================================
// References (RAG side channel)
// ============================================================================

/// A retrieved piece of knowledge-table text with its provenance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chunk {
    /// Chunk text
    pub text: String,
    /// Document title
    #[serde(default)]
    pub title: String,
    /// Page number, if the chunk came from a paginated document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    /// Source file name
    #[serde(default)]
    pub file_name: String,
    /// Source document ID
    #[serde(default)]
    pub document_id: String,
    /// Chunk ID (the knowledge-table row ID)
    #[serde(default)]
    pub chunk_id: String,
}

/// RAG retrieval result attached to a generated cell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct References {
    /// Always "chat.references"
    pub object: String,
    /// Retrieved chunks, best first
    pub chunks: Vec<Chunk>,
    /// The query used against the Knowledge Table
    pub search_query: String,
}

impl References {
    /// Build a references record.
    #[must_use]
    pub fn new(chunks: Vec<Chunk>, search_query: impl Into<String>) -> Self {
        Self {
            object: "chat.references".to_string(),
            chunks,
            search_query: search_query.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_content_untagged() {
        let text: MessageContent = serde_json::from_str(r#""hello""#).unwrap();
        assert_eq!(text.as_text(), "hello");

        let parts: MessageContent = serde_json::from_str(
            r#"[{"type":"text","text":"hi "},{"type":"image_url","image_url":{"url":"http://x/y.png"}}]"#,
        )
        .unwrap();
        assert_eq!(parts.as_text(), "hi ");
    }

    #[test]
    fn test_finish_reason_serde() {
        assert_eq!(
            serde_json::to_string(&FinishReason::ContextOverflow).unwrap(),
            r#""context_overflow""#
        );
        assert_eq!(
            serde_json::to_string(&FinishReason::ToolCalls).unwrap(),
            r#""tool_calls""#
        );
    }

    #[test]
    fn test_chunk_helpers() {
        let chunk = ChatChunk::content("id-1", "openai/gpt", "hi");
        assert_eq!(chunk.text(), Some("hi"));
        assert_eq!(chunk.object, "chat.completion.chunk");

        let tail = ChatChunk::tail("id-1", "openai/gpt", FinishReason::Stop, None);
        assert_eq!(tail.text(), None);
        assert_eq!(tail.choices[0].finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn test_embedding_vector_roundtrip() {
        let floats = vec![0.5_f32, -1.25, 3.0];
        let encoded = EmbeddingVector::base64_from_floats(&floats);
        assert_eq!(encoded.to_floats(), floats);
    }

    #[test]
    fn test_rerank_sort_descending() {
        let mut resp = RerankResponse {
            object: "list".to_string(),
            results: vec![
                RerankResult {
                    object: "reranking".to_string(),
                    index: 0,
                    relevance_score: 0.1,
                },
                RerankResult {
                    object: "reranking".to_string(),
                    index: 1,
                    relevance_score: 0.9,
                },
            ],
            usage: RerankUsage::default(),
            meta: RerankMeta::default(),
        };
        resp.sort();
        assert_eq!(resp.results[0].index, 1);
    }

    #[test]
    fn test_usage_total_derived() {
        let usage = CompletionUsage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
    }
}
