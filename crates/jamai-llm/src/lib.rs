//! JamAI LLM - Model Registry, Provider Adapters and Routing
//!
//! This crate is the serving layer of JamAI:
//! - Registry: model configs, deployments, org allow/block filtering
//! - Providers: per-vendor adapters behind a narrow capability trait
//! - Router: weighted random pick with cooldown-on-failure and retries
//! - Types: canonical chat / embedding / rerank request and response shapes
//! - Token: tiktoken-based counting for context pre-checks

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod providers;
pub mod registry;
pub mod router;
pub mod token;
pub mod types;

pub use error::{Error, Result};
pub use providers::{AdapterSet, ChunkStream, Provider, ProviderAdapter};
pub use registry::{Capability, Deployment, ModelConfig, ModelRegistry, ModelType};
pub use router::{ModelRouter, RouteOptions};
pub use token::{count_message_tokens, count_tokens, TokenCounter};
pub use types::{
    AssistantMessage, ChatChoice, ChatChunk, ChatMessage, ChatRequest, ChatResponse, Chunk,
    ChunkChoice, ChunkDelta, CompletionUsage, ContentPart, EmbeddingData, EmbeddingInput,
    EmbeddingRequest, EmbeddingResponse, EmbeddingUsage, EmbeddingVector, EncodingFormat,
    FinishReason, ImageUrl, InputAudio, MessageContent, MessageRole, References, RerankMeta,
    RerankRequest, RerankResponse, RerankResult, RerankUsage, Tool, ToolCall, ToolCallFunction,
    ToolFunction,
};
