//! Server configuration
//!
//! Everything comes from the environment (optionally via `.env`). Flat keys
//! map one-to-one onto env var names: `JAMAI_PORT`, `SERVICE_KEY`,
//! `S3_ENDPOINT`, `CLICKHOUSE_URL`, `IS_CLOUD`, provider API keys.

use config::{Config, Environment};
use serde::Deserialize;

/// Process configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    pub jamai_host: String,
    /// Bind port
    pub jamai_port: u16,
    /// SQLite database URL
    pub database_url: String,
    /// Bearer key for the admin surface; empty disables it
    pub service_key: String,
    /// Key for encrypting org external keys at rest (held for the external
    /// org database collaborator)
    pub encryption_key: String,
    /// Cloud mode enforces quotas and credits; self-hosted does not
    pub is_cloud: bool,
    /// Analytics buffer flush threshold
    pub clickhouse_max_buffer_queue_size: usize,
    /// ClickHouse endpoint (analytics sink collaborator)
    pub clickhouse_url: String,
    /// Object store endpoint (file storage collaborator)
    pub s3_endpoint: String,
    /// Object store bucket
    pub s3_bucket: String,
    /// Cap on concurrent cell generations
    pub concurrent_cell_limit: usize,
    /// Process-level OpenAI key
    pub openai_api_key: String,
    /// Process-level Anthropic key
    pub anthropic_api_key: String,
    /// Process-level Gemini key
    pub gemini_api_key: String,
    /// Process-level Cohere key
    pub cohere_api_key: String,
}

impl ServerConfig {
    /// Load from the environment with defaults.
    pub fn load() -> anyhow::Result<Self> {
        let config = Config::builder()
            .set_default("jamai_host", "0.0.0.0")?
            .set_default("jamai_port", 6969)?
            .set_default("database_url", "sqlite://jamai.db")?
            .set_default("service_key", "")?
            .set_default("encryption_key", "")?
            .set_default("is_cloud", false)?
            .set_default("clickhouse_max_buffer_queue_size", 1000)?
            .set_default("clickhouse_url", "")?
            .set_default("s3_endpoint", "")?
            .set_default("s3_bucket", "")?
            .set_default("concurrent_cell_limit", 8)?
            .set_default("openai_api_key", "")?
            .set_default("anthropic_api_key", "")?
            .set_default("gemini_api_key", "")?
            .set_default("cohere_api_key", "")?
            .add_source(Environment::default().try_parsing(true))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
