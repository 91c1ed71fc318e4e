//! Usage events and the analytics buffer
//!
//! Usage events carry UUIDv7 ids so the analytics store can deduplicate
//! replayed inserts. The buffer is bounded; exceeding the limit flushes
//! synchronously into the sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Billable product types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    /// LLM tokens (million tokens)
    LlmTokens,
    /// Embedding tokens (million tokens)
    EmbeddingTokens,
    /// Reranker searches (thousand searches)
    RerankerSearches,
    /// Network egress (GiB)
    Egress,
    /// Database storage (GiB, snapshot)
    DbStorage,
    /// File storage (GiB, snapshot)
    FileStorage,
}

impl ProductType {
    /// Every product type.
    pub const ALL: [ProductType; 6] = [
        ProductType::LlmTokens,
        ProductType::EmbeddingTokens,
        ProductType::RerankerSearches,
        ProductType::Egress,
        ProductType::DbStorage,
        ProductType::FileStorage,
    ];

    /// Stable snake_case name, matching the serde representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmTokens => "llm_tokens",
            Self::EmbeddingTokens => "embedding_tokens",
            Self::RerankerSearches => "reranker_searches",
            Self::Egress => "egress",
            Self::DbStorage => "db_storage",
            Self::FileStorage => "file_storage",
        }
    }
}

/// One usage event bound for the analytics store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageData {
    /// Event ID (UUIDv7; the sink tolerates duplicate inserts)
    pub id: Uuid,
    /// Billed organization
    pub organization_id: String,
    /// Project the usage happened in
    pub project_id: String,
    /// Product
    pub product: ProductType,
    /// Amount in the product's native unit
    pub amount: f64,
    /// Model involved, when applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Dollar cost charged for this event
    pub cost_usd: f64,
    /// Event time
    pub created_at: DateTime<Utc>,
}

impl UsageData {
    /// Create an event stamped with a fresh UUIDv7 and the current time.
    #[must_use]
    pub fn new(
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
        product: ProductType,
        amount: f64,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            organization_id: organization_id.into(),
            project_id: project_id.into(),
            product,
            amount,
            model_id: None,
            cost_usd: 0.0,
            created_at: Utc::now(),
        }
    }
}

/// Where flushed usage events go (ClickHouse in production)
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Append a batch of events. Must tolerate duplicate IDs.
    async fn write(&self, events: Vec<UsageData>) -> std::io::Result<()>;
}

/// Sink that logs events through tracing; stands in for ClickHouse.
pub struct TracingSink;

#[async_trait::async_trait]
impl AnalyticsSink for TracingSink {
    async fn write(&self, events: Vec<UsageData>) -> std::io::Result<()> {
        for event in &events {
            debug!(
                event_id = %event.id,
                org = %event.organization_id,
                product = event.product.as_str(),
                amount = event.amount,
                cost_usd = event.cost_usd,
                "usage event"
            );
        }
        Ok(())
    }
}

/// Bounded multi-producer buffer of usage events
pub struct EventBuffer {
    queue: Mutex<VecDeque<UsageData>>,
    max_size: usize,
    sink: Arc<dyn AnalyticsSink>,
}

impl EventBuffer {
    /// Create a buffer flushing into `sink` once `max_size` is exceeded.
    #[must_use]
    pub fn new(max_size: usize, sink: Arc<dyn AnalyticsSink>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            max_size,
            sink,
        }
    }

    /// Enqueue an event; flushes synchronously when the buffer is over its
    /// limit. Sink failures are logged and never propagate.
    pub async fn push(&self, event: UsageData) {
        let drained = {
            let mut queue = self.queue.lock().await;
            queue.push_back(event);
            if queue.len() > self.max_size {
                queue.drain(..).collect::<Vec<_>>()
            } else {
                Vec::new()
            }
        };
        if !drained.is_empty() {
            self.write(drained).await;
        }
    }

    /// Flush everything currently buffered.
    pub async fn flush(&self) {
        let drained = {
            let mut queue = self.queue.lock().await;
            queue.drain(..).collect::<Vec<_>>()
        };
        if !drained.is_empty() {
            self.write(drained).await;
        }
    }

    /// Number of buffered events.
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Whether the buffer is empty.
    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    async fn write(&self, events: Vec<UsageData>) {
        let count = events.len();
        if let Err(e) = self.sink.write(events).await {
            warn!(error = %e, count, "analytics flush failed; events dropped");
        }
    }
}
