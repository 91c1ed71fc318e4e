//! JamAI Billing - organizations, quotas, credits and usage accounting
//!
//! - Org store: organizations, projects, API keys, atomic counter updates
//! - Billing manager: per-request accumulator with pre-flight quota gates
//! - Events: bounded analytics buffer with a pluggable sink
//! - Metrics: usage counters emitted at process time

#![forbid(unsafe_code)]

pub mod error;
pub mod events;
pub mod manager;
pub mod metrics;
pub mod org;

pub use error::{Error, Result};
pub use events::{AnalyticsSink, EventBuffer, ProductType, TracingSink, UsageData};
pub use manager::{BillingManager, DeploymentMode};
pub use org::{Organization, OrgStore, Project, QuotasAndUsages};
