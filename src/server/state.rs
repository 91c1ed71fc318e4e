//! Shared application state

use super::config::ServerConfig;
use jamai_billing::{DeploymentMode, EventBuffer, Organization, OrgStore, Project, TracingSink};
use jamai_llm::{AdapterSet, ModelRegistry, ModelRouter, Provider};
use jamai_table::{DisabledCodeRunner, TableService, TableStore};
use std::sync::Arc;
use tracing::info;

/// Default org/project used when quota enforcement is off
pub const DEFAULT_ORG_ID: &str = "default";
/// Default project ID in self-hosted mode
pub const DEFAULT_PROJECT_ID: &str = "default";

/// Everything the handlers share
#[derive(Clone)]
pub struct AppState {
    /// Process configuration
    pub config: Arc<ServerConfig>,
    /// Model + deployment registry
    pub registry: Arc<ModelRegistry>,
    /// Deployment router
    pub router: Arc<ModelRouter>,
    /// Organizations, projects and API keys
    pub orgs: Arc<OrgStore>,
    /// Analytics event buffer
    pub buffer: Arc<EventBuffer>,
    /// Generative table service
    pub tables: Arc<TableService>,
    /// Quota enforcement mode
    pub mode: DeploymentMode,
}

impl AppState {
    /// Build the full state graph from configuration.
    pub async fn build(config: ServerConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(ModelRegistry::new());
        let router = Arc::new(
            ModelRouter::new(registry.clone(), AdapterSet::with_defaults())
                .with_process_key(Provider::Openai, config.openai_api_key.clone())
                .with_process_key(Provider::Anthropic, config.anthropic_api_key.clone())
                .with_process_key(Provider::Gemini, config.gemini_api_key.clone())
                .with_process_key(Provider::Cohere, config.cohere_api_key.clone()),
        );

        let orgs = Arc::new(OrgStore::new());
        let mode = if config.is_cloud {
            DeploymentMode::Cloud
        } else {
            DeploymentMode::Oss
        };
        if mode == DeploymentMode::Oss {
            orgs.create_org(Organization::new(DEFAULT_ORG_ID, "Default"))
                .await?;
            let mut project = Project::new(DEFAULT_ORG_ID, "Default");
            project.id = DEFAULT_PROJECT_ID.to_string();
            orgs.create_project(project).await?;
            info!("self-hosted mode: default organization seeded");
        }

        let buffer = Arc::new(EventBuffer::new(
            config.clickhouse_max_buffer_queue_size,
            Arc::new(TracingSink),
        ));

        let store = TableStore::connect(&config.database_url).await?;
        let tables = Arc::new(TableService::new(
            store,
            registry.clone(),
            router.clone(),
            Arc::new(DisabledCodeRunner),
            config.concurrent_cell_limit,
        ));

        Ok(Self {
            config: Arc::new(config),
            registry,
            router,
            orgs,
            buffer,
            tables,
            mode,
        })
    }
}
