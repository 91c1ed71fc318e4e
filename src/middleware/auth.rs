//! Bearer authentication
//!
//! Resolves the caller to an organization and project. Full token decoding
//! and RBAC live in an external collaborator; here an org API key (or the
//! `SERVICE_KEY`) is looked up directly. Self-hosted deployments fall back
//! to the default organization when no credentials are supplied.

use crate::api::error::ApiError;
use crate::server::state::{AppState, DEFAULT_ORG_ID, DEFAULT_PROJECT_ID};
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use jamai_billing::DeploymentMode;
use std::collections::HashMap;

/// The authenticated caller
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Resolved organization
    pub organization_id: String,
    /// Selected project (`X-PROJECT-ID` header)
    pub project_id: String,
    /// Whether the caller presented the service key
    pub is_service: bool,
    /// The org's provider keys, loaded once per request
    pub external_keys: HashMap<String, String>,
}

impl AuthContext {
    /// Routing options for the serving layer.
    #[must_use]
    pub fn route_options(&self) -> jamai_llm::RouteOptions {
        jamai_llm::RouteOptions {
            organization_id: self.organization_id.clone(),
            external_keys: self.external_keys.clone(),
        }
    }
}

fn bearer(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)?
        .to_str()
        .ok()
        .map(str::to_string)
}

/// Resolve the caller and stash an [`AuthContext`] extension.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer(&request);

    let context = match token {
        Some(token)
            if !state.config.service_key.is_empty() && token == state.config.service_key =>
        {
            let organization_id = header_value(&request, "X-ORGANIZATION-ID")
                .unwrap_or_else(|| DEFAULT_ORG_ID.to_string());
            AuthContext {
                organization_id,
                project_id: header_value(&request, "X-PROJECT-ID")
                    .unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string()),
                is_service: true,
                external_keys: HashMap::new(),
            }
        }
        Some(token) => {
            let organization_id = state
                .orgs
                .resolve_api_key(&token)
                .await
                .ok_or_else(|| ApiError::unauthenticated("invalid API key"))?;
            let org = state
                .orgs
                .get_org(&organization_id)
                .await
                .map_err(ApiError::from)?;
            AuthContext {
                organization_id,
                project_id: header_value(&request, "X-PROJECT-ID")
                    .unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string()),
                is_service: false,
                external_keys: org.external_keys,
            }
        }
        None if state.mode == DeploymentMode::Oss => {
            let org = state
                .orgs
                .get_org(DEFAULT_ORG_ID)
                .await
                .map_err(ApiError::from)?;
            AuthContext {
                organization_id: DEFAULT_ORG_ID.to_string(),
                project_id: header_value(&request, "X-PROJECT-ID")
                    .unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string()),
                is_service: false,
                external_keys: org.external_keys,
            }
        }
        None => return Err(ApiError::unauthenticated("missing bearer token")),
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
