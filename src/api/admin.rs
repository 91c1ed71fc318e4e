//! Admin surface: model, deployment and organization management
//!
//! Guarded by the `SERVICE_KEY` bearer. These are the write paths of the
//! model registry and the org store.

use crate::api::error::{ApiError, ApiResult};
use crate::middleware::AuthContext;
use crate::server::state::AppState;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use jamai_billing::{Organization, Project};
use jamai_llm::{Deployment, ModelConfig};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

fn require_service(auth: &AuthContext) -> ApiResult<()> {
    if auth.is_service {
        Ok(())
    } else {
        Err(ApiError::forbidden("admin surface requires the service key"))
    }
}

// ============================================================================
// Models & deployments
// ============================================================================

/// `POST /admin/models`
pub async fn upsert_model(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(model): Json<ModelConfig>,
) -> ApiResult<Response> {
    require_service(&auth)?;
    state.registry.upsert_model(model.clone()).await?;
    Ok(Json(model).into_response())
}

/// `GET /admin/models`
pub async fn list_models(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Response> {
    require_service(&auth)?;
    let models = state.registry.list_all_models().await;
    Ok(Json(json!({"object": "list", "data": models})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ModelIdQuery {
    id: String,
}

/// `DELETE /admin/models?id=...`
pub async fn remove_model(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ModelIdQuery>,
) -> ApiResult<Response> {
    require_service(&auth)?;
    state.registry.remove_model(&query.id).await?;
    Ok(Json(json!({"ok": true})).into_response())
}

/// `POST /admin/deployments`
pub async fn add_deployment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(deployment): Json<Deployment>,
) -> ApiResult<Response> {
    require_service(&auth)?;
    state.registry.add_deployment(deployment.clone()).await?;
    Ok(Json(deployment).into_response())
}

#[derive(Debug, Deserialize)]
pub struct DeploymentRemoveRequest {
    model_id: String,
    deployment_id: String,
}

/// `POST /admin/deployments/remove`
pub async fn remove_deployment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<DeploymentRemoveRequest>,
) -> ApiResult<Response> {
    require_service(&auth)?;
    state
        .registry
        .remove_deployment(&request.model_id, &request.deployment_id)
        .await?;
    Ok(Json(json!({"ok": true})).into_response())
}

// ============================================================================
// Organizations & projects
// ============================================================================

/// `POST /admin/organizations`
pub async fn create_org(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(org): Json<Organization>,
) -> ApiResult<Response> {
    require_service(&auth)?;
    state.orgs.create_org(org.clone()).await?;
    Ok(Json(org).into_response())
}

/// `GET /admin/organizations/{org_id}`
pub async fn get_org(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(org_id): Path<String>,
) -> ApiResult<Response> {
    require_service(&auth)?;
    let org = state.orgs.get_org(&org_id).await?;
    Ok(Json(org).into_response())
}

#[derive(Debug, Deserialize)]
pub struct OrgPatch {
    #[serde(default)]
    credit: Option<f64>,
    #[serde(default)]
    credit_grant: Option<f64>,
    #[serde(default)]
    llm_tokens_quota_mtok: Option<f64>,
    #[serde(default)]
    external_keys: Option<HashMap<String, String>>,
}

/// `PATCH /admin/organizations/{org_id}`
pub async fn patch_org(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(org_id): Path<String>,
    Json(patch): Json<OrgPatch>,
) -> ApiResult<Response> {
    require_service(&auth)?;
    let org = state
        .orgs
        .update_org(&org_id, |org| {
            if let Some(credit) = patch.credit {
                org.credit = credit;
            }
            if let Some(grant) = patch.credit_grant {
                org.credit_grant = grant;
            }
            if let Some(quota) = patch.llm_tokens_quota_mtok {
                org.quotas.llm_tokens_quota_mtok = quota;
            }
            if let Some(keys) = patch.external_keys {
                org.external_keys = keys;
            }
        })
        .await?;
    Ok(Json(org).into_response())
}

/// `POST /admin/organizations/{org_id}/quota_reset`
pub async fn reset_quota(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(org_id): Path<String>,
) -> ApiResult<Response> {
    require_service(&auth)?;
    state.orgs.reset_quota(&org_id).await?;
    Ok(Json(json!({"ok": true})).into_response())
}

/// `POST /admin/organizations/{org_id}/api_keys`
pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(org_id): Path<String>,
) -> ApiResult<Response> {
    require_service(&auth)?;
    let key = state.orgs.create_api_key(&org_id).await?;
    Ok(Json(json!({"api_key": key})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ProjectCreateRequest {
    name: String,
    #[serde(default)]
    id: Option<String>,
}

/// `POST /admin/organizations/{org_id}/projects`
pub async fn create_project(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(org_id): Path<String>,
    Json(request): Json<ProjectCreateRequest>,
) -> ApiResult<Response> {
    require_service(&auth)?;
    let mut project = Project::new(&org_id, &request.name);
    if let Some(id) = request.id {
        project.id = id;
    }
    state.orgs.create_project(project.clone()).await?;
    Ok(Json(project).into_response())
}

/// `DELETE /admin/organizations/{org_id}`
pub async fn delete_org(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(org_id): Path<String>,
) -> ApiResult<Response> {
    require_service(&auth)?;
    state.orgs.delete_org(&org_id).await?;
    Ok(Json(json!({"ok": true})).into_response())
}
