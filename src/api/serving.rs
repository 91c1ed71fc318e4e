//! `/v1` serving surface: chat completions, embeddings, reranking
//!
//! These handlers gate on quota, resolve the model (empty model ID picks
//! the default), route through the deployment router and hand usage to the
//! billing manager, which processes in the background after the response.

use crate::api::error::{ApiError, ApiResult};
use crate::middleware::AuthContext;
use crate::server::state::AppState;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures::StreamExt;
use jamai_billing::{BillingManager, ProductType};
use jamai_llm::{
    Capability, ChatRequest, EmbeddingRequest, ModelType, RerankRequest,
};
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument};

fn billing_for(state: &AppState, auth: &AuthContext) -> BillingManager {
    BillingManager::new(
        state.orgs.clone(),
        state.buffer.clone(),
        state.mode,
        auth.organization_id.clone(),
        auth.project_id.clone(),
    )
}

/// `POST /v1/chat/completions`
#[instrument(skip_all, fields(org = %auth.organization_id, model = %request.model, stream = request.stream))]
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(mut request): Json<ChatRequest>,
) -> ApiResult<Response> {
    if request.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }
    let opts = auth.route_options();
    let model = state
        .registry
        .resolve_model(
            &opts.organization_id,
            &request.model,
            ModelType::Llm,
            &[Capability::Chat],
        )
        .await?;
    request.model = model.id.clone();

    let mut billing = billing_for(&state, &auth);
    billing.check_quota(&model, ProductType::LlmTokens).await?;

    if request.stream {
        let mut stream = state.router.chat_stream(&opts, &request).await?;
        let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => {
                        if let Some(usage) = chunk.usage {
                            billing.record_llm_usage(
                                &model,
                                usage.prompt_tokens,
                                usage.completion_tokens,
                            );
                        }
                        let data = match serde_json::to_string(&chunk) {
                            Ok(data) => data,
                            Err(_) => continue,
                        };
                        billing.record_egress(data.len() as u64);
                        if tx.send(Ok(Event::default().data(data))).await.is_err() {
                            // Client went away; stop reading the provider.
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "stream ended with error");
                        break;
                    }
                }
            }
            let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
            billing.process_all().await;
        });
        Ok(Sse::new(ReceiverStream::new(rx)).into_response())
    } else {
        let response = state.router.chat(&opts, &request).await?;
        if let Some(usage) = response.usage {
            billing.record_llm_usage(&model, usage.prompt_tokens, usage.completion_tokens);
        }
        billing.record_egress(serde_json::to_vec(&response).map(|b| b.len()).unwrap_or(0) as u64);
        tokio::spawn(billing.process_all());
        Ok(Json(response).into_response())
    }
}

/// `POST /v1/embeddings`
#[instrument(skip_all, fields(org = %auth.organization_id, model = %request.model))]
pub async fn embeddings(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(mut request): Json<EmbeddingRequest>,
) -> ApiResult<Response> {
    let opts = auth.route_options();
    let model = state
        .registry
        .resolve_model(
            &opts.organization_id,
            &request.model,
            ModelType::Embed,
            &[Capability::Embed],
        )
        .await?;
    request.model = model.id.clone();

    let mut billing = billing_for(&state, &auth);
    billing
        .check_quota(&model, ProductType::EmbeddingTokens)
        .await?;

    let response = state.router.embed(&opts, &request).await?;
    billing.record_embed_usage(&model, response.usage.total_tokens);
    tokio::spawn(billing.process_all());
    Ok(Json(response).into_response())
}

/// `POST /v1/rerank`
#[instrument(skip_all, fields(org = %auth.organization_id, model = %request.model))]
pub async fn rerank(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(mut request): Json<RerankRequest>,
) -> ApiResult<Response> {
    if request.documents.is_empty() {
        return Err(ApiError::bad_request("documents must not be empty"));
    }
    let opts = auth.route_options();
    let model = state
        .registry
        .resolve_model(
            &opts.organization_id,
            &request.model,
            ModelType::Rerank,
            &[Capability::Rerank],
        )
        .await?;
    request.model = model.id.clone();

    let mut billing = billing_for(&state, &auth);
    billing
        .check_quota(&model, ProductType::RerankerSearches)
        .await?;

    let response = state.router.rerank(&opts, &request).await?;
    billing.record_rerank_usage(&model, 1);
    tokio::spawn(billing.process_all());
    Ok(Json(response).into_response())
}

/// `GET /v1/models`
pub async fn list_models(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Response> {
    let models = state
        .registry
        .list_models(&auth.organization_id, None, &[])
        .await;
    Ok(Json(json!({"object": "list", "data": models})).into_response())
}
