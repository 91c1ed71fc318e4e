//! HTTP API assembly
//!
//! `/v1` carries the OpenAI-compatible serving surface plus the legacy
//! table router (a thin mount of the v2 handlers); `/v2/gen_tables` is the
//! canonical table surface; `/admin` is service-key gated.

pub mod admin;
pub mod error;
pub mod serving;
pub mod sse;
pub mod tables;

use crate::server::state::AppState;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

fn table_routes() -> Router<AppState> {
    Router::new()
        .route("/:table_type", post(tables::create_table).get(tables::list_tables))
        .route(
            "/:table_type/:table_id",
            get(tables::get_table).delete(tables::drop_table),
        )
        .route("/:table_type/rows/add", post(tables::add_rows))
        .route("/:table_type/rows/regen", post(tables::regen_rows))
        .route("/:table_type/rows/update", post(tables::update_row))
        .route("/:table_type/rows/delete", post(tables::delete_rows))
        .route("/:table_type/:table_id/rows", get(tables::list_rows))
        .route(
            "/:table_type/:table_id/rows/:row_id",
            get(tables::get_row),
        )
        .route("/:table_type/hybrid_search", post(tables::hybrid_search))
        .route("/:table_type/columns/add", post(tables::add_columns))
        .route("/:table_type/columns/drop", post(tables::drop_columns))
        .route("/:table_type/columns/rename", post(tables::rename_columns))
        .route(
            "/:table_type/columns/reorder",
            post(tables::reorder_columns),
        )
        .route(
            "/:table_type/gen_config/update",
            post(tables::update_gen_config),
        )
        .route("/:table_type/import_data", post(tables::import_data))
        .route(
            "/:table_type/:table_id/export_data",
            get(tables::export_data),
        )
}

fn admin_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/models",
            post(admin::upsert_model)
                .get(admin::list_models)
                .delete(admin::remove_model),
        )
        .route("/deployments", post(admin::add_deployment))
        .route("/deployments/remove", post(admin::remove_deployment))
        .route("/organizations", post(admin::create_org))
        .route(
            "/organizations/:org_id",
            get(admin::get_org)
                .delete(admin::delete_org)
                .patch(admin::patch_org),
        )
        .route(
            "/organizations/:org_id/quota_reset",
            post(admin::reset_quota),
        )
        .route(
            "/organizations/:org_id/api_keys",
            post(admin::create_api_key),
        )
        .route(
            "/organizations/:org_id/projects",
            post(admin::create_project),
        )
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(serving::chat_completions))
        .route("/v1/embeddings", post(serving::embeddings))
        .route("/v1/rerank", post(serving::rerank))
        .route("/v1/models", get(serving::list_models))
        .nest("/v1/gen_tables", table_routes())
        .nest("/v2/gen_tables", table_routes())
        .nest("/admin", admin_routes())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
