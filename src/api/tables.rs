//! `/v2/gen_tables` surface
//!
//! Schema CRUD, gen-config updates, row CRUD with streaming generation,
//! hybrid search and CSV import/export. The v1 router mounts these same
//! handlers behind the legacy path.

use crate::api::error::{ApiError, ApiResult, TableApiResult};
use crate::api::sse::cell_event_sse;
use crate::middleware::AuthContext;
use crate::server::state::AppState;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use jamai_billing::BillingManager;
use jamai_table::{
    ColumnSchema, CreateTableRequest, ExecContext, GenConfig, ListRowsParams, RegenStrategy,
    StoredRow, TableType,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

fn parse_table_type(raw: &str) -> ApiResult<TableType> {
    match raw {
        "action" => Ok(TableType::Action),
        "knowledge" => Ok(TableType::Knowledge),
        "chat" => Ok(TableType::Chat),
        other => Err(ApiError::bad_request(format!(
            "unknown table type: {other}"
        ))),
    }
}

fn exec_context(state: &AppState, auth: &AuthContext) -> ExecContext {
    ExecContext {
        project_id: auth.project_id.clone(),
        opts: auth.route_options(),
        billing: Arc::new(Mutex::new(BillingManager::new(
            state.orgs.clone(),
            state.buffer.clone(),
            state.mode,
            auth.organization_id.clone(),
            auth.project_id.clone(),
        ))),
    }
}

/// Flush a finished request's billing accumulator in the background.
fn flush_billing(ctx: ExecContext) {
    if let Ok(mutex) = Arc::try_unwrap(ctx.billing) {
        tokio::spawn(mutex.into_inner().process_all());
    }
}

fn rows_response(rows: &[StoredRow]) -> Value {
    let rendered: Vec<Value> = rows
        .iter()
        .map(|row| {
            let columns: Map<String, Value> = row
                .cells
                .iter()
                .map(|(col, cell)| {
                    (
                        col.clone(),
                        serde_json::to_value(cell).unwrap_or(Value::Null),
                    )
                })
                .collect();
            json!({
                "object": "gen_table.completion.chunks",
                "row_id": row.id,
                "columns": columns,
            })
        })
        .collect();
    json!({"object": "gen_table.completion.rows", "rows": rendered})
}

// ============================================================================
// Table lifecycle
// ============================================================================

/// `POST /v2/gen_tables/{type}`
pub async fn create_table(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(table_type): Path<String>,
    Json(request): Json<CreateTableRequest>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    let meta = state
        .tables
        .create_table(&auth.organization_id, &auth.project_id, table_type, request)
        .await?;
    Ok(Json(meta).into_response())
}

/// `GET /v2/gen_tables/{type}`
pub async fn list_tables(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(table_type): Path<String>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    let metas = state.tables.list_tables(&auth.project_id, table_type).await?;
    Ok(Json(json!({"object": "list", "items": metas})).into_response())
}

/// `GET /v2/gen_tables/{type}/{table_id}`
pub async fn get_table(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path((table_type, table_id)): Path<(String, String)>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    let meta = state
        .tables
        .get_table(&auth.project_id, table_type, &table_id)
        .await?;
    Ok(Json(meta).into_response())
}

/// `DELETE /v2/gen_tables/{type}/{table_id}`
pub async fn drop_table(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path((table_type, table_id)): Path<(String, String)>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    state
        .tables
        .drop_table(&auth.project_id, table_type, &table_id)
        .await?;
    Ok(Json(json!({"ok": true})).into_response())
}

// ============================================================================
// Schema mutations
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ColumnAddRequest {
    table_id: String,
    cols: Vec<ColumnSchema>,
}

/// `POST /v2/gen_tables/{type}/columns/add`
pub async fn add_columns(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(table_type): Path<String>,
    Json(request): Json<ColumnAddRequest>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    let meta = state
        .tables
        .add_columns(
            &auth.organization_id,
            &auth.project_id,
            table_type,
            &request.table_id,
            request.cols,
        )
        .await?;
    Ok(Json(meta).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ColumnDropRequest {
    table_id: String,
    column_ids: Vec<String>,
}

/// `POST /v2/gen_tables/{type}/columns/drop`
pub async fn drop_columns(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(table_type): Path<String>,
    Json(request): Json<ColumnDropRequest>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    let meta = state
        .tables
        .drop_columns(
            &auth.organization_id,
            &auth.project_id,
            table_type,
            &request.table_id,
            request.column_ids,
        )
        .await?;
    Ok(Json(meta).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ColumnRenameRequest {
    table_id: String,
    column_map: HashMap<String, String>,
}

/// `POST /v2/gen_tables/{type}/columns/rename`
pub async fn rename_columns(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(table_type): Path<String>,
    Json(request): Json<ColumnRenameRequest>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    let meta = state
        .tables
        .rename_columns(
            &auth.organization_id,
            &auth.project_id,
            table_type,
            &request.table_id,
            request.column_map,
        )
        .await?;
    Ok(Json(meta).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ColumnReorderRequest {
    table_id: String,
    column_ids: Vec<String>,
}

/// `POST /v2/gen_tables/{type}/columns/reorder`
pub async fn reorder_columns(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(table_type): Path<String>,
    Json(request): Json<ColumnReorderRequest>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    let meta = state
        .tables
        .reorder_columns(
            &auth.organization_id,
            &auth.project_id,
            table_type,
            &request.table_id,
            request.column_ids,
        )
        .await?;
    Ok(Json(meta).into_response())
}

#[derive(Debug, Deserialize)]
pub struct GenConfigUpdateRequest {
    table_id: String,
    column_map: HashMap<String, Option<GenConfig>>,
}

/// `POST /v2/gen_tables/{type}/gen_config/update`
pub async fn update_gen_config(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(table_type): Path<String>,
    Json(request): Json<GenConfigUpdateRequest>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    let meta = state
        .tables
        .update_gen_config(
            &auth.organization_id,
            &auth.project_id,
            table_type,
            &request.table_id,
            request.column_map,
        )
        .await?;
    Ok(Json(meta).into_response())
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RowAddRequest {
    table_id: String,
    data: Vec<Map<String, Value>>,
    #[serde(default)]
    stream: bool,
}

/// `POST /v2/gen_tables/{type}/rows/add`
pub async fn add_rows(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(table_type): Path<String>,
    Json(request): Json<RowAddRequest>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    if request.stream {
        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        tokio::spawn(async move {
            let ctx = exec_context(&state, &auth);
            if let Err(e) = state
                .tables
                .add_rows(
                    &ctx,
                    table_type,
                    &request.table_id,
                    request.data,
                    Some(tx),
                    cancel,
                )
                .await
            {
                warn!(error = %e, "streaming row add failed");
            }
            flush_billing(ctx);
        });
        Ok(cell_event_sse(rx).into_response())
    } else {
        let ctx = exec_context(&state, &auth);
        let rows = state
            .tables
            .add_rows(
                &ctx,
                table_type,
                &request.table_id,
                request.data,
                None,
                CancellationToken::new(),
            )
            .await?;
        flush_billing(ctx);
        Ok(Json(rows_response(&rows)).into_response())
    }
}

#[derive(Debug, Deserialize)]
pub struct RowRegenRequest {
    table_id: String,
    row_ids: Vec<String>,
    #[serde(default)]
    regen_strategy: RegenStrategy,
    #[serde(default)]
    output_column_id: Option<String>,
    #[serde(default)]
    stream: bool,
}

/// `POST /v2/gen_tables/{type}/rows/regen`
pub async fn regen_rows(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(table_type): Path<String>,
    Json(request): Json<RowRegenRequest>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    if request.stream {
        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        tokio::spawn(async move {
            let ctx = exec_context(&state, &auth);
            if let Err(e) = state
                .tables
                .regen_rows(
                    &ctx,
                    table_type,
                    &request.table_id,
                    &request.row_ids,
                    request.regen_strategy,
                    request.output_column_id.as_deref(),
                    Some(tx),
                    cancel,
                )
                .await
            {
                warn!(error = %e, "streaming regen failed");
            }
            flush_billing(ctx);
        });
        Ok(cell_event_sse(rx).into_response())
    } else {
        let ctx = exec_context(&state, &auth);
        let rows = state
            .tables
            .regen_rows(
                &ctx,
                table_type,
                &request.table_id,
                &request.row_ids,
                request.regen_strategy,
                request.output_column_id.as_deref(),
                None,
                CancellationToken::new(),
            )
            .await?;
        flush_billing(ctx);
        Ok(Json(rows_response(&rows)).into_response())
    }
}

#[derive(Debug, Deserialize)]
pub struct RowUpdateRequest {
    table_id: String,
    row_id: String,
    data: Map<String, Value>,
}

/// `POST /v2/gen_tables/{type}/rows/update`
pub async fn update_row(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(table_type): Path<String>,
    Json(request): Json<RowUpdateRequest>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    state
        .tables
        .update_row(
            &auth.project_id,
            table_type,
            &request.table_id,
            &request.row_id,
            request.data,
        )
        .await?;
    Ok(Json(json!({"ok": true})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct RowDeleteRequest {
    table_id: String,
    row_ids: Vec<String>,
}

/// `POST /v2/gen_tables/{type}/rows/delete`
pub async fn delete_rows(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(table_type): Path<String>,
    Json(request): Json<RowDeleteRequest>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    let deleted = state
        .tables
        .delete_rows(
            &auth.project_id,
            table_type,
            &request.table_id,
            &request.row_ids,
        )
        .await?;
    Ok(Json(json!({"ok": true, "deleted": deleted})).into_response())
}

/// `GET /v2/gen_tables/{type}/{table_id}/rows`
pub async fn list_rows(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path((table_type, table_id)): Path<(String, String)>,
    Query(params): Query<ListRowsParams>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    let page = state
        .tables
        .list_rows(&auth.project_id, table_type, &table_id, &params)
        .await?;
    Ok(Json(json!({
        "object": "list",
        "total": page.total,
        "offset": page.offset,
        "limit": page.limit,
        "items": page.items,
    }))
    .into_response())
}

/// `GET /v2/gen_tables/{type}/{table_id}/rows/{row_id}`
pub async fn get_row(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path((table_type, table_id, row_id)): Path<(String, String, String)>,
    Query(params): Query<ListRowsParams>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    let row = state
        .tables
        .get_row(&auth.project_id, table_type, &table_id, &row_id, &params)
        .await?;
    Ok(Json(row).into_response())
}

#[derive(Debug, Deserialize)]
pub struct HybridSearchRequest {
    table_id: String,
    query: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

fn default_search_limit() -> usize {
    10
}

/// `POST /v2/gen_tables/{type}/hybrid_search`
pub async fn hybrid_search(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(table_type): Path<String>,
    Json(request): Json<HybridSearchRequest>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    let rows = state
        .tables
        .hybrid_search(
            &auth.route_options(),
            &auth.project_id,
            table_type,
            &request.table_id,
            &request.query,
            request.limit,
        )
        .await?;
    Ok(Json(json!({"object": "list", "items": rows})).into_response())
}

// ============================================================================
// Import / export
// ============================================================================

/// `POST /v2/gen_tables/{type}/import_data` (multipart form)
pub async fn import_data(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(table_type): Path<String>,
    mut multipart: Multipart,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    let mut file: Option<Vec<u8>> = None;
    let mut table_id: Option<String> = None;
    let mut delimiter = b',';

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed form: {e}")))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "file" => {
                let name = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("malformed upload: {e}")))?;
                if name.ends_with(".tsv") {
                    delimiter = b'\t';
                }
                file = Some(bytes.to_vec());
            }
            "table_id" => {
                table_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(format!("malformed form: {e}")))?,
                );
            }
            "delimiter" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("malformed form: {e}")))?;
                delimiter = *text.as_bytes().first().unwrap_or(&b',');
            }
            _ => {}
        }
    }

    let file = file.ok_or_else(|| ApiError::bad_request("missing file field"))?;
    let table_id = table_id.ok_or_else(|| ApiError::bad_request("missing table_id field"))?;

    let ctx = exec_context(&state, &auth);
    let rows = state
        .tables
        .import_data(&ctx, table_type, &table_id, &file, delimiter)
        .await?;
    flush_billing(ctx);
    Ok(Json(rows_response(&rows)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    #[serde(default)]
    delimiter: Option<String>,
}

/// `GET /v2/gen_tables/{type}/{table_id}/export_data`
pub async fn export_data(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path((table_type, table_id)): Path<(String, String)>,
    Query(params): Query<ExportParams>,
) -> TableApiResult<Response> {
    let table_type = parse_table_type(&table_type)?;
    let delimiter = match params.delimiter.as_deref() {
        None | Some(",") => b',',
        Some("\t") | Some("tab") => b'\t',
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "unsupported delimiter: {other:?}"
            ))
            .into());
        }
    };
    let data = state
        .tables
        .export_data(&auth.project_id, table_type, &table_id, delimiter)
        .await?;
    let content_type = if delimiter == b'\t' {
        "text/tab-separated-values"
    } else {
        "text/csv"
    };
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{table_id}.csv\""),
            ),
        ],
        data,
    )
        .into_response())
}
