//! Table service
//!
//! Schema CRUD, gen-config validation, row CRUD and listing. Every schema
//! mutation re-validates the column DAG before persisting, so an accepted
//! table is always executable. The planner output is cached per table
//! version.

use crate::code::CodeRunner;
use crate::csvio;
use crate::error::{Error, Result};
use crate::executor::{CellEvent, ExecContext, GenExecutor, RegenStrategy};
use crate::filter::FilterExpr;
use crate::planner::ColumnDag;
use crate::rag::RagRetriever;
use crate::schema::{
    chat_columns, info_columns, knowledge_columns, validate_column_id, validate_table_id, Cell,
    ColumnDtype, ColumnSchema, GenConfig, TableMeta, TableType,
};
use crate::store::{StoredRow, TableStore};
use crate::template::rename_references;
use jamai_llm::{ModelRegistry, ModelRouter, ModelType, RouteOptions};
use chrono::Utc;
use regex::RegexBuilder;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Hard cap on row listing page size
const MAX_PAGE_SIZE: usize = 100;

/// Request to create a table
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTableRequest {
    /// Table ID
    pub id: String,
    /// User columns, in order
    #[serde(default)]
    pub cols: Vec<ColumnSchema>,
    /// Embedding model for Knowledge Tables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    /// Parent table (chat agent lineage)
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Display title
    #[serde(default)]
    pub title: Option<String>,
}

/// Row listing parameters
#[derive(Debug, Clone, Deserialize)]
pub struct ListRowsParams {
    /// Items offset
    #[serde(default)]
    pub offset: usize,
    /// Page size, 1..=100
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Column to sort by
    #[serde(default = "default_order_by")]
    pub order_by: String,
    /// Sort ascending
    #[serde(default)]
    pub order_ascending: bool,
    /// Column projection; info columns are always included
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    /// SQL-subset filter expression
    #[serde(default, rename = "where")]
    pub where_: Option<String>,
    /// Regex + literal search, AND-combined with `where`
    #[serde(default)]
    pub search_query: String,
    /// Round float cells to this many decimals; 0 disables
    #[serde(default)]
    pub float_decimals: i32,
    /// Round vector elements; negative omits vector columns entirely
    #[serde(default)]
    pub vec_decimals: i32,
}

fn default_limit() -> usize {
    MAX_PAGE_SIZE
}

fn default_order_by() -> String {
    "ID".to_string()
}

impl Default for ListRowsParams {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: MAX_PAGE_SIZE,
            order_by: default_order_by(),
            order_ascending: false,
            columns: None,
            where_: None,
            search_query: String::new(),
            float_decimals: 0,
            vec_decimals: 0,
        }
    }
}

/// A page of rows
#[derive(Debug, Clone)]
pub struct RowPage {
    /// Matching rows before pagination
    pub total: usize,
    /// Current offset
    pub offset: usize,
    /// Current limit
    pub limit: usize,
    /// Rendered rows
    pub items: Vec<Map<String, Value>>,
}

/// The table service
pub struct TableService {
    store: TableStore,
    registry: Arc<ModelRegistry>,
    rag: Arc<RagRetriever>,
    executor: Arc<GenExecutor>,
    // (project, type, table) -> (version, dag)
    dag_cache: RwLock<HashMap<String, (u64, Arc<ColumnDag>)>>,
    // Serializes schema mutations per (project, type, table). Row adds in
    // flight keep reading the pre-update schema and complete.
    schema_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TableService {
    /// Create a service wiring its own retriever and executor.
    #[must_use]
    pub fn new(
        store: TableStore,
        registry: Arc<ModelRegistry>,
        router: Arc<ModelRouter>,
        code_runner: Arc<dyn CodeRunner>,
        concurrent_cells: usize,
    ) -> Self {
        let rag = Arc::new(RagRetriever::new(store.clone(), router.clone()));
        let executor = Arc::new(GenExecutor::with_concurrency(
            store.clone(),
            router,
            rag.clone(),
            code_runner,
            concurrent_cells,
        ));
        Self {
            store,
            registry,
            rag,
            executor,
            dag_cache: RwLock::new(HashMap::new()),
            schema_locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn schema_lock(
        &self,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
    ) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!("{project_id}/{}/{table_id}", table_type.as_str());
        self.schema_locks
            .lock()
            .await
            .entry(key)
            .or_default()
            .clone()
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &TableStore {
        &self.store
    }

    async fn dag_for(&self, project_id: &str, meta: &TableMeta) -> Result<Arc<ColumnDag>> {
        let key = format!("{project_id}/{}/{}", meta.table_type.as_str(), meta.id);
        {
            let cache = self.dag_cache.read().await;
            if let Some((version, dag)) = cache.get(&key) {
                if *version == meta.version {
                    return Ok(dag.clone());
                }
            }
        }
        let dag = Arc::new(ColumnDag::build(&meta.cols, meta.table_type)?);
        self.dag_cache
            .write()
            .await
            .insert(key, (meta.version, dag.clone()));
        Ok(dag)
    }

    // ========================================================================
    // Table lifecycle
    // ========================================================================

    /// Create a table: validates IDs and gen configs, injects the system
    /// columns for the table type, and persists an empty table.
    #[instrument(skip(self, request), fields(table_id = %request.id))]
    pub async fn create_table(
        &self,
        organization_id: &str,
        project_id: &str,
        table_type: TableType,
        request: CreateTableRequest,
    ) -> Result<TableMeta> {
        validate_table_id(&request.id)?;

        let mut cols = info_columns();
        match table_type {
            TableType::Action => {}
            TableType::Knowledge => {
                let embedding_model = request.embedding_model.as_deref().ok_or_else(|| {
                    Error::BadInput("knowledge tables require an embedding_model".to_string())
                })?;
                let model = self
                    .registry
                    .get_model(organization_id, embedding_model)
                    .await?;
                if model.model_type != ModelType::Embed {
                    return Err(Error::BadInput(format!(
                        "{embedding_model} is not an embedding model"
                    )));
                }
                cols.extend(knowledge_columns(embedding_model));
            }
            TableType::Chat => cols.extend(chat_columns()),
        }

        let injected: HashSet<String> = cols.iter().map(|c| c.id.clone()).collect();
        for col in &request.cols {
            validate_column_id(&col.id)?;
            if injected.contains(&col.id) {
                return Err(Error::BadInput(format!(
                    "column `{}` collides with a system column",
                    col.id
                )));
            }
            if request.cols.iter().filter(|c| c.id == col.id).count() > 1 {
                return Err(Error::BadInput(format!("duplicate column `{}`", col.id)));
            }
        }
        cols.extend(request.cols);
        force_chat_rules(table_type, &mut cols)?;

        self.validate_gen_configs(organization_id, project_id, &cols, table_type)
            .await?;

        let now = Utc::now();
        let meta = TableMeta {
            id: request.id,
            table_type,
            parent_id: request.parent_id,
            title: request.title,
            cols,
            version: 1,
            created_at: now,
            updated_at: now,
            num_rows: Some(0),
        };
        self.store.create_table(project_id, &meta).await?;
        Ok(meta)
    }

    /// Fetch a table with its row count.
    pub async fn get_table(
        &self,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
    ) -> Result<TableMeta> {
        let mut meta = self.store.get_meta(project_id, table_type, table_id).await?;
        meta.num_rows = Some(self.store.count_rows(project_id, &meta).await?);
        Ok(meta)
    }

    /// List a project's tables of one type.
    pub async fn list_tables(
        &self,
        project_id: &str,
        table_type: TableType,
    ) -> Result<Vec<TableMeta>> {
        self.store.list_metas(project_id, table_type).await
    }

    /// Drop a table and its rows.
    pub async fn drop_table(
        &self,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
    ) -> Result<()> {
        self.store.drop_table(project_id, table_type, table_id).await
    }

    // ========================================================================
    // Schema mutations
    // ========================================================================

    /// Append columns; the DAG must remain valid.
    #[instrument(skip(self, new_cols), fields(table_id))]
    pub async fn add_columns(
        &self,
        organization_id: &str,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
        new_cols: Vec<ColumnSchema>,
    ) -> Result<TableMeta> {
        let lock = self.schema_lock(project_id, table_type, table_id).await;
        let _guard = lock.lock().await;
        let mut meta = self.store.get_meta(project_id, table_type, table_id).await?;
        for col in &new_cols {
            validate_column_id(&col.id)?;
            if meta.column(&col.id).is_some() {
                return Err(Error::ResourceExists(format!("column `{}`", col.id)));
            }
        }
        let mut cols = meta.cols.clone();
        cols.extend(new_cols.clone());
        self.validate_gen_configs(organization_id, project_id, &cols, table_type)
            .await?;

        let ids: Vec<String> = new_cols.iter().map(|c| c.id.clone()).collect();
        self.store
            .add_physical_columns(project_id, &meta, &ids)
            .await?;
        meta.cols = cols;
        self.bump(&mut meta);
        self.store.put_meta(project_id, &meta).await?;
        Ok(meta)
    }

    /// Drop columns; fails while any gen config still references them.
    #[instrument(skip(self, column_ids), fields(table_id))]
    pub async fn drop_columns(
        &self,
        organization_id: &str,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
        column_ids: Vec<String>,
    ) -> Result<TableMeta> {
        let lock = self.schema_lock(project_id, table_type, table_id).await;
        let _guard = lock.lock().await;
        let mut meta = self.store.get_meta(project_id, table_type, table_id).await?;
        let protected = protected_columns(table_type);
        for id in &column_ids {
            if meta.column(id).is_none() {
                return Err(Error::ResourceNotFound(format!("column `{id}`")));
            }
            if protected.contains(&id.as_str()) {
                return Err(Error::BadInput(format!(
                    "column `{id}` is a system column and cannot be dropped"
                )));
            }
        }

        let remaining: Vec<ColumnSchema> = meta
            .cols
            .iter()
            .filter(|c| !column_ids.contains(&c.id))
            .cloned()
            .collect();
        // Dangling references fail DAG validation.
        self.validate_gen_configs(organization_id, project_id, &remaining, table_type)
            .await?;

        self.store
            .drop_physical_columns(project_id, &meta, &column_ids)
            .await?;
        meta.cols = remaining;
        self.bump(&mut meta);
        self.store.put_meta(project_id, &meta).await?;
        Ok(meta)
    }

    /// Rename columns, rewriting every gen config that references them.
    #[instrument(skip(self, column_map), fields(table_id))]
    pub async fn rename_columns(
        &self,
        organization_id: &str,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
        column_map: HashMap<String, String>,
    ) -> Result<TableMeta> {
        let lock = self.schema_lock(project_id, table_type, table_id).await;
        let _guard = lock.lock().await;
        let mut meta = self.store.get_meta(project_id, table_type, table_id).await?;
        let protected = protected_columns(table_type);
        for (old, new) in &column_map {
            if meta.column(old).is_none() {
                return Err(Error::ResourceNotFound(format!("column `{old}`")));
            }
            if protected.contains(&old.as_str()) {
                return Err(Error::BadInput(format!(
                    "column `{old}` is a system column and cannot be renamed"
                )));
            }
            validate_column_id(new)?;
            if meta.column(new).is_some() && !column_map.contains_key(new) {
                return Err(Error::ResourceExists(format!("column `{new}`")));
            }
        }

        let mut cols = meta.cols.clone();
        for col in &mut cols {
            if let Some(new) = column_map.get(&col.id) {
                col.id = new.clone();
            }
            if let Some(config) = &mut col.gen_config {
                rewrite_config(config, &column_map);
            }
        }
        self.validate_gen_configs(organization_id, project_id, &cols, table_type)
            .await?;

        for (old, new) in &column_map {
            self.store
                .rename_physical_column(project_id, &meta, old, new)
                .await?;
        }
        meta.cols = cols;
        self.bump(&mut meta);
        self.store.put_meta(project_id, &meta).await?;
        Ok(meta)
    }

    /// Reorder the non-info columns. The provided list must be a
    /// permutation, and no reference may move before its dependency.
    #[instrument(skip(self, column_ids), fields(table_id))]
    pub async fn reorder_columns(
        &self,
        organization_id: &str,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
        column_ids: Vec<String>,
    ) -> Result<TableMeta> {
        let lock = self.schema_lock(project_id, table_type, table_id).await;
        let _guard = lock.lock().await;
        let mut meta = self.store.get_meta(project_id, table_type, table_id).await?;
        let current: Vec<String> = meta.user_columns().map(|c| c.id.clone()).collect();
        let provided: HashSet<&String> = column_ids.iter().collect();
        let existing: HashSet<&String> = current.iter().collect();
        if provided != existing || column_ids.len() != current.len() {
            return Err(Error::BadInput(
                "column order must be a permutation of the table's columns".to_string(),
            ));
        }

        let mut cols = info_columns();
        for id in &column_ids {
            cols.push(
                meta.column(id)
                    .cloned()
                    .ok_or_else(|| Error::ResourceNotFound(format!("column `{id}`")))?,
            );
        }
        // Moving a reference before its dependency fails validation here.
        self.validate_gen_configs(organization_id, project_id, &cols, table_type)
            .await?;

        meta.cols = cols;
        self.bump(&mut meta);
        self.store.put_meta(project_id, &meta).await?;
        Ok(meta)
    }

    /// Partially update column gen configs.
    #[instrument(skip(self, column_map), fields(table_id))]
    pub async fn update_gen_config(
        &self,
        organization_id: &str,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
        column_map: HashMap<String, Option<GenConfig>>,
    ) -> Result<TableMeta> {
        let lock = self.schema_lock(project_id, table_type, table_id).await;
        let _guard = lock.lock().await;
        let mut meta = self.store.get_meta(project_id, table_type, table_id).await?;
        let mut cols = meta.cols.clone();
        for (column_id, config) in column_map {
            let col = cols
                .iter_mut()
                .find(|c| c.id == column_id)
                .ok_or_else(|| Error::ResourceNotFound(format!("column `{column_id}`")))?;
            if col.is_info() {
                return Err(Error::BadInput(format!(
                    "column `{column_id}` is a system column"
                )));
            }
            if col.is_vector() {
                return Err(Error::BadInput(format!(
                    "column `{column_id}` is a vector column; re-embedding requires re-creating the table"
                )));
            }
            col.gen_config = config;
        }
        force_chat_rules(table_type, &mut cols)?;
        self.validate_gen_configs(organization_id, project_id, &cols, table_type)
            .await?;

        meta.cols = cols;
        self.bump(&mut meta);
        self.store.put_meta(project_id, &meta).await?;
        Ok(meta)
    }

    // ========================================================================
    // Rows
    // ========================================================================

    /// Add rows, executing every generated column. Streams cell events into
    /// `tx` when given.
    pub async fn add_rows(
        &self,
        ctx: &ExecContext,
        table_type: TableType,
        table_id: &str,
        data: Vec<Map<String, Value>>,
        tx: Option<mpsc::Sender<CellEvent>>,
        cancel: CancellationToken,
    ) -> Result<Vec<StoredRow>> {
        if data.is_empty() {
            return Err(Error::BadInput("no rows to add".to_string()));
        }
        let meta = self
            .store
            .get_meta(&ctx.project_id, table_type, table_id)
            .await?;
        let dag = self.dag_for(&ctx.project_id, &meta).await?;
        let rows = data
            .into_iter()
            .map(|row| coerce_input_row(&meta, row))
            .collect::<Result<Vec<_>>>()?;
        self.executor
            .add_rows(ctx, &meta, &dag, rows, tx, cancel)
            .await
    }

    /// Regenerate rows per the strategy.
    #[allow(clippy::too_many_arguments)]
    pub async fn regen_rows(
        &self,
        ctx: &ExecContext,
        table_type: TableType,
        table_id: &str,
        row_ids: &[String],
        strategy: RegenStrategy,
        output_column_id: Option<&str>,
        tx: Option<mpsc::Sender<CellEvent>>,
        cancel: CancellationToken,
    ) -> Result<Vec<StoredRow>> {
        if row_ids.is_empty() {
            return Err(Error::BadInput("no rows to regenerate".to_string()));
        }
        let meta = self
            .store
            .get_meta(&ctx.project_id, table_type, table_id)
            .await?;
        let dag = self.dag_for(&ctx.project_id, &meta).await?;
        self.executor
            .regen_rows(ctx, &meta, &dag, row_ids, strategy, output_column_id, tx, cancel)
            .await
    }

    /// Update a row's cells in place, without generation.
    pub async fn update_row(
        &self,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
        row_id: &str,
        data: Map<String, Value>,
    ) -> Result<()> {
        let meta = self.store.get_meta(project_id, table_type, table_id).await?;
        let cells = coerce_input_row(&meta, data)?;
        self.store.update_row(project_id, &meta, row_id, &cells).await
    }

    /// Delete rows by ID.
    pub async fn delete_rows(
        &self,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
        row_ids: &[String],
    ) -> Result<u64> {
        let meta = self.store.get_meta(project_id, table_type, table_id).await?;
        self.store.delete_rows(project_id, &meta, row_ids).await
    }

    /// Fetch one rendered row.
    pub async fn get_row(
        &self,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
        row_id: &str,
        params: &ListRowsParams,
    ) -> Result<Map<String, Value>> {
        let meta = self.store.get_meta(project_id, table_type, table_id).await?;
        let row = self.store.get_row(project_id, &meta, row_id).await?;
        Ok(render_row(&meta, &row, params))
    }

    /// List rows with filtering, search, ordering and pagination.
    #[instrument(skip(self, params), fields(table_id))]
    pub async fn list_rows(
        &self,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
        params: &ListRowsParams,
    ) -> Result<RowPage> {
        if params.limit == 0 || params.limit > MAX_PAGE_SIZE {
            return Err(Error::BadInput(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        let meta = self.store.get_meta(project_id, table_type, table_id).await?;
        if params.order_by != "ID"
            && params.order_by != "Updated at"
            && meta.column(&params.order_by).is_none()
        {
            return Err(Error::BadInput(format!(
                "unknown order_by column: {}",
                params.order_by
            )));
        }

        let filter = params
            .where_
            .as_deref()
            .map(FilterExpr::parse)
            .transpose()?;
        let search = build_search(&meta, &params.search_query)?;

        let mut rows = self.store.fetch_all_rows(project_id, &meta).await?;
        rows.retain(|row| {
            filter.as_ref().is_none_or(|f| f.matches(row))
                && search.as_ref().is_none_or(|s| s.matches(row))
        });

        sort_rows(&mut rows, &params.order_by, params.order_ascending);
        let total = rows.len();
        let items = rows
            .into_iter()
            .skip(params.offset)
            .take(params.limit)
            .map(|row| render_row(&meta, &row, params))
            .collect();
        Ok(RowPage {
            total,
            offset: params.offset,
            limit: params.limit,
            items,
        })
    }

    /// Hybrid search over a Knowledge Table; each returned row carries its
    /// `rrf_score`.
    pub async fn hybrid_search(
        &self,
        opts: &RouteOptions,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Map<String, Value>>> {
        if query.is_empty() {
            return Err(Error::BadInput("search query must not be empty".to_string()));
        }
        let meta = self.store.get_meta(project_id, table_type, table_id).await?;
        let scored = self
            .rag
            .hybrid_search(project_id, opts, &meta, query, limit.clamp(1, MAX_PAGE_SIZE))
            .await?;
        let params = ListRowsParams::default();
        Ok(scored
            .into_iter()
            .map(|(row, score)| {
                let mut rendered = render_row(&meta, &row, &params);
                rendered.insert("rrf_score".to_string(), serde_json::json!(score));
                rendered
            })
            .collect())
    }

    /// Import CSV/TSV rows. Generated columns absent from the header are
    /// generated on import; provided values are kept verbatim.
    pub async fn import_data(
        &self,
        ctx: &ExecContext,
        table_type: TableType,
        table_id: &str,
        data: &[u8],
        delimiter: u8,
    ) -> Result<Vec<StoredRow>> {
        let meta = self
            .store
            .get_meta(&ctx.project_id, table_type, table_id)
            .await?;
        let dag = self.dag_for(&ctx.project_id, &meta).await?;
        let rows = csvio::import_rows(&meta, data, delimiter)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let provided: HashSet<String> = rows
            .iter()
            .flat_map(|(_, cells)| cells.keys().cloned())
            .collect();
        let targets: HashSet<String> = dag
            .generated_columns()
            .filter(|c| !provided.contains(*c))
            .map(str::to_string)
            .collect();

        self.executor
            .import_rows(ctx, &meta, &dag, rows, &targets, CancellationToken::new())
            .await
    }

    /// Export every row as CSV/TSV.
    pub async fn export_data(
        &self,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
        delimiter: u8,
    ) -> Result<Vec<u8>> {
        let meta = self.store.get_meta(project_id, table_type, table_id).await?;
        let rows = self.store.fetch_all_rows(project_id, &meta).await?;
        csvio::export_rows(&meta, &rows, delimiter)
    }

    // ========================================================================
    // Validation
    // ========================================================================

    async fn validate_gen_configs(
        &self,
        organization_id: &str,
        project_id: &str,
        cols: &[ColumnSchema],
        table_type: TableType,
    ) -> Result<()> {
        // Reference and ordering rules first.
        ColumnDag::build(cols, table_type)?;

        for col in cols {
            match &col.gen_config {
                None => {}
                Some(GenConfig::Llm(cfg)) => {
                    if !cfg.model.is_empty() {
                        self.registry.get_model(organization_id, &cfg.model).await?;
                    }
                    if let Some(rag) = &cfg.rag_params {
                        self.store
                            .try_get_meta(project_id, TableType::Knowledge, &rag.table_id)
                            .await?
                            .ok_or_else(|| {
                                Error::BadInput(format!(
                                    "knowledge table `{}` does not exist",
                                    rag.table_id
                                ))
                            })?;
                        if let Some(reranker) = &rag.reranking_model {
                            let model =
                                self.registry.get_model(organization_id, reranker).await?;
                            if model.model_type != ModelType::Rerank {
                                return Err(Error::BadInput(format!(
                                    "{reranker} is not a reranking model"
                                )));
                            }
                        }
                        if rag.k == 0 {
                            return Err(Error::BadInput("rag_params.k must be > 0".to_string()));
                        }
                    }
                }
                Some(GenConfig::Embed(cfg)) => {
                    let model = self
                        .registry
                        .get_model(organization_id, &cfg.embedding_model)
                        .await?;
                    if model.model_type != ModelType::Embed {
                        return Err(Error::BadInput(format!(
                            "{} is not an embedding model",
                            cfg.embedding_model
                        )));
                    }
                }
                Some(GenConfig::Code(_)) => {
                    // Source column existence and ordering checked by the DAG.
                }
            }
        }
        Ok(())
    }

    fn bump(&self, meta: &mut TableMeta) {
        meta.version += 1;
        meta.updated_at = Utc::now();
    }
}

/// Chat `AI.multi_turn` is forced true on every write.
fn force_chat_rules(table_type: TableType, cols: &mut [ColumnSchema]) -> Result<()> {
    if table_type != TableType::Chat {
        return Ok(());
    }
    let Some(ai) = cols.iter_mut().find(|c| c.id == "AI") else {
        return Err(Error::BadInput("chat tables require an AI column".to_string()));
    };
    match &mut ai.gen_config {
        Some(GenConfig::Llm(cfg)) => {
            cfg.multi_turn = true;
            Ok(())
        }
        _ => Err(Error::BadInput(
            "the AI column must carry an LLM gen config".to_string(),
        )),
    }
}

fn protected_columns(table_type: TableType) -> &'static [&'static str] {
    match table_type {
        TableType::Action => &["ID", "Updated at"],
        TableType::Knowledge => &[
            "ID",
            "Updated at",
            "Title",
            "Text",
            "File ID",
            "Page",
            "Title Embed",
            "Text Embed",
        ],
        TableType::Chat => &["ID", "Updated at", "User", "AI"],
    }
}

fn rewrite_config(config: &mut GenConfig, renames: &HashMap<String, String>) {
    match config {
        GenConfig::Llm(cfg) => {
            cfg.system_prompt = rename_references(&cfg.system_prompt, renames);
            cfg.prompt = rename_references(&cfg.prompt, renames);
        }
        GenConfig::Embed(cfg) => {
            if let Some(new) = renames.get(&cfg.source_column) {
                cfg.source_column = new.clone();
            }
        }
        GenConfig::Code(cfg) => {
            if let Some(new) = renames.get(&cfg.source_column) {
                cfg.source_column = new.clone();
            }
        }
    }
}

fn coerce_input_row(
    meta: &TableMeta,
    data: Map<String, Value>,
) -> Result<HashMap<String, Cell>> {
    let mut cells = HashMap::new();
    for (column_id, value) in data {
        let col = meta
            .column(&column_id)
            .ok_or_else(|| Error::ResourceNotFound(format!("column `{column_id}`")))?;
        if col.is_info() {
            continue;
        }
        let coerced = csvio::coerce_json_value(col.dtype, value)?;
        cells.insert(column_id, Cell::of(coerced));
    }
    Ok(cells)
}

struct SearchFilter {
    regex: Option<regex::Regex>,
    literal: String,
    columns: Vec<String>,
}

impl SearchFilter {
    fn matches(&self, row: &StoredRow) -> bool {
        self.columns.iter().any(|col| {
            let text = row.cell(col).as_text();
            if text.is_empty() {
                return false;
            }
            self.regex.as_ref().is_some_and(|re| re.is_match(&text))
                || text.to_lowercase().contains(&self.literal)
        })
    }
}

/// Search applies to string-typed columns, as regex OR literal substring.
fn build_search(meta: &TableMeta, search_query: &str) -> Result<Option<SearchFilter>> {
    if search_query.is_empty() {
        return Ok(None);
    }
    let columns: Vec<String> = meta
        .user_columns()
        .filter(|c| c.dtype == ColumnDtype::Str)
        .map(|c| c.id.clone())
        .collect();
    let regex = RegexBuilder::new(search_query)
        .case_insensitive(true)
        .build()
        .ok();
    Ok(Some(SearchFilter {
        regex,
        literal: search_query.to_lowercase(),
        columns,
    }))
}

fn sort_rows(rows: &mut [StoredRow], order_by: &str, ascending: bool) {
    rows.sort_by(|a, b| {
        let ordering = match order_by {
            "ID" => a.id.cmp(&b.id),
            "Updated at" => a.updated_at.cmp(&b.updated_at),
            column => {
                let va = a.cell(column).value;
                let vb = b.cell(column).value;
                compare_values(&va, &vb)
            }
        };
        if ascending {
            ordering
        } else {
            ordering.reverse()
        }
    });
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn render_row(meta: &TableMeta, row: &StoredRow, params: &ListRowsParams) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("ID".to_string(), Value::String(row.id.clone()));
    out.insert(
        "Updated at".to_string(),
        Value::String(row.updated_at.to_rfc3339()),
    );
    for col in meta.user_columns() {
        if let Some(projection) = &params.columns {
            if !projection.contains(&col.id) {
                continue;
            }
        }
        if col.is_vector() && params.vec_decimals < 0 {
            continue;
        }
        let mut cell = row.cell(&col.id);
        cell.value = round_value(cell.value, col, params);
        let rendered = serde_json::to_value(&cell).unwrap_or(Value::Null);
        out.insert(col.id.clone(), rendered);
    }
    out
}

fn round_value(value: Value, col: &ColumnSchema, params: &ListRowsParams) -> Value {
    match value {
        Value::Number(n) if col.dtype == ColumnDtype::Float && params.float_decimals > 0 => n
            .as_f64()
            .map(|f| serde_json::json!(round_to(f, params.float_decimals)))
            .unwrap_or(Value::Number(n)),
        Value::Array(items) if col.is_vector() && params.vec_decimals > 0 => Value::Array(
            items
                .into_iter()
                .map(|v| match v {
                    Value::Number(n) => n
                        .as_f64()
                        .map(|f| serde_json::json!(round_to(f, params.vec_decimals)))
                        .unwrap_or(Value::Number(n)),
                    other => other,
                })
                .collect(),
        ),
        other => other,
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::DisabledCodeRunner;
    use crate::schema::{EmbedGenConfig, LlmGenConfig};
    use jamai_llm::registry::{Capability, Deployment, ModelConfig};
    use jamai_llm::{AdapterSet, Provider};

    fn llm_config(model: &str, prompt: &str) -> GenConfig {
        GenConfig::Llm(LlmGenConfig {
            model: model.to_string(),
            system_prompt: String::new(),
            prompt: prompt.to_string(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            tools: None,
            multi_turn: false,
            rag_params: None,
        })
    }

    async fn service() -> TableService {
        let registry = Arc::new(ModelRegistry::new());
        for (id, model_type, caps) in [
            ("test/chat", ModelType::Llm, vec![Capability::Chat]),
            ("test/embed", ModelType::Embed, vec![Capability::Embed]),
            ("test/rerank", ModelType::Rerank, vec![Capability::Rerank]),
        ] {
            let mut model = ModelConfig {
                id: id.to_string(),
                name: String::new(),
                owned_by: "test".to_string(),
                model_type,
                capabilities: caps,
                context_length: 8192,
                languages: Vec::new(),
                embedding_size: Some(8),
                embedding_dimensions: None,
                llm_input_cost_per_mtoken: 0.0,
                llm_output_cost_per_mtoken: 0.0,
                embedding_cost_per_mtoken: 0.0,
                reranking_cost_per_ksearch: 0.0,
                allowed_orgs: Vec::new(),
                blocked_orgs: Vec::new(),
                timeout_secs: 30,
                priority: 0,
            };
            if model_type != ModelType::Embed {
                model.embedding_size = None;
            }
            registry.upsert_model(model).await.unwrap();
            registry
                .add_deployment(Deployment::new(id, Provider::Custom, "native"))
                .await
                .unwrap();
        }
        let router = Arc::new(ModelRouter::new(registry.clone(), AdapterSet::empty()));
        let store = TableStore::connect("sqlite::memory:").await.unwrap();
        TableService::new(store, registry, router, Arc::new(DisabledCodeRunner), 4)
    }

    fn action_request(id: &str) -> CreateTableRequest {
        CreateTableRequest {
            id: id.to_string(),
            cols: vec![
                ColumnSchema::input("in", ColumnDtype::Str),
                ColumnSchema::generated(
                    "out",
                    ColumnDtype::Str,
                    llm_config("test/chat", "${in}"),
                ),
            ],
            embedding_model: None,
            parent_id: None,
            title: None,
        }
    }

    #[tokio::test]
    async fn test_create_action_table_injects_info_columns() {
        let service = service().await;
        let meta = service
            .create_table("org", "proj", TableType::Action, action_request("t1"))
            .await
            .unwrap();
        let ids: Vec<&str> = meta.cols.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["ID", "Updated at", "in", "out"]);
        assert_eq!(meta.num_rows, Some(0));
    }

    #[tokio::test]
    async fn test_create_knowledge_table_requires_embedding_model() {
        let service = service().await;
        let request = CreateTableRequest {
            id: "kt".to_string(),
            cols: Vec::new(),
            embedding_model: None,
            parent_id: None,
            title: None,
        };
        assert!(service
            .create_table("org", "proj", TableType::Knowledge, request)
            .await
            .is_err());

        let request = CreateTableRequest {
            id: "kt".to_string(),
            cols: Vec::new(),
            embedding_model: Some("test/embed".to_string()),
            parent_id: None,
            title: None,
        };
        let meta = service
            .create_table("org", "proj", TableType::Knowledge, request)
            .await
            .unwrap();
        assert!(meta.column("Text Embed").is_some_and(ColumnSchema::is_vector));
    }

    #[tokio::test]
    async fn test_create_chat_table_forces_multi_turn() {
        let service = service().await;
        let request = CreateTableRequest {
            id: "ct".to_string(),
            cols: Vec::new(),
            embedding_model: None,
            parent_id: None,
            title: None,
        };
        let meta = service
            .create_table("org", "proj", TableType::Chat, request)
            .await
            .unwrap();
        let Some(GenConfig::Llm(cfg)) = &meta.column("AI").unwrap().gen_config else {
            panic!("AI must be an LLM column");
        };
        assert!(cfg.multi_turn);
    }

    #[tokio::test]
    async fn test_forward_reference_rejected_at_create() {
        let service = service().await;
        let request = CreateTableRequest {
            id: "bad".to_string(),
            cols: vec![
                ColumnSchema::generated(
                    "early",
                    ColumnDtype::Str,
                    llm_config("test/chat", "${late}"),
                ),
                ColumnSchema::input("late", ColumnDtype::Str),
            ],
            embedding_model: None,
            parent_id: None,
            title: None,
        };
        let err = service
            .create_table("org", "proj", TableType::Action, request)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid source column"));
    }

    #[tokio::test]
    async fn test_unknown_model_rejected_at_create() {
        let service = service().await;
        let request = CreateTableRequest {
            id: "bad".to_string(),
            cols: vec![
                ColumnSchema::input("in", ColumnDtype::Str),
                ColumnSchema::generated(
                    "out",
                    ColumnDtype::Str,
                    llm_config("missing/model", "${in}"),
                ),
            ],
            embedding_model: None,
            parent_id: None,
            title: None,
        };
        assert!(service
            .create_table("org", "proj", TableType::Action, request)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_rename_rewrites_referencing_templates() {
        let service = service().await;
        service
            .create_table("org", "proj", TableType::Action, action_request("t1"))
            .await
            .unwrap();

        let mut renames = HashMap::new();
        renames.insert("in".to_string(), "input".to_string());
        let meta = service
            .rename_columns("org", "proj", TableType::Action, "t1", renames)
            .await
            .unwrap();
        let Some(GenConfig::Llm(cfg)) = &meta.column("out").unwrap().gen_config else {
            panic!("expected llm config");
        };
        assert_eq!(cfg.prompt, "${input}");
        assert!(meta.column("in").is_none());
    }

    #[tokio::test]
    async fn test_drop_referenced_column_rejected() {
        let service = service().await;
        service
            .create_table("org", "proj", TableType::Action, action_request("t1"))
            .await
            .unwrap();
        let err = service
            .drop_columns(
                "org",
                "proj",
                TableType::Action,
                "t1",
                vec!["in".to_string()],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid source column"));

        // Dropping the dependent column first is fine.
        service
            .drop_columns(
                "org",
                "proj",
                TableType::Action,
                "t1",
                vec!["out".to_string()],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reorder_validates_permutation_and_dependencies() {
        let service = service().await;
        service
            .create_table("org", "proj", TableType::Action, action_request("t1"))
            .await
            .unwrap();

        // Moving the output before its input breaks the DAG.
        let err = service
            .reorder_columns(
                "org",
                "proj",
                TableType::Action,
                "t1",
                vec!["out".to_string(), "in".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));

        // Not a permutation.
        let err = service
            .reorder_columns(
                "org",
                "proj",
                TableType::Action,
                "t1",
                vec!["in".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[tokio::test]
    async fn test_update_gen_config_validates_and_bumps_version() {
        let service = service().await;
        let meta = service
            .create_table("org", "proj", TableType::Action, action_request("t1"))
            .await
            .unwrap();
        assert_eq!(meta.version, 1);

        let mut update = HashMap::new();
        update.insert(
            "out".to_string(),
            Some(llm_config("test/chat", "say ${in} backwards")),
        );
        let meta = service
            .update_gen_config("org", "proj", TableType::Action, "t1", update)
            .await
            .unwrap();
        assert_eq!(meta.version, 2);

        // Unknown referenced column is rejected.
        let mut update = HashMap::new();
        update.insert(
            "out".to_string(),
            Some(llm_config("test/chat", "${missing}")),
        );
        assert!(service
            .update_gen_config("org", "proj", TableType::Action, "t1", update)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_list_rows_limit_bounds() {
        let service = service().await;
        service
            .create_table("org", "proj", TableType::Action, action_request("t1"))
            .await
            .unwrap();

        for limit in [0, 101] {
            let params = ListRowsParams {
                limit,
                ..Default::default()
            };
            let err = service
                .list_rows("proj", TableType::Action, "t1", &params)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::BadInput(_)), "limit {limit}");
        }
    }

    #[tokio::test]
    async fn test_list_rows_offset_beyond_total() {
        let service = service().await;
        service
            .create_table("org", "proj", TableType::Action, action_request("t1"))
            .await
            .unwrap();
        let params = ListRowsParams {
            offset: 50,
            ..Default::default()
        };
        let page = service
            .list_rows("proj", TableType::Action, "t1", &params)
            .await
            .unwrap();
        assert_eq!(page.total, 0);
        assert!(page.items.is_empty());
    }

    #[test]
    fn test_round_value_floats_and_vectors() {
        let float_col = ColumnSchema::input("f", ColumnDtype::Float);
        let params = ListRowsParams {
            float_decimals: 2,
            vec_decimals: 1,
            ..Default::default()
        };
        assert_eq!(
            round_value(serde_json::json!(3.14159), &float_col, &params),
            serde_json::json!(3.14)
        );

        let vec_col = ColumnSchema::generated(
            "v",
            ColumnDtype::Json,
            GenConfig::Embed(EmbedGenConfig {
                embedding_model: "test/embed".to_string(),
                source_column: "f".to_string(),
            }),
        );
        assert_eq!(
            round_value(serde_json::json!([0.26, 0.84]), &vec_col, &params),
            serde_json::json!([0.3, 0.8])
        );
    }
}
