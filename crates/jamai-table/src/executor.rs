//! Row executor
//!
//! Walks the planner's layers for each row of an add or regenerate batch.
//! Columns within a layer run concurrently; a layer starts only when the
//! previous one has fully settled, success or failure. Failed cells hold an
//! `[ERROR] ...` literal and downstream templates interpolate that text.
//! Rows of a batch execute concurrently; a process-wide semaphore caps
//! outstanding provider calls. A row is persisted transactionally after its
//! last layer; cancellation before that point discards the row.

use crate::code::{coerce_output, CodeRunner};
use crate::error::{Error, Result};
use crate::planner::ColumnDag;
use crate::rag::{build_rag_message, RagRetriever};
use crate::schema::{
    Cell, ColumnDtype, ColumnSchema, GenConfig, LlmGenConfig, TableMeta, TableType,
};
use crate::store::{StoredRow, TableStore};
use crate::template::{
    default_system_prompt, default_user_prompt, interpolate_parts, interpolate_text,
};
use jamai_billing::{BillingManager, ProductType};
use jamai_llm::{
    ChatMessage, ChatRequest, CompletionUsage, EmbeddingInput, EmbeddingRequest, FinishReason,
    MessageContent, ModelRouter, ModelType, References, RouteOptions,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Default cap on concurrent provider calls across the process
pub const DEFAULT_CONCURRENT_CELLS: usize = 8;

/// Conversation rows included as history for multi-turn columns
const MULTI_TURN_WINDOW: usize = 20;

/// Column selection strategy for row regeneration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegenStrategy {
    /// Re-execute every generated column
    #[default]
    RunAll,
    /// Re-execute only columns in layers before the target's
    RunBefore,
    /// Re-execute only the target column
    RunSelected,
    /// Re-execute the target column and every later layer
    RunAfter,
}

/// One event of the executor's output stream
#[derive(Debug, Clone)]
pub enum CellEvent {
    /// RAG references for a cell; precedes its first content chunk
    References {
        /// Row being generated
        row_id: String,
        /// Output column
        column_id: String,
        /// The retrieved chunks
        references: References,
    },
    /// A content fragment
    Chunk {
        /// Row being generated
        row_id: String,
        /// Output column
        column_id: String,
        /// Content fragment
        text: String,
    },
    /// Usage-only tail; closes the column's stream
    Usage {
        /// Row being generated
        row_id: String,
        /// Output column
        column_id: String,
        /// Token usage reported by the provider
        usage: CompletionUsage,
        /// Why generation stopped
        finish_reason: FinishReason,
    },
    /// Every column of the row has settled and the row is persisted
    RowDone {
        /// The finished row
        row_id: String,
    },
}

/// Per-request execution context
pub struct ExecContext {
    /// Project owning the table
    pub project_id: String,
    /// Routing context (org, external keys)
    pub opts: RouteOptions,
    /// Shared per-request billing accumulator
    pub billing: Arc<Mutex<BillingManager>>,
}

/// The row executor
pub struct GenExecutor {
    store: TableStore,
    router: Arc<ModelRouter>,
    rag: Arc<RagRetriever>,
    code_runner: Arc<dyn CodeRunner>,
    semaphore: Arc<Semaphore>,
}

impl GenExecutor {
    /// Create an executor with the default concurrency cap.
    #[must_use]
    pub fn new(
        store: TableStore,
        router: Arc<ModelRouter>,
        rag: Arc<RagRetriever>,
        code_runner: Arc<dyn CodeRunner>,
    ) -> Self {
        Self::with_concurrency(store, router, rag, code_runner, DEFAULT_CONCURRENT_CELLS)
    }

    /// Create an executor capping outstanding provider calls at `limit`.
    #[must_use]
    pub fn with_concurrency(
        store: TableStore,
        router: Arc<ModelRouter>,
        rag: Arc<RagRetriever>,
        code_runner: Arc<dyn CodeRunner>,
        limit: usize,
    ) -> Self {
        Self {
            store,
            router,
            rag,
            code_runner,
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Add a batch of rows: every generated column executes in DAG order.
    /// `data` may pre-fill generated columns; the supplied value is kept as
    /// the cell's `original`. Returns the persisted rows.
    #[instrument(skip_all, fields(table_id = %meta.id, rows = data.len()))]
    pub async fn add_rows(
        &self,
        ctx: &ExecContext,
        meta: &TableMeta,
        dag: &ColumnDag,
        data: Vec<HashMap<String, Cell>>,
        tx: Option<mpsc::Sender<CellEvent>>,
        cancel: CancellationToken,
    ) -> Result<Vec<StoredRow>> {
        let targets: HashSet<String> = dag.generated_columns().map(str::to_string).collect();
        let jobs: Vec<RowJob> = data
            .into_iter()
            .map(|cells| {
                let mut row = StoredRow::new();
                // Pre-filled generated cells keep the user value as `original`.
                for (col, mut cell) in cells {
                    if targets.contains(&col) && !cell.value.is_null() {
                        cell.original = Some(cell.value.take());
                    }
                    row.cells.insert(col, cell);
                }
                RowJob {
                    row,
                    is_new: true,
                }
            })
            .collect();
        self.execute(ctx, meta, dag, jobs, &targets, tx, cancel).await
    }

    /// Import rows with explicit IDs and an explicit target set: columns
    /// present in the import keep their values verbatim, only the listed
    /// targets are generated. Used by CSV import.
    #[instrument(skip_all, fields(table_id = %meta.id, rows = data.len()))]
    pub async fn import_rows(
        &self,
        ctx: &ExecContext,
        meta: &TableMeta,
        dag: &ColumnDag,
        data: Vec<(Option<String>, HashMap<String, Cell>)>,
        targets: &HashSet<String>,
        cancel: CancellationToken,
    ) -> Result<Vec<StoredRow>> {
        let jobs: Vec<RowJob> = data
            .into_iter()
            .map(|(id, cells)| {
                let mut row = StoredRow::new();
                if let Some(id) = id {
                    row.id = id;
                }
                row.cells = cells;
                RowJob { row, is_new: true }
            })
            .collect();
        self.execute(ctx, meta, dag, jobs, targets, None, cancel).await
    }

    /// Regenerate rows according to the strategy. Returns the updated rows.
    #[instrument(skip_all, fields(table_id = %meta.id, rows = row_ids.len(), strategy = ?strategy))]
    pub async fn regen_rows(
        &self,
        ctx: &ExecContext,
        meta: &TableMeta,
        dag: &ColumnDag,
        row_ids: &[String],
        strategy: RegenStrategy,
        output_column_id: Option<&str>,
        tx: Option<mpsc::Sender<CellEvent>>,
        cancel: CancellationToken,
    ) -> Result<Vec<StoredRow>> {
        let targets = regen_targets(dag, strategy, output_column_id)?;
        let mut jobs = Vec::with_capacity(row_ids.len());
        let mut sorted_ids = row_ids.to_vec();
        sorted_ids.sort();
        for row_id in &sorted_ids {
            let row = self.store.get_row(&ctx.project_id, meta, row_id).await?;
            jobs.push(RowJob { row, is_new: false });
        }
        self.execute(ctx, meta, dag, jobs, &targets, tx, cancel).await
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        meta: &TableMeta,
        dag: &ColumnDag,
        jobs: Vec<RowJob>,
        targets: &HashSet<String>,
        tx: Option<mpsc::Sender<CellEvent>>,
        cancel: CancellationToken,
    ) -> Result<Vec<StoredRow>> {
        let row_futures = jobs.into_iter().map(|job| {
            let tx = tx.clone();
            let cancel = cancel.clone();
            async move { self.execute_row(ctx, meta, dag, job, targets, tx, cancel).await }
        });
        let results = futures::future::join_all(row_futures).await;

        let mut rows = Vec::new();
        for result in results {
            match result {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => {} // cancelled before persistence
                Err(e) => {
                    // A transactional failure aborts its row only.
                    warn!(error = %e, "row execution failed");
                }
            }
        }
        Ok(rows)
    }

    async fn execute_row(
        &self,
        ctx: &ExecContext,
        meta: &TableMeta,
        dag: &ColumnDag,
        mut job: RowJob,
        targets: &HashSet<String>,
        tx: Option<mpsc::Sender<CellEvent>>,
        cancel: CancellationToken,
    ) -> Result<Option<StoredRow>> {
        let mut computed: HashMap<String, Cell> = HashMap::new();
        for layer in dag.execution_layers() {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let running: Vec<&String> = layer.iter().filter(|c| targets.contains(*c)).collect();
            if running.is_empty() {
                continue;
            }
            let row = &job.row;
            let outputs = futures::future::join_all(running.iter().map(|column_id| {
                let tx = tx.clone();
                let cancel = cancel.clone();
                async move {
                    let cell = self.run_column(ctx, meta, row, column_id, tx, cancel).await;
                    ((*column_id).clone(), cell)
                }
            }))
            .await;
            // Layer barrier: merge results before the next layer reads them.
            for (column_id, cell) in outputs {
                // Keep a pre-filled `original` across regeneration.
                let original = job
                    .row
                    .cells
                    .get(&column_id)
                    .and_then(|c| c.original.clone());
                let mut cell = cell;
                if cell.original.is_none() {
                    cell.original = original;
                }
                job.row.cells.insert(column_id.clone(), cell.clone());
                computed.insert(column_id, cell);
            }
        }

        if cancel.is_cancelled() {
            debug!(row_id = %job.row.id, "cancelled before persistence; row discarded");
            return Ok(None);
        }

        if job.is_new {
            self.store.insert_row(&ctx.project_id, meta, &job.row).await?;
        } else if !computed.is_empty() {
            self.store
                .update_row(&ctx.project_id, meta, &job.row.id, &computed)
                .await?;
        }
        emit(
            &tx,
            &cancel,
            CellEvent::RowDone {
                row_id: job.row.id.clone(),
            },
        )
        .await;
        Ok(Some(job.row))
    }

    async fn run_column(
        &self,
        ctx: &ExecContext,
        meta: &TableMeta,
        row: &StoredRow,
        column_id: &str,
        tx: Option<mpsc::Sender<CellEvent>>,
        cancel: CancellationToken,
    ) -> Cell {
        let Some(column) = meta.column(column_id) else {
            return error_cell("column dropped during execution");
        };
        let Some(config) = column.gen_config.clone() else {
            return row.cell(column_id);
        };
        match config {
            GenConfig::Llm(cfg) => {
                self.run_llm_column(ctx, meta, row, column, &cfg, tx, cancel)
                    .await
            }
            GenConfig::Embed(cfg) => {
                self.run_embed_column(ctx, row, &cfg.embedding_model, &cfg.source_column)
                    .await
            }
            GenConfig::Code(cfg) => {
                self.run_code_column(row, column.dtype, &cfg.source_column)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_llm_column(
        &self,
        ctx: &ExecContext,
        meta: &TableMeta,
        row: &StoredRow,
        column: &ColumnSchema,
        cfg: &LlmGenConfig,
        tx: Option<mpsc::Sender<CellEvent>>,
        cancel: CancellationToken,
    ) -> Cell {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return error_cell("executor shutting down"),
        };

        let model = match self
            .router
            .registry()
            .resolve_model(
                &ctx.opts.organization_id,
                &cfg.model,
                ModelType::Llm,
                &[jamai_llm::Capability::Chat],
            )
            .await
        {
            Ok(model) => model,
            Err(e) => return error_from(&e.into()),
        };

        if let Err(e) = ctx
            .billing
            .lock()
            .await
            .check_quota(&model, ProductType::LlmTokens)
            .await
        {
            return error_from(&e.into());
        }

        let (messages, references) = match self
            .build_messages(ctx, meta, row, column, cfg)
            .await
        {
            Ok(built) => built,
            Err(e) => return error_from(&e),
        };

        if let Some(references) = &references {
            emit(
                &tx,
                &cancel,
                CellEvent::References {
                    row_id: row.id.clone(),
                    column_id: column.id.clone(),
                    references: references.clone(),
                },
            )
            .await;
        }

        let mut request = ChatRequest::new(model.id.clone(), messages);
        request.temperature = cfg.temperature;
        request.top_p = cfg.top_p;
        request.max_tokens = cfg.max_tokens;
        request.stop = cfg.stop.clone();
        request.tools = cfg.tools.clone();

        let (content, usage, _finish) = if tx.is_some() {
            self.stream_llm(ctx, &request, row, &column.id, &tx, &cancel)
                .await
        } else {
            match self.router.chat(&ctx.opts, &request).await {
                Ok(response) => {
                    let finish = response.choices.first().and_then(|c| c.finish_reason);
                    (
                        response.text().to_string(),
                        response.usage,
                        finish.unwrap_or(FinishReason::Stop),
                    )
                }
                Err(e) => (error_text(&e.into()), None, FinishReason::Stop),
            }
        };

        if let Some(usage) = usage {
            ctx.billing.lock().await.record_llm_usage(
                &model,
                usage.prompt_tokens,
                usage.completion_tokens,
            );
        }

        Cell {
            value: serde_json::Value::String(content),
            original: None,
            references,
        }
    }

    /// Stream a column's completion, forwarding chunks; the usage tail chunk
    /// always closes the column, even on failure.
    async fn stream_llm(
        &self,
        ctx: &ExecContext,
        request: &ChatRequest,
        row: &StoredRow,
        column_id: &str,
        tx: &Option<mpsc::Sender<CellEvent>>,
        cancel: &CancellationToken,
    ) -> (String, Option<CompletionUsage>, FinishReason) {
        let mut content = String::new();
        let mut usage = None;
        let mut finish = FinishReason::Stop;

        match self.router.chat_stream(&ctx.opts, request).await {
            Ok(mut stream) => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(chunk) => {
                            if let Some(text) = chunk.text() {
                                content.push_str(text);
                                emit(
                                    tx,
                                    cancel,
                                    CellEvent::Chunk {
                                        row_id: row.id.clone(),
                                        column_id: column_id.to_string(),
                                        text: text.to_string(),
                                    },
                                )
                                .await;
                            }
                            if let Some(u) = chunk.usage {
                                usage = Some(u);
                            }
                            if let Some(f) = chunk.choices.first().and_then(|c| c.finish_reason) {
                                finish = f;
                            }
                        }
                        // The router already folded mid-stream errors into a
                        // final [ERROR] chunk; anything else ends the stream.
                        Err(e) => {
                            content.push_str(&error_text(&e.into()));
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                let text = error_text(&e.into());
                content = text.clone();
                emit(
                    tx,
                    cancel,
                    CellEvent::Chunk {
                        row_id: row.id.clone(),
                        column_id: column_id.to_string(),
                        text,
                    },
                )
                .await;
            }
        }

        emit(
            tx,
            cancel,
            CellEvent::Usage {
                row_id: row.id.clone(),
                column_id: column_id.to_string(),
                usage: usage.unwrap_or_default(),
                finish_reason: finish,
            },
        )
        .await;
        (content, usage, finish)
    }

    /// Build the message array for an LLM column: interpolated system
    /// prompt, injected RAG context, multi-turn history for Chat Tables,
    /// then the interpolated (possibly multimodal) user prompt.
    async fn build_messages(
        &self,
        ctx: &ExecContext,
        meta: &TableMeta,
        row: &StoredRow,
        column: &ColumnSchema,
        cfg: &LlmGenConfig,
    ) -> Result<(Vec<ChatMessage>, Option<References>)> {
        let lookup_text = |name: &str| Some(row.cell(name).as_text());
        let lookup_parts = |name: &str| {
            meta.column(name)
                .map(|c| (c.dtype, row.cell(name).as_text()))
        };

        let prior_columns: Vec<&str> = meta
            .cols
            .iter()
            .take_while(|c| c.id != column.id)
            .filter(|c| !c.is_info() && !c.is_vector())
            .map(|c| c.id.as_str())
            .collect();

        let system_template = if cfg.system_prompt.is_empty() {
            let agent = (meta.table_type == TableType::Chat && column.id == "AI")
                .then_some(meta.id.as_str());
            default_system_prompt(agent)
        } else {
            cfg.system_prompt.clone()
        };
        let mut messages = vec![ChatMessage::system(interpolate_text(
            &system_template,
            lookup_text,
        ))];

        let mut references = None;
        if let Some(rag_params) = &cfg.rag_params {
            let fallback: String = prior_columns
                .iter()
                .map(|c| row.cell(c).as_text())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            let refs = self
                .rag
                .retrieve(&ctx.project_id, &ctx.opts, rag_params, &fallback)
                .await?;
            messages.push(ChatMessage::system(build_rag_message(
                &refs,
                rag_params.inline_citations,
            )));
            references = Some(refs);
        }

        if cfg.multi_turn && meta.table_type == TableType::Chat {
            let history = self.conversation_history(ctx, meta, &row.id).await?;
            messages.extend(history);
        }

        let user_template = if cfg.prompt.is_empty() {
            default_user_prompt(&column.id, &prior_columns)
        } else {
            cfg.prompt.clone()
        };
        let parts = interpolate_parts(&user_template, lookup_parts);
        messages.push(ChatMessage::user(MessageContent::Parts(parts)));

        Ok((messages, references))
    }

    /// Prior rows of a Chat Table as alternating user/assistant turns.
    async fn conversation_history(
        &self,
        ctx: &ExecContext,
        meta: &TableMeta,
        current_row_id: &str,
    ) -> Result<Vec<ChatMessage>> {
        let rows = self.store.fetch_all_rows(&ctx.project_id, meta).await?;
        let mut history = Vec::new();
        for row in rows
            .iter()
            .filter(|r| r.id.as_str() < current_row_id)
            .rev()
            .take(MULTI_TURN_WINDOW)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
        {
            let user = row.cell("User").as_text();
            let ai = row.cell("AI").as_text();
            if !user.is_empty() {
                history.push(ChatMessage::user(user));
            }
            if !ai.is_empty() {
                history.push(ChatMessage::assistant(ai));
            }
        }
        Ok(history)
    }

    async fn run_embed_column(
        &self,
        ctx: &ExecContext,
        row: &StoredRow,
        embedding_model: &str,
        source_column: &str,
    ) -> Cell {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return error_cell("executor shutting down"),
        };
        let model = match self
            .router
            .registry()
            .get_model(&ctx.opts.organization_id, embedding_model)
            .await
        {
            Ok(model) => model,
            Err(e) => return error_from(&e.into()),
        };
        if let Err(e) = ctx
            .billing
            .lock()
            .await
            .check_quota(&model, ProductType::EmbeddingTokens)
            .await
        {
            return error_from(&e.into());
        }

        let text = row.cell(source_column).as_text();
        let request = EmbeddingRequest {
            model: model.id.clone(),
            input: EmbeddingInput::One(text),
            dimensions: model.embedding_dimensions,
            encoding_format: jamai_llm::EncodingFormat::Float,
        };
        match self.router.embed(&ctx.opts, &request).await {
            Ok(response) => {
                ctx.billing
                    .lock()
                    .await
                    .record_embed_usage(&model, response.usage.total_tokens);
                let vector = response
                    .data
                    .first()
                    .map(|d| d.embedding.to_floats())
                    .unwrap_or_default();
                Cell::of(serde_json::json!(vector))
            }
            Err(e) => error_from(&e.into()),
        }
    }

    async fn run_code_column(
        &self,
        row: &StoredRow,
        dtype: ColumnDtype,
        source_column: &str,
    ) -> Cell {
        let code = row.cell(source_column).as_text();
        match self.code_runner.run(&code).await {
            Ok(output) => match coerce_output(dtype, &output) {
                Ok(value) => Cell::of(value),
                Err(e) => error_cell(&e),
            },
            Err(e) => error_cell(&e),
        }
    }
}

struct RowJob {
    row: StoredRow,
    is_new: bool,
}

/// Column selection for a regen strategy. A missing or unknown target
/// column is `ResourceNotFound`.
fn regen_targets(
    dag: &ColumnDag,
    strategy: RegenStrategy,
    output_column_id: Option<&str>,
) -> Result<HashSet<String>> {
    let generated: Vec<&str> = dag.generated_columns().collect();
    if strategy == RegenStrategy::RunAll {
        return Ok(generated.iter().map(|s| (*s).to_string()).collect());
    }
    let target = output_column_id.ok_or_else(|| {
        Error::ResourceNotFound(
            "output_column_id is required for this regen strategy".to_string(),
        )
    })?;
    let target_layer = dag
        .layer_of(target)
        .filter(|layer| *layer > 0)
        .ok_or_else(|| Error::ResourceNotFound(format!("output column {target}")))?;

    let selected: HashSet<String> = match strategy {
        RegenStrategy::RunAll => unreachable!("handled above"),
        RegenStrategy::RunSelected => [target.to_string()].into(),
        RegenStrategy::RunBefore => generated
            .iter()
            .filter(|c| dag.layer_of(c).is_some_and(|l| l < target_layer))
            .map(|s| (*s).to_string())
            .collect(),
        RegenStrategy::RunAfter => generated
            .iter()
            .filter(|c| {
                *c == &target || dag.layer_of(c).is_some_and(|l| l > target_layer)
            })
            .map(|s| (*s).to_string())
            .collect(),
    };
    Ok(selected)
}

async fn emit(
    tx: &Option<mpsc::Sender<CellEvent>>,
    cancel: &CancellationToken,
    event: CellEvent,
) {
    if let Some(tx) = tx {
        if tx.send(event).await.is_err() {
            // Consumer is gone: cancel the whole request scope.
            cancel.cancel();
        }
    }
}

fn error_cell(message: &str) -> Cell {
    Cell::of(serde_json::Value::String(format!("[ERROR] {message}")))
}

fn error_text(error: &Error) -> String {
    match error {
        Error::Llm(jamai_llm::Error::ContextOverflow(_)) => {
            "[ERROR] context length exceeded".to_string()
        }
        other => format!("[ERROR] {other}"),
    }
}

fn error_from(error: &Error) -> Cell {
    Cell::of(serde_json::Value::String(error_text(error)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LlmGenConfig;

    fn input(id: &str) -> ColumnSchema {
        ColumnSchema::input(id, ColumnDtype::Str)
    }

    fn llm(id: &str, prompt: &str) -> ColumnSchema {
        ColumnSchema::generated(
            id,
            ColumnDtype::Str,
            GenConfig::Llm(LlmGenConfig {
                model: String::new(),
                system_prompt: String::new(),
                prompt: prompt.to_string(),
                temperature: None,
                top_p: None,
                max_tokens: None,
                stop: None,
                tools: None,
                multi_turn: false,
                rag_params: None,
            }),
        )
    }

    fn dag() -> ColumnDag {
        let cols = vec![
            input("in_01"),
            input("in_02"),
            llm("out_01", "${in_01}+${in_02}"),
            llm("out_02", "${in_02}-${in_01}"),
            llm("out_03", "${out_01}*${out_02}"),
            llm("out_04", "${out_02}*${out_03}"),
            llm("out_05", "${out_04}/3"),
        ];
        ColumnDag::build(&cols, TableType::Action).unwrap()
    }

    #[test]
    fn test_regen_targets_run_all() {
        let targets = regen_targets(&dag(), RegenStrategy::RunAll, None).unwrap();
        assert_eq!(targets.len(), 5);
    }

    #[test]
    fn test_regen_targets_run_selected() {
        let targets =
            regen_targets(&dag(), RegenStrategy::RunSelected, Some("out_03")).unwrap();
        assert_eq!(targets, ["out_03".to_string()].into());
    }

    #[test]
    fn test_regen_targets_run_before_stops_before_target() {
        let targets =
            regen_targets(&dag(), RegenStrategy::RunBefore, Some("out_03")).unwrap();
        assert_eq!(
            targets,
            ["out_01".to_string(), "out_02".to_string()].into()
        );
    }

    #[test]
    fn test_regen_targets_run_after_includes_target_and_later_layers() {
        let targets =
            regen_targets(&dag(), RegenStrategy::RunAfter, Some("out_02")).unwrap();
        // out_01 shares the target's layer and must not re-run.
        assert!(!targets.contains("out_01"));
        for col in ["out_02", "out_03", "out_04", "out_05"] {
            assert!(targets.contains(col), "missing {col}");
        }
    }

    #[test]
    fn test_regen_targets_require_known_column() {
        let err = regen_targets(&dag(), RegenStrategy::RunAfter, None).unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound(_)));

        let err =
            regen_targets(&dag(), RegenStrategy::RunSelected, Some("nope")).unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound(_)));

        // Input columns are not valid regen targets.
        let err =
            regen_targets(&dag(), RegenStrategy::RunSelected, Some("in_01")).unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound(_)));
    }

    #[test]
    fn test_error_text_context_overflow_literal() {
        let e = Error::Llm(jamai_llm::Error::ContextOverflow("8 > 5".to_string()));
        assert_eq!(error_text(&e), "[ERROR] context length exceeded");

        let e = Error::Llm(jamai_llm::Error::ProviderAuth("denied".to_string()));
        assert!(error_text(&e).starts_with("[ERROR] "));
    }
}
