//! End-to-end generative table flows against a deterministic adapter.
//!
//! The adapter evaluates arithmetic expressions found in the user prompt,
//! so `${a}+${b}` templates produce checkable cell values without a live
//! provider.

use jamai_billing::{
    BillingManager, DeploymentMode, EventBuffer, Organization, OrgStore, Project, TracingSink,
};
use jamai_llm::registry::{Capability, Deployment, ModelConfig, ModelType};
use jamai_llm::types::{
    AssistantMessage, ChatChunk, ChatRequest, ChatResponse, CompletionUsage, EmbeddingData,
    EmbeddingRequest, EmbeddingResponse, EmbeddingUsage, EmbeddingVector, FinishReason,
    RerankRequest, RerankResponse,
};
use jamai_llm::{
    AdapterSet, ChunkStream, ModelRegistry, ModelRouter, Provider, ProviderAdapter, RouteOptions,
};
use jamai_table::schema::{ColumnDtype, ColumnSchema, GenConfig, LlmGenConfig, RagParams};
use jamai_table::{
    CellEvent, CreateTableRequest, DisabledCodeRunner, ExecContext, ListRowsParams,
    RegenStrategy, TableService, TableStore, TableType,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Evaluates `a op b` from the last user message; echoes the prompt when it
/// is not an expression.
struct EvalAdapter {
    delay: Duration,
}

impl EvalAdapter {
    fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }

    fn answer(request: &ChatRequest) -> String {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == jamai_llm::MessageRole::User)
            .map(|m| m.content.as_text())
            .unwrap_or_default();
        match eval_expression(&prompt) {
            Some(value) => format_number(value),
            None => prompt,
        }
    }
}

fn eval_expression(input: &str) -> Option<f64> {
    let s = input.trim();
    for (i, c) in s.char_indices().skip(1) {
        if matches!(c, '+' | '-' | '*' | '/') {
            let a: f64 = s[..i].trim().parse().ok()?;
            let b: f64 = s[i + 1..].trim().parse().ok()?;
            return Some(match c {
                '+' => a + b,
                '-' => a - b,
                '*' => a * b,
                _ => a / b,
            });
        }
    }
    None
}

fn format_number(value: f64) -> String {
    if value.fract().abs() < 1e-9 {
        format!("{}", value as i64)
    } else {
        format!("{value:.2}")
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for EvalAdapter {
    fn name(&self) -> &'static str {
        "eval"
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        _deployment: &Deployment,
        _api_key: &str,
    ) -> jamai_llm::Result<ChatResponse> {
        tokio::time::sleep(self.delay).await;
        Ok(ChatResponse::new(
            request.model.clone(),
            AssistantMessage {
                role: "assistant".to_string(),
                content: Some(Self::answer(request)),
                reasoning_content: None,
                tool_calls: Vec::new(),
            },
            Some(FinishReason::Stop),
            Some(CompletionUsage::new(4, 2)),
        ))
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        _deployment: &Deployment,
        _api_key: &str,
    ) -> jamai_llm::Result<ChunkStream> {
        tokio::time::sleep(self.delay).await;
        let answer = Self::answer(request);
        let content = ChatChunk::content("stream", &request.model, answer);
        let tail = ChatChunk::tail(
            "stream",
            &request.model,
            FinishReason::Stop,
            Some(CompletionUsage::new(4, 2)),
        );
        Ok(Box::pin(futures::stream::iter(vec![Ok(content), Ok(tail)])))
    }

    async fn embed(
        &self,
        request: &EmbeddingRequest,
        _deployment: &Deployment,
        _api_key: &str,
    ) -> jamai_llm::Result<EmbeddingResponse> {
        let data = request
            .input
            .texts()
            .iter()
            .enumerate()
            .map(|(i, text)| EmbeddingData {
                object: "embedding".to_string(),
                embedding: EmbeddingVector::Float(vec![
                    text.len() as f32,
                    1.0,
                    0.5,
                    0.25,
                ]),
                index: i as u32,
            })
            .collect();
        Ok(EmbeddingResponse {
            object: "list".to_string(),
            data,
            model: request.model.clone(),
            usage: EmbeddingUsage {
                prompt_tokens: 2,
                total_tokens: 2,
            },
        })
    }

    async fn rerank(
        &self,
        _request: &RerankRequest,
        _deployment: &Deployment,
        _api_key: &str,
    ) -> jamai_llm::Result<RerankResponse> {
        Err(jamai_llm::Error::BadInput("not supported".to_string()))
    }
}

struct TestEnv {
    service: Arc<TableService>,
    orgs: Arc<OrgStore>,
    buffer: Arc<EventBuffer>,
    mode: DeploymentMode,
}

impl TestEnv {
    fn ctx(&self) -> ExecContext {
        ExecContext {
            project_id: "proj".to_string(),
            opts: RouteOptions::for_org("org"),
            billing: Arc::new(Mutex::new(BillingManager::new(
                self.orgs.clone(),
                self.buffer.clone(),
                self.mode,
                "org",
                "proj",
            ))),
        }
    }
}

fn chat_model(id: &str, context_length: u32) -> ModelConfig {
    ModelConfig {
        id: id.to_string(),
        name: String::new(),
        owned_by: "test".to_string(),
        model_type: ModelType::Llm,
        capabilities: vec![Capability::Chat],
        context_length,
        languages: vec!["en".to_string()],
        embedding_size: None,
        embedding_dimensions: None,
        llm_input_cost_per_mtoken: 1.0,
        llm_output_cost_per_mtoken: 2.0,
        embedding_cost_per_mtoken: 0.0,
        reranking_cost_per_ksearch: 0.0,
        allowed_orgs: Vec::new(),
        blocked_orgs: Vec::new(),
        timeout_secs: 30,
        priority: 0,
    }
}

async fn setup(mode: DeploymentMode, delay: Duration) -> TestEnv {
    let registry = Arc::new(ModelRegistry::new());
    registry.upsert_model(chat_model("test/eval", 8192)).await.unwrap();
    registry.upsert_model(chat_model("test/tiny", 5)).await.unwrap();
    let mut embed = chat_model("test/embed", 8192);
    embed.model_type = ModelType::Embed;
    embed.capabilities = vec![Capability::Embed];
    embed.embedding_size = Some(4);
    registry.upsert_model(embed).await.unwrap();
    for id in ["test/eval", "test/tiny", "test/embed"] {
        registry
            .add_deployment(Deployment::new(id, Provider::Custom, "native"))
            .await
            .unwrap();
    }

    let mut adapters = AdapterSet::empty();
    adapters.insert(Provider::Custom, Arc::new(EvalAdapter::with_delay(delay)));
    let router = Arc::new(ModelRouter::new(registry.clone(), adapters));

    let orgs = Arc::new(OrgStore::new());
    orgs.create_org(Organization::new("org", "Test Org")).await.unwrap();
    let mut project = Project::new("org", "Test Project");
    project.id = "proj".to_string();
    orgs.create_project(project).await.unwrap();

    let buffer = Arc::new(EventBuffer::new(1000, Arc::new(TracingSink)));
    let store = TableStore::connect("sqlite::memory:").await.unwrap();
    let service = Arc::new(TableService::new(
        store,
        registry,
        router,
        Arc::new(DisabledCodeRunner),
        8,
    ));
    TestEnv {
        service,
        orgs,
        buffer,
        mode,
    }
}

fn llm_col(id: &str, model: &str, prompt: &str) -> ColumnSchema {
    ColumnSchema::generated(
        id,
        ColumnDtype::Str,
        GenConfig::Llm(LlmGenConfig {
            model: model.to_string(),
            system_prompt: "Evaluate the expression.".to_string(),
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

fn arithmetic_table(id: &str) -> CreateTableRequest {
    CreateTableRequest {
        id: id.to_string(),
        cols: vec![
            ColumnSchema::input("in_01", ColumnDtype::Int),
            ColumnSchema::input("in_02", ColumnDtype::Int),
            llm_col("out_01", "test/eval", "${in_01}+${in_02}"),
            llm_col("out_02", "test/eval", "${in_02}-${in_01}"),
            llm_col("out_03", "test/eval", "${out_01}*${out_02}"),
            llm_col("out_04", "test/eval", "${out_02}*${out_03}"),
            llm_col("out_05", "test/eval", "${out_04}/3"),
        ],
        embedding_model: None,
        parent_id: None,
        title: None,
    }
}

fn row_data(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn test_add_row_executes_dag_in_order() {
    let env = setup(DeploymentMode::Oss, Duration::ZERO).await;
    env.service
        .create_table("org", "proj", TableType::Action, arithmetic_table("calc"))
        .await
        .unwrap();

    let ctx = env.ctx();
    let rows = env
        .service
        .add_rows(
            &ctx,
            TableType::Action,
            "calc",
            vec![row_data(&[
                ("in_01", serde_json::json!(8)),
                ("in_02", serde_json::json!(2)),
            ])],
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.cell("out_01").as_text(), "10");
    assert_eq!(row.cell("out_02").as_text(), "-6");
    assert_eq!(row.cell("out_03").as_text(), "-60");
    assert_eq!(row.cell("out_04").as_text(), "360");
    assert_eq!(row.cell("out_05").as_text(), "120");
}

#[tokio::test]
async fn test_regen_run_after_recomputes_later_layers_only() {
    let env = setup(DeploymentMode::Oss, Duration::ZERO).await;
    env.service
        .create_table("org", "proj", TableType::Action, arithmetic_table("calc"))
        .await
        .unwrap();

    let ctx = env.ctx();
    let rows = env
        .service
        .add_rows(
            &ctx,
            TableType::Action,
            "calc",
            vec![row_data(&[
                ("in_01", serde_json::json!(8)),
                ("in_02", serde_json::json!(2)),
            ])],
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let row_id = rows[0].id.clone();

    env.service
        .update_row(
            "proj",
            TableType::Action,
            "calc",
            &row_id,
            row_data(&[
                ("in_01", serde_json::json!(9)),
                ("in_02", serde_json::json!(8)),
            ]),
        )
        .await
        .unwrap();

    let ctx = env.ctx();
    let rows = env
        .service
        .regen_rows(
            &ctx,
            TableType::Action,
            "calc",
            &[row_id],
            RegenStrategy::RunAfter,
            Some("out_02"),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let row = &rows[0];
    // out_01 shares the target's layer: untouched.
    assert_eq!(row.cell("out_01").as_text(), "10");
    assert_eq!(row.cell("out_02").as_text(), "-1");
    assert_eq!(row.cell("out_03").as_text(), "-10");
    assert_eq!(row.cell("out_04").as_text(), "10");
    assert_eq!(row.cell("out_05").as_text(), "3.33");
}

#[tokio::test]
async fn test_independent_columns_run_concurrently() {
    let env = setup(DeploymentMode::Oss, Duration::from_millis(100)).await;
    let request = CreateTableRequest {
        id: "wide".to_string(),
        cols: vec![
            ColumnSchema::input("x", ColumnDtype::Int),
            llm_col("a", "test/eval", "${x}+1"),
            llm_col("b", "test/eval", "${x}+2"),
            llm_col("c", "test/eval", "${x}+3"),
        ],
        embedding_model: None,
        parent_id: None,
        title: None,
    };
    env.service
        .create_table("org", "proj", TableType::Action, request)
        .await
        .unwrap();

    let ctx = env.ctx();
    let started = std::time::Instant::now();
    let rows = env
        .service
        .add_rows(
            &ctx,
            TableType::Action,
            "wide",
            vec![row_data(&[("x", serde_json::json!(1))])],
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(rows[0].cell("a").as_text(), "2");
    assert_eq!(rows[0].cell("b").as_text(), "3");
    assert_eq!(rows[0].cell("c").as_text(), "4");
    // Three independent 100ms columns in one layer should take about as
    // long as one of them, never the sequential 300ms.
    assert!(
        elapsed < Duration::from_millis(250),
        "columns ran sequentially: {elapsed:?}"
    );
}

#[tokio::test]
async fn test_streaming_events_ordering_contract() {
    let env = setup(DeploymentMode::Oss, Duration::ZERO).await;
    env.service
        .create_table("org", "proj", TableType::Action, arithmetic_table("calc"))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(256);
    let ctx = env.ctx();
    let service = env.service.clone();
    let handle = tokio::spawn(async move {
        service
            .add_rows(
                &ctx,
                TableType::Action,
                "calc",
                vec![row_data(&[
                    ("in_01", serde_json::json!(1)),
                    ("in_02", serde_json::json!(2)),
                ])],
                Some(tx),
                CancellationToken::new(),
            )
            .await
    });

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    handle.await.unwrap().unwrap();

    // Per column: every chunk precedes the single usage tail.
    let mut closed: Vec<String> = Vec::new();
    let mut row_done = false;
    for event in &events {
        match event {
            CellEvent::Chunk { column_id, .. } => {
                assert!(
                    !closed.contains(column_id),
                    "chunk for {column_id} after its usage tail"
                );
                assert!(!row_done, "chunk after RowDone");
            }
            CellEvent::Usage { column_id, .. } => {
                assert!(!closed.contains(column_id), "duplicate usage tail");
                closed.push(column_id.clone());
            }
            CellEvent::References { .. } => {}
            CellEvent::RowDone { .. } => row_done = true,
        }
    }
    assert!(row_done, "missing RowDone");
    assert_eq!(closed.len(), 5, "one usage tail per generated column");
}

#[tokio::test]
async fn test_rag_on_empty_knowledge_table_yields_empty_references() {
    let env = setup(DeploymentMode::Oss, Duration::ZERO).await;
    env.service
        .create_table(
            "org",
            "proj",
            TableType::Knowledge,
            CreateTableRequest {
                id: "KT".to_string(),
                cols: Vec::new(),
                embedding_model: Some("test/embed".to_string()),
                parent_id: None,
                title: None,
            },
        )
        .await
        .unwrap();

    let mut rag_col = llm_col("answer", "test/eval", "${q}");
    if let Some(GenConfig::Llm(cfg)) = &mut rag_col.gen_config {
        cfg.rag_params = Some(RagParams {
            table_id: "KT".to_string(),
            search_query: "anything".to_string(),
            k: 2,
            reranking_model: None,
            concat_reranker_input: false,
            inline_citations: false,
        });
    }
    env.service
        .create_table(
            "org",
            "proj",
            TableType::Action,
            CreateTableRequest {
                id: "asker".to_string(),
                cols: vec![ColumnSchema::input("q", ColumnDtype::Str), rag_col],
                embedding_model: None,
                parent_id: None,
                title: None,
            },
        )
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(64);
    let ctx = env.ctx();
    let service = env.service.clone();
    let handle = tokio::spawn(async move {
        service
            .add_rows(
                &ctx,
                TableType::Action,
                "asker",
                vec![row_data(&[("q", serde_json::json!("1+1"))])],
                Some(tx),
                CancellationToken::new(),
            )
            .await
    });

    let mut references = None;
    let mut saw_chunk_after_references = false;
    while let Some(event) = rx.recv().await {
        match event {
            CellEvent::References { references: r, .. } => references = Some(r),
            CellEvent::Chunk { .. } if references.is_some() => {
                saw_chunk_after_references = true;
            }
            _ => {}
        }
    }
    let rows = handle.await.unwrap().unwrap();

    let references = references.expect("references event must be emitted");
    assert!(references.chunks.is_empty());
    assert!(saw_chunk_after_references, "references must precede content");
    // Content is still generated without citations.
    assert_eq!(rows[0].cell("answer").as_text(), "2");
}

#[tokio::test]
async fn test_quota_gate_blocks_without_credit_and_records_nothing() {
    let env = setup(DeploymentMode::Cloud, Duration::ZERO).await;
    env.service
        .create_table(
            "org",
            "proj",
            TableType::Action,
            CreateTableRequest {
                id: "t".to_string(),
                cols: vec![
                    ColumnSchema::input("x", ColumnDtype::Int),
                    llm_col("y", "test/eval", "${x}+1"),
                ],
                embedding_model: None,
                parent_id: None,
                title: None,
            },
        )
        .await
        .unwrap();

    let ctx = env.ctx();
    let billing = ctx.billing.clone();
    let rows = env
        .service
        .add_rows(
            &ctx,
            TableType::Action,
            "t",
            vec![row_data(&[("x", serde_json::json!(1))])],
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let value = rows[0].cell("y").as_text();
    assert!(value.starts_with("[ERROR]"), "got {value:?}");
    assert!(value.contains("insufficient credits"));
    // No usage was recorded, so nothing reaches the analytics buffer.
    assert!(!billing.lock().await.has_usage());
    assert!(env.buffer.is_empty().await);
}

#[tokio::test]
async fn test_context_overflow_writes_error_literal_downstream() {
    let env = setup(DeploymentMode::Oss, Duration::ZERO).await;
    env.service
        .create_table(
            "org",
            "proj",
            TableType::Action,
            CreateTableRequest {
                id: "tiny".to_string(),
                cols: vec![
                    ColumnSchema::input("x", ColumnDtype::Str),
                    llm_col("small", "test/tiny", "${x}"),
                    llm_col("echo", "test/eval", "${small}"),
                ],
                embedding_model: None,
                parent_id: None,
                title: None,
            },
        )
        .await
        .unwrap();

    let ctx = env.ctx();
    let rows = env
        .service
        .add_rows(
            &ctx,
            TableType::Action,
            "tiny",
            vec![row_data(&[(
                "x",
                serde_json::json!("Hi there how is your day going?"),
            )])],
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let row = &rows[0];
    assert_eq!(row.cell("small").as_text(), "[ERROR] context length exceeded");
    // Downstream interpolation treats the error cell as a literal string.
    assert_eq!(row.cell("echo").as_text(), "[ERROR] context length exceeded");
}

#[tokio::test]
async fn test_import_generates_missing_columns() {
    let env = setup(DeploymentMode::Oss, Duration::ZERO).await;
    env.service
        .create_table(
            "org",
            "proj",
            TableType::Action,
            CreateTableRequest {
                id: "t".to_string(),
                cols: vec![
                    ColumnSchema::input("a", ColumnDtype::Int),
                    ColumnSchema::input("b", ColumnDtype::Int),
                    llm_col("sum", "test/eval", "${a}+${b}"),
                ],
                embedding_model: None,
                parent_id: None,
                title: None,
            },
        )
        .await
        .unwrap();

    let ctx = env.ctx();
    let rows = env
        .service
        .import_data(&ctx, TableType::Action, "t", b"a,b\n1,2\n10,5\n", b',')
        .await
        .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].cell("sum").as_text(), "3");
    assert_eq!(rows[1].cell("sum").as_text(), "15");

    // Export carries the generated values back out.
    let exported = env
        .service
        .export_data("proj", TableType::Action, "t", b',')
        .await
        .unwrap();
    let text = String::from_utf8(exported).unwrap();
    assert!(text.contains("15"));
}

#[tokio::test]
async fn test_list_rows_filters_and_paginates() {
    let env = setup(DeploymentMode::Oss, Duration::ZERO).await;
    env.service
        .create_table(
            "org",
            "proj",
            TableType::Action,
            CreateTableRequest {
                id: "t".to_string(),
                cols: vec![
                    ColumnSchema::input("name", ColumnDtype::Str),
                    ColumnSchema::input("n", ColumnDtype::Int),
                ],
                embedding_model: None,
                parent_id: None,
                title: None,
            },
        )
        .await
        .unwrap();

    let ctx = env.ctx();
    let data = (0..5)
        .map(|i| {
            row_data(&[
                ("name", serde_json::json!(format!("row-{i}"))),
                ("n", serde_json::json!(i)),
            ])
        })
        .collect();
    env.service
        .add_rows(&ctx, TableType::Action, "t", data, None, CancellationToken::new())
        .await
        .unwrap();

    let params = ListRowsParams {
        where_: Some(r#""n" = 3 OR "n" = 4"#.to_string()),
        order_by: "n".to_string(),
        order_ascending: true,
        limit: 1,
        ..Default::default()
    };
    let page = env
        .service
        .list_rows("proj", TableType::Action, "t", &params)
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0]["n"]["value"], serde_json::json!(3));

    // Search query combines with the filter by AND.
    let params = ListRowsParams {
        where_: Some(r#""n" = 3 OR "n" = 4"#.to_string()),
        search_query: "row-4".to_string(),
        ..Default::default()
    };
    let page = env
        .service
        .list_rows("proj", TableType::Action, "t", &params)
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0]["name"]["value"], serde_json::json!("row-4"));
}

#[tokio::test]
async fn test_knowledge_rows_embed_and_hybrid_search() {
    let env = setup(DeploymentMode::Oss, Duration::ZERO).await;
    env.service
        .create_table(
            "org",
            "proj",
            TableType::Knowledge,
            CreateTableRequest {
                id: "kt".to_string(),
                cols: Vec::new(),
                embedding_model: Some("test/embed".to_string()),
                parent_id: None,
                title: None,
            },
        )
        .await
        .unwrap();

    let ctx = env.ctx();
    let rows = env
        .service
        .add_rows(
            &ctx,
            TableType::Knowledge,
            "kt",
            vec![
                row_data(&[
                    ("Title", serde_json::json!("Cats")),
                    ("Text", serde_json::json!("cats purr and nap all day")),
                ]),
                row_data(&[
                    ("Title", serde_json::json!("Rust")),
                    ("Text", serde_json::json!("the borrow checker enforces ownership")),
                ]),
            ],
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // Embedding columns were generated on write.
    for row in &rows {
        let vector: Vec<f32> =
            serde_json::from_value(row.cell("Text Embed").value.clone()).unwrap();
        assert_eq!(vector.len(), 4);
    }

    let results = env
        .service
        .hybrid_search(
            &RouteOptions::for_org("org"),
            "proj",
            TableType::Knowledge,
            "kt",
            "borrow checker ownership",
            5,
        )
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results[0].contains_key("rrf_score"));
    assert_eq!(
        results[0]["Title"]["value"],
        serde_json::json!("Rust"),
        "keyword match should rank the Rust row first"
    );
}

#[tokio::test]
async fn test_chat_table_multi_turn_history() {
    let env = setup(DeploymentMode::Oss, Duration::ZERO).await;
    env.service
        .create_table(
            "org",
            "proj",
            TableType::Chat,
            CreateTableRequest {
                id: "thread".to_string(),
                cols: Vec::new(),
                embedding_model: None,
                parent_id: None,
                title: None,
            },
        )
        .await
        .unwrap();

    // Point the AI column at the eval model with a direct prompt. The
    // service forces multi_turn back on even though we submit false.
    let mut update = HashMap::new();
    update.insert(
        "AI".to_string(),
        Some(GenConfig::Llm(LlmGenConfig {
            model: "test/eval".to_string(),
            system_prompt: String::new(),
            prompt: "${User}".to_string(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            tools: None,
            multi_turn: false,
            rag_params: None,
        })),
    );
    let meta = env
        .service
        .update_gen_config("org", "proj", TableType::Chat, "thread", update)
        .await
        .unwrap();
    let Some(GenConfig::Llm(cfg)) = &meta.column("AI").unwrap().gen_config else {
        panic!("AI must keep an LLM config");
    };
    assert!(cfg.multi_turn, "multi_turn must be forced true");

    let ctx = env.ctx();
    let first = env
        .service
        .add_rows(
            &ctx,
            TableType::Chat,
            "thread",
            vec![row_data(&[("User", serde_json::json!("2+3"))])],
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(first[0].cell("AI").as_text(), "5");

    let ctx = env.ctx();
    let second = env
        .service
        .add_rows(
            &ctx,
            TableType::Chat,
            "thread",
            vec![row_data(&[("User", serde_json::json!("7*6"))])],
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(second[0].cell("AI").as_text(), "42");
}
