//! Table schemas, column dtypes and generation configs

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use jamai_llm::References;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// System-managed columns present on every row
pub const INFO_COLUMNS: [&str; 2] = ["ID", "Updated at"];

/// Maximum column ID length
const COLUMN_ID_MAX_LEN: usize = 100;

static COLUMN_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9.?!@#$%^&*_()\- ]*[A-Za-z0-9.?!()\-])?$")
        .expect("column id pattern is a compile-time constant")
});

static TABLE_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9._\-]*[A-Za-z0-9])?$")
        .expect("table id pattern is a compile-time constant")
});

/// Table flavor; decides which system columns get injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableType {
    /// Flat rows
    Action,
    /// RAG-indexed rows
    Knowledge,
    /// Threaded conversation rows
    Chat,
}

impl TableType {
    /// Stable lowercase name, matching the serde representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Knowledge => "knowledge",
            Self::Chat => "chat",
        }
    }
}

/// Column data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnDtype {
    /// Integer
    Int,
    /// Floating point
    Float,
    /// Boolean
    Bool,
    /// Text
    Str,
    /// Image file URI
    Image,
    /// Audio file URI
    Audio,
    /// Document file URI
    Document,
    /// UTC timestamp
    #[serde(rename = "date-time")]
    DateTime,
    /// Arbitrary JSON (embedding vectors are JSON arrays)
    Json,
}

impl ColumnDtype {
    /// Whether cells hold a file URI.
    #[must_use]
    pub fn is_file(&self) -> bool {
        matches!(self, Self::Image | Self::Audio | Self::Document)
    }
}

/// Retrieval-augmented generation parameters on an LLM column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagParams {
    /// Knowledge table to search
    pub table_id: String,
    /// Query; empty means synthesize one from the row's inputs
    #[serde(default)]
    pub search_query: String,
    /// Number of chunks to retrieve
    #[serde(default = "default_k")]
    pub k: usize,
    /// Optional reranking model ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reranking_model: Option<String>,
    /// Rerank on `Title\nText` instead of `Text` alone
    #[serde(default)]
    pub concat_reranker_input: bool,
    /// Instruct the model to cite chunks inline as `[@i]`
    #[serde(default)]
    pub inline_citations: bool,
}

fn default_k() -> usize {
    3
}

/// Generation config for an LLM-computed column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmGenConfig {
    /// Model ID; empty selects the default chat model
    #[serde(default)]
    pub model: String,
    /// System prompt template (`${col}` references)
    #[serde(default)]
    pub system_prompt: String,
    /// User prompt template (`${col}` references)
    #[serde(default)]
    pub prompt: String,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling probability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Stop sequences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Tools exposed to the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<jamai_llm::Tool>>,
    /// Include prior rows of the table as conversation history
    #[serde(default)]
    pub multi_turn: bool,
    /// RAG retrieval parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag_params: Option<RagParams>,
}

/// Generation config for an embedding-computed column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedGenConfig {
    /// Embedding model ID
    pub embedding_model: String,
    /// Column whose text gets embedded
    pub source_column: String,
}

/// Generation config for a code-computed column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeGenConfig {
    /// Column whose cell holds the code to execute
    pub source_column: String,
}

/// Discriminated union of generation configs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "object")]
pub enum GenConfig {
    /// LLM generation
    #[serde(rename = "gen_config.llm")]
    Llm(LlmGenConfig),
    /// Embedding generation
    #[serde(rename = "gen_config.embed")]
    Embed(EmbedGenConfig),
    /// Code execution
    #[serde(rename = "gen_config.code")]
    Code(CodeGenConfig),
}

impl GenConfig {
    /// The LLM config, if this is an LLM column.
    #[must_use]
    pub fn as_llm(&self) -> Option<&LlmGenConfig> {
        match self {
            Self::Llm(c) => Some(c),
            _ => None,
        }
    }

    /// The embed config, if this is an embedding column.
    #[must_use]
    pub fn as_embed(&self) -> Option<&EmbedGenConfig> {
        match self {
            Self::Embed(c) => Some(c),
            _ => None,
        }
    }
}

/// One column of a table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column ID (also the display name)
    pub id: String,
    /// Data type
    pub dtype: ColumnDtype,
    /// How the column is computed; `None` means user input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen_config: Option<GenConfig>,
}

impl ColumnSchema {
    /// An input (non-generated) column.
    #[must_use]
    pub fn input(id: impl Into<String>, dtype: ColumnDtype) -> Self {
        Self {
            id: id.into(),
            dtype,
            gen_config: None,
        }
    }

    /// A generated column.
    #[must_use]
    pub fn generated(id: impl Into<String>, dtype: ColumnDtype, config: GenConfig) -> Self {
        Self {
            id: id.into(),
            dtype,
            gen_config: Some(config),
        }
    }

    /// Whether this is a system info column (`ID`, `Updated at`).
    #[must_use]
    pub fn is_info(&self) -> bool {
        INFO_COLUMNS.iter().any(|c| c.eq_ignore_ascii_case(&self.id))
    }

    /// Whether this column stores an embedding vector.
    #[must_use]
    pub fn is_vector(&self) -> bool {
        matches!(self.gen_config, Some(GenConfig::Embed(_)))
    }
}

/// Table metadata: identity, lineage and column schemas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    /// Table ID, unique within (project, table type)
    pub id: String,
    /// Table flavor
    pub table_type: TableType,
    /// Chat-agent parent or knowledge lineage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Display title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Columns in table order, info columns first
    pub cols: Vec<ColumnSchema>,
    /// Bumped on every schema mutation
    pub version: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Row count, filled on read paths that know it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_rows: Option<i64>,
}

impl TableMeta {
    /// Look up a column by ID.
    #[must_use]
    pub fn column(&self, id: &str) -> Option<&ColumnSchema> {
        self.cols.iter().find(|c| c.id == id)
    }

    /// Columns excluding the system info columns.
    pub fn user_columns(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.cols.iter().filter(|c| !c.is_info())
    }
}

/// One stored cell: the value plus the interpolation/RAG side channels
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cell {
    /// The cell value
    pub value: serde_json::Value,
    /// The user-entered prompt this value replaced, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<serde_json::Value>,
    /// RAG chunks used to generate the value, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<References>,
}

impl Cell {
    /// A plain value cell.
    #[must_use]
    pub fn of(value: serde_json::Value) -> Self {
        Self {
            value,
            original: None,
            references: None,
        }
    }

    /// The value as text: strings pass through, everything else serializes.
    #[must_use]
    pub fn as_text(&self) -> String {
        match &self.value {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Validate a user column ID: pattern, length and reserved names.
pub fn validate_column_id(id: &str) -> Result<()> {
    if id.len() > COLUMN_ID_MAX_LEN {
        return Err(Error::BadInput(format!(
            "column id exceeds {COLUMN_ID_MAX_LEN} characters: {id}"
        )));
    }
    if !COLUMN_ID_PATTERN.is_match(id) {
        return Err(Error::BadInput(format!("invalid column id: {id:?}")));
    }
    if INFO_COLUMNS.iter().any(|c| c.eq_ignore_ascii_case(id)) {
        return Err(Error::BadInput(format!("column id is reserved: {id}")));
    }
    Ok(())
}

/// Validate a table ID.
pub fn validate_table_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 100 || !TABLE_ID_PATTERN.is_match(id) {
        return Err(Error::BadInput(format!("invalid table id: {id:?}")));
    }
    Ok(())
}

/// The system columns injected into every table.
#[must_use]
pub fn info_columns() -> Vec<ColumnSchema> {
    vec![
        ColumnSchema::input("ID", ColumnDtype::Str),
        ColumnSchema::input("Updated at", ColumnDtype::DateTime),
    ]
}

/// The columns injected into a Knowledge Table, bound to its embedding model.
#[must_use]
pub fn knowledge_columns(embedding_model: &str) -> Vec<ColumnSchema> {
    vec![
        ColumnSchema::input("Title", ColumnDtype::Str),
        ColumnSchema::input("Text", ColumnDtype::Str),
        ColumnSchema::input("File ID", ColumnDtype::Str),
        ColumnSchema::input("Page", ColumnDtype::Int),
        ColumnSchema::generated(
            "Title Embed",
            ColumnDtype::Json,
            GenConfig::Embed(EmbedGenConfig {
                embedding_model: embedding_model.to_string(),
                source_column: "Title".to_string(),
            }),
        ),
        ColumnSchema::generated(
            "Text Embed",
            ColumnDtype::Json,
            GenConfig::Embed(EmbedGenConfig {
                embedding_model: embedding_model.to_string(),
                source_column: "Text".to_string(),
            }),
        ),
    ]
}

/// The columns injected into a Chat Table. `AI` always carries a multi-turn
/// LLM config.
#[must_use]
pub fn chat_columns() -> Vec<ColumnSchema> {
    vec![
        ColumnSchema::input("User", ColumnDtype::Str),
        ColumnSchema::generated(
            "AI",
            ColumnDtype::Str,
            GenConfig::Llm(LlmGenConfig {
                model: String::new(),
                system_prompt: String::new(),
                prompt: String::new(),
                temperature: None,
                top_p: None,
                max_tokens: None,
                stop: None,
                tools: None,
                multi_turn: true,
                rag_params: None,
            }),
        ),
    ]
}
