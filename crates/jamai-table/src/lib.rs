//! JamAI Table - the generative table engine
//!
//! - Schema: tables, columns, dtypes and gen configs
//! - Template: `${col}` interpolation with escapes and multimodal splitting
//! - Planner: column dependency DAG and topological layers
//! - Executor: per-row layered execution with streaming cell events
//! - RAG: hybrid retrieval over Knowledge Tables
//! - Service: schema CRUD, row CRUD, listing, CSV import/export
//! - Store: SQLite persistence with transactional row writes

#![forbid(unsafe_code)]

pub mod code;
pub mod csvio;
pub mod error;
pub mod executor;
pub mod filter;
pub mod planner;
pub mod rag;
pub mod schema;
pub mod service;
pub mod store;
pub mod template;

pub use code::{CodeOutput, CodeRunner, DisabledCodeRunner};
pub use error::{Error, Result};
pub use executor::{CellEvent, ExecContext, GenExecutor, RegenStrategy};
pub use filter::FilterExpr;
pub use planner::ColumnDag;
pub use rag::RagRetriever;
pub use schema::{
    Cell, CodeGenConfig, ColumnDtype, ColumnSchema, EmbedGenConfig, GenConfig, LlmGenConfig,
    RagParams, TableMeta, TableType,
};
pub use service::{CreateTableRequest, ListRowsParams, RowPage, TableService};
pub use store::{StoredRow, TableStore};
