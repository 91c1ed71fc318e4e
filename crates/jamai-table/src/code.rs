//! Code-computed columns
//!
//! The sandbox that actually executes code is an external collaborator; the
//! engine only dispatches through this trait and coerces the result to the
//! target column's dtype.

use crate::schema::ColumnDtype;
use base64::Engine;

/// Result of executing a code cell
#[derive(Debug, Clone, Default)]
pub struct CodeOutput {
    /// Text output (stdout or the final expression)
    pub text: Option<String>,
    /// Image output as (mime type, bytes)
    pub image: Option<(String, Vec<u8>)>,
}

/// Executes the code held in a source column
#[async_trait::async_trait]
pub trait CodeRunner: Send + Sync {
    /// Run the code; a `String` error becomes the cell's `[ERROR]` value.
    async fn run(&self, code: &str) -> std::result::Result<CodeOutput, String>;
}

/// Runner wired when no sandbox is configured; every execution fails.
pub struct DisabledCodeRunner;

#[async_trait::async_trait]
impl CodeRunner for DisabledCodeRunner {
    async fn run(&self, _code: &str) -> std::result::Result<CodeOutput, String> {
        Err("code execution is not configured".to_string())
    }
}

/// Coerce a code result to the column dtype. Strings pass through; image
/// bytes become a data URI the file pipeline can upload later.
pub fn coerce_output(
    dtype: ColumnDtype,
    output: &CodeOutput,
) -> std::result::Result<serde_json::Value, String> {
    match dtype {
        ColumnDtype::Image => match &output.image {
            Some((mime, bytes)) => Ok(serde_json::Value::String(format!(
                "data:{mime};base64,{}",
                base64::engine::general_purpose::STANDARD.encode(bytes)
            ))),
            None => Err("code produced no image output".to_string()),
        },
        _ => match &output.text {
            Some(text) => Ok(serde_json::Value::String(text.clone())),
            None => Err("code produced no text output".to_string()),
        },
    }
}
