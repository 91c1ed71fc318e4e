//! Column DAG planner
//!
//! Builds the dependency graph over a table's columns from their generation
//! configs and groups them into topological layers. Acyclicity holds by
//! construction: a column may only reference columns strictly before it in
//! table order, so full cycle detection is never needed.

use crate::error::{Error, Result};
use crate::schema::{ColumnSchema, GenConfig, TableType};
use crate::template::template_references;
use std::collections::HashMap;

/// The planned dependency graph of one table version
#[derive(Debug, Clone)]
pub struct ColumnDag {
    /// Referenced column IDs per generated column
    refs: HashMap<String, Vec<String>>,
    /// Topological layers; layer 0 holds the input columns
    layers: Vec<Vec<String>>,
    /// Layer index per column
    layer_of: HashMap<String, usize>,
}

impl ColumnDag {
    /// Build the DAG for an ordered column list, validating every
    /// reference. Fails when a reference does not exist, does not strictly
    /// precede its column, or points at an info or vector column.
    pub fn build(cols: &[ColumnSchema], table_type: TableType) -> Result<Self> {
        let order: HashMap<&str, usize> = cols
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.as_str(), i))
            .collect();

        let mut refs = HashMap::new();
        let mut layer_of: HashMap<String, usize> = HashMap::new();
        let mut layers: Vec<Vec<String>> = vec![Vec::new()];

        for (position, col) in cols.iter().enumerate() {
            let Some(config) = &col.gen_config else {
                layer_of.insert(col.id.clone(), 0);
                layers[0].push(col.id.clone());
                continue;
            };

            let references = column_references(col, config, table_type);
            for reference in &references {
                let Some(&ref_position) = order.get(reference.as_str()) else {
                    return Err(Error::BadInput(format!(
                        "invalid source column for `{}`: `{reference}` does not exist",
                        col.id
                    )));
                };
                if ref_position >= position {
                    return Err(Error::BadInput(format!(
                        "invalid source column for `{}`: `{reference}` must come before it",
                        col.id
                    )));
                }
                let referenced = &cols[ref_position];
                if referenced.is_info() {
                    return Err(Error::BadInput(format!(
                        "invalid source column for `{}`: `{reference}` is an info column",
                        col.id
                    )));
                }
                if referenced.is_vector() {
                    return Err(Error::BadInput(format!(
                        "invalid source column for `{}`: `{reference}` is a vector column",
                        col.id
                    )));
                }
            }

            // Smallest layer strictly above every referenced layer.
            let layer = references
                .iter()
                .filter_map(|r| layer_of.get(r.as_str()))
                .max()
                .map_or(1, |max| (*max).max(0) + 1)
                .max(1);
            while layers.len() <= layer {
                layers.push(Vec::new());
            }
            layers[layer].push(col.id.clone());
            layer_of.insert(col.id.clone(), layer);
            refs.insert(col.id.clone(), references);
        }

        Ok(Self {
            refs,
            layers,
            layer_of,
        })
    }

    /// The columns a generated column references.
    #[must_use]
    pub fn references(&self, column_id: &str) -> &[String] {
        self.refs
            .get(column_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Layer index of a column; inputs live in layer 0.
    #[must_use]
    pub fn layer_of(&self, column_id: &str) -> Option<usize> {
        self.layer_of.get(column_id).copied()
    }

    /// Execution layers (layer 1 and up), in order.
    pub fn execution_layers(&self) -> impl Iterator<Item = &[String]> {
        self.layers.iter().skip(1).map(Vec::as_slice)
    }

    /// Every generated column in execution order.
    pub fn generated_columns(&self) -> impl Iterator<Item = &str> {
        self.execution_layers().flatten().map(String::as_str)
    }
}

/// The reference set of one generated column: template references for LLM
/// columns, the source column for embed and code columns, plus `User` for
/// multi-turn Chat Table columns.
fn column_references(
    col: &ColumnSchema,
    config: &GenConfig,
    table_type: TableType,
) -> Vec<String> {
    let mut references = match config {
        GenConfig::Llm(llm) => {
            let mut refs = template_references(&llm.system_prompt);
            for r in template_references(&llm.prompt) {
                if !refs.contains(&r) {
                    refs.push(r);
                }
            }
            if llm.multi_turn && table_type == TableType::Chat {
                let user = "User".to_string();
                if col.id != user && !refs.contains(&user) {
                    refs.push(user);
                }
            }
            refs
        }
        GenConfig::Embed(embed) => vec![embed.source_column.clone()],
        GenConfig::Code(code) => vec![code.source_column.clone()],
    };
    references.retain(|r| r != &col.id);
    references
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDtype, EmbedGenConfig, LlmGenConfig};

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

    #[test]
    fn test_layers_from_chained_references() {
        let cols = vec![
            input("ID"),
            input("in_01"),
            input("in_02"),
            llm("out_01", "${in_01}+${in_02}"),
            llm("out_02", "${in_02}-${in_01}"),
            llm("out_03", "${out_01}*${out_02}"),
            llm("out_04", "${out_02}*${out_03}"),
        ];
        let dag = ColumnDag::build(&cols, TableType::Action).unwrap();
        assert_eq!(dag.layer_of("in_01"), Some(0));
        assert_eq!(dag.layer_of("out_01"), Some(1));
        assert_eq!(dag.layer_of("out_02"), Some(1));
        assert_eq!(dag.layer_of("out_03"), Some(2));
        assert_eq!(dag.layer_of("out_04"), Some(3));

        let layers: Vec<Vec<String>> = dag
            .execution_layers()
            .map(<[String]>::to_vec)
            .collect();
        assert_eq!(layers[0], vec!["out_01", "out_02"]);
        assert_eq!(layers[1], vec!["out_03"]);
        assert_eq!(layers[2], vec!["out_04"]);
    }

    #[test]
    fn test_forward_reference_rejected() {
        let cols = vec![input("a"), llm("x", "${y}"), llm("y", "${a}")];
        let err = ColumnDag::build(&cols, TableType::Action).unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
        assert!(err.to_string().contains("invalid source column"));
    }

    #[test]
    fn test_self_and_unknown_references() {
        let cols = vec![input("a"), llm("x", "${nope}")];
        assert!(ColumnDag::build(&cols, TableType::Action).is_err());

        // A self reference is dropped rather than cyclic.
        let cols = vec![input("a"), llm("x", "${x}${a}")];
        let dag = ColumnDag::build(&cols, TableType::Action).unwrap();
        assert_eq!(dag.references("x"), ["a".to_string()]);
    }

    #[test]
    fn test_info_and_vector_references_rejected() {
        let cols = vec![input("ID"), llm("x", "${ID}")];
        assert!(ColumnDag::build(&cols, TableType::Action).is_err());

        let cols = vec![
            input("Text"),
            ColumnSchema::generated(
                "Text Embed",
                ColumnDtype::Json,
                GenConfig::Embed(EmbedGenConfig {
                    embedding_model: "openai/te3".to_string(),
                    source_column: "Text".to_string(),
                }),
            ),
            llm("x", "${Text Embed}"),
        ];
        assert!(ColumnDag::build(&cols, TableType::Action).is_err());
    }

    #[test]
    fn test_multi_turn_chat_column_depends_on_user() {
        let mut ai = llm("AI", "");
        if let Some(GenConfig::Llm(cfg)) = &mut ai.gen_config {
            cfg.multi_turn = true;
        }
        let cols = vec![input("User"), ai];
        let dag = ColumnDag::build(&cols, TableType::Chat).unwrap();
        assert_eq!(dag.references("AI"), ["User".to_string()]);

        // Outside a chat table, multi_turn adds no implicit reference.
        let mut ai = llm("AI", "");
        if let Some(GenConfig::Llm(cfg)) = &mut ai.gen_config {
            cfg.multi_turn = true;
        }
        let cols = vec![input("User"), ai];
        let dag = ColumnDag::build(&cols, TableType::Action).unwrap();
        assert!(dag.references("AI").is_empty());
    }

    #[test]
    fn test_generated_without_references_runs_in_first_layer() {
        let cols = vec![llm("solo", "say hi")];
        let dag = ColumnDag::build(&cols, TableType::Action).unwrap();
        assert_eq!(dag.layer_of("solo"), Some(1));
    }
}
