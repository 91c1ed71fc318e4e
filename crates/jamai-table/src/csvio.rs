//! CSV / TSV import and export
//!
//! The header row carries column names. Import coerces strings to the
//! column dtype (`"True"`/`"False"` to bool, numeric strings to int/float
//! with truncation, empty string to null); vector columns round-trip as
//! JSON-encoded arrays.

use crate::error::{Error, Result};
use crate::schema::{Cell, ColumnDtype, TableMeta};
use crate::store::StoredRow;
use std::collections::HashMap;

/// Coerce a CSV string to a cell value of the given dtype.
pub fn coerce_value(dtype: ColumnDtype, raw: &str) -> Result<serde_json::Value> {
    if raw.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    match dtype {
        ColumnDtype::Int => {
            if let Ok(i) = raw.parse::<i64>() {
                return Ok(serde_json::json!(i));
            }
            // Float-shaped strings truncate toward zero.
            raw.parse::<f64>()
                .map(|f| serde_json::json!(f.trunc() as i64))
                .map_err(|_| Error::BadInput(format!("not an integer: {raw:?}")))
        }
        ColumnDtype::Float => raw
            .parse::<f64>()
            .map(|f| serde_json::json!(f))
            .map_err(|_| Error::BadInput(format!("not a float: {raw:?}"))),
        ColumnDtype::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(serde_json::json!(true)),
            "false" | "0" => Ok(serde_json::json!(false)),
            _ => Err(Error::BadInput(format!("not a boolean: {raw:?}"))),
        },
        ColumnDtype::Json => serde_json::from_str(raw)
            .map_err(|_| Error::BadInput(format!("not valid JSON: {raw:?}"))),
        ColumnDtype::Str
        | ColumnDtype::Image
        | ColumnDtype::Audio
        | ColumnDtype::Document
        | ColumnDtype::DateTime => Ok(serde_json::Value::String(raw.to_string())),
    }
}

/// Coerce a JSON input value (row add / update body) to the column dtype.
pub fn coerce_json_value(dtype: ColumnDtype, value: serde_json::Value) -> Result<serde_json::Value> {
    if value.is_null() {
        return Ok(value);
    }
    match (dtype, &value) {
        (ColumnDtype::Int, serde_json::Value::Number(n)) => {
            if n.is_i64() || n.is_u64() {
                Ok(value)
            } else {
                Ok(serde_json::json!(n.as_f64().unwrap_or(0.0).trunc() as i64))
            }
        }
        (ColumnDtype::Float, serde_json::Value::Number(_))
        | (ColumnDtype::Bool, serde_json::Value::Bool(_))
        | (ColumnDtype::Json, _) => Ok(value),
        (
            ColumnDtype::Str
            | ColumnDtype::Image
            | ColumnDtype::Audio
            | ColumnDtype::Document
            | ColumnDtype::DateTime,
            serde_json::Value::String(_),
        ) => Ok(value),
        // Strings coerce through the CSV rules.
        (dtype, serde_json::Value::String(s)) => coerce_value(dtype, s),
        (dtype, other) => Err(Error::BadInput(format!(
            "expected {dtype:?} value, got {other}"
        ))),
    }
}

/// Render a cell value for export.
#[must_use]
pub fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse CSV/TSV bytes into per-row cell maps keyed by column ID.
/// Unknown header names are rejected; an `ID` header carries row IDs.
pub fn import_rows(
    meta: &TableMeta,
    data: &[u8],
    delimiter: u8,
) -> Result<Vec<(Option<String>, HashMap<String, Cell>)>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(false)
        .from_reader(data);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| Error::BadInput(format!("malformed CSV header: {e}")))?
        .iter()
        .map(str::to_string)
        .collect();
    if headers.is_empty() {
        return Err(Error::BadInput("CSV has no header row".to_string()));
    }
    for header in &headers {
        if header == "ID" || header == "Updated at" {
            continue;
        }
        if meta.column(header).is_none() {
            return Err(Error::BadInput(format!("unknown column in CSV: {header}")));
        }
    }

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record
            .map_err(|e| Error::BadInput(format!("malformed CSV record {}: {e}", line + 2)))?;
        let mut cells = HashMap::new();
        let mut row_id = None;
        for (header, raw) in headers.iter().zip(record.iter()) {
            if header == "Updated at" {
                continue;
            }
            if header == "ID" {
                if !raw.is_empty() {
                    row_id = Some(raw.to_string());
                }
                continue;
            }
            let column = meta
                .column(header)
                .ok_or_else(|| Error::BadInput(format!("unknown column: {header}")))?;
            let value = coerce_value(column.dtype, raw)?;
            if !value.is_null() {
                cells.insert(header.clone(), Cell::of(value));
            }
        }
        rows.push((row_id, cells));
    }
    Ok(rows)
}

/// Render rows to CSV/TSV. The header is `ID` followed by the user
/// columns in table order.
pub fn export_rows(meta: &TableMeta, rows: &[StoredRow], delimiter: u8) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(Vec::new());

    let columns: Vec<&str> = meta.user_columns().map(|c| c.id.as_str()).collect();
    let mut header = vec!["ID"];
    header.extend(&columns);
    writer
        .write_record(&header)
        .map_err(|e| Error::Unexpected(e.to_string()))?;

    for row in rows {
        let mut record = vec![row.id.clone()];
        for column in &columns {
            record.push(render_value(&row.cell(column).value));
        }
        writer
            .write_record(&record)
            .map_err(|e| Error::Unexpected(e.to_string()))?;
    }
    writer
        .into_inner()
        .map_err(|e| Error::Unexpected(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{info_columns, ColumnSchema, TableType};
    use chrono::Utc;

    fn meta() -> TableMeta {
        let mut cols = info_columns();
        cols.push(ColumnSchema::input("name", ColumnDtype::Str));
        cols.push(ColumnSchema::input("age", ColumnDtype::Int));
        cols.push(ColumnSchema::input("active", ColumnDtype::Bool));
        cols.push(ColumnSchema::input("score", ColumnDtype::Float));
        TableMeta {
            id: "t".to_string(),
            table_type: TableType::Action,
            parent_id: None,
            title: None,
            cols,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            num_rows: None,
        }
    }

    #[test]
    fn test_coerce_value_rules() {
        assert_eq!(
            coerce_value(ColumnDtype::Bool, "True").unwrap(),
            serde_json::json!(true)
        );
        assert_eq!(
            coerce_value(ColumnDtype::Bool, "False").unwrap(),
            serde_json::json!(false)
        );
        assert_eq!(
            coerce_value(ColumnDtype::Int, "42").unwrap(),
            serde_json::json!(42)
        );
        // Float-shaped strings truncate when the dtype is int.
        assert_eq!(
            coerce_value(ColumnDtype::Int, "3.9").unwrap(),
            serde_json::json!(3)
        );
        assert_eq!(
            coerce_value(ColumnDtype::Float, "2.5").unwrap(),
            serde_json::json!(2.5)
        );
        assert_eq!(
            coerce_value(ColumnDtype::Str, "").unwrap(),
            serde_json::Value::Null
        );
        assert!(coerce_value(ColumnDtype::Int, "abc").is_err());
    }

    #[test]
    fn test_import_rejects_unknown_columns() {
        let data = b"name,bogus\nada,1\n";
        let err = import_rows(&meta(), data, b',').unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn test_import_parses_and_coerces() {
        let data = b"name,age,active,score\nada,36,True,9.5\ngrace,,False,\n";
        let rows = import_rows(&meta(), data, b',').unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1["age"].value, serde_json::json!(36));
        assert_eq!(rows[0].1["active"].value, serde_json::json!(true));
        // Empty cells import as null (absent).
        assert!(!rows[1].1.contains_key("age"));
    }

    #[test]
    fn test_roundtrip_without_file_columns() {
        let table = meta();
        let mut row = StoredRow::new();
        row.cells
            .insert("name".to_string(), Cell::of(serde_json::json!("ada")));
        row.cells
            .insert("age".to_string(), Cell::of(serde_json::json!(36)));
        row.cells
            .insert("active".to_string(), Cell::of(serde_json::json!(true)));
        row.cells
            .insert("score".to_string(), Cell::of(serde_json::json!(9.5)));

        let exported = export_rows(&table, &[row.clone()], b',').unwrap();
        let imported = import_rows(&table, &exported, b',').unwrap();
        assert_eq!(imported.len(), 1);
        let (id, cells) = &imported[0];
        assert_eq!(id.as_deref(), Some(row.id.as_str()));
        assert_eq!(cells["name"].value, row.cell("name").value);
        assert_eq!(cells["age"].value, row.cell("age").value);
        assert_eq!(cells["active"].value, row.cell("active").value);
        assert_eq!(cells["score"].value, row.cell("score").value);
    }

    #[test]
    fn test_tsv_delimiter() {
        let data = b"name\tage\nada\t36\n";
        let rows = import_rows(&meta(), data, b'\t').unwrap();
        assert_eq!(rows[0].1["name"].value, serde_json::json!("ada"));
    }

    #[test]
    fn test_bool_import_is_case_tolerant() {
        assert_eq!(
            coerce_value(ColumnDtype::Bool, "true").unwrap(),
            serde_json::json!(true)
        );
        assert_eq!(
            coerce_value(ColumnDtype::Bool, "FALSE").unwrap(),
            serde_json::json!(false)
        );
    }
}
