//! Table persistence on SQLite
//!
//! One metadata table holds every `TableMeta` as JSON, keyed by
//! `(project_id, table_type, id)`; each logical table owns a physical data
//! table whose columns mirror the schema. Cells are stored as JSON text so
//! the `{value, original, references}` side channels travel with the value.
//! Row writes are transactional together with the table's `updated_at`.

use crate::error::{Error, Result};
use crate::schema::{Cell, TableMeta, TableType};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row as _;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, instrument};

/// A stored row: info columns plus one cell per user column
#[derive(Debug, Clone)]
pub struct StoredRow {
    /// Row ID (UUIDv7 string; rows sort chronologically by ID)
    pub id: String,
    /// Last write time
    pub updated_at: DateTime<Utc>,
    /// Cells keyed by column ID; absent keys are null cells
    pub cells: HashMap<String, Cell>,
}

impl StoredRow {
    /// A fresh row with a generated UUIDv7 ID.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            updated_at: Utc::now(),
            cells: HashMap::new(),
        }
    }

    /// Cell for a column, or a null cell.
    #[must_use]
    pub fn cell(&self, column_id: &str) -> Cell {
        self.cells.get(column_id).cloned().unwrap_or_default()
    }
}

impl Default for StoredRow {
    fn default() -> Self {
        Self::new()
    }
}

/// SQLite-backed table store
#[derive(Clone)]
pub struct TableStore {
    pool: SqlitePool,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn data_table_name(project_id: &str, table_type: TableType, table_id: &str) -> String {
    format!("t__{project_id}__{}__{table_id}", table_type.as_str())
}

impl TableStore {
    /// Connect to a SQLite database and run the schema migration.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| Error::Database(e.to_string()))?
            .create_if_missing(true);
        // In-memory databases are per-connection; a pool of one keeps a
        // single shared database alive for the store's lifetime.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS table_metadata (
                project_id TEXT NOT NULL,
                table_type TEXT NOT NULL,
                id         TEXT NOT NULL,
                meta       TEXT NOT NULL,
                PRIMARY KEY (project_id, table_type, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Table lifecycle
    // =========================================================================

    /// Persist a new table: metadata row plus its physical data table.
    #[instrument(skip(self, meta), fields(table_id = %meta.id))]
    pub async fn create_table(&self, project_id: &str, meta: &TableMeta) -> Result<()> {
        let existing = self.try_get_meta(project_id, meta.table_type, &meta.id).await?;
        if existing.is_some() {
            return Err(Error::ResourceExists(format!("table {}", meta.id)));
        }

        let mut columns = vec![
            format!("{} TEXT PRIMARY KEY", quote_ident("ID")),
            format!("{} TEXT NOT NULL", quote_ident("Updated at")),
        ];
        for col in meta.user_columns() {
            columns.push(format!("{} TEXT", quote_ident(&col.id)));
        }
        let create = format!(
            "CREATE TABLE {} ({})",
            quote_ident(&data_table_name(project_id, meta.table_type, &meta.id)),
            columns.join(", ")
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO table_metadata (project_id, table_type, id, meta) VALUES (?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(meta.table_type.as_str())
        .bind(&meta.id)
        .bind(serde_json::to_string(meta).map_err(|e| Error::Unexpected(e.to_string()))?)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&create).execute(&mut *tx).await?;
        tx.commit().await?;
        debug!("created table");
        Ok(())
    }

    /// Fetch a table's metadata, or `None`.
    pub async fn try_get_meta(
        &self,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
    ) -> Result<Option<TableMeta>> {
        let row = sqlx::query(
            "SELECT meta FROM table_metadata WHERE project_id = ? AND table_type = ? AND id = ?",
        )
        .bind(project_id)
        .bind(table_type.as_str())
        .bind(table_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            let meta: String = r.get("meta");
            serde_json::from_str(&meta).map_err(|e| Error::Unexpected(e.to_string()))
        })
        .transpose()
    }

    /// Fetch a table's metadata.
    pub async fn get_meta(
        &self,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
    ) -> Result<TableMeta> {
        self.try_get_meta(project_id, table_type, table_id)
            .await?
            .ok_or_else(|| Error::ResourceNotFound(format!("table {table_id}")))
    }

    /// Replace a table's metadata (schema mutations).
    pub async fn put_meta(&self, project_id: &str, meta: &TableMeta) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE table_metadata SET meta = ? WHERE project_id = ? AND table_type = ? AND id = ?",
        )
        .bind(serde_json::to_string(meta).map_err(|e| Error::Unexpected(e.to_string()))?)
        .bind(project_id)
        .bind(meta.table_type.as_str())
        .bind(&meta.id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::ResourceNotFound(format!("table {}", meta.id)));
        }
        Ok(())
    }

    /// List a project's tables of one type, ordered by ID.
    pub async fn list_metas(
        &self,
        project_id: &str,
        table_type: TableType,
    ) -> Result<Vec<TableMeta>> {
        let rows = sqlx::query(
            "SELECT meta FROM table_metadata WHERE project_id = ? AND table_type = ? ORDER BY id",
        )
        .bind(project_id)
        .bind(table_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                let meta: String = r.get("meta");
                serde_json::from_str(&meta).map_err(|e| Error::Unexpected(e.to_string()))
            })
            .collect()
    }

    /// Drop a table and its data.
    #[instrument(skip(self))]
    pub async fn drop_table(
        &self,
        project_id: &str,
        table_type: TableType,
        table_id: &str,
    ) -> Result<()> {
        let meta = self.get_meta(project_id, table_type, table_id).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM table_metadata WHERE project_id = ? AND table_type = ? AND id = ?")
            .bind(project_id)
            .bind(table_type.as_str())
            .bind(table_id)
            .execute(&mut *tx)
            .await?;
        let drop = format!(
            "DROP TABLE IF EXISTS {}",
            quote_ident(&data_table_name(project_id, meta.table_type, table_id))
        );
        sqlx::query(&drop).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Physical column mutations
    // =========================================================================

    /// Add physical columns; the caller persists the updated metadata.
    pub async fn add_physical_columns(
        &self,
        project_id: &str,
        meta: &TableMeta,
        column_ids: &[String],
    ) -> Result<()> {
        let table = quote_ident(&data_table_name(project_id, meta.table_type, &meta.id));
        for id in column_ids {
            let alter = format!("ALTER TABLE {table} ADD COLUMN {} TEXT", quote_ident(id));
            sqlx::query(&alter).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Drop physical columns.
    pub async fn drop_physical_columns(
        &self,
        project_id: &str,
        meta: &TableMeta,
        column_ids: &[String],
    ) -> Result<()> {
        let table = quote_ident(&data_table_name(project_id, meta.table_type, &meta.id));
        for id in column_ids {
            let alter = format!("ALTER TABLE {table} DROP COLUMN {}", quote_ident(id));
            sqlx::query(&alter).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Rename a physical column.
    pub async fn rename_physical_column(
        &self,
        project_id: &str,
        meta: &TableMeta,
        old_id: &str,
        new_id: &str,
    ) -> Result<()> {
        let table = quote_ident(&data_table_name(project_id, meta.table_type, &meta.id));
        let alter = format!(
            "ALTER TABLE {table} RENAME COLUMN {} TO {}",
            quote_ident(old_id),
            quote_ident(new_id)
        );
        sqlx::query(&alter).execute(&self.pool).await?;
        Ok(())
    }

    // =========================================================================
    // Rows
    // =========================================================================

    /// Insert a row and advance the table's `updated_at`, transactionally.
    #[instrument(skip(self, meta, row), fields(table_id = %meta.id, row_id = %row.id))]
    pub async fn insert_row(
        &self,
        project_id: &str,
        meta: &TableMeta,
        row: &StoredRow,
    ) -> Result<()> {
        let table = quote_ident(&data_table_name(project_id, meta.table_type, &meta.id));
        let user_cols: Vec<&str> = meta.user_columns().map(|c| c.id.as_str()).collect();

        let mut names = vec![quote_ident("ID"), quote_ident("Updated at")];
        names.extend(user_cols.iter().map(|c| quote_ident(c)));
        let placeholders = vec!["?"; names.len()].join(", ");
        let insert = format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            names.join(", ")
        );

        let mut tx = self.pool.begin().await?;
        let mut query = sqlx::query(&insert)
            .bind(&row.id)
            .bind(row.updated_at.to_rfc3339());
        for col in &user_cols {
            query = query.bind(encode_cell(row.cells.get(*col))?);
        }
        query.execute(&mut *tx).await?;
        self.touch_meta(&mut tx, project_id, meta).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Update a row's cells and advance the table's `updated_at`,
    /// transactionally.
    #[instrument(skip(self, meta, cells), fields(table_id = %meta.id, row_id))]
    pub async fn update_row(
        &self,
        project_id: &str,
        meta: &TableMeta,
        row_id: &str,
        cells: &HashMap<String, Cell>,
    ) -> Result<()> {
        if cells.is_empty() {
            return Ok(());
        }
        let table = quote_ident(&data_table_name(project_id, meta.table_type, &meta.id));
        let columns: Vec<&String> = cells.keys().collect();
        let assignments: Vec<String> = columns
            .iter()
            .map(|c| format!("{} = ?", quote_ident(c)))
            .chain([format!("{} = ?", quote_ident("Updated at"))])
            .collect();
        let update = format!(
            "UPDATE {table} SET {} WHERE {} = ?",
            assignments.join(", "),
            quote_ident("ID")
        );

        let mut tx = self.pool.begin().await?;
        let mut query = sqlx::query(&update);
        for col in &columns {
            query = query.bind(encode_cell(cells.get(col.as_str()))?);
        }
        query = query.bind(Utc::now().to_rfc3339()).bind(row_id);
        let updated = query.execute(&mut *tx).await?;
        if updated.rows_affected() == 0 {
            return Err(Error::ResourceNotFound(format!("row {row_id}")));
        }
        self.touch_meta(&mut tx, project_id, meta).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Fetch one row.
    pub async fn get_row(
        &self,
        project_id: &str,
        meta: &TableMeta,
        row_id: &str,
    ) -> Result<StoredRow> {
        let table = quote_ident(&data_table_name(project_id, meta.table_type, &meta.id));
        let select = format!("SELECT * FROM {table} WHERE {} = ?", quote_ident("ID"));
        let row = sqlx::query(&select)
            .bind(row_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::ResourceNotFound(format!("row {row_id}")))?;
        decode_row(&row, meta)
    }

    /// Fetch every row, ordered by ID (UUIDv7 makes that chronological).
    pub async fn fetch_all_rows(
        &self,
        project_id: &str,
        meta: &TableMeta,
    ) -> Result<Vec<StoredRow>> {
        let table = quote_ident(&data_table_name(project_id, meta.table_type, &meta.id));
        let select = format!("SELECT * FROM {table} ORDER BY {}", quote_ident("ID"));
        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;
        rows.iter().map(|r| decode_row(r, meta)).collect()
    }

    /// Delete rows by ID; returns how many went away.
    pub async fn delete_rows(
        &self,
        project_id: &str,
        meta: &TableMeta,
        row_ids: &[String],
    ) -> Result<u64> {
        if row_ids.is_empty() {
            return Ok(0);
        }
        let table = quote_ident(&data_table_name(project_id, meta.table_type, &meta.id));
        let placeholders = vec!["?"; row_ids.len()].join(", ");
        let delete = format!(
            "DELETE FROM {table} WHERE {} IN ({placeholders})",
            quote_ident("ID")
        );
        let mut tx = self.pool.begin().await?;
        let mut query = sqlx::query(&delete);
        for id in row_ids {
            query = query.bind(id);
        }
        let deleted = query.execute(&mut *tx).await?.rows_affected();
        self.touch_meta(&mut tx, project_id, meta).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    /// Row count of a table.
    pub async fn count_rows(&self, project_id: &str, meta: &TableMeta) -> Result<i64> {
        let table = quote_ident(&data_table_name(project_id, meta.table_type, &meta.id));
        let select = format!("SELECT COUNT(*) AS n FROM {table}");
        let row = sqlx::query(&select).fetch_one(&self.pool).await?;
        Ok(row.get("n"))
    }

    async fn touch_meta(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        project_id: &str,
        meta: &TableMeta,
    ) -> Result<()> {
        let mut touched = meta.clone();
        touched.updated_at = Utc::now();
        sqlx::query(
            "UPDATE table_metadata SET meta = ? WHERE project_id = ? AND table_type = ? AND id = ?",
        )
        .bind(serde_json::to_string(&touched).map_err(|e| Error::Unexpected(e.to_string()))?)
        .bind(project_id)
        .bind(meta.table_type.as_str())
        .bind(&meta.id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn encode_cell(cell: Option<&Cell>) -> Result<Option<String>> {
    match cell {
        None => Ok(None),
        Some(cell) if cell.value.is_null() && cell.original.is_none() && cell.references.is_none() => {
            Ok(None)
        }
        Some(cell) => serde_json::to_string(cell)
            .map(Some)
            .map_err(|e| Error::Unexpected(e.to_string())),
    }
}

fn decode_row(row: &sqlx::sqlite::SqliteRow, meta: &TableMeta) -> Result<StoredRow> {
    let id: String = row.try_get("ID")?;
    let updated_at: String = row.try_get("Updated at")?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map_err(|e| Error::Unexpected(e.to_string()))?
        .with_timezone(&Utc);

    let mut cells = HashMap::new();
    for col in meta.user_columns() {
        let raw: Option<String> = row.try_get(col.id.as_str()).unwrap_or(None);
        if let Some(raw) = raw {
            let cell: Cell =
                serde_json::from_str(&raw).map_err(|e| Error::Unexpected(e.to_string()))?;
            cells.insert(col.id.clone(), cell);
        }
    }
    Ok(StoredRow {
        id,
        updated_at,
        cells,
    })
}
