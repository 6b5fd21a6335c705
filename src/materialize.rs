//! Result materialization: Postgres row stream -> columnar [`QueryResult`]

use std::time::Instant;

use futures::TryStreamExt;
use log::debug;
use sqlx::postgres::{PgConnection, PgRow, PgValueFormat, PgValueRef};
use sqlx::{Column, Connection, Executor, Postgres, Row, Statement, TypeInfo, ValueRef};

use crate::errors::QueryError;
use crate::models::{CellValue, QueryResult};

/// Describe `sql`, then run it and collect every row.
///
/// Column names and types come from a prepare step, so they are known even
/// when the statement returns no rows. The rows themselves come over the
/// simple query protocol, where every value arrives as the server's own text.
/// `submitted` is when the caller handed the statement over; the elapsed time
/// runs until the last row is consumed.
pub(crate) async fn materialize(
    conn: &mut PgConnection,
    sql: &str,
    submitted: Instant,
) -> Result<QueryResult, QueryError> {
    let (columns, column_types) = describe(conn, sql).await?;

    let mut rows = Vec::new();
    {
        let mut stream = (&mut *conn).fetch(sql);
        while let Some(row) = stream.try_next().await? {
            rows.push(render_row(&row, &column_types)?);
        }
    }

    debug!(
        "materialized {} rows x {} columns",
        rows.len(),
        columns.len()
    );
    Ok(QueryResult::new(columns, column_types, rows, submitted.elapsed()))
}

/// Column names and type names of `sql` without executing it.
async fn describe(
    conn: &mut PgConnection,
    sql: &str,
) -> Result<(Vec<String>, Vec<String>), QueryError> {
    let statement = (&mut *conn).prepare(sql).await?;
    let columns = statement
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let column_types = statement
        .columns()
        .iter()
        .map(|c| c.type_info().name().to_string())
        .collect();
    drop(statement);

    // a named statement kept on the connection goes stale after DDL
    conn.clear_cached_statements().await?;
    Ok((columns, column_types))
}

fn render_row(row: &PgRow, column_types: &[String]) -> Result<Vec<CellValue>, QueryError> {
    column_types
        .iter()
        .enumerate()
        .map(|(index, type_name)| render_cell(row, index, type_name))
        .collect()
}

fn render_cell(row: &PgRow, index: usize, type_name: &str) -> Result<CellValue, QueryError> {
    let raw = row.try_get_raw(index).map_err(|e| decode_error(index, e))?;
    if raw.is_null() {
        return Ok(CellValue::Null);
    }

    let text = match type_name {
        "BOOL" => decode::<bool>(row, index)?.to_string(),
        // `infinity` and friends have no chrono form
        "TIMESTAMPTZ" => match row.try_get::<chrono::DateTime<chrono::Utc>, _>(index) {
            Ok(at) => at.to_rfc3339(),
            Err(_) => server_text(raw).map_err(|reason| QueryError::Decode { column: index, reason })?,
        },
        "JSON" | "JSONB" => decode::<serde_json::Value>(row, index)?.to_string(),
        // normalized so `bytea_output = escape` sessions render the same
        "BYTEA" => hex_literal(&decode::<Vec<u8>>(row, index)?),
        _ => server_text(raw).map_err(|reason| QueryError::Decode { column: index, reason })?,
    };
    Ok(CellValue::Text(text))
}

fn decode<'r, T>(row: &'r PgRow, index: usize) -> Result<T, QueryError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get::<T, _>(index).map_err(|e| decode_error(index, e))
}

fn decode_error(column: usize, e: sqlx::Error) -> QueryError {
    QueryError::Decode { column, reason: e.to_string() }
}

fn server_text(raw: PgValueRef<'_>) -> Result<String, String> {
    let format = raw.format();
    let bytes = raw.as_bytes().map_err(|e| e.to_string())?;
    Ok(wire_text(format, bytes))
}

/// Text-format values are already canonical. Binary values only show up if a
/// caller bypasses the simple protocol; they render as `\x` hex.
pub(crate) fn wire_text(format: PgValueFormat, bytes: &[u8]) -> String {
    match format {
        PgValueFormat::Text => String::from_utf8_lossy(bytes).into_owned(),
        PgValueFormat::Binary => hex_literal(bytes),
    }
}

pub(crate) fn hex_literal(bytes: &[u8]) -> String {
    format!("\\x{}", hex::encode(bytes))
}
