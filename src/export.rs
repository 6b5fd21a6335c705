use std::io::Write;

use log::debug;
use serde_json::{Map, Value};

use crate::errors::ExportError;
use crate::models::{CellValue, ExportFormat, QueryResult};

/// Render `result` in `format` to `out`.
pub fn write_result<W: Write>(
    result: &QueryResult,
    format: ExportFormat,
    out: W,
) -> Result<(), ExportError> {
    debug!(
        "exporting {} rows x {} columns as {}",
        result.row_count,
        result.columns.len(),
        format
    );
    match format {
        ExportFormat::Csv => write_csv(result, out),
        ExportFormat::Json => write_json(result, out),
    }
}

/// Header row followed by one record per row. NULL becomes an empty field.
pub fn write_csv<W: Write>(result: &QueryResult, out: W) -> Result<(), ExportError> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(&result.columns)?;
    for row in &result.rows {
        writer.write_record(row.iter().map(|cell| cell.as_str().unwrap_or("")))?;
    }
    writer.flush()?;
    Ok(())
}

/// Array of objects keyed by column name. NULL stays `null`; when a column
/// name repeats, the rightmost value wins.
pub fn write_json<W: Write>(result: &QueryResult, mut out: W) -> Result<(), ExportError> {
    let objects: Vec<Value> = result
        .rows
        .iter()
        .map(|row| {
            let mut object = Map::with_capacity(result.columns.len());
            for (column, cell) in result.columns.iter().zip(row) {
                let value = match cell {
                    CellValue::Null => Value::Null,
                    CellValue::Text(text) => Value::String(text.clone()),
                };
                object.insert(column.clone(), value);
            }
            Value::Object(object)
        })
        .collect();

    serde_json::to_writer(&mut out, &objects)?;
    out.write_all(b"\n")?;
    Ok(())
}
