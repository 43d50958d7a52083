//! Storage layer: YAML documents, Parquet tables, file system management.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use arrow::array::{
    Array, BooleanArray, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray,
    UInt64Array,
};
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::error::CoreError;

type Result<T> = std::result::Result<T, CoreError>;

// ─── Directory helpers ────────────────────────────────────────────────────────

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(CoreError::persistence)
}

/// List every file below `dir`, as `/`-separated paths relative to `root`.
pub fn list_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir).map_err(CoreError::persistence)? {
        let path = entry.map_err(CoreError::persistence)?.path();
        if path.is_dir() {
            list_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let key: Vec<_> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(key.join("/"));
        }
    }
    Ok(())
}

// ─── YAML I/O ─────────────────────────────────────────────────────────────────

pub fn save_yaml<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let content = serde_yaml::to_string(data).map_err(CoreError::persistence)?;
    fs::write(path, content).map_err(CoreError::persistence)
}

pub fn load_yaml_value(path: &Path) -> Result<serde_yaml::Value> {
    let content = fs::read_to_string(path).map_err(CoreError::persistence)?;
    serde_yaml::from_str(&content).map_err(CoreError::persistence)
}

// ─── Parquet I/O ──────────────────────────────────────────────────────────────

pub fn read_parquet(path: &Path) -> Result<RecordBatch> {
    let file = fs::File::open(path).map_err(CoreError::persistence)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(CoreError::persistence)?;
    let schema = builder.schema().clone();
    let reader = builder.build().map_err(CoreError::persistence)?;
    let mut batches = vec![];
    for batch in reader {
        batches.push(batch.map_err(CoreError::persistence)?);
    }
    if batches.len() == 1 {
        return Ok(batches.remove(0));
    }
    arrow::compute::concat_batches(&schema, &batches).map_err(CoreError::persistence)
}

pub fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = fs::File::create(path).map_err(CoreError::persistence)?;
    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .build();
    let mut writer =
        ArrowWriter::try_new(file, batch.schema(), Some(props)).map_err(CoreError::persistence)?;
    writer.write(batch).map_err(CoreError::persistence)?;
    writer.close().map_err(CoreError::persistence)?;
    Ok(())
}

/// Convert a record batch into JSON rows keyed by column name.
pub fn record_batch_to_rows(batch: &RecordBatch) -> Vec<HashMap<String, serde_json::Value>> {
    let schema = batch.schema();
    let n = batch.num_rows();
    let mut rows = vec![HashMap::new(); n];

    for (col_idx, field) in schema.fields().iter().enumerate() {
        let col = batch.column(col_idx);
        let name = field.name().clone();

        for (row_idx, row) in rows.iter_mut().enumerate() {
            let val = if col.is_null(row_idx) {
                serde_json::Value::Null
            } else {
                cell_to_json(col.as_ref(), field.data_type(), row_idx)
            };
            row.insert(name.clone(), val);
        }
    }

    rows
}

fn cell_to_json(col: &dyn Array, data_type: &DataType, idx: usize) -> serde_json::Value {
    let any = col.as_any();
    match data_type {
        DataType::Float64 => any
            .downcast_ref::<Float64Array>()
            .map(|arr| arr.value(idx))
            .filter(|f| f.is_finite())
            .map_or(serde_json::Value::Null, |f| serde_json::json!(f)),
        DataType::Int64 => any
            .downcast_ref::<Int64Array>()
            .map_or(serde_json::Value::Null, |arr| serde_json::json!(arr.value(idx))),
        DataType::UInt64 => any
            .downcast_ref::<UInt64Array>()
            .map_or(serde_json::Value::Null, |arr| serde_json::json!(arr.value(idx))),
        DataType::Boolean => any
            .downcast_ref::<BooleanArray>()
            .map_or(serde_json::Value::Null, |arr| serde_json::json!(arr.value(idx))),
        DataType::Timestamp(TimeUnit::Microsecond, _) => any
            .downcast_ref::<TimestampMicrosecondArray>()
            .and_then(|arr| DateTime::<Utc>::from_timestamp_micros(arr.value(idx)))
            .map_or(serde_json::Value::Null, |dt| serde_json::json!(dt.to_rfc3339())),
        DataType::Utf8 => any
            .downcast_ref::<StringArray>()
            .map_or(serde_json::Value::Null, |arr| serde_json::json!(arr.value(idx))),
        _ => serde_json::Value::Null,
    }
}
