//! Parquet columnar codec and the `$data`-variant
//! reconstruction module.

pub mod data_variant;

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, TimestampMillisecondArray,
};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema, TimeUnit};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReaderBuilder, ProjectionMask};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use serde_json::Value;

use doxa_common::error::{Error, Result};
use doxa_common::types::{ColumnSpec, ColumnType, Schema};

/// Per-row-group statistics surfaced to the executor for pruning.
#[derive(Debug, Clone)]
pub struct ColumnStats {
    pub name: String,
    pub null_count: i64,
    pub min: Option<Value>,
    pub max: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RowGroupMeta {
    pub num_rows: i64,
    pub columns: Vec<ColumnStats>,
}

#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub schema: Schema,
    pub row_groups: Vec<RowGroupMeta>,
    pub kv_metadata: std::collections::HashMap<String, String>,
}

/// A parsed Parquet bloom filter for one column, supporting membership
/// checks only.
pub struct BloomFilter {
    sbbf: parquet::bloom_filter::Sbbf,
}

impl BloomFilter {
    pub fn might_contain_str(&self, value: &str) -> bool {
        self.sbbf.check(&value)
    }

    pub fn might_contain_i64(&self, value: i64) -> bool {
        self.sbbf.check(&value)
    }
}

fn column_type_to_arrow(t: ColumnType) -> DataType {
    match t {
        ColumnType::String => DataType::Utf8,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Bool => DataType::Boolean,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Millisecond, None),
        // Nested JSON shredded into a column is stored as its serialized
        // string form; readers re-parse on demand.
        ColumnType::Json => DataType::Utf8,
    }
}

fn schema_to_arrow(schema: &Schema) -> ArrowSchema {
    let mut names: Vec<&String> = schema.columns.keys().collect();
    names.sort();
    let fields: Vec<Field> = names
        .into_iter()
        .map(|name| {
            let spec = &schema.columns[name];
            Field::new(name, column_type_to_arrow(spec.column_type), spec.optional)
        })
        .collect();
    ArrowSchema::new(fields)
}

/// Builds a single-row-group `RecordBatch` from JSON rows according to
/// `schema`. Missing values on an optional column become null; missing
/// values on a required column are an error (`SchemaMismatch`).
pub fn rows_to_record_batch(rows: &[Value], schema: &Schema) -> Result<RecordBatch> {
    let arrow_schema = Arc::new(schema_to_arrow(schema));
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(arrow_schema.fields().len());

    for field in arrow_schema.fields() {
        let spec = schema.columns.get(field.name()).ok_or_else(|| {
            Error::SchemaMismatch(format!("no column spec for {}", field.name()))
        })?;
        columns.push(build_column(rows, field.name(), spec)?);
    }

    RecordBatch::try_new(arrow_schema, columns)
        .map_err(|e| Error::SchemaMismatch(format!("failed to build record batch: {e}")))
}

fn build_column(rows: &[Value], name: &str, spec: &ColumnSpec) -> Result<ArrayRef> {
    macro_rules! collect {
        ($builder_ty:ty, $extract:expr) => {{
            let values: Result<Vec<Option<_>>> = rows
                .iter()
                .map(|row| match row.get(name) {
                    Some(Value::Null) | None if spec.optional => Ok(None),
                    Some(Value::Null) | None => Err(Error::SchemaMismatch(format!(
                        "column {name} is required but missing"
                    ))),
                    Some(v) => $extract(v)
                        .map(Some)
                        .ok_or_else(|| Error::SchemaMismatch(format!("column {name} has wrong type"))),
                })
                .collect();
            Ok(Arc::new(<$builder_ty>::from(values?)) as ArrayRef)
        }};
    }

    match spec.column_type {
        ColumnType::String | ColumnType::Json => collect!(StringArray, |v: &Value| {
            if let ColumnType::Json = spec.column_type {
                Some(v.to_string())
            } else {
                v.as_str().map(|s| s.to_string())
            }
        }),
        ColumnType::Int64 => collect!(Int64Array, |v: &Value| v.as_i64()),
        ColumnType::Float64 => collect!(Float64Array, |v: &Value| v.as_f64()),
        ColumnType::Bool => collect!(BooleanArray, |v: &Value| v.as_bool()),
        ColumnType::Timestamp => collect!(TimestampMillisecondArray, |v: &Value| v.as_i64()),
    }
}

/// Reconstructs JSON rows from a decoded `RecordBatch`.
pub fn record_batch_to_rows(batch: &RecordBatch) -> Result<Vec<Value>> {
    let mut rows: Vec<serde_json::Map<String, Value>> =
        vec![serde_json::Map::new(); batch.num_rows()];

    for (field, column) in batch.schema().fields().iter().zip(batch.columns()) {
        for (i, row) in rows.iter_mut().enumerate() {
            let value = array_value_at(column, i)?;
            row.insert(field.name().clone(), value);
        }
    }

    Ok(rows.into_iter().map(Value::Object).collect())
}

fn array_value_at(column: &ArrayRef, i: usize) -> Result<Value> {
    if column.is_null(i) {
        return Ok(Value::Null);
    }
    let value = match column.data_type() {
        DataType::Utf8 => {
            let arr = column.as_any().downcast_ref::<StringArray>().unwrap();
            Value::String(arr.value(i).to_string())
        }
        DataType::Int64 => {
            let arr = column.as_any().downcast_ref::<Int64Array>().unwrap();
            Value::from(arr.value(i))
        }
        DataType::Float64 => {
            let arr = column.as_any().downcast_ref::<Float64Array>().unwrap();
            Value::from(arr.value(i))
        }
        DataType::Boolean => {
            let arr = column.as_any().downcast_ref::<BooleanArray>().unwrap();
            Value::Bool(arr.value(i))
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            let arr = column
                .as_any()
                .downcast_ref::<TimestampMillisecondArray>()
                .unwrap();
            Value::from(arr.value(i))
        }
        other => {
            return Err(Error::SchemaMismatch(format!(
                "unsupported arrow type in read path: {other:?}"
            )))
        }
    };
    Ok(value)
}

/// Encodes `rows` as a single-row-group Parquet file under `schema`.
/// `bloom_filter_columns` names columns to build bloom filters for —
/// ordinarily the indexed/shredded columns the executor will prune on.
pub fn encode(rows: &[Value], schema: &Schema, bloom_filter_columns: &[&str]) -> Result<Bytes> {
    let batch = rows_to_record_batch(rows, schema)?;

    let mut props_builder = WriterProperties::builder().set_compression(Compression::SNAPPY);
    for col in bloom_filter_columns {
        props_builder = props_builder.set_column_bloom_filter_enabled(
            parquet::schema::types::ColumnPath::from(col.to_string()),
            true,
        );
    }
    let props = props_builder.build();

    let mut buf = Vec::new();
    {
        let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))
            .map_err(|e| Error::Internal(format!("failed to create parquet writer: {e}")))?;
        writer
            .write(&batch)
            .map_err(|e| Error::Internal(format!("failed to write record batch: {e}")))?;
        writer
            .close()
            .map_err(|e| Error::Internal(format!("failed to close parquet writer: {e}")))?;
    }
    Ok(Bytes::from(buf))
}

/// Decodes every row in a Parquet file.
pub fn read_all(bytes: Bytes) -> Result<Vec<Value>> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .map_err(|e| Error::ReadError(format!("failed to open parquet file: {e}")))?;
    let reader = builder
        .build()
        .map_err(|e| Error::ReadError(format!("failed to build parquet reader: {e}")))?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| Error::ReadError(format!("failed to read batch: {e}")))?;
        rows.extend(record_batch_to_rows(&batch)?);
    }
    Ok(rows)
}

/// Decodes only the named row groups, projecting to `projection` if given.
/// Excluded columns are never materialized.
pub fn read_rowgroups(
    bytes: Bytes,
    row_group_ids: &[usize],
    projection: Option<&[&str]>,
) -> Result<Vec<Value>> {
    let mut builder = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .map_err(|e| Error::ReadError(format!("failed to open parquet file: {e}")))?;

    if let Some(cols) = projection {
        let parquet_schema = builder.parquet_schema();
        let mut indices = Vec::new();
        for col in cols {
            if let Some(idx) = parquet_schema
                .columns()
                .iter()
                .position(|c| c.name() == *col)
            {
                indices.push(idx);
            }
        }
        let mask = ProjectionMask::leaves(parquet_schema, indices);
        builder = builder.with_projection(mask);
    }

    builder = builder.with_row_groups(row_group_ids.to_vec());

    let reader = builder
        .build()
        .map_err(|e| Error::ReadError(format!("failed to build parquet reader: {e}")))?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| Error::ReadError(format!("failed to read batch: {e}")))?;
        rows.extend(record_batch_to_rows(&batch)?);
    }
    Ok(rows)
}

/// Decodes a Parquet statistics min/max byte slice according to the logical
/// column type it belongs to. Widths vary with the physical encoding Arrow
/// chose (e.g. `INT32` for a narrow `Int64` column), so length dispatches
/// within a type rather than assuming a fixed width.
fn decode_stat_bytes(bytes: &[u8], column_type: ColumnType) -> Option<Value> {
    match column_type {
        ColumnType::String | ColumnType::Json => {
            std::str::from_utf8(bytes).ok().map(|s| Value::String(s.to_string()))
        }
        ColumnType::Int64 | ColumnType::Timestamp => match bytes.len() {
            4 => Some(Value::from(i32::from_le_bytes(bytes.try_into().ok()?) as i64)),
            8 => Some(Value::from(i64::from_le_bytes(bytes.try_into().ok()?))),
            _ => None,
        },
        ColumnType::Float64 => match bytes.len() {
            4 => Some(Value::from(f32::from_le_bytes(bytes.try_into().ok()?) as f64)),
            8 => Some(Value::from(f64::from_le_bytes(bytes.try_into().ok()?))),
            _ => None,
        },
        ColumnType::Bool => bytes.first().map(|b| Value::Bool(*b != 0)),
    }
}

/// Reads the schema, per-row-group column stats, and key/value metadata
/// without materializing any row data.
pub fn read_metadata(bytes: Bytes) -> Result<FileMetadata> {
    let reader = SerializedFileReader::new(bytes)
        .map_err(|e| Error::ReadError(format!("failed to open parquet footer: {e}")))?;
    let metadata = reader.metadata();
    let file_meta = metadata.file_metadata();

    let mut schema = Schema::default();
    for col in file_meta.schema_descr().columns() {
        let optional = col.self_type().get_basic_info().repetition()
            != parquet::basic::Repetition::REQUIRED;
        let column_type = match col.physical_type() {
            parquet::basic::Type::BYTE_ARRAY | parquet::basic::Type::FIXED_LEN_BYTE_ARRAY => {
                ColumnType::String
            }
            parquet::basic::Type::INT64 | parquet::basic::Type::INT32 => ColumnType::Int64,
            parquet::basic::Type::DOUBLE | parquet::basic::Type::FLOAT => ColumnType::Float64,
            parquet::basic::Type::BOOLEAN => ColumnType::Bool,
            parquet::basic::Type::INT96 => ColumnType::Timestamp,
        };
        schema
            .columns
            .insert(col.name().to_string(), ColumnSpec { column_type, optional });
    }

    let mut row_groups = Vec::new();
    for rg in metadata.row_groups() {
        let mut columns = Vec::new();
        for col in rg.columns() {
            let name = col.column_path().string();
            let column_type = schema.columns.get(&name).map(|spec| spec.column_type);
            let stats = col.statistics();
            let (min, max) = match (stats, column_type) {
                (Some(stats), Some(column_type)) => (
                    stats.min_bytes_opt().and_then(|b| decode_stat_bytes(b, column_type)),
                    stats.max_bytes_opt().and_then(|b| decode_stat_bytes(b, column_type)),
                ),
                _ => (None, None),
            };
            columns.push(ColumnStats {
                name,
                null_count: stats.map(|s| s.null_count() as i64).unwrap_or(0),
                min,
                max,
            });
        }
        row_groups.push(RowGroupMeta {
            num_rows: rg.num_rows(),
            columns,
        });
    }

    let kv_metadata = file_meta
        .key_value_metadata()
        .map(|kvs| {
            kvs.iter()
                .filter_map(|kv| kv.value.clone().map(|v| (kv.key.clone(), v)))
                .collect()
        })
        .unwrap_or_default();

    Ok(FileMetadata {
        schema,
        row_groups,
        kv_metadata,
    })
}

/// Reads the bloom filter for `column` in row group `row_group_id`, if one
/// was written.
pub fn get_bloom_filter(
    bytes: Bytes,
    row_group_id: usize,
    column: &str,
) -> Result<Option<BloomFilter>> {
    let reader = SerializedFileReader::new(bytes)
        .map_err(|e| Error::ReadError(format!("failed to open parquet footer: {e}")))?;
    let row_group_reader = reader
        .get_row_group(row_group_id)
        .map_err(|e| Error::ReadError(format!("failed to open row group: {e}")))?;

    let col_idx = reader
        .metadata()
        .file_metadata()
        .schema_descr()
        .columns()
        .iter()
        .position(|c| c.name() == column);

    let Some(col_idx) = col_idx else {
        return Ok(None);
    };

    Ok(row_group_reader
        .get_column_bloom_filter(col_idx)
        .map(|sbbf| BloomFilter { sbbf: sbbf.clone() }))
}

/// The last 8 bytes of a Parquet file: the footer length (4 bytes) and the
/// `PAR1` magic (4 bytes).
pub fn footer_range(file_size: u64) -> (u64, u64) {
    (file_size.saturating_sub(8), 8)
}

/// The metadata section immediately preceding the footer, given the footer
/// length decoded from [`footer_range`]'s bytes.
pub fn metadata_range(file_size: u64, footer_len: u32) -> (u64, u64) {
    let metadata_start = file_size.saturating_sub(8 + footer_len as u64);
    (metadata_start, footer_len as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use doxa_common::types::ColumnSpec;
    use serde_json::json;

    fn sample_schema() -> Schema {
        let mut schema = Schema::default();
        schema.columns.insert(
            "$id".to_string(),
            ColumnSpec { column_type: ColumnType::String, optional: false },
        );
        schema.columns.insert(
            "name".to_string(),
            ColumnSpec { column_type: ColumnType::String, optional: true },
        );
        schema.columns.insert(
            "age".to_string(),
            ColumnSpec { column_type: ColumnType::Int64, optional: true },
        );
        schema
    }

    #[test]
    fn write_then_read_all_round_trips() {
        let schema = sample_schema();
        let rows = vec![
            json!({"$id": "users/1", "name": "Ada", "age": 30}),
            json!({"$id": "users/2", "name": "Bob", "age": null}),
        ];
        let bytes = encode(&rows, &schema, &[]).unwrap();
        let decoded = read_all(bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0]["$id"], json!("users/1"));
        assert_eq!(decoded[1]["age"], Value::Null);
    }

    #[test]
    fn read_metadata_reports_row_count() {
        let schema = sample_schema();
        let rows = vec![json!({"$id": "users/1", "name": "Ada", "age": 30})];
        let bytes = encode(&rows, &schema, &[]).unwrap();
        let meta = read_metadata(bytes).unwrap();
        assert_eq!(meta.row_groups.len(), 1);
        assert_eq!(meta.row_groups[0].num_rows, 1);
    }

    #[test]
    fn read_metadata_reports_min_max_per_column() {
        let schema = sample_schema();
        let rows = vec![
            json!({"$id": "users/1", "name": "Ada", "age": 30}),
            json!({"$id": "users/2", "name": "Zeno", "age": 12}),
        ];
        let bytes = encode(&rows, &schema, &[]).unwrap();
        let meta = read_metadata(bytes).unwrap();
        let age = meta.row_groups[0]
            .columns
            .iter()
            .find(|c| c.name == "age")
            .unwrap();
        assert_eq!(age.min, Some(json!(12)));
        assert_eq!(age.max, Some(json!(30)));

        let name = meta.row_groups[0]
            .columns
            .iter()
            .find(|c| c.name == "name")
            .unwrap();
        assert_eq!(name.min, Some(json!("Ada")));
        assert_eq!(name.max, Some(json!("Zeno")));
    }

    #[test]
    fn get_bloom_filter_reports_membership_for_indexed_column() {
        let schema = sample_schema();
        let rows = vec![json!({"$id": "users/1", "name": "Ada", "age": 30})];
        let bytes = encode(&rows, &schema, &["name"]).unwrap();
        let bloom = get_bloom_filter(bytes, 0, "name").unwrap().unwrap();
        assert!(bloom.might_contain_str("Ada"));
    }
}
