//! Read filtered time-range slices of the partition store.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, StringArray, TimestampMicrosecondArray};
use arrow::compute::{concat_batches, filter_record_batch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::ipc::reader::StreamReader;
use arrow::record_batch::RecordBatch;
use log::debug;
use regex::Regex;
use time::{Date, OffsetDateTime};

use super::schema::{partition_path, storage_schema};
use crate::error::{Error, Result};
use crate::timeutil;

/// Row predicate pushed down into a read.
///
/// All configured clauses must hold; a null column value fails its
/// clause. `date_like` is a SQL-LIKE pattern (`_` one character, `%`
/// any run) matched against `start_time` rendered as
/// `YYYY-MM-DDTHH:MM:SS`.
#[derive(Debug, Default)]
pub struct LatencyFilter {
    pub start: Option<OffsetDateTime>,
    pub until: Option<OffsetDateTime>,
    pub satellite_ids: Option<Vec<String>>,
    pub bands: Option<Vec<String>>,
    pub coverages: Option<Vec<String>>,
    pub sections: Option<Vec<String>>,
    pub sources: Option<Vec<String>>,
    pub instruments: Option<Vec<String>>,
    pub topic_regex: Option<Regex>,
    pub date_like: Option<String>,
}

impl LatencyFilter {
    fn mask(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let mut keep = vec![true; batch.num_rows()];

        let set_clauses: [(&str, &Option<Vec<String>>); 6] = [
            ("satellite_id", &self.satellite_ids),
            ("band", &self.bands),
            ("coverage", &self.coverages),
            ("section", &self.sections),
            ("ingest_source", &self.sources),
            ("instrument", &self.instruments),
        ];
        for (column, values) in set_clauses {
            let Some(values) = values else { continue };
            let array = string_column(batch, column)?;
            for (row, keep_row) in keep.iter_mut().enumerate() {
                if !*keep_row {
                    continue;
                }
                *keep_row = !array.is_null(row)
                    && values.iter().any(|value| value == array.value(row));
            }
        }

        if let Some(regex) = &self.topic_regex {
            let array = string_column(batch, "topic")?;
            for (row, keep_row) in keep.iter_mut().enumerate() {
                if *keep_row {
                    *keep_row = !array.is_null(row) && regex.is_match(array.value(row));
                }
            }
        }

        if self.start.is_some() || self.until.is_some() {
            let array = timestamp_column(batch, "start_time")?;
            let start = self.start.map(timeutil::to_micros);
            let until = self.until.map(timeutil::to_micros);
            for (row, keep_row) in keep.iter_mut().enumerate() {
                if !*keep_row {
                    continue;
                }
                let value = array.value(row);
                *keep_row = start.map_or(true, |bound| value >= bound)
                    && until.map_or(true, |bound| value <= bound);
            }
        }

        if let Some(pattern) = &self.date_like {
            let regex = like_to_regex(pattern)?;
            let array = timestamp_column(batch, "start_time")?;
            for (row, keep_row) in keep.iter_mut().enumerate() {
                if *keep_row {
                    let rendered =
                        timeutil::format_compact(timeutil::from_micros(array.value(row)));
                    *keep_row = regex.is_match(&rendered);
                }
            }
        }

        Ok(BooleanArray::from(keep))
    }
}

/// Storage schema plus the derived `latency` column.
pub fn latency_schema() -> SchemaRef {
    static SCHEMA: OnceLock<SchemaRef> = OnceLock::new();
    Arc::clone(SCHEMA.get_or_init(|| {
        let mut fields: Vec<Field> = storage_schema()
            .fields()
            .iter()
            .map(|field| field.as_ref().clone())
            .collect();
        fields.push(Field::new("latency", DataType::Float64, true));
        Arc::new(Schema::new(fields))
    }))
}

/// Load every stored record whose partition date falls in
/// `[from.date(), until.date()]`, filter, and append the `latency`
/// column (seconds, millisecond precision).
pub fn read_latency_data(
    base_dir: &Path,
    from: OffsetDateTime,
    until: OffsetDateTime,
    filter: Option<&LatencyFilter>,
) -> Result<RecordBatch> {
    let mut batches = Vec::new();
    for path in partition_files(base_dir, from.date(), until.date()) {
        batches.extend(file_batches(&path));
    }
    let table = concat_batches(&storage_schema(), &batches)?;
    let table = match filter {
        Some(filter) => filter_record_batch(&table, &filter.mask(&table)?)?,
        None => table,
    };
    append_latency(table)
}

/// Existing partition files for the date range, ascending.
fn partition_files(base_dir: &Path, from: Date, until: Date) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut date = from;
    while date <= until {
        let path = partition_path(base_dir, date);
        if path.is_file() {
            files.push(path);
        }
        let Some(next) = date.next_day() else { break };
        date = next;
    }
    files
}

/// Stream all record batches out of one partition file.
///
/// A file is a concatenation of IPC stream segments (one per writer
/// session). A batch that fails to decode ends the file: everything up
/// to the corruption is returned, the tail is silently dropped.
fn file_batches(path: &Path) -> Vec<RecordBatch> {
    let Ok(file) = File::open(path) else {
        return Vec::new();
    };
    let mut source = BufReader::new(file);
    let mut batches = Vec::new();
    loop {
        let segment = match StreamReader::try_new(&mut source, None) {
            Ok(segment) => segment,
            // No further segment header: end of file (or stray bytes
            // from a truncated header, which read the same way).
            Err(_) => return batches,
        };
        for next in segment {
            match next {
                Ok(batch) => batches.push(batch),
                Err(err) => {
                    debug!("corrupt batch in {}: {err}", path.display());
                    return batches;
                }
            }
        }
    }
}

/// Append `latency = (reception_time - start_time)` in float seconds at
/// millisecond precision.
fn append_latency(batch: RecordBatch) -> Result<RecordBatch> {
    let reception = timestamp_column(&batch, "reception_time")?;
    let start = timestamp_column(&batch, "start_time")?;
    let latency: Float64Array = (0..batch.num_rows())
        .map(|row| {
            if reception.is_null(row) || start.is_null(row) {
                None
            } else {
                let delta_ms = (reception.value(row) - start.value(row)) / 1_000;
                Some(delta_ms as f64 / 1_000.0)
            }
        })
        .collect();

    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
    columns.push(Arc::new(latency));
    Ok(RecordBatch::try_new(latency_schema(), columns)?)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    column(batch, name)?
        .as_any()
        .downcast_ref()
        .ok_or_else(|| Error::Config(format!("column {name} is not a string column")))
}

fn timestamp_column<'a>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<&'a TimestampMicrosecondArray> {
    column(batch, name)?
        .as_any()
        .downcast_ref()
        .ok_or_else(|| Error::Config(format!("column {name} is not a timestamp column")))
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::Config(format!("no column named {name}")))
}

/// Translate a SQL-LIKE pattern into an anchored regex.
fn like_to_regex(pattern: &str) -> Result<Regex> {
    let mut translated = String::with_capacity(pattern.len() + 2);
    translated.push('^');
    for ch in pattern.chars() {
        match ch {
            '_' => translated.push('.'),
            '%' => translated.push_str(".*"),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');
    Regex::new(&translated).map_err(|err| Error::Config(format!("bad datematch pattern: {err}")))
}

/// Render rows as JSON objects, optionally projecting and reordering
/// columns. Timestamps render as ISO-8601 strings.
pub fn rows_as_json(
    batch: &RecordBatch,
    columns: Option<&[String]>,
) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
    let names: Vec<String> = match columns {
        Some(names) => names.to_vec(),
        None => batch
            .schema()
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect(),
    };

    let mut rows = vec![serde_json::Map::new(); batch.num_rows()];
    for name in &names {
        let array = column(batch, name)?;
        match array.data_type() {
            DataType::Utf8 => {
                let array = string_column(batch, name)?;
                for (row, object) in rows.iter_mut().enumerate() {
                    let value = if array.is_null(row) {
                        serde_json::Value::Null
                    } else {
                        array.value(row).into()
                    };
                    object.insert(name.clone(), value);
                }
            }
            DataType::Timestamp(_, _) => {
                let array = timestamp_column(batch, name)?;
                for (row, object) in rows.iter_mut().enumerate() {
                    let value = if array.is_null(row) {
                        serde_json::Value::Null
                    } else {
                        timeutil::format_iso(timeutil::from_micros(array.value(row))).into()
                    };
                    object.insert(name.clone(), value);
                }
            }
            DataType::Float64 => {
                let array: &Float64Array = array
                    .as_any()
                    .downcast_ref()
                    .ok_or_else(|| Error::Config(format!("column {name} type mismatch")))?;
                for (row, object) in rows.iter_mut().enumerate() {
                    let value = if array.is_null(row) {
                        serde_json::Value::Null
                    } else {
                        array.value(row).into()
                    };
                    object.insert(name.clone(), value);
                }
            }
            other => {
                return Err(Error::Config(format!(
                    "cannot render column {name} of type {other}"
                )))
            }
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_translation() {
        let regex = like_to_regex("2024-08-31T__:15:%").unwrap();
        assert!(regex.is_match("2024-08-31T00:15:00"));
        assert!(regex.is_match("2024-08-31T07:15:59"));
        assert!(!regex.is_match("2024-08-31T00:16:00"));
        assert!(!regex.is_match("2024-09-01T00:15:00"));
    }

    #[test]
    fn test_like_escapes_regex_chars() {
        let regex = like_to_regex("a.b").unwrap();
        assert!(regex.is_match("a.b"));
        assert!(!regex.is_match("axb"));
    }

    #[test]
    fn test_missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let from = timeutil::parse_utc("2025-01-01").unwrap();
        let until = timeutil::parse_utc("2025-01-07").unwrap();
        let batch = read_latency_data(dir.path(), from, until, None).unwrap();
        assert_eq!(batch.num_rows(), 0);
    }
}
