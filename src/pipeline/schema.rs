//! The on-disk columnar schema and partition layout.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use time::macros::format_description;
use time::Date;

/// Ingest line fields, in wire order. The first seven are stored as
/// strings, the last four as UTC microsecond timestamps.
pub const INGEST_FIELDS: [&str; 11] = [
    "topic",
    "band",
    "coverage",
    "ingest_source",
    "instrument",
    "satellite_id",
    "section",
    "reception_time",
    "start_time",
    "end_time",
    "create_time",
];

pub const META_FIELD_COUNT: usize = 7;

/// Field separator in the ingest line format.
pub const INGEST_DELIMITER: u8 = b'!';

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

/// Schema every stored record batch conforms to. `start_time` is the
/// only non-nullable column; records without one are rejected at ingest.
pub fn storage_schema() -> SchemaRef {
    static SCHEMA: OnceLock<SchemaRef> = OnceLock::new();
    Arc::clone(SCHEMA.get_or_init(|| {
        let mut fields: Vec<Field> = INGEST_FIELDS[..META_FIELD_COUNT]
            .iter()
            .map(|name| Field::new(*name, DataType::Utf8, true))
            .collect();
        fields.push(Field::new("reception_time", timestamp_type(), true));
        fields.push(Field::new("start_time", timestamp_type(), false));
        fields.push(Field::new("end_time", timestamp_type(), true));
        fields.push(Field::new("create_time", timestamp_type(), true));
        Arc::new(Schema::new(fields))
    }))
}

/// Partition file for a UTC date: `YYYY/YYYY_MM/YYYY_MM_DD_latencies.arrows`.
pub fn partition_path(base_dir: &Path, date: Date) -> PathBuf {
    const STUB: &[time::format_description::BorrowedFormatItem<'static>] = format_description!(
        "[year]/[year]_[month]/[year]_[month]_[day]_latencies.arrows"
    );
    match date.format(&STUB) {
        Ok(stub) => base_dir.join(stub),
        Err(_) => base_dir.join("invalid_date.arrows"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_partition_path_layout() {
        let path = partition_path(Path::new("/data"), date!(2025 - 01 - 02));
        assert_eq!(
            path,
            Path::new("/data/2025/2025_01/2025_01_02_latencies.arrows")
        );
    }

    #[test]
    fn test_schema_shape() {
        let schema = storage_schema();
        assert_eq!(schema.fields().len(), 11);
        assert!(!schema.field_with_name("start_time").unwrap().is_nullable());
        assert!(schema.field_with_name("end_time").unwrap().is_nullable());
    }
}
