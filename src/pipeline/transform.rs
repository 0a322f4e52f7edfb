//! Turn parsed ingest records into typed storage batches.

use std::sync::Arc;

use arrow::array::{ArrayRef, StringArray, TimestampMicrosecondArray};
use arrow::record_batch::RecordBatch;
use log::warn;
use time::Date;

use super::extract::IngestRecord;
use super::schema::{storage_schema, INGEST_FIELDS, META_FIELD_COUNT};
use crate::error::Result;
use crate::timeutil;

/// The UTC date a record partitions into, from the date part of its
/// `start_time`. `None` (missing or unparseable) means the record is
/// rejected at ingest.
pub fn partition_date(record: &IngestRecord) -> Option<Date> {
    let start = record.start_time()?;
    timeutil::parse_utc(start.get(..10)?).map(|instant| instant.date())
}

/// Build one storage batch from parsed records.
///
/// Time fields are parsed as ISO-8601 (naive values are reinterpreted as
/// UTC). Records whose `start_time` does not parse are logged and
/// dropped; other unparseable time fields become nulls.
pub fn storage_batch(records: &[IngestRecord]) -> Result<RecordBatch> {
    let kept: Vec<&IngestRecord> = records
        .iter()
        .filter(|record| {
            let ok = record
                .start_time()
                .and_then(timeutil::parse_utc)
                .is_some();
            if !ok {
                warn!(
                    "dropping record with unusable start_time for topic {:?}",
                    record.topic().unwrap_or("<none>")
                );
            }
            ok
        })
        .collect();

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(INGEST_FIELDS.len());
    for index in 0..META_FIELD_COUNT {
        let array: StringArray = kept.iter().map(|record| record.by_index(index)).collect();
        columns.push(Arc::new(array));
    }
    for index in META_FIELD_COUNT..INGEST_FIELDS.len() {
        let array: TimestampMicrosecondArray = kept
            .iter()
            .map(|record| {
                record
                    .by_index(index)
                    .and_then(timeutil::parse_utc)
                    .map(timeutil::to_micros)
            })
            .collect();
        columns.push(Arc::new(array.with_timezone("UTC")));
    }

    Ok(RecordBatch::try_new(storage_schema(), columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::schema::INGEST_DELIMITER;
    use arrow::array::Array;
    use time::macros::date;

    fn record(line: &str) -> IngestRecord {
        IngestRecord::from_line(line.as_bytes(), INGEST_DELIMITER).unwrap()
    }

    #[test]
    fn test_partition_date_from_start_time() {
        let parsed = record(
            "t!b!c!s!i!G16!sec!2025-01-02T03:04:05!2025-01-03T00:00:00!?UNKNOWN?!?UNKNOWN?",
        );
        assert_eq!(partition_date(&parsed), Some(date!(2025 - 01 - 03)));
    }

    #[test]
    fn test_batch_types_and_nulls() {
        let parsed = record(
            "t!b!c!s!i!G16!sec!2025-01-02T03:04:05!2025-01-02T03:04:00!?UNKNOWN?!?UNKNOWN?",
        );
        let batch = storage_batch(&[parsed]).unwrap();
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.schema(), storage_schema());
        assert!(batch.column_by_name("end_time").unwrap().is_null(0));

        let start = batch
            .column_by_name("start_time")
            .unwrap()
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .unwrap();
        let expected = timeutil::parse_utc("2025-01-02T03:04:00").unwrap();
        assert_eq!(start.value(0), timeutil::to_micros(expected));
    }

    #[test]
    fn test_bad_start_time_dropped() {
        let bad = record("t!b!c!s!i!G16!sec!2025-01-02T03:04:05!not-a-time!?UNKNOWN?!?UNKNOWN?");
        let good = record(
            "t!b!c!s!i!G16!sec!2025-01-02T03:04:05!2025-01-02T03:04:00!?UNKNOWN?!?UNKNOWN?",
        );
        let batch = storage_batch(&[bad, good]).unwrap();
        assert_eq!(batch.num_rows(), 1);
    }
}
