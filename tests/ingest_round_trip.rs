use arrow::array::{Array, Float64Array, StringArray, TimestampMicrosecondArray};
use tempfile::tempdir;
use time::macros::{date, datetime};

use sat_latency::pipeline::read::rows_as_json;
use sat_latency::pipeline::{
    partition_date, read_latency_data, read_records, storage_batch, BatchWriter,
};
use sat_latency::timeutil;

const LINE: &[u8] =
    b"topic1!b1!c1!s1!i1!G16!sec1!2025-01-02T03:04:05!2025-01-02T03:04:00!?UNKNOWN?!?UNKNOWN?\n";

#[test]
fn ingest_write_read_round_trip() {
    let dir = tempdir().expect("tempdir");

    let records: Vec<_> = read_records(LINE).collect();
    assert_eq!(records.len(), 1);
    let date = partition_date(&records[0]).expect("partition date");
    assert_eq!(date, date!(2025 - 01 - 02));

    let batch = storage_batch(&records).expect("batch");
    let mut writer = BatchWriter::create(dir.path()).expect("writer");
    writer.write_batch(&batch, date).expect("write");
    writer.close().expect("close");

    let table = read_latency_data(
        dir.path(),
        datetime!(2025-01-02 00:00:00 UTC),
        datetime!(2025-01-02 23:59:59 UTC),
        None,
    )
    .expect("read");
    assert_eq!(table.num_rows(), 1);

    // String fields survive unchanged, nulls preserved.
    for (column, expected) in [
        ("topic", Some("topic1")),
        ("band", Some("b1")),
        ("coverage", Some("c1")),
        ("ingest_source", Some("s1")),
        ("instrument", Some("i1")),
        ("satellite_id", Some("G16")),
        ("section", Some("sec1")),
    ] {
        let array = table
            .column_by_name(column)
            .expect(column)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("string column");
        match expected {
            Some(value) => assert_eq!(array.value(0), value),
            None => assert!(array.is_null(0)),
        }
    }
    assert!(table.column_by_name("end_time").expect("end_time").is_null(0));
    assert!(table
        .column_by_name("create_time")
        .expect("create_time")
        .is_null(0));

    // Naive timestamps were reinterpreted as UTC.
    let start = table
        .column_by_name("start_time")
        .expect("start_time")
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .expect("timestamp column");
    assert_eq!(
        start.value(0),
        timeutil::to_micros(datetime!(2025-01-02 03:04:00 UTC))
    );

    // Derived latency: reception - start = 5 seconds.
    let latency = table
        .column_by_name("latency")
        .expect("latency")
        .as_any()
        .downcast_ref::<Float64Array>()
        .expect("latency column");
    assert!((latency.value(0) - 5.0).abs() < 1e-3);
}

#[test]
fn latency_matches_timestamp_delta_to_the_millisecond() {
    let dir = tempdir().expect("tempdir");
    let line =
        b"t!b!c!s!i!G16!sec!2025-01-02T03:05:00.250!2025-01-02T03:04:00!?UNKNOWN?!?UNKNOWN?\n";
    let records: Vec<_> = read_records(line.as_slice()).collect();
    let batch = storage_batch(&records).expect("batch");
    let mut writer = BatchWriter::create(dir.path()).expect("writer");
    writer.write_batch(&batch, date!(2025 - 01 - 02)).expect("write");
    writer.close().expect("close");

    let table = read_latency_data(
        dir.path(),
        datetime!(2025-01-02 00:00:00 UTC),
        datetime!(2025-01-03 00:00:00 UTC),
        None,
    )
    .expect("read");
    let rows = rows_as_json(&table, None).expect("rows");
    assert_eq!(rows.len(), 1);
    let latency = rows[0]["latency"].as_f64().expect("latency value");
    assert!((latency - 60.25).abs() < 1e-3);
    assert_eq!(rows[0]["end_time"], serde_json::Value::Null);
}

#[test]
fn reader_tolerates_truncated_tail() {
    let dir = tempdir().expect("tempdir");
    let records: Vec<_> = read_records(LINE).collect();
    let batch = storage_batch(&records).expect("batch");
    let date = date!(2025 - 01 - 02);

    let mut writer = BatchWriter::create(dir.path()).expect("writer");
    writer.write_batch(&batch, date).expect("write");
    writer.close().expect("close");

    // Simulate a crash mid-append: stray bytes after the finished
    // segment must read as end-of-file.
    let path = dir
        .path()
        .join("2025")
        .join("2025_01")
        .join("2025_01_02_latencies.arrows");
    let mut existing = std::fs::read(&path).expect("read file");
    existing.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x01]);
    std::fs::write(&path, existing).expect("rewrite file");

    let table = read_latency_data(
        dir.path(),
        datetime!(2025-01-02 00:00:00 UTC),
        datetime!(2025-01-02 23:59:59 UTC),
        None,
    )
    .expect("read");
    assert_eq!(table.num_rows(), 1);
}

#[test]
fn append_sessions_accumulate_in_one_partition_file() {
    let dir = tempdir().expect("tempdir");
    let records: Vec<_> = read_records(LINE).collect();
    let batch = storage_batch(&records).expect("batch");
    let date = date!(2025 - 01 - 02);

    for _ in 0..2 {
        let mut writer = BatchWriter::create(dir.path()).expect("writer");
        writer.write_batch(&batch, date).expect("write");
        writer.close().expect("close");
    }

    let table = read_latency_data(
        dir.path(),
        datetime!(2025-01-02 00:00:00 UTC),
        datetime!(2025-01-02 23:59:59 UTC),
        None,
    )
    .expect("read");
    assert_eq!(table.num_rows(), 2);
}
