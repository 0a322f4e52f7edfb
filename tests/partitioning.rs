use std::collections::BTreeMap;

use tempfile::tempdir;
use time::macros::datetime;
use time::Date;

use sat_latency::pipeline::read::rows_as_json;
use sat_latency::pipeline::{
    partition_date, read_latency_data, read_records, storage_batch, BatchWriter, IngestRecord,
    LatencyFilter,
};

fn ingest_lines() -> Vec<u8> {
    [
        "top.a!b1!c1!s1!i1!G16!sec1!2025-01-02T01:00:05!2025-01-02T01:00:00!?UNKNOWN?!?UNKNOWN?",
        "top.b!b2!c1!s1!i1!G18!sec1!2025-01-02T02:00:09!2025-01-02T02:00:00!?UNKNOWN?!?UNKNOWN?",
        "top.c!b1!c2!s1!i1!G16!sec2!2025-01-03T01:00:30!2025-01-03T01:00:00!?UNKNOWN?!?UNKNOWN?",
    ]
    .join("\n")
    .into_bytes()
}

fn write_grouped(base: &std::path::Path) {
    let mut grouped: BTreeMap<Date, Vec<IngestRecord>> = BTreeMap::new();
    for record in read_records(ingest_lines().as_slice()) {
        let date = partition_date(&record).expect("partition date");
        grouped.entry(date).or_default().push(record);
    }
    let mut writer = BatchWriter::create(base).expect("writer");
    for (date, records) in grouped {
        // One flush per group, written as a single batch.
        let batch = storage_batch(&records).expect("batch");
        writer.write_batch(&batch, date).expect("write");
    }
    writer.close().expect("close");
}

#[test]
fn records_split_into_daily_partition_files() {
    let dir = tempdir().expect("tempdir");
    write_grouped(dir.path());

    let day_one = dir
        .path()
        .join("2025")
        .join("2025_01")
        .join("2025_01_02_latencies.arrows");
    let day_two = dir
        .path()
        .join("2025")
        .join("2025_01")
        .join("2025_01_03_latencies.arrows");
    assert!(day_one.is_file());
    assert!(day_two.is_file());

    let first = read_latency_data(
        dir.path(),
        datetime!(2025-01-02 00:00:00 UTC),
        datetime!(2025-01-02 23:59:59 UTC),
        None,
    )
    .expect("read day one");
    assert_eq!(first.num_rows(), 2);

    let second = read_latency_data(
        dir.path(),
        datetime!(2025-01-03 00:00:00 UTC),
        datetime!(2025-01-03 23:59:59 UTC),
        None,
    )
    .expect("read day two");
    assert_eq!(second.num_rows(), 1);

    let both = read_latency_data(
        dir.path(),
        datetime!(2025-01-02 00:00:00 UTC),
        datetime!(2025-01-03 23:59:59 UTC),
        None,
    )
    .expect("read range");
    assert_eq!(both.num_rows(), 3);
}

#[test]
fn filters_push_down_into_the_read() {
    let dir = tempdir().expect("tempdir");
    write_grouped(dir.path());
    let from = datetime!(2025-01-02 00:00:00 UTC);
    let until = datetime!(2025-01-03 23:59:59 UTC);

    let by_sat = LatencyFilter {
        satellite_ids: Some(vec!["G16".into()]),
        ..Default::default()
    };
    let table = read_latency_data(dir.path(), from, until, Some(&by_sat)).expect("read");
    assert_eq!(table.num_rows(), 2);

    let by_topic = LatencyFilter {
        topic_regex: Some(regex::Regex::new("top\\.b").expect("regex")),
        ..Default::default()
    };
    let table = read_latency_data(dir.path(), from, until, Some(&by_topic)).expect("read");
    assert_eq!(table.num_rows(), 1);
    let rows = rows_as_json(&table, None).expect("rows");
    assert_eq!(rows[0]["satellite_id"], serde_json::json!("G18"));

    let by_range = LatencyFilter {
        start: Some(datetime!(2025-01-02 01:30:00 UTC)),
        until: Some(until),
        ..Default::default()
    };
    let table = read_latency_data(dir.path(), from, until, Some(&by_range)).expect("read");
    assert_eq!(table.num_rows(), 2);

    let by_datematch = LatencyFilter {
        date_like: Some("2025-01-__T01:%".into()),
        ..Default::default()
    };
    let table = read_latency_data(dir.path(), from, until, Some(&by_datematch)).expect("read");
    assert_eq!(table.num_rows(), 2);

    let projected = rows_as_json(&table, Some(&["satellite_id".into(), "latency".into()]))
        .expect("projection");
    assert_eq!(projected[0].len(), 2);
}
