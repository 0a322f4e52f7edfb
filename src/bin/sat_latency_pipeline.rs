//! Read emitted notification lines from stdin and append them to the
//! date-partitioned latency store.
//!
//! Batches are flushed once `SAT_LATENCY_BATCH_SIZE` records have
//! accumulated or `SAT_LATENCY_BATCH_DELAY` seconds have passed since
//! the last flush, whichever comes first.

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use log::{debug, error, info, warn, LevelFilter};
use time::Date;

use sat_latency::env;
use sat_latency::pipeline::{partition_date, read_records, storage_batch, BatchWriter, IngestRecord};

#[derive(Parser, Debug)]
#[command(
    name = "sat-latency-pipeline",
    about = "Load the emitted notification stream into the latency store"
)]
struct Args {
    /// Verbosity of the pipeline (repeat for more)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbosity: u8,
}

fn flush(writer: &mut BatchWriter, pending: &mut BTreeMap<Date, Vec<IngestRecord>>) {
    for (date, records) in pending.iter() {
        info!("writing batch of {} records for {date}", records.len());
        match storage_batch(records) {
            Ok(batch) if batch.num_rows() > 0 => {
                if let Err(err) = writer.write_batch(&batch, *date) {
                    // The records of this batch are lost; the writer
                    // reopens the partition on the next flush.
                    error!("batch write for {date} failed: {err}");
                }
            }
            Ok(_) => {}
            Err(err) => error!("batch assembly for {date} failed: {err}"),
        }
    }
    pending.clear();
}

fn run() -> Result<()> {
    let batch_max_size = env::batch_max_size();
    let batch_max_delay = env::batch_max_delay();
    let mut writer = BatchWriter::create(env::latency_dir())?;

    let mut pending: BTreeMap<Date, Vec<IngestRecord>> = BTreeMap::new();
    let mut batched = 0usize;
    let mut last_flush = Instant::now();

    let stdin = std::io::stdin();
    for record in read_records(stdin.lock()) {
        let Some(date) = partition_date(&record) else {
            warn!("couldn't decode start date for {:?}", record.topic());
            continue;
        };
        debug!("got {:?}", record.topic());
        pending.entry(date).or_default().push(record);
        batched += 1;

        if batched < batch_max_size && last_flush.elapsed() < batch_max_delay {
            continue;
        }
        flush(&mut writer, &mut pending);
        batched = 0;
        last_flush = Instant::now();
    }

    flush(&mut writer, &mut pending);
    writer.close()?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let levels = [
        LevelFilter::Error,
        LevelFilter::Warn,
        LevelFilter::Info,
        LevelFilter::Debug,
    ];
    env_logger::Builder::from_default_env()
        .filter_level(levels[args.verbosity.min(3) as usize])
        .format_timestamp_secs()
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("sat-latency-pipeline: {err:#}");
            ExitCode::from(1)
        }
    }
}
