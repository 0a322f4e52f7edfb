//! Query the latency store: filtered time-range slices with the derived
//! latency column, printed as JSON. All times are UTC.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use regex::Regex;
use time::format_description::well_known::Iso8601;
use time::{OffsetDateTime, Time};

use sat_latency::env;
use sat_latency::pipeline::read::rows_as_json;
use sat_latency::pipeline::{read_latency_data, LatencyFilter};
use sat_latency::timeutil;

#[derive(Parser, Debug)]
#[command(
    name = "sat-latency-query",
    about = "Read filtered slices of the latency store",
    after_help = "All times should be in UTC!"
)]
struct Args {
    /// Top level directory that contains the latency files
    #[arg(short = 'd', long = "database-dir")]
    database_dir: Option<PathBuf>,

    /// Beginning of the time window: an ISO datetime, date, or time, or
    /// 'now'. Time-only assumes today, date-only assumes midnight.
    /// Default is today.
    #[arg(long = "from")]
    from: Option<String>,

    /// End of the time window, same format as --from. Default is now.
    #[arg(long = "until")]
    until: Option<String>,

    /// Only output rows whose start time matches this SQL-LIKE pattern,
    /// e.g. 2024-08-31T__:15:% for every hour's quarter past
    #[arg(long = "datematch")]
    datematch: Option<String>,

    /// Only output rows whose AMQP topic contains this regex
    #[arg(long = "topic")]
    topic: Option<String>,

    /// Filter by satellite id
    #[arg(long = "satellite-id", num_args = 1..)]
    satellite_id: Option<Vec<String>>,

    /// Filter by band
    #[arg(long = "band", num_args = 1..)]
    band: Option<Vec<String>>,

    /// Filter by coverage
    #[arg(long = "coverage", num_args = 1..)]
    coverage: Option<Vec<String>>,

    /// Filter by section
    #[arg(long = "section", num_args = 1..)]
    section: Option<Vec<String>>,

    /// Filter by data source
    #[arg(long = "ingest-source", num_args = 1..)]
    ingest_source: Option<Vec<String>>,

    /// Filter by instrument
    #[arg(long = "instrument", num_args = 1..)]
    instrument: Option<Vec<String>>,

    /// Columns to print, in order
    #[arg(
        long = "columns",
        num_args = 1..,
        default_values_t = [
            "satellite_id", "band", "coverage", "ingest_source",
            "instrument", "section", "start_time", "latency",
        ].map(String::from)
    )]
    columns: Vec<String>,

    /// Output format
    #[arg(long = "output-type", value_enum, default_value = "pretty-json-lines")]
    output_type: OutputType,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum OutputType {
    Json,
    PrettyJson,
    JsonLines,
    PrettyJsonLines,
}

impl OutputType {
    fn pretty(self) -> bool {
        matches!(self, OutputType::PrettyJson | OutputType::PrettyJsonLines)
    }

    fn lines(self) -> bool {
        matches!(self, OutputType::JsonLines | OutputType::PrettyJsonLines)
    }
}

/// Accepts an ISO datetime, a date (midnight), a time (today), or
/// `now`.
fn parse_time_spec(raw: &str, now: OffsetDateTime) -> Result<OffsetDateTime> {
    if raw.eq_ignore_ascii_case("now") {
        return Ok(now);
    }
    if raw.contains('T') {
        return timeutil::parse_utc(raw)
            .with_context(|| format!("cannot parse datetime {raw:?}"));
    }
    if raw.contains(':') {
        let parsed = Time::parse(raw, &Iso8601::DEFAULT)
            .with_context(|| format!("cannot parse time {raw:?}"))?;
        return Ok(now.date().with_time(parsed).assume_utc());
    }
    if raw.contains('-') {
        return timeutil::parse_utc(raw)
            .with_context(|| format!("cannot parse date {raw:?}"));
    }
    bail!("cannot parse {raw:?}, please follow the ISO format")
}

fn run(args: Args) -> Result<ExitCode> {
    let base_dir = args.database_dir.unwrap_or_else(env::latency_dir);
    if !base_dir.is_dir() {
        bail!("--database-dir needs to be an existing directory");
    }

    let now = OffsetDateTime::now_utc();
    let from = match &args.from {
        Some(raw) => parse_time_spec(raw, now)?,
        None => now.date().midnight().assume_utc(),
    };
    let until = match &args.until {
        Some(raw) => parse_time_spec(raw, now)?,
        None => now,
    };
    if until < from {
        bail!("negative time range specified, from {from} until {until}");
    }

    let filter = LatencyFilter {
        start: Some(from),
        until: Some(until),
        satellite_ids: args.satellite_id,
        bands: args.band,
        coverages: args.coverage,
        sections: args.section,
        sources: args.ingest_source,
        instruments: args.instrument,
        topic_regex: args
            .topic
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("bad --topic regex")?,
        date_like: args.datematch,
    };

    let table = read_latency_data(&base_dir, from, until, Some(&filter))?;
    let rows = rows_as_json(&table, Some(&args.columns))?;

    if rows.is_empty() {
        eprintln!("No data found in {}", base_dir.display());
        return Ok(ExitCode::SUCCESS);
    }

    let render = |value: &serde_json::Value| -> Result<String> {
        Ok(if args.output_type.pretty() {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        })
    };

    if args.output_type.lines() {
        for row in &rows {
            println!("{}", render(&serde_json::Value::Object(row.clone()))?);
        }
    } else {
        let all = serde_json::Value::Array(
            rows.into_iter().map(serde_json::Value::Object).collect(),
        );
        println!("{}", render(&all)?);
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("sat-latency-query: {err:#}");
            ExitCode::from(1)
        }
    }
}
