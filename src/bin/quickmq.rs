//! Publish JSON payloads to individual brokers and failover clusters.

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use tokio::io::AsyncBufReadExt;

use sat_latency::event::Payload;
use sat_latency::publish::{Client, ConnectionStatus, DeliveryStatus, ReconnectConfig, TargetSpec};

#[derive(Parser, Debug)]
#[command(
    name = "quickmq",
    about = "Publish JSON objects to individual AMQP brokers and clusters"
)]
struct Args {
    /// AMQP URIs of individual servers to publish to
    #[arg(short = 'H', long = "host", num_args = 1..)]
    hosts: Vec<String>,

    /// Group of AMQP URIs to publish to as one failover cluster; repeat
    /// for multiple clusters, e.g. -C uri1 uri2 -C uri3 uri4
    #[arg(short = 'C', long = "cluster", num_args = 1.., action = clap::ArgAction::Append, value_parser = clap::value_parser!(String))]
    clusters: Vec<Vec<String>>,

    /// The exchange to publish the data to
    #[arg(short = 'X', long = "exchange", default_value = "")]
    exchange: String,

    /// Seconds a connection waits before reconnecting
    #[arg(long = "reconnect-delay", default_value_t = 5.0)]
    reconnect_delay: f64,

    /// Seconds a connection may keep reconnecting before giving up;
    /// negative means forever
    #[arg(long = "reconnect-window", default_value_t = 300)]
    reconnect_window: i64,

    /// Exit before publishing if no connection could be established
    #[arg(long = "fast-fail")]
    fast_fail: bool,

    /// Topic to publish with; {field} placeholders are filled from each
    /// payload, e.g. '{satellite_fam}.{satellite_id}.test'
    #[arg(short = 'T', long = "topic", default_value = "")]
    topic: String,

    /// Extra key=value pair(s) added to each payload
    #[arg(short = 'm', long = "metadata", num_args = 1.., value_parser = key_value)]
    metadata: Vec<(String, String)>,

    /// JSON object to publish once; without it, payloads stream from
    /// stdin one JSON object per line
    #[arg(short = 'D', long = "data")]
    data: Option<String>,

    /// Verbosity (repeat for more)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbosity: u8,
}

fn key_value(raw: &str) -> std::result::Result<(String, String), String> {
    // An empty key is allowed; only a missing '=' or empty value is not.
    match raw.split_once('=') {
        Some((key, value)) if !value.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("{raw:?} is not of the form key=value")),
    }
}

/// Fill `{field}` placeholders in the topic from the payload, including
/// `{field[subfield]}` indexing into nested objects and arrays. A topic
/// without braces passes through untouched; a missing field is an error
/// so stream mode can skip the line.
fn hydrate_topic(topic_fmt: &str, payload: &Payload) -> Result<String> {
    if !topic_fmt.contains('{') {
        return Ok(topic_fmt.to_string());
    }
    let mut topic = String::with_capacity(topic_fmt.len());
    let mut chars = topic_fmt.chars();
    while let Some(ch) = chars.next() {
        if ch != '{' {
            topic.push(ch);
            continue;
        }
        let mut field = String::new();
        for inner in chars.by_ref() {
            if inner == '}' {
                break;
            }
            field.push(inner);
        }
        let value = resolve_field(&field, payload)
            .with_context(|| format!("payload has no field {field:?} for the topic format"))?;
        match value {
            serde_json::Value::String(text) => topic.push_str(text),
            other => topic.push_str(&other.to_string()),
        }
    }
    Ok(topic)
}

/// Resolve a placeholder like `field` or `field[sub][0]` against the
/// payload. String indices descend into objects, numeric ones into
/// arrays.
fn resolve_field<'a>(placeholder: &str, payload: &'a Payload) -> Option<&'a serde_json::Value> {
    let (name, mut rest) = match placeholder.find('[') {
        Some(split) => placeholder.split_at(split),
        None => (placeholder, ""),
    };
    let mut value = payload.get(name)?;
    while let Some(stripped) = rest.strip_prefix('[') {
        let end = stripped.find(']')?;
        let index = &stripped[..end];
        rest = &stripped[end + 1..];
        value = match value {
            serde_json::Value::Object(object) => object.get(index)?,
            serde_json::Value::Array(items) => items.get(index.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if rest.is_empty() {
        Some(value)
    } else {
        None
    }
}

fn parse_payload(raw: &str) -> Result<Payload> {
    let value: serde_json::Value = serde_json::from_str(raw).context("not JSON data")?;
    match value {
        serde_json::Value::Object(payload) => Ok(payload),
        _ => bail!("payload must be a JSON object"),
    }
}

fn apply_metadata(payload: &mut Payload, metadata: &[(String, String)]) {
    for (key, value) in metadata {
        payload.insert(key.clone(), value.clone().into());
    }
}

fn any_accepted(statuses: &std::collections::BTreeMap<String, DeliveryStatus>) -> bool {
    statuses
        .values()
        .any(|status| *status == DeliveryStatus::Accepted)
}

async fn run(args: Args) -> Result<ExitCode> {
    if args.hosts.is_empty() && args.clusters.is_empty() {
        bail!("at least one connection is required; use --host and/or --cluster");
    }

    let one_shot = args
        .data
        .as_deref()
        .map(parse_payload)
        .transpose()
        .context("invalid -D/--data")?;

    let mut client = Client::new(ReconnectConfig::from_args(
        args.reconnect_delay,
        args.reconnect_window,
    ));
    for uri in &args.hosts {
        client.connect(TargetSpec::single(uri)?).await;
    }
    for cluster in &args.clusters {
        client.connect(TargetSpec::cluster(cluster)?).await;
    }

    let statuses = client.statuses();
    if args.fast_fail
        && statuses
            .values()
            .all(|status| *status == ConnectionStatus::Reconnecting)
    {
        let names: Vec<&str> = statuses.keys().map(String::as_str).collect();
        eprintln!(
            "Fast fail; couldn't establish any connection(s) to: {}",
            names.join(", ")
        );
        client.disconnect().await;
        return Ok(ExitCode::from(1));
    }

    if let Some(mut payload) = one_shot {
        apply_metadata(&mut payload, &args.metadata);
        let topic = hydrate_topic(&args.topic, &payload)?;
        let statuses = client.publish(&payload, &topic, &args.exchange).await;
        client.disconnect().await;
        let all_failed = !any_accepted(&statuses);
        return Ok(ExitCode::from(all_failed as u8));
    }

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("got interrupt, ta ta for now");
                break;
            }
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let mut payload = match parse_payload(line.trim()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("skipping line: {err:#}");
                continue;
            }
        };
        apply_metadata(&mut payload, &args.metadata);
        let topic = match hydrate_topic(&args.topic, &payload) {
            Ok(topic) => topic,
            Err(err) => {
                warn!("couldn't create topic: {err:#}");
                continue;
            }
        };
        let statuses = client.publish(&payload, &topic, &args.exchange).await;
        match serde_json::to_string(&statuses) {
            Ok(rendered) => info!("published under {topic} with status {rendered}"),
            Err(_) => info!("published under {topic}"),
        }
    }
    client.disconnect().await;
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };
    let levels = [
        LevelFilter::Warn,
        LevelFilter::Info,
        LevelFilter::Debug,
        LevelFilter::Trace,
    ];
    env_logger::Builder::from_default_env()
        .filter_level(levels[args.verbosity.min(3) as usize])
        .init();

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("quickmq: {err:#}");
            ExitCode::from(1)
        }
    }
}
