//! Subscribe to one or more AMQP brokers and emit one line per message,
//! with optional cross-broker deduplication and scoring.

use std::io::Read;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::LevelFilter;

use sat_latency::amqp::{AmqpSession, ReconnectPolicy, SessionConfig};
use sat_latency::dispatch::{DispatchConfig, Dispatcher};
use sat_latency::emit::{named_callback, Emit, EmitMode, Formatter};
use sat_latency::supervise::{run_fanin, FaninConfig};
use sat_latency::transform::Transforms;

const ABOUT: &str = "Subscribes to and outputs messages from one or more AMQP servers \
generating JSON dictionary payloads. Typically used with xargs -L1 or other downstream \
pipe-accepting scripts as an AMQP alternative to 'find'. Can race (--window with --key) \
multiple servers for messages having matching keys, or score (--window, --key, --score) \
them to emit best-in-window.";

#[derive(Parser, Debug)]
#[command(name = "amqpfind", about = ABOUT)]
struct Args {
    /// Name of AMQP server to connect to (repeatable)
    #[arg(short = 'H', long = "host")]
    hosts: Vec<String>,

    /// Name of exchange to connect to (repeatable)
    #[arg(short = 'X', long = "exchange")]
    exchanges: Vec<String>,

    /// User id to talk to the AMQP exchange as (repeatable)
    #[arg(short = 'u', long = "user")]
    users: Vec<String>,

    /// Password for the user (repeatable)
    #[arg(short = 'p', long = "passwd")]
    passwds: Vec<String>,

    /// AMQP topic pattern to listen for and consume (repeatable)
    #[arg(short = 'C', long = "consume")]
    consumes: Vec<String>,

    /// Name of durable queue to use, or @ for the local hostname;
    /// default is an auto-delete queue (repeatable)
    #[arg(short = 'D', long = "durable")]
    durables: Vec<String>,

    /// Topic pattern to send one event under, using JSON from stdin
    #[arg(short = 'P', long = "produce")]
    produce: Option<String>,

    /// Emit format string over payload keys; '?' for a readable dump,
    /// '*' for NUL-terminated [topic, payload] JSON (xargs -0)
    #[arg(short = 'j', long = "json")]
    json: Option<String>,

    /// Name of a built-in callback to emit messages with instead of -j
    #[arg(short = 'c', long = "callback")]
    callback: Option<String>,

    /// Transform a payload field before output,
    /// e.g. "path=replace(path, '/here', '/there')" (repeatable)
    #[arg(short = 'T', long = "transform")]
    transforms: Vec<String>,

    /// Exit with status 2 if no messages are emitted for N seconds
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Seconds to keep keys around for scoring or racing competing
    /// messages
    #[arg(short = 'w', long = "window")]
    window: Option<f64>,

    /// Expression returning a key tuple for multi-server deduplication,
    /// e.g. "(sat, scene, start_time)"
    #[arg(short = 'k', long = "key")]
    key: Option<String>,

    /// Score to maximize, e.g. "defects"; or min:<expr> / max:<expr> to
    /// pick the comparator direction
    #[arg(short = 's', long = "score")]
    score: Option<String>,

    /// Seconds between reconnect attempts after a broker connection dies
    #[arg(long = "reconnect-delay", default_value_t = 30.0)]
    reconnect_delay: f64,

    /// Reconnect attempts per broker before giving up (default: forever)
    #[arg(long = "reconnect-tries")]
    reconnect_tries: Option<u32>,

    /// Each occurrence raises verbosity through ERROR-WARN-INFO-DEBUG
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbosity: u8,

    /// Report full error chains on failure
    #[arg(short = 'd', long = "debug")]
    debug: bool,
}

fn init_logging(verbosity: u8) {
    let levels = [
        LevelFilter::Error,
        LevelFilter::Warn,
        LevelFilter::Info,
        LevelFilter::Debug,
    ];
    env_logger::Builder::from_default_env()
        .filter_level(levels[verbosity.min(3) as usize])
        .init();
}

/// Align repeated options: one value broadcasts to every server, N
/// values line up positionally, other lengths are ambiguous.
fn pick(values: &[String], index: usize, total: usize, name: &str) -> Result<Option<String>> {
    match values.len() {
        0 => Ok(None),
        1 => Ok(Some(values[0].clone())),
        len if len == total => Ok(Some(values[index].clone())),
        len => bail!(
            "inconsistent number of {name} values is ambiguous: got {len}, expected 1 or {total}"
        ),
    }
}

fn server_configs(args: &Args) -> Result<Vec<SessionConfig>> {
    if args.hosts.is_empty() {
        bail!("at least one -H host is required");
    }
    let total = [
        args.hosts.len(),
        args.exchanges.len(),
        args.users.len(),
        args.passwds.len(),
        args.consumes.len(),
        args.durables.len(),
    ]
    .into_iter()
    .max()
    .unwrap_or(0);

    let mut servers = Vec::with_capacity(total);
    for index in 0..total {
        servers.push(SessionConfig {
            host: pick(&args.hosts, index, total, "host")?
                .context("every server needs a host")?,
            exchange: pick(&args.exchanges, index, total, "exchange")?
                .unwrap_or_else(|| "satellite".to_string()),
            user: pick(&args.users, index, total, "user")?
                .unwrap_or_else(|| "guest".to_string()),
            password: pick(&args.passwds, index, total, "passwd")?
                .unwrap_or_else(|| "guest".to_string()),
            routing_key: pick(&args.consumes, index, total, "consume")?
                .unwrap_or_else(|| "#".to_string()),
            durable: pick(&args.durables, index, total, "durable")?,
        });
    }
    Ok(servers)
}

async fn produce(config: SessionConfig, topic: &str) -> Result<()> {
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("reading payload from stdin")?;
    let payload: serde_json::Value =
        serde_json::from_str(text.trim()).context("stdin is not JSON")?;
    let serde_json::Value::Object(payload) = payload else {
        bail!("stdin must hold a JSON object");
    };
    let session = AmqpSession::open(config)
        .await
        .context("connecting for produce")?;
    session.publish(topic, &payload).await?;
    session.close().await?;
    Ok(())
}

async fn run(args: Args) -> Result<ExitCode> {
    let servers = server_configs(&args)?;

    if let Some(topic) = &args.produce {
        if servers.len() != 1 {
            bail!("produce mode supports exactly one server");
        }
        let Some(config) = servers.into_iter().next() else {
            bail!("produce mode supports exactly one server");
        };
        produce(config, topic).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let dispatch_config = DispatchConfig {
        key: args.key.clone(),
        score: args.score.clone(),
        window: args.window.map(Duration::from_secs_f64),
    };
    if servers.len() == 1 && dispatch_config.wants_dedup() {
        bail!("key, window, and score options require multiple servers to operate");
    }

    let transforms = Transforms::parse(&args.transforms)?;
    let emitter: Box<dyn Emit + Send> = match &args.callback {
        Some(name) => {
            named_callback(name).with_context(|| format!("unknown callback {name:?}"))?
        }
        None => Box::new(Formatter::stdout(EmitMode::from_format(args.json.as_deref()))),
    };
    let dispatcher = Dispatcher::new(dispatch_config, transforms, emitter)?;

    let fanin = FaninConfig {
        idle_timeout: args.timeout.filter(|secs| *secs > 0).map(Duration::from_secs),
        reconnect: ReconnectPolicy {
            delay: Duration::from_secs_f64(args.reconnect_delay.max(0.0)),
            tries: args.reconnect_tries,
        },
    };

    match run_fanin(servers, dispatcher, fanin).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(sat_latency::Error::IdleTimeout) => Ok(ExitCode::from(2)),
        Err(err) => Err(err.into()),
    }
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
    init_logging(args.verbosity);
    let debug = args.debug;
    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            if debug {
                eprintln!("amqpfind: {err:?}");
            } else {
                eprintln!("amqpfind: {err:#}");
            }
            ExitCode::from(1)
        }
    }
}
