//! One publish target: a single broker or a failover cluster.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lapin::options::ConfirmSelectOptions;
use lapin::{Channel, Connection, ConnectionProperties};
use log::{debug, error, info, warn};
use tokio::sync::watch;
use url::Url;

use crate::error::{Error, Result};

/// Observable connection state of a target.
///
/// `Disconnected → Reconnecting → Connected`, falling back to
/// `Reconnecting` on a lost connection and to `Disconnected` once the
/// reconnect window is exhausted or the client shuts the target down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Reconnecting => write!(f, "reconnecting"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Outcome of one publish call against one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// The broker acknowledged the message.
    Accepted,
    /// The broker refused it.
    Rejected,
    /// The target was not connected; nothing was sent.
    Dropped,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Accepted => write!(f, "accepted"),
            DeliveryStatus::Rejected => write!(f, "rejected"),
            DeliveryStatus::Dropped => write!(f, "dropped"),
        }
    }
}

/// Per-target reconnect policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Pause between attempts.
    pub interval: Duration,
    /// Give up (status `Disconnected`) after this long of continuous
    /// unreachability; `None` keeps trying forever.
    pub window: Option<Duration>,
}

impl ReconnectConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

    /// Build from CLI values; a negative window means forever.
    pub fn from_args(interval_secs: f64, window_secs: i64) -> Self {
        Self {
            interval: Duration::from_secs_f64(interval_secs.max(0.0)),
            window: u64::try_from(window_secs)
                .ok()
                .map(Duration::from_secs),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            window: Some(Self::DEFAULT_WINDOW),
        }
    }
}

/// A validated publish target: one URI, or several tried in order with
/// at most one active member at a time.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub name: String,
    pub uris: Vec<String>,
}

impl TargetSpec {
    pub fn single(uri: &str) -> Result<TargetSpec> {
        Ok(TargetSpec {
            name: redact(uri)?,
            uris: vec![uri.to_string()],
        })
    }

    pub fn cluster(uris: &[String]) -> Result<TargetSpec> {
        if uris.is_empty() {
            return Err(Error::Config("a cluster needs at least one URI".into()));
        }
        let redacted = uris
            .iter()
            .map(|uri| redact(uri))
            .collect::<Result<Vec<_>>>()?;
        Ok(TargetSpec {
            name: redacted.join("|"),
            uris: uris.to_vec(),
        })
    }
}

/// Target identity with credentials stripped, safe for logs and status
/// maps.
fn redact(uri: &str) -> Result<String> {
    let mut url = Url::parse(uri)
        .map_err(|err| Error::Config(format!("bad AMQP URI {uri:?}: {err}")))?;
    let _ = url.set_password(None);
    Ok(url.to_string())
}

pub(crate) struct TargetShared {
    pub status: ConnectionStatus,
    pub channel: Option<Channel>,
}

pub(crate) struct TargetHandle {
    pub name: String,
    pub shared: Arc<Mutex<TargetShared>>,
    pub task: tokio::task::JoinHandle<()>,
}

impl TargetShared {
    pub(crate) fn set(&mut self, status: ConnectionStatus, channel: Option<Channel>) {
        self.status = status;
        self.channel = channel;
    }
}

pub(crate) fn lock_shared(shared: &Arc<Mutex<TargetShared>>) -> std::sync::MutexGuard<'_, TargetShared> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) async fn try_connect(uri: &str) -> Result<(Connection, Channel)> {
    let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;
    Ok((connection, channel))
}

/// Own a target's connection for its lifetime: monitor an established
/// connection, rotate cluster members on failure, honor the reconnect
/// window, and surface every state change through `shared`.
pub(crate) async fn maintain(
    name: String,
    mut live: Option<Connection>,
    uris: Vec<String>,
    shared: Arc<Mutex<TargetShared>>,
    config: ReconnectConfig,
    mut down_since: Option<Instant>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut index = 0usize;
    loop {
        if *shutdown.borrow() {
            break;
        }
        match live.take() {
            Some(connection) => {
                // Monitor until the connection dies, a publish failure
                // flags the target, or shutdown.
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.changed() => {}
                    }
                    if *shutdown.borrow() {
                        let _ = connection.close(0, "").await;
                        lock_shared(&shared).set(ConnectionStatus::Disconnected, None);
                        return;
                    }
                    if !connection.status().connected()
                        || lock_shared(&shared).status != ConnectionStatus::Connected
                    {
                        break;
                    }
                }
                warn!("lost connection to {name}");
                lock_shared(&shared).set(ConnectionStatus::Reconnecting, None);
                down_since.get_or_insert_with(Instant::now);
            }
            None => {
                let uri = &uris[index % uris.len()];
                match try_connect(uri).await {
                    Ok((connection, channel)) => {
                        info!("connected to {name}");
                        lock_shared(&shared).set(ConnectionStatus::Connected, Some(channel));
                        down_since = None;
                        live = Some(connection);
                    }
                    Err(err) => {
                        debug!("connect attempt on {name} failed: {err}");
                        lock_shared(&shared).set(ConnectionStatus::Reconnecting, None);
                        // Clusters try their members in order.
                        index += 1;
                        let started = *down_since.get_or_insert_with(Instant::now);
                        if let Some(window) = config.window {
                            if started.elapsed() >= window {
                                error!("giving up on {name} after {:?} unreachable", window);
                                lock_shared(&shared).set(ConnectionStatus::Disconnected, None);
                                return;
                            }
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(config.interval) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
            }
        }
    }
    lock_shared(&shared).set(ConnectionStatus::Disconnected, None);
}
