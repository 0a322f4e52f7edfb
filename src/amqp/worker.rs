//! Per-broker consume loop with bounded reconnect.

use std::time::Duration;

use log::{error, info, warn};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};

use super::session::{AmqpSession, SessionConfig};
use crate::event::Event;

/// Reconnect behavior after a session dies.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// `None` retries forever.
    pub tries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(30),
            tries: None,
        }
    }
}

/// Consume one broker until shutdown, stamping reception metadata on
/// every delivery and pushing it onto the fan-in queue.
///
/// The loop reconnects after `policy.delay` whenever the session dies,
/// up to `policy.tries` times.
pub async fn worker_run(
    config: SessionConfig,
    events: mpsc::UnboundedSender<Event>,
    policy: ReconnectPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut remaining = policy.tries;
    loop {
        if *shutdown.borrow() {
            break;
        }
        info!("connecting to {}", config.host);
        match AmqpSession::open(config.clone()).await {
            Ok(session) => {
                let host = config.host.clone();
                let sender = events.clone();
                let result = session
                    .consume(
                        move |routing_key, payload| {
                            let event = Event {
                                topic: routing_key.to_string(),
                                reception_time: OffsetDateTime::now_utc(),
                                reception_host: host.clone(),
                                payload,
                            };
                            // A closed receiver means the supervisor is
                            // already gone; the shutdown flag ends us.
                            let _ = sender.send(event);
                        },
                        shutdown.clone(),
                    )
                    .await;
                if let Err(err) = result {
                    error!("exception in server connection {}: {err}", config.host);
                }
                let _ = session.close().await;
            }
            Err(err) => error!("connection to {} failed: {err}", config.host),
        }
        if *shutdown.borrow() {
            break;
        }
        if let Some(left) = remaining.as_mut() {
            if *left == 0 {
                warn!("no reconnect attempts left for {}", config.host);
                break;
            }
            *left -= 1;
            info!("{left} retries remaining for {}", config.host);
        }
        warn!(
            "sleeping {}s before reconnecting to {}",
            policy.delay.as_secs_f64(),
            config.host
        );
        tokio::select! {
            _ = tokio::time::sleep(policy.delay) => {}
            _ = shutdown.changed() => {}
        }
    }
}
