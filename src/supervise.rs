//! The fan-in loop: workers in, dispatcher-paced waits, idle timeout.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};

use crate::amqp::{worker_run, ReconnectPolicy, SessionConfig};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::event::Event;

/// Supervisor options.
#[derive(Debug, Default, Clone)]
pub struct FaninConfig {
    /// Exit with [`Error::IdleTimeout`] when nothing has been emitted
    /// for this long.
    pub idle_timeout: Option<Duration>,
    pub reconnect: ReconnectPolicy,
}

/// Run one worker per broker and drive the dispatcher until shutdown.
///
/// The wait on the fan-in queue is bounded by whichever comes first: the
/// dispatcher's next window close or the idle deadline. An interrupt
/// flushes open windows (Compete emits current winners) and returns
/// cleanly; the idle timeout aborts without flushing.
pub async fn run_fanin(
    sessions: Vec<SessionConfig>,
    mut dispatcher: Dispatcher,
    config: FaninConfig,
) -> Result<()> {
    if sessions.is_empty() {
        return Err(Error::Config("no brokers configured".into()));
    }

    let (sender, mut receiver) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers: Vec<_> = sessions
        .into_iter()
        .map(|session| {
            tokio::spawn(worker_run(
                session,
                sender.clone(),
                config.reconnect.clone(),
                shutdown_rx.clone(),
            ))
        })
        .collect();
    drop(sender);
    info!("started {} workers", workers.len());

    let mut max_wait: Option<Duration> = None;
    let mut emitted = dispatcher.emitted();
    let mut last_emit = Instant::now();

    let outcome = loop {
        let idle_left = config
            .idle_timeout
            .map(|limit| limit.saturating_sub(last_emit.elapsed()));
        if idle_left == Some(Duration::ZERO) {
            warn!("timeout due to no messages emitted, exiting");
            break Err(Error::IdleTimeout);
        }
        let wait = match (max_wait, idle_left) {
            (None, None) => None,
            (Some(window), None) => Some(window),
            (None, Some(idle)) => Some(idle),
            (Some(window), Some(idle)) => Some(window.min(idle)),
        };

        let step = tokio::select! {
            _ = tokio::signal::ctrl_c() => Step::Interrupted,
            step = bounded_recv(&mut receiver, wait) => step,
        };

        match step {
            Step::Interrupted => {
                warn!("interrupt, flushing open windows and exiting");
                dispatcher.flush();
                break Ok(());
            }
            Step::Closed => {
                // Every worker has given up (bounded reconnects).
                warn!("all workers exited, flushing and shutting down");
                dispatcher.flush();
                break Ok(());
            }
            Step::TimedOut => {
                debug!("dispatching a cleanup pass after timeout");
                max_wait = dispatcher.tick(OffsetDateTime::now_utc());
            }
            Step::Event(event) => {
                debug!("received message from {}", event.reception_host);
                max_wait = dispatcher.accept(OffsetDateTime::now_utc(), event);
            }
        }

        let now_emitted = dispatcher.emitted();
        if now_emitted != emitted {
            emitted = now_emitted;
            last_emit = Instant::now();
        }
    };

    let _ = shutdown_tx.send(true);
    for worker in workers {
        if tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .is_err()
        {
            warn!("worker did not stop in time");
        }
    }
    outcome
}

enum Step {
    Event(Event),
    TimedOut,
    Closed,
    Interrupted,
}

async fn bounded_recv(
    receiver: &mut mpsc::UnboundedReceiver<Event>,
    wait: Option<Duration>,
) -> Step {
    match wait {
        None => match receiver.recv().await {
            Some(event) => Step::Event(event),
            None => Step::Closed,
        },
        Some(limit) => match tokio::time::timeout(limit, receiver.recv()).await {
            Ok(Some(event)) => Step::Event(event),
            Ok(None) => Step::Closed,
            Err(_) => Step::TimedOut,
        },
    }
}
