//! The multi-target publisher client.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;
use log::{debug, warn};
use tokio::sync::watch;

use super::target::{
    lock_shared, maintain, try_connect, ConnectionStatus, DeliveryStatus, ReconnectConfig,
    TargetHandle, TargetShared, TargetSpec,
};
use crate::event::Payload;

/// Aggregates publish targets and fans each publish call out to all of
/// them. Each target's connection is owned by its own reconnect task;
/// this client only observes status snapshots and borrows the live
/// channel for the duration of one publish.
pub struct Client {
    targets: Vec<TargetHandle>,
    config: ReconnectConfig,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Client {
    pub fn new(config: ReconnectConfig) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            targets: Vec::new(),
            config,
            shutdown,
            shutdown_rx,
        }
    }

    /// Register a target and begin keeping it connected.
    ///
    /// One connection attempt happens inline so an immediately
    /// reachable broker reports `Connected` as soon as this returns;
    /// afterwards the target's reconnect task owns the connection.
    pub async fn connect(&mut self, spec: TargetSpec) {
        let shared = Arc::new(Mutex::new(TargetShared {
            status: ConnectionStatus::Reconnecting,
            channel: None,
        }));

        let mut live = None;
        let mut down_since = None;
        match try_connect(&spec.uris[0]).await {
            Ok((connection, channel)) => {
                lock_shared(&shared).set(ConnectionStatus::Connected, Some(channel));
                live = Some(connection);
            }
            Err(err) => {
                debug!("initial connect to {} failed: {err}", spec.name);
                down_since = Some(Instant::now());
            }
        }

        let task = tokio::spawn(maintain(
            spec.name.clone(),
            live,
            spec.uris,
            Arc::clone(&shared),
            self.config.clone(),
            down_since,
            self.shutdown_rx.clone(),
        ));
        self.targets.push(TargetHandle {
            name: spec.name,
            shared,
            task,
        });
    }

    /// Snapshot of every target's connection status.
    pub fn statuses(&self) -> BTreeMap<String, ConnectionStatus> {
        self.targets
            .iter()
            .map(|target| (target.name.clone(), lock_shared(&target.shared).status))
            .collect()
    }

    /// Publish one payload to every target, returning per-target
    /// delivery status.
    pub async fn publish(
        &self,
        payload: &Payload,
        route_key: &str,
        exchange: &str,
    ) -> BTreeMap<String, DeliveryStatus> {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(err) => {
                warn!("unserializable payload: {err}");
                return self
                    .targets
                    .iter()
                    .map(|target| (target.name.clone(), DeliveryStatus::Dropped))
                    .collect();
            }
        };

        let mut statuses = BTreeMap::new();
        for target in &self.targets {
            let channel = {
                let guard = lock_shared(&target.shared);
                match guard.status {
                    ConnectionStatus::Connected => guard.channel.clone(),
                    _ => None,
                }
            };
            let Some(channel) = channel else {
                statuses.insert(target.name.clone(), DeliveryStatus::Dropped);
                continue;
            };

            let delivery = channel
                .basic_publish(
                    exchange,
                    route_key,
                    BasicPublishOptions::default(),
                    &body,
                    BasicProperties::default().with_content_type("application/json".into()),
                )
                .await;
            let status = match delivery {
                Ok(confirm) => match confirm.await {
                    Ok(confirmation) if confirmation.is_ack() => DeliveryStatus::Accepted,
                    Ok(_) => DeliveryStatus::Rejected,
                    Err(err) => {
                        warn!("publish confirm on {} failed: {err}", target.name);
                        lock_shared(&target.shared).set(ConnectionStatus::Reconnecting, None);
                        DeliveryStatus::Dropped
                    }
                },
                Err(err) => {
                    warn!("publish on {} failed: {err}", target.name);
                    lock_shared(&target.shared).set(ConnectionStatus::Reconnecting, None);
                    DeliveryStatus::Dropped
                }
            };
            statuses.insert(target.name.clone(), status);
        }
        statuses
    }

    /// Tear down every target.
    pub async fn disconnect(&mut self) {
        let _ = self.shutdown.send(true);
        for target in self.targets.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), target.task)
                .await
                .is_err()
            {
                warn!("reconnect task for {} did not stop in time", target.name);
            }
            lock_shared(&target.shared).set(ConnectionStatus::Disconnected, None);
        }
    }
}
