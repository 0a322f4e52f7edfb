//! Broker-facing pieces: one-connection sessions and the per-broker
//! consume workers that feed the fan-in queue.

pub mod session;
pub mod worker;

pub use session::{AmqpSession, SessionConfig};
pub use worker::{worker_run, ReconnectPolicy};
