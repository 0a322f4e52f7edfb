//! Multi-target publisher with per-target reconnect state machines.

mod client;
mod target;

pub use client::Client;
pub use target::{ConnectionStatus, DeliveryStatus, ReconnectConfig, TargetSpec};
