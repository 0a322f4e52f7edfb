//! The in-memory record handed from broker workers to the dispatcher.

use time::OffsetDateTime;

/// JSON object payload as decoded from a broker message body.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// One notification as received from a broker.
///
/// `reception_time` and `reception_host` are stamped exactly once, by the
/// worker that received the delivery, before the event enters the fan-in
/// queue.
#[derive(Debug, Clone)]
pub struct Event {
    /// Routing key as delivered by the broker.
    pub topic: String,
    /// When the worker received the delivery (UTC).
    pub reception_time: OffsetDateTime,
    /// The broker host that delivered it.
    pub reception_host: String,
    /// Decoded message body.
    pub payload: Payload,
}
