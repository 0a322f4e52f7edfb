//! Windowed deduplication and scoring across brokers.
//!
//! The dispatcher consumes the fan-in stream and decides which events
//! reach the emitter. Three modes, selected by the configured key and
//! score expressions:
//!
//! - **Passthrough** (no key): every event is emitted immediately.
//! - **Race** (key only): the first event per key opens a window and is
//!   emitted; later events with the same key inside the window are
//!   dropped.
//! - **Compete** (key and score): events are buffered per key while the
//!   window is open; on close the best-scored candidate is emitted.
//!
//! The dispatcher is a pure state machine driven by the supervisor:
//! [`Dispatcher::accept`] and [`Dispatcher::tick`] both return the longest
//! the supervisor may block before a window needs closing (`None` means
//! indefinitely).

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, error, info, warn};
use time::OffsetDateTime;

use crate::emit::Emit;
use crate::error::{Error, Result};
use crate::event::{Event, Payload};
use crate::expr::{Expr, Value};
use crate::timeutil;
use crate::transform::Transforms;

/// Window length applied when a key expression is configured without an
/// explicit window.
pub const DEFAULT_HORIZON: Duration = Duration::from_secs(5);

/// Dispatcher options as resolved from the command line.
#[derive(Debug, Default, Clone)]
pub struct DispatchConfig {
    /// Key expression source (`-k`).
    pub key: Option<String>,
    /// Score spec source (`-s`): an expression to maximize, or
    /// `min:<expr>` / `max:<expr>` to select the comparator direction.
    pub score: Option<String>,
    /// Window length (`-w`).
    pub window: Option<Duration>,
}

impl DispatchConfig {
    pub fn wants_dedup(&self) -> bool {
        self.key.is_some() || self.score.is_some() || self.window.is_some()
    }
}

/// How competing candidates are ranked.
#[derive(Debug)]
enum ScoreSpec {
    /// Largest scalar wins.
    Max(Expr),
    /// Smallest scalar wins.
    Min(Expr),
}

impl ScoreSpec {
    fn parse(spec: &str) -> Result<ScoreSpec> {
        let spec = spec.trim();
        if spec.starts_with("lambda") {
            return Err(Error::Config(
                "comparator lambdas are not supported; use min:<expr> or max:<expr>".into(),
            ));
        }
        if let Some(inner) = spec.strip_prefix("min:") {
            Ok(ScoreSpec::Min(Expr::parse(inner)?))
        } else if let Some(inner) = spec.strip_prefix("max:") {
            Ok(ScoreSpec::Max(Expr::parse(inner)?))
        } else {
            Ok(ScoreSpec::Max(Expr::parse(spec)?))
        }
    }

    fn expr(&self) -> &Expr {
        match self {
            ScoreSpec::Max(expr) | ScoreSpec::Min(expr) => expr,
        }
    }

    /// Does `challenger` beat the current `winner`?
    ///
    /// Strictly-better only: ties keep the earlier arrival, and an
    /// incomparable score loses. Which of several tied candidates wins is
    /// documented as unspecified.
    fn beats(&self, challenger: &Value, winner: &Value) -> bool {
        use std::cmp::Ordering;
        match (self, challenger.compare(winner)) {
            (ScoreSpec::Max(_), Some(Ordering::Greater)) => true,
            (ScoreSpec::Min(_), Some(Ordering::Less)) => true,
            _ => false,
        }
    }
}

enum Mode {
    Passthrough,
    Race { key: Expr },
    Compete { key: Expr, score: ScoreSpec },
}

struct Candidate {
    event: Event,
    score: Value,
}

struct Window {
    opened_at: OffsetDateTime,
    candidates: Vec<Candidate>,
}

/// The windowed dedup/score state machine.
pub struct Dispatcher {
    mode: Mode,
    horizon: Duration,
    windows: HashMap<Value, Window>,
    transforms: Transforms,
    emitter: Box<dyn Emit + Send>,
    emitted: u64,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        transforms: Transforms,
        emitter: Box<dyn Emit + Send>,
    ) -> Result<Self> {
        let key = config.key.as_deref().map(Expr::parse).transpose()?;
        let mode = match (key, config.score.as_deref()) {
            (None, None) => Mode::Passthrough,
            (None, Some(_)) => {
                return Err(Error::Config(
                    "a score expression requires a key expression".into(),
                ))
            }
            (Some(key), None) => Mode::Race { key },
            (Some(key), Some(score)) => Mode::Compete {
                key,
                score: ScoreSpec::parse(score)?,
            },
        };
        Ok(Self {
            mode,
            horizon: config.window.unwrap_or(DEFAULT_HORIZON),
            windows: HashMap::new(),
            transforms,
            emitter,
            emitted: 0,
        })
    }

    /// Number of events emitted so far; the supervisor watches this for
    /// the idle timeout.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Process one event, closing any expired windows first. Returns the
    /// supervisor's maximum wait until the next window close.
    pub fn accept(&mut self, now: OffsetDateTime, event: Event) -> Option<Duration> {
        self.close_expired(now);

        enum Action {
            Emit,
            Race(Value),
            Compete(Value, Value),
            Drop,
        }

        let action = match &self.mode {
            Mode::Passthrough => Action::Emit,
            Mode::Race { key } => match key.eval_lenient(&event.payload) {
                Ok(key) => Action::Race(key),
                Err(err) => {
                    // No usable key, pass the event straight through.
                    error!("could not evaluate key: {err}");
                    Action::Emit
                }
            },
            Mode::Compete { key, score } => match key.eval_lenient(&event.payload) {
                Err(err) => {
                    error!("could not evaluate key, dropping candidate: {err}");
                    Action::Drop
                }
                Ok(key) => match score.expr().eval(&event.payload) {
                    Err(err) => {
                        error!("could not score message, dropping candidate: {err}");
                        Action::Drop
                    }
                    Ok(score) => Action::Compete(key, score),
                },
            },
        };

        match action {
            Action::Emit => self.emit(event),
            Action::Drop => {}
            Action::Race(key) => {
                if self.windows.contains_key(&key) {
                    info!(
                        "ignoring redundant message from {} for key {key}",
                        event.reception_host
                    );
                } else {
                    debug!(
                        "emitting race winner from {} for key {key}",
                        event.reception_host
                    );
                    let opened_at = event.reception_time;
                    self.emit(event);
                    self.windows.insert(
                        key,
                        Window {
                            opened_at,
                            candidates: Vec::new(),
                        },
                    );
                }
            }
            Action::Compete(key, score) => {
                let window = self.windows.entry(key).or_insert_with(|| {
                    debug!("window opening");
                    Window {
                        opened_at: event.reception_time,
                        candidates: Vec::new(),
                    }
                });
                window.candidates.push(Candidate { event, score });
            }
        }
        self.next_deadline(now)
    }

    /// Close expired windows without consuming an event (queue-wait
    /// timeout). Returns the next maximum wait.
    pub fn tick(&mut self, now: OffsetDateTime) -> Option<Duration> {
        self.close_expired(now);
        self.next_deadline(now)
    }

    /// Close every open window immediately (shutdown): Compete windows
    /// emit their current winner, Race windows are discarded.
    pub fn flush(&mut self) {
        let windows = std::mem::take(&mut self.windows);
        for (key, window) in windows {
            self.close_window(&key, window);
        }
    }

    fn close_expired(&mut self, now: OffsetDateTime) {
        let expired: Vec<Value> = self
            .windows
            .iter()
            .filter(|(_, window)| now >= window.opened_at + self.horizon)
            .map(|(key, _)| key.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        debug!("closing windows for {} keys", expired.len());
        for key in expired {
            if let Some(window) = self.windows.remove(&key) {
                self.close_window(&key, window);
            }
        }
    }

    fn close_window(&mut self, key: &Value, window: Window) {
        let winner = {
            let Mode::Compete { score, .. } = &self.mode else {
                return;
            };
            let mut candidates = window.candidates.into_iter();
            let Some(first) = candidates.next() else {
                warn!("no candidates to compete for key {key}");
                return;
            };
            let total = 1 + candidates.len();
            let mut winner = first;
            for challenger in candidates {
                if score.beats(&challenger.score, &winner.score) {
                    winner = challenger;
                }
            }
            info!(
                "chose message from {} among {total} competitors for key {key}",
                winner.event.reception_host
            );
            winner
        };
        self.emit(winner.event);
    }

    /// How long the supervisor may block before the nearest window close.
    fn next_deadline(&self, now: OffsetDateTime) -> Option<Duration> {
        let earliest = self
            .windows
            .values()
            .map(|window| window.opened_at)
            .min()?;
        let remaining = (earliest + self.horizon) - now;
        Some(remaining.try_into().unwrap_or(Duration::ZERO))
    }

    /// Enrich, transform, and hand the event to the emitter.
    fn emit(&mut self, event: Event) {
        let Event {
            topic,
            reception_time,
            reception_host,
            payload,
        } = event;
        let mut payload = payload;
        payload
            .entry("__topic__")
            .or_insert_with(|| topic.clone().into());
        payload
            .entry("__reception_time__")
            .or_insert_with(|| timeutil::format_iso(reception_time).into());
        payload
            .entry("__reception_host__")
            .or_insert_with(|| reception_host.into());
        let payload = self.transforms.apply(payload);
        if let Err(err) = self.emitter.emit(&topic, &payload) {
            error!("emit failed for {topic}: {err}");
        }
        self.emitted += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use time::macros::datetime;

    #[derive(Clone, Default)]
    struct Collector(Arc<Mutex<Vec<(String, Payload)>>>);

    impl Collector {
        fn emitted(&self) -> Vec<(String, Payload)> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Emit for Collector {
        fn emit(&mut self, topic: &str, payload: &Payload) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.clone()));
            Ok(())
        }
    }

    fn dispatcher(config: DispatchConfig) -> (Dispatcher, Collector) {
        let collector = Collector::default();
        let dispatcher = Dispatcher::new(
            config,
            Transforms::default(),
            Box::new(collector.clone()),
        )
        .unwrap();
        (dispatcher, collector)
    }

    fn event(host: &str, at: OffsetDateTime, payload: serde_json::Value) -> Event {
        Event {
            topic: "sat.test".into(),
            reception_time: at,
            reception_host: host.into(),
            payload: payload.as_object().unwrap().clone(),
        }
    }

    #[test]
    fn test_passthrough_emits_everything() {
        let (mut dispatcher, collector) = dispatcher(DispatchConfig::default());
        let t0 = datetime!(2025-01-02 00:00:00 UTC);
        assert_eq!(
            dispatcher.accept(t0, event("a", t0, serde_json::json!({"x": 1}))),
            None
        );
        dispatcher.accept(t0, event("b", t0, serde_json::json!({"x": 2})));
        assert_eq!(collector.emitted().len(), 2);
    }

    #[test]
    fn test_race_first_wins_within_window() {
        let (mut dispatcher, collector) = dispatcher(DispatchConfig {
            key: Some("sat".into()),
            score: None,
            window: Some(Duration::from_secs(1)),
        });
        let t0 = datetime!(2025-01-02 00:00:00 UTC);

        dispatcher.accept(t0, event("a", t0, serde_json::json!({"sat": "G16", "t": 1})));
        // Same key 0.4s later from another broker: dropped.
        let t1 = t0 + Duration::from_millis(400);
        dispatcher.accept(t1, event("b", t1, serde_json::json!({"sat": "G16", "t": 2})));
        // 1.2s later the window has expired and the key races again.
        let t2 = t0 + Duration::from_millis(1200);
        dispatcher.accept(t2, event("a", t2, serde_json::json!({"sat": "G16", "t": 3})));

        let emitted = collector.emitted();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].1["t"], serde_json::json!(1));
        assert_eq!(emitted[1].1["t"], serde_json::json!(3));
    }

    #[test]
    fn test_compete_scalar_picks_largest() {
        let (mut dispatcher, collector) = dispatcher(DispatchConfig {
            key: Some("sat".into()),
            score: Some("defects".into()),
            window: Some(Duration::from_secs(1)),
        });
        let t0 = datetime!(2025-01-02 00:00:00 UTC);

        dispatcher.accept(t0, event("a", t0, serde_json::json!({"sat": "G16", "defects": 5})));
        let t1 = t0 + Duration::from_millis(300);
        dispatcher.accept(t1, event("b", t1, serde_json::json!({"sat": "G16", "defects": 7})));
        let t2 = t0 + Duration::from_millis(600);
        dispatcher.accept(t2, event("c", t2, serde_json::json!({"sat": "G16", "defects": 6})));
        assert!(collector.emitted().is_empty());

        dispatcher.tick(t0 + Duration::from_millis(1000));
        let emitted = collector.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].1["defects"], serde_json::json!(7));
    }

    #[test]
    fn test_compete_min_comparator_picks_smallest() {
        let (mut dispatcher, collector) = dispatcher(DispatchConfig {
            key: Some("sat".into()),
            score: Some("min:defects".into()),
            window: Some(Duration::from_secs(1)),
        });
        let t0 = datetime!(2025-01-02 00:00:00 UTC);

        for (offset, defects) in [(0u64, 5), (300, 7), (600, 6)] {
            let at = t0 + Duration::from_millis(offset);
            dispatcher.accept(at, event("a", at, serde_json::json!({"sat": "G16", "defects": defects})));
        }
        dispatcher.tick(t0 + Duration::from_secs(2));

        let emitted = collector.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].1["defects"], serde_json::json!(5));
    }

    #[test]
    fn test_compete_winner_is_a_candidate() {
        let (mut dispatcher, collector) = dispatcher(DispatchConfig {
            key: Some("sat".into()),
            score: Some("defects".into()),
            window: Some(Duration::from_secs(1)),
        });
        let t0 = datetime!(2025-01-02 00:00:00 UTC);
        let seen: Vec<i64> = vec![3, 9, 1];
        for (index, defects) in seen.iter().enumerate() {
            let at = t0 + Duration::from_millis(index as u64 * 100);
            dispatcher.accept(at, event("a", at, serde_json::json!({"sat": "G16", "defects": defects})));
        }
        dispatcher.tick(t0 + Duration::from_secs(1));
        let emitted = collector.emitted();
        assert_eq!(emitted.len(), 1);
        let winner = emitted[0].1["defects"].as_i64().unwrap();
        assert!(seen.contains(&winner));
    }

    #[test]
    fn test_enrichment_defaults_applied_before_emit() {
        let (mut dispatcher, collector) = dispatcher(DispatchConfig::default());
        let t0 = datetime!(2025-01-02 03:04:05 UTC);
        dispatcher.accept(t0, event("broker-a", t0, serde_json::json!({"x": 1})));

        let (_, payload) = &collector.emitted()[0];
        assert_eq!(payload["__topic__"], serde_json::json!("sat.test"));
        assert_eq!(payload["__reception_host__"], serde_json::json!("broker-a"));
        assert_eq!(
            payload["__reception_time__"],
            serde_json::json!("2025-01-02T03:04:05Z")
        );
    }

    #[test]
    fn test_enrichment_does_not_overwrite() {
        let (mut dispatcher, collector) = dispatcher(DispatchConfig::default());
        let t0 = datetime!(2025-01-02 00:00:00 UTC);
        dispatcher.accept(
            t0,
            event("broker-a", t0, serde_json::json!({"__reception_host__": "original"})),
        );
        let (_, payload) = &collector.emitted()[0];
        assert_eq!(payload["__reception_host__"], serde_json::json!("original"));
    }

    #[test]
    fn test_null_key_is_a_regular_key() {
        let (mut dispatcher, collector) = dispatcher(DispatchConfig {
            key: Some("absent_field".into()),
            score: None,
            window: Some(Duration::from_secs(5)),
        });
        let t0 = datetime!(2025-01-02 00:00:00 UTC);
        dispatcher.accept(t0, event("a", t0, serde_json::json!({"x": 1})));
        dispatcher.accept(t0, event("b", t0, serde_json::json!({"x": 2})));
        // Both events keyed null, so the second lost the race.
        assert_eq!(collector.emitted().len(), 1);
    }

    #[test]
    fn test_next_deadline_tracks_oldest_window() {
        let (mut dispatcher, _) = dispatcher(DispatchConfig {
            key: Some("sat".into()),
            score: None,
            window: Some(Duration::from_secs(2)),
        });
        let t0 = datetime!(2025-01-02 00:00:00 UTC);
        let wait = dispatcher
            .accept(t0, event("a", t0, serde_json::json!({"sat": "G16"})))
            .unwrap();
        assert_eq!(wait, Duration::from_secs(2));

        let t1 = t0 + Duration::from_millis(500);
        let wait = dispatcher
            .accept(t1, event("a", t1, serde_json::json!({"sat": "G18"})))
            .unwrap();
        assert_eq!(wait, Duration::from_millis(1500));
    }

    #[test]
    fn test_flush_emits_compete_winners() {
        let (mut dispatcher, collector) = dispatcher(DispatchConfig {
            key: Some("sat".into()),
            score: Some("defects".into()),
            window: Some(Duration::from_secs(60)),
        });
        let t0 = datetime!(2025-01-02 00:00:00 UTC);
        dispatcher.accept(t0, event("a", t0, serde_json::json!({"sat": "G16", "defects": 2})));
        dispatcher.accept(t0, event("b", t0, serde_json::json!({"sat": "G16", "defects": 8})));
        dispatcher.flush();
        let emitted = collector.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].1["defects"], serde_json::json!(8));
    }

    #[test]
    fn test_score_without_key_rejected() {
        let result = Dispatcher::new(
            DispatchConfig {
                key: None,
                score: Some("defects".into()),
                window: None,
            },
            Transforms::default(),
            Box::new(Collector::default()),
        );
        assert!(result.is_err());
    }
}
