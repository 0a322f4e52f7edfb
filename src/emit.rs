//! Output formatting for emitted events.
//!
//! Four modes, selected at startup from the `-j` option: a `{name}`
//! template, the `?` pretty dump, the `*` NUL-terminated JSON pair, and
//! the default `topic: '<json>'` line. Output is flushed after every
//! event so downstream pipes see per-event progress.

use std::io::Write;

use crate::error::Result;
use crate::event::Payload;

/// Literal substituted for template keys the payload does not carry.
pub const MISSING: &str = "?UNKNOWN?";

/// Event sink driven by the dispatcher once per emitted event.
pub trait Emit {
    fn emit(&mut self, topic: &str, payload: &Payload) -> Result<()>;
}

/// Output mode, as resolved from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitMode {
    /// `{name}` placeholders over payload keys; missing keys render as
    /// [`MISSING`]. Emission cannot fail on an absent field.
    Template(String),
    /// `?`: banner-delimited `key: value` listing, keys sorted.
    Pretty,
    /// `*`: `[topic, payload]` JSON followed by a NUL byte (`xargs -0`).
    NullJson,
    /// `topic: '<json-of-payload>'` line.
    Default,
}

impl EmitMode {
    pub fn from_format(format: Option<&str>) -> EmitMode {
        match format {
            None => EmitMode::Default,
            Some("?") => EmitMode::Pretty,
            Some("*") => EmitMode::NullJson,
            Some(template) => EmitMode::Template(template.to_string()),
        }
    }
}

/// Writes formatted events to a stream.
pub struct Formatter<W: Write> {
    mode: EmitMode,
    out: W,
}

impl Formatter<std::io::Stdout> {
    pub fn stdout(mode: EmitMode) -> Self {
        Formatter {
            mode,
            out: std::io::stdout(),
        }
    }
}

impl<W: Write> Formatter<W> {
    pub fn new(mode: EmitMode, out: W) -> Self {
        Formatter { mode, out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Emit for Formatter<W> {
    fn emit(&mut self, topic: &str, payload: &Payload) -> Result<()> {
        match &self.mode {
            EmitMode::Template(template) => {
                let line = render_template(template, payload);
                writeln!(self.out, "{line}")?;
            }
            EmitMode::Pretty => {
                writeln!(self.out, "{}", "v".repeat(25))?;
                let mut keys: Vec<_> = payload.keys().collect();
                keys.sort();
                for key in keys {
                    writeln!(self.out, "{key:>24}: {}", render_value(&payload[key]))?;
                }
                writeln!(self.out, "{}", "^".repeat(25))?;
            }
            EmitMode::NullJson => {
                let pair = serde_json::to_string(&(topic, payload))?;
                self.out.write_all(pair.as_bytes())?;
                self.out.write_all(b"\0")?;
            }
            EmitMode::Default => {
                let body = serde_json::to_string(payload)?;
                writeln!(self.out, "{topic}: '{body}'")?;
            }
        }
        self.out.flush()?;
        Ok(())
    }
}

/// Discards every event; the `null` named callback.
pub struct NullEmitter;

impl Emit for NullEmitter {
    fn emit(&mut self, _topic: &str, _payload: &Payload) -> Result<()> {
        Ok(())
    }
}

/// Resolve a `-c` named callback. Unknown names are a startup error for
/// the caller to report.
pub fn named_callback(name: &str) -> Option<Box<dyn Emit + Send>> {
    match name {
        "pretty" => Some(Box::new(Formatter::stdout(EmitMode::Pretty))),
        "null" => Some(Box::new(NullEmitter)),
        _ => None,
    }
}

/// Substitute `{name}` placeholders; `{{`/`}}` escape literal braces.
/// Absent or null fields render as [`MISSING`] via the lookup (the
/// payload itself is never mutated).
fn render_template(template: &str, payload: &Payload) -> String {
    let mut line = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                line.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                line.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                if closed {
                    match payload.get(&name) {
                        Some(serde_json::Value::Null) | None => line.push_str(MISSING),
                        Some(value) => line.push_str(&render_value(value)),
                    }
                } else {
                    // Unterminated placeholder, keep it literal.
                    line.push('{');
                    line.push_str(&name);
                }
            }
            other => line.push(other),
        }
    }
    line
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
