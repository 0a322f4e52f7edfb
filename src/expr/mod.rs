//! A small deterministic expression language over payload bindings.
//!
//! Key, score, and transform options all compile to the same narrow AST:
//! field access, literals, tuples, arithmetic, comparison, boolean logic,
//! and calls into a fixed helper namespace (regex and datetime helpers).
//! There is deliberately no general scripting surface; an expression can
//! only read the payload it is handed.
//!
//! ```
//! use sat_latency::expr::{Expr, Value};
//!
//! let expr = Expr::parse("(sat, band)").unwrap();
//! let mut payload = serde_json::Map::new();
//! payload.insert("sat".into(), serde_json::json!("G16"));
//! payload.insert("band".into(), serde_json::json!(7));
//! let key = expr.eval_lenient(&payload).unwrap();
//! assert_eq!(key, Value::List(vec![Value::Str("G16".into()), Value::Int(7)]));
//! ```

mod eval;
mod parse;
mod token;
mod value;

pub use eval::Bindings;
pub use parse::{BinaryOp, Expr, UnaryOp};
pub use value::Value;

/// Errors from compiling or evaluating an expression.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("parse error at byte {pos}: {msg}")]
    Parse { pos: usize, msg: String },
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("wrong number of arguments for {0}")]
    Arity(&'static str),
    #[error("unbound name: {0}")]
    Unbound(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("bad regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("division by zero")]
    DivideByZero,
}
