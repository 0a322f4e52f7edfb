//! Expression evaluation over payload bindings.

use std::cmp::Ordering;

use super::{BinaryOp, Expr, ExprError, UnaryOp, Value};
use crate::timeutil;

/// Name lookup for free variables in an expression.
pub trait Bindings {
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl Bindings for serde_json::Map<String, serde_json::Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).and_then(Value::from_json)
    }
}

impl Expr {
    /// Evaluate; a missing payload field is an error. Used for scores and
    /// transforms, where the caller's policy is to log and skip.
    pub fn eval(&self, bindings: &dyn Bindings) -> Result<Value, ExprError> {
        self.eval_inner(bindings, false)
    }

    /// Evaluate; a missing payload field reads as null. Used for key
    /// expressions so partially-populated payloads still key a window.
    pub fn eval_lenient(&self, bindings: &dyn Bindings) -> Result<Value, ExprError> {
        self.eval_inner(bindings, true)
    }

    fn eval_inner(&self, bindings: &dyn Bindings, lenient: bool) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Field(name) => match bindings.lookup(name) {
                Some(value) => Ok(value),
                None if lenient => Ok(Value::Null),
                None => Err(ExprError::Unbound(name.clone())),
            },
            Expr::Tuple(items) => items
                .iter()
                .map(|item| item.eval_inner(bindings, lenient))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Expr::Unary(op, inner) => {
                let value = inner.eval_inner(bindings, lenient)?;
                apply_unary(*op, value)
            }
            Expr::Binary(BinaryOp::And, left, right) => {
                if !left.eval_inner(bindings, lenient)?.truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(right.eval_inner(bindings, lenient)?.truthy()))
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                if left.eval_inner(bindings, lenient)?.truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(right.eval_inner(bindings, lenient)?.truthy()))
            }
            Expr::Binary(op, left, right) => {
                let left = left.eval_inner(bindings, lenient)?;
                let right = right.eval_inner(bindings, lenient)?;
                apply_binary(*op, left, right)
            }
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|arg| arg.eval_inner(bindings, lenient))
                    .collect::<Result<Vec<_>, _>>()?;
                call(name, args)
            }
        }
    }
}

fn apply_unary(op: UnaryOp, value: Value) -> Result<Value, ExprError> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
        UnaryOp::Neg => match value {
            Value::Int(int) => Ok(Value::Int(-int)),
            Value::Float(float) => Ok(Value::Float(-float)),
            other => Err(ExprError::Type(format!("cannot negate {other}"))),
        },
    }
}

fn apply_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Add => match (&left, &right) {
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            _ => numeric_op(left, right, "+", |a, b| Ok(a + b)),
        },
        BinaryOp::Sub => match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a - b)),
            _ => numeric_op(left, right, "-", |a, b| Ok(a - b)),
        },
        BinaryOp::Mul => match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a * b)),
            _ => numeric_op(left, right, "*", |a, b| Ok(a * b)),
        },
        BinaryOp::Div => numeric_op(left, right, "/", |a, b| {
            if b == 0.0 {
                Err(ExprError::DivideByZero)
            } else {
                Ok(a / b)
            }
        }),
        BinaryOp::Rem => match (&left, &right) {
            (Value::Int(_), Value::Int(0)) => Err(ExprError::DivideByZero),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a % b)),
            _ => numeric_op(left, right, "%", |a, b| {
                if b == 0.0 {
                    Err(ExprError::DivideByZero)
                } else {
                    Ok(a % b)
                }
            }),
        },
        BinaryOp::Eq => Ok(Value::Bool(left.compare(&right) == Some(Ordering::Equal))),
        BinaryOp::Ne => Ok(Value::Bool(left.compare(&right) != Some(Ordering::Equal))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let Some(ordering) = left.compare(&right) else {
                return Err(ExprError::Type(format!("cannot compare {left} and {right}")));
            };
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuited by the caller"),
    }
}

fn numeric_op(
    left: Value,
    right: Value,
    op: &str,
    apply: impl Fn(f64, f64) -> Result<f64, ExprError>,
) -> Result<Value, ExprError> {
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(ExprError::Type(format!(
            "operator {op} needs numbers, got {left} and {right}"
        )));
    };
    apply(a, b).map(Value::Float)
}

/// The fixed helper namespace available to every expression.
fn call(name: &str, args: Vec<Value>) -> Result<Value, ExprError> {
    match name {
        "re_match" => {
            let [pattern, text] = two("re_match", args)?;
            let regex = regex::Regex::new(str_arg("re_match", &pattern)?)?;
            Ok(Value::Bool(regex.is_match(str_arg("re_match", &text)?)))
        }
        "re_find" => {
            let [pattern, text] = two("re_find", args)?;
            let regex = regex::Regex::new(str_arg("re_find", &pattern)?)?;
            Ok(regex
                .find(str_arg("re_find", &text)?)
                .map(|found| Value::Str(found.as_str().to_string()))
                .unwrap_or(Value::Null))
        }
        "re_sub" => {
            let [pattern, repl, text] = three("re_sub", args)?;
            let regex = regex::Regex::new(str_arg("re_sub", &pattern)?)?;
            let replaced = regex.replace_all(
                str_arg("re_sub", &text)?,
                str_arg("re_sub", &repl)?,
            );
            Ok(Value::Str(replaced.into_owned()))
        }
        "replace" => {
            let [text, from, to] = three("replace", args)?;
            Ok(Value::Str(str_arg("replace", &text)?.replace(
                str_arg("replace", &from)?,
                str_arg("replace", &to)?,
            )))
        }
        "upper" => {
            let [text] = one("upper", args)?;
            Ok(Value::Str(str_arg("upper", &text)?.to_uppercase()))
        }
        "lower" => {
            let [text] = one("lower", args)?;
            Ok(Value::Str(str_arg("lower", &text)?.to_lowercase()))
        }
        "trim" => {
            let [text] = one("trim", args)?;
            Ok(Value::Str(str_arg("trim", &text)?.trim().to_string()))
        }
        "concat" => {
            let mut joined = String::new();
            for arg in &args {
                joined.push_str(&arg.to_string());
            }
            Ok(Value::Str(joined))
        }
        "len" => {
            let [value] = one("len", args)?;
            match value {
                Value::Str(text) => Ok(Value::Int(text.chars().count() as i64)),
                Value::List(items) => Ok(Value::Int(items.len() as i64)),
                other => Err(ExprError::Type(format!("len() of {other}"))),
            }
        }
        "str" => {
            let [value] = one("str", args)?;
            Ok(Value::Str(value.to_string()))
        }
        "int" => {
            let [value] = one("int", args)?;
            match value {
                Value::Int(int) => Ok(Value::Int(int)),
                Value::Float(float) => Ok(Value::Int(float as i64)),
                Value::Bool(flag) => Ok(Value::Int(flag as i64)),
                Value::Str(text) => text
                    .trim()
                    .parse()
                    .map(Value::Int)
                    .map_err(|_| ExprError::Type(format!("int() of {text:?}"))),
                other => Err(ExprError::Type(format!("int() of {other}"))),
            }
        }
        "float" => {
            let [value] = one("float", args)?;
            match value {
                Value::Int(int) => Ok(Value::Float(int as f64)),
                Value::Float(float) => Ok(Value::Float(float)),
                Value::Str(text) => text
                    .trim()
                    .parse()
                    .map(Value::Float)
                    .map_err(|_| ExprError::Type(format!("float() of {text:?}"))),
                other => Err(ExprError::Type(format!("float() of {other}"))),
            }
        }
        "utcnow" => {
            if !args.is_empty() {
                return Err(ExprError::Arity("utcnow"));
            }
            Ok(Value::Str(timeutil::format_iso(
                time::OffsetDateTime::now_utc(),
            )))
        }
        "parse_time" => {
            let [text] = one("parse_time", args)?;
            let raw = str_arg("parse_time", &text)?;
            let instant = timeutil::parse_utc(raw)
                .ok_or_else(|| ExprError::Type(format!("parse_time() of {raw:?}")))?;
            Ok(Value::Float(timeutil::to_micros(instant) as f64 / 1e6))
        }
        "iso_time" => {
            let [value] = one("iso_time", args)?;
            let seconds = value
                .as_f64()
                .ok_or_else(|| ExprError::Type(format!("iso_time() of {value}")))?;
            Ok(Value::Str(timeutil::format_iso(timeutil::from_micros(
                (seconds * 1e6) as i64,
            ))))
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

fn one(name: &'static str, args: Vec<Value>) -> Result<[Value; 1], ExprError> {
    args.try_into().map_err(|_| ExprError::Arity(name))
}

fn two(name: &'static str, args: Vec<Value>) -> Result<[Value; 2], ExprError> {
    args.try_into().map_err(|_| ExprError::Arity(name))
}

fn three(name: &'static str, args: Vec<Value>) -> Result<[Value; 3], ExprError> {
    args.try_into().map_err(|_| ExprError::Arity(name))
}

fn str_arg<'a>(name: &'static str, value: &'a Value) -> Result<&'a str, ExprError> {
    value
        .as_str()
        .ok_or_else(|| ExprError::Type(format!("{name}() expects a string, got {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        json.as_object().unwrap().clone()
    }

    #[test]
    fn test_field_and_arithmetic() {
        let bindings = payload(serde_json::json!({"defects": 5, "scale": 2.0}));
        let expr = Expr::parse("defects * scale + 1").unwrap();
        assert_eq!(expr.eval(&bindings).unwrap(), Value::Float(11.0));
    }

    #[test]
    fn test_missing_field_strict_vs_lenient() {
        let bindings = payload(serde_json::json!({"sat": "G16"}));
        let expr = Expr::parse("(sat, scene)").unwrap();
        assert!(expr.eval(&bindings).is_err());
        assert_eq!(
            expr.eval_lenient(&bindings).unwrap(),
            Value::List(vec![Value::Str("G16".into()), Value::Null])
        );
    }

    #[test]
    fn test_comparison_and_logic() {
        let bindings = payload(serde_json::json!({"defects": 5, "band": "07"}));
        let expr = Expr::parse("defects >= 3 and band == '07'").unwrap();
        assert_eq!(expr.eval(&bindings).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_regex_helpers() {
        let bindings = payload(serde_json::json!({"path": "/here/file.nc"}));
        let expr = Expr::parse("re_sub('^/here', '/there', path)").unwrap();
        assert_eq!(
            expr.eval(&bindings).unwrap(),
            Value::Str("/there/file.nc".into())
        );
        let expr = Expr::parse("re_match('\\\\.nc$', path)").unwrap();
        assert_eq!(expr.eval(&bindings).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_replace_transform_shape() {
        let bindings = payload(serde_json::json!({"path": "/a/b"}));
        let expr = Expr::parse("replace(path, '/a', '/z')").unwrap();
        assert_eq!(expr.eval(&bindings).unwrap(), Value::Str("/z/b".into()));
    }

    #[test]
    fn test_time_helpers() {
        let bindings = payload(serde_json::json!({
            "start_time": "2025-01-02T03:04:00",
            "end_time": "2025-01-02T03:04:05",
        }));
        let expr = Expr::parse("parse_time(end_time) - parse_time(start_time)").unwrap();
        assert_eq!(expr.eval(&bindings).unwrap(), Value::Float(5.0));
    }

    #[test]
    fn test_division_by_zero() {
        let bindings = payload(serde_json::json!({}));
        let expr = Expr::parse("1 / 0").unwrap();
        assert!(matches!(
            expr.eval(&bindings),
            Err(ExprError::DivideByZero)
        ));
    }

    #[test]
    fn test_unknown_function() {
        let expr = Expr::parse("nope(1)").unwrap();
        assert!(matches!(
            expr.eval(&payload(serde_json::json!({}))),
            Err(ExprError::UnknownFunction(_))
        ));
    }
}
