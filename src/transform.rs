//! Ordered payload rewrite rules (`field = <expr>`).

use log::{debug, error};

use crate::error::{Error, Result};
use crate::event::Payload;
use crate::expr::Expr;

/// A compiled, ordered list of `field = <expr>` rules.
///
/// Every expression is evaluated against a snapshot of the incoming
/// payload, so rules read original values while their results accumulate
/// in the output. A rule that fails to evaluate is logged and skipped;
/// the payload keeps moving.
#[derive(Debug, Default)]
pub struct Transforms {
    rules: Vec<(String, Expr)>,
}

impl Transforms {
    /// Compile rules of the form `"field=expr"`.
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> Result<Self> {
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            let spec = spec.as_ref();
            let Some((field, source)) = spec.split_once('=') else {
                return Err(Error::Config(format!(
                    "transform {spec:?} is not of the form field=expr"
                )));
            };
            let expr = Expr::parse(source.trim())?;
            rules.push((field.trim().to_string(), expr));
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply every rule, returning the rewritten payload.
    pub fn apply(&self, payload: Payload) -> Payload {
        if self.rules.is_empty() {
            return payload;
        }
        let snapshot = payload.clone();
        let mut output = payload;
        for (field, expr) in &self.rules {
            match expr.eval(&snapshot) {
                Ok(value) => {
                    debug!("transform {field} => {value}");
                    output.insert(field.clone(), value.into_json());
                }
                Err(err) => {
                    error!("skipping transform for {field}: {err}");
                }
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: serde_json::Value) -> Payload {
        json.as_object().unwrap().clone()
    }

    #[test]
    fn test_rules_read_the_snapshot() {
        // The second rule sees the original `a`, not the rewritten one.
        let transforms = Transforms::parse(&["a=a+1", "b=a*10"]).unwrap();
        let result = transforms.apply(payload(serde_json::json!({"a": 1})));
        assert_eq!(result["a"], serde_json::json!(2));
        assert_eq!(result["b"], serde_json::json!(10));
    }

    #[test]
    fn test_failed_rule_is_skipped() {
        let transforms = Transforms::parse(&["a=missing+1", "b=2"]).unwrap();
        let result = transforms.apply(payload(serde_json::json!({"a": 1})));
        assert_eq!(result["a"], serde_json::json!(1));
        assert_eq!(result["b"], serde_json::json!(2));
    }

    #[test]
    fn test_path_rewrite() {
        let transforms = Transforms::parse(&["path=replace(path, '/here', '/there')"]).unwrap();
        let result = transforms.apply(payload(serde_json::json!({"path": "/here/x"})));
        assert_eq!(result["path"], serde_json::json!("/there/x"));
    }

    #[test]
    fn test_bad_spec_rejected() {
        assert!(Transforms::parse(&["no equals sign"]).is_err());
    }
}
