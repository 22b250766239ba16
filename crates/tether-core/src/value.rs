//! Fact payloads.
//!
//! A [`FactValue`] is an immutable JSON value behind an `Arc`. Two values are
//! the *same* fact only when they share the allocation; structurally equal
//! payloads published separately still count as a change.

use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Shared, immutable fact payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactValue(Arc<Value>);

impl FactValue {
    /// Wrap a JSON value in a fresh allocation.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(Arc::new(value))
    }

    /// Identity comparison: true only for clones of the same publication.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Whether this payload counts as present.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        is_truthy(&self.0)
    }

    /// Borrow the JSON payload.
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl Deref for FactValue {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.0
    }
}

impl From<Value> for FactValue {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// Absence test for fact payloads.
///
/// `null`, `false`, numeric zero and the empty string mean "no fact".
/// Every array and object is present, even when empty.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn falsy_values() {
        for v in [json!(null), json!(false), json!(0), json!(0.0), json!("")] {
            assert!(!is_truthy(&v), "{v} should be falsy");
        }
    }

    #[test]
    fn truthy_values() {
        for v in [json!(true), json!(1), json!(-2.5), json!("x"), json!([]), json!({})] {
            assert!(is_truthy(&v), "{v} should be truthy");
        }
    }

    #[test]
    fn identity_not_structure() {
        let a = FactValue::new(json!({"project": "a"}));
        let b = FactValue::new(json!({"project": "a"}));
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
        assert_eq!(*a, *b);
    }

    #[test]
    fn serializes_transparently() {
        let v = FactValue::new(json!({"lockReq": "t"}));
        assert_eq!(serde_json::to_value(&v).unwrap(), json!({"lockReq": "t"}));
    }
}
