use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// Decides whether a submitted answer matches a question's stored answer
pub trait AnswerChecker: Send + Sync {
    fn check(&self, expected: &Value, submitted: &Value) -> CoreResult<bool>;
}

fn shape(msg: impl Into<String>) -> CoreError {
    CoreError::InvalidAnswerShape(msg.into())
}

/// `mcq`: the submitted option index equals the correct one
pub struct ChoiceChecker;

impl AnswerChecker for ChoiceChecker {
    fn check(&self, expected: &Value, submitted: &Value) -> CoreResult<bool> {
        let submitted = submitted
            .as_i64()
            .ok_or_else(|| shape("mcq answer must be an option index"))?;
        let expected = expected
            .as_i64()
            .ok_or_else(|| shape("mcq question has no option index"))?;
        Ok(submitted == expected)
    }
}

fn index_set(value: &Value, what: &str) -> CoreResult<BTreeSet<i64>> {
    let items = value
        .as_array()
        .ok_or_else(|| shape(format!("{what} must be a list of option indexes")))?;
    items
        .iter()
        .map(|v| v.as_i64().ok_or_else(|| shape(format!("{what} contains a non-index value"))))
        .collect()
}

/// `multi`: set equality of option indexes, order and duplicates ignored
pub struct MultiChoiceChecker;

impl AnswerChecker for MultiChoiceChecker {
    fn check(&self, expected: &Value, submitted: &Value) -> CoreResult<bool> {
        let submitted = index_set(submitted, "multi answer")?;
        let expected = index_set(expected, "multi question")?;
        Ok(submitted == expected)
    }
}

/// Case-folded, whitespace-collapsed form used by [`ShortTextChecker`]
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `short`: normalized text equality; the stored answer may list alternatives
pub struct ShortTextChecker;

impl AnswerChecker for ShortTextChecker {
    fn check(&self, expected: &Value, submitted: &Value) -> CoreResult<bool> {
        let submitted = submitted
            .as_str()
            .map(normalize_text)
            .ok_or_else(|| shape("short answer must be text"))?;

        match expected {
            Value::String(s) => Ok(normalize_text(s) == submitted),
            Value::Array(options) => Ok(options
                .iter()
                .filter_map(Value::as_str)
                .any(|s| normalize_text(s) == submitted)),
            _ => Err(shape("short question has no text answer")),
        }
    }
}

/// `sort` and `dragdrop`: element-wise sequence equality
pub struct SequenceChecker;

impl AnswerChecker for SequenceChecker {
    fn check(&self, expected: &Value, submitted: &Value) -> CoreResult<bool> {
        let submitted = submitted
            .as_array()
            .ok_or_else(|| shape("sequence answer must be a list"))?;
        let expected = expected
            .as_array()
            .ok_or_else(|| shape("sequence question has no ordered answer"))?;
        Ok(submitted == expected)
    }
}

/// Checkers keyed by question type. Hosts may register additional types at runtime.
pub struct AnswerCheckers {
    checkers: RwLock<HashMap<String, Arc<dyn AnswerChecker>>>,
}

impl Default for AnswerCheckers {
    fn default() -> Self {
        Self::new()
    }
}

impl AnswerCheckers {
    pub fn new() -> Self {
        let sequence: Arc<dyn AnswerChecker> = Arc::new(SequenceChecker);
        let mut checkers: HashMap<String, Arc<dyn AnswerChecker>> = HashMap::new();
        checkers.insert("mcq".to_string(), Arc::new(ChoiceChecker));
        checkers.insert("multi".to_string(), Arc::new(MultiChoiceChecker));
        checkers.insert("short".to_string(), Arc::new(ShortTextChecker));
        checkers.insert("sort".to_string(), Arc::clone(&sequence));
        checkers.insert("dragdrop".to_string(), sequence);
        Self {
            checkers: RwLock::new(checkers),
        }
    }

    pub fn register(&self, question_type: impl Into<String>, checker: Arc<dyn AnswerChecker>) {
        self.checkers.write().insert(question_type.into(), checker);
    }

    pub fn check(&self, question_type: &str, expected: &Value, submitted: &Value) -> CoreResult<bool> {
        let checker = self
            .checkers
            .read()
            .get(question_type)
            .cloned()
            .ok_or_else(|| shape(format!("no checker for question type {question_type}")))?;
        checker.check(expected, submitted)
    }

    pub fn supports(&self, question_type: &str) -> bool {
        self.checkers.read().contains_key(question_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mcq() {
        let checkers = AnswerCheckers::new();
        assert!(checkers.check("mcq", &json!(2), &json!(2)).unwrap());
        assert!(!checkers.check("mcq", &json!(2), &json!(1)).unwrap());
        assert!(matches!(
            checkers.check("mcq", &json!(2), &json!("2")),
            Err(CoreError::InvalidAnswerShape(_))
        ));
    }

    #[test]
    fn test_multi_is_set_equality() {
        let checkers = AnswerCheckers::new();
        assert!(checkers.check("multi", &json!([1, 3]), &json!([3, 1])).unwrap());
        assert!(checkers.check("multi", &json!([1, 3]), &json!([3, 1, 3])).unwrap());
        assert!(!checkers.check("multi", &json!([1, 3]), &json!([1])).unwrap());
        assert!(checkers.check("multi", &json!([1]), &json!(1)).is_err());
    }

    #[test]
    fn test_short_text_normalization() {
        let checkers = AnswerCheckers::new();
        assert!(checkers
            .check("short", &json!("New  York"), &json!("  new york "))
            .unwrap());
        assert!(checkers
            .check("short", &json!(["NYC", "New York"]), &json!("nyc"))
            .unwrap());
        assert!(!checkers.check("short", &json!("Paris"), &json!("London")).unwrap());
        assert!(checkers.check("short", &json!("Paris"), &json!(5)).is_err());
    }

    #[test]
    fn test_sequence_order_matters() {
        let checkers = AnswerCheckers::new();
        assert!(checkers.check("sort", &json!(["a", "b"]), &json!(["a", "b"])).unwrap());
        assert!(!checkers.check("dragdrop", &json!(["a", "b"]), &json!(["b", "a"])).unwrap());
    }

    #[test]
    fn test_unknown_type_and_registration() {
        struct AlwaysRight;
        impl AnswerChecker for AlwaysRight {
            fn check(&self, _: &Value, _: &Value) -> CoreResult<bool> {
                Ok(true)
            }
        }

        let checkers = AnswerCheckers::new();
        assert!(checkers.check("essay", &json!(null), &json!("x")).is_err());
        checkers.register("essay", Arc::new(AlwaysRight));
        assert!(checkers.supports("essay"));
        assert!(checkers.check("essay", &json!(null), &json!("x")).unwrap());
    }
}
