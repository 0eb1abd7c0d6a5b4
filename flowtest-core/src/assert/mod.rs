//! Verification classes.
//!
//! One struct per engine entity (process instance, user task, decision
//! instance), each wrapping a selector plus the shared test-run assertion
//! settings. Every assertion method is exactly one [`wait_until`] call
//! whose predicate performs one read against the engine's query interface
//! and compares the result, so engine-side eventual consistency is waited
//! out rather than raced.
//!
//! Selector tie-break: when a non-key selector matches several records,
//! the most recently created/evaluated one wins. A test that produced
//! several instances of the same definition is asserting on the newest.

mod decision;
mod process_instance;
mod user_task;

pub use decision::{DecisionAssert, DecisionSelector};
pub use process_instance::{ProcessInstanceAssert, ProcessInstanceSelector};
pub use user_task::{UserTaskAssert, UserTaskSelector};

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::poll::{PollSettings, WaitTimeout};

/// Page bound when a custom predicate scans candidates client-side.
pub(crate) const PREDICATE_SCAN_LIMIT: u32 = 100;

/// Test-run-scoped assertion defaults, threaded through the test context
/// into every verification instance. No process-wide mutable state.
#[derive(Clone, Copy, Debug)]
pub struct AssertionSettings {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for AssertionSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            interval: Duration::from_millis(100),
        }
    }
}

impl AssertionSettings {
    pub(crate) fn poll(&self) -> PollSettings {
        PollSettings::new(self.timeout, self.interval)
    }
}

/// A verification that never held within its bound. Carries the selector,
/// the awaited condition, and the last state actually observed.
#[derive(Debug, Error)]
#[error(
    "{selector}: {timeout}{}",
    .observed
        .as_deref()
        .map(|o| format!("; last observed: {o}"))
        .unwrap_or_default()
)]
pub struct AssertionError {
    pub selector: String,
    pub timeout: WaitTimeout,
    pub observed: Option<String>,
}

/// Partial-match comparison: every named key must be present and equal on
/// the actual payload; extra actual keys are ignored.
pub(crate) fn contains_subset(
    actual: &serde_json::Map<String, Value>,
    expected: &serde_json::Map<String, Value>,
) -> bool {
    expected
        .iter()
        .all(|(key, value)| actual.get(key) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> serde_json::Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn subset_ignores_extra_actual_keys() {
        let actual = object(json!({"a": 1, "b": 2}));
        let expected = object(json!({"a": 1}));
        assert!(contains_subset(&actual, &expected));
    }

    #[test]
    fn subset_requires_equal_values() {
        let actual = object(json!({"a": 2, "b": 2}));
        let expected = object(json!({"a": 1}));
        assert!(!contains_subset(&actual, &expected));
    }

    #[test]
    fn subset_requires_named_keys_to_exist() {
        let actual = object(json!({"b": 2}));
        let expected = object(json!({"a": 1}));
        assert!(!contains_subset(&actual, &expected));
    }
}
