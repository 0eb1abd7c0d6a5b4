use flowtest_client::types::*;
use flowtest_client::{EngineClient, EngineError};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{contains_subset, AssertionError, AssertionSettings};
use crate::poll::wait_until;

/// Attempts at the secondary point lookup before treating "not found" as a
/// real negative instead of an indexing race.
const DETAIL_LOOKUP_ATTEMPTS: u32 = 3;
const DETAIL_LOOKUP_BACKOFF: Duration = Duration::from_millis(200);

/// Identifies which decision instance a verification targets.
#[derive(Clone)]
pub enum DecisionSelector {
    ByKey(DecisionInstanceKey),
    /// Most recently evaluated instance of the logical decision id.
    ByDecisionId(String),
    /// Most recently evaluated instance belonging to a process instance.
    ByProcessInstanceKey(InstanceKey),
}

impl fmt::Display for DecisionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByKey(key) => write!(f, "decision instance {key}"),
            Self::ByDecisionId(id) => write!(f, "decision instance of \"{id}\""),
            Self::ByProcessInstanceKey(key) => {
                write!(f, "decision instance of process instance {key}")
            }
        }
    }
}

impl DecisionSelector {
    fn filter(&self) -> DecisionInstanceFilter {
        match self {
            Self::ByKey(key) => DecisionInstanceFilter {
                decision_instance_key: Some(*key),
                ..Default::default()
            },
            Self::ByDecisionId(id) => DecisionInstanceFilter {
                decision_definition_id: Some(id.clone()),
                ..Default::default()
            },
            Self::ByProcessInstanceKey(key) => DecisionInstanceFilter {
                process_instance_key: Some(*key),
                ..Default::default()
            },
        }
    }
}

pub struct DecisionAssert {
    client: Arc<dyn EngineClient>,
    settings: AssertionSettings,
    selector: DecisionSelector,
}

impl DecisionAssert {
    pub fn new(
        client: Arc<dyn EngineClient>,
        settings: AssertionSettings,
        selector: DecisionSelector,
    ) -> Self {
        Self {
            client,
            settings,
            selector,
        }
    }

    async fn resolve(&self) -> Result<Option<DecisionInstanceResult>, EngineError> {
        let page = self
            .client
            .search_decision_instances(
                SearchRequest::filtered(self.selector.filter())
                    .sorted(SortField::desc("evaluationDate"))
                    .limit(1),
            )
            .await?;
        Ok(page.items.into_iter().next())
    }

    /// The search result does not carry input/rule detail; it takes a
    /// second, by-id point lookup, which can race the engine's indexing
    /// pipeline even after the search has caught up. Retry it briefly
    /// before letting the outer wait treat the miss as "not yet".
    async fn detail(&self, id: &str) -> Result<DecisionInstanceGetResult, EngineError> {
        let mut attempt = 1;
        loop {
            match self.client.get_decision_instance(id).await {
                Ok(detail) => return Ok(detail),
                Err(error) if error.is_not_found() && attempt < DETAIL_LOOKUP_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(DETAIL_LOOKUP_BACKOFF).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn await_summary(
        &self,
        condition: &str,
        check: impl Fn(&DecisionInstanceResult) -> bool,
    ) -> Result<(), AssertionError> {
        let observed = Mutex::new(None);
        let result = wait_until(
            self.settings.poll(),
            format!("{} {condition}", self.selector),
            || {
                let observed = &observed;
                let check = &check;
                async move {
                    match self.resolve().await? {
                        None => {
                            *observed.lock().unwrap() =
                                Some("no matching decision instance".to_string());
                            Ok::<_, EngineError>(false)
                        }
                        Some(summary) => {
                            *observed.lock().unwrap() = Some(format!(
                                "state {:?}, result {}",
                                summary.state, summary.result
                            ));
                            Ok(check(&summary))
                        }
                    }
                }
            },
        )
        .await;
        result.map_err(|timeout| AssertionError {
            selector: self.selector.to_string(),
            timeout,
            observed: observed.into_inner().unwrap(),
        })
    }

    async fn await_detail(
        &self,
        condition: &str,
        check: impl Fn(&DecisionInstanceGetResult) -> bool,
        describe: impl Fn(&DecisionInstanceGetResult) -> String,
    ) -> Result<(), AssertionError> {
        let observed = Mutex::new(None);
        let result = wait_until(
            self.settings.poll(),
            format!("{} {condition}", self.selector),
            || {
                let observed = &observed;
                let check = &check;
                let describe = &describe;
                async move {
                    let Some(summary) = self.resolve().await? else {
                        *observed.lock().unwrap() =
                            Some("no matching decision instance".to_string());
                        return Ok::<_, EngineError>(false);
                    };
                    let detail = self.detail(&summary.decision_instance_id).await?;
                    *observed.lock().unwrap() = Some(describe(&detail));
                    Ok(check(&detail))
                }
            },
        )
        .await;
        result.map_err(|timeout| AssertionError {
            selector: self.selector.to_string(),
            timeout,
            observed: observed.into_inner().unwrap(),
        })
    }

    pub async fn is_evaluated(&self) -> Result<(), AssertionError> {
        self.await_summary("is evaluated", |d| {
            d.state == DecisionInstanceState::Evaluated
        })
        .await
    }

    /// Exact match on the evaluation output.
    pub async fn has_result(&self, expected: Value) -> Result<(), AssertionError> {
        self.await_summary(&format!("has result {expected}"), |d| {
            serde_json::from_str::<Value>(&d.result)
                .map(|actual| actual == expected)
                .unwrap_or(false)
        })
        .await
    }

    /// Partial match: named keys must be present and equal on the actual
    /// output object; extra keys on the actual output are ignored.
    pub async fn has_result_containing(
        &self,
        expected: serde_json::Map<String, Value>,
    ) -> Result<(), AssertionError> {
        self.await_summary(
            &format!("has result containing {}", Value::Object(expected.clone())),
            |d| match serde_json::from_str::<Value>(&d.result) {
                Ok(Value::Object(actual)) => contains_subset(&actual, &expected),
                _ => false,
            },
        )
        .await
    }

    /// The evaluation matched exactly these rule indexes, in order.
    pub async fn has_matched_rules(&self, rule_indexes: &[i32]) -> Result<(), AssertionError> {
        self.await_detail(
            &format!("has matched rules {rule_indexes:?}"),
            |detail| {
                let matched: Vec<i32> = detail.matched_rules.iter().map(|r| r.rule_index).collect();
                matched == rule_indexes
            },
            |detail| {
                let matched: Vec<i32> = detail.matched_rules.iter().map(|r| r.rule_index).collect();
                format!("matched rules {matched:?}")
            },
        )
        .await
    }

    /// The evaluation consumed exactly these input values, in order.
    pub async fn has_evaluated_inputs(&self, expected: &[Value]) -> Result<(), AssertionError> {
        self.await_detail(
            &format!("has evaluated inputs {expected:?}"),
            |detail| {
                let inputs: Vec<Value> = detail
                    .evaluated_inputs
                    .iter()
                    .filter_map(|i| serde_json::from_str(&i.input_value).ok())
                    .collect();
                inputs == expected
            },
            |detail| {
                let inputs: Vec<&str> = detail
                    .evaluated_inputs
                    .iter()
                    .map(|i| i.input_value.as_str())
                    .collect();
                format!("evaluated inputs {inputs:?}")
            },
        )
        .await
    }
}
