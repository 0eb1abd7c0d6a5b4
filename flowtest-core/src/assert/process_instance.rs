use flowtest_client::types::*;
use flowtest_client::{EngineClient, EngineError};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};

use super::{AssertionError, AssertionSettings, PREDICATE_SCAN_LIMIT};
use crate::poll::wait_until;

/// Identifies which process instance a verification targets.
#[derive(Clone)]
pub enum ProcessInstanceSelector {
    /// Direct point lookup. Falls back to a key-filtered search inside the
    /// same wait: the engine exposes two identifier spaces for the same
    /// logical entity, and a key that 404s on the point endpoint can still
    /// be visible to the search index.
    ByKey(InstanceKey),
    /// Newest instance of the logical definition id.
    ByProcessId(String),
    /// Newest instance (within a bounded page) matching a client-side
    /// predicate.
    ByPredicate(Arc<dyn Fn(&ProcessInstanceResult) -> bool + Send + Sync>),
}

impl fmt::Display for ProcessInstanceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByKey(key) => write!(f, "process instance {key}"),
            Self::ByProcessId(id) => write!(f, "process instance of \"{id}\""),
            Self::ByPredicate(_) => write!(f, "process instance matching predicate"),
        }
    }
}

pub struct ProcessInstanceAssert {
    client: Arc<dyn EngineClient>,
    settings: AssertionSettings,
    selector: ProcessInstanceSelector,
}

impl ProcessInstanceAssert {
    pub fn new(
        client: Arc<dyn EngineClient>,
        settings: AssertionSettings,
        selector: ProcessInstanceSelector,
    ) -> Self {
        Self {
            client,
            settings,
            selector,
        }
    }

    async fn resolve(&self) -> Result<Option<ProcessInstanceResult>, EngineError> {
        match &self.selector {
            ProcessInstanceSelector::ByKey(key) => {
                match self.client.get_process_instance(*key).await {
                    Ok(instance) => Ok(Some(instance)),
                    Err(error) if error.is_not_found() => {
                        let page = self
                            .client
                            .search_process_instances(
                                SearchRequest::filtered(ProcessInstanceFilter {
                                    process_instance_key: Some(*key),
                                    ..Default::default()
                                })
                                .sorted(SortField::desc("startDate"))
                                .limit(1),
                            )
                            .await?;
                        Ok(page.items.into_iter().next())
                    }
                    Err(error) => Err(error),
                }
            }
            ProcessInstanceSelector::ByProcessId(id) => {
                let page = self
                    .client
                    .search_process_instances(
                        SearchRequest::filtered(ProcessInstanceFilter {
                            process_definition_id: Some(id.clone()),
                            ..Default::default()
                        })
                        .sorted(SortField::desc("startDate"))
                        .limit(1),
                    )
                    .await?;
                Ok(page.items.into_iter().next())
            }
            ProcessInstanceSelector::ByPredicate(predicate) => {
                let page = self
                    .client
                    .search_process_instances(
                        SearchRequest::filtered(ProcessInstanceFilter::default())
                            .sorted(SortField::desc("startDate"))
                            .limit(PREDICATE_SCAN_LIMIT),
                    )
                    .await?;
                Ok(page.items.into_iter().find(|i| predicate(i)))
            }
        }
    }

    /// One wait over "resolve, record what was seen, compare".
    async fn await_instance(
        &self,
        condition: &str,
        check: impl Fn(&ProcessInstanceResult) -> bool,
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
                            *observed.lock().unwrap() = Some("no matching instance".to_string());
                            Ok::<_, EngineError>(false)
                        }
                        Some(instance) => {
                            *observed.lock().unwrap() =
                                Some(format!("state {:?}", instance.state));
                            Ok(check(&instance))
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

    /// One wait over "resolve, fetch a related page for the instance,
    /// record what was seen, compare".
    async fn await_related<T, C>(
        &self,
        condition: &str,
        fetch: impl Fn(InstanceKey) -> C,
        describe: impl Fn(&[T]) -> String,
        check: impl Fn(&[T]) -> bool,
    ) -> Result<(), AssertionError>
    where
        C: std::future::Future<Output = Result<Vec<T>, EngineError>>,
    {
        let observed = Mutex::new(None);
        let result = wait_until(
            self.settings.poll(),
            format!("{} {condition}", self.selector),
            || {
                let observed = &observed;
                let fetch = &fetch;
                let describe = &describe;
                let check = &check;
                async move {
                    let Some(instance) = self.resolve().await? else {
                        *observed.lock().unwrap() = Some("no matching instance".to_string());
                        return Ok::<_, EngineError>(false);
                    };
                    let related = fetch(instance.process_instance_key).await?;
                    *observed.lock().unwrap() = Some(describe(&related));
                    Ok(check(&related))
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

    // ── State ──

    /// The instance exists (in any state).
    pub async fn is_created(&self) -> Result<(), AssertionError> {
        self.await_instance("is created", |_| true).await
    }

    pub async fn is_active(&self) -> Result<(), AssertionError> {
        self.await_instance("is active", |i| i.state == ProcessInstanceState::Active)
            .await
    }

    pub async fn is_completed(&self) -> Result<(), AssertionError> {
        self.await_instance("is completed", |i| {
            i.state == ProcessInstanceState::Completed
        })
        .await
    }

    pub async fn is_terminated(&self) -> Result<(), AssertionError> {
        self.await_instance("is terminated", |i| {
            i.state == ProcessInstanceState::Terminated
        })
        .await
    }

    // ── Elements ──

    /// Element assertions share one fetch: all element instances of the
    /// resolved process instance, oldest first.
    async fn await_elements(
        &self,
        condition: &str,
        check: impl Fn(&[ElementInstanceResult]) -> bool,
    ) -> Result<(), AssertionError> {
        self.await_related(
            condition,
            |key| async move {
                let page = self
                    .client
                    .search_element_instances(
                        SearchRequest::filtered(ElementInstanceFilter {
                            process_instance_key: Some(key),
                            ..Default::default()
                        })
                        .sorted(SortField::asc("startDate"))
                        .limit(PREDICATE_SCAN_LIMIT),
                    )
                    .await?;
                Ok(page.items)
            },
            describe_elements,
            check,
        )
        .await
    }

    /// Every named element currently has at least one active instance.
    pub async fn has_active_elements(&self, element_ids: &[&str]) -> Result<(), AssertionError> {
        self.await_elements(&format!("has active elements {element_ids:?}"), |elements| {
            element_ids.iter().all(|id| {
                elements
                    .iter()
                    .any(|e| e.element_id == *id && e.state == ElementInstanceState::Active)
            })
        })
        .await
    }

    /// Every named element has at least one completed instance.
    pub async fn has_completed_elements(&self, element_ids: &[&str]) -> Result<(), AssertionError> {
        self.await_elements(
            &format!("has completed elements {element_ids:?}"),
            |elements| {
                element_ids.iter().all(|id| {
                    elements
                        .iter()
                        .any(|e| e.element_id == *id && e.state == ElementInstanceState::Completed)
                })
            },
        )
        .await
    }

    /// None of the named elements has an active instance.
    pub async fn has_no_active_elements(&self, element_ids: &[&str]) -> Result<(), AssertionError> {
        self.await_elements(
            &format!("has no active elements {element_ids:?}"),
            |elements| {
                !elements.iter().any(|e| {
                    element_ids.contains(&e.element_id.as_str())
                        && e.state == ElementInstanceState::Active
                })
            },
        )
        .await
    }

    /// The named elements completed in the given order (as a subsequence of
    /// all completed elements, ordered by start date).
    pub async fn has_completed_elements_in_order(
        &self,
        element_ids: &[&str],
    ) -> Result<(), AssertionError> {
        self.await_elements(
            &format!("has completed elements in order {element_ids:?}"),
            |elements| {
                let completed: Vec<&str> = elements
                    .iter()
                    .filter(|e| e.state == ElementInstanceState::Completed)
                    .map(|e| e.element_id.as_str())
                    .collect();
                is_subsequence(element_ids, &completed)
            },
        )
        .await
    }

    // ── Variables ──

    /// Subset match over instance-scoped variables: every named variable
    /// must exist and be equal; extra variables are ignored.
    pub async fn has_variables(&self, expected: &Variables) -> Result<(), AssertionError> {
        let names: Vec<&String> = expected.keys().collect();
        self.await_related(
            &format!("has variables {names:?}"),
            |key| async move {
                let page = self
                    .client
                    .search_variables(
                        SearchRequest::filtered(VariableFilter {
                            process_instance_key: Some(key),
                            ..Default::default()
                        })
                        .limit(PREDICATE_SCAN_LIMIT),
                    )
                    .await?;
                Ok(page.items)
            },
            |variables: &[VariableResult]| {
                let names: Vec<&str> = variables.iter().map(|v| v.name.as_str()).collect();
                format!("variables {names:?}")
            },
            |variables| {
                expected.iter().all(|(name, value)| {
                    variables.iter().any(|v| {
                        v.name == *name
                            && serde_json::from_str::<Value>(&v.value)
                                .map(|actual| actual == *value)
                                .unwrap_or(false)
                    })
                })
            },
        )
        .await
    }

    pub async fn has_variable(&self, name: &str, value: Value) -> Result<(), AssertionError> {
        let mut expected = Variables::new();
        expected.insert(name.to_string(), value);
        self.has_variables(&expected).await
    }

    // ── Incidents ──

    pub async fn has_no_incidents(&self) -> Result<(), AssertionError> {
        self.await_related(
            "has no incidents",
            |key| async move {
                let page = self
                    .client
                    .search_incidents(SearchRequest::filtered(IncidentFilter {
                        process_instance_key: Some(key),
                        state: Some(IncidentState::Active),
                    }))
                    .await?;
                Ok(page.items)
            },
            |incidents: &[IncidentResult]| format!("{} active incidents", incidents.len()),
            |incidents| incidents.is_empty(),
        )
        .await
    }

    pub async fn has_incidents(&self) -> Result<(), AssertionError> {
        self.await_related(
            "has incidents",
            |key| async move {
                let page = self
                    .client
                    .search_incidents(SearchRequest::filtered(IncidentFilter {
                        process_instance_key: Some(key),
                        state: Some(IncidentState::Active),
                    }))
                    .await?;
                Ok(page.items)
            },
            |incidents: &[IncidentResult]| format!("{} active incidents", incidents.len()),
            |incidents| !incidents.is_empty(),
        )
        .await
    }
}

fn describe_elements(elements: &[ElementInstanceResult]) -> String {
    let states: Vec<String> = elements
        .iter()
        .map(|e| format!("{}={:?}", e.element_id, e.state))
        .collect();
    format!("elements [{}]", states.join(", "))
}

/// True when `wanted` appears in `haystack` in order (not necessarily
/// contiguously).
fn is_subsequence(wanted: &[&str], haystack: &[&str]) -> bool {
    let mut remaining = wanted.iter().copied().peekable();
    for item in haystack {
        if remaining.peek() == Some(item) {
            remaining.next();
        }
    }
    remaining.peek().is_none()
}

#[cfg(test)]
mod tests {
    use super::is_subsequence;

    #[test]
    fn subsequence_allows_gaps_but_not_reordering() {
        assert!(is_subsequence(&["a", "c"], &["a", "b", "c"]));
        assert!(!is_subsequence(&["c", "a"], &["a", "b", "c"]));
        assert!(!is_subsequence(&["a", "d"], &["a", "b", "c"]));
        assert!(is_subsequence(&[], &["a"]));
    }
}
