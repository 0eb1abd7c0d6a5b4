use flowtest_client::types::*;
use flowtest_client::{EngineClient, EngineError};
use std::fmt;
use std::sync::{Arc, Mutex};

use super::{AssertionError, AssertionSettings};
use crate::poll::wait_until;

/// Identifies which user task a verification targets.
#[derive(Clone)]
pub enum UserTaskSelector {
    ByKey(UserTaskKey),
    /// Newest task created at the named element.
    ByElementId(String),
    /// Newest task with the given display name.
    ByTaskName(String),
    /// Newest task belonging to the given process instance.
    ByProcessInstanceKey(InstanceKey),
}

impl fmt::Display for UserTaskSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByKey(key) => write!(f, "user task {key}"),
            Self::ByElementId(id) => write!(f, "user task at element \"{id}\""),
            Self::ByTaskName(name) => write!(f, "user task named \"{name}\""),
            Self::ByProcessInstanceKey(key) => write!(f, "user task of instance {key}"),
        }
    }
}

impl UserTaskSelector {
    fn filter(&self) -> UserTaskFilter {
        match self {
            Self::ByKey(key) => UserTaskFilter {
                user_task_key: Some(*key),
                ..Default::default()
            },
            Self::ByElementId(id) => UserTaskFilter {
                element_id: Some(id.clone()),
                ..Default::default()
            },
            Self::ByTaskName(name) => UserTaskFilter {
                name: Some(name.clone()),
                ..Default::default()
            },
            Self::ByProcessInstanceKey(key) => UserTaskFilter {
                process_instance_key: Some(*key),
                ..Default::default()
            },
        }
    }
}

pub struct UserTaskAssert {
    client: Arc<dyn EngineClient>,
    settings: AssertionSettings,
    selector: UserTaskSelector,
}

impl UserTaskAssert {
    pub fn new(
        client: Arc<dyn EngineClient>,
        settings: AssertionSettings,
        selector: UserTaskSelector,
    ) -> Self {
        Self {
            client,
            settings,
            selector,
        }
    }

    async fn resolve(&self) -> Result<Option<UserTaskResult>, EngineError> {
        let page = self
            .client
            .search_user_tasks(
                SearchRequest::filtered(self.selector.filter())
                    .sorted(SortField::desc("creationDate"))
                    .limit(1),
            )
            .await?;
        Ok(page.items.into_iter().next())
    }

    async fn await_task(
        &self,
        condition: &str,
        check: impl Fn(&UserTaskResult) -> bool,
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
                            *observed.lock().unwrap() = Some("no matching user task".to_string());
                            Ok::<_, EngineError>(false)
                        }
                        Some(task) => {
                            *observed.lock().unwrap() = Some(format!(
                                "state {:?}, assignee {:?}, priority {}",
                                task.state, task.assignee, task.priority
                            ));
                            Ok(check(&task))
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

    pub async fn is_created(&self) -> Result<(), AssertionError> {
        self.await_task("is created", |t| t.state == UserTaskState::Created)
            .await
    }

    pub async fn is_completed(&self) -> Result<(), AssertionError> {
        self.await_task("is completed", |t| t.state == UserTaskState::Completed)
            .await
    }

    pub async fn is_assigned_to(&self, assignee: &str) -> Result<(), AssertionError> {
        self.await_task(&format!("is assigned to \"{assignee}\""), |t| {
            t.assignee.as_deref() == Some(assignee)
        })
        .await
    }

    pub async fn has_priority(&self, priority: i32) -> Result<(), AssertionError> {
        self.await_task(&format!("has priority {priority}"), |t| {
            t.priority == priority
        })
        .await
    }

    pub async fn has_candidate_group(&self, group: &str) -> Result<(), AssertionError> {
        self.await_task(&format!("has candidate group \"{group}\""), |t| {
            t.candidate_groups.iter().any(|g| g == group)
        })
        .await
    }
}
