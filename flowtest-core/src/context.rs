//! Test context — the façade test code talks to.
//!
//! Exposes deployment, instance creation, worker mocking, clock control and
//! verification constructors, and tracks everything a test created so
//! teardown can undo it in dependency-safe order.
//!
//! Cleanup ordering is a hard invariant: every tracked process instance is
//! cancelled before any tracked resource deletion is attempted, because a
//! live instance pins its definition. Per-item failures are collected, not
//! thrown, so one stuck entity never prevents the rest from being
//! attempted; both tracking sets are cleared unconditionally so a failed
//! cleanup cannot leak into the next test.

use flowtest_client::types::*;
use flowtest_client::{EngineClient, EngineError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::assert::{
    AssertionSettings, DecisionAssert, DecisionSelector, ProcessInstanceAssert,
    ProcessInstanceSelector, UserTaskAssert, UserTaskSelector,
};
use crate::clock::EngineClock;
use crate::config::RuntimeMode;
use crate::poll::{wait_until, PollSettings};
use crate::runtime::RuntimeError;
use crate::worker::MockJobWorker;

/// Per-resource deletion retry window: deletion legitimately fails for a
/// moment after instance cancellation while the engine releases the
/// definition reference.
const DELETE_TIMEOUT: Duration = Duration::from_secs(4);
const DELETE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackedResourceKind {
    ProcessDefinition,
    DecisionDefinition,
    DecisionRequirements,
    Form,
}

#[derive(Clone, Debug)]
pub struct TrackedResource {
    pub resource_key: ResourceKey,
    pub kind: TrackedResourceKind,
    pub source_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("failed to read resource {}: {source}", .path.display())]
    ReadResource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("failed to cancel process instance {key}: {message}")]
    CancelInstance { key: InstanceKey, message: String },

    #[error("failed to delete resource {key}: {message}")]
    DeleteResource { key: ResourceKey, message: String },
}

/// Aggregate teardown outcome. Cleanup problems are warnings, not test
/// failures: they must not mask the test's own verdict, but they are not
/// silently dropped either.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub errors: Vec<CleanupError>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct TestContext {
    client: Arc<dyn EngineClient>,
    mode: RuntimeMode,
    settings: AssertionSettings,
    /// Keyed by resource key: a resource is tracked at most once.
    tracked_resources: Mutex<BTreeMap<ResourceKey, TrackedResource>>,
    tracked_instances: Mutex<Vec<InstanceKey>>,
}

impl TestContext {
    pub fn new(
        client: Arc<dyn EngineClient>,
        mode: RuntimeMode,
        settings: AssertionSettings,
    ) -> Self {
        Self {
            client,
            mode,
            settings,
            tracked_resources: Mutex::new(BTreeMap::new()),
            tracked_instances: Mutex::new(Vec::new()),
        }
    }

    pub fn client(&self) -> Arc<dyn EngineClient> {
        self.client.clone()
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    pub fn clock(&self) -> EngineClock {
        EngineClock::new(self.client.clone(), self.mode)
    }

    /// Advance the engine clock (managed mode only).
    pub async fn increase_time(&self, offset: Duration) -> Result<(), ContextError> {
        self.clock().advance(offset).await?;
        Ok(())
    }

    // ── Deployment ──

    /// Deploy files in one deployment and track every contained artifact
    /// for teardown.
    pub async fn deploy_resources(
        &self,
        paths: &[impl AsRef<Path>],
    ) -> Result<DeploymentResult, ContextError> {
        let mut resources = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let content =
                std::fs::read_to_string(path).map_err(|source| ContextError::ReadResource {
                    path: path.to_path_buf(),
                    source,
                })?;
            resources.push(DeployResource {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string()),
                content,
            });
        }
        let result = self.client.deploy(resources).await?;
        self.track_deployment(&result, paths);
        Ok(result)
    }

    pub async fn deploy_resource(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<DeploymentResult, ContextError> {
        self.deploy_resources(&[path]).await
    }

    /// Record every artifact of a deployment for teardown. Public so tests
    /// that deploy through the raw client can still opt into tracking.
    pub fn track_deployment(&self, result: &DeploymentResult, paths: &[impl AsRef<Path>]) {
        let path_for = |resource_name: &str| -> Option<PathBuf> {
            paths
                .iter()
                .map(|p| p.as_ref())
                .find(|p| {
                    p.file_name()
                        .map(|n| n.to_string_lossy() == resource_name)
                        .unwrap_or(false)
                })
                .map(Path::to_path_buf)
        };
        let mut tracked = self.tracked_resources.lock().unwrap();
        for process in &result.processes {
            tracked.insert(
                process.process_definition_key,
                TrackedResource {
                    resource_key: process.process_definition_key,
                    kind: TrackedResourceKind::ProcessDefinition,
                    source_path: path_for(&process.resource_name),
                },
            );
        }
        for decision in &result.decisions {
            tracked.insert(
                decision.decision_definition_key,
                TrackedResource {
                    resource_key: decision.decision_definition_key,
                    kind: TrackedResourceKind::DecisionDefinition,
                    source_path: path_for(&decision.resource_name),
                },
            );
        }
        for drd in &result.decision_requirements {
            tracked.insert(
                drd.decision_requirements_key,
                TrackedResource {
                    resource_key: drd.decision_requirements_key,
                    kind: TrackedResourceKind::DecisionRequirements,
                    source_path: path_for(&drd.resource_name),
                },
            );
        }
        for form in &result.forms {
            tracked.insert(
                form.form_key,
                TrackedResource {
                    resource_key: form.form_key,
                    kind: TrackedResourceKind::Form,
                    source_path: path_for(&form.resource_name),
                },
            );
        }
    }

    // ── Instances ──

    /// Create an instance of the latest deployed version of a process and
    /// track it. A failed creation (e.g. undeployed id) tracks nothing.
    pub async fn create_instance(
        &self,
        process_definition_id: &str,
        variables: Variables,
    ) -> Result<CreateInstanceResult, ContextError> {
        let result = self
            .client
            .create_instance(CreateInstanceRequest {
                process_definition_id: process_definition_id.to_string(),
                variables,
            })
            .await?;
        self.track_instance(result.process_instance_key);
        Ok(result)
    }

    pub fn track_instance(&self, key: InstanceKey) {
        self.tracked_instances.lock().unwrap().push(key);
    }

    // ── Verifications & workers ──

    pub fn assert_process(&self, selector: ProcessInstanceSelector) -> ProcessInstanceAssert {
        ProcessInstanceAssert::new(self.client.clone(), self.settings, selector)
    }

    /// Verification for an instance the context just created.
    pub fn assert_instance(&self, created: &CreateInstanceResult) -> ProcessInstanceAssert {
        self.assert_process(ProcessInstanceSelector::ByKey(created.process_instance_key))
    }

    pub fn assert_user_task(&self, selector: UserTaskSelector) -> UserTaskAssert {
        UserTaskAssert::new(self.client.clone(), self.settings, selector)
    }

    pub fn assert_decision(&self, selector: DecisionSelector) -> DecisionAssert {
        DecisionAssert::new(self.client.clone(), self.settings, selector)
    }

    pub fn mock_worker(&self, kind: &str) -> MockJobWorker {
        MockJobWorker::for_kind(self.client.clone(), kind)
    }

    // ── Engine passthroughs tests commonly need ──

    pub async fn evaluate_decision(
        &self,
        decision_definition_id: &str,
        variables: Variables,
    ) -> Result<EvaluateDecisionResult, ContextError> {
        let result = self
            .client
            .evaluate_decision(EvaluateDecisionRequest {
                decision_definition_id: decision_definition_id.to_string(),
                variables,
            })
            .await?;
        Ok(result)
    }

    pub async fn broadcast_signal(
        &self,
        name: &str,
        variables: Variables,
    ) -> Result<(), ContextError> {
        self.client.broadcast_signal(name, variables).await?;
        Ok(())
    }

    pub async fn publish_message(
        &self,
        name: &str,
        correlation_key: &str,
        variables: Variables,
    ) -> Result<(), ContextError> {
        self.client
            .publish_message(PublishMessageRequest {
                name: name.to_string(),
                correlation_key: correlation_key.to_string(),
                variables,
            })
            .await?;
        Ok(())
    }

    // ── Teardown ──

    /// Cancel every tracked instance, then delete every tracked resource.
    /// Never raises: per-item failures are collected into the report and
    /// logged in aggregate. An empty tracker performs no engine calls.
    pub async fn cleanup(&self) -> CleanupReport {
        // Drain first: the sets end empty even when individual items fail.
        let instances: Vec<InstanceKey> =
            std::mem::take(&mut *self.tracked_instances.lock().unwrap());
        let resources: Vec<TrackedResource> = {
            let mut tracked = self.tracked_resources.lock().unwrap();
            std::mem::take(&mut *tracked).into_values().collect()
        };

        let mut report = CleanupReport::default();

        for key in instances {
            match self.client.cancel_instance(key).await {
                Ok(()) => debug!(instance = key, "tracked instance cancelled"),
                // Already finished or already gone: acceptable cleanup noise.
                Err(error) if is_cleanup_noise(&error) => {
                    debug!(instance = key, %error, "instance already gone")
                }
                Err(error) => report.errors.push(CleanupError::CancelInstance {
                    key,
                    message: error.to_string(),
                }),
            }
        }

        for resource in resources {
            let key = resource.resource_key;
            let client = &self.client;
            let result = wait_until(
                PollSettings::new(DELETE_TIMEOUT, DELETE_INTERVAL),
                format!("resource {key} deleted"),
                || async move {
                    match client.delete_resource(key).await {
                        Ok(()) => Ok(true),
                        Err(error) if error.is_not_found() => Ok(true),
                        Err(error) => Err(error),
                    }
                },
            )
            .await;
            match result {
                Ok(()) => debug!(resource = key, "tracked resource deleted"),
                Err(timeout) => report.errors.push(CleanupError::DeleteResource {
                    key,
                    message: timeout.to_string(),
                }),
            }
        }

        if report.is_clean() {
            info!("test context cleaned up");
        } else {
            warn!(
                failures = report.errors.len(),
                "cleanup finished with failures: {}",
                report
                    .errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ")
            );
        }
        report
    }

    /// Forget everything tracked without touching the engine.
    pub fn clear_tracking(&self) {
        self.tracked_instances.lock().unwrap().clear();
        self.tracked_resources.lock().unwrap().clear();
    }

    pub fn tracked_instance_count(&self) -> usize {
        self.tracked_instances.lock().unwrap().len()
    }

    pub fn tracked_resource_count(&self) -> usize {
        self.tracked_resources.lock().unwrap().len()
    }
}

/// Cancellation noise: the instance already finished or was never indexed.
fn is_cleanup_noise(error: &EngineError) -> bool {
    match error {
        EngineError::NotFound { .. } => true,
        EngineError::Engine { status, .. } => *status == 409,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtest_client::inprocess::InProcessEngine;

    fn context(engine: &InProcessEngine) -> TestContext {
        TestContext::new(
            Arc::new(engine.clone()),
            RuntimeMode::Managed,
            AssertionSettings::default(),
        )
    }

    #[tokio::test]
    async fn a_resource_is_tracked_at_most_once() {
        let engine = InProcessEngine::new();
        let ctx = context(&engine);
        let result = engine
            .deploy(vec![DeployResource {
                name: "order.bpmn".into(),
                content: "<definitions/>".into(),
            }])
            .await
            .unwrap();

        ctx.track_deployment(&result, &["order.bpmn"]);
        ctx.track_deployment(&result, &["order.bpmn"]);

        assert_eq!(ctx.tracked_resource_count(), 1);
    }

    #[tokio::test]
    async fn failed_creation_tracks_nothing() {
        let engine = InProcessEngine::new();
        let ctx = context(&engine);

        let err = ctx
            .create_instance("never-deployed", Variables::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::Engine(e) if e.is_not_found()));
        assert_eq!(ctx.tracked_instance_count(), 0);
    }
}
