//! EngineClient trait — the sole API boundary between the flowtest harness
//! and the process-automation engine. flowtest-core depends on this crate,
//! never on a concrete gateway implementation.

pub mod error;
pub mod http;
pub mod inprocess;
pub mod types;

use async_trait::async_trait;
use std::time::Duration;

pub use error::EngineError;
use types::*;

pub type Result<T> = std::result::Result<T, EngineError>;

#[async_trait]
pub trait EngineClient: Send + Sync {
    // ── Deployment ──

    /// Deploy process/decision/form artifacts in a single deployment.
    async fn deploy(&self, resources: Vec<DeployResource>) -> Result<DeploymentResult>;

    /// Delete a deployed resource. Fails while live instances still pin it.
    async fn delete_resource(&self, resource_key: ResourceKey) -> Result<()>;

    // ── Process instances ──

    async fn create_instance(&self, req: CreateInstanceRequest) -> Result<CreateInstanceResult>;

    /// Cancel a running instance. Cancelling an already-finished instance
    /// errors; teardown treats that as acceptable noise.
    async fn cancel_instance(&self, key: InstanceKey) -> Result<()>;

    async fn get_process_instance(&self, key: InstanceKey) -> Result<ProcessInstanceResult>;

    async fn search_process_instances(
        &self,
        req: SearchRequest<ProcessInstanceFilter>,
    ) -> Result<SearchPage<ProcessInstanceResult>>;

    async fn search_element_instances(
        &self,
        req: SearchRequest<ElementInstanceFilter>,
    ) -> Result<SearchPage<ElementInstanceResult>>;

    async fn search_incidents(
        &self,
        req: SearchRequest<IncidentFilter>,
    ) -> Result<SearchPage<IncidentResult>>;

    async fn search_variables(
        &self,
        req: SearchRequest<VariableFilter>,
    ) -> Result<SearchPage<VariableResult>>;

    // ── User tasks ──

    async fn search_user_tasks(
        &self,
        req: SearchRequest<UserTaskFilter>,
    ) -> Result<SearchPage<UserTaskResult>>;

    async fn complete_user_task(&self, key: UserTaskKey, variables: Variables) -> Result<()>;

    async fn assign_user_task(&self, key: UserTaskKey, assignee: &str) -> Result<()>;

    // ── Decisions ──

    async fn evaluate_decision(
        &self,
        req: EvaluateDecisionRequest,
    ) -> Result<EvaluateDecisionResult>;

    async fn search_decision_instances(
        &self,
        req: SearchRequest<DecisionInstanceFilter>,
    ) -> Result<SearchPage<DecisionInstanceResult>>;

    /// Point lookup by decision instance *id* (not key). Carries full
    /// evaluated-input and matched-rule detail, unlike the search shape.
    async fn get_decision_instance(&self, id: &str) -> Result<DecisionInstanceGetResult>;

    // ── Jobs ──

    /// Activate up to `max_jobs` units of work of the given kind, locking
    /// them to `worker_name`.
    async fn activate_jobs(&self, req: ActivateJobsRequest) -> Result<Vec<ActivatedJob>>;

    async fn complete_job(&self, key: JobKey, variables: Variables) -> Result<()>;

    async fn fail_job(&self, key: JobKey, retries: i32, message: &str) -> Result<()>;

    /// Raise a business error on a job; routed to error boundary events.
    async fn throw_job_error(&self, key: JobKey, code: &str, message: &str) -> Result<()>;

    // ── Signals & messages ──

    async fn broadcast_signal(&self, name: &str, variables: Variables) -> Result<()>;

    async fn publish_message(&self, req: PublishMessageRequest) -> Result<()>;

    // ── Cluster ──

    async fn topology(&self) -> Result<Topology>;

    // ── Clock (management API) ──

    async fn clock_current_millis(&self) -> Result<i64>;

    async fn clock_add(&self, offset: Duration) -> Result<()>;

    async fn clock_reset(&self) -> Result<()>;
}
