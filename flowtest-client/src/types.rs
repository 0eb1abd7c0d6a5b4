use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ─── Scalar aliases ───────────────────────────────────────────

/// Key of a deployed definition (process, decision, DRD, form).
pub type DefinitionKey = i64;

/// Key of a deployed resource (deletion handle).
pub type ResourceKey = i64;

/// Key of a process instance.
pub type InstanceKey = i64;

/// Key of an element instance within a process instance.
pub type ElementInstanceKey = i64;

/// Key of a user task.
pub type UserTaskKey = i64;

/// Key of a decision instance. One evaluation may produce several
/// [`DecisionInstanceResult`]s; each also carries a string *id* (key plus
/// evaluation-index suffix) used for point lookups.
pub type DecisionInstanceKey = i64;

/// Key of an activated job.
pub type JobKey = i64;

/// Variable map as sent to / read from the engine.
pub type Variables = BTreeMap<String, Value>;

// ─── Deployment ───────────────────────────────────────────────

/// One artifact handed to [`deploy`](crate::EngineClient::deploy).
/// Content is passed through opaquely; the harness never parses it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployResource {
    pub name: String,
    pub content: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentResult {
    pub deployment_key: i64,
    pub processes: Vec<DeployedProcess>,
    pub decisions: Vec<DeployedDecision>,
    pub decision_requirements: Vec<DeployedDecisionRequirements>,
    pub forms: Vec<DeployedForm>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployedProcess {
    pub process_definition_key: DefinitionKey,
    pub process_definition_id: String,
    pub version: i32,
    pub resource_name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployedDecision {
    pub decision_definition_key: DefinitionKey,
    pub decision_definition_id: String,
    pub version: i32,
    pub name: String,
    pub decision_requirements_key: DefinitionKey,
    pub resource_name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployedDecisionRequirements {
    pub decision_requirements_key: DefinitionKey,
    pub decision_requirements_id: String,
    pub version: i32,
    pub resource_name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployedForm {
    pub form_key: DefinitionKey,
    pub form_id: String,
    pub version: i32,
    pub resource_name: String,
}

// ─── Process instances ────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    /// Logical definition id; the engine picks the latest deployed version.
    pub process_definition_id: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub variables: Variables,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateInstanceResult {
    pub process_instance_key: InstanceKey,
    pub process_definition_key: DefinitionKey,
    pub process_definition_id: String,
    pub version: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessInstanceState {
    Active,
    Completed,
    Terminated,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInstanceResult {
    pub process_instance_key: InstanceKey,
    pub process_definition_key: DefinitionKey,
    pub process_definition_id: String,
    pub state: ProcessInstanceState,
    #[serde(default)]
    pub has_incident: bool,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

// ─── Element instances ────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElementInstanceState {
    Active,
    Completed,
    Terminated,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementInstanceResult {
    pub element_instance_key: ElementInstanceKey,
    pub process_instance_key: InstanceKey,
    pub element_id: String,
    #[serde(default)]
    pub element_name: Option<String>,
    pub state: ElementInstanceState,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

// ─── User tasks ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserTaskState {
    Created,
    Assigning,
    Updating,
    Completing,
    Completed,
    Canceling,
    Canceled,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTaskResult {
    pub user_task_key: UserTaskKey,
    pub element_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub state: UserTaskState,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub candidate_groups: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    pub process_instance_key: InstanceKey,
    pub creation_date: DateTime<Utc>,
}

// ─── Decision instances ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionInstanceState {
    Evaluated,
    Failed,
    #[serde(other)]
    Unknown,
}

/// List/search shape. Carries the output only; evaluated inputs and matched
/// rules require the point lookup ([`DecisionInstanceGetResult`]).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionInstanceResult {
    pub decision_instance_key: DecisionInstanceKey,
    /// Point-lookup id: the key plus a dash-joined evaluation index.
    pub decision_instance_id: String,
    pub state: DecisionInstanceState,
    pub decision_definition_id: String,
    pub decision_definition_key: DefinitionKey,
    #[serde(default)]
    pub decision_definition_name: Option<String>,
    pub decision_definition_version: i32,
    #[serde(default)]
    pub process_instance_key: Option<InstanceKey>,
    /// JSON-encoded evaluation output.
    pub result: String,
    pub evaluation_date: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvaluatedDecisionInput {
    pub input_id: String,
    pub input_name: String,
    /// JSON-encoded input value.
    pub input_value: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchedRule {
    pub rule_id: String,
    pub rule_index: i32,
}

/// Point-lookup shape (by decision instance *id*), with full input detail.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionInstanceGetResult {
    #[serde(flatten)]
    pub summary: DecisionInstanceResult,
    #[serde(default)]
    pub evaluated_inputs: Vec<EvaluatedDecisionInput>,
    #[serde(default)]
    pub matched_rules: Vec<MatchedRule>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateDecisionRequest {
    pub decision_definition_id: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub variables: Variables,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvaluateDecisionResult {
    pub decision_instance_key: DecisionInstanceKey,
    pub decision_definition_id: String,
    /// JSON-encoded evaluation output.
    pub result: String,
}

// ─── Incidents & variables ────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentState {
    Active,
    Resolved,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentResult {
    pub incident_key: i64,
    pub process_instance_key: InstanceKey,
    pub error_type: String,
    #[serde(default)]
    pub error_message: Option<String>,
    pub state: IncidentState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableResult {
    pub variable_key: i64,
    pub name: String,
    /// JSON-encoded value.
    pub value: String,
    pub process_instance_key: InstanceKey,
    pub scope_key: i64,
}

// ─── Jobs ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateJobsRequest {
    /// Task type the worker serves.
    pub kind: String,
    pub worker_name: String,
    pub max_jobs: u32,
    /// How long an activated job stays locked to this worker.
    pub lock_timeout_ms: u64,
    /// How long the engine may hold the request open waiting for work.
    pub request_timeout_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivatedJob {
    pub job_key: JobKey,
    pub kind: String,
    pub process_instance_key: InstanceKey,
    pub element_id: String,
    #[serde(default)]
    pub variables: Variables,
    pub retries: i32,
}

// ─── Signals, messages ────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishMessageRequest {
    pub name: String,
    pub correlation_key: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub variables: Variables,
}

// ─── Topology ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionRole {
    Leader,
    Follower,
    Inactive,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionHealth {
    Healthy,
    Unhealthy,
    Dead,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionInfo {
    pub partition_id: i32,
    pub role: PartitionRole,
    pub health: PartitionHealth,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerInfo {
    pub node_id: i32,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub partitions: Vec<PartitionInfo>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Topology {
    pub brokers: Vec<BrokerInfo>,
    pub partitions_count: i32,
}

impl Topology {
    /// All partitions across all brokers.
    pub fn all_partitions(&self) -> impl Iterator<Item = &PartitionInfo> {
        self.brokers.iter().flat_map(|b| b.partitions.iter())
    }
}

// ─── Search requests / paging ─────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortField {
    pub field: String,
    pub order: SortOrder,
}

impl SortField {
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { limit: 50 }
    }
}

/// Search envelope: typed filter + sort + page bound.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest<F> {
    pub filter: F,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub sort: Vec<SortField>,
    #[serde(default)]
    pub page: PageRequest,
}

impl<F: Default> SearchRequest<F> {
    /// Filter-only request with default sort and paging.
    pub fn filtered(filter: F) -> Self {
        Self {
            filter,
            sort: Vec::new(),
            page: PageRequest::default(),
        }
    }

    pub fn sorted(mut self, sort: SortField) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.page = PageRequest { limit };
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage<T> {
    pub items: Vec<T>,
    pub total: i64,
}

impl<T> SearchPage<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }

    pub fn single(&self) -> Option<&T> {
        self.items.first()
    }
}

// ─── Per-entity filters ───────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessInstanceFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_instance_key: Option<InstanceKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_definition_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ProcessInstanceState>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ElementInstanceFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_instance_key: Option<InstanceKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ElementInstanceState>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserTaskFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_task_key: Option<UserTaskKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_instance_key: Option<InstanceKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<UserTaskState>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecisionInstanceFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_instance_key: Option<DecisionInstanceKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_definition_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_instance_key: Option<InstanceKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<DecisionInstanceState>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IncidentFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_instance_key: Option<InstanceKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<IncidentState>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VariableFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_instance_key: Option<InstanceKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}
