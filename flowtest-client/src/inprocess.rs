//! In-process [`EngineClient`] double backed by in-memory state.
//!
//! Used by the harness's own test suites and by downstream users who want
//! to unit-test harness wiring without a gateway. It is a controllable
//! double, not an engine: it never advances process state on its own.
//! Tests drive state transitions through the `set_*`/`push_*` control
//! surface and can simulate the engine's indexing lag with
//! [`InProcessEngine::set_indexing_lag`].

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::EngineError;
use crate::types::*;
use crate::{EngineClient, Result};

#[derive(Clone, Debug)]
struct StoredResource {
    resource_key: ResourceKey,
    definition_id: String,
    kind: ResourceKind,
    version: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ResourceKind {
    Process,
    Decision,
    DecisionRequirements,
    Form,
}

#[derive(Default)]
struct EngineState {
    next_key: i64,
    time_seq: i64,
    base_time: Option<DateTime<Utc>>,
    resources: Vec<StoredResource>,
    instances: BTreeMap<InstanceKey, ProcessInstanceResult>,
    element_instances: Vec<ElementInstanceResult>,
    user_tasks: BTreeMap<UserTaskKey, UserTaskResult>,
    decision_instances: Vec<DecisionInstanceGetResult>,
    decision_stubs: BTreeMap<String, Value>,
    incidents: Vec<IncidentResult>,
    variables: Vec<VariableResult>,
    job_queues: BTreeMap<String, VecDeque<ActivatedJob>>,
    job_instances: BTreeMap<JobKey, InstanceKey>,
    completed_jobs: Vec<(JobKey, Variables)>,
    failed_jobs: Vec<(JobKey, i32, String)>,
    errored_jobs: Vec<(JobKey, String, String)>,
    clock_offset_ms: i64,
    topology: Option<Topology>,
    indexing_lag: u32,
    fail_next_deletes: u32,
    fail_next_cancels: u32,
    point_lookups_disabled: bool,
    calls: Vec<String>,
}

impl EngineState {
    fn next_key(&mut self) -> i64 {
        self.next_key += 1;
        self.next_key + 1000
    }

    /// Monotonic timestamps so "most recent first" ordering is stable even
    /// when two records land in the same wall-clock millisecond.
    fn next_time(&mut self) -> DateTime<Utc> {
        let base = *self.base_time.get_or_insert_with(Utc::now);
        self.time_seq += 1;
        base + ChronoDuration::milliseconds(self.time_seq)
    }

    fn record(&mut self, op: &str, key: impl std::fmt::Display) {
        self.calls.push(format!("{op}:{key}"));
    }

    /// One indexed read. Returns false while simulated indexing lag is
    /// still in effect; the caller must answer "nothing visible yet".
    fn indexed_read(&mut self) -> bool {
        if self.indexing_lag > 0 {
            self.indexing_lag -= 1;
            return false;
        }
        true
    }
}

/// Cheaply cloneable; clones share state.
#[derive(Clone, Default)]
pub struct InProcessEngine {
    state: Arc<Mutex<EngineState>>,
}

impl InProcessEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine state poisoned")
    }

    // ── Test-control surface ──────────────────────────────────

    /// Every trait-method invocation as `"op:key"` strings, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// The next `polls` reads answer as if the indexing pipeline had not
    /// caught up yet (empty pages / not-found).
    pub fn set_indexing_lag(&self, polls: u32) {
        self.lock().indexing_lag = polls;
    }

    /// The next `attempts` resource deletions fail with a 409, simulating
    /// the engine still releasing definition references after cancellation.
    pub fn fail_next_deletes(&self, attempts: u32) {
        self.lock().fail_next_deletes = attempts;
    }

    /// The next `attempts` instance cancellations fail with a 500.
    pub fn fail_next_cancels(&self, attempts: u32) {
        self.lock().fail_next_cancels = attempts;
    }

    /// Force point lookups to 404 so the search fallback path is taken.
    pub fn disable_point_lookups(&self, disabled: bool) {
        self.lock().point_lookups_disabled = disabled;
    }

    pub fn set_topology(&self, topology: Topology) {
        self.lock().topology = Some(topology);
    }

    pub fn set_instance_state(&self, key: InstanceKey, state: ProcessInstanceState) {
        let mut s = self.lock();
        let end = s.next_time();
        if let Some(instance) = s.instances.get_mut(&key) {
            instance.state = state;
            if state != ProcessInstanceState::Active {
                instance.end_date = Some(end);
            }
        }
    }

    pub fn add_element_instance(
        &self,
        process_instance_key: InstanceKey,
        element_id: &str,
        state: ElementInstanceState,
    ) -> ElementInstanceKey {
        let mut s = self.lock();
        let key = s.next_key();
        let start = s.next_time();
        s.element_instances.push(ElementInstanceResult {
            element_instance_key: key,
            process_instance_key,
            element_id: element_id.to_string(),
            element_name: None,
            state,
            start_date: start,
            end_date: (state != ElementInstanceState::Active).then_some(start),
        });
        key
    }

    pub fn set_element_state(&self, key: ElementInstanceKey, state: ElementInstanceState) {
        let mut s = self.lock();
        let end = s.next_time();
        if let Some(element) = s
            .element_instances
            .iter_mut()
            .find(|e| e.element_instance_key == key)
        {
            element.state = state;
            if state != ElementInstanceState::Active {
                element.end_date = Some(end);
            }
        }
    }

    pub fn add_user_task(
        &self,
        process_instance_key: InstanceKey,
        element_id: &str,
        name: &str,
    ) -> UserTaskKey {
        let mut s = self.lock();
        let key = s.next_key();
        let created = s.next_time();
        s.user_tasks.insert(
            key,
            UserTaskResult {
                user_task_key: key,
                element_id: element_id.to_string(),
                name: Some(name.to_string()),
                state: UserTaskState::Created,
                assignee: None,
                candidate_groups: Vec::new(),
                priority: 50,
                process_instance_key,
                creation_date: created,
            },
        );
        key
    }

    pub fn set_user_task(&self, key: UserTaskKey, f: impl FnOnce(&mut UserTaskResult)) {
        let mut s = self.lock();
        if let Some(task) = s.user_tasks.get_mut(&key) {
            f(task);
        }
    }

    pub fn add_incident(&self, process_instance_key: InstanceKey, error_type: &str) {
        let mut s = self.lock();
        let key = s.next_key();
        s.incidents.push(IncidentResult {
            incident_key: key,
            process_instance_key,
            error_type: error_type.to_string(),
            error_message: None,
            state: IncidentState::Active,
        });
    }

    pub fn set_variable(&self, process_instance_key: InstanceKey, name: &str, value: Value) {
        let mut s = self.lock();
        upsert_variable(&mut s, process_instance_key, name, value);
    }

    /// Stub the output the next evaluations of `decision_id` produce.
    pub fn stub_decision_result(&self, decision_id: &str, result: Value) {
        self.lock()
            .decision_stubs
            .insert(decision_id.to_string(), result);
    }

    /// Attach evaluated-input / matched-rule detail to a decision instance
    /// (only visible through the point lookup, as on the real engine).
    pub fn set_decision_detail(
        &self,
        decision_instance_id: &str,
        inputs: Vec<EvaluatedDecisionInput>,
        matched_rules: Vec<MatchedRule>,
    ) {
        let mut s = self.lock();
        if let Some(instance) = s
            .decision_instances
            .iter_mut()
            .find(|d| d.summary.decision_instance_id == decision_instance_id)
        {
            instance.evaluated_inputs = inputs;
            instance.matched_rules = matched_rules;
        }
    }

    /// Enqueue a unit of work for workers of the given kind.
    pub fn push_job(
        &self,
        kind: &str,
        process_instance_key: InstanceKey,
        element_id: &str,
        variables: Variables,
    ) -> JobKey {
        let mut s = self.lock();
        let key = s.next_key();
        s.job_instances.insert(key, process_instance_key);
        s.job_queues
            .entry(kind.to_string())
            .or_default()
            .push_back(ActivatedJob {
                job_key: key,
                kind: kind.to_string(),
                process_instance_key,
                element_id: element_id.to_string(),
                variables,
                retries: 3,
            });
        key
    }

    pub fn queued_jobs(&self, kind: &str) -> usize {
        self.lock()
            .job_queues
            .get(kind)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn completed_jobs(&self) -> Vec<(JobKey, Variables)> {
        self.lock().completed_jobs.clone()
    }

    pub fn failed_jobs(&self) -> Vec<(JobKey, i32, String)> {
        self.lock().failed_jobs.clone()
    }

    pub fn errored_jobs(&self) -> Vec<(JobKey, String, String)> {
        self.lock().errored_jobs.clone()
    }

    pub fn active_instance_keys(&self) -> Vec<InstanceKey> {
        self.lock()
            .instances
            .values()
            .filter(|i| i.state == ProcessInstanceState::Active)
            .map(|i| i.process_instance_key)
            .collect()
    }
}

fn upsert_variable(s: &mut EngineState, instance_key: InstanceKey, name: &str, value: Value) {
    let encoded = value.to_string();
    if let Some(existing) = s
        .variables
        .iter_mut()
        .find(|v| v.process_instance_key == instance_key && v.name == name)
    {
        existing.value = encoded;
        return;
    }
    let key = s.next_key();
    s.variables.push(VariableResult {
        variable_key: key,
        name: name.to_string(),
        value: encoded,
        process_instance_key: instance_key,
        scope_key: instance_key,
    });
}

fn kind_for_resource(name: &str) -> ResourceKind {
    if name.ends_with(".dmn") {
        ResourceKind::Decision
    } else if name.ends_with(".form") {
        ResourceKind::Form
    } else {
        ResourceKind::Process
    }
}

fn definition_id(name: &str) -> String {
    let stem = name.rsplit('/').next().unwrap_or(name);
    stem.split('.').next().unwrap_or(stem).to_string()
}

fn sorted_most_recent_first(sort: &[SortField]) -> bool {
    sort.iter().any(|s| s.order == SortOrder::Desc)
}

#[async_trait]
impl EngineClient for InProcessEngine {
    async fn deploy(&self, resources: Vec<DeployResource>) -> Result<DeploymentResult> {
        let mut s = self.lock();
        s.record("deploy", resources.len());
        let mut result = DeploymentResult {
            deployment_key: s.next_key(),
            ..Default::default()
        };
        for resource in resources {
            let id = definition_id(&resource.name);
            let kind = kind_for_resource(&resource.name);
            let version = 1 + s
                .resources
                .iter()
                .filter(|r| r.kind == kind && r.definition_id == id)
                .map(|r| r.version)
                .max()
                .unwrap_or(0);
            let key = s.next_key();
            s.resources.push(StoredResource {
                resource_key: key,
                definition_id: id.clone(),
                kind,
                version,
            });
            match kind {
                ResourceKind::Process => result.processes.push(DeployedProcess {
                    process_definition_key: key,
                    process_definition_id: id,
                    version,
                    resource_name: resource.name,
                }),
                ResourceKind::Decision => {
                    let drd_key = s.next_key();
                    s.resources.push(StoredResource {
                        resource_key: drd_key,
                        definition_id: format!("{id}_requirements"),
                        kind: ResourceKind::DecisionRequirements,
                        version,
                    });
                    result.decisions.push(DeployedDecision {
                        decision_definition_key: key,
                        decision_definition_id: id.clone(),
                        version,
                        name: id.clone(),
                        decision_requirements_key: drd_key,
                        resource_name: resource.name.clone(),
                    });
                    result
                        .decision_requirements
                        .push(DeployedDecisionRequirements {
                            decision_requirements_key: drd_key,
                            decision_requirements_id: format!("{id}_requirements"),
                            version,
                            resource_name: resource.name,
                        });
                }
                ResourceKind::Form => result.forms.push(DeployedForm {
                    form_key: key,
                    form_id: id,
                    version,
                    resource_name: resource.name,
                }),
                ResourceKind::DecisionRequirements => {}
            }
        }
        Ok(result)
    }

    async fn delete_resource(&self, resource_key: ResourceKey) -> Result<()> {
        let mut s = self.lock();
        s.record("delete_resource", resource_key);
        if s.fail_next_deletes > 0 {
            s.fail_next_deletes -= 1;
            return Err(EngineError::Engine {
                status: 409,
                message: "resource still referenced".into(),
            });
        }
        let Some(position) = s
            .resources
            .iter()
            .position(|r| r.resource_key == resource_key)
        else {
            return Err(EngineError::not_found("resource", resource_key));
        };
        let definition_id = s.resources[position].definition_id.clone();
        let pinned = s.instances.values().any(|i| {
            i.state == ProcessInstanceState::Active
                && i.process_definition_key == resource_key
                && i.process_definition_id == definition_id
        });
        if pinned {
            return Err(EngineError::Engine {
                status: 409,
                message: format!("active instances still reference {definition_id}"),
            });
        }
        s.resources.remove(position);
        Ok(())
    }

    async fn create_instance(&self, req: CreateInstanceRequest) -> Result<CreateInstanceResult> {
        let mut s = self.lock();
        s.record("create_instance", &req.process_definition_id);
        let Some(definition) = s
            .resources
            .iter()
            .filter(|r| {
                r.kind == ResourceKind::Process && r.definition_id == req.process_definition_id
            })
            .max_by_key(|r| r.version)
            .cloned()
        else {
            return Err(EngineError::not_found(
                "process definition",
                &req.process_definition_id,
            ));
        };
        let key = s.next_key();
        let start = s.next_time();
        s.instances.insert(
            key,
            ProcessInstanceResult {
                process_instance_key: key,
                process_definition_key: definition.resource_key,
                process_definition_id: definition.definition_id.clone(),
                state: ProcessInstanceState::Active,
                has_incident: false,
                start_date: start,
                end_date: None,
            },
        );
        for (name, value) in &req.variables {
            upsert_variable(&mut s, key, name, value.clone());
        }
        Ok(CreateInstanceResult {
            process_instance_key: key,
            process_definition_key: definition.resource_key,
            process_definition_id: definition.definition_id,
            version: definition.version,
        })
    }

    async fn cancel_instance(&self, key: InstanceKey) -> Result<()> {
        let mut s = self.lock();
        s.record("cancel_instance", key);
        if s.fail_next_cancels > 0 {
            s.fail_next_cancels -= 1;
            return Err(EngineError::Engine {
                status: 500,
                message: "broker unavailable".into(),
            });
        }
        let end = s.next_time();
        let Some(instance) = s.instances.get_mut(&key) else {
            return Err(EngineError::not_found("process instance", key));
        };
        if instance.state != ProcessInstanceState::Active {
            return Err(EngineError::Engine {
                status: 409,
                message: format!("instance {key} is not active"),
            });
        }
        instance.state = ProcessInstanceState::Terminated;
        instance.end_date = Some(end);
        Ok(())
    }

    async fn get_process_instance(&self, key: InstanceKey) -> Result<ProcessInstanceResult> {
        let mut s = self.lock();
        s.record("get_process_instance", key);
        if !s.indexed_read() || s.point_lookups_disabled {
            return Err(EngineError::not_found("process instance", key));
        }
        s.instances
            .get(&key)
            .cloned()
            .ok_or_else(|| EngineError::not_found("process instance", key))
    }

    async fn search_process_instances(
        &self,
        req: SearchRequest<ProcessInstanceFilter>,
    ) -> Result<SearchPage<ProcessInstanceResult>> {
        let mut s = self.lock();
        s.record("search_process_instances", "-");
        if !s.indexed_read() {
            return Ok(SearchPage::empty());
        }
        let mut items: Vec<_> = s
            .instances
            .values()
            .filter(|i| {
                req.filter
                    .process_instance_key
                    .map_or(true, |k| i.process_instance_key == k)
                    && req
                        .filter
                        .process_definition_id
                        .as_deref()
                        .map_or(true, |id| i.process_definition_id == id)
                    && req.filter.state.map_or(true, |state| i.state == state)
            })
            .cloned()
            .collect();
        items.sort_by_key(|i| i.start_date);
        if sorted_most_recent_first(&req.sort) {
            items.reverse();
        }
        let total = items.len() as i64;
        items.truncate(req.page.limit as usize);
        Ok(SearchPage { items, total })
    }

    async fn search_element_instances(
        &self,
        req: SearchRequest<ElementInstanceFilter>,
    ) -> Result<SearchPage<ElementInstanceResult>> {
        let mut s = self.lock();
        s.record("search_element_instances", "-");
        if !s.indexed_read() {
            return Ok(SearchPage::empty());
        }
        let mut items: Vec<_> = s
            .element_instances
            .iter()
            .filter(|e| {
                req.filter
                    .process_instance_key
                    .map_or(true, |k| e.process_instance_key == k)
                    && req
                        .filter
                        .element_id
                        .as_deref()
                        .map_or(true, |id| e.element_id == id)
                    && req.filter.state.map_or(true, |state| e.state == state)
            })
            .cloned()
            .collect();
        items.sort_by_key(|e| e.start_date);
        if sorted_most_recent_first(&req.sort) {
            items.reverse();
        }
        let total = items.len() as i64;
        items.truncate(req.page.limit as usize);
        Ok(SearchPage { items, total })
    }

    async fn search_incidents(
        &self,
        req: SearchRequest<IncidentFilter>,
    ) -> Result<SearchPage<IncidentResult>> {
        let mut s = self.lock();
        s.record("search_incidents", "-");
        if !s.indexed_read() {
            return Ok(SearchPage::empty());
        }
        let items: Vec<_> = s
            .incidents
            .iter()
            .filter(|i| {
                req.filter
                    .process_instance_key
                    .map_or(true, |k| i.process_instance_key == k)
                    && req.filter.state.map_or(true, |state| i.state == state)
            })
            .cloned()
            .collect();
        let total = items.len() as i64;
        Ok(SearchPage { items, total })
    }

    async fn search_variables(
        &self,
        req: SearchRequest<VariableFilter>,
    ) -> Result<SearchPage<VariableResult>> {
        let mut s = self.lock();
        s.record("search_variables", "-");
        if !s.indexed_read() {
            return Ok(SearchPage::empty());
        }
        let items: Vec<_> = s
            .variables
            .iter()
            .filter(|v| {
                req.filter
                    .process_instance_key
                    .map_or(true, |k| v.process_instance_key == k)
                    && req.filter.name.as_deref().map_or(true, |n| v.name == n)
            })
            .cloned()
            .collect();
        let total = items.len() as i64;
        Ok(SearchPage { items, total })
    }

    async fn search_user_tasks(
        &self,
        req: SearchRequest<UserTaskFilter>,
    ) -> Result<SearchPage<UserTaskResult>> {
        let mut s = self.lock();
        s.record("search_user_tasks", "-");
        if !s.indexed_read() {
            return Ok(SearchPage::empty());
        }
        let mut items: Vec<_> = s
            .user_tasks
            .values()
            .filter(|t| {
                req.filter
                    .user_task_key
                    .map_or(true, |k| t.user_task_key == k)
                    && req
                        .filter
                        .element_id
                        .as_deref()
                        .map_or(true, |id| t.element_id == id)
                    && req
                        .filter
                        .name
                        .as_deref()
                        .map_or(true, |n| t.name.as_deref() == Some(n))
                    && req
                        .filter
                        .process_instance_key
                        .map_or(true, |k| t.process_instance_key == k)
                    && req.filter.state.map_or(true, |state| t.state == state)
            })
            .cloned()
            .collect();
        items.sort_by_key(|t| t.creation_date);
        if sorted_most_recent_first(&req.sort) {
            items.reverse();
        }
        let total = items.len() as i64;
        items.truncate(req.page.limit as usize);
        Ok(SearchPage { items, total })
    }

    async fn complete_user_task(&self, key: UserTaskKey, variables: Variables) -> Result<()> {
        let mut s = self.lock();
        s.record("complete_user_task", key);
        let Some(task) = s.user_tasks.get_mut(&key) else {
            return Err(EngineError::not_found("user task", key));
        };
        task.state = UserTaskState::Completed;
        let instance_key = task.process_instance_key;
        for (name, value) in variables {
            upsert_variable(&mut s, instance_key, &name, value);
        }
        Ok(())
    }

    async fn assign_user_task(&self, key: UserTaskKey, assignee: &str) -> Result<()> {
        let mut s = self.lock();
        s.record("assign_user_task", key);
        let Some(task) = s.user_tasks.get_mut(&key) else {
            return Err(EngineError::not_found("user task", key));
        };
        task.assignee = Some(assignee.to_string());
        Ok(())
    }

    async fn evaluate_decision(
        &self,
        req: EvaluateDecisionRequest,
    ) -> Result<EvaluateDecisionResult> {
        let mut s = self.lock();
        s.record("evaluate_decision", &req.decision_definition_id);
        let Some(definition) = s
            .resources
            .iter()
            .filter(|r| {
                r.kind == ResourceKind::Decision && r.definition_id == req.decision_definition_id
            })
            .max_by_key(|r| r.version)
            .cloned()
        else {
            return Err(EngineError::not_found(
                "decision definition",
                &req.decision_definition_id,
            ));
        };
        let result = s
            .decision_stubs
            .get(&definition.definition_id)
            .cloned()
            .unwrap_or(Value::Null)
            .to_string();
        let key = s.next_key();
        let evaluated = s.next_time();
        s.decision_instances.push(DecisionInstanceGetResult {
            summary: DecisionInstanceResult {
                decision_instance_key: key,
                decision_instance_id: format!("{key}-1"),
                state: DecisionInstanceState::Evaluated,
                decision_definition_id: definition.definition_id.clone(),
                decision_definition_key: definition.resource_key,
                decision_definition_name: Some(definition.definition_id.clone()),
                decision_definition_version: definition.version,
                process_instance_key: None,
                result: result.clone(),
                evaluation_date: evaluated,
            },
            evaluated_inputs: Vec::new(),
            matched_rules: Vec::new(),
        });
        Ok(EvaluateDecisionResult {
            decision_instance_key: key,
            decision_definition_id: definition.definition_id,
            result,
        })
    }

    async fn search_decision_instances(
        &self,
        req: SearchRequest<DecisionInstanceFilter>,
    ) -> Result<SearchPage<DecisionInstanceResult>> {
        let mut s = self.lock();
        s.record("search_decision_instances", "-");
        if !s.indexed_read() {
            return Ok(SearchPage::empty());
        }
        let mut items: Vec<_> = s
            .decision_instances
            .iter()
            .map(|d| d.summary.clone())
            .filter(|d| {
                req.filter
                    .decision_instance_key
                    .map_or(true, |k| d.decision_instance_key == k)
                    && req
                        .filter
                        .decision_definition_id
                        .as_deref()
                        .map_or(true, |id| d.decision_definition_id == id)
                    && req
                        .filter
                        .process_instance_key
                        .map_or(true, |k| d.process_instance_key == Some(k))
                    && req.filter.state.map_or(true, |state| d.state == state)
            })
            .collect();
        items.sort_by_key(|d| d.evaluation_date);
        if sorted_most_recent_first(&req.sort) {
            items.reverse();
        }
        let total = items.len() as i64;
        items.truncate(req.page.limit as usize);
        Ok(SearchPage { items, total })
    }

    async fn get_decision_instance(&self, id: &str) -> Result<DecisionInstanceGetResult> {
        let mut s = self.lock();
        s.record("get_decision_instance", id);
        if !s.indexed_read() || s.point_lookups_disabled {
            return Err(EngineError::not_found("decision instance", id));
        }
        s.decision_instances
            .iter()
            .find(|d| d.summary.decision_instance_id == id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("decision instance", id))
    }

    async fn activate_jobs(&self, req: ActivateJobsRequest) -> Result<Vec<ActivatedJob>> {
        let mut s = self.lock();
        s.record("activate_jobs", &req.kind);
        let mut activated = Vec::new();
        if let Some(queue) = s.job_queues.get_mut(&req.kind) {
            while activated.len() < req.max_jobs as usize {
                match queue.pop_front() {
                    Some(job) => activated.push(job),
                    None => break,
                }
            }
        }
        Ok(activated)
    }

    async fn complete_job(&self, key: JobKey, variables: Variables) -> Result<()> {
        let mut s = self.lock();
        s.record("complete_job", key);
        // Mirror the engine: completion variables land in instance scope.
        if let Some(instance_key) = s.job_instances.get(&key).copied() {
            for (name, value) in &variables {
                upsert_variable(&mut s, instance_key, name, value.clone());
            }
        }
        s.completed_jobs.push((key, variables));
        Ok(())
    }

    async fn fail_job(&self, key: JobKey, retries: i32, message: &str) -> Result<()> {
        let mut s = self.lock();
        s.record("fail_job", key);
        s.failed_jobs.push((key, retries, message.to_string()));
        Ok(())
    }

    async fn throw_job_error(&self, key: JobKey, code: &str, message: &str) -> Result<()> {
        let mut s = self.lock();
        s.record("throw_job_error", key);
        s.errored_jobs
            .push((key, code.to_string(), message.to_string()));
        Ok(())
    }

    async fn broadcast_signal(&self, name: &str, _variables: Variables) -> Result<()> {
        let mut s = self.lock();
        s.record("broadcast_signal", name);
        Ok(())
    }

    async fn publish_message(&self, req: PublishMessageRequest) -> Result<()> {
        let mut s = self.lock();
        s.record("publish_message", &req.name);
        Ok(())
    }

    async fn topology(&self) -> Result<Topology> {
        let s = self.lock();
        Ok(s.topology.clone().unwrap_or_else(|| Topology {
            brokers: vec![BrokerInfo {
                node_id: 0,
                host: "localhost".into(),
                port: 26501,
                partitions: vec![PartitionInfo {
                    partition_id: 1,
                    role: PartitionRole::Leader,
                    health: PartitionHealth::Healthy,
                }],
            }],
            partitions_count: 1,
        }))
    }

    async fn clock_current_millis(&self) -> Result<i64> {
        let s = self.lock();
        Ok(Utc::now().timestamp_millis() + s.clock_offset_ms)
    }

    async fn clock_add(&self, offset: Duration) -> Result<()> {
        let mut s = self.lock();
        s.record("clock_add", offset.as_millis());
        s.clock_offset_ms += offset.as_millis() as i64;
        Ok(())
    }

    async fn clock_reset(&self) -> Result<()> {
        let mut s = self.lock();
        s.record("clock_reset", "-");
        s.clock_offset_ms = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bpmn(name: &str) -> DeployResource {
        DeployResource {
            name: name.to_string(),
            content: "<definitions/>".to_string(),
        }
    }

    #[tokio::test]
    async fn deploy_assigns_versions_per_definition_id() {
        let engine = InProcessEngine::new();
        let first = engine.deploy(vec![bpmn("order.bpmn")]).await.unwrap();
        let second = engine.deploy(vec![bpmn("order.bpmn")]).await.unwrap();
        assert_eq!(first.processes[0].version, 1);
        assert_eq!(second.processes[0].version, 2);
    }

    #[tokio::test]
    async fn create_instance_against_unknown_definition_is_not_found() {
        let engine = InProcessEngine::new();
        let err = engine
            .create_instance(CreateInstanceRequest {
                process_definition_id: "missing".into(),
                variables: Variables::new(),
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_fails_while_an_active_instance_pins_the_definition() {
        let engine = InProcessEngine::new();
        let deployed = engine.deploy(vec![bpmn("order.bpmn")]).await.unwrap();
        let resource_key = deployed.processes[0].process_definition_key;
        let created = engine
            .create_instance(CreateInstanceRequest {
                process_definition_id: "order".into(),
                variables: Variables::new(),
            })
            .await
            .unwrap();

        let err = engine.delete_resource(resource_key).await.unwrap_err();
        assert!(matches!(err, EngineError::Engine { status: 409, .. }));

        engine
            .cancel_instance(created.process_instance_key)
            .await
            .unwrap();
        engine.delete_resource(resource_key).await.unwrap();
    }

    #[tokio::test]
    async fn indexing_lag_hides_reads_then_clears() {
        let engine = InProcessEngine::new();
        engine.deploy(vec![bpmn("order.bpmn")]).await.unwrap();
        engine
            .create_instance(CreateInstanceRequest {
                process_definition_id: "order".into(),
                variables: Variables::new(),
            })
            .await
            .unwrap();

        engine.set_indexing_lag(1);
        let req = SearchRequest::filtered(ProcessInstanceFilter::default());
        let lagged = engine.search_process_instances(req.clone()).await.unwrap();
        assert!(lagged.items.is_empty());
        let visible = engine.search_process_instances(req).await.unwrap();
        assert_eq!(visible.items.len(), 1);
    }
}
