//! Job-worker mock dispatcher.
//!
//! A mock worker lets test code stand in for a real task executor: it
//! registers against the engine for one task type with a concurrency limit
//! of exactly one, claims the first unit of work that arrives, stops
//! accepting further work *before* invoking the configured behavior, and
//! resolves exactly once. If the behavior itself fails, the unit of work is
//! reported failed through the engine's failure channel — the mock's own
//! future still resolves Ok, so a deliberate failure behavior never crashes
//! the test that configured it.
//!
//! Registration is lazy: nothing talks to the engine until a terminal
//! method (`complete_with`, `fail_with`, ...) is awaited. Repeated
//! configuration queues behaviors that [`MockJobWorker::resume`] replays
//! round-robin — an opt-in reuse path; the primary contract is single-shot.

use flowtest_client::types::{ActivateJobsRequest, ActivatedJob, JobKey, Variables};
use flowtest_client::EngineClient;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Polling interval while waiting for a unit of work.
const ACTIVATION_INTERVAL: Duration = Duration::from_millis(50);

/// Backoff after an activation error.
const ERROR_BACKOFF: Duration = Duration::from_millis(1000);

/// How long a claimed job stays locked to the mock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type Handler = Arc<dyn Fn(ActivatedJob, Arc<dyn EngineClient>) -> HandlerFuture + Send + Sync>;

#[derive(Clone)]
enum Behavior {
    Complete(Variables),
    Fail { message: String, retries: i32 },
    BusinessError { code: String, message: String },
    DoNothing,
    Custom(Handler),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("no behavior queued for task type \"{0}\"; configure one first")]
    NothingQueued(String),
}

pub struct MockJobWorker {
    client: Arc<dyn EngineClient>,
    kind: String,
    worker_name: String,
    behaviors: VecDeque<Behavior>,
}

impl MockJobWorker {
    pub fn for_kind(client: Arc<dyn EngineClient>, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        Self {
            client,
            worker_name: format!("flowtest-mock-{kind}"),
            kind,
            behaviors: VecDeque::new(),
        }
    }

    // ── Terminal configuration ──
    //
    // Each queues one behavior, registers, and resolves once the first
    // unit of work has been handled.

    /// Complete the job without variables.
    pub async fn complete(&mut self) -> Result<(), WorkerError> {
        self.behaviors.push_back(Behavior::Complete(Variables::new()));
        self.handle_one().await
    }

    /// Complete the job with output variables.
    pub async fn complete_with(&mut self, variables: Variables) -> Result<(), WorkerError> {
        self.behaviors.push_back(Behavior::Complete(variables));
        self.handle_one().await
    }

    /// Fail the job, leaving `retries` attempts for a real or subsequent
    /// worker.
    pub async fn fail_with(&mut self, message: &str, retries: i32) -> Result<(), WorkerError> {
        self.behaviors.push_back(Behavior::Fail {
            message: message.to_string(),
            retries,
        });
        self.handle_one().await
    }

    /// Raise a business error, routed to error boundary events.
    pub async fn throw_business_error(
        &mut self,
        code: &str,
        message: &str,
    ) -> Result<(), WorkerError> {
        self.behaviors.push_back(Behavior::BusinessError {
            code: code.to_string(),
            message: message.to_string(),
        });
        self.handle_one().await
    }

    /// Claim the job and leave it untouched; it returns to the engine when
    /// its lock expires.
    pub async fn do_nothing(&mut self) -> Result<(), WorkerError> {
        self.behaviors.push_back(Behavior::DoNothing);
        self.handle_one().await
    }

    /// Run an arbitrary handler against the claimed job. A handler `Err`
    /// reports the job failed to the engine; the mock still resolves Ok.
    pub async fn with_handler<F, Fut>(&mut self, handler: F) -> Result<(), WorkerError>
    where
        F: Fn(ActivatedJob, Arc<dyn EngineClient>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |job, client| Box::pin(handler(job, client)));
        self.behaviors.push_back(Behavior::Custom(handler));
        self.handle_one().await
    }

    /// Reuse path: register again and replay the queued behaviors
    /// round-robin against the next unit of work.
    pub async fn resume(&mut self) -> Result<(), WorkerError> {
        self.handle_one().await
    }

    // ── Dispatch ──

    /// Claim exactly one job, stop accepting work, then run the next
    /// queued behavior against it.
    async fn handle_one(&mut self) -> Result<(), WorkerError> {
        if self.behaviors.is_empty() {
            return Err(WorkerError::NothingQueued(self.kind.clone()));
        }
        let job = self.claim_one().await;
        // The activation loop above has already exited: from here on this
        // mock claims nothing further, however slow the behavior is.
        let behavior = self.behaviors.pop_front().expect("behavior queue checked");
        self.behaviors.push_back(behavior.clone());
        self.run_behavior(&job, behavior).await;
        Ok(())
    }

    async fn claim_one(&self) -> ActivatedJob {
        loop {
            let request = ActivateJobsRequest {
                kind: self.kind.clone(),
                worker_name: self.worker_name.clone(),
                max_jobs: 1,
                lock_timeout_ms: LOCK_TIMEOUT.as_millis() as u64,
                request_timeout_ms: ACTIVATION_INTERVAL.as_millis() as u64,
            };
            match self.client.activate_jobs(request).await {
                Ok(mut jobs) if !jobs.is_empty() => {
                    let job = jobs.remove(0);
                    debug!(kind = %self.kind, job_key = job.job_key, "unit of work claimed");
                    return job;
                }
                Ok(_) => tokio::time::sleep(ACTIVATION_INTERVAL).await,
                Err(error) => {
                    warn!(kind = %self.kind, %error, "job activation failed, backing off");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    async fn run_behavior(&self, job: &ActivatedJob, behavior: Behavior) {
        let outcome: Result<(), String> = match behavior {
            Behavior::Complete(variables) => self
                .client
                .complete_job(job.job_key, variables)
                .await
                .map_err(|e| e.to_string()),
            Behavior::Fail { message, retries } => self
                .client
                .fail_job(job.job_key, retries, &message)
                .await
                .map_err(|e| e.to_string()),
            Behavior::BusinessError { code, message } => self
                .client
                .throw_job_error(job.job_key, &code, &message)
                .await
                .map_err(|e| e.to_string()),
            Behavior::DoNothing => Ok(()),
            Behavior::Custom(handler) => handler(job.clone(), self.client.clone()).await,
        };
        if let Err(message) = outcome {
            self.report_failed(job.job_key, job.retries, &message).await;
        }
    }

    /// A failing behavior must not leave the unit of work outstanding:
    /// report it failed so the engine can retry or raise an incident.
    async fn report_failed(&self, job_key: JobKey, retries: i32, message: &str) {
        let remaining = (retries - 1).max(0);
        if let Err(error) = self.client.fail_job(job_key, remaining, message).await {
            warn!(
                job_key,
                %error,
                "could not report failed unit of work to the engine"
            );
        } else {
            debug!(job_key, message, "unit of work reported failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtest_client::inprocess::InProcessEngine;
    use serde_json::json;

    fn engine_with_job(kind: &str) -> (InProcessEngine, JobKey) {
        let engine = InProcessEngine::new();
        let job_key = engine.push_job(kind, 9001, "task_a", Variables::new());
        (engine, job_key)
    }

    #[tokio::test]
    async fn completes_the_first_unit_of_work() {
        let (engine, job_key) = engine_with_job("payment");
        let mut worker = MockJobWorker::for_kind(Arc::new(engine.clone()), "payment");

        let mut variables = Variables::new();
        variables.insert("paid".into(), json!(true));
        worker.complete_with(variables).await.unwrap();

        let completed = engine.completed_jobs();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].0, job_key);
        assert_eq!(completed[0].1.get("paid"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn single_shot_leaves_later_jobs_unclaimed() {
        let (engine, _first) = engine_with_job("payment");
        let mut worker = MockJobWorker::for_kind(Arc::new(engine.clone()), "payment");
        worker.complete().await.unwrap();

        // A second unit of the same type arrives after the mock resolved.
        engine.push_job("payment", 9002, "task_a", Variables::new());
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(engine.completed_jobs().len(), 1);
        assert_eq!(engine.queued_jobs("payment"), 1, "second job must stay queued");
    }

    #[tokio::test]
    async fn waits_for_work_to_arrive() {
        let engine = InProcessEngine::new();
        let mut worker = MockJobWorker::for_kind(Arc::new(engine.clone()), "payment");

        let pusher = {
            let engine = engine.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                engine.push_job("payment", 9001, "task_a", Variables::new());
            })
        };
        worker.complete().await.unwrap();
        pusher.await.unwrap();
        assert_eq!(engine.completed_jobs().len(), 1);
    }

    #[tokio::test]
    async fn fail_with_uses_the_engine_failure_channel() {
        let (engine, job_key) = engine_with_job("payment");
        let mut worker = MockJobWorker::for_kind(Arc::new(engine.clone()), "payment");
        worker.fail_with("card declined", 2).await.unwrap();

        let failed = engine.failed_jobs();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0], (job_key, 2, "card declined".to_string()));
    }

    #[tokio::test]
    async fn business_errors_are_thrown_not_failed() {
        let (engine, job_key) = engine_with_job("payment");
        let mut worker = MockJobWorker::for_kind(Arc::new(engine.clone()), "payment");
        worker
            .throw_business_error("INSUFFICIENT_FUNDS", "balance too low")
            .await
            .unwrap();

        let errored = engine.errored_jobs();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].0, job_key);
        assert_eq!(errored[0].1, "INSUFFICIENT_FUNDS");
        assert!(engine.failed_jobs().is_empty());
    }

    #[tokio::test]
    async fn handler_error_reports_failure_and_still_resolves() {
        let (engine, job_key) = engine_with_job("payment");
        let mut worker = MockJobWorker::for_kind(Arc::new(engine.clone()), "payment");

        let result = worker
            .with_handler(|_job, _client| async { Err("handler exploded".to_string()) })
            .await;

        assert!(result.is_ok(), "behavior failures must not reject the mock");
        let failed = engine.failed_jobs();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, job_key);
        assert_eq!(failed[0].2, "handler exploded");
    }

    #[tokio::test]
    async fn do_nothing_claims_without_reporting() {
        let (engine, _job_key) = engine_with_job("payment");
        let mut worker = MockJobWorker::for_kind(Arc::new(engine.clone()), "payment");
        worker.do_nothing().await.unwrap();

        assert!(engine.completed_jobs().is_empty());
        assert!(engine.failed_jobs().is_empty());
        assert_eq!(engine.queued_jobs("payment"), 0, "job was claimed");
    }

    #[tokio::test]
    async fn resume_replays_behaviors_round_robin() {
        let (engine, _first) = engine_with_job("payment");
        let mut worker = MockJobWorker::for_kind(Arc::new(engine.clone()), "payment");
        worker.complete().await.unwrap();

        engine.push_job("payment", 9002, "task_a", Variables::new());
        worker.resume().await.unwrap();

        assert_eq!(engine.completed_jobs().len(), 2);
    }

    #[tokio::test]
    async fn resume_without_configuration_is_an_error() {
        let engine = InProcessEngine::new();
        let mut worker = MockJobWorker::for_kind(Arc::new(engine), "payment");
        let err = worker.resume().await.unwrap_err();
        assert!(matches!(err, WorkerError::NothingQueued(_)));
    }
}
