//! Resource & instance tracker teardown: cancel-before-delete ordering,
//! per-item error collection, retried deletion, and idempotency.

use flowtest_client::inprocess::InProcessEngine;
use flowtest_client::types::Variables;
use flowtest_core::assert::AssertionSettings;
use flowtest_core::config::RuntimeMode;
use flowtest_core::context::TestContext;
use std::path::PathBuf;
use std::sync::Arc;

fn context(engine: &InProcessEngine) -> TestContext {
    TestContext::new(
        Arc::new(engine.clone()),
        RuntimeMode::Managed,
        AssertionSettings::default(),
    )
}

/// Write a process file into a temp dir so deployment goes through the
/// context's file-reading path.
fn process_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, "<definitions/>").unwrap();
    path
}

#[tokio::test(start_paused = true)]
async fn every_cancellation_precedes_every_deletion() {
    let engine = InProcessEngine::new();
    let ctx = context(&engine);
    let dir = tempfile::tempdir().unwrap();

    ctx.deploy_resources(&[process_file(&dir, "one.bpmn"), process_file(&dir, "two.bpmn")])
        .await
        .unwrap();
    ctx.create_instance("one", Variables::new()).await.unwrap();
    ctx.create_instance("two", Variables::new()).await.unwrap();

    let report = ctx.cleanup().await;
    assert!(report.is_clean(), "unexpected failures: {:?}", report.errors);

    let calls = engine.calls();
    let last_cancel = calls
        .iter()
        .rposition(|c| c.starts_with("cancel_instance"))
        .expect("cancellations must have happened");
    let first_delete = calls
        .iter()
        .position(|c| c.starts_with("delete_resource"))
        .expect("deletions must have happened");
    assert!(
        last_cancel < first_delete,
        "cancel/delete interleaved: {calls:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn deletion_is_retried_through_transient_conflicts() {
    let engine = InProcessEngine::new();
    let ctx = context(&engine);
    let dir = tempfile::tempdir().unwrap();

    ctx.deploy_resource(process_file(&dir, "one.bpmn"))
        .await
        .unwrap();
    ctx.create_instance("one", Variables::new()).await.unwrap();

    // The engine holds the definition reference for a moment after the
    // instance is cancelled.
    engine.fail_next_deletes(2);
    let report = ctx.cleanup().await;
    assert!(report.is_clean(), "unexpected failures: {:?}", report.errors);

    let delete_attempts = engine
        .calls()
        .iter()
        .filter(|c| c.starts_with("delete_resource"))
        .count();
    assert_eq!(delete_attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn one_failure_does_not_stop_the_other_items() {
    let engine = InProcessEngine::new();
    let ctx = context(&engine);
    let dir = tempfile::tempdir().unwrap();

    ctx.deploy_resources(&[process_file(&dir, "one.bpmn"), process_file(&dir, "two.bpmn")])
        .await
        .unwrap();
    ctx.create_instance("one", Variables::new()).await.unwrap();
    ctx.create_instance("two", Variables::new()).await.unwrap();

    // The first cancellation hits a hard engine failure, which also leaves
    // that instance pinning its definition.
    engine.fail_next_cancels(1);
    let report = ctx.cleanup().await;

    // Collected: the failed cancellation, plus the deletion of the still-
    // pinned definition timing out. Nothing was skipped because of them.
    assert_eq!(report.errors.len(), 2, "errors: {:?}", report.errors);
    assert!(report.errors[0].to_string().contains("broker unavailable"));

    let calls = engine.calls();
    assert_eq!(
        calls
            .iter()
            .filter(|c| c.starts_with("cancel_instance"))
            .count(),
        2
    );
    assert!(
        calls
            .iter()
            .filter(|c| c.starts_with("delete_resource"))
            .count()
            >= 2,
        "both resources must have had deletion attempted"
    );

    // A failed cleanup still leaves nothing tracked for the next test.
    assert_eq!(ctx.tracked_instance_count(), 0);
    assert_eq!(ctx.tracked_resource_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stuck_deletion_is_collected_after_its_retry_window() {
    let engine = InProcessEngine::new();
    let ctx = context(&engine);
    let dir = tempfile::tempdir().unwrap();

    ctx.deploy_resource(process_file(&dir, "one.bpmn"))
        .await
        .unwrap();

    engine.fail_next_deletes(100);
    let report = ctx.cleanup().await;

    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].to_string().contains("deleted"));
    assert_eq!(ctx.tracked_resource_count(), 0);
}

#[tokio::test]
async fn empty_teardown_makes_no_engine_calls() {
    let engine = InProcessEngine::new();
    let ctx = context(&engine);

    let first = ctx.cleanup().await;
    let second = ctx.cleanup().await;

    assert!(first.is_clean());
    assert!(second.is_clean());
    assert_eq!(engine.call_count(), 0);
}

#[tokio::test]
async fn clear_tracking_forgets_without_engine_calls() {
    let engine = InProcessEngine::new();
    let ctx = context(&engine);
    let dir = tempfile::tempdir().unwrap();

    ctx.deploy_resource(process_file(&dir, "one.bpmn"))
        .await
        .unwrap();
    ctx.create_instance("one", Variables::new()).await.unwrap();
    let calls_after_setup = engine.call_count();

    ctx.clear_tracking();
    assert_eq!(ctx.tracked_instance_count(), 0);
    assert_eq!(ctx.tracked_resource_count(), 0);

    let report = ctx.cleanup().await;
    assert!(report.is_clean());
    assert_eq!(engine.call_count(), calls_after_setup);
}

#[tokio::test(start_paused = true)]
async fn already_finished_instances_are_acceptable_noise() {
    let engine = InProcessEngine::new();
    let ctx = context(&engine);
    let dir = tempfile::tempdir().unwrap();

    ctx.deploy_resource(process_file(&dir, "one.bpmn"))
        .await
        .unwrap();
    let created = ctx.create_instance("one", Variables::new()).await.unwrap();

    // The instance finishes on its own before teardown runs.
    engine.set_instance_state(
        created.process_instance_key,
        flowtest_client::types::ProcessInstanceState::Completed,
    );

    let report = ctx.cleanup().await;
    assert!(report.is_clean(), "a 409 on cancel is noise, not a failure");
}
