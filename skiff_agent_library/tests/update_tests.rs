#[macro_use]
pub mod utils;

use crate::utils::*;
use skiff_agent_library::error::status_from_error;
use skiff_agent_library::services::containers::structs::{ContainerSpec, RestartPolicy, RuntimeError};
use skiff_agent_library::services::update::{InstanceLocks, UpdateOrchestrator, UpdateOutcome, UpdateReport};
use skiff_library::transaction::TEST_TID;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tonic::Code;

struct Harness {
    _dir: TempDir,
    runtime: Arc<FakeRuntime>,
    orchestrator: Arc<UpdateOrchestrator>,
    reports: UnboundedReceiver<UpdateReport>,
}

/// `web` runs `app:1` publishing 8080, and `app:2` is available to update to
fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir, None);
    let runtime = FakeRuntime::new();
    runtime.add_image("app:1", 100);
    runtime.add_image("app:2", 120);
    runtime.add_container(spec("web", "app", "1", &["8080:80"]), true);
    let (tx, reports) = unbounded_channel();
    let orchestrator =
        UpdateOrchestrator::with_completion_notifier(runtime.clone(), InstanceLocks::new(), cfg.update.clone(), tx);
    Harness {
        _dir: dir,
        runtime,
        orchestrator,
        reports,
    }
}

fn target() -> ContainerSpec {
    spec("web", "app", "2", &["8080:80"])
}

/// The container-mutating calls, in order
fn mutations(runtime: &FakeRuntime) -> Vec<String> {
    runtime
        .calls()
        .into_iter()
        .filter(|c| !c.starts_with("list_") && !c.starts_with("inspect_"))
        .collect()
}

fn assert_running(runtime: &FakeRuntime, tag: &str) {
    let web = runtime.container("web").expect("web should exist");
    assert_eq!(web.spec.tag, tag);
    assert!(web.running, "web should be running");
}

#[tokio::test]
async fn update_replaces_instance() {
    let mut h = harness();

    let name = h.orchestrator.update(target(), None, &TEST_TID).await.unwrap();

    assert_eq!(name, "web");
    assert_running(&h.runtime, "2");
    assert_eq!(
        mutations(&h.runtime),
        vec![
            "stop_container web",
            "remove_container web",
            "create_container web",
            "start_container web"
        ]
    );
    let report = h.reports.recv().await.unwrap();
    assert_eq!(report.outcome, UpdateOutcome::Success);
    assert_eq!(report.instance, "web");
    assert!(report.error.is_none());
    assert!(h.orchestrator.locks().is_empty());
}

#[tokio::test]
async fn update_keeps_full_configuration() {
    let h = harness();
    let mut new = target();
    new.env = vec!["MODE=edge".to_string()];
    new.volumes = vec!["data:/data".to_string()];
    new.restart_policy = Some(RestartPolicy::from_str("always").unwrap());

    h.orchestrator.update(new.clone(), None, &TEST_TID).await.unwrap();

    assert_eq!(h.runtime.container("web").unwrap().spec, new);
}

#[tokio::test]
async fn missing_image_is_rejected_without_touching_instance() {
    let h = harness();
    let mut new = target();
    new.tag = "3".to_string();

    let res = h.orchestrator.update(new, None, &TEST_TID).await;

    let err = res.unwrap_err();
    assert_eq!(err.to_string(), "image 'app:3' not found");
    assert_eq!(status_from_error(&err).code(), Code::NotFound);
    assert!(mutations(&h.runtime).is_empty());
    assert_running(&h.runtime, "1");
}

#[tokio::test]
async fn missing_instance_is_rejected() {
    let h = harness();
    let mut new = target();
    new.name = "ghost".to_string();

    let res = h.orchestrator.update(new, None, &TEST_TID).await;

    let err = res.unwrap_err();
    assert_eq!(err.to_string(), "instance 'ghost' not found");
    assert_eq!(status_from_error(&err).code(), Code::NotFound);
    assert!(mutations(&h.runtime).is_empty());
}

#[tokio::test]
async fn port_held_by_another_instance_is_rejected() {
    let h = harness();
    h.runtime.add_container(spec("db", "app", "1", &["9090:90"]), true);
    let mut new = target();
    new.ports = vec!["9090:80".parse().unwrap()];

    let res = h.orchestrator.update(new, None, &TEST_TID).await;

    let err = res.unwrap_err();
    assert_eq!(err.to_string(), "port 9090 is already in use by 'db'");
    assert_eq!(status_from_error(&err).code(), Code::AlreadyExists);
    assert!(mutations(&h.runtime).is_empty());
    assert_running(&h.runtime, "1");
}

#[tokio::test]
async fn held_instance_cannot_be_updated() {
    let h = harness();
    let _held = h.orchestrator.locks().try_acquire("web").unwrap();

    let res = h.orchestrator.update(target(), None, &TEST_TID).await;

    let err = res.unwrap_err();
    assert_eq!(err.to_string(), "instance 'web' is already being updated");
    assert_eq!(status_from_error(&err).code(), Code::Unavailable);
    assert!(mutations(&h.runtime).is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_update_of_same_instance_fails_fast() {
    let mut h = harness();
    h.runtime.delay_next("stop_container", Duration::from_secs(5));

    let name = h.orchestrator.update_async(target(), None, &TEST_TID).await.unwrap();
    assert_eq!(name, "web");
    assert!(h.orchestrator.locks().is_locked("web"));

    let second = h.orchestrator.update(target(), None, &TEST_TID).await;
    assert_error!(
        second,
        "instance 'web' is already being updated",
        "second update of a busy instance went through"
    );

    let report = h.reports.recv().await.unwrap();
    assert_eq!(report.outcome, UpdateOutcome::Success);
    assert_running(&h.runtime, "2");
    assert!(h.orchestrator.locks().is_empty());
}

#[tokio::test]
async fn different_instances_update_independently() {
    let mut h = harness();
    h.runtime.add_container(spec("db", "app", "1", &["9090:90"]), true);

    let (a, b) = tokio::join!(
        h.orchestrator.update(target(), None, &TEST_TID),
        h.orchestrator
            .update(spec("db", "app", "2", &["9090:90"]), None, &TEST_TID)
    );

    assert!(a.is_ok(), "{:?}", a);
    assert!(b.is_ok(), "{:?}", b);
    assert_eq!(h.reports.recv().await.unwrap().outcome, UpdateOutcome::Success);
    assert_eq!(h.reports.recv().await.unwrap().outcome, UpdateOutcome::Success);
}

#[tokio::test]
async fn stopped_instance_is_still_updated() {
    let h = harness();
    h.runtime.add_container(spec("web", "app", "1", &["8080:80"]), false);

    h.orchestrator.update(target(), None, &TEST_TID).await.unwrap();

    assert_running(&h.runtime, "2");
}

#[tokio::test]
async fn stop_failure_aborts_before_any_change() {
    let h = harness();
    h.runtime
        .fail_next("stop_container", RuntimeError::Internal("daemon hung".to_string()));

    let res = h.orchestrator.update(target(), None, &TEST_TID).await;

    let err = res.unwrap_err();
    assert_eq!(err.to_string(), "failed to stop 'web'");
    assert_eq!(status_from_error(&err).code(), Code::Internal);
    assert_eq!(mutations(&h.runtime), vec!["stop_container web"]);
    assert_running(&h.runtime, "1");
    assert!(h.orchestrator.locks().is_empty());
}

#[tokio::test]
async fn remove_failure_restarts_old_instance() {
    let mut h = harness();
    h.runtime
        .fail_next("remove_container", RuntimeError::Internal("device busy".to_string()));

    let res = h.orchestrator.update(target(), None, &TEST_TID).await;

    let err = res.unwrap_err();
    assert_eq!(
        err.to_string(),
        "update of 'web' failed: failed to remove old instance: container runtime failure: device busy; previous state restored"
    );
    assert_eq!(status_from_error(&err).code(), Code::Aborted);
    assert_running(&h.runtime, "1");
    assert_eq!(h.reports.recv().await.unwrap().outcome, UpdateOutcome::RolledBack);
}

#[tokio::test]
async fn remove_and_restart_failure_is_data_loss() {
    let mut h = harness();
    h.runtime
        .fail_next("remove_container", RuntimeError::Internal("device busy".to_string()));
    h.runtime
        .fail_next("start_container", RuntimeError::Internal("no memory".to_string()));

    let res = h.orchestrator.update(target(), None, &TEST_TID).await;

    let err = res.unwrap_err();
    assert_eq!(status_from_error(&err).code(), Code::DataLoss);
    let web = h.runtime.container("web").unwrap();
    assert!(!web.running);
    let report = h.reports.recv().await.unwrap();
    assert_eq!(report.outcome, UpdateOutcome::Failed);
    assert!(report.error.unwrap().contains("rollback failed"));
}

#[tokio::test]
async fn new_instance_that_will_not_start_is_rolled_back() {
    let mut h = harness();
    h.runtime
        .fail_next("start_container", RuntimeError::Internal("exec format error".to_string()));

    let res = h.orchestrator.update(target(), None, &TEST_TID).await;

    let err = res.unwrap_err();
    assert_eq!(
        err.to_string(),
        "update of 'web' failed: container runtime failure: exec format error; previous state restored"
    );
    assert_eq!(status_from_error(&err).code(), Code::Aborted);
    assert_running(&h.runtime, "1");
    assert_eq!(
        h.runtime.container("web").unwrap().spec,
        spec("web", "app", "1", &["8080:80"])
    );
    assert_eq!(h.reports.recv().await.unwrap().outcome, UpdateOutcome::RolledBack);
}

#[tokio::test]
async fn create_failure_is_rolled_back() {
    let h = harness();
    h.runtime
        .fail_next("create_container", RuntimeError::Conflict("name in use".to_string()));

    let res = h.orchestrator.update(target(), None, &TEST_TID).await;

    let err = res.unwrap_err();
    assert_eq!(status_from_error(&err).code(), Code::Aborted);
    assert_running(&h.runtime, "1");
}

#[tokio::test]
async fn failed_rollback_is_data_loss() {
    let mut h = harness();
    h.runtime
        .fail_next("start_container", RuntimeError::Internal("exec format error".to_string()));
    h.runtime
        .fail_next("start_container", RuntimeError::Internal("exec format error".to_string()));

    let res = h.orchestrator.update(target(), None, &TEST_TID).await;

    let err = res.unwrap_err();
    assert_eq!(status_from_error(&err).code(), Code::DataLoss);
    assert!(err.to_string().ends_with("instance is not running"));
    assert_eq!(h.reports.recv().await.unwrap().outcome, UpdateOutcome::Failed);
    assert!(h.orchestrator.locks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn async_update_past_deadline_is_rolled_back() {
    let mut h = harness();
    h.runtime.delay_next("start_container", Duration::from_secs(30));

    let name = h
        .orchestrator
        .update_async(target(), Some(Duration::from_secs(1)), &TEST_TID)
        .await
        .unwrap();
    assert_eq!(name, "web");

    let report = h.reports.recv().await.unwrap();
    assert_eq!(report.outcome, UpdateOutcome::RolledBack);
    assert_eq!(
        report.error.unwrap(),
        "update of 'web' failed: deadline of 1s exceeded; previous state restored"
    );
    assert_running(&h.runtime, "1");
    assert!(h.orchestrator.locks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn sync_update_past_deadline_reports_abort() {
    let h = harness();
    h.runtime.delay_next("create_container", Duration::from_secs(30));

    let res = h
        .orchestrator
        .update(target(), Some(Duration::from_secs(2)), &TEST_TID)
        .await;

    let err = res.unwrap_err();
    assert_eq!(status_from_error(&err).code(), Code::Aborted);
    assert_running(&h.runtime, "1");
}

#[tokio::test(start_paused = true)]
async fn async_update_survives_caller_going_away() {
    let mut h = harness();
    h.runtime.delay_next("create_container", Duration::from_secs(3));

    let orchestrator = h.orchestrator.clone();
    let caller = tokio::spawn(async move { orchestrator.update(target(), None, &TEST_TID).await });
    tokio::time::sleep(Duration::from_millis(500)).await;
    caller.abort();

    let report = h.reports.recv().await.unwrap();
    assert_eq!(report.outcome, UpdateOutcome::Success);
    assert_running(&h.runtime, "2");
}

#[tokio::test]
async fn run_creates_and_starts() {
    let h = harness();

    let name = h
        .orchestrator
        .run(spec("api", "app", "2", &["7000:70"]), &TEST_TID)
        .await
        .unwrap();

    assert_eq!(name, "api");
    assert!(h.runtime.container("api").unwrap().running);
}

#[tokio::test]
async fn run_rejects_existing_name() {
    let h = harness();

    let res = h
        .orchestrator
        .run(spec("web", "app", "2", &[]), &TEST_TID)
        .await;

    let err = res.unwrap_err();
    assert_eq!(err.to_string(), "instance 'web' already exists");
    assert_eq!(status_from_error(&err).code(), Code::AlreadyExists);
}

#[tokio::test]
async fn run_rejects_taken_port() {
    let h = harness();

    let res = h
        .orchestrator
        .run(spec("api", "app", "2", &["8080:80"]), &TEST_TID)
        .await;

    assert_error!(res, "port 8080 is already in use by 'web'", "port clash was allowed");
    assert!(h.runtime.container("api").is_none());
}

#[tokio::test]
async fn run_cleans_up_instance_that_will_not_start() {
    let h = harness();
    h.runtime
        .fail_next("start_container", RuntimeError::Internal("bad entrypoint".to_string()));

    let res = h
        .orchestrator
        .run(spec("api", "app", "2", &[]), &TEST_TID)
        .await;

    assert_error!(res, "failed to start 'api'", "broken instance reported as running");
    assert!(h.runtime.container("api").is_none());
}

#[tokio::test]
async fn lifecycle_calls_respect_instance_lock() {
    let h = harness();
    let held = h.orchestrator.locks().try_acquire("web").unwrap();

    assert_error!(
        h.orchestrator.stop("web", false, &TEST_TID).await,
        "instance 'web' is already being updated",
        "stop ignored the lock"
    );
    assert_error!(
        h.orchestrator.remove("web", true, &TEST_TID).await,
        "instance 'web' is already being updated",
        "remove ignored the lock"
    );
    drop(held);

    h.orchestrator.stop("web", false, &TEST_TID).await.unwrap();
    assert!(!h.runtime.container("web").unwrap().running);
    h.orchestrator.start("web", &TEST_TID).await.unwrap();
    assert!(h.runtime.container("web").unwrap().running);
    h.orchestrator.stop("web", true, &TEST_TID).await.unwrap();
    h.orchestrator.remove("web", false, &TEST_TID).await.unwrap();
    assert!(h.runtime.container("web").is_none());
}

#[tokio::test]
async fn stopping_a_stopped_instance_is_a_precondition_failure() {
    let h = harness();
    h.orchestrator.stop("web", false, &TEST_TID).await.unwrap();

    let err = h.orchestrator.stop("web", false, &TEST_TID).await.unwrap_err();

    assert_eq!(status_from_error(&err).code(), Code::FailedPrecondition);
}
