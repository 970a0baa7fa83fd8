// ABOUTME: Pipeline guarantees under failure: exclusive attempts, bounded retries, idempotent redelivery
// ABOUTME: Also covers group failure propagation and the whole-attempt watchdog timeout

mod common;

use boxyard_compute::ProviderError;
use boxyard_config::{Backoff, StepKind, StepPolicy};
use boxyard_deploy::{DeployError, JobQueue, StepTask};
use boxyard_storage::{BoxStatus, NewBox, StepStatus};
use common::*;
use pretty_assertions::assert_eq;
use std::time::Duration;

#[tokio::test]
async fn test_second_start_while_deploying_is_rejected() {
    let h = harness().await;
    h.provider.set_exec_delay(Duration::from_millis(50));

    let created = h.manager.create_box(request("busy", &[])).await.unwrap();

    let err = h.orchestrator.start_deployment(&created.id).await.unwrap_err();
    assert!(matches!(err, DeployError::AlreadyDeploying(_)), "{:?}", err);
    let err = h.manager.redeploy(&created.id).await.unwrap_err();
    assert!(matches!(err, DeployError::AlreadyDeploying(_)), "{:?}", err);

    let record = wait_for_status(&h.manager, &created.id, &[BoxStatus::Running, BoxStatus::Error]).await;
    assert_eq!(record.current_attempt, 1);
    assert!(h.manager.list_attempt_progress(&created.id, 2).await.is_err());
}

#[tokio::test]
async fn test_concurrent_starts_open_one_attempt() {
    let h = harness().await;
    let record = h
        .orchestrator
        .boxes()
        .create_box(NewBox {
            name: "Race".to_string(),
            subdomain: "race".to_string(),
            provider: "fake".to_string(),
            skills: Vec::new(),
        })
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        h.orchestrator.start_deployment(&record.id),
        h.orchestrator.start_deployment(&record.id)
    );

    let started: Vec<i64> = [&a, &b].into_iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(started, vec![1]);
    let rejected = if a.is_err() { a } else { b };
    assert!(matches!(rejected, Err(DeployError::AlreadyDeploying(_))));

    let settled = wait_for_status(&h.manager, &record.id, &[BoxStatus::Running, BoxStatus::Error]).await;
    assert_eq!(settled.status, BoxStatus::Running);
    assert_eq!(settled.current_attempt, 1);
}

#[tokio::test]
async fn test_retryable_create_failure_exhausts_attempts() {
    let h = harness().await;
    h.provider.fail_next_creates(vec![
        ProviderError::Unavailable("daemon restarting".into()),
        ProviderError::Unavailable("daemon restarting".into()),
        ProviderError::Unavailable("daemon restarting".into()),
    ]);

    let created = h.manager.create_box(request("flaky", &["web-search"])).await.unwrap();
    let record = wait_for_status(&h.manager, &created.id, &[BoxStatus::Error, BoxStatus::Running]).await;

    assert_eq!(record.status, BoxStatus::Error);
    assert!(record
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("Create instance failed"));
    assert_eq!(h.provider.create_calls(), 3);
    assert_eq!(h.manager.get_box(&created.id).await.unwrap().instance_id, None);

    wait_idle(&h.queue).await;
    let progress = h.manager.get_deploy_progress(&created.id).await.unwrap();
    let steps = all_steps(&progress.steps);
    let failed: Vec<_> = steps.iter().filter(|s| s.status == StepStatus::Failed).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].step_key, "create-instance");
    assert!(steps
        .iter()
        .filter(|s| s.step_key != "create-instance")
        .all(|s| s.status == StepStatus::Skipped));
    assert_eq!(h.orchestrator.boxes().deploy_marker(&created.id).await.unwrap(), None);
}

#[tokio::test]
async fn test_terminal_failure_is_not_retried() {
    let h = harness().await;
    h.provider
        .fail_next_creates(vec![ProviderError::QuotaExceeded("no cpu left".into())]);

    let created = h.manager.create_box(request("quota", &[])).await.unwrap();
    let record = wait_for_status(&h.manager, &created.id, &[BoxStatus::Error, BoxStatus::Running]).await;

    assert_eq!(record.status, BoxStatus::Error);
    assert!(record.error_message.unwrap().contains("no cpu left"));
    assert_eq!(h.provider.create_calls(), 1);

    wait_idle(&h.queue).await;
    let progress = h.manager.get_deploy_progress(&created.id).await.unwrap();
    assert_eq!(
        find(&progress.steps, "finalize").step.status,
        StepStatus::Skipped
    );
    assert_eq!(
        find(&progress.steps, "health-check").step.status,
        StepStatus::Skipped
    );
}

#[tokio::test]
async fn test_redelivered_completed_step_does_no_work() {
    let h = harness().await;
    let created = h.manager.create_box(request("again", &["web-search"])).await.unwrap();
    wait_for_status(&h.manager, &created.id, &[BoxStatus::Running]).await;
    wait_idle(&h.queue).await;

    let before = all_steps(&h.manager.get_deploy_progress(&created.id).await.unwrap().steps);
    let execs_before = h.provider.exec_log().len();

    let task = StepTask::new(&created.id, 1, "create-instance");
    let queued = h
        .queue
        .enqueue(
            StepKind::CreateInstance,
            &task.job_id(),
            serde_json::to_value(&task).unwrap(),
            fast_policies().get(StepKind::CreateInstance).into(),
        )
        .await
        .unwrap();
    assert!(queued);
    wait_idle(&h.queue).await;

    let after = all_steps(&h.manager.get_deploy_progress(&created.id).await.unwrap().steps);
    assert_eq!(h.provider.create_calls(), 1);
    assert_eq!(h.provider.exec_log().len(), execs_before);
    assert_eq!(after.len(), before.len());
    assert!(after.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(h.manager.get_status(&created.id).await.unwrap(), BoxStatus::Running);
}

#[tokio::test]
async fn test_completed_groups_have_completed_children() {
    let h = harness().await;
    let created = h
        .manager
        .create_box(request("groups", &["web-search", "code-runner"]))
        .await
        .unwrap();
    wait_for_status(&h.manager, &created.id, &[BoxStatus::Running]).await;

    let progress = h.manager.get_deploy_progress(&created.id).await.unwrap();
    for node in &progress.steps {
        if node.step.status == StepStatus::Completed {
            assert!(
                node.children.iter().all(|c| c.status == StepStatus::Completed),
                "group {} completed with open children",
                node.step.step_key
            );
        }
    }
    assert_eq!(find(&progress.steps, "install-skills").children.len(), 2);
}

#[tokio::test]
async fn test_failed_skill_fails_its_group_and_the_box() {
    let h = harness().await;
    h.provider.fail_command("broken-skill", 2, u32::MAX);

    let created = h
        .manager
        .create_box(request("skills", &["web-search", "broken-skill"]))
        .await
        .unwrap();
    let record = wait_for_status(&h.manager, &created.id, &[BoxStatus::Error, BoxStatus::Running]).await;
    assert_eq!(record.status, BoxStatus::Error);
    assert!(record
        .error_message
        .unwrap()
        .starts_with("Install broken-skill failed"));

    wait_idle(&h.queue).await;
    let progress = h.manager.get_deploy_progress(&created.id).await.unwrap();
    let group = find(&progress.steps, "install-skills");
    assert_eq!(group.step.status, StepStatus::Failed);
    let broken = group
        .children
        .iter()
        .find(|c| c.step_key == "broken-skill")
        .unwrap();
    assert_eq!(broken.status, StepStatus::Failed);
    assert!(broken.error_message.as_deref().unwrap().contains("exit"));
    assert_eq!(find(&progress.steps, "skills-gate").step.status, StepStatus::Skipped);
    assert_eq!(find(&progress.steps, "finalize").step.status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_aborted_attempt_settles_group_of_child_awaiting_retry() {
    let setup = fast_policies().get(StepKind::SetupStep);
    let skill = fast_policies().get(StepKind::InstallSkill);
    let policies = fast_policies()
        .with_policy(
            StepKind::SetupStep,
            StepPolicy::new(
                Duration::from_secs(2),
                5,
                Backoff::exponential(Duration::from_millis(150)),
                setup.concurrency,
            ),
        )
        .with_policy(
            StepKind::InstallSkill,
            StepPolicy::new(
                Duration::from_secs(2),
                2,
                Backoff::exponential(Duration::from_millis(20)),
                skill.concurrency,
            ),
        );
    let h = harness_with(policies, fast_pipeline()).await;
    h.provider.fail_command("broken-skill", 2, u32::MAX);
    h.provider.fail_command("env", 1, 1);

    let created = h
        .manager
        .create_box(request("stranded", &["broken-skill"]))
        .await
        .unwrap();
    let record = wait_for_status(&h.manager, &created.id, &[BoxStatus::Error, BoxStatus::Running]).await;
    assert_eq!(record.status, BoxStatus::Error);
    assert!(record
        .error_message
        .unwrap()
        .starts_with("Install broken-skill failed"));

    // The setup retry lands after the abort
    wait_idle(&h.queue).await;
    let progress = h.manager.get_deploy_progress(&created.id).await.unwrap();

    let setup_group = find(&progress.steps, "setup");
    assert_eq!(setup_group.step.status, StepStatus::Failed);
    let env = setup_group
        .children
        .iter()
        .find(|c| c.step_key == "write-agent-env")
        .unwrap();
    assert_eq!(env.status, StepStatus::Failed);
    assert!(env.error_message.as_deref().unwrap().contains("no longer active"));
    assert_eq!(find(&progress.steps, "install-skills").step.status, StepStatus::Failed);

    let open: Vec<_> = all_steps(&progress.steps)
        .into_iter()
        .filter(|s| matches!(s.status, StepStatus::Running | StepStatus::Pending))
        .map(|s| s.step_key)
        .collect();
    assert!(open.is_empty(), "steps left open: {:?}", open);
}

#[tokio::test]
async fn test_watchdog_timeout_aborts_attempt_and_discards_late_instance() {
    let policies = fast_policies()
        .with_policy(
            StepKind::Orchestrator,
            StepPolicy::new(Duration::from_millis(100), 1, Backoff::None, 5),
        )
        .with_policy(
            StepKind::CreateInstance,
            StepPolicy::new(Duration::from_secs(2), 1, Backoff::None, 5),
        );
    let h = harness_with(policies, fast_pipeline()).await;
    h.provider.set_create_delay(Duration::from_millis(300));

    let created = h.manager.create_box(request("slow", &[])).await.unwrap();
    let record = wait_for_status(&h.manager, &created.id, &[BoxStatus::Error, BoxStatus::Running]).await;
    assert_eq!(record.status, BoxStatus::Error);
    assert_eq!(record.error_message.as_deref(), Some("deployment timed out"));

    wait_idle(&h.queue).await;
    assert_eq!(h.provider.create_calls(), 1);
    assert_eq!(h.provider.live_instances(), 0);

    let record = h.manager.get_box(&created.id).await.unwrap();
    assert_eq!(record.status, BoxStatus::Error);
    assert_eq!(record.instance_id, None);

    let progress = h.manager.get_deploy_progress(&created.id).await.unwrap();
    let create = find(&progress.steps, "create-instance");
    assert_eq!(create.step.metadata.as_ref().unwrap()["discarded"], true);
    assert_eq!(find(&progress.steps, "finalize").step.status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_resume_picks_up_attempt_left_in_flight() {
    let h = harness().await;
    let boxes = h.orchestrator.boxes();
    let record = boxes
        .create_box(NewBox {
            name: "Orphan".to_string(),
            subdomain: "orphan".to_string(),
            provider: "fake".to_string(),
            skills: vec!["web-search".to_string()],
        })
        .await
        .unwrap();
    // Marker taken but no job queued, as after a process restart
    assert_eq!(boxes.begin_attempt(&record.id).await.unwrap(), 1);

    assert_eq!(h.orchestrator.resume_in_flight().await.unwrap(), 1);

    let settled = wait_for_status(&h.manager, &record.id, &[BoxStatus::Running, BoxStatus::Error]).await;
    assert_eq!(settled.status, BoxStatus::Running, "{:?}", settled.error_message);
    assert_eq!(settled.current_attempt, 1);
    assert_eq!(h.provider.create_calls(), 1);

    // Nothing left in flight
    wait_idle(&h.queue).await;
    assert_eq!(h.orchestrator.resume_in_flight().await.unwrap(), 0);
}
