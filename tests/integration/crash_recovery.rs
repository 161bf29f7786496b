//! Worker crashes, stalls and agent failures.

use ralph_supervisor::backlog::StoryStatus;
use ralph_supervisor::experience::EpisodeOutcome;
use ralph_supervisor::CriterionReport;

use crate::common::*;

fn count(calls: &[String], criterion_id: &str) -> usize {
    calls.iter().filter(|c| c.as_str() == criterion_id).count()
}

#[tokio::test]
async fn test_panicking_worker_resumes_from_checkpoint() {
    let (_dir, path) = write_backlog(vec![story("US-001", 2)]);
    let agent = ScriptedAgent::new(|criterion_id, call| {
        if criterion_id == "US-001-AC2" && call == 1 {
            Action::Panic
        } else {
            Action::Complete(CriterionReport::default())
        }
    });

    let (supervisor, _) = build_supervisor(fast_config(&path), agent.clone());
    let summary = supervisor.run().await.unwrap();
    assert!(summary.all_passed);

    let calls = agent.calls();
    assert_eq!(count(&calls, "US-001-AC1"), 1);
    assert_eq!(count(&calls, "US-001-AC2"), 2);

    let story = load_backlog(&path).story("US-001").unwrap().clone();
    assert_eq!(story.status, StoryStatus::Passed);
    assert_eq!(story.crash_count, 1);
}

#[tokio::test]
async fn test_crash_budget_exhaustion_fails_story() {
    let (_dir, path) = write_backlog(vec![story("US-001", 1), story("US-002", 1)]);
    let agent = ScriptedAgent::new(|criterion_id, _| {
        if criterion_id == "US-001-AC1" {
            Action::Panic
        } else {
            Action::Complete(CriterionReport::default())
        }
    });

    let config = fast_config(&path).with_crash_retry_budget(2);
    let (supervisor, episodes) = build_supervisor(config, agent.clone());
    let summary = supervisor.run().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.passed, 1);
    assert_eq!(count(&agent.calls(), "US-001-AC1"), 3);

    let story = load_backlog(&path).story("US-001").unwrap().clone();
    assert_eq!(story.status, StoryStatus::Failed);
    assert_eq!(story.crash_count, 3);
    assert!(story.last_error.unwrap().contains("scripted panic"));

    let recorded = episodes.episodes().await;
    let failed = recorded
        .iter()
        .find(|e| e.outcome == EpisodeOutcome::Failed)
        .unwrap();
    assert_eq!(failed.context["errorKind"], "worker_crash");
    assert_eq!(failed.context["crashCount"], 3);
}

#[tokio::test]
async fn test_stalled_worker_is_force_released_and_redispatched() {
    let (_dir, path) = write_backlog(vec![story("US-001", 1)]);
    let agent = ScriptedAgent::new(|_, call| {
        if call == 1 {
            Action::Hang
        } else {
            Action::Complete(CriterionReport::default())
        }
    });

    // The worker leaves heartbeats to the agent, which never sends any.
    let config = fast_config(&path).with_agent_heartbeats(true);
    let (supervisor, _) = build_supervisor(config, agent.clone());
    let summary = tokio::time::timeout(std::time::Duration::from_secs(10), supervisor.run())
        .await
        .expect("stall was never detected")
        .unwrap();

    assert!(summary.all_passed);
    assert_eq!(agent.calls().len(), 2);
    let saved = load_backlog(&path);
    let story = saved.story("US-001").unwrap();
    assert_eq!(story.crash_count, 1);
    assert!(story.last_error.as_deref().unwrap().contains("no heartbeat"));
    assert!(saved.leases.is_empty());
}

#[tokio::test]
async fn test_agent_failures_exhaust_criterion_attempts() {
    let (_dir, path) = write_backlog(vec![story("US-001", 2)]);
    let agent = ScriptedAgent::new(|criterion_id, _| {
        if criterion_id == "US-001-AC2" {
            Action::Fail(CriterionReport::default().with_touched("src/lib.rs"))
        } else {
            Action::Complete(CriterionReport::default())
        }
    });

    let config = fast_config(&path).with_max_criterion_attempts(3);
    let (supervisor, _) = build_supervisor(config, agent.clone());
    let summary = supervisor.run().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(count(&agent.calls(), "US-001-AC2"), 3);

    let story = load_backlog(&path).story("US-001").unwrap().clone();
    assert_eq!(story.status, StoryStatus::Failed);
    assert_eq!(story.error_count, 3);
    assert!(story.acceptance_criteria[0].is_done());
    assert!(!story.acceptance_criteria[1].is_done());
    assert!(story.last_error.unwrap().contains("US-001-AC2"));
}
