//! Crash-safe resume from checkpoints.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use ralph_supervisor::backlog::{
    Backlog, Checkpoint, CriterionStatus, GateOutcome, Lease, StoryStatus,
};
use ralph_supervisor::CriterionReport;

use crate::common::*;

async fn wait_for_call(agent: &ScriptedAgent, criterion_id: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !agent.calls().iter().any(|c| c == criterion_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent never reached the criterion");
}

async fn wait_for_gate(gate: &ScriptedGate, story_id: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while gate.runs(story_id) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("gate never started");
}

/// Gate history of a story without timings.
fn gate_history(path: &Path, story_id: &str) -> Vec<(String, usize, u32, u32, GateOutcome)> {
    load_backlog(path)
        .story(story_id)
        .unwrap()
        .gate_results
        .iter()
        .map(|a| (a.gate_name.clone(), a.position, a.cycle, a.attempt, a.outcome))
        .collect()
}

#[tokio::test]
async fn test_resume_skips_completed_criteria_and_clears_stale_lease() {
    let mut interrupted = story("US-001", 3);
    interrupted.status = StoryStatus::InProgress;
    interrupted.acceptance_criteria[0].status = CriterionStatus::Done;
    let mut backlog = Backlog::new("Fixture", vec![interrupted, story("US-002", 1)]);
    backlog.checkpoints.insert(
        "US-001".to_string(),
        Checkpoint {
            story_id: "US-001".to_string(),
            last_completed_criterion: Some(0),
            sequence: 3,
            recorded_at: Utc::now(),
            state: json!({ "criterionId": "US-001-AC1" }),
        },
    );
    backlog.leases.insert(
        "US-001".to_string(),
        Lease {
            story_id: "US-001".to_string(),
            worker_id: "worker-1".to_string(),
            attempt: 4,
            context: std::env::temp_dir(),
            owner_pid: u32::MAX,
            acquired_at: Utc::now(),
            heartbeat_at: Utc::now(),
        },
    );
    let (_dir, path) = write_backlog(Vec::new());
    save_backlog(&path, &backlog);

    let agent = ScriptedAgent::completing();
    let (supervisor, _) = build_supervisor(fast_config(&path), agent.clone());
    let summary = supervisor.run().await.unwrap();

    assert!(summary.all_passed);
    assert_eq!(
        agent.calls(),
        vec!["US-001-AC2", "US-001-AC3", "US-002-AC1"]
    );

    let saved = load_backlog(&path);
    assert!(saved.leases.is_empty());
    let checkpoint = &saved.checkpoints["US-001"];
    assert_eq!(checkpoint.last_completed_criterion, Some(2));
    assert_eq!(checkpoint.sequence, 5);
}

#[tokio::test]
async fn test_interrupted_run_resumes_where_it_stopped() {
    let (_dir, path) = write_backlog(vec![story("US-001", 3)]);

    // First run: hangs on the second criterion until shut down.
    let first = ScriptedAgent::new(|criterion_id, _| {
        if criterion_id == "US-001-AC2" {
            Action::Hang
        } else {
            Action::Complete(CriterionReport::default())
        }
    });
    let (supervisor, _) = build_supervisor(fast_config(&path), first.clone());
    let handle = supervisor.handle();
    let run = tokio::spawn(async move { supervisor.run().await });

    wait_for_call(&first, "US-001-AC2").await;
    handle.shutdown();
    let summary = run.await.unwrap().unwrap();
    assert!(summary.interrupted);
    assert_eq!(summary.remaining, 1);

    let saved = load_backlog(&path);
    let story = saved.story("US-001").unwrap();
    assert_eq!(story.status, StoryStatus::InProgress);
    assert!(story.acceptance_criteria[0].is_done());
    assert!(!story.acceptance_criteria[1].is_done());
    assert!(saved.leases.is_empty());

    // Second run picks up at the second criterion.
    let second = ScriptedAgent::completing();
    let (supervisor, episodes) = build_supervisor(fast_config(&path), second.clone());
    let summary = supervisor.run().await.unwrap();
    assert!(summary.all_passed);
    assert!(!summary.interrupted);
    assert_eq!(second.calls(), vec!["US-001-AC2", "US-001-AC3"]);
    assert_eq!(episodes.len().await, 1);

    let story = load_backlog(&path).story("US-001").unwrap().clone();
    assert_eq!(story.status, StoryStatus::Passed);
    assert!(story.all_criteria_done());
}

#[tokio::test]
async fn test_shutdown_during_second_gate_resumes_with_same_gate_history() {
    // Reference: the same pipeline run without interruption.
    let (_reference_dir, reference_path) = write_backlog(vec![story("US-001", 1)]);
    let (supervisor, _) = build_supervisor(fast_config(&reference_path), ScriptedAgent::completing());
    let summary = supervisor
        .with_gate(Arc::new(ScriptedGate::passing("lint")))
        .with_gate(Arc::new(ScriptedGate::passing("tests")))
        .run()
        .await
        .unwrap();
    assert!(summary.all_passed);
    let expected = gate_history(&reference_path, "US-001");

    let (_dir, path) = write_backlog(vec![story("US-001", 1)]);

    // First run: the second gate hangs until shut down.
    let lint = Arc::new(ScriptedGate::passing("lint"));
    let tests = Arc::new(ScriptedGate::hanging("tests"));
    let (supervisor, _) = build_supervisor(fast_config(&path), ScriptedAgent::completing());
    let handle = supervisor.handle();
    let supervisor = supervisor.with_gate(lint.clone()).with_gate(tests.clone());
    let run = tokio::spawn(async move { supervisor.run().await });

    wait_for_gate(&tests, "US-001").await;
    handle.shutdown();
    let summary = run.await.unwrap().unwrap();
    assert!(summary.interrupted);
    assert_eq!(lint.runs("US-001"), 1);

    let saved = load_backlog(&path);
    assert_eq!(saved.story("US-001").unwrap().status, StoryStatus::InProgress);
    assert!(saved.leases.is_empty());
    // The cancelled attempt never produced a result.
    assert_eq!(gate_history(&path, "US-001"), expected[..1].to_vec());

    // Second run: the passed gate is skipped and the hung one runs again.
    let lint = Arc::new(ScriptedGate::passing("lint"));
    let tests = Arc::new(ScriptedGate::passing("tests"));
    let agent = ScriptedAgent::completing();
    let (supervisor, _) = build_supervisor(fast_config(&path), agent.clone());
    let summary = supervisor
        .with_gate(lint.clone())
        .with_gate(tests.clone())
        .run()
        .await
        .unwrap();
    assert!(summary.all_passed);
    assert!(agent.calls().is_empty());
    assert_eq!(lint.runs("US-001"), 0);
    assert_eq!(tests.runs("US-001"), 1);

    assert_eq!(
        expected,
        vec![
            ("lint".to_string(), 0, 0, 1, GateOutcome::Pass),
            ("tests".to_string(), 1, 0, 1, GateOutcome::Pass),
        ]
    );
    assert_eq!(gate_history(&path, "US-001"), expected);
    let story = load_backlog(&path).story("US-001").unwrap().clone();
    assert_eq!(story.status, StoryStatus::Passed);
    assert_eq!(story.gate_cycle, 0);
}
