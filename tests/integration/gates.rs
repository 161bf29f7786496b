//! Quality gate pipeline as seen through a supervisor run.

use std::sync::Arc;

use ralph_supervisor::backlog::{GateOutcome, StoryStatus};
use ralph_supervisor::experience::EpisodeOutcome;
use ralph_supervisor::quality::GateReport;

use crate::common::*;

#[tokio::test]
async fn test_failing_gate_short_circuits_later_gates() {
    let (_dir, path) = write_backlog(vec![story("US-001", 1), story("US-002", 1)]);
    let lint = Arc::new(
        ScriptedGate::passing("lint").with_outcomes("US-001", vec![GateReport::fail("unused import")]),
    );
    let tests = Arc::new(ScriptedGate::passing("tests"));

    let (supervisor, episodes) = build_supervisor(fast_config(&path), ScriptedAgent::completing());
    let summary = supervisor
        .with_gate(lint.clone())
        .with_gate(tests.clone())
        .run()
        .await
        .unwrap();

    assert!(!summary.all_passed);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.passed, 1);
    assert_eq!(lint.runs("US-001"), 1);
    assert_eq!(tests.runs("US-001"), 0);
    assert_eq!(tests.runs("US-002"), 1);

    let saved = load_backlog(&path);
    let failed = saved.story("US-001").unwrap();
    assert_eq!(failed.status, StoryStatus::Failed);
    assert_eq!(failed.gate_results.len(), 1);
    assert_eq!(failed.gate_results[0].outcome, GateOutcome::Fail);
    assert!(failed.last_error.as_deref().unwrap().contains("lint"));

    let recorded = episodes.episodes().await;
    let episode = recorded
        .iter()
        .find(|e| e.outcome == EpisodeOutcome::Failed)
        .unwrap();
    assert_eq!(episode.domain, "Fixture");
    assert_eq!(episode.context["errorKind"], "gate_failure");
    assert_eq!(episode.context["category"], "terminal");
    assert!(episode.solution.contains("unused import"));
}

#[tokio::test]
async fn test_idempotent_gate_retried_until_pass() {
    let (_dir, path) = write_backlog(vec![story("US-001", 1)]);
    let tests = Arc::new(ScriptedGate::passing("tests").idempotent().with_outcomes(
        "US-001",
        vec![
            GateReport::fail("flaky"),
            GateReport::fail("flaky"),
            GateReport::pass("ok"),
        ],
    ));

    let (supervisor, _) = build_supervisor(fast_config(&path), ScriptedAgent::completing());
    let summary = supervisor.with_gate(tests.clone()).run().await.unwrap();

    assert!(summary.all_passed);
    let story = load_backlog(&path).story("US-001").unwrap().clone();
    let attempts: Vec<u32> = story.gate_results.iter().map(|a| a.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(story.gate_results[2].outcome, GateOutcome::Pass);
}

#[tokio::test]
async fn test_fix_cycle_reruns_pipeline() {
    let (_dir, path) = write_backlog(vec![story("US-001", 2)]);
    let lint = Arc::new(ScriptedGate::passing("lint").with_outcomes(
        "US-001",
        vec![GateReport::fail("formatting"), GateReport::pass("clean")],
    ));
    let tests = Arc::new(ScriptedGate::passing("tests"));

    let agent = ScriptedAgent::completing();
    let config = fast_config(&path).with_max_fix_cycles(1);
    let (supervisor, episodes) = build_supervisor(config, agent.clone());
    let summary = supervisor
        .with_gate(lint.clone())
        .with_gate(tests.clone())
        .run()
        .await
        .unwrap();

    assert!(summary.all_passed);
    assert_eq!(agent.fixes(), 1);
    assert_eq!(lint.runs("US-001"), 2);
    assert_eq!(tests.runs("US-001"), 1);

    let story = load_backlog(&path).story("US-001").unwrap().clone();
    assert_eq!(story.gate_cycle, 1);
    assert_eq!(story.gate_attempts_in_cycle(0).count(), 1);
    assert_eq!(story.gate_attempts_in_cycle(1).count(), 2);

    let recorded = episodes.episodes().await;
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].solution.starts_with("passed after 1 fix cycle(s)"));
}

#[tokio::test]
async fn test_gate_that_cannot_run_resumes_story_with_fresh_cycle() {
    let (_dir, path) = write_backlog(vec![story("US-001", 1)]);
    let build = Arc::new(ScriptedGate::passing("build").with_outcomes(
        "US-001",
        vec![
            GateReport::error("toolchain missing"),
            GateReport::error("toolchain missing"),
            GateReport::error("toolchain missing"),
            GateReport::pass("built"),
        ],
    ));

    let agent = ScriptedAgent::completing();
    let (supervisor, _) = build_supervisor(fast_config(&path), agent.clone());
    let summary = supervisor.with_gate(build.clone()).run().await.unwrap();

    assert!(summary.all_passed);
    assert_eq!(build.runs("US-001"), 4);
    assert_eq!(agent.fixes(), 0);
    assert_eq!(agent.calls().len(), 1);

    let story = load_backlog(&path).story("US-001").unwrap().clone();
    assert_eq!(story.status, StoryStatus::Passed);
    assert_eq!(story.crash_count, 1);
    assert_eq!(story.gate_cycle, 1);
    assert!(story
        .gate_attempts_in_cycle(0)
        .all(|a| a.outcome == GateOutcome::Error));
    assert_eq!(story.gate_attempts_in_cycle(0).count(), 3);
    let resumed: Vec<(u32, GateOutcome)> = story
        .gate_attempts_in_cycle(1)
        .map(|a| (a.attempt, a.outcome))
        .collect();
    assert_eq!(resumed, vec![(1, GateOutcome::Pass)]);
}

#[tokio::test]
async fn test_gate_that_never_runs_exhausts_crash_budget() {
    let (_dir, path) = write_backlog(vec![story("US-001", 1)]);
    let build = Arc::new(
        ScriptedGate::passing("build")
            .with_outcomes("US-001", vec![GateReport::error("toolchain missing")]),
    );

    let config = fast_config(&path).with_crash_retry_budget(1);
    let (supervisor, episodes) = build_supervisor(config, ScriptedAgent::completing());
    let summary = supervisor.with_gate(build.clone()).run().await.unwrap();

    assert_eq!(summary.failed, 1);
    // Two executions of three attempts each.
    assert_eq!(build.runs("US-001"), 6);

    let story = load_backlog(&path).story("US-001").unwrap().clone();
    assert_eq!(story.status, StoryStatus::Failed);
    assert_eq!(story.crash_count, 2);
    let last_error = story.last_error.unwrap();
    assert!(last_error.contains("could not run"));
    assert!(last_error.contains("toolchain missing"));

    let recorded = episodes.episodes().await;
    let failed = recorded
        .iter()
        .find(|e| e.outcome == EpisodeOutcome::Failed)
        .unwrap();
    assert_eq!(failed.context["errorKind"], "worker_crash");
}
