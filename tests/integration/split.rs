//! Adaptive splitting driven by complexity alerts.

use std::sync::Arc;

use ralph_supervisor::backlog::{AlertState, StoryStatus};
use ralph_supervisor::split::{ChannelApprover, SplitDecision};
use ralph_supervisor::CriterionReport;

use crate::common::*;

/// Three errors on the first criterion push a story with threshold 1.0
/// over it.
fn noisy_first_criterion() -> Arc<ScriptedAgent> {
    ScriptedAgent::new(|criterion_id, _| {
        if criterion_id == "US-001-AC1" {
            Action::Complete(
                CriterionReport::default()
                    .with_error("flaky build")
                    .with_error("missing import")
                    .with_error("type mismatch"),
            )
        } else {
            Action::Complete(CriterionReport::default())
        }
    })
}

fn sensitive_story(criteria: usize) -> ralph_supervisor::Story {
    let mut parent = story("US-001", criteria);
    parent.complexity_threshold = Some(1.0);
    parent
}

#[tokio::test]
async fn test_alert_splits_story_and_children_complete() {
    let (_dir, path) = write_backlog(vec![sensitive_story(4), story("US-002", 1)]);
    let agent = noisy_first_criterion();
    let (supervisor, episodes) = build_supervisor(fast_config(&path), agent.clone());
    let mut alerts = supervisor.subscribe_alerts();

    let summary = supervisor.run().await.unwrap();
    assert!(summary.all_passed);
    assert_eq!(summary.split, 1);

    let alert = alerts.try_recv().unwrap();
    assert_eq!(alert.story_id, "US-001");
    assert!(alert.score >= 1.0);

    // Every criterion ran exactly once across parent and children.
    let mut calls = agent.calls();
    calls.sort();
    assert_eq!(
        calls,
        vec!["US-001-AC1", "US-001-AC2", "US-001-AC3", "US-001-AC4", "US-002-AC1"]
    );

    let saved = load_backlog(&path);
    let ids: Vec<&str> = saved.user_stories.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["US-001", "US-001.0", "US-001.1", "US-001.2", "US-002"]);

    let parent = saved.story("US-001").unwrap();
    assert_eq!(parent.status, StoryStatus::Split);
    assert!(!saved.checkpoints.contains_key("US-001"));

    let carried = saved.story("US-001.0").unwrap();
    assert_eq!(carried.status, StoryStatus::Passed);
    assert_eq!(carried.acceptance_criteria.len(), 1);
    for child_id in ["US-001.1", "US-001.2"] {
        let child = saved.story(child_id).unwrap();
        assert_eq!(child.status, StoryStatus::Passed);
        assert_eq!(child.parent_id.as_deref(), Some("US-001"));
        assert_eq!(child.error_count, 0);
    }
    assert_eq!(saved.story("US-001.1").unwrap().acceptance_criteria.len(), 2);

    let archived = &saved.archive[0];
    assert_eq!(archived.story_id, "US-001");
    assert_eq!(archived.error_count, 3);

    // Passed children and US-002; the split parent has no episode.
    assert_eq!(episodes.len().await, 3);
}

#[tokio::test]
async fn test_rejected_split_continues_unsplit() {
    let (_dir, path) = write_backlog(vec![sensitive_story(3)]);
    let (approver, mut requests) = ChannelApprover::new(4);
    let answered = tokio::spawn(async move {
        let mut answered = 0;
        while let Some(request) = requests.recv().await {
            answered += 1;
            let _ = request
                .respond
                .send(SplitDecision::reject("keep it whole"));
        }
        answered
    });

    let agent = noisy_first_criterion();
    let (supervisor, _) = build_supervisor(fast_config(&path), agent.clone());
    let summary = supervisor
        .with_approver(Arc::new(approver))
        .run()
        .await
        .unwrap();

    assert!(summary.all_passed);
    assert_eq!(summary.split, 0);
    assert_eq!(answered.await.unwrap(), 1);

    let saved = load_backlog(&path);
    assert_eq!(saved.user_stories.len(), 1);
    let story = saved.story("US-001").unwrap();
    assert_eq!(story.status, StoryStatus::Passed);
    assert_eq!(story.alert, AlertState::Dismissed);
    assert_eq!(agent.calls().len(), 3);
}

#[tokio::test]
async fn test_single_criterion_story_is_not_split() {
    let (_dir, path) = write_backlog(vec![sensitive_story(1)]);
    let (supervisor, _) = build_supervisor(fast_config(&path), noisy_first_criterion());

    let summary = supervisor.run().await.unwrap();
    assert!(summary.all_passed);
    assert_eq!(summary.split, 0);

    let story = load_backlog(&path).story("US-001").unwrap().clone();
    assert_eq!(story.status, StoryStatus::Passed);
    assert_eq!(story.alert, AlertState::Dismissed);
}
