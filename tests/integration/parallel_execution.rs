//! Parallel workers: isolation, scope conflicts and workspace lifecycle.

use ralph_supervisor::backlog::StoryStatus;
use ralph_supervisor::experience::EpisodeOutcome;
use ralph_supervisor::CriterionReport;

use crate::common::*;

/// Both stories stay inside their own directory but also edit the root
/// manifest.
fn overlapping_agent() -> std::sync::Arc<ScriptedAgent> {
    ScriptedAgent::new(|criterion_id, _| {
        let own = if criterion_id.starts_with("PAR-001") {
            "src/a/lib.rs"
        } else {
            "src/b/lib.rs"
        };
        Action::Complete(
            CriterionReport::default()
                .with_touched(own)
                .with_touched("Cargo.toml"),
        )
    })
}

fn scoped_stories() -> Vec<ralph_supervisor::Story> {
    vec![
        story("PAR-001", 1).with_scope(vec!["src/a/".to_string()]),
        story("PAR-002", 1).with_scope(vec!["src/b/".to_string()]),
    ]
}

#[tokio::test]
async fn test_out_of_scope_collision_blocks_later_story() {
    let (dir, path) = write_backlog(scoped_stories());
    let config = fast_config(&path).with_max_workers(2);
    let (supervisor, episodes) = build_supervisor(config, overlapping_agent());

    let summary = supervisor.run().await.unwrap();
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.blocked, 1);
    assert!(!summary.all_passed);
    assert_eq!(summary.blocked_stories.len(), 1);

    let saved = load_backlog(&path);
    let blocked = saved
        .user_stories
        .iter()
        .find(|s| s.status == StoryStatus::Blocked)
        .unwrap();
    let passed = saved
        .user_stories
        .iter()
        .find(|s| s.status == StoryStatus::Passed)
        .unwrap();
    let last_error = blocked.last_error.as_deref().unwrap();
    assert!(last_error.contains("Cargo.toml"));
    assert!(last_error.contains(&passed.id));

    // The blocked story keeps its workspace for manual resolution.
    let workspaces = dir.path().join(".ralph").join("workspaces");
    assert!(workspaces.join(&blocked.id).exists());
    assert!(!workspaces.join(&passed.id).exists());

    let recorded = episodes.episodes().await;
    let episode = recorded
        .iter()
        .find(|e| e.outcome == EpisodeOutcome::Blocked)
        .unwrap();
    assert_eq!(episode.context["errorKind"], "scope_conflict");
}

#[tokio::test]
async fn test_single_worker_skips_scope_check() {
    let (_dir, path) = write_backlog(scoped_stories());
    let (supervisor, _) = build_supervisor(fast_config(&path), overlapping_agent());

    let summary = supervisor.run().await.unwrap();
    assert!(summary.all_passed);
    assert_eq!(summary.passed, 2);

    let saved = load_backlog(&path);
    for story in &saved.user_stories {
        assert_eq!(story.out_of_scope_touches, 1);
    }
}

#[tokio::test]
async fn test_parallel_run_completes_independent_stories() {
    let stories = (1..=4).map(|n| story(&format!("PAR-00{}", n), 2)).collect();
    let (dir, path) = write_backlog(stories);
    let agent = ScriptedAgent::completing();
    let config = fast_config(&path).with_max_workers(3);
    let (supervisor, episodes) = build_supervisor(config, agent.clone());

    let summary = supervisor.run().await.unwrap();
    assert!(summary.all_passed);
    assert_eq!(summary.passed, 4);
    assert_eq!(agent.calls().len(), 8);
    assert_eq!(episodes.len().await, 4);

    let saved = load_backlog(&path);
    assert!(saved.leases.is_empty());
    for story in &saved.user_stories {
        assert!(story.all_criteria_done());
        assert_eq!(saved.checkpoints[&story.id].last_completed_criterion, Some(1));
    }
    let workspaces = dir.path().join(".ralph").join("workspaces");
    let leftover = std::fs::read_dir(&workspaces)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
}
