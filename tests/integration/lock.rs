//! Backlog lock exclusivity.

use ralph_supervisor::lock::LockManager;
use ralph_supervisor::supervisor::SupervisorState;
use ralph_supervisor::SupervisorError;

use crate::common::*;

#[tokio::test]
async fn test_second_supervisor_fails_without_touching_store() {
    let (_dir, path) = write_backlog(vec![story("US-001", 2)]);
    let before = std::fs::read_to_string(&path).unwrap();

    let held = LockManager::new(&path).acquire().await.unwrap();

    let agent = ScriptedAgent::completing();
    let (supervisor, episodes) = build_supervisor(fast_config(&path), agent.clone());
    let handle = supervisor.handle();
    let result = supervisor.run().await;

    match result {
        Err(SupervisorError::LockConflict { pid, .. }) => assert_eq!(pid, std::process::id()),
        other => panic!("expected lock conflict, got {:?}", other.map(|s| s.to_string())),
    }
    assert_eq!(handle.state(), SupervisorState::Stopped);
    assert!(agent.calls().is_empty());
    assert!(episodes.is_empty().await);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);

    held.release().unwrap();
}

#[tokio::test]
async fn test_lock_released_after_run() {
    let (_dir, path) = write_backlog(vec![story("US-001", 1)]);

    let (supervisor, _) = build_supervisor(fast_config(&path), ScriptedAgent::completing());
    supervisor.run().await.unwrap();

    let manager = LockManager::new(&path);
    assert!(manager.holder().unwrap().is_none());
    // A later supervisor can take the backlog again.
    manager.acquire().await.unwrap().release().unwrap();
}
