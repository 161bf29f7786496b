//! Episode recording during a run.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use ralph_supervisor::experience::{
    Episode, EpisodeIter, ExperienceResult, ExperienceStore, InMemoryExperienceStore,
};
use ralph_supervisor::supervisor::Supervisor;
use ralph_supervisor::CriterionReport;

use crate::common::*;

const STORE_DELAY: Duration = Duration::from_millis(800);

/// Store that takes a long time per write.
struct SlowStore {
    inner: InMemoryExperienceStore,
}

#[async_trait]
impl ExperienceStore for SlowStore {
    async fn record(&self, episode: Episode) -> ExperienceResult<()> {
        tokio::time::sleep(STORE_DELAY).await;
        self.inner.record(episode).await
    }

    async fn query(&self, domain: &str) -> ExperienceResult<EpisodeIter> {
        self.inner.query(domain).await
    }
}

#[tokio::test]
async fn test_slow_experience_store_does_not_delay_dispatch() {
    let stories = (1..=3).map(|n| story(&format!("US-00{}", n), 1)).collect();
    let (_dir, path) = write_backlog(stories);

    let started: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&started);
    let agent = ScriptedAgent::new(move |_, _| {
        seen.lock().unwrap().push(Instant::now());
        Action::Complete(CriterionReport::default())
    });

    let store = Arc::new(SlowStore {
        inner: InMemoryExperienceStore::new(),
    });
    let supervisor =
        Supervisor::new(fast_config(&path), agent.clone()).with_experience_store(store.clone());

    let summary = supervisor.run().await.unwrap();
    assert!(summary.all_passed);

    // Stories run one after another; each passed story queues an episode.
    let started = started.lock().unwrap().clone();
    assert_eq!(started.len(), 3);
    let spread = started[2].duration_since(started[0]);
    assert!(
        spread < STORE_DELAY,
        "dispatch waited on the experience store: {:?}",
        spread
    );

    // The run drains the queue before returning.
    assert_eq!(store.inner.len().await, 3);
}
