//! Experience recording: episodes, the store interface and the failure
//! classifier that feeds it.

pub mod classifier;
pub mod episode;
pub mod store;

pub use classifier::FailureClassifier;
pub use episode::{Episode, EpisodeOutcome, EPISODE_SCHEMA_VERSION};
pub use store::{
    EpisodeIter, ExperienceConfig, ExperienceError, ExperienceResult, ExperienceStore,
    InMemoryExperienceStore, JsonlExperienceStore,
};
