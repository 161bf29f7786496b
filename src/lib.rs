//! Execution supervisor for autonomous story backlogs.
//!
//! A [`Supervisor`] drives an external agent through the acceptance criteria
//! of each story in a backlog file. It watches complexity signals and splits
//! stories that outgrow their estimate, runs quality gates before a story may
//! pass, coordinates parallel workers on isolated workspaces, and checkpoints
//! every completed criterion so a crashed or interrupted run resumes where it
//! stopped.

pub mod agent;
pub mod backlog;
pub mod complexity;
pub mod config;
pub mod error;
pub mod experience;
pub mod lock;
pub mod parallel;
pub mod quality;
pub mod split;
pub mod supervisor;
pub mod timeout;

pub use agent::{AgentError, AgentExecutor, CommandAgent, CriterionReport};
pub use backlog::{Backlog, StateStore, Story, StoryStatus};
pub use config::SupervisorSettings;
pub use error::{ErrorCategory, SupervisorError, SupervisorResult};
pub use supervisor::{RunSummary, Supervisor, SupervisorConfig, SupervisorHandle, SupervisorState};
