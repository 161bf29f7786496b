//! End-to-end tests of the supervisor against on-disk backlogs.

mod cli;
mod common;
mod crash_recovery;
mod experience;
mod gates;
mod lock;
mod parallel_execution;
mod resume;
mod split;
