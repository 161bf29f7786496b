//! Complexity signals and the weighted composite score.

use serde::{Deserialize, Serialize};

use super::config::ComplexityConfig;
use crate::backlog::Story;

/// Weight of the time-overrun signal in the composite score.
pub const TIME_OVERRUN_WEIGHT: f64 = 0.35;
pub const SCOPE_EXPANSION_WEIGHT: f64 = 0.25;
pub const ERROR_COUNT_WEIGHT: f64 = 0.25;
pub const CLARIFICATION_WEIGHT: f64 = 0.15;

/// One raw execution signal reported for a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    /// A criterion finished (or timed out) after `actual_secs`.
    TimeOverrun {
        criterion_id: String,
        actual_secs: f64,
    },
    /// Resource paths touched by the agent; only those outside the declared
    /// scope count.
    ScopeExpansion { paths: Vec<String> },
    /// Execution errors surfaced by the agent.
    Error { count: u32 },
    /// Explicit uncertainty signals from the agent.
    Clarification { count: u32 },
}

/// The four signals after normalisation onto 0-10.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedSignals {
    pub time_overrun: f64,
    pub scope_expansion: f64,
    pub error_count: f64,
    pub clarifications: f64,
}

impl NormalizedSignals {
    pub fn new(time_overrun: f64, scope_expansion: f64, error_count: f64, clarifications: f64) -> Self {
        Self {
            time_overrun,
            scope_expansion,
            error_count,
            clarifications,
        }
    }

    /// Derives the normalised signals from a story's accumulated counters.
    pub fn from_story(story: &Story, config: &ComplexityConfig) -> Self {
        Self {
            time_overrun: config.normalize_time_overrun(worst_overrun_ratio(story)),
            scope_expansion: config.normalize_scope(story.out_of_scope_touches),
            error_count: config.normalize_errors(story.error_count),
            clarifications: config.normalize_clarifications(story.clarification_count),
        }
    }

    /// Fixed weighted sum: 35% time, 25% scope, 25% errors, 15% clarifications.
    pub fn composite(&self) -> f64 {
        composite_score(self)
    }
}

pub fn composite_score(signals: &NormalizedSignals) -> f64 {
    let score = TIME_OVERRUN_WEIGHT * signals.time_overrun
        + SCOPE_EXPANSION_WEIGHT * signals.scope_expansion
        + ERROR_COUNT_WEIGHT * signals.error_count
        + CLARIFICATION_WEIGHT * signals.clarifications;
    score.clamp(0.0, 10.0)
}

/// Worst actual/estimated ratio over criteria with a recorded actual time.
pub fn worst_overrun_ratio(story: &Story) -> f64 {
    story
        .acceptance_criteria
        .iter()
        .enumerate()
        .filter_map(|(index, criterion)| {
            let actual = criterion.actual_secs?;
            let estimate = story.criterion_estimate_secs(index);
            if estimate == 0 {
                return None;
            }
            Some(actual / estimate as f64)
        })
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::AcceptanceCriterion;

    fn close(a: f64, b: f64, tolerance: f64) -> bool {
        (a - b).abs() <= tolerance
    }

    #[test]
    fn test_weights_sum_to_one() {
        let total =
            TIME_OVERRUN_WEIGHT + SCOPE_EXPANSION_WEIGHT + ERROR_COUNT_WEIGHT + CLARIFICATION_WEIGHT;
        assert!(close(total, 1.0, 1e-12));
    }

    #[test]
    fn test_calibrated_weighting() {
        // Normalised inputs 7.5 / 8.0 / 5.0 / 3.0 under the fixed weights.
        let signals = NormalizedSignals::new(7.5, 8.0, 5.0, 3.0);
        assert!(close(signals.composite(), 6.325, 1e-9));
    }

    #[test]
    fn test_all_saturated_is_ten() {
        let signals = NormalizedSignals::new(10.0, 10.0, 10.0, 10.0);
        assert!(close(signals.composite(), 10.0, 1e-9));
        assert_eq!(NormalizedSignals::default().composite(), 0.0);
    }

    #[test]
    fn test_from_story_uses_worst_ratio() {
        let mut story = Story::new("US-001", "A").with_criteria(vec![
            AcceptanceCriterion::new("a", "a", 100),
            AcceptanceCriterion::new("b", "b", 100),
            AcceptanceCriterion::new("c", "c", 100),
        ]);
        story.acceptance_criteria[0].actual_secs = Some(150.0);
        story.acceptance_criteria[1].actual_secs = Some(275.0);
        story.error_count = 5;
        story.clarification_count = 1;
        story.out_of_scope_touches = 2;

        assert!(close(worst_overrun_ratio(&story), 2.75, 1e-9));

        let signals = NormalizedSignals::from_story(&story, &ComplexityConfig::default());
        assert!(close(signals.time_overrun, 5.0, 1e-9));
        assert!(close(signals.scope_expansion, 5.0, 1e-9));
        assert!(close(signals.error_count, 10.0, 1e-9));
        assert!(close(signals.clarifications, 10.0 / 3.0, 1e-9));
    }

    #[test]
    fn test_signal_serialization_is_tagged() {
        let signal = Signal::Error { count: 2 };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["kind"], "error");
        assert_eq!(json["count"], 2);
    }
}
