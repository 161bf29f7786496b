//! Complexity monitor configuration.

use serde::{Deserialize, Serialize};

/// Saturation points and alert threshold for the complexity score.
///
/// Each raw signal maps linearly onto 0-10 between its neutral point and its
/// saturation point, and is capped at 10 beyond it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ComplexityConfig {
    /// Actual/estimated ratio that maps to 10 (ratio 1.0 maps to 0)
    pub time_overrun_saturation: f64,

    /// Out-of-scope file count that maps to 10
    pub scope_saturation: f64,

    /// Error count that maps to 10
    pub error_saturation: f64,

    /// Clarification request count that maps to 10
    pub clarification_saturation: f64,

    /// Default alert threshold on the 0-10 scale; stories may override it
    pub threshold: f64,
}

impl Default for ComplexityConfig {
    fn default() -> Self {
        Self {
            time_overrun_saturation: 4.5,
            scope_saturation: 4.0,
            error_saturation: 5.0,
            clarification_saturation: 3.0,
            threshold: 7.0,
        }
    }
}

impl ComplexityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_time_overrun_saturation(mut self, ratio: f64) -> Self {
        self.time_overrun_saturation = ratio;
        self
    }

    pub fn with_scope_saturation(mut self, files: f64) -> Self {
        self.scope_saturation = files;
        self
    }

    pub fn with_error_saturation(mut self, errors: f64) -> Self {
        self.error_saturation = errors;
        self
    }

    pub fn with_clarification_saturation(mut self, requests: f64) -> Self {
        self.clarification_saturation = requests;
        self
    }

    /// Maps an actual/estimated ratio onto 0-10.
    pub fn normalize_time_overrun(&self, ratio: f64) -> f64 {
        if ratio.is_nan() || ratio <= 1.0 {
            return 0.0;
        }
        scale(ratio - 1.0, self.time_overrun_saturation - 1.0)
    }

    pub fn normalize_scope(&self, files: u32) -> f64 {
        scale(files as f64, self.scope_saturation)
    }

    pub fn normalize_errors(&self, errors: u32) -> f64 {
        scale(errors as f64, self.error_saturation)
    }

    pub fn normalize_clarifications(&self, requests: u32) -> f64 {
        scale(requests as f64, self.clarification_saturation)
    }
}

fn scale(value: f64, saturation: f64) -> f64 {
    if value <= 0.0 {
        return 0.0;
    }
    if saturation <= 0.0 {
        return 10.0;
    }
    (value / saturation * 10.0).min(10.0)
}
