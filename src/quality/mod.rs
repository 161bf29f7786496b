//! Quality gates and the pipeline that runs them before a story may pass.

pub mod gates;
pub mod pipeline;

pub use gates::{
    CommandGate, GateContext, GateProgressState, GateProgressUpdate, GateReport, GateSpec,
    QualityGate,
};
pub use pipeline::{PipelineConfig, PipelineOutcome, QualityGatePipeline};
