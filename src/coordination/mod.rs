//! Run coordination: scheduling, unit execution and stitching

pub mod aggregator;
pub mod coordinator;
pub mod worker;

pub use aggregator::{AggregatorReport, StitchAggregator, StitchPayload};
pub use coordinator::{
    Coordinator, PipelineConfig, PipelineConfigBuilder, ResumePolicy, RunResult, ScenarioSummary,
};
pub use worker::{UnitOutcome, UnitRunner};
