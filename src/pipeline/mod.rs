// Data harmonization pipeline: ingestion, processing, and storage

pub mod ingestion;
pub mod orchestrator;
pub mod processing;
pub mod storage;

pub use orchestrator::{CombineReport, PeriodReport, PeriodStatus, Pipeline, RunPlan, RunReport};
