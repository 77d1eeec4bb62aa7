pub mod config;
pub mod constants;
pub mod error;
pub mod geography;
pub mod idempotency;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod types;

// Layered boundaries for application ports and infrastructure adapters
pub mod app;
pub mod infra;

pub use error::{HarmonizeError, Result};
pub use pipeline::{Pipeline, RunPlan, RunReport};
