pub mod models;
pub mod services;
pub mod workers;

pub use workers::{IngestionPipeline, PipelineStatsSnapshot};
