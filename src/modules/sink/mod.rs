//! Persistence sink for accepted records
//!
//! The pipeline only sees the [`RecordSink`] capability; connection handling
//! stays inside the concrete adapter.

mod postgres_sink;

use async_trait::async_trait;

use crate::core::error::Result;
use crate::features::ingestion::models::IngestedRecord;

pub use postgres_sink::PostgresSink;

#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    /// Durably store one record
    async fn insert(&self, record: &IngestedRecord) -> Result<()>;

    /// Release the underlying connection; no inserts may follow
    async fn close(&self) -> Result<()>;
}
