use crate::model::reprocess::ReprocessItem;
use async_trait::async_trait;
use errors::Result;
use serde::Serialize;

/// Corpus counters surfaced by the reprocess status endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SourceStats {
    /// Items eligible for reprocessing.
    pub total: usize,
    /// Items that already carry a completion marker.
    pub completed: usize,
}

/// Enumerates historical items eligible for reprocessing. Enumeration order
/// must be stable so repeated dry runs over the same corpus agree.
#[async_trait]
pub trait ItemSource: Send + Sync {
    async fn enumerate(&self, max_items: Option<usize>) -> Result<Vec<ReprocessItem>>;

    async fn stats(&self) -> Result<SourceStats>;
}
