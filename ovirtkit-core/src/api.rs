use crate::error::Result;
use crate::types::*;
use async_trait::async_trait;

/// The subset of the engine API the disk pipelines depend on.
///
/// Implementations perform exactly one remote call per method; retrying is
/// the caller's business (see [`crate::retry`]).
#[async_trait]
pub trait EngineApi: Send + Sync {
    async fn create_disk(&self, params: &DiskCreation, correlation: &CorrelationId) -> Result<Disk>;
    async fn get_disk(&self, disk_id: &str) -> Result<Disk>;
    async fn remove_disk(&self, disk_id: &str) -> Result<()>;

    async fn create_image_transfer(
        &self,
        disk_id: &str,
        direction: TransferDirection,
        correlation: &CorrelationId,
    ) -> Result<ImageTransfer>;
    async fn get_image_transfer(&self, transfer_id: &str) -> Result<ImageTransfer>;
    async fn finalize_image_transfer(
        &self,
        transfer_id: &str,
        correlation: &CorrelationId,
    ) -> Result<()>;
    async fn cancel_image_transfer(&self, transfer_id: &str) -> Result<()>;

    /// Jobs tagged with `correlation`, in any phase.
    async fn list_jobs(&self, correlation: &CorrelationId) -> Result<Vec<Job>>;

    fn name(&self) -> &str;
}
