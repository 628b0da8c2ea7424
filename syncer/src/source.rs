//! Registry-facing collaborator interfaces.
//!
//! Timeouts and retries are the implementor's concern; the orchestrator only
//! sees the final `Result` of each call.

use crate::errors::Result;
use crate::model::{Device, Reading, ReadingFilter, SortOrder};
use async_trait::async_trait;

#[async_trait]
pub trait ExternalDeviceSource: Send + Sync {
    /// Lists registry devices carrying `tag`, or the configured default tag when `None`
    async fn list_devices(&self, tag: Option<&str>) -> Result<Vec<Device>>;

    async fn get_device(&self, id: &str) -> Result<Device>;
}

#[async_trait]
pub trait ExternalReadingSource: Send + Sync {
    async fn list_readings(
        &self,
        device_id: &str,
        filter: &ReadingFilter,
        order: SortOrder,
    ) -> Result<Vec<Reading>>;
}
