use crate::dedup;
use crate::errors::{Error, Result};
use crate::fanout::settle_all;
use crate::metrics::{
    DEVICES_ADDED_TOTAL, DEVICES_DEACTIVATED_TOTAL, DEVICES_UPDATED_TOTAL, JOB_DURATION_SECONDS,
    READINGS_DUPLICATE_TOTAL, READINGS_FETCHED_TOTAL, READINGS_INSERTED_TOTAL,
};
use crate::model::{
    BatchSummary, Channel, Device, DeviceFilter, DeviceStatus, InitiationSummary, Reading,
    ReadingFilter, ReconcileSummary, SortOrder,
};
use crate::reconcile;
use crate::source::{ExternalDeviceSource, ExternalReadingSource};
use crate::store::Store;
use crate::validate::validate_reading;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Registry tag whose devices are tracked; `None` uses the source default
    pub tag: Option<String>,
    /// Channels a registry reading must carry to be ingested
    pub required_channels: Vec<Channel>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            tag: None,
            required_channels: vec![Channel::Iso1, Channel::Iso2, Channel::Loop1, Channel::Loop2],
        }
    }
}

/// Aligns the local store with the registry.
///
/// Every operation starts from the currently persisted state, so repeated
/// or overlapping runs converge on the same result.
#[derive(Clone)]
pub struct SyncOrchestrator {
    devices: Arc<dyn ExternalDeviceSource>,
    readings: Arc<dyn ExternalReadingSource>,
    store: Arc<dyn Store>,
    options: SyncOptions,
}

impl SyncOrchestrator {
    pub fn new(
        devices: Arc<dyn ExternalDeviceSource>,
        readings: Arc<dyn ExternalReadingSource>,
        store: Arc<dyn Store>,
        options: SyncOptions,
    ) -> Self {
        Self {
            devices,
            readings,
            store,
            options,
        }
    }

    /// Diffs registry devices against the store and persists additions,
    /// metadata updates and deactivations. Each record is written
    /// independently; failures are reported in the summary.
    pub async fn reconcile_devices(&self) -> Result<ReconcileSummary> {
        let start = Instant::now();
        info!("Reconciling devices with registry");

        let external = self.devices.list_devices(self.options.tag.as_deref()).await?;
        let local = self.store.find_devices(&DeviceFilter::all()).await?;
        let diff = reconcile::diff(&external, &local)?;

        info!(
            "{} registry devices, {} local: {} to add, {} to update, {} to deactivate",
            external.len(),
            local.len(),
            diff.to_add.len(),
            diff.to_update.len(),
            diff.to_deactivate.len()
        );

        let now = Utc::now();

        let store = self.store.clone();
        let added = settle_all(keyed(diff.to_add), move |device| {
            let store = store.clone();
            async move {
                let device = Device {
                    status: DeviceStatus::Pending,
                    last_seen: Some(now),
                    local_updated_at: Some(now),
                    ..device
                };
                store.upsert_device(&device).await?;
                debug!("Device {} added as pending", device.id);
                Ok(())
            }
        })
        .await
        .summary;

        // upsert leaves the stored status untouched for existing devices
        let store = self.store.clone();
        let updated = settle_all(keyed(diff.to_update), move |device| {
            let store = store.clone();
            async move {
                let device = Device {
                    local_updated_at: Some(now),
                    ..device
                };
                store.upsert_device(&device).await?;
                debug!("Device {} metadata updated", device.id);
                Ok(())
            }
        })
        .await
        .summary;

        let store = self.store.clone();
        let deactivated = settle_all(keyed(diff.to_deactivate), move |device| {
            let store = store.clone();
            async move {
                store
                    .set_device_status(&device.id, DeviceStatus::Inactive)
                    .await?;
                debug!("Device {} deactivated", device.id);
                Ok(())
            }
        })
        .await
        .summary;

        DEVICES_ADDED_TOTAL.inc_by(added.succeeded as f64);
        DEVICES_UPDATED_TOTAL.inc_by(updated.succeeded as f64);
        DEVICES_DEACTIVATED_TOTAL.inc_by(deactivated.succeeded as f64);

        let elapsed = start.elapsed().as_secs_f64();
        JOB_DURATION_SECONDS
            .with_label_values(&["reconcile_devices"])
            .observe(elapsed);

        let summary = ReconcileSummary {
            added,
            updated,
            deactivated,
        };
        log_reconcile(&summary, elapsed);

        Ok(summary)
    }

    /// Registers one registry device locally as pending, ahead of the next
    /// reconciliation pass.
    pub async fn register_device(&self, device_id: &str) -> Result<Device> {
        if self.store.get_device(device_id).await?.is_some() {
            return Err(Error::PreconditionFailed(format!(
                "Device {} already exists locally",
                device_id
            )));
        }

        let external = self.devices.get_device(device_id).await?;
        let now = Utc::now();
        let device = Device {
            status: DeviceStatus::Pending,
            last_seen: Some(now),
            local_updated_at: Some(now),
            ..external
        };
        self.store.upsert_device(&device).await?;
        DEVICES_ADDED_TOTAL.inc();
        info!("Device {} registered as pending", device.id);

        Ok(device)
    }

    /// One-shot cold start for a pending device with no stored readings:
    /// fetch complete samples, dedupe, persist, then mark the device active.
    pub async fn initiate_readings(&self, device_id: &str) -> Result<InitiationSummary> {
        info!("Initiating readings for device {}", device_id);

        let device = self
            .store
            .get_device(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("No device found with id {}", device_id)))?;

        let stored = self.store.count_readings(device_id).await?;
        if stored != 0 || device.status != DeviceStatus::Pending {
            return Err(Error::PreconditionFailed(format!(
                "Device {} has {} stored readings and status {}; initiation requires none and pending",
                device_id, stored, device.status
            )));
        }

        let filter = ReadingFilter::complete(&self.options.required_channels);
        let fetched = self
            .readings
            .list_readings(device_id, &filter, SortOrder::InsertedAtDesc)
            .await?;
        let fetched_count = fetched.len();
        READINGS_FETCHED_TOTAL.inc_by(fetched_count as f64);
        info!("{} readings received for device {}", fetched_count, device_id);

        let complete: Vec<Reading> = fetched
            .into_iter()
            .filter(|r| self.accept(device_id, r))
            .collect();

        if complete.is_empty() {
            return Err(Error::NoData(format!(
                "No complete readings found for device {} in registry",
                device_id
            )));
        }

        let complete_count = complete.len();
        let unique = dedup::clean(complete);
        READINGS_DUPLICATE_TOTAL.inc_by((complete_count - unique.len()) as f64);
        info!("{} unique readings for device {}", unique.len(), device_id);

        let inserted = self.store.bulk_insert_readings(&unique).await?;
        READINGS_INSERTED_TOTAL.inc_by(inserted as f64);
        info!("Readings stored for device {}: {}", device_id, inserted);

        // a reconcile pass may have deactivated the device meanwhile
        let activated = self
            .store
            .transition_device_status(device_id, DeviceStatus::Pending, DeviceStatus::Active)
            .await?;
        if !activated {
            warn!(
                "Device {} left pending during initiation; {} readings kept, status unchanged",
                device_id, inserted
            );
            return Err(Error::PreconditionFailed(format!(
                "Device {} is no longer pending, not activated",
                device_id
            )));
        }
        info!("Device {} status updated to active", device_id);

        Ok(InitiationSummary {
            device_id: device_id.to_string(),
            fetched: fetched_count,
            unique: unique.len(),
            inserted,
        })
    }

    /// Runs [`initiate_readings`](Self::initiate_readings) for every pending
    /// device and gathers all outcomes.
    pub async fn initiate_pending(&self) -> Result<BatchSummary> {
        let start = Instant::now();
        let pending = self
            .store
            .find_devices(&DeviceFilter::with_status(DeviceStatus::Pending))
            .await?;

        if pending.is_empty() {
            info!("No pending devices to initiate");
            return Ok(BatchSummary::default());
        }
        info!("Initiating readings for {} pending devices", pending.len());

        let this = self.clone();
        let items: Vec<(String, String)> = pending.into_iter().map(|d| (d.id.clone(), d.id)).collect();
        let settled = settle_all(items, move |id| {
            let this = this.clone();
            async move { this.initiate_readings(&id).await }
        })
        .await;

        JOB_DURATION_SECONDS
            .with_label_values(&["initiate_pending"])
            .observe(start.elapsed().as_secs_f64());
        info!(
            "Readings initiation finished: {} succeeded, {} failed",
            settled.summary.succeeded,
            settled.summary.failed.len()
        );

        Ok(settled.summary)
    }

    fn accept(&self, device_id: &str, reading: &Reading) -> bool {
        if reading.device_id != device_id {
            warn!(
                "Dropping reading {}: belongs to device {}, expected {}",
                reading.id, reading.device_id, device_id
            );
            return false;
        }
        match validate_reading(reading, &self.options.required_channels) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping incomplete reading: {}", e);
                false
            }
        }
    }
}

fn keyed(devices: Vec<Device>) -> Vec<(String, Device)> {
    devices.into_iter().map(|d| (d.id.clone(), d)).collect()
}

fn log_reconcile(summary: &ReconcileSummary, elapsed: f64) {
    if summary.is_noop() {
        info!("Devices already in sync ({:.3}s)", elapsed);
        return;
    }
    let failed = summary.added.failed.len()
        + summary.updated.failed.len()
        + summary.deactivated.failed.len();
    if failed > 0 {
        warn!(
            "Device reconciliation finished with {} failures in {:.3}s",
            failed, elapsed
        );
    } else {
        info!(
            "Device reconciliation finished in {:.3}s: {} added, {} updated, {} deactivated",
            elapsed,
            summary.added.succeeded,
            summary.updated.succeeded,
            summary.deactivated.succeeded
        );
    }
}
