//! Persistence interface and an in-memory implementation.
//!
//! Store contract shared by every implementation:
//! * `upsert_device` creates a record or refreshes name, slug and timestamps
//!   of an existing one; it never changes the status of an existing record.
//! * `set_device_status` and `transition_device_status` are the only ways to
//!   change a status.
//! * `bulk_insert_readings` silently skips readings whose ID or
//!   `(device_id, measured_at)` already exists and returns the inserted count.

use crate::errors::{Error, Result};
use crate::model::{Channel, Device, DeviceFilter, DeviceStatus, Reading, StatisticKind, StatisticsSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>>;

    async fn upsert_device(&self, device: &Device) -> Result<()>;

    async fn set_device_status(&self, id: &str, status: DeviceStatus) -> Result<()>;

    /// Moves a device from `from` to `to` only if it is still in `from`.
    /// Returns `false` when the stored status differs.
    async fn transition_device_status(
        &self,
        id: &str,
        from: DeviceStatus,
        to: DeviceStatus,
    ) -> Result<bool>;

    async fn count_readings(&self, device_id: &str) -> Result<u64>;

    async fn bulk_insert_readings(&self, readings: &[Reading]) -> Result<u64>;

    /// Readings of a device, newest measurement first
    async fn find_readings(&self, device_id: &str, limit: Option<usize>) -> Result<Vec<Reading>>;

    async fn upsert_statistics(&self, snapshot: &StatisticsSnapshot) -> Result<()>;

    async fn find_statistics(&self, device_id: &str) -> Result<Vec<StatisticsSnapshot>>;

    /// Deletes statistics of a device computed before `before`; returns the count
    async fn prune_statistics(&self, device_id: &str, before: DateTime<Utc>) -> Result<u64>;

    async fn get_device(&self, id: &str) -> Result<Option<Device>> {
        Ok(self.find_devices(&DeviceFilter::by_id(id)).await?.into_iter().next())
    }
}

#[derive(Default)]
struct MemoryState {
    devices: BTreeMap<String, Device>,
    readings: Vec<Reading>,
    statistics: BTreeMap<(String, Channel, StatisticKind), StatisticsSnapshot>,
    writes: usize,
}

/// Process-local store used by tests and dry runs
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds devices without counting them as writes
    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let store = Self::new();
        if let Ok(mut state) = store.state.lock() {
            for device in devices {
                state.devices.insert(device.id.clone(), device);
            }
        }
        store
    }

    /// Number of mutating calls that reached the store
    pub fn writes(&self) -> usize {
        self.state.lock().map(|s| s.writes).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::UpstreamUnavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>> {
        let state = self.lock()?;
        Ok(state
            .devices
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }

    async fn upsert_device(&self, device: &Device) -> Result<()> {
        let mut state = self.lock()?;
        state.writes += 1;
        match state.devices.get_mut(&device.id) {
            Some(stored) => {
                stored.name = device.name.clone();
                stored.slug = device.slug.clone();
                stored.updated_at = device.updated_at;
                stored.local_updated_at = device.local_updated_at;
                if device.last_seen.is_some() {
                    stored.last_seen = device.last_seen;
                }
            }
            None => {
                state.devices.insert(device.id.clone(), device.clone());
            }
        }
        Ok(())
    }

    async fn set_device_status(&self, id: &str, status: DeviceStatus) -> Result<()> {
        let mut state = self.lock()?;
        state.writes += 1;
        let device = state
            .devices
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Device {}", id)))?;
        device.status = status;
        device.local_updated_at = Some(Utc::now());
        Ok(())
    }

    async fn transition_device_status(
        &self,
        id: &str,
        from: DeviceStatus,
        to: DeviceStatus,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        state.writes += 1;
        let device = state
            .devices
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Device {}", id)))?;
        if device.status != from {
            return Ok(false);
        }
        device.status = to;
        device.local_updated_at = Some(Utc::now());
        Ok(true)
    }

    async fn count_readings(&self, device_id: &str) -> Result<u64> {
        let state = self.lock()?;
        Ok(state.readings.iter().filter(|r| r.device_id == device_id).count() as u64)
    }

    async fn bulk_insert_readings(&self, readings: &[Reading]) -> Result<u64> {
        let mut state = self.lock()?;
        state.writes += 1;

        let mut ids: HashSet<String> = state.readings.iter().map(|r| r.id.clone()).collect();
        let mut keys: HashSet<(String, DateTime<Utc>)> = state
            .readings
            .iter()
            .map(|r| (r.device_id.clone(), r.measured_at))
            .collect();

        let mut inserted = 0;
        for reading in readings {
            let key = (reading.device_id.clone(), reading.measured_at);
            if ids.contains(&reading.id) || keys.contains(&key) {
                continue;
            }
            ids.insert(reading.id.clone());
            keys.insert(key);
            state.readings.push(reading.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn find_readings(&self, device_id: &str, limit: Option<usize>) -> Result<Vec<Reading>> {
        let state = self.lock()?;
        let mut readings: Vec<Reading> = state
            .readings
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect();
        readings.sort_by(|a, b| b.measured_at.cmp(&a.measured_at));
        if let Some(limit) = limit {
            readings.truncate(limit);
        }
        Ok(readings)
    }

    async fn upsert_statistics(&self, snapshot: &StatisticsSnapshot) -> Result<()> {
        let mut state = self.lock()?;
        state.writes += 1;
        let key = (snapshot.device_id.clone(), snapshot.channel, snapshot.kind);
        state.statistics.insert(key, snapshot.clone());
        Ok(())
    }

    async fn find_statistics(&self, device_id: &str) -> Result<Vec<StatisticsSnapshot>> {
        let state = self.lock()?;
        Ok(state
            .statistics
            .values()
            .filter(|s| s.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn prune_statistics(&self, device_id: &str, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock()?;
        state.writes += 1;
        let count = state.statistics.len();
        state
            .statistics
            .retain(|_, s| s.device_id != device_id || s.computed_at >= before);
        Ok((count - state.statistics.len()) as u64)
    }
}
