#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use syncer::model::{
    Device, DeviceFilter, DeviceStatus, Reading, ReadingFilter, SortOrder, StatisticsSnapshot,
};
use syncer::source::{ExternalDeviceSource, ExternalReadingSource};
use syncer::store::{MemoryStore, Store};
use syncer::{Error, Result};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 8, 4, 0, 13).unwrap()
}

pub fn device(id: &str, status: DeviceStatus, updated_at: DateTime<Utc>) -> Device {
    Device {
        id: id.to_string(),
        name: format!("Sensor {}", id),
        slug: format!("sensor-{}", id.to_lowercase()),
        status,
        last_seen: None,
        updated_at,
        local_updated_at: None,
    }
}

pub fn external(id: &str, updated_at: DateTime<Utc>) -> Device {
    device(id, DeviceStatus::Pending, updated_at)
}

/// Complete reading measured `day` days after t0, received 11 hours later
pub fn reading(id: &str, device_id: &str, day: i64, loop1: f64) -> Reading {
    let measured_at = t0() + Duration::days(day);
    Reading {
        id: id.to_string(),
        device_id: device_id.to_string(),
        measured_at,
        ingested_at: measured_at + Duration::hours(11),
        battery: Some(3.42),
        iso1: Some(10000.0),
        iso2: Some(10000.0),
        loop1: Some(loop1),
        loop2: Some(4015.0),
        temp: None,
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    devices: Mutex<Vec<Device>>,
    readings: Mutex<HashMap<String, Vec<Reading>>>,
    reading_calls: AtomicUsize,
    unavailable: Mutex<bool>,
}

impl FakeRegistry {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices: Mutex::new(devices),
            ..Default::default()
        }
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        *self.devices.lock().unwrap() = devices;
    }

    pub fn set_readings(&self, device_id: &str, readings: Vec<Reading>) {
        self.readings
            .lock()
            .unwrap()
            .insert(device_id.to_string(), readings);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    pub fn reading_calls(&self) -> usize {
        self.reading_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExternalDeviceSource for FakeRegistry {
    async fn list_devices(&self, _tag: Option<&str>) -> Result<Vec<Device>> {
        if *self.unavailable.lock().unwrap() {
            return Err(Error::UpstreamUnavailable("registry offline".to_string()));
        }
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn get_device(&self, id: &str) -> Result<Device> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }
}

#[async_trait]
impl ExternalReadingSource for FakeRegistry {
    // ignores the filter so that callers must drop incomplete samples themselves
    async fn list_readings(
        &self,
        device_id: &str,
        _filter: &ReadingFilter,
        _order: SortOrder,
    ) -> Result<Vec<Reading>> {
        self.reading_calls.fetch_add(1, Ordering::SeqCst);
        if *self.unavailable.lock().unwrap() {
            return Err(Error::UpstreamUnavailable("registry offline".to_string()));
        }
        Ok(self
            .readings
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Delegates to a [`MemoryStore`] but fails every write touching the listed devices
pub struct FlakyStore {
    pub inner: MemoryStore,
    failing: HashSet<String>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore, failing: &[&str]) -> Self {
        Self {
            inner,
            failing: failing.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn check(&self, id: &str) -> Result<()> {
        if self.failing.contains(id) {
            return Err(Error::UpstreamUnavailable(format!("write for {} rejected", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn find_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>> {
        self.inner.find_devices(filter).await
    }

    async fn upsert_device(&self, device: &Device) -> Result<()> {
        self.check(&device.id)?;
        self.inner.upsert_device(device).await
    }

    async fn set_device_status(&self, id: &str, status: DeviceStatus) -> Result<()> {
        self.check(id)?;
        self.inner.set_device_status(id, status).await
    }

    async fn transition_device_status(
        &self,
        id: &str,
        from: DeviceStatus,
        to: DeviceStatus,
    ) -> Result<bool> {
        self.check(id)?;
        self.inner.transition_device_status(id, from, to).await
    }

    async fn count_readings(&self, device_id: &str) -> Result<u64> {
        self.inner.count_readings(device_id).await
    }

    async fn bulk_insert_readings(&self, readings: &[Reading]) -> Result<u64> {
        if let Some(r) = readings.first() {
            self.check(&r.device_id)?;
        }
        self.inner.bulk_insert_readings(readings).await
    }

    async fn find_readings(&self, device_id: &str, limit: Option<usize>) -> Result<Vec<Reading>> {
        self.inner.find_readings(device_id, limit).await
    }

    async fn upsert_statistics(&self, snapshot: &StatisticsSnapshot) -> Result<()> {
        self.check(&snapshot.device_id)?;
        self.inner.upsert_statistics(snapshot).await
    }

    async fn find_statistics(&self, device_id: &str) -> Result<Vec<StatisticsSnapshot>> {
        self.inner.find_statistics(device_id).await
    }

    async fn prune_statistics(&self, device_id: &str, before: DateTime<Utc>) -> Result<u64> {
        self.check(device_id)?;
        self.inner.prune_statistics(device_id, before).await
    }
}
