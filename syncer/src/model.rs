use crate::errors::{Error, Result};
use crate::stats::Summary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a locally tracked device.
///
/// Allowed transitions are `Pending -> Active` (first readings ingestion)
/// and `* -> Inactive` (device vanished from the registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Active,
    Inactive,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Active => "active",
            DeviceStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(DeviceStatus::Pending),
            "active" => Ok(DeviceStatus::Active),
            "inactive" => Ok(DeviceStatus::Inactive),
            other => Err(Error::InvalidInput(format!("Unknown device status '{}'", other))),
        }
    }
}

/// A device as known to the registry or to the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    /// Last modification reported by the registry
    pub updated_at: DateTime<Utc>,
    /// Last local write of this record
    pub local_updated_at: Option<DateTime<Utc>>,
}

/// Numeric sensor channels carried by a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Battery,
    Iso1,
    Iso2,
    Loop1,
    Loop2,
    Temp,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Battery,
        Channel::Iso1,
        Channel::Iso2,
        Channel::Loop1,
        Channel::Loop2,
        Channel::Temp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Battery => "battery",
            Channel::Iso1 => "iso1",
            Channel::Iso2 => "iso2",
            Channel::Loop1 => "loop1",
            Channel::Loop2 => "loop2",
            Channel::Temp => "temp",
        }
    }

    /// Parses a comma separated channel list such as `iso1,iso2,loop1`
    pub fn parse_list(list: &str) -> Result<Vec<Channel>> {
        let mut channels = Vec::new();
        for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let channel = part.parse::<Channel>()?;
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
        Ok(channels)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown channel '{}'", s)))
    }
}

/// A single measurement sample of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    pub id: String,
    pub device_id: String,
    /// Measurement time as reported by the device (dedup key)
    pub measured_at: DateTime<Utc>,
    /// Time the registry recorded the sample
    pub ingested_at: DateTime<Utc>,
    pub battery: Option<f64>,
    pub iso1: Option<f64>,
    pub iso2: Option<f64>,
    pub loop1: Option<f64>,
    pub loop2: Option<f64>,
    pub temp: Option<f64>,
}

impl Reading {
    pub fn value(&self, channel: Channel) -> Option<f64> {
        match channel {
            Channel::Battery => self.battery,
            Channel::Iso1 => self.iso1,
            Channel::Iso2 => self.iso2,
            Channel::Loop1 => self.loop1,
            Channel::Loop2 => self.loop2,
            Channel::Temp => self.temp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticKind {
    Mean,
    Median,
    StdDev,
    Mad,
    Iqr,
}

impl StatisticKind {
    pub const ALL: [StatisticKind; 5] = [
        StatisticKind::Mean,
        StatisticKind::Median,
        StatisticKind::StdDev,
        StatisticKind::Mad,
        StatisticKind::Iqr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatisticKind::Mean => "mean",
            StatisticKind::Median => "median",
            StatisticKind::StdDev => "std_dev",
            StatisticKind::Mad => "mad",
            StatisticKind::Iqr => "iqr",
        }
    }

    pub fn select(&self, summary: &Summary) -> f64 {
        match self {
            StatisticKind::Mean => summary.mean,
            StatisticKind::Median => summary.median,
            StatisticKind::StdDev => summary.std_dev,
            StatisticKind::Mad => summary.mad,
            StatisticKind::Iqr => summary.iqr,
        }
    }
}

impl FromStr for StatisticKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StatisticKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown statistic kind '{}'", s)))
    }
}

/// One derived value per (device, channel, kind); rebuilt on every pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub device_id: String,
    pub channel: Channel,
    pub kind: StatisticKind,
    pub value: f64,
    pub sample_size: u64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceFilter {
    pub ids: Option<Vec<String>>,
    pub status: Option<DeviceStatus>,
}

impl DeviceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: &str) -> Self {
        Self {
            ids: Some(vec![id.to_string()]),
            status: None,
        }
    }

    pub fn with_status(status: DeviceStatus) -> Self {
        Self {
            ids: None,
            status: Some(status),
        }
    }

    pub fn matches(&self, device: &Device) -> bool {
        let id_ok = self
            .ids
            .as_ref()
            .map_or(true, |ids| ids.iter().any(|id| id == &device.id));
        let status_ok = self.status.map_or(true, |s| s == device.status);
        id_ok && status_ok
    }
}

/// Restricts registry readings to samples carrying every listed channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingFilter {
    pub required_channels: Vec<Channel>,
}

impl ReadingFilter {
    pub fn complete(required_channels: &[Channel]) -> Self {
        Self {
            required_channels: required_channels.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    InsertedAtDesc,
    InsertedAtAsc,
}

/// A unit of work inside a batch that did not complete
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFailure {
    pub id: String,
    pub error: String,
}

/// Gather-all-settled outcome of a fan-out
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: Vec<ItemFailure>,
}

impl BatchSummary {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileSummary {
    pub added: BatchSummary,
    pub updated: BatchSummary,
    pub deactivated: BatchSummary,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.added.attempted() == 0
            && self.updated.attempted() == 0
            && self.deactivated.attempted() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitiationSummary {
    pub device_id: String,
    pub fetched: usize,
    pub unique: usize,
    pub inserted: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatistics {
    pub channel: Channel,
    /// Values present before outlier removal
    pub raw_size: usize,
    pub summary: Option<Summary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecomputeSummary {
    pub device_id: String,
    pub sample_count: usize,
    pub channels: Vec<ChannelStatistics>,
    pub written: usize,
    pub failed: Vec<ItemFailure>,
}

impl RecomputeSummary {
    pub fn empty(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            sample_count: 0,
            channels: Vec::new(),
            written: 0,
            failed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub device_id: String,
    pub data: Vec<Reading>,
    pub total: usize,
    pub limit: usize,
}
