//! HTTP adapter for an Element-IoT style device registry.
//!
//! Wraps a `reqwest::Client` and exposes it through the
//! [`ExternalDeviceSource`] and [`ExternalReadingSource`] traits.

use crate::errors::{Error, Result};
use crate::model::{Device, DeviceStatus, Reading, ReadingFilter, SortOrder};
use crate::source::{ExternalDeviceSource, ExternalReadingSource};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 200;
const MAX_BACKOFF_MS: u64 = 2000;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub base_url: String,
    pub api_key: String,
    pub default_tag: Option<String>,
    pub page_size: usize,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    body: T,
    #[serde(default)]
    retrieve_after_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryDevice {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(deserialize_with = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryReading {
    pub id: String,
    pub device_id: String,
    #[serde(deserialize_with = "timestamp")]
    pub inserted_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "optional_timestamp")]
    pub measured_at: Option<DateTime<Utc>>,
    pub data: RegistryReadingData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryReadingData {
    #[serde(default)]
    pub battery: Option<f64>,
    #[serde(default)]
    pub iso1: Option<f64>,
    #[serde(default)]
    pub iso2: Option<f64>,
    #[serde(default)]
    pub loop1: Option<f64>,
    #[serde(default)]
    pub loop2: Option<f64>,
    #[serde(default)]
    pub temp: Option<f64>,
    #[serde(default, deserialize_with = "optional_timestamp")]
    pub meas_timestamp: Option<DateTime<Utc>>,
}

impl From<RegistryDevice> for Device {
    fn from(d: RegistryDevice) -> Self {
        let slug = match d.slug {
            Some(slug) if !slug.is_empty() => slug,
            _ => slugify(&d.name),
        };
        Device {
            id: d.id,
            name: d.name,
            slug,
            status: DeviceStatus::Pending,
            last_seen: None,
            updated_at: d.updated_at,
            local_updated_at: None,
        }
    }
}

impl From<RegistryReading> for Reading {
    fn from(r: RegistryReading) -> Self {
        // `measured_at` is the registry receipt time, `meas_timestamp` the device clock
        let ingested_at = r.measured_at.unwrap_or(r.inserted_at);
        Reading {
            id: r.id,
            device_id: r.device_id,
            measured_at: r.data.meas_timestamp.unwrap_or(ingested_at),
            ingested_at,
            battery: r.data.battery,
            iso1: r.data.iso1,
            iso2: r.data.iso2,
            loop1: r.data.loop1,
            loop2: r.data.loop2,
            temp: r.data.temp,
        }
    }
}

pub struct RegistryClient {
    http: reqwest::Client,
    config: RegistryConfig,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        info!("Registry client configured for {}", config.base_url);
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Envelope<T>> {
        let response = self
            .http
            .get(self.url(path))
            .query(&[("auth", self.config.api_key.as_str())])
            .query(query)
            .send()
            .await?;

        if let Some(e) = status_error(response.status(), path) {
            return Err(e);
        }

        Ok(response.json::<Envelope<T>>().await?)
    }

    /// GET with exponential backoff on transient failures
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Envelope<T>> {
        let mut attempt = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            attempt += 1;
            match self.get_once(path, query).await {
                Ok(envelope) => return Ok(envelope),
                Err(e) => {
                    if attempt >= MAX_RETRIES || !e.is_retryable() {
                        return Err(e);
                    }
                    warn!(
                        "Registry request {} failed (attempt {}/{}): {}. Retrying in {}ms...",
                        path, attempt, MAX_RETRIES, e, backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
            }
        }
    }

    /// Follows `retrieve_after` cursors until the listing is exhausted
    async fn get_all<T: DeserializeOwned>(
        &self,
        path: &str,
        query: Vec<(&str, String)>,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut page_query = query.clone();
            page_query.push(("limit", self.config.page_size.to_string()));
            if let Some(after) = &cursor {
                page_query.push(("retrieve_after", after.clone()));
            }

            let page: Envelope<Vec<T>> = self.get(path, &page_query).await?;
            let page_len = page.body.len();
            items.extend(page.body);
            debug!("Fetched page of {} from {} ({} total)", page_len, path, items.len());

            match page.retrieve_after_id {
                Some(next) if page_len >= self.config.page_size && page_len > 0 => cursor = Some(next),
                _ => break,
            }
        }

        Ok(items)
    }
}

#[async_trait]
impl ExternalDeviceSource for RegistryClient {
    async fn list_devices(&self, tag: Option<&str>) -> Result<Vec<Device>> {
        let path = match tag.or(self.config.default_tag.as_deref()) {
            Some(tag) => format!("tags/{}/devices", tag),
            None => "devices".to_string(),
        };
        let devices: Vec<RegistryDevice> = self.get_all(&path, Vec::new()).await?;
        info!("{} devices listed by registry", devices.len());
        Ok(devices.into_iter().map(Device::from).collect())
    }

    async fn get_device(&self, id: &str) -> Result<Device> {
        let envelope: Envelope<RegistryDevice> = self.get(&format!("devices/{}", id), &[]).await?;
        Ok(envelope.body.into())
    }
}

#[async_trait]
impl ExternalReadingSource for RegistryClient {
    async fn list_readings(
        &self,
        device_id: &str,
        filter: &ReadingFilter,
        order: SortOrder,
    ) -> Result<Vec<Reading>> {
        let mut query = sort_query(order);
        if let Some(expr) = filter_expression(filter) {
            query.push(("filter", expr));
        }
        let readings: Vec<RegistryReading> = self
            .get_all(&format!("devices/{}/readings", device_id), query)
            .await?;
        Ok(readings.into_iter().map(Reading::from).collect())
    }
}

/// Maps a non-success status; only server-side failures are worth retrying
fn status_error(status: StatusCode, path: &str) -> Option<Error> {
    if status.is_success() {
        return None;
    }
    let message = format!("Registry returned {} for {}", status, path);
    Some(match status {
        StatusCode::NOT_FOUND => Error::NotFound(format!("Registry resource {}", path)),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Error::UpstreamUnavailable(message)
        }
        s if s.is_client_error() => Error::RegistryRejected(message),
        _ => Error::UpstreamUnavailable(message),
    })
}

fn sort_query(order: SortOrder) -> Vec<(&'static str, String)> {
    let direction = match order {
        SortOrder::InsertedAtDesc => "desc",
        SortOrder::InsertedAtAsc => "asc",
    };
    vec![
        ("sort", "inserted_at".to_string()),
        ("sort_direction", direction.to_string()),
    ]
}

/// Registry filter expression, e.g. `data.iso1!=null&&data.iso2!=null`
pub fn filter_expression(filter: &ReadingFilter) -> Option<String> {
    if filter.required_channels.is_empty() {
        return None;
    }
    Some(
        filter
            .required_channels
            .iter()
            .map(|c| format!("data.{}!=null", c))
            .collect::<Vec<_>>()
            .join("&&"),
    )
}

/// Lowercase ASCII slug with single dashes between words
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    // registry sometimes omits the offset; those values are UTC
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))
}

fn timestamp<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(d)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

fn optional_timestamp<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
    match Option::<String>::deserialize(d)? {
        Some(raw) => parse_timestamp(&raw).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
