use crate::errors::{Error, Result};
use crate::fanout::settle_all;
use crate::metrics::{JOB_DURATION_SECONDS, STATISTICS_WRITTEN_TOTAL};
use crate::model::{
    BatchSummary, Channel, ChannelStatistics, DeviceFilter, DeviceStatus, ItemFailure, Reading,
    RecomputeSummary, StatisticKind, StatisticsSnapshot,
};
use crate::stats::{self, Summary, DEFAULT_OUTLIER_FACTOR};
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Rebuilds per-channel statistics of active devices from stored readings
#[derive(Clone)]
pub struct StatisticsAggregator {
    store: Arc<dyn Store>,
    channels: Vec<Channel>,
    outlier_factor: f64,
}

impl StatisticsAggregator {
    pub fn new(store: Arc<dyn Store>, channels: Vec<Channel>) -> Self {
        Self {
            store,
            channels,
            outlier_factor: DEFAULT_OUTLIER_FACTOR,
        }
    }

    pub fn with_outlier_factor(mut self, factor: f64) -> Self {
        self.outlier_factor = factor;
        self
    }

    /// Recomputes and overwrites every statistic of one device. Rows left
    /// over from channels that produced nothing in this pass are removed.
    ///
    /// A device that is not active, or has no stored readings, yields an
    /// empty summary rather than an error.
    pub async fn recompute(&self, device_id: &str) -> Result<RecomputeSummary> {
        info!("Generating statistics for device {}", device_id);

        let device = self
            .store
            .get_device(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("No device found with id {}", device_id)))?;

        if device.status != DeviceStatus::Active {
            info!(
                "Device {} is {}, statistics are only computed for active devices",
                device_id, device.status
            );
            return Ok(RecomputeSummary::empty(device_id));
        }

        let readings = self.store.find_readings(device_id, None).await?;
        if readings.is_empty() {
            warn!("Readings not found for device {}", device_id);
            return Ok(RecomputeSummary::empty(device_id));
        }

        let computed_at = Utc::now();
        let mut summary = RecomputeSummary::empty(device_id);
        summary.sample_count = readings.len();

        for channel in &self.channels {
            let series = extract(&readings, *channel);
            if series.is_empty() {
                debug!("Channel {} absent for device {}", channel, device_id);
                continue;
            }

            match self.summarize(&series) {
                Ok(Some(values)) => {
                    self.write(device_id, *channel, &values, computed_at, &mut summary)
                        .await;
                    summary.channels.push(ChannelStatistics {
                        channel: *channel,
                        raw_size: series.len(),
                        summary: Some(values),
                    });
                }
                Ok(None) => {
                    warn!(
                        "Every {} value of device {} was discarded as an outlier",
                        channel, device_id
                    );
                    summary.channels.push(ChannelStatistics {
                        channel: *channel,
                        raw_size: series.len(),
                        summary: None,
                    });
                }
                Err(e) => {
                    warn!("Statistics for {} of device {} failed: {}", channel, device_id, e);
                    summary.failed.push(ItemFailure {
                        id: channel.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        // rows of channels that were not rewritten in this pass are stale
        match self.store.prune_statistics(device_id, computed_at).await {
            Ok(0) => {}
            Ok(pruned) => debug!("Removed {} stale statistics of device {}", pruned, device_id),
            Err(e) => {
                warn!("Failed to remove stale statistics of device {}: {}", device_id, e);
                summary.failed.push(ItemFailure {
                    id: "stale_statistics".to_string(),
                    error: e.to_string(),
                });
            }
        }

        STATISTICS_WRITTEN_TOTAL.inc_by(summary.written as f64);
        info!(
            "Statistics for device {} updated: {} values over {} readings",
            device_id, summary.written, summary.sample_count
        );

        Ok(summary)
    }

    /// Runs [`recompute`](Self::recompute) for every active device.
    pub async fn recompute_all(&self) -> Result<BatchSummary> {
        let start = Instant::now();
        let active = self
            .store
            .find_devices(&DeviceFilter::with_status(DeviceStatus::Active))
            .await?;

        if active.is_empty() {
            warn!("No active devices found");
            return Ok(BatchSummary::default());
        }

        let this = self.clone();
        let items: Vec<(String, String)> = active.into_iter().map(|d| (d.id.clone(), d.id)).collect();
        let settled = settle_all(items, move |id| {
            let this = this.clone();
            async move { this.recompute(&id).await }
        })
        .await;

        JOB_DURATION_SECONDS
            .with_label_values(&["recompute_statistics"])
            .observe(start.elapsed().as_secs_f64());
        info!(
            "Statistics pass finished: {} devices succeeded, {} failed",
            settled.summary.succeeded,
            settled.summary.failed.len()
        );

        Ok(settled.summary)
    }

    fn summarize(&self, series: &[f64]) -> Result<Option<Summary>> {
        let kept = stats::remove_outliers(series, self.outlier_factor)?;
        if kept.is_empty() {
            return Ok(None);
        }
        stats::summarize(&kept).map(Some)
    }

    async fn write(
        &self,
        device_id: &str,
        channel: Channel,
        values: &Summary,
        computed_at: DateTime<Utc>,
        summary: &mut RecomputeSummary,
    ) {
        for kind in StatisticKind::ALL {
            let snapshot = StatisticsSnapshot {
                device_id: device_id.to_string(),
                channel,
                kind,
                value: kind.select(values),
                sample_size: values.sample_size as u64,
                computed_at,
            };
            match self.store.upsert_statistics(&snapshot).await {
                Ok(()) => summary.written += 1,
                Err(e) => {
                    warn!(
                        "Failed to store {} {} for device {}: {}",
                        channel,
                        kind.as_str(),
                        device_id,
                        e
                    );
                    summary.failed.push(ItemFailure {
                        id: format!("{}/{}", channel, kind.as_str()),
                        error: e.to_string(),
                    });
                }
            }
        }
    }
}

fn extract(readings: &[Reading], channel: Channel) -> Vec<f64> {
    readings.iter().filter_map(|r| r.value(channel)).collect()
}
