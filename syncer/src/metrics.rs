use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref DEVICES_ADDED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "syncer_devices_added_total",
        "Devices created locally from the registry"
    ))
    .expect("valid metric");
    pub static ref DEVICES_UPDATED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "syncer_devices_updated_total",
        "Devices refreshed from newer registry metadata"
    ))
    .expect("valid metric");
    pub static ref DEVICES_DEACTIVATED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "syncer_devices_deactivated_total",
        "Devices marked inactive after leaving the registry"
    ))
    .expect("valid metric");
    pub static ref DEVICE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "syncer_device_failures_total",
        "Per-device units of work that failed inside a batch"
    ))
    .expect("valid metric");
    pub static ref READINGS_FETCHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "syncer_readings_fetched_total",
        "Readings received from the registry"
    ))
    .expect("valid metric");
    pub static ref READINGS_DUPLICATE_TOTAL: Counter = Counter::with_opts(Opts::new(
        "syncer_readings_duplicate_total",
        "Readings dropped as duplicate measurement timestamps"
    ))
    .expect("valid metric");
    pub static ref READINGS_INSERTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "syncer_readings_inserted_total",
        "Readings written to the store"
    ))
    .expect("valid metric");
    pub static ref STATISTICS_WRITTEN_TOTAL: Counter = Counter::with_opts(Opts::new(
        "syncer_statistics_written_total",
        "Statistic values upserted"
    ))
    .expect("valid metric");
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "syncer_db_failures_total",
        "Total database write failures"
    ))
    .expect("valid metric");
    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "syncer_job_duration_seconds",
            "Time taken by a sync or statistics job"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["job"]
    )
    .expect("valid metric");
}

pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(DEVICES_ADDED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEVICES_UPDATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEVICES_DEACTIVATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEVICE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_FETCHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_DUPLICATE_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_INSERTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STATISTICS_WRITTEN_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_metrics_are_exported() {
        init_metrics().unwrap();
        DEVICES_ADDED_TOTAL.inc();
        JOB_DURATION_SECONDS
            .with_label_values(&["reconcile_devices"])
            .observe(0.2);

        let text = gather_metrics();
        assert!(text.contains("syncer_devices_added_total"));
        assert!(text.contains("syncer_job_duration_seconds_bucket"));

        // a second registration is refused
        assert!(init_metrics().is_err());
    }
}
