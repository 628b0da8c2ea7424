use crate::model::Reading;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

/// Device clocks further than this from the registry receipt time are not trusted.
pub const MAX_CLOCK_SKEW_HOURS: i64 = 24;

/// Collapses a batch to one reading per distinct measurement timestamp.
///
/// The first occurrence wins and input order is preserved, so the caller's
/// ordering decides which duplicate survives.
pub fn dedupe(readings: Vec<Reading>) -> Vec<Reading> {
    let mut seen: HashSet<DateTime<Utc>> = HashSet::with_capacity(readings.len());
    readings
        .into_iter()
        .filter(|r| seen.insert(r.measured_at))
        .collect()
}

/// Picks the timestamp to persist for a reading: the device-reported time,
/// unless it is more than [`MAX_CLOCK_SKEW_HOURS`] away from the registry
/// receipt time.
pub fn resolve_measurement_time(reading: &Reading) -> DateTime<Utc> {
    let skew = (reading.ingested_at - reading.measured_at).abs();
    if skew > Duration::hours(MAX_CLOCK_SKEW_HOURS) {
        reading.ingested_at
    } else {
        reading.measured_at
    }
}

/// Dedupe, then rewrite each survivor's measurement time with
/// [`resolve_measurement_time`].
pub fn clean(readings: Vec<Reading>) -> Vec<Reading> {
    dedupe(readings)
        .into_iter()
        .map(|mut r| {
            r.measured_at = resolve_measurement_time(&r);
            r
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading(id: &str, measured_at: DateTime<Utc>, ingested_at: DateTime<Utc>) -> Reading {
        Reading {
            id: id.to_string(),
            device_id: "dev-1".to_string(),
            measured_at,
            ingested_at,
            battery: Some(3.42),
            iso1: Some(10000.0),
            iso2: Some(10000.0),
            loop1: Some(4032.0),
            loop2: Some(4019.0),
            temp: None,
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, hour, 0, 13).unwrap()
    }

    #[test]
    fn test_first_occurrence_wins_in_order() {
        let batch = vec![
            reading("r0", at(1), at(2)),
            reading("r1", at(3), at(4)),
            reading("r2", at(1), at(5)),
            reading("r3", at(6), at(7)),
        ];

        let ids: Vec<String> = dedupe(batch).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r0", "r1", "r3"]);
    }

    #[test]
    fn test_dedupe_is_idempotent() {
        let batch = vec![
            reading("a", at(4), at(4)),
            reading("b", at(4), at(5)),
            reading("c", at(2), at(5)),
        ];

        let once = dedupe(batch.clone());
        assert!(once.len() <= batch.len());
        assert_eq!(dedupe(once.clone()), once);
    }

    #[test]
    fn test_dedupe_empty() {
        assert!(dedupe(Vec::new()).is_empty());
    }

    #[test]
    fn test_resolve_trusts_device_time_when_close() {
        let r = reading("a", at(4), at(4));
        assert_eq!(resolve_measurement_time(&r), at(4));

        let r = reading("b", at(1), at(12));
        assert_eq!(resolve_measurement_time(&r), at(1));
    }

    #[test]
    fn test_resolve_trusts_registry_time_on_skew() {
        let ingested = at(12);
        let r = reading("a", ingested - Duration::hours(48), ingested);
        assert_eq!(resolve_measurement_time(&r), ingested);

        // device clock running ahead
        let r = reading("b", ingested + Duration::days(400), ingested);
        assert_eq!(resolve_measurement_time(&r), ingested);
    }

    #[test]
    fn test_resolve_boundary_is_exclusive() {
        let ingested = at(12);
        let r = reading("a", ingested - Duration::hours(24), ingested);
        assert_eq!(resolve_measurement_time(&r), ingested - Duration::hours(24));
    }

    #[test]
    fn test_clean_dedupes_before_resolving() {
        let ingested = at(12);
        let skewed = ingested - Duration::hours(72);
        let batch = vec![
            reading("a", skewed, ingested),
            reading("b", skewed, ingested + Duration::hours(1)),
        ];

        let cleaned = clean(batch);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].id, "a");
        assert_eq!(cleaned[0].measured_at, ingested);
    }
}
