use crate::errors::Result;
use crate::model::Device;
use crate::validate::validate_external_devices;
use std::collections::{HashMap, HashSet};

/// Three-way diff between the registry device list and the local snapshot.
///
/// The three sets are disjoint by construction: `to_add` and `to_update`
/// come from external IDs (absent vs. present locally) and `to_deactivate`
/// only holds IDs missing from the external list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceDiff {
    /// External devices unknown locally
    pub to_add: Vec<Device>,
    /// External devices modified upstream after the local copy
    pub to_update: Vec<Device>,
    /// Local devices no longer listed by the registry
    pub to_deactivate: Vec<Device>,
}

impl DeviceDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_deactivate.is_empty()
    }
}

/// Computes the diff. Pure; fails only when the external list itself is
/// malformed (empty or duplicate IDs).
pub fn diff(external: &[Device], local: &[Device]) -> Result<DeviceDiff> {
    validate_external_devices(external)?;

    let local_by_id: HashMap<&str, &Device> = local.iter().map(|d| (d.id.as_str(), d)).collect();
    let external_ids: HashSet<&str> = external.iter().map(|d| d.id.as_str()).collect();

    let mut result = DeviceDiff::default();

    for device in external {
        match local_by_id.get(device.id.as_str()) {
            None => result.to_add.push(device.clone()),
            Some(stored) if device.updated_at > stored.updated_at => {
                result.to_update.push(device.clone())
            }
            Some(_) => {}
        }
    }

    result.to_deactivate = local
        .iter()
        .filter(|d| !external_ids.contains(d.id.as_str()))
        .cloned()
        .collect();

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::model::DeviceStatus;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, 3, 0, 0).unwrap()
    }

    fn device(id: &str, updated_at: DateTime<Utc>) -> Device {
        Device {
            id: id.to_string(),
            name: format!("Device {}", id),
            slug: id.to_lowercase(),
            status: DeviceStatus::Pending,
            last_seen: None,
            updated_at,
            local_updated_at: None,
        }
    }

    fn ids(devices: &[Device]) -> Vec<&str> {
        devices.iter().map(|d| d.id.as_str()).collect()
    }

    #[test]
    fn test_new_external_device_is_added() {
        let t1 = t0() + Duration::hours(1);
        let local = vec![device("A", t0())];
        let external = vec![device("A", t0()), device("B", t1)];

        let result = diff(&external, &local).unwrap();
        assert_eq!(ids(&result.to_add), vec!["B"]);
        assert!(result.to_update.is_empty());
        assert!(result.to_deactivate.is_empty());
    }

    #[test]
    fn test_missing_external_device_is_deactivated() {
        let local = vec![device("A", t0()), device("C", t0())];
        let external = vec![device("A", t0())];

        let result = diff(&external, &local).unwrap();
        assert_eq!(ids(&result.to_deactivate), vec!["C"]);
        assert!(result.to_add.is_empty());
        assert!(result.to_update.is_empty());
    }

    #[test]
    fn test_only_strictly_newer_is_updated() {
        let local = vec![device("A", t0()), device("B", t0()), device("C", t0())];
        let external = vec![
            device("A", t0()),
            device("B", t0() + Duration::seconds(1)),
            device("C", t0() - Duration::days(1)),
        ];

        let result = diff(&external, &local).unwrap();
        assert_eq!(ids(&result.to_update), vec!["B"]);
        assert!(result.to_add.is_empty());
    }

    #[test]
    fn test_inactive_local_device_is_deactivated_again() {
        let mut gone = device("Z", t0());
        gone.status = DeviceStatus::Inactive;

        let result = diff(&[device("A", t0())], &[gone]).unwrap();
        assert_eq!(ids(&result.to_deactivate), vec!["Z"]);
        assert_eq!(ids(&result.to_add), vec!["A"]);
    }

    #[test]
    fn test_partitions_are_disjoint() {
        let local = vec![device("A", t0()), device("B", t0()), device("D", t0())];
        let external = vec![
            device("A", t0()),
            device("B", t0() + Duration::hours(2)),
            device("C", t0()),
        ];

        let result = diff(&external, &local).unwrap();
        let mut all: Vec<&str> = ids(&result.to_add);
        all.extend(ids(&result.to_update));
        all.extend(ids(&result.to_deactivate));
        let unique: HashSet<&str> = all.iter().copied().collect();
        assert_eq!(all.len(), unique.len());
        assert_eq!(unique, HashSet::from(["B", "C", "D"]));
    }

    #[test]
    fn test_unchanged_state_is_noop() {
        let devices = vec![device("A", t0()), device("B", t0())];
        assert!(diff(&devices, &devices).unwrap().is_empty());
        assert!(diff(&[], &[]).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_external_ids_rejected() {
        let external = vec![device("A", t0()), device("A", t0())];
        assert!(matches!(diff(&external, &[]), Err(Error::InvalidInput(_))));
    }
}
