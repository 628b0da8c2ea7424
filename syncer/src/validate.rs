use crate::errors::{Error, Result};
use crate::model::{Channel, Device, Reading};
use std::collections::HashSet;

/// Validates that a registry reading is a complete sample
pub fn validate_reading(reading: &Reading, required: &[Channel]) -> Result<()> {
    // Validate ids
    if reading.id.is_empty() {
        return Err(Error::InvalidInput("Reading ID cannot be empty".to_string()));
    }
    if reading.device_id.is_empty() {
        return Err(Error::InvalidInput(format!(
            "Reading {} has an empty device ID",
            reading.id
        )));
    }

    // Validate required channels
    for channel in required {
        match reading.value(*channel) {
            Some(v) if v.is_finite() => {}
            Some(v) => {
                return Err(Error::InvalidInput(format!(
                    "Reading {} channel {} is not finite ({})",
                    reading.id, channel, v
                )))
            }
            None => {
                return Err(Error::InvalidInput(format!(
                    "Reading {} is missing channel {}",
                    reading.id, channel
                )))
            }
        }
    }

    Ok(())
}

/// Validates an external device batch: non-empty, unique IDs
pub fn validate_external_devices(devices: &[Device]) -> Result<()> {
    let mut seen = HashSet::with_capacity(devices.len());
    for device in devices {
        if device.id.is_empty() {
            return Err(Error::InvalidInput(format!(
                "Registry device '{}' has an empty ID",
                device.name
            )));
        }
        if !seen.insert(device.id.as_str()) {
            return Err(Error::InvalidInput(format!(
                "Registry returned device {} more than once",
                device.id
            )));
        }
    }
    Ok(())
}
