use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct SimDevice {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimReading {
    pub id: String,
    pub device_id: String,
    pub inserted_at: DateTime<Utc>,
    pub measured_at: DateTime<Utc>,
    pub data: SimReadingData,
}

/// Payload as decoded by the registry parser; missing channels are `null`
#[derive(Debug, Clone, Serialize)]
pub struct SimReadingData {
    pub battery: Option<f64>,
    pub iso1: Option<f64>,
    pub iso2: Option<f64>,
    pub loop1: Option<f64>,
    pub loop2: Option<f64>,
    pub meas_timestamp: DateTime<Utc>,
}

impl SimReadingData {
    pub fn channel(&self, name: &str) -> Option<f64> {
        match name {
            "battery" => self.battery,
            "iso1" => self.iso1,
            "iso2" => self.iso2,
            "loop1" => self.loop1,
            "loop2" => self.loop2,
            _ => None,
        }
    }
}

/// Probabilities of the faults injected into generated readings
#[derive(Debug, Clone, Copy)]
pub struct Faults {
    pub duplicate: f64,
    pub skew: f64,
    pub outlier: f64,
    pub incomplete: f64,
}

pub fn generate_device(rng: &mut impl Rng, index: usize, now: DateTime<Utc>) -> SimDevice {
    let name = format!("Leak Sensor {:03}", index);
    SimDevice {
        id: Uuid::new_v4().to_string(),
        slug: name.to_lowercase().replace(' ', "-"),
        name,
        updated_at: now - Duration::minutes(rng.gen_range(0..60 * 24 * 30)),
    }
}

/// Hourly history for one device, newest first like the registry returns it.
pub fn generate_history(
    rng: &mut impl Rng,
    device_id: &str,
    count: usize,
    faults: Faults,
    now: DateTime<Utc>,
) -> Vec<SimReading> {
    let base_loop = rng.gen_range(4000.0..4060.0);
    let mut readings: Vec<SimReading> = Vec::with_capacity(count + count / 10);

    for step in 0..count {
        let inserted_at = now - Duration::hours(step as i64) - Duration::seconds(rng.gen_range(0..600));

        if rng.gen_bool(faults.duplicate) {
            if let Some(previous) = readings.last() {
                // same sample delivered twice by the gateway
                let mut copy = previous.clone();
                copy.id = Uuid::new_v4().to_string();
                copy.inserted_at = inserted_at;
                copy.measured_at = inserted_at;
                readings.push(copy);
                continue;
            }
        }

        let meas_timestamp = if rng.gen_bool(faults.skew) {
            // device clock lost its sync
            inserted_at - Duration::days(rng.gen_range(2..400))
        } else {
            inserted_at - Duration::seconds(rng.gen_range(1..120))
        };

        let mut data = SimReadingData {
            battery: Some(rng.gen_range(3.2..3.6)),
            iso1: Some(if rng.gen_bool(faults.outlier) { rng.gen_range(0.0..500.0) } else { 10000.0 }),
            iso2: Some(10000.0),
            loop1: Some(loop_current(rng, base_loop, faults.outlier)),
            loop2: Some(loop_current(rng, base_loop, faults.outlier)),
            meas_timestamp,
        };
        if rng.gen_bool(faults.incomplete) {
            match rng.gen_range(0..4) {
                0 => data.iso1 = None,
                1 => data.iso2 = None,
                2 => data.loop1 = None,
                _ => data.loop2 = None,
            }
        }

        readings.push(SimReading {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            inserted_at,
            measured_at: inserted_at,
            data,
        });
    }

    readings
}

fn loop_current(rng: &mut impl Rng, base: f64, outlier: f64) -> f64 {
    if rng.gen_bool(outlier) {
        rng.gen_range(0.0..20000.0)
    } else {
        base + rng.gen_range(-5.0..5.0)
    }
}
