mod registry;
mod telemetry;

use chrono::Utc;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use registry::{AppState, Registry};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use telemetry::{generate_device, generate_history, Faults};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Serves a fake device registry with noisy readings for the syncer
#[derive(Debug, Parser)]
struct Args {
    #[arg(long, env = "SIM_ADDR", default_value = "0.0.0.0:9090")]
    addr: String,
    #[arg(long, env = "SIM_TAG", default_value = "leak-sensors")]
    tag: String,
    /// Require `?auth=<key>` on every request when set
    #[arg(long, env = "SIM_API_KEY")]
    api_key: Option<String>,
    #[arg(long, env = "DEVICES", default_value_t = 20)]
    devices: usize,
    #[arg(long, env = "READINGS_PER_DEVICE", default_value_t = 240)]
    readings: usize,
    #[arg(long, env = "SIM_SEED")]
    seed: Option<u64>,
    #[arg(long, default_value_t = 0.05)]
    duplicate_rate: f64,
    #[arg(long, default_value_t = 0.02)]
    skew_rate: f64,
    #[arg(long, default_value_t = 0.05)]
    outlier_rate: f64,
    #[arg(long, default_value_t = 0.03)]
    incomplete_rate: f64,
    /// Seconds between registry changes (rename, add, retire); 0 disables
    #[arg(long, env = "CHURN_SECS", default_value_t = 0)]
    churn_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let faults = Faults {
        duplicate: args.duplicate_rate.clamp(0.0, 1.0),
        skew: args.skew_rate.clamp(0.0, 1.0),
        outlier: args.outlier_rate.clamp(0.0, 1.0),
        incomplete: args.incomplete_rate.clamp(0.0, 1.0),
    };

    info!("Starting registry simulator");
    info!(
        "Devices: {}, readings per device: {}, tag: {}",
        args.devices, args.readings, args.tag
    );

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let now = Utc::now();
    let mut state = Registry::default();
    for index in 0..args.devices {
        let device = generate_device(&mut rng, index, now);
        let history = generate_history(&mut rng, &device.id, args.readings, faults, now);
        state.readings.insert(device.id.clone(), history);
        state.devices.push(device);
    }
    let registry = Arc::new(RwLock::new(state));

    if args.churn_secs > 0 {
        tokio::spawn(churn(
            registry.clone(),
            Duration::from_secs(args.churn_secs),
            args.readings,
            faults,
            rng.gen(),
        ));
    }

    let app = registry::create_router(AppState {
        registry,
        tag: args.tag,
        api_key: args.api_key,
    });

    let listener = match tokio::net::TcpListener::bind(&args.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", args.addr, e);
            return;
        }
    };
    info!("Registry simulator listening on {}", args.addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
    };
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!("HTTP server error: {}", e);
    }
}

/// Periodically renames, adds or retires a device so that reconciliation
/// has something to do
async fn churn(
    registry: Arc<RwLock<Registry>>,
    period: Duration,
    readings: usize,
    faults: Faults,
    seed: u64,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    let mut next_index = 1000;

    loop {
        ticker.tick().await;
        let now = Utc::now();
        let Ok(mut state) = registry.write() else {
            error!("Registry lock poisoned, churn stopped");
            return;
        };

        match rng.gen_range(0..3) {
            0 if !state.devices.is_empty() => {
                let i = rng.gen_range(0..state.devices.len());
                let device = &mut state.devices[i];
                device.name = format!("{} (moved)", device.name);
                device.slug = format!("{}-moved", device.slug);
                device.updated_at = now;
                info!("Renamed device {}", device.id);
            }
            1 if !state.devices.is_empty() => {
                let i = rng.gen_range(0..state.devices.len());
                let device = state.devices.remove(i);
                info!("Retired device {}", device.id);
            }
            _ => {
                let device = generate_device(&mut rng, next_index, now);
                next_index += 1;
                let history = generate_history(&mut rng, &device.id, readings, faults, now);
                info!("Registered device {}", device.id);
                state.readings.insert(device.id.clone(), history);
                state.devices.push(device);
            }
        }
    }
}
