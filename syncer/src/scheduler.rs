use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Runs `job` every `period` until `true` is published on `shutdown`.
///
/// The first run happens immediately. A run that outlasts the period makes
/// the scheduler skip the missed ticks instead of bursting.
pub async fn run_periodic<F, Fut, T, E>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: std::fmt::Debug,
    E: std::fmt::Display,
{
    info!("Starting {} job every {:?}", name, period);

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {
                let start = Instant::now();
                match job().await {
                    Ok(outcome) => {
                        info!("{} job finished in {:.3}s", name, start.elapsed().as_secs_f64());
                        debug!("{} outcome: {:?}", name, outcome);
                    }
                    Err(e) => {
                        error!("{} job failed after {:.3}s: {}", name, start.elapsed().as_secs_f64(), e);
                    }
                }
            }

            changed = shutdown.changed() => {
                // sender dropped counts as shutdown
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("{} job stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_runs_until_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);

        let counter = runs.clone();
        let handle = tokio::spawn(run_periodic(
            "test",
            Duration::from_millis(10),
            rx,
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(55)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let after_stop = runs.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "expected repeated runs, got {}", after_stop);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_failing_job_keeps_schedule() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);

        let counter = runs.clone();
        let handle = tokio::spawn(run_periodic(
            "failing",
            Duration::from_millis(10),
            rx,
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("registry unreachable")
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(45)).await;
        drop(tx);
        handle.await.unwrap();

        assert!(runs.load(Ordering::SeqCst) >= 2);
    }
}
