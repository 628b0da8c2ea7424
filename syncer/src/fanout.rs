use crate::errors::Result;
use crate::metrics::DEVICE_FAILURES_TOTAL;
use crate::model::{BatchSummary, ItemFailure};
use std::collections::HashMap;
use std::future::Future;
use tokio::task::{self, JoinSet};
use tracing::{error, warn};

/// Outputs of the units that succeeded, keyed by item ID
pub struct Settled<T> {
    pub summary: BatchSummary,
    pub outputs: Vec<(String, T)>,
}

/// Runs `job` for every item as an independent task and waits for all of
/// them. A failing or panicking task never cancels the others.
pub async fn settle_all<I, T, F, Fut>(items: Vec<(String, I)>, job: F) -> Settled<T>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut tasks = JoinSet::new();
    let mut owners: HashMap<task::Id, String> = HashMap::new();
    for (id, item) in items {
        let fut = job(item);
        let owner = id.clone();
        let handle = tasks.spawn(async move { (id, fut.await) });
        owners.insert(handle.id(), owner);
    }

    let mut summary = BatchSummary::default();
    let mut outputs = Vec::new();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, Ok(value))) => {
                summary.succeeded += 1;
                outputs.push((id, value));
            }
            Ok((id, Err(e))) => {
                warn!("Unit of work for {} failed: {}", id, e);
                DEVICE_FAILURES_TOTAL.inc();
                summary.failed.push(ItemFailure {
                    id,
                    error: e.to_string(),
                });
            }
            Err(e) => {
                let id = owners
                    .remove(&e.id())
                    .unwrap_or_else(|| "<unknown>".to_string());
                error!("Task for {} did not complete: {}", id, e);
                DEVICE_FAILURES_TOTAL.inc();
                summary.failed.push(ItemFailure {
                    id,
                    error: e.to_string(),
                });
            }
        }
    }

    // completion order is arbitrary
    summary.failed.sort_by(|a, b| a.id.cmp(&b.id));
    outputs.sort_by(|a, b| a.0.cmp(&b.0));

    Settled { summary, outputs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;

    #[tokio::test]
    async fn test_gathers_every_outcome() {
        let items = vec![
            ("a".to_string(), 1),
            ("b".to_string(), 2),
            ("c".to_string(), 3),
        ];

        let settled = settle_all(items, |n| async move {
            if n == 2 {
                Err(Error::UpstreamUnavailable("boom".to_string()))
            } else {
                Ok(n * 10)
            }
        })
        .await;

        assert_eq!(settled.summary.succeeded, 2);
        assert_eq!(settled.summary.failed.len(), 1);
        assert_eq!(settled.summary.failed[0].id, "b");
        assert_eq!(
            settled.outputs,
            vec![("a".to_string(), 10), ("c".to_string(), 30)]
        );
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported() {
        let items = vec![("a".to_string(), true), ("b".to_string(), false)];

        let settled = settle_all(items, |explode| async move {
            if explode {
                panic!("task exploded");
            }
            Ok(())
        })
        .await;

        assert_eq!(settled.summary.succeeded, 1);
        assert_eq!(settled.summary.failed.len(), 1);
        assert_eq!(settled.summary.failed[0].id, "a");
        assert!(settled.summary.failed[0].error.contains("panic"));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let settled = settle_all(Vec::<(String, ())>::new(), |_| async { Ok(()) }).await;
        assert_eq!(settled.summary, BatchSummary::default());
        assert!(settled.outputs.is_empty());
    }
}
