//! Run a batch of independent async operations where no single failure can
//! abort the rest.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

/// Default cap on operations in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Debug)]
pub struct ItemOutcome<T> {
    pub index: usize,
    pub label: String,
    pub result: Result<T>,
}

/// Outcomes split by success, each side in input order.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub succeeded: Vec<(String, T)>,
    pub failed: Vec<(String, anyhow::Error)>,
}

impl<T> BatchReport<T> {
    pub fn from_outcomes(outcomes: Vec<ItemOutcome<T>>) -> Self {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(value) => succeeded.push((outcome.label, value)),
                Err(err) => failed.push((outcome.label, err)),
            }
        }
        Self { succeeded, failed }
    }
}

/// Runs `op` once per item on a [`JoinSet`], at most `concurrency` at a time.
///
/// Returns one outcome per item, in input order. Errors and panics are
/// captured in that item's outcome and logged.
pub async fn run_isolated<I, F, Fut, T>(
    items: Vec<(String, I)>,
    concurrency: usize,
    op: F,
) -> Vec<ItemOutcome<T>>
where
    I: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut join_set = JoinSet::new();
    let mut outcomes: Vec<ItemOutcome<T>> = Vec::with_capacity(items.len());

    for (index, (label, item)) in items.into_iter().enumerate() {
        outcomes.push(ItemOutcome {
            index,
            label,
            result: Err(anyhow!("task did not complete")),
        });
        let permits = permits.clone();
        let task = op(item);
        join_set.spawn(async move {
            let _permit = permits.acquire_owned().await;
            (index, task.await)
        });
    }

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, result)) => outcomes[index].result = result,
            Err(err) => warn!(error = %err, "batch task aborted"),
        }
    }

    for outcome in &outcomes {
        if let Err(err) = &outcome.result {
            warn!(item = %outcome.label, error = %err, "batch item failed, skipping");
        }
    }
    outcomes
}
