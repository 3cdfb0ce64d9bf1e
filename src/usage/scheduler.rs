use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{error, info};

use super::reconciliation::{PassSummary, UsageController};

/// Result of one reconciliation pass; failures are logged where they happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassSummary),
    Failed,
}

impl PassOutcome {
    pub fn summary(&self) -> Option<PassSummary> {
        match self {
            PassOutcome::Completed(summary) => Some(*summary),
            PassOutcome::Failed => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PassOutcome::Failed)
    }
}

/// Outcome of both reconciliation passes run by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub usages: PassOutcome,
    pub product_usages: PassOutcome,
}

/// key: usage-scheduler -> serialized reconciliation passes
///
/// The loop exits once `shutdown` carries `true` or its sender is dropped. A pass already running
/// completes first.
pub fn spawn(
    controller: Arc<UsageController>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }
            process_tick(&controller).await;
        }
        info!("usage scheduler stopped");
    })
}

/// key: usage-scheduler -> tick handler
pub async fn process_tick(controller: &UsageController) -> TickReport {
    let usages = match controller.calculate_usages().await {
        Ok(summary) => PassOutcome::Completed(summary),
        Err(err) => {
            error!(?err, "usage calculation pass failed");
            PassOutcome::Failed
        }
    };
    let product_usages = match controller.calculate_product_usages().await {
        Ok(summary) => PassOutcome::Completed(summary),
        Err(err) => {
            error!(?err, "product usage calculation pass failed");
            PassOutcome::Failed
        }
    };
    TickReport {
        usages,
        product_usages,
    }
}
