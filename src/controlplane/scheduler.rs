//! Scrape Scheduler
//!
//! Runs the periodic jobs of every cluster: the capacity scan and the
//! project scrape, each followed by staleness marking and metrics export.
//! Failed cycles are retried according to [`ErrorAction`].

use super::engine::Engine;
use crate::error::{ErrorAction, Result};
use crate::reconciler::Reconciler;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MIN_RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub struct Scheduler {
    engine: Arc<Engine>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Spawn the capacity and project loops of every cluster
    pub fn start(&mut self) {
        for cluster in self.engine.clusters() {
            let scrape = cluster.reconciler.scrape_config();
            let cluster_id = cluster.id().to_string();

            let engine = self.engine.clone();
            let reconciler = cluster.reconciler.clone();
            self.handles.push(tokio::spawn(run_periodic(
                format!("capacity scan of {}", cluster_id),
                Duration::from_secs(scrape.capacity_interval_secs),
                self.cancel.clone(),
                move || capacity_cycle(engine.clone(), reconciler.clone()),
            )));

            let engine = self.engine.clone();
            let reconciler = cluster.reconciler.clone();
            self.handles.push(tokio::spawn(run_periodic(
                format!("project scrape of {}", cluster_id),
                Duration::from_secs(scrape.project_interval_secs),
                self.cancel.clone(),
                move || project_cycle(engine.clone(), reconciler.clone()),
            )));

            info!("Scheduled scrapes for cluster {}", cluster_id);
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop all loops and wait for running cycles to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Scheduler task ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

async fn capacity_cycle(engine: Arc<Engine>, reconciler: Arc<Reconciler>) -> Result<()> {
    let summary = reconciler.scan_capacity().await?;
    debug!(
        "Capacity scan of {}: {} updated, {} failed capacitors",
        reconciler.cluster_id(),
        summary.updated,
        summary.failed_capacitors.len()
    );
    reconciler.mark_stale(Utc::now()).await?;
    engine.collect_metrics().await
}

async fn project_cycle(engine: Arc<Engine>, reconciler: Arc<Reconciler>) -> Result<()> {
    reconciler.scrape_all_projects().await?;
    reconciler.mark_stale(Utc::now()).await?;
    engine.collect_metrics().await
}

/// Run `job` every `period` until cancelled
///
/// A failed run is retried before the next tick unless its error says not
/// to retry, in which case the loop stops.
pub(crate) async fn run_periodic<F, Fut>(name: String, period: Duration, cancel: CancellationToken, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut retry = ExponentialBackoff {
        initial_interval: MIN_RETRY_INTERVAL,
        current_interval: MIN_RETRY_INTERVAL,
        max_interval: period.max(MIN_RETRY_INTERVAL),
        max_elapsed_time: None,
        ..Default::default()
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        loop {
            let e = match job().await {
                Ok(()) => {
                    retry.reset();
                    break;
                }
                Err(e) => e,
            };

            let delay = match e.action() {
                ErrorAction::NoRequeue => {
                    error!("Stopping {}: {}", name, e);
                    return;
                }
                ErrorAction::RequeueAfter(delay) => delay,
                ErrorAction::RequeueWithBackoff => retry.next_backoff().unwrap_or(period),
            };
            warn!("Failed {}, retrying in {:?}: {}", name, delay, e);

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
