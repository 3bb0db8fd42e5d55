//! Background worker pool.
//!
//! Claims pending requests from storage in batches and drives each one
//! through the pipeline on its own task. Concurrency across requests is
//! capped by a semaphore; steps inside a request stay strictly sequential.
//! The pool also sweeps expired cache entries on a timer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::orchestrator::AnalysisOrchestrator;
use crate::request::AnalysisStatus;
use crate::storage::Storage;
use crate::types::WorkerId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Requests claimed per poll.
    pub claim_batch_size: usize,
    /// Requests processed concurrently.
    pub max_concurrent_requests: usize,
    /// Sleep between polls when nothing is claimable.
    #[serde(with = "humantime_serde")]
    pub claim_interval: std::time::Duration,
    /// How often to log in-flight counts. None disables the log line.
    #[serde(with = "humantime_serde::option")]
    pub status_log_interval: Option<std::time::Duration>,
    /// How often to delete expired cache entries.
    #[serde(with = "humantime_serde")]
    pub cache_sweep_interval: std::time::Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            claim_batch_size: 10,
            max_concurrent_requests: 4,
            claim_interval: std::time::Duration::from_secs(1),
            status_log_interval: Some(std::time::Duration::from_secs(30)),
            cache_sweep_interval: std::time::Duration::from_secs(300),
        }
    }
}

pub struct WorkerPool<S: Storage> {
    orchestrator: Arc<AnalysisOrchestrator<S>>,
    config: WorkerConfig,
    worker_id: WorkerId,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl<S: Storage> WorkerPool<S> {
    pub fn new(orchestrator: Arc<AnalysisOrchestrator<S>>, config: WorkerConfig) -> Self {
        let permits = config.max_concurrent_requests.max(1);
        Self {
            orchestrator,
            config,
            worker_id: Uuid::new_v4(),
            semaphore: Arc::new(Semaphore::new(permits)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Spawn the claim loop on the runtime. Abort the handle to stop the
    /// pool; in-flight requests finish their current checkpoint and are
    /// re-runnable.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    pub async fn run(self: Arc<Self>) {
        info!(worker_id = %self.worker_id, "worker pool started");
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut last_status_log = Instant::now();
        let mut last_sweep = Instant::now();

        loop {
            // Reap finished tasks; a panicked task must not kill the pool.
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(worker_id = %self.worker_id, error = %e, "request task failed");
                }
            }

            if let Some(interval) = self.config.status_log_interval {
                if last_status_log.elapsed() >= interval {
                    let pending = self
                        .orchestrator
                        .storage()
                        .count_by_status(AnalysisStatus::Pending)
                        .await
                        .unwrap_or(0);
                    info!(
                        worker_id = %self.worker_id,
                        in_flight = self.in_flight(),
                        pending,
                        "worker status"
                    );
                    last_status_log = Instant::now();
                }
            }

            if last_sweep.elapsed() >= self.config.cache_sweep_interval {
                let removed = self.orchestrator.sweep_cache();
                if removed > 0 {
                    debug!(removed, "swept expired cache entries");
                }
                last_sweep = Instant::now();
            }

            let available = self.semaphore.available_permits();
            if available == 0 {
                tokio::time::sleep(self.config.claim_interval).await;
                continue;
            }

            let batch = self.config.claim_batch_size.min(available);
            let claimed = match self
                .orchestrator
                .storage()
                .claim_pending(batch, self.worker_id)
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(worker_id = %self.worker_id, error = %e, "claim poll failed");
                    tokio::time::sleep(self.config.claim_interval).await;
                    continue;
                }
            };

            if claimed.is_empty() {
                tokio::time::sleep(self.config.claim_interval).await;
                continue;
            }

            debug!(worker_id = %self.worker_id, count = claimed.len(), "claimed requests");
            for request in claimed {
                let permit = match self.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    // Closed semaphore means the pool is shutting down.
                    Err(_) => return,
                };

                self.in_flight.fetch_add(1, Ordering::SeqCst);
                let in_flight = self.in_flight.clone();
                let orchestrator = self.orchestrator.clone();
                let request_id = request.id;

                tasks.spawn(async move {
                    let _permit = permit;
                    let _guard = scopeguard::guard((), move |_| {
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    });

                    match orchestrator.run(request_id).await {
                        Ok(status) => {
                            debug!(%request_id, %status, "request finished")
                        }
                        Err(e) => {
                            error!(%request_id, error = %e, "request run errored")
                        }
                    }
                });
            }
        }
    }
}
