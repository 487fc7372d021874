//! # Scrape Orchestrator
//!
//! Runs a pool of probe workers over the shared work queue, flushes the
//! session state on a timer, logs progress, and handles cooperative
//! shutdown: workers stop pulling, in-flight probes get
//! `shutdown_timeout` to finish, stragglers are aborted and a final flush
//! persists whatever completed.

#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crawling::prober::InventoryProber;
use crate::crawling::queues::QueueCounts;
use crate::crawling::session::SessionFactory;
use crate::crawling::state::{SessionHandle, StateError};
use crate::crawling::workers::{PoolStats, ProbeWorker, WorkerContext, WorkerError, WorkerReport};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::retry_manager::RetryExecutor;

/// Smallest tick the timers are allowed to use
const MIN_TICK: Duration = Duration::from_millis(50);

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of workers, each with its own session
    pub concurrency: usize,
    /// Maximum time to wait for in-flight probes during shutdown
    pub shutdown_timeout: Duration,
    /// How often to log progress statistics
    pub stats_interval: Duration,
    /// Attempts per variant, session restarts included
    pub max_variant_attempts: u32,
}

impl OrchestratorConfig {
    #[must_use]
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            concurrency: config.crawl.concurrency,
            shutdown_timeout: config.timing.shutdown_timeout(),
            stats_interval: config.timing.stats_interval(),
            max_variant_attempts: config.probe.max_variant_attempts,
        }
    }
}

/// What a finished (or interrupted) orchestration achieved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub counts: QueueCounts,
    /// Shutdown was requested before the queue drained
    pub interrupted: bool,
    pub duration: Duration,
    pub probes: u64,
    pub oracle_calls: u64,
    pub session_restarts: u64,
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("No worker could be started: {0}")]
    NoWorkers(#[source] WorkerError),

    #[error("All workers stopped with {pending} variants pending and {in_flight} in flight")]
    Stalled { pending: usize, in_flight: usize },

    #[error("State error: {0}")]
    State(#[from] StateError),
}

pub struct ScrapeOrchestrator {
    handle: SessionHandle,
    factory: Arc<dyn SessionFactory>,
    prober: InventoryProber,
    navigation: RetryExecutor,
    config: OrchestratorConfig,
}

impl ScrapeOrchestrator {
    #[must_use]
    pub fn new(
        handle: SessionHandle,
        factory: Arc<dyn SessionFactory>,
        prober: InventoryProber,
        navigation: RetryExecutor,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            handle,
            factory,
            prober,
            navigation,
            config,
        }
    }

    /// Probes every queued variant. Returns once the queue is drained or,
    /// after `shutdown` fires, once in-flight work finished or was aborted.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<RunSummary, OrchestratorError> {
        let started = Instant::now();
        let stats = Arc::new(PoolStats::default());
        let ctx = Arc::new(WorkerContext {
            handle: self.handle.clone(),
            factory: Arc::clone(&self.factory),
            prober: self.prober.clone(),
            navigation: self.navigation.clone(),
            max_variant_attempts: self.config.max_variant_attempts.max(1),
            stats: Arc::clone(&stats),
        });

        let initial = self.handle.counts().await;
        info!(
            workers = self.config.concurrency,
            pending = initial.pending,
            done = initial.done,
            failed = initial.failed,
            "🚀 Starting probe workers"
        );

        let mut workers = JoinSet::new();
        for id in 0..self.config.concurrency.max(1) {
            workers.spawn(ProbeWorker::new(id, Arc::clone(&ctx)).run(shutdown.clone()));
        }

        let flush_period = (self.handle.flush_policy().interval / 2).max(MIN_TICK);
        let mut flush_ticks = IntervalStream::new(tokio::time::interval(flush_period));
        let mut stats_ticks = IntervalStream::new(tokio::time::interval(self.config.stats_interval.max(MIN_TICK)));

        let mut finished: Vec<WorkerReport> = Vec::new();
        let mut failures: Vec<WorkerError> = Vec::new();

        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(outcome) => Self::collect(outcome, &mut finished, &mut failures),
                },
                Some(_) = flush_ticks.next() => {
                    if let Err(e) = self.handle.flush_if_due().await {
                        warn!("⚠️ Periodic flush failed: {e}");
                    }
                }
                Some(_) = stats_ticks.next() => self.log_progress(&stats, started).await,
                () = shutdown.cancelled() => {
                    info!("🛑 Shutdown requested, waiting up to {:?} for in-flight probes", self.config.shutdown_timeout);
                    self.drain(&mut workers, &mut finished, &mut failures).await;
                    break;
                }
            }
        }

        self.handle.flush().await?;

        let counts = self.handle.counts().await;
        let summary = RunSummary {
            counts,
            interrupted: shutdown.is_cancelled() && !counts.is_drained(),
            duration: started.elapsed(),
            probes: stats.probes(),
            oracle_calls: stats.oracle_calls(),
            session_restarts: stats.session_restarts(),
        };

        if !summary.interrupted && !counts.is_drained() {
            if finished.is_empty() {
                if let Some(first) = failures.into_iter().next() {
                    return Err(OrchestratorError::NoWorkers(first));
                }
            }
            return Err(OrchestratorError::Stalled {
                pending: counts.pending,
                in_flight: counts.in_flight,
            });
        }

        info!(
            done = counts.done,
            failed = counts.failed,
            pending = counts.pending,
            interrupted = summary.interrupted,
            oracle_calls = summary.oracle_calls,
            session_restarts = summary.session_restarts,
            "🏁 Probing finished in {:?}",
            summary.duration
        );
        Ok(summary)
    }

    fn collect(
        outcome: Result<Result<WorkerReport, WorkerError>, tokio::task::JoinError>,
        finished: &mut Vec<WorkerReport>,
        failures: &mut Vec<WorkerError>,
    ) {
        match outcome {
            Ok(Ok(report)) => finished.push(report),
            Ok(Err(e)) => {
                error!("❌ Worker stopped: {e}");
                failures.push(e);
            }
            Err(e) if e.is_cancelled() => debug!("Worker aborted"),
            Err(e) => error!("❌ Worker panicked: {e}"),
        }
    }

    /// Waits for the remaining workers, aborting them once the timeout passes
    async fn drain(
        &self,
        workers: &mut JoinSet<Result<WorkerReport, WorkerError>>,
        finished: &mut Vec<WorkerReport>,
        failures: &mut Vec<WorkerError>,
    ) {
        let graceful = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(outcome) = workers.join_next().await {
                Self::collect(outcome, finished, failures);
            }
        })
        .await;

        if graceful.is_err() {
            warn!("⏰ Shutdown timeout reached, aborting {} workers", workers.len());
            workers.abort_all();
            while let Some(outcome) = workers.join_next().await {
                Self::collect(outcome, finished, failures);
            }
        }
    }

    async fn log_progress(&self, stats: &PoolStats, started: Instant) {
        let counts = self.handle.counts().await;
        let total = counts.total().max(1);
        #[allow(clippy::cast_precision_loss)]
        let percent = (counts.done + counts.failed) as f64 * 100.0 / total as f64;
        info!(
            done = counts.done,
            failed = counts.failed,
            pending = counts.pending,
            in_flight = counts.in_flight,
            oracle_calls = stats.oracle_calls(),
            session_restarts = stats.session_restarts(),
            "📊 Progress {:.1}% after {:?}",
            percent,
            started.elapsed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawling::state::{FlushPolicy, SessionState};
    use crate::domain::StockLevel;
    use crate::infrastructure::retry_manager::RetryPolicy;
    use crate::infrastructure::session_store::SessionStore;
    use crate::test_utils::{ScriptedStorefront, sized_product};

    async fn orchestrator(storefront: ScriptedStorefront, dir: &std::path::Path, workers: usize) -> ScrapeOrchestrator {
        let store = Arc::new(SessionStore::open(dir).await.unwrap());
        let retry = RetryExecutor::new(RetryPolicy::immediate(2), Duration::from_secs(5));
        let handle = SessionHandle::new(
            SessionState::new_run(),
            store,
            retry.clone(),
            FlushPolicy {
                every_completions: 3,
                interval: Duration::from_secs(30),
            },
        );
        ScrapeOrchestrator::new(
            handle,
            Arc::new(storefront),
            InventoryProber::new(100, retry.clone()),
            retry,
            OrchestratorConfig {
                concurrency: workers,
                shutdown_timeout: Duration::from_secs(5),
                stats_interval: Duration::from_secs(60),
                max_variant_attempts: 3,
            },
        )
    }

    #[tokio::test]
    async fn drains_the_queue_with_several_workers() {
        let dir = tempfile::tempdir().unwrap();
        let (page, variants) = sized_product("ARW-1", "Arrow X", &["XS", "S", "M", "L", "XL"]);
        let mut storefront = ScriptedStorefront::new().with_product(page);
        for (i, variant) in variants.iter().enumerate() {
            storefront = storefront.with_stock(variant.key(), u32::try_from(i).unwrap() * 3);
        }
        let orchestrator = orchestrator(storefront, dir.path(), 3).await;
        for variant in &variants {
            orchestrator.handle.enqueue(variant.clone()).await;
        }

        let summary = orchestrator.run(&CancellationToken::new()).await.unwrap();

        assert!(!summary.interrupted);
        assert_eq!(summary.counts.done, 5);
        assert!(summary.counts.is_drained());
        let state = orchestrator.handle.snapshot().await;
        for (i, variant) in variants.iter().enumerate() {
            let expected = StockLevel::Exact(u32::try_from(i).unwrap() * 3);
            assert_eq!(state.results[&variant.key()].stock, expected);
        }
    }

    #[tokio::test]
    async fn empty_queue_finishes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(ScriptedStorefront::new(), dir.path(), 2).await;
        let summary = orchestrator.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.counts.total(), 0);
        assert!(!summary.interrupted);
    }

    #[tokio::test]
    async fn cancelled_before_start_leaves_work_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (page, variants) = sized_product("ARW-1", "Arrow X", &["S", "L"]);
        let orchestrator = orchestrator(ScriptedStorefront::new().with_product(page), dir.path(), 2).await;
        for variant in &variants {
            orchestrator.handle.enqueue(variant.clone()).await;
        }

        let token = CancellationToken::new();
        token.cancel();
        let summary = orchestrator.run(&token).await.unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.counts.pending, 2);
        assert_eq!(summary.probes, 0);
    }
}
