//! # Probe Workers
//!
//! Each worker owns exactly one browser session and loops over the shared
//! work queue: open the variant, probe it, record the result. A lost
//! session is replaced and the variant requeued; the restart is charged to
//! the variant's attempt budget.

#![allow(clippy::uninlined_format_args)]

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crawling::failures::FailureKind;
use crate::crawling::prober::{InventoryProber, ProbeError};
use crate::crawling::session::{BrowserSession, SessionError, SessionFactory};
use crate::crawling::state::{SessionHandle, StateError};
use crate::domain::{ProbeResult, StockLevel, Variant};
use crate::infrastructure::retry_manager::{RetryError, RetryExecutor};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker {worker_id} could not open a browser session: {source}")]
    SessionUnavailable {
        worker_id: usize,
        #[source]
        source: RetryError<SessionError>,
    },

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Counters shared by every worker of a pool
#[derive(Debug, Default)]
pub struct PoolStats {
    pub probes: AtomicU64,
    pub oracle_calls: AtomicU64,
    pub session_restarts: AtomicU64,
    pub zero_stock_shortcuts: AtomicU64,
}

impl PoolStats {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn oracle_calls(&self) -> u64 {
        self.oracle_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn session_restarts(&self) -> u64 {
        self.session_restarts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

/// Everything a worker needs, shared across the pool
pub struct WorkerContext {
    pub handle: SessionHandle,
    pub factory: Arc<dyn SessionFactory>,
    pub prober: InventoryProber,
    /// Retry wrapper with the navigation timeout
    pub navigation: RetryExecutor,
    pub max_variant_attempts: u32,
    pub stats: Arc<PoolStats>,
}

/// Per-worker tally returned when the worker exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub completed: u64,
    pub failed: u64,
    pub requeued: u64,
}

/// Why a single variant could not be finished
enum VariantFailure {
    SessionLost(SessionError),
    Failed {
        kind: FailureKind,
        reason: String,
        /// The cart may still hold items from the abandoned probe
        cart_dirty: bool,
    },
}

impl VariantFailure {
    fn from_navigation(error: RetryError<SessionError>) -> Self {
        let kind = match error.inner() {
            SessionError::SessionLost(_) => None,
            SessionError::Extraction(_) | SessionError::InvalidInput(_) => Some(FailureKind::Extraction),
            _ => Some(FailureKind::Navigation),
        };
        match kind {
            None => Self::SessionLost(error.into_inner()),
            Some(kind) => Self::Failed {
                kind,
                reason: error.to_string(),
                cart_dirty: false,
            },
        }
    }

    fn from_probe(error: ProbeError) -> Self {
        let cart_dirty = error.leaves_cart_dirty();
        match error {
            ProbeError::SessionLost(e) => Self::SessionLost(e),
            ProbeError::Exhausted { .. } => Self::Failed {
                kind: FailureKind::ProbeExhausted,
                reason: error.to_string(),
                cart_dirty,
            },
            ProbeError::Permanent { .. } => Self::Failed {
                kind: FailureKind::Extraction,
                reason: error.to_string(),
                cart_dirty,
            },
        }
    }
}

pub struct ProbeWorker {
    id: usize,
    ctx: Arc<WorkerContext>,
}

impl ProbeWorker {
    #[must_use]
    pub const fn new(id: usize, ctx: Arc<WorkerContext>) -> Self {
        Self { id, ctx }
    }

    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, WorkerError> {
        let session = self
            .ctx
            .navigation
            .run("create_session", || self.ctx.factory.create_session())
            .await
            .map_err(|source| WorkerError::SessionUnavailable {
                worker_id: self.id,
                source,
            })?;
        debug!(worker = self.id, session = %session.session_id(), "Session ready");
        Ok(session)
    }

    /// Processes tasks until the queue is drained or shutdown is requested
    pub async fn run(self, shutdown: CancellationToken) -> Result<WorkerReport, WorkerError> {
        let mut report = WorkerReport {
            worker_id: self.id,
            ..WorkerReport::default()
        };
        if shutdown.is_cancelled() {
            return Ok(report);
        }

        let mut session = self.open_session().await?;
        info!(worker = self.id, "👷 Worker started");

        while let Some(task) = self.ctx.handle.next_task(&shutdown).await {
            let key = task.key();
            if self.ctx.handle.is_already_done(&key).await {
                debug!(worker = self.id, variant = %key, "Already done, skipping");
                self.ctx.handle.release_done(&task).await?;
                continue;
            }

            match self.process(session.as_mut(), &task.variant).await {
                Ok(result) => {
                    debug!(worker = self.id, variant = %key, stock = %result.stock, "✅ Variant probed");
                    self.ctx.handle.mark_done(&task, result).await?;
                    report.completed += 1;
                }
                Err(VariantFailure::Failed {
                    kind,
                    reason,
                    cart_dirty,
                }) => {
                    self.ctx.handle.mark_failed(&task, kind, &reason).await?;
                    report.failed += 1;
                    if cart_dirty {
                        // 다음 프로브가 남은 장바구니 수량에 영향받지 않도록 세션 교체
                        debug!(worker = self.id, session = %session.session_id(), "Discarding session with an uncleared cart");
                        session = self.open_session().await?;
                    }
                }
                Err(VariantFailure::SessionLost(error)) => {
                    PoolStats::add(&self.ctx.stats.session_restarts, 1);
                    warn!(
                        worker = self.id,
                        session = %session.session_id(),
                        variant = %key,
                        attempt = task.attempts + 1,
                        error = %error,
                        "🔁 Session lost, recreating"
                    );
                    if task.attempts + 1 >= self.ctx.max_variant_attempts {
                        self.ctx
                            .handle
                            .mark_failed(&task, FailureKind::SessionLost, &error.to_string())
                            .await?;
                        report.failed += 1;
                    } else {
                        self.ctx.handle.requeue(task.charged()).await?;
                        report.requeued += 1;
                    }
                    session = self.open_session().await?;
                }
            }
        }

        info!(
            worker = self.id,
            completed = report.completed,
            failed = report.failed,
            requeued = report.requeued,
            "👷 Worker finished"
        );
        Ok(report)
    }

    async fn process(&self, session: &mut dyn BrowserSession, variant: &Variant) -> Result<ProbeResult, VariantFailure> {
        let key = variant.key();

        let mut attempts = self.ctx.navigation.attempts("open_variant");
        let page = loop {
            if let ControlFlow::Break(outcome) = attempts.next(session.open_variant(variant)).await {
                break outcome;
            }
        }
        .map_err(VariantFailure::from_navigation)?;

        let price = page.price.or_else(|| variant.product.price.clone());

        if !page.availability.is_purchasable() {
            PoolStats::add(&self.ctx.stats.zero_stock_shortcuts, 1);
            PoolStats::add(&self.ctx.stats.probes, 1);
            debug!(variant = %key, availability = ?page.availability, "Page reports no stock");
            return Ok(ProbeResult::new(key, StockLevel::Exact(0), price, 0));
        }

        let outcome = match self.ctx.prober.probe(session, variant).await {
            Ok(outcome) => outcome,
            Err(error) => {
                if let ProbeError::Exhausted { oracle_calls, .. } = &error {
                    PoolStats::add(&self.ctx.stats.oracle_calls, u64::from(*oracle_calls));
                }
                return Err(VariantFailure::from_probe(error));
            }
        };
        PoolStats::add(&self.ctx.stats.oracle_calls, u64::from(outcome.oracle_calls));
        PoolStats::add(&self.ctx.stats.probes, 1);

        Ok(ProbeResult::new(key, outcome.stock, price, outcome.oracle_calls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawling::state::{FlushPolicy, SessionState};
    use crate::domain::Availability;
    use crate::infrastructure::retry_manager::RetryPolicy;
    use crate::infrastructure::session_store::SessionStore;
    use crate::test_utils::{ScriptedStorefront, sized_product};
    use std::time::Duration;

    async fn context(storefront: ScriptedStorefront, dir: &std::path::Path, max_attempts: u32) -> Arc<WorkerContext> {
        let store = Arc::new(SessionStore::open(dir).await.unwrap());
        let retry = RetryExecutor::new(RetryPolicy::immediate(2), Duration::from_secs(5));
        Arc::new(WorkerContext {
            handle: SessionHandle::new(
                SessionState::new_run(),
                store,
                retry.clone(),
                FlushPolicy {
                    every_completions: 100,
                    interval: Duration::from_secs(3600),
                },
            ),
            factory: Arc::new(storefront),
            prober: InventoryProber::new(100, retry.clone()),
            navigation: retry,
            max_variant_attempts: max_attempts,
            stats: Arc::new(PoolStats::default()),
        })
    }

    #[tokio::test]
    async fn out_of_stock_page_skips_the_oracle() {
        let dir = tempfile::tempdir().unwrap();
        let (page, variants) = sized_product("ARW-1", "Arrow X", &["S"]);
        let storefront = ScriptedStorefront::new()
            .with_product(page)
            .with_availability(variants[0].key(), Availability::OutOfStock);
        let oracle_calls = storefront.oracle_calls();
        let ctx = context(storefront, dir.path(), 3).await;
        ctx.handle.enqueue(variants[0].clone()).await;

        let report = ProbeWorker::new(0, Arc::clone(&ctx)).run(CancellationToken::new()).await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(oracle_calls.load(Ordering::SeqCst), 0);
        let state = ctx.handle.snapshot().await;
        assert_eq!(state.results[&variants[0].key()].stock, StockLevel::Exact(0));
    }

    #[tokio::test]
    async fn lost_session_is_recreated_and_variant_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let (page, variants) = sized_product("ARW-1", "Arrow X", &["S"]);
        let storefront = ScriptedStorefront::new()
            .with_product(page)
            .with_stock(variants[0].key(), 7)
            .crash_session_on(variants[0].key(), 1);
        let sessions = storefront.sessions_created();
        let ctx = context(storefront, dir.path(), 3).await;
        ctx.handle.enqueue(variants[0].clone()).await;

        let report = ProbeWorker::new(0, Arc::clone(&ctx)).run(CancellationToken::new()).await.unwrap();

        assert_eq!((report.completed, report.requeued), (1, 1));
        assert_eq!(sessions.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.stats.session_restarts(), 1);
        let state = ctx.handle.snapshot().await;
        assert_eq!(state.results[&variants[0].key()].stock, StockLevel::Exact(7));
    }

    #[tokio::test]
    async fn repeated_session_loss_exhausts_the_variant_budget() {
        let dir = tempfile::tempdir().unwrap();
        let (page, variants) = sized_product("ARW-1", "Arrow X", &["S"]);
        let storefront = ScriptedStorefront::new()
            .with_product(page)
            .with_stock(variants[0].key(), 7)
            .crash_session_on(variants[0].key(), 10);
        let ctx = context(storefront, dir.path(), 2).await;
        ctx.handle.enqueue(variants[0].clone()).await;

        let report = ProbeWorker::new(0, Arc::clone(&ctx)).run(CancellationToken::new()).await.unwrap();

        assert_eq!((report.completed, report.failed, report.requeued), (0, 1, 1));
        let state = ctx.handle.snapshot().await;
        let record = state.failures.iter().next().unwrap();
        assert_eq!(record.kind, FailureKind::SessionLost);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn exhausted_oracle_marks_the_variant_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (page, variants) = sized_product("ARW-1", "Arrow X", &["S", "L"]);
        let storefront = ScriptedStorefront::new()
            .with_product(page)
            .with_stock(variants[0].key(), 3)
            .with_stock(variants[1].key(), 9)
            .always_fail_oracle(variants[0].key());
        let ctx = context(storefront, dir.path(), 3).await;
        for variant in &variants {
            ctx.handle.enqueue(variant.clone()).await;
        }

        let report = ProbeWorker::new(0, Arc::clone(&ctx)).run(CancellationToken::new()).await.unwrap();

        assert_eq!((report.completed, report.failed), (1, 1));
        let counts = ctx.handle.counts().await;
        assert_eq!((counts.done, counts.failed, counts.pending, counts.in_flight), (1, 1, 0, 0));
        let state = ctx.handle.snapshot().await;
        assert_eq!(state.failures.iter().next().unwrap().kind, FailureKind::ProbeExhausted);
    }

    #[tokio::test]
    async fn session_with_uncleared_cart_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let (page, variants) = sized_product("ARW-1", "Arrow X", &["S", "L"]);
        let storefront = ScriptedStorefront::new()
            .with_product(page)
            .with_stock(variants[0].key(), 3)
            .with_stock(variants[1].key(), 1)
            .fail_cart_clears(2);
        let sessions = storefront.sessions_created();
        let ctx = context(storefront, dir.path(), 3).await;
        for variant in &variants {
            ctx.handle.enqueue(variant.clone()).await;
        }

        let report = ProbeWorker::new(0, Arc::clone(&ctx)).run(CancellationToken::new()).await.unwrap();

        assert_eq!((report.completed, report.failed), (1, 1));
        assert_eq!(sessions.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.stats.session_restarts(), 0);
        let state = ctx.handle.snapshot().await;
        assert_eq!(state.failures.iter().next().unwrap().kind, FailureKind::ProbeExhausted);
        assert_eq!(state.results[&variants[1].key()].stock, StockLevel::Exact(1));
    }
}
