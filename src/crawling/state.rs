//! # Shared Session State
//!
//! The single process-wide state of a run: the catalog, the probe results
//! (the done set) and the failure tracker. Workers never touch it directly;
//! every mutation goes through the serialized [`SessionHandle`], which also
//! owns the work queue and decides when to flush.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crawling::failures::{FailureKind, FailureTarget, FailureTracker};
use crate::crawling::queues::{QueueCounts, QueueError, WorkQueue};
use crate::crawling::tasks::ProbeTask;
use crate::domain::{ProbeResult, ProductPage, Variant, VariantKey};
use crate::infrastructure::config::CorruptStatePolicy;
use crate::infrastructure::retry_manager::{RetryError, RetryExecutor};
use crate::infrastructure::session_store::{Artifact, SessionStore, StoreError};

/// Discovered catalog of the in-progress run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    /// All listing pages were read
    pub listings_complete: bool,
    pub discovered_urls: BTreeSet<String>,
    /// Extracted product pages keyed by URL
    pub products: BTreeMap<String, ProductPage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResultsSnapshot {
    run_id: String,
    results: Vec<ProbeResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FailuresSnapshot {
    run_id: String,
    failures: FailureTracker,
}

/// In-memory session state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub catalog: CatalogSnapshot,
    pub results: BTreeMap<VariantKey, ProbeResult>,
    pub failures: FailureTracker,
}

impl SessionState {
    /// Fresh state for a new run
    #[must_use]
    pub fn new_run() -> Self {
        Self {
            catalog: CatalogSnapshot {
                run_id: Uuid::new_v4().to_string(),
                started_at: Utc::now(),
                ..CatalogSnapshot::default()
            },
            results: BTreeMap::new(),
            failures: FailureTracker::new(),
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.catalog.run_id
    }

    async fn load_artifacts(store: &SessionStore) -> Result<Option<Self>, StoreError> {
        let catalog: Option<CatalogSnapshot> = store.load(Artifact::Catalog).await?;
        let results: Option<ResultsSnapshot> = store.load(Artifact::Results).await?;
        let failures: Option<FailuresSnapshot> = store.load(Artifact::Failures).await?;

        let Some(catalog) = catalog else {
            if results.is_some() || failures.is_some() {
                return Err(StoreError::Corrupt {
                    path: store.path_of(Artifact::Catalog),
                    reason: "session results exist without a catalog".to_string(),
                });
            }
            return Ok(None);
        };

        let mut state = Self {
            catalog,
            ..Self::default()
        };

        if let Some(snapshot) = results {
            if snapshot.run_id != state.catalog.run_id {
                return Err(StoreError::Corrupt {
                    path: store.path_of(Artifact::Results),
                    reason: format!("belongs to run {} but the catalog is run {}", snapshot.run_id, state.catalog.run_id),
                });
            }
            state.results = snapshot.results.into_iter().map(|r| (r.key.clone(), r)).collect();
        }
        if let Some(snapshot) = failures {
            if snapshot.run_id != state.catalog.run_id {
                return Err(StoreError::Corrupt {
                    path: store.path_of(Artifact::Failures),
                    reason: format!("belongs to run {} but the catalog is run {}", snapshot.run_id, state.catalog.run_id),
                });
            }
            state.failures = snapshot.failures;
        }
        Ok(Some(state))
    }

    /// Loads the in-progress session, or starts a new run when none exists.
    /// Returns the state and whether it was resumed.
    pub async fn load_or_start(store: &SessionStore, policy: CorruptStatePolicy) -> Result<(Self, bool), StoreError> {
        match Self::load_artifacts(store).await {
            Ok(Some(state)) => {
                info!(
                    run_id = %state.run_id(),
                    done = state.results.len(),
                    failed = state.failures.len(),
                    products = state.catalog.products.len(),
                    "♻️ Resuming interrupted run"
                );
                Ok((state, true))
            }
            Ok(None) => Ok((Self::new_run(), false)),
            Err(e) if e.is_untrusted_content() && policy == CorruptStatePolicy::StartFresh => {
                warn!("⚠️ Persisted session cannot be trusted ({e}); starting fresh");
                for artifact in Artifact::SESSION {
                    store.quarantine(artifact).await?;
                }
                Ok((Self::new_run(), false))
            }
            Err(e) => Err(e),
        }
    }
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("State flush failed: {0}")]
    Flush(#[from] RetryError<StoreError>),
}

/// Flush thresholds: after N completions or T elapsed, whichever comes first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub every_completions: u32,
    pub interval: Duration,
}

/// How [`SessionHandle::enqueue`] placed a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Failed in an earlier process; queued for its one extra try
    ResumedRetry,
    AlreadyDone,
    PermanentlyFailed,
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Generations {
    catalog: u64,
    results: u64,
    failures: u64,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    queue: WorkQueue,
    generations: Generations,
    /// Generations confirmed on disk
    persisted: Generations,
    unflushed: u32,
    last_flush: Instant,
}

/// Serialized access to the session state and the work queue
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<Mutex<SessionInner>>,
    /// Generations already on disk; held for the whole flush
    written: Arc<Mutex<Generations>>,
    notify: Arc<Notify>,
    store: Arc<SessionStore>,
    retry: RetryExecutor,
    policy: FlushPolicy,
}

impl SessionHandle {
    #[must_use]
    pub fn new(state: SessionState, store: Arc<SessionStore>, retry: RetryExecutor, policy: FlushPolicy) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                state,
                queue: WorkQueue::new(),
                generations: Generations::default(),
                persisted: Generations::default(),
                unflushed: 0,
                last_flush: Instant::now(),
            })),
            written: Arc::new(Mutex::new(Generations::default())),
            notify: Arc::new(Notify::new()),
            store,
            retry,
            policy,
        }
    }

    #[must_use]
    pub const fn flush_policy(&self) -> FlushPolicy {
        self.policy
    }

    fn variant_target(variant: &Variant) -> FailureTarget {
        FailureTarget::Variant {
            key: variant.key(),
            url: variant.url().to_string(),
        }
    }

    // ---- work queue -------------------------------------------------------

    /// Adds a variant, applying the resumption rules: done variants are
    /// never probed again, a variant that failed in an earlier process gets
    /// exactly one more try.
    pub async fn enqueue(&self, variant: Variant) -> EnqueueOutcome {
        let mut inner = self.inner.lock().await;
        let key = variant.key();

        if inner.state.results.contains_key(&key) {
            inner.queue.seed_done(key);
            return EnqueueOutcome::AlreadyDone;
        }

        let target = Self::variant_target(&variant);
        let outcome = if inner.state.failures.get(&target).is_some() {
            if inner.state.failures.claim_resume_retry(&target) {
                if !inner.queue.enqueue(ProbeTask::resumed(variant)) {
                    return EnqueueOutcome::Duplicate;
                }
                inner.generations.failures += 1;
                EnqueueOutcome::ResumedRetry
            } else {
                inner.queue.seed_failed(key);
                return EnqueueOutcome::PermanentlyFailed;
            }
        } else if inner.queue.enqueue(ProbeTask::new(variant)) {
            EnqueueOutcome::Queued
        } else {
            return EnqueueOutcome::Duplicate;
        };

        drop(inner);
        self.notify.notify_waiters();
        outcome
    }

    /// Next pending task. Waits while other tasks are in flight (one of them
    /// may be requeued) and returns `None` once the queue is drained or
    /// shutdown was requested.
    pub async fn next_task(&self, shutdown: &CancellationToken) -> Option<ProbeTask> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if let Some(task) = inner.queue.next_pending() {
                    return Some(task);
                }
                if inner.queue.counts().in_flight == 0 {
                    return None;
                }
            }

            tokio::select! {
                () = &mut notified => {}
                () = shutdown.cancelled() => return None,
            }
        }
    }

    /// A result for the key is already recorded, whatever its queue state
    pub async fn is_already_done(&self, key: &VariantKey) -> bool {
        let inner = self.inner.lock().await;
        inner.state.results.contains_key(key) || inner.queue.is_already_done(key)
    }

    /// Settles an in-flight task whose result was recorded elsewhere
    pub async fn release_done(&self, task: &ProbeTask) -> Result<(), StateError> {
        self.inner.lock().await.queue.mark_done(&task.key())?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Records the result of a finished probe
    pub async fn mark_done(&self, task: &ProbeTask, result: ProbeResult) -> Result<(), StateError> {
        let flush_due = {
            let mut inner = self.inner.lock().await;
            inner.queue.mark_done(&task.key())?;
            if inner.state.failures.resolve(&Self::variant_target(&task.variant)).is_some() {
                inner.generations.failures += 1;
            }
            inner.state.results.insert(result.key.clone(), result);
            inner.generations.results += 1;
            inner.unflushed += 1;
            inner.unflushed >= self.policy.every_completions
        };
        self.notify.notify_waiters();

        if flush_due {
            self.flush().await?;
        }
        Ok(())
    }

    /// Records a variant as failed for this run
    pub async fn mark_failed(&self, task: &ProbeTask, kind: FailureKind, reason: &str) -> Result<(), StateError> {
        {
            let mut inner = self.inner.lock().await;
            inner.queue.mark_failed(&task.key())?;
            inner
                .state
                .failures
                .record(Self::variant_target(&task.variant), kind, reason, task.attempts + 1);
            inner.generations.failures += 1;
            inner.unflushed += 1;
        }
        warn!(variant = %task.key(), ?kind, attempts = task.attempts + 1, %reason, "❌ Variant failed");
        self.notify.notify_waiters();
        Ok(())
    }

    /// Returns an in-flight task to the pending line
    pub async fn requeue(&self, task: ProbeTask) -> Result<(), StateError> {
        self.inner.lock().await.queue.requeue(task)?;
        self.notify.notify_waiters();
        Ok(())
    }

    pub async fn counts(&self) -> QueueCounts {
        self.inner.lock().await.queue.counts()
    }

    // ---- catalog ----------------------------------------------------------

    pub async fn catalog(&self) -> CatalogSnapshot {
        self.inner.lock().await.state.catalog.clone()
    }

    pub async fn listings_complete(&self) -> bool {
        self.inner.lock().await.state.catalog.listings_complete
    }

    /// Merges product URLs read from one listing
    pub async fn record_listing(&self, listing_url: &str, product_urls: Vec<String>) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.state.catalog.discovered_urls.len();
        inner.state.catalog.discovered_urls.extend(product_urls);
        let added = inner.state.catalog.discovered_urls.len() - before;
        if inner
            .state
            .failures
            .resolve(&FailureTarget::ListingPage {
                url: listing_url.to_string(),
            })
            .is_some()
        {
            inner.generations.failures += 1;
        }
        inner.generations.catalog += 1;
        added
    }

    pub async fn mark_listings_complete(&self) {
        let mut inner = self.inner.lock().await;
        inner.state.catalog.listings_complete = true;
        inner.generations.catalog += 1;
    }

    /// Whether a discovered product page still needs fetching. A page that
    /// failed in an earlier process is fetched once more, then never again.
    pub async fn should_fetch_product(&self, url: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state.catalog.products.contains_key(url) {
            return false;
        }
        let target = FailureTarget::ProductPage { url: url.to_string() };
        if inner.state.failures.get(&target).is_none() {
            return true;
        }
        let granted = inner.state.failures.claim_resume_retry(&target);
        if granted {
            inner.generations.failures += 1;
        }
        granted
    }

    pub async fn record_product(&self, url: &str, page: ProductPage) {
        let mut inner = self.inner.lock().await;
        if inner
            .state
            .failures
            .resolve(&FailureTarget::ProductPage { url: url.to_string() })
            .is_some()
        {
            inner.generations.failures += 1;
        }
        inner.state.catalog.products.insert(url.to_string(), page);
        inner.generations.catalog += 1;
    }

    /// Records a listing or product page that could not be read
    pub async fn record_page_failure(&self, target: FailureTarget, kind: FailureKind, reason: &str, attempts: u32) {
        warn!(%target, ?kind, %reason, "❌ Page failed");
        let mut inner = self.inner.lock().await;
        inner.state.failures.record(target, kind, reason, attempts);
        inner.generations.failures += 1;
    }

    /// Clone of the whole state
    pub async fn snapshot(&self) -> SessionState {
        self.inner.lock().await.state.clone()
    }

    // ---- persistence ------------------------------------------------------

    /// Writes every artifact that changed since the last flush
    pub async fn flush(&self) -> Result<(), StateError> {
        let mut written = self.written.lock().await;

        let (generations, catalog, results, failures) = {
            let mut inner = self.inner.lock().await;
            inner.unflushed = 0;
            inner.last_flush = Instant::now();
            let generations = inner.generations;
            let run_id = inner.state.catalog.run_id.clone();

            let catalog = (generations.catalog > written.catalog || !self.store.exists(Artifact::Catalog))
                .then(|| inner.state.catalog.clone());
            let results = (generations.results > written.results).then(|| ResultsSnapshot {
                run_id: run_id.clone(),
                results: inner.state.results.values().cloned().collect(),
            });
            let failures = (generations.failures > written.failures).then(|| FailuresSnapshot {
                run_id,
                failures: inner.state.failures.clone(),
            });
            (generations, catalog, results, failures)
        };

        if let Some(catalog) = &catalog {
            self.retry
                .run("flush_catalog", || self.store.save(Artifact::Catalog, catalog))
                .await?;
            written.catalog = generations.catalog;
        }
        if let Some(results) = &results {
            self.retry
                .run("flush_results", || self.store.save(Artifact::Results, results))
                .await?;
            written.results = generations.results;
        }
        if let Some(failures) = &failures {
            self.retry
                .run("flush_failures", || self.store.save(Artifact::Failures, failures))
                .await?;
            written.failures = generations.failures;
        }

        self.inner.lock().await.persisted = *written;
        debug!(
            catalog = catalog.is_some(),
            results = results.is_some(),
            failures = failures.is_some(),
            "💾 Session flushed"
        );
        Ok(())
    }

    /// Flushes when N completions are pending or T has elapsed
    pub async fn flush_if_due(&self) -> Result<bool, StateError> {
        let due = {
            let inner = self.inner.lock().await;
            inner.unflushed >= self.policy.every_completions
                || (inner.generations != inner.persisted && inner.last_flush.elapsed() >= self.policy.interval)
        };
        if due {
            self.flush().await?;
        }
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Product, SelectedAttribute, StockLevel};
    use crate::infrastructure::retry_manager::RetryPolicy;

    fn variant(value: &str) -> Variant {
        let product = Arc::new(Product::new("ARW-1", "Arrow X", "https://shop.test/arrow-x"));
        Variant::new(
            product,
            vec![SelectedAttribute {
                field: "attribute[1]".into(),
                description: "Size".into(),
                value: value.into(),
                label: value.into(),
            }],
        )
    }

    async fn handle_with(state: SessionState, dir: &std::path::Path, every: u32) -> SessionHandle {
        handle_with_interval(state, dir, every, Duration::from_secs(3600)).await
    }

    async fn handle_with_interval(
        state: SessionState,
        dir: &std::path::Path,
        every: u32,
        interval: Duration,
    ) -> SessionHandle {
        let store = Arc::new(SessionStore::open(dir).await.unwrap());
        SessionHandle::new(
            state,
            store,
            RetryExecutor::new(RetryPolicy::immediate(2), Duration::from_secs(5)),
            FlushPolicy {
                every_completions: every,
                interval,
            },
        )
    }

    fn result_for(task: &ProbeTask, stock: u32) -> ProbeResult {
        ProbeResult::new(task.key(), StockLevel::Exact(stock), None, 2)
    }

    #[tokio::test]
    async fn completions_trigger_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle_with(SessionState::new_run(), dir.path(), 2).await;
        handle.enqueue(variant("S")).await;
        handle.enqueue(variant("L")).await;

        let token = CancellationToken::new();
        let first = handle.next_task(&token).await.unwrap();
        handle.mark_done(&first, result_for(&first, 3)).await.unwrap();
        assert!(!handle.store.exists(Artifact::Results));

        let second = handle.next_task(&token).await.unwrap();
        handle.mark_done(&second, result_for(&second, 0)).await.unwrap();
        assert!(handle.store.exists(Artifact::Results));

        let (reloaded, resumed) = SessionState::load_or_start(&handle.store, CorruptStatePolicy::Fail)
            .await
            .unwrap();
        assert!(resumed);
        assert_eq!(reloaded.results.len(), 2);
        assert_eq!(reloaded.run_id(), handle.snapshot().await.run_id());
    }

    #[tokio::test]
    async fn resumed_state_skips_done_and_retries_failed_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = SessionState::new_run();
        let done = variant("S");
        state
            .results
            .insert(done.key(), ProbeResult::new(done.key(), StockLevel::Exact(4), None, 3));
        let failed = variant("L");
        state.failures.record(
            SessionHandle::variant_target(&failed),
            FailureKind::ProbeExhausted,
            "timeout",
            3,
        );

        let handle = handle_with(state, dir.path(), 10).await;
        assert_eq!(handle.enqueue(done).await, EnqueueOutcome::AlreadyDone);
        assert_eq!(handle.enqueue(failed.clone()).await, EnqueueOutcome::ResumedRetry);

        let token = CancellationToken::new();
        let task = handle.next_task(&token).await.unwrap();
        assert!(task.resumed_failure);
        handle.mark_failed(&task, FailureKind::ProbeExhausted, "timeout again").await.unwrap();
        handle.flush().await.unwrap();

        // second resume of the same run: permanently failed
        let (reloaded, _) = SessionState::load_or_start(&handle.store, CorruptStatePolicy::Fail)
            .await
            .unwrap();
        let again = handle_with(reloaded, dir.path(), 10).await;
        assert_eq!(again.enqueue(failed).await, EnqueueOutcome::PermanentlyFailed);
        assert_eq!(again.enqueue(variant("S")).await, EnqueueOutcome::AlreadyDone);
        assert!(again.next_task(&token).await.is_none());

        let counts = again.counts().await;
        assert_eq!((counts.done, counts.failed, counts.pending), (1, 1, 0));
    }

    #[tokio::test]
    async fn corrupt_state_is_fatal_unless_start_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        std::fs::write(store.path_of(Artifact::Catalog), b"{ not json").unwrap();

        let err = SessionState::load_or_start(&store, CorruptStatePolicy::Fail).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(store.exists(Artifact::Catalog));

        let (_, resumed) = SessionState::load_or_start(&store, CorruptStatePolicy::StartFresh)
            .await
            .unwrap();
        assert!(!resumed);
        assert!(!store.exists(Artifact::Catalog));
    }

    #[tokio::test]
    async fn failed_product_page_is_refetched_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = SessionState::new_run();
        state.failures.record(
            FailureTarget::ProductPage {
                url: "https://shop.test/p".into(),
            },
            FailureKind::Navigation,
            "timeout",
            4,
        );
        let handle = handle_with(state, dir.path(), 10).await;

        assert!(handle.should_fetch_product("https://shop.test/p").await);
        assert!(!handle.should_fetch_product("https://shop.test/p").await);
        assert!(handle.should_fetch_product("https://shop.test/other").await);
    }

    #[tokio::test]
    async fn waiting_worker_wakes_on_requeue() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle_with(SessionState::new_run(), dir.path(), 10).await;
        handle.enqueue(variant("S")).await;

        let token = CancellationToken::new();
        let task = handle.next_task(&token).await.unwrap();

        let waiter = {
            let handle = handle.clone();
            let token = token.clone();
            tokio::spawn(async move { handle.next_task(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.requeue(task.charged()).await.unwrap();

        let picked = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert_eq!(picked.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_handing_out_work() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle_with(SessionState::new_run(), dir.path(), 10).await;
        handle.enqueue(variant("S")).await;

        let token = CancellationToken::new();
        token.cancel();
        assert!(handle.next_task(&token).await.is_none());
        assert_eq!(handle.counts().await.pending, 1);
    }

    #[tokio::test]
    async fn elapsed_interval_flushes_a_single_completion() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle_with_interval(SessionState::new_run(), dir.path(), 100, Duration::from_millis(250)).await;
        handle.enqueue(variant("S")).await;

        let task = handle.next_task(&CancellationToken::new()).await.unwrap();
        handle.mark_done(&task, result_for(&task, 4)).await.unwrap();
        assert!(!handle.flush_if_due().await.unwrap());
        assert!(!handle.store.exists(Artifact::Results));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(handle.flush_if_due().await.unwrap());
        assert!(handle.store.exists(Artifact::Results));
    }

    #[tokio::test]
    async fn elapsed_interval_without_changes_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle_with_interval(SessionState::new_run(), dir.path(), 100, Duration::from_millis(250)).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.flush_if_due().await.unwrap());
        for artifact in Artifact::SESSION {
            assert!(!handle.store.exists(artifact));
        }
    }

    #[tokio::test]
    async fn in_flight_task_with_recorded_result_counts_as_done() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle_with(SessionState::new_run(), dir.path(), 10).await;
        handle.enqueue(variant("S")).await;

        let token = CancellationToken::new();
        let task = handle.next_task(&token).await.unwrap();
        assert!(!handle.is_already_done(&task.key()).await);

        {
            let mut inner = handle.inner.lock().await;
            inner.state.results.insert(task.key(), result_for(&task, 2));
        }
        assert!(handle.is_already_done(&task.key()).await);

        handle.release_done(&task).await.unwrap();
        let counts = handle.counts().await;
        assert_eq!((counts.done, counts.in_flight, counts.pending), (1, 0, 0));
        assert!(handle.next_task(&token).await.is_none());
    }
}
