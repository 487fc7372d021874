//! # Inventory Run
//!
//! One end-to-end run: load or resume the session, discover the catalog,
//! expand and seed the queue, probe, and on completion build the record set,
//! categorize it against the previous run and rotate the history.

#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::categorization::{ReportCategories, categorize};
use crate::application::records::{InventoryRecord, build_records};
use crate::crawling::discovery::{CatalogDiscovery, DiscoveryError, DiscoverySummary};
use crate::crawling::expander::AttributeExpander;
use crate::crawling::failures::FailureRecord;
use crate::crawling::orchestrator::{OrchestratorConfig, OrchestratorError, RunSummary, ScrapeOrchestrator};
use crate::crawling::prober::InventoryProber;
use crate::crawling::session::SessionFactory;
use crate::crawling::state::{EnqueueOutcome, FlushPolicy, SessionHandle, SessionState, StateError};
use crate::domain::{ProbeResult, Variant, VariantKey};
use crate::infrastructure::config::{AppConfig, ConfigError, CorruptStatePolicy};
use crate::infrastructure::descriptions::DescriptionWriter;
use crate::infrastructure::retry_manager::RetryExecutor;
use crate::infrastructure::session_store::{Artifact, SessionStore, StoreError};

/// Results of the last completed run, kept for the next comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompletedRun {
    run_id: String,
    completed_at: DateTime<Utc>,
    results: Vec<ProbeResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Shutdown was requested; the next start resumes
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub run_id: String,
    /// The run continued an interrupted session
    pub resumed: bool,
    pub discovery: DiscoverySummary,
    pub summary: RunSummary,
    /// Empty unless completed
    pub records: Vec<InventoryRecord>,
    pub categories: ReportCategories,
    pub failures: Vec<FailureRecord>,
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Persisted state: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Catalog discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Probing failed: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

pub struct InventoryRun {
    config: AppConfig,
    factory: Arc<dyn SessionFactory>,
}

impl InventoryRun {
    #[must_use]
    pub fn new(config: AppConfig, factory: Arc<dyn SessionFactory>) -> Self {
        Self { config, factory }
    }

    pub async fn execute(&self, cancel: &CancellationToken) -> Result<RunReport, RunError> {
        let config = &self.config;
        config.validate()?;

        let store = Arc::new(SessionStore::open(&config.session.state_dir).await?);
        let previous_run = self.load_previous(&store).await?;
        let (mut state, mut resumed) = SessionState::load_or_start(&store, config.session.on_corrupt_state).await?;
        if resumed && previous_run.as_ref().is_some_and(|run| run.run_id == state.run_id()) {
            // 이력 저장 후 세션 정리 전에 종료된 경우: 이미 완료된 실행
            warn!(run_id = %state.run_id(), "🧹 Session of an already completed run left behind; starting a new run");
            store.clear_session().await?;
            state = SessionState::new_run();
            resumed = false;
        }
        let previous: BTreeMap<VariantKey, ProbeResult> = previous_run
            .map(|run| run.results.into_iter().map(|r| (r.key.clone(), r)).collect())
            .unwrap_or_default();
        let run_id = state.run_id().to_string();
        info!(run_id = %run_id, resumed, previous_results = previous.len(), "🚀 Inventory run starting");

        let navigation = RetryExecutor::new(config.retry.clone(), config.timing.navigation_timeout());
        let handle = SessionHandle::new(
            state,
            Arc::clone(&store),
            RetryExecutor::new(config.retry.clone(), config.timing.flush_timeout()),
            FlushPolicy {
                every_completions: config.session.flush_every_completions,
                interval: config.session.flush_interval(),
            },
        );

        let discovery = CatalogDiscovery::new(
            handle.clone(),
            Arc::clone(&self.factory),
            navigation.clone(),
            DescriptionWriter::new(&config.session.state_dir),
            config.crawl.concurrency,
            config.probe.max_variant_attempts,
        )
        .run(&config.crawl.listing_urls, cancel)
        .await?;

        let variants = Self::seed_queue(&handle).await;

        let orchestrator = ScrapeOrchestrator::new(
            handle.clone(),
            Arc::clone(&self.factory),
            InventoryProber::new(
                config.probe.ceiling,
                RetryExecutor::new(config.retry.clone(), config.timing.oracle_timeout()),
            ),
            navigation,
            OrchestratorConfig::from_app(config),
        );
        let summary = orchestrator.run(cancel).await?;

        let state = handle.snapshot().await;
        let failures = state.failures.records();

        if discovery.interrupted || summary.interrupted {
            info!(
                run_id = %run_id,
                done = summary.counts.done,
                pending = summary.counts.pending,
                "⏸️ Run interrupted, state saved for resumption"
            );
            return Ok(RunReport {
                status: RunStatus::Interrupted,
                run_id,
                resumed,
                discovery,
                summary,
                records: Vec::new(),
                categories: ReportCategories::default(),
                failures,
            });
        }

        let records = build_records(&variants, &state.results, &previous);
        let categories = categorize(&variants, &state.results, &previous);
        self.rotate_history(&store, &run_id, &state.results, previous, &failures, &records)
            .await?;

        info!(
            run_id = %run_id,
            records = records.len(),
            failed = failures.len(),
            out_of_stock = categories.out_of_stock.len(),
            back_in_stock = categories.back_in_stock.len(),
            high_stock = categories.high_stock.len(),
            low_stock = categories.low_stock.len(),
            "✅ Inventory run completed"
        );

        Ok(RunReport {
            status: RunStatus::Completed,
            run_id,
            resumed,
            discovery,
            summary,
            records,
            categories,
            failures,
        })
    }

    /// The last completed run, if any
    async fn load_previous(&self, store: &SessionStore) -> Result<Option<CompletedRun>, StoreError> {
        match store.load::<CompletedRun>(Artifact::PreviousResults).await {
            Ok(loaded) => Ok(loaded),
            Err(e) if e.is_untrusted_content() && self.config.session.on_corrupt_state == CorruptStatePolicy::StartFresh => {
                warn!("⚠️ Previous run results cannot be trusted ({e}); comparing against nothing");
                store.quarantine(Artifact::PreviousResults).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Expands every catalog product in URL order and queues its variants
    async fn seed_queue(handle: &SessionHandle) -> Vec<Variant> {
        let catalog = handle.catalog().await;
        let mut variants = Vec::new();
        let mut tally = BTreeMap::<&'static str, usize>::new();

        for page in catalog.products.values() {
            let product = Arc::new(page.product.clone());
            for variant in AttributeExpander::expand(&product, &page.slots) {
                let outcome = handle.enqueue(variant.clone()).await;
                let label = match outcome {
                    EnqueueOutcome::Queued => "queued",
                    EnqueueOutcome::AlreadyDone => "already_done",
                    EnqueueOutcome::ResumedRetry => "resumed_retry",
                    EnqueueOutcome::PermanentlyFailed => "permanently_failed",
                    EnqueueOutcome::Duplicate => continue,
                };
                *tally.entry(label).or_default() += 1;
                variants.push(variant);
            }
        }

        info!(products = catalog.products.len(), variants = variants.len(), ?tally, "🧮 Work queue seeded");
        variants
    }

    /// Writes the history of a completed run and clears the session.
    /// The history carries the run id, so a crash before the clear is
    /// recognized on the next start.
    async fn rotate_history(
        &self,
        store: &SessionStore,
        run_id: &str,
        current: &BTreeMap<VariantKey, ProbeResult>,
        mut previous: BTreeMap<VariantKey, ProbeResult>,
        failures: &[FailureRecord],
        records: &[InventoryRecord],
    ) -> Result<(), StoreError> {
        // Variants without a fresh reading keep their older one
        previous.extend(current.iter().map(|(k, r)| (k.clone(), r.clone())));
        let completed = CompletedRun {
            run_id: run_id.to_string(),
            completed_at: Utc::now(),
            results: previous.into_values().collect(),
        };

        store.save(Artifact::PreviousResults, &completed).await?;
        store.save(Artifact::LastFailures, &failures).await?;
        store.save(Artifact::LastRecords, &records).await?;
        store.clear_session().await?;
        Ok(())
    }
}
