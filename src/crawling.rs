//! # Crawling Module
//!
//! Catalog discovery, attribute expansion, cart-based stock probing and the
//! resumable worker pool that drives it.
//! - 명시적 모듈 구조 (mod.rs 비사용)
//! - 세션 추상화는 `session`에, 영속 상태는 `state`에

pub mod discovery;
pub mod expander;
pub mod failures;
pub mod orchestrator;
pub mod prober;
pub mod queues;
pub mod session;
pub mod state;
pub mod tasks;
pub mod workers;

// Clean re-exports
pub use discovery::{CatalogDiscovery, DiscoveryError, DiscoverySummary};
pub use expander::AttributeExpander;
pub use failures::{FailureKind, FailureRecord, FailureTarget, FailureTracker};
pub use orchestrator::{OrchestratorConfig, OrchestratorError, RunSummary, ScrapeOrchestrator};
pub use prober::{InventoryProber, ProbeError, ProbeOutcome};
pub use queues::{QueueCounts, QueueError, WorkQueue, WorkState};
pub use session::{
    BrowserSession, CartOracle, CartVerdict, ListingPage, SessionError, SessionFactory, VariantPage,
};
pub use state::{
    CatalogSnapshot, EnqueueOutcome, FlushPolicy, SessionHandle, SessionState, StateError,
};
pub use tasks::{ProbeTask, TaskId};
pub use workers::{PoolStats, ProbeWorker, WorkerContext, WorkerError, WorkerReport};
