//! # Inventory Prober
//!
//! Infers the purchasable quantity of one variant from nothing but the
//! add-to-cart oracle:
//!
//! 1. `q = 1` rejected → `Exact(0)` after a single call
//! 2. `q = ceiling` accepted → `AtLeast(ceiling)`
//! 3. otherwise binary search over `[1, ceiling)` with the upper midpoint;
//!    `low` is always accepted and everything above `high` rejected
//!
//! Every accepted add is followed by a cart clear, and so is every add whose
//! answer was lost before it is retried: the add may have landed anyway.
//! A probe that fails leaves the cart in an unknown state; callers must not
//! reuse the session without clearing it (see `ProbeError::leaves_cart_dirty`).

use std::ops::ControlFlow;

use thiserror::Error;
use tracing::{debug, trace};

use crate::crawling::session::{CartOracle, CartVerdict, SessionError};
use crate::domain::{StockLevel, Variant};
use crate::infrastructure::retry_manager::{RetryError, RetryExecutor};

/// Stock inferred for one variant plus the logical oracle calls it took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub stock: StockLevel,
    pub oracle_calls: u32,
}

#[derive(Error, Debug)]
pub enum ProbeError {
    /// Transient failures outlasted the retry budget
    #[error("Probe abandoned at quantity {quantity} after {oracle_calls} oracle calls: {source}")]
    Exhausted {
        quantity: u32,
        oracle_calls: u32,
        #[source]
        source: RetryError<SessionError>,
    },

    /// The session died; the caller must recreate it
    #[error("Session lost while probing: {0}")]
    SessionLost(SessionError),

    #[error("Oracle failed permanently at quantity {quantity}: {source}")]
    Permanent {
        quantity: u32,
        #[source]
        source: RetryError<SessionError>,
    },
}

impl ProbeError {
    /// Whether items may still sit in the cart after this failure
    #[must_use]
    pub const fn leaves_cart_dirty(&self) -> bool {
        !matches!(self, Self::SessionLost(_))
    }

    fn from_retry(quantity: u32, oracle_calls: u32, error: RetryError<SessionError>) -> Self {
        if error.inner().is_session_lost() {
            return Self::SessionLost(error.into_inner());
        }
        if error.is_exhausted() {
            Self::Exhausted {
                quantity,
                oracle_calls,
                source: error,
            }
        } else {
            Self::Permanent {
                quantity,
                source: error,
            }
        }
    }
}

/// Binary-search prober over a [`CartOracle`]
#[derive(Debug, Clone)]
pub struct InventoryProber {
    ceiling: u32,
    retry: RetryExecutor,
}

impl InventoryProber {
    #[must_use]
    pub fn new(ceiling: u32, retry: RetryExecutor) -> Self {
        Self {
            ceiling: ceiling.max(1),
            retry,
        }
    }

    #[must_use]
    pub const fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub async fn probe<O>(&self, oracle: &mut O, variant: &Variant) -> Result<ProbeOutcome, ProbeError>
    where
        O: CartOracle + ?Sized,
    {
        let mut calls = 0;

        if !self.accepts(oracle, variant, 1, &mut calls).await? {
            return Ok(self.finish(variant, StockLevel::Exact(0), calls));
        }
        if self.ceiling == 1 || self.accepts(oracle, variant, self.ceiling, &mut calls).await? {
            return Ok(self.finish(variant, StockLevel::AtLeast(self.ceiling), calls));
        }

        let (mut low, mut high) = (1, self.ceiling - 1);
        while low < high {
            let mid = low + (high - low + 1) / 2;
            if self.accepts(oracle, variant, mid, &mut calls).await? {
                low = mid;
            } else {
                high = mid - 1;
            }
        }

        Ok(self.finish(variant, StockLevel::Exact(low), calls))
    }

    fn finish(&self, variant: &Variant, stock: StockLevel, oracle_calls: u32) -> ProbeOutcome {
        debug!(variant = %variant.key(), %stock, oracle_calls, ceiling = self.ceiling, "🔎 Probe finished");
        ProbeOutcome { stock, oracle_calls }
    }

    /// One logical oracle call (retries included) followed by a cart clear on accept
    async fn accepts<O>(
        &self,
        oracle: &mut O,
        variant: &Variant,
        quantity: u32,
        calls: &mut u32,
    ) -> Result<bool, ProbeError>
    where
        O: CartOracle + ?Sized,
    {
        *calls += 1;

        let mut attempts = self.retry.attempts("add_to_cart");
        let verdict = loop {
            match attempts.next(oracle.try_add_to_cart(variant, quantity)).await {
                ControlFlow::Break(outcome) => break outcome,
                // A lost answer may still have put the items in the cart
                ControlFlow::Continue(()) => self.clear_cart(oracle, quantity, *calls).await?,
            }
        }
        .map_err(|e| ProbeError::from_retry(quantity, *calls, e))?;

        match verdict {
            CartVerdict::Accepted => {
                trace!(variant = %variant.key(), quantity, "accepted");
                self.clear_cart(oracle, quantity, *calls).await?;
                Ok(true)
            }
            CartVerdict::Rejected { reason } => {
                trace!(variant = %variant.key(), quantity, %reason, "rejected");
                Ok(false)
            }
        }
    }

    async fn clear_cart<O>(&self, oracle: &mut O, quantity: u32, calls: u32) -> Result<(), ProbeError>
    where
        O: CartOracle + ?Sized,
    {
        let mut attempts = self.retry.attempts("clear_cart");
        loop {
            if let ControlFlow::Break(outcome) = attempts.next(oracle.clear_cart()).await {
                break outcome;
            }
        }
        .map_err(|e| ProbeError::from_retry(quantity, calls, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Product;
    use crate::infrastructure::retry_manager::RetryPolicy;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    /// Accepts any quantity up to `max`, optionally failing the first calls
    struct FakeOracle {
        max: u32,
        cart: u32,
        calls: Vec<u32>,
        clears: u32,
        transient_failures: u32,
        /// The next add of this quantity lands in the cart but its answer is lost
        lose_answer_at: Option<u32>,
        failing_clears: u32,
        lose_session: bool,
    }

    impl FakeOracle {
        fn with_stock(max: u32) -> Self {
            Self {
                max,
                cart: 0,
                calls: Vec::new(),
                clears: 0,
                transient_failures: 0,
                lose_answer_at: None,
                failing_clears: 0,
                lose_session: false,
            }
        }
    }

    #[async_trait]
    impl CartOracle for FakeOracle {
        async fn try_add_to_cart(&mut self, _variant: &Variant, quantity: u32) -> Result<CartVerdict, SessionError> {
            if self.lose_session {
                return Err(SessionError::SessionLost("browser closed".into()));
            }
            if self.transient_failures > 0 {
                self.transient_failures -= 1;
                return Err(SessionError::Network("connection reset".into()));
            }
            self.calls.push(quantity);
            if self.cart + quantity <= self.max {
                self.cart += quantity;
                if self.lose_answer_at == Some(quantity) {
                    self.lose_answer_at = None;
                    return Err(SessionError::Network("response lost".into()));
                }
                Ok(CartVerdict::Accepted)
            } else {
                Ok(CartVerdict::Rejected {
                    reason: "not enough stock".into(),
                })
            }
        }

        async fn clear_cart(&mut self) -> Result<(), SessionError> {
            if self.failing_clears > 0 {
                self.failing_clears -= 1;
                return Err(SessionError::Network("cart api unavailable".into()));
            }
            self.cart = 0;
            self.clears += 1;
            Ok(())
        }
    }

    fn variant() -> Variant {
        Variant::new(Arc::new(Product::new("ARW-1", "Arrow X", "https://shop.test/arrow-x")), vec![])
    }

    fn prober(ceiling: u32) -> InventoryProber {
        InventoryProber::new(ceiling, RetryExecutor::new(RetryPolicy::immediate(3), Duration::from_secs(5)))
    }

    fn call_bound(ceiling: u32) -> u32 {
        2 + f64::from(ceiling).log2().ceil() as u32
    }

    #[tokio::test]
    async fn zero_stock_takes_one_call() {
        let mut oracle = FakeOracle::with_stock(0);
        let outcome = prober(100).probe(&mut oracle, &variant()).await.unwrap();

        assert_eq!(outcome.stock, StockLevel::Exact(0));
        assert_eq!(outcome.oracle_calls, 1);
        assert_eq!(oracle.calls, vec![1]);
    }

    #[tokio::test]
    async fn ceiling_accept_short_circuits() {
        let mut oracle = FakeOracle::with_stock(250);
        let outcome = prober(100).probe(&mut oracle, &variant()).await.unwrap();

        assert_eq!(outcome.stock, StockLevel::AtLeast(100));
        assert_eq!(oracle.calls, vec![1, 100]);
    }

    #[tokio::test]
    async fn cart_is_cleared_after_every_accept() {
        let mut oracle = FakeOracle::with_stock(37);
        let outcome = prober(100).probe(&mut oracle, &variant()).await.unwrap();

        assert_eq!(outcome.stock, StockLevel::Exact(37));
        assert_eq!(oracle.cart, 0);
        let accepted = oracle.calls.iter().filter(|q| **q <= 37).count();
        assert_eq!(oracle.clears as usize, accepted);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let mut oracle = FakeOracle::with_stock(5);
        oracle.transient_failures = 2;
        let outcome = prober(100).probe(&mut oracle, &variant()).await.unwrap();
        assert_eq!(outcome.stock, StockLevel::Exact(5));
    }

    #[tokio::test]
    async fn add_landing_before_a_lost_answer_is_cleared_before_retry() {
        // 1, 100, 50 come first; 25 is the first accepted search step
        let mut oracle = FakeOracle::with_stock(37);
        oracle.lose_answer_at = Some(25);
        let outcome = prober(100).probe(&mut oracle, &variant()).await.unwrap();

        assert_eq!(outcome.stock, StockLevel::Exact(37));
        assert_eq!(oracle.cart, 0);
        assert_eq!(oracle.calls.iter().filter(|q| **q == 25).count(), 2);
    }

    #[tokio::test]
    async fn failed_clear_reports_a_dirty_cart() {
        let mut oracle = FakeOracle::with_stock(5);
        oracle.failing_clears = 10;
        let err = prober(100).probe(&mut oracle, &variant()).await.unwrap_err();

        assert!(matches!(err, ProbeError::Exhausted { quantity: 1, .. }));
        assert!(err.leaves_cart_dirty());
        assert_eq!(oracle.cart, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_abandon_probe() {
        let mut oracle = FakeOracle::with_stock(5);
        oracle.transient_failures = 10;
        let err = prober(100).probe(&mut oracle, &variant()).await.unwrap_err();
        assert!(matches!(err, ProbeError::Exhausted { quantity: 1, .. }));
    }

    #[tokio::test]
    async fn session_loss_propagates_without_retry() {
        let mut oracle = FakeOracle::with_stock(5);
        oracle.lose_session = true;
        let err = prober(100).probe(&mut oracle, &variant()).await.unwrap_err();
        assert!(matches!(err, ProbeError::SessionLost(SessionError::SessionLost(_))));
    }

    #[tokio::test]
    async fn ceiling_of_one_never_searches() {
        let mut oracle = FakeOracle::with_stock(3);
        let outcome = prober(1).probe(&mut oracle, &variant()).await.unwrap();
        assert_eq!(outcome.stock, StockLevel::AtLeast(1));
        assert_eq!(oracle.calls, vec![1]);
    }

    proptest! {
        #[test]
        fn finds_exact_stock_within_log_calls(ceiling in 2u32..=500, seed in any::<u32>()) {
            let max = seed % ceiling;
            let mut oracle = FakeOracle::with_stock(max);
            let outcome = tokio_test::block_on(prober(ceiling).probe(&mut oracle, &variant())).unwrap();

            prop_assert_eq!(outcome.stock, StockLevel::Exact(max));
            prop_assert!(outcome.oracle_calls <= call_bound(ceiling));
            prop_assert_eq!(outcome.oracle_calls as usize, oracle.calls.len());
        }
    }
}
