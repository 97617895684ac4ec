use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::feed::PriceFeed;
use crate::store::CandidateStore;
use crate::types::CandleStatus;

use super::{
    store_tick_callback, EngineController, EntryExecutor, ExecutionReconciler, ExitManager,
    MarketScanner, SignalEvaluator,
};

/// Top-level tick: drives scan -> evaluate -> enter -> exit -> reconcile on
/// a fixed cadence, owns startup reconciliation and shutdown sequencing.
pub struct TradingOrchestrator {
    scanner: MarketScanner,
    evaluator: SignalEvaluator,
    entry: EntryExecutor,
    exit: ExitManager,
    reconciler: Arc<ExecutionReconciler>,
    store: Arc<CandidateStore>,
    feed: Arc<PriceFeed>,
    controller: Arc<EngineController>,
    config: Arc<AppConfig>,
}

impl TradingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scanner: MarketScanner,
        evaluator: SignalEvaluator,
        entry: EntryExecutor,
        exit: ExitManager,
        reconciler: Arc<ExecutionReconciler>,
        store: Arc<CandidateStore>,
        feed: Arc<PriceFeed>,
        controller: Arc<EngineController>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            scanner,
            evaluator,
            entry,
            exit,
            reconciler,
            store,
            feed,
            controller,
            config,
        }
    }

    /// Reconciles pre-existing holdings into the store and puts them on the
    /// price stream before the first trading pass.
    pub async fn startup(&self) {
        let seeded = self.reconciler.seed_existing_holdings().await;
        info!("startup reconciliation complete, {} holdings seeded", seeded);

        for candidate in self.store.get_by_state(&[CandleStatus::Entered]).await {
            if let Err(e) = self
                .feed
                .subscribe(&candidate.stock_code, store_tick_callback(Arc::clone(&self.store)))
                .await
            {
                warn!("{} holding not on stream: {}", candidate.stock_code, e);
            }
        }
    }

    /// The supervised loop. Returns when shutdown is requested.
    pub async fn run(&self) {
        let mut shutdown = self.controller.shutdown_signal();
        let interval = Duration::from_secs(self.config.scanner.scan_interval_secs.max(1));
        info!("trading loop started ({}s cadence)", interval.as_secs());

        loop {
            if self.controller.is_shutting_down() {
                break;
            }

            self.scanner.tick().await;
            if self.controller.is_shutting_down() {
                break;
            }

            self.evaluator.reevaluate_all().await;
            if self.controller.is_shutting_down() {
                break;
            }

            let orders = self.entry.run().await;
            if !orders.is_empty() {
                info!("entry pass submitted {} orders", orders.len());
            }

            self.exit.run().await;

            self.reconciler.check_pending_timeouts().await;
            self.reconciler.maybe_cross_check_balance().await;
            self.store.cleanup_old_exited().await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.shutdown().await;
    }

    /// Cooperative shutdown: in-flight accepted orders are left to the
    /// brokerage, subscriptions are released, tracked state is logged.
    async fn shutdown(&self) {
        info!("shutting down trading loop");

        let pending = self.store.get_by_state(&[CandleStatus::PendingOrder]).await;
        for candidate in &pending {
            info!(
                "leaving pending order in place at shutdown: {} ({:?})",
                candidate.stock_code, candidate.pending_order_kind
            );
        }

        for candidate in self.store.all().await {
            self.feed.unsubscribe(&candidate.stock_code).await;
        }

        let entered = self.store.get_by_state(&[CandleStatus::Entered]).await;
        info!(
            "shutdown complete: {} open positions, {} pending orders, {} orders submitted this run",
            entered.len(),
            pending.len(),
            self.controller.orders_submitted()
        );
    }
}
