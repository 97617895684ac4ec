use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::BrokerGateway;
use crate::config::AppConfig;
use crate::database::TradeRecorder;
use crate::feed::{ExecutionHandler, PriceFeed};
use crate::store::CandidateStore;
use crate::types::{
    Candidate, CandleStatus, ExecutionNotice, Holding, MarketType, OrderKind,
};

/// Consumes execution notices and balance snapshots, resolving
/// PENDING_ORDER candidates into ENTERED/EXITED. The single authority for
/// fill state.
pub struct ExecutionReconciler {
    gateway: Arc<dyn BrokerGateway>,
    store: Arc<CandidateStore>,
    feed: Arc<PriceFeed>,
    recorder: Option<Arc<TradeRecorder>>,
    config: Arc<AppConfig>,
    processed: Mutex<HashSet<String>>,
    last_balance_check: Mutex<Option<std::time::Instant>>,
}

impl ExecutionReconciler {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        store: Arc<CandidateStore>,
        feed: Arc<PriceFeed>,
        recorder: Option<Arc<TradeRecorder>>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            gateway,
            store,
            feed,
            recorder,
            config,
            processed: Mutex::new(HashSet::new()),
            last_balance_check: Mutex::new(None),
        }
    }

    /// Applies one fill notice. Reprocessing the same notice is a no-op.
    pub async fn apply_notice(&self, notice: ExecutionNotice) {
        {
            let mut processed = self.processed.lock().await;
            if !processed.insert(notice.dedup_key()) {
                debug!("duplicate execution notice ignored: {}", notice.dedup_key());
                return;
            }
        }

        match notice.kind {
            OrderKind::Buy => self.apply_buy_fill(notice).await,
            OrderKind::Sell => self.apply_sell_fill(notice).await,
        }
    }

    async fn apply_buy_fill(&self, notice: ExecutionNotice) {
        let price = Decimal::from(notice.price);
        let now = Utc::now();

        let mut candidate = match self.store.get(&notice.stock_code).await {
            Some(candidate) => candidate,
            None => {
                // A fill for an untracked symbol is a manual purchase; track
                // it so the exit path manages it.
                info!(
                    "buy fill for untracked {} x{}, synthesizing position",
                    notice.stock_code, notice.quantity
                );
                let mut candidate =
                    Candidate::new(&notice.stock_code, &notice.stock_code, MarketType::Kospi, price);
                candidate
                    .metadata
                    .insert("entry_source".to_string(), "execution_notice".to_string());
                candidate.enter_position(price, notice.quantity, now);
                candidate.performance.buy_execution_time = Some(now);
                candidate.completed_buy_orders.push(notice.order_no.clone());
                self.store.add(candidate).await;
                return;
            }
        };

        let previous_quantity = candidate.performance.entry_quantity;
        if previous_quantity == 0 {
            candidate.enter_position(price, notice.quantity, now);
        } else {
            // Partial fills accumulate into a volume-weighted entry.
            let prev_qty = Decimal::from(previous_quantity);
            let new_qty = Decimal::from(notice.quantity);
            let prev_price = candidate.performance.entry_price.unwrap_or(price);
            let blended = (prev_price * prev_qty + price * new_qty) / (prev_qty + new_qty);
            candidate.performance.entry_price = Some(blended.round_dp(2));
            candidate.performance.entry_quantity = previous_quantity + notice.quantity;
        }
        candidate.performance.buy_execution_time = Some(now);
        candidate.complete_order(&notice.order_no, OrderKind::Buy);
        candidate.status = CandleStatus::Entered;
        candidate.update_price(price, now);

        info!(
            "{} buy filled x{} @ {} (held {})",
            candidate.stock_code, notice.quantity, price, candidate.performance.entry_quantity
        );

        if previous_quantity == 0 {
            if let Some(recorder) = &self.recorder {
                if let Err(e) = recorder.record_position_open(&candidate).await {
                    warn!("{} open record failed: {}", candidate.stock_code, e);
                }
            }
        }
        self.store.update(candidate).await;
    }

    async fn apply_sell_fill(&self, notice: ExecutionNotice) {
        let Some(mut candidate) = self.store.get(&notice.stock_code).await else {
            warn!("sell fill for untracked {}, dropped", notice.stock_code);
            return;
        };

        let price = Decimal::from(notice.price);
        let held = candidate.performance.entry_quantity;
        if notice.quantity < held {
            // Partial sell: shrink the position and stay pending until the
            // rest fills.
            candidate.performance.entry_quantity = held - notice.quantity;
            candidate.update_price(price, Utc::now());
            info!(
                "{} partial sell fill x{} ({} remaining)",
                candidate.stock_code, notice.quantity, candidate.performance.entry_quantity
            );
            self.store.update(candidate).await;
            return;
        }

        let reason = candidate
            .metadata
            .get("pending_exit_reason")
            .cloned()
            .unwrap_or_else(|| "execution".to_string());
        candidate.complete_order(&notice.order_no, OrderKind::Sell);
        candidate.exit_position(price, &reason, Utc::now());
        candidate.mark_final_exit();

        info!(
            "{} sell filled x{} @ {} ({}), pnl {:?}",
            candidate.stock_code, notice.quantity, price, reason, candidate.performance.realized_pnl
        );

        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.record_position_close(&candidate).await {
                warn!("{} close record failed: {}", candidate.stock_code, e);
            }
        }

        let code = candidate.stock_code.clone();
        self.store.update(candidate).await;
        self.feed.release_after_grace(
            &code,
            Duration::from_secs(self.config.exit.subscription_release_grace_secs),
        );
    }

    /// Ages out stuck PENDING_ORDER rows: past the timeout the account is
    /// polled and the candidate either finalizes or reverts to its prior
    /// stable state.
    pub async fn check_pending_timeouts(&self) {
        let timeout = chrono::Duration::seconds(self.config.reconciler.pending_order_timeout_secs);
        let now = Utc::now();
        let pending = self.store.get_by_state(&[CandleStatus::PendingOrder]).await;
        if pending.is_empty() {
            return;
        }

        let stale: Vec<Candidate> = pending
            .into_iter()
            .filter(|c| c.pending_order_age(now).map(|age| age > timeout).unwrap_or(true))
            .collect();
        if stale.is_empty() {
            return;
        }

        let holdings = match self.gateway.balance().await {
            Ok(balance) => balance.holdings,
            Err(e) => {
                warn!("pending-order poll could not read balance: {}", e);
                return;
            }
        };

        for mut candidate in stale {
            let holding = holdings.iter().find(|h| h.stock_code == candidate.stock_code);
            let code = candidate.stock_code.clone();

            if candidate.pending_buy_order_no.is_some() {
                match holding {
                    Some(h) => {
                        info!("{} stale buy order resolved against holdings x{}", code, h.quantity);
                        candidate.complete_order(
                            &candidate.pending_buy_order_no.clone().unwrap_or_default(),
                            OrderKind::Buy,
                        );
                        candidate.enter_position(h.average_price, h.quantity, now);
                    }
                    None => {
                        warn!("{} buy order timed out unfilled, reverting to ready", code);
                        candidate.clear_pending_order(Some(OrderKind::Buy));
                        candidate.status = CandleStatus::BuyReady;
                    }
                }
            } else if candidate.pending_sell_order_no.is_some() {
                match holding {
                    Some(_) => {
                        warn!("{} sell order timed out unfilled, reverting to entered", code);
                        candidate.clear_pending_order(Some(OrderKind::Sell));
                        candidate.status = CandleStatus::Entered;
                    }
                    None => {
                        info!("{} stale sell order resolved: shares gone, exiting", code);
                        let reason = candidate
                            .metadata
                            .get("pending_exit_reason")
                            .cloned()
                            .unwrap_or_else(|| "timeout_poll".to_string());
                        candidate.clear_pending_order(Some(OrderKind::Sell));
                        candidate.exit_position(candidate.current_price, &reason, now);
                        candidate.mark_final_exit();
                    }
                }
            } else {
                // Pending with no order number is an inconsistent row.
                warn!("{} pending with no order number, stopping", code);
                candidate.status = CandleStatus::Stopped;
            }
            self.store.update(candidate).await;
        }
    }

    /// Periodic holdings cross-check: an ENTERED candidate the account no
    /// longer holds gets closed out as `holding_missing`.
    pub async fn maybe_cross_check_balance(&self) {
        let interval = Duration::from_secs(self.config.reconciler.balance_check_interval_secs);
        {
            let mut last = self.last_balance_check.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < interval {
                    return;
                }
            }
            *last = Some(std::time::Instant::now());
        }

        let holdings = match self.gateway.balance().await {
            Ok(balance) => balance.holdings,
            Err(e) => {
                warn!("balance cross-check failed: {}", e);
                return;
            }
        };

        for mut candidate in self.store.get_by_state(&[CandleStatus::Entered]).await {
            if candidate.final_exit_confirmed() {
                continue;
            }
            if holdings.iter().any(|h| h.stock_code == candidate.stock_code) {
                continue;
            }
            warn!(
                "{} entered but missing from holdings, closing as holding_missing",
                candidate.stock_code
            );
            candidate
                .metadata
                .insert("auto_exit_reason".to_string(), "holding_missing".to_string());
            candidate.exit_position(candidate.current_price, "holding_missing", Utc::now());
            candidate.mark_final_exit();
            self.store.update(candidate).await;
        }
    }

    /// Startup reconciliation: every account holding becomes an ENTERED
    /// candidate with synthesized entry data.
    pub async fn seed_existing_holdings(&self) -> usize {
        let holdings = match self.gateway.balance().await {
            Ok(balance) => balance.holdings,
            Err(e) => {
                warn!("holding seed failed to read balance: {}", e);
                return 0;
            }
        };

        let mut seeded = 0;
        for holding in holdings {
            if self.store.contains(&holding.stock_code).await {
                continue;
            }
            let candidate = synthesize_holding_candidate(&holding);
            info!(
                "seeded existing holding {} x{} @ {}",
                holding.stock_code, holding.quantity, holding.average_price
            );
            if self.store.add(candidate).await {
                seeded += 1;
            }
        }
        seeded
    }
}

/// Builds an ENTERED candidate for a position the account already held at
/// startup.
pub fn synthesize_holding_candidate(holding: &Holding) -> Candidate {
    let mut candidate = Candidate::new(
        &holding.stock_code,
        &holding.stock_name,
        MarketType::Kospi,
        holding.current_price,
    );
    candidate
        .metadata
        .insert("entry_source".to_string(), "existing_holding".to_string());
    candidate.enter_position(holding.average_price, holding.quantity, Utc::now());
    candidate.update_price(holding.current_price, Utc::now());
    // Default protective plan until the evaluator rebuilds one.
    candidate.risk_plan.target_price = (holding.average_price * Decimal::new(103, 2)).round_dp(0);
    candidate.risk_plan.stop_loss_price = (holding.average_price * Decimal::new(98, 2)).round_dp(0);
    candidate.risk_plan.trailing_stop_pct = 1.2;
    candidate
}

#[async_trait]
impl ExecutionHandler for ExecutionReconciler {
    async fn handle_execution(&self, notice: ExecutionNotice) {
        self.apply_notice(notice).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, ChartPeriod};
    use crate::types::{
        AccountBalance, DailyBar, OrderRequest, OrderResult, PriceSnapshot, RankedStock,
        TradeSignal,
    };
    use rust_decimal_macros::dec;
    use tokio::sync::RwLock as TokioRwLock;

    struct FakeBroker {
        holdings: TokioRwLock<Vec<Holding>>,
    }

    impl FakeBroker {
        fn empty() -> Self {
            Self {
                holdings: TokioRwLock::new(Vec::new()),
            }
        }

        fn with_holdings(holdings: Vec<Holding>) -> Self {
            Self {
                holdings: TokioRwLock::new(holdings),
            }
        }
    }

    #[async_trait]
    impl BrokerGateway for FakeBroker {
        async fn current_price(&self, code: &str) -> Result<PriceSnapshot, BrokerError> {
            Ok(PriceSnapshot {
                stock_code: code.to_string(),
                stock_name: code.to_string(),
                current_price: dec!(10000),
                open: dec!(10000),
                high: dec!(10000),
                low: dec!(10000),
                prev_close: dec!(10000),
                accumulated_volume: 100_000,
                average_volume: 50_000,
                day_change_pct: 0.0,
            })
        }

        async fn daily_chart(
            &self,
            _code: &str,
            _period: ChartPeriod,
            _adjusted: bool,
        ) -> Result<Vec<DailyBar>, BrokerError> {
            Ok(Vec::new())
        }

        async fn fluctuation_rank(
            &self,
            _market: MarketType,
            _min_rate: f64,
        ) -> Result<Vec<RankedStock>, BrokerError> {
            Ok(Vec::new())
        }

        async fn volume_rank(&self, _market: MarketType) -> Result<Vec<RankedStock>, BrokerError> {
            Ok(Vec::new())
        }

        async fn disparity_rank(
            &self,
            _market: MarketType,
            _window: u16,
        ) -> Result<Vec<RankedStock>, BrokerError> {
            Ok(Vec::new())
        }

        async fn balance(&self) -> Result<AccountBalance, BrokerError> {
            Ok(AccountBalance {
                available_amount: dec!(1000000),
                cash_balance: dec!(1000000),
                total_value: dec!(2000000),
                holdings: self.holdings.read().await.clone(),
            })
        }

        async fn order_buy(&self, _order: &OrderRequest) -> Result<OrderResult, BrokerError> {
            Ok(OrderResult::accepted("1".to_string()))
        }

        async fn order_sell(&self, _order: &OrderRequest) -> Result<OrderResult, BrokerError> {
            Ok(OrderResult::accepted("2".to_string()))
        }
    }

    fn reconciler_with(gateway: Arc<FakeBroker>) -> (ExecutionReconciler, Arc<CandidateStore>) {
        let store = Arc::new(CandidateStore::new(100, 15));
        let gateway_dyn: Arc<dyn BrokerGateway> = gateway.clone();
        let feed = PriceFeed::pull_only(gateway_dyn);
        let reconciler = ExecutionReconciler::new(
            gateway,
            Arc::clone(&store),
            feed,
            None,
            Arc::new(AppConfig::default()),
        );
        (reconciler, store)
    }

    fn buy_notice(order_no: &str, quantity: u32, price: i64) -> ExecutionNotice {
        ExecutionNotice {
            stock_code: "005930".to_string(),
            order_no: order_no.to_string(),
            kind: OrderKind::Buy,
            quantity,
            price,
            execution_time: "093015".to_string(),
        }
    }

    fn sell_notice(order_no: &str, quantity: u32, price: i64) -> ExecutionNotice {
        ExecutionNotice {
            kind: OrderKind::Sell,
            ..buy_notice(order_no, quantity, price)
        }
    }

    fn pending_buy_candidate() -> Candidate {
        let mut c = Candidate::new("005930", "Samsung Electronics", MarketType::Kospi, dec!(10000));
        c.status = CandleStatus::BuyReady;
        c.trade_signal = TradeSignal::Buy;
        c.set_pending_order("0001234567", OrderKind::Buy);
        c
    }

    #[tokio::test]
    async fn buy_fill_enters_position() {
        let (reconciler, store) = reconciler_with(Arc::new(FakeBroker::empty()));
        store.add(pending_buy_candidate()).await;

        reconciler.apply_notice(buy_notice("0001234567", 10, 10_000)).await;

        let c = store.get("005930").await.unwrap();
        assert_eq!(c.status, CandleStatus::Entered);
        assert_eq!(c.performance.entry_quantity, 10);
        assert_eq!(c.performance.entry_price, Some(dec!(10000)));
        assert!(c.performance.buy_execution_time.is_some());
        assert!(!c.has_pending_order(None));
        assert_eq!(c.completed_buy_orders, vec!["0001234567".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_notice_is_idempotent() {
        let (reconciler, store) = reconciler_with(Arc::new(FakeBroker::empty()));
        store.add(pending_buy_candidate()).await;

        let notice = buy_notice("0001234567", 10, 10_000);
        reconciler.apply_notice(notice.clone()).await;
        reconciler.apply_notice(notice).await;

        let c = store.get("005930").await.unwrap();
        assert_eq!(c.performance.entry_quantity, 10, "second delivery must not double-fill");
    }

    #[tokio::test]
    async fn partial_buy_fills_accumulate_weighted_entry() {
        let (reconciler, store) = reconciler_with(Arc::new(FakeBroker::empty()));
        store.add(pending_buy_candidate()).await;

        reconciler.apply_notice(buy_notice("0001234567", 6, 10_000)).await;
        // Distinct execution time so the dedup key differs.
        let mut second = buy_notice("0001234567", 4, 10_100);
        second.execution_time = "093100".to_string();
        reconciler.apply_notice(second).await;

        let c = store.get("005930").await.unwrap();
        assert_eq!(c.performance.entry_quantity, 10);
        assert_eq!(c.performance.entry_price, Some(dec!(10040)));
        assert_eq!(c.status, CandleStatus::Entered);
    }

    #[tokio::test]
    async fn sell_fill_exits_with_realized_pnl() {
        let (reconciler, store) = reconciler_with(Arc::new(FakeBroker::empty()));
        let mut c = pending_buy_candidate();
        c.clear_pending_order(Some(OrderKind::Buy));
        c.status = CandleStatus::BuyReady;
        c.enter_position(dec!(10000), 10, Utc::now());
        c.metadata.insert("pending_exit_reason".to_string(), "target".to_string());
        c.set_pending_order("0007654321", OrderKind::Sell);
        store.add(c).await;

        reconciler.apply_notice(sell_notice("0007654321", 10, 10_290)).await;

        let c = store.get("005930").await.unwrap();
        assert_eq!(c.status, CandleStatus::Exited);
        assert_eq!(c.performance.exit_price, Some(dec!(10290)));
        assert_eq!(c.performance.realized_pnl, Some(dec!(2900)));
        assert_eq!(c.performance.exit_reason.as_deref(), Some("target"));
        assert!(c.final_exit_confirmed());
    }

    #[tokio::test]
    async fn unknown_buy_fill_synthesizes_entered_candidate() {
        let (reconciler, store) = reconciler_with(Arc::new(FakeBroker::empty()));
        reconciler.apply_notice(buy_notice("0009999999", 5, 20_000)).await;

        let c = store.get("005930").await.unwrap();
        assert_eq!(c.status, CandleStatus::Entered);
        assert_eq!(c.performance.entry_quantity, 5);
        assert_eq!(c.metadata.get("entry_source").map(String::as_str), Some("execution_notice"));
    }

    #[tokio::test]
    async fn stale_buy_order_reverts_when_unfilled() {
        let gateway = Arc::new(FakeBroker::empty());
        let (reconciler, store) = reconciler_with(gateway);
        let mut c = pending_buy_candidate();
        c.pending_order_time = Some(Utc::now() - chrono::Duration::seconds(700));
        store.add(c).await;

        reconciler.check_pending_timeouts().await;

        let c = store.get("005930").await.unwrap();
        assert_eq!(c.status, CandleStatus::BuyReady);
        assert!(!c.has_pending_order(None));
    }

    #[tokio::test]
    async fn missing_holding_closes_entered_candidate() {
        let gateway = Arc::new(FakeBroker::empty());
        let (reconciler, store) = reconciler_with(gateway);
        let mut c = Candidate::new("005930", "Samsung Electronics", MarketType::Kospi, dec!(10000));
        c.enter_position(dec!(10000), 10, Utc::now());
        store.add(c).await;

        reconciler.maybe_cross_check_balance().await;

        let c = store.get("005930").await.unwrap();
        assert_eq!(c.status, CandleStatus::Exited);
        assert_eq!(c.metadata.get("auto_exit_reason").map(String::as_str), Some("holding_missing"));
    }

    #[tokio::test]
    async fn startup_seeds_existing_holdings_as_entered() {
        let gateway = Arc::new(FakeBroker::with_holdings(vec![Holding {
            stock_code: "000660".to_string(),
            stock_name: "SK hynix".to_string(),
            quantity: 3,
            average_price: dec!(150000),
            current_price: dec!(152000),
            profit_loss_rate: 1.3,
        }]));
        let (reconciler, store) = reconciler_with(gateway);

        assert_eq!(reconciler.seed_existing_holdings().await, 1);
        let c = store.get("000660").await.unwrap();
        assert_eq!(c.status, CandleStatus::Entered);
        assert_eq!(c.performance.entry_quantity, 3);
        assert_eq!(c.performance.entry_price, Some(dec!(150000)));
        assert_eq!(c.metadata.get("entry_source").map(String::as_str), Some("existing_holding"));
        assert!(c.risk_plan.stop_loss_price > Decimal::ZERO);
    }
}
