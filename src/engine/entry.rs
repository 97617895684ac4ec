use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::broker::BrokerGateway;
use crate::config::ExecutorSettings;
use crate::risk::MarketCondition;
use crate::store::CandidateStore;
use crate::types::{AccountBalance, Candidate, OrderKind, OrderRequest, OrderResult};

use super::EngineController;

/// Sizes and submits buy orders for candidates that cleared every entry
/// gate. Enforces the per-symbol cooldown, pending-order uniqueness, and the
/// global positions cap.
pub struct EntryExecutor {
    gateway: Arc<dyn BrokerGateway>,
    store: Arc<CandidateStore>,
    condition: Arc<RwLock<MarketCondition>>,
    controller: Arc<EngineController>,
    settings: ExecutorSettings,
}

impl EntryExecutor {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        store: Arc<CandidateStore>,
        condition: Arc<RwLock<MarketCondition>>,
        controller: Arc<EngineController>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            gateway,
            store,
            condition,
            controller,
            settings,
        }
    }

    /// One pass over ready candidates, highest priority first. Returns the
    /// submitted order numbers.
    pub async fn run(&self) -> Vec<String> {
        if !self.controller.should_submit_orders() {
            return Vec::new();
        }

        let committed = self.store.committed_position_count().await;
        let cap = self.store.max_positions();
        if committed >= cap {
            debug!("positions cap reached ({}/{}), no entries this pass", committed, cap);
            return Vec::new();
        }
        let mut open_slots = cap - committed;

        let mut ready: Vec<Candidate> = self
            .store
            .all()
            .await
            .into_iter()
            .filter(|c| c.is_ready_for_entry())
            .collect();
        ready.sort_by(|a, b| b.entry_priority.cmp(&a.entry_priority));

        if ready.is_empty() {
            return Vec::new();
        }

        let balance = match self.gateway.balance().await {
            Ok(balance) => balance,
            Err(e) => {
                warn!("balance pull failed, skipping entries this pass: {}", e);
                return Vec::new();
            }
        };
        let investable = investable_funds(&balance, &self.settings);
        if investable < Decimal::from(self.settings.min_investment_krw) {
            debug!("investable {} below minimum, no entries", investable);
            return Vec::new();
        }

        let condition = *self.condition.read().await;
        let now = Utc::now();
        let mut submitted = Vec::new();

        for candidate in ready {
            if open_slots == 0 || self.controller.is_shutting_down() {
                break;
            }
            if let Some(order_no) = self.try_enter(candidate, investable, &condition, now).await {
                submitted.push(order_no);
                open_slots -= 1;
            }
        }
        submitted
    }

    async fn try_enter(
        &self,
        mut candidate: Candidate,
        investable: Decimal,
        condition: &MarketCondition,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let code = candidate.stock_code.clone();

        if !cooldown_elapsed(&candidate, now, self.settings.min_order_interval_secs) {
            debug!("{} inside buy cooldown, skipping", code);
            return None;
        }

        let amount = position_amount(&candidate, investable, condition, &self.settings);
        let price = candidate.current_price;
        if price <= Decimal::ZERO {
            return None;
        }
        let quantity = (amount / price).floor().to_u32().unwrap_or(0);
        if quantity == 0 {
            debug!("{} sized to zero shares ({} / {}), skipping", code, amount, price);
            return None;
        }

        info!(
            "submitting buy {} x{} @ {} (priority {}, {}% plan)",
            code, quantity, price, candidate.entry_priority, candidate.risk_plan.position_size_pct as i64
        );
        let order = OrderRequest::limit(&code, OrderKind::Buy, quantity, price);
        debug!("{} buy request tagged {}", code, order.client_tag);
        let result = match self.gateway.order_buy(&order).await {
            Ok(result) => result,
            Err(e) => {
                warn!("{} buy submission failed: {}", code, e);
                return None;
            }
        };

        // The cooldown starts at submission, covering rejections too.
        candidate
            .metadata
            .insert("last_buy_order_time".to_string(), now.to_rfc3339());

        if !result.success {
            warn!("{} buy rejected by gateway: {}", code, result.message);
            candidate.clear_pending_order(Some(OrderKind::Buy));
            self.store.update(candidate).await;
            return None;
        }

        let order_no = result.order_no.unwrap_or_default();
        candidate.set_pending_order(&order_no, OrderKind::Buy);
        self.store.update(candidate).await;
        self.controller.record_order();
        info!("{} buy accepted, order {}", code, order_no);
        Some(order_no)
    }
}

/// Investable cash: 90% of the reported buyable amount, falling back to 80%
/// of raw cash when the gateway omits it.
pub fn investable_funds(balance: &AccountBalance, settings: &ExecutorSettings) -> Decimal {
    let available_ratio = Decimal::from_f64(settings.available_amount_ratio).unwrap_or(Decimal::ONE);
    let cash_ratio = Decimal::from_f64(settings.cash_usage_ratio).unwrap_or(Decimal::ONE);
    if balance.available_amount > Decimal::ZERO {
        (balance.available_amount * available_ratio).round_dp(0)
    } else {
        (balance.cash_balance * cash_ratio).round_dp(0)
    }
}

/// Position amount: investable x single-position ratio x market-condition
/// multipliers x priority multiplier, clamped to [minimum, investable].
pub fn position_amount(
    candidate: &Candidate,
    investable: Decimal,
    condition: &MarketCondition,
    settings: &ExecutorSettings,
) -> Decimal {
    let priority_multiplier = (candidate.entry_priority as f64 / 100.0
        + settings.base_priority_multiplier)
        .min(settings.max_priority_multiplier);
    let multiplier = settings.max_single_investment_ratio
        * condition.size_multiplier()
        * priority_multiplier;

    let amount = investable * Decimal::from_f64(multiplier).unwrap_or(Decimal::ZERO);
    amount
        .max(Decimal::from(settings.min_investment_krw))
        .min(investable)
        .round_dp(0)
}

/// The per-symbol buy cooldown: a fresh order is allowed only after the
/// configured interval since the last submission.
pub fn cooldown_elapsed(candidate: &Candidate, now: DateTime<Utc>, interval_secs: i64) -> bool {
    match candidate.metadata.get("last_buy_order_time") {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(last) => (now - last.with_timezone(&Utc)).num_seconds() >= interval_secs,
            Err(_) => true,
        },
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::{MarketTrend, MarketVolatility};
    use crate::types::MarketType;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn settings() -> ExecutorSettings {
        ExecutorSettings::default()
    }

    fn balance(available: i64, cash: i64) -> AccountBalance {
        AccountBalance {
            available_amount: Decimal::from(available),
            cash_balance: Decimal::from(cash),
            total_value: Decimal::from(available + cash),
            holdings: Vec::new(),
        }
    }

    fn candidate(priority: i32) -> Candidate {
        let mut c = Candidate::new("005930", "Samsung Electronics", MarketType::Kospi, dec!(70000));
        c.entry_priority = priority;
        c
    }

    #[test]
    fn investable_prefers_available_amount() {
        let funds = investable_funds(&balance(1_000_000, 2_000_000), &settings());
        assert_eq!(funds, dec!(900000));
    }

    #[test]
    fn investable_falls_back_to_cash() {
        let funds = investable_funds(&balance(0, 1_000_000), &settings());
        assert_eq!(funds, dec!(800000));
    }

    #[test]
    fn position_amount_applies_multiplier_stack() {
        // priority 50 -> multiplier min(1.5, 0.5 + 0.5) = 1.0
        let amount = position_amount(
            &candidate(50),
            dec!(1000000),
            &MarketCondition::default(),
            &settings(),
        );
        assert_eq!(amount, dec!(400000));

        // priority 100 -> multiplier capped at 1.5
        let amount = position_amount(
            &candidate(100),
            dec!(1000000),
            &MarketCondition::default(),
            &settings(),
        );
        assert_eq!(amount, dec!(600000));
    }

    #[test]
    fn position_amount_scales_with_market_condition() {
        let bear = MarketCondition {
            trend: MarketTrend::Bear,
            volatility: MarketVolatility::Normal,
        };
        let amount = position_amount(&candidate(50), dec!(1000000), &bear, &settings());
        // 1_000_000 * 0.4 * 0.7 * 1.0
        assert_eq!(amount, dec!(280000));
    }

    #[test]
    fn position_amount_is_clamped_to_investable() {
        let amount = position_amount(&candidate(100), dec!(150000), &MarketCondition::default(), &settings());
        // 150_000 * 0.6 = 90_000 rises to the 100_000 floor.
        assert_eq!(amount, dec!(100000));

        let amount = position_amount(&candidate(100), dec!(80000), &MarketCondition::default(), &settings());
        // The floor never exceeds the investable ceiling.
        assert_eq!(amount, dec!(80000));
    }

    use crate::broker::{BrokerError, BrokerGateway, ChartPeriod};
    use crate::store::CandidateStore;
    use crate::types::{
        CandleStatus, DailyBar, EntryConditions, PriceSnapshot, RankedStock, TradeSignal,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeBroker {
        accept_orders: bool,
        orders_seen: AtomicU32,
    }

    impl FakeBroker {
        fn accepting() -> Self {
            Self { accept_orders: true, orders_seen: AtomicU32::new(0) }
        }

        fn rejecting() -> Self {
            Self { accept_orders: false, orders_seen: AtomicU32::new(0) }
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
            Ok(balance(10_000_000, 10_000_000))
        }

        async fn order_buy(&self, _order: &OrderRequest) -> Result<OrderResult, BrokerError> {
            self.orders_seen.fetch_add(1, Ordering::SeqCst);
            if self.accept_orders {
                Ok(OrderResult::accepted("0001000001".to_string()))
            } else {
                Ok(OrderResult::rejected("limit exceeded"))
            }
        }

        async fn order_sell(&self, _order: &OrderRequest) -> Result<OrderResult, BrokerError> {
            Ok(OrderResult::rejected("not under test"))
        }
    }

    fn ready_candidate(code: &str, priority: i32) -> Candidate {
        let mut c = Candidate::new(code, code, MarketType::Kospi, dec!(10000));
        c.status = CandleStatus::BuyReady;
        c.trade_signal = TradeSignal::Buy;
        c.entry_priority = priority;
        c.entry_conditions = EntryConditions {
            volume_check: true,
            rsi_check: true,
            time_check: true,
            price_check: true,
            market_cap_check: true,
            daily_volume_check: true,
            ..Default::default()
        };
        c.entry_conditions.finalize();
        c
    }

    fn executor_with(
        gateway: Arc<FakeBroker>,
        store: Arc<CandidateStore>,
    ) -> EntryExecutor {
        EntryExecutor::new(
            gateway,
            store,
            Arc::new(RwLock::new(MarketCondition::default())),
            Arc::new(crate::engine::EngineController::new_running()),
            settings(),
        )
    }

    #[tokio::test]
    async fn full_positions_cap_blocks_new_entries() {
        let store = Arc::new(CandidateStore::new(100, 15));
        for i in 0..15 {
            let mut held = Candidate::new(&format!("{:06}", i), "held", MarketType::Kospi, dec!(10000));
            held.enter_position(dec!(10000), 10, Utc::now());
            store.add(held).await;
        }
        store.add(ready_candidate("999999", 90)).await;

        let gateway = Arc::new(FakeBroker::accepting());
        let executor = executor_with(Arc::clone(&gateway), Arc::clone(&store));

        assert!(executor.run().await.is_empty());
        assert_eq!(gateway.orders_seen.load(Ordering::SeqCst), 0);
        // The sixteenth candidate keeps waiting in BUY_READY.
        assert_eq!(store.get("999999").await.unwrap().status, CandleStatus::BuyReady);
    }

    #[tokio::test]
    async fn accepted_buy_moves_candidate_to_pending() {
        let store = Arc::new(CandidateStore::new(100, 15));
        store.add(ready_candidate("005930", 80)).await;
        let gateway = Arc::new(FakeBroker::accepting());
        let executor = executor_with(Arc::clone(&gateway), Arc::clone(&store));

        let orders = executor.run().await;
        assert_eq!(orders, vec!["0001000001".to_string()]);

        let c = store.get("005930").await.unwrap();
        assert_eq!(c.status, CandleStatus::PendingOrder);
        assert!(c.has_pending_order(Some(OrderKind::Buy)));
        assert!(c.metadata.contains_key("last_buy_order_time"));
    }

    #[tokio::test]
    async fn rejected_buy_stays_ready_and_enters_cooldown() {
        let store = Arc::new(CandidateStore::new(100, 15));
        store.add(ready_candidate("005930", 80)).await;
        let gateway = Arc::new(FakeBroker::rejecting());
        let executor = executor_with(Arc::clone(&gateway), Arc::clone(&store));

        assert!(executor.run().await.is_empty());
        let c = store.get("005930").await.unwrap();
        assert_eq!(c.status, CandleStatus::BuyReady);
        assert!(!c.has_pending_order(None));
        assert!(!cooldown_elapsed(&c, Utc::now(), 300), "rejection starts the cooldown");

        // An immediate second pass is blocked by the cooldown.
        assert!(executor.run().await.is_empty());
        assert_eq!(gateway.orders_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cooldown_blocks_until_interval_elapses() {
        let mut c = candidate(50);
        let now = Utc::now();
        assert!(cooldown_elapsed(&c, now, 300));

        c.metadata.insert(
            "last_buy_order_time".to_string(),
            (now - Duration::seconds(100)).to_rfc3339(),
        );
        assert!(!cooldown_elapsed(&c, now, 300));

        c.metadata.insert(
            "last_buy_order_time".to_string(),
            (now - Duration::seconds(301)).to_rfc3339(),
        );
        assert!(cooldown_elapsed(&c, now, 300));
    }
}
