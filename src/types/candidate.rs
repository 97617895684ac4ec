use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{CandleStatus, MarketType, OhlcvSeries, OrderKind, PatternKind, TradeSignal};

/// Evidence for one detected candlestick formation. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternInfo {
    pub kind: PatternKind,
    /// 0.0..=1.0
    pub confidence: f64,
    /// 0..=100
    pub strength: i32,
    pub description: String,
    /// Target price as a multiple of entry, e.g. 1.018 for +1.8%.
    pub target_ratio: f64,
    /// Stop price as a multiple of entry, e.g. 0.985 for -1.5%.
    pub stop_ratio: f64,
    pub max_holding_hours: i64,
    pub detected_at: DateTime<Utc>,
    pub metadata: HashMap<String, f64>,
}

/// Boolean entry gates with the reasons anything failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryConditions {
    pub volume_check: bool,
    pub rsi_check: bool,
    pub time_check: bool,
    pub price_check: bool,
    pub market_cap_check: bool,
    pub daily_volume_check: bool,
    pub overall_passed: bool,
    pub fail_reasons: Vec<String>,
}

impl EntryConditions {
    pub fn finalize(&mut self) {
        self.overall_passed = self.volume_check
            && self.rsi_check
            && self.time_check
            && self.price_check
            && self.market_cap_check
            && self.daily_volume_check;
    }
}

/// Per-candidate risk plan derived by RiskPolicy, adjustable by the evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPlan {
    /// Percent of investable capital, 0..=100.
    pub position_size_pct: f64,
    pub target_price: Decimal,
    pub stop_loss_price: Decimal,
    pub trailing_stop_pct: f64,
    pub max_holding_hours: i64,
    /// 0..=100, higher is riskier.
    pub risk_score: i32,
}

impl Default for RiskPlan {
    fn default() -> Self {
        Self {
            position_size_pct: 0.0,
            target_price: Decimal::ZERO,
            stop_loss_price: Decimal::ZERO,
            trailing_stop_pct: 0.0,
            max_holding_hours: 48,
            risk_score: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Performance {
    pub entry_time: Option<DateTime<Utc>>,
    pub entry_price: Option<Decimal>,
    pub entry_quantity: u32,
    pub buy_execution_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub exit_reason: Option<String>,
    pub max_price_seen: Option<Decimal>,
    pub min_price_seen: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub pnl_pct: Option<f64>,
}

/// A tracked symbol with lifecycle state. Uniquely keyed by `stock_code`
/// inside the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub stock_code: String,
    pub stock_name: String,
    pub market_type: MarketType,

    pub current_price: Decimal,
    pub last_price_update: DateTime<Utc>,

    pub ohlcv: Option<OhlcvSeries>,
    /// Cache is fresh only when this equals today (KST).
    pub ohlcv_update_date: Option<NaiveDate>,

    pub detected_patterns: Vec<PatternInfo>,
    pub pattern_score: i32,

    pub trade_signal: TradeSignal,
    pub signal_strength: i32,
    pub signal_updated_at: DateTime<Utc>,

    pub entry_conditions: EntryConditions,
    pub entry_priority: i32,

    pub risk_plan: RiskPlan,

    pub status: CandleStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,

    pub pending_buy_order_no: Option<String>,
    pub pending_sell_order_no: Option<String>,
    pub pending_order_time: Option<DateTime<Utc>>,
    pub pending_order_kind: Option<OrderKind>,
    pub completed_buy_orders: Vec<String>,
    pub completed_sell_orders: Vec<String>,

    pub performance: Performance,
    pub metadata: HashMap<String, String>,
}

impl Candidate {
    pub fn new(stock_code: &str, stock_name: &str, market_type: MarketType, price: Decimal) -> Self {
        let now = Utc::now();
        Self {
            stock_code: stock_code.to_string(),
            stock_name: stock_name.to_string(),
            market_type,
            current_price: price,
            last_price_update: now,
            ohlcv: None,
            ohlcv_update_date: None,
            detected_patterns: Vec::new(),
            pattern_score: 0,
            trade_signal: TradeSignal::Hold,
            signal_strength: 0,
            signal_updated_at: now,
            entry_conditions: EntryConditions::default(),
            entry_priority: 0,
            risk_plan: RiskPlan::default(),
            status: CandleStatus::Scanning,
            created_at: now,
            last_updated: now,
            pending_buy_order_no: None,
            pending_sell_order_no: None,
            pending_order_time: None,
            pending_order_kind: None,
            completed_buy_orders: Vec::new(),
            completed_sell_orders: Vec::new(),
            performance: Performance::default(),
            metadata: HashMap::new(),
        }
    }

    pub fn cache_ohlcv(&mut self, series: OhlcvSeries, today: NaiveDate) {
        self.ohlcv = Some(series);
        self.ohlcv_update_date = Some(today);
        self.last_updated = Utc::now();
    }

    pub fn fresh_ohlcv(&self, today: NaiveDate) -> Option<&OhlcvSeries> {
        if self.ohlcv_update_date == Some(today) {
            self.ohlcv.as_ref()
        } else {
            None
        }
    }

    pub fn add_pattern(&mut self, pattern: PatternInfo) {
        self.detected_patterns.push(pattern);
        self.pattern_score = self.compute_pattern_score();
        self.last_updated = Utc::now();
    }

    /// Highest-strength pattern drives targets and sizing.
    pub fn primary_pattern(&self) -> Option<&PatternInfo> {
        self.detected_patterns.iter().max_by_key(|p| p.strength)
    }

    /// Confidence-weighted mean of pattern strengths, 0..=100.
    fn compute_pattern_score(&self) -> i32 {
        let mut weighted = 0.0;
        let mut total = 0.0;
        for p in &self.detected_patterns {
            weighted += p.confidence * p.strength as f64;
            total += p.confidence;
        }
        if total > 0.0 {
            (weighted / total).round() as i32
        } else {
            0
        }
    }

    pub fn update_price(&mut self, price: Decimal, at: DateTime<Utc>) {
        self.current_price = price;
        self.last_price_update = at;
        self.last_updated = at;

        if self.status == CandleStatus::Entered {
            if let Some(entry_price) = self.performance.entry_price {
                let qty = Decimal::from(self.performance.entry_quantity);
                self.performance.unrealized_pnl = Some((price - entry_price) * qty);
                if entry_price > Decimal::ZERO {
                    self.performance.pnl_pct = ((price - entry_price) / entry_price * Decimal::from(100))
                        .to_f64();
                }
                let max = self.performance.max_price_seen.unwrap_or(price);
                let min = self.performance.min_price_seen.unwrap_or(price);
                self.performance.max_price_seen = Some(max.max(price));
                self.performance.min_price_seen = Some(min.min(price));
            }
        }
    }

    pub fn enter_position(&mut self, price: Decimal, quantity: u32, at: DateTime<Utc>) {
        self.status = CandleStatus::Entered;
        self.performance.entry_time = Some(at);
        self.performance.entry_price = Some(price);
        self.performance.entry_quantity = quantity;
        self.performance.max_price_seen = Some(price);
        self.performance.min_price_seen = Some(price);
        self.last_updated = at;
    }

    pub fn exit_position(&mut self, price: Decimal, reason: &str, at: DateTime<Utc>) {
        self.status = CandleStatus::Exited;
        self.performance.exit_time = Some(at);
        self.performance.exit_price = Some(price);
        self.performance.exit_reason = Some(reason.to_string());
        if let Some(entry_price) = self.performance.entry_price {
            let qty = Decimal::from(self.performance.entry_quantity);
            self.performance.realized_pnl = Some((price - entry_price) * qty);
            if entry_price > Decimal::ZERO {
                self.performance.pnl_pct =
                    ((price - entry_price) / entry_price * Decimal::from(100)).to_f64();
            }
        }
        self.last_updated = at;
    }

    /// Entry eligibility: every gate passed, a buy-side signal, and a stable
    /// pre-order status with nothing pending.
    pub fn is_ready_for_entry(&self) -> bool {
        self.entry_conditions.overall_passed
            && self.trade_signal.is_buy()
            && matches!(self.status, CandleStatus::Watching | CandleStatus::BuyReady)
            && !self.has_pending_order(None)
    }

    pub fn set_pending_order(&mut self, order_no: &str, kind: OrderKind) {
        match kind {
            OrderKind::Buy => self.pending_buy_order_no = Some(order_no.to_string()),
            OrderKind::Sell => self.pending_sell_order_no = Some(order_no.to_string()),
        }
        self.pending_order_time = Some(Utc::now());
        self.pending_order_kind = Some(kind);
        self.status = CandleStatus::PendingOrder;
        self.last_updated = Utc::now();
    }

    pub fn clear_pending_order(&mut self, kind: Option<OrderKind>) {
        if matches!(kind, None | Some(OrderKind::Buy)) {
            self.pending_buy_order_no = None;
        }
        if matches!(kind, None | Some(OrderKind::Sell)) {
            self.pending_sell_order_no = None;
        }
        if self.pending_buy_order_no.is_none() && self.pending_sell_order_no.is_none() {
            self.pending_order_time = None;
            self.pending_order_kind = None;
        }
        self.last_updated = Utc::now();
    }

    /// Records a filled order and releases the matching pending slot.
    pub fn complete_order(&mut self, order_no: &str, kind: OrderKind) {
        match kind {
            OrderKind::Buy => {
                if !order_no.is_empty() {
                    self.completed_buy_orders.push(order_no.to_string());
                }
                self.pending_buy_order_no = None;
            }
            OrderKind::Sell => {
                if !order_no.is_empty() {
                    self.completed_sell_orders.push(order_no.to_string());
                }
                self.pending_sell_order_no = None;
            }
        }
        if self.pending_buy_order_no.is_none() && self.pending_sell_order_no.is_none() {
            self.pending_order_time = None;
            self.pending_order_kind = None;
        }
        self.last_updated = Utc::now();
    }

    pub fn has_pending_order(&self, kind: Option<OrderKind>) -> bool {
        match kind {
            None => self.pending_buy_order_no.is_some() || self.pending_sell_order_no.is_some(),
            Some(OrderKind::Buy) => self.pending_buy_order_no.is_some(),
            Some(OrderKind::Sell) => self.pending_sell_order_no.is_some(),
        }
    }

    pub fn pending_order_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.pending_order_time.map(|t| now - t)
    }

    pub fn final_exit_confirmed(&self) -> bool {
        self.metadata.get("final_exit_confirmed").map(String::as_str) == Some("true")
    }

    pub fn mark_final_exit(&mut self) {
        self.metadata
            .insert("final_exit_confirmed".to_string(), "true".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candidate() -> Candidate {
        Candidate::new("005930", "Samsung Electronics", MarketType::Kospi, dec!(70000))
    }

    fn pattern(kind: PatternKind, confidence: f64, strength: i32) -> PatternInfo {
        PatternInfo {
            kind,
            confidence,
            strength,
            description: String::new(),
            target_ratio: 1.018,
            stop_ratio: 0.985,
            max_holding_hours: 24,
            detected_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn primary_pattern_is_highest_strength() {
        let mut c = candidate();
        c.add_pattern(pattern(PatternKind::Hammer, 0.7, 70));
        c.add_pattern(pattern(PatternKind::MorningStar, 0.8, 85));
        assert_eq!(c.primary_pattern().unwrap().kind, PatternKind::MorningStar);
        assert!(c.pattern_score > 70 && c.pattern_score <= 85);
    }

    #[test]
    fn pending_order_sets_status_and_clears_symmetrically() {
        let mut c = candidate();
        c.status = CandleStatus::BuyReady;
        c.set_pending_order("0001234567", OrderKind::Buy);
        assert_eq!(c.status, CandleStatus::PendingOrder);
        assert!(c.has_pending_order(Some(OrderKind::Buy)));
        assert!(!c.has_pending_order(Some(OrderKind::Sell)));
        assert!(c.pending_order_time.is_some());

        c.complete_order("0001234567", OrderKind::Buy);
        assert!(!c.has_pending_order(None));
        assert!(c.pending_order_time.is_none());
        assert_eq!(c.completed_buy_orders, vec!["0001234567".to_string()]);
    }

    #[test]
    fn entry_readiness_requires_all_gates() {
        let mut c = candidate();
        c.status = CandleStatus::BuyReady;
        c.trade_signal = TradeSignal::Buy;
        assert!(!c.is_ready_for_entry(), "gates not passed yet");

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
        assert!(c.is_ready_for_entry());

        c.set_pending_order("1", OrderKind::Buy);
        assert!(!c.is_ready_for_entry(), "pending order blocks entry");
    }

    #[test]
    fn entered_candidate_tracks_extremes_and_pnl() {
        let mut c = candidate();
        c.enter_position(dec!(10000), 10, Utc::now());
        c.update_price(dec!(10300), Utc::now());
        c.update_price(dec!(9900), Utc::now());
        assert_eq!(c.performance.max_price_seen, Some(dec!(10300)));
        assert_eq!(c.performance.min_price_seen, Some(dec!(9900)));
        assert_eq!(c.performance.unrealized_pnl, Some(dec!(-1000)));

        c.exit_position(dec!(10290), "target", Utc::now());
        assert_eq!(c.status, CandleStatus::Exited);
        assert_eq!(c.performance.realized_pnl, Some(dec!(2900)));
    }

    #[test]
    fn ohlcv_cache_freshness_is_date_bound() {
        let mut c = candidate();
        let today = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let tomorrow = today.succ_opt().unwrap();
        c.cache_ohlcv(OhlcvSeries::default(), today);
        assert!(c.fresh_ohlcv(today).is_some());
        assert!(c.fresh_ohlcv(tomorrow).is_none());
    }
}
