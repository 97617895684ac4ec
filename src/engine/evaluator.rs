use chrono::{NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::feed::PriceFeed;
use crate::patterns::PatternDetector;
use crate::risk::{AdjustDirection, AdjustmentLedger};
use crate::store::CandidateStore;
use crate::indicators::{BollingerBands, Macd, Rsi};
use crate::types::{
    Candidate, CandleStatus, EntryConditions, OhlcvSeries, PriceSnapshot, TradeSignal,
};

use super::EngineController;

/// Entry-path composite weights: pattern 0.40, technical 0.30,
/// position 0.20, risk 0.10, time 0.
const ENTRY_WEIGHTS: ComponentWeights = ComponentWeights {
    pattern: 0.40,
    technical: 0.30,
    position: 0.20,
    risk: 0.10,
    time: 0.0,
};

/// Exit-path composite weights: pattern-change 0.40, risk 0.30,
/// position 0.20, time 0.10.
const EXIT_WEIGHTS: ComponentWeights = ComponentWeights {
    pattern: 0.40,
    technical: 0.0,
    position: 0.20,
    risk: 0.30,
    time: 0.10,
};

#[derive(Debug, Clone, Copy)]
struct ComponentWeights {
    pattern: f64,
    technical: f64,
    position: f64,
    risk: f64,
    time: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ComponentScores {
    pub pattern: f64,
    pub technical: f64,
    pub position: f64,
    pub risk: f64,
    pub time: f64,
}

impl ComponentScores {
    fn weighted(&self, weights: &ComponentWeights) -> f64 {
        self.pattern * weights.pattern
            + self.technical * weights.technical
            + self.position * weights.position
            + self.risk * weights.risk
            + self.time * weights.time
    }
}

/// Re-scores every tracked candidate each orchestrator pass: watchers get
/// promoted or demoted around BUY_READY, entered positions get exit signals.
pub struct SignalEvaluator {
    feed: Arc<PriceFeed>,
    store: Arc<CandidateStore>,
    detector: Arc<PatternDetector>,
    controller: Arc<EngineController>,
    config: Arc<AppConfig>,
    adjustments: Mutex<AdjustmentLedger>,
}

impl SignalEvaluator {
    pub fn new(
        feed: Arc<PriceFeed>,
        store: Arc<CandidateStore>,
        detector: Arc<PatternDetector>,
        controller: Arc<EngineController>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            feed,
            store,
            detector,
            controller,
            config,
            adjustments: Mutex::new(AdjustmentLedger::new()),
        }
    }

    pub async fn reevaluate_all(&self) {
        let watchers = self
            .store
            .get_by_state(&[CandleStatus::Watching, CandleStatus::BuyReady])
            .await;
        let entered = self.store.get_by_state(&[CandleStatus::Entered]).await;

        self.run_batches(watchers, true).await;
        self.run_batches(entered, false).await;

        self.adjustments.lock().await.prune(Utc::now());
    }

    /// Bounded fan-out: at most `batch_size` symbols in flight, with a pause
    /// between batches to cap REST pressure.
    async fn run_batches(&self, candidates: Vec<Candidate>, entry_path: bool) {
        let batch_size = self.config.evaluator.batch_size.max(1);
        for batch in candidates.chunks(batch_size) {
            if self.controller.is_shutting_down() {
                return;
            }
            futures::future::join_all(batch.iter().map(|candidate| async {
                if entry_path {
                    self.evaluate_watcher(candidate.clone()).await;
                } else {
                    self.evaluate_entered(candidate.clone()).await;
                }
            }))
            .await;
            tokio::time::sleep(std::time::Duration::from_millis(
                self.config.evaluator.batch_pause_ms,
            ))
            .await;
        }
    }

    async fn evaluate_watcher(&self, mut candidate: Candidate) {
        let Some(snapshot) = self.refresh(&mut candidate).await else {
            return;
        };
        let Some(series) = self.fresh_series(&mut candidate).await else {
            return;
        };

        let closes = series.closes_chronological();
        let bullish = self.detector.detect(&series);
        let bearish = self.detector.detect_reversal_warnings(&series);

        let mut gates = evaluate_entry_gates(&snapshot, &closes, &self.config, now_time());
        let min_confidence = self.config.evaluator.min_pattern_confidence;
        let confident_pattern = candidate
            .primary_pattern()
            .map(|p| p.confidence >= min_confidence)
            .unwrap_or(false);
        if !confident_pattern {
            gates.overall_passed = false;
            gates.fail_reasons.push("pattern confidence below minimum".to_string());
        }

        let scores = ComponentScores {
            pattern: pattern_component(!bullish.is_empty(), !bearish.is_empty()),
            technical: technical_component(&closes),
            position: if gates.overall_passed { 80.0 } else { 30.0 },
            risk: risk_component(&candidate),
            time: session_time_component(now_time(), &self.config),
        };
        let total = scores.weighted(&ENTRY_WEIGHTS);

        let signal = if total >= self.config.evaluator.strong_buy_threshold {
            TradeSignal::StrongBuy
        } else if total >= self.config.evaluator.buy_threshold {
            TradeSignal::Buy
        } else {
            TradeSignal::Hold
        };

        let previous_status = candidate.status;
        candidate.trade_signal = signal;
        candidate.signal_strength = total.round() as i32;
        candidate.signal_updated_at = Utc::now();
        candidate.entry_conditions = gates;

        candidate.status = if signal.is_buy() && candidate.entry_conditions.overall_passed {
            CandleStatus::BuyReady
        } else {
            CandleStatus::Watching
        };

        if candidate.status != previous_status {
            info!(
                "{} {} -> {} (signal={} score={:.1})",
                candidate.stock_code, previous_status, candidate.status, signal, total
            );
        }
        self.store.update(candidate).await;
    }

    async fn evaluate_entered(&self, mut candidate: Candidate) {
        if candidate.final_exit_confirmed() {
            return;
        }
        if self.refresh(&mut candidate).await.is_none() {
            return;
        }
        let Some(series) = self.fresh_series(&mut candidate).await else {
            return;
        };

        // A bearish formation in the live series overrides everything.
        let reversals = self.detector.detect_reversal_warnings(&series);
        if !reversals.is_empty() {
            let kinds: Vec<&str> = reversals.iter().map(|p| p.kind.as_str()).collect();
            warn!(
                "{} reversal warning ({}), forcing strong sell",
                candidate.stock_code,
                kinds.join(",")
            );
            candidate.trade_signal = TradeSignal::StrongSell;
            candidate.signal_strength = 95;
            candidate.signal_updated_at = Utc::now();
            candidate
                .metadata
                .insert("exit_trigger".to_string(), "pattern_reversal".to_string());
            self.store.update(candidate).await;
            return;
        }

        let still_bullish = !self.detector.detect(&series).is_empty();
        let scores = ComponentScores {
            pattern: if still_bullish { 20.0 } else { 50.0 },
            technical: 0.0,
            position: if candidate.performance.entry_quantity == 0 { 90.0 } else { 50.0 },
            risk: risk_component(&candidate),
            time: holding_time_component(&candidate),
        };
        let total = scores.weighted(&EXIT_WEIGHTS);

        let signal = if total >= self.config.evaluator.strong_sell_threshold {
            TradeSignal::StrongSell
        } else if total >= self.config.evaluator.sell_threshold {
            TradeSignal::Sell
        } else {
            TradeSignal::Hold
        };

        candidate.trade_signal = signal;
        candidate.signal_strength = total.round() as i32;
        candidate.signal_updated_at = Utc::now();

        self.maybe_tighten_stop(&mut candidate).await;

        debug!(
            "{} exit score {:.1} -> {}",
            candidate.stock_code, total, signal
        );
        self.store.update(candidate).await;
    }

    /// Trailing adjustment: pulls the stop up behind a rising price. Pure
    /// stop tightening skips the anti-thrash ledger; target widening on very
    /// strong signals goes through it.
    async fn maybe_tighten_stop(&self, candidate: &mut Candidate) {
        let Some(max_seen) = candidate.performance.max_price_seen else {
            return;
        };
        let trailing_pct = candidate.risk_plan.trailing_stop_pct;
        if trailing_pct <= 0.0 {
            return;
        }
        let ratio = Decimal::try_from(1.0 - trailing_pct / 100.0).unwrap_or(Decimal::ONE);
        let trailed = (max_seen * ratio).round_dp(0);
        if trailed > candidate.risk_plan.stop_loss_price {
            debug!(
                "{} trailing stop {} -> {}",
                candidate.stock_code, candidate.risk_plan.stop_loss_price, trailed
            );
            candidate.risk_plan.stop_loss_price = trailed;
        }

        // Widen the target on sustained strength, rate-limited per symbol.
        if candidate.signal_strength >= 90 {
            let mut ledger = self.adjustments.lock().await;
            let now = Utc::now();
            if ledger.can_apply(&candidate.stock_code, AdjustDirection::Up, now) {
                let widened = (candidate.risk_plan.target_price * Decimal::new(101, 2)).round_dp(0);
                candidate.risk_plan.target_price = widened;
                ledger.record(&candidate.stock_code, AdjustDirection::Up, now);
            }
        }
    }

    async fn refresh(&self, candidate: &mut Candidate) -> Option<PriceSnapshot> {
        match self.feed.snapshot_price(&candidate.stock_code).await {
            Ok(snapshot) => {
                candidate.update_price(snapshot.current_price, Utc::now());
                Some(snapshot)
            }
            Err(e) => {
                debug!("{} snapshot failed, skipping this pass: {}", candidate.stock_code, e);
                None
            }
        }
    }

    async fn fresh_series(&self, candidate: &mut Candidate) -> Option<OhlcvSeries> {
        let today = crate::config::today_kst();
        if let Some(series) = candidate.fresh_ohlcv(today) {
            return Some(series.clone());
        }
        match self.feed.snapshot_ohlcv(&candidate.stock_code).await {
            Ok(bars) if !bars.is_empty() => {
                let series = OhlcvSeries::new(bars);
                candidate.cache_ohlcv(series.clone(), today);
                Some(series)
            }
            Ok(_) => None,
            Err(e) => {
                debug!("{} ohlcv refresh failed: {}", candidate.stock_code, e);
                None
            }
        }
    }
}

fn now_time() -> NaiveTime {
    crate::config::now_kst().time()
}

/// Pattern component: live bullish evidence scores 80, bearish 20,
/// nothing 50.
pub fn pattern_component(bullish: bool, bearish: bool) -> f64 {
    if bearish {
        20.0
    } else if bullish {
        80.0
    } else {
        50.0
    }
}

/// Technical component from RSI(14) / MACD(12,26,9): oversold with rising
/// MACD 85, oversold 70, overbought with falling MACD 15, overbought 30,
/// otherwise 50. Insufficient history is neutral.
pub fn technical_component(closes: &[Decimal]) -> f64 {
    let Some(rsi) = Rsi::of_series(closes, 14) else {
        return 50.0;
    };
    let macd_histogram = Macd::of_series(closes)
        .map(|m| m.histogram.to_f64().unwrap_or(0.0))
        .unwrap_or(0.0);

    if rsi < 30.0 {
        if macd_histogram > 0.0 {
            85.0
        } else {
            70.0
        }
    } else if rsi > 70.0 {
        if macd_histogram < 0.0 {
            15.0
        } else {
            30.0
        }
    } else {
        50.0
    }
}

/// Risk component against the plan: crossing the target or stop scores 90,
/// a profit cushion 60, a drawdown 40, otherwise 50.
pub fn risk_component(candidate: &Candidate) -> f64 {
    let price = candidate.current_price;
    let plan = &candidate.risk_plan;
    if plan.target_price > Decimal::ZERO && price >= plan.target_price {
        return 90.0;
    }
    if plan.stop_loss_price > Decimal::ZERO && price <= plan.stop_loss_price {
        return 90.0;
    }
    match candidate.performance.pnl_pct {
        Some(pnl) if pnl >= 2.0 => 60.0,
        Some(pnl) if pnl <= -2.0 => 40.0,
        _ => 50.0,
    }
}

/// Session-clock component: normal in-session 50, closing-hour caution 60,
/// outside the window 30.
pub fn session_time_component(now: NaiveTime, config: &AppConfig) -> f64 {
    let Some(start) = crate::config::parse_hhmm(&config.exit.trading_start) else {
        return 50.0;
    };
    let Some(end) = crate::config::parse_hhmm(&config.exit.trading_end) else {
        return 50.0;
    };
    if now < start || now > end {
        return 30.0;
    }
    let closing = end - chrono::Duration::hours(1);
    if now >= closing {
        60.0
    } else {
        50.0
    }
}

/// Holding-clock component for open positions: past 80% of the pattern's
/// window 80, past half 60, else 50.
pub fn holding_time_component(candidate: &Candidate) -> f64 {
    let Some(entry_time) = candidate.performance.entry_time else {
        return 50.0;
    };
    let max_hours = candidate.risk_plan.max_holding_hours;
    if max_hours <= 0 {
        return 50.0;
    }
    let held = crate::config::business_hours_between(entry_time, Utc::now());
    let limit = max_hours as f64;
    if held >= limit * 0.8 {
        80.0
    } else if held >= limit * 0.5 {
        60.0
    } else {
        50.0
    }
}

/// All entry gates: volume surge, RSI with MACD/Bollinger relaxation, the
/// session window, the price band, the size proxy, and daily traded value.
pub fn evaluate_entry_gates(
    snapshot: &PriceSnapshot,
    closes: &[Decimal],
    config: &AppConfig,
    now: NaiveTime,
) -> EntryConditions {
    let mut gates = EntryConditions::default();

    let volume_ratio = if snapshot.average_volume > 0 {
        snapshot.accumulated_volume as f64 / snapshot.average_volume as f64
    } else {
        1.0
    };
    gates.volume_check = volume_ratio >= config.evaluator.min_volume_ratio;
    if !gates.volume_check {
        gates.fail_reasons.push(format!("volume ratio {:.1}x too low", volume_ratio));
    }

    gates.rsi_check = match Rsi::of_series(closes, 14) {
        Some(rsi) if rsi >= config.evaluator.rsi_overbought => {
            let macd_up = Macd::of_series(closes).map(|m| m.is_turning_up()).unwrap_or(false);
            let near_lower_band = BollingerBands::of_series(closes)
                .map(|bb| bb.position(snapshot.current_price) <= 0.2)
                .unwrap_or(false);
            if macd_up && rsi < 75.0 {
                true
            } else if near_lower_band && rsi < 70.0 {
                true
            } else {
                gates.fail_reasons.push(format!("rsi overbought ({:.1})", rsi));
                false
            }
        }
        _ => true,
    };

    let (Some(start), Some(end)) = (
        crate::config::parse_hhmm(&config.exit.trading_start),
        crate::config::parse_hhmm(&config.exit.trading_end),
    ) else {
        gates.time_check = false;
        gates.finalize();
        return gates;
    };
    gates.time_check = now >= start && now <= end;
    if !gates.time_check {
        gates.fail_reasons.push("outside trading window".to_string());
    }

    let price = snapshot.current_price;
    gates.price_check = price >= Decimal::from(config.scanner.min_price)
        && price <= Decimal::from(config.scanner.max_price);
    if !gates.price_check {
        gates.fail_reasons.push(format!("price {} out of band", price));
    }

    // Rough size proxy: sub-5000 KRW names are treated as too small.
    gates.market_cap_check = price >= Decimal::from(5_000);
    if !gates.market_cap_check {
        gates.fail_reasons.push("price below size floor".to_string());
    }

    let daily_value = Decimal::from(snapshot.accumulated_volume) * price;
    gates.daily_volume_check = daily_value >= Decimal::from(config.evaluator.min_daily_volume_krw);
    if !gates.daily_volume_check {
        gates.fail_reasons.push("daily traded value too small".to_string());
    }

    gates.finalize();
    gates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketType;
    use rust_decimal_macros::dec;

    fn snapshot(price: i64, acc_volume: u64, avg_volume: u64) -> PriceSnapshot {
        PriceSnapshot {
            stock_code: "005930".to_string(),
            stock_name: "Samsung Electronics".to_string(),
            current_price: Decimal::from(price),
            open: Decimal::from(price),
            high: Decimal::from(price),
            low: Decimal::from(price),
            prev_close: Decimal::from(price),
            accumulated_volume: acc_volume,
            average_volume: avg_volume,
            day_change_pct: 1.0,
        }
    }

    fn in_session() -> NaiveTime {
        NaiveTime::from_hms_opt(10, 0, 0).unwrap()
    }

    fn candidate() -> Candidate {
        Candidate::new("005930", "Samsung Electronics", MarketType::Kospi, dec!(70000))
    }

    #[test]
    fn entry_gates_pass_on_healthy_inputs() {
        let config = AppConfig::default();
        // Enough falling closes to keep RSI out of overbought.
        let closes: Vec<Decimal> = (0..30).map(|i| Decimal::from(72_000 - i * 50)).collect();
        let gates = evaluate_entry_gates(&snapshot(70_000, 300_000, 100_000), &closes, &config, in_session());
        assert!(gates.volume_check);
        assert!(gates.rsi_check);
        assert!(gates.time_check);
        assert!(gates.price_check);
        assert!(gates.market_cap_check);
        assert!(gates.daily_volume_check);
        assert!(gates.overall_passed, "fails: {:?}", gates.fail_reasons);
    }

    #[test]
    fn weak_volume_fails_gate() {
        let config = AppConfig::default();
        let closes: Vec<Decimal> = (0..30).map(|i| Decimal::from(72_000 - i * 50)).collect();
        let gates = evaluate_entry_gates(&snapshot(70_000, 50_000, 100_000), &closes, &config, in_session());
        assert!(!gates.volume_check);
        assert!(!gates.overall_passed);
    }

    #[test]
    fn out_of_session_fails_gate() {
        let config = AppConfig::default();
        let closes: Vec<Decimal> = (0..30).map(|i| Decimal::from(72_000 - i * 50)).collect();
        let late = NaiveTime::from_hms_opt(16, 0, 0).unwrap();
        let gates = evaluate_entry_gates(&snapshot(70_000, 300_000, 100_000), &closes, &config, late);
        assert!(!gates.time_check);
        assert!(!gates.overall_passed);
    }

    #[test]
    fn overbought_rsi_fails_without_relaxation() {
        let config = AppConfig::default();
        // Monotonic rise pins RSI at 100 and keeps MACD positive, so the
        // MACD relaxation does not apply above 75.
        let closes: Vec<Decimal> = (0..60).map(|i| Decimal::from(50_000 + i * 500)).collect();
        let gates = evaluate_entry_gates(&snapshot(80_000, 300_000, 100_000), &closes, &config, in_session());
        assert!(!gates.rsi_check);
    }

    #[test]
    fn low_price_fails_size_floor() {
        let config = AppConfig::default();
        let closes: Vec<Decimal> = (0..30).map(|i| Decimal::from(4_500 - i)).collect();
        let gates = evaluate_entry_gates(&snapshot(4_000, 300_000, 100_000), &closes, &config, in_session());
        assert!(gates.price_check, "4000 is inside the tradable band");
        assert!(!gates.market_cap_check);
        assert!(!gates.overall_passed);
    }

    #[test]
    fn session_clock_component_tiers() {
        let config = AppConfig::default();
        assert_eq!(session_time_component(NaiveTime::from_hms_opt(10, 0, 0).unwrap(), &config), 50.0);
        assert_eq!(session_time_component(NaiveTime::from_hms_opt(14, 30, 0).unwrap(), &config), 60.0);
        assert_eq!(session_time_component(NaiveTime::from_hms_opt(8, 0, 0).unwrap(), &config), 30.0);
        assert_eq!(session_time_component(NaiveTime::from_hms_opt(15, 30, 0).unwrap(), &config), 30.0);
    }

    #[test]
    fn risk_component_tiers() {
        let mut c = candidate();
        c.risk_plan.target_price = dec!(71000);
        c.risk_plan.stop_loss_price = dec!(69000);

        c.current_price = dec!(71500);
        assert_eq!(risk_component(&c), 90.0);

        c.current_price = dec!(68500);
        assert_eq!(risk_component(&c), 90.0);

        c.current_price = dec!(70000);
        c.performance.pnl_pct = Some(3.0);
        assert_eq!(risk_component(&c), 60.0);
        c.performance.pnl_pct = Some(-3.0);
        assert_eq!(risk_component(&c), 40.0);
        c.performance.pnl_pct = Some(0.5);
        assert_eq!(risk_component(&c), 50.0);
    }

    #[test]
    fn pattern_component_table() {
        assert_eq!(pattern_component(true, false), 80.0);
        assert_eq!(pattern_component(false, true), 20.0);
        assert_eq!(pattern_component(true, true), 20.0);
        assert_eq!(pattern_component(false, false), 50.0);
    }

    #[test]
    fn technical_component_neutral_without_history() {
        assert_eq!(technical_component(&[]), 50.0);
        let falling: Vec<Decimal> = (0..40).map(|i| Decimal::from(50_000 - i * 400)).collect();
        // Hard fall drives RSI oversold; MACD histogram is negative, so 70.
        assert_eq!(technical_component(&falling), 70.0);
    }
}
