use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::broker::{BrokerGateway, ChartPeriod};
use crate::config::ScannerSettings;
use crate::database::TradeRecorder;
use crate::feed::{PriceFeed, TickCallback};
use crate::patterns::PatternDetector;
use crate::risk::{MarketCondition, RiskPolicy};
use crate::store::CandidateStore;
use crate::types::{
    Candidate, CandleStatus, MarketType, OhlcvSeries, PatternInfo, PriceSnapshot, PriceTick,
    TradeSignal,
};

use super::EngineController;

/// Periodic producer: ranks the market, runs pattern detection, and seeds
/// the candidate store. Never trades.
pub struct MarketScanner {
    gateway: Arc<dyn BrokerGateway>,
    feed: Arc<PriceFeed>,
    store: Arc<CandidateStore>,
    detector: Arc<PatternDetector>,
    policy: Arc<RiskPolicy>,
    recorder: Option<Arc<TradeRecorder>>,
    condition: Arc<RwLock<MarketCondition>>,
    controller: Arc<EngineController>,
    settings: ScannerSettings,
}

impl MarketScanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        feed: Arc<PriceFeed>,
        store: Arc<CandidateStore>,
        detector: Arc<PatternDetector>,
        policy: Arc<RiskPolicy>,
        recorder: Option<Arc<TradeRecorder>>,
        condition: Arc<RwLock<MarketCondition>>,
        controller: Arc<EngineController>,
        settings: ScannerSettings,
    ) -> Self {
        Self {
            gateway,
            feed,
            store,
            detector,
            policy,
            recorder,
            condition,
            controller,
            settings,
        }
    }

    /// One scan pass over both markets. Returns how many candidates were
    /// seeded.
    pub async fn tick(&self) -> usize {
        let mut targets: Vec<(String, MarketType)> = Vec::new();
        for market in MarketType::all() {
            if self.controller.is_shutting_down() {
                return 0;
            }
            match self
                .gateway
                .fluctuation_rank(market, self.settings.min_fluctuation_rate)
                .await
            {
                Ok(ranked) => targets.extend(
                    ranked
                        .into_iter()
                        .take(50)
                        .map(|r| (r.stock_code, market)),
                ),
                Err(e) => warn!("{} fluctuation rank failed: {}", market, e),
            }
            match self.gateway.volume_rank(market).await {
                Ok(ranked) => targets.extend(
                    ranked
                        .into_iter()
                        .take(50)
                        .map(|r| (r.stock_code, market)),
                ),
                Err(e) => warn!("{} volume rank failed: {}", market, e),
            }
            // Names stretched far under their 20-day mean are where reversal
            // formations show up; third-ranked source, smaller slice.
            match self.gateway.disparity_rank(market, 20).await {
                Ok(ranked) => targets.extend(
                    ranked
                        .into_iter()
                        .take(20)
                        .map(|r| (r.stock_code, market)),
                ),
                Err(e) => warn!("{} disparity rank failed: {}", market, e),
            }
        }

        // Dedup preserving rank order, cap the sweep.
        let mut seen = std::collections::HashSet::new();
        targets.retain(|(code, _)| seen.insert(code.clone()));
        targets.truncate(self.settings.max_scan_stocks);

        if targets.is_empty() {
            debug!("scan pass found no ranked symbols");
            return 0;
        }

        let mut seeded = 0;
        for batch in targets.chunks(self.settings.batch_size.max(1)) {
            if self.controller.is_shutting_down() {
                break;
            }
            let results = futures::future::join_all(
                batch
                    .iter()
                    .map(|(code, market)| self.analyze_symbol(code, *market)),
            )
            .await;
            seeded += results.into_iter().filter(|seeded| *seeded).count();
            tokio::time::sleep(std::time::Duration::from_millis(self.settings.batch_pause_ms)).await;
        }

        if seeded > 0 {
            info!("scan pass seeded {} candidates", seeded);
        }
        seeded
    }

    /// Full pipeline for one symbol; any missing data skips the symbol with
    /// no state change.
    async fn analyze_symbol(&self, code: &str, market: MarketType) -> bool {
        if self.store.contains(code).await {
            // Already tracked; the evaluator refreshes live candidates.
            return false;
        }

        let snapshot = match self.feed.snapshot_price(code).await {
            Ok(s) => s,
            Err(e) => {
                debug!("{} price snapshot failed: {}", code, e);
                return false;
            }
        };
        if !passes_basic_filters(&snapshot, &self.settings) {
            return false;
        }

        let bars = match self.gateway.daily_chart(code, ChartPeriod::Day, true).await {
            Ok(bars) if !bars.is_empty() => bars,
            Ok(_) => return false,
            Err(e) => {
                debug!("{} daily chart failed: {}", code, e);
                return false;
            }
        };
        let series = OhlcvSeries::new(bars);

        let patterns = self.detector.detect(&series);
        if patterns.is_empty() {
            return false;
        }

        let mut candidate = Candidate::new(code, &snapshot.stock_name, market, snapshot.current_price);
        candidate.metadata.insert("entry_source".to_string(), "scanner".to_string());
        candidate
            .metadata
            .insert("day_change_pct".to_string(), snapshot.day_change_pct.to_string());
        for pattern in &patterns {
            candidate.add_pattern(pattern.clone());
        }
        candidate.cache_ohlcv(series, crate::config::today_kst());

        let (signal, strength) = signal_from_patterns(&patterns);
        candidate.trade_signal = signal;
        candidate.signal_strength = strength;
        candidate.signal_updated_at = chrono::Utc::now();
        candidate.status = if signal == TradeSignal::StrongBuy {
            CandleStatus::BuyReady
        } else {
            CandleStatus::Watching
        };
        candidate.entry_priority = entry_priority(&candidate);

        let condition = *self.condition.read().await;
        candidate.risk_plan = self.policy.derive(&candidate, &condition);

        if let Some(recorder) = &self.recorder {
            match recorder.record_candle_candidate(&candidate).await {
                Ok(id) => {
                    candidate.metadata.insert("db_id".to_string(), id.to_string());
                }
                Err(e) => warn!("{} candidate record failed: {}", code, e),
            }
            for pattern in &patterns {
                if let Err(e) = recorder.record_candle_pattern(code, pattern).await {
                    warn!("{} pattern record failed: {}", code, e);
                }
            }
        }

        let primary = candidate.primary_pattern().map(|p| p.kind);
        if !self.store.add(candidate).await {
            return false;
        }

        if let Err(e) = self
            .feed
            .subscribe(code, store_tick_callback(Arc::clone(&self.store)))
            .await
        {
            // Losing the stream slot is fine; the symbol stays on pull.
            debug!("{} stream subscription unavailable: {}", code, e);
        }

        info!(
            "seeded {} ({:?}) signal={} strength={}",
            code, primary, signal, strength
        );
        true
    }

}

/// Pushed ticks land in the store asynchronously so entered positions track
/// live prices between orchestrator passes.
pub fn store_tick_callback(store: Arc<CandidateStore>) -> TickCallback {
    Arc::new(move |tick: &PriceTick| {
        let store = Arc::clone(&store);
        let tick = tick.clone();
        tokio::spawn(async move {
            if let Some(mut candidate) = store.get(&tick.stock_code).await {
                candidate.update_price(tick.price, tick.received_at);
                store.update(candidate).await;
            }
        });
    })
}

/// Price-band and liquidity screen applied before any pattern work.
pub fn passes_basic_filters(snapshot: &PriceSnapshot, settings: &ScannerSettings) -> bool {
    let price = snapshot.current_price;
    if price < rust_decimal::Decimal::from(settings.min_price)
        || price > rust_decimal::Decimal::from(settings.max_price)
    {
        return false;
    }
    snapshot.accumulated_volume >= settings.min_volume
}

/// Maps detected patterns to the discrete signal: confident strong bullish
/// formations buy outright, confident bearish mirrors sell.
pub fn signal_from_patterns(patterns: &[PatternInfo]) -> (TradeSignal, i32) {
    let Some(primary) = patterns.iter().max_by_key(|p| p.strength) else {
        return (TradeSignal::Hold, 0);
    };

    if primary.kind.is_bullish() {
        if primary.confidence >= 0.85 && primary.strength >= 90 {
            (TradeSignal::StrongBuy, primary.strength)
        } else if primary.confidence >= 0.70 {
            (TradeSignal::Buy, primary.strength)
        } else {
            (TradeSignal::Hold, primary.strength)
        }
    } else if primary.kind.is_bearish() {
        if primary.confidence >= 0.85 {
            (TradeSignal::StrongSell, primary.strength)
        } else {
            (TradeSignal::Sell, primary.strength)
        }
    } else {
        (TradeSignal::Hold, primary.strength)
    }
}

/// Entry priority 0..=100: signal strength, pattern score, confidence, and
/// a per-formation weight.
pub fn entry_priority(candidate: &Candidate) -> i32 {
    let mut priority = candidate.signal_strength as f64 * 0.3;
    priority += candidate.pattern_score as f64 * 0.3;
    if let Some(primary) = candidate.primary_pattern() {
        priority += primary.confidence * 100.0 * 0.2;
        priority += primary.kind.priority_weight() as f64;
    }
    (priority as i32).clamp(0, 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PatternKind;
    use chrono::Utc;
    use std::collections::HashMap;

    fn pattern(kind: PatternKind, confidence: f64, strength: i32) -> PatternInfo {
        PatternInfo {
            kind,
            confidence,
            strength,
            description: String::new(),
            target_ratio: 1.02,
            stop_ratio: 0.98,
            max_holding_hours: 24,
            detected_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn strong_confident_pattern_maps_to_strong_buy() {
        let patterns = vec![pattern(PatternKind::MorningStar, 0.9, 92)];
        assert_eq!(signal_from_patterns(&patterns), (TradeSignal::StrongBuy, 92));
    }

    #[test]
    fn confident_pattern_maps_to_buy() {
        let patterns = vec![pattern(PatternKind::Hammer, 0.75, 80)];
        assert_eq!(signal_from_patterns(&patterns), (TradeSignal::Buy, 80));
    }

    #[test]
    fn weak_confidence_holds() {
        let patterns = vec![pattern(PatternKind::Hammer, 0.6, 85)];
        assert_eq!(signal_from_patterns(&patterns).0, TradeSignal::Hold);
        assert_eq!(signal_from_patterns(&[]).0, TradeSignal::Hold);
    }

    #[test]
    fn bearish_mirror_maps_to_sell_side() {
        let patterns = vec![pattern(PatternKind::BearishEngulfing, 0.9, 88)];
        assert_eq!(signal_from_patterns(&patterns).0, TradeSignal::StrongSell);
        let weaker = vec![pattern(PatternKind::EveningStar, 0.7, 75)];
        assert_eq!(signal_from_patterns(&weaker).0, TradeSignal::Sell);
    }

    #[test]
    fn detected_hammer_yields_buy_signal() {
        use crate::patterns::{PatternConfig, PatternDetector};
        use crate::types::{DailyBar, OhlcvSeries};
        use rust_decimal::Decimal;

        let bar = |day: u32, o: i64, h: i64, l: i64, c: i64| DailyBar {
            date: chrono::NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            open: Decimal::from(o),
            high: Decimal::from(h),
            low: Decimal::from(l),
            close: Decimal::from(c),
            volume: 100_000,
        };
        let series = OhlcvSeries::new(vec![
            bar(6, 10_000, 10_100, 9_200, 10_050),
            bar(5, 10_800, 10_850, 10_000, 10_100),
            bar(4, 11_200, 11_250, 10_700, 10_800),
        ]);
        let detector = PatternDetector::new(PatternConfig::builtin());
        let patterns = detector.detect(&series);
        let (signal, strength) = signal_from_patterns(&patterns);
        assert_eq!(signal, TradeSignal::Buy);
        assert!(strength >= 80);
    }

    #[test]
    fn basic_filters_screen_price_band_and_liquidity() {
        let settings = ScannerSettings::default();
        let snap = |price: i64, volume: u64| PriceSnapshot {
            stock_code: "000001".to_string(),
            stock_name: String::new(),
            current_price: rust_decimal::Decimal::from(price),
            open: rust_decimal::Decimal::from(price),
            high: rust_decimal::Decimal::from(price),
            low: rust_decimal::Decimal::from(price),
            prev_close: rust_decimal::Decimal::from(price),
            accumulated_volume: volume,
            average_volume: volume,
            day_change_pct: 0.0,
        };
        assert!(passes_basic_filters(&snap(10_000, 50_000), &settings));
        // A 500 KRW name never becomes a candidate.
        assert!(!passes_basic_filters(&snap(500, 50_000), &settings));
        assert!(!passes_basic_filters(&snap(600_000, 50_000), &settings));
        assert!(!passes_basic_filters(&snap(10_000, 5_000), &settings));
    }

    #[test]
    fn priority_blends_strength_score_and_kind() {
        let mut c = Candidate::new("005930", "x", MarketType::Kospi, rust_decimal_macros::dec!(10000));
        c.add_pattern(pattern(PatternKind::MorningStar, 0.8, 90));
        c.signal_strength = 90;
        // 0.3*90 + 0.3*90 + 0.2*80 + 20 = 90
        assert_eq!(entry_priority(&c), 90);

        let mut weak = Candidate::new("000001", "y", MarketType::Kosdaq, rust_decimal_macros::dec!(5000));
        weak.add_pattern(pattern(PatternKind::Doji, 0.5, 40));
        weak.signal_strength = 20;
        assert!(entry_priority(&weak) < entry_priority(&c));
    }
}
