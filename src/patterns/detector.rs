use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;

use crate::types::{DailyBar, OhlcvSeries, PatternInfo, PatternKind};

use super::{PatternConfig, PatternTarget};

const DOWNTREND_MIN: f64 = 0.015;
const STAR_TREND_MIN: f64 = 0.005;

const HAMMER_LOWER_SHADOW_MIN: f64 = 0.45;
const HAMMER_BODY_MAX: f64 = 0.40;
const HAMMER_UPPER_SHADOW_MAX: f64 = 0.15;
const HAMMER_CLOSE_POSITION_MIN: f64 = 0.30;

const ENGULFING_SIZE_MIN: f64 = 0.85;
const PIERCING_PENETRATION_MIN: f64 = 0.35;
const STAR_MIDDLE_BODY_MAX: f64 = 0.6;
const STAR_THIRD_BODY_MIN: f64 = 0.15;

const MIN_CONFIDENCE: f64 = 0.55;
const FALLBACK_CONFIDENCE: f64 = 0.5;
const MAX_PATTERNS: usize = 2;

/// Detects bullish reversal formations on a most-recent-first daily series.
///
/// Detection itself is pure: the same bars always yield the same patterns.
/// Target/stop ratios attached to each hit come from the pattern config,
/// which is read lazily with its own cache.
pub struct PatternDetector {
    config: PatternConfig,
}

impl PatternDetector {
    pub fn new(config: PatternConfig) -> Self {
        Self { config }
    }

    /// Bullish reversal patterns after a downtrend, filtered and ranked.
    pub fn detect(&self, series: &OhlcvSeries) -> Vec<PatternInfo> {
        let bars = series.bars();
        if bars.len() < 2 {
            return Vec::new();
        }

        let mut found = Vec::new();
        if let Some(p) = self.detect_hammer(bars) {
            found.push(p);
        }
        if let Some(p) = self.detect_bullish_engulfing(bars) {
            found.push(p);
        }
        if let Some(p) = self.detect_piercing_line(bars) {
            found.push(p);
        }
        if bars.len() >= 3 {
            if let Some(p) = self.detect_morning_star(bars) {
                found.push(p);
            }
        }

        filter_and_rank(found)
    }

    /// Bearish mirrors, consulted by the exit path as reversal warnings.
    pub fn detect_reversal_warnings(&self, series: &OhlcvSeries) -> Vec<PatternInfo> {
        let bars = series.bars();
        if bars.len() < 2 {
            return Vec::new();
        }

        let mut found = Vec::new();
        if let Some(p) = self.detect_bearish_engulfing(bars) {
            found.push(p);
        }
        if bars.len() >= 3 {
            if let Some(p) = self.detect_evening_star(bars) {
                found.push(p);
            }
        }
        filter_and_rank(found)
    }

    fn detect_hammer(&self, bars: &[DailyBar]) -> Option<PatternInfo> {
        let today = &bars[0];
        if today.range() <= rust_decimal::Decimal::ZERO {
            return None;
        }

        let lower = today.lower_shadow_ratio();
        let upper = today.upper_shadow_ratio();
        let body = today.body_ratio();

        if lower < HAMMER_LOWER_SHADOW_MIN || body > HAMMER_BODY_MAX || upper > HAMMER_UPPER_SHADOW_MAX {
            return None;
        }

        let downtrend = downtrend_score(bars, 0, 3);
        if downtrend < DOWNTREND_MIN || today.close_position() < HAMMER_CLOSE_POSITION_MIN {
            return None;
        }

        let confidence = (0.6 + lower * 0.3 + downtrend * 0.1).min(0.9);
        let strength = ((60.0 + lower * 25.0 + downtrend * 15.0) as i32).min(95);
        let mut metadata = HashMap::new();
        metadata.insert("lower_shadow_ratio".to_string(), lower);
        metadata.insert("body_ratio".to_string(), body);
        metadata.insert("downtrend".to_string(), downtrend);
        metadata.insert("support_price".to_string(), today.low.to_f64().unwrap_or(0.0));

        Some(self.build(
            PatternKind::Hammer,
            confidence,
            strength,
            format!("hammer: lower shadow {:.0}%, downtrend {:.1}%", lower * 100.0, downtrend * 100.0),
            metadata,
        ))
    }

    fn detect_bullish_engulfing(&self, bars: &[DailyBar]) -> Option<PatternInfo> {
        let today = &bars[0];
        let prior = bars.get(1)?;

        if !prior.is_bearish() || !today.is_bullish() {
            return None;
        }

        let prior_body = prior.body().to_f64().unwrap_or(0.0);
        let today_body = today.body().to_f64().unwrap_or(0.0);
        let size_ratio = if prior_body > 0.0 { today_body / prior_body } else { 1.0 };

        let engulfs_open = today.open <= prior.open * rust_decimal_macros::dec!(1.01);
        let engulfs_close = today.close >= prior.close * rust_decimal_macros::dec!(0.99);
        if size_ratio < ENGULFING_SIZE_MIN || !engulfs_open || !engulfs_close {
            return None;
        }

        let downtrend = downtrend_score(bars, 1, 3);
        if downtrend < DOWNTREND_MIN {
            return None;
        }

        let confidence = (0.65 + size_ratio * 0.15 + downtrend * 0.1).min(0.9);
        let strength = ((65.0 + size_ratio * 20.0 + downtrend * 15.0) as i32).min(95);
        let mut metadata = HashMap::new();
        metadata.insert("size_ratio".to_string(), size_ratio);
        metadata.insert("downtrend".to_string(), downtrend);
        metadata.insert("support_price".to_string(), today.low.to_f64().unwrap_or(0.0));

        Some(self.build(
            PatternKind::BullishEngulfing,
            confidence,
            strength,
            format!("bullish engulfing: size x{:.2}, downtrend {:.1}%", size_ratio, downtrend * 100.0),
            metadata,
        ))
    }

    fn detect_piercing_line(&self, bars: &[DailyBar]) -> Option<PatternInfo> {
        let today = &bars[0];
        let prior = bars.get(1)?;

        if !prior.is_bearish() || !today.is_bullish() {
            return None;
        }

        let prior_body = (prior.open - prior.close).to_f64().unwrap_or(0.0);
        if prior_body <= 0.0 {
            return None;
        }
        let penetration = (today.close - prior.close).to_f64().unwrap_or(0.0) / prior_body;
        let gap_down = today.open <= prior.close;
        if penetration < PIERCING_PENETRATION_MIN || !gap_down {
            return None;
        }

        let downtrend = downtrend_score(bars, 1, 3);
        if downtrend < DOWNTREND_MIN {
            return None;
        }

        let confidence = (0.65 + penetration * 0.2 + downtrend * 0.1).min(0.9);
        let strength = ((65.0 + penetration * 25.0 + downtrend * 10.0) as i32).min(95);
        let mut metadata = HashMap::new();
        metadata.insert("penetration_ratio".to_string(), penetration);
        metadata.insert("downtrend".to_string(), downtrend);
        metadata.insert("support_price".to_string(), today.low.to_f64().unwrap_or(0.0));

        Some(self.build(
            PatternKind::PiercingLine,
            confidence,
            strength,
            format!("piercing line: penetration {:.0}%, downtrend {:.1}%", penetration * 100.0, downtrend * 100.0),
            metadata,
        ))
    }

    fn detect_morning_star(&self, bars: &[DailyBar]) -> Option<PatternInfo> {
        let third = &bars[0];
        let middle = bars.get(1)?;
        let first = bars.get(2)?;

        if !first.is_bearish() || !third.is_bullish() {
            return None;
        }
        if middle.body_ratio() > STAR_MIDDLE_BODY_MAX {
            return None;
        }

        let downtrend = downtrend_score(bars, 2, 5);
        if downtrend < STAR_TREND_MIN {
            return None;
        }

        let bullish_strength = third.body_ratio();
        if bullish_strength < STAR_THIRD_BODY_MIN {
            return None;
        }

        let confidence = (0.7 + bullish_strength * 0.15 + downtrend * 0.1).min(0.95);
        let strength = ((70.0 + bullish_strength * 20.0 + downtrend * 10.0) as i32).min(95);
        let mut metadata = HashMap::new();
        metadata.insert("middle_body_ratio".to_string(), middle.body_ratio());
        metadata.insert("bullish_strength".to_string(), bullish_strength);
        metadata.insert("downtrend".to_string(), downtrend);
        metadata.insert("support_price".to_string(), middle.low.to_f64().unwrap_or(0.0));

        Some(self.build(
            PatternKind::MorningStar,
            confidence,
            strength,
            format!(
                "morning star: middle body {:.0}%, third body {:.0}%",
                middle.body_ratio() * 100.0,
                bullish_strength * 100.0
            ),
            metadata,
        ))
    }

    fn detect_bearish_engulfing(&self, bars: &[DailyBar]) -> Option<PatternInfo> {
        let today = &bars[0];
        let prior = bars.get(1)?;

        if !prior.is_bullish() || !today.is_bearish() {
            return None;
        }

        let prior_body = prior.body().to_f64().unwrap_or(0.0);
        let today_body = today.body().to_f64().unwrap_or(0.0);
        let size_ratio = if prior_body > 0.0 { today_body / prior_body } else { 1.0 };

        let engulfs_open = today.open >= prior.open * rust_decimal_macros::dec!(0.99);
        let engulfs_close = today.close <= prior.close * rust_decimal_macros::dec!(1.01);
        if size_ratio < ENGULFING_SIZE_MIN || !engulfs_open || !engulfs_close {
            return None;
        }

        let uptrend = uptrend_score(bars, 1, 3);
        if uptrend < DOWNTREND_MIN {
            return None;
        }

        let confidence = (0.65 + size_ratio * 0.15 + uptrend * 0.1).min(0.9);
        let strength = ((65.0 + size_ratio * 20.0 + uptrend * 15.0) as i32).min(95);
        let mut metadata = HashMap::new();
        metadata.insert("size_ratio".to_string(), size_ratio);
        metadata.insert("uptrend".to_string(), uptrend);

        Some(self.build(
            PatternKind::BearishEngulfing,
            confidence,
            strength,
            format!("bearish engulfing: size x{:.2}, uptrend {:.1}%", size_ratio, uptrend * 100.0),
            metadata,
        ))
    }

    fn detect_evening_star(&self, bars: &[DailyBar]) -> Option<PatternInfo> {
        let third = &bars[0];
        let middle = bars.get(1)?;
        let first = bars.get(2)?;

        if !first.is_bullish() || !third.is_bearish() {
            return None;
        }
        if middle.body_ratio() > STAR_MIDDLE_BODY_MAX {
            return None;
        }

        let uptrend = uptrend_score(bars, 2, 5);
        if uptrend < STAR_TREND_MIN {
            return None;
        }

        let bearish_strength = third.body_ratio();
        if bearish_strength < STAR_THIRD_BODY_MIN {
            return None;
        }

        let confidence = (0.7 + bearish_strength * 0.15 + uptrend * 0.1).min(0.95);
        let strength = ((70.0 + bearish_strength * 20.0 + uptrend * 10.0) as i32).min(95);
        let mut metadata = HashMap::new();
        metadata.insert("middle_body_ratio".to_string(), middle.body_ratio());
        metadata.insert("bearish_strength".to_string(), bearish_strength);
        metadata.insert("uptrend".to_string(), uptrend);

        Some(self.build(
            PatternKind::EveningStar,
            confidence,
            strength,
            format!("evening star: third body {:.0}%", bearish_strength * 100.0),
            metadata,
        ))
    }

    fn build(
        &self,
        kind: PatternKind,
        confidence: f64,
        strength: i32,
        description: String,
        metadata: HashMap<String, f64>,
    ) -> PatternInfo {
        let PatternTarget {
            target,
            stop,
            max_hours,
            ..
        } = self.config.target_for(kind);
        PatternInfo {
            kind,
            confidence,
            strength,
            description,
            target_ratio: 1.0 + target / 100.0,
            stop_ratio: 1.0 - stop / 100.0,
            max_holding_hours: max_hours,
            detected_at: Utc::now(),
            metadata,
        }
    }
}

/// Weighted downtrend score in [0, 1] over `days` closes starting at
/// `start` (most-recent-first indexing): 0.4 x regression slope (normalized
/// by the newest close), 0.4 x start-to-end simple decline, 0.2 x fraction
/// of down days. Windows clamp to the available bars; under two closes
/// scores zero.
pub fn downtrend_score(bars: &[DailyBar], start: usize, days: usize) -> f64 {
    trend_window(bars, start, days).map_or(0.0, |closes| blend_trend(&closes, true))
}

/// Mirror of `downtrend_score` for rising series.
pub fn uptrend_score(bars: &[DailyBar], start: usize, days: usize) -> f64 {
    trend_window(bars, start, days).map_or(0.0, |closes| blend_trend(&closes, false))
}

/// Closes in chronological order (oldest first) for the requested window.
fn trend_window(bars: &[DailyBar], start: usize, days: usize) -> Option<Vec<f64>> {
    let mut days = days;
    if start + days >= bars.len() {
        let available = bars.len().saturating_sub(start + 1);
        if available < 2 {
            return None;
        }
        days = available;
    }
    let closes: Vec<f64> = bars[start..start + days]
        .iter()
        .rev()
        .map(|b| b.close.to_f64().unwrap_or(0.0))
        .collect();
    if closes.len() < 2 || closes.iter().any(|c| *c <= 0.0) {
        return None;
    }
    Some(closes)
}

fn blend_trend(closes: &[f64], falling: bool) -> f64 {
    let n = closes.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = closes.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var = 0.0;
    for (i, y) in closes.iter().enumerate() {
        let dx = i as f64 - mean_x;
        cov += dx * (y - mean_y);
        var += dx * dx;
    }
    let slope = if var > 0.0 { cov / var } else { 0.0 };

    let oldest = closes[0];
    let newest = closes[closes.len() - 1];

    let (linear, simple, moves) = if falling {
        let linear = if slope < 0.0 { (slope.abs() / oldest).min(1.0) } else { 0.0 };
        let simple = ((oldest - newest) / oldest).max(0.0);
        let moves = closes.windows(2).filter(|w| w[1] < w[0]).count();
        (linear, simple, moves)
    } else {
        let linear = if slope > 0.0 { (slope / oldest).min(1.0) } else { 0.0 };
        let simple = ((newest - oldest) / oldest).max(0.0);
        let moves = closes.windows(2).filter(|w| w[1] > w[0]).count();
        (linear, simple, moves)
    };
    let move_ratio = moves as f64 / (closes.len() - 1) as f64;

    (linear * 0.4 + simple * 0.4 + move_ratio * 0.2).min(1.0)
}

/// Keep confident hits (>= 0.55), or the single best hit if it still clears
/// 0.5; rank by confidence then strength; cap at two entries.
fn filter_and_rank(mut patterns: Vec<PatternInfo>) -> Vec<PatternInfo> {
    if patterns.is_empty() {
        return patterns;
    }

    let mut filtered: Vec<PatternInfo> = patterns
        .iter()
        .filter(|p| p.confidence >= MIN_CONFIDENCE)
        .cloned()
        .collect();

    if filtered.is_empty() {
        patterns.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let best = patterns.remove(0);
        if best.confidence >= FALLBACK_CONFIDENCE {
            return vec![best];
        }
        return Vec::new();
    }

    filtered.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(b.strength.cmp(&a.strength))
    });
    filtered.truncate(MAX_PATTERNS);
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn bar(day: u32, open: i64, high: i64, low: i64, close: i64) -> DailyBar {
        DailyBar {
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            open: Decimal::from(open),
            high: Decimal::from(high),
            low: Decimal::from(low),
            close: Decimal::from(close),
            volume: 100_000,
        }
    }

    fn detector() -> PatternDetector {
        PatternDetector::new(PatternConfig::builtin())
    }

    /// Most-recent-first: a long-lower-shadow bar today after two down days.
    fn hammer_series() -> OhlcvSeries {
        OhlcvSeries::new(vec![
            bar(6, 10_000, 10_100, 9_200, 10_050),
            bar(5, 10_800, 10_850, 10_000, 10_100),
            bar(4, 11_200, 11_250, 10_700, 10_800),
        ])
    }

    #[test]
    fn hammer_after_downtrend_is_the_only_hit() {
        let patterns = detector().detect(&hammer_series());
        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert_eq!(p.kind, PatternKind::Hammer);
        assert!(p.confidence >= 0.6, "confidence {}", p.confidence);
        assert!(p.confidence <= 0.9);
        assert!(p.strength >= 80 && p.strength <= 95, "strength {}", p.strength);
        assert_eq!(p.target_ratio, 1.018);
        assert_eq!(p.stop_ratio, 0.985);
    }

    #[test]
    fn detection_is_deterministic() {
        let d = detector();
        let series = hammer_series();
        let a = d.detect(&series);
        let b = d.detect(&series);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.kind, y.kind);
            assert_eq!(x.confidence.to_bits(), y.confidence.to_bits());
            assert_eq!(x.strength, y.strength);
        }
    }

    #[test]
    fn fewer_than_two_bars_yields_nothing() {
        let d = detector();
        assert!(d.detect(&OhlcvSeries::default()).is_empty());
        assert!(d
            .detect(&OhlcvSeries::new(vec![bar(6, 10_000, 10_100, 9_200, 10_050)]))
            .is_empty());
    }

    #[test]
    fn flat_series_yields_nothing() {
        let series = OhlcvSeries::new(vec![
            bar(6, 10_000, 10_000, 10_000, 10_000),
            bar(5, 10_000, 10_000, 10_000, 10_000),
            bar(4, 10_000, 10_000, 10_000, 10_000),
        ]);
        assert!(detector().detect(&series).is_empty());
    }

    #[test]
    fn engulfing_recovery_ranks_at_most_two() {
        // Big bullish bar swallowing a bearish one, after a slide.
        let series = OhlcvSeries::new(vec![
            bar(7, 9_500, 10_250, 9_450, 10_200),
            bar(6, 10_150, 10_200, 9_500, 9_550),
            bar(5, 10_300, 10_400, 10_050, 10_100),
            bar(4, 10_600, 10_700, 10_400, 10_500),
        ]);
        let patterns = detector().detect(&series);
        assert!(!patterns.is_empty());
        assert!(patterns.len() <= 2);
        assert!(patterns.iter().any(|p| p.kind == PatternKind::BullishEngulfing));
        // Ranked by confidence, descending.
        for pair in patterns.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
    }

    #[test]
    fn morning_star_detected_on_three_bar_reversal() {
        let series = OhlcvSeries::new(vec![
            // Third bar: decisive bullish candle.
            bar(8, 9_650, 10_120, 9_630, 10_100),
            // Middle: small indecision body (bullish, so the two-bar
            // detectors stay quiet).
            bar(7, 9_660, 9_800, 9_580, 9_700),
            // First: long bearish candle after a slide.
            bar(6, 10_400, 10_450, 9_700, 9_750),
            bar(5, 10_600, 10_700, 10_350, 10_450),
            bar(4, 10_800, 10_900, 10_550, 10_650),
        ]);
        let patterns = detector().detect(&series);
        assert!(patterns.iter().any(|p| p.kind == PatternKind::MorningStar));
    }

    #[test]
    fn bearish_mirror_flags_reversal_after_rally() {
        // Mirror of the engulfing case: bearish bar swallowing a bullish one
        // after a rise.
        let series = OhlcvSeries::new(vec![
            bar(7, 10_150, 10_200, 9_450, 9_500),
            bar(6, 9_550, 10_200, 9_500, 10_150),
            bar(5, 9_300, 9_500, 9_200, 9_400),
            bar(4, 9_000, 9_300, 8_950, 9_200),
        ]);
        let warnings = detector().detect_reversal_warnings(&series);
        assert!(warnings.iter().any(|p| p.kind == PatternKind::BearishEngulfing));
    }

    #[test]
    fn downtrend_blend_is_clamped_and_directional() {
        let falling = hammer_series();
        let score = downtrend_score(falling.bars(), 0, 3);
        assert!(score > 0.0 && score <= 1.0);

        let rising = OhlcvSeries::new(vec![
            bar(6, 10_800, 10_900, 10_700, 10_850),
            bar(5, 10_300, 10_450, 10_250, 10_400),
            bar(4, 10_000, 10_100, 9_900, 10_050),
        ]);
        assert_eq!(downtrend_score(rising.bars(), 0, 3), 0.0);
        assert!(uptrend_score(rising.bars(), 0, 3) > 0.0);
    }
}
