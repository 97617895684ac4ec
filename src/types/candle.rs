#![allow(dead_code)]
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One daily OHLCV bar in KRW.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

impl DailyBar {
    pub fn body(&self) -> Decimal {
        (self.close - self.open).abs()
    }

    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    pub fn upper_shadow(&self) -> Decimal {
        self.high - self.close.max(self.open)
    }

    pub fn lower_shadow(&self) -> Decimal {
        self.close.min(self.open) - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    pub fn body_ratio(&self) -> f64 {
        ratio(self.body(), self.range())
    }

    pub fn upper_shadow_ratio(&self) -> f64 {
        ratio(self.upper_shadow(), self.range())
    }

    pub fn lower_shadow_ratio(&self) -> f64 {
        ratio(self.lower_shadow(), self.range())
    }

    /// Where the close sits inside the day's range, 0 = low, 1 = high.
    pub fn close_position(&self) -> f64 {
        ratio(self.close - self.low, self.range())
    }
}

fn ratio(part: Decimal, whole: Decimal) -> f64 {
    if whole <= Decimal::ZERO {
        return 0.0;
    }
    (part / whole).to_f64().unwrap_or(0.0)
}

/// Daily bar series, most recent bar first (index 0 = today).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OhlcvSeries {
    bars: Vec<DailyBar>,
}

impl OhlcvSeries {
    pub fn new(bars: Vec<DailyBar>) -> Self {
        Self { bars }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn bar(&self, idx: usize) -> Option<&DailyBar> {
        self.bars.get(idx)
    }

    pub fn bars(&self) -> &[DailyBar] {
        &self.bars
    }

    pub fn latest(&self) -> Option<&DailyBar> {
        self.bars.first()
    }

    /// Closes ordered oldest first, the order streaming indicators consume.
    pub fn closes_chronological(&self) -> Vec<Decimal> {
        self.bars.iter().rev().map(|b| b.close).collect()
    }

    pub fn closes_f64(&self) -> Vec<f64> {
        self.bars
            .iter()
            .map(|b| b.close.to_f64().unwrap_or(0.0))
            .collect()
    }
}

/// Last observed trade for a symbol, fed by stream ticks or REST snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTick {
    pub stock_code: String,
    pub price: Decimal,
    pub change_rate: f64,
    pub accumulated_volume: u64,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

/// Top-of-book snapshot from the order-book stream frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookTop {
    pub stock_code: String,
    pub ask_price: Decimal,
    pub bid_price: Decimal,
    pub ask_quantity: u64,
    pub bid_quantity: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(open: i64, high: i64, low: i64, close: i64) -> DailyBar {
        DailyBar {
            date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            open: Decimal::from(open),
            high: Decimal::from(high),
            low: Decimal::from(low),
            close: Decimal::from(close),
            volume: 100_000,
        }
    }

    #[test]
    fn candle_anatomy() {
        let b = bar(10_000, 10_100, 9_200, 10_050);
        assert_eq!(b.body(), dec!(50));
        assert_eq!(b.range(), dec!(900));
        assert_eq!(b.upper_shadow(), dec!(50));
        assert_eq!(b.lower_shadow(), dec!(800));
        assert!(b.is_bullish());
        assert!(b.lower_shadow_ratio() > 0.88);
        assert!(b.close_position() > 0.9);
    }

    #[test]
    fn zero_range_bar_has_zero_ratios() {
        let b = bar(5_000, 5_000, 5_000, 5_000);
        assert_eq!(b.body_ratio(), 0.0);
        assert_eq!(b.close_position(), 0.0);
    }

    #[test]
    fn chronological_closes_reverse_the_series() {
        let series = OhlcvSeries::new(vec![bar(1, 2, 1, 2), bar(3, 4, 3, 4)]);
        let closes = series.closes_chronological();
        assert_eq!(closes, vec![dec!(4), dec!(2)]);
    }
}
