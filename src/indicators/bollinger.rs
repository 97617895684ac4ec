#![allow(dead_code)]
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::{sma, stddev, Indicator};

#[derive(Debug, Clone, Copy)]
pub struct BollingerOutput {
    pub upper: Decimal,
    pub middle: Decimal,
    pub lower: Decimal,
}

impl BollingerOutput {
    /// Position of `price` inside the band, 0 = lower band, 1 = upper band.
    pub fn position(&self, price: Decimal) -> f64 {
        let width = self.upper - self.lower;
        if width <= Decimal::ZERO {
            return 0.5;
        }
        ((price - self.lower) / width).to_f64().unwrap_or(0.5)
    }
}

#[derive(Debug, Clone)]
pub struct BollingerBands {
    period: usize,
    multiplier: Decimal,
    prices: Vec<Decimal>,
    output: Option<BollingerOutput>,
}

impl BollingerBands {
    pub fn new(period: usize, multiplier: Decimal) -> Self {
        Self {
            period,
            multiplier,
            prices: Vec::with_capacity(period),
            output: None,
        }
    }

    pub fn default_params() -> Self {
        Self::new(20, Decimal::from(2))
    }

    pub fn update(&mut self, price: Decimal) -> Option<BollingerOutput> {
        self.prices.push(price);
        if self.prices.len() > self.period {
            self.prices.remove(0);
        }
        if self.prices.len() < self.period {
            return None;
        }
        let middle = sma(&self.prices, self.period)?;
        let deviation = stddev(&self.prices, self.period)? * self.multiplier;
        let out = BollingerOutput {
            upper: middle + deviation,
            middle,
            lower: middle - deviation,
        };
        self.output = Some(out);
        self.output
    }

    pub fn of_series(closes: &[Decimal]) -> Option<BollingerOutput> {
        let mut bb = BollingerBands::default_params();
        let mut last = None;
        for close in closes {
            last = bb.update(*close);
        }
        last
    }
}

impl Indicator for BollingerBands {
    fn name(&self) -> &'static str {
        "BollingerBands"
    }

    fn is_ready(&self) -> bool {
        self.output.is_some()
    }

    fn reset(&mut self) {
        self.prices.clear();
        self.output = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn constant_series_collapses_band() {
        let closes = vec![dec!(10000); 25];
        let out = BollingerBands::of_series(&closes).unwrap();
        assert_eq!(out.upper, out.lower);
        assert_eq!(out.position(dec!(10000)), 0.5);
    }

    #[test]
    fn band_position_is_bounded_by_band_edges() {
        let closes: Vec<Decimal> = (1..=25).map(|i| Decimal::from(10_000 + i * 17)).collect();
        let out = BollingerBands::of_series(&closes).unwrap();
        assert!(out.position(out.lower).abs() < 1e-9);
        assert!((out.position(out.upper) - 1.0).abs() < 1e-9);
    }
}
