#![allow(dead_code)]
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::Indicator;

/// Wilder RSI, fed one close at a time (oldest first).
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    avg_gain: Option<Decimal>,
    avg_loss: Option<Decimal>,
    prev_price: Option<Decimal>,
    gains: Vec<Decimal>,
    losses: Vec<Decimal>,
    value: Option<Decimal>,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            avg_gain: None,
            avg_loss: None,
            prev_price: None,
            gains: Vec::with_capacity(period),
            losses: Vec::with_capacity(period),
            value: None,
        }
    }

    pub fn update(&mut self, price: Decimal) -> Option<Decimal> {
        if let Some(prev) = self.prev_price {
            let change = price - prev;
            let gain = change.max(Decimal::ZERO);
            let loss = (-change).max(Decimal::ZERO);

            if self.gains.len() < self.period {
                self.gains.push(gain);
                self.losses.push(loss);
                if self.gains.len() == self.period {
                    let n = Decimal::from(self.period as u32);
                    self.avg_gain = Some(self.gains.iter().sum::<Decimal>() / n);
                    self.avg_loss = Some(self.losses.iter().sum::<Decimal>() / n);
                    self.value = self.compute();
                }
            } else if let (Some(ag), Some(al)) = (self.avg_gain, self.avg_loss) {
                let n = Decimal::from(self.period as u32);
                self.avg_gain = Some((ag * (n - Decimal::ONE) + gain) / n);
                self.avg_loss = Some((al * (n - Decimal::ONE) + loss) / n);
                self.value = self.compute();
            }
        }
        self.prev_price = Some(price);
        self.value
    }

    fn compute(&self) -> Option<Decimal> {
        match (self.avg_gain, self.avg_loss) {
            (Some(ag), Some(al)) => {
                if al.is_zero() {
                    Some(Decimal::from(100))
                } else {
                    let rs = ag / al;
                    Some(Decimal::from(100) - Decimal::from(100) / (Decimal::ONE + rs))
                }
            }
            _ => None,
        }
    }

    pub fn value(&self) -> Option<Decimal> {
        self.value
    }

    /// Latest RSI over a chronological close series, as f64 for scoring.
    pub fn of_series(closes: &[Decimal], period: usize) -> Option<f64> {
        let mut rsi = Rsi::new(period);
        let mut last = None;
        for close in closes {
            last = rsi.update(*close);
        }
        last.and_then(|v| v.to_f64())
    }
}

impl Indicator for Rsi {
    fn name(&self) -> &'static str {
        "RSI"
    }

    fn is_ready(&self) -> bool {
        self.value.is_some()
    }

    fn reset(&mut self) {
        self.avg_gain = None;
        self.avg_loss = None;
        self.prev_price = None;
        self.gains.clear();
        self.losses.clear();
        self.value = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_a_full_period_before_reporting() {
        let closes: Vec<Decimal> = (1..=10).map(Decimal::from).collect();
        assert!(Rsi::of_series(&closes, 14).is_none());
    }

    #[test]
    fn monotonic_rise_pins_rsi_at_100() {
        let closes: Vec<Decimal> = (1..=30).map(Decimal::from).collect();
        let rsi = Rsi::of_series(&closes, 14).unwrap();
        assert!((rsi - 100.0).abs() < 1e-9);
    }

    #[test]
    fn monotonic_fall_drives_rsi_to_zero() {
        let closes: Vec<Decimal> = (1..=30).rev().map(Decimal::from).collect();
        let rsi = Rsi::of_series(&closes, 14).unwrap();
        assert!(rsi < 1.0);
    }
}
