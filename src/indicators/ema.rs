#![allow(dead_code)]
use rust_decimal::Decimal;

use super::Indicator;

#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    multiplier: Decimal,
    value: Option<Decimal>,
    seed: Vec<Decimal>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            multiplier: Decimal::from(2) / Decimal::from(period as u32 + 1),
            value: None,
            seed: Vec::with_capacity(period),
        }
    }

    pub fn update(&mut self, price: Decimal) -> Option<Decimal> {
        match self.value {
            Some(prev) => {
                let next = (price - prev) * self.multiplier + prev;
                self.value = Some(next);
            }
            None => {
                // Seed with an SMA over the first full period.
                self.seed.push(price);
                if self.seed.len() == self.period {
                    let sum: Decimal = self.seed.iter().sum();
                    self.value = Some(sum / Decimal::from(self.period as u32));
                }
            }
        }
        self.value
    }

    pub fn value(&self) -> Option<Decimal> {
        self.value
    }
}

impl Indicator for Ema {
    fn name(&self) -> &'static str {
        "EMA"
    }

    fn is_ready(&self) -> bool {
        self.value.is_some()
    }

    fn reset(&mut self) {
        self.value = None;
        self.seed.clear();
    }
}
