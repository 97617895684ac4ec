#![allow(dead_code)]
use rust_decimal::Decimal;

use super::{ema::Ema, Indicator};

#[derive(Debug, Clone, Copy)]
pub struct MacdOutput {
    pub macd_line: Decimal,
    pub signal_line: Decimal,
    pub histogram: Decimal,
}

impl MacdOutput {
    /// Bullish cross with positive momentum, the entry-gate relaxation case.
    pub fn is_turning_up(&self) -> bool {
        self.macd_line > self.signal_line && self.histogram > Decimal::ZERO
    }
}

#[derive(Debug, Clone)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
    output: Option<MacdOutput>,
}

impl Macd {
    pub fn new(fast_period: usize, slow_period: usize, signal_period: usize) -> Self {
        Self {
            fast: Ema::new(fast_period),
            slow: Ema::new(slow_period),
            signal: Ema::new(signal_period),
            output: None,
        }
    }

    pub fn default_params() -> Self {
        Self::new(12, 26, 9)
    }

    pub fn update(&mut self, price: Decimal) -> Option<MacdOutput> {
        let fast = self.fast.update(price);
        let slow = self.slow.update(price);
        if let (Some(f), Some(s)) = (fast, slow) {
            let macd_line = f - s;
            if let Some(signal) = self.signal.update(macd_line) {
                self.output = Some(MacdOutput {
                    macd_line,
                    signal_line: signal,
                    histogram: macd_line - signal,
                });
            }
        }
        self.output
    }

    pub fn output(&self) -> Option<MacdOutput> {
        self.output
    }

    pub fn of_series(closes: &[Decimal]) -> Option<MacdOutput> {
        let mut macd = Macd::default_params();
        let mut last = None;
        for close in closes {
            last = macd.update(*close);
        }
        last
    }
}

impl Indicator for Macd {
    fn name(&self) -> &'static str {
        "MACD"
    }

    fn is_ready(&self) -> bool {
        self.output.is_some()
    }

    fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.signal.reset();
        self.output = None;
    }
}
