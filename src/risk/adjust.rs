use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

const MIN_ADJUSTMENT_INTERVAL_SECS: i64 = 300;
const MAX_CONSECUTIVE_ADJUSTMENTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustDirection {
    Up,
    Down,
    Neutral,
}

#[derive(Debug, Clone)]
struct AdjustRecord {
    last_at: DateTime<Utc>,
    last_direction: AdjustDirection,
    consecutive: u32,
}

/// Throttle for risk-plan rewrites. Back-to-back adjustments in the same
/// direction oscillate targets and churn orders, so a new adjustment is
/// rejected when it lands inside the cool-off window or would extend a
/// same-direction streak past the cap. Pure stop tightening is exempt.
#[derive(Debug, Default)]
pub struct AdjustmentLedger {
    history: HashMap<String, AdjustRecord>,
}

impl AdjustmentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a non-safety adjustment may run now. Adjustments that only
    /// tighten the stop toward safety bypass this ledger entirely.
    pub fn can_apply(&self, stock_code: &str, direction: AdjustDirection, now: DateTime<Utc>) -> bool {
        let Some(record) = self.history.get(stock_code) else {
            return true;
        };
        if now - record.last_at < Duration::seconds(MIN_ADJUSTMENT_INTERVAL_SECS) {
            return false;
        }
        if record.last_direction == direction && record.consecutive >= MAX_CONSECUTIVE_ADJUSTMENTS {
            return false;
        }
        true
    }

    pub fn record(&mut self, stock_code: &str, direction: AdjustDirection, now: DateTime<Utc>) {
        let entry = self
            .history
            .entry(stock_code.to_string())
            .or_insert(AdjustRecord {
                last_at: now,
                last_direction: direction,
                consecutive: 0,
            });
        if entry.last_direction == direction {
            entry.consecutive += 1;
        } else {
            entry.consecutive = 1;
        }
        entry.last_direction = direction;
        entry.last_at = now;
    }

    /// Drops records older than a day so the map does not grow unbounded.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.history
            .retain(|_, r| now - r.last_at < Duration::hours(24));
    }
}
