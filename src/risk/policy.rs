use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::patterns::PatternConfig;
use crate::types::{Candidate, PatternKind, RiskPlan};

use super::MarketCondition;

/// Derives each candidate's risk plan from its primary pattern and the
/// current market condition.
pub struct RiskPolicy {
    config: PatternConfig,
}

impl RiskPolicy {
    pub fn new(config: PatternConfig) -> Self {
        Self { config }
    }

    pub fn derive(&self, candidate: &Candidate, condition: &MarketCondition) -> RiskPlan {
        let price = candidate.current_price;
        let primary = candidate.primary_pattern();

        // Strong formations earn larger base positions, scaled by confidence.
        let position_size_pct = match primary {
            Some(p) => {
                let base = match p.kind {
                    PatternKind::MorningStar | PatternKind::BullishEngulfing => 30.0,
                    PatternKind::Hammer | PatternKind::InvertedHammer => 20.0,
                    _ => 15.0,
                };
                base * p.confidence * condition.size_multiplier()
            }
            None => 10.0,
        };

        let (target_pct, stop_pct, max_hours) = match primary {
            Some(p) => {
                let cfg = self.config.target_for(p.kind);
                (cfg.target, cfg.stop, cfg.max_hours)
            }
            None => {
                let strength = candidate.signal_strength;
                let (t, s) = strength_tier_targets(strength);
                (t, s, 24)
            }
        };

        let target_price = apply_pct(price, 1.0 + target_pct / 100.0);
        let stop_loss_price = apply_pct(price, 1.0 - stop_pct / 100.0);

        let day_change = candidate
            .metadata
            .get("day_change_pct")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);

        RiskPlan {
            position_size_pct,
            target_price,
            stop_loss_price,
            trailing_stop_pct: stop_pct * 0.6,
            max_holding_hours: max_hours,
            risk_score: risk_score(price, day_change),
        }
    }
}

/// Fallback exit targets by signal-strength tier when no pattern config
/// applies: ultra-strong 8/4, strong 6/3, medium 4/3, weak 2/2, else 2/1.5.
pub fn strength_tier_targets(strength: i32) -> (f64, f64) {
    if strength >= 90 {
        (8.0, 4.0)
    } else if strength >= 80 {
        (6.0, 3.0)
    } else if strength >= 70 {
        (4.0, 3.0)
    } else if strength >= 60 {
        (2.0, 2.0)
    } else {
        (2.0, 1.5)
    }
}

/// 0..=100 risk score from price band and the day's move, starting at 50.
pub fn risk_score(price: Decimal, day_change_pct: f64) -> i32 {
    let mut score = 50;
    let p = price.to_f64().unwrap_or(0.0);
    if p < 5_000.0 {
        score += 20;
    } else if p > 100_000.0 {
        score += 10;
    }
    if day_change_pct.abs() > 10.0 {
        score += 30;
    } else if day_change_pct.abs() > 5.0 {
        score += 15;
    }
    score.clamp(0, 100)
}

fn apply_pct(price: Decimal, ratio: f64) -> Decimal {
    let r = Decimal::from_f64(ratio).unwrap_or(Decimal::ONE);
    (price * r).round_dp(0)
}
