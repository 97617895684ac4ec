use serde::{Deserialize, Serialize};

/// Broad market trend from the index heuristic. The analyzer producing this
/// is an external collaborator; the engine only consumes the classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketTrend {
    Bull,
    Bear,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketVolatility {
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketCondition {
    pub trend: MarketTrend,
    pub volatility: MarketVolatility,
}

impl Default for MarketCondition {
    fn default() -> Self {
        Self {
            trend: MarketTrend::Neutral,
            volatility: MarketVolatility::Normal,
        }
    }
}

impl MarketCondition {
    /// Position-size multiplier for the trend leg: bull 1.2, bear 0.7.
    pub fn trend_multiplier(&self) -> f64 {
        match self.trend {
            MarketTrend::Bull => 1.2,
            MarketTrend::Bear => 0.7,
            MarketTrend::Neutral => 1.0,
        }
    }

    /// Position-size multiplier for the volatility leg: high vol 0.8.
    pub fn volatility_multiplier(&self) -> f64 {
        match self.volatility {
            MarketVolatility::High => 0.8,
            _ => 1.0,
        }
    }

    /// Combined multiplier; the legs compose multiplicatively.
    pub fn size_multiplier(&self) -> f64 {
        self.trend_multiplier() * self.volatility_multiplier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipliers_compose() {
        let c = MarketCondition {
            trend: MarketTrend::Bull,
            volatility: MarketVolatility::High,
        };
        assert!((c.size_multiplier() - 0.96).abs() < 1e-9);
        assert_eq!(MarketCondition::default().size_multiplier(), 1.0);
    }
}
