#![allow(dead_code)]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Korean market segment a symbol is listed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketType {
    Kospi,
    Kosdaq,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Kospi => "KOSPI",
            MarketType::Kosdaq => "KOSDAQ",
        }
    }

    /// KIS market division code used by ranking endpoints.
    pub fn division_code(&self) -> &'static str {
        match self {
            MarketType::Kospi => "J",
            MarketType::Kosdaq => "Q",
        }
    }

    pub fn all() -> [MarketType; 2] {
        [MarketType::Kospi, MarketType::Kosdaq]
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Buy,
    Sell,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Buy => "buy",
            OrderKind::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Discrete action hint produced by the scanner and evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSignal {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

impl TradeSignal {
    pub fn is_buy(&self) -> bool {
        matches!(self, TradeSignal::StrongBuy | TradeSignal::Buy)
    }

    pub fn is_sell(&self) -> bool {
        matches!(self, TradeSignal::StrongSell | TradeSignal::Sell)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSignal::StrongBuy => "strong_buy",
            TradeSignal::Buy => "buy",
            TradeSignal::Hold => "hold",
            TradeSignal::Sell => "sell",
            TradeSignal::StrongSell => "strong_sell",
        }
    }
}

impl fmt::Display for TradeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Candidate lifecycle state.
///
/// SellReady is a transient label used by the evaluator; the store never
/// persists it as a resting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandleStatus {
    Scanning,
    Watching,
    BuyReady,
    PendingOrder,
    Entered,
    SellReady,
    Exited,
    Stopped,
}

impl CandleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandleStatus::Scanning => "scanning",
            CandleStatus::Watching => "watching",
            CandleStatus::BuyReady => "buy_ready",
            CandleStatus::PendingOrder => "pending_order",
            CandleStatus::Entered => "entered",
            CandleStatus::SellReady => "sell_ready",
            CandleStatus::Exited => "exited",
            CandleStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CandleStatus::Exited | CandleStatus::Stopped)
    }

    /// Legal edges of the lifecycle graph. Order rejections walk the reverse
    /// edges PendingOrder -> BuyReady (buy path) and PendingOrder -> Entered
    /// (sell path). Stopped is reachable from anywhere as the forced state.
    pub fn can_transition(&self, next: CandleStatus) -> bool {
        use CandleStatus::*;
        if next == Stopped {
            return true;
        }
        matches!(
            (self, next),
            (Scanning, Watching)
                | (Scanning, BuyReady)
                | (Watching, BuyReady)
                | (BuyReady, Watching)
                | (BuyReady, PendingOrder)
                | (PendingOrder, Entered)
                | (PendingOrder, BuyReady)
                | (PendingOrder, Exited)
                | (Entered, PendingOrder)
                | (Entered, SellReady)
                | (SellReady, PendingOrder)
                | (SellReady, Entered)
                | (Entered, Exited)
        )
    }
}

impl fmt::Display for CandleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Named candlestick formation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternKind {
    Hammer,
    InvertedHammer,
    BullishEngulfing,
    BearishEngulfing,
    PiercingLine,
    MorningStar,
    EveningStar,
    Doji,
}

impl PatternKind {
    /// Lowercase key used by the pattern target config file.
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Hammer => "hammer",
            PatternKind::InvertedHammer => "inverted_hammer",
            PatternKind::BullishEngulfing => "bullish_engulfing",
            PatternKind::BearishEngulfing => "bearish_engulfing",
            PatternKind::PiercingLine => "piercing_line",
            PatternKind::MorningStar => "morning_star",
            PatternKind::EveningStar => "evening_star",
            PatternKind::Doji => "doji",
        }
    }

    pub fn is_bullish(&self) -> bool {
        matches!(
            self,
            PatternKind::Hammer
                | PatternKind::InvertedHammer
                | PatternKind::BullishEngulfing
                | PatternKind::PiercingLine
                | PatternKind::MorningStar
        )
    }

    pub fn is_bearish(&self) -> bool {
        matches!(self, PatternKind::BearishEngulfing | PatternKind::EveningStar)
    }

    /// Additive weight used by the entry-priority formula.
    pub fn priority_weight(&self) -> i32 {
        match self {
            PatternKind::MorningStar => 20,
            PatternKind::BullishEngulfing => 18,
            PatternKind::Hammer | PatternKind::InvertedHammer => 15,
            PatternKind::Doji => 8,
            _ => 10,
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_allows_lifecycle_path() {
        use CandleStatus::*;
        let path = [Scanning, Watching, BuyReady, PendingOrder, Entered, PendingOrder, Exited];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn transition_graph_rejects_illegal_edges() {
        use CandleStatus::*;
        assert!(!Watching.can_transition(Entered));
        assert!(!Exited.can_transition(Watching));
        assert!(!Scanning.can_transition(PendingOrder));
        assert!(!Entered.can_transition(BuyReady));
    }

    #[test]
    fn rejection_edges_are_legal() {
        use CandleStatus::*;
        assert!(PendingOrder.can_transition(BuyReady));
        assert!(PendingOrder.can_transition(Entered));
    }

    #[test]
    fn stopped_is_reachable_from_anywhere() {
        for status in [CandleStatus::Watching, CandleStatus::Entered, CandleStatus::Exited] {
            assert!(status.can_transition(CandleStatus::Stopped));
        }
    }
}
