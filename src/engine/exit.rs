use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broker::BrokerGateway;
use crate::config::{business_hours_between, now_kst, parse_hhmm, ExitSettings};
use crate::feed::PriceFeed;
use crate::store::CandidateStore;
use crate::types::{Candidate, CandleStatus, OrderKind, OrderRequest};

use super::EngineController;

/// Why a position is being closed; drives the sell-price discount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    Target,
    Time,
    Signal,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::Target => "target",
            ExitReason::Time => "time",
            ExitReason::Signal => "signal",
        }
    }
}

/// Walks open positions and submits limit sells when the evaluator's signal
/// or the holding clock says to leave.
pub struct ExitManager {
    gateway: Arc<dyn BrokerGateway>,
    feed: Arc<PriceFeed>,
    store: Arc<CandidateStore>,
    controller: Arc<EngineController>,
    settings: ExitSettings,
}

impl ExitManager {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        feed: Arc<PriceFeed>,
        store: Arc<CandidateStore>,
        controller: Arc<EngineController>,
        settings: ExitSettings,
    ) -> Self {
        Self {
            gateway,
            feed,
            store,
            controller,
            settings,
        }
    }

    pub async fn run(&self) -> usize {
        if !self.controller.is_running() {
            return 0;
        }
        if !self.within_trading_window() {
            debug!("outside trading window, exits deferred");
            return 0;
        }

        let positions = self.store.get_by_state(&[CandleStatus::Entered]).await;
        let mut submitted = 0;
        for position in positions {
            if self.controller.is_shutting_down() {
                break;
            }
            if position.final_exit_confirmed() || position.metadata.contains_key("auto_exit_reason") {
                continue;
            }
            if self.manage_position(position).await {
                submitted += 1;
            }
        }
        submitted
    }

    async fn manage_position(&self, mut position: Candidate) -> bool {
        let code = position.stock_code.clone();

        // No shares on the book means there is nothing to sell; close the
        // row out instead of hammering the gateway.
        let quantity = position.performance.entry_quantity;
        if quantity == 0 {
            warn!("{} entered with no recorded quantity, closing row", code);
            position
                .metadata
                .insert("auto_exit_reason".to_string(), "no_system_quantity".to_string());
            position.mark_final_exit();
            position.exit_position(position.current_price, "no_system_quantity", Utc::now());
            self.store.update(position).await;
            return false;
        }

        let current_price = match self.feed.best_price(&code).await {
            Ok(price) if price > Decimal::ZERO => price,
            _ => {
                debug!("{} has no usable price this pass", code);
                return false;
            }
        };
        position.update_price(current_price, Utc::now());

        let reason = match self.exit_reason(&position, current_price) {
            Some(reason) => reason,
            None => {
                self.store.update(position).await;
                return false;
            }
        };

        self.submit_exit(position, current_price, reason).await
    }

    /// Exit decision: the evaluator's sell signal, the hard holding-time
    /// limit, or the soft profitable-time rule. The reason label prefers the
    /// plan level that was actually crossed.
    fn exit_reason(&self, position: &Candidate, price: Decimal) -> Option<ExitReason> {
        let plan = &position.risk_plan;

        if position.trade_signal.is_sell() {
            if plan.stop_loss_price > Decimal::ZERO && price <= plan.stop_loss_price {
                return Some(ExitReason::StopLoss);
            }
            if plan.target_price > Decimal::ZERO && price >= plan.target_price {
                return Some(ExitReason::Target);
            }
            return Some(ExitReason::Signal);
        }

        let Some(entry_time) = position.performance.entry_time else {
            return None;
        };
        let held_hours = business_hours_between(entry_time, Utc::now());
        let max_hours = plan.max_holding_hours as f64;
        if max_hours > 0.0 {
            if held_hours >= max_hours {
                return Some(ExitReason::Time);
            }
            let pnl = position.performance.pnl_pct.unwrap_or(0.0);
            if held_hours >= max_hours / 2.0 && pnl >= self.settings.min_profit_for_time_exit_pct {
                return Some(ExitReason::Time);
            }
        }
        None
    }

    async fn submit_exit(&self, mut position: Candidate, price: Decimal, reason: ExitReason) -> bool {
        let code = position.stock_code.clone();
        let quantity = position.performance.entry_quantity;
        let sell_price = safe_sell_price(price, reason);

        info!(
            "submitting sell {} x{} @ {} ({}, market {})",
            code, quantity, sell_price, reason.as_str(), price
        );

        let order = OrderRequest::limit(&code, OrderKind::Sell, quantity, Decimal::from(sell_price));
        let result = match self.gateway.order_sell(&order).await {
            Ok(result) => result,
            Err(e) => {
                warn!("{} sell submission failed: {}", code, e);
                return false;
            }
        };

        if !result.success {
            if result.is_quantity_exceeded() {
                // The shares are already gone; reconcile the row shut.
                warn!("{} sellable quantity exceeded, marking exited", code);
                position
                    .metadata
                    .insert("auto_exit_reason".to_string(), "quantity_exceeded".to_string());
                position.mark_final_exit();
                position.exit_position(price, "quantity_exceeded", Utc::now());
                self.store.update(position).await;
                return false;
            }
            warn!("{} sell rejected: {}", code, result.message);
            return false;
        }

        let order_no = result.order_no.unwrap_or_default();
        position
            .metadata
            .insert("pending_exit_reason".to_string(), reason.as_str().to_string());
        position.set_pending_order(&order_no, OrderKind::Sell);
        self.store.update(position).await;
        self.controller.record_order();
        info!("{} sell accepted, order {}", code, order_no);
        true
    }

    fn within_trading_window(&self) -> bool {
        let (Some(start), Some(end)) = (
            parse_hhmm(&self.settings.trading_start),
            parse_hhmm(&self.settings.trading_end),
        ) else {
            return false;
        };
        let now = now_kst().time();
        now >= start && now <= end
    }
}

/// Korean equity tick schedule: the minimum price increment by price band.
pub fn tick_unit(price: i64) -> i64 {
    if price < 2_000 {
        1
    } else if price < 5_000 {
        5
    } else if price < 20_000 {
        10
    } else if price < 50_000 {
        50
    } else if price < 200_000 {
        100
    } else if price < 500_000 {
        500
    } else {
        1_000
    }
}

/// Limit price for a sell that should actually fill: a reason-specific
/// discount off the market, aligned down to the tick grid, floored at 99% of
/// market for target exits and 97% otherwise.
pub fn safe_sell_price(current_price: Decimal, reason: ExitReason) -> i64 {
    use rust_decimal_macros::dec;
    let discount = match reason {
        ExitReason::StopLoss => dec!(0.008),
        ExitReason::Target => dec!(0.002),
        ExitReason::Time => dec!(0.005),
        ExitReason::Signal => dec!(0.003),
    };
    if current_price <= Decimal::ZERO {
        return 0;
    }
    let discounted = (current_price * (Decimal::ONE - discount))
        .floor()
        .to_i64()
        .unwrap_or(0);
    let tick = tick_unit(discounted);
    let aligned = (discounted / tick) * tick;

    let floor_ratio = if reason == ExitReason::Target { dec!(0.99) } else { dec!(0.97) };
    let floor = (current_price * floor_ratio).floor().to_i64().unwrap_or(0);
    aligned.max(floor)
}
