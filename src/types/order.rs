#![allow(dead_code)]
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::OrderKind;

/// Limit order handed to the brokerage gateway. KIS cash orders are always
/// priced; quantity is whole shares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_tag: String,
    pub stock_code: String,
    pub kind: OrderKind,
    pub quantity: u32,
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
}

impl OrderRequest {
    pub fn limit(stock_code: &str, kind: OrderKind, quantity: u32, price: Decimal) -> Self {
        Self {
            client_tag: Uuid::new_v4().to_string(),
            stock_code: stock_code.to_string(),
            kind,
            quantity,
            price,
            created_at: Utc::now(),
        }
    }
}

/// Gateway reply to an order submission. A logical rejection is a normal
/// control-flow outcome, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_no: Option<String>,
    pub message: String,
}

impl OrderResult {
    pub fn accepted(order_no: String) -> Self {
        Self {
            success: true,
            order_no: Some(order_no),
            message: String::new(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            order_no: None,
            message: message.into(),
        }
    }

    /// KIS APBK0400: requested quantity exceeds the sellable quantity,
    /// which means the position is already gone.
    pub fn is_quantity_exceeded(&self) -> bool {
        self.message.contains("APBK0400") || self.message.contains("quantity exceeded")
    }
}

/// Snapshot of the current quote for one symbol (REST pull).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub stock_code: String,
    pub stock_name: String,
    pub current_price: Decimal,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub prev_close: Decimal,
    pub accumulated_volume: u64,
    pub average_volume: u64,
    pub day_change_pct: f64,
}

/// One row of a ranking endpoint reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedStock {
    pub stock_code: String,
    pub stock_name: String,
    pub current_price: Decimal,
    pub day_change_pct: f64,
}

/// One held position inside the account balance reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub stock_code: String,
    pub stock_name: String,
    pub quantity: u32,
    pub average_price: Decimal,
    pub current_price: Decimal,
    pub profit_loss_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub available_amount: Decimal,
    pub cash_balance: Decimal,
    pub total_value: Decimal,
    pub holdings: Vec<Holding>,
}

impl AccountBalance {
    pub fn holding(&self, stock_code: &str) -> Option<&Holding> {
        self.holdings.iter().find(|h| h.stock_code == stock_code)
    }
}

/// Authoritative fill event decoded from the brokerage stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionNotice {
    pub stock_code: String,
    pub order_no: String,
    pub kind: OrderKind,
    pub quantity: u32,
    pub price: i64,
    /// Exchange-local execution time, HHMMSS.
    pub execution_time: String,
}

impl ExecutionNotice {
    /// Dedup key: reconciling the same notice twice must be a no-op.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.order_no, self.execution_time, self.quantity)
    }
}
