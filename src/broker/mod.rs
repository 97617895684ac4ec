pub mod crypto;
pub mod rest;
pub mod stream;
pub mod wire;

pub use rest::KisClient;
pub use stream::{StreamCommand, StreamEvent, StreamSession};

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{
    AccountBalance, DailyBar, MarketType, OrderRequest, OrderResult, PriceSnapshot, RankedStock,
};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("network: {0}")]
    Network(String),
    #[error("auth expired or rejected: {0}")]
    Auth(String),
    #[error("gateway rejected request: {code} {message}")]
    Gateway { code: String, message: String },
    #[error("malformed reply: {0}")]
    Parse(String),
    #[error("subscription capacity exhausted")]
    Capacity,
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Network(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, BrokerError::Auth(_))
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        BrokerError::Network(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartPeriod {
    Day,
    Week,
    Month,
    Year,
}

impl ChartPeriod {
    pub fn code(&self) -> &'static str {
        match self {
            ChartPeriod::Day => "D",
            ChartPeriod::Week => "W",
            ChartPeriod::Month => "M",
            ChartPeriod::Year => "Y",
        }
    }
}

/// Contract over the brokerage REST surface the engine consumes. `KisClient`
/// is the production implementation; tests substitute fakes.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn current_price(&self, code: &str) -> Result<PriceSnapshot, BrokerError>;

    /// Daily/weekly/monthly bars, most recent first.
    async fn daily_chart(
        &self,
        code: &str,
        period: ChartPeriod,
        adjusted: bool,
    ) -> Result<Vec<DailyBar>, BrokerError>;

    /// Top gainers by fluctuation rate, filtered at `min_rate` percent.
    async fn fluctuation_rank(
        &self,
        market: MarketType,
        min_rate: f64,
    ) -> Result<Vec<RankedStock>, BrokerError>;

    async fn volume_rank(&self, market: MarketType) -> Result<Vec<RankedStock>, BrokerError>;

    async fn disparity_rank(
        &self,
        market: MarketType,
        window: u16,
    ) -> Result<Vec<RankedStock>, BrokerError>;

    async fn balance(&self) -> Result<AccountBalance, BrokerError>;

    async fn order_buy(&self, order: &OrderRequest) -> Result<OrderResult, BrokerError>;

    async fn order_sell(&self, order: &OrderRequest) -> Result<OrderResult, BrokerError>;
}
