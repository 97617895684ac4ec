#![allow(dead_code)]
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerError, BrokerGateway, ChartPeriod, StreamCommand, StreamEvent, StreamSession,
};
use crate::broker::stream::StreamConfig;
use crate::types::{BookTop, DailyBar, ExecutionNotice, PriceSnapshot, PriceTick};

/// Symbol budget: each symbol burns two channels (tick + book) of the
/// 41-channel stream allowance, with one channel reserved for execution
/// notices.
pub const MAX_SUBSCRIBED_SYMBOLS: usize = 19;

pub type TickCallback = Arc<dyn Fn(&PriceTick) + Send + Sync>;

/// Sink for decoded execution notices; the reconciler implements this.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    async fn handle_execution(&self, notice: ExecutionNotice);
}

/// Unified price source: push ticks from the realtime stream with REST
/// pull for snapshots, scans, and stream outages. Never blocks the
/// orchestrator on stream health.
pub struct PriceFeed {
    gateway: Arc<dyn BrokerGateway>,
    commands: mpsc::Sender<StreamCommand>,
    subscriptions: Mutex<HashSet<String>>,
    ticks: RwLock<HashMap<String, PriceTick>>,
    books: RwLock<HashMap<String, BookTop>>,
    callbacks: RwLock<HashMap<String, TickCallback>>,
    execution_handler: RwLock<Option<Arc<dyn ExecutionHandler>>>,
    degraded: AtomicBool,
}

impl PriceFeed {
    /// Starts the stream session and its dispatcher, returning the shared
    /// feed handle.
    pub fn start(
        gateway: Arc<dyn BrokerGateway>,
        stream_config: StreamConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(1024);

        StreamSession::spawn(stream_config, command_rx, event_tx, shutdown.clone());

        let feed = Arc::new(Self::with_commands(gateway, command_tx));
        tokio::spawn(Arc::clone(&feed).dispatch(event_rx, shutdown));
        feed
    }

    /// Pull-only feed with no live stream behind it; used at startup before
    /// the session exists and by tests.
    pub fn pull_only(gateway: Arc<dyn BrokerGateway>) -> Arc<Self> {
        let (command_tx, _command_rx) = mpsc::channel(1);
        let feed = Arc::new(Self::with_commands(gateway, command_tx));
        feed.degraded.store(true, Ordering::Release);
        feed
    }

    fn with_commands(gateway: Arc<dyn BrokerGateway>, commands: mpsc::Sender<StreamCommand>) -> Self {
        Self {
            gateway,
            commands,
            subscriptions: Mutex::new(HashSet::new()),
            ticks: RwLock::new(HashMap::new()),
            books: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(HashMap::new()),
            execution_handler: RwLock::new(None),
            degraded: AtomicBool::new(false),
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        mut events: mpsc::Receiver<StreamEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        StreamEvent::Tick(tick) => {
                            {
                                let mut ticks = self.ticks.write().await;
                                ticks.insert(tick.stock_code.clone(), tick.clone());
                            }
                            if let Some(callback) = self.callbacks.read().await.get(&tick.stock_code) {
                                callback(&tick);
                            }
                        }
                        StreamEvent::Book(book) => {
                            self.books.write().await.insert(book.stock_code.clone(), book);
                        }
                        StreamEvent::Execution(notice) => {
                            let handler = self.execution_handler.read().await.clone();
                            match handler {
                                Some(handler) => handler.handle_execution(notice).await,
                                None => warn!("execution notice with no handler registered: {:?}", notice),
                            }
                        }
                        StreamEvent::Connected => {
                            if self.degraded.swap(false, Ordering::AcqRel) {
                                info!("stream restored, leaving pull-only mode");
                            }
                        }
                        StreamEvent::Degraded => {
                            warn!("stream degraded, price updates fall back to pull");
                            self.degraded.store(true, Ordering::Release);
                        }
                        StreamEvent::Disconnected => {
                            debug!("stream disconnected, awaiting reconnect");
                        }
                    }
                }
            }
        }
    }

    /// Registers a per-symbol tick callback. Re-subscribing an already
    /// subscribed symbol only swaps the callback. At capacity the call fails
    /// for this symbol without touching existing subscriptions.
    pub async fn subscribe(&self, stock_code: &str, on_tick: TickCallback) -> Result<(), BrokerError> {
        let mut subs = self.subscriptions.lock().await;
        if !subs.contains(stock_code) {
            if subs.len() >= MAX_SUBSCRIBED_SYMBOLS {
                return Err(BrokerError::Capacity);
            }
            subs.insert(stock_code.to_string());
            let _ = self
                .commands
                .send(StreamCommand::Subscribe(stock_code.to_string()))
                .await;
        }
        self.callbacks
            .write()
            .await
            .insert(stock_code.to_string(), on_tick);
        Ok(())
    }

    pub async fn unsubscribe(&self, stock_code: &str) {
        let mut subs = self.subscriptions.lock().await;
        if subs.remove(stock_code) {
            let _ = self
                .commands
                .send(StreamCommand::Unsubscribe(stock_code.to_string()))
                .await;
        }
        self.callbacks.write().await.remove(stock_code);
        self.ticks.write().await.remove(stock_code);
        self.books.write().await.remove(stock_code);
    }

    /// Drops the subscription after a grace window, letting late fills for
    /// the symbol still arrive.
    pub fn release_after_grace(self: &Arc<Self>, stock_code: &str, grace: std::time::Duration) {
        let feed = Arc::clone(self);
        let code = stock_code.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            feed.unsubscribe(&code).await;
            debug!("released stream subscription for {}", code);
        });
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    pub async fn is_subscribed(&self, stock_code: &str) -> bool {
        self.subscriptions.lock().await.contains(stock_code)
    }

    pub async fn register_execution_handler(&self, handler: Arc<dyn ExecutionHandler>) {
        *self.execution_handler.write().await = Some(handler);
    }

    /// Last pushed tick, if the symbol is streaming.
    pub async fn latest_tick(&self, stock_code: &str) -> Option<PriceTick> {
        self.ticks.read().await.get(stock_code).cloned()
    }

    pub async fn latest_book(&self, stock_code: &str) -> Option<BookTop> {
        self.books.read().await.get(stock_code).cloned()
    }

    /// REST pull, always fresh; the scan path and stream-outage fallback.
    pub async fn snapshot_price(&self, stock_code: &str) -> Result<PriceSnapshot, BrokerError> {
        self.gateway.current_price(stock_code).await
    }

    pub async fn snapshot_ohlcv(&self, stock_code: &str) -> Result<Vec<DailyBar>, BrokerError> {
        self.gateway.daily_chart(stock_code, ChartPeriod::Day, true).await
    }

    /// Best price available right now: pushed tick when streaming, REST
    /// otherwise.
    pub async fn best_price(&self, stock_code: &str) -> Result<rust_decimal::Decimal, BrokerError> {
        if !self.is_degraded() {
            if let Some(tick) = self.latest_tick(stock_code).await {
                return Ok(tick.price);
            }
        }
        Ok(self.snapshot_price(stock_code).await?.current_price)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountBalance, MarketType, OrderRequest, OrderResult, RankedStock};
    use rust_decimal::Decimal;

    struct NullGateway;

    #[async_trait]
    impl BrokerGateway for NullGateway {
        async fn current_price(&self, code: &str) -> Result<PriceSnapshot, BrokerError> {
            Ok(PriceSnapshot {
                stock_code: code.to_string(),
                stock_name: String::new(),
                current_price: Decimal::from(10_000),
                open: Decimal::ZERO,
                high: Decimal::ZERO,
                low: Decimal::ZERO,
                prev_close: Decimal::ZERO,
                accumulated_volume: 0,
                average_volume: 0,
                day_change_pct: 0.0,
            })
        }

        async fn daily_chart(
            &self,
            _code: &str,
            _period: ChartPeriod,
            _adjusted: bool,
        ) -> Result<Vec<DailyBar>, BrokerError> {
            Ok(Vec::new())
        }

        async fn fluctuation_rank(
            &self,
            _market: MarketType,
            _min_rate: f64,
        ) -> Result<Vec<RankedStock>, BrokerError> {
            Ok(Vec::new())
        }

        async fn volume_rank(&self, _market: MarketType) -> Result<Vec<RankedStock>, BrokerError> {
            Ok(Vec::new())
        }

        async fn disparity_rank(
            &self,
            _market: MarketType,
            _window: u16,
        ) -> Result<Vec<RankedStock>, BrokerError> {
            Ok(Vec::new())
        }

        async fn balance(&self) -> Result<AccountBalance, BrokerError> {
            Ok(AccountBalance {
                available_amount: Decimal::ZERO,
                cash_balance: Decimal::ZERO,
                total_value: Decimal::ZERO,
                holdings: Vec::new(),
            })
        }

        async fn order_buy(&self, _order: &OrderRequest) -> Result<OrderResult, BrokerError> {
            Ok(OrderResult::rejected("not trading"))
        }

        async fn order_sell(&self, _order: &OrderRequest) -> Result<OrderResult, BrokerError> {
            Ok(OrderResult::rejected("not trading"))
        }
    }

    fn noop_callback() -> TickCallback {
        Arc::new(|_tick: &PriceTick| {})
    }

    #[tokio::test]
    async fn subscription_budget_is_enforced_per_symbol() {
        let feed = PriceFeed::pull_only(Arc::new(NullGateway));
        for i in 0..MAX_SUBSCRIBED_SYMBOLS {
            let code = format!("{:06}", i);
            assert!(feed.subscribe(&code, noop_callback()).await.is_ok());
        }
        // The 20th symbol fails without disturbing the others.
        let err = feed.subscribe("999999", noop_callback()).await;
        assert!(matches!(err, Err(BrokerError::Capacity)));
        assert_eq!(feed.subscription_count().await, MAX_SUBSCRIBED_SYMBOLS);

        // Resubscribing an existing symbol is a no-op on the budget.
        assert!(feed.subscribe("000001", noop_callback()).await.is_ok());
        assert_eq!(feed.subscription_count().await, MAX_SUBSCRIBED_SYMBOLS);
    }

    #[tokio::test]
    async fn unsubscribe_frees_budget() {
        let feed = PriceFeed::pull_only(Arc::new(NullGateway));
        feed.subscribe("005930", noop_callback()).await.unwrap();
        feed.unsubscribe("005930").await;
        assert_eq!(feed.subscription_count().await, 0);
        assert!(!feed.is_subscribed("005930").await);
    }

    #[tokio::test]
    async fn degraded_feed_pulls_prices() {
        let feed = PriceFeed::pull_only(Arc::new(NullGateway));
        assert!(feed.is_degraded());
        let price = feed.best_price("005930").await.unwrap();
        assert_eq!(price, Decimal::from(10_000));
    }
}
