mod broker;
mod config;
mod database;
mod engine;
mod feed;
mod indicators;
mod patterns;
mod risk;
mod store;
mod types;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use broker::stream::StreamConfig;
use broker::{BrokerGateway, KisClient};
use broker::rest::KisCredentials;
use config::AppConfig;
use database::TradeRecorder;
use engine::{
    EngineController, EntryExecutor, ExecutionReconciler, ExitManager, MarketScanner,
    SignalEvaluator, TradingOrchestrator,
};
use feed::PriceFeed;
use patterns::{PatternConfig, PatternDetector};
use risk::{MarketCondition, RiskPolicy};
use store::CandidateStore;

#[derive(Parser)]
#[command(name = "candle-trading-bot")]
#[command(author = "Trading Bot")]
#[command(version = "0.1.0")]
#[command(about = "Automated Korean-equities intraday trading bot (candle reversal patterns)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live trading loop
    Run,
    /// One scan pass: rank the market, detect patterns, print candidates
    Scan,
    /// Show current quotes for the given symbols
    Prices {
        /// 6-digit stock codes
        codes: Vec<String>,
    },
    /// Show the account balance and open holdings
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Candle Trading Bot v0.1.0");

    let config = Arc::new(AppConfig::load(Some(&cli.config))?);

    match cli.command {
        Commands::Run => run_trading(config).await?,
        Commands::Scan => run_scan_once(config).await?,
        Commands::Prices { codes } => show_prices(codes).await?,
        Commands::Status => show_status().await?,
    }

    Ok(())
}

fn credentials_from_env() -> Result<KisCredentials> {
    let env = |key: &str| std::env::var(key).with_context(|| format!("{} is not set", key));
    Ok(KisCredentials {
        app_key: env("KIS_APP_KEY")?,
        app_secret: env("KIS_APP_SECRET")?,
        account_no: env("KIS_ACCOUNT_NO")?,
        account_product: std::env::var("KIS_ACCOUNT_PRODUCT").unwrap_or_else(|_| "01".to_string()),
        hts_id: env("KIS_HTS_ID")?,
        sandbox: std::env::var("KIS_SANDBOX").map(|v| v == "1" || v == "true").unwrap_or(false),
    })
}

async fn run_trading(config: Arc<AppConfig>) -> Result<()> {
    let credentials = credentials_from_env()?;
    let sandbox = credentials.sandbox;
    info!("mode: {}", if sandbox { "sandbox" } else { "live" });

    let client = Arc::new(KisClient::new(credentials));
    let gateway: Arc<dyn BrokerGateway> = client.clone();

    let recorder = match &config.database_url {
        Some(url) => match TradeRecorder::new(url).await {
            Ok(recorder) => Some(Arc::new(recorder)),
            Err(e) => {
                warn!("trade record store unavailable, continuing without: {}", e);
                None
            }
        },
        None => match TradeRecorder::new("sqlite:./candle_bot.db").await {
            Ok(recorder) => Some(Arc::new(recorder)),
            Err(e) => {
                warn!("trade record store unavailable, continuing without: {}", e);
                None
            }
        },
    };

    let controller = Arc::new(EngineController::new_running());

    let approval_key = client
        .websocket_approval_key()
        .await
        .context("realtime stream approval key")?;
    let stream_config = StreamConfig {
        approval_key,
        hts_id: client.hts_id().to_string(),
        sandbox,
    };
    let feed = PriceFeed::start(Arc::clone(&gateway), stream_config, controller.shutdown_signal());

    let store = Arc::new(CandidateStore::new(
        config.store.max_watched,
        config.store.max_positions,
    ));
    let detector = Arc::new(PatternDetector::new(PatternConfig::new(
        config.pattern_config_path.clone(),
    )));
    let policy = Arc::new(RiskPolicy::new(PatternConfig::new(
        config.pattern_config_path.clone(),
    )));
    let condition = Arc::new(RwLock::new(MarketCondition::default()));

    let reconciler = Arc::new(ExecutionReconciler::new(
        Arc::clone(&gateway),
        Arc::clone(&store),
        Arc::clone(&feed),
        recorder.clone(),
        Arc::clone(&config),
    ));
    feed.register_execution_handler(reconciler.clone()).await;

    let scanner = MarketScanner::new(
        Arc::clone(&gateway),
        Arc::clone(&feed),
        Arc::clone(&store),
        Arc::clone(&detector),
        Arc::clone(&policy),
        recorder.clone(),
        Arc::clone(&condition),
        Arc::clone(&controller),
        config.scanner.clone(),
    );
    let evaluator = SignalEvaluator::new(
        Arc::clone(&feed),
        Arc::clone(&store),
        Arc::clone(&detector),
        Arc::clone(&controller),
        Arc::clone(&config),
    );
    let entry = EntryExecutor::new(
        Arc::clone(&gateway),
        Arc::clone(&store),
        Arc::clone(&condition),
        Arc::clone(&controller),
        config.executor.clone(),
    );
    let exit = ExitManager::new(
        Arc::clone(&gateway),
        Arc::clone(&feed),
        Arc::clone(&store),
        Arc::clone(&controller),
        config.exit.clone(),
    );

    let orchestrator = TradingOrchestrator::new(
        scanner,
        evaluator,
        entry,
        exit,
        reconciler,
        Arc::clone(&store),
        Arc::clone(&feed),
        Arc::clone(&controller),
        Arc::clone(&config),
    );

    {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received");
                controller.request_shutdown();
            }
        });
    }

    orchestrator.startup().await;
    orchestrator.run().await;
    Ok(())
}

async fn run_scan_once(config: Arc<AppConfig>) -> Result<()> {
    let client = Arc::new(KisClient::new(credentials_from_env()?));
    let gateway: Arc<dyn BrokerGateway> = client;
    let feed = PriceFeed::pull_only(Arc::clone(&gateway));
    let store = Arc::new(CandidateStore::new(
        config.store.max_watched,
        config.store.max_positions,
    ));
    let detector = Arc::new(PatternDetector::new(PatternConfig::new(
        config.pattern_config_path.clone(),
    )));
    let policy = Arc::new(RiskPolicy::new(PatternConfig::new(
        config.pattern_config_path.clone(),
    )));
    let condition = Arc::new(RwLock::new(MarketCondition::default()));
    let controller = Arc::new(EngineController::new_running());

    let scanner = MarketScanner::new(
        gateway,
        feed,
        Arc::clone(&store),
        detector,
        policy,
        None,
        condition,
        controller,
        config.scanner.clone(),
    );

    let seeded = scanner.tick().await;
    println!("\n=== Scan Results ({} candidates) ===", seeded);
    let mut candidates = store.all().await;
    candidates.sort_by(|a, b| b.entry_priority.cmp(&a.entry_priority));
    for c in candidates {
        let pattern = c
            .primary_pattern()
            .map(|p| format!("{} ({:.2})", p.kind, p.confidence))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} {:<20} {:>9} KRW | {} | signal {} ({}) | priority {} | target {} stop {}",
            c.stock_code,
            c.stock_name,
            c.current_price,
            pattern,
            c.trade_signal,
            c.signal_strength,
            c.entry_priority,
            c.risk_plan.target_price,
            c.risk_plan.stop_loss_price,
        );
    }
    Ok(())
}

async fn show_prices(codes: Vec<String>) -> Result<()> {
    if codes.is_empty() {
        error!("pass at least one 6-digit stock code");
        return Ok(());
    }
    let client = KisClient::new(credentials_from_env()?);

    println!("\n=== Current Prices ===");
    for code in codes {
        match client.current_price(&code).await {
            Ok(quote) => {
                let sign = if quote.day_change_pct >= 0.0 { "+" } else { "" };
                println!(
                    "{} {:<20} {:>9} KRW | {}{:.2}% | vol {}",
                    quote.stock_code,
                    quote.stock_name,
                    quote.current_price,
                    sign,
                    quote.day_change_pct,
                    quote.accumulated_volume
                );
            }
            Err(e) => error!("failed to get price for {}: {}", code, e),
        }
    }
    Ok(())
}

async fn show_status() -> Result<()> {
    let client = KisClient::new(credentials_from_env()?);
    let balance = client.balance().await?;

    println!("\n=== Account Status ===");
    println!("Buyable amount: {:>14} KRW", balance.available_amount);
    println!("Cash balance:   {:>14} KRW", balance.cash_balance);
    println!("Total value:    {:>14} KRW", balance.total_value);

    if balance.holdings.is_empty() {
        println!("No open holdings");
        return Ok(());
    }

    println!("\n{:<8} {:<20} {:>6} {:>10} {:>10} {:>8} {:>10}",
        "Code", "Name", "Qty", "Avg", "Now", "P&L %", "Est. tax");
    for h in &balance.holdings {
        // Securities transaction tax shown for reference only; decisions are
        // made on pre-tax P&L.
        let est_tax = (h.current_price * Decimal::from(h.quantity) * Decimal::new(18, 4)).round_dp(0);
        println!(
            "{:<8} {:<20} {:>6} {:>10} {:>10} {:>7.2}% {:>10}",
            h.stock_code, h.stock_name, h.quantity, h.average_price, h.current_price,
            h.profit_loss_rate, est_tax
        );
    }
    Ok(())
}
