use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

use crate::types::{Candidate, PatternInfo};

/// Best-effort trade/candidate record store. Every write is fire-and-forget
/// from the engine's point of view: callers log failures and keep trading.
pub struct TradeRecorder {
    pool: SqlitePool,
}

impl TradeRecorder {
    pub async fn new(db_url: &str) -> Result<Self> {
        info!("initializing trade record store at {}", db_url);
        let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let recorder = Self { pool };
        recorder.create_schema().await?;
        Ok(recorder)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candle_candidates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL,
                stock_code TEXT NOT NULL,
                stock_name TEXT NOT NULL,
                market TEXT NOT NULL,
                current_price TEXT NOT NULL,
                pattern_type TEXT NOT NULL,
                pattern_strength INTEGER NOT NULL,
                pattern_confidence REAL NOT NULL,
                trade_signal TEXT NOT NULL,
                signal_strength INTEGER NOT NULL,
                entry_priority INTEGER NOT NULL,
                risk_score INTEGER NOT NULL,
                target_price TEXT NOT NULL,
                stop_loss_price TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_candidates_code ON candle_candidates(stock_code)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candle_patterns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL,
                stock_code TEXT NOT NULL,
                pattern_type TEXT NOT NULL,
                confidence REAL NOT NULL,
                strength INTEGER NOT NULL,
                description TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stock_code TEXT NOT NULL,
                stock_name TEXT NOT NULL,
                opened_at TEXT,
                entry_price TEXT,
                quantity INTEGER NOT NULL,
                closed_at TEXT,
                exit_price TEXT,
                exit_reason TEXT,
                realized_pnl TEXT,
                pnl_pct REAL,
                status TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_stats (
                trade_date TEXT PRIMARY KEY,
                buys INTEGER NOT NULL DEFAULT 0,
                sells INTEGER NOT NULL DEFAULT 0,
                realized_pnl TEXT NOT NULL DEFAULT '0'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records a freshly scanned candidate; returns the row id for metadata.
    pub async fn record_candle_candidate(&self, candidate: &Candidate) -> Result<i64> {
        let primary = candidate.primary_pattern();
        let result = sqlx::query(
            r#"
            INSERT INTO candle_candidates (
                recorded_at, stock_code, stock_name, market, current_price,
                pattern_type, pattern_strength, pattern_confidence,
                trade_signal, signal_strength, entry_priority, risk_score,
                target_price, stop_loss_price
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&candidate.stock_code)
        .bind(&candidate.stock_name)
        .bind(candidate.market_type.as_str())
        .bind(candidate.current_price.to_string())
        .bind(primary.map(|p| p.kind.as_str()).unwrap_or("none"))
        .bind(primary.map(|p| p.strength).unwrap_or(0))
        .bind(primary.map(|p| p.confidence).unwrap_or(0.0))
        .bind(candidate.trade_signal.as_str())
        .bind(candidate.signal_strength)
        .bind(candidate.entry_priority)
        .bind(candidate.risk_plan.risk_score)
        .bind(candidate.risk_plan.target_price.to_string())
        .bind(candidate.risk_plan.stop_loss_price.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn record_candle_pattern(&self, stock_code: &str, pattern: &PatternInfo) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO candle_patterns (
                recorded_at, stock_code, pattern_type, confidence, strength, description
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(stock_code)
        .bind(pattern.kind.as_str())
        .bind(pattern.confidence)
        .bind(pattern.strength)
        .bind(&pattern.description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_position_open(&self, candidate: &Candidate) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO positions (
                stock_code, stock_name, opened_at, entry_price, quantity, status
            ) VALUES (?, ?, ?, ?, ?, 'open')
            "#,
        )
        .bind(&candidate.stock_code)
        .bind(&candidate.stock_name)
        .bind(candidate.performance.entry_time.map(|t| t.to_rfc3339()))
        .bind(candidate.performance.entry_price.map(|p| p.to_string()))
        .bind(candidate.performance.entry_quantity)
        .execute(&self.pool)
        .await?;

        self.bump_daily_stats(true, "0").await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn record_position_close(&self, candidate: &Candidate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions SET
                closed_at = ?, exit_price = ?, exit_reason = ?,
                realized_pnl = ?, pnl_pct = ?, status = 'closed'
            WHERE stock_code = ? AND status = 'open'
            "#,
        )
        .bind(candidate.performance.exit_time.map(|t| t.to_rfc3339()))
        .bind(candidate.performance.exit_price.map(|p| p.to_string()))
        .bind(candidate.performance.exit_reason.clone())
        .bind(candidate.performance.realized_pnl.map(|p| p.to_string()))
        .bind(candidate.performance.pnl_pct)
        .bind(&candidate.stock_code)
        .execute(&self.pool)
        .await?;

        let pnl = candidate
            .performance
            .realized_pnl
            .map(|p| p.to_string())
            .unwrap_or_else(|| "0".to_string());
        self.bump_daily_stats(false, &pnl).await?;
        Ok(())
    }

    async fn bump_daily_stats(&self, buy: bool, realized_pnl: &str) -> Result<()> {
        let today = crate::config::today_kst().format("%Y-%m-%d").to_string();
        sqlx::query(
            "INSERT INTO daily_stats (trade_date) VALUES (?) ON CONFLICT(trade_date) DO NOTHING",
        )
        .bind(&today)
        .execute(&self.pool)
        .await?;

        if buy {
            sqlx::query("UPDATE daily_stats SET buys = buys + 1 WHERE trade_date = ?")
                .bind(&today)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE daily_stats SET
                    sells = sells + 1,
                    realized_pnl = CAST(CAST(realized_pnl AS REAL) + CAST(? AS REAL) AS TEXT)
                WHERE trade_date = ?
                "#,
            )
            .bind(realized_pnl)
            .bind(&today)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn daily_stats(&self, trade_date: &str) -> Result<Option<(i64, i64, String)>> {
        let row = sqlx::query(
            "SELECT buys, sells, realized_pnl FROM daily_stats WHERE trade_date = ?",
        )
        .bind(trade_date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| (r.get("buys"), r.get("sells"), r.get("realized_pnl"))))
    }
}
