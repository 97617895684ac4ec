#![allow(dead_code)]
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::info;

/// Run-state for the trading loop plus the cooperative shutdown signal every
/// long-running task selects on.
pub struct EngineController {
    running: AtomicBool,
    paused: AtomicBool,
    started_at: std::sync::RwLock<Option<DateTime<Utc>>>,
    orders_submitted: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl EngineController {
    pub fn new_running() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            started_at: std::sync::RwLock::new(Some(Utc::now())),
            orders_submitted: AtomicU64::new(0),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn request_shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("shutdown requested");
        }
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            info!("trading paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            info!("trading resumed");
        }
    }

    /// New orders may be placed only while running and not paused; exits and
    /// reconciliation keep working while paused to protect open positions.
    pub fn should_submit_orders(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.paused.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn record_order(&self) {
        self.orders_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn orders_submitted(&self) -> u64 {
        self.orders_submitted.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> i64 {
        self.started_at
            .read()
            .ok()
            .and_then(|s| *s)
            .map(|start| (Utc::now() - start).num_seconds().max(0))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_flips_signal_and_state() {
        let controller = EngineController::new_running();
        assert!(controller.is_running());
        assert!(!controller.is_shutting_down());
        controller.request_shutdown();
        assert!(!controller.is_running());
        assert!(controller.is_shutting_down());
        assert!(!controller.should_submit_orders());
    }

    #[test]
    fn pause_blocks_new_orders_only() {
        let controller = EngineController::new_running();
        controller.pause();
        assert!(!controller.should_submit_orders());
        assert!(controller.is_running());
        controller.resume();
        assert!(controller.should_submit_orders());
    }
}
