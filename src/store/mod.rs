use chrono::{Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::types::{Candidate, CandleStatus};

const EXITED_RETENTION_HOURS: i64 = 24;

/// In-memory candidate map keyed by stock code. Readers get cloned
/// snapshots; writers replace whole entries, which keeps the per-key
/// single-writer discipline at the call sites.
pub struct CandidateStore {
    inner: RwLock<HashMap<String, Candidate>>,
    max_watched: usize,
    max_positions: usize,
}

impl CandidateStore {
    pub fn new(max_watched: usize, max_positions: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_watched,
            max_positions,
        }
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// Inserts a new candidate. At watch capacity the lowest-priority
    /// WATCHING entry is evicted to make room; ENTERED rows are never
    /// evicted. Returns false when the candidate could not be placed.
    pub async fn add(&self, candidate: Candidate) -> bool {
        let mut map = self.inner.write().await;
        if map.contains_key(&candidate.stock_code) {
            map.insert(candidate.stock_code.clone(), candidate);
            return true;
        }

        let watched = map
            .values()
            .filter(|c| !c.status.is_terminal() && c.status != CandleStatus::Entered)
            .count();
        // Holdings seeded by reconciliation are never capacity-limited here;
        // the entry executor enforces the positions cap before ordering.
        if candidate.status != CandleStatus::Entered && watched >= self.max_watched {
            let evictee = map
                .values()
                .filter(|c| c.status == CandleStatus::Watching)
                .min_by_key(|c| c.entry_priority)
                .map(|c| c.stock_code.clone());
            match evictee {
                Some(code) if candidate.entry_priority
                    > map.get(&code).map(|c| c.entry_priority).unwrap_or(i32::MAX) =>
                {
                    info!("store full, evicting lowest-priority watcher {}", code);
                    map.remove(&code);
                }
                _ => {
                    warn!(
                        "store full ({} watched), rejecting {}",
                        watched, candidate.stock_code
                    );
                    return false;
                }
            }
        }

        map.insert(candidate.stock_code.clone(), candidate);
        true
    }

    /// Atomic replace by stock code; refuses updates that would take an
    /// illegal status edge and forces the row into STOPPED instead.
    pub async fn update(&self, candidate: Candidate) {
        let mut map = self.inner.write().await;
        if let Some(existing) = map.get(&candidate.stock_code) {
            let from = existing.status;
            let to = candidate.status;
            if from != to && !from.can_transition(to) {
                warn!(
                    "illegal status transition {} -> {} for {}, stopping candidate: {:?}",
                    from, to, candidate.stock_code, existing
                );
                let mut stopped = candidate;
                stopped.status = CandleStatus::Stopped;
                map.insert(stopped.stock_code.clone(), stopped);
                return;
            }
        }
        map.insert(candidate.stock_code.clone(), candidate);
    }

    pub async fn remove(&self, stock_code: &str) -> Option<Candidate> {
        self.inner.write().await.remove(stock_code)
    }

    pub async fn get(&self, stock_code: &str) -> Option<Candidate> {
        self.inner.read().await.get(stock_code).cloned()
    }

    pub async fn contains(&self, stock_code: &str) -> bool {
        self.inner.read().await.contains_key(stock_code)
    }

    pub async fn get_by_state(&self, states: &[CandleStatus]) -> Vec<Candidate> {
        self.inner
            .read()
            .await
            .values()
            .filter(|c| states.contains(&c.status))
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<Candidate> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Open positions plus unresolved buy orders, the number the entry
    /// executor compares against the positions cap.
    pub async fn committed_position_count(&self) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|c| {
                c.status == CandleStatus::Entered
                    || (c.status == CandleStatus::PendingOrder && c.pending_buy_order_no.is_some())
            })
            .count()
    }

    /// Sweeps EXITED rows older than the retention window.
    pub async fn cleanup_old_exited(&self) -> usize {
        let cutoff = Utc::now() - Duration::hours(EXITED_RETENTION_HOURS);
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, c| c.status != CandleStatus::Exited || c.last_updated > cutoff);
        let removed = before - map.len();
        if removed > 0 {
            info!("cleaned up {} exited candidates", removed);
        }
        removed
    }
}
