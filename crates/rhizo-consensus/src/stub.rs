use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use rhizo_types::{Operation, OperationId, OrderToken, RhizoError};

use crate::{CommittedEntry, ConsensusService, Decision};

// ---------------------------------------------------------------------------
// StubConsensusService: in-memory single log, no real agreement protocol
// ---------------------------------------------------------------------------

struct StubInner {
    log: Vec<CommittedEntry>,
    by_id: HashMap<OperationId, OrderToken>,
    reject_reason: Option<String>,
}

/// Shared by every replica in one process. Orders proposals by arrival.
pub struct StubConsensusService {
    inner: Arc<RwLock<StubInner>>,
    reachable: AtomicBool,
    round_trip: Duration,
    proposals: AtomicU64,
}

impl StubConsensusService {
    pub fn new() -> Self {
        Self::with_round_trip(Duration::ZERO)
    }

    /// Every `propose` waits `round_trip` before answering.
    pub fn with_round_trip(round_trip: Duration) -> Self {
        StubConsensusService {
            inner: Arc::new(RwLock::new(StubInner {
                log: Vec::new(),
                by_id: HashMap::new(),
                reject_reason: None,
            })),
            reachable: AtomicBool::new(true),
            round_trip,
            proposals: AtomicU64::new(0),
        }
    }

    /// Simulate losing (or regaining) quorum.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make every subsequent proposal end in a definitive rejection.
    pub async fn set_rejecting(&self, reason: Option<String>) {
        self.inner.write().await.reject_reason = reason;
    }

    /// Number of `propose` calls received, including failed ones.
    pub fn proposals(&self) -> u64 {
        self.proposals.load(Ordering::SeqCst)
    }

    pub async fn committed_len(&self) -> usize {
        self.inner.read().await.log.len()
    }
}

impl Default for StubConsensusService {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsensusService for StubConsensusService {
    async fn propose(&self, op: Operation) -> Result<Decision, RhizoError> {
        self.proposals.fetch_add(1, Ordering::SeqCst);
        if !self.round_trip.is_zero() {
            tokio::time::sleep(self.round_trip).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RhizoError::Consensus("no quorum reachable".into()));
        }

        let mut g = self.inner.write().await;
        if let Some(&order) = g.by_id.get(&op.id()) {
            return Ok(Decision::Committed(order));
        }
        if let Some(reason) = g.reject_reason.clone() {
            return Ok(Decision::Rejected(reason));
        }
        let order = g.log.len() as OrderToken + 1;
        g.by_id.insert(op.id(), order);
        g.log.push(CommittedEntry { order, op });
        Ok(Decision::Committed(order))
    }

    async fn read_committed(
        &self,
        after: OrderToken,
        limit: usize,
    ) -> Result<Vec<CommittedEntry>, RhizoError> {
        let g = self.inner.read().await;
        // Order tokens are 1-based positions, so `after` is also a slice index.
        let start = (after as usize).min(g.log.len());
        Ok(g.log[start..].iter().take(limit).cloned().collect())
    }
}
