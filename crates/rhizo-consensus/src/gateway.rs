use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use rhizo_storage::ReplicaStore;
use rhizo_types::{CommitRecord, Operation, RejectReason};

use crate::{CommittedLogApplier, ConsensusService, Decision};

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Proposals sent before giving up, counting the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How often the background applier polls the committed log.
    pub apply_poll_interval_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
            apply_poll_interval_ms: 10,
        }
    }
}

/// Sends Generic operations through the consensus service and blocks until
/// they are ordered and applied locally.
///
/// Never falls back to the fast path: every failure ends in a rejected
/// `CommitRecord`.
pub struct ConsensusGateway<C, S> {
    consensus: Arc<C>,
    applier: Arc<CommittedLogApplier<C, S>>,
    config: GatewayConfig,
}

impl<C: ConsensusService, S: ReplicaStore> ConsensusGateway<C, S> {
    pub fn new(
        consensus: Arc<C>,
        applier: Arc<CommittedLogApplier<C, S>>,
        config: GatewayConfig,
    ) -> Self {
        ConsensusGateway { consensus, applier, config }
    }

    pub fn applier(&self) -> &Arc<CommittedLogApplier<C, S>> {
        &self.applier
    }

    /// Propose `op` and wait for a definitive outcome within `timeout`.
    ///
    /// Transient failures are retried with exponential backoff up to
    /// `max_attempts`; running out of attempts or time yields
    /// `ConsensusUnavailable`. Once committed, the call waits for the local
    /// apply however long the log takes to read back.
    pub async fn commit(&self, op: Operation, timeout: Duration) -> CommitRecord {
        let deadline = Instant::now() + timeout;
        let max_attempts = self.config.max_attempts.max(1);
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms);
        let mut backoff = Duration::from_millis(self.config.initial_backoff_ms);
        let mut attempts = 0u32;
        let op_id = op.id();

        self.applier.track(op_id).await;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            attempts += 1;

            match tokio::time::timeout(remaining, self.consensus.propose(op.clone())).await {
                Ok(Ok(Decision::Committed(order))) => {
                    tracing::debug!(op_id = %op_id, order, attempts, "consensus committed");
                    let poll = Duration::from_millis(self.config.apply_poll_interval_ms.max(1));
                    return self.applier.wait_applied(&op, order, poll).await;
                }
                Ok(Ok(Decision::Rejected(reason))) => {
                    tracing::warn!(op_id = %op_id, reason = %reason, "consensus rejected operation");
                    self.applier.forget(op_id).await;
                    return CommitRecord::rejected(op_id, RejectReason::ConsensusRejected(reason));
                }
                Ok(Err(e)) => {
                    tracing::warn!(op_id = %op_id, attempt = attempts, error = %e, "consensus proposal failed");
                }
                Err(_) => {
                    tracing::warn!(op_id = %op_id, attempt = attempts, "consensus proposal timed out");
                }
            }

            if attempts >= max_attempts {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(backoff.min(remaining)).await;
            backoff = (backoff * 2).min(max_backoff);
        }

        tracing::warn!(op_id = %op_id, attempts, "consensus unavailable, rejecting operation");
        self.applier.forget(op_id).await;
        CommitRecord::rejected(op_id, RejectReason::ConsensusUnavailable { attempts })
    }
}
