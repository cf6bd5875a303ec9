use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use rhizo_classifier::{Classifier, Route};
use rhizo_consensus::{ConsensusGateway, ConsensusService};
use rhizo_storage::ReplicaStore;
use rhizo_types::{Batch, CommitPath, CommitRecord, OperationState, RhizoError};

use crate::config::{MixedBatchPolicy, RouterConfig};
use crate::fast_path::CoordinationFreeEngine;
use crate::metrics::{reject_label, NoopMetrics, RouterMetrics};

/// Entry point for client batches.
///
/// Classifies every member, rejects or splits mixed batches per
/// [`MixedBatchPolicy`], and sends each operation down exactly one path.
/// A Generic operation never reaches the coordination-free engine: the only
/// way to `FastCommitted` is through an algebraic classification and a
/// `Route::Fast` decision.
pub struct TransactionRouter<S, C> {
    classifier: Arc<Classifier>,
    fast: Arc<CoordinationFreeEngine<S>>,
    gateway: Arc<ConsensusGateway<C, S>>,
    config: RouterConfig,
    metrics: Arc<dyn RouterMetrics>,
}

impl<S: ReplicaStore, C: ConsensusService> TransactionRouter<S, C> {
    pub fn new(
        classifier: Arc<Classifier>,
        fast: Arc<CoordinationFreeEngine<S>>,
        gateway: Arc<ConsensusGateway<C, S>>,
        config: RouterConfig,
    ) -> Self {
        TransactionRouter { classifier, fast, gateway, config, metrics: Arc::new(NoopMetrics) }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn RouterMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn classifier(&self) -> &Arc<Classifier> {
        &self.classifier
    }

    /// Submit with the configured default timeout.
    pub async fn submit(&self, batch: Batch) -> Result<Vec<CommitRecord>, RhizoError> {
        let timeout = Duration::from_millis(self.config.default_timeout_ms);
        self.submit_with_timeout(batch, timeout).await
    }

    /// Commit every operation of `batch` and return one record per member,
    /// in batch order.
    ///
    /// `timeout` bounds each consensus-path member separately. Whole-batch
    /// failures (mixed classes under `Reject`, a bad payload, a key family
    /// mismatch) are detected before any member is applied.
    pub async fn submit_with_timeout(
        &self,
        batch: Batch,
        timeout: Duration,
    ) -> Result<Vec<CommitRecord>, RhizoError> {
        let mut classes = Vec::with_capacity(batch.len());
        let mut states = Vec::with_capacity(batch.len());
        let mut algebraic = 0;
        for op in &batch {
            let class = self.classifier.classify(op.kind());
            if class.is_coordination_free() {
                algebraic += 1;
            }
            classes.push(class);
            states.push(OperationState::Submitted.advance(OperationState::Classified(class))?);
        }

        let generic = batch.len() - algebraic;
        if algebraic > 0 && generic > 0 {
            match self.config.mixed_batch_policy {
                MixedBatchPolicy::Reject => {
                    tracing::warn!(algebraic, generic, "rejecting mixed-class batch");
                    self.metrics.record_rejection("mixed_class_batch");
                    return Err(RhizoError::MixedClassBatch { algebraic, generic });
                }
                MixedBatchPolicy::Split => {
                    tracing::debug!(algebraic, generic, "splitting mixed-class batch across paths");
                }
            }
        }

        let mut routes = Vec::with_capacity(batch.len());
        for (op, class) in batch.iter().zip(classes) {
            let route = self
                .classifier
                .validate_payload(op)
                .and_then(|()| self.classifier.route_classified(op, class));
            match route {
                Ok(route) => routes.push(route),
                Err(e) => {
                    tracing::debug!(op_id = %op.id(), kind = %op.kind(), error = %e, "batch refused");
                    self.metrics.record_rejection(refusal_label(&e));
                    return Err(e);
                }
            }
        }

        let mut records = Vec::with_capacity(batch.len());
        for ((op, route), state) in batch.into_iter().zip(routes).zip(states) {
            let started = Instant::now();
            let record = match route {
                Route::Fast => {
                    let record = self.fast.apply_local(&op)?;
                    state.advance(OperationState::FastCommitted)?;
                    record
                }
                Route::Consensus { escalated } => {
                    let pending = state.advance(OperationState::ConsensusPending)?;
                    tracing::trace!(op_id = %op.id(), escalated, "awaiting consensus");
                    let record = self.gateway.commit(op, timeout).await;
                    pending.advance(record.state())?;
                    record
                }
            };

            match &record.reason {
                None => self.metrics.record_commit(record.path, started.elapsed()),
                Some(reason) => self.metrics.record_rejection(reject_label(reason)),
            }
            if record.path == CommitPath::Fast {
                tracing::trace!(op_id = %record.op_id, "fast-path commit");
            }
            records.push(record);
        }
        Ok(records)
    }
}

fn refusal_label(e: &RhizoError) -> &'static str {
    match e {
        RhizoError::InvalidPayload(_) => "invalid_payload",
        RhizoError::KeyFamilyMismatch { .. } => "key_family_mismatch",
        _ => "refused",
    }
}
