use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use rhizo_classifier::{Classifier, Route};
use rhizo_storage::{ApplyStatus, ReplicaStore};
use rhizo_types::{CommitRecord, Key, MergeRule, Operation, OperationId, Payload, ReplicaId, RhizoError, Value};

use crate::gossip::Gossip;

/// Applies Semilattice and AbelianGroup operations with no synchronous
/// coordination.
///
/// A local apply is one in-memory merge under the touched keys' locks,
/// followed by a fire-and-forget hand-off to gossip. Group deltas are
/// deduplicated by operation id, so they are counted exactly once under
/// at-least-once transport. Semilattice merges need no such record.
pub struct CoordinationFreeEngine<S> {
    replica: ReplicaId,
    classifier: Arc<Classifier>,
    store: Arc<S>,
    gossip: Option<Arc<Gossip>>,
}

impl<S: ReplicaStore> CoordinationFreeEngine<S> {
    pub fn new(replica: ReplicaId, classifier: Arc<Classifier>, store: Arc<S>) -> Self {
        CoordinationFreeEngine { replica, classifier, store, gossip: None }
    }

    pub fn with_gossip(mut self, gossip: Arc<Gossip>) -> Self {
        self.gossip = Some(gossip);
        self
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Merge `op` into local state and queue it for peers.
    ///
    /// Fails only if `op` is not coordination-free or carries a payload its
    /// merge rule cannot take; the router checks both before calling.
    pub fn apply_local(&self, op: &Operation) -> Result<CommitRecord, RhizoError> {
        let (rule, delta) = self.merge_parts(op)?;
        let applied = self.store.mutate(dedup_id(rule, op), op.keys(), |current| merge_all(rule, current, delta))?;

        if applied.status != ApplyStatus::Duplicate {
            if let Some(gossip) = &self.gossip {
                gossip.disseminate(op);
            }
        }
        Ok(CommitRecord::fast(op.id(), applied.values))
    }

    /// Merge an operation received from a peer. Returns `false` when it was
    /// dropped or is a group delta already counted here.
    pub fn apply_remote(&self, op: &Operation) -> Result<bool, RhizoError> {
        // Re-check against the local table: a peer never gets to decide
        // that an operation skips consensus here.
        match self.classifier.route(op) {
            Ok(Route::Fast) => {}
            Ok(route) => {
                tracing::warn!(
                    op_id = %op.id(),
                    kind = %op.kind(),
                    origin = op.origin(),
                    ?route,
                    "dropping gossiped operation that is not coordination-free here"
                );
                return Ok(false);
            }
            Err(e) => {
                tracing::warn!(op_id = %op.id(), origin = op.origin(), error = %e, "dropping gossiped operation");
                return Ok(false);
            }
        }

        let (rule, delta) = self.merge_parts(op)?;
        let applied = self.store.mutate(dedup_id(rule, op), op.keys(), |current| merge_all(rule, current, delta))?;
        Ok(applied.status != ApplyStatus::Duplicate)
    }

    /// Apply inbound gossip until the stream closes.
    pub async fn run_inbound(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Operation>) {
        while let Some(op) = inbound.recv().await {
            match self.apply_remote(&op) {
                Ok(true) => tracing::trace!(op_id = %op.id(), origin = op.origin(), "merged remote operation"),
                Ok(false) => {}
                Err(e) => tracing::warn!(op_id = %op.id(), error = %e, "failed to merge remote operation"),
            }
        }
    }

    fn merge_parts<'a>(&self, op: &'a Operation) -> Result<(MergeRule, &'a Value), RhizoError> {
        // Only algebraic kinds carry a merge rule.
        let rule = self
            .classifier
            .merge_rule(op.kind())
            .ok_or_else(|| RhizoError::NotCoordinationFree(op.kind().clone()))?;
        match op.payload() {
            Payload::Value(delta) if rule.accepts(delta) => Ok((rule, delta)),
            other => Err(RhizoError::InvalidPayload(format!("{} cannot merge {other:?}", op.kind()))),
        }
    }
}

/// Semilattice merges absorb replays, so only group deltas are tracked.
fn dedup_id(rule: MergeRule, op: &Operation) -> Option<OperationId> {
    (!rule.is_idempotent()).then_some(op.id())
}

fn merge_all(
    rule: MergeRule,
    current: &BTreeMap<Key, Option<Value>>,
    delta: &Value,
) -> Result<Option<BTreeMap<Key, Option<Value>>>, RhizoError> {
    current
        .iter()
        .map(|(k, v)| Ok((k.clone(), Some(rule.merge(v.as_ref(), delta)?))))
        .collect::<Result<BTreeMap<_, _>, RhizoError>>()
        .map(Some)
}
