use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use rhizo_classifier::Classifier;
use rhizo_storage::{ApplyStatus, ReplicaStore, Snapshot};
use rhizo_types::{CommitRecord, Key, Operation, OperationId, OrderToken, Payload, RhizoError, Value};

use crate::{CommittedEntry, ConsensusService};

/// Entries fetched per `read_committed` call.
const APPLY_BATCH: usize = 256;

#[derive(Default)]
struct ApplierState {
    /// Operations proposed through this replica's gateway, awaiting apply.
    pending: HashSet<OperationId>,
    outcomes: HashMap<OperationId, CommitRecord>,
}

/// Applies the committed consensus log to one replica, strictly in order.
///
/// Generic operations become visible on a replica only here, after the
/// consensus service has ordered them.
pub struct CommittedLogApplier<C, S> {
    consensus: Arc<C>,
    store: Arc<S>,
    classifier: Arc<Classifier>,
    state: Mutex<ApplierState>,
}

impl<C: ConsensusService, S: ReplicaStore> CommittedLogApplier<C, S> {
    pub fn new(consensus: Arc<C>, store: Arc<S>, classifier: Arc<Classifier>) -> Self {
        CommittedLogApplier { consensus, store, classifier, state: Mutex::new(ApplierState::default()) }
    }

    /// Keep the outcome of `op_id` when it is applied, for [`Self::wait_applied`].
    pub async fn track(&self, op_id: OperationId) {
        self.state.lock().await.pending.insert(op_id);
    }

    pub async fn forget(&self, op_id: OperationId) {
        let mut state = self.state.lock().await;
        state.pending.remove(&op_id);
        state.outcomes.remove(&op_id);
    }

    /// Apply every committed entry not yet applied here. Returns the new
    /// cursor.
    pub async fn catch_up(&self) -> Result<OrderToken, RhizoError> {
        let mut state = self.state.lock().await;
        self.catch_up_locked(&mut state).await
    }

    /// Snapshot the replica between two log entries. Holds the apply lock so
    /// the cursor and the cells describe the same prefix of the log.
    pub async fn snapshot(&self) -> Result<Snapshot, RhizoError> {
        let _state = self.state.lock().await;
        self.store.build_snapshot()
    }

    async fn catch_up_locked(&self, state: &mut ApplierState) -> Result<OrderToken, RhizoError> {
        loop {
            let after = self.store.last_applied();
            let entries = self.consensus.read_committed(after, APPLY_BATCH).await?;
            if entries.is_empty() {
                return Ok(after);
            }
            for entry in entries {
                let record = self.apply_entry(&entry);
                self.store.set_last_applied(entry.order);
                let id = entry.op.id();
                if state.pending.remove(&id) {
                    state.outcomes.insert(id, record);
                }
            }
        }
    }

    /// Catch up through `order` and return the outcome of `op`.
    ///
    /// `op` is already committed, so there is no failure to report: a
    /// failed log read is retried every `poll` until the entry is applied.
    pub async fn wait_applied(&self, op: &Operation, order: OrderToken, poll: Duration) -> CommitRecord {
        loop {
            if let Some(record) = self.take_outcome(op.id()).await {
                return record;
            }
            match self.catch_up().await {
                Ok(cursor) if cursor >= order => {
                    if let Some(record) = self.take_outcome(op.id()).await {
                        return record;
                    }
                    // Applied before it was tracked; report the current values.
                    self.forget(op.id()).await;
                    return CommitRecord::committed(op.id(), order, self.current_values(op));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(op_id = %op.id(), order, error = %e, "reading committed log failed, retrying");
                }
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn take_outcome(&self, op_id: OperationId) -> Option<CommitRecord> {
        self.state.lock().await.outcomes.remove(&op_id)
    }

    #[cfg(test)]
    pub(crate) async fn tracked(&self) -> usize {
        let state = self.state.lock().await;
        state.pending.len() + state.outcomes.len()
    }

    /// Poll the committed log until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if let Err(e) = self.catch_up().await {
                tracing::debug!(error = %e, "committed log catch-up failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn current_values(&self, op: &Operation) -> BTreeMap<Key, Option<Value>> {
        op.keys()
            .iter()
            .map(|k| (k.clone(), self.store.get(k).and_then(|s| s.value)))
            .collect()
    }

    fn apply_entry(&self, entry: &CommittedEntry) -> CommitRecord {
        let op = &entry.op;
        let merge = self
            .classifier
            .merge_rule(op.kind())
            .or_else(|| op.kind().natural_merge());
        let mut precondition_failed = false;

        let result = self.store.mutate(Some(op.id()), op.keys(), |current| {
            let updates = match op.payload() {
                Payload::Value(delta) => match merge {
                    Some(rule) => current
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), Some(rule.merge(v.as_ref(), delta)?))))
                        .collect::<Result<BTreeMap<_, _>, RhizoError>>()?,
                    None => current.keys().map(|k| (k.clone(), Some(delta.clone()))).collect(),
                },
                Payload::Empty => current.keys().map(|k| (k.clone(), None)).collect(),
                Payload::Swap { expected, new } => {
                    if current.values().any(|v| v != expected) {
                        precondition_failed = true;
                        return Ok(None);
                    }
                    current.keys().map(|k| (k.clone(), Some(new.clone()))).collect()
                }
            };
            Ok(Some(updates))
        });

        match result {
            Ok(applied) if applied.status == ApplyStatus::Unchanged && precondition_failed => {
                CommitRecord::precondition_failed(op.id(), entry.order, applied.values)
            }
            Ok(applied) => CommitRecord::committed(op.id(), entry.order, applied.values),
            Err(e) => {
                tracing::warn!(op_id = %op.id(), order = entry.order, error = %e, "committed entry not applicable");
                CommitRecord::inapplicable(op.id(), entry.order, e.to_string())
            }
        }
    }
}
