use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

mod merge;
mod state;

pub use merge::MergeRule;
pub use state::OperationState;

pub type ReplicaId = u64;
pub type Key = String;

/// Position of a committed Generic operation in the global consensus order.
/// Starts at 1; 0 means "nothing applied yet".
pub type OrderToken = u64;

/// An ordered list of operations submitted together.
pub type Batch = Vec<Operation>;

/// Unique operation identifier. Delivery dedup keys on this.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct OperationId(pub uuid::Uuid);

impl OperationId {
    pub fn new() -> Self {
        OperationId(uuid::Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Operation kinds and algebraic classes
// ---------------------------------------------------------------------------

/// Tag naming the mutation an operation performs.
///
/// The built-in kinds are matched exhaustively; anything else is an
/// `Extension` that only gains meaning through the classification table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationKind {
    Add,
    Max,
    Min,
    Union,
    Overwrite,
    CompareAndSwap,
    Delete,
    Extension(String),
}

impl OperationKind {
    pub fn builtins() -> [OperationKind; 7] {
        [
            OperationKind::Add,
            OperationKind::Max,
            OperationKind::Min,
            OperationKind::Union,
            OperationKind::Overwrite,
            OperationKind::CompareAndSwap,
            OperationKind::Delete,
        ]
    }

    /// Build a kind from its registered name. Built-in names resolve to the
    /// built-in variant, so `extension("max")` is `Max`.
    pub fn extension(name: impl Into<String>) -> Self {
        OperationKind::from(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Add => "add",
            OperationKind::Max => "max",
            OperationKind::Min => "min",
            OperationKind::Union => "union",
            OperationKind::Overwrite => "overwrite",
            OperationKind::CompareAndSwap => "compare_and_swap",
            OperationKind::Delete => "delete",
            OperationKind::Extension(name) => name,
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, OperationKind::Extension(_))
    }

    /// The combination function a built-in algebraic kind is defined by.
    pub fn natural_merge(&self) -> Option<MergeRule> {
        match self {
            OperationKind::Add => Some(MergeRule::Sum),
            OperationKind::Max => Some(MergeRule::Max),
            OperationKind::Min => Some(MergeRule::Min),
            OperationKind::Union => Some(MergeRule::Union),
            OperationKind::Overwrite
            | OperationKind::CompareAndSwap
            | OperationKind::Delete
            | OperationKind::Extension(_) => None,
        }
    }
}

impl From<String> for OperationKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "add" => OperationKind::Add,
            "max" => OperationKind::Max,
            "min" => OperationKind::Min,
            "union" => OperationKind::Union,
            "overwrite" => OperationKind::Overwrite,
            "compare_and_swap" => OperationKind::CompareAndSwap,
            "delete" => OperationKind::Delete,
            _ => OperationKind::Extension(name),
        }
    }
}

impl From<&str> for OperationKind {
    fn from(name: &str) -> Self {
        OperationKind::from(name.to_owned())
    }
}

impl From<OperationKind> for String {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Extension(name) => name,
            other => other.as_str().to_owned(),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgebraicClass {
    /// Idempotent, commutative, associative (max, min, set union).
    Semilattice,
    /// Commutative, associative, invertible (signed addition).
    AbelianGroup,
    /// No algebraic guarantee; needs a global order.
    Generic,
}

impl AlgebraicClass {
    pub fn is_coordination_free(self) -> bool {
        !matches!(self, AlgebraicClass::Generic)
    }
}

impl fmt::Display for AlgebraicClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlgebraicClass::Semilattice => "semilattice",
            AlgebraicClass::AbelianGroup => "abelian_group",
            AlgebraicClass::Generic => "generic",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPath {
    Fast,
    Consensus,
}

impl fmt::Display for CommitPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommitPath::Fast => "fast",
            CommitPath::Consensus => "consensus",
        })
    }
}

// ---------------------------------------------------------------------------
// Values, payloads, operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
}

impl Value {
    pub fn set<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Set(items.into_iter().map(Into::into).collect())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Set(_) => "set",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Payload {
    /// Operand for merges and overwrites.
    Value(Value),
    /// Compare-and-swap; `expected == None` means "key must be absent".
    Swap { expected: Option<Value>, new: Value },
    /// Used by `Delete`.
    Empty,
}

/// One requested mutation. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Operation {
    id: OperationId,
    keys: BTreeSet<Key>,
    kind: OperationKind,
    payload: Payload,
    origin: ReplicaId,
    timestamp: u64,
}

impl Operation {
    pub fn new<I, K>(
        origin: ReplicaId,
        timestamp: u64,
        keys: I,
        kind: OperationKind,
        payload: Payload,
    ) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        Operation {
            id: OperationId::new(),
            keys: keys.into_iter().map(Into::into).collect(),
            kind,
            payload,
            origin,
            timestamp,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn keys(&self) -> &BTreeSet<Key> {
        &self.keys
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn origin(&self) -> ReplicaId {
        self.origin
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

// ---------------------------------------------------------------------------
// Commit records
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("consensus unavailable after {attempts} attempts; retry later or check quorum health")]
    ConsensusUnavailable { attempts: u32 },
    #[error("consensus service rejected the operation: {0}")]
    ConsensusRejected(String),
    #[error("compare-and-swap precondition did not hold")]
    PreconditionFailed,
    /// Ordered by consensus but the current value could not take it.
    #[error("committed but not applicable to the current value: {0}")]
    Inapplicable(String),
}

/// Outcome of one operation. `values` holds the resulting value of every
/// key the operation touched (`None` = absent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub op_id: OperationId,
    pub accepted: bool,
    pub path: CommitPath,
    pub values: BTreeMap<Key, Option<Value>>,
    pub order: Option<OrderToken>,
    pub reason: Option<RejectReason>,
}

impl CommitRecord {
    pub fn fast(op_id: OperationId, values: BTreeMap<Key, Option<Value>>) -> Self {
        CommitRecord {
            op_id,
            accepted: true,
            path: CommitPath::Fast,
            values,
            order: None,
            reason: None,
        }
    }

    pub fn committed(
        op_id: OperationId,
        order: OrderToken,
        values: BTreeMap<Key, Option<Value>>,
    ) -> Self {
        CommitRecord {
            op_id,
            accepted: true,
            path: CommitPath::Consensus,
            values,
            order: Some(order),
            reason: None,
        }
    }

    /// Ordered by consensus but its precondition failed when applied.
    pub fn precondition_failed(
        op_id: OperationId,
        order: OrderToken,
        values: BTreeMap<Key, Option<Value>>,
    ) -> Self {
        CommitRecord {
            op_id,
            accepted: false,
            path: CommitPath::Consensus,
            values,
            order: Some(order),
            reason: Some(RejectReason::PreconditionFailed),
        }
    }

    pub fn inapplicable(op_id: OperationId, order: OrderToken, detail: String) -> Self {
        CommitRecord {
            op_id,
            accepted: false,
            path: CommitPath::Consensus,
            values: BTreeMap::new(),
            order: Some(order),
            reason: Some(RejectReason::Inapplicable(detail)),
        }
    }

    pub fn rejected(op_id: OperationId, reason: RejectReason) -> Self {
        CommitRecord {
            op_id,
            accepted: false,
            path: CommitPath::Consensus,
            values: BTreeMap::new(),
            order: None,
            reason: Some(reason),
        }
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key).and_then(Option::as_ref)
    }

    /// Terminal state this record represents.
    pub fn state(&self) -> OperationState {
        match (self.path, self.accepted) {
            (CommitPath::Fast, _) => OperationState::FastCommitted,
            (CommitPath::Consensus, true) => OperationState::ConsensusCommitted,
            (CommitPath::Consensus, false) => OperationState::ConsensusRejected,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum RhizoError {
    #[error("batch mixes {algebraic} coordination-free and {generic} generic operations")]
    MixedClassBatch { algebraic: usize, generic: usize },
    #[error("schema conflict in key family '{family}': {detail}")]
    SchemaConflict { family: String, detail: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(
        "key '{key}' belongs to family '{family}' ({family_class}); {kind} is {kind_class}"
    )]
    KeyFamilyMismatch {
        key: Key,
        family: String,
        family_class: AlgebraicClass,
        kind: OperationKind,
        kind_class: AlgebraicClass,
    },
    #[error("operation kind {0} is not coordination-free")]
    NotCoordinationFree(OperationKind),
    #[error("consensus error: {0}")]
    Consensus(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("illegal operation state transition {from:?} -> {to:?}")]
    IllegalTransition { from: OperationState, to: OperationState },
}
