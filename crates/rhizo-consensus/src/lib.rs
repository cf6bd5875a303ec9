mod applier;
mod gateway;
mod stub;

use rhizo_types::{Operation, OrderToken, RhizoError};

pub use applier::CommittedLogApplier;
pub use gateway::{ConsensusGateway, GatewayConfig};
pub use stub::StubConsensusService;

/// Definitive answer from the consensus service for one proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Committed(OrderToken),
    Rejected(String),
}

/// One entry of the agreed total order.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommittedEntry {
    pub order: OrderToken,
    pub op: Operation,
}

// ---------------------------------------------------------------------------
// ConsensusService trait
// Uses RPITIT (Return Position Impl Trait In Trait, stable since Rust 1.75).
// The explicit `+ Send` bound on each future lets generic callers `.await`
// across thread boundaries.
// ---------------------------------------------------------------------------

/// External agreement protocol (Raft, Paxos, ...), treated as a black box.
///
/// `propose` must be idempotent per operation id: re-proposing an operation
/// that already committed returns its original order token.
pub trait ConsensusService: Send + Sync + 'static {
    /// `Err` means no decision was reached (no leader, no quorum, network
    /// failure) and the caller may retry. `Ok` is always definitive.
    fn propose(
        &self,
        op: Operation,
    ) -> impl std::future::Future<Output = Result<Decision, RhizoError>> + Send;

    /// Committed entries with `order > after`, ascending, at most `limit`.
    fn read_committed(
        &self,
        after: OrderToken,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<CommittedEntry>, RhizoError>> + Send;
}
