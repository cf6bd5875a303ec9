use crate::{AlgebraicClass, RhizoError};

/// Lifecycle of a single operation inside the router.
///
/// `Submitted -> Classified -> {FastCommitted | ConsensusPending ->
/// ConsensusCommitted | ConsensusRejected}`. The fast and consensus branches
/// never cross.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Submitted,
    Classified(AlgebraicClass),
    FastCommitted,
    ConsensusPending,
    ConsensusCommitted,
    ConsensusRejected,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::FastCommitted
                | OperationState::ConsensusCommitted
                | OperationState::ConsensusRejected
        )
    }

    pub fn advance(self, next: OperationState) -> Result<OperationState, RhizoError> {
        use OperationState::*;

        let legal = match (self, next) {
            (Submitted, Classified(_)) => true,
            // Only an algebraic classification may take the fast path.
            (Classified(class), FastCommitted) => class.is_coordination_free(),
            // Any class may be sent through consensus (escalation is safe).
            (Classified(_), ConsensusPending) => true,
            (ConsensusPending, ConsensusCommitted | ConsensusRejected) => true,
            _ => false,
        };

        if legal {
            Ok(next)
        } else {
            Err(RhizoError::IllegalTransition { from: self, to: next })
        }
    }
}
