use rhizo_classifier::ClassificationConfig;
use rhizo_consensus::GatewayConfig;

use crate::gossip::GossipConfig;

/// What the router does with a batch holding both algebraic and Generic
/// operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixedBatchPolicy {
    /// Fail the whole batch with `MixedClassBatch`; nothing is applied.
    #[default]
    Reject,
    /// Route each member on its own path. No cross-path atomicity.
    Split,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub mixed_batch_policy: MixedBatchPolicy,
    /// Deadline for each consensus-path operation when the caller gives none.
    pub default_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig { mixed_batch_policy: MixedBatchPolicy::Reject, default_timeout_ms: 2_000 }
    }
}

/// Everything a node needs besides its identity and its collaborators.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub router: RouterConfig,
    pub consensus: GatewayConfig,
    pub gossip: GossipConfig,
    pub classification: ClassificationConfig,
}
