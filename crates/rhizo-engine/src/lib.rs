//! Dual-path commit engine.
//!
//! Algebraic operations merge locally and spread by gossip; everything else
//! is ordered by an external consensus service before any replica sees it.

pub mod config;
pub mod fast_path;
pub mod gossip;
pub mod metrics;
pub mod node;
pub mod router;

pub use config::{MixedBatchPolicy, NodeConfig, RouterConfig};
pub use fast_path::CoordinationFreeEngine;
pub use gossip::{Gossip, GossipConfig, GossipTransport, InMemoryNetwork, MemTransport};
pub use metrics::{CountingMetrics, NoopMetrics, RouterMetrics};
pub use node::Node;
pub use router::TransactionRouter;
