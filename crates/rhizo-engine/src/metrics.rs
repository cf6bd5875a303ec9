use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use rhizo_types::{CommitPath, RejectReason};

/// Sink for per-path latency and rejection counts. The exporter behind it
/// is outside this crate.
pub trait RouterMetrics: Send + Sync + 'static {
    fn record_commit(&self, path: CommitPath, latency: Duration);
    fn record_rejection(&self, reason: &'static str);
}

pub fn reject_label(reason: &RejectReason) -> &'static str {
    match reason {
        RejectReason::ConsensusUnavailable { .. } => "consensus_unavailable",
        RejectReason::ConsensusRejected(_) => "consensus_rejected",
        RejectReason::PreconditionFailed => "precondition_failed",
        RejectReason::Inapplicable(_) => "inapplicable",
    }
}

pub struct NoopMetrics;

impl RouterMetrics for NoopMetrics {
    fn record_commit(&self, _path: CommitPath, _latency: Duration) {}
    fn record_rejection(&self, _reason: &'static str) {}
}

/// In-memory counters, mostly for tests and local runs.
#[derive(Default)]
pub struct CountingMetrics {
    fast: AtomicU64,
    consensus: AtomicU64,
    fast_latency_ns: AtomicU64,
    consensus_latency_ns: AtomicU64,
    rejections: Mutex<HashMap<&'static str, u64>>,
}

impl CountingMetrics {
    pub fn commits(&self, path: CommitPath) -> u64 {
        match path {
            CommitPath::Fast => self.fast.load(Ordering::Relaxed),
            CommitPath::Consensus => self.consensus.load(Ordering::Relaxed),
        }
    }

    /// Mean latency of recorded commits on `path`.
    pub fn mean_latency(&self, path: CommitPath) -> Duration {
        let (count, total) = match path {
            CommitPath::Fast => (&self.fast, &self.fast_latency_ns),
            CommitPath::Consensus => (&self.consensus, &self.consensus_latency_ns),
        };
        let count = count.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(total.load(Ordering::Relaxed) / count)
    }

    pub fn rejections(&self, reason: &str) -> u64 {
        self.rejections.lock().get(reason).copied().unwrap_or(0)
    }
}

impl RouterMetrics for CountingMetrics {
    fn record_commit(&self, path: CommitPath, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        let (count, total) = match path {
            CommitPath::Fast => (&self.fast, &self.fast_latency_ns),
            CommitPath::Consensus => (&self.consensus, &self.consensus_latency_ns),
        };
        count.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(nanos, Ordering::Relaxed);
    }

    fn record_rejection(&self, reason: &'static str) {
        *self.rejections.lock().entry(reason).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_means() {
        let m = CountingMetrics::default();
        m.record_commit(CommitPath::Fast, Duration::from_micros(10));
        m.record_commit(CommitPath::Fast, Duration::from_micros(30));
        m.record_rejection("consensus_unavailable");

        assert_eq!(m.commits(CommitPath::Fast), 2);
        assert_eq!(m.commits(CommitPath::Consensus), 0);
        assert_eq!(m.mean_latency(CommitPath::Fast), Duration::from_micros(20));
        assert_eq!(m.mean_latency(CommitPath::Consensus), Duration::ZERO);
        assert_eq!(m.rejections("consensus_unavailable"), 1);
        assert_eq!(m.rejections("mixed_class_batch"), 0);
    }
}
