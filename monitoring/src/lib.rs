//! # Kestrel Monitoring
//!
//! Metrics recorded by the consensus engine, exported in the Prometheus text
//! format.
//!
//! ```rust
//! use kestrel_monitoring::{prometheus, ConsensusMetrics};
//!
//! let metrics = ConsensusMetrics::new();
//! metrics.height.set(12);
//! metrics.rounds_per_block.observe(1.0);
//! let text = prometheus::encode(&metrics.snapshot());
//! assert!(text.contains("kestrel_consensus_height 12"));
//! ```

pub mod metric;
pub mod prometheus;

pub use metric::{Counter, Gauge, Histogram, Sample, SampleValue};

/// Buckets for block interval histograms (seconds).
pub fn default_interval_buckets() -> Vec<f64> {
    vec![0.1, 0.25, 0.5, 1.0, 2.0, 3.0, 5.0, 10.0, 30.0, 60.0]
}

/// Buckets for rounds-per-height histograms.
pub fn default_round_buckets() -> Vec<f64> {
    vec![1.0, 2.0, 3.0, 4.0, 5.0, 10.0]
}

pub struct ConsensusMetrics {
    /// Height the state machine is working on.
    pub height: Gauge,
    /// Round within the current height.
    pub rounds: Gauge,
    pub rounds_per_block: Histogram,
    pub validators: Gauge,
    pub validators_power: Gauge,
    /// Validators absent from the last seen commit.
    pub missing_validators: Gauge,
    pub missing_validators_power: Gauge,
    /// Validators caught signing conflicting votes.
    pub byzantine_validators: Gauge,
    pub block_interval_seconds: Histogram,
    pub num_txs: Gauge,
    pub total_txs: Gauge,
    pub block_size_bytes: Gauge,
    pub committed_height: Gauge,
    pub blocks_committed: Counter,
}

impl ConsensusMetrics {
    pub fn new() -> Self {
        Self {
            height: Gauge::new("kestrel_consensus_height", "Height of the chain"),
            rounds: Gauge::new("kestrel_consensus_rounds", "Current round within the height"),
            rounds_per_block: Histogram::new(
                "kestrel_consensus_rounds_per_block",
                "Rounds needed to commit a block",
                default_round_buckets(),
            ),
            validators: Gauge::new("kestrel_consensus_validators", "Number of validators"),
            validators_power: Gauge::new(
                "kestrel_consensus_validators_power",
                "Total voting power of the validator set",
            ),
            missing_validators: Gauge::new(
                "kestrel_consensus_missing_validators",
                "Validators that did not sign the last block",
            ),
            missing_validators_power: Gauge::new(
                "kestrel_consensus_missing_validators_power",
                "Voting power of validators that did not sign the last block",
            ),
            byzantine_validators: Gauge::new(
                "kestrel_consensus_byzantine_validators",
                "Validators with recorded duplicate vote evidence",
            ),
            block_interval_seconds: Histogram::new(
                "kestrel_consensus_block_interval_seconds",
                "Time between this and the previous block",
                default_interval_buckets(),
            ),
            num_txs: Gauge::new("kestrel_consensus_num_txs", "Transactions in the last block"),
            total_txs: Gauge::new("kestrel_consensus_total_txs", "Total transactions committed"),
            block_size_bytes: Gauge::new(
                "kestrel_consensus_block_size_bytes",
                "Size of the last block",
            ),
            committed_height: Gauge::new(
                "kestrel_consensus_latest_block_height",
                "Height of the last committed block",
            ),
            blocks_committed: Counter::new(
                "kestrel_consensus_blocks_committed_total",
                "Blocks committed by this node",
            ),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            samples: vec![
                self.height.sample(),
                self.rounds.sample(),
                self.rounds_per_block.sample(),
                self.validators.sample(),
                self.validators_power.sample(),
                self.missing_validators.sample(),
                self.missing_validators_power.sample(),
                self.byzantine_validators.sample(),
                self.block_interval_seconds.sample(),
                self.num_txs.sample(),
                self.total_txs.sample(),
                self.block_size_bytes.sample(),
                self.committed_height.sample(),
                self.blocks_committed.sample(),
            ],
        }
    }
}

impl Default for ConsensusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub samples: Vec<Sample>,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> Option<&SampleValue> {
        self.samples.iter().find(|s| s.name == name).map(|s| &s.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_lookup() {
        let m = ConsensusMetrics::new();
        m.height.set(7);
        m.blocks_committed.inc();
        let snap = m.snapshot();
        assert_eq!(snap.get("kestrel_consensus_height"), Some(&SampleValue::Gauge(7)));
        assert_eq!(
            snap.get("kestrel_consensus_blocks_committed_total"),
            Some(&SampleValue::Counter(1))
        );
        assert_eq!(snap.get("missing"), None);
    }

    #[test]
    fn test_metric_names_unique() {
        let snap = ConsensusMetrics::new().snapshot();
        let mut names: Vec<&str> = snap.samples.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), snap.samples.len());
    }
}
