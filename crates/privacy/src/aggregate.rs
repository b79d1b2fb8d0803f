//! Running per-type statistics over received shared signals.

use sentinel_types::{Severity, SharedSignal, SignalType};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSummary {
    pub signal_type: SignalType,
    pub signal_count: usize,
    pub mean_confidence: f64,
    /// Sum of the noised instance counts.
    pub total_instances: i64,
    pub max_severity: Severity,
    pub source_nodes: usize,
    pub regions: Vec<String>,
}

#[derive(Debug)]
struct TypeAggregate {
    count: usize,
    confidence_sum: f64,
    instances: i64,
    max_severity: Severity,
    sources: BTreeSet<String>,
    regions: BTreeSet<String>,
}

impl TypeAggregate {
    fn new(severity: Severity) -> Self {
        Self {
            count: 0,
            confidence_sum: 0.0,
            instances: 0,
            max_severity: severity,
            sources: BTreeSet::new(),
            regions: BTreeSet::new(),
        }
    }
}

/// Accumulates shared signals by threat type. Each shared signal id is
/// counted once.
#[derive(Debug, Default)]
pub struct SignalAggregator {
    seen: HashSet<String>,
    by_type: HashMap<SignalType, TypeAggregate>,
}

impl SignalAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `signal`. Returns false if it was already recorded.
    pub fn record(&mut self, signal: &SharedSignal) -> bool {
        if !self.seen.insert(signal.id.clone()) {
            return false;
        }
        let entry = self
            .by_type
            .entry(signal.signal_type)
            .or_insert_with(|| TypeAggregate::new(signal.severity));
        entry.count += 1;
        entry.confidence_sum += signal.confidence;
        entry.instances = entry.instances.saturating_add(signal.instance_count);
        entry.max_severity = entry.max_severity.max(signal.severity);
        entry.sources.insert(signal.source_node_id.clone());
        entry.regions.insert(signal.source_region.clone());
        true
    }

    pub fn total_signals(&self) -> usize {
        self.seen.len()
    }

    pub fn summary(&self, signal_type: SignalType) -> Option<AggregateSummary> {
        self.by_type
            .get(&signal_type)
            .map(|aggregate| summarize(signal_type, aggregate))
    }

    /// Summaries ordered by descending signal count.
    pub fn summaries(&self) -> Vec<AggregateSummary> {
        let mut all: Vec<_> = self
            .by_type
            .iter()
            .map(|(signal_type, aggregate)| summarize(*signal_type, aggregate))
            .collect();
        all.sort_by(|a, b| b.signal_count.cmp(&a.signal_count));
        all
    }

    /// Threat types reported by at least `min_sources` distinct nodes.
    pub fn cross_node_types(&self, min_sources: usize) -> Vec<SignalType> {
        self.by_type
            .iter()
            .filter(|(_, aggregate)| aggregate.sources.len() >= min_sources)
            .map(|(signal_type, _)| *signal_type)
            .collect()
    }
}

fn summarize(signal_type: SignalType, aggregate: &TypeAggregate) -> AggregateSummary {
    AggregateSummary {
        signal_type,
        signal_count: aggregate.count,
        mean_confidence: aggregate.confidence_sum / aggregate.count.max(1) as f64,
        total_instances: aggregate.instances,
        max_severity: aggregate.max_severity,
        source_nodes: aggregate.sources.len(),
        regions: aggregate.regions.iter().cloned().collect(),
    }
}
