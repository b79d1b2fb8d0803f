use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Monitor,
    Elevated,
    High,
    Immediate,
}

/// Category of a detected threat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Grooming,
    Exploitation,
    Trafficking,
    Sextortion,
    CoordinatedAbuse,
}

/// Kind of observable behind an indicator. Some kinds identify people and
/// must never leave the node; see the sharing allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorType {
    ContentHash,
    BehavioralPattern,
    LinguisticPattern,
    TimingPattern,
    NetworkPattern,
    Username,
    Email,
    IpAddress,
    Url,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Indicator {
    #[serde(rename = "type")]
    pub indicator_type: IndicatorType,
    pub value: String,
    pub confidence: f64,
}

impl Indicator {
    pub fn new<V: Into<String>>(indicator_type: IndicatorType, value: V, confidence: f64) -> Self {
        Self {
            indicator_type,
            value: value.into(),
            confidence,
        }
    }
}

/// Raw detection produced by the local detection pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatSignal {
    pub id: String,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub severity: Severity,
    pub confidence: f64,
    pub indicators: Vec<Indicator>,
    pub instance_count: u64,
    pub risk_tier: RiskTier,
    pub source_agent_id: String,
    pub detected_at: DateTime<Utc>,
}

/// Indicator whose value has been replaced by its double hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymizedIndicator {
    #[serde(rename = "type")]
    pub indicator_type: IndicatorType,
    pub hashed_value: String,
    pub confidence: f64,
}

/// Privacy-transformed projection of a [`ThreatSignal`] that is safe to gossip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedSignal {
    /// Double hash of the originating signal id.
    pub id: String,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub severity: Severity,
    pub confidence: f64,
    pub indicators: Vec<AnonymizedIndicator>,
    pub instance_count: i64,
    pub risk_tier: RiskTier,
    pub source_node_id: String,
    pub source_region: String,
    pub shared_at: DateTime<Utc>,
}
