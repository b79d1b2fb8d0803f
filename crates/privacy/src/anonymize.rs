//! Indicator allow-list and double hashing.

use sentinel_crypto::double_hash;
use sentinel_types::{AnonymizedIndicator, Indicator, IndicatorType};
use std::collections::BTreeSet;

/// Indicator kinds that describe behaviour rather than people. Usernames,
/// emails, IP addresses and URLs never leave the node.
pub const SHAREABLE_INDICATORS: [IndicatorType; 5] = [
    IndicatorType::ContentHash,
    IndicatorType::BehavioralPattern,
    IndicatorType::LinguisticPattern,
    IndicatorType::TimingPattern,
    IndicatorType::NetworkPattern,
];

#[derive(Debug, Clone)]
pub struct IndicatorAnonymizer {
    salt: String,
    allowed: BTreeSet<IndicatorType>,
}

impl IndicatorAnonymizer {
    /// Anonymizer over the default allow-list. Every node in a federation
    /// must use the same salt for matches to line up.
    pub fn new<S: Into<String>>(salt: S) -> Self {
        Self::with_allowed(salt, SHAREABLE_INDICATORS)
    }

    pub fn with_allowed<S, I>(salt: S, allowed: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = IndicatorType>,
    {
        Self {
            salt: salt.into(),
            allowed: allowed.into_iter().collect(),
        }
    }

    pub fn is_shareable(&self, indicator_type: IndicatorType) -> bool {
        self.allowed.contains(&indicator_type)
    }

    pub fn hash_value(&self, value: &str) -> String {
        double_hash(value, &self.salt)
    }

    /// Hash the indicator's value, or `None` if its type may not be shared.
    pub fn anonymize(&self, indicator: &Indicator, confidence: f64) -> Option<AnonymizedIndicator> {
        if !self.is_shareable(indicator.indicator_type) {
            return None;
        }
        Some(AnonymizedIndicator {
            indicator_type: indicator.indicator_type,
            hashed_value: self.hash_value(&indicator.value),
            confidence,
        })
    }
}

impl Default for IndicatorAnonymizer {
    fn default() -> Self {
        Self::new("")
    }
}
