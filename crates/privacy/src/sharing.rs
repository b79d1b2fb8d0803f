//! Preparing local signals for the federation and matching received ones.

use chrono::Utc;
use sentinel_types::{Indicator, IndicatorType, SharedSignal, ThreatSignal};
use std::collections::BTreeSet;
use tracing::debug;

use crate::anonymize::{IndicatorAnonymizer, SHAREABLE_INDICATORS};
use crate::differential::DifferentialPrivacy;
use crate::{PrivacyError, Result};

/// Signal sharing settings.
#[derive(Debug, Clone)]
pub struct SharingConfig {
    /// Signals below this confidence are kept local.
    pub min_confidence: f64,
    /// Privacy budget per released value.
    pub epsilon: f64,
    /// Federation-wide salt for the double hash.
    pub salt: String,
    pub shareable_types: Vec<IndicatorType>,
    pub count_sensitivity: f64,
    pub rate_sensitivity: f64,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            epsilon: 1.0,
            salt: String::new(),
            shareable_types: SHAREABLE_INDICATORS.to_vec(),
            count_sensitivity: 1.0,
            rate_sensitivity: 0.1,
        }
    }
}

/// Outcome of comparing a shared signal with local indicators.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    pub matching_types: Vec<IndicatorType>,
    pub match_count: usize,
    /// Mean over matching pairs of the lower of the two confidences.
    pub confidence: f64,
}

pub struct SignalSharing {
    config: SharingConfig,
    privacy: DifferentialPrivacy,
    anonymizer: IndicatorAnonymizer,
    node_id: String,
    region: String,
}

impl SignalSharing {
    pub fn new<I: Into<String>, R: Into<String>>(
        config: SharingConfig,
        node_id: I,
        region: R,
    ) -> Result<Self> {
        let privacy = DifferentialPrivacy::new(config.epsilon)?;
        Self::with_privacy(config, privacy, node_id, region)
    }

    /// Sharing with a caller-supplied noise source.
    pub fn with_privacy<I: Into<String>, R: Into<String>>(
        config: SharingConfig,
        privacy: DifferentialPrivacy,
        node_id: I,
        region: R,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&config.min_confidence) {
            return Err(PrivacyError::InvalidMinConfidence(config.min_confidence));
        }
        let anonymizer =
            IndicatorAnonymizer::with_allowed(config.salt.clone(), config.shareable_types.clone());
        Ok(Self {
            config,
            privacy,
            anonymizer,
            node_id: node_id.into(),
            region: region.into(),
        })
    }

    pub fn config(&self) -> &SharingConfig {
        &self.config
    }

    pub fn anonymizer(&self) -> &IndicatorAnonymizer {
        &self.anonymizer
    }

    /// Privacy-safe projection of `signal`, or `None` if its confidence is
    /// below the sharing gate.
    pub fn prepare_for_sharing(&self, signal: &ThreatSignal) -> Option<SharedSignal> {
        if signal.confidence < self.config.min_confidence {
            debug!(
                signal_id = %signal.id,
                confidence = signal.confidence,
                min_confidence = self.config.min_confidence,
                "signal below sharing threshold"
            );
            return None;
        }

        let indicators: Vec<_> = signal
            .indicators
            .iter()
            .filter_map(|indicator| {
                let confidence = self
                    .privacy
                    .privatize_rate(indicator.confidence, self.config.rate_sensitivity);
                self.anonymizer.anonymize(indicator, confidence)
            })
            .collect();

        Some(SharedSignal {
            id: self.anonymizer.hash_value(&signal.id),
            signal_type: signal.signal_type,
            severity: signal.severity,
            confidence: self
                .privacy
                .privatize_rate(signal.confidence, self.config.rate_sensitivity),
            indicators,
            instance_count: self
                .privacy
                .privatize_count(signal.instance_count, self.config.count_sensitivity),
            risk_tier: signal.risk_tier,
            source_node_id: self.node_id.clone(),
            source_region: self.region.clone(),
            shared_at: Utc::now(),
        })
    }

    /// Compare a received signal with raw local indicators by re-hashing them.
    /// A pair matches when both the type and the hashed value agree.
    pub fn check_match(&self, shared: &SharedSignal, local: &[Indicator]) -> MatchResult {
        let local_hashed: Vec<(IndicatorType, String, f64)> = local
            .iter()
            .map(|indicator| {
                (
                    indicator.indicator_type,
                    self.anonymizer.hash_value(&indicator.value),
                    indicator.confidence,
                )
            })
            .collect();

        let mut types = BTreeSet::new();
        let mut confidences = Vec::new();
        for remote in &shared.indicators {
            for (kind, hashed, confidence) in &local_hashed {
                if *kind == remote.indicator_type && *hashed == remote.hashed_value {
                    types.insert(*kind);
                    confidences.push(confidence.min(remote.confidence));
                }
            }
        }

        let confidence = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f64>() / confidences.len() as f64
        };
        MatchResult {
            matched: !confidences.is_empty(),
            matching_types: types.into_iter().collect(),
            match_count: confidences.len(),
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_types::{RiskTier, Severity, SignalType};

    fn signal(confidence: f64, indicators: Vec<Indicator>) -> ThreatSignal {
        ThreatSignal {
            id: "sig-001".to_string(),
            signal_type: SignalType::Grooming,
            severity: Severity::High,
            confidence,
            indicators,
            instance_count: 4,
            risk_tier: RiskTier::Elevated,
            source_agent_id: "agent-7".to_string(),
            detected_at: Utc::now(),
        }
    }

    fn sharing(config: SharingConfig) -> SignalSharing {
        let privacy = DifferentialPrivacy::with_seed(config.epsilon, 99).unwrap();
        SignalSharing::with_privacy(config, privacy, "node-a", "eu-west").unwrap()
    }

    #[test]
    fn low_confidence_signals_stay_local() {
        let sharing = sharing(SharingConfig::default());
        assert!(sharing.prepare_for_sharing(&signal(0.5, vec![])).is_none());
        assert!(sharing.prepare_for_sharing(&signal(0.7, vec![])).is_some());
    }

    #[test]
    fn shared_signal_hides_raw_values() {
        let sharing = sharing(SharingConfig::default());
        let raw = signal(
            0.9,
            vec![
                Indicator::new(IndicatorType::BehavioralPattern, "test-pattern-hash", 0.8),
                Indicator::new(IndicatorType::Email, "victim@example.org", 0.99),
            ],
        );
        let shared = sharing.prepare_for_sharing(&raw).unwrap();

        assert_ne!(shared.id, raw.id);
        assert_eq!(shared.id, sharing.anonymizer().hash_value("sig-001"));
        assert_eq!(shared.indicators.len(), 1);
        assert_eq!(shared.indicators[0].indicator_type, IndicatorType::BehavioralPattern);
        assert!((0.0..=1.0).contains(&shared.confidence));
        assert!(shared.instance_count >= 0);
        assert_eq!(shared.source_node_id, "node-a");
        assert_eq!(shared.source_region, "eu-west");

        let wire = serde_json::to_string(&shared).unwrap();
        assert!(!wire.contains("test-pattern-hash"));
        assert!(!wire.contains("victim@example.org"));
        assert!(!wire.contains("agent-7"));
    }

    #[test]
    fn matching_local_indicator_is_found() {
        let sender = sharing(SharingConfig::default());
        let receiver = sharing(SharingConfig::default());
        let shared = sender
            .prepare_for_sharing(&signal(
                0.9,
                vec![Indicator::new(IndicatorType::BehavioralPattern, "test-pattern-hash", 0.8)],
            ))
            .unwrap();

        let local = [Indicator::new(IndicatorType::BehavioralPattern, "test-pattern-hash", 0.6)];
        let result = receiver.check_match(&shared, &local);
        assert!(result.matched);
        assert_eq!(result.matching_types, vec![IndicatorType::BehavioralPattern]);
        assert_eq!(result.match_count, 1);
        let expected = shared.indicators[0].confidence.min(0.6);
        assert!((result.confidence - expected).abs() < 1e-12);
    }

    #[test]
    fn different_value_type_or_salt_breaks_the_match() {
        let sender = sharing(SharingConfig::default());
        let shared = sender
            .prepare_for_sharing(&signal(
                0.9,
                vec![Indicator::new(IndicatorType::BehavioralPattern, "test-pattern-hash", 0.8)],
            ))
            .unwrap();

        let other_value = [Indicator::new(IndicatorType::BehavioralPattern, "other-pattern", 0.6)];
        assert!(!sender.check_match(&shared, &other_value).matched);

        let other_type = [Indicator::new(IndicatorType::TimingPattern, "test-pattern-hash", 0.6)];
        assert!(!sender.check_match(&shared, &other_type).matched);

        let salted = sharing(SharingConfig {
            salt: "region-salt".to_string(),
            ..SharingConfig::default()
        });
        let same = [Indicator::new(IndicatorType::BehavioralPattern, "test-pattern-hash", 0.6)];
        let result = salted.check_match(&shared, &same);
        assert!(!result.matched);
        assert_eq!(result.confidence, 0.0);
        assert!(result.matching_types.is_empty());
    }

    #[test]
    fn invalid_gate_is_rejected() {
        let config = SharingConfig {
            min_confidence: 1.5,
            ..SharingConfig::default()
        };
        assert!(matches!(
            SignalSharing::new(config, "node-a", "eu-west"),
            Err(PrivacyError::InvalidMinConfidence(_))
        ));
    }
}
