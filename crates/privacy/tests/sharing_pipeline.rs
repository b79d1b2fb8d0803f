use chrono::Utc;
use sentinel_privacy::{
    prove_threshold_exceeded, verify_threshold_proof, DifferentialPrivacy, SignalAggregator,
    SharingConfig, SignalSharing,
};
use sentinel_types::{Indicator, IndicatorType, RiskTier, Severity, SharedSignal, SignalType, ThreatSignal};

fn node(id: &str, region: &str, seed: u64) -> SignalSharing {
    let config = SharingConfig {
        salt: "federation-2026".to_string(),
        ..SharingConfig::default()
    };
    let privacy = DifferentialPrivacy::with_seed(config.epsilon, seed).unwrap();
    SignalSharing::with_privacy(config, privacy, id, region).unwrap()
}

fn detection(id: &str, pattern: &str) -> ThreatSignal {
    ThreatSignal {
        id: id.to_string(),
        signal_type: SignalType::CoordinatedAbuse,
        severity: Severity::Critical,
        confidence: 0.92,
        indicators: vec![
            Indicator::new(IndicatorType::LinguisticPattern, pattern, 0.85),
            Indicator::new(IndicatorType::Username, "handle_123", 0.95),
        ],
        instance_count: 17,
        risk_tier: RiskTier::Immediate,
        source_agent_id: "scanner-3".to_string(),
        detected_at: Utc::now(),
    }
}

#[test]
fn signal_correlates_across_regions_without_raw_values() {
    let eu = node("node-eu", "eu-west", 1);
    let us = node("node-us", "us-east", 2);

    let shared = eu
        .prepare_for_sharing(&detection("det-1", "lure-script-v2"))
        .expect("confident signal is shared");

    // Over the wire and back.
    let wire = serde_json::to_vec(&shared).unwrap();
    let received: SharedSignal = serde_json::from_slice(&wire).unwrap();
    assert_eq!(received, shared);
    let text = String::from_utf8(wire).unwrap();
    assert!(!text.contains("lure-script-v2"));
    assert!(!text.contains("handle_123"));

    let local = [
        Indicator::new(IndicatorType::LinguisticPattern, "lure-script-v2", 0.7),
        Indicator::new(IndicatorType::Username, "handle_123", 0.9),
    ];
    let result = us.check_match(&received, &local);
    assert!(result.matched);
    assert_eq!(result.matching_types, vec![IndicatorType::LinguisticPattern]);

    let mut aggregator = SignalAggregator::new();
    aggregator.record(&received);
    aggregator.record(&us.prepare_for_sharing(&detection("det-2", "other")).unwrap());
    assert_eq!(aggregator.cross_node_types(2), vec![SignalType::CoordinatedAbuse]);
}

#[test]
fn instance_count_threshold_can_be_attested() {
    let signal = detection("det-1", "lure-script-v2");
    let salt = "case-77";
    let proof = prove_threshold_exceeded(signal.instance_count as f64, 10.0, salt);

    assert!(verify_threshold_proof(&proof, 10.0, salt, true));
    assert!(!verify_threshold_proof(&proof, 20.0, salt, true));
}
