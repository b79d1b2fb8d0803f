use anyhow::Result;
use config::{Config, File as ConfigFile};
use sentinel_federation::FederationConfig;
use sentinel_network::BootstrapPeer;
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    pub config_path: Option<PathBuf>,
    pub node_id: String,
    pub region: String,
    pub port: u16,
    pub bootstrap_peers: Vec<String>,
    pub max_peers: usize,
    pub heartbeat_interval_secs: u64,
    pub refresh_interval_secs: u64,
    pub consensus_threshold: f64,
    pub proposal_timeout_secs: u64,
    pub allow_revote: bool,
    pub epsilon: f64,
    pub min_confidence: f64,
    #[serde(skip_serializing)]
    pub sharing_salt: String,
    pub log_level: String,
    pub log_format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            node_id: "sentinel-node".to_string(),
            region: "default".to_string(),
            port: 7400,
            bootstrap_peers: vec![],
            max_peers: 50,
            heartbeat_interval_secs: 30,
            refresh_interval_secs: 30,
            consensus_threshold: 2.0 / 3.0,
            proposal_timeout_secs: 30,
            allow_revote: true,
            epsilon: 1.0,
            min_confidence: 0.7,
            sharing_salt: String::new(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Layer the optional TOML file under `SENTINEL_*` environment variables.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let resolved_path = match config_path {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    anyhow::bail!(
                        "Configuration file {} not found (specified via --config)",
                        path.display()
                    );
                }
                Some(path)
            }
            None => None,
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(config::Environment::with_prefix("SENTINEL"));
        let config = builder.build()?;

        let defaults = Self::default();
        let bootstrap_peers = get_list_value(&config, &["BOOTSTRAP_PEERS", "network.bootstrap_peers"]);

        Ok(Self {
            config_path: resolved_path,
            node_id: get_string_value(&config, &["NODE_ID", "node.id"]).unwrap_or(defaults.node_id),
            region: get_string_value(&config, &["REGION", "node.region"]).unwrap_or(defaults.region),
            port: get_parsed_value(&config, &["PORT", "node.port"], defaults.port),
            bootstrap_peers,
            max_peers: get_parsed_value(&config, &["MAX_PEERS", "network.max_peers"], defaults.max_peers),
            heartbeat_interval_secs: get_parsed_value(
                &config,
                &["HEARTBEAT_INTERVAL_SECS", "network.heartbeat_interval_secs"],
                defaults.heartbeat_interval_secs,
            ),
            refresh_interval_secs: get_parsed_value(
                &config,
                &["REFRESH_INTERVAL_SECS", "network.refresh_interval_secs"],
                defaults.refresh_interval_secs,
            ),
            consensus_threshold: get_parsed_value(
                &config,
                &["CONSENSUS_THRESHOLD", "consensus.threshold"],
                defaults.consensus_threshold,
            ),
            proposal_timeout_secs: get_parsed_value(
                &config,
                &["PROPOSAL_TIMEOUT_SECS", "consensus.proposal_timeout_secs"],
                defaults.proposal_timeout_secs,
            ),
            allow_revote: get_bool_value(
                &config,
                &["ALLOW_REVOTE", "consensus.allow_revote"],
                defaults.allow_revote,
            ),
            epsilon: get_parsed_value(&config, &["EPSILON", "privacy.epsilon"], defaults.epsilon),
            min_confidence: get_parsed_value(
                &config,
                &["MIN_CONFIDENCE", "privacy.min_confidence"],
                defaults.min_confidence,
            ),
            sharing_salt: get_string_value(&config, &["SHARING_SALT", "privacy.salt"])
                .unwrap_or(defaults.sharing_salt),
            log_level: get_string_value(&config, &["LOG_LEVEL", "logging.level"])
                .unwrap_or(defaults.log_level),
            log_format: get_string_value(&config, &["LOG_FORMAT", "logging.format"])
                .unwrap_or(defaults.log_format),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            anyhow::bail!("NODE_ID must not be empty");
        }
        if self.port == 0 {
            anyhow::bail!("PORT must be greater than zero");
        }
        if !(self.consensus_threshold > 0.0 && self.consensus_threshold <= 1.0) {
            anyhow::bail!(
                "CONSENSUS_THRESHOLD must be in (0, 1], got {}",
                self.consensus_threshold
            );
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            anyhow::bail!("EPSILON must be a positive number, got {}", self.epsilon);
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            anyhow::bail!("MIN_CONFIDENCE must be in [0, 1], got {}", self.min_confidence);
        }
        if self.heartbeat_interval_secs == 0 || self.refresh_interval_secs == 0 {
            anyhow::bail!("heartbeat and refresh intervals must be at least one second");
        }
        Ok(())
    }

    /// Per-layer settings for a node with this configuration.
    pub fn federation_config(&self) -> FederationConfig {
        let mut federation = FederationConfig::new(&self.node_id, &self.region).with_port(self.port);
        federation.network.max_peers = self.max_peers;
        federation.network.heartbeat_interval = Duration::from_secs(self.heartbeat_interval_secs);
        federation.discovery.refresh_interval = Duration::from_secs(self.refresh_interval_secs);
        federation.discovery.bootstrap_peers = self
            .bootstrap_peers
            .iter()
            .map(|address| BootstrapPeer::new(address.as_str()))
            .collect();
        federation.consensus.threshold = self.consensus_threshold;
        federation.consensus.proposal_timeout = Duration::from_secs(self.proposal_timeout_secs);
        federation.consensus.allow_revote = self.allow_revote;
        federation.sharing.epsilon = self.epsilon;
        federation.sharing.min_confidence = self.min_confidence;
        federation.sharing.salt = self.sharing_salt.clone();
        federation
    }
}

/// Environment keys may arrive lowercased, so each key is also tried that way.
fn key_variants<'a>(keys: &'a [&'a str]) -> impl Iterator<Item = String> + 'a {
    keys.iter()
        .flat_map(|key| [key.to_string(), key.to_lowercase()])
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    key_variants(keys).find_map(|key| {
        config
            .get_string(&key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn get_bool_value(config: &Config, keys: &[&str], default: bool) -> bool {
    for key in key_variants(keys) {
        if let Ok(value) = config.get_bool(&key) {
            return value;
        }
        if let Ok(raw) = config.get_string(&key) {
            if let Ok(parsed) = raw.parse::<bool>() {
                return parsed;
            }
        }
    }
    default
}

fn get_parsed_value<T: FromStr>(config: &Config, keys: &[&str], default: T) -> T {
    get_string_value(config, keys)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Arrays from the file, or a comma-separated string from the environment.
fn get_list_value(config: &Config, keys: &[&str]) -> Vec<String> {
    for key in key_variants(keys) {
        let values: Vec<String> = if let Ok(values) = config.get_array(&key) {
            values
                .into_iter()
                .filter_map(|value| value.into_string().ok())
                .collect()
        } else if let Ok(value) = config.get_string(&key) {
            value.split(',').map(str::to_string).collect()
        } else {
            continue;
        };
        return values
            .into_iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect();
    }
    Vec::new()
}
