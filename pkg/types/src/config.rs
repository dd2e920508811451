use serde::{Deserialize, Serialize};

use crate::node::Node;
use crate::replicaset::ReplicaSet;

/// Server configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// port: 7443
/// workers: 5
/// resync-interval-secs: 30
/// backoff-base-ms: 1000
/// backoff-max-secs: 300
/// max-conflict-retries: 3
/// scheduler-retry-secs: 5
/// manifests: /etc/replicore/replicasets.yaml
/// nodes:
///   - name: node-1
///     labels: { zone: a }
///   - name: node-2
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfigFile {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default, alias = "resync-interval-secs")]
    pub resync_interval_secs: Option<u64>,
    #[serde(default, alias = "backoff-base-ms")]
    pub backoff_base_ms: Option<u64>,
    #[serde(default, alias = "backoff-max-secs")]
    pub backoff_max_secs: Option<u64>,
    #[serde(default, alias = "max-conflict-retries")]
    pub max_conflict_retries: Option<u32>,
    #[serde(default, alias = "scheduler-retry-secs")]
    pub scheduler_retry_secs: Option<u64>,
    /// YAML file holding ReplicaSets to create at startup.
    #[serde(default)]
    pub manifests: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

/// Parse a manifest file: either a single ReplicaSet or a YAML list of them.
pub fn parse_manifests(content: &str) -> anyhow::Result<Vec<ReplicaSet>> {
    let value: serde_yaml::Value = serde_yaml::from_str(content)?;
    if value.is_sequence() {
        Ok(serde_yaml::from_value(value)?)
    } else if value.is_null() {
        Ok(Vec::new())
    } else {
        Ok(vec![serde_yaml::from_value(value)?])
    }
}

pub fn load_manifests(path: &str) -> anyhow::Result<Vec<ReplicaSet>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read manifests {}: {}", path, e))?;
    parse_manifests(&content)
}
