use std::{collections::HashMap, fs, path::Path};

use serde::{Deserialize, de::DeserializeOwned};
use tracing::debug;

use crate::SentinelError;

/// Default bytecode cache capacity when the config omits `cache_size`.
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// Paths probed by [`Config::load`], in order. The first file that exists
/// wins.
pub const CONFIG_PATHS: &[&str] = &["config.yaml", "conf/config.yaml"];

/// Top-level YAML configuration.
///
/// ```yaml
/// node_address: wss://bsc-ws-node.nariox.org:443
/// cache_size: 256
/// dingtalk_token: "..."
/// services:
///   pair_created:
///     enabled: true
///     config:
///       tokens:
///         stablecoins:
///           - "0x55d398326f99059fF775485246999027B3197955"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// WebSocket endpoint of the chain node.
    #[serde(default)]
    pub node_address: String,

    /// Capacity of the bytecode LRU caches.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// DingTalk robot access token; empty disables the DingTalk notifier.
    #[serde(default)]
    pub dingtalk_token: String,

    /// BscScan API key; empty disables the relevant-token lookup in the
    /// transfer service.
    #[serde(default)]
    pub bscscan_token: String,

    /// Per-service sections, keyed by service name.
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Opaque service-specific section, decoded on demand by
    /// [`Config::service_config`].
    #[serde(default)]
    pub config: serde_yaml::Value,
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_address: String::new(),
            cache_size: DEFAULT_CACHE_SIZE,
            dingtalk_token: String::new(),
            bscscan_token: String::new(),
            services: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from the first existing path in [`CONFIG_PATHS`].
    ///
    /// # Errors
    ///
    /// Returns [`SentinelError::ConfigMissing`] when none of the candidate
    /// files exist, or an IO/parse error for a file that does.
    pub fn load() -> Result<Self, SentinelError> {
        Self::from_paths(CONFIG_PATHS)
    }

    /// Load configuration from the first existing path in `paths`.
    pub fn from_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Self, SentinelError> {
        for path in paths {
            let path = path.as_ref();
            if path.is_file() {
                debug!(path = %path.display(), "loading config");
                let raw = fs::read_to_string(path)?;
                return Self::from_yaml(&raw);
            }
        }
        let probed =
            paths.iter().map(|p| p.as_ref().display().to_string()).collect::<Vec<_>>().join(", ");
        Err(SentinelError::ConfigMissing(probed))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(raw: &str) -> Result<Self, SentinelError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Whether the named service is enabled. Unknown services are disabled.
    #[must_use]
    pub fn service_enabled(&self, name: &str) -> bool {
        self.services.get(name).is_some_and(|s| s.enabled)
    }

    /// Decode the `services.<name>.config` section into a typed struct.
    ///
    /// A missing or empty section yields `T::default()` so services with no
    /// mandatory settings work out of the box.
    pub fn service_config<T>(&self, name: &str) -> Result<T, SentinelError>
    where
        T: DeserializeOwned + Default,
    {
        match self.services.get(name) {
            Some(section) if !section.config.is_null() => {
                Ok(serde_yaml::from_value(section.config.clone())?)
            }
            _ => Ok(T::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
node_address: ws://127.0.0.1:8545
dingtalk_token: tok-123
services:
  pair_created:
    enabled: true
    config:
      tokens:
        stablecoins:
          - "0x55d398326f99059fF775485246999027B3197955"
          - "0xe9e7CEA3DedcA5984780Bafc599bD69ADd087D56"
  transfer:
    enabled: false
"#;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct TokensConfig {
        #[serde(default)]
        tokens: HashMap<String, Vec<String>>,
    }

    #[test]
    fn parses_sample_yaml() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.node_address, "ws://127.0.0.1:8545");
        assert_eq!(config.cache_size, DEFAULT_CACHE_SIZE);
        assert_eq!(config.dingtalk_token, "tok-123");
        assert!(config.service_enabled("pair_created"));
        assert!(!config.service_enabled("transfer"));
        assert!(!config.service_enabled("unknown"));
    }

    #[test]
    fn decodes_service_section() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let tokens: TokensConfig = config.service_config("pair_created").unwrap();
        assert_eq!(tokens.tokens["stablecoins"].len(), 2);
    }

    #[test]
    fn missing_service_section_yields_default() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let tokens: TokensConfig = config.service_config("transfer").unwrap();
        assert_eq!(tokens, TokensConfig::default());
        let tokens: TokensConfig = config.service_config("unknown").unwrap();
        assert_eq!(tokens, TokensConfig::default());
    }

    #[test]
    fn missing_files_report_probed_paths() {
        let err = Config::from_paths(&["/nonexistent/a.yaml", "/nonexistent/b.yaml"]).unwrap_err();
        match err {
            SentinelError::ConfigMissing(probed) => {
                assert!(probed.contains("/nonexistent/a.yaml"));
                assert!(probed.contains("/nonexistent/b.yaml"));
            }
            other => panic!("expected ConfigMissing, got {other:?}"),
        }
    }
}
