//! Client configuration
//!
//! Controls the active network, data-source endpoints and credentials,
//! custom networks and confirmation polling. Loaded from environment
//! variables or a TOML file; defaults to mainnet with the public endpoints.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LaserError, Result};
use crate::network::Network;

/// Public Sandshrew key used when none is configured
pub const DEFAULT_SANDSHREW_API_KEY: &str = "lasereyes";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 60;

/// Endpoint and credential override for one network
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointOverride {
    pub url: Option<String>,
    pub api_key: Option<String>,
}

/// Settings for one data source
///
/// `networks` is keyed by network id (`"testnet4"`) or custom network id and
/// wins over the top-level `url`/`api_key`, which in turn win over the
/// built-in endpoint table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub networks: HashMap<String, EndpointOverride>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            api_key: None,
            networks: HashMap::new(),
        }
    }
}

impl SourceConfig {
    fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Override for `key`, falling back to the top-level settings
    pub fn endpoint_for(&self, key: &str) -> EndpointOverride {
        let specific = self.networks.get(key).cloned().unwrap_or_default();
        EndpointOverride {
            url: specific.url.or_else(|| self.url.clone()),
            api_key: specific.api_key.or_else(|| self.api_key.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourcesConfig {
    pub mempool: SourceConfig,
    pub sandshrew: SourceConfig,
    /// Maestro needs an API key and is off until one is configured
    pub maestro: SourceConfig,
    /// Source consulted first, keyed by built-in network id (`"testnet4"`)
    ///
    /// A custom network's own `preferred_data_source` wins; without one it
    /// inherits the entry for its base network.
    pub preferred: HashMap<String, String>,
}

impl Default for DataSourcesConfig {
    fn default() -> Self {
        Self {
            mempool: SourceConfig::default(),
            sandshrew: SourceConfig::default(),
            maestro: SourceConfig::disabled(),
            preferred: HashMap::new(),
        }
    }
}

/// A named network layered on a built-in one
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomNetwork {
    /// Address parameters and default endpoints come from here
    pub base_network: Network,
    /// Source consulted first for this network
    #[serde(default)]
    pub preferred_data_source: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub network: Network,
    pub data_sources: DataSourcesConfig,
    pub custom_networks: HashMap<String, CustomNetwork>,
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
}

impl ClientConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `LASEREYES_NETWORK`: network id, "mainnet" (default), "testnet4", ...
    /// - `MEMPOOL_URL`: mempool.space-compatible endpoint (optional)
    /// - `SANDSHREW_URL`, `SANDSHREW_API_KEY`: Sandshrew endpoint and key (optional)
    /// - `MAESTRO_API_KEY`, `MAESTRO_TESTNET_API_KEY`: enable Maestro
    /// - `LASEREYES_POLL_INTERVAL_SECS`, `LASEREYES_POLL_TIMEOUT_SECS`: confirmation polling
    ///
    /// # Examples
    ///
    /// ```bash
    /// LASEREYES_NETWORK=testnet4 MAESTRO_TESTNET_API_KEY=... cargo test
    /// ```
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] over an arbitrary variable lookup
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(network) = var("LASEREYES_NETWORK").filter(|s| !s.trim().is_empty()) {
            config.network = network.parse()?;
        }
        log::info!("Using {} network", config.network);

        if let Some(url) = var("MEMPOOL_URL") {
            log::info!("Mempool URL: {}", url);
            config.data_sources.mempool.url = Some(url);
        }

        if let Some(url) = var("SANDSHREW_URL") {
            log::info!("Sandshrew URL: {}", url);
            config.data_sources.sandshrew.url = Some(url);
        }
        config.data_sources.sandshrew.api_key = var("SANDSHREW_API_KEY");

        let maestro_key = var("MAESTRO_API_KEY");
        let maestro_testnet_key = var("MAESTRO_TESTNET_API_KEY");
        if maestro_key.is_some() || maestro_testnet_key.is_some() {
            log::info!("Maestro data source enabled");
            let maestro = &mut config.data_sources.maestro;
            maestro.enabled = true;
            maestro.api_key = maestro_key;
            if let Some(key) = maestro_testnet_key {
                maestro.networks.insert(
                    Network::Testnet4.id().to_string(),
                    EndpointOverride {
                        url: None,
                        api_key: Some(key),
                    },
                );
            }
        }

        if let Some(secs) = var("LASEREYES_POLL_INTERVAL_SECS") {
            config.poll_interval_secs = parse_secs("LASEREYES_POLL_INTERVAL_SECS", &secs)?;
        }
        if let Some(secs) = var("LASEREYES_POLL_TIMEOUT_SECS") {
            config.poll_timeout_secs = parse_secs("LASEREYES_POLL_TIMEOUT_SECS", &secs)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| LaserError::Config(format!("toml: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LaserError::Config(format!("{}: {}", path.display(), e)))?;
        log::debug!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(LaserError::Config("poll interval must be positive".to_string()));
        }
        if self.poll_timeout_secs < self.poll_interval_secs {
            return Err(LaserError::Config(
                "poll timeout must not be shorter than the poll interval".to_string(),
            ));
        }
        for (network, source) in &self.data_sources.preferred {
            network
                .parse::<Network>()
                .map_err(|_| LaserError::Config(format!("preferred source for unknown network '{}'", network)))?;
            if source.trim().is_empty() {
                return Err(LaserError::Config(format!(
                    "network '{}' names an empty preferred source",
                    network
                )));
            }
        }
        for (id, custom) in &self.custom_networks {
            if id.parse::<Network>().is_ok() {
                return Err(LaserError::Config(format!(
                    "custom network '{}' shadows a built-in network",
                    id
                )));
            }
            if let Some(preferred) = &custom.preferred_data_source {
                if preferred.trim().is_empty() {
                    return Err(LaserError::Config(format!(
                        "custom network '{}' names an empty preferred source",
                        id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn custom_network(&self, id: &str) -> Option<&CustomNetwork> {
        self.custom_networks.get(id)
    }
}

fn parse_secs(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| LaserError::Config(format!("{}='{}': {}", name, value, e)))
}

impl Default for ClientConfig {
    /// Mainnet with mempool.space and Sandshrew
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            data_sources: DataSourcesConfig::default(),
            custom_networks: HashMap::new(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            poll_timeout_secs: DEFAULT_POLL_TIMEOUT_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_is_mainnet() {
        let config = ClientConfig::default();
        assert_eq!(config.network, Network::Mainnet);
        assert!(config.data_sources.mempool.enabled);
        assert!(config.data_sources.sandshrew.enabled);
        assert!(!config.data_sources.maestro.enabled);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.poll_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_vars() {
        let config = ClientConfig::from_vars(vars(&[
            ("LASEREYES_NETWORK", "testnet4"),
            ("MEMPOOL_URL", "http://localhost:3000"),
            ("MAESTRO_TESTNET_API_KEY", "secret"),
            ("LASEREYES_POLL_INTERVAL_SECS", "1"),
        ]))
        .unwrap();
        assert_eq!(config.network, Network::Testnet4);
        assert_eq!(config.data_sources.mempool.url.as_deref(), Some("http://localhost:3000"));
        assert!(config.data_sources.maestro.enabled);
        assert_eq!(
            config.data_sources.maestro.endpoint_for("testnet4").api_key.as_deref(),
            Some("secret")
        );
        assert_eq!(config.data_sources.maestro.endpoint_for("mainnet").api_key, None);
        assert_eq!(config.poll_interval_secs, 1);
    }

    #[test]
    fn test_unknown_network_is_an_error() {
        let err = ClientConfig::from_vars(vars(&[("LASEREYES_NETWORK", "dogecoin")])).unwrap_err();
        assert!(matches!(err, LaserError::UnsupportedNetwork(_)));
    }

    #[test]
    fn test_bad_poll_values_rejected() {
        assert!(ClientConfig::from_vars(vars(&[("LASEREYES_POLL_INTERVAL_SECS", "soon")])).is_err());
        assert!(ClientConfig::from_vars(vars(&[("LASEREYES_POLL_INTERVAL_SECS", "0")])).is_err());
        assert!(ClientConfig::from_vars(vars(&[("LASEREYES_POLL_TIMEOUT_SECS", "2")])).is_err());
    }

    #[test]
    fn test_from_toml_str() {
        let config = ClientConfig::from_toml_str(
            r#"
            network = "signet"

            [data_sources.sandshrew]
            api_key = "abc"

            [data_sources.sandshrew.networks.devnet]
            url = "http://localhost:18888"

            [custom_networks.devnet]
            base_network = "regtest"
            preferred_data_source = "sandshrew"
            "#,
        )
        .unwrap();
        assert_eq!(config.network, Network::Signet);
        let endpoint = config.data_sources.sandshrew.endpoint_for("devnet");
        assert_eq!(endpoint.url.as_deref(), Some("http://localhost:18888"));
        assert_eq!(endpoint.api_key.as_deref(), Some("abc"));
        let custom = config.custom_network("devnet").unwrap();
        assert_eq!(custom.base_network, Network::Regtest);
        assert_eq!(custom.preferred_data_source.as_deref(), Some("sandshrew"));
    }

    #[test]
    fn test_preferred_source_keys_must_be_networks() {
        let config = ClientConfig::from_toml_str(
            r#"
            [data_sources.preferred]
            testnet4 = "maestro"
            "#,
        )
        .unwrap();
        assert_eq!(config.data_sources.preferred["testnet4"], "maestro");

        let err = ClientConfig::from_toml_str(
            r#"
            [data_sources.preferred]
            moonnet = "maestro"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, LaserError::Config(_)));
    }

    #[test]
    fn test_custom_network_cannot_shadow_builtin() {
        let err = ClientConfig::from_toml_str(
            r#"
            [custom_networks.signet]
            base_network = "regtest"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, LaserError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lasereyes.toml");
        std::fs::write(&path, "network = \"fractal-testnet\"\n").unwrap();
        let config = ClientConfig::from_file(&path).unwrap();
        assert_eq!(config.network, Network::FractalTestnet);
        assert!(ClientConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}
