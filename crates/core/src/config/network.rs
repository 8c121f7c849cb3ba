//! Chain selection and known networks.

use serde::{Deserialize, Serialize};

/// A network the tool knows by name, used in config logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    pub chain_id: u64,
    pub name: &'static str,
}

/// Known networks.
pub const NETWORKS: &[Network] = &[
    Network {
        chain_id: 1,
        name: "Ethereum Mainnet",
    },
    Network {
        chain_id: 137,
        name: "Polygon",
    },
    Network {
        chain_id: 42161,
        name: "Arbitrum One",
    },
];

/// Look up a known network.
pub fn network(chain_id: u64) -> Option<&'static Network> {
    NETWORKS.iter().find(|n| n.chain_id == chain_id)
}

/// Chain and market-data endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain ID
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,

    /// Aave subgraph endpoint; `None` uses the built-in static table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_api_url: Option<String>,

    /// Gateway API key for the subgraph
    #[serde(default)]
    pub graph_api_key: String,
}

fn default_chain_id() -> u64 {
    1
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
            graph_api_url: None,
            graph_api_key: String::new(),
        }
    }
}

impl ChainConfig {
    /// Known network for the configured chain id.
    pub fn network(&self) -> Option<&'static Network> {
        network(self.chain_id)
    }

    /// Expand environment variables in config values.
    pub fn expand_env_vars(&mut self) {
        if let Some(ref mut url) = self.graph_api_url {
            *url = expand_env(url);
        }
        self.graph_api_key = expand_env(&self.graph_api_key);
    }
}

/// Expand ${VAR_NAME} patterns with environment variable values.
fn expand_env(s: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return s.to_string();
    };

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        if let (Some(full_match), Some(var_match)) = (cap.get(0), cap.get(1)) {
            if let Ok(value) = std::env::var(var_match.as_str()) {
                result = result.replace(full_match.as_str(), &value);
            }
        }
    }

    result
}
