//! Configuration management for the settlement engine
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::types::Chain;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub settler: SettlerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub orderbook: OrderbookConfig,
    pub bitcoin: BitcoinConfig,
    #[serde(default)]
    pub evm: HashMap<String, EvmConfig>,
    pub accounts: Vec<AccountConfig>,
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlerConfig {
    pub instance_id: String,
    /// Safety-net reconciliation pass over open records
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Bitcoin batch executor drain tick
    #[serde(default = "default_batch_tick")]
    pub batch_tick_secs: u64,
    #[serde(default = "default_batch_capacity")]
    pub batch_capacity: usize,
    /// Upper bound on any single chain submission
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_secs: u64,
}

impl SettlerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn batch_tick(&self) -> Duration {
        Duration::from_secs(self.batch_tick_secs)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }
}

fn default_poll_interval() -> u64 {
    60
}

fn default_batch_tick() -> u64 {
    60
}

fn default_batch_capacity() -> usize {
    16
}

fn default_submit_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderbookConfig {
    pub http_url: String,
    pub ws_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    10
}

/// Fee-rate tier for Bitcoin submissions, per deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeTier {
    Minimum,
    Economy,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinConfig {
    pub chain: Chain,
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    pub fee_tier: FeeTier,
    /// Account whose derived key owns the shared batch wallet
    pub wallet_account: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmConfig {
    pub chain: Chain,
    pub rpc_urls: Vec<String>,
    /// HTLC contract this chain's swaps settle through
    pub contract_address: String,
    #[serde(default = "default_log_scan_step")]
    pub log_scan_step: u64,
    pub enabled: bool,
}

fn default_log_scan_step() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    pub selector: u32,
    /// Order-book identity; derived from the account's EVM key when absent
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Environment variable holding the hex seed (preferred)
    pub seed_env: Option<String>,
    /// Inline hex seed, dev/regtest only
    pub seed_hex: Option<String>,
}

impl WalletConfig {
    /// Resolve the 32-byte derivation seed
    pub fn seed(&self) -> Result<[u8; 32]> {
        let hex_seed = if let Some(var) = &self.seed_env {
            env::var(var).with_context(|| format!("wallet seed env var {var} not set"))?
        } else if let Some(inline) = &self.seed_hex {
            inline.clone()
        } else {
            anyhow::bail!("wallet config needs seed_env or seed_hex");
        };

        let bytes = hex::decode(hex_seed.trim_start_matches("0x"))
            .context("wallet seed is not valid hex")?;
        bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("wallet seed must be 32 bytes"))
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("SETTLER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Load settings for a specific environment
    pub fn load_env(env_name: &str) -> Result<Self> {
        let config_path = PathBuf::from(format!("config/{}.toml", env_name));
        env::set_var("SETTLER_CONFIG", config_path.to_str().unwrap());
        Self::load()
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            anyhow::bail!("At least one account must be configured");
        }

        if !self.bitcoin.enabled && self.enabled_evm_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        if self.bitcoin.enabled {
            if self.bitcoin.chain.bitcoin_network().is_none() {
                anyhow::bail!(
                    "bitcoin.chain {} is not a Bitcoin-family chain",
                    self.bitcoin.chain
                );
            }
            if !self
                .accounts
                .iter()
                .any(|a| a.name == self.bitcoin.wallet_account)
            {
                anyhow::bail!(
                    "bitcoin.wallet_account {} is not a configured account",
                    self.bitcoin.wallet_account
                );
            }
        }

        for (name, chain) in &self.evm {
            if chain.enabled {
                if chain.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", name);
                }
                if chain.contract_address.is_empty() {
                    anyhow::bail!("Chain {} has no HTLC contract address", name);
                }
            }
        }

        Ok(())
    }

    /// Get list of enabled EVM chains
    pub fn enabled_evm_chains(&self) -> Vec<(&String, &EvmConfig)> {
        self.evm.iter().filter(|(_, c)| c.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(
            result,
            "url = \"https://api.example.com/test_value/endpoint\""
        );
    }

    #[test]
    fn fee_tier_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrap {
            tier: FeeTier,
        }
        let w: Wrap = toml::from_str("tier = \"economy\"").unwrap();
        assert_eq!(w.tier, FeeTier::Economy);
        assert!(toml::from_str::<Wrap>("tier = \"urgent\"").is_err());
    }

    #[test]
    fn wallet_seed_round_trips() {
        let wallet = WalletConfig {
            seed_env: None,
            seed_hex: Some(hex::encode([9u8; 32])),
        };
        assert_eq!(wallet.seed().unwrap(), [9u8; 32]);

        let short = WalletConfig {
            seed_env: None,
            seed_hex: Some("abcd".into()),
        };
        assert!(short.seed().is_err());
    }
}
