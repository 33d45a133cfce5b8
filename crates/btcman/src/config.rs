//! Client configuration and its validation.

use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_CONSOLIDATION_INTERVAL_S: u64 = 60;
pub const DEFAULT_CONSOLIDATION_FEE_SAT: u64 = 1_000;
pub const DEFAULT_UTXO_THRESHOLD_SAT: u64 = 5_000;
pub const DEFAULT_MIN_CONSOLIDATION_INPUTS: usize = 10;
pub const DEFAULT_COINBASE_MATURITY: i32 = 100;

/// Operating mode: reader holds only a public key, writer can sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Reader,
    Writer,
}

impl Mode {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        match input {
            "reader" => Ok(Self::Reader),
            "writer" => Ok(Self::Writer),
            _ => Err(ConfigError::InvalidMode),
        }
    }
}

/// Parses the configured network name.
pub fn parse_network(input: &str) -> Result<Network, ConfigError> {
    match input {
        "mainnet" => Ok(Network::Bitcoin),
        "testnet" => Ok(Network::Testnet),
        "regtest" => Ok(Network::Regtest),
        _ => Err(ConfigError::InvalidNetwork),
    }
}

/// Client configuration. Zero-valued consolidation options fall back to the
/// defaults above.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// "reader" or "writer".
    pub mode: String,

    /// "mainnet", "testnet" or "regtest".
    pub net: String,

    /// WIF-encoded private key; required in writer mode.
    pub private_key: String,

    /// Compressed public key, hex; required in reader mode.
    pub public_key: String,

    /// Host of the Electrum-style indexer.
    pub indexer_host: String,

    /// Port of the Electrum-style indexer.
    pub indexer_port: String,

    /// Seconds between consolidation passes.
    pub consolidation_interval_s: u64,

    /// Flat fee budget for a consolidation transaction, satoshis.
    pub consolidation_fee_sat: u64,

    /// UTXOs at or above this value fund inscriptions; ones below it are
    /// consolidation candidates.
    pub utxo_threshold_sat: u64,

    /// Minimum number of candidate inputs before consolidating.
    pub min_consolidation_inputs: usize,

    /// Confirmations required before an output is considered spendable.
    /// Every UTXO is conservatively treated as potentially coinbase.
    pub coinbase_maturity: i32,

    /// Wrap the indexer connection in TLS.
    pub enable_tls: bool,

    /// Emit verbose wire-level diagnostics.
    pub enable_debug: bool,
}

impl Config {
    /// A config is valid when mode, network, at least one key, and the
    /// indexer endpoint are all present.
    pub fn is_valid(&self) -> bool {
        !self.mode.is_empty()
            && !self.net.is_empty()
            && (!self.private_key.is_empty() || !self.public_key.is_empty())
            && !self.indexer_host.is_empty()
            && !self.indexer_port.is_empty()
    }

    pub fn consolidation_interval_s(&self) -> u64 {
        defaulted(self.consolidation_interval_s, DEFAULT_CONSOLIDATION_INTERVAL_S)
    }

    pub fn consolidation_fee_sat(&self) -> u64 {
        defaulted(self.consolidation_fee_sat, DEFAULT_CONSOLIDATION_FEE_SAT)
    }

    pub fn utxo_threshold_sat(&self) -> u64 {
        defaulted(self.utxo_threshold_sat, DEFAULT_UTXO_THRESHOLD_SAT)
    }

    pub fn min_consolidation_inputs(&self) -> usize {
        defaulted(self.min_consolidation_inputs, DEFAULT_MIN_CONSOLIDATION_INPUTS)
    }

    pub fn coinbase_maturity(&self) -> i32 {
        if self.coinbase_maturity == 0 {
            DEFAULT_COINBASE_MATURITY
        } else {
            self.coinbase_maturity
        }
    }
}

fn defaulted<T: Default + PartialEq>(value: T, default: T) -> T {
    if value == T::default() {
        default
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_config() -> Config {
        Config {
            mode: "reader".to_string(),
            net: "regtest".to_string(),
            public_key: "03e392587e5c9fdb0b4f96614d8a557a953e6cb1253298a60ff947e3193adedbb7"
                .to_string(),
            indexer_host: "localhost".to_string(),
            indexer_port: "50001".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_empty_config_is_invalid() {
        assert!(!Config::default().is_valid());
    }

    #[test]
    fn test_reader_config_is_valid() {
        assert!(reader_config().is_valid());
    }

    #[test]
    fn test_missing_keys_is_invalid() {
        let mut config = reader_config();
        config.public_key.clear();
        assert!(!config.is_valid());

        config.private_key = "cSaejkcWwU25jMweWEewRSsrVQq2FGTij1xjXv4x1XvxVRF1ZCr3".to_string();
        assert!(config.is_valid());
    }

    #[test]
    fn test_missing_indexer_endpoint_is_invalid() {
        let mut config = reader_config();
        config.indexer_host.clear();
        assert!(!config.is_valid());

        let mut config = reader_config();
        config.indexer_port.clear();
        assert!(!config.is_valid());
    }

    #[test]
    fn test_consolidation_defaults() {
        let config = reader_config();
        assert_eq!(config.consolidation_interval_s(), 60);
        assert_eq!(config.consolidation_fee_sat(), 1_000);
        assert_eq!(config.utxo_threshold_sat(), 5_000);
        assert_eq!(config.min_consolidation_inputs(), 10);
        assert_eq!(config.coinbase_maturity(), 100);

        let config = Config {
            consolidation_interval_s: 5,
            utxo_threshold_sat: 20_000,
            ..reader_config()
        };
        assert_eq!(config.consolidation_interval_s(), 5);
        assert_eq!(config.utxo_threshold_sat(), 20_000);
    }

    #[test]
    fn test_mode_and_network_parsing() {
        assert_eq!(Mode::parse("reader").unwrap(), Mode::Reader);
        assert_eq!(Mode::parse("writer").unwrap(), Mode::Writer);
        assert_eq!(Mode::parse("observer").unwrap_err(), ConfigError::InvalidMode);

        assert_eq!(parse_network("mainnet").unwrap(), Network::Bitcoin);
        assert_eq!(parse_network("testnet").unwrap(), Network::Testnet);
        assert_eq!(parse_network("regtest").unwrap(), Network::Regtest);
        assert_eq!(
            parse_network("signet").unwrap_err(),
            ConfigError::InvalidNetwork
        );
    }
}
