//! Supported networks and their address parameters

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LaserError, Result};

/// Every network the engine can target
///
/// The fractal chains reuse Bitcoin address formats. Oylnet is a
/// regtest-parameter chain served by a hosted indexer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Network {
    Mainnet,
    Testnet,
    Testnet4,
    Signet,
    Regtest,
    FractalMainnet,
    FractalTestnet,
    Oylnet,
}

impl Network {
    pub const ALL: [Network; 8] = [
        Network::Mainnet,
        Network::Testnet,
        Network::Testnet4,
        Network::Signet,
        Network::Regtest,
        Network::FractalMainnet,
        Network::FractalTestnet,
        Network::Oylnet,
    ];

    /// Stable string id used in config files and provider responses
    pub fn id(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Testnet4 => "testnet4",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
            Network::FractalMainnet => "fractal-mainnet",
            Network::FractalTestnet => "fractal-testnet",
            Network::Oylnet => "oylnet",
        }
    }

    /// Address parameters for the `bitcoin` crate
    ///
    /// Testnet4 shares testnet address encodings.
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet | Network::FractalMainnet | Network::FractalTestnet => {
                bitcoin::Network::Bitcoin
            }
            Network::Testnet | Network::Testnet4 => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest | Network::Oylnet => bitcoin::Network::Regtest,
        }
    }

    /// Base58 version byte for pay-to-pubkey-hash addresses
    pub fn pubkey_hash_version(&self) -> u8 {
        match self.bitcoin_network() {
            bitcoin::Network::Bitcoin => 0x00,
            _ => 0x6f,
        }
    }

    /// Base58 version byte for pay-to-script-hash addresses
    pub fn script_hash_version(&self) -> u8 {
        match self.bitcoin_network() {
            bitcoin::Network::Bitcoin => 0x05,
            _ => 0xc4,
        }
    }

    pub fn is_mainnet(&self) -> bool {
        matches!(self, Network::Mainnet | Network::FractalMainnet)
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::Mainnet
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Network {
    type Err = LaserError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        match normalized.as_str() {
            "mainnet" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "testnet3" => Ok(Network::Testnet),
            "testnet4" => Ok(Network::Testnet4),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            "fractal-mainnet" | "fractal" => Ok(Network::FractalMainnet),
            "fractal-testnet" => Ok(Network::FractalTestnet),
            "oylnet" => Ok(Network::Oylnet),
            _ => Err(LaserError::UnsupportedNetwork(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_round_trip() {
        for network in Network::ALL {
            assert_eq!(network.id().parse::<Network>().unwrap(), network);
        }
    }

    #[test]
    fn test_unknown_network_is_explicit_error() {
        let err = "liquid".parse::<Network>().unwrap_err();
        assert!(matches!(err, LaserError::UnsupportedNetwork(_)));
    }

    #[test]
    fn test_fractal_reuses_mainnet_address_format() {
        assert_eq!(Network::FractalTestnet.bitcoin_network(), bitcoin::Network::Bitcoin);
        assert_eq!(Network::FractalTestnet.pubkey_hash_version(), 0x00);
        assert_eq!(Network::Testnet4.script_hash_version(), 0xc4);
    }
}
