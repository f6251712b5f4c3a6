//! Wallet provider capability interface
//!
//! A provider is whatever holds the user's keys: a browser extension bridge,
//! a hardware signer, a test double. Each method is optional; a provider
//! that lacks one answers [`LaserError::UnsupportedByProvider`] and never
//! silently does nothing.
//!
//! Providers are looked up by name in a [`ProviderRegistry`]. Availability is
//! checked on demand with [`WalletProvider::probe_availability`] instead of a
//! background watcher.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::builder::{Account, InputToSign};
use crate::error::{LaserError, Result};
use crate::network::Network;

/// Accounts a provider exposes once connected
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAccounts {
    /// Ordinals / taproot account
    pub ordinals: Account,
    /// Account paying fees; the same as `ordinals` for single-address wallets
    pub payment: Account,
    /// Every address the wallet disclosed
    pub accounts: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageProtocol {
    #[default]
    Ecdsa,
    Bip322,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignMessageOptions {
    pub to_sign_address: Option<String>,
    pub protocol: MessageProtocol,
}

/// A PSBT handed to the signer in both encodings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignPsbtRequest {
    pub psbt_hex: String,
    pub psbt_base64: String,
    pub finalize: bool,
    pub broadcast: bool,
    pub inputs_to_sign: Vec<InputToSign>,
}

/// What came back: a signed PSBT in either encoding, and a txid when the
/// provider broadcast it itself
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignPsbtResponse {
    pub signed_psbt_hex: Option<String>,
    pub signed_psbt_base64: Option<String>,
    pub txid: Option<String>,
}

impl SignPsbtResponse {
    /// The signed PSBT text, preferring hex
    pub fn signed_psbt(&self) -> Option<&str> {
        self.signed_psbt_hex
            .as_deref()
            .or(self.signed_psbt_base64.as_deref())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Unavailable,
}

#[async_trait]
pub trait WalletProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the provider can be used right now, waiting at most `timeout`
    async fn probe_availability(&self, _timeout: Duration) -> Availability {
        Availability::Available
    }

    /// Ask the user to connect and disclose accounts for `network`
    async fn connect(&self, network: Network) -> Result<WalletAccounts>;

    /// Re-read the accounts after a network change
    async fn get_accounts(&self, network: Network) -> Result<WalletAccounts> {
        self.connect(network).await
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn sign_message(&self, _message: &str, _options: &SignMessageOptions) -> Result<String> {
        Err(LaserError::unsupported_by_provider(self.name(), "sign_message"))
    }

    async fn sign_psbt(&self, _request: &SignPsbtRequest) -> Result<SignPsbtResponse> {
        Err(LaserError::unsupported_by_provider(self.name(), "sign_psbt"))
    }

    /// Native BTC send, returning the txid
    async fn send_bitcoin(&self, _to: &str, _amount: u64) -> Result<String> {
        Err(LaserError::unsupported_by_provider(self.name(), "send_bitcoin"))
    }

    async fn get_balance(&self) -> Result<u64> {
        Err(LaserError::unsupported_by_provider(self.name(), "get_balance"))
    }

    async fn get_network(&self) -> Result<Network> {
        Err(LaserError::unsupported_by_provider(self.name(), "get_network"))
    }

    async fn switch_network(&self, _network: Network) -> Result<()> {
        Err(LaserError::unsupported_by_provider(self.name(), "switch_network"))
    }
}

/// Providers by name
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn WalletProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `provider`, replacing one registered under the same name
    pub fn register(&self, provider: Arc<dyn WalletProvider>) {
        let name = provider.name().to_string();
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        if providers.insert(name.clone(), provider).is_some() {
            log::debug!("Replaced wallet provider {}", name);
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn WalletProvider>> {
        let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
        providers
            .get(name)
            .cloned()
            .ok_or_else(|| LaserError::ProviderNotFound(name.to_string()))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Probe every provider concurrently
    pub async fn probe_all(&self, timeout: Duration) -> Vec<(String, Availability)> {
        let providers: Vec<Arc<dyn WalletProvider>> = {
            let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
            providers.values().cloned().collect()
        };
        let probes = providers.iter().map(|p| async move {
            let availability = match tokio::time::timeout(timeout, p.probe_availability(timeout)).await {
                Ok(availability) => availability,
                Err(_) => Availability::Unavailable,
            };
            (p.name().to_string(), availability)
        });
        let mut results = futures::future::join_all(probes).await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}
