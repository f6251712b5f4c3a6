//! Backend data sources
//!
//! # Architecture
//!
//! A [`DataSource`] is one backend (mempool.space, Sandshrew, Maestro). Each
//! method is optional: a source advertises what it can answer through
//! [`DataSource::capabilities`], and every method it does not implement
//! answers [`LaserError::UnsupportedByDataSource`].
//!
//! Sources are shared behind `Arc` and re-targeted with
//! [`DataSource::set_network`] between requests. Each request snapshots the
//! current [`Endpoint`] once, so a concurrent network switch never mixes two
//! endpoints inside one call.
//!
//! The [`manager::DataSourceManager`] owns the registry and the fallback
//! chain. [`normalize`] folds the differing response shapes into the types
//! below.

pub mod maestro;
pub mod manager;
pub mod mempool;
pub mod normalize;
pub mod sandshrew;

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};

use crate::config::SourceConfig;
use crate::error::{LaserError, Result};
use crate::network::Network;
use crate::utxo::{AssetBalance, Utxo};

/// Questions a data source may be able to answer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    BtcBalance,
    Utxos,
    Inscriptions,
    InscriptionInfo,
    Brc20Balances,
    RuneBalances,
    RuneOutpoints,
    Alkanes,
    OutputAnnotations,
    RecommendedFees,
    Broadcast,
    Transaction,
    RawTransaction,
    WaitForTransaction,
    OutputValue,
}

/// Fee rates in sat/vB
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecommendedFees {
    pub fast: f64,
    pub min: f64,
}

/// An inscription, whatever source reported it
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InscriptionRecord {
    pub id: String,
    pub number: Option<i64>,
    pub address: Option<String>,
    pub content_type: Option<String>,
    pub content_url: String,
    pub preview_url: String,
    /// `txid:vout` of the output currently holding it
    pub output: Option<String>,
    pub offset: u64,
    pub output_value: Option<u64>,
    pub height: Option<u64>,
    pub genesis_txid: Option<String>,
    pub timestamp: Option<i64>,
}

/// BRC-20 balance with amounts kept as the decimal strings the indexer reports
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Brc20Balance {
    pub ticker: String,
    pub overall: String,
    pub transferable: String,
    pub available: String,
}

/// Protocol state an indexer reports for one output
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputAnnotation {
    pub outpoint: String,
    pub inscriptions: Vec<String>,
    pub runes: Vec<crate::utxo::RuneAmount>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutputInfo {
    pub value: u64,
    pub script_pubkey: String,
    pub address: Option<String>,
}

/// Transaction lookup result
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub txid: String,
    pub confirmed: bool,
    pub block_height: Option<u64>,
    pub fee: Option<u64>,
    pub outputs: Vec<TxOutputInfo>,
}

/// Where a source currently sends its requests
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub network: Network,
    pub url: String,
    pub api_key: Option<String>,
}

/// Current endpoint of a source, swapped atomically on network change
///
/// An unmapped network is stored as such and reported on the next request.
#[derive(Debug)]
pub(crate) struct EndpointSlot {
    current: RwLock<std::result::Result<Arc<Endpoint>, String>>,
}

impl EndpointSlot {
    pub(crate) fn new(endpoint: std::result::Result<Endpoint, String>) -> Self {
        Self {
            current: RwLock::new(endpoint.map(Arc::new)),
        }
    }

    pub(crate) fn set(&self, endpoint: std::result::Result<Endpoint, String>) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = endpoint.map(Arc::new);
    }

    pub(crate) fn snapshot(&self) -> Result<Arc<Endpoint>> {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        current.clone().map_err(LaserError::UnsupportedNetwork)
    }
}

/// Resolve `network` (or the custom network `custom_id` built on it) for one source
///
/// Explicit overrides win, then the built-in table. A network neither knows is
/// unsupported; there is no fallback to mainnet.
pub(crate) fn resolve_endpoint(
    source: &str,
    config: &SourceConfig,
    defaults: fn(Network) -> Option<&'static str>,
    network: Network,
    custom_id: Option<&str>,
) -> std::result::Result<Endpoint, String> {
    let mut settings = config.endpoint_for(network.id());
    if let Some(id) = custom_id {
        let custom = config.endpoint_for(id);
        settings.url = custom.url.or(settings.url);
        settings.api_key = custom.api_key.or(settings.api_key);
    }
    let url = settings
        .url
        .or_else(|| defaults(network).map(str::to_string))
        .ok_or_else(|| format!("{} has no endpoint for {}", source, custom_id.unwrap_or(network.id())))?;
    Ok(Endpoint {
        network,
        url: url.trim_end_matches('/').to_string(),
        api_key: settings.api_key,
    })
}

/// Poll `check` every `interval` until it yields a value or `timeout` passes
///
/// Errors from `check` count as "not yet".
pub(crate) async fn poll_until<T, F, Fut>(interval: Duration, timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match check().await {
            Ok(Some(value)) => return Some(value),
            Ok(None) => {}
            Err(e) => log::debug!("Poll attempt failed: {}", e),
        }
        if tokio::time::Instant::now() + interval > deadline {
            return None;
        }
        tokio::time::sleep(interval).await;
    }
}

fn unsupported<T>(source: &str, method: &str) -> Result<T> {
    Err(LaserError::UnsupportedByDataSource(format!("{} does not support {}", source, method)))
}

/// One backend provider of chain and indexer data
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Re-target to `network`; `custom_id` names a custom network built on it
    fn set_network(&self, network: Network, custom_id: Option<&str>);

    async fn get_btc_balance(&self, _address: &str) -> Result<u64> {
        unsupported(self.name(), "get_btc_balance")
    }

    async fn get_utxos(&self, _address: &str) -> Result<Vec<Utxo>> {
        unsupported(self.name(), "get_utxos")
    }

    async fn get_inscriptions(
        &self,
        _address: &str,
        _offset: usize,
        _limit: usize,
    ) -> Result<Vec<InscriptionRecord>> {
        unsupported(self.name(), "get_inscriptions")
    }

    async fn get_inscription(&self, _inscription_id: &str) -> Result<InscriptionRecord> {
        unsupported(self.name(), "get_inscription")
    }

    async fn get_brc20_balances(&self, _address: &str) -> Result<Vec<Brc20Balance>> {
        unsupported(self.name(), "get_brc20_balances")
    }

    async fn get_rune_balances(&self, _address: &str) -> Result<Vec<AssetBalance>> {
        unsupported(self.name(), "get_rune_balances")
    }

    /// Outputs of `address` holding any rune, annotated
    async fn get_rune_outpoints(&self, _address: &str) -> Result<Vec<Utxo>> {
        unsupported(self.name(), "get_rune_outpoints")
    }

    /// Outputs of `address` holding any alkane, annotated
    async fn get_alkanes_by_address(&self, _address: &str) -> Result<Vec<Utxo>> {
        unsupported(self.name(), "get_alkanes_by_address")
    }

    async fn get_output_annotations(&self, _outpoints: &[OutPoint]) -> Result<Vec<OutputAnnotation>> {
        unsupported(self.name(), "get_output_annotations")
    }

    async fn get_recommended_fees(&self) -> Result<RecommendedFees> {
        unsupported(self.name(), "get_recommended_fees")
    }

    /// Broadcast raw transaction hex, returning the txid
    async fn broadcast(&self, _tx_hex: &str) -> Result<String> {
        unsupported(self.name(), "broadcast")
    }

    async fn get_transaction(&self, _txid: &str) -> Result<TransactionInfo> {
        unsupported(self.name(), "get_transaction")
    }

    async fn get_raw_transaction(&self, _txid: &str) -> Result<String> {
        unsupported(self.name(), "get_raw_transaction")
    }

    /// Whether `txid` showed up before the poll timeout
    async fn wait_for_transaction(&self, _txid: &str) -> Result<bool> {
        unsupported(self.name(), "wait_for_transaction")
    }

    /// Value of output `vout` of `txid`, polling until the transaction is seen
    async fn get_output_value(&self, _txid: &str, _vout: u32) -> Result<Option<u64>> {
        unsupported(self.name(), "get_output_value")
    }
}
