//! mempool.space (esplora REST) data source

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::normalize::{esplora_transaction, esplora_utxos, field};
use super::{
    poll_until, resolve_endpoint, Capability, DataSource, Endpoint, EndpointSlot, RecommendedFees,
    TransactionInfo,
};
use crate::address;
use crate::config::{ClientConfig, SourceConfig};
use crate::error::{LaserError, Result};
use crate::network::Network;
use crate::utxo::Utxo;

pub const NAME: &str = "mempool";

const CAPABILITIES: &[Capability] = &[
    Capability::BtcBalance,
    Capability::Utxos,
    Capability::RecommendedFees,
    Capability::Broadcast,
    Capability::Transaction,
    Capability::RawTransaction,
    Capability::WaitForTransaction,
    Capability::OutputValue,
];

fn default_url(network: Network) -> Option<&'static str> {
    match network {
        Network::Mainnet => Some("https://mempool.space"),
        Network::Testnet => Some("https://mempool.space/testnet"),
        Network::Testnet4 => Some("https://mempool.space/testnet4"),
        Network::Signet => Some("https://mempool.space/signet"),
        Network::FractalMainnet => Some("https://mempool.fractalbitcoin.io"),
        Network::FractalTestnet => Some("https://mempool-testnet.fractalbitcoin.io"),
        Network::Regtest | Network::Oylnet => None,
    }
}

pub struct MempoolSource {
    client: reqwest::Client,
    config: SourceConfig,
    endpoint: EndpointSlot,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl MempoolSource {
    pub fn new(config: &ClientConfig) -> Self {
        let source = config.data_sources.mempool.clone();
        let endpoint = EndpointSlot::new(resolve_endpoint(NAME, &source, default_url, config.network, None));
        Self {
            client: reqwest::Client::new(),
            config: source,
            endpoint,
            poll_interval: config.poll_interval(),
            poll_timeout: config.poll_timeout(),
        }
    }

    fn url(endpoint: &Endpoint, path: &str) -> String {
        format!("{}/api{}", endpoint.url, path)
    }

    async fn get_text(&self, endpoint: &Endpoint, path: &str) -> Result<String> {
        let url = Self::url(endpoint, path);
        log::debug!("GET {}", url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LaserError::Http(format!("{} returned {}: {}", url, status, body)));
        }
        Ok(body)
    }

    async fn get_json(&self, endpoint: &Endpoint, path: &str) -> Result<Value> {
        let body = self.get_text(endpoint, path).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn tip_height(&self, endpoint: &Endpoint) -> Result<u64> {
        let body = self.get_text(endpoint, "/blocks/tip/height").await?;
        body.trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| LaserError::Parse(format!("tip height: {}", e)))
    }
}

#[async_trait]
impl DataSource for MempoolSource {
    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn set_network(&self, network: Network, custom_id: Option<&str>) {
        self.endpoint
            .set(resolve_endpoint(NAME, &self.config, default_url, network, custom_id));
    }

    async fn get_btc_balance(&self, address: &str) -> Result<u64> {
        let endpoint = self.endpoint.snapshot()?;
        let info = self.get_json(&endpoint, &format!("/address/{}", address)).await?;

        let stat = |section: &str, key: &str| info[section][key].as_u64().unwrap_or(0);
        let confirmed = stat("chain_stats", "funded_txo_sum").saturating_sub(stat("chain_stats", "spent_txo_sum"));
        let unconfirmed =
            stat("mempool_stats", "funded_txo_sum").saturating_sub(stat("mempool_stats", "spent_txo_sum"));
        Ok(confirmed + unconfirmed)
    }

    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>> {
        let endpoint = self.endpoint.snapshot()?;
        let script_pubkey = address::script_pubkey(address, endpoint.network)?;
        let listing = self.get_json(&endpoint, &format!("/address/{}/utxo", address)).await?;
        let tip = self.tip_height(&endpoint).await.ok();
        esplora_utxos(&listing, &script_pubkey, tip)
    }

    async fn get_recommended_fees(&self) -> Result<RecommendedFees> {
        let endpoint = self.endpoint.snapshot()?;
        let fees = self.get_json(&endpoint, "/v1/fees/recommended").await?;
        let rate = |key: &str| {
            field(&fees, &[key])
                .and_then(Value::as_f64)
                .ok_or_else(|| LaserError::Parse(format!("fees response without {}", key)))
        };
        Ok(RecommendedFees {
            fast: rate("fastestFee")?,
            min: rate("minimumFee")?,
        })
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String> {
        let endpoint = self.endpoint.snapshot()?;
        let url = Self::url(&endpoint, "/tx");
        log::debug!("POST {}", url);
        let response = self.client.post(&url).body(tx_hex.to_string()).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LaserError::Http(format!("broadcast rejected ({}): {}", status, body)));
        }
        let txid = body.trim().to_string();
        log::info!("Broadcast {} via {}", txid, NAME);
        Ok(txid)
    }

    async fn get_transaction(&self, txid: &str) -> Result<TransactionInfo> {
        let endpoint = self.endpoint.snapshot()?;
        let tx = self.get_json(&endpoint, &format!("/tx/{}", txid)).await?;
        esplora_transaction(&tx)
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<String> {
        let endpoint = self.endpoint.snapshot()?;
        let hex = self.get_text(&endpoint, &format!("/tx/{}/hex", txid)).await?;
        Ok(hex.trim().to_string())
    }

    async fn wait_for_transaction(&self, txid: &str) -> Result<bool> {
        let found = poll_until(self.poll_interval, self.poll_timeout, || async move {
            self.get_transaction(txid).await.map(Some)
        })
        .await;
        Ok(found.is_some())
    }

    async fn get_output_value(&self, txid: &str, vout: u32) -> Result<Option<u64>> {
        let tx = poll_until(self.poll_interval, self.poll_timeout, || async move {
            self.get_transaction(txid).await.map(Some)
        })
        .await;
        Ok(tx.and_then(|tx| tx.outputs.get(vout as usize).map(|o| o.value)))
    }
}
