//! Sandshrew JSON-RPC data source
//!
//! One endpoint proxies ord, esplora, bitcoind and the alkanes indexer.
//! Per-output lookups go through `sandshrew_multicall` in batches.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use bitcoin::{OutPoint, ScriptBuf, Txid};
use serde_json::{json, Value};

use super::normalize::{
    aggregate_rune_balances, esplora_transaction, esplora_utxos, field, field_str, field_u64,
    normalize_inscription, normalize_rune_amount, parse_outpoint,
};
use super::{
    resolve_endpoint, Capability, DataSource, Endpoint, EndpointSlot, InscriptionRecord, OutputAnnotation,
    TransactionInfo,
};
use crate::address;
use crate::codec::protostone::ALKANES_PROTOCOL_TAG;
use crate::config::{ClientConfig, SourceConfig, DEFAULT_SANDSHREW_API_KEY};
use crate::error::{LaserError, Result};
use crate::network::Network;
use crate::utxo::{AlkaneAmount, AlkaneId, AssetBalance, RuneAmount, RuneId, Utxo};

pub const NAME: &str = "sandshrew";

/// Largest batch a single `sandshrew_multicall` carries
pub const MAX_MULTICALL: usize = 1000;

const CAPABILITIES: &[Capability] = &[
    Capability::BtcBalance,
    Capability::Utxos,
    Capability::Inscriptions,
    Capability::InscriptionInfo,
    Capability::RuneBalances,
    Capability::RuneOutpoints,
    Capability::Alkanes,
    Capability::OutputAnnotations,
    Capability::Broadcast,
    Capability::Transaction,
    Capability::RawTransaction,
];

fn default_url(network: Network) -> Option<&'static str> {
    match network {
        Network::Mainnet => Some("https://mainnet.sandshrew.io/v2"),
        Network::Testnet => Some("https://testnet.sandshrew.io/v2"),
        Network::Signet => Some("https://signet.sandshrew.io/v2"),
        Network::Oylnet => Some("https://ladder-chain-sieve.sandshrew.io/v2"),
        Network::Testnet4 | Network::Regtest | Network::FractalMainnet | Network::FractalTestnet => None,
    }
}

/// Integer given as a JSON number, a decimal string or a `0x` hex string
fn flexible_u128(value: &Value) -> Option<u128> {
    match value {
        Value::Number(n) => n.as_u64().map(u128::from),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x") {
                Some(hex) => u128::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        _ => None,
    }
}

/// Txid from the little-endian hex the alkanes indexer reports
fn txid_from_le_hex(hex_txid: &str) -> Result<Txid> {
    let mut bytes = hex::decode(hex_txid)?;
    bytes.reverse();
    Txid::from_str(&hex::encode(bytes)).map_err(|e| LaserError::Parse(format!("txid: {}", e)))
}

/// One `alkanes_protorunesbyaddress` entry as an annotated output
fn alkane_outpoint(entry: &Value) -> Result<Utxo> {
    let outpoint = &entry["outpoint"];
    let txid = field_str(outpoint, &["txid"]).ok_or_else(|| LaserError::Parse("alkane outpoint without txid".to_string()))?;
    let txid = txid_from_le_hex(&txid)?;
    let vout = field_u64(outpoint, &["vout"])
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| LaserError::Parse("alkane outpoint without vout".to_string()))?;
    let output = &entry["output"];
    let value = field_u64(output, &["value"]).unwrap_or(0);
    let script = field_str(output, &["script"]).unwrap_or_default();
    let script_pubkey = ScriptBuf::from_hex(&script).map_err(|e| LaserError::Parse(format!("alkane script: {}", e)))?;

    let mut utxo = Utxo::new(txid, vout, value, script_pubkey);
    let holdings = field(entry, &["runes", "balance_sheet"])
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for holding in &holdings {
        let rune = &holding["rune"];
        let id = &rune["id"];
        let (Some(block), Some(tx)) = (
            field(id, &["block"]).and_then(flexible_u128),
            field(id, &["tx"]).and_then(flexible_u128),
        ) else {
            continue;
        };
        let amount = field(holding, &["balance", "amount"]).and_then(flexible_u128).unwrap_or(0);
        if amount == 0 {
            continue;
        }
        utxo.alkanes.push(AlkaneAmount {
            id: AlkaneId::new(block, tx),
            amount,
            name: field_str(rune, &["name"]),
            symbol: field_str(rune, &["symbol"]),
        });
    }
    Ok(utxo)
}

/// Runes held by an `ord_output` result; ord keys them by spaced name
fn output_runes(output: &Value) -> Vec<RuneAmount> {
    match &output["runes"] {
        Value::Object(map) => map
            .iter()
            .filter_map(|(name, rune)| {
                let mut entry = rune.clone();
                if let Value::Object(fields) = &mut entry {
                    fields.entry("name").or_insert_with(|| Value::String(name.clone()));
                }
                normalize_rune_amount(&entry)
            })
            .collect(),
        Value::Array(tuples) => tuples.iter().filter_map(normalize_rune_amount).collect(),
        _ => Vec::new(),
    }
}

fn output_inscriptions(output: &Value) -> Vec<String> {
    output["inscriptions"]
        .as_array()
        .map(|ids| ids.iter().filter_map(|id| id.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

pub struct SandshrewSource {
    client: reqwest::Client,
    config: SourceConfig,
    endpoint: EndpointSlot,
}

impl SandshrewSource {
    pub fn new(config: &ClientConfig) -> Self {
        let source = config.data_sources.sandshrew.clone();
        let endpoint = EndpointSlot::new(resolve_endpoint(NAME, &source, default_url, config.network, None));
        Self {
            client: reqwest::Client::new(),
            config: source,
            endpoint,
        }
    }

    fn rpc_url(endpoint: &Endpoint) -> String {
        format!(
            "{}/{}",
            endpoint.url,
            endpoint.api_key.as_deref().unwrap_or(DEFAULT_SANDSHREW_API_KEY)
        )
    }

    /// Single JSON-RPC call, returning `result`
    async fn call(&self, endpoint: &Endpoint, method: &str, params: Value) -> Result<Value> {
        let url = Self::rpc_url(endpoint);
        log::debug!("{} {}", NAME, method);
        let body = json!({
            "jsonrpc": "2.0",
            "id": method,
            "method": method,
            "params": params,
        });
        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LaserError::Http(format!("{} {} returned {}: {}", NAME, method, status, text)));
        }
        let reply: Value = response.json().await?;
        if let Some(error) = field(&reply, &["error"]) {
            let message = field_str(error, &["message"]).unwrap_or_else(|| error.to_string());
            return Err(LaserError::Rpc(format!("{}: {}", method, message)));
        }
        Ok(reply["result"].clone())
    }

    /// `calls` through `sandshrew_multicall`, at most [`MAX_MULTICALL`] per request
    ///
    /// Results come back in call order; a failed sub-call fails the whole batch.
    async fn multicall(&self, endpoint: &Endpoint, calls: Vec<(&str, Value)>) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(calls.len());
        for batch in calls.chunks(MAX_MULTICALL) {
            let params: Vec<Value> = batch.iter().map(|(method, params)| json!([method, params])).collect();
            let replies = self.call(endpoint, "sandshrew_multicall", Value::Array(params)).await?;
            let replies = replies
                .as_array()
                .ok_or_else(|| LaserError::Rpc("multicall result is not an array".to_string()))?;
            if replies.len() != batch.len() {
                return Err(LaserError::Rpc(format!(
                    "multicall returned {} results for {} calls",
                    replies.len(),
                    batch.len()
                )));
            }
            for (reply, (method, _)) in replies.iter().zip(batch) {
                if let Some(error) = field(reply, &["error"]) {
                    return Err(LaserError::Rpc(format!("{}: {}", method, error)));
                }
                results.push(reply["result"].clone());
            }
        }
        Ok(results)
    }

    async fn ord_address(&self, endpoint: &Endpoint, address: &str) -> Result<Value> {
        self.call(endpoint, "ord_address", json!([address])).await
    }

    /// `ord_output` for every outpoint, paired with the outpoint text
    async fn ord_outputs(&self, endpoint: &Endpoint, outpoints: &[String]) -> Result<Vec<(String, Value)>> {
        let calls = outpoints.iter().map(|o| ("ord_output", json!([o]))).collect();
        let results = self.multicall(endpoint, calls).await?;
        Ok(outpoints.iter().cloned().zip(results).collect())
    }

    /// Fill in rune ids, which `ord_output` leaves out, through `ord_rune`
    async fn resolve_rune_ids(&self, endpoint: &Endpoint, utxos: &mut [Utxo]) -> Result<()> {
        let mut names: Vec<String> = utxos
            .iter()
            .flat_map(|u| u.runes.iter().filter(|r| r.id.is_none()).map(|r| r.name.clone()))
            .collect();
        names.sort();
        names.dedup();
        if names.is_empty() {
            return Ok(());
        }

        let calls = names.iter().map(|name| ("ord_rune", json!([name]))).collect();
        let entries = self.multicall(endpoint, calls).await?;
        let ids: HashMap<String, RuneId> = names
            .into_iter()
            .zip(entries)
            .filter_map(|(name, entry)| {
                let id = field_str(&entry, &["id"])?;
                Some((name, RuneId::from_str(&id).ok()?))
            })
            .collect();

        for rune in utxos.iter_mut().flat_map(|u| u.runes.iter_mut()) {
            if rune.id.is_none() {
                rune.id = ids.get(&rune.name).copied();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DataSource for SandshrewSource {
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
        let info = self.call(&endpoint, "esplora_address", json!([address])).await?;
        let stat = |section: &str, key: &str| info[section][key].as_u64().unwrap_or(0);
        let confirmed = stat("chain_stats", "funded_txo_sum").saturating_sub(stat("chain_stats", "spent_txo_sum"));
        let unconfirmed =
            stat("mempool_stats", "funded_txo_sum").saturating_sub(stat("mempool_stats", "spent_txo_sum"));
        Ok(confirmed + unconfirmed)
    }

    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>> {
        let endpoint = self.endpoint.snapshot()?;
        let script_pubkey = address::script_pubkey(address, endpoint.network)?;
        let listing = self.call(&endpoint, "esplora_address::utxo", json!([address])).await?;
        let tip = self
            .call(&endpoint, "btc_getblockcount", json!([]))
            .await
            .ok()
            .and_then(|v| v.as_u64());
        esplora_utxos(&listing, &script_pubkey, tip)
    }

    async fn get_inscriptions(&self, address: &str, offset: usize, limit: usize) -> Result<Vec<InscriptionRecord>> {
        let endpoint = self.endpoint.snapshot()?;
        let info = self.ord_address(&endpoint, address).await?;
        let ids: Vec<String> = info["inscriptions"]
            .as_array()
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(str::to_string))
                    .skip(offset)
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default();

        let calls = ids.iter().map(|id| ("ord_inscription", json!([id]))).collect();
        let details = self.multicall(&endpoint, calls).await?;
        details
            .iter()
            .map(|detail| normalize_inscription(detail, Some(address), endpoint.network))
            .collect()
    }

    async fn get_inscription(&self, inscription_id: &str) -> Result<InscriptionRecord> {
        let endpoint = self.endpoint.snapshot()?;
        let detail = self.call(&endpoint, "ord_inscription", json!([inscription_id])).await?;
        normalize_inscription(&detail, None, endpoint.network)
    }

    async fn get_rune_balances(&self, address: &str) -> Result<Vec<AssetBalance>> {
        let endpoint = self.endpoint.snapshot()?;
        let info = self.ord_address(&endpoint, address).await?;
        let balances = info["runes_balances"]
            .as_array()
            .ok_or_else(|| LaserError::Parse(format!("no rune balances for {}", address)))?;
        Ok(aggregate_rune_balances(balances.iter().filter_map(normalize_rune_amount)))
    }

    async fn get_rune_outpoints(&self, address: &str) -> Result<Vec<Utxo>> {
        let endpoint = self.endpoint.snapshot()?;
        let info = self.ord_address(&endpoint, address).await?;
        let outpoints: Vec<String> = info["outputs"]
            .as_array()
            .map(|outs| outs.iter().filter_map(|o| o.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let mut utxos = Vec::new();
        for (outpoint, output) in self.ord_outputs(&endpoint, &outpoints).await? {
            let runes = output_runes(&output);
            if runes.is_empty() {
                continue;
            }
            let point = parse_outpoint(&outpoint)?;
            let script = field_str(&output, &["script_pubkey"]).unwrap_or_default();
            let script_pubkey =
                ScriptBuf::from_hex(&script).map_err(|e| LaserError::Parse(format!("{}: {}", outpoint, e)))?;
            let mut utxo = Utxo::new(point.txid, point.vout, field_u64(&output, &["value"]).unwrap_or(0), script_pubkey);
            utxo.runes = runes;
            utxo.inscriptions = output_inscriptions(&output);
            utxos.push(utxo);
        }
        self.resolve_rune_ids(&endpoint, &mut utxos).await?;
        log::debug!("{} rune outputs for {}", utxos.len(), address);
        Ok(utxos)
    }

    async fn get_alkanes_by_address(&self, address: &str) -> Result<Vec<Utxo>> {
        let endpoint = self.endpoint.snapshot()?;
        let result = self
            .call(
                &endpoint,
                "alkanes_protorunesbyaddress",
                json!([{ "address": address, "protocolTag": ALKANES_PROTOCOL_TAG.to_string() }]),
            )
            .await?;
        let entries = field(&result, &["outpoints"])
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let utxos: Vec<Utxo> = entries.iter().map(alkane_outpoint).collect::<Result<_>>()?;
        Ok(utxos.into_iter().filter(|u| u.has_alkanes()).collect())
    }

    async fn get_output_annotations(&self, outpoints: &[OutPoint]) -> Result<Vec<OutputAnnotation>> {
        let endpoint = self.endpoint.snapshot()?;
        let outpoints: Vec<String> = outpoints.iter().map(|o| o.to_string()).collect();
        Ok(self
            .ord_outputs(&endpoint, &outpoints)
            .await?
            .into_iter()
            .map(|(outpoint, output)| OutputAnnotation {
                outpoint,
                inscriptions: output_inscriptions(&output),
                runes: output_runes(&output),
            })
            .collect())
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String> {
        let endpoint = self.endpoint.snapshot()?;
        let result = self.call(&endpoint, "sendrawtransaction", json!([tx_hex])).await?;
        let txid = result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LaserError::Rpc(format!("unexpected broadcast result {}", result)))?;
        log::info!("Broadcast {} via {}", txid, NAME);
        Ok(txid)
    }

    async fn get_transaction(&self, txid: &str) -> Result<TransactionInfo> {
        let endpoint = self.endpoint.snapshot()?;
        let tx = self.call(&endpoint, "esplora_tx", json!([txid])).await?;
        esplora_transaction(&tx)
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<String> {
        let endpoint = self.endpoint.snapshot()?;
        let hex = self.call(&endpoint, "esplora_tx::hex", json!([txid])).await?;
        hex.as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| LaserError::Rpc(format!("no raw transaction for {}", txid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints() {
        let source = SandshrewSource::new(&ClientConfig::default());
        let endpoint = source.endpoint.snapshot().unwrap();
        assert_eq!(SandshrewSource::rpc_url(&endpoint), "https://mainnet.sandshrew.io/v2/lasereyes");

        source.set_network(Network::Oylnet, None);
        assert_eq!(
            source.endpoint.snapshot().unwrap().url,
            "https://ladder-chain-sieve.sandshrew.io/v2"
        );

        source.set_network(Network::FractalMainnet, None);
        assert!(matches!(source.endpoint.snapshot(), Err(LaserError::UnsupportedNetwork(_))));
    }

    #[test]
    fn test_configured_key_used() {
        let mut config = ClientConfig::default();
        config.data_sources.sandshrew.api_key = Some("mykey".to_string());
        let source = SandshrewSource::new(&config);
        let endpoint = source.endpoint.snapshot().unwrap();
        assert_eq!(SandshrewSource::rpc_url(&endpoint), "https://mainnet.sandshrew.io/v2/mykey");
    }

    #[test]
    fn test_flexible_u128() {
        assert_eq!(flexible_u128(&json!("0x10")), Some(16));
        assert_eq!(flexible_u128(&json!("42")), Some(42));
        assert_eq!(flexible_u128(&json!(7)), Some(7));
        assert_eq!(flexible_u128(&json!(null)), None);
    }

    #[test]
    fn test_alkane_outpoint_reverses_txid() {
        let le = "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000";
        let entry = json!({
            "outpoint": {"txid": le, "vout": 1},
            "output": {"value": 546, "script": "5120aa"},
            "runes": [
                {"rune": {"id": {"block": "0x2", "tx": "0x1"}, "name": "DIESEL", "symbol": "D"}, "balance": "0x64"},
                {"rune": {"id": {"block": "0x2", "tx": "0x9"}}, "balance": "0"},
            ],
        });
        let utxo = alkane_outpoint(&entry).unwrap();
        assert_eq!(
            utxo.txid.to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(utxo.vout, 1);
        assert_eq!(utxo.alkanes.len(), 1);
        assert_eq!(utxo.alkanes[0].id, AlkaneId::new(2, 1));
        assert_eq!(utxo.alkanes[0].amount, 100);
        assert_eq!(utxo.value, 546);
    }

    #[test]
    fn test_output_runes_named_map() {
        let output = json!({
            "runes": {"UNCOMMON•GOODS": {"amount": 1500, "divisibility": 2, "symbol": "⧉"}},
            "inscriptions": ["abci0"],
        });
        let runes = output_runes(&output);
        assert_eq!(runes.len(), 1);
        assert_eq!(runes[0].name, "UNCOMMON•GOODS");
        assert_eq!(runes[0].amount, 1500);
        assert_eq!(runes[0].divisibility, 2);
        assert_eq!(output_inscriptions(&output), vec!["abci0".to_string()]);
    }
}
