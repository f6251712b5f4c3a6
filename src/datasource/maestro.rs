//! Maestro REST data source
//!
//! Requests carry the `api-key` header. List endpoints page forward with an
//! opaque cursor; [`paginate`] turns that into the offset/limit contract the
//! rest of the crate expects.

use std::future::Future;
use std::str::FromStr;

use async_trait::async_trait;
use bitcoin::{ScriptBuf, Txid};
use serde_json::{json, Value};

use super::normalize::{
    aggregate_rune_balances, field, field_str, field_u64, normalize_brc20_balances, normalize_inscription,
};
use super::{
    resolve_endpoint, Brc20Balance, Capability, DataSource, Endpoint, EndpointSlot, InscriptionRecord,
    TransactionInfo, TxOutputInfo,
};
use crate::config::{ClientConfig, SourceConfig};
use crate::error::{LaserError, Result};
use crate::network::Network;
use crate::utxo::{AssetBalance, RuneAmount, RuneId, Utxo};

pub const NAME: &str = "maestro";

/// Largest page requested while skipping to an offset
pub const PAGE_SIZE: usize = 100;

const CAPABILITIES: &[Capability] = &[
    Capability::BtcBalance,
    Capability::Utxos,
    Capability::Inscriptions,
    Capability::InscriptionInfo,
    Capability::Brc20Balances,
    Capability::RuneBalances,
    Capability::Broadcast,
    Capability::Transaction,
    Capability::RawTransaction,
];

fn default_url(network: Network) -> Option<&'static str> {
    match network {
        Network::Mainnet => Some("https://xbt-mainnet.gomaestro-api.org/v0"),
        Network::Testnet4 => Some("https://xbt-testnet.gomaestro-api.org/v0"),
        _ => None,
    }
}

/// One page of a cursor-paged listing
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
}

impl Page {
    fn from_response(response: &Value) -> Self {
        Self {
            items: response["data"].as_array().cloned().unwrap_or_default(),
            next_cursor: field_str(response, &["next_cursor"]).filter(|c| !c.is_empty()),
        }
    }
}

/// Offset/limit over a forward-only cursor
///
/// Skips `offset` items in batches of at most [`PAGE_SIZE`], then fetches one
/// page of `limit`. A cursor that runs out before the offset is reached
/// yields an empty result.
pub async fn paginate<F, Fut>(offset: usize, limit: usize, mut fetch: F) -> Result<Vec<Value>>
where
    F: FnMut(Option<String>, usize) -> Fut,
    Fut: Future<Output = Result<Page>>,
{
    if limit == 0 {
        return Ok(Vec::new());
    }

    let mut cursor = None;
    let mut remaining = offset;
    while remaining > 0 {
        let page = fetch(cursor.take(), remaining.min(PAGE_SIZE)).await?;
        if page.items.is_empty() {
            return Ok(Vec::new());
        }
        remaining = remaining.saturating_sub(page.items.len());
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(Vec::new()),
        }
    }

    let mut page = fetch(cursor, limit).await?;
    page.items.truncate(limit);
    Ok(page.items)
}

/// Maestro UTXO entry, including the runes and inscriptions it reports
fn maestro_utxo(entry: &Value) -> Result<Utxo> {
    let txid = field_str(entry, &["txid"]).ok_or_else(|| LaserError::Parse("utxo without txid".to_string()))?;
    let txid = Txid::from_str(&txid).map_err(|e| LaserError::Parse(format!("utxo txid: {}", e)))?;
    let vout = field_u64(entry, &["vout"])
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| LaserError::Parse("utxo without vout".to_string()))?;
    let value = field_u64(entry, &["satoshis", "value"]).ok_or_else(|| LaserError::Parse("utxo without value".to_string()))?;
    let script = field_str(entry, &["script_pubkey"]).unwrap_or_default();
    let script_pubkey = ScriptBuf::from_hex(&script).map_err(|e| LaserError::Parse(format!("utxo script: {}", e)))?;

    let mut utxo = Utxo::new(txid, vout, value, script_pubkey);
    utxo.confirmations = field_u64(entry, &["confirmations"]).and_then(|c| u32::try_from(c).ok());
    utxo.inscriptions = entry["inscriptions"]
        .as_array()
        .map(|list| list.iter().filter_map(|i| field_str(i, &["inscription_id"])).collect())
        .unwrap_or_default();
    utxo.runes = entry["runes"]
        .as_array()
        .map(|list| list.iter().filter_map(maestro_rune).collect())
        .unwrap_or_default();
    Ok(utxo)
}

/// Rune holding keyed by id, with the amount as a decimal string
fn maestro_rune(entry: &Value) -> Option<RuneAmount> {
    let id = field_str(entry, &["rune_id", "id"])?;
    let amount = field_str(entry, &["amount"])?;
    rune_from_id_amount(&id, &amount)
}

fn rune_from_id_amount(id: &str, amount: &str) -> Option<RuneAmount> {
    let (whole, frac) = amount.trim().split_once('.').unwrap_or((amount.trim(), ""));
    let divisibility = u8::try_from(frac.len()).ok()?;
    Some(RuneAmount {
        id: RuneId::from_str(id).ok(),
        name: id.to_string(),
        amount: format!("{}{}", whole, frac).parse().ok()?,
        divisibility,
        symbol: None,
    })
}

/// Transaction detail in Maestro's shape
fn maestro_transaction(txid: &str, data: &Value) -> TransactionInfo {
    let outputs = field(data, &["outputs", "vout"])
        .and_then(Value::as_array)
        .map(|outs| {
            outs.iter()
                .map(|out| TxOutputInfo {
                    value: field_u64(out, &["satoshis", "value"]).unwrap_or(0),
                    script_pubkey: field_str(out, &["script_pubkey", "scriptpubkey"]).unwrap_or_default(),
                    address: field_str(out, &["address"]),
                })
                .collect()
        })
        .unwrap_or_default();
    let block_height = field_u64(data, &["height", "block_height"]);
    TransactionInfo {
        txid: field_str(data, &["tx_hash", "txid"]).unwrap_or_else(|| txid.to_string()),
        confirmed: block_height.is_some() || field_u64(data, &["confirmations"]).is_some_and(|c| c > 0),
        block_height,
        fee: field_u64(data, &["fees", "fee"]),
        outputs,
    }
}

pub struct MaestroSource {
    client: reqwest::Client,
    config: SourceConfig,
    endpoint: EndpointSlot,
}

impl MaestroSource {
    pub fn new(config: &ClientConfig) -> Self {
        let source = config.data_sources.maestro.clone();
        let endpoint = EndpointSlot::new(resolve_endpoint(NAME, &source, default_url, config.network, None));
        Self {
            client: reqwest::Client::new(),
            config: source,
            endpoint,
        }
    }

    fn request(&self, endpoint: &Endpoint, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let key = endpoint
            .api_key
            .as_deref()
            .ok_or_else(|| LaserError::Config(format!("{} has no API key for {}", NAME, endpoint.network)))?;
        Ok(builder.header("api-key", key))
    }

    async fn get(&self, endpoint: &Endpoint, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", endpoint.url, path);
        log::debug!("GET {}", url);
        let response = self
            .request(endpoint, self.client.get(&url).query(query))?
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LaserError::Http(format!("{} returned {}: {}", url, status, text)));
        }
        Ok(response.json().await?)
    }

    async fn page(&self, endpoint: &Endpoint, path: &str, cursor: Option<String>, count: usize) -> Result<Page> {
        let mut query = vec![("count", count.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        Ok(Page::from_response(&self.get(endpoint, path, &query).await?))
    }
}

#[async_trait]
impl DataSource for MaestroSource {
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
        let response = self.get(&endpoint, &format!("/addresses/{}/balance", address), &[]).await?;
        field(&response, &["data"])
            .and_then(super::normalize::json_u64)
            .ok_or_else(|| LaserError::Parse(format!("balance response for {}", address)))
    }

    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>> {
        let endpoint = self.endpoint.snapshot()?;
        let path = format!("/addresses/{}/utxos", address);
        let mut utxos = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.page(&endpoint, &path, cursor, PAGE_SIZE).await?;
            for entry in &page.items {
                utxos.push(maestro_utxo(entry)?);
            }
            match page.next_cursor {
                Some(next) if !page.items.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(utxos)
    }

    async fn get_inscriptions(&self, address: &str, offset: usize, limit: usize) -> Result<Vec<InscriptionRecord>> {
        let endpoint = self.endpoint.snapshot()?;
        let path = format!("/addresses/{}/inscriptions", address);
        let listed = paginate(offset, limit, |cursor, count| {
            let endpoint = endpoint.clone();
            let path = path.clone();
            async move { self.page(&endpoint, &path, cursor, count).await }
        })
        .await?;

        // Listing entries lack content details; merge each with its lookup
        let details = futures::future::join_all(listed.iter().map(|entry| {
            let endpoint = endpoint.clone();
            async move {
                let id = field_str(entry, &["inscription_id"])?;
                self.get(&endpoint, &format!("/assets/inscriptions/{}", id), &[])
                    .await
                    .map_err(|e| log::warn!("Inscription {} detail failed: {}", id, e))
                    .ok()
            }
        }))
        .await;

        listed
            .into_iter()
            .zip(details)
            .map(|(mut entry, detail)| {
                if let (Value::Object(fields), Some(Value::Object(extra))) =
                    (&mut entry, detail.map(|d| d["data"].clone()))
                {
                    fields.extend(extra);
                }
                normalize_inscription(&entry, Some(address), endpoint.network)
            })
            .collect()
    }

    async fn get_inscription(&self, inscription_id: &str) -> Result<InscriptionRecord> {
        let endpoint = self.endpoint.snapshot()?;
        let response = self
            .get(&endpoint, &format!("/assets/inscriptions/{}", inscription_id), &[])
            .await?;
        normalize_inscription(&response["data"], None, endpoint.network)
    }

    async fn get_brc20_balances(&self, address: &str) -> Result<Vec<Brc20Balance>> {
        let endpoint = self.endpoint.snapshot()?;
        let response = self.get(&endpoint, &format!("/addresses/{}/brc20", address), &[]).await?;
        Ok(normalize_brc20_balances(&response))
    }

    async fn get_rune_balances(&self, address: &str) -> Result<Vec<AssetBalance>> {
        let endpoint = self.endpoint.snapshot()?;
        let response = self.get(&endpoint, &format!("/addresses/{}/runes", address), &[]).await?;
        let runes: Vec<RuneAmount> = match &response["data"] {
            Value::Object(map) => map
                .iter()
                .filter_map(|(id, amount)| rune_from_id_amount(id, amount.as_str()?))
                .collect(),
            Value::Array(list) => list.iter().filter_map(maestro_rune).collect(),
            _ => Vec::new(),
        };
        Ok(aggregate_rune_balances(runes))
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String> {
        let endpoint = self.endpoint.snapshot()?;
        let url = format!("{}/rpc/transaction/submit", endpoint.url);
        log::debug!("POST {}", url);
        let response = self
            .request(&endpoint, self.client.post(&url).json(&json!(tx_hex)))?
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LaserError::Http(format!("broadcast rejected ({}): {}", status, text)));
        }
        let reply: Value = response.json().await?;
        let txid = field_str(&reply, &["data"])
            .ok_or_else(|| LaserError::Parse(format!("unexpected broadcast reply {}", reply)))?;
        log::info!("Broadcast {} via {}", txid, NAME);
        Ok(txid)
    }

    async fn get_transaction(&self, txid: &str) -> Result<TransactionInfo> {
        let endpoint = self.endpoint.snapshot()?;
        let response = self.get(&endpoint, &format!("/transactions/{}", txid), &[]).await?;
        Ok(maestro_transaction(txid, &response["data"]))
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<String> {
        let endpoint = self.endpoint.snapshot()?;
        let response = self
            .get(&endpoint, &format!("/rpc/transaction/{}", txid), &[("verbose", "false".to_string())])
            .await?;
        field_str(&response, &["data"]).ok_or_else(|| LaserError::Parse(format!("no raw transaction for {}", txid)))
    }
}
