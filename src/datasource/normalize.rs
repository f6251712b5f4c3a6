//! Response normalization across data sources
//!
//! Indexers disagree on field names (`inscription_id`, `inscriptionId`, `id`)
//! and on whether amounts are numbers or strings. Everything here reads a
//! `serde_json::Value` through a list of aliases and produces the crate's
//! own types.

use std::str::FromStr;

use bitcoin::{OutPoint, ScriptBuf, Txid};
use serde_json::Value;

use super::{Brc20Balance, InscriptionRecord, TransactionInfo, TxOutputInfo};
use crate::error::{LaserError, Result};
use crate::network::Network;
use crate::utxo::{AssetBalance, AssetId, RuneAmount, RuneId, RuneRef, Utxo};

/// Content and preview hosts for inscriptions on `network`
pub fn inscription_hosts(network: Network) -> Option<(&'static str, &'static str)> {
    match network {
        Network::Mainnet => Some((
            "https://static.unisat.io/content",
            "https://static.unisat.io/preview",
        )),
        Network::Testnet => Some((
            "https://static-testnet.unisat.io/content",
            "https://static-testnet.unisat.io/preview",
        )),
        Network::Testnet4 => Some((
            "https://ordinals-testnet4.unisat.io/content",
            "https://ordinals-testnet4.unisat.io/preview",
        )),
        Network::FractalMainnet => Some((
            "https://ordinals.fractalbitcoin.io/content",
            "https://ordinals.fractalbitcoin.io/preview",
        )),
        Network::FractalTestnet => Some((
            "https://ordinals-testnet.fractalbitcoin.io/content",
            "https://ordinals-testnet.fractalbitcoin.io/preview",
        )),
        Network::Signet | Network::Regtest | Network::Oylnet => None,
    }
}

/// First present, non-null field among `keys`
pub fn field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find(|v| !v.is_null())
}

pub fn field_str(value: &Value, keys: &[&str]) -> Option<String> {
    field(value, keys).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

pub fn field_u64(value: &Value, keys: &[&str]) -> Option<u64> {
    field(value, keys).and_then(json_u64)
}

/// Integer carried either as a JSON number or a numeric string
pub fn json_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Base-unit amount carried as a number or string; u128 safe
pub fn json_u128(value: &Value) -> Option<u128> {
    match value {
        Value::Number(n) => n.as_u64().map(u128::from),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Decimal string form of a number or string amount
fn decimal_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "0".to_string(),
    }
}

/// Unix seconds from an integer, an integer string or an RFC 3339 string
pub fn json_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok().or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|t| t.timestamp())
        }),
        _ => None,
    }
}

/// Parse `txid:vout`, ignoring a trailing `:offset`
pub fn parse_outpoint(text: &str) -> Result<OutPoint> {
    let mut parts = text.split(':');
    let (Some(txid), Some(vout)) = (parts.next(), parts.next()) else {
        return Err(LaserError::Parse(format!("outpoint '{}'", text)));
    };
    let txid = Txid::from_str(txid).map_err(|e| LaserError::Parse(format!("outpoint '{}': {}", text, e)))?;
    let vout = vout
        .parse()
        .map_err(|e| LaserError::Parse(format!("outpoint '{}': {}", text, e)))?;
    Ok(OutPoint::new(txid, vout))
}

/// Inscription from any source's JSON shape
pub fn normalize_inscription(value: &Value, address: Option<&str>, network: Network) -> Result<InscriptionRecord> {
    let id = field_str(value, &["id", "inscription_id", "inscriptionId"])
        .ok_or_else(|| LaserError::Parse("inscription without an id".to_string()))?;

    let location = field_str(value, &["output", "location", "satpoint", "sat_point"]).or_else(|| {
        let txid = field_str(value, &["utxo_txid", "txid", "transaction_id"])?;
        let vout = field_u64(value, &["vout", "utxo_vout"]).unwrap_or(0);
        Some(format!("{}:{}", txid, vout))
    });
    let (output, location_offset) = match &location {
        Some(location) => {
            let parts: Vec<&str> = location.split(':').collect();
            match parts.as_slice() {
                [txid, vout] => (Some(format!("{}:{}", txid, vout)), None),
                [txid, vout, offset] => (Some(format!("{}:{}", txid, vout)), offset.parse::<u64>().ok()),
                _ => (None, None),
            }
        }
        None => (None, None),
    };

    let genesis_txid = field_str(
        value,
        &["genesis_tx_id", "genesis_txid", "genesisTx", "genesis_transaction", "genesisTransaction"],
    )
        .or_else(|| id.rsplit_once('i').map(|(txid, _)| txid.to_string()));

    let (content_url, preview_url) = match inscription_hosts(network) {
        Some((content, preview)) => (format!("{}/{}", content, id), format!("{}/{}", preview, id)),
        None => (String::new(), String::new()),
    };

    Ok(InscriptionRecord {
        number: field(value, &["num", "number", "inscription_number", "inscriptionNumber"]).and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }),
        address: field_str(value, &["address", "owner", "ownerAddress"]).or_else(|| address.map(str::to_string)),
        content_type: field_str(value, &["content_type", "contentType", "mime", "mime_type", "mimeType"]),
        content_url,
        preview_url,
        output,
        offset: field_u64(value, &["offset", "utxo_sat_offset"])
            .or(location_offset)
            .unwrap_or(0),
        output_value: field_u64(
            value,
            &["output_value", "value", "outputValue", "postage", "satoshis", "utxo_sat_balance"],
        ),
        height: field_u64(value, &["height", "block_height", "genesis_height"]),
        genesis_txid,
        timestamp: field(value, &["timestamp", "created_at", "inscribed_at"]).and_then(json_timestamp),
        id,
    })
}

/// BRC-20 balances from a list, a `data`/`list` wrapper, or a map keyed by ticker
pub fn normalize_brc20_balances(value: &Value) -> Vec<Brc20Balance> {
    let inner = field(value, &["data", "list", "detail"]).unwrap_or(value);
    let inner = field(inner, &["list", "detail"]).unwrap_or(inner);
    match inner {
        Value::Array(entries) => entries
            .iter()
            .filter_map(|entry| {
                let ticker = field_str(entry, &["ticker", "tick"])?;
                Some(brc20_balance(ticker, entry))
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .filter(|(_, entry)| entry.is_object())
            .map(|(ticker, entry)| brc20_balance(ticker.clone(), entry))
            .collect(),
        _ => Vec::new(),
    }
}

fn brc20_balance(ticker: String, entry: &Value) -> Brc20Balance {
    Brc20Balance {
        ticker,
        overall: decimal_string(field(entry, &["overall_balance", "overallBalance", "total", "balance"])),
        transferable: decimal_string(field(
            entry,
            &["transferable_balance", "transferableBalance", "transferable"],
        )),
        available: decimal_string(field(entry, &["available_balance", "availableBalance", "available"])),
    }
}

/// Split a decimal amount string into base units and its divisibility
fn split_decimal(amount: &str) -> Option<(u128, u8)> {
    let amount = amount.trim();
    let (whole, frac) = amount.split_once('.').unwrap_or((amount, ""));
    let digits = format!("{}{}", whole, frac);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let divisibility = u8::try_from(frac.len()).ok()?;
    Some((digits.parse().ok()?, divisibility))
}

/// A rune holding from either an object entry or an ord `[name, amount, symbol]` tuple
pub fn normalize_rune_amount(value: &Value) -> Option<RuneAmount> {
    if let Value::Array(tuple) = value {
        let name = tuple.first()?.as_str()?.to_string();
        let (amount, divisibility) = split_decimal(&decimal_string(tuple.get(1)))?;
        let symbol = tuple.get(2).and_then(Value::as_str).map(str::to_string);
        return Some(RuneAmount {
            id: None,
            name,
            amount,
            divisibility,
            symbol,
        });
    }

    let name = field_str(value, &["spaced_name", "spacedRune", "rune_name", "name", "rune"])?;
    let id = field_str(value, &["rune_id", "runeId", "id"]).and_then(|s| RuneId::from_str(&s).ok());
    let explicit_divisibility = field_u64(value, &["divisibility", "decimals"]).and_then(|d| u8::try_from(d).ok());
    let raw = decimal_string(field(value, &["amount", "balance"]));
    let (amount, divisibility) = match explicit_divisibility {
        Some(d) if !raw.contains('.') => (raw.trim().parse().ok()?, d),
        Some(d) => (crate::utxo::parse_decimal_amount(&raw, d).ok()?, d),
        None => split_decimal(&raw)?,
    };
    Some(RuneAmount {
        id,
        name,
        amount,
        divisibility,
        symbol: field_str(value, &["symbol"]),
    })
}

/// Asset balance for a rune holding
pub fn rune_balance(rune: &RuneAmount) -> AssetBalance {
    let asset = match rune.id {
        Some(id) => AssetId::Rune(RuneRef::Id(id)),
        None => AssetId::Rune(RuneRef::Name(rune.name.clone())),
    };
    AssetBalance {
        asset,
        name: rune.name.clone(),
        symbol: rune.symbol.clone(),
        amount: rune.amount,
        divisibility: rune.divisibility,
    }
}

/// Sum holdings of the same rune into one balance each, keeping first-seen order
pub fn aggregate_rune_balances(runes: impl IntoIterator<Item = RuneAmount>) -> Vec<AssetBalance> {
    let mut balances: Vec<AssetBalance> = Vec::new();
    for rune in runes {
        let balance = rune_balance(&rune);
        match balances
            .iter_mut()
            .find(|b| crate::utxo::same_rune_name(&b.name, &balance.name))
        {
            Some(existing) => existing.amount = existing.amount.saturating_add(balance.amount),
            None => balances.push(balance),
        }
    }
    balances
}

/// UTXOs from an esplora `address/{a}/utxo` listing
///
/// Esplora omits the script; every entry pays `script_pubkey`. Confirmations
/// are counted against `tip_height` when it is known.
pub fn esplora_utxos(value: &Value, script_pubkey: &ScriptBuf, tip_height: Option<u64>) -> Result<Vec<Utxo>> {
    let entries = value
        .as_array()
        .ok_or_else(|| LaserError::Parse("utxo listing is not an array".to_string()))?;
    entries
        .iter()
        .map(|entry| {
            let txid = field_str(entry, &["txid"]).ok_or_else(|| LaserError::Parse("utxo without txid".to_string()))?;
            let txid = Txid::from_str(&txid).map_err(|e| LaserError::Parse(format!("utxo txid: {}", e)))?;
            let vout = field_u64(entry, &["vout"])
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| LaserError::Parse("utxo without vout".to_string()))?;
            let value = field_u64(entry, &["value"]).ok_or_else(|| LaserError::Parse("utxo without value".to_string()))?;

            let mut utxo = Utxo::new(txid, vout, value, script_pubkey.clone());
            let confirmed = entry["status"]["confirmed"].as_bool().unwrap_or(false);
            let block_height = entry["status"]["block_height"].as_u64();
            utxo.confirmations = match (confirmed, block_height, tip_height) {
                (true, Some(height), Some(tip)) => u32::try_from(tip.saturating_sub(height) + 1).ok(),
                (false, _, _) => Some(0),
                _ => None,
            };
            Ok(utxo)
        })
        .collect()
}

/// Transaction from an esplora `tx/{id}` response
pub fn esplora_transaction(value: &Value) -> Result<TransactionInfo> {
    let txid = field_str(value, &["txid"]).ok_or_else(|| LaserError::Parse("transaction without txid".to_string()))?;
    let outputs = value["vout"]
        .as_array()
        .map(|outs| {
            outs.iter()
                .map(|out| TxOutputInfo {
                    value: field_u64(out, &["value"]).unwrap_or(0),
                    script_pubkey: field_str(out, &["scriptpubkey"]).unwrap_or_default(),
                    address: field_str(out, &["scriptpubkey_address"]),
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(TransactionInfo {
        txid,
        confirmed: value["status"]["confirmed"].as_bool().unwrap_or(false),
        block_height: value["status"]["block_height"].as_u64(),
        fee: field_u64(value, &["fee"]),
        outputs,
    })
}
