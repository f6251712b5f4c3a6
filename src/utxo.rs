//! UTXO model, protocol annotations and asset identifiers

use std::fmt;
use std::str::FromStr;

use bitcoin::{OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

use crate::error::{LaserError, Result};

/// Carrier value for protocol marker outputs and the change floor
pub const DUST_VALUE: u64 = 546;

/// Carrier value some inscription tools use for taproot outputs
pub const TAPROOT_CARRIER_VALUE: u64 = 330;

/// Rune identifier `block:tx`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuneId {
    pub block: u64,
    pub tx: u32,
}

impl RuneId {
    pub fn new(block: u64, tx: u32) -> Self {
        Self { block, tx }
    }
}

impl fmt::Display for RuneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.tx)
    }
}

impl FromStr for RuneId {
    type Err = LaserError;

    fn from_str(s: &str) -> Result<Self> {
        let (block, tx) = s
            .split_once(':')
            .ok_or_else(|| LaserError::Parse(format!("rune id '{}' is not block:tx", s)))?;
        Ok(Self {
            block: block
                .parse()
                .map_err(|_| LaserError::Parse(format!("rune id block '{}'", block)))?,
            tx: tx
                .parse()
                .map_err(|_| LaserError::Parse(format!("rune id tx '{}'", tx)))?,
        })
    }
}

/// Alkane contract identifier `block:tx`
///
/// Same textual shape as [`RuneId`], kept as a distinct type so the two can
/// never be passed for one another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlkaneId {
    pub block: u128,
    pub tx: u128,
}

impl AlkaneId {
    pub fn new(block: u128, tx: u128) -> Self {
        Self { block, tx }
    }
}

impl fmt::Display for AlkaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.tx)
    }
}

impl FromStr for AlkaneId {
    type Err = LaserError;

    fn from_str(s: &str) -> Result<Self> {
        let (block, tx) = s
            .split_once(':')
            .ok_or_else(|| LaserError::Parse(format!("alkane id '{}' is not block:tx", s)))?;
        Ok(Self {
            block: block
                .parse()
                .map_err(|_| LaserError::Parse(format!("alkane id block '{}'", block)))?,
            tx: tx
                .parse()
                .map_err(|_| LaserError::Parse(format!("alkane id tx '{}'", tx)))?,
        })
    }
}

/// A rune referenced either by id or by spaced name
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuneRef {
    Id(RuneId),
    Name(String),
}

impl fmt::Display for RuneRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuneRef::Id(id) => id.fmt(f),
            RuneRef::Name(name) => f.write_str(name),
        }
    }
}

/// Protocol-discriminated asset identity
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetId {
    Rune(RuneRef),
    Brc20 { ticker: String },
    Alkane(AlkaneId),
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetId::Rune(rune) => write!(f, "rune:{}", rune),
            AssetId::Brc20 { ticker } => write!(f, "brc20:{}", ticker),
            AssetId::Alkane(id) => write!(f, "alkane:{}", id),
        }
    }
}

/// Rune amount held by an output
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuneAmount {
    pub id: Option<RuneId>,
    pub name: String,
    pub amount: u128,
    pub divisibility: u8,
    pub symbol: Option<String>,
}

/// Alkane amount held by an output
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlkaneAmount {
    pub id: AlkaneId,
    pub amount: u128,
    pub name: Option<String>,
    pub symbol: Option<String>,
}

/// An unspent output plus whatever protocol state rides on it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub value: u64,
    pub script_pubkey: ScriptBuf,
    pub confirmations: Option<u32>,
    pub runes: Vec<RuneAmount>,
    pub alkanes: Vec<AlkaneAmount>,
    pub inscriptions: Vec<String>,
}

impl Utxo {
    /// A bare output with no annotations
    pub fn new(txid: Txid, vout: u32, value: u64, script_pubkey: ScriptBuf) -> Self {
        Self {
            txid,
            vout,
            value,
            script_pubkey,
            confirmations: None,
            runes: Vec::new(),
            alkanes: Vec::new(),
            inscriptions: Vec::new(),
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    pub fn has_runes(&self) -> bool {
        !self.runes.is_empty()
    }

    pub fn has_alkanes(&self) -> bool {
        !self.alkanes.is_empty()
    }

    pub fn has_inscriptions(&self) -> bool {
        !self.inscriptions.is_empty()
    }

    /// Usable for plain value transfer and fees
    ///
    /// Carrier-valued outputs are excluded even without annotations since an
    /// indexer may lag behind a fresh inscription.
    pub fn is_spendable(&self) -> bool {
        !self.has_runes()
            && !self.has_alkanes()
            && !self.has_inscriptions()
            && self.value != DUST_VALUE
            && self.value != TAPROOT_CARRIER_VALUE
    }

    /// Amount of a specific rune held here
    pub fn rune_amount(&self, rune: &RuneRef) -> u128 {
        self.runes
            .iter()
            .filter(|r| match rune {
                RuneRef::Id(id) => r.id.as_ref() == Some(id),
                RuneRef::Name(name) => same_rune_name(&r.name, name),
            })
            .map(|r| r.amount)
            .sum()
    }

    /// Amount of a specific alkane held here
    pub fn alkane_amount(&self, id: &AlkaneId) -> u128 {
        self.alkanes
            .iter()
            .filter(|a| &a.id == id)
            .map(|a| a.amount)
            .sum()
    }
}

/// Rune names compare without spacers
pub fn same_rune_name(a: &str, b: &str) -> bool {
    let strip = |s: &str| s.chars().filter(|c| *c != '•' && *c != '.').collect::<String>();
    strip(a).eq_ignore_ascii_case(&strip(b))
}

/// Plain spendable subset of `utxos`, preserving order
pub fn spendable(utxos: &[Utxo]) -> Vec<Utxo> {
    utxos.iter().filter(|u| u.is_spendable()).cloned().collect()
}

/// Sum of spendable values
pub fn spendable_balance(utxos: &[Utxo]) -> u64 {
    utxos.iter().filter(|u| u.is_spendable()).map(|u| u.value).sum()
}

/// Asset-scoped balance in base units with its decimal rendering
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: AssetId,
    pub name: String,
    pub symbol: Option<String>,
    pub amount: u128,
    pub divisibility: u8,
}

impl AssetBalance {
    pub fn display_amount(&self) -> String {
        format_decimal_amount(self.amount, self.divisibility)
    }
}

/// Parse a user-facing decimal string into base units
///
/// `"1.5"` with divisibility 2 is `150`. More fractional digits than the
/// divisibility allows is an error, never a silent truncation.
pub fn parse_decimal_amount(amount: &str, divisibility: u8) -> Result<u128> {
    let amount = amount.trim();
    if amount.is_empty() {
        return Err(LaserError::MissingRequiredParameters("amount".to_string()));
    }
    let (whole, frac) = amount.split_once('.').unwrap_or((amount, ""));
    if frac.len() > divisibility as usize {
        return Err(LaserError::Parse(format!(
            "amount {} has more than {} decimals",
            amount, divisibility
        )));
    }
    let digits = format!("{}{:0<width$}", whole, frac, width = divisibility as usize);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(LaserError::Parse(format!("amount '{}' is not a decimal number", amount)));
    }
    digits
        .parse::<u128>()
        .map_err(|e| LaserError::Parse(format!("amount '{}': {}", amount, e)))
}

/// Render base units as a decimal string without trailing zeros
pub fn format_decimal_amount(amount: u128, divisibility: u8) -> String {
    if divisibility == 0 {
        return amount.to_string();
    }
    let scale = 10u128.checked_pow(divisibility as u32);
    let Some(scale) = scale else {
        return amount.to_string();
    };
    let whole = amount / scale;
    let frac = amount % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:0>width$}", frac, width = divisibility as usize);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}
