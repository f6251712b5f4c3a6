//! Protocol payload codecs
//!
//! Pure encode/decode functions, no I/O:
//!
//! - [`runestone`]: rune transfers and mints
//! - [`protostone`]: alkane transfers and contract calls, layered on runestones
//! - [`brc20`]: BRC-20 JSON operations
//! - [`inscription`]: the ordinal envelope BRC-20 and raw content ride in
//! - [`varint`]: LEB128 integers shared by the two runestone codecs

pub mod brc20;
pub mod inscription;
pub mod protostone;
pub mod runestone;
pub mod varint;

use bitcoin::{Script, TxOut};

use crate::error::{LaserError, Result};
use protostone::Protostone;
use runestone::Runestone;

/// The single protocol payload a transaction may carry in its data output
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataPayload {
    Runes(Runestone),
    Alkanes(Vec<Protostone>),
}

impl DataPayload {
    /// Zero-value output for this payload
    ///
    /// A rune payload that also carries protocol integers would mix two
    /// protocols' edicts in one output and is refused.
    pub fn to_txout(&self) -> Result<TxOut> {
        match self {
            DataPayload::Runes(stone) => {
                if !stone.protocol.is_empty() {
                    return Err(LaserError::InvalidTransaction(
                        "rune payload must not carry protostones".to_string(),
                    ));
                }
                stone.to_txout()
            }
            DataPayload::Alkanes(stones) => protostone::to_txout(stones),
        }
    }

    /// Classify and decode a data output script
    pub fn decode(script: &Script) -> Result<Self> {
        let stone = Runestone::decipher(script)?;
        if stone.protocol.is_empty() {
            return Ok(DataPayload::Runes(stone));
        }
        if !stone.edicts.is_empty() || stone.mint.is_some() {
            return Err(LaserError::Codec(
                "runestone mixes rune edicts with protostones".to_string(),
            ));
        }
        Ok(DataPayload::Alkanes(protostone::decode_protostones(&stone.protocol)?))
    }
}
