//! BRC-20 operation inscriptions

use serde::{Deserialize, Serialize};

use super::inscription::Inscription;
use crate::error::{LaserError, Result};

pub const PROTOCOL_ID: &str = "brc-20";
pub const CONTENT_TYPE: &str = "text/plain;charset=utf-8";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Brc20Op {
    Transfer,
    Mint,
}

/// A BRC-20 operation with its amount kept as the decimal string inscribed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Brc20Operation {
    pub op: Brc20Op,
    pub ticker: String,
    pub amount: String,
}

#[derive(Serialize, Deserialize)]
struct Wire {
    p: String,
    op: Brc20Op,
    tick: String,
    amt: String,
}

impl Brc20Operation {
    pub fn transfer(ticker: &str, amount: &str) -> Self {
        Self {
            op: Brc20Op::Transfer,
            ticker: ticker.to_string(),
            amount: amount.to_string(),
        }
    }

    fn validate(&self) -> Result<()> {
        let tick_len = self.ticker.chars().count();
        if !(1..=5).contains(&tick_len) {
            return Err(LaserError::Codec(format!(
                "brc-20 ticker '{}' must be 1 to 5 characters",
                self.ticker
            )));
        }
        let mut parts = self.amount.splitn(2, '.');
        let whole = parts.next().unwrap_or("");
        let frac = parts.next();
        let digits_ok = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
        if !digits_ok(whole) || frac.is_some_and(|f| !digits_ok(f)) {
            return Err(LaserError::Codec(format!(
                "brc-20 amount '{}' is not a decimal number",
                self.amount
            )));
        }
        Ok(())
    }

    /// `{"p":"brc-20","op":...,"tick":...,"amt":...}` as bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let wire = Wire {
            p: PROTOCOL_ID.to_string(),
            op: self.op,
            tick: self.ticker.clone(),
            amt: self.amount.clone(),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: Wire = serde_json::from_slice(bytes)
            .map_err(|e| LaserError::Codec(format!("brc-20 json: {}", e)))?;
        if wire.p != PROTOCOL_ID {
            return Err(LaserError::Codec(format!("protocol '{}' is not brc-20", wire.p)));
        }
        let operation = Self {
            op: wire.op,
            ticker: wire.tick,
            amount: wire.amt,
        };
        operation.validate()?;
        Ok(operation)
    }

    /// Inscription carrying this operation
    pub fn to_inscription(&self) -> Result<Inscription> {
        Ok(Inscription::new(CONTENT_TYPE, self.encode()?))
    }
}
