//! Coin selection against a fee target that depends on the selection itself
//!
//! # Size model
//!
//! `10 + taproot_inputs × 64 + other_inputs × 42 + outputs × 40 + extra`
//! vbytes. The constants are deliberately coarse; they only need to keep the
//! fee above what the network will relay.
//!
//! # Algorithm
//!
//! 1. Price the transaction assuming two funding inputs.
//! 2. Accumulate UTXOs in pool order until `target + fee` is covered.
//! 3. Re-price with the real input count; if the fee went up, accumulate again
//!    against the new threshold. The fee is monotone in the input count so the
//!    loop settles after one extra round in practice.

use crate::address::AddressType;
use crate::error::{LaserError, Result};
use crate::utxo::Utxo;

/// Protocol fee floor in satoshis
pub const FEE_FLOOR: u64 = 250;

const BASE_SIZE: u64 = 10;
const TAPROOT_INPUT_SIZE: u64 = 64;
const OTHER_INPUT_SIZE: u64 = 42;
const OUTPUT_SIZE: u64 = 40;
const ASSUMED_FUNDING_INPUTS: usize = 2;

/// Estimated virtual size of a transaction
pub fn estimate_size(taproot_inputs: usize, other_inputs: usize, outputs: usize) -> u64 {
    BASE_SIZE
        + taproot_inputs as u64 * TAPROOT_INPUT_SIZE
        + other_inputs as u64 * OTHER_INPUT_SIZE
        + outputs as u64 * OUTPUT_SIZE
}

/// `max(ceil(size × rate), FEE_FLOOR)`
pub fn fee_for_size(vsize: u64, fee_rate: f64) -> u64 {
    let fee = (vsize as f64 * fee_rate).ceil();
    if !fee.is_finite() || fee <= 0.0 {
        return FEE_FLOOR;
    }
    (fee as u64).max(FEE_FLOOR)
}

/// Everything the selector needs to price a candidate selection
#[derive(Clone, Debug)]
pub struct SelectionParams {
    /// Value the selected inputs must cover on top of the fee
    pub target: u64,
    /// Sats per vbyte
    pub fee_rate: f64,
    /// Outputs the final transaction will carry, change included
    pub output_count: usize,
    /// Script family of the funding UTXOs
    pub funding_type: AddressType,
    /// Inputs already committed by the asset leg
    pub fixed_taproot_inputs: usize,
    pub fixed_other_inputs: usize,
    /// Additional vbytes, e.g. a large data payload
    pub extra_vbytes: u64,
}

impl SelectionParams {
    pub fn new(target: u64, fee_rate: f64, output_count: usize, funding_type: AddressType) -> Self {
        Self {
            target,
            fee_rate,
            output_count,
            funding_type,
            fixed_taproot_inputs: 0,
            fixed_other_inputs: 0,
            extra_vbytes: 0,
        }
    }

    /// Size with `funding_inputs` selected on top of the fixed inputs
    pub fn vsize(&self, funding_inputs: usize) -> u64 {
        let (taproot, other) = if self.funding_type.is_taproot() {
            (funding_inputs, 0)
        } else {
            (0, funding_inputs)
        };
        estimate_size(
            self.fixed_taproot_inputs + taproot,
            self.fixed_other_inputs + other,
            self.output_count,
        ) + self.extra_vbytes
    }

    pub fn fee(&self, funding_inputs: usize) -> u64 {
        fee_for_size(self.vsize(funding_inputs), self.fee_rate)
    }
}

/// Chosen inputs and the fee they were priced at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub utxos: Vec<Utxo>,
    pub total: u64,
    pub fee: u64,
}

impl Selection {
    /// What is left once `target` and the fee are paid
    pub fn surplus(&self, target: u64) -> u64 {
        self.total.saturating_sub(target).saturating_sub(self.fee)
    }
}

/// Select a prefix of `pool` that covers `params.target` plus its own fee
///
/// # Errors
///
/// `MissingRequiredParameters` for a non-positive fee rate, and
/// `InsufficientFunds` when the pool cannot cover the target and fee either
/// before or after re-pricing.
pub fn select_utxos(pool: &[Utxo], params: &SelectionParams) -> Result<Selection> {
    if !(params.fee_rate.is_finite() && params.fee_rate > 0.0) {
        return Err(LaserError::MissingRequiredParameters(format!(
            "fee rate must be positive, got {}",
            params.fee_rate
        )));
    }

    let available: u64 = pool.iter().map(|u| u.value).sum();
    let mut fee = params.fee(ASSUMED_FUNDING_INPUTS);
    if available < params.target.saturating_add(fee) {
        return Err(insufficient(available, params.target, fee));
    }

    loop {
        let threshold = params.target.saturating_add(fee);
        let (selected, total) = accumulate(pool, threshold)
            .ok_or_else(|| insufficient(available, params.target, fee))?;

        let repriced = params.fee(selected.len());
        if repriced > fee {
            log::debug!(
                "Fee re-priced from {} to {} sats for {} inputs",
                fee,
                repriced,
                selected.len()
            );
            fee = repriced;
            continue;
        }

        return Ok(Selection {
            utxos: selected,
            total,
            fee: repriced,
        });
    }
}

fn accumulate(pool: &[Utxo], threshold: u64) -> Option<(Vec<Utxo>, u64)> {
    let mut selected = Vec::new();
    let mut total = 0u64;
    for utxo in pool {
        selected.push(utxo.clone());
        total = total.saturating_add(utxo.value);
        if total >= threshold {
            return Some((selected, total));
        }
    }
    None
}

fn insufficient(available: u64, target: u64, fee: u64) -> LaserError {
    LaserError::InsufficientFunds(format!(
        "need {} sats ({} + {} fee), have {} sats",
        target.saturating_add(fee),
        target,
        fee,
        available
    ))
}
