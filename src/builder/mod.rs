//! Transaction builders
//!
//! # Architecture
//!
//! One module per transfer kind ([`btc`], [`runes`], [`brc20`], [`alkanes`],
//! [`inscriptions`]), all following the same skeleton:
//!
//! 1. Check parameters. Nothing touches the network before this passes.
//! 2. Resolve the asset leg: UTXOs carrying the asset, accumulated until the
//!    amount is covered.
//! 3. Resolve the fee leg from plain spendable UTXOs of the payment address
//!    with [`select_utxos`], never reusing an outpoint from step 2.
//! 4. Attach unlock metadata per input ([`inputs`]), then the data output and
//!    carrier outputs, then change.
//!
//! Everything is assembled in a local [`Draft`] and only turned into an
//! [`UnsignedTransaction`] once the invariants hold, so an abandoned or failed
//! build leaves nothing behind.

pub mod alkanes;
pub mod brc20;
pub mod btc;
pub mod inputs;
pub mod inscriptions;
pub mod runes;

use std::collections::HashSet;

use bitcoin::psbt::{Input, Psbt};
use bitcoin::transaction::{OutPoint, Sequence, Version};
use bitcoin::{absolute, Amount, ScriptBuf, Transaction, TxIn, TxOut, Txid, Witness};
use serde::{Deserialize, Serialize};

use crate::address::{self, AddressType};
use crate::coin_select::{select_utxos, Selection, SelectionParams};
use crate::datasource::manager::DataSourceManager;
use crate::error::{LaserError, Result};
use crate::network::Network;
use crate::psbt::UnsignedTransaction;
use crate::utxo::{Utxo, DUST_VALUE};

/// Address and public key of one wallet account
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    /// Hex, compressed or x-only
    pub public_key: String,
}

impl Account {
    pub fn new(address: &str, public_key: &str) -> Self {
        Self {
            address: address.to_string(),
            public_key: public_key.to_string(),
        }
    }
}

/// Order in which asset-carrying UTXOs are consumed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetOrder {
    /// Fewest inputs
    #[default]
    LargestFirst,
    /// Sweeps small fragments first
    SmallestFirst,
}

/// Input the signer is asked to sign, and with which account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputToSign {
    pub index: usize,
    pub address: String,
}

/// Unsigned transaction plus signing instructions
#[derive(Clone, Debug, PartialEq)]
pub struct BuiltTransaction {
    pub unsigned: UnsignedTransaction,
    pub inputs_to_sign: Vec<InputToSign>,
}

impl BuiltTransaction {
    pub fn txid(&self) -> Txid {
        self.unsigned.txid()
    }

    pub fn fee(&self) -> u64 {
        self.unsigned.fee()
    }

    pub fn to_hex(&self) -> String {
        self.unsigned.to_hex()
    }

    pub fn to_base64(&self) -> String {
        self.unsigned.to_base64()
    }
}

/// Who is spending, on which network, at what fee rate
pub struct BuildContext<'a> {
    pub data_sources: &'a DataSourceManager,
    pub network: Network,
    /// Funds fees and change
    pub payment: Account,
    /// Holds inscriptions, runes and alkanes
    pub ordinals: Account,
    /// Sats per vbyte; the fast recommendation is fetched when unset
    pub fee_rate: Option<f64>,
}

impl<'a> BuildContext<'a> {
    pub fn new(data_sources: &'a DataSourceManager, network: Network, payment: Account, ordinals: Account) -> Self {
        Self {
            data_sources,
            network,
            payment,
            ordinals,
            fee_rate: None,
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: f64) -> Self {
        self.fee_rate = Some(fee_rate);
        self
    }

    /// Parameter checks shared by every builder; no I/O
    pub fn validate(&self) -> Result<()> {
        for (role, account) in [("payment", &self.payment), ("ordinals", &self.ordinals)] {
            require_param(&account.address, &format!("{} address", role))?;
            let kind = address::require_known(&account.address, self.network)?;
            if matches!(kind, AddressType::P2tr | AddressType::P2sh | AddressType::P2shP2wpkh) {
                require_param(&account.public_key, &format!("{} public key", role))?;
            }
        }
        if let Some(rate) = self.fee_rate {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(LaserError::MissingRequiredParameters(format!(
                    "fee rate must be positive, got {}",
                    rate
                )));
            }
        }
        Ok(())
    }

    /// The explicit fee rate, or the sources' fast recommendation
    pub async fn fee_rate(&self) -> Result<f64> {
        if let Some(rate) = self.fee_rate {
            return Ok(rate);
        }
        let fees = self.data_sources.get_recommended_fees().await?;
        log::debug!("Using recommended fee rate {} sat/vB", fees.fast);
        Ok(fees.fast)
    }

    pub(crate) fn payment_script(&self) -> Result<ScriptBuf> {
        address::script_pubkey(&self.payment.address, self.network)
    }

    pub(crate) fn ordinals_script(&self) -> Result<ScriptBuf> {
        address::script_pubkey(&self.ordinals.address, self.network)
    }

    /// Output script of a recipient, rejecting unknown address types
    pub(crate) fn recipient_script(&self, recipient: &str) -> Result<ScriptBuf> {
        require_param(recipient, "recipient")?;
        address::require_known(recipient, self.network)?;
        address::script_pubkey(recipient, self.network)
    }
}

pub(crate) fn require_param(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(LaserError::MissingRequiredParameters(name.to_string()));
    }
    Ok(())
}

pub(crate) fn require_amount(amount: u128, name: &str) -> Result<()> {
    if amount == 0 {
        return Err(LaserError::MissingRequiredParameters(format!("{} must be greater than zero", name)));
    }
    Ok(())
}

/// Whether change below dust may be folded into the fee
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChangePolicy {
    /// Transfers: change must reach dust or the build fails
    Required,
    /// Mints: sub-dust change is dropped
    DropDust,
}

/// A transaction under construction
pub(crate) struct Draft {
    inputs: Vec<TxIn>,
    metadata: Vec<Input>,
    input_values: Vec<u64>,
    outputs: Vec<TxOut>,
    signers: Vec<InputToSign>,
    consumed: HashSet<OutPoint>,
    taproot_inputs: usize,
    other_inputs: usize,
    pub(crate) extra_vbytes: u64,
}

impl Draft {
    pub(crate) fn new() -> Self {
        Self {
            inputs: Vec::new(),
            metadata: Vec::new(),
            input_values: Vec::new(),
            outputs: Vec::new(),
            signers: Vec::new(),
            consumed: HashSet::new(),
            taproot_inputs: 0,
            other_inputs: 0,
            extra_vbytes: 0,
        }
    }

    pub(crate) fn is_consumed(&self, outpoint: &OutPoint) -> bool {
        self.consumed.contains(outpoint)
    }

    /// Spend `utxo` owned by `owner`
    pub(crate) async fn add_input(&mut self, ctx: &BuildContext<'_>, utxo: &Utxo, owner: &Account) -> Result<()> {
        if self.is_consumed(&utxo.outpoint()) {
            return Err(LaserError::InvalidTransaction(format!(
                "{} is already spent by this transaction",
                utxo.outpoint()
            )));
        }
        let (kind, input) = inputs::unlock_metadata(ctx, utxo, owner).await?;
        self.push_input(utxo.outpoint(), utxo.value, input, kind, &owner.address);
        Ok(())
    }

    /// Spend an outpoint whose metadata the caller prepared
    pub(crate) fn push_input(
        &mut self,
        outpoint: OutPoint,
        value: u64,
        input: Input,
        kind: AddressType,
        signer: &str,
    ) {
        self.consumed.insert(outpoint);
        if kind.is_taproot() {
            self.taproot_inputs += 1;
        } else {
            self.other_inputs += 1;
        }
        self.signers.push(InputToSign {
            index: self.inputs.len(),
            address: signer.to_string(),
        });
        self.inputs.push(TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        });
        self.metadata.push(input);
        self.input_values.push(value);
    }

    pub(crate) fn add_output(&mut self, script_pubkey: ScriptBuf, value: u64) {
        self.outputs.push(TxOut {
            value: Amount::from_sat(value),
            script_pubkey,
        });
    }

    pub(crate) fn add_txout(&mut self, txout: TxOut) {
        self.outputs.push(txout);
    }

    pub(crate) fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub(crate) fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub(crate) fn input_value(&self) -> u64 {
        self.input_values.iter().sum()
    }

    pub(crate) fn output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.value.to_sat()).sum()
    }

    /// Select fee inputs from the payment account covering `target` plus fee
    ///
    /// `output_count` is the final number of outputs, change included.
    pub(crate) async fn fund(
        &mut self,
        ctx: &BuildContext<'_>,
        fee_rate: f64,
        target: u64,
        output_count: usize,
    ) -> Result<Selection> {
        let pool = fee_pool(ctx, &self.consumed).await?;
        let funding_type = address::require_known(&ctx.payment.address, ctx.network)?;
        let mut params = SelectionParams::new(target, fee_rate, output_count, funding_type);
        params.fixed_taproot_inputs = self.taproot_inputs;
        params.fixed_other_inputs = self.other_inputs;
        params.extra_vbytes = self.extra_vbytes;

        let selection = select_utxos(&pool, &params)?;
        log::debug!(
            "Selected {} fee input(s) totalling {} sats, fee {} sats",
            selection.utxos.len(),
            selection.total,
            selection.fee
        );
        for utxo in &selection.utxos {
            self.add_input(ctx, utxo, &ctx.payment).await?;
        }
        Ok(selection)
    }

    /// Append change to `change_script` and wrap up
    pub(crate) fn settle(
        mut self,
        fee: u64,
        change_script: ScriptBuf,
        policy: ChangePolicy,
    ) -> Result<BuiltTransaction> {
        let (inputs, outputs) = (self.input_value(), self.output_value());
        let change = inputs
            .checked_sub(outputs)
            .and_then(|rest| rest.checked_sub(fee))
            .ok_or_else(|| {
                LaserError::InsufficientFunds(format!(
                    "inputs {} cannot cover outputs {} and fee {}",
                    inputs, outputs, fee
                ))
            })?;

        if change >= DUST_VALUE {
            self.add_output(change_script, change);
        } else if policy == ChangePolicy::Required {
            return Err(LaserError::InsufficientFunds(format!(
                "change of {} sats is below dust ({})",
                change, DUST_VALUE
            )));
        } else if change > 0 {
            log::debug!("Dropping {} sats of sub-dust change into the fee", change);
        }
        self.finish()
    }

    /// Wrap up without change
    pub(crate) fn finish(self) -> Result<BuiltTransaction> {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: self.inputs,
            output: self.outputs,
        };
        let mut psbt = Psbt::from_unsigned_tx(tx)
            .map_err(|e| LaserError::InvalidTransaction(format!("psbt: {}", e)))?;
        psbt.inputs = self.metadata;

        let unsigned = UnsignedTransaction::new(psbt)?;
        log::debug!(
            "Built {} with {} input(s), {} output(s), fee {} sats",
            unsigned.txid(),
            unsigned.psbt().unsigned_tx.input.len(),
            unsigned.psbt().unsigned_tx.output.len(),
            unsigned.fee()
        );
        Ok(BuiltTransaction {
            unsigned,
            inputs_to_sign: self.signers,
        })
    }
}

/// Plain spendable UTXOs of the payment account not in `consumed`, largest first
pub(crate) async fn fee_pool(ctx: &BuildContext<'_>, consumed: &HashSet<OutPoint>) -> Result<Vec<Utxo>> {
    let utxos = ctx.data_sources.get_formatted_utxos(&ctx.payment.address).await?;
    if utxos.is_empty() {
        return Err(LaserError::NoUtxosFound(ctx.payment.address.clone()));
    }
    let mut seen = HashSet::new();
    let mut pool: Vec<Utxo> = utxos
        .into_iter()
        .filter(|u| u.is_spendable() && !consumed.contains(&u.outpoint()) && seen.insert(u.outpoint()))
        .collect();
    pool.sort_by(|a, b| b.value.cmp(&a.value));
    Ok(pool)
}

/// Accumulate asset UTXOs in `order` until `amount` is covered
pub(crate) fn accumulate_assets<F>(
    mut candidates: Vec<Utxo>,
    amount: u128,
    order: AssetOrder,
    balance_of: F,
    asset: &str,
) -> Result<(Vec<Utxo>, u128)>
where
    F: Fn(&Utxo) -> u128,
{
    let mut seen = HashSet::new();
    candidates.retain(|u| balance_of(u) > 0 && seen.insert(u.outpoint()));
    match order {
        AssetOrder::LargestFirst => candidates.sort_by(|a, b| balance_of(b).cmp(&balance_of(a))),
        AssetOrder::SmallestFirst => candidates.sort_by(|a, b| balance_of(a).cmp(&balance_of(b))),
    }

    let mut selected = Vec::new();
    let mut total: u128 = 0;
    for utxo in candidates {
        if total >= amount {
            break;
        }
        total = total.saturating_add(balance_of(&utxo));
        selected.push(utxo);
    }
    if total < amount {
        return Err(LaserError::InsufficientAssetBalance(format!(
            "{}: need {}, have {}",
            asset, amount, total
        )));
    }
    Ok((selected, total))
}
