//! Unlock metadata per input script family
//!
//! | family        | attached                                   |
//! |---------------|--------------------------------------------|
//! | P2TR          | witness UTXO, x-only internal key          |
//! | P2WPKH        | witness UTXO                               |
//! | P2SH-P2WPKH   | witness UTXO, `OP_0 <hash160>` redeem script |
//! | P2PKH         | full previous transaction                  |
//!
//! Bare P2SH and P2WSH need scripts the wallet never discloses and are refused.

use bitcoin::psbt::Input;
use bitcoin::{Amount, Transaction, TxOut};

use super::{Account, BuildContext};
use crate::address::{self, AddressType};
use crate::datasource::Capability;
use crate::error::{LaserError, Result};
use crate::utxo::Utxo;

/// PSBT input fields that let a signer satisfy `utxo`, plus its script family
pub async fn unlock_metadata(ctx: &BuildContext<'_>, utxo: &Utxo, owner: &Account) -> Result<(AddressType, Input)> {
    address::require_known(&owner.address, ctx.network)?;
    let kind = address::classify_owned(&owner.address, &owner.public_key, ctx.network);
    let script_pubkey = if utxo.script_pubkey.is_empty() {
        address::script_pubkey(&owner.address, ctx.network)?
    } else {
        utxo.script_pubkey.clone()
    };
    let witness_utxo = TxOut {
        value: Amount::from_sat(utxo.value),
        script_pubkey,
    };

    let mut input = Input::default();
    match kind {
        AddressType::P2tr => {
            input.witness_utxo = Some(witness_utxo);
            input.tap_internal_key = Some(address::x_only_key(&owner.public_key)?);
        }
        AddressType::P2wpkh => {
            input.witness_utxo = Some(witness_utxo);
        }
        AddressType::P2shP2wpkh => {
            input.witness_utxo = Some(witness_utxo);
            input.redeem_script = Some(address::wrapped_segwit_redeem_script(&owner.public_key)?);
        }
        AddressType::P2pkh => {
            input.non_witness_utxo = Some(previous_transaction(ctx, utxo).await?);
        }
        AddressType::P2sh | AddressType::P2wsh | AddressType::Unknown => {
            return Err(LaserError::InvalidAddress(format!(
                "cannot spend from {} address {}",
                kind, owner.address
            )));
        }
    }
    Ok((kind, input))
}

/// Fetch and check the transaction that created `utxo`
async fn previous_transaction(ctx: &BuildContext<'_>, utxo: &Utxo) -> Result<Transaction> {
    if !ctx.data_sources.any_source_supports(Capability::RawTransaction) {
        return Err(LaserError::UnsupportedByDataSource(format!(
            "legacy input {} needs its previous transaction and no source serves raw transactions",
            utxo.outpoint()
        )));
    }

    let raw = ctx.data_sources.get_raw_transaction(&utxo.txid.to_string()).await?;
    let bytes = hex::decode(raw.trim())?;
    let tx: Transaction = bitcoin::consensus::deserialize(&bytes)
        .map_err(|e| LaserError::Parse(format!("previous transaction {}: {}", utxo.txid, e)))?;

    if tx.compute_txid() != utxo.txid {
        return Err(LaserError::InvalidTransaction(format!(
            "source returned {} for previous transaction {}",
            tx.compute_txid(),
            utxo.txid
        )));
    }
    if tx.output.len() <= utxo.vout as usize {
        return Err(LaserError::InvalidTransaction(format!(
            "previous transaction {} has no output {}",
            utxo.txid, utxo.vout
        )));
    }
    Ok(tx)
}
