//! Inscription commit/reveal and inscription transfer
//!
//! Inscribing takes two transactions. The commit pays `dust + reveal fee` to
//! a taproot output committing to the envelope script; the reveal spends it
//! through that script path and lands the inscription on a dust output at
//! the destination.

use bitcoin::psbt::Input;
use bitcoin::taproot::LeafVersion;
use bitcoin::{Amount, OutPoint, ScriptBuf, TxOut, Txid};
use serde::{Deserialize, Serialize};

use super::{require_param, BuildContext, BuiltTransaction, ChangePolicy, Draft};
use crate::address::{self, AddressType};
use crate::codec::inscription::{Inscription, InscriptionCommitment};
use crate::coin_select::{estimate_size, fee_for_size};
use crate::datasource::normalize::parse_outpoint;
use crate::error::{LaserError, Result};
use crate::utxo::{Utxo, DUST_VALUE};

/// Output of the commit transaction that the reveal spends
pub const COMMIT_VOUT: u32 = 0;

/// Output of the reveal transaction holding the inscription
pub const REVEAL_VOUT: u32 = 0;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InscribeRequest {
    pub content_type: String,
    pub body: Vec<u8>,
    /// Defaults to the ordinals account
    pub destination: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InscriptionSend {
    pub inscription_ids: Vec<String>,
    pub recipient: String,
}

/// Everything the reveal needs, fixed when the commit is built
#[derive(Clone, Debug)]
pub struct RevealPlan {
    pub commitment: InscriptionCommitment,
    pub destination: ScriptBuf,
    pub reveal_fee: u64,
}

impl RevealPlan {
    /// Value locked in the commit output
    pub fn commit_value(&self) -> u64 {
        DUST_VALUE + self.reveal_fee
    }
}

#[derive(Clone, Debug)]
pub struct CommitTransaction {
    pub commit: BuiltTransaction,
    pub plan: RevealPlan,
}

/// Estimated vsize of a one-in one-out script-path reveal
pub fn reveal_vsize(commitment: &InscriptionCommitment) -> Result<u64> {
    let control_block = commitment.control_block()?;
    let witness = commitment.reveal_script.len() + control_block.serialize().len() + 3;
    Ok(estimate_size(1, 0, 1) + (witness as u64).div_ceil(4))
}

/// Commit to `inscription` under the ordinals key
pub async fn build_commit(
    ctx: &BuildContext<'_>,
    inscription: &Inscription,
    destination: Option<&str>,
) -> Result<CommitTransaction> {
    ctx.validate()?;
    require_param(&inscription.content_type, "content type")?;
    if inscription.body.is_empty() {
        return Err(LaserError::MissingRequiredParameters("inscription content".to_string()));
    }
    let key = address::x_only_key(&ctx.ordinals.public_key)?;
    let commitment = InscriptionCommitment::new(inscription, key, ctx.network)?;
    let destination = match destination {
        Some(destination) => ctx.recipient_script(destination)?,
        None => ctx.ordinals_script()?,
    };
    let fee_rate = ctx.fee_rate().await?;

    let plan = RevealPlan {
        reveal_fee: fee_for_size(reveal_vsize(&commitment)?, fee_rate),
        commitment,
        destination,
    };

    let mut draft = Draft::new();
    draft.add_output(plan.commitment.script_pubkey(), plan.commit_value());
    let selection = draft
        .fund(ctx, fee_rate, plan.commit_value() + DUST_VALUE, draft.output_count() + 1)
        .await?;
    let commit = draft.settle(selection.fee, ctx.payment_script()?, ChangePolicy::Required)?;

    log::info!(
        "Inscription commit {} locks {} sats at {}",
        commit.txid(),
        plan.commit_value(),
        plan.commitment.address
    );
    Ok(CommitTransaction { commit, plan })
}

/// Spend the commit output of `commit_txid` through the envelope script
pub fn build_reveal(ctx: &BuildContext<'_>, plan: &RevealPlan, commit_txid: Txid) -> Result<BuiltTransaction> {
    let commitment = &plan.commitment;
    let mut input = Input {
        witness_utxo: Some(TxOut {
            value: Amount::from_sat(plan.commit_value()),
            script_pubkey: commitment.script_pubkey(),
        }),
        tap_internal_key: Some(commitment.internal_key),
        tap_merkle_root: commitment.spend_info.merkle_root(),
        ..Default::default()
    };
    input.tap_scripts.insert(
        commitment.control_block()?,
        (commitment.reveal_script.clone(), LeafVersion::TapScript),
    );

    let mut draft = Draft::new();
    draft.push_input(
        OutPoint::new(commit_txid, COMMIT_VOUT),
        plan.commit_value(),
        input,
        AddressType::P2tr,
        &ctx.ordinals.address,
    );
    draft.add_output(plan.destination.clone(), DUST_VALUE);
    draft.finish()
}

/// Full commit and reveal pair for arbitrary content; the reveal is built once the commit txid is known
pub async fn build_inscribe(ctx: &BuildContext<'_>, request: &InscribeRequest) -> Result<CommitTransaction> {
    let inscription = Inscription::new(&request.content_type, request.body.clone());
    build_commit(ctx, &inscription, request.destination.as_deref()).await
}

/// Where `inscription_id` sits now, as an input of the ordinals account
async fn locate(ctx: &BuildContext<'_>, inscription_id: &str) -> Result<Utxo> {
    let record = ctx.data_sources.get_inscription(inscription_id).await?;
    if let Some(holder) = &record.address {
        if holder != &ctx.ordinals.address {
            return Err(LaserError::InvalidTransaction(format!(
                "inscription {} is held by {}",
                inscription_id, holder
            )));
        }
    }
    let outpoint = parse_outpoint(
        record
            .output
            .as_deref()
            .ok_or_else(|| LaserError::Parse(format!("inscription {} has no location", inscription_id)))?,
    )?;
    let value = match record.output_value {
        Some(value) => value,
        None => ctx
            .data_sources
            .get_output_value(&outpoint.txid.to_string(), outpoint.vout)
            .await?
            .ok_or_else(|| LaserError::Timeout(format!("value of {}", outpoint)))?,
    };

    let mut utxo = Utxo::new(outpoint.txid, outpoint.vout, value, ctx.ordinals_script()?);
    utxo.inscriptions.push(inscription_id.to_string());
    Ok(utxo)
}

/// Move each inscription UTXO to `recipient` with its value intact
pub(crate) async fn build_send_utxos(
    ctx: &BuildContext<'_>,
    carriers: &[Utxo],
    recipient: ScriptBuf,
) -> Result<BuiltTransaction> {
    let fee_rate = ctx.fee_rate().await?;

    let mut draft = Draft::new();
    for utxo in carriers {
        if draft.is_consumed(&utxo.outpoint()) {
            continue;
        }
        draft.add_input(ctx, utxo, &ctx.ordinals).await?;
        draft.add_output(recipient.clone(), utxo.value);
    }
    let selection = draft.fund(ctx, fee_rate, DUST_VALUE, draft.output_count() + 1).await?;
    draft.settle(selection.fee, ctx.payment_script()?, ChangePolicy::Required)
}

pub async fn build_send(ctx: &BuildContext<'_>, request: &InscriptionSend) -> Result<BuiltTransaction> {
    ctx.validate()?;
    if request.inscription_ids.is_empty() {
        return Err(LaserError::MissingRequiredParameters("inscription ids".to_string()));
    }
    for id in &request.inscription_ids {
        require_param(id, "inscription id")?;
    }
    let recipient = ctx.recipient_script(&request.recipient)?;

    let mut carriers = Vec::with_capacity(request.inscription_ids.len());
    for id in &request.inscription_ids {
        carriers.push(locate(ctx, id).await?);
    }
    log::info!(
        "Sending {} inscription(s) to {}",
        request.inscription_ids.len(),
        request.recipient
    );
    build_send_utxos(ctx, &carriers, recipient).await
}
