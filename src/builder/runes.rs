//! Rune transfer and mint
//!
//! Transfer layout: `[runestone, sender carrier, recipient carrier, change]`.
//! The edict moves the amount to output 2 and the pointer routes leftover
//! runes back to the sender at output 1.

use serde::{Deserialize, Serialize};

use super::{accumulate_assets, require_amount, AssetOrder, BuildContext, BuiltTransaction, ChangePolicy, Draft};
use crate::codec::runestone::Runestone;
use crate::error::{LaserError, Result};
use crate::utxo::{same_rune_name, RuneId, RuneRef, Utxo, DUST_VALUE};

const SENDER_OUTPUT: u32 = 1;
const RECIPIENT_OUTPUT: u32 = 2;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuneSend {
    pub rune: RuneRef,
    /// Base units
    pub amount: u128,
    pub recipient: String,
    #[serde(default)]
    pub order: AssetOrder,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuneMint {
    pub rune_id: RuneId,
    /// Defaults to the ordinals account
    pub recipient: Option<String>,
}

/// Id of `rune`, looked up on the selected outputs when given by name
fn resolve_rune_id(rune: &RuneRef, selected: &[Utxo]) -> Result<RuneId> {
    match rune {
        RuneRef::Id(id) => Ok(*id),
        RuneRef::Name(name) => selected
            .iter()
            .flat_map(|u| u.runes.iter())
            .find(|r| same_rune_name(&r.name, name))
            .and_then(|r| r.id)
            .ok_or_else(|| LaserError::Parse(format!("no rune id known for {}", name))),
    }
}

pub async fn build_send(ctx: &BuildContext<'_>, request: &RuneSend) -> Result<BuiltTransaction> {
    ctx.validate()?;
    require_amount(request.amount, "amount")?;
    if let RuneRef::Name(name) = &request.rune {
        super::require_param(name, "rune")?;
    }
    let recipient = ctx.recipient_script(&request.recipient)?;
    let fee_rate = ctx.fee_rate().await?;

    let outpoints = ctx.data_sources.get_rune_outpoints(&ctx.ordinals.address).await?;
    let (selected, held) = accumulate_assets(
        outpoints,
        request.amount,
        request.order,
        |u| u.rune_amount(&request.rune),
        &request.rune.to_string(),
    )?;
    let rune_id = resolve_rune_id(&request.rune, &selected)?;
    log::debug!(
        "Moving {} of rune {} from {} output(s) holding {}",
        request.amount,
        rune_id,
        selected.len(),
        held
    );

    let mut draft = Draft::new();
    for utxo in &selected {
        draft.add_input(ctx, utxo, &ctx.ordinals).await?;
    }
    draft.add_txout(Runestone::transfer(rune_id, request.amount, RECIPIENT_OUTPUT, SENDER_OUTPUT).to_txout()?);
    draft.add_output(ctx.ordinals_script()?, DUST_VALUE);
    draft.add_output(recipient, DUST_VALUE);

    let target = (draft.output_value() + DUST_VALUE).saturating_sub(draft.input_value());
    let selection = draft.fund(ctx, fee_rate, target, draft.output_count() + 1).await?;

    log::info!("Sending {} of rune {} to {}", request.amount, rune_id, request.recipient);
    draft.settle(selection.fee, ctx.payment_script()?, ChangePolicy::Required)
}

/// `[runestone, recipient carrier, change?]`; no rune inputs
pub async fn build_mint(ctx: &BuildContext<'_>, request: &RuneMint) -> Result<BuiltTransaction> {
    ctx.validate()?;
    let recipient = match &request.recipient {
        Some(recipient) => ctx.recipient_script(recipient)?,
        None => ctx.ordinals_script()?,
    };
    let fee_rate = ctx.fee_rate().await?;

    let mut draft = Draft::new();
    draft.add_txout(Runestone::mint(request.rune_id, 1).to_txout()?);
    draft.add_output(recipient, DUST_VALUE);
    let selection = draft.fund(ctx, fee_rate, DUST_VALUE, draft.output_count() + 1).await?;

    log::info!("Minting rune {}", request.rune_id);
    draft.settle(selection.fee, ctx.payment_script()?, ChangePolicy::DropDust)
}
