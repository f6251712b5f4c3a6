//! Alkane transfer and contract mint
//!
//! Transfer layout: `[sender carrier, recipient carrier, protostone, change]`.
//! The edict moves the amount to output 1; pointer and refund pointer send
//! everything else back to the sender at output 0.
//!
//! Mint layout: `[recipient carrier, protostone, frontend fee?, change?]`.

use serde::{Deserialize, Serialize};

use super::{accumulate_assets, require_amount, AssetOrder, BuildContext, BuiltTransaction, ChangePolicy, Draft};
use crate::codec::protostone::{self, Cellpack, Protostone};
use crate::error::Result;
use crate::utxo::{AlkaneId, DUST_VALUE};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlkaneSend {
    pub id: AlkaneId,
    pub amount: u128,
    pub recipient: String,
    #[serde(default)]
    pub order: AssetOrder,
}

/// Fee paid to the application that prepared a mint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontendFee {
    pub address: String,
    pub amount: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlkaneMint {
    pub id: AlkaneId,
    /// Extra calldata after the mint opcode
    #[serde(default)]
    pub args: Vec<u128>,
    /// Defaults to the ordinals account
    pub recipient: Option<String>,
    pub frontend_fee: Option<FrontendFee>,
}

pub async fn build_send(ctx: &BuildContext<'_>, request: &AlkaneSend) -> Result<BuiltTransaction> {
    ctx.validate()?;
    require_amount(request.amount, "amount")?;
    let recipient = ctx.recipient_script(&request.recipient)?;
    let fee_rate = ctx.fee_rate().await?;

    let holdings = ctx.data_sources.get_alkanes_by_address(&ctx.ordinals.address).await?;
    let (selected, held) = accumulate_assets(
        holdings,
        request.amount,
        request.order,
        |u| u.alkane_amount(&request.id),
        &format!("alkane {}", request.id),
    )?;
    log::debug!(
        "Moving {} of alkane {} from {} output(s) holding {}",
        request.amount,
        request.id,
        selected.len(),
        held
    );

    let mut draft = Draft::new();
    for utxo in &selected {
        draft.add_input(ctx, utxo, &ctx.ordinals).await?;
    }
    draft.add_output(ctx.ordinals_script()?, DUST_VALUE);
    draft.add_output(recipient, DUST_VALUE);
    draft.add_txout(protostone::to_txout(&[Protostone::transfer(request.id, request.amount, 1, 0)])?);

    let target = (draft.output_value() + DUST_VALUE).saturating_sub(draft.input_value());
    let selection = draft.fund(ctx, fee_rate, target, draft.output_count() + 1).await?;

    log::info!("Sending {} of alkane {} to {}", request.amount, request.id, request.recipient);
    draft.settle(selection.fee, ctx.payment_script()?, ChangePolicy::Required)
}

pub async fn build_mint(ctx: &BuildContext<'_>, request: &AlkaneMint) -> Result<BuiltTransaction> {
    ctx.validate()?;
    let recipient = match &request.recipient {
        Some(recipient) => ctx.recipient_script(recipient)?,
        None => ctx.ordinals_script()?,
    };
    let frontend = match &request.frontend_fee {
        Some(fee) if fee.amount >= DUST_VALUE => Some((ctx.recipient_script(&fee.address)?, fee.amount)),
        Some(fee) => {
            log::debug!("Skipping frontend fee of {} sats, below dust", fee.amount);
            None
        }
        None => None,
    };
    let fee_rate = ctx.fee_rate().await?;

    let cellpack = Cellpack::mint(request.id, &request.args);
    let payload = protostone::to_txout(&[Protostone::call(&cellpack, 0)])?;

    let mut draft = Draft::new();
    draft.extra_vbytes = payload.script_pubkey.len() as u64;
    draft.add_output(recipient, DUST_VALUE);
    draft.add_txout(payload);
    if let Some((script, amount)) = frontend {
        draft.add_output(script, amount);
    }

    let target = draft.output_value();
    let selection = draft.fund(ctx, fee_rate, target, draft.output_count() + 1).await?;

    log::info!("Minting alkane {}", request.id);
    draft.settle(selection.fee, ctx.payment_script()?, ChangePolicy::DropDust)
}
