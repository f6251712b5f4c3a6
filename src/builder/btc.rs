//! Plain BTC transfer

use serde::{Deserialize, Serialize};

use super::{require_amount, BuildContext, BuiltTransaction, ChangePolicy, Draft};
use crate::error::{LaserError, Result};
use crate::utxo::DUST_VALUE;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtcSend {
    pub recipient: String,
    /// Satoshis
    pub amount: u64,
}

/// `[recipient, change]`, funded from the payment account
pub async fn build_send(ctx: &BuildContext<'_>, request: &BtcSend) -> Result<BuiltTransaction> {
    ctx.validate()?;
    require_amount(request.amount as u128, "amount")?;
    if request.amount < DUST_VALUE {
        return Err(LaserError::InvalidTransaction(format!(
            "amount {} is below dust ({})",
            request.amount, DUST_VALUE
        )));
    }
    let recipient = ctx.recipient_script(&request.recipient)?;
    let fee_rate = ctx.fee_rate().await?;

    let mut draft = Draft::new();
    draft.add_output(recipient, request.amount);
    let selection = draft
        .fund(ctx, fee_rate, request.amount + DUST_VALUE, draft.output_count() + 1)
        .await?;

    log::info!("Sending {} sats to {}", request.amount, request.recipient);
    draft.settle(selection.fee, ctx.payment_script()?, ChangePolicy::Required)
}
