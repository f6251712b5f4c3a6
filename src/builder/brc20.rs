//! BRC-20 transfer
//!
//! Three transactions: a commit and a reveal that inscribe the transfer
//! operation on the sender's ordinals address, then a plain spend of the
//! fresh inscription output to the recipient.

use bitcoin::Txid;
use serde::{Deserialize, Serialize};

use super::inscriptions::{self, CommitTransaction, REVEAL_VOUT};
use super::{require_param, BuildContext, BuiltTransaction};
use crate::codec::brc20::Brc20Operation;
use crate::datasource::Capability;
use crate::error::{LaserError, Result};
use crate::utxo::{parse_decimal_amount, Utxo, DUST_VALUE};

/// Fractional digits BRC-20 amounts may carry
const BRC20_DECIMALS: u8 = 18;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Brc20Transfer {
    pub ticker: String,
    /// Decimal string as inscribed
    pub amount: String,
    pub recipient: String,
}

impl Brc20Transfer {
    /// Encoded transfer operation; checks parameters without I/O
    fn operation(&self) -> Result<Brc20Operation> {
        require_param(&self.ticker, "ticker")?;
        require_param(&self.amount, "amount")?;
        require_param(&self.recipient, "recipient")?;
        let units = parse_decimal_amount(&self.amount, BRC20_DECIMALS)?;
        super::require_amount(units, "amount")?;
        Ok(Brc20Operation::transfer(&self.ticker, &self.amount))
    }
}

/// Fail early when an indexer says the available balance is too small
async fn check_available(ctx: &BuildContext<'_>, request: &Brc20Transfer) -> Result<()> {
    if !ctx.data_sources.any_source_supports(Capability::Brc20Balances) {
        log::warn!("No data source reports BRC-20 balances; skipping balance check");
        return Ok(());
    }
    let balances = ctx.data_sources.get_brc20_balances(&ctx.ordinals.address).await?;
    let available = balances
        .iter()
        .find(|b| b.ticker.eq_ignore_ascii_case(&request.ticker))
        .map(|b| parse_decimal_amount(&b.available, BRC20_DECIMALS))
        .transpose()?
        .unwrap_or(0);
    let wanted = parse_decimal_amount(&request.amount, BRC20_DECIMALS)?;
    if available < wanted {
        return Err(LaserError::InsufficientAssetBalance(format!(
            "brc-20 {}: need {}, have {} available",
            request.ticker, request.amount, available
        )));
    }
    Ok(())
}

/// Commit for the transfer inscription; the reveal lands it on the ordinals address
pub async fn build_commit(ctx: &BuildContext<'_>, request: &Brc20Transfer) -> Result<CommitTransaction> {
    let inscription = request.operation()?.to_inscription()?;
    ctx.validate()?;
    ctx.recipient_script(&request.recipient)?;
    check_available(ctx, request).await?;
    inscriptions::build_commit(ctx, &inscription, None).await
}

/// Hand the revealed transfer inscription to the recipient
pub async fn build_delivery(
    ctx: &BuildContext<'_>,
    request: &Brc20Transfer,
    reveal_txid: Txid,
) -> Result<BuiltTransaction> {
    let recipient = ctx.recipient_script(&request.recipient)?;
    let mut carrier = Utxo::new(reveal_txid, REVEAL_VOUT, DUST_VALUE, ctx.ordinals_script()?);
    carrier.inscriptions.push(format!("{}i0", reveal_txid));
    log::info!(
        "Delivering brc-20 transfer of {} {} to {}",
        request.amount,
        request.ticker,
        request.recipient
    );
    inscriptions::build_send_utxos(ctx, &[carrier], recipient).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::testing::*;
    use super::*;
    use crate::codec::brc20::Brc20Operation;
    use crate::codec::inscription::Inscription;
    use crate::network::Network;

    fn transfer(amount: &str, recipient: &str) -> Brc20Transfer {
        Brc20Transfer {
            ticker: "ordi".to_string(),
            amount: amount.to_string(),
            recipient: recipient.to_string(),
        }
    }

    #[tokio::test]
    async fn test_zero_amount_fails_before_io() {
        let chain = Arc::new(FakeChain::default());
        let manager = manager(chain.clone());
        let ctx = BuildContext::new(&manager, Network::Mainnet, segwit_account(2), taproot_account(1));

        for amount in ["0", "0.000", ""] {
            let err = build_commit(&ctx, &transfer(amount, &taproot_account(7).address))
                .await
                .unwrap_err();
            assert!(matches!(err, LaserError::MissingRequiredParameters(_)), "{}", amount);
        }
        assert_eq!(chain.call_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_reveal_delivery() {
        let chain = Arc::new(FakeChain::default());
        let payment = segwit_account(2);
        let ordinals = taproot_account(1);
        chain.fund(&payment.address, vec![utxo(&payment, 1, 30_000), utxo(&payment, 2, 25_000)]);
        let manager = manager(chain);
        let ctx = BuildContext::new(&manager, Network::Mainnet, payment, ordinals.clone()).with_fee_rate(2.0);
        let recipient = taproot_account(7);
        let request = transfer("10.5", &recipient.address);

        let CommitTransaction { commit, plan } = build_commit(&ctx, &request).await.unwrap();
        let (_, inscribed) = Inscription::from_reveal_script(&plan.commitment.reveal_script).unwrap();
        assert_eq!(Brc20Operation::decode(&inscribed.body).unwrap(), Brc20Operation::transfer("ordi", "10.5"));

        let reveal = inscriptions::build_reveal(&ctx, &plan, commit.txid()).unwrap();
        assert_eq!(
            reveal.unsigned.psbt().unsigned_tx.output[0].script_pubkey,
            ctx.ordinals_script().unwrap()
        );

        let delivery = build_delivery(&ctx, &request, reveal.txid()).await.unwrap();
        let tx = &delivery.unsigned.psbt().unsigned_tx;
        assert_eq!(tx.input[0].previous_output.txid, reveal.txid());
        assert_eq!(tx.output[0].value.to_sat(), DUST_VALUE);
        assert_eq!(tx.output[0].script_pubkey, ctx.recipient_script(&recipient.address).unwrap());
        assert_eq!(delivery.inputs_to_sign[0].address, ordinals.address);
    }
}
