//! Unsigned transactions as PSBTs
//!
//! # Architecture
//!
//! Builders hand back an [`UnsignedTransaction`], which is a PSBT whose
//! invariants were checked on construction:
//!
//! - every input declares the value it spends
//! - outputs plus fee never exceed inputs
//! - the fee is at least the protocol floor
//! - at most one data output, and it carries no value
//!
//! The fee is derived from the PSBT, never stored beside it. Signed PSBTs come
//! back from the signer as hex or base64. Text that is neither is rejected.
//! Inputs the signer left unfinalized are finalized here for the script
//! families the builders produce.

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bitcoin::psbt::{Input, Psbt};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::taproot::TapLeafHash;
use bitcoin::{ScriptBuf, Transaction, Txid, Witness};
use regex::Regex;

use crate::coin_select::FEE_FLOOR;
use crate::error::{LaserError, Result};

const HEX_PATTERN: &str = r"^[a-fA-F0-9]+$";
const BASE64_PATTERN: &str =
    r"^(?:[A-Za-z0-9+/]{4})*?(?:[A-Za-z0-9+/]{2}==|[A-Za-z0-9+/]{3}=)?$";

static HEX_RE: OnceLock<Regex> = OnceLock::new();
static BASE64_RE: OnceLock<Regex> = OnceLock::new();

fn cached_regex(cell: &'static OnceLock<Regex>, pattern: &str) -> Result<&'static Regex> {
    if let Some(re) = cell.get() {
        return Ok(re);
    }
    let re = Regex::new(pattern).map_err(|e| LaserError::Config(format!("regex: {}", e)))?;
    Ok(cell.get_or_init(|| re))
}

/// Textual PSBT encodings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PsbtEncoding {
    Hex,
    Base64,
}

/// Decide how `text` is encoded; hex wins when both alphabets match
pub fn detect_encoding(text: &str) -> Result<PsbtEncoding> {
    let text = text.trim();
    if text.is_empty() {
        return Err(LaserError::InvalidTransactionFormat("empty PSBT".to_string()));
    }
    if cached_regex(&HEX_RE, HEX_PATTERN)?.is_match(text) {
        return Ok(PsbtEncoding::Hex);
    }
    if cached_regex(&BASE64_RE, BASE64_PATTERN)?.is_match(text) {
        return Ok(PsbtEncoding::Base64);
    }
    Err(LaserError::InvalidTransactionFormat(
        "PSBT is neither hex nor base64".to_string(),
    ))
}

/// Parse a PSBT from hex or base64 text
pub fn decode_psbt(text: &str) -> Result<Psbt> {
    let text = text.trim();
    let bytes = match detect_encoding(text)? {
        PsbtEncoding::Hex => hex::decode(text)
            .map_err(|e| LaserError::InvalidTransactionFormat(format!("hex: {}", e)))?,
        PsbtEncoding::Base64 => BASE64
            .decode(text)
            .map_err(|e| LaserError::InvalidTransactionFormat(format!("base64: {}", e)))?,
    };
    Psbt::deserialize(&bytes).map_err(|e| LaserError::InvalidTransactionFormat(format!("psbt: {}", e)))
}

pub fn psbt_to_hex(psbt: &Psbt) -> String {
    hex::encode(psbt.serialize())
}

pub fn psbt_to_base64(psbt: &Psbt) -> String {
    BASE64.encode(psbt.serialize())
}

/// A built, unsigned transaction
#[derive(Clone, Debug, PartialEq)]
pub struct UnsignedTransaction {
    psbt: Psbt,
}

impl UnsignedTransaction {
    /// Wrap `psbt` after checking the transaction invariants
    pub fn new(psbt: Psbt) -> Result<Self> {
        let unsigned = Self { psbt };
        unsigned.check_invariants()?;
        Ok(unsigned)
    }

    fn check_invariants(&self) -> Result<()> {
        let tx = &self.psbt.unsigned_tx;
        if tx.input.is_empty() || tx.output.is_empty() {
            return Err(LaserError::InvalidTransaction(
                "transaction needs inputs and outputs".to_string(),
            ));
        }

        let data_outputs: Vec<_> = tx.output.iter().filter(|o| o.script_pubkey.is_op_return()).collect();
        if data_outputs.len() > 1 {
            return Err(LaserError::InvalidTransaction(format!(
                "{} data outputs, at most one allowed",
                data_outputs.len()
            )));
        }
        if data_outputs.iter().any(|o| o.value.to_sat() != 0) {
            return Err(LaserError::InvalidTransaction(
                "data output must carry zero value".to_string(),
            ));
        }

        let inputs = self.input_total()?;
        let outputs = self.output_total();
        if outputs > inputs {
            return Err(LaserError::InvalidTransaction(format!(
                "outputs {} exceed inputs {}",
                outputs, inputs
            )));
        }
        let fee = inputs - outputs;
        if fee < FEE_FLOOR {
            return Err(LaserError::InvalidTransaction(format!(
                "fee {} below floor {}",
                fee, FEE_FLOOR
            )));
        }
        Ok(())
    }

    pub fn psbt(&self) -> &Psbt {
        &self.psbt
    }

    pub fn into_psbt(self) -> Psbt {
        self.psbt
    }

    pub fn txid(&self) -> Txid {
        self.psbt.unsigned_tx.compute_txid()
    }

    /// Sum of the values spent, read from each input's UTXO record
    pub fn input_total(&self) -> Result<u64> {
        let tx = &self.psbt.unsigned_tx;
        let mut total = 0u64;
        for (index, (txin, input)) in tx.input.iter().zip(&self.psbt.inputs).enumerate() {
            total += spent_value(index, txin.previous_output.vout, input)?;
        }
        Ok(total)
    }

    pub fn output_total(&self) -> u64 {
        self.psbt.unsigned_tx.output.iter().map(|o| o.value.to_sat()).sum()
    }

    /// `inputs - outputs`
    pub fn fee(&self) -> u64 {
        self.input_total()
            .map(|inputs| inputs.saturating_sub(self.output_total()))
            .unwrap_or(0)
    }

    pub fn to_hex(&self) -> String {
        psbt_to_hex(&self.psbt)
    }

    pub fn to_base64(&self) -> String {
        psbt_to_base64(&self.psbt)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.psbt.serialize()
    }
}

fn spent_value(index: usize, vout: u32, input: &Input) -> Result<u64> {
    if let Some(utxo) = &input.witness_utxo {
        return Ok(utxo.value.to_sat());
    }
    if let Some(prev) = &input.non_witness_utxo {
        return prev
            .output
            .get(vout as usize)
            .map(|o| o.value.to_sat())
            .ok_or_else(|| {
                LaserError::InvalidTransaction(format!("input {} spends missing output {}", index, vout))
            });
    }
    Err(LaserError::InvalidTransaction(format!(
        "input {} has no UTXO information",
        index
    )))
}

/// Finalize every input that the signer left with signatures only
pub fn finalize_psbt(psbt: &mut Psbt) -> Result<()> {
    for (index, input) in psbt.inputs.iter_mut().enumerate() {
        if input.final_script_witness.is_some() || input.final_script_sig.is_some() {
            continue;
        }
        finalize_input(index, input)?;
    }
    Ok(())
}

fn finalize_input(index: usize, input: &mut Input) -> Result<()> {
    let (script_sig, witness) = final_scripts(index, input)?;
    input.final_script_sig = script_sig;
    input.final_script_witness = witness;

    input.partial_sigs.clear();
    input.tap_key_sig = None;
    input.tap_script_sigs.clear();
    input.tap_scripts.clear();
    input.redeem_script = None;
    input.witness_script = None;
    Ok(())
}

/// Final `scriptSig` and witness for one signed input
fn final_scripts(index: usize, input: &Input) -> Result<(Option<ScriptBuf>, Option<Witness>)> {
    if let Some(sig) = input.tap_key_sig {
        return Ok((None, Some(Witness::from_slice(&[sig.to_vec()]))));
    }

    if let Some((control_block, (script, version))) = input.tap_scripts.iter().next() {
        let leaf_hash = TapLeafHash::from_script(script, *version);
        let sig = input
            .tap_script_sigs
            .iter()
            .find(|((_, hash), _)| *hash == leaf_hash)
            .map(|(_, sig)| *sig)
            .ok_or_else(|| unsigned(index))?;
        let witness = Witness::from_slice(&[sig.to_vec(), script.to_bytes(), control_block.serialize()]);
        return Ok((None, Some(witness)));
    }

    let (pubkey, sig) = input.partial_sigs.iter().next().ok_or_else(|| unsigned(index))?;
    let sig = sig.to_vec();
    let pubkey = pubkey.to_bytes();
    if let Some(redeem) = &input.redeem_script {
        Ok((
            Some(push_only(&[redeem.to_bytes()])?),
            Some(Witness::from_slice(&[sig, pubkey])),
        ))
    } else if input.witness_utxo.is_some() {
        Ok((None, Some(Witness::from_slice(&[sig, pubkey]))))
    } else {
        Ok((Some(push_only(&[sig, pubkey])?), None))
    }
}

fn unsigned(index: usize) -> LaserError {
    LaserError::InvalidTransaction(format!("input {} is not signed", index))
}

fn push_only(items: &[Vec<u8>]) -> Result<ScriptBuf> {
    let mut builder = Builder::new();
    for item in items {
        let push = PushBytesBuf::try_from(item.clone())
            .map_err(|e| LaserError::InvalidTransaction(format!("script push: {}", e)))?;
        builder = builder.push_slice(push);
    }
    Ok(builder.into_script())
}

/// Finalize if needed and extract the network transaction
pub fn extract_transaction(mut psbt: Psbt) -> Result<Transaction> {
    finalize_psbt(&mut psbt)?;
    psbt.extract_tx()
        .map_err(|e| LaserError::InvalidTransaction(format!("extract: {}", e)))
}

/// Raw transaction hex ready for broadcast
pub fn extract_transaction_hex(psbt: Psbt) -> Result<String> {
    let tx = extract_transaction(psbt)?;
    Ok(bitcoin::consensus::encode::serialize_hex(&tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, Sequence, TxIn, TxOut};

    fn psbt_with(values_in: &[u64], outputs: Vec<TxOut>) -> Psbt {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: values_in
                .iter()
                .enumerate()
                .map(|(i, _)| TxIn {
                    previous_output: OutPoint::new(Txid::all_zeros(), i as u32),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs,
        };
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        for (input, value) in psbt.inputs.iter_mut().zip(values_in) {
            input.witness_utxo = Some(TxOut {
                value: Amount::from_sat(*value),
                script_pubkey: ScriptBuf::from_hex("0014751e76e8199196d454941c45d1b3a323f1433bd6")
                    .unwrap(),
            });
        }
        psbt
    }

    fn pay(value: u64) -> TxOut {
        TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::from_hex("0014751e76e8199196d454941c45d1b3a323f1433bd6").unwrap(),
        }
    }

    #[test]
    fn test_fee_is_derived() {
        let tx = UnsignedTransaction::new(psbt_with(&[10_000], vec![pay(9_000)])).unwrap();
        assert_eq!(tx.fee(), 1_000);
        assert_eq!(tx.input_total().unwrap(), 10_000);
    }

    #[test]
    fn test_invariants_enforced() {
        assert!(UnsignedTransaction::new(psbt_with(&[10_000], vec![pay(10_001)])).is_err());
        assert!(UnsignedTransaction::new(psbt_with(&[10_000], vec![pay(9_900)])).is_err());

        let mut data = pay(1);
        data.script_pubkey = ScriptBuf::from_hex("6a03010203").unwrap();
        assert!(UnsignedTransaction::new(psbt_with(&[10_000], vec![pay(5_000), data])).is_err());
    }

    #[test]
    fn test_detects_encodings() {
        assert_eq!(detect_encoding("70736274ff").unwrap(), PsbtEncoding::Hex);
        assert_eq!(detect_encoding("cHNidP8=").unwrap(), PsbtEncoding::Base64);
        assert!(matches!(
            detect_encoding("not a psbt!"),
            Err(LaserError::InvalidTransactionFormat(_))
        ));
        assert!(matches!(detect_encoding(""), Err(LaserError::InvalidTransactionFormat(_))));
    }

    #[test]
    fn test_hex_to_base64_matches_direct_base64() {
        let tx = UnsignedTransaction::new(psbt_with(&[10_000, 5_000], vec![pay(14_000)])).unwrap();
        let reparsed = decode_psbt(&tx.to_hex()).unwrap();
        assert_eq!(psbt_to_base64(&reparsed), tx.to_base64());
        assert_eq!(decode_psbt(&tx.to_base64()).unwrap(), *tx.psbt());
    }

    #[test]
    fn test_unsigned_input_cannot_be_finalized() {
        let mut psbt = psbt_with(&[10_000], vec![pay(9_000)]);
        assert!(finalize_psbt(&mut psbt).is_err());
    }
}
