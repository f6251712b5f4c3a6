//! Runestone payloads: `OP_RETURN OP_13 <tag/value varints>`
//!
//! Fields are emitted as `tag value` pairs. Tag `0` starts the body, which runs
//! to the end of the payload as groups of four integers per edict with the
//! rune id delta-encoded against the previous edict.

use bitcoin::opcodes::all::{OP_PUSHNUM_13, OP_RETURN};
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::{Amount, Script, ScriptBuf, TxOut};

use super::varint;
use crate::error::{LaserError, Result};
use crate::utxo::RuneId;

/// Runestone field tags
pub mod tag {
    pub const BODY: u128 = 0;
    pub const MINT: u128 = 20;
    pub const POINTER: u128 = 22;
    /// Odd, so indexers that predate it ignore it
    pub const REFUND_POINTER: u128 = 93;
    /// Carries protostone integers for protocols layered on runes
    pub const PROTOCOL: u128 = 16383;
}

const MAX_PUSH: usize = 520;

/// Move `amount` of rune `id` to output `output`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edict {
    pub id: RuneId,
    pub amount: u128,
    pub output: u32,
}

/// Decoded runestone
///
/// Edicts are written and read back in rune-id order. A runestone built with
/// an unsorted `edicts` list still encodes, but decodes to the sorted list;
/// [`Runestone::with_edicts`] sorts up front.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Runestone {
    /// Ascending by rune id
    pub edicts: Vec<Edict>,
    pub mint: Option<RuneId>,
    /// Output receiving unallocated runes
    pub pointer: Option<u32>,
    /// Output receiving runes if the transfer is rejected
    pub refund_pointer: Option<u32>,
    /// Raw integers under the protocol tag
    pub protocol: Vec<u128>,
}

impl Runestone {
    /// Transfer of one rune to `output`, leftovers routed to `pointer`
    pub fn transfer(id: RuneId, amount: u128, output: u32, pointer: u32) -> Self {
        Self {
            edicts: vec![Edict { id, amount, output }],
            pointer: Some(pointer),
            ..Default::default()
        }
    }

    /// Several edicts in canonical order, leftovers routed to `pointer`
    pub fn with_edicts(mut edicts: Vec<Edict>, pointer: u32) -> Self {
        edicts.sort_by_key(|e| e.id);
        Self {
            edicts,
            pointer: Some(pointer),
            ..Default::default()
        }
    }

    /// Mint of rune `id`, minted amount routed to `pointer`
    pub fn mint(id: RuneId, pointer: u32) -> Self {
        Self {
            mint: Some(id),
            pointer: Some(pointer),
            ..Default::default()
        }
    }

    /// Runestone that only carries protocol integers
    pub fn with_protocol(protocol: Vec<u128>) -> Self {
        Self {
            protocol,
            ..Default::default()
        }
    }

    /// Field integers in wire order
    pub fn to_integers(&self) -> Vec<u128> {
        let mut payload = Vec::new();

        if let Some(mint) = self.mint {
            payload.extend([tag::MINT, u128::from(mint.block), tag::MINT, u128::from(mint.tx)]);
        }
        if let Some(pointer) = self.pointer {
            payload.extend([tag::POINTER, u128::from(pointer)]);
        }
        if let Some(refund) = self.refund_pointer {
            payload.extend([tag::REFUND_POINTER, u128::from(refund)]);
        }
        for value in &self.protocol {
            payload.extend([tag::PROTOCOL, *value]);
        }

        if !self.edicts.is_empty() {
            payload.push(tag::BODY);
            let mut edicts = self.edicts.clone();
            edicts.sort_by_key(|e| e.id);
            let mut previous = RuneId::new(0, 0);
            for edict in edicts {
                let block_delta = edict.id.block - previous.block;
                let tx_delta = if block_delta == 0 {
                    edict.id.tx - previous.tx
                } else {
                    edict.id.tx
                };
                payload.extend([
                    u128::from(block_delta),
                    u128::from(tx_delta),
                    edict.amount,
                    u128::from(edict.output),
                ]);
                previous = edict.id;
            }
        }

        payload
    }

    /// Varint payload without the script framing
    pub fn payload(&self) -> Vec<u8> {
        varint::encode_all(&self.to_integers())
    }

    /// `OP_RETURN OP_13 <payload>` split into standard-size pushes
    pub fn encipher(&self) -> Result<ScriptBuf> {
        let payload = self.payload();
        let mut builder = Builder::new()
            .push_opcode(OP_RETURN)
            .push_opcode(OP_PUSHNUM_13);
        for chunk in payload.chunks(MAX_PUSH) {
            let push = PushBytesBuf::try_from(chunk.to_vec())
                .map_err(|e| LaserError::Codec(format!("runestone push: {}", e)))?;
            builder = builder.push_slice(push);
        }
        Ok(builder.into_script())
    }

    /// Zero-value output carrying this runestone
    pub fn to_txout(&self) -> Result<TxOut> {
        Ok(TxOut {
            value: Amount::ZERO,
            script_pubkey: self.encipher()?,
        })
    }

    /// Parse a runestone from an output script
    pub fn decipher(script: &Script) -> Result<Self> {
        let mut instructions = script.instructions();
        match (instructions.next(), instructions.next()) {
            (Some(Ok(Instruction::Op(first))), Some(Ok(Instruction::Op(second))))
                if first == OP_RETURN && second == OP_PUSHNUM_13 => {}
            _ => return Err(LaserError::Codec("script is not a runestone".to_string())),
        }

        let mut payload = Vec::new();
        for instruction in instructions {
            match instruction {
                Ok(Instruction::PushBytes(bytes)) => payload.extend_from_slice(bytes.as_bytes()),
                Ok(Instruction::Op(op)) => {
                    return Err(LaserError::Codec(format!("opcode {} inside runestone", op)))
                }
                Err(e) => return Err(LaserError::Codec(format!("runestone script: {}", e))),
            }
        }

        Self::from_integers(&varint::decode_all(&payload)?)
    }

    /// Rebuild from field integers
    pub fn from_integers(integers: &[u128]) -> Result<Self> {
        let mut runestone = Runestone::default();
        let mut mint_parts = Vec::new();
        let mut i = 0;

        while i < integers.len() {
            let field = integers[i];
            if field == tag::BODY {
                runestone.edicts = decode_edicts(&integers[i + 1..])?;
                break;
            }
            let value = *integers
                .get(i + 1)
                .ok_or_else(|| LaserError::Codec(format!("tag {} has no value", field)))?;
            i += 2;

            match field {
                tag::MINT => mint_parts.push(value),
                tag::POINTER => runestone.pointer = Some(to_u32(value, "pointer")?),
                tag::REFUND_POINTER => runestone.refund_pointer = Some(to_u32(value, "refund pointer")?),
                tag::PROTOCOL => runestone.protocol.push(value),
                odd if odd % 2 == 1 => {
                    log::debug!("Ignoring unknown odd runestone tag {}", odd);
                }
                even => {
                    return Err(LaserError::Codec(format!("unrecognised even runestone tag {}", even)))
                }
            }
        }

        runestone.mint = match mint_parts.as_slice() {
            [] => None,
            [block, tx] => Some(RuneId::new(
                u64::try_from(*block).map_err(|_| LaserError::Codec("mint block overflow".into()))?,
                to_u32(*tx, "mint tx")?,
            )),
            _ => return Err(LaserError::Codec("mint needs exactly block and tx".to_string())),
        };

        Ok(runestone)
    }
}

fn decode_edicts(integers: &[u128]) -> Result<Vec<Edict>> {
    if integers.len() % 4 != 0 {
        return Err(LaserError::Codec(format!(
            "edict body of {} integers is not a multiple of four",
            integers.len()
        )));
    }
    let mut previous = RuneId::new(0, 0);
    let mut edicts = Vec::with_capacity(integers.len() / 4);
    for group in integers.chunks(4) {
        let block_delta =
            u64::try_from(group[0]).map_err(|_| LaserError::Codec("edict block overflow".into()))?;
        let tx_delta = to_u32(group[1], "edict tx")?;
        let block = previous
            .block
            .checked_add(block_delta)
            .ok_or_else(|| LaserError::Codec("edict block overflow".into()))?;
        let tx = if block_delta == 0 {
            previous
                .tx
                .checked_add(tx_delta)
                .ok_or_else(|| LaserError::Codec("edict tx overflow".into()))?
        } else {
            tx_delta
        };
        let id = RuneId::new(block, tx);
        edicts.push(Edict {
            id,
            amount: group[2],
            output: to_u32(group[3], "edict output")?,
        });
        previous = id;
    }
    Ok(edicts)
}

fn to_u32(value: u128, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| LaserError::Codec(format!("{} {} exceeds u32", what, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_payload_layout() {
        let stone = Runestone::transfer(RuneId::new(840000, 3), 1000, 2, 1);
        assert_eq!(stone.to_integers(), vec![22, 1, 0, 840000, 3, 1000, 2]);
        let script = stone.encipher().unwrap();
        assert!(script.is_op_return());
        assert_eq!(script.as_bytes()[1], 0x5d);
    }

    #[test]
    fn test_transfer_round_trip() {
        let stone = Runestone::transfer(RuneId::new(840000, 3), 1000, 2, 1);
        let decoded = Runestone::decipher(&stone.encipher().unwrap()).unwrap();
        assert_eq!(decoded, stone);
    }

    #[test]
    fn test_boundary_amounts_round_trip() {
        for amount in [0u128, 1, u64::MAX as u128, u128::MAX] {
            let stone = Runestone::transfer(RuneId::new(1, 0), amount, 0, 0);
            assert_eq!(Runestone::decipher(&stone.encipher().unwrap()).unwrap(), stone);
        }
    }

    #[test]
    fn test_empty_runestone_round_trip() {
        let stone = Runestone::default();
        assert_eq!(Runestone::decipher(&stone.encipher().unwrap()).unwrap(), stone);
    }

    #[test]
    fn test_multiple_edicts_delta_encoded() {
        let stone = Runestone {
            edicts: vec![
                Edict { id: RuneId::new(100, 1), amount: 5, output: 1 },
                Edict { id: RuneId::new(100, 4), amount: 6, output: 2 },
                Edict { id: RuneId::new(200, 2), amount: 7, output: 3 },
            ],
            pointer: Some(0),
            refund_pointer: Some(4),
            ..Default::default()
        };
        let integers = stone.to_integers();
        assert_eq!(&integers[5..], &[100, 1, 5, 1, 0, 3, 6, 2, 100, 2, 7, 3]);
        assert_eq!(Runestone::from_integers(&integers).unwrap(), stone);
    }

    #[test]
    fn test_with_edicts_is_canonical() {
        let stone = Runestone::with_edicts(
            vec![
                Edict { id: RuneId::new(200, 2), amount: 7, output: 3 },
                Edict { id: RuneId::new(100, 4), amount: 6, output: 2 },
                Edict { id: RuneId::new(100, 1), amount: 5, output: 1 },
            ],
            0,
        );
        assert_eq!(stone.edicts[0].id, RuneId::new(100, 1));
        assert_eq!(Runestone::decipher(&stone.encipher().unwrap()).unwrap(), stone);
    }

    #[test]
    fn test_mint_round_trip() {
        let stone = Runestone::mint(RuneId::new(840000, 28), 1);
        assert_eq!(Runestone::decipher(&stone.encipher().unwrap()).unwrap(), stone);
    }

    #[test]
    fn test_large_protocol_payload_spans_pushes() {
        let stone = Runestone::with_protocol(vec![u128::MAX; 40]);
        let script = stone.encipher().unwrap();
        assert!(script.len() > MAX_PUSH);
        assert_eq!(Runestone::decipher(&script).unwrap(), stone);
    }

    #[test]
    fn test_rejects_non_runestone_scripts() {
        let p2wpkh = ScriptBuf::from_hex("0014751e76e8199196d454941c45d1b3a323f1433bd6").unwrap();
        assert!(Runestone::decipher(&p2wpkh).is_err());
        assert!(Runestone::from_integers(&[22]).is_err());
        assert!(Runestone::from_integers(&[0, 1, 2, 3]).is_err());
        assert!(Runestone::from_integers(&[4, 1]).is_err());
        assert!(Runestone::from_integers(&[5, 1]).is_ok());
    }
}
