//! Protostones: contract-call messages carried inside a runestone
//!
//! # Layout
//!
//! Each protostone becomes `protocol_tag, chunk_count, chunk...` under the
//! runestone protocol tag. The chunks are its own tag/value varint stream
//! packed 15 bytes per integer, little endian. The calldata is encoded as a
//! varint list `[block, tx, opcode, args...]` and packed the same way under
//! repeated message tags.
//!
//! Every packed stream starts with its byte length as a varint, so zero
//! padding in the last chunk is never mistaken for a trailing zero value.

use bitcoin::{Script, ScriptBuf, TxOut};

use super::runestone::Runestone;
use super::varint;
use crate::error::{LaserError, Result};
use crate::utxo::AlkaneId;

/// Protocol tag of the alkanes metaprotocol
pub const ALKANES_PROTOCOL_TAG: u128 = 1;

/// Opcode that asks a token contract to mint
pub const MINT_OPCODE: u128 = 77;

/// Protostone field tags
pub mod tag {
    pub const BODY: u128 = 0;
    pub const MESSAGE: u128 = 81;
    pub const POINTER: u128 = 91;
    pub const REFUND: u128 = 93;
}

const CHUNK_BYTES: usize = 15;

/// Move `amount` of alkane `id` to output `output`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtoEdict {
    pub id: AlkaneId,
    pub amount: u128,
    pub output: u32,
}

/// A contract call: the target contract followed by opcode and arguments
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cellpack {
    pub target: AlkaneId,
    pub inputs: Vec<u128>,
}

impl Cellpack {
    pub fn mint(target: AlkaneId, args: &[u128]) -> Self {
        let mut inputs = vec![MINT_OPCODE];
        inputs.extend_from_slice(args);
        Self { target, inputs }
    }

    pub fn opcode(&self) -> Option<u128> {
        self.inputs.first().copied()
    }

    /// `[block, tx, inputs...]`
    pub fn to_calldata(&self) -> Vec<u128> {
        let mut calldata = vec![self.target.block, self.target.tx];
        calldata.extend_from_slice(&self.inputs);
        calldata
    }

    pub fn from_calldata(calldata: &[u128]) -> Result<Self> {
        match calldata {
            [block, tx, inputs @ ..] => Ok(Self {
                target: AlkaneId::new(*block, *tx),
                inputs: inputs.to_vec(),
            }),
            _ => Err(LaserError::Codec("calldata needs a target block and tx".to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Protostone {
    pub protocol_tag: u128,
    /// Written in alkane-id order; decoding returns them sorted
    pub edicts: Vec<ProtoEdict>,
    /// Integer calldata, empty for a pure transfer
    pub calldata: Vec<u128>,
    pub pointer: Option<u32>,
    pub refund_pointer: Option<u32>,
}

impl Protostone {
    /// Alkane transfer with leftovers and refunds routed to `pointer`
    pub fn transfer(id: AlkaneId, amount: u128, output: u32, pointer: u32) -> Self {
        Self {
            protocol_tag: ALKANES_PROTOCOL_TAG,
            edicts: vec![ProtoEdict { id, amount, output }],
            calldata: Vec::new(),
            pointer: Some(pointer),
            refund_pointer: Some(pointer),
        }
    }

    /// Contract call with results and refunds routed to `pointer`
    pub fn call(cellpack: &Cellpack, pointer: u32) -> Self {
        Self {
            protocol_tag: ALKANES_PROTOCOL_TAG,
            edicts: Vec::new(),
            calldata: cellpack.to_calldata(),
            pointer: Some(pointer),
            refund_pointer: Some(pointer),
        }
    }

    pub fn cellpack(&self) -> Result<Option<Cellpack>> {
        if self.calldata.is_empty() {
            return Ok(None);
        }
        Cellpack::from_calldata(&self.calldata).map(Some)
    }

    /// Tag/value integers of this protostone's own field stream
    fn field_integers(&self) -> Vec<u128> {
        let mut fields = Vec::new();

        if !self.calldata.is_empty() {
            let message = varint::encode_all(&self.calldata);
            for chunk in pack_chunks(&message) {
                fields.extend([tag::MESSAGE, chunk]);
            }
        }
        if let Some(pointer) = self.pointer {
            fields.extend([tag::POINTER, u128::from(pointer)]);
        }
        if let Some(refund) = self.refund_pointer {
            fields.extend([tag::REFUND, u128::from(refund)]);
        }
        if !self.edicts.is_empty() {
            fields.push(tag::BODY);
            let mut edicts = self.edicts.clone();
            edicts.sort_by_key(|e| e.id);
            let mut previous = AlkaneId::new(0, 0);
            for edict in edicts {
                let block_delta = edict.id.block - previous.block;
                let tx_delta = if block_delta == 0 {
                    edict.id.tx - previous.tx
                } else {
                    edict.id.tx
                };
                fields.extend([block_delta, tx_delta, edict.amount, u128::from(edict.output)]);
                previous = edict.id;
            }
        }

        fields
    }

    fn from_field_integers(protocol_tag: u128, integers: &[u128]) -> Result<Self> {
        let mut stone = Protostone {
            protocol_tag,
            edicts: Vec::new(),
            calldata: Vec::new(),
            pointer: None,
            refund_pointer: None,
        };
        let mut message_chunks = Vec::new();
        let mut i = 0;

        while i < integers.len() {
            let field = integers[i];
            if field == tag::BODY {
                stone.edicts = decode_edicts(&integers[i + 1..])?;
                break;
            }
            let value = integers
                .get(i + 1)
                .copied()
                .ok_or_else(|| LaserError::Codec(format!("protostone tag {} has no value", field)))?;
            i += 2;

            match field {
                tag::MESSAGE => message_chunks.push(value),
                tag::POINTER => stone.pointer = Some(to_u32(value, "pointer")?),
                tag::REFUND => stone.refund_pointer = Some(to_u32(value, "refund pointer")?),
                odd if odd % 2 == 1 => log::debug!("Ignoring unknown odd protostone tag {}", odd),
                even => {
                    return Err(LaserError::Codec(format!("unrecognised even protostone tag {}", even)))
                }
            }
        }

        if !message_chunks.is_empty() {
            let message = unpack_chunks(&message_chunks)?;
            stone.calldata = varint::decode_all(&message)?;
        }

        Ok(stone)
    }
}

/// Integers for the runestone protocol field
pub fn encode_protostones(stones: &[Protostone]) -> Vec<u128> {
    let mut values = Vec::new();
    for stone in stones {
        let stream = varint::encode_all(&stone.field_integers());
        let chunks = pack_chunks(&stream);
        values.push(stone.protocol_tag);
        values.push(chunks.len() as u128);
        values.extend(chunks);
    }
    values
}

/// Inverse of [`encode_protostones`]
pub fn decode_protostones(values: &[u128]) -> Result<Vec<Protostone>> {
    let mut stones = Vec::new();
    let mut i = 0;
    while i < values.len() {
        let protocol_tag = values[i];
        let count = values
            .get(i + 1)
            .copied()
            .ok_or_else(|| LaserError::Codec("protostone without length".to_string()))?;
        let count = usize::try_from(count)
            .map_err(|_| LaserError::Codec("protostone length overflow".to_string()))?;
        let start = i + 2;
        let end = start
            .checked_add(count)
            .filter(|end| *end <= values.len())
            .ok_or_else(|| LaserError::Codec("protostone runs past payload".to_string()))?;
        let stream = unpack_chunks(&values[start..end])?;
        let integers = varint::decode_all(&stream)?;
        stones.push(Protostone::from_field_integers(protocol_tag, &integers)?);
        i = end;
    }
    Ok(stones)
}

/// Runestone carrying `stones` and nothing else
pub fn to_runestone(stones: &[Protostone]) -> Runestone {
    Runestone::with_protocol(encode_protostones(stones))
}

/// Data script for `stones`
pub fn encipher(stones: &[Protostone]) -> Result<ScriptBuf> {
    to_runestone(stones).encipher()
}

/// Zero-value output carrying `stones`
pub fn to_txout(stones: &[Protostone]) -> Result<TxOut> {
    to_runestone(stones).to_txout()
}

/// Parse protostones out of a runestone script
pub fn decipher(script: &Script) -> Result<Vec<Protostone>> {
    decode_protostones(&Runestone::decipher(script)?.protocol)
}

/// `bytes` behind a varint length, split into 15-byte integers
fn pack_chunks(bytes: &[u8]) -> Vec<u128> {
    let mut framed = varint::encode(bytes.len() as u128);
    framed.extend_from_slice(bytes);
    framed
        .chunks(CHUNK_BYTES)
        .map(|chunk| {
            let mut buf = [0u8; 16];
            buf[..chunk.len()].copy_from_slice(chunk);
            u128::from_le_bytes(buf)
        })
        .collect()
}

fn unpack_chunks(chunks: &[u128]) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(chunks.len() * CHUNK_BYTES);
    for chunk in chunks {
        let le = chunk.to_le_bytes();
        if le[CHUNK_BYTES] != 0 {
            return Err(LaserError::Codec("protostone chunk exceeds 120 bits".to_string()));
        }
        bytes.extend_from_slice(&le[..CHUNK_BYTES]);
    }
    if bytes.is_empty() {
        return Ok(bytes);
    }

    let (len, used) = varint::decode(&bytes)?;
    let end = usize::try_from(len)
        .ok()
        .and_then(|len| used.checked_add(len))
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| LaserError::Codec(format!("protostone stream of {} bytes runs past its chunks", len)))?;
    if bytes[end..].iter().any(|b| *b != 0) {
        return Err(LaserError::Codec("protostone chunk padding is not zero".to_string()));
    }
    Ok(bytes[used..end].to_vec())
}

fn decode_edicts(integers: &[u128]) -> Result<Vec<ProtoEdict>> {
    if integers.len() % 4 != 0 {
        return Err(LaserError::Codec(format!(
            "edict body of {} integers is not a whole number of edicts",
            integers.len()
        )));
    }
    let mut previous = AlkaneId::new(0, 0);
    let mut edicts = Vec::with_capacity(integers.len() / 4);
    for group in integers.chunks(4) {
        let block = previous
            .block
            .checked_add(group[0])
            .ok_or_else(|| LaserError::Codec("edict block overflow".to_string()))?;
        let tx = if group[0] == 0 {
            previous
                .tx
                .checked_add(group[1])
                .ok_or_else(|| LaserError::Codec("edict tx overflow".to_string()))?
        } else {
            group[1]
        };
        let id = AlkaneId::new(block, tx);
        edicts.push(ProtoEdict {
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
