//! Ordinal inscription envelopes and their taproot commitment
//!
//! The envelope sits in a tapscript leaf that also checks a signature from the
//! inscriber's key:
//!
//! ```text
//! <xonly key> OP_CHECKSIG OP_FALSE OP_IF "ord" 01 <content type> OP_0 <body...> OP_ENDIF
//! ```

use bitcoin::opcodes::all::{OP_CHECKSIG, OP_ENDIF, OP_IF};
use bitcoin::opcodes::OP_FALSE;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::secp256k1::{Secp256k1, XOnlyPublicKey};
use bitcoin::taproot::{ControlBlock, LeafVersion, TaprootBuilder, TaprootSpendInfo};
use bitcoin::{Address, Script, ScriptBuf};

use crate::error::{LaserError, Result};
use crate::network::Network;

/// Largest body accepted for a single inscription
pub const MAX_CONTENT_SIZE: usize = 390_000;

const PROTOCOL_MARKER: &[u8] = b"ord";
const CONTENT_TYPE_TAG: u8 = 1;
const MAX_PUSH: usize = 520;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inscription {
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Inscription {
    pub fn new(content_type: &str, body: Vec<u8>) -> Self {
        Self {
            content_type: content_type.to_string(),
            body,
        }
    }

    /// Tapscript leaf holding this inscription, spendable by `key`
    pub fn reveal_script(&self, key: &XOnlyPublicKey) -> Result<ScriptBuf> {
        if self.body.len() > MAX_CONTENT_SIZE {
            return Err(LaserError::Codec(format!(
                "inscription body of {} bytes exceeds {}",
                self.body.len(),
                MAX_CONTENT_SIZE
            )));
        }

        let mut builder = Builder::new()
            .push_x_only_key(key)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_FALSE)
            .push_opcode(OP_IF)
            .push_slice(push_bytes(PROTOCOL_MARKER)?)
            .push_slice(push_bytes(&[CONTENT_TYPE_TAG])?)
            .push_slice(push_bytes(self.content_type.as_bytes())?)
            .push_opcode(OP_FALSE);
        for chunk in self.body.chunks(MAX_PUSH) {
            builder = builder.push_slice(push_bytes(chunk)?);
        }
        Ok(builder.push_opcode(OP_ENDIF).into_script())
    }

    /// Recover the signing key and inscription from a reveal leaf
    pub fn from_reveal_script(script: &Script) -> Result<(XOnlyPublicKey, Inscription)> {
        let mut pushes = Vec::new();
        let mut ops = Vec::new();
        for instruction in script.instructions() {
            match instruction.map_err(|e| LaserError::Codec(format!("envelope: {}", e)))? {
                Instruction::PushBytes(bytes) => pushes.push(bytes.as_bytes().to_vec()),
                Instruction::Op(op) => ops.push((pushes.len(), op)),
            }
        }

        // CHECKSIG after the key, IF after OP_FALSE, ENDIF after the last push
        let malformed = || LaserError::Codec("script is not an inscription envelope".to_string());
        if ops.len() != 3
            || ops[0] != (1, OP_CHECKSIG)
            || ops[1] != (2, OP_IF)
            || ops[2] != (pushes.len(), OP_ENDIF)
        {
            return Err(malformed());
        }

        let key = XOnlyPublicKey::from_slice(&pushes[0]).map_err(|_| malformed())?;
        match &pushes[1..] {
            [zero, marker, tag, content_type, separator, body @ ..]
                if zero.is_empty()
                    && marker.as_slice() == PROTOCOL_MARKER
                    && tag.as_slice() == [CONTENT_TYPE_TAG].as_slice()
                    && separator.is_empty() =>
            {
                let content_type = String::from_utf8(content_type.to_vec())
                    .map_err(|e| LaserError::Codec(format!("content type: {}", e)))?;
                let body = body.iter().flat_map(|chunk| chunk.iter().copied()).collect();
                Ok((key, Inscription { content_type, body }))
            }
            _ => Err(malformed()),
        }
    }
}

fn push_bytes(bytes: &[u8]) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(bytes.to_vec())
        .map_err(|e| LaserError::Codec(format!("push too large: {}", e)))
}

/// Taproot commitment to a single reveal leaf
#[derive(Clone, Debug)]
pub struct InscriptionCommitment {
    pub internal_key: XOnlyPublicKey,
    pub reveal_script: ScriptBuf,
    pub spend_info: TaprootSpendInfo,
    pub address: Address,
}

impl InscriptionCommitment {
    /// Commit `inscription` under `key`, which is both internal key and leaf signer
    pub fn new(inscription: &Inscription, key: XOnlyPublicKey, network: Network) -> Result<Self> {
        let secp = Secp256k1::verification_only();
        let reveal_script = inscription.reveal_script(&key)?;
        let spend_info = TaprootBuilder::new()
            .add_leaf(0, reveal_script.clone())
            .map_err(|e| LaserError::Codec(format!("taproot leaf: {}", e)))?
            .finalize(&secp, key)
            .map_err(|_| LaserError::Codec("taproot tree is incomplete".to_string()))?;
        let address = Address::p2tr(&secp, key, spend_info.merkle_root(), network.bitcoin_network());
        Ok(Self {
            internal_key: key,
            reveal_script,
            spend_info,
            address,
        })
    }

    pub fn control_block(&self) -> Result<ControlBlock> {
        self.spend_info
            .control_block(&(self.reveal_script.clone(), LeafVersion::TapScript))
            .ok_or_else(|| LaserError::Codec("reveal leaf missing from tree".to_string()))
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn key() -> XOnlyPublicKey {
        XOnlyPublicKey::from_str("79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
            .unwrap()
    }

    #[test]
    fn test_envelope_round_trip() {
        let inscription = Inscription::new("text/plain;charset=utf-8", b"hello".to_vec());
        let script = inscription.reveal_script(&key()).unwrap();
        let (parsed_key, parsed) = Inscription::from_reveal_script(&script).unwrap();
        assert_eq!(parsed_key, key());
        assert_eq!(parsed, inscription);
    }

    #[test]
    fn test_large_body_is_chunked() {
        let inscription = Inscription::new("application/octet-stream", vec![7u8; 2_000]);
        let script = inscription.reveal_script(&key()).unwrap();
        let (_, parsed) = Inscription::from_reveal_script(&script).unwrap();
        assert_eq!(parsed.body.len(), 2_000);
    }

    #[test]
    fn test_empty_body_round_trip() {
        let inscription = Inscription::new("text/plain", Vec::new());
        let script = inscription.reveal_script(&key()).unwrap();
        assert_eq!(Inscription::from_reveal_script(&script).unwrap().1, inscription);
    }

    #[test]
    fn test_oversized_body_rejected() {
        let inscription = Inscription::new("text/plain", vec![0u8; MAX_CONTENT_SIZE + 1]);
        assert!(inscription.reveal_script(&key()).is_err());
    }

    #[test]
    fn test_commitment_is_taproot_with_control_block() {
        let inscription = Inscription::new("text/plain", b"x".to_vec());
        let commitment = InscriptionCommitment::new(&inscription, key(), Network::Mainnet).unwrap();
        assert!(commitment.script_pubkey().is_p2tr());
        assert!(commitment.address.to_string().starts_with("bc1p"));
        let control = commitment.control_block().unwrap();
        assert_eq!(control.internal_key, key());
    }

    #[test]
    fn test_non_envelope_rejected() {
        let script = ScriptBuf::from_hex("0014751e76e8199196d454941c45d1b3a323f1433bd6").unwrap();
        assert!(Inscription::from_reveal_script(&script).is_err());
    }
}
