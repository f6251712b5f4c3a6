//! Address classification and input-script helpers
//!
//! The classifier is total: every string maps to exactly one [`AddressType`].
//! Builders treat [`AddressType::Unknown`] as a hard error.

use std::fmt;
use std::str::FromStr;

use bitcoin::bech32::segwit;
use bitcoin::bech32::Fe32;
use bitcoin::script::Instruction;
use bitcoin::secp256k1::XOnlyPublicKey;
use bitcoin::{Address, CompressedPublicKey, PublicKey, Script, ScriptBuf};

use crate::error::{LaserError, Result};
use crate::network::Network;

/// Output-script family of an address
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressType {
    P2pkh,
    P2shP2wpkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
    Unknown,
}

impl AddressType {
    pub fn is_taproot(&self) -> bool {
        matches!(self, AddressType::P2tr)
    }

    pub fn is_segwit(&self) -> bool {
        matches!(
            self,
            AddressType::P2wpkh | AddressType::P2wsh | AddressType::P2tr | AddressType::P2shP2wpkh
        )
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AddressType::P2pkh => "p2pkh",
            AddressType::P2shP2wpkh => "p2sh-p2wpkh",
            AddressType::P2sh => "p2sh",
            AddressType::P2wpkh => "p2wpkh",
            AddressType::P2wsh => "p2wsh",
            AddressType::P2tr => "p2tr",
            AddressType::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Classify `address` by structure for `network`
///
/// Base58check is tried first and matched against the network's version
/// bytes. Otherwise the string is decoded as bech32/bech32m and classified by
/// witness version and program length.
pub fn classify_address(address: &str, network: Network) -> AddressType {
    if let Ok(payload) = bitcoin::base58::decode_check(address) {
        if payload.len() != 21 {
            return AddressType::Unknown;
        }
        let (version, hash) = (payload[0], &payload[1..]);
        if version == network.pubkey_hash_version() {
            return AddressType::P2pkh;
        }
        if version == network.script_hash_version() {
            return if is_wrapped_segwit_program(hash) {
                AddressType::P2shP2wpkh
            } else {
                AddressType::P2sh
            };
        }
        return AddressType::Unknown;
    }

    match segwit::decode(address) {
        Ok((_hrp, version, program)) => match (version, program.len()) {
            (v, 20) if v == Fe32::Q => AddressType::P2wpkh,
            (v, 32) if v == Fe32::Q => AddressType::P2wsh,
            (v, 32) if v == Fe32::P => AddressType::P2tr,
            _ => AddressType::Unknown,
        },
        Err(_) => AddressType::Unknown,
    }
}

/// `OP_0 <20-byte push>`, the redeem script of a wrapped P2WPKH
fn is_wrapped_segwit_program(bytes: &[u8]) -> bool {
    let mut instructions = Script::from_bytes(bytes).instructions();
    match (instructions.next(), instructions.next(), instructions.next()) {
        (Some(Ok(Instruction::PushBytes(version))), Some(Ok(Instruction::PushBytes(program))), None) => {
            version.is_empty() && program.len() == 20
        }
        _ => false,
    }
}

/// Parse and network-check an address
pub fn parse_address(address: &str, network: Network) -> Result<Address> {
    let unchecked = Address::from_str(address)
        .map_err(|e| LaserError::InvalidAddress(format!("{}: {}", address, e)))?;
    unchecked
        .require_network(network.bitcoin_network())
        .map_err(|e| LaserError::InvalidAddress(format!("{}: {}", address, e)))
}

/// Output script for an address on `network`
pub fn script_pubkey(address: &str, network: Network) -> Result<ScriptBuf> {
    Ok(parse_address(address, network)?.script_pubkey())
}

/// Classify and reject [`AddressType::Unknown`]
pub fn require_known(address: &str, network: Network) -> Result<AddressType> {
    match classify_address(address, network) {
        AddressType::Unknown => Err(LaserError::InvalidAddress(format!(
            "{} is not a recognised {} address",
            address, network
        ))),
        known => Ok(known),
    }
}

/// Decode a hex public key as given by wallets (33-byte compressed or 32-byte x-only)
pub fn x_only_key(public_key_hex: &str) -> Result<XOnlyPublicKey> {
    let bytes = hex::decode(public_key_hex)?;
    match bytes.len() {
        32 => XOnlyPublicKey::from_slice(&bytes)
            .map_err(|e| LaserError::Parse(format!("x-only key: {}", e))),
        33 | 65 => {
            let key = PublicKey::from_slice(&bytes)
                .map_err(|e| LaserError::Parse(format!("public key: {}", e)))?;
            Ok(key.inner.x_only_public_key().0)
        }
        n => Err(LaserError::Parse(format!("public key has {} bytes", n))),
    }
}

/// Classify an address the caller owns, resolving P2SH with its public key
///
/// A base58 P2SH address carries only the script hash, so the structural
/// check in [`classify_address`] cannot see the redeem script. When
/// `public_key` wraps to exactly this address it is wrapped segwit.
pub fn classify_owned(address: &str, public_key: &str, network: Network) -> AddressType {
    let kind = classify_address(address, network);
    if kind != AddressType::P2sh || public_key.is_empty() {
        return kind;
    }
    let wraps_key = match (wrapped_segwit_redeem_script(public_key), script_pubkey(address, network)) {
        (Ok(redeem), Ok(spk)) => ScriptBuf::new_p2sh(&redeem.script_hash()) == spk,
        _ => false,
    };
    if wraps_key {
        AddressType::P2shP2wpkh
    } else {
        kind
    }
}

/// Compressed key from hex, required for segwit v0 spends
pub fn compressed_key(public_key_hex: &str) -> Result<CompressedPublicKey> {
    let bytes = hex::decode(public_key_hex)?;
    CompressedPublicKey::from_slice(&bytes)
        .map_err(|e| LaserError::Parse(format!("compressed public key: {}", e)))
}

/// Redeem script `OP_0 <hash160(pubkey)>` for a wrapped P2WPKH output
pub fn wrapped_segwit_redeem_script(public_key_hex: &str) -> Result<ScriptBuf> {
    let key = compressed_key(public_key_hex)?;
    Ok(ScriptBuf::new_p2wpkh(&key.wpubkey_hash()))
}
