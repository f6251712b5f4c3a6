//! Shared test doubles: an in-memory chain and a software wallet
//!
//! `MockChain` answers data-source calls from maps and records broadcasts.
//! `MockWallet` holds two fixed keys (segwit or wrapped-segwit payment,
//! taproot ordinals) and really signs the PSBTs it is handed, so the client's
//! finalize and extract path runs against genuine signatures.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{Keypair, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::TapLeafHash;
use bitcoin::{Address, CompressedPublicKey, Psbt, Transaction, TxOut, Txid};

use lasertx::datasource::{Capability, DataSource, RecommendedFees};
use lasertx::provider::{SignPsbtRequest, SignPsbtResponse, WalletAccounts, WalletProvider};
use lasertx::psbt::{decode_psbt, psbt_to_hex};
use lasertx::{Account, ClientConfig, DataSourceManager, LaserError, Network, Result, Utxo};

/// Fee rate the mock chain recommends, sat/vB
pub const FAST_RATE: f64 = 3.0;

/// Install the test logger once
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Keys and accounts
// ============================================================================

fn secret(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).unwrap()
}

pub fn taproot_account(byte: u8) -> Account {
    let secp = Secp256k1::new();
    let key = secret(byte).public_key(&secp);
    let (xonly, _) = key.x_only_public_key();
    let address = Address::p2tr(&secp, xonly, None, bitcoin::Network::Bitcoin);
    Account::new(&address.to_string(), &key.to_string())
}

pub fn segwit_account(byte: u8) -> Account {
    let secp = Secp256k1::new();
    let key = CompressedPublicKey(secret(byte).public_key(&secp));
    let address = Address::p2wpkh(&key, bitcoin::Network::Bitcoin);
    Account::new(&address.to_string(), &key.to_string())
}

/// P2SH-P2WPKH account; its inputs carry a `scriptSig` once finalized
pub fn wrapped_segwit_account(byte: u8) -> Account {
    let secp = Secp256k1::new();
    let key = CompressedPublicKey(secret(byte).public_key(&secp));
    let address = Address::p2shwpkh(&key, bitcoin::Network::Bitcoin);
    Account::new(&address.to_string(), &key.to_string())
}

pub fn txid(n: u8) -> Txid {
    Txid::from_byte_array([n; 32])
}

pub fn utxo(account: &Account, n: u8, value: u64) -> Utxo {
    let script = lasertx::address::script_pubkey(&account.address, Network::Mainnet).unwrap();
    Utxo::new(txid(n), 0, value, script)
}

// ============================================================================
// MockChain
// ============================================================================

pub struct MockChain {
    name: String,
    capabilities: Vec<Capability>,
    failing: bool,
    calls: AtomicUsize,
    pub utxos: Mutex<HashMap<String, Vec<Utxo>>>,
    pub rune_outpoints: Mutex<HashMap<String, Vec<Utxo>>>,
    pub broadcasts: Mutex<Vec<Transaction>>,
}

impl MockChain {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capabilities: vec![
                Capability::BtcBalance,
                Capability::Utxos,
                Capability::RuneOutpoints,
                Capability::RecommendedFees,
                Capability::Broadcast,
                Capability::WaitForTransaction,
            ],
            failing: false,
            calls: AtomicUsize::new(0),
            utxos: Mutex::new(HashMap::new()),
            rune_outpoints: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    /// A source whose every call fails with a transport error
    pub fn failing(name: &str) -> Self {
        Self {
            failing: true,
            ..Self::new(name)
        }
    }

    pub fn fund(&self, address: &str, utxos: Vec<Utxo>) {
        self.utxos.lock().unwrap().insert(address.to_string(), utxos);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.broadcasts.lock().unwrap().clone()
    }

    fn touch(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(LaserError::Http(format!("{} is down", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl DataSource for MockChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn set_network(&self, _network: Network, _custom_id: Option<&str>) {}

    async fn get_btc_balance(&self, address: &str) -> Result<u64> {
        self.touch()?;
        let utxos = self.utxos.lock().unwrap();
        Ok(utxos.get(address).map(|u| u.iter().map(|u| u.value).sum()).unwrap_or(0))
    }

    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>> {
        self.touch()?;
        Ok(self.utxos.lock().unwrap().get(address).cloned().unwrap_or_default())
    }

    async fn get_rune_outpoints(&self, address: &str) -> Result<Vec<Utxo>> {
        self.touch()?;
        Ok(self
            .rune_outpoints
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_recommended_fees(&self) -> Result<RecommendedFees> {
        self.touch()?;
        Ok(RecommendedFees {
            fast: FAST_RATE,
            min: 1.0,
        })
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String> {
        self.touch()?;
        let bytes = hex::decode(tx_hex)?;
        let tx: Transaction = bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| LaserError::InvalidTransactionFormat(e.to_string()))?;
        let txid = tx.compute_txid().to_string();
        self.broadcasts.lock().unwrap().push(tx);
        Ok(txid)
    }

    async fn wait_for_transaction(&self, txid: &str) -> Result<bool> {
        self.touch()?;
        let broadcasts = self.broadcasts.lock().unwrap();
        Ok(broadcasts.iter().any(|tx| tx.compute_txid().to_string() == txid))
    }
}

/// Manager over `sources`, registered in order
pub fn manager(sources: Vec<Arc<MockChain>>) -> Arc<DataSourceManager> {
    let manager = DataSourceManager::empty(&ClientConfig::default());
    for source in sources {
        manager.register_data_source(source);
    }
    Arc::new(manager)
}

// ============================================================================
// MockWallet
// ============================================================================

pub struct MockWallet {
    name: String,
    payment_secret: SecretKey,
    ordinals_secret: SecretKey,
    network: Mutex<Network>,
    can_switch: bool,
    native_send: bool,
    reject: bool,
    wrapped_payment: bool,
    pub connects: AtomicUsize,
    pub sign_requests: Mutex<Vec<SignPsbtRequest>>,
}

impl MockWallet {
    /// Wallet with payment key 2 and ordinals key 1, on mainnet
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            payment_secret: secret(2),
            ordinals_secret: secret(1),
            network: Mutex::new(Network::Mainnet),
            can_switch: true,
            native_send: false,
            reject: false,
            wrapped_payment: false,
            connects: AtomicUsize::new(0),
            sign_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn without_network_switch(mut self) -> Self {
        self.can_switch = false;
        self
    }

    pub fn with_native_send(mut self) -> Self {
        self.native_send = true;
        self
    }

    pub fn rejecting(mut self) -> Self {
        self.reject = true;
        self
    }

    /// Pay from the P2SH-wrapped form of the same payment key
    pub fn with_wrapped_payment(mut self) -> Self {
        self.wrapped_payment = true;
        self
    }

    pub fn payment(&self) -> Account {
        if self.wrapped_payment {
            wrapped_segwit_account(2)
        } else {
            segwit_account(2)
        }
    }

    pub fn ordinals(&self) -> Account {
        taproot_account(1)
    }

    /// Sign every input paying to one of the wallet's two scripts
    fn sign(&self, psbt: &mut Psbt) {
        let secp = Secp256k1::new();
        let payment_script = lasertx::address::script_pubkey(&self.payment().address, Network::Mainnet).unwrap();
        let ordinals_script = lasertx::address::script_pubkey(&self.ordinals().address, Network::Mainnet).unwrap();
        let payment_key = bitcoin::PublicKey::new(self.payment_secret.public_key(&secp));
        let ordinals_keypair = Keypair::from_secret_key(&secp, &self.ordinals_secret);
        let (ordinals_xonly, _) = ordinals_keypair.x_only_public_key();

        let prevouts: Vec<TxOut> = psbt
            .inputs
            .iter()
            .map(|i| i.witness_utxo.clone().expect("mock wallet signs witness inputs only"))
            .collect();
        let tx = psbt.unsigned_tx.clone();
        let mut cache = SighashCache::new(&tx);

        for (index, input) in psbt.inputs.iter_mut().enumerate() {
            let spent = &prevouts[index];
            if let Some((_, (script, version))) = input.tap_scripts.iter().next() {
                let leaf_hash = TapLeafHash::from_script(script, *version);
                let sighash = cache
                    .taproot_script_spend_signature_hash(
                        index,
                        &Prevouts::All(&prevouts),
                        leaf_hash,
                        TapSighashType::Default,
                    )
                    .unwrap();
                let msg = Message::from_digest(sighash.to_byte_array());
                let signature = secp.sign_schnorr_no_aux_rand(&msg, &ordinals_keypair);
                input.tap_script_sigs.insert(
                    (ordinals_xonly, leaf_hash),
                    bitcoin::taproot::Signature {
                        signature,
                        sighash_type: TapSighashType::Default,
                    },
                );
            } else if spent.script_pubkey == ordinals_script {
                let sighash = cache
                    .taproot_key_spend_signature_hash(index, &Prevouts::All(&prevouts), TapSighashType::Default)
                    .unwrap();
                let msg = Message::from_digest(sighash.to_byte_array());
                let tweaked = ordinals_keypair.tap_tweak(&secp, None).to_inner();
                let signature = secp.sign_schnorr_no_aux_rand(&msg, &tweaked);
                input.tap_key_sig = Some(bitcoin::taproot::Signature {
                    signature,
                    sighash_type: TapSighashType::Default,
                });
            } else if spent.script_pubkey == payment_script {
                // Wrapped inputs sign over the inner witness program
                let program = input.redeem_script.clone().unwrap_or_else(|| spent.script_pubkey.clone());
                let sighash = cache
                    .p2wpkh_signature_hash(index, &program, spent.value, EcdsaSighashType::All)
                    .unwrap();
                let msg = Message::from_digest(sighash.to_byte_array());
                let signature = secp.sign_ecdsa(&msg, &self.payment_secret);
                input
                    .partial_sigs
                    .insert(payment_key, bitcoin::ecdsa::Signature::sighash_all(signature));
            }
        }
    }
}

#[async_trait]
impl WalletProvider for MockWallet {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self, _network: Network) -> Result<WalletAccounts> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        if self.reject {
            return Err(LaserError::UserRejected);
        }
        Ok(WalletAccounts {
            ordinals: self.ordinals(),
            payment: self.payment(),
            accounts: vec![self.ordinals().address, self.payment().address],
        })
    }

    async fn get_network(&self) -> Result<Network> {
        Ok(*self.network.lock().unwrap())
    }

    async fn switch_network(&self, network: Network) -> Result<()> {
        if !self.can_switch {
            return Err(LaserError::UnsupportedByProvider {
                provider: self.name.clone(),
                method: "switch_network".to_string(),
            });
        }
        *self.network.lock().unwrap() = network;
        Ok(())
    }

    async fn send_bitcoin(&self, _to: &str, _amount: u64) -> Result<String> {
        if !self.native_send {
            return Err(LaserError::UnsupportedByProvider {
                provider: self.name.clone(),
                method: "send_bitcoin".to_string(),
            });
        }
        Ok(txid(0xaa).to_string())
    }

    async fn sign_psbt(&self, request: &SignPsbtRequest) -> Result<SignPsbtResponse> {
        self.sign_requests.lock().unwrap().push(request.clone());
        if self.reject {
            return Err(LaserError::UserRejected);
        }
        let mut psbt = decode_psbt(&request.psbt_base64)?;
        self.sign(&mut psbt);
        Ok(SignPsbtResponse {
            signed_psbt_hex: Some(psbt_to_hex(&psbt)),
            signed_psbt_base64: None,
            txid: None,
        })
    }
}
