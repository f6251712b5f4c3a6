//! LaserTx: Bitcoin transaction construction for meta-protocols
//!
//! This crate builds unsigned PSBTs for plain BTC payments and for the
//! Runes, BRC-20, Alkanes and ordinals inscription protocols, hands them to
//! a wallet provider for signing, and broadcasts the result. Chain data comes
//! from several indexer backends behind one fallback layer.
//!
//! # Architecture
//!
//! - **Data sources**: Mempool, Sandshrew and Maestro clients behind the
//!   [`DataSource`] trait, with [`DataSourceManager`] routing each call by
//!   capability and falling back in registration order
//! - **Codecs**: Runestone, Protostone, inscription envelope and BRC-20
//!   payload encoders
//! - **Builders**: one module per protocol; each keeps the asset leg and the
//!   fee leg on disjoint UTXOs and never reuses an outpoint
//! - **Session**: the connected wallet's accounts and network, with
//!   coalesced connects and safe network switching
//! - **Client**: [`LaserClient`] ties the above into build, sign, finalize
//!   and broadcast
//!
//! # Example
//!
//! ```ignore
//! use lasertx::{ClientConfig, LaserClient, SendRequest};
//! use lasertx::builder::btc::BtcSend;
//!
//! let client = LaserClient::new(ClientConfig::from_env()?)?;
//! client.register_provider(my_wallet);
//! client.connect("my-wallet").await?;
//!
//! let txid = client
//!     .send(
//!         &SendRequest::Btc(BtcSend { recipient: "bc1q...".into(), amount: 10_000 }),
//!         None,
//!     )
//!     .await?;
//! ```

// Public modules
pub mod address;
pub mod builder;
pub mod client;
pub mod codec;
pub mod coin_select;
pub mod config;
pub mod datasource;
pub mod error;
pub mod network;
pub mod provider;
pub mod psbt;
pub mod session;
pub mod utxo;

// Re-exports for convenience
pub use address::{classify_address, AddressType};
pub use builder::{Account, AssetOrder, BuildContext, BuiltTransaction, InputToSign};
pub use client::{InscribeResult, LaserClient, MintRequest, Protocol, SendRequest};
pub use config::ClientConfig;
pub use datasource::manager::DataSourceManager;
pub use datasource::{Capability, DataSource};
pub use error::{LaserError, Result};
pub use network::Network;
pub use provider::{ProviderRegistry, WalletAccounts, WalletProvider};
pub use psbt::{decode_psbt, extract_transaction_hex, finalize_psbt, UnsignedTransaction};
pub use session::{ConnectionState, Session, WalletSession};
pub use utxo::{AlkaneId, AssetBalance, AssetId, RuneId, RuneRef, Utxo, DUST_VALUE};
