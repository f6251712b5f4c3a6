//! Orchestration: build, sign, finalize, broadcast
//!
//! [`LaserClient`] owns the data sources, the provider registry and the
//! session. Every send goes through the same path: build an unsigned PSBT
//! against the session's accounts, hand it to the connected provider, finalize
//! whatever came back, then broadcast through the data sources unless the
//! provider already did.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitcoin::Txid;
use serde::{Deserialize, Serialize};

use crate::builder::alkanes::{self, AlkaneMint, AlkaneSend};
use crate::builder::brc20::{self, Brc20Transfer};
use crate::builder::btc::{self, BtcSend};
use crate::builder::inscriptions::{self, InscribeRequest, InscriptionSend, REVEAL_VOUT};
use crate::builder::runes::{self, RuneMint, RuneSend};
use crate::builder::{require_amount, BuildContext, BuiltTransaction};
use crate::config::ClientConfig;
use crate::datasource::manager::DataSourceManager;
use crate::datasource::{DataSource, InscriptionRecord};
use crate::error::{LaserError, Result};
use crate::network::Network;
use crate::provider::{ProviderRegistry, SignMessageOptions, SignPsbtRequest, SignPsbtResponse, WalletProvider};
use crate::psbt::{decode_psbt, extract_transaction_hex, finalize_psbt, psbt_to_base64, psbt_to_hex};
use crate::session::{Session, WalletSession};
use crate::utxo::{parse_decimal_amount, AlkaneId, AssetBalance, AssetId};

/// BRC-20 balances are reported with up to this many fractional digits
const BRC20_DECIMALS: u8 = 18;

/// Alkane balances are displayed with this divisibility
const ALKANE_DECIMALS: u8 = 8;

/// The transfer protocols the client speaks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Btc,
    Runes,
    Brc20,
    Alkanes,
}

/// A transfer, tagged by protocol
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum SendRequest {
    Btc(BtcSend),
    Runes(RuneSend),
    Brc20(Brc20Transfer),
    Alkanes(AlkaneSend),
}

impl SendRequest {
    pub fn protocol(&self) -> Protocol {
        match self {
            SendRequest::Btc(_) => Protocol::Btc,
            SendRequest::Runes(_) => Protocol::Runes,
            SendRequest::Brc20(_) => Protocol::Brc20,
            SendRequest::Alkanes(_) => Protocol::Alkanes,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum MintRequest {
    Runes(RuneMint),
    Alkanes(AlkaneMint),
}

/// Txids of a finished inscription
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InscribeResult {
    pub commit_txid: String,
    pub reveal_txid: String,
    pub inscription_id: String,
}

pub struct LaserClient {
    config: ClientConfig,
    data_sources: Arc<DataSourceManager>,
    providers: Arc<ProviderRegistry>,
    session: WalletSession,
}

impl LaserClient {
    /// Client with the built-in data sources `config` enables
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let data_sources = Arc::new(DataSourceManager::new(&config));
        Ok(Self::with_data_sources(config, data_sources))
    }

    /// Client over an existing data-source manager
    pub fn with_data_sources(config: ClientConfig, data_sources: Arc<DataSourceManager>) -> Self {
        let providers = Arc::new(ProviderRegistry::new());
        let session = WalletSession::new(providers.clone(), data_sources.clone(), config.network);
        Self {
            config,
            data_sources,
            providers,
            session,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn data_sources(&self) -> &DataSourceManager {
        &self.data_sources
    }

    pub fn session(&self) -> &WalletSession {
        &self.session
    }

    pub fn register_provider(&self, provider: Arc<dyn WalletProvider>) {
        self.providers.register(provider);
    }

    pub fn register_data_source(&self, source: Arc<dyn DataSource>) {
        self.data_sources.register_data_source(source);
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub async fn connect(&self, provider: &str) -> Result<Session> {
        self.session.connect(provider).await
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await
    }

    pub async fn switch_network(&self, network: Network) -> Result<Session> {
        self.session.switch_network(network).await
    }

    /// Target a configured custom network; data sources use its base network's endpoints
    pub async fn use_custom_network(&self, id: &str) -> Result<Session> {
        let base = self
            .config
            .custom_network(id)
            .ok_or_else(|| LaserError::UnsupportedNetwork(id.to_string()))?
            .base_network;
        let session = self.session.switch_network(base).await?;
        self.data_sources.use_custom_network(id)?;
        Ok(session)
    }

    fn connected(&self) -> Result<Session> {
        let session = self.session.snapshot();
        if !session.is_connected() {
            return Err(LaserError::NotConnected);
        }
        Ok(session)
    }

    fn context(&self, session: &Session, fee_rate: Option<f64>) -> BuildContext<'_> {
        let ctx = BuildContext::new(&self.data_sources, session.network, session.payment(), session.ordinals());
        match fee_rate {
            Some(rate) => ctx.with_fee_rate(rate),
            None => ctx,
        }
    }

    /// Sign `built` with the connected provider and broadcast it
    async fn sign_and_broadcast(&self, built: &BuiltTransaction) -> Result<String> {
        let provider = self.session.provider()?;
        let request = SignPsbtRequest {
            psbt_hex: built.to_hex(),
            psbt_base64: built.to_base64(),
            finalize: true,
            broadcast: false,
            inputs_to_sign: built.inputs_to_sign.clone(),
        };
        let response = provider.sign_psbt(&request).await?;
        if let Some(txid) = &response.txid {
            log::info!("{} broadcast {}", provider.name(), txid);
            return Ok(txid.clone());
        }

        let signed = response.signed_psbt().ok_or_else(|| {
            LaserError::InvalidTransactionFormat(format!("{} returned no signed PSBT", provider.name()))
        })?;
        let raw = extract_transaction_hex(decode_psbt(signed)?)?;
        self.data_sources.broadcast(&raw).await
    }

    async fn await_transaction(&self, txid: &str) -> Result<()> {
        if self.data_sources.wait_for_transaction(txid).await? {
            Ok(())
        } else {
            Err(LaserError::Timeout(format!("{} did not appear", txid)))
        }
    }

    /// Send BTC, runes, BRC-20 or alkanes; returns the final txid
    pub async fn send(&self, request: &SendRequest, fee_rate: Option<f64>) -> Result<String> {
        let session = self.connected()?;
        let ctx = self.context(&session, fee_rate);

        match request {
            SendRequest::Btc(send) => {
                require_amount(send.amount as u128, "amount")?;
                ctx.recipient_script(&send.recipient)?;
                if fee_rate.is_none() {
                    let provider = self.session.provider()?;
                    match provider.send_bitcoin(&send.recipient, send.amount).await {
                        Ok(txid) => return Ok(txid),
                        Err(LaserError::UnsupportedByProvider { .. }) => {
                            log::debug!("{} has no native send; building locally", provider.name())
                        }
                        Err(e) => return Err(e),
                    }
                }
                let built = btc::build_send(&ctx, send).await?;
                self.sign_and_broadcast(&built).await
            }
            SendRequest::Runes(send) => {
                let built = runes::build_send(&ctx, send).await?;
                self.sign_and_broadcast(&built).await
            }
            SendRequest::Alkanes(send) => {
                let built = alkanes::build_send(&ctx, send).await?;
                self.sign_and_broadcast(&built).await
            }
            SendRequest::Brc20(transfer) => {
                let commit = brc20::build_commit(&ctx, transfer).await?;
                let (_, reveal_txid) = self.commit_and_reveal(&ctx, &commit).await?;
                let delivery = brc20::build_delivery(&ctx, transfer, parse_txid(&reveal_txid)?).await?;
                self.sign_and_broadcast(&delivery).await
            }
        }
    }

    /// Broadcast the commit, wait for it, then reveal; returns both txids
    ///
    /// The reveal spends the commit as broadcast. A legacy or wrapped-segwit
    /// payer adds a `scriptSig` at finalization, so the unsigned txid is not
    /// the one that lands on chain.
    async fn commit_and_reveal(
        &self,
        ctx: &BuildContext<'_>,
        commit: &inscriptions::CommitTransaction,
    ) -> Result<(Txid, String)> {
        let commit_txid = self.sign_and_broadcast(&commit.commit).await?;
        self.await_transaction(&commit_txid).await?;
        let commit_txid = parse_txid(&commit_txid)?;

        let reveal = inscriptions::build_reveal(ctx, &commit.plan, commit_txid)?;
        let reveal_txid = self.sign_and_broadcast(&reveal).await?;
        self.await_transaction(&reveal_txid).await?;
        Ok((commit_txid, reveal_txid))
    }

    pub async fn mint(&self, request: &MintRequest, fee_rate: Option<f64>) -> Result<String> {
        let session = self.connected()?;
        let ctx = self.context(&session, fee_rate);
        let built = match request {
            MintRequest::Runes(mint) => runes::build_mint(&ctx, mint).await?,
            MintRequest::Alkanes(mint) => alkanes::build_mint(&ctx, mint).await?,
        };
        self.sign_and_broadcast(&built).await
    }

    pub async fn inscribe(&self, request: &InscribeRequest, fee_rate: Option<f64>) -> Result<InscribeResult> {
        let session = self.connected()?;
        let ctx = self.context(&session, fee_rate);
        let commit = inscriptions::build_inscribe(&ctx, request).await?;
        let (commit_txid, reveal_txid) = self.commit_and_reveal(&ctx, &commit).await?;
        Ok(InscribeResult {
            commit_txid: commit_txid.to_string(),
            inscription_id: format!("{}i{}", reveal_txid, REVEAL_VOUT),
            reveal_txid,
        })
    }

    pub async fn send_inscriptions(&self, request: &InscriptionSend, fee_rate: Option<f64>) -> Result<String> {
        let session = self.connected()?;
        let ctx = self.context(&session, fee_rate);
        let built = inscriptions::build_send(&ctx, request).await?;
        self.sign_and_broadcast(&built).await
    }

    /// Sign an externally built PSBT given as hex or base64
    ///
    /// With `finalize` the inputs are finalized locally if the provider left
    /// them partial; with `broadcast` the result is also extracted and
    /// broadcast.
    pub async fn sign_psbt(&self, psbt: &str, finalize: bool, broadcast: bool) -> Result<SignPsbtResponse> {
        let parsed = decode_psbt(psbt)?;
        let provider = self.session.provider()?;
        let request = SignPsbtRequest {
            psbt_hex: psbt_to_hex(&parsed),
            psbt_base64: psbt_to_base64(&parsed),
            finalize,
            broadcast,
            inputs_to_sign: Vec::new(),
        };
        let response = provider.sign_psbt(&request).await?;
        if response.txid.is_some() {
            return Ok(response);
        }

        let signed = response.signed_psbt().ok_or_else(|| {
            LaserError::InvalidTransactionFormat(format!("{} returned no signed PSBT", provider.name()))
        })?;
        let mut signed = decode_psbt(signed)?;
        if finalize || broadcast {
            finalize_psbt(&mut signed)?;
        }
        let txid = if broadcast {
            Some(self.data_sources.broadcast(&extract_transaction_hex(signed.clone())?).await?)
        } else {
            None
        };
        Ok(SignPsbtResponse {
            signed_psbt_hex: Some(psbt_to_hex(&signed)),
            signed_psbt_base64: Some(psbt_to_base64(&signed)),
            txid,
        })
    }

    pub async fn sign_message(&self, message: &str, options: SignMessageOptions) -> Result<String> {
        let session = self.connected()?;
        let options = SignMessageOptions {
            to_sign_address: options.to_sign_address.or(Some(session.address)),
            ..options
        };
        self.session.provider()?.sign_message(message, &options).await
    }

    /// BTC held by the payment address
    pub async fn get_balance(&self) -> Result<u64> {
        let session = self.connected()?;
        self.data_sources.get_btc_balance(&session.payment_address).await
    }

    pub async fn get_inscriptions(&self, offset: usize, limit: usize) -> Result<Vec<InscriptionRecord>> {
        let session = self.connected()?;
        self.data_sources.get_inscriptions(&session.address, offset, limit).await
    }

    /// Asset balances of the ordinals address under `protocol`
    pub async fn get_meta_balances(&self, protocol: Protocol) -> Result<Vec<AssetBalance>> {
        let session = self.connected()?;
        let address = &session.address;
        match protocol {
            Protocol::Btc => Err(LaserError::UnsupportedByDataSource(
                "btc has no meta-protocol balances; use get_balance".to_string(),
            )),
            Protocol::Runes => self.data_sources.get_rune_balances(address).await,
            Protocol::Brc20 => {
                let balances = self.data_sources.get_brc20_balances(address).await?;
                balances
                    .into_iter()
                    .map(|b| {
                        Ok(AssetBalance {
                            amount: parse_decimal_amount(&b.overall, BRC20_DECIMALS)?,
                            asset: AssetId::Brc20 {
                                ticker: b.ticker.clone(),
                            },
                            name: b.ticker,
                            symbol: None,
                            divisibility: BRC20_DECIMALS,
                        })
                    })
                    .collect()
            }
            Protocol::Alkanes => {
                let holdings = self.data_sources.get_alkanes_by_address(address).await?;
                let mut totals: BTreeMap<AlkaneId, AssetBalance> = BTreeMap::new();
                for alkane in holdings.iter().flat_map(|u| u.alkanes.iter()) {
                    let entry = totals.entry(alkane.id).or_insert_with(|| AssetBalance {
                        asset: AssetId::Alkane(alkane.id),
                        name: alkane.name.clone().unwrap_or_else(|| alkane.id.to_string()),
                        symbol: alkane.symbol.clone(),
                        amount: 0,
                        divisibility: ALKANE_DECIMALS,
                    });
                    entry.amount = entry.amount.saturating_add(alkane.amount);
                }
                Ok(totals.into_values().collect())
            }
        }
    }
}

fn parse_txid(txid: &str) -> Result<Txid> {
    txid.parse()
        .map_err(|e| LaserError::Parse(format!("txid {}: {}", txid, e)))
}
