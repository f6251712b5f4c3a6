//! Wallet session and connection state machine
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!       ▲                        │                 │
//!       └────────error───────────┘◀──disconnect────┘
//! ```
//!
//! Concurrent `connect` calls for the same provider share one in-flight
//! attempt, spawned so it finishes even when every caller gives up. The
//! connection lock is held for the whole attempt, nested
//! network switch included, and by `switch_network`, so the two never
//! interleave. The session record is replaced whole on every transition and
//! published on a watch channel; nothing in the transitions reads back from
//! that channel.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::builder::Account;
use crate::datasource::manager::DataSourceManager;
use crate::error::{LaserError, Result};
use crate::network::Network;
use crate::provider::{ProviderRegistry, WalletAccounts, WalletProvider};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot of the wallet session
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub state: ConnectionState,
    pub provider: Option<String>,
    pub address: String,
    pub public_key: String,
    pub payment_address: String,
    pub payment_public_key: String,
    pub network: Network,
    pub accounts: Vec<String>,
    /// Sats held by the payment address at the last refresh
    pub balance: Option<u64>,
}

impl Session {
    /// Empty session on `network`
    pub fn disconnected(network: Network) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn ordinals(&self) -> Account {
        Account::new(&self.address, &self.public_key)
    }

    pub fn payment(&self) -> Account {
        Account::new(&self.payment_address, &self.payment_public_key)
    }

    fn connected(provider: &str, network: Network, accounts: WalletAccounts, balance: Option<u64>) -> Self {
        Self {
            state: ConnectionState::Connected,
            provider: Some(provider.to_string()),
            address: accounts.ordinals.address,
            public_key: accounts.ordinals.public_key,
            payment_address: accounts.payment.address,
            payment_public_key: accounts.payment.public_key,
            network,
            accounts: accounts.accounts,
            balance,
        }
    }
}

type PendingConnect = Shared<BoxFuture<'static, Result<Session>>>;

struct State {
    session: Session,
    provider: Option<Arc<dyn WalletProvider>>,
    pending: Option<(u64, String, PendingConnect)>,
    next_attempt: u64,
}

struct Inner {
    providers: Arc<ProviderRegistry>,
    data_sources: Arc<DataSourceManager>,
    state: Mutex<State>,
    connection_lock: tokio::sync::Mutex<()>,
    updates: watch::Sender<Session>,
}

/// Cheaply cloneable handle to one wallet session
#[derive(Clone)]
pub struct WalletSession {
    inner: Arc<Inner>,
}

impl WalletSession {
    pub fn new(providers: Arc<ProviderRegistry>, data_sources: Arc<DataSourceManager>, network: Network) -> Self {
        let session = Session::disconnected(network);
        let (updates, _) = watch::channel(session.clone());
        Self {
            inner: Arc::new(Inner {
                providers,
                data_sources,
                state: Mutex::new(State {
                    session,
                    provider: None,
                    pending: None,
                    next_attempt: 0,
                }),
                connection_lock: tokio::sync::Mutex::new(()),
                updates,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> Session {
        self.state().session.clone()
    }

    /// Receives every new session record
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.inner.updates.subscribe()
    }

    /// The connected provider
    pub fn provider(&self) -> Result<Arc<dyn WalletProvider>> {
        let state = self.state();
        match (&state.provider, state.session.is_connected()) {
            (Some(provider), true) => Ok(provider.clone()),
            _ => Err(LaserError::NotConnected),
        }
    }

    fn publish(&self, session: Session, provider: Option<Arc<dyn WalletProvider>>) {
        {
            let mut state = self.state();
            state.session = session.clone();
            state.provider = provider;
        }
        self.inner.updates.send_replace(session);
    }

    fn set_state(&self, connection: ConnectionState) {
        let session = {
            let mut state = self.state();
            state.session.state = connection;
            state.session.clone()
        };
        self.inner.updates.send_replace(session);
    }

    /// Connect through the provider registered as `provider_name`
    ///
    /// A call made while a connect to the same provider is in flight joins it
    /// instead of prompting the user again. The attempt runs on its own task,
    /// so a caller that stops waiting does not stall the session.
    pub async fn connect(&self, provider_name: &str) -> Result<Session> {
        let pending = {
            let mut state = self.state();
            match &state.pending {
                Some((_, name, pending)) if name == provider_name => {
                    log::debug!("Joining in-flight connect to {}", provider_name);
                    pending.clone()
                }
                _ => {
                    state.next_attempt += 1;
                    let attempt = state.next_attempt;
                    let this = self.clone();
                    let name = provider_name.to_string();
                    let task = tokio::spawn(async move {
                        let result = this.run_connect(&name).await;
                        this.finish_attempt(attempt);
                        result
                    });
                    let name = provider_name.to_string();
                    let pending = async move {
                        task.await.unwrap_or_else(|e| {
                            log::error!("Connect task for {} ended abnormally: {}", name, e);
                            Err(LaserError::NotConnected)
                        })
                    }
                    .boxed()
                    .shared();
                    state.pending = Some((attempt, provider_name.to_string(), pending.clone()));
                    pending
                }
            }
        };

        pending.await
    }

    fn finish_attempt(&self, attempt: u64) {
        let mut state = self.state();
        if matches!(&state.pending, Some((current, _, _)) if *current == attempt) {
            state.pending = None;
        }
    }

    async fn run_connect(&self, provider_name: &str) -> Result<Session> {
        let _guard = self.inner.connection_lock.lock().await;
        let provider = self.inner.providers.get(provider_name)?;

        let current = self.snapshot();
        if current.is_connected() {
            if current.provider.as_deref() == Some(provider_name) {
                return Ok(current);
            }
            log::info!("Switching provider, disconnecting {:?} first", current.provider);
            self.clear().await;
        }

        let network = current.network;
        self.set_state(ConnectionState::Connecting);
        log::info!("Connecting to {} on {}", provider_name, network);

        match self.establish(&provider, network).await {
            Ok(session) => {
                log::info!("Connected to {} as {}", provider_name, session.address);
                self.publish(session.clone(), Some(provider));
                Ok(session)
            }
            Err(e) => {
                if e.is_user_rejection() {
                    log::info!("Connection to {} rejected by user", provider_name);
                } else {
                    log::error!("Connection to {} failed: {}", provider_name, e);
                }
                self.publish(Session::disconnected(network), None);
                Err(e)
            }
        }
    }

    /// Accounts, network alignment and balance for a fresh connection
    async fn establish(&self, provider: &Arc<dyn WalletProvider>, network: Network) -> Result<Session> {
        let accounts = provider.connect(network).await?;
        if accounts.ordinals.address.is_empty() || accounts.payment.address.is_empty() {
            return Err(LaserError::MissingRequiredParameters(format!(
                "{} returned no address",
                provider.name()
            )));
        }

        let accounts = match provider.get_network().await {
            Ok(actual) if actual != network => {
                log::info!("{} is on {}, switching to {}", provider.name(), actual, network);
                provider.switch_network(network).await?;
                provider.get_accounts(network).await?
            }
            Ok(_) => accounts,
            Err(LaserError::UnsupportedByProvider { .. }) => accounts,
            Err(e) => return Err(e),
        };

        self.inner.data_sources.update_network(network);
        let balance = self.refresh_balance(&accounts.payment.address).await;
        Ok(Session::connected(provider.name(), network, accounts, balance))
    }

    async fn refresh_balance(&self, address: &str) -> Option<u64> {
        match self.inner.data_sources.get_btc_balance(address).await {
            Ok(balance) => Some(balance),
            Err(e) => {
                log::warn!("Balance refresh for {} failed: {}", address, e);
                None
            }
        }
    }

    /// Drop the session record in one step, then tell the provider
    async fn clear(&self) {
        let (network, provider) = {
            let state = self.state();
            (state.session.network, state.provider.clone())
        };
        self.publish(Session::disconnected(network), None);
        if let Some(provider) = provider {
            if let Err(e) = provider.disconnect().await {
                log::warn!("{} disconnect failed: {}", provider.name(), e);
            }
        }
    }

    pub async fn disconnect(&self) {
        let _guard = self.inner.connection_lock.lock().await;
        self.clear().await;
        log::info!("Disconnected");
    }

    /// Move the connected wallet to `network`
    ///
    /// A no-op while disconnected. A provider that cannot switch is
    /// disconnected and its error returned.
    pub async fn switch_network(&self, network: Network) -> Result<Session> {
        let _guard = self.inner.connection_lock.lock().await;
        let current = self.snapshot();
        if !current.is_connected() || current.network == network {
            return Ok(current);
        }
        let provider = self.provider()?;

        match provider.switch_network(network).await {
            Ok(()) => {}
            Err(e @ LaserError::UnsupportedByProvider { .. }) => {
                log::warn!("{} cannot switch networks; disconnecting", provider.name());
                self.clear().await;
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        let accounts = match provider.get_accounts(network).await {
            Ok(accounts) => accounts,
            Err(e) => {
                log::error!("Re-reading accounts on {} failed: {}", network, e);
                self.clear().await;
                return Err(e);
            }
        };
        self.inner.data_sources.update_network(network);
        let balance = self.refresh_balance(&accounts.payment.address).await;
        let session = Session::connected(provider.name(), network, accounts, balance);
        log::info!("Switched to {}", network);
        self.publish(session.clone(), Some(provider));
        Ok(session)
    }

    /// Refresh the stored balance of the payment address
    pub async fn refresh(&self) -> Result<Session> {
        let current = self.snapshot();
        if !current.is_connected() {
            return Err(LaserError::NotConnected);
        }
        let balance = self.refresh_balance(&current.payment_address).await;
        let session = {
            let mut state = self.state();
            if state.session.payment_address != current.payment_address {
                return Ok(state.session.clone());
            }
            state.session.balance = balance;
            state.session.clone()
        };
        self.inner.updates.send_replace(session.clone());
        Ok(session)
    }
}
