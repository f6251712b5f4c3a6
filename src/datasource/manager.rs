//! Data source registry with ordered fallback

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use bitcoin::OutPoint;

use super::maestro::MaestroSource;
use super::mempool::MempoolSource;
use super::sandshrew::SandshrewSource;
use super::{
    Brc20Balance, Capability, DataSource, InscriptionRecord, OutputAnnotation, RecommendedFees,
    TransactionInfo,
};
use crate::config::{ClientConfig, CustomNetwork};
use crate::error::{LaserError, Result};
use crate::network::Network;
use crate::utxo::{AssetBalance, Utxo};

#[derive(Clone, Debug)]
struct NetworkState {
    network: Network,
    custom_id: Option<String>,
}

/// Registered sources in registration order, plus the active network
pub struct DataSourceManager {
    sources: RwLock<Vec<Arc<dyn DataSource>>>,
    state: RwLock<NetworkState>,
    custom_networks: HashMap<String, CustomNetwork>,
    preferred: HashMap<String, String>,
}

impl DataSourceManager {
    /// Manager with the built-in sources `config` enables
    pub fn new(config: &ClientConfig) -> Self {
        let manager = Self::empty(config);
        let sources = &config.data_sources;
        if sources.mempool.enabled {
            manager.register_data_source(Arc::new(MempoolSource::new(config)));
        }
        if sources.sandshrew.enabled {
            manager.register_data_source(Arc::new(SandshrewSource::new(config)));
        }
        if sources.maestro.enabled {
            manager.register_data_source(Arc::new(MaestroSource::new(config)));
        }
        manager
    }

    /// Manager with no sources registered
    pub fn empty(config: &ClientConfig) -> Self {
        Self {
            sources: RwLock::new(Vec::new()),
            state: RwLock::new(NetworkState {
                network: config.network,
                custom_id: None,
            }),
            custom_networks: config.custom_networks.clone(),
            preferred: config.data_sources.preferred.clone(),
        }
    }

    fn state(&self) -> NetworkState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn sources(&self) -> Vec<Arc<dyn DataSource>> {
        self.sources.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn network(&self) -> Network {
        self.state().network
    }

    /// Add `source`, replacing one of the same name in place
    ///
    /// The source is pointed at the active network before it is visible.
    pub fn register_data_source(&self, source: Arc<dyn DataSource>) {
        let state = self.state();
        source.set_network(state.network, state.custom_id.as_deref());
        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
        match sources.iter_mut().find(|s| s.name() == source.name()) {
            Some(slot) => *slot = source,
            None => sources.push(source),
        }
        log::debug!("Registered data sources: {:?}", sources.iter().map(|s| s.name()).collect::<Vec<_>>());
    }

    pub fn source(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.sources().into_iter().find(|s| s.name() == name)
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources().iter().map(|s| s.name().to_string()).collect()
    }

    /// Re-target every source to a built-in network
    pub fn update_network(&self, network: Network) {
        self.retarget(NetworkState {
            network,
            custom_id: None,
        });
    }

    /// Re-target every source to a configured custom network
    pub fn use_custom_network(&self, id: &str) -> Result<Network> {
        let custom = self
            .custom_networks
            .get(id)
            .ok_or_else(|| LaserError::UnsupportedNetwork(id.to_string()))?;
        self.retarget(NetworkState {
            network: custom.base_network,
            custom_id: Some(id.to_string()),
        });
        Ok(custom.base_network)
    }

    fn retarget(&self, next: NetworkState) {
        log::info!(
            "Data sources switching to {}",
            next.custom_id.as_deref().unwrap_or(next.network.id())
        );
        for source in self.sources() {
            source.set_network(next.network, next.custom_id.as_deref());
        }
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// The custom network's own preference, else the one for the built-in network
    fn preferred_source(&self) -> Option<String> {
        let state = self.state();
        state
            .custom_id
            .and_then(|id| self.custom_networks.get(&id)?.preferred_data_source.clone())
            .or_else(|| self.preferred.get(state.network.id()).cloned())
    }

    /// First source able to answer `capability`, the active network's preferred source first
    pub fn find_available_source(&self, capability: Capability) -> Option<Arc<dyn DataSource>> {
        let sources = self.sources();
        if let Some(preferred) = self.preferred_source() {
            if let Some(source) = sources.iter().find(|s| s.name() == preferred && s.supports(capability)) {
                return Some(source.clone());
            }
        }
        sources.into_iter().find(|s| s.supports(capability))
    }

    pub fn any_source_supports(&self, capability: Capability) -> bool {
        self.find_available_source(capability).is_some()
    }

    /// Run `operation` against the primary source, then each other capable source in order
    ///
    /// Sources are tried one at a time and the first success wins. Only source
    /// failures move the chain on; any other error is returned as is.
    pub async fn with_fallback<T, F, Fut>(&self, capability: Capability, operation: F) -> Result<T>
    where
        F: Fn(Arc<dyn DataSource>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let primary = self.find_available_source(capability).ok_or_else(|| {
            LaserError::UnsupportedByDataSource(format!("no data source supports {:?}", capability))
        })?;
        let chain: Vec<Arc<dyn DataSource>> = std::iter::once(primary.clone())
            .chain(
                self.sources()
                    .into_iter()
                    .filter(|s| s.name() != primary.name() && s.supports(capability)),
            )
            .collect();

        let mut failures = Vec::new();
        let mut all_unsupported_network = true;
        for source in chain {
            let name = source.name().to_string();
            match operation(source).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable_across_sources() => {
                    log::warn!("Fallback: {} failed for {:?}: {}", name, capability, e);
                    all_unsupported_network &= matches!(e, LaserError::UnsupportedNetwork(_));
                    failures.push(format!("{}: {}", name, e));
                }
                Err(e) => return Err(e),
            }
        }

        if all_unsupported_network {
            return Err(LaserError::UnsupportedNetwork(self.network().id().to_string()));
        }
        Err(LaserError::AllSourcesFailed(failures))
    }

    pub async fn get_btc_balance(&self, address: &str) -> Result<u64> {
        self.with_fallback(Capability::BtcBalance, |ds| async move { ds.get_btc_balance(address).await })
            .await
    }

    pub async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>> {
        self.with_fallback(Capability::Utxos, |ds| async move { ds.get_utxos(address).await })
            .await
    }

    pub async fn get_inscriptions(&self, address: &str, offset: usize, limit: usize) -> Result<Vec<InscriptionRecord>> {
        self.with_fallback(Capability::Inscriptions, |ds| async move {
            ds.get_inscriptions(address, offset, limit).await
        })
        .await
    }

    pub async fn get_inscription(&self, inscription_id: &str) -> Result<InscriptionRecord> {
        self.with_fallback(Capability::InscriptionInfo, |ds| async move {
            ds.get_inscription(inscription_id).await
        })
        .await
    }

    pub async fn get_brc20_balances(&self, address: &str) -> Result<Vec<Brc20Balance>> {
        self.with_fallback(Capability::Brc20Balances, |ds| async move {
            ds.get_brc20_balances(address).await
        })
        .await
    }

    pub async fn get_rune_balances(&self, address: &str) -> Result<Vec<AssetBalance>> {
        self.with_fallback(Capability::RuneBalances, |ds| async move {
            ds.get_rune_balances(address).await
        })
        .await
    }

    pub async fn get_rune_outpoints(&self, address: &str) -> Result<Vec<Utxo>> {
        self.with_fallback(Capability::RuneOutpoints, |ds| async move {
            ds.get_rune_outpoints(address).await
        })
        .await
    }

    pub async fn get_alkanes_by_address(&self, address: &str) -> Result<Vec<Utxo>> {
        self.with_fallback(Capability::Alkanes, |ds| async move {
            ds.get_alkanes_by_address(address).await
        })
        .await
    }

    pub async fn get_output_annotations(&self, outpoints: &[OutPoint]) -> Result<Vec<OutputAnnotation>> {
        self.with_fallback(Capability::OutputAnnotations, |ds| async move {
            ds.get_output_annotations(outpoints).await
        })
        .await
    }

    pub async fn get_recommended_fees(&self) -> Result<RecommendedFees> {
        self.with_fallback(Capability::RecommendedFees, |ds| async move { ds.get_recommended_fees().await })
            .await
    }

    pub async fn broadcast(&self, tx_hex: &str) -> Result<String> {
        self.with_fallback(Capability::Broadcast, |ds| async move { ds.broadcast(tx_hex).await })
            .await
    }

    pub async fn get_transaction(&self, txid: &str) -> Result<TransactionInfo> {
        self.with_fallback(Capability::Transaction, |ds| async move { ds.get_transaction(txid).await })
            .await
    }

    pub async fn get_raw_transaction(&self, txid: &str) -> Result<String> {
        self.with_fallback(Capability::RawTransaction, |ds| async move {
            ds.get_raw_transaction(txid).await
        })
        .await
    }

    pub async fn wait_for_transaction(&self, txid: &str) -> Result<bool> {
        self.with_fallback(Capability::WaitForTransaction, |ds| async move {
            ds.wait_for_transaction(txid).await
        })
        .await
    }

    pub async fn get_output_value(&self, txid: &str, vout: u32) -> Result<Option<u64>> {
        self.with_fallback(Capability::OutputValue, |ds| async move {
            ds.get_output_value(txid, vout).await
        })
        .await
    }

    /// UTXOs of `address` with inscription, rune and alkane annotations, ascending by value
    ///
    /// Annotations a registered source could supply but failed to are an
    /// error. When no source supports them at all the UTXOs stay bare and the
    /// carrier-value rule in [`Utxo::is_spendable`] is the only guard.
    pub async fn get_formatted_utxos(&self, address: &str) -> Result<Vec<Utxo>> {
        let mut utxos = self.get_utxos(address).await?;
        if utxos.is_empty() {
            return Ok(utxos);
        }

        if self.any_source_supports(Capability::OutputAnnotations) {
            let outpoints: Vec<OutPoint> = utxos.iter().map(Utxo::outpoint).collect();
            let annotations: HashMap<String, OutputAnnotation> = self
                .get_output_annotations(&outpoints)
                .await?
                .into_iter()
                .map(|a| (a.outpoint.clone(), a))
                .collect();
            for utxo in &mut utxos {
                if let Some(annotation) = annotations.get(&utxo.outpoint().to_string()) {
                    utxo.inscriptions = annotation.inscriptions.clone();
                    utxo.runes = annotation.runes.clone();
                }
            }
        } else {
            log::warn!("No data source annotates outputs; relying on carrier values for {}", address);
        }

        if self.any_source_supports(Capability::Alkanes) {
            let alkanes: HashMap<OutPoint, Utxo> = self
                .get_alkanes_by_address(address)
                .await?
                .into_iter()
                .map(|u| (u.outpoint(), u))
                .collect();
            for utxo in &mut utxos {
                if let Some(held) = alkanes.get(&utxo.outpoint()) {
                    utxo.alkanes = held.alkanes.clone();
                }
            }
        }

        utxos.sort_by_key(|u| u.value);
        Ok(utxos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        fee: Result<RecommendedFees>,
        calls: AtomicUsize,
        network: RwLock<Option<(Network, Option<String>)>>,
    }

    impl Scripted {
        fn new(name: &'static str, fee: Result<RecommendedFees>) -> Arc<Self> {
            Arc::new(Self {
                name,
                fee,
                calls: AtomicUsize::new(0),
                network: RwLock::new(None),
            })
        }

        fn ok(name: &'static str, fast: f64) -> Arc<Self> {
            Self::new(name, Ok(RecommendedFees { fast, min: 1.0 }))
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DataSource for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> &[Capability] {
            &[Capability::RecommendedFees]
        }

        fn set_network(&self, network: Network, custom_id: Option<&str>) {
            *self.network.write().unwrap() = Some((network, custom_id.map(str::to_string)));
        }

        async fn get_recommended_fees(&self) -> Result<RecommendedFees> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.fee.clone()
        }
    }

    fn manager(sources: &[Arc<Scripted>]) -> DataSourceManager {
        let mut config = ClientConfig::default();
        config.custom_networks.insert(
            "devnet".to_string(),
            CustomNetwork {
                base_network: Network::Regtest,
                preferred_data_source: Some("c".to_string()),
            },
        );
        let manager = DataSourceManager::empty(&config);
        for source in sources {
            manager.register_data_source(source.clone());
        }
        manager
    }

    #[tokio::test]
    async fn test_fallback_stops_at_first_success() {
        let a = Scripted::new("a", Err(LaserError::Http("down".to_string())));
        let b = Scripted::ok("b", 12.0);
        let c = Scripted::ok("c", 99.0);
        let manager = manager(&[a.clone(), b.clone(), c.clone()]);

        let fees = manager.get_recommended_fees().await.unwrap();
        assert_eq!(fees.fast, 12.0);
        assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_all_failed_lists_each_source() {
        let a = Scripted::new("a", Err(LaserError::Http("down".to_string())));
        let b = Scripted::new("b", Err(LaserError::Timeout("slow".to_string())));
        let manager = manager(&[a, b]);
        match manager.get_recommended_fees().await.unwrap_err() {
            LaserError::AllSourcesFailed(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures[0].starts_with("a:"));
                assert!(failures[1].starts_with("b:"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_error_is_not_retried() {
        let a = Scripted::new("a", Err(LaserError::UserRejected));
        let b = Scripted::ok("b", 1.0);
        let manager = manager(&[a, b.clone()]);
        assert_eq!(manager.get_recommended_fees().await.unwrap_err(), LaserError::UserRejected);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_network_everywhere_surfaces_as_such() {
        let a = Scripted::new("a", Err(LaserError::UnsupportedNetwork("regtest".to_string())));
        let manager = manager(&[a]);
        assert!(matches!(
            manager.get_recommended_fees().await.unwrap_err(),
            LaserError::UnsupportedNetwork(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_capability() {
        let manager = manager(&[]);
        assert!(matches!(
            manager.get_utxos("bc1q").await.unwrap_err(),
            LaserError::UnsupportedByDataSource(_)
        ));
    }

    #[tokio::test]
    async fn test_custom_network_prefers_its_source() {
        let a = Scripted::ok("a", 1.0);
        let c = Scripted::ok("c", 3.0);
        let manager = manager(&[a.clone(), c.clone()]);
        assert_eq!(manager.get_recommended_fees().await.unwrap().fast, 1.0);

        assert_eq!(manager.use_custom_network("devnet").unwrap(), Network::Regtest);
        assert_eq!(manager.get_recommended_fees().await.unwrap().fast, 3.0);
        assert_eq!(
            *a.network.read().unwrap(),
            Some((Network::Regtest, Some("devnet".to_string())))
        );
        assert!(manager.use_custom_network("nowhere").is_err());
    }

    #[test]
    fn test_register_targets_current_network_and_replaces_by_name() {
        let manager = manager(&[]);
        manager.update_network(Network::Testnet4);
        let first = Scripted::ok("a", 1.0);
        manager.register_data_source(first.clone());
        assert_eq!(*first.network.read().unwrap(), Some((Network::Testnet4, None)));

        manager.register_data_source(Scripted::ok("a", 2.0));
        assert_eq!(manager.source_names(), vec!["a".to_string()]);
    }

    #[test]
    fn test_default_registration_order() {
        let mut config = ClientConfig::default();
        assert_eq!(DataSourceManager::new(&config).source_names(), vec!["mempool", "sandshrew"]);
        config.data_sources.maestro.enabled = true;
        assert_eq!(
            DataSourceManager::new(&config).source_names(),
            vec!["mempool", "sandshrew", "maestro"]
        );
    }
}
