//! Client Integration Tests
//!
//! Drives `LaserClient` end to end against the in-memory chain and the
//! software wallet from `common`: build, sign, finalize, broadcast.
//!
//! These tests are self-contained and do not require network access.
//!
//! Run with: cargo test --test client_test -- --nocapture

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bitcoin::hashes::Hash;
use common::*;
use lasertx::builder::alkanes::AlkaneSend;
use lasertx::builder::brc20::Brc20Transfer;
use lasertx::builder::btc::BtcSend;
use lasertx::builder::inscriptions::InscribeRequest;
use lasertx::builder::runes::RuneSend;
use lasertx::utxo::RuneAmount;
use lasertx::{
    AlkaneId, AssetOrder, ClientConfig, ConnectionState, LaserClient, LaserError, Network, RuneId, RuneRef,
    SendRequest, DUST_VALUE,
};

// ============================================================================
// Helper Functions
// ============================================================================

/// Connected client over one funded chain
async fn connected_client(wallet: MockWallet) -> (LaserClient, Arc<MockChain>, Arc<MockWallet>) {
    init_logging();
    let chain = Arc::new(MockChain::new("chain"));
    let wallet = Arc::new(wallet);
    chain.fund(
        &wallet.payment().address,
        vec![utxo(&wallet.payment(), 1, 50_000), utxo(&wallet.payment(), 2, 20_000)],
    );

    let client = LaserClient::with_data_sources(ClientConfig::default(), manager(vec![chain.clone()]));
    client.register_provider(wallet.clone());
    client.connect("mock").await.unwrap();
    (client, chain, wallet)
}

fn script(address: &str) -> bitcoin::ScriptBuf {
    lasertx::address::script_pubkey(address, Network::Mainnet).unwrap()
}

// ============================================================================
// Sends
// ============================================================================

#[tokio::test]
async fn test_btc_send_is_built_signed_and_broadcast() {
    let (client, chain, wallet) = connected_client(MockWallet::new("mock")).await;
    let recipient = taproot_account(7);

    let txid = client
        .send(
            &SendRequest::Btc(BtcSend {
                recipient: recipient.address.clone(),
                amount: 10_000,
            }),
            None,
        )
        .await
        .unwrap();

    let broadcasts = chain.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    let tx = &broadcasts[0];
    assert_eq!(tx.compute_txid().to_string(), txid);
    assert_eq!(tx.output[0].value.to_sat(), 10_000);
    assert_eq!(tx.output[0].script_pubkey, script(&recipient.address));
    assert_eq!(tx.output[1].script_pubkey, script(&wallet.payment().address));
    assert!(tx.input.iter().all(|i| i.witness.len() == 2));
}

#[tokio::test]
async fn test_native_btc_send_skips_local_build() {
    let (client, chain, wallet) = connected_client(MockWallet::new("mock").with_native_send()).await;

    let txid = client
        .send(
            &SendRequest::Btc(BtcSend {
                recipient: taproot_account(7).address,
                amount: 10_000,
            }),
            None,
        )
        .await
        .unwrap();

    assert_eq!(txid, txid_hex(0xaa));
    assert!(chain.broadcasts().is_empty());
    assert!(wallet.sign_requests.lock().unwrap().is_empty());
}

fn txid_hex(n: u8) -> String {
    common::txid(n).to_string()
}

#[tokio::test]
async fn test_rune_send_spends_asset_and_fee_legs() {
    let (client, chain, wallet) = connected_client(MockWallet::new("mock")).await;
    let rune_id = RuneId::new(840_000, 1);
    let mut carrier = utxo(&wallet.ordinals(), 9, DUST_VALUE);
    carrier.runes.push(RuneAmount {
        id: Some(rune_id),
        name: "UNCOMMONGOODS".to_string(),
        amount: 1_000,
        divisibility: 0,
        symbol: Some("⧉".to_string()),
    });
    chain
        .rune_outpoints
        .lock()
        .unwrap()
        .insert(wallet.ordinals().address, vec![carrier.clone()]);
    let recipient = taproot_account(7);

    client
        .send(
            &SendRequest::Runes(RuneSend {
                rune: RuneRef::Name("UNCOMMON•GOODS".to_string()),
                amount: 100,
                recipient: recipient.address.clone(),
                order: AssetOrder::LargestFirst,
            }),
            Some(2.0),
        )
        .await
        .unwrap();

    let tx = &chain.broadcasts()[0];
    assert_eq!(tx.input[0].previous_output, carrier.outpoint());
    // Key-path signature for the carrier, signature and key for the payment inputs
    assert_eq!(tx.input[0].witness.len(), 1);
    assert!(tx.input[1..].iter().all(|i| i.witness.len() == 2));

    assert!(tx.output[0].script_pubkey.is_op_return());
    assert_eq!(tx.output[1].script_pubkey, script(&wallet.ordinals().address));
    assert_eq!(tx.output[1].value.to_sat(), DUST_VALUE);
    assert_eq!(tx.output[2].script_pubkey, script(&recipient.address));
    assert_eq!(tx.output[2].value.to_sat(), DUST_VALUE);
    assert_eq!(tx.output[3].script_pubkey, script(&wallet.payment().address));
}

#[tokio::test]
async fn test_zero_amount_transfers_fail_before_any_data_source_call() {
    let (client, chain, _wallet) = connected_client(MockWallet::new("mock")).await;
    let recipient = taproot_account(7).address;
    let calls = chain.call_count();

    let requests = vec![
        SendRequest::Btc(BtcSend {
            recipient: recipient.clone(),
            amount: 0,
        }),
        SendRequest::Runes(RuneSend {
            rune: RuneRef::Id(RuneId::new(840_000, 1)),
            amount: 0,
            recipient: recipient.clone(),
            order: AssetOrder::default(),
        }),
        SendRequest::Brc20(Brc20Transfer {
            ticker: "ordi".to_string(),
            amount: "0".to_string(),
            recipient: recipient.clone(),
        }),
        SendRequest::Alkanes(AlkaneSend {
            id: AlkaneId::new(2, 1),
            amount: 0,
            recipient: recipient.clone(),
            order: AssetOrder::default(),
        }),
    ];
    for request in &requests {
        let err = client.send(request, None).await.unwrap_err();
        assert!(
            matches!(err, LaserError::MissingRequiredParameters(_)),
            "{:?}: {:?}",
            request.protocol(),
            err
        );
    }
    assert_eq!(chain.call_count(), calls);
}

#[tokio::test]
async fn test_rejected_connect_leaves_session_disconnected() {
    init_logging();
    let chain = Arc::new(MockChain::new("chain"));
    let wallet = Arc::new(MockWallet::new("mock"));
    chain.fund(&wallet.payment().address, vec![utxo(&wallet.payment(), 1, 50_000)]);
    let client = LaserClient::with_data_sources(ClientConfig::default(), manager(vec![chain.clone()]));
    client.register_provider(wallet);
    client.register_provider(Arc::new(MockWallet::new("picky").rejecting()));

    assert_eq!(client.connect("picky").await.unwrap_err(), LaserError::UserRejected);
    assert_eq!(client.session().snapshot().state, ConnectionState::Disconnected);
    assert!(chain.broadcasts().is_empty());
}

// ============================================================================
// Inscriptions
// ============================================================================

#[tokio::test]
async fn test_inscribe_commits_then_reveals() {
    let (client, chain, wallet) = connected_client(MockWallet::new("mock")).await;

    let result = client
        .inscribe(
            &InscribeRequest {
                content_type: "text/plain;charset=utf-8".to_string(),
                body: b"hello, ordinals".to_vec(),
                destination: None,
            },
            Some(2.0),
        )
        .await
        .unwrap();

    let broadcasts = chain.broadcasts();
    assert_eq!(broadcasts.len(), 2);
    let (commit, reveal) = (&broadcasts[0], &broadcasts[1]);
    assert_eq!(commit.compute_txid().to_string(), result.commit_txid);
    assert_eq!(reveal.compute_txid().to_string(), result.reveal_txid);
    assert_eq!(result.inscription_id, format!("{}i0", result.reveal_txid));

    assert_eq!(reveal.input[0].previous_output.txid, commit.compute_txid());
    // Signature, envelope script, control block
    assert_eq!(reveal.input[0].witness.len(), 3);
    assert_eq!(reveal.output.len(), 1);
    assert_eq!(reveal.output[0].value.to_sat(), DUST_VALUE);
    assert_eq!(reveal.output[0].script_pubkey, script(&wallet.ordinals().address));
}

#[tokio::test]
async fn test_wrapped_segwit_reveal_spends_the_broadcast_commit() {
    let (client, chain, _wallet) = connected_client(MockWallet::new("mock").with_wrapped_payment()).await;

    let result = client
        .inscribe(
            &InscribeRequest {
                content_type: "text/plain;charset=utf-8".to_string(),
                body: b"wrapped payer".to_vec(),
                destination: None,
            },
            Some(2.0),
        )
        .await
        .unwrap();

    let broadcasts = chain.broadcasts();
    assert_eq!(broadcasts.len(), 2);
    let (commit, reveal) = (&broadcasts[0], &broadcasts[1]);
    // The scriptSig added at finalization moves the txid away from the unsigned one
    assert!(commit.input.iter().all(|i| !i.script_sig.is_empty()));
    assert!(commit.input.iter().all(|i| i.witness.len() == 2));
    assert_eq!(result.commit_txid, commit.compute_txid().to_string());
    assert_eq!(reveal.input[0].previous_output.txid, commit.compute_txid());
    assert_eq!(result.reveal_txid, reveal.compute_txid().to_string());
}

#[tokio::test]
async fn test_wrapped_segwit_brc20_transfer_chains_three_transactions() {
    let (client, chain, wallet) = connected_client(MockWallet::new("mock").with_wrapped_payment()).await;
    let recipient = taproot_account(7);

    let txid = client
        .send(
            &SendRequest::Brc20(Brc20Transfer {
                ticker: "ordi".to_string(),
                amount: "10".to_string(),
                recipient: recipient.address.clone(),
            }),
            Some(2.0),
        )
        .await
        .unwrap();

    let broadcasts = chain.broadcasts();
    assert_eq!(broadcasts.len(), 3);
    let (commit, reveal, delivery) = (&broadcasts[0], &broadcasts[1], &broadcasts[2]);
    assert_eq!(reveal.input[0].previous_output.txid, commit.compute_txid());
    assert_eq!(delivery.input[0].previous_output.txid, reveal.compute_txid());
    assert_eq!(delivery.input[0].previous_output.vout, 0);
    assert_eq!(delivery.output[0].script_pubkey, script(&recipient.address));
    assert_eq!(delivery.compute_txid().to_string(), txid);
    assert!(delivery.input[1..]
        .iter()
        .all(|i| !i.script_sig.is_empty() && i.witness.len() == 2));
    assert_eq!(reveal.output[0].script_pubkey, script(&wallet.ordinals().address));
}

// ============================================================================
// External PSBTs
// ============================================================================

#[tokio::test]
async fn test_sign_psbt_accepts_both_encodings() {
    let (client, chain, wallet) = connected_client(MockWallet::new("mock")).await;
    let ctx = lasertx::BuildContext::new(
        client.data_sources(),
        Network::Mainnet,
        wallet.payment(),
        wallet.ordinals(),
    )
    .with_fee_rate(1.0);
    let built = lasertx::builder::btc::build_send(
        &ctx,
        &BtcSend {
            recipient: taproot_account(7).address,
            amount: 5_000,
        },
    )
    .await
    .unwrap();

    let from_base64 = client.sign_psbt(&built.to_base64(), true, false).await.unwrap();
    let from_hex = client.sign_psbt(&built.to_hex(), true, false).await.unwrap();
    assert_eq!(from_base64, from_hex);
    assert!(from_hex.txid.is_none());

    let signed = lasertx::decode_psbt(from_hex.signed_psbt().unwrap()).unwrap();
    assert!(signed.inputs.iter().all(|i| i.final_script_witness.is_some()));
    assert!(chain.broadcasts().is_empty());

    let broadcast = client.sign_psbt(&built.to_base64(), true, true).await.unwrap();
    assert_eq!(broadcast.txid, Some(built.txid().to_string()));
    assert_eq!(chain.broadcasts().len(), 1);
}

#[tokio::test]
async fn test_sign_psbt_requires_a_connection() {
    init_logging();
    let client = LaserClient::with_data_sources(ClientConfig::default(), manager(vec![]));
    let psbt = bitcoin::Psbt::from_unsigned_tx(bitcoin::Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![bitcoin::TxIn {
            previous_output: bitcoin::OutPoint::new(bitcoin::Txid::from_byte_array([1; 32]), 0),
            ..Default::default()
        }],
        output: vec![],
    })
    .unwrap();
    let err = client
        .sign_psbt(&lasertx::psbt::psbt_to_hex(&psbt), true, false)
        .await
        .unwrap_err();
    assert_eq!(err, LaserError::NotConnected);
}

// ============================================================================
// Session through the client
// ============================================================================

#[tokio::test]
async fn test_switch_network_while_disconnected_is_a_noop() {
    init_logging();
    let client = LaserClient::with_data_sources(ClientConfig::default(), manager(vec![]));
    let before = client.session().snapshot();

    let after = client.switch_network(Network::Testnet4).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(client.session().snapshot(), before);
    assert_eq!(client.data_sources().network(), Network::Mainnet);
}

#[tokio::test]
async fn test_provider_that_cannot_switch_is_disconnected() {
    let (client, _chain, _wallet) = connected_client(MockWallet::new("mock").without_network_switch()).await;

    let err = client.switch_network(Network::Testnet4).await.unwrap_err();
    assert!(matches!(err, LaserError::UnsupportedByProvider { .. }));
    let session = client.session().snapshot();
    assert_eq!(session.state, ConnectionState::Disconnected);
    assert_eq!(session.network, Network::Mainnet);
}

#[tokio::test]
async fn test_concurrent_connects_share_one_attempt() {
    init_logging();
    let chain = Arc::new(MockChain::new("chain"));
    let wallet = Arc::new(MockWallet::new("mock"));
    let client = LaserClient::with_data_sources(ClientConfig::default(), manager(vec![chain]));
    client.register_provider(wallet.clone());

    let (a, b) = tokio::join!(client.connect("mock"), client.connect("mock"));
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(wallet.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_balance_comes_from_the_payment_address() {
    let (client, _chain, _wallet) = connected_client(MockWallet::new("mock")).await;
    assert_eq!(client.get_balance().await.unwrap(), 70_000);
    assert_eq!(client.session().snapshot().balance, Some(70_000));
}
