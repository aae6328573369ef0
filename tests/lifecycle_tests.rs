//! Wallet lifecycle: keys, persistence, datadir locking and the onchain side.

mod common;

use arkwallet::{
    derive_keypair_from_mnemonic, Amount, ErrorKind, InjectedFailure, MovementKind, Network, Wallet, WalletConfig,
};
use common::{tempdir, Regtest, OTHER_MNEMONIC, TEST_MNEMONIC};

#[test]
fn keys_are_deterministic() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.create_wallet(dir.path(), TEST_MNEMONIC);

    let peeked = wallet.peek_keypair(3).expect("peek");
    let derived = derive_keypair_from_mnemonic(TEST_MNEMONIC, Network::Regtest, 3).expect("derive");
    assert_eq!(peeked, derived.peek());

    let first = wallet.derive_store_next_keypair().expect("next");
    let second = wallet.derive_store_next_keypair().expect("next");
    assert_eq!(first.index, 0);
    assert_eq!(second.index, 1);
    assert_eq!(first, wallet.peek_keypair(0).expect("peek"));
    assert_ne!(first.public_key, second.public_key);
}

#[test]
fn sign_and_verify_message() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.create_wallet(dir.path(), TEST_MNEMONIC);

    let sig = wallet.sign_message("hello ark", 2).expect("sign");
    assert_eq!(sig.index, 2);
    assert_eq!(sig.public_key, wallet.peek_keypair(2).expect("peek").public_key);
    assert!(wallet.verify_message("hello ark", &sig.signature, &sig.public_key).expect("verify"));
    assert!(!wallet.verify_message("goodbye", &sig.signature, &sig.public_key).expect("verify"));

    let other = wallet.peek_keypair(5).expect("peek").public_key;
    assert!(!wallet.verify_message("hello ark", &sig.signature, &other).expect("verify"));

    let err = wallet.verify_message("hello ark", "not-a-signature", &sig.public_key).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn state_survives_close_and_open() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.boarded_wallet(dir.path(), TEST_MNEMONIC, 100_000);
    let balance = wallet.offchain_balance().expect("balance");
    let vtxos = wallet.all_vtxos().expect("vtxos");
    let movements = wallet.movements().expect("movements");
    let fingerprint = wallet.fingerprint().expect("fingerprint");

    let handle = wallet.clone();
    wallet.close().expect("close");
    assert!(!wallet.is_loaded());
    assert!(!handle.is_loaded());
    assert_eq!(handle.offchain_balance().unwrap_err().kind(), ErrorKind::State);
    assert_eq!(wallet.close().unwrap_err().kind(), ErrorKind::State);

    let reopened = net.open_wallet(dir.path(), TEST_MNEMONIC);
    assert_eq!(reopened.offchain_balance().expect("balance"), balance);
    assert_eq!(reopened.all_vtxos().expect("vtxos"), vtxos);
    assert_eq!(reopened.movements().expect("movements"), movements);
    assert_eq!(reopened.fingerprint().expect("fingerprint"), fingerprint);
    assert_eq!(reopened.network().expect("network"), Network::Regtest);
}

#[test]
fn open_refuses_other_mnemonic() {
    let net = Regtest::new();
    let dir = tempdir();
    net.create_wallet(dir.path(), TEST_MNEMONIC).close().expect("close");

    let err = Wallet::open(dir.path(), &OTHER_MNEMONIC, net.backends()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // The failed attempt released the datadir.
    net.open_wallet(dir.path(), TEST_MNEMONIC);
}

#[test]
fn datadir_is_exclusive() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.create_wallet(dir.path(), TEST_MNEMONIC);

    let err = Wallet::open(dir.path(), TEST_MNEMONIC, net.backends()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert!(dir.path().join("LOCK").exists());

    wallet.close().expect("close");
    assert!(!dir.path().join("LOCK").exists());

    // An existing wallet is never overwritten.
    let err = Wallet::create(dir.path(), TEST_MNEMONIC, net.config(), net.backends()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
}

#[test]
fn open_missing_wallet_is_not_found() {
    let net = Regtest::new();
    let dir = tempdir();
    let err = Wallet::open(dir.path().join("nothing"), TEST_MNEMONIC, net.backends()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn create_checks_configuration() {
    let net = Regtest::new();
    let dir = tempdir();

    let err = Wallet::create(dir.path(), TEST_MNEMONIC, WalletConfig::regtest(), net.backends()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let mainnet = WalletConfig::mainnet().with_server("local");
    let err = Wallet::create(dir.path(), TEST_MNEMONIC, mainnet, net.backends()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let err = Wallet::create(dir.path(), "not a mnemonic", net.config(), net.backends()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // None of the failures left a wallet behind.
    net.create_wallet(dir.path(), TEST_MNEMONIC);
}

#[test]
fn create_new_returns_backup_mnemonic() {
    let net = Regtest::new();
    let dir = tempdir();
    let (wallet, mnemonic) = Wallet::create_new(dir.path(), net.config(), net.backends()).expect("create");
    let fingerprint = wallet.fingerprint().expect("fingerprint");
    wallet.close().expect("close");

    let reopened = net.open_wallet(dir.path(), &mnemonic.to_string());
    assert_eq!(reopened.fingerprint().expect("fingerprint"), fingerprint);
}

#[test]
fn ark_info_falls_back_to_cache() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.create_wallet(dir.path(), TEST_MNEMONIC);
    let info = wallet.get_ark_info().expect("info");

    net.server.inject_failure(InjectedFailure::Unreachable);
    assert_eq!(wallet.get_ark_info().expect("cached info"), info);
}

#[test]
fn concurrent_calls_keep_every_key() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.create_wallet(dir.path(), TEST_MNEMONIC);
    let address = wallet.new_address().expect("address").to_string();

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let wallet = wallet.clone();
            let address = address.clone();
            std::thread::spawn(move || {
                for _ in 0..10 {
                    if i % 2 == 0 {
                        wallet.validate_arkoor_address(&address).expect("valid address");
                        wallet.get_ark_info().expect("info");
                    } else {
                        wallet.derive_store_next_keypair().expect("next");
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }

    // One key for the address, twenty from the two deriving threads.
    assert_eq!(wallet.derive_store_next_keypair().expect("next").index, 21);
}

#[test]
fn onchain_send_and_drain() {
    let net = Regtest::new();
    let (dir_a, dir_b) = (tempdir(), tempdir());
    let alice = net.create_wallet(dir_a.path(), TEST_MNEMONIC);
    let bob = net.create_wallet(dir_b.path(), &OTHER_MNEMONIC);
    net.fund_onchain(&alice, 300_000);
    assert_eq!(alice.onchain_balance().expect("onchain").spendable(), Amount::from_sat(300_000));

    let bob_address = bob.onchain_address().expect("address").to_string();
    alice.onchain_send(&bob_address, Amount::from_sat(50_000), None).expect("send");
    assert_eq!(
        alice.onchain_send(&bob_address, Amount::ZERO, None).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    net.mine(1);
    bob.onchain_sync().expect("sync");
    assert_eq!(bob.onchain_balance().expect("onchain").total(), Amount::from_sat(50_000));

    let send = alice.movements().expect("movements").remove(0);
    assert_eq!(send.kind, MovementKind::OnchainSend);
    assert!(send.fees > Amount::ZERO);
    let send_fee = send.fees;

    alice.onchain_sync().expect("sync");
    let left = alice.onchain_balance().expect("onchain").total();
    assert_eq!(left, Amount::from_sat(250_000) - send_fee);

    alice.onchain_drain(&bob_address, Some(1)).expect("drain");
    let drain = alice.movements().expect("movements").remove(0);
    assert!(drain.fees > Amount::ZERO);
    assert_eq!(drain.recipients[0].amount + drain.fees, left);

    net.mine(1);
    alice.onchain_sync().expect("sync");
    bob.onchain_sync().expect("sync");
    assert_eq!(alice.onchain_balance().expect("onchain").total(), Amount::ZERO);
    assert_eq!(
        bob.onchain_balance().expect("onchain").total(),
        Amount::from_sat(300_000) - send_fee - drain.fees
    );
}

#[tokio::test]
async fn run_blocking_from_async_host() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.boarded_wallet(dir.path(), TEST_MNEMONIC, 40_000);

    let balance = wallet
        .run_blocking(|w| w.offchain_balance())
        .await
        .expect("balance");
    assert_eq!(balance.spendable, Amount::from_sat(40_000));
}
