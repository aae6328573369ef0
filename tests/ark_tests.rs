//! Board, arkoor and round scenarios against the in-process server.

mod common;

use arkwallet::{Amount, ErrorKind, InjectedFailure, MovementKind, RefreshMode, VtxoState, WalletError};
use common::{tempdir, Regtest, OTHER_MNEMONIC, TEST_MNEMONIC};

#[test]
fn board_registers_after_confirmation() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.create_wallet(dir.path(), TEST_MNEMONIC);
    net.fund_onchain(&wallet, 500_000);

    let board = wallet.board_amount(Amount::from_sat(100_000)).expect("board");
    assert_eq!(board.amount, Amount::from_sat(100_000));
    assert_eq!(board.vtxos.len(), 1);

    let pending = wallet.offchain_balance().expect("balance");
    assert_eq!(pending.pending_board, Amount::from_sat(100_000));
    assert_eq!(pending.spendable, Amount::ZERO);
    assert_eq!(wallet.get_vtxo(board.vtxos[0]).expect("vtxo").state, VtxoState::PendingBoard);

    net.mine(1);
    wallet.sync().expect("sync");

    let balance = wallet.offchain_balance().expect("balance");
    assert_eq!(balance.spendable, Amount::from_sat(100_000));
    assert_eq!(balance.pending_board, Amount::ZERO);
    assert!(net.server.is_live(&board.vtxos[0]));

    let movements = wallet.movements().expect("movements");
    assert_eq!(movements[0].kind, MovementKind::Board);
    assert_eq!(movements[0].txid, Some(board.funding_txid));

    // The funding fee is recorded and matches what left the onchain wallet.
    let fee = movements[0].fees;
    assert!(fee > Amount::ZERO);
    wallet.onchain_sync().expect("onchain sync");
    assert_eq!(
        wallet.onchain_balance().expect("onchain").total(),
        Amount::from_sat(400_000) - fee
    );

    // Boarded at height 1, expires one expiry delta later.
    let info = wallet.get_ark_info().expect("info");
    let first = wallet.first_expiring_height().expect("expiry").expect("some vtxo");
    assert_eq!(first, 1 + info.vtxo_expiry_delta);
}

#[test]
fn board_below_minimum_is_refused() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.create_wallet(dir.path(), TEST_MNEMONIC);
    net.fund_onchain(&wallet, 50_000);

    let err = wallet.board_amount(Amount::from_sat(500)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(wallet.all_vtxos().expect("vtxos").is_empty());

    let err = wallet.board_amount(Amount::from_sat(5_000_000)).unwrap_err();
    assert!(matches!(err, WalletError::InsufficientFunds { .. }));
}

#[test]
fn board_all_then_pay_by_arkoor() {
    let net = Regtest::new();
    let (dir_a, dir_b) = (tempdir(), tempdir());
    let alice = net.create_wallet(dir_a.path(), TEST_MNEMONIC);
    let bob = net.create_wallet(dir_b.path(), &OTHER_MNEMONIC);
    net.fund_onchain(&alice, 50_000);

    let board = alice.board_all().expect("board all");
    let fee = alice.movements().expect("movements")[0].fees;
    assert!(fee > Amount::ZERO);
    assert_eq!(board.amount, Amount::from_sat(50_000) - fee);

    net.mine(1);
    alice.sync().expect("sync");
    alice.onchain_sync().expect("onchain sync");
    assert_eq!(alice.offchain_balance().expect("balance").spendable, Amount::from_sat(50_000) - fee);
    assert_eq!(alice.onchain_balance().expect("onchain").total(), Amount::ZERO);

    let address = bob.new_address().expect("address");
    alice
        .send_arkoor_payment(&address.to_string(), Amount::from_sat(20_000))
        .expect("arkoor");
    bob.sync().expect("sync");
    let received = bob.vtxos(true).expect("vtxos");
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].amount(), Amount::from_sat(20_000));
    assert_eq!(received[0].state, VtxoState::Spendable);
    assert_eq!(received[0].vtxo.arkoor_depth, 1);
    assert_eq!(
        alice.offchain_balance().expect("balance").spendable,
        Amount::from_sat(30_000) - fee
    );
}

#[test]
fn arkoor_payment_between_wallets() {
    let net = Regtest::new();
    let (dir_a, dir_b) = (tempdir(), tempdir());
    let alice = net.boarded_wallet(dir_a.path(), TEST_MNEMONIC, 100_000);
    let bob = net.create_wallet(dir_b.path(), &OTHER_MNEMONIC);

    let address = bob.new_address().expect("address");
    bob.validate_arkoor_address(&address.to_string()).expect("valid address");

    let payment = alice
        .send_arkoor_payment(&address.to_string(), Amount::from_sat(40_000))
        .expect("arkoor");
    assert_eq!(payment.vtxos.len(), 1);
    assert!(payment.change.is_some());
    assert_eq!(alice.offchain_balance().expect("balance").spendable, Amount::from_sat(60_000));

    bob.sync().expect("sync");
    let received = bob.vtxos(true).expect("vtxos");
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].amount(), Amount::from_sat(40_000));
    assert!(received[0].counterparty);
    assert_eq!(received[0].vtxo.arkoor_depth, 1);
    assert_eq!(bob.movements().expect("movements")[0].kind, MovementKind::ArkoorReceive);

    // The change VTXO shows up in Alice's mailbox too and is not counted twice.
    alice.sync().expect("sync");
    assert_eq!(alice.offchain_balance().expect("balance").spendable, Amount::from_sat(60_000));

    let err = alice
        .send_arkoor_payment(&address.to_string(), Amount::from_sat(100_000))
        .unwrap_err();
    assert!(matches!(err, WalletError::InsufficientFunds { .. }));
}

#[test]
fn refresh_swaps_vtxos_in_a_round() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.boarded_wallet(dir.path(), TEST_MNEMONIC, 100_000);
    let old = wallet.vtxos(true).expect("vtxos")[0].id();

    let status = wallet
        .refresh_vtxos(RefreshMode::All)
        .expect("refresh")
        .expect("a round ran");
    assert!(status.success);
    assert_eq!(status.vtxos.len(), 1);
    assert_ne!(status.vtxos[0], old);

    assert_eq!(wallet.get_vtxo(old).expect("old").state, VtxoState::Spent);
    assert_eq!(wallet.offchain_balance().expect("balance").spendable, Amount::from_sat(100_000));
    assert_eq!(wallet.pending_rounds().expect("rounds").len(), 1);

    net.mine(1);
    wallet.sync().expect("sync");
    assert!(wallet.pending_rounds().expect("rounds").is_empty());

    // Nothing expires within the default threshold right after a round.
    assert!(wallet.refresh_vtxos(RefreshMode::DefaultThreshold).expect("refresh").is_none());
    assert!(wallet.maintenance().expect("maintenance").is_none());
}

#[test]
fn refresh_with_no_ids_is_invalid() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.boarded_wallet(dir.path(), TEST_MNEMONIC, 50_000);

    let err = wallet.refresh_vtxos(RefreshMode::Specific(vec![])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(wallet.offchain_balance().expect("balance").spendable, Amount::from_sat(50_000));
}

#[test]
fn rejected_round_rolls_back() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.boarded_wallet(dir.path(), TEST_MNEMONIC, 80_000);
    let id = wallet.vtxos(true).expect("vtxos")[0].id();

    net.server.inject_failure(InjectedFailure::RejectRound);
    let err = wallet.refresh_vtxos(RefreshMode::All).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    assert_eq!(wallet.get_vtxo(id).expect("vtxo").state, VtxoState::Spendable);
    assert_eq!(wallet.offchain_balance().expect("balance").spendable, Amount::from_sat(80_000));

    // The next round goes through.
    assert!(wallet.refresh_vtxos(RefreshMode::All).expect("refresh").is_some());
}

#[test]
fn round_lost_after_signing_starts_exit() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.boarded_wallet(dir.path(), TEST_MNEMONIC, 80_000);
    let id = wallet.vtxos(true).expect("vtxos")[0].id();

    net.server.inject_failure(InjectedFailure::DropRoundAfterSigning);
    let err = wallet.refresh_vtxos(RefreshMode::All).unwrap_err();
    assert!(err.is_retryable());

    assert_eq!(wallet.get_vtxo(id).expect("vtxo").state, VtxoState::PendingExit);
    let exits = wallet.exit_status().expect("exits");
    assert_eq!(exits.exits.len(), 1);
    assert_eq!(exits.exits[0].vtxo_id, id);
    assert_eq!(wallet.offchain_balance().expect("balance").pending_exit, Amount::from_sat(80_000));
}

#[test]
fn offboard_pays_onchain() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.boarded_wallet(dir.path(), TEST_MNEMONIC, 100_000);
    wallet.onchain_sync().expect("onchain sync");
    let before = wallet.onchain_balance().expect("onchain").total();

    let status = wallet.offboard_all(None).expect("offboard");
    assert!(status.success);
    assert!(status.vtxos.is_empty());
    assert_eq!(wallet.offchain_balance().expect("balance").spendable, Amount::ZERO);

    net.mine(1);
    wallet.onchain_sync().expect("onchain sync");
    let info = wallet.get_ark_info().expect("info");
    let fee = info.offboard_fee(&wallet.onchain_address().expect("address").script_pubkey());
    let after = wallet.onchain_balance().expect("onchain").total();
    assert_eq!(after, before + Amount::from_sat(100_000) - fee);

    let movement = wallet.movements().expect("movements").remove(0);
    assert_eq!(movement.kind, MovementKind::Offboard);
    assert_eq!(movement.fees, fee);

    let err = wallet.offboard_all(None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
}

#[test]
fn round_onchain_payment_keeps_change() {
    let net = Regtest::new();
    let (dir_a, dir_b) = (tempdir(), tempdir());
    let alice = net.boarded_wallet(dir_a.path(), TEST_MNEMONIC, 100_000);
    let bob = net.create_wallet(dir_b.path(), &OTHER_MNEMONIC);
    let destination = bob.onchain_address().expect("address");

    let status = alice
        .send_round_onchain_payment(&destination.to_string(), Amount::from_sat(30_000))
        .expect("round payment");
    assert!(status.success);
    assert_eq!(status.vtxos.len(), 1);

    let info = alice.get_ark_info().expect("info");
    let fee = info.offboard_fee(&destination.script_pubkey());
    let spendable = alice.offchain_balance().expect("balance").spendable;
    assert_eq!(spendable, Amount::from_sat(70_000) - fee);

    net.mine(1);
    bob.onchain_sync().expect("onchain sync");
    assert_eq!(bob.onchain_balance().expect("onchain").total(), Amount::from_sat(30_000));
}
