//! Unilateral exits driven against the mock chain.

mod common;

use arkwallet::{Amount, ErrorKind, ExitProgressStatus, ExitState, MovementKind, VtxoState, Wallet, WalletError};
use common::{tempdir, Regtest, OTHER_MNEMONIC, TEST_MNEMONIC};

/// Mine one block per progress call until every exit is final.
fn drive_exits(net: &Regtest, wallet: &Wallet) -> ExitProgressStatus {
    for _ in 0..60 {
        net.mine(1);
        let status = wallet.exit_progress_once().expect("progress");
        if status.is_final() {
            return status;
        }
    }
    panic!("exits did not finish: {:?}", wallet.exit_status().expect("status"));
}

#[test]
fn board_exit_reaches_onchain_wallet() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.boarded_wallet(dir.path(), TEST_MNEMONIC, 200_000);
    let id = wallet.vtxos(true).expect("vtxos")[0].id();

    let started = wallet.exit_start_all().expect("exit start");
    assert_eq!(started, vec![id]);
    assert_eq!(wallet.get_vtxo(id).expect("vtxo").state, VtxoState::PendingExit);
    assert_eq!(wallet.offchain_balance().expect("balance").pending_exit, Amount::from_sat(200_000));

    // The exit tx went out right away.
    let status = wallet.exit_status().expect("status");
    assert_eq!(status.exits.len(), 1);
    assert!(matches!(status.exits[0].state, ExitState::Processing { .. }));

    let status = drive_exits(&net, &wallet);
    assert!(status.is_success());
    assert_eq!(status.claimed_amount(), Amount::from_sat(200_000));
    assert_eq!(wallet.get_vtxo(id).expect("vtxo").state, VtxoState::Spent);
    assert_eq!(wallet.offchain_balance().expect("balance").pending_exit, Amount::ZERO);

    // 680 wu at 2 sat/vB
    let claim_fee = Amount::from_sat(340);
    let utxos = wallet.onchain_list_unspent().expect("utxos");
    assert!(utxos.iter().any(|u| u.amount == Amount::from_sat(200_000) - claim_fee));

    let kinds: Vec<MovementKind> = wallet.movements().expect("movements").iter().map(|m| m.kind).collect();
    assert!(kinds.contains(&MovementKind::Exit));
}

#[test]
fn arkoor_vtxo_exits_through_its_chain() {
    let net = Regtest::new();
    let (dir_a, dir_b) = (tempdir(), tempdir());
    let alice = net.boarded_wallet(dir_a.path(), TEST_MNEMONIC, 100_000);
    let bob = net.create_wallet(dir_b.path(), &OTHER_MNEMONIC);

    let address = bob.new_address().expect("address").to_string();
    alice.send_arkoor_payment(&address, Amount::from_sat(40_000)).expect("arkoor");
    bob.sync().expect("sync");
    let id = bob.vtxos(true).expect("vtxos")[0].id();

    // Bob holds no onchain coins, so the exit txs go out without a CPFP child.
    bob.exit_start_specific(&[id]).expect("exit start");
    let status = bob.exit_status().expect("status");
    assert_eq!(status.exits[0].exit_depth, 2);

    let status = drive_exits(&net, &bob);
    assert!(status.is_success());
    bob.onchain_sync().expect("onchain sync");
    assert_eq!(bob.onchain_balance().expect("onchain").total(), Amount::from_sat(40_000 - 340));
}

#[test]
fn progress_without_exits_is_a_no_op() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.boarded_wallet(dir.path(), TEST_MNEMONIC, 50_000);
    let movements = wallet.movements().expect("movements").len();

    let first = wallet.exit_progress_once().expect("progress");
    let second = wallet.exit_progress_once().expect("progress");
    assert!(first.exits.is_empty());
    assert_eq!(first, second);
    assert!(first.is_final());
    assert_eq!(wallet.movements().expect("movements").len(), movements);
    assert_eq!(wallet.offchain_balance().expect("balance").spendable, Amount::from_sat(50_000));
}

#[test]
fn progress_after_finished_exits_is_a_no_op() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.boarded_wallet(dir.path(), TEST_MNEMONIC, 50_000);
    wallet.exit_start_all().expect("exit start");
    let done = drive_exits(&net, &wallet);
    assert!(done.is_success());
    let onchain = wallet.onchain_balance().expect("onchain");

    // Coins arriving later are only picked up by an explicit onchain sync.
    let address = wallet.onchain_address().expect("address");
    net.chain.fund(address.script_pubkey(), Amount::from_sat(77_000)).expect("fund");
    net.mine(1);

    let again = wallet.exit_progress_once().expect("progress");
    assert_eq!(again, done);
    assert_eq!(wallet.onchain_balance().expect("onchain"), onchain);

    wallet.onchain_sync().expect("onchain sync");
    assert_eq!(wallet.onchain_balance().expect("onchain").total(), onchain.total() + Amount::from_sat(77_000));
}

#[test]
fn exit_start_rejects_bad_selection() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.boarded_wallet(dir.path(), TEST_MNEMONIC, 50_000);
    let id = wallet.vtxos(true).expect("vtxos")[0].id();

    assert_eq!(wallet.exit_start_specific(&[]).unwrap_err().kind(), ErrorKind::InvalidArgument);

    wallet.exit_start_specific(&[id]).expect("exit start");
    assert!(wallet.exit_start_specific(&[id]).is_err());
    assert_eq!(wallet.exit_status().expect("status").exits.len(), 1);

    // Nothing left to exit.
    assert!(wallet.exit_start_all().expect("exit all").is_empty());
}

#[test]
fn sync_exits_follows_without_broadcasting() {
    let net = Regtest::new();
    let dir = tempdir();
    let wallet = net.boarded_wallet(dir.path(), TEST_MNEMONIC, 60_000);
    wallet.exit_start_all().expect("exit start");

    net.mine(1);
    let status = wallet.sync_exits().expect("sync exits");
    assert!(matches!(status.exits[0].state, ExitState::AwaitingDelta { .. }));

    // Past the timelock, a sync still never claims.
    net.mine(40);
    wallet.sync_exits().expect("sync exits");
    let status = wallet.sync_exits().expect("sync exits");
    assert_eq!(status.exits[0].state, ExitState::Claimable);
    assert!(!status.is_final());
}

#[test]
fn expired_vtxo_is_exited_on_sync() {
    let net = Regtest::new();
    let (dir_a, dir_b) = (tempdir(), tempdir());
    let alice = net.boarded_wallet(dir_a.path(), TEST_MNEMONIC, 100_000);
    let bob = net.create_wallet(dir_b.path(), &OTHER_MNEMONIC);
    let address = bob.new_address().expect("address").to_string();
    let vtxo = alice.vtxos(true).expect("vtxos")[0].clone();

    net.mine(vtxo.vtxo.expiry_height - net.chain.height() + 5);

    // Even before a sync, an expired VTXO is never picked as an input.
    let err = alice.send_arkoor_payment(&address, Amount::from_sat(10_000)).unwrap_err();
    assert!(matches!(err, WalletError::InsufficientFunds { .. }));
    assert_eq!(alice.get_vtxo(vtxo.id()).expect("vtxo").state, VtxoState::Spendable);

    alice.sync().expect("sync");
    assert_eq!(alice.get_vtxo(vtxo.id()).expect("vtxo").state, VtxoState::PendingExit);
    assert!(alice.vtxos(true).expect("vtxos").iter().all(|v| v.state != VtxoState::Spendable));
    let balance = alice.offchain_balance().expect("balance");
    assert_eq!(balance.spendable, Amount::ZERO);
    assert_eq!(balance.pending_exit, Amount::from_sat(100_000));

    let exits = alice.exit_status().expect("status");
    assert_eq!(exits.exits.len(), 1);
    assert_eq!(exits.exits[0].vtxo_id, vtxo.id());

    let status = drive_exits(&net, &alice);
    assert!(status.is_success());
}
