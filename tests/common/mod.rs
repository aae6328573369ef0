//! Shared regtest fixture: one MockChain, one LocalArkServer, wallets in
//! temporary datadirs.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use arkwallet::logging::init_test_logging;
use arkwallet::{Amount, Backends, LocalArkServer, MockChain, Wallet, WalletConfig};
use once_cell::sync::Lazy;
use tempfile::TempDir;

// "abandon" x11 + "about" - well-known test vector
pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// Second wallet's mnemonic, generated once per test binary.
pub static OTHER_MNEMONIC: Lazy<String> =
    Lazy::new(|| arkwallet::create_mnemonic().expect("mnemonic generation"));

pub const FEE_RATE: u64 = 2;

pub struct Regtest {
    pub chain: Arc<MockChain>,
    pub server: Arc<LocalArkServer>,
}

impl Regtest {
    pub fn new() -> Self {
        init_test_logging();
        let chain = Arc::new(MockChain::new());
        let server = Arc::new(LocalArkServer::regtest(chain.clone()).expect("local server"));
        Self { chain, server }
    }

    pub fn backends(&self) -> Backends {
        Backends::new(self.server.clone(), self.chain.clone())
    }

    pub fn config(&self) -> WalletConfig {
        WalletConfig::regtest().with_server("local").with_fallback_fee_rate(FEE_RATE)
    }

    pub fn create_wallet(&self, dir: &Path, mnemonic: &str) -> Wallet {
        Wallet::create(dir, mnemonic, self.config(), self.backends()).expect("create wallet")
    }

    pub fn open_wallet(&self, dir: &Path, mnemonic: &str) -> Wallet {
        Wallet::open(dir, mnemonic, self.backends()).expect("open wallet")
    }

    pub fn mine(&self, blocks: u32) {
        self.chain.mine(blocks).expect("mine");
    }

    /// Faucet `sats` into the wallet's onchain address and confirm it.
    pub fn fund_onchain(&self, wallet: &Wallet, sats: u64) {
        let address = wallet.onchain_address().expect("address");
        self.chain.fund(address.script_pubkey(), Amount::from_sat(sats)).expect("fund");
        self.mine(1);
        wallet.onchain_sync().expect("onchain sync");
    }

    /// Fund, board `sats` and wait for the board to register.
    pub fn boarded_wallet(&self, dir: &Path, mnemonic: &str, sats: u64) -> Wallet {
        let wallet = self.create_wallet(dir, mnemonic);
        self.fund_onchain(&wallet, sats * 2 + 100_000);
        wallet.board_amount(Amount::from_sat(sats)).expect("board");
        self.mine(1);
        wallet.sync().expect("sync");
        wallet
    }
}

pub fn tempdir() -> TempDir {
    TempDir::new().expect("tempdir")
}
