//! Arkwallet: an Ark wallet engine. VTXOs, rounds, Lightning, exits.
//!
//! # Architecture
//!
//! ```text
//! Wallet (entry point, Clone + Send + Sync)
//!   │
//!   ├── KeyManager ─── mnemonic → m/350/i Ark keys, receive preimages
//!   │
//!   ├── VtxoLedger ─── VTXO states, balances, refresh selection
//!   │
//!   ├── OnchainWallet ─── BDK 2.x, onchain.db
//!   │
//!   ├── ArkServer (trait) ─── boards, arkoor, rounds, Lightning gateway
//!   │     └── LocalArkServer (in-process, regtest)
//!   │
//!   └── ChainSource (trait)
//!         ├── EsploraClient (`esplora`)
//!         ├── BitcoindClient (`bitcoind-rpc`)
//!         └── MockChain (in-memory)
//! ```
//!
//! # Operations
//!
//! | Area | Methods |
//! |------|---------|
//! | keys | `derive_store_next_keypair`, `peek_keypair`, `sign_message`, `verify_message` |
//! | ledger | `vtxos`, `get_expiring_vtxos`, `first_expiring_height`, `next_required_refresh_height` |
//! | onchain | `onchain_balance`, `onchain_address`, `onchain_send`, `onchain_drain`, `onchain_send_many` |
//! | ark | `board_amount`, `send_arkoor_payment`, `refresh_vtxos`, `offboard_specific`, `send_round_onchain_payment` |
//! | lightning | `bolt11_invoice`, `check_and_claim_ln_receive`, `pay_lightning_invoice`, `pay_lightning_address` |
//! | exit | `exit_start_specific`, `exit_progress_once`, `exit_status` |
//!
//! # Features
//!
//! - `esplora` - Esplora HTTP chain backend (default)
//! - `bitcoind-rpc` - bitcoind JSON-RPC chain backend
//!
//! # Usage
//!
//! ```ignore
//! use arkwallet::{Backends, Wallet, WalletConfig};
//!
//! let config = WalletConfig::signet()
//!     .with_server("ark.signet.example.com")
//!     .with_esplora("esplora.signet.example.com/api");
//! let backends = Backends::from_config(&config, server)?;
//! let (wallet, mnemonic) = Wallet::create_new("./wallet", config, backends)?;
//!
//! wallet.onchain_sync()?;
//! let board = wallet.board_amount(Amount::from_sat(100_000))?;
//! let balance = wallet.balance()?;
//! ```

pub mod address;
pub mod chain;
pub mod config;
pub mod error;
pub mod keys;
pub mod ledger;
pub mod lightning;
pub mod logging;
pub mod movement;
pub mod server;
pub mod vtxo;
pub mod wallet;

pub use address::ArkAddress;
pub use chain::{ChainError, ChainSource, MockChain, TxStatus};
pub use config::{BitcoindAuth, ChainConfig, Network, WalletConfig};
pub use error::{ErrorKind, LightningError, Result, WalletError};
pub use keys::{KeyManager, KeyPair, KeyPairView, MessageSignature};
pub use ledger::{OffchainBalance, RefreshMode, WalletVtxo};
pub use lightning::{
    Bolt11Receive, Invoice, LightningAddress, LightningReceive, LightningSendResult, Offer, PaymentDestination,
    PaymentHash, PaymentType, Preimage, SendStatus,
};
pub use movement::{Movement, MovementKind};
pub use server::{ArkInfo, ArkServer, InjectedFailure, LocalArkServer, LocalServerConfig, ServerError};
pub use vtxo::{Vtxo, VtxoId, VtxoPolicy, VtxoState};
pub use wallet::{
    ArkoorPayment, Backends, Balance, Board, ExitProgressStatus, ExitState, ExitStatus, LocalUtxo, OnchainBalance,
    PaymentReceipt, RoundStatus, Utxo, Wallet, WalletProperties,
};

pub use bitcoin::Amount;

/// Wallet-less helpers for hosts that only need keys.
pub fn create_mnemonic() -> Result<String> {
    keys::generate_mnemonic().map(|m| m.to_string())
}

pub use keys::{derive_keypair_from_mnemonic, sign_message_with_mnemonic};
