//! The wallet handle.
//!
//! # Architecture
//!
//! ```text
//! Wallet (Clone, Send + Sync)
//!     │
//!     ├── op mutex ─── one mutating operation at a time
//!     │
//!     └── WalletInner
//!           ├── KeyManager ─── Ark keys, preimages
//!           ├── OnchainWallet ─── BDK + onchain.db
//!           ├── WalletState ─── ledger, movements, receives, exits (wallet.json)
//!           ├── ArkServer ─── board / arkoor / rounds / lightning
//!           └── ChainSource ─── esplora / bitcoind / mock
//! ```
//!
//! Mutations work on a copy of [WalletState] that is written to disk before
//! it replaces the in-memory state, so readers never see a half-applied
//! operation and a crash never loses a signed transaction.

mod arkoor;
mod board;
mod exit;
mod lightning;
mod onchain;
mod persist;
mod round;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use bip39::Mnemonic;
use bitcoin::ecdsa::Signature;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, FeeRate, Transaction, Txid};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use arkoor::ArkoorPayment;
pub use board::Board;
pub use exit::{ExitEntry, ExitProgressStatus, ExitState, ExitStatus};
pub use onchain::{LocalUtxo, OnchainBalance, Utxo};
pub use persist::WalletProperties;
pub use round::{RoundRecord, RoundStatus};

use self::onchain::OnchainWallet;
use self::persist::{DatadirLock, StateStore, WalletState, ONCHAIN_DB_FILE};
use crate::address::ArkAddress;
use crate::chain::ChainSource;
use crate::config::{Network, WalletConfig};
use crate::error::{Result, WalletError};
use crate::keys::{self, KeyManager, KeyPair, KeyPairView, MessageSignature};
use crate::ledger::{OffchainBalance, RefreshMode, WalletVtxo};
use crate::lightning::{LightningAddress, LightningSendResult, PaymentDestination};
use crate::movement::Movement;
use crate::server::{ArkInfo, ArkServer};
use crate::vtxo::tx::sign_input;
use crate::vtxo::{Vtxo, VtxoId};

/// Confirmation target for chain fee estimates.
const FEE_TARGET_BLOCKS: u16 = 6;

/// The two remote parties a wallet talks to.
#[derive(Clone)]
pub struct Backends {
    pub server: Arc<dyn ArkServer>,
    pub chain: Arc<dyn ChainSource>,
}

impl Backends {
    pub fn new(server: Arc<dyn ArkServer>, chain: Arc<dyn ChainSource>) -> Self {
        Self { server, chain }
    }

    /// Chain backend built from `config.chain`.
    pub fn from_config(config: &WalletConfig, server: Arc<dyn ArkServer>) -> Result<Self> {
        let chain = config
            .chain
            .as_ref()
            .ok_or_else(|| WalletError::Configuration("no chain backend configured".into()))?;
        Ok(Self { server, chain: crate::chain::connect(chain)? })
    }
}

/// Onchain and offchain balance together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub onchain: OnchainBalance,
    pub offchain: OffchainBalance,
}

/// Outcome of [Wallet::send_payment].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentReceipt {
    Arkoor(ArkoorPayment),
    Lightning(LightningSendResult),
    Onchain(Txid),
}

pub(crate) struct WalletInner {
    datadir: PathBuf,
    config: WalletConfig,
    keys: KeyManager,
    server: Arc<dyn ArkServer>,
    chain: Arc<dyn ChainSource>,
    onchain: OnchainWallet,
    store: StateStore,
    state: RwLock<WalletState>,
    _lock: DatadirLock,
}

impl WalletInner {
    /// Hand out the next Ark key and remember its index.
    fn new_keypair(&self, state: &mut WalletState) -> Result<KeyPair> {
        let index = state.next_key_index;
        let keypair = self.keys.derive_keypair(index)?;
        state.next_key_index += 1;
        state.known_keys.insert(keypair.public_key, index);
        Ok(keypair)
    }

    fn keypair_for(&self, state: &WalletState, pubkey: &PublicKey) -> Result<KeyPair> {
        let index = state
            .known_keys
            .get(pubkey)
            .ok_or_else(|| WalletError::NotFound(format!("no key for {}", pubkey)))?;
        self.keys.derive_keypair(*index)
    }

    /// Our signature on input 0 of `tx` spending `vtxo`.
    fn sign_vtxo_spend(&self, state: &WalletState, vtxo: &Vtxo, tx: &Transaction) -> Result<Signature> {
        let keypair = self.keypair_for(state, &vtxo.user_pubkey())?;
        sign_input(self.keys.secp(), tx, 0, &vtxo.witness_script(), vtxo.amount, keypair.secret_key())
    }

    fn is_ours(&self, state: &WalletState, vtxo: &Vtxo) -> bool {
        state.known_keys.contains_key(&vtxo.user_pubkey())
    }
}

struct Shared {
    op: Mutex<()>,
    inner: RwLock<Option<Arc<WalletInner>>>,
}

/// Handle to an open wallet. Clones share the same wallet.
#[derive(Clone)]
pub struct Wallet {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet").field("loaded", &self.is_loaded()).finish()
    }
}

impl Wallet {
    /// Create a wallet in an empty `datadir` from an existing mnemonic.
    pub fn create(datadir: impl AsRef<Path>, mnemonic: &str, config: WalletConfig, backends: Backends) -> Result<Self> {
        let mnemonic = keys::parse_mnemonic(mnemonic)?;
        Self::create_from(datadir.as_ref(), &mnemonic, config, backends)
    }

    /// Create a wallet with a freshly generated mnemonic, returned for backup.
    pub fn create_new(datadir: impl AsRef<Path>, config: WalletConfig, backends: Backends) -> Result<(Self, Mnemonic)> {
        let mnemonic = keys::generate_mnemonic()?;
        let wallet = Self::create_from(datadir.as_ref(), &mnemonic, config, backends)?;
        Ok((wallet, mnemonic))
    }

    fn create_from(datadir: &Path, mnemonic: &Mnemonic, config: WalletConfig, backends: Backends) -> Result<Self> {
        config.validate()?;
        let lock = DatadirLock::acquire(datadir)?;
        let store = StateStore::new(datadir);
        if store.exists() {
            return Err(WalletError::state(format!("a wallet already exists in {}", datadir.display())));
        }

        let info = backends.server.ark_info()?;
        if info.network != config.network {
            return Err(WalletError::Configuration(format!(
                "Ark server runs on {}, wallet is configured for {}",
                info.network.as_str(),
                config.network.as_str()
            )));
        }

        let keys = KeyManager::from_mnemonic(mnemonic, config.network)?;
        let onchain = OnchainWallet::open(keys.seed(), config.network, &datadir.join(ONCHAIN_DB_FILE))?;
        let properties = WalletProperties {
            network: config.network,
            fingerprint: keys.fingerprint().to_string(),
            created_at: Utc::now(),
        };
        let mut state = WalletState::new(properties, config.clone());
        state.ark_info = Some(info);
        state.tip = backends.chain.tip()?;
        store.save(&state)?;

        info!(datadir = %datadir.display(), network = config.network.as_str(), fingerprint = %keys.fingerprint(), "Wallet created");
        Ok(Self::from_inner(WalletInner {
            datadir: datadir.to_path_buf(),
            config,
            keys,
            server: backends.server,
            chain: backends.chain,
            onchain,
            store,
            state: RwLock::new(state),
            _lock: lock,
        }))
    }

    /// Open an existing wallet. Works offline; the server is first contacted
    /// on sync.
    pub fn open(datadir: impl AsRef<Path>, mnemonic: &str, backends: Backends) -> Result<Self> {
        let datadir = datadir.as_ref();
        let mnemonic = keys::parse_mnemonic(mnemonic)?;
        let lock = DatadirLock::acquire(datadir)?;
        let store = StateStore::new(datadir);
        if !store.exists() {
            return Err(WalletError::NotFound(format!("no wallet in {}", datadir.display())));
        }
        let state = store.load()?;
        let config = state.config.clone();
        let keys = KeyManager::from_mnemonic(&mnemonic, config.network)?;
        if keys.fingerprint().to_string() != state.properties.fingerprint {
            return Err(WalletError::invalid("mnemonic does not match this wallet"));
        }
        let onchain = OnchainWallet::open(keys.seed(), config.network, &datadir.join(ONCHAIN_DB_FILE))?;

        info!(datadir = %datadir.display(), vtxos = state.ledger.non_spent().count(), "Wallet opened");
        Ok(Self::from_inner(WalletInner {
            datadir: datadir.to_path_buf(),
            config,
            keys,
            server: backends.server,
            chain: backends.chain,
            onchain,
            store,
            state: RwLock::new(state),
            _lock: lock,
        }))
    }

    fn from_inner(inner: WalletInner) -> Self {
        Self {
            shared: Arc::new(Shared { op: Mutex::new(()), inner: RwLock::new(Some(Arc::new(inner))) }),
        }
    }

    /// Release the datadir. Every clone of this handle stops working.
    pub fn close(&self) -> Result<()> {
        let _op = self.lock_op()?;
        let mut slot = self.shared.inner.write().map_err(|_| WalletError::state("wallet lock poisoned"))?;
        match slot.take() {
            Some(inner) => {
                info!(datadir = %inner.datadir.display(), "Wallet closed");
                Ok(())
            }
            None => Err(WalletError::state("wallet is not loaded")),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.shared.inner.read().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub(crate) fn inner(&self) -> Result<Arc<WalletInner>> {
        self.shared
            .inner
            .read()
            .map_err(|_| WalletError::state("wallet lock poisoned"))?
            .clone()
            .ok_or_else(|| WalletError::state("wallet is not loaded"))
    }

    pub(crate) fn lock_op(&self) -> Result<MutexGuard<'_, ()>> {
        let guard = self.shared.op.lock().map_err(|_| WalletError::state("wallet operation lock poisoned"))?;
        if !self.is_loaded() {
            return Err(WalletError::state("wallet is not loaded"));
        }
        Ok(guard)
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&WalletState) -> T) -> Result<T> {
        let inner = self.inner()?;
        let state = inner.state.read().map_err(|_| WalletError::state("wallet state poisoned"))?;
        Ok(f(&state))
    }

    pub(crate) fn snapshot(&self) -> Result<WalletState> {
        self.read(|s| s.clone())
    }

    /// Persist `next`, then make it the live state. Caller holds the op lock.
    pub(crate) fn commit(&self, next: WalletState) -> Result<()> {
        let inner = self.inner()?;
        inner.store.save(&next)?;
        *inner.state.write().map_err(|_| WalletError::state("wallet state poisoned"))? = next;
        Ok(())
    }

    pub(crate) fn update<T>(&self, f: impl FnOnce(&mut WalletState) -> Result<T>) -> Result<T> {
        let mut next = self.snapshot()?;
        let out = f(&mut next)?;
        self.commit(next)?;
        Ok(out)
    }

    // ---- properties ----

    pub fn datadir(&self) -> Result<PathBuf> {
        Ok(self.inner()?.datadir.clone())
    }

    pub fn config(&self) -> Result<WalletConfig> {
        Ok(self.inner()?.config.clone())
    }

    pub fn network(&self) -> Result<Network> {
        Ok(self.inner()?.config.network)
    }

    pub fn properties(&self) -> Result<WalletProperties> {
        self.read(|s| s.properties.clone())
    }

    pub fn fingerprint(&self) -> Result<String> {
        Ok(self.inner()?.keys.fingerprint().to_string())
    }

    // ---- server & fees ----

    /// Server parameters, fetched once and cached. A refresh writes the
    /// state, so callers hold the op lock.
    pub(crate) fn server_info(&self) -> Result<ArkInfo> {
        if let Some(info) = self.read(|s| s.ark_info.clone())? {
            return Ok(info);
        }
        self.refresh_server_info()
    }

    fn refresh_server_info(&self) -> Result<ArkInfo> {
        let inner = self.inner()?;
        let info = inner.server.ark_info()?;
        if info.network != inner.config.network {
            return Err(WalletError::Configuration(format!(
                "Ark server switched to {}",
                info.network.as_str()
            )));
        }
        if self.read(|s| s.ark_info.as_ref() != Some(&info))? {
            let cached = info.clone();
            self.update(|s| {
                s.ark_info = Some(cached);
                Ok(())
            })?;
        }
        Ok(info)
    }

    /// Current server parameters. Falls back to the cached copy when the
    /// server is unreachable.
    pub fn get_ark_info(&self) -> Result<ArkInfo> {
        let _op = self.lock_op()?;
        match self.refresh_server_info() {
            Ok(info) => Ok(info),
            Err(e @ WalletError::Network(_)) => self.read(|s| s.ark_info.clone())?.ok_or(e),
            Err(e) => Err(e),
        }
    }

    /// Explicit rate, then `fallback_fee_rate`, then the chain's estimate.
    pub(crate) fn resolve_fee_rate(&self, explicit: Option<u64>) -> Result<FeeRate> {
        let inner = self.inner()?;
        if let Some(sat_vb) = explicit.or(inner.config.fallback_fee_rate) {
            return FeeRate::from_sat_per_vb(sat_vb)
                .filter(|r| *r > FeeRate::ZERO)
                .ok_or_else(|| WalletError::invalid(format!("invalid fee rate {} sat/vB", sat_vb)));
        }
        inner.chain.fee_rate_estimate(FEE_TARGET_BLOCKS)?.ok_or_else(|| {
            WalletError::Configuration("no fee rate given, no fallback_fee_rate and no chain estimate".into())
        })
    }

    // ---- keys ----

    /// Allocate the next Ark key. The index is persisted before returning.
    pub fn derive_store_next_keypair(&self) -> Result<KeyPairView> {
        let _op = self.lock_op()?;
        let inner = self.inner()?;
        self.update(|s| Ok(inner.new_keypair(s)?.peek()))
    }

    /// Key at `index`, without allocating it.
    pub fn peek_keypair(&self, index: u32) -> Result<KeyPairView> {
        Ok(self.inner()?.keys.derive_keypair(index)?.peek())
    }

    pub fn sign_message(&self, message: &str, index: u32) -> Result<MessageSignature> {
        self.inner()?.keys.sign_message(message, index)
    }

    /// `Ok(false)` for a well-formed signature that does not verify.
    pub fn verify_message(&self, message: &str, signature: &str, pubkey: &str) -> Result<bool> {
        let pubkey = keys::parse_pubkey(pubkey)?;
        bitcoin::secp256k1::ecdsa::Signature::from_str(signature.trim())
            .map_err(|e| WalletError::invalid(format!("signature: {}", e)))?;
        Ok(keys::verify_message(message, signature.trim(), &pubkey))
    }

    // ---- ledger queries ----

    pub fn offchain_balance(&self) -> Result<OffchainBalance> {
        self.read(|s| s.ledger.balance())
    }

    pub fn balance(&self) -> Result<Balance> {
        Ok(Balance { onchain: self.onchain_balance()?, offchain: self.offchain_balance()? })
    }

    /// Non-spent VTXOs. Syncs with the server first unless `no_sync`.
    pub fn vtxos(&self, no_sync: bool) -> Result<Vec<WalletVtxo>> {
        if !no_sync {
            self.sync()?;
        }
        self.read(|s| s.ledger.non_spent().cloned().collect())
    }

    /// Every VTXO the wallet ever held, spent ones included.
    pub fn all_vtxos(&self) -> Result<Vec<WalletVtxo>> {
        self.read(|s| s.ledger.all().cloned().collect())
    }

    pub fn get_vtxo(&self, id: VtxoId) -> Result<WalletVtxo> {
        self.read(|s| s.ledger.require(&id).cloned())?
    }

    /// Spendable VTXOs expiring within `threshold_blocks`, soonest first.
    pub fn get_expiring_vtxos(&self, threshold_blocks: u32) -> Result<Vec<WalletVtxo>> {
        let tip = self.tip()?;
        self.read(|s| s.ledger.expiring(tip, threshold_blocks).into_iter().cloned().collect())
    }

    pub fn first_expiring_height(&self) -> Result<Option<u32>> {
        self.read(|s| s.ledger.first_expiring_height())
    }

    pub fn next_required_refresh_height(&self) -> Result<Option<u32>> {
        let threshold = self.inner()?.config.vtxo_refresh_expiry_threshold;
        self.read(|s| s.ledger.next_required_refresh_height(threshold))
    }

    /// Newest first.
    pub fn movements(&self) -> Result<Vec<Movement>> {
        self.read(|s| s.movements.list())
    }

    /// Chain tip, falling back to the last synced height when the chain is
    /// unreachable.
    pub(crate) fn tip(&self) -> Result<u32> {
        match self.inner()?.chain.tip() {
            Ok(tip) => Ok(tip),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Using last synced tip");
                self.read(|s| s.tip)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ---- sync & maintenance ----

    /// Ark-side sync: tip, server info, mailbox, pending boards, Lightning
    /// and past rounds. The onchain wallet is left alone.
    pub fn sync(&self) -> Result<()> {
        let _op = self.lock_op()?;
        self.sync_locked()
    }

    pub(crate) fn sync_locked(&self) -> Result<()> {
        let inner = self.inner()?;
        let tip = inner.chain.tip()?;
        self.refresh_server_info()?;
        self.update(|s| {
            s.tip = tip;
            Ok(())
        })?;

        let received = self.sync_arkoor_mailbox_locked()?;
        let boarded = self.sync_pending_boards_locked()?;
        self.sync_lightning_locked();
        self.sync_past_rounds_locked()?;
        let expired = self.exit_expired_locked(tip)?;
        debug!(tip, received = received.len(), boarded = boarded.len(), expired = expired.len(), "Ark sync done");
        Ok(())
    }

    /// Sync, then refresh whatever is close to expiry.
    pub fn maintenance(&self) -> Result<Option<RoundStatus>> {
        let _op = self.lock_op()?;
        self.sync_locked()?;
        self.refresh_locked(RefreshMode::DefaultThreshold)
    }

    /// [Wallet::maintenance] plus onchain and exit sync.
    pub fn maintenance_with_onchain(&self) -> Result<Option<RoundStatus>> {
        let _op = self.lock_op()?;
        self.onchain_sync_locked()?;
        self.sync_locked()?;
        let status = self.refresh_locked(RefreshMode::DefaultThreshold)?;
        self.sync_exits_locked()?;
        Ok(status)
    }

    /// Refresh only, no sync.
    pub fn maintenance_refresh(&self) -> Result<Option<RoundStatus>> {
        let _op = self.lock_op()?;
        self.refresh_locked(RefreshMode::DefaultThreshold)
    }

    /// Pay any supported destination: Ark address or pubkey, BOLT11, BOLT12
    /// offer, Lightning address, LNURL or onchain address.
    pub fn send_payment(&self, destination: &str, amount: Option<Amount>) -> Result<PaymentReceipt> {
        let network = self.network()?;
        let need_amount = || amount.ok_or_else(|| WalletError::invalid("amount is required for this destination"));
        match PaymentDestination::parse(destination, network)? {
            PaymentDestination::Ark(_) | PaymentDestination::ArkPubkey(_) => {
                Ok(PaymentReceipt::Arkoor(self.send_arkoor_payment(destination, need_amount()?)?))
            }
            PaymentDestination::Bolt11(_) => Ok(PaymentReceipt::Lightning(self.pay_lightning_invoice(destination, amount)?)),
            PaymentDestination::Bolt12(_) => Ok(PaymentReceipt::Lightning(self.pay_lightning_offer(destination, amount)?)),
            PaymentDestination::LightningAddress(address) => Ok(PaymentReceipt::Lightning(
                self.pay_lightning_address(&address.to_string(), need_amount()?, None)?,
            )),
            PaymentDestination::Lnurl(url) => {
                let address = lnurlp_address(&url)?;
                Ok(PaymentReceipt::Lightning(self.pay_lightning_address(&address.to_string(), need_amount()?, None)?))
            }
            PaymentDestination::Onchain(address) => {
                Ok(PaymentReceipt::Onchain(self.onchain_send(&address.to_string(), need_amount()?, None)?))
            }
        }
    }

    /// Run `f` on tokio's blocking pool, for async hosts.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Wallet) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let wallet = self.clone();
        tokio::task::spawn_blocking(move || f(wallet))
            .await
            .map_err(|e| WalletError::state(format!("blocking task failed: {}", e)))?
    }
}

/// The Lightning address behind an LNURL-pay url of the well-known form.
fn lnurlp_address(url: &str) -> Result<LightningAddress> {
    let rest = url
        .strip_prefix("https://")
        .ok_or_else(|| WalletError::invalid("lnurl must use https"))?;
    let (domain, path) = rest.split_once('/').ok_or_else(|| WalletError::invalid("lnurl has no path"))?;
    let user = path
        .strip_prefix(".well-known/lnurlp/")
        .ok_or_else(|| WalletError::invalid("only lnurl-pay urls are supported"))?;
    LightningAddress::from_str(&format!("{}@{}", user, domain))
}

/// Check an Ark address against our network and server.
pub(crate) fn parse_ark_destination(destination: &str, network: Network, info: &ArkInfo) -> Result<PublicKey> {
    match PaymentDestination::parse(destination, network)? {
        PaymentDestination::Ark(address) => {
            address.check_for(network, &info.server_pubkey)?;
            Ok(address.user_pubkey())
        }
        PaymentDestination::ArkPubkey(pubkey) => Ok(pubkey),
        other => Err(WalletError::invalid(format!(
            "{:?} destination is not an Ark address",
            other.payment_type()
        ))),
    }
}

pub(crate) fn new_ark_address(network: Network, info: &ArkInfo, user: PublicKey) -> ArkAddress {
    ArkAddress::new(network, info.server_pubkey, user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lnurlp_address() {
        let address = lnurlp_address("https://example.com/.well-known/lnurlp/alice").unwrap();
        assert_eq!(address.to_string(), "alice@example.com");
        assert!(lnurlp_address("http://example.com/.well-known/lnurlp/alice").is_err());
        assert!(lnurlp_address("https://example.com/withdraw").is_err());
    }
}
