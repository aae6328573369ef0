//! Onchain wallet: BIP84 BDK wallet with file-store persistence.
//!
//! Chain data comes block by block from the wallet's [ChainSource], so every
//! backend (esplora, bitcoind, the in-memory chain) feeds BDK the same way.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use bdk_wallet::chain::{BlockId, ChainPosition};
use bdk_wallet::file_store::Store as FileStore;
use bdk_wallet::template::Bip84;
use bdk_wallet::{ChangeSet, KeychainKind, PersistedWallet, SignOptions, Wallet as BdkWallet};
use bitcoin::bip32::Xpriv;
use bitcoin::psbt;
use bitcoin::{Address, Amount, FeeRate, OutPoint, ScriptBuf, Transaction, Txid, Weight};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::Wallet;
use crate::chain::ChainSource;
use crate::config::Network;
use crate::error::{Result, WalletError};
use crate::movement::{MovementBuilder, MovementKind};
use crate::vtxo::tx::P2A_SCRIPT;

const MAGIC: &[u8] = b"arkwallet-onchain";

type PersistedOnchain = PersistedWallet<FileStore<ChangeSet>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnchainBalance {
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub confirmed: Amount,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub trusted_pending: Amount,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub untrusted_pending: Amount,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub immature: Amount,
}

impl OnchainBalance {
    /// Confirmed plus our own unconfirmed change.
    pub fn spendable(&self) -> Amount {
        self.confirmed + self.trusted_pending
    }

    pub fn total(&self) -> Amount {
        self.confirmed + self.trusted_pending + self.untrusted_pending + self.immature
    }
}

/// A wallet output with its derivation details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUtxo {
    pub outpoint: OutPoint,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    pub address: Option<String>,
    pub is_change: bool,
    pub derivation_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    /// `None` while unconfirmed.
    pub confirmation_height: Option<u32>,
}

pub(crate) struct OnchainWallet {
    wallet: Mutex<PersistedOnchain>,
    db: Mutex<FileStore<ChangeSet>>,
    network: bitcoin::Network,
}

fn bdk_err(what: &str, e: impl std::fmt::Display) -> WalletError {
    WalletError::Storage(format!("{}: {}", what, e))
}

impl OnchainWallet {
    /// Load the BDK wallet at `db_path`, or create it for `seed`.
    pub fn open(seed: &[u8; 64], network: Network, db_path: &Path) -> Result<Self> {
        let network = network.to_bitcoin();
        let xprv = Xpriv::new_master(network, seed).map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
        let ext = Bip84(xprv, KeychainKind::External);
        let int = Bip84(xprv, KeychainKind::Internal);

        let mut db: FileStore<ChangeSet> =
            FileStore::load_or_create(MAGIC, db_path).map_err(|e| bdk_err("onchain store", e))?.0;

        // Stored descriptors must match the seed; extract_keys restores signing
        let loaded = BdkWallet::load()
            .descriptor(KeychainKind::External, Some(ext.clone()))
            .descriptor(KeychainKind::Internal, Some(int.clone()))
            .extract_keys()
            .check_network(network)
            .load_wallet(&mut db)
            .map_err(|e| bdk_err("load onchain wallet", e))?;

        let wallet = match loaded {
            Some(w) => w,
            None => BdkWallet::create(ext, int)
                .network(network)
                .create_wallet(&mut db)
                .map_err(|e| bdk_err("create onchain wallet", e))?,
        };

        Ok(Self { wallet: Mutex::new(wallet), db: Mutex::new(db), network })
    }

    fn lock(&self) -> Result<MutexGuard<'_, PersistedOnchain>> {
        self.wallet.lock().map_err(|_| WalletError::state("onchain wallet lock poisoned"))
    }

    fn persist(&self, wallet: &mut PersistedOnchain) -> Result<()> {
        let mut db = self.db.lock().map_err(|_| WalletError::state("onchain store lock poisoned"))?;
        wallet.persist(&mut *db).map_err(|e| bdk_err("persist onchain wallet", e))?;
        Ok(())
    }

    pub fn balance(&self) -> Result<OnchainBalance> {
        let b = self.lock()?.balance();
        Ok(OnchainBalance {
            confirmed: b.confirmed,
            trusted_pending: b.trusted_pending,
            untrusted_pending: b.untrusted_pending,
            immature: b.immature,
        })
    }

    pub fn address(&self) -> Result<Address> {
        let mut wallet = self.lock()?;
        let address = wallet.next_unused_address(KeychainKind::External).address;
        self.persist(&mut wallet)?;
        Ok(address)
    }

    /// A change script nobody has seen yet.
    pub fn change_script(&self) -> Result<ScriptBuf> {
        let mut wallet = self.lock()?;
        let script = wallet.next_unused_address(KeychainKind::Internal).address.script_pubkey();
        self.persist(&mut wallet)?;
        Ok(script)
    }

    pub fn list_unspent(&self) -> Result<Vec<LocalUtxo>> {
        let wallet = self.lock()?;
        Ok(wallet
            .list_unspent()
            .map(|utxo| LocalUtxo {
                outpoint: utxo.outpoint,
                amount: utxo.txout.value,
                address: Address::from_script(&utxo.txout.script_pubkey, self.network).ok().map(|a| a.to_string()),
                is_change: utxo.keychain == KeychainKind::Internal,
                derivation_index: utxo.derivation_index,
            })
            .collect())
    }

    pub fn utxos(&self) -> Result<Vec<Utxo>> {
        let wallet = self.lock()?;
        Ok(wallet
            .list_unspent()
            .map(|utxo| Utxo {
                outpoint: utxo.outpoint,
                amount: utxo.txout.value,
                confirmation_height: match utxo.chain_position {
                    ChainPosition::Confirmed { anchor, .. } => Some(anchor.block_id.height),
                    ChainPosition::Unconfirmed { .. } => None,
                },
            })
            .collect())
    }

    /// Whether `script` belongs to this wallet.
    pub fn is_mine(&self, script: &ScriptBuf) -> Result<bool> {
        Ok(self.lock()?.is_mine(script.clone()))
    }

    /// Catch up with `chain` from the last agreeing checkpoint, or from
    /// `birthday` on a fresh wallet. Returns the spendable balance.
    pub fn sync(&self, chain: &dyn ChainSource, birthday: u32) -> Result<Amount> {
        let tip = chain.tip()?;
        let mut wallet = self.lock()?;

        let mut cp = wallet.latest_checkpoint();
        let agree = loop {
            let id = cp.block_id();
            if id.height <= tip && chain.block_hash(id.height)? == id.hash {
                break id;
            }
            match cp.prev() {
                Some(prev) => cp = prev,
                None => {
                    let genesis = chain.block_hash(0)?;
                    break BlockId { height: 0, hash: genesis };
                }
            }
        };

        let start = (agree.height + 1).max(birthday);
        let mut connected_to = agree;
        for height in start..=tip {
            let hash = chain.block_hash(height)?;
            let block = chain.block(&hash)?;
            wallet
                .apply_block_connected_to(&block, height, connected_to)
                .map_err(|e| WalletError::Protocol(format!("apply block {}: {}", height, e)))?;
            connected_to = BlockId { height, hash };
        }

        let mempool = chain.mempool()?;
        let now = Utc::now().timestamp().max(0) as u64;
        wallet.apply_unconfirmed_txs(mempool.into_iter().map(|tx| (tx, now)));
        self.persist(&mut wallet)?;

        let balance = wallet.balance();
        debug!(tip, from = start, confirmed = %balance.confirmed, "Onchain synced");
        Ok(balance.confirmed + balance.trusted_pending)
    }

    /// Build and sign a tx paying `recipients`, draining everything to
    /// `drain_to` when given. Returns the tx with the miner fee it pays.
    pub fn create_tx(
        &self,
        recipients: &[(ScriptBuf, Amount)],
        drain_to: Option<ScriptBuf>,
        fee_rate: FeeRate,
    ) -> Result<(Transaction, Amount)> {
        let mut wallet = self.lock()?;
        let available = wallet.balance().confirmed + wallet.balance().trusted_pending;
        let mut builder = wallet.build_tx();
        for (script, amount) in recipients {
            builder.add_recipient(script.clone(), *amount);
        }
        if let Some(script) = drain_to {
            builder.drain_wallet().drain_to(script);
        }
        builder.fee_rate(fee_rate);
        let mut psbt = builder.finish().map_err(|e| {
            let needed: Amount = recipients.iter().map(|(_, a)| *a).sum();
            match e {
                bdk_wallet::error::CreateTxError::CoinSelection(_) => {
                    WalletError::InsufficientFunds { needed, available }
                }
                other => WalletError::Protocol(format!("build tx: {}", other)),
            }
        })?;
        #[allow(deprecated)]
        let finalized = wallet
            .sign(&mut psbt, SignOptions::default())
            .map_err(|e| WalletError::Protocol(format!("sign: {}", e)))?;
        if !finalized {
            return Err(WalletError::Protocol("onchain tx could not be finalized".into()));
        }
        let tx = psbt.extract_tx().map_err(|e| WalletError::Protocol(format!("extract: {}", e)))?;
        let fee = wallet
            .calculate_fee(&tx)
            .map_err(|e| WalletError::Protocol(format!("fee: {}", e)))?;
        self.persist(&mut wallet)?;
        Ok((tx, fee))
    }

    /// Child paying `fee` for `parent` through its pay-to-anchor output.
    pub fn create_cpfp(&self, parent: &Transaction, fee: Amount) -> Result<Transaction> {
        let vout = parent
            .output
            .iter()
            .position(|o| o.script_pubkey.as_bytes() == P2A_SCRIPT)
            .ok_or_else(|| WalletError::Protocol("transaction has no fee anchor".into()))?;
        let anchor = OutPoint::new(parent.compute_txid(), vout as u32);
        let input = psbt::Input {
            witness_utxo: Some(parent.output[vout].clone()),
            non_witness_utxo: Some(parent.clone()),
            final_script_witness: Some(bitcoin::Witness::new()),
            ..Default::default()
        };

        let mut wallet = self.lock()?;
        let change = wallet.next_unused_address(KeychainKind::Internal).address.script_pubkey();
        let mut builder = wallet.build_tx();
        builder
            .add_foreign_utxo(anchor, input, Weight::from_wu(4))
            .map_err(|e| WalletError::Protocol(format!("fee anchor: {}", e)))?;
        builder.version(3);
        builder.fee_absolute(fee);
        builder.drain_to(change);
        let mut psbt = builder.finish().map_err(|e| WalletError::Protocol(format!("cpfp: {}", e)))?;
        let options = SignOptions { trust_witness_utxo: true, ..Default::default() };
        #[allow(deprecated)]
        wallet.sign(&mut psbt, options).map_err(|e| WalletError::Protocol(format!("sign cpfp: {}", e)))?;
        let tx = psbt.extract_tx().map_err(|e| WalletError::Protocol(format!("extract cpfp: {}", e)))?;
        self.persist(&mut wallet)?;
        Ok(tx)
    }

    /// Record a broadcast tx so its outputs and spends show up before the
    /// next sync.
    pub fn mark_broadcast(&self, tx: &Transaction) -> Result<()> {
        let mut wallet = self.lock()?;
        let now = Utc::now().timestamp().max(0) as u64;
        wallet.apply_unconfirmed_txs([(tx.clone(), now)]);
        self.persist(&mut wallet)
    }

    /// Release the inputs of a tx that never made it out.
    pub fn cancel(&self, tx: &Transaction) -> Result<()> {
        let mut wallet = self.lock()?;
        wallet.cancel_tx(tx);
        self.persist(&mut wallet)
    }

    pub fn parse_address(&self, address: &str) -> Result<Address> {
        Address::from_str(address.trim())
            .map_err(|e| WalletError::invalid(format!("address: {}", e)))?
            .require_network(self.network)
            .map_err(|e| WalletError::invalid(format!("address network: {}", e)))
    }
}

impl Wallet {
    pub fn onchain_balance(&self) -> Result<OnchainBalance> {
        self.inner()?.onchain.balance()
    }

    pub fn onchain_address(&self) -> Result<Address> {
        self.inner()?.onchain.address()
    }

    pub fn onchain_list_unspent(&self) -> Result<Vec<LocalUtxo>> {
        self.inner()?.onchain.list_unspent()
    }

    pub fn onchain_utxos(&self) -> Result<Vec<Utxo>> {
        self.inner()?.onchain.utxos()
    }

    pub fn onchain_sync(&self) -> Result<Amount> {
        let _op = self.lock_op()?;
        self.onchain_sync_locked()
    }

    pub(crate) fn onchain_sync_locked(&self) -> Result<Amount> {
        let inner = self.inner()?;
        let birthday = inner.config.birthday_height.unwrap_or(0);
        inner.onchain.sync(inner.chain.as_ref(), birthday)
    }

    pub fn onchain_send(&self, destination: &str, amount: Amount, fee_rate: Option<u64>) -> Result<Txid> {
        if amount == Amount::ZERO {
            return Err(WalletError::invalid("amount must be positive"));
        }
        let address = self.inner()?.onchain.parse_address(destination)?;
        self.send_onchain(vec![(address, amount)], None, fee_rate)
    }

    /// Send everything the onchain wallet holds to `destination`.
    pub fn onchain_drain(&self, destination: &str, fee_rate: Option<u64>) -> Result<Txid> {
        let address = self.inner()?.onchain.parse_address(destination)?;
        self.send_onchain(Vec::new(), Some(address), fee_rate)
    }

    pub fn onchain_send_many(&self, outputs: &[(String, Amount)], fee_rate: Option<u64>) -> Result<Txid> {
        if outputs.is_empty() {
            return Err(WalletError::invalid("no outputs given"));
        }
        let inner = self.inner()?;
        let mut parsed = Vec::with_capacity(outputs.len());
        for (destination, amount) in outputs {
            if *amount == Amount::ZERO {
                return Err(WalletError::invalid(format!("zero amount for {}", destination)));
            }
            parsed.push((inner.onchain.parse_address(destination)?, *amount));
        }
        self.send_onchain(parsed, None, fee_rate)
    }

    fn send_onchain(&self, outputs: Vec<(Address, Amount)>, drain_to: Option<Address>, fee_rate: Option<u64>) -> Result<Txid> {
        let _op = self.lock_op()?;
        let inner = self.inner()?;
        let fee_rate = self.resolve_fee_rate(fee_rate)?;
        let recipients: Vec<(ScriptBuf, Amount)> = outputs.iter().map(|(a, v)| (a.script_pubkey(), *v)).collect();
        let (tx, fee) = inner.onchain.create_tx(&recipients, drain_to.as_ref().map(|a| a.script_pubkey()), fee_rate)?;
        let txid = tx.compute_txid();
        if let Err(e) = inner.chain.broadcast(&tx) {
            warn!(%txid, error = %e, "Onchain broadcast failed");
            inner.onchain.cancel(&tx)?;
            return Err(e.into());
        }
        inner.onchain.mark_broadcast(&tx)?;

        let mut movement = MovementBuilder::new(MovementKind::OnchainSend).txid(txid).fees(fee);
        for (address, amount) in &outputs {
            movement = movement.recipient(address.to_string(), *amount);
        }
        if let Some(address) = &drain_to {
            let drained = tx
                .output
                .iter()
                .filter(|o| o.script_pubkey == address.script_pubkey())
                .map(|o| o.value)
                .sum();
            movement = movement.recipient(address.to_string(), drained);
        }
        self.update(|state| {
            state.movements.record(movement);
            Ok(())
        })?;
        info!(%txid, outputs = tx.output.len(), "Onchain payment sent");
        Ok(txid)
    }
}
