//! Datadir persistence: `wallet.json` state file and the `LOCK` guard.
//!
//! The whole wallet state is one JSON document, rewritten atomically
//! (temp file + rename) on every commit.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bitcoin::secp256k1::PublicKey;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::exit::ExitEntry;
use super::round::RoundRecord;
use crate::config::{Network, WalletConfig};
use crate::error::{Result, WalletError};
use crate::ledger::VtxoLedger;
use crate::lightning::{PaymentHash, ReceiveRecord, SendRecord};
use crate::movement::MovementLog;
use crate::server::ArkInfo;
use crate::vtxo::VtxoId;

pub const STATE_FILE: &str = "wallet.json";
pub const ONCHAIN_DB_FILE: &str = "onchain.db";
pub const LOCK_FILE: &str = "LOCK";

const STATE_VERSION: u32 = 1;

/// Immutable facts fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletProperties {
    pub network: Network,
    /// Master fingerprint of the mnemonic the wallet was created with.
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WalletState {
    pub version: u32,
    pub properties: WalletProperties,
    pub config: WalletConfig,
    pub next_key_index: u32,
    /// Index of every Ark key handed out so far.
    pub known_keys: BTreeMap<PublicKey, u32>,
    pub next_receive_index: u32,
    /// Chain tip seen by the last sync.
    pub tip: u32,
    pub ark_info: Option<ArkInfo>,
    pub ledger: VtxoLedger,
    pub movements: MovementLog,
    pub receives: BTreeMap<PaymentHash, ReceiveRecord>,
    pub sends: BTreeMap<PaymentHash, SendRecord>,
    pub exits: BTreeMap<VtxoId, ExitEntry>,
    pub rounds: BTreeMap<u64, RoundRecord>,
}

impl WalletState {
    pub fn new(properties: WalletProperties, config: WalletConfig) -> Self {
        Self {
            version: STATE_VERSION,
            properties,
            config,
            next_key_index: 0,
            known_keys: BTreeMap::new(),
            next_receive_index: 0,
            tip: 0,
            ark_info: None,
            ledger: VtxoLedger::default(),
            movements: MovementLog::default(),
            receives: BTreeMap::new(),
            sends: BTreeMap::new(),
            exits: BTreeMap::new(),
            rounds: BTreeMap::new(),
        }
    }
}

/// Reads and writes `wallet.json`.
pub(crate) struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(datadir: &Path) -> Self {
        Self { path: datadir.join(STATE_FILE) }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<WalletState> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| WalletError::Storage(format!("read {}: {}", self.path.display(), e)))?;
        let state: WalletState = serde_json::from_str(&raw)?;
        if state.version != STATE_VERSION {
            return Err(WalletError::Storage(format!(
                "unsupported state version {} (expected {})",
                state.version, STATE_VERSION
            )));
        }
        Ok(state)
    }

    pub fn save(&self, state: &WalletState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "State saved");
        Ok(())
    }
}

static OPEN_DATADIRS: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive claim on a datadir for the lifetime of a wallet handle.
///
/// Inside the process the registry refuses a second handle. Across
/// processes the `LOCK` file carries an OS advisory lock, released by the
/// kernel if the owner dies, so a leftover file from a crash is reused.
#[derive(Debug)]
pub(crate) struct DatadirLock {
    datadir: PathBuf,
    file: File,
}

impl DatadirLock {
    pub fn acquire(datadir: &Path) -> Result<Self> {
        std::fs::create_dir_all(datadir)?;
        let datadir = datadir.canonicalize()?;
        {
            let mut open = OPEN_DATADIRS.lock().map_err(|_| WalletError::state("datadir registry poisoned"))?;
            if !open.insert(datadir.clone()) {
                return Err(WalletError::state(format!("datadir {} is already open", datadir.display())));
            }
        }
        match Self::lock_file(&datadir) {
            Ok(file) => Ok(Self { datadir, file }),
            Err(e) => {
                Self::unregister(&datadir);
                Err(e)
            }
        }
    }

    fn lock_file(datadir: &Path) -> Result<File> {
        let lock_path = datadir.join(LOCK_FILE);
        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&lock_path)?;
        if file.try_lock_exclusive().is_err() {
            let mut owner = String::new();
            let _ = file.read_to_string(&mut owner);
            return Err(WalletError::state(format!(
                "datadir {} is locked by process {}",
                datadir.display(),
                owner.trim()
            )));
        }
        let mut previous = String::new();
        if file.read_to_string(&mut previous).is_ok() && !previous.trim().is_empty() {
            warn!(pid = %previous.trim(), "Reusing datadir lock left by a dead process");
        }
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(file)
    }

    pub fn is_held(datadir: &Path) -> bool {
        let Ok(path) = datadir.canonicalize() else {
            return false;
        };
        OPEN_DATADIRS.lock().map(|open| open.contains(&path)).unwrap_or(false)
    }

    fn unregister(datadir: &Path) {
        if let Ok(mut open) = OPEN_DATADIRS.lock() {
            open.remove(datadir);
        }
    }
}

impl Drop for DatadirLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.datadir.join(LOCK_FILE));
        let _ = FileExt::unlock(&self.file);
        Self::unregister(&self.datadir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> WalletState {
        let props = WalletProperties {
            network: Network::Regtest,
            fingerprint: "deadbeef".into(),
            created_at: Utc::now(),
        };
        WalletState::new(props, WalletConfig::regtest().with_server("http://127.0.0.1:3535"))
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(!store.exists());

        let mut s = state();
        s.next_key_index = 7;
        s.tip = 120;
        store.save(&s).unwrap();
        assert!(store.exists());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.next_key_index, 7);
        assert_eq!(loaded.tip, 120);
        assert_eq!(loaded.properties, s.properties);
        assert!(!dir.path().join("wallet.json.tmp").exists());
    }

    #[test]
    fn test_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut s = state();
        s.version = 99;
        store.save(&s).unwrap();
        assert!(matches!(store.load(), Err(WalletError::Storage(_))));
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DatadirLock::acquire(dir.path()).unwrap();
        assert!(dir.path().join(LOCK_FILE).exists());
        assert!(DatadirLock::is_held(dir.path()));
        assert!(DatadirLock::acquire(dir.path()).is_err());

        drop(lock);
        assert!(!dir.path().join(LOCK_FILE).exists());
        assert!(DatadirLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_stale_lock_file_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LOCK_FILE), "12345").unwrap();
        let _lock = DatadirLock::acquire(dir.path()).unwrap();
        let pid = std::fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(pid, std::process::id().to_string());
    }

    #[test]
    fn test_live_lock_file_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        std::fs::write(&path, "4242").unwrap();
        let other = File::open(&path).unwrap();
        other.try_lock_exclusive().unwrap();

        let err = DatadirLock::acquire(dir.path()).unwrap_err();
        assert!(err.to_string().contains("4242"));
        assert!(!DatadirLock::is_held(dir.path()));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4242");

        FileExt::unlock(&other).unwrap();
        let lock = DatadirLock::acquire(dir.path()).unwrap();
        let outside = File::open(&path).unwrap();
        assert!(outside.try_lock_exclusive().is_err());
        drop(lock);
    }
}
