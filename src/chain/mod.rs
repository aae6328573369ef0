//! Chain backends.
//!
//! The wallet only needs a handful of chain queries: the tip, blocks by
//! height for the onchain wallet, the status of its own transactions and a
//! way to broadcast. [ChainSource] captures exactly that, and every backend
//! is interchangeable behind an `Arc<dyn ChainSource>`.

#[cfg(feature = "bitcoind-rpc")]
mod bitcoind;
#[cfg(feature = "esplora")]
mod esplora;
mod mock;

use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Block, BlockHash, FeeRate, Transaction, Txid};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[cfg(feature = "bitcoind-rpc")]
pub use bitcoind::BitcoindClient;
#[cfg(feature = "esplora")]
pub use esplora::EsploraClient;
pub use mock::MockChain;

use crate::config::ChainConfig;
use crate::error::WalletError;

/// Attempts made for transient failures before giving up.
pub const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("chain backend unreachable: {0}")]
    Transport(String),
    #[error("rejected by the chain backend: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed backend response: {0}")]
    Decode(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transport(_))
    }
}

/// Where a transaction is, as far as the backend knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TxStatus {
    Unknown,
    Mempool,
    Confirmed { height: u32, block_hash: BlockHash },
}

impl TxStatus {
    pub fn confirmed_height(&self) -> Option<u32> {
        match self {
            TxStatus::Confirmed { height, .. } => Some(*height),
            _ => None,
        }
    }

    /// Confirmations at `tip`, zero while unconfirmed.
    pub fn confirmations(&self, tip: u32) -> u32 {
        self.confirmed_height().map(|h| tip.saturating_sub(h) + 1).unwrap_or(0)
    }
}

pub trait ChainSource: Send + Sync {
    /// Height of the best block.
    fn tip(&self) -> Result<u32, ChainError>;

    fn block_hash(&self, height: u32) -> Result<BlockHash, ChainError>;

    fn block(&self, hash: &BlockHash) -> Result<Block, ChainError>;

    fn tx_status(&self, txid: &Txid) -> Result<TxStatus, ChainError>;

    fn broadcast(&self, tx: &Transaction) -> Result<(), ChainError>;

    /// Submit parent and children together. Backends without package relay
    /// broadcast them one by one.
    fn broadcast_package(&self, txs: &[Transaction]) -> Result<(), ChainError> {
        for tx in txs {
            self.broadcast(tx)?;
        }
        Ok(())
    }

    /// Unconfirmed transactions the backend is willing to share.
    fn mempool(&self) -> Result<Vec<Transaction>, ChainError>;

    /// Fee rate for confirmation within `target_blocks`, if the backend has one.
    fn fee_rate_estimate(&self, target_blocks: u16) -> Result<Option<FeeRate>, ChainError>;
}

/// Run `f`, retrying transient failures with exponential backoff.
pub fn with_retry<T>(what: &str, mut f: impl FnMut() -> Result<T, ChainError>) -> Result<T, ChainError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = BACKOFF_BASE * 2u32.pow(attempt - 1);
                warn!(what, attempt, ?delay, error = %e, "Chain call failed, retrying");
                std::thread::sleep(delay);
            }
            Err(e) => {
                debug!(what, attempt, error = %e, "Chain call failed");
                return Err(e);
            }
        }
    }
}

/// Open the backend described by `config`.
pub fn connect(config: &ChainConfig) -> Result<Arc<dyn ChainSource>, WalletError> {
    match config {
        #[cfg(feature = "esplora")]
        ChainConfig::Esplora { url } => Ok(Arc::new(EsploraClient::new(url)?)),
        #[cfg(not(feature = "esplora"))]
        ChainConfig::Esplora { .. } => {
            Err(WalletError::Configuration("built without the esplora feature".into()))
        }
        #[cfg(feature = "bitcoind-rpc")]
        ChainConfig::Bitcoind { url, auth } => Ok(Arc::new(BitcoindClient::new(url, auth)?)),
        #[cfg(not(feature = "bitcoind-rpc"))]
        ChainConfig::Bitcoind { .. } => {
            Err(WalletError::Configuration("built without the bitcoind-rpc feature".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_retry_transient_then_ok() {
        let calls = Cell::new(0);
        let out = with_retry("test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 2 {
                Err(ChainError::Transport("refused".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(out, Ok(7));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_retry_gives_up() {
        let calls = Cell::new(0);
        let out: Result<(), _> = with_retry("test", || {
            calls.set(calls.get() + 1);
            Err(ChainError::Transport("down".into()))
        });
        assert!(out.is_err());
        assert_eq!(calls.get(), MAX_ATTEMPTS);
    }

    #[test]
    fn test_no_retry_on_rejection() {
        let calls = Cell::new(0);
        let out: Result<(), _> = with_retry("test", || {
            calls.set(calls.get() + 1);
            Err(ChainError::Rejected("bad".into()))
        });
        assert!(out.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_confirmations() {
        let hash = bitcoin::hashes::Hash::all_zeros();
        let status = TxStatus::Confirmed { height: 10, block_hash: hash };
        assert_eq!(status.confirmations(10), 1);
        assert_eq!(status.confirmations(15), 6);
        assert_eq!(TxStatus::Mempool.confirmations(15), 0);
    }
}
