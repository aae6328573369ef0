//! bitcoind JSON-RPC backend, cookie or user/pass auth.

use bitcoin::{Amount, Block, BlockHash, FeeRate, Transaction, Txid};
use bitcoincore_rpc::jsonrpc;
use bitcoincore_rpc::{Auth, Client, RpcApi};
use tracing::debug;

use super::{with_retry, ChainError, ChainSource, TxStatus};
use crate::config::BitcoindAuth;
use crate::error::WalletError;

// bitcoind RPC error codes
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
const RPC_VERIFY_ERROR: i32 = -25;
const RPC_VERIFY_REJECTED: i32 = -26;
const RPC_VERIFY_ALREADY_IN_CHAIN: i32 = -27;

pub struct BitcoindClient {
    rpc: Client,
}

impl BitcoindClient {
    pub fn new(url: &str, auth: &BitcoindAuth) -> Result<Self, WalletError> {
        let auth = match auth {
            BitcoindAuth::Cookie(path) => Auth::CookieFile(path.clone()),
            BitcoindAuth::UserPass { user, pass } => Auth::UserPass(user.clone(), pass.clone()),
        };
        let rpc = Client::new(url, auth).map_err(|e| WalletError::Configuration(format!("RPC connect: {}", e)))?;
        Ok(Self { rpc })
    }
}

fn map_err(e: bitcoincore_rpc::Error) -> ChainError {
    match &e {
        bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Rpc(rpc)) => match rpc.code {
            RPC_INVALID_ADDRESS_OR_KEY => ChainError::NotFound(rpc.message.clone()),
            RPC_VERIFY_ERROR | RPC_VERIFY_REJECTED | RPC_VERIFY_ALREADY_IN_CHAIN => {
                ChainError::Rejected(rpc.message.clone())
            }
            _ => ChainError::Rejected(format!("{}: {}", rpc.code, rpc.message)),
        },
        bitcoincore_rpc::Error::JsonRpc(_) | bitcoincore_rpc::Error::Io(_) => ChainError::Transport(e.to_string()),
        _ => ChainError::Decode(e.to_string()),
    }
}

impl ChainSource for BitcoindClient {
    fn tip(&self) -> Result<u32, ChainError> {
        let count = with_retry("getblockcount", || self.rpc.get_block_count().map_err(map_err))?;
        u32::try_from(count).map_err(|e| ChainError::Decode(e.to_string()))
    }

    fn block_hash(&self, height: u32) -> Result<BlockHash, ChainError> {
        with_retry("getblockhash", || self.rpc.get_block_hash(height as u64).map_err(map_err))
    }

    fn block(&self, hash: &BlockHash) -> Result<Block, ChainError> {
        with_retry("getblock", || self.rpc.get_block(hash).map_err(map_err))
    }

    fn tx_status(&self, txid: &Txid) -> Result<TxStatus, ChainError> {
        let info = match with_retry("getrawtransaction", || self.rpc.get_raw_transaction_info(txid, None).map_err(map_err)) {
            Ok(info) => info,
            Err(ChainError::NotFound(_)) => return Ok(TxStatus::Unknown),
            Err(e) => return Err(e),
        };
        match info.blockhash {
            Some(block_hash) => {
                let header = with_retry("getblockheader", || self.rpc.get_block_header_info(&block_hash).map_err(map_err))?;
                let height = u32::try_from(header.height).map_err(|e| ChainError::Decode(e.to_string()))?;
                Ok(TxStatus::Confirmed { height, block_hash })
            }
            None => Ok(TxStatus::Mempool),
        }
    }

    fn broadcast(&self, tx: &Transaction) -> Result<(), ChainError> {
        match self.rpc.send_raw_transaction(tx) {
            Ok(txid) => {
                debug!(%txid, "Broadcast via bitcoind");
                Ok(())
            }
            Err(e) => match map_err(e) {
                ChainError::Rejected(msg) if msg.contains("already") => Ok(()),
                other => Err(other),
            },
        }
    }

    fn broadcast_package(&self, txs: &[Transaction]) -> Result<(), ChainError> {
        let hexes: Vec<String> = txs.iter().map(bitcoin::consensus::encode::serialize_hex).collect();
        let result: Result<serde_json::Value, _> = self.rpc.call("submitpackage", &[serde_json::json!(hexes)]);
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(error = %e, "submitpackage unavailable, broadcasting one by one");
                txs.iter().try_for_each(|tx| self.broadcast(tx))
            }
        }
    }

    fn mempool(&self) -> Result<Vec<Transaction>, ChainError> {
        let txids = with_retry("getrawmempool", || self.rpc.get_raw_mempool().map_err(map_err))?;
        let mut txs = Vec::with_capacity(txids.len());
        for txid in txids {
            // Evicted between the two calls
            match self.rpc.get_raw_transaction(&txid, None).map_err(map_err) {
                Ok(tx) => txs.push(tx),
                Err(ChainError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(txs)
    }

    fn fee_rate_estimate(&self, target_blocks: u16) -> Result<Option<FeeRate>, ChainError> {
        let estimate = with_retry("estimatesmartfee", || {
            self.rpc.estimate_smart_fee(target_blocks.max(1), None).map_err(map_err)
        })?;
        // BTC per kvB
        Ok(estimate.fee_rate.map(|per_kvb: Amount| FeeRate::from_sat_per_kwu(per_kvb.to_sat() / 4)))
    }
}
