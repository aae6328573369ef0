//! Esplora REST backend (blocking reqwest).

use std::collections::HashMap;
use std::time::Duration;

use bitcoin::consensus::encode;
use bitcoin::{Block, BlockHash, FeeRate, Transaction, Txid};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{with_retry, ChainError, ChainSource, TxStatus};
use crate::error::WalletError;

const TIMEOUT: Duration = Duration::from_secs(30);

pub struct EsploraClient {
    base: String,
    http: Client,
}

#[derive(Deserialize)]
struct EsploraTxStatus {
    confirmed: bool,
    block_height: Option<u32>,
    block_hash: Option<BlockHash>,
}

impl EsploraClient {
    pub fn new(url: &str) -> Result<Self, WalletError> {
        let http = Client::builder()
            .timeout(TIMEOUT)
            .build()
            .map_err(|e| WalletError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { base: url.trim_end_matches('/').to_string(), http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn get(&self, path: &str) -> Result<Response, ChainError> {
        with_retry(path, || {
            let resp = self.http.get(self.url(path)).send().map_err(transport)?;
            check(resp)
        })
    }

    fn get_text(&self, path: &str) -> Result<String, ChainError> {
        self.get(path)?.text().map_err(transport)
    }

    fn post_text(&self, path: &str, body: String) -> Result<String, ChainError> {
        let resp = self.http.post(self.url(path)).body(body).send().map_err(transport)?;
        check(resp)?.text().map_err(transport)
    }
}

fn transport(e: reqwest::Error) -> ChainError {
    ChainError::Transport(e.to_string())
}

fn check(resp: Response) -> Result<Response, ChainError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => ChainError::NotFound(body),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => ChainError::Transport(format!("{}: {}", s, body)),
        _ => ChainError::Rejected(body),
    })
}

fn parse<T: std::str::FromStr>(s: &str) -> Result<T, ChainError>
where
    T::Err: std::fmt::Display,
{
    s.trim().parse().map_err(|e: T::Err| ChainError::Decode(e.to_string()))
}

impl ChainSource for EsploraClient {
    fn tip(&self) -> Result<u32, ChainError> {
        parse(&self.get_text("/blocks/tip/height")?)
    }

    fn block_hash(&self, height: u32) -> Result<BlockHash, ChainError> {
        parse(&self.get_text(&format!("/block-height/{}", height))?)
    }

    fn block(&self, hash: &BlockHash) -> Result<Block, ChainError> {
        let bytes = self.get(&format!("/block/{}/raw", hash))?.bytes().map_err(transport)?;
        encode::deserialize(&bytes).map_err(|e| ChainError::Decode(e.to_string()))
    }

    fn tx_status(&self, txid: &Txid) -> Result<TxStatus, ChainError> {
        let resp = match self.get(&format!("/tx/{}/status", txid)) {
            Ok(resp) => resp,
            Err(ChainError::NotFound(_)) => return Ok(TxStatus::Unknown),
            Err(e) => return Err(e),
        };
        let status: EsploraTxStatus = resp.json().map_err(|e| ChainError::Decode(e.to_string()))?;
        Ok(match (status.confirmed, status.block_height, status.block_hash) {
            (true, Some(height), Some(block_hash)) => TxStatus::Confirmed { height, block_hash },
            _ => TxStatus::Mempool,
        })
    }

    fn broadcast(&self, tx: &Transaction) -> Result<(), ChainError> {
        let txid = self.post_text("/tx", encode::serialize_hex(tx))?;
        debug!(txid = %txid.trim(), "Broadcast via esplora");
        Ok(())
    }

    fn broadcast_package(&self, txs: &[Transaction]) -> Result<(), ChainError> {
        let hexes: Vec<String> = txs.iter().map(encode::serialize_hex).collect();
        let body = serde_json::to_string(&hexes).map_err(|e| ChainError::Decode(e.to_string()))?;
        match self.post_text("/txs/package", body) {
            Ok(_) => Ok(()),
            // Older esplora deployments have no package endpoint
            Err(ChainError::NotFound(_)) => txs.iter().try_for_each(|tx| self.broadcast(tx)),
            Err(e) => Err(e),
        }
    }

    fn mempool(&self) -> Result<Vec<Transaction>, ChainError> {
        // Esplora only exposes the global mempool by txid; nothing wallet-scoped.
        Ok(Vec::new())
    }

    fn fee_rate_estimate(&self, target_blocks: u16) -> Result<Option<FeeRate>, ChainError> {
        let estimates: HashMap<String, f64> =
            self.get("/fee-estimates")?.json().map_err(|e| ChainError::Decode(e.to_string()))?;
        let best = estimates
            .iter()
            .filter_map(|(k, v)| k.parse::<u16>().ok().map(|t| (t, *v)))
            .filter(|(t, _)| *t <= target_blocks.max(1))
            .max_by_key(|(t, _)| *t)
            .map(|(_, v)| v);
        Ok(best.and_then(|sat_vb| FeeRate::from_sat_per_vb(sat_vb.ceil() as u64)))
    }
}
