//! Unilateral exit: broadcast a VTXO's exit chain, wait out the relative
//! timelock, then sweep the output into the onchain wallet.
//!
//! ```text
//! Start ─► Processing{i} ─► AwaitingDelta ─► Claimable ─► Claimed ─► Confirmed
//!                 └──────────────┴───────────────┴──► Failed
//! ```
//!
//! Each call of [Wallet::exit_progress_once] moves every exit at most one
//! step and never waits for the chain.

use bitcoin::{Amount, Transaction, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::persist::WalletState;
use super::{Wallet, WalletInner};
use crate::chain::{ChainError, TxStatus};
use crate::error::{Result, WalletError};
use crate::movement::{MovementBuilder, MovementKind};
use crate::vtxo::tx::{claim_tx, claim_witness, sign_input, CLAIM_TX_WEIGHT};
use crate::vtxo::{Vtxo, VtxoId, VtxoPolicy, VtxoState};

/// Virtual size assumed for the CPFP child of an exit transaction.
const CPFP_CHILD_VBYTES: u64 = 150;

/// Outputs below this are not worth claiming.
const DUST_LIMIT: Amount = Amount::from_sat(330);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExitState {
    Start,
    /// Waiting for exit tx `tx_index` and its successors to confirm.
    Processing { tx_index: usize },
    AwaitingDelta { confirmed_height: u32, claimable_height: u32 },
    Claimable,
    Claimed { txid: Txid },
    Confirmed { txid: Txid, height: u32 },
    Failed { reason: String },
}

impl ExitState {
    pub fn is_final(&self) -> bool {
        matches!(self, ExitState::Confirmed { .. } | ExitState::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitEntry {
    pub vtxo: Vtxo,
    pub state: ExitState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub vtxo_id: VtxoId,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    pub state: ExitState,
    pub exit_depth: usize,
}

impl From<&ExitEntry> for ExitStatus {
    fn from(entry: &ExitEntry) -> Self {
        ExitStatus {
            vtxo_id: entry.vtxo.id(),
            amount: entry.vtxo.amount,
            state: entry.state.clone(),
            exit_depth: entry.vtxo.exit_depth(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitProgressStatus {
    pub exits: Vec<ExitStatus>,
}

impl ExitProgressStatus {
    /// True once no exit can make further progress.
    pub fn is_final(&self) -> bool {
        self.exits.iter().all(|e| e.state.is_final())
    }

    pub fn is_success(&self) -> bool {
        self.exits.iter().all(|e| matches!(e.state, ExitState::Confirmed { .. }))
    }

    /// Sum of exits that reached the onchain wallet.
    pub fn claimed_amount(&self) -> Amount {
        self.exits
            .iter()
            .filter(|e| matches!(e.state, ExitState::Confirmed { .. }))
            .map(|e| e.amount)
            .sum()
    }
}

/// Track `vtxos` as exiting. Their ledger state must already be PendingExit.
pub(crate) fn begin_exits(state: &mut WalletState, vtxos: &[Vtxo]) {
    let now = Utc::now();
    let mut started = Vec::new();
    for vtxo in vtxos {
        let id = vtxo.id();
        if state.exits.contains_key(&id) {
            continue;
        }
        state.exits.insert(
            id,
            ExitEntry { vtxo: vtxo.clone(), state: ExitState::Start, started_at: now, updated_at: now },
        );
        started.push((id, vtxo.amount));
    }
    if !started.is_empty() {
        state.movements.record(MovementBuilder::new(MovementKind::Exit).spends(started));
    }
}

impl Wallet {
    /// Start exiting the given VTXOs.
    pub fn exit_start_specific(&self, ids: &[VtxoId]) -> Result<Vec<VtxoId>> {
        if ids.is_empty() {
            return Err(WalletError::invalid("no vtxos given to exit"));
        }
        let _op = self.lock_op()?;
        self.exit_start(ids)
    }

    /// Start exiting every VTXO that is not already spent or exiting.
    pub fn exit_start_all(&self) -> Result<Vec<VtxoId>> {
        let _op = self.lock_op()?;
        let ids: Vec<VtxoId> = self.read(|s| {
            s.ledger
                .non_spent()
                .filter(|v| matches!(v.state, VtxoState::Spendable | VtxoState::HtlcLocked))
                .map(|v| v.id())
                .collect()
        })?;
        if ids.is_empty() {
            return Ok(ids);
        }
        self.exit_start(&ids)
    }

    fn exit_start(&self, ids: &[VtxoId]) -> Result<Vec<VtxoId>> {
        let vtxos = self.read(|s| s.ledger.collect(ids, &[VtxoState::Spendable, VtxoState::HtlcLocked]))??;
        let started: Vec<VtxoId> = vtxos.iter().map(|v| v.id()).collect();
        self.update(|s| {
            s.ledger.advance(&started, VtxoState::PendingExit)?;
            begin_exits(s, &vtxos);
            Ok(())
        })?;
        info!(count = started.len(), "Exits started");
        // Later progress calls retry whatever fails here.
        if let Err(e) = self.progress_exits(true) {
            warn!(error = %e, "Could not broadcast exit txs yet");
        }
        Ok(started)
    }

    /// Past its expiry the server may sweep a VTXO, so the only way left to
    /// recover it is an exit.
    pub(crate) fn exit_expired_locked(&self, tip: u32) -> Result<Vec<VtxoId>> {
        let ids: Vec<VtxoId> = self.read(|s| s.ledger.expired(tip).iter().map(|v| v.id()).collect())?;
        if ids.is_empty() {
            return Ok(ids);
        }
        warn!(count = ids.len(), tip, "Vtxos expired, exiting them");
        self.exit_start(&ids)
    }

    /// Move every exit one step forward, then sync the onchain wallet so
    /// claimed outputs show up. Without unfinished exits nothing is touched.
    pub fn exit_progress_once(&self) -> Result<ExitProgressStatus> {
        let _op = self.lock_op()?;
        let in_flight = self.read(|s| s.exits.values().any(|e| !e.state.is_final()))?;
        if !in_flight {
            return self.exit_status();
        }
        let status = self.progress_exits(true)?;
        self.onchain_sync_locked()?;
        Ok(status)
    }

    /// Follow the chain for every exit without broadcasting anything.
    pub fn sync_exits(&self) -> Result<ExitProgressStatus> {
        let _op = self.lock_op()?;
        self.sync_exits_locked()
    }

    pub(crate) fn sync_exits_locked(&self) -> Result<ExitProgressStatus> {
        self.progress_exits(false)
    }

    pub fn exit_status(&self) -> Result<ExitProgressStatus> {
        self.read(|s| ExitProgressStatus { exits: s.exits.values().map(ExitStatus::from).collect() })
    }

    fn progress_exits(&self, broadcast: bool) -> Result<ExitProgressStatus> {
        let inner = self.inner()?;
        let entries: Vec<ExitEntry> = self.read(|s| s.exits.values().filter(|e| !e.state.is_final()).cloned().collect())?;
        if entries.is_empty() {
            return self.exit_status();
        }
        let tip = inner.chain.tip()?;
        let fee_rate = if broadcast { Some(self.resolve_fee_rate(None)?) } else { None };

        for entry in entries {
            let id = entry.vtxo.id();
            let next = match self.exit_step(&inner, &entry, tip, fee_rate) {
                Ok(next) => next,
                Err(e) if e.is_retryable() => {
                    warn!(vtxo = %id, error = %e, "Exit step failed, will retry");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if next == entry.state {
                continue;
            }
            debug!(vtxo = %id, from = ?entry.state, to = ?next, "Exit progressed");
            self.update(|s| {
                if let ExitState::Confirmed { .. } = next {
                    s.ledger.advance(&[id], VtxoState::Spent)?;
                }
                if let Some(e) = s.exits.get_mut(&id) {
                    e.state = next.clone();
                    e.updated_at = Utc::now();
                }
                Ok(())
            })?;
            if let ExitState::Confirmed { txid, .. } = &next {
                info!(vtxo = %id, %txid, "Exit confirmed");
            }
        }
        self.exit_status()
    }

    /// One state transition. `fee_rate` is `None` when broadcasting is off.
    fn exit_step(&self, inner: &WalletInner, entry: &ExitEntry, tip: u32, fee_rate: Option<bitcoin::FeeRate>) -> Result<ExitState> {
        let vtxo = &entry.vtxo;
        match &entry.state {
            ExitState::Start | ExitState::Processing { .. } => {
                let mut last_height = 0;
                for (i, tx) in vtxo.exit_txs.iter().enumerate() {
                    match inner.chain.tx_status(&tx.compute_txid())? {
                        TxStatus::Confirmed { height, .. } => last_height = last_height.max(height),
                        TxStatus::Mempool => return Ok(ExitState::Processing { tx_index: i }),
                        TxStatus::Unknown => {
                            let Some(fee_rate) = fee_rate else {
                                return Ok(entry.state.clone());
                            };
                            return self.broadcast_exit_txs(inner, vtxo, i, fee_rate);
                        }
                    }
                }
                let claimable_height = last_height + vtxo.exit_delta as u32 + inner.config.vtxo_exit_margin as u32;
                Ok(ExitState::AwaitingDelta { confirmed_height: last_height, claimable_height })
            }
            ExitState::AwaitingDelta { claimable_height, .. } => {
                Ok(if tip >= *claimable_height { ExitState::Claimable } else { entry.state.clone() })
            }
            ExitState::Claimable => match fee_rate {
                Some(fee_rate) => self.claim_exit(inner, vtxo, tip, fee_rate),
                None => Ok(ExitState::Claimable),
            },
            ExitState::Claimed { txid } => match inner.chain.tx_status(txid)? {
                TxStatus::Confirmed { height, .. } => Ok(ExitState::Confirmed { txid: *txid, height }),
                TxStatus::Mempool => Ok(entry.state.clone()),
                TxStatus::Unknown => {
                    warn!(vtxo = %vtxo.id(), %txid, "Claim tx dropped, claiming again");
                    Ok(ExitState::Claimable)
                }
            },
            ExitState::Confirmed { .. } | ExitState::Failed { .. } => Ok(entry.state.clone()),
        }
    }

    /// Broadcast exit txs from `from` on, each with a CPFP child when the
    /// onchain wallet can pay for one.
    fn broadcast_exit_txs(&self, inner: &WalletInner, vtxo: &Vtxo, from: usize, fee_rate: bitcoin::FeeRate) -> Result<ExitState> {
        for tx in &vtxo.exit_txs[from..] {
            let txid = tx.compute_txid();
            if inner.chain.tx_status(&txid)? != TxStatus::Unknown {
                continue;
            }
            let fee = fee_rate
                .fee_vb(tx.vsize() as u64 + CPFP_CHILD_VBYTES)
                .unwrap_or(Amount::ZERO);
            let package: Vec<Transaction> = match inner.onchain.create_cpfp(tx, fee) {
                Ok(child) => vec![tx.clone(), child],
                Err(e) => {
                    debug!(%txid, error = %e, "No CPFP child, broadcasting bare");
                    vec![tx.clone()]
                }
            };
            match inner.chain.broadcast_package(&package) {
                Ok(()) => {
                    if let Some(child) = package.get(1) {
                        inner.onchain.mark_broadcast(child)?;
                    }
                    info!(vtxo = %vtxo.id(), %txid, "Exit tx broadcast");
                }
                Err(ChainError::Rejected(reason)) => {
                    if let Some(child) = package.get(1) {
                        inner.onchain.cancel(child)?;
                    }
                    warn!(vtxo = %vtxo.id(), %txid, %reason, "Exit tx rejected");
                    return Ok(ExitState::Failed { reason: format!("exit tx {} rejected: {}", txid, reason) });
                }
                Err(e) => {
                    if let Some(child) = package.get(1) {
                        inner.onchain.cancel(child)?;
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(ExitState::Processing { tx_index: from })
    }

    /// Sweep the exited output to a fresh onchain address.
    fn claim_exit(&self, inner: &WalletInner, vtxo: &Vtxo, tip: u32, fee_rate: bitcoin::FeeRate) -> Result<ExitState> {
        let state = self.snapshot()?;
        let preimage = match &vtxo.policy {
            VtxoPolicy::ServerHtlcSend { htlc_expiry, .. } if tip < *htlc_expiry => {
                debug!(vtxo = %vtxo.id(), htlc_expiry, "Htlc not expired yet");
                return Ok(ExitState::Claimable);
            }
            VtxoPolicy::ServerHtlcRecv { payment_hash, .. } => match state.receives.get(payment_hash) {
                Some(receive) => Some(receive.preimage),
                None => {
                    return Ok(ExitState::Failed { reason: format!("no preimage for payment {}", payment_hash) })
                }
            },
            _ => None,
        };

        let fee = fee_rate.fee_wu(CLAIM_TX_WEIGHT).unwrap_or(Amount::MAX_MONEY);
        let value = match vtxo.amount.checked_sub(fee) {
            Some(value) if value >= DUST_LIMIT => value,
            _ => {
                return Ok(ExitState::Failed {
                    reason: format!("vtxo of {} does not cover the claim fee {}", vtxo.amount, fee),
                })
            }
        };
        let destination = inner.onchain.address()?;
        let mut tx = claim_tx(vtxo.point, &vtxo.policy, vtxo.exit_delta, destination.script_pubkey(), value)?;
        let keypair = inner.keypair_for(&state, &vtxo.user_pubkey())?;
        let script = vtxo.witness_script();
        let sig = sign_input(inner.keys.secp(), &tx, 0, &script, vtxo.amount, keypair.secret_key())?;
        tx.input[0].witness = claim_witness(&sig, preimage.as_ref().map(|p| p.as_byte_array()), &script);

        let txid = tx.compute_txid();
        match inner.chain.broadcast(&tx) {
            Ok(()) => {
                inner.onchain.mark_broadcast(&tx)?;
                info!(vtxo = %vtxo.id(), %txid, %value, "Exit claim broadcast");
                Ok(ExitState::Claimed { txid })
            }
            Err(ChainError::Rejected(reason)) => {
                // Usually the relative timelock is not met yet.
                warn!(vtxo = %vtxo.id(), %txid, %reason, "Claim rejected");
                Ok(ExitState::Claimable)
            }
            Err(e) => Err(e.into()),
        }
    }
}
