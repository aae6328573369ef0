//! Round participation: refresh, offboard and round onchain payments.
//!
//! ```text
//! inputs Spendable ──► PendingInRound ──submit──► proposal
//!                                                   │ sign leaves + forfeits
//!                                                   ▼
//!                 Spent + new VTXOs ◄──finish── Signing
//! ```
//!
//! A rejected round rolls the inputs back to Spendable. A round that was
//! lost after our forfeits left the wallet cannot be trusted to roll back,
//! so its inputs go to PendingExit instead.

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, ScriptBuf, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::persist::WalletState;
use super::Wallet;
use crate::error::{Result, WalletError};
use crate::ledger::RefreshMode;
use crate::movement::{MovementBuilder, MovementKind};
use crate::server::{OffboardRequest, RoundProposal, RoundRequest, RoundSignatures, RoundState};
use crate::vtxo::tx::{anchor_script, p2wsh, sign_input, vtxo_txout};
use crate::vtxo::{Vtxo, VtxoId, VtxoPolicy, VtxoPolicyKind, VtxoRequest, VtxoState};

/// A round this wallet took part in, kept until its tx is deep enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round_id: u64,
    pub round_txid: Option<Txid>,
    pub state: RoundState,
    pub inputs: Vec<VtxoId>,
    pub vtxos: Vec<VtxoId>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a round, returned to the caller and not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStatus {
    pub status: String,
    pub round_id: Option<u64>,
    pub funding_txids: Vec<Txid>,
    pub success: bool,
    pub error: Option<String>,
    pub vtxos: Vec<VtxoId>,
}

/// Everything needed to run one round on behalf of the wallet.
struct RoundPlan {
    inputs: Vec<Vtxo>,
    vtxo_requests: Vec<VtxoRequest>,
    offboards: Vec<OffboardRequest>,
    movement: MovementBuilder,
}

impl Wallet {
    /// Swap the selected VTXOs for fresh ones. `Ok(None)` when nothing
    /// matches the mode.
    pub fn refresh_vtxos(&self, mode: RefreshMode) -> Result<Option<RoundStatus>> {
        let _op = self.lock_op()?;
        self.refresh_locked(mode)
    }

    pub(crate) fn refresh_locked(&self, mode: RefreshMode) -> Result<Option<RoundStatus>> {
        let inner = self.inner()?;
        let tip = self.tip()?;
        let mut state = self.snapshot()?;
        let inputs = state
            .ledger
            .select_for_refresh(&mode, tip, inner.config.vtxo_refresh_expiry_threshold)?;
        if inputs.is_empty() {
            debug!(?mode, "Nothing to refresh");
            return Ok(None);
        }
        let total: Amount = inputs.iter().map(|v| v.amount).sum();
        let keypair = inner.new_keypair(&mut state)?;
        let movement = MovementBuilder::new(MovementKind::Refresh)
            .spends(inputs.iter().map(|v| (v.id(), v.amount)));
        let plan = RoundPlan {
            inputs,
            vtxo_requests: vec![VtxoRequest { policy: VtxoPolicy::new_pubkey(keypair.public_key), amount: total }],
            offboards: Vec::new(),
            movement,
        };
        info!(?mode, %total, "Refreshing vtxos");
        self.participate_round(state, plan).map(Some)
    }

    /// Offboard the given VTXOs to `destination`, or to a fresh address of
    /// the onchain wallet.
    pub fn offboard_specific(&self, ids: &[VtxoId], destination: Option<&str>) -> Result<RoundStatus> {
        if ids.is_empty() {
            return Err(WalletError::invalid("no vtxos given to offboard"));
        }
        let _op = self.lock_op()?;
        self.offboard(ids.to_vec(), destination)
    }

    /// Offboard every spendable VTXO.
    pub fn offboard_all(&self, destination: Option<&str>) -> Result<RoundStatus> {
        let _op = self.lock_op()?;
        let tip = self.tip()?;
        let ids: Vec<VtxoId> = self.read(|s| s.ledger.usable(tip).map(|v| v.id()).collect())?;
        if ids.is_empty() {
            return Err(WalletError::InsufficientFunds { needed: Amount::ONE_SAT, available: Amount::ZERO });
        }
        self.offboard(ids, destination)
    }

    fn offboard(&self, ids: Vec<VtxoId>, destination: Option<&str>) -> Result<RoundStatus> {
        let inner = self.inner()?;
        let info = self.server_info()?;
        let address = match destination {
            Some(d) => inner.onchain.parse_address(d)?,
            None => inner.onchain.address()?,
        };
        let state = self.snapshot()?;
        let inputs = state.ledger.collect(&ids, &[VtxoState::Spendable])?;
        if let Some(htlc) = inputs.iter().find(|v| v.policy.kind() != VtxoPolicyKind::Pubkey) {
            return Err(WalletError::invalid(format!("vtxo {} is an htlc and cannot be offboarded", htlc.id())));
        }
        let tip = self.tip()?;
        if let Some(expired) = inputs.iter().find(|v| v.is_expired(tip)) {
            return Err(WalletError::invalid(format!("vtxo {} expired at height {}", expired.id(), expired.expiry_height)));
        }
        let total: Amount = inputs.iter().map(|v| v.amount).sum();
        let script_pubkey = address.script_pubkey();
        let fee = info.offboard_fee(&script_pubkey);
        if total <= fee {
            return Err(WalletError::InsufficientFunds { needed: fee + Amount::ONE_SAT, available: total });
        }
        let amount = total - fee;
        let movement = MovementBuilder::new(MovementKind::Offboard)
            .spends(inputs.iter().map(|v| (v.id(), v.amount)))
            .recipient(address.to_string(), amount)
            .fees(fee);
        let plan = RoundPlan {
            inputs,
            vtxo_requests: Vec::new(),
            offboards: vec![OffboardRequest { script_pubkey, amount }],
            movement,
        };
        info!(%address, %amount, %fee, "Offboarding");
        self.participate_round(state, plan)
    }

    /// Pay an onchain address from VTXOs through a round.
    pub fn send_round_onchain_payment(&self, destination: &str, amount: Amount) -> Result<RoundStatus> {
        if amount == Amount::ZERO {
            return Err(WalletError::invalid("amount must be positive"));
        }
        let _op = self.lock_op()?;
        let inner = self.inner()?;
        let info = self.server_info()?;
        let address = inner.onchain.parse_address(destination)?;
        let script_pubkey: ScriptBuf = address.script_pubkey();
        let fee = info.offboard_fee(&script_pubkey);

        let tip = self.tip()?;
        let mut state = self.snapshot()?;
        let inputs = state.ledger.select_inputs(amount + fee, tip)?;
        let total: Amount = inputs.iter().map(|v| v.amount).sum();
        let change = total - amount - fee;
        let mut vtxo_requests = Vec::new();
        let movement = MovementBuilder::new(MovementKind::RoundOnchain)
            .spends(inputs.iter().map(|v| (v.id(), v.amount)))
            .recipient(address.to_string(), amount)
            .fees(fee);
        if change > Amount::ZERO {
            let keypair = inner.new_keypair(&mut state)?;
            vtxo_requests.push(VtxoRequest { policy: VtxoPolicy::new_pubkey(keypair.public_key), amount: change });
        }
        let plan = RoundPlan {
            inputs,
            vtxo_requests,
            offboards: vec![OffboardRequest { script_pubkey, amount }],
            movement,
        };
        self.participate_round(state, plan)
    }

    fn participate_round(&self, mut state: WalletState, plan: RoundPlan) -> Result<RoundStatus> {
        let inner = self.inner()?;
        let info = self.server_info()?;
        let input_ids: Vec<VtxoId> = plan.inputs.iter().map(|v| v.id()).collect();
        state.ledger.advance(&input_ids, VtxoState::PendingInRound)?;
        self.commit(state)?;

        let request = RoundRequest {
            inputs: plan.inputs.clone(),
            vtxo_requests: plan.vtxo_requests.clone(),
            offboards: plan.offboards.clone(),
        };
        let proposal = match inner.server.submit_round(request) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Round submission failed");
                self.update(|s| s.ledger.roll_back(&input_ids, VtxoState::Spendable))?;
                return Err(e.into());
            }
        };
        let round_id = proposal.round_id;

        let signed = check_proposal(&plan, &proposal, &info.server_pubkey, info.vtxo_exit_delta).and_then(|()| {
            let state = self.snapshot()?;
            let mut leaf_sigs = Vec::with_capacity(proposal.leaves.len());
            for (leaf, req) in proposal.leaves.iter().zip(&plan.vtxo_requests) {
                let user = req.policy.user_pubkey();
                let keypair = inner.keypair_for(&state, &user)?;
                let script = anchor_script(&user, &info.server_pubkey, proposal.expiry_height);
                leaf_sigs.push(sign_input(inner.keys.secp(), leaf, 0, &script, req.amount, keypair.secret_key())?);
            }
            let mut forfeit_sigs = Vec::with_capacity(proposal.forfeits.len());
            for (forfeit, input) in proposal.forfeits.iter().zip(&plan.inputs) {
                forfeit_sigs.push(inner.sign_vtxo_spend(&state, input, forfeit)?);
            }
            Ok(RoundSignatures { leaf_sigs, forfeit_sigs })
        });
        let sigs = match signed {
            Ok(sigs) => sigs,
            Err(e) => {
                warn!(round_id, error = %e, "Refusing round proposal");
                self.update(|s| {
                    s.ledger.roll_back(&input_ids, VtxoState::Spendable)?;
                    s.rounds.insert(round_id, failed_record(round_id, &input_ids));
                    Ok(())
                })?;
                return Err(e);
            }
        };

        self.update(|s| {
            s.rounds.insert(
                round_id,
                RoundRecord {
                    round_id,
                    round_txid: None,
                    state: RoundState::Signing,
                    inputs: input_ids.clone(),
                    vtxos: Vec::new(),
                    created_at: Utc::now(),
                },
            );
            Ok(())
        })?;

        let result = inner.server.finish_round(round_id, sigs).map_err(WalletError::from).and_then(|result| {
            inner.check_server_vtxos(&result.vtxos)?;
            let matches = result.vtxos.len() == plan.vtxo_requests.len()
                && result
                    .vtxos
                    .iter()
                    .zip(&plan.vtxo_requests)
                    .all(|(v, r)| v.amount == r.amount && v.policy == r.policy);
            if !matches {
                return Err(WalletError::Protocol("round returned vtxos that were not requested".into()));
            }
            Ok(result)
        });

        match result {
            Ok(result) => {
                let new_ids: Vec<VtxoId> = result.vtxos.iter().map(|v| v.id()).collect();
                self.update(|s| {
                    s.ledger.advance(&input_ids, VtxoState::Spent)?;
                    for vtxo in &result.vtxos {
                        s.ledger.insert(vtxo.clone(), VtxoState::Spendable, false)?;
                    }
                    let movement = plan
                        .movement
                        .receives(result.vtxos.iter().map(|v| (v.id(), v.amount)))
                        .txid(result.round_txid);
                    s.movements.record(movement);
                    if let Some(record) = s.rounds.get_mut(&round_id) {
                        record.round_txid = Some(result.round_txid);
                        record.state = RoundState::Broadcasting;
                        record.vtxos = new_ids.clone();
                    }
                    Ok(())
                })?;
                info!(round_id, txid = %result.round_txid, vtxos = new_ids.len(), "Round succeeded");
                Ok(RoundStatus {
                    status: RoundState::Broadcasting.as_str().to_string(),
                    round_id: Some(round_id),
                    funding_txids: vec![result.round_txid],
                    success: true,
                    error: None,
                    vtxos: new_ids,
                })
            }
            Err(WalletError::Network(msg)) => {
                // Our forfeits are out there; only an exit is safe now.
                warn!(round_id, error = %msg, "Round lost after signing, exiting inputs");
                self.update(|s| {
                    s.ledger.advance(&input_ids, VtxoState::PendingExit)?;
                    super::exit::begin_exits(s, &plan.inputs);
                    if let Some(record) = s.rounds.get_mut(&round_id) {
                        record.state = RoundState::Failed;
                    }
                    Ok(())
                })?;
                Err(WalletError::Network(msg))
            }
            Err(e) => {
                warn!(round_id, error = %e, "Round failed");
                self.update(|s| {
                    s.ledger.roll_back(&input_ids, VtxoState::Spendable)?;
                    if let Some(record) = s.rounds.get_mut(&round_id) {
                        record.state = RoundState::Failed;
                    }
                    Ok(())
                })?;
                Err(match e {
                    WalletError::NotFound(msg) => WalletError::Protocol(format!("round vanished: {}", msg)),
                    other => other,
                })
            }
        }
    }

    /// Forget rounds that are deep enough or failed.
    pub fn sync_past_rounds(&self) -> Result<usize> {
        let _op = self.lock_op()?;
        self.sync_past_rounds_locked()
    }

    pub(crate) fn sync_past_rounds_locked(&self) -> Result<usize> {
        let inner = self.inner()?;
        let records: Vec<RoundRecord> = self.read(|s| s.rounds.values().cloned().collect())?;
        if records.is_empty() {
            return Ok(0);
        }
        let tip = inner.chain.tip()?;
        let required = inner.config.round_tx_required_confirmations;
        let mut done = Vec::new();
        for record in records {
            let finished = match (record.state, record.round_txid) {
                (RoundState::Failed, _) => true,
                (_, Some(txid)) => inner.chain.tx_status(&txid)?.confirmations(tip) >= required,
                (_, None) => false,
            };
            if finished {
                done.push(record.round_id);
            }
        }
        if !done.is_empty() {
            self.update(|s| {
                for id in &done {
                    s.rounds.remove(id);
                }
                Ok(())
            })?;
            debug!(count = done.len(), "Forgot past rounds");
        }
        Ok(done.len())
    }

    /// Rounds still tracked by the wallet.
    pub fn pending_rounds(&self) -> Result<Vec<RoundRecord>> {
        self.read(|s| s.rounds.values().cloned().collect())
    }
}

fn failed_record(round_id: u64, inputs: &[VtxoId]) -> RoundRecord {
    RoundRecord {
        round_id,
        round_txid: None,
        state: RoundState::Failed,
        inputs: inputs.to_vec(),
        vtxos: Vec::new(),
        created_at: Utc::now(),
    }
}

/// The proposal must create exactly what we asked for and forfeit exactly
/// our inputs.
fn check_proposal(
    plan: &RoundPlan,
    proposal: &RoundProposal,
    server: &PublicKey,
    exit_delta: u16,
) -> Result<()> {
    let bad = |what: &str| Err(WalletError::Protocol(format!("round proposal: {}", what)));
    if proposal.leaves.len() != plan.vtxo_requests.len() || proposal.forfeits.len() != plan.inputs.len() {
        return bad("wrong number of leaves or forfeits");
    }
    let round_txid = proposal.round_tx.compute_txid();
    for (i, (leaf, req)) in proposal.leaves.iter().zip(&plan.vtxo_requests).enumerate() {
        let Some(out) = proposal.round_tx.output.get(i) else {
            return bad("round tx is missing a leaf output");
        };
        let anchor = p2wsh(&anchor_script(&req.policy.user_pubkey(), server, proposal.expiry_height));
        if out.value != req.amount || out.script_pubkey != anchor {
            return bad("leaf output does not match the request");
        }
        let spends_leaf = leaf.input.len() == 1
            && leaf.input[0].previous_output.txid == round_txid
            && leaf.input[0].previous_output.vout == i as u32;
        if !spends_leaf || leaf.output.first() != Some(&vtxo_txout(req, server, exit_delta)) {
            return bad("leaf transaction does not create the requested vtxo");
        }
    }
    for offboard in &plan.offboards {
        let present = proposal
            .round_tx
            .output
            .iter()
            .any(|o| o.script_pubkey == offboard.script_pubkey && o.value == offboard.amount);
        if !present {
            return bad("offboard output missing");
        }
    }
    for (forfeit, input) in proposal.forfeits.iter().zip(&plan.inputs) {
        if forfeit.input.len() != 1 || forfeit.input[0].previous_output != input.point {
            return bad("forfeit does not spend our input");
        }
    }
    Ok(())
}
