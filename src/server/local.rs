//! In-process Ark coordinator for regtest and tests.
//!
//! Implements the full server side of boards, arkoor, rounds and the
//! Lightning gateway against a [MockChain]. Liquidity is minted from the
//! chain faucet. Remote Lightning nodes are simulated: invoices created
//! with [LocalArkServer::create_remote_invoice] settle, anything unknown
//! fails with "no route".

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use bitcoin::absolute::LockTime;
use bitcoin::ecdsa::Signature;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use rand::RngCore;
use tracing::{debug, info, warn};

use super::{
    outpoint, ArkInfo, ArkServer, ArkoorPackage, BoardCosignRequest, LightningPayStatus, LightningReceiveRequest,
    RoundProposal, RoundRequest, RoundResult, RoundSignatures, RoundState, ServerError,
};
use crate::chain::{ChainError, ChainSource, MockChain};
use crate::config::Network;
use crate::error::LightningError;
use crate::lightning::{Invoice, LightningAddress, Offer, PaymentHash, Preimage, DEFAULT_INVOICE_EXPIRY_SECS};
use crate::vtxo::tx::{
    anchor_script, cosign_witness, exit_tx, forfeit_tx, is_fee_anchor, p2wsh, server_anchor_script,
    server_only_witness, sign_input, verify_input, vtxo_txout,
};
use crate::vtxo::{Vtxo, VtxoId, VtxoPolicy, VtxoPolicyKind, VtxoRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalServerConfig {
    pub network: Network,
    /// Seed of the server key, so addresses stay stable across runs.
    pub key_seed: [u8; 32],
    pub round_interval_secs: u64,
    pub nb_round_nonces: u32,
    pub vtxo_exit_delta: u16,
    pub vtxo_expiry_delta: u32,
    pub htlc_send_expiry_delta: u16,
    pub htlc_recv_expiry_delta: u16,
    pub max_vtxo_amount: Option<Amount>,
    pub max_arkoor_depth: u16,
    pub required_board_confirmations: u32,
    pub offboard_fee_rate: u64,
    pub min_board_amount: Amount,
    pub lightning_send_fee: Amount,
    pub lightning_liquidity: Amount,
}

impl Default for LocalServerConfig {
    fn default() -> Self {
        Self {
            network: Network::Regtest,
            key_seed: [0x42; 32],
            round_interval_secs: 10,
            nb_round_nonces: 64,
            vtxo_exit_delta: 12,
            vtxo_expiry_delta: 1008,
            htlc_send_expiry_delta: 60,
            htlc_recv_expiry_delta: 144,
            max_vtxo_amount: None,
            max_arkoor_depth: 5,
            required_board_confirmations: 1,
            offboard_fee_rate: 1,
            min_board_amount: Amount::from_sat(1_000),
            lightning_send_fee: Amount::ZERO,
            lightning_liquidity: Amount::from_sat(10_000_000),
        }
    }
}

/// One-shot faults, consumed by the next call they apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Next `submit_round` is refused.
    RejectRound,
    /// Next `finish_round` loses the connection after the client signed.
    DropRoundAfterSigning,
    /// Next Lightning payment fails to route.
    FailPayment,
    /// Next call of any kind fails at the transport level.
    Unreachable,
}

struct PendingBoard {
    anchor_point: OutPoint,
    user_pubkey: PublicKey,
    amount: Amount,
    expiry_height: u32,
}

struct Round {
    request: RoundRequest,
    proposal: RoundProposal,
    funding: (OutPoint, Amount),
    state: RoundState,
}

struct Receive {
    user_pubkey: PublicKey,
    amount: Option<Amount>,
    htlc_vtxos: Vec<Vtxo>,
    preimage: Option<Preimage>,
}

struct Payment {
    status: LightningPayStatus,
    htlc_vtxos: Vec<VtxoId>,
}

#[derive(Clone, Copy)]
enum SpendKind {
    Arkoor,
    Revoke,
    Claim(PaymentHash),
}

#[derive(Default)]
struct State {
    live: HashMap<VtxoId, Vtxo>,
    spent: HashSet<VtxoId>,
    locked: HashSet<VtxoId>,
    boards: HashMap<VtxoId, PendingBoard>,
    mailbox: HashMap<PublicKey, Vec<VtxoId>>,
    rounds: HashMap<u64, Round>,
    next_round_id: u64,
    receives: HashMap<PaymentHash, Receive>,
    payments: HashMap<PaymentHash, Payment>,
    remote_invoices: HashMap<PaymentHash, Preimage>,
    failures: Vec<InjectedFailure>,
    liquidity: Amount,
}

impl State {
    fn take_failure(&mut self, failure: InjectedFailure) -> bool {
        match self.failures.iter().position(|f| *f == failure) {
            Some(pos) => {
                self.failures.remove(pos);
                true
            }
            None => false,
        }
    }

    fn settle(&mut self, ids: &[VtxoId]) {
        for id in ids {
            self.live.remove(id);
            self.locked.remove(id);
            self.spent.insert(*id);
        }
    }
}

pub struct LocalArkServer {
    secp: Secp256k1<All>,
    key: SecretKey,
    pubkey: PublicKey,
    remote_key: SecretKey,
    chain: Arc<MockChain>,
    config: LocalServerConfig,
    state: Mutex<State>,
}

fn rejected(msg: impl Into<String>) -> ServerError {
    ServerError::Rejected(msg.into())
}

fn chain_err(e: ChainError) -> ServerError {
    match e {
        ChainError::Rejected(msg) => ServerError::Rejected(format!("chain rejected transaction: {}", msg)),
        other => ServerError::Transport(other.to_string()),
    }
}

fn internal(e: crate::error::WalletError) -> ServerError {
    ServerError::Rejected(e.to_string())
}

impl LocalArkServer {
    pub fn new(chain: Arc<MockChain>, config: LocalServerConfig) -> Result<Self, ServerError> {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&config.key_seed).map_err(|e| rejected(format!("server key: {}", e)))?;
        let mut remote_seed = config.key_seed;
        remote_seed[0] ^= 0xff;
        let remote_key = SecretKey::from_slice(&remote_seed).map_err(|e| rejected(format!("remote key: {}", e)))?;
        let state = State { liquidity: config.lightning_liquidity, ..Default::default() };
        Ok(Self { pubkey: key.public_key(&secp), secp, key, remote_key, chain, config, state: Mutex::new(state) })
    }

    pub fn regtest(chain: Arc<MockChain>) -> Result<Self, ServerError> {
        Self::new(chain, LocalServerConfig::default())
    }

    pub fn pubkey(&self) -> PublicKey {
        self.pubkey
    }

    pub fn info(&self) -> ArkInfo {
        let c = &self.config;
        ArkInfo {
            network: c.network,
            server_pubkey: self.pubkey,
            round_interval_secs: c.round_interval_secs,
            nb_round_nonces: c.nb_round_nonces,
            vtxo_exit_delta: c.vtxo_exit_delta,
            vtxo_expiry_delta: c.vtxo_expiry_delta,
            htlc_send_expiry_delta: c.htlc_send_expiry_delta,
            htlc_recv_expiry_delta: c.htlc_recv_expiry_delta,
            max_vtxo_amount: c.max_vtxo_amount,
            max_arkoor_depth: c.max_arkoor_depth,
            required_board_confirmations: c.required_board_confirmations,
            offboard_fee_rate: c.offboard_fee_rate,
            min_board_amount: c.min_board_amount,
            lightning_send_fee: c.lightning_send_fee,
        }
    }

    pub fn inject_failure(&self, failure: InjectedFailure) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.push(failure);
        }
    }

    pub fn set_lightning_liquidity(&self, amount: Amount) {
        if let Ok(mut state) = self.state.lock() {
            state.liquidity = amount;
        }
    }

    /// Whether the server still considers `id` unspent.
    pub fn is_live(&self, id: &VtxoId) -> bool {
        self.state.lock().map(|s| s.live.contains_key(id)).unwrap_or(false)
    }

    /// Lock the state, failing if an [InjectedFailure::Unreachable] is pending.
    fn enter(&self) -> Result<MutexGuard<'_, State>, ServerError> {
        let mut state = self.state.lock().map_err(|_| ServerError::Transport("server state poisoned".into()))?;
        if state.take_failure(InjectedFailure::Unreachable) {
            return Err(ServerError::Transport("ark server unreachable".into()));
        }
        Ok(state)
    }

    fn tip(&self) -> Result<u32, ServerError> {
        self.chain.tip().map_err(chain_err)
    }

    /// Invoice of a simulated remote node the gateway can route to.
    pub fn create_remote_invoice(&self, amount_msat: u64, description: &str) -> Result<String, ServerError> {
        let mut state = self.enter()?;
        Ok(self.remote_invoice(&mut state, amount_msat, description))
    }

    /// Offer of the simulated remote node.
    pub fn remote_offer(&self, amount_msat: Option<u64>) -> Offer {
        Offer { payee: self.remote_key.public_key(&self.secp), amount_msat, description: "remote offer".into() }
    }

    fn remote_invoice(&self, state: &mut State, amount_msat: u64, description: &str) -> String {
        let preimage = Preimage::random();
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let invoice = Invoice::sign(
            &self.secp,
            self.config.network,
            preimage.compute_payment_hash(),
            Some(amount_msat),
            DEFAULT_INVOICE_EXPIRY_SECS,
            secret,
            description,
            &self.remote_key,
        );
        state.remote_invoices.insert(invoice.payment_hash, preimage);
        invoice.to_string()
    }

    /// A remote payer pays one of our receive invoices.
    pub fn simulate_payment(&self, invoice: &str) -> Result<(), ServerError> {
        let mut state = self.enter()?;
        let invoice = Invoice::from_str(invoice).map_err(internal)?;
        if invoice.is_expired() {
            return Err(LightningError::InvoiceExpired.into());
        }
        let amount = invoice
            .amount()
            .ok_or_else(|| rejected("simulated payments need an invoice with an amount"))?;
        self.issue_htlc_recv(&mut state, invoice.payment_hash, amount)?;
        info!(payment_hash = %invoice.payment_hash, %amount, "Simulated inbound payment");
        Ok(())
    }

    /// Lock `amount` to the receiver of `payment_hash` in an HTLC VTXO
    /// anchored on fresh server liquidity.
    fn issue_htlc_recv(&self, state: &mut State, payment_hash: PaymentHash, amount: Amount) -> Result<(), ServerError> {
        let tip = self.tip()?;
        let receive = state
            .receives
            .get(&payment_hash)
            .ok_or_else(|| ServerError::NotFound(format!("receive {}", payment_hash)))?;
        if !receive.htlc_vtxos.is_empty() {
            return Err(rejected("invoice already paid"));
        }
        if let Some(expected) = receive.amount {
            if expected != amount {
                return Err(rejected(format!("invoice is for {}, payment was {}", expected, amount)));
            }
        }
        let policy = VtxoPolicy::ServerHtlcRecv {
            user_pubkey: receive.user_pubkey,
            payment_hash,
            htlc_expiry: tip + self.config.htlc_recv_expiry_delta as u32,
        };
        let vtxo = self.issue_from_liquidity(policy, amount, tip)?;
        state.live.insert(vtxo.id(), vtxo.clone());
        if let Some(receive) = state.receives.get_mut(&payment_hash) {
            receive.htlc_vtxos.push(vtxo);
        }
        Ok(())
    }

    fn issue_from_liquidity(&self, policy: VtxoPolicy, amount: Amount, tip: u32) -> Result<Vtxo, ServerError> {
        let script = server_anchor_script(&self.pubkey);
        let anchor_point = self.chain.fund(p2wsh(&script), amount).map_err(chain_err)?;
        let request = VtxoRequest { policy: policy.clone(), amount };
        let mut exit = exit_tx(anchor_point, vec![vtxo_txout(&request, &self.pubkey, self.config.vtxo_exit_delta)]);
        let sig = sign_input(&self.secp, &exit, 0, &script, amount, &self.key).map_err(internal)?;
        exit.input[0].witness = server_only_witness(&sig, &script);
        Ok(Vtxo {
            point: outpoint(&exit, 0),
            amount,
            expiry_height: tip + self.config.vtxo_expiry_delta,
            server_pubkey: self.pubkey,
            exit_delta: self.config.vtxo_exit_delta,
            anchor_point,
            policy,
            exit_txs: vec![exit],
            arkoor_depth: 0,
        })
    }

    fn server_sign(&self, tx: &Transaction, script: &bitcoin::Script, value: Amount) -> Result<Signature, ServerError> {
        sign_input(&self.secp, tx, 0, script, value, &self.key).map_err(internal)
    }

    /// Validate and cosign `packages`. Nothing is committed unless all pass.
    fn cosign(&self, state: &mut State, packages: Vec<ArkoorPackage>, kind: SpendKind) -> Result<Vec<Vtxo>, ServerError> {
        if packages.is_empty() {
            return Err(rejected("nothing to cosign"));
        }
        let exit_delta = self.config.vtxo_exit_delta;
        let tip = self.tip()?;
        let mut inputs = Vec::with_capacity(packages.len());
        let mut created = Vec::new();
        for p in &packages {
            let id = p.input.id();
            match state.live.get(&id) {
                Some(known) if *known == p.input => {}
                Some(_) => return Err(rejected(format!("vtxo {} does not match the server's copy", id))),
                None => return Err(rejected(format!("vtxo {} is unknown or spent", id))),
            }
            if state.locked.contains(&id) || inputs.contains(&id) {
                return Err(rejected(format!("vtxo {} is already being spent", id)));
            }
            let allowed = match (kind, &p.input.policy) {
                (SpendKind::Arkoor, VtxoPolicy::Pubkey { .. }) => true,
                (SpendKind::Revoke, VtxoPolicy::ServerHtlcSend { payment_hash, .. }) => matches!(
                    state.payments.get(payment_hash).map(|p| &p.status),
                    Some(LightningPayStatus::Failed { .. }) | None
                ),
                (SpendKind::Claim(hash), VtxoPolicy::ServerHtlcRecv { payment_hash, .. }) => hash == *payment_hash,
                _ => false,
            };
            if !allowed {
                return Err(rejected(format!("vtxo {} cannot be spent this way", id)));
            }
            if p.input.is_expired(tip) {
                return Err(rejected(format!("vtxo {} expired at height {}", id, p.input.expiry_height)));
            }
            if p.input.arkoor_depth >= self.config.max_arkoor_depth {
                return Err(rejected(format!("vtxo {} reached the maximum arkoor depth", id)));
            }
            let total: Amount = p.outputs.iter().map(|o| o.amount).sum();
            if p.outputs.is_empty() || total != p.input.amount || p.outputs.iter().any(|o| o.amount == Amount::ZERO) {
                return Err(rejected("arkoor outputs must be positive and add up to the input"));
            }
            if let Some(max) = self.config.max_vtxo_amount {
                if p.outputs.iter().any(|o| o.amount > max) {
                    return Err(rejected(format!("vtxo amount above maximum {}", max)));
                }
            }

            let mut tx = ArkoorPackage::unsigned_tx(&p.input, &p.outputs, exit_delta);
            let script = p.input.witness_script();
            if !verify_input(&self.secp, &tx, 0, &script, p.input.amount, &p.user_sig, &p.input.user_pubkey()) {
                return Err(rejected(format!("invalid user signature on {}", id)));
            }
            let server_sig = self.server_sign(&tx, &script, p.input.amount)?;
            tx.input[0].witness = cosign_witness(&p.user_sig, &server_sig, &script);

            let txid = tx.compute_txid();
            for (i, req) in p.outputs.iter().enumerate() {
                let mut exit_txs = p.input.exit_txs.clone();
                exit_txs.push(tx.clone());
                created.push(Vtxo {
                    point: OutPoint::new(txid, i as u32),
                    amount: req.amount,
                    expiry_height: p.input.expiry_height,
                    server_pubkey: self.pubkey,
                    exit_delta,
                    anchor_point: p.input.anchor_point,
                    policy: req.policy.clone(),
                    exit_txs,
                    arkoor_depth: p.input.arkoor_depth + 1,
                });
            }
            inputs.push(id);
        }

        state.settle(&inputs);
        for vtxo in &created {
            state.live.insert(vtxo.id(), vtxo.clone());
            if matches!(kind, SpendKind::Arkoor) && vtxo.policy.kind() == VtxoPolicyKind::Pubkey {
                state.mailbox.entry(vtxo.user_pubkey()).or_default().push(vtxo.id());
            }
        }
        debug!(inputs = inputs.len(), outputs = created.len(), "Cosigned arkoor");
        Ok(created)
    }

    fn fail_round(state: &mut State, round_id: u64) {
        if let Some(round) = state.rounds.get_mut(&round_id) {
            round.state = RoundState::Failed;
            let ids: Vec<VtxoId> = round.request.inputs.iter().map(|v| v.id()).collect();
            for id in ids {
                state.locked.remove(&id);
            }
        }
    }
}

impl ArkServer for LocalArkServer {
    fn ark_info(&self) -> Result<ArkInfo, ServerError> {
        let _state = self.enter()?;
        Ok(self.info())
    }

    fn cosign_board(&self, req: BoardCosignRequest) -> Result<Signature, ServerError> {
        let mut state = self.enter()?;
        if req.amount < self.config.min_board_amount {
            return Err(rejected(format!("board amount below minimum {}", self.config.min_board_amount)));
        }
        let tip = self.tip()?;
        let latest = tip + self.config.vtxo_expiry_delta + 6;
        if req.expiry_height <= tip || req.expiry_height > latest {
            return Err(rejected(format!("board expiry {} out of range", req.expiry_height)));
        }
        let expected_output = vtxo_txout(
            &VtxoRequest { policy: VtxoPolicy::new_pubkey(req.user_pubkey), amount: req.amount },
            &self.pubkey,
            self.config.vtxo_exit_delta,
        );
        let tx = &req.exit_tx;
        let well_formed = tx.input.len() == 1
            && tx.output.len() == 2
            && tx.output[0] == expected_output
            && is_fee_anchor(&tx.output[1]);
        if !well_formed {
            return Err(rejected("board exit tx does not match the request"));
        }
        let script = anchor_script(&req.user_pubkey, &self.pubkey, req.expiry_height);
        if !verify_input(&self.secp, tx, 0, &script, req.amount, &req.user_sig, &req.user_pubkey) {
            return Err(rejected("invalid user signature on board"));
        }
        let sig = self.server_sign(tx, &script, req.amount)?;
        state.boards.insert(
            outpoint(tx, 0).into(),
            PendingBoard {
                anchor_point: tx.input[0].previous_output,
                user_pubkey: req.user_pubkey,
                amount: req.amount,
                expiry_height: req.expiry_height,
            },
        );
        Ok(sig)
    }

    fn register_board(&self, vtxo: &Vtxo) -> Result<(), ServerError> {
        let mut state = self.enter()?;
        let id = vtxo.id();
        if state.live.contains_key(&id) {
            return Ok(());
        }
        let board = state.boards.get(&id).ok_or_else(|| ServerError::NotFound(format!("board {}", id)))?;
        vtxo.validate().map_err(|e| rejected(e.to_string()))?;
        if vtxo.anchor_point != board.anchor_point || vtxo.amount != board.amount || vtxo.expiry_height != board.expiry_height {
            return Err(rejected("board vtxo does not match the cosigned board"));
        }
        let expected = TxOut {
            value: board.amount,
            script_pubkey: p2wsh(&anchor_script(&board.user_pubkey, &self.pubkey, board.expiry_height)),
        };
        if self.chain.txout(&board.anchor_point) != Some(expected) {
            return Err(rejected("board funding output not found"));
        }
        let tip = self.tip()?;
        let confs = self.chain.tx_status(&board.anchor_point.txid).map_err(chain_err)?.confirmations(tip);
        if confs < self.config.required_board_confirmations {
            return Err(rejected(format!(
                "board needs {} confirmations, has {}",
                self.config.required_board_confirmations, confs
            )));
        }
        state.boards.remove(&id);
        state.live.insert(id, vtxo.clone());
        info!(vtxo = %id, amount = %vtxo.amount, "Registered board");
        Ok(())
    }

    fn cosign_arkoor(&self, packages: Vec<ArkoorPackage>) -> Result<Vec<Vtxo>, ServerError> {
        let mut state = self.enter()?;
        self.cosign(&mut state, packages, SpendKind::Arkoor)
    }

    fn arkoor_mailbox(&self, pubkeys: &[PublicKey]) -> Result<Vec<Vtxo>, ServerError> {
        let state = self.enter()?;
        Ok(pubkeys
            .iter()
            .filter_map(|pk| state.mailbox.get(pk))
            .flatten()
            .filter_map(|id| state.live.get(id).cloned())
            .collect())
    }

    fn submit_round(&self, req: RoundRequest) -> Result<RoundProposal, ServerError> {
        let mut state = self.enter()?;
        if state.take_failure(InjectedFailure::RejectRound) {
            warn!("Refusing round (injected)");
            return Err(rejected("round refused by server"));
        }
        let info = self.info();
        if req.inputs.is_empty() {
            return Err(rejected("round needs at least one input"));
        }
        let tip = self.tip()?;
        for input in &req.inputs {
            let id = input.id();
            if state.live.get(&id) != Some(input) || state.locked.contains(&id) {
                return Err(rejected(format!("vtxo {} cannot join a round", id)));
            }
            if input.is_expired(tip) {
                return Err(rejected(format!("vtxo {} expired at height {}", id, input.expiry_height)));
            }
            if input.policy.kind() != VtxoPolicyKind::Pubkey {
                return Err(rejected(format!("vtxo {} has an htlc policy", id)));
            }
        }
        let total_in: Amount = req.inputs.iter().map(|v| v.amount).sum();
        let fees: Amount = req.offboards.iter().map(|o| info.offboard_fee(&o.script_pubkey)).sum();
        let total_out: Amount = req.vtxo_requests.iter().map(|r| r.amount).sum::<Amount>()
            + req.offboards.iter().map(|o| o.amount).sum::<Amount>();
        if total_out == Amount::ZERO || total_in != total_out + fees {
            return Err(rejected(format!("unbalanced round: in {}, out {}, fees {}", total_in, total_out, fees)));
        }
        if let Some(max) = info.max_vtxo_amount {
            if req.vtxo_requests.iter().any(|r| r.amount > max) {
                return Err(rejected(format!("vtxo amount above maximum {}", max)));
            }
        }

        let round_id = state.next_round_id;
        state.next_round_id += 1;
        let expiry_height = tip + info.vtxo_expiry_delta;
        let liquidity_script = server_anchor_script(&self.pubkey);
        let funding = self.chain.fund(p2wsh(&liquidity_script), total_out).map_err(chain_err)?;

        let mut output: Vec<TxOut> = req
            .vtxo_requests
            .iter()
            .map(|r| TxOut {
                value: r.amount,
                script_pubkey: p2wsh(&anchor_script(&r.policy.user_pubkey(), &self.pubkey, expiry_height)),
            })
            .collect();
        output.extend(req.offboards.iter().map(|o| TxOut { value: o.amount, script_pubkey: o.script_pubkey.clone() }));
        let round_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: funding,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output,
        };
        let leaves = req
            .vtxo_requests
            .iter()
            .enumerate()
            .map(|(i, r)| exit_tx(outpoint(&round_tx, i), vec![vtxo_txout(r, &self.pubkey, info.vtxo_exit_delta)]))
            .collect();
        let forfeits = req.inputs.iter().map(|v| forfeit_tx(v.point, v.amount, &self.pubkey)).collect();
        let proposal = RoundProposal { round_id, round_tx, expiry_height, leaves, forfeits };

        for input in &req.inputs {
            state.locked.insert(input.id());
        }
        state.rounds.insert(
            round_id,
            Round {
                request: req,
                proposal: proposal.clone(),
                funding: (funding, total_out),
                state: RoundState::AwaitingCosigners,
            },
        );
        info!(round_id, %total_in, "Round proposed");
        Ok(proposal)
    }

    fn finish_round(&self, round_id: u64, sigs: RoundSignatures) -> Result<RoundResult, ServerError> {
        let mut state = self.enter()?;
        let (request, proposal, funding) = match state.rounds.get_mut(&round_id) {
            Some(round) if round.state == RoundState::AwaitingCosigners => {
                round.state = RoundState::Signing;
                (round.request.clone(), round.proposal.clone(), round.funding)
            }
            Some(round) => return Err(rejected(format!("round {} is {}", round_id, round.state.as_str()))),
            None => return Err(ServerError::NotFound(format!("round {}", round_id))),
        };
        if state.take_failure(InjectedFailure::DropRoundAfterSigning) {
            Self::fail_round(&mut state, round_id);
            warn!(round_id, "Dropping round after signatures (injected)");
            return Err(ServerError::Transport("connection lost while finishing round".into()));
        }
        if sigs.leaf_sigs.len() != proposal.leaves.len() || sigs.forfeit_sigs.len() != proposal.forfeits.len() {
            Self::fail_round(&mut state, round_id);
            return Err(rejected("wrong number of round signatures"));
        }

        let mut leaves = Vec::with_capacity(proposal.leaves.len());
        for ((leaf, req), user_sig) in proposal.leaves.iter().zip(&request.vtxo_requests).zip(&sigs.leaf_sigs) {
            let user = req.policy.user_pubkey();
            let script = anchor_script(&user, &self.pubkey, proposal.expiry_height);
            if !verify_input(&self.secp, leaf, 0, &script, req.amount, user_sig, &user) {
                Self::fail_round(&mut state, round_id);
                return Err(rejected("invalid leaf signature"));
            }
            let server_sig = self.server_sign(leaf, &script, req.amount)?;
            let mut signed = leaf.clone();
            signed.input[0].witness = cosign_witness(user_sig, &server_sig, &script);
            leaves.push(signed);
        }
        for ((forfeit, input), user_sig) in proposal.forfeits.iter().zip(&request.inputs).zip(&sigs.forfeit_sigs) {
            let script = input.witness_script();
            if !verify_input(&self.secp, forfeit, 0, &script, input.amount, user_sig, &input.user_pubkey()) {
                Self::fail_round(&mut state, round_id);
                return Err(rejected("invalid forfeit signature"));
            }
        }

        let mut round_tx = proposal.round_tx.clone();
        let liquidity_script = server_anchor_script(&self.pubkey);
        let sig = self.server_sign(&round_tx, &liquidity_script, funding.1)?;
        round_tx.input[0].witness = server_only_witness(&sig, &liquidity_script);
        if let Some(round) = state.rounds.get_mut(&round_id) {
            round.state = RoundState::Broadcasting;
        }
        if let Err(e) = self.chain.broadcast(&round_tx) {
            Self::fail_round(&mut state, round_id);
            return Err(chain_err(e));
        }
        let round_txid = round_tx.compute_txid();

        let inputs: Vec<VtxoId> = request.inputs.iter().map(|v| v.id()).collect();
        state.settle(&inputs);
        let vtxos: Vec<Vtxo> = leaves
            .into_iter()
            .zip(&request.vtxo_requests)
            .enumerate()
            .map(|(i, (leaf, req))| Vtxo {
                point: outpoint(&leaf, 0),
                amount: req.amount,
                expiry_height: proposal.expiry_height,
                server_pubkey: self.pubkey,
                exit_delta: self.config.vtxo_exit_delta,
                anchor_point: OutPoint::new(round_txid, i as u32),
                policy: req.policy.clone(),
                exit_txs: vec![leaf],
                arkoor_depth: 0,
            })
            .collect();
        for vtxo in &vtxos {
            state.live.insert(vtxo.id(), vtxo.clone());
        }
        info!(round_id, %round_txid, vtxos = vtxos.len(), "Round broadcast");
        Ok(RoundResult { round_id, round_txid, vtxos })
    }

    fn round_state(&self, round_id: u64) -> Result<RoundState, ServerError> {
        let mut state = self.enter()?;
        let round = state
            .rounds
            .get_mut(&round_id)
            .ok_or_else(|| ServerError::NotFound(format!("round {}", round_id)))?;
        if round.state == RoundState::Broadcasting {
            let txid = round.proposal.round_tx.compute_txid();
            if self.chain.tx_status(&txid).map_err(chain_err)?.confirmed_height().is_some() {
                round.state = RoundState::Confirmed;
            }
        }
        Ok(round.state)
    }

    fn start_lightning_receive(&self, req: LightningReceiveRequest) -> Result<String, ServerError> {
        let mut state = self.enter()?;
        if state.receives.contains_key(&req.payment_hash) {
            return Err(rejected("payment hash already registered"));
        }
        let invoice = Invoice::sign(
            &self.secp,
            self.config.network,
            req.payment_hash,
            req.amount_msat,
            DEFAULT_INVOICE_EXPIRY_SECS,
            req.payment_secret,
            "",
            &self.key,
        );
        state.receives.insert(
            req.payment_hash,
            Receive {
                user_pubkey: req.user_pubkey,
                amount: req.amount_msat.map(|msat| Amount::from_sat(msat / 1000)),
                htlc_vtxos: Vec::new(),
                preimage: None,
            },
        );
        Ok(invoice.to_string())
    }

    fn check_lightning_receive(&self, payment_hash: PaymentHash) -> Result<Vec<Vtxo>, ServerError> {
        let state = self.enter()?;
        let receive = state
            .receives
            .get(&payment_hash)
            .ok_or_else(|| ServerError::NotFound(format!("receive {}", payment_hash)))?;
        Ok(receive.htlc_vtxos.iter().filter(|v| state.live.contains_key(&v.id())).cloned().collect())
    }

    fn claim_lightning_receive(&self, preimage: Preimage, packages: Vec<ArkoorPackage>) -> Result<Vec<Vtxo>, ServerError> {
        let mut state = self.enter()?;
        let hash = preimage.compute_payment_hash();
        let receive = state.receives.get(&hash).ok_or_else(|| ServerError::NotFound(format!("receive {}", hash)))?;
        if receive.htlc_vtxos.is_empty() {
            return Err(rejected("receive has not been paid"));
        }
        let htlcs: HashSet<VtxoId> = receive.htlc_vtxos.iter().map(|v| v.id()).collect();
        if packages.iter().any(|p| !htlcs.contains(&p.input.id())) {
            return Err(rejected("claim spends vtxos outside this receive"));
        }
        let vtxos = self.cosign(&mut state, packages, SpendKind::Claim(hash))?;
        if let Some(receive) = state.receives.get_mut(&hash) {
            receive.preimage = Some(preimage);
        }
        // An internal payer learns the preimage now
        let settled = match state.payments.get_mut(&hash) {
            Some(payment) if payment.status == LightningPayStatus::Pending => {
                payment.status = LightningPayStatus::Succeeded { preimage };
                payment.htlc_vtxos.clone()
            }
            _ => Vec::new(),
        };
        state.settle(&settled);
        info!(payment_hash = %hash, "Lightning receive claimed");
        Ok(vtxos)
    }

    fn pay_lightning(&self, invoice: &str, htlc_vtxos: &[VtxoId]) -> Result<LightningPayStatus, ServerError> {
        let mut state = self.enter()?;
        let invoice = Invoice::from_str(invoice).map_err(internal)?;
        let hash = invoice.payment_hash;
        // A failed payment may be attempted again with new htlcs
        match state.payments.get(&hash) {
            Some(payment) if !matches!(payment.status, LightningPayStatus::Failed { .. }) => {
                return Ok(payment.status.clone());
            }
            _ => {}
        }
        if invoice.is_expired() {
            return Err(LightningError::InvoiceExpired.into());
        }
        let mut total = Amount::ZERO;
        for id in htlc_vtxos {
            let vtxo = state.live.get(id).ok_or_else(|| rejected(format!("htlc {} unknown", id)))?;
            if vtxo.policy.payment_hash() != Some(hash) || vtxo.policy.kind() != VtxoPolicyKind::ServerHtlcSend {
                return Err(rejected(format!("vtxo {} is not an htlc for this payment", id)));
            }
            total += vtxo.amount;
        }
        let fee = self.config.lightning_send_fee;
        let amount = invoice.amount().unwrap_or_else(|| total.checked_sub(fee).unwrap_or(Amount::ZERO));
        if amount == Amount::ZERO || total < amount + fee {
            return Err(rejected(format!("htlcs of {} do not cover {} plus fee {}", total, amount, fee)));
        }

        let status = if state.take_failure(InjectedFailure::FailPayment) {
            LightningPayStatus::Failed { reason: "payment failed: temporary channel failure".into() }
        } else if state.receives.contains_key(&hash) {
            match self.issue_htlc_recv(&mut state, hash, amount) {
                Ok(()) => LightningPayStatus::Pending,
                Err(e) => LightningPayStatus::Failed { reason: e.to_string() },
            }
        } else if let Some(preimage) = state.remote_invoices.get(&hash).copied() {
            if amount > state.liquidity {
                let available = state.liquidity;
                state.payments.insert(
                    hash,
                    Payment {
                        status: LightningPayStatus::Failed { reason: "insufficient liquidity".into() },
                        htlc_vtxos: htlc_vtxos.to_vec(),
                    },
                );
                return Err(LightningError::InsufficientLiquidity { needed: amount, available }.into());
            }
            state.liquidity -= amount;
            state.settle(htlc_vtxos);
            LightningPayStatus::Succeeded { preimage }
        } else {
            LightningPayStatus::Failed { reason: "no route to payee".into() }
        };
        info!(payment_hash = %hash, %amount, status = ?status, "Lightning payment");
        state.payments.insert(hash, Payment { status: status.clone(), htlc_vtxos: htlc_vtxos.to_vec() });
        Ok(status)
    }

    fn check_lightning_payment(&self, payment_hash: PaymentHash) -> Result<LightningPayStatus, ServerError> {
        let state = self.enter()?;
        state
            .payments
            .get(&payment_hash)
            .map(|p| p.status.clone())
            .ok_or_else(|| ServerError::NotFound(format!("payment {}", payment_hash)))
    }

    fn revoke_lightning_payment(&self, packages: Vec<ArkoorPackage>) -> Result<Vec<Vtxo>, ServerError> {
        let mut state = self.enter()?;
        self.cosign(&mut state, packages, SpendKind::Revoke)
    }

    fn resolve_lightning_address(
        &self,
        address: &LightningAddress,
        amount_msat: u64,
        comment: Option<&str>,
    ) -> Result<String, ServerError> {
        let mut state = self.enter()?;
        debug!(%address, amount_msat, "Resolving lightning address");
        Ok(self.remote_invoice(&mut state, amount_msat, comment.unwrap_or_default()))
    }

    fn fetch_offer_invoice(&self, offer: &Offer, amount_msat: u64) -> Result<String, ServerError> {
        let mut state = self.enter()?;
        if let Some(fixed) = offer.amount_msat {
            if fixed != amount_msat {
                return Err(rejected(format!("offer is for {} msat", fixed)));
            }
        }
        if offer.payee != self.remote_key.public_key(&self.secp) {
            return Err(LightningError::PaymentFailed("offer payee unreachable".into()).into());
        }
        Ok(self.remote_invoice(&mut state, amount_msat, &offer.description))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<MockChain>, LocalArkServer, SecretKey, PublicKey) {
        let chain = Arc::new(MockChain::new());
        let server = LocalArkServer::regtest(chain.clone()).unwrap();
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let pk = sk.public_key(&Secp256k1::new());
        (chain, server, sk, pk)
    }

    /// Board `sats` for `pk` straight through the server, skipping the wallet.
    fn board(chain: &MockChain, server: &LocalArkServer, sk: &SecretKey, pk: PublicKey, sats: u64) -> Vtxo {
        let secp = Secp256k1::new();
        let amount = Amount::from_sat(sats);
        let expiry = chain.tip().unwrap() + 100;
        let script = anchor_script(&pk, &server.pubkey(), expiry);
        let anchor = chain.fund(p2wsh(&script), amount).unwrap();
        let request = VtxoRequest { policy: VtxoPolicy::new_pubkey(pk), amount };
        let mut exit = exit_tx(anchor, vec![vtxo_txout(&request, &server.pubkey(), 12)]);
        let user_sig = sign_input(&secp, &exit, 0, &script, amount, sk).unwrap();
        let server_sig = server
            .cosign_board(BoardCosignRequest {
                user_pubkey: pk,
                amount,
                expiry_height: expiry,
                exit_tx: exit.clone(),
                user_sig,
            })
            .unwrap();
        exit.input[0].witness = cosign_witness(&user_sig, &server_sig, &script);
        chain.mine(1).unwrap();
        let vtxo = Vtxo {
            point: outpoint(&exit, 0),
            amount,
            expiry_height: expiry,
            server_pubkey: server.pubkey(),
            exit_delta: 12,
            anchor_point: anchor,
            policy: request.policy,
            exit_txs: vec![exit],
            arkoor_depth: 0,
        };
        server.register_board(&vtxo).unwrap();
        vtxo
    }

    #[test]
    fn test_board_and_arkoor() {
        let (chain, server, sk, pk) = setup();
        let vtxo = board(&chain, &server, &sk, pk, 50_000);
        assert!(server.is_live(&vtxo.id()));

        let other = SecretKey::from_slice(&[8u8; 32]).unwrap().public_key(&Secp256k1::new());
        let outputs = vec![
            VtxoRequest { policy: VtxoPolicy::new_pubkey(other), amount: Amount::from_sat(20_000) },
            VtxoRequest { policy: VtxoPolicy::new_pubkey(pk), amount: Amount::from_sat(30_000) },
        ];
        let unsigned = ArkoorPackage::unsigned_tx(&vtxo, &outputs, 12);
        let user_sig = sign_input(&Secp256k1::new(), &unsigned, 0, &vtxo.witness_script(), vtxo.amount, &sk).unwrap();
        let created = server
            .cosign_arkoor(vec![ArkoorPackage { input: vtxo.clone(), outputs, user_sig }])
            .unwrap();
        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|v| v.validate().is_ok() && v.arkoor_depth == 1));
        assert!(!server.is_live(&vtxo.id()));

        let mailbox = server.arkoor_mailbox(&[other]).unwrap();
        assert_eq!(mailbox.len(), 1);
        assert_eq!(mailbox[0].amount, Amount::from_sat(20_000));
    }

    #[test]
    fn test_arkoor_rejects_bad_signature_and_double_spend() {
        let (chain, server, sk, pk) = setup();
        let vtxo = board(&chain, &server, &sk, pk, 10_000);
        let outputs = vec![VtxoRequest { policy: VtxoPolicy::new_pubkey(pk), amount: vtxo.amount }];
        let unsigned = ArkoorPackage::unsigned_tx(&vtxo, &outputs, 12);
        let wrong = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let bad_sig = sign_input(&Secp256k1::new(), &unsigned, 0, &vtxo.witness_script(), vtxo.amount, &wrong).unwrap();
        let err = server
            .cosign_arkoor(vec![ArkoorPackage { input: vtxo.clone(), outputs: outputs.clone(), user_sig: bad_sig }])
            .unwrap_err();
        assert!(matches!(err, ServerError::Rejected(_)));

        let sig = sign_input(&Secp256k1::new(), &unsigned, 0, &vtxo.witness_script(), vtxo.amount, &sk).unwrap();
        server.cosign_arkoor(vec![ArkoorPackage { input: vtxo.clone(), outputs: outputs.clone(), user_sig: sig }]).unwrap();
        assert!(server.cosign_arkoor(vec![ArkoorPackage { input: vtxo, outputs, user_sig: sig }]).is_err());
    }

    #[test]
    fn test_expired_vtxo_is_refused() {
        let (chain, server, sk, pk) = setup();
        let vtxo = board(&chain, &server, &sk, pk, 10_000);
        chain.mine(vtxo.expiry_height - chain.height()).unwrap();
        assert!(vtxo.is_expired(chain.height()));

        let outputs = vec![VtxoRequest { policy: VtxoPolicy::new_pubkey(pk), amount: vtxo.amount }];
        let unsigned = ArkoorPackage::unsigned_tx(&vtxo, &outputs, 12);
        let sig = sign_input(&Secp256k1::new(), &unsigned, 0, &vtxo.witness_script(), vtxo.amount, &sk).unwrap();
        let err = server
            .cosign_arkoor(vec![ArkoorPackage { input: vtxo.clone(), outputs: outputs.clone(), user_sig: sig }])
            .unwrap_err();
        assert!(matches!(err, ServerError::Rejected(_)));

        let req = RoundRequest { inputs: vec![vtxo], vtxo_requests: outputs, offboards: vec![] };
        assert!(matches!(server.submit_round(req), Err(ServerError::Rejected(_))));
    }

    #[test]
    fn test_round_reject_injection() {
        let (chain, server, sk, pk) = setup();
        let vtxo = board(&chain, &server, &sk, pk, 10_000);
        server.inject_failure(InjectedFailure::RejectRound);
        let req = RoundRequest {
            inputs: vec![vtxo.clone()],
            vtxo_requests: vec![VtxoRequest { policy: VtxoPolicy::new_pubkey(pk), amount: vtxo.amount }],
            offboards: vec![],
        };
        assert!(server.submit_round(req.clone()).is_err());
        let proposal = server.submit_round(req).unwrap();
        assert_eq!(server.round_state(proposal.round_id).unwrap(), RoundState::AwaitingCosigners);
        assert_eq!(proposal.leaves.len(), 1);
        assert_eq!(proposal.forfeits.len(), 1);
    }

    #[test]
    fn test_unreachable_injection() {
        let (_chain, server, _, _) = setup();
        server.inject_failure(InjectedFailure::Unreachable);
        assert!(matches!(server.ark_info(), Err(ServerError::Transport(_))));
        assert!(server.ark_info().is_ok());
    }

    #[test]
    fn test_remote_invoice_is_signed_by_remote_node() {
        let (_chain, server, _, _) = setup();
        let invoice = Invoice::from_str(&server.create_remote_invoice(5_000, "x").unwrap()).unwrap();
        assert_ne!(invoice.payee, server.pubkey());
        assert_eq!(invoice.amount(), Some(Amount::from_sat(5)));
    }
}
