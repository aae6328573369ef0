//! The Ark server as the wallet sees it.
//!
//! [ArkServer] is the seam between the wallet and the coordinator. The
//! remote transport lives outside this crate; [LocalArkServer] is an
//! in-process coordinator on top of [crate::chain::MockChain] used for
//! regtest and tests.

mod local;

use bitcoin::ecdsa::Signature;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, FeeRate, OutPoint, Script, ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};

pub use local::{InjectedFailure, LocalArkServer, LocalServerConfig};

use crate::config::Network;
use crate::error::LightningError;
use crate::lightning::{LightningAddress, Offer, PaymentHash, Preimage};
use crate::vtxo::{tx, Vtxo, VtxoId, VtxoRequest};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    Transport(String),
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Lightning(#[from] LightningError),
}

/// Server parameters every client operation depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArkInfo {
    pub network: Network,
    pub server_pubkey: PublicKey,
    pub round_interval_secs: u64,
    pub nb_round_nonces: u32,
    /// Relative timelock on the unilateral branch of every VTXO.
    pub vtxo_exit_delta: u16,
    /// Blocks from issuance until the server can sweep a VTXO.
    pub vtxo_expiry_delta: u32,
    pub htlc_send_expiry_delta: u16,
    pub htlc_recv_expiry_delta: u16,
    #[serde(with = "bitcoin::amount::serde::as_sat::opt")]
    pub max_vtxo_amount: Option<Amount>,
    pub max_arkoor_depth: u16,
    pub required_board_confirmations: u32,
    /// sat/vB charged on offboard outputs.
    pub offboard_fee_rate: u64,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub min_board_amount: Amount,
    /// Flat fee on top of every Lightning payment.
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub lightning_send_fee: Amount,
}

impl ArkInfo {
    /// Fee the server charges to create an onchain output to `script_pubkey`.
    pub fn offboard_fee(&self, script_pubkey: &Script) -> Amount {
        FeeRate::from_sat_per_vb(self.offboard_fee_rate)
            .and_then(|rate| rate.fee_vb(tx::output_vbytes(script_pubkey)))
            .unwrap_or(Amount::MAX_MONEY)
    }
}

/// User half of a board: the exit tx of the board VTXO, signed by the user.
#[derive(Debug, Clone)]
pub struct BoardCosignRequest {
    pub user_pubkey: PublicKey,
    pub amount: Amount,
    pub expiry_height: u32,
    pub exit_tx: Transaction,
    pub user_sig: Signature,
}

/// One VTXO spent out of round into `outputs`, user signature included.
#[derive(Debug, Clone)]
pub struct ArkoorPackage {
    pub input: Vtxo,
    pub outputs: Vec<VtxoRequest>,
    pub user_sig: Signature,
}

impl ArkoorPackage {
    pub fn unsigned_tx(input: &Vtxo, outputs: &[VtxoRequest], exit_delta: u16) -> Transaction {
        tx::arkoor_tx(input.point, outputs, &input.server_pubkey, exit_delta)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffboardRequest {
    pub script_pubkey: ScriptBuf,
    pub amount: Amount,
}

#[derive(Debug, Clone)]
pub struct RoundRequest {
    pub inputs: Vec<Vtxo>,
    pub vtxo_requests: Vec<VtxoRequest>,
    pub offboards: Vec<OffboardRequest>,
}

/// Unsigned round as proposed by the server. `leaves[i]` creates the VTXO
/// for `vtxo_requests[i]`, `forfeits[i]` gives `inputs[i]` to the server.
#[derive(Debug, Clone)]
pub struct RoundProposal {
    pub round_id: u64,
    pub round_tx: Transaction,
    pub expiry_height: u32,
    pub leaves: Vec<Transaction>,
    pub forfeits: Vec<Transaction>,
}

#[derive(Debug, Clone)]
pub struct RoundSignatures {
    pub leaf_sigs: Vec<Signature>,
    pub forfeit_sigs: Vec<Signature>,
}

#[derive(Debug, Clone)]
pub struct RoundResult {
    pub round_id: u64,
    pub round_txid: Txid,
    pub vtxos: Vec<Vtxo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    Requested,
    AwaitingCosigners,
    Signing,
    Broadcasting,
    Confirmed,
    Failed,
}

impl RoundState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundState::Requested => "requested",
            RoundState::AwaitingCosigners => "awaiting_cosigners",
            RoundState::Signing => "signing",
            RoundState::Broadcasting => "broadcasting",
            RoundState::Confirmed => "confirmed",
            RoundState::Failed => "failed",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, RoundState::Confirmed | RoundState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct LightningReceiveRequest {
    pub payment_hash: PaymentHash,
    pub amount_msat: Option<u64>,
    pub user_pubkey: PublicKey,
    pub payment_secret: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LightningPayStatus {
    Pending,
    Succeeded { preimage: Preimage },
    Failed { reason: String },
}

pub trait ArkServer: Send + Sync {
    fn ark_info(&self) -> Result<ArkInfo, ServerError>;

    /// Cosign the exit tx of a board. The funding tx is not broadcast yet.
    fn cosign_board(&self, req: BoardCosignRequest) -> Result<Signature, ServerError>;

    /// Register a board whose funding tx is deep enough.
    fn register_board(&self, vtxo: &Vtxo) -> Result<(), ServerError>;

    /// Cosign out-of-round spends. Returns the new VTXOs, fully signed.
    fn cosign_arkoor(&self, packages: Vec<ArkoorPackage>) -> Result<Vec<Vtxo>, ServerError>;

    /// VTXOs other users sent to any of `pubkeys`.
    fn arkoor_mailbox(&self, pubkeys: &[PublicKey]) -> Result<Vec<Vtxo>, ServerError>;

    fn submit_round(&self, req: RoundRequest) -> Result<RoundProposal, ServerError>;

    fn finish_round(&self, round_id: u64, sigs: RoundSignatures) -> Result<RoundResult, ServerError>;

    fn round_state(&self, round_id: u64) -> Result<RoundState, ServerError>;

    /// Returns the invoice the payer should pay.
    fn start_lightning_receive(&self, req: LightningReceiveRequest) -> Result<String, ServerError>;

    /// HTLC VTXOs locked to the receiver. Empty while unpaid.
    fn check_lightning_receive(&self, payment_hash: PaymentHash) -> Result<Vec<Vtxo>, ServerError>;

    /// Reveal the preimage and swap the HTLCs for plain VTXOs.
    fn claim_lightning_receive(&self, preimage: Preimage, packages: Vec<ArkoorPackage>) -> Result<Vec<Vtxo>, ServerError>;

    fn pay_lightning(&self, invoice: &str, htlc_vtxos: &[VtxoId]) -> Result<LightningPayStatus, ServerError>;

    fn check_lightning_payment(&self, payment_hash: PaymentHash) -> Result<LightningPayStatus, ServerError>;

    /// Take back HTLCs of a failed payment.
    fn revoke_lightning_payment(&self, packages: Vec<ArkoorPackage>) -> Result<Vec<Vtxo>, ServerError>;

    fn resolve_lightning_address(
        &self,
        address: &LightningAddress,
        amount_msat: u64,
        comment: Option<&str>,
    ) -> Result<String, ServerError>;

    fn fetch_offer_invoice(&self, offer: &Offer, amount_msat: u64) -> Result<String, ServerError>;
}

/// Outpoint of output `vout` of `tx`.
pub(crate) fn outpoint(tx: &Transaction, vout: usize) -> OutPoint {
    OutPoint::new(tx.compute_txid(), vout as u32)
}
