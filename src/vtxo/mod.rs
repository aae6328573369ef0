//! VTXO - a virtual UTXO held off-chain under the Ark server's cosignature.
//!
//! A [Vtxo] carries the fully signed chain of exit transactions that leads
//! from its onchain anchor to its own output. Broadcasting that chain is the
//! unilateral exit; everything else happens off-chain.

pub mod tx;

use std::fmt;
use std::str::FromStr;

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut};
use serde::{Deserialize, Serialize};

use crate::lightning::PaymentHash;

/// Identifier of a VTXO: its outpoint, 32 byte txid + 4 byte vout (LE).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VtxoId([u8; 36]);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("failed to parse vtxo id, must be 36 bytes or txid:vout")]
pub struct VtxoIdParseError;

impl VtxoId {
    /// Size in bytes of an encoded [VtxoId].
    pub const ENCODE_SIZE: usize = 36;

    pub fn from_slice(b: &[u8]) -> Result<VtxoId, VtxoIdParseError> {
        if b.len() == Self::ENCODE_SIZE {
            let mut ret = [0u8; 36];
            ret.copy_from_slice(b);
            Ok(Self(ret))
        } else {
            Err(VtxoIdParseError)
        }
    }

    pub fn utxo(self) -> OutPoint {
        use bitcoin::hashes::Hash;
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&self.0[0..32]);
        let mut vout = [0u8; 4];
        vout.copy_from_slice(&self.0[32..]);
        OutPoint::new(bitcoin::Txid::from_byte_array(txid), u32::from_le_bytes(vout))
    }

    pub fn to_bytes(self) -> [u8; 36] {
        self.0
    }
}

impl From<OutPoint> for VtxoId {
    fn from(p: OutPoint) -> VtxoId {
        use bitcoin::hashes::Hash;
        let mut ret = [0u8; 36];
        ret[0..32].copy_from_slice(&p.txid.to_byte_array());
        ret[32..].copy_from_slice(&p.vout.to_le_bytes());
        VtxoId(ret)
    }
}

impl AsRef<[u8]> for VtxoId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for VtxoId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.utxo(), f)
    }
}

impl fmt::Debug for VtxoId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for VtxoId {
    type Err = VtxoIdParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(OutPoint::from_str(s.trim()).map_err(|_| VtxoIdParseError)?.into())
    }
}

impl Serialize for VtxoId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.collect_str(self)
        } else {
            s.serialize_bytes(self.as_ref())
        }
    }
}

impl<'de> Deserialize<'de> for VtxoId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct Visitor;
        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = VtxoId;
            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a VtxoId")
            }
            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                VtxoId::from_slice(v).map_err(serde::de::Error::custom)
            }
            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                VtxoId::from_str(v).map_err(serde::de::Error::custom)
            }
        }
        if d.is_human_readable() {
            d.deserialize_str(Visitor)
        } else {
            d.deserialize_bytes(Visitor)
        }
    }
}

/// Spending conditions of a VTXO output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VtxoPolicy {
    /// Plain ownership by a user key.
    Pubkey { user_pubkey: PublicKey },
    /// Outgoing Lightning HTLC: the server takes it with the preimage,
    /// the user can only exit after `htlc_expiry`.
    ServerHtlcSend { user_pubkey: PublicKey, payment_hash: PaymentHash, htlc_expiry: u32 },
    /// Incoming Lightning HTLC: the user takes it by revealing the preimage.
    ServerHtlcRecv { user_pubkey: PublicKey, payment_hash: PaymentHash, htlc_expiry: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VtxoPolicyKind {
    Pubkey,
    ServerHtlcSend,
    ServerHtlcRecv,
}

impl VtxoPolicy {
    pub fn new_pubkey(user_pubkey: PublicKey) -> Self {
        VtxoPolicy::Pubkey { user_pubkey }
    }

    pub fn user_pubkey(&self) -> PublicKey {
        match self {
            VtxoPolicy::Pubkey { user_pubkey }
            | VtxoPolicy::ServerHtlcSend { user_pubkey, .. }
            | VtxoPolicy::ServerHtlcRecv { user_pubkey, .. } => *user_pubkey,
        }
    }

    pub fn kind(&self) -> VtxoPolicyKind {
        match self {
            VtxoPolicy::Pubkey { .. } => VtxoPolicyKind::Pubkey,
            VtxoPolicy::ServerHtlcSend { .. } => VtxoPolicyKind::ServerHtlcSend,
            VtxoPolicy::ServerHtlcRecv { .. } => VtxoPolicyKind::ServerHtlcRecv,
        }
    }

    pub fn payment_hash(&self) -> Option<PaymentHash> {
        match self {
            VtxoPolicy::Pubkey { .. } => None,
            VtxoPolicy::ServerHtlcSend { payment_hash, .. } | VtxoPolicy::ServerHtlcRecv { payment_hash, .. } => {
                Some(*payment_hash)
            }
        }
    }

    pub fn htlc_expiry(&self) -> Option<u32> {
        match self {
            VtxoPolicy::Pubkey { .. } => None,
            VtxoPolicy::ServerHtlcSend { htlc_expiry, .. } | VtxoPolicy::ServerHtlcRecv { htlc_expiry, .. } => {
                Some(*htlc_expiry)
            }
        }
    }
}

/// An output the client asks the server to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VtxoRequest {
    pub policy: VtxoPolicy,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vtxo {
    /// Outpoint of the VTXO output inside its last exit transaction.
    pub point: OutPoint,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    pub expiry_height: u32,
    pub server_pubkey: PublicKey,
    pub exit_delta: u16,
    /// Onchain outpoint the exit chain starts from.
    pub anchor_point: OutPoint,
    pub policy: VtxoPolicy,
    /// Fully signed transactions from `anchor_point` to `point`, in order.
    #[serde(with = "serde_txs")]
    pub exit_txs: Vec<Transaction>,
    /// Out-of-round transfers since the VTXO was last issued in a round or board.
    pub arkoor_depth: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VtxoValidationError {
    #[error("vtxo has no exit transactions")]
    NoExitTxs,
    #[error("exit transaction {0} does not spend its predecessor")]
    BrokenChain(usize),
    #[error("last exit transaction does not create the vtxo point")]
    PointMismatch,
    #[error("vtxo output does not match its policy or amount")]
    OutputMismatch,
}

impl Vtxo {
    pub fn id(&self) -> VtxoId {
        self.point.into()
    }

    pub fn user_pubkey(&self) -> PublicKey {
        self.policy.user_pubkey()
    }

    /// Number of transactions to broadcast for a unilateral exit.
    pub fn exit_depth(&self) -> usize {
        self.exit_txs.len()
    }

    pub fn witness_script(&self) -> ScriptBuf {
        tx::policy_script(&self.policy, &self.server_pubkey, self.exit_delta)
    }

    pub fn output_script_pubkey(&self) -> ScriptBuf {
        tx::p2wsh(&self.witness_script())
    }

    pub fn txout(&self) -> TxOut {
        TxOut { value: self.amount, script_pubkey: self.output_script_pubkey() }
    }

    pub fn is_expired(&self, tip: u32) -> bool {
        self.expiry_height <= tip
    }

    /// Blocks left until expiry, zero once expired.
    pub fn blocks_to_expiry(&self, tip: u32) -> u32 {
        self.expiry_height.saturating_sub(tip)
    }

    /// Structural check of the exit chain. Signatures are checked by the
    /// party that produced them.
    pub fn validate(&self) -> Result<(), VtxoValidationError> {
        let first = self.exit_txs.first().ok_or(VtxoValidationError::NoExitTxs)?;
        if first.input.first().map(|i| i.previous_output) != Some(self.anchor_point) {
            return Err(VtxoValidationError::BrokenChain(0));
        }
        for (i, pair) in self.exit_txs.windows(2).enumerate() {
            let parent = pair[0].compute_txid();
            if pair[1].input.first().map(|i| i.previous_output.txid) != Some(parent) {
                return Err(VtxoValidationError::BrokenChain(i + 1));
            }
        }
        let last = self.exit_txs.last().ok_or(VtxoValidationError::NoExitTxs)?;
        if last.compute_txid() != self.point.txid {
            return Err(VtxoValidationError::PointMismatch);
        }
        match last.output.get(self.point.vout as usize) {
            Some(out) if *out == self.txout() => Ok(()),
            _ => Err(VtxoValidationError::OutputMismatch),
        }
    }
}

/// Lifecycle of a VTXO in the local ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VtxoState {
    /// Board funding tx not yet deep enough to be registered with the server.
    PendingBoard,
    Spendable,
    PendingInRound,
    /// Locked in a Lightning HTLC (pending send or unclaimed receive).
    HtlcLocked,
    PendingExit,
    Spent,
}

impl VtxoState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VtxoState::PendingBoard => "pending_board",
            VtxoState::Spendable => "spendable",
            VtxoState::PendingInRound => "pending_in_round",
            VtxoState::HtlcLocked => "htlc_locked",
            VtxoState::PendingExit => "pending_exit",
            VtxoState::Spent => "spent",
        }
    }

    /// Forward edges of the state lattice.
    pub fn can_advance_to(self, next: VtxoState) -> bool {
        use VtxoState::*;
        matches!(
            (self, next),
            (PendingBoard, Spendable)
                | (PendingBoard, Spent)
                | (PendingBoard, PendingExit)
                | (Spendable, PendingInRound)
                | (Spendable, HtlcLocked)
                | (Spendable, PendingExit)
                | (Spendable, Spent)
                | (PendingInRound, PendingExit)
                | (PendingInRound, Spent)
                | (HtlcLocked, PendingExit)
                | (HtlcLocked, Spent)
                | (PendingExit, Spent)
        )
    }

    /// Recovery edges used when a round or HTLC fails before anything was
    /// committed on the server side.
    pub fn can_roll_back_to(self, prev: VtxoState) -> bool {
        matches!(
            (self, prev),
            (VtxoState::PendingInRound, VtxoState::Spendable) | (VtxoState::HtlcLocked, VtxoState::Spendable)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == VtxoState::Spent
    }
}

impl fmt::Display for VtxoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consensus-hex serde for transaction lists.
pub(crate) mod serde_txs {
    use bitcoin::consensus::encode;
    use bitcoin::Transaction;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(txs: &[Transaction], s: S) -> Result<S::Ok, S::Error> {
        let hexes: Vec<String> = txs.iter().map(|tx| hex::encode(encode::serialize(tx))).collect();
        hexes.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Transaction>, D::Error> {
        let hexes = Vec::<String>::deserialize(d)?;
        hexes
            .iter()
            .map(|h| {
                let bytes = hex::decode(h).map_err(D::Error::custom)?;
                encode::deserialize(&bytes).map_err(D::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn test_vtxo_id_roundtrip() {
        let point = OutPoint::new(bitcoin::Txid::from_byte_array([7u8; 32]), 3);
        let id = VtxoId::from(point);
        assert_eq!(id.utxo(), point);
        assert_eq!(VtxoId::from_str(&id.to_string()).unwrap(), id);
        assert_eq!(VtxoId::from_slice(&id.to_bytes()).unwrap(), id);
        assert!(VtxoId::from_slice(&[0u8; 35]).is_err());
        assert!(VtxoId::from_str("nonsense").is_err());

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", point));
        assert_eq!(serde_json::from_str::<VtxoId>(&json).unwrap(), id);
    }

    #[test]
    fn test_state_lattice_monotonic() {
        use VtxoState::*;
        let all = [PendingBoard, Spendable, PendingInRound, HtlcLocked, PendingExit, Spent];
        for next in all {
            assert!(!Spent.can_advance_to(next));
            assert!(!Spent.can_roll_back_to(next));
        }
        assert!(Spendable.can_advance_to(PendingInRound));
        assert!(!PendingInRound.can_advance_to(Spendable));
        assert!(PendingInRound.can_roll_back_to(Spendable));
        assert!(!PendingExit.can_roll_back_to(Spendable));
        assert!(!PendingExit.can_advance_to(Spendable));
    }
}
