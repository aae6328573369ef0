//! VTXO ledger: the wallet's VTXOs, their states and the queries built on them.

use std::collections::BTreeMap;

use bitcoin::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WalletError};
use crate::vtxo::{Vtxo, VtxoId, VtxoPolicyKind, VtxoState};

/// Blocks per hour at the 10 minute target.
pub const BLOCKS_PER_HOUR: u32 = 6;

/// A VTXO together with its local state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletVtxo {
    pub vtxo: Vtxo,
    pub state: VtxoState,
    /// Received from another user rather than created by this wallet.
    #[serde(default)]
    pub counterparty: bool,
    pub updated_at: DateTime<Utc>,
}

impl WalletVtxo {
    pub fn id(&self) -> VtxoId {
        self.vtxo.id()
    }

    pub fn amount(&self) -> Amount {
        self.vtxo.amount
    }
}

/// Which VTXOs a refresh should pick up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum RefreshMode {
    /// Use the configured `vtxo_refresh_expiry_threshold`.
    DefaultThreshold,
    ThresholdBlocks(u32),
    ThresholdHours(u32),
    /// VTXOs received from other users.
    Counterparty,
    All,
    Specific(Vec<VtxoId>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffchainBalance {
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub spendable: Amount,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub pending_lightning_send: Amount,
    /// Inbound HTLCs waiting to be claimed.
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub claimable_lightning_receive: Amount,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub pending_in_round: Amount,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub pending_exit: Amount,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub pending_board: Amount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<WalletVtxo>", into = "Vec<WalletVtxo>")]
pub struct VtxoLedger {
    entries: BTreeMap<VtxoId, WalletVtxo>,
}

impl From<Vec<WalletVtxo>> for VtxoLedger {
    fn from(list: Vec<WalletVtxo>) -> Self {
        Self { entries: list.into_iter().map(|v| (v.id(), v)).collect() }
    }
}

impl From<VtxoLedger> for Vec<WalletVtxo> {
    fn from(ledger: VtxoLedger) -> Self {
        ledger.entries.into_values().collect()
    }
}

impl VtxoLedger {
    /// Add a new VTXO. Ids are unique.
    pub fn insert(&mut self, vtxo: Vtxo, state: VtxoState, counterparty: bool) -> Result<()> {
        let id = vtxo.id();
        if self.entries.contains_key(&id) {
            return Err(WalletError::state(format!("vtxo {} already in ledger", id)));
        }
        self.entries.insert(id, WalletVtxo { vtxo, state, counterparty, updated_at: Utc::now() });
        Ok(())
    }

    pub fn contains(&self, id: &VtxoId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &VtxoId) -> Option<&WalletVtxo> {
        self.entries.get(id)
    }

    pub fn require(&self, id: &VtxoId) -> Result<&WalletVtxo> {
        self.entries.get(id).ok_or_else(|| WalletError::NotFound(format!("vtxo {}", id)))
    }

    pub fn state(&self, id: &VtxoId) -> Option<VtxoState> {
        self.entries.get(id).map(|v| v.state)
    }

    /// Move every id forward to `next`. Nothing changes unless every
    /// transition is allowed.
    pub fn advance(&mut self, ids: &[VtxoId], next: VtxoState) -> Result<()> {
        self.transition(ids, next, VtxoState::can_advance_to)
    }

    /// Undo a round or HTLC lock.
    pub fn roll_back(&mut self, ids: &[VtxoId], prev: VtxoState) -> Result<()> {
        self.transition(ids, prev, VtxoState::can_roll_back_to)
    }

    fn transition(&mut self, ids: &[VtxoId], to: VtxoState, allowed: fn(VtxoState, VtxoState) -> bool) -> Result<()> {
        for id in ids {
            let current = self.require(id)?.state;
            if current != to && !allowed(current, to) {
                return Err(WalletError::state(format!("vtxo {} cannot go from {} to {}", id, current, to)));
            }
        }
        let now = Utc::now();
        for id in ids {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.state = to;
                entry.updated_at = now;
            }
        }
        Ok(())
    }

    pub fn all(&self) -> impl Iterator<Item = &WalletVtxo> {
        self.entries.values()
    }

    pub fn non_spent(&self) -> impl Iterator<Item = &WalletVtxo> {
        self.entries.values().filter(|v| v.state != VtxoState::Spent)
    }

    pub fn in_state(&self, state: VtxoState) -> impl Iterator<Item = &WalletVtxo> {
        self.entries.values().filter(move |v| v.state == state)
    }

    /// Spendable VTXOs with a plain pubkey policy.
    pub fn spendable(&self) -> impl Iterator<Item = &WalletVtxo> {
        self.in_state(VtxoState::Spendable).filter(|v| v.vtxo.policy.kind() == VtxoPolicyKind::Pubkey)
    }

    /// Spendable VTXOs the server still honours at `tip`.
    pub fn usable(&self, tip: u32) -> impl Iterator<Item = &WalletVtxo> {
        self.spendable().filter(move |v| !v.vtxo.is_expired(tip))
    }

    /// Spendable VTXOs whose expiry has passed at `tip`. Only an exit can
    /// recover them.
    pub fn expired(&self, tip: u32) -> Vec<Vtxo> {
        self.in_state(VtxoState::Spendable)
            .filter(|v| v.vtxo.is_expired(tip))
            .map(|v| v.vtxo.clone())
            .collect()
    }

    pub fn balance(&self) -> OffchainBalance {
        let mut balance = OffchainBalance::default();
        for v in self.non_spent() {
            let slot = match (v.state, v.vtxo.policy.kind()) {
                (VtxoState::Spendable, _) => &mut balance.spendable,
                (VtxoState::PendingBoard, _) => &mut balance.pending_board,
                (VtxoState::PendingInRound, _) => &mut balance.pending_in_round,
                (VtxoState::PendingExit, _) => &mut balance.pending_exit,
                (VtxoState::HtlcLocked, VtxoPolicyKind::ServerHtlcRecv) => &mut balance.claimable_lightning_receive,
                (VtxoState::HtlcLocked, _) => &mut balance.pending_lightning_send,
                (VtxoState::Spent, _) => continue,
            };
            *slot += v.amount();
        }
        balance
    }

    /// Spendable VTXOs that expire within `threshold` blocks of `tip`,
    /// soonest first.
    pub fn expiring(&self, tip: u32, threshold: u32) -> Vec<&WalletVtxo> {
        let mut list: Vec<_> = self.usable(tip).filter(|v| v.vtxo.blocks_to_expiry(tip) <= threshold).collect();
        sort_by_expiry(&mut list);
        list
    }

    pub fn first_expiring_height(&self) -> Option<u32> {
        self.spendable().map(|v| v.vtxo.expiry_height).min()
    }

    /// Height at which maintenance must refresh to stay ahead of `threshold`.
    pub fn next_required_refresh_height(&self, threshold: u32) -> Option<u32> {
        self.first_expiring_height().map(|h| h.saturating_sub(threshold))
    }

    /// Resolve a [RefreshMode] into the VTXOs to refresh, soonest-expiring first.
    pub fn select_for_refresh(&self, mode: &RefreshMode, tip: u32, default_threshold: u32) -> Result<Vec<Vtxo>> {
        let mut picked: Vec<&WalletVtxo> = match mode {
            RefreshMode::DefaultThreshold => self.expiring(tip, default_threshold),
            RefreshMode::ThresholdBlocks(blocks) => self.expiring(tip, *blocks),
            RefreshMode::ThresholdHours(hours) => self.expiring(tip, hours.saturating_mul(BLOCKS_PER_HOUR)),
            RefreshMode::Counterparty => self.usable(tip).filter(|v| v.counterparty).collect(),
            RefreshMode::All => self.usable(tip).collect(),
            RefreshMode::Specific(ids) => {
                if ids.is_empty() {
                    return Err(WalletError::invalid("no vtxos given to refresh"));
                }
                let mut list = Vec::with_capacity(ids.len());
                for id in ids {
                    let entry = self.require(id)?;
                    if entry.state != VtxoState::Spendable || entry.vtxo.policy.kind() != VtxoPolicyKind::Pubkey {
                        return Err(WalletError::invalid(format!("vtxo {} is {} and cannot be refreshed", id, entry.state)));
                    }
                    if entry.vtxo.is_expired(tip) {
                        return Err(WalletError::invalid(format!("vtxo {} expired at height {}", id, entry.vtxo.expiry_height)));
                    }
                    if !list.iter().any(|v: &&WalletVtxo| v.id() == *id) {
                        list.push(entry);
                    }
                }
                list
            }
        };
        sort_by_expiry(&mut picked);
        Ok(picked.into_iter().map(|v| v.vtxo.clone()).collect())
    }

    /// Pick unexpired spendable VTXOs covering `amount`, soonest-expiring first.
    pub fn select_inputs(&self, amount: Amount, tip: u32) -> Result<Vec<Vtxo>> {
        let mut candidates: Vec<_> = self.usable(tip).collect();
        sort_by_expiry(&mut candidates);
        let mut total = Amount::ZERO;
        let mut picked = Vec::new();
        for v in candidates {
            if total >= amount {
                break;
            }
            total += v.amount();
            picked.push(v.vtxo.clone());
        }
        if total < amount {
            return Err(WalletError::InsufficientFunds { needed: amount, available: total });
        }
        Ok(picked)
    }

    /// Spendable VTXOs by id, for offboards and exits. Every id must exist.
    pub fn collect(&self, ids: &[VtxoId], allowed: &[VtxoState]) -> Result<Vec<Vtxo>> {
        let mut out: Vec<Vtxo> = Vec::with_capacity(ids.len());
        for id in ids {
            let entry = self.require(id)?;
            if !allowed.contains(&entry.state) {
                return Err(WalletError::invalid(format!("vtxo {} is {}", id, entry.state)));
            }
            if !out.iter().any(|v| v.id() == *id) {
                out.push(entry.vtxo.clone());
            }
        }
        Ok(out)
    }
}

fn sort_by_expiry(list: &mut [&WalletVtxo]) {
    list.sort_by_key(|v| (v.vtxo.expiry_height, v.id()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use bitcoin::{OutPoint, Txid};

    use crate::vtxo::VtxoPolicy;

    fn pk(b: u8) -> PublicKey {
        SecretKey::from_slice(&[b; 32]).unwrap().public_key(&Secp256k1::new())
    }

    fn vtxo(n: u8, sats: u64, expiry: u32) -> Vtxo {
        Vtxo {
            point: OutPoint::new(Txid::from_byte_array([n; 32]), 0),
            amount: Amount::from_sat(sats),
            expiry_height: expiry,
            server_pubkey: pk(1),
            exit_delta: 12,
            anchor_point: OutPoint::new(Txid::from_byte_array([0xaa; 32]), 0),
            policy: VtxoPolicy::new_pubkey(pk(2)),
            exit_txs: Vec::new(),
            arkoor_depth: 0,
        }
    }

    fn ledger() -> VtxoLedger {
        let mut l = VtxoLedger::default();
        l.insert(vtxo(1, 10_000, 500), VtxoState::Spendable, false).unwrap();
        l.insert(vtxo(2, 20_000, 200), VtxoState::Spendable, true).unwrap();
        l.insert(vtxo(3, 5_000, 900), VtxoState::PendingBoard, false).unwrap();
        l
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut l = ledger();
        assert!(l.insert(vtxo(1, 1, 1), VtxoState::Spendable, false).is_err());
    }

    #[test]
    fn test_transitions_are_atomic() {
        let mut l = ledger();
        let a = vtxo(1, 0, 0).id();
        let c = vtxo(3, 0, 0).id();
        // PendingBoard cannot enter a round, so neither id moves
        assert!(l.advance(&[a, c], VtxoState::PendingInRound).is_err());
        assert_eq!(l.state(&a), Some(VtxoState::Spendable));

        l.advance(&[a], VtxoState::PendingInRound).unwrap();
        l.roll_back(&[a], VtxoState::Spendable).unwrap();
        l.advance(&[a], VtxoState::Spent).unwrap();
        assert!(l.roll_back(&[a], VtxoState::Spendable).is_err());
        assert!(l.advance(&[a], VtxoState::Spendable).is_err());
    }

    #[test]
    fn test_balance() {
        let l = ledger();
        let b = l.balance();
        assert_eq!(b.spendable, Amount::from_sat(30_000));
        assert_eq!(b.pending_board, Amount::from_sat(5_000));
    }

    #[test]
    fn test_expiry_queries() {
        let l = ledger();
        assert_eq!(l.first_expiring_height(), Some(200));
        assert_eq!(l.next_required_refresh_height(50), Some(150));
        let expiring = l.expiring(100, 150);
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].vtxo.expiry_height, 200);
    }

    #[test]
    fn test_refresh_selection() {
        let l = ledger();
        let all = l.select_for_refresh(&RefreshMode::All, 100, 10).unwrap();
        assert_eq!(all.iter().map(|v| v.expiry_height).collect::<Vec<_>>(), vec![200, 500]);

        let hours = l.select_for_refresh(&RefreshMode::ThresholdHours(20), 100, 10).unwrap();
        assert_eq!(hours.len(), 1);

        let cp = l.select_for_refresh(&RefreshMode::Counterparty, 100, 10).unwrap();
        assert_eq!(cp.len(), 1);
        assert_eq!(cp[0].amount, Amount::from_sat(20_000));

        assert!(l.select_for_refresh(&RefreshMode::DefaultThreshold, 100, 10).unwrap().is_empty());

        let err = l.select_for_refresh(&RefreshMode::Specific(vec![]), 100, 10).unwrap_err();
        assert!(matches!(err, WalletError::InvalidArgument(_)));
        assert!(l.select_for_refresh(&RefreshMode::Specific(vec![vtxo(3, 0, 0).id()]), 100, 10).is_err());
    }

    #[test]
    fn test_select_inputs() {
        let l = ledger();
        let picked = l.select_inputs(Amount::from_sat(15_000), 100).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].expiry_height, 200);
        let err = l.select_inputs(Amount::from_sat(40_000), 100).unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { .. }));
    }

    #[test]
    fn test_expired_vtxos_are_not_selected() {
        let l = ledger();
        // vtxo 2 expires at 200
        let expired = l.expired(200);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].expiry_height, 200);
        assert!(l.expired(199).is_empty());

        let picked = l.select_inputs(Amount::from_sat(10_000), 200).unwrap();
        assert_eq!(picked[0].expiry_height, 500);
        let err = l.select_inputs(Amount::from_sat(15_000), 200).unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { available, .. } if available == Amount::from_sat(10_000)));

        assert_eq!(l.select_for_refresh(&RefreshMode::All, 200, 10).unwrap().len(), 1);
        let id = vtxo(2, 0, 0).id();
        assert!(l.select_for_refresh(&RefreshMode::Specific(vec![id]), 200, 10).is_err());
    }

    #[test]
    fn test_serde_as_list() {
        let l = ledger();
        let json = serde_json::to_value(&l).unwrap();
        assert!(json.is_array());
        let back: VtxoLedger = serde_json::from_value(json).unwrap();
        assert_eq!(back, l);
    }
}
