//! Out-of-round payments between Ark users.

use bitcoin::Amount;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{new_ark_address, parse_ark_destination, Wallet, WalletInner};
use crate::address::ArkAddress;
use crate::error::{Result, WalletError};
use crate::movement::{MovementBuilder, MovementKind};
use crate::server::ArkoorPackage;
use crate::vtxo::{Vtxo, VtxoId, VtxoPolicy, VtxoRequest, VtxoState};
use crate::wallet::persist::WalletState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArkoorPayment {
    pub destination: String,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    /// VTXOs created for the recipient.
    pub vtxos: Vec<VtxoId>,
    pub change: Option<VtxoId>,
}

/// Split `outputs` over `inputs` in order. Whatever an input has left once
/// the outputs are covered goes to `change`. Inputs that end up unused are
/// dropped.
pub(crate) fn allocate(
    inputs: &[Vtxo],
    outputs: &[VtxoRequest],
    change: Option<&VtxoPolicy>,
) -> Result<Vec<(Vtxo, Vec<VtxoRequest>)>> {
    let available: Amount = inputs.iter().map(|v| v.amount).sum();
    let needed: Amount = outputs.iter().map(|o| o.amount).sum();
    if needed > available {
        return Err(WalletError::InsufficientFunds { needed, available });
    }

    let mut pending: Vec<VtxoRequest> = outputs.iter().rev().cloned().collect();
    let mut out = Vec::with_capacity(inputs.len());
    for input in inputs {
        let mut left = input.amount;
        let mut requests = Vec::new();
        while left > Amount::ZERO {
            let Some(next) = pending.last_mut() else { break };
            let take = left.min(next.amount);
            requests.push(VtxoRequest { policy: next.policy.clone(), amount: take });
            next.amount -= take;
            left -= take;
            if next.amount == Amount::ZERO {
                pending.pop();
            }
        }
        if requests.is_empty() {
            break;
        }
        if left > Amount::ZERO {
            let policy = change.ok_or_else(|| WalletError::invalid("inputs exceed outputs and no change key given"))?;
            requests.push(VtxoRequest { policy: policy.clone(), amount: left });
        }
        out.push((input.clone(), requests));
    }
    Ok(out)
}

impl WalletInner {
    /// Sign every allocation for the server.
    pub(crate) fn build_packages(
        &self,
        state: &WalletState,
        allocations: Vec<(Vtxo, Vec<VtxoRequest>)>,
    ) -> Result<Vec<ArkoorPackage>> {
        allocations
            .into_iter()
            .map(|(input, outputs)| {
                let tx = ArkoorPackage::unsigned_tx(&input, &outputs, input.exit_delta);
                let user_sig = self.sign_vtxo_spend(state, &input, &tx)?;
                Ok(ArkoorPackage { input, outputs, user_sig })
            })
            .collect()
    }

    /// Check VTXOs handed back by the server.
    pub(crate) fn check_server_vtxos(&self, vtxos: &[Vtxo]) -> Result<()> {
        for vtxo in vtxos {
            vtxo.validate().map_err(|e| WalletError::Protocol(format!("server vtxo {}: {}", vtxo.id(), e)))?;
        }
        Ok(())
    }
}

impl Wallet {
    /// Fresh Ark address for receiving.
    pub fn new_address(&self) -> Result<ArkAddress> {
        let _op = self.lock_op()?;
        let inner = self.inner()?;
        let info = self.server_info()?;
        let keypair = self.update(|s| inner.new_keypair(s))?;
        Ok(new_ark_address(inner.config.network, &info, keypair.public_key))
    }

    /// Ok when `address` is an Ark address of our network and server.
    pub fn validate_arkoor_address(&self, address: &str) -> Result<()> {
        let _op = self.lock_op()?;
        let inner = self.inner()?;
        let info = self.server_info()?;
        let address: ArkAddress = address.parse()?;
        address.check_for(inner.config.network, &info.server_pubkey)
    }

    /// Pay `amount` to an Ark address or pubkey out of round.
    pub fn send_arkoor_payment(&self, destination: &str, amount: Amount) -> Result<ArkoorPayment> {
        if amount == Amount::ZERO {
            return Err(WalletError::invalid("amount must be positive"));
        }
        let _op = self.lock_op()?;
        let inner = self.inner()?;
        let info = self.server_info()?;
        let recipient = parse_ark_destination(destination, inner.config.network, &info)?;
        if let Some(max) = info.max_vtxo_amount {
            if amount > max {
                return Err(WalletError::invalid(format!("amount above server maximum {}", max)));
            }
        }

        let tip = self.tip()?;
        let mut state = self.snapshot()?;
        let inputs = state.ledger.select_inputs(amount, tip)?;
        if let Some(deep) = inputs.iter().find(|v| v.arkoor_depth >= info.max_arkoor_depth) {
            return Err(WalletError::state(format!(
                "vtxo {} reached the maximum arkoor depth, refresh it first",
                deep.id()
            )));
        }
        let total: Amount = inputs.iter().map(|v| v.amount).sum();
        let change = if total > amount {
            Some(VtxoPolicy::new_pubkey(inner.new_keypair(&mut state)?.public_key))
        } else {
            None
        };
        let outputs = [VtxoRequest { policy: VtxoPolicy::new_pubkey(recipient), amount }];
        let allocations = allocate(&inputs, &outputs, change.as_ref())?;
        let input_ids: Vec<VtxoId> = allocations.iter().map(|(v, _)| v.id()).collect();
        let packages = inner.build_packages(&state, allocations)?;

        let created = inner.server.cosign_arkoor(packages)?;
        inner.check_server_vtxos(&created)?;

        state.ledger.advance(&input_ids, VtxoState::Spent)?;
        let mut sent = Vec::new();
        let mut change_id = None;
        for vtxo in created {
            let id = vtxo.id();
            let is_change = change.as_ref() == Some(&vtxo.policy);
            if is_change {
                change_id = Some(id);
            } else {
                sent.push(id);
            }
            if inner.is_ours(&state, &vtxo) && !state.ledger.contains(&id) {
                state.ledger.insert(vtxo, VtxoState::Spendable, false)?;
            }
        }
        let spent: Vec<(VtxoId, Amount)> = inputs.iter().filter(|v| input_ids.contains(&v.id())).map(|v| (v.id(), v.amount)).collect();
        let mut movement = MovementBuilder::new(MovementKind::ArkoorSend)
            .spends(spent)
            .recipient(destination.trim(), amount);
        if let Some(id) = change_id {
            movement = movement.receives([(id, total - amount)]);
        }
        state.movements.record(movement);
        self.commit(state)?;

        info!(%amount, inputs = input_ids.len(), "Arkoor payment sent");
        Ok(ArkoorPayment { destination: destination.trim().to_string(), amount, vtxos: sent, change: change_id })
    }

    /// Pull VTXOs other users sent us.
    pub fn sync_arkoor_mailbox(&self) -> Result<Vec<VtxoId>> {
        let _op = self.lock_op()?;
        self.sync_arkoor_mailbox_locked()
    }

    pub(crate) fn sync_arkoor_mailbox_locked(&self) -> Result<Vec<VtxoId>> {
        let inner = self.inner()?;
        let info = self.server_info()?;
        let pubkeys: Vec<_> = self.read(|s| s.known_keys.keys().copied().collect())?;
        if pubkeys.is_empty() {
            return Ok(Vec::new());
        }
        let incoming = inner.server.arkoor_mailbox(&pubkeys)?;

        let mut state = self.snapshot()?;
        let mut received = Vec::new();
        for vtxo in incoming {
            let id = vtxo.id();
            if state.ledger.contains(&id) || received.contains(&id) {
                continue;
            }
            if vtxo.server_pubkey != info.server_pubkey || !inner.is_ours(&state, &vtxo) {
                warn!(vtxo = %id, "Ignoring mailbox vtxo that is not ours");
                continue;
            }
            if let Err(e) = vtxo.validate() {
                warn!(vtxo = %id, error = %e, "Ignoring malformed mailbox vtxo");
                continue;
            }
            let amount = vtxo.amount;
            state.ledger.insert(vtxo, VtxoState::Spendable, true)?;
            state.movements.record(MovementBuilder::new(MovementKind::ArkoorReceive).receives([(id, amount)]));
            received.push(id);
        }
        if received.is_empty() {
            debug!("Mailbox empty");
            return Ok(received);
        }
        self.commit(state)?;
        info!(count = received.len(), "Received arkoor vtxos");
        Ok(received)
    }
}
