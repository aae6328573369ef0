//! Lightning through the Ark server's gateway.
//!
//! Sending locks VTXOs into `ServerHtlcSend` outputs the gateway can take
//! with the preimage. Receiving hands the gateway a payment hash whose
//! preimage only we can derive; once the payer's HTLC arrives as a
//! `ServerHtlcRecv` VTXO we reveal the preimage and swap it for a plain one.

use std::str::FromStr;
use std::time::{Duration, Instant};

use bitcoin::Amount;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::arkoor::allocate;
use super::Wallet;
use crate::error::{LightningError, Result, WalletError};
use crate::lightning::{
    Bolt11Receive, Invoice, LightningAddress, LightningReceive, LightningSendResult, Offer, PaymentHash, Preimage,
    ReceiveRecord, SendRecord, SendStatus,
};
use crate::movement::{MovementBuilder, MovementKind};
use crate::server::{LightningPayStatus, LightningReceiveRequest, ServerError};
use crate::vtxo::{Vtxo, VtxoId, VtxoPolicy, VtxoPolicyKind, VtxoRequest, VtxoState};

const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(250);

impl Wallet {
    // ---- receive ----

    /// Create an invoice for `amount_msat`. The preimage is derived from the
    /// seed, so a restored wallet can still claim.
    pub fn bolt11_invoice(&self, amount_msat: u64) -> Result<Bolt11Receive> {
        if amount_msat < 1_000 {
            return Err(WalletError::invalid("invoice amount must be at least 1 sat"));
        }
        let _op = self.lock_op()?;
        let inner = self.inner()?;

        let mut state = self.snapshot()?;
        let index = state.next_receive_index;
        state.next_receive_index += 1;
        let preimage = Preimage::from_byte_array(inner.keys.preimage(index));
        let payment_hash = preimage.compute_payment_hash();
        let keypair = inner.new_keypair(&mut state)?;
        let payment_secret = inner.keys.payment_secret(payment_hash.as_byte_array());
        // Burn the index even if the server refuses.
        self.commit(state)?;

        let invoice = inner.server.start_lightning_receive(LightningReceiveRequest {
            payment_hash,
            amount_msat: Some(amount_msat),
            user_pubkey: keypair.public_key,
            payment_secret,
        })?;
        let parsed = Invoice::from_str(&invoice)?;
        if parsed.payment_hash != payment_hash || parsed.amount_msat != Some(amount_msat) {
            return Err(WalletError::Protocol("server returned an invoice for something else".into()));
        }

        self.update(|s| {
            s.receives.insert(
                payment_hash,
                ReceiveRecord {
                    payment_hash,
                    preimage,
                    invoice: invoice.clone(),
                    amount: parsed.amount(),
                    created_at: Utc::now(),
                    preimage_revealed_at: None,
                    finished_at: None,
                    htlc_vtxos: Vec::new(),
                    failure: None,
                },
            );
            Ok(())
        })?;
        info!(%payment_hash, amount_msat, "Invoice created");
        Ok(Bolt11Receive { invoice, payment_secret: hex::encode(payment_secret), payment_hash })
    }

    pub fn lightning_receive_status(&self, payment_hash: PaymentHash) -> Result<Option<LightningReceive>> {
        self.read(|s| s.receives.get(&payment_hash).map(ReceiveRecord::view))
    }

    /// Claim the receive if its HTLCs arrived. With `wait`, poll the server
    /// for up to `ln_receive_wait_secs` before failing with a timeout.
    pub fn check_and_claim_ln_receive(&self, payment_hash: PaymentHash, wait: bool) -> Result<LightningReceive> {
        let _op = self.lock_op()?;
        self.claim_receive_locked(payment_hash, wait)
    }

    /// Try every open receive. Failures are logged and skipped.
    pub fn check_and_claim_all_open_ln_receives(&self, wait: bool) -> Result<Vec<LightningReceive>> {
        let _op = self.lock_op()?;
        Ok(self.claim_open_receives_locked(wait))
    }

    fn claim_open_receives_locked(&self, wait: bool) -> Vec<LightningReceive> {
        let open: Vec<PaymentHash> = self
            .read(|s| s.receives.values().filter(|r| r.is_open()).map(|r| r.payment_hash).collect())
            .unwrap_or_default();
        let mut out = Vec::new();
        for hash in open {
            match self.claim_receive_locked(hash, wait) {
                Ok(view) => out.push(view),
                Err(e) => debug!(payment_hash = %hash, error = %e, "Receive not claimed"),
            }
        }
        out
    }

    fn claim_receive_locked(&self, payment_hash: PaymentHash, wait: bool) -> Result<LightningReceive> {
        let inner = self.inner()?;
        let record = self
            .read(|s| s.receives.get(&payment_hash).cloned())?
            .ok_or_else(|| WalletError::NotFound(format!("lightning receive {}", payment_hash)))?;
        if !record.is_open() {
            return Ok(record.view());
        }

        let deadline = Instant::now() + Duration::from_secs(inner.config.ln_receive_wait_secs);
        let htlcs = loop {
            let htlcs = inner.server.check_lightning_receive(payment_hash)?;
            if !htlcs.is_empty() {
                break htlcs;
            }
            if !wait {
                return Ok(record.view());
            }
            if Instant::now() >= deadline {
                return Err(LightningError::Timeout(format!("no payment for {} yet", payment_hash)).into());
            }
            std::thread::sleep(RECEIVE_POLL_INTERVAL);
        };
        self.claim_htlcs(record, htlcs)
    }

    fn claim_htlcs(&self, record: ReceiveRecord, htlcs: Vec<Vtxo>) -> Result<LightningReceive> {
        let inner = self.inner()?;
        let info = self.server_info()?;
        let hash = record.payment_hash;
        inner.check_server_vtxos(&htlcs)?;
        let mut state = self.snapshot()?;
        for htlc in &htlcs {
            let ours = matches!(&htlc.policy, VtxoPolicy::ServerHtlcRecv { payment_hash, .. } if *payment_hash == hash)
                && inner.is_ours(&state, htlc)
                && htlc.server_pubkey == info.server_pubkey;
            if !ours {
                return Err(WalletError::Protocol(format!("htlc {} does not pay this receive", htlc.id())));
            }
        }
        let total: Amount = htlcs.iter().map(|v| v.amount).sum();
        if let Some(expected) = record.amount {
            if total < expected {
                return Err(WalletError::Protocol(format!("htlcs of {} do not cover invoice of {}", total, expected)));
            }
        }

        // Record the HTLCs first so an interrupted claim can still exit them.
        let ids: Vec<VtxoId> = htlcs.iter().map(|v| v.id()).collect();
        for htlc in &htlcs {
            if !state.ledger.contains(&htlc.id()) {
                state.ledger.insert(htlc.clone(), VtxoState::HtlcLocked, true)?;
            }
        }
        if let Some(r) = state.receives.get_mut(&hash) {
            r.htlc_vtxos = ids.clone();
        }

        let tip = self.tip()?;
        let claim_delta = inner.config.htlc_recv_claim_delta as u32;
        if let Some(late) = htlcs
            .iter()
            .find(|v| v.policy.htlc_expiry().map_or(true, |expiry| tip + claim_delta >= expiry))
        {
            let reason = format!("htlc {} is too close to expiry to claim", late.id());
            if let Some(r) = state.receives.get_mut(&hash) {
                r.failure = Some(reason.clone());
            }
            self.commit(state)?;
            return Err(WalletError::Protocol(reason));
        }

        let keypair = inner.new_keypair(&mut state)?;
        self.commit(state.clone())?;

        let allocations = htlcs
            .iter()
            .map(|v| (v.clone(), vec![VtxoRequest { policy: VtxoPolicy::new_pubkey(keypair.public_key), amount: v.amount }]))
            .collect();
        let packages = inner.build_packages(&state, allocations)?;
        let created = inner.server.claim_lightning_receive(record.preimage, packages)?;
        inner.check_server_vtxos(&created)?;

        let now = Utc::now();
        let view = self.update(|s| {
            s.ledger.advance(&ids, VtxoState::Spent)?;
            for vtxo in &created {
                s.ledger.insert(vtxo.clone(), VtxoState::Spendable, false)?;
            }
            s.movements.record(
                MovementBuilder::new(MovementKind::LightningReceive)
                    .receives(created.iter().map(|v| (v.id(), v.amount))),
            );
            let r = s
                .receives
                .get_mut(&hash)
                .ok_or_else(|| WalletError::NotFound(format!("lightning receive {}", hash)))?;
            r.preimage_revealed_at = Some(now);
            r.finished_at = Some(now);
            r.failure = None;
            Ok(r.view())
        })?;
        info!(payment_hash = %hash, amount = %total, "Lightning receive claimed");
        Ok(view)
    }

    // ---- send ----

    /// Pay a BOLT11 invoice. `amount` is required for zero-amount invoices
    /// and must match otherwise.
    pub fn pay_lightning_invoice(&self, invoice: &str, amount: Option<Amount>) -> Result<LightningSendResult> {
        let _op = self.lock_op()?;
        self.pay_invoice_locked(invoice, amount)
    }

    /// Pay a BOLT12 offer.
    pub fn pay_lightning_offer(&self, offer: &str, amount: Option<Amount>) -> Result<LightningSendResult> {
        let offer = Offer::from_str(offer)?;
        let amount_msat = match (offer.amount_msat, amount) {
            (Some(fixed), Some(a)) if fixed != a.to_sat() * 1000 => {
                return Err(WalletError::invalid(format!("offer is for {} msat", fixed)))
            }
            (Some(fixed), _) => fixed,
            (None, Some(a)) => a.to_sat() * 1000,
            (None, None) => return Err(WalletError::invalid("amount is required for this offer")),
        };
        let _op = self.lock_op()?;
        let invoice = self.inner()?.server.fetch_offer_invoice(&offer, amount_msat)?;
        self.pay_invoice_locked(&invoice, None)
    }

    /// Pay a Lightning address (`user@domain`).
    pub fn pay_lightning_address(&self, address: &str, amount: Amount, comment: Option<&str>) -> Result<LightningSendResult> {
        if amount == Amount::ZERO {
            return Err(WalletError::invalid("amount must be positive"));
        }
        let address = LightningAddress::from_str(address)?;
        let _op = self.lock_op()?;
        let invoice = self
            .inner()?
            .server
            .resolve_lightning_address(&address, amount.to_sat() * 1000, comment)?;
        let parsed = Invoice::from_str(&invoice)?;
        if parsed.amount() != Some(amount) {
            return Err(WalletError::Protocol(format!("{} returned an invoice for another amount", address)));
        }
        self.pay_invoice_locked(&invoice, None)
    }

    fn pay_invoice_locked(&self, invoice_str: &str, amount: Option<Amount>) -> Result<LightningSendResult> {
        let inner = self.inner()?;
        let info = self.server_info()?;
        let invoice = Invoice::from_str(invoice_str)?;
        if invoice.network != inner.config.network {
            return Err(WalletError::invalid(format!("invoice is for {}", invoice.network.as_str())));
        }
        if invoice.is_expired() {
            return Err(LightningError::InvoiceExpired.into());
        }
        let amount = match (invoice.amount(), amount) {
            (Some(a), Some(b)) if a != b => {
                return Err(WalletError::invalid(format!("invoice is for {}, not {}", a, b)));
            }
            (Some(a), _) | (None, Some(a)) => a,
            (None, None) => return Err(WalletError::invalid("amount is required for a zero-amount invoice")),
        };
        if amount == Amount::ZERO {
            return Err(WalletError::invalid("amount must be positive"));
        }
        let hash = invoice.payment_hash;
        match self.read(|s| s.sends.get(&hash).map(|r| r.status))? {
            Some(SendStatus::Succeeded) => return Err(WalletError::state(format!("invoice {} already paid", hash))),
            Some(SendStatus::Pending) => return Err(WalletError::state(format!("payment {} is in flight", hash))),
            Some(SendStatus::Failed) | None => {}
        }

        let fee = info.lightning_send_fee;
        let total = amount + fee;
        let tip = self.tip()?;
        let mut state = self.snapshot()?;
        let inputs = state.ledger.select_inputs(total, tip)?;
        if let Some(deep) = inputs.iter().find(|v| v.arkoor_depth >= info.max_arkoor_depth) {
            return Err(WalletError::state(format!(
                "vtxo {} reached the maximum arkoor depth, refresh it first",
                deep.id()
            )));
        }
        let available: Amount = inputs.iter().map(|v| v.amount).sum();
        let htlc_policy = VtxoPolicy::ServerHtlcSend {
            user_pubkey: inner.new_keypair(&mut state)?.public_key,
            payment_hash: hash,
            htlc_expiry: tip + info.htlc_send_expiry_delta as u32,
        };
        let change = if available > total {
            Some(VtxoPolicy::new_pubkey(inner.new_keypair(&mut state)?.public_key))
        } else {
            None
        };
        let allocations = allocate(&inputs, &[VtxoRequest { policy: htlc_policy.clone(), amount: total }], change.as_ref())?;
        let input_ids: Vec<VtxoId> = allocations.iter().map(|(v, _)| v.id()).collect();
        let packages = inner.build_packages(&state, allocations)?;
        self.commit(state.clone())?;

        let created = inner.server.cosign_arkoor(packages)?;
        inner.check_server_vtxos(&created)?;

        let mut htlc_ids = Vec::new();
        let mut change_vtxos = Vec::new();
        state.ledger.advance(&input_ids, VtxoState::Spent)?;
        for vtxo in created {
            if vtxo.policy == htlc_policy {
                htlc_ids.push(vtxo.id());
                state.ledger.insert(vtxo, VtxoState::HtlcLocked, false)?;
            } else {
                change_vtxos.push((vtxo.id(), vtxo.amount));
                if !state.ledger.contains(&vtxo.id()) {
                    state.ledger.insert(vtxo, VtxoState::Spendable, false)?;
                }
            }
        }
        let spent: Vec<(VtxoId, Amount)> =
            inputs.iter().filter(|v| input_ids.contains(&v.id())).map(|v| (v.id(), v.amount)).collect();
        state.movements.record(
            MovementBuilder::new(MovementKind::LightningSend)
                .spends(spent)
                .receives(change_vtxos)
                .recipient(invoice_str.trim(), amount)
                .fees(fee),
        );
        state.sends.insert(
            hash,
            SendRecord {
                payment_hash: hash,
                invoice: invoice_str.trim().to_string(),
                amount,
                fee,
                htlc_vtxos: htlc_ids.clone(),
                inputs: input_ids,
                status: SendStatus::Pending,
                preimage: None,
                created_at: Utc::now(),
            },
        );
        self.commit(state)?;
        info!(payment_hash = %hash, %amount, htlcs = htlc_ids.len(), "Htlcs locked, paying");

        match inner.server.pay_lightning(invoice_str.trim(), &htlc_ids) {
            Ok(status) => self.apply_pay_status(hash, status),
            Err(ServerError::Transport(msg)) => {
                warn!(payment_hash = %hash, error = %msg, "Payment outcome unknown, left pending");
                Err(WalletError::Network(msg))
            }
            Err(ServerError::Lightning(e)) => {
                self.revoke_send(hash, &e.to_string());
                Err(e.into())
            }
            Err(e) => {
                self.revoke_send(hash, &e.to_string());
                Err(e.into())
            }
        }
    }

    /// Fold the gateway's answer into the send record.
    fn apply_pay_status(&self, hash: PaymentHash, status: LightningPayStatus) -> Result<LightningSendResult> {
        match status {
            LightningPayStatus::Succeeded { preimage } => {
                if preimage.compute_payment_hash() != hash {
                    return Err(WalletError::Protocol(format!("gateway returned a wrong preimage for {}", hash)));
                }
                let result = self.update(|s| {
                    let record = s
                        .sends
                        .get_mut(&hash)
                        .ok_or_else(|| WalletError::NotFound(format!("payment {}", hash)))?;
                    record.status = SendStatus::Succeeded;
                    record.preimage = Some(preimage);
                    let result = record.result();
                    s.ledger.advance(&result.htlc_vtxos, VtxoState::Spent)?;
                    Ok(result)
                })?;
                info!(payment_hash = %hash, "Lightning payment succeeded");
                Ok(result)
            }
            LightningPayStatus::Pending => self.read(|s| s.sends.get(&hash).map(SendRecord::result))?
                .ok_or_else(|| WalletError::NotFound(format!("payment {}", hash))),
            LightningPayStatus::Failed { reason } => {
                self.revoke_send(hash, &reason);
                Err(LightningError::PaymentFailed(reason).into())
            }
        }
    }

    /// Take the HTLCs of a failed payment back. Errors are logged; the
    /// HTLCs stay locked and the next sync tries again.
    fn revoke_send(&self, hash: PaymentHash, reason: &str) {
        match self.try_revoke_send(hash) {
            Ok(amount) => info!(payment_hash = %hash, %amount, %reason, "Lightning payment failed, htlcs revoked"),
            Err(e) => warn!(payment_hash = %hash, error = %e, "Could not revoke htlcs"),
        }
    }

    fn try_revoke_send(&self, hash: PaymentHash) -> Result<Amount> {
        let inner = self.inner()?;
        let mut state = self.snapshot()?;
        let record = state
            .sends
            .get(&hash)
            .cloned()
            .ok_or_else(|| WalletError::NotFound(format!("payment {}", hash)))?;
        let htlcs: Vec<Vtxo> = record
            .htlc_vtxos
            .iter()
            .filter_map(|id| state.ledger.get(id))
            .filter(|v| v.state == VtxoState::HtlcLocked && v.vtxo.policy.kind() == VtxoPolicyKind::ServerHtlcSend)
            .map(|v| v.vtxo.clone())
            .collect();
        if htlcs.is_empty() {
            return Err(WalletError::state(format!("payment {} has no locked htlcs", hash)));
        }
        let keypair = inner.new_keypair(&mut state)?;
        self.commit(state.clone())?;
        let allocations = htlcs
            .iter()
            .map(|v| (v.clone(), vec![VtxoRequest { policy: VtxoPolicy::new_pubkey(keypair.public_key), amount: v.amount }]))
            .collect();
        let packages = inner.build_packages(&state, allocations)?;
        let created = inner.server.revoke_lightning_payment(packages)?;
        inner.check_server_vtxos(&created)?;

        let ids: Vec<VtxoId> = htlcs.iter().map(|v| v.id()).collect();
        let amount: Amount = created.iter().map(|v| v.amount).sum();
        self.update(|s| {
            s.ledger.advance(&ids, VtxoState::Spent)?;
            for vtxo in &created {
                s.ledger.insert(vtxo.clone(), VtxoState::Spendable, false)?;
            }
            s.movements.record(
                MovementBuilder::new(MovementKind::LightningSendRevocation)
                    .spends(htlcs.iter().map(|v| (v.id(), v.amount)))
                    .receives(created.iter().map(|v| (v.id(), v.amount))),
            );
            if let Some(r) = s.sends.get_mut(&hash) {
                r.status = SendStatus::Failed;
            }
            Ok(())
        })?;
        Ok(amount)
    }

    /// Current state of an outgoing payment, asking the gateway while it is
    /// pending.
    pub fn check_lightning_payment(&self, payment_hash: PaymentHash) -> Result<LightningSendResult> {
        let _op = self.lock_op()?;
        self.check_payment_locked(payment_hash)
    }

    fn check_payment_locked(&self, hash: PaymentHash) -> Result<LightningSendResult> {
        let record = self
            .read(|s| s.sends.get(&hash).cloned())?
            .ok_or_else(|| WalletError::NotFound(format!("payment {}", hash)))?;
        if record.status != SendStatus::Pending {
            return Ok(record.result());
        }
        match self.inner()?.server.check_lightning_payment(hash) {
            Ok(status) => self.apply_pay_status(hash, status),
            // The gateway never saw it, so nothing can settle
            Err(ServerError::NotFound(_)) => {
                self.revoke_send(hash, "payment unknown to the server");
                self.read(|s| s.sends.get(&hash).map(SendRecord::result))?
                    .ok_or_else(|| WalletError::NotFound(format!("payment {}", hash)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claim what arrived and settle pending sends. Never fails the sync.
    pub(crate) fn sync_lightning_locked(&self) {
        let claimed = self.claim_open_receives_locked(false);
        let pending: Vec<PaymentHash> = self
            .read(|s| s.sends.values().filter(|r| r.status == SendStatus::Pending).map(|r| r.payment_hash).collect())
            .unwrap_or_default();
        for hash in pending {
            if let Err(e) = self.check_payment_locked(hash) {
                debug!(payment_hash = %hash, error = %e, "Pending payment not settled");
            }
        }
        debug!(receives = claimed.len(), "Lightning sync done");
    }
}
