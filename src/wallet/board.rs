//! Boarding: moving onchain funds into a VTXO.

use bitcoin::{Amount, OutPoint, Txid};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::Wallet;
use crate::error::{Result, WalletError};
use crate::movement::{MovementBuilder, MovementKind};
use crate::server::{outpoint, BoardCosignRequest};
use crate::vtxo::tx::{anchor_script, cosign_witness, exit_tx, p2wsh, sign_input, verify_input, vtxo_txout};
use crate::vtxo::{Vtxo, VtxoId, VtxoPolicy, VtxoRequest, VtxoState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub funding_txid: Txid,
    pub vtxos: Vec<VtxoId>,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
}

impl Wallet {
    /// Board `amount` from the onchain wallet.
    pub fn board_amount(&self, amount: Amount) -> Result<Board> {
        if amount == Amount::ZERO {
            return Err(WalletError::invalid("board amount must be positive"));
        }
        let _op = self.lock_op()?;
        self.board(Some(amount))
    }

    /// Board the whole onchain balance, minus the funding fee.
    pub fn board_all(&self) -> Result<Board> {
        let _op = self.lock_op()?;
        self.board(None)
    }

    fn board(&self, amount: Option<Amount>) -> Result<Board> {
        let inner = self.inner()?;
        let info = self.server_info()?;
        let fee_rate = self.resolve_fee_rate(None)?;
        let tip = inner.chain.tip()?;
        let expiry_height = tip + info.vtxo_expiry_delta;

        let mut state = self.snapshot()?;
        let keypair = inner.new_keypair(&mut state)?;
        let script = anchor_script(&keypair.public_key, &info.server_pubkey, expiry_height);
        let anchor_spk = p2wsh(&script);

        if let Some(amount) = amount {
            if amount < info.min_board_amount {
                return Err(WalletError::invalid(format!(
                    "board amount {} below server minimum {}",
                    amount, info.min_board_amount
                )));
            }
        }
        let (funding, funding_fee) = match amount {
            Some(amount) => inner.onchain.create_tx(&[(anchor_spk.clone(), amount)], None, fee_rate)?,
            None => inner.onchain.create_tx(&[], Some(anchor_spk.clone()), fee_rate)?,
        };
        let vout = funding
            .output
            .iter()
            .position(|o| o.script_pubkey == anchor_spk)
            .ok_or_else(|| WalletError::Protocol("funding tx lacks the board output".into()))?;
        let amount = funding.output[vout].value;
        if amount < info.min_board_amount {
            inner.onchain.cancel(&funding)?;
            return Err(WalletError::invalid(format!(
                "board amount {} below server minimum {}",
                amount, info.min_board_amount
            )));
        }
        let anchor_point = OutPoint::new(funding.compute_txid(), vout as u32);

        let request = VtxoRequest { policy: VtxoPolicy::new_pubkey(keypair.public_key), amount };
        let mut exit = exit_tx(anchor_point, vec![vtxo_txout(&request, &info.server_pubkey, info.vtxo_exit_delta)]);
        let user_sig = sign_input(inner.keys.secp(), &exit, 0, &script, amount, keypair.secret_key())?;
        let cosigned = inner
            .server
            .cosign_board(BoardCosignRequest {
                user_pubkey: keypair.public_key,
                amount,
                expiry_height,
                exit_tx: exit.clone(),
                user_sig,
            })
            .map_err(WalletError::from)
            .and_then(|sig| {
                if verify_input(inner.keys.secp(), &exit, 0, &script, amount, &sig, &info.server_pubkey) {
                    Ok(sig)
                } else {
                    Err(WalletError::Protocol("server returned an invalid board signature".into()))
                }
            });
        let server_sig = match cosigned {
            Ok(sig) => sig,
            Err(e) => {
                inner.onchain.cancel(&funding)?;
                return Err(e);
            }
        };
        exit.input[0].witness = cosign_witness(&user_sig, &server_sig, &script);

        let vtxo = Vtxo {
            point: outpoint(&exit, 0),
            amount,
            expiry_height,
            server_pubkey: info.server_pubkey,
            exit_delta: info.vtxo_exit_delta,
            anchor_point,
            policy: request.policy,
            exit_txs: vec![exit],
            arkoor_depth: 0,
        };
        vtxo.validate().map_err(|e| WalletError::Protocol(format!("board vtxo: {}", e)))?;
        let id = vtxo.id();

        // The signed exit tx must be on disk before the funds leave.
        state.ledger.insert(vtxo, VtxoState::PendingBoard, false)?;
        self.commit(state)?;

        let funding_txid = funding.compute_txid();
        if let Err(e) = inner.chain.broadcast(&funding) {
            warn!(txid = %funding_txid, error = %e, "Board funding broadcast failed");
            inner.onchain.cancel(&funding)?;
            self.update(|s| s.ledger.advance(&[id], VtxoState::Spent))?;
            return Err(e.into());
        }
        inner.onchain.mark_broadcast(&funding)?;
        self.update(|s| {
            s.movements.record(
                MovementBuilder::new(MovementKind::Board)
                    .receives([(id, amount)])
                    .fees(funding_fee)
                    .txid(funding_txid),
            );
            Ok(())
        })?;
        info!(vtxo = %id, %amount, txid = %funding_txid, "Board funding broadcast");

        // Registers right away when the server needs no confirmations.
        self.sync_pending_boards_locked()?;
        Ok(Board { funding_txid, vtxos: vec![id], amount })
    }

    /// Register boards whose funding tx is deep enough.
    pub fn sync_pending_boards(&self) -> Result<Vec<VtxoId>> {
        let _op = self.lock_op()?;
        self.sync_pending_boards_locked()
    }

    pub(crate) fn sync_pending_boards_locked(&self) -> Result<Vec<VtxoId>> {
        let inner = self.inner()?;
        let info = self.server_info()?;
        let pending: Vec<Vtxo> = self.read(|s| s.ledger.in_state(VtxoState::PendingBoard).map(|v| v.vtxo.clone()).collect())?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let tip = inner.chain.tip()?;
        let mut registered = Vec::new();
        for vtxo in pending {
            let confirmations = inner.chain.tx_status(&vtxo.anchor_point.txid)?.confirmations(tip);
            if confirmations < info.required_board_confirmations {
                debug!(vtxo = %vtxo.id(), confirmations, "Board not deep enough yet");
                continue;
            }
            match inner.server.register_board(&vtxo) {
                Ok(()) => registered.push(vtxo.id()),
                Err(e) => warn!(vtxo = %vtxo.id(), error = %e, "Board registration failed"),
            }
        }
        if !registered.is_empty() {
            let ids = registered.clone();
            self.update(|s| s.ledger.advance(&ids, VtxoState::Spendable))?;
            info!(count = registered.len(), "Boards registered");
        }
        Ok(registered)
    }
}
