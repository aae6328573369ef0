//! Movements: append-only history of everything that changed the balance.

use bitcoin::{Amount, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vtxo::VtxoId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MovementKind {
    Board,
    ArkoorSend,
    ArkoorReceive,
    Refresh,
    Offboard,
    RoundOnchain,
    LightningSend,
    LightningSendRevocation,
    LightningReceive,
    Exit,
    OnchainSend,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::Board => "board",
            MovementKind::ArkoorSend => "arkoor-send",
            MovementKind::ArkoorReceive => "arkoor-receive",
            MovementKind::Refresh => "refresh",
            MovementKind::Offboard => "offboard",
            MovementKind::RoundOnchain => "round-onchain",
            MovementKind::LightningSend => "lightning-send",
            MovementKind::LightningSendRevocation => "lightning-send-revocation",
            MovementKind::LightningReceive => "lightning-receive",
            MovementKind::Exit => "exit",
            MovementKind::OnchainSend => "onchain-send",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRecipient {
    /// Address, invoice or pubkey exactly as the caller gave it.
    pub recipient: String,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VtxoAmount {
    pub id: VtxoId,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub id: u64,
    pub kind: MovementKind,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub fees: Amount,
    pub created_at: DateTime<Utc>,
    pub spends: Vec<VtxoAmount>,
    pub receives: Vec<VtxoAmount>,
    pub recipients: Vec<MovementRecipient>,
    pub txid: Option<Txid>,
}

impl Movement {
    pub fn spent_amount(&self) -> Amount {
        self.spends.iter().map(|v| v.amount).sum()
    }

    pub fn received_amount(&self) -> Amount {
        self.receives.iter().map(|v| v.amount).sum()
    }

    /// Signed change of the offchain balance, in sats.
    pub fn offchain_delta(&self) -> i64 {
        self.received_amount().to_sat() as i64 - self.spent_amount().to_sat() as i64
    }
}

/// A movement waiting for its id. Built by the operation that caused it.
#[derive(Debug, Clone)]
pub struct MovementBuilder {
    kind: MovementKind,
    fees: Amount,
    spends: Vec<VtxoAmount>,
    receives: Vec<VtxoAmount>,
    recipients: Vec<MovementRecipient>,
    txid: Option<Txid>,
}

impl MovementBuilder {
    pub fn new(kind: MovementKind) -> Self {
        Self {
            kind,
            fees: Amount::ZERO,
            spends: Vec::new(),
            receives: Vec::new(),
            recipients: Vec::new(),
            txid: None,
        }
    }

    pub fn fees(mut self, fees: Amount) -> Self {
        self.fees = fees;
        self
    }

    pub fn spends(mut self, vtxos: impl IntoIterator<Item = (VtxoId, Amount)>) -> Self {
        self.spends.extend(vtxos.into_iter().map(|(id, amount)| VtxoAmount { id, amount }));
        self
    }

    pub fn receives(mut self, vtxos: impl IntoIterator<Item = (VtxoId, Amount)>) -> Self {
        self.receives.extend(vtxos.into_iter().map(|(id, amount)| VtxoAmount { id, amount }));
        self
    }

    pub fn recipient(mut self, recipient: impl Into<String>, amount: Amount) -> Self {
        self.recipients.push(MovementRecipient { recipient: recipient.into(), amount });
        self
    }

    pub fn txid(mut self, txid: Txid) -> Self {
        self.txid = Some(txid);
        self
    }
}

/// The movement log. Ids are assigned in insertion order and never reused.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementLog {
    next_id: u64,
    entries: Vec<Movement>,
}

impl MovementLog {
    pub fn record(&mut self, builder: MovementBuilder) -> &Movement {
        let movement = Movement {
            id: self.next_id,
            kind: builder.kind,
            fees: builder.fees,
            created_at: Utc::now(),
            spends: builder.spends,
            receives: builder.receives,
            recipients: builder.recipients,
            txid: builder.txid,
        };
        self.next_id += 1;
        self.entries.push(movement);
        &self.entries[self.entries.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest first.
    pub fn list(&self) -> Vec<Movement> {
        self.entries.iter().rev().cloned().collect()
    }

    pub fn of_kind(&self, kind: MovementKind) -> impl Iterator<Item = &Movement> {
        self.entries.iter().filter(move |m| m.kind == kind)
    }
}
