// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Payout requests and their state machine.
//!
//! ```text
//!  Requested ──hold──► Pending
//!      │                  │
//!      ├──approve─────────┴──approve──► Approved ──process──► Processing ──complete──► Completed
//!      │                  │                │                      │
//!      ├──reject──────────┴──reject────────┘──reject──► Rejected  └──fail──► Failed
//!      └──cancel──────────┴──cancel──► Cancelled
//! ```
//!
//! Terminal states accept no further transitions. Every transition is
//! validated before anything is written, so a failed call leaves the payout
//! untouched.

use crate::base::{Actor, Amount, MerchantId, PayoutId};
use crate::commission::Commission;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Requested,
    Pending,
    Approved,
    Processing,
    Completed,
    Rejected,
    Failed,
    Cancelled,
}

impl PayoutStatus {
    /// States reachable in one step.
    pub fn next_states(self) -> &'static [PayoutStatus] {
        use PayoutStatus::*;
        match self {
            Requested => &[Pending, Approved, Rejected, Cancelled],
            Pending => &[Approved, Rejected, Cancelled],
            Approved => &[Processing, Rejected],
            Processing => &[Completed, Failed],
            Completed | Rejected | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, to: PayoutStatus) -> bool {
        self.next_states().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        self.next_states().is_empty()
    }

    /// True when a payout in this state counts against the wallet.
    ///
    /// In-flight payouts reserve their amount; completed payouts are paid out.
    /// Failed, rejected, and cancelled payouts never debit.
    pub fn debits_wallet(self) -> bool {
        matches!(
            self,
            Self::Requested | Self::Pending | Self::Approved | Self::Processing | Self::Completed
        )
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Requested => "requested",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Destination of a payout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Beneficiary {
    #[serde(rename_all = "camelCase")]
    Bank {
        account_number: String,
        ifsc: String,
        holder_name: String,
    },
    Upi { vpa: String },
}

/// Merchant withdrawal request as submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutRequest {
    pub merchant_id: MerchantId,
    pub amount: Amount,
    pub currency: String,
    pub beneficiary: Beneficiary,
}

/// One step in a payout's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub from: Option<PayoutStatus>,
    pub to: PayoutStatus,
    pub actor: Actor,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

/// A merchant payout and its full transition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payout {
    pub id: PayoutId,
    pub merchant_id: MerchantId,
    /// Amount debited from the wallet.
    pub amount: Amount,
    pub currency: String,
    pub beneficiary: Beneficiary,
    pub status: PayoutStatus,
    /// Locked when processing starts.
    pub commission: Option<Commission>,
    /// Amount actually transferred, `amount - commission`.
    pub net_amount: Option<Amount>,
    /// Bank settlement reference, set on completion.
    pub utr: Option<String>,
    pub rejection_reason: Option<String>,
    pub admin_notes: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub history: Vec<TransitionRecord>,
}

impl Payout {
    /// Creates a payout in [`PayoutStatus::Requested`].
    pub fn new(id: PayoutId, request: PayoutRequest, actor: Actor, at: DateTime<Utc>) -> Result<Self> {
        if request.amount <= 0 {
            return Err(LedgerError::InvalidAmount(request.amount));
        }
        Ok(Self {
            id,
            merchant_id: request.merchant_id,
            amount: request.amount,
            currency: request.currency,
            beneficiary: request.beneficiary,
            status: PayoutStatus::Requested,
            commission: None,
            net_amount: None,
            utr: None,
            rejection_reason: None,
            admin_notes: None,
            requested_at: at,
            history: vec![TransitionRecord {
                from: None,
                to: PayoutStatus::Requested,
                actor,
                at,
                note: None,
            }],
        })
    }

    /// Fails with [`LedgerError::InvalidTransition`] unless `to` is reachable.
    pub fn check_transition(&self, to: PayoutStatus) -> Result<()> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(LedgerError::InvalidTransition {
                from: self.status,
                to,
            })
        }
    }

    fn record(&mut self, to: PayoutStatus, actor: Actor, at: DateTime<Utc>, note: Option<String>) {
        self.history.push(TransitionRecord {
            from: Some(self.status),
            to,
            actor,
            at,
            note,
        });
        self.status = to;
    }

    /// Parks the payout for review.
    pub fn hold(&mut self, actor: Actor, at: DateTime<Utc>, note: Option<String>) -> Result<()> {
        self.check_transition(PayoutStatus::Pending)?;
        self.record(PayoutStatus::Pending, actor, at, note);
        Ok(())
    }

    /// Marks the payout approved. Balance checks belong to the caller.
    pub fn approve(&mut self, actor: Actor, at: DateTime<Utc>) -> Result<()> {
        self.check_transition(PayoutStatus::Approved)?;
        self.record(PayoutStatus::Approved, actor, at, None);
        Ok(())
    }

    /// Starts the transfer and locks the payout commission.
    pub fn start_processing(
        &mut self,
        commission: Commission,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_transition(PayoutStatus::Processing)?;
        if commission.breakdown.gross_amount != self.amount {
            return Err(LedgerError::InvalidAmount(commission.breakdown.gross_amount));
        }
        self.net_amount = Some(commission.net_amount);
        self.commission = Some(commission);
        self.record(PayoutStatus::Processing, actor, at, None);
        Ok(())
    }

    /// Records the bank confirmation.
    pub fn complete(&mut self, utr: &str, actor: Actor, at: DateTime<Utc>) -> Result<()> {
        self.check_transition(PayoutStatus::Completed)?;
        let utr = utr.trim();
        if utr.is_empty() {
            return Err(LedgerError::MissingReference);
        }
        self.utr = Some(utr.to_string());
        self.record(PayoutStatus::Completed, actor, at, None);
        Ok(())
    }

    /// Records a transfer failure. The amount is released back to the wallet.
    pub fn fail(&mut self, admin_notes: &str, actor: Actor, at: DateTime<Utc>) -> Result<()> {
        self.check_transition(PayoutStatus::Failed)?;
        let notes = required_reason(admin_notes)?;
        self.admin_notes = Some(notes.clone());
        self.record(PayoutStatus::Failed, actor, at, Some(notes));
        Ok(())
    }

    pub fn reject(&mut self, reason: &str, actor: Actor, at: DateTime<Utc>) -> Result<()> {
        self.check_transition(PayoutStatus::Rejected)?;
        let reason = required_reason(reason)?;
        self.rejection_reason = Some(reason.clone());
        self.record(PayoutStatus::Rejected, actor, at, Some(reason));
        Ok(())
    }

    pub fn cancel(&mut self, reason: &str, actor: Actor, at: DateTime<Utc>) -> Result<()> {
        self.check_transition(PayoutStatus::Cancelled)?;
        let reason = required_reason(reason)?;
        self.record(PayoutStatus::Cancelled, actor, at, Some(reason));
        Ok(())
    }

    /// Status at `as_of`, replayed from the history.
    ///
    /// Returns `None` when the payout did not exist yet.
    pub fn status_at(&self, as_of: Option<DateTime<Utc>>) -> Option<PayoutStatus> {
        let Some(as_of) = as_of else {
            return Some(self.status);
        };
        self.history
            .iter()
            .take_while(|record| record.at <= as_of)
            .last()
            .map(|record| record.to)
    }

    /// Most recent transition into `status`.
    pub fn transition_to(&self, status: PayoutStatus) -> Option<&TransitionRecord> {
        self.history.iter().rev().find(|record| record.to == status)
    }
}

fn required_reason(reason: &str) -> Result<String> {
    let reason = reason.trim();
    if reason.is_empty() {
        Err(LedgerError::MissingReason)
    } else {
        Ok(reason.to_string())
    }
}

/// Payout with the transitions a client may offer next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutView {
    pub payout: Payout,
    pub next_states: Vec<PayoutStatus>,
}

impl From<Payout> for PayoutView {
    fn from(payout: Payout) -> Self {
        let next_states = payout.status.next_states().to_vec();
        Self {
            payout,
            next_states,
        }
    }
}

/// Domain event emitted when a payout reaches a transfer outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum PayoutEvent {
    #[serde(rename_all = "camelCase")]
    Completed {
        payout_id: PayoutId,
        merchant_id: MerchantId,
        amount: Amount,
        net_amount: Amount,
        utr: String,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        payout_id: PayoutId,
        merchant_id: MerchantId,
        amount: Amount,
        reason: String,
        at: DateTime<Utc>,
    },
}
