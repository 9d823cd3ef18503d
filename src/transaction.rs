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

//! Payin transactions.
//!
//! Payment status follows the gateway callbacks:
//! - [`Pending`](PaymentStatus::Pending) → [`Paid`](PaymentStatus::Paid) or
//!   [`Failed`](PaymentStatus::Failed)
//!
//! Settlement happens once per paid transaction and fixes its commission:
//! - [`Unsettled`](SettlementStatus::Unsettled) → [`Settled`](SettlementStatus::Settled)

use crate::base::{Amount, MerchantId, OrderId};
use crate::commission::{Commission, Direction, SchemeConfig, compute_commission};
use crate::error::{DataIntegrityWarning, LedgerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Unsettled,
    Settled,
}

/// Gateway callback payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    pub order_id: OrderId,
    pub merchant_id: MerchantId,
    pub gross_amount: Amount,
    pub status: PaymentStatus,
    pub gateway: String,
    pub gateway_ref: Option<String>,
}

/// A customer payment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub order_id: OrderId,
    pub merchant_id: MerchantId,
    pub gross_amount: Amount,
    pub status: PaymentStatus,
    pub settlement_status: SettlementStatus,
    pub settled_at: Option<DateTime<Utc>>,
    /// Fixed at settlement, including the audit breakdown.
    pub commission: Option<Commission>,
    pub net_amount: Option<Amount>,
    pub gateway: String,
    pub gateway_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Creates a transaction from the first callback seen for an order.
    pub fn from_event(event: TransactionEvent, at: DateTime<Utc>) -> Result<Self> {
        if event.gross_amount < 0 {
            return Err(LedgerError::InvalidAmount(event.gross_amount));
        }
        Ok(Self {
            order_id: event.order_id,
            merchant_id: event.merchant_id,
            gross_amount: event.gross_amount,
            status: event.status,
            settlement_status: SettlementStatus::Unsettled,
            settled_at: None,
            commission: None,
            net_amount: None,
            gateway: event.gateway,
            gateway_ref: event.gateway_ref,
            created_at: at,
            updated_at: at,
        })
    }

    /// Applies a repeated callback for the same order.
    ///
    /// Unsettled transactions take the new status, amount, and reference.
    /// Settled transactions only accept an identical replay.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::ClientMismatch`] - callback names another merchant.
    /// - [`LedgerError::InvalidAmount`] - negative gross amount.
    /// - [`LedgerError::AlreadySettled`] - callback would change a settled record.
    pub fn apply_event(&mut self, event: &TransactionEvent, at: DateTime<Utc>) -> Result<()> {
        if event.merchant_id != self.merchant_id {
            return Err(LedgerError::ClientMismatch(self.merchant_id));
        }
        if event.gross_amount < 0 {
            return Err(LedgerError::InvalidAmount(event.gross_amount));
        }
        if self.is_settled() {
            if event.status != self.status || event.gross_amount != self.gross_amount {
                return Err(LedgerError::AlreadySettled(self.order_id.clone()));
            }
            return Ok(());
        }

        self.status = event.status;
        self.gross_amount = event.gross_amount;
        self.gateway.clone_from(&event.gateway);
        if event.gateway_ref.is_some() {
            self.gateway_ref.clone_from(&event.gateway_ref);
        }
        self.updated_at = at;
        Ok(())
    }

    /// Settles a paid transaction, computing its commission once.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotPaid`] - transaction is pending or failed.
    /// - [`LedgerError::AlreadySettled`] - commission is already fixed.
    /// - Any error from [`compute_commission`].
    pub fn settle(&mut self, scheme: &SchemeConfig, at: DateTime<Utc>) -> Result<&Commission> {
        if self.status != PaymentStatus::Paid {
            return Err(LedgerError::NotPaid(self.order_id.clone()));
        }
        if self.is_settled() {
            return Err(LedgerError::AlreadySettled(self.order_id.clone()));
        }

        let commission = compute_commission(self.gross_amount, scheme, Direction::Payin)?;
        self.net_amount = Some(commission.net_amount);
        self.settlement_status = SettlementStatus::Settled;
        self.settled_at = Some(at);
        self.updated_at = at;
        Ok(&*self.commission.insert(commission))
    }

    pub fn is_settled(&self) -> bool {
        self.settlement_status == SettlementStatus::Settled
    }

    /// True when the transaction credits the wallet at `as_of`.
    pub fn is_credit(&self, as_of: Option<DateTime<Utc>>) -> bool {
        self.status == PaymentStatus::Paid
            && self.is_settled()
            && match (self.settled_at, as_of) {
                (Some(settled_at), Some(as_of)) => settled_at <= as_of,
                (_, None) => true,
                (None, Some(_)) => false,
            }
    }

    /// Commission amount fixed at settlement, zero before.
    pub fn commission_amount(&self) -> Amount {
        self.commission.as_ref().map_or(0, |c| c.commission)
    }

    /// Stored net amount, falling back to gross minus commission.
    pub fn credited_amount(&self) -> Amount {
        self.net_amount
            .unwrap_or(self.gross_amount - self.commission_amount())
    }

    /// Key shared with bank statement lines.
    pub fn settlement_key(&self) -> &str {
        self.gateway_ref.as_deref().unwrap_or(self.order_id.as_str())
    }

    /// Reports a stored net amount that disagrees with `gross - commission`.
    pub fn integrity_warning(&self) -> Option<DataIntegrityWarning> {
        let stored_net = self.net_amount?;
        let commission = self.commission_amount();
        if stored_net == self.gross_amount - commission {
            return None;
        }
        Some(DataIntegrityWarning {
            merchant_id: self.merchant_id,
            order_id: self.order_id.clone(),
            gross_amount: self.gross_amount,
            commission,
            stored_net,
        })
    }
}
