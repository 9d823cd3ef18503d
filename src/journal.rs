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

//! Double-entry journal entries.
//!
//! A [`JournalEntry`] can only be built balanced: the constructor rejects any
//! set of lines whose debits and credits differ. Posted entries are never
//! edited; corrections are new entries.

use crate::base::{Amount, EntryId, OrderId};
use crate::error::{LedgerError, Result};
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Capture,
    PartialRefund,
    DisputeReversal,
    Adjustment,
}

/// Chart of accounts used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerAccount {
    /// Funds owed to the platform by gateways.
    GatewayClearing,
    /// Funds owed to merchants.
    MerchantPayable,
    CommissionRevenue,
    /// Differences between ledger and bank absorbed by reconciliation.
    GatewayFeeAdjustment,
    /// Held against open disputes.
    DisputeReserve,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalLine {
    pub account: LedgerAccount,
    pub debit: Amount,
    pub credit: Amount,
    pub reference: Option<String>,
}

impl JournalLine {
    pub fn debit(account: LedgerAccount, amount: Amount, reference: Option<String>) -> Self {
        Self {
            account,
            debit: amount,
            credit: 0,
            reference,
        }
    }

    pub fn credit(account: LedgerAccount, amount: Amount, reference: Option<String>) -> Self {
        Self {
            account,
            debit: 0,
            credit: amount,
            reference,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: EntryId,
    pub date: DateTime<Utc>,
    pub kind: EntryKind,
    pub order_id: Option<OrderId>,
    pub lines: Vec<JournalLine>,
}

impl JournalEntry {
    /// Builds an entry from its lines.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] - a line carries a negative amount, or
    ///   the entry moves no money.
    /// - [`LedgerError::UnbalancedEntry`] - debits and credits differ.
    pub fn new(
        kind: EntryKind,
        order_id: Option<OrderId>,
        date: DateTime<Utc>,
        lines: Vec<JournalLine>,
    ) -> Result<Self> {
        if let Some(line) = lines.iter().find(|l| l.debit < 0 || l.credit < 0) {
            return Err(LedgerError::InvalidAmount(line.debit.min(line.credit)));
        }
        let entry = Self {
            id: EntryId::new(),
            date,
            kind,
            order_id,
            lines,
        };
        let (debits, credits) = (entry.debits(), entry.credits());
        if debits != credits {
            return Err(LedgerError::UnbalancedEntry { debits, credits });
        }
        if debits == 0 {
            return Err(LedgerError::InvalidAmount(0));
        }
        Ok(entry)
    }

    /// Capture of a settled payin: the gateway owes the gross amount, split
    /// between the merchant and commission revenue.
    pub fn capture(transaction: &Transaction, date: DateTime<Utc>) -> Result<Self> {
        if !transaction.is_settled() {
            return Err(LedgerError::NotPaid(transaction.order_id.clone()));
        }
        let reference = Some(transaction.settlement_key().to_string());
        let mut lines = vec![
            JournalLine::debit(
                LedgerAccount::GatewayClearing,
                transaction.gross_amount,
                reference.clone(),
            ),
            JournalLine::credit(
                LedgerAccount::MerchantPayable,
                transaction.credited_amount(),
                reference.clone(),
            ),
        ];
        let commission = transaction.commission_amount();
        if commission > 0 {
            lines.push(JournalLine::credit(
                LedgerAccount::CommissionRevenue,
                commission,
                reference,
            ));
        }
        Self::new(
            EntryKind::Capture,
            Some(transaction.order_id.clone()),
            date,
            lines,
        )
    }

    /// Part of a captured payin returned to the customer.
    pub fn partial_refund(order_id: OrderId, amount: Amount, date: DateTime<Utc>) -> Result<Self> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let reference = Some(order_id.to_string());
        Self::new(
            EntryKind::PartialRefund,
            Some(order_id),
            date,
            vec![
                JournalLine::debit(LedgerAccount::MerchantPayable, amount, reference.clone()),
                JournalLine::credit(LedgerAccount::GatewayClearing, amount, reference),
            ],
        )
    }

    /// Funds pulled back from the merchant into the dispute reserve.
    pub fn dispute_reversal(order_id: OrderId, amount: Amount, date: DateTime<Utc>) -> Result<Self> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let reference = Some(order_id.to_string());
        Self::new(
            EntryKind::DisputeReversal,
            Some(order_id),
            date,
            vec![
                JournalLine::debit(LedgerAccount::MerchantPayable, amount, reference.clone()),
                JournalLine::credit(LedgerAccount::DisputeReserve, amount, reference),
            ],
        )
    }

    /// Adjustment that absorbs a ledger/bank difference.
    ///
    /// `delta` is `ledger - bank`. A positive delta means the bank received
    /// less than booked, so the gap is expensed against gateway clearing.
    pub fn adjustment(
        order_id: Option<OrderId>,
        delta: Amount,
        reference: &str,
        date: DateTime<Utc>,
    ) -> Result<Self> {
        let amount = delta.checked_abs().ok_or(LedgerError::InvalidAmount(delta))?;
        let reference = Some(reference.to_string());
        let (debit_account, credit_account) = if delta > 0 {
            (LedgerAccount::GatewayFeeAdjustment, LedgerAccount::GatewayClearing)
        } else {
            (LedgerAccount::GatewayClearing, LedgerAccount::GatewayFeeAdjustment)
        };
        Self::new(
            EntryKind::Adjustment,
            order_id,
            date,
            vec![
                JournalLine::debit(debit_account, amount, reference.clone()),
                JournalLine::credit(credit_account, amount, reference),
            ],
        )
    }

    pub fn debits(&self) -> Amount {
        self.lines.iter().map(|line| line.debit).sum()
    }

    pub fn credits(&self) -> Amount {
        self.lines.iter().map(|line| line.credit).sum()
    }

    pub fn is_balanced(&self) -> bool {
        self.debits() == self.credits()
    }

    /// Net effect on `account`, debits positive.
    pub fn net_for(&self, account: LedgerAccount) -> Amount {
        self.lines
            .iter()
            .filter(|line| line.account == account)
            .map(|line| line.debit - line.credit)
            .sum()
    }
}
