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

//! Wallet balance projection.
//!
//! A merchant's available balance is never stored authoritatively. It is
//! replayed from records every time:
//!
//! ```text
//! balance = Σ net_amount(paid, settled payins)
//!         - Σ amount(payouts that are requested, pending, approved, processing, or completed)
//! ```
//!
//! Replay order is settled payins by `(settled_at, order_id)`, then payouts by
//! `(requested_at, id)`, so the audit trail is deterministic. The final sum
//! does not depend on the order.

use crate::base::{Amount, MerchantId, OrderId, PayoutId};
use crate::error::{DataIntegrityWarning, LedgerError, Result};
use crate::payout::{Payout, PayoutStatus};
use crate::store::LedgerStore;
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One line of the replay audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ReplayStep {
    #[serde(rename_all = "camelCase")]
    Credit {
        order_id: OrderId,
        amount: Amount,
        balance_after: Amount,
    },
    #[serde(rename_all = "camelCase")]
    Debit {
        payout_id: PayoutId,
        status: PayoutStatus,
        amount: Amount,
        balance_after: Amount,
    },
}

/// Point-in-time wallet balance with its audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    pub merchant_id: MerchantId,
    pub as_of: Option<DateTime<Utc>>,
    pub balance: Amount,
    pub credits: Amount,
    pub debits: Amount,
    pub trail: Vec<ReplayStep>,
    pub warnings: Vec<DataIntegrityWarning>,
}

/// Replays `transactions` and `payouts` of one merchant.
///
/// Records belonging to other merchants are skipped. A settled payin whose
/// stored net amount disagrees with `gross - commission` is credited with the
/// stored value and reported in [`Projection::warnings`].
pub fn replay(
    merchant_id: MerchantId,
    transactions: &[Transaction],
    payouts: &[Payout],
    as_of: Option<DateTime<Utc>>,
) -> Projection {
    let mut credited: Vec<&Transaction> = transactions
        .iter()
        .filter(|t| t.merchant_id == merchant_id && t.is_credit(as_of))
        .collect();
    credited.sort_by(|a, b| {
        (a.settled_at, &a.order_id).cmp(&(b.settled_at, &b.order_id))
    });

    let mut debited: Vec<(&Payout, PayoutStatus)> = payouts
        .iter()
        .filter(|p| p.merchant_id == merchant_id)
        .filter_map(|p| p.status_at(as_of).map(|status| (p, status)))
        .filter(|(_, status)| status.debits_wallet())
        .collect();
    debited.sort_by_key(|(p, _)| (p.requested_at, p.id));

    let mut projection = Projection {
        merchant_id,
        as_of,
        balance: 0,
        credits: 0,
        debits: 0,
        trail: Vec::with_capacity(credited.len() + debited.len()),
        warnings: Vec::new(),
    };

    for transaction in credited {
        if let Some(warning) = transaction.integrity_warning() {
            tracing::warn!(
                merchant = %warning.merchant_id,
                order = %warning.order_id,
                stored_net = warning.stored_net,
                expected_net = warning.expected_net(),
                "net amount disagrees with gross minus commission; using stored value"
            );
            projection.warnings.push(warning);
        }
        let amount = transaction.credited_amount();
        projection.credits += amount;
        projection.balance += amount;
        projection.trail.push(ReplayStep::Credit {
            order_id: transaction.order_id.clone(),
            amount,
            balance_after: projection.balance,
        });
    }

    for (payout, status) in debited {
        projection.debits += payout.amount;
        projection.balance -= payout.amount;
        projection.trail.push(ReplayStep::Debit {
            payout_id: payout.id,
            status,
            amount: payout.amount,
            balance_after: projection.balance,
        });
    }

    projection
}

/// Projects a merchant's balance from the store.
///
/// # Errors
///
/// [`LedgerError::MerchantNotFound`] if the merchant does not exist.
pub fn project_balance<S: LedgerStore + ?Sized>(
    store: &S,
    merchant_id: MerchantId,
    as_of: Option<DateTime<Utc>>,
) -> Result<Projection> {
    if store.merchant(merchant_id).is_none() {
        return Err(LedgerError::MerchantNotFound(merchant_id));
    }
    Ok(replay(
        merchant_id,
        &store.transactions_for(merchant_id),
        &store.payouts_for(merchant_id),
        as_of,
    ))
}
