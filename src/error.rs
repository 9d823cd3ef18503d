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

//! Error types for ledger operations.
//!
//! Validation failures are returned as [`LedgerError`] and never leave partial
//! state behind. Non-fatal data problems are reported as
//! [`DataIntegrityWarning`] values next to a best-effort result.

use crate::base::{Amount, EntryId, ExceptionId, MerchantId, OrderId, PayoutId};
use crate::payout::PayoutStatus;
use crate::reconcile::ExceptionStatus;
use serde::Serialize;
use thiserror::Error;

/// Ledger operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Amount is negative, zero where a positive value is required, or overflows
    #[error("invalid amount: {0}")]
    InvalidAmount(Amount),

    /// Commission configuration is malformed
    #[error("invalid commission scheme: {0}")]
    InvalidScheme(String),

    /// Projected wallet balance does not cover the payout
    #[error("insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: Amount, required: Amount },

    /// Payout state machine move outside the allowed edge set
    #[error("invalid payout transition from {from} to {to}")]
    InvalidTransition { from: PayoutStatus, to: PayoutStatus },

    /// Exception lifecycle move outside the allowed edge set
    #[error("invalid exception transition from {from} to {to}")]
    InvalidExceptionTransition {
        from: ExceptionStatus,
        to: ExceptionStatus,
    },

    #[error("merchant {0} not found")]
    MerchantNotFound(MerchantId),

    #[error("merchant {0} already exists")]
    DuplicateMerchant(MerchantId),

    /// Merchant is inactive or suspended
    #[error("merchant {0} is not active")]
    MerchantInactive(MerchantId),

    #[error("transaction {0} not found")]
    TransactionNotFound(OrderId),

    #[error("duplicate transaction {0}")]
    DuplicateTransaction(OrderId),

    /// Referenced record belongs to another merchant
    #[error("record does not belong to merchant {0}")]
    ClientMismatch(MerchantId),

    /// Settlement requires a paid transaction
    #[error("transaction {0} is not paid")]
    NotPaid(OrderId),

    /// Commission is computed once at settlement
    #[error("transaction {0} is already settled")]
    AlreadySettled(OrderId),

    #[error("payout {0} not found")]
    PayoutNotFound(PayoutId),

    #[error("duplicate payout {0}")]
    DuplicatePayout(PayoutId),

    /// Rejections, cancellations, and failures must carry a reason
    #[error("a reason is required for this transition")]
    MissingReason,

    /// Completion requires the bank settlement reference (UTR)
    #[error("a settlement reference is required")]
    MissingReference,

    /// Debits and credits of a journal entry differ
    #[error("unbalanced journal entry: debits {debits}, credits {credits}")]
    UnbalancedEntry { debits: Amount, credits: Amount },

    /// Posted entries are never replaced
    #[error("journal entry {0} already posted")]
    DuplicateEntry(EntryId),

    #[error("exception {0} not found")]
    ExceptionNotFound(ExceptionId),
}

impl LedgerError {
    /// Stable machine-readable code for API callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::InvalidScheme(_) => "INVALID_SCHEME",
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::InvalidTransition { .. } | Self::InvalidExceptionTransition { .. } => {
                "INVALID_TRANSITION"
            }
            Self::MerchantNotFound(_) => "MERCHANT_NOT_FOUND",
            Self::DuplicateMerchant(_) => "DUPLICATE_MERCHANT",
            Self::MerchantInactive(_) => "MERCHANT_INACTIVE",
            Self::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            Self::DuplicateTransaction(_) => "DUPLICATE_TRANSACTION",
            Self::ClientMismatch(_) => "CLIENT_MISMATCH",
            Self::NotPaid(_) => "NOT_PAID",
            Self::AlreadySettled(_) => "ALREADY_SETTLED",
            Self::PayoutNotFound(_) => "PAYOUT_NOT_FOUND",
            Self::DuplicatePayout(_) => "DUPLICATE_PAYOUT",
            Self::MissingReason => "MISSING_REASON",
            Self::MissingReference => "MISSING_REFERENCE",
            Self::UnbalancedEntry { .. } => "UNBALANCED_ENTRY",
            Self::DuplicateEntry(_) => "DUPLICATE_ENTRY",
            Self::ExceptionNotFound(_) => "EXCEPTION_NOT_FOUND",
        }
    }

    /// Code and message pair for structured error responses.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// Serializable error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Non-fatal inconsistency found while replaying stored records.
///
/// Warnings never abort an operation. They are logged and returned with the
/// result so they can be audited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataIntegrityWarning {
    pub merchant_id: MerchantId,
    pub order_id: OrderId,
    pub gross_amount: Amount,
    pub commission: Amount,
    pub stored_net: Amount,
}

impl DataIntegrityWarning {
    /// Net amount implied by gross and commission.
    pub fn expected_net(&self) -> Amount {
        self.gross_amount - self.commission
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
