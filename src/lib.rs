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

//! # Payout Ledger
//!
//! This library provides the money core of a merchant payment platform:
//! commission calculation on payins and payouts, wallet balances projected
//! from records, the payout approval workflow, and reconciliation of the
//! ledger against bank statements.
//!
//! ## Core Components
//!
//! - [`compute_commission`]: Pure commission calculator over [`SchemeConfig`]
//! - [`project_balance`]: Wallet balance replayed from payins and payouts
//! - [`Payout`]: Payout record and its state machine
//! - [`reconcile`]: Ledger vs. bank matching with exception classification
//! - [`Engine`]: Orchestrates the above with per-merchant locking
//! - [`LedgerError`]: Error types for rejected operations
//!
//! ## Example
//!
//! ```
//! use chrono::Utc;
//! use payout_ledger::{
//!     Actor, Beneficiary, CommissionConfig, Engine, Merchant, MerchantId, OrderId,
//!     PaymentStatus, PayoutRequest, SchemeConfig, TransactionEvent,
//! };
//!
//! let engine = Engine::new();
//! let commission = CommissionConfig::new(SchemeConfig::flat(4_484).unwrap(), SchemeConfig::free());
//! engine
//!     .register_merchant(Merchant::new(MerchantId(1), "Acme", commission))
//!     .unwrap();
//!
//! // A paid order of 1000.00 settles with a flat 44.84 commission.
//! let event = TransactionEvent {
//!     order_id: OrderId::new("ORD-1"),
//!     merchant_id: MerchantId(1),
//!     gross_amount: 100_000,
//!     status: PaymentStatus::Paid,
//!     gateway: "zaakpay".to_string(),
//!     gateway_ref: Some("GW-1".to_string()),
//! };
//! engine.ingest_transaction(event, Utc::now()).unwrap();
//! engine.settle_transaction(&OrderId::new("ORD-1"), Utc::now()).unwrap();
//! assert_eq!(engine.balance(MerchantId(1)).unwrap(), 95_516);
//!
//! // A requested payout reserves its amount immediately.
//! let request = PayoutRequest {
//!     merchant_id: MerchantId(1),
//!     amount: 50_000,
//!     currency: "INR".to_string(),
//!     beneficiary: Beneficiary::Upi { vpa: "acme@upi".to_string() },
//! };
//! engine
//!     .request_payout(request, Actor::merchant(MerchantId(1)), Utc::now())
//!     .unwrap();
//! assert_eq!(engine.balance(MerchantId(1)).unwrap(), 45_516);
//! ```
//!
//! ## Amounts
//!
//! Every amount is an [`Amount`]: a signed integer count of minor currency
//! units. Rates are [`rust_decimal::Decimal`] fractions and results are
//! rounded half away from zero.

mod base;
pub mod commission;
pub mod config;
mod engine;
pub mod error;
pub mod journal;
mod merchant;
pub mod payout;
pub mod projector;
pub mod reconcile;
pub mod store;
mod transaction;

pub use base::{Actor, Amount, EntryId, ExceptionId, MerchantId, OrderId, PayoutId, Role};
pub use commission::{
    AppliedRule, Breakdown, Commission, CommissionConfig, Direction, SchemeConfig, SchemeKind,
    Tier, TierCharge, compute_commission,
};
pub use config::{EngineConfig, ReconConfig};
pub use engine::Engine;
pub use error::{DataIntegrityWarning, LedgerError};
pub use journal::{EntryKind, JournalEntry, JournalLine, LedgerAccount};
pub use merchant::{Merchant, MerchantStatus};
pub use payout::{Beneficiary, Payout, PayoutEvent, PayoutRequest, PayoutStatus, PayoutView};
pub use projector::{Projection, project_balance, replay};
pub use reconcile::{
    BankRecord, ExceptionKind, ExceptionStatus, LedgerRecord, ReconException, ReconReport,
    reconcile,
};
pub use store::{LedgerStore, MemoryStore};
pub use transaction::{PaymentStatus, SettlementStatus, Transaction, TransactionEvent};
