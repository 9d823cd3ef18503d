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

//! Ledger engine.
//!
//! The [`Engine`] is the central component that ingests payins, runs the
//! payout workflow, and reconciles the ledger against bank statements.
//!
//! # Operations
//!
//! - **Payins**: Ingest gateway callbacks and settle paid transactions,
//!   fixing the commission and posting a capture journal entry.
//! - **Balances**: Project a merchant's wallet from settled payins and
//!   reserved or completed payouts.
//! - **Payouts**: Request, hold, approve, process, complete, fail, reject, and
//!   cancel payouts through the state machine.
//! - **Reconciliation**: Match ledger records against bank lines and work
//!   exceptions through to resolution.
//!
//! # Thread Safety
//!
//! Every operation that reads a balance and then changes payout state holds
//! the merchant's lock for the whole read-validate-write sequence. Merchants
//! lock independently, so work for different merchants runs in parallel.
//! Failed operations never write.

use crate::base::{Actor, Amount, EntryId, ExceptionId, MerchantId, OrderId, PayoutId};
use crate::commission::{CommissionConfig, Direction, compute_commission};
use crate::config::EngineConfig;
use crate::error::{LedgerError, Result};
use crate::journal::JournalEntry;
use crate::merchant::{Merchant, MerchantStatus};
use crate::payout::{Payout, PayoutEvent, PayoutRequest, PayoutStatus, PayoutView};
use crate::projector::{Projection, project_balance};
use crate::reconcile::{BankRecord, LedgerRecord, ReconException, ReconReport, reconcile};
use crate::store::{LedgerStore, MemoryStore};
use crate::transaction::{Transaction, TransactionEvent};
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Ledger engine over a [`LedgerStore`].
///
/// # Invariants
///
/// - A payout is only created or approved when the projected balance covers it.
/// - Commission is computed once per transaction, at settlement.
/// - Journal entries are balanced and never replaced.
/// - Reconciliation never changes transaction or payout amounts.
pub struct Engine<S: LedgerStore = MemoryStore> {
    store: S,
    config: EngineConfig,
    /// Per-merchant critical sections.
    locks: DashMap<MerchantId, Arc<Mutex<()>>>,
    /// Serializes reconciliation runs and exception updates.
    recon: Mutex<()>,
    events_tx: Sender<PayoutEvent>,
    events_rx: Receiver<PayoutEvent>,
}

impl Engine<MemoryStore> {
    /// Creates an engine over an empty in-memory store.
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new(), EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_store(MemoryStore::new(), config)
    }
}

impl Default for Engine<MemoryStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: LedgerStore> Engine<S> {
    pub fn with_store(store: S, config: EngineConfig) -> Self {
        let (events_tx, events_rx) = channel::bounded(config.event_capacity.max(1));
        Engine {
            store,
            config,
            locks: DashMap::new(),
            recon: Mutex::new(()),
            events_tx,
            events_rx,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receiver for payout completion and failure events.
    ///
    /// Receivers share one queue of `event_capacity` events: each event is
    /// delivered to exactly one of them. While the queue is full new events
    /// are dropped with a warning.
    pub fn events(&self) -> Receiver<PayoutEvent> {
        self.events_rx.clone()
    }

    fn merchant_lock(&self, merchant_id: MerchantId) -> Arc<Mutex<()>> {
        // Clone the Arc so the map shard is released before locking.
        self.locks.entry(merchant_id).or_default().value().clone()
    }

    fn load_merchant(&self, merchant_id: MerchantId) -> Result<Merchant> {
        self.store
            .merchant(merchant_id)
            .ok_or(LedgerError::MerchantNotFound(merchant_id))
    }

    fn load_payout(&self, payout_id: PayoutId) -> Result<Payout> {
        self.store
            .payout(payout_id)
            .ok_or(LedgerError::PayoutNotFound(payout_id))
    }

    fn emit(&self, event: PayoutEvent) {
        if let Err(error) = self.events_tx.try_send(event) {
            tracing::warn!(%error, "payout event dropped");
        }
    }

    // === Merchants ===

    /// Registers a merchant after validating both commission schemes.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidScheme`] - a scheme fails validation.
    /// - [`LedgerError::DuplicateMerchant`] - the id is taken.
    pub fn register_merchant(&self, merchant: Merchant) -> Result<()> {
        merchant.commission.payin.validate()?;
        merchant.commission.payout.validate()?;
        let id = merchant.id;
        self.store.insert_merchant(merchant)?;
        tracing::info!(merchant = %id, "merchant registered");
        Ok(())
    }

    pub fn merchant(&self, merchant_id: MerchantId) -> Result<Merchant> {
        self.load_merchant(merchant_id)
    }

    /// Replaces a merchant's commission schemes.
    ///
    /// Settled transactions keep the commission fixed at settlement.
    pub fn update_commission(
        &self,
        merchant_id: MerchantId,
        commission: CommissionConfig,
    ) -> Result<Merchant> {
        commission.payin.validate()?;
        commission.payout.validate()?;
        let lock = self.merchant_lock(merchant_id);
        let _guard = lock.lock();

        let mut merchant = self.load_merchant(merchant_id)?;
        merchant.commission = commission;
        self.store.put_merchant(merchant.clone());
        tracing::info!(
            merchant = %merchant_id,
            payin = ?merchant.commission.payin.kind(),
            payout = ?merchant.commission.payout.kind(),
            "commission updated"
        );
        Ok(merchant)
    }

    pub fn set_merchant_status(
        &self,
        merchant_id: MerchantId,
        status: MerchantStatus,
    ) -> Result<Merchant> {
        let lock = self.merchant_lock(merchant_id);
        let _guard = lock.lock();

        let mut merchant = self.load_merchant(merchant_id)?;
        merchant.status = status;
        self.store.put_merchant(merchant.clone());
        tracing::info!(merchant = %merchant_id, ?status, "merchant status changed");
        Ok(merchant)
    }

    // === Payins ===

    /// Records a gateway callback, creating or updating the transaction.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::MerchantNotFound`] - unknown merchant.
    /// - [`LedgerError::ClientMismatch`] - the order belongs to another merchant.
    /// - [`LedgerError::AlreadySettled`] - the callback would change a settled record.
    /// - [`LedgerError::InvalidAmount`] - negative gross amount.
    pub fn ingest_transaction(
        &self,
        event: TransactionEvent,
        at: DateTime<Utc>,
    ) -> Result<Transaction> {
        self.load_merchant(event.merchant_id)?;
        let lock = self.merchant_lock(event.merchant_id);
        let _guard = lock.lock();

        let transaction = match self.store.transaction(&event.order_id) {
            Some(mut existing) => {
                existing.apply_event(&event, at).inspect_err(|error| {
                    tracing::debug!(order = %event.order_id, %error, "callback rejected");
                })?;
                self.store.put_transaction(existing.clone());
                existing
            }
            None => {
                let transaction = Transaction::from_event(event, at)?;
                self.store.insert_transaction(transaction.clone())?;
                transaction
            }
        };
        tracing::debug!(
            order = %transaction.order_id,
            status = ?transaction.status,
            "transaction ingested"
        );
        Ok(transaction)
    }

    pub fn transaction(&self, order_id: &OrderId) -> Result<Transaction> {
        self.store
            .transaction(order_id)
            .ok_or_else(|| LedgerError::TransactionNotFound(order_id.clone()))
    }

    /// Settles a paid transaction with the merchant's current payin scheme
    /// and posts its capture entry.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::TransactionNotFound`] - unknown order.
    /// - [`LedgerError::NotPaid`] - the payment is pending or failed.
    /// - [`LedgerError::AlreadySettled`] - commission is already fixed.
    pub fn settle_transaction(&self, order_id: &OrderId, at: DateTime<Utc>) -> Result<Transaction> {
        let merchant_id = self.transaction(order_id)?.merchant_id;
        let lock = self.merchant_lock(merchant_id);
        let _guard = lock.lock();

        let merchant = self.load_merchant(merchant_id)?;
        let mut transaction = self.transaction(order_id)?;
        transaction.settle(&merchant.commission.payin, at)?;

        if transaction.gross_amount > 0 {
            self.store
                .append_entry(JournalEntry::capture(&transaction, at)?)?;
        }
        self.store.put_transaction(transaction.clone());
        tracing::info!(
            merchant = %merchant_id,
            order = %order_id,
            gross = transaction.gross_amount,
            commission = transaction.commission_amount(),
            "transaction settled"
        );
        Ok(transaction)
    }

    // === Balances ===

    /// Current projected wallet balance.
    pub fn balance(&self, merchant_id: MerchantId) -> Result<Amount> {
        Ok(self.projection(merchant_id, None)?.balance)
    }

    /// Projected wallet balance at `as_of`.
    pub fn balance_as_of(&self, merchant_id: MerchantId, as_of: DateTime<Utc>) -> Result<Amount> {
        Ok(self.projection(merchant_id, Some(as_of))?.balance)
    }

    /// Full projection with its audit trail and integrity warnings.
    pub fn projection(
        &self,
        merchant_id: MerchantId,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Projection> {
        project_balance(&self.store, merchant_id, as_of)
    }

    /// Writes the current projection into the merchant's cached balance.
    pub fn backfill_balance(&self, merchant_id: MerchantId) -> Result<Projection> {
        let lock = self.merchant_lock(merchant_id);
        let _guard = lock.lock();

        let mut merchant = self.load_merchant(merchant_id)?;
        let projection = project_balance(&self.store, merchant_id, None)?;
        if merchant.wallet_balance != projection.balance {
            tracing::info!(
                merchant = %merchant_id,
                cached = merchant.wallet_balance,
                projected = projection.balance,
                "wallet balance backfilled"
            );
        }
        merchant.wallet_balance = projection.balance;
        self.store.put_merchant(merchant);
        Ok(projection)
    }

    /// Backfills every merchant, in id order.
    pub fn backfill_all(&self) -> Result<Vec<Projection>> {
        self.store
            .merchants()
            .into_iter()
            .map(|merchant| self.backfill_balance(merchant.id))
            .collect()
    }

    // === Payouts ===

    /// Creates a payout in `Requested`, reserving its amount.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::MerchantNotFound`] - unknown merchant.
    /// - [`LedgerError::MerchantInactive`] - merchant is inactive or suspended.
    /// - [`LedgerError::InvalidAmount`] - amount is not positive.
    /// - [`LedgerError::InsufficientBalance`] - the projection does not cover it.
    pub fn request_payout(
        &self,
        request: PayoutRequest,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Result<Payout> {
        let merchant_id = request.merchant_id;
        if request.amount <= 0 {
            return Err(LedgerError::InvalidAmount(request.amount));
        }
        let lock = self.merchant_lock(merchant_id);
        let _guard = lock.lock();

        self.load_merchant(merchant_id)?.ensure_active()?;
        let available = project_balance(&self.store, merchant_id, None)?.balance;
        if request.amount > available {
            tracing::debug!(
                merchant = %merchant_id,
                available,
                required = request.amount,
                "payout request rejected"
            );
            return Err(LedgerError::InsufficientBalance {
                available,
                required: request.amount,
            });
        }

        let payout = Payout::new(self.store.next_payout_id(), request, actor, at)?;
        self.store.insert_payout(payout.clone())?;
        tracing::info!(
            payout = %payout.id,
            merchant = %merchant_id,
            amount = payout.amount,
            "payout requested"
        );
        Ok(payout)
    }

    /// Runs `apply` on a fresh copy of the payout under the merchant's lock
    /// and stores the result only if it succeeds.
    fn transition<F>(&self, payout_id: PayoutId, apply: F) -> Result<Payout>
    where
        F: FnOnce(&mut Payout, &Merchant) -> Result<()>,
    {
        let merchant_id = self.load_payout(payout_id)?.merchant_id;
        let lock = self.merchant_lock(merchant_id);
        let _guard = lock.lock();

        let merchant = self.load_merchant(merchant_id)?;
        let mut payout = self.load_payout(payout_id)?;
        let from = payout.status;
        apply(&mut payout, &merchant).inspect_err(|error| {
            tracing::debug!(payout = %payout_id, %from, %error, "payout transition rejected");
        })?;

        self.store.put_payout(payout.clone());
        tracing::info!(
            payout = %payout_id,
            merchant = %merchant_id,
            %from,
            to = %payout.status,
            "payout transition"
        );
        Ok(payout)
    }

    /// Moves a payout to `Pending` for manual review.
    pub fn hold_payout(
        &self,
        payout_id: PayoutId,
        actor: Actor,
        at: DateTime<Utc>,
        note: Option<String>,
    ) -> Result<Payout> {
        self.transition(payout_id, |payout, _| payout.hold(actor, at, note))
    }

    /// Approves a payout after re-checking the balance.
    ///
    /// The payout's own reservation is added back before comparing, so a
    /// payout is never blocked by itself.
    pub fn approve_payout(
        &self,
        payout_id: PayoutId,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Result<Payout> {
        self.transition(payout_id, |payout, merchant| {
            payout.check_transition(PayoutStatus::Approved)?;
            merchant.ensure_active()?;
            let projected = project_balance(&self.store, merchant.id, None)?.balance;
            let own = if payout.status.debits_wallet() {
                payout.amount
            } else {
                0
            };
            let available = projected + own;
            if payout.amount > available {
                return Err(LedgerError::InsufficientBalance {
                    available,
                    required: payout.amount,
                });
            }
            payout.approve(actor, at)
        })
    }

    /// Starts the transfer, locking the payout commission computed with the
    /// merchant's current payout scheme.
    pub fn process_payout(
        &self,
        payout_id: PayoutId,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Result<Payout> {
        self.transition(payout_id, |payout, merchant| {
            payout.check_transition(PayoutStatus::Processing)?;
            merchant.ensure_active()?;
            let commission =
                compute_commission(payout.amount, &merchant.commission.payout, Direction::Payout)?;
            payout.start_processing(commission, actor, at)
        })
    }

    /// Records the bank confirmation and emits [`PayoutEvent::Completed`].
    pub fn complete_payout(
        &self,
        payout_id: PayoutId,
        utr: &str,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Result<Payout> {
        let payout = self.transition(payout_id, |payout, _| payout.complete(utr, actor, at))?;
        self.emit(PayoutEvent::Completed {
            payout_id,
            merchant_id: payout.merchant_id,
            amount: payout.amount,
            net_amount: payout.net_amount.unwrap_or(payout.amount),
            utr: payout.utr.clone().unwrap_or_default(),
            at,
        });
        Ok(payout)
    }

    /// Records a transfer failure, releasing the reservation, and emits
    /// [`PayoutEvent::Failed`].
    pub fn fail_payout(
        &self,
        payout_id: PayoutId,
        admin_notes: &str,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Result<Payout> {
        let payout = self.transition(payout_id, |payout, _| payout.fail(admin_notes, actor, at))?;
        self.emit(PayoutEvent::Failed {
            payout_id,
            merchant_id: payout.merchant_id,
            amount: payout.amount,
            reason: payout.admin_notes.clone().unwrap_or_default(),
            at,
        });
        Ok(payout)
    }

    pub fn reject_payout(
        &self,
        payout_id: PayoutId,
        reason: &str,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Result<Payout> {
        self.transition(payout_id, |payout, _| payout.reject(reason, actor, at))
    }

    pub fn cancel_payout(
        &self,
        payout_id: PayoutId,
        reason: &str,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Result<Payout> {
        self.transition(payout_id, |payout, _| payout.cancel(reason, actor, at))
    }

    pub fn payout(&self, payout_id: PayoutId) -> Result<Payout> {
        self.load_payout(payout_id)
    }

    /// Payout with the transitions a client may offer next.
    pub fn payout_view(&self, payout_id: PayoutId) -> Result<PayoutView> {
        self.load_payout(payout_id).map(PayoutView::from)
    }

    /// A merchant's payouts in id order.
    pub fn payouts_for(&self, merchant_id: MerchantId) -> Vec<Payout> {
        let mut payouts = self.store.payouts_for(merchant_id);
        payouts.sort_by_key(|p| p.id);
        payouts
    }

    // === Journal ===

    /// Posts a journal entry.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::UnbalancedEntry`] - debits and credits differ.
    /// - [`LedgerError::DuplicateEntry`] - the entry was already posted.
    pub fn post_journal_entry(&self, entry: JournalEntry) -> Result<EntryId> {
        let id = entry.id;
        let kind = entry.kind;
        self.store.append_entry(entry)?;
        tracing::debug!(entry = %id, ?kind, "journal entry posted");
        Ok(id)
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.store.entries()
    }

    // === Reconciliation ===

    /// Reconciles settled payins and completed payouts against `bank`.
    ///
    /// Transactions updated after `run_at` are treated as changing during
    /// the scan. New exceptions are persisted. A stored exception for the
    /// same discrepancy (kind, reference, and both amounts) is reported with
    /// its stored state instead of being opened again; each stored exception
    /// stands in for at most one discrepancy per run.
    pub fn run_reconciliation(&self, bank: &[BankRecord], run_at: DateTime<Utc>) -> ReconReport {
        let _guard = self.recon.lock();

        let mut ledger: Vec<LedgerRecord> = self
            .store
            .transactions()
            .iter()
            .filter_map(|tx| LedgerRecord::from_transaction(tx, Some(run_at)))
            .chain(self.store.payouts().iter().filter_map(LedgerRecord::from_payout))
            .collect();
        ledger.sort_by(|a, b| (a.settled_at, &a.key).cmp(&(b.settled_at, &b.key)));

        let mut report = reconcile(&ledger, bank, &self.config.recon, run_at);

        let known = self.store.exceptions();
        let mut claimed: HashSet<ExceptionId> = HashSet::new();
        for exception in &mut report.exceptions {
            let existing = known
                .iter()
                .find(|e| !claimed.contains(&e.id) && e.describes_same(exception));
            match existing {
                Some(existing) => {
                    claimed.insert(existing.id);
                    *exception = existing.clone();
                }
                None => {
                    tracing::info!(
                        exception = %exception.id,
                        kind = %exception.kind,
                        reference = %exception.reference,
                        delta = exception.delta,
                        "exception opened"
                    );
                    self.store.put_exception(exception.clone());
                }
            }
        }
        report
    }

    pub fn exception(&self, exception_id: ExceptionId) -> Result<ReconException> {
        self.store
            .exception(exception_id)
            .ok_or(LedgerError::ExceptionNotFound(exception_id))
    }

    pub fn exceptions(&self) -> Vec<ReconException> {
        self.store.exceptions()
    }

    fn update_exception<F>(&self, exception_id: ExceptionId, apply: F) -> Result<ReconException>
    where
        F: FnOnce(&mut ReconException) -> Result<()>,
    {
        let _guard = self.recon.lock();
        let mut exception = self.exception(exception_id)?;
        let from = exception.status;
        apply(&mut exception)?;
        self.store.put_exception(exception.clone());
        tracing::info!(
            exception = %exception_id,
            kind = %exception.kind,
            %from,
            to = %exception.status,
            "exception updated"
        );
        Ok(exception)
    }

    pub fn investigate_exception(
        &self,
        exception_id: ExceptionId,
        note: Option<String>,
    ) -> Result<ReconException> {
        self.update_exception(exception_id, |exception| exception.investigate(note))
    }

    pub fn defer_exception(&self, exception_id: ExceptionId, reason: &str) -> Result<ReconException> {
        self.update_exception(exception_id, |exception| exception.defer(reason))
    }

    /// Resolves an exception, posting the adjustment entry that zeroes its
    /// delta. Timing differences close without an entry.
    pub fn resolve_exception(
        &self,
        exception_id: ExceptionId,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Result<ReconException> {
        self.update_exception(exception_id, |exception| {
            let entry = exception.adjustment_entry(at)?;
            exception.resolve(entry.as_ref(), actor, at)?;
            if let Some(entry) = entry {
                self.store.append_entry(entry)?;
            }
            Ok(())
        })
    }
}
