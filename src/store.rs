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

//! Persistence boundary.
//!
//! The engine talks to storage only through [`LedgerStore`]. Reads return
//! owned snapshots; every state change is written back with a single `put_*`
//! or `insert_*` call once all validation has passed.
//!
//! [`MemoryStore`] keeps everything in [`DashMap`]s and is safe for
//! concurrent access.

use crate::base::{EntryId, ExceptionId, MerchantId, OrderId, PayoutId};
use crate::error::{LedgerError, Result};
use crate::journal::JournalEntry;
use crate::merchant::Merchant;
use crate::payout::Payout;
use crate::reconcile::ReconException;
use crate::transaction::Transaction;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Storage for every record the engine owns.
pub trait LedgerStore: Send + Sync {
    fn merchant(&self, id: MerchantId) -> Option<Merchant>;
    /// Fails with [`LedgerError::DuplicateMerchant`] if the id is taken.
    fn insert_merchant(&self, merchant: Merchant) -> Result<()>;
    fn put_merchant(&self, merchant: Merchant);
    fn merchants(&self) -> Vec<Merchant>;

    fn transaction(&self, order_id: &OrderId) -> Option<Transaction>;
    /// Fails with [`LedgerError::DuplicateTransaction`] if the order id is taken.
    fn insert_transaction(&self, transaction: Transaction) -> Result<()>;
    fn put_transaction(&self, transaction: Transaction);
    fn transactions_for(&self, merchant_id: MerchantId) -> Vec<Transaction>;
    fn transactions(&self) -> Vec<Transaction>;

    fn payout(&self, id: PayoutId) -> Option<Payout>;
    /// Fails with [`LedgerError::DuplicatePayout`] if the id is taken.
    fn insert_payout(&self, payout: Payout) -> Result<()>;
    fn put_payout(&self, payout: Payout);
    fn payouts_for(&self, merchant_id: MerchantId) -> Vec<Payout>;
    fn payouts(&self) -> Vec<Payout>;
    fn next_payout_id(&self) -> PayoutId;

    /// Appends a posted entry. Entries are never replaced.
    fn append_entry(&self, entry: JournalEntry) -> Result<()>;
    fn entry(&self, id: EntryId) -> Option<JournalEntry>;
    /// Entries in posting order.
    fn entries(&self) -> Vec<JournalEntry>;

    fn exception(&self, id: ExceptionId) -> Option<ReconException>;
    fn put_exception(&self, exception: ReconException);
    fn exceptions(&self) -> Vec<ReconException>;
}

/// Append-only journal with duplicate detection.
///
/// Combines a [`DashMap`] for O(1) lookups with an id list that preserves
/// posting order.
#[derive(Debug, Default)]
struct JournalLog {
    entries: DashMap<EntryId, JournalEntry>,
    order: Mutex<Vec<EntryId>>,
}

impl JournalLog {
    fn push(&self, entry: JournalEntry) -> Result<()> {
        if !entry.is_balanced() {
            return Err(LedgerError::UnbalancedEntry {
                debits: entry.debits(),
                credits: entry.credits(),
            });
        }
        let id = entry.id;
        // Hold the order lock across the insert so readers see both or neither.
        let mut order = self.order.lock();
        match self.entries.entry(id) {
            Entry::Occupied(_) => Err(LedgerError::DuplicateEntry(id)),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                order.push(id);
                Ok(())
            }
        }
    }

    fn all(&self) -> Vec<JournalEntry> {
        let order = self.order.lock();
        order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| e.clone()))
            .collect()
    }
}

/// In-memory [`LedgerStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    merchants: DashMap<MerchantId, Merchant>,
    transactions: DashMap<OrderId, Transaction>,
    payouts: DashMap<PayoutId, Payout>,
    journal: JournalLog,
    exceptions: DashMap<ExceptionId, ReconException>,
    payout_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryStore {
    fn merchant(&self, id: MerchantId) -> Option<Merchant> {
        self.merchants.get(&id).map(|m| m.clone())
    }

    fn insert_merchant(&self, merchant: Merchant) -> Result<()> {
        match self.merchants.entry(merchant.id) {
            Entry::Occupied(_) => Err(LedgerError::DuplicateMerchant(merchant.id)),
            Entry::Vacant(slot) => {
                slot.insert(merchant);
                Ok(())
            }
        }
    }

    fn put_merchant(&self, merchant: Merchant) {
        self.merchants.insert(merchant.id, merchant);
    }

    fn merchants(&self) -> Vec<Merchant> {
        let mut merchants: Vec<_> = self.merchants.iter().map(|m| m.clone()).collect();
        merchants.sort_by_key(|m| m.id);
        merchants
    }

    fn transaction(&self, order_id: &OrderId) -> Option<Transaction> {
        self.transactions.get(order_id).map(|t| t.clone())
    }

    fn insert_transaction(&self, transaction: Transaction) -> Result<()> {
        match self.transactions.entry(transaction.order_id.clone()) {
            Entry::Occupied(slot) => Err(LedgerError::DuplicateTransaction(slot.key().clone())),
            Entry::Vacant(slot) => {
                slot.insert(transaction);
                Ok(())
            }
        }
    }

    fn put_transaction(&self, transaction: Transaction) {
        self.transactions
            .insert(transaction.order_id.clone(), transaction);
    }

    fn transactions_for(&self, merchant_id: MerchantId) -> Vec<Transaction> {
        self.transactions
            .iter()
            .filter(|t| t.merchant_id == merchant_id)
            .map(|t| t.clone())
            .collect()
    }

    fn transactions(&self) -> Vec<Transaction> {
        self.transactions.iter().map(|t| t.clone()).collect()
    }

    fn payout(&self, id: PayoutId) -> Option<Payout> {
        self.payouts.get(&id).map(|p| p.clone())
    }

    fn insert_payout(&self, payout: Payout) -> Result<()> {
        match self.payouts.entry(payout.id) {
            Entry::Occupied(_) => Err(LedgerError::DuplicatePayout(payout.id)),
            Entry::Vacant(slot) => {
                slot.insert(payout);
                Ok(())
            }
        }
    }

    fn put_payout(&self, payout: Payout) {
        self.payouts.insert(payout.id, payout);
    }

    fn payouts_for(&self, merchant_id: MerchantId) -> Vec<Payout> {
        self.payouts
            .iter()
            .filter(|p| p.merchant_id == merchant_id)
            .map(|p| p.clone())
            .collect()
    }

    fn payouts(&self) -> Vec<Payout> {
        self.payouts.iter().map(|p| p.clone()).collect()
    }

    fn next_payout_id(&self) -> PayoutId {
        PayoutId(self.payout_seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn append_entry(&self, entry: JournalEntry) -> Result<()> {
        self.journal.push(entry)
    }

    fn entry(&self, id: EntryId) -> Option<JournalEntry> {
        self.journal.entries.get(&id).map(|e| e.clone())
    }

    fn entries(&self) -> Vec<JournalEntry> {
        self.journal.all()
    }

    fn exception(&self, id: ExceptionId) -> Option<ReconException> {
        self.exceptions.get(&id).map(|e| e.clone())
    }

    fn put_exception(&self, exception: ReconException) {
        self.exceptions.insert(exception.id, exception);
    }

    fn exceptions(&self) -> Vec<ReconException> {
        let mut exceptions: Vec<_> = self.exceptions.iter().map(|e| e.clone()).collect();
        exceptions.sort_by_key(|e| e.detected_at);
        exceptions
    }
}
