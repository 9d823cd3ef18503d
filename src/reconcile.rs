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

//! Reconciliation of ledger records against bank statement lines.
//!
//! [`reconcile`] pairs records by settlement key (gateway reference, falling
//! back to order id) and classifies every disagreement as a
//! [`ReconException`]. Mismatches are data, never errors: a run always covers
//! every record.
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | Same amount, same batch | matched |
//! | Same amount, different batch | `TIMING_DIFF` |
//! | Record changed during the scan | `TIMING_DIFF` |
//! | Delta within tolerance | `AMOUNT_MISMATCH`, pending |
//! | Delta beyond tolerance | `AMOUNT_MISMATCH`, investigating |
//! | One side only, past grace window | `MISSING_REF` |
//! | One side only, within grace window | awaiting counterpart |
//!
//! Exception lifecycle:
//! - `Pending` → `Investigating`, `Deferred`, or `Resolved`
//! - `Investigating` → `Deferred` or `Resolved`
//! - `Deferred` → `Investigating` or `Resolved`

use crate::base::{Actor, Amount, EntryId, ExceptionId, OrderId};
use crate::config::ReconConfig;
use crate::error::{LedgerError, Result};
use crate::journal::{JournalEntry, LedgerAccount};
use crate::payout::{Payout, PayoutStatus};
use crate::transaction::Transaction;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionKind {
    AmountMismatch,
    TimingDiff,
    MissingRef,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AmountMismatch => f.write_str("AMOUNT_MISMATCH"),
            Self::TimingDiff => f.write_str("TIMING_DIFF"),
            Self::MissingRef => f.write_str("MISSING_REF"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionStatus {
    Pending,
    Investigating,
    Resolved,
    Deferred,
}

impl ExceptionStatus {
    pub fn can_transition_to(self, to: ExceptionStatus) -> bool {
        use ExceptionStatus::*;
        matches!(
            (self, to),
            (Pending, Investigating | Deferred | Resolved)
                | (Investigating, Deferred | Resolved)
                | (Deferred, Investigating | Resolved)
        )
    }

    /// True when the exception no longer blocks a run from completing.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Resolved | Self::Deferred)
    }
}

impl fmt::Display for ExceptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Investigating => "investigating",
            Self::Resolved => "resolved",
            Self::Deferred => "deferred",
        };
        f.write_str(name)
    }
}

/// Which side of the comparison a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSide {
    Ledger,
    Bank,
}

/// Ledger-side record prepared for matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRecord {
    pub key: String,
    pub order_id: Option<OrderId>,
    pub amount: Amount,
    pub settled_at: DateTime<Utc>,
    /// Settlement state changed while the run was scanning.
    #[serde(default)]
    pub in_flux: bool,
}

impl LedgerRecord {
    /// Record for a settled payin, keyed by gateway reference.
    ///
    /// Returns `None` for unsettled transactions. `scan_started` marks the
    /// start of the run; records updated after it are flagged as in flux.
    pub fn from_transaction(
        transaction: &Transaction,
        scan_started: Option<DateTime<Utc>>,
    ) -> Option<Self> {
        if !transaction.is_credit(None) {
            return None;
        }
        let settled_at = transaction.settled_at?;
        Some(Self {
            key: transaction.settlement_key().to_string(),
            order_id: Some(transaction.order_id.clone()),
            amount: transaction.gross_amount,
            settled_at,
            in_flux: scan_started.is_some_and(|start| transaction.updated_at > start),
        })
    }

    /// Record for a completed payout, keyed by its UTR.
    pub fn from_payout(payout: &Payout) -> Option<Self> {
        if payout.status != PayoutStatus::Completed {
            return None;
        }
        let completed = payout.transition_to(PayoutStatus::Completed)?;
        Some(Self {
            key: payout.utr.clone()?,
            order_id: None,
            amount: payout.net_amount.unwrap_or(payout.amount),
            settled_at: completed.at,
            in_flux: false,
        })
    }
}

/// Bank statement line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankRecord {
    pub gateway_ref: String,
    pub amount: Amount,
    pub bank_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedPair {
    pub key: String,
    pub order_id: Option<OrderId>,
    pub amount: Amount,
    pub settled_at: DateTime<Utc>,
    pub bank_date: NaiveDate,
}

/// One-sided record still inside its grace window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwaitingRecord {
    pub key: String,
    pub side: RecordSide,
    pub amount: Amount,
}

/// A disagreement between ledger and bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconException {
    pub id: ExceptionId,
    pub kind: ExceptionKind,
    pub status: ExceptionStatus,
    pub reference: String,
    pub order_id: Option<OrderId>,
    /// Ledger amount, absent when only the bank has the record.
    pub expected: Option<Amount>,
    /// Bank amount, absent when only the ledger has the record.
    pub actual: Option<Amount>,
    /// `expected - actual`, treating a missing side as zero. Saturates at the
    /// `Amount` bounds.
    pub delta: Amount,
    pub detected_at: DateTime<Utc>,
    pub note: Option<String>,
    pub resolution_entry: Option<EntryId>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Actor>,
}

impl ReconException {
    fn open(
        kind: ExceptionKind,
        status: ExceptionStatus,
        reference: &str,
        order_id: Option<OrderId>,
        expected: Option<Amount>,
        actual: Option<Amount>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExceptionId::new(),
            kind,
            status,
            reference: reference.to_string(),
            order_id,
            expected,
            actual,
            delta: expected.unwrap_or(0).saturating_sub(actual.unwrap_or(0)),
            detected_at,
            note: None,
            resolution_entry: None,
            resolved_at: None,
            resolved_by: None,
        }
    }

    /// True when `other` reports the same discrepancy: kind, reference, and
    /// both amounts agree. Status and ids are ignored.
    pub fn describes_same(&self, other: &ReconException) -> bool {
        self.kind == other.kind
            && self.reference == other.reference
            && self.expected == other.expected
            && self.actual == other.actual
    }

    fn check_transition(&self, to: ExceptionStatus) -> Result<()> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(LedgerError::InvalidExceptionTransition {
                from: self.status,
                to,
            })
        }
    }

    pub fn investigate(&mut self, note: Option<String>) -> Result<()> {
        self.check_transition(ExceptionStatus::Investigating)?;
        self.status = ExceptionStatus::Investigating;
        if note.is_some() {
            self.note = note;
        }
        Ok(())
    }

    /// Parks the exception so it no longer blocks run completion.
    pub fn defer(&mut self, reason: &str) -> Result<()> {
        self.check_transition(ExceptionStatus::Deferred)?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LedgerError::MissingReason);
        }
        self.status = ExceptionStatus::Deferred;
        self.note = Some(reason.to_string());
        Ok(())
    }

    /// Journal entry that zeroes this exception's delta.
    ///
    /// Timing differences carry no delta and need no entry.
    pub fn adjustment_entry(&self, date: DateTime<Utc>) -> Result<Option<JournalEntry>> {
        if self.delta == 0 {
            return Ok(None);
        }
        match self.kind {
            ExceptionKind::TimingDiff => Ok(None),
            ExceptionKind::AmountMismatch | ExceptionKind::MissingRef => {
                JournalEntry::adjustment(self.order_id.clone(), self.delta, &self.reference, date)
                    .map(Some)
            }
        }
    }

    /// Marks the exception resolved, linking the posted adjustment.
    pub fn resolve(
        &mut self,
        entry: Option<&JournalEntry>,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_transition(ExceptionStatus::Resolved)?;
        let covered = entry.map_or(0, |e| e.net_for(LedgerAccount::GatewayFeeAdjustment));
        if covered != self.delta && self.kind != ExceptionKind::TimingDiff {
            return Err(LedgerError::InvalidAmount(covered));
        }
        self.status = ExceptionStatus::Resolved;
        self.resolution_entry = entry.map(|e| e.id);
        self.resolved_at = Some(at);
        self.resolved_by = Some(actor);
        Ok(())
    }
}

/// Outcome of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconReport {
    pub run_at: DateTime<Utc>,
    pub matched: Vec<MatchedPair>,
    pub exceptions: Vec<ReconException>,
    pub awaiting: Vec<AwaitingRecord>,
}

impl ReconReport {
    /// True when no exception is left open.
    pub fn is_complete(&self) -> bool {
        is_complete(&self.exceptions)
    }

    pub fn count(&self, kind: ExceptionKind) -> usize {
        self.exceptions.iter().filter(|e| e.kind == kind).count()
    }
}

/// True when every exception is resolved or deferred.
pub fn is_complete(exceptions: &[ReconException]) -> bool {
    exceptions.iter().all(|e| e.status.is_closed())
}

/// Matches `ledger` against `bank` as of `run_at`.
///
/// Bank lines sharing a key are consumed in statement order, one per ledger
/// record; surplus lines on either side are treated as one-sided records.
/// Neither input is modified.
pub fn reconcile(
    ledger: &[LedgerRecord],
    bank: &[BankRecord],
    config: &ReconConfig,
    run_at: DateTime<Utc>,
) -> ReconReport {
    let mut by_key: HashMap<&str, VecDeque<usize>> = HashMap::new();
    for (index, line) in bank.iter().enumerate() {
        by_key
            .entry(line.gateway_ref.as_str())
            .or_default()
            .push_back(index);
    }

    let mut report = ReconReport {
        run_at,
        matched: Vec::new(),
        exceptions: Vec::new(),
        awaiting: Vec::new(),
    };
    let mut consumed = vec![false; bank.len()];
    let grace = config.grace_window();

    for record in ledger {
        let paired = by_key
            .get_mut(record.key.as_str())
            .and_then(VecDeque::pop_front);

        let Some(index) = paired else {
            if run_at - record.settled_at > grace {
                report.exceptions.push(ReconException::open(
                    ExceptionKind::MissingRef,
                    ExceptionStatus::Pending,
                    &record.key,
                    record.order_id.clone(),
                    Some(record.amount),
                    None,
                    run_at,
                ));
            } else {
                report.awaiting.push(AwaitingRecord {
                    key: record.key.clone(),
                    side: RecordSide::Ledger,
                    amount: record.amount,
                });
            }
            continue;
        };

        consumed[index] = true;
        let line = &bank[index];
        let delta = record.amount.checked_sub(line.amount);
        let same_batch = config.batch_date(record.settled_at) == line.bank_date;

        let exception = |kind, status| {
            ReconException::open(
                kind,
                status,
                &record.key,
                record.order_id.clone(),
                Some(record.amount),
                Some(line.amount),
                run_at,
            )
        };

        if record.in_flux {
            let mut timing = exception(ExceptionKind::TimingDiff, ExceptionStatus::Pending);
            timing.note = Some("settlement changed during scan".to_string());
            report.exceptions.push(timing);
        } else if delta == Some(0) && same_batch {
            report.matched.push(MatchedPair {
                key: record.key.clone(),
                order_id: record.order_id.clone(),
                amount: record.amount,
                settled_at: record.settled_at,
                bank_date: line.bank_date,
            });
        } else if delta == Some(0) {
            report
                .exceptions
                .push(exception(ExceptionKind::TimingDiff, ExceptionStatus::Pending));
        } else {
            let within_tolerance = delta
                .and_then(Amount::checked_abs)
                .is_some_and(|size| size <= config.tolerance);
            let status = if within_tolerance {
                ExceptionStatus::Pending
            } else {
                ExceptionStatus::Investigating
            };
            let mut mismatch = exception(ExceptionKind::AmountMismatch, status);
            if delta.is_none() {
                tracing::warn!(key = %record.key, "amount delta out of range");
                mismatch.note = Some("amount delta out of range".to_string());
            }
            report.exceptions.push(mismatch);
        }
    }

    for (index, line) in bank.iter().enumerate() {
        if consumed[index] {
            continue;
        }
        let bank_time = line
            .bank_date
            .and_hms_opt(0, 0, 0)
            .map_or(run_at, |naive| naive.and_utc());
        if run_at - bank_time > grace {
            report.exceptions.push(ReconException::open(
                ExceptionKind::MissingRef,
                ExceptionStatus::Pending,
                &line.gateway_ref,
                None,
                None,
                Some(line.amount),
                run_at,
            ));
        } else {
            report.awaiting.push(AwaitingRecord {
                key: line.gateway_ref.clone(),
                side: RecordSide::Bank,
                amount: line.amount,
            });
        }
    }

    tracing::info!(
        matched = report.matched.len(),
        exceptions = report.exceptions.len(),
        awaiting = report.awaiting.len(),
        "reconciliation run finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn run_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 10, 12, 0, 0).unwrap()
    }

    fn settled(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, day, 9, 0, 0).unwrap()
    }

    fn ledger(key: &str, amount: Amount, day: u32) -> LedgerRecord {
        LedgerRecord {
            key: key.to_string(),
            order_id: Some(OrderId::new(format!("ORD-{key}"))),
            amount,
            settled_at: settled(day),
            in_flux: false,
        }
    }

    fn bank(key: &str, amount: Amount, day: u32) -> BankRecord {
        BankRecord {
            gateway_ref: key.to_string(),
            amount,
            bank_date: NaiveDate::from_ymd_opt(2025, 5, day).unwrap(),
        }
    }

    #[test]
    fn equal_amounts_same_batch_match() {
        let report = reconcile(
            &[ledger("A", 75_000, 8)],
            &[bank("A", 75_000, 8)],
            &ReconConfig::default(),
            run_at(),
        );
        assert_eq!(report.matched.len(), 1);
        assert!(report.exceptions.is_empty());
        assert!(report.is_complete());
    }

    #[test]
    fn amount_mismatch_records_delta() {
        let report = reconcile(
            &[ledger("A", 75_000, 8)],
            &[bank("A", 74_550, 8)],
            &ReconConfig::default(),
            run_at(),
        );
        let exception = &report.exceptions[0];
        assert_eq!(exception.kind, ExceptionKind::AmountMismatch);
        assert_eq!(exception.status, ExceptionStatus::Pending);
        assert_eq!(exception.delta, 450);
        assert!(!report.is_complete());
    }

    #[test]
    fn large_mismatch_opens_investigation() {
        let config = ReconConfig {
            tolerance: 100,
            ..ReconConfig::default()
        };
        let report = reconcile(&[ledger("A", 75_000, 8)], &[bank("A", 70_000, 8)], &config, run_at());
        assert_eq!(report.exceptions[0].status, ExceptionStatus::Investigating);
    }

    #[test]
    fn different_batches_are_timing_diffs() {
        let report = reconcile(
            &[ledger("A", 10_000, 7)],
            &[bank("A", 10_000, 8)],
            &ReconConfig::default(),
            run_at(),
        );
        assert_eq!(report.count(ExceptionKind::TimingDiff), 1);
        assert_eq!(report.exceptions[0].delta, 0);
    }

    #[test]
    fn in_flux_records_are_timing_diffs() {
        let mut record = ledger("A", 10_000, 8);
        record.in_flux = true;
        let report = reconcile(&[record], &[bank("A", 9_000, 8)], &ReconConfig::default(), run_at());
        assert_eq!(report.count(ExceptionKind::TimingDiff), 1);
        assert_eq!(report.count(ExceptionKind::AmountMismatch), 0);
    }

    #[test]
    fn one_sided_records_respect_grace_window() {
        let config = ReconConfig {
            grace_hours: 24,
            ..ReconConfig::default()
        };
        let report = reconcile(
            &[ledger("OLD", 1_000, 5), ledger("NEW", 2_000, 10)],
            &[bank("BANKONLY", 3_000, 4), bank("FRESH", 500, 10)],
            &config,
            run_at(),
        );
        assert_eq!(report.count(ExceptionKind::MissingRef), 2);
        assert_eq!(report.awaiting.len(), 2);

        let bank_only = report
            .exceptions
            .iter()
            .find(|e| e.reference == "BANKONLY")
            .unwrap();
        assert_eq!(bank_only.expected, None);
        assert_eq!(bank_only.delta, -3_000);
    }

    #[test]
    fn duplicate_bank_lines_leave_a_missing_ref() {
        let report = reconcile(
            &[ledger("A", 1_000, 5)],
            &[bank("A", 1_000, 5), bank("A", 1_000, 5)],
            &ReconConfig::default(),
            run_at(),
        );
        assert_eq!(report.matched.len(), 1);
        assert_eq!(report.count(ExceptionKind::MissingRef), 1);
    }

    #[test]
    fn resolving_mismatch_requires_covering_entry() {
        let report = reconcile(
            &[ledger("A", 75_000, 8)],
            &[bank("A", 74_550, 8)],
            &ReconConfig::default(),
            run_at(),
        );
        let mut exception = report.exceptions[0].clone();
        let actor = Actor::super_admin("recon");

        assert!(matches!(
            exception.resolve(None, actor.clone(), run_at()),
            Err(LedgerError::InvalidAmount(0))
        ));

        let entry = exception.adjustment_entry(run_at()).unwrap().unwrap();
        assert!(entry.is_balanced());
        exception
            .resolve(Some(&entry), actor, run_at() + Duration::minutes(5))
            .unwrap();
        assert_eq!(exception.status, ExceptionStatus::Resolved);
        assert_eq!(exception.resolution_entry, Some(entry.id));
        assert!(is_complete(&[exception]));
    }

    #[test]
    fn resolved_exception_is_final() {
        let mut exception = ReconException::open(
            ExceptionKind::TimingDiff,
            ExceptionStatus::Pending,
            "A",
            None,
            Some(1),
            Some(1),
            run_at(),
        );
        exception
            .resolve(None, Actor::system(), run_at())
            .unwrap();
        assert_eq!(
            exception.investigate(None),
            Err(LedgerError::InvalidExceptionTransition {
                from: ExceptionStatus::Resolved,
                to: ExceptionStatus::Investigating
            })
        );
    }

    #[test]
    fn deferred_exceptions_complete_a_run() {
        let report = reconcile(
            &[ledger("A", 75_000, 8)],
            &[bank("A", 74_550, 8)],
            &ReconConfig::default(),
            run_at(),
        );
        let mut exceptions = report.exceptions;
        exceptions[0].defer("waiting on gateway fee invoice").unwrap();
        assert!(is_complete(&exceptions));
    }

    #[test]
    fn overflowing_delta_opens_investigation() {
        let report = reconcile(
            &[ledger("A", Amount::MAX, 8)],
            &[bank("A", -1, 8)],
            &ReconConfig::default(),
            run_at(),
        );
        let exception = &report.exceptions[0];
        assert_eq!(exception.kind, ExceptionKind::AmountMismatch);
        assert_eq!(exception.status, ExceptionStatus::Investigating);
        assert_eq!(exception.delta, Amount::MAX);
        assert!(exception.note.is_some());
    }

    #[test]
    fn same_discrepancy_ignores_status() {
        let run = |bank_amount| {
            reconcile(
                &[ledger("A", 75_000, 8)],
                &[bank("A", bank_amount, 8)],
                &ReconConfig::default(),
                run_at(),
            )
            .exceptions
            .remove(0)
        };
        let mut first = run(74_550);
        first.defer("fee invoice pending").unwrap();

        assert!(first.describes_same(&run(74_550)));
        assert!(!first.describes_same(&run(70_000)));
    }
}
