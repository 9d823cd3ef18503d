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

//! Property-based tests for the ledger engine.
//!
//! These tests verify invariants that should hold for any amount, any valid
//! commission scheme, and any order of stored records.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use payout_ledger::{
    Actor, Amount, BankRecord, Beneficiary, Direction, JournalEntry, LedgerError, LedgerRecord,
    MerchantId, OrderId, PaymentStatus, Payout, PayoutId, PayoutRequest, PayoutStatus,
    ReconConfig, SchemeConfig, Tier, TierCharge, Transaction, TransactionEvent,
    compute_commission, reconcile, replay,
};
use proptest::prelude::*;
use rust_decimal::Decimal;

// =============================================================================
// Arbitrary Strategies
// =============================================================================

/// Gross amount in minor units, up to 1,00,00,000.00.
fn arb_gross() -> impl Strategy<Value = Amount> {
    0i64..=10_000_000_000i64
}

/// Rate between 0 and 1 with four decimal places.
fn arb_rate() -> impl Strategy<Value = Decimal> {
    (0i64..=10_000i64).prop_map(|bps| Decimal::new(bps, 4))
}

fn arb_charge() -> impl Strategy<Value = TierCharge> {
    prop_oneof![
        arb_rate().prop_map(TierCharge::Rate),
        (0i64..=50_000i64).prop_map(TierCharge::Flat),
    ]
}

/// Contiguous brackets starting at zero. The last one is open-ended or not.
fn arb_tiers() -> impl Strategy<Value = Vec<Tier>> {
    (
        prop::collection::vec((1i64..=500_000i64, arb_charge()), 1..5),
        any::<bool>(),
    )
        .prop_map(|(brackets, open_ended)| {
            let last = brackets.len() - 1;
            let mut min = 0;
            brackets
                .into_iter()
                .enumerate()
                .map(|(i, (width, charge))| {
                    let max = if i == last && open_ended {
                        None
                    } else {
                        Some(min + width)
                    };
                    let tier = Tier::new(min, max, charge);
                    min += width;
                    tier
                })
                .collect()
        })
}

fn arb_scheme() -> impl Strategy<Value = SchemeConfig> {
    prop_oneof![
        Just(SchemeConfig::free()),
        (0i64..=100_000i64).prop_map(|fee| SchemeConfig::flat(fee).unwrap()),
        arb_rate().prop_map(|rate| SchemeConfig::percentage(rate).unwrap()),
        arb_tiers().prop_map(|tiers| SchemeConfig::tier2(tiers).unwrap()),
    ]
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

/// (gross, flat fee, settlement hour, paid)
type TxShape = (Amount, Amount, i64, bool);

/// (amount, outcome, request hour)
type PayoutShape = (Amount, u8, i64);

fn arb_tx_shape() -> impl Strategy<Value = TxShape> {
    (0i64..=1_000_000i64, 0i64..=5_000i64, 0i64..=240i64, any::<bool>())
}

fn arb_payout_shape() -> impl Strategy<Value = PayoutShape> {
    (1i64..=500_000i64, 0u8..6u8, 0i64..=240i64)
}

fn build_transaction(index: usize, shape: &TxShape) -> Transaction {
    let (gross, fee, hour, paid) = *shape;
    let at = t0() + Duration::hours(hour);
    let status = if paid {
        PaymentStatus::Paid
    } else {
        PaymentStatus::Failed
    };
    let mut tx = Transaction::from_event(
        TransactionEvent {
            order_id: OrderId::new(format!("ORD-{index}")),
            merchant_id: MerchantId(1),
            gross_amount: gross,
            status,
            gateway: "zaakpay".to_string(),
            gateway_ref: None,
        },
        at,
    )
    .unwrap();
    if paid {
        tx.settle(&SchemeConfig::flat(fee).unwrap(), at).unwrap();
    }
    tx
}

fn new_payout(id: u64, amount: Amount, at: DateTime<Utc>) -> Payout {
    Payout::new(
        PayoutId(id),
        PayoutRequest {
            merchant_id: MerchantId(1),
            amount,
            currency: "INR".to_string(),
            beneficiary: Beneficiary::Upi {
                vpa: "acme@upi".to_string(),
            },
        },
        Actor::merchant(MerchantId(1)),
        at,
    )
    .unwrap()
}

fn build_payout(index: usize, shape: &PayoutShape) -> Payout {
    let (amount, outcome, hour) = *shape;
    let at = t0() + Duration::hours(hour);
    let actor = Actor::super_admin("ops");
    let mut payout = new_payout(index as u64 + 1, amount, at);
    match outcome {
        0 => {}
        1 => payout.reject("kyc", actor, at).unwrap(),
        2 => payout.cancel("merchant", actor, at).unwrap(),
        _ => {
            payout.approve(actor.clone(), at).unwrap();
            let commission =
                compute_commission(amount, &SchemeConfig::free(), Direction::Payout).unwrap();
            payout.start_processing(commission, actor.clone(), at).unwrap();
            match outcome {
                4 => payout.complete("UTR", actor, at).unwrap(),
                5 => payout.fail("bank down", actor, at).unwrap(),
                _ => {}
            }
        }
    }
    payout
}

// =============================================================================
// Commission Calculator
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// Commission and net always add back up to gross.
    #[test]
    fn commission_plus_net_equals_gross(
        gross in arb_gross(),
        scheme in arb_scheme(),
        payout in any::<bool>(),
    ) {
        let direction = if payout { Direction::Payout } else { Direction::Payin };
        let result = compute_commission(gross, &scheme, direction).unwrap();

        prop_assert!(result.commission >= 0);
        prop_assert!(result.commission <= gross);
        prop_assert_eq!(result.commission + result.net_amount, gross);
    }

    /// Recomputing with identical inputs yields identical results.
    #[test]
    fn percentage_is_deterministic(gross in arb_gross(), rate in arb_rate()) {
        let scheme = SchemeConfig::percentage(rate).unwrap();
        let first = compute_commission(gross, &scheme, Direction::Payin).unwrap();
        let second = compute_commission(gross, &scheme, Direction::Payin).unwrap();
        prop_assert_eq!(first, second);
    }

    /// Graduated tiers never charge less for a larger amount.
    #[test]
    fn graduated_tiers_are_non_decreasing(
        tiers in arb_tiers(),
        a in 0i64..=3_000_000i64,
        b in 0i64..=3_000_000i64,
    ) {
        let scheme = SchemeConfig::tier2(tiers).unwrap();
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let low = compute_commission(low, &scheme, Direction::Payin).unwrap();
        let high = compute_commission(high, &scheme, Direction::Payin).unwrap();
        prop_assert!(low.commission <= high.commission);
    }

    /// Every accepted slab configuration is non-decreasing too.
    #[test]
    fn accepted_slab_tiers_are_non_decreasing(
        tiers in arb_tiers(),
        a in 0i64..=3_000_000i64,
        b in 0i64..=3_000_000i64,
    ) {
        let scheme = match SchemeConfig::tier1(tiers) {
            Ok(scheme) => scheme,
            Err(err) => {
                prop_assert!(matches!(err, LedgerError::InvalidScheme(_)));
                return Ok(());
            }
        };
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let low = compute_commission(low, &scheme, Direction::Payin).unwrap();
        let high = compute_commission(high, &scheme, Direction::Payin).unwrap();
        prop_assert!(low.commission <= high.commission);
    }

    /// Negative amounts are always rejected.
    #[test]
    fn negative_gross_rejected(gross in i64::MIN + 1..0i64, scheme in arb_scheme()) {
        prop_assert_eq!(
            compute_commission(gross, &scheme, Direction::Payin),
            Err(LedgerError::InvalidAmount(gross))
        );
    }
}

// =============================================================================
// Wallet Balance Projector
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Shuffling the stored records never changes the projection totals.
    #[test]
    fn projection_is_order_independent(
        (txs, shuffled_txs) in prop::collection::vec(arb_tx_shape(), 0..15)
            .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle())),
        payouts in prop::collection::vec(arb_payout_shape(), 0..10),
    ) {
        let build = |shapes: &[TxShape]| -> Vec<Transaction> {
            shapes
                .iter()
                .enumerate()
                .map(|(i, shape)| build_transaction(i, shape))
                .collect()
        };
        let payouts: Vec<Payout> = payouts
            .iter()
            .enumerate()
            .map(|(i, shape)| build_payout(i, shape))
            .collect();
        let mut reversed_payouts = payouts.clone();
        reversed_payouts.reverse();

        let first = replay(MerchantId(1), &build(&txs), &payouts, None);
        let second = replay(MerchantId(1), &build(&shuffled_txs), &reversed_payouts, None);

        prop_assert_eq!(first.balance, second.balance);
        prop_assert_eq!(first.credits, second.credits);
        prop_assert_eq!(first.debits, second.debits);
    }

    /// Replaying twice yields the same projection.
    #[test]
    fn projection_is_idempotent(
        txs in prop::collection::vec(arb_tx_shape(), 0..15),
        payouts in prop::collection::vec(arb_payout_shape(), 0..10),
        as_of in 0i64..=300i64,
    ) {
        let txs: Vec<Transaction> =
            txs.iter().enumerate().map(|(i, s)| build_transaction(i, s)).collect();
        let payouts: Vec<Payout> =
            payouts.iter().enumerate().map(|(i, s)| build_payout(i, s)).collect();
        let as_of = Some(t0() + Duration::hours(as_of));

        let first = replay(MerchantId(1), &txs, &payouts, as_of);
        let second = replay(MerchantId(1), &txs, &payouts, as_of);
        prop_assert_eq!(first, second);
    }

    /// Only reserving and completed payouts debit the wallet.
    #[test]
    fn terminal_failures_never_debit(payouts in prop::collection::vec(arb_payout_shape(), 1..10)) {
        let payouts: Vec<Payout> =
            payouts.iter().enumerate().map(|(i, s)| build_payout(i, s)).collect();
        let expected: Amount = payouts
            .iter()
            .filter(|p| !matches!(
                p.status,
                PayoutStatus::Failed | PayoutStatus::Rejected | PayoutStatus::Cancelled
            ))
            .map(|p| p.amount)
            .sum();

        let projection = replay(MerchantId(1), &[], &payouts, None);
        prop_assert_eq!(projection.debits, expected);
        prop_assert_eq!(projection.balance, -expected);
    }
}

// =============================================================================
// Payout State Machine
// =============================================================================

fn arb_status() -> impl Strategy<Value = PayoutStatus> {
    prop_oneof![
        Just(PayoutStatus::Requested),
        Just(PayoutStatus::Pending),
        Just(PayoutStatus::Approved),
        Just(PayoutStatus::Processing),
        Just(PayoutStatus::Completed),
        Just(PayoutStatus::Rejected),
        Just(PayoutStatus::Failed),
        Just(PayoutStatus::Cancelled),
    ]
}

/// Applies the operation that targets `to`.
fn attempt(payout: &mut Payout, to: PayoutStatus) -> Result<(), LedgerError> {
    let actor = Actor::super_admin("ops");
    let at = t0() + Duration::hours(1);
    match to {
        PayoutStatus::Requested => payout.check_transition(to),
        PayoutStatus::Pending => payout.hold(actor, at, None),
        PayoutStatus::Approved => payout.approve(actor, at),
        PayoutStatus::Processing => {
            let commission =
                compute_commission(payout.amount, &SchemeConfig::free(), Direction::Payout)?;
            payout.start_processing(commission, actor, at)
        }
        PayoutStatus::Completed => payout.complete("UTR9", actor, at),
        PayoutStatus::Rejected => payout.reject("reason", actor, at),
        PayoutStatus::Failed => payout.fail("reason", actor, at),
        PayoutStatus::Cancelled => payout.cancel("reason", actor, at),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Moves outside the edge set fail and leave the payout untouched.
    #[test]
    fn invalid_transitions_leave_state_unchanged(
        path in prop::collection::vec(arb_status(), 1..8),
    ) {
        let mut payout = new_payout(1, 1_000, t0());
        for to in path {
            let before = payout.clone();
            let allowed = payout.status.can_transition_to(to);
            let result = attempt(&mut payout, to);
            if allowed {
                prop_assert!(result.is_ok());
                prop_assert_eq!(payout.status, to);
            } else {
                prop_assert_eq!(
                    result,
                    Err(LedgerError::InvalidTransition { from: before.status, to })
                );
                prop_assert_eq!(&payout, &before);
            }
        }
    }
}

// =============================================================================
// Reconciliation & Journal
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Equal amounts with matching references always match.
    #[test]
    fn equal_pairs_always_match(amounts in prop::collection::vec(0i64..=10_000_000i64, 1..20)) {
        let settled_at = Utc.with_ymd_and_hms(2025, 5, 8, 9, 0, 0).unwrap();
        let bank_date = NaiveDate::from_ymd_opt(2025, 5, 8).unwrap();
        let ledger: Vec<LedgerRecord> = amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| LedgerRecord {
                key: format!("GW-{i}"),
                order_id: None,
                amount: *amount,
                settled_at,
                in_flux: false,
            })
            .collect();
        let bank: Vec<BankRecord> = amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| BankRecord {
                gateway_ref: format!("GW-{i}"),
                amount: *amount,
                bank_date,
            })
            .collect();

        let report = reconcile(&ledger, &bank, &ReconConfig::default(), settled_at + Duration::days(3));
        prop_assert_eq!(report.matched.len(), amounts.len());
        prop_assert!(report.exceptions.is_empty());
    }

    /// Every entry the builders produce is balanced.
    #[test]
    fn built_entries_balance(shape in arb_tx_shape(), delta in -1_000_000i64..=1_000_000i64) {
        let tx = build_transaction(0, &(shape.0.max(1), shape.1, shape.2, true));
        let capture = JournalEntry::capture(&tx, t0()).unwrap();
        prop_assert_eq!(capture.debits(), capture.credits());

        if delta != 0 {
            let adjustment = JournalEntry::adjustment(None, delta, "GW-1", t0()).unwrap();
            prop_assert!(adjustment.is_balanced());
            prop_assert_eq!(adjustment.debits(), delta.abs());
        }
    }
}
