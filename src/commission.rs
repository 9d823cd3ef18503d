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

//! Commission calculation.
//!
//! [`compute_commission`] turns a gross amount and a [`SchemeConfig`] into a
//! commission, a net amount, and a [`Breakdown`] describing which rule fired.
//! It is a pure function and safe to call from any thread.
//!
//! # Rounding
//!
//! Percentage charges are computed in [`Decimal`] and rounded half-up to the
//! smallest currency unit exactly once per calculation. Amounts never pass
//! through floating point.
//!
//! # Example
//!
//! ```
//! use payout_ledger::{compute_commission, Direction, SchemeConfig};
//! use rust_decimal_macros::dec;
//!
//! let scheme = SchemeConfig::percentage(dec!(0.0427)).unwrap();
//! let result = compute_commission(100_000, &scheme, Direction::Payin).unwrap();
//! assert_eq!(result.commission, 4_270);
//! assert_eq!(result.net_amount, 95_730);
//! ```

use crate::base::Amount;
use crate::error::{LedgerError, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Money flow the commission applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Payin,
    Payout,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Payin => f.write_str("payin"),
            Self::Payout => f.write_str("payout"),
        }
    }
}

/// Charge applied by one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierCharge {
    /// Fraction of the amount, e.g. `0.02` for 2%.
    Rate(Decimal),
    /// Fixed fee in minor units.
    Flat(Amount),
}

/// One bracket of a tiered scheme, covering `[min_amount, max_amount)`.
///
/// `max_amount` may only be `None` on the last tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tier {
    pub min_amount: Amount,
    pub max_amount: Option<Amount>,
    pub charge: TierCharge,
}

impl Tier {
    pub fn new(min_amount: Amount, max_amount: Option<Amount>, charge: TierCharge) -> Self {
        Self {
            min_amount,
            max_amount,
            charge,
        }
    }

    fn contains(&self, amount: Amount) -> bool {
        amount >= self.min_amount && self.max_amount.is_none_or(|max| amount < max)
    }
}

/// Commission scheme attached to a merchant.
///
/// - `Flat`: fixed fee, capped at the gross amount.
/// - `Percentage`: `gross × rate`, rounded half-up.
/// - `Tier1`: slab pricing. The bracket containing the gross amount prices
///   the whole amount.
/// - `Tier2`: graduated pricing. Each bracket prices the slice of the amount
///   that falls inside it.
/// - `Free`: no commission.
///
/// Amounts past the last bracket are priced by the last bracket. Unknown
/// `type` tags and malformed tier tables are rejected when deserializing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", try_from = "SchemeRepr")]
pub enum SchemeConfig {
    Flat { fee: Amount },
    Percentage { rate: Decimal },
    Tier1 { tiers: Vec<Tier> },
    Tier2 { tiers: Vec<Tier> },
    Free,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum SchemeRepr {
    Flat { fee: Amount },
    Percentage { rate: Decimal },
    Tier1 { tiers: Vec<Tier> },
    Tier2 { tiers: Vec<Tier> },
    Free,
}

impl TryFrom<SchemeRepr> for SchemeConfig {
    type Error = LedgerError;

    fn try_from(repr: SchemeRepr) -> Result<Self> {
        let scheme = match repr {
            SchemeRepr::Flat { fee } => SchemeConfig::Flat { fee },
            SchemeRepr::Percentage { rate } => SchemeConfig::Percentage { rate },
            SchemeRepr::Tier1 { tiers } => SchemeConfig::Tier1 { tiers },
            SchemeRepr::Tier2 { tiers } => SchemeConfig::Tier2 { tiers },
            SchemeRepr::Free => SchemeConfig::Free,
        };
        scheme.validate()?;
        Ok(scheme)
    }
}

impl SchemeConfig {
    pub fn flat(fee: Amount) -> Result<Self> {
        Self::checked(Self::Flat { fee })
    }

    pub fn percentage(rate: Decimal) -> Result<Self> {
        Self::checked(Self::Percentage { rate })
    }

    pub fn tier1(tiers: Vec<Tier>) -> Result<Self> {
        Self::checked(Self::Tier1 { tiers })
    }

    pub fn tier2(tiers: Vec<Tier>) -> Result<Self> {
        Self::checked(Self::Tier2 { tiers })
    }

    pub fn free() -> Self {
        Self::Free
    }

    fn checked(scheme: Self) -> Result<Self> {
        scheme.validate()?;
        Ok(scheme)
    }

    /// Short name of the scheme, as stored in breakdowns.
    pub fn kind(&self) -> SchemeKind {
        match self {
            Self::Flat { .. } => SchemeKind::Flat,
            Self::Percentage { .. } => SchemeKind::Percentage,
            Self::Tier1 { .. } => SchemeKind::Tier1,
            Self::Tier2 { .. } => SchemeKind::Tier2,
            Self::Free => SchemeKind::Free,
        }
    }

    /// Checks scheme parameters.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidScheme`] when a fee is negative, a rate is outside
    /// `[0, 1]`, a tier table is empty, does not start at zero, has gaps,
    /// overlaps, or is out of order, or when slab pricing would make the
    /// commission drop at a bracket boundary.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Flat { fee } => validate_charge(&TierCharge::Flat(*fee)),
            Self::Percentage { rate } => validate_charge(&TierCharge::Rate(*rate)),
            Self::Tier1 { tiers } => {
                validate_tiers(tiers)?;
                validate_slab_monotonic(tiers)
            }
            Self::Tier2 { tiers } => validate_tiers(tiers),
            Self::Free => Ok(()),
        }
    }
}

fn validate_charge(charge: &TierCharge) -> Result<()> {
    match charge {
        TierCharge::Flat(fee) if *fee < 0 => Err(LedgerError::InvalidScheme(format!(
            "fee must not be negative, got {fee}"
        ))),
        TierCharge::Rate(rate) if *rate < Decimal::ZERO || *rate > Decimal::ONE => Err(
            LedgerError::InvalidScheme(format!("rate must be within [0, 1], got {rate}")),
        ),
        _ => Ok(()),
    }
}

fn validate_tiers(tiers: &[Tier]) -> Result<()> {
    let first = tiers
        .first()
        .ok_or_else(|| LedgerError::InvalidScheme("tier list is empty".to_string()))?;
    if first.min_amount != 0 {
        return Err(LedgerError::InvalidScheme(format!(
            "first tier must start at 0, got {}",
            first.min_amount
        )));
    }

    for (index, tier) in tiers.iter().enumerate() {
        validate_charge(&tier.charge)?;
        let is_last = index + 1 == tiers.len();
        match tier.max_amount {
            Some(max) if max <= tier.min_amount => {
                return Err(LedgerError::InvalidScheme(format!(
                    "tier {index} is empty or reversed: [{}, {max})",
                    tier.min_amount
                )));
            }
            None if !is_last => {
                return Err(LedgerError::InvalidScheme(format!(
                    "only the last tier may be open-ended, tier {index} is not last"
                )));
            }
            _ => {}
        }
        if let Some(next) = tiers.get(index + 1) {
            // `max_amount` is Some here, checked above.
            let max = tier.max_amount.unwrap_or(Amount::MAX);
            if next.min_amount != max {
                return Err(LedgerError::InvalidScheme(format!(
                    "tiers must be sorted and contiguous: tier {index} ends at {max}, tier {} starts at {}",
                    index + 1,
                    next.min_amount
                )));
            }
        }
    }
    Ok(())
}

fn validate_slab_monotonic(tiers: &[Tier]) -> Result<()> {
    for (index, pair) in tiers.windows(2).enumerate() {
        let boundary = pair[1].min_amount;
        let below = capped(charge_for(boundary - 1, &pair[0].charge)?, boundary - 1);
        let at = capped(charge_for(boundary, &pair[1].charge)?, boundary);
        if at < below {
            return Err(LedgerError::InvalidScheme(format!(
                "slab commission drops at boundary {boundary} between tiers {index} and {}",
                index + 1
            )));
        }
    }
    Ok(())
}

/// Scheme name recorded in a [`Breakdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemeKind {
    Flat,
    Percentage,
    Tier1,
    Tier2,
    Free,
}

/// Per-direction commission configuration of a merchant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionConfig {
    pub payin: SchemeConfig,
    pub payout: SchemeConfig,
}

impl CommissionConfig {
    pub fn new(payin: SchemeConfig, payout: SchemeConfig) -> Self {
        Self { payin, payout }
    }

    pub fn for_direction(&self, direction: Direction) -> &SchemeConfig {
        match direction {
            Direction::Payin => &self.payin,
            Direction::Payout => &self.payout,
        }
    }
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            payin: SchemeConfig::Free,
            payout: SchemeConfig::Free,
        }
    }
}

/// Portion of the gross amount priced by one graduated tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierSlice {
    pub tier_index: usize,
    pub portion: Amount,
    pub charge: TierCharge,
}

/// Rule that produced a commission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "lowercase")]
pub enum AppliedRule {
    Flat { fee: Amount },
    Percentage { rate: Decimal },
    Slab { tier_index: usize, tier: Tier },
    Graduated { slices: Vec<TierSlice> },
    Free,
}

/// Audit record of a commission calculation.
///
/// Persisted verbatim with the transaction or payout and never recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakdown {
    pub scheme: SchemeKind,
    pub direction: Direction,
    pub gross_amount: Amount,
    pub rule: AppliedRule,
    /// Uncapped charge, before limiting it to the gross amount.
    pub raw_commission: Amount,
    /// True when the charge exceeded the gross amount and was capped.
    pub capped: bool,
}

/// Result of a commission calculation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commission {
    pub commission: Amount,
    pub net_amount: Amount,
    pub breakdown: Breakdown,
}

/// Computes commission and net amount for `gross_amount`.
///
/// For every accepted input `commission + net_amount == gross_amount` and
/// `0 <= commission <= gross_amount`.
///
/// # Errors
///
/// - [`LedgerError::InvalidAmount`] - `gross_amount` is negative.
/// - [`LedgerError::InvalidScheme`] - the scheme fails [`SchemeConfig::validate`].
pub fn compute_commission(
    gross_amount: Amount,
    scheme: &SchemeConfig,
    direction: Direction,
) -> Result<Commission> {
    if gross_amount < 0 {
        return Err(LedgerError::InvalidAmount(gross_amount));
    }
    scheme.validate()?;

    let (raw_commission, rule) = match scheme {
        SchemeConfig::Flat { fee } => (*fee, AppliedRule::Flat { fee: *fee }),
        SchemeConfig::Percentage { rate } => (
            apply_rate(gross_amount, *rate)?,
            AppliedRule::Percentage { rate: *rate },
        ),
        SchemeConfig::Tier1 { tiers } => {
            let (tier_index, tier) = find_tier(tiers, gross_amount);
            (
                charge_for(gross_amount, &tier.charge)?,
                AppliedRule::Slab { tier_index, tier },
            )
        }
        SchemeConfig::Tier2 { tiers } => graduated(tiers, gross_amount)?,
        SchemeConfig::Free => (0, AppliedRule::Free),
    };

    let commission = capped(raw_commission, gross_amount);
    Ok(Commission {
        commission,
        net_amount: gross_amount - commission,
        breakdown: Breakdown {
            scheme: scheme.kind(),
            direction,
            gross_amount,
            rule,
            raw_commission,
            capped: commission != raw_commission,
        },
    })
}

fn capped(commission: Amount, gross_amount: Amount) -> Amount {
    commission.clamp(0, gross_amount.max(0))
}

/// Bracket containing `amount`, or the last bracket when `amount` is past it.
fn find_tier(tiers: &[Tier], amount: Amount) -> (usize, Tier) {
    let last = tiers.len() - 1;
    tiers
        .iter()
        .position(|tier| tier.contains(amount))
        .map_or((last, tiers[last]), |index| (index, tiers[index]))
}

fn charge_for(amount: Amount, charge: &TierCharge) -> Result<Amount> {
    match charge {
        TierCharge::Rate(rate) => apply_rate(amount, *rate),
        TierCharge::Flat(fee) => Ok(*fee),
    }
}

fn apply_rate(amount: Amount, rate: Decimal) -> Result<Amount> {
    round_half_up(Decimal::from(amount) * rate).ok_or(LedgerError::InvalidAmount(amount))
}

fn round_half_up(value: Decimal) -> Option<Amount> {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

fn graduated(tiers: &[Tier], amount: Amount) -> Result<(Amount, AppliedRule)> {
    let last = tiers.len() - 1;
    let mut total = Decimal::ZERO;
    let mut slices = Vec::new();

    for (tier_index, tier) in tiers.iter().enumerate() {
        if amount < tier.min_amount {
            break;
        }
        // The last bracket absorbs everything above it.
        let upper = if tier_index == last {
            amount
        } else {
            tier.max_amount.map_or(amount, |max| max.min(amount))
        };
        let portion = upper - tier.min_amount;
        match tier.charge {
            TierCharge::Rate(rate) => total += Decimal::from(portion) * rate,
            TierCharge::Flat(fee) => total += Decimal::from(fee),
        }
        slices.push(TierSlice {
            tier_index,
            portion,
            charge: tier.charge,
        });
    }

    let commission = round_half_up(total).ok_or(LedgerError::InvalidAmount(amount))?;
    Ok((commission, AppliedRule::Graduated { slices }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn slab_tiers() -> Vec<Tier> {
        vec![
            Tier::new(0, Some(10_000), TierCharge::Flat(100)),
            Tier::new(10_000, Some(100_000), TierCharge::Rate(dec!(0.02))),
            Tier::new(100_000, None, TierCharge::Rate(dec!(0.025))),
        ]
    }

    #[test]
    fn percentage_scenario() {
        let scheme = SchemeConfig::percentage(dec!(0.0427)).unwrap();
        let result = compute_commission(100_000, &scheme, Direction::Payin).unwrap();
        assert_eq!(result.commission, 4_270);
        assert_eq!(result.net_amount, 95_730);
        assert_eq!(result.breakdown.scheme, SchemeKind::Percentage);
        assert!(!result.breakdown.capped);
    }

    #[test]
    fn percentage_rounds_half_up() {
        let scheme = SchemeConfig::percentage(dec!(0.01)).unwrap();
        // 250 * 0.01 = 2.5, banker's rounding would give 2
        assert_eq!(
            compute_commission(250, &scheme, Direction::Payin)
                .unwrap()
                .commission,
            3
        );
        assert_eq!(
            compute_commission(249, &scheme, Direction::Payin)
                .unwrap()
                .commission,
            2
        );
    }

    #[test]
    fn flat_fee_is_capped_at_gross() {
        let scheme = SchemeConfig::flat(500).unwrap();
        let result = compute_commission(300, &scheme, Direction::Payout).unwrap();
        assert_eq!(result.commission, 300);
        assert_eq!(result.net_amount, 0);
        assert_eq!(result.breakdown.raw_commission, 500);
        assert!(result.breakdown.capped);
    }

    #[test]
    fn free_scheme_charges_nothing() {
        let result = compute_commission(12_345, &SchemeConfig::free(), Direction::Payin).unwrap();
        assert_eq!(result.commission, 0);
        assert_eq!(result.net_amount, 12_345);
        assert_eq!(result.breakdown.rule, AppliedRule::Free);
    }

    #[test]
    fn negative_amount_is_rejected() {
        let result = compute_commission(-1, &SchemeConfig::free(), Direction::Payin);
        assert_eq!(result, Err(LedgerError::InvalidAmount(-1)));
    }

    #[test]
    fn slab_brackets_are_half_open() {
        let scheme = SchemeConfig::tier1(slab_tiers()).unwrap();

        let below = compute_commission(9_999, &scheme, Direction::Payin).unwrap();
        assert_eq!(below.commission, 100);

        let at_boundary = compute_commission(10_000, &scheme, Direction::Payin).unwrap();
        assert_eq!(at_boundary.commission, 200);
        match at_boundary.breakdown.rule {
            AppliedRule::Slab { tier_index, .. } => assert_eq!(tier_index, 1),
            other => panic!("unexpected rule {other:?}"),
        }
    }

    #[test]
    fn amounts_past_last_bracket_use_last_rate() {
        let tiers = vec![
            Tier::new(0, Some(1_000), TierCharge::Rate(dec!(0.01))),
            Tier::new(1_000, Some(5_000), TierCharge::Rate(dec!(0.02))),
        ];
        let scheme = SchemeConfig::tier1(tiers).unwrap();
        let result = compute_commission(10_000, &scheme, Direction::Payin).unwrap();
        assert_eq!(result.commission, 200);
    }

    #[test]
    fn graduated_prices_each_slice() {
        let tiers = vec![
            Tier::new(0, Some(10_000), TierCharge::Rate(dec!(0.01))),
            Tier::new(10_000, None, TierCharge::Rate(dec!(0.02))),
        ];
        let scheme = SchemeConfig::tier2(tiers).unwrap();
        let result = compute_commission(15_000, &scheme, Direction::Payin).unwrap();
        // 10_000 * 1% + 5_000 * 2%
        assert_eq!(result.commission, 200);
        match result.breakdown.rule {
            AppliedRule::Graduated { slices } => {
                assert_eq!(slices.len(), 2);
                assert_eq!(slices[0].portion, 10_000);
                assert_eq!(slices[1].portion, 5_000);
            }
            other => panic!("unexpected rule {other:?}"),
        }
    }

    #[test]
    fn graduated_zero_amount() {
        let scheme = SchemeConfig::tier2(slab_tiers()).unwrap();
        let result = compute_commission(0, &scheme, Direction::Payin).unwrap();
        assert_eq!(result.commission, 0);
        assert_eq!(result.net_amount, 0);
    }

    #[test]
    fn empty_tier_list_is_invalid() {
        assert!(matches!(
            SchemeConfig::tier1(Vec::new()),
            Err(LedgerError::InvalidScheme(_))
        ));
    }

    #[test]
    fn unsorted_tiers_are_invalid() {
        let tiers = vec![
            Tier::new(0, Some(1_000), TierCharge::Flat(10)),
            Tier::new(5_000, None, TierCharge::Flat(20)),
            Tier::new(1_000, Some(5_000), TierCharge::Flat(15)),
        ];
        assert!(matches!(
            SchemeConfig::tier2(tiers),
            Err(LedgerError::InvalidScheme(_))
        ));
    }

    #[test]
    fn overlapping_tiers_are_invalid() {
        let tiers = vec![
            Tier::new(0, Some(1_000), TierCharge::Flat(10)),
            Tier::new(900, None, TierCharge::Flat(20)),
        ];
        assert!(matches!(
            SchemeConfig::tier2(tiers),
            Err(LedgerError::InvalidScheme(_))
        ));
    }

    #[test]
    fn open_ended_middle_tier_is_invalid() {
        let tiers = vec![
            Tier::new(0, None, TierCharge::Flat(10)),
            Tier::new(1_000, None, TierCharge::Flat(20)),
        ];
        assert!(matches!(
            SchemeConfig::tier2(tiers),
            Err(LedgerError::InvalidScheme(_))
        ));
    }

    #[test]
    fn slab_that_drops_at_boundary_is_invalid() {
        let tiers = vec![
            Tier::new(0, Some(10_000), TierCharge::Rate(dec!(0.03))),
            Tier::new(10_000, None, TierCharge::Rate(dec!(0.01))),
        ];
        assert!(matches!(
            SchemeConfig::tier1(tiers),
            Err(LedgerError::InvalidScheme(_))
        ));
    }

    #[test]
    fn rate_out_of_range_is_invalid() {
        assert!(SchemeConfig::percentage(dec!(1.5)).is_err());
        assert!(SchemeConfig::percentage(dec!(-0.01)).is_err());
        assert!(SchemeConfig::flat(-1).is_err());
    }

    #[test]
    fn hand_built_invalid_scheme_is_rejected_by_calculator() {
        let scheme = SchemeConfig::Percentage { rate: dec!(2) };
        assert!(matches!(
            compute_commission(100, &scheme, Direction::Payin),
            Err(LedgerError::InvalidScheme(_))
        ));
    }

    #[test]
    fn deserialize_rejects_unknown_type() {
        let json = r#"{"type":"bonus","fee":10}"#;
        assert!(serde_json::from_str::<SchemeConfig>(json).is_err());
    }

    #[test]
    fn deserialize_validates_tiers() {
        let json = r#"{"type":"tier1","tiers":[]}"#;
        assert!(serde_json::from_str::<SchemeConfig>(json).is_err());

        let json = r#"{"type":"tier2","tiers":[
            {"minAmount":0,"maxAmount":1000,"charge":{"flat":10}},
            {"minAmount":1000,"maxAmount":null,"charge":{"rate":"0.01"}}
        ]}"#;
        let scheme: SchemeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(scheme.kind(), SchemeKind::Tier2);
    }

    #[test]
    fn serialize_round_trips_tag() {
        let scheme = SchemeConfig::flat(250).unwrap();
        let json = serde_json::to_string(&scheme).unwrap();
        assert_eq!(json, r#"{"type":"flat","fee":250}"#);
        let back: SchemeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scheme);
    }

    #[test]
    fn config_selects_scheme_by_direction() {
        let config = CommissionConfig::new(
            SchemeConfig::percentage(dec!(0.02)).unwrap(),
            SchemeConfig::flat(1_000).unwrap(),
        );
        assert_eq!(config.for_direction(Direction::Payin).kind(), SchemeKind::Percentage);
        assert_eq!(config.for_direction(Direction::Payout).kind(), SchemeKind::Flat);
    }
}
