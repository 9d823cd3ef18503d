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

//! Engine configuration.
//!
//! Values come from serde (config files) or from the environment via
//! [`EngineConfig::from_env`]. Unset or unparsable variables fall back to
//! defaults.

use crate::base::Amount;
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Longest accepted grace window, one year.
pub const MAX_GRACE_HOURS: i64 = 24 * 366;

/// Reconciliation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconConfig {
    /// Largest `|ledger - bank|` still treated as a routine mismatch, in minor
    /// units. Larger deltas are opened for investigation.
    pub tolerance: Amount,
    /// How long a one-sided record may wait for its counterpart before it is
    /// reported as missing. Clamped to `0..=MAX_GRACE_HOURS` when used.
    pub grace_hours: i64,
    /// Hour of day (UTC) after which settlements roll into the next day's
    /// batch. `None` batches by calendar date.
    pub batch_cutoff_hour: Option<u32>,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            tolerance: 1_000,
            grace_hours: 48,
            batch_cutoff_hour: None,
        }
    }
}

impl ReconConfig {
    pub fn grace_window(&self) -> Duration {
        Duration::try_hours(self.grace_hours.clamp(0, MAX_GRACE_HOURS)).unwrap_or_default()
    }

    /// Settlement batch a ledger timestamp belongs to.
    pub fn batch_date(&self, at: DateTime<Utc>) -> NaiveDate {
        let date = at.date_naive();
        match self.batch_cutoff_hour {
            Some(cutoff) if at.hour() >= cutoff => date.succ_opt().unwrap_or(date),
            _ => date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub recon: ReconConfig,
    /// Payout events buffered for subscribers. Events past this are dropped.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recon: ReconConfig::default(),
            event_capacity: 1_024,
        }
    }
}

impl EngineConfig {
    /// Reads `LEDGER_RECON_TOLERANCE`, `LEDGER_RECON_GRACE_HOURS`,
    /// `LEDGER_RECON_BATCH_CUTOFF_HOUR`, and `LEDGER_EVENT_CAPACITY`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let EngineConfig {
            recon: defaults,
            event_capacity,
        } = EngineConfig::default();
        let read = |key: &str| lookup(key).map(|value| value.trim().to_string());
        Self {
            recon: ReconConfig {
                tolerance: read("LEDGER_RECON_TOLERANCE")
                    .and_then(|value| value.parse::<Amount>().ok())
                    .unwrap_or(defaults.tolerance),
                grace_hours: read("LEDGER_RECON_GRACE_HOURS")
                    .and_then(|value| value.parse::<i64>().ok())
                    .filter(|hours| (0..=MAX_GRACE_HOURS).contains(hours))
                    .unwrap_or(defaults.grace_hours),
                batch_cutoff_hour: read("LEDGER_RECON_BATCH_CUTOFF_HOUR")
                    .and_then(|value| value.parse::<u32>().ok())
                    .filter(|hour| *hour < 24)
                    .or(defaults.batch_cutoff_hour),
            },
            event_capacity: read("LEDGER_EVENT_CAPACITY")
                .and_then(|value| value.parse::<usize>().ok())
                .filter(|capacity| *capacity > 0)
                .unwrap_or(event_capacity),
        }
    }
}
