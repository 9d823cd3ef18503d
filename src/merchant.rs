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

//! Merchant records.

use crate::base::{Amount, MerchantId, Role};
use crate::commission::CommissionConfig;
use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MerchantStatus {
    Active,
    Inactive,
    Suspended,
}

/// A merchant and its commission configuration.
///
/// Merchants are never deleted; deactivation is a status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Merchant {
    pub id: MerchantId,
    pub name: String,
    pub role: Role,
    pub status: MerchantStatus,
    pub commission: CommissionConfig,
    /// Last persisted projection. A cache only, never read for balance checks.
    pub wallet_balance: Amount,
}

impl Merchant {
    pub fn new(id: MerchantId, name: impl Into<String>, commission: CommissionConfig) -> Self {
        Self {
            id,
            name: name.into(),
            role: Role::Admin,
            status: MerchantStatus::Active,
            commission,
            wallet_balance: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == MerchantStatus::Active
    }

    /// Fails with [`LedgerError::MerchantInactive`] unless the merchant is active.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(LedgerError::MerchantInactive(self.id))
        }
    }
}
