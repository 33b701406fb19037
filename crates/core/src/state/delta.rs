// Copyright 2023-2026 Chainstate contributors.
// This file is part of Chainstate.

// Chainstate is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Chainstate is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Chainstate.  If not, see <http://www.gnu.org/licenses/>.

//! Per-transaction state deltas: initial/current pairs for every
//! account and storage slot a transaction touched.

use std::collections::HashMap;

use chainstate_types::Account;
use ethereum_types::{Address, H256};

/// Initial and current value of one storage slot. `initial` is the
/// value observed before the first write of this delta's owner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageDelta {
    /// Value read before the first write.
    pub initial: H256,
    /// Value after the last write.
    pub current: H256,
}

/// Everything one transaction changed about one account.
#[derive(Debug, Clone, Default)]
pub struct AccountDelta {
    /// Account state observed before the first write.
    pub initial: Option<Account>,
    /// Account state after the last write; `None` deletes the account.
    pub current: Option<Account>,
    /// Touched storage slots.
    pub storage: HashMap<H256, StorageDelta>,
    /// The account was (re)created, invalidating every slot written
    /// under its earlier incarnations.
    pub recreated: bool,
}

impl AccountDelta {
    /// A delta that has observed `account` and not yet changed anything.
    pub fn observed(account: Option<Account>) -> AccountDelta {
        AccountDelta {
            initial: account.clone(),
            current: account,
            storage: HashMap::new(),
            recreated: false,
        }
    }

    /// Whether the delta changes anything worth committing.
    pub fn is_changed(&self) -> bool {
        self.recreated
            || self.initial != self.current
            || self
                .storage
                .values()
                .any(|slot| slot.initial != slot.current)
    }
}

/// All deltas of one transaction (or, after merging, of a block).
pub type StateDeltas = HashMap<Address, AccountDelta>;
