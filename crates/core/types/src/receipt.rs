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

//! Transaction receipt.

use ethereum_types::U256;

use crate::log_entry::LogEntry;

/// Information describing execution of a transaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Whether the transaction succeeded.
    pub success: bool,
    /// The total gas used in the block following execution of the transaction.
    pub gas_used: U256,
    /// The logs stemming from this transaction.
    pub logs: Vec<LogEntry>,
}

impl Receipt {
    /// Create a new receipt.
    pub fn new(success: bool, gas_used: U256, logs: Vec<LogEntry>) -> Receipt {
        Receipt {
            success,
            gas_used,
            logs,
        }
    }
}
