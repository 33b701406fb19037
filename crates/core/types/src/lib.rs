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

//! Common types shared across the Chainstate engine crates.

pub mod account;
pub mod header;
pub mod log_entry;
pub mod receipt;

pub use account::Account;
pub use header::Header;
pub use log_entry::LogEntry;
pub use receipt::Receipt;

/// Type for block number.
pub type BlockNumber = u64;

/// Type for a consensus round. Rounds are globally monotonic and each
/// proposed block is identified by the round it was proposed in.
pub type Round = u64;

/// An incarnation tags the storage generation of an account: it is bumped
/// whenever an account is destroyed and recreated, invalidating any storage
/// written under earlier incarnations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Incarnation {
    /// Block in which the account was (re)created.
    pub block_number: BlockNumber,
    /// Index of the creating transaction within that block.
    pub tx_index: u32,
}

impl Incarnation {
    /// Incarnation of an account created in the given transaction.
    pub fn new(block_number: BlockNumber, tx_index: u32) -> Incarnation {
        Incarnation {
            block_number,
            tx_index,
        }
    }
}
