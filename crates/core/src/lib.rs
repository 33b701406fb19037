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

//! Block execution state over the versioned trie engine.
//!
//! `Db` is the durable, versioned view: one trie root per committed
//! block, with proposals tracked separately until finalization.
//! `BlockState` stages the per-transaction `StateDelta`s of one block,
//! detects conflicts between speculatively executed transactions, and
//! folds the block's net effect into a single trie update at commit.
//! `State` is the EVM-facing host object a transaction executes against.

#[macro_use]
extern crate log;

pub mod block_hash;
pub mod db;
pub mod error;
pub mod reserve;
pub mod state;
pub mod verification;

pub use block_hash::{
    BlockHashBuffer, BlockHashBufferFinalized, BlockHashChain, BLOCK_HISTORY_LENGTH,
};
pub use db::{Db, DbConfig};
pub use error::{BlockError, PrecompileError, TransactionError};
pub use reserve::{ReserveBalanceContract, RESERVE_BALANCE_ADDRESS};
pub use state::{
    AccessStatus, AccountDelta, BlockState, State, StateDeltas, StorageDelta, StorageStatus,
};
pub use verification::{verify_header, verify_state_root};

/// Behavior switches that depend on the chain revision in force.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// EIP-6780 selfdestruct semantics: only an account created in the
    /// same transaction is removed; later selfdestructs just zero the
    /// balance.
    pub cancun: bool,
    /// Serve `BLOCKHASH` from the on-chain history contract before
    /// falling back to the recent-hash buffer.
    pub history_contract: bool,
}

impl Default for ChainConfig {
    fn default() -> ChainConfig {
        ChainConfig {
            cancun: true,
            history_contract: true,
        }
    }
}
