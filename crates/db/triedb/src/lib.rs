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

//! Versioned copy-on-write radix trie over the chunked storage pool.
//!
//! One `upsert` call applies a batch of updates to the trie rooted at a
//! given node and returns the new root; every touched node is rewritten
//! copy-on-write and scheduled into one of two write rings. The update
//! pass doubles as the maintenance pass: children whose subtree metadata
//! falls below the compaction window are rewritten to fresh chunks, and
//! children whose subtree version falls below the expiration horizon are
//! pruned, all while the traversal is already paying for the walk.
//!
//! Each branch child carries three aggregates that make those checks O(1):
//! the smallest virtual offset reachable in the subtree on the fast and
//! slow rings, and the smallest trie version reachable. Invariants over
//! these are what the maintenance machinery relies on and what the test
//! suite checks.

#[macro_use]
extern crate log;

mod aux;
mod maintenance;
mod nibbles;
mod node;
mod state_machine;
mod trie;
mod update;
mod write_buffer;

pub use aux::{UpdateAux, UpdateAuxConfig, UpdateStats};
pub use nibbles::Nibbles;
pub use node::{calc_min_offsets, calc_min_version, Child, Node, SharedNode};
pub use state_machine::{
    Compute, MerkleCompute, NoopCompute, StateMachine, StateTrieMachine, VarLenTableMachine,
};
pub use trie::{find, flush_buffered_writes, load_all, upsert, write_new_root_node};
pub use update::{Update, UpdateList};

/// Largest serialized node accepted: the registered read buffer size.
pub const MAX_NODE_DISK_SIZE: usize = chainstate_io::READ_BUFFER_LEN;

/// Longest nibble path: a 32-byte account key plus a 32-byte storage key
/// under it, plus the table nibble.
pub const MAX_PATH_NIBBLES: usize = 129;
