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

//! Per-traversal policy hooks.
//!
//! The update engine holds no static knowledge of which table it is
//! updating. A `StateMachine` follows the traversal through `down`/`up`
//! and answers, for the current position: keep the in-memory copy, take
//! part in compaction, expire old subtrees, and which child-data schema
//! to emit.

use bytes::Bytes;
use keccak_hash::keccak;

use crate::node::Node;

/// The hashing strategy: produces the opaque per-child data blob stored
/// next to each child pointer.
pub trait Compute {
    /// Child data for a freshly created node.
    fn compute(&self, node: &Node) -> Bytes;
}

/// Keccak commitment over the node's logical content and its children's
/// data blobs. Two nodes with equal content and equal child commitments
/// get equal blobs, which is what makes the root data a state commitment.
#[derive(Debug, Default, Clone, Copy)]
pub struct MerkleCompute;

impl Compute for MerkleCompute {
    fn compute(&self, node: &Node) -> Bytes {
        let mut preimage = Vec::with_capacity(64);
        preimage.extend_from_slice(&node.mask.to_le_bytes());
        preimage.push(node.path.len() as u8);
        preimage.extend_from_slice(&node.path.packed());
        match node.value {
            Some(ref value) => {
                preimage.push(1);
                preimage.extend_from_slice(&keccak(value).0);
            }
            None => preimage.push(0),
        }
        for (_, branch, child) in node.children_iter() {
            preimage.push(branch);
            preimage.extend_from_slice(&child.data);
        }
        keccak(&preimage).0.to_vec()
    }
}

/// No commitment; tables that only need key lookup skip the hashing cost.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCompute;

impl Compute for NoopCompute {
    fn compute(&self, _node: &Node) -> Bytes {
        Bytes::new()
    }
}

/// Traversal policy callbacks consumed by the update engine.
pub trait StateMachine {
    /// Descend one nibble.
    fn down(&mut self, nibble: u8);
    /// Ascend `n` nibbles.
    fn up(&mut self, n: usize);
    /// Keep the in-memory copy of the node at the current position.
    fn cache(&self) -> bool;
    /// Participate in compaction this pass.
    fn compact(&self) -> bool;
    /// Expire subtrees below the version horizon this pass.
    fn auto_expire(&self) -> bool;
    /// Whether the table is variable-length (one-time insert only).
    fn is_variable_length(&self) -> bool;
    /// The child-data schema for nodes at the current position.
    fn compute(&self) -> &dyn Compute;
}

/// Policy for the state trie: account paths and the per-account storage
/// subtries hanging below them. Keeps the upper levels of the trie
/// resident and emits merkle child data throughout.
pub struct StateTrieMachine {
    depth: usize,
    cache_depth: usize,
    compact: bool,
    auto_expire: bool,
    compute: MerkleCompute,
}

impl StateTrieMachine {
    /// Machine for the account table. The top levels stay cached; the
    /// default keeps roughly the first three branch fan-outs resident.
    pub fn for_account_trie(compact: bool, auto_expire: bool) -> StateTrieMachine {
        StateTrieMachine {
            depth: 0,
            cache_depth: 6,
            compact,
            auto_expire,
            compute: MerkleCompute,
        }
    }

    /// Machine for a standalone storage table; storage nodes are evicted
    /// eagerly since the account cache in front of the trie absorbs the
    /// hot reads.
    pub fn for_storage_trie(compact: bool, auto_expire: bool) -> StateTrieMachine {
        StateTrieMachine {
            depth: 0,
            cache_depth: 2,
            compact,
            auto_expire,
            compute: MerkleCompute,
        }
    }

    /// Current traversal depth in nibbles.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl StateMachine for StateTrieMachine {
    fn down(&mut self, _nibble: u8) {
        self.depth += 1;
    }

    fn up(&mut self, n: usize) {
        debug_assert!(self.depth >= n, "state machine underflow");
        self.depth -= n;
    }

    fn cache(&self) -> bool {
        self.depth <= self.cache_depth
    }

    fn compact(&self) -> bool {
        self.compact
    }

    fn auto_expire(&self) -> bool {
        self.auto_expire
    }

    fn is_variable_length(&self) -> bool {
        false
    }

    fn compute(&self) -> &dyn Compute {
        &self.compute
    }
}

/// Policy for variable-length tables: insert-once histories (receipts,
/// call frames) that are never updated or deleted and carry no
/// commitment.
pub struct VarLenTableMachine {
    depth: usize,
    compute: NoopCompute,
}

impl VarLenTableMachine {
    /// A fresh machine.
    pub fn new() -> VarLenTableMachine {
        VarLenTableMachine {
            depth: 0,
            compute: NoopCompute,
        }
    }
}

impl Default for VarLenTableMachine {
    fn default() -> Self {
        VarLenTableMachine::new()
    }
}

impl StateMachine for VarLenTableMachine {
    fn down(&mut self, _nibble: u8) {
        self.depth += 1;
    }

    fn up(&mut self, n: usize) {
        debug_assert!(self.depth >= n, "state machine underflow");
        self.depth -= n;
    }

    fn cache(&self) -> bool {
        self.depth <= 2
    }

    fn compact(&self) -> bool {
        false
    }

    fn auto_expire(&self) -> bool {
        false
    }

    fn is_variable_length(&self) -> bool {
        true
    }

    fn compute(&self) -> &dyn Compute {
        &self.compute
    }
}
