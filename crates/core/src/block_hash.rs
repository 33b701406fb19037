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

//! The proposal tree of block hashes and the `BLOCKHASH` buffer.
//!
//! Proposed blocks form a tree rooted at the last finalized block, keyed
//! by consensus round. Before executing a proposal the engine
//! materializes the 256-entry recent-hash buffer for that proposal's
//! ancestry; EVM execution consumes an immutable snapshot of it.

use std::{collections::HashMap, sync::Arc};

use ethereum_types::H256;

use chainstate_types::{BlockNumber, Round};

/// Number of recent block hashes served by `BLOCKHASH`.
pub const BLOCK_HISTORY_LENGTH: usize = 256;

/// Slots kept by the on-chain history contract's storage ring.
pub const HISTORY_SERVE_WINDOW: u64 = 8191;

/// Address of the block-hash history system contract.
pub fn history_contract_address() -> ethereum_types::Address {
    // 0x0000F90827F1C53a10cb7A02335B175320002935
    let mut raw = [0u8; 20];
    raw[2] = 0xF9;
    raw[3] = 0x08;
    raw[4] = 0x27;
    raw[5] = 0xF1;
    raw[6] = 0xC5;
    raw[7] = 0x3a;
    raw[8] = 0x10;
    raw[9] = 0xcb;
    raw[10] = 0x7A;
    raw[11] = 0x02;
    raw[12] = 0x33;
    raw[13] = 0x5B;
    raw[14] = 0x17;
    raw[15] = 0x53;
    raw[16] = 0x20;
    raw[17] = 0x00;
    raw[18] = 0x29;
    raw[19] = 0x35;
    ethereum_types::Address::from(raw)
}

/// Ring of the most recent block hashes, indexed by block number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHashBuffer {
    hashes: Box<[H256; BLOCK_HISTORY_LENGTH]>,
}

impl Default for BlockHashBuffer {
    fn default() -> BlockHashBuffer {
        BlockHashBuffer {
            hashes: Box::new([H256::zero(); BLOCK_HISTORY_LENGTH]),
        }
    }
}

impl BlockHashBuffer {
    /// Record the hash of `block_number`, evicting the entry 256 blocks
    /// older.
    pub fn set(&mut self, block_number: BlockNumber, hash: H256) {
        self.hashes[block_number as usize % BLOCK_HISTORY_LENGTH] = hash;
    }

    /// The hash recorded for `block_number`. The caller checks the
    /// window; a lapped slot returns whatever newer block replaced it.
    pub fn get(&self, block_number: BlockNumber) -> H256 {
        self.hashes[block_number as usize % BLOCK_HISTORY_LENGTH]
    }

    /// Freeze into the immutable snapshot EVM execution reads.
    pub fn finalized(self) -> BlockHashBufferFinalized {
        BlockHashBufferFinalized { buffer: self }
    }
}

/// Immutable snapshot of the recent-hash buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHashBufferFinalized {
    buffer: BlockHashBuffer,
}

impl BlockHashBufferFinalized {
    /// The hash recorded for `block_number`.
    pub fn get(&self, block_number: BlockNumber) -> H256 {
        self.buffer.get(block_number)
    }
}

struct ProposalNode {
    block_number: BlockNumber,
    parent_round: Round,
    block_hash: H256,
}

/// Tree of proposed block hashes rooted at the last finalized block.
pub struct BlockHashChain {
    nodes: HashMap<Round, ProposalNode>,
    finalized: Arc<BlockHashBufferFinalized>,
    finalized_round: Round,
    finalized_number: BlockNumber,
}

impl BlockHashChain {
    /// Start a chain at the last finalized block.
    pub fn new(
        finalized: BlockHashBufferFinalized,
        finalized_round: Round,
        finalized_number: BlockNumber,
    ) -> BlockHashChain {
        BlockHashChain {
            nodes: HashMap::new(),
            finalized: Arc::new(finalized),
            finalized_round,
            finalized_number,
        }
    }

    /// Register a proposal as a child of `parent_round`.
    pub fn propose(
        &mut self,
        block_number: BlockNumber,
        round: Round,
        block_hash: H256,
        parent_round: Round,
    ) {
        assert!(round > parent_round, "rounds are monotonic");
        trace!(target: "block_hash", "propose block {block_number} round {round} parent {parent_round}");
        self.nodes.insert(
            round,
            ProposalNode {
                block_number,
                parent_round,
                block_hash,
            },
        );
    }

    /// Rounds from `parent_round` (inclusive) back down to the finalized
    /// root, oldest first.
    fn ancestry(&self, parent_round: Round) -> Vec<Round> {
        let mut rounds = Vec::new();
        let mut at = parent_round;
        while at != self.finalized_round {
            let node = self
                .nodes
                .get(&at)
                .expect("proposal ancestry must reach the finalized root");
            rounds.push(at);
            at = node.parent_round;
        }
        rounds.reverse();
        rounds
    }

    /// Materialize the recent-hash buffer seen by a block built on
    /// `parent_round`: the finalized tail plus the proposal path up to
    /// the parent.
    pub fn find_chain(&self, parent_round: Round) -> BlockHashBufferFinalized {
        let mut buffer = (*self.finalized).clone().buffer;
        for round in self.ancestry(parent_round) {
            let node = &self.nodes[&round];
            buffer.set(node.block_number, node.block_hash);
        }
        buffer.finalized()
    }

    /// Designate `round` as finalized: fold its ancestry into the
    /// finalized buffer and detach every proposal that is not a
    /// descendant of it.
    pub fn finalize(&mut self, round: Round) {
        let path = self.ancestry(round);
        let mut buffer = (*self.finalized).clone().buffer;
        for at in &path {
            let node = &self.nodes[at];
            buffer.set(node.block_number, node.block_hash);
        }
        let finalized_number = self.nodes[&round].block_number;
        self.finalized = Arc::new(buffer.finalized());
        self.finalized_round = round;
        self.finalized_number = finalized_number;
        // prune: survivors are proposals whose ancestor chain reaches
        // the new root
        let descendants: Vec<Round> = self
            .nodes
            .keys()
            .copied()
            .filter(|&candidate| self.reaches(candidate, round))
            .collect();
        self.nodes.retain(|r, _| descendants.contains(r));
        debug!(target: "block_hash", "finalized round {round} (block {finalized_number}), {} proposals live", self.nodes.len());
    }

    fn reaches(&self, mut candidate: Round, target: Round) -> bool {
        while candidate > target {
            match self.nodes.get(&candidate) {
                Some(node) => {
                    if node.parent_round == target {
                        return true;
                    }
                    candidate = node.parent_round;
                }
                None => return false,
            }
        }
        false
    }

    /// The finalized snapshot.
    pub fn finalized_buffer(&self) -> Arc<BlockHashBufferFinalized> {
        self.finalized.clone()
    }

    /// Round of the finalized root.
    pub fn finalized_round(&self) -> Round {
        self.finalized_round
    }

    /// Block number of the finalized root.
    pub fn finalized_number(&self) -> BlockNumber {
        self.finalized_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> H256 {
        H256::repeat_byte(byte)
    }

    #[test]
    fn buffer_ring_evicts_by_block_number() {
        let mut buffer = BlockHashBuffer::default();
        for number in 0..300u64 {
            buffer.set(number, H256::from_low_u64_be(number));
        }
        // inside the window the new values are visible
        assert_eq!(buffer.get(299), H256::from_low_u64_be(299));
        assert_eq!(buffer.get(100), H256::from_low_u64_be(100));
        // outside the window the slot has been lapped
        assert_eq!(buffer.get(43), H256::from_low_u64_be(43 + 256));
    }

    #[test]
    fn find_chain_folds_proposals_over_finalized_tail() {
        let mut finalized = BlockHashBuffer::default();
        finalized.set(9, hash(0x99));
        let mut chain = BlockHashChain::new(finalized.finalized(), 100, 9);
        chain.propose(10, 101, hash(0x10), 100);
        chain.propose(11, 103, hash(0x11), 101);
        // a sibling proposal for block 11 in a different round
        chain.propose(11, 104, hash(0x22), 101);

        let buffer = chain.find_chain(103);
        assert_eq!(buffer.get(9), hash(0x99));
        assert_eq!(buffer.get(10), hash(0x10));
        assert_eq!(buffer.get(11), hash(0x11));

        let sibling = chain.find_chain(104);
        assert_eq!(sibling.get(11), hash(0x22));
    }

    #[test]
    fn finalize_prunes_non_ancestor_siblings() {
        let mut chain = BlockHashChain::new(BlockHashBufferFinalized::default(), 100, 9);
        chain.propose(10, 101, hash(0x10), 100);
        chain.propose(10, 102, hash(0x20), 100);
        chain.propose(11, 103, hash(0x11), 101);
        chain.propose(11, 104, hash(0x21), 102);

        chain.finalize(101);
        assert_eq!(chain.finalized_round(), 101);
        assert_eq!(chain.finalized_number(), 10);
        assert_eq!(chain.finalized_buffer().get(10), hash(0x10));
        // 103 descends from 101 and survives; 102/104 are detached
        let buffer = chain.find_chain(103);
        assert_eq!(buffer.get(11), hash(0x11));
        assert!(std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            chain.find_chain(104)
        }))
        .is_err());
    }
}
