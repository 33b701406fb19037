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

//! Block header.

use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;
use rlp::RlpStream;

use crate::{BlockNumber, Round};

/// The portion of a block header the state engine consumes: ordering,
/// identity, and the state root the engine is asked to verify or produce.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Header {
    /// Parent block hash.
    pub parent_hash: H256,
    /// Block number.
    pub number: BlockNumber,
    /// Consensus round this block was proposed in.
    pub round: Round,
    /// Round of the parent proposal.
    pub parent_round: Round,
    /// Block author (coinbase).
    pub author: Address,
    /// State root after executing this block.
    pub state_root: H256,
    /// Block timestamp, seconds since the epoch.
    pub timestamp: u64,
    /// Gas limit for the block.
    pub gas_limit: U256,
    /// Gas used by the block.
    pub gas_used: U256,
}

impl Header {
    /// Hash of the header, used as the block hash.
    pub fn hash(&self) -> H256 {
        let mut stream = RlpStream::new_list(9);
        stream.append(&self.parent_hash);
        stream.append(&self.number);
        stream.append(&self.round);
        stream.append(&self.parent_round);
        stream.append(&self.author);
        stream.append(&self.state_root);
        stream.append(&self.timestamp);
        stream.append(&self.gas_limit);
        stream.append(&self.gas_used);
        keccak(stream.out())
    }

    /// Basic well-formedness checks against the parent; ordering rules
    /// beyond these belong to consensus.
    pub fn verify_against_parent(&self, parent: &Header) -> bool {
        self.number == parent.number + 1
            && self.parent_hash == parent.hash()
            && self.round > parent.round
            && self.timestamp >= parent.timestamp
    }
}
