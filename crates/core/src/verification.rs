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

//! Block-level validation. A failure here rejects the block before any
//! trie mutation happens.

use chainstate_types::Header;
use ethereum_types::H256;

use crate::error::BlockError;

/// Check a proposed header against its parent.
pub fn verify_header(header: &Header, parent: &Header) -> Result<(), BlockError> {
    if header.number != parent.number + 1 {
        return Err(BlockError::InvalidHeader("block number not sequential"));
    }
    if header.parent_hash != parent.hash() {
        return Err(BlockError::InvalidHeader("parent hash mismatch"));
    }
    if header.round <= parent.round {
        return Err(BlockError::InvalidHeader("round not monotonic"));
    }
    if header.parent_round != parent.round {
        return Err(BlockError::UnknownParent(header.parent_round));
    }
    if header.timestamp < parent.timestamp {
        return Err(BlockError::InvalidHeader("timestamp regressed"));
    }
    if header.gas_used > header.gas_limit {
        return Err(BlockError::InvalidHeader("gas used above the limit"));
    }
    Ok(())
}

/// Check the state root execution produced against the header's claim.
pub fn verify_state_root(header: &Header, computed: H256) -> Result<(), BlockError> {
    if header.state_root != computed {
        return Err(BlockError::StateRootMismatch {
            expected: header.state_root,
            got: computed,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainstate_types::Header;
    use ethereum_types::U256;

    fn parent() -> Header {
        Header {
            number: 9,
            round: 100,
            timestamp: 1_000,
            gas_limit: U256::from(30_000_000u64),
            ..Default::default()
        }
    }

    fn child_of(parent: &Header) -> Header {
        Header {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            round: parent.round + 1,
            parent_round: parent.round,
            timestamp: parent.timestamp + 1,
            gas_limit: parent.gas_limit,
            ..Default::default()
        }
    }

    #[test]
    fn accepts_a_well_formed_child() {
        let parent = parent();
        assert_eq!(verify_header(&child_of(&parent), &parent), Ok(()));
    }

    #[test]
    fn rejects_wrong_linkage() {
        let parent = parent();
        let mut header = child_of(&parent);
        header.number += 1;
        assert!(matches!(
            verify_header(&header, &parent),
            Err(BlockError::InvalidHeader("block number not sequential"))
        ));

        let mut header = child_of(&parent);
        header.parent_round = 7;
        assert!(matches!(
            verify_header(&header, &parent),
            Err(BlockError::UnknownParent(7))
        ));

        let mut header = child_of(&parent);
        header.round = parent.round;
        assert!(matches!(
            verify_header(&header, &parent),
            Err(BlockError::InvalidHeader("round not monotonic"))
        ));
    }

    #[test]
    fn state_root_mismatch_is_typed() {
        let mut header = parent();
        header.state_root = ethereum_types::H256::repeat_byte(0xAB);
        let computed = ethereum_types::H256::repeat_byte(0xCD);
        assert!(matches!(
            verify_state_root(&header, computed),
            Err(BlockError::StateRootMismatch { .. })
        ));
    }
}
