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

//! The reserve-balance precompile: a contract-addressed, trie-backed
//! per-account reserve with delayed visibility.
//!
//! Updates land in the proposal being built and only become observable
//! through `get_delayed_urb` once that block finalizes. A second update
//! from the same address while one is still pending rejects, so at most
//! one value per address is in flight.

use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;

use crate::{db::Db, error::PrecompileError, state::State};

/// Address the precompile is reachable at.
pub const RESERVE_BALANCE_ADDRESS: Address = Address::repeat_byte(0x0E);

/// Reserve balance reported before any update has finalized.
pub fn default_reserve_balance() -> U256 {
    U256::from(1_000_000_000u64) * U256::from(1_000_000_000u64)
}

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak(signature.as_bytes());
    let bytes = hash.as_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// Storage slot holding the reserve value of `owner`.
fn value_slot(owner: &Address) -> H256 {
    let mut preimage = [0u8; 21];
    preimage[..20].copy_from_slice(owner.as_bytes());
    preimage[20] = 0;
    keccak(preimage)
}

/// Storage slot holding the block number of the last update by `owner`.
fn pending_slot(owner: &Address) -> H256 {
    let mut preimage = [0u8; 21];
    preimage[..20].copy_from_slice(owner.as_bytes());
    preimage[20] = 1;
    keccak(preimage)
}

/// The precompile entry point and its views.
pub struct ReserveBalanceContract;

impl ReserveBalanceContract {
    /// Dispatch a call to the precompile. `value` is the call value,
    /// `input` the calldata; the returned bytes are the ABI-encoded
    /// previous reserve value.
    pub fn execute(
        state: &mut State,
        sender: &Address,
        value: U256,
        input: &[u8],
    ) -> Result<Vec<u8>, PrecompileError> {
        if !value.is_zero() {
            return Err(PrecompileError("value non-zero"));
        }
        if input.len() != 36 || input[..4] != selector("update(uint256)") {
            return Err(PrecompileError("method not supported"));
        }
        let new_value = U256::from_big_endian(&input[4..36]);
        let old = Self::update(state, sender, new_value)?;
        let mut out = [0u8; 32];
        old.to_big_endian(&mut out);
        Ok(out.to_vec())
    }

    /// Stage a reserve update for `sender`. Rejects while an earlier
    /// update is still waiting for finalization.
    pub fn update(
        state: &mut State,
        sender: &Address,
        new_value: U256,
    ) -> Result<U256, PrecompileError> {
        let pending = state.get_storage(&RESERVE_BALANCE_ADDRESS, &pending_slot(sender));
        if !pending.is_zero() {
            let pending_block = U256::from_big_endian(pending.as_bytes()).low_u64();
            if pending_block > state.block_state().db().latest_finalized() {
                debug!(target: "reserve", "rejecting update from {sender:?}: block {pending_block} pending");
                return Err(PrecompileError("pending update"));
            }
        }
        let old = Self::get_delayed_urb(state.block_state().db(), sender);
        let block_number = state.block_state().block_number();
        let _ = state.set_storage(
            &RESERVE_BALANCE_ADDRESS,
            &value_slot(sender),
            h256_from_u256(new_value),
        );
        let _ = state.set_storage(
            &RESERVE_BALANCE_ADDRESS,
            &pending_slot(sender),
            H256::from_low_u64_be(block_number),
        );
        debug!(target: "reserve", "staged reserve {new_value} for {sender:?} in block {block_number}");
        Ok(old)
    }

    /// The delayed view: the reserve of `owner` as of the last finalized
    /// block. Pending proposals are invisible here.
    pub fn get_delayed_urb(db: &Db, owner: &Address) -> U256 {
        let Some(root) = db.latest_finalized_root() else {
            return default_reserve_balance();
        };
        let stored = db.read_storage(&root, &RESERVE_BALANCE_ADDRESS, &value_slot(owner));
        if stored.is_zero() {
            return default_reserve_balance();
        }
        U256::from_big_endian(stored.as_bytes())
    }
}

fn h256_from_u256(value: U256) -> H256 {
    let mut raw = [0u8; 32];
    value.to_big_endian(&mut raw);
    H256::from(raw)
}
