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

//! The EVM-facing state object one transaction executes against.

mod block_state;
mod delta;

pub use block_state::BlockState;
pub use delta::{AccountDelta, StateDeltas, StorageDelta};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use chainstate_types::{Account, Incarnation, LogEntry};
use ethereum_types::{Address, H256, U256};
use keccak_hash::{keccak, KECCAK_EMPTY};

use crate::{
    block_hash::{history_contract_address, BlockHashBufferFinalized, BLOCK_HISTORY_LENGTH},
    error::TransactionError,
};

/// EIP-2929 access classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    /// First touch in this transaction.
    Cold,
    /// Touched before.
    Warm,
}

/// EIP-2200/1283/3529 storage-write classification, consumed by gas
/// metering and refund logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStatus {
    /// Zero -> nonzero where the original was zero.
    Added,
    /// Nonzero -> different nonzero where original equals current.
    Modified,
    /// Nonzero -> zero where original equals current.
    Deleted,
    /// A slot added earlier in the transaction is zeroed again.
    AddedDeleted,
    /// A slot modified earlier in the transaction is zeroed.
    ModifiedDeleted,
    /// A slot deleted earlier in the transaction gets its original back.
    DeletedRestored,
    /// A slot modified earlier in the transaction gets its original back.
    ModifiedRestored,
    /// A slot deleted earlier in the transaction gets a different value.
    DeletedAdded,
    /// Everything else: the write changes nothing the refund rules see.
    Assigned,
}

/// Per-transaction mutable view over a staged block: records every read
/// and write as an initial/current delta, to be conflict-checked and
/// merged at transaction end.
pub struct State<'a> {
    block_state: &'a BlockState,
    deltas: StateDeltas,
    code: HashMap<H256, Bytes>,
    accessed: HashSet<Address>,
    accessed_storage: HashMap<Address, HashSet<H256>>,
    selfdestructs: Vec<Address>,
    created: HashSet<Address>,
    total_selfdestructs: u32,
    gas_award: U256,
    logs: Vec<LogEntry>,
    block_hashes: Arc<BlockHashBufferFinalized>,
    incarnation: Incarnation,
}

impl<'a> State<'a> {
    /// A fresh transaction view over `block_state`.
    pub fn new(
        block_state: &'a BlockState,
        block_hashes: Arc<BlockHashBufferFinalized>,
        incarnation: Incarnation,
    ) -> State<'a> {
        State {
            block_state,
            deltas: StateDeltas::new(),
            code: HashMap::new(),
            accessed: HashSet::new(),
            accessed_storage: HashMap::new(),
            selfdestructs: Vec::new(),
            created: HashSet::new(),
            total_selfdestructs: 0,
            gas_award: U256::zero(),
            logs: Vec::new(),
            block_hashes,
            incarnation,
        }
    }

    /// The recorded deltas.
    pub fn deltas(&self) -> &StateDeltas {
        &self.deltas
    }

    /// The block this transaction executes inside.
    pub fn block_state(&self) -> &BlockState {
        self.block_state
    }

    /// The incarnation tag of this transaction.
    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    pub(crate) fn into_parts(self) -> (StateDeltas, HashMap<H256, Bytes>) {
        (self.deltas, self.code)
    }

    fn account_delta(&mut self, address: &Address) -> &mut AccountDelta {
        if !self.deltas.contains_key(address) {
            let observed = self.block_state.read_account(address);
            self.deltas
                .insert(*address, AccountDelta::observed(observed));
        }
        self.deltas.get_mut(address).expect("inserted above")
    }

    fn storage_delta(&mut self, address: &Address, key: &H256) -> &mut StorageDelta {
        let initial = if self.account_delta(address).recreated {
            H256::zero()
        } else {
            self.block_state.read_storage(address, key)
        };
        let delta = self.account_delta(address);
        delta
            .storage
            .entry(*key)
            .or_insert_with(|| StorageDelta {
                initial,
                current: initial,
            })
    }

    /// EIP-2929 account access tracking.
    pub fn access_account(&mut self, address: &Address) -> AccessStatus {
        if self.accessed.insert(*address) {
            AccessStatus::Cold
        } else {
            AccessStatus::Warm
        }
    }

    /// EIP-2929 storage access tracking.
    pub fn access_storage(&mut self, address: &Address, key: &H256) -> AccessStatus {
        if self
            .accessed_storage
            .entry(*address)
            .or_default()
            .insert(*key)
        {
            AccessStatus::Cold
        } else {
            AccessStatus::Warm
        }
    }

    /// Pre-warm the coinbase per EIP-3651.
    pub fn warm_coinbase(&mut self, address: &Address) {
        self.accessed.insert(*address);
    }

    /// Whether the account exists.
    pub fn account_exists(&mut self, address: &Address) -> bool {
        self.account_delta(address).current.is_some()
    }

    /// Install a fresh contract account, bumping its incarnation so
    /// storage written under earlier incarnations reads zero.
    pub fn create_contract(&mut self, address: &Address) {
        trace!(target: "state", "create_contract: {address:?}");
        let incarnation = self.incarnation;
        let delta = self.account_delta(address);
        let balance = delta
            .current
            .as_ref()
            .map(|account| account.balance)
            .unwrap_or_default();
        delta.current = Some(Account::new_basic(balance, 0));
        delta.storage.clear();
        delta.recreated = true;
        self.created.insert(*address);
        debug!(target: "state", "new incarnation {incarnation:?} for {address:?}");
    }

    /// Balance, zero for absent accounts.
    pub fn get_balance(&mut self, address: &Address) -> U256 {
        self.account_delta(address)
            .current
            .as_ref()
            .map(|account| account.balance)
            .unwrap_or_default()
    }

    /// Overwrite the balance; the account must exist.
    pub fn set_balance(&mut self, address: &Address, balance: U256) {
        let delta = self.account_delta(address);
        let account = delta
            .current
            .as_mut()
            .expect("set_balance targets an existing account");
        account.balance = balance;
    }

    /// Credit an account, creating it if missing.
    pub fn add_to_balance(&mut self, address: &Address, amount: U256) {
        let delta = self.account_delta(address);
        match delta.current {
            Some(ref mut account) => account.balance = account.balance.saturating_add(amount),
            None => delta.current = Some(Account::new_basic(amount, 0)),
        }
    }

    /// Debit an account; fails without mutating on insufficient funds.
    pub fn subtract_from_balance(
        &mut self,
        address: &Address,
        amount: U256,
    ) -> Result<(), TransactionError> {
        let delta = self.account_delta(address);
        let available = delta
            .current
            .as_ref()
            .map(|account| account.balance)
            .unwrap_or_default();
        if available < amount {
            return Err(TransactionError::InsufficientBalance {
                required: amount,
                available,
            });
        }
        delta
            .current
            .as_mut()
            .expect("nonzero balance implies an account")
            .balance = available - amount;
        Ok(())
    }

    /// Account nonce, zero for absent accounts.
    pub fn get_nonce(&mut self, address: &Address) -> u64 {
        self.account_delta(address)
            .current
            .as_ref()
            .map(|account| account.nonce)
            .unwrap_or_default()
    }

    /// Overwrite the nonce; the account must exist.
    pub fn set_nonce(&mut self, address: &Address, nonce: u64) {
        self.account_delta(address)
            .current
            .as_mut()
            .expect("set_nonce targets an existing account")
            .nonce = nonce;
    }

    /// Check the transaction nonce and bump it.
    pub fn check_and_bump_nonce(
        &mut self,
        address: &Address,
        expected: u64,
    ) -> Result<(), TransactionError> {
        let current = self.get_nonce(address);
        if current != expected {
            return Err(TransactionError::NonceMismatch {
                expected: current,
                got: expected,
            });
        }
        self.set_nonce(address, current + 1);
        Ok(())
    }

    /// Code hash; `KECCAK_EMPTY` for plain or absent accounts.
    pub fn get_code_hash(&mut self, address: &Address) -> H256 {
        self.account_delta(address)
            .current
            .as_ref()
            .map(|account| account.code_hash)
            .unwrap_or(KECCAK_EMPTY)
    }

    /// Overwrite the code hash; the account must exist.
    pub fn set_code_hash(&mut self, address: &Address, code_hash: H256) {
        self.account_delta(address)
            .current
            .as_mut()
            .expect("set_code_hash targets an existing account")
            .code_hash = code_hash;
    }

    /// Full bytecode of an account; empty for plain accounts.
    pub fn get_code(&mut self, address: &Address) -> Bytes {
        let code_hash = self.get_code_hash(address);
        if code_hash == KECCAK_EMPTY {
            return Bytes::new();
        }
        if let Some(code) = self.code.get(&code_hash) {
            return code.clone();
        }
        let code = self.block_state.read_code(&code_hash).unwrap_or_default();
        self.code.insert(code_hash, code.clone());
        code
    }

    /// Code size in bytes.
    pub fn get_code_size(&mut self, address: &Address) -> usize {
        self.get_code(address).len()
    }

    /// Copy code into `buffer` starting at `offset`; returns the number
    /// of bytes copied.
    pub fn copy_code(&mut self, address: &Address, offset: usize, buffer: &mut [u8]) -> usize {
        let code = self.get_code(address);
        if offset >= code.len() {
            return 0;
        }
        let count = (code.len() - offset).min(buffer.len());
        buffer[..count].copy_from_slice(&code[offset..offset + count]);
        count
    }

    /// Install bytecode on an account: stores the body under its hash
    /// and points the account at it.
    pub fn set_code(&mut self, address: &Address, code: Bytes) {
        let code_hash = if code.is_empty() {
            KECCAK_EMPTY
        } else {
            keccak(&code)
        };
        self.set_code_hash(address, code_hash);
        if !code.is_empty() {
            self.code.insert(code_hash, code);
        }
    }

    /// Storage slot value.
    pub fn get_storage(&mut self, address: &Address, key: &H256) -> H256 {
        self.storage_delta(address, key).current
    }

    /// Write a storage slot, classifying the write for gas and refund
    /// accounting. `initial` below is the value at transaction start.
    pub fn set_storage(&mut self, address: &Address, key: &H256, value: H256) -> StorageStatus {
        let slot = self.storage_delta(address, key);
        let initial = slot.initial;
        let current = slot.current;
        let status = if value.is_zero() {
            // zeroing a slot
            if current.is_zero() {
                StorageStatus::Assigned
            } else if initial == current {
                StorageStatus::Deleted
            } else if initial.is_zero() {
                StorageStatus::AddedDeleted
            } else {
                StorageStatus::ModifiedDeleted
            }
        } else if current.is_zero() {
            if initial.is_zero() {
                StorageStatus::Added
            } else if value == initial {
                StorageStatus::DeletedRestored
            } else {
                StorageStatus::DeletedAdded
            }
        } else if initial == current && initial != value {
            StorageStatus::Modified
        } else if initial == value && initial != current {
            StorageStatus::ModifiedRestored
        } else {
            StorageStatus::Assigned
        };
        slot.current = value;
        status
    }

    /// EIP-6780 flavored selfdestruct: the balance moves immediately,
    /// the account's fate is resolved by `destruct_suicides`.
    pub fn selfdestruct(&mut self, address: &Address, beneficiary: &Address) -> bool {
        if self.account_delta(address).current.is_none() {
            return false;
        }
        let balance = self.get_balance(address);
        self.add_to_balance(beneficiary, balance);
        if address != beneficiary {
            self.set_balance(address, U256::zero());
        } else {
            // burning to self: the balance is gone either way
            self.set_balance(address, U256::zero());
        }
        self.selfdestructs.push(*address);
        self.total_selfdestructs += 1;
        trace!(target: "state", "selfdestruct: {address:?} -> {beneficiary:?}");
        true
    }

    /// Number of selfdestructs so far.
    pub fn total_selfdestructs(&self) -> u32 {
        self.total_selfdestructs
    }

    /// Resolve marked selfdestructs. Before Cancun every marked account
    /// is removed; from Cancun on only accounts created in this same
    /// transaction are, the rest stay with a zeroed balance.
    pub fn destruct_suicides(&mut self, cancun: bool) {
        let marked = std::mem::take(&mut self.selfdestructs);
        for address in marked {
            if !cancun || self.created.contains(&address) {
                self.account_delta(&address).current = None;
            }
        }
    }

    /// Remove touched accounts that ended the transaction empty
    /// (EIP-161).
    pub fn destruct_touched_dead(&mut self) {
        for delta in self.deltas.values_mut() {
            if let Some(ref account) = delta.current {
                if account.is_null() {
                    delta.current = None;
                }
            }
        }
    }

    /// Record a log.
    pub fn store_log(&mut self, log: LogEntry) {
        self.logs.push(log);
    }

    /// Logs recorded so far.
    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// Take the recorded logs for receipt construction.
    pub fn take_logs(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.logs)
    }

    /// Accumulate the priority-fee award for the block author.
    pub fn add_txn_award(&mut self, reward: U256) {
        self.gas_award = self.gas_award.saturating_add(reward);
    }

    /// The accumulated award.
    pub fn gas_award(&self) -> U256 {
        self.gas_award
    }

    /// Credit a reward, creating the account if needed.
    pub fn apply_reward(&mut self, address: &Address, reward: U256) {
        self.add_to_balance(address, reward);
    }

    /// The `BLOCKHASH` opcode: consult the history contract's storage
    /// ring when enabled, then the 256-entry recent-hash buffer.
    pub fn get_block_hash(&mut self, number: u64) -> H256 {
        let current = self.block_state.block_number();
        if number >= current {
            return H256::zero();
        }
        if self.block_state.config().history_contract {
            let slot = H256::from_low_u64_be(number % crate::block_hash::HISTORY_SERVE_WINDOW);
            let stored = self.get_storage(&history_contract_address(), &slot);
            if !stored.is_zero() {
                return stored;
            }
        }
        if number < current && number + BLOCK_HISTORY_LENGTH as u64 >= current {
            self.block_hashes.get(number)
        } else {
            H256::zero()
        }
    }
}
