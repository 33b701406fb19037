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

//! Staging of one block: merged transaction deltas over the committed
//! trie, conflict detection for speculative execution, and the fold into
//! a trie update at block end.

use std::{collections::HashMap, sync::Arc};

use account_cache::AccountStorageCache;
use bytes::Bytes;
use chainstate_types::{Account, BlockNumber, Round};
use ethereum_types::{Address, H256};
use event_ring::EventRecorder;
use parking_lot::RwLock;
use triedb::{SharedNode, Update, UpdateList};

use crate::{
    db::Db,
    state::{delta::StateDeltas, State},
    ChainConfig,
};

/// In-memory state of one block being built or re-executed: the parent
/// root it reads through, and the deltas of every merged transaction.
pub struct BlockState {
    db: Arc<Db>,
    cache: Arc<AccountStorageCache<Account>>,
    config: ChainConfig,
    parent_root: Option<SharedNode>,
    block_number: BlockNumber,
    round: Round,
    merged: RwLock<StateDeltas>,
    code: RwLock<HashMap<H256, Bytes>>,
    recorder: Option<Arc<EventRecorder>>,
    merged_txns: RwLock<u32>,
    /// The cache mirrors finalized state; only a block building directly
    /// on it may read through the cache.
    canonical: bool,
}

impl BlockState {
    /// Stage a block with the given parent state.
    pub fn new(
        db: Arc<Db>,
        cache: Arc<AccountStorageCache<Account>>,
        config: ChainConfig,
        parent_root: Option<SharedNode>,
        block_number: BlockNumber,
        round: Round,
    ) -> BlockState {
        let canonical = match (&parent_root, db.latest_finalized_root()) {
            (Some(parent), Some(finalized)) => Arc::ptr_eq(parent, &finalized),
            (None, None) => true,
            _ => false,
        };
        BlockState {
            db,
            cache,
            config,
            parent_root,
            block_number,
            round,
            merged: RwLock::new(StateDeltas::new()),
            code: RwLock::new(HashMap::new()),
            recorder: None,
            merged_txns: RwLock::new(0),
            canonical,
        }
    }

    /// Attach an event recorder; block and transaction boundaries are
    /// reported to it.
    pub fn with_recorder(mut self, recorder: Arc<EventRecorder>) -> BlockState {
        recorder.block_start(self.block_number, self.round);
        self.recorder = Some(recorder);
        self
    }

    /// The database this block reads through.
    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    /// Revision switches in force.
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Block number being built.
    pub fn block_number(&self) -> BlockNumber {
        self.block_number
    }

    /// Consensus round of the proposal.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Current account view: pending block deltas folded over the
    /// committed trie.
    pub fn read_account(&self, address: &Address) -> Option<Account> {
        if let Some(delta) = self.merged.read().get(address) {
            return delta.current.clone();
        }
        self.committed_account(address)
    }

    fn committed_account(&self, address: &Address) -> Option<Account> {
        if self.canonical {
            if let Some(cached) = self.cache.get_account(address) {
                return cached;
            }
        }
        let account = self
            .parent_root
            .as_ref()
            .and_then(|root| self.db.read_account(root, address));
        if self.canonical {
            self.cache.insert_account(*address, account.clone());
        }
        account
    }

    /// Current storage view, respecting the recorded initial/current
    /// distinction: a slot of a recreated account reads zero unless
    /// rewritten in this block.
    pub fn read_storage(&self, address: &Address, key: &H256) -> H256 {
        if let Some(delta) = self.merged.read().get(address) {
            if let Some(slot) = delta.storage.get(key) {
                return slot.current;
            }
            if delta.recreated {
                return H256::zero();
            }
        }
        self.committed_storage(address, key)
    }

    fn committed_storage(&self, address: &Address, key: &H256) -> H256 {
        if self.canonical {
            if let Some(value) = self.cache.get_storage(address, key) {
                return value;
            }
        }
        let value = match self.parent_root {
            Some(ref root) => self.db.read_storage(root, address, key),
            None => H256::zero(),
        };
        if self.canonical {
            self.cache.insert_storage(address, *key, value);
        }
        value
    }

    /// Contract code by hash, folding pending bodies over the trie.
    pub fn read_code(&self, code_hash: &H256) -> Option<Bytes> {
        if let Some(code) = self.code.read().get(code_hash) {
            return Some(code.clone());
        }
        self.parent_root
            .as_ref()
            .and_then(|root| self.db.read_code(root, code_hash))
    }

    /// Whether a transaction's observations still hold against the block
    /// state. A delta conflicts when any account or slot it read has a
    /// different committed value now; equal values never conflict, even
    /// if rewritten in between.
    pub fn can_merge(&self, state: &State) -> bool {
        for (address, delta) in state.deltas() {
            if self.read_account(address) != delta.initial {
                trace!(target: "block_state", "conflict on account {address:?}");
                return false;
            }
            for (key, slot) in &delta.storage {
                if self.read_storage(address, key) != slot.initial {
                    trace!(target: "block_state", "conflict on storage {address:?} {key:?}");
                    return false;
                }
            }
        }
        true
    }

    /// Fold a finished transaction into the block. The caller has
    /// checked `can_merge`.
    pub fn merge(&self, state: State) {
        let (state_deltas, state_code) = state.into_parts();
        let txn_index = {
            let mut txns = self.merged_txns.write();
            let index = *txns;
            *txns += 1;
            index
        };
        let mut merged = self.merged.write();
        for (address, delta) in state_deltas {
            match merged.entry(address) {
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    vacant.insert(delta);
                }
                std::collections::hash_map::Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    if delta.recreated {
                        // the new incarnation replaces all earlier slots
                        entry.storage = delta.storage;
                        entry.recreated = true;
                    } else {
                        for (key, slot) in delta.storage {
                            entry
                                .storage
                                .entry(key)
                                .and_modify(|existing| existing.current = slot.current)
                                .or_insert(slot);
                        }
                    }
                    entry.current = delta.current;
                }
            }
        }
        drop(merged);
        self.code.write().extend(state_code);
        if let Some(ref recorder) = self.recorder {
            recorder.txn_end(self.block_number, txn_index, true);
        }
    }

    /// Commit the block's net effect as one trie update, producing the
    /// proposal root for `(block_number, round)`.
    pub fn commit(&self) -> Option<SharedNode> {
        let version = self.block_number as i64;
        let merged = self.merged.read();
        let mut account_updates: Vec<(triedb::Nibbles, Update)> = Vec::new();
        for (address, delta) in merged.iter() {
            if !delta.is_changed() {
                continue;
            }
            let key = Db::account_key(address);
            if let Some(ref recorder) = self.recorder {
                recorder.state_change(self.block_number, address.as_bytes());
            }
            let update = match delta.current {
                None => Update::delete(key.clone(), version),
                Some(ref account) => {
                    let mut storage_updates: Vec<(triedb::Nibbles, Update)> = Vec::new();
                    for (slot, value) in &delta.storage {
                        if value.current == value.initial && !delta.recreated {
                            continue;
                        }
                        let storage_key = Db::storage_key(slot);
                        let update = if value.current.is_zero() {
                            if delta.recreated {
                                continue;
                            }
                            Update::delete(storage_key.clone(), version)
                        } else {
                            Update::put(
                                storage_key.clone(),
                                Db::encode_storage_value(&value.current),
                                version,
                            )
                        };
                        storage_updates.push((storage_key, update));
                    }
                    storage_updates.sort_by(|a, b| a.0.cmp(&b.0));
                    Update {
                        key: key.clone(),
                        value: Some(account.rlp()),
                        next: storage_updates.into_iter().map(|(_, u)| u).collect(),
                        version,
                        incarnation: delta.recreated,
                    }
                }
            };
            account_updates.push((key, update));
        }
        account_updates.sort_by(|a, b| a.0.cmp(&b.0));
        let account_updates: UpdateList =
            account_updates.into_iter().map(|(_, u)| u).collect();

        let mut code_updates: Vec<(triedb::Nibbles, Update)> = Vec::new();
        for (hash, body) in self.code.read().iter() {
            let key = Db::code_key(hash);
            code_updates.push((key.clone(), Update::put(key, body.clone(), version)));
        }
        code_updates.sort_by(|a, b| a.0.cmp(&b.0));
        let code_updates: UpdateList = code_updates.into_iter().map(|(_, u)| u).collect();

        let root = self.db.commit(
            self.parent_root.clone(),
            account_updates,
            code_updates,
            self.block_number,
            self.round,
        );
        if let Some(ref recorder) = self.recorder {
            recorder.block_end(self.block_number, *self.merged_txns.read());
        }
        root
    }

    /// Finalize this block's proposal and propagate its writes into the
    /// shared cache, which tracks finalized state only.
    pub fn finalize(&self) {
        self.db.finalize(self.block_number, self.round);
        for (address, delta) in self.merged.read().iter() {
            if !delta.is_changed() {
                continue;
            }
            if delta.recreated {
                // reset first so slots of the old incarnation cannot
                // linger in the shared storage map
                self.cache.insert_account(*address, None);
            }
            self.cache.insert_account(*address, delta.current.clone());
            if delta.current.is_some() {
                for (key, slot) in &delta.storage {
                    if slot.current != slot.initial || delta.recreated {
                        self.cache.insert_storage(address, *key, slot.current);
                    }
                }
            }
        }
    }
}
