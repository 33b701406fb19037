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

//! The versioned state database: one trie root per committed block.
//!
//! State and contract code live under two single-nibble tables of one
//! trie: accounts keyed by the keccak of their address (with storage
//! hanging below each account leaf, keyed by the keccak of the slot),
//! code keyed by its hash. Commits run on the engine's owning thread;
//! readers resolve any committed or proposed root concurrently without
//! locks on the traversal.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc,
    },
};

use bytes::Bytes;
use chainstate_io::IoService;
use chainstate_types::{Account, BlockNumber, Round};
use chunkstore::{Pool, PoolConfig};
use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;
use parking_lot::RwLock;
use triedb::{
    find, upsert, Nibbles, SharedNode, StateMachine, StateTrieMachine, UpdateAux,
    UpdateAuxConfig, UpdateList,
};

/// Nibble of the account table under the root.
const STATE_NIBBLE: u8 = 0x0;
/// Nibble of the code table under the root.
const CODE_NIBBLE: u8 = 0x1;

/// Database configuration.
#[derive(Debug, Clone, Default)]
pub struct DbConfig {
    /// Storage pool geometry.
    pub pool: PoolConfig,
    /// Run compaction during update passes.
    pub compact: bool,
    /// Prune subtrees below the expiration horizon during update passes.
    pub auto_expire: bool,
}

/// The versioned trie-backed state database.
pub struct Db {
    service: Arc<IoService>,
    aux: Arc<UpdateAux>,
    config: DbConfig,
    /// Finalized roots by block number.
    committed: RwLock<BTreeMap<BlockNumber, SharedNode>>,
    /// Speculative roots by `(block_number, round)`.
    proposals: RwLock<HashMap<(BlockNumber, Round), SharedNode>>,
    latest_finalized: AtomicU64,
}

impl Db {
    /// Create a database in `dir`.
    pub fn create<P: AsRef<Path>>(dir: P, config: DbConfig) -> Result<Db, chunkstore::Error> {
        let pool = Arc::new(Pool::create(dir, config.pool.clone())?);
        let service = Arc::new(IoService::start("statedb"));
        let aux = Arc::new(UpdateAux::new(
            pool,
            service.channel(),
            UpdateAuxConfig::default(),
        ));
        Ok(Db {
            service,
            aux,
            config,
            committed: RwLock::new(BTreeMap::new()),
            proposals: RwLock::new(HashMap::new()),
            latest_finalized: AtomicU64::new(0),
        })
    }

    /// The engine context, exposed for maintenance control and tests.
    pub fn aux(&self) -> &Arc<UpdateAux> {
        &self.aux
    }

    /// The owning-thread executor.
    pub fn service(&self) -> &Arc<IoService> {
        &self.service
    }

    fn account_path(address: &Address) -> Nibbles {
        Nibbles::from_nibbles(&[STATE_NIBBLE])
            .extended(&Nibbles::from_key(keccak(address.as_bytes()).as_bytes()))
    }

    fn storage_path(address: &Address, key: &H256) -> Nibbles {
        Self::account_path(address).extended(&Nibbles::from_key(keccak(key.as_bytes()).as_bytes()))
    }

    fn code_path(code_hash: &H256) -> Nibbles {
        Nibbles::from_nibbles(&[CODE_NIBBLE]).extended(&Nibbles::from_key(code_hash.as_bytes()))
    }

    /// Account state under `root`.
    pub fn read_account(&self, root: &SharedNode, address: &Address) -> Option<Account> {
        let bytes = find(&self.aux, root, &Self::account_path(address))?;
        Some(Account::from_rlp(&bytes).expect("state trie holds canonically encoded accounts"))
    }

    /// Storage slot value under `root`; absent slots read as zero.
    pub fn read_storage(&self, root: &SharedNode, address: &Address, key: &H256) -> H256 {
        match find(&self.aux, root, &Self::storage_path(address, key)) {
            Some(bytes) => H256::from_slice(&bytes),
            None => H256::zero(),
        }
    }

    /// Contract code by hash under `root`.
    pub fn read_code(&self, root: &SharedNode, code_hash: &H256) -> Option<Bytes> {
        find(&self.aux, root, &Self::code_path(code_hash))
    }

    /// Apply a block's net state change on top of `parent_root`,
    /// recording the new root as the proposal `(block_number, round)`.
    /// The root pointer is not durable until `finalize`.
    pub fn commit(
        &self,
        parent_root: Option<SharedNode>,
        account_updates: UpdateList,
        code_updates: UpdateList,
        block_number: BlockNumber,
        round: Round,
    ) -> Option<SharedNode> {
        let version = block_number as i64;
        let mut updates = vec![triedb::Update {
            key: Nibbles::from_nibbles(&[STATE_NIBBLE]),
            value: Some(Bytes::new()),
            next: account_updates,
            version,
            incarnation: false,
        }];
        if !code_updates.is_empty() {
            updates.push(triedb::Update {
                key: Nibbles::from_nibbles(&[CODE_NIBBLE]),
                value: Some(Bytes::new()),
                next: code_updates,
                version,
                incarnation: false,
            });
        }
        let aux = self.aux.clone();
        let compact = self.config.compact;
        let auto_expire = self.config.auto_expire;
        let root = self.service.call(move || {
            let mut sm = StateTrieMachine::for_account_trie(compact, auto_expire);
            upsert(
                &aux,
                block_number,
                &mut sm as &mut dyn StateMachine,
                parent_root,
                updates,
                false,
            )
        });
        if let Some(ref root) = root {
            self.proposals
                .write()
                .insert((block_number, round), root.clone());
        }
        debug!(target: "statedb", "committed proposal block {block_number} round {round}");
        root
    }

    /// Promote a proposal to finalized: durably record its root pointer
    /// and drop every competing proposal at or below its height.
    pub fn finalize(&self, block_number: BlockNumber, round: Round) {
        let root = self
            .proposals
            .write()
            .remove(&(block_number, round))
            .expect("finalizing an unknown proposal");
        {
            let aux = self.aux.clone();
            let root = root.clone();
            self.service
                .call(move || triedb::write_new_root_node(&aux, &root, block_number));
        }
        self.committed.write().insert(block_number, root);
        self.proposals
            .write()
            .retain(|(number, _), _| *number > block_number);
        self.latest_finalized
            .store(block_number, AtomicOrdering::Release);
        info!(target: "statedb", "finalized block {block_number} (round {round})");
    }

    /// Root of a finalized block, from memory or the cnv ring.
    pub fn committed_root(&self, block_number: BlockNumber) -> Option<SharedNode> {
        if let Some(root) = self.committed.read().get(&block_number) {
            return Some(root.clone());
        }
        let entry = self
            .aux
            .pool()
            .expect("database always runs on a pool")
            .roots()
            .read_root(block_number)
            .expect("Low-level database error. Some issue with your hard disk?")?;
        Some(self.aux.read_node(entry.root_offset))
    }

    /// Root of a live proposal.
    pub fn proposal_root(&self, block_number: BlockNumber, round: Round) -> Option<SharedNode> {
        self.proposals.read().get(&(block_number, round)).cloned()
    }

    /// Highest finalized block number.
    pub fn latest_finalized(&self) -> BlockNumber {
        self.latest_finalized.load(AtomicOrdering::Acquire)
    }

    /// Root of the highest finalized block.
    pub fn latest_finalized_root(&self) -> Option<SharedNode> {
        let committed = self.committed.read();
        committed.values().next_back().cloned()
    }

    /// Trie paths for update construction.
    pub(crate) fn account_key(address: &Address) -> Nibbles {
        Nibbles::from_key(keccak(address.as_bytes()).as_bytes())
    }

    pub(crate) fn storage_key(key: &H256) -> Nibbles {
        Nibbles::from_key(keccak(key.as_bytes()).as_bytes())
    }

    pub(crate) fn code_key(code_hash: &H256) -> Nibbles {
        Nibbles::from_key(code_hash.as_bytes())
    }

    /// Encode a storage value for the trie.
    pub(crate) fn encode_storage_value(value: &H256) -> Bytes {
        value.as_bytes().to_vec()
    }

    /// Encode a balance for convenience accessors.
    pub fn balance_of(&self, root: &SharedNode, address: &Address) -> U256 {
        self.read_account(root, address)
            .map(|account| account.balance)
            .unwrap_or_default()
    }
}
