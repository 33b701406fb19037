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

//! Concurrent two-level LRU cache: account entries in an outer map, each
//! owning a shared per-account storage map.
//!
//! Lookups never take an LRU lock; they refresh the entry's LRU link only
//! when its last-touch stamp is older than a threshold (about a second),
//! so a hot key costs one atomic load per hit. Insertion goes to the hash
//! map first; eviction is decoupled - when the atomic count passes the
//! cap, a compare-exchange elects a single evictor that pops the LRU tail
//! under a short lock.
//!
//! The storage map of an account lives in an `Arc`ed wrapper co-owned by
//! the account entry and by every storage LRU link into it. An account
//! reset swaps in a fresh wrapper; the old map stays alive until the last
//! of its entries is evicted, so readers racing the reset never touch a
//! freed map.

#[macro_use]
extern crate log;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering},
        Arc,
    },
    time::Instant,
};

use dashmap::DashMap;
use ethereum_types::{Address, H256};
use parking_lot::Mutex;

const ONE_SECOND_NANOS: u64 = 1_000_000_000;

/// Age an entry must reach before a hit refreshes its LRU link.
const LRU_UPDATE_PERIOD: u64 = ONE_SECOND_NANOS;

fn now_nanos() -> u64 {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

struct LruStamp {
    /// Last LRU refresh, for the update-period test.
    touched: AtomicU64,
    /// Sequence of this entry's newest queue link; stale links are
    /// skipped at eviction.
    sequence: AtomicU64,
}

impl LruStamp {
    fn new() -> LruStamp {
        LruStamp {
            touched: AtomicU64::new(now_nanos()),
            sequence: AtomicU64::new(0),
        }
    }

    fn needs_refresh(&self) -> bool {
        now_nanos().saturating_sub(self.touched.load(AtomicOrdering::Relaxed)) >= LRU_UPDATE_PERIOD
    }
}

/// One LRU level: a queue of (key, sequence) links with lazy deletion.
struct LruQueue<K> {
    queue: Mutex<VecDeque<(K, u64)>>,
    next_sequence: AtomicU64,
}

impl<K> LruQueue<K> {
    fn new() -> LruQueue<K> {
        LruQueue {
            queue: Mutex::new(VecDeque::new()),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Append a fresh link for `key` and stamp it into `stamp`.
    fn push(&self, key: K, stamp: &LruStamp) {
        let sequence = self.next_sequence.fetch_add(1, AtomicOrdering::Relaxed);
        stamp.sequence.store(sequence, AtomicOrdering::Relaxed);
        stamp.touched.store(now_nanos(), AtomicOrdering::Relaxed);
        self.queue.lock().push_back((key, sequence));
    }

    /// Pop the oldest link. The caller validates the sequence against the
    /// entry and skips stale links.
    fn pop(&self) -> Option<(K, u64)> {
        self.queue.lock().pop_front()
    }

    fn clear(&self) {
        self.queue.lock().clear();
    }
}

struct StorageEntry {
    value: H256,
    stamp: LruStamp,
}

/// The shared per-account storage map. Account entries and storage LRU
/// links co-own it so neither can outlive the map they point into.
pub struct StorageMapWrapper {
    map: DashMap<H256, StorageEntry>,
}

impl StorageMapWrapper {
    fn new() -> Arc<StorageMapWrapper> {
        Arc::new(StorageMapWrapper {
            map: DashMap::new(),
        })
    }
}

struct AccountEntry<A> {
    /// `None` records that the account is known to be missing.
    value: Option<A>,
    storage: Arc<StorageMapWrapper>,
    stamp: LruStamp,
}

/// Concurrent account + storage cache with per-level capacity caps.
pub struct AccountStorageCache<A: Clone> {
    accounts: DashMap<Address, AccountEntry<A>>,
    account_lru: LruQueue<Address>,
    storage_lru: LruQueue<(Arc<StorageMapWrapper>, H256)>,
    account_capacity: usize,
    storage_capacity: usize,
    account_count: AtomicUsize,
    storage_count: AtomicUsize,
    account_evicting: AtomicBool,
    storage_evicting: AtomicBool,
}

impl<A: Clone> AccountStorageCache<A> {
    /// A cache holding at most `account_capacity` accounts and
    /// `storage_capacity` storage slots across all accounts.
    pub fn new(account_capacity: usize, storage_capacity: usize) -> AccountStorageCache<A> {
        AccountStorageCache {
            accounts: DashMap::new(),
            account_lru: LruQueue::new(),
            storage_lru: LruQueue::new(),
            account_capacity,
            storage_capacity,
            account_count: AtomicUsize::new(0),
            storage_count: AtomicUsize::new(0),
            account_evicting: AtomicBool::new(false),
            storage_evicting: AtomicBool::new(false),
        }
    }

    /// Cached account state: `None` on a miss, `Some(None)` when the
    /// account is cached as missing.
    pub fn get_account(&self, address: &Address) -> Option<Option<A>> {
        let entry = self.accounts.get(address)?;
        if entry.stamp.needs_refresh() {
            self.account_lru.push(*address, &entry.stamp);
        }
        Some(entry.value.clone())
    }

    /// Insert or overwrite an account. Inserting `None` is an account
    /// reset: the storage map reference is dropped and a fresh one takes
    /// its place, while outstanding storage links keep the old map alive
    /// until they are evicted in turn.
    pub fn insert_account(&self, address: Address, account: Option<A>) {
        let mut fresh = false;
        match self.accounts.entry(address) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.value = account.clone();
                if account.is_none() {
                    trace!(target: "account_cache", "reset storage of {address:?}");
                    entry.storage = StorageMapWrapper::new();
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let entry = AccountEntry {
                    value: account,
                    storage: StorageMapWrapper::new(),
                    stamp: LruStamp::new(),
                };
                self.account_lru.push(address, &entry.stamp);
                vacant.insert(entry);
                fresh = true;
            }
        }
        if fresh && self.account_count.fetch_add(1, AtomicOrdering::AcqRel) + 1 > self.account_capacity
        {
            self.evict_accounts();
        }
    }

    /// Cached storage slot value.
    pub fn get_storage(&self, address: &Address, key: &H256) -> Option<H256> {
        let storage = self.accounts.get(address)?.storage.clone();
        let entry = storage.map.get(key)?;
        if entry.stamp.needs_refresh() {
            self.storage_lru.push((storage.clone(), *key), &entry.stamp);
        }
        Some(entry.value)
    }

    /// Insert a storage slot under a cached account; a slot of an
    /// uncached account is not cacheable (the account entry owns the
    /// map). Returns whether the value was stored.
    pub fn insert_storage(&self, address: &Address, key: H256, value: H256) -> bool {
        let storage = match self.accounts.get(address) {
            Some(entry) => entry.storage.clone(),
            None => return false,
        };
        let mut fresh = false;
        match storage.map.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                occupied.get_mut().value = value;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let entry = StorageEntry {
                    value,
                    stamp: LruStamp::new(),
                };
                self.storage_lru.push((storage.clone(), key), &entry.stamp);
                vacant.insert(entry);
                fresh = true;
            }
        }
        if fresh && self.storage_count.fetch_add(1, AtomicOrdering::AcqRel) + 1 > self.storage_capacity
        {
            self.evict_storage();
        }
        true
    }

    /// Number of cached accounts.
    pub fn account_len(&self) -> usize {
        self.account_count.load(AtomicOrdering::Acquire)
    }

    /// Number of cached storage slots, orphaned maps included.
    pub fn storage_len(&self) -> usize {
        self.storage_count.load(AtomicOrdering::Acquire)
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.accounts.clear();
        self.account_lru.clear();
        self.storage_lru.clear();
        self.account_count.store(0, AtomicOrdering::Release);
        self.storage_count.store(0, AtomicOrdering::Release);
    }

    fn evict_accounts(&self) {
        // a single evictor runs at a time
        if self
            .account_evicting
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_err()
        {
            return;
        }
        while self.account_count.load(AtomicOrdering::Acquire) > self.account_capacity {
            let (address, sequence) = match self.account_lru.pop() {
                Some(link) => link,
                None => break,
            };
            let current = match self.accounts.get(&address) {
                Some(entry) => entry.stamp.sequence.load(AtomicOrdering::Relaxed),
                None => continue,
            };
            if current != sequence {
                // refreshed since this link was queued
                continue;
            }
            if self.accounts.remove(&address).is_some() {
                self.account_count.fetch_sub(1, AtomicOrdering::AcqRel);
                trace!(target: "account_cache", "evicted account {address:?}");
            }
        }
        self.account_evicting.store(false, AtomicOrdering::Release);
    }

    fn evict_storage(&self) {
        if self
            .storage_evicting
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_err()
        {
            return;
        }
        while self.storage_count.load(AtomicOrdering::Acquire) > self.storage_capacity {
            let ((storage, key), sequence) = match self.storage_lru.pop() {
                Some(link) => link,
                None => break,
            };
            let current = match storage.map.get(&key) {
                Some(entry) => entry.stamp.sequence.load(AtomicOrdering::Relaxed),
                None => continue,
            };
            if current != sequence {
                continue;
            }
            if storage.map.remove(&key).is_some() {
                self.storage_count.fetch_sub(1, AtomicOrdering::AcqRel);
            }
        }
        self.storage_evicting.store(false, AtomicOrdering::Release);
    }
}
