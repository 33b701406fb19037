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

//! The update recursion.
//!
//! `upsert` walks the intersection of the existing trie and a path-sorted
//! update batch, producing a new root copy-on-write. Reads of not-resident
//! nodes run synchronous-style through the I/O layer; propagation back up
//! is the call stack. Compaction and expiration of untouched siblings
//! piggyback on the walk (see `maintenance`).

use std::sync::Arc;

use bytes::Bytes;
use chunkstore::{ChunkOffset, CompactOffset, RootEntry, INVALID_COMPACT_OFFSET, INVALID_OFFSET};

use crate::{
    aux::UpdateAux,
    nibbles::Nibbles,
    node::{calc_min_offsets, calc_min_version, mask_iter, Child, Node, SharedNode},
    state_machine::StateMachine,
    update::{Requests, Update, UpdateList},
};

/// A finished child slot being handed to its parent: the created or
/// adopted node plus the metadata the parent's child table will carry.
pub(crate) struct ChildEntry {
    pub branch: u8,
    pub ptr: Option<SharedNode>,
    pub offset: ChunkOffset,
    pub min_offset_fast: CompactOffset,
    pub min_offset_slow: CompactOffset,
    pub subtrie_min_version: i64,
    pub data: Bytes,
    pub cache: bool,
}

impl ChildEntry {
    /// Adopt an untouched child of an existing node.
    pub(crate) fn from_old(branch: u8, child: &Child) -> ChildEntry {
        ChildEntry {
            branch,
            ptr: child.cached(),
            offset: child.fnext,
            min_offset_fast: child.min_offset_fast,
            min_offset_slow: child.min_offset_slow,
            subtrie_min_version: child.subtrie_min_version,
            data: child.data.clone(),
            cache: true,
        }
    }
}

pub(crate) struct TrieUpdate<'a> {
    pub aux: &'a UpdateAux,
    pub sm: &'a mut dyn StateMachine,
}

/// Apply a batch of updates to the trie rooted at `old_root`, returning
/// the new in-memory root (`None` when the trie became empty). With
/// `write_root` set the root is serialized and its pointer appended to
/// the cnv ring under `version`; otherwise buffered writes are drained
/// without the root pointer update.
///
/// A single writer runs at a time; re-entrance from the owning thread is
/// permitted for nested subtrie updates.
pub fn upsert(
    aux: &UpdateAux,
    version: u64,
    sm: &mut dyn StateMachine,
    old_root: Option<SharedNode>,
    updates: UpdateList,
    write_root: bool,
) -> Option<SharedNode> {
    aux.assert_owning_thread();
    let _writer = aux.writer_lock();
    aux.reset_stats();
    let mut ctx = TrieUpdate { aux, sm };
    let root = match old_root {
        Some(old) => {
            if updates.is_empty() {
                // Maintenance-only pass: dispatch an empty batch over the
                // root so untouched children get compacted or expired.
                let path_len = old.path.len();
                for i in 0..path_len {
                    ctx.sm.down(old.path.at(i));
                }
                let entry = ctx.dispatch_updates(
                    old.clone(),
                    Requests::default(),
                    path_len,
                    old.path.clone(),
                    old.value.clone(),
                    old.version,
                    0,
                );
                ctx.sm.up(path_len);
                entry
            } else {
                ctx.upsert_node(Some(old), INVALID_OFFSET, updates, 0, 0, 0)
            }
        }
        None => ctx.create_new_trie(updates, 0, 0),
    };
    let root = root.and_then(|entry| entry.ptr);
    if aux.is_on_disk() {
        match root {
            Some(ref node) => {
                if write_root {
                    write_new_root_node(aux, node, version);
                } else {
                    flush_buffered_writes(aux);
                }
            }
            None => flush_buffered_writes(aux),
        }
    }
    root
}

/// Drain pending node writes to the storage pool.
pub fn flush_buffered_writes(aux: &UpdateAux) {
    aux.flush_writes();
}

/// Serialize the root, durably drain both rings, and append the root
/// pointer to the cnv ring keyed by `version`.
pub fn write_new_root_node(aux: &UpdateAux, root: &SharedNode, version: u64) -> ChunkOffset {
    let offset = aux.write_node(root, true);
    aux.flush_writes_durable();
    aux.pool()
        .expect("root writes only happen on on-disk engines")
        .roots()
        .write_root(RootEntry {
            block_number: version,
            root_offset: offset,
            version,
        })
        .expect("Low-level database error. Some issue with your hard disk?");
    debug!(target: "triedb", "root for version {version} at {offset:?}");
    offset
}

/// Look up the value at `path` under `root`, reading nodes from the pool
/// as needed and publishing them into the in-memory child slots.
pub fn find(aux: &UpdateAux, root: &SharedNode, path: &Nibbles) -> Option<Bytes> {
    let mut node: SharedNode = root.clone();
    let mut at = 0usize;
    loop {
        let node_path_len = node.path.len();
        if path.len() - at < node_path_len || node.path != path.substr(at, node_path_len) {
            return None;
        }
        at += node_path_len;
        if at == path.len() {
            return node.value.clone();
        }
        let branch = path.at(at);
        at += 1;
        let child = node.child_at_branch(branch)?;
        let next = match child.cached() {
            Some(next) => next,
            None => {
                if !child.fnext.is_valid() {
                    return None;
                }
                let read = aux.read_node(child.fnext);
                child.populate(read.clone());
                read
            }
        };
        node = next;
    }
}

/// Walk the trie under `root`, pulling into memory every node the state
/// machine's `cache` predicate selects. Returns the number of nodes
/// loaded from disk.
pub fn load_all(aux: &UpdateAux, sm: &mut dyn StateMachine, root: &SharedNode) -> usize {
    fn process(aux: &UpdateAux, sm: &mut dyn StateMachine, node: &SharedNode) -> usize {
        let mut loaded = 0;
        for i in 0..node.path.len() {
            sm.down(node.path.at(i));
        }
        for (_, branch, child) in node.children_iter() {
            sm.down(branch);
            if sm.cache() {
                let next = match child.cached() {
                    Some(next) => next,
                    None => {
                        let read = aux.read_node(child.fnext);
                        child.populate(read.clone());
                        loaded += 1;
                        read
                    }
                };
                loaded += process(aux, sm, &next);
            }
            sm.up(1);
        }
        sm.up(node.path.len());
        loaded
    }
    let loaded = process(aux, sm, root);
    debug!(target: "triedb", "load_all pulled {loaded} nodes");
    loaded
}

impl<'a> TrieUpdate<'a> {
    /// Child data, cache decision and subtree aggregates for a node that
    /// was just created at the state machine's current position.
    fn finalize_entry(&mut self, branch: u8, node: SharedNode) -> ChildEntry {
        let data = self.sm.compute().compute(&node);
        let subtrie_min_version = calc_min_version(&node);
        if self.sm.auto_expire() {
            assert!(
                subtrie_min_version >= self.aux.auto_expire_version(),
                "created node below the expiration horizon"
            );
        }
        ChildEntry {
            branch,
            ptr: Some(node),
            offset: INVALID_OFFSET,
            min_offset_fast: INVALID_COMPACT_OFFSET,
            min_offset_slow: INVALID_COMPACT_OFFSET,
            subtrie_min_version,
            data,
            cache: self.sm.cache(),
        }
    }

    /// Build a subtree from a batch that has no corresponding existing
    /// node. Walks the longest shared prefix, then splits by the next
    /// nibble. A lone deletion here is a silent no-op.
    pub(crate) fn create_new_trie(
        &mut self,
        mut updates: UpdateList,
        prefix_index: usize,
        branch: u8,
    ) -> Option<ChildEntry> {
        if updates.is_empty() {
            return None;
        }
        if updates.len() == 1 {
            let update = updates.pop().expect("checked length above");
            if update.value.is_none() && update.next.is_empty() {
                // deleting what does not exist
                return None;
            }
            assert!(
                !self.sm.is_variable_length() || update.next.is_empty(),
                "invalid update: variable-length tables do not support nested updates"
            );
            let path = update.key.suffix(prefix_index);
            for i in 0..path.len() {
                self.sm.down(path.at(i));
            }
            let requests = Requests::split(update.next, 0);
            assert!(requests.leaf.is_none());
            let entry =
                self.create_from_requests(requests, path.clone(), 0, update.value, update.version, branch);
            if !path.is_empty() {
                self.sm.up(path.len());
            }
            return entry;
        }
        let prefix_start = prefix_index;
        let mut prefix_index = prefix_index;
        let mut requests;
        loop {
            requests = Requests::split(updates, prefix_index);
            assert!(requests.branch_count() > 0);
            assert!(
                requests.leaf.is_none() || self.sm.is_variable_length(),
                "invalid update: variable-length updates on a fixed-length table"
            );
            if requests.branch_count() > 1 || requests.leaf.is_some() {
                break;
            }
            let next_branch = requests.first_branch();
            self.sm.down(next_branch);
            updates = requests.take(next_branch);
            prefix_index += 1;
        }
        let path = requests.first_key().substr(prefix_start, prefix_index - prefix_start);
        let (leaf_value, leaf_version) = match requests.leaf.take() {
            Some(leaf) => (leaf.value, leaf.version),
            None => (None, 0),
        };
        let entry = self.create_from_requests(
            requests,
            path,
            prefix_index,
            leaf_value,
            leaf_version,
            branch,
        );
        if prefix_start != prefix_index {
            self.sm.up(prefix_index - prefix_start);
        }
        entry
    }

    /// Build a node from already-split requests: one recursion per branch
    /// sublist, then assembly.
    fn create_from_requests(
        &mut self,
        mut requests: Requests,
        path: Nibbles,
        prefix_index: usize,
        leaf_value: Option<Bytes>,
        version: i64,
        branch: u8,
    ) -> Option<ChildEntry> {
        let mask = requests.mask;
        let mut entries = Vec::with_capacity(mask.count_ones() as usize);
        for (_, b) in mask_iter(mask) {
            self.sm.down(b);
            let entry = self.create_new_trie(requests.take(b), prefix_index + 1, b);
            self.sm.up(1);
            if let Some(entry) = entry {
                entries.push(entry);
            }
        }
        self.create_node_from_children(entries, path, leaf_value, version, branch)
    }

    /// Update the subtree rooted at `old` with a non-empty batch. Walks
    /// the old node's path against the batch's shared prefix, then
    /// terminates in a value update, a dispatch over the old node's
    /// branch point, or a path split.
    pub(crate) fn upsert_node(
        &mut self,
        old: Option<SharedNode>,
        old_offset: ChunkOffset,
        mut updates: UpdateList,
        prefix_index: usize,
        old_prefix_index: usize,
        branch: u8,
    ) -> Option<ChildEntry> {
        assert!(!updates.is_empty());
        assert!(
            !self.sm.is_variable_length(),
            "invalid update: variable-length tables do not support updates"
        );
        let old = match old {
            Some(old) => old,
            None => self.aux.read_node(old_offset),
        };
        let old_prefix_start = old_prefix_index;
        let prefix_start = prefix_index;
        let mut prefix_index = prefix_index;
        let mut old_prefix_index = old_prefix_index;
        let result = loop {
            let path = old
                .path
                .substr(old_prefix_start, old_prefix_index - old_prefix_start);
            if updates.len() == 1 && prefix_index == updates[0].key.len() {
                let update = updates.pop().expect("checked length above");
                assert_eq!(
                    old.path.len(),
                    old_prefix_index,
                    "update terminates inside an existing node's path"
                );
                break self.update_value_and_subtrie(old, path, update, branch);
            }
            let mut requests = Requests::split(std::mem::take(&mut updates), prefix_index);
            assert!(requests.mask > 0 || requests.leaf.is_some());
            if old_prefix_index == old.path.len() {
                assert!(
                    requests.leaf.is_none(),
                    "invalid update: variable-length updates on a fixed-length table"
                );
                let version = old.version;
                let leaf = old.value.clone();
                break self.dispatch_updates(
                    old,
                    requests,
                    prefix_index,
                    path,
                    leaf,
                    version,
                    branch,
                );
            }
            let old_nibble = old.path.at(old_prefix_index);
            if requests.branch_count() == 1
                && requests.leaf.is_none()
                && requests.first_branch() == old_nibble
            {
                updates = requests.take(old_nibble);
                self.sm.down(old_nibble);
                prefix_index += 1;
                old_prefix_index += 1;
                continue;
            }
            // mismatch or split before the end of the old node's path
            break self.mismatch_handler(
                old,
                requests,
                path,
                old_prefix_index,
                prefix_index,
                branch,
            );
        };
        if prefix_start != prefix_index {
            self.sm.up(prefix_index - prefix_start);
        }
        result
    }

    /// The batch reduced to a single update addressing exactly the old
    /// node: set or delete the value, dispatch any nested updates, and
    /// honor incarnation by discarding the old subtree first.
    fn update_value_and_subtrie(
        &mut self,
        old: SharedNode,
        path: Nibbles,
        update: Update,
        branch: u8,
    ) -> Option<ChildEntry> {
        if update.is_deletion() {
            return None;
        }
        let requests = Requests::split(update.next, 0);
        assert!(requests.leaf.is_none());
        if update.incarnation {
            // prior subtree is logically erased before `next` applies
            return self.create_from_requests(
                requests,
                path,
                0,
                update.value,
                update.version,
                branch,
            );
        }
        let leaf = match update.value {
            Some(value) => Some(value),
            None => old.value.clone(),
        };
        assert!(
            update.version >= old.version,
            "updates must not travel back in time"
        );
        self.dispatch_updates(old, requests, 0, path, leaf, update.version, branch)
    }

    /// Dispatch split requests at the end of the old node's path: recurse
    /// into matching children, grow new subtries under new nibbles, adopt
    /// untouched children (running maintenance on them), and assemble.
    pub(crate) fn dispatch_updates(
        &mut self,
        old: SharedNode,
        mut requests: Requests,
        prefix_index: usize,
        path: Nibbles,
        leaf: Option<Bytes>,
        version: i64,
        branch: u8,
    ) -> Option<ChildEntry> {
        let orig_mask = old.mask | requests.mask;
        let mut entries: Vec<ChildEntry> = Vec::with_capacity(orig_mask.count_ones() as usize);
        for (_, b) in mask_iter(orig_mask) {
            let in_requests = requests.mask & (1 << b) != 0;
            let in_old = old.mask & (1 << b) != 0;
            if in_requests {
                self.sm.down(b);
                let entry = if in_old {
                    let child = old.child_at_branch(b).expect("bit checked above");
                    self.upsert_node(
                        child.cached(),
                        child.fnext,
                        requests.take(b),
                        prefix_index + 1,
                        0,
                        b,
                    )
                } else {
                    self.create_new_trie(requests.take(b), prefix_index + 1, b)
                };
                self.sm.up(1);
                if let Some(entry) = entry {
                    entries.push(entry);
                }
            } else if in_old {
                let child = old.child_at_branch(b).expect("bit checked above");
                let entry = ChildEntry::from_old(b, child);
                if let Some(entry) = self.maintain_child(entry) {
                    entries.push(entry);
                }
            }
        }
        self.create_node_from_children(entries, path, leaf, version, branch)
    }

    /// Split the old node at a path mismatch: it becomes a branch with a
    /// path-shortened copy of the old subtree next to the new children.
    fn mismatch_handler(
        &mut self,
        old: SharedNode,
        mut requests: Requests,
        path: Nibbles,
        old_prefix_index: usize,
        prefix_index: usize,
        branch: u8,
    ) -> Option<ChildEntry> {
        assert!(
            requests.leaf.is_none(),
            "no leaf can be created at an existing non-leaf position"
        );
        let old_nibble = old.path.at(old_prefix_index);
        let orig_mask = (1u16 << old_nibble) | requests.mask;
        let mut entries: Vec<ChildEntry> = Vec::with_capacity(orig_mask.count_ones() as usize);
        for (_, b) in mask_iter(orig_mask) {
            if requests.mask & (1 << b) != 0 {
                self.sm.down(b);
                let entry = if b == old_nibble {
                    self.upsert_node(
                        Some(old.clone()),
                        INVALID_OFFSET,
                        requests.take(b),
                        prefix_index + 1,
                        old_prefix_index + 1,
                        b,
                    )
                } else {
                    self.create_new_trie(requests.take(b), prefix_index + 1, b)
                };
                self.sm.up(1);
                if let Some(entry) = entry {
                    entries.push(entry);
                }
            } else if b == old_nibble {
                self.sm.down(old_nibble);
                let path_suffix = old.path.suffix(old_prefix_index + 1);
                for i in 0..path_suffix.len() {
                    self.sm.down(path_suffix.at(i));
                }
                // path-shortened copy keeps the old node's version
                let shortened = Arc::new(Node::repathed(
                    &old,
                    path_suffix.clone(),
                    old.value.clone(),
                    old.version,
                ));
                let entry = self.finalize_entry(b, shortened);
                self.sm.up(path_suffix.len() + 1);
                if let Some(entry) = self.maintain_child(entry) {
                    entries.push(entry);
                }
            }
        }
        self.create_node_from_children(entries, path, None, 0, branch)
    }

    /// Assemble a node from finished children: collapse empty and
    /// single-child shapes, write pending children to a ring, release
    /// in-memory copies the cache policy rejects, and hand the node to
    /// the parent.
    pub(crate) fn create_node_from_children(
        &mut self,
        mut entries: Vec<ChildEntry>,
        path: Nibbles,
        leaf: Option<Bytes>,
        version: i64,
        branch: u8,
    ) -> Option<ChildEntry> {
        self.aux.note_node_created();
        if entries.is_empty() {
            return leaf.map(|value| {
                let node = Arc::new(Node::leaf(path.clone(), value, version));
                self.finalize_entry(branch, node)
            });
        }
        if entries.len() == 1 && leaf.is_none() {
            // no branch with a single child and no value survives
            let entry = entries.pop().expect("checked length above");
            let child = match entry.ptr {
                Some(ref node) => node.clone(),
                None => self.aux.read_node(entry.offset),
            };
            let joined = Nibbles::join(&path, entry.branch, &child.path);
            let node = Arc::new(Node::repathed(
                &child,
                joined,
                child.value.clone(),
                version.max(child.version),
            ));
            return Some(self.finalize_entry(branch, node));
        }
        // fold child versions in before cache policy releases pointers
        let version = entries
            .iter()
            .filter_map(|e| e.ptr.as_ref().map(|n| n.version))
            .fold(version, i64::max);
        if self.aux.is_on_disk() {
            let multiple = entries.len() > 1;
            for entry in &mut entries {
                if entry.ptr.is_some() && !entry.offset.is_valid() {
                    // write updated node to disk; unchanged old children
                    // are never re-written
                    let node = entry.ptr.as_ref().expect("checked above");
                    entry.offset = self.aux.write_node(node, true);
                    let virtual_offset = self.aux.physical_to_virtual(entry.offset);
                    debug_assert!(virtual_offset.is_valid());
                    let (min_fast, min_slow) = calc_min_offsets(node, virtual_offset);
                    entry.min_offset_fast = min_fast;
                    entry.min_offset_slow = min_slow;
                    if self.sm.compact() {
                        debug_assert!(min_fast >= self.aux.compact_offset_fast());
                        debug_assert!(min_slow >= self.aux.compact_offset_slow());
                    }
                }
                // a single child always stays resident so a later
                // coalesce never has to re-read it
                if multiple && !entry.cache {
                    entry.ptr = None;
                }
            }
        }
        let mask = entries.iter().fold(0u16, |m, e| m | 1 << e.branch);
        debug_assert_eq!(mask.count_ones() as usize, entries.len());
        entries.sort_by_key(|e| e.branch);
        let children = entries
            .into_iter()
            .map(|e| {
                Child::new(
                    e.offset,
                    e.min_offset_fast,
                    e.min_offset_slow,
                    e.subtrie_min_version,
                    e.data,
                    e.ptr,
                )
            })
            .collect();
        let node = Arc::new(Node::new(mask, version, path, leaf, children));
        Some(self.finalize_entry(branch, node))
    }
}
