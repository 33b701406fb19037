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

//! Online reclamation, fused into the update walk.
//!
//! Compaction rewrites nodes whose subtree reaches below the compaction
//! window so the chunks they lived in can be released; a node migrates to
//! the slow ring only once its entire subtree has. Expiration prunes
//! subtrees whose newest version is older than the horizon and coalesces
//! what remains. When a child qualifies for both, expiration is checked
//! first and wins; a pruned subtree is never also rewritten.

use std::sync::Arc;

use chunkstore::{ChunkOffset, CompactOffset};

use crate::{
    node::{calc_min_offsets, calc_min_version, Child, Node, SharedNode},
    trie::{ChildEntry, TrieUpdate},
};

/// A node rewritten by maintenance, with the metadata its parent stores.
struct Rewritten {
    node: SharedNode,
    offset: ChunkOffset,
    min_offset_fast: CompactOffset,
    min_offset_slow: CompactOffset,
}

impl<'a> TrieUpdate<'a> {
    /// Run expiration and compaction checks on an untouched child being
    /// adopted by a rebuilt parent. Returns `None` when the whole child
    /// subtree expired.
    pub(crate) fn maintain_child(&mut self, entry: ChildEntry) -> Option<ChildEntry> {
        if !self.aux.is_on_disk() {
            return Some(entry);
        }
        if self.sm.auto_expire() && entry.subtrie_min_version < self.aux.auto_expire_version() {
            return self.expire_child(entry);
        }
        if self.sm.compact() {
            // a freshly repathed copy has no offsets of its own yet;
            // derive the window test from the node it wraps
            let (min_fast, min_slow) = if entry.offset.is_valid() {
                (entry.min_offset_fast, entry.min_offset_slow)
            } else {
                let node = entry.ptr.as_ref().expect("unwritten children are resident");
                calc_min_offsets(node, chunkstore::INVALID_VIRTUAL_OFFSET)
            };
            if min_fast < self.aux.compact_offset_fast()
                || min_slow < self.aux.compact_offset_slow()
            {
                let copy_for_fast = min_fast < self.aux.compact_offset_fast();
                return Some(self.compact_child(entry, copy_for_fast));
            }
        }
        Some(entry)
    }

    fn compact_child(&mut self, entry: ChildEntry, copy_for_fast: bool) -> ChildEntry {
        let rewritten = self.compact_node(entry.ptr.clone(), entry.offset, copy_for_fast);
        ChildEntry {
            branch: entry.branch,
            ptr: Some(rewritten.node),
            offset: rewritten.offset,
            min_offset_fast: rewritten.min_offset_fast,
            min_offset_slow: rewritten.min_offset_slow,
            // compaction moves bytes, never content
            subtrie_min_version: entry.subtrie_min_version,
            data: entry.data,
            cache: entry.cache,
        }
    }

    /// Rewrite `node` and every descendant below the compaction window.
    /// The rewrite lands on the fast ring while the subtree still holds
    /// any fast-ring node, else on the slow ring.
    fn compact_node(
        &mut self,
        node: Option<SharedNode>,
        node_offset: ChunkOffset,
        _copy_for_fast: bool,
    ) -> Rewritten {
        let node = match node {
            Some(node) => node,
            None => {
                debug_assert!(node_offset.is_valid());
                let bytes = u64::from(node_offset.spare_pages()) * chunkstore::DISK_PAGE_SIZE as u64;
                self.aux.note_compaction_read(bytes);
                self.aux.read_node(node_offset)
            }
        };
        // A node above the window keeps its ring; one below it (or not
        // yet written) starts out bound for the slow ring and is pulled
        // back to fast below if its subtree still references fast chunks.
        let virtual_offset = self.aux.physical_to_virtual(node_offset);
        let mut rewrite_to_fast = if !virtual_offset.is_valid() {
            true
        } else if virtual_offset.in_fast_ring() {
            virtual_offset.compact() >= self.aux.compact_offset_fast()
        } else {
            virtual_offset.compact() >= self.aux.compact_offset_slow()
        };

        let fast_window = self.aux.compact_offset_fast();
        let slow_window = self.aux.compact_offset_slow();
        let mut children: Vec<Child> = Vec::with_capacity(node.child_count());
        for (_, _, child) in node.children_iter() {
            if child.min_offset_fast < fast_window || child.min_offset_slow < slow_window {
                let rewritten = self.compact_node(
                    child.cached(),
                    child.fnext,
                    child.min_offset_fast < fast_window,
                );
                children.push(Child::new(
                    rewritten.offset,
                    rewritten.min_offset_fast,
                    rewritten.min_offset_slow,
                    child.subtrie_min_version,
                    child.data.clone(),
                    if child.cached().is_some() {
                        Some(rewritten.node)
                    } else {
                        None
                    },
                ));
            } else {
                children.push(child.clone());
            }
        }
        let rebuilt = Arc::new(Node::new(
            node.mask,
            node.version,
            node.path.clone(),
            node.value.clone(),
            children,
        ));
        let (mut min_fast, mut min_slow) =
            calc_min_offsets(&rebuilt, chunkstore::INVALID_VIRTUAL_OFFSET);
        // a subtree still holding fast-ring nodes keeps its root on fast
        if min_fast.is_valid() {
            rewrite_to_fast = true;
        }
        let offset = self.aux.write_node(&rebuilt, rewrite_to_fast);
        self.aux.note_compacted(rewrite_to_fast);
        let own = self.aux.physical_to_virtual(offset);
        debug_assert!(own.is_valid());
        if own.in_fast_ring() {
            min_fast = min_fast.min(own.compact());
        } else {
            min_slow = min_slow.min(own.compact());
        }
        debug_assert!(min_fast >= fast_window);
        debug_assert!(min_slow >= slow_window);
        Rewritten {
            node: rebuilt,
            offset,
            min_offset_fast: min_fast,
            min_offset_slow: min_slow,
        }
    }

    fn expire_child(&mut self, entry: ChildEntry) -> Option<ChildEntry> {
        let expired = self.expire_node(entry.ptr.clone(), entry.offset)?;
        let min_version = calc_min_version(&expired.node);
        debug_assert!(min_version >= self.aux.auto_expire_version());
        Some(ChildEntry {
            branch: entry.branch,
            ptr: Some(expired.node),
            offset: expired.offset,
            min_offset_fast: expired.min_offset_fast,
            min_offset_slow: expired.min_offset_slow,
            subtrie_min_version: min_version,
            // child data is not recomputed on expiration
            data: entry.data,
            cache: entry.cache,
        })
    }

    /// Prune everything under `node` that is entirely below the
    /// expiration horizon. Children merely below the compaction window
    /// are compacted instead. Returns `None` when the node itself
    /// expires.
    fn expire_node(&mut self, node: Option<SharedNode>, node_offset: ChunkOffset) -> Option<Rewritten> {
        assert!(self.sm.auto_expire() && self.sm.compact());
        let node = match node {
            Some(node) => node,
            None => {
                debug_assert!(node_offset.is_valid());
                self.aux.note_expire_read();
                self.aux.read_node(node_offset)
            }
        };
        let horizon = self.aux.auto_expire_version();
        if node.version < horizon {
            // nothing in the subtree can be newer than its root's write
            self.aux.note_subtree_expired();
            return None;
        }
        let fast_window = self.aux.compact_offset_fast();
        let slow_window = self.aux.compact_offset_slow();
        let mut survivors: Vec<(u8, Child)> = Vec::with_capacity(node.child_count());
        for (_, branch, child) in node.children_iter() {
            if child.subtrie_min_version < horizon {
                match self.expire_node(child.cached(), child.fnext) {
                    Some(rewritten) => {
                        let min_version = calc_min_version(&rewritten.node);
                        survivors.push((
                            branch,
                            Child::new(
                                rewritten.offset,
                                rewritten.min_offset_fast,
                                rewritten.min_offset_slow,
                                min_version,
                                child.data.clone(),
                                Some(rewritten.node),
                            ),
                        ));
                    }
                    None => {
                        self.aux.note_subtree_expired();
                    }
                }
            } else if child.min_offset_fast < fast_window || child.min_offset_slow < slow_window {
                let rewritten = self.compact_node(
                    child.cached(),
                    child.fnext,
                    child.min_offset_fast < fast_window,
                );
                survivors.push((
                    branch,
                    Child::new(
                        rewritten.offset,
                        rewritten.min_offset_fast,
                        rewritten.min_offset_slow,
                        child.subtrie_min_version,
                        child.data.clone(),
                        Some(rewritten.node),
                    ),
                ));
            } else {
                survivors.push((branch, child.clone()));
            }
        }
        let rebuilt: SharedNode = if survivors.is_empty() {
            match node.value {
                // all storage below expired but the account itself lives on
                Some(ref value) => Arc::new(Node::leaf(
                    node.path.clone(),
                    value.clone(),
                    node.version,
                )),
                None => {
                    self.aux.note_subtree_expired();
                    return None;
                }
            }
        } else if survivors.len() == 1 && !node.has_value() {
            // single survivor coalesces with the branch nibble
            let (branch, child) = survivors.pop().expect("checked length above");
            let child_node = match child.cached() {
                Some(child_node) => child_node,
                None => self.aux.read_node(child.fnext),
            };
            let joined = crate::nibbles::Nibbles::join(&node.path, branch, &child_node.path);
            Arc::new(Node::repathed(
                &child_node,
                joined,
                child_node.value.clone(),
                child_node.version,
            ))
        } else {
            let mask = survivors.iter().fold(0u16, |m, (b, _)| m | 1 << b);
            let children = survivors.into_iter().map(|(_, c)| c).collect();
            Arc::new(Node::new(
                mask,
                node.version,
                node.path.clone(),
                node.value.clone(),
                children,
            ))
        };
        let (mut min_fast, mut min_slow) =
            calc_min_offsets(&rebuilt, chunkstore::INVALID_VIRTUAL_OFFSET);
        let offset = self.aux.write_node(&rebuilt, true);
        let own = self.aux.physical_to_virtual(offset);
        debug_assert!(own.is_valid());
        if own.in_fast_ring() {
            min_fast = min_fast.min(own.compact());
        } else {
            min_slow = min_slow.min(own.compact());
        }
        Some(Rewritten {
            node: rebuilt,
            offset,
            min_offset_fast: min_fast,
            min_offset_slow: min_slow,
        })
    }
}
