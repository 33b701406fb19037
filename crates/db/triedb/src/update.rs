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

//! The unit of input to an upsert pass.

use bytes::Bytes;

use crate::nibbles::Nibbles;

/// One keyed change. A present `value` writes or overwrites, an absent
/// one deletes. A non-empty `next` attaches a nested trie below the key
/// (storage below an account). `incarnation` logically erases any prior
/// subtree under the key before `next` is applied.
#[derive(Debug, Clone)]
pub struct Update {
    /// Nibble path the change applies to.
    pub key: Nibbles,
    /// New value, or `None` to delete.
    pub value: Option<Bytes>,
    /// Nested trie updates hanging below this key.
    pub next: UpdateList,
    /// Version the change is written at.
    pub version: i64,
    /// Wipe any prior subtree under the key first.
    pub incarnation: bool,
}

impl Update {
    /// A plain write.
    pub fn put(key: Nibbles, value: Bytes, version: i64) -> Update {
        Update {
            key,
            value: Some(value),
            next: UpdateList::new(),
            version,
            incarnation: false,
        }
    }

    /// A deletion; removing an absent key is a silent no-op.
    pub fn delete(key: Nibbles, version: i64) -> Update {
        Update {
            key,
            value: None,
            next: UpdateList::new(),
            version,
            incarnation: false,
        }
    }

    /// Whether this update erases the key.
    pub fn is_deletion(&self) -> bool {
        self.value.is_none() && self.next.is_empty() && !self.incarnation
    }
}

/// A batch of updates, kept sorted by key. Two updates with the same key
/// in one batch are ill-defined and rejected at dispatch.
pub type UpdateList = Vec<Update>;

/// `updates` split by the nibble at `prefix_index`: one sublist per
/// branch nibble, plus at most one update terminating exactly at the
/// prefix (only legal for variable-length tables).
#[derive(Default)]
pub struct Requests {
    /// Bit `b` set iff `sublists[b]` is non-empty.
    pub mask: u16,
    /// Per-branch sublists.
    pub sublists: [UpdateList; 16],
    /// The update whose key ends at the split point, if any.
    pub leaf: Option<Update>,
}

impl Requests {
    /// Split a batch at `prefix_index`. Returns the number of non-empty
    /// sublists.
    pub fn split(updates: UpdateList, prefix_index: usize) -> Requests {
        let mut requests = Requests::default();
        for update in updates {
            if update.key.len() == prefix_index {
                assert!(
                    requests.leaf.is_none(),
                    "invalid update batch: duplicate key {:?}",
                    update.key
                );
                requests.leaf = Some(update);
                continue;
            }
            let branch = update.key.at(prefix_index);
            let sublist = &mut requests.sublists[branch as usize];
            if let Some(last) = sublist.last() {
                assert!(
                    last.key != update.key,
                    "invalid update batch: duplicate key {:?}",
                    update.key
                );
            }
            requests.mask |= 1 << branch;
            sublist.push(update);
        }
        requests
    }

    /// Number of non-empty sublists.
    pub fn branch_count(&self) -> usize {
        self.mask.count_ones() as usize
    }

    /// The only branch nibble, when exactly one sublist is non-empty.
    pub fn first_branch(&self) -> u8 {
        debug_assert!(self.mask != 0);
        self.mask.trailing_zeros() as u8
    }

    /// Take the sublist for a branch.
    pub fn take(&mut self, branch: u8) -> UpdateList {
        std::mem::take(&mut self.sublists[branch as usize])
    }

    /// The key of some update in the batch; all of them share the prefix
    /// up to the split point.
    pub fn first_key(&self) -> &Nibbles {
        &self.sublists[self.first_branch() as usize][0].key
    }
}
