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

//! End-to-end tests of the update engine over a real pool.

use std::sync::Arc;

use chainstate_io::IoService;
use chunkstore::{CompactOffset, Pool, PoolConfig};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use tempdir::TempDir;
use triedb::{
    calc_min_offsets, calc_min_version, find, upsert, Nibbles, SharedNode, StateTrieMachine,
    Update, UpdateAux, UpdateAuxConfig, UpdateList,
};

struct Harness {
    _dir: TempDir,
    service: Arc<IoService>,
    aux: Arc<UpdateAux>,
}

impl Harness {
    fn new() -> Harness {
        let _ = env_logger::try_init();
        let dir = TempDir::new("triedb").unwrap();
        let pool = Arc::new(Pool::create(dir.path(), PoolConfig::default()).unwrap());
        let service = Arc::new(IoService::start("triedb-test"));
        let aux = Arc::new(UpdateAux::new(
            pool,
            service.channel(),
            UpdateAuxConfig::default(),
        ));
        Harness {
            _dir: dir,
            service,
            aux,
        }
    }

    fn commit(
        &self,
        old_root: Option<SharedNode>,
        updates: UpdateList,
        version: u64,
    ) -> Option<SharedNode> {
        self.commit_with(old_root, updates, version, false, false)
    }

    fn commit_with(
        &self,
        old_root: Option<SharedNode>,
        updates: UpdateList,
        version: u64,
        compact: bool,
        auto_expire: bool,
    ) -> Option<SharedNode> {
        let aux = self.aux.clone();
        self.service.call(move || {
            let mut sm = StateTrieMachine::for_account_trie(compact, auto_expire);
            upsert(&aux, version, &mut sm, old_root, updates, true)
        })
    }

    fn get(&self, root: &SharedNode, key: &Nibbles) -> Option<Vec<u8>> {
        find(&self.aux, root, key)
    }
}

fn key_of(byte: u8, len: usize) -> Nibbles {
    Nibbles::from_key(&vec![byte; len])
}

fn sorted(mut updates: UpdateList) -> UpdateList {
    updates.sort_by(|a, b| a.key.cmp(&b.key));
    updates
}

/// Walk the whole trie from disk and check the structural invariants:
/// mask population vs child count, no single-child valueless branches,
/// and the min-offset / min-version aggregates.
fn check_invariants(aux: &UpdateAux, node: &SharedNode, is_root: bool) {
    assert_eq!(node.mask.count_ones() as usize, node.child_count());
    if !is_root {
        assert!(
            node.child_count() != 1 || node.has_value(),
            "single-child branch without value survived"
        );
    }
    if node.child_count() == 1 {
        assert!(node.has_value());
    }
    for (_, _, child) in node.children_iter() {
        assert!(child.fnext.is_valid());
        let loaded = aux.read_node(child.fnext);
        let own = aux.physical_to_virtual(child.fnext);
        let (min_fast, min_slow) = calc_min_offsets(&loaded, own);
        assert_eq!(child.min_offset_fast, min_fast, "fast min-offset aggregate wrong");
        assert_eq!(child.min_offset_slow, min_slow, "slow min-offset aggregate wrong");
        assert_eq!(
            child.subtrie_min_version,
            calc_min_version(&loaded),
            "subtree min-version aggregate wrong"
        );
        check_invariants(aux, &loaded, false);
    }
}

#[test]
fn insert_then_find() {
    let harness = Harness::new();
    let mut rng = XorShiftRng::seed_from_u64(7);
    let mut expected = Vec::new();
    let mut updates = Vec::new();
    for i in 0..100u32 {
        let mut key = [0u8; 32];
        rng.fill(&mut key);
        let value = i.to_le_bytes().to_vec();
        expected.push((Nibbles::from_key(&key), value.clone()));
        updates.push(Update::put(Nibbles::from_key(&key), value, 1));
    }
    let root = harness.commit(None, sorted(updates), 1).expect("non-empty");
    for (key, value) in &expected {
        assert_eq!(harness.get(&root, key).as_ref(), Some(value));
    }
    assert!(harness.get(&root, &key_of(0x11, 32)).is_none());
    harness.service.call({
        let aux = harness.aux.clone();
        let root = root.clone();
        move || check_invariants(&aux, &root, true)
    });
    assert_eq!(
        harness.aux.write_buffer_pool().free_count(),
        chainstate_io::WRITE_BUFFER_COUNT,
        "the commit returned every registered write buffer to the pool"
    );
}

#[test]
fn single_leaf_trie_and_deletion_to_empty() {
    let harness = Harness::new();
    let key = key_of(0xAB, 32);
    let root = harness
        .commit(
            None,
            vec![Update::put(key.clone(), b"v".to_vec(), 1)],
            1,
        )
        .expect("non-empty");
    // a lone pair is a leaf carrying the full path
    assert_eq!(root.mask, 0);
    assert_eq!(root.path, key);
    assert_eq!(harness.get(&root, &key), Some(b"v".to_vec()));

    let root = harness.commit(Some(root), vec![Update::delete(key, 2)], 2);
    assert!(root.is_none(), "deleting the only key empties the trie");
}

#[test]
fn deleting_missing_key_is_a_noop() {
    let harness = Harness::new();
    let root = harness
        .commit(
            None,
            sorted(vec![
                Update::put(key_of(0x11, 32), b"a".to_vec(), 1),
                Update::put(key_of(0x22, 32), b"b".to_vec(), 1),
            ]),
            1,
        )
        .expect("non-empty");
    let new_root = harness
        .commit(Some(root.clone()), vec![Update::delete(key_of(0x33, 32), 2)], 2)
        .expect("still non-empty");
    assert_eq!(harness.get(&new_root, &key_of(0x11, 32)), Some(b"a".to_vec()));
    assert_eq!(harness.get(&new_root, &key_of(0x22, 32)), Some(b"b".to_vec()));
}

#[test]
fn deletion_coalesces_surviving_child() {
    let harness = Harness::new();
    // three keys fanning out at the first nibble
    let keys = [key_of(0x15, 32), key_of(0x25, 32), key_of(0x35, 32)];
    let mut updates = Vec::new();
    for key in &keys {
        updates.push(Update::put(key.clone(), b"x".to_vec(), 1));
    }
    let root = harness.commit(None, sorted(updates), 1).expect("non-empty");
    assert_eq!(root.child_count(), 3);

    let root = harness
        .commit(
            Some(root),
            sorted(vec![
                Update::delete(keys[1].clone(), 2),
                Update::delete(keys[2].clone(), 2),
            ]),
            2,
        )
        .expect("one key left");
    // the survivor collapsed into an extended leaf with the full path
    assert_eq!(root.mask, 0);
    assert_eq!(root.path, keys[0]);
    assert_eq!(harness.get(&root, &keys[0]), Some(b"x".to_vec()));
}

#[test]
fn identical_batches_produce_identical_roots() {
    let build = || {
        let harness = Harness::new();
        let mut updates = Vec::new();
        for i in 0..50u8 {
            updates.push(Update::put(key_of(i, 32), vec![i; 8], 1));
        }
        let root = harness.commit(None, sorted(updates), 1).expect("non-empty");
        (harness, root)
    };
    let (_h1, a) = build();
    let (_h2, b) = build();
    assert_eq!(a.encode(), b.encode(), "equal inputs must serialize equally");
}

#[test]
fn nested_updates_attach_a_subtrie() {
    let harness = Harness::new();
    let account = key_of(0x77, 32);
    let slot_a = key_of(0x01, 32);
    let slot_b = key_of(0x02, 32);
    let update = Update {
        key: account.clone(),
        value: Some(b"account".to_vec()),
        next: sorted(vec![
            Update::put(slot_a.clone(), b"va".to_vec(), 1),
            Update::put(slot_b.clone(), b"vb".to_vec(), 1),
        ]),
        version: 1,
        incarnation: false,
    };
    let root = harness.commit(None, vec![update], 1).expect("non-empty");
    assert_eq!(harness.get(&root, &account), Some(b"account".to_vec()));
    assert_eq!(
        harness.get(&root, &account.extended(&slot_a)),
        Some(b"va".to_vec())
    );
    assert_eq!(
        harness.get(&root, &account.extended(&slot_b)),
        Some(b"vb".to_vec())
    );
}

#[test]
fn incarnation_wipes_previous_subtrie() {
    let harness = Harness::new();
    let account = key_of(0x77, 32);
    let slot_a = key_of(0x01, 32);
    let slot_b = key_of(0x02, 32);
    let root = harness
        .commit(
            None,
            vec![Update {
                key: account.clone(),
                value: Some(b"gen1".to_vec()),
                next: sorted(vec![
                    Update::put(slot_a.clone(), b"va".to_vec(), 1),
                    Update::put(slot_b.clone(), b"vb".to_vec(), 1),
                ]),
                version: 1,
                incarnation: false,
            }],
            1,
        )
        .expect("non-empty");

    // recreate with only slot_b; the old subtree is logically erased
    let root = harness
        .commit(
            Some(root),
            vec![Update {
                key: account.clone(),
                value: Some(b"gen2".to_vec()),
                next: vec![Update::put(slot_b.clone(), b"vb2".to_vec(), 2)],
                version: 2,
                incarnation: true,
            }],
            2,
        )
        .expect("non-empty");
    assert_eq!(harness.get(&root, &account), Some(b"gen2".to_vec()));
    assert_eq!(harness.get(&root, &account.extended(&slot_a)), None);
    assert_eq!(
        harness.get(&root, &account.extended(&slot_b)),
        Some(b"vb2".to_vec())
    );
}

#[test]
fn commit_then_read_at_each_version() {
    let harness = Harness::new();
    let key1 = key_of(0x53, 32);
    let key2 = key_of(0xBE, 32);
    let root1 = harness
        .commit(None, vec![Update::put(key1.clone(), b"30000".to_vec(), 1)], 1)
        .expect("non-empty");
    let root2 = harness
        .commit(
            Some(root1.clone()),
            vec![Update::put(key2.clone(), b"40000".to_vec(), 2)],
            2,
        )
        .expect("non-empty");

    // version 2 sees both, version 1 only the first
    assert_eq!(harness.get(&root2, &key1), Some(b"30000".to_vec()));
    assert_eq!(harness.get(&root2, &key2), Some(b"40000".to_vec()));
    assert_eq!(harness.get(&root1, &key1), Some(b"30000".to_vec()));
    assert_eq!(harness.get(&root1, &key2), None);

    // the cnv ring has a root pointer per committed block
    let pool = harness.aux.pool().unwrap();
    for version in [1u64, 2u64] {
        let entry = pool.roots().read_root(version).unwrap().expect("recorded");
        assert_eq!(entry.version, version);
        let loaded = harness.service.call({
            let aux = harness.aux.clone();
            move || aux.read_node(entry.root_offset)
        });
        let expected = if version == 1 { &root1 } else { &root2 };
        assert_eq!(loaded.encode(), expected.encode());
    }
}

#[test]
fn compaction_rewrites_everything_below_the_window() {
    let harness = Harness::new();
    let mut root = None;
    for i in 0..200u64 {
        let update = Update::put(key_of(i as u8, 32), vec![i as u8; 16], i as i64 + 1);
        root = harness.commit(root, vec![update], i + 1);
    }
    let root = root.expect("non-empty");
    let data_before = {
        use triedb::{Compute, StateMachine};
        let sm = StateTrieMachine::for_account_trie(false, false);
        sm.compute().compute(&root)
    };

    // move the fast window to the current tail: every node is below it
    let tail = harness.service.call({
        let aux = harness.aux.clone();
        let root = root.clone();
        move || {
            let offset = triedb::write_new_root_node(&aux, &root, 200);
            aux.physical_to_virtual(offset).compact()
        }
    });
    harness.aux.set_compact_offsets(tail, CompactOffset(0));

    let new_root = harness
        .commit_with(Some(root), Vec::new(), 201, true, false)
        .expect("non-empty");

    // identical content, fresh positions
    let data_after = {
        use triedb::{Compute, StateMachine};
        let sm = StateTrieMachine::for_account_trie(true, false);
        sm.compute().compute(&new_root)
    };
    assert_eq!(data_before, data_after, "compaction must not change content");
    for i in 0..200u8 {
        assert_eq!(harness.get(&new_root, &key_of(i, 32)), Some(vec![i; 16]));
    }
    for (_, _, child) in new_root.children_iter() {
        assert!(child.min_offset_fast >= tail, "child left below the window");
    }
    let stats = harness.aux.stats();
    assert!(stats.nodes_compacted_to_fast + stats.nodes_compacted_to_slow > 0);
}

#[test]
fn expiration_prunes_old_subtrees() {
    let harness = Harness::new();
    let mut root = None;
    for i in 0..100u64 {
        let update = Update::put(key_of(i as u8, 32), vec![0xEE; 8], i as i64 + 1);
        root = harness.commit(root, vec![update], i + 1);
    }
    let root = root.expect("non-empty");

    harness.aux.set_auto_expire_version(50);
    let new_root = harness
        .commit_with(Some(root), Vec::new(), 101, true, true)
        .expect("some keys survive");

    for i in 0..100u64 {
        let key = key_of(i as u8, 32);
        let found = harness.get(&new_root, &key);
        if i + 1 < 50 {
            assert_eq!(found, None, "key written at {} should be expired", i + 1);
        } else {
            assert_eq!(found, Some(vec![0xEE; 8]), "key written at {} must survive", i + 1);
        }
    }
    let stats = harness.aux.stats();
    assert!(stats.subtrees_expired > 0);
    harness.service.call({
        let aux = harness.aux.clone();
        let root = new_root.clone();
        move || check_invariants(&aux, &root, true)
    });
}

#[test]
fn expiration_wins_over_compaction_for_the_same_child() {
    let harness = Harness::new();
    let old_key = key_of(0x10, 32);
    let new_key = key_of(0x20, 32);
    let root = harness
        .commit(None, vec![Update::put(old_key.clone(), b"old".to_vec(), 1)], 1)
        .expect("non-empty");
    let root = harness
        .commit(
            Some(root),
            vec![Update::put(new_key.clone(), b"new".to_vec(), 60)],
            60,
        )
        .expect("non-empty");

    // the old child is below both the expiration horizon and a compaction
    // window that covers the whole fast ring written so far
    let tail = harness.service.call({
        let aux = harness.aux.clone();
        let root = root.clone();
        move || {
            let offset = triedb::write_new_root_node(&aux, &root, 60);
            aux.physical_to_virtual(offset).compact()
        }
    });
    harness.aux.set_auto_expire_version(50);
    harness.aux.set_compact_offsets(tail, CompactOffset(0));
    let new_root = harness
        .commit_with(Some(root), Vec::new(), 61, true, true)
        .expect("non-empty");

    assert_eq!(harness.get(&new_root, &old_key), None, "expired, not compacted");
    assert_eq!(harness.get(&new_root, &new_key), Some(b"new".to_vec()));
    let stats = harness.aux.stats();
    assert!(stats.subtrees_expired > 0);
}

#[test]
fn maintenance_pass_with_no_updates_rewrites_the_root() {
    let harness = Harness::new();
    let root = harness
        .commit(
            None,
            sorted(vec![
                Update::put(key_of(0x42, 32), b"a".to_vec(), 1),
                Update::put(key_of(0x43, 32), b"b".to_vec(), 1),
            ]),
            1,
        )
        .expect("non-empty");
    let new_root = harness
        .commit(Some(root.clone()), Vec::new(), 2)
        .expect("non-empty");
    assert_eq!(harness.get(&new_root, &key_of(0x42, 32)), Some(b"a".to_vec()));
    assert_eq!(root.mask, new_root.mask);
}

#[test]
fn load_all_pulls_cached_levels_into_memory() {
    let harness = Harness::new();
    let mut updates = Vec::new();
    for i in 0..64u8 {
        updates.push(Update::put(key_of(i, 32), vec![i; 4], 1));
    }
    let root = harness.commit(None, sorted(updates), 1).expect("non-empty");

    // drop the in-memory children, then load them back through the
    // cache predicate
    let reloaded = harness.service.call({
        let aux = harness.aux.clone();
        let root = root.clone();
        move || {
            for (_, _, child) in root.children_iter() {
                child.evict();
            }
            let mut sm = StateTrieMachine::for_account_trie(false, false);
            triedb::load_all(&aux, &mut sm, &root)
        }
    });
    assert!(reloaded > 0);
    for i in 0..64u8 {
        assert_eq!(harness.get(&root, &key_of(i, 32)), Some(vec![i; 4]));
    }
}

#[test]
fn variable_length_table_accepts_prefix_terminated_keys() {
    let harness = Harness::new();
    // one key terminates where the other two still continue
    let updates = sorted(vec![
        Update::put(Nibbles::from_nibbles(&[0x1, 0x2]), b"short".to_vec(), 1),
        Update::put(Nibbles::from_nibbles(&[0x1, 0x2, 0x3, 0x4]), b"long".to_vec(), 1),
        Update::put(Nibbles::from_nibbles(&[0x1, 0x2, 0x3, 0x5]), b"long2".to_vec(), 1),
    ]);
    let aux = harness.aux.clone();
    let root = harness
        .service
        .call(move || {
            let mut sm = triedb::VarLenTableMachine::new();
            upsert(&aux, 1, &mut sm, None, updates, true)
        })
        .expect("non-empty");
    assert_eq!(
        harness.get(&root, &Nibbles::from_nibbles(&[0x1, 0x2])),
        Some(b"short".to_vec())
    );
    assert_eq!(
        harness.get(&root, &Nibbles::from_nibbles(&[0x1, 0x2, 0x3, 0x4])),
        Some(b"long".to_vec())
    );
}

#[test]
#[should_panic(expected = "variable-length tables do not support updates")]
fn variable_length_table_rejects_reupdate() {
    let harness = Harness::new();
    let aux = harness.aux.clone();
    let root = harness
        .service
        .call({
            let aux = aux.clone();
            move || {
                let mut sm = triedb::VarLenTableMachine::new();
                upsert(
                    &aux,
                    1,
                    &mut sm,
                    None,
                    vec![Update::put(Nibbles::from_nibbles(&[0x1, 0x2]), b"a".to_vec(), 1)],
                    true,
                )
            }
        })
        .expect("non-empty");
    // tables of this kind are insert-once
    harness.service.call(move || {
        let mut sm = triedb::VarLenTableMachine::new();
        upsert(
            &aux,
            2,
            &mut sm,
            Some(root),
            vec![Update::put(
                Nibbles::from_nibbles(&[0x1, 0x2]),
                b"b".to_vec(),
                2,
            )],
            true,
        )
    });
}

#[test]
fn in_memory_engine_keeps_everything_resident() {
    let aux = UpdateAux::new_in_memory();
    let mut sm = StateTrieMachine::for_account_trie(false, false);
    let updates = sorted(vec![
        Update::put(key_of(0x21, 32), b"a".to_vec(), 1),
        Update::put(key_of(0x43, 32), b"b".to_vec(), 1),
        Update::put(key_of(0x65, 32), b"c".to_vec(), 1),
    ]);
    let root = upsert(&aux, 1, &mut sm, None, updates, false).expect("non-empty");
    for (_, _, child) in root.children_iter() {
        assert!(child.cached().is_some(), "nothing is evicted in memory");
        assert!(!child.fnext.is_valid(), "nothing is serialized in memory");
    }
    assert_eq!(find(&aux, &root, &key_of(0x43, 32)), Some(b"b".to_vec()));

    let root = upsert(
        &aux,
        2,
        &mut sm,
        Some(root),
        vec![Update::delete(key_of(0x21, 32), 2)],
        false,
    )
    .expect("non-empty");
    assert_eq!(find(&aux, &root, &key_of(0x21, 32)), None);
    assert_eq!(find(&aux, &root, &key_of(0x65, 32)), Some(b"c".to_vec()));
}
