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

//! Block staging and EVM-host behavior over a real database.

use std::sync::Arc;

use account_cache::AccountStorageCache;
use chainstate_core::{
    block_hash::history_contract_address, reserve::default_reserve_balance, AccessStatus,
    BlockHashBuffer, BlockState, ChainConfig, Db, DbConfig, PrecompileError,
    ReserveBalanceContract, State, StorageStatus,
};
use chainstate_types::{Account, Incarnation};
use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;
use tempdir::TempDir;

struct Harness {
    _dir: TempDir,
    db: Arc<Db>,
    cache: Arc<AccountStorageCache<Account>>,
}

impl Harness {
    fn new() -> Harness {
        let _ = env_logger::try_init();
        let dir = TempDir::new("chainstate").unwrap();
        let db = Arc::new(Db::create(dir.path(), DbConfig::default()).unwrap());
        Harness {
            _dir: dir,
            db,
            cache: Arc::new(AccountStorageCache::new(1024, 4096)),
        }
    }

    fn block(&self, block_number: u64, round: u64) -> BlockState {
        self.block_with_config(block_number, round, ChainConfig::default())
    }

    fn block_with_config(&self, block_number: u64, round: u64, config: ChainConfig) -> BlockState {
        let parent_root = self.db.latest_finalized_root();
        BlockState::new(
            self.db.clone(),
            self.cache.clone(),
            config,
            parent_root,
            block_number,
            round,
        )
    }

    fn state<'a>(&self, block: &'a BlockState, tx_index: u32) -> State<'a> {
        State::new(
            block,
            Arc::new(BlockHashBuffer::default().finalized()),
            Incarnation::new(block.block_number(), tx_index),
        )
    }
}

fn address(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

fn slot(byte: u8) -> H256 {
    H256::repeat_byte(byte)
}

#[test]
fn commit_then_read_across_versions() {
    let harness = Harness::new();

    // block 1: one account
    let block = harness.block(1, 1);
    let mut tx = harness.state(&block, 0);
    tx.add_to_balance(&address(0x53), U256::from(30_000u64));
    assert!(block.can_merge(&tx));
    block.merge(tx);
    block.commit().expect("non-empty state");
    block.finalize();

    // block 2: a second account with one storage slot
    let block = harness.block(2, 2);
    let mut tx = harness.state(&block, 0);
    tx.add_to_balance(&address(0xBE), U256::from(40_000u64));
    let status = tx.set_storage(&address(0xBE), &slot(0x01), slot(0xF1));
    assert_eq!(status, StorageStatus::Added);
    block.merge(tx);
    block.commit().expect("non-empty state");
    block.finalize();

    let root1 = harness.db.committed_root(1).expect("block 1 recorded");
    let root2 = harness.db.committed_root(2).expect("block 2 recorded");

    // version 2 sees both accounts, version 1 only the first
    let at2 = harness.db.read_account(&root2, &address(0x53)).unwrap();
    assert_eq!(at2.balance, U256::from(30_000u64));
    let at2 = harness.db.read_account(&root2, &address(0xBE)).unwrap();
    assert_eq!(at2.balance, U256::from(40_000u64));
    assert_eq!(
        harness.db.read_storage(&root2, &address(0xBE), &slot(0x01)),
        slot(0xF1)
    );

    let at1 = harness.db.read_account(&root1, &address(0x53)).unwrap();
    assert_eq!(at1.balance, U256::from(30_000u64));
    assert!(harness.db.read_account(&root1, &address(0xBE)).is_none());
}

#[test]
fn balance_and_storage_round_trips() {
    let harness = Harness::new();
    let block = harness.block(1, 1);
    let mut tx = harness.state(&block, 0);

    tx.add_to_balance(&address(0xAA), U256::from(7u64));
    tx.set_balance(&address(0xAA), U256::from(55u64));
    assert_eq!(tx.get_balance(&address(0xAA)), U256::from(55u64));

    let _ = tx.set_storage(&address(0xAA), &slot(0x02), slot(0x77));
    assert_eq!(tx.get_storage(&address(0xAA), &slot(0x02)), slot(0x77));

    // access classification
    assert_eq!(tx.access_account(&address(0xCC)), AccessStatus::Cold);
    assert_eq!(tx.access_account(&address(0xCC)), AccessStatus::Warm);
    assert_eq!(
        tx.access_storage(&address(0xAA), &slot(0x02)),
        AccessStatus::Cold
    );
    assert_eq!(
        tx.access_storage(&address(0xAA), &slot(0x02)),
        AccessStatus::Warm
    );
}

#[test]
fn storage_status_taxonomy() {
    let harness = Harness::new();

    // commit an account with one nonzero slot as the original state
    let block = harness.block(1, 1);
    let mut tx = harness.state(&block, 0);
    tx.add_to_balance(&address(0x11), U256::one());
    let _ = tx.set_storage(&address(0x11), &slot(0x01), slot(0x10));
    block.merge(tx);
    block.commit().unwrap();
    block.finalize();

    let block = harness.block(2, 2);
    let mut tx = harness.state(&block, 0);
    let a = address(0x11);
    let key = slot(0x01);
    let original = slot(0x10);

    // original = 0x10, current = 0x10
    assert_eq!(tx.set_storage(&a, &key, original), StorageStatus::Assigned);
    assert_eq!(tx.set_storage(&a, &key, slot(0x20)), StorageStatus::Modified);
    assert_eq!(
        tx.set_storage(&a, &key, original),
        StorageStatus::ModifiedRestored
    );
    assert_eq!(tx.set_storage(&a, &key, H256::zero()), StorageStatus::Deleted);
    assert_eq!(
        tx.set_storage(&a, &key, original),
        StorageStatus::DeletedRestored
    );
    assert_eq!(tx.set_storage(&a, &key, H256::zero()), StorageStatus::Deleted);
    assert_eq!(
        tx.set_storage(&a, &key, slot(0x30)),
        StorageStatus::DeletedAdded
    );
    assert_eq!(
        tx.set_storage(&a, &key, H256::zero()),
        StorageStatus::ModifiedDeleted
    );

    // a fresh slot: added, then added-deleted
    let fresh = slot(0x02);
    assert_eq!(tx.set_storage(&a, &fresh, slot(0x01)), StorageStatus::Added);
    assert_eq!(
        tx.set_storage(&a, &fresh, H256::zero()),
        StorageStatus::AddedDeleted
    );
}

#[test]
fn conflicting_speculative_transactions_do_not_merge() {
    let harness = Harness::new();
    let block = harness.block(1, 1);
    {
        let mut setup = harness.state(&block, 0);
        setup.add_to_balance(&address(0x11), U256::from(100u64));
        let _ = setup.set_storage(&address(0x11), &slot(0x01), slot(0x10));
        block.merge(setup);
    }
    block.commit().unwrap();
    block.finalize();

    let block = harness.block(2, 2);

    // two speculative transactions observe the same slot
    let mut tx_a = harness.state(&block, 0);
    let _ = tx_a.get_storage(&address(0x11), &slot(0x01));
    let _ = tx_a.set_storage(&address(0x11), &slot(0x01), slot(0x20));

    let mut tx_b = harness.state(&block, 1);
    let _ = tx_b.get_storage(&address(0x11), &slot(0x01));

    // a third touches a different address entirely
    let mut tx_c = harness.state(&block, 2);
    tx_c.add_to_balance(&address(0x22), U256::one());

    assert!(block.can_merge(&tx_a));
    block.merge(tx_a);

    // b observed the pre-write value of a slot a changed
    assert!(!block.can_merge(&tx_b));
    // account-only changes on a different address never conflict
    assert!(block.can_merge(&tx_c));
}

#[test]
fn selfdestruct_semantics_across_revisions() {
    // pre-Cancun: the account disappears
    let harness = Harness::new();
    let setup = harness.block(1, 1);
    {
        let mut tx = harness.state(&setup, 0);
        tx.add_to_balance(&address(0x11), U256::from(10u64));
        let _ = tx.set_storage(&address(0x11), &slot(0x01), slot(0xAA));
        setup.merge(tx);
    }
    setup.commit().unwrap();
    setup.finalize();

    let block = harness.block_with_config(
        2,
        2,
        ChainConfig {
            cancun: false,
            history_contract: false,
        },
    );
    let mut tx = harness.state(&block, 0);
    assert!(tx.selfdestruct(&address(0x11), &address(0x22)));
    tx.destruct_suicides(false);
    assert!(!tx.account_exists(&address(0x11)));
    assert_eq!(tx.get_balance(&address(0x22)), U256::from(10u64));

    // Cancun, separate transaction: account survives with zero balance
    let harness = Harness::new();
    let setup = harness.block(1, 1);
    {
        let mut tx = harness.state(&setup, 0);
        tx.add_to_balance(&address(0x11), U256::from(10u64));
        setup.merge(tx);
    }
    setup.commit().unwrap();
    setup.finalize();

    let block = harness.block(2, 2);
    let mut tx = harness.state(&block, 0);
    assert!(tx.selfdestruct(&address(0x11), &address(0x22)));
    tx.destruct_suicides(true);
    assert!(tx.account_exists(&address(0x11)));
    assert_eq!(tx.get_balance(&address(0x11)), U256::zero());

    // Cancun, created in the same transaction: removed like pre-Cancun
    let mut tx = harness.state(&block, 1);
    tx.add_to_balance(&address(0x33), U256::from(5u64));
    tx.create_contract(&address(0x33));
    assert!(tx.selfdestruct(&address(0x33), &address(0x22)));
    tx.destruct_suicides(true);
    assert!(!tx.account_exists(&address(0x33)));
}

#[test]
fn selfdestruct_and_recreate_wipes_storage() {
    let harness = Harness::new();
    let setup = harness.block(1, 1);
    {
        let mut tx = harness.state(&setup, 0);
        tx.add_to_balance(&address(0x11), U256::from(10u64));
        let _ = tx.set_storage(&address(0x11), &slot(0x01), slot(0xAA));
        setup.merge(tx);
    }
    setup.commit().unwrap();
    setup.finalize();

    let block = harness.block(2, 2);
    let mut tx = harness.state(&block, 0);
    assert!(tx.selfdestruct(&address(0x11), &address(0x11)));
    tx.destruct_suicides(true);
    tx.create_contract(&address(0x11));
    // the recreated incarnation reads zero for the old slot
    assert_eq!(tx.get_storage(&address(0x11), &slot(0x01)), H256::zero());
    block.merge(tx);
    block.commit().unwrap();
    block.finalize();

    // and the committed trie has empty storage under the account
    let root = harness.db.committed_root(2).unwrap();
    assert_eq!(
        harness.db.read_storage(&root, &address(0x11), &slot(0x01)),
        H256::zero()
    );
    assert!(harness.db.read_account(&root, &address(0x11)).is_some());
}

#[test]
fn touched_dead_accounts_are_removed() {
    let harness = Harness::new();
    let block = harness.block(1, 1);
    let mut tx = harness.state(&block, 0);
    tx.add_to_balance(&address(0x11), U256::zero());
    assert!(tx.account_exists(&address(0x11)));
    tx.destruct_touched_dead();
    assert!(!tx.account_exists(&address(0x11)));
}

#[test]
fn blockhash_consults_history_contract_then_buffer() {
    let harness = Harness::new();

    let mut buffer = BlockHashBuffer::default();
    for i in 0..256u64 {
        buffer.set(i, slot(0xBB));
    }
    let buffer = Arc::new(buffer.finalized());

    // before the history contract is live, everything is buffer-served
    let block = harness.block_with_config(
        256,
        1,
        ChainConfig {
            cancun: true,
            history_contract: false,
        },
    );
    let mut tx = State::new(&block, buffer.clone(), Incarnation::new(256, 0));
    for i in 0..128u64 {
        // populated history is ignored while the contract is disabled
        let _ = tx.set_storage(
            &history_contract_address(),
            &H256::from_low_u64_be(i),
            slot(0xAA),
        );
    }
    for i in 0..256u64 {
        assert_eq!(tx.get_block_hash(i), slot(0xBB));
    }

    // with the contract enabled, populated heights win
    let block = harness.block(256, 2);
    let mut tx = State::new(&block, buffer.clone(), Incarnation::new(256, 0));
    for i in 0..128u64 {
        let _ = tx.set_storage(
            &history_contract_address(),
            &H256::from_low_u64_be(i),
            slot(0xAA),
        );
    }
    for i in 0..256u64 {
        let expected = if i < 128 { slot(0xAA) } else { slot(0xBB) };
        assert_eq!(tx.get_block_hash(i), expected, "height {i}");
    }

    // filling the rest makes every height history-served
    for i in 128..256u64 {
        let _ = tx.set_storage(
            &history_contract_address(),
            &H256::from_low_u64_be(i),
            slot(0xAA),
        );
    }
    for i in 0..256u64 {
        assert_eq!(tx.get_block_hash(i), slot(0xAA));
    }
}

#[test]
fn reserve_balance_precompile() {
    let harness = Harness::new();
    let block = harness.block(1, 1);
    let mut tx = harness.state(&block, 0);
    let sender = address(0xA1);

    let digest = keccak("update(uint256)".as_bytes());
    let selector = &digest.as_bytes()[0..4];
    let mut input = Vec::from(selector);
    let mut arg = [0u8; 32];
    U256::from(123u64).to_big_endian(&mut arg);
    input.extend_from_slice(&arg);

    // a nonzero call value is rejected outright
    assert_eq!(
        ReserveBalanceContract::execute(&mut tx, &sender, U256::one(), &input),
        Err(PrecompileError("value non-zero"))
    );

    // unknown selectors are rejected
    let mut bogus = input.clone();
    bogus[0] ^= 0xFF;
    assert_eq!(
        ReserveBalanceContract::execute(&mut tx, &sender, U256::zero(), &bogus),
        Err(PrecompileError("method not supported"))
    );

    // the first update succeeds and reports the delayed (default) value
    let out = ReserveBalanceContract::execute(&mut tx, &sender, U256::zero(), &input).unwrap();
    assert_eq!(U256::from_big_endian(&out), default_reserve_balance());

    // the update is not visible through the delayed view yet
    assert_eq!(
        ReserveBalanceContract::get_delayed_urb(&harness.db, &sender),
        default_reserve_balance()
    );

    // a second update while the first is pending rejects
    let mut zero_arg = Vec::from(selector);
    zero_arg.extend_from_slice(&[0u8; 32]);
    assert_eq!(
        ReserveBalanceContract::execute(&mut tx, &sender, U256::zero(), &zero_arg),
        Err(PrecompileError("pending update"))
    );

    // once the block finalizes, the delayed view serves the new value
    block.merge(tx);
    block.commit().unwrap();
    block.finalize();
    assert_eq!(
        ReserveBalanceContract::get_delayed_urb(&harness.db, &sender),
        U256::from(123u64)
    );
}

#[test]
fn commit_reflects_into_shared_cache_on_finalize() {
    let harness = Harness::new();
    let block = harness.block(1, 1);
    let mut tx = harness.state(&block, 0);
    tx.add_to_balance(&address(0x42), U256::from(9u64));
    block.merge(tx);
    block.commit().unwrap();
    block.finalize();

    let cached = harness.cache.get_account(&address(0x42)).flatten().unwrap();
    assert_eq!(cached.balance, U256::from(9u64));
}

#[test]
fn logs_and_gas_award_accumulate() {
    let harness = Harness::new();
    let block = harness.block(1, 1);
    let mut tx = harness.state(&block, 0);

    tx.store_log(chainstate_types::LogEntry {
        address: address(0x11),
        topics: vec![slot(0x01)],
        data: b"payload".to_vec(),
    });
    tx.add_txn_award(U256::from(21_000u64));
    tx.add_txn_award(U256::from(1_000u64));
    assert_eq!(tx.gas_award(), U256::from(22_000u64));

    let logs = tx.take_logs();
    assert_eq!(logs.len(), 1);
    let receipt = chainstate_types::Receipt::new(true, U256::from(21_000u64), logs);
    assert_eq!(receipt.logs[0].address, address(0x11));

    // rewards create the recipient when needed
    tx.apply_reward(&address(0xFE), U256::from(5u64));
    assert_eq!(tx.get_balance(&address(0xFE)), U256::from(5u64));
}

#[test]
fn code_round_trips_through_commit() {
    let harness = Harness::new();
    let block = harness.block(1, 1);
    let mut tx = harness.state(&block, 0);
    let code = vec![0x60, 0x80, 0x60, 0x40, 0x52];

    tx.add_to_balance(&address(0xC0), U256::one());
    tx.set_code(&address(0xC0), code.clone());
    assert_eq!(tx.get_code(&address(0xC0)), code);
    assert_eq!(tx.get_code_size(&address(0xC0)), code.len());
    let mut buffer = [0u8; 3];
    assert_eq!(tx.copy_code(&address(0xC0), 2, &mut buffer), 3);
    assert_eq!(&buffer, &code[2..5]);

    block.merge(tx);
    block.commit().unwrap();
    block.finalize();

    // a later block reads the body back by hash through the code table
    let block = harness.block(2, 2);
    let mut tx = harness.state(&block, 0);
    assert_eq!(tx.get_code(&address(0xC0)), code);
    assert_eq!(
        tx.get_code_hash(&address(0xC0)),
        keccak_hash::keccak(&code)
    );
}
