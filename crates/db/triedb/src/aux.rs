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

//! Shared context of an upsert pass: the storage pool, the two write
//! buffers, the maintenance windows and statistics.

use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering as AtomicOrdering},
    Arc,
};

use chainstate_io::{
    BufferPool, IoChannel, READ_BUFFER_COUNT, READ_BUFFER_LEN, WRITE_BUFFER_COUNT,
    WRITE_BUFFER_LEN,
};
use chunkstore::{
    ChunkOffset, CompactOffset, Pool, Ring, VirtualOffset, INVALID_VIRTUAL_OFFSET,
};
use parking_lot::{Mutex, ReentrantMutex};

use crate::{node::Node, node::SharedNode, write_buffer::WriteBuffer};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct UpdateAuxConfig {
    /// Alternate fast/slow destination between node writes; exercised by
    /// tests that interleave the rings.
    pub alternate_slow_fast_writer: bool,
}

impl Default for UpdateAuxConfig {
    fn default() -> UpdateAuxConfig {
        UpdateAuxConfig {
            alternate_slow_fast_writer: false,
        }
    }
}

/// Counters recorded across one upsert pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateStats {
    /// Nodes created by the pass.
    pub nodes_created: u64,
    /// Nodes rewritten to the fast ring by compaction.
    pub nodes_compacted_to_fast: u64,
    /// Nodes rewritten to the slow ring by compaction.
    pub nodes_compacted_to_slow: u64,
    /// Node reads issued by compaction.
    pub compaction_reads: u64,
    /// Bytes fetched by compaction reads.
    pub compaction_bytes_read: u64,
    /// Subtrees pruned by expiration.
    pub subtrees_expired: u64,
    /// Node reads issued by expiration.
    pub expire_reads: u64,
}

#[derive(Default)]
struct StatsCells {
    nodes_created: AtomicU64,
    nodes_compacted_to_fast: AtomicU64,
    nodes_compacted_to_slow: AtomicU64,
    compaction_reads: AtomicU64,
    compaction_bytes_read: AtomicU64,
    subtrees_expired: AtomicU64,
    expire_reads: AtomicU64,
}

/// Shared context threaded through the update, compaction and expiration
/// recursion. One instance per storage engine; a single writer runs at a
/// time, enforced by a re-entrant writer lock so that nested
/// storage-subtrie upserts from the owning thread may re-enter.
pub struct UpdateAux {
    pool: Option<Arc<Pool>>,
    io: Option<IoChannel>,
    read_buffers: BufferPool,
    /// Registered write buffers; both ring appenders draw from it and
    /// block while it is exhausted.
    write_buffers: BufferPool,
    write_fast: Mutex<Option<WriteBuffer>>,
    write_slow: Mutex<Option<WriteBuffer>>,
    writer: ReentrantMutex<()>,
    /// Children whose fast-ring minimum falls below this are rewritten.
    compact_offset_fast: AtomicU32,
    /// Children whose slow-ring minimum falls below this are rewritten.
    compact_offset_slow: AtomicU32,
    /// Subtrees entirely below this version are pruned.
    auto_expire_version: AtomicI64,
    can_write_to_fast: AtomicBool,
    config: UpdateAuxConfig,
    stats: StatsCells,
}

impl UpdateAux {
    /// An on-disk engine over `pool`. The `io` channel names the owning
    /// thread all upserts must run on.
    pub fn new(pool: Arc<Pool>, io: IoChannel, config: UpdateAuxConfig) -> UpdateAux {
        let write_buffers = BufferPool::new(WRITE_BUFFER_COUNT, WRITE_BUFFER_LEN);
        UpdateAux {
            write_fast: Mutex::new(Some(WriteBuffer::new(
                pool.clone(),
                write_buffers.clone(),
                Ring::Fast,
            ))),
            write_slow: Mutex::new(Some(WriteBuffer::new(
                pool.clone(),
                write_buffers.clone(),
                Ring::Slow,
            ))),
            pool: Some(pool),
            io: Some(io),
            read_buffers: BufferPool::new(READ_BUFFER_COUNT, READ_BUFFER_LEN),
            write_buffers,
            writer: ReentrantMutex::new(()),
            compact_offset_fast: AtomicU32::new(0),
            compact_offset_slow: AtomicU32::new(0),
            auto_expire_version: AtomicI64::new(i64::MIN),
            can_write_to_fast: AtomicBool::new(true),
            config,
            stats: StatsCells::default(),
        }
    }

    /// A purely in-memory engine; nothing is serialized and every child
    /// pointer stays resident. Used by staging tries and tests.
    pub fn new_in_memory() -> UpdateAux {
        UpdateAux {
            pool: None,
            io: None,
            read_buffers: BufferPool::new(1, READ_BUFFER_LEN),
            // never drawn from; nothing is serialized in memory
            write_buffers: BufferPool::new(0, WRITE_BUFFER_LEN),
            write_fast: Mutex::new(None),
            write_slow: Mutex::new(None),
            writer: ReentrantMutex::new(()),
            compact_offset_fast: AtomicU32::new(0),
            compact_offset_slow: AtomicU32::new(0),
            auto_expire_version: AtomicI64::new(i64::MIN),
            can_write_to_fast: AtomicBool::new(true),
            config: UpdateAuxConfig::default(),
            stats: StatsCells::default(),
        }
    }

    /// Whether nodes are serialized to a pool.
    pub fn is_on_disk(&self) -> bool {
        self.pool.is_some()
    }

    /// The backing pool of an on-disk engine.
    pub fn pool(&self) -> Option<&Arc<Pool>> {
        self.pool.as_ref()
    }

    /// The registered write buffers; every full-buffer drain returns its
    /// buffer here.
    pub fn write_buffer_pool(&self) -> &BufferPool {
        &self.write_buffers
    }

    /// Panic unless running on the engine's owning thread.
    pub fn assert_owning_thread(&self) {
        if let Some(ref io) = self.io {
            assert!(
                io.is_owning_thread(),
                "storage engine invoked off its owning thread"
            );
        }
    }

    /// The re-entrant writer lock serializing upserts.
    pub(crate) fn writer_lock(&self) -> parking_lot::ReentrantMutexGuard<'_, ()> {
        self.writer.lock()
    }

    /// Fast-ring compaction threshold.
    pub fn compact_offset_fast(&self) -> CompactOffset {
        CompactOffset(self.compact_offset_fast.load(AtomicOrdering::Acquire))
    }

    /// Slow-ring compaction threshold.
    pub fn compact_offset_slow(&self) -> CompactOffset {
        CompactOffset(self.compact_offset_slow.load(AtomicOrdering::Acquire))
    }

    /// Move the compaction window; children whose minimum offsets fall
    /// below are rewritten during the next pass.
    pub fn set_compact_offsets(&self, fast: CompactOffset, slow: CompactOffset) {
        self.compact_offset_fast.store(fast.0, AtomicOrdering::Release);
        self.compact_offset_slow.store(slow.0, AtomicOrdering::Release);
    }

    /// Version horizon below which subtrees are pruned.
    pub fn auto_expire_version(&self) -> i64 {
        self.auto_expire_version.load(AtomicOrdering::Acquire)
    }

    /// Move the expiration horizon.
    pub fn set_auto_expire_version(&self, version: i64) {
        self.auto_expire_version
            .store(version, AtomicOrdering::Release);
    }

    /// Map a physical position to the ring timeline.
    pub fn physical_to_virtual(&self, offset: ChunkOffset) -> VirtualOffset {
        match self.pool {
            Some(ref pool) => pool.physical_to_virtual(offset.without_spare()),
            None => INVALID_VIRTUAL_OFFSET,
        }
    }

    /// Read and decode the node at `offset`, serving unflushed positions
    /// out of the write buffers. A failed read of a referenced page means
    /// on-disk corruption and is fatal.
    pub fn read_node(&self, offset: ChunkOffset) -> SharedNode {
        debug_assert!(offset.is_valid());
        let pages = offset.spare_pages();
        let len = pages as usize * chunkstore::DISK_PAGE_SIZE;
        let position = offset.without_spare();
        if let Some(bytes) = self
            .write_fast
            .lock()
            .as_ref()
            .and_then(|buffer| buffer.read_pending(position, len))
        {
            return Arc::new(Node::decode(&bytes));
        }
        if let Some(bytes) = self
            .write_slow
            .lock()
            .as_ref()
            .and_then(|buffer| buffer.read_pending(position, len))
        {
            return Arc::new(Node::decode(&bytes));
        }
        let pool = self
            .pool
            .as_ref()
            .expect("reads by offset only happen on on-disk engines");
        let mut buffer = self.read_buffers.acquire();
        let bytes = pool
            .read(position, len)
            .expect("Low-level database error. Some issue with your hard disk?");
        buffer[..len].copy_from_slice(&bytes);
        Arc::new(Node::decode(&buffer[..len]))
    }

    /// Serialize `node` into a ring buffer, returning its stamped offset.
    pub fn write_node(&self, node: &Node, to_fast: bool) -> ChunkOffset {
        let to_fast = to_fast && self.can_write_to_fast.load(AtomicOrdering::Relaxed);
        if self.config.alternate_slow_fast_writer {
            self.can_write_to_fast
                .fetch_xor(true, AtomicOrdering::Relaxed);
        }
        let bytes = node.encode();
        let pages = node.disk_pages();
        let offset = if to_fast {
            self.write_fast
                .lock()
                .as_mut()
                .expect("writes only happen on on-disk engines")
                .append(&bytes)
        } else {
            self.write_slow
                .lock()
                .as_mut()
                .expect("writes only happen on on-disk engines")
                .append(&bytes)
        };
        offset.with_spare_pages(pages)
    }

    /// Drain both write buffers to the pool.
    pub fn flush_writes(&self) {
        if let Some(fast) = self.write_fast.lock().as_mut() {
            fast.flush();
        }
        if let Some(slow) = self.write_slow.lock().as_mut() {
            if slow.pending_bytes() > 0 {
                slow.flush();
            }
        }
    }

    /// Drain and durably sync both rings; the root write's guarantee.
    pub fn flush_writes_durable(&self) {
        if let Some(fast) = self.write_fast.lock().as_mut() {
            fast.flush();
            fast.sync();
        }
        if let Some(slow) = self.write_slow.lock().as_mut() {
            if slow.pending_bytes() > 0 {
                slow.flush();
            }
            slow.sync();
        }
    }

    /// Reset per-pass statistics.
    pub fn reset_stats(&self) {
        self.stats.nodes_created.store(0, AtomicOrdering::Relaxed);
        self.stats
            .nodes_compacted_to_fast
            .store(0, AtomicOrdering::Relaxed);
        self.stats
            .nodes_compacted_to_slow
            .store(0, AtomicOrdering::Relaxed);
        self.stats.compaction_reads.store(0, AtomicOrdering::Relaxed);
        self.stats
            .compaction_bytes_read
            .store(0, AtomicOrdering::Relaxed);
        self.stats.subtrees_expired.store(0, AtomicOrdering::Relaxed);
        self.stats.expire_reads.store(0, AtomicOrdering::Relaxed);
    }

    /// Snapshot of the per-pass statistics.
    pub fn stats(&self) -> UpdateStats {
        UpdateStats {
            nodes_created: self.stats.nodes_created.load(AtomicOrdering::Relaxed),
            nodes_compacted_to_fast: self
                .stats
                .nodes_compacted_to_fast
                .load(AtomicOrdering::Relaxed),
            nodes_compacted_to_slow: self
                .stats
                .nodes_compacted_to_slow
                .load(AtomicOrdering::Relaxed),
            compaction_reads: self.stats.compaction_reads.load(AtomicOrdering::Relaxed),
            compaction_bytes_read: self
                .stats
                .compaction_bytes_read
                .load(AtomicOrdering::Relaxed),
            subtrees_expired: self.stats.subtrees_expired.load(AtomicOrdering::Relaxed),
            expire_reads: self.stats.expire_reads.load(AtomicOrdering::Relaxed),
        }
    }

    pub(crate) fn note_node_created(&self) {
        self.stats
            .nodes_created
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn note_compaction_read(&self, bytes: u64) {
        self.stats
            .compaction_reads
            .fetch_add(1, AtomicOrdering::Relaxed);
        self.stats
            .compaction_bytes_read
            .fetch_add(bytes, AtomicOrdering::Relaxed);
    }

    pub(crate) fn note_compacted(&self, to_fast: bool) {
        if to_fast {
            self.stats
                .nodes_compacted_to_fast
                .fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.stats
                .nodes_compacted_to_slow
                .fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    pub(crate) fn note_expire_read(&self) {
        self.stats.expire_reads.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn note_subtree_expired(&self) {
        self.stats
            .subtrees_expired
            .fetch_add(1, AtomicOrdering::Relaxed);
    }
}
