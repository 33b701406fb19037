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

//! Buffered appends onto one write ring.
//!
//! Created nodes are staged into a registered write buffer checked out
//! of the engine's write pool, and are assigned their final chunk offset
//! immediately. The buffer drains to the pool when it fills or when the
//! chunk runs out, and goes back to the write pool on every flush; when
//! the pool is exhausted, acquisition blocks the writing task until
//! another flush frees a buffer. Reads of not-yet-flushed offsets are
//! served from the staged bytes.

use std::sync::Arc;

use chainstate_io::{BufferPool, PooledBuffer};
use chunkstore::{ChunkFamily, ChunkOffset, Pool, Ring};

/// Buffered appender onto one ring of the pool.
pub struct WriteBuffer {
    pool: Arc<Pool>,
    buffers: BufferPool,
    ring: Ring,
    chunk_id: Option<u32>,
    /// Chunk cursor where the staged bytes will land.
    base: u64,
    /// Registered buffer being filled; checked out of the write pool on
    /// first use, returned by every flush.
    buffer: Option<PooledBuffer>,
    /// Bytes staged in the current buffer.
    filled: usize,
}

impl WriteBuffer {
    /// A fresh appender for `ring`, drawing registered buffers from
    /// `buffers`; the first append activates a chunk.
    pub fn new(pool: Arc<Pool>, buffers: BufferPool, ring: Ring) -> WriteBuffer {
        WriteBuffer {
            pool,
            buffers,
            ring,
            chunk_id: None,
            base: 0,
            buffer: None,
            filled: 0,
        }
    }

    fn activate(&mut self) -> u32 {
        let handle = self
            .pool
            .activate_chunk(ChunkFamily::Seq, self.ring)
            .expect("Low-level database error. Some issue with your hard disk?");
        self.chunk_id = Some(handle.id);
        self.base = 0;
        handle.id
    }

    /// Append `bytes`, returning the chunk offset they will occupy. The
    /// writing task suspends while a full buffer drains or while the
    /// write pool has no free buffer.
    pub fn append(&mut self, bytes: &[u8]) -> ChunkOffset {
        debug_assert!(bytes.len() <= self.buffers.buffer_len());
        let capacity = self.pool.config().chunk_capacity;
        let mut chunk_id = match self.chunk_id {
            Some(id) => id,
            None => self.activate(),
        };
        if self.base + (self.filled + bytes.len()) as u64 > capacity {
            self.flush();
            chunk_id = self.activate();
        }
        if self.filled + bytes.len() > self.buffers.buffer_len() {
            self.flush();
        }
        if self.buffer.is_none() {
            self.buffer = Some(self.buffers.acquire());
            self.filled = 0;
        }
        let buffer = self.buffer.as_mut().expect("acquired above");
        buffer[self.filled..self.filled + bytes.len()].copy_from_slice(bytes);
        let offset = self.base + self.filled as u64;
        self.filled += bytes.len();
        ChunkOffset::new(chunk_id, offset)
    }

    /// Drain staged bytes to the pool and return the registered buffer
    /// to the write pool.
    pub fn flush(&mut self) {
        if self.filled == 0 {
            self.buffer = None;
            return;
        }
        let chunk_id = self.chunk_id.expect("staged bytes imply an active chunk");
        let buffer = self.buffer.as_ref().expect("staged bytes imply a buffer");
        let offset = self
            .pool
            .append(chunk_id, &buffer[..self.filled])
            .expect("Low-level database error. Some issue with your hard disk?");
        debug_assert_eq!(offset.offset(), self.base);
        trace!(target: "triedb", "flushed {} bytes to chunk {chunk_id} at {}", self.filled, self.base);
        self.base += self.filled as u64;
        self.filled = 0;
        self.buffer = None;
    }

    /// Durably sync the active chunk; used by the root write.
    pub fn sync(&self) {
        if let Some(chunk_id) = self.chunk_id {
            self.pool
                .sync(chunk_id)
                .expect("Low-level database error. Some issue with your hard disk?");
        }
    }

    /// Bytes currently staged.
    pub fn pending_bytes(&self) -> usize {
        self.filled
    }

    /// The offset the next append would be assigned.
    pub fn current_offset(&self) -> Option<ChunkOffset> {
        self.chunk_id
            .map(|id| ChunkOffset::new(id, self.base + self.filled as u64))
    }

    /// Serve a read out of the unflushed region, if `offset` lies in it.
    pub fn read_pending(&self, offset: ChunkOffset, len: usize) -> Option<Vec<u8>> {
        let chunk_id = self.chunk_id?;
        if offset.chunk_id() != chunk_id || offset.offset() < self.base {
            return None;
        }
        let start = (offset.offset() - self.base) as usize;
        if start + len > self.filled {
            return None;
        }
        let buffer = self.buffer.as_ref()?;
        Some(buffer[start..start + len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkstore::PoolConfig;
    use tempdir::TempDir;

    fn temp_pool() -> (TempDir, Arc<Pool>) {
        let dir = TempDir::new("write-buffer").unwrap();
        let pool = Arc::new(Pool::create(dir.path(), PoolConfig::default()).unwrap());
        (dir, pool)
    }

    #[test]
    fn offsets_are_contiguous_and_buffers_recycle() {
        let (_dir, pool) = temp_pool();
        let buffers = BufferPool::new(1, 8192);
        let mut writer = WriteBuffer::new(pool.clone(), buffers.clone(), Ring::Fast);
        let page = vec![0xAB; 4096];

        let a = writer.append(&page);
        assert_eq!(buffers.free_count(), 0, "the registered buffer is checked out");
        let b = writer.append(&page);
        // a third page overflows the 8 KiB buffer and forces a drain
        let c = writer.append(&page);
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 4096);
        assert_eq!(c.offset(), 8192);

        writer.flush();
        assert_eq!(buffers.free_count(), 1, "flush returns the buffer to the pool");
        assert_eq!(pool.read(a, 4096).unwrap(), page);
        assert_eq!(pool.read(c, 4096).unwrap(), page);
    }

    #[test]
    fn pending_reads_come_from_the_staged_buffer() {
        let (_dir, pool) = temp_pool();
        let buffers = BufferPool::new(2, 8192);
        let mut writer = WriteBuffer::new(pool, buffers, Ring::Slow);

        let offset = writer.append(b"staged bytes");
        assert_eq!(
            writer.read_pending(offset, 12),
            Some(b"staged bytes".to_vec())
        );
        writer.flush();
        // drained bytes are the pool's business now
        assert_eq!(writer.read_pending(offset, 12), None);
    }
}
