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

//! The storage pool: chunk allocation, the two write rings, and reads.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::{
    chunk::{ChunkFamily, ChunkHandle, ChunkState},
    error::{Error, Result},
    offset::{ChunkOffset, Ring, VirtualOffset, INVALID_VIRTUAL_OFFSET, MAX_CHUNK_ID},
    root_ring::RootRing,
    DEFAULT_CHUNK_CAPACITY, DISK_PAGE_SIZE, ROOT_RING_CAPACITY,
};

const HEADER_MAGIC: u64 = 0x43_48_4e_4b_50_4f_4f_4c; // "CHNKPOOL"
const HEADER_LEN: usize = 32;
const HEADER_FILE: &str = "pool.hdr";
const CNV_FILE: &str = "cnv.ring";

/// Pool geometry, fixed at create time and persisted in the header.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity of every sequential chunk; at least 8 MiB and a multiple
    /// of the device page.
    pub chunk_capacity: u64,
    /// Device page size.
    pub page_size: u64,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            page_size: DISK_PAGE_SIZE as u64,
        }
    }
}

struct RingState {
    /// Next virtual base handed to a chunk activated into this ring.
    next_base: u64,
}

struct PoolState {
    chunks: Vec<Option<ChunkState>>,
    free: Vec<u32>,
    fast: RingState,
    slow: RingState,
}

/// Durable append-only extent allocator. Enumerates chunks by small
/// integer ids; never rewrites a byte in place.
pub struct Pool {
    dir: PathBuf,
    config: PoolConfig,
    state: Mutex<PoolState>,
    roots: RootRing,
}

impl Pool {
    /// Create a fresh pool in `dir`, persisting the geometry header.
    pub fn create<P: AsRef<Path>>(dir: P, config: PoolConfig) -> Result<Pool> {
        let dir = dir.as_ref().to_path_buf();
        if config.chunk_capacity < 8 * 1024 * 1024 || config.chunk_capacity % config.page_size != 0
        {
            return Err(Error::Corrupt(format!(
                "bad chunk capacity {}",
                config.chunk_capacity
            )));
        }
        std::fs::create_dir_all(&dir)?;
        let mut header = [0u8; HEADER_LEN];
        LittleEndian::write_u64(&mut header[0..8], HEADER_MAGIC);
        LittleEndian::write_u64(&mut header[8..16], config.chunk_capacity);
        LittleEndian::write_u64(&mut header[16..24], config.page_size);
        LittleEndian::write_u64(&mut header[24..32], ROOT_RING_CAPACITY);
        let mut file = File::create(dir.join(HEADER_FILE))?;
        file.write_all(&header)?;
        file.sync_data()?;
        let roots = RootRing::create(dir.join(CNV_FILE), ROOT_RING_CAPACITY)?;
        debug!(target: "chunkstore", "created pool at {dir:?}, capacity {}", config.chunk_capacity);
        Ok(Pool {
            dir,
            config,
            state: Mutex::new(PoolState {
                chunks: Vec::new(),
                free: Vec::new(),
                fast: RingState { next_base: 0 },
                slow: RingState { next_base: 0 },
            }),
            roots,
        })
    }

    /// Reopen an existing pool, validating the persisted geometry.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Pool> {
        let dir = dir.as_ref().to_path_buf();
        let mut header = [0u8; HEADER_LEN];
        let mut file = File::open(dir.join(HEADER_FILE))?;
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        if LittleEndian::read_u64(&header[0..8]) != HEADER_MAGIC {
            return Err(Error::Corrupt("bad pool header magic".into()));
        }
        let config = PoolConfig {
            chunk_capacity: LittleEndian::read_u64(&header[8..16]),
            page_size: LittleEndian::read_u64(&header[16..24]),
        };
        let roots = RootRing::open(dir.join(CNV_FILE), LittleEndian::read_u64(&header[24..32]))?;
        Ok(Pool {
            dir,
            config,
            state: Mutex::new(PoolState {
                chunks: Vec::new(),
                free: Vec::new(),
                fast: RingState { next_base: 0 },
                slow: RingState { next_base: 0 },
            }),
            roots,
        })
    }

    /// Pool geometry.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The root-pointer ring of the cnv region.
    pub fn roots(&self) -> &RootRing {
        &self.roots
    }

    fn chunk_path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("seq-{id:05}.chk"))
    }

    /// Activate a chunk for appending on the given ring, reusing a free
    /// chunk when one exists. Returns read+write handles and the append
    /// cursor (always zero for a freshly activated chunk).
    pub fn activate_chunk(&self, family: ChunkFamily, ring: Ring) -> Result<ChunkHandle> {
        debug_assert!(family == ChunkFamily::Seq, "cnv region is not ring-allocated");
        let mut state = self.state.lock();
        let id = match state.free.pop() {
            Some(id) => id,
            None => {
                let id = state.chunks.len() as u32;
                if id > MAX_CHUNK_ID {
                    return Err(Error::Corrupt("chunk id space exhausted".into()));
                }
                state.chunks.push(None);
                id
            }
        };
        let file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(self.chunk_path(id))?,
        );
        let ring_state = match ring {
            Ring::Fast => &mut state.fast,
            Ring::Slow => &mut state.slow,
        };
        let virtual_base = ring_state.next_base;
        ring_state.next_base += self.config.chunk_capacity;
        state.chunks[id as usize] = Some(ChunkState {
            file: file.clone(),
            ring: Some(ring),
            cursor: 0,
            virtual_base,
        });
        trace!(target: "chunkstore", "activated chunk {id} on {ring:?} ring, base {virtual_base}");
        Ok(ChunkHandle {
            id,
            ring: Some(ring),
            read: file.clone(),
            write: file,
            cursor: 0,
        })
    }

    /// Append bytes to a chunk. Rejects appends that would cross the
    /// chunk capacity; the caller must activate a new chunk and retry.
    pub fn append(&self, chunk_id: u32, bytes: &[u8]) -> Result<ChunkOffset> {
        let mut state = self.state.lock();
        let capacity = self.config.chunk_capacity;
        let chunk = state
            .chunks
            .get_mut(chunk_id as usize)
            .and_then(|c| c.as_mut())
            .ok_or(Error::UnknownChunk(chunk_id))?;
        if chunk.cursor + bytes.len() as u64 > capacity {
            return Err(Error::ChunkFull {
                chunk_id,
                cursor: chunk.cursor,
                len: bytes.len(),
            });
        }
        let offset = chunk.cursor;
        chunk.file.write_all_at(bytes, offset)?;
        chunk.cursor += bytes.len() as u64;
        Ok(ChunkOffset::new(chunk_id, offset))
    }

    /// Read `len` bytes at the given position.
    pub fn read(&self, offset: ChunkOffset, len: usize) -> Result<Vec<u8>> {
        let file = {
            let state = self.state.lock();
            state
                .chunks
                .get(offset.chunk_id() as usize)
                .and_then(|c| c.as_ref())
                .map(|c| c.file.clone())
                .ok_or(Error::UnknownChunk(offset.chunk_id()))?
        };
        let mut buffer = vec![0u8; len];
        file.read_exact_at(&mut buffer, offset.offset())?;
        Ok(buffer)
    }

    /// Durably sync a chunk's content.
    pub fn sync(&self, chunk_id: u32) -> Result<()> {
        let file = {
            let state = self.state.lock();
            state
                .chunks
                .get(chunk_id as usize)
                .and_then(|c| c.as_ref())
                .map(|c| c.file.clone())
                .ok_or(Error::UnknownChunk(chunk_id))?
        };
        file.sync_data()?;
        Ok(())
    }

    /// Map a physical position to its virtual position on the owning
    /// ring's append timeline. Invalid or unmapped positions map to the
    /// invalid virtual offset.
    pub fn physical_to_virtual(&self, offset: ChunkOffset) -> VirtualOffset {
        if !offset.is_valid() {
            return INVALID_VIRTUAL_OFFSET;
        }
        let state = self.state.lock();
        match state
            .chunks
            .get(offset.chunk_id() as usize)
            .and_then(|c| c.as_ref())
        {
            Some(chunk) => match chunk.ring {
                Some(ring) => VirtualOffset::new(ring, chunk.virtual_base + offset.offset()),
                None => INVALID_VIRTUAL_OFFSET,
            },
            None => INVALID_VIRTUAL_OFFSET,
        }
    }

    /// Current append cursor of a chunk.
    pub fn cursor(&self, chunk_id: u32) -> Result<u64> {
        let state = self.state.lock();
        state
            .chunks
            .get(chunk_id as usize)
            .and_then(|c| c.as_ref())
            .map(|c| c.cursor)
            .ok_or(Error::UnknownChunk(chunk_id))
    }

    /// Release a chunk back to the free list once nothing references any
    /// virtual offset inside it.
    pub fn release_chunk(&self, chunk_id: u32) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state
            .chunks
            .get_mut(chunk_id as usize)
            .ok_or(Error::UnknownChunk(chunk_id))?;
        if slot.take().is_none() {
            return Err(Error::UnknownChunk(chunk_id));
        }
        let _ = std::fs::remove_file(self.chunk_path(chunk_id));
        state.free.push(chunk_id);
        trace!(target: "chunkstore", "released chunk {chunk_id}");
        Ok(())
    }

    /// Number of live chunks.
    pub fn active_chunks(&self) -> usize {
        self.state.lock().chunks.iter().filter(|c| c.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn temp_pool() -> (TempDir, Pool) {
        let dir = TempDir::new("chunkstore").unwrap();
        let pool = Pool::create(dir.path(), PoolConfig::default()).unwrap();
        (dir, pool)
    }

    #[test]
    fn append_read_round_trip() {
        let _ = env_logger::try_init();
        let (_dir, pool) = temp_pool();
        let chunk = pool.activate_chunk(ChunkFamily::Seq, Ring::Fast).unwrap();
        let offset = pool.append(chunk.id, b"hello world").unwrap();
        assert_eq!(pool.read(offset, 11).unwrap(), b"hello world");
        let second = pool.append(chunk.id, b"again").unwrap();
        assert_eq!(second.offset(), 11);
    }

    #[test]
    fn rejects_append_past_capacity() {
        let (_dir, pool) = temp_pool();
        let chunk = pool.activate_chunk(ChunkFamily::Seq, Ring::Fast).unwrap();
        let big = vec![0u8; DEFAULT_CHUNK_CAPACITY as usize - 4];
        pool.append(chunk.id, &big).unwrap();
        match pool.append(chunk.id, &[0u8; 8]) {
            Err(Error::ChunkFull { chunk_id, .. }) => assert_eq!(chunk_id, chunk.id),
            other => panic!("expected ChunkFull, got {other:?}"),
        }
    }

    #[test]
    fn virtual_offsets_grow_per_ring() {
        let (_dir, pool) = temp_pool();
        let fast_a = pool.activate_chunk(ChunkFamily::Seq, Ring::Fast).unwrap();
        let fast_b = pool.activate_chunk(ChunkFamily::Seq, Ring::Fast).unwrap();
        let slow = pool.activate_chunk(ChunkFamily::Seq, Ring::Slow).unwrap();
        let a = pool.append(fast_a.id, b"a").unwrap();
        let b = pool.append(fast_b.id, b"b").unwrap();
        let c = pool.append(slow.id, b"c").unwrap();
        let va = pool.physical_to_virtual(a);
        let vb = pool.physical_to_virtual(b);
        let vc = pool.physical_to_virtual(c);
        assert!(va.in_fast_ring() && vb.in_fast_ring());
        assert!(va.position() < vb.position());
        assert!(!vc.in_fast_ring());
        assert_eq!(vc.position(), 0);
    }

    #[test]
    fn released_chunks_are_reused() {
        let (_dir, pool) = temp_pool();
        let chunk = pool.activate_chunk(ChunkFamily::Seq, Ring::Fast).unwrap();
        pool.release_chunk(chunk.id).unwrap();
        let next = pool.activate_chunk(ChunkFamily::Seq, Ring::Slow).unwrap();
        assert_eq!(next.id, chunk.id);
        assert_eq!(pool.active_chunks(), 1);
    }
}
