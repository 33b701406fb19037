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

//! Durable append-only extent allocator over files.
//!
//! The pool hands out *chunks*: contiguous extents with a fixed capacity and
//! a monotonically growing write cursor. Sequential chunks belong to one of
//! two write rings - the *fast* ring holds recent writes, the *slow* ring
//! holds compacted older data. A small *cnv* region records pool metadata
//! and one root pointer per committed block.
//!
//! Chunks are never rewritten in place. Compaction produces new chunks and
//! eventually releases old ones back to the free list once nothing
//! references them.

#[macro_use]
extern crate log;

mod chunk;
mod error;
mod offset;
mod pool;
mod root_ring;

pub use chunk::{ChunkFamily, ChunkHandle};
pub use error::{Error, Result};
pub use offset::{
    ChunkOffset, CompactOffset, Ring, VirtualOffset, INVALID_COMPACT_OFFSET, INVALID_OFFSET,
    INVALID_VIRTUAL_OFFSET,
};
pub use pool::{Pool, PoolConfig};
pub use root_ring::{RootEntry, RootRing};

/// Power-of-two size of a device page.
pub const DISK_PAGE_BITS: u32 = 12;

/// Size of a device page in bytes.
pub const DISK_PAGE_SIZE: usize = 1 << DISK_PAGE_BITS;

/// Default capacity of a sequential chunk. Must be at least 8 MiB and a
/// multiple of the device page.
pub const DEFAULT_CHUNK_CAPACITY: u64 = 16 * 1024 * 1024;

/// Number of root-pointer entries held in the cnv ring.
pub const ROOT_RING_CAPACITY: u64 = 4096;
