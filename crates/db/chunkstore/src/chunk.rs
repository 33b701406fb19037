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

//! Chunk bookkeeping.

use std::{fs::File, sync::Arc};

use crate::offset::Ring;

/// The two chunk families of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFamily {
    /// Append-only node pages, on the fast or slow ring.
    Seq,
    /// The small fixed region holding pool metadata and root pointers.
    Cnv,
}

/// A chunk activated for appending: its id, the ring it was activated
/// into, separate read and write file handles, and the current append
/// cursor.
pub struct ChunkHandle {
    /// Pool-wide chunk id.
    pub id: u32,
    /// Ring the chunk belongs to; `None` for cnv chunks.
    pub ring: Option<Ring>,
    /// Read side of the extent.
    pub read: Arc<File>,
    /// Write side of the extent.
    pub write: Arc<File>,
    /// Current append cursor.
    pub cursor: u64,
}

/// Internal per-chunk state kept by the pool.
pub(crate) struct ChunkState {
    pub file: Arc<File>,
    pub ring: Option<Ring>,
    pub cursor: u64,
    /// Byte position of this chunk's start on its ring's append timeline.
    pub virtual_base: u64,
}
