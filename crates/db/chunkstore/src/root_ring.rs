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

//! The cnv root-pointer ring: one `(block_number, root_offset, version)`
//! entry per committed block, keyed by block number modulo the ring
//! capacity.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    offset::ChunkOffset,
};

const ENTRY_LEN: u64 = 32;

/// A decoded root-pointer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootEntry {
    /// Block number the root belongs to.
    pub block_number: u64,
    /// Physical position of the serialized root node, spare stamp included.
    pub root_offset: ChunkOffset,
    /// Trie version the root was written at.
    pub version: u64,
}

/// Fixed-size ring of root pointers in the cnv region.
pub struct RootRing {
    file: Mutex<File>,
    capacity: u64,
}

impl RootRing {
    pub(crate) fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<RootRing> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity * ENTRY_LEN)?;
        Ok(RootRing {
            file: Mutex::new(file),
            capacity,
        })
    }

    pub(crate) fn open<P: AsRef<Path>>(path: P, capacity: u64) -> Result<RootRing> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() != capacity * ENTRY_LEN {
            return Err(Error::Corrupt("cnv ring length mismatch".into()));
        }
        Ok(RootRing {
            file: Mutex::new(file),
            capacity,
        })
    }

    /// Record the root pointer for a block; durably synced, since the
    /// root write carries the commit's durability guarantee.
    pub fn write_root(&self, entry: RootEntry) -> Result<()> {
        let mut buffer = [0u8; ENTRY_LEN as usize];
        LittleEndian::write_u64(&mut buffer[0..8], entry.block_number);
        LittleEndian::write_u64(&mut buffer[8..16], entry.root_offset.raw());
        LittleEndian::write_u64(&mut buffer[16..24], entry.version);
        buffer[24] = 1; // occupied
        let slot = entry.block_number % self.capacity;
        let file = self.file.lock();
        file.write_all_at(&buffer, slot * ENTRY_LEN)?;
        file.sync_data()?;
        trace!(target: "chunkstore", "root for block {} at {:?}", entry.block_number, entry.root_offset);
        Ok(())
    }

    /// Read the root pointer for a block, if its slot still holds it.
    pub fn read_root(&self, block_number: u64) -> Result<Option<RootEntry>> {
        let mut buffer = [0u8; ENTRY_LEN as usize];
        let slot = block_number % self.capacity;
        {
            let file = self.file.lock();
            file.read_exact_at(&mut buffer, slot * ENTRY_LEN)?;
        }
        let stored_block = LittleEndian::read_u64(&buffer[0..8]);
        if buffer[24] == 0 || stored_block != block_number {
            return Ok(None);
        }
        Ok(Some(RootEntry {
            block_number: stored_block,
            root_offset: ChunkOffset::from_raw(LittleEndian::read_u64(&buffer[8..16])),
            version: LittleEndian::read_u64(&buffer[16..24]),
        }))
    }
}
