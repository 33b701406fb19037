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

//! Storage pool errors.

use std::{fmt, io};

/// Storage pool errors.
#[derive(Debug)]
pub enum Error {
    /// Underlying file I/O failure.
    Io(io::Error),
    /// An append would run past the chunk capacity; the caller must
    /// activate a fresh chunk.
    ChunkFull {
        /// Chunk the append was attempted on.
        chunk_id: u32,
        /// Write cursor at the time of the attempt.
        cursor: u64,
        /// Length of the rejected append.
        len: usize,
    },
    /// The chunk id does not name an active chunk.
    UnknownChunk(u32),
    /// The pool header or cnv region does not parse.
    Corrupt(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref err) => write!(f, "I/O error: {err}"),
            Error::ChunkFull {
                chunk_id,
                cursor,
                len,
            } => write!(
                f,
                "chunk {chunk_id} full: cursor {cursor} cannot take {len} more bytes"
            ),
            Error::UnknownChunk(id) => write!(f, "unknown chunk {id}"),
            Error::Corrupt(ref msg) => write!(f, "pool corrupt: {msg}"),
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;
