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

//! Single-threaded cooperative executor for the storage engine.
//!
//! Each engine instance owns exactly one `IoService` and with it one
//! *owning thread*: the trie update, compaction and expiration machinery
//! only ever runs on that thread, either by being called from it or by
//! being dispatched onto it. Foreign threads communicate through
//! thread-safe invocations (`dispatch`, `call`) and timed invocations
//! (`dispatch_after`). Invocations from one submitter are executed in
//! submission order.
//!
//! Buffer pools for reads and writes are fixed-size; acquisition blocks
//! the calling task until a buffer frees, which is the engine's only
//! back-pressure mechanism - there are no unbounded queues.

#[macro_use]
extern crate log;

mod buffer_pool;
mod service;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use service::{CancelHandle, IoChannel, IoService, Status};

use crate::buffer_pool::READ_BUFFER_SIZE;

/// Size of a registered read buffer: eight device pages.
pub const READ_BUFFER_LEN: usize = READ_BUFFER_SIZE;

/// Size of a registered write buffer.
pub const WRITE_BUFFER_LEN: usize = 8 * 1024 * 1024;

/// Number of read buffers registered per service.
pub const READ_BUFFER_COUNT: usize = 64;

/// Number of write buffers registered per service.
pub const WRITE_BUFFER_COUNT: usize = 4;
