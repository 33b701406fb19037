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

//! Registered buffer pools.
//!
//! Two pools exist per engine instance: read buffers of eight device
//! pages, and large write buffers. When a pool is exhausted, `acquire`
//! blocks the calling task until another task returns a buffer.

use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use parking_lot::{Condvar, Mutex};

/// Eight device pages.
pub(crate) const READ_BUFFER_SIZE: usize = 8 * 4096;

struct Shared {
    free: Mutex<Vec<Vec<u8>>>,
    available: Condvar,
    buffer_len: usize,
}

/// A fixed-size pool of equally sized byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    /// Create a pool of `count` buffers of `len` bytes each.
    pub fn new(count: usize, len: usize) -> BufferPool {
        BufferPool {
            shared: Arc::new(Shared {
                free: Mutex::new((0..count).map(|_| vec![0u8; len]).collect()),
                available: Condvar::new(),
                buffer_len: len,
            }),
        }
    }

    /// Take a buffer, blocking the calling task until one frees.
    pub fn acquire(&self) -> PooledBuffer {
        let mut free = self.shared.free.lock();
        while free.is_empty() {
            trace!(target: "io", "buffer pool exhausted, suspending");
            self.shared.available.wait(&mut free);
        }
        let buffer = free.pop().expect("guarded by loop above");
        PooledBuffer {
            pool: self.shared.clone(),
            buffer: Some(buffer),
        }
    }

    /// Take a buffer if one is free right now.
    pub fn try_acquire(&self) -> Option<PooledBuffer> {
        let mut free = self.shared.free.lock();
        free.pop().map(|buffer| PooledBuffer {
            pool: self.shared.clone(),
            buffer: Some(buffer),
        })
    }

    /// Length of each buffer in the pool.
    pub fn buffer_len(&self) -> usize {
        self.shared.buffer_len
    }

    /// Number of buffers currently free.
    pub fn free_count(&self) -> usize {
        self.shared.free.lock().len()
    }
}

/// A buffer checked out of a pool; returned on drop.
pub struct PooledBuffer {
    pool: Arc<Shared>,
    buffer: Option<Vec<u8>>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_ref().expect("present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut().expect("present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.iter_mut().for_each(|b| *b = 0);
            self.pool.free.lock().push(buffer);
            self.pool.available.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn acquire_blocks_until_release() {
        let pool = BufferPool::new(1, 64);
        let held = pool.acquire();
        assert!(pool.try_acquire().is_none());

        let pool2 = pool.clone();
        let waiter = thread::spawn(move || {
            let buffer = pool2.acquire();
            buffer.len()
        });
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(waiter.join().unwrap(), 64);
    }

    #[test]
    fn buffers_are_recycled() {
        let pool = BufferPool::new(2, 16);
        {
            let mut a = pool.acquire();
            a[0] = 0xFF;
        }
        assert_eq!(pool.free_count(), 2);
        let b = pool.acquire();
        assert_eq!(b[0], 0, "returned buffers are scrubbed");
    }
}
