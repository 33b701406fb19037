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

//! The owning-thread executor.

use std::{
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

const QUEUE_CAPACITY: usize = 1024;
const STACK_SIZE: usize = 16 * 1024 * 1024;

/// Completion status surfaced to a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The invocation ran to completion.
    Complete,
    /// The invocation was canceled before it ran.
    Canceled,
}

type Invocation = Box<dyn FnOnce() + Send>;

enum Task {
    Invoke(Invocation),
    Timed {
        at: Instant,
        sequence: u64,
        invocation: Invocation,
        cancel: Arc<AtomicBool>,
    },
    Stop,
}

struct TimedEntry {
    at: Instant,
    sequence: u64,
    invocation: Invocation,
    cancel: Arc<AtomicBool>,
}

impl PartialEq for TimedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.sequence == other.sequence
    }
}

impl Eq for TimedEntry {}

impl PartialOrd for TimedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline pops
        // first, sequence breaking ties in submission order.
        (other.at, other.sequence).cmp(&(self.at, self.sequence))
    }
}

/// A handle canceling a pending timed or thread-safe invocation. Tasks
/// already running are never interrupted; cancellation is cooperative.
#[derive(Clone)]
pub struct CancelHandle {
    canceled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Request cancellation. Returns the status the waiter will observe.
    pub fn cancel(&self) -> Status {
        self.canceled.store(true, AtomicOrdering::Release);
        Status::Canceled
    }

    /// Whether cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(AtomicOrdering::Acquire)
    }
}

/// Cloneable submission side of an `IoService`.
#[derive(Clone)]
pub struct IoChannel {
    sender: Sender<Task>,
    owner: ThreadId,
}

impl IoChannel {
    /// Enqueue a thread-safe invocation; it will run on the owning
    /// thread. Blocks if the submission queue is full.
    pub fn dispatch<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.sender
            .send(Task::Invoke(Box::new(f)))
            .expect("I/O service terminated while handles were live");
    }

    /// Enqueue an invocation to run after the given delay. Returns a
    /// handle that cancels it if it has not started yet.
    pub fn dispatch_after<F: FnOnce() + Send + 'static>(
        &self,
        delay: Duration,
        f: F,
    ) -> CancelHandle {
        static SEQUENCE: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let cancel = Arc::new(AtomicBool::new(false));
        self.sender
            .send(Task::Timed {
                at: Instant::now() + delay,
                sequence: SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed),
                invocation: Box::new(f),
                cancel: cancel.clone(),
            })
            .expect("I/O service terminated while handles were live");
        CancelHandle { canceled: cancel }
    }

    /// Whether the calling thread is the owning thread.
    pub fn is_owning_thread(&self) -> bool {
        thread::current().id() == self.owner
    }
}

/// The executor service. Owns the single thread all storage work runs on.
pub struct IoService {
    channel: IoChannel,
    thread: Option<JoinHandle<()>>,
}

impl IoService {
    /// Start the owning thread.
    pub fn start(name: &str) -> IoService {
        let (sender, receiver) = bounded::<Task>(QUEUE_CAPACITY);
        let (id_sender, id_receiver) = bounded(1);
        let thread = thread::Builder::new()
            .stack_size(STACK_SIZE)
            .name(format!("io {name}"))
            .spawn(move || {
                id_sender
                    .send(thread::current().id())
                    .expect("service startup handshake failed");
                run(receiver);
            })
            .expect("Error creating I/O service thread");
        let owner = id_receiver
            .recv()
            .expect("service startup handshake failed");
        trace!(target: "io", "started owning thread {owner:?}");
        IoService {
            channel: IoChannel { sender, owner },
            thread: Some(thread),
        }
    }

    /// A cloneable submission handle.
    pub fn channel(&self) -> IoChannel {
        self.channel.clone()
    }

    /// Whether the calling thread is the owning thread.
    pub fn is_owning_thread(&self) -> bool {
        self.channel.is_owning_thread()
    }

    /// Panic unless called on the owning thread. The trie engine guards
    /// its entry points with this.
    pub fn assert_owning_thread(&self) {
        assert!(
            self.is_owning_thread(),
            "storage engine invoked off its owning thread"
        );
    }

    /// Run a closure on the owning thread and block until it finishes,
    /// returning its result. Called from the owning thread itself the
    /// closure runs inline, which is what nested trie updates rely on.
    /// A panic inside the closure resumes on the calling thread.
    pub fn call<R: Send + 'static, F: FnOnce() -> R + Send + 'static>(&self, f: F) -> R {
        if self.is_owning_thread() {
            return f();
        }
        type Slot<R> = (Mutex<Option<std::thread::Result<R>>>, Condvar);
        let result: Arc<Slot<R>> = Arc::new((Mutex::new(None), Condvar::new()));
        let completion = result.clone();
        self.channel.dispatch(move || {
            let value = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
            let mut slot = completion.0.lock();
            *slot = Some(value);
            completion.1.notify_one();
        });
        let mut slot = result.0.lock();
        while slot.is_none() {
            result.1.wait(&mut slot);
        }
        match slot.take().expect("guarded by loop above") {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Block until every invocation submitted before this call has run.
    pub fn wait_until_done(&self) {
        self.call(|| {});
    }
}

impl Drop for IoService {
    fn drop(&mut self) {
        trace!(target: "shutdown", "[IoService] Closing...");
        let _ = self.channel.sender.send(Task::Stop);
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
        trace!(target: "shutdown", "[IoService] Closed");
    }
}

fn run(receiver: Receiver<Task>) {
    let mut timers: BinaryHeap<TimedEntry> = BinaryHeap::new();
    loop {
        // Fire due timers before taking more work.
        let now = Instant::now();
        while timers.peek().map_or(false, |entry| entry.at <= now) {
            let entry = timers.pop().expect("peeked above");
            if entry.cancel.load(AtomicOrdering::Acquire) {
                continue;
            }
            (entry.invocation)();
        }
        let task = match timers.peek() {
            Some(entry) => match receiver.recv_timeout(entry.at.saturating_duration_since(now)) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match receiver.recv() {
                Ok(task) => task,
                Err(_) => break,
            },
        };
        match task {
            Task::Invoke(invocation) => invocation(),
            Task::Timed {
                at,
                sequence,
                invocation,
                cancel,
            } => timers.push(TimedEntry {
                at,
                sequence,
                invocation,
                cancel,
            }),
            Task::Stop => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn call_runs_on_owning_thread() {
        let service = IoService::start("test");
        let channel = service.channel();
        let on_owner = service.call(move || channel.is_owning_thread());
        assert!(on_owner);
        assert!(!service.is_owning_thread());
    }

    #[test]
    fn dispatch_preserves_submission_order() {
        let service = IoService::start("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100usize {
            let seen = seen.clone();
            service.channel().dispatch(move || seen.lock().push(i));
        }
        service.wait_until_done();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn timed_invocation_fires() {
        let service = IoService::start("test");
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        service.channel().dispatch_after(Duration::from_millis(10), move || {
            flag.store(true, AtomicOrdering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        service.wait_until_done();
        assert!(fired.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn canceled_invocation_does_not_fire() {
        let service = IoService::start("test");
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = service
            .channel()
            .dispatch_after(Duration::from_millis(20), move || {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            });
        assert_eq!(handle.cancel(), Status::Canceled);
        thread::sleep(Duration::from_millis(100));
        service.wait_until_done();
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);
        assert!(handle.is_canceled());
    }

    #[test]
    fn reentrant_call_from_owning_thread() {
        let service = Arc::new(IoService::start("test"));
        let inner = service.clone();
        let value = service.call(move || inner.call(|| 42));
        assert_eq!(value, 42);
    }
}
