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

//! The memfd-backed ring segments and the producer/consumer views.

use std::{
    io,
    os::unix::io::RawFd,
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc,
    },
};

use crate::events::{EventDescriptor, EventKind, DESCRIPTOR_SIZE};

/// Geometry of a ring; sizes are powers of two expressed as shifts.
#[derive(Debug, Clone)]
pub struct EventRingConfig {
    /// Descriptor capacity is `2^descriptors_shift`.
    pub descriptors_shift: u8,
    /// Payload buffer size is `2^payload_buf_shift` bytes.
    pub payload_buf_shift: u8,
}

impl Default for EventRingConfig {
    fn default() -> EventRingConfig {
        // a few minutes of history at typical event rates
        EventRingConfig {
            descriptors_shift: 12,
            payload_buf_shift: 20,
        }
    }
}

/// Producer/consumer sequences at the head of the control segment.
#[repr(C)]
pub(crate) struct ControlPage {
    pub producer_seq: AtomicU64,
    pub consumer_seq: AtomicU64,
    pub descriptor_capacity: u64,
    pub payload_size: u64,
}

/// A memfd-backed memory segment, optionally mapped twice back-to-back.
pub(crate) struct Segment {
    pub fd: RawFd,
    pub base: *mut u8,
    pub len: usize,
    pub doubled: bool,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create an anonymous memfd of `len` bytes and map it once.
    pub fn create(name: &str, len: usize) -> io::Result<Segment> {
        let cname = std::ffi::CString::new(name).expect("segment names contain no NUL");
        let fd = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Segment::map(fd, len, false)
    }

    /// Create a memfd of `len` bytes and map it twice consecutively, so
    /// writes that wrap the end of the buffer are a single `memcpy`.
    pub fn create_doubled(name: &str, len: usize) -> io::Result<Segment> {
        let cname = std::ffi::CString::new(name).expect("segment names contain no NUL");
        let fd = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Segment::map(fd, len, true)
    }

    /// Map an existing segment fd; `doubled` repeats the mapping so the
    /// aliased second half mirrors the first.
    pub fn map(fd: RawFd, len: usize, doubled: bool) -> io::Result<Segment> {
        unsafe {
            if !doubled {
                let base = libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                );
                if base == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }
                return Ok(Segment {
                    fd,
                    base: base as *mut u8,
                    len,
                    doubled,
                });
            }
            // reserve a window of twice the size, then map the fd into
            // both halves
            let reserve = libc::mmap(
                std::ptr::null_mut(),
                len * 2,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if reserve == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            for half in 0..2 {
                let at = (reserve as *mut u8).add(half * len);
                let mapped = libc::mmap(
                    at as *mut libc::c_void,
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    fd,
                    0,
                );
                if mapped == libc::MAP_FAILED {
                    let err = io::Error::last_os_error();
                    libc::munmap(reserve, len * 2);
                    return Err(err);
                }
            }
            Ok(Segment {
                fd,
                base: reserve as *mut u8,
                len,
                doubled,
            })
        }
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.base
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            let mapped = if self.doubled { self.len * 2 } else { self.len };
            libc::munmap(self.base as *mut libc::c_void, mapped);
            libc::close(self.fd);
        }
    }
}

/// The producer-owned ring: control page, descriptor table, payload
/// buffer and a small metadata segment.
pub struct EventRing {
    pub(crate) control: Segment,
    pub(crate) descriptors: Segment,
    pub(crate) payload: Segment,
    pub(crate) metadata: Segment,
    descriptor_capacity: u64,
    payload_size: u64,
}

impl EventRing {
    /// Allocate the segments for a fresh ring.
    pub fn create(config: &EventRingConfig) -> io::Result<EventRing> {
        let descriptor_capacity = 1u64 << config.descriptors_shift;
        let payload_size = 1u64 << config.payload_buf_shift;
        let control = Segment::create("ring-control", page_align(std::mem::size_of::<ControlPage>()))?;
        let descriptors = Segment::create(
            "ring-descriptors",
            page_align(descriptor_capacity as usize * DESCRIPTOR_SIZE),
        )?;
        let payload = Segment::create_doubled("ring-payload", payload_size as usize)?;
        let metadata = Segment::create("ring-metadata", page_align(4096))?;
        let ring = EventRing {
            control,
            descriptors,
            payload,
            metadata,
            descriptor_capacity,
            payload_size,
        };
        {
            let control = ring.control_page();
            control.producer_seq.store(0, AtomicOrdering::Release);
            control.consumer_seq.store(0, AtomicOrdering::Release);
        }
        unsafe {
            let control = &mut *(ring.control.as_mut_ptr() as *mut ControlPage);
            control.descriptor_capacity = descriptor_capacity;
            control.payload_size = payload_size;
        }
        debug!(target: "event_ring", "created ring: {descriptor_capacity} descriptors, {payload_size} payload bytes");
        Ok(ring)
    }

    pub(crate) fn control_page(&self) -> &ControlPage {
        unsafe { &*(self.control.base as *const ControlPage) }
    }

    /// The single producer handle. Create exactly one per ring; the
    /// payload cursor lives in the writer.
    pub fn writer(self: &Arc<Self>) -> EventWriter {
        EventWriter {
            ring: self.clone(),
            payload_cursor: 0,
        }
    }

    /// An in-process consumer over the same mappings; out-of-process
    /// consumers get the same view through `EventClient`.
    pub fn reader(self: &Arc<Self>) -> EventReader {
        EventReader {
            control: self.control.base as *const ControlPage,
            descriptors: self.descriptors.base,
            payload: self.payload.base,
            descriptor_capacity: self.descriptor_capacity,
            payload_size: self.payload_size,
            next_sequence: 0,
            _backing: ReaderBacking::Ring(self.clone()),
        }
    }

}

fn page_align(len: usize) -> usize {
    const PAGE: usize = 4096;
    (len + PAGE - 1) / PAGE * PAGE
}

/// Single-producer event writer.
pub struct EventWriter {
    ring: Arc<EventRing>,
    payload_cursor: u64,
}

impl EventWriter {
    /// Record one event. Old events are overwritten once the ring laps;
    /// readers detect that from the sequence stamped in the descriptor.
    pub fn record(&mut self, kind: EventKind, flow: u64, payload: &[u8]) -> u64 {
        let ring = &self.ring;
        assert!(
            (payload.len() as u64) <= ring.payload_size / 2,
            "event payload larger than the ring can hold"
        );
        let control = ring.control_page();
        let sequence = control.producer_seq.load(AtomicOrdering::Relaxed);
        let payload_offset = self.payload_cursor;
        unsafe {
            // doubled mapping: a wrapping record is one copy
            let at = (payload_offset % ring.payload_size) as usize;
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                ring.payload.as_mut_ptr().add(at),
                payload.len(),
            );
            let slot = (sequence & (ring.descriptor_capacity - 1)) as usize;
            let descriptor = EventDescriptor::new(
                sequence,
                kind,
                payload.len() as u32,
                payload_offset,
                flow,
            );
            let table = ring.descriptors.as_mut_ptr() as *mut EventDescriptor;
            std::ptr::write_volatile(table.add(slot), descriptor);
        }
        self.payload_cursor += payload.len() as u64;
        control
            .producer_seq
            .store(sequence + 1, AtomicOrdering::Release);
        sequence
    }
}

/// What a read attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Nothing new; spin or poll.
    Empty,
    /// The consumer fell behind and the ring lapped it; it resumed at the
    /// given sequence.
    Lagged(u64),
    /// An event.
    Event {
        /// Event sequence number.
        sequence: u64,
        /// Decoded kind; `None` for kinds newer than this consumer.
        kind: Option<EventKind>,
        /// Flow identifier (block number).
        flow: u64,
        /// Payload bytes, copied out of the ring.
        payload: Vec<u8>,
    },
}

/// What keeps a reader's mappings alive.
pub(crate) enum ReaderBacking {
    /// In-process reader over the producer's own ring.
    Ring(Arc<EventRing>),
    /// Out-of-process reader over segments received from the server.
    Segments(Vec<Segment>),
}

/// Consumer view over mapped segments.
pub struct EventReader {
    pub(crate) control: *const ControlPage,
    pub(crate) descriptors: *const u8,
    pub(crate) payload: *const u8,
    pub(crate) descriptor_capacity: u64,
    pub(crate) payload_size: u64,
    pub(crate) next_sequence: u64,
    pub(crate) _backing: ReaderBacking,
}

unsafe impl Send for EventReader {}

impl EventReader {
    /// Fetch the next event if the producer has published one.
    pub fn try_next(&mut self) -> ReadOutcome {
        let control = unsafe { &*self.control };
        let produced = control.producer_seq.load(AtomicOrdering::Acquire);
        if self.next_sequence >= produced {
            return ReadOutcome::Empty;
        }
        if produced - self.next_sequence > self.descriptor_capacity {
            // lapped; resume at the oldest still-live descriptor
            let resume = produced - self.descriptor_capacity;
            let skipped = resume;
            self.next_sequence = resume;
            return ReadOutcome::Lagged(skipped);
        }
        let slot = (self.next_sequence & (self.descriptor_capacity - 1)) as usize;
        let descriptor = unsafe {
            std::ptr::read_volatile(
                (self.descriptors as *const EventDescriptor).add(slot),
            )
        };
        if descriptor.sequence != self.next_sequence {
            // overwritten between the check above and the slot read
            let resume = control
                .producer_seq
                .load(AtomicOrdering::Acquire)
                .saturating_sub(self.descriptor_capacity);
            self.next_sequence = resume;
            return ReadOutcome::Lagged(resume);
        }
        let mut payload = vec![0u8; descriptor.payload_len as usize];
        unsafe {
            let at = (descriptor.payload_offset % self.payload_size) as usize;
            std::ptr::copy_nonoverlapping(
                self.payload.add(at),
                payload.as_mut_ptr(),
                payload.len(),
            );
        }
        // a producer that lapped the payload while we copied shows up as
        // a descriptor overwrite; re-check before accepting
        let descriptor_after = unsafe {
            std::ptr::read_volatile(
                (self.descriptors as *const EventDescriptor).add(slot),
            )
        };
        if descriptor_after.sequence != self.next_sequence {
            let resume = control
                .producer_seq
                .load(AtomicOrdering::Acquire)
                .saturating_sub(self.descriptor_capacity);
            self.next_sequence = resume;
            return ReadOutcome::Lagged(resume);
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        control
            .consumer_seq
            .store(self.next_sequence, AtomicOrdering::Release);
        ReadOutcome::Event {
            sequence,
            kind: EventKind::from_wire(descriptor.kind),
            flow: descriptor.flow,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_ring() -> Arc<EventRing> {
        Arc::new(
            EventRing::create(&EventRingConfig {
                descriptors_shift: 4,
                payload_buf_shift: 12,
            })
            .unwrap(),
        )
    }

    #[test]
    fn write_then_read() {
        let ring = small_ring();
        let mut writer = ring.writer();
        writer.record(EventKind::BlockStart, 7, b"block 7");
        writer.record(EventKind::BlockEnd, 7, b"done");
        let mut reader = ring.reader();
        match reader.try_next() {
            ReadOutcome::Event {
                sequence,
                kind,
                flow,
                payload,
            } => {
                assert_eq!(sequence, 0);
                assert_eq!(kind, Some(EventKind::BlockStart));
                assert_eq!(flow, 7);
                assert_eq!(payload, b"block 7");
            }
            other => panic!("expected event, got {other:?}"),
        }
        assert!(matches!(reader.try_next(), ReadOutcome::Event { .. }));
        assert_eq!(reader.try_next(), ReadOutcome::Empty);
    }

    #[test]
    fn payload_wraps_with_one_copy() {
        let ring = small_ring();
        let mut writer = ring.writer();
        let mut reader = ring.reader();
        // drive the payload cursor close to the 4096-byte boundary, then
        // write a record that must wrap
        let filler = vec![0xAB; 1000];
        for _ in 0..4 {
            writer.record(EventKind::StateChange, 1, &filler);
            let _ = reader.try_next();
        }
        let wrapping = (0u8..=255).collect::<Vec<_>>();
        writer.record(EventKind::StateChange, 2, &wrapping);
        match reader.try_next() {
            ReadOutcome::Event { payload, .. } => assert_eq!(payload, wrapping),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn lapped_reader_resumes() {
        let ring = small_ring();
        let mut writer = ring.writer();
        for i in 0..40u64 {
            writer.record(EventKind::TxnStart, i, b"payload");
        }
        let mut reader = ring.reader();
        match reader.try_next() {
            ReadOutcome::Lagged(resume) => assert_eq!(resume, 40 - 16),
            other => panic!("expected lag, got {other:?}"),
        }
        assert!(matches!(reader.try_next(), ReadOutcome::Event { .. }));
    }
}
