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

//! Event kinds and the descriptor layout shared with consumers.

/// What an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EventKind {
    /// A block started executing.
    BlockStart = 1,
    /// A block finished executing.
    BlockEnd = 2,
    /// A transaction started executing.
    TxnStart = 3,
    /// A transaction finished executing.
    TxnEnd = 4,
    /// An account or storage slot changed.
    StateChange = 5,
    /// Producer liveness tick.
    Heartbeat = 6,
}

impl EventKind {
    /// Decode from the wire representation.
    pub fn from_wire(raw: u16) -> Option<EventKind> {
        match raw {
            1 => Some(EventKind::BlockStart),
            2 => Some(EventKind::BlockEnd),
            3 => Some(EventKind::TxnStart),
            4 => Some(EventKind::TxnEnd),
            5 => Some(EventKind::StateChange),
            6 => Some(EventKind::Heartbeat),
            _ => None,
        }
    }
}

/// One slot of the descriptor table. The layout is part of the consumer
/// contract and must not change without a protocol bump.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct EventDescriptor {
    /// Sequence number of the event; a consumer finding a different
    /// value in the slot it expected has been lapped.
    pub sequence: u64,
    /// `EventKind` on the wire.
    pub kind: u16,
    _pad: [u16; 3],
    /// Payload length in bytes.
    pub payload_len: u32,
    _pad2: u32,
    /// Absolute payload position; the consumer reduces it modulo the
    /// payload buffer size.
    pub payload_offset: u64,
    /// Block number or flow identifier the event belongs to.
    pub flow: u64,
}

impl EventDescriptor {
    pub(crate) fn new(
        sequence: u64,
        kind: EventKind,
        payload_len: u32,
        payload_offset: u64,
        flow: u64,
    ) -> EventDescriptor {
        EventDescriptor {
            sequence,
            kind: kind as u16,
            _pad: [0; 3],
            payload_len,
            _pad2: 0,
            payload_offset,
            flow,
        }
    }
}

/// Size of one descriptor slot.
pub(crate) const DESCRIPTOR_SIZE: usize = std::mem::size_of::<EventDescriptor>();
