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

//! Shared-memory ring recording execution events for external consumers.
//!
//! The producer side records block, transaction and state-change events
//! into memfd-backed segments: a control page of producer/consumer
//! sequence numbers, a power-of-two descriptor table, and a payload
//! buffer mapped twice back-to-back so a record wrapping the end of the
//! buffer is still one `memcpy`. Consumers connect over a UNIX-domain
//! socket; the server hands them the file descriptors of every segment
//! and they map the ring read-only.
//!
//! The recorder handed to the execution engine is an explicit object, not
//! process-global state.

#[macro_use]
extern crate log;

mod client;
mod events;
mod protocol;
mod recorder;
mod ring;
mod server;

pub use client::EventClient;
pub use events::{EventDescriptor, EventKind};
pub use recorder::EventRecorder;
pub use ring::{EventReader, EventRing, EventRingConfig, EventWriter, ReadOutcome};
pub use server::EventServer;

/// Raw-protocol helpers for tests that drive the socket by hand.
#[doc(hidden)]
pub mod test_support {
    use std::{io, os::unix::net::UnixStream};

    use crate::protocol::{recv_frame, send_frame, Frame, MSG_EXPORT_ERROR, MSG_EXPORT_RING};

    pub fn send_export_request(stream: &UnixStream, ring_type: u16) -> io::Result<()> {
        send_frame(stream, &Frame::new(MSG_EXPORT_RING, ring_type, 0), None)
    }

    pub fn read_export_error(stream: &UnixStream) -> io::Result<String> {
        let (frame, _) = recv_frame(stream)?;
        if frame.msg_type != MSG_EXPORT_ERROR {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expected EXPORT_ERROR",
            ));
        }
        Ok(frame.error)
    }
}

/// Ring types a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    /// Execution events: blocks, transactions, state changes.
    Execution,
}

impl RingKind {
    pub(crate) fn from_wire(raw: u16) -> Option<RingKind> {
        match raw {
            1 => Some(RingKind::Execution),
            _ => None,
        }
    }

    pub(crate) fn to_wire(self) -> u16 {
        match self {
            RingKind::Execution => 1,
        }
    }
}
