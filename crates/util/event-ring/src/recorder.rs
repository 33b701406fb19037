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

//! The recorder handed to the execution engine: typed event helpers over
//! a single ring writer. An explicit object, passed where needed.

use std::{io, sync::Arc};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::{
    events::EventKind,
    ring::{EventRing, EventRingConfig, EventWriter},
};

/// Records execution events into a shared-memory ring.
pub struct EventRecorder {
    ring: Arc<EventRing>,
    writer: Mutex<EventWriter>,
}

impl EventRecorder {
    /// Allocate a ring with the given geometry and wrap it.
    pub fn new(config: &EventRingConfig) -> io::Result<EventRecorder> {
        let ring = Arc::new(EventRing::create(config)?);
        let writer = Mutex::new(ring.writer());
        Ok(EventRecorder { ring, writer })
    }

    /// The ring, for serving exports.
    pub fn ring(&self) -> Arc<EventRing> {
        self.ring.clone()
    }

    /// A block started executing.
    pub fn block_start(&self, block_number: u64, round: u64) {
        let mut payload = [0u8; 16];
        LittleEndian::write_u64(&mut payload[0..8], block_number);
        LittleEndian::write_u64(&mut payload[8..16], round);
        self.writer
            .lock()
            .record(EventKind::BlockStart, block_number, &payload);
    }

    /// A block finished; carries the transaction count.
    pub fn block_end(&self, block_number: u64, txn_count: u32) {
        let mut payload = [0u8; 12];
        LittleEndian::write_u64(&mut payload[0..8], block_number);
        LittleEndian::write_u32(&mut payload[8..12], txn_count);
        self.writer
            .lock()
            .record(EventKind::BlockEnd, block_number, &payload);
    }

    /// A transaction started executing.
    pub fn txn_start(&self, block_number: u64, txn_index: u32) {
        let mut payload = [0u8; 12];
        LittleEndian::write_u64(&mut payload[0..8], block_number);
        LittleEndian::write_u32(&mut payload[8..12], txn_index);
        self.writer
            .lock()
            .record(EventKind::TxnStart, block_number, &payload);
    }

    /// A transaction finished executing.
    pub fn txn_end(&self, block_number: u64, txn_index: u32, success: bool) {
        let mut payload = [0u8; 13];
        LittleEndian::write_u64(&mut payload[0..8], block_number);
        LittleEndian::write_u32(&mut payload[8..12], txn_index);
        payload[12] = success as u8;
        self.writer
            .lock()
            .record(EventKind::TxnEnd, block_number, &payload);
    }

    /// An account or storage slot changed; `subject` identifies it
    /// (address bytes, optionally followed by the slot key).
    pub fn state_change(&self, block_number: u64, subject: &[u8]) {
        self.writer
            .lock()
            .record(EventKind::StateChange, block_number, subject);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ReadOutcome;

    #[test]
    fn typed_events_round_trip() {
        let recorder = EventRecorder::new(&EventRingConfig {
            descriptors_shift: 6,
            payload_buf_shift: 14,
        })
        .unwrap();
        recorder.block_start(5, 12);
        recorder.txn_start(5, 0);
        recorder.txn_end(5, 0, true);
        recorder.block_end(5, 1);

        let ring = recorder.ring();
        let mut reader = ring.reader();
        let kinds: Vec<_> = std::iter::from_fn(|| match reader.try_next() {
            ReadOutcome::Event { kind, .. } => Some(kind.unwrap()),
            _ => None,
        })
        .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::BlockStart,
                EventKind::TxnStart,
                EventKind::TxnEnd,
                EventKind::BlockEnd
            ]
        );
    }
}
