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

//! Export-protocol round trip: a consumer imports the ring over the
//! socket and reads events the producer recorded.

use event_ring::{
    EventClient, EventKind, EventRecorder, EventRingConfig, EventServer, ReadOutcome, RingKind,
};
use tempdir::TempDir;

#[test]
fn consumer_imports_ring_and_reads_events() {
    let _ = env_logger::try_init();
    let dir = TempDir::new("event-ring").unwrap();
    let socket = dir.path().join("events.sock");

    let recorder = EventRecorder::new(&EventRingConfig {
        descriptors_shift: 8,
        payload_buf_shift: 16,
    })
    .unwrap();
    let _server = EventServer::start(&socket, recorder.ring()).unwrap();

    recorder.block_start(1, 1);
    recorder.state_change(1, b"account 0x53");
    recorder.block_end(1, 0);

    let client = EventClient::connect(&socket).unwrap();
    let mut reader = client.import_ring(RingKind::Execution).unwrap();

    let mut seen = Vec::new();
    while seen.len() < 3 {
        match reader.try_next() {
            ReadOutcome::Event { kind, flow, .. } => {
                assert_eq!(flow, 1);
                seen.push(kind.unwrap());
            }
            ReadOutcome::Empty => std::thread::yield_now(),
            ReadOutcome::Lagged(_) => panic!("tiny test cannot lag"),
        }
    }
    assert_eq!(
        seen,
        vec![EventKind::BlockStart, EventKind::StateChange, EventKind::BlockEnd]
    );
}

#[test]
fn unknown_ring_type_reports_export_error() {
    let dir = TempDir::new("event-ring").unwrap();
    let socket = dir.path().join("events.sock");
    let recorder = EventRecorder::new(&EventRingConfig {
        descriptors_shift: 4,
        payload_buf_shift: 12,
    })
    .unwrap();
    let _server = EventServer::start(&socket, recorder.ring()).unwrap();

    // speak the protocol directly with a bogus ring type
    use std::os::unix::net::UnixStream;
    let stream = UnixStream::connect(&socket).unwrap();
    event_ring::test_support::send_export_request(&stream, 0xFFFF).unwrap();
    let error = event_ring::test_support::read_export_error(&stream).unwrap();
    assert_eq!(error, "unknown ring type");
}
