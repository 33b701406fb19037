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

//! The consumer side: import a ring over the export socket and map it.

use std::{io, os::unix::net::UnixStream, path::Path};

use crate::{
    protocol::{
        recv_frame, send_frame, Frame, MSG_EXPORT_ERROR, MSG_EXPORT_RING, MSG_HEARTBEAT,
        MSG_MAP_DESCRIPTOR_TABLE, MSG_MAP_PAYLOAD_PAGE, MSG_MAP_RING_CONTROL,
        MSG_METADATA_OFFSET, MSG_OPEN_FINISHED,
    },
    ring::{ControlPage, EventReader, ReaderBacking, Segment},
    RingKind,
};

/// A connected export-socket client.
pub struct EventClient {
    stream: UnixStream,
}

impl EventClient {
    /// Connect to an export server.
    pub fn connect<P: AsRef<Path>>(path: P) -> io::Result<EventClient> {
        Ok(EventClient {
            stream: UnixStream::connect(path)?,
        })
    }

    /// Request a ring export and map the received segments. The reader
    /// starts at the oldest event still held by the ring.
    pub fn import_ring(self, kind: RingKind) -> io::Result<EventReader> {
        send_frame(
            &self.stream,
            &Frame::new(MSG_EXPORT_RING, kind.to_wire(), 0),
            None,
        )?;
        let mut control: Option<Segment> = None;
        let mut descriptors: Option<Segment> = None;
        let mut payload: Option<Segment> = None;
        let mut metadata: Option<Segment> = None;
        loop {
            let (frame, fd) = recv_frame(&self.stream)?;
            match frame.msg_type {
                MSG_MAP_RING_CONTROL => {
                    control = Some(Segment::map(expect_fd(fd)?, frame.value as usize, false)?);
                }
                MSG_MAP_DESCRIPTOR_TABLE => {
                    descriptors = Some(Segment::map(expect_fd(fd)?, frame.value as usize, false)?);
                }
                MSG_MAP_PAYLOAD_PAGE => {
                    payload = Some(Segment::map(expect_fd(fd)?, frame.value as usize, true)?);
                }
                MSG_METADATA_OFFSET => {
                    metadata = Some(Segment::map(expect_fd(fd)?, frame.value as usize, false)?);
                }
                MSG_OPEN_FINISHED => break,
                MSG_HEARTBEAT => continue,
                MSG_EXPORT_ERROR => {
                    return Err(io::Error::new(io::ErrorKind::Other, frame.error));
                }
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unexpected export message {other}"),
                    ));
                }
            }
        }
        let control = control
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing control segment"))?;
        let descriptors = descriptors.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "missing descriptor segment")
        })?;
        let payload = payload
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing payload segment"))?;
        let metadata = metadata
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing metadata segment"))?;

        let page = unsafe { &*(control.base as *const ControlPage) };
        let descriptor_capacity = page.descriptor_capacity;
        let payload_size = page.payload_size;
        debug!(target: "event_ring", "imported ring: {descriptor_capacity} descriptors, {payload_size} payload bytes");
        let reader = EventReader {
            control: control.base as *const ControlPage,
            descriptors: descriptors.base,
            payload: payload.base,
            descriptor_capacity,
            payload_size,
            next_sequence: 0,
            _backing: ReaderBacking::Segments(vec![control, descriptors, payload, metadata]),
        };
        Ok(reader)
    }
}

fn expect_fd(fd: Option<i32>) -> io::Result<i32> {
    fd.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "export message arrived without its descriptor",
        )
    })
}
