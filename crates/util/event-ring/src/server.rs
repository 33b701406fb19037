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

//! The export server: hands ring segments to consumers over a UNIX
//! socket and heart-beats connected clients about once a second.

use std::{
    io,
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    protocol::{
        recv_frame, send_frame, Frame, MSG_EXPORT_RING, MSG_HEARTBEAT, MSG_MAP_DESCRIPTOR_TABLE,
        MSG_MAP_PAYLOAD_PAGE, MSG_MAP_RING_CONTROL, MSG_METADATA_OFFSET, MSG_OPEN_FINISHED,
    },
    ring::EventRing,
    RingKind,
};

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// Serves ring exports on a UNIX-domain socket.
pub struct EventServer {
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    heartbeat_thread: Option<JoinHandle<()>>,
}

struct Shared {
    ring: Arc<EventRing>,
    clients: Mutex<Vec<UnixStream>>,
}

impl EventServer {
    /// Bind `path` and start serving `ring`.
    pub fn start<P: AsRef<Path>>(path: P, ring: Arc<EventRing>) -> io::Result<EventServer> {
        let path = path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Shared {
            ring,
            clients: Mutex::new(Vec::new()),
        });

        let accept_shutdown = shutdown.clone();
        let accept_shared = shared.clone();
        let accept_thread = thread::Builder::new()
            .name("event-ring accept".into())
            .spawn(move || {
                while !accept_shutdown.load(AtomicOrdering::Acquire) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            if let Err(err) = handle_client(&accept_shared, &stream) {
                                warn!(target: "event_ring", "client export failed: {err}");
                                continue;
                            }
                            accept_shared.clients.lock().push(stream);
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(50));
                        }
                        Err(err) => {
                            warn!(target: "event_ring", "accept failed: {err}");
                            break;
                        }
                    }
                }
            })
            .expect("Error creating event server thread");

        let heartbeat_shutdown = shutdown.clone();
        let heartbeat_thread = thread::Builder::new()
            .name("event-ring heartbeat".into())
            .spawn(move || {
                while !heartbeat_shutdown.load(AtomicOrdering::Acquire) {
                    thread::sleep(HEARTBEAT_PERIOD);
                    let mut clients = shared.clients.lock();
                    clients.retain(|stream| {
                        send_frame(stream, &Frame::new(MSG_HEARTBEAT, 0, 0), None).is_ok()
                    });
                }
            })
            .expect("Error creating event server thread");

        debug!(target: "event_ring", "export server listening on {path:?}");
        Ok(EventServer {
            path,
            shutdown,
            accept_thread: Some(accept_thread),
            heartbeat_thread: Some(heartbeat_thread),
        })
    }
}

fn handle_client(shared: &Shared, stream: &UnixStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let (request, _) = recv_frame(stream)?;
    if request.msg_type != MSG_EXPORT_RING {
        send_frame(stream, &Frame::error("expected EXPORT_RING"), None)?;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected request",
        ));
    }
    let Some(kind) = RingKind::from_wire(request.ring_type) else {
        send_frame(stream, &Frame::error("unknown ring type"), None)?;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unknown ring type",
        ));
    };
    debug!(target: "event_ring", "exporting {kind:?} ring");
    let ring = &shared.ring;
    send_frame(
        stream,
        &Frame::new(MSG_MAP_RING_CONTROL, request.ring_type, ring.control.len as u64),
        Some(ring.control.fd),
    )?;
    send_frame(
        stream,
        &Frame::new(
            MSG_MAP_DESCRIPTOR_TABLE,
            request.ring_type,
            ring.descriptors.len as u64,
        ),
        Some(ring.descriptors.fd),
    )?;
    send_frame(
        stream,
        &Frame::new(MSG_MAP_PAYLOAD_PAGE, request.ring_type, ring.payload.len as u64),
        Some(ring.payload.fd),
    )?;
    send_frame(
        stream,
        &Frame::new(MSG_METADATA_OFFSET, request.ring_type, ring.metadata.len as u64),
        Some(ring.metadata.fd),
    )?;
    send_frame(stream, &Frame::new(MSG_OPEN_FINISHED, request.ring_type, 0), None)?;
    Ok(())
}

impl Drop for EventServer {
    fn drop(&mut self) {
        self.shutdown.store(true, AtomicOrdering::Release);
        if let Some(thread) = self.accept_thread.take() {
            thread.join().ok();
        }
        if let Some(thread) = self.heartbeat_thread.take() {
            thread.join().ok();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}
