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

//! The UNIX-socket export protocol: fixed-size frames, each optionally
//! carrying one file descriptor via `SCM_RIGHTS`.

use std::{
    io,
    os::unix::{
        io::{AsRawFd, RawFd},
        net::UnixStream,
    },
};

use byteorder::{ByteOrder, LittleEndian};

pub const MSG_EXPORT_RING: u16 = 1;
pub const MSG_MAP_RING_CONTROL: u16 = 2;
pub const MSG_MAP_DESCRIPTOR_TABLE: u16 = 3;
pub const MSG_MAP_PAYLOAD_PAGE: u16 = 4;
pub const MSG_METADATA_OFFSET: u16 = 5;
pub const MSG_OPEN_FINISHED: u16 = 6;
pub const MSG_EXPORT_ERROR: u16 = 7;
pub const MSG_HEARTBEAT: u16 = 8;

const ERROR_BUF_LEN: usize = 128;
pub const FRAME_LEN: usize = 2 + 2 + 8 + 4 + ERROR_BUF_LEN;

/// One protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: u16,
    pub ring_type: u16,
    /// Segment length, metadata offset, or error-string length.
    pub value: u64,
    pub error: String,
}

impl Frame {
    pub fn new(msg_type: u16, ring_type: u16, value: u64) -> Frame {
        Frame {
            msg_type,
            ring_type,
            value,
            error: String::new(),
        }
    }

    pub fn error(message: &str) -> Frame {
        let mut message = message.to_string();
        message.truncate(ERROR_BUF_LEN);
        Frame {
            msg_type: MSG_EXPORT_ERROR,
            ring_type: 0,
            value: message.len() as u64,
            error: message,
        }
    }

    fn encode(&self) -> [u8; FRAME_LEN] {
        let mut out = [0u8; FRAME_LEN];
        LittleEndian::write_u16(&mut out[0..2], self.msg_type);
        LittleEndian::write_u16(&mut out[2..4], self.ring_type);
        LittleEndian::write_u64(&mut out[4..12], self.value);
        out[16..16 + self.error.len()].copy_from_slice(self.error.as_bytes());
        out
    }

    fn decode(bytes: &[u8; FRAME_LEN]) -> Frame {
        let msg_type = LittleEndian::read_u16(&bytes[0..2]);
        let ring_type = LittleEndian::read_u16(&bytes[2..4]);
        let value = LittleEndian::read_u64(&bytes[4..12]);
        let error = if msg_type == MSG_EXPORT_ERROR {
            let len = (value as usize).min(ERROR_BUF_LEN);
            String::from_utf8_lossy(&bytes[16..16 + len]).into_owned()
        } else {
            String::new()
        };
        Frame {
            msg_type,
            ring_type,
            value,
            error,
        }
    }
}

/// Send a frame, attaching `fd` as ancillary data when present.
pub fn send_frame(stream: &UnixStream, frame: &Frame, fd: Option<RawFd>) -> io::Result<()> {
    let bytes = frame.encode();
    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };
    // comfortably larger than CMSG_SPACE(sizeof(int))
    let mut cmsg_space = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    if let Some(fd) = fd {
        msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(4) } as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(4) as _;
            std::ptr::copy_nonoverlapping(
                &fd as *const RawFd as *const u8,
                libc::CMSG_DATA(cmsg),
                4,
            );
        }
    }
    let sent = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    if sent as usize != bytes.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "short frame write",
        ));
    }
    Ok(())
}

/// Receive a frame plus its ancillary file descriptor, if any.
pub fn recv_frame(stream: &UnixStream) -> io::Result<(Frame, Option<RawFd>)> {
    let mut bytes = [0u8; FRAME_LEN];
    let mut iov = libc::iovec {
        iov_base: bytes.as_mut_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };
    let mut cmsg_space = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space.len() as _;
    let received = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, 0) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }
    if received == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the export socket",
        ));
    }
    if received as usize != FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "short frame"));
    }
    let mut fd = None;
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if !cmsg.is_null()
            && (*cmsg).cmsg_level == libc::SOL_SOCKET
            && (*cmsg).cmsg_type == libc::SCM_RIGHTS
        {
            let mut raw: RawFd = -1;
            std::ptr::copy_nonoverlapping(
                libc::CMSG_DATA(cmsg),
                &mut raw as *mut RawFd as *mut u8,
                4,
            );
            if raw >= 0 {
                fd = Some(raw);
            }
        }
    }
    Ok((Frame::decode(&bytes), fd))
}
