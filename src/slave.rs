// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client side of the device back-channel ("slave channel").
//!
//! Workers use this channel to reach guest memory the daemon cannot map:
//! MAP/UNMAP/SYNC manage the DAX cache window and IO transfers bytes
//! between a file and guest physical memory. Requests carry at most one
//! file descriptor as ancillary data; replies are a single `u64` holding
//! either a negated errno or a byte count.

use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Write;
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use bitflags::bitflags;
use enumn::N;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use vmm_sys_util::sock_ctrl_msg::ScmSocket;

/// Maximum entries in one slave message; shared by all four operations.
pub const FS_SLAVE_ENTRIES: usize = 8;

/// `len` value on UNMAP meaning "the entire cache".
pub const FS_SLAVE_LEN_ALL: u64 = !0;

bitflags! {
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
    pub struct SlaveMsgFlags: u64 {
        /// Map with read permission / transfer file-to-RAM.
        const MAP_R = 0x1;
        /// Map with write permission / transfer RAM-to-file.
        const MAP_W = 0x2;
    }
}

/// Body shared by all slave operations. Entries with `len == 0` are
/// skipped by the device.
#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone, AsBytes, FromZeroes, FromBytes)]
pub struct FsSlaveMsg {
    /// File offset each entry starts at.
    pub fd_offset: [u64; FS_SLAVE_ENTRIES],
    /// Offset into the cache window (MAP/UNMAP/SYNC) or guest physical
    /// address (IO).
    pub c_offset: [u64; FS_SLAVE_ENTRIES],
    /// Length of each entry.
    pub len: [u64; FS_SLAVE_ENTRIES],
    /// `SlaveMsgFlags` bits for each entry.
    pub flags: [u64; FS_SLAVE_ENTRIES],
}

impl FsSlaveMsg {
    /// A message with a single populated entry.
    pub fn single(flags: SlaveMsgFlags, fd_offset: u64, c_offset: u64, len: u64) -> FsSlaveMsg {
        let mut msg = FsSlaveMsg::default();
        msg.flags[0] = flags.bits();
        msg.fd_offset[0] = fd_offset;
        msg.c_offset[0] = c_offset;
        msg.len[0] = len;
        msg
    }
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, N)]
pub enum SlaveOp {
    Map = 6,
    Unmap = 7,
    Sync = 8,
    Io = 9,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, AsBytes, FromZeroes, FromBytes)]
struct SlaveRequestHeader {
    op: u32,
    padding: u32,
}

const REQUEST_SIZE: usize = size_of::<SlaveRequestHeader>() + size_of::<FsSlaveMsg>();

/// A request as decoded by the device end of the channel.
pub struct SlaveRequest {
    pub op: SlaveOp,
    pub msg: FsSlaveMsg,
    pub fd: Option<File>,
}

/// Reads one framed request off `sock`. Returns `None` on clean EOF.
pub fn read_request(sock: &mut UnixStream) -> io::Result<Option<SlaveRequest>> {
    let mut buf = [0u8; REQUEST_SIZE];
    let (mut n, fd) = sock
        .recv_with_fd(&mut buf)
        .map_err(|e| io::Error::from_raw_os_error(e.errno()))?;
    if n == 0 {
        return Ok(None);
    }
    // A stream socket may hand back a short first read; the fd, if any,
    // arrived with it.
    while n < REQUEST_SIZE {
        sock.read_exact(&mut buf[n..n + 1])?;
        n += 1;
    }

    let header = SlaveRequestHeader::read_from(&buf[..size_of::<SlaveRequestHeader>()])
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
    let op = SlaveOp::n(header.op).ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
    let msg = FsSlaveMsg::read_from(&buf[size_of::<SlaveRequestHeader>()..])
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;

    Ok(Some(SlaveRequest { op, msg, fd }))
}

/// Writes the device's `u64` result back to the daemon.
pub fn write_reply(sock: &mut UnixStream, res: u64) -> io::Result<()> {
    sock.write_all(&res.to_ne_bytes())
}

/// The daemon's handle on the back-channel socket.
///
/// A mutex holds the socket across each request/reply round trip so
/// concurrent workers cannot interleave frames.
pub struct SlaveChannel {
    sock: Mutex<UnixStream>,
}

impl SlaveChannel {
    pub fn new(sock: UnixStream) -> SlaveChannel {
        SlaveChannel {
            sock: Mutex::new(sock),
        }
    }

    /// Splices ranges of `fd` into the cache window with permissions from
    /// each entry's flags.
    pub fn map(&self, msg: &FsSlaveMsg, fd: &dyn AsRawFd) -> io::Result<u64> {
        self.request(SlaveOp::Map, msg, Some(fd.as_raw_fd()))
    }

    /// Restores anonymous inaccessible pages over the cache ranges.
    pub fn unmap(&self, msg: &FsSlaveMsg) -> io::Result<u64> {
        self.request(SlaveOp::Unmap, msg, None)
    }

    /// Flushes dirty cache pages backing the ranges.
    pub fn sync(&self, msg: &FsSlaveMsg) -> io::Result<u64> {
        self.request(SlaveOp::Sync, msg, None)
    }

    /// Transfers bytes between `fd` and guest physical memory in the
    /// direction given by each entry's flags. Returns bytes transferred.
    /// The device closes its copy of `fd` when done.
    pub fn io(&self, msg: &FsSlaveMsg, fd: &dyn AsRawFd) -> io::Result<u64> {
        self.request(SlaveOp::Io, msg, Some(fd.as_raw_fd()))
    }

    /// Writes `len` bytes at guest physical address `gpa` into `fd` at
    /// `fd_offset`. Used for flushing unmappable write payloads.
    pub fn write_from_guest(
        &self,
        fd: &dyn AsRawFd,
        fd_offset: u64,
        gpa: u64,
        len: u64,
    ) -> io::Result<u64> {
        let msg = FsSlaveMsg::single(SlaveMsgFlags::MAP_W, fd_offset, gpa, len);
        self.io(&msg, fd)
    }

    fn request(&self, op: SlaveOp, msg: &FsSlaveMsg, fd: Option<i32>) -> io::Result<u64> {
        let mut buf = [0u8; REQUEST_SIZE];
        let header = SlaveRequestHeader {
            op: op as u32,
            padding: 0,
        };
        buf[..size_of::<SlaveRequestHeader>()].copy_from_slice(header.as_bytes());
        buf[size_of::<SlaveRequestHeader>()..].copy_from_slice(msg.as_bytes());

        let sock = self.sock.lock().unwrap();
        match fd {
            Some(fd) => {
                sock.send_with_fd(&buf[..], fd)
                    .map_err(|e| io::Error::from_raw_os_error(e.errno()))?;
            }
            None => {
                (&*sock).write_all(&buf)?;
            }
        }

        let mut reply = [0u8; 8];
        (&*sock).read_exact(&mut reply)?;
        let res = u64::from_ne_bytes(reply) as i64;
        if res < 0 {
            Err(io::Error::from_raw_os_error(-res as i32))
        } else {
            Ok(res as u64)
        }
    }
}
