// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-request handling: reconstructs a FUSE input buffer from a popped
//! descriptor-chain element, hands it to the session, and writes the reply
//! back into the element's sink segments.
//!
//! The guest cannot be trusted to leave a request alone while it is being
//! parsed, so headers are always inspected from a session-owned bounce
//! buffer, never in place.

use std::cmp::min;
use std::fs::File;
use std::io;
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use log::debug;
use log::error;
use log::warn;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::descriptor_utils::as_iovecs;
use crate::descriptor_utils::copy_between;
use crate::descriptor_utils::gather;
use crate::descriptor_utils::segments_len;
use crate::descriptor_utils::skip_front;
use crate::descriptor_utils::take_front;
use crate::descriptor_utils::IoSegment;
use crate::session::DeviceState;
use crate::slave::FsSlaveMsg;
use crate::slave::SlaveMsgFlags;
use crate::sys::InHeader;
use crate::sys::Opcode;
use crate::sys::OutHeader;
use crate::sys::ReadIn;
use crate::sys::WriteIn;
use crate::transport::Element;
use crate::transport::QueueHandle;

/// One entry of the buffer vector handed to the session.
#[derive(Debug)]
pub enum FuseBuf<'a> {
    /// Bytes staged in the bounce buffer.
    Mem(&'a [u8]),
    /// Mappable guest memory exposed in place, no copy.
    Guest(IoSegment),
    /// Guest physical memory only reachable through the device IO
    /// back-channel (`SlaveChannel::write_from_guest`).
    Phys(IoSegment),
}

/// The reconstructed input of one FUSE request.
#[derive(Debug)]
pub struct BufVec<'a> {
    pub bufs: Vec<FuseBuf<'a>>,
}

impl BufVec<'_> {
    /// Total payload length across all entries.
    pub fn len(&self) -> usize {
        self.bufs
            .iter()
            .map(|b| match b {
                FuseBuf::Mem(m) => m.len(),
                FuseBuf::Guest(s) | FuseBuf::Phys(s) => s.len,
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A descriptor-chain element being serviced, bound to its owning queue.
///
/// Owned by exactly one worker from pop to push; pushing returns the
/// element (and the guest memory it references) to the guest.
pub struct Request {
    dev: Arc<DeviceState>,
    vq: QueueHandle,
    elem: Element,
    reply_sent: bool,
}

impl Request {
    pub fn new(dev: Arc<DeviceState>, vq: QueueHandle, elem: Element) -> Request {
        Request {
            dev,
            vq,
            elem,
            reply_sent: false,
        }
    }

    pub fn element(&self) -> &Element {
        &self.elem
    }

    pub fn reply_sent(&self) -> bool {
        self.reply_sent
    }

    /// Sends a plain reply: the out header followed by `body`, gathered
    /// into the element's sink segments.
    ///
    /// A header with `unique == 0` is a notification and is rerouted to
    /// the notification queue.
    pub fn send_reply_iov(&mut self, mut out: OutHeader, body: &[&[u8]]) -> io::Result<()> {
        if out.unique == 0 {
            return self.dev.send_notify(out, body);
        }

        assert!(!self.reply_sent);

        let tosend_len = size_of::<OutHeader>() + body.iter().map(|b| b.len()).sum::<usize>();
        out.len = tosend_len as u32;

        let in_len = segments_len(&self.elem.in_segs);
        debug!(
            "reply: elem {}: with {} in desc of length {}",
            self.elem.index,
            self.elem.in_segs.len(),
            in_len
        );
        // The element should have room for the out header plus the data
        // its len field claims.
        if in_len < size_of::<OutHeader>() {
            error!("reply: elem {} too short for out header", self.elem.index);
            return Err(io::Error::from_raw_os_error(libc::E2BIG));
        }
        if in_len < tosend_len {
            error!(
                "reply: elem {} too small for data len {}",
                self.elem.index, tosend_len
            );
            return Err(io::Error::from_raw_os_error(libc::E2BIG));
        }
        // A plain reply must fit the mappable prefix; payloads aimed at the
        // unmappable tail take the data path instead.
        if segments_len(self.elem.in_writable()) < tosend_len {
            error!(
                "reply: elem {} payload overlaps unmappable tail",
                self.elem.index
            );
            return Err(io::Error::from_raw_os_error(libc::E2BIG));
        }

        let mut src = vec![IoSegment::from_slice(out.as_bytes())];
        src.extend(body.iter().map(|b| IoSegment::from_slice(b)));
        // Safe because the source segments reference live local buffers and
        // the writable sink length was validated above.
        unsafe { copy_between(&src, &self.elem.in_segs, tosend_len) };

        self.dev
            .push_and_notify(&self.vq, self.elem.index, tosend_len as u32);
        self.reply_sent = true;
        Ok(())
    }

    /// Sends a reply whose payload comes from `fd` at `pos`: the header
    /// (plus `body`) is copied into the sink, the file is read directly
    /// into the writable sink segments, and whatever the writable prefix
    /// cannot hold is delivered to the unmappable tail through the device
    /// IO back-channel. EOF shortens the reply, rewriting the header's
    /// `len` in place before the push.
    pub fn send_reply_data_iov(
        &mut self,
        mut out: OutHeader,
        body: &[&[u8]],
        fd: &File,
        pos: u64,
        len: usize,
    ) -> io::Result<()> {
        // unique == 0 is a notification, which never carries file data.
        assert_ne!(out.unique, 0);
        assert!(!self.reply_sent);

        let header_len = size_of::<OutHeader>() + body.iter().map(|b| b.len()).sum::<usize>();
        let mut tosend_len = header_len + len;
        out.len = tosend_len as u32;
        debug!(
            "data reply: elem {} header_len={} len={}",
            self.elem.index, header_len, len
        );

        let writable = self.elem.in_writable().to_vec();
        let in_len = segments_len(&self.elem.in_segs);
        let in_len_writable = segments_len(&writable);
        if in_len_writable < size_of::<OutHeader>() {
            error!("data reply: elem {} too short for out header", self.elem.index);
            return Err(io::Error::from_raw_os_error(libc::E2BIG));
        }
        if in_len < tosend_len {
            error!(
                "data reply: elem {} too small for data len {}",
                self.elem.index, tosend_len
            );
            return Err(io::Error::from_raw_os_error(libc::E2BIG));
        }
        if in_len_writable < header_len {
            error!(
                "data reply: elem {} headers overlap unmappable tail",
                self.elem.index
            );
            return Err(io::Error::from_raw_os_error(libc::E2BIG));
        }

        let mut src = vec![IoSegment::from_slice(out.as_bytes())];
        src.extend(body.iter().map(|b| IoSegment::from_slice(b)));
        // Safe because the source segments reference live local buffers and
        // the writable sink admits header_len bytes.
        unsafe { copy_between(&src, &writable, header_len) };

        // Read the file payload straight into the writable sink segments,
        // repeating on short reads with updated offsets.
        let mut data_segs = skip_front(&writable, header_len);
        let mut remaining = len;
        let mut file_pos = pos;
        while remaining > 0 {
            let segs = take_front(&data_segs, remaining);
            if segs.is_empty() {
                // Writable space exhausted; the rest belongs to the
                // unmappable tail below.
                break;
            }
            let iovs = as_iovecs(&segs);
            // Safe because the iovecs reference writable mapped guest
            // memory clipped to `remaining` bytes.
            let ret = unsafe {
                libc::preadv64(
                    fd.as_raw_fd(),
                    iovs.as_ptr(),
                    iovs.len() as libc::c_int,
                    file_pos as libc::off64_t,
                )
            };
            if ret < 0 {
                let e = io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(e);
            }
            if ret == 0 {
                // EOF.
                break;
            }
            let ret = ret as usize;
            debug!(
                "data reply: preadv transferred {} of {} remaining",
                ret, remaining
            );
            remaining -= ret;
            file_pos += ret as u64;
            data_segs = skip_front(&data_segs, ret);
        }

        // Bytes still owed land in the unmappable tail, one segment per IO
        // round trip, until satisfied or the device reports EOF.
        if remaining > 0 && self.elem.bad_in_num > 0 {
            let slave = self
                .dev
                .slave_channel()
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))?;

            let mut bad = self.elem.in_unmappable().to_vec();
            while remaining > 0 && !bad.is_empty() {
                let chunk = min(bad[0].len, remaining) as u64;
                let msg = FsSlaveMsg::single(SlaveMsgFlags::MAP_R, file_pos, bad[0].addr, chunk);
                debug!(
                    "data reply: unmappable chunk fd_offset={} gpa={:#x} len={}",
                    file_pos, bad[0].addr, chunk
                );
                match slave.io(&msg, fd)? {
                    0 => break,
                    n => {
                        let n = min(n as usize, remaining);
                        remaining -= n;
                        file_pos += n as u64;
                        bad = skip_front(&bad, n);
                    }
                }
            }
        }

        // Fix up the header len on EOF.
        if remaining > 0 {
            tosend_len -= remaining;
            out.len = tosend_len as u32;
            // Safe because the writable sink admits a full header, as
            // validated above.
            unsafe {
                copy_between(
                    &[IoSegment::from_slice(out.as_bytes())],
                    &writable,
                    size_of::<OutHeader>(),
                )
            };
        }

        self.dev
            .push_and_notify(&self.vq, self.elem.index, tosend_len as u32);
        self.reply_sent = true;
        Ok(())
    }
}

enum Plan {
    /// Headers staged in the bounce buffer, bulk payload exposed in place.
    WriteFastPath,
    /// The whole readable region staged in the bounce buffer.
    Generic,
}

/// Services one popped element: reconstructs the FUSE input, runs the
/// session, and guarantees exactly one push for the element.
pub fn process_request(dev: &Arc<DeviceState>, vq: &QueueHandle, elem: Element) {
    let session = Arc::clone(&dev.session);
    let bufsize = session.buffer_size();
    assert!(bufsize > size_of::<InHeader>());

    let out_segs = elem.out_segs.clone();
    let out_num = out_segs.len();
    let bad_in_num = elem.bad_in_num;
    let bad_out_num = elem.bad_out_num;
    let out_num_readable = out_num - bad_out_num;
    let out_len = segments_len(&out_segs);
    let out_len_readable = segments_len(&out_segs[..out_num_readable]);
    debug!(
        "elem {}: with {} out desc of length {} bad_in_num={} bad_out_num={}",
        elem.index, out_num, out_len, bad_in_num, bad_out_num
    );

    // The element should contain an input header plus the data its len
    // field claims; violations mean a malformed guest.
    if out_len_readable < size_of::<InHeader>() {
        dev.fatal(&format!("elem {}: too short for in header", elem.index));
    }
    if out_len > bufsize {
        dev.fatal(&format!("elem {}: too large for buffer", elem.index));
    }

    let mut bounce = vec![0u8; bufsize];
    // Copy just the first segment and look at it.
    // Safe because the readable segments reference mapped guest memory and
    // out_len fits the bounce buffer.
    unsafe { gather(&out_segs[..1], &mut bounce) };
    let opcode = InHeader::read_from_prefix(bounce.as_slice())
        .map(|h| h.opcode)
        .unwrap_or(0);

    let headers_shaped = |wanted: Opcode| {
        out_num >= 2
            && out_segs[0].len == size_of::<InHeader>()
            && opcode == wanted as u32
            && out_segs[1].len
                == match wanted {
                    Opcode::Write => size_of::<WriteIn>(),
                    _ => size_of::<ReadIn>(),
                }
    };

    let plan = if bad_in_num > 0 || bad_out_num > 0 {
        if out_num > 2 && out_num_readable >= 2 && bad_in_num == 0 && headers_shaped(Opcode::Write)
        {
            // Bulk write with an unmappable payload tail; the payload is
            // never staged.
            Plan::WriteFastPath
        } else if out_num == 2 && out_num_readable == 2 && bad_in_num > 0
            && headers_shaped(Opcode::Read)
        {
            // Read whose sink is unmappable; accepted now, serviced via
            // the IO back-channel at reply time.
            debug!(
                "unmappable read case in_num={} bad_in_num={}",
                elem.in_segs.len(),
                bad_in_num
            );
            Plan::Generic
        } else {
            dev.fatal(&format!(
                "unhandled unmappable element: out: {}(b:{}) in: {}(b:{})",
                out_num,
                bad_out_num,
                elem.in_segs.len(),
                bad_in_num
            ));
        }
    } else if out_num > 2 && headers_shaped(Opcode::Write) {
        // No need to stage the payload of a write; it is read straight out
        // of guest memory. The headers are still copied in case the guest
        // rewrites them mid-flight.
        debug!("write special case");
        Plan::WriteFastPath
    } else {
        Plan::Generic
    };

    let bufs: Vec<FuseBuf> = match plan {
        Plan::WriteFastPath => {
            let hdr_len = out_segs[0].len + out_segs[1].len;
            // Copy the write header after the input header.
            // Safe because segment 1 is mapped guest memory and the bounce
            // buffer admits both headers (out_len <= bufsize).
            unsafe { gather(&out_segs[1..2], &mut bounce[out_segs[0].len..hdr_len]) };

            let mut bufs = Vec::with_capacity(out_num - 1);
            bufs.push(FuseBuf::Mem(&bounce[..hdr_len]));
            for (idx, seg) in out_segs.iter().enumerate().skip(2) {
                if idx < out_num_readable {
                    bufs.push(FuseBuf::Guest(*seg));
                } else {
                    bufs.push(FuseBuf::Phys(*seg));
                }
            }
            bufs
        }
        Plan::Generic => {
            // Copy the rest of the request after the first segment.
            // Safe because the readable segments reference mapped guest
            // memory and out_len fits the bounce buffer.
            unsafe { gather(&out_segs[1..out_num_readable], &mut bounce[out_segs[0].len..]) };
            vec![FuseBuf::Mem(&bounce[..out_len_readable])]
        }
    };

    let mut req = Request::new(Arc::clone(dev), vq.clone(), elem);
    if let Err(e) = session.process(BufVec { bufs }, &mut req) {
        warn!("session failed to process request: {}", e);
    }

    // If the request has no reply, still recycle the element.
    if !req.reply_sent {
        debug!("elem {}: no reply sent", req.elem.index);
        dev.push_and_notify(&req.vq, req.elem.index, 0);
    }
}
