// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end transport scenarios driven through fake queue backends, a
//! real socketpair back-channel and real eventfd-based pumps.

use std::collections::VecDeque;
use std::io;
use std::io::Read;
use std::io::Write;
use std::mem::size_of;
use std::os::unix::net::UnixStream;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use vm_memory::Bytes;
use vm_memory::GuestAddress;
use vm_memory::GuestMemoryMmap;
use vmm_sys_util::eventfd::EventFd;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

use vhost_user_fs::cache::DaxCacheController;
use vhost_user_fs::queue::QueueInfo;
use vhost_user_fs::session::DeviceState;
use vhost_user_fs::session::FuseSession;
use vhost_user_fs::slave::SlaveChannel;
use vhost_user_fs::sys::InHeader;
use vhost_user_fs::sys::NotifyLockOut;
use vhost_user_fs::sys::Opcode;
use vhost_user_fs::sys::OutHeader;
use vhost_user_fs::sys::ReadIn;
use vhost_user_fs::sys::WriteIn;
use vhost_user_fs::worker::process_request;
use vhost_user_fs::worker::BufVec;
use vhost_user_fs::worker::FuseBuf;
use vhost_user_fs::Element;
use vhost_user_fs::IoSegment;
use vhost_user_fs::QueueBackend;
use vhost_user_fs::QueueHandle;
use vhost_user_fs::Request;

#[derive(Default)]
struct QueueState {
    avail: VecDeque<Element>,
    used: Vec<(u16, u32)>,
    notified: usize,
}

struct FakeQueue(Arc<Mutex<QueueState>>);

impl QueueBackend for FakeQueue {
    fn pop(&mut self) -> Option<Element> {
        self.0.lock().unwrap().avail.pop_front()
    }

    fn push(&mut self, index: u16, len: u32) {
        self.0.lock().unwrap().used.push((index, len));
    }

    fn notify(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().notified += 1;
        Ok(())
    }
}

fn fake_queue() -> (QueueHandle, Arc<Mutex<QueueState>>) {
    let state = Arc::new(Mutex::new(QueueState::default()));
    let handle: QueueHandle = Arc::new(Mutex::new(FakeQueue(Arc::clone(&state))));
    (handle, state)
}

type Handler = Box<dyn for<'a> Fn(BufVec<'a>, &mut Request) -> io::Result<()> + Send + Sync>;

struct TestSession {
    bufsize: usize,
    pool_size: usize,
    handler: Handler,
}

impl TestSession {
    fn new(handler: Handler) -> Arc<TestSession> {
        Arc::new(TestSession {
            bufsize: 64 * 1024,
            pool_size: 2,
            handler,
        })
    }
}

impl FuseSession for TestSession {
    fn buffer_size(&self) -> usize {
        self.bufsize
    }

    fn thread_pool_size(&self) -> usize {
        self.pool_size
    }

    fn exited(&self) -> bool {
        false
    }

    fn process(&self, bufv: BufVec, req: &mut Request) -> io::Result<()> {
        (self.handler)(bufv, req)
    }
}

fn device_state(session: Arc<TestSession>) -> Arc<DeviceState> {
    let _ = env_logger::builder().is_test(true).try_init();
    // The hook keeps fatal conditions observable as unwinds instead of
    // exiting the test binary.
    DeviceState::new(session, Some(Box::new(|_| {})))
}

fn in_header(opcode: Opcode, unique: u64, len: u32) -> InHeader {
    InHeader {
        len,
        opcode: opcode as u32,
        unique,
        ..Default::default()
    }
}

fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

// Scenario: tiny GETATTR. One 40-byte out segment, one 96-byte in
// segment; the session replies with 96 bytes and the element is pushed
// with that length.
#[test]
fn tiny_getattr_roundtrip() {
    let mut out_buf = InHeader::as_bytes(&in_header(Opcode::Getattr, 7, 40)).to_vec();
    let mut in_buf = vec![0u8; 96];

    let elem = Element {
        index: 3,
        out_segs: vec![IoSegment::from_mut_slice(&mut out_buf)],
        in_segs: vec![IoSegment::from_mut_slice(&mut in_buf)],
        bad_in_num: 0,
        bad_out_num: 0,
    };

    let session = TestSession::new(Box::new(|bufv: BufVec, req: &mut Request| {
        assert_eq!(bufv.bufs.len(), 1);
        match &bufv.bufs[0] {
            FuseBuf::Mem(m) => {
                let hdr = InHeader::read_from_prefix(*m).unwrap();
                assert_eq!(hdr.opcode, Opcode::Getattr as u32);
                assert_eq!(hdr.unique, 7);
                assert_eq!(m.len(), 40);
            }
            other => panic!("expected staged buffer, got {:?}", other),
        }

        let out = OutHeader {
            unique: 7,
            ..Default::default()
        };
        let attrs = [0x5au8; 80];
        req.send_reply_iov(out, &[&attrs])?;
        assert!(req.reply_sent());
        Ok(())
    }));

    let dev = device_state(session);
    let (vq, state) = fake_queue();
    process_request(&dev, &vq, elem);

    let state = state.lock().unwrap();
    assert_eq!(state.used, vec![(3, 96)]);
    assert_eq!(state.notified, 1);

    // The reply header landed in the sink with the rewritten length.
    let hdr = OutHeader::read_from_prefix(in_buf.as_slice()).unwrap();
    assert_eq!(hdr.len, 96);
    assert_eq!(hdr.unique, 7);
    assert_eq!(in_buf[16], 0x5a);
}

// Scenario: unmappable READ. The sink is four unmappable segments; the
// payload travels through the device IO back-channel into guest RAM.
#[test]
fn unmappable_read_via_backchannel() {
    let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
    let mut cache = DaxCacheController::new(1 << 20, mem.clone()).unwrap();
    let (client, server) = UnixStream::pair().unwrap();
    let device = thread::spawn(move || cache.serve(server).unwrap());

    let mut file = tempfile::tempfile().unwrap();
    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    file.write_all(&payload).unwrap();

    let mut out0 = InHeader::as_bytes(&in_header(Opcode::Read, 9, 80)).to_vec();
    let mut out1 = ReadIn {
        size: 8192,
        offset: 0,
        ..Default::default()
    }
    .as_bytes()
    .to_vec();
    let mut reply_hdr = vec![0u8; 16];

    let elem = Element {
        index: 11,
        out_segs: vec![
            IoSegment::from_mut_slice(&mut out0),
            IoSegment::from_mut_slice(&mut out1),
        ],
        in_segs: vec![
            IoSegment::from_mut_slice(&mut reply_hdr),
            // Guest physical addresses; the daemon never dereferences
            // these.
            IoSegment {
                addr: 0x1000,
                len: 2048,
            },
            IoSegment {
                addr: 0x1800,
                len: 2048,
            },
            IoSegment {
                addr: 0x2000,
                len: 2048,
            },
            IoSegment {
                addr: 0x2800,
                len: 2048,
            },
        ],
        bad_in_num: 4,
        bad_out_num: 0,
    };

    let file_for_session = file.try_clone().unwrap();
    let session = TestSession::new(Box::new(move |bufv: BufVec, req: &mut Request| {
        // The request was staged: both headers in one buffer.
        assert_eq!(bufv.bufs.len(), 1);
        let read_in = match &bufv.bufs[0] {
            FuseBuf::Mem(m) => {
                assert_eq!(m.len(), 80);
                ReadIn::read_from_prefix(&m[40..]).unwrap()
            }
            other => panic!("expected staged buffer, got {:?}", other),
        };
        assert_eq!(read_in.size, 8192);

        let out = OutHeader {
            unique: 9,
            ..Default::default()
        };
        req.send_reply_data_iov(out, &[], &file_for_session, read_in.offset, read_in.size as usize)
    }));

    let dev = device_state(session);
    dev.set_slave_channel(SlaveChannel::new(client));
    let (vq, state) = fake_queue();
    process_request(&dev, &vq, elem);

    {
        let state = state.lock().unwrap();
        assert_eq!(state.used, vec![(11, 16 + 8192)]);
        assert_eq!(state.notified, 1);
    }

    // The payload landed in guest RAM through the device.
    let mut got = vec![0u8; 8192];
    mem.read_slice(&mut got[..2048], GuestAddress(0x1000)).unwrap();
    mem.read_slice(&mut got[2048..4096], GuestAddress(0x1800)).unwrap();
    mem.read_slice(&mut got[4096..6144], GuestAddress(0x2000)).unwrap();
    mem.read_slice(&mut got[6144..], GuestAddress(0x2800)).unwrap();
    assert_eq!(got, payload);

    let hdr = OutHeader::read_from_prefix(reply_hdr.as_slice()).unwrap();
    assert_eq!(hdr.len as usize, 16 + 8192);

    drop(dev);
    device.join().unwrap();
}

// Scenario: fast-path WRITE. Headers are staged; the payload segments are
// handed to the session in place.
#[test]
fn write_fast_path_is_zero_copy() {
    let mut out0 = InHeader::as_bytes(&in_header(Opcode::Write, 21, 380)).to_vec();
    let mut out1 = WriteIn {
        size: 300,
        ..Default::default()
    }
    .as_bytes()
    .to_vec();
    let mut payload_a = vec![1u8; 100];
    let mut payload_b = vec![2u8; 100];
    let mut payload_c = vec![3u8; 100];
    let mut reply = vec![0u8; 24];

    let payload_addr = payload_a.as_ptr() as u64;

    let elem = Element {
        index: 5,
        out_segs: vec![
            IoSegment::from_mut_slice(&mut out0),
            IoSegment::from_mut_slice(&mut out1),
            IoSegment::from_mut_slice(&mut payload_a),
            IoSegment::from_mut_slice(&mut payload_b),
            IoSegment::from_mut_slice(&mut payload_c),
        ],
        in_segs: vec![IoSegment::from_mut_slice(&mut reply)],
        bad_in_num: 0,
        bad_out_num: 0,
    };

    let session = TestSession::new(Box::new(move |bufv: BufVec, req: &mut Request| {
        assert_eq!(bufv.bufs.len(), 4);
        match &bufv.bufs[0] {
            FuseBuf::Mem(m) => {
                assert_eq!(m.len(), 80);
                let w = WriteIn::read_from_prefix(&m[40..]).unwrap();
                assert_eq!(w.size, 300);
            }
            other => panic!("expected staged headers, got {:?}", other),
        }
        // The payload is guest memory, not a copy.
        match &bufv.bufs[1] {
            FuseBuf::Guest(seg) => {
                assert_eq!(seg.addr, payload_addr);
                assert_eq!(seg.len, 100);
            }
            other => panic!("expected in-place payload, got {:?}", other),
        }
        assert!(matches!(bufv.bufs[2], FuseBuf::Guest(_)));
        assert!(matches!(bufv.bufs[3], FuseBuf::Guest(_)));

        let out = OutHeader {
            unique: 21,
            ..Default::default()
        };
        let written = WriteIn {
            size: 300,
            ..Default::default()
        };
        req.send_reply_iov(out, &[&written.as_bytes()[..8]])
    }));

    let dev = device_state(session);
    let (vq, state) = fake_queue();
    process_request(&dev, &vq, elem);

    let state = state.lock().unwrap();
    assert_eq!(state.used, vec![(5, 24)]);
}

// Boundary: a WRITE with exactly two out segments takes the generic path.
#[test]
fn two_segment_write_takes_generic_path() {
    let mut out0 = InHeader::as_bytes(&in_header(Opcode::Write, 2, 80)).to_vec();
    let mut out1 = WriteIn::default().as_bytes().to_vec();
    let mut reply = vec![0u8; 24];

    let elem = Element {
        index: 0,
        out_segs: vec![
            IoSegment::from_mut_slice(&mut out0),
            IoSegment::from_mut_slice(&mut out1),
        ],
        in_segs: vec![IoSegment::from_mut_slice(&mut reply)],
        bad_in_num: 0,
        bad_out_num: 0,
    };

    let session = TestSession::new(Box::new(|bufv: BufVec, _req: &mut Request| {
        assert_eq!(bufv.bufs.len(), 1);
        assert!(matches!(bufv.bufs[0], FuseBuf::Mem(m) if m.len() == 80));
        Ok(())
    }));

    let dev = device_state(session);
    let (vq, state) = fake_queue();
    process_request(&dev, &vq, elem);

    // No reply was sent, so the element came back with zero length.
    let state = state.lock().unwrap();
    assert_eq!(state.used, vec![(0, 0)]);
    assert_eq!(state.notified, 1);
}

// Boundary: a reply that cannot fit the sink is an error for that request
// but the element is still recycled.
#[test]
fn oversized_reply_recycles_element() {
    let mut out_buf = InHeader::as_bytes(&in_header(Opcode::Getattr, 4, 40)).to_vec();
    // Sink is exactly one header; an 80-byte payload cannot fit.
    let mut in_buf = vec![0u8; 16];

    let elem = Element {
        index: 8,
        out_segs: vec![IoSegment::from_mut_slice(&mut out_buf)],
        in_segs: vec![IoSegment::from_mut_slice(&mut in_buf)],
        bad_in_num: 0,
        bad_out_num: 0,
    };

    let session = TestSession::new(Box::new(|_bufv: BufVec, req: &mut Request| {
        let out = OutHeader {
            unique: 4,
            ..Default::default()
        };
        let err = req.send_reply_iov(out, &[&[0u8; 80]]).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::E2BIG));
        assert!(!req.reply_sent());
        Ok(())
    }));

    let dev = device_state(session);
    let (vq, state) = fake_queue();
    process_request(&dev, &vq, elem);

    let state = state.lock().unwrap();
    assert_eq!(state.used, vec![(8, 0)]);
}

// An element with unmappable segments matching neither fast path is a
// protocol violation and hits the fatal hook.
#[test]
fn unhandled_unmappable_element_is_fatal() {
    let mut out0 = InHeader::as_bytes(&in_header(Opcode::Getattr, 1, 48)).to_vec();
    let mut reply = vec![0u8; 96];

    let elem = Element {
        index: 2,
        out_segs: vec![
            IoSegment::from_mut_slice(&mut out0),
            // An unmappable out segment no fast path accepts.
            IoSegment { addr: 0x9000, len: 8 },
        ],
        in_segs: vec![IoSegment::from_mut_slice(&mut reply)],
        bad_in_num: 0,
        bad_out_num: 1,
    };

    let session = TestSession::new(Box::new(|_bufv: BufVec, _req: &mut Request| {
        panic!("session must not see a malformed element");
    }));

    let hit = Arc::new(AtomicBool::new(false));
    let hook_hit = Arc::clone(&hit);
    let dev = DeviceState::new(
        session,
        Some(Box::new(move |_msg| {
            hook_hit.store(true, Ordering::SeqCst);
        })),
    );

    let (vq, state) = fake_queue();
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        process_request(&dev, &vq, elem);
    }));
    assert!(result.is_err());
    assert!(hit.load(Ordering::SeqCst));
    // Nothing was pushed; the condition is fatal, not per-request.
    assert!(state.lock().unwrap().used.is_empty());
}

// Scenario: queue kill. A pump blocked in ppoll terminates cleanly when
// its kill eventfd fires, after draining in-flight work.
#[test]
fn queue_kill_drains_and_joins() {
    let mut out_buf = InHeader::as_bytes(&in_header(Opcode::Getattr, 30, 40)).to_vec();
    let mut in_buf = vec![0u8; 32];

    let session = TestSession::new(Box::new(|_bufv: BufVec, req: &mut Request| {
        let out = OutHeader {
            unique: 30,
            ..Default::default()
        };
        req.send_reply_iov(out, &[])
    }));
    let dev = device_state(session);
    let (vq, state) = fake_queue();

    state.lock().unwrap().avail.push_back(Element {
        index: 1,
        out_segs: vec![IoSegment::from_mut_slice(&mut out_buf)],
        in_segs: vec![IoSegment::from_mut_slice(&mut in_buf)],
        bad_in_num: 0,
        bad_out_num: 0,
    });

    let kick = EventFd::new(0).unwrap();
    let kick_pump = kick.try_clone().unwrap();
    let qi = QueueInfo::start(Arc::clone(&dev), 0, vq, kick_pump, false).unwrap();

    kick.write(1).unwrap();
    wait_for(
        || state.lock().unwrap().used == vec![(1, 16)],
        "element to be processed",
    );

    // The pump is back in ppoll; kill must interrupt and join it.
    qi.stop();

    // Keep the element buffers alive until the pump is gone.
    drop(out_buf);
    drop(in_buf);
}

// The notification sender pops from queue 1, fills the sink and pushes;
// an empty notification queue means "no space".
#[test]
fn notification_send_paths() {
    let session = TestSession::new(Box::new(|_bufv: BufVec, _req: &mut Request| Ok(())));
    let dev = device_state(session);

    let out = OutHeader {
        unique: 0,
        ..Default::default()
    };
    let lock = NotifyLockOut::default();

    // Not negotiated yet.
    let err = dev.send_notify(out, &[lock.as_bytes()]).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EOPNOTSUPP));

    dev.set_notify_enabled(true);
    let (vq, state) = fake_queue();
    dev.set_queue(1, Some(vq));

    // Queue empty: no space for the notification.
    let err = dev.send_notify(out, &[lock.as_bytes()]).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));

    // With a buffer available the notification goes out.
    let mut sink = vec![0u8; 96];
    state.lock().unwrap().avail.push_back(Element {
        index: 6,
        out_segs: Vec::new(),
        in_segs: vec![IoSegment::from_mut_slice(&mut sink)],
        bad_in_num: 0,
        bad_out_num: 0,
    });
    dev.send_notify(out, &[lock.as_bytes()]).unwrap();

    let total = size_of::<OutHeader>() + size_of::<NotifyLockOut>();
    let state = state.lock().unwrap();
    assert_eq!(state.used, vec![(6, total as u32)]);

    let hdr = OutHeader::read_from_prefix(sink.as_slice()).unwrap();
    assert_eq!(hdr.len as usize, total);
    assert_eq!(hdr.unique, 0);
}

// A reply header with unique == 0 issued through the normal reply path is
// rerouted to the notification queue.
#[test]
fn reply_with_zero_unique_is_a_notification() {
    let mut out_buf = InHeader::as_bytes(&in_header(Opcode::Getattr, 40, 40)).to_vec();
    let mut in_buf = vec![0u8; 64];
    let mut notify_sink = vec![0u8; 64];

    let session = TestSession::new(Box::new(|_bufv: BufVec, req: &mut Request| {
        let out = OutHeader {
            unique: 0,
            ..Default::default()
        };
        req.send_reply_iov(out, &[b"lock state"])?;
        // The request itself still has no reply.
        assert!(!req.reply_sent());
        Ok(())
    }));
    let dev = device_state(session);
    dev.set_notify_enabled(true);

    let (notify_vq, notify_state) = fake_queue();
    dev.set_queue(1, Some(notify_vq));
    notify_state.lock().unwrap().avail.push_back(Element {
        index: 0,
        out_segs: Vec::new(),
        in_segs: vec![IoSegment::from_mut_slice(&mut notify_sink)],
        bad_in_num: 0,
        bad_out_num: 0,
    });

    let elem = Element {
        index: 9,
        out_segs: vec![IoSegment::from_mut_slice(&mut out_buf)],
        in_segs: vec![IoSegment::from_mut_slice(&mut in_buf)],
        bad_in_num: 0,
        bad_out_num: 0,
    };
    let (vq, state) = fake_queue();
    process_request(&dev, &vq, elem);

    // Notification delivered on queue 1.
    assert_eq!(
        notify_state.lock().unwrap().used,
        vec![(0, (size_of::<OutHeader>() + 10) as u32)]
    );
    // The request element was recycled with zero length.
    assert_eq!(state.lock().unwrap().used, vec![(9, 0)]);
}

// The full back channel: MAP splices a file page into the window, SYNC
// flushes it, UNMAP tears it down, all over the socketpair wire.
#[test]
fn map_sync_unmap_over_the_wire() {
    use vhost_user_fs::slave::FsSlaveMsg;
    use vhost_user_fs::slave::SlaveMsgFlags;
    use vhost_user_fs::slave::FS_SLAVE_LEN_ALL;

    let page = 4096u64;
    let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
    let mut cache = DaxCacheController::new(page as usize * 4, mem).unwrap();
    let window = cache.window_base().unwrap() as u64;

    let (client, server) = UnixStream::pair().unwrap();
    let device = thread::spawn(move || cache.serve(server).unwrap());
    let channel = SlaveChannel::new(client);

    let mut file = tempfile::tempfile().unwrap();
    let mut page_data = vec![0u8; page as usize];
    page_data[0] = 0xc3;
    file.write_all(&page_data).unwrap();

    let map = FsSlaveMsg::single(SlaveMsgFlags::MAP_R | SlaveMsgFlags::MAP_W, 0, 0, page);
    assert_eq!(channel.map(&map, &file).unwrap(), 0);
    // Safe because the window page is now a readable file mapping.
    assert_eq!(unsafe { *(window as *const u8) }, 0xc3);

    let sync = FsSlaveMsg::single(SlaveMsgFlags::empty(), 0, 0, page);
    assert_eq!(channel.sync(&sync).unwrap(), 0);

    // Out-of-bounds map fails without touching anything.
    let bad = FsSlaveMsg::single(SlaveMsgFlags::MAP_R, 0, page * 4, page);
    let err = channel.map(&bad, &file).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));

    let unmap = FsSlaveMsg::single(SlaveMsgFlags::empty(), 0, 0, FS_SLAVE_LEN_ALL);
    assert_eq!(channel.unmap(&unmap).unwrap(), 0);

    drop(channel);
    device.join().unwrap();
}

// Unmappable write payloads reach the file through the W-direction IO
// helper.
#[test]
fn write_from_guest_flushes_unmappable_payload() {
    let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
    mem.write_slice(b"dirty page", GuestAddress(0x3000)).unwrap();

    let mut cache = DaxCacheController::new(1 << 20, mem).unwrap();
    let (client, server) = UnixStream::pair().unwrap();
    let device = thread::spawn(move || cache.serve(server).unwrap());
    let channel = SlaveChannel::new(client);

    let file = tempfile::tempfile().unwrap();
    let n = channel
        .write_from_guest(&file, 0, 0x3000, 10)
        .unwrap();
    assert_eq!(n, 10);

    let mut contents = Vec::new();
    let mut reader = file.try_clone().unwrap();
    use std::io::Seek;
    reader.seek(std::io::SeekFrom::Start(0)).unwrap();
    reader.read_to_end(&mut contents).unwrap();
    assert_eq!(contents, b"dirty page");

    drop(channel);
    device.join().unwrap();
}

// EOF during a data reply shortens it and rewrites the header in place.
#[test]
fn data_reply_shortens_on_eof() {
    let mut out0 = InHeader::as_bytes(&in_header(Opcode::Read, 13, 80)).to_vec();
    let mut out1 = ReadIn {
        size: 4096,
        ..Default::default()
    }
    .as_bytes()
    .to_vec();
    let mut sink = vec![0u8; 16 + 4096];

    let elem = Element {
        index: 17,
        out_segs: vec![
            IoSegment::from_mut_slice(&mut out0),
            IoSegment::from_mut_slice(&mut out1),
        ],
        in_segs: vec![IoSegment::from_mut_slice(&mut sink)],
        bad_in_num: 0,
        bad_out_num: 0,
    };

    // Only 100 bytes exist in the file.
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&[7u8; 100]).unwrap();
    let file_for_session = file.try_clone().unwrap();

    let session = TestSession::new(Box::new(move |_bufv: BufVec, req: &mut Request| {
        let out = OutHeader {
            unique: 13,
            ..Default::default()
        };
        req.send_reply_data_iov(out, &[], &file_for_session, 0, 4096)
    }));

    let dev = device_state(session);
    let (vq, state) = fake_queue();
    process_request(&dev, &vq, elem);

    let state = state.lock().unwrap();
    assert_eq!(state.used, vec![(17, 16 + 100)]);

    let hdr = OutHeader::read_from_prefix(sink.as_slice()).unwrap();
    assert_eq!(hdr.len as usize, 16 + 100);
    assert_eq!(&sink[16..26], &[7u8; 10][..]);
}
