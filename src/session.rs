// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Session controller: owns the vhost-user control socket, drives the
//! dispatch loop, and reacts to queue start/stop callbacks from the
//! framing library. Also home of the shared daemon-side device state and
//! the notification sender.

use std::fs;
use std::io;
use std::io::Write;
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use log::debug;
use log::error;
use log::info;
use log::warn;
use remain::sorted;
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;
use zerocopy::AsBytes;

use virtio_bindings::virtio_config::VIRTIO_F_VERSION_1;

use crate::descriptor_utils::copy_between;
use crate::descriptor_utils::segments_len;
use crate::descriptor_utils::IoSegment;
use crate::queue::QueueInfo;
use crate::queue::NOTIFY_QUEUE_IDX;
use crate::slave::SlaveChannel;
use crate::sys;
use crate::sys::virtio_fs_config;
use crate::sys::OutHeader;
use crate::transport::DeviceIface;
use crate::transport::QueueHandle;
use crate::transport::Transport;
use crate::worker::Request;

/// Poison value installed in place of a real FUSE device fd so a stray use
/// of it fails loudly. Do not test for this value; test `is_virtio()`.
pub const POISON_FUSE_FD: i32 = 0xdaff0d11u32 as i32;

/// The FUSE file server behind this transport. Opcode semantics live
/// entirely on the other side of this seam.
pub trait FuseSession: Send + Sync + 'static {
    /// Size of the per-request bounce buffer. Must exceed the FUSE input
    /// header size.
    fn buffer_size(&self) -> usize;

    /// Number of worker threads each queue pump feeds.
    fn thread_pool_size(&self) -> usize;

    /// True once the session wants the dispatch loop to exit.
    fn exited(&self) -> bool;

    /// The guest acknowledged the notification feature.
    fn set_notify_enabled(&self, _enabled: bool) {}

    /// Handles one reconstructed FUSE request. Replies (zero or one) go
    /// through `req`; returning an error recycles the descriptor with a
    /// zero-length push.
    fn process(&self, bufv: crate::worker::BufVec, req: &mut Request) -> io::Result<()>;
}

type PanicHook = Box<dyn Fn(&str) + Send + Sync>;

/// Daemon-side state shared between the controller, the queue pumps and
/// the workers.
///
/// `dispatch_lock` serializes control-plane message handling (write side,
/// controller only) against data-plane queue access (read side, pumps and
/// workers): memory-table updates never observe in-flight ring mutation.
/// Correctness of ring access itself rests on the per-queue mutex inside
/// each `QueueHandle`.
pub struct DeviceState {
    pub session: Arc<dyn FuseSession>,
    pub dispatch_lock: RwLock<()>,
    queues: Mutex<Vec<Option<QueueHandle>>>,
    notify_enabled: AtomicBool,
    slave: Mutex<Option<Arc<SlaveChannel>>>,
    panic_hook: PanicHook,
}

impl DeviceState {
    pub fn new(session: Arc<dyn FuseSession>, panic_hook: Option<PanicHook>) -> Arc<DeviceState> {
        Arc::new(DeviceState {
            session,
            dispatch_lock: RwLock::new(()),
            queues: Mutex::new(Vec::new()),
            notify_enabled: AtomicBool::new(false),
            slave: Mutex::new(None),
            panic_hook: panic_hook.unwrap_or_else(|| Box::new(|_| process::exit(1))),
        })
    }

    pub fn notify_enabled(&self) -> bool {
        self.notify_enabled.load(Ordering::Acquire)
    }

    pub fn set_notify_enabled(&self, enabled: bool) {
        self.notify_enabled.store(enabled, Ordering::Release);
        self.session.set_notify_enabled(enabled);
    }

    /// Attaches the back-channel used to reach unmappable guest memory.
    pub fn set_slave_channel(&self, chan: SlaveChannel) {
        *self.slave.lock().unwrap() = Some(Arc::new(chan));
    }

    pub fn slave_channel(&self) -> Option<Arc<SlaveChannel>> {
        self.slave.lock().unwrap().clone()
    }

    pub fn queue(&self, qidx: usize) -> Option<QueueHandle> {
        self.queues.lock().unwrap().get(qidx).cloned().flatten()
    }

    /// Publishes (or withdraws) the live ring handle for queue `qidx`;
    /// called from the queue lifecycle callbacks.
    pub fn set_queue(&self, qidx: usize, vq: Option<QueueHandle>) {
        let mut queues = self.queues.lock().unwrap();
        if queues.len() <= qidx {
            queues.resize_with(qidx + 1, || None);
        }
        queues[qidx] = vq;
    }

    /// Unrecoverable protocol violation: log, run the hook, and abort the
    /// calling thread. The default hook exits the process.
    pub fn fatal(&self, msg: &str) -> ! {
        error!("{}", msg);
        (self.panic_hook)(msg);
        panic!("{}", msg);
    }

    /// Pushes `index` back to queue `qidx` with `len` bytes written and
    /// kicks the guest, under the read-side dispatch lock and the queue
    /// mutex.
    pub fn push_and_notify(&self, vq: &QueueHandle, index: u16, len: u32) {
        let _dispatch = self.dispatch_lock.read().unwrap();
        let mut queue = vq.lock().unwrap();
        queue.push(index, len);
        if let Err(e) = queue.notify() {
            error!("failed to notify used queue: {}", e);
        }
    }

    /// Sends a daemon-originated notification (`unique == 0`) through the
    /// notification queue.
    ///
    /// Fails with `ENOSPC` when the guest has not posted a buffer.
    // TODO(notify): buffer on a ring instead of failing when the queue is
    // empty.
    pub fn send_notify(&self, mut out: OutHeader, body: &[&[u8]]) -> io::Result<()> {
        assert_eq!(out.unique, 0);

        if !self.notify_enabled() {
            return Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP));
        }
        let vq = self
            .queue(NOTIFY_QUEUE_IDX)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))?;

        let elem = {
            let _dispatch = self.dispatch_lock.read().unwrap();
            let mut queue = vq.lock().unwrap();
            queue.pop()
        }
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOSPC))?;

        let tosend_len = size_of::<OutHeader>() + body.iter().map(|b| b.len()).sum::<usize>();
        out.len = tosend_len as u32;

        let in_len = segments_len(&elem.in_segs);
        debug!(
            "notify: elem {} with {} in desc of length {}",
            elem.index,
            elem.in_segs.len(),
            in_len
        );
        if in_len < size_of::<OutHeader>() || in_len < tosend_len {
            error!("notify: elem {} too small for data len {}", elem.index, tosend_len);
            // Still recycle the element so the guest gets it back.
            self.push_and_notify(&vq, elem.index, 0);
            return Err(io::Error::from_raw_os_error(libc::E2BIG));
        }

        let mut src = vec![IoSegment::from_slice(out.as_bytes())];
        src.extend(body.iter().map(|b| IoSegment::from_slice(b)));
        // Safe because the source segments reference live local buffers and
        // the sink length was validated against tosend_len above.
        unsafe { copy_between(&src, &elem.in_segs, tosend_len) };

        self.push_and_notify(&vq, elem.index, tosend_len as u32);
        Ok(())
    }
}

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to accept the vhost-user connection.
    #[error("failed to accept vhost-user connection: {0}")]
    AcceptConnection(io::Error),
    /// Failed to bind the vhost-user listening socket.
    #[error("failed to bind vhost-user socket: {0}")]
    BindSocket(io::Error),
    /// Failed to create the listening directory.
    #[error("failed to create socket directory: {0}")]
    CreateSocketDir(io::Error),
    /// Control-message dispatch failed.
    #[error("vhost-user dispatch failed: {0}")]
    Dispatch(io::Error),
    /// Polling the vhost-user socket failed.
    #[error("failed to poll vhost-user socket: {0}")]
    PollSocket(io::Error),
    /// The socket lock file is held by another daemon or unwritable.
    #[error("failed to lock socket pid file {0:?}: {1}")]
    SocketLock(PathBuf, io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Writes and flocks the pid file derived from `socket_path` (slashes
/// become dots, suffix `.pid`) under `state_dir`.
fn lock_socket(state_dir: &Path, socket_path: &Path) -> Result<fs::File> {
    fs::create_dir_all(state_dir).map_err(Error::CreateSocketDir)?;

    let name = socket_path
        .to_string_lossy()
        .replace('/', ".");
    let lock_path = state_dir.join(format!("{}.pid", name));

    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| Error::SocketLock(lock_path.clone(), e))?;

    // Safe because the fd is owned by `file` and LOCK_NB cannot block.
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret < 0 {
        return Err(Error::SocketLock(lock_path, io::Error::last_os_error()));
    }

    file.set_len(0)
        .and_then(|_| writeln!(file, "{}", process::id()))
        .map_err(|e| Error::SocketLock(lock_path, e))?;
    Ok(file)
}

/// Configuration of the daemon-side session controller.
pub struct SessionConfig {
    /// Path of the vhost-user control socket to listen on.
    pub socket_path: PathBuf,
    /// Directory the socket pid-lock file is written under.
    pub state_dir: PathBuf,
}

/// Owns the control socket and runs the vhost-user dispatch loop.
///
/// Exactly one VMM connection is accepted; the listener is closed right
/// after. Queue lifecycle callbacks from the transport arrive through the
/// [`DeviceIface`] implementation while `run` holds the write side of the
/// dispatch lock.
pub struct SessionController {
    dev: Arc<DeviceState>,
    queues: Vec<Option<QueueInfo>>,
    /// While held, no other daemon can claim our socket path.
    _socket_lock: fs::File,
    /// Replaces the FUSE device fd of a traditional mount; poisoned so
    /// misuse is visible.
    fuse_fd: i32,
}

impl SessionController {
    /// Creates the listening socket, writes the pid-lock file and waits
    /// for the VMM to connect. Returns the controller and the accepted
    /// connection for the caller to wrap in its transport.
    pub fn bind(
        cfg: &SessionConfig,
        dev: Arc<DeviceState>,
    ) -> Result<(SessionController, std::os::unix::net::UnixStream)> {
        let socket_lock = lock_socket(&cfg.state_dir, &cfg.socket_path)?;

        // Stale socket from a previous run; the pid lock protects us from
        // a live one.
        let _ = fs::remove_file(&cfg.socket_path);
        let listener = UnixListener::bind(&cfg.socket_path).map_err(Error::BindSocket)?;

        info!("waiting for vhost-user socket connection...");
        let (conn, _) = listener.accept().map_err(Error::AcceptConnection)?;
        info!("received vhost-user socket connection");
        drop(listener);

        Ok((
            SessionController {
                dev,
                queues: Vec::new(),
                _socket_lock: socket_lock,
                fuse_fd: POISON_FUSE_FD,
            },
            conn,
        ))
    }

    pub fn device(&self) -> &Arc<DeviceState> {
        &self.dev
    }

    /// True when this session speaks virtio rather than /dev/fuse. Callers
    /// must use this rather than inspecting `fuse_fd`.
    pub fn is_virtio(&self) -> bool {
        true
    }

    /// The (poisoned) FUSE device fd slot kept for parity with a
    /// /dev/fuse mount.
    pub fn fuse_fd(&self) -> i32 {
        self.fuse_fd
    }

    /// Dispatch loop: waits for control messages on the vhost-user socket
    /// and handles each under the write side of the dispatch lock, which
    /// excludes all queue pumps and workers for the duration.
    pub fn run<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        while !self.dev.session.exited() {
            let mut pollfd = libc::pollfd {
                fd: transport.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };

            // Safe because pollfd is a valid, owned struct for the call.
            let ret = unsafe { libc::ppoll(&mut pollfd, 1, std::ptr::null(), std::ptr::null()) };
            if ret < 0 {
                let e = io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::EINTR) {
                    info!("ppoll interrupted, going around");
                    continue;
                }
                return Err(Error::PollSocket(e));
            }
            if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                error!("unexpected poll revents {:#x}", pollfd.revents);
                break;
            }

            let ok = {
                let _dispatch = self.dev.dispatch_lock.write().unwrap();
                let mut iface = IfaceAdapter {
                    dev: &self.dev,
                    queues: &mut self.queues,
                };
                transport.dispatch(&mut iface).map_err(Error::Dispatch)?
            };
            if !ok {
                info!("vhost-user peer closed the connection");
                break;
            }
        }

        self.stop_queues();
        Ok(())
    }

    fn stop_queues(&mut self) {
        for qidx in 0..self.queues.len() {
            if self.queues[qidx].is_some() {
                let mut iface = IfaceAdapter {
                    dev: &self.dev,
                    queues: &mut self.queues,
                };
                iface.queue_stopped(qidx);
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop_queues();
    }
}

/// The callback table handed to the framing library. Split from the
/// controller so `run` can lend the queue table mutably while it owns the
/// dispatch write lock.
struct IfaceAdapter<'a> {
    dev: &'a Arc<DeviceState>,
    queues: &'a mut Vec<Option<QueueInfo>>,
}

impl DeviceIface for IfaceAdapter<'_> {
    fn get_features(&self) -> u64 {
        1 << VIRTIO_F_VERSION_1
            | 1 << sys::VIRTIO_FS_F_NOTIFICATION
            | 1 << sys::VHOST_USER_F_PROTOCOL_FEATURES
    }

    fn set_features(&mut self, features: u64) {
        if features & (1 << sys::VIRTIO_FS_F_NOTIFICATION) != 0 {
            self.dev.set_notify_enabled(true);
        }
    }

    fn get_protocol_features(&self) -> u64 {
        1 << sys::VHOST_USER_PROTOCOL_F_CONFIG
    }

    fn get_config(&self, offset: u64, data: &mut [u8]) {
        // Only notification related to locks is supported; as more
        // notification types appear, bump up the size accordingly.
        let mut cfg = virtio_fs_config::default();
        cfg.notify_buf_size = size_of::<sys::NotifyLockOut>() as u32;

        let bytes = cfg.as_bytes();
        let offset = offset as usize;
        if offset < bytes.len() {
            let end = std::cmp::min(bytes.len(), offset + data.len());
            let len = end - offset;
            data[..len].copy_from_slice(&bytes[offset..end]);
        }
    }

    fn queue_started(&mut self, qidx: usize, vq: QueueHandle, kick: EventFd) {
        info!("queue {} started", qidx);

        // Additional request queues are refused until the file server is
        // audited for thread-safety with multiple queues.
        let mut valid_queues = 2; // One hiprio queue and one request queue.
        if self.dev.notify_enabled() {
            valid_queues += 1;
        }
        if qidx >= valid_queues {
            self.dev.fatal(
                "multiple request queues not yet implemented, please configure 1 request queue",
            );
        }

        if self.queues.len() <= qidx {
            self.queues.resize_with(qidx + 1, || None);
        }
        if self.queues[qidx].is_some() {
            self.dev.fatal("queue started twice");
        }

        self.dev.set_queue(qidx, Some(vq.clone()));

        let notify_pump = self.dev.notify_enabled() && qidx == NOTIFY_QUEUE_IDX;
        match QueueInfo::start(Arc::clone(self.dev), qidx, vq, kick, notify_pump) {
            Ok(qi) => self.queues[qidx] = Some(qi),
            Err(e) => {
                error!("failed to start thread for queue {}: {}", qidx, e);
                self.dev.fatal("queue thread creation failed");
            }
        }
    }

    fn queue_stopped(&mut self, qidx: usize) {
        info!("queue {} stopped", qidx);

        let qi = match self.queues.get_mut(qidx).and_then(Option::take) {
            Some(qi) => qi,
            None => {
                warn!("stop for queue {} which is not running", qidx);
                return;
            }
        };
        self.dev.set_queue(qidx, None);
        qi.stop();
    }
}
