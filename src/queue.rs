// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-queue pump threads, created when the guest starts a queue and torn
//! down when it stops one.
//!
//! A pump blocks in `ppoll` on its kick and kill eventfds. Each kick is
//! drained, then all available elements are popped under the read side of
//! the dispatch lock plus the queue mutex and handed to the worker pool.
//! The notification queue gets a pump that consumes kicks but never pops:
//! that queue is filled by the daemon and consumed by the guest.

use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread;

use log::error;
use log::info;
use vmm_sys_util::eventfd::EventFd;

use crate::session::DeviceState;
use crate::tpool::ThreadPool;
use crate::transport::QueueHandle;
use crate::worker::process_request;

/// Queue 0 carries high-priority requests; it is pumped like any request
/// queue.
pub const HIPRIO_QUEUE_IDX: usize = 0;

/// Queue 1 is the guest-bound notification queue when the notification
/// feature is negotiated.
pub const NOTIFY_QUEUE_IDX: usize = 1;

/// Waits for a kick, draining the eventfd. Returns `false` when the pump
/// should terminate (kill event, poll error, or eventfd failure).
fn wait_for_kick(kick: &EventFd, kill: &EventFd, qidx: usize) -> bool {
    loop {
        let mut fds = [
            libc::pollfd {
                fd: kick.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: kill.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        // Safe because fds is a valid array of two owned pollfds for the
        // duration of the call.
        let ret = unsafe { libc::ppoll(fds.as_mut_ptr(), 2, std::ptr::null(), std::ptr::null()) };
        if ret < 0 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                info!("queue {}: ppoll interrupted, going around", qidx);
                continue;
            }
            error!("queue {}: ppoll: {}", qidx, e);
            return false;
        }

        if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            error!(
                "queue {}: unexpected poll revents {:#x}",
                qidx, fds[0].revents
            );
            return false;
        }
        if fds[1].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            error!(
                "queue {}: unexpected poll revents {:#x} on kill fd",
                qidx, fds[1].revents
            );
            return false;
        }
        if fds[1].revents != 0 {
            info!("queue {}: kill event, quitting", qidx);
            return false;
        }

        assert!(fds[0].revents & libc::POLLIN != 0);
        if let Err(e) = kick.read() {
            error!("queue {}: reading kick eventfd: {}", qidx, e);
            return false;
        }
        return true;
    }
}

fn queue_pump(dev: Arc<DeviceState>, qidx: usize, vq: QueueHandle, kick: EventFd, kill: EventFd) {
    let pool_size = dev.session.thread_pool_size().max(1);
    let mut pool = match ThreadPool::new(pool_size, &format!("fs_worker:{}", qidx)) {
        Ok(pool) => pool,
        Err(e) => {
            error!("queue {}: failed to create worker pool: {}", qidx, e);
            return;
        }
    };

    info!("queue {}: pump started", qidx);
    while wait_for_kick(&kick, &kill, qidx) {
        // Mutual exclusion with control-plane dispatch; the queue mutex
        // serializes against workers pushing replies.
        let _dispatch = dev.dispatch_lock.read().unwrap();
        let mut queue = vq.lock().unwrap();
        while let Some(elem) = queue.pop() {
            let dev = Arc::clone(&dev);
            let vq = vq.clone();
            pool.push(move || process_request(&dev, &vq, elem));
        }
    }

    // Let queued requests finish before the pump disappears.
    pool.shutdown();
    info!("queue {}: pump exited", qidx);
}

fn notify_pump(qidx: usize, kick: EventFd, kill: EventFd) {
    info!("queue {}: notification pump started", qidx);
    while wait_for_kick(&kick, &kill, qidx) {
        // Kicks only announce returned notification buffers; there is
        // nothing to pop here.
    }
    info!("queue {}: notification pump exited", qidx);
}

/// One started queue: its pump thread and the eventfd that terminates it.
pub struct QueueInfo {
    qidx: usize,
    thread: thread::JoinHandle<()>,
    kill: EventFd,
}

impl QueueInfo {
    /// Spawns the pump for queue `qidx`. `notify` selects the
    /// kick-draining variant used for the notification queue.
    pub fn start(
        dev: Arc<DeviceState>,
        qidx: usize,
        vq: QueueHandle,
        kick: EventFd,
        notify: bool,
    ) -> io::Result<QueueInfo> {
        let kill = EventFd::new(libc::EFD_CLOEXEC | libc::EFD_SEMAPHORE)?;
        let kill_pump = kill.try_clone()?;

        let thread = thread::Builder::new()
            .name(format!("fs_queue:{}", qidx))
            .spawn(move || {
                if notify {
                    notify_pump(qidx, kick, kill_pump);
                } else {
                    queue_pump(dev, qidx, vq, kick, kill_pump);
                }
            })?;

        Ok(QueueInfo { qidx, thread, kill })
    }

    /// Terminates and joins the pump; queued work drains first.
    pub fn stop(self) {
        if let Err(e) = self.kill.write(1) {
            error!("queue {}: writing kill eventfd: {}", self.qidx, e);
        }
        if self.thread.join().is_err() {
            error!("queue {}: pump thread panicked", self.qidx);
        }
    }
}
