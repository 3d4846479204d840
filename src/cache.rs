// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device-side DAX cache controller.
//!
//! Owns the fixed-size shared window that the guest sees as the device's
//! cache shared-memory region, and services the four slave RPCs the daemon
//! issues against it. The window starts out as anonymous `PROT_NONE` pages;
//! MAP splices file ranges over it with `MAP_SHARED | MAP_FIXED` and UNMAP
//! restores the anonymous mapping. All mutation happens on the single
//! thread running [`DaxCacheController::serve`]; concurrent guest reads
//! through the shared mapping are tolerated by design.

use std::cmp::min;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::ptr;

use log::debug;
use log::error;

use vm_memory::GuestAddress;
use vm_memory::GuestMemory;
use vm_memory::GuestMemoryMmap;
use vm_memory::GuestMemoryRegion;

use crate::slave::read_request;
use crate::slave::write_reply;
use crate::slave::FsSlaveMsg;
use crate::slave::SlaveMsgFlags;
use crate::slave::SlaveOp;
use crate::slave::SlaveRequest;
use crate::slave::FS_SLAVE_ENTRIES;
use crate::slave::FS_SLAVE_LEN_ALL;

fn neg_errno() -> i64 {
    -i64::from(
        io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO),
    )
}

/// The mmap'd cache window. Freed on drop.
struct Window {
    base: *mut u8,
    size: usize,
}

// Safe because the window is a process-private anonymous mapping and the
// controller is the only writer of its page tables.
unsafe impl Send for Window {}

impl Window {
    fn new(size: usize) -> io::Result<Window> {
        // Anonymous, private memory is not counted as overcommit.
        // Safe because this mapping does not overlay any existing memory
        // and the result is checked.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Window {
            base: base as *mut u8,
            size,
        })
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        // Safe because base/size describe a mapping we own.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

/// Services MAP/UNMAP/SYNC/IO against the cache window and guest memory.
pub struct DaxCacheController {
    window: Option<Window>,
    mem: GuestMemoryMmap,
    /// Guest-physical ranges published read-only (the version table); IO in
    /// the file-to-RAM direction faults on these.
    readonly: Vec<(u64, u64)>,
}

impl DaxCacheController {
    /// `cache_size == 0` disables the DAX window; the four RPCs then fail,
    /// except for the whole-cache UNMAP issued on unmount.
    pub fn new(cache_size: usize, mem: GuestMemoryMmap) -> io::Result<DaxCacheController> {
        let window = if cache_size == 0 {
            None
        } else {
            Some(Window::new(cache_size)?)
        };
        Ok(DaxCacheController {
            window,
            mem,
            readonly: Vec::new(),
        })
    }

    /// Records a guest-physical range as read-only for IO.
    pub fn add_readonly_region(&mut self, gpa: u64, len: u64) {
        self.readonly.push((gpa, len));
    }

    /// Host address of the cache window, for wiring it up as the guest's
    /// shared-memory region.
    pub fn window_base(&self) -> Option<*mut u8> {
        self.window.as_ref().map(|w| w.base)
    }

    pub fn window_size(&self) -> usize {
        self.window.as_ref().map_or(0, |w| w.size)
    }

    /// Reads framed requests off the back channel until the daemon hangs
    /// up, servicing each one.
    pub fn serve(&mut self, mut sock: UnixStream) -> io::Result<()> {
        while let Some(req) = read_request(&mut sock)? {
            let res = self.handle_request(req);
            write_reply(&mut sock, res)?;
        }
        Ok(())
    }

    /// Dispatches one decoded request, returning the wire result.
    pub fn handle_request(&mut self, req: SlaveRequest) -> u64 {
        let res = match req.op {
            SlaveOp::Map => match req.fd {
                Some(fd) => self.map(&req.msg, &fd),
                None => {
                    error!("map request without an fd");
                    -i64::from(libc::EBADF)
                }
            },
            SlaveOp::Unmap => self.unmap(&req.msg),
            SlaveOp::Sync => self.sync(&req.msg),
            SlaveOp::Io => match req.fd {
                Some(fd) => self.io(&req.msg, fd),
                None => {
                    error!("io request without an fd");
                    -i64::from(libc::EBADF)
                }
            },
        };
        res as u64
    }

    fn entry_in_window(&self, window: &Window, c_offset: u64, len: u64) -> bool {
        // Both overflow wrap and out-of-bounds are rejected.
        c_offset
            .checked_add(len)
            .map_or(false, |end| end <= window.size as u64)
    }

    fn map(&mut self, msg: &FsSlaveMsg, fd: &File) -> i64 {
        let window = match &self.window {
            Some(w) => w,
            None => {
                error!("map when DAX cache not present");
                return -i64::from(libc::EINVAL);
            }
        };

        let mut res: i64 = 0;
        for i in 0..FS_SLAVE_ENTRIES {
            let len = msg.len[i];
            if len == 0 {
                continue;
            }

            let c_offset = msg.c_offset[i];
            if !self.entry_in_window(window, c_offset, len) {
                error!("bad offset/len for map [{}] {:#x}+{:#x}", i, c_offset, len);
                res = -i64::from(libc::EINVAL);
                break;
            }

            let flags = SlaveMsgFlags::from_bits_truncate(msg.flags[i]);
            let mut prot = 0;
            if flags.contains(SlaveMsgFlags::MAP_R) {
                prot |= libc::PROT_READ;
            }
            if flags.contains(SlaveMsgFlags::MAP_W) {
                prot |= libc::PROT_WRITE;
            }

            // Safe because the target range was validated to lie wholly
            // inside the window this controller owns.
            let fd_offset = msg.fd_offset[i];
            let ptr = unsafe {
                libc::mmap(
                    window.base.add(c_offset as usize) as *mut libc::c_void,
                    len as usize,
                    prot,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    fd.as_raw_fd(),
                    fd_offset as libc::off_t,
                )
            };
            if ptr == libc::MAP_FAILED {
                res = neg_errno();
                error!(
                    "map failed [{}] {:#x}+{:#x} from {:#x}",
                    i, c_offset, len, fd_offset
                );
                break;
            }
        }

        if res != 0 {
            // Something went wrong, unmap them all.
            self.unmap(msg);
        }
        res
    }

    fn unmap(&mut self, msg: &FsSlaveMsg) -> i64 {
        let window = match &self.window {
            None => {
                // With the cache disabled there should be no unmap
                // requests, except the whole-range one sent on unmount.
                if msg.len[0] == FS_SLAVE_LEN_ALL {
                    return 0;
                }
                error!("unmap when DAX cache not present");
                return -i64::from(libc::EINVAL);
            }
            Some(w) => w,
        };

        // Even if one unmap fails the rest are attempted, to clean up as
        // much as possible.
        let mut res: i64 = 0;
        for i in 0..FS_SLAVE_ENTRIES {
            let mut len = msg.len[i];
            if len == 0 {
                continue;
            }

            if len == FS_SLAVE_LEN_ALL {
                len = window.size as u64;
            }

            let c_offset = msg.c_offset[i];
            if !self.entry_in_window(window, c_offset, len) {
                error!("bad offset/len for unmap [{}] {:#x}+{:#x}", i, c_offset, len);
                res = -i64::from(libc::EINVAL);
                continue;
            }

            // Safe because the target range was validated to lie wholly
            // inside the window this controller owns.
            let ptr = unsafe {
                libc::mmap(
                    window.base.add(c_offset as usize) as *mut libc::c_void,
                    len as usize,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                res = neg_errno();
                error!("unmap failed [{}] {:#x}+{:#x}", i, c_offset, len);
            }
        }

        res
    }

    fn sync(&self, msg: &FsSlaveMsg) -> i64 {
        let window = match &self.window {
            Some(w) => w,
            None => {
                error!("sync when DAX cache not present");
                return -i64::from(libc::EINVAL);
            }
        };

        // Per-entry failures are recorded but the rest are still synced.
        let mut res: i64 = 0;
        for i in 0..FS_SLAVE_ENTRIES {
            let len = msg.len[i];
            if len == 0 {
                continue;
            }

            let c_offset = msg.c_offset[i];
            if !self.entry_in_window(window, c_offset, len) {
                error!("bad offset/len for sync [{}] {:#x}+{:#x}", i, c_offset, len);
                res = -i64::from(libc::EINVAL);
                continue;
            }

            // Safe because the target range was validated to lie wholly
            // inside the window this controller owns.
            let ret = unsafe {
                libc::msync(
                    window.base.add(c_offset as usize) as *mut libc::c_void,
                    len as usize,
                    libc::MS_SYNC,
                )
            };
            if ret != 0 {
                res = neg_errno();
                error!("msync failed [{}] {:#x}+{:#x}", i, c_offset, len);
            }
        }

        res
    }

    fn gpa_is_readonly(&self, gpa: u64) -> bool {
        self.readonly
            .iter()
            .any(|&(start, len)| gpa >= start && gpa - start < len)
    }

    /// Transfers bytes between `fd` and guest physical memory, walking the
    /// target range one contiguous host slice at a time. Consumes (and so
    /// closes) `fd`.
    fn io(&self, msg: &FsSlaveMsg, fd: File) -> i64 {
        if self.window.is_none() {
            error!("io when DAX cache not present");
            return -i64::from(libc::EINVAL);
        }

        let mut res: i64 = 0;
        let mut done: u64 = 0;

        for i in 0..FS_SLAVE_ENTRIES {
            if res != 0 {
                break;
            }
            let mut len = msg.len[i];
            if len == 0 {
                continue;
            }

            let flags = SlaveMsgFlags::from_bits_truncate(msg.flags[i]);
            let mut gpa = msg.c_offset[i];
            let mut fd_offset = msg.fd_offset[i];

            while len > 0 && res == 0 {
                let addr = GuestAddress(gpa);
                let region = match self.mem.find_region(addr) {
                    Some(r) => r,
                    None => {
                        error!("no guest region found for {:#x}", gpa);
                        res = -i64::from(libc::EFAULT);
                        break;
                    }
                };
                let offset = gpa - region.start_addr().0;
                let chunk = min(region.len() - offset, len);
                let host = match region.get_host_address(vm_memory::MemoryRegionAddress(offset)) {
                    Ok(p) => p,
                    Err(_) => {
                        res = -i64::from(libc::EFAULT);
                        break;
                    }
                };

                let transferred = if flags.contains(SlaveMsgFlags::MAP_R) {
                    // Read from file into RAM.
                    if self.gpa_is_readonly(gpa) {
                        res = -i64::from(libc::EFAULT);
                        break;
                    }
                    // Safe because `host` points at `chunk` addressable
                    // bytes of the resolved guest region.
                    unsafe {
                        libc::pread64(
                            fd.as_raw_fd(),
                            host as *mut libc::c_void,
                            chunk as usize,
                            fd_offset as libc::off64_t,
                        )
                    }
                } else {
                    // Write into file from RAM.
                    assert!(flags.contains(SlaveMsgFlags::MAP_W));
                    // Safe because `host` points at `chunk` addressable
                    // bytes of the resolved guest region.
                    unsafe {
                        libc::pwrite64(
                            fd.as_raw_fd(),
                            host as *const libc::c_void,
                            chunk as usize,
                            fd_offset as libc::off64_t,
                        )
                    }
                };
                debug!("slave io [{}] gpa {:#x} chunk {} -> {}", i, gpa, chunk, transferred);

                if transferred < 0 {
                    res = neg_errno();
                    break;
                }
                if transferred == 0 {
                    // EOF.
                    break;
                }

                let transferred = transferred as u64;
                done += transferred;
                len -= transferred;
                gpa += transferred;
                fd_offset += transferred;
            }
        }
        // `fd` drops here; the device owns and closes its copy.

        if res < 0 {
            res
        } else {
            done as i64
        }
    }
}
