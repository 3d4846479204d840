// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire structures shared between the guest FUSE driver, the daemon and the
//! device model. Everything here is host byte order; see the transport
//! documentation for why no swapping is performed.

use enumn::N;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/// Feature bit advertised when the notification queue is supported.
/// Defined in kernel/include/uapi/linux/virtio_fs.h.
pub const VIRTIO_FS_F_NOTIFICATION: u64 = 0;

/// vhost-user feature bit gating the protocol-feature handshake.
pub const VHOST_USER_F_PROTOCOL_FEATURES: u64 = 30;

/// vhost-user protocol feature bit for config-space access.
pub const VHOST_USER_PROTOCOL_F_CONFIG: u64 = 9;

/// For the id field in virtio_pci_shm_cap.
pub const VIRTIO_FS_PCI_SHMCAP_ID_CACHE: u8 = 0;
pub const VIRTIO_FS_PCI_SHMCAP_ID_VERTAB: u8 = 1;

/// The maximum allowable length of the tag used to identify a specific
/// virtio-fs device.
pub const FS_MAX_TAG_LEN: usize = 36;

/// Largest queue size the transport will accept.
pub const VIRTQUEUE_MAX_SIZE: u16 = 1024;

/// kernel/include/uapi/linux/virtio_fs.h
#[allow(non_camel_case_types)]
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, AsBytes, FromZeroes, FromBytes)]
pub struct virtio_fs_config {
    /// Filesystem name (UTF-8, not NUL-terminated, padded with NULs)
    pub tag: [u8; FS_MAX_TAG_LEN],
    /// Number of request queues
    pub num_request_queues: u32,
    /// Size of notification buffer
    pub notify_buf_size: u32,
}

impl Default for virtio_fs_config {
    fn default() -> Self {
        virtio_fs_config {
            tag: [0u8; FS_MAX_TAG_LEN],
            num_request_queues: 0,
            notify_buf_size: 0,
        }
    }
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, N)]
pub enum Opcode {
    Lookup = 1,
    Forget = 2, /* No Reply */
    Getattr = 3,
    Setattr = 4,
    Readlink = 5,
    Symlink = 6,
    Mknod = 8,
    Mkdir = 9,
    Unlink = 10,
    Rmdir = 11,
    Rename = 12,
    Link = 13,
    Open = 14,
    Read = 15,
    Write = 16,
    Statfs = 17,
    Release = 18,
    Fsync = 20,
    Setxattr = 21,
    Getxattr = 22,
    Listxattr = 23,
    Removexattr = 24,
    Flush = 25,
    Init = 26,
    Opendir = 27,
    Readdir = 28,
    Releasedir = 29,
    Fsyncdir = 30,
    Getlk = 31,
    Setlk = 32,
    Setlkw = 33,
    Access = 34,
    Create = 35,
    Interrupt = 36,
    Bmap = 37,
    Destroy = 38,
    Ioctl = 39,
    Poll = 40,
    NotifyReply = 41,
    BatchForget = 42,
    Fallocate = 43,
    Readdirplus = 44,
    Rename2 = 45,
    Lseek = 46,
    CopyFileRange = 47,
    SetUpMapping = 48,
    RemoveMapping = 49,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, AsBytes, FromZeroes, FromBytes)]
pub struct InHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, AsBytes, FromZeroes, FromBytes)]
pub struct OutHeader {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, AsBytes, FromZeroes, FromBytes)]
pub struct ReadIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub read_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, AsBytes, FromZeroes, FromBytes)]
pub struct WriteIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub write_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, AsBytes, FromZeroes, FromBytes)]
pub struct FileLock {
    pub start: u64,
    pub end: u64,
    pub type_: u32,
    pub pid: u32, /* tgid */
}

/// As of now only the lock notification is supported; as more notification
/// types appear, `notify_buf_size` in the device config must grow with the
/// largest of them.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, AsBytes, FromZeroes, FromBytes)]
pub struct NotifyLockOut {
    pub unique: u64,
    pub error: i32,
    pub padding: i32,
    pub lock: FileLock,
}
