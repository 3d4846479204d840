// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The hypervisor-resident half of the device: property validation at
//! realize time, the vhost backend start/stop sequencing driven by guest
//! status writes, and ownership of the DAX cache controller.

use std::fs::File;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use log::error;
use remain::sorted;
use thiserror::Error;
use vm_memory::GuestMemoryMmap;
use zerocopy::AsBytes;

use virtio_bindings::virtio_config::VIRTIO_CONFIG_S_DRIVER_OK;

use crate::cache::DaxCacheController;
use crate::sys;
use crate::sys::virtio_fs_config;
use crate::sys::FS_MAX_TAG_LEN;
use crate::sys::VIRTQUEUE_MAX_SIZE;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    /// cache-size is nonzero but not a power of 2 at least one page long.
    #[error("cache-size property must be a power of 2 no smaller than the page size")]
    CacheBadSize,
    /// Allocating the DAX window failed.
    #[error("unable to mmap blank cache: {0}")]
    CreateCache(io::Error),
    /// The tag property is empty.
    #[error("tag property cannot be empty")]
    EmptyTag,
    /// No chardev was configured.
    #[error("missing chardev")]
    MissingChardev,
    /// num-request-queues is zero.
    #[error("num-request-queues property must be larger than 0")]
    NoRequestQueues,
    /// queue-size is not a power of 2.
    #[error("queue-size property must be a power of 2")]
    QueueSizeNotPow2,
    /// queue-size exceeds what the transport supports.
    #[error("queue-size property must be {VIRTQUEUE_MAX_SIZE} or smaller")]
    QueueSizeTooLarge,
    /// The tag does not fit the config space.
    #[error("tag property must be {FS_MAX_TAG_LEN} bytes or less")]
    TagTooLong,
    /// Opening or inspecting the version table failed.
    #[error("failed to open meta-data version table: {0}")]
    VersionTable(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Device properties, with the defaults the device model advertises.
pub struct FsDeviceConfig {
    /// Identifier of the character device connected to the daemon.
    pub chardev: Option<String>,
    /// Mount tag presented to the guest.
    pub tag: String,
    pub num_request_queues: u16,
    pub queue_size: u16,
    /// Pre-opened vhost fd, if the management layer hands one down.
    pub vhostfd: Option<i32>,
    /// DAX window size; zero disables DAX.
    pub cache_size: u64,
    /// Optional meta-data version table backing file.
    pub versiontable: Option<PathBuf>,
}

impl Default for FsDeviceConfig {
    fn default() -> FsDeviceConfig {
        FsDeviceConfig {
            chardev: None,
            tag: String::new(),
            num_request_queues: 1,
            queue_size: 128,
            vhostfd: None,
            cache_size: 1 << 30,
            versiontable: None,
        }
    }
}

fn page_size() -> u64 {
    // Safe because sysconf has no side effects.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

/// The vhost backend connection owned by this device.
pub trait VhostHandle {
    fn enable_notifiers(&mut self) -> io::Result<()>;
    fn disable_notifiers(&mut self);
    fn start(&mut self, acked_features: u64) -> io::Result<()>;
    fn stop(&mut self);
    /// Masks or unmasks the interrupt of vq `index`.
    fn mask_vq(&mut self, index: usize, mask: bool);
}

/// The virtio parent bus, used to install guest notifiers.
pub trait VirtioBus {
    fn set_guest_notifiers(&mut self, count: usize, assign: bool) -> io::Result<()>;
}

/// A realized vhost-user-fs device.
pub struct VhostUserFsDevice {
    conf: FsDeviceConfig,
    cache: DaxCacheController,
    mdvt: Option<(File, u64)>,
    acked_features: u64,
    started: bool,
}

impl VhostUserFsDevice {
    /// Validates the properties and allocates the cache window; the C
    /// equivalent fails realize on any violation.
    pub fn realize(conf: FsDeviceConfig, mem: GuestMemoryMmap) -> Result<VhostUserFsDevice> {
        if conf.chardev.is_none() {
            return Err(Error::MissingChardev);
        }
        if conf.tag.is_empty() {
            return Err(Error::EmptyTag);
        }
        if conf.tag.len() > FS_MAX_TAG_LEN {
            return Err(Error::TagTooLong);
        }
        if conf.num_request_queues == 0 {
            return Err(Error::NoRequestQueues);
        }
        if !conf.queue_size.is_power_of_two() {
            return Err(Error::QueueSizeNotPow2);
        }
        if conf.queue_size > VIRTQUEUE_MAX_SIZE {
            return Err(Error::QueueSizeTooLarge);
        }
        if conf.cache_size != 0
            && (!conf.cache_size.is_power_of_two() || conf.cache_size < page_size())
        {
            return Err(Error::CacheBadSize);
        }

        let mdvt = match &conf.versiontable {
            Some(path) => {
                let file = File::options()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(Error::VersionTable)?;
                let size = file.metadata().map_err(Error::VersionTable)?.len();
                Some((file, size))
            }
            None => None,
        };

        let cache =
            DaxCacheController::new(conf.cache_size as usize, mem).map_err(Error::CreateCache)?;

        Ok(VhostUserFsDevice {
            conf,
            cache,
            mdvt,
            acked_features: 0,
            started: false,
        })
    }

    /// Number of virtqueues: one hiprio queue plus the configured request
    /// queues.
    pub fn num_queues(&self) -> usize {
        1 + self.conf.num_request_queues as usize
    }

    pub fn queue_size(&self) -> u16 {
        self.conf.queue_size
    }

    pub fn cache(&mut self) -> &mut DaxCacheController {
        &mut self.cache
    }

    /// Shared-memory capabilities to publish: the cache window and, when
    /// configured, the read-only version table.
    pub fn shm_caps(&self) -> Vec<(u8, u64)> {
        let mut caps = Vec::new();
        if self.conf.cache_size != 0 {
            caps.push((sys::VIRTIO_FS_PCI_SHMCAP_ID_CACHE, self.conf.cache_size));
        }
        if let Some((_, size)) = &self.mdvt {
            caps.push((sys::VIRTIO_FS_PCI_SHMCAP_ID_VERTAB, *size));
        }
        caps
    }

    /// Records where the bus mapped the version table; the guest must not
    /// be able to write it, so IO into the range faults.
    pub fn set_version_table_gpa(&mut self, gpa: u64) {
        if let Some((_, size)) = &self.mdvt {
            let size = *size;
            self.cache.add_readonly_region(gpa, size);
        }
    }

    pub fn ack_features(&mut self, features: u64) {
        self.acked_features = features;
    }

    /// Fills the guest-visible config space.
    pub fn read_config(&self, offset: u64, data: &mut [u8]) {
        let mut cfg = virtio_fs_config::default();
        let tag = self.conf.tag.as_bytes();
        cfg.tag[..tag.len()].copy_from_slice(tag);
        cfg.num_request_queues = u32::from(self.conf.num_request_queues);

        let bytes = cfg.as_bytes();
        let offset = offset as usize;
        if offset < bytes.len() {
            let end = std::cmp::min(bytes.len(), offset + data.len());
            let len = end - offset;
            data[..len].copy_from_slice(&bytes[offset..end]);
        }
    }

    /// Runs the device end of the back channel until the daemon hangs up.
    pub fn serve_slave(&mut self, sock: UnixStream) -> io::Result<()> {
        self.cache.serve(sock)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// DRIVER_OK transitions toggle the vhost backend while the VM runs.
    pub fn set_status(
        &mut self,
        status: u8,
        vm_running: bool,
        vhost: &mut dyn VhostHandle,
        bus: &mut dyn VirtioBus,
    ) {
        let mut should_start = status & VIRTIO_CONFIG_S_DRIVER_OK as u8 != 0;
        if !vm_running {
            should_start = false;
        }

        if self.started == should_start {
            return;
        }

        if should_start {
            self.start(vhost, bus);
        } else {
            self.stop(vhost, bus);
        }
    }

    fn start(&mut self, vhost: &mut dyn VhostHandle, bus: &mut dyn VirtioBus) {
        let nvqs = self.num_queues();

        if let Err(e) = vhost.enable_notifiers() {
            error!("error enabling host notifiers: {}", e);
            return;
        }

        if let Err(e) = bus.set_guest_notifiers(nvqs, true) {
            error!("error binding guest notifier: {}", e);
            vhost.disable_notifiers();
            return;
        }

        if let Err(e) = vhost.start(self.acked_features) {
            error!("error starting vhost: {}", e);
            if let Err(e) = bus.set_guest_notifiers(nvqs, false) {
                error!("vhost guest notifier cleanup failed: {}", e);
            }
            vhost.disable_notifiers();
            return;
        }

        // guest_notifier_mask/pending is not used yet, so just unmask
        // everything here.
        for i in 0..nvqs {
            vhost.mask_vq(i, false);
        }

        self.started = true;
    }

    fn stop(&mut self, vhost: &mut dyn VhostHandle, bus: &mut dyn VirtioBus) {
        vhost.stop();

        if let Err(e) = bus.set_guest_notifiers(self.num_queues(), false) {
            error!("vhost guest notifier cleanup failed: {}", e);
            return;
        }

        vhost.disable_notifiers();
        self.started = false;
    }

    /// Forces the backend down and releases device state.
    pub fn unrealize(mut self, vhost: &mut dyn VhostHandle, bus: &mut dyn VirtioBus) {
        self.set_status(0, false, vhost, bus);
        // Cache window and version table fd are released on drop.
    }
}
