// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Core of a vhost-user filesystem transport.
//!
//! The daemon side pumps virtqueues on behalf of a user-space FUSE file
//! server: control messages arrive on the vhost-user socket, per-queue
//! threads pop descriptor-chain elements, a worker pool reconstructs FUSE
//! requests from guest memory and writes replies back into the
//! guest-supplied segments. Guest pages the daemon cannot map are reached
//! through a back-channel to the device side, whose DAX cache controller
//! owns a fixed shared window of host memory and services MAP, UNMAP,
//! SYNC and IO requests against it.
//!
//! FUSE opcode semantics and the vhost-user message framing are external
//! collaborators, consumed through the seams in [`session::FuseSession`]
//! and [`transport`].

pub mod cache;
pub mod descriptor_utils;
pub mod device;
pub mod queue;
pub mod session;
pub mod slave;
pub mod sys;
pub mod tpool;
pub mod transport;
pub mod worker;

pub use cache::DaxCacheController;
pub use descriptor_utils::IoSegment;
pub use device::FsDeviceConfig;
pub use device::VhostUserFsDevice;
pub use session::DeviceState;
pub use session::FuseSession;
pub use session::SessionConfig;
pub use session::SessionController;
pub use slave::FsSlaveMsg;
pub use slave::SlaveChannel;
pub use slave::SlaveMsgFlags;
pub use transport::DeviceIface;
pub use transport::Element;
pub use transport::QueueBackend;
pub use transport::QueueHandle;
pub use transport::Transport;
pub use worker::BufVec;
pub use worker::FuseBuf;
pub use worker::Request;
