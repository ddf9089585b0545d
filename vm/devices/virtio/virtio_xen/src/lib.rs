// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! virtio-mmio device backend for Xen guests.
//!
//! The guest reaches the device registers through an I/O-request server and
//! hands out its rings and buffers as grant references (guest addresses with
//! bit 63 set). [`XenVirtioDevice`] emulates the registers, maps the granted
//! memory into the backend and reports ready queues and guest kicks to the
//! embedding device implementation.
//!
//! All hypervisor access goes through the [`Hypervisor`] and [`XenStore`]
//! traits.

mod bringup;
pub mod config;
mod device;
pub mod dispatch;
pub mod grant;
pub mod hypervisor;
pub mod ioreq;
pub mod iovec;
mod mmio;
pub mod queue;
pub mod spec;

#[cfg(test)]
mod testing;

pub use bringup::Backoff;
pub use bringup::BringupError;
pub use config::XenVirtioConfig;
pub use device::Frontend;
pub use device::ReadyCallback;
pub use device::XenVirtioDevice;
pub use dispatch::ThreadWorkQueue;
pub use dispatch::WorkQueue;
pub use hypervisor::Hypervisor;
pub use hypervisor::XenStore;
pub use iovec::IoVec;
pub use iovec::VirtqBuffer;
pub use mmio::DeviceState;
pub use queue::Virtq;
