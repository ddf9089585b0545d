// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hypervisor and store capabilities consumed by the backend.
//!
//! These traits are implemented by the embedding environment on top of the
//! real Xen interfaces (grant table, device model ops, event channels,
//! XenStore). The backend never issues hypercalls on its own.

use crate::ioreq::IoreqPage;
use std::ops::RangeInclusive;
use std::sync::Arc;
use thiserror::Error;

pub type DomainId = u16;
pub type GrantRef = u32;
pub type IoreqServerId = u16;
pub type EventPort = u32;

/// Grant table status code for a successful operation.
pub const GNTST_OKAY: i16 = 0;

#[derive(Debug, Error)]
pub enum HvError {
    #[error("hypercall failed with errno {0}")]
    Errno(i32),
    #[error("out of backend pages")]
    OutOfMemory,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store path {0} does not exist")]
    NotFound(String),
    #[error("store access to {path} failed")]
    Io {
        path: String,
        #[source]
        source: HvError,
    },
}

/// Handle returned by a successful grant mapping; needed to unmap it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GrantHandle(pub u32);

/// A run of contiguous backend pages that grants can be mapped into.
///
/// The pages are owned by whoever holds this value and must be returned with
/// [`Hypervisor::free_pages`].
#[derive(Debug, PartialEq, Eq)]
pub struct HostPages {
    base: usize,
    count: usize,
}

impl HostPages {
    /// # Safety
    /// `base` must point at `count` pages reserved for grant mappings that
    /// stay valid until the value is passed to [`Hypervisor::free_pages`].
    pub unsafe fn new(base: usize, count: usize) -> Self {
        Self { base, count }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// One entry of a batched `GNTTABOP_map_grant_ref`.
#[derive(Debug, Clone)]
pub struct GrantMapOp {
    pub host_addr: usize,
    pub domid: DomainId,
    pub gref: GrantRef,
    pub readonly: bool,
    /// Filled in by the hypervisor.
    pub status: i16,
    /// Filled in by the hypervisor when `status` is [`GNTST_OKAY`].
    pub handle: GrantHandle,
}

/// One entry of a batched `GNTTABOP_unmap_grant_ref`.
#[derive(Debug, Clone)]
pub struct GrantUnmapOp {
    pub host_addr: usize,
    pub handle: GrantHandle,
    /// Filled in by the hypervisor.
    pub status: i16,
}

/// Invoked from the event channel upcall, must not block.
pub type EventHandler = Box<dyn Fn() + Send + Sync>;

/// Invoked when a watched store path changes.
pub type WatchHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Hypervisor calls used by the backend.
pub trait Hypervisor: Send + Sync {
    /// Reserves backend pages to map grants into.
    fn alloc_pages(&self, count: usize) -> Result<HostPages, HvError>;
    fn free_pages(&self, pages: HostPages);

    /// Maps every op in one batch. Per-op results land in `status`/`handle`;
    /// `Err` means the batch itself was rejected.
    fn map_grant_refs(&self, ops: &mut [GrantMapOp]) -> Result<(), HvError>;
    fn unmap_grant_refs(&self, ops: &mut [GrantUnmapOp]) -> Result<(), HvError>;

    fn vcpu_count(&self, domid: DomainId) -> Result<u32, HvError>;

    fn create_ioreq_server(&self, domid: DomainId) -> Result<IoreqServerId, HvError>;
    fn map_mmio_range_to_ioreq_server(
        &self,
        domid: DomainId,
        server: IoreqServerId,
        range: RangeInclusive<u64>,
    ) -> Result<(), HvError>;
    fn set_ioreq_server_state(
        &self,
        domid: DomainId,
        server: IoreqServerId,
        enabled: bool,
    ) -> Result<(), HvError>;
    fn destroy_ioreq_server(&self, domid: DomainId, server: IoreqServerId);
    /// Maps the server's shared I/O-request page.
    fn acquire_ioreq_page(
        &self,
        domid: DomainId,
        server: IoreqServerId,
    ) -> Result<Arc<dyn IoreqPage>, HvError>;

    /// Binds a local port to `remote_port` of `domid`; `handler` runs on
    /// every upcall until the port is unbound.
    fn bind_interdomain(
        &self,
        domid: DomainId,
        remote_port: EventPort,
        handler: EventHandler,
    ) -> Result<EventPort, HvError>;
    fn unbind(&self, port: EventPort);
    /// Pending upcalls are delivered on the event thread, never on the
    /// caller's.
    fn unmask(&self, port: EventPort);
    fn notify(&self, port: EventPort);

    fn set_irq_level(&self, domid: DomainId, irq: u32, level: bool) -> Result<(), HvError>;
}

/// Hierarchical key/value store (XenStore).
pub trait XenStore: Send + Sync {
    fn directory(&self, path: &str) -> Result<Vec<String>, StoreError>;
    fn read(&self, path: &str) -> Result<String, StoreError>;
    /// Returns a token for [`XenStore::unwatch`].
    fn watch(&self, path: &str, handler: WatchHandler) -> Result<u64, StoreError>;
    fn unwatch(&self, token: u64);
}
