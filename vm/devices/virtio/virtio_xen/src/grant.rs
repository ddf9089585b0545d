// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mapping of guest-granted pages into backend memory.

use crate::hypervisor::DomainId;
use crate::hypervisor::GrantHandle;
use crate::hypervisor::GrantMapOp;
use crate::hypervisor::GrantUnmapOp;
use crate::hypervisor::HostPages;
use crate::hypervisor::HvError;
use crate::hypervisor::Hypervisor;
use crate::hypervisor::GNTST_OKAY;
use crate::spec::grant::grant_ref;
use crate::spec::grant::is_grant_range;
use crate::spec::grant::page_count;
use crate::spec::grant::page_offset;
use crate::spec::grant::XEN_PAGE_SIZE;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MapError {
    #[error("failed to allocate {0} backend pages")]
    Alloc(usize, #[source] HvError),
    #[error("grant map hypercall failed")]
    Hypercall(#[source] HvError),
    #[error("mapping grant {gref:#x} failed with status {status}")]
    Status { gref: u32, status: i16 },
    #[error("{len:#x} bytes at {gpa:#x} do not name valid grant references")]
    InvalidGrant { gpa: u64, len: u64 },
}

/// Backend view of one run of consecutive guest-granted pages.
///
/// The backend pages are allocated on first use and kept across mappings as
/// long as later runs fit into them.
#[derive(Debug, Default)]
pub struct MappedPage {
    gpa: u64,
    buffer: Option<HostPages>,
    pages: usize,
    handles: Vec<Option<GrantHandle>>,
    map_count: usize,
}

impl MappedPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant-encoded guest address of the current mapping.
    pub fn gpa(&self) -> u64 {
        self.gpa
    }

    /// Base of the backend pages, if allocated.
    pub fn base(&self) -> Option<usize> {
        self.buffer.as_ref().map(HostPages::base)
    }

    /// Number of backend pages allocated.
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, HostPages::count)
    }

    /// Bytes covered by the current mapping.
    pub fn len(&self) -> usize {
        self.pages * XEN_PAGE_SIZE as usize
    }

    pub fn map_count(&self) -> usize {
        self.map_count
    }

    pub fn is_mapped(&self) -> bool {
        self.map_count != 0
    }

    /// Backend address of the mapped guest address, including its offset in
    /// the first page.
    pub fn host_address(&self) -> Option<usize> {
        if !self.is_mapped() {
            return None;
        }
        self.base().map(|base| base + page_offset(self.gpa) as usize)
    }
}

/// One grant run to map as part of a batch.
pub struct MapRequest<'a> {
    pub page: &'a mut MappedPage,
    /// Grant-encoded guest address.
    pub gpa: u64,
    pub len: u64,
    pub writable: bool,
}

pub struct GrantMapper {
    hv: Arc<dyn Hypervisor>,
}

impl GrantMapper {
    pub fn new(hv: Arc<dyn Hypervisor>) -> Self {
        Self { hv }
    }

    /// Maps all requests with a single hypercall.
    ///
    /// Either every page of every request ends up mapped, or none does.
    pub fn map(&self, domid: DomainId, requests: &mut [MapRequest<'_>]) -> Result<(), MapError> {
        if let Some(req) = requests.iter().find(|req| !is_grant_range(req.gpa, req.len)) {
            return Err(MapError::InvalidGrant {
                gpa: req.gpa,
                len: req.len,
            });
        }
        for req in requests.iter_mut() {
            if req.page.is_mapped() {
                self.unmap(req.page);
            }
            let pages = page_count(req.gpa, req.len);
            if req.page.capacity() < pages {
                self.release_buffer(req.page);
                let buffer = self
                    .hv
                    .alloc_pages(pages)
                    .map_err(|err| MapError::Alloc(pages, err))?;
                req.page.buffer = Some(buffer);
            }
        }

        let mut ops = Vec::new();
        for req in requests.iter() {
            let base = req.page.base().unwrap_or_default();
            for i in 0..page_count(req.gpa, req.len) {
                let gref = grant_ref(req.gpa)
                    .and_then(|first| first.checked_add(u32::try_from(i).ok()?))
                    .ok_or(MapError::InvalidGrant {
                        gpa: req.gpa,
                        len: req.len,
                    })?;
                ops.push(GrantMapOp {
                    host_addr: base + i * XEN_PAGE_SIZE as usize,
                    domid,
                    gref,
                    readonly: !req.writable,
                    status: GNTST_OKAY,
                    handle: GrantHandle(0),
                });
            }
        }
        if ops.is_empty() {
            return Ok(());
        }

        let result = self.hv.map_grant_refs(&mut ops);
        let batch_ok = result.is_ok();
        let failed = match result {
            Err(err) => Some(MapError::Hypercall(err)),
            Ok(()) => ops
                .iter()
                .find(|op| op.status != GNTST_OKAY)
                .map(|op| MapError::Status {
                    gref: op.gref,
                    status: op.status,
                }),
        };
        if let Some(err) = failed {
            // Only the ops that reported success hold a handle.
            let mut undo: Vec<_> = ops
                .iter()
                .filter(|op| batch_ok && op.status == GNTST_OKAY)
                .map(|op| GrantUnmapOp {
                    host_addr: op.host_addr,
                    handle: op.handle,
                    status: GNTST_OKAY,
                })
                .collect();
            self.unmap_ops(&mut undo);
            return Err(err);
        }

        let mut ops = ops.into_iter();
        for req in requests.iter_mut() {
            let pages = page_count(req.gpa, req.len);
            req.page.gpa = req.gpa;
            req.page.pages = pages;
            req.page.handles = ops.by_ref().take(pages).map(|op| Some(op.handle)).collect();
            req.page.map_count = pages;
        }
        Ok(())
    }

    pub fn map_one(
        &self,
        domid: DomainId,
        page: &mut MappedPage,
        gpa: u64,
        len: u64,
        writable: bool,
    ) -> Result<(), MapError> {
        self.map(
            domid,
            &mut [MapRequest {
                page,
                gpa,
                len,
                writable,
            }],
        )
    }

    /// Unmaps whatever part of `page` is currently mapped. The backend pages
    /// stay allocated for reuse.
    pub fn unmap(&self, page: &mut MappedPage) {
        let base = page.base().unwrap_or_default();
        let mut ops: Vec<_> = page
            .handles
            .iter()
            .enumerate()
            .filter_map(|(i, handle)| {
                handle.map(|handle| GrantUnmapOp {
                    host_addr: base + i * XEN_PAGE_SIZE as usize,
                    handle,
                    status: GNTST_OKAY,
                })
            })
            .collect();
        self.unmap_ops(&mut ops);
        page.handles.clear();
        page.pages = 0;
        page.map_count = 0;
    }

    /// Unmaps `page` and returns its backend pages.
    pub fn free(&self, page: &mut MappedPage) {
        self.unmap(page);
        self.release_buffer(page);
    }

    fn release_buffer(&self, page: &mut MappedPage) {
        if let Some(buffer) = page.buffer.take() {
            self.hv.free_pages(buffer);
        }
    }

    fn unmap_ops(&self, ops: &mut [GrantUnmapOp]) {
        if ops.is_empty() {
            return;
        }
        if let Err(err) = self.hv.unmap_grant_refs(ops) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                count = ops.len(),
                "failed to unmap grants"
            );
            return;
        }
        for op in ops.iter().filter(|op| op.status != GNTST_OKAY) {
            tracing::error!(
                handle = op.handle.0,
                status = op.status,
                "grant unmap reported failure"
            );
        }
    }
}
