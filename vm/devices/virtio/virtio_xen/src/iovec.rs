// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mapping of descriptor chain buffers into backend I/O vectors.
//!
//! Every descriptor chain head of a queue owns a [`PageChunk`] whose mapped
//! pages are reused from one request to the next. A chunk is mapped by
//! [`prepare_iovec`] and unmapped again by [`release_iovec`].

use crate::grant::GrantMapper;
use crate::grant::MapError;
use crate::grant::MapRequest;
use crate::grant::MappedPage;
use crate::hypervisor::DomainId;
use crate::queue::QueueSlot;
use crate::queue::VirtqueueContext;
use crate::spec::grant::is_grant_range;
use crate::spec::grant::page_count;
use parking_lot::MutexGuard;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IovecError {
    #[error("queue {0} does not exist")]
    InvalidQueue(u16),
    #[error("no frontend is connected")]
    Disconnected,
    #[error("descriptor head {head} is out of range for a queue of depth {depth}")]
    InvalidHead { head: u16, depth: u16 },
    #[error("buffer address {0:#x} is not grant backed")]
    NotGranted(u64),
    #[error("buffer at {0:#x} has no backend mapping")]
    Unmapped(u64),
    #[error("{needed} {kind} buffers do not fit into {capacity} iovecs")]
    TooManyBuffers {
        kind: &'static str,
        needed: usize,
        capacity: usize,
    },
    #[error("failed to map buffers")]
    Map(#[source] MapError),
}

/// One buffer of a descriptor chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VirtqBuffer {
    /// Grant-encoded guest address.
    pub addr: u64,
    pub len: u32,
    /// The device writes into this buffer (`VIRTQ_DESC_F_WRITE`).
    pub device_writable: bool,
}

/// A mapped buffer in backend memory.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct IoVec {
    pub base: usize,
    pub len: usize,
}

impl IoVec {
    pub fn as_ptr(&self) -> *mut u8 {
        self.base as *mut u8
    }
}

/// The mapped pages backing one descriptor chain, or the ring segments.
#[derive(Debug, Default)]
pub struct PageChunk {
    pub(crate) pages: Vec<MappedPage>,
    /// Set while the pages are unmapped outside the queue lock.
    pub(crate) releasing: bool,
}

impl PageChunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_count(&self) -> usize {
        self.pages.iter().map(MappedPage::map_count).sum()
    }

    fn is_mapped(&self) -> bool {
        self.pages.iter().any(MappedPage::is_mapped)
    }

    /// Unmaps and frees every page.
    pub(crate) fn free(&mut self, mapper: &GrantMapper) {
        for page in &mut self.pages {
            mapper.free(page);
        }
        self.pages.clear();
    }
}

/// Blocks until no release is in flight for chunk `index`.
pub(crate) fn wait_chunk_idle(
    slot: &QueueSlot,
    ctx: &mut MutexGuard<'_, VirtqueueContext>,
    index: usize,
) {
    while ctx.chunks[index].releasing {
        slot.released.wait(ctx);
    }
}

pub(crate) fn unmap_chunk(mapper: &GrantMapper, chunk: &mut PageChunk) {
    for page in &mut chunk.pages {
        mapper.unmap(page);
    }
}

/// Maps `buffers` into `chunk`, one [`MappedPage`] per buffer, as a single
/// batch. Empty buffers are skipped.
pub(crate) fn map_chunk(
    mapper: &GrantMapper,
    domid: DomainId,
    chunk: &mut PageChunk,
    buffers: &[VirtqBuffer],
) -> Result<(), MapError> {
    if chunk.pages.len() < buffers.len() {
        chunk.pages.resize_with(buffers.len(), MappedPage::new);
    }
    let mut requests: Vec<_> = chunk
        .pages
        .iter_mut()
        .zip(buffers)
        .filter(|(_, buffer)| buffer.len != 0)
        .map(|(page, buffer)| MapRequest {
            page,
            gpa: buffer.addr,
            len: buffer.len.into(),
            writable: buffer.device_writable,
        })
        .collect();
    mapper.map(domid, &mut requests)
}

/// Maps the buffers of the chain at `head` and fills in the device-readable
/// and device-writable iovecs.
///
/// Returns the number of read and write iovecs filled in. Nothing is left
/// mapped when an error is returned.
pub(crate) fn prepare_iovec(
    mapper: &GrantMapper,
    domid: DomainId,
    slot: &QueueSlot,
    head: u16,
    buffers: &[VirtqBuffer],
    read_iovecs: &mut [IoVec],
    write_iovecs: &mut [IoVec],
) -> Result<(usize, usize), IovecError> {
    if head >= slot.depth {
        return Err(IovecError::InvalidHead {
            head,
            depth: slot.depth,
        });
    }
    if let Some(buffer) = buffers
        .iter()
        .find(|b| !is_grant_range(b.addr, b.len.into()))
    {
        return Err(IovecError::NotGranted(buffer.addr));
    }

    let data = || buffers.iter().filter(|b| b.len != 0);
    let writes = data().filter(|b| b.device_writable).count();
    let reads = data().count() - writes;
    if reads > read_iovecs.len() {
        return Err(IovecError::TooManyBuffers {
            kind: "read",
            needed: reads,
            capacity: read_iovecs.len(),
        });
    }
    if writes > write_iovecs.len() {
        return Err(IovecError::TooManyBuffers {
            kind: "write",
            needed: writes,
            capacity: write_iovecs.len(),
        });
    }

    let total_pages: usize = buffers
        .iter()
        .map(|b| page_count(b.addr, b.len.into()))
        .sum();
    if total_pages == 0 {
        return Ok((0, 0));
    }

    let index = head as usize;
    let mut ctx = slot.ctx.lock();
    wait_chunk_idle(slot, &mut ctx, index);
    let chunk = &mut ctx.chunks[index];
    if chunk.is_mapped() {
        tracing::warn!(
            queue = slot.index,
            head,
            "descriptor head prepared again without release"
        );
        unmap_chunk(mapper, chunk);
    }
    map_chunk(mapper, domid, chunk, buffers).map_err(IovecError::Map)?;

    let mapped = chunk
        .pages
        .iter()
        .zip(buffers)
        .filter(|(_, buffer)| buffer.len != 0)
        .map(|(page, buffer)| -> Result<_, IovecError> {
            let base = page
                .host_address()
                .ok_or(IovecError::Unmapped(buffer.addr))?;
            Ok((
                buffer.device_writable,
                IoVec {
                    base,
                    len: buffer.len as usize,
                },
            ))
        })
        .collect::<Result<Vec<_>, _>>();
    let mapped = match mapped {
        Ok(mapped) => mapped,
        Err(err) => {
            unmap_chunk(mapper, chunk);
            return Err(err);
        }
    };

    let (mut read_count, mut write_count) = (0, 0);
    for (device_writable, iov) in mapped {
        if device_writable {
            write_iovecs[write_count] = iov;
            write_count += 1;
        } else {
            read_iovecs[read_count] = iov;
            read_count += 1;
        }
    }
    Ok((read_count, write_count))
}

/// Unmaps the buffers of the chain at `head`. A never-prepared head is left
/// alone.
pub(crate) fn release_iovec(
    mapper: &GrantMapper,
    slot: &QueueSlot,
    head: u16,
) -> Result<(), IovecError> {
    if head >= slot.depth {
        return Err(IovecError::InvalidHead {
            head,
            depth: slot.depth,
        });
    }
    let index = head as usize;
    let mut ctx = slot.ctx.lock();
    wait_chunk_idle(slot, &mut ctx, index);
    let chunk = &mut ctx.chunks[index];
    if chunk.pages.is_empty() {
        return Ok(());
    }
    chunk.releasing = true;
    let mut pages = std::mem::take(&mut chunk.pages);
    MutexGuard::unlocked(&mut ctx, || {
        for page in &mut pages {
            mapper.unmap(page);
        }
    });
    let chunk = &mut ctx.chunks[index];
    chunk.pages = pages;
    chunk.releasing = false;
    slot.released.notify_all();
    Ok(())
}
