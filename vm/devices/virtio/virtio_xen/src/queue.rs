// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-queue state: negotiated parameters, ring mappings and the buffer
//! chunks of each descriptor chain head.

use crate::grant::GrantMapper;
use crate::grant::MapError;
use crate::hypervisor::DomainId;
use crate::iovec::map_chunk;
use crate::iovec::unmap_chunk;
use crate::iovec::wait_chunk_idle;
use crate::iovec::PageChunk;
use crate::iovec::VirtqBuffer;
use crate::spec::grant::is_grant_range;
use crate::spec::queue as ring;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Called on the worker with the queue index when the guest kicks a queue.
pub type NotifyCallback = Arc<dyn Fn(u16) + Send + Sync>;

/// Index of each ring segment within the meta chunk.
const META_DESC: usize = 0;
const META_AVAIL: usize = 1;
const META_USED: usize = 2;
const META_SEGMENTS: usize = 3;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue {0} does not exist")]
    InvalidQueue(u16),
    #[error("queue {0} is not ready")]
    NotReady(u16),
    #[error("queue {0} has no size or ring address configured")]
    NotConfigured(u16),
    #[error("ring address {0:#x} is not grant backed")]
    NotGranted(u64),
    #[error("failed to map the rings of queue {queue}")]
    Map {
        queue: u16,
        #[source]
        source: MapError,
    },
}

/// Backend pointers to the three ring segments of a ready queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Virtq {
    pub desc: usize,
    pub avail: usize,
    pub used: usize,
    pub size: u16,
}

/// Runtime state of one virtqueue.
pub struct VirtqueueContext {
    /// One chunk per descriptor chain head, plus the ring chunk at
    /// `max_queue_depth`.
    pub(crate) chunks: Vec<PageChunk>,
    pub(crate) size: u16,
    pub(crate) ready_notified: bool,
    pub(crate) desc_addr: u64,
    pub(crate) avail_addr: u64,
    pub(crate) used_addr: u64,
    pub(crate) notify: Option<NotifyCallback>,
}

impl VirtqueueContext {
    fn new(max_queue_depth: u16) -> Self {
        Self {
            chunks: (0..=max_queue_depth).map(|_| PageChunk::new()).collect(),
            size: 0,
            ready_notified: false,
            desc_addr: 0,
            avail_addr: 0,
            used_addr: 0,
            notify: None,
        }
    }

    fn meta_index(&self) -> usize {
        self.chunks.len() - 1
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn is_ready(&self) -> bool {
        let meta = &self.chunks[self.meta_index()];
        self.size != 0
            && meta.pages.len() == META_SEGMENTS
            && meta.pages.iter().all(|page| page.is_mapped())
            && self.desc_addr != 0
            && self.avail_addr != 0
            && self.used_addr != 0
    }

    fn virtq(&self) -> Option<Virtq> {
        if !self.is_ready() {
            return None;
        }
        let meta = &self.chunks[self.meta_index()];
        Some(Virtq {
            desc: meta.pages[META_DESC].host_address()?,
            avail: meta.pages[META_AVAIL].host_address()?,
            used: meta.pages[META_USED].host_address()?,
            size: self.size,
        })
    }
}

/// A queue context together with its guard and the release wakeup.
pub(crate) struct QueueSlot {
    pub(crate) index: u16,
    pub(crate) depth: u16,
    pub(crate) ctx: Mutex<VirtqueueContext>,
    pub(crate) released: Condvar,
}

impl QueueSlot {
    pub fn new(index: u16, max_queue_depth: u16) -> Self {
        Self {
            index,
            depth: max_queue_depth,
            ctx: Mutex::new(VirtqueueContext::new(max_queue_depth)),
            released: Condvar::new(),
        }
    }

    /// Maps the three ring segments of the negotiated queue.
    ///
    /// On success every per-head chunk left over from an earlier
    /// configuration is unmapped. On failure the queue stays inactive.
    pub fn setup(&self, mapper: &GrantMapper, domid: DomainId) -> Result<(), QueueError> {
        let mut ctx = self.ctx.lock();
        let size = ctx.size;
        let addrs = [ctx.desc_addr, ctx.avail_addr, ctx.used_addr];
        if size == 0 || addrs.contains(&0) {
            return Err(QueueError::NotConfigured(self.index));
        }

        let lens = [
            ring::desc_table_len(size),
            ring::avail_ring_len(size),
            ring::used_ring_len(size),
        ];
        if let Some((&addr, _)) = addrs
            .iter()
            .zip(lens)
            .find(|&(&addr, len)| !is_grant_range(addr, len))
        {
            return Err(QueueError::NotGranted(addr));
        }
        let buffers: Vec<_> = addrs
            .iter()
            .zip(lens)
            .map(|(&addr, len)| VirtqBuffer {
                addr,
                len: len as u32,
                device_writable: true,
            })
            .collect();

        let meta = ctx.meta_index();
        wait_chunk_idle(self, &mut ctx, meta);
        unmap_chunk(mapper, &mut ctx.chunks[meta]);
        map_chunk(mapper, domid, &mut ctx.chunks[meta], &buffers).map_err(|source| {
            QueueError::Map {
                queue: self.index,
                source,
            }
        })?;

        for index in 0..meta {
            wait_chunk_idle(self, &mut ctx, index);
            unmap_chunk(mapper, &mut ctx.chunks[index]);
        }
        tracing::debug!(queue = self.index, size, "queue mapped");
        Ok(())
    }

    /// Tears down every mapping of the queue and forgets its negotiated
    /// parameters. Harmless on a queue that was never set up.
    pub fn reset(&self, mapper: &GrantMapper) {
        let mut ctx = self.ctx.lock();
        for index in 0..ctx.chunks.len() {
            wait_chunk_idle(self, &mut ctx, index);
            ctx.chunks[index].free(mapper);
        }
        ctx.notify = None;
        ctx.size = 0;
        ctx.ready_notified = false;
        ctx.desc_addr = 0;
        ctx.avail_addr = 0;
        ctx.used_addr = 0;
    }

    pub fn is_ready(&self) -> bool {
        self.ctx.lock().is_ready()
    }

    pub fn virtq(&self) -> Result<Virtq, QueueError> {
        self.ctx
            .lock()
            .virtq()
            .ok_or(QueueError::NotReady(self.index))
    }
}
