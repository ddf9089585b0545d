// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The backend device object and its public API.

use crate::bringup::Backoff;
use crate::bringup::BringupState;
use crate::bringup::Connection;
use crate::config::ConfigError;
use crate::config::XenVirtioConfig;
use crate::dispatch::WorkQueue;
use crate::grant::GrantMapper;
use crate::hypervisor::DomainId;
use crate::hypervisor::Hypervisor;
use crate::hypervisor::StoreError;
use crate::hypervisor::XenStore;
use crate::iovec;
use crate::iovec::IoVec;
use crate::iovec::IovecError;
use crate::iovec::VirtqBuffer;
use crate::ioreq::IoRequest;
use crate::ioreq::IOREQ_TYPE_COPY;
use crate::ioreq::STATE_IOREQ_INPROCESS;
use crate::ioreq::STATE_IOREQ_READY;
use crate::ioreq::STATE_IORESP_READY;
use crate::mmio::DeviceState;
use crate::queue::NotifyCallback;
use crate::queue::QueueError;
use crate::queue::QueueSlot;
use crate::queue::Virtq;
use crate::spec::VIRTIO_DEVICE_NEEDS_RESET;
use crate::spec::VIRTIO_MMIO_INTERRUPT_STATUS_CONFIG_CHANGE;
use crate::spec::VIRTIO_MMIO_INTERRUPT_STATUS_USED_BUFFER;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

/// Called on the worker with the index of a queue that became ready.
pub type ReadyCallback = Arc<dyn Fn(u16) + Send + Sync>;

/// The guest-side device found in the store.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Frontend {
    pub domid: DomainId,
    pub devid: u32,
    pub irq: u32,
    /// Guest physical base of the register window.
    pub base: u64,
}

pub(crate) struct DeviceInner {
    pub(crate) config: XenVirtioConfig,
    pub(crate) hv: Arc<dyn Hypervisor>,
    pub(crate) store: Arc<dyn XenStore>,
    pub(crate) mapper: GrantMapper,
    pub(crate) work: Arc<dyn WorkQueue>,
    pub(crate) this: Weak<DeviceInner>,
    pub(crate) state: Mutex<DeviceState>,
    pub(crate) queues: Vec<QueueSlot>,
    pub(crate) bringup: Mutex<BringupState>,
    pub(crate) ready_cb: Mutex<Option<ReadyCallback>>,
}

/// A virtio-mmio device backend for a Xen guest.
///
/// The device connects to its frontend in the background once
/// [`start`](Self::start) is called, then emulates the register window and
/// maps the rings and buffers the guest grants to it. The embedding backend
/// learns about ready queues and guest kicks through the registered
/// callbacks, which run on the [`WorkQueue`].
pub struct XenVirtioDevice {
    inner: Arc<DeviceInner>,
}

impl XenVirtioDevice {
    pub fn new(
        config: XenVirtioConfig,
        hv: Arc<dyn Hypervisor>,
        store: Arc<dyn XenStore>,
        work: Arc<dyn WorkQueue>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let backoff = Backoff::new(config.retry.base_delay(), config.retry.max_backoff_shift);
        let queues = (0..config.queue_count)
            .map(|index| QueueSlot::new(index, config.max_queue_depth))
            .collect();
        let inner = Arc::new_cyclic(|this| DeviceInner {
            mapper: GrantMapper::new(hv.clone()),
            hv,
            store,
            work,
            this: this.clone(),
            state: Mutex::new(DeviceState::default()),
            queues,
            bringup: Mutex::new(BringupState::new(backoff)),
            ready_cb: Mutex::new(None),
            config,
        });
        Ok(Self { inner })
    }

    /// Watches the store and schedules the first bring-up attempt.
    pub fn start(&self) -> Result<(), StoreError> {
        let inner = &self.inner;
        let mut state = inner.bringup.lock();
        if state.watch.is_some() {
            return Ok(());
        }
        let this = inner.this.clone();
        let token = inner.store.watch(
            &inner.config.store_root,
            Box::new(move |path| {
                if let Some(this) = this.upgrade() {
                    this.on_store_change(path);
                }
            }),
        )?;
        state.watch = Some(token);
        inner.schedule_bringup(&mut state, Duration::ZERO);
        Ok(())
    }

    /// Disconnects from the frontend and releases every mapping. Pending
    /// bring-up attempts are cancelled.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Drops the frontend connection and resets the device, then connects
    /// again from scratch. An attempt in flight is abandoned.
    pub fn reset_connection(&self) {
        self.inner.reset_connection();
    }

    /// Services the I/O request of vCPU 0. This is what the bound event
    /// channel runs.
    pub fn handle_ioreq_event(&self) {
        self.inner.handle_ioreq_event();
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.bringup.lock().initialized
    }

    pub fn frontend(&self) -> Option<Frontend> {
        self.inner.state.lock().frontend
    }

    pub fn virtq_is_ready(&self, queue: u16) -> bool {
        self.inner
            .queues
            .get(usize::from(queue))
            .is_some_and(QueueSlot::is_ready)
    }

    pub fn get_virtq(&self, queue: u16) -> Result<Virtq, QueueError> {
        self.inner.slot(queue)?.virtq()
    }

    /// Features the driver has written, as of now.
    pub fn get_driver_features(&self) -> u64 {
        self.inner.state.lock().driver_features()
    }

    pub fn device_status(&self) -> u32 {
        self.inner.state.lock().status()
    }

    /// Sets device status bits on behalf of the backend, typically
    /// `VIRTIO_DEVICE_NEEDS_RESET`.
    pub fn set_device_status(&self, bits: u32) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let added = bits & !state.status;
        state.status |= bits;
        if added & VIRTIO_DEVICE_NEEDS_RESET != 0 {
            state.config_generation = state.config_generation.wrapping_add(1);
            inner.update_interrupt(&mut state, true, VIRTIO_MMIO_INTERRUPT_STATUS_CONFIG_CHANGE);
        }
    }

    /// Raises the used-buffer interrupt for `queue`.
    pub fn notify_virtq(&self, queue: u16) -> Result<(), QueueError> {
        let inner = &self.inner;
        if !inner.slot(queue)?.is_ready() {
            return Err(QueueError::NotReady(queue));
        }
        let mut state = inner.state.lock();
        inner.update_interrupt(&mut state, true, VIRTIO_MMIO_INTERRUPT_STATUS_USED_BUFFER);
        Ok(())
    }

    /// Raises the configuration-change interrupt after the config space
    /// contents changed.
    pub fn notify_config_change(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        state.config_generation = state.config_generation.wrapping_add(1);
        inner.update_interrupt(&mut state, true, VIRTIO_MMIO_INTERRUPT_STATUS_CONFIG_CHANGE);
    }

    /// Maps the buffers of the descriptor chain at `head` of `queue`.
    ///
    /// Device-readable buffers land in `read_iovecs` and device-writable ones
    /// in `write_iovecs`; the counts of each are returned. A mapping failure
    /// stops the queue and marks the device failed.
    pub fn prepare_iovec(
        &self,
        queue: u16,
        head: u16,
        buffers: &[VirtqBuffer],
        read_iovecs: &mut [IoVec],
        write_iovecs: &mut [IoVec],
    ) -> Result<(usize, usize), IovecError> {
        let inner = &self.inner;
        let slot = inner
            .queues
            .get(usize::from(queue))
            .ok_or(IovecError::InvalidQueue(queue))?;
        let domid = inner
            .state
            .lock()
            .frontend
            .ok_or(IovecError::Disconnected)?
            .domid;
        let result = iovec::prepare_iovec(
            &inner.mapper,
            domid,
            slot,
            head,
            buffers,
            read_iovecs,
            write_iovecs,
        );
        if let Err(err @ (IovecError::Map(_) | IovecError::Unmapped(_))) = &result {
            tracing::error!(
                error = err as &dyn std::error::Error,
                queue,
                head,
                "failed to map descriptor chain"
            );
            slot.reset(&inner.mapper);
            inner.set_failed(&mut inner.state.lock());
        }
        result
    }

    /// Unmaps the buffers mapped for `head` of `queue`.
    pub fn release_iovec(&self, queue: u16, head: u16) -> Result<(), IovecError> {
        let inner = &self.inner;
        let slot = inner
            .queues
            .get(usize::from(queue))
            .ok_or(IovecError::InvalidQueue(queue))?;
        iovec::release_iovec(&inner.mapper, slot, head)
    }

    /// Sets the callback invoked once for each queue that becomes ready.
    /// Queues that are already ready are reported right away.
    pub fn register_virtq_ready_cb(&self, callback: impl Fn(u16) + Send + Sync + 'static) {
        *self.inner.ready_cb.lock() = Some(Arc::new(callback));
        self.inner.schedule_ready();
    }

    /// Sets the callback invoked when the guest kicks `queue`. The callback
    /// is dropped when the queue is reset.
    pub fn register_virtq_notify_cb(
        &self,
        queue: u16,
        callback: impl Fn(u16) + Send + Sync + 'static,
    ) -> Result<(), QueueError> {
        let slot = self.inner.slot(queue)?;
        let mut ctx = slot.ctx.lock();
        if !ctx.is_ready() {
            return Err(QueueError::NotReady(queue));
        }
        let callback: NotifyCallback = Arc::new(callback);
        ctx.notify = Some(callback);
        Ok(())
    }
}

impl Drop for XenVirtioDevice {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl DeviceInner {
    fn slot(&self, queue: u16) -> Result<&QueueSlot, QueueError> {
        self.queues
            .get(usize::from(queue))
            .ok_or(QueueError::InvalidQueue(queue))
    }

    fn on_store_change(&self, path: &str) {
        let mut state = self.bringup.lock();
        if state.initialized || state.watch.is_none() {
            return;
        }
        tracing::debug!(path, "store changed, retrying bring-up");
        self.schedule_bringup(&mut state, Duration::ZERO);
    }

    pub(crate) fn reset_device(&self) {
        self.reset_locked(&mut self.state.lock());
    }

    /// Forgets the connection, returning it so it can be closed.
    fn disconnect(&self, state: &mut BringupState) -> Option<Connection> {
        state.epoch += 1;
        state.ticket += 1;
        state.initialized = false;
        state.connection.take()
    }

    fn teardown(&self, connection: Option<Connection>) {
        {
            let mut state = self.state.lock();
            self.reset_locked(&mut state);
            state.frontend = None;
            state.irq_level = false;
        }
        if let Some(connection) = connection {
            tracing::info!(domid = connection.frontend.domid, "virtio backend disconnected");
            connection.close(self.hv.as_ref());
        }
    }

    pub(crate) fn stop(&self) {
        let (watch, connection) = {
            let mut state = self.bringup.lock();
            let connection = self.disconnect(&mut state);
            (state.watch.take(), connection)
        };
        if let Some(token) = watch {
            self.store.unwatch(token);
        }
        self.teardown(connection);
    }

    pub(crate) fn reset_connection(&self) {
        let connection = {
            let mut state = self.bringup.lock();
            let connection = self.disconnect(&mut state);
            state.backoff.reset();
            connection
        };
        self.teardown(connection);
        let mut state = self.bringup.lock();
        if state.watch.is_some() {
            self.schedule_bringup(&mut state, Duration::ZERO);
        }
    }

    pub(crate) fn handle_ioreq_event(&self) {
        let (page, port) = {
            let state = self.bringup.lock();
            match (state.page(), state.port()) {
                (Some(page), Some(port)) => (page, port),
                _ => return,
            }
        };
        let mut req = page.load(0);
        if req.state() != STATE_IOREQ_READY {
            return;
        }
        req.set_state(STATE_IOREQ_INPROCESS);
        self.handle_ioreq(&mut req);
        req.set_state(STATE_IORESP_READY);
        page.store(0, &req);
        self.hv.notify(port);
    }

    fn handle_ioreq(&self, req: &mut IoRequest) {
        let size = req.size;
        let mask = match size {
            1 | 2 | 4 => (1u64 << (size * 8)) - 1,
            _ => {
                tracing::warn!(size, addr = req.addr, "unsupported access size");
                if req.is_read() {
                    req.data = !0;
                }
                return;
            }
        };
        if req.ty != IOREQ_TYPE_COPY || req.flags.data_is_ptr() || req.count > 1 {
            tracing::warn!(
                ty = req.ty,
                addr = req.addr,
                count = req.count,
                "unsupported ioreq"
            );
            if req.is_read() {
                req.data = !0;
            }
            return;
        }
        let offset = req
            .addr
            .checked_sub(self.config.base_address)
            .filter(|&offset| offset < self.config.mmio_size)
            .and_then(|offset| u16::try_from(offset).ok());
        let Some(offset) = offset else {
            tracing::warn!(addr = req.addr, "access outside the register window");
            if req.is_read() {
                req.data = !0;
            }
            return;
        };
        if req.is_read() {
            req.data = u64::from(self.mmio_read(offset, size)) & mask;
            tracing::trace!(offset, size, data = req.data, "mmio read");
        } else {
            tracing::trace!(offset, size, data = req.data, "mmio write");
            self.mmio_write(offset, size, (req.data & mask) as u32);
        }
    }
}
