// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! virtio-mmio register emulation.

use crate::device::DeviceInner;
use crate::device::Frontend;
use crate::queue::QueueSlot;
use crate::spec::mmio;
use crate::spec::*;

/// Transport state visible to the guest through the register window.
#[derive(Debug, Default)]
pub struct DeviceState {
    pub(crate) device_features_sel: u32,
    pub(crate) driver_features_sel: u32,
    pub(crate) driver_features: u64,
    pub(crate) status: u32,
    pub(crate) interrupt_status: u32,
    pub(crate) irq_level: bool,
    pub(crate) queue_sel: u32,
    pub(crate) shm_sel: u32,
    pub(crate) config_generation: u32,
    /// Set while connected to the frontend.
    pub(crate) frontend: Option<Frontend>,
}

impl DeviceState {
    pub fn status(&self) -> u32 {
        self.status
    }

    pub fn driver_features(&self) -> u64 {
        self.driver_features
    }

    pub fn interrupt_status(&self) -> u32 {
        self.interrupt_status
    }
}

fn low(value: u64) -> u32 {
    value as u32
}

fn high(value: u64) -> u32 {
    (value >> 32) as u32
}

fn set_low(value: &mut u64, val: u32) {
    *value = (*value & !0xffff_ffff) | u64::from(val);
}

fn set_high(value: &mut u64, val: u32) {
    *value = (*value & 0xffff_ffff) | (u64::from(val) << 32);
}

/// Checks that every status bit the driver sets has its predecessors set
/// too: ACKNOWLEDGE, then DRIVER, then FEATURES_OK, then DRIVER_OK.
fn status_sequence_valid(status: u32) -> bool {
    let steps = [
        VIRTIO_ACKNOWLEDGE,
        VIRTIO_DRIVER,
        VIRTIO_FEATURES_OK,
        VIRTIO_DRIVER_OK,
    ];
    steps
        .windows(2)
        .all(|pair| status & pair[1] == 0 || status & pair[0] != 0)
}

impl DeviceInner {
    /// Feature bits offered to the driver.
    pub(crate) fn device_features(&self) -> u64 {
        self.config.device_features | VIRTIO_F_VERSION_1 | VIRTIO_F_ACCESS_PLATFORM
    }

    fn selected_queue(&self, state: &DeviceState) -> Option<&QueueSlot> {
        self.queues.get(state.queue_sel as usize)
    }

    /// Sets or clears interrupt status bits and drives the line to match.
    pub(crate) fn update_interrupt(&self, state: &mut DeviceState, is_set: bool, bits: u32) {
        if is_set {
            state.interrupt_status |= bits;
        } else {
            state.interrupt_status &= !bits;
        }
        let level = state.interrupt_status != 0;
        if level == state.irq_level {
            return;
        }
        let Some(frontend) = state.frontend else {
            return;
        };
        match self.hv.set_irq_level(frontend.domid, frontend.irq, level) {
            Ok(()) => state.irq_level = level,
            Err(err) => tracing::error!(
                error = &err as &dyn std::error::Error,
                irq = frontend.irq,
                level,
                "failed to set interrupt level"
            ),
        }
    }

    pub(crate) fn set_failed(&self, state: &mut DeviceState) {
        if state.status & VIRTIO_FAILED == 0 {
            tracing::warn!(status = state.status, "marking device failed");
        }
        state.status |= VIRTIO_FAILED;
    }

    /// Returns the transport and every queue to their initial state. The
    /// frontend connection is kept.
    pub(crate) fn reset_locked(&self, state: &mut DeviceState) {
        self.update_interrupt(state, false, !0);
        *state = DeviceState {
            frontend: state.frontend,
            irq_level: state.irq_level,
            ..Default::default()
        };
        for slot in &self.queues {
            slot.reset(&self.mapper);
        }
        tracing::debug!("device reset");
    }

    fn read_config(&self, offset: u16, size: u32) -> u32 {
        let offset = (offset - mmio::CONFIG) as usize;
        let config = &self.config.config_space;
        if offset % 4 != 0 || offset >= config.len() {
            tracing::debug!(offset, "config read out of range");
            return 0;
        }
        let mut bytes = [0; 4];
        let end = config.len().min(offset + 4);
        bytes[..end - offset].copy_from_slice(&config[offset..end]);
        let val = u32::from_le_bytes(bytes);
        match size {
            1 => val & 0xff,
            2 => val & 0xffff,
            _ => val,
        }
    }

    /// Handles a guest read of `size` bytes at `offset` into the window.
    pub(crate) fn mmio_read(&self, offset: u16, size: u32) -> u32 {
        if offset >= mmio::CONFIG {
            return self.read_config(offset, size);
        }
        if size != 4 || offset & 3 != 0 {
            tracing::warn!(offset, size, "unsupported register read");
            return !0;
        }
        let state = self.state.lock();
        match offset {
            mmio::MAGIC_VALUE => VIRTIO_MMIO_MAGIC_VALUE,
            mmio::VERSION => VIRTIO_MMIO_VERSION,
            mmio::DEVICE_ID => self.config.device_id,
            mmio::VENDOR_ID => self.config.vendor_id,
            mmio::DEVICE_FEATURES => match state.device_features_sel {
                0 => low(self.device_features()),
                1 => high(self.device_features()),
                _ => 0,
            },
            mmio::DEVICE_FEATURES_SEL => state.device_features_sel,
            mmio::DRIVER_FEATURES => match state.driver_features_sel {
                0 => low(state.driver_features),
                1 => high(state.driver_features),
                _ => 0,
            },
            mmio::DRIVER_FEATURES_SEL => state.driver_features_sel,
            mmio::QUEUE_SEL => state.queue_sel,
            // Zero marks a queue that does not exist.
            mmio::QUEUE_NUM_MAX => self
                .selected_queue(&state)
                .map_or(0, |slot| slot.depth.into()),
            mmio::QUEUE_NUM => self
                .selected_queue(&state)
                .map_or(0, |slot| slot.ctx.lock().size().into()),
            mmio::QUEUE_READY => self
                .selected_queue(&state)
                .map_or(0, |slot| slot.is_ready().into()),
            mmio::INTERRUPT_STATUS => state.interrupt_status,
            mmio::STATUS => state.status,
            mmio::QUEUE_DESC_LOW
            | mmio::QUEUE_DESC_HIGH
            | mmio::QUEUE_AVAIL_LOW
            | mmio::QUEUE_AVAIL_HIGH
            | mmio::QUEUE_USED_LOW
            | mmio::QUEUE_USED_HIGH => {
                let Some(slot) = self.selected_queue(&state) else {
                    return 0;
                };
                let ctx = slot.ctx.lock();
                match offset {
                    mmio::QUEUE_DESC_LOW => low(ctx.desc_addr),
                    mmio::QUEUE_DESC_HIGH => high(ctx.desc_addr),
                    mmio::QUEUE_AVAIL_LOW => low(ctx.avail_addr),
                    mmio::QUEUE_AVAIL_HIGH => high(ctx.avail_addr),
                    mmio::QUEUE_USED_LOW => low(ctx.used_addr),
                    _ => high(ctx.used_addr),
                }
            }
            mmio::SHM_SEL => state.shm_sel,
            mmio::SHM_LEN_LOW | mmio::SHM_LEN_HIGH | mmio::SHM_BASE_LOW | mmio::SHM_BASE_HIGH => {
                // A length of all ones reports a region that does not exist.
                let (base, len) = self
                    .config
                    .shm_regions
                    .get(state.shm_sel as usize)
                    .map_or((0, !0), |region| (region.base, region.len));
                match offset {
                    mmio::SHM_LEN_LOW => low(len),
                    mmio::SHM_LEN_HIGH => high(len),
                    mmio::SHM_BASE_LOW => low(base),
                    _ => high(base),
                }
            }
            mmio::CONFIG_GENERATION => state.config_generation,
            _ => {
                tracing::warn!(offset, "unknown register read");
                !0
            }
        }
    }

    /// Handles a guest write of `size` bytes at `offset` into the window.
    pub(crate) fn mmio_write(&self, offset: u16, size: u32, val: u32) {
        if offset >= mmio::CONFIG {
            tracing::debug!(offset, val, "ignoring config write");
            return;
        }
        if size != 4 || offset & 3 != 0 {
            tracing::warn!(offset, size, val, "unsupported register write");
            return;
        }
        let mut state = self.state.lock();
        match offset {
            mmio::DEVICE_FEATURES_SEL => state.device_features_sel = val,
            mmio::DRIVER_FEATURES => {
                if state.status & VIRTIO_FEATURES_OK != 0 {
                    tracing::warn!(val, "driver features written after FEATURES_OK");
                    return;
                }
                match state.driver_features_sel {
                    0 => set_low(&mut state.driver_features, val),
                    1 => set_high(&mut state.driver_features, val),
                    sel => tracing::debug!(sel, val, "ignoring driver feature bank"),
                }
            }
            mmio::DRIVER_FEATURES_SEL => state.driver_features_sel = val,
            mmio::QUEUE_SEL => state.queue_sel = val,
            mmio::QUEUE_NUM => self.write_queue_size(&mut state, val),
            mmio::QUEUE_READY => self.write_queue_ready(&mut state, val),
            mmio::QUEUE_NOTIFY => match u16::try_from(val) {
                Ok(queue) if usize::from(queue) < self.queues.len() => self.schedule_notify(queue),
                _ => tracing::warn!(val, "notify for unknown queue"),
            },
            mmio::INTERRUPT_ACK => self.update_interrupt(&mut state, false, val),
            mmio::STATUS => self.write_status(&mut state, val),
            mmio::QUEUE_DESC_LOW
            | mmio::QUEUE_DESC_HIGH
            | mmio::QUEUE_AVAIL_LOW
            | mmio::QUEUE_AVAIL_HIGH
            | mmio::QUEUE_USED_LOW
            | mmio::QUEUE_USED_HIGH => {
                let Some(slot) = self.selected_queue(&state) else {
                    tracing::warn!(queue = state.queue_sel, "ring address for unknown queue");
                    return;
                };
                let mut ctx = slot.ctx.lock();
                if ctx.is_ready() {
                    tracing::warn!(queue = slot.index, offset, "ring address of a ready queue");
                    return;
                }
                match offset {
                    mmio::QUEUE_DESC_LOW => set_low(&mut ctx.desc_addr, val),
                    mmio::QUEUE_DESC_HIGH => set_high(&mut ctx.desc_addr, val),
                    mmio::QUEUE_AVAIL_LOW => set_low(&mut ctx.avail_addr, val),
                    mmio::QUEUE_AVAIL_HIGH => set_high(&mut ctx.avail_addr, val),
                    mmio::QUEUE_USED_LOW => set_low(&mut ctx.used_addr, val),
                    _ => set_high(&mut ctx.used_addr, val),
                }
            }
            mmio::SHM_SEL => state.shm_sel = val,
            _ => tracing::warn!(offset, val, "unknown register write"),
        }
    }

    fn write_queue_size(&self, state: &mut DeviceState, val: u32) {
        let Some(slot) = self.selected_queue(state) else {
            tracing::warn!(queue = state.queue_sel, "size for unknown queue");
            return;
        };
        let mut ctx = slot.ctx.lock();
        if ctx.is_ready() {
            tracing::warn!(queue = slot.index, val, "size of a ready queue");
            return;
        }
        match u16::try_from(val) {
            Ok(size) if size.is_power_of_two() && size <= slot.depth => ctx.size = size,
            _ => {
                tracing::warn!(queue = slot.index, val, max = slot.depth, "invalid queue size");
                drop(ctx);
                self.set_failed(state);
            }
        }
    }

    fn write_queue_ready(&self, state: &mut DeviceState, val: u32) {
        let Some(slot) = self.selected_queue(state) else {
            tracing::warn!(queue = state.queue_sel, "ready for unknown queue");
            return;
        };
        if val == 0 {
            slot.reset(&self.mapper);
            return;
        }
        if slot.is_ready() {
            return;
        }
        let Some(frontend) = state.frontend else {
            return;
        };
        match slot.setup(&self.mapper, frontend.domid) {
            Ok(()) => self.schedule_ready(),
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    queue = slot.index,
                    "failed to activate queue"
                );
                self.set_failed(state);
            }
        }
    }

    fn write_status(&self, state: &mut DeviceState, val: u32) {
        if val == 0 {
            self.reset_locked(state);
            return;
        }
        let old = state.status;
        let mut status = val | (old & (VIRTIO_FAILED | VIRTIO_DEVICE_NEEDS_RESET));
        if !status_sequence_valid(status) {
            tracing::warn!(old, val, "status bits set out of order");
            status |= VIRTIO_FAILED;
        }
        let features_ok = status & !old & VIRTIO_FEATURES_OK != 0;
        if features_ok {
            let unsupported = state.driver_features & !self.device_features();
            if unsupported != 0 {
                tracing::warn!(unsupported, "driver accepted unoffered features");
                status = (status & !VIRTIO_FEATURES_OK) | VIRTIO_FAILED;
            } else {
                state.config_generation = state.config_generation.wrapping_add(1);
            }
        }
        let driver_ok = status & !old & VIRTIO_DRIVER_OK != 0;
        if driver_ok {
            state.config_generation = state.config_generation.wrapping_add(1);
        }
        state.status = status;
        tracing::debug!(old, status, "device status");
        if driver_ok && status & VIRTIO_FAILED == 0 {
            self.schedule_ready();
        }
    }
}
