// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Layout of the shared I/O-request page (`public/hvm/ioreq.h`).

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const STATE_IOREQ_NONE: u8 = 0;
pub const STATE_IOREQ_READY: u8 = 1;
pub const STATE_IOREQ_INPROCESS: u8 = 2;
pub const STATE_IORESP_READY: u8 = 3;

pub const IOREQ_TYPE_PIO: u8 = 0;
pub const IOREQ_TYPE_COPY: u8 = 1;

pub const IOREQ_WRITE: bool = false;
pub const IOREQ_READ: bool = true;

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IoreqFlags {
    #[bits(4)]
    pub state: u8,
    pub data_is_ptr: bool,
    /// [`IOREQ_READ`] or [`IOREQ_WRITE`].
    pub dir: bool,
    pub df: bool,
    _pad: bool,
}

/// One per-vCPU slot of the shared page.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IoRequest {
    pub addr: u64,
    pub data: u64,
    pub count: u32,
    pub size: u32,
    pub vp_eport: u32,
    pub _pad0: u16,
    pub flags: IoreqFlags,
    pub ty: u8,
}

const _: () = assert!(size_of::<IoRequest>() == 32);

impl IoRequest {
    pub fn new_zeroed() -> Self {
        FromZeros::new_zeroed()
    }

    pub fn state(&self) -> u8 {
        self.flags.state()
    }

    pub fn set_state(&mut self, state: u8) {
        self.flags.set_state(state);
    }

    pub fn is_read(&self) -> bool {
        self.flags.dir() == IOREQ_READ
    }
}

/// The shared I/O-request page mapped from the hypervisor, one slot per vCPU.
///
/// Implementations order their accesses so that a `store` of a slot whose
/// state is [`STATE_IORESP_READY`] is visible to the hypervisor only after
/// the rest of the slot.
pub trait IoreqPage: Send + Sync {
    fn load(&self, vcpu: u32) -> IoRequest;
    fn store(&self, vcpu: u32, req: &IoRequest);
}
