// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Constants defined by the virtio spec and the Xen grant DMA convention.

/// "virt" in little endian.
pub const VIRTIO_MMIO_MAGIC_VALUE: u32 = u32::from_le_bytes(*b"virt");
pub const VIRTIO_MMIO_VERSION: u32 = 2;

// Device features - first bank
pub const VIRTIO_F_RING_INDIRECT_DESC: u64 = 1 << 28;
pub const VIRTIO_F_RING_EVENT_IDX: u64 = 1 << 29;
// Device features - second bank
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;
pub const VIRTIO_F_ACCESS_PLATFORM: u64 = 1 << 33;

// Device status
pub const VIRTIO_ACKNOWLEDGE: u32 = 1;
pub const VIRTIO_DRIVER: u32 = 2;
pub const VIRTIO_DRIVER_OK: u32 = 4;
pub const VIRTIO_FEATURES_OK: u32 = 8;
pub const VIRTIO_DEVICE_NEEDS_RESET: u32 = 0x40;
pub const VIRTIO_FAILED: u32 = 0x80;

// Interrupt status flags
pub const VIRTIO_MMIO_INTERRUPT_STATUS_USED_BUFFER: u32 = 1;
pub const VIRTIO_MMIO_INTERRUPT_STATUS_CONFIG_CHANGE: u32 = 2;

/// Largest queue size allowed for split virtqueues.
pub const VIRTIO_QUEUE_SIZE_LIMIT: u16 = 0x8000;

/// Register offsets of the virtio-mmio (version 2) transport, as laid out in
/// the virtio 1.x specification and expected by the Linux `virtio_mmio`
/// driver.
pub mod mmio {
    pub const MAGIC_VALUE: u16 = 0x000;
    pub const VERSION: u16 = 0x004;
    pub const DEVICE_ID: u16 = 0x008;
    pub const VENDOR_ID: u16 = 0x00c;
    pub const DEVICE_FEATURES: u16 = 0x010;
    pub const DEVICE_FEATURES_SEL: u16 = 0x014;
    pub const DRIVER_FEATURES: u16 = 0x020;
    pub const DRIVER_FEATURES_SEL: u16 = 0x024;
    pub const QUEUE_SEL: u16 = 0x030;
    pub const QUEUE_NUM_MAX: u16 = 0x034;
    pub const QUEUE_NUM: u16 = 0x038;
    pub const QUEUE_READY: u16 = 0x044;
    pub const QUEUE_NOTIFY: u16 = 0x050;
    pub const INTERRUPT_STATUS: u16 = 0x060;
    pub const INTERRUPT_ACK: u16 = 0x064;
    pub const STATUS: u16 = 0x070;
    pub const QUEUE_DESC_LOW: u16 = 0x080;
    pub const QUEUE_DESC_HIGH: u16 = 0x084;
    pub const QUEUE_AVAIL_LOW: u16 = 0x090;
    pub const QUEUE_AVAIL_HIGH: u16 = 0x094;
    pub const QUEUE_USED_LOW: u16 = 0x0a0;
    pub const QUEUE_USED_HIGH: u16 = 0x0a4;
    pub const SHM_SEL: u16 = 0x0ac;
    pub const SHM_LEN_LOW: u16 = 0x0b0;
    pub const SHM_LEN_HIGH: u16 = 0x0b4;
    pub const SHM_BASE_LOW: u16 = 0x0b8;
    pub const SHM_BASE_HIGH: u16 = 0x0bc;
    pub const CONFIG_GENERATION: u16 = 0x0fc;
    pub const CONFIG: u16 = 0x100;

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn queue_registers_follow_virtio_layout() {
            assert_eq!(QUEUE_SEL, 0x30);
            assert_eq!(QUEUE_NUM_MAX, 0x34);
            assert_eq!(QUEUE_NUM, 0x38);
            assert_eq!(QUEUE_READY, 0x44);
            assert_eq!(QUEUE_NOTIFY, 0x50);
            assert_eq!(STATUS, 0x70);
            assert_eq!(QUEUE_DESC_LOW, 0x80);
            assert_eq!(CONFIG_GENERATION, 0xfc);
        }
    }
}

/// Split virtqueue ring layout.
pub mod queue {
    /// `struct virtq_desc`: addr (8), len (4), flags (2), next (2).
    pub const DESCRIPTOR_SIZE: u64 = 16;

    /*
    struct virtq_avail {
        le16 flags;
        le16 idx;
        le16 ring[ /* Queue Size */ ];
        le16 used_event;
    }
    */
    pub const AVAIL_ELEMENT_SIZE: u64 = 2;
    pub const AVAIL_FIXED_SIZE: u64 = 6;

    /*
    struct virtq_used {
        le16 flags;
        le16 idx;
        struct virtq_used_elem ring[ /* Queue Size */];
        le16 avail_event;
    };
    */
    pub const USED_ELEMENT_SIZE: u64 = 8;
    pub const USED_FIXED_SIZE: u64 = 6;

    pub fn desc_table_len(size: u16) -> u64 {
        DESCRIPTOR_SIZE * size as u64
    }

    pub fn avail_ring_len(size: u16) -> u64 {
        AVAIL_ELEMENT_SIZE * size as u64 + AVAIL_FIXED_SIZE
    }

    pub fn used_ring_len(size: u16) -> u64 {
        USED_ELEMENT_SIZE * size as u64 + USED_FIXED_SIZE
    }
}

/// Xen grant DMA addressing.
pub mod grant {
    pub const XEN_PAGE_SHIFT: u32 = 12;
    pub const XEN_PAGE_SIZE: u64 = 1 << XEN_PAGE_SHIFT;
    pub const XEN_PAGE_MASK: u64 = XEN_PAGE_SIZE - 1;

    /// Set by the frontend on every DMA address that refers to a grant
    /// instead of a guest physical address.
    pub const XEN_GRANT_ADDR_OFF: u64 = 1 << 63;

    pub fn is_grant_address(addr: u64) -> bool {
        addr & XEN_GRANT_ADDR_OFF != 0
    }

    /// The grant reference of the page that holds `addr`. Grant references
    /// are 32 bits wide, so bits 44 to 62 of a grant address must be clear.
    pub fn grant_ref(addr: u64) -> Option<u32> {
        if !is_grant_address(addr) {
            return None;
        }
        u32::try_from((addr & !XEN_GRANT_ADDR_OFF) >> XEN_PAGE_SHIFT).ok()
    }

    /// Whether every page touched by `len` bytes at `addr` has a valid grant
    /// reference.
    pub fn is_grant_range(addr: u64, len: u64) -> bool {
        let Some(first) = grant_ref(addr) else {
            return false;
        };
        match page_count(addr, len) {
            0 => true,
            pages => u64::from(first) + pages as u64 - 1 <= u64::from(u32::MAX),
        }
    }

    pub fn page_offset(addr: u64) -> u64 {
        addr & XEN_PAGE_MASK
    }

    /// Number of pages touched by `len` bytes starting at `addr`.
    pub fn page_count(addr: u64, len: u64) -> usize {
        if len == 0 {
            return 0;
        }
        page_offset(addr)
            .saturating_add(len)
            .div_ceil(XEN_PAGE_SIZE) as usize
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn decode_grant_address() {
            let addr = XEN_GRANT_ADDR_OFF | (0x1234 << XEN_PAGE_SHIFT) | 0x10;
            assert!(is_grant_address(addr));
            assert!(!is_grant_address(0x1234_5000));
            assert_eq!(grant_ref(addr), Some(0x1234));
            assert_eq!(grant_ref(0x1234_5000), None);
            assert_eq!(page_offset(addr), 0x10);
        }

        #[test]
        fn grant_refs_are_32_bits() {
            let last = XEN_GRANT_ADDR_OFF | (0xffff_ffff << XEN_PAGE_SHIFT);
            assert_eq!(grant_ref(last), Some(u32::MAX));
            assert!(is_grant_range(last, XEN_PAGE_SIZE));
            assert!(is_grant_range(last, 0));
            // The run would continue past the last grant reference.
            assert!(!is_grant_range(last, XEN_PAGE_SIZE + 1));
            assert!(!is_grant_range(last | 0x800, XEN_PAGE_SIZE));

            // Bits above the grant reference must not be dropped.
            let wide = XEN_GRANT_ADDR_OFF | (0x1_0000_0005 << XEN_PAGE_SHIFT);
            assert_eq!(grant_ref(wide), None);
            assert!(!is_grant_range(wide, 16));
        }

        #[test]
        fn page_count_includes_offset() {
            let base = XEN_GRANT_ADDR_OFF;
            assert_eq!(page_count(base, 0), 0);
            assert_eq!(page_count(base, 1), 1);
            assert_eq!(page_count(base, XEN_PAGE_SIZE), 1);
            assert_eq!(page_count(base, XEN_PAGE_SIZE + 1), 2);
            assert_eq!(page_count(base | 0xff0, 0x20), 2);
        }
    }
}
