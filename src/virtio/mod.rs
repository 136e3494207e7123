//! virtio device definitions, for both the mmio interface and virtio
//! descriptors. Only tested with qemu. This is the "legacy" virtio
//! interface.
//!
//! The virtio spec:
//! https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.pdf

use core::ptr;

use bitflags::bitflags;

use crate::memlayout::VIRTIO0;

mod virtio_disk;

pub use virtio_disk::{Disk, VirtioDisk};

/// Memory mapped IO control registers, mapped starting at VIRTIO0.
/// From qemu virtio_mmio.h.
#[repr(usize)]
enum MmioRegs {
    /// 0x74726976
    MagicValue = 0x000,
    /// version; 1 is legacy
    Version = 0x004,
    /// device type; 1 is net, 2 is disk
    DeviceId = 0x008,
    /// 0x554d4551
    VendorId = 0x00c,
    DeviceFeatures = 0x010,
    DriverFeatures = 0x020,
    /// page size for PFN, write-only
    GuestPageSize = 0x028,
    /// select queue, write-only
    QueueSel = 0x030,
    /// max size of current queue, read-only
    QueueNumMax = 0x034,
    /// size of current queue, write-only
    QueueNum = 0x038,
    /// physical page number for queue, read/write
    QueuePfn = 0x040,
    /// write-only
    QueueNotify = 0x050,
    /// read-only
    InterruptStatus = 0x060,
    /// write-only
    InterruptAck = 0x064,
    /// read/write
    Status = 0x070,
}

impl MmioRegs {
    fn read(self) -> u32 {
        // SAFETY:
        // * the kernel page table maps [VIRTIO0, VIRTIO0 + PGSIZE);
        // * the address is properly aligned (self % 4 == 0);
        // * volatile concurrent accesses of device registers are intended.
        unsafe { ptr::read_volatile((VIRTIO0 as *mut u8).add(self as usize) as *mut u32) }
    }

    /// # Safety
    ///
    /// Writing mmio registers causes hardware side effects; the caller must
    /// write values consistent with the device protocol.
    unsafe fn write(self, value: u32) {
        // SAFETY: mapped and aligned, as in read.
        unsafe { ptr::write_volatile((VIRTIO0 as *mut u8).add(self as usize) as *mut u32, value) }
    }

    /// Checks that a legacy virtio disk sits behind the mmio window.
    fn check_virtio_disk() {
        assert_eq!(MmioRegs::MagicValue.read(), 0x7472_6976, "could not find virtio disk");
        assert_eq!(MmioRegs::Version.read(), 1, "could not find virtio disk");
        assert_eq!(MmioRegs::DeviceId.read(), 2, "could not find virtio disk");
        assert_eq!(MmioRegs::VendorId.read(), 0x554d_4551, "could not find virtio disk");
    }

    fn get_status() -> VirtioStatus {
        VirtioStatus::from_bits_truncate(MmioRegs::Status.read())
    }

    fn set_status(status: VirtioStatus) {
        // SAFETY: setting status bits follows the device's init protocol.
        unsafe { MmioRegs::Status.write(status.bits()) }
    }

    fn get_features() -> VirtioFeatures {
        VirtioFeatures::from_bits_truncate(MmioRegs::DeviceFeatures.read())
    }

    fn set_features(features: VirtioFeatures) {
        // SAFETY: feature negotiation has no side effects by itself.
        unsafe { MmioRegs::DriverFeatures.write(features.bits()) }
    }

    /// Selects queue `queue_num` and initializes it.
    ///
    /// # Safety
    ///
    /// The device will later read descriptors through this page number, so
    /// `queue_pfn` must be the page number of a valid, immovable virtqueue.
    unsafe fn select_and_init_queue(queue_num: u32, queue_size: u32, queue_pfn: u32) {
        unsafe { MmioRegs::QueueSel.write(queue_num) };
        let max = MmioRegs::QueueNumMax.read();
        assert!(max != 0, "virtio disk has no queue {}", queue_num);
        assert!(max >= queue_size, "virtio disk max queue too short");
        unsafe {
            MmioRegs::QueueNum.write(queue_size);
            MmioRegs::QueuePfn.write(queue_pfn);
        }
    }

    /// Notifies the device that a new request sits in the given queue.
    ///
    /// # Safety
    ///
    /// The device will read the queue's descriptors and the addresses in
    /// them; all descriptors of the published chain must be well formed.
    unsafe fn notify_queue(queue_num: u32) {
        unsafe { MmioRegs::QueueNotify.write(queue_num) }
    }

    /// Acknowledges all pending interrupt bits.
    fn intr_ack_all() {
        let status = MmioRegs::InterruptStatus.read() & 0x3;
        // SAFETY: acknowledging interrupts has no side effect beyond
        // allowing the device to raise the next one.
        unsafe { MmioRegs::InterruptAck.write(status) }
    }
}

bitflags! {
    /// Status register bits, from qemu virtio_config.h.
    struct VirtioStatus: u32 {
        const ACKNOWLEDGE = 0b0001;
        const DRIVER = 0b0010;
        const DRIVER_OK = 0b0100;
        const FEATURES_OK = 0b1000;
    }
}

bitflags! {
    /// Device feature bits.
    struct VirtioFeatures: u32 {
        /// Disk is read-only.
        const BLK_F_RO = 1 << 5;

        /// Supports scsi command passthrough.
        const BLK_F_SCSI = 1 << 7;

        /// Writeback mode available in config.
        const BLK_F_CONFIG_WCE = 1 << 11;

        /// Supports more than one vq.
        const BLK_F_MQ = 1 << 12;

        const F_ANY_LAYOUT = 1 << 27;
        const RING_F_INDIRECT_DESC = 1 << 28;
        const RING_F_EVENT_IDX = 1 << 29;
    }
}

/// This many virtio descriptors. Must be a power of two.
pub const NUM: usize = 8;

/// A single descriptor, from the spec.
// repr(C): read by the device.
#[repr(C)]
#[derive(Copy, Clone)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: VirtqDescFlags,
    next: u16,
}

impl VirtqDesc {
    const fn zero() -> Self {
        Self {
            addr: 0,
            len: 0,
            flags: VirtqDescFlags::FREED,
            next: 0,
        }
    }
}

bitflags! {
    #[repr(C)]
    struct VirtqDescFlags: u16 {
        const FREED = 0b00;

        /// Chained with another descriptor.
        const NEXT = 0b01;

        /// Device writes (vs read).
        const WRITE = 0b10;
    }
}

/// The (entire) avail ring, from the spec.
// repr(C): read by the device.
#[repr(C)]
struct VirtqAvail {
    /// Always zero.
    flags: u16,

    /// Tells the device how far to look in `ring`.
    idx: u16,

    /// Descriptor indices the device should process.
    ring: [u16; NUM],
}

impl VirtqAvail {
    const fn zero() -> Self {
        Self {
            flags: 0,
            idx: 0,
            ring: [0; NUM],
        }
    }
}

/// The used ring: the device tells the driver about completed requests.
// repr(C, align(4096)): read by the device, and the legacy layout places
// it on the page after the descriptor table and avail ring.
#[repr(C, align(4096))]
struct VirtqUsed {
    /// Always zero.
    flags: u16,

    /// The device increments this as it adds ring[] entries.
    id: u16,

    ring: [VirtqUsedElem; NUM],
}

impl VirtqUsed {
    const fn zero() -> Self {
        Self {
            flags: 0,
            id: 0,
            ring: [VirtqUsedElem::zero(); NUM],
        }
    }
}

/// One entry in the used ring.
// repr(C): written by the device.
#[repr(C)]
#[derive(Copy, Clone)]
struct VirtqUsedElem {
    /// Index of the start of the completed descriptor chain.
    id: u32,

    len: u32,
}

impl VirtqUsedElem {
    const fn zero() -> Self {
        Self { id: 0, len: 0 }
    }
}

/// Block request type: read the disk.
const VIRTIO_BLK_T_IN: u32 = 0;

/// Block request type: write the disk.
const VIRTIO_BLK_T_OUT: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_structures_match_the_device_layout() {
        assert_eq!(core::mem::size_of::<VirtqDesc>(), 16);
        assert_eq!(core::mem::size_of::<VirtqAvail>(), 4 + 2 * NUM);
        assert_eq!(core::mem::size_of::<VirtqUsedElem>(), 8);
        assert_eq!(core::mem::align_of::<VirtqUsed>(), 4096);
    }

    #[test]
    fn num_is_a_power_of_two() {
        assert!(NUM.is_power_of_two());
    }
}
