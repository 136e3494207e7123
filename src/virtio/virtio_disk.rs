//! Driver for qemu's virtio disk device.
//! Uses qemu's mmio interface to virtio.
//! qemu presents a "legacy" virtio interface.
//!
//! qemu ... -drive file=fs.img,if=none,format=raw,id=x0
//!          -device virtio-blk-device,drive=x0,bus=virtio-mmio-bus.0

use core::mem;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use arrayvec::ArrayVec;
use static_assertions::const_assert;

use super::{
    MmioRegs, VirtioFeatures, VirtioStatus, VirtqAvail, VirtqDesc, VirtqDescFlags, VirtqUsed,
    NUM, VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT,
};
use crate::{
    bio::Buf,
    kernel::kernel,
    lock::SleepableLock,
    param::BSIZE,
    riscv::{PGSHIFT, PGSIZE},
};

/// The disk device: the virtqueue plus driver-side bookkeeping, behind a
/// sleepable lock (a request sleeps while the device works).
pub type Disk = SleepableLock<VirtioDisk>;

/// The format of the first descriptor in a disk request. To be followed by
/// two more descriptors containing the block, and a one-byte status.
// repr(C): read by the device.
#[repr(C)]
#[derive(Copy, Clone)]
struct VirtioBlkReq {
    typ: u32,
    reserved: u32,
    sector: u64,
}

impl VirtioBlkReq {
    const fn zero() -> Self {
        Self {
            typ: 0,
            reserved: 0,
            sector: 0,
        }
    }
}

/// Track info about an in-flight operation, for use when the completion
/// interrupt arrives. Indexed by the first descriptor index of the chain.
#[derive(Copy, Clone)]
struct Inflight {
    /// Buffer cache slot of the request, if one is outstanding.
    buf_idx: Option<usize>,

    /// Written by the device: 0 on success. Pre-set to 0xff by the driver.
    status: u8,
}

impl Inflight {
    const fn zero() -> Self {
        Self {
            buf_idx: None,
            status: 0,
        }
    }
}

/// The virtqueue and driver state. Lives in the immovable kernel singleton:
/// the device holds the queue's physical address from init onwards.
///
/// The legacy layout requires the descriptor table and the avail ring in
/// one page and the used ring on the following page; the repr and field
/// order below arrange exactly that.
// repr(C, align(4096)): read and written by the device.
#[repr(C, align(4096))]
pub struct VirtioDisk {
    /// The first region: a set (not a ring) of DMA descriptors, with which
    /// the driver tells the device where to read and write individual disk
    /// operations. Most commands consist of a "chain" (a linked list) of a
    /// couple of these descriptors.
    desc: [VirtqDesc; NUM],

    /// A ring in which the driver writes descriptor numbers that it would
    /// like the device to process. It only includes the head descriptor of
    /// each chain.
    avail: VirtqAvail,

    /// A ring in which the device writes descriptor numbers that it has
    /// finished processing (just the head of each chain).
    used: VirtqUsed,

    // Driver-side bookkeeping, not part of the device-visible layout.
    /// Bitmask of free descriptors; bit i set = desc[i] is free.
    free: u16,

    /// We have looked this far in used.ring.
    used_idx: u16,

    inflight: [Inflight; NUM],

    /// Disk command headers, one-for-one with descriptors, for convenience.
    ops: [VirtioBlkReq; NUM],
}

const_assert!(NUM <= 16); // the free bitmask is a u16

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_ring_begins_on_the_second_page() {
        let disk = VirtioDisk::new();
        let base = &disk as *const VirtioDisk as usize;
        let used = &disk.used as *const _ as usize;
        assert_eq!(used - base, 4096);
        // The descriptor table and avail ring fit in the first page.
        assert!(
            core::mem::size_of::<[VirtqDesc; NUM]>() + core::mem::size_of::<VirtqAvail>() <= 4096
        );
    }
}

// SAFETY: the raw addresses inside desc are only meaningful to the device;
// the driver state is only touched under the surrounding lock.
unsafe impl Send for VirtioDisk {}

impl VirtioDisk {
    pub const fn new() -> Self {
        Self {
            desc: [VirtqDesc::zero(); NUM],
            avail: VirtqAvail::zero(),
            used: VirtqUsed::zero(),
            free: (1 << NUM) - 1,
            used_idx: 0,
            inflight: [Inflight::zero(); NUM],
            ops: [VirtioBlkReq::zero(); NUM],
        }
    }

    /// Find a free descriptor, mark it non-free, return its index.
    fn alloc_desc(&mut self) -> Option<usize> {
        let idx = (0..NUM).find(|i| self.free & (1 << i) != 0)?;
        self.free &= !(1 << idx);
        Some(idx)
    }

    /// Allocate the three descriptors a disk transfer always uses (they
    /// need not be contiguous). Frees the partial allocation on failure.
    fn alloc_three_descriptors(&mut self) -> Option<[usize; 3]> {
        let mut descs = ArrayVec::<usize, 3>::new();

        for _ in 0..3 {
            match self.alloc_desc() {
                Some(idx) => descs.push(idx),
                None => {
                    for idx in descs {
                        self.free_desc(idx);
                    }
                    return None;
                }
            }
        }

        descs.into_inner().ok()
    }

    fn free_desc(&mut self, idx: usize) {
        assert_eq!(self.free & (1 << idx), 0, "VirtioDisk::free_desc");
        self.desc[idx] = VirtqDesc::zero();
        self.free |= 1 << idx;
    }
}

impl Disk {
    /// Initialize the device and publish the virtqueue.
    ///
    /// # Safety
    ///
    /// Must run once at boot, after the kernel page table maps the virtio
    /// mmio window, and before any disk request.
    pub unsafe fn init(&self) {
        MmioRegs::check_virtio_disk();

        // Reset the device.
        let mut status = VirtioStatus::empty();
        MmioRegs::set_status(status);

        // Set the ACKNOWLEDGE status bit.
        status.insert(VirtioStatus::ACKNOWLEDGE);
        MmioRegs::set_status(status);

        // Set the DRIVER status bit.
        status.insert(VirtioStatus::DRIVER);
        MmioRegs::set_status(status);

        // Negotiate features, masking off everything this driver does not
        // implement.
        let features = MmioRegs::get_features()
            - (VirtioFeatures::BLK_F_RO
                | VirtioFeatures::BLK_F_SCSI
                | VirtioFeatures::BLK_F_CONFIG_WCE
                | VirtioFeatures::BLK_F_MQ
                | VirtioFeatures::F_ANY_LAYOUT
                | VirtioFeatures::RING_F_EVENT_IDX
                | VirtioFeatures::RING_F_INDIRECT_DESC);
        MmioRegs::set_features(features);

        // Tell the device that feature negotiation is complete, and check
        // that it accepted.
        status.insert(VirtioStatus::FEATURES_OK);
        MmioRegs::set_status(status);
        assert!(
            MmioRegs::get_status().contains(VirtioStatus::FEATURES_OK),
            "virtio disk FEATURES_OK unset"
        );

        // The legacy interface addresses the queue by guest page number.
        unsafe {
            MmioRegs::GuestPageSize.write(PGSIZE as u32);

            // Initialize queue 0 with the virtqueue's page number.
            MmioRegs::select_and_init_queue(
                0,
                NUM as u32,
                (self.get_mut_raw() as usize >> PGSHIFT) as u32,
            );
        }

        // Tell the device we're completely ready.
        status.insert(VirtioStatus::DRIVER_OK);
        MmioRegs::set_status(status);

        // plic.rs and trap.rs arrange for interrupts from VIRTIO0_IRQ.
    }

    /// Return a locked buffer with the contents of the indicated block.
    pub fn read(&'static self, dev: u32, blockno: u32) -> Buf {
        let mut buf = kernel().bcache().get(dev, blockno);
        if !buf.deref_inner().valid {
            self.rw(&mut buf, false);
            buf.deref_inner_mut().valid = true;
        }
        buf
    }

    /// Write the buffer's data to its block on the disk.
    pub fn write(&'static self, buf: &mut Buf) {
        self.rw(buf, true)
    }

    /// Issue one three-descriptor request and sleep until the completion
    /// interrupt hands the buffer back.
    fn rw(&'static self, b: &mut Buf, write: bool) {
        // The virtio spec's legacy block operations use three descriptors:
        // one for type/reserved/sector, one for the data, one for a
        // one-byte status result.
        let sector = b.blockno as u64 * (BSIZE / 512) as u64;

        let mut guard = self.lock();

        // Allocate the three descriptors.
        let desc = loop {
            match guard.alloc_three_descriptors() {
                Some(desc) => break desc,
                // Descriptor exhaustion: wait for some request to finish
                // and free its chain.
                None => guard.sleep(),
            }
        };
        let [head, data, status] = desc;

        // Format the three descriptors. qemu's virtio-blk.c reads them.
        let this = &mut *guard;

        this.ops[head] = VirtioBlkReq {
            typ: if write { VIRTIO_BLK_T_OUT } else { VIRTIO_BLK_T_IN },
            reserved: 0,
            sector,
        };

        this.desc[head] = VirtqDesc {
            addr: &this.ops[head] as *const _ as u64,
            len: mem::size_of::<VirtioBlkReq>() as u32,
            flags: VirtqDescFlags::NEXT,
            next: data as u16,
        };

        // The device reads the buffer for a write and writes it for a
        // read.
        this.desc[data] = VirtqDesc {
            addr: b.data().as_ptr() as u64,
            len: BSIZE as u32,
            flags: if write {
                VirtqDescFlags::NEXT
            } else {
                VirtqDescFlags::NEXT | VirtqDescFlags::WRITE
            },
            next: status as u16,
        };

        // The device writes 0 into the status byte on success.
        this.inflight[head].status = 0xff;
        this.desc[status] = VirtqDesc {
            addr: &this.inflight[head].status as *const _ as u64,
            len: 1,
            flags: VirtqDescFlags::WRITE,
            next: 0,
        };

        // Record the buffer for the completion handler.
        this.inflight[head].buf_idx = Some(b.cache_idx());
        b.entry().owned_by_disk.store(true, Ordering::Release);

        // Tell the device the first index of our chain of descriptors.
        let ring_idx = this.avail.idx as usize % NUM;
        this.avail.ring[ring_idx] = head as u16;

        fence(Ordering::SeqCst);

        // Tell the device another avail ring entry is available.
        this.avail.idx = this.avail.idx.wrapping_add(1);

        fence(Ordering::SeqCst);

        // SAFETY: all three descriptors of the chain are well formed.
        unsafe { MmioRegs::notify_queue(0) };

        // Wait for the interrupt handler to say the request has finished.
        while b.entry().owned_by_disk.load(Ordering::Acquire) {
            b.entry().disk_waitchannel.sleep(&mut guard);
        }

        guard.inflight[head].buf_idx = None;
        for &idx in desc.iter() {
            guard.free_desc(idx);
        }

        // Freed descriptors: wake anyone waiting in the allocation loop.
        guard.wakeup();
    }

    /// The completion interrupt: drain the used ring, handing each finished
    /// buffer back to its sleeping requester.
    pub fn intr(&self) {
        let mut guard = self.lock();

        // The device won't raise another interrupt until we tell it we've
        // seen this one. This may race with the device writing new entries
        // to the used ring; in that case we may process the new completions
        // in this call and have nothing to do in the next one, which is
        // harmless.
        MmioRegs::intr_ack_all();

        fence(Ordering::SeqCst);

        // The device increments used.id when it adds an entry to the used
        // ring.
        let this = &mut *guard;
        // SAFETY: the device DMA-writes this field; a volatile read is the
        // sound way to observe it.
        while this.used_idx != unsafe { ptr::read_volatile(&this.used.id) } {
            fence(Ordering::SeqCst);
            let id = this.used.ring[this.used_idx as usize % NUM].id as usize;

            assert_eq!(this.inflight[id].status, 0, "VirtioDisk::intr status");

            let buf_idx = this.inflight[id].buf_idx.expect("VirtioDisk::intr");
            let entry = kernel().bcache().entry(buf_idx);

            // The disk is done with the buffer.
            entry.owned_by_disk.store(false, Ordering::Release);
            entry.disk_waitchannel.wakeup();

            this.used_idx = this.used_idx.wrapping_add(1);
        }
    }
}
