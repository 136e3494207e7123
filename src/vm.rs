//! Sv39 page tables and per-address-space memory management.

use core::{cmp, marker::PhantomData, mem, slice};

use zerocopy::{AsBytes, FromBytes};

use crate::{
    error::{KernelError, Result},
    fs::InodeGuard,
    kernel::kernel,
    memlayout::{
        kstack, KERNBASE, PHYSTOP, PLIC, TRAMPOLINE, TRAPFRAME, UART0, VIRTIO0,
    },
    page::Page,
    param::{KSTACKPAGES, NPROC},
    riscv::{
        make_satp, pa2pte, pgrounddown, pgroundup, pte2pa, pxshift, sfence_vma, w_satp, PteFlags,
        MAXVA, PGSIZE, PXMASK,
    },
};

extern "C" {
    // kernel.ld sets this to the end of kernel code.
    static mut etext: [u8; 0];

    // The trampoline page, shared between user and kernel space.
    static mut trampoline: [u8; 0];
}

pub trait Addr: Copy + From<usize> {
    fn into_usize(self) -> usize;
    fn is_null(self) -> bool;
    fn is_page_aligned(self) -> bool;
    fn add(self, rhs: usize) -> Self;
}

macro_rules! define_addr_type {
    ($typ:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $typ(usize);

        impl From<usize> for $typ {
            fn from(value: usize) -> Self {
                Self(value)
            }
        }

        impl Addr for $typ {
            fn into_usize(self) -> usize {
                self.0
            }

            fn is_null(self) -> bool {
                self.0 == 0
            }

            fn is_page_aligned(self) -> bool {
                self.0 % PGSIZE == 0
            }

            fn add(self, rhs: usize) -> Self {
                Self(self.0 + rhs)
            }
        }
    };
}

define_addr_type!(PAddr);
define_addr_type!(KVAddr);
define_addr_type!(UVAddr);

pub trait VAddr: Addr {
    /// The 9-bit page-table index for this address at the given level.
    #[inline]
    fn px(&self, level: usize) -> usize {
        (self.into_usize() >> pxshift(level)) & PXMASK
    }
}

impl VAddr for KVAddr {}
impl VAddr for UVAddr {}

/// # Safety
///
/// If `is_table()` is true, the entry refers to a valid page-table page.
/// `inner` is initially 0, which satisfies the invariant.
#[derive(Default)]
struct PageTableEntry {
    inner: usize,
}

impl PageTableEntry {
    fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.inner)
    }

    fn pa(&self) -> PAddr {
        pte2pa(self.inner).into()
    }

    fn is_valid(&self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    fn is_user(&self) -> bool {
        self.flags().contains(PteFlags::V | PteFlags::U)
    }

    fn is_writable(&self) -> bool {
        self.flags().contains(PteFlags::W)
    }

    fn is_table(&self) -> bool {
        self.is_valid() && !self.flags().intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }

    fn is_data(&self) -> bool {
        self.is_valid() && self.flags().intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }

    /// Make the entry refer to a given page-table page.
    fn set_table(&mut self, page: *mut RawPageTable) {
        self.inner = pa2pte(page as usize) | PteFlags::V.bits();
    }

    /// Make the entry refer to a given address with a given permission.
    /// The permission must include at least one of R, W and X; otherwise
    /// the entry would read as an interior page-table node.
    fn set_entry(&mut self, pa: PAddr, perm: PteFlags) {
        assert!(perm.intersects(PteFlags::R | PteFlags::W | PteFlags::X));
        self.inner = pa2pte(pa.into_usize()) | (perm | PteFlags::V).bits();
    }

    /// Make the entry inaccessible to user code by clearing PteFlags::U.
    fn clear_user(&mut self) {
        self.inner &= !PteFlags::U.bits();
    }

    /// Invalidate the entry by zeroing every bit.
    fn invalidate(&mut self) {
        self.inner = 0;
    }

    /// `Some(..)` if the entry refers to a page-table page; `None` if it is
    /// a data leaf or invalid.
    fn as_table_mut(&mut self) -> Option<&mut RawPageTable> {
        if self.is_table() {
            // SAFETY: the invariant of PageTableEntry.
            Some(unsafe { &mut *(pte2pa(self.inner) as *mut RawPageTable) })
        } else {
            None
        }
    }
}

const PTE_PER_PT: usize = PGSIZE / mem::size_of::<PageTableEntry>();

/// # Safety
///
/// Lives in exactly one page obtained from Kmem, so
/// `Page::from_usize(self as *const _ as usize)` is sound.
struct RawPageTable {
    inner: [PageTableEntry; PTE_PER_PT],
}

impl RawPageTable {
    /// Make a new empty raw page table by allocating a page.
    fn new() -> Result<*mut RawPageTable> {
        let mut page = kernel().alloc().ok_or(KernelError::OutOfMemory)?;
        page.write_bytes(0);
        // This line guarantees the invariant.
        Ok(page.into_usize() as *mut RawPageTable)
    }

    /// The page table the `index`th entry refers to, allocating one when
    /// the entry is invalid and `alloc` is true. `None` when the entry is a
    /// data leaf, or when it is invalid and `alloc` is false, or when the
    /// allocation fails.
    fn get_table_mut(&mut self, index: usize, alloc: bool) -> Option<&mut RawPageTable> {
        let pte = &mut self.inner[index];
        if !pte.is_valid() {
            if !alloc {
                return None;
            }
            let table = Self::new().ok()?;
            pte.set_table(table);
        }
        pte.as_table_mut()
    }

    /// The `index`th entry, which must not refer to a page-table page.
    fn get_entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        let pte = &mut self.inner[index];
        assert!(!pte.is_table());
        pte
    }

    /// Recursively free page-table pages. All leaf mappings must already
    /// have been removed.
    ///
    /// # Safety
    ///
    /// Frees the page holding this table; it must not be used afterwards.
    unsafe fn free_walk(&mut self) {
        for pte in &mut self.inner {
            if let Some(table) = pte.as_table_mut() {
                // SAFETY: the child table is not used anymore.
                unsafe { table.free_walk() };
                pte.invalidate();
            }
        }
        // SAFETY: the invariant of RawPageTable.
        let page = unsafe { Page::from_usize(self.inner.as_ptr() as usize) };
        kernel().free(page);
    }
}

/// # Safety
///
/// `ptr` uniquely refers to a valid three-level RawPageTable.
pub struct PageTable<A: VAddr> {
    ptr: *mut RawPageTable,
    _marker: PhantomData<A>,
}

// SAFETY: the table is owned; nothing in it is tied to a thread.
unsafe impl<A: VAddr> Send for PageTable<A> {}

impl<A: VAddr> PageTable<A> {
    fn new() -> Result<Self> {
        Ok(Self {
            ptr: RawPageTable::new()?,
            _marker: PhantomData,
        })
    }

    fn as_usize(&self) -> usize {
        self.ptr as usize
    }

    /// The PTE in this page table that corresponds to virtual address `va`.
    /// If `alloc` is true, create any required page-table pages.
    ///
    /// The risc-v Sv39 scheme has three levels of page-table pages. A
    /// page-table page contains 512 64-bit PTEs. A 64-bit virtual address
    /// is split into five fields:
    ///   39..63 -- must be zero.
    ///   30..38 -- 9 bits of level-2 index.
    ///   21..29 -- 9 bits of level-1 index.
    ///   12..20 -- 9 bits of level-0 index.
    ///    0..11 -- 12 bits of byte offset within the page.
    fn get_mut(&mut self, va: A, alloc: bool) -> Option<&mut PageTableEntry> {
        assert!(va.into_usize() < MAXVA, "PageTable::get_mut");
        // SAFETY: self.ptr is valid by the invariant.
        let mut table = unsafe { &mut *self.ptr };
        for level in (1..3).rev() {
            table = table.get_table_mut(va.px(level), alloc)?;
        }
        Some(table.get_entry_mut(va.px(0)))
    }

    /// Create a PTE for virtual address `va`, pointing at physical address
    /// `pa`. Fails if a needed page-table page cannot be allocated, and
    /// panics if a mapping is already present.
    fn insert(&mut self, va: A, pa: PAddr, perm: PteFlags) -> Result<()> {
        let a = pgrounddown(va.into_usize());
        let pte = self
            .get_mut(A::from(a), true)
            .ok_or(KernelError::OutOfMemory)?;
        assert!(!pte.is_valid(), "PageTable::insert: remap");
        pte.set_entry(pa, perm);
        Ok(())
    }

    /// Create PTEs for virtual addresses starting at `va` that refer to
    /// physical addresses starting at `pa`. `va` and `size` must be
    /// page-aligned and `size` positive.
    fn insert_range(&mut self, va: A, size: usize, pa: PAddr, perm: PteFlags) -> Result<()> {
        let start = va.into_usize();
        assert!(start % PGSIZE == 0 && size % PGSIZE == 0, "insert_range: not aligned");
        assert!(size > 0, "insert_range: size");
        for i in num_iter::range_step(0, size, PGSIZE) {
            self.insert(A::from(start + i), PAddr::from(pa.into_usize() + i), perm)?;
        }
        Ok(())
    }

    /// Remove the mapping for `va` and return the physical address it
    /// mapped. Panics unless the PTE is a valid data leaf.
    fn remove(&mut self, va: A) -> Option<PAddr> {
        let pte = self.get_mut(va, false)?;
        assert!(pte.is_data(), "PageTable::remove");
        let pa = pte.pa();
        pte.invalidate();
        Some(pa)
    }
}

impl<A: VAddr> Drop for PageTable<A> {
    fn drop(&mut self) {
        // SAFETY: self.ptr is valid and is not used after this.
        unsafe { (*self.ptr).free_walk() };
    }
}

/// Manages the page table and the allocated pages of a process.
///
/// # Safety
///
/// Writing pt for the page-table mapping:
/// * Every mapped va and pt(va) are page-aligned.
/// * pt(TRAMPOLINE) = trampoline, pt(TRAPFRAME) = the process's trapframe.
/// * For every other mapped va, the page at pt(va) is owned by this
///   UserMemory, and `Page::from_usize(pt(va))` is sound.
/// * The user image occupies [0, pgroundup(size)); nothing else is mapped
///   below TRAPFRAME.
pub struct UserMemory {
    /// Page table of the process.
    page_table: PageTable<UVAddr>,
    /// Size of process memory in bytes.
    size: usize,
}

impl UserMemory {
    /// A user page table with no user pages, but with the trampoline and
    /// the given trapframe page mapped. If `src_opt` is `Some(src)`, loads
    /// `src` (shorter than a page) at address 0 with R+W+X+U, for the very
    /// first process.
    pub fn new(trap_frame: PAddr, src_opt: Option<&[u8]>) -> Result<Self> {
        let mut page_table = PageTable::new()?;

        // Map the trampoline code (for system call return) at the highest
        // user virtual address. Only the supervisor uses it on the way
        // to/from user space, so not PTE_U.
        page_table.insert(
            TRAMPOLINE.into(),
            // SAFETY: taking the address of a static is safe.
            PAddr::from(unsafe { trampoline.as_mut_ptr() as usize }),
            PteFlags::R | PteFlags::X,
        )?;

        // Map the trapframe just below TRAMPOLINE, for the trampoline code.
        page_table.insert(TRAPFRAME.into(), trap_frame, PteFlags::R | PteFlags::W)?;

        let mut memory = Self {
            page_table,
            size: 0,
        };

        if let Some(src) = src_opt {
            assert!(src.len() < PGSIZE, "UserMemory::new: more than a page");
            let mut page = kernel().alloc().ok_or(KernelError::OutOfMemory)?;
            page.write_bytes(0);
            page[..src.len()].copy_from_slice(src);
            memory
                .push_page(page, PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U)
                .map_err(|page| {
                    kernel().free(page);
                    KernelError::OutOfMemory
                })?;
        }

        Ok(memory)
    }

    /// A deep copy of this memory: both the page table and the physical
    /// pages. Frees everything it allocated on failure.
    pub fn clone(&mut self, trap_frame: PAddr) -> Result<Self> {
        let new = Self::new(trap_frame, None)?;
        let mut new = scopeguard::guard(new, |mut new| {
            let _ = new.dealloc(0);
        });
        for i in num_iter::range_step(0, self.size, PGSIZE) {
            let pte = self
                .page_table
                .get_mut(UVAddr::from(i), false)
                .expect("UserMemory::clone: pte not found");
            assert!(pte.is_valid(), "UserMemory::clone: invalid page");

            let pa = pte.pa();
            let flags = pte.flags();
            let mut page = kernel().alloc().ok_or(KernelError::OutOfMemory)?;
            // SAFETY: pa is mapped in self, hence the address of a page by
            // the invariant.
            let src = unsafe { slice::from_raw_parts(pa.into_usize() as *const u8, PGSIZE) };
            page.copy_from_slice(src);
            new.push_page(page, flags).map_err(|page| {
                kernel().free(page);
                KernelError::OutOfMemory
            })?;
        }
        let mut new = scopeguard::ScopeGuard::into_inner(new);
        new.size = self.size;
        Ok(new)
    }

    /// The size of the user image in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The satp value that installs this page table.
    pub fn satp(&self) -> usize {
        make_satp(self.page_table.as_usize())
    }

    /// Load data from a file into memory at virtual address `va`, which
    /// must be page-aligned. The pages from va to va + sz must already be
    /// mapped.
    pub fn load_file(
        &mut self,
        va: UVAddr,
        ip: &mut InodeGuard<'_>,
        offset: u32,
        sz: u32,
    ) -> Result<()> {
        assert!(va.is_page_aligned(), "load_file: va must be page aligned");
        for i in num_iter::range_step(0, sz, PGSIZE as u32) {
            let dst = self
                .page_slice(va.add(i as usize))
                .expect("load_file: address should exist");
            let n = cmp::min((sz - i) as usize, PGSIZE);
            let read = ip.read_bytes_kernel(&mut dst[..n], offset + i);
            if read != n {
                return Err(KernelError::ExecFailed);
            }
        }
        Ok(())
    }

    /// Allocate PTEs and physical memory to grow the process to `newsz`,
    /// which need not be page-aligned. The new pages are mapped
    /// R+U plus `perm`. Deallocates the partial growth on failure.
    pub fn alloc(&mut self, newsz: usize, perm: PteFlags) -> Result<usize> {
        if newsz <= self.size {
            return Ok(self.size);
        }

        let oldsz = self.size;
        let mut this = scopeguard::guard(self, |this| {
            let _ = this.dealloc(oldsz);
        });
        while pgroundup(this.size) < pgroundup(newsz) {
            let mut page = kernel().alloc().ok_or(KernelError::OutOfMemory)?;
            page.write_bytes(0);
            this.push_page(page, PteFlags::R | PteFlags::U | perm)
                .map_err(|page| {
                    kernel().free(page);
                    KernelError::OutOfMemory
                })?;
        }
        let this = scopeguard::ScopeGuard::into_inner(this);
        this.size = newsz;
        Ok(newsz)
    }

    /// Deallocate user pages to bring the process size to `newsz`, which
    /// need not be page-aligned. Returns the new size.
    pub fn dealloc(&mut self, newsz: usize) -> usize {
        if self.size <= newsz {
            return self.size;
        }

        while pgroundup(newsz) < pgroundup(self.size) {
            if let Some(page) = self.pop_page() {
                kernel().free(page);
            }
        }
        self.size = newsz;
        newsz
    }

    /// Grow or shrink the process by `n` bytes. Returns the old size.
    pub fn resize(&mut self, n: i32) -> Result<usize> {
        let size = self.size;
        match n.cmp(&0) {
            cmp::Ordering::Equal => (),
            cmp::Ordering::Greater => {
                let _ = self.alloc(size + n as usize, PteFlags::W)?;
            }
            cmp::Ordering::Less => {
                let dec = n.unsigned_abs() as usize;
                if dec > size {
                    return Err(KernelError::BadArg);
                }
                let _ = self.dealloc(size - dec);
            }
        }
        Ok(size)
    }

    /// Mark a PTE invalid for user access; used for the user stack guard
    /// page.
    pub fn clear_user(&mut self, va: UVAddr) {
        self.page_table
            .get_mut(va, false)
            .expect("UserMemory::clear_user")
            .clear_user();
    }

    /// Copy from kernel to user: `src` to virtual address `dstva`.
    pub fn copy_out_bytes(&mut self, dstva: UVAddr, src: &[u8]) -> Result<()> {
        let mut dst = dstva.into_usize();
        let mut len = src.len();
        let mut offset = 0;
        while len > 0 {
            let va = pgrounddown(dst);
            let poffset = dst - va;
            let page = self.writable_page_slice(va.into())?;
            let n = cmp::min(PGSIZE - poffset, len);
            page[poffset..poffset + n].copy_from_slice(&src[offset..offset + n]);
            len -= n;
            offset += n;
            dst += n;
        }
        Ok(())
    }

    /// Copy a value from kernel to user.
    pub fn copy_out<T: AsBytes>(&mut self, dstva: UVAddr, src: &T) -> Result<()> {
        self.copy_out_bytes(dstva, src.as_bytes())
    }

    /// Copy from user to kernel: virtual address `srcva` into `dst`.
    pub fn copy_in_bytes(&mut self, dst: &mut [u8], srcva: UVAddr) -> Result<()> {
        let mut src = srcva.into_usize();
        let mut len = dst.len();
        let mut offset = 0;
        while len > 0 {
            let va = pgrounddown(src);
            let poffset = src - va;
            let page = self.user_page_slice(va.into())?;
            let n = cmp::min(PGSIZE - poffset, len);
            dst[offset..offset + n].copy_from_slice(&page[poffset..poffset + n]);
            len -= n;
            offset += n;
            src += n;
        }
        Ok(())
    }

    /// Copy a value from user to kernel.
    pub fn copy_in<T: AsBytes + FromBytes>(&mut self, dst: &mut T, srcva: UVAddr) -> Result<()> {
        self.copy_in_bytes(dst.as_bytes_mut(), srcva)
    }

    /// Copy a NUL-terminated string from user to kernel: bytes from virtual
    /// address `srcva` into `dst` until a NUL, or `NotNullTerminated` when
    /// `dst` fills up first.
    pub fn copy_in_str(&mut self, dst: &mut [u8], srcva: UVAddr) -> Result<()> {
        let mut src = srcva.into_usize();
        let mut offset = 0;
        let mut max = dst.len();
        while max > 0 {
            let va = pgrounddown(src);
            let poffset = src - va;
            let page = self.user_page_slice(va.into())?;
            let n = cmp::min(PGSIZE - poffset, max);

            let from = &page[poffset..poffset + n];
            match from.iter().position(|c| *c == 0) {
                Some(i) => {
                    dst[offset..offset + i + 1].copy_from_slice(&from[..i + 1]);
                    return Ok(());
                }
                None => {
                    dst[offset..offset + n].copy_from_slice(from);
                    max -= n;
                    offset += n;
                    src += n;
                }
            }
        }
        Err(KernelError::NotNullTerminated)
    }

    /// The page mapped at `va`, as a slice, without permission checks.
    /// Used by the loader on pages it just mapped itself.
    fn page_slice(&mut self, va: UVAddr) -> Option<&mut [u8]> {
        if va.into_usize() >= TRAPFRAME {
            return None;
        }
        let pte = self.page_table.get_mut(va, false)?;
        if !pte.is_valid() {
            return None;
        }
        // SAFETY: va < TRAPFRAME, so pte.pa() is the address of a page
        // owned by this UserMemory.
        Some(unsafe { slice::from_raw_parts_mut(pte.pa().into_usize() as *mut u8, PGSIZE) })
    }

    /// The user-accessible page mapped at `va`, checking the U bit.
    fn user_page_slice(&mut self, va: UVAddr) -> Result<&mut [u8]> {
        let pte = self.user_pte(va)?;
        // SAFETY: same as page_slice.
        Ok(unsafe { slice::from_raw_parts_mut(pte.pa().into_usize() as *mut u8, PGSIZE) })
    }

    /// Like `user_page_slice`, additionally requiring the W bit.
    fn writable_page_slice(&mut self, va: UVAddr) -> Result<&mut [u8]> {
        let pte = self.user_pte(va)?;
        if !pte.is_writable() {
            return Err(KernelError::PteNotWritable);
        }
        // SAFETY: same as page_slice.
        Ok(unsafe { slice::from_raw_parts_mut(pte.pa().into_usize() as *mut u8, PGSIZE) })
    }

    fn user_pte(&mut self, va: UVAddr) -> Result<&mut PageTableEntry> {
        if va.into_usize() >= TRAPFRAME {
            return Err(KernelError::VaOutOfRange);
        }
        let pte = self
            .page_table
            .get_mut(va, false)
            .filter(|pte| pte.is_valid())
            .ok_or(KernelError::PteNotPresent)?;
        if !pte.is_user() {
            return Err(KernelError::PteNotUser);
        }
        Ok(pte)
    }

    /// Grow the image by appending a given page with given flags.
    /// On failure the page is handed back to the caller.
    fn push_page(&mut self, page: Page, perm: PteFlags) -> core::result::Result<(), Page> {
        let pa = page.into_usize();
        let size = pgroundup(self.size);
        self.page_table
            .insert(size.into(), pa.into(), perm)
            // SAFETY: pa is the address of the given page.
            .map_err(|_| unsafe { Page::from_usize(pa) })?;
        self.size = size + PGSIZE;
        Ok(())
    }

    /// Shrink the image by removing the most recently appended page.
    fn pop_page(&mut self) -> Option<Page> {
        if self.size == 0 {
            return None;
        }
        self.size = pgroundup(self.size) - PGSIZE;
        let pa = self
            .page_table
            .remove(self.size.into())
            .expect("UserMemory::pop_page")
            .into_usize();
        // SAFETY: pa was mapped in this page table, hence the address of a
        // page owned by this UserMemory.
        Some(unsafe { Page::from_usize(pa) })
    }
}

impl Drop for UserMemory {
    fn drop(&mut self) {
        let _ = self.dealloc(0);
    }
}

/// Manages the kernel's own page table. Every physical address it maps is
/// either device memory or the kernel image and RAM, none of which came
/// from `Kmem::alloc` (except the kernel stacks, which are never freed), so
/// it carries no ownership invariant like `UserMemory`.
pub struct KernelMemory {
    /// Page table of the kernel.
    page_table: PageTable<KVAddr>,
}

// SAFETY: after construction the kernel page table is never written again;
// harts only read its root address through init_hart.
unsafe impl Sync for KernelMemory {}

impl KernelMemory {
    /// Make the kernel's direct-map page table.
    pub fn new() -> Result<Self> {
        let mut page_table = PageTable::new()?;

        // Uart registers.
        page_table.insert_range(
            UART0.into(),
            PGSIZE,
            UART0.into(),
            PteFlags::R | PteFlags::W,
        )?;

        // Virtio mmio disk interface.
        page_table.insert_range(
            VIRTIO0.into(),
            PGSIZE,
            VIRTIO0.into(),
            PteFlags::R | PteFlags::W,
        )?;

        // PLIC.
        page_table.insert_range(
            PLIC.into(),
            0x40_0000,
            PLIC.into(),
            PteFlags::R | PteFlags::W,
        )?;

        // Map kernel text executable and read-only.
        // SAFETY: taking the address of a static is safe.
        let et = unsafe { etext.as_mut_ptr() as usize };
        page_table.insert_range(
            KERNBASE.into(),
            et - KERNBASE,
            KERNBASE.into(),
            PteFlags::R | PteFlags::X,
        )?;

        // Map kernel data and the physical RAM we'll make use of.
        page_table.insert_range(
            et.into(),
            PHYSTOP - et,
            et.into(),
            PteFlags::R | PteFlags::W,
        )?;

        // Map the trampoline for trap entry/exit to the highest virtual
        // address in the kernel.
        page_table.insert_range(
            TRAMPOLINE.into(),
            PGSIZE,
            // SAFETY: taking the address of a static is safe.
            PAddr::from(unsafe { trampoline.as_mut_ptr() as usize }),
            PteFlags::R | PteFlags::X,
        )?;

        // Allocate and map a two-page kernel stack for each process slot,
        // high in memory, each preceded by an invalid guard page.
        for i in 0..NPROC {
            let va = kstack(i);
            for page in 0..KSTACKPAGES {
                let pa = kernel().alloc().ok_or(KernelError::OutOfMemory)?.into_usize();
                page_table.insert_range(
                    (va + page * PGSIZE).into(),
                    PGSIZE,
                    pa.into(),
                    PteFlags::R | PteFlags::W,
                )?;
            }
        }

        Ok(Self { page_table })
    }

    /// Switch the hart's page-table register to the kernel's page table and
    /// enable paging.
    ///
    /// # Safety
    ///
    /// The page table must map the currently executing kernel text.
    pub unsafe fn init_hart(&self) {
        unsafe {
            w_satp(make_satp(self.page_table.as_usize()));
            sfence_vma();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_encodes_pa_and_flags() {
        let mut pte = PageTableEntry::default();
        assert!(!pte.is_valid());

        pte.set_entry(PAddr::from(0x8020_1000), PteFlags::R | PteFlags::W | PteFlags::U);
        assert!(pte.is_valid());
        assert!(pte.is_user());
        assert!(pte.is_writable());
        assert!(pte.is_data());
        assert!(!pte.is_table());
        assert_eq!(pte.pa().into_usize(), 0x8020_1000);

        pte.clear_user();
        assert!(!pte.is_user());
        assert!(pte.is_valid());

        pte.invalidate();
        assert!(!pte.is_valid());
    }

    #[test]
    fn interior_nodes_are_not_data_leaves() {
        let mut pte = PageTableEntry::default();
        pte.set_table(0x8030_0000 as *mut RawPageTable);
        assert!(pte.is_table());
        assert!(!pte.is_data());
    }

    #[test]
    fn va_index_helper_matches_px() {
        let va = UVAddr::from((1 << pxshift(2)) | (2 << pxshift(1)) | (3 << pxshift(0)));
        assert_eq!(va.px(2), 1);
        assert_eq!(va.px(1), 2);
        assert_eq!(va.px(0), 3);
    }
}
