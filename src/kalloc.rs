//! Physical memory allocator, for user processes, kernel stacks,
//! page-table pages, and pipe buffers. Allocates whole 4096-byte pages.

use core::mem;
use core::ptr;

use crate::{
    memlayout::PHYSTOP,
    page::Page,
    riscv::{pgrounddown, pgroundup, PGSIZE},
};

extern "C" {
    // First address after the kernel image, defined by kernel.ld.
    static mut end: [u8; 0];
}

struct Run {
    next: *mut Run,
}

/// # Safety
///
/// * This singly linked list has no cycle.
/// * If head is null the list is empty; otherwise head is its first
///   element, and every element is the address of a free page between
///   `end` and `PHYSTOP`.
pub struct Kmem {
    head: *mut Run,
}

// The raw head pointer is only touched under the Spinlock<Kmem> in the
// kernel singleton.
unsafe impl Send for Kmem {}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    /// Create pages between `end` and `PHYSTOP`.
    ///
    /// # Safety
    ///
    /// There must be no existing pages, which implies this method is called
    /// only once.
    pub unsafe fn init(&mut self) {
        // SAFETY: taking the address of a static is safe.
        let pa_start = pgroundup(unsafe { end.as_ptr() as usize });
        let pa_end = pgrounddown(PHYSTOP);
        for pa in num_iter::range_step(pa_start, pa_end, PGSIZE) {
            // SAFETY:
            // * pa is page-aligned and lies in [end, PHYSTOP);
            // * the safety condition of this method guarantees the region
            //   is unreferenced.
            self.free(unsafe { Page::from_usize(pa) });
        }
    }

    pub fn free(&mut self, mut page: Page) {
        let pa = page.addr();
        debug_assert!(
            // SAFETY: taking the address of a static is safe.
            pa % PGSIZE == 0 && (unsafe { end.as_ptr() as usize }..PHYSTOP).contains(&pa),
            "Kmem::free"
        );

        // Fill with junk to catch dangling refs.
        page.write_bytes(1);

        let r = page.into_usize() as *mut Run;
        // SAFETY: by the invariant of Page, r is not already in the list,
        // so no cycle is created.
        unsafe { (*r).next = self.head };
        self.head = r;
    }

    pub fn alloc(&mut self) -> Option<Page> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: head is non-null and the list structure is maintained by
        // the invariant.
        let next = unsafe { (*self.head).next };
        // SAFETY: the first element is a valid free page by the invariant.
        let mut page = unsafe { Page::from_usize(mem::replace(&mut self.head, next) as usize) };

        // Fill with junk; the list node in the first bytes dies here too.
        page.write_bytes(5);
        Some(page)
    }
}
