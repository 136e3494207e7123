//! An owned 4096-byte page.

use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use crate::riscv::PGSIZE;

#[repr(align(4096))]
pub struct RawPage {
    inner: [u8; PGSIZE],
}

/// # Safety
///
/// * `ptr` is an aligned, valid pointer to a page-sized region that no one
///   else refers to. Ownership of the region moves with the `Page`.
/// * A `Page` is created only by `Kmem::alloc` (or from an address that
///   satisfies the above, via `from_usize`), so two live `Page`s never
///   overlap.
pub struct Page {
    ptr: NonNull<RawPage>,
}

// A `Page` is an owned buffer; nothing in it is tied to a thread.
unsafe impl Send for Page {}

impl Page {
    /// # Safety
    ///
    /// `addr` must be the page-aligned address of an otherwise unreferenced
    /// page-sized region, and ownership of that region moves into the
    /// returned `Page`.
    pub unsafe fn from_usize(addr: usize) -> Self {
        debug_assert_eq!(addr % PGSIZE, 0, "Page::from_usize");
        Self {
            // SAFETY: addr is nonzero since no page lives at address 0.
            ptr: unsafe { NonNull::new_unchecked(addr as *mut RawPage) },
        }
    }

    pub fn into_usize(self) -> usize {
        let addr = self.ptr.as_ptr() as usize;
        core::mem::forget(self);
        addr
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn write_bytes(&mut self, value: u8) {
        self.fill(value);
    }
}

impl Deref for Page {
    type Target = [u8; PGSIZE];

    fn deref(&self) -> &Self::Target {
        // SAFETY: we own the page.
        unsafe { &self.ptr.as_ref().inner }
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: we own the page exclusively.
        unsafe { &mut self.ptr.as_mut().inner }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        // A leaked page is unrecoverable; every Page must go back through
        // Kmem::free or be dismantled with into_usize.
        panic!("Page must never drop");
    }
}
