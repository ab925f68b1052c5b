//! Interfaces to the collaborators that own physical memory, IOVA space, cache maintenance, and
//! the address-translation unit.
//!
//! Every method here may be called from a context that must not block. Implementations must use
//! non-blocking (atomic) allocation primitives.

use crate::{Direction, Protection};

/// A physical page of memory.
///
/// The copy primitives hide any transient CPU mapping the page needs (e.g. for pages outside
/// the kernel's direct map).
pub trait Page: Send + Sync + 'static {
    /// Physical address of the page.
    fn phys(&self) -> u64;

    /// Copy `dst.len()` bytes starting at `offset` out of the page.
    fn read(&self, offset: usize, dst: &mut [u8]);

    /// Copy `src` into the page starting at `offset`.
    fn write(&self, offset: usize, src: &[u8]);

    /// Zero `len` bytes starting at `offset`.
    fn zero(&self, offset: usize, len: usize);
}

/// Where a page may be allocated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Zone {
    /// Memory that is permanently mapped for the CPU (cheap to copy to and from).
    Low,
    /// Any memory.
    Any,
}

/// Allocator of physical pages.
pub trait Pages: Clone + Send + Sync + 'static {
    type Page: Page;

    /// Allocate a page, preferably on NUMA `node`, without blocking.
    fn alloc_page(&self, node: Option<u32>, zone: Zone) -> Option<Self::Page>;

    /// Return a page to the allocator.
    fn free_page(&self, page: Self::Page);
}

/// Allocator of I/O virtual address space.
pub trait Iova: Clone + Send + Sync + 'static {
    /// Reserve `size` bytes of IOVA space aligned to `align` (a power of two).
    fn reserve(&self, size: u64, align: u64) -> Option<u64>;

    /// Release a range previously returned by [Iova::reserve].
    fn release(&self, iova: u64, size: u64);

    /// Size, in bytes, of the address range the device can reach.
    fn limit(&self) -> u64;
}

/// The address-translation (IOMMU) domain a device is attached to.
pub trait Translate: Pages {
    /// Map `pages` contiguously at `iova`, returning the number of bytes mapped.
    ///
    /// Any translation already present in the range is replaced.
    fn map(&self, iova: u64, pages: &[Self::Page], prot: Protection) -> usize;

    /// Remove all translations in `[iova, iova + size)`. Returns false if the translation unit
    /// could not confirm the range is no longer reachable by the device.
    fn unmap(&self, iova: u64, size: usize) -> bool;
}

/// Cache maintenance for devices that do not snoop CPU caches.
pub trait Coherency: Pages {
    /// Make device writes to `[offset, offset + len)` of `page` visible to the CPU.
    fn sync_for_cpu(&self, page: &Self::Page, offset: usize, len: usize, dir: Direction);

    /// Make CPU writes to `[offset, offset + len)` of `page` visible to the device.
    fn sync_for_device(&self, page: &Self::Page, offset: usize, len: usize, dir: Direction);
}

/// Everything bounce buffers need from the platform.
pub trait Platform: Pages + Iova + Translate + Coherency {}

impl<T: Pages + Iova + Translate + Coherency> Platform for T {}
