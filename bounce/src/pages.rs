use crate::{Pages, Zone, PAGE_SIZE};

/// The physical pages backing one bounce buffer.
///
/// A [PageSet] exclusively owns its pages and returns them to the allocator when dropped.
pub struct PageSet<P: Pages> {
    pages: Vec<P::Page>,
    allocator: P,
}

impl<P: Pages> PageSet<P> {
    /// Allocate enough pages to back `size` bytes (a multiple of [PAGE_SIZE]).
    ///
    /// Pages that stay mapped for the CPU are preferred. If any page cannot be allocated, the pages
    /// obtained so far are freed and `None` is returned.
    pub fn alloc(allocator: &P, size: usize, node: Option<u32>) -> Option<Self> {
        debug_assert!(size > 0 && size % PAGE_SIZE == 0);
        let count = size / PAGE_SIZE;
        let mut set = Self {
            pages: Vec::with_capacity(count),
            allocator: allocator.clone(),
        };
        for _ in 0..count {
            let page = allocator
                .alloc_page(node, Zone::Low)
                .or_else(|| allocator.alloc_page(node, Zone::Any))?;
            set.pages.push(page);
        }
        Some(set)
    }

    /// Size of the set in bytes.
    pub fn size(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    /// The pages, in IOVA order.
    pub fn pages(&self) -> &[P::Page] {
        &self.pages
    }

    /// Split `[offset, offset + len)` on page boundaries, yielding each page touched along with
    /// the offset and length of the chunk within it.
    pub fn chunks(
        &self,
        offset: usize,
        len: usize,
    ) -> impl Iterator<Item = (&P::Page, usize, usize)> + '_ {
        debug_assert!(offset + len <= self.size());
        let mut offset = offset;
        let end = offset + len;
        std::iter::from_fn(move || {
            if offset >= end {
                return None;
            }
            let page = &self.pages[offset / PAGE_SIZE];
            let page_offset = offset % PAGE_SIZE;
            let chunk = (end - offset).min(PAGE_SIZE - page_offset);
            offset += chunk;
            Some((page, page_offset, chunk))
        })
    }

    /// Give up ownership of the pages without returning them to the allocator.
    ///
    /// Used when the translation unit may still reference the pages.
    pub fn leak(self) {
        std::mem::forget(self);
    }
}

impl<P: Pages> Drop for PageSet<P> {
    fn drop(&mut self) {
        for page in self.pages.drain(..) {
            self.allocator.free_page(page);
        }
    }
}
