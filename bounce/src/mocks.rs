//! In-memory platform for testing bounce buffers.
//!
//! [Platform] emulates a page allocator, a first-fit IOVA allocator, a translation table, and a
//! device that can read and write through that table. Failures of each collaborator can be
//! injected at runtime.

use crate::{Access, Direction, Protection, PAGE_SIZE};
use std::{
    collections::{BTreeMap, HashSet},
    ops::Range,
    sync::{Arc, Mutex},
};

/// A page of heap memory.
#[derive(Clone)]
pub struct Page {
    phys: u64,
    low: bool,
    data: Arc<Mutex<Box<[u8]>>>,
}

impl Page {
    /// Returns true if the page was allocated from [crate::Zone::Low].
    pub fn is_low(&self) -> bool {
        self.low
    }
}

impl crate::Page for Page {
    fn phys(&self) -> u64 {
        self.phys
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        let data = self.data.lock().unwrap();
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
    }

    fn write(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.lock().unwrap();
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    fn zero(&self, offset: usize, len: usize) {
        let mut data = self.data.lock().unwrap();
        data[offset..offset + len].fill(0);
    }
}

struct Mapping {
    page: Page,
    access: Access,
}

struct State {
    limit: u64,

    next_phys: u64,
    live: HashSet<u64>,
    low_pages: usize,
    page_budget: Option<usize>,

    reserved: BTreeMap<u64, u64>,
    max_reservation: Option<u64>,

    mappings: BTreeMap<u64, Mapping>,
    map_limit: Option<usize>,
    fail_unmap: bool,

    syncs_for_cpu: usize,
    syncs_for_device: usize,
}

/// An in-memory [crate::Platform].
#[derive(Clone)]
pub struct Platform {
    state: Arc<Mutex<State>>,
}

impl Platform {
    /// Create a platform whose devices can address `limit` bytes of IOVA space.
    pub fn new(limit: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                limit,
                next_phys: 0x1000_0000,
                live: HashSet::new(),
                low_pages: usize::MAX,
                page_budget: None,
                reserved: BTreeMap::new(),
                max_reservation: None,
                mappings: BTreeMap::new(),
                map_limit: None,
                fail_unmap: false,
                syncs_for_cpu: 0,
                syncs_for_device: 0,
            })),
        }
    }

    /// Limit the number of pages that can be allocated from [crate::Zone::Low].
    pub fn set_low_pages(&self, count: usize) {
        self.state.lock().unwrap().low_pages = count;
    }

    /// Limit the number of pages that can be live at once.
    pub fn set_page_budget(&self, budget: Option<usize>) {
        self.state.lock().unwrap().page_budget = budget;
    }

    /// Reject IOVA reservations larger than `max` bytes.
    pub fn set_max_reservation(&self, max: Option<u64>) {
        self.state.lock().unwrap().max_reservation = max;
    }

    /// Map at most `pages` pages per call.
    pub fn set_map_limit(&self, pages: Option<usize>) {
        self.state.lock().unwrap().map_limit = pages;
    }

    /// Make every unmap fail.
    pub fn set_fail_unmap(&self, fail: bool) {
        self.state.lock().unwrap().fail_unmap = fail;
    }

    /// Number of pages allocated and not yet freed.
    pub fn live_pages(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    /// Ranges of IOVA space currently reserved, in address order.
    pub fn reserved(&self) -> Vec<Range<u64>> {
        let state = self.state.lock().unwrap();
        state
            .reserved
            .iter()
            .map(|(start, size)| *start..*start + *size)
            .collect()
    }

    /// Returns the access mode of the translation covering `iova`, if any.
    pub fn mapping(&self, iova: u64) -> Option<Access> {
        let state = self.state.lock().unwrap();
        let page = iova - iova % PAGE_SIZE as u64;
        state.mappings.get(&page).map(|mapping| mapping.access)
    }

    /// Number of cache maintenance calls made `(for_cpu, for_device)`.
    pub fn syncs(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.syncs_for_cpu, state.syncs_for_device)
    }

    /// Read `len` bytes at `iova` as the device would.
    ///
    /// Returns `None` if any byte is not mapped readable.
    pub fn device_read(&self, iova: u64, len: usize) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let mut out = vec![0; len];
        let mut done = 0;
        while done < len {
            let addr = iova + done as u64;
            let offset = (addr % PAGE_SIZE as u64) as usize;
            let mapping = state.mappings.get(&(addr - offset as u64))?;
            if !mapping.access.readable() {
                return None;
            }
            let chunk = (len - done).min(PAGE_SIZE - offset);
            crate::Page::read(&mapping.page, offset, &mut out[done..done + chunk]);
            done += chunk;
        }
        Some(out)
    }

    /// Write `data` at `iova` as the device would.
    ///
    /// Returns false (writing nothing) if any byte is not mapped writable.
    pub fn device_write(&self, iova: u64, data: &[u8]) -> bool {
        let state = self.state.lock().unwrap();
        let mut chunks = Vec::new();
        let mut done = 0;
        while done < data.len() {
            let addr = iova + done as u64;
            let offset = (addr % PAGE_SIZE as u64) as usize;
            let Some(mapping) = state.mappings.get(&(addr - offset as u64)) else {
                return false;
            };
            if !mapping.access.writable() {
                return false;
            }
            let chunk = (data.len() - done).min(PAGE_SIZE - offset);
            chunks.push((&mapping.page, offset, &data[done..done + chunk]));
            done += chunk;
        }
        for (page, offset, src) in chunks {
            crate::Page::write(page, offset, src);
        }
        true
    }
}

impl crate::Pages for Platform {
    type Page = Page;

    fn alloc_page(&self, _node: Option<u32>, zone: crate::Zone) -> Option<Page> {
        let mut state = self.state.lock().unwrap();
        if let Some(budget) = state.page_budget {
            if state.live.len() >= budget {
                return None;
            }
        }
        let low = match zone {
            crate::Zone::Low if state.low_pages == 0 => return None,
            crate::Zone::Low => {
                state.low_pages -= 1;
                true
            }
            crate::Zone::Any => false,
        };
        let phys = state.next_phys;
        state.next_phys += PAGE_SIZE as u64;
        state.live.insert(phys);

        // Fresh pages hold garbage
        Some(Page {
            phys,
            low,
            data: Arc::new(Mutex::new(vec![0xa5; PAGE_SIZE].into_boxed_slice())),
        })
    }

    fn free_page(&self, page: Page) {
        let mut state = self.state.lock().unwrap();
        assert!(
            !state.mappings.values().any(|m| m.page.phys == page.phys),
            "page freed while mapped: {:#x}",
            page.phys
        );
        assert!(state.live.remove(&page.phys), "double free");
        if page.low {
            state.low_pages = state.low_pages.saturating_add(1);
        }
    }
}

impl crate::Iova for Platform {
    fn reserve(&self, size: u64, align: u64) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        if state.max_reservation.is_some_and(|max| size > max) {
            return None;
        }
        let align_up = |addr: u64| addr.div_ceil(align) * align;

        // First fit, never handing out address zero
        let mut candidate = align_up(PAGE_SIZE as u64);
        for (start, len) in state.reserved.iter() {
            if candidate + size <= *start {
                break;
            }
            candidate = candidate.max(align_up(start + len));
        }
        if candidate + size > state.limit {
            return None;
        }
        state.reserved.insert(candidate, size);
        Some(candidate)
    }

    fn release(&self, iova: u64, size: u64) {
        let mut state = self.state.lock().unwrap();
        assert_eq!(state.reserved.remove(&iova), Some(size), "bad release");
    }

    fn limit(&self) -> u64 {
        self.state.lock().unwrap().limit
    }
}

impl crate::Translate for Platform {
    fn map(&self, iova: u64, pages: &[Page], prot: Protection) -> usize {
        let mut state = self.state.lock().unwrap();
        let count = state
            .map_limit
            .map_or(pages.len(), |limit| limit.min(pages.len()));
        for (i, page) in pages[..count].iter().enumerate() {
            state.mappings.insert(
                iova + (i * PAGE_SIZE) as u64,
                Mapping {
                    page: page.clone(),
                    access: prot.access,
                },
            );
        }
        count * PAGE_SIZE
    }

    fn unmap(&self, iova: u64, size: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.fail_unmap {
            return false;
        }
        let pages: Vec<u64> = state
            .mappings
            .range(iova..iova + size as u64)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in pages {
            state.mappings.remove(&addr);
        }
        true
    }
}

impl crate::Coherency for Platform {
    fn sync_for_cpu(&self, _page: &Page, _offset: usize, _len: usize, _dir: Direction) {
        self.state.lock().unwrap().syncs_for_cpu += 1;
    }

    fn sync_for_device(&self, _page: &Page, _offset: usize, _len: usize, _dir: Direction) {
        self.state.lock().unwrap().syncs_for_device += 1;
    }
}

/// Caller memory backed by a vector.
pub struct Memory {
    data: Mutex<Vec<u8>>,
}

impl Memory {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    /// A copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl crate::Memory for Memory {
    fn read(&self, offset: usize, dst: &mut [u8]) {
        let data = self.data.lock().unwrap();
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
    }

    fn write(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.lock().unwrap();
        data[offset..offset + src.len()].copy_from_slice(src);
    }
}
