//! A pool of equally sized bounce buffers.
//!
//! Slots are addressed by index into a lazily grown arena. Slot `i` is always exposed at
//! `base + size * i`, so a pool's IOVA range never changes after initialization. A slot moves
//! between the following states:
//!
//! ```text
//!            materialize                 release                 age (Old)
//!   Empty --------------> Active(owner) ----------> Cached -----------------> Busy --> Empty
//!     ^                        ^                      |                         |
//!     |                        +----------------------+                         +----> Leaked
//!     +------------------------------------------------------------------------+ (unmap failed)
//! ```
//!
//! All transitions happen under the pool lock, but page allocation and translation-unit calls
//! happen while the slot is detached (`Busy`) and the lock is released.

use super::metrics::Metrics;
use crate::{Access, PageSet, Pages};
use std::{
    ops::Range,
    sync::{Arc, Mutex},
};
use tracing::debug;

/// Age of a cached slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Generation {
    /// Released since the last eviction tick.
    Current,
    /// Survived one eviction tick without being reused.
    Old,
}

enum State<O> {
    /// No pages are attached.
    Empty,
    /// Detached from every list while the lock is released.
    Busy,
    /// Idle in the cache bucket matching its access mode (still mapped).
    Cached,
    /// Checked out by an owner.
    Active(O),
    /// The mapping could not be invalidated, so the slot is never handed out again.
    Leaked,
}

struct Slot<P: Pages, O> {
    pages: Option<Arc<PageSet<P>>>,
    state: State<O>,
    generation: Generation,
    access: Access,
    range: Range<usize>,
}

impl<P: Pages, O> Slot<P, O> {
    const fn empty() -> Self {
        Self {
            pages: None,
            state: State::Empty,
            generation: Generation::Current,
            access: Access::ReadWrite,
            range: 0..0,
        }
    }
}

struct Lists<P: Pages, O> {
    /// Every slot touched so far (at most `capacity`).
    slots: Vec<Slot<P, O>>,

    /// Stacks of cached slots, one per [Access] mode.
    buckets: [Vec<usize>; 3],

    /// Slots without pages that can be materialized again.
    empty: Vec<usize>,
}

impl<P: Pages, O> Lists<P, O> {
    fn cached(&self) -> bool {
        self.buckets.iter().any(|bucket| !bucket.is_empty())
    }
}

/// A slot handed out by [Pool::try_checkout].
pub(super) struct Checkout<P: Pages> {
    /// Pool-relative index of the slot.
    pub index: usize,
    /// Pages backing the slot.
    pub pages: Arc<PageSet<P>>,
    /// The slot was freshly materialized or last served a different access mode or byte range.
    pub is_new: bool,
    /// The slot is still mapped with the requested access mode.
    pub mapped: bool,
}

/// A checked-out slot's identity, as seen by lookups.
pub(super) struct Entry<P: Pages, O> {
    pub pages: Arc<PageSet<P>>,
    pub owner: O,
    pub access: Access,
}

/// A pool of bounce buffers of a single size class.
pub(super) struct Pool<P: Pages, O> {
    size: usize,
    base: u64,
    capacity: usize,
    lists: Mutex<Lists<P, O>>,
    metrics: Metrics,
}

impl<P: Pages, O: Clone> Pool<P, O> {
    /// Create a pool of `capacity` slots of `size` bytes exposed starting at `base`.
    pub fn new(size: usize, base: u64, capacity: usize, metrics: Metrics) -> Self {
        debug_assert!(size.is_power_of_two());
        debug_assert_eq!(base % size as u64, 0);
        Self {
            size,
            base,
            capacity,
            lists: Mutex::new(Lists {
                slots: Vec::new(),
                buckets: [Vec::new(), Vec::new(), Vec::new()],
                empty: Vec::new(),
            }),
            metrics,
        }
    }

    /// Size of each slot in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of bytes of IOVA space covered by the pool.
    pub fn span(&self) -> u64 {
        self.size as u64 * self.capacity as u64
    }

    /// Returns true if `iova` falls inside the pool's range.
    pub fn contains(&self, iova: u64) -> bool {
        iova >= self.base && iova - self.base < self.span()
    }

    /// IOVA of the slot at `index`.
    pub fn iova(&self, index: usize) -> u64 {
        self.base + (self.size * index) as u64
    }

    /// Index of the slot that contains `iova`.
    pub fn index_of(&self, iova: u64) -> usize {
        debug_assert!(iova >= self.base && iova - self.base < self.span());
        ((iova - self.base) / self.size as u64) as usize
    }

    /// Check out a slot for `owner`.
    ///
    /// Prefers the most recently released slot of the same access mode, then an untouched (or
    /// previously evicted) slot, then a cached slot of any other access mode. Returns `None` if
    /// the pool has nothing to offer or pages could not be allocated.
    pub fn try_checkout(
        &self,
        allocator: &P,
        node: Option<u32>,
        owner: &O,
        access: Access,
        range: Range<usize>,
    ) -> Option<Checkout<P>> {
        let mut lists = self.lists.lock().unwrap();

        // Reuse a cached slot of the same mode
        if let Some(index) = lists.buckets[access.index()].pop() {
            self.metrics.hits.inc();
            self.metrics.cached.dec();
            let slot = &mut lists.slots[index];
            let is_new = slot.range != range;
            return Self::activate(slot, index, owner, access, range, is_new, true);
        }

        // Materialize a slot
        let index = match lists.empty.pop() {
            Some(index) => Some(index),
            None if lists.slots.len() < self.capacity => {
                lists.slots.push(Slot::empty());
                Some(lists.slots.len() - 1)
            }
            None => None,
        };
        if let Some(index) = index {
            lists.slots[index].state = State::Busy;
            drop(lists);
            let pages = PageSet::alloc(allocator, self.size, node);
            let mut lists = self.lists.lock().unwrap();
            let Some(pages) = pages else {
                debug!(size = self.size, index, "unable to allocate pages for slot");
                lists.slots[index].state = State::Empty;
                lists.empty.push(index);
                return None;
            };
            self.metrics.materialized.inc();
            let slot = &mut lists.slots[index];
            slot.pages = Some(Arc::new(pages));
            return Self::activate(slot, index, owner, access, range, true, false);
        }

        // Take a cached slot of another mode
        for other in Access::ALL {
            if other == access {
                continue;
            }
            if let Some(index) = lists.buckets[other.index()].pop() {
                self.metrics.hits.inc();
                self.metrics.cached.dec();
                let slot = &mut lists.slots[index];
                return Self::activate(slot, index, owner, access, range, true, false);
            }
        }
        None
    }

    fn activate(
        slot: &mut Slot<P, O>,
        index: usize,
        owner: &O,
        access: Access,
        range: Range<usize>,
        is_new: bool,
        mapped: bool,
    ) -> Option<Checkout<P>> {
        let pages = slot.pages.clone()?;
        slot.state = State::Active(owner.clone());
        slot.generation = Generation::Current;
        slot.access = access;
        slot.range = range;
        Some(Checkout {
            index,
            pages,
            is_new,
            mapped,
        })
    }

    /// Look up the checked-out slot at `index`.
    pub fn find(&self, index: usize) -> Option<Entry<P, O>> {
        let lists = self.lists.lock().unwrap();
        let slot = lists.slots.get(index)?;
        let State::Active(owner) = &slot.state else {
            return None;
        };
        Some(Entry {
            pages: slot.pages.clone()?,
            owner: owner.clone(),
            access: slot.access,
        })
    }

    /// Detach the checked-out slot at `index` from its owner, leaving it `Busy`.
    ///
    /// The slot cannot be found or checked out again until it is checked in, discarded, or
    /// retired.
    pub fn begin_release(&self, index: usize) -> Option<Entry<P, O>> {
        let mut lists = self.lists.lock().unwrap();
        let slot = lists.slots.get_mut(index)?;
        if !matches!(slot.state, State::Active(_)) {
            return None;
        }
        let State::Active(owner) = std::mem::replace(&mut slot.state, State::Busy) else {
            unreachable!();
        };
        Some(Entry {
            pages: slot.pages.clone()?,
            owner,
            access: slot.access,
        })
    }

    /// Push a `Busy` slot onto the cache bucket for its access mode.
    ///
    /// Returns true if the bucket was empty (so the eviction clock must be armed).
    pub fn checkin(&self, index: usize) -> bool {
        let mut lists = self.lists.lock().unwrap();
        let Lists { slots, buckets, .. } = &mut *lists;
        let slot = &mut slots[index];
        debug_assert!(matches!(slot.state, State::Busy));
        slot.state = State::Cached;
        slot.generation = Generation::Current;
        let bucket = &mut buckets[slot.access.index()];
        bucket.push(index);
        self.metrics.cached.inc();
        bucket.len() == 1
    }

    /// Take the pages out of a `Busy` slot so its mapping can be torn down.
    pub fn discard(&self, index: usize) -> Option<Arc<PageSet<P>>> {
        let mut lists = self.lists.lock().unwrap();
        let slot = &mut lists.slots[index];
        debug_assert!(matches!(slot.state, State::Busy));
        slot.pages.take()
    }

    /// Finish tearing down a `Busy` slot whose pages were taken.
    ///
    /// If the mapping was `invalidated`, the slot may be materialized again. Otherwise it is
    /// leaked.
    pub fn retire(&self, index: usize, invalidated: bool) {
        let mut lists = self.lists.lock().unwrap();
        let slot = &mut lists.slots[index];
        debug_assert!(matches!(slot.state, State::Busy) && slot.pages.is_none());
        if invalidated {
            slot.state = State::Empty;
            lists.empty.push(index);
        } else {
            slot.state = State::Leaked;
        }
    }

    /// Advance the eviction clock by one tick.
    ///
    /// Cached slots that are `Current` become `Old`. Slots that were already `Old` are detached
    /// (left `Busy`) and returned along with their pages. Also returns whether any slot remains
    /// cached.
    pub fn age(&self) -> (Vec<(usize, Arc<PageSet<P>>)>, bool) {
        let mut lists = self.lists.lock().unwrap();
        let Lists { slots, buckets, .. } = &mut *lists;
        let mut evicted = Vec::new();
        for bucket in buckets.iter_mut() {
            bucket.retain(|&index| {
                let slot = &mut slots[index];
                match slot.generation {
                    Generation::Current => {
                        slot.generation = Generation::Old;
                        true
                    }
                    Generation::Old => {
                        slot.state = State::Busy;
                        if let Some(pages) = slot.pages.take() {
                            evicted.push((index, pages));
                        }
                        false
                    }
                }
            });
        }
        self.metrics.cached.dec_by(evicted.len() as i64);
        (evicted, lists.cached())
    }

    /// Detach every slot for teardown.
    ///
    /// Returns the cached slots (left `Busy` so their mappings can be torn down) and the pages of
    /// slots that are still checked out. Checked-out slots are marked leaked: their owners can no
    /// longer release them.
    pub fn drain(&self) -> (Vec<(usize, Arc<PageSet<P>>)>, Vec<Arc<PageSet<P>>>) {
        let mut lists = self.lists.lock().unwrap();
        let Lists { slots, buckets, .. } = &mut *lists;
        let mut cached = Vec::new();
        for bucket in buckets.iter_mut() {
            for index in bucket.drain(..) {
                let slot = &mut slots[index];
                slot.state = State::Busy;
                if let Some(pages) = slot.pages.take() {
                    cached.push((index, pages));
                }
            }
        }
        self.metrics.cached.dec_by(cached.len() as i64);
        let mut active = Vec::new();
        for slot in slots.iter_mut() {
            if matches!(slot.state, State::Active(_)) {
                slot.state = State::Leaked;
                active.extend(slot.pages.take());
            }
        }
        (cached, active)
    }

    /// Returns true if any slot was leaked.
    pub fn leaked(&self) -> bool {
        let lists = self.lists.lock().unwrap();
        lists
            .slots
            .iter()
            .any(|slot| matches!(slot.state, State::Leaked))
    }

    /// Returns true if any slot is cached.
    pub fn is_cached(&self) -> bool {
        self.lists.lock().unwrap().cached()
    }

    /// Number of slots that currently hold pages.
    #[cfg(test)]
    pub fn materialized(&self) -> usize {
        let lists = self.lists.lock().unwrap();
        lists.slots.iter().filter(|slot| slot.pages.is_some()).count()
    }
}
