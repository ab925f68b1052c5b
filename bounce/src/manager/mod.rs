//! Allocate bounce buffers from size-class pools, falling back to individually reserved ranges.
//!
//! At initialization, the [Manager] reserves one IOVA window and tiles it with one pool per size
//! class, largest first. Because every pool starts on a boundary of the largest size class, each
//! pool's base is aligned to its own size and any handle inside the window resolves to its slot
//! with a comparison per pool and a division.
//!
//! ```text
//!   window.start                                                            window.end
//!   | pool (PAGE_SIZE << n-1) x slots | ... | pool (2 * PAGE_SIZE) x slots | pool (PAGE_SIZE) x slots |
//! ```
//!
//! Requests larger than the largest class, or that find their pool exhausted, are served by the
//! fallback: an IOVA range reserved for that request alone and tracked in an ordered map.

use crate::{Access, Error, PageSet, Platform, PAGE_SIZE};
use commonware_runtime::Metrics as RuntimeMetrics;
use commonware_utils::NZUsize;
use futures::channel::mpsc;
use std::{
    num::NonZeroUsize,
    ops::Range,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

mod fallback;
use fallback::{Node, Tree};
mod metrics;
use metrics::Metrics;
mod pool;
use pool::Pool;

/// Maximum number of size classes.
pub const MAX_POOLS: usize = 16;

/// Configuration for a [Manager].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of size classes (`PAGE_SIZE << 0` through `PAGE_SIZE << (pools - 1)`).
    ///
    /// Must not exceed [MAX_POOLS].
    pub pools: NonZeroUsize,

    /// Number of slots per pool.
    ///
    /// This is a target: if the resulting window does not fit the platform's addressable range,
    /// it is halved until it does.
    pub slots: NonZeroUsize,

    /// NUMA node to allocate pages on, if any.
    pub node: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pools: NZUsize!(8),
            slots: NZUsize!(256),
            node: None,
        }
    }
}

/// A buffer handed out by [Manager::alloc_buffer].
pub struct Allocation<P: Platform> {
    /// IOVA of the first byte of the buffer.
    pub iova: u64,
    /// Pages backing the buffer.
    pub pages: Arc<PageSet<P>>,
    /// The buffer was just materialized, or last served a different access mode or range.
    pub is_new: bool,
    /// The buffer is still mapped with the requested access mode.
    pub mapped: bool,
}

/// A live buffer, as seen by lookups and release callbacks.
pub struct Buffer<P: Platform, O> {
    /// IOVA of the first byte of the buffer.
    pub iova: u64,
    /// Pages backing the buffer.
    pub pages: Arc<PageSet<P>>,
    /// The owner the buffer was allocated for.
    pub owner: O,
    /// The access mode the buffer was allocated with.
    pub access: Access,
}

/// Serves bounce buffers from pools and the fallback.
pub struct Manager<P: Platform, O: Clone + Send + 'static> {
    platform: P,
    node: Option<u32>,
    window: Range<u64>,
    slots: usize,
    pools: Vec<Pool<P, O>>,
    fallback: Tree<P, O>,

    armed: AtomicBool,
    destroyed: AtomicBool,
    wake: mpsc::UnboundedSender<()>,

    metrics: Metrics,
}

impl<P: Platform, O: Clone + Send + 'static> Manager<P, O> {
    /// Reserve the pooled window and create the pools.
    ///
    /// Returns the manager along with the receiver that is notified whenever the eviction clock
    /// must start ticking.
    pub fn init<E: RuntimeMetrics>(
        context: E,
        platform: P,
        cfg: Config,
    ) -> Result<(Self, mpsc::UnboundedReceiver<()>), Error> {
        let count = cfg.pools.get();
        assert!(count <= MAX_POOLS, "too many pools: {count}");
        let largest = (PAGE_SIZE << (count - 1)) as u64;

        // Every slot index holds one slot of each size class
        let stride = PAGE_SIZE as u64 * ((1u64 << count) - 1);
        let budget = platform.limit() / 2;
        let mut slots = cfg.slots.get();
        let base = loop {
            if slots == 0 {
                return Err(Error::IovaExhausted);
            }
            if let Some(size) = stride.checked_mul(slots as u64).filter(|size| *size <= budget) {
                if let Some(base) = platform.reserve(size, largest) {
                    break base;
                }
            }
            debug!(slots, "unable to reserve pooled window, shrinking");
            slots /= 2;
        };
        let window = base..base + stride * slots as u64;

        let metrics = Metrics::init(context);
        let mut pools = Vec::with_capacity(count);
        let mut start = base;
        for class in (0..count).rev() {
            let pool = Pool::new(PAGE_SIZE << class, start, slots, metrics.clone());
            start += pool.span();
            pools.push(pool);
        }
        debug_assert_eq!(start, window.end);
        debug!(start = window.start, end = window.end, slots, "reserved pooled window");

        let (wake, receiver) = mpsc::unbounded();
        Ok((
            Self {
                platform,
                node: cfg.node,
                window,
                slots,
                pools,
                fallback: Tree::new(),
                armed: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                wake,
                metrics,
            },
            receiver,
        ))
    }

    /// The IOVA range covered by the pools.
    pub fn window(&self) -> Range<u64> {
        self.window.clone()
    }

    /// Number of slots in each pool (after any shrinking at initialization).
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// The pool serving buffers of `size` bytes, if any.
    fn class(&self, size: usize) -> Option<&Pool<P, O>> {
        let class = size.checked_next_power_of_two()?.max(PAGE_SIZE);
        let index = (class / PAGE_SIZE).trailing_zeros() as usize;
        let count = self.pools.len();
        if index >= count {
            return None;
        }
        Some(&self.pools[count - 1 - index])
    }

    /// The pool and slot index containing `handle`, if it lies in the pooled window.
    fn locate(&self, handle: u64) -> Option<(&Pool<P, O>, usize)> {
        if !self.window.contains(&handle) {
            return None;
        }
        let pool = self.pools.iter().find(|pool| pool.contains(handle))?;
        Some((pool, pool.index_of(handle)))
    }

    /// Allocate a buffer of `range.end` bytes for `owner`, of which `range` will hold data.
    ///
    /// The buffer comes from the pool of the smallest size class that fits, or from the fallback
    /// if there is no such class or its pool has nothing to offer.
    pub fn alloc_buffer(
        &self,
        owner: &O,
        range: Range<usize>,
        access: Access,
    ) -> Result<Allocation<P>, Error> {
        if range.is_empty() {
            return Err(Error::EmptyRequest);
        }
        if self.destroyed.load(Ordering::Acquire) {
            self.metrics.exhausted.inc();
            return Err(Error::Exhausted);
        }
        if let Some(pool) = self.class(range.end) {
            if let Some(checkout) =
                pool.try_checkout(&self.platform, self.node, owner, access, range.clone())
            {
                return Ok(Allocation {
                    iova: pool.iova(checkout.index),
                    pages: checkout.pages,
                    is_new: checkout.is_new,
                    mapped: checkout.mapped,
                });
            }
        }
        self.alloc_fallback(owner, range.end, access)
            .inspect_err(|_| {
                self.metrics.exhausted.inc();
            })
    }

    fn alloc_fallback(
        &self,
        owner: &O,
        len: usize,
        access: Access,
    ) -> Result<Allocation<P>, Error> {
        let size = Tree::<P, O>::size_for(len).ok_or(Error::Exhausted)?;
        let iova = self
            .platform
            .reserve(size as u64, PAGE_SIZE as u64)
            .ok_or(Error::Exhausted)?;
        let Some(pages) = PageSet::alloc(&self.platform, size, self.node) else {
            self.platform.release(iova, size as u64);
            return Err(Error::Exhausted);
        };
        let pages = Arc::new(pages);
        let node = Node {
            size,
            pages: pages.clone(),
            owner: owner.clone(),
            access,
        };

        // The range is owned by someone else, so it must not be released
        if self.fallback.insert(iova, node).is_err() {
            return Err(Error::Exhausted);
        }
        self.metrics.fallbacks.inc();
        self.metrics.fallback_active.inc();
        debug!(iova, size, "allocated fallback buffer");
        Ok(Allocation {
            iova,
            pages,
            is_new: true,
            mapped: false,
        })
    }

    /// Find the live buffer containing `handle`.
    pub fn find_buffer(&self, handle: u64) -> Option<Buffer<P, O>> {
        if let Some((pool, index)) = self.locate(handle) {
            let entry = pool.find(index)?;
            return Some(Buffer {
                iova: pool.iova(index),
                pages: entry.pages,
                owner: entry.owner,
                access: entry.access,
            });
        }
        let (iova, pages, owner, access) = self.fallback.find(handle)?;
        Some(Buffer {
            iova,
            pages,
            owner,
            access,
        })
    }

    /// Release the buffer containing `handle`.
    ///
    /// `before_release` runs while the buffer is detached from its owner but before it can be
    /// handed out again. If `invalidated` is false (the state of the buffer's mapping is unknown),
    /// a pooled buffer is unmapped and its pages freed instead of being cached. Fallback buffers
    /// are always unmapped and freed.
    pub fn release_buffer<F: FnOnce(&Buffer<P, O>)>(
        &self,
        handle: u64,
        invalidated: bool,
        before_release: F,
    ) -> Result<(), Error> {
        if let Some((pool, index)) = self.locate(handle) {
            let entry = pool.begin_release(index).ok_or(Error::NotFound(handle))?;
            let iova = pool.iova(index);
            before_release(&Buffer {
                iova,
                pages: entry.pages,
                owner: entry.owner,
                access: entry.access,
            });
            if invalidated {
                if pool.checkin(index) {
                    self.arm();
                }
                return Ok(());
            }
            let Some(pages) = pool.discard(index) else {
                pool.retire(index, true);
                return Ok(());
            };
            let unmapped = self.teardown(iova, pool.size(), pages);
            pool.retire(index, unmapped);
            return if unmapped {
                Ok(())
            } else {
                Err(Error::UnmapFailed(iova))
            };
        }

        let (iova, node) = self.fallback.remove(handle).ok_or(Error::NotFound(handle))?;
        self.metrics.fallback_active.dec();
        let Node {
            size,
            pages,
            owner,
            access,
        } = node;
        before_release(&Buffer {
            iova,
            pages: pages.clone(),
            owner,
            access,
        });
        if !self.teardown(iova, size, pages) {
            return Err(Error::UnmapFailed(iova));
        }
        self.platform.release(iova, size as u64);
        Ok(())
    }

    /// Unmap `[iova, iova + size)` and free `pages`, leaking them if the unmap fails.
    ///
    /// Returns true if the range is no longer reachable by the device.
    fn teardown(&self, iova: u64, size: usize, pages: Arc<PageSet<P>>) -> bool {
        if self.platform.unmap(iova, size) {
            return true;
        }
        warn!(iova, size, "unable to unmap buffer, leaking pages");
        self.metrics.leaked.inc();
        Self::leak(pages);
        false
    }

    fn leak(pages: Arc<PageSet<P>>) {
        match Arc::try_unwrap(pages) {
            Ok(pages) => pages.leak(),
            Err(pages) => std::mem::forget(pages),
        }
    }

    /// Start the eviction clock if it is not already running.
    fn arm(&self) {
        if !self.armed.swap(true, Ordering::AcqRel) {
            let _ = self.wake.unbounded_send(());
        }
    }

    /// Stop the eviction clock.
    ///
    /// Returns true if a slot was cached concurrently and the caller must keep ticking.
    pub fn disarm(&self) -> bool {
        self.armed.store(false, Ordering::Release);
        if !self.pools.iter().any(|pool| pool.is_cached()) {
            return false;
        }

        // If someone else armed the clock, they also sent a wakeup
        self.armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Advance the eviction clock by one tick.
    ///
    /// Returns true if any slot is still cached.
    pub fn evict(&self) -> bool {
        let mut cached = false;
        let mut evicted = 0;
        for pool in &self.pools {
            let (slots, remaining) = pool.age();
            cached |= remaining;
            evicted += slots.len();
            for (index, pages) in slots {
                let unmapped = self.teardown(pool.iova(index), pool.size(), pages);
                pool.retire(index, unmapped);
            }
        }
        self.metrics.evicted.inc_by(evicted as u64);
        debug!(evicted, cached, "eviction tick");
        cached
    }

    /// Tear down every cached buffer and release the pooled window.
    ///
    /// Buffers that are still checked out (and any buffer whose mapping cannot be removed) are
    /// leaked along with the pooled window, as the device may still reach them. Any later
    /// allocation fails.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut leaked = false;
        for pool in &self.pools {
            let (cached, active) = pool.drain();
            for (index, pages) in cached {
                let unmapped = self.teardown(pool.iova(index), pool.size(), pages);
                pool.retire(index, unmapped);
            }
            if !active.is_empty() {
                warn!(size = pool.size(), count = active.len(), "leaking buffers still in use");
                self.metrics.leaked.inc_by(active.len() as u64);
                active.into_iter().for_each(Self::leak);
            }
            leaked |= pool.leaked();
        }
        for (iova, node) in self.fallback.drain() {
            // Fallback ranges are reserved individually, so they never pin the window
            warn!(iova, size = node.size, "leaking fallback buffer still in use");
            self.metrics.leaked.inc();
            self.metrics.fallback_active.dec();
            Self::leak(node.pages);
        }
        if leaked {
            warn!(
                start = self.window.start,
                end = self.window.end,
                "leaking pooled window"
            );
            return;
        }
        self.platform
            .release(self.window.start, self.window.end - self.window.start);
    }
}

impl<P: Platform, O: Clone + Send + 'static> Drop for Manager<P, O> {
    fn drop(&mut self) {
        // Cached pages are still mapped
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mocks, Protection, Translate};
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Metrics as _, Runner};
    use rand::Rng;

    type Test = Manager<mocks::Platform, u32>;

    fn init(
        context: &deterministic::Context,
        platform: &mocks::Platform,
        pools: usize,
        slots: usize,
    ) -> (Test, mpsc::UnboundedReceiver<()>) {
        Manager::init(
            context.with_label("manager"),
            platform.clone(),
            Config {
                pools: NZUsize!(pools),
                slots: NZUsize!(slots),
                node: None,
            },
        )
        .unwrap()
    }

    fn map(platform: &mocks::Platform, allocation: &Allocation<mocks::Platform>, access: Access) {
        let prot = Protection {
            access,
            coherent: true,
        };
        let mapped = platform.map(allocation.iova, allocation.pages.pages(), prot);
        assert_eq!(mapped, allocation.pages.size());
    }

    #[test_traced]
    fn test_size_classes() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 2, 4);
            let window = manager.window();
            assert_eq!(window.end - window.start, 4 * 3 * PAGE_SIZE as u64);

            // Largest class first
            let large = window.start..window.start + 4 * 2 * PAGE_SIZE as u64;
            let small = large.end..window.end;

            let a = manager.alloc_buffer(&1, 0..100, Access::Read).unwrap();
            assert!(small.contains(&a.iova));
            assert_eq!(a.pages.size(), PAGE_SIZE);
            assert!(a.is_new && !a.mapped);

            let b = manager.alloc_buffer(&2, 0..4096, Access::Read).unwrap();
            assert!(small.contains(&b.iova));
            assert_eq!(b.iova % PAGE_SIZE as u64, 0);

            let c = manager.alloc_buffer(&3, 0..4097, Access::Write).unwrap();
            assert!(large.contains(&c.iova));
            assert_eq!(c.pages.size(), 2 * PAGE_SIZE);
            assert_eq!(c.iova % (2 * PAGE_SIZE) as u64, 0);

            // Beyond the largest class
            let d = manager.alloc_buffer(&4, 0..9000, Access::ReadWrite).unwrap();
            assert!(!window.contains(&d.iova));
            assert_eq!(d.pages.size(), 16384);
            assert_eq!(platform.reserved().len(), 2);

            let metrics = context.encode();
            assert!(metrics.contains("manager_materialized_total 3"));
            assert!(metrics.contains("manager_fallbacks_total 1"));
            assert!(metrics.contains("manager_fallback_active 1"));
        });
    }

    #[test_traced]
    fn test_empty_request() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 2, 4);
            assert!(matches!(
                manager.alloc_buffer(&1, 0..0, Access::Read),
                Err(Error::EmptyRequest)
            ));
            assert!(matches!(
                manager.alloc_buffer(&1, 10..10, Access::Read),
                Err(Error::EmptyRequest)
            ));
        });
    }

    #[test_traced]
    fn test_find_buffer() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 3, 4);
            let pooled = manager.alloc_buffer(&1, 0..5000, Access::Write).unwrap();
            let fallback = manager.alloc_buffer(&2, 0..20000, Access::Read).unwrap();

            for (allocation, owner, access) in [
                (&pooled, 1, Access::Write),
                (&fallback, 2, Access::Read),
            ] {
                let size = allocation.pages.size() as u64;
                for handle in [allocation.iova, allocation.iova + 123, allocation.iova + size - 1] {
                    let buffer = manager.find_buffer(handle).unwrap();
                    assert_eq!(buffer.iova, allocation.iova);
                    assert_eq!(buffer.owner, owner);
                    assert_eq!(buffer.access, access);
                    assert!(Arc::ptr_eq(&buffer.pages, &allocation.pages));
                }
            }

            // Neighbouring slots and addresses are not live
            assert!(manager.find_buffer(pooled.iova + 2 * PAGE_SIZE as u64).is_none());
            assert!(manager.find_buffer(fallback.iova + 32768).is_none());
            assert!(manager.find_buffer(0).is_none());

            // Released buffers are not found
            manager.release_buffer(pooled.iova, true, |_| {}).unwrap();
            manager.release_buffer(fallback.iova + 7, true, |_| {}).unwrap();
            assert!(manager.find_buffer(pooled.iova).is_none());
            assert!(manager.find_buffer(fallback.iova).is_none());
        });
    }

    #[test_traced]
    fn test_release_not_found() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 2, 4);
            let window = manager.window();
            assert_eq!(
                manager.release_buffer(window.start, true, |_| {}),
                Err(Error::NotFound(window.start))
            );
            assert_eq!(
                manager.release_buffer(window.end, true, |_| {}),
                Err(Error::NotFound(window.end))
            );

            // Double release
            let a = manager.alloc_buffer(&1, 0..10, Access::Read).unwrap();
            manager.release_buffer(a.iova, true, |_| {}).unwrap();
            assert_eq!(
                manager.release_buffer(a.iova, true, |_| {}),
                Err(Error::NotFound(a.iova))
            );
            let b = manager.alloc_buffer(&1, 0..9000, Access::Read).unwrap();
            manager.release_buffer(b.iova, true, |_| {}).unwrap();
            assert_eq!(
                manager.release_buffer(b.iova, true, |_| {}),
                Err(Error::NotFound(b.iova))
            );
        });
    }

    #[test_traced]
    fn test_release_callback_runs_before_reuse() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 1, 1);
            let a = manager.alloc_buffer(&9, 0..10, Access::Read).unwrap();

            let mut called = false;
            manager
                .release_buffer(a.iova + 5, true, |buffer| {
                    called = true;
                    assert_eq!(buffer.iova, a.iova);
                    assert_eq!(buffer.owner, 9);

                    // Not visible and not reusable while the callback runs
                    assert!(manager.find_buffer(a.iova).is_none());
                    let b = manager.alloc_buffer(&10, 0..10, Access::Read).unwrap();
                    assert_ne!(b.iova, a.iova);
                    manager.release_buffer(b.iova, true, |_| {}).unwrap();
                })
                .unwrap();
            assert!(called);

            // Cached afterwards
            let c = manager.alloc_buffer(&11, 0..10, Access::Read).unwrap();
            assert_eq!(c.iova, a.iova);
            assert!(!c.is_new && c.mapped);
        });
    }

    #[test_traced]
    fn test_exhausted_pool_falls_back() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 1, 1);
            let window = manager.window();

            let a = manager.alloc_buffer(&1, 0..10, Access::Read).unwrap();
            assert!(window.contains(&a.iova));
            let b = manager.alloc_buffer(&2, 0..10, Access::Read).unwrap();
            assert!(!window.contains(&b.iova));
            assert_eq!(b.pages.size(), PAGE_SIZE);

            manager.release_buffer(b.iova, true, |_| {}).unwrap();
            assert_eq!(platform.reserved(), vec![window.clone()]);
            manager.release_buffer(a.iova, true, |_| {}).unwrap();

            let c = manager.alloc_buffer(&3, 0..10, Access::Read).unwrap();
            assert_eq!(c.iova, a.iova);

            let metrics = context.encode();
            assert!(metrics.contains("manager_hits_total 1"));
            assert!(metrics.contains("manager_fallback_active 0"));
        });
    }

    #[test_traced]
    fn test_two_classes_fall_back_and_recover() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 2, 2);
            let window = manager.window();

            // Requests land in the smallest class that fits
            let a = manager.alloc_buffer(&1, 0..100, Access::Read).unwrap();
            let b = manager.alloc_buffer(&2, 0..PAGE_SIZE, Access::Read).unwrap();
            let c = manager.alloc_buffer(&3, 0..PAGE_SIZE + 1, Access::Read).unwrap();
            let d = manager.alloc_buffer(&4, 0..9000, Access::Read).unwrap();
            for (allocation, size) in [(&a, 4096), (&b, 4096), (&c, 8192)] {
                assert!(window.contains(&allocation.iova));
                assert_eq!(allocation.pages.size(), size);
            }
            assert!(!window.contains(&d.iova));
            assert_eq!(d.pages.size(), 16384);

            // Exhaust the 8192 class
            let e = manager.alloc_buffer(&5, 0..8000, Access::Read).unwrap();
            assert!(window.contains(&e.iova));
            let f = manager.alloc_buffer(&6, 0..9000, Access::Read).unwrap();
            assert!(!window.contains(&f.iova));
            let g = manager.alloc_buffer(&7, 0..5000, Access::Read).unwrap();
            assert!(!window.contains(&g.iova));
            assert_eq!(g.pages.size(), 8192);
            assert!(context.encode().contains("manager_fallback_active 3"));

            // Returning one slot makes the pool path succeed again
            manager.release_buffer(c.iova, true, |_| {}).unwrap();
            let h = manager.alloc_buffer(&8, 0..6000, Access::Read).unwrap();
            assert_eq!(h.iova, c.iova);
            assert!(window.contains(&h.iova));
            assert_eq!(manager.find_buffer(h.iova).unwrap().owner, 8);
            assert!(context.encode().contains("manager_fallback_active 3"));
        });
    }

    #[test_traced]
    fn test_exhausted() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 1, 1);
            let _a = manager.alloc_buffer(&1, 0..10, Access::Read).unwrap();

            // No pages for the fallback
            platform.set_page_budget(Some(1));
            assert!(matches!(
                manager.alloc_buffer(&2, 0..10, Access::Read),
                Err(Error::Exhausted)
            ));

            // The fallback reservation was returned
            assert_eq!(platform.reserved(), vec![manager.window()]);
            assert!(context.encode().contains("manager_exhausted_total 1"));
        });
    }

    #[test_traced]
    fn test_reuse_is_bounded() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 2, 4);
            for _ in 0..1000 {
                let a = manager.alloc_buffer(&1, 0..6000, Access::Write).unwrap();
                manager.release_buffer(a.iova, true, |_| {}).unwrap();
            }
            assert_eq!(platform.live_pages(), 2);

            let metrics = context.encode();
            assert!(metrics.contains("manager_materialized_total 1\n"));
            assert!(metrics.contains("manager_hits_total 999\n"));
            assert!(metrics.contains("manager_fallbacks_total 0\n"));
        });
    }

    #[test_traced]
    fn test_release_uninvalidated() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, mut wake) = init(&context, &platform, 1, 1);
            let a = manager.alloc_buffer(&1, 0..10, Access::Read).unwrap();
            map(&platform, &a, Access::Read);
            drop(a.pages);

            // Torn down instead of cached
            manager.release_buffer(a.iova, false, |_| {}).unwrap();
            assert!(platform.mapping(a.iova).is_none());
            assert_eq!(platform.live_pages(), 0);
            assert!(wake.try_recv().is_err());

            let b = manager.alloc_buffer(&1, 0..10, Access::Read).unwrap();
            assert_eq!(b.iova, a.iova);
            assert!(b.is_new && !b.mapped);
        });
    }

    #[test_traced]
    fn test_release_unmap_failure() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 1, 1);
            let a = manager.alloc_buffer(&1, 0..10, Access::Read).unwrap();
            let b = manager.alloc_buffer(&2, 0..10, Access::Read).unwrap();
            map(&platform, &a, Access::Read);
            map(&platform, &b, Access::Read);
            drop(a.pages);
            drop(b.pages);

            platform.set_fail_unmap(true);
            assert_eq!(
                manager.release_buffer(a.iova, false, |_| {}),
                Err(Error::UnmapFailed(a.iova))
            );
            assert_eq!(
                manager.release_buffer(b.iova, true, |_| {}),
                Err(Error::UnmapFailed(b.iova))
            );

            // Both buffers keep their pages and addresses
            assert_eq!(platform.live_pages(), 2);
            assert_eq!(platform.reserved().len(), 2);
            assert!(context.encode().contains("manager_leaked_total 2"));

            // The leaked slot is never handed out again
            platform.set_fail_unmap(false);
            let c = manager.alloc_buffer(&3, 0..10, Access::Read).unwrap();
            assert!(!manager.window().contains(&c.iova));
        });
    }

    #[test_traced]
    fn test_evict_after_two_ticks() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 2, 2);
            let a = manager.alloc_buffer(&1, 0..10, Access::Read).unwrap();
            map(&platform, &a, Access::Read);
            drop(a.pages);
            manager.release_buffer(a.iova, true, |_| {}).unwrap();

            // Still cached and mapped after one tick
            assert!(manager.evict());
            assert_eq!(platform.mapping(a.iova), Some(Access::Read));
            assert_eq!(platform.live_pages(), 1);

            // Gone after the second
            assert!(!manager.evict());
            assert!(platform.mapping(a.iova).is_none());
            assert_eq!(platform.live_pages(), 0);

            let metrics = context.encode();
            assert!(metrics.contains("manager_evicted_total 1"));
            assert!(metrics.contains("manager_cached 0"));

            // Evicted slots are materialized again
            let b = manager.alloc_buffer(&1, 0..10, Access::Read).unwrap();
            assert_eq!(b.iova, a.iova);
            assert!(b.is_new && !b.mapped);
        });
    }

    #[test_traced]
    fn test_evict_spares_reused() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 1, 2);
            let a = manager.alloc_buffer(&1, 0..10, Access::Read).unwrap().iova;
            manager.release_buffer(a, true, |_| {}).unwrap();
            assert!(manager.evict());

            // Reused between ticks
            let b = manager.alloc_buffer(&1, 0..10, Access::Read).unwrap().iova;
            assert_eq!(b, a);
            manager.release_buffer(b, true, |_| {}).unwrap();
            assert!(manager.evict());
            assert_eq!(platform.live_pages(), 1);
            assert!(!manager.evict());
            assert_eq!(platform.live_pages(), 0);
        });
    }

    #[test_traced]
    fn test_evict_unmap_failure_leaks() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 1, 1);
            let a = manager.alloc_buffer(&1, 0..10, Access::Read).unwrap();
            map(&platform, &a, Access::Read);
            drop(a.pages);
            manager.release_buffer(a.iova, true, |_| {}).unwrap();

            platform.set_fail_unmap(true);
            manager.evict();
            assert!(!manager.evict());
            assert_eq!(platform.live_pages(), 1);
            assert_eq!(platform.mapping(a.iova), Some(Access::Read));
            assert!(context.encode().contains("manager_leaked_total 1"));

            // The slot is gone for good
            let b = manager.alloc_buffer(&2, 0..10, Access::Read).unwrap();
            assert!(!manager.window().contains(&b.iova));
        });
    }

    #[test_traced]
    fn test_arming() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, mut wake) = init(&context, &platform, 2, 4);
            let a = manager.alloc_buffer(&1, 0..10, Access::Read).unwrap();
            let b = manager.alloc_buffer(&2, 0..10, Access::Write).unwrap();
            let c = manager.alloc_buffer(&3, 0..5000, Access::Read).unwrap();
            assert!(wake.try_recv().is_err());

            // Only the first cached slot wakes the clock
            manager.release_buffer(a.iova, true, |_| {}).unwrap();
            assert!(wake.try_recv().is_ok());
            manager.release_buffer(b.iova, true, |_| {}).unwrap();
            manager.release_buffer(c.iova, true, |_| {}).unwrap();
            assert!(wake.try_recv().is_err());

            // Caches are not empty, so the clock keeps running
            assert!(manager.disarm());
            assert!(wake.try_recv().is_err());

            // Once empty, the clock stops and the next release wakes it again
            manager.evict();
            assert!(!manager.evict());
            assert!(!manager.disarm());
            let d = manager.alloc_buffer(&4, 0..10, Access::Read).unwrap();
            manager.release_buffer(d.iova, true, |_| {}).unwrap();
            assert!(wake.try_recv().is_ok());
        });
    }

    #[test_traced]
    fn test_init_shrinks_window() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let stride = 3 * PAGE_SIZE as u64;
            platform.set_max_reservation(Some(3 * stride));
            let (manager, _) = init(&context, &platform, 2, 8);
            assert_eq!(manager.slots(), 2);
            let window = manager.window();
            assert_eq!(window.end - window.start, 2 * stride);
            assert_eq!(window.start % (2 * PAGE_SIZE) as u64, 0);
        });
    }

    #[test_traced]
    fn test_init_respects_limit() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            // Only half of the addressable range may be used
            let platform = mocks::Platform::new(64 * PAGE_SIZE as u64);
            let (manager, _) = init(&context, &platform, 1, 64);
            assert_eq!(manager.slots(), 32);
        });
    }

    #[test_traced]
    fn test_init_iova_exhausted() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(PAGE_SIZE as u64);
            let result = Test::init(
                context.with_label("manager"),
                platform.clone(),
                Config::default(),
            );
            assert!(matches!(result, Err(Error::IovaExhausted)));
            assert!(platform.reserved().is_empty());
        });
    }

    #[test]
    #[should_panic(expected = "too many pools")]
    fn test_init_too_many_pools() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 48);
            let _ = Test::init(
                context,
                platform,
                Config {
                    pools: NZUsize!(MAX_POOLS + 1),
                    ..Config::default()
                },
            );
        });
    }

    #[test_traced]
    fn test_fallback_intervals_never_overlap() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 1, 1);
            let mut live: Vec<(u64, usize, u32)> = Vec::new();
            for owner in 0..500u32 {
                if !live.is_empty() && context.gen_bool(0.4) {
                    let (iova, size, _) = live.swap_remove(context.gen_range(0..live.len()));
                    let handle = iova + context.gen_range(0..size as u64);
                    manager.release_buffer(handle, true, |_| {}).unwrap();
                    continue;
                }
                let len = context.gen_range(PAGE_SIZE + 1..=64 * 1024);
                let a = manager.alloc_buffer(&owner, 0..len, Access::ReadWrite).unwrap();
                live.push((a.iova, a.pages.size(), owner));

                // Disjoint and resolvable
                let mut sorted = live.clone();
                sorted.sort();
                for pair in sorted.windows(2) {
                    assert!(pair[0].0 + pair[0].1 as u64 <= pair[1].0);
                }
                for (iova, size, owner) in &live {
                    let buffer = manager.find_buffer(iova + *size as u64 - 1).unwrap();
                    assert_eq!(buffer.iova, *iova);
                    assert_eq!(buffer.owner, *owner);
                }
            }
            for (iova, _, _) in live {
                manager.release_buffer(iova, true, |_| {}).unwrap();
            }
            assert_eq!(platform.reserved(), vec![manager.window()]);
            assert_eq!(platform.live_pages(), 0);
        });
    }

    #[test_traced]
    fn test_destroy() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 2, 4);
            let a = manager.alloc_buffer(&1, 0..10, Access::Read).unwrap();
            let b = manager.alloc_buffer(&2, 0..6000, Access::Write).unwrap();
            map(&platform, &a, Access::Read);
            map(&platform, &b, Access::Write);
            drop(a.pages);
            drop(b.pages);
            manager.release_buffer(a.iova, true, |_| {}).unwrap();
            manager.release_buffer(b.iova, true, |_| {}).unwrap();

            manager.destroy();
            assert!(platform.reserved().is_empty());
            assert_eq!(platform.live_pages(), 0);
            assert!(matches!(
                manager.alloc_buffer(&3, 0..10, Access::Read),
                Err(Error::Exhausted)
            ));

            // Idempotent
            manager.destroy();
        });
    }

    #[test_traced]
    fn test_destroy_leaks_live_buffers() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 1, 4);
            let a = manager.alloc_buffer(&1, 0..10, Access::Read).unwrap();
            let b = manager.alloc_buffer(&2, 0..10, Access::Read).unwrap();
            let c = manager.alloc_buffer(&3, 0..9000, Access::Read).unwrap();
            map(&platform, &a, Access::Read);
            map(&platform, &c, Access::Read);
            manager.release_buffer(b.iova, true, |_| {}).unwrap();
            drop(b.pages);
            drop(a.pages);
            drop(c.pages);

            manager.destroy();

            // Live buffers stay mapped with their pages and addresses
            assert_eq!(platform.live_pages(), 1 + 4);
            assert_eq!(platform.mapping(a.iova), Some(Access::Read));
            assert_eq!(platform.reserved().len(), 2);
            assert_eq!(
                manager.release_buffer(a.iova, true, |_| {}),
                Err(Error::NotFound(a.iova))
            );
            assert_eq!(
                manager.release_buffer(c.iova, true, |_| {}),
                Err(Error::NotFound(c.iova))
            );
            assert!(context.encode().contains("manager_leaked_total 2"));
        });
    }

    #[test_traced]
    fn test_drop_tears_down_caches() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let platform = mocks::Platform::new(1 << 32);
            let (manager, _) = init(&context, &platform, 1, 1);
            let a = manager.alloc_buffer(&1, 0..10, Access::Read).unwrap();
            map(&platform, &a, Access::Read);
            drop(a.pages);
            manager.release_buffer(a.iova, true, |_| {}).unwrap();

            drop(manager);
            assert!(platform.mapping(a.iova).is_none());
            assert_eq!(platform.live_pages(), 0);
            assert!(platform.reserved().is_empty());
        });
    }
}
