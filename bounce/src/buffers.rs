//! Map caller memory for DMA through bounce buffers.

use crate::{
    evictor::Evictor,
    manager::{self, Allocation, Manager},
    Access, Direction, Error, Page, PageSet, Platform, Protection, PAGE_SIZE,
};
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use commonware_utils::NZUsize;
use std::{num::NonZeroUsize, ops::Range, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Memory owned by the caller of a mapping.
pub trait Memory: Send + Sync + 'static {
    /// Copy `dst.len()` bytes starting at `offset` out of the memory.
    fn read(&self, offset: usize, dst: &mut [u8]);

    /// Copy `src` into the memory starting at `offset`.
    fn write(&self, offset: usize, src: &[u8]);
}

/// A range of caller memory in a scatter list.
pub struct Segment<M> {
    pub memory: Arc<M>,
    pub offset: usize,
    pub length: usize,
}

impl<M> Clone for Segment<M> {
    fn clone(&self) -> Self {
        Self {
            memory: self.memory.clone(),
            offset: self.offset,
            length: self.length,
        }
    }
}

/// The caller memory a bounce buffer mirrors.
pub enum Owner<M> {
    /// Byte `i` of the buffer mirrors byte `i` of the memory.
    Single(Arc<M>),
    /// The segments are laid out back-to-back from the start of the buffer.
    Scatter(Arc<[Segment<M>]>),
}

impl<M> Clone for Owner<M> {
    fn clone(&self) -> Self {
        match self {
            Self::Single(memory) => Self::Single(memory.clone()),
            Self::Scatter(segments) => Self::Scatter(segments.clone()),
        }
    }
}

impl<M: Memory> Owner<M> {
    /// Copy the caller bytes mirrored at buffer `position` into `dst`.
    fn read(&self, position: usize, dst: &mut [u8]) {
        match self {
            Self::Single(memory) => memory.read(position, dst),
            Self::Scatter(segments) => {
                walk(segments, position, dst.len(), |segment, offset, range| {
                    segment.memory.read(segment.offset + offset, &mut dst[range])
                })
            }
        }
    }

    /// Copy `src` into the caller bytes mirrored at buffer `position`.
    fn write(&self, position: usize, src: &[u8]) {
        match self {
            Self::Single(memory) => memory.write(position, src),
            Self::Scatter(segments) => {
                walk(segments, position, src.len(), |segment, offset, range| {
                    segment.memory.write(segment.offset + offset, &src[range])
                })
            }
        }
    }
}

/// Call `f` for each part of `[position, position + len)` that falls in a segment, with the
/// offset into that segment and the matching range relative to `position`.
fn walk<M>(
    segments: &[Segment<M>],
    position: usize,
    len: usize,
    mut f: impl FnMut(&Segment<M>, usize, Range<usize>),
) {
    let end = position + len;
    let mut start = 0;
    for segment in segments {
        let stop = start + segment.length;
        let lo = start.max(position);
        let hi = stop.min(end);
        if lo < hi {
            f(segment, lo - start, lo - position..hi - position);
        }
        if stop >= end {
            break;
        }
        start = stop;
    }
}

/// Flags that modify a single mapping operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    /// Do not copy between caller memory and the bounce buffer.
    ///
    /// When mapping, the whole bounce buffer is zeroed instead.
    pub skip_cpu_sync: bool,
}

/// A contiguous run of IOVA space handed to a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaSegment {
    pub address: u64,
    pub length: usize,
}

/// Configuration for [BounceBuffers].
#[derive(Clone, Debug)]
pub struct Config {
    /// Configuration of the pools.
    pub manager: manager::Config,

    /// How often the eviction clock ticks while any slot is cached.
    ///
    /// An idle cached slot is evicted after one to two intervals.
    pub eviction_interval: Duration,

    /// Whether the device snoops CPU caches.
    pub coherent: bool,

    /// Largest segment the device accepts in a scatter list.
    pub max_segment_size: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manager: manager::Config::default(),
            eviction_interval: Duration::from_secs(1),
            coherent: false,
            max_segment_size: NZUsize!(64 * 1024),
        }
    }
}

/// Returns true if a transfer of `len` bytes at `offset` cannot be mapped in place (and must be
/// bounced).
pub fn needs_bounce(offset: usize, len: usize) -> bool {
    (offset | len) % PAGE_SIZE != 0
}

/// Bounce buffers attached to one translation domain.
pub struct BounceBuffers<P: Platform, M: Memory> {
    platform: P,
    manager: Arc<Manager<P, Owner<M>>>,
    coherent: bool,
    max_segment_size: usize,
    evictor: Handle<()>,
}

impl<P: Platform, M: Memory> BounceBuffers<P, M> {
    /// Reserve the pooled window on `platform` and start the eviction clock.
    pub fn init<E: Spawner + Clock + Metrics>(
        context: E,
        platform: P,
        cfg: Config,
    ) -> Result<Self, Error> {
        let (manager, wake) =
            Manager::init(context.with_label("manager"), platform.clone(), cfg.manager)?;
        let manager = Arc::new(manager);
        let evictor = Evictor::new(
            context.with_label("evictor"),
            Arc::downgrade(&manager),
            cfg.eviction_interval,
            wake,
        )
        .start();
        Ok(Self {
            platform,
            manager,
            coherent: cfg.coherent,
            max_segment_size: cfg.max_segment_size.get(),
            evictor,
        })
    }

    /// Map `range` of `memory` for a transfer in `dir`.
    ///
    /// Returns the handle the device should use for the first byte of `range`.
    pub fn map(
        &self,
        memory: Arc<M>,
        range: Range<usize>,
        dir: Direction,
        flags: Flags,
    ) -> Result<u64, Error> {
        if range.is_empty() {
            return Err(Error::EmptyRequest);
        }
        let offset = range.start;
        let allocation = self.map_owner(&Owner::Single(memory), range, dir, flags)?;
        Ok(allocation.iova + offset as u64)
    }

    /// Map every segment in `segments` into one bounce buffer for a transfer in `dir`.
    ///
    /// Returns the handle of the buffer along with the device-visible segments, none longer than
    /// the configured maximum segment size.
    pub fn map_scatter_list(
        &self,
        segments: Arc<[Segment<M>]>,
        dir: Direction,
        flags: Flags,
    ) -> Result<(u64, Vec<DmaSegment>), Error> {
        let total = segments
            .iter()
            .try_fold(0usize, |total, segment| total.checked_add(segment.length))
            .ok_or(Error::Exhausted)?;
        if total == 0 {
            return Err(Error::EmptyRequest);
        }
        let allocation = self.map_owner(&Owner::Scatter(segments), 0..total, dir, flags)?;
        let dma = (0..total)
            .step_by(self.max_segment_size)
            .map(|start| DmaSegment {
                address: allocation.iova + start as u64,
                length: self.max_segment_size.min(total - start),
            })
            .collect();
        Ok((allocation.iova, dma))
    }

    fn map_owner(
        &self,
        owner: &Owner<M>,
        range: Range<usize>,
        dir: Direction,
        flags: Flags,
    ) -> Result<Allocation<P>, Error> {
        let access = Access::from(dir);
        let allocation = self.manager.alloc_buffer(owner, range.clone(), access)?;
        let pages = &allocation.pages;
        let size = pages.size();

        // Nothing outside the caller's bytes may reach the device
        if flags.skip_cpu_sync {
            self.zero(pages, 0..size);
        } else {
            self.transfer(owner, pages, range.clone(), dir, false);
            self.zero(pages, 0..range.start);
            self.zero(pages, range.end..size);
        }

        if !allocation.mapped {
            let prot = Protection {
                access,
                coherent: self.coherent,
            };
            let mapped = self.platform.map(allocation.iova, pages.pages(), prot);
            if mapped < size {
                debug!(iova = allocation.iova, size, mapped, "unable to map buffer");
                if let Err(err) = self.manager.release_buffer(allocation.iova, false, |_| {}) {
                    warn!(?err, "unable to release partially mapped buffer");
                }
                return Err(Error::MapFailed(allocation.iova));
            }
        }
        Ok(allocation)
    }

    /// Unmap the transfer at `handle`, copying device writes back to the caller unless
    /// `flags.skip_cpu_sync` is set.
    ///
    /// For a single mapping, `size` bytes starting at `handle` are copied. For a scatter list,
    /// every segment is copied.
    pub fn unmap(
        &self,
        handle: u64,
        size: usize,
        dir: Direction,
        flags: Flags,
    ) -> Result<(), Error> {
        self.manager.release_buffer(handle, true, |buffer| {
            if flags.skip_cpu_sync {
                return;
            }
            let range = match &buffer.owner {
                Owner::Single(_) => {
                    let offset = (handle - buffer.iova) as usize;
                    offset..offset.saturating_add(size).min(buffer.pages.size())
                }
                Owner::Scatter(segments) => 0..segments.iter().map(|s| s.length).sum(),
            };
            self.transfer(&buffer.owner, &buffer.pages, range, dir, true);
        })
    }

    /// Bring `size` bytes at `handle` up to date for the CPU (`to_cpu`) or the device.
    pub fn sync(
        &self,
        handle: u64,
        size: usize,
        dir: Direction,
        to_cpu: bool,
    ) -> Result<(), Error> {
        let buffer = self
            .manager
            .find_buffer(handle)
            .ok_or(Error::NotFound(handle))?;
        let offset = (handle - buffer.iova) as usize;
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= buffer.pages.size())
            .ok_or(Error::OutOfBounds(handle))?;
        self.transfer(&buffer.owner, &buffer.pages, offset..end, dir, to_cpu);
        Ok(())
    }

    /// Bring every segment of the scatter list mapped at `handle` up to date for the CPU
    /// (`to_cpu`) or the device.
    ///
    /// Fails with [Error::OwnerMismatch] unless `segments` is the very list that was mapped.
    pub fn sync_scatter_list(
        &self,
        handle: u64,
        segments: &Arc<[Segment<M>]>,
        dir: Direction,
        to_cpu: bool,
    ) -> Result<(), Error> {
        let buffer = self
            .manager
            .find_buffer(handle)
            .ok_or(Error::NotFound(handle))?;
        let Owner::Scatter(mapped) = &buffer.owner else {
            return Err(Error::OwnerMismatch(handle));
        };
        if !Arc::ptr_eq(mapped, segments) {
            return Err(Error::OwnerMismatch(handle));
        }
        let total = segments.iter().map(|segment| segment.length).sum();
        self.transfer(&buffer.owner, &buffer.pages, 0..total, dir, to_cpu);
        Ok(())
    }

    /// Copy `range` of the buffer between `pages` and the owner's memory, with whatever cache
    /// maintenance the device needs.
    fn transfer(
        &self,
        owner: &Owner<M>,
        pages: &PageSet<P>,
        range: Range<usize>,
        dir: Direction,
        to_cpu: bool,
    ) {
        let copy = dir.needs_copy(to_cpu);
        if self.coherent && !copy {
            return;
        }
        let mut scratch = [0u8; PAGE_SIZE];
        let mut position = range.start;
        for (page, offset, len) in pages.chunks(range.start, range.len()) {
            let scratch = &mut scratch[..len];
            if to_cpu {
                if !self.coherent {
                    self.platform.sync_for_cpu(page, offset, len, dir);
                }
                if copy {
                    page.read(offset, scratch);
                    owner.write(position, scratch);
                }
            } else {
                if copy {
                    owner.read(position, scratch);
                    page.write(offset, scratch);
                }
                if !self.coherent {
                    self.platform.sync_for_device(page, offset, len, dir);
                }
            }
            position += len;
        }
    }

    /// Zero `range` of the buffer and make the zeroes visible to the device.
    fn zero(&self, pages: &PageSet<P>, range: Range<usize>) {
        for (page, offset, len) in pages.chunks(range.start, range.len()) {
            page.zero(offset, len);
            if !self.coherent {
                self.platform
                    .sync_for_device(page, offset, len, Direction::Bidirectional);
            }
        }
    }

    /// Stop the eviction clock, tear down every cached buffer, and release the pooled window.
    ///
    /// Transfers that are still mapped keep their buffers (which are leaked).
    pub async fn destroy(self) {
        self.evictor.abort();
        let _ = self.evictor.await;
        self.manager.destroy();
    }
}
