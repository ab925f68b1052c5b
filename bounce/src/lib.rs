//! Bounce DMA transfers through pooled, IOMMU-mapped buffers.
//!
//! When a caller's memory cannot be handed to a device directly (its offset or length does not
//! line up with the translation granule, or the device needs a contiguous window), the transfer
//! is staged through a bounce buffer: a set of pages owned by this crate and mapped at a dedicated
//! I/O virtual address (IOVA). Data is copied into the bounce buffer before the device sees it and
//! copied back out once the device is done.
//!
//! # Architecture
//!
//! Bounce buffers are served by a two-tier [manager::Manager]:
//!
//! - **Pools**: one pool per power-of-two size class (`PAGE_SIZE << k`). Each pool owns a
//!   self-aligned slice of a reserved IOVA window and a lazily populated array of slots. Released
//!   slots stay mapped and are kept in per-[Access] stacks so the next request of the same shape
//!   reuses them without touching the page allocator or the translation unit.
//! - **Fallback**: requests larger than the largest size class (or that miss an exhausted pool)
//!   get an individually reserved IOVA range, tracked in an ordered interval map.
//!
//! Cached slots are aged by a two-generation clock. A single background task ticks every
//! eviction interval: slots that are `Current` become `Old`, and slots that are already `Old` are
//! unmapped and their pages freed. A cached slot therefore lives between one and two intervals
//! after its last release. The task only runs while some cache is non-empty.
//!
//! [BounceBuffers] sits on top of the manager and implements the mapping API: it copies data
//! between caller memory and bounce pages (with cache maintenance for non-coherent devices),
//! zeroes any part of a bounce buffer the caller's data does not cover, and maps the result.
//!
//! # Non-Blocking
//!
//! No operation exposed by [BounceBuffers] (other than [BounceBuffers::destroy]) awaits. Locks are
//! held only across constant or logarithmic bookkeeping, never across page allocation, copies, or
//! calls into the translation unit.
//!
//! # Example
//!
//! ```rust
//! use commonware_bounce::{mocks, BounceBuffers, Config, Direction, Flags};
//! use commonware_runtime::{deterministic, Metrics, Runner};
//! use std::sync::Arc;
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     // Attach bounce buffers to a (mock) IOMMU domain
//!     let platform = mocks::Platform::new(1 << 32);
//!     let buffers = BounceBuffers::init(
//!         context.with_label("bounce"),
//!         platform.clone(),
//!         Config::default(),
//!     )
//!     .unwrap();
//!
//!     // Map 100 bytes at an unaligned offset
//!     let memory = Arc::new(mocks::Memory::new(vec![7; 512]));
//!     let handle = buffers
//!         .map(memory.clone(), 10..110, Direction::ToDevice, Flags::default())
//!         .unwrap();
//!
//!     // The device sees the caller's bytes at the returned handle
//!     assert_eq!(platform.device_read(handle, 100).unwrap(), vec![7; 100]);
//!
//!     // Unmap the transfer and detach
//!     buffers
//!         .unmap(handle, 100, Direction::ToDevice, Flags::default())
//!         .unwrap();
//!     buffers.destroy().await;
//! });
//! ```
//!
//! # Status
//!
//! `commonware-bounce` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use thiserror::Error;

mod buffers;
pub use buffers::{
    needs_bounce, BounceBuffers, Config, DmaSegment, Flags, Memory, Owner, Segment,
};
mod evictor;
pub mod manager;
pub mod mocks;
mod pages;
pub use pages::PageSet;
mod platform;
pub use platform::{Coherency, Iova, Page, Pages, Platform, Translate, Zone};

/// Size of a physical page (and of the smallest size class).
pub const PAGE_SIZE: usize = 4096;

/// The capability with which a buffer is exposed to a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    /// The device may only read the buffer.
    Read,
    /// The device may only write the buffer.
    Write,
    /// The device may read and write the buffer.
    ReadWrite,
}

impl Access {
    /// All access modes, in bucket order.
    pub const ALL: [Access; 3] = [Access::Read, Access::Write, Access::ReadWrite];

    /// Index of the cache bucket that holds slots of this mode.
    pub const fn index(self) -> usize {
        match self {
            Access::Read => 0,
            Access::Write => 1,
            Access::ReadWrite => 2,
        }
    }

    /// Returns true if the device may read a buffer exposed with this mode.
    pub const fn readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    /// Returns true if the device may write a buffer exposed with this mode.
    pub const fn writable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

impl From<Direction> for Access {
    fn from(dir: Direction) -> Self {
        match dir {
            Direction::ToDevice => Access::Read,
            Direction::FromDevice => Access::Write,
            Direction::Bidirectional => Access::ReadWrite,
        }
    }
}

/// The direction of a DMA transfer, from the CPU's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Data flows from memory to the device.
    ToDevice,
    /// Data flows from the device to memory.
    FromDevice,
    /// Data flows both ways.
    Bidirectional,
}

impl Direction {
    /// Returns true if a sync in this direction must copy between caller memory and the bounce
    /// buffer (`to_cpu` selects which side is being brought up to date).
    pub const fn needs_copy(self, to_cpu: bool) -> bool {
        match self {
            Direction::Bidirectional => true,
            Direction::FromDevice => to_cpu,
            Direction::ToDevice => !to_cpu,
        }
    }
}

/// Attributes of a translation-unit mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Protection {
    /// What the device may do with the mapped pages.
    pub access: Access,
    /// Whether device accesses snoop CPU caches.
    pub coherent: bool,
}

/// Errors that can occur when interacting with bounce buffers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("no bounce buffer available")]
    Exhausted,
    #[error("unable to reserve an iova window")]
    IovaExhausted,
    #[error("no buffer at handle: {0:#x}")]
    NotFound(u64),
    #[error("access exceeds buffer at handle: {0:#x}")]
    OutOfBounds(u64),
    #[error("failed to map buffer at: {0:#x}")]
    MapFailed(u64),
    #[error("failed to unmap buffer at: {0:#x}")]
    UnmapFailed(u64),
    #[error("buffer at handle {0:#x} belongs to another segment list")]
    OwnerMismatch(u64),
    #[error("empty request")]
    EmptyRequest,
}
