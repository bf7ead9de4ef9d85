//! BiBOP heap: fixed-size blocks, each holding objects of one size class
//! and one kind.
//!
//! Everything here is owned by [`Heap`], which sits behind the allocation
//! lock. Mark bits are atomic so helper markers can set them through a
//! shared borrow while the controller holds the lock.

pub mod allocator;
pub mod arena;
pub mod blacklist;
pub mod block;
pub mod roots;

use crate::config::GcConfig;
use crate::error::{fatal, GcError};
use crate::gc::engine::MarkEngine;

pub use allocator::{FreeList, SizeClassAllocator};
pub use arena::{BlockArena, MemorySource, SystemMemory};
pub use blacklist::{AddressSet, BlackList, HashedBitTable};
pub use block::{BlockHeader, BlockMap, BlockSlot, BlockSpace, BlockTable, HeaderIndex};
pub use roots::RootSet;

/// Machine word size.
pub const WORD: usize = std::mem::size_of::<usize>();

#[cfg(target_pointer_width = "64")]
pub const LOG_GRANULE: usize = 4;
#[cfg(not(target_pointer_width = "64"))]
pub const LOG_GRANULE: usize = 3;

/// Allocation unit. Every object size is a multiple of it.
pub const GRANULE_BYTES: usize = 1 << LOG_GRANULE;

/// Block layout derived from the configured block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    pub block_size: usize,
    pub log_block: u32,
    pub granules_per_block: usize,
    /// Largest small size class in granules (half a block).
    pub max_small_granules: usize,
    extra_bytes: usize,
}

impl BlockGeometry {
    #[must_use]
    pub const fn new(block_size: usize, extra_byte: bool) -> Self {
        let granules_per_block = block_size >> LOG_GRANULE;
        Self {
            block_size,
            log_block: block_size.trailing_zeros(),
            granules_per_block,
            max_small_granules: granules_per_block / 2,
            extra_bytes: if extra_byte { 1 } else { 0 },
        }
    }

    /// Granules needed for a request of `bytes`. Zero-byte requests take
    /// one granule.
    #[inline]
    #[must_use]
    pub const fn granules_for(&self, bytes: usize) -> usize {
        let padded = bytes.saturating_add(self.extra_bytes);
        let granules = padded.saturating_add(GRANULE_BYTES - 1) >> LOG_GRANULE;
        if granules == 0 {
            1
        } else {
            granules
        }
    }

    /// Largest request whose block count and byte length stay
    /// representable. Anything bigger can never be placed.
    #[inline]
    #[must_use]
    pub const fn max_object_bytes(&self) -> usize {
        (isize::MAX as usize & !(self.block_size - 1)) - self.block_size
    }

    /// Blocks needed for a large object of `bytes`.
    #[inline]
    #[must_use]
    pub const fn blocks_for(&self, bytes: usize) -> usize {
        let padded = bytes.saturating_add(self.extra_bytes);
        let blocks = padded.saturating_add(self.block_size - 1) >> self.log_block;
        if blocks == 0 {
            1
        } else {
            blocks
        }
    }

    #[inline]
    #[must_use]
    pub const fn block_start(&self, addr: usize) -> usize {
        addr & !(self.block_size - 1)
    }

    #[inline]
    #[must_use]
    pub const fn objects_per_block(&self, granules: usize) -> usize {
        self.granules_per_block / granules
    }
}

// ============================================================================
// Object kinds
// ============================================================================

/// Index into a collector's kind table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKind(u8);

impl ObjectKind {
    /// Scanned for pointers, zero-filled when reused.
    pub const NORMAL: Self = Self(0);
    /// Never scanned, never zero-filled.
    pub const ATOMIC: Self = Self(1);
    /// Scanned, never reclaimed, traced as a root.
    pub const UNCOLLECTABLE: Self = Self(2);

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Kinds served from per-thread allocation caches.
    #[inline]
    #[must_use]
    pub const fn is_cached(self) -> bool {
        self.0 <= Self::ATOMIC.0
    }
}

/// Properties of one object kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindDescriptor {
    /// Objects may contain pointers and are scanned when marked.
    pub scan: bool,
    /// Reused objects are zero-filled.
    pub clear: bool,
    /// Objects are never reclaimed by a collection.
    pub uncollectable: bool,
}

/// Kinds beyond this many are refused.
pub const MAX_KINDS: usize = 16;

#[derive(Debug, Clone)]
pub struct KindTable {
    kinds: Vec<KindDescriptor>,
}

impl KindTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            kinds: vec![
                KindDescriptor { scan: true, clear: true, uncollectable: false },
                KindDescriptor { scan: false, clear: false, uncollectable: false },
                KindDescriptor { scan: true, clear: true, uncollectable: true },
            ],
        }
    }

    /// Descriptor of `kind`. A kind not in the table is a fatal error.
    #[inline]
    #[must_use]
    pub fn get(&self, kind: ObjectKind) -> &KindDescriptor {
        match self.kinds.get(kind.index()) {
            Some(desc) => desc,
            None => fatal!("unknown object kind {}", kind.index()),
        }
    }

    /// Registers a new kind.
    ///
    /// # Errors
    ///
    /// [`GcError::TooManyKinds`] once [`MAX_KINDS`] kinds exist.
    pub fn add(&mut self, desc: KindDescriptor) -> Result<ObjectKind, GcError> {
        if self.kinds.len() >= MAX_KINDS {
            return Err(GcError::TooManyKinds);
        }
        self.kinds.push(desc);
        let index = u8::try_from(self.kinds.len() - 1).map_err(|_| GcError::TooManyKinds)?;
        Ok(ObjectKind(index))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl Default for KindTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Heap
// ============================================================================

/// Live totals computed by the last sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveTotals {
    pub pointer_bytes: usize,
    pub pointer_free_bytes: usize,
    pub objects: usize,
}

/// State guarded by the allocation lock.
pub struct Heap {
    pub space: BlockSpace,
    pub allocator: SizeClassAllocator,
    pub roots: RootSet,
    pub engine: MarkEngine,
    /// Completed collections.
    pub gc_no: u64,
    pub live: LiveTotals,
}

impl Heap {
    /// Builds the heap and reserves the initial chunk.
    ///
    /// # Errors
    ///
    /// Fails if the memory source cannot map the initial heap.
    pub fn new(config: &GcConfig, memory: std::sync::Arc<dyn MemorySource>) -> Result<Self, GcError> {
        let geometry = BlockGeometry::new(config.block_size, config.extra_byte);
        let mut space = BlockSpace::new(geometry, config, memory);
        if config.initial_heap_size > 0 {
            space.expand(config.initial_heap_size)?;
        }
        Ok(Self {
            space,
            allocator: SizeClassAllocator::new(geometry),
            roots: RootSet::new(),
            engine: MarkEngine::new(),
            gc_no: 0,
            live: LiveTotals::default(),
        })
    }

    #[must_use]
    pub const fn geometry(&self) -> BlockGeometry {
        self.space.geometry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granule_rounding() {
        let g = BlockGeometry::new(4096, false);
        assert_eq!(g.granules_for(0), 1);
        assert_eq!(g.granules_for(1), 1);
        assert_eq!(g.granules_for(GRANULE_BYTES), 1);
        assert_eq!(g.granules_for(GRANULE_BYTES + 1), 2);
        assert_eq!(g.max_small_granules * GRANULE_BYTES, 2048);

        let padded = BlockGeometry::new(4096, true);
        assert_eq!(padded.granules_for(GRANULE_BYTES), 2);
        assert_eq!(padded.blocks_for(4096), 2);
        assert_eq!(g.blocks_for(4096), 1);
        assert_eq!(g.blocks_for(4097), 2);
        let max = g.max_object_bytes();
        assert!(g.blocks_for(max).checked_mul(4096).is_some());
    }

    #[test]
    fn kind_table_rejects_overflow() {
        let mut kinds = KindTable::new();
        let desc = KindDescriptor { scan: true, clear: true, uncollectable: false };
        for _ in kinds.len()..MAX_KINDS {
            kinds.add(desc).unwrap();
        }
        assert!(matches!(kinds.add(desc), Err(GcError::TooManyKinds)));
        assert!(!kinds.get(ObjectKind::ATOMIC).scan);
    }
}
