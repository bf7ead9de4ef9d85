//! Block headers and the address → header map.
//!
//! Headers live out of line in [`BlockTable`] and are referred to by
//! [`HeaderIndex`]. [`BlockMap`] is a two-level table from block number to
//! slot state; every block of a large object maps to the same header.

use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hasher};
use std::ops::Range;
use std::sync::Arc;

use super::arena::{BlockArena, MemorySource, TakenBlocks};
use super::blacklist::BlackList;
use super::{BlockGeometry, ObjectKind, GRANULE_BYTES, LOG_GRANULE};
use crate::config::GcConfig;
use crate::error::{fatal, GcError};
use crate::gc::mark::MarkBitmap;

/// Offset map entry for granules that belong to no object.
pub const PADDING: u16 = u16::MAX;

// ============================================================================
// BlockHeader
// ============================================================================

/// Index of a header in the [`BlockTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeaderIndex(u32);

impl HeaderIndex {
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// An object located through its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef {
    pub start: usize,
    /// Mark bit index (granule of the object start, 0 for large objects).
    pub index: usize,
}

/// Metadata for one block, or for the run of blocks of a large object.
#[derive(Debug)]
pub struct BlockHeader {
    pub start: usize,
    pub blocks: usize,
    pub kind: ObjectKind,
    /// Object size in granules. 0 for large objects.
    pub granules: usize,
    /// Object size in bytes.
    pub object_bytes: usize,
    pub marks: MarkBitmap,
    /// Granule → displacement from the object start, or [`PADDING`].
    offsets: Option<Arc<[u16]>>,
}

impl BlockHeader {
    /// Header for one block of `granules`-sized objects.
    #[must_use]
    pub fn small(
        start: usize,
        kind: ObjectKind,
        granules: usize,
        geometry: &BlockGeometry,
        offsets: Arc<[u16]>,
    ) -> Self {
        Self {
            start,
            blocks: 1,
            kind,
            granules,
            object_bytes: granules * GRANULE_BYTES,
            marks: MarkBitmap::new(geometry.granules_per_block),
            offsets: Some(offsets),
        }
    }

    /// Header for a large object spanning `blocks` blocks.
    #[must_use]
    pub fn large(start: usize, blocks: usize, kind: ObjectKind, geometry: &BlockGeometry) -> Self {
        Self {
            start,
            blocks,
            kind,
            granules: 0,
            object_bytes: blocks * geometry.block_size,
            marks: MarkBitmap::new(1),
            offsets: None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_large(&self) -> bool {
        self.offsets.is_none()
    }

    /// Address range covered by the header's blocks.
    #[must_use]
    pub const fn range(&self, geometry: &BlockGeometry) -> Range<usize> {
        self.start..self.start + self.blocks * geometry.block_size
    }

    /// Objects the block can hold.
    #[must_use]
    pub const fn capacity(&self, geometry: &BlockGeometry) -> usize {
        if self.is_large() {
            1
        } else {
            geometry.objects_per_block(self.granules)
        }
    }

    /// Start address and mark index of the `n`th object.
    #[inline]
    #[must_use]
    pub const fn object(&self, n: usize) -> ObjectRef {
        if self.is_large() {
            ObjectRef { start: self.start, index: 0 }
        } else {
            let index = n * self.granules;
            ObjectRef {
                start: self.start + (index << LOG_GRANULE),
                index,
            }
        }
    }

    /// The object containing `addr`, or `None` for padding and, without
    /// interior pointers, for anything but an exact object start.
    #[inline]
    #[must_use]
    pub fn locate(&self, addr: usize, interior: bool) -> Option<ObjectRef> {
        let Some(offsets) = &self.offsets else {
            return (interior || addr == self.start).then_some(ObjectRef {
                start: self.start,
                index: 0,
            });
        };
        let granule = (addr - self.start) >> LOG_GRANULE;
        let displacement = offsets[granule];
        if displacement == PADDING {
            return None;
        }
        if !interior && (displacement != 0 || addr & (GRANULE_BYTES - 1) != 0) {
            return None;
        }
        let index = granule - usize::from(displacement);
        Some(ObjectRef {
            start: self.start + (index << LOG_GRANULE),
            index,
        })
    }

    /// Object-start granules of the objects that are marked.
    pub fn marked_objects(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.marks.iter_marked().map(move |index| ObjectRef {
            start: self.start + (index << LOG_GRANULE),
            index,
        })
    }
}

/// Builds the offset map for objects of `granules` granules.
#[must_use]
pub fn offset_map(granules_per_block: usize, granules: usize) -> Arc<[u16]> {
    let usable = (granules_per_block / granules) * granules;
    (0..granules_per_block)
        .map(|g| {
            if g < usable {
                u16::try_from(g % granules).unwrap_or(PADDING)
            } else {
                PADDING
            }
        })
        .collect()
}

// ============================================================================
// BlockTable
// ============================================================================

/// Arena of block headers with slot reuse.
#[derive(Debug, Default)]
pub struct BlockTable {
    slots: Vec<Option<BlockHeader>>,
    vacant: Vec<u32>,
    live: usize,
}

impl BlockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, header: BlockHeader) -> HeaderIndex {
        self.live += 1;
        if let Some(slot) = self.vacant.pop() {
            self.slots[slot as usize] = Some(header);
            return HeaderIndex(slot);
        }
        let slot = match u32::try_from(self.slots.len()) {
            Ok(slot) if slot < BlockMap::FREE - 1 => slot,
            _ => fatal!("block header table is full"),
        };
        self.slots.push(Some(header));
        HeaderIndex(slot)
    }

    pub fn remove(&mut self, index: HeaderIndex) -> BlockHeader {
        let Some(header) = self.slots.get_mut(index.as_usize()).and_then(Option::take) else {
            fatal!("removing vacant block header {}", index.0)
        };
        self.vacant.push(index.0);
        self.live -= 1;
        header
    }

    #[inline]
    #[must_use]
    pub fn get(&self, index: HeaderIndex) -> &BlockHeader {
        match self.slots.get(index.as_usize()) {
            Some(Some(header)) => header,
            _ => fatal!("block header {} is vacant", index.0),
        }
    }

    /// Live headers with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (HeaderIndex, &BlockHeader)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|h| (HeaderIndex(i as u32), h)))
    }

    /// Indices of live headers, collected so the table can be mutated while
    /// walking them.
    #[must_use]
    pub fn indices(&self) -> Vec<HeaderIndex> {
        self.iter().map(|(i, _)| i).collect()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }
}

// ============================================================================
// BlockMap
// ============================================================================

/// What the block map knows about an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSlot {
    /// Not part of the heap.
    Unmapped,
    /// Heap block in the free pool.
    Free,
    InUse(HeaderIndex),
}

const BOTTOM_BITS: u32 = 10;
const BOTTOM_LEN: usize = 1 << BOTTOM_BITS;

/// Multiplicative hash for block-number keys.
#[derive(Default)]
pub struct BlockKeyHasher(u64);

impl Hasher for BlockKeyHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = (self.0.rotate_left(8) ^ u64::from(b)).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        }
    }

    fn write_usize(&mut self, n: usize) {
        self.0 = (n as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    }
}

/// Two-level map from block number to [`BlockSlot`].
///
/// Bottom tables hold `u32` codes: 0 unmapped, [`BlockMap::FREE`] free,
/// otherwise header index + 1.
pub struct BlockMap {
    log_block: u32,
    top: HashMap<usize, Box<[u32; BOTTOM_LEN]>, BuildHasherDefault<BlockKeyHasher>>,
}

impl BlockMap {
    pub const FREE: u32 = u32::MAX;

    #[must_use]
    pub fn new(log_block: u32) -> Self {
        Self {
            log_block,
            top: HashMap::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, addr: usize) -> BlockSlot {
        let block = addr >> self.log_block;
        let Some(bottom) = self.top.get(&(block >> BOTTOM_BITS)) else {
            return BlockSlot::Unmapped;
        };
        match bottom[block & (BOTTOM_LEN - 1)] {
            0 => BlockSlot::Unmapped,
            Self::FREE => BlockSlot::Free,
            code => BlockSlot::InUse(HeaderIndex(code - 1)),
        }
    }

    /// Sets `blocks` consecutive blocks starting at `start`.
    pub fn set(&mut self, start: usize, blocks: usize, slot: BlockSlot) {
        let code = match slot {
            BlockSlot::Unmapped => 0,
            BlockSlot::Free => Self::FREE,
            BlockSlot::InUse(HeaderIndex(i)) => i + 1,
        };
        let first = start >> self.log_block;
        for block in first..first + blocks {
            let bottom = self
                .top
                .entry(block >> BOTTOM_BITS)
                .or_insert_with(|| Box::new([0; BOTTOM_LEN]));
            bottom[block & (BOTTOM_LEN - 1)] = code;
        }
    }
}

// ============================================================================
// BlockSpace
// ============================================================================

/// Arena, headers, map and black list: everything that knows where blocks
/// are.
pub struct BlockSpace {
    pub geometry: BlockGeometry,
    pub arena: BlockArena,
    pub table: BlockTable,
    pub map: BlockMap,
    pub black_list: BlackList,
    pub black_list_slack: usize,
}

/// Blocks reserved for a new header.
#[derive(Debug, Clone, Copy)]
pub struct Reserved {
    pub taken: TakenBlocks,
    pub black_listed: bool,
}

impl BlockSpace {
    pub fn new(geometry: BlockGeometry, config: &GcConfig, memory: Arc<dyn MemorySource>) -> Self {
        Self {
            geometry,
            arena: BlockArena::new(
                geometry,
                memory,
                config.min_heap_increment,
                config.max_heap_increment,
                config.max_heap_size,
            ),
            table: BlockTable::new(),
            map: BlockMap::new(geometry.log_block),
            black_list: BlackList::new(config.black_list_log_entries, geometry.log_block),
            black_list_slack: config.black_list_slack,
        }
    }

    /// Grows the heap by at least `bytes`.
    ///
    /// # Errors
    ///
    /// See [`BlockArena::expand`].
    pub fn expand(&mut self, bytes: usize) -> Result<usize, GcError> {
        let added = self.arena.expand(bytes)?;
        self.map.set(added.start, added.len() >> self.geometry.log_block, BlockSlot::Free);
        Ok(added.len())
    }

    /// Takes `blocks` blocks from the free pool, avoiding black-listed ones
    /// unless `allow_black_listed`.
    ///
    /// # Errors
    ///
    /// Recommit failures from the arena.
    pub fn reserve(&mut self, blocks: usize, allow_black_listed: bool) -> Result<Option<Reserved>, GcError> {
        let Some(placement) =
            self.arena
                .find(blocks, &self.black_list, self.black_list_slack, allow_black_listed)
        else {
            return Ok(None);
        };
        let taken = self.arena.take(placement.start, blocks)?;
        Ok(Some(Reserved {
            taken,
            black_listed: placement.black_listed,
        }))
    }

    /// Registers a header for reserved blocks.
    pub fn install(&mut self, header: BlockHeader) -> HeaderIndex {
        let (start, blocks) = (header.start, header.blocks);
        let index = self.table.insert(header);
        self.map.set(start, blocks, BlockSlot::InUse(index));
        index
    }

    /// Drops a header and gives its blocks back to the arena.
    pub fn free_block(&mut self, index: HeaderIndex) -> BlockHeader {
        let header = self.table.remove(index);
        self.map.set(header.start, header.blocks, BlockSlot::Free);
        self.arena.release(header.start, header.blocks);
        header
    }

    /// Inside `[least, greatest)`: worth a block map lookup.
    #[inline]
    #[must_use]
    pub const fn is_plausible(&self, addr: usize) -> bool {
        addr >= self.arena.least() && addr < self.arena.greatest()
    }

    /// Header of the in-use block containing `addr`.
    #[inline]
    #[must_use]
    pub fn header_for(&self, addr: usize) -> Option<(HeaderIndex, &BlockHeader)> {
        if !self.is_plausible(addr) {
            return None;
        }
        match self.map.get(addr) {
            BlockSlot::InUse(index) => Some((index, self.table.get(index))),
            BlockSlot::Free | BlockSlot::Unmapped => None,
        }
    }
}
