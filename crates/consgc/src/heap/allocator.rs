//! Size-class allocation.
//!
//! Free objects are threaded through their first word. Lists are kept per
//! (kind, size class); a fresh block is carved into a list in address order.
//! Objects leave a list with the link word cleared.

use std::ptr;
use std::sync::Arc;

use super::block::{offset_map, BlockHeader, BlockSpace, HeaderIndex};
use super::{BlockGeometry, KindTable, ObjectKind, GRANULE_BYTES, LOG_GRANULE};
use crate::error::{fatal, GcError};

/// Singly linked list of free objects of one size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeList {
    head: usize,
    len: usize,
}

impl FreeList {
    pub const EMPTY: Self = Self { head: 0, len: 0 };

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head == 0
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn head(&self) -> usize {
        self.head
    }

    /// Pushes a free object.
    ///
    /// # Safety
    ///
    /// `addr` must be a free heap object of at least one word that nothing
    /// else references.
    #[inline]
    pub unsafe fn push(&mut self, addr: usize) {
        // SAFETY: the caller hands over the object.
        unsafe { ptr::write(addr as *mut usize, self.head) };
        self.head = addr;
        self.len += 1;
    }

    /// Pops an object and clears its link word.
    ///
    /// # Safety
    ///
    /// Every element must be a free object whose first word is the link.
    #[inline]
    pub unsafe fn pop(&mut self) -> Option<usize> {
        if self.head == 0 {
            return None;
        }
        let addr = self.head;
        // SAFETY: list elements are free objects owned by this list.
        unsafe {
            self.head = ptr::read(addr as *const usize);
            ptr::write(addr as *mut usize, 0);
        }
        self.len -= 1;
        Some(addr)
    }

    /// Detaches the first `max` elements (all of them if fewer).
    ///
    /// # Safety
    ///
    /// As for [`FreeList::pop`].
    pub unsafe fn split_off_front(&mut self, max: usize) -> Self {
        if max == 0 || self.is_empty() {
            return Self::EMPTY;
        }
        if self.len <= max {
            return std::mem::take(self);
        }
        let mut last = self.head;
        for _ in 1..max {
            // SAFETY: fewer than `len` links are followed.
            last = unsafe { ptr::read(last as *const usize) };
        }
        // SAFETY: `last` is the `max`th element.
        let rest = unsafe { ptr::read(last as *const usize) };
        unsafe { ptr::write(last as *mut usize, 0) };
        let front = Self { head: self.head, len: max };
        self.head = rest;
        self.len -= max;
        front
    }

    /// Walks the links.
    ///
    /// # Safety
    ///
    /// As for [`FreeList::pop`]; the list must not change during the walk.
    pub unsafe fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let mut next = self.head;
        let mut remaining = self.len;
        std::iter::from_fn(move || {
            if next == 0 || remaining == 0 {
                return None;
            }
            let addr = next;
            // SAFETY: forwarded from the caller.
            next = unsafe { ptr::read(addr as *const usize) };
            remaining -= 1;
            Some(addr)
        })
    }
}

/// Carves a block into objects of `granules` granules and links them in
/// address order.
///
/// # Safety
///
/// `start` must be a block this caller exclusively owns.
pub unsafe fn carve_block(
    start: usize,
    granules: usize,
    geometry: &BlockGeometry,
    zero_fill: bool,
) -> FreeList {
    if zero_fill {
        // SAFETY: the block is owned by the caller.
        unsafe { ptr::write_bytes(start as *mut u8, 0, geometry.block_size) };
    }
    let count = geometry.objects_per_block(granules);
    let step = granules << LOG_GRANULE;
    let mut list = FreeList::EMPTY;
    for i in (0..count).rev() {
        // SAFETY: each object lies inside the owned block.
        unsafe { list.push(start + i * step) };
    }
    list
}

/// A fresh block of small objects, registered but not yet carved.
#[derive(Debug, Clone, Copy)]
pub struct FreshBlock {
    pub index: HeaderIndex,
    pub start: usize,
    pub granules: usize,
    /// Contents must be zero-filled before use.
    pub needs_zeroing: bool,
    pub black_listed: bool,
}

/// An object handed out by the global allocator.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub addr: usize,
    pub bytes: usize,
    pub black_listed: bool,
}

/// An object given back by an explicit release.
#[derive(Debug, Clone, Copy)]
pub struct Released {
    pub bytes: usize,
    pub scanned: bool,
}

/// Global free lists and kind table.
pub struct SizeClassAllocator {
    geometry: BlockGeometry,
    pub kinds: KindTable,
    /// Indexed by kind, then by size in granules.
    lists: Vec<Vec<FreeList>>,
    offset_maps: Vec<Option<Arc<[u16]>>>,
}

impl SizeClassAllocator {
    #[must_use]
    pub fn new(geometry: BlockGeometry) -> Self {
        let kinds = KindTable::new();
        let lists = (0..kinds.len())
            .map(|_| vec![FreeList::EMPTY; geometry.max_small_granules + 1])
            .collect();
        Self {
            geometry,
            kinds,
            lists,
            offset_maps: vec![None; geometry.max_small_granules + 1],
        }
    }

    #[must_use]
    pub const fn geometry(&self) -> &BlockGeometry {
        &self.geometry
    }

    /// Registers a new object kind.
    ///
    /// # Errors
    ///
    /// [`GcError::TooManyKinds`] when the table is full.
    pub fn add_kind(&mut self, desc: super::KindDescriptor) -> Result<ObjectKind, GcError> {
        let kind = self.kinds.add(desc)?;
        self.lists
            .push(vec![FreeList::EMPTY; self.geometry.max_small_granules + 1]);
        Ok(kind)
    }

    #[inline]
    pub fn list_mut(&mut self, kind: ObjectKind, granules: usize) -> &mut FreeList {
        let _ = self.kinds.get(kind);
        &mut self.lists[kind.index()][granules]
    }

    /// Whether `addr` already sits on the global list for its size. Debug
    /// builds walk the whole list; release builds only look at the head.
    /// Objects parked in thread caches are not seen.
    #[must_use]
    pub fn is_free_listed(&self, kind: ObjectKind, granules: usize, addr: usize) -> bool {
        let list = &self.lists[kind.index()][granules];
        if cfg!(debug_assertions) {
            // SAFETY: global lists only hold free objects and change only
            // under the allocation lock, which the caller holds.
            unsafe { list.iter() }.any(|free| free == addr)
        } else {
            list.head() == addr
        }
    }

    /// All lists with their kind and size.
    pub fn lists(&self) -> impl Iterator<Item = (ObjectKind, usize, &FreeList)> + '_ {
        self.lists.iter().enumerate().flat_map(|(k, per_size)| {
            per_size.iter().enumerate().map(move |(g, list)| {
                (ObjectKind(u8::try_from(k).unwrap_or(u8::MAX)), g, list)
            })
        })
    }

    /// Empties every global list. Used right before a sweep rebuilds them.
    pub fn clear_lists(&mut self) {
        for per_size in &mut self.lists {
            per_size.fill(FreeList::EMPTY);
        }
    }

    /// Detaches up to `max` objects for a thread cache.
    pub fn take_batch(&mut self, kind: ObjectKind, granules: usize, max: usize) -> FreeList {
        // SAFETY: global lists only hold free objects.
        unsafe { self.list_mut(kind, granules).split_off_front(max) }
    }

    /// Offset map for `granules`, built on first use.
    pub fn offsets(&mut self, granules: usize) -> Arc<[u16]> {
        let gpb = self.geometry.granules_per_block;
        Arc::clone(
            self.offset_maps[granules].get_or_insert_with(|| offset_map(gpb, granules)),
        )
    }

    /// Reserves and registers a block for `granules`-sized objects.
    ///
    /// # Errors
    ///
    /// Arena recommit failures.
    pub fn new_small_block(
        &mut self,
        space: &mut BlockSpace,
        kind: ObjectKind,
        granules: usize,
        allow_black_listed: bool,
    ) -> Result<Option<FreshBlock>, GcError> {
        let clear = self.kinds.get(kind).clear;
        let Some(reserved) = space.reserve(1, allow_black_listed)? else {
            return Ok(None);
        };
        let start = reserved.taken.start;
        let offsets = self.offsets(granules);
        let header = BlockHeader::small(start, kind, granules, &self.geometry, offsets);
        let index = space.install(header);
        Ok(Some(FreshBlock {
            index,
            start,
            granules,
            needs_zeroing: clear && !reserved.taken.zeroed,
            black_listed: reserved.black_listed,
        }))
    }

    /// Allocates a small object straight from the global lists, carving a
    /// new block under the lock if needed. `Ok(None)` means no block was
    /// available.
    ///
    /// # Errors
    ///
    /// Arena recommit failures.
    pub fn alloc_small(
        &mut self,
        space: &mut BlockSpace,
        kind: ObjectKind,
        granules: usize,
        allow_black_listed: bool,
    ) -> Result<Option<Allocation>, GcError> {
        let mut black_listed = false;
        if self.list_mut(kind, granules).is_empty() {
            let Some(fresh) = self.new_small_block(space, kind, granules, allow_black_listed)? else {
                return Ok(None);
            };
            black_listed = fresh.black_listed;
            // SAFETY: the block was just reserved and is not yet visible.
            *self.list_mut(kind, granules) =
                unsafe { carve_block(fresh.start, granules, &self.geometry, fresh.needs_zeroing) };
        }
        // SAFETY: global lists only hold free objects.
        let Some(addr) = (unsafe { self.list_mut(kind, granules).pop() }) else {
            return Ok(None);
        };
        if self.kinds.get(kind).uncollectable {
            mark_uncollectable(space, addr);
        }
        Ok(Some(Allocation {
            addr,
            bytes: granules * GRANULE_BYTES,
            black_listed,
        }))
    }

    /// Allocates a large object of whole blocks.
    ///
    /// # Errors
    ///
    /// Arena recommit failures.
    pub fn alloc_large(
        &mut self,
        space: &mut BlockSpace,
        kind: ObjectKind,
        bytes: usize,
        allow_black_listed: bool,
    ) -> Result<Option<Allocation>, GcError> {
        let desc = *self.kinds.get(kind);
        let blocks = self.geometry.blocks_for(bytes);
        let Some(reserved) = space.reserve(blocks, allow_black_listed)? else {
            return Ok(None);
        };
        let start = reserved.taken.start;
        let len = blocks * self.geometry.block_size;
        if !reserved.taken.zeroed {
            if desc.clear {
                // SAFETY: reserved blocks belong to nobody else.
                unsafe { ptr::write_bytes(start as *mut u8, 0, len) };
            } else {
                // SAFETY: as above. Only the first word has to be clean.
                unsafe { ptr::write(start as *mut usize, 0) };
            }
        }
        let header = BlockHeader::large(start, blocks, kind, &self.geometry);
        if desc.uncollectable {
            header.marks.test_and_set(0);
        }
        space.install(header);
        Ok(Some(Allocation {
            addr: start,
            bytes: len,
            black_listed: reserved.black_listed,
        }))
    }

    /// Explicitly frees the object starting at `addr`.
    ///
    /// Freeing something that is not an object start in an in-use block, a
    /// released uncollectable object, or the object heading its free list is
    /// a fatal error.
    pub fn release(&mut self, space: &mut BlockSpace, addr: usize) -> Released {
        let Some((index, header)) = space.header_for(addr) else {
            fatal!("invalid or double free of {addr:#x}: not an allocated heap block")
        };
        if header.locate(addr, false).map(|o| o.start) != Some(addr) {
            fatal!("invalid free of {addr:#x}: not the start of an object");
        }
        let (kind, granules, large, bytes) =
            (header.kind, header.granules, header.is_large(), header.object_bytes);
        let desc = *self.kinds.get(kind);
        if desc.uncollectable {
            let obj = header.locate(addr, false).map_or(0, |o| o.index);
            if !header.marks.unset(obj) {
                fatal!("double free of uncollectable object {addr:#x}");
            }
        }

        if large {
            space.free_block(index);
        } else {
            if self.is_free_listed(kind, granules, addr) {
                fatal!("double free of {addr:#x}");
            }
            let list = self.list_mut(kind, granules);
            if desc.clear {
                // SAFETY: the caller gave up the object.
                unsafe { ptr::write_bytes(addr as *mut u8, 0, bytes) };
            }
            // SAFETY: as above.
            unsafe { list.push(addr) };
        }
        Released {
            bytes,
            scanned: desc.scan,
        }
    }
}

fn mark_uncollectable(space: &BlockSpace, addr: usize) {
    if let Some((_, header)) = space.header_for(addr) {
        if let Some(obj) = header.locate(addr, false) {
            header.marks.test_and_set(obj.index);
        }
    }
}
