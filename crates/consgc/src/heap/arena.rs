//! Block arena: address-space chunks carved into heap blocks.
//!
//! Chunks come from a [`MemorySource`] and are never returned while the
//! collector lives. Free blocks are kept as coalesced runs keyed by start
//! address. Runs that stay free for long enough have their pages decommitted
//! and are recommitted when handed out again.

use std::collections::BTreeMap;
use std::io;
use std::ops::Range;
use std::sync::Arc;

use sys_alloc::{Mmap, MmapOptions};

use super::blacklist::BlackList;
use super::BlockGeometry;
use crate::error::{fatal, GcError};
use crate::tracing::{log_decommit, log_heap_growth};

/// Source of address space for the heap.
pub trait MemorySource: Send + Sync {
    /// Maps at least `size` bytes of zeroed read/write memory.
    ///
    /// # Errors
    ///
    /// Any OS or policy failure; the heap treats it as "cannot grow".
    fn map_memory(&self, size: usize) -> io::Result<Mmap>;

    /// Gives a mapping back. The default drops (unmaps) it.
    fn unmap_memory(&self, mapping: Mmap) {
        drop(mapping);
    }
}

/// Anonymous mappings from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl MemorySource for SystemMemory {
    fn map_memory(&self, size: usize) -> io::Result<Mmap> {
        // SAFETY: no hint address; the kernel picks unused address space.
        unsafe { MmapOptions::new().len(size).no_reserve(true).map_anon() }
    }
}

struct Chunk {
    mapping: Option<Mmap>,
    start: usize,
    len: usize,
}

impl Chunk {
    const fn end(&self) -> usize {
        self.start + self.len
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRun {
    blocks: usize,
    /// Arena epoch (collection number) when the run was last freed.
    freed_at: u64,
    /// Contents are known to be all zero.
    zeroed: bool,
    decommitted: bool,
}

/// Where a block request can be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub start: usize,
    /// Some block of the placement is black-listed.
    pub black_listed: bool,
}

/// Blocks taken out of the free pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakenBlocks {
    pub start: usize,
    pub blocks: usize,
    /// Memory reads as zero.
    pub zeroed: bool,
}

/// Owner of all heap chunks and the free block pool.
pub struct BlockArena {
    geometry: BlockGeometry,
    source: Arc<dyn MemorySource>,
    chunks: Vec<Chunk>,
    free: BTreeMap<usize, FreeRun>,
    heap_size: usize,
    free_bytes: usize,
    unmapped_bytes: usize,
    least: usize,
    greatest: usize,
    min_increment: usize,
    max_increment: usize,
    max_heap_size: Option<usize>,
    epoch: u64,
}

impl BlockArena {
    pub fn new(
        geometry: BlockGeometry,
        source: Arc<dyn MemorySource>,
        min_increment: usize,
        max_increment: usize,
        max_heap_size: Option<usize>,
    ) -> Self {
        Self {
            geometry,
            source,
            chunks: Vec::new(),
            free: BTreeMap::new(),
            heap_size: 0,
            free_bytes: 0,
            unmapped_bytes: 0,
            least: usize::MAX,
            greatest: 0,
            min_increment,
            max_increment,
            max_heap_size,
            epoch: 0,
        }
    }

    #[must_use]
    pub const fn heap_size(&self) -> usize {
        self.heap_size
    }

    #[must_use]
    pub const fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    #[must_use]
    pub const fn unmapped_bytes(&self) -> usize {
        self.unmapped_bytes
    }

    /// Lowest heap address, or `usize::MAX` before the first chunk.
    #[must_use]
    pub const fn least(&self) -> usize {
        self.least
    }

    /// One past the highest heap address.
    #[must_use]
    pub const fn greatest(&self) -> usize {
        self.greatest
    }

    pub const fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Free runs as `(start, blocks)` in address order.
    pub fn free_runs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free.iter().map(|(&start, run)| (start, run.blocks))
    }

    /// Maps a new chunk holding at least `bytes` of blocks and adds it to
    /// the free pool. Returns the address range added.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if the heap cap leaves no room,
    /// [`GcError::Map`] if the memory source fails.
    pub fn expand(&mut self, bytes: usize) -> Result<Range<usize>, GcError> {
        let block = self.geometry.block_size;
        let needed = round_up(bytes.max(block), block)
            .ok_or(GcError::OutOfMemory { requested: bytes })?;
        let mut want = round_up(
            needed.max(self.min_increment).min(self.max_increment.max(needed)),
            block,
        )
        .ok_or(GcError::OutOfMemory { requested: bytes })?;
        if let Some(cap) = self.max_heap_size {
            let room = cap.saturating_sub(self.heap_size) & !(block - 1);
            if room < needed {
                return Err(GcError::OutOfMemory { requested: bytes });
            }
            want = want.min(room);
        }

        let align_slack = if block > sys_alloc::allocation_granularity() { block } else { 0 };
        let Some(mapped_len) = want.checked_add(align_slack) else {
            return Err(GcError::OutOfMemory { requested: bytes });
        };
        let mapping = self.source.map_memory(mapped_len)?;
        let aligned = mapping.aligned_range(block);
        let usable = aligned.len().min(want);
        if usable < needed {
            self.source.unmap_memory(mapping);
            return Err(GcError::OutOfMemory { requested: bytes });
        }

        let chunk = Chunk {
            mapping: Some(mapping),
            start: aligned.start,
            len: usable,
        };
        let pos = self.chunks.partition_point(|c| c.start < chunk.start);
        self.least = self.least.min(chunk.start);
        self.greatest = self.greatest.max(chunk.end());
        self.chunks.insert(pos, chunk);
        self.heap_size += usable;

        self.insert_run(
            aligned.start,
            FreeRun {
                blocks: usable / block,
                freed_at: self.epoch,
                zeroed: true,
                decommitted: false,
            },
        );
        log_heap_growth(usable, self.heap_size);
        Ok(aligned.start..aligned.start + usable)
    }

    /// Finds room for `blocks` contiguous blocks.
    ///
    /// Black-listed blocks are skipped as long as the candidate stays within
    /// `slack` bytes of the run start. A black-listed placement is returned
    /// only when `allow_black_listed` is set and no clean one exists.
    #[must_use]
    pub fn find(
        &self,
        blocks: usize,
        black_list: &BlackList,
        slack: usize,
        allow_black_listed: bool,
    ) -> Option<Placement> {
        let block = self.geometry.block_size;
        let len = blocks * block;
        let mut fallback = None;
        for (&run_start, run) in &self.free {
            if run.blocks < blocks {
                continue;
            }
            let run_end = run_start + run.blocks * block;
            let mut candidate = run_start;
            while candidate + len <= run_end && candidate - run_start <= slack {
                match black_list.last_black_listed(candidate, len, block) {
                    None => {
                        return Some(Placement {
                            start: candidate,
                            black_listed: false,
                        })
                    }
                    Some(hit) => candidate = hit + block,
                }
            }
            if allow_black_listed && fallback.is_none() {
                fallback = Some(Placement {
                    start: run_start,
                    black_listed: true,
                });
            }
        }
        fallback
    }

    /// Removes `[start, start + blocks)` from the free pool.
    ///
    /// # Errors
    ///
    /// Fails if decommitted pages cannot be recommitted. A range that is not
    /// inside one free run is a fatal inconsistency.
    pub fn take(&mut self, start: usize, blocks: usize) -> Result<TakenBlocks, GcError> {
        let block = self.geometry.block_size;
        let (run_start, run) = self
            .free
            .range(..=start)
            .next_back()
            .map(|(&s, &r)| (s, r))
            .filter(|&(s, r)| start + blocks * block <= s + r.blocks * block)
            .unwrap_or_else(|| fatal!("blocks {start:#x}+{blocks} are not free"));

        if run.decommitted {
            self.mapping_for(start)?.recommit(start, blocks * block)?;
            self.unmapped_bytes -= blocks * block;
        }

        self.free.remove(&run_start);
        let head = (start - run_start) / block;
        if head > 0 {
            self.free.insert(run_start, FreeRun { blocks: head, ..run });
        }
        let tail = run.blocks - head - blocks;
        if tail > 0 {
            self.free
                .insert(start + blocks * block, FreeRun { blocks: tail, ..run });
        }
        self.free_bytes -= blocks * block;

        Ok(TakenBlocks {
            start,
            blocks,
            zeroed: run.zeroed || run.decommitted,
        })
    }

    /// Returns blocks to the free pool, merging with neighbours in the same
    /// chunk.
    pub fn release(&mut self, start: usize, blocks: usize) {
        self.insert_run(
            start,
            FreeRun {
                blocks,
                freed_at: self.epoch,
                zeroed: false,
                decommitted: false,
            },
        );
    }

    /// Decommits runs that have been free for at least `after` epochs.
    /// Returns the bytes decommitted by this call.
    pub fn decommit_idle(&mut self, after: u32) -> usize {
        let block = self.geometry.block_size;
        if after == 0 || block % sys_alloc::page_size() != 0 {
            return 0;
        }
        let idle: Vec<(usize, FreeRun)> = self
            .free
            .iter()
            .filter(|(_, run)| !run.decommitted && self.epoch.saturating_sub(run.freed_at) >= u64::from(after))
            .map(|(&s, &r)| (s, r))
            .collect();

        let mut total = 0;
        for (start, run) in idle {
            let len = run.blocks * block;
            let decommitted = self
                .mapping_for(start)
                .and_then(|m| m.decommit(start, len).map_err(GcError::from));
            if decommitted.is_err() {
                continue;
            }
            self.free.remove(&start);
            self.free_bytes -= len;
            self.unmapped_bytes += len;
            total += len;
            self.insert_run(
                start,
                FreeRun {
                    zeroed: true,
                    decommitted: true,
                    ..run
                },
            );
        }
        if total > 0 {
            log_decommit(total);
        }
        total
    }

    fn insert_run(&mut self, mut start: usize, mut run: FreeRun) {
        let block = self.geometry.block_size;
        self.free_bytes += run.blocks * block;
        let chunk = self.chunk_index(start);

        if let Some((&prev_start, &prev)) = self.free.range(..start).next_back() {
            let mergeable = prev_start + prev.blocks * block == start
                && prev.decommitted == run.decommitted
                && self.chunk_index(prev_start) == chunk;
            if mergeable {
                self.free.remove(&prev_start);
                start = prev_start;
                run = merge(prev, run);
            }
        }
        let end = start + run.blocks * block;
        if let Some(&next) = self.free.get(&end) {
            if next.decommitted == run.decommitted && self.chunk_index(end) == chunk {
                self.free.remove(&end);
                run = merge(run, next);
            }
        }
        self.free.insert(start, run);
    }

    fn chunk_index(&self, addr: usize) -> Option<usize> {
        let pos = self.chunks.partition_point(|c| c.start <= addr);
        pos.checked_sub(1).filter(|&i| addr < self.chunks[i].end())
    }

    fn mapping_for(&self, addr: usize) -> Result<&Mmap, GcError> {
        self.chunk_index(addr)
            .and_then(|i| self.chunks[i].mapping.as_ref())
            .ok_or_else(|| {
                GcError::Map(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{addr:#x} is not inside a heap chunk"),
                ))
            })
    }
}

impl Drop for BlockArena {
    fn drop(&mut self) {
        for chunk in &mut self.chunks {
            if let Some(mapping) = chunk.mapping.take() {
                self.source.unmap_memory(mapping);
            }
        }
    }
}

const fn merge(low: FreeRun, high: FreeRun) -> FreeRun {
    FreeRun {
        blocks: low.blocks + high.blocks,
        freed_at: if low.freed_at > high.freed_at { low.freed_at } else { high.freed_at },
        zeroed: low.zeroed && high.zeroed,
        decommitted: low.decommitted,
    }
}

const fn round_up(n: usize, align: usize) -> Option<usize> {
    match n.checked_add(align - 1) {
        Some(padded) => Some(padded & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 4096;

    fn arena(max: Option<usize>) -> BlockArena {
        BlockArena::new(
            BlockGeometry::new(BLOCK, false),
            Arc::new(SystemMemory),
            16 * BLOCK,
            64 * BLOCK,
            max,
        )
    }

    #[test]
    fn expand_adds_one_aligned_run() {
        let mut arena = arena(None);
        let added = arena.expand(1).unwrap();
        assert_eq!(added.len(), 16 * BLOCK);
        let runs: Vec<_> = arena.free_runs().collect();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0 % BLOCK, 0);
        assert_eq!(runs[0].1, 16);
        assert_eq!(arena.free_bytes(), arena.heap_size());
    }

    #[test]
    fn take_splits_and_release_coalesces() {
        let mut arena = arena(None);
        arena.expand(16 * BLOCK).unwrap();
        let (start, _) = arena.free_runs().next().unwrap();

        let taken = arena.take(start + 2 * BLOCK, 3).unwrap();
        assert!(taken.zeroed);
        assert_eq!(arena.free_runs().count(), 2);
        assert_eq!(arena.free_bytes(), 13 * BLOCK);

        arena.release(taken.start, 3);
        let runs: Vec<_> = arena.free_runs().collect();
        assert_eq!(runs, vec![(start, 16)]);

        // Coalesced runs are only as clean as their dirtiest part.
        let again = arena.take(start, 16).unwrap();
        assert!(!again.zeroed);
    }

    #[test]
    fn find_skips_black_listed_blocks() {
        let mut arena = arena(None);
        arena.expand(16 * BLOCK).unwrap();
        let (start, _) = arena.free_runs().next().unwrap();
        let black_list = BlackList::new(16, BLOCK.trailing_zeros());
        black_list.add(start + BLOCK);

        let placed = arena.find(2, &black_list, 8 * BLOCK, false).unwrap();
        assert_eq!(placed.start, start + 2 * BLOCK);
        assert!(!placed.black_listed);
    }

    #[test]
    fn find_falls_back_only_when_allowed() {
        let mut arena = arena(Some(16 * BLOCK));
        arena.expand(16 * BLOCK).unwrap();
        let (start, _) = arena.free_runs().next().unwrap();
        let black_list = BlackList::new(16, BLOCK.trailing_zeros());
        for i in 0..16 {
            black_list.add(start + i * BLOCK);
        }
        assert_eq!(arena.find(1, &black_list, 64 * BLOCK, false), None);
        let placed = arena.find(1, &black_list, 64 * BLOCK, true).unwrap();
        assert!(placed.black_listed);
    }

    #[test]
    fn heap_cap_is_enforced() {
        let mut arena = arena(Some(20 * BLOCK));
        arena.expand(1).unwrap();
        assert_eq!(arena.heap_size(), 16 * BLOCK);
        assert_eq!(arena.expand(2 * BLOCK).unwrap().len(), 4 * BLOCK);
        assert!(matches!(arena.expand(1), Err(GcError::OutOfMemory { .. })));
    }

    #[test]
    fn idle_runs_are_decommitted_and_come_back_zeroed() {
        if BLOCK % sys_alloc::page_size() != 0 {
            return;
        }
        let mut arena = arena(None);
        arena.expand(16 * BLOCK).unwrap();
        let (start, _) = arena.free_runs().next().unwrap();
        let taken = arena.take(start, 4).unwrap();
        unsafe { std::ptr::write_bytes(taken.start as *mut u8, 0xAB, 4 * BLOCK) };
        arena.release(taken.start, 4);

        arena.set_epoch(5);
        let bytes = arena.decommit_idle(3);
        assert_eq!(bytes, 16 * BLOCK);
        assert_eq!(arena.unmapped_bytes(), 16 * BLOCK);
        assert_eq!(arena.free_bytes(), arena.heap_size());

        let again = arena.take(start, 4).unwrap();
        assert!(again.zeroed);
        assert_eq!(unsafe { *(start as *const u8) }, 0);
        assert_eq!(arena.unmapped_bytes(), 12 * BLOCK);
        assert_eq!(arena.free_bytes(), 12 * BLOCK);
    }

    #[test]
    fn repeated_decommit_keeps_free_bytes_within_heap() {
        if BLOCK % sys_alloc::page_size() != 0 {
            return;
        }
        let mut arena = arena(None);
        arena.expand(16 * BLOCK).unwrap();
        for epoch in 1..=4 {
            arena.set_epoch(epoch);
            arena.decommit_idle(1);
            assert_eq!(arena.free_bytes(), arena.heap_size());
            assert!(arena.unmapped_bytes() <= arena.heap_size());
        }
    }

    #[test]
    fn huge_expansion_is_out_of_memory() {
        let mut arena = arena(None);
        assert!(matches!(
            arena.expand(usize::MAX - 100),
            Err(GcError::OutOfMemory { requested }) if requested == usize::MAX - 100
        ));
        assert_eq!(arena.heap_size(), 0);
    }
}
