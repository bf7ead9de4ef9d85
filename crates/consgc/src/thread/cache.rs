//! Per-thread allocation cache for the cached kinds (normal and atomic).

use crate::heap::{FreeList, ObjectKind};

/// Free lists owned by one thread, indexed by cached kind and size in
/// granules.
///
/// Objects in a cache are unmarked and invisible to the collector's global
/// lists. Every collection discards all caches before sweeping, which hands
/// their objects back to the global lists through the sweep.
#[derive(Debug)]
pub struct AllocCache {
    lists: [Vec<FreeList>; 2],
}

impl AllocCache {
    #[must_use]
    pub fn new(max_small_granules: usize) -> Self {
        Self {
            lists: [
                vec![FreeList::EMPTY; max_small_granules + 1],
                vec![FreeList::EMPTY; max_small_granules + 1],
            ],
        }
    }

    /// Takes one object of `granules` granules, with its link word cleared.
    #[inline]
    pub fn pop(&mut self, kind: ObjectKind, granules: usize) -> Option<usize> {
        debug_assert!(kind.is_cached());
        // SAFETY: cache lists only receive free objects carved or swept by
        // the collector, and nobody else links through them.
        unsafe { self.lists[kind.index()][granules].pop() }
    }

    /// Replaces the (empty) list for `kind` and `granules`.
    pub fn install(&mut self, kind: ObjectKind, granules: usize, list: FreeList) {
        let slot = &mut self.lists[kind.index()][granules];
        debug_assert!(slot.is_empty());
        *slot = list;
    }

    /// Forgets every cached object. Returns how many there were.
    pub fn discard(&mut self) -> usize {
        let mut dropped = 0;
        for list in self.lists.iter_mut().flatten() {
            dropped += list.len();
            *list = FreeList::EMPTY;
        }
        dropped
    }

    /// Non-empty lists with their kind and size.
    pub fn lists(&self) -> impl Iterator<Item = (ObjectKind, usize, &FreeList)> + '_ {
        [ObjectKind::NORMAL, ObjectKind::ATOMIC]
            .into_iter()
            .zip(&self.lists)
            .flat_map(|(kind, per_size)| {
                per_size
                    .iter()
                    .enumerate()
                    .filter(|(_, list)| !list.is_empty())
                    .map(move |(granules, list)| (kind, granules, list))
            })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lists.iter().flatten().all(FreeList::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::allocator::carve_block;
    use crate::heap::BlockGeometry;

    #[test]
    fn pop_install_discard() {
        let geometry = BlockGeometry::new(1024, false);
        let mut block = vec![0u8; 2 * 1024];
        let start = (block.as_mut_ptr() as usize + 1023) & !1023;

        let mut cache = AllocCache::new(geometry.max_small_granules);
        assert!(cache.is_empty());
        assert_eq!(cache.pop(ObjectKind::NORMAL, 4), None);

        let list = unsafe { carve_block(start, 4, &geometry, true) };
        cache.install(ObjectKind::NORMAL, 4, list);
        assert_eq!(cache.pop(ObjectKind::NORMAL, 4), Some(start));
        assert_eq!(cache.lists().count(), 1);
        assert_eq!(cache.discard(), geometry.objects_per_block(4) - 1);
        assert!(cache.is_empty());
    }
}
