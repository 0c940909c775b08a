use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexSet;

use crate::home::HomeMap;
use crate::mem_mapper::MemMapper;
use crate::physical_mem::PhysicalMem;

/// Best-fit free-list allocator over the reserved global range.
///
/// Allocation is collective: every rank issues the identical sequence of
/// allocator calls, and because the data structures evolve deterministically,
/// every rank computes the same offset without any exchange. Sizes and bases
/// are kept in twin maps (size -> bases, base -> size) so best-fit lookup and
/// neighbour coalescing are both range queries.
#[derive(Debug)]
pub(crate) struct HeapAlloc {
    free_sizes: BTreeMap<usize, IndexSet<usize>>,
    free_addrs: BTreeMap<usize, usize>,
    allocated: BTreeMap<usize, usize>,
    start: usize,
    max_size: usize,
}

impl HeapAlloc {
    pub(crate) fn new(start: usize, size: usize) -> HeapAlloc {
        let mut free_sizes = BTreeMap::new();
        let mut bases = IndexSet::new();
        bases.insert(start);
        free_sizes.insert(size, bases);
        let mut free_addrs = BTreeMap::new();
        free_addrs.insert(start, size);
        HeapAlloc {
            free_sizes,
            free_addrs,
            allocated: BTreeMap::new(),
            start,
            max_size: size,
        }
    }

    pub(crate) fn occupied(&self) -> usize {
        self.allocated.values().sum()
    }

    pub(crate) fn try_malloc(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size > 0);
        // smallest free range that fits
        let (&fsize, bases) = self.free_sizes.range_mut(size..).next()?;
        let addr = bases.pop().expect("size map entry with no bases");
        if bases.is_empty() {
            self.free_sizes.remove(&fsize);
        }
        self.free_addrs.remove(&addr);
        if fsize != size {
            let rem_addr = addr + size;
            let rem_size = fsize - size;
            self.free_sizes
                .entry(rem_size)
                .or_insert_with(IndexSet::new)
                .insert(rem_addr);
            self.free_addrs.insert(rem_addr, rem_size);
        }
        self.allocated.insert(addr, size);
        Some(addr)
    }

    pub(crate) fn free(&mut self, addr: usize) -> usize {
        let size = match self.allocated.remove(&addr) {
            Some(size) => size,
            None => panic!("illegal free, offset {:#x} is not allocated", addr),
        };

        let mut merged_addr = addr;
        let mut merged_size = size;

        // absorb the free neighbour below
        if let Some((&prev_addr, &prev_size)) = self.free_addrs.range(..addr).next_back() {
            if prev_addr + prev_size == addr {
                self.remove_free(prev_addr, prev_size);
                merged_addr = prev_addr;
                merged_size += prev_size;
            }
        }
        // and above
        if let Some((&next_addr, &next_size)) = self.free_addrs.range(addr..).next() {
            if merged_addr + merged_size == next_addr {
                self.remove_free(next_addr, next_size);
                merged_size += next_size;
            }
        }

        self.free_addrs.insert(merged_addr, merged_size);
        self.free_sizes
            .entry(merged_size)
            .or_insert_with(IndexSet::new)
            .insert(merged_addr);
        debug_assert!(merged_addr + merged_size <= self.start + self.max_size);
        size
    }

    fn remove_free(&mut self, addr: usize, size: usize) {
        self.free_addrs.remove(&addr);
        let empty = {
            let bases = self
                .free_sizes
                .get_mut(&size)
                .expect("free range missing from size map");
            bases.shift_remove(&addr);
            bases.is_empty()
        };
        if empty {
            self.free_sizes.remove(&size);
        }
    }
}

/// One collective allocation: its place in the heap, its mapper, this rank's
/// windows, and the home mappings attached into this rank's view.
pub(crate) struct Allocation {
    pub(crate) id: usize,
    pub(crate) base_offset: usize,
    pub(crate) mapper: MemMapper,
    // this rank's window segments, kept alive for the allocation's lifetime
    pub(crate) _data_seg: Arc<PhysicalMem>,
    pub(crate) _epoch_seg: Arc<PhysicalMem>,
    pub(crate) home: HomeMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_fit_and_coalesce() {
        let mut alloc = HeapAlloc::new(0, 1000);
        assert_eq!(alloc.try_malloc(50), Some(0));
        assert_eq!(alloc.try_malloc(10), Some(50));
        assert_eq!(alloc.try_malloc(600), Some(60));
        assert_eq!(alloc.try_malloc(10), Some(660));
        assert_eq!(alloc.occupied(), 670);

        alloc.free(0);
        assert_eq!(alloc.try_malloc(30), Some(0));
        alloc.free(50);
        // the freed [30,50) and [50,60) ranges coalesce
        assert_eq!(alloc.try_malloc(10), Some(30));
        assert_eq!(alloc.try_malloc(10), Some(40));

        alloc.free(660);
        alloc.free(30);
        alloc.free(40);
        alloc.free(60);
        alloc.free(0);
        // everything coalesced back into one range
        assert_eq!(alloc.occupied(), 0);
        assert_eq!(alloc.try_malloc(1000), Some(0));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut alloc = HeapAlloc::new(0, 100);
        assert_eq!(alloc.try_malloc(60), Some(0));
        assert_eq!(alloc.try_malloc(60), None);
        assert_eq!(alloc.try_malloc(40), Some(60));
        assert_eq!(alloc.try_malloc(1), None);
    }

    #[test]
    fn identical_call_sequences_agree() {
        // the collective contract: same ops in, same offsets out
        let run = || {
            let mut alloc = HeapAlloc::new(4096, 1 << 20);
            let a = alloc.try_malloc(1 << 16).unwrap();
            let b = alloc.try_malloc(1 << 12).unwrap();
            alloc.free(a);
            let c = alloc.try_malloc(1 << 14).unwrap();
            (a, b, c)
        };
        assert_eq!(run(), run());
    }

    #[test]
    #[should_panic(expected = "illegal free")]
    fn freeing_unallocated_offset_panics() {
        let mut alloc = HeapAlloc::new(0, 100);
        alloc.free(12);
    }
}
