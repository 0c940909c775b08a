use std::collections::HashMap;

use tracing::{debug, trace};

use crate::coherence::{EpochBump, PendingRelease};
use crate::comm::{Comm, CommOps, ReqId, WindowId};
use crate::physical_mem::PhysicalMem;
use crate::virtual_mem::reprotect_none;

const NIL: usize = usize::MAX;

/// Identity of a cached block: owning rank plus the global offset of the
/// block's first byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct BlockKey {
    pub(crate) owner: usize,
    pub(crate) block_begin: usize,
}

/// Everything the cache needs to fetch, write back, and alias one block.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockDesc {
    pub(crate) owner: usize,
    pub(crate) data_win: WindowId,
    pub(crate) epoch_win: WindowId,
    /// offset of the block within the owner's local backing store
    pub(crate) pm_offset: usize,
    /// index of the block's epoch counter in the owner's epoch window
    pub(crate) epoch_slot: usize,
    /// where the block aliases in this rank's view of the global range
    pub(crate) view_addr: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum BlockState {
    Invalid,
    Fetching,
    Valid,
    Releasing,
}

/// Every slot of the cache is pinned by an outstanding checkout; the caller
/// must let other tasks progress (they may check something in) and retry.
#[derive(Debug)]
pub(crate) struct CacheFull;

struct Entry {
    key: BlockKey,
    desc: BlockDesc,
    state: BlockState,
    refcount: usize,
    /// one bit per sub-block (block_size / 64 bytes each)
    dirty: u64,
    /// owner's epoch counter observed before the content was fetched
    epoch: u64,
    fetch_reqs: Vec<ReqId>,
    lru_prev: usize,
    lru_next: usize,
    in_lru: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub fetches: usize,
    pub evictions: usize,
    pub resident: usize,
}

/// Per-process cache of non-home blocks.
///
/// Entries live in a fixed arena, one per slab of the fd-backed pool; the
/// index and the LRU list hold arena indices. While an entry is resident its
/// slab is mapped at the block's view address, so a checked-out pointer reads
/// and writes the slab directly. Only entries with no outstanding checkout
/// (refcount 0) appear on the LRU list and are eligible for eviction.
pub(crate) struct BlockCache {
    block_size: usize,
    sub_block: usize,
    pool: PhysicalMem,
    entries: Vec<Entry>,
    index: HashMap<BlockKey, usize>,
    free: Vec<usize>,
    lru_head: usize,
    lru_tail: usize,
    hits: usize,
    misses: usize,
    fetches: usize,
    evictions: usize,
}

impl BlockCache {
    pub(crate) fn new(pool_name: &str, capacity: usize, block_size: usize) -> BlockCache {
        assert!(capacity > 0);
        assert!(block_size.is_power_of_two() && block_size >= 64);
        let pool = PhysicalMem::create(pool_name, capacity * block_size);
        let entries = (0..capacity)
            .map(|_| Entry {
                key: BlockKey {
                    owner: 0,
                    block_begin: 0,
                },
                desc: BlockDesc {
                    owner: 0,
                    data_win: WindowId::data(0),
                    epoch_win: WindowId::epoch(0),
                    pm_offset: 0,
                    epoch_slot: 0,
                    view_addr: 0,
                },
                state: BlockState::Invalid,
                refcount: 0,
                dirty: 0,
                epoch: 0,
                fetch_reqs: Vec::new(),
                lru_prev: NIL,
                lru_next: NIL,
                in_lru: false,
            })
            .collect();
        BlockCache {
            block_size,
            sub_block: block_size / 64,
            pool,
            entries,
            index: HashMap::with_capacity(capacity),
            free: (0..capacity).rev().collect(),
            lru_head: NIL,
            lru_tail: NIL,
            hits: 0,
            misses: 0,
            fetches: 0,
            evictions: 0,
        }
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            fetches: self.fetches,
            evictions: self.evictions,
            resident: self.index.len(),
        }
    }

    pub(crate) fn resident_blocks(&self) -> Vec<BlockKey> {
        self.index.keys().copied().collect()
    }

    fn lru_push_back(&mut self, idx: usize) {
        debug_assert!(!self.entries[idx].in_lru);
        self.entries[idx].lru_prev = self.lru_tail;
        self.entries[idx].lru_next = NIL;
        if self.lru_tail != NIL {
            self.entries[self.lru_tail].lru_next = idx;
        } else {
            self.lru_head = idx;
        }
        self.lru_tail = idx;
        self.entries[idx].in_lru = true;
    }

    fn lru_remove(&mut self, idx: usize) {
        debug_assert!(self.entries[idx].in_lru);
        let (prev, next) = (self.entries[idx].lru_prev, self.entries[idx].lru_next);
        if prev != NIL {
            self.entries[prev].lru_next = next;
        } else {
            self.lru_head = next;
        }
        if next != NIL {
            self.entries[next].lru_prev = prev;
        } else {
            self.lru_tail = prev;
        }
        self.entries[idx].lru_prev = NIL;
        self.entries[idx].lru_next = NIL;
        self.entries[idx].in_lru = false;
    }

    /// Pin a block, fetching it from its home if it is not resident.
    ///
    /// Concurrent pins of the same block coalesce onto one entry: only the
    /// first issues a transfer, later callers pick up the same in-flight
    /// request set via [`BlockCache::complete`]. When `fetch` is false the
    /// caller promises to overwrite the whole block, so a fresh entry is
    /// installed Valid without any transfer.
    ///
    /// Fails with [`CacheFull`] when every slot is pinned; the caller polls
    /// the scheduler and retries (a cache that can never drain is a
    /// programmer deadlock and fatal at the caller's deadline).
    pub(crate) fn try_acquire(
        &mut self,
        key: BlockKey,
        desc: BlockDesc,
        fetch: bool,
        comm: &Comm,
        pending: &mut PendingRelease,
    ) -> Result<usize, CacheFull> {
        if let Some(&idx) = self.index.get(&key) {
            self.hits += 1;
            if self.entries[idx].refcount == 0 && self.entries[idx].in_lru {
                self.lru_remove(idx);
            }
            self.entries[idx].refcount += 1;
            return Ok(idx);
        }

        self.misses += 1;
        let idx = self.alloc_slot(comm, pending).ok_or(CacheFull)?;

        // alias the slab at the block's view address
        self.pool
            .map_fixed(desc.view_addr, idx * self.block_size, self.block_size);

        let entry = &mut self.entries[idx];
        entry.key = key;
        entry.desc = desc;
        entry.refcount = 1;
        entry.dirty = 0;
        // observed before the data moves so a concurrent remote release can
        // only make the entry look older than it is
        entry.epoch = comm.atomic_load(desc.owner, desc.epoch_win, desc.epoch_slot);

        if fetch {
            let dst = unsafe {
                std::slice::from_raw_parts_mut(desc.view_addr as *mut u8, self.block_size)
            };
            let req = comm.get_nb(desc.owner, desc.data_win, desc.pm_offset, dst);
            entry.fetch_reqs.push(req);
            entry.state = BlockState::Fetching;
            self.fetches += 1;
            trace!(?key, idx, "fetching block");
        } else {
            entry.state = BlockState::Valid;
            trace!(?key, idx, "installed block without fetch");
        }

        self.index.insert(key, idx);
        Ok(idx)
    }

    fn alloc_slot(&mut self, comm: &Comm, pending: &mut PendingRelease) -> Option<usize> {
        if let Some(idx) = self.free.pop() {
            return Some(idx);
        }
        if self.evict_one(comm, pending) {
            return self.free.pop();
        }
        None
    }

    /// Wait for an entry's outstanding fetch, leaving it Valid.
    pub(crate) fn complete(&mut self, idx: usize, comm: &Comm) {
        let entry = &mut self.entries[idx];
        if entry.state == BlockState::Fetching {
            comm.wait(&entry.fetch_reqs);
            entry.fetch_reqs.clear();
            entry.state = BlockState::Valid;
        }
    }

    /// Wait for every outstanding fetch (the `checkout_complete` fence).
    pub(crate) fn complete_all(&mut self, comm: &Comm) {
        let fetching: Vec<usize> = self
            .index
            .values()
            .copied()
            .filter(|&i| self.entries[i].state == BlockState::Fetching)
            .collect();
        for idx in fetching {
            self.complete(idx, comm);
        }
    }

    /// Record modified bytes `[begin, end)` relative to the block start.
    pub(crate) fn mark_dirty(&mut self, idx: usize, begin: usize, end: usize) {
        let entry = &mut self.entries[idx];
        debug_assert!(entry.refcount > 0);
        debug_assert!(entry.state == BlockState::Valid);
        debug_assert!(begin < end && end <= self.block_size);
        let first = begin / self.sub_block;
        let last = (end - 1) / self.sub_block;
        for bit in first..=last {
            entry.dirty |= 1 << bit;
        }
    }

    /// Unpin; eviction stays deferred until the slot is needed.
    pub(crate) fn release(&mut self, idx: usize) {
        let entry = &mut self.entries[idx];
        debug_assert!(entry.refcount > 0, "release without matching acquire");
        entry.refcount -= 1;
        if entry.refcount == 0 {
            self.lru_push_back(idx);
        }
    }

    /// Write back dirty sub-ranges. Idempotent on clean entries. The epoch
    /// bump for the written block is deferred to the next release so unwritten
    /// peers are not invalidated before the writes are made visible.
    pub(crate) fn flush(&mut self, idx: usize, comm: &Comm, pending: &mut PendingRelease) {
        if self.entries[idx].dirty == 0 {
            return;
        }
        debug_assert!(self.entries[idx].state == BlockState::Valid);
        self.entries[idx].state = BlockState::Releasing;
        let desc = self.entries[idx].desc;
        let dirty = self.entries[idx].dirty;
        for (first, last) in dirty_runs(dirty) {
            let begin = first * self.sub_block;
            let end = std::cmp::min((last + 1) * self.sub_block, self.block_size);
            let src =
                unsafe { std::slice::from_raw_parts((desc.view_addr + begin) as *const u8, end - begin) };
            let req = comm.put_nb(desc.owner, desc.data_win, desc.pm_offset + begin, src);
            pending.reqs.push(req);
        }
        pending.bumps.push(EpochBump {
            owner: desc.owner,
            epoch_win: desc.epoch_win,
            epoch_slot: desc.epoch_slot,
        });
        self.entries[idx].dirty = 0;
        self.entries[idx].state = BlockState::Valid;
        trace!(key = ?self.entries[idx].key, idx, "flushed dirty block");
    }

    /// Flush every dirty resident entry.
    pub(crate) fn flush_dirty(&mut self, comm: &Comm, pending: &mut PendingRelease) {
        let dirty: Vec<usize> = self
            .index
            .values()
            .copied()
            .filter(|&i| self.entries[i].dirty != 0)
            .collect();
        for idx in dirty {
            self.flush(idx, comm, pending);
        }
    }

    fn invalidate(&mut self, idx: usize) {
        let entry = &self.entries[idx];
        debug_assert!(entry.refcount == 0);
        debug_assert!(entry.dirty == 0);
        debug_assert!(entry.state == BlockState::Valid);
        if entry.in_lru {
            self.lru_remove(idx);
        }
        let key = self.entries[idx].key;
        // put the reservation back so nothing faults through the stale alias
        reprotect_none(self.entries[idx].desc.view_addr, self.block_size);
        self.index.remove(&key);
        self.entries[idx].state = BlockState::Invalid;
        self.free.push(idx);
        trace!(?key, idx, "invalidated block");
    }

    /// Evict the least-recently-used unpinned entry, flushing it first if
    /// dirty. Returns false when nothing is evictable.
    pub(crate) fn evict_one(&mut self, comm: &Comm, pending: &mut PendingRelease) -> bool {
        let idx = self.lru_head;
        if idx == NIL {
            return false;
        }
        self.flush(idx, comm, pending);
        self.invalidate(idx);
        self.evictions += 1;
        true
    }

    /// Demote Valid entries whose content predates the owner's current epoch.
    /// Pinned entries are skipped: no release point can sit between a checkout
    /// and its check-in. Dirty entries are skipped too: their writes are this
    /// rank's own and have not been released yet, so by the single-writer
    /// contract nothing newer can exist remotely.
    pub(crate) fn invalidate_stale(&mut self, comm: &Comm) {
        let resident: Vec<usize> = self.index.values().copied().collect();
        let mut dropped = 0;
        for idx in resident {
            let entry = &self.entries[idx];
            if entry.state != BlockState::Valid || entry.refcount > 0 || entry.dirty != 0 {
                continue;
            }
            let desc = entry.desc;
            let current = comm.atomic_load(desc.owner, desc.epoch_win, desc.epoch_slot);
            if entry.epoch < current {
                self.invalidate(idx);
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(dropped, "acquire invalidated stale blocks");
        }
    }

    /// Drop every entry belonging to `alloc_id`; dirty content is discarded
    /// because the allocation is going away. Outstanding pins are a leaked
    /// checkout and fatal.
    pub(crate) fn drop_allocation(&mut self, alloc_id: usize, comm: &Comm) {
        let resident: Vec<usize> = self
            .index
            .values()
            .copied()
            .filter(|&i| self.entries[i].desc.data_win.alloc_id == alloc_id)
            .collect();
        for idx in resident {
            assert!(
                self.entries[idx].refcount == 0,
                "allocation freed with an outstanding checkout"
            );
            self.complete(idx, comm);
            self.entries[idx].dirty = 0;
            self.invalidate(idx);
        }
    }
}

/// Decompose a dirty mask into runs of consecutive set bits.
fn dirty_runs(mut mask: u64) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    while mask != 0 {
        let first = mask.trailing_zeros() as usize;
        let rest = mask >> first;
        let len = rest.trailing_ones() as usize;
        runs.push((first, first + len - 1));
        if first + len == 64 {
            break;
        }
        mask &= !(((1u64 << len) - 1) << first);
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_run_extraction() {
        assert_eq!(dirty_runs(0), vec![]);
        assert_eq!(dirty_runs(0b1), vec![(0, 0)]);
        assert_eq!(dirty_runs(0b0110), vec![(1, 2)]);
        assert_eq!(dirty_runs(0b1011_0001), vec![(0, 0), (4, 5), (7, 7)]);
        assert_eq!(dirty_runs(u64::MAX), vec![(0, 63)]);
        assert_eq!(dirty_runs(1u64 << 63), vec![(63, 63)]);
        assert_eq!(dirty_runs((1u64 << 63) | 1), vec![(0, 0), (63, 63)]);
    }
}
