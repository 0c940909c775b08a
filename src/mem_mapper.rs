use enum_dispatch::enum_dispatch;

use crate::env_var::MapperKind;

/// A contiguous run of blocks with a single owner, as returned by
/// [`MapperPolicy::get_segment`].
///
/// `pm_offset` is the offset of the segment from the beginning of the owner's
/// local physical backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub owner: usize,
    pub offset_begin: usize,
    pub offset_end: usize,
    pub pm_offset: usize,
}

/// A range of an owner's physical memory bound to one NUMA node.
///
/// `node` is the intra-node sub-owner index, or [`NumaSegment::INTERLEAVE_ALL`]
/// to interleave the range across every node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NumaSegment {
    pub node: isize,
    pub pm_offset_begin: usize,
    pub pm_offset_end: usize,
}

impl NumaSegment {
    pub const INTERLEAVE_ALL: isize = -1;
}

/// A pure mapping from global offsets to owners and physical offsets.
///
/// One mapper instance exists per allocation; the policy is chosen when the
/// allocation is created and dispatch happens once per lookup on a plain enum.
#[enum_dispatch]
pub trait MapperPolicy {
    fn block_size(&self) -> usize;

    /// Size of `rank`'s share of the physical backing store. Never zero: an
    /// empty share is rounded up to one block.
    fn local_size(&self, rank: usize) -> usize;

    /// Total mapped size, `size` rounded up to whole blocks (and for the
    /// cyclic policy to a whole round of segments).
    fn effective_size(&self) -> usize;

    /// The segment containing `offset`. Requires `offset < effective_size()`.
    fn get_segment(&self, offset: usize) -> Segment;

    /// The NUMA sub-segment containing physical offset `pm_offset` of `rank`'s
    /// share. Requires `pm_offset < local_size(rank)`.
    fn get_numa_segment(&self, rank: usize, pm_offset: usize) -> NumaSegment;

    /// True iff every rank's share occupies one contiguous global range, in
    /// which case home mapping attaches it with a single fixed mapping rather
    /// than per-segment stripes.
    fn should_map_all_home(&self) -> bool;
}

#[enum_dispatch(MapperPolicy)]
#[derive(Debug)]
pub enum MemMapper {
    Block(BlockMapper),
    Cyclic(CyclicMapper),
    ReverseBlock(ReverseBlockMapper),
}

impl MemMapper {
    pub fn new(
        kind: MapperKind,
        size: usize,
        n_ranks: usize,
        n_intra_ranks: usize,
        block_size: usize,
        cyclic_seg_size: Option<usize>,
    ) -> MemMapper {
        match kind {
            MapperKind::Block => {
                BlockMapper::new(size, n_ranks, n_intra_ranks, block_size).into()
            }
            MapperKind::Cyclic => CyclicMapper::new(
                size,
                n_ranks,
                n_intra_ranks,
                block_size,
                cyclic_seg_size.unwrap_or(block_size),
            )
            .into(),
            MapperKind::ReverseBlock => {
                ReverseBlockMapper::new(size, n_ranks, n_intra_ranks, block_size).into()
            }
        }
    }
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Contiguous even partition: block `b` of `n_blocks` belongs to rank
/// `b * n_ranks / n_blocks`.
#[derive(Debug)]
pub struct BlockMapper {
    n_ranks: usize,
    n_intra_ranks: usize,
    block_size: usize,
    n_blocks: usize,
}

impl BlockMapper {
    pub fn new(size: usize, n_ranks: usize, n_intra_ranks: usize, block_size: usize) -> Self {
        assert!(block_size.is_power_of_two());
        BlockMapper {
            n_ranks,
            n_intra_ranks,
            block_size,
            n_blocks: div_ceil(size, block_size),
        }
    }

    fn rank_range(&self, rank: usize) -> (usize, usize) {
        let begin = div_ceil(rank * self.n_blocks, self.n_ranks);
        let end = div_ceil((rank + 1) * self.n_blocks, self.n_ranks);
        (begin, end)
    }
}

impl MapperPolicy for BlockMapper {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn local_size(&self, rank: usize) -> usize {
        let (begin, end) = self.rank_range(rank);
        std::cmp::max(1, end - begin) * self.block_size
    }

    fn effective_size(&self) -> usize {
        self.n_blocks * self.block_size
    }

    fn get_segment(&self, offset: usize) -> Segment {
        debug_assert!(offset < self.effective_size());

        let blk_id = offset / self.block_size;
        let owner = blk_id * self.n_ranks / self.n_blocks;

        let (begin, end) = self.rank_range(owner);
        debug_assert!(begin <= blk_id && blk_id < end);

        Segment {
            owner,
            offset_begin: begin * self.block_size,
            offset_end: end * self.block_size,
            pm_offset: 0,
        }
    }

    fn get_numa_segment(&self, rank: usize, pm_offset: usize) -> NumaSegment {
        debug_assert!(pm_offset < self.local_size(rank));

        // the same even partition, applied over the rank's own blocks
        let n_local_blocks = div_ceil(self.local_size(rank), self.block_size);
        let blk_id = pm_offset / self.block_size;
        let node = blk_id * self.n_intra_ranks / n_local_blocks;

        let begin = div_ceil(node * n_local_blocks, self.n_intra_ranks);
        let end = div_ceil((node + 1) * n_local_blocks, self.n_intra_ranks);
        debug_assert!(begin <= blk_id && blk_id < end);

        NumaSegment {
            node: node as isize,
            pm_offset_begin: begin * self.block_size,
            pm_offset_end: end * self.block_size,
        }
    }

    fn should_map_all_home(&self) -> bool {
        true
    }
}

/// Round-robin interleave: global segment `g` (of `seg_size` bytes) belongs to
/// rank `g % n_ranks` at local segment `g / n_ranks`.
#[derive(Debug)]
pub struct CyclicMapper {
    size: usize,
    n_ranks: usize,
    block_size: usize,
    seg_size: usize,
}

impl CyclicMapper {
    pub fn new(
        size: usize,
        n_ranks: usize,
        _n_intra_ranks: usize,
        block_size: usize,
        seg_size: usize,
    ) -> Self {
        assert!(block_size.is_power_of_two());
        assert!(seg_size >= block_size);
        assert!(seg_size % block_size == 0);
        CyclicMapper {
            size,
            n_ranks,
            block_size,
            seg_size,
        }
    }

    fn local_size_impl(&self) -> usize {
        let n_segs_global = div_ceil(self.size, self.seg_size);
        let n_segs_local = div_ceil(n_segs_global, self.n_ranks);
        n_segs_local * self.seg_size
    }
}

impl MapperPolicy for CyclicMapper {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn local_size(&self, _rank: usize) -> usize {
        self.local_size_impl()
    }

    fn effective_size(&self) -> usize {
        self.local_size_impl() * self.n_ranks
    }

    fn get_segment(&self, offset: usize) -> Segment {
        debug_assert!(offset < self.effective_size());
        let seg_global = offset / self.seg_size;
        let seg_local = seg_global / self.n_ranks;
        Segment {
            owner: seg_global % self.n_ranks,
            offset_begin: seg_global * self.seg_size,
            offset_end: (seg_global + 1) * self.seg_size,
            pm_offset: seg_local * self.seg_size,
        }
    }

    fn get_numa_segment(&self, rank: usize, _pm_offset: usize) -> NumaSegment {
        // stripes are too fine to place individually
        NumaSegment {
            node: NumaSegment::INTERLEAVE_ALL,
            pm_offset_begin: 0,
            pm_offset_end: self.local_size(rank),
        }
    }

    fn should_map_all_home(&self) -> bool {
        false
    }
}

/// Block partition with the owner order reflected (`n_ranks - r - 1`), so a
/// scheduler that drains work from the highest rank walks home data
/// sequentially.
#[derive(Debug)]
pub struct ReverseBlockMapper {
    n_ranks: usize,
    n_intra_ranks: usize,
    block_size: usize,
    n_blocks: usize,
}

impl ReverseBlockMapper {
    pub fn new(size: usize, n_ranks: usize, n_intra_ranks: usize, block_size: usize) -> Self {
        assert!(block_size.is_power_of_two());
        ReverseBlockMapper {
            n_ranks,
            n_intra_ranks,
            block_size,
            n_blocks: div_ceil(size, block_size),
        }
    }

    fn seg_range(&self, seg_id: usize) -> (usize, usize) {
        let begin = seg_id * self.n_blocks / self.n_ranks;
        let end = (seg_id + 1) * self.n_blocks / self.n_ranks;
        (begin, end)
    }
}

impl MapperPolicy for ReverseBlockMapper {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn local_size(&self, rank: usize) -> usize {
        let seg_id = self.n_ranks - rank - 1;
        let (begin, end) = self.seg_range(seg_id);
        std::cmp::max(1, end - begin) * self.block_size
    }

    fn effective_size(&self) -> usize {
        self.n_blocks * self.block_size
    }

    fn get_segment(&self, offset: usize) -> Segment {
        debug_assert!(offset < self.effective_size());

        let blk_id = offset / self.block_size;
        let seg_id = div_ceil((blk_id + 1) * self.n_ranks, self.n_blocks) - 1;

        let (begin, end) = self.seg_range(seg_id);
        debug_assert!(begin <= blk_id && blk_id < end);

        Segment {
            owner: self.n_ranks - seg_id - 1,
            offset_begin: begin * self.block_size,
            offset_end: end * self.block_size,
            pm_offset: 0,
        }
    }

    fn get_numa_segment(&self, rank: usize, pm_offset: usize) -> NumaSegment {
        debug_assert!(pm_offset < self.local_size(rank));

        let n_local_blocks = div_ceil(self.local_size(rank), self.block_size);
        let blk_id = pm_offset / self.block_size;
        let seg_id = div_ceil((blk_id + 1) * self.n_intra_ranks, n_local_blocks) - 1;

        let begin = seg_id * n_local_blocks / self.n_intra_ranks;
        let end = (seg_id + 1) * n_local_blocks / self.n_intra_ranks;
        debug_assert!(begin <= blk_id && blk_id < end);

        NumaSegment {
            node: (self.n_intra_ranks - seg_id - 1) as isize,
            pm_offset_begin: begin * self.block_size,
            pm_offset_end: end * self.block_size,
        }
    }

    fn should_map_all_home(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: usize = 65536;

    fn block(size: usize, n_ranks: usize) -> BlockMapper {
        BlockMapper::new(size, n_ranks, 1, BS)
    }

    fn cyclic(size: usize, n_ranks: usize, seg_size: usize) -> CyclicMapper {
        CyclicMapper::new(size, n_ranks, 1, BS, seg_size)
    }

    fn seg(owner: usize, b: usize, e: usize, pm: usize) -> Segment {
        Segment {
            owner,
            offset_begin: b,
            offset_end: e,
            pm_offset: pm,
        }
    }

    #[test]
    fn block_local_sizes() {
        assert_eq!(block(BS * 4, 4).local_size(0), BS);
        assert_eq!(block(BS * 12, 4).local_size(0), BS * 3);
        assert_eq!(block(BS * 14, 4).local_size(0), BS * 4);
        assert_eq!(block(BS * 14, 4).local_size(1), BS * 3);
        assert_eq!(block(BS * 14, 4).local_size(2), BS * 4);
        assert_eq!(block(BS * 14, 4).local_size(3), BS * 3);
        // an empty share still gets one block
        assert_eq!(block(1, 4).local_size(0), BS);
        assert_eq!(block(1, 4).local_size(1), BS);
        assert_eq!(block(1, 1).local_size(0), BS);
        assert_eq!(block(BS * 3, 1).local_size(0), BS * 3);
    }

    #[test]
    fn block_segments() {
        assert_eq!(block(BS * 4, 4).get_segment(0), seg(0, 0, BS, 0));
        assert_eq!(block(BS * 4, 4).get_segment(BS), seg(1, BS, BS * 2, 0));
        assert_eq!(block(BS * 4, 4).get_segment(BS * 2), seg(2, BS * 2, BS * 3, 0));
        assert_eq!(block(BS * 4, 4).get_segment(BS * 3), seg(3, BS * 3, BS * 4, 0));
        assert_eq!(block(BS * 4, 4).get_segment(BS * 4 - 1), seg(3, BS * 3, BS * 4, 0));
        assert_eq!(block(BS * 14, 4).get_segment(0), seg(0, 0, BS * 4, 0));
        assert_eq!(block(BS * 14, 4).get_segment(BS), seg(0, 0, BS * 4, 0));
        assert_eq!(block(BS * 14, 4).get_segment(BS * 5), seg(1, BS * 4, BS * 7, 0));
        assert_eq!(
            block(BS * 14 - 1, 4).get_segment(BS * 14 - 1),
            seg(3, BS * 11, BS * 14, 0)
        );
    }

    #[test]
    fn cyclic_local_sizes() {
        let ss = BS * 2;
        assert_eq!(cyclic(ss * 4, 4, ss).local_size(0), ss);
        assert_eq!(cyclic(ss * 12, 4, ss).local_size(0), ss * 3);
        assert_eq!(cyclic(ss * 13, 4, ss).local_size(0), ss * 4);
        assert_eq!(cyclic(ss * 12 + 1, 4, ss).local_size(0), ss * 4);
        assert_eq!(cyclic(ss * 12 - 1, 4, ss).local_size(0), ss * 3);
        assert_eq!(cyclic(1, 4, ss).local_size(0), ss);
        assert_eq!(cyclic(1, 1, ss).local_size(0), ss);
        assert_eq!(cyclic(ss * 3, 1, ss).local_size(0), ss * 3);
    }

    #[test]
    fn cyclic_segments() {
        let ss = BS * 2;
        assert_eq!(cyclic(ss * 4, 4, ss).get_segment(0), seg(0, 0, ss, 0));
        assert_eq!(cyclic(ss * 4, 4, ss).get_segment(ss), seg(1, ss, ss * 2, 0));
        assert_eq!(cyclic(ss * 4, 4, ss).get_segment(ss * 4 - 1), seg(3, ss * 3, ss * 4, 0));
        assert_eq!(cyclic(ss * 12, 4, ss).get_segment(ss * 3), seg(3, ss * 3, ss * 4, 0));
        assert_eq!(
            cyclic(ss * 12, 4, ss).get_segment(ss * 5 + 2),
            seg(1, ss * 5, ss * 6, ss)
        );
        assert_eq!(
            cyclic(ss * 12 - 1, 4, ss).get_segment(ss * 11),
            seg(3, ss * 11, ss * 12, ss * 2)
        );
    }

    #[test]
    fn reverse_block_reflects_owners() {
        let m = ReverseBlockMapper::new(BS * 14, 4, 1, BS);
        // shares mirror the block policy: high ranks own the low offsets
        assert_eq!(m.get_segment(0).owner, 3);
        assert_eq!(m.get_segment(BS * 14 - 1).owner, 0);
        let total: usize = (0..4).map(|r| m.local_size(r)).sum();
        assert_eq!(total, BS * 14);
    }

    #[test]
    fn segment_invariant_holds_everywhere() {
        for (size, n_ranks) in [
            (BS * 14, 4),
            (BS * 5 + 17, 3),
            (BS * 64, 5),
            (1, 7),
            (BS * 7 - 1, 2),
        ] {
            for mapper in [
                MemMapper::new(MapperKind::Block, size, n_ranks, 1, BS, None),
                MemMapper::new(MapperKind::ReverseBlock, size, n_ranks, 1, BS, None),
                MemMapper::new(MapperKind::Cyclic, size, n_ranks, 1, BS, Some(BS * 2)),
            ] {
                let eff = mapper.effective_size();
                let mut offset = 0;
                while offset < eff {
                    let s = mapper.get_segment(offset);
                    assert!(s.offset_begin <= offset && offset < s.offset_end);
                    assert_eq!((s.offset_end - s.offset_begin) % BS, 0);
                    assert!(s.owner < n_ranks);
                    // probing anywhere inside the segment returns it unchanged
                    assert_eq!(mapper.get_segment(s.offset_end - 1), s);
                    offset = s.offset_end;
                }
            }
        }
    }

    #[test]
    fn block_partition_covers_disjointly() {
        for (size, n_ranks) in [(BS * 14, 4), (BS * 9 + 5, 3), (BS * 2, 8)] {
            let m = block(size, n_ranks);
            let mut covered = 0;
            let mut prev_owner = 0;
            let mut offset = 0;
            while offset < m.effective_size() {
                let s = m.get_segment(offset);
                assert_eq!(s.offset_begin, covered);
                assert!(s.owner >= prev_owner);
                prev_owner = s.owner;
                covered = s.offset_end;
                offset = s.offset_end;
            }
            assert_eq!(covered, m.effective_size());
        }
    }

    #[test]
    fn numa_subsegments_partition_local_share() {
        let m = BlockMapper::new(BS * 16, 2, 4, BS);
        let local = m.local_size(0);
        let mut pm = 0;
        let mut prev_node = -1;
        while pm < local {
            let ns = m.get_numa_segment(0, pm);
            assert!(ns.pm_offset_begin <= pm && pm < ns.pm_offset_end);
            assert!(ns.node > prev_node);
            prev_node = ns.node;
            pm = ns.pm_offset_end;
        }
        assert_eq!(pm, local);

        let c = cyclic(BS * 16, 2, BS);
        let ns = c.get_numa_segment(0, 0);
        assert_eq!(ns.node, NumaSegment::INTERLEAVE_ALL);
        assert_eq!(ns.pm_offset_end, c.local_size(0));
    }
}
