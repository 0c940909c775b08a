use tracing::trace;

use crate::comm::{Comm, CommOps, WindowId};
use crate::mem_mapper::{MapperPolicy, MemMapper, NumaSegment};
use crate::numa;
use crate::topology::Topology;
use crate::virtual_mem::reprotect_none;

/// The home mappings of one allocation in this rank's view.
///
/// Every block owned by a co-located rank (this rank included) is aliased at
/// its view address directly from the owner's backing store, so loads and
/// stores there touch the home copy and never enter the cache. Blocks owned
/// by other nodes stay unmapped until the cache attaches them.
pub(crate) struct HomeMap {
    regions: Vec<(usize, usize)>,
}

impl HomeMap {
    /// Walk the allocation segment by segment and attach every co-located
    /// share. Contiguous policies produce one mapping per share; the cyclic
    /// policy produces one per stripe.
    pub(crate) fn attach(
        comm: &Comm,
        topo: &Topology,
        mapper: &MemMapper,
        data_win: WindowId,
        alloc_view_base: usize,
        numa_enabled: bool,
    ) -> HomeMap {
        let mut regions = Vec::new();
        let mut n_attached = 0;
        let mut offset = 0;
        let effective = mapper.effective_size();
        while offset < effective {
            let seg = mapper.get_segment(offset);
            let len = seg.offset_end - seg.offset_begin;
            if topo.is_locally_accessible(seg.owner) {
                let addr = alloc_view_base + seg.offset_begin;
                let phys = comm.window_phys(seg.owner, data_win);
                phys.map_fixed(addr, seg.pm_offset, len);
                regions.push((addr, len));
                n_attached += 1;
            }
            offset = seg.offset_end;
        }
        trace!(
            segments = n_attached,
            contiguous = mapper.should_map_all_home(),
            "attached home mappings"
        );

        let home = HomeMap { regions };
        if numa_enabled && topo.intra_n_ranks() > 1 {
            home.apply_numa(topo, mapper, alloc_view_base);
        }
        home
    }

    /// Place this rank's own share according to the NUMA sub-mapping. The
    /// sub-owner indices from the mapper stand in for node ids; discovery of
    /// the real node topology is the embedder's concern.
    fn apply_numa(&self, topo: &Topology, mapper: &MemMapper, alloc_view_base: usize) {
        let me = topo.my_rank();
        let local_size = mapper.local_size(me);
        let n_nodes = topo.intra_n_ranks();

        let mut offset = 0;
        let effective = mapper.effective_size();
        while offset < effective {
            let seg = mapper.get_segment(offset);
            offset = seg.offset_end;
            if seg.owner != me {
                continue;
            }
            let seg_len = seg.offset_end - seg.offset_begin;
            let seg_view = alloc_view_base + seg.offset_begin;

            // intersect the segment's physical range with the sub-mapping
            let mut pm = seg.pm_offset;
            let pm_end = seg.pm_offset + seg_len;
            while pm < pm_end {
                debug_assert!(pm < local_size);
                let ns = mapper.get_numa_segment(me, pm);
                let begin = std::cmp::max(pm, ns.pm_offset_begin);
                let end = std::cmp::min(pm_end, ns.pm_offset_end);
                let addr = seg_view + (begin - seg.pm_offset);
                if ns.node == NumaSegment::INTERLEAVE_ALL {
                    numa::interleave(addr, end - begin, n_nodes);
                } else {
                    numa::bind(addr, end - begin, ns.node as usize);
                }
                pm = end;
            }
        }
    }

    /// Detach every home mapping, leaving the view range reserved so the
    /// heap can hand it to a later allocation.
    pub(crate) fn detach(&mut self) {
        for (addr, len) in self.regions.drain(..) {
            reprotect_none(addr, len);
        }
    }
}
