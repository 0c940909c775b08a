use std::io::Error as OsError;

use tracing::trace;

#[derive(Debug)]
pub(crate) enum VmemError {
    /// A fixed-address mapping request overlapped an existing mapping.
    Collision,
    Os {
        call: &'static str,
        errno: i32,
    },
}

impl std::fmt::Display for VmemError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            VmemError::Collision => {
                write!(f, "requested virtual address range is already mapped")
            }
            VmemError::Os { call, errno } => {
                write!(f, "{} failed: {}", call, OsError::from_raw_os_error(*errno))
            }
        }
    }
}

impl std::error::Error for VmemError {}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

pub(crate) fn round_up(v: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}

fn os_munmap(addr: usize, size: usize) {
    debug_assert!(size > 0);
    debug_assert!(addr % page_size() == 0);
    if unsafe { libc::munmap(addr as *mut libc::c_void, size) } == -1 {
        panic!(
            "munmap({:#x}, {}) failed: {}",
            addr,
            size,
            OsError::last_os_error()
        );
    }
}

/// An address-range reservation backed by no physical memory.
///
/// The range is mapped `PROT_NONE`; physical pages are attached later by the
/// home mapper and the block cache with fixed-address shared mappings.
#[derive(Debug)]
pub(crate) struct Mmap {
    addr: usize,
    size: usize,
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    /// Reserve `size` bytes anywhere, with the base aligned to `align`.
    pub(crate) fn reserve(size: usize, align: usize) -> Mmap {
        debug_assert!(size > 0);
        let pagesize = page_size();
        let align = std::cmp::max(align, pagesize);

        // over-allocate so an aligned base can be carved out, then trim
        let alloc_size = round_up(size, pagesize) + align;
        let p = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                alloc_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            panic!(
                "mmap(anywhere, {}) failed: {}",
                alloc_size,
                OsError::last_os_error()
            );
        }

        let raw = p as usize;
        let base = round_up(raw, align);
        if base > raw {
            os_munmap(raw, base - raw);
        }
        let end = raw + alloc_size;
        let keep_end = base + round_up(size, pagesize);
        if end > keep_end {
            os_munmap(keep_end, end - keep_end);
        }
        trace!(addr = base, size, "reserved virtual range");
        Mmap { addr: base, size }
    }

    /// Try to reserve `size` bytes exactly at `addr` without replacing any
    /// existing mapping.
    pub(crate) fn reserve_at(addr: usize, size: usize) -> Result<Mmap, VmemError> {
        debug_assert!(size > 0);
        debug_assert!(addr % page_size() == 0);
        let p = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            let errno = OsError::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EEXIST {
                return Err(VmemError::Collision);
            }
            return Err(VmemError::Os { call: "mmap", errno });
        }
        // kernels without MAP_FIXED_NOREPLACE support fall back to a hint
        if p as usize != addr {
            os_munmap(p as usize, size);
            return Err(VmemError::Collision);
        }
        Ok(Mmap { addr, size })
    }

    pub(crate) fn addr(&self) -> usize {
        self.addr
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn shrink(&mut self, to_size: usize) {
        debug_assert!(self.addr != 0);
        debug_assert!(to_size <= self.size);
        let pagesize = page_size();
        let curr_end = round_up(self.size, pagesize);
        let next_end = round_up(to_size, pagesize);
        if curr_end > next_end {
            os_munmap(self.addr + next_end, curr_end - next_end);
        }
        self.size = to_size;
    }

}

impl Drop for Mmap {
    fn drop(&mut self) {
        if self.addr != 0 {
            os_munmap(self.addr, round_up(self.size, page_size()));
        }
    }
}

/// Replace whatever is mapped in `[addr, addr + len)` with a fresh `PROT_NONE`
/// reservation. Used when a cache slab or home stripe is detached so the
/// global range stays reserved.
pub(crate) fn reprotect_none(addr: usize, len: usize) {
    let p = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        panic!(
            "mmap(PROT_NONE, {:#x}, {}) failed: {}",
            addr,
            len,
            OsError::last_os_error()
        );
    }
}

/// The collective operations the reservation protocol needs; implemented by
/// every transport backend and by the simulated fabric in the tests.
pub(crate) trait ReserveComm {
    fn my_rank(&self) -> usize;
    fn bcast_usize(&self, value: usize, root: usize) -> usize;
    fn allreduce_max_isize(&self, value: isize) -> isize;
}

/// One rank's view of virtual address space, factored out so the protocol can
/// run against simulated address spaces.
pub(crate) trait VmSpace {
    type Region: VmRegion;
    fn reserve(&mut self, size: usize, align: usize) -> Self::Region;
    fn reserve_at(&mut self, addr: usize, size: usize) -> Result<Self::Region, VmemError>;
}

pub(crate) trait VmRegion {
    fn addr(&self) -> usize;
    fn size(&self) -> usize;
    fn shrink(&mut self, to_size: usize);
}

impl VmRegion for Mmap {
    fn addr(&self) -> usize {
        self.addr()
    }
    fn size(&self) -> usize {
        self.size()
    }
    fn shrink(&mut self, to_size: usize) {
        self.shrink(to_size)
    }
}

pub(crate) struct OsVmSpace;

impl VmSpace for OsVmSpace {
    type Region = Mmap;
    fn reserve(&mut self, size: usize, align: usize) -> Mmap {
        Mmap::reserve(size, align)
    }
    fn reserve_at(&mut self, addr: usize, size: usize) -> Result<Mmap, VmemError> {
        Mmap::reserve_at(addr, size)
    }
}

const RESERVE_SIZE_CAP: usize = 1 << 40;

/// Collectively reserve the identical virtual address range on every rank.
///
/// A leader reserves anywhere and broadcasts the base; every other rank tries
/// a no-replace fixed mapping at that base. If any rank collides, the
/// highest-ranked collider becomes the next leader. Ranks that succeeded in a
/// failed round defer freeing their reservation so the same base cannot be
/// chosen again, and the attempt size doubles (capped) to escape densely
/// mapped regions.
pub(crate) fn reserve_same_vm_coll<C, S>(
    comm: &C,
    space: &mut S,
    size: usize,
    align: usize,
    max_trial: usize,
) -> S::Region
where
    C: ReserveComm,
    S: VmSpace,
{
    debug_assert!(size > 0);

    let mut leader: usize = 0;
    let mut alloc_size = round_up(size, page_size());
    let mut prev_regions: Vec<S::Region> = Vec::new();

    for n_trial in 0..=max_trial {
        let mut region = None;
        let mut base = 0;
        if comm.my_rank() == leader {
            let r = space.reserve(alloc_size, align);
            base = r.addr();
            region = Some(r);
        }
        base = comm.bcast_usize(base, leader);

        let mut failed_rank: isize = -1;
        if comm.my_rank() != leader {
            // drop earlier deferred reservations that overlap the candidate,
            // otherwise the collision would be with ourselves
            prev_regions.retain(|r| r.addr() >= base + alloc_size || base >= r.addr() + r.size());

            match space.reserve_at(base, alloc_size) {
                Ok(r) => region = Some(r),
                Err(VmemError::Collision) => failed_rank = comm.my_rank() as isize,
                Err(e) => panic!("virtual address reservation failed: {}", e),
            }
        }

        let failed_rank_max = comm.allreduce_max_isize(failed_rank);
        if failed_rank_max == -1 {
            let mut r = region.expect("every rank holds the reservation on success");
            r.shrink(size);
            return r;
        }

        trace!(
            trial = n_trial,
            base,
            next_leader = failed_rank_max,
            "virtual address reservation collided"
        );

        if failed_rank == -1 {
            // defer the free so the next leader cannot pick this base again
            prev_regions.push(region.expect("non-colliding rank holds a reservation"));
        }

        leader = failed_rank_max as usize;
        alloc_size = std::cmp::min(RESERVE_SIZE_CAP, 2 * alloc_size);
    }

    panic!(
        "reservation of an identical virtual address range failed after {} attempts (size {})",
        max_trial, size
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::{Condvar, Mutex};
    use std::sync::Arc;

    #[test]
    fn reserve_and_reuse_address() {
        let pagesize = page_size();
        let addr;
        {
            let vm = Mmap::reserve(32 * pagesize, pagesize);
            assert!(vm.addr() != 0);
            assert_eq!(vm.addr() % pagesize, 0);
            addr = vm.addr();
        }
        // the same base can be fixed-mapped once the reservation is gone
        let vm = Mmap::reserve_at(addr, 16 * pagesize).unwrap();
        // and cannot be mapped a second time while held
        assert!(matches!(
            Mmap::reserve_at(addr, pagesize),
            Err(VmemError::Collision)
        ));
        drop(vm);
        let _vm = Mmap::reserve_at(addr, pagesize).unwrap();
    }

    #[test]
    fn reserve_aligned() {
        let align = 1 << 21;
        let vm = Mmap::reserve(3 * page_size(), align);
        assert_eq!(vm.addr() % align, 0);
    }

    #[test]
    fn shrink_releases_tail() {
        let pagesize = page_size();
        let mut vm = Mmap::reserve(8 * pagesize, pagesize);
        let tail = vm.addr() + 4 * pagesize;
        vm.shrink(4 * pagesize);
        // the tail pages are free again
        let _vm2 = Mmap::reserve_at(tail, 4 * pagesize).unwrap();
    }

    // A simulated fabric: each rank has its own pretend address space, so
    // collisions can be staged deterministically without multiple processes.

    struct SimFabricState {
        n_ranks: usize,
        arrived: usize,
        generation: usize,
        slots: Vec<isize>,
    }

    #[derive(Clone)]
    struct SimFabric {
        state: Arc<(Mutex<SimFabricState>, Condvar)>,
    }

    impl SimFabric {
        fn new(n_ranks: usize) -> Self {
            SimFabric {
                state: Arc::new((
                    Mutex::new(SimFabricState {
                        n_ranks,
                        arrived: 0,
                        generation: 0,
                        slots: vec![0; n_ranks],
                    }),
                    Condvar::new(),
                )),
            }
        }

        fn barrier(&self) {
            let (lock, cvar) = &*self.state;
            let mut st = lock.lock();
            let gen = st.generation;
            st.arrived += 1;
            if st.arrived == st.n_ranks {
                st.arrived = 0;
                st.generation += 1;
                cvar.notify_all();
            } else {
                while st.generation == gen {
                    cvar.wait(&mut st);
                }
            }
        }

        fn exchange(&self, rank: usize, value: isize) -> Vec<isize> {
            {
                let (lock, _) = &*self.state;
                lock.lock().slots[rank] = value;
            }
            self.barrier();
            let out = {
                let (lock, _) = &*self.state;
                lock.lock().slots.clone()
            };
            self.barrier();
            out
        }
    }

    struct SimRank {
        fabric: SimFabric,
        rank: usize,
    }

    impl ReserveComm for SimRank {
        fn my_rank(&self) -> usize {
            self.rank
        }
        fn bcast_usize(&self, value: usize, root: usize) -> usize {
            self.fabric.exchange(self.rank, value as isize)[root] as usize
        }
        fn allreduce_max_isize(&self, value: isize) -> isize {
            *self.fabric.exchange(self.rank, value).iter().max().unwrap()
        }
    }

    struct SimRegion {
        addr: usize,
        size: usize,
    }

    impl VmRegion for SimRegion {
        fn addr(&self) -> usize {
            self.addr
        }
        fn size(&self) -> usize {
            self.size
        }
        fn shrink(&mut self, to_size: usize) {
            self.size = to_size;
        }
    }

    struct SimSpace {
        occupied: Vec<(usize, usize)>,
        next_fresh: usize,
    }

    impl SimSpace {
        fn new(first_fresh: usize) -> Self {
            SimSpace {
                occupied: Vec::new(),
                next_fresh: first_fresh,
            }
        }

        fn overlaps(&self, addr: usize, size: usize) -> bool {
            self.occupied
                .iter()
                .any(|&(a, s)| a < addr + size && addr < a + s)
        }
    }

    impl VmSpace for SimSpace {
        type Region = SimRegion;
        fn reserve(&mut self, size: usize, align: usize) -> SimRegion {
            let mut addr = round_up(self.next_fresh, align);
            while self.overlaps(addr, size) {
                addr = round_up(addr + size, align);
            }
            self.next_fresh = addr + size;
            self.occupied.push((addr, size));
            SimRegion { addr, size }
        }
        fn reserve_at(&mut self, addr: usize, size: usize) -> Result<SimRegion, VmemError> {
            if self.overlaps(addr, size) {
                return Err(VmemError::Collision);
            }
            self.occupied.push((addr, size));
            Ok(SimRegion { addr, size })
        }
    }

    #[test]
    fn collective_reservation_hands_leadership_to_collider() {
        let n_ranks = 4;
        let size = 64 * page_size();
        let fabric = SimFabric::new(n_ranks);
        // rank 0's first pick will be 0x10000000; rank 2 already occupies it
        let first_pick: usize = 0x1000_0000;

        let handles: Vec<_> = (0..n_ranks)
            .map(|rank| {
                let fabric = fabric.clone();
                std::thread::spawn(move || {
                    let mut space = SimSpace::new(first_pick);
                    if rank == 2 {
                        space.occupied.push((first_pick, size));
                    }
                    let comm = SimRank { fabric, rank };
                    let region = reserve_same_vm_coll(&comm, &mut space, size, page_size(), 100);
                    (region.addr(), region.size())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // every rank ends up with the identical range
        let (addr, sz) = results[0];
        assert!(results.iter().all(|&r| r == (addr, sz)));
        assert_eq!(sz, size);
        // the first candidate was rejected, so the final base is elsewhere
        assert_ne!(addr, first_pick);
    }
}
