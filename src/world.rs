use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::block_cache::{BlockCache, BlockDesc, BlockKey, CacheFull, CacheStats};
use crate::checkout::{CheckoutSpan, Mode, TouchedBlock};
use crate::coherence::{Coherence, EpochBump, ReleaseHandle};
use crate::comm::{Comm, CommOps, CommStats, LocalFabric, ShmemComm, WindowId};
use crate::env_var::{config, MapperKind};
use crate::global_alloc::{Allocation, HeapAlloc};
use crate::global_ptr::{GlobalPtr, GlobalSpan, Remote};
use crate::home::HomeMap;
use crate::mem_mapper::{MapperPolicy, MemMapper};
use crate::scheduler::{SerialScheduler, TaskScheduler};
use crate::topology::Topology;
use crate::virtual_mem::{page_size, reserve_same_vm_coll, Mmap, OsVmSpace};

/// Resolved configuration of one world (environment defaults plus builder
/// overrides).
#[derive(Debug, Clone)]
struct WorldConfig {
    heap_size: usize,
    block_size: usize,
    mapper: MapperKind,
    cyclic_seg_size: Option<usize>,
    cache_blocks: usize,
    enable_shared_memory: bool,
    numa_enabled: bool,
    vm_retry_max: usize,
    deadlock_timeout: Duration,
}

/// Builder for [`TesseraWorld`]. Unset knobs fall back to the `TESSERA_*`
/// environment configuration.
pub struct TesseraWorldBuilder {
    fabric: Option<(LocalFabric, usize)>,
    backend: Option<String>,
    heap_size: Option<usize>,
    block_size: Option<usize>,
    mapper: Option<MapperKind>,
    cyclic_seg_size: Option<usize>,
    cache_blocks: Option<usize>,
    enable_shared_memory: Option<bool>,
    numa_enabled: Option<bool>,
    scheduler: Option<Arc<dyn TaskScheduler>>,
}

impl TesseraWorldBuilder {
    pub fn new() -> TesseraWorldBuilder {
        TesseraWorldBuilder {
            fabric: None,
            backend: None,
            heap_size: None,
            block_size: None,
            mapper: None,
            cyclic_seg_size: None,
            cache_blocks: None,
            enable_shared_memory: None,
            numa_enabled: None,
            scheduler: None,
        }
    }

    /// Join an in-process fabric as rank `pe` (test harnesses and
    /// single-process development).
    pub fn with_fabric(mut self, fabric: &LocalFabric, pe: usize) -> Self {
        self.fabric = Some((fabric.clone(), pe));
        self
    }

    pub fn with_backend(mut self, backend: &str) -> Self {
        self.backend = Some(backend.to_owned());
        self
    }

    pub fn with_heap_size(mut self, bytes: usize) -> Self {
        self.heap_size = Some(bytes);
        self
    }

    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = Some(bytes);
        self
    }

    pub fn with_mapper(mut self, kind: MapperKind) -> Self {
        self.mapper = Some(kind);
        self
    }

    pub fn with_cyclic_seg_size(mut self, bytes: usize) -> Self {
        self.cyclic_seg_size = Some(bytes);
        self
    }

    pub fn with_cache_blocks(mut self, blocks: usize) -> Self {
        self.cache_blocks = Some(blocks);
        self
    }

    pub fn with_shared_memory(mut self, enabled: bool) -> Self {
        self.enable_shared_memory = Some(enabled);
        self
    }

    pub fn with_numa(mut self, enabled: bool) -> Self {
        self.numa_enabled = Some(enabled);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build(self) -> anyhow::Result<TesseraWorld> {
        let env = config();
        let cfg = WorldConfig {
            heap_size: self.heap_size.unwrap_or(env.heap_size),
            block_size: self.block_size.unwrap_or(env.block_size),
            mapper: self.mapper.unwrap_or(env.mapper),
            cyclic_seg_size: self.cyclic_seg_size.or(env.cyclic_seg_size),
            cache_blocks: self.cache_blocks.unwrap_or(env.cache_blocks),
            enable_shared_memory: self
                .enable_shared_memory
                .unwrap_or(env.enable_shared_memory),
            numa_enabled: self.numa_enabled.unwrap_or(env.numa_enabled),
            vm_retry_max: env.vm_retry_max,
            deadlock_timeout: Duration::from_secs_f64(env.deadlock_timeout),
        };

        if !cfg.block_size.is_power_of_two() || cfg.block_size % page_size() != 0 {
            return Err(anyhow!(
                "block_size {} must be a power of two multiple of the page size",
                cfg.block_size
            ));
        }
        if let Some(seg) = cfg.cyclic_seg_size {
            if seg < cfg.block_size || seg % cfg.block_size != 0 {
                return Err(anyhow!(
                    "cyclic_seg_size {} must be a multiple of block_size {}",
                    seg,
                    cfg.block_size
                ));
            }
        }
        if cfg.cache_blocks == 0 {
            return Err(anyhow!("cache_blocks must be nonzero"));
        }

        let (comm, job_id) = match self.fabric {
            Some((fabric, pe)) => {
                let job_id = fabric.job_id();
                (Comm::Local(fabric.comm(pe)), job_id)
            }
            None => match self.backend.as_deref().unwrap_or(&env.backend) {
                "shmem" => {
                    let job_id = std::env::var("TESSERA_JOB_ID")
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    (Comm::Shmem(ShmemComm::new()), job_id)
                }
                "local" => {
                    let fabric = LocalFabric::new(1);
                    let job_id = fabric.job_id();
                    (Comm::Local(fabric.comm(0)), job_id)
                }
                other => return Err(anyhow!("unknown backend '{}'", other)),
            },
        };

        TesseraWorld::init(comm, job_id, cfg, self.scheduler)
            .context("failed to initialize tessera world")
    }
}

impl Default for TesseraWorldBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Core {
    cache: BlockCache,
    coh: Coherence,
}

struct Registry {
    heap: HeapAlloc,
    allocs: BTreeMap<usize, Allocation>,
    next_alloc_id: usize,
}

/// The per-process runtime context: topology, transport, the reserved global
/// range, this rank's view of it, the block cache, the coherence controller,
/// and the collective allocator. Explicit init/teardown, no process-global
/// state: a test harness can stand several worlds up in one process over a
/// [`LocalFabric`].
pub struct TesseraWorld {
    comm: Comm,
    topo: Topology,
    cfg: WorldConfig,
    scheduler: Arc<dyn TaskScheduler>,
    /// base of the collectively reserved range; global pointers live here
    global_base: usize,
    /// reservation owner (the leader rank in-process, every rank with shmem)
    _global_vm: Option<Mmap>,
    /// base of this rank's mapped view of the range; identical to
    /// `global_base` when each rank is its own process
    view_base: usize,
    _view_vm: Option<Mmap>,
    core: Mutex<Core>,
    registry: Mutex<Registry>,
    outstanding_checkouts: AtomicUsize,
}

impl TesseraWorld {
    fn init(
        comm: Comm,
        job_id: usize,
        cfg: WorldConfig,
        scheduler: Option<Arc<dyn TaskScheduler>>,
    ) -> anyhow::Result<TesseraWorld> {
        let my_pe = comm.my_pe();
        let n_pes = comm.num_pes();
        let topo = if cfg.enable_shared_memory {
            Topology::single_node(my_pe, n_pes)
        } else {
            Topology::isolated(my_pe, n_pes)
        };

        let heap_size = crate::virtual_mem::round_up(cfg.heap_size, cfg.block_size);

        // Reserve the global range. Ranks sharing one process cannot each map
        // the same base, so the leader reserves it and everyone else works
        // through a private view; separate processes all map the broadcast
        // base and the view collapses onto it.
        let (global_base, global_vm, view_base, view_vm) = match &comm {
            Comm::Local(_) => {
                let (vm, base) = if my_pe == 0 {
                    let vm = Mmap::reserve(heap_size, cfg.block_size);
                    let base = vm.addr();
                    (Some(vm), base)
                } else {
                    (None, 0)
                };
                let base = CommOps::bcast_usize(&comm, base, 0);
                if my_pe == 0 {
                    (base, vm, base, None)
                } else {
                    let view = Mmap::reserve(heap_size, cfg.block_size);
                    let view_base = view.addr();
                    (base, None, view_base, Some(view))
                }
            }
            Comm::Shmem(_) => {
                let vm = reserve_same_vm_coll(
                    &comm,
                    &mut OsVmSpace,
                    heap_size,
                    cfg.block_size,
                    cfg.vm_retry_max,
                );
                let base = vm.addr();
                (base, Some(vm), base, None)
            }
        };

        let cache = BlockCache::new(
            &format!("/tessera_{}_{}_cache", job_id, my_pe),
            cfg.cache_blocks,
            cfg.block_size,
        );

        let world = TesseraWorld {
            comm,
            topo,
            scheduler: scheduler.unwrap_or_else(|| Arc::new(SerialScheduler)),
            global_base,
            _global_vm: global_vm,
            view_base,
            _view_vm: view_vm,
            core: Mutex::new(Core {
                cache,
                coh: Coherence::new(),
            }),
            registry: Mutex::new(Registry {
                heap: HeapAlloc::new(0, heap_size),
                allocs: BTreeMap::new(),
                next_alloc_id: 0,
            }),
            outstanding_checkouts: AtomicUsize::new(0),
            cfg,
        };
        debug!(my_pe, n_pes, global_base = world.global_base, heap_size, "world up");
        world.comm.barrier();
        Ok(world)
    }

    pub fn my_rank(&self) -> usize {
        self.topo.my_rank()
    }

    pub fn n_ranks(&self) -> usize {
        self.topo.n_ranks()
    }

    pub fn block_size(&self) -> usize {
        self.cfg.block_size
    }

    pub fn barrier(&self) {
        self.comm.barrier();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.core.lock().cache.stats()
    }

    pub fn comm_stats(&self) -> CommStats {
        self.comm.stats()
    }

    /// The `(owner, global offset)` of every block currently resident in the
    /// cache, for tests and diagnostics.
    pub fn resident_blocks(&self) -> Vec<(usize, usize)> {
        self.core
            .lock()
            .cache
            .resident_blocks()
            .into_iter()
            .map(|k| (k.owner, k.block_begin))
            .collect()
    }

    fn view_addr(&self, heap_offset: usize) -> usize {
        self.view_base + heap_offset
    }

    /// Collectively allocate `count` elements of `T`, distributed by the
    /// world's mapper policy. Every rank must call with the same arguments
    /// and receives the identical global pointer.
    pub fn malloc_coll<T: Remote>(&self, count: usize) -> GlobalPtr<T> {
        let bytes = count * std::mem::size_of::<T>();
        if bytes == 0 {
            return GlobalPtr::null();
        }
        self.comm.barrier();

        let (id, base_offset, mapper) = {
            let mut reg = self.registry.lock();
            let size = crate::virtual_mem::round_up(bytes, self.cfg.block_size);
            let mapper = MemMapper::new(
                self.cfg.mapper,
                size,
                self.topo.n_ranks(),
                self.topo.intra_n_ranks(),
                self.cfg.block_size,
                self.cfg.cyclic_seg_size,
            );
            let base_offset = match reg.heap.try_malloc(mapper.effective_size()) {
                Some(off) => off,
                None => panic!(
                    "global heap exhausted allocating {} bytes (heap {})",
                    mapper.effective_size(),
                    self.cfg.heap_size
                ),
            };
            let id = reg.next_alloc_id;
            reg.next_alloc_id += 1;
            (id, base_offset, mapper)
        };

        let me = self.topo.my_rank();
        let local_size = mapper.local_size(me);
        let n_owned_blocks = local_size / self.cfg.block_size;
        let data_win = self
            .comm
            .create_window(WindowId::data(id), local_size);
        let epoch_win = self.comm.create_window(
            WindowId::epoch(id),
            n_owned_blocks * std::mem::size_of::<u64>(),
        );
        // everyone's windows must exist before anyone attaches
        self.comm.barrier();

        let home = HomeMap::attach(
            &self.comm,
            &self.topo,
            &mapper,
            WindowId::data(id),
            self.view_addr(base_offset),
            self.cfg.numa_enabled,
        );
        self.comm.barrier();

        trace!(
            id,
            base_offset,
            bytes,
            effective = mapper.effective_size(),
            "collective allocation"
        );
        self.registry.lock().allocs.insert(
            base_offset,
            Allocation {
                id,
                base_offset,
                mapper,
                _data_seg: data_win,
                _epoch_seg: epoch_win,
                home,
            },
        );
        GlobalPtr::from_addr(self.global_base + base_offset)
    }

    /// Collectively free an allocation. Cached copies are discarded, home
    /// mappings detached, and the range returns to the heap.
    pub fn free_coll<T>(&self, ptr: GlobalPtr<T>) {
        if ptr.is_null() {
            return;
        }
        self.comm.barrier();
        let base_offset = ptr.addr() - self.global_base;
        let mut alloc = {
            let mut reg = self.registry.lock();
            match reg.allocs.remove(&base_offset) {
                Some(a) => a,
                None => panic!("free of a pointer that is not an allocation base: {:?}", ptr),
            }
        };

        {
            let mut core = self.core.lock();
            let Core { cache, coh } = &mut *core;
            cache.drop_allocation(alloc.id, &self.comm);
            coh.purge_allocation(alloc.id);
        }
        alloc.home.detach();
        self.comm.release_window(WindowId::data(alloc.id));
        self.comm.release_window(WindowId::epoch(alloc.id));
        // all ranks must detach before the owner's segments go away
        self.comm.barrier();
        drop(alloc);

        self.registry.lock().heap.free(base_offset);
        self.comm.barrier();
    }

    /// Blocking checkout: returns once the span holds data per `mode`.
    pub fn checkout<T: Remote>(&self, ptr: GlobalPtr<T>, n: usize, mode: Mode) -> CheckoutSpan<T> {
        let span = self.checkout_nb(ptr, n, mode);
        self.checkout_complete();
        span
    }

    /// Checkout of a whole [`GlobalSpan`].
    pub fn checkout_span<T: Remote>(&self, span: GlobalSpan<T>, mode: Mode) -> CheckoutSpan<T> {
        self.checkout(span.data(), span.len(), mode)
    }

    /// Nonblocking checkout: transfers are issued but not awaited, so fetches
    /// for several spans overlap. The returned span must not be accessed
    /// before [`TesseraWorld::checkout_complete`].
    pub fn checkout_nb<T: Remote>(
        &self,
        ptr: GlobalPtr<T>,
        n: usize,
        mode: Mode,
    ) -> CheckoutSpan<T> {
        self.outstanding_checkouts.fetch_add(1, Ordering::Relaxed);
        let bytes = n * std::mem::size_of::<T>();
        if ptr.is_null() || bytes == 0 {
            return CheckoutSpan::new(self, std::ptr::null_mut(), 0, mode, Vec::new());
        }

        let begin = ptr.addr() - self.global_base;
        let end = begin + bytes;
        let local_ptr = self.view_addr(begin) as *mut T;

        if mode == Mode::NoAccess {
            return CheckoutSpan::new(self, local_ptr, n, mode, Vec::new());
        }

        let blocks = self.pin_range(begin, end, mode);
        CheckoutSpan::new(self, local_ptr, n, mode, blocks)
    }

    fn pin_range(&self, begin: usize, end: usize, mode: Mode) -> Vec<TouchedBlock> {
        let bs = self.cfg.block_size;
        let reg = self.registry.lock();
        let (_, alloc) = reg
            .allocs
            .range(..=begin)
            .next_back()
            .expect("checkout outside any allocation");
        debug_assert!(
            begin >= alloc.base_offset
                && end <= alloc.base_offset + alloc.mapper.effective_size(),
            "checkout range escapes its allocation"
        );

        let rel_begin = begin - alloc.base_offset;
        let rel_end = end - alloc.base_offset;
        let mut blocks = Vec::new();

        let mut block = rel_begin / bs * bs;
        while block < rel_end {
            let seg = alloc.mapper.get_segment(block);
            let seg_last = std::cmp::min(seg.offset_end, crate::virtual_mem::round_up(rel_end, bs));
            while block < seg_last {
                let touch_begin = std::cmp::max(rel_begin, block);
                let touch_end = std::cmp::min(rel_end, block + bs);
                let pm_offset = seg.pm_offset + (block - seg.offset_begin);
                let bump = EpochBump {
                    owner: seg.owner,
                    epoch_win: WindowId::epoch(alloc.id),
                    epoch_slot: pm_offset / bs,
                };
                if self.topo.is_locally_accessible(seg.owner) {
                    blocks.push(TouchedBlock::Home { bump });
                } else {
                    let key = BlockKey {
                        owner: seg.owner,
                        block_begin: alloc.base_offset + block,
                    };
                    let desc = BlockDesc {
                        owner: seg.owner,
                        data_win: WindowId::data(alloc.id),
                        epoch_win: WindowId::epoch(alloc.id),
                        pm_offset,
                        epoch_slot: pm_offset / bs,
                        view_addr: self.view_addr(alloc.base_offset + block),
                    };
                    let covers_block = touch_begin == block && touch_end == block + bs;
                    // a write that only partially covers the block falls back
                    // to fetching so the untouched bytes survive write-back
                    let fetch = mode.fetches() || !covers_block;
                    let idx = self.acquire_cached(key, desc, fetch);
                    blocks.push(TouchedBlock::Cached {
                        idx,
                        begin: touch_begin - block,
                        end: touch_end - block,
                    });
                }
                block += bs;
            }
        }
        blocks
    }

    /// Pin one block in the cache, polling the scheduler while every slot is
    /// pinned. Exceeding the deadlock timeout here means every slot is held
    /// by a checkout that can never complete.
    fn acquire_cached(&self, key: BlockKey, desc: BlockDesc, fetch: bool) -> usize {
        let deadline = Instant::now() + self.cfg.deadlock_timeout;
        loop {
            {
                let mut core = self.core.lock();
                let Core { cache, coh } = &mut *core;
                match cache.try_acquire(key, desc, fetch, &self.comm, coh.pending_mut()) {
                    Ok(idx) => return idx,
                    Err(CacheFull) => {}
                }
            }
            if Instant::now() > deadline {
                panic!(
                    "block cache exhausted: all {} slots pinned by outstanding checkouts",
                    self.cfg.cache_blocks
                );
            }
            self.poll();
            std::thread::yield_now();
        }
    }

    /// Fence that completes every outstanding nonblocking checkout fetch.
    pub fn checkout_complete(&self) {
        self.core.lock().cache.complete_all(&self.comm);
    }

    pub(crate) fn checkin_blocks(&self, mode: Mode, blocks: Vec<TouchedBlock>) {
        let mut core = self.core.lock();
        let Core { cache, coh } = &mut *core;
        for block in blocks {
            match block {
                TouchedBlock::Cached { idx, begin, end } => {
                    if mode.writes() {
                        cache.complete(idx, &self.comm);
                        cache.mark_dirty(idx, begin, end);
                    }
                    cache.release(idx);
                }
                TouchedBlock::Home { bump } => {
                    if mode.writes() {
                        coh.note_home_write(bump);
                    }
                }
            }
        }
        self.outstanding_checkouts.fetch_sub(1, Ordering::Relaxed);
    }

    /// Synchronous release: all local writes become globally visible before
    /// this returns.
    pub fn release(&self) {
        let mut core = self.core.lock();
        let Core { cache, coh } = &mut *core;
        coh.release(cache, &self.comm);
    }

    /// Post writes without waiting; the handle transfers the obligation to a
    /// later [`TesseraWorld::acquire_handle`], typically on whichever rank a
    /// migrating task lands on.
    pub fn release_lazy(&self) -> ReleaseHandle {
        let mut core = self.core.lock();
        let Core { cache, coh } = &mut *core;
        coh.release_lazy(cache, &self.comm)
    }

    /// Make remotely released writes visible to subsequent checkouts.
    pub fn acquire(&self) {
        let mut core = self.core.lock();
        let Core { cache, coh } = &mut *core;
        coh.acquire(cache, &self.comm, None);
    }

    /// [`TesseraWorld::acquire`], additionally completing the request set of
    /// a handed-over lazy release.
    pub fn acquire_handle(&self, handle: &ReleaseHandle) {
        let mut core = self.core.lock();
        let Core { cache, coh } = &mut *core;
        coh.acquire(cache, &self.comm, Some(handle));
    }

    /// Run the scheduler's progress hook, bracketing any stolen task with
    /// release/acquire so memory order crosses the steal.
    pub fn poll(&self) {
        let scheduler = self.scheduler.clone();
        scheduler.poll(&mut || self.release_lazy(), &mut |h| self.acquire_handle(&h));
    }

    /// Fork a task through the scheduler with acquire-on-enter and
    /// release-on-exit injected around the body.
    pub fn spawn_with_handle(&self, handle: &ReleaseHandle, body: &mut dyn FnMut()) {
        let scheduler = self.scheduler.clone();
        scheduler.spawn(
            &mut || self.acquire_handle(handle),
            body,
            &mut || self.release(),
        );
    }
}

impl Drop for TesseraWorld {
    fn drop(&mut self) {
        let outstanding = self.outstanding_checkouts.load(Ordering::Relaxed);
        if outstanding != 0 && cfg!(debug_assertions) {
            panic!("world torn down with {} leaked checkouts", outstanding);
        }
        // allocations the program never freed: detach so the reservations and
        // shared segments go away cleanly
        let mut reg = self.registry.lock();
        for (_, alloc) in reg.allocs.iter_mut() {
            alloc.home.detach();
            self.comm.release_window(WindowId::data(alloc.id));
            self.comm.release_window(WindowId::epoch(alloc.id));
        }
        reg.allocs.clear();
    }
}
