pub(crate) mod local;
pub(crate) mod shmem;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use enum_dispatch::enum_dispatch;
use parking_lot::Mutex;

use crate::physical_mem::{MappedSeg, PhysicalMem};
use crate::virtual_mem::ReserveComm;

pub(crate) use local::{LocalComm, LocalFabric};
pub(crate) use shmem::ShmemComm;

/// Identifier of an in-flight one-sided operation.
pub(crate) type ReqId = u64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) enum WindowKind {
    /// home data of one allocation
    Data,
    /// per-block epoch counters of one allocation
    Epoch,
}

/// A named remote-memory window. Windows are created collectively (one per
/// rank per allocation per kind) and addressed by `(rank, WindowId)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct WindowId {
    pub(crate) alloc_id: usize,
    pub(crate) kind: WindowKind,
}

impl WindowId {
    pub(crate) fn data(alloc_id: usize) -> WindowId {
        WindowId {
            alloc_id,
            kind: WindowKind::Data,
        }
    }

    pub(crate) fn epoch(alloc_id: usize) -> WindowId {
        WindowId {
            alloc_id,
            kind: WindowKind::Epoch,
        }
    }
}

/// Transfer counters, exposed for tests and diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommStats {
    pub puts: usize,
    pub gets: usize,
    /// number of wait/flush calls that actually had to complete something
    pub waits: usize,
    pub bytes_put: usize,
    pub bytes_get: usize,
}

/// One-sided operations and the handful of collectives the runtime needs.
///
/// Both backends complete data movement through shared memory, so a put or
/// get is finished by the time the call returns; request identifiers still
/// flow through the same issue/wait discipline a deferred-completion
/// transport would need, and the wait counters let tests pin down how often
/// the runtime synchronised.
#[enum_dispatch]
pub(crate) trait CommOps {
    fn my_pe(&self) -> usize;
    fn num_pes(&self) -> usize;

    fn barrier(&self);
    fn bcast_usize(&self, value: usize, root: usize) -> usize;
    fn allreduce_max_isize(&self, value: isize) -> isize;

    /// Create this rank's segment of a window. Not collective by itself;
    /// callers barrier before peers attach.
    fn create_window(&self, win: WindowId, len: usize) -> Arc<PhysicalMem>;
    /// Resolve a peer's window segment (attaching it on first use).
    fn window_phys(&self, pe: usize, win: WindowId) -> Arc<PhysicalMem>;
    /// Drop this rank's segment and any peer attachments of `win`.
    fn release_window(&self, win: WindowId);

    fn put_nb(&self, pe: usize, win: WindowId, offset: usize, src: &[u8]) -> ReqId;
    fn get_nb(&self, pe: usize, win: WindowId, offset: usize, dst: &mut [u8]) -> ReqId;
    fn wait(&self, reqs: &[ReqId]);
    fn flush(&self, pe: usize);
    fn flush_all(&self);

    fn atomic_load(&self, pe: usize, win: WindowId, idx: usize) -> u64;
    fn fetch_add_u64(&self, pe: usize, win: WindowId, idx: usize, value: u64) -> u64;
    fn compare_swap_u64(&self, pe: usize, win: WindowId, idx: usize, old: u64, new: u64) -> u64;

    fn stats(&self) -> CommStats;
}

#[enum_dispatch(CommOps)]
#[derive(Debug)]
pub(crate) enum Comm {
    Local(LocalComm),
    Shmem(ShmemComm),
}

impl ReserveComm for Comm {
    fn my_rank(&self) -> usize {
        self.my_pe()
    }
    fn bcast_usize(&self, value: usize, root: usize) -> usize {
        CommOps::bcast_usize(self, value, root)
    }
    fn allreduce_max_isize(&self, value: isize) -> isize {
        CommOps::allreduce_max_isize(self, value)
    }
}

/// The shared data path: peer-segment attachments, request tracking, and
/// counters. Backends differ only in how `(pe, win)` resolves to a segment.
pub(crate) struct Rma {
    attaches: Mutex<HashMap<(usize, WindowId), Arc<MappedSeg>>>,
    pending: Mutex<HashMap<ReqId, usize>>,
    next_req: AtomicU64,
    puts: AtomicUsize,
    gets: AtomicUsize,
    waits: AtomicUsize,
    bytes_put: AtomicUsize,
    bytes_get: AtomicUsize,
}

impl Rma {
    pub(crate) fn new() -> Rma {
        Rma {
            attaches: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_req: AtomicU64::new(1),
            puts: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
            bytes_put: AtomicUsize::new(0),
            bytes_get: AtomicUsize::new(0),
        }
    }

    fn attach<R>(&self, pe: usize, win: WindowId, resolve: R) -> Arc<MappedSeg>
    where
        R: FnOnce() -> Arc<PhysicalMem>,
    {
        let mut attaches = self.attaches.lock();
        attaches
            .entry((pe, win))
            .or_insert_with(|| {
                let phys = resolve();
                Arc::new(phys.map_anywhere(0, phys.size()))
            })
            .clone()
    }

    pub(crate) fn detach(&self, win: WindowId) {
        self.attaches.lock().retain(|&(_, w), _| w != win);
    }

    pub(crate) fn put_nb<R>(
        &self,
        pe: usize,
        win: WindowId,
        offset: usize,
        src: &[u8],
        resolve: R,
    ) -> ReqId
    where
        R: FnOnce() -> Arc<PhysicalMem>,
    {
        let seg = self.attach(pe, win, resolve);
        assert!(offset + src.len() <= seg.len(), "put beyond window bounds");
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), seg.as_ptr().add(offset), src.len());
        }
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.bytes_put.fetch_add(src.len(), Ordering::Relaxed);
        let req = self.next_req.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(req, pe);
        req
    }

    pub(crate) fn get_nb<R>(
        &self,
        pe: usize,
        win: WindowId,
        offset: usize,
        dst: &mut [u8],
        resolve: R,
    ) -> ReqId
    where
        R: FnOnce() -> Arc<PhysicalMem>,
    {
        let seg = self.attach(pe, win, resolve);
        assert!(offset + dst.len() <= seg.len(), "get beyond window bounds");
        unsafe {
            std::ptr::copy_nonoverlapping(seg.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.bytes_get.fetch_add(dst.len(), Ordering::Relaxed);
        let req = self.next_req.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(req, pe);
        req
    }

    pub(crate) fn wait(&self, reqs: &[ReqId]) {
        let mut pending = self.pending.lock();
        let mut completed_any = false;
        for req in reqs {
            completed_any |= pending.remove(req).is_some();
        }
        if completed_any {
            self.waits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn flush(&self, pe: usize) {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, &mut p| p != pe);
        if pending.len() != before {
            self.waits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn flush_all(&self) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            pending.clear();
            self.waits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn atomic<R, F, T>(&self, pe: usize, win: WindowId, idx: usize, resolve: R, op: F) -> T
    where
        R: FnOnce() -> Arc<PhysicalMem>,
        F: FnOnce(&AtomicU64) -> T,
    {
        let seg = self.attach(pe, win, resolve);
        let atomics = seg.atomic_slice();
        op(&atomics[idx])
    }

    pub(crate) fn stats(&self) -> CommStats {
        CommStats {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            bytes_put: self.bytes_put.load(Ordering::Relaxed),
            bytes_get: self.bytes_get.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Rma {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Rma")
            .field("attaches", &self.attaches.lock().len())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

/// Deterministic shared-memory object name for one rank's window segment.
pub(crate) fn window_shm_name(job_id: usize, pe: usize, win: WindowId) -> String {
    let kind = match win.kind {
        WindowKind::Data => "d",
        WindowKind::Epoch => "e",
    };
    format!("/tessera_{}_{}_a{}{}", job_id, pe, win.alloc_id, kind)
}
