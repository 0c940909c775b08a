use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::trace;

use crate::comm::{window_shm_name, CommOps, CommStats, ReqId, Rma, WindowId};
use crate::physical_mem::PhysicalMem;

/// Multi-process single-node backend.
///
/// Every PE is a separate process launched with `TESSERA_NUM_PES`,
/// `TESSERA_PE_ID`, and a shared `TESSERA_JOB_ID`. A small bootstrap segment
/// carries the collectives; windows are plain shared-memory objects attached
/// on demand under deterministic names.
pub(crate) struct ShmemComm {
    my_pe: usize,
    num_pes: usize,
    job_id: usize,
    boot: BootSegment,
    peer_windows: RwLock<HashMap<(usize, WindowId), Arc<PhysicalMem>>>,
    my_windows: RwLock<HashMap<WindowId, Arc<PhysicalMem>>>,
    rma: Rma,
}

impl std::fmt::Debug for ShmemComm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ShmemComm")
            .field("my_pe", &self.my_pe)
            .field("num_pes", &self.num_pes)
            .field("job_id", &self.job_id)
            .finish()
    }
}

/// Layout of the bootstrap segment: one barrier generation counter and one
/// value slot per PE, preceded by an init header word.
struct BootSegment {
    _shmem: Shmem,
    base: *mut u8,
    n: usize,
}

unsafe impl Send for BootSegment {}
unsafe impl Sync for BootSegment {}

const BOOT_MAGIC: usize = 0x7e55e7a;

impl BootSegment {
    fn attach(job_id: usize, num_pes: usize, create: bool) -> BootSegment {
        let size = std::mem::size_of::<usize>() * (1 + 2 * num_pes);
        let os_id = format!("tessera_boot_{}", job_id);
        let mut retry = 0;
        let shmem = loop {
            match ShmemConf::new().size(size).os_id(&os_id).create() {
                Ok(m) => {
                    if create {
                        unsafe { *(m.as_ptr() as *mut usize) = BOOT_MAGIC };
                    }
                    break m;
                }
                Err(ShmemError::LinkExists)
                | Err(ShmemError::MappingIdExists)
                | Err(ShmemError::MapOpenFailed(_)) => {
                    match ShmemConf::new().os_id(&os_id).open() {
                        Ok(m) => {
                            if create {
                                unsafe { *(m.as_ptr() as *mut usize) = BOOT_MAGIC };
                            }
                            break m;
                        }
                        Err(ShmemError::MapOpenFailed(_)) if retry < 100 => {
                            retry += 1;
                            std::thread::sleep(std::time::Duration::from_millis(50));
                        }
                        Err(e) => panic!("unable to attach bootstrap segment {}: {:?}", os_id, e),
                    }
                }
                Err(e) => panic!("unable to create bootstrap segment {}: {:?}", os_id, e),
            }
        };

        while unsafe { std::ptr::read_volatile(shmem.as_ptr() as *const usize) } != BOOT_MAGIC {
            std::thread::yield_now();
        }

        let base = unsafe { shmem.as_ptr().add(std::mem::size_of::<usize>()) };
        BootSegment {
            _shmem: shmem,
            base,
            n: num_pes,
        }
    }

    fn generations(&self) -> &[AtomicUsize] {
        unsafe { std::slice::from_raw_parts(self.base as *const AtomicUsize, self.n) }
    }

    fn slots(&self) -> &[AtomicUsize] {
        unsafe {
            std::slice::from_raw_parts(
                (self.base as *const AtomicUsize).add(self.n),
                self.n,
            )
        }
    }

    fn barrier(&self, my_pe: usize) {
        let gens = self.generations();
        let target = gens[my_pe].fetch_add(1, Ordering::AcqRel) + 1;
        for pe in 0..self.n {
            while gens[pe].load(Ordering::Acquire) < target {
                std::hint::spin_loop();
                std::thread::yield_now();
            }
        }
    }

    fn exchange(&self, my_pe: usize, value: usize) -> Vec<usize> {
        self.slots()[my_pe].store(value, Ordering::Release);
        self.barrier(my_pe);
        let out = self.slots().iter().map(|s| s.load(Ordering::Acquire)).collect();
        self.barrier(my_pe);
        out
    }
}

impl ShmemComm {
    pub(crate) fn new() -> ShmemComm {
        let num_pes = match env::var("TESSERA_NUM_PES") {
            Ok(val) => val.parse::<usize>().expect("invalid TESSERA_NUM_PES"),
            Err(_e) => 1,
        };
        let my_pe = match env::var("TESSERA_PE_ID") {
            Ok(val) => val.parse::<usize>().expect("invalid TESSERA_PE_ID"),
            Err(_e) => 0,
        };
        let job_id = match env::var("TESSERA_JOB_ID") {
            Ok(val) => val.parse::<usize>().expect("invalid TESSERA_JOB_ID"),
            Err(_e) => 0,
        };
        assert!(my_pe < num_pes);

        let boot = BootSegment::attach(job_id, num_pes, my_pe == 0);
        trace!(my_pe, num_pes, job_id, "attached shmem fabric");
        let comm = ShmemComm {
            my_pe,
            num_pes,
            job_id,
            boot,
            peer_windows: RwLock::new(HashMap::new()),
            my_windows: RwLock::new(HashMap::new()),
            rma: Rma::new(),
        };
        comm.barrier();
        comm
    }

    fn resolve(&self, pe: usize, win: WindowId) -> Arc<PhysicalMem> {
        if pe == self.my_pe {
            if let Some(phys) = self.my_windows.read().get(&win) {
                return phys.clone();
            }
        }
        if let Some(phys) = self.peer_windows.read().get(&(pe, win)) {
            return phys.clone();
        }
        let phys = Arc::new(PhysicalMem::open_auto(&window_shm_name(
            self.job_id,
            pe,
            win,
        )));
        self.peer_windows
            .write()
            .entry((pe, win))
            .or_insert(phys)
            .clone()
    }
}

impl CommOps for ShmemComm {
    fn my_pe(&self) -> usize {
        self.my_pe
    }

    fn num_pes(&self) -> usize {
        self.num_pes
    }

    fn barrier(&self) {
        self.boot.barrier(self.my_pe);
    }

    fn bcast_usize(&self, value: usize, root: usize) -> usize {
        self.boot.exchange(self.my_pe, value)[root]
    }

    fn allreduce_max_isize(&self, value: isize) -> isize {
        self.boot
            .exchange(self.my_pe, value as usize)
            .into_iter()
            .map(|v| v as isize)
            .max()
            .unwrap()
    }

    fn create_window(&self, win: WindowId, len: usize) -> Arc<PhysicalMem> {
        let name = window_shm_name(self.job_id, self.my_pe, win);
        let phys = Arc::new(PhysicalMem::create(&name, len));
        self.my_windows.write().insert(win, phys.clone());
        phys
    }

    fn window_phys(&self, pe: usize, win: WindowId) -> Arc<PhysicalMem> {
        self.resolve(pe, win)
    }

    fn release_window(&self, win: WindowId) {
        self.my_windows.write().remove(&win);
        self.peer_windows.write().retain(|&(_, w), _| w != win);
        self.rma.detach(win);
    }

    fn put_nb(&self, pe: usize, win: WindowId, offset: usize, src: &[u8]) -> ReqId {
        self.rma
            .put_nb(pe, win, offset, src, || self.resolve(pe, win))
    }

    fn get_nb(&self, pe: usize, win: WindowId, offset: usize, dst: &mut [u8]) -> ReqId {
        self.rma
            .get_nb(pe, win, offset, dst, || self.resolve(pe, win))
    }

    fn wait(&self, reqs: &[ReqId]) {
        self.rma.wait(reqs);
    }

    fn flush(&self, pe: usize) {
        self.rma.flush(pe);
    }

    fn flush_all(&self) {
        self.rma.flush_all();
    }

    fn atomic_load(&self, pe: usize, win: WindowId, idx: usize) -> u64 {
        self.rma.atomic(pe, win, idx, || self.resolve(pe, win), |a| {
            a.load(Ordering::Acquire)
        })
    }

    fn fetch_add_u64(&self, pe: usize, win: WindowId, idx: usize, value: u64) -> u64 {
        self.rma.atomic(pe, win, idx, || self.resolve(pe, win), |a| {
            a.fetch_add(value, Ordering::AcqRel)
        })
    }

    fn compare_swap_u64(&self, pe: usize, win: WindowId, idx: usize, old: u64, new: u64) -> u64 {
        self.rma.atomic(pe, win, idx, || self.resolve(pe, win), |a| {
            match a.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(v) => v,
                Err(v) => v,
            }
        })
    }

    fn stats(&self) -> CommStats {
        self.rma.stats()
    }
}
