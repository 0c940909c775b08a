use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::trace;

use crate::comm::{window_shm_name, CommOps, CommStats, ReqId, Rma, WindowId};
use crate::physical_mem::PhysicalMem;

/// An in-process fabric connecting several ranks inside one process.
///
/// Each rank is driven by its own thread and owns its own world; the fabric
/// carries the collectives and the window directory between them. This is the
/// single-process development backend and the way test harnesses stand up a
/// multi-rank runtime without spawning processes.
#[derive(Clone)]
pub struct LocalFabric {
    state: Arc<FabricState>,
}

struct BarrierPhase {
    arrived: usize,
    generation: usize,
}

struct FabricState {
    n_ranks: usize,
    job_id: usize,
    barrier: Mutex<BarrierPhase>,
    cvar: Condvar,
    slots: Mutex<Vec<usize>>,
    windows: RwLock<HashMap<(usize, WindowId), Arc<PhysicalMem>>>,
    claimed: Mutex<Vec<bool>>,
}

static FABRIC_COUNTER: AtomicUsize = AtomicUsize::new(0);

impl LocalFabric {
    pub fn new(n_ranks: usize) -> LocalFabric {
        assert!(n_ranks > 0);
        // window names must not collide between fabrics or test runs
        let job_id = (std::process::id() as usize) << 16
            | (FABRIC_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xffff);
        LocalFabric {
            state: Arc::new(FabricState {
                n_ranks,
                job_id,
                barrier: Mutex::new(BarrierPhase {
                    arrived: 0,
                    generation: 0,
                }),
                cvar: Condvar::new(),
                slots: Mutex::new(vec![0; n_ranks]),
                windows: RwLock::new(HashMap::new()),
                claimed: Mutex::new(vec![false; n_ranks]),
            }),
        }
    }

    pub fn n_ranks(&self) -> usize {
        self.state.n_ranks
    }

    pub(crate) fn job_id(&self) -> usize {
        self.state.job_id
    }

    pub(crate) fn comm(&self, pe: usize) -> LocalComm {
        assert!(pe < self.state.n_ranks, "pe {} out of range", pe);
        {
            let mut claimed = self.state.claimed.lock();
            assert!(!claimed[pe], "pe {} already attached to this fabric", pe);
            claimed[pe] = true;
        }
        LocalComm {
            state: self.state.clone(),
            my_pe: pe,
            rma: Rma::new(),
        }
    }
}

impl FabricState {
    fn barrier(&self) {
        let mut phase = self.barrier.lock();
        let generation = phase.generation;
        phase.arrived += 1;
        if phase.arrived == self.n_ranks {
            phase.arrived = 0;
            phase.generation += 1;
            self.cvar.notify_all();
        } else {
            while phase.generation == generation {
                self.cvar.wait(&mut phase);
            }
        }
    }

    /// Everyone deposits a value, everyone reads the full vector.
    fn exchange(&self, pe: usize, value: usize) -> Vec<usize> {
        self.slots.lock()[pe] = value;
        self.barrier();
        let out = self.slots.lock().clone();
        self.barrier();
        out
    }
}

pub(crate) struct LocalComm {
    state: Arc<FabricState>,
    my_pe: usize,
    rma: Rma,
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("my_pe", &self.my_pe)
            .field("n_ranks", &self.state.n_ranks)
            .finish()
    }
}

impl LocalComm {
    fn resolve(&self, pe: usize, win: WindowId) -> Arc<PhysicalMem> {
        match self.state.windows.read().get(&(pe, win)) {
            Some(phys) => phys.clone(),
            None => panic!(
                "transport failure: window {:?} of pe {} is not registered",
                win, pe
            ),
        }
    }
}

impl CommOps for LocalComm {
    fn my_pe(&self) -> usize {
        self.my_pe
    }

    fn num_pes(&self) -> usize {
        self.state.n_ranks
    }

    fn barrier(&self) {
        self.state.barrier();
    }

    fn bcast_usize(&self, value: usize, root: usize) -> usize {
        self.state.exchange(self.my_pe, value)[root]
    }

    fn allreduce_max_isize(&self, value: isize) -> isize {
        self.state
            .exchange(self.my_pe, value as usize)
            .into_iter()
            .map(|v| v as isize)
            .max()
            .unwrap()
    }

    fn create_window(&self, win: WindowId, len: usize) -> Arc<PhysicalMem> {
        let name = window_shm_name(self.state.job_id, self.my_pe, win);
        let phys = Arc::new(PhysicalMem::create(&name, len));
        trace!(pe = self.my_pe, ?win, len, "registered window");
        self.state
            .windows
            .write()
            .insert((self.my_pe, win), phys.clone());
        phys
    }

    fn window_phys(&self, pe: usize, win: WindowId) -> Arc<PhysicalMem> {
        self.resolve(pe, win)
    }

    fn release_window(&self, win: WindowId) {
        self.state.windows.write().remove(&(self.my_pe, win));
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
            a.load(std::sync::atomic::Ordering::Acquire)
        })
    }

    fn fetch_add_u64(&self, pe: usize, win: WindowId, idx: usize, value: u64) -> u64 {
        self.rma.atomic(pe, win, idx, || self.resolve(pe, win), |a| {
            a.fetch_add(value, std::sync::atomic::Ordering::AcqRel)
        })
    }

    fn compare_swap_u64(&self, pe: usize, win: WindowId, idx: usize, old: u64, new: u64) -> u64 {
        self.rma.atomic(pe, win, idx, || self.resolve(pe, win), |a| {
            match a.compare_exchange(
                old,
                new,
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
            ) {
                Ok(v) => v,
                Err(v) => v,
            }
        })
    }

    fn stats(&self) -> CommStats {
        self.rma.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::WindowKind;

    #[test]
    fn collectives_across_threads() {
        let fabric = LocalFabric::new(3);
        let handles: Vec<_> = (0..3)
            .map(|pe| {
                let fabric = fabric.clone();
                std::thread::spawn(move || {
                    let comm = fabric.comm(pe);
                    let root_val = comm.bcast_usize(100 + pe, 1);
                    let max = comm.allreduce_max_isize(pe as isize * 10 - 5);
                    (root_val, max)
                })
            })
            .collect();
        for h in handles {
            let (root_val, max) = h.join().unwrap();
            assert_eq!(root_val, 101);
            assert_eq!(max, 15);
        }
    }

    #[test]
    fn window_put_get_roundtrip() {
        let fabric = LocalFabric::new(2);
        let f0 = fabric.clone();
        let f1 = fabric.clone();
        let win = WindowId {
            alloc_id: 7,
            kind: WindowKind::Data,
        };

        let t0 = std::thread::spawn(move || {
            let comm = f0.comm(0);
            let _phys = comm.create_window(win, 4096);
            comm.barrier(); // window visible
            comm.barrier(); // peer done writing
            let mut buf = [0u8; 8];
            let req = comm.get_nb(0, win, 128, &mut buf);
            comm.wait(&[req]);
            assert_eq!(u64::from_le_bytes(buf), 0x1122_3344);
        });
        let t1 = std::thread::spawn(move || {
            let comm = f1.comm(1);
            comm.barrier();
            let _req = comm.put_nb(0, win, 128, &0x1122_3344u64.to_le_bytes());
            comm.flush(0);
            comm.barrier();
            assert_eq!(comm.stats().puts, 1);
            assert_eq!(comm.stats().waits, 1);
        });
        t0.join().unwrap();
        t1.join().unwrap();
    }

    #[test]
    fn window_atomics() {
        let fabric = LocalFabric::new(2);
        let win = WindowId {
            alloc_id: 1,
            kind: WindowKind::Epoch,
        };
        let handles: Vec<_> = (0..2)
            .map(|pe| {
                let fabric = fabric.clone();
                std::thread::spawn(move || {
                    let comm = fabric.comm(pe);
                    if pe == 0 {
                        comm.create_window(win, 64);
                    }
                    comm.barrier();
                    comm.fetch_add_u64(0, win, 3, 1);
                    comm.barrier();
                    let v = comm.atomic_load(0, win, 3);
                    assert_eq!(v, 2);
                    comm.barrier();
                    if pe == 1 {
                        assert_eq!(comm.compare_swap_u64(0, win, 3, 2, 9), 2);
                        assert_eq!(comm.atomic_load(0, win, 3), 9);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
