//! Tessera is a distributed shared-memory runtime core for task-parallel programs on clusters.
//!
//! Cooperating processes present a single global address space: every rank reserves the identical
//! virtual range, so a global pointer is a raw address that means the same thing everywhere. A rank
//! gains a coherent view of any span with a checkout, mutates it through a plain local pointer, and
//! publishes the changes back to the collective with a release. A software coherence layer keeps
//! cached copies of remote blocks consistent at these synchronization boundaries, so the model
//! composes with a work-stealing scheduler that migrates tasks between ranks: a lazy release handle
//! travels with the task and is completed by an acquire wherever the task resumes.
//!
//! Memory is distributed at block granularity by a mapper policy chosen per allocation (contiguous
//! block partition, round-robin cyclic stripes, or a reversed block partition for schedulers that
//! drain work from the highest rank). Blocks homed on co-located ranks are attached through shared
//! memory and accessed directly; blocks homed elsewhere are fetched into a fixed-capacity cache
//! that aliases each resident block at its global address.
//!
//! Two backends exist: `shmem` runs one process per rank on a node, and [`LocalFabric`] runs
//! several ranks inside one process, which is also how test harnesses stand up a multi-rank
//! runtime.
//!
//! EXAMPLES
//! --------
//!
//! # Collective allocation, checkout, and release
//! ```no_run
//! use tessera::{Mode, TesseraWorldBuilder};
//!
//! fn main() -> anyhow::Result<()> {
//!     let world = TesseraWorldBuilder::new().build()?;
//!     let p = world.malloc_coll::<u64>(1 << 20);
//!
//!     if world.my_rank() == 0 {
//!         let mut cs = world.checkout(p, 1024, Mode::Write);
//!         for (i, x) in cs.iter_mut().enumerate() {
//!             *x = i as u64;
//!         }
//!         cs.checkin();
//!         world.release();
//!     }
//!     world.barrier();
//!
//!     if world.my_rank() == 1 {
//!         world.acquire();
//!         let cs = world.checkout(p, 1024, Mode::Read);
//!         assert_eq!(cs[42], 42);
//!     }
//!     world.barrier();
//!     world.free_coll(p);
//!     Ok(())
//! }
//! ```
//!
//! # A multi-rank runtime inside one process
//! ```no_run
//! use tessera::{LocalFabric, TesseraWorldBuilder};
//!
//! let fabric = LocalFabric::new(4);
//! let workers: Vec<_> = (0..4)
//!     .map(|pe| {
//!         let fabric = fabric.clone();
//!         std::thread::spawn(move || {
//!             let world = TesseraWorldBuilder::new()
//!                 .with_fabric(&fabric, pe)
//!                 .build()
//!                 .unwrap();
//!             let p = world.malloc_coll::<f64>(1 << 16);
//!             // ... rank program ...
//!             world.barrier();
//!             world.free_coll(p);
//!         })
//!     })
//!     .collect();
//! for w in workers {
//!     w.join().unwrap();
//! }
//! ```

mod block_cache;
mod checkout;
mod coherence;
mod comm;
mod env_var;
mod global_alloc;
mod global_ptr;
mod home;
mod mem_mapper;
mod numa;
pub mod pattern;
mod physical_mem;
mod scheduler;
mod topology;
mod virtual_mem;
mod world;

pub use crate::block_cache::CacheStats;
pub use crate::checkout::{CheckoutSpan, Mode};
pub use crate::coherence::ReleaseHandle;
pub use crate::comm::local::LocalFabric;
pub use crate::comm::CommStats;
pub use crate::env_var::{config, Config, MapperKind};
pub use crate::global_ptr::{GlobalPtr, GlobalSpan, Remote};
pub use crate::mem_mapper::{
    BlockMapper, CyclicMapper, MapperPolicy, MemMapper, NumaSegment, ReverseBlockMapper, Segment,
};
pub use crate::scheduler::{SerialScheduler, TaskScheduler};
pub use crate::world::{TesseraWorld, TesseraWorldBuilder};

pub mod prelude {
    pub use crate::pattern::{fill, parallel_reduce, serial_for_each, serial_for_each_mut, ParallelPolicy};
    pub use crate::{
        GlobalPtr, GlobalSpan, LocalFabric, MapperKind, Mode, ReleaseHandle, SerialScheduler,
        TesseraWorld, TesseraWorldBuilder,
    };
}
