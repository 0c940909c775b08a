use std::sync::atomic::{fence, Ordering};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::block_cache::BlockCache;
use crate::comm::{Comm, CommOps, ReqId, WindowId};

/// A deferred epoch advance for one written block. The owner's counter is
/// advanced only after the writes it covers are in place, which is what lets
/// readers use `entry epoch < owner epoch` as the staleness test.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct EpochBump {
    pub(crate) owner: usize,
    pub(crate) epoch_win: WindowId,
    pub(crate) epoch_slot: usize,
}

/// Writes that have been posted (or still need posting) but not yet released:
/// the in-flight put requests and the epoch advances they will trigger.
#[derive(Default, Debug)]
pub(crate) struct PendingRelease {
    pub(crate) reqs: Vec<ReqId>,
    pub(crate) bumps: Vec<EpochBump>,
}

impl PendingRelease {
    pub(crate) fn new() -> PendingRelease {
        PendingRelease::default()
    }

    fn is_empty(&self) -> bool {
        self.reqs.is_empty() && self.bumps.is_empty()
    }
}

/// Names "all writes locally visible up to the release that produced this
/// handle". Handles are plain data: they can be copied into a migrating task
/// and combined, and a later [`TesseraWorld::acquire_handle`] completes the
/// request set they carry.
///
/// Partial order: a handle from a later release on the same rank covers every
/// write of an earlier one.
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct ReleaseHandle {
    reqs: Vec<ReqId>,
    epoch: u64,
}

impl ReleaseHandle {
    /// Combine two handles; acquiring the result waits on both request sets.
    pub fn merge(&mut self, other: &ReleaseHandle) {
        self.reqs.extend_from_slice(&other.reqs);
        self.epoch = self.epoch.max(other.epoch);
    }

    pub(crate) fn reqs(&self) -> &[ReqId] {
        &self.reqs
    }
}

/// The acquire/release protocol state of one rank.
pub(crate) struct Coherence {
    pending: PendingRelease,
    /// home-mapped blocks written since the last release; their stores are
    /// already visible to co-located peers, only the epoch advance is owed
    home_written: Vec<EpochBump>,
    release_epoch: u64,
}

impl Coherence {
    pub(crate) fn new() -> Coherence {
        Coherence {
            pending: PendingRelease::new(),
            home_written: Vec::new(),
            release_epoch: 0,
        }
    }

    pub(crate) fn pending_mut(&mut self) -> &mut PendingRelease {
        &mut self.pending
    }

    pub(crate) fn note_home_write(&mut self, bump: EpochBump) {
        if !self.home_written.contains(&bump) {
            self.home_written.push(bump);
        }
    }

    /// Synchronous release: post every dirty block, wait for completion, then
    /// advance the epochs of everything written. A release with nothing to
    /// publish performs no transport traffic at all.
    pub(crate) fn release(&mut self, cache: &mut BlockCache, comm: &Comm) {
        cache.flush_dirty(comm, &mut self.pending);
        if self.pending.is_empty() && self.home_written.is_empty() {
            return;
        }
        // writes are globally visible once the transport flush completes
        comm.flush_all();
        self.pending.reqs.clear();
        fence(Ordering::SeqCst);
        self.bump_epochs(comm);
        self.release_epoch += 1;
        trace!(epoch = self.release_epoch, "release");
    }

    /// Lazy release: post the dirty blocks but do not wait; the returned
    /// handle carries the in-flight request set and is completed by a later
    /// acquire. Epochs are advanced once the posts are placed, which the
    /// transport guarantees by the time `put_nb` returns.
    pub(crate) fn release_lazy(&mut self, cache: &mut BlockCache, comm: &Comm) -> ReleaseHandle {
        cache.flush_dirty(comm, &mut self.pending);
        if self.pending.is_empty() && self.home_written.is_empty() {
            return ReleaseHandle {
                reqs: Vec::new(),
                epoch: self.release_epoch,
            };
        }
        let reqs = std::mem::take(&mut self.pending.reqs);
        fence(Ordering::SeqCst);
        self.bump_epochs(comm);
        self.release_epoch += 1;
        trace!(epoch = self.release_epoch, reqs = reqs.len(), "lazy release");
        ReleaseHandle {
            reqs,
            epoch: self.release_epoch,
        }
    }

    fn bump_epochs(&mut self, comm: &Comm) {
        for bump in self.pending.bumps.drain(..).chain(self.home_written.drain(..)) {
            comm.fetch_add_u64(bump.owner, bump.epoch_win, bump.epoch_slot, 1);
        }
    }

    /// Forget deferred epoch advances that target an allocation being freed;
    /// its epoch windows are about to disappear.
    pub(crate) fn purge_allocation(&mut self, alloc_id: usize) {
        self.pending
            .bumps
            .retain(|b| b.epoch_win.alloc_id != alloc_id);
        self.home_written.retain(|b| b.epoch_win.alloc_id != alloc_id);
    }

    /// Acquire: complete any handed-over release, then demote cached blocks
    /// whose owners have released newer content.
    pub(crate) fn acquire(
        &mut self,
        cache: &mut BlockCache,
        comm: &Comm,
        handle: Option<&ReleaseHandle>,
    ) {
        if let Some(h) = handle {
            if !h.reqs().is_empty() {
                comm.wait(h.reqs());
            }
        }
        fence(Ordering::SeqCst);
        cache.invalidate_stale(comm);
    }
}
