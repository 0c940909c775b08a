use std::ops::{Deref, DerefMut};

use crate::coherence::EpochBump;
use crate::global_ptr::Remote;
use crate::world::TesseraWorld;

/// Access mode of a checkout.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// The span must hold the latest released data; stores are not allowed.
    Read,
    /// The caller promises to overwrite the span; blocks it fully covers are
    /// installed without fetching.
    Write,
    /// Latest data, and the whole span counts as modified on check-in.
    ReadWrite,
    /// Pin nothing: the span only names addresses, for iterators that will
    /// check out sub-ranges themselves.
    NoAccess,
}

impl Mode {
    pub(crate) fn fetches(self) -> bool {
        matches!(self, Mode::Read | Mode::ReadWrite)
    }

    pub(crate) fn writes(self) -> bool {
        matches!(self, Mode::Write | Mode::ReadWrite)
    }
}

/// One block pinned (or home-located) by a checkout, with the byte range of
/// the span that falls inside it.
pub(crate) enum TouchedBlock {
    Cached {
        idx: usize,
        /// span overlap relative to the block start, for dirty marking
        begin: usize,
        end: usize,
    },
    Home {
        bump: EpochBump,
    },
}

/// A coherent local window onto a span of global memory.
///
/// Produced by [`TesseraWorld::checkout`]; the pointed-to range is directly
/// readable/writable (per [`Mode`]) until the span checks in. Check-in
/// happens on drop, on every exit path; the span is move-only so it can
/// happen only once. No fork/join point may sit between a checkout and its
/// check-in: the task must check in before it can migrate.
pub struct CheckoutSpan<'a, T: Remote> {
    world: &'a TesseraWorld,
    ptr: *mut T,
    len: usize,
    mode: Mode,
    blocks: Vec<TouchedBlock>,
}

impl<'a, T: Remote> CheckoutSpan<'a, T> {
    pub(crate) fn new(
        world: &'a TesseraWorld,
        ptr: *mut T,
        len: usize,
        mode: Mode,
        blocks: Vec<TouchedBlock>,
    ) -> Self {
        CheckoutSpan {
            world,
            ptr,
            len,
            mode,
            blocks,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The checked-out pointer. Stable until check-in; dereferenceable except
    /// in [`Mode::NoAccess`].
    pub fn as_ptr(&self) -> *mut T {
        self.ptr
    }

    pub fn as_slice(&self) -> &[T] {
        debug_assert!(self.mode != Mode::NoAccess, "no_access spans pin no memory");
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        debug_assert!(self.mode.writes(), "span was not checked out for writing");
        if self.len == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Check in explicitly (equivalent to dropping the span).
    pub fn checkin(self) {}
}

impl<T: Remote> Deref for CheckoutSpan<'_, T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Remote> DerefMut for CheckoutSpan<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T: Remote> Drop for CheckoutSpan<'_, T> {
    fn drop(&mut self) {
        let blocks = std::mem::take(&mut self.blocks);
        self.world.checkin_blocks(self.mode, blocks);
    }
}
