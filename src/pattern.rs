//! Loop and reduction templates over global memory.
//!
//! These drive the runtime the way a task-parallel program does: leaves check
//! out bounded windows, forks hand a lazy release to the child so memory
//! order follows the task wherever it executes, and joins
//! release/acquire before results combine.

use crate::checkout::Mode;
use crate::coherence::ReleaseHandle;
use crate::global_ptr::{GlobalSpan, Remote};
use crate::world::TesseraWorld;

/// Granularity knobs for [`parallel_reduce`].
#[derive(Clone, Copy, Debug)]
pub struct ParallelPolicy {
    /// spans at most this long are accumulated serially in one checkout
    pub cutoff: usize,
}

impl Default for ParallelPolicy {
    fn default() -> Self {
        ParallelPolicy { cutoff: 1024 }
    }
}

/// Visit a span serially, checking out at most `checkout_count` elements at a
/// time so arbitrarily large spans never pin more than a bounded window.
pub fn serial_for_each<T, F>(
    world: &TesseraWorld,
    span: GlobalSpan<T>,
    checkout_count: usize,
    mut f: F,
) where
    T: Remote,
    F: FnMut(&T),
{
    debug_assert!(checkout_count > 0);
    let mut offset = 0;
    while offset < span.len() {
        let n = std::cmp::min(checkout_count, span.len() - offset);
        let cs = world.checkout_span(span.subspan(offset, n), Mode::Read);
        for x in cs.iter() {
            f(x);
        }
        offset += n;
    }
}

/// Mutating variant of [`serial_for_each`].
pub fn serial_for_each_mut<T, F>(
    world: &TesseraWorld,
    span: GlobalSpan<T>,
    checkout_count: usize,
    mut f: F,
) where
    T: Remote,
    F: FnMut(&mut T),
{
    debug_assert!(checkout_count > 0);
    let mut offset = 0;
    while offset < span.len() {
        let n = std::cmp::min(checkout_count, span.len() - offset);
        let mut cs = world.checkout_span(span.subspan(offset, n), Mode::ReadWrite);
        for x in cs.iter_mut() {
            f(x);
        }
        offset += n;
    }
}

/// Fill a span with a value; whole blocks are installed without fetching.
pub fn fill<T>(world: &TesseraWorld, span: GlobalSpan<T>, value: T)
where
    T: Remote,
{
    if span.is_empty() {
        return;
    }
    let mut cs = world.checkout_span(span, Mode::Write);
    for x in cs.iter_mut() {
        *x = value;
    }
}

/// Divide-and-conquer reduction over a global span.
///
/// Every fork hands the child the current lazy-release handle; the child
/// acquires it on entry (wherever it runs) and releases on exit, and the
/// parent releases before joining and acquires before combining. With a
/// migrating scheduler this is exactly the choreography that carries
/// happens-before along the task tree; with the serial scheduler it
/// degenerates to a left-to-right fold.
pub fn parallel_reduce<T, A, Acc, Comb>(
    world: &TesseraWorld,
    policy: &ParallelPolicy,
    span: GlobalSpan<T>,
    identity: A,
    accumulate: Acc,
    combine: Comb,
) -> A
where
    T: Remote,
    A: Clone,
    Acc: Fn(&mut A, &T),
    Comb: Fn(A, A) -> A,
{
    let rh = world.release_lazy();
    let out = reduce_rec(world, policy, span, &rh, &identity, &accumulate, &combine);
    world.acquire();
    out
}

fn reduce_rec<T, A, Acc, Comb>(
    world: &TesseraWorld,
    policy: &ParallelPolicy,
    span: GlobalSpan<T>,
    rh: &ReleaseHandle,
    identity: &A,
    accumulate: &Acc,
    combine: &Comb,
) -> A
where
    T: Remote,
    A: Clone,
    Acc: Fn(&mut A, &T),
    Comb: Fn(A, A) -> A,
{
    world.poll();

    if span.len() <= policy.cutoff {
        let mut acc = identity.clone();
        let cs = world.checkout_span(span, Mode::Read);
        for x in cs.iter() {
            accumulate(&mut acc, x);
        }
        return acc;
    }

    let (left, right) = span.split_at(span.len() / 2);

    let mut left_out = None;
    world.spawn_with_handle(rh, &mut || {
        left_out = Some(reduce_rec(
            world, policy, left, rh, identity, accumulate, combine,
        ));
    });

    let rh_right = world.release_lazy();
    let right_out = reduce_rec(
        world, policy, right, &rh_right, identity, accumulate, combine,
    );

    world.release();
    world.acquire();

    combine(
        left_out.expect("scheduler did not run the forked task"),
        right_out,
    )
}
