use crate::coherence::ReleaseHandle;

/// The contract an external task scheduler provides to the runtime.
///
/// The runtime never owns threads: each process runs its tasks cooperatively
/// on one thread, and a work-stealing scheduler may move a task's
/// continuation to another rank at fork/join points. The runtime only needs
/// two hooks from it:
///
/// * [`poll`](TaskScheduler::poll) is invoked from runtime wait loops (remote
///   transfers, cache-slot pressure) so queued tasks can run. A scheduler
///   that executes a stolen task inside `poll` must bracket it with the
///   supplied release/acquire closures to carry memory order across the
///   steal.
/// * [`spawn`](TaskScheduler::spawn) runs a forked task body. `on_enter`
///   runs on whichever rank executes the body before it starts (acquire),
///   `on_exit` right after it finishes (release).
///
/// Progress must be single-threaded per process: `poll` and `spawn` are only
/// ever called from the rank's own task thread, and callbacks run on it too.
pub trait TaskScheduler: Send + Sync {
    fn poll(
        &self,
        release: &mut dyn FnMut() -> ReleaseHandle,
        acquire: &mut dyn FnMut(ReleaseHandle),
    );

    fn spawn(
        &self,
        on_enter: &mut dyn FnMut(),
        body: &mut dyn FnMut(),
        on_exit: &mut dyn FnMut(),
    );
}

/// Inline execution: every spawned task runs immediately on the spawning
/// rank. The enter/exit callbacks still run, so the acquire/release
/// choreography of the templates is exercised identically to a migrating
/// execution.
#[derive(Debug, Default)]
pub struct SerialScheduler;

impl TaskScheduler for SerialScheduler {
    fn poll(
        &self,
        _release: &mut dyn FnMut() -> ReleaseHandle,
        _acquire: &mut dyn FnMut(ReleaseHandle),
    ) {
    }

    fn spawn(
        &self,
        on_enter: &mut dyn FnMut(),
        body: &mut dyn FnMut(),
        on_exit: &mut dyn FnMut(),
    ) {
        on_enter();
        body();
        on_exit();
    }
}
