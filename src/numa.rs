//! Memory placement shim over the `mbind` syscall.
//!
//! Topology discovery is out of scope; callers identify nodes by the
//! intra-node sub-owner index produced by the memory mapper. Placement
//! failures are not fatal: the mapping stays usable, just not NUMA-local.

use tracing::warn;

pub(crate) const MAX_NODES: usize = 64;

#[cfg(target_os = "linux")]
fn mbind(addr: usize, len: usize, mode: libc::c_int, nodemask: u64) {
    let res = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr,
            len,
            mode,
            &nodemask as *const u64,
            MAX_NODES + 1,
            0,
        )
    };
    if res < 0 {
        warn!(
            addr,
            len,
            error = %std::io::Error::last_os_error(),
            "mbind failed, memory may not be NUMA-local"
        );
    }
}

/// Bind `[addr, addr + len)` to one node.
#[cfg(target_os = "linux")]
pub(crate) fn bind(addr: usize, len: usize, node: usize) {
    debug_assert!(node < MAX_NODES);
    mbind(addr, len, libc::MPOL_BIND, 1u64 << node);
}

/// Interleave `[addr, addr + len)` across the first `n_nodes` nodes.
#[cfg(target_os = "linux")]
pub(crate) fn interleave(addr: usize, len: usize, n_nodes: usize) {
    debug_assert!(n_nodes >= 1 && n_nodes <= MAX_NODES);
    let mask = if n_nodes == MAX_NODES {
        u64::MAX
    } else {
        (1u64 << n_nodes) - 1
    };
    mbind(addr, len, libc::MPOL_INTERLEAVE, mask);
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn bind(_addr: usize, _len: usize, _node: usize) {}

#[cfg(not(target_os = "linux"))]
pub(crate) fn interleave(_addr: usize, _len: usize, _n_nodes: usize) {}
