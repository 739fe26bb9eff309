//! Backend selection policies.
//!
//! Both policies are pure functions over the service's backend list plus a
//! small cursor the service owns; swapping the policy at runtime just
//! changes which function runs and resets the cursor.

use std::sync::Arc;

use crate::config::BalancePolicy;

use super::backend::Backend;

/// Round-robin cursor: the last backend index used and how many times in a
/// row it has been emitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalancerState {
    /// Index of the backend the cursor rests on.
    pub last_backend: usize,
    /// Consecutive selections of that backend.
    pub last_count: u64,
}

/// Select the next backend under `policy`. Returns `None` when the backend
/// list is empty.
///
/// Health is intentionally not consulted here: a down backend simply fails
/// the dial, which is how unavailability surfaces to the client.
#[must_use]
pub fn next_backend(
    policy: BalancePolicy,
    backends: &[Arc<Backend>],
    state: &mut BalancerState,
) -> Option<Arc<Backend>> {
    match policy {
        BalancePolicy::RoundRobin => round_robin(backends, state),
        BalancePolicy::LeastConn => least_conn(backends, state),
    }
}

/// Weighted round-robin: emit the cursor's backend `weight` times in a row
/// before advancing.
fn round_robin(backends: &[Arc<Backend>], state: &mut BalancerState) -> Option<Arc<Backend>> {
    if backends.is_empty() {
        return None;
    }

    // The cursor may be past the end if a backend was removed since the
    // last selection.
    if state.last_backend >= backends.len() {
        state.last_backend = 0;
        state.last_count = 0;
    }

    let backend = Arc::clone(&backends[state.last_backend]);
    state.last_count += 1;
    if state.last_count >= backend.weight() {
        state.last_backend = (state.last_backend + 1) % backends.len();
        state.last_count = 0;
    }

    Some(backend)
}

/// Least-connected: scan for the minimum `active`, favoring later-inserted
/// backends on ties so a fresh backend drains load first.
fn least_conn(backends: &[Arc<Backend>], state: &mut BalancerState) -> Option<Arc<Backend>> {
    if backends.is_empty() {
        return None;
    }

    let mut least = i64::MAX;
    let mut chosen = 0;
    for (i, backend) in backends.iter().enumerate() {
        if backend.active() <= least {
            least = backend.active();
            chosen = i;
        }
    }

    state.last_backend = chosen;
    Some(Arc::clone(&backends[chosen]))
}
