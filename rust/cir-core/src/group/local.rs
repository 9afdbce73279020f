// rust/cir-core/src/group/local.rs

//! In-process group whose members are threads.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use super::{BarrierWait, Membership, ProcessGroup};
use crate::error::{Result, RuntimeError};

#[derive(Debug, Default)]
struct BarrierState {
    /// Members waiting in the current generation.
    arrived: u32,
    /// Incremented each time the barrier releases.
    generation: u64,
}

#[derive(Debug)]
struct Shared {
    size: u32,
    wait: BarrierWait,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, BarrierState>> {
        self.state.lock().map_err(|_| poisoned())
    }
}

fn poisoned() -> RuntimeError {
    RuntimeError::group("barrier state poisoned by a panicked member")
}

/// One member of an in-process group.
///
/// Handles are created together by [`LocalGroup::create`]; handle `i` is
/// assigned rank `i`. Each handle is moved to the thread running that
/// member's worker loop.
#[derive(Debug)]
pub struct LocalGroup {
    shared: Arc<Shared>,
    rank: u32,
    membership: Option<Membership>,
    finalized: bool,
}

impl LocalGroup {
    /// Creates `size` handles sharing one barrier.
    pub fn create(size: u32, wait: BarrierWait) -> Vec<LocalGroup> {
        let shared = Arc::new(Shared {
            size,
            wait,
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
        });

        (0..size)
            .map(|rank| LocalGroup {
                shared: Arc::clone(&shared),
                rank,
                membership: None,
                finalized: false,
            })
            .collect()
    }

    fn check_joined(&self) -> Result<Membership> {
        if self.finalized {
            return Err(RuntimeError::group(format!(
                "rank {} already left the group",
                self.rank
            )));
        }
        self.membership
            .ok_or_else(|| RuntimeError::group("group not initialized"))
    }
}

impl ProcessGroup for LocalGroup {
    fn initialize(&mut self) -> Result<Membership> {
        if self.finalized {
            return Err(RuntimeError::group("cannot rejoin a finalized group"));
        }
        let membership = Membership {
            rank: self.rank,
            size: self.shared.size,
        };
        self.membership = Some(membership);
        Ok(membership)
    }

    fn membership(&self) -> Option<Membership> {
        self.membership
    }

    fn barrier(&mut self) -> Result<()> {
        let membership = self.check_joined()?;
        let shared = &self.shared;
        let mut state = shared.lock()?;

        let generation = state.generation;
        state.arrived += 1;

        if state.arrived == shared.size {
            state.arrived = 0;
            state.generation += 1;
            shared.released.notify_all();
            return Ok(());
        }

        match shared.wait {
            BarrierWait::Unbounded => {
                let _state = shared
                    .released
                    .wait_while(state, |s| s.generation == generation)
                    .map_err(|_| poisoned())?;
                Ok(())
            }
            BarrierWait::Bounded(timeout) => {
                let started = Instant::now();
                let (mut state, result) = shared
                    .released
                    .wait_timeout_while(state, timeout, |s| s.generation == generation)
                    .map_err(|_| poisoned())?;

                if result.timed_out() && state.generation == generation {
                    // Withdraw so the count reflects members still waiting.
                    state.arrived -= 1;
                    return Err(RuntimeError::barrier_timeout(
                        membership.rank,
                        started.elapsed(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn finalize(&mut self) -> Result<()> {
        self.check_joined()?;
        self.finalized = true;
        Ok(())
    }
}
