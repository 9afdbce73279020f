// rust/cir-core/src/resolver.rs

//! Identity resolution and early recovery.
//!
//! A worker learns its authoritative rank only after joining the group, yet
//! recovery has to start before that. The [`RankResolver`] bridges the gap:
//! it loads the checkpoint of the *hinted* rank up front, and
//! [`RankResolver::reconcile`] keeps that state only when the group later
//! confirms the same rank.

use crate::checkpoint::CheckpointStore;
use crate::state::ProcessState;

/// Outcome of the pre-join recovery attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Rank the worker expects to be assigned.
    pub hint: u32,
    /// State loaded from the hinted rank's checkpoint, if any.
    pub recovered: Option<ProcessState>,
}

/// How a worker's starting state was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    /// Resumed from the worker's own checkpoint at `iteration`.
    Recovered { iteration: u32 },
    /// No checkpoint was found; started from the fresh formula.
    Fresh,
    /// A checkpoint was loaded for rank `hint` but could not be used by
    /// the authoritative rank, so the worker started fresh.
    Discarded { hint: u32 },
}

impl StartKind {
    pub fn is_recovered(&self) -> bool {
        matches!(self, StartKind::Recovered { .. })
    }
}

/// Resolves a worker's provisional identity before it joins the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankResolver {
    hint: u32,
}

impl RankResolver {
    pub fn new(hint: u32) -> Self {
        Self { hint }
    }

    /// Uses the configured hint, or rank 0 when none was provided.
    pub fn from_hint(hint: Option<u32>) -> Self {
        Self::new(hint.unwrap_or(0))
    }

    pub fn hint(&self) -> u32 {
        self.hint
    }

    /// Attempts recovery for the hinted rank. Never touches the group.
    pub fn resolve(&self, store: &CheckpointStore) -> Resolution {
        let recovered = store.load(self.hint);

        match &recovered {
            Some(state) => tracing::info!(
                "Rank hint {}: found checkpoint at iteration {}",
                self.hint,
                state.iteration
            ),
            None => tracing::info!("Rank hint {}: no checkpoint found", self.hint),
        }

        Resolution {
            hint: self.hint,
            recovered,
        }
    }

    /// Chooses the starting state once the authoritative rank is known.
    ///
    /// The recovered state is kept only if it belongs to `rank` and has the
    /// configured vector length; otherwise it is discarded with a warning
    /// and fresh state is built for `rank`.
    pub fn reconcile(
        resolution: Resolution,
        rank: u32,
        vector_len: usize,
    ) -> (ProcessState, StartKind) {
        match resolution.recovered {
            Some(state) if state.owner_rank == rank && state.len() == vector_len => {
                let iteration = state.iteration;
                tracing::info!("Rank {} recovered from iteration {}", rank, iteration);
                (state, StartKind::Recovered { iteration })
            }
            Some(state) => {
                tracing::warn!(
                    "Discarding checkpoint recovered for rank hint {} (owner {}, {} elements): \
                     authoritative rank is {}, starting fresh",
                    resolution.hint,
                    state.owner_rank,
                    state.len(),
                    rank
                );
                (
                    ProcessState::fresh(rank, vector_len),
                    StartKind::Discarded {
                        hint: resolution.hint,
                    },
                )
            }
            None => (ProcessState::fresh(rank, vector_len), StartKind::Fresh),
        }
    }
}
