// rust/cir-core/src/worker.rs

//! The per-process worker loop.
//!
//! This module ties together the components a group member needs: the
//! rank resolver, the process group, the checkpoint store, the numeric
//! kernel and the fault injector.
//!
//! # Example
//!
//! ```no_run
//! use cir_core::config::RuntimeConfig;
//! use cir_core::group::{BarrierWait, LocalGroup};
//! use cir_core::WorkerLoop;
//!
//! let config = RuntimeConfig::default();
//! let group = LocalGroup::create(1, BarrierWait::Unbounded).remove(0);
//!
//! let mut worker = WorkerLoop::from_config(&config, group).unwrap();
//! let report = worker.run().unwrap();
//! println!(
//!     "rank {} finished at iteration {}",
//!     report.membership.rank, report.final_state.iteration
//! );
//! ```

use std::sync::Arc;

use crate::checkpoint::CheckpointStore;
use crate::config::{JobConfig, RuntimeConfig};
use crate::error::{Result, RuntimeError};
use crate::fault::{FaultInjector, FaultPlan};
use crate::group::{Membership, ProcessGroup};
use crate::kernel::{IncrementKernel, Kernel};
use crate::resolver::{RankResolver, StartKind};
use crate::state::ProcessState;
use crate::storage::{LocalStorage, StorageBackend};

/// Where the worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Not started yet.
    Idle,
    /// Loading the hinted rank's checkpoint.
    Resolving,
    /// Joining the group.
    Joining,
    /// Running compute iterations.
    Iterating,
    /// Between the two barriers of a coordinated checkpoint.
    CheckpointWindow,
    /// Stopped, normally or by a fault or group error.
    Terminated,
}

/// Outcome of one coordinated checkpoint window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointEvent {
    /// Iteration whose window this was; also the iteration stored.
    pub iteration: u32,
    /// Whether the record reached storage.
    pub saved: bool,
}

/// Summary of a worker run that reached its iteration bound.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub membership: Membership,
    pub start: StartKind,
    pub final_state: ProcessState,
    pub checkpoints: Vec<CheckpointEvent>,
}

impl WorkerReport {
    /// Iterations whose checkpoint was written successfully.
    pub fn saved_iterations(&self) -> Vec<u32> {
        self.checkpoints
            .iter()
            .filter(|c| c.saved)
            .map(|c| c.iteration)
            .collect()
    }
}

/// Drives one group member from recovery to completion.
///
/// Each iteration applies the kernel, consults the fault injector, and on
/// checkpoint iterations runs the window `barrier → save → barrier`. The
/// record written in the window of iteration `k` is the state as it was on
/// entry to iteration `k`, so resuming from it replays iteration `k` once.
///
/// A save failure is logged and the window continues; the closing barrier
/// is always entered so every member leaves the window together.
pub struct WorkerLoop<G: ProcessGroup> {
    group: G,
    store: CheckpointStore,
    resolver: RankResolver,
    kernel: Arc<dyn Kernel>,
    faults: Arc<dyn FaultInjector>,
    job: JobConfig,
    phase: WorkerPhase,
}

impl<G: ProcessGroup> WorkerLoop<G> {
    /// Creates a worker with the increment kernel from `job` and no faults.
    pub fn new(group: G, store: CheckpointStore, resolver: RankResolver, job: JobConfig) -> Self {
        Self {
            group,
            store,
            resolver,
            kernel: Arc::new(IncrementKernel::new(job.increment)),
            faults: Arc::new(FaultPlan::none()),
            job,
            phase: WorkerPhase::Idle,
        }
    }

    /// Builds a worker backed by local storage from a full configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the storage base
    /// path cannot be created.
    pub fn from_config(config: &RuntimeConfig, group: G) -> Result<Self> {
        config.validate()?;

        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage)?);
        let store = CheckpointStore::new(storage, config.checkpoint.clone(), config.job.vector_len);
        let resolver = RankResolver::from_hint(config.group.rank_hint);

        Ok(Self::new(group, store, resolver, config.job.clone())
            .with_faults(Arc::new(FaultPlan::from_config(&config.fault))))
    }

    #[must_use]
    pub fn with_kernel(mut self, kernel: Arc<dyn Kernel>) -> Self {
        self.kernel = kernel;
        self
    }

    #[must_use]
    pub fn with_faults(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Runs the worker to its iteration bound.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InjectedFault`] when the fault injector fires,
    /// in which case the group is left without finalizing. Group errors,
    /// including bounded barrier timeouts, are returned as they occur.
    pub fn run(&mut self) -> Result<WorkerReport> {
        let result = self.execute();
        self.phase = WorkerPhase::Terminated;
        result
    }

    fn execute(&mut self) -> Result<WorkerReport> {
        self.phase = WorkerPhase::Resolving;
        let resolution = self.resolver.resolve(&self.store);

        self.phase = WorkerPhase::Joining;
        let membership = self.group.initialize()?;
        let rank = membership.rank;
        let (mut state, start) =
            RankResolver::reconcile(resolution, rank, self.job.vector_len);

        tracing::info!(
            "Rank {} of {} starting at iteration {} ({:?})",
            rank,
            membership.size,
            state.iteration,
            start
        );

        self.phase = WorkerPhase::Iterating;
        let mut checkpoints = Vec::new();

        while state.iteration < self.job.max_iterations {
            let iteration = state.iteration;
            let entry = (iteration % self.job.checkpoint_interval == 0).then(|| state.clone());

            let sum = self.kernel.step(iteration, &mut state.vector);
            tracing::info!("Rank {}, iteration {}: sum = {:.6}", rank, iteration, sum);

            if self.faults.should_fail(iteration, rank) {
                tracing::error!("Rank {} hit injected fault at iteration {}", rank, iteration);
                return Err(RuntimeError::injected_fault(rank, iteration));
            }

            if let Some(snapshot) = entry {
                self.phase = WorkerPhase::CheckpointWindow;
                checkpoints.push(self.checkpoint_window(&snapshot)?);
                self.phase = WorkerPhase::Iterating;
            }

            state.iteration += 1;
        }

        self.group.finalize()?;
        tracing::info!(
            "Rank {} finished {} iterations, final sum = {:.6}",
            rank,
            state.iteration,
            state.sum()
        );

        Ok(WorkerReport {
            membership,
            start,
            final_state: state,
            checkpoints,
        })
    }

    fn checkpoint_window(&mut self, snapshot: &ProcessState) -> Result<CheckpointEvent> {
        self.group.barrier()?;

        let saved = match self.store.save(snapshot) {
            Ok(path) => {
                tracing::info!(
                    "Rank {} checkpointed iteration {} to {}",
                    snapshot.owner_rank,
                    snapshot.iteration,
                    path.display()
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    "Rank {} failed to checkpoint iteration {}, continuing: {}",
                    snapshot.owner_rank,
                    snapshot.iteration,
                    e
                );
                false
            }
        };

        self.group.barrier()?;

        Ok(CheckpointEvent {
            iteration: snapshot.iteration,
            saved,
        })
    }
}
