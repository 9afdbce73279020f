//! Multi-member checkpoint and recovery scenarios over an in-process group.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cir_core::config::{CheckpointConfig, JobConfig};
use cir_core::group::{BarrierWait, LocalGroup, Membership, ProcessGroup};
use cir_core::storage::{MemoryStorage, StorageBackend, StorageReader, StorageWriter};
use cir_core::{
    CheckpointStore, FaultPlan, IncrementKernel, Kernel, ProcessState, RankResolver, Result,
    RuntimeError, StartKind, WorkerLoop, WorkerReport,
};

const SIZE: u32 = 4;
const N: usize = 10;

fn job() -> JobConfig {
    JobConfig {
        vector_len: N,
        max_iterations: 100,
        checkpoint_interval: 5,
        increment: 0.1,
    }
}

fn store_on(storage: Arc<dyn StorageBackend>) -> CheckpointStore {
    CheckpointStore::new(storage, CheckpointConfig::default(), N)
}

/// Fresh state for `rank` with `steps` kernel applications.
fn expected_vector(rank: u32, steps: u32) -> Vec<f64> {
    let kernel = IncrementKernel::new(job().increment);
    let mut state = ProcessState::fresh(rank, N);
    for i in 0..steps {
        kernel.step(i, &mut state.vector);
    }
    state.vector
}

struct Member<G> {
    group: G,
    storage: Arc<dyn StorageBackend>,
    hint: u32,
}

fn members(storage: &MemoryStorage, wait: BarrierWait, hints: &[u32]) -> Vec<Member<LocalGroup>> {
    LocalGroup::create(hints.len() as u32, wait)
        .into_iter()
        .zip(hints)
        .map(|(group, &hint)| Member {
            group,
            storage: Arc::new(storage.clone()),
            hint,
        })
        .collect()
}

fn run_members<G: ProcessGroup + 'static>(
    members: Vec<Member<G>>,
    job: JobConfig,
    faults: FaultPlan,
) -> Vec<Result<WorkerReport>> {
    let handles: Vec<_> = members
        .into_iter()
        .map(|member| {
            let mut worker = WorkerLoop::new(
                member.group,
                store_on(member.storage),
                RankResolver::new(member.hint),
                job.clone(),
            )
            .with_faults(Arc::new(faults.clone()));
            thread::spawn(move || worker.run())
        })
        .collect();

    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn identity_hints() -> Vec<u32> {
    (0..SIZE).collect()
}

#[test]
fn uninterrupted_run_checkpoints_every_interval() {
    let storage = MemoryStorage::new();
    let results = run_members(
        members(&storage, BarrierWait::Unbounded, &identity_hints()),
        job(),
        FaultPlan::none(),
    );

    let cadence: Vec<u32> = (0..100).step_by(5).collect();
    assert_eq!(cadence.len(), 20);

    for (rank, result) in results.into_iter().enumerate() {
        let report = result.unwrap();
        let rank = rank as u32;

        assert_eq!(report.membership, Membership { rank, size: SIZE });
        assert_eq!(report.start, StartKind::Fresh);
        assert_eq!(report.saved_iterations(), cadence);
        assert_eq!(report.final_state.iteration, 100);
        assert_eq!(report.final_state.vector, expected_vector(rank, 100));
    }

    // Last window was iteration 95, holding the state on entry to it.
    let store = store_on(Arc::new(storage.clone()));
    assert_eq!(store.ranks().unwrap(), identity_hints());
    for rank in 0..SIZE {
        let state = store.load(rank).unwrap();
        assert_eq!(state.iteration, 95);
        assert_eq!(state.owner_rank, rank);
        assert_eq!(state.vector, expected_vector(rank, 95));
    }
}

#[test]
fn fault_leaves_last_coordinated_checkpoint() {
    let storage = MemoryStorage::new();
    let results = run_members(
        members(
            &storage,
            BarrierWait::Bounded(Duration::from_millis(500)),
            &identity_hints(),
        ),
        job(),
        FaultPlan::single(15, 0),
    );

    for (rank, result) in results.into_iter().enumerate() {
        match (rank, result) {
            (0, Err(RuntimeError::InjectedFault { rank, iteration })) => {
                assert_eq!((rank, iteration), (0, 15));
            }
            (r, Err(RuntimeError::BarrierTimeout { rank, .. })) if r != 0 => {
                assert_eq!(rank, r as u32);
            }
            (r, other) => panic!("rank {r}: unexpected outcome {other:?}"),
        }
    }

    let store = store_on(Arc::new(storage.clone()));
    for rank in 0..SIZE {
        let state = store.load(rank).unwrap();
        assert_eq!(state.iteration, 10);
        assert_eq!(state.vector, expected_vector(rank, 10));
    }

    let rank0 = store.load(0).unwrap();
    let fresh = ProcessState::fresh(0, N);
    for (recovered, initial) in rank0.vector.iter().zip(&fresh.vector) {
        assert!((recovered - (initial + 10.0 * 0.1)).abs() < 1e-9);
    }
}

#[test]
fn peers_block_without_a_barrier_bound() {
    let storage = MemoryStorage::new();
    let faults = FaultPlan::single(15, 0);

    let handles: Vec<_> = members(&storage, BarrierWait::Unbounded, &identity_hints())
        .into_iter()
        .map(|member| {
            let mut worker = WorkerLoop::new(
                member.group,
                store_on(member.storage),
                RankResolver::new(member.hint),
                job(),
            )
            .with_faults(Arc::new(faults.clone()));
            thread::spawn(move || worker.run())
        })
        .collect();

    let mut handles = handles.into_iter();
    let faulted = handles.next().unwrap().join().unwrap();
    assert!(faulted.unwrap_err().is_injected_fault());

    thread::sleep(Duration::from_millis(300));
    for peer in handles {
        // Still waiting at the iteration 15 barrier; left blocked on purpose.
        assert!(!peer.is_finished());
    }
}

#[test]
fn relaunch_resumes_and_matches_uninterrupted_run() {
    let reference = MemoryStorage::new();
    let uninterrupted: Vec<WorkerReport> = run_members(
        members(&reference, BarrierWait::Unbounded, &identity_hints()),
        job(),
        FaultPlan::none(),
    )
    .into_iter()
    .map(|r| r.unwrap())
    .collect();

    let storage = MemoryStorage::new();
    let crashed = run_members(
        members(
            &storage,
            BarrierWait::Bounded(Duration::from_millis(500)),
            &identity_hints(),
        ),
        job(),
        FaultPlan::single(15, 0),
    );
    assert!(crashed.iter().all(|r| r.is_err()));

    let resumed = run_members(
        members(&storage, BarrierWait::Unbounded, &identity_hints()),
        job(),
        FaultPlan::none(),
    );

    let cadence: Vec<u32> = (10..100).step_by(5).collect();
    for (rank, result) in resumed.into_iter().enumerate() {
        let report = result.unwrap();
        assert_eq!(report.start, StartKind::Recovered { iteration: 10 });
        assert_eq!(report.saved_iterations(), cadence);
        assert_eq!(report.final_state, uninterrupted[rank].final_state);
    }
}

#[test]
fn mismatched_hints_start_fresh() {
    let storage = MemoryStorage::new();
    let mut short = job();
    short.max_iterations = 20;

    run_members(
        members(&storage, BarrierWait::Unbounded, &identity_hints()),
        short.clone(),
        FaultPlan::none(),
    )
    .into_iter()
    .for_each(|r| {
        r.unwrap();
    });

    // Every member recovers its neighbour's record before joining.
    let rotated: Vec<u32> = (0..SIZE).map(|rank| (rank + 1) % SIZE).collect();
    let results = run_members(
        members(&storage, BarrierWait::Unbounded, &rotated),
        short,
        FaultPlan::none(),
    );

    for (rank, result) in results.into_iter().enumerate() {
        let report = result.unwrap();
        let rank = rank as u32;
        assert_eq!(
            report.start,
            StartKind::Discarded {
                hint: (rank + 1) % SIZE
            }
        );
        assert_eq!(report.saved_iterations(), vec![0, 5, 10, 15]);
        assert_eq!(report.final_state.vector, expected_vector(rank, 20));
    }
}

#[test]
fn records_stay_with_their_owner() {
    let storage = MemoryStorage::new();
    let mut short = job();
    short.max_iterations = 10;

    run_members(
        members(&storage, BarrierWait::Unbounded, &identity_hints()),
        short,
        FaultPlan::none(),
    )
    .into_iter()
    .for_each(|r| {
        r.unwrap();
    });

    let store = store_on(Arc::new(storage.clone()));
    for rank in 0..SIZE {
        assert_eq!(store.file_name(rank), format!("checkpoint_{rank}.bin"));
        assert_eq!(storage.get(&store.path_for(rank)).unwrap().len(), 88);

        let state = store.load(rank).unwrap();
        assert_eq!(state.owner_rank, rank);
        assert_eq!(state.vector, expected_vector(rank, 5));
    }
}

#[test]
fn failed_write_does_not_stop_the_group() {
    let healthy = MemoryStorage::new();
    let broken = MemoryStorage::new();
    broken.set_fail_writes(true);

    let mut group = members(&healthy, BarrierWait::Unbounded, &identity_hints());
    let failing: Arc<dyn StorageBackend> = Arc::new(broken.clone());
    group[2].storage = failing;

    let mut short = job();
    short.max_iterations = 30;
    let results = run_members(group, short, FaultPlan::none());

    for (rank, result) in results.into_iter().enumerate() {
        let report = result.unwrap();
        assert_eq!(report.final_state.iteration, 30);
        assert_eq!(report.checkpoints.len(), 6);
        if rank == 2 {
            assert!(report.saved_iterations().is_empty());
        } else {
            assert_eq!(report.saved_iterations(), vec![0, 5, 10, 15, 20, 25]);
        }
    }
    assert_eq!(broken.completed_writes(), 0);
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Step(u32),
    Barrier,
    Write,
}

type Log = Arc<Mutex<Vec<Event>>>;

fn record(log: &Log, event: Event) {
    log.lock().unwrap().push(event);
}

struct RecordingGroup {
    inner: LocalGroup,
    log: Log,
}

impl ProcessGroup for RecordingGroup {
    fn initialize(&mut self) -> Result<Membership> {
        self.inner.initialize()
    }

    fn membership(&self) -> Option<Membership> {
        self.inner.membership()
    }

    fn barrier(&mut self) -> Result<()> {
        record(&self.log, Event::Barrier);
        self.inner.barrier()
    }

    fn finalize(&mut self) -> Result<()> {
        self.inner.finalize()
    }
}

struct RecordingKernel {
    inner: IncrementKernel,
    log: Log,
}

impl Kernel for RecordingKernel {
    fn step(&self, iteration: u32, vector: &mut [f64]) -> f64 {
        record(&self.log, Event::Step(iteration));
        self.inner.step(iteration, vector)
    }
}

struct RecordingStorage {
    inner: MemoryStorage,
    log: Log,
}

impl StorageBackend for RecordingStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path)
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        self.inner.open_read(path)
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        record(&self.log, Event::Write);
        self.inner.open_write(path)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        self.inner.delete(path)
    }

    fn list(&self, prefix: &Path) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.rename(from, to)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.inner.create_dir_all(path)
    }
}

#[test]
fn every_write_sits_between_paired_barriers() {
    let storage = MemoryStorage::new();
    let mut short = job();
    short.max_iterations = 20;

    let logs: Vec<Log> = (0..SIZE).map(|_| Log::default()).collect();

    let handles: Vec<_> = LocalGroup::create(SIZE, BarrierWait::Unbounded)
        .into_iter()
        .zip(&logs)
        .enumerate()
        .map(|(rank, (group, log))| {
            let group = RecordingGroup {
                inner: group,
                log: Arc::clone(log),
            };
            let store = store_on(Arc::new(RecordingStorage {
                inner: storage.clone(),
                log: Arc::clone(log),
            }));
            let kernel = Arc::new(RecordingKernel {
                inner: IncrementKernel::new(short.increment),
                log: Arc::clone(log),
            });

            let resolver = RankResolver::new(rank as u32);
            let mut worker =
                WorkerLoop::new(group, store, resolver, short.clone()).with_kernel(kernel);
            thread::spawn(move || worker.run())
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let mut expected = Vec::new();
    for iteration in 0..20 {
        expected.push(Event::Step(iteration));
        if iteration % 5 == 0 {
            expected.extend([Event::Barrier, Event::Write, Event::Barrier]);
        }
    }

    for log in &logs {
        assert_eq!(*log.lock().unwrap(), expected);
    }
}
