//! Job launcher: group server plus one worker process per rank.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinSet;

use cir_core::config::{PMI_RANK_ENV, RANK_HINT_ENV};
use cir_core::{
    CheckpointStore, FaultTrigger, GroupServer, LocalStorage, RuntimeConfig, StorageBackend,
};

/// Settings for one launch.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub np: u32,
    pub config: RuntimeConfig,
    pub config_path: Option<PathBuf>,
    pub faults: Vec<FaultTrigger>,
    pub fresh: bool,
}

/// How a worker process ended.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub rank: u32,
    pub status: Option<ExitStatus>,
    pub aborted: bool,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.status.map(|s| s.success()).unwrap_or(false)
    }
}

const FAULT_ENV: &str = "CIR_FAULT";

/// Resolves once the launcher asks the remaining workers to stop.
async fn aborted(abort: &mut watch::Receiver<bool>) {
    // The borrowed value is dropped here so the caller stays `Send`.
    let _ = abort.wait_for(|aborted| *aborted).await;
}

/// Removes every rank's checkpoint before a fresh start.
fn clear_checkpoints(plan: &LaunchPlan) -> Result<(), Box<dyn std::error::Error>> {
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&plan.config.storage)?);
    let store = CheckpointStore::new(
        storage,
        plan.config.checkpoint.clone(),
        plan.config.job.vector_len,
    );

    for rank in store.ranks()? {
        store.remove(rank)?;
        tracing::info!("Removed checkpoint for rank {}", rank);
    }
    Ok(())
}

/// Starts the group and its workers and waits for all of them.
///
/// When one worker exits unsuccessfully the remaining workers are killed,
/// since they would otherwise wait at the next barrier forever.
pub async fn run(plan: LaunchPlan) -> Result<Vec<WorkerExit>, Box<dyn std::error::Error>> {
    if plan.np == 0 {
        return Err("--np must be greater than 0".into());
    }

    if plan.fresh {
        clear_checkpoints(&plan)?;
    }

    let server = GroupServer::bind(&plan.config.group.address, plan.np).await?;
    let addr = server.local_addr()?;
    let server_task = tokio::spawn(server.serve());

    tracing::info!("Launching {} workers against group server {}", plan.np, addr);

    let exe = std::env::current_exe()?;
    let faults = plan
        .faults
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let (abort_tx, abort_rx) = watch::channel(false);
    let mut workers = JoinSet::new();

    for rank in 0..plan.np {
        let mut command = Command::new(&exe);
        command.arg("worker");
        if let Some(path) = &plan.config_path {
            command.arg("--config").arg(path);
        }
        command
            .env(RANK_HINT_ENV, rank.to_string())
            .env_remove(PMI_RANK_ENV)
            .env("CIR_GROUP_ADDRESS", addr.to_string())
            .env("CIR_GROUP_SIZE", plan.np.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if faults.is_empty() {
            command.env_remove(FAULT_ENV);
        } else {
            command.env(FAULT_ENV, &faults);
        }

        let mut child = command.spawn()?;
        let mut abort = abort_rx.clone();

        workers.spawn(async move {
            tokio::select! {
                status = child.wait() => WorkerExit {
                    rank,
                    status: status.ok(),
                    aborted: false,
                },
                _ = aborted(&mut abort) => {
                    let _ = child.kill().await;
                    WorkerExit {
                        rank,
                        status: child.wait().await.ok(),
                        aborted: true,
                    }
                }
            }
        });
    }

    let mut exits = Vec::with_capacity(plan.np as usize);
    while let Some(joined) = workers.join_next().await {
        let exit = joined?;

        match exit.status {
            Some(status) if exit.aborted => {
                tracing::warn!("Worker {} stopped by launcher ({})", exit.rank, status)
            }
            Some(status) if status.success() => {
                tracing::info!("Worker {} finished", exit.rank)
            }
            Some(status) => {
                tracing::error!("Worker {} failed ({}), stopping the job", exit.rank, status);
                let _ = abort_tx.send(true);
            }
            None => {
                tracing::error!("Worker {} could not be waited on", exit.rank);
                let _ = abort_tx.send(true);
            }
        }

        exits.push(exit);
    }

    server_task.abort();
    exits.sort_by_key(|e| e.rank);
    Ok(exits)
}
